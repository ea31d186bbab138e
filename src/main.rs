use std::{path::Path, process::ExitCode};

use clap::{Parser, ValueEnum};
use log::{debug, info};

use wikidump_filter::{
    core::{
        cancel::CancellationToken,
        pipeline::{Compression, PipelineBuilder},
    },
    filter::{FilterCommand, OutputFormat, SubprocessTransducer},
    sink::OutputSinkBuilder,
    source::{download::DEFAULT_DUMP_URL, ByteSource, DownloadSource, FileSource},
    PipelineError,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Download and filter Wikidata JSON dumps")]
struct Cli {
    /// Download the dump (from --input if it is a URL, otherwise the
    /// standard latest-all dump)
    #[arg(short = 'd', long = "download")]
    download: bool,

    /// Source dump: a local file path, or an http(s) URL
    #[arg(short = 'i', long = "input")]
    input: Option<String>,

    /// Filename to output filtered entities (default is stdout)
    #[arg(short = 'o', long = "output")]
    output: Option<std::path::PathBuf>,

    /// jq filter, see https://jqlang.org for usage. Applied to each entity
    #[arg(short = 'j', long = "jq-filter", default_value = ".")]
    jq_filter: String,

    /// Declared output format of the filter
    #[arg(long = "format", value_enum, default_value = "json")]
    format: FormatArg,

    /// Resume an interrupted download from its .part file
    #[arg(short = 'r', long = "resume")]
    resume: bool,

    /// Directory partial downloads are written to
    #[arg(long = "download-dir", default_value = ".")]
    download_dir: std::path::PathBuf,

    /// Force overwriting the output file
    #[arg(short = 'f', long = "force")]
    force: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Json,
    Csv,
    Text,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Json => OutputFormat::Json,
            FormatArg::Csv => OutputFormat::Csv,
            FormatArg::Text => OutputFormat::Text,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    // clap's own exit status for usage errors is 2, which would collide
    // with the source error category; usage problems exit 1 instead
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                // --help and --version land here
                ExitCode::SUCCESS
            };
        }
    };
    debug!("{args:?}");

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("wikidump-filter: {} stage failed: {err}", err.stage());
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run(args: Cli) -> Result<ExitCode, PipelineError> {
    if let Some(path) = &args.output {
        if path.exists() && !args.force {
            eprintln!(
                "wikidump-filter: {} already exists, pass --force to overwrite",
                path.display()
            );
            return Ok(ExitCode::FAILURE);
        }
    }

    let is_url = args
        .input
        .as_deref()
        .is_some_and(|i| i.starts_with("http://") || i.starts_with("https://"));

    let cancel = CancellationToken::new();

    let (source, compression): (Box<dyn ByteSource>, Compression) = if args.download || is_url {
        let url = match args.input.as_deref() {
            Some(input) if is_url => input.to_string(),
            _ => DEFAULT_DUMP_URL.to_string(),
        };
        let source = DownloadSource::builder(url)
            .target_dir(&args.download_dir)
            .resume(args.resume)
            .cancellation(cancel.clone())
            .build();
        (Box::new(source), Compression::Bzip2)
    } else {
        let Some(input) = args.input.as_deref() else {
            eprintln!("wikidump-filter: either --input or --download is required");
            return Ok(ExitCode::FAILURE);
        };
        let compression = match Path::new(input).extension() {
            Some(ext) if ext == "bz2" => Compression::Bzip2,
            _ => Compression::None,
        };
        (Box::new(FileSource::new(input)), compression)
    };

    let command = FilterCommand::jq(&args.jq_filter, args.format.into());
    let sink = OutputSinkBuilder::new().path(args.output).build()?;

    let execution = PipelineBuilder::new()
        .source(source)
        .compression(compression)
        .transducer(SubprocessTransducer::new(command))
        .sink(sink)
        .cancellation(cancel)
        .build()
        .run()?;

    info!(
        "filtered {} entities into {} lines in {:?}",
        execution.elements_read, execution.lines_written, execution.duration
    );
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn usage_errors_go_to_stderr_and_help_does_not() {
        // usage problems must exit 1 (clap's default of 2 would collide
        // with the source error category)
        let err = Cli::try_parse_from(["wikidump-filter", "--no-such-flag"])
            .expect_err("unknown flag is a usage error");
        assert!(err.use_stderr());

        let help = Cli::try_parse_from(["wikidump-filter", "--help"])
            .expect_err("help is reported through the error path");
        assert!(!help.use_stderr());
    }

    #[test]
    fn defaults_cover_filter_and_format() {
        let args = Cli::try_parse_from(["wikidump-filter", "-i", "dump.json.bz2"]).unwrap();
        assert_eq!(args.jq_filter, ".");
        assert!(matches!(args.format, super::FormatArg::Json));
        assert!(!args.force);
    }
}
