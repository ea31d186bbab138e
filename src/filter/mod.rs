//! The filter stage seam.
//!
//! The external filter engine is a black box that turns ordered input lines
//! into ordered output lines. Anything satisfying [`LineTransducer`] can
//! stand in for it, which is how tests substitute an in-process stub for a
//! real jq subprocess.

use crate::{core::cancel::CancellationToken, error::PipelineError};

pub mod subprocess;

pub use subprocess::SubprocessTransducer;

/// Pull of the next input line (one serialized element, no trailing
/// newline). `Ok(None)` signals end of input.
pub type LinePull<'a> = &'a mut (dyn FnMut() -> Result<Option<Vec<u8>>, PipelineError> + Send);

/// Push of one complete output line (no trailing newline). Blocking here is
/// the backpressure path: a slow sink fills the subprocess's output pipe,
/// which throttles the subprocess, which throttles the feeder.
pub type LinePush<'a> = &'a mut dyn FnMut(&[u8]) -> Result<(), PipelineError>;

/// Counts reported by a completed transduction.
#[derive(Debug, Default)]
pub struct TransducerReport {
    /// Input lines fed to the filter.
    pub lines_in: usize,
    /// Output lines forwarded downstream.
    pub lines_out: usize,
}

/// An ordered-lines to ordered-lines transformation.
pub trait LineTransducer {
    fn transduce(
        &mut self,
        input: LinePull<'_>,
        output: LinePush<'_>,
        cancel: &CancellationToken,
    ) -> Result<TransducerReport, PipelineError>;
}

/// Output format the caller declared for the filter's result stream. Only a
/// hint: it selects the filter program's output flags, the pipeline itself
/// treats all output as opaque lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Minified JSON, one value per line (NDJSON).
    Json,
    /// Raw text rows, e.g. CSV produced by `@csv`.
    Csv,
    /// Arbitrary raw text.
    Text,
}

/// The argv of the external filter program.
#[derive(Debug, Clone)]
pub struct FilterCommand {
    program: String,
    args: Vec<String>,
}

impl FilterCommand {
    /// An arbitrary line-oriented filter program.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The default engine: jq applied to each entity. The filter expression
    /// itself is opaque to this crate.
    pub fn jq(expression: &str, format: OutputFormat) -> Self {
        let mode = match format {
            OutputFormat::Json => "-c",
            OutputFormat::Csv | OutputFormat::Text => "-r",
        };
        Self {
            program: "jq".to_string(),
            args: vec![mode.to_string(), expression.to_string()],
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[cfg(test)]
mod tests {
    use super::{FilterCommand, OutputFormat};

    #[test]
    fn jq_command_reflects_the_format_hint() {
        let json = FilterCommand::jq(".id", OutputFormat::Json);
        assert_eq!(json.program(), "jq");
        assert_eq!(json.args(), ["-c", ".id"]);

        let csv = FilterCommand::jq("[.id] | @csv", OutputFormat::Csv);
        assert_eq!(csv.args(), ["-r", "[.id] | @csv"]);

        let text = FilterCommand::jq(".labels.en.value", OutputFormat::Text);
        assert_eq!(text.args(), ["-r", ".labels.en.value"]);
    }
}
