//! Output sink: ordered result lines to a file or stdout.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use log::debug;

use crate::error::PipelineError;

const DEFAULT_FLUSH_INTERVAL: usize = 1024;

/// Buffered, order-preserving line writer. Flushes every
/// `flush_interval` lines and on close, which bounds unflushed data without
/// paying a syscall per line.
pub struct OutputSink {
    stream: BufWriter<Box<dyn Write + Send>>,
    flush_interval: usize,
    unflushed: usize,
    lines_written: usize,
}

impl OutputSink {
    /// Accepts one result line (without its separator) and writes it
    /// followed by a newline. Blocking here is what backpressures the
    /// drainer, and through the pipes, the whole pipeline.
    pub fn write_line(&mut self, line: &[u8]) -> Result<(), PipelineError> {
        self.stream
            .write_all(line)
            .and_then(|_| self.stream.write_all(b"\n"))
            .map_err(to_sink_error)?;
        self.lines_written += 1;
        self.unflushed += 1;
        if self.unflushed >= self.flush_interval {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), PipelineError> {
        self.stream.flush().map_err(to_sink_error)?;
        self.unflushed = 0;
        Ok(())
    }

    pub fn lines_written(&self) -> usize {
        self.lines_written
    }

    /// Final flush at end of run.
    pub fn close(&mut self) -> Result<(), PipelineError> {
        debug!("closing sink after {} lines", self.lines_written);
        self.flush()
    }
}

fn to_sink_error(err: io::Error) -> PipelineError {
    PipelineError::SinkWrite(err.to_string())
}

/// Builder for [`OutputSink`]. No path means stdout.
#[derive(Default)]
pub struct OutputSinkBuilder {
    path: Option<PathBuf>,
    flush_interval: Option<usize>,
}

impl OutputSinkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: Option<PathBuf>) -> Self {
        self.path = path;
        self
    }

    pub fn flush_interval(mut self, lines: usize) -> Self {
        self.flush_interval = Some(lines.max(1));
        self
    }

    pub fn build(self) -> Result<OutputSink, PipelineError> {
        let stream: Box<dyn Write + Send> = match &self.path {
            Some(path) => {
                let file = File::create(path).map_err(|err| {
                    PipelineError::SinkWrite(format!("{}: {}", path.display(), err))
                })?;
                debug!("sink opened at {}", path.display());
                Box::new(file)
            }
            None => Box::new(io::stdout()),
        };
        Ok(OutputSink {
            stream: BufWriter::new(stream),
            flush_interval: self.flush_interval.unwrap_or(DEFAULT_FLUSH_INTERVAL),
            unflushed: 0,
            lines_written: 0,
        })
    }

    /// Test seam: build over any writer.
    pub fn from_writer(self, writer: impl Write + Send + 'static) -> OutputSink {
        OutputSink {
            stream: BufWriter::new(Box::new(writer)),
            flush_interval: self.flush_interval.unwrap_or(DEFAULT_FLUSH_INTERVAL),
            unflushed: 0,
            lines_written: 0,
        }
    }
}
