use thiserror::Error;

/// Pipeline error.
///
/// Each variant maps to one pipeline stage, carries the diagnostics that
/// stage can cheaply provide (byte offsets, element index, exit status,
/// captured stderr), and owns a distinct process exit code so callers can
/// tell the failure categories apart without parsing messages.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The compressed byte source could not be opened or read. Transient
    /// network causes are retried by the source itself before this surfaces.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The compressed data violates the bzip2 block structure. `offset` is
    /// the number of compressed bytes consumed when the violation was hit.
    #[error("corrupt compressed stream at compressed byte {offset}: {detail}")]
    CorruptStream { offset: u64, detail: String },

    /// The decompressed document is not a well-formed top-level JSON array.
    /// Includes truncated input. `offset` is the decompressed byte offset,
    /// `index` the number of complete elements emitted before the failure.
    #[error("malformed dump array at byte {offset}, after element {index}: {detail}")]
    MalformedArray {
        offset: u64,
        index: usize,
        detail: String,
    },

    /// The filter subprocess exited non-zero, or closed one of its pipes
    /// before consuming all input. `stderr` is whatever the child wrote to
    /// its error channel before exiting.
    #[error("filter process failed (exit {}): {stderr}", exit_code_label(.exit_code))]
    FilterProcess {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The output destination became unwritable.
    #[error("sink write failed: {0}")]
    SinkWrite(String),
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "killed by signal".to_string(),
    }
}

impl PipelineError {
    /// Name of the pipeline stage this error belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable(_) => "source",
            PipelineError::CorruptStream { .. } => "decompressor",
            PipelineError::MalformedArray { .. } => "splitter",
            PipelineError::FilterProcess { .. } => "filter",
            PipelineError::SinkWrite(_) => "sink",
        }
    }

    /// Distinct non-zero process exit status per error category.
    /// 1 is left to usage errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::SourceUnavailable(_) => 2,
            PipelineError::CorruptStream { .. } => 3,
            PipelineError::MalformedArray { .. } => 4,
            PipelineError::FilterProcess { .. } => 5,
            PipelineError::SinkWrite(_) => 6,
        }
    }
}
