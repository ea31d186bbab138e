use std::time::{Duration, Instant};

use log::{debug, info};
use uuid::Uuid;

use crate::{
    core::{
        cancel::CancellationToken,
        stage::{ChunkRead, IoChunkReader},
    },
    decompress::Decompressor,
    error::PipelineError,
    filter::LineTransducer,
    sink::OutputSink,
    source::ByteSource,
    splitter::{ElementSplitterBuilder, DEFAULT_CHUNK_CAPACITY},
};

/// How the source bytes are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Bzip2,
    /// Already-decompressed input, fed straight to the splitter.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// The run was cancelled on request; not a failure.
    Cancelled,
}

/// Outcome of a completed (or cancelled) run.
#[derive(Debug)]
pub struct RunExecution {
    pub id: Uuid,
    pub status: RunStatus,
    /// Elements pulled from the dump and fed to the filter.
    pub elements_read: usize,
    /// Result lines forwarded to the sink.
    pub lines_written: usize,
    pub start: Instant,
    pub end: Instant,
    pub duration: Duration,
}

/// The assembled pipeline: Source → Decompressor → Splitter → Filter →
/// Sink, one linear thread of control for decompression and splitting,
/// with the filter's feeder/drainer concurrency hidden behind the
/// transducer. Every stage handle is owned here and released by drop on
/// every exit path.
pub struct Pipeline<T> {
    id: Uuid,
    source: Box<dyn ByteSource>,
    compression: Compression,
    transducer: T,
    sink: OutputSink,
    cancel: CancellationToken,
    chunk_capacity: usize,
}

impl<T: LineTransducer> Pipeline<T> {
    pub fn run(mut self) -> Result<RunExecution, PipelineError> {
        let start = Instant::now();
        info!("start of run {}", self.id);

        let reader = self.source.open()?;
        let chunks: Box<dyn ChunkRead + Send> = match self.compression {
            Compression::Bzip2 => Box::new(Decompressor::new(reader)),
            Compression::None => Box::new(IoChunkReader::new(reader)),
        };
        let mut splitter = ElementSplitterBuilder::new()
            .capacity(self.chunk_capacity)
            .from_chunk_reader(chunks);

        let report = {
            let sink = &mut self.sink;
            let mut pull = || splitter.read();
            let mut push = |line: &[u8]| sink.write_line(line);
            self.transducer.transduce(&mut pull, &mut push, &self.cancel)?
        };

        self.sink.close()?;

        let status = if self.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Success
        };
        debug!(
            "splitter consumed {} decompressed bytes",
            splitter.bytes_consumed()
        );
        info!(
            "end of run {}: {:?}, {} elements in, {} lines out",
            self.id, status, report.lines_in, report.lines_out
        );

        Ok(RunExecution {
            id: self.id,
            status,
            elements_read: report.lines_in,
            lines_written: report.lines_out,
            start,
            end: Instant::now(),
            duration: start.elapsed(),
        })
    }
}

/// Builder wiring up the stages. The CLI layer validates its inputs before
/// constructing the pipeline; a builder missing a stage is a programming
/// error.
pub struct PipelineBuilder<T> {
    source: Option<Box<dyn ByteSource>>,
    compression: Compression,
    transducer: Option<T>,
    sink: Option<OutputSink>,
    cancel: CancellationToken,
    chunk_capacity: usize,
}

impl<T: LineTransducer> PipelineBuilder<T> {
    pub fn new() -> Self {
        Self {
            source: None,
            compression: Compression::Bzip2,
            transducer: None,
            sink: None,
            cancel: CancellationToken::new(),
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
        }
    }

    pub fn source(mut self, source: impl ByteSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn transducer(mut self, transducer: T) -> Self {
        self.transducer = Some(transducer);
        self
    }

    pub fn sink(mut self, sink: OutputSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Cancellation is threaded explicitly so concurrent runs stay
    /// independent.
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn chunk_capacity(mut self, capacity: usize) -> Self {
        self.chunk_capacity = capacity;
        self
    }

    pub fn build(self) -> Pipeline<T> {
        Pipeline {
            id: Uuid::new_v4(),
            source: self.source.expect("pipeline requires a source"),
            compression: self.compression,
            transducer: self.transducer.expect("pipeline requires a transducer"),
            sink: self.sink.expect("pipeline requires a sink"),
            cancel: self.cancel,
            chunk_capacity: self.chunk_capacity,
        }
    }
}

impl<T: LineTransducer> Default for PipelineBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}
