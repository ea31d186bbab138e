//! Compressed byte sources.
//!
//! A source hands the pipeline a sequential stream of compressed bytes and
//! knows nothing about decompression. Two implementations exist: a local
//! file and an HTTP(S) download with resume support.

use std::{fs::File, io, io::Read, path::PathBuf};

use log::debug;

use crate::error::PipelineError;

pub mod download;

pub use download::{DownloadSource, DownloadSourceBuilder};

/// A producer of compressed bytes.
///
/// `open` performs whatever acquisition is needed (file open, HTTP request
/// with retries) and returns the stream. The returned reader reports
/// unrecoverable failures as `io::Error`s wrapping a [`PipelineError`];
/// downstream stages recover the original error with
/// [`unwrap_source_error`].
pub trait ByteSource {
    fn open(&self) -> Result<Box<dyn Read + Send>, PipelineError>;
}

impl ByteSource for Box<dyn ByteSource> {
    fn open(&self) -> Result<Box<dyn Read + Send>, PipelineError> {
        (**self).open()
    }
}

/// Source backed by a local file.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ByteSource for FileSource {
    fn open(&self) -> Result<Box<dyn Read + Send>, PipelineError> {
        let file = File::open(&self.path).map_err(|err| {
            PipelineError::SourceUnavailable(format!("{}: {}", self.path.display(), err))
        })?;
        debug!("opened source file {}", self.path.display());
        Ok(Box::new(SourceReader::new(file, self.path.display().to_string())))
    }
}

/// Read adapter that tags every I/O failure with the source category, so a
/// disk error surfacing mid-read through the decompressor is reported as
/// the source failing, not as corrupt compressed data.
pub(crate) struct SourceReader<R> {
    inner: R,
    context: String,
}

impl<R> SourceReader<R> {
    pub(crate) fn new(inner: R, context: impl Into<String>) -> Self {
        Self {
            inner,
            context: context.into(),
        }
    }
}

impl<R: Read> Read for SourceReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|err| {
            wrap_source_error(PipelineError::SourceUnavailable(format!(
                "{}: {}",
                self.context, err
            )))
        })
    }
}

/// Wraps a [`PipelineError`] into an `io::Error` so it can cross a
/// `std::io::Read` boundary without losing its category.
pub(crate) fn wrap_source_error(err: PipelineError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// Recovers the [`PipelineError`] smuggled through an `io::Error` by
/// [`wrap_source_error`]; any other io error becomes `SourceUnavailable`.
pub(crate) fn unwrap_source_error(err: io::Error) -> PipelineError {
    if err.get_ref().is_some_and(|inner| inner.is::<PipelineError>()) {
        // the downcast cannot fail, we just checked the type
        match err.into_inner().map(|inner| inner.downcast::<PipelineError>()) {
            Some(Ok(inner)) => *inner,
            _ => PipelineError::SourceUnavailable("source error lost in transit".to_string()),
        }
    } else {
        PipelineError::SourceUnavailable(err.to_string())
    }
}
