use std::io::Read;

use crate::error::PipelineError;

/// Pull seam between the decompression stage and the splitter.
///
/// A `ChunkRead` yields decompressed bytes into the caller's buffer, in
/// order, returning `Ok(0)` at end of stream. Ownership of the bytes moves
/// to the caller on each call; implementations keep only their own internal
/// state across calls.
pub trait ChunkRead {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, PipelineError>;
}

impl ChunkRead for Box<dyn ChunkRead + Send> {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, PipelineError> {
        (**self).read_chunk(buf)
    }
}

/// Adapter that feeds an already-decompressed byte stream straight to the
/// splitter, bypassing the decompression stage. Read errors here come from
/// the source layer, not from a compression format violation.
pub struct IoChunkReader<R> {
    inner: R,
}

impl<R: Read> IoChunkReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> ChunkRead for IoChunkReader<R> {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, PipelineError> {
        self.inner
            .read(buf)
            .map_err(|err| crate::source::unwrap_source_error(err))
    }
}
