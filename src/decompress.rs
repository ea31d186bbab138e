//! Incremental bzip2 decompression.
//!
//! Wikidata dumps are multi-stream bzip2 files, so the decoder must keep
//! going across stream boundaries (`MultiBzDecoder`) and must yield output
//! as soon as a compressed block completes, without knowing the total
//! compressed length; both properties hold when the compressed bytes come
//! from an in-progress download.

use std::io::Read;

use bzip2::read::MultiBzDecoder;
use countio::Counter;

use crate::{
    core::stage::ChunkRead,
    error::PipelineError,
    source::unwrap_source_error,
};

/// Decompression stage: pulls compressed bytes from `source` on demand and
/// yields decompressed chunks. Decoder state persists across calls; there
/// is no reset between chunks.
pub struct Decompressor<R> {
    inner: MultiBzDecoder<Counter<R>>,
}

impl<R: Read> Decompressor<R> {
    pub fn new(source: R) -> Self {
        Self {
            inner: MultiBzDecoder::new(Counter::new(source)),
        }
    }

    /// Compressed bytes consumed so far, for failure diagnostics.
    pub fn compressed_bytes(&self) -> u64 {
        self.inner.get_ref().reader_bytes() as u64
    }
}

impl<R: Read> ChunkRead for Decompressor<R> {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, PipelineError> {
        let offset = self.compressed_bytes();
        self.inner.read(buf).map_err(|err| {
            // errors raised by the source layer pass through unchanged;
            // everything else is a format violation in the compressed data
            if err.get_ref().is_some_and(|inner| inner.is::<PipelineError>()) {
                unwrap_source_error(err)
            } else {
                PipelineError::CorruptStream {
                    offset,
                    detail: err.to_string(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bzip2::{write::BzEncoder, Compression};

    use super::Decompressor;
    use crate::{core::stage::ChunkRead, error::PipelineError};

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn drain(decompressor: &mut Decompressor<&[u8]>) -> Result<Vec<u8>, PipelineError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 97]; // odd size on purpose, chunks must not matter
        loop {
            let n = decompressor.read_chunk(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn round_trips_in_small_chunks() -> anyhow::Result<()> {
        let payload = b"[{\"id\":\"Q1\"},{\"id\":\"Q2\"}]".repeat(100);
        let compressed = compress(&payload);

        let mut decompressor = Decompressor::new(compressed.as_slice());
        let out = drain(&mut decompressor)?;
        assert_eq!(out, payload);
        assert_eq!(decompressor.compressed_bytes(), compressed.len() as u64);
        Ok(())
    }

    #[test]
    fn concatenated_streams_decode_fully() -> anyhow::Result<()> {
        // dumps are produced as multiple concatenated bzip2 streams
        let mut compressed = compress(b"[{\"id\":\"Q1\"},");
        compressed.extend(compress(b"{\"id\":\"Q2\"}]"));

        let mut decompressor = Decompressor::new(compressed.as_slice());
        let out = drain(&mut decompressor)?;
        assert_eq!(out, b"[{\"id\":\"Q1\"},{\"id\":\"Q2\"}]");
        Ok(())
    }

    #[test]
    fn corrupted_block_is_a_corrupt_stream_error() {
        let mut compressed = compress(&b"x".repeat(4096));
        // stomp on bytes well past the header so the checksum cannot match
        let mid = compressed.len() / 2;
        for byte in &mut compressed[mid..mid + 8] {
            *byte ^= 0xff;
        }

        let mut decompressor = Decompressor::new(compressed.as_slice());
        let err = drain(&mut decompressor).expect_err("corruption must surface");
        assert!(matches!(err, PipelineError::CorruptStream { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn garbage_input_is_a_corrupt_stream_error() {
        let mut decompressor = Decompressor::new(&b"this is not bzip2 data"[..]);
        let err = drain(&mut decompressor).expect_err("bad magic must surface");
        assert!(matches!(err, PipelineError::CorruptStream { .. }));
    }

    #[test]
    fn source_io_failure_mid_read_is_not_misreported_as_corruption() {
        use std::io::{self, Read};

        use crate::source::SourceReader;

        // the compressed data itself is perfectly valid; the disk dies
        // partway through delivering it
        struct DyingDisk {
            data: Vec<u8>,
            pos: usize,
        }

        impl Read for DyingDisk {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.pos >= self.data.len() {
                    return Err(io::Error::from_raw_os_error(5)); // EIO
                }
                let n = buf.len().min(self.data.len() - self.pos);
                buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
                self.pos += n;
                Ok(n)
            }
        }

        let mut compressed = compress(&b"[1,2,3]".repeat(2048));
        compressed.truncate(compressed.len() / 2);
        let disk = DyingDisk {
            data: compressed,
            pos: 0,
        };

        let mut decompressor = Decompressor::new(SourceReader::new(disk, "dump.json.bz2"));
        let mut buf = [0u8; 97];
        let err = loop {
            match decompressor.read_chunk(&mut buf) {
                Ok(0) => panic!("the source error must surface"),
                Ok(_) => continue,
                Err(err) => break err,
            }
        };
        match &err {
            PipelineError::SourceUnavailable(msg) => {
                assert!(msg.contains("dump.json.bz2"), "message was: {msg}")
            }
            other => panic!("expected SourceUnavailable, got {other:?}"),
        }
        assert_eq!(err.exit_code(), 2);
    }
}
