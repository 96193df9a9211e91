//! Whole-buffer compression for payloads that are already in memory.

use crate::engine::{Engine, FrameSize};
use crate::error::{CodecError, CodecResult};
use bytes::Bytes;
use std::sync::Arc;
use tracing::trace;

/// One-shot compressor and decompressor.
///
/// Frames produced here declare their decompressed size, so
/// [`Transform::decompress`] can size its output from the header alone.
#[derive(Debug, Clone)]
pub struct Transform {
    engine: Arc<dyn Engine>,
    max_size: u64,
}

impl Transform {
    /// Creates a transform. Frames declaring more than `max_size` decompressed
    /// bytes are rejected without allocating.
    pub fn new(engine: Arc<dyn Engine>, max_size: u64) -> Self {
        Self { engine, max_size }
    }

    /// Returns the engine's content coding token.
    pub fn encoding(&self) -> &'static str {
        self.engine.encoding()
    }

    /// Compresses `input` into a single frame.
    pub fn compress(&self, input: &[u8]) -> CodecResult<Bytes> {
        let bound = self.engine.compress_bound(input.len());
        let mut output = zeroed(bound)?;
        let len = self.engine.compress(input, &mut output)?;
        output.truncate(len);
        trace!(input = input.len(), output = len, "compressed");
        Ok(Bytes::from(output))
    }

    /// Decompresses a frame whose header declares its size.
    pub fn decompress(&self, frame: &[u8]) -> CodecResult<Bytes> {
        let size = match self.engine.frame_content_size(frame) {
            FrameSize::Known(size) => size,
            FrameSize::Unknown => return Err(CodecError::UnknownSize),
            FrameSize::Invalid => return Err(CodecError::InvalidFrame),
        };
        if size > self.max_size {
            return Err(CodecError::SizeExceedsLimit {
                size,
                limit: self.max_size,
            });
        }
        let size = usize::try_from(size).map_err(|_| CodecError::SizeExceedsLimit {
            size,
            limit: self.max_size,
        })?;

        let mut output = zeroed(size)?;
        let len = self.engine.decompress(frame, &mut output)?;
        output.truncate(len);
        trace!(input = frame.len(), output = len, "decompressed");
        Ok(Bytes::from(output))
    }
}

fn zeroed(len: usize) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| CodecError::Allocation(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BrokenEngine, Zstd};
    use crate::error::Phase;

    fn transform() -> Transform {
        Transform::new(Arc::new(Zstd::default()), 16 * 1024 * 1024)
    }

    #[test]
    fn test_roundtrip() {
        let input = b"{\"message\":\"hello\",\"items\":[1,2,3,4,5,6,7,8,9,10]}".repeat(50);
        let frame = transform().compress(&input).unwrap();
        assert!(frame.len() < input.len());
        assert_eq!(transform().decompress(&frame).unwrap(), input);
    }

    #[test]
    fn test_roundtrip_empty() {
        let frame = transform().compress(b"").unwrap();
        assert!(!frame.is_empty());
        assert!(transform().decompress(&frame).unwrap().is_empty());
    }

    #[test]
    fn test_incompressible_input_fits_bound() {
        let input: Vec<u8> = (0..20_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let frame = transform().compress(&input).unwrap();
        assert_eq!(transform().decompress(&frame).unwrap(), input);
    }

    #[test]
    fn test_garbage_is_invalid_frame() {
        let err = transform().decompress(b"random bytes, not a frame").unwrap_err();
        assert!(matches!(err, CodecError::InvalidFrame));
        let err = transform().decompress(b"").unwrap_err();
        assert!(matches!(err, CodecError::InvalidFrame));
    }

    #[test]
    fn test_declared_size_over_limit() {
        let frame = transform().compress(&[b'a'; 4096]).unwrap();
        let small = Transform::new(Arc::new(Zstd::default()), 1024);
        let err = small.decompress(&frame).unwrap_err();
        assert!(matches!(
            err,
            CodecError::SizeExceedsLimit {
                size: 4096,
                limit: 1024
            }
        ));
    }

    #[test]
    fn test_corrupted_payload_is_engine_failure() {
        let mut frame = transform().compress(&b"abcdefgh".repeat(100)).unwrap().to_vec();
        let last = frame.len() - 1;
        frame.truncate(last);
        let err = transform().decompress(&frame).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Decompress));
    }

    #[test]
    fn test_compress_failure_propagates() {
        let broken = Transform::new(Arc::new(BrokenEngine::default()), 1024);
        let err = broken.compress(b"payload").unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Compress));
    }
}
