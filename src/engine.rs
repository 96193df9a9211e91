//! The compression engine boundary.
//!
//! Everything above this module talks to an [`Engine`]: a bound function and
//! single-call primitives for already-buffered payloads, a frame header query,
//! and incremental sessions for streams. [`Zstd`] is the engine used by the
//! middleware; any other implementation of the trait is substitutable.

use crate::error::{CodecError, CodecResult, Phase};
use std::fmt;
use zstd::stream::raw::{self, InBuffer, Operation, OutBuffer};

/// Default zstd compression level.
pub const DEFAULT_LEVEL: i32 = 3;

/// Decompressed size declared by a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSize {
    /// The header declares this many decompressed bytes.
    Known(u64),
    /// The header is valid but does not declare a size.
    Unknown,
    /// The input does not start with a valid frame header.
    Invalid,
}

/// Progress made by a single session step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Step {
    /// Input bytes consumed by the step.
    pub consumed: usize,
    /// Output bytes written by the step.
    pub produced: usize,
    /// Engine hint; zero once the frame is closed (encoding) or fully
    /// decoded (decoding).
    pub remaining: usize,
}

/// An incremental compression session.
///
/// Dropping the session releases the engine state.
pub trait EncodeSession: Send {
    /// Feeds `input` without ending the frame.
    fn compress(&mut self, input: &[u8], output: &mut [u8]) -> CodecResult<Step>;

    /// Emits whatever the engine has buffered so far.
    fn flush(&mut self, output: &mut [u8]) -> CodecResult<Step>;

    /// Ends the frame. Must be repeated until `remaining` is zero.
    fn finish(&mut self, output: &mut [u8]) -> CodecResult<Step>;
}

/// An incremental decompression session.
pub trait DecodeSession: Send {
    /// Feeds `input`. A `remaining` of zero means the current frame is complete.
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> CodecResult<Step>;
}

/// A compression engine.
pub trait Engine: fmt::Debug + Send + Sync {
    /// Content coding token for this engine, e.g. `zstd`.
    fn encoding(&self) -> &'static str;

    /// Worst-case compressed size for `len` input bytes.
    fn compress_bound(&self, len: usize) -> usize;

    /// Compresses `input` into `output` in one call, returning the frame length.
    ///
    /// `output` must be at least [`Engine::compress_bound`] bytes long.
    fn compress(&self, input: &[u8], output: &mut [u8]) -> CodecResult<usize>;

    /// Reads the decompressed size from the frame header.
    fn frame_content_size(&self, frame: &[u8]) -> FrameSize;

    /// Decompresses a whole frame into `output`, returning the decoded length.
    fn decompress(&self, frame: &[u8], output: &mut [u8]) -> CodecResult<usize>;

    /// Starts a compression session. `pledged_size` is recorded in the frame
    /// header when given.
    fn encoder(&self, pledged_size: Option<u64>) -> CodecResult<Box<dyn EncodeSession>>;

    /// Starts a decompression session.
    fn decoder(&self) -> CodecResult<Box<dyn DecodeSession>>;

    /// Recommended (input, output) buffer sizes for compression sessions.
    fn encoder_buffer_sizes(&self) -> (usize, usize);

    /// Recommended (input, output) buffer sizes for decompression sessions.
    fn decoder_buffer_sizes(&self) -> (usize, usize);
}

/// The zstd engine.
#[derive(Debug, Clone, Copy)]
pub struct Zstd {
    level: i32,
}

impl Zstd {
    /// Creates a zstd engine compressing at `level`.
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    /// Returns the compression level.
    pub fn level(&self) -> i32 {
        self.level
    }

    /// Returns the range of compression levels accepted by zstd.
    pub fn level_range() -> std::ops::RangeInclusive<i32> {
        zstd_safe::min_c_level()..=zstd_safe::max_c_level()
    }
}

impl Default for Zstd {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

impl Engine for Zstd {
    fn encoding(&self) -> &'static str {
        "zstd"
    }

    fn compress_bound(&self, len: usize) -> usize {
        zstd_safe::compress_bound(len)
    }

    fn compress(&self, input: &[u8], output: &mut [u8]) -> CodecResult<usize> {
        zstd::bulk::compress_to_buffer(input, output, self.level)
            .map_err(|e| CodecError::engine(Phase::Compress, e))
    }

    fn frame_content_size(&self, frame: &[u8]) -> FrameSize {
        match zstd_safe::get_frame_content_size(frame) {
            Ok(Some(size)) => FrameSize::Known(size),
            Ok(None) => FrameSize::Unknown,
            Err(_) => FrameSize::Invalid,
        }
    }

    fn decompress(&self, frame: &[u8], output: &mut [u8]) -> CodecResult<usize> {
        zstd::bulk::decompress_to_buffer(frame, output)
            .map_err(|e| CodecError::engine(Phase::Decompress, e))
    }

    fn encoder(&self, pledged_size: Option<u64>) -> CodecResult<Box<dyn EncodeSession>> {
        let mut encoder =
            raw::Encoder::new(self.level).map_err(|e| CodecError::engine(Phase::Init, e))?;
        if pledged_size.is_some() {
            encoder
                .set_pledged_src_size(pledged_size)
                .map_err(|e| CodecError::engine(Phase::Init, e))?;
        }
        Ok(Box::new(ZstdEncoder { inner: encoder }))
    }

    fn decoder(&self) -> CodecResult<Box<dyn DecodeSession>> {
        let decoder = raw::Decoder::new().map_err(|e| CodecError::engine(Phase::Init, e))?;
        Ok(Box::new(ZstdDecoder { inner: decoder }))
    }

    fn encoder_buffer_sizes(&self) -> (usize, usize) {
        (zstd_safe::CCtx::in_size(), zstd_safe::CCtx::out_size())
    }

    fn decoder_buffer_sizes(&self) -> (usize, usize) {
        (zstd_safe::DCtx::in_size(), zstd_safe::DCtx::out_size())
    }
}

struct ZstdEncoder {
    inner: raw::Encoder<'static>,
}

impl EncodeSession for ZstdEncoder {
    fn compress(&mut self, input: &[u8], output: &mut [u8]) -> CodecResult<Step> {
        let mut input = InBuffer::around(input);
        let mut output = OutBuffer::around(output);
        let remaining = self
            .inner
            .run(&mut input, &mut output)
            .map_err(|e| CodecError::engine(Phase::Compress, e))?;
        Ok(Step {
            consumed: input.pos(),
            produced: output.pos(),
            remaining,
        })
    }

    fn flush(&mut self, output: &mut [u8]) -> CodecResult<Step> {
        let mut output = OutBuffer::around(output);
        let remaining = self
            .inner
            .flush(&mut output)
            .map_err(|e| CodecError::engine(Phase::Flush, e))?;
        Ok(Step {
            consumed: 0,
            produced: output.pos(),
            remaining,
        })
    }

    fn finish(&mut self, output: &mut [u8]) -> CodecResult<Step> {
        let mut output = OutBuffer::around(output);
        let remaining = self
            .inner
            .finish(&mut output, false)
            .map_err(|e| CodecError::engine(Phase::Finish, e))?;
        Ok(Step {
            consumed: 0,
            produced: output.pos(),
            remaining,
        })
    }
}

struct ZstdDecoder {
    inner: raw::Decoder<'static>,
}

impl DecodeSession for ZstdDecoder {
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> CodecResult<Step> {
        let mut input = InBuffer::around(input);
        let mut output = OutBuffer::around(output);
        let remaining = self
            .inner
            .run(&mut input, &mut output)
            .map_err(|e| CodecError::engine(Phase::Decompress, e))?;
        Ok(Step {
            consumed: input.pos(),
            produced: output.pos(),
            remaining,
        })
    }
}

/// An engine whose compression primitives always fail; decoding is delegated
/// to zstd.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct BrokenEngine {
    zstd: Zstd,
}

#[cfg(test)]
impl Engine for BrokenEngine {
    fn encoding(&self) -> &'static str {
        "zstd"
    }

    fn compress_bound(&self, len: usize) -> usize {
        self.zstd.compress_bound(len)
    }

    fn compress(&self, _input: &[u8], _output: &mut [u8]) -> CodecResult<usize> {
        Err(CodecError::engine(Phase::Compress, "forced failure"))
    }

    fn frame_content_size(&self, frame: &[u8]) -> FrameSize {
        self.zstd.frame_content_size(frame)
    }

    fn decompress(&self, frame: &[u8], output: &mut [u8]) -> CodecResult<usize> {
        self.zstd.decompress(frame, output)
    }

    fn encoder(&self, _pledged_size: Option<u64>) -> CodecResult<Box<dyn EncodeSession>> {
        Err(CodecError::engine(Phase::Init, "no sessions available"))
    }

    fn decoder(&self) -> CodecResult<Box<dyn DecodeSession>> {
        self.zstd.decoder()
    }

    fn encoder_buffer_sizes(&self) -> (usize, usize) {
        self.zstd.encoder_buffer_sizes()
    }

    fn decoder_buffer_sizes(&self) -> (usize, usize) {
        self.zstd.decoder_buffer_sizes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_covers_input() {
        let engine = Zstd::default();
        assert!(engine.compress_bound(0) > 0);
        assert!(engine.compress_bound(100_000) >= 100_000);
    }

    #[test]
    fn test_one_shot_frame_declares_size() {
        let engine = Zstd::default();
        let input = b"hello hello hello hello";
        let mut frame = vec![0u8; engine.compress_bound(input.len())];
        let len = engine.compress(input, &mut frame).unwrap();
        assert_eq!(
            engine.frame_content_size(&frame[..len]),
            FrameSize::Known(input.len() as u64)
        );
    }

    #[test]
    fn test_frame_size_invalid_for_garbage() {
        let engine = Zstd::default();
        assert_eq!(engine.frame_content_size(b""), FrameSize::Invalid);
        assert_eq!(
            engine.frame_content_size(b"definitely not zstd"),
            FrameSize::Invalid
        );
    }

    #[test]
    fn test_session_frame_without_pledge_is_unknown() {
        let engine = Zstd::default();
        let mut session = engine.encoder(None).unwrap();
        let mut out = vec![0u8; 1024];
        let step = session.compress(b"abc", &mut out).unwrap();
        assert_eq!(step.consumed, 3);
        let mut frame = out[..step.produced].to_vec();
        loop {
            let step = session.finish(&mut out).unwrap();
            frame.extend_from_slice(&out[..step.produced]);
            if step.remaining == 0 {
                break;
            }
        }
        assert_eq!(engine.frame_content_size(&frame), FrameSize::Unknown);
    }

    #[test]
    fn test_recommended_sizes_nonzero() {
        let engine = Zstd::default();
        let (cin, cout) = engine.encoder_buffer_sizes();
        let (din, dout) = engine.decoder_buffer_sizes();
        assert!(cin > 0 && cout > 0 && din > 0 && dout > 0);
    }

    #[test]
    fn test_level_range_contains_default() {
        assert!(Zstd::level_range().contains(&DEFAULT_LEVEL));
    }
}
