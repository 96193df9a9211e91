//! Streaming compression over asynchronous byte sources.
//!
//! A streaming operation owns one engine session ([`StreamContext`]) and one
//! working buffer pair sized by the engine. Input is read a buffer at a time,
//! stepped through the session, and every step's output is written to the sink
//! before the next input is read.

use crate::engine::{DecodeSession, EncodeSession, Engine, FrameSize};
use crate::error::{CodecError, CodecResult, Phase};
use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Per-operation options for [`Codec`] streams.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Exact source length, recorded in the frame header when compressing.
    pub pledged_size: Option<u64>,
    /// Deadline for filling one input buffer from the source.
    pub read_timeout: Option<Duration>,
    /// Checked before and during every chunk read.
    pub cancel: Option<CancellationToken>,
}

impl StreamOptions {
    /// Creates options with no size hint, deadline or cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pledges the exact source length.
    pub fn with_pledged_size(mut self, size: u64) -> Self {
        self.pledged_size = Some(size);
        self
    }

    /// Sets the per-chunk read deadline.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Sets the cancellation token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// An engine session scoped to one streaming operation.
///
/// The session is released when the context is dropped, on every exit path.
pub(crate) struct StreamContext<S: ?Sized> {
    session: Box<S>,
    operation: &'static str,
}

impl<S: ?Sized> StreamContext<S> {
    pub(crate) fn new(session: Box<S>, operation: &'static str) -> Self {
        trace!(operation, "stream context created");
        Self { session, operation }
    }
}

impl<S: ?Sized> Deref for StreamContext<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: ?Sized> DerefMut for StreamContext<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

impl<S: ?Sized> Drop for StreamContext<S> {
    fn drop(&mut self) {
        trace!(operation = self.operation, "stream context released");
    }
}

/// Input and output buffers reused across every chunk of one operation.
struct WorkingBuffer {
    input: Vec<u8>,
    output: Vec<u8>,
}

impl WorkingBuffer {
    fn new((input, output): (usize, usize)) -> Self {
        Self {
            input: vec![0u8; input],
            output: vec![0u8; output],
        }
    }
}

/// Streaming compressor and decompressor.
#[derive(Debug, Clone)]
pub struct Codec {
    engine: Arc<dyn Engine>,
    max_output: u64,
    read_timeout: Option<Duration>,
}

impl Codec {
    /// Creates a codec. Decompressed output is capped at `max_output` bytes.
    pub fn new(engine: Arc<dyn Engine>, max_output: u64) -> Self {
        Self {
            engine,
            max_output,
            read_timeout: None,
        }
    }

    /// Sets the chunk read deadline used when [`StreamOptions`] does not set one.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Compresses `source` into a single frame written to `sink`.
    ///
    /// Returns the number of compressed bytes written. On error, output already
    /// written to the sink is left in place.
    pub async fn compress_stream<R, W>(
        &self,
        mut source: R,
        mut sink: W,
        options: &StreamOptions,
    ) -> CodecResult<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut ctx = StreamContext::new(self.engine.encoder(options.pledged_size)?, "compress");
        let mut buffers = WorkingBuffer::new(self.engine.encoder_buffer_sizes());
        let timeout = options.read_timeout.or(self.read_timeout);
        let mut read = 0u64;
        let mut written = 0u64;

        loop {
            let filled = read_chunk(&mut source, &mut buffers.input, timeout, options).await?;
            if filled == 0 {
                break;
            }
            read += filled as u64;

            let mut pos = 0;
            while pos < filled {
                let step = ctx.compress(&buffers.input[pos..filled], &mut buffers.output)?;
                if step.consumed == 0 && step.produced == 0 {
                    return Err(CodecError::engine(Phase::Compress, "no progress"));
                }
                pos += step.consumed;
                written += write_output(&mut sink, &buffers.output[..step.produced]).await?;
            }
        }

        loop {
            let step = ctx.finish(&mut buffers.output)?;
            written += write_output(&mut sink, &buffers.output[..step.produced]).await?;
            if step.remaining == 0 {
                break;
            }
        }
        sink.flush().await?;

        debug!(read, written, "stream compressed");
        Ok(written)
    }

    /// Decompresses every frame in `source`, writing the decoded bytes to `sink`.
    ///
    /// Frames without a declared size are accepted. A source that does not
    /// start with a frame header, or ends in the middle of a frame, fails with
    /// [`CodecError::InvalidFrame`].
    pub async fn decompress_stream<R, W>(
        &self,
        mut source: R,
        mut sink: W,
        options: &StreamOptions,
    ) -> CodecResult<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut ctx: StreamContext<dyn DecodeSession> =
            StreamContext::new(self.engine.decoder()?, "decompress");
        let mut buffers = WorkingBuffer::new(self.engine.decoder_buffer_sizes());
        let timeout = options.read_timeout.or(self.read_timeout);
        let mut written = 0u64;
        let mut in_frame = false;
        let mut first = true;

        loop {
            let filled = read_chunk(&mut source, &mut buffers.input, timeout, options).await?;
            if filled == 0 {
                break;
            }
            // Chunks are short only at end of input, so the header is whole here.
            if first
                && self.engine.frame_content_size(&buffers.input[..filled]) == FrameSize::Invalid
            {
                return Err(CodecError::InvalidFrame);
            }
            first = false;

            let mut pos = 0;
            loop {
                let step = ctx.decompress(&buffers.input[pos..filled], &mut buffers.output)?;
                pos += step.consumed;
                in_frame = step.remaining != 0;

                let produced = &buffers.output[..step.produced];
                let total = written + produced.len() as u64;
                if total > self.max_output {
                    return Err(CodecError::SizeExceedsLimit {
                        size: total,
                        limit: self.max_output,
                    });
                }
                written += write_output(&mut sink, produced).await?;

                let output_full = step.produced == buffers.output.len();
                if pos == filled && !output_full {
                    break;
                }
                if step.consumed == 0 && step.produced == 0 {
                    return Err(CodecError::engine(Phase::Decompress, "no progress"));
                }
            }
        }
        sink.flush().await?;

        if in_frame {
            return Err(CodecError::InvalidFrame);
        }
        debug!(written, "stream decompressed");
        Ok(written)
    }
}

/// Synchronous chunk encoder used by streaming response bodies.
pub(crate) struct ChunkEncoder {
    ctx: StreamContext<dyn EncodeSession>,
    output: Vec<u8>,
}

impl ChunkEncoder {
    pub(crate) fn new(engine: &dyn Engine) -> CodecResult<Self> {
        let ctx = StreamContext::new(engine.encoder(None)?, "compress body");
        let (_, output) = engine.encoder_buffer_sizes();
        Ok(Self {
            ctx,
            output: vec![0u8; output],
        })
    }

    /// Feeds all of `input`, appending produced bytes to `out`.
    pub(crate) fn encode(&mut self, input: &[u8], out: &mut BytesMut) -> CodecResult<()> {
        let mut pos = 0;
        while pos < input.len() {
            let step = self.ctx.compress(&input[pos..], &mut self.output)?;
            if step.consumed == 0 && step.produced == 0 {
                return Err(CodecError::engine(Phase::Compress, "no progress"));
            }
            pos += step.consumed;
            out.extend_from_slice(&self.output[..step.produced]);
        }
        Ok(())
    }

    /// Flushes everything buffered in the session.
    pub(crate) fn flush(&mut self, out: &mut BytesMut) -> CodecResult<()> {
        loop {
            let step = self.ctx.flush(&mut self.output)?;
            out.extend_from_slice(&self.output[..step.produced]);
            if step.remaining == 0 {
                return Ok(());
            }
        }
    }

    /// Runs one end-of-frame step. Returns `true` once the frame is closed.
    pub(crate) fn finish(&mut self, out: &mut BytesMut) -> CodecResult<bool> {
        let step = self.ctx.finish(&mut self.output)?;
        out.extend_from_slice(&self.output[..step.produced]);
        Ok(step.remaining == 0)
    }
}

/// Fills `buf` from `source`, stopping early only at end of input.
async fn read_chunk<R>(
    source: &mut R,
    buf: &mut [u8],
    timeout: Option<Duration>,
    options: &StreamOptions,
) -> CodecResult<usize>
where
    R: AsyncRead + Unpin,
{
    if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
        return Err(CodecError::Cancelled);
    }

    let fill = async {
        let mut filled = 0;
        while filled < buf.len() {
            let n = source.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok::<_, CodecError>(filled)
    };
    let timed = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, fill).await {
                Ok(res) => res,
                Err(_) => Err(CodecError::Timeout(limit)),
            },
            None => fill.await,
        }
    };

    match &options.cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(CodecError::Cancelled),
            res = timed => res,
        },
        None => timed.await,
    }
}

async fn write_output<W>(sink: &mut W, bytes: &[u8]) -> CodecResult<u64>
where
    W: AsyncWrite + Unpin,
{
    if !bytes.is_empty() {
        sink.write_all(bytes).await?;
    }
    Ok(bytes.len() as u64)
}
