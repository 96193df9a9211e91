use crate::codec::ChunkEncoder;
use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pin_project! {
    /// A response body that may be zstd-compressed.
    ///
    /// Bodies of known length are compressed in one shot and held in memory;
    /// bodies of unknown length are compressed chunk by chunk as they stream.
    #[project = ZstdBodyProj]
    #[allow(missing_docs)]
    pub enum ZstdBody<B> {
        /// Body compressed while streaming.
        Streaming {
            inner: Pin<Box<B>>,
            state: StreamingBody,
        },
        /// Fully buffered body, compressed or not.
        Buffered {
            data: Option<Bytes>,
            trailers: Option<HeaderMap>,
        },
        /// Body passed through unchanged.
        Passthrough {
            #[pin]
            inner: B,
        },
        /// Body whose downstream read failed while buffering.
        Failed {
            error: Option<io::Error>,
        },
    }
}

/// Encoder state and buffers for a body compressed while streaming.
pub struct StreamingBody {
    encoder: ChunkEncoder,
    always_flush: bool,
    state: CompressState,
    prefix: Option<Bytes>,
    pending_trailers: Option<HeaderMap>,
}

impl std::fmt::Debug for StreamingBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingBody")
            .field("always_flush", &self.always_flush)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// State machine for streaming compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompressState {
    /// Reading data from inner body and compressing.
    Reading,
    /// Closing the frame after inner body is done.
    Finishing,
    /// Emitting buffered trailers.
    Trailers,
    /// Compression is complete.
    Done,
}

impl StreamingBody {
    pub(crate) fn new(encoder: ChunkEncoder, always_flush: bool) -> Self {
        Self {
            encoder,
            always_flush,
            state: CompressState::Reading,
            prefix: None,
            pending_trailers: None,
        }
    }

    /// Compresses `prefix` ahead of the first frame read from the inner body.
    pub(crate) fn with_prefix(mut self, prefix: Bytes) -> Self {
        self.prefix = Some(prefix).filter(|p| !p.is_empty());
        self
    }

    /// Returns the current compression state.
    pub(crate) fn state(&self) -> CompressState {
        self.state
    }

    /// Returns whether every chunk is flushed as soon as it is compressed.
    pub(crate) fn always_flush(&self) -> bool {
        self.always_flush
    }

    fn after_finish(&self) -> CompressState {
        if self.pending_trailers.is_some() {
            CompressState::Trailers
        } else {
            CompressState::Done
        }
    }

    fn fail(&mut self, e: crate::CodecError) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        error!(reason = e.reason(), error = %e, "streaming compression failed");
        self.state = CompressState::Done;
        Poll::Ready(Some(Err(io::Error::other(e))))
    }

    /// Compresses one chunk, returning a frame when output is ready.
    fn compress_data(&mut self, input: &[u8]) -> Result<Option<Frame<Bytes>>, crate::CodecError> {
        let mut output = BytesMut::new();
        self.encoder.encode(input, &mut output)?;
        if self.always_flush {
            self.encoder.flush(&mut output)?;
        }
        Ok((!output.is_empty()).then(|| Frame::data(output.freeze())))
    }

    /// Polls the inner body and compresses data.
    fn poll_compressed<B>(
        &mut self,
        cx: &mut Context<'_>,
        mut inner: Pin<&mut B>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        if let Some(prefix) = self.prefix.take() {
            match self.compress_data(&prefix) {
                Ok(Some(frame)) => return Poll::Ready(Some(Ok(frame))),
                Ok(None) => {}
                Err(e) => return self.fail(e),
            }
        }

        loop {
            match self.state {
                CompressState::Done => return Poll::Ready(None),

                CompressState::Trailers => {
                    self.state = CompressState::Done;
                    if let Some(trailers) = self.pending_trailers.take() {
                        return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                    }
                    return Poll::Ready(None);
                }

                CompressState::Finishing => {
                    let mut output = BytesMut::new();
                    match self.encoder.finish(&mut output) {
                        Ok(done) => {
                            if done {
                                self.state = self.after_finish();
                            }
                            if !output.is_empty() {
                                return Poll::Ready(Some(Ok(Frame::data(output.freeze()))));
                            }
                        }
                        Err(e) => return self.fail(e),
                    }
                }

                CompressState::Reading => match inner.as_mut().poll_frame(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(None) => {
                        self.state = CompressState::Finishing;
                    }
                    Poll::Ready(Some(Err(e))) => {
                        self.state = CompressState::Done;
                        return Poll::Ready(Some(Err(io::Error::other(e.into()))));
                    }
                    Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                        Ok(mut data) => {
                            let input = data.copy_to_bytes(data.remaining());
                            match self.compress_data(&input) {
                                Ok(Some(frame)) => return Poll::Ready(Some(Ok(frame))),
                                Ok(None) => {}
                                Err(e) => return self.fail(e),
                            }
                        }
                        Err(frame) => {
                            if let Ok(trailers) = frame.into_trailers() {
                                // Close the frame before the trailers go out
                                self.pending_trailers = Some(trailers);
                                self.state = CompressState::Finishing;
                            }
                        }
                    },
                },
            }
        }
    }
}

impl<B> ZstdBody<B> {
    pub(crate) fn streaming(inner: Pin<Box<B>>, state: StreamingBody) -> Self {
        Self::Streaming { inner, state }
    }

    /// Creates a buffered body.
    pub fn buffered(data: Bytes, trailers: Option<HeaderMap>) -> Self {
        Self::Buffered {
            data: Some(data),
            trailers,
        }
    }

    /// Creates a passthrough body without compression.
    pub fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }

    pub(crate) fn failed(error: io::Error) -> Self {
        Self::Failed { error: Some(error) }
    }
}

impl<B> Body for ZstdBody<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            ZstdBodyProj::Passthrough { inner } => poll_passthrough(inner, cx),
            ZstdBodyProj::Streaming { inner, state } => state.poll_compressed(cx, inner.as_mut()),
            ZstdBodyProj::Buffered { data, trailers } => {
                if let Some(data) = data.take().filter(|d| !d.is_empty()) {
                    return Poll::Ready(Some(Ok(Frame::data(data))));
                }
                Poll::Ready(trailers.take().map(|t| Ok(Frame::trailers(t))))
            }
            ZstdBodyProj::Failed { error } => Poll::Ready(error.take().map(Err)),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            ZstdBody::Passthrough { inner } => inner.is_end_stream(),
            ZstdBody::Streaming { state, .. } => state.state() == CompressState::Done,
            ZstdBody::Buffered { data, trailers } => {
                data.as_ref().is_none_or(|d| d.is_empty()) && trailers.is_none()
            }
            ZstdBody::Failed { error } => error.is_none(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            ZstdBody::Passthrough { inner } => inner.size_hint(),
            // Compressed size is unknown
            ZstdBody::Streaming { .. } => SizeHint::default(),
            ZstdBody::Buffered { data, .. } => {
                SizeHint::with_exact(data.as_ref().map_or(0, |d| d.len() as u64))
            }
            ZstdBody::Failed { .. } => SizeHint::default(),
        }
    }
}

pin_project! {
    /// A request body as seen by the downstream service.
    ///
    /// Bodies that arrived zstd-encoded are replaced by their decoded bytes;
    /// all others are passed through.
    #[project = DecodedBodyProj]
    #[allow(missing_docs)]
    pub enum DecodedBody<B> {
        /// Decoded request bytes.
        Decoded {
            data: Option<Bytes>,
        },
        /// Body passed through unchanged.
        Passthrough {
            #[pin]
            inner: B,
        },
    }
}

impl<B> DecodedBody<B> {
    /// Creates a body holding decoded bytes.
    pub fn decoded(data: Bytes) -> Self {
        Self::Decoded { data: Some(data) }
    }

    /// Creates a passthrough body.
    pub fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }
}

impl<B> Body for DecodedBody<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            DecodedBodyProj::Decoded { data } => Poll::Ready(
                data.take()
                    .filter(|d| !d.is_empty())
                    .map(|d| Ok(Frame::data(d))),
            ),
            DecodedBodyProj::Passthrough { inner } => poll_passthrough(inner, cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            DecodedBody::Decoded { data } => data.as_ref().is_none_or(|d| d.is_empty()),
            DecodedBody::Passthrough { inner } => inner.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            DecodedBody::Decoded { data } => {
                SizeHint::with_exact(data.as_ref().map_or(0, |d| d.len() as u64))
            }
            DecodedBody::Passthrough { inner } => inner.size_hint(),
        }
    }
}

/// Passes frames through, converting data to `Bytes`.
fn poll_passthrough<B>(
    inner: Pin<&mut B>,
    cx: &mut Context<'_>,
) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    match inner.poll_frame(cx) {
        Poll::Pending => Poll::Pending,
        Poll::Ready(None) => Poll::Ready(None),
        Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(
            frame.map_data(|mut data| data.copy_to_bytes(data.remaining()))
        ))),
        Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(io::Error::other(e.into())))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Zstd;
    use std::collections::VecDeque;

    /// A test body that yields predefined frames.
    struct TestBody {
        frames: VecDeque<Frame<Bytes>>,
    }

    impl TestBody {
        fn new(frames: Vec<Frame<Bytes>>) -> Self {
            Self {
                frames: frames.into(),
            }
        }
    }

    impl Body for TestBody {
        type Data = Bytes;
        type Error = std::convert::Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            match self.frames.pop_front() {
                Some(frame) => Poll::Ready(Some(Ok(frame))),
                None => Poll::Ready(None),
            }
        }
    }

    fn poll_body<B: Body + Unpin>(body: &mut B) -> Option<Result<Frame<B::Data>, B::Error>> {
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        match Pin::new(body).poll_frame(&mut cx) {
            Poll::Ready(result) => result,
            Poll::Pending => None,
        }
    }

    fn streaming(inner: TestBody, always_flush: bool) -> ZstdBody<TestBody> {
        let encoder = ChunkEncoder::new(&Zstd::default()).unwrap();
        ZstdBody::streaming(Box::pin(inner), StreamingBody::new(encoder, always_flush))
    }

    /// Drains a body, returning the concatenated data and any trailers.
    fn drain<B>(body: &mut B) -> (Vec<u8>, Option<HeaderMap>)
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Debug,
    {
        let mut data = Vec::new();
        let mut trailers = None;
        while let Some(frame) = poll_body(body) {
            let frame = frame.unwrap();
            match frame.into_data() {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(frame) => trailers = frame.into_trailers().ok(),
            }
        }
        (data, trailers)
    }

    #[test]
    fn test_passthrough_data() {
        let inner = TestBody::new(vec![Frame::data(Bytes::from("hello world"))]);
        let mut body = ZstdBody::passthrough(inner);

        let frame = poll_body(&mut body).unwrap().unwrap();
        assert!(frame.is_data());
        assert_eq!(frame.into_data().unwrap(), Bytes::from("hello world"));

        assert!(poll_body(&mut body).is_none());
    }

    #[test]
    fn test_passthrough_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc123".parse().unwrap());

        let inner = TestBody::new(vec![
            Frame::data(Bytes::from("data")),
            Frame::trailers(trailers.clone()),
        ]);
        let mut body = ZstdBody::passthrough(inner);

        let (data, received) = drain(&mut body);
        assert_eq!(data, b"data");
        assert_eq!(received.unwrap().get("x-checksum").unwrap(), "abc123");
    }

    #[test]
    fn test_streaming_roundtrip() {
        let inner = TestBody::new(vec![
            Frame::data(Bytes::from("hello ")),
            Frame::data(Bytes::from("streaming ")),
            Frame::data(Bytes::from("world")),
        ]);
        let mut body = streaming(inner, false);

        let (data, trailers) = drain(&mut body);
        assert!(trailers.is_none());
        assert!(body.is_end_stream());
        assert_eq!(
            zstd::stream::decode_all(&data[..]).unwrap(),
            b"hello streaming world"
        );
    }

    #[test]
    fn test_streaming_prefix_precedes_inner_frames() {
        let inner = TestBody::new(vec![Frame::data(Bytes::from("world"))]);
        let encoder = ChunkEncoder::new(&Zstd::default()).unwrap();
        let state = StreamingBody::new(encoder, false).with_prefix(Bytes::from("hello "));
        let mut body = ZstdBody::streaming(Box::pin(inner), state);

        let (data, _) = drain(&mut body);
        assert_eq!(zstd::stream::decode_all(&data[..]).unwrap(), b"hello world");
    }

    #[test]
    fn test_streaming_empty_body_is_valid_frame() {
        let mut body = streaming(TestBody::new(vec![]), false);
        let (data, _) = drain(&mut body);
        assert!(!data.is_empty());
        assert!(zstd::stream::decode_all(&data[..]).unwrap().is_empty());
    }

    #[test]
    fn test_streaming_with_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc123".parse().unwrap());

        let inner = TestBody::new(vec![
            Frame::data(Bytes::from("hello world")),
            Frame::trailers(trailers),
        ]);
        let mut body = streaming(inner, false);

        let (data, trailers) = drain(&mut body);
        let trailers = trailers.expect("Expected trailers frame");
        assert_eq!(trailers.get("x-checksum").unwrap(), "abc123");
        assert_eq!(zstd::stream::decode_all(&data[..]).unwrap(), b"hello world");
    }

    #[test]
    fn test_always_flush_emits_each_chunk() {
        let inner = TestBody::new(vec![
            Frame::data(Bytes::from("event: one\n\n")),
            Frame::data(Bytes::from("event: two\n\n")),
        ]);
        let mut body = streaming(inner, true);

        // Each input chunk produces its own output frame before the next is read
        let first = poll_body(&mut body).unwrap().unwrap().into_data().unwrap();
        assert!(!first.is_empty());
        match &body {
            ZstdBody::Streaming { state, .. } => {
                assert!(state.always_flush());
                assert_eq!(state.state(), CompressState::Reading);
            }
            _ => panic!("Expected streaming body"),
        }
        let (rest, _) = drain(&mut body);
        let mut all = first.to_vec();
        all.extend_from_slice(&rest);
        assert_eq!(
            zstd::stream::decode_all(&all[..]).unwrap(),
            b"event: one\n\nevent: two\n\n"
        );
    }

    #[test]
    fn test_buffered_body() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc123".parse().unwrap());
        let mut body: ZstdBody<TestBody> =
            ZstdBody::buffered(Bytes::from("payload"), Some(trailers));

        assert_eq!(body.size_hint().exact(), Some(7));
        let (data, trailers) = drain(&mut body);
        assert_eq!(data, b"payload");
        assert!(trailers.is_some());
        assert!(body.is_end_stream());
    }

    #[test]
    fn test_failed_body_yields_error_once() {
        let mut body: ZstdBody<TestBody> = ZstdBody::failed(io::Error::other("read failed"));
        assert!(poll_body(&mut body).unwrap().is_err());
        assert!(poll_body(&mut body).is_none());
    }

    #[test]
    fn test_decoded_body() {
        let mut body: DecodedBody<TestBody> = DecodedBody::decoded(Bytes::from("decoded"));
        assert_eq!(body.size_hint().exact(), Some(7));
        let (data, _) = drain(&mut body);
        assert_eq!(data, b"decoded");
        assert!(body.is_end_stream());
    }
}
