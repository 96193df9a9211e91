use crate::adapter::{Adapter, Continuation, reject};
use crate::body::{DecodedBody, StreamingBody, ZstdBody};
use crate::codec::ChunkEncoder;
use crate::error::CodecError;
use bytes::{BufMut, BytesMut};
use http::{HeaderMap, Request, Response, header, request, response};
use http_body::Body;
use http_body_util::combinators::Collect;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tower::Service;
use tracing::{debug, error, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pin_project! {
    /// Future for zstd service responses.
    pub struct ResponseFuture<S, F, ReqBody, ResBody>
    where
        ReqBody: Body,
        ResBody: Body,
    {
        #[pin]
        state: State<S, F, ReqBody, ResBody>,
        continuation: Continuation,
        adapter: Arc<Adapter>,
    }
}

pin_project! {
    #[project = StateProj]
    enum State<S, F, ReqBody, ResBody>
    where
        ReqBody: Body,
        ResBody: Body,
    {
        // Buffering an encoded request body before calling the inner service
        Decoding {
            #[pin]
            body: Limited<ReqBody>,
            buf: BytesMut,
            parts: Option<request::Parts>,
            service: Option<S>,
        },
        Calling {
            #[pin]
            future: F,
        },
        // Buffering a response body of known length for one-shot compression
        Buffering {
            #[pin]
            collect: Collect<ResBody>,
            parts: Option<response::Parts>,
        },
        // Holding the head of an unknown-length response until it outgrows
        // the minimum size or ends
        Sizing {
            body: Option<Pin<Box<ResBody>>>,
            encoder: Option<ChunkEncoder>,
            buf: BytesMut,
            parts: Option<response::Parts>,
        },
    }
}

impl<S, F, ReqBody, ResBody> ResponseFuture<S, F, ReqBody, ResBody>
where
    ReqBody: Body,
    ResBody: Body,
{
    pub(crate) fn decoding(
        service: S,
        request: Request<ReqBody>,
        continuation: Continuation,
        adapter: Arc<Adapter>,
    ) -> Self {
        let (parts, body) = request.into_parts();
        let limit = adapter.max_encoded_size();
        Self {
            state: State::Decoding {
                body: Limited::new(body, limit),
                buf: BytesMut::new(),
                parts: Some(parts),
                service: Some(service),
            },
            continuation,
            adapter,
        }
    }

    pub(crate) fn calling(future: F, continuation: Continuation, adapter: Arc<Adapter>) -> Self {
        Self {
            state: State::Calling { future },
            continuation,
            adapter,
        }
    }
}

impl<S, F, ReqBody, ResBody, E> Future for ResponseFuture<S, F, ReqBody, ResBody>
where
    S: Service<Request<DecodedBody<ReqBody>>, Future = F>,
    F: Future<Output = Result<Response<ResBody>, E>>,
    ReqBody: Body,
    ReqBody::Error: Into<BoxError>,
    ResBody: Body,
    ResBody::Error: Into<BoxError>,
{
    type Output = Result<Response<ZstdBody<ResBody>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        loop {
            match this.state.as_mut().project() {
                StateProj::Decoding {
                    mut body,
                    buf,
                    parts,
                    service,
                } => {
                    let read = loop {
                        match ready!(body.as_mut().poll_frame(cx)) {
                            Some(Ok(frame)) => {
                                if let Ok(data) = frame.into_data() {
                                    buf.put(data);
                                }
                            }
                            Some(Err(e)) => break Err(e),
                            None => break Ok(buf.split().freeze()),
                        }
                    };
                    let (Some(mut parts), Some(mut service)) = (parts.take(), service.take())
                    else {
                        panic!("ResponseFuture polled after completion");
                    };

                    let encoded = match read {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            let e = if e.is::<LengthLimitError>() {
                                let limit = this.adapter.max_encoded_size() as u64;
                                CodecError::SizeExceedsLimit {
                                    size: limit + 1,
                                    limit,
                                }
                            } else {
                                CodecError::Io(io::Error::other(e))
                            };
                            warn!(
                                method = %parts.method,
                                reason = e.reason(),
                                error = %e,
                                "failed to read request body"
                            );
                            return Poll::Ready(Ok(rejected(&e)));
                        }
                    };

                    match this.adapter.decode_request_body(&mut parts, encoded) {
                        Ok(decoded) => {
                            let request = Request::from_parts(parts, DecodedBody::decoded(decoded));
                            let future = service.call(request);
                            this.state.set(State::Calling { future });
                        }
                        Err(rejection) => {
                            return Poll::Ready(Ok(rejection.map(|b| ZstdBody::buffered(b, None))));
                        }
                    }
                }

                StateProj::Calling { future } => {
                    let response = ready!(future.poll(cx))?;
                    let (mut parts, body) = response.into_parts();

                    if !this.continuation.accepts_encoding() {
                        return Poll::Ready(Ok(passthrough(parts, body)));
                    }

                    let policy = this.adapter.policy();
                    match body.size_hint().exact() {
                        Some(len) => {
                            let len = usize::try_from(len).unwrap_or(usize::MAX);
                            if !policy.should_encode_response(&parts.headers, len) {
                                return Poll::Ready(Ok(passthrough(parts, body)));
                            }
                            this.state.set(State::Buffering {
                                collect: body.collect(),
                                parts: Some(parts),
                            });
                        }
                        None => {
                            if !this.adapter.config().stream_unknown_length
                                || !policy.may_encode_response(&parts.headers)
                            {
                                return Poll::Ready(Ok(passthrough(parts, body)));
                            }
                            let encoder = match ChunkEncoder::new(this.adapter.engine()) {
                                Ok(encoder) => encoder,
                                Err(e) => {
                                    error!(
                                        reason = e.reason(),
                                        error = %e,
                                        "compression failed, sending uncompressed response"
                                    );
                                    return Poll::Ready(Ok(passthrough(parts, body)));
                                }
                            };
                            let min_size = this.adapter.config().min_size as u64;
                            if body.size_hint().lower() > min_size {
                                return Poll::Ready(Ok(streamed(
                                    this.adapter.as_ref(),
                                    parts,
                                    Box::pin(body),
                                    encoder,
                                    BytesMut::new(),
                                )));
                            }
                            this.state.set(State::Sizing {
                                body: Some(Box::pin(body)),
                                encoder: Some(encoder),
                                buf: BytesMut::new(),
                                parts: Some(parts),
                            });
                        }
                    }
                }

                StateProj::Sizing {
                    body,
                    encoder,
                    buf,
                    parts,
                } => {
                    let Some(inner) = body.as_mut() else {
                        panic!("ResponseFuture polled after completion");
                    };
                    let min_size = this.adapter.config().min_size;
                    let head = loop {
                        match ready!(inner.as_mut().poll_frame(cx)) {
                            Some(Ok(frame)) => match frame.into_data() {
                                Ok(data) => {
                                    buf.put(data);
                                    if buf.len() > min_size {
                                        break Head::Large;
                                    }
                                }
                                Err(frame) => {
                                    if let Ok(trailers) = frame.into_trailers() {
                                        break Head::Complete(Some(trailers));
                                    }
                                }
                            },
                            Some(Err(e)) => break Head::Failed(e.into()),
                            None => break Head::Complete(None),
                        }
                    };
                    let (Some(body), Some(encoder), Some(parts)) =
                        (body.take(), encoder.take(), parts.take())
                    else {
                        panic!("ResponseFuture polled after completion");
                    };

                    let response = match head {
                        Head::Large => {
                            streamed(this.adapter.as_ref(), parts, body, encoder, buf.split())
                        }
                        Head::Complete(trailers) => {
                            debug!(len = buf.len(), "response below minimum size, not compressing");
                            Response::from_parts(
                                parts,
                                ZstdBody::buffered(buf.split().freeze(), trailers),
                            )
                        }
                        Head::Failed(e) => {
                            error!(error = %e, "failed to read response body");
                            Response::from_parts(parts, ZstdBody::failed(io::Error::other(e)))
                        }
                    };
                    return Poll::Ready(Ok(response));
                }

                StateProj::Buffering { collect, parts } => {
                    let collected = ready!(collect.poll(cx));
                    let Some(mut parts) = parts.take() else {
                        panic!("ResponseFuture polled after completion");
                    };

                    let body = match collected {
                        Ok(collected) => {
                            let trailers = collected.trailers().cloned();
                            let body = this.adapter.encode_response_body(
                                *this.continuation,
                                &mut parts,
                                collected.to_bytes(),
                            );
                            ZstdBody::buffered(body, trailers)
                        }
                        Err(e) => {
                            let e: BoxError = e.into();
                            error!(error = %e, "failed to read response body");
                            ZstdBody::failed(io::Error::other(e))
                        }
                    };
                    return Poll::Ready(Ok(Response::from_parts(parts, body)));
                }
            }
        }
    }
}

/// How the head of an unknown-length response ended.
enum Head {
    /// More than the minimum size arrived; the rest is streamed.
    Large,
    /// The whole body arrived without exceeding the minimum size.
    Complete(Option<HeaderMap>),
    Failed(BoxError),
}

/// Marks the response encoded and compresses `head` followed by the rest of `body`.
fn streamed<B>(
    adapter: &Adapter,
    mut parts: response::Parts,
    body: Pin<Box<B>>,
    encoder: ChunkEncoder,
    head: BytesMut,
) -> Response<ZstdBody<B>> {
    let always_flush = is_always_flush(&parts.headers);
    adapter.mark_encoded(&mut parts.headers, None);
    debug!(always_flush, "streaming response compression");
    let state = StreamingBody::new(encoder, always_flush).with_prefix(head.freeze());
    Response::from_parts(parts, ZstdBody::streaming(body, state))
}

fn passthrough<B>(parts: response::Parts, body: B) -> Response<ZstdBody<B>> {
    Response::from_parts(parts, ZstdBody::passthrough(body))
}

fn rejected<B>(err: &CodecError) -> Response<ZstdBody<B>> {
    reject(err).map(|b| ZstdBody::buffered(b, None))
}

/// Checks whether every compressed chunk must be flushed immediately.
fn is_always_flush(headers: &header::HeaderMap) -> bool {
    let no_buffering = headers
        .get("x-accel-buffering")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no"));

    no_buffering
        || headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"))
}
