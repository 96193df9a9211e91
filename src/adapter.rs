//! Applies the policy and transform to one request/response exchange.
//!
//! The adapter is a two-phase handler: [`Adapter::inbound`] decodes the request
//! body and returns a [`Continuation`], and [`Adapter::outbound`] takes that
//! continuation together with the downstream response. [`Adapter::apply`] runs
//! both phases around a synchronous downstream handler; the tower
//! [`ZstdService`](crate::ZstdService) drives the same phases asynchronously.

use crate::codec::Codec;
use crate::config::ZstdConfig;
use crate::engine::{Engine, Zstd};
use crate::error::{CodecError, ConfigError};
use crate::policy::{Policy, accepts_encoding};
use crate::transform::Transform;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, header, request, response};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// State carried from the inbound phase to the outbound phase of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continuation {
    accepts_encoding: bool,
}

impl Continuation {
    /// Returns whether the client accepts an encoded response.
    pub fn accepts_encoding(&self) -> bool {
        self.accepts_encoding
    }
}

/// Zstd request decoding and response compression for buffered messages.
#[derive(Debug, Clone)]
pub struct Adapter {
    config: ZstdConfig,
    policy: Policy,
    transform: Transform,
    codec: Codec,
    engine: Arc<dyn Engine>,
}

impl Adapter {
    /// Creates an adapter using the zstd engine.
    pub fn new(config: ZstdConfig) -> Result<Self, ConfigError> {
        let engine = Arc::new(Zstd::new(config.level));
        Self::with_engine(config, engine)
    }

    /// Creates an adapter using `engine`.
    pub fn with_engine(config: ZstdConfig, engine: Arc<dyn Engine>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, engine))
    }

    /// Builds an adapter from a configuration that is already known to be valid.
    pub(crate) fn build(config: ZstdConfig, engine: Arc<dyn Engine>) -> Self {
        let policy = Policy::new(engine.encoding(), &config);
        let transform = Transform::new(engine.clone(), config.max_decompressed_size);
        let codec = Codec::new(engine.clone(), config.max_decompressed_size)
            .with_read_timeout(config.read_timeout);
        Self {
            config,
            policy,
            transform,
            codec,
            engine,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ZstdConfig {
        &self.config
    }

    /// Returns the policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Returns the one-shot transform.
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Returns the streaming codec.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub(crate) fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    /// Largest encoded request body read before the request is refused; a
    /// frame within the ceiling never compresses beyond this bound.
    pub(crate) fn max_encoded_size(&self) -> usize {
        let limit = usize::try_from(self.config.max_decompressed_size).unwrap_or(usize::MAX);
        self.engine.compress_bound(limit).max(limit)
    }

    /// Runs both phases around `downstream`.
    ///
    /// If the request body cannot be decoded, `downstream` is not called and a
    /// client error response is returned.
    pub fn apply<F>(&self, request: Request<Bytes>, downstream: F) -> Response<Bytes>
    where
        F: FnOnce(Request<Bytes>) -> Response<Bytes>,
    {
        match self.inbound(request) {
            Ok((request, continuation)) => self.outbound(continuation, downstream(request)),
            Err(rejection) => rejection,
        }
    }

    /// Decodes the request body when the policy asks for it.
    pub fn inbound(
        &self,
        request: Request<Bytes>,
    ) -> Result<(Request<Bytes>, Continuation), Response<Bytes>> {
        let continuation = self.continuation(request.headers());
        let (mut parts, body) = request.into_parts();
        let body = if self.policy.should_decode_request(&parts.method, &parts.headers) {
            self.decode_request_body(&mut parts, body)?
        } else {
            body
        };
        Ok((Request::from_parts(parts, body), continuation))
    }

    /// Compresses the response body when the policy asks for it.
    ///
    /// Compression failures are logged and the response is returned unchanged.
    pub fn outbound(&self, continuation: Continuation, response: Response<Bytes>) -> Response<Bytes> {
        let (mut parts, body) = response.into_parts();
        let body = self.encode_response_body(continuation, &mut parts, body);
        Response::from_parts(parts, body)
    }

    /// Builds the continuation for a request with these headers.
    pub fn continuation(&self, headers: &HeaderMap) -> Continuation {
        let accepts = !self.config.require_accept_encoding
            || headers
                .get_all(header::ACCEPT_ENCODING)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| accepts_encoding(v, self.policy.encoding()));
        Continuation {
            accepts_encoding: accepts,
        }
    }

    /// Decodes an encoded request body, rewriting the request headers.
    pub(crate) fn decode_request_body(
        &self,
        parts: &mut request::Parts,
        body: Bytes,
    ) -> Result<Bytes, Response<Bytes>> {
        if body.is_empty() {
            return Ok(body);
        }
        match self.transform.decompress(&body) {
            Ok(decoded) => {
                debug!(
                    method = %parts.method,
                    encoded = body.len(),
                    decoded = decoded.len(),
                    "request body decoded"
                );
                parts.headers.remove(header::CONTENT_ENCODING);
                parts
                    .headers
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(decoded.len()));
                Ok(decoded)
            }
            Err(e) => {
                warn!(
                    method = %parts.method,
                    uri = %parts.uri,
                    reason = e.reason(),
                    error = %e,
                    "rejecting request with undecodable body"
                );
                Err(reject(&e))
            }
        }
    }

    /// Compresses an eligible response body, rewriting the response headers.
    pub(crate) fn encode_response_body(
        &self,
        continuation: Continuation,
        parts: &mut response::Parts,
        body: Bytes,
    ) -> Bytes {
        if body.is_empty()
            || !continuation.accepts_encoding
            || !self.policy.should_encode_response(&parts.headers, body.len())
        {
            return body;
        }
        match self.transform.compress(&body) {
            Ok(encoded) => {
                debug!(
                    original = body.len(),
                    encoded = encoded.len(),
                    "response body compressed"
                );
                self.mark_encoded(&mut parts.headers, Some(encoded.len()));
                encoded
            }
            Err(e) => {
                error!(
                    reason = e.reason(),
                    error = %e,
                    "compression failed, sending uncompressed response"
                );
                body
            }
        }
    }

    /// Attaches the encoding marker and fixes up the headers that depend on the
    /// body bytes. `len` is the encoded length, when known.
    pub(crate) fn mark_encoded(&self, headers: &mut HeaderMap, len: Option<usize>) {
        headers.insert(
            header::CONTENT_ENCODING,
            HeaderValue::from_static(self.policy.encoding()),
        );
        match len {
            Some(len) => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
            None => {
                headers.remove(header::CONTENT_LENGTH);
            }
        }
        headers.remove(header::ACCEPT_RANGES);
        if self.config.require_accept_encoding {
            add_vary_accept_encoding(headers);
        }
    }
}

/// Builds the client error response for a request body that failed to decode.
pub(crate) fn reject(err: &CodecError) -> Response<Bytes> {
    let (status, message) = match err {
        CodecError::SizeExceedsLimit { .. } => {
            (StatusCode::PAYLOAD_TOO_LARGE, "Decompressed body too large")
        }
        _ => (StatusCode::BAD_REQUEST, "Invalid compressed data"),
    };
    let mut response = Response::new(Bytes::from_static(message.as_bytes()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Appends `accept-encoding` to `Vary` unless an existing value already lists
/// it or is `*`.
fn add_vary_accept_encoding(headers: &mut HeaderMap) {
    let listed = headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .any(|name| name == "*" || name.eq_ignore_ascii_case("accept-encoding"));
    if !listed {
        headers.append(header::VARY, HeaderValue::from_static("accept-encoding"));
    }
}
