use crate::adapter::Adapter;
use crate::body::{DecodedBody, ZstdBody};
use crate::future::ResponseFuture;
use http::{Request, Response};
use http_body::Body;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A Tower service that decodes zstd request bodies and compresses response
/// bodies.
#[derive(Debug, Clone)]
pub struct ZstdService<S> {
    inner: S,
    adapter: Arc<Adapter>,
}

impl<S> ZstdService<S> {
    /// Creates a new zstd service wrapping the given inner service.
    pub fn new(inner: S, adapter: Arc<Adapter>) -> Self {
        Self { inner, adapter }
    }

    /// Returns the adapter shared by every exchange.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ZstdService<S>
where
    S: Service<Request<DecodedBody<ReqBody>>, Response = Response<ResBody>> + Clone,
    ReqBody: Body,
    ReqBody::Error: Into<BoxError>,
    ResBody: Body,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<ZstdBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S, S::Future, ReqBody, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let continuation = self.adapter.continuation(req.headers());
        let adapter = self.adapter.clone();

        if self
            .adapter
            .policy()
            .should_decode_request(req.method(), req.headers())
        {
            // The body has to be buffered first; keep the service that was
            // driven to readiness for the deferred call.
            let clone = self.inner.clone();
            let inner = std::mem::replace(&mut self.inner, clone);
            return ResponseFuture::decoding(inner, req, continuation, adapter);
        }

        let future = self.inner.call(req.map(DecodedBody::passthrough));
        ResponseFuture::calling(future, continuation, adapter)
    }
}
