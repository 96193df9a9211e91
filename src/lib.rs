//! Zstd request decoding and response compression middleware for Tower.
//!
//! This crate provides a Tower layer that decodes request bodies sent with
//! `Content-Encoding: zstd` and compresses eligible response bodies with zstd.
//! The same building blocks are exposed on their own: a one-shot
//! [`Transform`] for in-memory bodies, a streaming [`Codec`] for async readers
//! and writers, and an [`Adapter`] that runs both phases of an exchange around
//! a synchronous handler.
//!
//! # Example
//!
//! ```ignore
//! use http_zstd_compression::{ZstdConfig, ZstdLayer};
//! use tower::ServiceBuilder;
//!
//! let layer = ZstdLayer::from_config(ZstdConfig::default().with_min_size(2048))?;
//! let service = ServiceBuilder::new()
//!     .layer(layer)
//!     .service(my_service);
//! ```
//!
//! # Request Rules
//!
//! A request body is decoded when:
//! - `Content-Encoding` is `zstd`
//! - The method is one of the configured decode methods (default: POST, PUT, PATCH)
//!
//! A body that is not a valid zstd frame, or whose frame does not declare its
//! decompressed size, is answered with `400 Invalid compressed data` without
//! calling the wrapped service. A body that would decompress beyond the
//! configured ceiling (default: 16 MiB), or whose encoded form already exceeds
//! the compressed bound of that ceiling, is answered with `413`.
//!
//! # Response Rules
//!
//! The middleware will **not** compress responses when:
//! - `Accept-Encoding` does not admit `zstd`, when the client requirement is enabled
//! - `Content-Encoding` header is already set
//! - `Content-Range` header is present (range responses)
//! - `Content-Type` is not in the configured set (default: JSON, plain text, HTML)
//! - The body is not larger than the minimum size (default: 1024 bytes)
//!
//! Failed compression is logged and the original response is sent unchanged.
//! Responses whose length is not known up front are held until more than the
//! minimum size has arrived, then compressed while they stream; one that ends
//! first is sent as is. Each chunk is flushed immediately when
//! `X-Accel-Buffering: no` is present or `Content-Type` is `text/event-stream`.
//!
//! # Response Modifications
//!
//! When compression is applied:
//! - `Content-Encoding` header is set to `zstd`
//! - `Content-Length` header is set to the compressed size, or removed when streaming
//! - `Accept-Ranges` header is removed
//! - `Vary` header includes `Accept-Encoding`, when the client requirement is enabled

#![deny(missing_docs)]

mod adapter;
mod body;
mod codec;
mod config;
mod engine;
mod error;
mod future;
mod layer;
mod policy;
mod service;
mod transform;

pub use adapter::{Adapter, Continuation};
pub use body::{DecodedBody, StreamingBody, ZstdBody};
pub use codec::{Codec, StreamOptions};
pub use config::{
    DEFAULT_CONTENT_TYPES, DEFAULT_MAX_DECOMPRESSED_SIZE, DEFAULT_MIN_SIZE, ZstdConfig,
};
pub use engine::{DEFAULT_LEVEL, DecodeSession, EncodeSession, Engine, FrameSize, Step, Zstd};
pub use error::{CodecError, CodecResult, ConfigError, Phase};
pub use future::ResponseFuture;
pub use layer::ZstdLayer;
pub use policy::{Policy, Subject};
pub use service::ZstdService;
pub use transform::Transform;
