use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// The engine operation that was running when a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Creating or configuring an engine session.
    Init,
    /// Compressing input.
    Compress,
    /// Flushing buffered compressed output.
    Flush,
    /// Closing a compressed frame.
    Finish,
    /// Decompressing input.
    Decompress,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Init => "init",
            Phase::Compress => "compress",
            Phase::Flush => "flush",
            Phase::Finish => "finish",
            Phase::Decompress => "decompress",
        })
    }
}

/// Errors produced while compressing or decompressing a body.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input is not a valid compressed frame.
    #[error("invalid frame")]
    InvalidFrame,

    /// The frame header does not declare its decompressed size.
    #[error("unknown size")]
    UnknownSize,

    /// The (declared or produced) output size exceeds the configured ceiling.
    #[error("size exceeds limit: {size} > {limit}")]
    SizeExceedsLimit {
        /// Size that was requested or reached.
        size: u64,
        /// Configured ceiling.
        limit: u64,
    },

    /// The compression engine reported an error.
    #[error("engine failure during {phase}: {message}")]
    Engine {
        /// Operation that failed.
        phase: Phase,
        /// Message reported by the engine.
        message: String,
    },

    /// An output buffer could not be allocated.
    #[error("allocation failure: {0} bytes")]
    Allocation(usize),

    /// Reading the source or writing the sink failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A chunk read did not complete within the configured deadline.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled at a chunk boundary.
    #[error("operation cancelled")]
    Cancelled,
}

impl CodecError {
    pub(crate) fn engine(phase: Phase, message: impl fmt::Display) -> Self {
        CodecError::Engine {
            phase,
            message: message.to_string(),
        }
    }

    /// Returns a short, stable name for the failure reason.
    pub fn reason(&self) -> &'static str {
        match self {
            CodecError::InvalidFrame => "invalid frame",
            CodecError::UnknownSize => "unknown size",
            CodecError::SizeExceedsLimit { .. } => "size exceeds limit",
            CodecError::Engine { .. } => "engine failure",
            CodecError::Allocation(_) => "allocation failure",
            CodecError::Io(_) => "io",
            CodecError::Timeout(_) => "timeout",
            CodecError::Cancelled => "cancelled",
        }
    }

    /// Returns the engine phase for engine failures.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            CodecError::Engine { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Invalid middleware configuration, detected when the configuration is validated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Compression level is outside the range supported by the engine.
    #[error("compression level {level} outside {min}..={max}")]
    Level {
        /// Requested level.
        level: i32,
        /// Lowest supported level.
        min: i32,
        /// Highest supported level.
        max: i32,
    },

    /// No content types are eligible for compression.
    #[error("content type allow-set is empty")]
    EmptyContentTypes,

    /// A content type entry is not a `type/subtype` media type.
    #[error("invalid content type: {0:?}")]
    InvalidContentType(String),

    /// No request methods are eligible for decoding.
    #[error("decode method set is empty")]
    EmptyMethods,

    /// A decode method is not expected to carry a request body.
    #[error("method {0} does not carry a decodable body")]
    BodylessMethod(http::Method),

    /// The decompressed-size ceiling is zero.
    #[error("max decompressed size must be greater than zero")]
    ZeroLimit,

    /// The compression threshold is not below the decompressed-size ceiling.
    #[error("min size {min_size} must be below max decompressed size {limit}")]
    Threshold {
        /// Configured threshold.
        min_size: usize,
        /// Configured ceiling.
        limit: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_names() {
        assert_eq!(CodecError::InvalidFrame.reason(), "invalid frame");
        assert_eq!(CodecError::UnknownSize.reason(), "unknown size");
        assert_eq!(
            CodecError::SizeExceedsLimit { size: 2, limit: 1 }.reason(),
            "size exceeds limit"
        );
        assert_eq!(CodecError::Allocation(8).reason(), "allocation failure");
    }

    #[test]
    fn test_engine_error_display() {
        let err = CodecError::engine(Phase::Finish, "Destination buffer is too small");
        assert_eq!(err.phase(), Some(Phase::Finish));
        assert_eq!(
            err.to_string(),
            "engine failure during finish: Destination buffer is too small"
        );
    }
}
