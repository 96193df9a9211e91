//! Middleware configuration.
//!
//! ```
//! use http_zstd_compression::ZstdConfig;
//! use std::time::Duration;
//!
//! let config = ZstdConfig::default()
//!     .with_level(6)
//!     .with_min_size(2048)
//!     .with_content_types(["application/json", "text/csv"])
//!     .with_read_timeout(Some(Duration::from_secs(30)));
//! assert!(config.validate().is_ok());
//! ```

use crate::engine::{DEFAULT_LEVEL, Zstd};
use crate::error::ConfigError;
use http::Method;
use std::time::Duration;

/// Default minimum response body size for compression.
pub const DEFAULT_MIN_SIZE: usize = 1024;

/// Default ceiling on decompressed body size (16 MiB).
pub const DEFAULT_MAX_DECOMPRESSED_SIZE: u64 = 16 * 1024 * 1024;

/// Content types compressed by default.
pub const DEFAULT_CONTENT_TYPES: [&str; 3] = ["application/json", "text/plain", "text/html"];

/// Configuration for the zstd middleware.
#[derive(Debug, Clone)]
pub struct ZstdConfig {
    /// zstd compression level.
    pub level: i32,

    /// Responses must be strictly larger than this many bytes to be compressed.
    pub min_size: usize,

    /// Media types (`type/subtype`) eligible for response compression.
    pub content_types: Vec<String>,

    /// Request methods whose zstd-encoded bodies are decoded.
    pub decode_methods: Vec<Method>,

    /// Largest decompressed request body accepted.
    pub max_decompressed_size: u64,

    /// Only compress responses for clients that list `zstd` in `Accept-Encoding`
    /// (off by default: eligibility is decided by the policy alone).
    pub require_accept_encoding: bool,

    /// Stream-compress eligible responses whose length is not known up front,
    /// once more than `min_size` bytes of the body have arrived.
    pub stream_unknown_length: bool,

    /// Deadline for each chunk read of a streaming operation (None for no deadline).
    pub read_timeout: Option<Duration>,
}

impl Default for ZstdConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            min_size: DEFAULT_MIN_SIZE,
            content_types: DEFAULT_CONTENT_TYPES.iter().map(|s| s.to_string()).collect(),
            decode_methods: vec![Method::POST, Method::PUT, Method::PATCH],
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
            require_accept_encoding: false,
            stream_unknown_length: true,
            read_timeout: None,
        }
    }
}

impl ZstdConfig {
    /// Set the compression level
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Set the minimum response size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Replace the content type allow-set
    pub fn with_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the set of methods whose bodies are decoded
    pub fn with_decode_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.decode_methods = methods.into_iter().collect();
        self
    }

    /// Set the decompressed size ceiling
    pub fn with_max_decompressed_size(mut self, size: u64) -> Self {
        self.max_decompressed_size = size;
        self
    }

    /// Enable or disable the `Accept-Encoding` requirement
    pub fn with_require_accept_encoding(mut self, enabled: bool) -> Self {
        self.require_accept_encoding = enabled;
        self
    }

    /// Enable or disable streaming compression of unknown-length responses
    pub fn with_stream_unknown_length(mut self, enabled: bool) -> Self {
        self.stream_unknown_length = enabled;
        self
    }

    /// Set the per-chunk read timeout
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Checks the configuration for values the middleware cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let levels = Zstd::level_range();
        if !levels.contains(&self.level) {
            return Err(ConfigError::Level {
                level: self.level,
                min: *levels.start(),
                max: *levels.end(),
            });
        }

        if self.content_types.is_empty() {
            return Err(ConfigError::EmptyContentTypes);
        }
        if let Some(bad) = self.content_types.iter().find(|ct| !is_media_type(ct)) {
            return Err(ConfigError::InvalidContentType(bad.clone()));
        }

        if self.decode_methods.is_empty() {
            return Err(ConfigError::EmptyMethods);
        }
        if let Some(bad) = self.decode_methods.iter().find(|m| is_bodyless(m)) {
            return Err(ConfigError::BodylessMethod(bad.clone()));
        }

        if self.max_decompressed_size == 0 {
            return Err(ConfigError::ZeroLimit);
        }
        if self.min_size as u64 >= self.max_decompressed_size {
            return Err(ConfigError::Threshold {
                min_size: self.min_size,
                limit: self.max_decompressed_size,
            });
        }

        Ok(())
    }
}

fn is_media_type(value: &str) -> bool {
    let value = value.trim();
    let Some((ty, subtype)) = value.split_once('/') else {
        return false;
    };
    let token = |s: &str| {
        !s.is_empty()
            && s.bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"!#$&-^_.+".contains(&b))
    };
    token(ty) && token(subtype)
}

fn is_bodyless(method: &Method) -> bool {
    [
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::TRACE,
        Method::CONNECT,
    ]
    .contains(method)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ZstdConfig::default();
        assert_eq!(config.min_size, 1024);
        assert_eq!(config.level, 3);
        assert!(!config.require_accept_encoding);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_level_out_of_range() {
        let config = ZstdConfig::default().with_level(100);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Level { level: 100, .. })
        ));
    }

    #[test]
    fn test_empty_content_types() {
        let config = ZstdConfig::default().with_content_types(Vec::<String>::new());
        assert_eq!(config.validate(), Err(ConfigError::EmptyContentTypes));
    }

    #[test]
    fn test_malformed_content_type() {
        for bad in ["json", "text/", "/plain", "text/plain; charset=utf-8"] {
            let config = ZstdConfig::default().with_content_types([bad]);
            assert_eq!(
                config.validate(),
                Err(ConfigError::InvalidContentType(bad.to_string()))
            );
        }
    }

    #[test]
    fn test_bodyless_decode_method() {
        let config = ZstdConfig::default().with_decode_methods([Method::POST, Method::GET]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::BodylessMethod(Method::GET))
        );

        let config = ZstdConfig::default().with_decode_methods(Vec::<Method>::new());
        assert_eq!(config.validate(), Err(ConfigError::EmptyMethods));
    }

    #[test]
    fn test_limits() {
        let config = ZstdConfig::default().with_max_decompressed_size(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroLimit));

        let config = ZstdConfig::default()
            .with_min_size(4096)
            .with_max_decompressed_size(4096);
        assert_eq!(
            config.validate(),
            Err(ConfigError::Threshold {
                min_size: 4096,
                limit: 4096
            })
        );
    }
}
