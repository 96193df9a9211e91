use crate::adapter::Adapter;
use crate::config::ZstdConfig;
use crate::engine::{Engine, Zstd};
use crate::error::ConfigError;
use crate::service::ZstdService;
use std::sync::Arc;
use tower::Layer;

/// A Tower layer that decodes zstd request bodies and compresses response
/// bodies.
///
/// Requests marked `Content-Encoding: zstd` are decoded before they reach the
/// wrapped service; eligible responses are compressed for clients that accept
/// zstd. All services produced by one layer share a single [`Adapter`].
#[derive(Debug, Clone)]
pub struct ZstdLayer {
    adapter: Arc<Adapter>,
}

impl ZstdLayer {
    /// Creates a new zstd layer with default settings.
    ///
    /// Responses larger than 1024 bytes with a JSON, plain text or HTML
    /// content type are compressed at level 3.
    pub fn new() -> Self {
        let config = ZstdConfig::default();
        let engine = Arc::new(Zstd::new(config.level));
        Self {
            adapter: Arc::new(Adapter::build(config, engine)),
        }
    }

    /// Creates a layer from `config`, validating it first.
    pub fn from_config(config: ZstdConfig) -> Result<Self, ConfigError> {
        Ok(Self::from_adapter(Adapter::new(config)?))
    }

    /// Creates a layer that transforms bodies with `engine`.
    pub fn with_engine(config: ZstdConfig, engine: Arc<dyn Engine>) -> Result<Self, ConfigError> {
        Ok(Self::from_adapter(Adapter::with_engine(config, engine)?))
    }

    /// Creates a layer around an existing adapter.
    pub fn from_adapter(adapter: Adapter) -> Self {
        Self {
            adapter: Arc::new(adapter),
        }
    }

    /// Returns the adapter shared by the produced services.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }
}

impl Default for ZstdLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for ZstdLayer {
    type Service = ZstdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ZstdService::new(inner, self.adapter.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layer_uses_default_config() {
        let layer = ZstdLayer::default();
        assert_eq!(layer.adapter().config().level, 3);
        assert_eq!(layer.adapter().config().min_size, 1024);
        assert!(layer.adapter().config().validate().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = ZstdLayer::from_config(ZstdConfig::default().with_level(1000)).unwrap_err();
        assert!(matches!(err, ConfigError::Level { level: 1000, .. }));
    }

    #[test]
    fn test_services_share_adapter() {
        let layer = ZstdLayer::from_config(ZstdConfig::default().with_min_size(64)).unwrap();
        let a = layer.layer(());
        let b = layer.layer(());
        assert!(std::ptr::eq(a.adapter(), b.adapter()));
        assert_eq!(a.adapter().config().min_size, 64);
    }
}
