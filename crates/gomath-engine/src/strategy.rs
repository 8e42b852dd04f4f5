use std::fmt;
use std::sync::Arc;

use crate::gateway::{ModelGateway, OpenAiGateway};

/// How a pipeline stage reaches its model, decided once at construction.
#[derive(Clone)]
pub enum ProviderStrategy {
    /// Provider or model left empty in the configuration.
    Unconfigured,
    /// A provider we have no client for; stages answer with fixed content.
    Stub,
    /// Supported provider, but no API key could be resolved.
    MissingKey,
    Remote(Arc<dyn ModelGateway>),
}

impl ProviderStrategy {
    pub fn select(
        provider: &str,
        model: &str,
        api_base: &str,
        api_key: &str,
        supported: impl Fn(&str) -> bool,
    ) -> Self {
        if provider.trim().is_empty() || model.trim().is_empty() {
            return Self::Unconfigured;
        }
        if !supported(provider.trim()) {
            return Self::Stub;
        }
        if api_key.trim().is_empty() {
            return Self::MissingKey;
        }
        Self::Remote(Arc::new(OpenAiGateway::new(
            api_base,
            api_key.trim(),
            model.trim(),
        )))
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Stub => "stub",
            Self::MissingKey => "missing-key",
            Self::Remote(gateway) => gateway.name(),
        }
    }
}

impl fmt::Debug for ProviderStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
