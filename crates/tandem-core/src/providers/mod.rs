//! Provider registry and model identifier resolution.

pub mod openai;
pub mod shared;

pub use openai::HttpChatTransport;
pub use shared::{
    ChatRequest, ChatTransport, DeltaStream, ProviderError, ProviderErrorKind, StreamDelta,
    ToolCallDelta,
};

use std::collections::HashMap;

use crate::config::ProviderConfig;
use crate::error::EngineError;

/// Result of resolving a `"provider/model"` identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel<'a> {
    pub provider_id: &'a str,
    pub provider: &'a ProviderConfig,
    pub model: String,
}

/// Registry of configured providers, resolved by id.
///
/// Resolution is a pure lookup: no I/O and no session mutation, so callers
/// fail before touching any conversation state.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    pub fn new(providers: HashMap<String, ProviderConfig>) -> Self {
        Self { providers }
    }

    /// Resolves a `"providerId/modelId"` identifier.
    ///
    /// Splits on the first `/`; the remainder is the model id and may itself
    /// contain slashes.
    ///
    /// # Errors
    /// `ProviderNotFound` when no configured provider matches;
    /// `ModelNotFound` when the provider enumerates its models and the
    /// requested id is not among them.
    pub fn resolve(&self, identifier: &str) -> Result<ResolvedModel<'_>, EngineError> {
        let (provider_id, model) = identifier.split_once('/').unwrap_or((identifier, ""));
        let Some((id, provider)) = self.providers.get_key_value(provider_id) else {
            return Err(EngineError::ProviderNotFound(provider_id.to_string()));
        };
        if !provider.models.is_empty() && !provider.models.iter().any(|m| m == model) {
            return Err(EngineError::ModelNotFound {
                provider: provider_id.to_string(),
                model: model.to_string(),
            });
        }
        Ok(ResolvedModel {
            provider_id: id,
            provider,
            model: model.to_string(),
        })
    }
}
