//! Provider registry.
//!
//! Holds all registered LLM provider instances and resolves model specs of
//! the form `provider/model` (or bare `provider`) to an adapter plus an
//! optional model name for the request.

use std::collections::HashMap;
use std::sync::Arc;

use agently_domain::error::{Error, Result};

use crate::traits::LlmProvider;

/// Holds instantiated LLM providers keyed by provider id.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default_id: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. The first registration becomes the default.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        let id = provider.provider_id().to_string();
        if self.default_id.is_none() {
            self.default_id = Some(id.clone());
        }
        self.providers.insert(id, provider);
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(provider_id).cloned()
    }

    /// Resolve a model spec to `(provider, model_name)`.
    ///
    /// Resolution order: explicit `provider/model` spec, bare provider id,
    /// then the default provider with the spec passed through as the model
    /// name, then the default provider alone.
    pub fn resolve(&self, model_spec: Option<&str>) -> Result<(Arc<dyn LlmProvider>, Option<String>)> {
        if let Some(spec) = model_spec {
            let provider_id = spec.split('/').next().unwrap_or(spec);
            if let Some(p) = self.providers.get(provider_id) {
                let model_name = spec.split_once('/').map(|(_, m)| m.to_string());
                return Ok((p.clone(), model_name));
            }
            if let Some(p) = self.default_provider() {
                return Ok((p, Some(spec.to_string())));
            }
        } else if let Some(p) = self.default_provider() {
            return Ok((p, None));
        }
        Err(Error::Config(
            "no LLM providers registered; register at least one at startup".into(),
        ))
    }

    fn default_provider(&self) -> Option<Arc<dyn LlmProvider>> {
        self.default_id
            .as_deref()
            .and_then(|id| self.providers.get(id).cloned())
    }
}
