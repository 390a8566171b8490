//! Name-keyed provider registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::{FetchError, Provider, get_data};
use crate::series::CanonicalTimeSeries;

/// Lookup table from provider name to adapter.
///
/// Names iterate in sorted order.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under its own name, replacing any previous
    /// adapter with that name.
    #[tracing::instrument(skip(self, provider), fields(provider = provider.name()))]
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        debug!(
            variables = provider.available_variables().len(),
            "registering provider"
        );
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Looks up a provider by name (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::UnknownProvider`] if nothing is registered
    /// under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, FetchError> {
        self.providers
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| FetchError::unknown_provider(name))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Looks up `provider` and runs [`get_data`] against it.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::UnknownProvider`] or any request error from
    /// [`get_data`].
    pub async fn get_data(
        &self,
        provider: &str,
        gauge_id: &str,
        variable_id: &str,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<CanonicalTimeSeries, FetchError> {
        let adapter = self.get(provider)?;
        get_data(adapter.as_ref(), gauge_id, variable_id, start, end).await
    }
}
