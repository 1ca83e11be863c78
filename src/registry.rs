//! Service registry and selection engine.
//!
//! [`Registry::build`] turns the configuration document into an immutable
//! model-name → entry index. Every request flow reads the same registry
//! concurrently; the only mutation after build happens inside each entry's
//! governor. Lookups hand out [`ModelDetails`] values, which are cheap clones
//! sharing the underlying [`ServiceEntry`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::{Configuration, LoadBalanceStrategy, ServiceConfig};
use crate::error::GatewayError;
use crate::governor::Governor;

/// One declared backend entry, wired to its governor.
///
/// Owned by the registry behind an `Arc`; immutable except the governor's
/// internal counters.
#[derive(Debug)]
pub struct ServiceEntry {
    pub models: Vec<String>,
    pub enabled: bool,
    pub credentials: HashMap<String, String>,
    pub server_url: Option<String>,
    pub model_map: HashMap<String, String>,
    pub governor: Governor,
    /// Acquire deadline for this entry's governor.
    pub timeout: Duration,
}

impl ServiceEntry {
    fn from_config(entry: ServiceConfig) -> Self {
        let governor = Governor::from_limit(&entry.limit);
        let timeout = entry.limit.effective_timeout();
        Self {
            models: entry.models,
            enabled: entry.enabled,
            credentials: entry.credentials,
            server_url: entry.server_url,
            model_map: entry.model_map,
            governor,
            timeout,
        }
    }

    /// Translate a requested model name into this entry's backend name.
    /// Names without a mapping pass through unchanged.
    pub fn resolve_alias<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_map
            .get(requested)
            .map(String::as_str)
            .unwrap_or(requested)
    }
}

/// Lookup result: a service identity plus a shared reference to its entry.
///
/// Created fresh per lookup and discarded after use; all `ModelDetails` for
/// one entry share the same governor.
#[derive(Debug, Clone)]
pub struct ModelDetails {
    pub service: String,
    pub entry: Arc<ServiceEntry>,
}

/// Immutable model-name → entry index.
#[derive(Debug)]
pub struct Registry {
    index: HashMap<String, Vec<ModelDetails>>,
    strategy: LoadBalanceStrategy,
}

impl Registry {
    /// Build the index from a configuration document.
    ///
    /// Every declared entry is indexed, enabled or not, so that a known model
    /// whose entries are all disabled is distinguishable from an unknown
    /// model. Each entry gets exactly one governor, shared by all of its
    /// aliases.
    pub fn build(config: &Configuration) -> Self {
        let strategy = config.strategy();
        let mut index: HashMap<String, Vec<ModelDetails>> = HashMap::new();

        for (service, entries) in &config.services {
            for entry_conf in entries {
                let entry = Arc::new(ServiceEntry::from_config(entry_conf.clone()));
                tracing::info!(
                    service = service.as_str(),
                    models = ?entry.models,
                    enabled = entry.enabled,
                    mode = entry.governor.mode(),
                    timeout_ms = entry.timeout.as_millis() as u64,
                    "registered service entry"
                );
                for model in &entry.models {
                    index.entry(model.clone()).or_default().push(ModelDetails {
                        service: service.clone(),
                        entry: Arc::clone(&entry),
                    });
                }
            }
        }

        Self { index, strategy }
    }

    /// Strategy declared in the configuration document.
    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    /// Model names present in the index, in no particular order.
    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// All entries declared under a model name, enabled or not.
    pub fn lookup_all(&self, model: &str) -> Result<&[ModelDetails], GatewayError> {
        self.index
            .get(model)
            .map(Vec::as_slice)
            .ok_or_else(|| GatewayError::ModelNotFound(model.to_string()))
    }

    /// Pick one enabled entry for a model, per the given strategy.
    pub fn lookup_enabled(
        &self,
        model: &str,
        strategy: LoadBalanceStrategy,
    ) -> Result<ModelDetails, GatewayError> {
        let all = self.lookup_all(model)?;
        let enabled: Vec<&ModelDetails> = all.iter().filter(|d| d.entry.enabled).collect();
        if enabled.is_empty() {
            return Err(GatewayError::NoEnabledService(model.to_string()));
        }
        Ok(select(strategy, &enabled).clone())
    }

    /// Uniformly sample one enabled entry across all entries of all models.
    ///
    /// Entry-uniform, not model-name-uniform: an entry listed under many
    /// aliases is proportionally more likely to be picked.
    pub fn random_enabled(&self) -> Result<ModelDetails, GatewayError> {
        let enabled: Vec<&ModelDetails> = self
            .index
            .values()
            .flatten()
            .filter(|d| d.entry.enabled)
            .collect();
        if enabled.is_empty() {
            return Err(GatewayError::NoEnabledService("<any>".to_string()));
        }
        let idx = rand::thread_rng().gen_range(0..enabled.len());
        Ok(enabled[idx].clone())
    }

    /// [`Registry::random_enabled`] plus a uniformly chosen alias from the
    /// picked entry. Serves the `"random"` model name at the HTTP surface.
    pub fn random_enabled_alias(&self) -> Result<(ModelDetails, String), GatewayError> {
        let details = self.random_enabled()?;
        let idx = rand::thread_rng().gen_range(0..details.entry.models.len());
        let model = details.entry.models[idx].clone();
        Ok((details, model))
    }
}

fn select<'a>(
    strategy: LoadBalanceStrategy,
    enabled: &'a [&'a ModelDetails],
) -> &'a ModelDetails {
    match strategy {
        LoadBalanceStrategy::First => enabled[0],
        LoadBalanceStrategy::Random => {
            enabled[rand::thread_rng().gen_range(0..enabled.len())]
        }
    }
}
