use crate::enrichment::enricher::ContextEnricher;
use crate::enrichment::models::{EnricherConfig, EnricherConfigOverride};
use crate::error::{ContextError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds a fresh enricher instance
pub type EnricherFactory = Arc<dyn Fn() -> Arc<dyn ContextEnricher> + Send + Sync>;

/// Descriptive metadata for a registered enricher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnricherMetadata {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub tags: Vec<String>,
}

impl EnricherMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Clone)]
struct RegistryEntry {
    factory: EnricherFactory,
    default_config: EnricherConfig,
    metadata: EnricherMetadata,
}

/// Explicitly constructed registry of enricher factories, in registration order
#[derive(Clone, Default)]
pub struct EnricherRegistry {
    entries: Vec<RegistryEntry>,
    index: HashMap<String, usize>,
}

impl EnricherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; duplicate ids are a configuration error
    pub fn register(
        &mut self,
        metadata: EnricherMetadata,
        default_config: EnricherConfig,
        factory: EnricherFactory,
    ) -> Result<()> {
        if self.index.contains_key(&metadata.id) {
            return Err(ContextError::Configuration(format!(
                "enricher '{}' already registered",
                metadata.id
            )));
        }
        default_config.validate_policy(&metadata.id)?;

        debug!(enricher_id = %metadata.id, "Registered enricher factory");
        self.index.insert(metadata.id.clone(), self.entries.len());
        self.entries.push(RegistryEntry {
            factory,
            default_config,
            metadata,
        });
        Ok(())
    }

    /// Remove an entry; later registrations keep their relative order
    pub fn unregister(&mut self, enricher_id: &str) -> bool {
        let Some(position) = self.index.remove(enricher_id) else {
            return false;
        };
        self.entries.remove(position);
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.metadata.id.clone(), i))
            .collect();
        info!(enricher_id = %enricher_id, "Unregistered enricher");
        true
    }

    /// Instantiate an enricher together with its effective config
    pub fn create(
        &self,
        enricher_id: &str,
        overrides: Option<&EnricherConfigOverride>,
    ) -> Result<(Arc<dyn ContextEnricher>, EnricherConfig)> {
        let entry = self
            .index
            .get(enricher_id)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| ContextError::EnricherNotFound(enricher_id.to_string()))?;

        let config = match overrides {
            Some(o) => o.apply(&entry.default_config),
            None => entry.default_config.clone(),
        };
        Ok(((entry.factory)(), config))
    }

    /// Instantiate every registered enricher in registration order
    pub fn create_all(
        &self,
        overrides: &HashMap<String, EnricherConfigOverride>,
    ) -> Result<Vec<(Arc<dyn ContextEnricher>, EnricherConfig)>> {
        self.entries
            .iter()
            .map(|e| self.create(&e.metadata.id, overrides.get(&e.metadata.id)))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.metadata.id.clone()).collect()
    }

    pub fn contains(&self, enricher_id: &str) -> bool {
        self.index.contains_key(enricher_id)
    }

    pub fn metadata(&self, enricher_id: &str) -> Option<&EnricherMetadata> {
        self.index.get(enricher_id).map(|&i| &self.entries[i].metadata)
    }

    pub fn default_config(&self, enricher_id: &str) -> Option<&EnricherConfig> {
        self.index
            .get(enricher_id)
            .map(|&i| &self.entries[i].default_config)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
