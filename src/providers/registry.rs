//! Static provider catalog and adapter registration table.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;
use sqlx::SqlitePool;

use super::{OpenAiAdapter, ProviderAdapter};
use crate::config::{AdapterKind, ModelAccess, ProviderConfig};
use crate::error::{Error, Result};
use crate::storage::providers::{self, ServedModel};
use crate::storage::ProviderRow;

/// Capability metadata of one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCapability {
    pub name: String,
    pub provider_id: String,
    pub display_name: String,
    pub supports_vision: bool,
    pub supports_tool_calling: bool,
    pub supports_streaming: bool,
    pub free_models: Vec<String>,
    pub paid_models: Vec<String>,
    pub early_access_models: Vec<String>,
}

impl From<&ProviderConfig> for ProviderCapability {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            provider_id: config
                .provider_id
                .clone()
                .unwrap_or_else(|| config.name.to_lowercase()),
            display_name: config
                .display_name
                .clone()
                .unwrap_or_else(|| config.name.clone()),
            supports_vision: config.supports_vision,
            supports_tool_calling: config.supports_tool_calling,
            supports_streaming: config.supports_streaming,
            free_models: config.free_models.clone(),
            paid_models: config.paid_models.clone(),
            early_access_models: config.early_access_models.clone(),
        }
    }
}

impl ProviderCapability {
    fn row(&self) -> ProviderRow {
        ProviderRow {
            name: self.name.clone(),
            provider_id: self.provider_id.clone(),
            display_name: self.display_name.clone(),
            supports_vision: self.supports_vision,
            supports_tool_calling: self.supports_tool_calling,
            supports_streaming: self.supports_streaming,
        }
    }

    /// Served models with their access class, in catalog order.
    pub fn served_models(&self) -> Vec<ServedModel> {
        let tag = |models: &[String], access: ModelAccess| {
            models
                .iter()
                .map(move |m| ServedModel {
                    model: m.clone(),
                    access,
                })
                .collect::<Vec<_>>()
        };
        let mut served = tag(&self.free_models, ModelAccess::Free);
        served.extend(tag(&self.paid_models, ModelAccess::Paid));
        served.extend(tag(&self.early_access_models, ModelAccess::EarlyAccess));
        served
    }
}

/// Result of syncing the catalog into persisted state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub written: Vec<String>,
    pub unchanged: Vec<String>,
    pub removed: Vec<String>,
}

/// Registration table: provider name to capability and adapter instance.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    entries: Vec<(ProviderCapability, Arc<dyn ProviderAdapter>)>,
    index: HashMap<String, usize>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from config, choosing the adapter by `kind`.
    pub fn from_config(providers: &[ProviderConfig], client: &Client) -> Result<Self> {
        let mut registry = Self::new();
        for config in providers {
            let adapter: Arc<dyn ProviderAdapter> = match config.kind {
                AdapterKind::Openai => Arc::new(OpenAiAdapter::new(config, client.clone())),
            };
            registry.register(ProviderCapability::from(config), adapter)?;
        }
        Ok(registry)
    }

    /// Add a provider. Names must be unique.
    pub fn register(
        &mut self,
        capability: ProviderCapability,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Result<()> {
        if self.index.contains_key(&capability.name) {
            return Err(Error::Internal(format!(
                "provider '{}' registered twice",
                capability.name
            )));
        }
        self.index.insert(capability.name.clone(), self.entries.len());
        self.entries.push((capability, adapter));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.index
            .get(name)
            .map(|&i| Arc::clone(&self.entries[i].1))
    }

    pub fn capability(&self, name: &str) -> Option<&ProviderCapability> {
        self.index.get(name).map(|&i| &self.entries[i].0)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &ProviderCapability> {
        self.entries.iter().map(|(c, _)| c)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mirror the catalog into the `providers` tables.
    ///
    /// Unchanged rows are left alone; providers no longer registered are deleted.
    pub async fn sync(&self, pool: &SqlitePool) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for capability in self.capabilities() {
            let written =
                providers::sync_provider(pool, &capability.row(), &capability.served_models())
                    .await?;
            if written {
                report.written.push(capability.name.clone());
            } else {
                report.unchanged.push(capability.name.clone());
            }
        }

        let keep: Vec<String> = self.capabilities().map(|c| c.name.clone()).collect();
        report.removed = providers::remove_missing(pool, &keep).await?;

        tracing::info!(
            written = report.written.len(),
            unchanged = report.unchanged.len(),
            removed = report.removed.len(),
            "Synced provider catalog"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(c, _)| &c.name))
            .finish()
    }
}
