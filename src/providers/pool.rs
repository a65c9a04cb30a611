//! Sub-provider pool: the upstream credentials behind each provider.
//!
//! Selection spreads load by always picking the least used credential, ties
//! broken by the one idle the longest. Credentials rejected by the upstream
//! with an account-level status are disabled until re-enabled by an operator.

use sqlx::SqlitePool;

use crate::config::ProviderConfig;
use crate::error::Result;
use crate::storage::{self, sub_providers, SubProvider};

/// Whether an upstream status means the credential itself is unusable.
pub fn disables_credential(status: u16) -> bool {
    matches!(status, 401 | 403 | 404 | 429)
}

/// Smallest `(usage, last_used)` among the candidates.
pub fn least_used(candidates: &[SubProvider]) -> Option<&SubProvider> {
    candidates.iter().min_by_key(|s| (s.usage, s.last_used))
}

/// Credential pool backed by the `sub_providers` table.
#[derive(Debug, Clone)]
pub struct SubProviderPool {
    db: SqlitePool,
}

impl SubProviderPool {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Insert every configured credential that is not stored yet.
    ///
    /// A credential without an explicit model list serves every model of its provider.
    pub async fn seed(&self, providers: &[ProviderConfig]) -> Result<usize> {
        let mut seeded = 0;
        for provider in providers {
            let all_models = provider.all_models();
            for credential in &provider.credentials {
                let models = if credential.models.is_empty() {
                    &all_models
                } else {
                    &credential.models
                };
                sub_providers::seed(
                    &self.db,
                    &provider.name,
                    credential.api_key.expose_secret(),
                    credential.organization.as_deref(),
                    models,
                )
                .await?;
                seeded += 1;
            }
        }
        tracing::info!(count = seeded, "Seeded sub-provider credentials");
        Ok(seeded)
    }

    /// Least used working credential of `provider` serving `model`.
    pub async fn get_available_provider(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<Option<SubProvider>> {
        let candidates = sub_providers::usable_for(&self.db, provider, model).await?;
        Ok(least_used(&candidates).cloned())
    }

    /// Count one use of a credential.
    pub async fn record_use(&self, credential: &str) -> Result<()> {
        sub_providers::record_use(&self.db, credential, storage::unix_now()).await?;
        Ok(())
    }

    pub async fn disable(&self, credential: &str) -> Result<()> {
        let affected = sub_providers::set_working(&self.db, credential, false).await?;
        tracing::warn!(rows = affected, "Disabled sub-provider credential");
        Ok(())
    }

    pub async fn enable(&self, credential: &str) -> Result<()> {
        sub_providers::set_working(&self.db, credential, true).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_memory_pool;

    fn sub(id: i64, usage: i64, last_used: i64) -> SubProvider {
        SubProvider {
            id,
            provider: "alpha".to_string(),
            credential: format!("sk-{id}"),
            organization: None,
            usage,
            last_used,
            working: None,
        }
    }

    #[test]
    fn test_least_used_prefers_usage_then_age() {
        let candidates = vec![sub(1, 5, 10), sub(2, 3, 50), sub(3, 3, 20)];
        assert_eq!(least_used(&candidates).unwrap().id, 3);
        assert!(least_used(&[]).is_none());
    }

    #[test]
    fn test_disabling_statuses() {
        for status in [401, 403, 404, 429] {
            assert!(disables_credential(status), "{status} should disable");
        }
        for status in [400, 500, 502, 503] {
            assert!(!disables_credential(status), "{status} should not disable");
        }
    }

    #[tokio::test]
    async fn test_usage_rotates_between_credentials() {
        let db = init_memory_pool().await.unwrap();
        let models = vec!["m".to_string()];
        sub_providers::seed(&db, "alpha", "sk-a", None, &models).await.unwrap();
        sub_providers::seed(&db, "alpha", "sk-b", None, &models).await.unwrap();
        let pool = SubProviderPool::new(db);

        let first = pool.get_available_provider("alpha", "m").await.unwrap().unwrap();
        pool.record_use(&first.credential).await.unwrap();
        let second = pool.get_available_provider("alpha", "m").await.unwrap().unwrap();
        assert_ne!(first.credential, second.credential);
    }

    #[tokio::test]
    async fn test_disabled_pool_is_empty() {
        let db = init_memory_pool().await.unwrap();
        sub_providers::seed(&db, "alpha", "sk-a", None, &["m".to_string()])
            .await
            .unwrap();
        let pool = SubProviderPool::new(db);

        pool.disable("sk-a").await.unwrap();
        assert!(pool.get_available_provider("alpha", "m").await.unwrap().is_none());

        pool.enable("sk-a").await.unwrap();
        assert!(pool.get_available_provider("alpha", "m").await.unwrap().is_some());
    }
}
