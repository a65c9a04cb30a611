//! Provider selection logic.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use sqlx::SqlitePool;

use super::health::health_score;
use crate::storage::{self, providers, usage, ProviderRow};

/// Pick an index with probability proportional to its weight.
///
/// Draws uniformly in `[0, total)` and walks the cumulative sum, never
/// landing on a zero weight. When every weight is zero the choice is uniform.
/// Returns `None` only for an empty slice.
pub fn weighted_choice<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }

    let total: f64 = weights.iter().map(|w| w.max(0.0)).sum();
    if !total.is_finite() || total <= 0.0 {
        return Some(rng.gen_range(0..weights.len()));
    }

    let draw = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    let mut last_positive = None;
    for (i, weight) in weights.iter().enumerate() {
        if *weight <= 0.0 {
            continue;
        }
        cumulative += weight;
        last_positive = Some(i);
        if draw < cumulative {
            return Some(i);
        }
    }

    // Float rounding can leave the draw a hair above the final sum
    last_positive
}

/// Health-scored load balancer over the persisted provider catalog.
pub struct LoadBalancer {
    db: SqlitePool,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl LoadBalancer {
    /// Balancer drawing from an entropy-seeded generator.
    pub fn new(db: SqlitePool) -> Self {
        Self::with_rng(db, StdRng::from_entropy())
    }

    /// Balancer drawing from the given random source.
    pub fn with_rng(db: SqlitePool, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            db,
            rng: Mutex::new(Box::new(rng)),
        }
    }

    /// Select a provider for `model` that meets the capability requirements
    /// and is not in `excluded`.
    ///
    /// Storage failures are logged and treated as "no candidates".
    pub async fn get_best_provider(
        &self,
        model: &str,
        needs_vision: bool,
        needs_tools: bool,
        excluded: &BTreeSet<String>,
    ) -> Option<ProviderRow> {
        let scored = match self
            .scored_candidates(model, needs_vision, needs_tools, excluded)
            .await
        {
            Ok(scored) => scored,
            Err(e) => {
                tracing::error!(model = %model, error = %e, "Failed to load provider candidates");
                return None;
            }
        };

        let weights: Vec<f64> = scored.iter().map(|(_, score)| *score).collect();
        let index = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            weighted_choice(&weights, &mut **rng)?
        };

        let (provider, score) = scored.into_iter().nth(index)?;
        tracing::debug!(
            provider = %provider.name,
            model = %model,
            score = score,
            candidates = weights.len(),
            "Selected provider"
        );
        Some(provider)
    }

    /// Look up one provider by name, bypassing scoring.
    pub async fn get_specific_provider(&self, name: &str) -> Option<ProviderRow> {
        match providers::get_provider(&self.db, name).await {
            Ok(provider) => provider,
            Err(e) => {
                tracing::error!(provider = %name, error = %e, "Failed to load provider");
                None
            }
        }
    }

    /// Candidates for `model` paired with their health score.
    pub async fn scored_candidates(
        &self,
        model: &str,
        needs_vision: bool,
        needs_tools: bool,
        excluded: &BTreeSet<String>,
    ) -> Result<Vec<(ProviderRow, f64)>, sqlx::Error> {
        let candidates: Vec<ProviderRow> =
            providers::find_serving(&self.db, model, needs_vision, needs_tools)
                .await?
                .into_iter()
                .filter(|p| !excluded.contains(&p.name))
                .collect();

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let now_hour = storage::epoch_hour(storage::unix_now());
        let totals: HashMap<String, storage::UsageTotals> =
            usage::window_totals(&self.db, model, now_hour)
                .await?
                .into_iter()
                .collect();

        let window_requests: i64 = candidates
            .iter()
            .filter_map(|p| totals.get(&p.name))
            .map(|t| t.requests)
            .sum();

        Ok(candidates
            .into_iter()
            .map(|p| {
                let score = health_score(totals.get(&p.name), window_requests);
                (p, score)
            })
            .collect())
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer").finish_non_exhaustive()
    }
}
