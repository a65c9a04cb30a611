//! Hour-slotted provider usage history.
//!
//! Each (provider, model) pair owns at most 24 rows, one per `hour % 24`
//! slot. Writing into a slot whose stored hour is stale resets its counters
//! first, so the table never grows past the window.

use sqlx::SqlitePool;

/// Number of hour slots kept per (provider, model).
pub const WINDOW_HOURS: i64 = 24;

/// Summed counters for one provider over the trailing window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct UsageTotals {
    pub requests: i64,
    pub failures: i64,
    pub latency_ms_total: i64,
}

/// Add one call outcome to the slot for `hour`.
///
/// Failed calls count as requests and failures; their latency is not added.
pub async fn record_call(
    pool: &SqlitePool,
    provider: &str,
    model: &str,
    hour: i64,
    latency_ms: i64,
    failed: bool,
) -> Result<(), sqlx::Error> {
    let slot = hour.rem_euclid(WINDOW_HOURS);
    let failures: i64 = if failed { 1 } else { 0 };
    let latency = if failed { 0 } else { latency_ms.max(0) };

    sqlx::query(
        "INSERT INTO provider_usage
            (provider, model, slot, hour, requests, failures, latency_ms_total)
         VALUES (?, ?, ?, ?, 1, ?, ?)
         ON CONFLICT(provider, model, slot) DO UPDATE SET
            requests = CASE WHEN provider_usage.hour = excluded.hour
                THEN provider_usage.requests + 1 ELSE 1 END,
            failures = CASE WHEN provider_usage.hour = excluded.hour
                THEN provider_usage.failures + excluded.failures ELSE excluded.failures END,
            latency_ms_total = CASE WHEN provider_usage.hour = excluded.hour
                THEN provider_usage.latency_ms_total + excluded.latency_ms_total
                ELSE excluded.latency_ms_total END,
            hour = excluded.hour",
    )
    .bind(provider)
    .bind(model)
    .bind(slot)
    .bind(hour)
    .bind(failures)
    .bind(latency)
    .execute(pool)
    .await?;

    Ok(())
}

/// Per-provider totals for `model` over the 24 hours ending at `now_hour`.
///
/// Providers without fresh rows are absent from the result.
pub async fn window_totals(
    pool: &SqlitePool,
    model: &str,
    now_hour: i64,
) -> Result<Vec<(String, UsageTotals)>, sqlx::Error> {
    let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
        "SELECT provider,
                COALESCE(SUM(requests), 0),
                COALESCE(SUM(failures), 0),
                COALESCE(SUM(latency_ms_total), 0)
         FROM provider_usage
         WHERE model = ? AND hour > ? AND hour <= ?
         GROUP BY provider",
    )
    .bind(model)
    .bind(now_hour - WINDOW_HOURS)
    .bind(now_hour)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(provider, requests, failures, latency_ms_total)| {
            (
                provider,
                UsageTotals {
                    requests,
                    failures,
                    latency_ms_total,
                },
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_memory_pool;

    async fn totals_for(pool: &SqlitePool, model: &str, hour: i64, provider: &str) -> UsageTotals {
        window_totals(pool, model, hour)
            .await
            .unwrap()
            .into_iter()
            .find(|(p, _)| p == provider)
            .map(|(_, t)| t)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_record_accumulates_within_hour() {
        let pool = init_memory_pool().await.unwrap();
        record_call(&pool, "alpha", "m", 1000, 200, false).await.unwrap();
        record_call(&pool, "alpha", "m", 1000, 400, false).await.unwrap();
        record_call(&pool, "alpha", "m", 1000, 900, true).await.unwrap();

        let totals = totals_for(&pool, "m", 1000, "alpha").await;
        assert_eq!(
            totals,
            UsageTotals {
                requests: 3,
                failures: 1,
                latency_ms_total: 600,
            }
        );
    }

    #[tokio::test]
    async fn test_stale_slot_is_reset() {
        let pool = init_memory_pool().await.unwrap();
        record_call(&pool, "alpha", "m", 1000, 100, true).await.unwrap();
        // Same slot a day later
        record_call(&pool, "alpha", "m", 1024, 50, false).await.unwrap();

        let totals = totals_for(&pool, "m", 1024, "alpha").await;
        assert_eq!(totals.requests, 1);
        assert_eq!(totals.failures, 0);
        assert_eq!(totals.latency_ms_total, 50);

        let rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM provider_usage")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows.0, 1);
    }

    #[tokio::test]
    async fn test_window_excludes_old_hours() {
        let pool = init_memory_pool().await.unwrap();
        record_call(&pool, "alpha", "m", 1000, 100, false).await.unwrap();
        record_call(&pool, "alpha", "m", 1010, 100, false).await.unwrap();

        assert_eq!(totals_for(&pool, "m", 1010, "alpha").await.requests, 2);
        // Hour 1000 falls out of the window at hour 1024
        assert_eq!(totals_for(&pool, "m", 1024, "alpha").await.requests, 1);
    }

    #[tokio::test]
    async fn test_totals_are_per_model() {
        let pool = init_memory_pool().await.unwrap();
        record_call(&pool, "alpha", "m1", 5, 100, false).await.unwrap();
        record_call(&pool, "alpha", "m2", 5, 100, false).await.unwrap();
        assert_eq!(window_totals(&pool, "m1", 5).await.unwrap().len(), 1);
        assert_eq!(totals_for(&pool, "m1", 5, "alpha").await.requests, 1);
    }
}
