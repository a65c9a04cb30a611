//! Daily credit replenishment.
//!
//! One long-lived task per process wakes every `sweep_interval_secs` and
//! grants each due account its tier's daily amount, capped at `max_balance`.

use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CreditsConfig;
use crate::error::Result;
use crate::storage::{self, accounts};

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub granted: usize,
    /// Due accounts whose tier has no configured grant.
    pub skipped: usize,
}

/// Grant daily credits to every due account as of `now` (unix seconds).
pub async fn sweep_once(pool: &SqlitePool, config: &CreditsConfig, now: i64) -> Result<SweepReport> {
    let cutoff = now - config.daily_interval_secs as i64;
    let due = accounts::due_for_grant(pool, config.max_balance, cutoff).await?;

    let mut report = SweepReport::default();
    for account in due {
        let Some(amount) = config.daily_grant(account.tier) else {
            tracing::warn!(tier = account.tier, "No daily grant configured for tier");
            report.skipped += 1;
            continue;
        };
        match accounts::grant(pool, &account.key, amount, config.max_balance, cutoff, now).await {
            Ok(true) => report.granted += 1,
            Ok(false) => {
                tracing::debug!(tier = account.tier, "Account no longer due, grant skipped");
            }
            Err(e) => {
                tracing::error!(tier = account.tier, error = %e, "Failed to grant daily credits");
            }
        }
    }

    if report.granted > 0 {
        tracing::info!(granted = report.granted, skipped = report.skipped, "Replenished credits");
    }
    Ok(report)
}

/// Handle to the running replenishment task.
pub struct CreditsService {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CreditsService {
    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn spawn(pool: SqlitePool, config: CreditsConfig, token: CancellationToken) -> Self {
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            Self::run_loop(pool, config, loop_token).await;
        });
        Self { token, handle }
    }

    async fn run_loop(pool: SqlitePool, config: CreditsConfig, token: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            every_secs = config.sweep_interval_secs,
            "Credit replenishment started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = sweep_once(&pool, &config, storage::unix_now()).await {
                        tracing::error!(error = %e, "Credit replenishment sweep failed");
                    }
                }
            }
        }

        tracing::info!("Credit replenishment stopped");
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Credit replenishment task panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierGrant;
    use crate::storage::{init_memory_pool, Account};

    fn config() -> CreditsConfig {
        CreditsConfig {
            max_balance: 1000.0,
            sweep_interval_secs: 60,
            daily_interval_secs: 86_400,
            premium_tier: 2,
            tiers: vec![
                TierGrant { tier: 0, daily: 100.0 },
                TierGrant { tier: 1, daily: 300.0 },
            ],
        }
    }

    async fn seeded(accounts: &[Account]) -> SqlitePool {
        let pool = init_memory_pool().await.unwrap();
        for account in accounts {
            accounts::insert(&pool, account).await.unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_due_accounts_get_tier_grant() {
        let pool = seeded(&[Account::new("a", 0.0, 0), Account::new("b", 50.0, 1)]).await;

        let report = sweep_once(&pool, &config(), 100_000).await.unwrap();
        assert_eq!(report.granted, 2);

        let a = accounts::get(&pool, "a").await.unwrap().unwrap();
        let b = accounts::get(&pool, "b").await.unwrap().unwrap();
        assert_eq!(a.balance, 100.0);
        assert_eq!(b.balance, 350.0);
        assert_eq!(a.last_daily, 100_000);
    }

    #[tokio::test]
    async fn test_not_due_twice_within_interval() {
        let pool = seeded(&[Account::new("a", 0.0, 0)]).await;

        sweep_once(&pool, &config(), 100_000).await.unwrap();
        let report = sweep_once(&pool, &config(), 100_060).await.unwrap();
        assert_eq!(report.granted, 0);

        let report = sweep_once(&pool, &config(), 100_000 + 86_400).await.unwrap();
        assert_eq!(report.granted, 1);
        assert_eq!(accounts::get(&pool, "a").await.unwrap().unwrap().balance, 200.0);
    }

    #[tokio::test]
    async fn test_grant_capped_and_full_accounts_skipped() {
        let pool = seeded(&[Account::new("near", 950.0, 1), Account::new("full", 1000.0, 1)]).await;

        let report = sweep_once(&pool, &config(), 100_000).await.unwrap();
        assert_eq!(report.granted, 1);
        assert_eq!(accounts::get(&pool, "near").await.unwrap().unwrap().balance, 1000.0);
        assert_eq!(accounts::get(&pool, "full").await.unwrap().unwrap().last_daily, 0);
    }

    #[tokio::test]
    async fn test_unconfigured_tier_is_skipped() {
        let pool = seeded(&[Account::new("vip", 0.0, 7)]).await;
        let report = sweep_once(&pool, &config(), 100_000).await.unwrap();
        assert_eq!(report, SweepReport { granted: 0, skipped: 1 });
    }

    #[tokio::test]
    async fn test_failed_grant_does_not_stop_the_sweep() {
        let pool = seeded(&[Account::new("a", 0.0, 0), Account::new("b", 0.0, 0)]).await;
        sqlx::query(
            "CREATE TRIGGER reject_a BEFORE UPDATE ON accounts WHEN NEW.key = 'a'
             BEGIN SELECT RAISE(ABORT, 'locked'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let report = sweep_once(&pool, &config(), 100_000).await.unwrap();

        assert_eq!(report.granted, 1);
        assert_eq!(accounts::get(&pool, "a").await.unwrap().unwrap().balance, 0.0);
        assert_eq!(accounts::get(&pool, "b").await.unwrap().unwrap().balance, 100.0);
    }

    #[tokio::test]
    async fn test_service_stops_on_cancel() {
        let pool = seeded(&[Account::new("a", 0.0, 0)]).await;
        let token = CancellationToken::new();
        let service = CreditsService::spawn(pool.clone(), config(), token.clone());

        // The first tick fires immediately
        let mut granted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if accounts::get(&pool, "a").await.unwrap().unwrap().balance > 0.0 {
                granted = true;
                break;
            }
        }
        assert!(granted, "first sweep should run on start");
        assert!(!service.is_finished());

        tokio::time::timeout(Duration::from_secs(1), service.shutdown())
            .await
            .expect("sweep task should stop promptly");
        assert!(token.is_cancelled());
    }
}
