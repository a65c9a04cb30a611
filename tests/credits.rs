//! Integration tests for account seeding and daily replenishment.

mod common;

use common::*;
use switchyard::credits::{sweep_once, SweepReport};
use switchyard::storage::{accounts, Account};

fn with_accounts() -> String {
    config_toml("", 3)
        + r#"
[[accounts]]
key = "sk-seeded"
balance = 40.0
tier = 0

[[accounts]]
key = "sk-unknown-tier"
balance = 0.0
tier = 9
"#
}

#[tokio::test]
async fn test_configured_accounts_are_seeded_once() {
    let app = build_app(&with_accounts()).await;
    assert_eq!(app.account("sk-seeded").await.balance, 40.0);

    // Seeding again must not reset a balance that has moved
    accounts::debit(&app.db, "sk-seeded", 10.0).await.unwrap();
    let created = app.state.ledger.seed(&app.state.config.accounts).await.unwrap();
    assert_eq!(created, 0);
    assert_eq!(app.account("sk-seeded").await.balance, 30.0);
}

#[tokio::test]
async fn test_sweep_uses_configured_tiers() {
    let app = build_app(&with_accounts()).await;
    let mut banned = Account::new("sk-banned", 0.0, 0);
    banned.banned = true;
    accounts::insert(&app.db, &banned).await.unwrap();

    let now = 2_000_000_000;
    let report = sweep_once(&app.db, &app.state.config.credits, now)
        .await
        .unwrap();

    assert_eq!(report, SweepReport { granted: 1, skipped: 1 });
    assert_eq!(app.account("sk-seeded").await.balance, 140.0);
    assert_eq!(app.account("sk-seeded").await.last_daily, now);
    assert_eq!(app.account("sk-banned").await.balance, 0.0);

    // A second sweep within the interval grants nothing
    let report = sweep_once(&app.db, &app.state.config.credits, now + 60)
        .await
        .unwrap();
    assert_eq!(report.granted, 0);
}
