//! Pricing and balance movements.

use sqlx::SqlitePool;

use crate::catalog::{ModelInfo, Pricing};
use crate::config::AccountSeed;
use crate::error::{AdmissionError, Result};
use crate::providers::Endpoint;
use crate::storage::{accounts, Account};

/// Up-front price of a request.
///
/// Flat-priced models cost their price per call; text-to-speech adds one
/// credit per input character. Per-token models cost prompt tokens times
/// their multiplier.
pub fn request_price(
    info: &ModelInfo,
    endpoint: Endpoint,
    prompt_tokens: usize,
    speech_input_chars: usize,
) -> f64 {
    match info.pricing {
        Pricing::Flat(price) if endpoint == Endpoint::AudioSpeech => {
            price + speech_input_chars as f64
        }
        Pricing::Flat(price) => price,
        Pricing::PerToken { multiplier } => prompt_tokens as f64 * multiplier,
    }
}

/// Reject when `price` exceeds the balance.
pub fn ensure_affordable(account: &Account, price: f64) -> std::result::Result<(), AdmissionError> {
    if price > account.balance {
        return Err(AdmissionError::InsufficientCredits {
            available: account.balance,
            required: price,
        });
    }
    Ok(())
}

/// Balance operations for one database.
#[derive(Debug, Clone)]
pub struct Ledger {
    db: SqlitePool,
}

impl Ledger {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn account(&self, key: &str) -> Result<Option<Account>> {
        Ok(accounts::get(&self.db, key).await?)
    }

    /// Subtract `amount` from the account. Non-positive amounts are ignored.
    pub async fn debit(&self, key: &str, amount: f64) -> Result<()> {
        if amount <= 0.0 {
            return Ok(());
        }
        accounts::debit(&self.db, key, amount).await?;
        Ok(())
    }

    /// Give back a debit that paid for nothing.
    pub async fn refund(&self, key: &str, amount: f64) -> Result<()> {
        if amount <= 0.0 {
            return Ok(());
        }
        accounts::credit(&self.db, key, amount).await?;
        tracing::debug!(amount = amount, "Refunded prompt debit");
        Ok(())
    }

    /// Create configured accounts that do not exist yet.
    pub async fn seed(&self, seeds: &[AccountSeed]) -> Result<usize> {
        let mut created = 0;
        for seed in seeds {
            let account = Account::new(seed.key.expose_secret(), seed.balance, seed.tier);
            if accounts::insert(&self.db, &account).await? {
                created += 1;
            }
        }
        Ok(created)
    }
}
