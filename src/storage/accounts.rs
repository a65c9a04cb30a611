//! Persisted credit accounts.
//!
//! Accounts are created by the community bot; the gateway only reads them,
//! moves their balance and maintains tier demotion and the IP lock.

use sqlx::SqlitePool;

/// A credit account as stored.
#[derive(Clone, PartialEq, sqlx::FromRow)]
pub struct Account {
    pub key: String,
    pub balance: f64,
    pub tier: i64,
    pub premium_expiry: Option<i64>,
    pub ip: Option<String>,
    pub banned: bool,
    pub last_daily: i64,
}

impl Account {
    /// A fresh account with no IP bound and no premium expiry.
    pub fn new(key: impl Into<String>, balance: f64, tier: i64) -> Self {
        Self {
            key: key.into(),
            balance,
            tier,
            premium_expiry: None,
            ip: None,
            banned: false,
            last_daily: 0,
        }
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("key", &"[REDACTED]")
            .field("balance", &self.balance)
            .field("tier", &self.tier)
            .field("premium_expiry", &self.premium_expiry)
            .field("ip", &self.ip)
            .field("banned", &self.banned)
            .field("last_daily", &self.last_daily)
            .finish()
    }
}

const COLUMNS: &str = "key, balance, tier, premium_expiry, ip, banned, last_daily";

/// Look up an account by key.
pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<Account>, sqlx::Error> {
    let sql = format!("SELECT {COLUMNS} FROM accounts WHERE key = ?");
    sqlx::query_as::<_, Account>(&sql)
        .bind(key)
        .fetch_optional(pool)
        .await
}

/// Insert an account unless the key already exists. Returns `true` if inserted.
pub async fn insert(pool: &SqlitePool, account: &Account) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO accounts (key, balance, tier, premium_expiry, ip, banned, last_daily)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&account.key)
    .bind(account.balance)
    .bind(account.tier)
    .bind(account.premium_expiry)
    .bind(&account.ip)
    .bind(account.banned)
    .bind(account.last_daily)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Subtract `amount` from the balance in a single statement.
pub async fn debit(pool: &SqlitePool, key: &str, amount: f64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE accounts SET balance = balance - ? WHERE key = ?")
        .bind(amount)
        .bind(key)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Add `amount` to the balance in a single statement.
pub async fn credit(pool: &SqlitePool, key: &str, amount: f64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE accounts SET balance = balance + ? WHERE key = ?")
        .bind(amount)
        .bind(key)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Drop an account to `tier` and clear its premium expiry.
pub async fn demote(pool: &SqlitePool, key: &str, tier: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE accounts SET tier = ?, premium_expiry = NULL WHERE key = ?")
        .bind(tier)
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

/// Bind `ip` to the account if none is bound yet, then return the bound IP.
///
/// The conditional update makes the first concurrent writer win.
pub async fn bind_ip(pool: &SqlitePool, key: &str, ip: &str) -> Result<Option<String>, sqlx::Error> {
    sqlx::query("UPDATE accounts SET ip = ? WHERE key = ? AND ip IS NULL")
        .bind(ip)
        .bind(key)
        .execute(pool)
        .await?;

    let bound: Option<(Option<String>,)> = sqlx::query_as("SELECT ip FROM accounts WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(bound.and_then(|(ip,)| ip))
}

/// Accounts below `max_balance` whose last grant is at or before `cutoff`.
pub async fn due_for_grant(
    pool: &SqlitePool,
    max_balance: f64,
    cutoff: i64,
) -> Result<Vec<Account>, sqlx::Error> {
    let sql = format!(
        "SELECT {COLUMNS} FROM accounts
         WHERE balance < ? AND last_daily <= ? AND banned = 0
         ORDER BY key"
    );
    sqlx::query_as::<_, Account>(&sql)
        .bind(max_balance)
        .bind(cutoff)
        .fetch_all(pool)
        .await
}

/// Add `amount` capped at `max_balance` and stamp the grant time.
///
/// Applies only while the account is still due as of `cutoff`, so a grant
/// raced by another sweep or a manual credit is skipped. Returns whether it
/// applied.
pub async fn grant(
    pool: &SqlitePool,
    key: &str,
    amount: f64,
    max_balance: f64,
    cutoff: i64,
    now: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE accounts
         SET balance = MIN(?, balance + ?), last_daily = ?
         WHERE key = ? AND balance < ? AND last_daily <= ? AND banned = 0",
    )
    .bind(max_balance)
    .bind(amount)
    .bind(now)
    .bind(key)
    .bind(max_balance)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
