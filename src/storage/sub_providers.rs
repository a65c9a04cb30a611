//! Persisted upstream credentials ("sub-providers").

use sqlx::SqlitePool;

/// One upstream credential backing a provider.
#[derive(Clone, sqlx::FromRow)]
pub struct SubProvider {
    pub id: i64,
    pub provider: String,
    pub credential: String,
    pub organization: Option<String>,
    pub usage: i64,
    pub last_used: i64,
    /// `None` means never judged, which counts as usable.
    pub working: Option<bool>,
}

impl std::fmt::Debug for SubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubProvider")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("credential", &"[REDACTED]")
            .field("organization", &self.organization)
            .field("usage", &self.usage)
            .field("last_used", &self.last_used)
            .field("working", &self.working)
            .finish()
    }
}

const COLUMNS: &str = "s.id, s.provider, s.credential, s.organization, s.usage, s.last_used, s.working";

/// Insert a credential unless it exists, then make its model list match `models`.
///
/// Usage counters and the working flag of an existing credential are preserved.
pub async fn seed(
    pool: &SqlitePool,
    provider: &str,
    credential: &str,
    organization: Option<&str>,
    models: &[String],
) -> Result<i64, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO sub_providers (provider, credential, organization)
         VALUES (?, ?, ?)
         ON CONFLICT(provider, credential) DO UPDATE SET organization = excluded.organization",
    )
    .bind(provider)
    .bind(credential)
    .bind(organization)
    .execute(&mut *tx)
    .await?;

    let (id,): (i64,) =
        sqlx::query_as("SELECT id FROM sub_providers WHERE provider = ? AND credential = ?")
            .bind(provider)
            .bind(credential)
            .fetch_one(&mut *tx)
            .await?;

    sqlx::query("DELETE FROM sub_provider_models WHERE sub_provider_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    for model in models {
        sqlx::query("INSERT OR IGNORE INTO sub_provider_models (sub_provider_id, model) VALUES (?, ?)")
            .bind(id)
            .bind(model)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(id)
}

/// Usable credentials of `provider` that serve `model`.
pub async fn usable_for(
    pool: &SqlitePool,
    provider: &str,
    model: &str,
) -> Result<Vec<SubProvider>, sqlx::Error> {
    let sql = format!(
        "SELECT {COLUMNS} FROM sub_providers s
         JOIN sub_provider_models m ON m.sub_provider_id = s.id
         WHERE s.provider = ? AND m.model = ?
           AND (s.working IS NULL OR s.working = 1)
         ORDER BY s.id"
    );
    sqlx::query_as::<_, SubProvider>(&sql)
        .bind(provider)
        .bind(model)
        .fetch_all(pool)
        .await
}

/// All credentials of `provider`, usable or not.
pub async fn list_for(pool: &SqlitePool, provider: &str) -> Result<Vec<SubProvider>, sqlx::Error> {
    let sql = format!("SELECT {COLUMNS} FROM sub_providers s WHERE s.provider = ? ORDER BY s.id");
    sqlx::query_as::<_, SubProvider>(&sql)
        .bind(provider)
        .fetch_all(pool)
        .await
}

/// Bump the usage counter and last-used time of a credential in one statement.
pub async fn record_use(pool: &SqlitePool, credential: &str, now: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE sub_providers SET usage = usage + 1, last_used = ? WHERE credential = ?",
    )
    .bind(now)
    .bind(credential)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Set the working flag of a credential.
pub async fn set_working(pool: &SqlitePool, credential: &str, working: bool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE sub_providers SET working = ? WHERE credential = ?")
        .bind(working)
        .bind(credential)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
