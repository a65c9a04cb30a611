//! Persisted provider capability rows.
//!
//! Rows mirror the static provider catalog. They are rewritten only when the
//! catalog entry changed and removed when the provider leaves the catalog.

use sqlx::SqlitePool;

use crate::config::ModelAccess;

/// One provider's capability metadata as stored.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ProviderRow {
    pub name: String,
    pub provider_id: String,
    pub display_name: String,
    pub supports_vision: bool,
    pub supports_tool_calling: bool,
    pub supports_streaming: bool,
}

/// A model served by a provider together with its access class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedModel {
    pub model: String,
    pub access: ModelAccess,
}

fn access_label(access: ModelAccess) -> &'static str {
    match access {
        ModelAccess::Free => "free",
        ModelAccess::Paid => "paid",
        ModelAccess::EarlyAccess => "early_access",
    }
}

fn parse_access(label: &str) -> ModelAccess {
    match label {
        "paid" => ModelAccess::Paid,
        "early_access" => ModelAccess::EarlyAccess,
        _ => ModelAccess::Free,
    }
}

const PROVIDER_COLUMNS: &str = "p.name, p.provider_id, p.display_name, \
     p.supports_vision, p.supports_tool_calling, p.supports_streaming";

/// Fetch one provider by name.
pub async fn get_provider(pool: &SqlitePool, name: &str) -> Result<Option<ProviderRow>, sqlx::Error> {
    let sql = format!("SELECT {PROVIDER_COLUMNS} FROM providers p WHERE p.name = ?");
    sqlx::query_as::<_, ProviderRow>(&sql)
        .bind(name)
        .fetch_optional(pool)
        .await
}

/// All stored providers, ordered by name.
pub async fn list_providers(pool: &SqlitePool) -> Result<Vec<ProviderRow>, sqlx::Error> {
    let sql = format!("SELECT {PROVIDER_COLUMNS} FROM providers p ORDER BY p.name");
    sqlx::query_as::<_, ProviderRow>(&sql).fetch_all(pool).await
}

/// Models stored for a provider, ordered by model id.
pub async fn served_models(pool: &SqlitePool, provider: &str) -> Result<Vec<ServedModel>, sqlx::Error> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT model, access FROM provider_models WHERE provider = ? ORDER BY model",
    )
    .bind(provider)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(model, access)| ServedModel {
            model,
            access: parse_access(&access),
        })
        .collect())
}

/// Providers serving `model` that satisfy the capability requirements.
///
/// A `false` requirement does not filter; a `true` one keeps only providers
/// with the matching flag set.
pub async fn find_serving(
    pool: &SqlitePool,
    model: &str,
    needs_vision: bool,
    needs_tools: bool,
) -> Result<Vec<ProviderRow>, sqlx::Error> {
    let sql = format!(
        "SELECT {PROVIDER_COLUMNS} FROM providers p
         JOIN provider_models m ON m.provider = p.name
         WHERE m.model = ?
           AND (? = 0 OR p.supports_vision = 1)
           AND (? = 0 OR p.supports_tool_calling = 1)
         ORDER BY p.name"
    );
    sqlx::query_as::<_, ProviderRow>(&sql)
        .bind(model)
        .bind(needs_vision)
        .bind(needs_tools)
        .fetch_all(pool)
        .await
}

/// Write a provider row and its model list if either differs from what is stored.
///
/// Returns `true` when something was written.
pub async fn sync_provider(
    pool: &SqlitePool,
    row: &ProviderRow,
    models: &[ServedModel],
) -> Result<bool, sqlx::Error> {
    let existing = get_provider(pool, &row.name).await?;
    if existing.as_ref() == Some(row) {
        let mut wanted = models.to_vec();
        wanted.sort_by(|a, b| a.model.cmp(&b.model));
        wanted.dedup_by(|a, b| a.model == b.model);
        if served_models(pool, &row.name).await? == wanted {
            return Ok(false);
        }
    }

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO providers (name, provider_id, display_name,
            supports_vision, supports_tool_calling, supports_streaming)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(name) DO UPDATE SET
            provider_id = excluded.provider_id,
            display_name = excluded.display_name,
            supports_vision = excluded.supports_vision,
            supports_tool_calling = excluded.supports_tool_calling,
            supports_streaming = excluded.supports_streaming",
    )
    .bind(&row.name)
    .bind(&row.provider_id)
    .bind(&row.display_name)
    .bind(row.supports_vision)
    .bind(row.supports_tool_calling)
    .bind(row.supports_streaming)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM provider_models WHERE provider = ?")
        .bind(&row.name)
        .execute(&mut *tx)
        .await?;

    for served in models {
        sqlx::query(
            "INSERT OR REPLACE INTO provider_models (provider, model, access) VALUES (?, ?, ?)",
        )
        .bind(&row.name)
        .bind(&served.model)
        .bind(access_label(served.access))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(true)
}

/// Delete every stored provider whose name is not in `keep`.
///
/// Returns the names that were removed.
pub async fn remove_missing(pool: &SqlitePool, keep: &[String]) -> Result<Vec<String>, sqlx::Error> {
    let stored: Vec<(String,)> = sqlx::query_as("SELECT name FROM providers")
        .fetch_all(pool)
        .await?;

    let mut removed = Vec::new();
    for (name,) in stored {
        if keep.iter().any(|k| k == &name) {
            continue;
        }
        sqlx::query("DELETE FROM providers WHERE name = ?")
            .bind(&name)
            .execute(pool)
            .await?;
        removed.push(name);
    }
    Ok(removed)
}
