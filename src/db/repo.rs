use super::model::{RawIdentifier, SqlIdent, UserChanges};
use crate::model::{UpsertResult, UserRecord};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

const USER_COLUMNS: &str = "CAST(user_id AS TEXT) AS user_id, active, total_used, interval_time, \
                            created_time, updated_time, expiry_date, last_used";

/// Open the store once; the pool is then passed to whoever needs it.
pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = expand_sqlite_path(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database URL {database_url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options)
        .await
        .with_context(|| format!("failed to open store at {database_url}"))?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed `sqlite:` URLs and make sure the
/// parent directory exists. Other URLs are returned unchanged.
fn expand_sqlite_path(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Read the identifier column of every record where it is set, in insertion
/// order. `limit` caps the records read, before any filtering.
#[instrument(skip_all, fields(table = %table, field = %field))]
pub async fn fetch_identifier_values(
    pool: &Pool,
    table: &SqlIdent,
    field: &SqlIdent,
    active_only: bool,
    limit: Option<i64>,
) -> Result<Vec<RawIdentifier>> {
    let active_clause = if active_only { " AND active = 1" } else { "" };
    let sql = format!(
        "SELECT typeof({field}) AS kind, CAST({field} AS TEXT) AS raw FROM {table} \
         WHERE {field} IS NOT NULL{active_clause} ORDER BY rowid LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(limit.filter(|l| *l > 0).unwrap_or(-1))
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to read {field} from {table}"))?;

    rows.iter()
        .map(|row| {
            Ok(RawIdentifier {
                kind: row.try_get("kind")?,
                raw: row.try_get::<Option<String>, _>("raw")?.unwrap_or_default(),
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn find_user(pool: &Pool, table: &SqlIdent, user_id: &str) -> Result<Option<UserRecord>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM {table} WHERE CAST(user_id AS TEXT) = ? LIMIT 1");
    let row = sqlx::query(&sql).bind(user_id).fetch_optional(pool).await?;
    row.as_ref().map(user_from_row).transpose()
}

/// Reactivate and update an existing record, or create a new one.
#[instrument(skip_all)]
pub async fn upsert_user(
    pool: &Pool,
    table: &SqlIdent,
    user_id: &str,
    changes: &UserChanges,
) -> Result<UpsertResult> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(&format!(
        "UPDATE {table} SET active = 1, updated_time = ?, \
         expiry_date = COALESCE(?, expiry_date), interval_time = COALESCE(?, interval_time) \
         WHERE CAST(user_id AS TEXT) = ?"
    ))
    .bind(now)
    .bind(changes.expiry_date)
    .bind(changes.interval_time)
    .bind(user_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let result = if updated > 0 {
        UpsertResult::Updated
    } else {
        sqlx::query(&format!(
            "INSERT INTO {table} (user_id, active, created_time, updated_time, expiry_date, interval_time) \
             VALUES (?, 1, ?, ?, ?, ?)"
        ))
        .bind(user_id)
        .bind(now)
        .bind(now)
        .bind(changes.expiry_date)
        .bind(changes.interval_time)
        .execute(&mut *tx)
        .await?;
        UpsertResult::Created
    };
    tx.commit().await?;
    Ok(result)
}

/// Returns false when no record matched.
#[instrument(skip_all)]
pub async fn set_interval_time(
    pool: &Pool,
    table: &SqlIdent,
    user_id: &str,
    interval_time: i64,
) -> Result<bool> {
    let res = sqlx::query(&format!(
        "UPDATE {table} SET interval_time = ?, updated_time = ? WHERE CAST(user_id AS TEXT) = ?"
    ))
    .bind(interval_time)
    .bind(Utc::now())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Soft removal: the record stays but drops out of active listings.
#[instrument(skip_all)]
pub async fn deactivate_user(pool: &Pool, table: &SqlIdent, user_id: &str) -> Result<bool> {
    let res = sqlx::query(&format!(
        "UPDATE {table} SET active = 0, updated_time = ? WHERE CAST(user_id AS TEXT) = ?"
    ))
    .bind(Utc::now())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn delete_user(pool: &Pool, table: &SqlIdent, user_id: &str) -> Result<u64> {
    let res = sqlx::query(&format!("DELETE FROM {table} WHERE CAST(user_id AS TEXT) = ?"))
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Active users, least recently updated first.
#[instrument(skip_all)]
pub async fn list_active_users(pool: &Pool, table: &SqlIdent) -> Result<Vec<UserRecord>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM {table} WHERE active = 1 ORDER BY updated_time ASC, rowid ASC");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(user_from_row).collect()
}

fn user_from_row(row: &SqliteRow) -> Result<UserRecord> {
    Ok(UserRecord {
        user_id: row.try_get::<Option<String>, _>("user_id")?.unwrap_or_default(),
        active: row.try_get("active")?,
        total_used: row.try_get("total_used")?,
        interval_time: row.try_get("interval_time")?,
        created_time: row.try_get("created_time")?,
        updated_time: row.try_get("updated_time")?,
        expiry_date: row.try_get("expiry_date")?,
        last_used: row.try_get("last_used")?,
    })
}
