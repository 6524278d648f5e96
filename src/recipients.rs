//! Recipient source: reads identifiers from the user store and turns them
//! into a de-duplicated list of recipients.
use anyhow::Result;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::db::{self, Pool, RawIdentifier, SqlIdent};
use crate::model::RecipientId;

/// Which records to read: those where `id_field` is set, optionally only the
/// active ones.
#[derive(Debug, Clone)]
pub struct RecipientFilter {
    pub table: SqlIdent,
    pub id_field: SqlIdent,
    pub active_only: bool,
}

/// Snapshot of recipients for one run, in first-seen order.
///
/// Store errors are returned to the caller, which treats them as fatal.
pub async fn fetch(pool: &Pool, filter: &RecipientFilter, limit: Option<i64>) -> Result<Vec<RecipientId>> {
    let raw = db::fetch_identifier_values(
        pool,
        &filter.table,
        &filter.id_field,
        filter.active_only,
        limit,
    )
    .await?;
    let read = raw.len();
    let ids = dedup_preserving_order(raw.iter().filter_map(coerce_identifier));
    info!(read, unique = ids.len(), "fetched recipients");
    Ok(ids)
}

/// Integers are taken as stored; text only when it is all ASCII digits.
/// Anything else, and anything not positive, is skipped.
pub fn coerce_identifier(value: &RawIdentifier) -> Option<RecipientId> {
    let parsed = match value.kind.as_str() {
        "integer" => value.raw.parse::<i64>().ok(),
        "text" if !value.raw.is_empty() && value.raw.bytes().all(|b| b.is_ascii_digit()) => {
            value.raw.parse::<i64>().ok()
        }
        _ => None,
    };
    let id = parsed.and_then(RecipientId::new);
    if id.is_none() {
        debug!(kind = %value.kind, raw = %value.raw, "skipping identifier");
    }
    id
}

pub fn dedup_preserving_order(ids: impl IntoIterator<Item = RecipientId>) -> Vec<RecipientId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
