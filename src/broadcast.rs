//! One broadcast run: fetch recipients, then preview or dispatch and report.
use std::io::Write;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::config::ConfigError;
use crate::db::Pool;
use crate::delivery::Messenger;
use crate::dispatch::Dispatcher;
use crate::model::{Payload, RecipientId};
use crate::rate::RateConfig;
use crate::recipients::{self, RecipientFilter};
use crate::report::DispatchReport;

pub const DRY_RUN_PREVIEW: usize = 10;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store access failed: {0:#}")]
    Store(anyhow::Error),
    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BroadcastError {
    /// 2 for configuration problems, 1 for everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            BroadcastError::Config(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastPlan {
    pub filter: RecipientFilter,
    pub limit: Option<i64>,
    pub payload: Payload,
    pub rate: RateConfig,
    pub dry_run: bool,
    pub json: bool,
}

/// Run the plan, printing progress lines and the final report to `out`.
///
/// `messenger` may be `None` only for dry runs. Returns the report when
/// anything was dispatched.
pub async fn execute(
    pool: &Pool,
    plan: &BroadcastPlan,
    messenger: Option<Arc<dyn Messenger>>,
    stop: Option<watch::Receiver<bool>>,
    out: &mut dyn Write,
) -> Result<Option<DispatchReport>, BroadcastError> {
    let ids = recipients::fetch(pool, &plan.filter, plan.limit)
        .await
        .map_err(BroadcastError::Store)?;

    if ids.is_empty() {
        writeln!(out, "No user IDs found. Check your table and id field.")?;
        return Ok(None);
    }
    writeln!(out, "Found {} unique user ids.", ids.len())?;

    if plan.dry_run {
        writeln!(out, "[DRY RUN] Would send to first IDs: {} ...", render_ids(preview(&ids)))?;
        return Ok(None);
    }

    let messenger = messenger.ok_or(ConfigError::Missing("telegram bot token (TELEGRAM_BOT_TOKEN)"))?;
    let mut dispatcher = Dispatcher::new(messenger, plan.rate);
    if let Some(stop) = stop {
        dispatcher = dispatcher.with_stop_signal(stop);
    }

    info!(
        recipients = ids.len(),
        rate = plan.rate.rate(),
        concurrency = plan.rate.concurrency(),
        "starting dispatch"
    );
    let outcomes = dispatcher.run(&ids, &plan.payload).await;
    let report = DispatchReport::from_outcomes(&outcomes);

    if plan.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    } else {
        writeln!(out)?;
        write!(out, "{report}")?;
    }
    Ok(Some(report))
}

pub fn preview(ids: &[RecipientId]) -> &[RecipientId] {
    &ids[..ids.len().min(DRY_RUN_PREVIEW)]
}

fn render_ids(ids: &[RecipientId]) -> String {
    let parts: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_caps_at_ten() {
        let ids: Vec<RecipientId> = (1..=25).filter_map(RecipientId::new).collect();
        assert_eq!(preview(&ids).len(), DRY_RUN_PREVIEW);
        assert_eq!(preview(&ids[..3]).len(), 3);
        assert_eq!(render_ids(preview(&ids[..3])), "[1, 2, 3]");
    }

    #[test]
    fn exit_codes() {
        assert_eq!(BroadcastError::Config(ConfigError::Missing("x")).exit_code(), 2);
        assert_eq!(BroadcastError::Store(anyhow::anyhow!("down")).exit_code(), 1);
    }
}
