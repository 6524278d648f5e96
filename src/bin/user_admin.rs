use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use tg_bulksender::broadcast::{self, BroadcastPlan};
use tg_bulksender::config::{self, Overrides, Settings};
use tg_bulksender::db::{self, UserChanges};
use tg_bulksender::delivery::{Messenger, TelegramMessenger};
use tg_bulksender::model::{FormatMode, Payload, UserRecord};
use tg_bulksender::recipients::RecipientFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Manage bot user records and notify active users")]
struct Args {
    /// Path to YAML config file (optional)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Store connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Table holding the user records
    #[arg(long, env = "USERS_TABLE")]
    table: Option<String>,

    /// Telegram bot token (only needed for `notify`)
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create users, or reactivate and update existing ones
    Add {
        /// One or more ids; whitespace-separated lists are split
        #[arg(required = true)]
        user_ids: Vec<String>,
        /// Expire this many days from today (midnight UTC)
        #[arg(long)]
        expiry_days: Option<i64>,
        /// Seconds between uses
        #[arg(long, value_parser = clap::value_parser!(i64).range(30..=3600))]
        interval_time: Option<i64>,
    },
    /// Change the interval time of existing users
    SetInterval {
        #[arg(required = true)]
        user_ids: Vec<String>,
        #[arg(long, value_parser = clap::value_parser!(i64).range(30..=3600))]
        interval_time: i64,
    },
    /// Mark users inactive
    Remove {
        #[arg(required = true)]
        user_ids: Vec<String>,
    },
    /// Delete user records
    Purge {
        #[arg(required = true)]
        user_ids: Vec<String>,
    },
    /// List active users, least recently updated first
    List {
        /// IANA timezone for displayed timestamps
        #[arg(long, default_value = "Africa/Nairobi")]
        timezone: String,
    },
    /// Send a message to every active user
    Notify {
        #[arg(long)]
        message: String,
        #[arg(long, value_enum, default_value_t = FormatMode::None)]
        format: FormatMode,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let file = config::load(Some(&args.config))?;
    let settings = Settings::resolve(
        file,
        Overrides {
            bot_token: args.token,
            database_url: args.database_url,
            table: args.table,
            ..Default::default()
        },
    )?;

    let pool = db::init_pool(&settings.database_url).await?;
    db::run_migrations(&pool).await?;
    let table = &settings.table;

    match args.command {
        Command::Add {
            user_ids,
            expiry_days,
            interval_time,
        } => {
            let changes = UserChanges {
                expiry_date: expiry_days
                    .map(|days| expiry_from_today(Utc::now(), days))
                    .transpose()?,
                interval_time,
            };
            for user_id in split_ids(&user_ids) {
                let result = db::upsert_user(&pool, table, &user_id, &changes).await?;
                println!("User {user_id} {}", result.as_str());
            }
        }
        Command::SetInterval {
            user_ids,
            interval_time,
        } => {
            for user_id in split_ids(&user_ids) {
                if db::set_interval_time(&pool, table, &user_id, interval_time).await? {
                    println!("User {user_id} updated");
                } else {
                    println!("User {user_id} not found");
                }
            }
        }
        Command::Remove { user_ids } => {
            for user_id in split_ids(&user_ids) {
                if db::deactivate_user(&pool, table, &user_id).await? {
                    println!("User {user_id} removed");
                } else {
                    println!("User {user_id} not found");
                }
            }
        }
        Command::Purge { user_ids } => {
            for user_id in split_ids(&user_ids) {
                let deleted = db::delete_user(&pool, table, &user_id).await?;
                println!("User {user_id}: {deleted} record(s) deleted");
            }
        }
        Command::List { timezone } => {
            let tz: Tz = timezone
                .parse()
                .map_err(|err| anyhow!("unknown timezone {timezone}: {err}"))?;
            let users = db::list_active_users(&pool, table).await?;
            if users.is_empty() {
                println!("No users found");
            } else {
                print!("{}", render_users(&users, tz));
            }
        }
        Command::Notify { message, format } => {
            let messenger: Arc<dyn Messenger> =
                Arc::new(TelegramMessenger::new(settings.require_bot_token()?));
            let plan = BroadcastPlan {
                filter: RecipientFilter {
                    table: settings.table.clone(),
                    id_field: settings.id_field.clone(),
                    active_only: true,
                },
                limit: None,
                payload: Payload::new(&message, None, format),
                rate: settings.rate,
                dry_run: false,
                json: false,
            };
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            broadcast::execute(&pool, &plan, Some(messenger), None, &mut out)
                .await
                .context("notify failed")?;
            out.flush()?;
            info!("notify finished");
        }
    }
    Ok(())
}

/// Accepts both separate arguments and whitespace-separated lists.
fn split_ids(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|chunk| chunk.split_whitespace())
        .map(str::to_string)
        .collect()
}

fn expiry_from_today(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    let today = now.date_naive();
    let offset = Days::new(days.unsigned_abs());
    let day = if days >= 0 {
        today.checked_add_days(offset)
    } else {
        today.checked_sub_days(offset)
    }
    .ok_or_else(|| anyhow!("expiry of {days} days from today is out of range"))?;
    Ok(Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN)))
}

const COLUMNS: [&str; 7] = [
    "user_id",
    "total_used",
    "interval_time",
    "created_time",
    "expiry_date",
    "last_used",
    "active",
];

fn render_users(users: &[UserRecord], tz: Tz) -> String {
    let rows: Vec<[String; 7]> = users
        .iter()
        .map(|u| {
            [
                u.user_id.clone(),
                opt(u.total_used),
                opt(u.interval_time),
                u.created_time.map(|t| local(t, tz)).unwrap_or_default(),
                u.expiry_date.map(|t| local(t, tz)).unwrap_or_default(),
                u.last_used
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                    .map(|t| local(t, tz))
                    .unwrap_or_default(),
                u.active.to_string(),
            ]
        })
        .collect();

    let mut widths = COLUMNS.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.len());
        }
    }

    let mut text = String::new();
    let header: Vec<String> = COLUMNS
        .iter()
        .zip(widths.iter())
        .map(|(c, w)| format!("{c:<width$}", width = *w))
        .collect();
    text.push_str(header.join("  ").trim_end());
    text.push('\n');
    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .zip(widths.iter())
            .map(|(c, w)| format!("{c:<width$}", width = *w))
            .collect();
        text.push_str(cells.join("  ").trim_end());
        text.push('\n');
    }
    text
}

fn opt(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn local(t: DateTime<Utc>, tz: Tz) -> String {
    t.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S %Z").to_string()
}
