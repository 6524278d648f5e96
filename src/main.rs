use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use tg_bulksender::broadcast::{self, BroadcastError, BroadcastPlan};
use tg_bulksender::config::{self, ConfigError, Overrides, Settings};
use tg_bulksender::db;
use tg_bulksender::delivery::{Messenger, TelegramMessenger};
use tg_bulksender::model::{FormatMode, ImageRef, Payload};
use tg_bulksender::recipients::RecipientFilter;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Send a bulk Telegram message to the user ids in the store"
)]
struct Args {
    /// Path to YAML config file (optional)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Telegram bot token
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Store connection string, e.g. sqlite://./data/users.db
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Table holding the user records
    #[arg(long, env = "USERS_TABLE")]
    table: Option<String>,

    /// Column containing the Telegram user id
    #[arg(long, env = "ID_FIELD")]
    id_field: Option<String>,

    /// Text to send; used as the caption when --image is given
    #[arg(long)]
    message: String,

    /// Image path or http(s) URL to send as a photo
    #[arg(long)]
    image: Option<String>,

    /// Formatting mode for the text or caption
    #[arg(long, visible_alias = "parse-mode", value_enum, default_value_t = FormatMode::None)]
    format: FormatMode,

    /// Read at most this many records
    #[arg(long)]
    limit: Option<i64>,

    /// Target messages per second (default: 15)
    #[arg(long)]
    rate: Option<u32>,

    /// Parallel sends (default: 1)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Only send to records marked active
    #[arg(long)]
    active_only: bool,

    /// Print the recipient count and the first ids; send nothing
    #[arg(long)]
    dry_run: bool,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "bulk send aborted");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), BroadcastError> {
    let file = config::load(Some(&args.config))?;
    let settings = Settings::resolve(
        file,
        Overrides {
            bot_token: args.token,
            database_url: args.database_url,
            table: args.table,
            id_field: args.id_field,
            rate: args.rate,
            concurrency: args.concurrency,
        },
    )?;

    let image = args
        .image
        .as_deref()
        .map(ImageRef::parse)
        .transpose()
        .map_err(|err| ConfigError::Invalid(format!("{err:#}")))?;
    if let Some(ImageRef::Path(path)) = &image {
        if !path.is_file() {
            return Err(ConfigError::Invalid(format!("image file {} not found", path.display())).into());
        }
    }
    let payload = Payload::new(&args.message, image, args.format);

    let messenger: Option<Arc<dyn Messenger>> = if args.dry_run {
        None
    } else {
        Some(Arc::new(TelegramMessenger::new(settings.require_bot_token()?)))
    };

    let pool = db::init_pool(&settings.database_url)
        .await
        .map_err(BroadcastError::Store)?;
    db::run_migrations(&pool).await.map_err(BroadcastError::Store)?;

    let plan = BroadcastPlan {
        filter: RecipientFilter {
            table: settings.table.clone(),
            id_field: settings.id_field.clone(),
            active_only: args.active_only,
        },
        limit: args.limit,
        payload,
        rate: settings.rate,
        dry_run: args.dry_run,
        json: args.json,
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if relay_interrupts(tokio::signal::ctrl_c, stop_tx).await {
            error!("second interrupt; exiting without a report");
            std::process::exit(130);
        }
    });

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let report = broadcast::execute(&pool, &plan, messenger, Some(stop_rx), &mut out).await?;
    out.flush()?;

    if let Some(report) = report {
        info!(
            total = report.total,
            delivered = report.delivered,
            forbidden = report.forbidden,
            failed = report.failed,
            "bulk send finished"
        );
    }
    Ok(())
}

/// The first interrupt raises the stop signal. Returns true once a second
/// interrupt arrives, false if the signal source fails.
async fn relay_interrupts<S, F>(mut interrupts: S, stop: watch::Sender<bool>) -> bool
where
    S: FnMut() -> F,
    F: Future<Output = std::io::Result<()>>,
{
    if interrupts().await.is_err() {
        return false;
    }
    warn!("interrupt received; no new sends will start (press Ctrl-C again to quit now)");
    let _ = stop.send(true);
    interrupts().await.is_ok()
}
