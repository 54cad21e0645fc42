use ansi_term::Colour::{Cyan, Green, Red, Yellow};
use ansi_term::Style;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use healthsync::config::Config;
use healthsync::data::Category;
use healthsync::state::{StateStore, SyncState};
use healthsync::sync::{JobOutcome, SkipReason, SyncJob, SyncObserver, SyncSchedule};
use healthsync::time::format_timestamp_ms;
use healthsync::{HomeAssistantClient, SnapshotBuilder};

#[derive(Parser)]
#[command(name = "healthsync")]
#[command(about = "Sync daily health summaries to a Home Assistant sensor")]
#[command(version)]
struct Cli {
    /// Directory holding settings.json and cache.json
    #[arg(long, global = true, env = "HEALTHSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Health export file to read records from
    #[arg(long, global = true, env = "HEALTHSYNC_EXPORT")]
    export: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store Home Assistant login after checking it works
    Login {
        #[arg(long)]
        url: String,
        #[arg(long)]
        token: String,
        /// Sensor id, published as sensor.<id>
        #[arg(long)]
        sensor: String,
        /// Sync interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Show or change sync settings
    Settings {
        #[arg(long)]
        auto_sync: Option<bool>,
        /// Look-back window in days (1-30)
        #[arg(long)]
        days: Option<i64>,
        /// Sync interval in seconds (minimum 900)
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long, value_name = "CATEGORY")]
        enable: Vec<Category>,
        #[arg(long, value_name = "CATEGORY")]
        disable: Vec<Category>,
    },
    /// Run one sync now
    Sync,
    /// Sync periodically until interrupted
    Run,
    /// Show last sync, last error and the cached snapshot
    Status,
    /// Test connectivity to the configured hub
    Check,
}

struct LogObserver;

impl SyncObserver for LogObserver {
    fn on_synced(&self, at_ms: i64) {
        info!(last_sync = %format_timestamp_ms(at_ms), "sensor updated");
    }
}

fn init_tracing(verbose: u8) {
    let default = if verbose > 0 { "healthsync=debug" } else { "healthsync=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default))
        .add_directive(
            "hyper=warn"
                .parse()
                .unwrap_or_else(|_| tracing::Level::WARN.into()),
        )
        .add_directive(
            "reqwest=warn"
                .parse()
                .unwrap_or_else(|_| tracing::Level::WARN.into()),
        );

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.data_dir, cli.export)?;
    let store = Arc::new(config.store()?);
    debug!(data_dir = %config.data_dir.display(), "using data directory");

    match cli.command {
        Command::Login {
            url,
            token,
            sensor,
            interval,
        } => login(store.as_ref(), url, token, sensor, interval).await,
        Command::Settings {
            auto_sync,
            days,
            interval,
            enable,
            disable,
        } => settings(store.as_ref(), auto_sync, days, interval, enable, disable),
        Command::Sync => {
            let job = build_job(&config, store)?;
            let mut phases = job.subscribe();
            tokio::spawn(async move {
                while phases.changed().await.is_ok() {
                    let phase = *phases.borrow();
                    debug!(?phase, "progress");
                }
            });

            match job.run().await {
                JobOutcome::Failed { message, attempts } => {
                    bail!("Sync failed after {} attempt(s): {}", attempts, message)
                }
                outcome => {
                    print_outcome(&outcome);
                    Ok(())
                }
            }
        }
        Command::Run => run(&config, store).await,
        Command::Status => status(store.as_ref()),
        Command::Check => check(store.as_ref()).await,
    }
}

fn build_job(config: &Config, store: Arc<dyn StateStore>) -> Result<SyncJob> {
    let client = HomeAssistantClient::new()?;
    let builder = SnapshotBuilder::local(Arc::new(config.source()));
    Ok(SyncJob::new(store, builder, Arc::new(client)).with_observer(Arc::new(LogObserver)))
}

async fn login(
    store: &dyn StateStore,
    url: String,
    token: String,
    sensor: String,
    interval: Option<u64>,
) -> Result<()> {
    let client = HomeAssistantClient::new()?;
    let outcome = client.check(&url, &token).await;
    if !outcome.success {
        bail!("Could not reach Home Assistant at {}: {}", url, outcome.message);
    }

    store.update(&|state| {
        state.url = Some(url.clone());
        state.token = Some(token.clone());
        state.sensor = Some(sensor.clone());
        if let Some(secs) = interval {
            state.update_interval = secs.to_string();
        }
    })?;
    println!("{} Logged in ({})", Green.paint("✓"), outcome.message);
    Ok(())
}

fn settings(
    store: &dyn StateStore,
    auto_sync: Option<bool>,
    days: Option<i64>,
    interval: Option<u64>,
    enable: Vec<Category>,
    disable: Vec<Category>,
) -> Result<()> {
    let unchanged = auto_sync.is_none()
        && days.is_none()
        && interval.is_none()
        && enable.is_empty()
        && disable.is_empty();

    let state = if unchanged {
        store.load()?
    } else {
        store.update(&|state| {
            if let Some(on) = auto_sync {
                state.auto_sync = on;
            }
            if let Some(days) = days {
                state.sync_days = days;
            }
            if let Some(secs) = interval {
                state.update_interval = secs.to_string();
            }
            for &category in &enable {
                state.set_enabled(category, true);
            }
            for &category in &disable {
                state.set_enabled(category, false);
            }
        })?
    };

    print_settings(&state);
    Ok(())
}

async fn run(config: &Config, store: Arc<dyn StateStore>) -> Result<()> {
    let period = store.load()?.interval();
    let job = build_job(config, store.clone())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    info!(interval_secs = period.as_secs(), "starting periodic sync");
    let mut schedule = SyncSchedule::new(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = schedule.tick() => {}
        }
        match job.run_until_cancelled(&cancel).await {
            Some(JobOutcome::Failed { message, .. }) => warn!(%message, "sync cycle failed"),
            Some(outcome) => debug!(?outcome, "sync cycle finished"),
            None => break,
        }

        // Settings may have been changed while running.
        match store.load() {
            Ok(state) => {
                if schedule.retune(state.interval()) {
                    info!(interval_secs = schedule.period().as_secs(), "sync interval changed");
                }
            }
            Err(err) => warn!(error = %err, "failed to reload settings"),
        }
    }

    info!("stopped");
    Ok(())
}

fn status(store: &dyn StateStore) -> Result<()> {
    let state = store.load()?;
    let bold = Style::new().bold();

    let last_sync = format_timestamp_ms(state.last_sync.unwrap_or(0));
    println!("{} {}", bold.paint("Last sync: "), Green.paint(last_sync));
    match &state.last_error {
        Some(err) => println!(
            "{} {} ({})",
            bold.paint("Last error:"),
            Red.paint(err.message.as_str()),
            format_timestamp_ms(err.timestamp)
        ),
        None => println!("{} none", bold.paint("Last error:")),
    }

    let snapshot = store
        .load_snapshot()
        .context("Failed to read cached snapshot")?;
    let Some(snapshot) = snapshot else {
        println!("\nNo cached data yet.");
        return Ok(());
    };

    println!(
        "\n{} {}",
        bold.paint("Cached data from"),
        format_timestamp_ms(snapshot.generated_at)
    );
    for (category, summary) in &snapshot.categories {
        match summary {
            Some(summary) => println!(
                "  {} {} day(s)",
                Cyan.paint(format!("{:<12}", category.key())),
                summary.day_count()
            ),
            None => println!(
                "  {} {}",
                Cyan.paint(format!("{:<12}", category.key())),
                Yellow.paint("no data")
            ),
        }
    }
    if let Some(last) = snapshot.sleep().and_then(|s| s.last_sleep.as_ref()) {
        println!(
            "\n{} {} ({:.0}% asleep)",
            bold.paint("Last sleep:"),
            last.total_duration_formatted,
            last.sleep_percentage
        );
    }
    if !snapshot.unavailable.is_empty() {
        println!(
            "\n{} {}",
            bold.paint("Unavailable:"),
            Yellow.paint(snapshot.unavailable.join(", "))
        );
    }
    Ok(())
}

async fn check(store: &dyn StateStore) -> Result<()> {
    let state = store.load()?;
    let login = state
        .login()
        .context("Not logged in; run `healthsync login` first")?;

    let client = HomeAssistantClient::new()?;
    let outcome = client.check(&login.base_url, &login.token).await;
    if outcome.success {
        println!("{} {} ({})", Green.paint("✓"), login.base_url, outcome.message);
        Ok(())
    } else {
        bail!("Connection to {} failed: {}", login.base_url, outcome.message)
    }
}

fn print_outcome(outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Synced { at_ms } => {
            println!("{} Synced at {}", Green.paint("✓"), format_timestamp_ms(*at_ms))
        }
        JobOutcome::Skipped(SkipReason::AutoSyncDisabled) => {
            println!("{} Auto sync is disabled", Yellow.paint("-"))
        }
        JobOutcome::Skipped(SkipReason::LoginNotConfigured) => {
            println!("{} Not logged in, nothing to do", Yellow.paint("-"))
        }
        JobOutcome::Failed { message, .. } => println!("{} {}", Red.paint("✗"), message),
    }
}

fn print_settings(state: &SyncState) {
    let on_off = |on: bool| if on { Green.paint("on") } else { Red.paint("off") };

    println!("Auto sync:  {}", on_off(state.auto_sync));
    println!("Sync days:  {}", state.sync_days());
    println!("Interval:   {}s", state.interval().as_secs());
    match state.login() {
        Some(login) => println!("Sensor:     sensor.{} @ {}", login.sensor_id, login.base_url),
        None => println!("Sensor:     {}", Yellow.paint("not configured")),
    }
    println!("Categories:");
    for category in Category::ALL {
        println!("  {:<12} {}", category.key(), on_off(state.is_enabled(category)));
    }
}
