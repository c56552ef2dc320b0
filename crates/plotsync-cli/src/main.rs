use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use plotsync_storage::{archived_plot_statuses, overview, Store};
use plotsync_sync::{connect_store, shutdown_channel, ShutdownTrigger, SyncConfig};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "plotsync")]
#[command(about = "Keeps the plot telemetry store in step with the upstream feed")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile at startup and then every sync interval until interrupted.
    Run,
    /// Run a single reconciliation cycle.
    Sync {
        /// Read the snapshot from a local JSON file instead of the feed.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    Migrate,
    /// Latest general reading and every live plot.
    Overview,
    /// Sensor records of one plot.
    History {
        #[arg(long)]
        plot_id: i64,
        #[arg(long, default_value_t = 7, value_parser = days_parser())]
        days: i64,
    },
    GeneralHistory {
        #[arg(long, default_value_t = 7, value_parser = days_parser())]
        days: i64,
    },
    /// Plots archived within the window.
    Archived {
        #[arg(long, default_value_t = 30, value_parser = days_parser())]
        days: i64,
        /// Hide plots that have since reappeared upstream.
        #[arg(long)]
        still_archived: bool,
    },
}

// a century; keeps `now - days` inside chrono's range
const MAX_WINDOW_DAYS: i64 = 36_500;

fn days_parser() -> clap::builder::RangedI64ValueParser<i64> {
    clap::value_parser!(i64).range(0..=MAX_WINDOW_DAYS)
}

fn init_tracing() {
    let env_filter = std::env::var("PLOTSYNC_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn forward_signals(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received; finishing current cycle");
        trigger.fire();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "SIGTERM handler unavailable; listening for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let (trigger, shutdown) = shutdown_channel();
            forward_signals(trigger);
            plotsync_sync::run_scheduler_from_env(shutdown).await?;
        }
        Commands::Sync { fixture } => {
            let report = plotsync_sync::run_sync_once_from_env(fixture).await?;
            print_json(&report)?;
        }
        Commands::Migrate => {
            connect_store(&SyncConfig::from_env()).await?;
            info!("migrations up to date");
        }
        Commands::Overview => {
            let store = connect_store(&SyncConfig::from_env()).await?;
            print_json(&overview(store.as_ref()).await?)?;
        }
        Commands::History { plot_id, days } => {
            let store = connect_store(&SyncConfig::from_env()).await?;
            let since = Utc::now() - Duration::days(days);
            match store.plot_history(plot_id, since).await? {
                Some(history) => print_json(&history)?,
                None => bail!("plot {plot_id} is not live"),
            }
        }
        Commands::GeneralHistory { days } => {
            let store = connect_store(&SyncConfig::from_env()).await?;
            let since = Utc::now() - Duration::days(days);
            print_json(&store.general_history(since).await?)?;
        }
        Commands::Archived {
            days,
            still_archived,
        } => {
            let store = connect_store(&SyncConfig::from_env()).await?;
            let since = Utc::now() - Duration::days(days);
            let mut statuses = archived_plot_statuses(store.as_ref(), since).await?;
            if still_archived {
                statuses.retain(|s| s.still_archived);
            }
            print_json(&statuses)?;
        }
    }

    Ok(())
}
