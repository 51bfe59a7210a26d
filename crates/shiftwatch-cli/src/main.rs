use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use shiftwatch_adapters::{RosterClient, RosterConfig};
use shiftwatch_core::{day_index, RecurringTimeslot};
use shiftwatch_notify::Notifier;
use shiftwatch_poller::{Poller, PollerConfig};
use shiftwatch_storage::StateStore;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shiftwatch")]
#[command(about = "Watches the roster service for shifts matching your timeslots")]
struct Cli {
    /// Path of the JSON state file.
    #[arg(long, global = true, default_value = "data.json")]
    state_file: PathBuf,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll for new shifts, notify about matches, optionally claim them.
    Watch {
        /// Roster account email.
        email: String,
        /// Roster account password.
        password: String,
        /// Employee id (app -> my profile -> id).
        employee_id: u64,
        /// Notification target (ntfy://, gotify://, or an http(s) webhook).
        notify_url: String,
        /// Automatically take every shift that fits your timeslots.
        #[arg(long)]
        auto_take: bool,
        /// Poll every this many seconds; without it, run a single cycle.
        #[arg(short, long, value_name = "seconds")]
        frequency: Option<u64>,
    },
    /// Manage the recurring timeslots used to filter shifts.
    #[command(subcommand)]
    Timeslot(TimeslotCommand),
}

#[derive(Debug, Subcommand)]
enum TimeslotCommand {
    /// Print the configured timeslots.
    List,
    /// Add a timeslot.
    Add {
        /// Comma-separated weekday names (monday,tue,...).
        #[arg(long, value_delimiter = ',', required = true)]
        days: Vec<String>,
        /// Window start, HH:MM.
        #[arg(long)]
        start: String,
        /// Window end, HH:MM.
        #[arg(long)]
        end: String,
        /// Minimum shift length in minutes.
        #[arg(long, default_value_t = 0)]
        min_minutes: u32,
    },
    /// Delete a timeslot by its number as shown by `list`.
    Delete { index: usize },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Watch {
            email,
            password,
            employee_id,
            notify_url,
            auto_take,
            frequency,
        } => {
            // Fail fast on a bad notification target, before touching the API.
            let notifier = Notifier::from_url(&notify_url)
                .with_context(|| format!("invalid notification url {notify_url:?}"))?;

            let store = Arc::new(StateStore::open(&cli.state_file).await);
            if auto_take && store.timeslots().await.is_empty() {
                warn!(
                    "auto-take is enabled with no timeslots configured; \
                     a catch-all default will be created and EVERY new shift will be claimed"
                );
            }

            let mut client = RosterClient::new(
                RosterConfig::new(email, password, employee_id),
                store.clone(),
            )?;
            client.detect_app_version().await;

            let poller = Poller::new(
                Box::new(client),
                Box::new(notifier),
                store,
                PollerConfig {
                    auto_claim: auto_take,
                    frequency: frequency.map(Duration::from_secs),
                },
            );
            poller.run().await
        }
        Commands::Timeslot(command) => {
            let store = StateStore::open(&cli.state_file).await;
            run_timeslot_command(&store, command).await
        }
    }
}

async fn run_timeslot_command(store: &StateStore, command: TimeslotCommand) -> Result<()> {
    match command {
        TimeslotCommand::List => {
            let timeslots = store.timeslots().await;
            if timeslots.is_empty() {
                println!("no timeslots configured");
            }
            for (i, slot) in timeslots.iter().enumerate() {
                println!("{}. {}", i + 1, slot);
            }
            Ok(())
        }
        TimeslotCommand::Add {
            days,
            start,
            end,
            min_minutes,
        } => {
            let mut day_set = BTreeSet::new();
            for name in &days {
                match day_index(name) {
                    Some(day) => {
                        day_set.insert(day);
                    }
                    None => bail!("unknown weekday {name:?} (use full names like monday)"),
                }
            }
            let start = parse_clock(&start)?;
            let end = parse_clock(&end)?;
            let slot = RecurringTimeslot::new(day_set, start, end, min_minutes)
                .context("invalid timeslot")?;
            store.add_timeslot(slot.clone()).await?;
            println!("added: {slot}");
            Ok(())
        }
        TimeslotCommand::Delete { index } => {
            if index == 0 {
                bail!("timeslot numbers start at 1");
            }
            match store.remove_timeslot(index - 1).await? {
                Some(removed) => {
                    println!("deleted: {removed}");
                    Ok(())
                }
                None => bail!("no timeslot number {index}"),
            }
        }
    }
}

fn parse_clock(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .with_context(|| format!("invalid clock time {raw:?}, expected HH:MM"))
}
