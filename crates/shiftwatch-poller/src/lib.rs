//! Polling-cycle orchestration: fetch, diff, match, claim, notify, persist.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use shiftwatch_adapters::{ApiError, ShiftSource};
use shiftwatch_core::{diff_new, filter_valid, RecurringTimeslot, Shift};
use shiftwatch_notify::Notify;
use shiftwatch_storage::StateStore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shiftwatch-poller";

const ERROR_NOTIFICATION_TITLE: &str = "shiftwatch error";

#[derive(Debug, Clone, Copy, Default)]
pub struct PollerConfig {
    /// Claim every matching shift instead of only reporting it.
    pub auto_claim: bool,
    /// Delay between cycles; `None` runs exactly one cycle.
    pub frequency: Option<Duration>,
}

/// Outcome of one completed polling cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub fetched: usize,
    pub new: usize,
    pub valid: usize,
    pub claimed: usize,
    pub claim_failures: usize,
}

pub struct Poller {
    source: Box<dyn ShiftSource>,
    notifier: Box<dyn Notify>,
    store: Arc<StateStore>,
    config: PollerConfig,
}

impl Poller {
    pub fn new(
        source: Box<dyn ShiftSource>,
        notifier: Box<dyn Notify>,
        store: Arc<StateStore>,
        config: PollerConfig,
    ) -> Self {
        Self {
            source,
            notifier,
            store,
            config,
        }
    }

    /// First-run seeding: with zero stored timeslots nothing would ever
    /// match, so synthesize and persist the catch-all timeslot before any
    /// matching happens. Returns whether a default was created.
    pub async fn ensure_default_timeslot(&self) -> anyhow::Result<bool> {
        if !self.store.timeslots().await.is_empty() {
            return Ok(false);
        }
        info!("no timeslots configured, creating a catch-all default");
        self.store
            .replace_timeslots(vec![RecurringTimeslot::catch_all()])
            .await
            .context("persisting the default timeslot")?;
        Ok(true)
    }

    /// One complete fetch -> diff -> persist -> match -> claim -> notify
    /// pass. The fetched snapshot replaces the seen-set unconditionally and
    /// before any claim is attempted, so a claim failure never causes a
    /// shift to be re-reported as new on the next cycle.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let current = self
            .source
            .available_shifts()
            .await
            .context("listing available shifts")?;
        let previous = self.store.previous_shifts().await;
        debug!(%run_id, fetched = current.len(), previously_seen = previous.len(), "listing fetched");

        let new_shifts = diff_new(&current, &previous);
        self.store
            .replace_shifts(current.clone())
            .await
            .context("persisting the seen-shift snapshot")?;

        let timeslots = self.store.timeslots().await;
        let valid = filter_valid(&new_shifts, &timeslots);
        debug!(%run_id, new = new_shifts.len(), valid = valid.len(), "matched against timeslots");

        // Stable report order, and a deterministic claim order with it.
        let mut valid: Vec<Shift> = valid.into_iter().collect();
        valid.sort_by_key(|s| (s.start, s.id));

        let mut claimed = 0usize;
        let mut claim_failures = 0usize;
        if self.config.auto_claim {
            for shift in &valid {
                match self.source.claim(shift).await {
                    Ok(()) => {
                        info!(%run_id, id = shift.id, "claimed shift {shift}");
                        claimed += 1;
                    }
                    Err(ApiError::Unclaimable { id, status }) => {
                        warn!(%run_id, id, %status, "shift is not claimable, skipping");
                        claim_failures += 1;
                    }
                    Err(err) => {
                        warn!(%run_id, id = shift.id, %err, "claim attempt failed");
                        claim_failures += 1;
                    }
                }
            }
        }

        if !valid.is_empty() {
            let title = format!(
                "{} new shifts were {}",
                valid.len(),
                if self.config.auto_claim {
                    "procured."
                } else {
                    "found."
                }
            );
            let body = valid
                .iter()
                .map(Shift::to_string)
                .collect::<Vec<_>>()
                .join("\n");
            self.notifier
                .notify(&title, &body)
                .await
                .context("dispatching the shift notification")?;
        } else {
            info!(%run_id, "no new matching shifts");
        }

        Ok(CycleSummary {
            run_id,
            fetched: current.len(),
            new: new_shifts.len(),
            valid: valid.len(),
            claimed,
            claim_failures,
        })
    }

    /// Runs cycles forever (or once without a frequency). Each cycle sits
    /// inside a catch-all boundary: a failed cycle is logged and reported
    /// through the notification channel best-effort, then the loop goes on.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.ensure_default_timeslot().await?;

        loop {
            match self.run_cycle().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    fetched = summary.fetched,
                    new = summary.new,
                    valid = summary.valid,
                    claimed = summary.claimed,
                    claim_failures = summary.claim_failures,
                    "cycle finished"
                ),
                Err(err) => {
                    error!(err = %format!("{err:#}"), "polling cycle failed");
                    if let Err(notify_err) = self
                        .notifier
                        .notify(ERROR_NOTIFICATION_TITLE, &format!("{err:#}"))
                        .await
                    {
                        error!(%notify_err, "could not deliver the error notification");
                    }
                }
            }

            match self.config.frequency {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Ok(()),
            }
        }
    }
}
