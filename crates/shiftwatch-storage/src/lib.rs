//! Durable single-file JSON state: timeslots, seen shifts, token cache.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shiftwatch_core::{RecurringTimeslot, Shift};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shiftwatch-storage";

/// Cached bearer token with its conservative client-side expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCache {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub city_id: i64,
}

impl TokenCache {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    recurring_timeslots: Vec<RecurringTimeslot>,
    #[serde(default)]
    shifts: Vec<Shift>,
    #[serde(default)]
    token: Option<TokenCache>,
}

/// Explicit store handle, constructed once by the driver and shared.
///
/// The whole state lives in one JSON file. Every mutation rewrites the file
/// through a temp-file + atomic rename, so a crash mid-write leaves the
/// previous snapshot intact. There is only ever one writer process.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl StateStore {
    /// Opens the store, loading whatever state the backing file holds.
    ///
    /// A missing or unreadable file degrades to empty defaults rather than
    /// failing: first-run behavior upstream depends on an empty store, and a
    /// corrupt file should never take the watcher down.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(err) => {
                    warn!(path = %path.display(), %err, "state file is corrupt, starting empty");
                    PersistedState::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(err) => {
                warn!(path = %path.display(), %err, "state file is unreadable, starting empty");
                PersistedState::default()
            }
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn timeslots(&self) -> Vec<RecurringTimeslot> {
        self.state.lock().await.recurring_timeslots.clone()
    }

    pub async fn replace_timeslots(&self, timeslots: Vec<RecurringTimeslot>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.recurring_timeslots = timeslots;
        self.persist(&state).await
    }

    pub async fn add_timeslot(&self, timeslot: RecurringTimeslot) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.recurring_timeslots.push(timeslot);
        self.persist(&state).await
    }

    /// Removes and returns the timeslot at `index`, or `None` when out of
    /// range.
    pub async fn remove_timeslot(&self, index: usize) -> anyhow::Result<Option<RecurringTimeslot>> {
        let mut state = self.state.lock().await;
        if index >= state.recurring_timeslots.len() {
            return Ok(None);
        }
        let removed = state.recurring_timeslots.remove(index);
        self.persist(&state).await?;
        Ok(Some(removed))
    }

    pub async fn previous_shifts(&self) -> HashSet<Shift> {
        self.state.lock().await.shifts.iter().cloned().collect()
    }

    /// Replaces the seen-shift snapshot wholesale. A shift that drops out of
    /// the listing and reappears later is deliberately treated as new again.
    pub async fn replace_shifts(&self, shifts: HashSet<Shift>) -> anyhow::Result<()> {
        let mut sorted: Vec<Shift> = shifts.into_iter().collect();
        sorted.sort_by_key(|s| s.id);
        let mut state = self.state.lock().await;
        state.shifts = sorted;
        self.persist(&state).await
    }

    pub async fn token(&self) -> Option<TokenCache> {
        self.state.lock().await.token.clone()
    }

    pub async fn save_token(&self, token: TokenCache) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.token = Some(token);
        self.persist(&state).await
    }

    async fn persist(&self, state: &PersistedState) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(state).context("serializing state")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating state directory {}", parent.display()))?;
            }
        }

        let temp_path = self.path.with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("creating temp state file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming {} -> {}",
                        temp_path.display(),
                        self.path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use shiftwatch_core::ShiftStatus;
    use tempfile::tempdir;

    fn shift(id: u64) -> Shift {
        let day = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        Shift {
            id,
            start: day.and_hms_opt(10, 0, 0).unwrap(),
            end: day.and_hms_opt(12, 0, 0).unwrap(),
            status: ShiftStatus::Unassigned,
            time_zone: "Europe/Copenhagen".into(),
            starting_point_id: 1,
            starting_point_name: "Central".into(),
        }
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty_state() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("data.json")).await;
        assert!(store.timeslots().await.is_empty());
        assert!(store.previous_shifts().await.is_empty());
        assert!(store.token().await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_empty_state() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.json");
        std::fs::write(&path, "{not json at all").expect("write");
        let store = StateStore::open(&path).await;
        assert!(store.timeslots().await.is_empty());
        assert!(store.previous_shifts().await.is_empty());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.json");

        let store = StateStore::open(&path).await;
        store
            .replace_timeslots(vec![RecurringTimeslot::catch_all()])
            .await
            .expect("save timeslots");
        store
            .replace_shifts([shift(1), shift(2)].into())
            .await
            .expect("save shifts");
        store
            .save_token(TokenCache {
                token: "abc".into(),
                expires_at: Utc.with_ymd_and_hms(2023, 1, 2, 12, 0, 0).unwrap(),
                city_id: 4,
            })
            .await
            .expect("save token");

        let reopened = StateStore::open(&path).await;
        assert_eq!(reopened.timeslots().await, vec![RecurringTimeslot::catch_all()]);
        assert_eq!(reopened.previous_shifts().await.len(), 2);
        let token = reopened.token().await.expect("token");
        assert_eq!(token.token, "abc");
        assert_eq!(token.city_id, 4);
    }

    #[tokio::test]
    async fn replace_shifts_is_a_full_overwrite() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("data.json")).await;

        store.replace_shifts([shift(1)].into()).await.expect("save");
        store
            .replace_shifts([shift(2), shift(3)].into())
            .await
            .expect("save");

        let stored = store.previous_shifts().await;
        assert_eq!(stored.len(), 2);
        assert!(!stored.contains(&shift(1)));
    }

    #[tokio::test]
    async fn remove_timeslot_handles_out_of_range_index() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("data.json")).await;
        store
            .add_timeslot(RecurringTimeslot::catch_all())
            .await
            .expect("add");

        assert!(store.remove_timeslot(5).await.expect("remove").is_none());
        assert!(store.remove_timeslot(0).await.expect("remove").is_some());
        assert!(store.timeslots().await.is_empty());
    }

    #[tokio::test]
    async fn token_expiry_is_inclusive_of_the_deadline() {
        let expires_at = Utc.with_ymd_and_hms(2023, 1, 2, 12, 0, 0).unwrap();
        let cache = TokenCache {
            token: "t".into(),
            expires_at,
            city_id: 1,
        };
        assert!(!cache.is_expired(expires_at - chrono::Duration::seconds(1)));
        assert!(cache.is_expired(expires_at));
        assert!(cache.is_expired(expires_at + chrono::Duration::seconds(1)));
    }
}
