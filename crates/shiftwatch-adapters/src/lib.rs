//! Roster API client: auth with token guard, listing normalization, claims.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use shiftwatch_core::{Shift, ShiftStatus};
use shiftwatch_storage::{StateStore, TokenCache};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "shiftwatch-adapters";

/// Client-side token lifetime, deliberately ~100s shorter than the
/// server-side expiry so a refresh never races the deadline.
pub const TOKEN_TTL_SECS: i64 = 3500;

/// Fallback mobile app identity for the auth user-agent; the live value is
/// looked up best-effort from the public release metadata endpoint.
pub const FALLBACK_APP_VERSION: u32 = 291;
pub const FALLBACK_APP_SHORT_VERSION: &str = "v3.2209.4";

const APP_VERSION_URL: &str =
    "https://api.appcenter.ms/v0.1/public/sdk/apps/91607026-b44d-46a9-86f9-7d59d86e3105/releases/latest";
const LISTING_HORIZON_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Credential rejection or an unexpected auth response shape. Fatal for
    /// the cycle; the next cycle re-authenticates from scratch.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Network or HTTP failure while listing/claiming. Not retried within
    /// the cycle.
    #[error("transient fetch failure: {0}")]
    Transient(#[from] reqwest::Error),
    /// The listing response is missing expected fields. The whole cycle is
    /// aborted rather than risking a silent misread of a schema change.
    #[error("malformed listing response: {0}")]
    MalformedResponse(String),
    /// Claiming a shift whose status is not claimable is a logic error, not
    /// a transient failure. Never retried.
    #[error("shift {id} is not claimable (status {status})")]
    Unclaimable { id: u64, status: ShiftStatus },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Where shift listings come from and how claims are dispatched. The poller
/// depends on this seam so cycles can run against an in-memory fake.
#[async_trait]
pub trait ShiftSource: Send + Sync {
    /// All currently listed candidate shifts, every category merged by id.
    async fn available_shifts(&self) -> Result<HashSet<Shift>, ApiError>;

    /// Attempts to take one shift, routed by its status.
    async fn claim(&self, shift: &Shift) -> Result<(), ApiError>;
}

#[derive(Debug, Clone)]
pub struct RosterConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
    pub employee_id: u64,
    pub time_zone: String,
}

impl RosterConfig {
    pub fn new(email: impl Into<String>, password: impl Into<String>, employee_id: u64) -> Self {
        Self {
            base_url: "https://dk.usehurrier.com".to_string(),
            email: email.into(),
            password: password.into(),
            employee_id,
            time_zone: "Europe/Copenhagen".to_string(),
        }
    }
}

/// Raw listing record. The swap and unassigned listings drifted apart on
/// field names over API revisions, hence the aliases.
#[derive(Debug, Clone, Deserialize)]
struct RawShiftRecord {
    #[serde(alias = "shift_id")]
    id: u64,
    start: NaiveDateTime,
    end: NaiveDateTime,
    #[serde(alias = "status")]
    state: ShiftStatus,
    time_zone: String,
    starting_point_id: i64,
    starting_point_name: String,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
    city_id: i64,
}

#[derive(Debug, Deserialize)]
struct AppVersionResponse {
    version: Option<String>,
    short_version: Option<String>,
}

pub struct RosterClient {
    http: reqwest::Client,
    config: RosterConfig,
    store: Arc<StateStore>,
    app_version: u32,
    app_short_version: String,
}

impl RosterClient {
    pub fn new(config: RosterConfig, store: Arc<StateStore>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(Self {
            http,
            config,
            store,
            app_version: FALLBACK_APP_VERSION,
            app_short_version: FALLBACK_APP_SHORT_VERSION.to_string(),
        })
    }

    /// Best-effort lookup of the current mobile app version for the auth
    /// user-agent. Any failure keeps the pinned fallback.
    pub async fn detect_app_version(&mut self) {
        let resp = match self.http.get(APP_VERSION_URL).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!(status = %resp.status(), "app version lookup refused, using fallback");
                return;
            }
            Err(err) => {
                debug!(%err, "app version lookup failed, using fallback");
                return;
            }
        };
        match resp.json::<AppVersionResponse>().await {
            Ok(meta) => {
                if let Some(version) = meta.version.as_deref().and_then(|v| v.parse().ok()) {
                    self.app_version = version;
                }
                if let Some(short) = meta.short_version {
                    self.app_short_version = short;
                }
                debug!(
                    version = self.app_version,
                    short_version = %self.app_short_version,
                    "detected app version"
                );
            }
            Err(err) => debug!(%err, "app version response unreadable, using fallback"),
        }
    }

    fn user_agent(&self) -> String {
        format!(
            "Roadrunner/ANDROID/{}/{}",
            self.app_version, self.app_short_version
        )
    }

    /// Authenticates and persists the fresh token cache.
    pub async fn authenticate(&self) -> Result<TokenCache, ApiError> {
        info!("authenticating against the roster service");
        let url = format!("{}/api/mobile/auth", self.config.base_url);
        let body = json!({
            "user": {
                "user_name": self.config.email,
                "password": self.config.password,
            }
        });

        let resp = self
            .http
            .post(&url)
            .header("user-agent", self.user_agent())
            .json(&body)
            .send()
            .await
            .map_err(|err| ApiError::Authentication(err.to_string()))?;

        if !resp.status().is_success() {
            return Err(ApiError::Authentication(format!(
                "server responded with {} (wrong credentials?)",
                resp.status()
            )));
        }

        let auth: AuthResponse = resp
            .json()
            .await
            .map_err(|err| ApiError::Authentication(format!("unexpected auth response: {err}")))?;

        let cache = TokenCache {
            token: auth.token,
            expires_at: Utc::now() + Duration::seconds(TOKEN_TTL_SECS),
            city_id: auth.city_id,
        };
        self.store
            .save_token(cache.clone())
            .await
            .map_err(ApiError::Other)?;
        Ok(cache)
    }

    /// Precondition guard for every authenticated call: reuse the cached
    /// token while it is fresh, re-authenticate otherwise.
    async fn ensure_token(&self) -> Result<TokenCache, ApiError> {
        match self.store.token().await {
            Some(cache) if !cache.is_expired(Utc::now()) => Ok(cache),
            _ => self.authenticate().await,
        }
    }

    fn listing_params(&self, city_id: i64) -> Vec<(&'static str, String)> {
        let now = Utc::now();
        let fmt = "%Y-%m-%dT%H:%M:%S%.3fZ";
        vec![
            ("start_at", now.format(fmt).to_string()),
            (
                "end_at",
                (now + Duration::days(LISTING_HORIZON_DAYS)).format(fmt).to_string(),
            ),
            ("city_id", city_id.to_string()),
            ("with_time_zone", self.config.time_zone.clone()),
        ]
    }

    async fn fetch_listing(
        &self,
        url: &str,
        token: &TokenCache,
    ) -> Result<HashSet<Shift>, ApiError> {
        let resp = self
            .http
            .get(url)
            .query(&self.listing_params(token.city_id))
            .bearer_auth(&token.token)
            .send()
            .await?
            .error_for_status()?;
        let body = resp.bytes().await?;
        normalize_listing(&body)
    }

    async fn claim_swap(&self, shift: &Shift, token: &TokenCache) -> Result<(), ApiError> {
        let url = format!("{}/api/rooster/v3/{}/swap", self.config.base_url, shift.id);
        self.http
            .post(&url)
            .bearer_auth(&token.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn claim_unassigned(&self, shift: &Shift, token: &TokenCache) -> Result<(), ApiError> {
        let url = format!(
            "{}/api/rooster/v3/unassigned_shifts/{}/assign",
            self.config.base_url, shift.id
        );
        let body = json!({
            "id": shift.id,
            "start_at": shift.start,
            "end_at": shift.end,
            "starting_point_id": shift.starting_point_id,
            "employee_ids": [self.config.employee_id],
        });
        self.http
            .post(&url)
            .bearer_auth(&token.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl ShiftSource for RosterClient {
    async fn available_shifts(&self) -> Result<HashSet<Shift>, ApiError> {
        let token = self.ensure_token().await?;
        let swaps_url = format!(
            "{}/api/rooster/v3/employees/{}/available_swaps",
            self.config.base_url, self.config.employee_id
        );
        let unassigned_url = format!(
            "{}/api/rooster/v3/employees/{}/available_unassigned_shifts",
            self.config.base_url, self.config.employee_id
        );

        let swaps = self.fetch_listing(&swaps_url, &token).await?;
        let unassigned = self.fetch_listing(&unassigned_url, &token).await?;
        debug!(
            swaps = swaps.len(),
            unassigned = unassigned.len(),
            "fetched shift listings"
        );

        // Union by id; the categories are disjoint in practice.
        let mut merged = swaps;
        merged.extend(unassigned);
        Ok(merged)
    }

    async fn claim(&self, shift: &Shift) -> Result<(), ApiError> {
        if !shift.status.is_claimable() {
            return Err(ApiError::Unclaimable {
                id: shift.id,
                status: shift.status,
            });
        }
        let token = self.ensure_token().await?;
        match shift.status {
            ShiftStatus::Pending => self.claim_swap(shift, &token).await,
            ShiftStatus::Unassigned => self.claim_unassigned(shift, &token).await,
            // is_claimable() above makes this unreachable.
            status => Err(ApiError::Unclaimable {
                id: shift.id,
                status,
            }),
        }
    }
}

/// Decodes one listing body into normalized shifts.
///
/// Any missing or malformed field fails the whole listing: the upstream API
/// is undocumented and changes shape without notice, and failing loudly
/// beats silently dropping records.
fn normalize_listing(body: &[u8]) -> Result<HashSet<Shift>, ApiError> {
    let records: Vec<RawShiftRecord> = serde_json::from_slice(body)
        .map_err(|err| ApiError::MalformedResponse(err.to_string()))?;

    let mut shifts = HashSet::with_capacity(records.len());
    for record in records {
        if record.start >= record.end {
            return Err(ApiError::MalformedResponse(format!(
                "shift {} has start {} not before end {}",
                record.id, record.start, record.end
            )));
        }
        let replaced = shifts.replace(Shift {
            id: record.id,
            start: record.start,
            end: record.end,
            status: record.state,
            time_zone: record.time_zone,
            starting_point_id: record.starting_point_id,
            starting_point_name: record.starting_point_name,
        });
        if let Some(dup) = replaced {
            warn!(id = dup.id, "listing repeated a shift id, keeping the later record");
        }
    }
    Ok(shifts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn swap_record(id: u64) -> serde_json::Value {
        json!({
            "shift_id": id,
            "start": "2023-01-02T10:00:00",
            "end": "2023-01-02T12:00:00",
            "status": "PENDING",
            "time_zone": "Europe/Copenhagen",
            "starting_point_id": 3,
            "starting_point_name": "Central"
        })
    }

    fn unassigned_record(id: u64) -> serde_json::Value {
        json!({
            "id": id,
            "start": "2023-01-03T14:00:00",
            "end": "2023-01-03T18:00:00",
            "state": "UNASSIGNED",
            "time_zone": "Europe/Copenhagen",
            "starting_point_id": 5,
            "starting_point_name": "Harbour"
        })
    }

    async fn store_with_valid_token(dir: &tempfile::TempDir) -> Arc<StateStore> {
        let store = Arc::new(StateStore::open(dir.path().join("data.json")).await);
        store
            .save_token(TokenCache {
                token: "cached-token".into(),
                expires_at: Utc::now() + Duration::seconds(TOKEN_TTL_SECS),
                city_id: 1,
            })
            .await
            .expect("save token");
        store
    }

    fn client_for(server: &MockServer, store: Arc<StateStore>) -> RosterClient {
        let mut config = RosterConfig::new("me@example.com", "hunter2", 77);
        config.base_url = server.uri();
        RosterClient::new(config, store).expect("client")
    }

    #[test]
    fn normalize_accepts_both_listing_field_spellings() {
        let body = serde_json::to_vec(&json!([swap_record(1), unassigned_record(2)])).unwrap();
        let shifts = normalize_listing(&body).unwrap();
        assert_eq!(shifts.len(), 2);
        let swap = shifts.iter().find(|s| s.id == 1).unwrap();
        assert_eq!(swap.status, ShiftStatus::Pending);
        let slot = shifts.iter().find(|s| s.id == 2).unwrap();
        assert_eq!(slot.status, ShiftStatus::Unassigned);
        assert_eq!(slot.starting_point_name, "Harbour");
    }

    #[test]
    fn normalize_rejects_record_missing_fields() {
        let body = serde_json::to_vec(&json!([{ "shift_id": 1, "start": "2023-01-02T10:00:00" }]))
            .unwrap();
        let err = normalize_listing(&body).unwrap_err();
        assert!(matches!(err, ApiError::MalformedResponse(_)));
    }

    #[test]
    fn normalize_rejects_inverted_shift_bounds() {
        let mut record = swap_record(1);
        record["start"] = json!("2023-01-02T13:00:00");
        let body = serde_json::to_vec(&json!([record])).unwrap();
        let err = normalize_listing(&body).unwrap_err();
        assert!(matches!(err, ApiError::MalformedResponse(_)));
    }

    #[test]
    fn normalize_rejects_non_array_body() {
        let err = normalize_listing(br#"{"error":"schema changed"}"#).unwrap_err();
        assert!(matches!(err, ApiError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn authenticate_persists_a_token_with_conservative_ttl() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(StateStore::open(dir.path().join("data.json")).await);
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/mobile/auth"))
            .and(header("user-agent", "Roadrunner/ANDROID/291/v3.2209.4"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"token": "t1", "city_id": 9})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, store.clone());
        let before = Utc::now();
        let cache = client.authenticate().await.expect("auth");
        assert_eq!(cache.token, "t1");
        assert_eq!(cache.city_id, 9);
        assert!(cache.expires_at <= before + Duration::seconds(TOKEN_TTL_SECS + 5));

        let persisted = store.token().await.expect("persisted token");
        assert_eq!(persisted.token, "t1");
    }

    #[tokio::test]
    async fn rejected_credentials_surface_as_authentication_error() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(StateStore::open(dir.path().join("data.json")).await);
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/mobile/auth"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client_for(&server, store);
        let err = client.authenticate().await.unwrap_err();
        assert!(matches!(err, ApiError::Authentication(_)));
    }

    #[tokio::test]
    async fn available_shifts_merges_both_categories_without_reauth() {
        let dir = tempdir().expect("tempdir");
        let store = store_with_valid_token(&dir).await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/mobile/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token":"x","city_id":1})))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/rooster/v3/employees/77/available_swaps"))
            .and(header("authorization", "Bearer cached-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([swap_record(1)])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/rooster/v3/employees/77/available_unassigned_shifts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([unassigned_record(2)])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, store);
        let shifts = client.available_shifts().await.expect("shifts");
        assert_eq!(shifts.len(), 2);
    }

    #[tokio::test]
    async fn expired_token_triggers_reauthentication_before_listing() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(StateStore::open(dir.path().join("data.json")).await);
        store
            .save_token(TokenCache {
                token: "stale".into(),
                expires_at: Utc::now() - Duration::seconds(10),
                city_id: 1,
            })
            .await
            .expect("save token");

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/mobile/auth"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"token":"fresh","city_id":1})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server, store);
        let shifts = client.available_shifts().await.expect("shifts");
        assert!(shifts.is_empty());
    }

    #[tokio::test]
    async fn listing_http_failure_is_transient() {
        let dir = tempdir().expect("tempdir");
        let store = store_with_valid_token(&dir).await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = client_for(&server, store);
        let err = client.available_shifts().await.unwrap_err();
        assert!(matches!(err, ApiError::Transient(_)));
    }

    #[tokio::test]
    async fn claim_routes_pending_shifts_to_the_swap_endpoint() {
        let dir = tempdir().expect("tempdir");
        let store = store_with_valid_token(&dir).await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/rooster/v3/11/swap"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let day = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let shift = Shift {
            id: 11,
            start: day.and_hms_opt(10, 0, 0).unwrap(),
            end: day.and_hms_opt(12, 0, 0).unwrap(),
            status: ShiftStatus::Pending,
            time_zone: "Europe/Copenhagen".into(),
            starting_point_id: 3,
            starting_point_name: "Central".into(),
        };
        let client = client_for(&server, store);
        client.claim(&shift).await.expect("claim");
    }

    #[tokio::test]
    async fn claim_routes_unassigned_shifts_to_the_assign_endpoint() {
        let dir = tempdir().expect("tempdir");
        let store = store_with_valid_token(&dir).await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/rooster/v3/unassigned_shifts/12/assign"))
            .and(body_partial_json(json!({"id": 12, "employee_ids": [77]})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let day = NaiveDate::from_ymd_opt(2023, 1, 3).unwrap();
        let shift = Shift {
            id: 12,
            start: day.and_hms_opt(14, 0, 0).unwrap(),
            end: day.and_hms_opt(18, 0, 0).unwrap(),
            status: ShiftStatus::Unassigned,
            time_zone: "Europe/Copenhagen".into(),
            starting_point_id: 5,
            starting_point_name: "Harbour".into(),
        };
        let client = client_for(&server, store);
        client.claim(&shift).await.expect("claim");
    }

    #[tokio::test]
    async fn claiming_an_assigned_shift_is_a_logic_error() {
        let dir = tempdir().expect("tempdir");
        let store = store_with_valid_token(&dir).await;
        let server = MockServer::start().await;

        let day = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let shift = Shift {
            id: 13,
            start: day.and_hms_opt(10, 0, 0).unwrap(),
            end: day.and_hms_opt(12, 0, 0).unwrap(),
            status: ShiftStatus::Assigned,
            time_zone: "Europe/Copenhagen".into(),
            starting_point_id: 3,
            starting_point_name: "Central".into(),
        };
        let client = client_for(&server, store);
        let err = client.claim(&shift).await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::Unclaimable {
                id: 13,
                status: ShiftStatus::Assigned,
            }
        ));
    }
}
