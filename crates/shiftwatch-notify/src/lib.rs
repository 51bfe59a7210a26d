//! Notification dispatch behind a small `Notify` trait.
//!
//! The destination is a URL whose scheme picks the backend: `ntfy://` /
//! `ntfys://` for an ntfy topic, `gotify://` / `gotifys://` for a Gotify
//! server, and plain `http://` / `https://` for a generic JSON webhook.

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "shiftwatch-notify";

#[derive(Debug, Error)]
pub enum NotifyError {
    /// The destination URL cannot be understood. Raised at startup, before
    /// any polling happens, so a typo is caught immediately.
    #[error("invalid notification target: {0}")]
    InvalidTarget(String),
    #[error("notification dispatch failed: {0}")]
    Dispatch(#[from] reqwest::Error),
}

/// One-shot notification delivery. One call per polling cycle at most.
#[async_trait]
pub trait Notify: Send + Sync {
    async fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    /// POST to the topic URL, title via the `X-Title` header.
    Ntfy { endpoint: String },
    /// POST to `/message?token=...` with a JSON payload.
    Gotify { endpoint: String, token: String },
    /// POST `{"title", "body"}` to the URL as-is.
    Webhook { endpoint: String },
}

pub struct Notifier {
    http: reqwest::Client,
    target: Target,
}

impl Notifier {
    pub fn from_url(url: &str) -> Result<Self, NotifyError> {
        let target = parse_target(url)?;
        let http = reqwest::Client::new();
        Ok(Self { http, target })
    }
}

fn parse_target(url: &str) -> Result<Target, NotifyError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| NotifyError::InvalidTarget(format!("no scheme in {url:?}")))?;

    let transport = |secure: bool| if secure { "https" } else { "http" };

    match scheme {
        "ntfy" | "ntfys" => {
            let (host, topic) = rest
                .split_once('/')
                .filter(|(host, topic)| !host.is_empty() && !topic.is_empty())
                .ok_or_else(|| {
                    NotifyError::InvalidTarget(format!("expected {scheme}://host/topic, got {url:?}"))
                })?;
            Ok(Target::Ntfy {
                endpoint: format!("{}://{}/{}", transport(scheme == "ntfys"), host, topic),
            })
        }
        "gotify" | "gotifys" => {
            let (host, token) = rest
                .split_once('/')
                .filter(|(host, token)| !host.is_empty() && !token.is_empty())
                .ok_or_else(|| {
                    NotifyError::InvalidTarget(format!(
                        "expected {scheme}://host/apptoken, got {url:?}"
                    ))
                })?;
            Ok(Target::Gotify {
                endpoint: format!("{}://{}/message", transport(scheme == "gotifys"), host),
                token: token.to_string(),
            })
        }
        "http" | "https" => {
            if rest.is_empty() {
                return Err(NotifyError::InvalidTarget(format!("empty host in {url:?}")));
            }
            Ok(Target::Webhook {
                endpoint: url.to_string(),
            })
        }
        other => Err(NotifyError::InvalidTarget(format!(
            "unsupported scheme {other:?} in {url:?}"
        ))),
    }
}

#[async_trait]
impl Notify for Notifier {
    async fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        match &self.target {
            Target::Ntfy { endpoint } => {
                self.http
                    .post(endpoint)
                    .header("x-title", title)
                    .body(body.to_string())
                    .send()
                    .await?
                    .error_for_status()?;
            }
            Target::Gotify { endpoint, token } => {
                self.http
                    .post(endpoint)
                    .query(&[("token", token.as_str())])
                    .json(&json!({"title": title, "message": body}))
                    .send()
                    .await?
                    .error_for_status()?;
            }
            Target::Webhook { endpoint } => {
                self.http
                    .post(endpoint)
                    .json(&json!({"title": title, "body": body}))
                    .send()
                    .await?
                    .error_for_status()?;
            }
        }
        debug!(title, "notification dispatched");
        Ok(())
    }
}
