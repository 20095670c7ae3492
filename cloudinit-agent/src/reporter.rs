//! Snapshot upload to the management endpoint
//!
//! One POST per target, bounded by the request timeout. Nothing here returns
//! an error: every transport or protocol problem becomes a [`ReportOutcome`]
//! and the caller moves on to the next target.

use crate::delta::DeltaSnapshot;
use crate::discovery::ReportTarget;
use crate::provisioning::ProvisioningDirective;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one report attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// HTTP 200, with the directive from `data` if there was one
    Accepted(Option<ProvisioningDirective>),
    ConnectionFailed(String),
    TimedOut,
    UnexpectedStatus(u16),
    InvalidResponse(String),
}

impl ReportOutcome {
    /// Transport failures; naturally retried next cycle
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ReportOutcome::ConnectionFailed(_) | ReportOutcome::TimedOut)
    }

    pub fn directive(&self) -> Option<&ProvisioningDirective> {
        match self {
            ReportOutcome::Accepted(directive) => directive.as_ref(),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, target: &ReportTarget, snapshot: &DeltaSnapshot) -> ReportOutcome;
}

/// `Reporter` that POSTs JSON over HTTP with reqwest
pub struct HttpReporter {
    client: reqwest::Client,
    path: String,
}

impl HttpReporter {
    pub fn new(timeout: Duration, path: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cloudinit-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            path: path.into(),
        })
    }
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn report(&self, target: &ReportTarget, snapshot: &DeltaSnapshot) -> ReportOutcome {
        let url = target.url(&self.path);
        info!(
            target = %url,
            power_state = snapshot.metrics().ac_status.code(),
            "Reporting host status"
        );
        if let Ok(body) = serde_json::to_string(snapshot) {
            debug!(target = %url, body = %body, "Report payload");
        }

        let response = match self.client.post(&url).json(snapshot).send().await {
            Ok(response) => response,
            Err(e) => return classify_transport_error(&url, e),
        };

        let status = response.status();
        info!(target = %url, status = status.as_u16(), "Report response");
        if status != StatusCode::OK {
            warn!(target = %url, status = status.as_u16(), "Unexpected report status");
            return ReportOutcome::UnexpectedStatus(status.as_u16());
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return classify_transport_error(&url, e),
        };

        match parse_directive(&body) {
            Ok(directive) => {
                if let Some(d) = &directive {
                    info!(target = %url, instance_id = %d.instance_id, "Report accepted with directive");
                } else {
                    debug!(target = %url, "Report accepted, no directive");
                }
                ReportOutcome::Accepted(directive)
            }
            Err(reason) => {
                warn!(target = %url, reason = %reason, "Malformed report response");
                ReportOutcome::InvalidResponse(reason)
            }
        }
    }
}

fn classify_transport_error(url: &str, e: reqwest::Error) -> ReportOutcome {
    if e.is_timeout() {
        warn!(target = %url, "Report timed out");
        ReportOutcome::TimedOut
    } else {
        warn!(target = %url, error = %e, "Report connection failed");
        ReportOutcome::ConnectionFailed(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    #[serde(default)]
    data: Value,
}

/// Extract the directive from a 200 body. Null or empty `data` means none.
fn parse_directive(body: &str) -> Result<Option<ProvisioningDirective>, String> {
    let response: ReportResponse =
        serde_json::from_str(body).map_err(|e| format!("invalid JSON body: {}", e))?;

    let empty = match &response.data {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(_) => false,
    };
    if empty {
        return Ok(None);
    }

    serde_json::from_value(response.data)
        .map(Some)
        .map_err(|e| format!("invalid directive: {}", e))
}
