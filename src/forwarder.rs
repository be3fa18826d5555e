//! Best-effort delivery of readings to the backend sink.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;

use crate::protocol::READING_ID_FIELD;
use crate::transport::HttpTransport;
use crate::types::SyncPayload;

/// What happened to one forwarded reading. Informational only; callers never
/// act on it beyond logging and events.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOutcome {
    /// No bearer token available.
    NoToken,
    /// Heart rate and SpO₂ are both zero.
    WarmingUp,
    /// The backend accepted the reading. `reading_id` as returned, if any.
    Stored(Option<Value>),
    /// The backend was unreachable or rejected the reading.
    Failed(String),
}

/// POSTs [`SyncPayload`]s to `{backend}/sensor-readings`.
#[derive(Clone)]
pub struct ReadingForwarder {
    http: Arc<dyn HttpTransport>,
    url: String,
}

impl ReadingForwarder {
    pub fn new(http: Arc<dyn HttpTransport>, url: String) -> Self {
        Self { http, url }
    }

    /// Send `payload`. Never fails; the outcome is logged and returned.
    pub async fn forward(&self, token: Option<&str>, payload: &SyncPayload) -> ForwardOutcome {
        let Some(token) = token else {
            return ForwardOutcome::NoToken;
        };
        if payload.reading.is_warming_up() {
            debug!("Skipping forward: sensor warming up");
            return ForwardOutcome::WarmingUp;
        }

        let body = match serde_json::to_value(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("Could not encode reading: {e}");
                return ForwardOutcome::Failed(e.to_string());
            }
        };

        match self.http.post_json(&self.url, token, &body).await {
            Ok(resp) => {
                let id = resp.get(READING_ID_FIELD).cloned();
                match &id {
                    Some(id) => info!("Reading stored (reading_id={id})"),
                    None => info!("Reading stored (no reading_id in response)"),
                }
                ForwardOutcome::Stored(id)
            }
            Err(e) => {
                warn!("Forwarding reading failed: {e}");
                ForwardOutcome::Failed(e.to_string())
            }
        }
    }
}
