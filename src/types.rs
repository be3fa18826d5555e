use std::fmt;

use serde::Serialize;

/// A raw device payload.
///
/// Key names differ between firmware builds (`heart_rate` vs. `heartRate` vs.
/// `bpm`, …). Only [`crate::normalize::normalize`] looks inside it.
pub type RawReading = serde_json::Map<String, serde_json::Value>;

/// A normalized oximeter sample.
///
/// Every field is present, finite, and non-negative. A sensor that is still
/// warming up reports zeros, which is a valid reading rather than an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CanonicalReading {
    /// Pulse in beats per minute.
    pub heart_rate: f64,
    /// Blood oxygen saturation in percent.
    pub spo2: f64,
    /// Raw infrared photodiode value.
    pub ir: f64,
    /// Raw red photodiode value.
    pub red: f64,
}

impl CanonicalReading {
    /// `true` while both vital signs are still zero.
    ///
    /// `ir` and `red` are ignored: the photodiodes report ambient light long
    /// before the pulse and saturation estimates settle.
    pub fn is_warming_up(&self) -> bool {
        self.heart_rate == 0.0 && self.spo2 == 0.0
    }
}

/// Body of `POST /sensor-readings`: the user id next to the reading fields.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SyncPayload {
    pub user_id: i64,
    #[serde(flatten)]
    pub reading: CanonicalReading,
}

impl SyncPayload {
    pub fn new(user_id: i64, reading: &CanonicalReading) -> Self {
        Self { user_id, reading: *reading }
    }
}

/// Connectivity as shown on the status indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Only during an explicit connect handshake; the poll loop never enters it.
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        })
    }
}

/// Which route requests to the device take.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportMode {
    /// Straight to the device on the local network.
    #[default]
    Direct,
    /// Through the backend's `/esp32` relay.
    Proxied,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportMode::Direct => "direct",
            TransportMode::Proxied => "proxied",
        })
    }
}

/// Whether the page hosting the client is in the foreground.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Which of the two polling loops a [`crate::sync_client::SyncClient`] runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Variant {
    /// User-driven: explicit connect/disconnect, error line, no cutoff.
    #[default]
    Foreground,
    /// Opt-in auto-connect: always proxied, visibility-throttled, gives up
    /// after repeated failures.
    Background,
}

/// Point-in-time view of a client, as consumed by a status display.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub variant: Variant,
    pub state: ConnectionState,
    pub mode: TransportMode,
    pub visibility: Visibility,
    /// `true` while the scheduler is arming poll ticks.
    pub polling: bool,
    pub last_reading: Option<CanonicalReading>,
    /// Most recent failure reason; always `None` for the background variant.
    pub last_error: Option<String>,
    /// Consecutive failed ticks (background variant only).
    pub consecutive_failures: u32,
}

/// Everything a running client reports to its owner.
///
/// Delivered through the receiver returned by
/// [`crate::sync_client::SyncClient::spawn`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A poll succeeded; carries the normalized sample.
    Reading(CanonicalReading),
    /// The backend stored a forwarded reading. Carries `reading_id` when the
    /// backend returned one.
    Forwarded(Option<serde_json::Value>),
    /// A poll or handshake failed (foreground variant only).
    Error(String),
    /// A poll succeeded after an error was shown.
    ErrorCleared,
    /// Requests now take a different route.
    TransportChanged(TransportMode),
    /// The background loop exhausted its retry budget and cleared the
    /// auto-connect flag.
    AutoConnectDisabled,
    /// The scheduler stopped arming ticks.
    Stopped,
}
