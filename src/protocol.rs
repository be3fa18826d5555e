//! HTTP paths, headers, storage keys, and timing constants shared by the
//! device, the backend tunnel, and the scheduler.

use std::time::Duration;

// ── Device surface ────────────────────────────────────────────────────────────

/// Handshake endpoint exposed by the oximeter firmware.
pub const CONNECT_PATH: &str = "/connect";

/// Live sensor snapshot endpoint.
pub const READINGS_PATH: &str = "/readings";

/// Prefix under which the backend relays requests to the device.
///
/// `GET {backend}/esp32/readings` reaches the same handler as
/// `GET {device}/readings` on the local network.
pub const PROXY_PREFIX: &str = "/esp32";

// ── Backend surface ───────────────────────────────────────────────────────────

/// Sink for forwarded readings (`POST`, JSON body).
pub const SENSOR_READINGS_PATH: &str = "/sensor-readings";

/// Field of the backend's success response carrying the stored row id.
pub const READING_ID_FIELD: &str = "reading_id";

// ── Headers ───────────────────────────────────────────────────────────────────

/// Header that makes the development tunnel skip its browser interstitial.
///
/// Sent on every request even though a production backend ignores it;
/// without it the tunnel answers with an HTML page instead of JSON.
pub const TUNNEL_WARNING_HEADER: &str = "ngrok-skip-browser-warning";

/// Value paired with [`TUNNEL_WARNING_HEADER`].
pub const TUNNEL_WARNING_VALUE: &str = "true";

// ── Storage keys ──────────────────────────────────────────────────────────────

/// Numeric id of the signed-in user.
pub const USER_ID_KEY: &str = "user_id";

/// Pre-acquired bearer token.
pub const TOKEN_KEY: &str = "token";

/// Set while the foreground client believes the device is connected, so a
/// restarted session resumes polling without a fresh handshake.
pub const LAST_CONNECTED_KEY: &str = "esp32_connected";

/// Opt-in flag for the background auto-connect loop.
pub const AUTO_CONNECT_KEY: &str = "auto_connect_enabled";

/// Serialized form of a set boolean flag.
pub const FLAG_TRUE: &str = "true";

/// User id attached to forwarded readings when none is stored.
pub const DEFAULT_USER_ID: i64 = 1;

// ── Timing ────────────────────────────────────────────────────────────────────

/// Poll period while the page is visible (both variants).
pub const VISIBLE_POLL_PERIOD: Duration = Duration::from_secs(3);

/// Poll period of the background variant while the page is hidden.
pub const HIDDEN_POLL_PERIOD: Duration = Duration::from_secs(10);

/// Consecutive failed ticks after which the background variant gives up and
/// clears [`AUTO_CONNECT_KEY`].
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Default per-request timeout.
///
/// Bounds how long a dead direct link can stall a tick before the proxied
/// retry runs.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Join a base URL and a path, tolerating a trailing slash on the base.
///
/// ```
/// # use pulse_sync::protocol::join_url;
/// assert_eq!(join_url("http://192.168.4.1/", "/readings"), "http://192.168.4.1/readings");
/// ```
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// Interpret a stored flag value.
///
/// Only the literal `"true"` counts as set; anything else, including a
/// missing key, reads as `false`.
pub fn flag_is_set(value: Option<&str>) -> bool {
    value == Some(FLAG_TRUE)
}
