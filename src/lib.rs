//! # pulse-sync
//!
//! Async Rust client that keeps a Wi-Fi pulse oximeter (an ESP32 exposing
//! `/connect` and `/readings` over HTTP) in sync with a backend store.
//!
//! The client polls the device, normalizes whatever field names the firmware
//! uses, tracks connectivity, and forwards every reading that carries a vital
//! sign to `POST {backend}/sensor-readings`.
//!
//! ## Routes
//!
//! | Mode | Device URL | When |
//! |---|---|---|
//! | Direct | `{device}/readings` | first attempt of a session |
//! | Proxied | `{backend}/esp32/readings` | after any direct failure; always for the background loop |
//!
//! A failed direct request is retried once through the relay, and the session
//! stays proxied from then on.
//!
//! ## Variants
//!
//! | | Foreground | Background |
//! |---|---|---|
//! | Started by | explicit connect, or a remembered connection | the auto-connect flag |
//! | Period | 3 s | 3 s visible, 10 s hidden |
//! | Gives up | never | after 3 consecutive failures (clears the flag) |
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use pulse_sync::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SyncClientConfig::default();
//!     let http = Arc::new(ReqwestTransport::new(config.request_timeout)?);
//!     let store = Arc::new(MemoryStore::new());
//!     store.set("token", "…");
//!     store.set("user_id", "1");
//!
//!     let (client, mut rx) = SyncClient::new(config, http, store);
//!     let handle = client.spawn();
//!     handle.connect().await?;
//!
//!     while let Some(event) = rx.recv().await {
//!         if let SyncEvent::Reading(r) = event {
//!             println!("HR {} bpm  SpO₂ {} %", r.heart_rate, r.spo2);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`sync_client`] | The client, its configuration, and the [`sync_client::SyncHandle`] command API |
//! | [`scheduler`] | Per-variant timing policy, replaceable poll timer, retry budget |
//! | [`state`] | Connection state machine |
//! | [`transport`] | HTTP seam and direct/proxied route selection |
//! | [`forwarder`] | Best-effort delivery to the backend sink |
//! | [`normalize`] | Firmware field aliases → canonical reading |
//! | [`store`] | Key-value persistence for credentials and flags |
//! | [`types`] | Data and event types |
//! | [`protocol`] | Paths, headers, storage keys, timing constants |
//! | [`error`] | Error types |

pub mod error;
pub mod forwarder;
pub mod normalize;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod sync_client;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Client ────────────────────────────────────────────────────────────────
    pub use crate::sync_client::{SyncClient, SyncClientConfig, SyncHandle, TickOutcome};

    // ── Seams ─────────────────────────────────────────────────────────────────
    pub use crate::store::{JsonFileStore, KeyValueStore, MemoryStore};
    pub use crate::transport::{HttpTransport, ReqwestTransport};

    // ── Data and events ───────────────────────────────────────────────────────
    pub use crate::error::{SyncError, TransportError};
    pub use crate::types::{
        CanonicalReading, ConnectionState, SyncEvent, SyncPayload, SyncStatus, TransportMode,
        Variant, Visibility,
    };
}
