//! Key-value persistence for credentials and session flags.
//!
//! The client never owns a storage format; it talks to whatever implements
//! [`KeyValueStore`]. Two implementations ship with the crate:
//!
//! | Type | Backing | Use |
//! |---|---|---|
//! | [`MemoryStore`] | `HashMap` | tests, embedding in a host that persists elsewhere |
//! | [`JsonFileStore`] | one JSON object on disk | the `pulse-sync` binary |

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::warn;

use crate::protocol::{flag_is_set, DEFAULT_USER_ID, FLAG_TRUE, TOKEN_KEY, USER_ID_KEY};

/// String-keyed, string-valued storage with no atomicity beyond single
/// operations. Several clients may share one store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);

    /// Read a boolean flag (see [`flag_is_set`]).
    fn flag(&self, key: &str) -> bool {
        flag_is_set(self.get(key).as_deref())
    }

    /// Set (`true`) or remove (`false`) a boolean flag.
    fn set_flag(&self, key: &str, on: bool) {
        if on {
            self.set(key, FLAG_TRUE);
        } else {
            self.remove(key);
        }
    }
}

// ── Credentials ───────────────────────────────────────────────────────────────

/// Identity needed before the client may touch the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user_id: i64,
}

impl Credentials {
    /// Both a non-empty token and a stored user id, or `None`.
    ///
    /// Used to gate connecting and starting the poll loop.
    pub fn load(store: &dyn KeyValueStore) -> Option<Self> {
        let token = bearer_token(store)?;
        let raw_id = store.get(USER_ID_KEY)?;
        let user_id = raw_id.trim().parse().unwrap_or_else(|_| {
            warn!("Stored user id {raw_id:?} is not numeric; using {DEFAULT_USER_ID}");
            DEFAULT_USER_ID
        });
        Some(Self { token, user_id })
    }
}

/// The stored bearer token, if non-empty.
pub fn bearer_token(store: &dyn KeyValueStore) -> Option<String> {
    store.get(TOKEN_KEY).filter(|t| !t.trim().is_empty())
}

/// The stored user id, or [`DEFAULT_USER_ID`] when missing or malformed.
pub fn user_id_or_default(store: &dyn KeyValueStore) -> i64 {
    store
        .get(USER_ID_KEY)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_USER_ID)
}

// ── MemoryStore ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries().insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        self.entries().remove(key);
    }
}

// ── JsonFileStore ─────────────────────────────────────────────────────────────

/// A flat JSON object on disk, rewritten on every change.
///
/// Write failures are logged and the in-memory copy stays authoritative for
/// the rest of the process, matching the best-effort contract of the trait.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    cache: MemoryStore,
}

impl JsonFileStore {
    /// Open `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cache = MemoryStore::new();
        if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            if !text.trim().is_empty() {
                let map: HashMap<String, String> = serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?;
                *cache.entries() = map;
            }
        }
        Ok(Self { path, cache })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) {
        let snapshot = self.cache.entries().clone();
        let result = serde_json::to_string_pretty(&snapshot)
            .map_err(anyhow::Error::from)
            .and_then(|text| fs::write(&self.path, text).map_err(anyhow::Error::from));
        if let Err(e) = result {
            warn!("Could not persist {}: {e}", self.path.display());
        }
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key)
    }

    fn set(&self, key: &str, value: &str) {
        self.cache.set(key, value);
        self.flush();
    }

    fn remove(&self, key: &str) {
        self.cache.remove(key);
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AUTO_CONNECT_KEY;

    #[test]
    fn credentials_need_token_and_user() {
        let store = MemoryStore::new();
        assert_eq!(Credentials::load(&store), None);

        store.set(TOKEN_KEY, "abc");
        assert_eq!(Credentials::load(&store), None);

        store.set(USER_ID_KEY, "42");
        assert_eq!(
            Credentials::load(&store),
            Some(Credentials { token: "abc".into(), user_id: 42 })
        );
    }

    #[test]
    fn blank_token_counts_as_missing() {
        let store = MemoryStore::new();
        store.set(TOKEN_KEY, "  ");
        store.set(USER_ID_KEY, "1");
        assert_eq!(Credentials::load(&store), None);
        assert_eq!(bearer_token(&store), None);
    }

    #[test]
    fn user_id_defaults_to_one() {
        let store = MemoryStore::new();
        assert_eq!(user_id_or_default(&store), 1);
        store.set(USER_ID_KEY, "not-a-number");
        assert_eq!(user_id_or_default(&store), 1);
        store.set(USER_ID_KEY, "12");
        assert_eq!(user_id_or_default(&store), 12);
    }

    #[test]
    fn flags_round_through_set_and_remove() {
        let store = MemoryStore::new();
        assert!(!store.flag(AUTO_CONNECT_KEY));
        store.set_flag(AUTO_CONNECT_KEY, true);
        assert!(store.flag(AUTO_CONNECT_KEY));
        store.set_flag(AUTO_CONNECT_KEY, false);
        assert_eq!(store.get(AUTO_CONNECT_KEY), None);

        store.set(AUTO_CONNECT_KEY, "yes");
        assert!(!store.flag(AUTO_CONNECT_KEY));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set(TOKEN_KEY, "abc");
        store.set(AUTO_CONNECT_KEY, "true");
        store.remove(AUTO_CONNECT_KEY);
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get(TOKEN_KEY).as_deref(), Some("abc"));
        assert_eq!(reopened.get(AUTO_CONNECT_KEY), None);
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(JsonFileStore::open(&path).is_err());
    }
}
