//! Test doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::TransportError;
use crate::protocol::{FLAG_TRUE, TOKEN_KEY, USER_ID_KEY};
use crate::store::{KeyValueStore, MemoryStore};
use crate::transport::HttpTransport;

type Reply = Result<Value, TransportError>;

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Reply>>,
    fallback: HashMap<String, Reply>,
    gets: Vec<String>,
    posts: Vec<(String, Value)>,
    tokens: Vec<String>,
}

/// [`HttpTransport`] answering from per-URL queues.
///
/// Queued replies are consumed in order; once a URL's queue is empty its
/// fallback reply (if any) repeats. Unscripted URLs fail as unreachable.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_get(&self, url: &str, reply: Reply) {
        let mut s = self.script.lock().unwrap();
        s.queued.entry(url.to_owned()).or_default().push_back(reply);
    }

    pub fn always(&self, url: &str, reply: Reply) {
        self.script.lock().unwrap().fallback.insert(url.to_owned(), reply);
    }

    pub fn get_urls(&self) -> Vec<String> {
        self.script.lock().unwrap().gets.clone()
    }

    pub fn get_count(&self) -> usize {
        self.script.lock().unwrap().gets.len()
    }

    pub fn posts(&self) -> Vec<(String, Value)> {
        self.script.lock().unwrap().posts.clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.script.lock().unwrap().tokens.clone()
    }

    fn reply(&self, url: &str) -> Reply {
        let mut s = self.script.lock().unwrap();
        if let Some(r) = s.queued.get_mut(url).and_then(VecDeque::pop_front) {
            return r;
        }
        s.fallback
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(TransportError::NetworkUnreachable(format!("{url}: unscripted"))))
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get_json(&self, url: &str, token: &str) -> Reply {
        {
            let mut s = self.script.lock().unwrap();
            s.gets.push(url.to_owned());
            s.tokens.push(token.to_owned());
        }
        self.reply(url)
    }

    async fn post_json(&self, url: &str, token: &str, body: &Value) -> Reply {
        {
            let mut s = self.script.lock().unwrap();
            s.posts.push((url.to_owned(), body.clone()));
            s.tokens.push(token.to_owned());
        }
        self.reply(url)
    }
}

pub const DEVICE: &str = "http://device";
pub const BACKEND: &str = "http://backend";

pub fn direct(path: &str) -> String {
    format!("{DEVICE}{path}")
}

pub fn proxied(path: &str) -> String {
    format!("{BACKEND}/esp32{path}")
}

pub fn sink() -> String {
    format!("{BACKEND}/sensor-readings")
}

pub fn down() -> Reply {
    Err(TransportError::NetworkUnreachable("connection refused".into()))
}

pub fn reading(hr: u32, spo2: u32) -> Reply {
    Ok(json!({ "heart_rate": hr, "spo2": spo2, "ir": 50_000, "red": 42_000 }))
}

/// A store holding a token and user id.
pub fn signed_in_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.set(TOKEN_KEY, "tok");
    store.set(USER_ID_KEY, "7");
    store
}

pub fn set_flag(store: &dyn KeyValueStore, key: &str) {
    store.set(key, FLAG_TRUE);
}
