//! In-memory key-value table.
//!
//! Provides the mapping served to socket table clients with:
//! - GET / GETALL / UPDATE / DELETE semantics where a missing key is never an error
//! - A last-update timestamp on every entry
//! - Per-key callbacks run after each keyed request
//!
//! The store has no interior locking. It is owned by the event loop and only
//! ever mutated through `&mut self` from that thread.

use crate::callback::{CallbackRegistry, KeyCallback};
use crate::protocol::{self, Entry, ProtocolError, Request, RequestKind, Response};
use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, trace, warn};

/// Textual format of entry timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A stored value with the time it was last written.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry {
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

impl StoreEntry {
    fn new(value: Value) -> Self {
        Self {
            value,
            updated_at: Utc::now().trunc_subsecs(0),
        }
    }

    /// Last update time in [`TIMESTAMP_FORMAT`].
    pub fn timestamp(&self) -> String {
        self.updated_at.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// The key-value table plus its callback registry.
#[derive(Debug, Default)]
pub struct Store {
    entries: HashMap<String, StoreEntry>,
    callbacks: CallbackRegistry,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value for `key`, or `null` when absent.
    pub fn get(&self, key: Option<&str>) -> Entry {
        let value = key
            .and_then(|k| self.entries.get(k))
            .map(|entry| entry.value.clone())
            .unwrap_or(Value::Null);
        Entry::new(key.map(str::to_owned), value)
    }

    /// Every key with its current value, in no particular order.
    pub fn get_all(&self) -> Vec<Entry> {
        self.entries
            .iter()
            .map(|(key, entry)| Entry::new(Some(key.clone()), entry.value.clone()))
            .collect()
    }

    /// Insert or overwrite `key`. A `None` key writes nothing but is still echoed.
    pub fn update(&mut self, key: Option<&str>, value: Value) -> Entry {
        if let Some(key) = key {
            self.entries
                .insert(key.to_string(), StoreEntry::new(value.clone()));
            trace!(key, entries = self.entries.len(), "Entry stored");
        }
        Entry::new(key.map(str::to_owned), value)
    }

    /// Remove `key`, echoing the removed value or `null`.
    pub fn delete(&mut self, key: Option<&str>) -> Entry {
        let value = key
            .and_then(|k| self.entries.remove(k))
            .map(|entry| entry.value)
            .unwrap_or(Value::Null);
        trace!(?key, "Entry deleted");
        Entry::new(key.map(str::to_owned), value)
    }

    /// Drop every entry. Callback registrations survive.
    pub fn reset(&mut self) {
        self.entries.clear();
        info!(callbacks = self.callbacks.len(), "Store reset");
    }

    /// Register `callback` for `key`, replacing any previous registration.
    pub fn register_callback(
        &mut self,
        key: impl Into<String>,
        callback: impl KeyCallback + 'static,
    ) -> bool {
        self.callbacks.register(key, callback)
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    /// The full entry for `key`, including its timestamp.
    pub fn entry(&self, key: &str) -> Option<&StoreEntry> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Route a decoded request to its operation.
    pub fn execute(&mut self, request: &Request) -> Response {
        match request {
            Request::Get { key } => Response::Entry(self.get(key.as_deref())),
            Request::GetAll => Response::All(self.get_all()),
            Request::Update { key, value } => {
                Response::Entry(self.update(key.as_deref(), value.clone()))
            }
            Request::Delete { key } => Response::Entry(self.delete(key.as_deref())),
        }
    }

    /// Handle one raw request frame and return the encoded response frame.
    ///
    /// Empty, malformed and unknown requests produce an encoded `null`.
    /// The callback for the request's key, if any, runs after the operation
    /// and before this returns. An unknown kind that carries a key still
    /// notifies that key's callback, with a `null` value.
    pub fn dispatch(&mut self, frame: &[u8]) -> Vec<u8> {
        let response = match self.handle_frame(frame) {
            Ok(response) => response,
            Err(ProtocolError::UnknownKind { kind, key }) => {
                warn!(kind = %kind, ?key, "Unknown request kind");
                if let Some(key) = key {
                    self.notify(&key, &Value::Null, RequestKind::Unknown);
                }
                Response::Null
            }
            Err(e) => {
                warn!(error = %e, "Rejected request");
                Response::Null
            }
        };

        match protocol::encode_response(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "Failed to encode response");
                protocol::null_response()
            }
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) -> Result<Response, ProtocolError> {
        if protocol::strip_delimiter(frame).iter().all(u8::is_ascii_whitespace) {
            return Ok(Response::Null);
        }

        let request = protocol::decode_request(frame)?;
        debug!(?request, "Received request");

        let response = self.execute(&request);

        if let (Some(key), Some(value)) = (request.key(), response.value()) {
            self.notify(key, value, request.kind());
        }

        Ok(response)
    }

    fn notify(&mut self, key: &str, value: &Value, kind: RequestKind) {
        if self.callbacks.notify(key, value, kind) {
            trace!(key, request = %kind, "Callback executed");
        }
    }
}
