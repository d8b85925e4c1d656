//! Per-key change callbacks.
//!
//! Callbacks run on the event loop thread, after the store operation has been
//! applied and before the response is queued for writing. A callback that
//! blocks stalls every connection; use [`channel`] to hand notifications to
//! another thread instead.

use crate::protocol::RequestKind;
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// Receives the response value and request kind for a watched key.
pub trait KeyCallback: Send {
    fn on_change(&mut self, value: &Value, kind: RequestKind);
}

impl<F> KeyCallback for F
where
    F: FnMut(&Value, RequestKind) + Send,
{
    fn on_change(&mut self, value: &Value, kind: RequestKind) {
        self(value, kind)
    }
}

/// Logs every request touching the watched key.
#[derive(Debug, Clone)]
pub struct LoggingCallback {
    key: String,
}

impl LoggingCallback {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl KeyCallback for LoggingCallback {
    fn on_change(&mut self, value: &Value, kind: RequestKind) {
        info!(key = %self.key, %value, request = %kind, "Watched key touched");
    }
}

/// A change delivered through a [`ChannelCallback`].
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub key: String,
    pub value: Value,
    pub kind: RequestKind,
}

/// Forwards changes over an unbounded channel so the loop never waits on the consumer.
#[derive(Debug, Clone)]
pub struct ChannelCallback {
    key: String,
    tx: Sender<Notification>,
}

impl KeyCallback for ChannelCallback {
    fn on_change(&mut self, value: &Value, kind: RequestKind) {
        let notification = Notification {
            key: self.key.clone(),
            value: value.clone(),
            kind,
        };
        if self.tx.send(notification).is_err() {
            debug!(key = %self.key, "Notification receiver dropped");
        }
    }
}

/// Create a channel-backed callback for `key` and the receiving end.
pub fn channel(key: impl Into<String>) -> (ChannelCallback, Receiver<Notification>) {
    let (tx, rx) = unbounded();
    (ChannelCallback { key: key.into(), tx }, rx)
}

/// At most one callback per key.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Box<dyn KeyCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `key`, replacing any previous one.
    ///
    /// Returns `true` if a previous registration was replaced.
    pub fn register(
        &mut self,
        key: impl Into<String>,
        callback: impl KeyCallback + 'static,
    ) -> bool {
        let key = key.into();
        debug!(key = %key, "Registering callback");
        self.callbacks.insert(key, Box::new(callback)).is_some()
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.callbacks.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.callbacks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Invoke the callback registered for `key`, if any.
    ///
    /// Returns `true` if a callback ran.
    pub fn notify(&mut self, key: &str, value: &Value, kind: RequestKind) -> bool {
        match self.callbacks.get_mut(key) {
            Some(callback) => {
                callback.on_change(value, kind);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("keys", &self.callbacks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_closure_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut registry = CallbackRegistry::new();
        registry.register("k", move |value: &Value, kind: RequestKind| {
            sink.lock().unwrap().push((value.clone(), kind));
        });

        assert!(registry.notify("k", &json!(5), RequestKind::Update));
        assert!(!registry.notify("other", &json!(1), RequestKind::Update));

        assert_eq!(*seen.lock().unwrap(), vec![(json!(5), RequestKind::Update)]);
    }

    #[test]
    fn test_register_replaces() {
        let (first, first_rx) = channel("k");
        let (second, second_rx) = channel("k");

        let mut registry = CallbackRegistry::new();
        assert!(!registry.register("k", first));
        assert!(registry.register("k", second));
        assert_eq!(registry.len(), 1);

        registry.notify("k", &json!("v"), RequestKind::Get);

        assert!(first_rx.try_recv().is_err());
        assert_eq!(
            second_rx.try_recv().unwrap(),
            Notification {
                key: "k".into(),
                value: json!("v"),
                kind: RequestKind::Get,
            }
        );
    }

    #[test]
    fn test_channel_callback_survives_dropped_receiver() {
        let (callback, rx) = channel("k");
        drop(rx);

        let mut registry = CallbackRegistry::new();
        registry.register("k", callback);
        assert!(registry.notify("k", &Value::Null, RequestKind::Delete));
    }

    #[test]
    fn test_remove() {
        let mut registry = CallbackRegistry::new();
        registry.register("k", LoggingCallback::new("k"));
        assert!(registry.contains("k"));
        assert!(registry.remove("k"));
        assert!(!registry.remove("k"));
        assert!(registry.is_empty());
    }
}
