//! socket-table: an in-memory key-value table served over TCP.
//!
//! Clients send newline-terminated JSON requests (`GET`, `GETALL`, `UPDATE`,
//! `DELETE`) and receive one newline-terminated JSON response per request.
//! A single-threaded mio reactor owns every connection and the [`Store`], so
//! requests are applied one at a time. Callbacks registered per key observe
//! every request that touches that key.

pub mod callback;
pub mod client;
pub mod config;
pub mod protocol;
pub mod runtime;
pub mod store;

pub use callback::{CallbackRegistry, KeyCallback, LoggingCallback, Notification};
pub use client::{Client, ClientError};
pub use config::{Config, ConfigError};
pub use protocol::{Entry, ProtocolError, Request, RequestKind, Response};
pub use runtime::{Reactor, ShutdownHandle};
pub use store::Store;
