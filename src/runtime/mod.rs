//! Connection reactor.
//!
//! One thread, one mio poll (epoll on Linux, kqueue on macOS):
//! - `Reactor`: accepts clients and drives read -> dispatch -> write
//! - `ConnectionState`: per-connection phase and buffers
//! - `ShutdownHandle`: stops the loop from another thread

mod connection;
mod event_loop;

pub use connection::{ConnPhase, ConnectionState};
pub use event_loop::{Reactor, ShutdownHandle};

use crate::config::Config;
use crate::store::Store;

/// Bind and serve `store` until the reactor is stopped.
pub fn run(config: &Config, store: Store) -> std::io::Result<Store> {
    Reactor::bind(config, store)?.run()
}
