//! Out-of-process trackers.
//!
//! ```text
//! PluginTracker ── Redialer ── LineClient ══ TCP ══ serve() ── impl Tracker
//! ```
//!
//! The engine side never sees a dropped connection: a shut down transport
//! is re-dialed and the call retried under a [`RetryPolicy`].

pub mod client;
pub mod launch;
pub mod redial;
pub mod server;
pub mod tracker;
pub mod wire;

pub use client::{Dialer, LineClient, RpcClient, TcpDialer};
pub use launch::PluginProcess;
pub use redial::{Redialer, RetryPolicy};
pub use server::serve;
pub use tracker::PluginTracker;
