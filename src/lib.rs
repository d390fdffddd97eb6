//! Host availability watching over ICMP echo.
//!
//! One [`Watcher`] per target host: it resolves the address, opens a raw or
//! datagram ICMP channel, and runs a single cooperative loop that sends an
//! echo request every interval, waits for the reply bounded by a read
//! deadline, and reports liveness, timeouts, and errors through the
//! [`Events`] callbacks. Watchers are independent; run as many as you like
//! on separate tasks and call [`Watcher::stop`] to shut each one down.

pub mod config;
pub mod error;
pub mod packet;
pub mod transport;
pub mod watcher;

pub use config::{Config, HostConfig};
pub use error::WatchError;
pub use watcher::{Events, LogEvents, ProbeContext, ProbeStat, Watcher};
