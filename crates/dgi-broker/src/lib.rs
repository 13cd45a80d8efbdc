//! DGI Broker -- communication substrate for a distributed grid agent.
//!
//! Per-peer UDP connections with a simulated reliability knob, a registry
//! that owns them, a dispatcher keyed by message type, and the event loop
//! that ties them together. Re-exported so the binary and integration
//! tests share one surface.

pub mod broker;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod profile;
pub mod reliability;

pub use broker::{Broker, BrokerConfig, BrokerState, TimerHandle};
pub use connection::{ConnectionStats, ReliableConnection};
pub use connection_manager::{ConnectionManager, PeerList};
pub use dispatcher::{DispatchReport, Dispatcher, HandlerContext, HandlerResult};
pub use error::{BrokerError, ConfigError, ConnectionError, HandlerError};
pub use reliability::LossPolicy;

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
