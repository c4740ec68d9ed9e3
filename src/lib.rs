// src/lib.rs
// TCP port-forwarding relay: one listener per mapping, one outbound
// connection per accepted client, raw bytes copied both ways

pub mod config;
pub mod engine;
pub mod error;
mod handler;
pub mod pipe;
pub mod probe;
pub mod stats;
pub mod supervisor;

pub use config::RelayConfig;
pub use engine::{Outcome, RelayEngine, RelayState};
pub use error::{ConfigError, ConnectError, RelayError};
pub use probe::CONNECT_TIMEOUT;
pub use stats::StatsSnapshot;
pub use supervisor::{ManagedRelay, RelayExit, RelayStatus, Supervisor};
