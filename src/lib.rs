pub mod config;
pub mod config_validation;
pub mod counters;
pub mod error;
pub mod forwarder;
pub mod http1;
pub mod legacy;
pub mod listener;
pub mod logging;
pub mod relay;
pub mod watchdog;

pub use config::RelayConfig;
pub use counters::SharedCounters;
pub use error::RelayError;
pub use relay::{Relay, run, shutdown};
pub use watchdog::spawn_watchdog;
