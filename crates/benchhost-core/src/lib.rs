//! Host side of the benchmark worker protocol.
//!
//! A benchmark worker runs in its own process and writes a line-oriented
//! stream. Ordinary lines are measurement records; lines starting with the
//! `//` control marker carry lifecycle signals (which the host must
//! acknowledge before the worker proceeds) and framed diagnoser payloads.
//!
//! ```text
//! executor::execute_pipe / execute_channel
//!     |
//!     |  spawn worker, raise host-side signals
//!     v
//! Broker ----read_line----> Transport (pipe | channel | memory)
//!     |  <---Acknowledgment--
//!     v
//! Session: classify -> signal / aggregate / collect
//!     |
//!     v
//! BrokerOutcome + CollectedOutput
//! ```

pub mod broker;
pub mod capture;
pub mod config;
pub mod diagnoser;
pub mod executor;
pub mod protocol;
pub mod transport;

pub use broker::{Broker, BrokerError, BrokerHandle, BrokerOutcome, CollectedOutput};
pub use config::HostConfig;
