//! Rate-controlled streaming load generator.
//!
//! Synthesizes packet events, paces them onto a duplex connection at a target
//! rate, and aggregates the stats the server streams back. The binary wires
//! these pieces to the command line; the library is what tests and other
//! tools drive.

pub mod config;
pub mod error;
pub mod governor;
pub mod logging;
pub mod models;
pub mod report;
pub mod stats;
pub mod supervisor;
pub mod synth;
pub mod transport;

pub use config::{Config, RunSettings};
pub use error::RunError;
pub use models::domain::{Event, Protocol, RatePoint, StatsSnapshot};
pub use models::wire::InboundMessage;
pub use report::{Monitor, Report, SupervisorState};
pub use supervisor::{RunSummary, ShutdownHandle, ShutdownOutcome, Supervisor};
