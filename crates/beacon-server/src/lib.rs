//! Beacon Server - a service node process
//!
//! Loads configuration, initializes logging and metrics, connects the
//! discovery store and messaging transport, then runs a `BeaconNode` until
//! shutdown.

pub mod metrics;
pub mod model;
pub mod service;
pub mod startup;

pub use model::{Cli, Configuration};
pub use service::BeaconNode;
