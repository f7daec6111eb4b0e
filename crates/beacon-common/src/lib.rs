//! Beacon Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Beacon components:
//! - Error types and error codes
//! - Network address helpers
//! - Name validation and sanitisation
//! - Common constants

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{BeaconError, ErrorCode};
pub use utils::{interface_ip, is_private_ip, is_valid, sanitize_service_name};

/// Default key scheme (data center prefix) used when none is configured
pub const DEFAULT_SCHEME: &str = "dc1";

/// Node info key holding the resolved network address
pub const INFO_IP: &str = "ip";

/// Liveness state of a peer node as seen by a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Up,
    Down,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Up => "UP",
            NodeState::Down => "DOWN",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(NodeState::Up),
            "DOWN" => Ok(NodeState::Down),
            _ => Err(format!("Invalid node state: {}", s)),
        }
    }
}
