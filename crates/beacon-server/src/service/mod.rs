//! Node runtime and backend wiring

mod backend;
mod node;

pub use backend::{connect_store, connect_transport};
pub use node::{
    BeaconNode, METHOD_INFO, METHOD_PING, NOTIFY_NODE_DOWN, NOTIFY_NODE_UP,
};
