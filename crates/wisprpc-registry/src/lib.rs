//! wisp-rpc Registry
//!
//! A heartbeat-based endpoint registry: servers POST their address on a
//! fixed interval, clients GET the set of endpoints whose last heartbeat is
//! inside the TTL. State lives in memory; an endpoint that stops
//! heartbeating simply ages out on the next query.

pub mod heartbeat;
pub mod registry;

pub use heartbeat::heartbeat;
pub use registry::{Registry, DEFAULT_TTL};
