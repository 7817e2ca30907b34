//! Peernet - per-node network fabric controller for multi-cluster pod peering
//!
//! Peernet extends pod networking across independently administered clusters.
//! For every PeeringSession (one per remote cluster) the controller running on
//! each node programs the host: packet-filter rules, kernel routes and, on the
//! gateway, the overlay device that carries inter-cluster traffic.
//!
//! # Architecture
//!
//! - The gateway node terminates inter-cluster tunnels and routes remote pod
//!   ranges through them
//! - Every other node reaches remote clusters through the gateway over a
//!   shared VXLAN overlay
//! - Overlapping pod ranges are resolved by presenting one side under a
//!   substitute range (NETMAP translation on the gateway)
//!
//! # Modules
//!
//! - [`crd`] - PeeringSession custom resource
//! - [`controller`] - Fabric reconciler state machine
//! - [`remap`] - Address translation between overlapping ranges
//! - [`tunnel`] - GRE/VXLAN device management
//! - [`netfilter`] - Custom chains and per-cluster NAT/forward rules
//! - [`routes`] - Per-cluster kernel routes
//! - [`peer`] - Parsed per-session addressing
//! - [`config`] - Node configuration and role selection
//! - [`exec`] - Host command execution
//! - [`retry`] - Backoff for transient API failures
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod exec;
pub mod netfilter;
pub mod peer;
pub mod remap;
pub mod retry;
pub mod routes;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod fake;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Sentinel for "no remap in effect" in remapped-range fields
pub const NO_REMAP: &str = "None";

/// Field manager used for every write to the API server
pub const FIELD_MANAGER: &str = "peernet-controller";

/// Prefix of the per-node finalizer token
pub const FINALIZER_PREFIX: &str = "peernet.dev/route-";

/// Prefix of the per-node "processed" label key
pub const PROCESSED_LABEL_PREFIX: &str = "route.peernet.dev/";

/// Value of the per-node "processed" label
pub const PROCESSED_LABEL_VALUE: &str = "ready";

/// Default name of the shared VXLAN overlay device
pub const DEFAULT_OVERLAY_INTERFACE: &str = "peernet-vxlan";

/// Default overlay network shared by the nodes of one cluster
pub const DEFAULT_OVERLAY_NETWORK: &str = "172.31.0.0/24";

/// Default VXLAN network identifier
pub const DEFAULT_VXLAN_VNI: u32 = 200;

/// Default VXLAN UDP port
pub const DEFAULT_VXLAN_PORT: u16 = 4789;

/// Finalizer token owned by `node`
pub fn finalizer_for(node: &str) -> String {
    format!("{FINALIZER_PREFIX}{node}")
}

/// Label key marking a session as processed by `node`
pub fn processed_label_for(node: &str) -> String {
    format!("{PROCESSED_LABEL_PREFIX}{node}")
}
