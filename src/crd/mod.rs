//! Custom Resource Definitions for peernet
//!
//! The fabric controller consumes a single resource, the cluster-scoped
//! PeeringSession.

mod session;

pub use session::{PeeringSession, PeeringSessionSpec, PeeringSessionStatus};
