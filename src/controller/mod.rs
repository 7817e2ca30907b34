//! PeeringSession controller
//!
//! `session` holds the per-session state machine and its context;
//! `lifecycle` covers what happens on this node before the controller loop
//! starts and after it stops.

mod lifecycle;
mod session;

pub use lifecycle::{bootstrap_overlay, shutdown_cleanup, start_node};
pub use session::{
    error_policy, is_ready, reconcile, resync_sessions, Context, ContextBuilder, FabricState,
    SessionClient, SessionClientImpl, Stage, NOT_READY_REQUEUE,
};
