//! Per-cluster kernel routes
//!
//! The gateway routes a remote cluster's pods through that cluster's tunnel.
//! Every other node sends the same traffic to the gateway over the overlay.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::NodeRole;
use crate::exec::{args, CommandOutput, CommandRunner};
use crate::peer::PeerAddressing;
use crate::Error;

/// A kernel route, keyed by destination, gateway and device
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    /// Destination range
    pub dst: Ipv4Net,
    /// Next hop, if any
    pub gateway: Option<Ipv4Addr>,
    /// Output device
    pub dev: String,
    /// Next hop is reachable on `dev` without a covering route
    pub onlink: bool,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dst)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        write!(f, " dev {}", self.dev)?;
        if self.onlink {
            write!(f, " onlink")?;
        }
        Ok(())
    }
}

fn host_route(addr: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(addr)
}

/// Routes one remote cluster needs on this node, in installation order
pub fn cluster_routes(role: &NodeRole, peer: &PeerAddressing) -> Result<Vec<Route>, Error> {
    match role {
        NodeRole::Gateway { .. } => {
            let dev = peer.tunnel_interface.clone().ok_or_else(|| {
                Error::validation(format!(
                    "session {} has no tunnel interface",
                    peer.cluster_id
                ))
            })?;
            Ok(vec![
                Route {
                    dst: host_route(peer.remote_tunnel_ip),
                    gateway: None,
                    dev: dev.clone(),
                    onlink: false,
                },
                Route {
                    dst: peer.remote_pod_cidr,
                    gateway: Some(peer.remote_tunnel_ip),
                    dev,
                    onlink: true,
                },
            ])
        }
        NodeRole::Member {
            gateway_ip,
            overlay_interface,
        } => Ok(vec![
            Route {
                dst: peer.remote_pod_cidr,
                gateway: Some(*gateway_ip),
                dev: overlay_interface.clone(),
                onlink: false,
            },
            Route {
                dst: host_route(peer.remote_tunnel_ip),
                gateway: Some(*gateway_ip),
                dev: overlay_interface.clone(),
                onlink: false,
            },
        ]),
    }
}

/// Kernel routing table operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Add a route, replacing any route with the same destination
    async fn replace(&self, route: &Route) -> Result<(), Error>;

    /// Delete a route. A missing route is a not-found [`Error::Route`].
    async fn delete(&self, route: &Route) -> Result<(), Error>;
}

/// Routes installed by this process, per cluster
#[derive(Debug, Default)]
pub struct RouteState {
    routes: HashMap<String, Vec<Route>>,
}

impl RouteState {
    /// Routes recorded for a cluster, in installation order
    pub fn cluster_routes(&self, cluster_id: &str) -> Option<&[Route]> {
        self.routes.get(cluster_id).map(Vec::as_slice)
    }

    /// A cluster has recorded routes
    pub fn has_cluster(&self, cluster_id: &str) -> bool {
        self.routes.contains_key(cluster_id)
    }

    /// Clusters with recorded routes
    pub fn cluster_ids(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }
}

/// Route lifecycle on top of [`RouteTable`]
#[derive(Clone)]
pub struct RouteManager {
    table: Arc<dyn RouteTable>,
    role: NodeRole,
}

impl RouteManager {
    /// Create a manager for the given node role
    pub fn new(table: Arc<dyn RouteTable>, role: NodeRole) -> Self {
        Self { table, role }
    }

    /// Install the routes for one remote cluster and record them.
    ///
    /// Recorded routes that are no longer wanted are deleted afterwards.
    pub async fn install_cluster_routes(
        &self,
        state: &mut RouteState,
        peer: &PeerAddressing,
    ) -> Result<(), Error> {
        let wanted = cluster_routes(&self.role, peer)?;
        for route in &wanted {
            self.table.replace(route).await?;

            let recorded = state.routes.entry(peer.cluster_id.clone()).or_default();
            if !recorded.contains(route) {
                debug!(cluster_id = %peer.cluster_id, route = %route, "route installed");
                recorded.push(route.clone());
            }
        }

        let stale: Vec<Route> = state
            .routes
            .get(&peer.cluster_id)
            .map(|recorded| {
                recorded
                    .iter()
                    .filter(|r| !wanted.contains(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for route in stale {
            match self.table.delete(&route).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            if let Some(recorded) = state.routes.get_mut(&peer.cluster_id) {
                recorded.retain(|r| *r != route);
            }
            debug!(cluster_id = %peer.cluster_id, route = %route, "stale route removed");
        }

        info!(cluster_id = %peer.cluster_id, "cluster routes installed");
        Ok(())
    }

    /// The recorded routes for this cluster are exactly the wanted ones
    pub fn is_current(&self, state: &RouteState, peer: &PeerAddressing) -> Result<bool, Error> {
        let wanted = cluster_routes(&self.role, peer)?;
        Ok(match state.cluster_routes(&peer.cluster_id) {
            Some(recorded) => {
                recorded.len() == wanted.len() && wanted.iter().all(|r| recorded.contains(r))
            }
            None => false,
        })
    }

    /// Delete the routes this cluster would need, without consulting the record
    pub async fn purge_cluster_routes(&self, peer: &PeerAddressing) -> Result<(), Error> {
        for route in cluster_routes(&self.role, peer)? {
            match self.table.delete(&route).await {
                Ok(()) => debug!(cluster_id = %peer.cluster_id, route = %route, "route purged"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete every route recorded for a cluster.
    ///
    /// A route the kernel no longer has counts as deleted. Routes that fail
    /// to delete stay recorded so a later pass retries them.
    pub async fn delete_cluster_routes(
        &self,
        state: &mut RouteState,
        cluster_id: &str,
    ) -> Result<(), Error> {
        let Some(routes) = state.routes.remove(cluster_id) else {
            debug!(cluster_id, "no routes recorded");
            return Ok(());
        };

        let mut remaining = Vec::new();
        let mut first_error = None;
        for route in routes {
            match self.table.delete(&route).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(cluster_id, route = %route, "route already absent");
                }
                Err(e) => {
                    warn!(cluster_id, route = %route, error = %e, "failed to delete route");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    remaining.push(route);
                }
            }
        }

        match first_error {
            Some(e) => {
                state.routes.insert(cluster_id.to_string(), remaining);
                Err(e)
            }
            None => {
                info!(cluster_id, "cluster routes deleted");
                Ok(())
            }
        }
    }

    /// Delete every recorded route across all clusters, best-effort
    pub async fn delete_all_routes(&self, state: &mut RouteState) -> Result<(), Error> {
        let mut first_error = None;
        for cluster_id in state.cluster_ids() {
            if let Err(e) = self.delete_cluster_routes(state, &cluster_id).await {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// =============================================================================
// iproute2 backend
// =============================================================================

fn route_args(op: &str, route: &Route) -> Vec<String> {
    let mut argv = args(["route", op]);
    argv.push(route.dst.to_string());
    if let Some(gw) = route.gateway {
        argv.push("via".to_string());
        argv.push(gw.to_string());
    }
    argv.push("dev".to_string());
    argv.push(route.dev.clone());
    if route.onlink && op != "del" {
        argv.push("onlink".to_string());
    }
    argv
}

fn is_missing_route(out: &CommandOutput) -> bool {
    out.stderr.contains("No such process") || out.stderr.contains("Cannot find device")
}

/// [`RouteTable`] backed by `ip route`
pub struct IpRouteCli {
    runner: Arc<dyn CommandRunner>,
}

impl IpRouteCli {
    /// Create a backend using the given command runner
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl RouteTable for IpRouteCli {
    async fn replace(&self, route: &Route) -> Result<(), Error> {
        let out = self.runner.run("ip", &route_args("replace", route)).await?;
        if !out.success {
            return Err(Error::route(route.to_string(), out.error_text()));
        }
        Ok(())
    }

    async fn delete(&self, route: &Route) -> Result<(), Error> {
        let out = self.runner.run("ip", &route_args("del", route)).await?;
        if out.success {
            return Ok(());
        }
        if is_missing_route(&out) {
            return Err(Error::route_not_found(route.to_string()));
        }
        Err(Error::route(route.to_string(), out.error_text()))
    }
}
