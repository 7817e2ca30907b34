//! Parsed addressing for one peering session
//!
//! Rule and route construction works on validated IPv4 values. All CIDRs
//! are normalized to their network address so that rule text and route
//! keys match what the kernel reports back.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::crd::PeeringSession;
use crate::remap::{canonical_cidr, parse_addr};
use crate::Error;

/// Addressing of one remote cluster as seen from this node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddressing {
    /// Remote cluster identifier
    pub cluster_id: String,
    /// Native local pod range
    pub local_pod_cidr: Ipv4Net,
    /// Remote pod range as addressed from here (remapped if applicable)
    pub remote_pod_cidr: Ipv4Net,
    /// Range local pods are presented under, when remapped
    pub local_remapped_pod_cidr: Option<Ipv4Net>,
    /// Local overlay address of the tunnel
    pub local_tunnel_ip: Ipv4Addr,
    /// Remote overlay address of the tunnel
    pub remote_tunnel_ip: Ipv4Addr,
    /// Tunnel interface name, once programmed
    pub tunnel_interface: Option<String>,
}

impl PeerAddressing {
    /// Resolve the addressing of a ready session.
    ///
    /// Fails with `Validation` when tunnel addressing is missing and with
    /// `InvalidAddress` when any field does not parse.
    pub fn from_session(session: &PeeringSession) -> Result<Self, Error> {
        let cluster_id = session.cluster_id().to_string();
        if cluster_id.trim().is_empty() {
            return Err(Error::validation("session has an empty clusterID"));
        }

        let status = session
            .status
            .as_ref()
            .ok_or_else(|| Error::validation(format!("session {cluster_id} has no status")))?;
        let local_tunnel_ip = status.local_private_ip().ok_or_else(|| {
            Error::validation(format!("session {cluster_id} has no tunnelLocalPrivateIP"))
        })?;
        let remote_tunnel_ip = status.remote_private_ip().ok_or_else(|| {
            Error::validation(format!("session {cluster_id} has no tunnelRemotePrivateIP"))
        })?;

        Ok(Self {
            local_pod_cidr: canonical_cidr(&session.spec.local_pod_cidr)?,
            remote_pod_cidr: canonical_cidr(session.effective_remote_pod_cidr())?,
            local_remapped_pod_cidr: session
                .local_remapped_pod_cidr()
                .map(canonical_cidr)
                .transpose()?,
            local_tunnel_ip: parse_addr(local_tunnel_ip)?,
            remote_tunnel_ip: parse_addr(remote_tunnel_ip)?,
            tunnel_interface: status.interface_name().map(str::to_string),
            cluster_id,
        })
    }
}
