//! Node configuration for the fabric controller
//!
//! Everything is supplied through flags with environment fallbacks, so the
//! controller runs unchanged as a DaemonSet with the downward API filling
//! in `NODE_NAME`.

use std::net::Ipv4Addr;

use clap::Args;
use ipnet::Ipv4Net;

use crate::tunnel::{TunnelAttrs, TunnelKind};
use crate::{
    Error, DEFAULT_OVERLAY_INTERFACE, DEFAULT_OVERLAY_NETWORK, DEFAULT_VXLAN_PORT,
    DEFAULT_VXLAN_VNI,
};

const MAX_VNI: u32 = (1 << 24) - 1;

/// Per-node controller configuration
#[derive(Args, Clone, Debug)]
pub struct FabricConfig {
    /// Name of the node this controller runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Run as the cluster's gateway node
    #[arg(long, env = "PEERNET_GATEWAY")]
    pub gateway: bool,

    /// Name of the shared VXLAN overlay device
    #[arg(long, env = "PEERNET_OVERLAY_INTERFACE", default_value = DEFAULT_OVERLAY_INTERFACE)]
    pub overlay_interface: String,

    /// VXLAN network identifier of the overlay
    #[arg(long, env = "PEERNET_OVERLAY_VNI", default_value_t = DEFAULT_VXLAN_VNI)]
    pub overlay_vni: u32,

    /// UDP port of the overlay
    #[arg(long, env = "PEERNET_OVERLAY_PORT", default_value_t = DEFAULT_VXLAN_PORT)]
    pub overlay_port: u16,

    /// Address range of the overlay
    #[arg(long, env = "PEERNET_OVERLAY_NETWORK", default_value = DEFAULT_OVERLAY_NETWORK)]
    pub overlay_network: Ipv4Net,

    /// This node's overlay address in CIDR notation (e.g. 172.31.0.5/24)
    #[arg(long, env = "PEERNET_OVERLAY_ADDRESS")]
    pub overlay_address: Ipv4Net,

    /// Overlay address of the gateway node (required on non-gateway nodes)
    #[arg(long, env = "PEERNET_GATEWAY_OVERLAY_IP")]
    pub gateway_overlay_ip: Option<Ipv4Addr>,

    /// Underlay device the overlay is bound to
    #[arg(long, env = "PEERNET_UNDERLAY_DEVICE")]
    pub underlay_device: Option<String>,

    /// Underlay source address of the overlay
    #[arg(long, env = "PEERNET_UNDERLAY_ADDRESS")]
    pub underlay_address: Option<Ipv4Addr>,

    /// Underlay addresses of the other nodes, flooded for broadcast traffic
    #[arg(long = "vtep-peer", env = "PEERNET_VTEP_PEERS", value_delimiter = ',')]
    pub vtep_peers: Vec<Ipv4Addr>,
}

/// How this node participates in inter-cluster routing
///
/// Chosen once at startup; rule and route construction branch on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// Terminates inter-cluster tunnels
    Gateway {
        /// Overlay range whose traffic is masqueraded toward remote clusters
        overlay_network: Ipv4Net,
    },
    /// Reaches remote clusters through the gateway over the overlay
    Member {
        /// Gateway's overlay address
        gateway_ip: Ipv4Addr,
        /// Overlay device name
        overlay_interface: String,
    },
}

impl NodeRole {
    /// Returns true on the gateway node
    pub fn is_gateway(&self) -> bool {
        matches!(self, NodeRole::Gateway { .. })
    }
}

impl FabricConfig {
    /// Check the configuration for internal consistency
    pub fn validate(&self) -> Result<(), Error> {
        if self.node_name.trim().is_empty() {
            return Err(Error::validation("node name must not be empty"));
        }
        if self.overlay_interface.is_empty() || self.overlay_interface.len() > 15 {
            return Err(Error::validation(format!(
                "overlay interface name '{}' must be 1-15 characters",
                self.overlay_interface
            )));
        }
        if self.overlay_vni == 0 || self.overlay_vni > MAX_VNI {
            return Err(Error::validation(format!(
                "overlay VNI {} out of range 1-{MAX_VNI}",
                self.overlay_vni
            )));
        }
        if self.overlay_port == 0 {
            return Err(Error::validation("overlay port must not be 0"));
        }

        let network = self.overlay_network.trunc();
        if !network.contains(&self.overlay_address.addr()) {
            return Err(Error::validation(format!(
                "overlay address {} is outside overlay network {network}",
                self.overlay_address
            )));
        }

        if !self.gateway {
            let gateway_ip = self.gateway_overlay_ip.ok_or_else(|| {
                Error::validation("gateway overlay IP is required on non-gateway nodes")
            })?;
            if !network.contains(&gateway_ip) {
                return Err(Error::validation(format!(
                    "gateway overlay IP {gateway_ip} is outside overlay network {network}"
                )));
            }
            if gateway_ip == self.overlay_address.addr() {
                return Err(Error::validation(
                    "gateway overlay IP equals this node's overlay address",
                ));
            }
        }

        Ok(())
    }

    /// Select the node role
    pub fn role(&self) -> Result<NodeRole, Error> {
        if self.gateway {
            return Ok(NodeRole::Gateway {
                overlay_network: self.overlay_network.trunc(),
            });
        }
        let gateway_ip = self.gateway_overlay_ip.ok_or_else(|| {
            Error::validation("gateway overlay IP is required on non-gateway nodes")
        })?;
        Ok(NodeRole::Member {
            gateway_ip,
            overlay_interface: self.overlay_interface.clone(),
        })
    }

    /// Attributes of the shared VXLAN overlay device
    pub fn overlay_attrs(&self) -> TunnelAttrs {
        TunnelAttrs {
            name: self.overlay_interface.clone(),
            kind: TunnelKind::Vxlan {
                vni: self.overlay_vni,
                port: self.overlay_port,
                local: self.underlay_address,
                dev: self.underlay_device.clone(),
            },
        }
    }
}
