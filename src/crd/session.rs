//! PeeringSession Custom Resource Definition
//!
//! A PeeringSession describes the network parameters agreed with one remote
//! cluster. The control plane writes the spec and the tunnel/remap status;
//! the fabric controller on every node reads it and programs host networking.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::remap::is_no_remap;
use crate::{finalizer_for, processed_label_for, PROCESSED_LABEL_VALUE};

/// Specification for a PeeringSession
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "peernet.dev",
    version = "v1alpha1",
    kind = "PeeringSession",
    plural = "peeringsessions",
    shortname = "ps",
    status = "PeeringSessionStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterID"}"#,
    printcolumn = r#"{"name":"Remote CIDR","type":"string","jsonPath":".spec.remotePodCIDR"}"#,
    printcolumn = r#"{"name":"Tunnel","type":"string","jsonPath":".status.tunnelInterfaceName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PeeringSessionSpec {
    /// Identifier of the remote cluster
    #[serde(rename = "clusterID")]
    pub cluster_id: String,

    /// Native pod range of the local cluster
    #[serde(rename = "localPodCIDR")]
    pub local_pod_cidr: String,

    /// Native pod range of the remote cluster
    #[serde(rename = "remotePodCIDR")]
    pub remote_pod_cidr: String,
}

/// Status for a PeeringSession, written by the control plane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeeringSessionStatus {
    /// Substitute range the remote pods are reachable under ("None" for no remap)
    #[serde(
        rename = "remotePodCIDRRemapped",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub remote_pod_cidr_remapped: Option<String>,

    /// Substitute range the remote cluster sees local pods under ("None" for no remap)
    #[serde(
        rename = "localPodCIDRRemapped",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub local_pod_cidr_remapped: Option<String>,

    /// Local overlay address of the tunnel
    #[serde(rename = "tunnelLocalPrivateIP", default, skip_serializing_if = "Option::is_none")]
    pub tunnel_local_private_ip: Option<String>,

    /// Local underlay endpoint of the tunnel
    #[serde(rename = "tunnelLocalPublicIP", default, skip_serializing_if = "Option::is_none")]
    pub tunnel_local_public_ip: Option<String>,

    /// Remote overlay address of the tunnel
    #[serde(rename = "tunnelRemotePrivateIP", default, skip_serializing_if = "Option::is_none")]
    pub tunnel_remote_private_ip: Option<String>,

    /// Remote underlay endpoint of the tunnel
    #[serde(rename = "tunnelRemotePublicIP", default, skip_serializing_if = "Option::is_none")]
    pub tunnel_remote_public_ip: Option<String>,

    /// Name of the programmed tunnel interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_interface_name: Option<String>,

    /// Kernel index of the programmed tunnel interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_interface_index: Option<u32>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl PeeringSessionStatus {
    /// Set the tunnel addressing and return self for chaining
    pub fn tunnel(
        mut self,
        local_private: impl Into<String>,
        local_public: impl Into<String>,
        remote_private: impl Into<String>,
        remote_public: impl Into<String>,
    ) -> Self {
        self.tunnel_local_private_ip = Some(local_private.into());
        self.tunnel_local_public_ip = Some(local_public.into());
        self.tunnel_remote_private_ip = Some(remote_private.into());
        self.tunnel_remote_public_ip = Some(remote_public.into());
        self
    }

    /// Set the tunnel interface and return self for chaining
    pub fn interface(mut self, name: impl Into<String>, index: u32) -> Self {
        self.tunnel_interface_name = Some(name.into());
        self.tunnel_interface_index = Some(index);
        self
    }

    /// Set the remote remapped range and return self for chaining
    pub fn remote_remapped(mut self, cidr: impl Into<String>) -> Self {
        self.remote_pod_cidr_remapped = Some(cidr.into());
        self
    }

    /// Set the local remapped range and return self for chaining
    pub fn local_remapped(mut self, cidr: impl Into<String>) -> Self {
        self.local_pod_cidr_remapped = Some(cidr.into());
        self
    }

    /// Both local and remote tunnel private/public IPs are populated
    pub fn tunnel_addresses_ready(&self) -> bool {
        [
            &self.tunnel_local_private_ip,
            &self.tunnel_local_public_ip,
            &self.tunnel_remote_private_ip,
            &self.tunnel_remote_public_ip,
        ]
        .into_iter()
        .all(|ip| non_empty(ip).is_some())
    }

    /// Local private tunnel IP, if populated
    pub fn local_private_ip(&self) -> Option<&str> {
        non_empty(&self.tunnel_local_private_ip)
    }

    /// Remote private tunnel IP, if populated
    pub fn remote_private_ip(&self) -> Option<&str> {
        non_empty(&self.tunnel_remote_private_ip)
    }

    /// Tunnel interface name, if populated
    pub fn interface_name(&self) -> Option<&str> {
        non_empty(&self.tunnel_interface_name)
    }
}

impl PeeringSession {
    /// Remote cluster identifier
    pub fn cluster_id(&self) -> &str {
        &self.spec.cluster_id
    }

    /// Remote pod range as this cluster must address it: the remapped
    /// range when one is set, the native range otherwise.
    pub fn effective_remote_pod_cidr(&self) -> &str {
        match self
            .status
            .as_ref()
            .and_then(|s| s.remote_pod_cidr_remapped.as_deref())
        {
            Some(cidr) if !is_no_remap(cidr) => cidr,
            _ => &self.spec.remote_pod_cidr,
        }
    }

    /// Range the local pods are presented under, if remapped
    pub fn local_remapped_pod_cidr(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.local_pod_cidr_remapped.as_deref())
            .filter(|cidr| !is_no_remap(cidr))
    }

    /// Deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Carries the finalizer of the given node
    pub fn has_node_finalizer(&self, node: &str) -> bool {
        let token = finalizer_for(node);
        self.finalizers().iter().any(|f| *f == token)
    }

    /// Marked as processed by the given node
    pub fn is_processed_by(&self, node: &str) -> bool {
        self.labels()
            .get(&processed_label_for(node))
            .is_some_and(|v| v == PROCESSED_LABEL_VALUE)
    }

    /// Tunnel addressing is complete
    pub fn tunnel_addresses_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(PeeringSessionStatus::tunnel_addresses_ready)
    }
}
