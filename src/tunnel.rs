//! Overlay tunnel device management
//!
//! Creates, validates and destroys the GRE and VXLAN devices that carry
//! inter-cluster traffic. `ensure_tunnel` is idempotent: an existing device
//! with matching attributes is reused, a stale one is replaced.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::Deserialize;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::exec::{args, CommandOutput, CommandRunner};
use crate::Error;

/// Default TTL for GRE tunnels
pub const DEFAULT_GRE_TTL: u8 = 255;

/// Operative attributes of a tunnel device
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelKind {
    /// Point-to-point GRE tunnel
    Gre {
        /// Local underlay endpoint
        local: Ipv4Addr,
        /// Remote underlay endpoint
        remote: Ipv4Addr,
        /// Outer header TTL
        ttl: u8,
    },
    /// VXLAN overlay segment
    Vxlan {
        /// VXLAN network identifier
        vni: u32,
        /// UDP destination port
        port: u16,
        /// Optional local underlay source address
        local: Option<Ipv4Addr>,
        /// Optional underlay device to bind to
        dev: Option<String>,
    },
}

impl TunnelKind {
    /// Kernel link kind name
    pub fn kind_name(&self) -> &'static str {
        match self {
            TunnelKind::Gre { .. } => "gre",
            TunnelKind::Vxlan { .. } => "vxlan",
        }
    }

    /// Compare the attributes that define a device's identity.
    ///
    /// GRE compares both endpoints and TTL, VXLAN compares VNI and port.
    pub fn same_identity(&self, other: &TunnelKind) -> bool {
        match (self, other) {
            (
                TunnelKind::Gre { local, remote, ttl },
                TunnelKind::Gre {
                    local: l2,
                    remote: r2,
                    ttl: t2,
                },
            ) => local == l2 && remote == r2 && ttl == t2,
            (
                TunnelKind::Vxlan { vni, port, .. },
                TunnelKind::Vxlan {
                    vni: v2, port: p2, ..
                },
            ) => vni == v2 && port == p2,
            _ => false,
        }
    }
}

/// Requested tunnel device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelAttrs {
    /// Interface name
    pub name: String,
    /// Device type and attributes
    pub kind: TunnelKind,
}

impl TunnelAttrs {
    /// GRE tunnel with the default TTL
    pub fn gre(name: impl Into<String>, local: Ipv4Addr, remote: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            kind: TunnelKind::Gre {
                local,
                remote,
                ttl: DEFAULT_GRE_TTL,
            },
        }
    }

    /// VXLAN device without underlay binding
    pub fn vxlan(name: impl Into<String>, vni: u32, port: u16) -> Self {
        Self {
            name: name.into(),
            kind: TunnelKind::Vxlan {
                vni,
                port,
                local: None,
                dev: None,
            },
        }
    }
}

/// What the kernel reports about a link
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkKind {
    /// A GRE or VXLAN device with decoded attributes
    Tunnel(TunnelKind),
    /// A GRE or VXLAN device whose attributes are out of range
    Unreadable(String),
    /// Any other link type
    Other(String),
}

/// Observed state of a network interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkInfo {
    /// Interface name
    pub name: String,
    /// Kernel interface index
    pub index: u32,
    /// Link type
    pub kind: LinkKind,
}

/// Handle to a programmed tunnel device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelHandle {
    /// Interface name
    pub name: String,
    /// Kernel interface index
    pub index: u32,
}

/// Kernel interface operations
///
/// Delete reports a missing device as a not-found [`Error::Device`]; address
/// and forwarding-entry additions treat "already exists" as success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Look up a link by name
    async fn get_link(&self, name: &str) -> Result<Option<LinkInfo>, Error>;

    /// Look up a link by kernel index
    async fn link_by_index(&self, index: u32) -> Result<Option<LinkInfo>, Error>;

    /// Create a tunnel device
    async fn add_link(&self, attrs: &TunnelAttrs) -> Result<(), Error>;

    /// Delete a device
    async fn delete_link(&self, name: &str) -> Result<(), Error>;

    /// Assign an address to a device
    async fn add_address(&self, name: &str, addr: Ipv4Net) -> Result<(), Error>;

    /// Bring a device up
    async fn set_up(&self, name: &str) -> Result<(), Error>;

    /// Append an all-zeros forwarding entry flooding to `dst` (VXLAN only)
    async fn append_flood_entry(&self, name: &str, dst: Ipv4Addr) -> Result<(), Error>;
}

/// Tunnel device lifecycle on top of [`LinkOps`]
#[derive(Clone)]
pub struct TunnelManager {
    links: Arc<dyn LinkOps>,
}

impl TunnelManager {
    /// Create a manager over the given link backend
    pub fn new(links: Arc<dyn LinkOps>) -> Self {
        Self { links }
    }

    /// Create the device, or reuse/replace one that already exists.
    pub async fn ensure_tunnel(&self, attrs: &TunnelAttrs) -> Result<TunnelHandle, Error> {
        if let Some(existing) = self.links.get_link(&attrs.name).await? {
            match &existing.kind {
                LinkKind::Tunnel(kind) if kind.same_identity(&attrs.kind) => {
                    debug!(device = %attrs.name, index = existing.index, "tunnel already present");
                    return Ok(TunnelHandle {
                        name: existing.name,
                        index: existing.index,
                    });
                }
                LinkKind::Tunnel(kind) if kind.kind_name() == attrs.kind.kind_name() => {
                    info!(
                        device = %attrs.name,
                        current = ?kind,
                        requested = ?attrs.kind,
                        "tunnel attributes changed, recreating"
                    );
                    self.delete_ignoring_missing(&attrs.name).await?;
                }
                LinkKind::Unreadable(kind) if kind == attrs.kind.kind_name() => {
                    info!(device = %attrs.name, requested = ?attrs.kind, "tunnel attributes unreadable, recreating");
                    self.delete_ignoring_missing(&attrs.name).await?;
                }
                other => {
                    return Err(Error::device(
                        &attrs.name,
                        format!(
                            "exists as {:?}, expected a {} device",
                            other,
                            attrs.kind.kind_name()
                        ),
                    ));
                }
            }
        }

        self.links.add_link(attrs).await?;
        let created = self
            .links
            .get_link(&attrs.name)
            .await?
            .ok_or_else(|| Error::device(&attrs.name, "device missing after creation"))?;

        info!(device = %created.name, index = created.index, kind = attrs.kind.kind_name(), "tunnel created");
        Ok(TunnelHandle {
            name: created.name,
            index: created.index,
        })
    }

    /// Delete the device. A device that is already gone is success.
    pub async fn teardown_tunnel(&self, handle: &TunnelHandle) -> Result<(), Error> {
        self.delete_ignoring_missing(&handle.name).await
    }

    /// Delete a tunnel device by name, ignoring a missing one.
    ///
    /// A non-tunnel device with that name is left alone.
    pub async fn teardown_by_name(&self, name: &str) -> Result<(), Error> {
        match self.links.get_link(name).await? {
            None => Ok(()),
            Some(LinkInfo {
                kind: LinkKind::Other(kind),
                ..
            }) => {
                warn!(device = name, kind = %kind, "not a tunnel device, leaving it in place");
                Ok(())
            }
            Some(_) => self.delete_ignoring_missing(name).await,
        }
    }

    /// Assign `ip/prefix_len` to the device. An existing identical address is success.
    pub async fn configure_address(
        &self,
        handle: &TunnelHandle,
        ip: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), Error> {
        let addr = Ipv4Net::new(ip, prefix_len)
            .map_err(|e| Error::invalid_address(format!("{ip}/{prefix_len}: {e}")))?;
        self.links.add_address(&handle.name, addr).await
    }

    /// Bring the device up
    pub async fn set_up(&self, handle: &TunnelHandle) -> Result<(), Error> {
        self.links.set_up(&handle.name).await
    }

    /// Add a static flood entry so broadcast traffic reaches `peer`
    pub async fn add_flood_peer(&self, handle: &TunnelHandle, peer: Ipv4Addr) -> Result<(), Error> {
        self.links.append_flood_entry(&handle.name, peer).await
    }

    /// Resolve an interface by its recorded kernel index
    pub async fn resolve_index(&self, index: u32) -> Result<Option<LinkInfo>, Error> {
        self.links.link_by_index(index).await
    }

    async fn delete_ignoring_missing(&self, name: &str) -> Result<(), Error> {
        match self.links.delete_link(name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(device = %name, "device already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// iproute2 backend
// =============================================================================

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
    #[serde(default)]
    link_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
    #[serde(default)]
    info_data: Option<serde_json::Value>,
}

impl IpLink {
    fn into_info(self) -> LinkInfo {
        let kind = match self.linkinfo {
            Some(IpLinkInfo {
                info_kind: Some(kind),
                info_data,
            }) => decode_kind(&kind, info_data.as_ref()),
            Some(IpLinkInfo { info_kind: None, .. }) | None => {
                LinkKind::Other(self.link_type.unwrap_or_else(|| "unknown".to_string()))
            }
        };
        LinkInfo {
            name: self.ifname,
            index: self.ifindex,
            kind,
        }
    }
}

fn json_addr(data: &serde_json::Value, key: &str) -> Option<Ipv4Addr> {
    data.get(key)?.as_str()?.parse().ok()
}

/// Absent keys decode as zero; None when the value does not fit `T`.
fn json_uint<T: TryFrom<u64> + Default>(data: &serde_json::Value, key: &str) -> Option<T> {
    match data.get(key).and_then(|v| v.as_u64()) {
        Some(v) => T::try_from(v).ok(),
        None => Some(T::default()),
    }
}

fn decode_kind(kind: &str, data: Option<&serde_json::Value>) -> LinkKind {
    let empty = serde_json::Value::Null;
    let data = data.unwrap_or(&empty);
    let decoded = match kind {
        "gre" => json_uint(data, "ttl").map(|ttl| TunnelKind::Gre {
            local: json_addr(data, "local").unwrap_or(Ipv4Addr::UNSPECIFIED),
            remote: json_addr(data, "remote").unwrap_or(Ipv4Addr::UNSPECIFIED),
            ttl,
        }),
        "vxlan" => json_uint(data, "id").and_then(|vni| {
            Some(TunnelKind::Vxlan {
                vni,
                port: json_uint(data, "port")?,
                local: json_addr(data, "local"),
                dev: data
                    .get("link")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            })
        }),
        other => return LinkKind::Other(other.to_string()),
    };
    match decoded {
        Some(tunnel) => LinkKind::Tunnel(tunnel),
        None => LinkKind::Unreadable(kind.to_string()),
    }
}

fn is_missing_device(out: &CommandOutput) -> bool {
    out.stderr.contains("does not exist") || out.stderr.contains("Cannot find device")
}

fn is_already_present(out: &CommandOutput) -> bool {
    out.stderr.contains("File exists") || out.stderr.contains("already assigned")
}

/// [`LinkOps`] backed by the iproute2 `ip` and `bridge` tools
pub struct IpLinkCli {
    runner: Arc<dyn CommandRunner>,
}

impl IpLinkCli {
    /// Create a backend using the given command runner
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn ip(&self, argv: Vec<String>) -> Result<CommandOutput, Error> {
        self.runner.run("ip", &argv).await
    }

    fn parse_links(stdout: &str) -> Result<Vec<LinkInfo>, Error> {
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        let links: Vec<IpLink> = serde_json::from_str(stdout)
            .map_err(|e| Error::serialization(format!("ip link output: {e}")))?;
        Ok(links.into_iter().map(IpLink::into_info).collect())
    }
}

#[async_trait]
impl LinkOps for IpLinkCli {
    async fn get_link(&self, name: &str) -> Result<Option<LinkInfo>, Error> {
        let out = self
            .ip(args(["-d", "-j", "link", "show", "dev", name]))
            .await?;
        if !out.success {
            if is_missing_device(&out) {
                return Ok(None);
            }
            return Err(Error::device(name, out.error_text()));
        }
        Ok(Self::parse_links(&out.stdout)?.into_iter().next())
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<LinkInfo>, Error> {
        let out = self.ip(args(["-d", "-j", "link", "show"])).await?;
        if !out.success {
            return Err(Error::device(format!("#{index}"), out.error_text()));
        }
        Ok(Self::parse_links(&out.stdout)?
            .into_iter()
            .find(|l| l.index == index))
    }

    async fn add_link(&self, attrs: &TunnelAttrs) -> Result<(), Error> {
        let mut argv = args(["link", "add", attrs.name.as_str(), "type"]);
        match &attrs.kind {
            TunnelKind::Gre { local, remote, ttl } => {
                argv.extend(args(["gre", "local"]));
                argv.push(local.to_string());
                argv.push("remote".to_string());
                argv.push(remote.to_string());
                argv.push("ttl".to_string());
                argv.push(ttl.to_string());
            }
            TunnelKind::Vxlan {
                vni,
                port,
                local,
                dev,
            } => {
                argv.extend(args(["vxlan", "id"]));
                argv.push(vni.to_string());
                argv.push("dstport".to_string());
                argv.push(port.to_string());
                if let Some(local) = local {
                    argv.push("local".to_string());
                    argv.push(local.to_string());
                }
                if let Some(dev) = dev {
                    argv.push("dev".to_string());
                    argv.push(dev.clone());
                }
            }
        }

        let out = self.ip(argv).await?;
        if !out.success {
            return Err(Error::device(&attrs.name, out.error_text()));
        }
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<(), Error> {
        let out = self.ip(args(["link", "del", "dev", name])).await?;
        if out.success {
            return Ok(());
        }
        if is_missing_device(&out) {
            return Err(Error::device_not_found(name));
        }
        Err(Error::device(name, out.error_text()))
    }

    async fn add_address(&self, name: &str, addr: Ipv4Net) -> Result<(), Error> {
        let out = self
            .ip(args(["addr", "add", addr.to_string().as_str(), "dev", name]))
            .await?;
        if out.success || is_already_present(&out) {
            return Ok(());
        }
        Err(Error::device(name, out.error_text()))
    }

    async fn set_up(&self, name: &str) -> Result<(), Error> {
        let out = self.ip(args(["link", "set", "dev", name, "up"])).await?;
        if !out.success {
            return Err(Error::device(name, out.error_text()));
        }
        Ok(())
    }

    async fn append_flood_entry(&self, name: &str, dst: Ipv4Addr) -> Result<(), Error> {
        let argv = args([
            "fdb",
            "append",
            "00:00:00:00:00:00",
            "dev",
            name,
            "dst",
            dst.to_string().as_str(),
        ]);
        let out = self.runner.run("bridge", &argv).await?;
        if out.success || is_already_present(&out) {
            return Ok(());
        }
        warn!(device = %name, %dst, error = %out.error_text(), "failed to add flood entry");
        Err(Error::device(name, out.error_text()))
    }
}
