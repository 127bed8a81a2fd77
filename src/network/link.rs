//! Host link layer.
//!
//! [`LinkOps`] is the narrow set of operations the bridge service needs.
//! [`IpCommand`] implements it with iproute2, reading its JSON output.

use crate::error::{Error, Result};
use crate::network::NetworkStats;
use crate::process::Executable;
use async_trait::async_trait;
use serde::Deserialize;
use std::net::Ipv4Addr;

/// Default iproute2 binary.
pub const IP_BINARY: &str = "ip";

/// A host network device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    /// `bridge`, `tun`, ... when known.
    pub kind: Option<String>,
    /// Bridge the device is attached to.
    pub master: Option<String>,
    pub alias: Option<String>,
    pub mac: Option<String>,
    pub up: bool,
    pub stats: NetworkStats,
}

impl Link {
    /// Whether this is a tap device.
    pub fn is_tap(&self) -> bool {
        self.kind.as_deref() == Some("tun")
    }
}

/// Link-layer operations on the host.
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Look up a device. `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<Link>>;

    /// Devices attached to a bridge.
    async fn ports(&self, bridge: &str) -> Result<Vec<Link>>;

    /// Create a bridge device.
    async fn add_bridge(&self, name: &str) -> Result<()>;

    /// Assign an address to a device.
    async fn add_address(&self, name: &str, addr: Ipv4Addr, prefix: u8) -> Result<()>;

    /// Create a tap device attached to `bridge`.
    async fn add_tap(&self, name: &str, bridge: &str) -> Result<()>;

    /// Set the alias and, if given, the MAC address of a device.
    async fn configure(&self, name: &str, alias: &str, mac: Option<&str>) -> Result<()>;

    /// Bring a device up or down.
    async fn set_up(&self, name: &str, up: bool) -> Result<()>;

    /// Delete a device. Deleting an absent device succeeds.
    async fn delete(&self, name: &str) -> Result<()>;

    /// IPv4 neighbours seen on a device.
    async fn neighbors(&self, name: &str) -> Result<Vec<Ipv4Addr>>;
}

// ============================================================================
// iproute2
// ============================================================================

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    ifalias: Option<String>,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
    #[serde(default)]
    stats64: Option<IpStats>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct IpStats {
    #[serde(default)]
    rx: IpCounters,
    #[serde(default)]
    tx: IpCounters,
}

#[derive(Debug, Default, Deserialize)]
struct IpCounters {
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    packets: u64,
}

#[derive(Debug, Deserialize)]
struct IpNeighbor {
    dst: String,
}

impl From<IpLink> for Link {
    fn from(l: IpLink) -> Self {
        let stats = l.stats64.unwrap_or_default();
        Self {
            up: l.flags.iter().any(|f| f == "UP"),
            name: l.ifname,
            kind: l.linkinfo.and_then(|i| i.info_kind),
            master: l.master,
            alias: l.ifalias,
            mac: l.address,
            stats: NetworkStats {
                rx_bytes: stats.rx.bytes,
                rx_packets: stats.rx.packets,
                tx_bytes: stats.tx.bytes,
                tx_packets: stats.tx.packets,
            },
        }
    }
}

/// Parse `ip -j link` output.
fn parse_links(json: &str) -> Result<Vec<Link>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let links: Vec<IpLink> = serde_json::from_str(json)?;
    Ok(links.into_iter().map(Link::from).collect())
}

/// Parse `ip -j neigh` output, keeping IPv4 entries.
fn parse_neighbors(json: &str) -> Result<Vec<Ipv4Addr>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<IpNeighbor> = serde_json::from_str(json)?;
    Ok(entries.iter().filter_map(|n| n.dst.parse().ok()).collect())
}

fn is_missing_device(err: &Error) -> bool {
    match err {
        Error::CommandFailed { reason, .. } => {
            reason.contains("does not exist") || reason.contains("Cannot find device")
        }
        _ => false,
    }
}

/// [`LinkOps`] backed by the `ip` command.
#[derive(Debug, Clone)]
pub struct IpCommand {
    binary: String,
}

impl Default for IpCommand {
    fn default() -> Self {
        Self::new(IP_BINARY)
    }
}

impl IpCommand {
    /// Use `binary` as the iproute2 executable.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let mut exe = Executable::new(&self.binary).args(args.iter().copied());
        tracing::debug!(command = %exe.command_line(), "link operation");
        exe.output()
            .await
            .map_err(|e| match e {
                Error::CommandFailed { .. } if is_missing_device(&e) => e,
                Error::CommandFailed { command, reason } => Error::network(command, reason),
                other => other,
            })
    }
}

#[async_trait]
impl LinkOps for IpCommand {
    async fn get(&self, name: &str) -> Result<Option<Link>> {
        match self.run(&["-j", "-s", "-d", "link", "show", "dev", name]).await {
            Ok(out) => Ok(parse_links(&out)?.into_iter().next()),
            Err(e) if is_missing_device(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn ports(&self, bridge: &str) -> Result<Vec<Link>> {
        let out = self
            .run(&["-j", "-s", "-d", "link", "show", "master", bridge])
            .await?;
        parse_links(&out)
    }

    async fn add_bridge(&self, name: &str) -> Result<()> {
        self.run(&["link", "add", "name", name, "type", "bridge"])
            .await
            .map(|_| ())
    }

    async fn add_address(&self, name: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        let cidr = format!("{}/{}", addr, prefix);
        self.run(&["addr", "replace", &cidr, "dev", name])
            .await
            .map(|_| ())
    }

    async fn add_tap(&self, name: &str, bridge: &str) -> Result<()> {
        self.run(&["tuntap", "add", "dev", name, "mode", "tap"]).await?;
        self.run(&["link", "set", "dev", name, "master", bridge])
            .await
            .map(|_| ())
    }

    async fn configure(&self, name: &str, alias: &str, mac: Option<&str>) -> Result<()> {
        self.run(&["link", "set", "dev", name, "alias", alias]).await?;
        if let Some(mac) = mac {
            self.run(&["link", "set", "dev", name, "address", mac]).await?;
        }
        Ok(())
    }

    async fn set_up(&self, name: &str, up: bool) -> Result<()> {
        let state = if up { "up" } else { "down" };
        self.run(&["link", "set", "dev", name, state])
            .await
            .map(|_| ())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.run(&["link", "delete", "dev", name]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing_device(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn neighbors(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let out = self.run(&["-j", "-4", "neigh", "show", "dev", name]).await?;
        parse_neighbors(&out)
    }
}
