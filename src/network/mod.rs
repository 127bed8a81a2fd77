//! Host bridge networks.
//!
//! A [`Network`] is a Linux bridge with a gateway address. Machines attach
//! through tap devices, one per [`NetworkInterfaceSpec`]. Every tap carries
//! the alias `{network uid}:{interface uid}` so a reconciliation pass can
//! tell its own devices from stale ones.

pub mod alloc;
pub mod bridge;
pub mod link;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

pub use alloc::{allocate_ip, MacSequencer, PingProber, Prober};
pub use bridge::BridgeService;
pub use link::{IpCommand, Link, LinkOps};

/// Default DNS server handed to guests.
pub const DEFAULT_DNS: &str = "1.1.1.1";

/// Longest interface name the kernel accepts.
pub const MAX_IF_NAME_LEN: usize = 15;

/// Bridge state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    #[default]
    Unknown,
    Up,
    Down,
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Up => f.write_str("up"),
            Self::Down => f.write_str("down"),
        }
    }
}

/// Traffic counters of a link.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// One tap device bound to a bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInterfaceSpec {
    /// Assigned on first reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Tap device name.
    #[serde(default)]
    pub if_name: String,
    /// Guest address with prefix, e.g. `10.0.0.2/24`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Assigned on first reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl NetworkInterfaceSpec {
    /// Guest address, if the CIDR is set and valid.
    pub fn ip(&self) -> Option<Ipv4Addr> {
        let cidr = self.cidr.as_deref()?;
        let addr = cidr.split_once('/').map_or(cidr, |(a, _)| a);
        addr.parse().ok()
    }
}

/// A host bridge and the interfaces attached to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Network {
    pub uid: String,
    pub name: String,
    /// Bridge device name. Defaults to the network name.
    #[serde(default)]
    pub if_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<Ipv4Addr>,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterfaceSpec>,
    #[serde(default)]
    pub state: NetworkState,
    #[serde(default)]
    pub stats: NetworkStats,
}

impl Network {
    /// A network with gateway and netmask set.
    pub fn new(name: impl Into<String>, gateway: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            gateway: Some(gateway),
            netmask: Some(netmask),
            ..Default::default()
        }
    }

    /// Reference to an existing network by name.
    pub fn reference(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Alias of an interface's tap device.
    pub fn alias(&self, interface_uid: &str) -> String {
        format!("{}:{}", self.uid, interface_uid)
    }

    /// Gateway and prefix length. Both must be set before the bridge exists.
    pub fn addressing(&self) -> Result<(Ipv4Addr, u8)> {
        let gateway = self
            .gateway
            .ok_or_else(|| Error::invalid_config(format!("network {} has no gateway", self.name)))?;
        let netmask = self
            .netmask
            .ok_or_else(|| Error::invalid_config(format!("network {} has no netmask", self.name)))?;
        Ok((gateway, prefix_len(netmask)?))
    }
}

/// Prefix length of a contiguous netmask.
pub fn prefix_len(netmask: Ipv4Addr) -> Result<u8> {
    let bits = u32::from(netmask);
    let len = bits.leading_ones();
    if bits.checked_shl(len).unwrap_or(0) != 0 {
        return Err(Error::invalid_config(format!(
            "netmask {} is not contiguous",
            netmask
        )));
    }
    Ok(len as u8)
}

/// Lifecycle of bridge networks.
#[async_trait]
pub trait NetworkService: Send + Sync {
    /// Allocate the bridge and its gateway address, then attach interfaces.
    async fn create(&self, network: &mut Network) -> Result<()>;

    /// Bring the bridge up.
    async fn start(&self, network: &mut Network) -> Result<()>;

    /// Bring the bridge and its taps down. Refuses while a guest answers.
    async fn stop(&self, network: &mut Network) -> Result<()>;

    /// Reconcile tap devices with `network.interfaces`.
    async fn update(&self, network: &mut Network) -> Result<()>;

    /// Remove the bridge and its taps. Refuses while a guest answers.
    async fn delete(&self, network: &mut Network) -> Result<()>;

    /// Refresh state and counters from the host.
    async fn get(&self, network: &mut Network) -> Result<()>;

    /// Every known network, refreshed.
    async fn list(&self) -> Result<Vec<Network>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_len() {
        assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 255, 0)).unwrap(), 24);
        assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 0, 0)).unwrap(), 16);
        assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 255, 255)).unwrap(), 32);
        assert!(prefix_len(Ipv4Addr::new(255, 0, 255, 0)).is_err());
    }

    #[test]
    fn test_interface_ip() {
        let iface = NetworkInterfaceSpec {
            cidr: Some("10.0.0.7/24".into()),
            ..Default::default()
        };
        assert_eq!(iface.ip(), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(NetworkInterfaceSpec::default().ip(), None);
    }

    #[test]
    fn test_addressing_requires_gateway_and_netmask() {
        let net = Network::reference("default");
        assert!(matches!(net.addressing(), Err(Error::InvalidConfig(_))));

        let net = Network::new("default", Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(net.addressing().unwrap(), (Ipv4Addr::new(10, 0, 0, 1), 24));
    }
}
