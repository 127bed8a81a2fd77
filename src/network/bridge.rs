//! Bridge network service.

use crate::error::{Error, Result};
use crate::network::alloc::{allocate_ip, MacSequencer, PingProber, Prober};
use crate::network::link::{IpCommand, Link, LinkOps};
use crate::network::{
    Network, NetworkInterfaceSpec, NetworkService, NetworkState, DEFAULT_DNS, MAX_IF_NAME_LEN,
};
use crate::store::Store;
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Linux bridge networks with one tap device per interface.
#[derive(Clone)]
pub struct BridgeService {
    store: Store,
    links: Arc<dyn LinkOps>,
    prober: Arc<dyn Prober>,
}

impl std::fmt::Debug for BridgeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeService")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl BridgeService {
    /// Service over the given link layer and prober.
    pub fn new(store: Store, links: Arc<dyn LinkOps>, prober: Arc<dyn Prober>) -> Self {
        Self {
            store,
            links,
            prober,
        }
    }

    /// Service using iproute2 and ICMP probes.
    pub fn host(store: Store) -> Self {
        Self::new(
            store,
            Arc::new(IpCommand::default()),
            Arc::new(PingProber::default()),
        )
    }

    /// Load a network by name.
    pub fn lookup(&self, name: &str) -> Result<Network> {
        self.store
            .lookup_network(name)?
            .ok_or_else(|| Error::NetworkNotFound(name.to_string()))
    }

    /// Fill identity and addressing from the stored record when the caller
    /// passed only a name and the desired interfaces.
    fn resolve(&self, network: &mut Network) -> Result<()> {
        if !network.uid.is_empty() && !network.if_name.is_empty() {
            return Ok(());
        }
        let stored = self.lookup(&network.name)?;
        network.uid = stored.uid;
        network.if_name = stored.if_name;
        network.gateway = network.gateway.or(stored.gateway);
        network.netmask = network.netmask.or(stored.netmask);
        if network.state == NetworkState::Unknown {
            network.state = stored.state;
        }
        Ok(())
    }

    /// Refuse if any interface answers a probe.
    async fn ensure_idle(&self, network: &Network) -> Result<()> {
        for iface in &network.interfaces {
            let Some(addr) = iface.ip() else { continue };
            if self.prober.alive(addr).await {
                return Err(Error::InterfaceInUse {
                    name: iface.if_name.clone(),
                    addr: addr.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Bring a single interface to its desired state, creating the tap if
    /// needed. Unchanged, running taps are not touched.
    async fn reconcile_tap(&self, bridge: &str, alias: &str, iface: &NetworkInterfaceSpec) -> Result<()> {
        let name = iface.if_name.as_str();
        let mac = iface.mac.as_deref();
        match self.links.get(name).await? {
            None => {
                tracing::debug!(tap = name, bridge, "creating tap");
                self.links.add_tap(name, bridge).await?;
                self.links.configure(name, alias, mac).await?;
                self.links.set_up(name, true).await?;
            }
            Some(link) => {
                if link.master.as_deref() != Some(bridge) {
                    return Err(Error::network(
                        "update",
                        format!("device {} is not attached to {}", name, bridge),
                    ));
                }
                if needs_configure(&link, alias, mac) {
                    self.links.configure(name, alias, mac).await?;
                }
                if !link.up {
                    self.links.set_up(name, true).await?;
                }
            }
        }
        Ok(())
    }
}

fn needs_configure(link: &Link, alias: &str, mac: Option<&str>) -> bool {
    let mac_differs = match (mac, link.mac.as_deref()) {
        (Some(want), Some(have)) => !want.eq_ignore_ascii_case(have),
        (Some(_), None) => true,
        (None, _) => false,
    };
    link.alias.as_deref() != Some(alias) || mac_differs
}

fn tap_name(uid: &str) -> String {
    let suffix: String = uid
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect();
    format!("tap{}", suffix)
}

fn validate_if_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IF_NAME_LEN {
        return Err(Error::invalid_config(format!(
            "interface name '{}' must be 1-{} characters",
            name, MAX_IF_NAME_LEN
        )));
    }
    Ok(())
}

#[async_trait]
impl NetworkService for BridgeService {
    async fn create(&self, network: &mut Network) -> Result<()> {
        if network.name.is_empty() {
            return Err(Error::invalid_config("network name is required"));
        }
        if self.store.lookup_network(&network.name)?.is_some() {
            return Err(Error::invalid_config(format!(
                "network {} already exists",
                network.name
            )));
        }
        if network.if_name.is_empty() {
            network.if_name = network.name.clone();
        }
        validate_if_name(&network.if_name)?;
        let (gateway, prefix) = network.addressing()?;
        if prefix > 30 {
            return Err(Error::invalid_config(format!(
                "network {} has no room for guests with prefix /{}",
                network.name, prefix
            )));
        }
        let host_mask = u32::MAX >> prefix;
        let host_bits = u32::from(gateway) & host_mask;
        if host_bits == 0 || host_bits == host_mask {
            return Err(Error::invalid_config(format!(
                "gateway {} is not a host address of /{}",
                gateway, prefix
            )));
        }
        if network.uid.is_empty() {
            network.uid = uuid::Uuid::new_v4().to_string();
        }

        match self.links.get(&network.if_name).await? {
            Some(link) if link.kind.as_deref() != Some("bridge") => {
                return Err(Error::network(
                    "create",
                    format!("device {} exists and is not a bridge", network.if_name),
                ));
            }
            Some(_) => tracing::debug!(bridge = %network.if_name, "reusing existing bridge"),
            None => self.links.add_bridge(&network.if_name).await?,
        }
        self.links
            .add_address(&network.if_name, gateway, prefix)
            .await?;
        self.links.set_up(&network.if_name, true).await?;
        network.state = NetworkState::Up;
        self.store.save_network(network)?;
        tracing::info!(network = %network.name, bridge = %network.if_name, "network created");

        if !network.interfaces.is_empty() {
            self.update(network).await?;
        }
        Ok(())
    }

    async fn start(&self, network: &mut Network) -> Result<()> {
        self.resolve(network)?;
        self.links.set_up(&network.if_name, true).await?;
        for iface in network.interfaces.iter().filter(|i| !i.if_name.is_empty()) {
            self.links.set_up(&iface.if_name, true).await?;
        }
        network.state = NetworkState::Up;
        self.store.save_network(network)?;
        Ok(())
    }

    async fn stop(&self, network: &mut Network) -> Result<()> {
        self.resolve(network)?;
        self.ensure_idle(network).await?;
        for iface in network.interfaces.iter().filter(|i| !i.if_name.is_empty()) {
            self.links.set_up(&iface.if_name, false).await?;
        }
        self.links.set_up(&network.if_name, false).await?;
        network.state = NetworkState::Down;
        self.store.save_network(network)?;
        Ok(())
    }

    async fn update(&self, network: &mut Network) -> Result<()> {
        self.resolve(network)?;
        let (gateway, prefix) = network.addressing()?;
        let bridge = network.if_name.clone();

        let mut taken_ips: HashSet<Ipv4Addr> =
            network.interfaces.iter().filter_map(|i| i.ip()).collect();
        taken_ips.insert(gateway);
        taken_ips.extend(self.links.neighbors(&bridge).await?);
        let mut taken_macs: HashSet<String> = network
            .interfaces
            .iter()
            .filter_map(|i| i.mac.clone())
            .collect();
        let mut macs = MacSequencer::seeded(&network.uid);

        let ports = self.links.ports(&bridge).await?;
        let mut in_use = HashSet::new();
        let mut errors = Vec::new();

        for i in 0..network.interfaces.len() {
            let uid = network.interfaces[i]
                .uid
                .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                .clone();
            let alias = network.alias(&uid);
            in_use.insert(alias.clone());

            let iface = &mut network.interfaces[i];
            if iface.if_name.is_empty() {
                iface.if_name = tap_name(&uid);
            }
            if let Err(e) = validate_if_name(&iface.if_name) {
                errors.push((uid, e));
                continue;
            }
            if iface.mac.is_none() {
                match macs.next_free(&taken_macs) {
                    Ok(mac) => {
                        taken_macs.insert(mac.clone());
                        iface.mac = Some(mac);
                    }
                    Err(e) => {
                        errors.push((uid, e));
                        continue;
                    }
                }
            }
            if iface.cidr.is_none() {
                match allocate_ip(gateway, prefix, &taken_ips, self.prober.as_ref()).await {
                    Ok(ip) => {
                        taken_ips.insert(ip);
                        iface.cidr = Some(format!("{}/{}", ip, prefix));
                    }
                    Err(e) => {
                        tracing::warn!(network = %network.name, interface = %uid, error = %e, "address allocation failed");
                        errors.push((uid, e));
                        continue;
                    }
                }
            }
            if iface.gateway.is_none() {
                iface.gateway = Some(gateway);
            }
            if iface.dns.is_empty() {
                iface.dns.push(DEFAULT_DNS.to_string());
            }

            if let Err(e) = self.reconcile_tap(&bridge, &alias, iface).await {
                tracing::warn!(network = %network.name, tap = %iface.if_name, error = %e, "tap reconciliation failed");
                errors.push((iface.if_name.clone(), e));
            }
        }

        for port in ports.iter().filter(|p| p.is_tap()) {
            let stale = port.alias.as_deref().map_or(true, |a| !in_use.contains(a));
            if stale {
                tracing::debug!(network = %network.name, tap = %port.name, "removing stale tap");
                if let Err(e) = self.links.delete(&port.name).await {
                    errors.push((port.name.clone(), e));
                }
            }
        }

        self.store.save_network(network)?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::aggregate(errors))
        }
    }

    async fn delete(&self, network: &mut Network) -> Result<()> {
        self.resolve(network)?;
        self.ensure_idle(network).await?;

        let mut errors = Vec::new();
        let mut taps: Vec<String> = self
            .links
            .ports(&network.if_name)
            .await?
            .into_iter()
            .filter(Link::is_tap)
            .map(|l| l.name)
            .collect();
        for iface in &network.interfaces {
            if !iface.if_name.is_empty() && !taps.contains(&iface.if_name) {
                taps.push(iface.if_name.clone());
            }
        }
        for tap in &taps {
            if let Err(e) = self.links.delete(tap).await {
                errors.push((tap.clone(), e));
            }
        }
        if let Err(e) = self.links.delete(&network.if_name).await {
            errors.push((network.if_name.clone(), e));
        }
        if !errors.is_empty() {
            return Err(Error::aggregate(errors));
        }

        self.store.remove_network(&network.name)?;
        network.state = NetworkState::Down;
        tracing::info!(network = %network.name, "network deleted");
        Ok(())
    }

    async fn get(&self, network: &mut Network) -> Result<()> {
        if network.uid.is_empty() {
            *network = self.lookup(&network.name)?;
        }
        match self.links.get(&network.if_name).await? {
            Some(link) => {
                network.state = if link.up {
                    NetworkState::Up
                } else {
                    NetworkState::Down
                };
                network.stats = link.stats;
            }
            None => network.state = NetworkState::Unknown,
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Network>> {
        let mut networks = self.store.list_networks()?;
        for network in &mut networks {
            if let Err(e) = self.get(network).await {
                tracing::warn!(network = %network.name, error = %e, "failed to refresh network");
            }
        }
        Ok(networks)
    }
}
