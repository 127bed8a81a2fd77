//! Machine removal with dependent resources.
//!
//! Removing a machine stops it, detaches its network interfaces and
//! volumes when no other machine still references them, and only then
//! deletes it. Every step is attempted even if an earlier one failed; the
//! failures are returned together.

use crate::error::{Error, Result};
use crate::machine::{Machine, MachineNetwork, MachineService, MachineVolume};
use crate::network::{Network, NetworkService};
use crate::volume::{Volume, VolumeService, VolumeState};
use std::sync::Arc;

/// Services a removal touches.
#[derive(Clone)]
pub struct Teardown {
    machines: Arc<dyn MachineService>,
    networks: Arc<dyn NetworkService>,
    volumes: Vec<Arc<dyn VolumeService>>,
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown")
            .field("machines", &self.machines.name())
            .field(
                "volumes",
                &self.volumes.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Teardown {
    pub fn new(
        machines: Arc<dyn MachineService>,
        networks: Arc<dyn NetworkService>,
        volumes: Vec<Arc<dyn VolumeService>>,
    ) -> Self {
        Self {
            machines,
            networks,
            volumes,
        }
    }

    /// Stop, detach and delete one machine.
    ///
    /// Whether a network interface or volume is still in use is decided by
    /// listing every machine and scanning its references, so one removal
    /// costs O(machines × references). That is fine for the machines of a
    /// single host.
    pub async fn remove(&self, machine: &mut Machine) -> Result<()> {
        self.machines.get(machine).await?;
        let mut errors = Vec::new();

        if let Err(e) = self.machines.stop(machine).await {
            tracing::warn!(machine = %machine.uid, error = %e, "stop failed, continuing removal");
            errors.push((format!("stop {}", machine.name), e));
        }

        match self.machines.list().await {
            Ok(all) => {
                let others: Vec<Machine> = all.into_iter().filter(|m| m.uid != machine.uid).collect();
                for net in &machine.spec.networks {
                    if let Err(e) = self.detach_interface(net, &others).await {
                        tracing::warn!(machine = %machine.uid, network = %net.network, error = %e, "failed to detach interface");
                        errors.push((format!("network {}", net.network), e));
                    }
                }
                for vol in &machine.spec.volumes {
                    if let Err(e) = self.release_volume(vol, &others).await {
                        tracing::warn!(machine = %machine.uid, volume = %vol.volume, error = %e, "failed to release volume");
                        errors.push((format!("volume {}", vol.volume), e));
                    }
                }
            }
            Err(e) => {
                // Without the full list nothing can be proven unused.
                tracing::warn!(machine = %machine.uid, error = %e, "cannot list machines, leaving dependents attached");
                errors.push(("list machines".to_string(), e));
            }
        }

        if let Err(e) = self.machines.delete(machine).await {
            tracing::warn!(machine = %machine.uid, error = %e, "delete failed");
            errors.push((format!("delete {}", machine.name), e));
        }

        if errors.is_empty() {
            tracing::info!(machine = %machine.uid, name = %machine.name, "machine removed");
            Ok(())
        } else {
            Err(Error::aggregate(errors))
        }
    }

    /// Remove every machine. Returns the names of the removed ones; a
    /// failure on one machine does not stop the rest.
    pub async fn remove_all(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        let mut errors = Vec::new();
        for mut machine in self.machines.list().await? {
            match self.remove(&mut machine).await {
                Ok(()) => removed.push(machine.name),
                Err(e) => errors.push((machine.name, e)),
            }
        }
        if errors.is_empty() {
            Ok(removed)
        } else {
            Err(Error::aggregate(errors))
        }
    }

    async fn detach_interface(&self, attached: &MachineNetwork, others: &[Machine]) -> Result<()> {
        let Some(iface_uid) = attached.interface.uid.as_deref() else {
            return Ok(());
        };
        if others.iter().any(|m| m.uses_interface(&attached.network, iface_uid)) {
            tracing::debug!(network = %attached.network, interface = iface_uid, "interface still in use");
            return Ok(());
        }

        let mut network = Network::reference(&attached.network);
        match self.networks.get(&mut network).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        let before = network.interfaces.len();
        network
            .interfaces
            .retain(|i| i.uid.as_deref() != Some(iface_uid));
        if network.interfaces.len() == before {
            return Ok(());
        }
        self.networks.update(&mut network).await
    }

    async fn release_volume(&self, attached: &MachineVolume, others: &[Machine]) -> Result<()> {
        if others.iter().any(|m| m.uses_volume(&attached.volume)) {
            tracing::debug!(volume = %attached.volume, "volume still in use");
            return Ok(());
        }

        for service in &self.volumes {
            let mut volume = Volume::reference(&attached.volume);
            match service.get(&mut volume).await {
                Ok(()) => {
                    volume.state = VolumeState::Pending;
                    service.update(&mut volume).await?;
                    return service.delete(&mut volume).await;
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(Error::WrongPlatform { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
