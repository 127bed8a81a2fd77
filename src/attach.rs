//! Attaching networks and volumes to a machine before it is created.
//!
//! Backends only consume what the machine spec carries. This module turns
//! references by name into concrete resources: an interface is allocated
//! on the named bridge, and a named volume is resolved to its source path
//! and marked bound. Removal is the mirror image, see [`crate::Teardown`].

use crate::error::{Error, Result};
use crate::machine::{Machine, MachineNetwork, MachineVolume};
use crate::network::{Network, NetworkService, NetworkState};
use crate::volume::{Volume, VolumeService, VolumeState};
use std::sync::Arc;

/// Services an attachment touches.
#[derive(Clone)]
pub struct Attach {
    networks: Arc<dyn NetworkService>,
    volumes: Vec<Arc<dyn VolumeService>>,
}

impl std::fmt::Debug for Attach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attach")
            .field(
                "volumes",
                &self.volumes.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// What one call changed, so it can be undone.
#[derive(Debug, Default)]
pub struct Attached {
    interfaces: Vec<(String, String)>,
    volumes: Vec<(usize, String, VolumeState)>,
}

impl Attach {
    pub fn new(networks: Arc<dyn NetworkService>, volumes: Vec<Arc<dyn VolumeService>>) -> Self {
        Self { networks, volumes }
    }

    /// Allocate every interface and bind every volume the machine names.
    ///
    /// The machine spec is filled in with the allocated interfaces and the
    /// volume source paths. On failure everything attached so far is
    /// released again and the error is returned.
    pub async fn attach(&self, machine: &mut Machine) -> Result<Attached> {
        let mut done = Attached::default();
        match self.attach_all(machine, &mut done).await {
            Ok(()) => Ok(done),
            Err(e) => {
                self.rollback(done).await;
                Err(e)
            }
        }
    }

    /// Undo an attachment, e.g. after the backend refused the machine.
    /// Failures are logged, not returned.
    pub async fn rollback(&self, done: Attached) {
        for (network, iface_uid) in done.interfaces.into_iter().rev() {
            if let Err(e) = self.remove_interface(&network, &iface_uid).await {
                tracing::warn!(network = %network, interface = %iface_uid, error = %e, "failed to roll back interface");
            }
        }
        for (idx, name, previous) in done.volumes.into_iter().rev() {
            let service = &self.volumes[idx];
            let mut volume = Volume::reference(&name);
            let restored = match service.get(&mut volume).await {
                Ok(()) => {
                    volume.state = previous;
                    service.update(&mut volume).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = restored {
                tracing::warn!(volume = %name, error = %e, "failed to roll back volume");
            }
        }
    }

    async fn attach_all(&self, machine: &mut Machine, done: &mut Attached) -> Result<()> {
        for attached in &mut machine.spec.networks {
            let iface_uid = attached
                .interface
                .uid
                .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                .clone();
            self.attach_interface(attached, &iface_uid, done).await?;
        }
        for attached in &mut machine.spec.volumes {
            let (idx, previous) = self.bind_volume(attached).await?;
            done.volumes.push((idx, attached.volume.clone(), previous));
        }
        tracing::debug!(
            machine = %machine.uid,
            networks = machine.spec.networks.len(),
            volumes = machine.spec.volumes.len(),
            "dependents attached"
        );
        Ok(())
    }

    async fn attach_interface(
        &self,
        attached: &mut MachineNetwork,
        iface_uid: &str,
        done: &mut Attached,
    ) -> Result<()> {
        let mut network = Network::reference(&attached.network);
        self.networks.get(&mut network).await?;
        if network.state == NetworkState::Unknown {
            return Err(Error::network(
                "attach",
                format!("bridge of network {} is missing", network.name),
            ));
        }
        if network
            .interfaces
            .iter()
            .any(|i| i.uid.as_deref() == Some(iface_uid))
        {
            return Err(Error::invalid_config(format!(
                "interface {} is already attached to {}",
                iface_uid, network.name
            )));
        }

        network.interfaces.push(attached.interface.clone());
        // The interface is stored even if reconciliation fails.
        done.interfaces
            .push((network.name.clone(), iface_uid.to_string()));
        self.networks.update(&mut network).await?;

        attached.interface = network
            .interfaces
            .into_iter()
            .find(|i| i.uid.as_deref() == Some(iface_uid))
            .ok_or_else(|| {
                Error::network("attach", format!("interface {} was not kept", iface_uid))
            })?;
        tracing::info!(network = %attached.network, tap = %attached.interface.if_name, "interface attached");
        Ok(())
    }

    async fn bind_volume(&self, attached: &mut MachineVolume) -> Result<(usize, VolumeState)> {
        for (idx, service) in self.volumes.iter().enumerate() {
            let mut volume = Volume::reference(&attached.volume);
            match service.get(&mut volume).await {
                Ok(()) => {}
                Err(Error::WrongPlatform { .. }) => continue,
                Err(e) => return Err(e),
            }
            if volume.state == VolumeState::Lost {
                return Err(Error::volume(
                    "attach",
                    format!("source of volume {} is gone", volume.name),
                ));
            }
            if attached.destination.as_os_str().is_empty() {
                attached.destination = volume.destination.clone();
            }
            if attached.destination.as_os_str().is_empty() {
                return Err(Error::invalid_config(format!(
                    "volume {} needs a mount point",
                    volume.name
                )));
            }

            let previous = volume.state;
            attached.source = volume.source.clone();
            attached.read_only |= volume.read_only;
            volume.state = VolumeState::Bound;
            service.update(&mut volume).await?;
            tracing::info!(volume = %volume.name, destination = %attached.destination.display(), "volume bound");
            return Ok((idx, previous));
        }
        Err(Error::VolumeNotFound(attached.volume.clone()))
    }

    async fn remove_interface(&self, network: &str, iface_uid: &str) -> Result<()> {
        let mut network = Network::reference(network);
        self.networks.get(&mut network).await?;
        network
            .interfaces
            .retain(|i| i.uid.as_deref() != Some(iface_uid));
        self.networks.update(&mut network).await
    }
}
