//! Firecracker launch and API configuration.
//!
//! Field names follow the Firecracker REST API so the structs are sent
//! as request bodies unchanged.

use crate::error::{Error, Result};
use crate::machine::{kernel_args, Machine};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// File name of the API socket inside the state directory.
pub const API_SOCKET: &str = "firecracker.sock";

/// `PUT /boot-source` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub boot_args: String,
}

/// `PUT /machine-config` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineConfiguration {
    pub vcpu_count: u32,
    pub mem_size_mib: u64,
}

/// `PUT /network-interfaces/{iface_id}` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

/// Everything needed to relaunch and reconfigure a Firecracker guest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirecrackerConfig {
    /// VMM binary.
    pub binary: String,
    /// API socket path.
    pub api_socket: PathBuf,
    pub boot_source: BootSource,
    pub machine_config: MachineConfiguration,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

impl FirecrackerConfig {
    /// Command-line arguments of the VMM.
    pub fn args(&self, id: &str) -> Vec<String> {
        vec![
            "--api-sock".to_string(),
            self.api_socket.display().to_string(),
            "--id".to_string(),
            id.to_string(),
        ]
    }
}

/// Build the configuration for a prepared machine.
pub fn build(binary: &str, machine: &Machine) -> Result<FirecrackerConfig> {
    let spec = &machine.spec;
    let status = &machine.status;

    if !spec.volumes.is_empty() {
        return Err(Error::invalid_config(
            "firecracker has no shared filesystem device for volumes",
        ));
    }

    let kernel = status
        .kernel_path
        .clone()
        .ok_or_else(|| Error::invalid_config("kernel path not resolved"))?;
    let memory = spec
        .resources
        .memory
        .ok_or_else(|| Error::invalid_config("memory not set"))?;
    let cpus = spec
        .resources
        .cpus
        .ok_or_else(|| Error::invalid_config("cpus not set"))?;

    let mut network_interfaces = Vec::with_capacity(spec.networks.len());
    for (i, net) in spec.networks.iter().enumerate() {
        if net.interface.if_name.is_empty() {
            return Err(Error::invalid_config(format!(
                "interface {} on network {} has no tap device",
                i, net.network
            )));
        }
        network_interfaces.push(NetworkInterface {
            iface_id: format!("net{}", i),
            host_dev_name: net.interface.if_name.clone(),
            guest_mac: net.interface.mac.clone(),
        });
    }

    if !spec.ports.is_empty() {
        tracing::warn!(
            machine = %machine.uid,
            "port mappings are not forwarded with tap networking"
        );
    }

    Ok(FirecrackerConfig {
        binary: binary.to_string(),
        api_socket: status.state_dir.join(API_SOCKET),
        boot_source: BootSource {
            kernel_image_path: kernel,
            initrd_path: status.initrd_path.clone(),
            boot_args: kernel_args::encode(&spec.kernel_args, &spec.application_args),
        },
        machine_config: MachineConfiguration {
            vcpu_count: cpus,
            mem_size_mib: memory.as_mebibytes(),
        },
        network_interfaces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{KernelArg, MachineNetwork, MachineSpec, MachineVolume, Quantity};
    use crate::network::NetworkInterfaceSpec;

    fn prepared() -> Machine {
        let mut m = Machine::new("fc", MachineSpec::default());
        m.spec.resources.memory = Some(Quantity::mebibytes(128));
        m.spec.resources.cpus = Some(1);
        m.status.state_dir = PathBuf::from("/run/unikvm/abc");
        m.status.kernel_path = Some(PathBuf::from("/images/kernel"));
        m
    }

    #[test]
    fn test_build() {
        let mut m = prepared();
        m.spec.kernel_args = vec![KernelArg::new("vfs", "fstab", "none")];
        m.spec.networks.push(MachineNetwork {
            network: "default".into(),
            interface: NetworkInterfaceSpec {
                if_name: "tap12345678".into(),
                mac: Some("02:b0:b0:00:00:02".into()),
                ..Default::default()
            },
        });

        let config = build("firecracker", &m).unwrap();
        assert_eq!(config.api_socket, PathBuf::from("/run/unikvm/abc/firecracker.sock"));
        assert_eq!(config.boot_source.boot_args, "vfs.fstab=none");
        assert_eq!(config.machine_config.mem_size_mib, 128);
        assert_eq!(config.network_interfaces[0].iface_id, "net0");
        assert_eq!(config.network_interfaces[0].host_dev_name, "tap12345678");
        assert_eq!(
            config.args(&m.uid),
            vec![
                "--api-sock".to_string(),
                "/run/unikvm/abc/firecracker.sock".to_string(),
                "--id".to_string(),
                m.uid.clone(),
            ]
        );
    }

    #[test]
    fn test_boot_source_body_omits_empty_fields() {
        let body = serde_json::to_value(BootSource {
            kernel_image_path: PathBuf::from("/k"),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "kernel_image_path": "/k" }));
    }

    #[test]
    fn test_volumes_are_rejected() {
        let mut m = prepared();
        m.spec.volumes.push(MachineVolume {
            volume: "data".into(),
            source: PathBuf::from("/srv"),
            destination: PathBuf::from("/data"),
            read_only: false,
        });
        assert!(matches!(
            build("firecracker", &m),
            Err(Error::InvalidConfig(_))
        ));
    }
}
