//! QEMU launch configuration.

use crate::error::{Error, Result};
use crate::machine::{kernel_args, Architecture, Machine};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the QMP control socket inside the state directory.
pub const QMP_CONTROL_SOCKET: &str = "qmp-control.sock";

/// File name of the QMP event socket inside the state directory.
pub const QMP_EVENTS_SOCKET: &str = "qmp-events.sock";

/// Everything needed to relaunch and control a QEMU guest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QemuConfig {
    /// System emulator binary.
    pub binary: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Pid file written by the daemonized emulator.
    pub pid_file: PathBuf,
    /// QMP socket for commands.
    pub control_socket: PathBuf,
    /// QMP socket reserved for the event stream.
    pub events_socket: PathBuf,
}

impl QemuConfig {
    /// Sockets created by the emulator.
    pub fn sockets(&self) -> Vec<PathBuf> {
        vec![self.control_socket.clone(), self.events_socket.clone()]
    }
}

/// Emulator binary for an architecture.
pub fn binary(prefix: &str, arch: Architecture) -> String {
    let suffix = match arch {
        Architecture::X86_64 => "x86_64",
        Architecture::Arm64 => "aarch64",
    };
    format!("{}-{}", prefix, suffix)
}

fn flag(args: &mut Vec<String>, name: &str, value: impl Into<String>) {
    args.push(name.to_string());
    args.push(value.into());
}

fn qmp_arg(path: &Path) -> String {
    format!("unix:{},server=on,wait=off", path.display())
}

/// Build the emulator invocation for a prepared machine.
///
/// The guest is launched with its vCPUs halted (`-S`) and daemonizes
/// once its sockets are listening.
pub fn build(prefix: &str, machine: &Machine) -> Result<QemuConfig> {
    let spec = &machine.spec;
    let status = &machine.status;
    let kernel = status
        .kernel_path
        .as_ref()
        .ok_or_else(|| Error::invalid_config("kernel path not resolved"))?;
    let memory = spec
        .resources
        .memory
        .ok_or_else(|| Error::invalid_config("memory not set"))?;
    let cpus = spec
        .resources
        .cpus
        .ok_or_else(|| Error::invalid_config("cpus not set"))?;

    let pid_file = status.state_dir.join(crate::machine::service::PID_FILE_NAME);
    let control_socket = status.state_dir.join(QMP_CONTROL_SOCKET);
    let events_socket = status.state_dir.join(QMP_EVENTS_SOCKET);

    let mut args = vec!["-name".to_string(), machine.name.clone()];
    args.push("-S".to_string());
    args.push("-daemonize".to_string());
    flag(&mut args, "-pidfile", pid_file.display().to_string());
    flag(&mut args, "-qmp", qmp_arg(&control_socket));
    flag(&mut args, "-qmp", qmp_arg(&events_socket));
    args.push("-nodefaults".to_string());
    args.push("-no-user-config".to_string());
    flag(&mut args, "-display", "none");
    flag(&mut args, "-serial", format!("file:{}", status.log_file.display()));
    flag(&mut args, "-m", format!("{}M", memory.as_mebibytes()));
    flag(&mut args, "-smp", cpus.to_string());

    match spec.architecture {
        Architecture::X86_64 => flag(&mut args, "-machine", "pc"),
        Architecture::Arm64 => flag(&mut args, "-machine", "virt"),
    }

    if spec.emulation {
        flag(&mut args, "-accel", "tcg");
        if spec.architecture == Architecture::Arm64 {
            flag(&mut args, "-cpu", "max");
        }
    } else {
        let accel = if cfg!(target_os = "macos") { "hvf" } else { "kvm" };
        flag(&mut args, "-accel", accel);
        flag(&mut args, "-cpu", "host");
    }

    flag(&mut args, "-kernel", kernel.display().to_string());
    if let Some(initrd) = &status.initrd_path {
        flag(&mut args, "-initrd", initrd.display().to_string());
    }
    let cmdline = kernel_args::encode(&spec.kernel_args, &spec.application_args);
    if !cmdline.is_empty() {
        flag(&mut args, "-append", cmdline);
    }

    for (i, net) in spec.networks.iter().enumerate() {
        let iface = &net.interface;
        if iface.if_name.is_empty() {
            return Err(Error::invalid_config(format!(
                "interface {} on network {} has no tap device",
                i, net.network
            )));
        }
        flag(
            &mut args,
            "-netdev",
            format!(
                "tap,id=net{},ifname={},script=no,downscript=no",
                i, iface.if_name
            ),
        );
        let mut device = format!("virtio-net-pci,netdev=net{}", i);
        if let Some(mac) = &iface.mac {
            device.push_str(&format!(",mac={}", mac));
        }
        flag(&mut args, "-device", device);
    }

    for (i, vol) in spec.volumes.iter().enumerate() {
        let mut fsdev = format!(
            "local,id=fs{},path={},security_model=passthrough",
            i,
            vol.source.display()
        );
        if vol.read_only {
            fsdev.push_str(",readonly=on");
        }
        flag(&mut args, "-fsdev", fsdev);
        flag(
            &mut args,
            "-device",
            format!("virtio-9p-pci,fsdev=fs{},mount_tag={}", i, vol.volume),
        );
    }

    if !spec.ports.is_empty() {
        tracing::warn!(
            machine = %machine.uid,
            "port mappings are not forwarded with tap networking"
        );
    }

    Ok(QemuConfig {
        binary: binary(prefix, spec.architecture),
        args,
        pid_file,
        control_socket,
        events_socket,
    })
}
