//! Machine data model and hypervisor backends.
//!
//! A [`Machine`] pairs an immutable identity with a desired [`MachineSpec`]
//! and a mutable [`MachineStatus`]. Backends implement
//! [`service::MachineService`] to translate the spec into a running guest
//! and map the hypervisor's native status back onto [`MachineState`].

pub mod firecracker;
pub mod iterator;
pub mod kernel_args;
pub mod qemu;
pub mod registry;
pub mod service;

use crate::error::{Error, Result};
use crate::network::NetworkInterfaceSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

pub use iterator::MachineIterator;
pub use kernel_args::KernelArg;
pub use registry::{KConfig, Registry, Strategy};
pub use service::{LogOptions, MachineService, WatchOptions};

use firecracker::FirecrackerConfig;
use qemu::QemuConfig;

// ============================================================================
// Lifecycle State
// ============================================================================

/// Machine lifecycle state, uniform across backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Native status could not be mapped.
    #[default]
    Unknown,
    /// Guest process exists, vCPUs not yet running.
    Created,
    /// Guest is executing.
    Running,
    /// Guest execution is suspended by the host.
    Paused,
    /// Guest is rebooting.
    Restarting,
    /// Guest suspended itself (e.g. ACPI S3).
    Suspended,
    /// Guest shut down.
    Exited,
    /// Guest or launch failed.
    Failed,
    /// Hypervisor reported an internal error.
    Errored,
    /// Hypervisor disappeared without a clean shutdown.
    Dead,
}

impl MachineState {
    /// Whether the machine can no longer run without being started again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Failed | Self::Dead)
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Suspended => "suspended",
            Self::Exited => "exited",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Resource Quantities
// ============================================================================

const KI: u64 = 1024;
const MI: u64 = 1024 * KI;
const GI: u64 = 1024 * MI;

/// A byte quantity written with binary (`Ki`, `Mi`, `Gi`) or decimal
/// (`K`, `M`, `G`) suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quantity(u64);

impl Quantity {
    /// Quantity of `n` mebibytes.
    pub const fn mebibytes(n: u64) -> Self {
        Self(n * MI)
    }

    /// Quantity of `n` bytes.
    pub const fn bytes(n: u64) -> Self {
        Self(n)
    }

    /// Size in bytes.
    pub fn as_bytes(self) -> u64 {
        self.0
    }

    /// Size in whole mebibytes, rounded up.
    pub fn as_mebibytes(self) -> u64 {
        self.0.div_ceil(MI)
    }
}

impl FromStr for Quantity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (digits, suffix) = s.split_at(split);
        let n: u64 = digits
            .parse()
            .map_err(|_| Error::invalid_config(format!("invalid quantity '{}'", s)))?;

        let unit = match suffix {
            "" => 1,
            "Ki" => KI,
            "Mi" => MI,
            "Gi" => GI,
            "K" | "k" => 1_000,
            "M" => 1_000_000,
            "G" => 1_000_000_000,
            other => {
                return Err(Error::invalid_config(format!(
                    "invalid quantity suffix '{}' in '{}'",
                    other, s
                )))
            }
        };
        n.checked_mul(unit)
            .map(Self)
            .ok_or_else(|| Error::invalid_config(format!("quantity '{}' overflows", s)))
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            0 => write!(f, "0"),
            n if n % GI == 0 => write!(f, "{}Gi", n / GI),
            n if n % MI == 0 => write!(f, "{}Mi", n / MI),
            n if n % KI == 0 => write!(f, "{}Ki", n / KI),
            n => write!(f, "{}", n),
        }
    }
}

impl TryFrom<String> for Quantity {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.to_string()
    }
}

// ============================================================================
// Specification
// ============================================================================

/// Guest CPU architecture.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// x86-64.
    #[default]
    X86_64,
    /// 64-bit ARM.
    Arm64,
}

impl Architecture {
    /// Architecture of the host running this process.
    pub fn host() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Some(Self::X86_64),
            "aarch64" => Some(Self::Arm64),
            _ => None,
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X86_64 => f.write_str("x86_64"),
            Self::Arm64 => f.write_str("arm64"),
        }
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "x86_64" | "amd64" => Ok(Self::X86_64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            other => Err(Error::invalid_config(format!("unknown architecture '{}'", other))),
        }
    }
}

/// Requested CPU and memory. Unset values are filled in at create time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resources {
    /// vCPU count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    /// Guest memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Quantity>,
}

/// A network interface attached to a machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineNetwork {
    /// Name of the bridge network.
    pub network: String,
    /// The interface as reconciled by the network service.
    pub interface: NetworkInterfaceSpec,
}

/// A volume mounted into a machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineVolume {
    /// Volume name.
    pub volume: String,
    /// Host source path, resolved from the volume.
    pub source: PathBuf,
    /// Mount point inside the guest.
    pub destination: PathBuf,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// A host-to-guest port mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the guest.
    pub machine_port: u16,
    /// `tcp` or `udp`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Desired machine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineSpec {
    /// Guest architecture.
    #[serde(default)]
    pub architecture: Architecture,
    /// Backend that should own the machine. Any backend if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Kernel image.
    pub kernel: PathBuf,
    /// Optional initial ramdisk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<PathBuf>,
    /// CPU and memory requests.
    #[serde(default)]
    pub resources: Resources,
    /// Library parameters passed on the kernel command line.
    #[serde(default)]
    pub kernel_args: Vec<KernelArg>,
    /// Arguments for the guest application.
    #[serde(default)]
    pub application_args: Vec<String>,
    /// Use software emulation instead of hardware acceleration.
    #[serde(default)]
    pub emulation: bool,
    /// Attached network interfaces.
    #[serde(default)]
    pub networks: Vec<MachineNetwork>,
    /// Attached volumes.
    #[serde(default)]
    pub volumes: Vec<MachineVolume>,
    /// Port mappings.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

// ============================================================================
// Status
// ============================================================================

/// Backend-native configuration, one variant per backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum PlatformConfig {
    /// Full-system emulator.
    Qemu(QemuConfig),
    /// Minimal VM monitor.
    Firecracker(FirecrackerConfig),
}

impl PlatformConfig {
    /// Name of the backend that produced this configuration.
    pub fn driver(&self) -> &'static str {
        match self {
            Self::Qemu(_) => qemu::DRIVER_NAME,
            Self::Firecracker(_) => firecracker::DRIVER_NAME,
        }
    }
}

/// Observed machine status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MachineStatus {
    /// Lifecycle state.
    pub state: MachineState,
    /// Hypervisor process id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Per-machine scratch directory.
    #[serde(default)]
    pub state_dir: PathBuf,
    /// Guest console log.
    #[serde(default)]
    pub log_file: PathBuf,
    /// Resolved kernel path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_path: Option<PathBuf>,
    /// Resolved initrd path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<PathBuf>,
    /// Backend-native configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_config: Option<PlatformConfig>,
    /// When the guest last started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the guest last exited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    /// Exit code of the last run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// A guest instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    /// Unique identifier, immutable once assigned.
    pub uid: String,
    /// Human-readable name.
    pub name: String,
    /// Desired configuration.
    pub spec: MachineSpec,
    /// Observed status.
    #[serde(default)]
    pub status: MachineStatus,
}

impl Machine {
    /// Create a machine with a fresh UID.
    ///
    /// An empty name is derived from the UID.
    pub fn new(name: impl Into<String>, spec: MachineSpec) -> Self {
        let uid = uuid::Uuid::new_v4().to_string();
        let mut name = name.into();
        if name.is_empty() {
            name = format!("unikvm-{}", &uid[..8]);
        }
        Self {
            uid,
            name,
            spec,
            status: MachineStatus::default(),
        }
    }

    /// Reference to an existing machine by UID only.
    ///
    /// Backends fill in the rest from the store.
    pub fn reference(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: String::new(),
            spec: MachineSpec::default(),
            status: MachineStatus::default(),
        }
    }

    /// Name of the backend owning this machine, if known.
    pub fn driver(&self) -> Option<&'static str> {
        self.status.platform_config.as_ref().map(PlatformConfig::driver)
    }

    /// Memory request, if set.
    pub fn memory(&self) -> Option<Quantity> {
        self.spec.resources.memory
    }

    /// Whether this machine references the given network interface.
    pub fn uses_interface(&self, network: &str, interface_uid: &str) -> bool {
        self.spec.networks.iter().any(|n| {
            n.network == network && n.interface.uid.as_deref() == Some(interface_uid)
        })
    }

    /// Whether this machine references the given volume.
    pub fn uses_volume(&self, volume: &str) -> bool {
        self.spec.volumes.iter().any(|v| v.volume == volume)
    }
}
