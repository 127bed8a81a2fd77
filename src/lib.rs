//! unikvm - host-side control plane for unikernel virtual machines
//!
//! unikvm creates, starts, stops, observes and tears down unikernel guests
//! across several hypervisor backends, and manages the bridge networks and
//! shared volumes those guests use.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  unikvm CLI / Library                           │
//! ├─────────────────────────────────────────────────┤
//! │  MachineIterator  ·  Attach  ·  Teardown        │
//! ├─────────────────────────────────────────────────┤
//! │  MachineService (qemu, firecracker, ...)        │
//! │  NetworkService (bridge)  VolumeService (9p)    │
//! ├─────────────────────────────────────────────────┤
//! │  Store (redb)  ·  process  ·  watch             │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use unikvm::{HostConfig, Machine, MachineIterator, MachineService, MachineSpec, Registry};
//!
//! # async fn run() -> unikvm::Result<()> {
//! let config = Arc::new(HostConfig::from_env());
//! let store = config.open_store()?;
//! let machines = MachineIterator::from_registry(&Registry::with_host_defaults(), &config, &store)?;
//!
//! let mut machine = Machine::new("hello", MachineSpec {
//!     kernel: "/path/to/hello_qemu-x86_64".into(),
//!     ..Default::default()
//! });
//! machines.create(&mut machine).await?;
//! machines.start(&mut machine).await?;
//! println!("{} is {}", machine.name, machine.status.state);
//! # Ok(())
//! # }
//! ```
//!
//! # Backends
//!
//! | Backend | Control channel | Hosts |
//! |---------|-----------------|-------|
//! | qemu | QMP over Unix sockets | Linux, macOS |
//! | firecracker | HTTP API over a Unix socket | Linux |

#![warn(clippy::all)]

pub mod attach;
pub mod config;
pub mod error;
pub mod log_rotation;
pub mod machine;
pub mod network;
pub mod process;
pub mod store;
pub mod teardown;
pub mod volume;
pub mod watch;

// Re-export main types for convenience
pub use attach::{Attach, Attached};
pub use config::HostConfig;
pub use error::{Error, Result};
pub use machine::{
    Architecture, KConfig, KernelArg, LogOptions, Machine, MachineIterator, MachineService,
    MachineSpec, MachineState, Quantity, Registry, Strategy, WatchOptions,
};
pub use network::{BridgeService, Network, NetworkService};
pub use store::Store;
pub use teardown::Teardown;
pub use volume::{Volume, VolumeService, VolumeState};
pub use watch::{Subscription, WatchGroup};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
