//! CLI command implementations.

pub mod machine;
pub mod parsers;

use std::io::Write;
use std::sync::Arc;
use unikvm::volume::{self, VolumeService};
use unikvm::{
    Attach, BridgeService, Error, HostConfig, Machine, MachineIterator, MachineService, Registry, Store,
    Teardown,
};

// ============================================================================
// Display Constants
// ============================================================================

/// Display width for machine UIDs (first 12 characters).
pub const MACHINE_ID_WIDTH: usize = 12;

/// Display width for machine names.
pub const NAME_WIDTH: usize = 20;

/// Display width for application arguments.
pub const ARGS_WIDTH: usize = 28;

// ============================================================================
// Display Helpers
// ============================================================================

/// Truncate a string to max length, adding "..." if needed.
///
/// If the string fits within `max` characters, returns it unchanged.
/// Otherwise, truncates to `max - 3` characters and appends "...".
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else if max <= 3 {
        "...".to_string()
    } else {
        let head: String = s.chars().take(max - 3).collect();
        format!("{}...", head)
    }
}

/// Truncate a machine UID for display (first 12 characters).
pub fn truncate_id(id: &str) -> &str {
    match id.char_indices().nth(MACHINE_ID_WIDTH) {
        Some((i, _)) => &id[..i],
        None => id,
    }
}

/// Format an optional PID as a suffix string.
///
/// Returns " (PID: N)" if pid is Some, or empty string if None.
pub fn format_pid_suffix(pid: Option<i32>) -> String {
    pid.map(|p| format!(" (PID: {})", p)).unwrap_or_default()
}

/// Flush stdout and stderr, ignoring errors.
///
/// Used to ensure output is visible before blocking operations.
pub fn flush_output() {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}

// ============================================================================
// Process Context
// ============================================================================

/// Everything a command needs, built once per invocation.
pub struct Context {
    pub config: Arc<HostConfig>,
    pub store: Store,
    pub registry: Registry,
    pub machines: Arc<MachineIterator>,
}

impl Context {
    /// Resolve configuration, open the store and build the backends this
    /// host supports.
    pub fn load() -> unikvm::Result<Self> {
        let mut config = HostConfig::from_env();
        let store = config.open_store()?;
        config.load_defaults(&store)?;
        let config = Arc::new(config);

        let registry = Registry::with_host_defaults();
        let machines = Arc::new(MachineIterator::from_registry(&registry, &config, &store)?);
        tracing::debug!(drivers = ?machines.names(), "backends loaded");

        Ok(Self {
            config,
            store,
            registry,
            machines,
        })
    }

    /// Look up a machine by UID or name and refresh its status.
    pub async fn resolve(&self, id: &str) -> unikvm::Result<Machine> {
        let record = self
            .store
            .find_machine(id)?
            .ok_or_else(|| Error::machine_not_found(id))?;
        let mut machine = Machine::reference(record.uid);
        self.machines.get(&mut machine).await?;
        Ok(machine)
    }

    fn volume_services(&self) -> unikvm::Result<Vec<Arc<dyn VolumeService>>> {
        volume::DRIVERS
            .iter()
            .map(|d| volume::service_for(d, &self.config, &self.store))
            .collect()
    }

    /// Attachment over every volume driver and the host bridge service.
    pub fn attach(&self) -> unikvm::Result<Attach> {
        Ok(Attach::new(
            Arc::new(BridgeService::host(self.store.clone())),
            self.volume_services()?,
        ))
    }

    /// Removal over every volume driver and the host bridge service.
    pub fn teardown(&self) -> unikvm::Result<Teardown> {
        Ok(Teardown::new(
            self.machines.clone(),
            Arc::new(BridgeService::host(self.store.clone())),
            self.volume_services()?,
        ))
    }
}
