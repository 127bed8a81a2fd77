//! Host configuration.
//!
//! Resolves the directories, timeouts and defaults every service needs.
//! Paths come from platform directories with environment overrides; the
//! default machine resources are additionally persisted in the store's
//! config table so they survive restarts and can be changed at runtime.

use crate::error::Result;
use crate::machine::Quantity;
use crate::store::Store;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default memory for machines that do not request any (64 MiB).
pub const DEFAULT_MEMORY: Quantity = Quantity::mebibytes(64);
/// Default vCPU count for machines that do not request any.
pub const DEFAULT_CPUS: u32 = 1;
/// How long `Stop` waits for the hypervisor process to exit.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a control-socket connect/handshake may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a store operation retries while another process holds the lock.
pub const DEFAULT_LOCK_RETRY_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval for backends without push events.
pub const DEFAULT_WATCH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Environment variable overriding the runtime (state) directory.
pub const ENV_RUNTIME_DIR: &str = "UNIKVM_RUNTIME_DIR";
/// Environment variable overriding the database path.
pub const ENV_DB_PATH: &str = "UNIKVM_DB";
/// Environment variable overriding the QEMU binary prefix.
pub const ENV_QEMU_PREFIX: &str = "UNIKVM_QEMU";
/// Environment variable overriding the Firecracker binary.
pub const ENV_FIRECRACKER_BIN: &str = "UNIKVM_FIRECRACKER";

/// Host-wide configuration shared by all services.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root of per-machine state directories.
    pub runtime_dir: PathBuf,
    /// Path of the redb database.
    pub db_path: PathBuf,
    /// Root for managed volume sources.
    pub volumes_dir: PathBuf,
    /// Graceful stop window.
    pub stop_timeout: Duration,
    /// Control-socket connect/handshake bound.
    pub connect_timeout: Duration,
    /// Lock contention retry window for the store.
    pub lock_retry_timeout: Duration,
    /// Polling interval for watch streams on backends without events.
    pub watch_poll_interval: Duration,
    /// Memory used when a machine does not request any.
    pub default_memory: Quantity,
    /// vCPUs used when a machine does not request any.
    pub default_cpus: u32,
    /// Prefix of the QEMU system emulator binaries (`<prefix>-<arch>`).
    pub qemu_prefix: String,
    /// Firecracker binary.
    pub firecracker_bin: String,
}

impl HostConfig {
    /// Resolve configuration from platform directories and the environment.
    pub fn from_env() -> Self {
        let runtime_dir = std::env::var_os(ENV_RUNTIME_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::runtime_dir()
                    .or_else(dirs::cache_dir)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join("unikvm")
            });

        let data_dir = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("unikvm");

        let db_path = std::env::var_os(ENV_DB_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("unikvm.redb"));

        let mut config = Self::with_root(&runtime_dir);
        config.db_path = db_path;
        config.volumes_dir = data_dir.join("volumes");
        if let Ok(prefix) = std::env::var(ENV_QEMU_PREFIX) {
            config.qemu_prefix = prefix;
        }
        if let Ok(bin) = std::env::var(ENV_FIRECRACKER_BIN) {
            config.firecracker_bin = bin;
        }
        config
    }

    /// Configuration rooted entirely under one directory.
    ///
    /// Used by tests and by callers that want an isolated installation.
    pub fn with_root(root: &Path) -> Self {
        Self {
            runtime_dir: root.join("machines"),
            db_path: root.join("unikvm.redb"),
            volumes_dir: root.join("volumes"),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            lock_retry_timeout: DEFAULT_LOCK_RETRY_TIMEOUT,
            watch_poll_interval: DEFAULT_WATCH_POLL_INTERVAL,
            default_memory: DEFAULT_MEMORY,
            default_cpus: DEFAULT_CPUS,
            qemu_prefix: "qemu-system".to_string(),
            firecracker_bin: "firecracker".to_string(),
        }
    }

    /// Open the store described by this configuration.
    pub fn open_store(&self) -> Result<Store> {
        Store::open_at(&self.db_path, self.lock_retry_timeout)
    }

    /// Overlay the persisted defaults from the store.
    pub fn load_defaults(&mut self, store: &Store) -> Result<()> {
        if let Some(mem) = store.get_config("default_memory")? {
            match mem.parse::<Quantity>() {
                Ok(q) => self.default_memory = q,
                Err(e) => tracing::warn!(value = %mem, error = %e, "ignoring invalid default_memory"),
            }
        }
        if let Some(cpus) = store.get_config("default_cpus")? {
            match cpus.parse::<u32>() {
                Ok(n) if n > 0 => self.default_cpus = n,
                _ => tracing::warn!(value = %cpus, "ignoring invalid default_cpus"),
            }
        }
        Ok(())
    }

    /// Persist the current defaults.
    pub fn save_defaults(&self, store: &Store) -> Result<()> {
        store.set_config("default_memory", &self.default_memory.to_string())?;
        store.set_config("default_cpus", &self.default_cpus.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_with_root_layout() {
        let config = HostConfig::with_root(Path::new("/srv/unikvm"));
        assert_eq!(config.runtime_dir, PathBuf::from("/srv/unikvm/machines"));
        assert_eq!(config.db_path, PathBuf::from("/srv/unikvm/unikvm.redb"));
        assert_eq!(config.default_memory, Quantity::mebibytes(64));
        assert_eq!(config.default_cpus, 1);
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_defaults_round_trip_through_store() {
        let dir = TempDir::new().unwrap();
        let mut config = HostConfig::with_root(dir.path());
        let store = config.open_store().unwrap();

        config.default_memory = Quantity::mebibytes(256);
        config.default_cpus = 2;
        config.save_defaults(&store).unwrap();

        let mut reloaded = HostConfig::with_root(dir.path());
        reloaded.load_defaults(&store).unwrap();
        assert_eq!(reloaded.default_memory, Quantity::mebibytes(256));
        assert_eq!(reloaded.default_cpus, 2);
    }

    #[test]
    fn test_invalid_persisted_defaults_are_ignored() {
        let dir = TempDir::new().unwrap();
        let mut config = HostConfig::with_root(dir.path());
        let store = config.open_store().unwrap();
        store.set_config("default_cpus", "zero").unwrap();
        store.set_config("default_memory", "lots").unwrap();

        config.load_defaults(&store).unwrap();
        assert_eq!(config.default_cpus, DEFAULT_CPUS);
        assert_eq!(config.default_memory, DEFAULT_MEMORY);
    }
}
