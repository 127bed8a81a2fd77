//! Persistent state store.
//!
//! ACID storage backed by redb. Several CLI invocations may touch the
//! store at once, so the database is never held open between operations:
//! each logical operation opens it, retries while another process holds
//! the file lock (bounded by the configured window), runs one transaction
//! and drops the handle again.
//!
//! Records are JSON so that driver-specific payloads stay opaque to the
//! store itself.

use crate::error::{Error, Result};
use crate::machine::{Machine, MachineState, PlatformConfig};
use crate::network::Network;
use crate::volume::Volume;
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Machine spec + status, keyed by UID.
const MACHINES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("machines");

/// Last observed machine state, keyed by UID.
const STATES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("states");

/// Backend-native driver configuration, keyed by UID.
const DRIVER_CONFIGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("driver_configs");

/// Networks, keyed by name.
const NETWORKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("networks");

/// Volumes, keyed by name.
const VOLUMES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("volumes");

/// Global configuration settings.
const CONFIG_TABLE: TableDefinition<&str, &str> = TableDefinition::new("config");

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Sleep between open attempts while the database is locked.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Handle to the state store. Cheap to clone; holds no open file.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    lock_timeout: Duration,
}

impl Store {
    /// Open (creating if needed) the store at `path`.
    ///
    /// Creates parent directories and all tables up front so that read
    /// transactions never see a missing table.
    pub fn open_at(path: &Path, lock_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::database("create directory", e))?;
        }

        let store = Self {
            path: path.to_path_buf(),
            lock_timeout,
        };
        store.init_tables()?;
        Ok(store)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the database, retrying while another handle holds the lock.
    fn open_db(&self) -> Result<Database> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(DatabaseError::DatabaseAlreadyOpen) => {
                    return Err(Error::Timeout {
                        operation: format!("lock database {}", self.path.display()),
                        duration: self.lock_timeout,
                    });
                }
                Err(e) => return Err(Error::database("open", e)),
            }
        }
    }

    fn init_tables(&self) -> Result<()> {
        let db = self.open_db()?;
        let txn = db
            .begin_write()
            .map_err(|e| Error::database("begin write", e))?;
        for table in [
            MACHINES_TABLE,
            STATES_TABLE,
            DRIVER_CONFIGS_TABLE,
            NETWORKS_TABLE,
            VOLUMES_TABLE,
        ] {
            txn.open_table(table)
                .map_err(|e| Error::database("create table", e))?;
        }
        txn.open_table(CONFIG_TABLE)
            .map_err(|e| Error::database("create table", e))?;
        txn.commit().map_err(|e| Error::database("commit", e))?;
        Ok(())
    }

    // ========================================================================
    // Generic JSON record helpers
    // ========================================================================

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_vec(value)?;
        let db = self.open_db()?;
        let txn = db
            .begin_write()
            .map_err(|e| Error::database("begin write", e))?;
        {
            let mut t = txn
                .open_table(table)
                .map_err(|e| Error::database("open table", e))?;
            t.insert(key, json.as_slice())
                .map_err(|e| Error::database(format!("insert '{}'", key), e))?;
        }
        txn.commit().map_err(|e| Error::database("commit", e))?;
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> Result<Option<T>> {
        let db = self.open_db()?;
        let txn = db
            .begin_read()
            .map_err(|e| Error::database("begin read", e))?;
        let t = txn
            .open_table(table)
            .map_err(|e| Error::database("open table", e))?;
        let guard = t
            .get(key)
            .map_err(|e| Error::database(format!("get '{}'", key), e))?;
        match guard {
            Some(g) => Ok(Some(serde_json::from_slice(g.value())?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, table: JsonTable) -> Result<Vec<T>> {
        let db = self.open_db()?;
        let txn = db
            .begin_read()
            .map_err(|e| Error::database("begin read", e))?;
        let t = txn
            .open_table(table)
            .map_err(|e| Error::database("open table", e))?;

        let mut out = Vec::new();
        for entry in t.iter().map_err(|e| Error::database("iterate", e))? {
            let (_, value) = entry.map_err(|e| Error::database("read entry", e))?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    fn remove_keys(&self, tables: &[JsonTable], key: &str) -> Result<bool> {
        let db = self.open_db()?;
        let txn = db
            .begin_write()
            .map_err(|e| Error::database("begin write", e))?;
        let mut removed = false;
        for table in tables {
            let mut t = txn
                .open_table(*table)
                .map_err(|e| Error::database("open table", e))?;
            removed |= t
                .remove(key)
                .map_err(|e| Error::database(format!("remove '{}'", key), e))?
                .is_some();
        }
        txn.commit().map_err(|e| Error::database("commit", e))?;
        Ok(removed)
    }

    // ========================================================================
    // Machine records
    // ========================================================================

    /// Insert or replace a machine record.
    pub fn save_machine(&self, machine: &Machine) -> Result<()> {
        self.put(MACHINES_TABLE, &machine.uid, machine)
    }

    /// Look up a machine record by UID.
    pub fn lookup_machine(&self, uid: &str) -> Result<Option<Machine>> {
        self.fetch(MACHINES_TABLE, uid)
    }

    /// Look up a machine by UID, falling back to its name.
    pub fn find_machine(&self, uid_or_name: &str) -> Result<Option<Machine>> {
        if let Some(m) = self.lookup_machine(uid_or_name)? {
            return Ok(Some(m));
        }
        Ok(self
            .list_machines()?
            .into_iter()
            .find(|m| m.name == uid_or_name))
    }

    /// All machine records.
    pub fn list_machines(&self) -> Result<Vec<Machine>> {
        self.scan(MACHINES_TABLE)
    }

    /// Record the last observed state of a machine.
    pub fn save_state(&self, uid: &str, state: MachineState) -> Result<()> {
        self.put(STATES_TABLE, uid, &state)
    }

    /// Last observed state of a machine.
    pub fn lookup_state(&self, uid: &str) -> Result<Option<MachineState>> {
        self.fetch(STATES_TABLE, uid)
    }

    /// Store the backend-native configuration of a machine.
    pub fn save_driver_config(&self, uid: &str, config: &PlatformConfig) -> Result<()> {
        self.put(DRIVER_CONFIGS_TABLE, uid, config)
    }

    /// Backend-native configuration of a machine.
    pub fn lookup_driver_config(&self, uid: &str) -> Result<Option<PlatformConfig>> {
        self.fetch(DRIVER_CONFIGS_TABLE, uid)
    }

    /// Remove every record kept for a machine.
    ///
    /// Absent records are not an error. Returns whether anything was removed.
    pub fn purge(&self, uid: &str) -> Result<bool> {
        self.remove_keys(&[MACHINES_TABLE, STATES_TABLE, DRIVER_CONFIGS_TABLE], uid)
    }

    // ========================================================================
    // Network and volume records
    // ========================================================================

    /// Insert or replace a network record.
    pub fn save_network(&self, network: &Network) -> Result<()> {
        self.put(NETWORKS_TABLE, &network.name, network)
    }

    /// Look up a network by name.
    pub fn lookup_network(&self, name: &str) -> Result<Option<Network>> {
        self.fetch(NETWORKS_TABLE, name)
    }

    /// All network records.
    pub fn list_networks(&self) -> Result<Vec<Network>> {
        self.scan(NETWORKS_TABLE)
    }

    /// Remove a network record.
    pub fn remove_network(&self, name: &str) -> Result<bool> {
        self.remove_keys(&[NETWORKS_TABLE], name)
    }

    /// Insert or replace a volume record.
    pub fn save_volume(&self, volume: &Volume) -> Result<()> {
        self.put(VOLUMES_TABLE, &volume.name, volume)
    }

    /// Look up a volume by name.
    pub fn lookup_volume(&self, name: &str) -> Result<Option<Volume>> {
        self.fetch(VOLUMES_TABLE, name)
    }

    /// All volume records.
    pub fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.scan(VOLUMES_TABLE)
    }

    /// Remove a volume record.
    pub fn remove_volume(&self, name: &str) -> Result<bool> {
        self.remove_keys(&[VOLUMES_TABLE], name)
    }

    // ========================================================================
    // Global Config Operations
    // ========================================================================

    /// Get a global configuration value.
    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let db = self.open_db()?;
        let txn = db
            .begin_read()
            .map_err(|e| Error::database("begin read", e))?;
        let table = txn
            .open_table(CONFIG_TABLE)
            .map_err(|e| Error::database("open config table", e))?;
        match table.get(key) {
            Ok(Some(guard)) => Ok(Some(guard.value().to_string())),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::database(format!("get config '{}'", key), e)),
        }
    }

    /// Set a global configuration value.
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let db = self.open_db()?;
        let txn = db
            .begin_write()
            .map_err(|e| Error::database("begin write", e))?;
        {
            let mut table = txn
                .open_table(CONFIG_TABLE)
                .map_err(|e| Error::database("open config table", e))?;
            table
                .insert(key, value)
                .map_err(|e| Error::database(format!("set config '{}'", key), e))?;
        }
        txn.commit().map_err(|e| Error::database("commit", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::firecracker::FirecrackerConfig;
    use crate::machine::qemu::QemuConfig;
    use crate::machine::MachineSpec;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(&dir.path().join("test.redb"), Duration::from_secs(5)).unwrap();
        (dir, store)
    }

    fn machine(name: &str) -> Machine {
        Machine::new(name, MachineSpec::default())
    }

    #[test]
    fn test_machine_crud() {
        let (_dir, store) = temp_store();
        let mut m = machine("hello");
        store.save_machine(&m).unwrap();

        let loaded = store.lookup_machine(&m.uid).unwrap().unwrap();
        assert_eq!(loaded.uid, m.uid);
        assert_eq!(loaded.name, "hello");

        m.status.state = MachineState::Running;
        m.status.pid = Some(4242);
        store.save_machine(&m).unwrap();
        let loaded = store.lookup_machine(&m.uid).unwrap().unwrap();
        assert_eq!(loaded.status.state, MachineState::Running);
        assert_eq!(loaded.status.pid, Some(4242));

        assert_eq!(store.list_machines().unwrap().len(), 1);
        assert_eq!(store.find_machine("hello").unwrap().unwrap().uid, m.uid);

        assert!(store.purge(&m.uid).unwrap());
        assert!(store.lookup_machine(&m.uid).unwrap().is_none());
    }

    #[test]
    fn test_purge_absent_is_not_an_error() {
        let (_dir, store) = temp_store();
        assert!(!store.purge("nonexistent").unwrap());
    }

    #[test]
    fn test_purge_removes_all_record_kinds() {
        let (_dir, store) = temp_store();
        let m = machine("vm");
        store.save_machine(&m).unwrap();
        store.save_state(&m.uid, MachineState::Exited).unwrap();
        store
            .save_driver_config(&m.uid, &PlatformConfig::Qemu(QemuConfig::default()))
            .unwrap();

        store.purge(&m.uid).unwrap();
        assert!(store.lookup_machine(&m.uid).unwrap().is_none());
        assert!(store.lookup_state(&m.uid).unwrap().is_none());
        assert!(store.lookup_driver_config(&m.uid).unwrap().is_none());
    }

    #[test]
    fn test_driver_config_keeps_variant() {
        let (_dir, store) = temp_store();
        let config = PlatformConfig::Firecracker(FirecrackerConfig {
            api_socket: PathBuf::from("/run/fc.sock"),
            ..Default::default()
        });
        store.save_driver_config("uid-1", &config).unwrap();

        match store.lookup_driver_config("uid-1").unwrap().unwrap() {
            PlatformConfig::Firecracker(fc) => {
                assert_eq!(fc.api_socket, PathBuf::from("/run/fc.sock"))
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_state_round_trip() {
        let (_dir, store) = temp_store();
        assert!(store.lookup_state("uid").unwrap().is_none());
        store.save_state("uid", MachineState::Paused).unwrap();
        assert_eq!(store.lookup_state("uid").unwrap(), Some(MachineState::Paused));
    }

    #[test]
    fn test_concurrent_access() {
        let (_dir, store) = temp_store();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.save_machine(&machine(&format!("vm-{}", i))).unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.list_machines().unwrap().len(), 8);
    }

    #[test]
    fn test_config_settings() {
        let (_dir, store) = temp_store();
        store.set_config("test_key", "test_value").unwrap();
        assert_eq!(store.get_config("test_key").unwrap().unwrap(), "test_value");
        assert!(store.get_config("nonexistent").unwrap().is_none());
    }
}
