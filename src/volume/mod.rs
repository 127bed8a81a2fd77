//! Volumes shared from the host into guests.
//!
//! A volume is a host directory handed to the hypervisor at launch time.
//! There is no native object to query, so the store record is the volume.
//! Drivers differ only in how they prepare the source path.

pub mod hostpath;
pub mod ninepfs;

use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::store::Store;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub use hostpath::HostPathService;
pub use ninepfs::NinePfsService;

/// Volume lifecycle state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    /// Not attached to any machine.
    #[default]
    Pending,
    /// Attached to at least one machine.
    Bound,
    /// Source path disappeared.
    Lost,
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Bound => f.write_str("bound"),
            Self::Lost => f.write_str("lost"),
        }
    }
}

/// A host directory exposed to guests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub uid: String,
    pub name: String,
    pub driver: String,
    /// Host path. Empty asks the driver to allocate a managed directory.
    #[serde(default)]
    pub source: PathBuf,
    /// Mount point inside the guest.
    #[serde(default)]
    pub destination: PathBuf,
    /// The source directory is owned by this volume and removed with it.
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub state: VolumeState,
}

impl Volume {
    /// A volume of `driver`. An empty `source` is allocated on create.
    pub fn new(name: impl Into<String>, driver: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            source: source.into(),
            ..Default::default()
        }
    }

    /// Reference to an existing volume by name.
    pub fn reference(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Lifecycle of volumes of one driver.
#[async_trait]
pub trait VolumeService: Send + Sync {
    /// Driver name.
    fn name(&self) -> &str;

    /// Validate and prepare the source, then persist the volume.
    async fn create(&self, volume: &mut Volume) -> Result<()>;

    /// Persist changed attributes of an existing volume.
    async fn update(&self, volume: &mut Volume) -> Result<()>;

    /// Remove the volume. Refuses while bound; removes managed sources.
    async fn delete(&self, volume: &mut Volume) -> Result<()>;

    /// Load the stored volume.
    async fn get(&self, volume: &mut Volume) -> Result<()>;

    /// Every volume of this driver.
    async fn list(&self) -> Result<Vec<Volume>>;
}

/// Driver names known to [`service_for`].
pub const DRIVERS: &[&str] = &[ninepfs::DRIVER_NAME, hostpath::DRIVER_NAME];

/// Build the service for a driver.
pub fn service_for(
    driver: &str,
    config: &Arc<HostConfig>,
    store: &Store,
) -> Result<Arc<dyn VolumeService>> {
    match driver {
        ninepfs::DRIVER_NAME => Ok(Arc::new(NinePfsService::new(config.clone(), store.clone()))),
        hostpath::DRIVER_NAME => Ok(Arc::new(HostPathService::new(store.clone()))),
        other => Err(Error::DriverNotFound(other.to_string())),
    }
}

// ============================================================================
// Shared record handling
// ============================================================================

/// Check the record is new, assign its UID and driver.
fn admit(store: &Store, driver: &str, volume: &mut Volume) -> Result<()> {
    if volume.name.is_empty() {
        return Err(Error::invalid_config("volume name is required"));
    }
    if store.lookup_volume(&volume.name)?.is_some() {
        return Err(Error::invalid_config(format!(
            "volume {} already exists",
            volume.name
        )));
    }
    if volume.uid.is_empty() {
        volume.uid = uuid::Uuid::new_v4().to_string();
    }
    volume.driver = driver.to_string();
    Ok(())
}

fn load(store: &Store, driver: &str, name: &str) -> Result<Volume> {
    let volume = store
        .lookup_volume(name)?
        .ok_or_else(|| Error::VolumeNotFound(name.to_string()))?;
    if volume.driver != driver {
        return Err(Error::WrongPlatform {
            expected: driver.to_string(),
            actual: volume.driver,
        });
    }
    Ok(volume)
}

fn update_record(store: &Store, driver: &str, volume: &mut Volume) -> Result<()> {
    let stored = load(store, driver, &volume.name)?;
    volume.uid = stored.uid;
    volume.driver = stored.driver;
    volume.managed = stored.managed;
    if volume.source.as_os_str().is_empty() {
        volume.source = stored.source;
    }
    store.save_volume(volume)
}

fn get_record(store: &Store, driver: &str, volume: &mut Volume) -> Result<()> {
    let mut stored = load(store, driver, &volume.name)?;
    if stored.state == VolumeState::Bound && !stored.source.exists() {
        tracing::warn!(volume = %stored.name, source = %stored.source.display(), "volume source is gone");
        stored.state = VolumeState::Lost;
    }
    *volume = stored;
    Ok(())
}

fn delete_record(store: &Store, driver: &str, volume: &mut Volume) -> Result<()> {
    let stored = match load(store, driver, &volume.name) {
        Ok(v) => v,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    if stored.state == VolumeState::Bound {
        return Err(Error::VolumeBound(stored.name));
    }
    if stored.managed {
        match std::fs::remove_dir_all(&stored.source) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::volume("delete", e.to_string())),
        }
    }
    store.remove_volume(&stored.name)?;
    *volume = stored;
    tracing::info!(volume = %volume.name, "volume deleted");
    Ok(())
}

fn list_records(store: &Store, driver: &str) -> Result<Vec<Volume>> {
    Ok(store
        .list_volumes()?
        .into_iter()
        .filter(|v| v.driver == driver)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_service_for() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(HostConfig::with_root(dir.path()));
        let store = config.open_store().unwrap();

        for driver in DRIVERS {
            assert_eq!(service_for(driver, &config, &store).unwrap().name(), *driver);
        }
        assert!(matches!(
            service_for("nfs", &config, &store),
            Err(Error::DriverNotFound(_))
        ));
    }
}
