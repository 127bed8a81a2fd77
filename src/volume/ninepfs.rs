//! 9p pass-through volumes.
//!
//! The source is a directory the hypervisor exports read/write over
//! virtio-9p. Without a source, a managed directory is allocated under the
//! host's volumes directory.

use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::volume::{self, Volume, VolumeService};
use async_trait::async_trait;
use std::sync::Arc;

/// Driver name.
pub const DRIVER_NAME: &str = "9pfs";

/// 9p volume driver.
#[derive(Debug, Clone)]
pub struct NinePfsService {
    config: Arc<HostConfig>,
    store: Store,
}

impl NinePfsService {
    pub fn new(config: Arc<HostConfig>, store: Store) -> Self {
        Self { config, store }
    }
}

#[async_trait]
impl VolumeService for NinePfsService {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn create(&self, volume: &mut Volume) -> Result<()> {
        volume::admit(&self.store, DRIVER_NAME, volume)?;

        if volume.source.as_os_str().is_empty() {
            volume.source = self.config.volumes_dir.join(&volume.uid);
            volume.managed = true;
        } else if volume.source.is_relative() {
            return Err(Error::invalid_config(format!(
                "volume source must be absolute: {}",
                volume.source.display()
            )));
        }
        std::fs::create_dir_all(&volume.source)
            .map_err(|e| Error::volume("create", format!("{}: {}", volume.source.display(), e)))?;
        volume.source = volume.source.canonicalize()?;

        if let Err(e) = self.store.save_volume(volume) {
            if volume.managed {
                let _ = std::fs::remove_dir_all(&volume.source);
            }
            return Err(e);
        }
        tracing::info!(volume = %volume.name, source = %volume.source.display(), managed = volume.managed, "volume created");
        Ok(())
    }

    async fn update(&self, volume: &mut Volume) -> Result<()> {
        volume::update_record(&self.store, DRIVER_NAME, volume)
    }

    async fn delete(&self, volume: &mut Volume) -> Result<()> {
        volume::delete_record(&self.store, DRIVER_NAME, volume)
    }

    async fn get(&self, volume: &mut Volume) -> Result<()> {
        volume::get_record(&self.store, DRIVER_NAME, volume)
    }

    async fn list(&self) -> Result<Vec<Volume>> {
        volume::list_records(&self.store, DRIVER_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeState;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> NinePfsService {
        let config = Arc::new(HostConfig::with_root(dir.path()));
        let store = config.open_store().unwrap();
        NinePfsService::new(config, store)
    }

    async fn set_state(svc: &NinePfsService, name: &str, state: VolumeState) {
        let mut vol = Volume::reference(name);
        svc.get(&mut vol).await.unwrap();
        vol.state = state;
        svc.update(&mut vol).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_allocates_managed_dir() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);

        let mut vol = Volume::new("data", "", "");
        svc.create(&mut vol).await.unwrap();
        assert!(vol.managed);
        assert_eq!(vol.driver, DRIVER_NAME);
        assert!(vol.source.is_dir());
        assert!(vol.source.ends_with(&vol.uid));

        let mut fetched = Volume::reference("data");
        svc.get(&mut fetched).await.unwrap();
        assert_eq!(fetched, vol);
    }

    #[tokio::test]
    async fn test_create_with_source_is_unmanaged() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let src = dir.path().join("shared");

        let mut vol = Volume::new("shared", "", &src);
        svc.create(&mut vol).await.unwrap();
        assert!(!vol.managed);
        assert!(src.is_dir());

        svc.delete(&mut vol).await.unwrap();
        assert!(src.is_dir());
        assert!(svc.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_relative_and_duplicate() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);

        let mut rel = Volume::new("rel", "", "relative/path");
        assert!(matches!(svc.create(&mut rel).await, Err(Error::InvalidConfig(_))));

        svc.create(&mut Volume::new("data", "", "")).await.unwrap();
        assert!(matches!(
            svc.create(&mut Volume::new("data", "", "")).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_guards_bound_volume() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let mut vol = Volume::new("data", "", "");
        svc.create(&mut vol).await.unwrap();
        std::fs::write(vol.source.join("keep"), b"x").unwrap();

        set_state(&svc, "data", VolumeState::Bound).await;
        assert!(matches!(svc.delete(&mut vol).await, Err(Error::VolumeBound(_))));
        assert!(vol.source.join("keep").exists());

        set_state(&svc, "data", VolumeState::Pending).await;
        svc.delete(&mut vol).await.unwrap();
        assert!(!vol.source.exists());

        // Already gone.
        svc.delete(&mut Volume::reference("data")).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_marks_lost_source() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let mut vol = Volume::new("data", "", "");
        svc.create(&mut vol).await.unwrap();
        set_state(&svc, "data", VolumeState::Bound).await;
        std::fs::remove_dir_all(&vol.source).unwrap();

        let mut fetched = Volume::reference("data");
        svc.get(&mut fetched).await.unwrap();
        assert_eq!(fetched.state, VolumeState::Lost);
    }

    #[tokio::test]
    async fn test_update_keeps_identity() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let mut vol = Volume::new("data", "", "");
        svc.create(&mut vol).await.unwrap();

        let mut changed = Volume::reference("data");
        changed.read_only = true;
        changed.destination = "/data".into();
        svc.update(&mut changed).await.unwrap();
        assert_eq!(changed.uid, vol.uid);
        assert_eq!(changed.source, vol.source);
        assert!(changed.managed);
        assert!(changed.read_only);

        assert!(svc
            .update(&mut Volume::reference("missing"))
            .await
            .unwrap_err()
            .is_not_found());
    }
}
