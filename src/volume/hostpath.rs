//! Volumes over an existing host path.
//!
//! The driver only records the path. It never creates or removes it.

use crate::error::{Error, Result};
use crate::store::Store;
use crate::volume::{self, Volume, VolumeService};
use async_trait::async_trait;

/// Driver name.
pub const DRIVER_NAME: &str = "hostpath";

/// Host path volume driver.
#[derive(Debug, Clone)]
pub struct HostPathService {
    store: Store,
}

impl HostPathService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl VolumeService for HostPathService {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn create(&self, volume: &mut Volume) -> Result<()> {
        if volume.source.as_os_str().is_empty() {
            return Err(Error::invalid_config(format!(
                "volume {} needs a source path",
                volume.name
            )));
        }
        volume::admit(&self.store, DRIVER_NAME, volume)?;
        volume.source = volume.source.canonicalize().map_err(|e| {
            Error::volume("create", format!("{}: {}", volume.source.display(), e))
        })?;
        volume.managed = false;
        self.store.save_volume(volume)
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
    use crate::config::HostConfig;
    use crate::volume::ninepfs::NinePfsService;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_requires_existing_source() {
        let dir = TempDir::new().unwrap();
        let svc = HostPathService::new(HostConfig::with_root(dir.path()).open_store().unwrap());

        assert!(matches!(
            svc.create(&mut Volume::new("a", "", "")).await,
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            svc.create(&mut Volume::new("b", "", dir.path().join("missing"))).await,
            Err(Error::Volume { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_leaves_source() {
        let dir = TempDir::new().unwrap();
        let svc = HostPathService::new(HostConfig::with_root(dir.path()).open_store().unwrap());
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();

        let mut vol = Volume::new("src", "", &src);
        svc.create(&mut vol).await.unwrap();
        assert!(!vol.managed);
        svc.delete(&mut vol).await.unwrap();
        assert!(src.is_dir());
    }

    #[tokio::test]
    async fn test_list_filters_by_driver() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(HostConfig::with_root(dir.path()));
        let store = config.open_store().unwrap();
        let host = HostPathService::new(store.clone());
        let ninep = NinePfsService::new(config, store);

        host.create(&mut Volume::new("h", "", dir.path())).await.unwrap();
        ninep.create(&mut Volume::new("n", "", "")).await.unwrap();

        let names: Vec<_> = host.list().await.unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["h"]);
        assert!(matches!(
            host.get(&mut Volume::reference("n")).await,
            Err(Error::WrongPlatform { .. })
        ));
    }
}
