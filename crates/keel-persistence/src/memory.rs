//! In-memory configuration store, for tests and throwaway servers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::StoreError;
use crate::store::{normalize_payload, validate_name, ClusterSummary, ConfigStore};
use crate::version::ConfigVersion;

/// A [`ConfigStore`] that keeps only the committed version of each
/// cluster and forgets everything on drop.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    clusters: Mutex<BTreeMap<u32, Arc<ConfigVersion>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs version 1 of a cluster, replacing anything already there.
    pub fn insert(&self, cluster_id: u32, name: &str, payload: Bytes) -> Result<(), StoreError> {
        validate_name(name)?;
        let payload = normalize_payload(payload)?;
        let version = ConfigVersion::new(cluster_id, 1, name, payload);
        self.lock().insert(cluster_id, Arc::new(version));
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, Arc<ConfigVersion>>> {
        self.clusters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_configuration(&self, cluster_id: u32) -> Result<Arc<ConfigVersion>, StoreError> {
        self.lock()
            .get(&cluster_id)
            .cloned()
            .ok_or(StoreError::NotFound(cluster_id))
    }

    fn commit_update(&self, cluster_id: u32, payload: Bytes) -> Result<u32, StoreError> {
        let payload = normalize_payload(payload)?;
        let mut clusters = self.lock();
        let current = clusters
            .get(&cluster_id)
            .ok_or(StoreError::NotFound(cluster_id))?;
        let next = current
            .version
            .checked_add(1)
            .ok_or(StoreError::VersionOverflow(cluster_id))?;
        let version = ConfigVersion::new(cluster_id, next, current.name.clone(), payload);
        clusters.insert(cluster_id, Arc::new(version));
        Ok(next)
    }

    fn clusters(&self) -> Vec<ClusterSummary> {
        self.lock()
            .values()
            .map(|v| ClusterSummary {
                cluster_id: v.cluster_id,
                name: v.name.clone(),
                version: v.version,
                available: true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_and_read() {
        let store = MemoryConfigStore::new();
        store.insert(2, "beta", Bytes::from_static(b"a=1\n")).unwrap();
        assert_eq!(store.commit_update(2, Bytes::from_static(b"a=2\n")).unwrap(), 2);

        let current = store.get_configuration(2).unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.name, "beta");
        assert_eq!(&current.payload[..], b"a=2\n");
    }

    #[test]
    fn unknown_cluster() {
        let store = MemoryConfigStore::new();
        assert!(matches!(
            store.commit_update(1, Bytes::new()),
            Err(StoreError::NotFound(1))
        ));
        assert!(store.clusters().is_empty());
    }

    #[test]
    fn listing_is_ordered() {
        let store = MemoryConfigStore::new();
        store.insert(9, "z", Bytes::new()).unwrap();
        store.insert(3, "c", Bytes::new()).unwrap();
        let ids: Vec<u32> = store.clusters().iter().map(|c| c.cluster_id).collect();
        assert_eq!(ids, vec![3, 9]);
    }
}
