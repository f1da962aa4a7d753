//! An in-memory [`CivoApi`] implementation for tests.
//!
//! The fake applies requested state transitions immediately (a created
//! volume is `available`, an attached volume is `attached`), which lets
//! callers exercise their settlement logic without real polling.

use crate::error::ClientError;
use crate::types::*;
use crate::CivoApi;

use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct FakeState {
    volumes: Vec<Volume>,
    snapshots: Vec<VolumeSnapshot>,
    clusters: Vec<KubernetesCluster>,
    last_volume_config: Option<VolumeConfig>,
    ping_fails: bool,
    snapshot_limit: Option<usize>,
    next_id: u64,
}

/// Deterministic stand-in for the Civo API.
#[derive(Debug, Default)]
pub struct FakeClient {
    quota: Mutex<Quota>,
    state: Mutex<FakeState>,
}

impl FakeClient {
    pub fn new() -> Self {
        let fake = FakeClient::default();
        *fake.quota.lock().unwrap() = Quota {
            disk_gigabytes_limit: 100,
            disk_gigabytes_usage: 0,
            disk_volume_count_limit: 10,
            disk_volume_count_usage: 0,
        };
        fake
    }

    /// Replaces the account quota limits. Usage counters are derived
    /// from the stored volumes when the quota is read.
    pub fn set_quota(&self, quota: Quota) {
        *self.quota.lock().unwrap() = quota;
    }

    /// Registers the clusters `get_kubernetes_cluster` will serve.
    pub fn set_clusters(&self, clusters: Vec<KubernetesCluster>) {
        self.state.lock().unwrap().clusters = clusters;
    }

    /// Makes subsequent `ping` calls fail.
    pub fn set_ping_fails(&self, fails: bool) {
        self.state.lock().unwrap().ping_fails = fails;
    }

    /// Caps the number of snapshots before creation reports the quota
    /// sentinel.
    pub fn set_snapshot_limit(&self, limit: usize) {
        self.state.lock().unwrap().snapshot_limit = Some(limit);
    }

    /// Overwrites a stored snapshot's state, e.g. to simulate one that
    /// is still cutting or currently in use.
    pub fn set_snapshot_state(&self, snapshot_id: &str, state: &str) {
        let mut s = self.state.lock().unwrap();
        if let Some(snap) = s.snapshots.iter_mut().find(|s| s.snapshot_id == snapshot_id) {
            snap.state = state.to_string();
        }
    }

    /// The `VolumeConfig` passed to the most recent `create_volume`.
    pub fn last_volume_config(&self) -> Option<VolumeConfig> {
        self.state.lock().unwrap().last_volume_config.clone()
    }

    /// Directly overwrites a volume's status, for simulating transition
    /// states the fake would otherwise skip past.
    pub fn set_volume_status(&self, id: &str, status: VolumeStatus) {
        let mut s = self.state.lock().unwrap();
        if let Some(v) = s.volumes.iter_mut().find(|v| v.id == id) {
            v.status = status;
        }
    }

    fn volume_not_found(id: &str) -> ClientError {
        ClientError::api(
            404,
            "database_volume_not_found",
            format!("volume {} not found", id),
        )
    }

    fn snapshot_not_found(id: &str) -> ClientError {
        ClientError::api(
            404,
            "database_snapshot_not_found",
            format!("snapshot {} not found", id),
        )
    }
}

#[async_trait]
impl CivoApi for FakeClient {
    async fn list_volumes(&self) -> Result<Vec<Volume>, ClientError> {
        Ok(self.state.lock().unwrap().volumes.clone())
    }

    async fn get_volume(&self, id: &str) -> Result<Volume, ClientError> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .iter()
            .find(|v| v.id == id)
            .cloned()
            .ok_or_else(|| Self::volume_not_found(id))
    }

    async fn create_volume(&self, config: &VolumeConfig) -> Result<Volume, ClientError> {
        let mut s = self.state.lock().unwrap();
        s.next_id += 1;
        let volume = Volume {
            id: format!("volume-{}", s.next_id),
            name: config.name.clone(),
            cluster_id: config.cluster_id.clone(),
            namespace: config.namespace.clone(),
            size_gigabytes: config.size_gigabytes,
            status: VolumeStatus::Available,
            instance_id: String::new(),
            region: config.region.clone(),
        };
        s.last_volume_config = Some(config.clone());
        s.volumes.push(volume.clone());
        Ok(volume)
    }

    async fn delete_volume(&self, id: &str) -> Result<(), ClientError> {
        let mut s = self.state.lock().unwrap();
        let before = s.volumes.len();
        s.volumes.retain(|v| v.id != id);
        if s.volumes.len() == before {
            return Err(Self::volume_not_found(id));
        }
        Ok(())
    }

    async fn attach_volume(
        &self,
        id: &str,
        config: &VolumeAttachConfig,
    ) -> Result<(), ClientError> {
        let mut s = self.state.lock().unwrap();
        let volume = s
            .volumes
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| Self::volume_not_found(id))?;
        volume.instance_id = config.instance_id.clone();
        volume.status = VolumeStatus::Attached;
        Ok(())
    }

    async fn detach_volume(&self, id: &str) -> Result<(), ClientError> {
        let mut s = self.state.lock().unwrap();
        let volume = s
            .volumes
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| Self::volume_not_found(id))?;
        volume.instance_id = String::new();
        volume.status = VolumeStatus::Available;
        Ok(())
    }

    async fn resize_volume(&self, id: &str, size_gigabytes: i64) -> Result<(), ClientError> {
        let mut s = self.state.lock().unwrap();
        let volume = s
            .volumes
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| Self::volume_not_found(id))?;
        volume.size_gigabytes = size_gigabytes;
        volume.status = VolumeStatus::Available;
        Ok(())
    }

    async fn get_quota(&self) -> Result<Quota, ClientError> {
        let mut quota = *self.quota.lock().unwrap();
        let s = self.state.lock().unwrap();
        quota.disk_gigabytes_usage = s.volumes.iter().map(|v| v.size_gigabytes).sum();
        quota.disk_volume_count_usage = s.volumes.len() as i64;
        Ok(quota)
    }

    async fn ping(&self) -> Result<(), ClientError> {
        if self.state.lock().unwrap().ping_fails {
            return Err(ClientError::api(503, "service_unavailable", "ping failed"));
        }
        Ok(())
    }

    async fn get_kubernetes_cluster(
        &self,
        id: &str,
    ) -> Result<KubernetesCluster, ClientError> {
        self.state
            .lock()
            .unwrap()
            .clusters
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| {
                ClientError::api(404, "zero_matches", format!("cluster {} not found", id))
            })
    }

    async fn find_kubernetes_cluster_instance(
        &self,
        cluster_id: &str,
        search: &str,
    ) -> Result<KubernetesInstance, ClientError> {
        let cluster = self.get_kubernetes_cluster(cluster_id).await?;
        cluster
            .instances
            .into_iter()
            .find(|instance| instance.hostname == search || instance.id == search)
            .ok_or_else(|| {
                ClientError::api(
                    404,
                    "zero_matches",
                    format!("no instance matching {} in cluster {}", search, cluster_id),
                )
            })
    }

    async fn list_volume_snapshots(&self) -> Result<Vec<VolumeSnapshot>, ClientError> {
        Ok(self.state.lock().unwrap().snapshots.clone())
    }

    async fn list_volume_snapshots_by_volume_id(
        &self,
        volume_id: &str,
    ) -> Result<Vec<VolumeSnapshot>, ClientError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .filter(|s| s.volume_id == volume_id)
            .cloned()
            .collect())
    }

    async fn get_volume_snapshot(&self, id: &str) -> Result<VolumeSnapshot, ClientError> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .find(|s| s.snapshot_id == id)
            .cloned()
            .ok_or_else(|| Self::snapshot_not_found(id))
    }

    async fn get_volume_snapshot_by_volume_id(
        &self,
        volume_id: &str,
        snapshot_id: &str,
    ) -> Result<VolumeSnapshot, ClientError> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .find(|s| s.snapshot_id == snapshot_id && s.volume_id == volume_id)
            .cloned()
            .ok_or_else(|| Self::snapshot_not_found(snapshot_id))
    }

    async fn create_volume_snapshot(
        &self,
        volume_id: &str,
        config: &VolumeSnapshotConfig,
    ) -> Result<VolumeSnapshot, ClientError> {
        let mut s = self.state.lock().unwrap();
        if let Some(limit) = s.snapshot_limit {
            if s.snapshots.len() >= limit {
                return Err(ClientError::api(
                    403,
                    "database_volume_snapshot_limit_exceeded",
                    "snapshot quota exceeded",
                ));
            }
        }
        let restore_size = s
            .volumes
            .iter()
            .find(|v| v.id == volume_id)
            .map(|v| v.size_gigabytes * 1_073_741_824)
            .unwrap_or_default();
        s.next_id += 1;
        let snapshot = VolumeSnapshot {
            snapshot_id: format!("snapshot-{}", s.next_id),
            name: config.name.clone(),
            volume_id: volume_id.to_string(),
            instance_id: String::new(),
            restore_size,
            state: "Ready".to_string(),
            creation_time: chrono::Utc::now().to_rfc3339(),
        };
        s.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_volume_snapshot(&self, id: &str) -> Result<(), ClientError> {
        let mut s = self.state.lock().unwrap();
        let snapshot = s
            .snapshots
            .iter()
            .find(|s| s.snapshot_id == id)
            .cloned()
            .ok_or_else(|| Self::snapshot_not_found(id))?;
        if snapshot.state == "in_use" {
            return Err(ClientError::api(
                409,
                "database_snapshot_cannot_delete_in_use",
                format!("snapshot {} is attached to an instance", id),
            ));
        }
        s.snapshots.retain(|s| s.snapshot_id != id);
        Ok(())
    }
}
