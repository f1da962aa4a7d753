//! Typed async client for the Civo cloud API.
//!
//! The [`CivoApi`] trait is the seam consumers program against: the
//! [`Client`] talks to the real HTTP API, while [`FakeClient`] is a
//! deterministic in-memory double for tests. Errors carry the API's
//! `{code, reason}` body so callers can branch on the handful of
//! sentinel codes (see [`ClientError`]).

mod client;
mod error;
mod fake;
mod types;

pub use client::Client;
pub use error::ClientError;
pub use fake::FakeClient;
pub use types::{
    KubernetesCluster, KubernetesInstance, Quota, Volume, VolumeAttachConfig, VolumeConfig,
    VolumeSnapshot, VolumeSnapshotConfig, VolumeStatus,
};

use async_trait::async_trait;

/// Operations of the Civo API used by the CSI driver.
///
/// All calls are asynchronous; mutations are requests for a state
/// transition, not the transition itself, and callers are expected to
/// re-fetch until the provider converges.
#[async_trait]
pub trait CivoApi: Send + Sync {
    /// Lists every volume visible to the account.
    async fn list_volumes(&self) -> Result<Vec<Volume>, ClientError>;

    /// Fetches a single volume by id.
    async fn get_volume(&self, id: &str) -> Result<Volume, ClientError>;

    /// Creates a new volume and returns its record.
    async fn create_volume(&self, config: &VolumeConfig) -> Result<Volume, ClientError>;

    /// Deletes a volume by id.
    async fn delete_volume(&self, id: &str) -> Result<(), ClientError>;

    /// Requests attachment of a volume to an instance.
    async fn attach_volume(
        &self,
        id: &str,
        config: &VolumeAttachConfig,
    ) -> Result<(), ClientError>;

    /// Requests detachment of a volume from its instance.
    async fn detach_volume(&self, id: &str) -> Result<(), ClientError>;

    /// Requests a resize of the volume to `size_gigabytes`.
    async fn resize_volume(&self, id: &str, size_gigabytes: i64) -> Result<(), ClientError>;

    /// Reads the account quota.
    async fn get_quota(&self) -> Result<Quota, ClientError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), ClientError>;

    /// Fetches a managed Kubernetes cluster, including its instances.
    async fn get_kubernetes_cluster(&self, id: &str)
        -> Result<KubernetesCluster, ClientError>;

    /// Finds the instance of a cluster whose hostname (or id) matches
    /// `search`. Fails with a `zero_matches` error when nothing does.
    async fn find_kubernetes_cluster_instance(
        &self,
        cluster_id: &str,
        search: &str,
    ) -> Result<KubernetesInstance, ClientError>;

    /// Lists every volume snapshot in the account.
    async fn list_volume_snapshots(&self) -> Result<Vec<VolumeSnapshot>, ClientError>;

    /// Lists the snapshots of a single volume.
    async fn list_volume_snapshots_by_volume_id(
        &self,
        volume_id: &str,
    ) -> Result<Vec<VolumeSnapshot>, ClientError>;

    /// Fetches a snapshot by id.
    async fn get_volume_snapshot(&self, id: &str) -> Result<VolumeSnapshot, ClientError>;

    /// Fetches a snapshot of a specific volume.
    async fn get_volume_snapshot_by_volume_id(
        &self,
        volume_id: &str,
        snapshot_id: &str,
    ) -> Result<VolumeSnapshot, ClientError>;

    /// Creates a snapshot of a volume.
    async fn create_volume_snapshot(
        &self,
        volume_id: &str,
        config: &VolumeSnapshotConfig,
    ) -> Result<VolumeSnapshot, ClientError>;

    /// Deletes a snapshot by id.
    async fn delete_volume_snapshot(&self, id: &str) -> Result<(), ClientError>;
}
