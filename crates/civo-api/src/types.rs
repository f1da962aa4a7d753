//! Data model of the Civo API objects this client works with.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a block volume as reported by the API. The
/// provider transitions volumes asynchronously, so callers generally
/// re-fetch a volume until it reaches the state they need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    Creating,
    Available,
    Attaching,
    Attached,
    Detaching,
    Resizing,
    Deleting,
    /// Any state this client does not know about.
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeStatus::Creating => "creating",
            VolumeStatus::Available => "available",
            VolumeStatus::Attaching => "attaching",
            VolumeStatus::Attached => "attached",
            VolumeStatus::Detaching => "detaching",
            VolumeStatus::Resizing => "resizing",
            VolumeStatus::Deleting => "deleting",
            VolumeStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A block volume record. The provider stores sizes at 1 GiB
/// granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub namespace: String,
    pub size_gigabytes: i64,
    #[serde(default)]
    pub status: VolumeStatus,
    /// Instance the volume is attached to, empty when detached.
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub region: String,
}

/// Parameters for creating a new volume.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VolumeConfig {
    pub name: String,
    pub region: String,
    pub namespace: String,
    pub cluster_id: String,
    pub size_gigabytes: i64,
    /// Snapshot to pre-populate the volume from, empty for a blank
    /// volume.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub snapshot_id: String,
}

/// Parameters for attaching a volume to an instance.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeAttachConfig {
    pub instance_id: String,
    pub region: String,
}

/// Account quota counters relevant to volume provisioning.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Quota {
    pub disk_gigabytes_limit: i64,
    pub disk_gigabytes_usage: i64,
    pub disk_volume_count_limit: i64,
    pub disk_volume_count_usage: i64,
}

/// A managed Kubernetes cluster, reduced to the fields the CSI driver
/// needs for membership checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesCluster {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instances: Vec<KubernetesInstance>,
}

/// A node of a managed Kubernetes cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesInstance {
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub region: String,
}

/// A point-in-time snapshot of a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub snapshot_id: String,
    #[serde(default)]
    pub name: String,
    pub volume_id: String,
    #[serde(default)]
    pub instance_id: String,
    /// Size required to restore the snapshot, in bytes.
    #[serde(default)]
    pub restore_size: i64,
    #[serde(default)]
    pub state: String,
    /// RFC 3339 timestamp, possibly empty while the snapshot is cutting.
    #[serde(default)]
    pub creation_time: String,
}

/// Parameters for creating a volume snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeSnapshotConfig {
    pub name: String,
}
