//! The CSI Node service: formatting and mounting attached block
//! devices on the host.
//!
//! Every operation checks host state before acting (is the device
//! formatted, is the path mounted), so re-invocation after a partial
//! failure converges instead of erroring.

use crate::driver::Driver;
use crate::plugger::PluggerError;
use crate::MAX_VOLUMES_PER_NODE;

use csi_grpc::v1 as csi;
use csi_grpc::v1::node_server::Node;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

/// Filesystem created on new volumes.
const VOLUME_FILESYSTEM: &str = "ext4";

/// Contents of the host-local node identity file (`/etc/civostatsd`).
/// Other keys in the file are ignored.
#[derive(Debug, Default, Deserialize)]
struct NodeDetailsFile {
    #[serde(default)]
    region: String,
    #[serde(default)]
    instance_id: String,
}

async fn node_details_from_file(path: &Path) -> Option<(String, String)> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    let parsed: NodeDetailsFile = toml::from_str(&raw).ok()?;
    Some((parsed.instance_id, parsed.region))
}

fn node_details_from_env() -> (String, String) {
    let instance_id = std::env::var("NODE_ID").unwrap_or_default();
    let region = std::env::var("REGION").unwrap_or_default();
    (instance_id, region)
}

fn plug_status(err: PluggerError) -> Status {
    Status::internal(err.to_string())
}

impl Driver {
    /// Resolves this node's provider identity: the identity file first,
    /// then environment variables, then a cluster-instance lookup by
    /// the node's Kubernetes name.
    pub(crate) async fn resolve_node_identity(&self) -> Result<(String, String), Status> {
        let (mut instance_id, mut region) =
            match node_details_from_file(&self.node_details_path).await {
                Some(details) => details,
                None => {
                    debug!(
                        path = %self.node_details_path.display(),
                        "Node details file is missing or not valid TOML, using environment variables"
                    );
                    (String::new(), String::new())
                }
            };

        if instance_id.is_empty() {
            let (env_instance_id, env_region) = node_details_from_env();
            instance_id = env_instance_id;
            if region.is_empty() {
                region = env_region;
            }
        }

        if instance_id.is_empty() {
            debug!(node_name = %self.node_name, "Looking up the cluster instance for the node identity");
            let instance = self
                .civo
                .find_kubernetes_cluster_instance(&self.cluster_id, &self.node_name)
                .await
                .map_err(|e| {
                    Status::internal(format!("unable to resolve the node identity: {}", e))
                })?;
            instance_id = instance.id;
            if region.is_empty() {
                region = instance.region;
            }
        }

        Ok((instance_id, region))
    }
}

#[tonic::async_trait]
impl Node for Driver {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(volume_id = %req.volume_id, staging_target_path = %req.staging_target_path, "Request: NodeStageVolume");

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumeId to NodeStageVolume",
            ));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a StagingTargetPath to NodeStageVolume",
            ));
        }
        if req.volume_capability.is_none() {
            return Err(Status::invalid_argument(
                "must provide a VolumeCapability to NodeStageVolume",
            ));
        }

        debug!(volume_id = %req.volume_id, "Formatting and mounting volume (staging)");

        let device_path = self.plugger.path_for_volume(&req.volume_id).await;
        if device_path.is_empty() {
            return Err(Status::not_found("path to volume not found"));
        }

        let formatted = self
            .plugger
            .is_formatted(&device_path)
            .await
            .map_err(plug_status)?;
        debug!(volume_id = %req.volume_id, formatted, "Is currently formatted?");
        if !formatted {
            self.plugger
                .format(&device_path, VOLUME_FILESYSTEM)
                .await
                .map_err(plug_status)?;
        }

        let mounted = self
            .plugger
            .is_mounted(&req.staging_target_path)
            .await
            .map_err(plug_status)?;
        debug!(volume_id = %req.volume_id, mounted, "Is currently mounted?");
        if !mounted {
            let mount_flags = match req.volume_capability.as_ref().and_then(|c| c.access_type.as_ref())
            {
                Some(csi::volume_capability::AccessType::Mount(mount)) => mount.mount_flags.clone(),
                _ => Vec::new(),
            };
            let flags: Vec<&str> = mount_flags.iter().map(String::as_str).collect();
            self.plugger
                .mount(
                    &device_path,
                    &req.staging_target_path,
                    VOLUME_FILESYSTEM,
                    &flags,
                )
                .await
                .map_err(plug_status)?;
        }

        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(volume_id = %req.volume_id, staging_target_path = %req.staging_target_path, "Request: NodeUnstageVolume");

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumeId to NodeUnstageVolume",
            ));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a StagingTargetPath to NodeUnstageVolume",
            ));
        }

        debug!(volume_id = %req.volume_id, path = %req.staging_target_path, "Unmounting volume (unstaging)");

        // The device being gone means the detach already happened.
        let device_path = self.plugger.path_for_volume(&req.volume_id).await;
        if device_path.is_empty() {
            return Ok(Response::new(csi::NodeUnstageVolumeResponse {}));
        }

        let mounted = self
            .plugger
            .is_mounted(&req.staging_target_path)
            .await
            .map_err(plug_status)?;
        debug!(volume_id = %req.volume_id, mounted, "Checking if currently mounted");
        if mounted {
            self.plugger
                .unmount(&req.staging_target_path)
                .await
                .map_err(plug_status)?;
        }

        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            target_path = %req.target_path,
            "Request: NodePublishVolume"
        );

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumeId to NodePublishVolume",
            ));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a StagingTargetPath to NodePublishVolume",
            ));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a TargetPath to NodePublishVolume",
            ));
        }
        if req.volume_capability.is_none() {
            return Err(Status::invalid_argument(
                "must provide a VolumeCapability to NodePublishVolume",
            ));
        }

        debug!(
            volume_id = %req.volume_id,
            from_path = %req.staging_target_path,
            to_path = %req.target_path,
            "Bind-mounting volume (publishing)"
        );

        let mounted = self
            .plugger
            .is_mounted(&req.target_path)
            .await
            .map_err(plug_status)?;
        if !mounted {
            let mut flags = vec!["bind"];
            if req.readonly {
                flags.push("ro");
            }
            self.plugger
                .mount(
                    &req.staging_target_path,
                    &req.target_path,
                    VOLUME_FILESYSTEM,
                    &flags,
                )
                .await
                .map_err(plug_status)?;
        }

        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(volume_id = %req.volume_id, target_path = %req.target_path, "Request: NodeUnpublishVolume");

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumeId to NodeUnpublishVolume",
            ));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a TargetPath to NodeUnpublishVolume",
            ));
        }

        info!(volume_id = %req.volume_id, path = %req.target_path, "Removing bind-mount for volume (unpublishing)");

        let mounted = match self.plugger.is_mounted(&req.target_path).await {
            Ok(mounted) => mounted,
            // Already cleaned up.
            Err(e) if e.is_not_exist() => {
                return Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
            }
            // A corrupted mount won't answer stat but still needs the
            // unmount.
            Err(e) if e.is_corrupted_mount() => true,
            Err(e) => return Err(plug_status(e)),
        };

        if mounted {
            self.plugger
                .unmount(&req.target_path)
                .await
                .map_err(plug_status)?;
        }

        match tokio::fs::remove_dir_all(&req.target_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Status::internal(format!(
                    "failed to remove target path {}: {}",
                    req.target_path, e
                )))
            }
        }

        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        info!(volume_id = %req.volume_id, volume_path = %req.volume_path, "Request: NodeGetVolumeStats");

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumeId to NodeGetVolumeStats",
            ));
        }
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumePath to NodeGetVolumeStats",
            ));
        }

        let mounted = self
            .plugger
            .is_mounted(&req.volume_path)
            .await
            .map_err(plug_status)?;
        if !mounted {
            return Err(Status::not_found(format!(
                "volume path {} is not mounted",
                req.volume_path
            )));
        }

        let stats = self
            .plugger
            .get_statistics(&req.volume_path)
            .await
            .map_err(plug_status)?;

        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage: vec![
                csi::VolumeUsage {
                    available: stats.available_bytes,
                    total: stats.total_bytes,
                    used: stats.used_bytes,
                    unit: csi::volume_usage::Unit::Bytes as i32,
                },
                csi::VolumeUsage {
                    available: stats.available_inodes,
                    total: stats.total_inodes,
                    used: stats.used_inodes,
                    unit: csi::volume_usage::Unit::Inodes as i32,
                },
            ],
            ..Default::default()
        }))
    }

    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(volume_id = %req.volume_id, volume_path = %req.volume_path, "Request: NodeExpandVolume");

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumeId to NodeExpandVolume",
            ));
        }
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumePath to NodeExpandVolume",
            ));
        }

        self.civo.get_volume(&req.volume_id).await.map_err(|e| {
            if e.is_volume_not_found() {
                Status::not_found(format!("volume {:?} not found", req.volume_id))
            } else {
                Status::internal(format!("unable to fetch volume: {}", e))
            }
        })?;

        let device_path = self.plugger.path_for_volume(&req.volume_id).await;
        if device_path.is_empty() {
            return Err(Status::not_found("path to volume not found"));
        }

        self.plugger
            .expand_filesystem(&device_path)
            .await
            .map_err(plug_status)?;

        // The filesystem reports its own new size; the response field
        // is optional.
        Ok(Response::new(csi::NodeExpandVolumeResponse::default()))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi_grpc::v1::node_service_capability::rpc::Type;

        // VOLUME_CONDITION is intentionally not advertised.
        let capabilities = [Type::StageUnstageVolume, Type::ExpandVolume, Type::GetVolumeStats]
            .into_iter()
            .map(|rpc_type| csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc {
                        r#type: rpc_type as i32,
                    },
                )),
            })
            .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        info!("Request: NodeGetInfo");

        let (instance_id, region) = self.resolve_node_identity().await?;
        debug!(node_id = %instance_id, region = %region, "Requested information about the node");

        let mut segments = HashMap::new();
        segments.insert("region".to_string(), region);

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: instance_id,
            max_volumes_per_node: MAX_VOLUMES_PER_NODE,
            // The driver only works within a single region.
            accessible_topology: Some(csi::Topology { segments }),
        }))
    }
}
