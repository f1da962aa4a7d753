//! The CSI Controller service: volume, attachment and snapshot
//! lifecycle against the provider API.
//!
//! Every provider mutation is a *request* for a state transition, not
//! the transition itself, so decisions are always made on freshly
//! fetched state and mutations are followed by a settlement wait (see
//! [`Driver::wait_for_volume_status`]).

use crate::driver::Driver;
use crate::{BYTES_PER_GIGABYTE, DEFAULT_VOLUME_SIZE_GB};

use civo_api::{
    ClientError, Volume, VolumeAttachConfig, VolumeConfig, VolumeSnapshot, VolumeSnapshotConfig,
    VolumeStatus,
};
use csi_grpc::v1 as csi;
use csi_grpc::v1::controller_server::Controller;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

/// How many settlement polls to attempt before giving up.
pub(crate) const VOLUME_AVAILABLE_RETRIES: u32 = 20;

/// Pause between settlement polls.
pub(crate) const SETTLE_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of a settlement wait that did not fail outright.
pub(crate) enum Settlement {
    Reached,
    Exhausted { last_status: VolumeStatus },
}

impl Driver {
    /// Polls the provider until the volume reaches `desired` or the
    /// retry budget runs out. Short-circuits in test mode. The caller's
    /// request context cancels the wait by dropping the future.
    pub(crate) async fn wait_for_volume_status(
        &self,
        volume_id: &str,
        desired: VolumeStatus,
        retries: u32,
    ) -> Result<Settlement, ClientError> {
        info!(volume_id, desired_state = %desired, "Waiting for volume to enter desired state");

        if self.test_mode {
            return Ok(Settlement::Reached);
        }

        let mut last_status = VolumeStatus::Unknown;
        for _ in 0..retries {
            tokio::time::sleep(SETTLE_INTERVAL).await;

            let volume = self.civo.get_volume(volume_id).await?;
            if volume.status == desired {
                return Ok(Settlement::Reached);
            }
            last_status = volume.status;
        }
        Ok(Settlement::Exhausted { last_status })
    }

    /// Waits for a created (or found) volume to become available, then
    /// builds the CreateVolume response from it.
    async fn settle_created_volume(
        &self,
        volume: Volume,
    ) -> Result<csi::CreateVolumeResponse, Status> {
        match self
            .wait_for_volume_status(&volume.id, VolumeStatus::Available, VOLUME_AVAILABLE_RETRIES)
            .await
        {
            Ok(Settlement::Reached) => Ok(csi::CreateVolumeResponse {
                volume: Some(csi::Volume {
                    volume_id: volume.id,
                    capacity_bytes: volume.size_gigabytes * BYTES_PER_GIGABYTE,
                    ..Default::default()
                }),
            }),
            Ok(Settlement::Exhausted { last_status }) => {
                error!(volume_id = %volume.id, status = %last_status, "Civo volume is not 'available'");
                Err(Status::unavailable(format!(
                    "volume {:?} isn't available to be attached, state is currently {}",
                    volume.id, last_status
                )))
            }
            Err(e) => {
                error!(error = %e, "Unable to wait for volume availability in the Civo API");
                Err(Status::internal(format!(
                    "unable to wait for volume availability: {}",
                    e
                )))
            }
        }
    }
}

fn supported_access_mode(mode: i32) -> bool {
    use csi_grpc::v1::volume_capability::access_mode::Mode;
    matches!(
        Mode::try_from(mode),
        Ok(Mode::SingleNodeWriter | Mode::SingleNodeReaderOnly)
    )
}

/// Size requested by a capacity range, falling back to the limit and
/// then to the default volume size.
fn requested_size_bytes(range: Option<&csi::CapacityRange>) -> i64 {
    match range {
        None => DEFAULT_VOLUME_SIZE_GB * BYTES_PER_GIGABYTE,
        Some(range) => {
            if range.required_bytes != 0 {
                range.required_bytes
            } else {
                range.limit_bytes
            }
        }
    }
}

/// Rounds a byte count up to whole gigabytes, the provider's unit.
fn gigabytes(bytes: i64) -> i64 {
    let mut size = bytes / BYTES_PER_GIGABYTE;
    if bytes % BYTES_PER_GIGABYTE != 0 {
        size += 1;
    }
    size
}

/// Parses the provider's RFC 3339 creation time; an empty string means
/// the timestamp is not known yet.
fn parse_creation_time(raw: &str) -> Result<Option<prost_types::Timestamp>, Status> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let parsed = chrono::DateTime::parse_from_rfc3339(raw).map_err(|e| {
        Status::internal(format!("failed to parse creation time {:?}: {}", raw, e))
    })?;
    Ok(Some(prost_types::Timestamp {
        seconds: parsed.timestamp(),
        nanos: parsed.timestamp_subsec_nanos() as i32,
    }))
}

fn snapshot_is_ready(state: &str) -> bool {
    matches!(state, "Ready" | "Available")
}

fn to_csi_snapshot(snapshot: &VolumeSnapshot) -> Result<csi::Snapshot, Status> {
    Ok(csi::Snapshot {
        snapshot_id: snapshot.snapshot_id.clone(),
        source_volume_id: snapshot.volume_id.clone(),
        creation_time: parse_creation_time(&snapshot.creation_time)?,
        size_bytes: snapshot.restore_size,
        ready_to_use: snapshot_is_ready(&snapshot.state),
    })
}

fn snapshot_entry(
    snapshot: &VolumeSnapshot,
) -> Result<csi::list_snapshots_response::Entry, Status> {
    Ok(csi::list_snapshots_response::Entry {
        snapshot: Some(to_csi_snapshot(snapshot)?),
    })
}

#[tonic::async_trait]
impl Controller for Driver {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(name = %req.name, "Request: CreateVolume");

        if req.name.is_empty() {
            return Err(Status::invalid_argument("CreateVolume name must be provided"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "CreateVolume volume capabilities must be provided",
            ));
        }

        for capability in &req.volume_capabilities {
            let mode = capability
                .access_mode
                .as_ref()
                .map(|m| m.mode)
                .unwrap_or_default();
            if !supported_access_mode(mode) {
                return Err(Status::invalid_argument(
                    "CreateVolume access mode isn't supported",
                ));
            }
            if matches!(
                capability.access_type,
                Some(csi::volume_capability::AccessType::Block(_))
            ) {
                return Err(Status::invalid_argument(
                    "CreateVolume block types aren't supported, only mount types",
                ));
            }
        }

        let bytes = requested_size_bytes(req.capacity_range.as_ref());
        let desired_gigabytes = gigabytes(bytes);
        debug!(size_gb = desired_gigabytes, "Volume size determined");

        debug!("Listing current volumes in the Civo API");
        let volumes = self.civo.list_volumes().await.map_err(|e| {
            error!(error = %e, "Unable to list volumes in the Civo API");
            Status::internal(format!("unable to list volumes: {}", e))
        })?;

        if let Some(existing) = volumes.into_iter().find(|v| v.name == req.name) {
            debug!(volume_id = %existing.id, "Volume already exists");
            if existing.size_gigabytes != desired_gigabytes {
                return Err(Status::already_exists(
                    "volume already exists with a different size",
                ));
            }
            return self.settle_created_volume(existing).await.map(Response::new);
        }

        let snapshot_id = match req.volume_content_source {
            None => String::new(),
            Some(source) => match source.r#type {
                Some(csi::volume_content_source::Type::Snapshot(snapshot)) => {
                    if snapshot.snapshot_id.is_empty() {
                        return Err(Status::invalid_argument(
                            "volume content source is set to snapshot, but no snapshot id was provided",
                        ));
                    }
                    snapshot.snapshot_id
                }
                _ => {
                    return Err(Status::invalid_argument(
                        "unsupported volume content source type",
                    ))
                }
            },
        };

        debug!("Volume doesn't currently exist, will need creating");
        let quota = self.civo.get_quota().await.map_err(|e| {
            error!(error = %e, "Unable to get quota from the Civo API");
            Status::internal(format!("unable to get quota: {}", e))
        })?;

        let available_gigabytes = quota.disk_gigabytes_limit - quota.disk_gigabytes_usage;
        if available_gigabytes < desired_gigabytes {
            error!("Requested volume would exceed storage quota available");
            return Err(Status::out_of_range(format!(
                "requested volume would exceed volume space quota by {} GB",
                desired_gigabytes - available_gigabytes
            )));
        }
        if quota.disk_volume_count_usage >= quota.disk_volume_count_limit {
            error!("Requested volume would exceed volume count quota available");
            return Err(Status::out_of_range(format!(
                "requested volume would exceed volume count limit quota of {}",
                quota.disk_volume_count_limit
            )));
        }

        let config = VolumeConfig {
            name: req.name,
            region: self.region.clone(),
            namespace: self.namespace.clone(),
            cluster_id: self.cluster_id.clone(),
            size_gigabytes: desired_gigabytes,
            snapshot_id,
        };
        debug!("Creating volume in the Civo API");
        let volume = self.civo.create_volume(&config).await.map_err(|e| {
            error!(error = %e, "Unable to create volume in the Civo API");
            Status::internal(format!("unable to create volume: {}", e))
        })?;

        info!(volume_id = %volume.id, "Volume created in the Civo API");
        self.settle_created_volume(volume).await.map(Response::new)
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(volume_id = %req.volume_id, "Request: DeleteVolume");

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumeId to DeleteVolume",
            ));
        }

        match self.civo.delete_volume(&req.volume_id).await {
            Ok(()) => {
                info!(volume_id = %req.volume_id, "Volume deleted from the Civo API");
                Ok(Response::new(csi::DeleteVolumeResponse {}))
            }
            Err(e) if e.is_volume_not_found() => {
                info!(volume_id = %req.volume_id, "Volume already deleted from the Civo API");
                Ok(Response::new(csi::DeleteVolumeResponse {}))
            }
            Err(e) => {
                error!(error = %e, "Unable to delete volume in the Civo API");
                Err(Status::internal(format!("unable to delete volume: {}", e)))
            }
        }
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(volume_id = %req.volume_id, node_id = %req.node_id, "Request: ControllerPublishVolume");

        if req.volume_capability.is_none() {
            return Err(Status::invalid_argument(
                "must provide a VolumeCapability to ControllerPublishVolume",
            ));
        }
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumeId to ControllerPublishVolume",
            ));
        }
        if req.node_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a NodeId to ControllerPublishVolume",
            ));
        }

        debug!("Checking if the node exists in the cluster");
        let cluster = self
            .civo
            .get_kubernetes_cluster(&self.cluster_id)
            .await
            .map_err(|e| {
                Status::internal(format!("unable to connect to the Civo API: {}", e))
            })?;
        if !cluster.instances.iter().any(|i| i.id == req.node_id) {
            return Err(Status::not_found(
                "unable to find the instance to attach the volume to",
            ));
        }

        debug!("Finding volume in the Civo API");
        let volume = self.civo.get_volume(&req.volume_id).await.map_err(|e| {
            error!(error = %e, "Unable to find volume for publishing in the Civo API");
            Status::internal(format!("unable to fetch volume: {}", e))
        })?;

        let on_requested_node = volume.instance_id == req.node_id;
        let needs_attach = match (volume.status, on_requested_node) {
            (VolumeStatus::Attached, true) => {
                info!(volume_id = %volume.id, instance_id = %req.node_id, "Volume is already attached to the requested instance");
                return Ok(Response::new(csi::ControllerPublishVolumeResponse::default()));
            }
            // The attach is already in flight, just re-check below.
            (VolumeStatus::Attaching, true) => false,
            (VolumeStatus::Available, _) => true,
            (status, false) => {
                error!(
                    volume_id = %volume.id,
                    status = %status,
                    requested_instance_id = %req.node_id,
                    current_instance_id = %volume.instance_id,
                    "Volume is not available to be attached"
                );
                return Err(Status::unavailable(format!(
                    "volume {:?} is not available to be attached, state is currently {}",
                    volume.id, status
                )));
            }
            // Some other transition on this node is in progress.
            (_, true) => false,
        };

        if needs_attach {
            debug!(volume_id = %volume.id, requested_instance_id = %req.node_id, "Requesting volume to be attached in the Civo API");
            self.civo
                .attach_volume(
                    &req.volume_id,
                    &VolumeAttachConfig {
                        instance_id: req.node_id.clone(),
                        region: self.region.clone(),
                    },
                )
                .await
                .map_err(|e| {
                    error!(error = %e, "Unable to attach volume in the Civo API");
                    Status::internal(format!("unable to attach volume: {}", e))
                })?;
            info!(volume_id = %volume.id, instance_id = %req.node_id, "Volume successfully requested to be attached in the Civo API");
        }

        // Give the provider a moment to transition before re-reading.
        if !self.test_mode {
            tokio::time::sleep(SETTLE_INTERVAL).await;
        }

        info!(volume_id = %req.volume_id, "Fetching volume again to check status after attaching");
        let volume = self.civo.get_volume(&req.volume_id).await.map_err(|e| {
            error!(error = %e, "Unable to fetch volume from the Civo API");
            Status::internal(format!("unable to fetch volume: {}", e))
        })?;

        if volume.status != VolumeStatus::Attached {
            error!(volume_id = %volume.id, status = %volume.status, "Volume is not in the attached state");
            return Err(Status::unavailable(format!(
                "volume {:?} is not attached to the requested instance, state is currently {}",
                volume.id, volume.status
            )));
        }
        if volume.instance_id != req.node_id {
            error!(volume_id = %volume.id, instance_id = %req.node_id, "Volume is not attached to the requested instance");
            return Err(Status::unavailable(format!(
                "volume {:?} is not attached to the requested instance {:?}, instance id is currently {:?}",
                volume.id, req.node_id, volume.instance_id
            )));
        }

        debug!(volume_id = %volume.id, "Volume successfully attached in the Civo API");
        Ok(Response::new(csi::ControllerPublishVolumeResponse::default()))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(volume_id = %req.volume_id, "Request: ControllerUnpublishVolume");

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumeId to ControllerUnpublishVolume",
            ));
        }

        debug!("Finding volume in the Civo API");
        let volume = match self.civo.get_volume(&req.volume_id).await {
            Ok(volume) => volume,
            Err(e) if e.is_volume_not_found() || e.is_zero_matches() => {
                info!(volume_id = %req.volume_id, "Volume already deleted from the Civo API, pretend it's unmounted");
                return Ok(Response::new(
                    csi::ControllerUnpublishVolumeResponse::default(),
                ));
            }
            Err(e) => {
                error!(error = %e, "Unable to find volume for unpublishing in the Civo API");
                return Err(Status::internal(format!("unable to fetch volume: {}", e)));
            }
        };

        if volume.status == VolumeStatus::Available {
            info!(volume_id = %volume.id, "Volume is already available, no need to unpublish");
            return Ok(Response::new(
                csi::ControllerUnpublishVolumeResponse::default(),
            ));
        }

        if volume.instance_id != req.node_id {
            info!(
                volume_id = %volume.id,
                instance_id = %volume.instance_id,
                requested_instance_id = %req.node_id,
                "Volume is not attached to the requested instance"
            );
            return Ok(Response::new(
                csi::ControllerUnpublishVolumeResponse::default(),
            ));
        }

        if volume.status != VolumeStatus::Detaching {
            info!(volume_id = %volume.id, status = %volume.status, "Requesting volume to be detached");
            self.civo.detach_volume(&req.volume_id).await.map_err(|e| {
                error!(error = %e, "Unable to detach volume in the Civo API");
                Status::internal(format!("unable to detach volume: {}", e))
            })?;
            info!(volume_id = %volume.id, "Volume successfully requested to be detached in the Civo API");
        }

        if !self.test_mode {
            tokio::time::sleep(SETTLE_INTERVAL).await;
        }

        let volume = self.civo.get_volume(&req.volume_id).await.map_err(|e| {
            error!(error = %e, "Unable to find volume for unpublishing in the Civo API");
            Status::internal(format!("unable to fetch volume: {}", e))
        })?;

        if volume.status == VolumeStatus::Available {
            debug!(volume_id = %volume.id, "Volume is now available again");
            return Ok(Response::new(
                csi::ControllerUnpublishVolumeResponse::default(),
            ));
        }

        error!(volume_id = %volume.id, status = %volume.status, "Civo volume did not go back to 'available' status");
        Err(Status::unavailable(format!(
            "volume {:?} did not go back to \"available\", state is currently {}",
            req.volume_id, volume.status
        )))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        info!(volume_id = %req.volume_id, "Request: ValidateVolumeCapabilities");

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumeId to ValidateVolumeCapabilities",
            ));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "must provide VolumeCapabilities to ValidateVolumeCapabilities",
            ));
        }

        self.civo.get_volume(&req.volume_id).await.map_err(|e| {
            Status::not_found(format!("unable to fetch volume from the Civo API: {}", e))
        })?;

        let access_mode_supported = req.volume_capabilities.iter().any(|capability| {
            supported_access_mode(
                capability
                    .access_mode
                    .as_ref()
                    .map(|m| m.mode)
                    .unwrap_or_default(),
            )
        });
        if !access_mode_supported {
            return Err(Status::not_found(
                "requested volume capabilities are not supported",
            ));
        }

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_capabilities: req.volume_capabilities,
                ..Default::default()
            }),
            ..Default::default()
        }))
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let req = request.into_inner();
        if !req.starting_token.is_empty() {
            return Err(Status::aborted("starting-token not supported"));
        }

        info!("Request: ListVolumes");
        let volumes = self.civo.list_volumes().await.map_err(|e| {
            error!(error = %e, "Unable to list volumes in the Civo API");
            Status::internal(format!("unable to list volumes: {}", e))
        })?;

        let entries = volumes
            .into_iter()
            .map(|v| csi::list_volumes_response::Entry {
                volume: Some(csi::Volume {
                    capacity_bytes: v.size_gigabytes * BYTES_PER_GIGABYTE,
                    volume_id: v.id,
                    content_source: Some(csi::VolumeContentSource {
                        r#type: Some(csi::volume_content_source::Type::Volume(
                            csi::volume_content_source::VolumeSource::default(),
                        )),
                    }),
                    ..Default::default()
                }),
                status: Some(csi::list_volumes_response::VolumeStatus::default()),
            })
            .collect();

        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            ..Default::default()
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        info!("Request: GetCapacity");

        let quota = self.civo.get_quota().await.map_err(|e| {
            error!(error = %e, "Unable to get quota in the Civo API");
            Status::internal(format!("unable to get quota: {}", e))
        })?;

        let mut available_bytes =
            (quota.disk_gigabytes_limit - quota.disk_gigabytes_usage) * BYTES_PER_GIGABYTE;
        debug!(available_gb = available_bytes / BYTES_PER_GIGABYTE, "Available capacity determined");
        if available_bytes < BYTES_PER_GIGABYTE {
            warn!(available_bytes, "Available capacity is less than 1 GB, volumes can't be launched");
        }

        if quota.disk_volume_count_usage >= quota.disk_volume_count_limit {
            warn!("Number of volumes is at the quota limit, no capacity left");
            available_bytes = 0;
        }

        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity: available_bytes,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        info!("Request: ControllerGetCapabilities");

        use csi_grpc::v1::controller_service_capability::rpc::Type;
        let capabilities = [
            Type::CreateDeleteVolume,
            Type::PublishUnpublishVolume,
            Type::ListVolumes,
            Type::GetCapacity,
            Type::ExpandVolume,
            Type::CreateDeleteSnapshot,
            Type::ListSnapshots,
        ]
        .into_iter()
        .map(|rpc_type| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc {
                    r#type: rpc_type as i32,
                },
            )),
        })
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        info!(volume_id = %req.volume_id, "Request: ControllerExpandVolume");

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a VolumeId to ControllerExpandVolume",
            ));
        }

        let volume = self.civo.get_volume(&req.volume_id).await.map_err(|e| {
            Status::internal(format!(
                "ControllerExpandVolume could not retrieve existing volume: {}",
                e
            ))
        })?;

        let range = req.capacity_range.as_ref().ok_or_else(|| {
            Status::invalid_argument("must provide a capacity range to ControllerExpandVolume")
        })?;
        let desired_gigabytes = gigabytes(requested_size_bytes(Some(range)));
        debug!(
            current_size = volume.size_gigabytes,
            desired_size = desired_gigabytes,
            state = %volume.status,
            "Volume found"
        );

        if volume.status == VolumeStatus::Resizing {
            return Err(Status::aborted("volume is already being resized"));
        }

        if desired_gigabytes <= volume.size_gigabytes {
            info!(volume_id = %req.volume_id, "Volume is already at least the desired size");
            return Ok(Response::new(csi::ControllerExpandVolumeResponse {
                capacity_bytes: volume.size_gigabytes * BYTES_PER_GIGABYTE,
                node_expansion_required: true,
            }));
        }

        if volume.status != VolumeStatus::Available {
            return Err(Status::failed_precondition(
                "volume is not in an available state for OFFLINE expansion",
            ));
        }

        info!(size_gb = desired_gigabytes, volume_id = %req.volume_id, "Volume resize request sent");
        self.civo
            .resize_volume(&req.volume_id, desired_gigabytes)
            .await
            .map_err(|e| {
                error!(error = %e, "Unable to resize volume in the Civo API");
                Status::internal(format!("unable to resize volume: {}", e))
            })?;

        // Resizes can take a while, double the number of normal retries.
        match self
            .wait_for_volume_status(
                &req.volume_id,
                VolumeStatus::Available,
                VOLUME_AVAILABLE_RETRIES * 2,
            )
            .await
        {
            Ok(Settlement::Reached) => {}
            Ok(Settlement::Exhausted { last_status }) => {
                return Err(Status::unavailable(format!(
                    "volume {:?} did not become available after resizing, state is currently {}",
                    req.volume_id, last_status
                )))
            }
            Err(e) => {
                error!(error = %e, "Unable to wait for volume availability in the Civo API");
                return Err(Status::internal(format!(
                    "unable to wait for volume availability: {}",
                    e
                )));
            }
        }

        let volume = self.civo.get_volume(&req.volume_id).await.map_err(|e| {
            Status::internal(format!("unable to fetch volume after resizing: {}", e))
        })?;
        info!(size_gb = volume.size_gigabytes, volume_id = %volume.id, "Volume successfully resized");

        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: volume.size_gigabytes * BYTES_PER_GIGABYTE,
            node_expansion_required: true,
        }))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        info!(snapshot_name = %req.name, source_volume_id = %req.source_volume_id, "Request: CreateSnapshot");

        if req.name.is_empty() {
            return Err(Status::invalid_argument("snapshot name is required"));
        }
        if req.source_volume_id.is_empty() {
            return Err(Status::invalid_argument("SourceVolumeId is required"));
        }

        debug!(source_volume_id = %req.source_volume_id, "Finding current snapshot in the Civo API");
        let snapshots = self.civo.list_volume_snapshots().await.map_err(|e| {
            error!(error = %e, "Unable to list snapshots in the Civo API");
            Status::internal(format!("failed to list snapshots: {}", e))
        })?;

        // Idempotency check on the snapshot name.
        if let Some(existing) = snapshots.iter().find(|s| s.name == req.name) {
            if existing.volume_id == req.source_volume_id {
                return Ok(Response::new(csi::CreateSnapshotResponse {
                    snapshot: Some(to_csi_snapshot(existing)?),
                }));
            }
            error!(
                snapshot_name = %req.name,
                requested_source_volume_id = %req.source_volume_id,
                actual_source_volume_id = %existing.volume_id,
                "Snapshot with the same name but a different SourceVolumeId already exists"
            );
            return Err(Status::already_exists(format!(
                "snapshot with the same name {:?} but with different SourceVolumeId already exists",
                req.name
            )));
        }

        debug!(snapshot_name = %req.name, "Creating volume snapshot in the Civo API");
        let result = self
            .civo
            .create_volume_snapshot(
                &req.source_volume_id,
                &VolumeSnapshotConfig {
                    name: req.name.clone(),
                },
            )
            .await
            .map_err(|e| {
                if e.is_snapshot_quota_exceeded() {
                    error!(error = %e, "Requested volume snapshot would exceed snapshot quota available");
                    Status::resource_exhausted(format!(
                        "failed to create volume snapshot due to over quota: {}",
                        e
                    ))
                } else {
                    error!(error = %e, "Unable to create snapshot in the Civo API");
                    Status::internal(format!("failed to create volume snapshot: {}", e))
                }
            })?;

        info!(snapshot_id = %result.snapshot_id, "Snapshot created in the Civo API");

        // Give the snapshot a moment to cut before reporting its state.
        if !self.test_mode {
            tokio::time::sleep(SETTLE_INTERVAL).await;
        }
        let snapshot = self
            .civo
            .get_volume_snapshot(&result.snapshot_id)
            .await
            .map_err(|e| {
                error!(snapshot_id = %result.snapshot_id, error = %e, "Unable to get snapshot updates from the Civo API");
                Status::internal(format!(
                    "failed to get snapshot {:?}: {}",
                    result.snapshot_id, e
                ))
            })?;

        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some(to_csi_snapshot(&snapshot)?),
        }))
    }

    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        info!(snapshot_id = %req.snapshot_id, "Request: DeleteSnapshot");

        if req.snapshot_id.is_empty() {
            return Err(Status::invalid_argument(
                "must provide a SnapshotId to DeleteSnapshot",
            ));
        }

        debug!(snapshot_id = %req.snapshot_id, "Deleting snapshot in the Civo API");
        match self.civo.delete_volume_snapshot(&req.snapshot_id).await {
            Ok(()) => Ok(Response::new(csi::DeleteSnapshotResponse {})),
            Err(e) if e.is_snapshot_not_found() => {
                info!(snapshot_id = %req.snapshot_id, "Snapshot already deleted from the Civo API");
                Ok(Response::new(csi::DeleteSnapshotResponse {}))
            }
            Err(e) if e.is_snapshot_in_use() => Err(Status::failed_precondition(format!(
                "failed to delete snapshot {:?}, it is currently in use: {}",
                req.snapshot_id, e
            ))),
            Err(e) => Err(Status::internal(format!(
                "failed to delete snapshot {:?}: {}",
                req.snapshot_id, e
            ))),
        }
    }

    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        let req = request.into_inner();
        info!("Request: ListSnapshots");

        if !req.starting_token.is_empty() {
            error!("ListSnapshots received a starting token, but pagination is not supported");
            return Err(Status::aborted("starting-token not supported"));
        }

        // Most specific filter first: a single snapshot of a single
        // volume, then by snapshot id, then by source volume, then all.
        if !req.snapshot_id.is_empty() && !req.source_volume_id.is_empty() {
            debug!(snapshot_id = %req.snapshot_id, source_volume_id = %req.source_volume_id, "Fetching snapshot");
            return match self
                .civo
                .get_volume_snapshot_by_volume_id(&req.source_volume_id, &req.snapshot_id)
                .await
            {
                Ok(snapshot) => Ok(Response::new(csi::ListSnapshotsResponse {
                    entries: vec![snapshot_entry(&snapshot)?],
                    ..Default::default()
                })),
                Err(e) if e.is_snapshot_not_found() => {
                    info!(snapshot_id = %req.snapshot_id, "ListSnapshots: no snapshot found, returning with success");
                    Ok(Response::new(csi::ListSnapshotsResponse::default()))
                }
                Err(e) => Err(Status::internal(format!(
                    "failed to list snapshot {:?}: {}",
                    req.snapshot_id, e
                ))),
            };
        }

        if !req.snapshot_id.is_empty() {
            debug!(snapshot_id = %req.snapshot_id, "Fetching snapshot");
            return match self.civo.get_volume_snapshot(&req.snapshot_id).await {
                Ok(snapshot) => Ok(Response::new(csi::ListSnapshotsResponse {
                    entries: vec![snapshot_entry(&snapshot)?],
                    ..Default::default()
                })),
                Err(e) if e.is_snapshot_not_found() => {
                    info!(snapshot_id = %req.snapshot_id, "ListSnapshots: no snapshot found, returning with success");
                    Ok(Response::new(csi::ListSnapshotsResponse::default()))
                }
                Err(e) => Err(Status::internal(format!(
                    "failed to list snapshot {:?}: {}",
                    req.snapshot_id, e
                ))),
            };
        }

        let snapshots = self.civo.list_volume_snapshots().await.map_err(|e| {
            error!(error = %e, "Failed to list snapshots from the Civo API");
            Status::internal(format!("failed to list snapshots: {}", e))
        })?;

        let mut entries = snapshots
            .iter()
            .filter(|s| req.source_volume_id.is_empty() || s.volume_id == req.source_volume_id)
            .map(snapshot_entry)
            .collect::<Result<Vec<_>, Status>>()?;
        entries.sort_by(|a, b| {
            let a_id = a.snapshot.as_ref().map(|s| s.snapshot_id.as_str());
            let b_id = b.snapshot.as_ref().map(|s| s.snapshot_id.as_str());
            a_id.cmp(&b_id)
        });

        info!(total_snapshots = entries.len(), "Snapshots listed successfully");
        Ok(Response::new(csi::ListSnapshotsResponse {
            entries,
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugger::FakeDiskPlugger;
    use civo_api::{CivoApi, FakeClient, KubernetesCluster, KubernetesInstance, Quota};
    use std::sync::Arc;

    fn test_driver() -> (Driver, Arc<FakeClient>) {
        let civo = Arc::new(FakeClient::new());
        let driver = Driver::new_for_testing(civo.clone(), Arc::new(FakeDiskPlugger::new()));
        (driver, civo)
    }

    fn mount_capability(mode: csi::volume_capability::access_mode::Mode) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume::default(),
            )),
            access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
        }
    }

    fn single_writer_mount() -> csi::VolumeCapability {
        mount_capability(csi::volume_capability::access_mode::Mode::SingleNodeWriter)
    }

    fn create_request(name: &str) -> csi::CreateVolumeRequest {
        csi::CreateVolumeRequest {
            name: name.to_string(),
            volume_capabilities: vec![single_writer_mount()],
            ..Default::default()
        }
    }

    fn register_test_cluster(civo: &FakeClient, instance_id: &str) {
        civo.set_clusters(vec![KubernetesCluster {
            id: "12345678".to_string(),
            name: "test-cluster".to_string(),
            instances: vec![KubernetesInstance {
                id: instance_id.to_string(),
                hostname: "instance-1".to_string(),
                region: "TEST1".to_string(),
            }],
        }]);
    }

    #[test]
    fn gigabytes_rounds_up_to_whole_units() {
        assert_eq!(gigabytes(BYTES_PER_GIGABYTE), 1);
        assert_eq!(gigabytes(BYTES_PER_GIGABYTE + 1), 2);
        assert_eq!(gigabytes(25 * BYTES_PER_GIGABYTE), 25);
        assert_eq!(gigabytes(0), 0);
    }

    #[test]
    fn requested_size_defaults_and_falls_back_to_limit() {
        assert_eq!(requested_size_bytes(None), 10 * BYTES_PER_GIGABYTE);
        let range = csi::CapacityRange {
            required_bytes: 0,
            limit_bytes: 20 * BYTES_PER_GIGABYTE,
        };
        assert_eq!(requested_size_bytes(Some(&range)), 20 * BYTES_PER_GIGABYTE);
        let range = csi::CapacityRange {
            required_bytes: 5 * BYTES_PER_GIGABYTE,
            limit_bytes: 20 * BYTES_PER_GIGABYTE,
        };
        assert_eq!(requested_size_bytes(Some(&range)), 5 * BYTES_PER_GIGABYTE);
    }

    #[test]
    fn creation_time_parses_rfc3339() {
        let ts = parse_creation_time("2020-01-01T00:00:00Z").unwrap().unwrap();
        assert_eq!(ts.seconds, 1_577_836_800);
        assert!(parse_creation_time("").unwrap().is_none());
        assert!(parse_creation_time("   ").unwrap().is_none());
        assert!(parse_creation_time("not-a-time").is_err());
    }

    #[tokio::test]
    async fn create_volume_uses_the_default_size() {
        let (driver, civo) = test_driver();

        let resp = driver
            .create_volume(Request::new(create_request("foo")))
            .await
            .unwrap()
            .into_inner();

        let volumes = civo.list_volumes().await.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "foo");
        assert_eq!(volumes[0].size_gigabytes, 10);

        let volume = resp.volume.unwrap();
        assert_eq!(volume.volume_id, volumes[0].id);
        assert_eq!(volume.capacity_bytes, 10_737_418_240);
    }

    #[tokio::test]
    async fn create_volume_rejects_block_access() {
        let (driver, civo) = test_driver();

        let mut req = create_request("foo");
        req.volume_capabilities = vec![csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
            }),
        }];

        let err = driver.create_volume(Request::new(req)).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert!(civo.list_volumes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_volume_rejects_multi_node_access_modes() {
        let (driver, _) = test_driver();
        let mut req = create_request("foo");
        req.volume_capabilities = vec![mount_capability(
            csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter,
        )];
        let err = driver.create_volume(Request::new(req)).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_volume_requires_name_and_capabilities() {
        let (driver, _) = test_driver();

        let err = driver
            .create_volume(Request::new(create_request("")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let mut req = create_request("foo");
        req.volume_capabilities.clear();
        let err = driver.create_volume(Request::new(req)).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_volume_rounds_the_requested_size_up() {
        let (driver, civo) = test_driver();

        let mut req = create_request("foo");
        req.capacity_range = Some(csi::CapacityRange {
            required_bytes: 26_843_545_600,
            limit_bytes: 0,
        });
        let resp = driver
            .create_volume(Request::new(req))
            .await
            .unwrap()
            .into_inner();

        let volumes = civo.list_volumes().await.unwrap();
        assert_eq!(volumes[0].size_gigabytes, 25);
        assert_eq!(resp.volume.unwrap().capacity_bytes, 26_843_545_600);
    }

    #[tokio::test]
    async fn create_volume_rejects_requests_over_quota() {
        let (driver, civo) = test_driver();
        civo.set_quota(Quota {
            disk_gigabytes_limit: 100,
            disk_gigabytes_usage: 0,
            disk_volume_count_limit: 10,
            disk_volume_count_usage: 0,
        });

        let mut req = create_request("foo");
        req.capacity_range = Some(csi::CapacityRange {
            required_bytes: 161_061_273_600,
            limit_bytes: 0,
        });
        let err = driver.create_volume(Request::new(req)).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::OutOfRange);
        assert!(err.message().contains("50 GB"), "message: {}", err.message());
    }

    #[tokio::test]
    async fn create_volume_rejects_requests_over_volume_count() {
        let (driver, civo) = test_driver();
        civo.set_quota(Quota {
            disk_gigabytes_limit: 1_000,
            disk_volume_count_limit: 1,
            ..Default::default()
        });
        driver
            .create_volume(Request::new(create_request("first")))
            .await
            .unwrap();

        let err = driver
            .create_volume(Request::new(create_request("second")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::OutOfRange);
    }

    #[tokio::test]
    async fn create_volume_is_idempotent_for_matching_name_and_size() {
        let (driver, civo) = test_driver();

        let first = driver
            .create_volume(Request::new(create_request("foo")))
            .await
            .unwrap()
            .into_inner();
        let second = driver
            .create_volume(Request::new(create_request("foo")))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(
            first.volume.unwrap().volume_id,
            second.volume.unwrap().volume_id
        );
        // Exactly one volume was created by the provider.
        assert_eq!(civo.list_volumes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_volume_conflicts_on_same_name_with_different_size() {
        let (driver, _) = test_driver();

        driver
            .create_volume(Request::new(create_request("foo")))
            .await
            .unwrap();

        let mut req = create_request("foo");
        req.capacity_range = Some(csi::CapacityRange {
            required_bytes: 20 * BYTES_PER_GIGABYTE,
            limit_bytes: 0,
        });
        let err = driver.create_volume(Request::new(req)).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::AlreadyExists);
    }

    #[tokio::test]
    async fn create_volume_passes_the_snapshot_source_through() {
        let (driver, civo) = test_driver();

        let mut req = create_request("restored");
        req.volume_content_source = Some(csi::VolumeContentSource {
            r#type: Some(csi::volume_content_source::Type::Snapshot(
                csi::volume_content_source::SnapshotSource {
                    snapshot_id: "snapshot-1".to_string(),
                },
            )),
        });
        driver.create_volume(Request::new(req)).await.unwrap();

        let config = civo.last_volume_config().unwrap();
        assert_eq!(config.snapshot_id, "snapshot-1");
    }

    #[tokio::test]
    async fn create_volume_rejects_a_snapshot_source_without_an_id() {
        let (driver, _) = test_driver();

        let mut req = create_request("restored");
        req.volume_content_source = Some(csi::VolumeContentSource {
            r#type: Some(csi::volume_content_source::Type::Snapshot(
                csi::volume_content_source::SnapshotSource::default(),
            )),
        });
        let err = driver.create_volume(Request::new(req)).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn delete_volume_removes_the_volume() {
        let (driver, civo) = test_driver();
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        driver
            .delete_volume(Request::new(csi::DeleteVolumeRequest {
                volume_id: volume.id,
                ..Default::default()
            }))
            .await
            .unwrap();

        assert!(civo.list_volumes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_volume_succeeds_for_missing_volumes() {
        let (driver, _) = test_driver();
        driver
            .delete_volume(Request::new(csi::DeleteVolumeRequest {
                volume_id: "already-gone".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_volume_requires_a_volume_id() {
        let (driver, _) = test_driver();
        let err = driver
            .delete_volume(Request::new(csi::DeleteVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn publish_attaches_the_volume_to_the_instance() {
        let (driver, civo) = test_driver();
        register_test_cluster(&civo, "i-12345678");
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        driver
            .controller_publish_volume(Request::new(csi::ControllerPublishVolumeRequest {
                volume_id: volume.id.clone(),
                node_id: "i-12345678".to_string(),
                volume_capability: Some(csi::VolumeCapability::default()),
                ..Default::default()
            }))
            .await
            .unwrap();

        let volumes = civo.list_volumes().await.unwrap();
        assert_eq!(volumes[0].instance_id, "i-12345678");
        assert_eq!(volumes[0].status, VolumeStatus::Attached);
    }

    #[tokio::test]
    async fn publish_is_idempotent_when_already_attached() {
        let (driver, civo) = test_driver();
        register_test_cluster(&civo, "i-12345678");
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        civo.attach_volume(
            &volume.id,
            &VolumeAttachConfig {
                instance_id: "i-12345678".to_string(),
                region: "TEST1".to_string(),
            },
        )
        .await
        .unwrap();

        driver
            .controller_publish_volume(Request::new(csi::ControllerPublishVolumeRequest {
                volume_id: volume.id,
                node_id: "i-12345678".to_string(),
                volume_capability: Some(csi::VolumeCapability::default()),
                ..Default::default()
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_rejects_nodes_outside_the_cluster() {
        let (driver, civo) = test_driver();
        register_test_cluster(&civo, "i-12345678");
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        let err = driver
            .controller_publish_volume(Request::new(csi::ControllerPublishVolumeRequest {
                volume_id: volume.id,
                node_id: "i-stranger".to_string(),
                volume_capability: Some(csi::VolumeCapability::default()),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn publish_rejects_volumes_attached_elsewhere() {
        let (driver, civo) = test_driver();
        register_test_cluster(&civo, "i-12345678");
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        civo.attach_volume(
            &volume.id,
            &VolumeAttachConfig {
                instance_id: "other-instance".to_string(),
                region: "TEST1".to_string(),
            },
        )
        .await
        .unwrap();

        let err = driver
            .controller_publish_volume(Request::new(csi::ControllerPublishVolumeRequest {
                volume_id: volume.id.clone(),
                node_id: "i-12345678".to_string(),
                volume_capability: Some(csi::VolumeCapability::default()),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);

        // The attachment must not have been stolen.
        let fetched = civo.get_volume(&volume.id).await.unwrap();
        assert_eq!(fetched.instance_id, "other-instance");
    }

    #[tokio::test]
    async fn publish_requires_all_arguments() {
        let (driver, _) = test_driver();
        let err = driver
            .controller_publish_volume(Request::new(csi::ControllerPublishVolumeRequest {
                volume_id: "volume-1".to_string(),
                node_id: "i-12345678".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn unpublish_detaches_the_volume() {
        let (driver, civo) = test_driver();
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        civo.attach_volume(
            &volume.id,
            &VolumeAttachConfig {
                instance_id: "instance-1".to_string(),
                region: "TEST1".to_string(),
            },
        )
        .await
        .unwrap();

        driver
            .controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
                volume_id: volume.id.clone(),
                node_id: "instance-1".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();

        let fetched = civo.get_volume(&volume.id).await.unwrap();
        assert_eq!(fetched.status, VolumeStatus::Available);
        assert!(fetched.instance_id.is_empty());
    }

    #[tokio::test]
    async fn unpublish_ignores_volumes_attached_to_another_node() {
        let (driver, civo) = test_driver();
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        civo.attach_volume(
            &volume.id,
            &VolumeAttachConfig {
                instance_id: "other-instance".to_string(),
                region: "TEST1".to_string(),
            },
        )
        .await
        .unwrap();

        driver
            .controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
                volume_id: volume.id.clone(),
                node_id: "this-instance".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();

        // The attachment is untouched.
        let fetched = civo.get_volume(&volume.id).await.unwrap();
        assert_eq!(fetched.instance_id, "other-instance");
        assert_eq!(fetched.status, VolumeStatus::Attached);
    }

    #[tokio::test]
    async fn unpublish_succeeds_when_the_volume_is_gone() {
        let (driver, _) = test_driver();
        driver
            .controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
                volume_id: "already-gone".to_string(),
                node_id: "instance-1".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expand_grows_the_volume_offline() {
        let (driver, civo) = test_driver();
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        let resp = driver
            .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
                volume_id: volume.id.clone(),
                capacity_range: Some(csi::CapacityRange {
                    required_bytes: 20 * BYTES_PER_GIGABYTE,
                    limit_bytes: 0,
                }),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(resp.capacity_bytes, 21_474_836_480);
        assert!(resp.node_expansion_required);
        assert_eq!(civo.get_volume(&volume.id).await.unwrap().size_gigabytes, 20);
    }

    #[tokio::test]
    async fn expand_rejects_attached_volumes() {
        let (driver, civo) = test_driver();
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        civo.attach_volume(
            &volume.id,
            &VolumeAttachConfig {
                instance_id: "instance-1".to_string(),
                region: "TEST1".to_string(),
            },
        )
        .await
        .unwrap();

        let err = driver
            .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
                volume_id: volume.id,
                capacity_range: Some(csi::CapacityRange {
                    required_bytes: 20 * BYTES_PER_GIGABYTE,
                    limit_bytes: 0,
                }),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn expand_to_a_smaller_size_is_a_no_op() {
        let (driver, civo) = test_driver();
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 20,
                ..Default::default()
            })
            .await
            .unwrap();

        let resp = driver
            .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
                volume_id: volume.id.clone(),
                capacity_range: Some(csi::CapacityRange {
                    required_bytes: 10 * BYTES_PER_GIGABYTE,
                    limit_bytes: 0,
                }),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(resp.capacity_bytes, 20 * BYTES_PER_GIGABYTE);
        assert!(resp.node_expansion_required);
        assert_eq!(civo.get_volume(&volume.id).await.unwrap().size_gigabytes, 20);
    }

    #[tokio::test]
    async fn expand_aborts_while_a_resize_is_in_flight() {
        let (driver, civo) = test_driver();
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        civo.set_volume_status(&volume.id, VolumeStatus::Resizing);

        let err = driver
            .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
                volume_id: volume.id,
                capacity_range: Some(csi::CapacityRange {
                    required_bytes: 20 * BYTES_PER_GIGABYTE,
                    limit_bytes: 0,
                }),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);
    }

    #[tokio::test]
    async fn expand_requires_a_capacity_range() {
        let (driver, civo) = test_driver();
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        let err = driver
            .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
                volume_id: volume.id,
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn validate_capabilities_echoes_supported_modes() {
        let (driver, civo) = test_driver();
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        let resp = driver
            .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
                volume_id: volume.id,
                volume_capabilities: vec![single_writer_mount()],
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        let confirmed = resp.confirmed.unwrap();
        assert_eq!(confirmed.volume_capabilities.len(), 1);
    }

    #[tokio::test]
    async fn validate_capabilities_rejects_unknown_volumes_and_modes() {
        let (driver, civo) = test_driver();

        let err = driver
            .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
                volume_id: "missing".to_string(),
                volume_capabilities: vec![single_writer_mount()],
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);

        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        let err = driver
            .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
                volume_id: volume.id,
                volume_capabilities: vec![mount_capability(
                    csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter,
                )],
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn list_volumes_reports_capacity_in_bytes() {
        let (driver, civo) = test_driver();
        civo.create_volume(&VolumeConfig {
            name: "foo".to_string(),
            size_gigabytes: 25,
            ..Default::default()
        })
        .await
        .unwrap();

        let resp = driver
            .list_volumes(Request::new(csi::ListVolumesRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.entries.len(), 1);
        assert_eq!(
            resp.entries[0].volume.as_ref().unwrap().capacity_bytes,
            25 * BYTES_PER_GIGABYTE
        );
    }

    #[tokio::test]
    async fn list_volumes_does_not_support_paging() {
        let (driver, _) = test_driver();
        let err = driver
            .list_volumes(Request::new(csi::ListVolumesRequest {
                starting_token: "page-2".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);
    }

    #[tokio::test]
    async fn get_capacity_reports_quota_headroom() {
        let (driver, civo) = test_driver();
        civo.set_quota(Quota {
            disk_gigabytes_limit: 100,
            disk_volume_count_limit: 10,
            ..Default::default()
        });
        civo.create_volume(&VolumeConfig {
            name: "foo".to_string(),
            size_gigabytes: 30,
            ..Default::default()
        })
        .await
        .unwrap();

        let resp = driver
            .get_capacity(Request::new(csi::GetCapacityRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.available_capacity, 70 * BYTES_PER_GIGABYTE);
    }

    #[tokio::test]
    async fn get_capacity_is_zero_at_the_volume_count_limit() {
        let (driver, civo) = test_driver();
        civo.set_quota(Quota {
            disk_gigabytes_limit: 100,
            disk_volume_count_limit: 1,
            ..Default::default()
        });
        civo.create_volume(&VolumeConfig {
            name: "foo".to_string(),
            size_gigabytes: 10,
            ..Default::default()
        })
        .await
        .unwrap();

        let resp = driver
            .get_capacity(Request::new(csi::GetCapacityRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.available_capacity, 0);
    }

    #[tokio::test]
    async fn controller_capabilities_include_snapshots_and_expansion() {
        let (driver, _) = test_driver();
        let resp = driver
            .controller_get_capabilities(Request::new(
                csi::ControllerGetCapabilitiesRequest {},
            ))
            .await
            .unwrap()
            .into_inner();

        use csi_grpc::v1::controller_service_capability::rpc::Type;
        let advertised: Vec<i32> = resp
            .capabilities
            .iter()
            .filter_map(|capability| match &capability.r#type {
                Some(csi::controller_service_capability::Type::Rpc(rpc)) => Some(rpc.r#type),
                None => None,
            })
            .collect();
        for expected in [
            Type::CreateDeleteVolume,
            Type::PublishUnpublishVolume,
            Type::ListVolumes,
            Type::GetCapacity,
            Type::ExpandVolume,
            Type::CreateDeleteSnapshot,
            Type::ListSnapshots,
        ] {
            assert!(advertised.contains(&(expected as i32)));
        }
    }

    async fn volume_with_snapshot(civo: &FakeClient) -> (Volume, VolumeSnapshot) {
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        let snapshot = civo
            .create_volume_snapshot(
                &volume.id,
                &VolumeSnapshotConfig {
                    name: "snap".to_string(),
                },
            )
            .await
            .unwrap();
        (volume, snapshot)
    }

    #[tokio::test]
    async fn create_snapshot_returns_the_provider_record() {
        let (driver, civo) = test_driver();
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        let resp = driver
            .create_snapshot(Request::new(csi::CreateSnapshotRequest {
                source_volume_id: volume.id.clone(),
                name: "backup".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        let snapshot = resp.snapshot.unwrap();
        assert_eq!(snapshot.source_volume_id, volume.id);
        assert_eq!(snapshot.size_bytes, 10 * BYTES_PER_GIGABYTE);
        assert!(snapshot.ready_to_use);
        assert!(snapshot.creation_time.is_some());
    }

    #[tokio::test]
    async fn create_snapshot_is_idempotent_for_the_same_source() {
        let (driver, civo) = test_driver();
        let (volume, snapshot) = volume_with_snapshot(&civo).await;

        let resp = driver
            .create_snapshot(Request::new(csi::CreateSnapshotRequest {
                source_volume_id: volume.id,
                name: "snap".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(resp.snapshot.unwrap().snapshot_id, snapshot.snapshot_id);
        assert_eq!(civo.list_volume_snapshots().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_snapshot_conflicts_across_source_volumes() {
        let (driver, civo) = test_driver();
        let (_, _) = volume_with_snapshot(&civo).await;

        let err = driver
            .create_snapshot(Request::new(csi::CreateSnapshotRequest {
                source_volume_id: "some-other-volume".to_string(),
                name: "snap".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::AlreadyExists);
    }

    #[tokio::test]
    async fn create_snapshot_maps_quota_exhaustion() {
        let (driver, civo) = test_driver();
        let volume = civo
            .create_volume(&VolumeConfig {
                name: "foo".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        civo.set_snapshot_limit(0);

        let err = driver
            .create_snapshot(Request::new(csi::CreateSnapshotRequest {
                source_volume_id: volume.id,
                name: "backup".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn delete_snapshot_is_idempotent() {
        let (driver, civo) = test_driver();
        let (_, snapshot) = volume_with_snapshot(&civo).await;

        driver
            .delete_snapshot(Request::new(csi::DeleteSnapshotRequest {
                snapshot_id: snapshot.snapshot_id.clone(),
                ..Default::default()
            }))
            .await
            .unwrap();
        // Second delete sees "not found" and still succeeds.
        driver
            .delete_snapshot(Request::new(csi::DeleteSnapshotRequest {
                snapshot_id: snapshot.snapshot_id,
                ..Default::default()
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_snapshot_in_use_is_a_failed_precondition() {
        let (driver, civo) = test_driver();
        let (_, snapshot) = volume_with_snapshot(&civo).await;
        civo.set_snapshot_state(&snapshot.snapshot_id, "in_use");

        let err = driver
            .delete_snapshot(Request::new(csi::DeleteSnapshotRequest {
                snapshot_id: snapshot.snapshot_id,
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn list_snapshots_filters_and_sorts() {
        let (driver, civo) = test_driver();
        let volume_a = civo
            .create_volume(&VolumeConfig {
                name: "a".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        let volume_b = civo
            .create_volume(&VolumeConfig {
                name: "b".to_string(),
                size_gigabytes: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        for (volume, name) in [
            (&volume_b, "snap-b"),
            (&volume_a, "snap-a1"),
            (&volume_a, "snap-a2"),
        ] {
            civo.create_volume_snapshot(
                &volume.id,
                &VolumeSnapshotConfig {
                    name: name.to_string(),
                },
            )
            .await
            .unwrap();
        }

        // Unfiltered, sorted ascending by snapshot id.
        let resp = driver
            .list_snapshots(Request::new(csi::ListSnapshotsRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.entries.len(), 3);
        let ids: Vec<&str> = resp
            .entries
            .iter()
            .map(|e| e.snapshot.as_ref().unwrap().snapshot_id.as_str())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        // Filtered by source volume.
        let resp = driver
            .list_snapshots(Request::new(csi::ListSnapshotsRequest {
                source_volume_id: volume_a.id.clone(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.entries.len(), 2);
        assert!(resp
            .entries
            .iter()
            .all(|e| e.snapshot.as_ref().unwrap().source_volume_id == volume_a.id));
    }

    #[tokio::test]
    async fn list_snapshots_by_id_returns_one_entry_or_none() {
        let (driver, civo) = test_driver();
        let (volume, snapshot) = volume_with_snapshot(&civo).await;

        let resp = driver
            .list_snapshots(Request::new(csi::ListSnapshotsRequest {
                snapshot_id: snapshot.snapshot_id.clone(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.entries.len(), 1);

        let resp = driver
            .list_snapshots(Request::new(csi::ListSnapshotsRequest {
                snapshot_id: snapshot.snapshot_id,
                source_volume_id: volume.id,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.entries.len(), 1);

        let resp = driver
            .list_snapshots(Request::new(csi::ListSnapshotsRequest {
                snapshot_id: "missing".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.entries.is_empty());
    }

    #[tokio::test]
    async fn list_snapshots_does_not_support_paging() {
        let (driver, _) = test_driver();
        let err = driver
            .list_snapshots(Request::new(csi::ListSnapshotsRequest {
                starting_token: "page-2".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);
    }

    #[tokio::test]
    async fn controller_get_volume_is_unimplemented() {
        let (driver, _) = test_driver();
        let err = driver
            .controller_get_volume(Request::new(csi::ControllerGetVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unimplemented);
    }
}
