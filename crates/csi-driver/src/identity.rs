//! The CSI Identity service: static plugin metadata and a provider
//! reachability probe.

use crate::driver::Driver;
use crate::{DRIVER_NAME, VERSION};

use csi_grpc::v1 as csi;
use csi_grpc::v1::identity_server::Identity;
use tonic::{Request, Response, Status};
use tracing::info;

#[tonic::async_trait]
impl Identity for Driver {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        info!("Request: GetPluginInfo");

        Ok(Response::new(csi::GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: VERSION.to_string(),
            ..Default::default()
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        info!("Request: GetPluginCapabilities");

        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities: vec![
                csi::PluginCapability {
                    r#type: Some(csi::plugin_capability::Type::Service(
                        csi::plugin_capability::Service {
                            r#type: csi::plugin_capability::service::Type::ControllerService
                                as i32,
                        },
                    )),
                },
                csi::PluginCapability {
                    r#type: Some(csi::plugin_capability::Type::VolumeExpansion(
                        csi::plugin_capability::VolumeExpansion {
                            r#type: csi::plugin_capability::volume_expansion::Type::Offline
                                as i32,
                        },
                    )),
                },
            ],
        }))
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        self.civo.ping().await.map_err(|e| {
            Status::unavailable(format!("unable to connect to the Civo API: {}", e))
        })?;

        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}
