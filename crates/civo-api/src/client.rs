//! HTTP implementation of [`CivoApi`].

use crate::error::ClientError;
use crate::types::*;
use crate::CivoApi;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_API_URL: &str = "https://api.civo.com";

/// A client for the Civo REST API.
///
/// Requests are authenticated with a bearer token and carry the
/// configured region as a query parameter. Connection pooling is
/// handled by the underlying `reqwest` client, so this type is cheap to
/// clone and share.
#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    api_key: String,
    region: String,
    http: reqwest::Client,
}

/// Result payload of volume creation; the full record is fetched
/// separately.
#[derive(Debug, Deserialize)]
struct VolumeResult {
    id: String,
}

/// Error body returned by the API on non-2xx responses.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    reason: String,
}

impl Client {
    /// Creates a new client. An empty `api_url` selects the public API
    /// endpoint.
    pub fn new(api_url: &str, api_key: &str, region: &str) -> Self {
        let base_url = if api_url.is_empty() {
            DEFAULT_API_URL.to_string()
        } else {
            api_url.trim_end_matches('/').to_string()
        };

        Client {
            base_url,
            api_key: api_key.to_string(),
            region: region.to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .query(&[("region", self.region.as_str())])
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body: ApiErrorBody = response.json().await.unwrap_or_default();
        debug!(status = status.as_u16(), code = %body.code, "Civo API call failed");
        Err(ClientError::Api {
            status: status.as_u16(),
            code: body.code,
            reason: body.reason,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self.send(self.request(reqwest::Method::GET, path)).await?;
        Ok(response.json().await?)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let response = self
            .send(self.request(reqwest::Method::POST, path).json(body))
            .await?;
        Ok(response.json().await?)
    }

    async fn put(&self, path: &str, body: &impl Serialize) -> Result<(), ClientError> {
        self.send(self.request(reqwest::Method::PUT, path).json(body))
            .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), ClientError> {
        self.send(self.request(reqwest::Method::DELETE, path))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CivoApi for Client {
    async fn list_volumes(&self) -> Result<Vec<Volume>, ClientError> {
        self.get_json("/v2/volumes").await
    }

    async fn get_volume(&self, id: &str) -> Result<Volume, ClientError> {
        self.get_json(&format!("/v2/volumes/{}", id)).await
    }

    async fn create_volume(&self, config: &VolumeConfig) -> Result<Volume, ClientError> {
        let result: VolumeResult = self.post_json("/v2/volumes", config).await?;
        self.get_volume(&result.id).await
    }

    async fn delete_volume(&self, id: &str) -> Result<(), ClientError> {
        self.delete(&format!("/v2/volumes/{}", id)).await
    }

    async fn attach_volume(
        &self,
        id: &str,
        config: &VolumeAttachConfig,
    ) -> Result<(), ClientError> {
        self.put(&format!("/v2/volumes/{}/attach", id), config).await
    }

    async fn detach_volume(&self, id: &str) -> Result<(), ClientError> {
        self.put(&format!("/v2/volumes/{}/detach", id), &serde_json::json!({}))
            .await
    }

    async fn resize_volume(&self, id: &str, size_gigabytes: i64) -> Result<(), ClientError> {
        self.put(
            &format!("/v2/volumes/{}/resize", id),
            &serde_json::json!({ "size_gigabytes": size_gigabytes }),
        )
        .await
    }

    async fn get_quota(&self) -> Result<Quota, ClientError> {
        self.get_json("/v2/quota").await
    }

    async fn ping(&self) -> Result<(), ClientError> {
        self.send(self.request(reqwest::Method::GET, "/v2/ping"))
            .await?;
        Ok(())
    }

    async fn get_kubernetes_cluster(
        &self,
        id: &str,
    ) -> Result<KubernetesCluster, ClientError> {
        self.get_json(&format!("/v2/kubernetes/clusters/{}", id)).await
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
        self.get_json("/v2/volumes/snapshots").await
    }

    async fn list_volume_snapshots_by_volume_id(
        &self,
        volume_id: &str,
    ) -> Result<Vec<VolumeSnapshot>, ClientError> {
        self.get_json(&format!("/v2/volumes/{}/snapshots", volume_id))
            .await
    }

    async fn get_volume_snapshot(&self, id: &str) -> Result<VolumeSnapshot, ClientError> {
        self.get_json(&format!("/v2/volumes/snapshots/{}", id)).await
    }

    async fn get_volume_snapshot_by_volume_id(
        &self,
        volume_id: &str,
        snapshot_id: &str,
    ) -> Result<VolumeSnapshot, ClientError> {
        self.get_json(&format!("/v2/volumes/{}/snapshots/{}", volume_id, snapshot_id))
            .await
    }

    async fn create_volume_snapshot(
        &self,
        volume_id: &str,
        config: &VolumeSnapshotConfig,
    ) -> Result<VolumeSnapshot, ClientError> {
        self.post_json(&format!("/v2/volumes/{}/snapshot", volume_id), config)
            .await
    }

    async fn delete_volume_snapshot(&self, id: &str) -> Result<(), ClientError> {
        self.delete(&format!("/v2/volumes/snapshots/{}", id)).await
    }
}
