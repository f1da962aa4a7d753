//! Environment-derived driver configuration.

use crate::driver::DEFAULT_SOCKET_ENDPOINT;

use std::env;

/// Configuration the driver reads once at process start. All values
/// come from the environment; whitespace is trimmed.
#[derive(Clone, Debug, Default)]
pub struct DriverConfig {
    /// Base URL of the provider API (`CIVO_API_URL`).
    pub api_url: String,
    /// Bearer token for the provider API (`CIVO_API_KEY`).
    pub api_key: String,
    /// Region this cluster lives in (`CIVO_REGION`).
    pub region: String,
    /// Namespace tag applied to created volumes (`CIVO_NAMESPACE`).
    pub namespace: String,
    /// Cluster this driver manages volumes for (`CIVO_CLUSTER_ID`).
    pub cluster_id: String,
    /// Kubernetes name of the node this agent runs on
    /// (`KUBE_NODE_NAME`).
    pub node_name: String,
    /// gRPC endpoint URL (`CSI_ENDPOINT`).
    pub socket_endpoint: String,
}

impl DriverConfig {
    pub fn from_env() -> Self {
        let socket_endpoint = trimmed_env("CSI_ENDPOINT");
        DriverConfig {
            api_url: trimmed_env("CIVO_API_URL"),
            api_key: trimmed_env("CIVO_API_KEY"),
            region: trimmed_env("CIVO_REGION"),
            namespace: trimmed_env("CIVO_NAMESPACE"),
            cluster_id: trimmed_env("CIVO_CLUSTER_ID"),
            node_name: trimmed_env("KUBE_NODE_NAME"),
            socket_endpoint: if socket_endpoint.is_empty() {
                DEFAULT_SOCKET_ENDPOINT.to_string()
            } else {
                socket_endpoint
            },
        }
    }
}

fn trimmed_env(key: &str) -> String {
    env::var(key).map(|v| v.trim().to_string()).unwrap_or_default()
}
