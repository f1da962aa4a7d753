//! Driver construction and the gRPC server runtime.

use crate::config::DriverConfig;
use crate::plugger::{DiskPlugger, FakeDiskPlugger};

use anyhow::Context;
use civo_api::{CivoApi, FakeClient};
use csi_grpc::v1::controller_server::ControllerServer;
use csi_grpc::v1::identity_server::IdentityServer;
use csi_grpc::v1::node_server::NodeServer;
use futures::future::BoxFuture;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::body::BoxBody;
use tonic::transport::{Body, Server};
use tower::{Layer, Service};
use tracing::{debug, error, info};

/// Default location of the Unix domain socket for this driver.
pub const DEFAULT_SOCKET_ENDPOINT: &str = "unix:///var/lib/kubelet/plugins/civo-csi/csi.sock";

/// Host-local file carrying the node's provider identity.
pub const NODE_DETAILS_FILE: &str = "/etc/civostatsd";

/// The CSI driver. One instance serves the Identity, Controller and
/// Node services; cloning is cheap and every clone shares the same
/// provider client and plugger.
#[derive(Clone)]
pub struct Driver {
    pub civo: Arc<dyn CivoApi>,
    pub plugger: Arc<dyn DiskPlugger>,
    /// Cluster API client for the hanging-volume reconciler; `None`
    /// disables reconciliation.
    pub kube: Option<kube::Client>,
    pub socket_endpoint: String,
    pub region: String,
    pub namespace: String,
    pub cluster_id: String,
    pub node_name: String,
    /// Skips settlement sleeps so tests run instantly.
    pub test_mode: bool,
    /// Location of the node identity file, normally
    /// [`NODE_DETAILS_FILE`].
    pub node_details_path: PathBuf,
}

impl Driver {
    pub fn new(
        config: &DriverConfig,
        civo: Arc<dyn CivoApi>,
        plugger: Arc<dyn DiskPlugger>,
        kube: Option<kube::Client>,
    ) -> Self {
        info!(
            api_url = %config.api_url,
            region = %config.region,
            namespace = %config.namespace,
            cluster_id = %config.cluster_id,
            socket_endpoint = %config.socket_endpoint,
            "Created a new driver"
        );

        Driver {
            civo,
            plugger,
            kube,
            socket_endpoint: config.socket_endpoint.clone(),
            region: config.region.clone(),
            namespace: config.namespace.clone(),
            cluster_id: config.cluster_id.clone(),
            node_name: config.node_name.clone(),
            test_mode: false,
            node_details_path: PathBuf::from(NODE_DETAILS_FILE),
        }
    }

    /// Returns a driver wired to in-memory fakes with settlement waits
    /// disabled, for tests.
    pub fn new_for_testing(civo: Arc<FakeClient>, plugger: Arc<FakeDiskPlugger>) -> Self {
        let civo: Arc<dyn CivoApi> = civo;
        let plugger: Arc<dyn DiskPlugger> = plugger;
        Driver {
            civo,
            plugger,
            kube: None,
            socket_endpoint: "unix:///tmp/civo-csi.sock".to_string(),
            region: "TEST1".to_string(),
            namespace: "default".to_string(),
            cluster_id: "12345678".to_string(),
            node_name: "instance-1".to_string(),
            test_mode: true,
            node_details_path: PathBuf::from("/nonexistent/civostatsd"),
        }
    }

    /// Serves the three CSI services over the configured Unix domain
    /// socket until `shutdown` completes, running the hanging-volume
    /// reconciler alongside.
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let socket_path = socket_path_from_endpoint(&self.socket_endpoint)?;
        debug!(socket_path = %socket_path.display(), "Preparing the driver socket");

        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("failed to create socket directory {}", parent.display())
            })?;
        }

        // A previous run may have left its socket file behind.
        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => debug!("Removed a stale socket file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "failed to remove stale socket file {}",
                        socket_path.display()
                    )
                })
            }
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to listen on {}", socket_path.display()))?;
        let incoming = UnixListenerStream::new(listener);

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            shutdown.await;
            let _ = shutdown_tx.send(true);
        });

        let mut server_shutdown = shutdown_rx.clone();
        let server = Server::builder()
            .layer(ErrorLoggingLayer)
            .add_service(IdentityServer::new(self.clone()))
            .add_service(ControllerServer::new(self.clone()))
            .add_service(NodeServer::new(self.clone()))
            .serve_with_incoming_shutdown(incoming, async move {
                let _ = server_shutdown.changed().await;
                debug!("Stopping gRPC because shutdown was requested");
            });

        info!(
            socket_path = %socket_path.display(),
            "Running the gRPC server, waiting for a signal to quit the process"
        );

        tokio::try_join!(
            async { server.await.context("gRPC server failed") },
            self.run_reconciler(shutdown_rx),
        )?;

        Ok(())
    }
}

/// Logs failed RPCs with the method name, so every error response is
/// observable in one place regardless of which handler produced it.
#[derive(Clone, Copy)]
struct ErrorLoggingLayer;

impl<S> Layer<S> for ErrorLoggingLayer {
    type Service = ErrorLogging<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorLogging { inner }
    }
}

#[derive(Clone)]
struct ErrorLogging<S> {
    inner: S,
}

impl<S> Service<http::Request<Body>> for ErrorLogging<S>
where
    S: Service<http::Request<Body>, Response = http::Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        // Swap the possibly-not-ready clone into self, see the tower
        // documentation on `Service::clone`.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let method = request.uri().path().to_owned();
        Box::pin(async move {
            let response = inner.call(request).await?;

            // Unary errors come back as trailers-only responses, with
            // the gRPC status in the headers.
            let grpc_status = response
                .headers()
                .get("grpc-status")
                .and_then(|status| status.to_str().ok())
                .unwrap_or("0");
            if grpc_status != "0" {
                let message = response
                    .headers()
                    .get("grpc-message")
                    .and_then(|message| message.to_str().ok())
                    .unwrap_or_default();
                error!(method = %method, grpc_status, message, "method failed");
            }

            Ok(response)
        })
    }
}

/// Extracts the filesystem path from a `unix://` endpoint URL. A bare
/// path is accepted as-is.
pub fn socket_path_from_endpoint(endpoint: &str) -> anyhow::Result<PathBuf> {
    match endpoint.strip_prefix("unix://") {
        Some("") => anyhow::bail!("socket endpoint {:?} has no path", endpoint),
        Some(path) => Ok(PathBuf::from(path)),
        None if endpoint.is_empty() => anyhow::bail!("socket endpoint is empty"),
        None if endpoint.contains("://") => {
            anyhow::bail!("unsupported socket endpoint scheme in {:?}", endpoint)
        }
        None => Ok(PathBuf::from(endpoint)),
    }
}
