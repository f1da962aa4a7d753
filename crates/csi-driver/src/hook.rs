//! Pre-stop drain coordinator.
//!
//! Invoked as a short-lived subcommand when the node agent is asked to
//! terminate. If the node is being drained, termination must wait
//! until the orchestrator has deleted every VolumeAttachment naming
//! this node; exiting earlier would leave nobody to perform the
//! unmounts those attachments require.

use futures::StreamExt;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use std::future::Future;
use tracing::{error, info, warn};

/// Taint the orchestrator places on nodes being drained
/// (`kubectl drain`).
const DRAIN_TAINT: &str = "node.kubernetes.io/unschedulable";

/// Blocks node-agent termination until the attachments for this node
/// are cleaned up.
pub struct PreStopHook {
    client: kube::Client,
    node_name: String,
}

impl PreStopHook {
    pub fn new(client: kube::Client, node_name: &str) -> anyhow::Result<Self> {
        if node_name.is_empty() {
            anyhow::bail!("node name not found");
        }
        Ok(PreStopHook {
            client,
            node_name: node_name.to_string(),
        })
    }

    /// Runs the pre-stop protocol. The wait is best-effort: when
    /// `shutdown` completes first, the hook logs and returns success.
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let drained = match nodes.get(&self.node_name).await {
            Ok(node) => is_node_drained(&node),
            // Node deletion can race agent termination; the
            // attachments may still need the wait.
            Err(kube::Error::Api(response)) if response.code == 404 => {
                info!(
                    node_name = %self.node_name,
                    "Node not found, assuming it is in the process of being removed"
                );
                true
            }
            Err(error) => return Err(error.into()),
        };

        if !drained {
            info!(
                node_name = %self.node_name,
                "Node is not being drained, skipping the VolumeAttachment cleanup check"
            );
            return Ok(());
        }

        info!(
            node_name = %self.node_name,
            "Node is being drained or removed, waiting for VolumeAttachment cleanup"
        );
        self.wait_for_volume_attachment_cleanup(shutdown).await?;
        info!(node_name = %self.node_name, "Finished waiting for VolumeAttachment cleanup");
        Ok(())
    }

    async fn wait_for_volume_attachment_cleanup<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let api: Api<VolumeAttachment> = Api::all(self.client.clone());

        // The watch stream's initial event carries a full list, so the
        // subscription is established before the first existence check
        // and no deletion can slip between the two.
        let mut events = watcher(api.clone(), watcher::Config::default()).boxed();
        futures::pin_mut!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    warn!("Stopped waiting for VolumeAttachments, some resources might still remain");
                    return Ok(());
                }
                event = events.try_next() => match event {
                    Ok(Some(watcher::Event::Restarted(attachments))) => {
                        if !attachments.iter().any(|va| self.references_node(va)) {
                            return Ok(());
                        }
                        info!(
                            node_name = %self.node_name,
                            "VolumeAttachments still reference this node"
                        );
                    }
                    Ok(Some(watcher::Event::Deleted(attachment)))
                    | Ok(Some(watcher::Event::Applied(attachment))) => {
                        if self.references_node(&attachment) {
                            match self.attachments_exist(&api).await {
                                Ok(false) => return Ok(()),
                                Ok(true) => {}
                                Err(error) => error!(
                                    %error,
                                    "Failed to check the existence of VolumeAttachments"
                                ),
                            }
                        }
                    }
                    Ok(None) => return Ok(()),
                    // The watcher recovers on its own, keep waiting.
                    Err(error) => error!(%error, "VolumeAttachment watch failed, retrying"),
                }
            }
        }
    }

    fn references_node(&self, attachment: &VolumeAttachment) -> bool {
        attachment.spec.node_name == self.node_name
    }

    /// The shared termination predicate: does any VolumeAttachment
    /// still name this node?
    async fn attachments_exist(&self, api: &Api<VolumeAttachment>) -> anyhow::Result<bool> {
        let attachments = api.list(&ListParams::default()).await?;
        for attachment in &attachments.items {
            if self.references_node(attachment) {
                info!(
                    name = attachment.metadata.name.as_deref().unwrap_or_default(),
                    node_name = %self.node_name,
                    "VolumeAttachment has not been deleted yet"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn is_node_drained(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .map(|taints| taints.iter().any(|taint| taint.key == DRAIN_TAINT))
        .unwrap_or(false)
}
