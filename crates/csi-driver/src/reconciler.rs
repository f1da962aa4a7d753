//! Periodic cleanup of hanging volumes.
//!
//! A provider volume whose PersistentVolume was removed outside the
//! normal CSI delete path (e.g. a force-deleted PV) would otherwise
//! keep accruing cost forever. The reconciler deletes provider volumes
//! that are tagged with this cluster's id but have no PV of the same
//! name. Foreign and untagged volumes are never touched.

use crate::driver::Driver;

use anyhow::Context;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::{Api, ListParams};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// How often the sweep runs.
pub(crate) const RECONCILE_INTERVAL: Duration = Duration::from_secs(30 * 60);

impl Driver {
    /// Runs the hanging-volume sweep on a timer until shutdown. Does
    /// nothing when no cluster API client is configured.
    pub(crate) async fn run_reconciler(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let Some(client) = self.kube.clone() else {
            info!("No cluster API client configured, hanging volume cleanup is disabled");
            return Ok(());
        };

        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the sweep should only start
        // one full period after boot.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Checking for hanging volumes");
                    if let Err(error) = self.fix_hanging_volumes(&client).await {
                        error!(%error, "Hanging volume cleanup failed");
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// One sweep: deletes every provider volume owned by this cluster
    /// that has no PersistentVolume with a matching name. Individual
    /// delete failures are logged and skipped.
    pub(crate) async fn fix_hanging_volumes(&self, client: &kube::Client) -> anyhow::Result<()> {
        info!("Fixing hanging volumes");

        let volumes = self
            .civo
            .list_volumes()
            .await
            .context("failed to list provider volumes")?;

        let pv_api: Api<PersistentVolume> = Api::all(client.clone());
        let pvs = pv_api
            .list(&ListParams::default())
            .await
            .context("failed to list persistent volumes")?;
        let pv_names: HashSet<String> = pvs
            .items
            .into_iter()
            .filter_map(|pv| pv.metadata.name)
            .collect();

        for volume in volumes {
            if volume.cluster_id != self.cluster_id || pv_names.contains(&volume.name) {
                continue;
            }
            info!(volume_id = %volume.id, name = %volume.name, "Deleting hanging volume");
            if let Err(error) = self.civo.delete_volume(&volume.id).await {
                error!(volume_id = %volume.id, %error, "Failed to delete hanging volume");
            }
        }

        Ok(())
    }
}
