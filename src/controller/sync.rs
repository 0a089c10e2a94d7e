//! Per-claim sync and worker dispatch

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tracing::{debug, error, info, instrument, warn};

use super::UploadController;
use crate::claim::{
    is_terminal_phase, mirrored_phase, upload_requested, ObjectKey, ANN_UPLOAD_POD_PHASE,
};
use crate::Error;

impl UploadController {
    /// Bring one claim's receiver workload in line with its annotations
    ///
    /// Safe to re-run from any point: every step either observes the state it
    /// wants or converges to it.
    #[instrument(skip_all, fields(claim = %key))]
    pub async fn sync_claim(&self, key: &str) -> Result<(), Error> {
        let key: ObjectKey = key.parse()?;
        let Some(claim) = self.claims.get_key(&key) else {
            debug!("claim no longer exists");
            return Ok(());
        };

        if !upload_requested(&claim) {
            self.provisioner.delete_pod(&claim).await?;
            self.provisioner.delete_service(&claim).await?;
            return Ok(());
        }

        let pod = self.provisioner.get_or_create_pod(&claim).await?;
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default();

        if phase != mirrored_phase(&claim) {
            self.mirror_phase(&key, phase).await?;
        }

        if is_terminal_phase(phase) {
            self.provisioner.delete_service(&claim).await?;
        } else {
            self.provisioner.get_or_create_service(&claim).await?;
        }
        Ok(())
    }

    async fn mirror_phase(&self, key: &ObjectKey, phase: &str) -> Result<(), Error> {
        let annotations = BTreeMap::from([(ANN_UPLOAD_POD_PHASE.to_string(), phase.to_string())]);
        let updated: PersistentVolumeClaim = self
            .client
            .annotate_claim(&key.namespace, &key.name, annotations)
            .await?;
        info!(%phase, "mirrored receiver phase onto claim");
        self.claims.insert(updated);
        Ok(())
    }

    /// Take one key from the queue and sync it
    ///
    /// Returns `false` once the queue is shut down and drained.
    pub(super) async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.sync_claim(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(e) if !e.is_retryable() => {
                error!(claim = %key, error = %e, "dropping key, error is not retryable");
                self.queue.forget(&key);
            }
            Err(e) if e.is_conflict() || !self.queue.is_exhausted(&key) => {
                warn!(
                    claim = %key,
                    error = %e,
                    attempts = self.queue.num_requeues(&key),
                    "sync failed, requeueing"
                );
                self.queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                error!(claim = %key, error = %e, "dropping key after repeated failures");
                self.queue.forget(&key);
            }
        }
        self.queue.done(&key);
        true
    }
}
