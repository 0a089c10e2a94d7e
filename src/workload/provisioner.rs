//! Get-or-create and idempotent delete for receiver objects
//!
//! Lookups are served from the watch caches. Objects we create or delete are
//! written through so the next sync of the same key does not act on a stale
//! view before the watch catches up.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::client::WorkloadClient;
use super::template::{build_pod, build_service, ReceiverTemplate};
use crate::claim::{is_controlled_by, receiver_name, ObjectKey};
use crate::controller::Cache;
use crate::Error;

/// Creates and removes the receiver pod and service for claims
#[derive(Clone)]
pub struct Provisioner {
    client: Arc<dyn WorkloadClient>,
    template: ReceiverTemplate,
    pods: Cache<Pod>,
    services: Cache<Service>,
}

impl Provisioner {
    /// Create a provisioner writing through `client` and reading from the caches
    pub fn new(
        client: Arc<dyn WorkloadClient>,
        template: ReceiverTemplate,
        pods: Cache<Pod>,
        services: Cache<Service>,
    ) -> Self {
        Self {
            client,
            template,
            pods,
            services,
        }
    }

    /// Return the claim's receiver pod, creating it when absent
    ///
    /// A pod with the receiver name that the claim does not control is a
    /// conflict and is never adopted.
    pub async fn get_or_create_pod(&self, claim: &PersistentVolumeClaim) -> Result<Arc<Pod>, Error> {
        let key = receiver_key(claim)?;
        if let Some(pod) = self.pods.get_key(&key) {
            ensure_controlled("pod", &key, pod.as_ref(), claim)?;
            return Ok(pod);
        }

        let pod = build_pod(&self.template, &key.name, claim);
        let created = self.client.create_pod(&pod).await?;
        info!(pod = %key, claim = %claim.name_any(), "created upload receiver pod");
        self.pods.insert(created.clone());
        Ok(Arc::new(created))
    }

    /// Return the claim's receiver service, creating it when absent
    pub async fn get_or_create_service(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<Arc<Service>, Error> {
        let key = receiver_key(claim)?;
        if let Some(service) = self.services.get_key(&key) {
            ensure_controlled("service", &key, service.as_ref(), claim)?;
            return Ok(service);
        }

        let service = build_service(&key.name, claim);
        let created = self.client.create_service(&service).await?;
        info!(service = %key, claim = %claim.name_any(), "created upload receiver service");
        self.services.insert(created.clone());
        Ok(Arc::new(created))
    }

    /// Delete the claim's receiver pod if it exists and is ours
    pub async fn delete_pod(&self, claim: &PersistentVolumeClaim) -> Result<(), Error> {
        let key = receiver_key(claim)?;
        let Some(pod) = self.pods.get_key(&key) else {
            return Ok(());
        };
        if !is_controlled_by(&pod.metadata, claim) {
            warn!(pod = %key, "not deleting pod controlled by another owner");
            return Ok(());
        }
        self.client.delete_pod(&key.namespace, &key.name).await?;
        self.pods.remove(&key);
        info!(pod = %key, "deleted upload receiver pod");
        Ok(())
    }

    /// Delete the claim's receiver service if it exists and is ours
    pub async fn delete_service(&self, claim: &PersistentVolumeClaim) -> Result<(), Error> {
        let key = receiver_key(claim)?;
        let Some(service) = self.services.get_key(&key) else {
            return Ok(());
        };
        if !is_controlled_by(&service.metadata, claim) {
            warn!(service = %key, "not deleting service controlled by another owner");
            return Ok(());
        }
        self.client
            .delete_service(&key.namespace, &key.name)
            .await?;
        self.services.remove(&key);
        info!(service = %key, "deleted upload receiver service");
        Ok(())
    }
}

fn receiver_key(claim: &PersistentVolumeClaim) -> Result<ObjectKey, Error> {
    let namespace = claim
        .namespace()
        .ok_or_else(|| Error::internal(format!("claim {} has no namespace", claim.name_any())))?;
    Ok(ObjectKey::new(namespace, receiver_name(&claim.name_any())))
}

fn ensure_controlled<K: kube::Resource>(
    kind: &str,
    key: &ObjectKey,
    obj: &K,
    claim: &PersistentVolumeClaim,
) -> Result<(), Error> {
    if is_controlled_by(obj.meta(), claim) {
        debug!(%kind, object = %key, "receiver already exists");
        return Ok(());
    }
    Err(Error::conflict(format!(
        "{kind} {key} exists and is not controlled by claim {}",
        claim.name_any()
    )))
}
