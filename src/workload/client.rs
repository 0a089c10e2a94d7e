//! Cluster write path for receiver workloads and claim annotations

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Trait abstracting the Kubernetes writes the controller performs
///
/// Reads go through the local watch caches; only mutations hit the API
/// server. This allows mocking the cluster in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Create a receiver pod, returning the stored object
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod; absence is success
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a receiver service, returning the stored object
    async fn create_service(&self, service: &Service) -> Result<Service, Error>;

    /// Delete a service; absence is success
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Merge the given annotations onto a claim, returning the updated claim
    async fn annotate_claim(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<PersistentVolumeClaim, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeWorkloadClient {
    client: Client,
}

impl KubeWorkloadClient {
    /// Create a new KubeWorkloadClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn delete_ignoring_absent<K>(&self, namespace: &str, name: &str) -> Result<(), Error>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(%namespace, %name, "object already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String, Error> {
    obj.namespace()
        .ok_or_else(|| Error::internal(format!("{} has no namespace", obj.name_any())))
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace_of(pod)?);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete_ignoring_absent::<Pod>(namespace, name).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace_of(service)?);
        Ok(api.create(&PostParams::default(), service).await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete_ignoring_absent::<Service>(namespace, name)
            .await
    }

    async fn annotate_claim(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "annotations": annotations
            }
        });
        Ok(api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}
