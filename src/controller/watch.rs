//! Watch streams feeding the local caches
//!
//! A [`WatchSource`] turns one object kind into a stream of [`ChangeEvent`]s.
//! The kube-rs implementation wraps `kube::runtime::watcher`, which relists
//! and backs off on its own; this layer only translates its events.

use std::fmt::Debug;

use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// One change observed on a watched kind
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent<K> {
    /// Object created or updated
    Applied(K),
    /// Object deleted
    Deleted(K),
    /// A full relist is starting; objects not re-applied before `Synced` are gone
    Relisting,
    /// The initial (or re-) list is complete
    Synced,
}

/// Source of change events for one object kind
pub trait WatchSource<K>: Send + Sync {
    /// Start watching; the stream ends only when the source is dropped
    fn watch(&self) -> BoxStream<'static, ChangeEvent<K>>;
}

/// Watches a namespaced kind through the API server
#[derive(Clone)]
pub struct KubeWatchSource {
    client: Client,
    namespace: Option<String>,
}

impl KubeWatchSource {
    /// Watch in one namespace, or across all namespaces when `None`
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

/// Translate a raw watcher event, dropping errors after logging them
pub(crate) fn translate<K: Resource>(
    kind: &str,
    event: Result<Event<K>, watcher::Error>,
) -> Option<ChangeEvent<K>> {
    match event {
        Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => Some(ChangeEvent::Applied(obj)),
        Ok(Event::Delete(obj)) => Some(ChangeEvent::Deleted(obj)),
        Ok(Event::Init) => {
            debug!(%kind, "watch relisting");
            Some(ChangeEvent::Relisting)
        }
        Ok(Event::InitDone) => {
            debug!(%kind, "watch list complete");
            Some(ChangeEvent::Synced)
        }
        Err(e) => {
            warn!(error = %e, %kind, "watch error, will retry");
            None
        }
    }
}

impl<K> WatchSource<K> for KubeWatchSource
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    fn watch(&self) -> BoxStream<'static, ChangeEvent<K>> {
        let kind = K::kind(&()).to_string();
        watcher::watcher(
            self.api::<K>(),
            watcher::Config::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .default_backoff()
        .filter_map(move |event| futures::future::ready(translate(&kind, event)))
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn applies_cover_initial_and_live_events() {
        assert_eq!(
            translate("Pod", Ok(Event::Apply(pod("a")))),
            Some(ChangeEvent::Applied(pod("a")))
        );
        assert_eq!(
            translate("Pod", Ok(Event::InitApply(pod("b")))),
            Some(ChangeEvent::Applied(pod("b")))
        );
        assert_eq!(
            translate("Pod", Ok(Event::Delete(pod("c")))),
            Some(ChangeEvent::Deleted(pod("c")))
        );
    }

    #[test]
    fn list_boundaries_are_reported() {
        assert_eq!(
            translate::<Pod>("Pod", Ok(Event::Init)),
            Some(ChangeEvent::Relisting)
        );
        assert_eq!(
            translate::<Pod>("Pod", Ok(Event::InitDone)),
            Some(ChangeEvent::Synced)
        );
    }
}
