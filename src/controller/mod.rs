//! Upload reconciliation controller
//!
//! Watches claims, receiver pods and receiver services, folds every event
//! into a claim key, and runs a fixed pool of workers that sync one key at a
//! time from a shared deduplicating queue.
//!
//! - [`watch`] turns the API server into [`ChangeEvent`] streams
//! - [`cache`] keeps the local index each lookup is served from
//! - [`queue`] hands keys to workers, never the same key to two at once
//! - `sync` holds the per-claim algorithm

mod cache;
mod queue;
mod sync;
mod watch;

pub use cache::Cache;
pub use queue::WorkQueue;
pub use watch::{ChangeEvent, KubeWatchSource, WatchSource};

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::claim::{owning_claim, ObjectKey};
use crate::retry::RetryConfig;
use crate::workload::{Provisioner, ReceiverTemplate, WorkloadClient};
use crate::Error;

/// Default deadline for the initial list of all three caches
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Event sources for the three watched kinds
#[derive(Clone)]
pub struct WatchSources {
    /// Storage claims
    pub claims: Arc<dyn WatchSource<PersistentVolumeClaim>>,
    /// Receiver pods
    pub pods: Arc<dyn WatchSource<Pod>>,
    /// Receiver services
    pub services: Arc<dyn WatchSource<Service>>,
}

impl WatchSources {
    /// Watch all three kinds through the API server
    pub fn kube(client: Client, namespace: Option<String>) -> Self {
        let source = Arc::new(KubeWatchSource::new(client, namespace));
        Self {
            claims: source.clone(),
            pods: source.clone(),
            services: source,
        }
    }
}

/// Reconciles upload receivers for annotated claims
#[derive(Clone)]
pub struct UploadController {
    claims: Cache<PersistentVolumeClaim>,
    pods: Cache<Pod>,
    services: Cache<Service>,
    queue: WorkQueue<String>,
    client: Arc<dyn WorkloadClient>,
    provisioner: Provisioner,
    sources: WatchSources,
    cache_sync_timeout: Duration,
}

impl UploadController {
    /// Create a controller; nothing runs until [`run`](Self::run)
    pub fn new(
        client: Arc<dyn WorkloadClient>,
        sources: WatchSources,
        template: ReceiverTemplate,
        retry: RetryConfig,
        cache_sync_timeout: Duration,
    ) -> Self {
        let pods = Cache::new();
        let services = Cache::new();
        let provisioner =
            Provisioner::new(client.clone(), template, pods.clone(), services.clone());
        Self {
            claims: Cache::new(),
            pods,
            services,
            queue: WorkQueue::new(retry),
            client,
            provisioner,
            sources,
            cache_sync_timeout,
        }
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Fails fast on a non-positive `threadiness` and when the caches do not
    /// finish their initial list within the sync deadline. On shutdown the
    /// queue stops accepting keys and every worker is joined before returning.
    pub async fn run(self, threadiness: i32, shutdown: CancellationToken) -> Result<(), Error> {
        if threadiness < 1 {
            return Err(Error::config(format!(
                "expected >0 threads, got {threadiness}"
            )));
        }

        info!(threadiness, "starting upload controller");
        let mut pumps = JoinSet::new();
        pumps.spawn(pump_claims(
            self.sources.claims.watch(),
            self.claims.clone(),
            self.queue.clone(),
        ));
        pumps.spawn(pump_owned(
            "Pod",
            self.sources.pods.watch(),
            self.pods.clone(),
            self.claims.clone(),
            self.queue.clone(),
        ));
        pumps.spawn(pump_owned(
            "Service",
            self.sources.services.watch(),
            self.services.clone(),
            self.claims.clone(),
            self.queue.clone(),
        ));

        info!("waiting for informer caches to sync");
        let synced = async {
            tokio::join!(
                self.claims.wait_synced(),
                self.pods.wait_synced(),
                self.services.wait_synced()
            )
        };
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested before caches synced");
                pumps.abort_all();
                return Ok(());
            }
            result = tokio::time::timeout(self.cache_sync_timeout, synced) => {
                if result.is_err() {
                    pumps.abort_all();
                    return Err(Error::CacheSync(format!(
                        "caches not synced within {:?}",
                        self.cache_sync_timeout
                    )));
                }
            }
        }

        info!("starting workers");
        let mut workers = JoinSet::new();
        for _ in 0..threadiness {
            let worker = self.clone();
            workers.spawn(async move { while worker.process_next_item().await {} });
        }

        shutdown.cancelled().await;
        info!("shutting down workers");
        self.queue.shut_down();
        while workers.join_next().await.is_some() {}
        pumps.abort_all();
        info!("upload controller stopped");
        Ok(())
    }

    /// The shared work queue, keyed by `namespace/name`
    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }
}

async fn pump_claims(
    mut events: BoxStream<'static, ChangeEvent<PersistentVolumeClaim>>,
    claims: Cache<PersistentVolumeClaim>,
    queue: WorkQueue<String>,
) {
    while let Some(event) = events.next().await {
        let key = match &event {
            ChangeEvent::Applied(claim) => ObjectKey::for_object(claim),
            _ => None,
        };
        claims.apply(event);
        if let Some(key) = key {
            queue.add(key.to_string());
        }
    }
}

async fn pump_owned<K>(
    kind: &'static str,
    mut events: BoxStream<'static, ChangeEvent<K>>,
    cache: Cache<K>,
    claims: Cache<PersistentVolumeClaim>,
    queue: WorkQueue<String>,
) where
    K: kube::Resource,
{
    while let Some(event) = events.next().await {
        for key in owner_to_enqueue(kind, event, &cache, &claims) {
            queue.add(key.to_string());
        }
    }
}

/// Apply an owned-object event and map it back to the claims that own it
///
/// Updates that did not change the resource version are dropped, and so are
/// objects whose owning claim is not cached. Objects evicted when a relist
/// completes are treated like deletes.
fn owner_to_enqueue<K: kube::Resource>(
    kind: &str,
    event: ChangeEvent<K>,
    cache: &Cache<K>,
    claims: &Cache<PersistentVolumeClaim>,
) -> Vec<ObjectKey> {
    let owners: Vec<ObjectKey> = match event {
        ChangeEvent::Applied(obj) => {
            let owner = owning_claim(obj.meta());
            let version = obj.meta().resource_version.clone();
            let previous = cache.insert(obj);
            let unchanged = version.is_some()
                && previous.is_some_and(|p| p.meta().resource_version == version);
            if unchanged {
                return Vec::new();
            }
            owner.into_iter().collect()
        }
        ChangeEvent::Deleted(obj) => {
            let owner = owning_claim(obj.meta());
            cache.apply(ChangeEvent::Deleted(obj));
            owner.into_iter().collect()
        }
        ChangeEvent::Relisting => {
            cache.apply(ChangeEvent::Relisting);
            return Vec::new();
        }
        ChangeEvent::Synced => {
            let evicted = cache.apply(ChangeEvent::Synced);
            if !evicted.is_empty() {
                debug!(%kind, count = evicted.len(), "relist evicted objects");
            }
            evicted
                .iter()
                .filter_map(|obj| owning_claim(obj.meta()))
                .collect()
        }
    };

    owners
        .into_iter()
        .filter(|owner| {
            let cached = claims.get_key(owner).is_some();
            if !cached {
                debug!(%kind, claim = %owner, "ignoring orphaned object");
            }
            cached
        })
        .collect()
}
