//! Local read-through index rebuilt from a watch stream
//!
//! Every lookup the controller makes is served from a [`Cache`]; the API
//! server is only contacted for writes. The cache reports when its initial
//! list is complete so workers never act on a partial view.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use super::watch::ChangeEvent;
use crate::claim::ObjectKey;

struct CacheState<K> {
    objects: HashMap<ObjectKey, Arc<K>>,
    /// Keys seen since the current relist started
    relist: Option<HashSet<ObjectKey>>,
}

/// Shared, cloneable index of one object kind keyed by `namespace/name`
pub struct Cache<K> {
    state: Arc<RwLock<CacheState<K>>>,
    synced: Arc<watch::Sender<bool>>,
}

impl<K> Clone for Cache<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> Default for Cache<K>
where
    K: kube::Resource,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Cache<K>
where
    K: kube::Resource,
{
    /// Create an empty, unsynced cache
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            state: Arc::new(RwLock::new(CacheState {
                objects: HashMap::new(),
                relist: None,
            })),
            synced: Arc::new(synced),
        }
    }

    /// Look up an object by namespace and name
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get_key(&ObjectKey::new(namespace, name))
    }

    /// Look up an object by key
    pub fn get_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.state.read().objects.get(key).cloned()
    }

    /// Store an object, returning the previous version
    pub fn insert(&self, obj: K) -> Option<Arc<K>> {
        let key = ObjectKey::for_object(&obj)?;
        let mut state = self.state.write();
        if let Some(seen) = state.relist.as_mut() {
            seen.insert(key.clone());
        }
        state.objects.insert(key, Arc::new(obj))
    }

    /// Drop an object, returning what was stored
    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.state.write().objects.remove(key)
    }

    /// Apply one watch event, returning every version it replaced or evicted
    ///
    /// A `Synced` that closes a relist evicts the objects the relist did not
    /// see again; those are the deletes the watch missed while disconnected.
    pub fn apply(&self, event: ChangeEvent<K>) -> Vec<Arc<K>> {
        match event {
            ChangeEvent::Applied(obj) => self.insert(obj).into_iter().collect(),
            ChangeEvent::Deleted(obj) => ObjectKey::for_object(&obj)
                .and_then(|key| self.remove(&key))
                .into_iter()
                .collect(),
            ChangeEvent::Relisting => {
                self.state.write().relist = Some(HashSet::new());
                Vec::new()
            }
            ChangeEvent::Synced => {
                let mut state = self.state.write();
                let evicted = match state.relist.take() {
                    Some(seen) => {
                        let stale: Vec<ObjectKey> = state
                            .objects
                            .keys()
                            .filter(|key| !seen.contains(*key))
                            .cloned()
                            .collect();
                        stale
                            .iter()
                            .filter_map(|key| state.objects.remove(key))
                            .collect()
                    }
                    None => Vec::new(),
                };
                drop(state);
                self.synced.send_replace(true);
                evicted
            }
        }
    }

    /// Whether the initial list has completed
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial list has completed
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as this cache, so the wait cannot fail
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.state.read().objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::time::Duration;

    fn pod(name: &str, version: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn applied_objects_are_indexed_by_key() {
        let cache = Cache::<Pod>::new();
        assert!(cache.apply(ChangeEvent::Applied(pod("a", "1"))).is_empty());
        let previous = cache.apply(ChangeEvent::Applied(pod("a", "2"))).pop().unwrap();

        assert_eq!(previous.metadata.resource_version.as_deref(), Some("1"));
        let current = cache.get("ns1", "a").unwrap();
        assert_eq!(current.metadata.resource_version.as_deref(), Some("2"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn deletes_remove_objects() {
        let cache = Cache::<Pod>::new();
        cache.apply(ChangeEvent::Applied(pod("a", "1")));
        assert_eq!(cache.apply(ChangeEvent::Deleted(pod("a", "1"))).len(), 1);
        assert!(cache.get("ns1", "a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn objects_without_namespace_are_ignored() {
        let cache = Cache::<Pod>::new();
        let mut cluster_scoped = pod("a", "1");
        cluster_scoped.metadata.namespace = None;
        cache.apply(ChangeEvent::Applied(cluster_scoped));
        assert!(cache.is_empty());
    }

    /// Story: objects deleted while the watch was disconnected disappear on relist
    #[test]
    fn story_relist_drops_objects_not_seen_again() {
        let cache = Cache::<Pod>::new();
        cache.apply(ChangeEvent::Applied(pod("kept", "1")));
        cache.apply(ChangeEvent::Applied(pod("gone", "1")));
        cache.apply(ChangeEvent::Synced);

        cache.apply(ChangeEvent::Relisting);
        cache.apply(ChangeEvent::Applied(pod("kept", "2")));
        let evicted = cache.apply(ChangeEvent::Synced);

        assert!(cache.get("ns1", "kept").is_some());
        assert!(cache.get("ns1", "gone").is_none());
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].metadata.name.as_deref(), Some("gone"));
    }

    #[test]
    fn initial_sync_evicts_nothing() {
        let cache = Cache::<Pod>::new();
        cache.apply(ChangeEvent::Relisting);
        cache.apply(ChangeEvent::Applied(pod("a", "1")));
        assert!(cache.apply(ChangeEvent::Synced).is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn wait_synced_resolves_after_initial_list() {
        let cache = Cache::<Pod>::new();
        assert!(!cache.has_synced());

        let waiter = cache.clone();
        let handle = tokio::spawn(async move { waiter.wait_synced().await });

        cache.apply(ChangeEvent::Relisting);
        cache.apply(ChangeEvent::Applied(pod("a", "1")));
        cache.apply(ChangeEvent::Synced);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait_synced should resolve")
            .unwrap();
        assert!(cache.has_synced());
    }
}
