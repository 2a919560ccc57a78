//! Versioned snapshot caches, one per xDS resource type.
//!
//! Each cache holds the latest projection for its type plus an optional set of
//! static resources that are always served. Every [`SnapshotCache::update`]
//! bumps the version and wakes tasks parked in
//! [`SnapshotCache::wait_for_next`].

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use envoy_types::pb::google::protobuf::Any;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::xds::XdsResource;
use crate::{Error, Result};

#[derive(Debug)]
struct Generation<T> {
    values: BTreeMap<String, T>,
    version: u64,
}

/// Latest resources of one type, keyed by resource name.
#[derive(Debug)]
pub struct SnapshotCache<T> {
    generation: RwLock<Generation<T>>,
    statics: BTreeMap<String, T>,
    notify: watch::Sender<u64>,
}

impl<T: XdsResource> Default for SnapshotCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: XdsResource> SnapshotCache<T> {
    pub fn new() -> Self {
        Self::with_static(BTreeMap::new())
    }

    /// Cache that always serves `statics` alongside the dynamic values.
    pub fn with_static(statics: BTreeMap<String, T>) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            generation: RwLock::new(Generation { values: BTreeMap::new(), version: 0 }),
            statics,
            notify,
        }
    }

    pub fn type_url(&self) -> &'static str {
        T::TYPE_URL
    }

    pub fn version(&self) -> u64 {
        self.generation.read().unwrap_or_else(|e| e.into_inner()).version
    }

    /// Replace the dynamic contents and publish a new version. Returns the
    /// version assigned to this update.
    pub fn update(&self, values: BTreeMap<String, T>) -> u64 {
        let _span = crate::xds_span!("update", T::TYPE_URL).entered();
        let mut generation = self.generation.write().unwrap_or_else(|e| e.into_inner());
        generation.values = values;
        generation.version += 1;
        let version = generation.version;
        // Published under the lock so waiters observe versions in order.
        self.notify.send_replace(version);
        debug!(
            type_url = T::TYPE_URL,
            version,
            resource_count = generation.values.len(),
            "Updated snapshot cache"
        );
        version
    }

    /// Resources with the given names, sorted by name. Unknown names are
    /// omitted.
    pub fn query(&self, names: &[String]) -> Vec<T> {
        let generation = self.generation.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<T> = names
            .iter()
            .filter_map(|name| generation.values.get(name).or_else(|| self.statics.get(name)))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.resource_name().cmp(b.resource_name()));
        found.dedup_by(|a, b| a.resource_name() == b.resource_name());
        found
    }

    /// Every dynamic and static resource, sorted by name. A dynamic resource
    /// shadows a static one with the same name.
    pub fn contents(&self) -> Vec<T> {
        let generation = self.generation.read().unwrap_or_else(|e| e.into_inner());
        let mut merged: BTreeMap<&str, &T> =
            self.statics.iter().map(|(name, value)| (name.as_str(), value)).collect();
        merged.extend(generation.values.iter().map(|(name, value)| (name.as_str(), value)));
        merged.into_values().cloned().collect()
    }

    /// Wait until the cache version exceeds `last_seen` and return it.
    /// Returns immediately when it already does, and fails with
    /// [`Error::Cancelled`] if `cancel` fires first.
    pub async fn wait_for_next(&self, last_seen: u64, cancel: &CancellationToken) -> Result<u64> {
        let mut receiver = self.notify.subscribe();
        loop {
            let current = *receiver.borrow_and_update();
            if current > last_seen {
                return Ok(current);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::cancelled(format!(
                        "wait for {} version after {last_seen} cancelled",
                        T::TYPE_URL
                    )));
                }
                changed = receiver.changed() => {
                    if changed.is_err() {
                        return Err(Error::internal("snapshot cache notifier closed"));
                    }
                }
            }
        }
    }
}

/// Type-erased view of a cache for the streaming layer.
#[async_trait]
pub trait ResourceCache: Send + Sync {
    fn type_url(&self) -> &'static str;

    fn version(&self) -> u64;

    fn contents_encoded(&self) -> Vec<Any>;

    fn query_encoded(&self, names: &[String]) -> Vec<Any>;

    async fn wait_for_next(&self, last_seen: u64, cancel: &CancellationToken) -> Result<u64>;
}

#[async_trait]
impl<T> ResourceCache for SnapshotCache<T>
where
    T: XdsResource + Send + Sync,
{
    fn type_url(&self) -> &'static str {
        T::TYPE_URL
    }

    fn version(&self) -> u64 {
        SnapshotCache::version(self)
    }

    fn contents_encoded(&self) -> Vec<Any> {
        self.contents().iter().map(XdsResource::to_any).collect()
    }

    fn query_encoded(&self, names: &[String]) -> Vec<Any> {
        self.query(names).iter().map(XdsResource::to_any).collect()
    }

    async fn wait_for_next(&self, last_seen: u64, cancel: &CancellationToken) -> Result<u64> {
        SnapshotCache::wait_for_next(self, last_seen, cancel).await
    }
}

/// The full set of caches served to Envoy.
#[derive(Debug, Default)]
pub struct ResourceCaches {
    pub listeners: SnapshotCache<Listener>,
    pub routes: SnapshotCache<RouteConfiguration>,
    pub clusters: SnapshotCache<Cluster>,
    pub endpoints: SnapshotCache<ClusterLoadAssignment>,
    pub secrets: SnapshotCache<Secret>,
}

impl ResourceCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_listeners(&self, values: BTreeMap<String, Listener>) -> u64 {
        self.listeners.update(values)
    }

    pub fn update_routes(&self, values: BTreeMap<String, RouteConfiguration>) -> u64 {
        self.routes.update(values)
    }

    pub fn update_clusters(&self, values: BTreeMap<String, Cluster>) -> u64 {
        self.clusters.update(values)
    }

    /// Endpoints are not derived from the graph; whoever watches service
    /// endpoints feeds them here.
    pub fn update_endpoints(&self, values: BTreeMap<String, ClusterLoadAssignment>) -> u64 {
        self.endpoints.update(values)
    }

    pub fn update_secrets(&self, values: BTreeMap<String, Secret>) -> u64 {
        self.secrets.update(values)
    }

    /// Cache serving `type_url`, if any.
    pub fn by_type_url(&self, type_url: &str) -> Option<&dyn ResourceCache> {
        self.all().into_iter().find(|cache| cache.type_url() == type_url)
    }

    /// Every cache, in LDS, RDS, CDS, EDS, SDS order.
    pub fn all(&self) -> [&dyn ResourceCache; 5] {
        [&self.listeners, &self.routes, &self.clusters, &self.endpoints, &self.secrets]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::{CLUSTER_TYPE_URL, LISTENER_TYPE_URL, SECRET_TYPE_URL};
    use envoy_types::pb::google::protobuf::UInt32Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn listener(name: &str, limit: u32) -> (String, Listener) {
        let listener = Listener {
            name: name.to_string(),
            per_connection_buffer_limit_bytes: Some(UInt32Value { value: limit }),
            ..Default::default()
        };
        (name.to_string(), listener)
    }

    fn names(values: &[Listener]) -> Vec<&str> {
        values.iter().map(|l| l.name.as_str()).collect()
    }

    #[test]
    fn update_bumps_version() {
        let cache = SnapshotCache::<Listener>::new();
        assert_eq!(cache.version(), 0);
        assert_eq!(cache.update(BTreeMap::from([listener("a", 1)])), 1);
        assert_eq!(cache.update(BTreeMap::new()), 2);
        assert!(cache.contents().is_empty());
    }

    #[test]
    fn query_skips_unknown_and_sorts() {
        let cache = SnapshotCache::<Listener>::new();
        cache.update(BTreeMap::from([listener("b", 1), listener("a", 2)]));

        let found = cache.query(&["b".into(), "missing".into(), "a".into()]);
        assert_eq!(names(&found), vec!["a", "b"]);
        assert!(cache.query(&[]).is_empty());
    }

    #[test]
    fn dynamic_shadows_static() {
        let cache =
            SnapshotCache::with_static(BTreeMap::from([listener("stats", 1), listener("x", 9)]));
        cache.update(BTreeMap::from([listener("x", 2)]));

        let contents = cache.contents();
        assert_eq!(names(&contents), vec!["stats", "x"]);
        let x = contents.iter().find(|l| l.name == "x").expect("x");
        assert_eq!(x.per_connection_buffer_limit_bytes.as_ref().map(|v| v.value), Some(2));
        assert_eq!(names(&cache.query(&["stats".into()])), vec!["stats"]);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_behind() {
        let cache = SnapshotCache::<Listener>::new();
        cache.update(BTreeMap::new());
        let token = CancellationToken::new();
        assert_eq!(cache.wait_for_next(0, &token).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn wait_wakes_on_update() {
        let cache = Arc::new(SnapshotCache::<Listener>::new());
        let token = CancellationToken::new();

        let waiter = {
            let cache = cache.clone();
            let token = token.clone();
            tokio::spawn(async move { cache.wait_for_next(0, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.update(BTreeMap::from([listener("a", 1)]));

        let version = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .expect("task joined")
            .expect("version");
        assert_eq!(version, 1);
    }

    #[test]
    fn wait_stays_pending_until_update() {
        let cache = SnapshotCache::<Listener>::new();
        let token = CancellationToken::new();
        let mut waiter = tokio_test::task::spawn(cache.wait_for_next(0, &token));

        tokio_test::assert_pending!(waiter.poll());
        cache.update(BTreeMap::from([listener("a", 1)]));
        assert!(waiter.is_woken());
        assert_eq!(tokio_test::assert_ready_ok!(waiter.poll()), 1);
    }

    #[tokio::test]
    async fn wait_is_cancellable() {
        let cache = SnapshotCache::<Listener>::new();
        let token = CancellationToken::new();
        token.cancel();

        let err = cache.wait_for_next(0, &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn caches_dispatch_by_type_url() {
        let caches = ResourceCaches::new();
        caches.update_listeners(BTreeMap::from([listener("ingress_http", 1)]));

        let lds = caches.by_type_url(LISTENER_TYPE_URL).expect("lds cache");
        assert_eq!(lds.version(), 1);
        let encoded = lds.contents_encoded();
        assert_eq!(encoded.len(), 1);
        assert_eq!(encoded[0].type_url, LISTENER_TYPE_URL);
        assert_eq!(lds.query_encoded(&["ingress_http".into()]).len(), 1);

        assert_eq!(caches.by_type_url(CLUSTER_TYPE_URL).map(|c| c.version()), Some(0));
        assert!(caches.by_type_url(SECRET_TYPE_URL).is_some());
        assert!(caches.by_type_url("type.googleapis.com/unknown").is_none());

        let token = CancellationToken::new();
        assert_eq!(lds.wait_for_next(0, &token).await.unwrap(), 1);
    }
}
