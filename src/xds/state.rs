//! Rebuild orchestration: store snapshot in, statuses and caches out.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dag::{
    Builder, EntityStore, FullName, InMemoryStatusWriter, ResourceSnapshot, StatusRecord,
    StatusWriter,
};
use crate::xds::cache::ResourceCaches;
use crate::xds::cluster::visit_clusters;
use crate::xds::listener::{visit_listeners, ListenerVisitorConfig};
use crate::xds::route::visit_routes;
use crate::xds::secret::visit_secrets;
use crate::Result;

/// What one rebuild produced.
#[derive(Debug, Clone, Default)]
pub struct RebuildSummary {
    pub pass: u64,
    pub statuses: BTreeMap<FullName, StatusRecord>,
    pub valid: usize,
    pub invalid: usize,
    pub orphaned: usize,
    pub listener_version: u64,
    pub route_version: u64,
    pub cluster_version: u64,
    pub secret_version: u64,
}

/// Shared control plane state: the builder settings, the caches it feeds and
/// where statuses go.
pub struct XdsState {
    builder: Builder,
    listener_config: ListenerVisitorConfig,
    caches: Arc<ResourceCaches>,
    status_writer: Arc<dyn StatusWriter>,
    passes: AtomicU64,
}

impl std::fmt::Debug for XdsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XdsState")
            .field("builder", &self.builder)
            .field("listener_config", &self.listener_config)
            .field("passes", &self.passes)
            .finish_non_exhaustive()
    }
}

impl XdsState {
    pub fn new(builder: Builder, listener_config: ListenerVisitorConfig) -> Self {
        Self::with_status_writer(builder, listener_config, Arc::new(InMemoryStatusWriter::new()))
    }

    pub fn with_status_writer(
        builder: Builder,
        listener_config: ListenerVisitorConfig,
        status_writer: Arc<dyn StatusWriter>,
    ) -> Self {
        Self {
            builder,
            listener_config,
            caches: Arc::new(ResourceCaches::new()),
            status_writer,
            passes: AtomicU64::new(0),
        }
    }

    pub fn caches(&self) -> Arc<ResourceCaches> {
        self.caches.clone()
    }

    /// Number of completed rebuilds.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Compile `store`, publish statuses, project the graph and update every
    /// derived cache once.
    pub fn rebuild(&self, store: &dyn EntityStore) -> RebuildSummary {
        let pass = self.passes.fetch_add(1, Ordering::Relaxed) + 1;
        let span = crate::build_span!(pass);
        let _entered = span.enter();

        let output = self.builder.build(store);
        for record in output.statuses.values() {
            self.status_writer.set_status(record);
        }

        let listeners = visit_listeners(&output.dag, &self.listener_config);
        let routes = visit_routes(&output.dag);
        let clusters = visit_clusters(&output.dag);
        let secrets = visit_secrets(&output.dag);
        debug!(
            listeners = listeners.len(),
            routes = routes.len(),
            clusters = clusters.len(),
            secrets = secrets.len(),
            "Projected graph"
        );

        let (valid, invalid, orphaned) = output.status_counts();
        let summary = RebuildSummary {
            pass,
            valid,
            invalid,
            orphaned,
            listener_version: self.caches.update_listeners(listeners),
            route_version: self.caches.update_routes(routes),
            cluster_version: self.caches.update_clusters(clusters),
            secret_version: self.caches.update_secrets(secrets),
            statuses: output.statuses,
        };

        info!(
            pass,
            valid,
            invalid,
            orphaned,
            listener_version = summary.listener_version,
            route_version = summary.route_version,
            cluster_version = summary.cluster_version,
            secret_version = summary.secret_version,
            "Rebuilt xDS resources"
        );
        summary
    }

    /// Rebuild on every snapshot received until the channel closes or
    /// `cancel` fires. Snapshots that queue up while a rebuild runs are
    /// coalesced into the newest one. Returns the number of rebuilds.
    pub async fn run(
        &self,
        mut snapshots: mpsc::Receiver<ResourceSnapshot>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let mut rebuilds = 0;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                snapshot = snapshots.recv() => snapshot,
            };
            let Some(mut snapshot) = next else {
                break;
            };

            let mut coalesced = 0usize;
            while let Ok(newer) = snapshots.try_recv() {
                snapshot = newer;
                coalesced += 1;
            }
            debug!(coalesced, entities = snapshot.len(), "Received resource snapshot");

            self.rebuild(&snapshot);
            rebuilds += 1;
        }

        info!(rebuilds, cancelled = cancel.is_cancelled(), "Rebuild loop stopped");
        Ok(rebuilds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{BuilderConfig, Status};
    use crate::xds::listener::ENVOY_HTTP_LISTENER;
    use std::time::Duration;
    use tracing_test::traced_test;

    const SNAPSHOT: &str = r#"
routingResources:
  - namespace: default
    name: web
    virtualHost:
      fqdn: example.com
    routes:
      - match: /
        services:
          - name: web
            port: 80
services:
  - namespace: default
    name: web
    ports:
      - port: 80
"#;

    fn state() -> (XdsState, Arc<InMemoryStatusWriter>) {
        let writer = Arc::new(InMemoryStatusWriter::new());
        let state = XdsState::with_status_writer(
            Builder::new(BuilderConfig::default()),
            ListenerVisitorConfig::default(),
            writer.clone(),
        );
        (state, writer)
    }

    #[test]
    #[traced_test]
    fn rebuild_updates_statuses_and_caches() {
        let (state, writer) = state();
        let snapshot = ResourceSnapshot::from_yaml_str(SNAPSHOT).unwrap();

        let summary = state.rebuild(&snapshot);
        assert_eq!(summary.pass, 1);
        assert_eq!((summary.valid, summary.invalid, summary.orphaned), (1, 0, 0));
        assert_eq!(
            writer.get(&FullName::new("default", "web")).map(|r| r.status),
            Some(Status::Valid)
        );

        let caches = state.caches();
        assert_eq!(caches.listeners.version(), 1);
        assert_eq!(caches.endpoints.version(), 0);
        let listeners = caches.listeners.query(&[ENVOY_HTTP_LISTENER.to_string()]);
        assert_eq!(listeners.len(), 1);
        assert_eq!(caches.clusters.contents().len(), 1);
        assert!(logs_contain("Rebuilt xDS resources"));
    }

    #[test]
    fn repeated_rebuilds_bump_every_version() {
        let (state, _) = state();
        let snapshot = ResourceSnapshot::from_yaml_str(SNAPSHOT).unwrap();
        state.rebuild(&snapshot);
        let summary = state.rebuild(&snapshot);
        assert_eq!(summary.pass, 2);
        assert_eq!(summary.route_version, 2);
        assert_eq!(summary.secret_version, 2);
    }

    #[tokio::test]
    async fn run_coalesces_and_stops_on_close() {
        let (state, _) = state();
        let (tx, rx) = mpsc::channel(8);
        for _ in 0..3 {
            tx.send(ResourceSnapshot::from_yaml_str(SNAPSHOT).unwrap()).await.unwrap();
        }
        drop(tx);

        let rebuilds = state.run(rx, CancellationToken::new()).await.unwrap();
        assert_eq!(rebuilds, 1);
        assert_eq!(state.passes(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (state, _) = state();
        let (_tx, rx) = mpsc::channel::<ResourceSnapshot>(1);
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            stopper.cancel();
        });

        let rebuilds = tokio::time::timeout(Duration::from_secs(1), state.run(rx, cancel))
            .await
            .expect("loop stopped")
            .unwrap();
        assert_eq!(rebuilds, 0);
    }
}
