//! Envoy xDS projection and snapshot caches
//!
//! Projection visitors walk a compiled [`crate::dag::Dag`] and produce the
//! Envoy v3 resources served over the aggregated discovery protocol:
//! - LDS listeners ([`listener`])
//! - RDS route configurations ([`route`])
//! - CDS clusters ([`cluster`])
//! - SDS secrets ([`secret`])
//!
//! Each resource type has its own versioned [`cache::SnapshotCache`].

pub mod access_log;
pub mod cache;
pub mod cluster;
pub mod envoy;
pub mod listener;
pub mod route;
pub mod secret;
pub mod state;
pub mod structs;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

pub use cache::{ResourceCache, ResourceCaches, SnapshotCache};
pub use listener::ListenerVisitorConfig;
pub use state::XdsState;

pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// An Envoy resource that can be held in a [`SnapshotCache`].
pub trait XdsResource: Message + Clone + Default + 'static {
    const TYPE_URL: &'static str;

    /// Name the resource is requested by.
    fn resource_name(&self) -> &str;

    fn to_any(&self) -> Any {
        Any { type_url: Self::TYPE_URL.to_string(), value: self.encode_to_vec() }
    }
}

impl XdsResource for Listener {
    const TYPE_URL: &'static str = LISTENER_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.name
    }
}

impl XdsResource for RouteConfiguration {
    const TYPE_URL: &'static str = ROUTE_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.name
    }
}

impl XdsResource for Cluster {
    const TYPE_URL: &'static str = CLUSTER_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.name
    }
}

impl XdsResource for ClusterLoadAssignment {
    const TYPE_URL: &'static str = ENDPOINT_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.cluster_name
    }
}

impl XdsResource for Secret {
    const TYPE_URL: &'static str = SECRET_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.name
    }
}
