//! # Resource Graph
//!
//! The validated, acyclic configuration graph compiled from routing resources.
//!
//! A [`Builder`] pass turns an [`EntityStore`] snapshot into a [`Dag`] keyed by
//! FQDN plus one [`StatusRecord`] per routing resource. Projection visitors in
//! [`crate::xds`] walk the graph through the closed [`Vertex`] enum.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod builder;
pub mod policy;
pub mod source;
pub mod status;

pub use builder::{BuildOutput, Builder, BuilderConfig};
pub use source::{
    CertificateDelegation, EntityStore, FullName, ResourceSnapshot, RoutingResource,
    SecretRecord, ServiceRecord,
};
pub use status::{InMemoryStatusWriter, Status, StatusRecord, StatusWriter};

/// TLS protocol versions understood by the graph. Ordered so that `max`
/// picks the stricter of two versions.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TlsVersion {
    #[default]
    Auto,
    #[serde(rename = "1.1")]
    V1_1,
    #[serde(rename = "1.2")]
    V1_2,
    #[serde(rename = "1.3")]
    V1_3,
}

impl TlsVersion {
    /// Parse a user supplied version. Unknown values resolve to `Auto`, which
    /// leaves the choice to the configured floor or ceiling.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "1.1" => Self::V1_1,
            "1.2" => Self::V1_2,
            "1.3" => Self::V1_3,
            _ => Self::Auto,
        }
    }

    /// Parse a version strictly, for static configuration.
    pub fn parse_strict(value: &str) -> Option<Self> {
        match value.trim() {
            "1.1" => Some(Self::V1_1),
            "1.2" => Some(Self::V1_2),
            "1.3" => Some(Self::V1_3),
            "" | "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::V1_1 => "1.1",
            Self::V1_2 => "1.2",
            Self::V1_3 => "1.3",
        }
    }
}

/// A backend service port resolved from the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Service {
    pub name: FullName,
    pub port: i32,
    pub port_name: String,
    /// `tls`, `h2`, `h2c` or empty.
    pub protocol: String,
}

/// TLS material referenced by the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Secret {
    pub name: FullName,
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub fn from_record(record: &SecretRecord) -> Self {
        Self { name: record.full_name(), data: record.data.clone() }
    }

    pub fn cert(&self) -> &str {
        self.value(source::TLS_CERT_KEY)
    }

    pub fn private_key(&self) -> &str {
        self.value(source::TLS_KEY_KEY)
    }

    pub fn ca(&self) -> &str {
        self.value(source::CA_CERT_KEY)
    }

    fn value(&self, key: &str) -> &str {
        self.data.get(key).map(String::as_str).unwrap_or_default()
    }
}

/// Peer certificate validation settings, used both for client certificates on
/// the secure listener and for TLS upstreams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerValidationContext {
    pub ca_certificate: Secret,
    pub subject_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpHealthCheckPolicy {
    pub path: String,
    pub host: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

/// An upstream binding of a route or TCP proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cluster {
    pub upstream: Service,
    pub protocol: String,
    pub load_balancer_policy: String,
    pub weight: u32,
    pub health_check: Option<HttpHealthCheckPolicy>,
    pub upstream_validation: Option<PeerValidationContext>,
    pub idle_timeout: Option<Duration>,
}

/// Exact header match condition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeaderCondition {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TimeoutSetting {
    /// Leave the proxy default in place.
    #[default]
    Default,
    /// Explicitly disabled (zero on the wire).
    Disabled,
    Value(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetryPolicy {
    pub retry_on: String,
    pub num_retries: u32,
    pub per_try_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashPolicyKind {
    Header { name: String },
    Cookie { name: String, path: String, ttl: Option<Duration> },
    SourceIp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashPolicy {
    pub kind: HashPolicyKind,
    pub terminal: bool,
}

/// Header rewrites for requests or responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HeadersPolicy {
    pub set: BTreeMap<String, String>,
    pub host_rewrite: Option<String>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TracingSampling {
    pub client: u32,
    pub random: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub prefix: String,
    pub header_conditions: Vec<HeaderCondition>,
    pub clusters: Vec<Cluster>,
    pub websocket: bool,
    /// Answer plain HTTP with a redirect to HTTPS.
    pub https_upgrade: bool,
    pub prefix_rewrite: Option<String>,
    pub timeout: TimeoutSetting,
    pub idle_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub hash_policies: Vec<HashPolicy>,
    pub tracing: Option<TracingSampling>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
}

impl Route {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            header_conditions: Vec::new(),
            clusters: Vec::new(),
            websocket: false,
            https_upgrade: false,
            prefix_rewrite: None,
            timeout: TimeoutSetting::Default,
            idle_timeout: None,
            retry_policy: None,
            hash_policies: Vec::new(),
            tracing: None,
            request_headers_policy: None,
            response_headers_policy: None,
        }
    }

    fn same_match(&self, other: &Route) -> bool {
        self.prefix == other.prefix && self.header_conditions == other.header_conditions
    }
}

/// Insecure route table for one FQDN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHost {
    pub name: String,
    pub routes: Vec<Route>,
}

impl VirtualHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), routes: Vec::new() }
    }

    /// Add a route, replacing any earlier route with the same match in place.
    pub fn add_route(&mut self, route: Route) {
        match self.routes.iter_mut().find(|existing| existing.same_match(&route)) {
            Some(existing) => *existing = route,
            None => self.routes.push(route),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.routes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpProxy {
    pub clusters: Vec<Cluster>,
}

/// TLS counterpart of [`VirtualHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureVirtualHost {
    pub virtual_host: VirtualHost,
    /// Absent under TLS passthrough.
    pub secret: Option<Secret>,
    pub min_tls_version: TlsVersion,
    pub max_tls_version: TlsVersion,
    pub fallback_certificate: Option<Secret>,
    pub downstream_validation: Option<PeerValidationContext>,
    pub tcp_proxy: Option<TcpProxy>,
}

impl SecureVirtualHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            virtual_host: VirtualHost::new(name),
            secret: None,
            min_tls_version: TlsVersion::Auto,
            max_tls_version: TlsVersion::Auto,
            fallback_certificate: None,
            downstream_validation: None,
            tcp_proxy: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.virtual_host.name
    }

    pub fn is_valid(&self) -> bool {
        (self.secret.is_some() && self.virtual_host.is_valid()) || self.tcp_proxy.is_some()
    }
}

/// Graph node kinds.
#[derive(Debug, Clone, Copy)]
pub enum Vertex<'a> {
    VirtualHost(&'a VirtualHost),
    SecureVirtualHost(&'a SecureVirtualHost),
    Route(&'a Route),
    Cluster(&'a Cluster),
    TcpProxy(&'a TcpProxy),
    Service(&'a Service),
    Secret(&'a Secret),
}

impl<'a> Vertex<'a> {
    /// Invoke `f` on each direct child of this vertex.
    pub fn visit_children(&self, f: &mut dyn FnMut(Vertex<'a>)) {
        match *self {
            Vertex::VirtualHost(vhost) => {
                vhost.routes.iter().for_each(|route| f(Vertex::Route(route)));
            }
            Vertex::SecureVirtualHost(svhost) => {
                if let Some(secret) = &svhost.secret {
                    f(Vertex::Secret(secret));
                }
                if let Some(fallback) = &svhost.fallback_certificate {
                    f(Vertex::Secret(fallback));
                }
                svhost.virtual_host.routes.iter().for_each(|route| f(Vertex::Route(route)));
                if let Some(proxy) = &svhost.tcp_proxy {
                    f(Vertex::TcpProxy(proxy));
                }
            }
            Vertex::Route(route) => {
                route.clusters.iter().for_each(|cluster| f(Vertex::Cluster(cluster)));
            }
            Vertex::TcpProxy(proxy) => {
                proxy.clusters.iter().for_each(|cluster| f(Vertex::Cluster(cluster)));
            }
            Vertex::Cluster(cluster) => f(Vertex::Service(&cluster.upstream)),
            Vertex::Service(_) | Vertex::Secret(_) => {}
        }
    }
}

/// The compiled graph for one build pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dag {
    pub virtual_hosts: BTreeMap<String, VirtualHost>,
    pub secure_virtual_hosts: BTreeMap<String, SecureVirtualHost>,
}

impl Dag {
    /// Invoke `f` on every top-level vertex, insecure hosts first, each group
    /// in FQDN order.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(Vertex<'a>)) {
        self.virtual_hosts.values().for_each(|vhost| f(Vertex::VirtualHost(vhost)));
        self.secure_virtual_hosts.values().for_each(|svhost| f(Vertex::SecureVirtualHost(svhost)));
    }

    /// Every secret reachable from the graph, keyed by namespace/name.
    pub fn secrets(&self) -> BTreeMap<FullName, &Secret> {
        fn collect<'a>(vertex: Vertex<'a>, out: &mut BTreeMap<FullName, &'a Secret>) {
            match vertex {
                Vertex::Secret(secret) => {
                    out.insert(secret.name.clone(), secret);
                }
                other => other.visit_children(&mut |child| collect(child, out)),
            }
        }

        let mut out = BTreeMap::new();
        self.visit(&mut |vertex| collect(vertex, &mut out));
        out
    }

    pub fn is_empty(&self) -> bool {
        self.virtual_hosts.is_empty() && self.secure_virtual_hosts.is_empty()
    }
}
