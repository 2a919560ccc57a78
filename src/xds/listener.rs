//! Listener projection
//!
//! Produces at most two listeners from a compiled graph: `ingress_http` when
//! any insecure virtual host exists, and `ingress_https` carrying one filter
//! chain per group of secure hosts that share an identical TLS context.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use envoy_types::pb::envoy::config::accesslog::v3::AccessLog;
use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, socket_address::PortSpecifier, Address,
    Http1ProtocolOptions, SocketAddress,
};
use envoy_types::pb::envoy::config::listener::v3::{
    filter::ConfigType as FilterConfigType,
    listener_filter::ConfigType as ListenerFilterConfigType, Filter, FilterChain,
    FilterChainMatch, Listener, ListenerFilter,
};
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::listener::proxy_protocol::v3::ProxyProtocol;
use envoy_types::pb::envoy::extensions::filters::listener::tls_inspector::v3::TlsInspector;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier},
    http_filter::ConfigType as HttpFilterConfigType,
    HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{
    tcp_proxy::{weighted_cluster::ClusterWeight, ClusterSpecifier, WeightedCluster},
    TcpProxy as TcpProxyFilter,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::DownstreamTlsContext;
use envoy_types::pb::google::protobuf::{BoolValue, UInt32Value};
use tracing::debug;

use crate::config::{Cidr, IpAllowDenyConfig};
use crate::dag::{Dag, FullName, SecureVirtualHost, TcpProxy, TlsVersion, Vertex};
use crate::xds::access_log::AccessLogConfig;
use crate::xds::envoy::{
    ads_config_source, cluster_name, downstream_tls_context, downstream_transport_socket,
    duration, to_any,
};
use crate::xds::structs::{list_value, number_value, string_value, struct_value, typed_struct};

pub const ENVOY_HTTP_LISTENER: &str = "ingress_http";
pub const ENVOY_HTTPS_LISTENER: &str = "ingress_https";
pub const ENVOY_FALLBACK_ROUTECONFIG: &str = "ingress_fallbackcert";
pub const FALLBACK_CHAIN_NAME: &str = "fallback-certificate";

pub const DEFAULT_HTTP_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_HTTP_PORT: u32 = 8080;
pub const DEFAULT_HTTPS_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_HTTPS_PORT: u32 = 8443;
pub const DEFAULT_ACCESS_LOG: &str = "/dev/stdout";

/// Path answered directly by the health check filter on every listener.
pub const HEALTH_CHECK_PATH: &str = "/envoy_health_94eaa5a6ba44fc17d1da432d4a1e2d73";

const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
const HTTP_CONNECTION_MANAGER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const TCP_PROXY: &str = "envoy.filters.network.tcp_proxy";
const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const ROUTER: &str = "envoy.filters.http.router";
const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const TLS_INSPECTOR: &str = "envoy.filters.listener.tls_inspector";
const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
const PROXY_PROTOCOL: &str = "envoy.filters.listener.proxy_protocol";
const PROXY_PROTOCOL_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.proxy_protocol.v3.ProxyProtocol";
const IP_ALLOW_DENY_LISTENER: &str = "envoy.listener.ip_allow_deny";
const IP_ALLOW_DENY_LISTENER_TYPE: &str = "envoy.config.filter.network.ip_allow_deny.v2.IpAllowDeny";
const IP_ALLOW_DENY_HTTP: &str = "envoy.filters.http.ip_allow_deny";
const HEALTH_CHECK_SIMPLE: &str = "envoy.filters.http.health_check_simple";
const HEALTH_CHECK_SIMPLE_TYPE: &str =
    "envoy.config.filter.http.health_check_simple.v2.HealthCheckSimple";
const HEADER_SIZE: &str = "envoy.filters.http.header_size";
const HEADER_SIZE_TYPE: &str = "envoy.config.filter.http.header_size.v2.HeaderSize";
const MAX_HEADER_BYTES: f64 = 64.0 * 1024.0;

/// Connections through a TCP proxy are closed after this long without traffic.
const TCP_PROXY_IDLE_TIMEOUT: StdDuration = StdDuration::from_secs(9001);

const HTTP_ALPN: &[&str] = &["h2", "http/1.1"];

/// Static settings for listener projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerVisitorConfig {
    pub http_address: String,
    pub http_port: u32,
    pub http_access_log: String,
    pub https_address: String,
    pub https_port: u32,
    pub https_access_log: String,
    pub access_log: AccessLogConfig,
    pub use_proxy_protocol: bool,
    /// Global floor for every downstream TLS context.
    pub minimum_tls_version: TlsVersion,
    /// Certificate served on a no-SNI chain when it is part of the graph.
    pub default_certificate: Option<FullName>,
    /// Zero disables the request timeout.
    pub request_timeout: StdDuration,
    pub ip_allow_deny: Option<IpAllowDenyConfig>,
}

impl Default for ListenerVisitorConfig {
    fn default() -> Self {
        Self {
            http_address: DEFAULT_HTTP_ADDRESS.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            http_access_log: DEFAULT_ACCESS_LOG.to_string(),
            https_address: DEFAULT_HTTPS_ADDRESS.to_string(),
            https_port: DEFAULT_HTTPS_PORT,
            https_access_log: DEFAULT_ACCESS_LOG.to_string(),
            access_log: AccessLogConfig::default(),
            use_proxy_protocol: false,
            minimum_tls_version: TlsVersion::V1_1,
            default_certificate: None,
            request_timeout: StdDuration::ZERO,
            ip_allow_deny: None,
        }
    }
}

impl ListenerVisitorConfig {
    /// Effective TLS floor. Never lower than 1.1.
    pub fn min_tls_version(&self) -> TlsVersion {
        self.minimum_tls_version.max(TlsVersion::V1_1)
    }

    /// Request timeout from a signed seconds value; negative disables it.
    pub fn request_timeout_from_seconds(seconds: i64) -> StdDuration {
        StdDuration::from_secs(seconds.max(0) as u64)
    }

    fn insecure_access_log(&self) -> Vec<AccessLog> {
        self.access_log.build(&self.http_access_log)
    }

    fn secure_access_log(&self) -> Vec<AccessLog> {
        self.access_log.build(&self.https_access_log)
    }

    fn listener_filters(&self, secure: bool) -> Vec<ListenerFilter> {
        let mut filters = Vec::new();
        if self.use_proxy_protocol {
            filters.push(listener_filter(
                PROXY_PROTOCOL,
                to_any(PROXY_PROTOCOL_TYPE_URL, &ProxyProtocol::default()),
            ));
        }
        if secure {
            filters.push(listener_filter(
                TLS_INSPECTOR,
                to_any(TLS_INSPECTOR_TYPE_URL, &TlsInspector::default()),
            ));
        }
        if let Some(filter) = self.ip_allow_deny.as_ref().and_then(ip_allow_deny_filter) {
            filters.push(filter);
        }
        filters
    }

    fn connection_manager(&self, route_config_name: &str, access_log: Vec<AccessLog>) -> Filter {
        HttpConnectionManagerConfig {
            access_log,
            request_timeout: self.request_timeout,
            ..HttpConnectionManagerConfig::new(route_config_name)
        }
        .build()
    }
}

/// Every option of the HTTP connection manager this control plane sets.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpConnectionManagerConfig {
    pub route_config_name: String,
    pub stat_prefix: String,
    pub access_log: Vec<AccessLog>,
    pub request_timeout: StdDuration,
    /// Add the allow/deny, health check and header size filters ahead of the
    /// router.
    pub default_filters: bool,
    pub generate_request_id: bool,
    pub max_request_headers_kb: u32,
    pub accept_http_10: bool,
    pub use_remote_address: bool,
    pub normalize_path: bool,
    pub merge_slashes: bool,
    pub server_name: String,
}

impl Default for HttpConnectionManagerConfig {
    fn default() -> Self {
        Self {
            route_config_name: String::new(),
            stat_prefix: String::new(),
            access_log: Vec::new(),
            request_timeout: StdDuration::ZERO,
            default_filters: true,
            generate_request_id: false,
            max_request_headers_kb: 64,
            accept_http_10: true,
            use_remote_address: true,
            normalize_path: true,
            merge_slashes: true,
            server_name: "ingressplane".to_string(),
        }
    }
}

impl HttpConnectionManagerConfig {
    /// Settings for a manager reading routes from `route_config_name`, which
    /// doubles as the stat prefix.
    pub fn new(route_config_name: &str) -> Self {
        Self {
            route_config_name: route_config_name.to_string(),
            stat_prefix: route_config_name.to_string(),
            ..Default::default()
        }
    }

    fn http_filters(&self) -> Vec<HttpFilter> {
        let mut filters = Vec::new();
        if self.default_filters {
            filters.push(HttpFilter { name: IP_ALLOW_DENY_HTTP.to_string(), ..Default::default() });
            filters.push(http_filter(
                HEALTH_CHECK_SIMPLE,
                typed_struct(
                    HEALTH_CHECK_SIMPLE_TYPE,
                    vec![("path", string_value(HEALTH_CHECK_PATH))],
                ),
            ));
            filters.push(http_filter(
                HEADER_SIZE,
                typed_struct(HEADER_SIZE_TYPE, vec![("max_bytes", number_value(MAX_HEADER_BYTES))]),
            ));
        }
        filters.push(http_filter(
            ROUTER,
            to_any(ROUTER_TYPE_URL, &Router { suppress_envoy_headers: true, ..Default::default() }),
        ));
        filters
    }

    pub fn build(&self) -> Filter {
        let hcm = HttpConnectionManager {
            codec_type: CodecType::Auto as i32,
            stat_prefix: self.stat_prefix.clone(),
            route_specifier: Some(RouteSpecifier::Rds(Rds {
                route_config_name: self.route_config_name.clone(),
                config_source: Some(ads_config_source()),
            })),
            http_filters: self.http_filters(),
            access_log: self.access_log.clone(),
            request_timeout: Some(duration(self.request_timeout)),
            generate_request_id: Some(BoolValue { value: self.generate_request_id }),
            max_request_headers_kb: Some(UInt32Value { value: self.max_request_headers_kb }),
            http_protocol_options: Some(Http1ProtocolOptions {
                accept_http_10: self.accept_http_10,
                ..Default::default()
            }),
            use_remote_address: Some(BoolValue { value: self.use_remote_address }),
            normalize_path: Some(BoolValue { value: self.normalize_path }),
            merge_slashes: self.merge_slashes,
            server_name: self.server_name.clone(),
            ..Default::default()
        };

        Filter {
            name: HTTP_CONNECTION_MANAGER.to_string(),
            config_type: Some(FilterConfigType::TypedConfig(to_any(
                HTTP_CONNECTION_MANAGER_TYPE_URL,
                &hcm,
            ))),
        }
    }
}

fn http_filter(name: &str, config: envoy_types::pb::google::protobuf::Any) -> HttpFilter {
    HttpFilter {
        name: name.to_string(),
        config_type: Some(HttpFilterConfigType::TypedConfig(config)),
        ..Default::default()
    }
}

fn listener_filter(name: &str, config: envoy_types::pb::google::protobuf::Any) -> ListenerFilter {
    ListenerFilter {
        name: name.to_string(),
        config_type: Some(ListenerFilterConfigType::TypedConfig(config)),
        ..Default::default()
    }
}

/// Listener filter enforcing the allow/deny CIDR lists, or `None` when both
/// lists are absent.
pub fn ip_allow_deny_filter(config: &IpAllowDenyConfig) -> Option<ListenerFilter> {
    let cidr_list = |cidrs: &[Cidr]| {
        list_value(
            cidrs
                .iter()
                .map(|cidr| {
                    struct_value(vec![
                        ("address_prefix", string_value(cidr.address_prefix.clone())),
                        ("prefix_len", number_value(f64::from(cidr.prefix_len))),
                    ])
                })
                .collect(),
        )
    };

    let mut fields = Vec::new();
    if let Some(allow) = &config.allow_cidrs {
        fields.push(("allow_cidrs", cidr_list(allow)));
    }
    if let Some(deny) = &config.deny_cidrs {
        fields.push(("deny_cidrs", cidr_list(deny)));
    }
    if fields.is_empty() {
        return None;
    }

    Some(listener_filter(IP_ALLOW_DENY_LISTENER, typed_struct(IP_ALLOW_DENY_LISTENER_TYPE, fields)))
}

/// TCP proxy network filter for a secure host.
pub fn tcp_proxy_filter(stat_prefix: &str, proxy: &TcpProxy, access_log: Vec<AccessLog>) -> Filter {
    let cluster_specifier = match proxy.clusters.as_slice() {
        [single] => ClusterSpecifier::Cluster(cluster_name(single)),
        clusters => {
            let mut weighted: Vec<ClusterWeight> = clusters
                .iter()
                .map(|cluster| ClusterWeight {
                    name: cluster_name(cluster),
                    weight: cluster.weight.max(1),
                    ..Default::default()
                })
                .collect();
            weighted.sort_by(|a, b| a.name.cmp(&b.name).then(a.weight.cmp(&b.weight)));
            ClusterSpecifier::WeightedClusters(WeightedCluster {
                clusters: weighted,
                ..Default::default()
            })
        }
    };

    let tcp_proxy = TcpProxyFilter {
        stat_prefix: stat_prefix.to_string(),
        cluster_specifier: Some(cluster_specifier),
        access_log,
        idle_timeout: Some(duration(TCP_PROXY_IDLE_TIMEOUT)),
        ..Default::default()
    };

    Filter {
        name: TCP_PROXY.to_string(),
        config_type: Some(FilterConfigType::TypedConfig(to_any(TCP_PROXY_TYPE_URL, &tcp_proxy))),
    }
}

fn socket_address(address: &str, port: u32) -> Address {
    Address {
        address: Some(AddressType::SocketAddress(SocketAddress {
            address: address.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(port)),
            ipv4_compat: address == "::",
            ..Default::default()
        })),
    }
}

fn listener(
    name: &str,
    address: &str,
    port: u32,
    listener_filters: Vec<ListenerFilter>,
    filter_chains: Vec<FilterChain>,
) -> Listener {
    Listener {
        name: name.to_string(),
        address: Some(socket_address(address, port)),
        listener_filters,
        filter_chains,
        ..Default::default()
    }
}

/// A secure filter chain before it is rendered, kept open so later hosts can
/// join it.
#[derive(Debug)]
struct PendingChain {
    server_names: Vec<String>,
    tls: Option<DownstreamTlsContext>,
    filters: Vec<Filter>,
    tcp_proxy: bool,
    fallback: bool,
}

impl PendingChain {
    fn sort_key(&self) -> &str {
        self.server_names.first().map(String::as_str).unwrap_or_default()
    }

    fn into_filter_chain(self) -> FilterChain {
        let filter_chain_match = if self.fallback {
            Some(FilterChainMatch { transport_protocol: "tls".to_string(), ..Default::default() })
        } else if self.server_names.is_empty() {
            None
        } else {
            Some(FilterChainMatch { server_names: self.server_names, ..Default::default() })
        };

        FilterChain {
            name: if self.fallback { FALLBACK_CHAIN_NAME.to_string() } else { String::new() },
            filter_chain_match,
            filters: self.filters,
            transport_socket: self.tls.as_ref().map(downstream_transport_socket),
            ..Default::default()
        }
    }
}

struct ListenerVisitor<'a> {
    config: &'a ListenerVisitorConfig,
    chains: Vec<PendingChain>,
    http: bool,
    fallback_added: bool,
}

impl<'a> ListenerVisitor<'a> {
    fn visit(&mut self, vertex: Vertex<'_>) {
        match vertex {
            Vertex::VirtualHost(_) => self.http = true,
            Vertex::SecureVirtualHost(svhost) => self.visit_secure(svhost),
            other => other.visit_children(&mut |child| self.visit(child)),
        }
    }

    fn visit_secure(&mut self, svhost: &SecureVirtualHost) {
        let config = self.config;
        let (filters, alpn) = match &svhost.tcp_proxy {
            None => (
                vec![config.connection_manager(ENVOY_HTTPS_LISTENER, config.secure_access_log())],
                HTTP_ALPN,
            ),
            Some(proxy) => (
                vec![tcp_proxy_filter(ENVOY_HTTPS_LISTENER, proxy, config.secure_access_log())],
                &[][..],
            ),
        };

        let tls = svhost.secret.as_ref().map(|secret| {
            downstream_tls_context(
                secret,
                config.min_tls_version().max(svhost.min_tls_version),
                match svhost.max_tls_version {
                    TlsVersion::Auto => TlsVersion::V1_3,
                    version => version,
                },
                svhost.downstream_validation.as_ref(),
                alpn,
            )
        });

        let tcp_proxy = svhost.tcp_proxy.is_some();
        let existing = if tcp_proxy || tls.is_none() {
            None
        } else {
            self.chains
                .iter_mut()
                .find(|chain| !chain.tcp_proxy && !chain.fallback && chain.tls.is_some() && chain.tls == tls)
        };

        match existing {
            Some(chain) => {
                chain.server_names.push(svhost.name().to_string());
                chain.server_names.sort();
                debug!(host = svhost.name(), "Grouped secure host into existing filter chain");
            }
            None => self.chains.push(PendingChain {
                server_names: vec![svhost.name().to_string()],
                tls,
                filters,
                tcp_proxy,
                fallback: false,
            }),
        }

        if let Some(fallback) = &svhost.fallback_certificate {
            if !self.fallback_added {
                let tls = downstream_tls_context(
                    fallback,
                    config.min_tls_version(),
                    TlsVersion::Auto,
                    svhost.downstream_validation.as_ref(),
                    alpn,
                );
                let manager = HttpConnectionManagerConfig {
                    stat_prefix: ENVOY_HTTPS_LISTENER.to_string(),
                    access_log: config.secure_access_log(),
                    request_timeout: config.request_timeout,
                    default_filters: false,
                    ..HttpConnectionManagerConfig::new(ENVOY_FALLBACK_ROUTECONFIG)
                };
                self.chains.push(PendingChain {
                    server_names: Vec::new(),
                    tls: Some(tls),
                    filters: vec![manager.build()],
                    tcp_proxy: false,
                    fallback: true,
                });
                self.fallback_added = true;
            }
        }
    }
}

/// Project the graph into listeners keyed by name.
pub fn visit_listeners(dag: &Dag, config: &ListenerVisitorConfig) -> BTreeMap<String, Listener> {
    let mut visitor =
        ListenerVisitor { config, chains: Vec::new(), http: false, fallback_added: false };
    dag.visit(&mut |vertex| visitor.visit(vertex));

    let ListenerVisitor { mut chains, http, .. } = visitor;
    let mut listeners = BTreeMap::new();

    if http {
        listeners.insert(
            ENVOY_HTTP_LISTENER.to_string(),
            listener(
                ENVOY_HTTP_LISTENER,
                &config.http_address,
                config.http_port,
                config.listener_filters(false),
                vec![FilterChain {
                    filters: vec![config
                        .connection_manager(ENVOY_HTTP_LISTENER, config.insecure_access_log())],
                    ..Default::default()
                }],
            ),
        );
    }

    if let Some(default_name) = &config.default_certificate {
        if let Some(secret) = dag.secrets().get(default_name) {
            chains.push(PendingChain {
                server_names: Vec::new(),
                tls: Some(downstream_tls_context(
                    secret,
                    config.min_tls_version(),
                    TlsVersion::Auto,
                    None,
                    HTTP_ALPN,
                )),
                filters: vec![
                    config.connection_manager(ENVOY_HTTPS_LISTENER, config.secure_access_log())
                ],
                tcp_proxy: false,
                fallback: false,
            });
        }
    }

    if !chains.is_empty() {
        chains.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));
        listeners.insert(
            ENVOY_HTTPS_LISTENER.to_string(),
            listener(
                ENVOY_HTTPS_LISTENER,
                &config.https_address,
                config.https_port,
                config.listener_filters(true),
                chains.into_iter().map(PendingChain::into_filter_chain).collect(),
            ),
        );
    }

    listeners
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Cluster, Route, Secret, Service, VirtualHost};
    use prost::Message;
    use std::collections::BTreeMap as Map;

    fn secret(ns: &str, name: &str, cert: &str) -> Secret {
        Secret {
            name: FullName::new(ns, name),
            data: Map::from([
                ("tls.crt".to_string(), cert.to_string()),
                ("tls.key".to_string(), "key".to_string()),
            ]),
        }
    }

    fn cluster(name: &str, weight: u32) -> Cluster {
        Cluster {
            upstream: Service {
                name: FullName::new("default", name),
                port: 80,
                port_name: String::new(),
                protocol: String::new(),
            },
            protocol: String::new(),
            load_balancer_policy: String::new(),
            weight,
            health_check: None,
            upstream_validation: None,
            idle_timeout: None,
        }
    }

    fn routed_vhost(name: &str) -> VirtualHost {
        let mut vhost = VirtualHost::new(name);
        let mut route = Route::new("/");
        route.clusters.push(cluster("web", 0));
        vhost.add_route(route);
        vhost
    }

    fn secure_host(name: &str, secret: Secret) -> SecureVirtualHost {
        let mut svhost = SecureVirtualHost::new(name);
        svhost.virtual_host = routed_vhost(name);
        svhost.secret = Some(secret);
        svhost.min_tls_version = TlsVersion::V1_1;
        svhost.max_tls_version = TlsVersion::V1_3;
        svhost
    }

    fn dag_with(secure: Vec<SecureVirtualHost>, insecure: Vec<VirtualHost>) -> Dag {
        Dag {
            virtual_hosts: insecure.into_iter().map(|v| (v.name.clone(), v)).collect(),
            secure_virtual_hosts: secure.into_iter().map(|s| (s.name().to_string(), s)).collect(),
        }
    }

    fn server_names(listener: &Listener) -> Vec<Vec<String>> {
        listener
            .filter_chains
            .iter()
            .map(|chain| {
                chain.filter_chain_match.as_ref().map(|m| m.server_names.clone()).unwrap_or_default()
            })
            .collect()
    }

    fn decode_hcm(filter: &Filter) -> HttpConnectionManager {
        match filter.config_type.as_ref() {
            Some(FilterConfigType::TypedConfig(any)) => {
                HttpConnectionManager::decode(any.value.as_slice()).expect("decode hcm")
            }
            None => panic!("filter without config"),
        }
    }

    #[test]
    fn empty_graph_has_no_listeners() {
        let listeners = visit_listeners(&Dag::default(), &ListenerVisitorConfig::default());
        assert!(listeners.is_empty());
    }

    #[test]
    fn insecure_host_creates_http_listener_only() {
        let dag = dag_with(Vec::new(), vec![routed_vhost("example.com")]);
        let listeners = visit_listeners(&dag, &ListenerVisitorConfig::default());

        assert_eq!(listeners.keys().collect::<Vec<_>>(), vec![ENVOY_HTTP_LISTENER]);
        let http = &listeners[ENVOY_HTTP_LISTENER];
        let hcm = decode_hcm(&http.filter_chains[0].filters[0]);
        assert_eq!(hcm.stat_prefix, ENVOY_HTTP_LISTENER);
        let Some(RouteSpecifier::Rds(rds)) = hcm.route_specifier else {
            panic!("expected rds");
        };
        assert_eq!(rds.route_config_name, ENVOY_HTTP_LISTENER);
        let names: Vec<_> = hcm.http_filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![IP_ALLOW_DENY_HTTP, HEALTH_CHECK_SIMPLE, HEADER_SIZE, ROUTER]);
        assert!(http.listener_filters.is_empty());
    }

    #[test]
    fn hosts_sharing_tls_context_are_grouped() {
        let shared = secret("default", "wildcard", "cert");
        let dag = dag_with(
            vec![
                secure_host("b.example.com", shared.clone()),
                secure_host("a.example.com", shared),
                secure_host("c.example.com", secret("default", "other", "other")),
            ],
            Vec::new(),
        );
        let listeners = visit_listeners(&dag, &ListenerVisitorConfig::default());
        let https = &listeners[ENVOY_HTTPS_LISTENER];

        assert_eq!(
            server_names(https),
            vec![
                vec!["a.example.com".to_string(), "b.example.com".to_string()],
                vec!["c.example.com".to_string()],
            ]
        );
        assert_eq!(https.listener_filters[0].name, TLS_INSPECTOR);
    }

    #[test]
    fn tcp_proxy_chains_are_never_grouped() {
        let shared = secret("default", "wildcard", "cert");
        let mut first = secure_host("a.example.com", shared.clone());
        first.tcp_proxy = Some(TcpProxy { clusters: vec![cluster("db", 0)] });
        let mut second = secure_host("b.example.com", shared);
        second.tcp_proxy = Some(TcpProxy { clusters: vec![cluster("db", 0)] });

        let listeners =
            visit_listeners(&dag_with(vec![second, first], Vec::new()), &ListenerVisitorConfig::default());
        let https = &listeners[ENVOY_HTTPS_LISTENER];
        assert_eq!(https.filter_chains.len(), 2);
        assert_eq!(https.filter_chains[0].filters[0].name, TCP_PROXY);
        assert_eq!(server_names(https)[0], vec!["a.example.com".to_string()]);
    }

    #[test]
    fn fallback_chain_is_added_once() {
        let fallback = secret("admin", "fallback", "fallback");
        let mut first = secure_host("a.example.com", secret("default", "a", "a"));
        first.fallback_certificate = Some(fallback.clone());
        let mut second = secure_host("b.example.com", secret("default", "b", "b"));
        second.fallback_certificate = Some(fallback);

        let listeners =
            visit_listeners(&dag_with(vec![first, second], Vec::new()), &ListenerVisitorConfig::default());
        let https = &listeners[ENVOY_HTTPS_LISTENER];
        let fallbacks: Vec<_> =
            https.filter_chains.iter().filter(|c| c.name == FALLBACK_CHAIN_NAME).collect();
        assert_eq!(fallbacks.len(), 1);
        assert_eq!(https.filter_chains[0].name, FALLBACK_CHAIN_NAME);

        let hcm = decode_hcm(&fallbacks[0].filters[0]);
        assert_eq!(hcm.stat_prefix, ENVOY_HTTPS_LISTENER);
        let Some(RouteSpecifier::Rds(rds)) = hcm.route_specifier else {
            panic!("expected rds");
        };
        assert_eq!(rds.route_config_name, ENVOY_FALLBACK_ROUTECONFIG);
        assert_eq!(hcm.http_filters.len(), 1);
    }

    #[test]
    fn default_certificate_adds_no_sni_chain() {
        let cert = secret("default", "wildcard", "cert");
        let dag = dag_with(vec![secure_host("a.example.com", cert)], Vec::new());
        let config = ListenerVisitorConfig {
            default_certificate: Some(FullName::new("default", "wildcard")),
            ..Default::default()
        };
        let https = &visit_listeners(&dag, &config)[ENVOY_HTTPS_LISTENER];
        assert_eq!(https.filter_chains.len(), 2);
        assert!(https.filter_chains[0].filter_chain_match.is_none());

        let missing = ListenerVisitorConfig {
            default_certificate: Some(FullName::new("default", "absent")),
            ..Default::default()
        };
        assert_eq!(visit_listeners(&dag, &missing)[ENVOY_HTTPS_LISTENER].filter_chains.len(), 1);
    }

    #[test]
    fn passthrough_host_has_no_transport_socket() {
        let mut svhost = SecureVirtualHost::new("tcp.example.com");
        svhost.tcp_proxy = Some(TcpProxy { clusters: vec![cluster("db", 0)] });
        let listeners =
            visit_listeners(&dag_with(vec![svhost], Vec::new()), &ListenerVisitorConfig::default());
        assert!(listeners[ENVOY_HTTPS_LISTENER].filter_chains[0].transport_socket.is_none());
    }

    #[test]
    fn weighted_tcp_proxy_sorts_and_defaults_weights() {
        let proxy = TcpProxy { clusters: vec![cluster("b", 0), cluster("a", 3)] };
        let filter = tcp_proxy_filter(ENVOY_HTTPS_LISTENER, &proxy, Vec::new());
        let Some(FilterConfigType::TypedConfig(any)) = filter.config_type else {
            panic!("expected typed config");
        };
        let decoded = TcpProxyFilter::decode(any.value.as_slice()).expect("decode tcp proxy");
        assert_eq!(decoded.idle_timeout.map(|d| d.seconds), Some(9001));
        let Some(ClusterSpecifier::WeightedClusters(weighted)) = decoded.cluster_specifier else {
            panic!("expected weighted clusters");
        };
        let weights: Vec<_> = weighted.clusters.iter().map(|c| c.weight).collect();
        assert_eq!(weights, vec![3, 1]);
        assert!(weighted.clusters[0].name.starts_with("default/a/80/"));
    }

    #[test]
    fn listener_filters_follow_configuration() {
        let config = ListenerVisitorConfig {
            use_proxy_protocol: true,
            ip_allow_deny: Some(IpAllowDenyConfig {
                allow_cidrs: Some(vec![Cidr { address_prefix: "10.0.0.0".into(), prefix_len: 8 }]),
                deny_cidrs: None,
            }),
            http_address: "::".into(),
            ..Default::default()
        };
        let dag = dag_with(
            vec![secure_host("a.example.com", secret("default", "a", "a"))],
            vec![routed_vhost("a.example.com")],
        );
        let listeners = visit_listeners(&dag, &config);

        let names = |l: &Listener| l.listener_filters.iter().map(|f| f.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&listeners[ENVOY_HTTP_LISTENER]), vec![PROXY_PROTOCOL, IP_ALLOW_DENY_LISTENER]);
        assert_eq!(
            names(&listeners[ENVOY_HTTPS_LISTENER]),
            vec![PROXY_PROTOCOL, TLS_INSPECTOR, IP_ALLOW_DENY_LISTENER]
        );

        let Some(Address { address: Some(AddressType::SocketAddress(addr)) }) =
            listeners[ENVOY_HTTP_LISTENER].address.clone()
        else {
            panic!("expected socket address");
        };
        assert!(addr.ipv4_compat);
    }

    #[test]
    fn json_logging_and_cidr_filters_encode_identically() {
        let cidr = |prefix: &str, len: u32| Cidr { address_prefix: prefix.into(), prefix_len: len };
        let config = ListenerVisitorConfig {
            access_log: AccessLogConfig {
                log_type: crate::xds::access_log::AccessLogType::Json,
                ..Default::default()
            },
            ip_allow_deny: Some(IpAllowDenyConfig {
                allow_cidrs: Some(vec![cidr("10.0.0.0", 8), cidr("192.168.0.0", 16)]),
                deny_cidrs: Some(vec![cidr("10.1.0.0", 16)]),
            }),
            ..Default::default()
        };
        let dag = dag_with(
            vec![secure_host("a.example.com", secret("default", "a", "a"))],
            vec![routed_vhost("a.example.com")],
        );
        let encoded = || {
            visit_listeners(&dag, &config)
                .values()
                .map(|listener| listener.encode_to_vec())
                .collect::<Vec<_>>()
        };

        let first = encoded();
        assert_eq!(first.len(), 2);
        for _ in 0..20 {
            assert_eq!(encoded(), first);
        }
    }

    #[test]
    fn empty_cidr_config_adds_no_filter() {
        assert!(ip_allow_deny_filter(&IpAllowDenyConfig::default()).is_none());
    }

    #[test]
    fn negative_request_timeout_disables() {
        assert_eq!(ListenerVisitorConfig::request_timeout_from_seconds(-5), StdDuration::ZERO);
        assert_eq!(
            ListenerVisitorConfig::request_timeout_from_seconds(30),
            StdDuration::from_secs(30)
        );
    }

    #[test]
    fn repeated_projection_is_byte_identical() {
        let dag = dag_with(
            vec![
                secure_host("b.example.com", secret("default", "b", "b")),
                secure_host("a.example.com", secret("default", "a", "a")),
            ],
            vec![routed_vhost("a.example.com")],
        );
        let config = ListenerVisitorConfig::default();
        let encode = |listeners: BTreeMap<String, Listener>| {
            listeners.values().map(|l| l.encode_to_vec()).collect::<Vec<_>>()
        };
        assert_eq!(encode(visit_listeners(&dag, &config)), encode(visit_listeners(&dag, &config)));
    }
}
