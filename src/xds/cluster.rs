//! Cluster projection
//!
//! Every distinct upstream binding in the graph becomes one EDS cluster. Two
//! routes that reach the same service port with identical settings share a
//! cluster because they produce the same [`cluster_name`].

use std::collections::{BTreeMap, HashMap};
use std::time::Duration as StdDuration;

use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, CommonLbConfig, DiscoveryType, EdsClusterConfig, LbPolicy,
};
use envoy_types::pb::envoy::config::cluster::v3::Cluster as EnvoyCluster;
use envoy_types::pb::envoy::config::core::v3::{
    health_check::{HealthChecker, HttpHealthCheck},
    HealthCheck, Http1ProtocolOptions, Http2ProtocolOptions,
    HttpProtocolOptions as CommonHttpProtocolOptions,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::{
    explicit_http_config::ProtocolConfig, ExplicitHttpConfig, UpstreamProtocolOptions,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::HttpProtocolOptions;
use envoy_types::pb::envoy::r#type::v3::Percent;
use envoy_types::pb::google::protobuf::{Any, UInt32Value};
use tracing::debug;

use crate::dag::{Cluster, Dag, HttpHealthCheckPolicy, Vertex};
use crate::xds::envoy::{
    ads_config_source, cluster_name, duration, service_name, to_any, upstream_tls_context,
    upstream_transport_socket,
};

pub const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const HTTP_PROTOCOL_OPTIONS_KEY: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

const CONNECT_TIMEOUT: StdDuration = StdDuration::from_millis(250);

fn lb_policy(policy: &str) -> LbPolicy {
    match policy {
        "WeightedLeastRequest" => LbPolicy::LeastRequest,
        "Random" => LbPolicy::Random,
        "Cookie" | "RequestHash" => LbPolicy::RingHash,
        _ => LbPolicy::RoundRobin,
    }
}

fn health_check(policy: &HttpHealthCheckPolicy) -> HealthCheck {
    HealthCheck {
        timeout: Some(duration(policy.timeout)),
        interval: Some(duration(policy.interval)),
        unhealthy_threshold: Some(UInt32Value { value: policy.unhealthy_threshold }),
        healthy_threshold: Some(UInt32Value { value: policy.healthy_threshold }),
        health_checker: Some(HealthChecker::HttpHealthCheck(HttpHealthCheck {
            host: policy.host.clone(),
            path: policy.path.clone(),
            ..Default::default()
        })),
        ..Default::default()
    }
}

/// Upstream HTTP options: HTTP/2 for `h2` and `h2c` backends, plus the
/// connection idle timeout when one is set.
fn protocol_options(cluster: &Cluster) -> HashMap<String, Any> {
    let http2 = matches!(cluster.protocol.as_str(), "h2" | "h2c");
    if !http2 && cluster.idle_timeout.is_none() {
        return HashMap::new();
    }

    let protocol_config = if http2 {
        ProtocolConfig::Http2ProtocolOptions(Http2ProtocolOptions::default())
    } else {
        ProtocolConfig::HttpProtocolOptions(Http1ProtocolOptions::default())
    };

    let options = HttpProtocolOptions {
        common_http_protocol_options: cluster.idle_timeout.map(|idle| CommonHttpProtocolOptions {
            idle_timeout: Some(duration(idle)),
            ..Default::default()
        }),
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
            ExplicitHttpConfig { protocol_config: Some(protocol_config) },
        )),
        ..Default::default()
    };

    HashMap::from([(
        HTTP_PROTOCOL_OPTIONS_KEY.to_string(),
        to_any(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &options),
    )])
}

/// Render one graph cluster as an EDS cluster fed over ADS.
pub fn envoy_cluster(cluster: &Cluster) -> EnvoyCluster {
    let service = &cluster.upstream;
    let mut rendered = EnvoyCluster {
        name: cluster_name(cluster),
        alt_stat_name: format!(
            "{}_{}_{}",
            service.name.namespace, service.name.name, service.port
        ),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
        eds_cluster_config: Some(EdsClusterConfig {
            eds_config: Some(ads_config_source()),
            service_name: service_name(service),
        }),
        connect_timeout: Some(duration(CONNECT_TIMEOUT)),
        lb_policy: lb_policy(&cluster.load_balancer_policy) as i32,
        common_lb_config: Some(CommonLbConfig {
            healthy_panic_threshold: Some(Percent { value: 0.0 }),
            ..Default::default()
        }),
        typed_extension_protocol_options: protocol_options(cluster),
        ..Default::default()
    };

    if let Some(policy) = &cluster.health_check {
        rendered.health_checks = vec![health_check(policy)];
    }

    match cluster.protocol.as_str() {
        "tls" => {
            let context = upstream_tls_context(cluster.upstream_validation.as_ref(), &[]);
            rendered.transport_socket = Some(upstream_transport_socket(&context));
        }
        "h2" => {
            let context = upstream_tls_context(cluster.upstream_validation.as_ref(), &["h2"]);
            rendered.transport_socket = Some(upstream_transport_socket(&context));
        }
        _ => {}
    }

    rendered
}

/// Project every cluster reachable from the graph, keyed by CDS name.
pub fn visit_clusters(dag: &Dag) -> BTreeMap<String, EnvoyCluster> {
    fn collect(vertex: Vertex<'_>, out: &mut BTreeMap<String, EnvoyCluster>) {
        match vertex {
            Vertex::Cluster(cluster) => {
                let name = cluster_name(cluster);
                if !out.contains_key(&name) {
                    out.insert(name, envoy_cluster(cluster));
                }
            }
            other => other.visit_children(&mut |child| collect(child, out)),
        }
    }

    let mut clusters = BTreeMap::new();
    dag.visit(&mut |vertex| collect(vertex, &mut clusters));
    debug!(cluster_count = clusters.len(), "Projected clusters");
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::source::HealthCheckSpec;
    use crate::dag::{
        policy, FullName, PeerValidationContext, Route, Secret, SecureVirtualHost, Service, TcpProxy,
        VirtualHost,
    };
    use envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType;
    use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::UpstreamTlsContext;
    use prost::Message;

    fn cluster(name: &str, port: i32) -> Cluster {
        Cluster {
            upstream: Service {
                name: FullName::new("default", name),
                port,
                port_name: "http".to_string(),
                protocol: String::new(),
            },
            protocol: String::new(),
            load_balancer_policy: String::new(),
            weight: 0,
            health_check: None,
            upstream_validation: None,
            idle_timeout: None,
        }
    }

    fn dag_with(routes: Vec<Vec<Cluster>>) -> Dag {
        let mut vhost = VirtualHost::new("example.com");
        for (i, clusters) in routes.into_iter().enumerate() {
            let mut route = Route::new(format!("/{i}"));
            route.clusters = clusters;
            vhost.add_route(route);
        }
        Dag {
            virtual_hosts: BTreeMap::from([(vhost.name.clone(), vhost)]),
            ..Default::default()
        }
    }

    #[test]
    fn eds_cluster_defaults() {
        let rendered = envoy_cluster(&cluster("web", 80));
        assert!(rendered.name.starts_with("default/web/80/"));
        assert_eq!(rendered.alt_stat_name, "default_web_80");
        assert_eq!(
            rendered.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32))
        );
        let eds = rendered.eds_cluster_config.as_ref().expect("eds config");
        assert_eq!(eds.service_name, "default/web/http");
        assert_eq!(rendered.connect_timeout.as_ref().map(|d| d.nanos), Some(250_000_000));
        assert_eq!(rendered.lb_policy, LbPolicy::RoundRobin as i32);
        assert!(rendered.typed_extension_protocol_options.is_empty());
        assert!(rendered.transport_socket.is_none());
    }

    #[test]
    fn maps_load_balancer_policies() {
        assert_eq!(lb_policy("WeightedLeastRequest"), LbPolicy::LeastRequest);
        assert_eq!(lb_policy("Random"), LbPolicy::Random);
        assert_eq!(lb_policy("Cookie"), LbPolicy::RingHash);
        assert_eq!(lb_policy("RequestHash"), LbPolicy::RingHash);
        assert_eq!(lb_policy("Bogus"), LbPolicy::RoundRobin);
    }

    #[test]
    fn health_check_renders_filled_policy() {
        let mut with_hc = cluster("web", 80);
        with_hc.health_check = policy::health_check_policy(Some(&HealthCheckSpec {
            path: "/healthz".into(),
            timeout_seconds: 5,
            healthy_threshold_count: 4,
            ..Default::default()
        }));

        let rendered = envoy_cluster(&with_hc);
        let check = &rendered.health_checks[0];
        assert_eq!(check.timeout.as_ref().map(|d| d.seconds), Some(5));
        assert_eq!(check.interval.as_ref().map(|d| d.seconds), Some(10));
        assert_eq!(check.unhealthy_threshold.as_ref().map(|v| v.value), Some(3));
        assert_eq!(check.healthy_threshold.as_ref().map(|v| v.value), Some(4));
        let Some(HealthChecker::HttpHealthCheck(http)) = &check.health_checker else {
            panic!("expected http health check");
        };
        assert_eq!(http.host, "ingressplane-envoy-healthcheck");
        assert_eq!(http.path, "/healthz");
    }

    #[test]
    fn h2_upstream_uses_tls_with_alpn() {
        let mut h2 = cluster("grpc", 443);
        h2.protocol = "h2".into();
        h2.upstream_validation = Some(PeerValidationContext {
            ca_certificate: Secret {
                name: FullName::new("default", "ca"),
                data: BTreeMap::from([("ca.crt".to_string(), "CA".to_string())]),
            },
            subject_name: "grpc.internal".into(),
        });

        let rendered = envoy_cluster(&h2);
        assert!(rendered.typed_extension_protocol_options.contains_key(HTTP_PROTOCOL_OPTIONS_KEY));
        let socket = rendered.transport_socket.as_ref().expect("transport socket");
        let Some(ConfigType::TypedConfig(any)) = &socket.config_type else {
            panic!("expected typed config");
        };
        let context = UpstreamTlsContext::decode(any.value.as_slice()).expect("decode");
        assert_eq!(context.sni, "grpc.internal");
        assert_eq!(
            context.common_tls_context.as_ref().map(|c| c.alpn_protocols.clone()),
            Some(vec!["h2".to_string()])
        );
    }

    #[test]
    fn idle_timeout_sets_http1_protocol_options() {
        let mut idle = cluster("web", 80);
        idle.idle_timeout = Some(StdDuration::from_secs(30));

        let rendered = envoy_cluster(&idle);
        let any = &rendered.typed_extension_protocol_options[HTTP_PROTOCOL_OPTIONS_KEY];
        let options = HttpProtocolOptions::decode(any.value.as_slice()).expect("decode");
        assert_eq!(
            options.common_http_protocol_options.and_then(|c| c.idle_timeout).map(|d| d.seconds),
            Some(30)
        );
        assert!(matches!(
            options.upstream_protocol_options,
            Some(UpstreamProtocolOptions::ExplicitHttpConfig(ExplicitHttpConfig {
                protocol_config: Some(ProtocolConfig::HttpProtocolOptions(_))
            }))
        ));
    }

    #[test]
    fn shared_bindings_produce_one_cluster() {
        let dag = dag_with(vec![
            vec![cluster("web", 80)],
            vec![cluster("web", 80), cluster("api", 8080)],
        ]);
        let clusters = visit_clusters(&dag);
        assert_eq!(clusters.len(), 2);

        let mut random = cluster("web", 80);
        random.load_balancer_policy = "Random".into();
        let dag = dag_with(vec![vec![cluster("web", 80)], vec![random]]);
        assert_eq!(visit_clusters(&dag).len(), 2);
    }

    #[test]
    fn tcp_proxy_clusters_are_projected() {
        let mut svhost = SecureVirtualHost::new("passthrough.example.com");
        svhost.tcp_proxy = Some(TcpProxy { clusters: vec![cluster("db", 5432)] });
        let dag = Dag {
            secure_virtual_hosts: BTreeMap::from([(svhost.name().to_string(), svhost)]),
            ..Default::default()
        };

        let clusters = visit_clusters(&dag);
        assert_eq!(clusters.len(), 1);
        assert!(clusters.keys().all(|name| name.starts_with("default/db/5432/")));
    }
}
