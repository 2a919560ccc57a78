//! Route configuration projection
//!
//! Every graph virtual host becomes one Envoy virtual host inside the route
//! configuration of the listener that serves it. Routes are ordered by
//! [`route_precedence`] so the most specific match is evaluated first.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::{
    header_value_option::HeaderAppendAction, HeaderValue, HeaderValueOption,
};
use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier,
    redirect_action::SchemeRewriteSpecifier,
    route::Action,
    route_action::{
        hash_policy::{ConnectionProperties, Cookie, Header, PolicySpecifier},
        ClusterSpecifier, HashPolicy as EnvoyHashPolicy, HostRewriteSpecifier, UpgradeConfig,
    },
    route_match::PathSpecifier,
    weighted_cluster::ClusterWeight,
    HeaderMatcher, RedirectAction, RetryPolicy as EnvoyRetryPolicy, Route as EnvoyRoute,
    RouteAction, RouteConfiguration, RouteMatch, Tracing, VirtualHost as EnvoyVirtualHost,
    WeightedCluster,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher};
use envoy_types::pb::envoy::r#type::v3::{fractional_percent::DenominatorType, FractionalPercent};
use envoy_types::pb::google::protobuf::UInt32Value;

use crate::dag::{
    Cluster, Dag, HashPolicyKind, HeadersPolicy, Route, TimeoutSetting, Vertex, VirtualHost,
};
use crate::xds::envoy::{cluster_name, duration, hashname, MAX_NAME_LENGTH};
use crate::xds::listener::{ENVOY_FALLBACK_ROUTECONFIG, ENVOY_HTTPS_LISTENER, ENVOY_HTTP_LISTENER};

const REQUEST_START_HEADER: &str = "x-request-start";
const REQUEST_START_VALUE: &str = "t=%START_TIME(%s.%3f)%";

/// Order in which routes of one virtual host are evaluated: longer and
/// lexically later prefixes first, then routes with more header conditions,
/// then header conditions in ascending order. Equal routes keep their
/// insertion order because callers sort stably.
pub fn route_precedence(a: &Route, b: &Route) -> Ordering {
    b.prefix
        .cmp(&a.prefix)
        .then_with(|| b.header_conditions.len().cmp(&a.header_conditions.len()))
        .then_with(|| a.header_conditions.cmp(&b.header_conditions))
}

fn append_header(key: &str, value: &str) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: key.to_string(),
            value: value.to_string(),
            ..Default::default()
        }),
        append_action: HeaderAppendAction::AppendIfExistsOrAdd as i32,
        ..Default::default()
    }
}

fn set_header(key: &str, value: &str) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: key.to_string(),
            value: value.to_string(),
            ..Default::default()
        }),
        append_action: HeaderAppendAction::OverwriteIfExistsOrAdd as i32,
        ..Default::default()
    }
}

fn headers_to_add(policy: Option<&HeadersPolicy>) -> Vec<HeaderValueOption> {
    policy
        .map(|policy| policy.set.iter().map(|(key, value)| set_header(key, value)).collect())
        .unwrap_or_default()
}

fn headers_to_remove(policy: Option<&HeadersPolicy>) -> Vec<String> {
    policy.map(|policy| policy.remove.clone()).unwrap_or_default()
}

/// Weighted cluster list for a route with several upstreams. When no weight
/// is set anywhere, traffic is split evenly.
fn weighted_clusters(clusters: &[Cluster]) -> WeightedCluster {
    // The builder rejects overflowing weights; saturate rather than wrap.
    let mut total =
        clusters.iter().fold(0u32, |total, cluster| total.saturating_add(cluster.weight));
    let even = total == 0;
    if even {
        total = clusters.len() as u32;
    }

    let mut weighted: Vec<ClusterWeight> = clusters
        .iter()
        .map(|cluster| ClusterWeight {
            name: cluster_name(cluster),
            weight: Some(UInt32Value { value: if even { 1 } else { cluster.weight } }),
            request_headers_to_add: vec![append_header(REQUEST_START_HEADER, REQUEST_START_VALUE)],
            ..Default::default()
        })
        .collect();
    weighted.sort_by(|a, b| {
        a.name.cmp(&b.name).then_with(|| {
            let weight = |c: &ClusterWeight| c.weight.as_ref().map_or(0, |w| w.value);
            weight(a).cmp(&weight(b))
        })
    });

    #[allow(deprecated)]
    let weighted_cluster = WeightedCluster {
        clusters: weighted,
        total_weight: Some(UInt32Value { value: total }),
        ..Default::default()
    };
    weighted_cluster
}

fn hash_policy(policy: &crate::dag::HashPolicy) -> EnvoyHashPolicy {
    let specifier = match &policy.kind {
        HashPolicyKind::Header { name } => {
            PolicySpecifier::Header(Header { header_name: name.clone(), ..Default::default() })
        }
        HashPolicyKind::Cookie { name, path, ttl } => PolicySpecifier::Cookie(Cookie {
            name: name.clone(),
            path: path.clone(),
            ttl: ttl.map(duration),
            ..Default::default()
        }),
        HashPolicyKind::SourceIp => {
            PolicySpecifier::ConnectionProperties(ConnectionProperties { source_ip: true })
        }
    };

    EnvoyHashPolicy { policy_specifier: Some(specifier), terminal: policy.terminal }
}

fn route_action(route: &Route) -> RouteAction {
    let mut action = RouteAction {
        prefix_rewrite: route.prefix_rewrite.clone().unwrap_or_default(),
        idle_timeout: route.idle_timeout.map(duration),
        hash_policy: route.hash_policies.iter().map(hash_policy).collect(),
        ..Default::default()
    };

    action.timeout = match route.timeout {
        TimeoutSetting::Default => None,
        TimeoutSetting::Disabled => Some(duration(std::time::Duration::ZERO)),
        TimeoutSetting::Value(value) => Some(duration(value)),
    };

    if route.websocket {
        action.upgrade_configs =
            vec![UpgradeConfig { upgrade_type: "websocket".to_string(), ..Default::default() }];
    }

    if let Some(retry) = &route.retry_policy {
        action.retry_policy = Some(EnvoyRetryPolicy {
            retry_on: retry.retry_on.clone(),
            num_retries: (retry.num_retries > 0)
                .then(|| UInt32Value { value: retry.num_retries }),
            per_try_timeout: retry.per_try_timeout.map(duration),
            ..Default::default()
        });
    }

    if let Some(host) =
        route.request_headers_policy.as_ref().and_then(|policy| policy.host_rewrite.clone())
    {
        action.host_rewrite_specifier = Some(HostRewriteSpecifier::HostRewriteLiteral(host));
    }

    match route.clusters.as_slice() {
        [single] => {
            action.cluster_specifier = Some(ClusterSpecifier::Cluster(cluster_name(single)));
            action.request_headers_to_add =
                vec![append_header(REQUEST_START_HEADER, REQUEST_START_VALUE)];
        }
        clusters => {
            action.cluster_specifier =
                Some(ClusterSpecifier::WeightedClusters(weighted_clusters(clusters)));
        }
    }

    action
}

fn route_match(route: &Route) -> RouteMatch {
    RouteMatch {
        path_specifier: Some(PathSpecifier::Prefix(route.prefix.clone())),
        headers: route
            .header_conditions
            .iter()
            .map(|condition| HeaderMatcher {
                name: condition.name.clone(),
                header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(StringMatcher {
                    match_pattern: Some(MatchPattern::Exact(condition.value.clone())),
                    ..Default::default()
                })),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn sampling(percent: u32) -> FractionalPercent {
    FractionalPercent { numerator: percent, denominator: DenominatorType::Hundred as i32 }
}

/// Render one graph route. `secure` selects the TLS copy; the insecure copy
/// of a TLS route redirects to HTTPS unless it permits insecure traffic.
pub fn envoy_route(route: &Route, secure: bool) -> EnvoyRoute {
    let action = if route.https_upgrade && !secure {
        Action::Redirect(RedirectAction {
            scheme_rewrite_specifier: Some(SchemeRewriteSpecifier::HttpsRedirect(true)),
            ..Default::default()
        })
    } else {
        Action::Route(route_action(route))
    };

    EnvoyRoute {
        r#match: Some(route_match(route)),
        action: Some(action),
        request_headers_to_add: headers_to_add(route.request_headers_policy.as_ref()),
        request_headers_to_remove: headers_to_remove(route.request_headers_policy.as_ref()),
        response_headers_to_add: headers_to_add(route.response_headers_policy.as_ref()),
        response_headers_to_remove: headers_to_remove(route.response_headers_policy.as_ref()),
        tracing: route.tracing.map(|rates| Tracing {
            client_sampling: Some(sampling(rates.client)),
            random_sampling: Some(sampling(rates.random)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn envoy_virtual_host(vhost: &VirtualHost, secure: bool) -> EnvoyVirtualHost {
    let domains = if vhost.name == "*" {
        vec![vhost.name.clone()]
    } else {
        vec![vhost.name.clone(), format!("{}:*", vhost.name)]
    };

    let mut routes: Vec<&Route> = vhost.routes.iter().collect();
    routes.sort_by(|a, b| route_precedence(a, b));

    EnvoyVirtualHost {
        name: hashname(MAX_NAME_LENGTH, &[&vhost.name]),
        domains,
        routes: routes.into_iter().map(|route| envoy_route(route, secure)).collect(),
        ..Default::default()
    }
}

fn route_configuration(name: &str) -> RouteConfiguration {
    RouteConfiguration { name: name.to_string(), ..Default::default() }
}

/// Project the graph into route configurations keyed by name. The HTTP and
/// HTTPS configurations always exist; the fallback configuration only when a
/// secure host enables the fallback certificate.
pub fn visit_routes(dag: &Dag) -> BTreeMap<String, RouteConfiguration> {
    let mut configs = BTreeMap::from([
        (ENVOY_HTTP_LISTENER.to_string(), route_configuration(ENVOY_HTTP_LISTENER)),
        (ENVOY_HTTPS_LISTENER.to_string(), route_configuration(ENVOY_HTTPS_LISTENER)),
    ]);

    dag.visit(&mut |vertex| match vertex {
        Vertex::VirtualHost(vhost) if vhost.is_valid() => {
            if let Some(config) = configs.get_mut(ENVOY_HTTP_LISTENER) {
                config.virtual_hosts.push(envoy_virtual_host(vhost, false));
            }
        }
        Vertex::SecureVirtualHost(svhost) if svhost.virtual_host.is_valid() => {
            let rendered = envoy_virtual_host(&svhost.virtual_host, true);
            if svhost.fallback_certificate.is_some() {
                configs
                    .entry(ENVOY_FALLBACK_ROUTECONFIG.to_string())
                    .or_insert_with(|| route_configuration(ENVOY_FALLBACK_ROUTECONFIG))
                    .virtual_hosts
                    .push(rendered.clone());
            }
            if let Some(config) = configs.get_mut(ENVOY_HTTPS_LISTENER) {
                config.virtual_hosts.push(rendered);
            }
        }
        _ => {}
    });

    for config in configs.values_mut() {
        config.virtual_hosts.sort_by(|a, b| a.name.cmp(&b.name));
    }
    configs
}
