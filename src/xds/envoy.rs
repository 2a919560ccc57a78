//! Shared Envoy building blocks: resource naming, config sources, durations
//! and TLS contexts.

use std::time::Duration as StdDuration;

use envoy_types::pb::envoy::config::core::v3::{
    config_source::ConfigSourceSpecifier, data_source::Specifier,
    transport_socket::ConfigType as TransportSocketConfigType, AggregatedConfigSource,
    ConfigSource, DataSource, TransportSocket,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context::ValidationContextType, subject_alt_name_matcher::SanType,
    tls_parameters::TlsProtocol, CertificateValidationContext, CommonTlsContext,
    DownstreamTlsContext, SdsSecretConfig, SubjectAltNameMatcher, TlsParameters,
    UpstreamTlsContext,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher};
use envoy_types::pb::google::protobuf::{Any, BoolValue, Duration};
use prost::Message;
use sha2::{Digest, Sha256};

use crate::dag::{Cluster, PeerValidationContext, Secret, Service, TlsVersion};

pub const DOWNSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
pub const UPSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
pub const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

/// Longest resource name produced by [`hashname`] callers.
pub const MAX_NAME_LENGTH: usize = 60;

const SHORT_HASH_LENGTH: usize = 10;

/// Cipher suites offered on every downstream TLS context.
pub const CIPHER_SUITES: &[&str] = &[
    "[ECDHE-ECDSA-AES128-GCM-SHA256|ECDHE-ECDSA-CHACHA20-POLY1305]",
    "[ECDHE-RSA-AES128-GCM-SHA256|ECDHE-RSA-CHACHA20-POLY1305]",
    "ECDHE-ECDSA-AES128-SHA",
    "ECDHE-RSA-AES128-SHA",
    "ECDHE-ECDSA-AES256-GCM-SHA384",
    "ECDHE-RSA-AES256-GCM-SHA384",
    "ECDHE-ECDSA-AES256-SHA",
    "ECDHE-RSA-AES256-SHA",
];

/// Join `parts` with `/`, truncating from the last element backwards and
/// appending a short hash of the full name whenever the result would not fit
/// in `limit` characters.
pub fn hashname(limit: usize, parts: &[&str]) -> String {
    let joined = parts.join("/");
    if joined.len() < limit {
        return joined;
    }

    let hash = hex::encode(Sha256::digest(joined.as_bytes()));
    let short = &hash[..SHORT_HASH_LENGTH];
    let per_part = limit / parts.len().max(1);

    let mut truncated: Vec<String> = parts.iter().map(|part| part.to_string()).collect();
    for n in (0..truncated.len()).rev() {
        truncated[n] = truncate(per_part, &truncated[n], short);
        let candidate = truncated.join("/");
        if candidate.len() < limit {
            return candidate;
        }
    }

    hash[..hash.len().min(limit)].to_string()
}

fn truncate(limit: usize, value: &str, suffix: &str) -> String {
    if limit >= value.len() {
        return value.to_string();
    }
    // Names are built from DNS labels, so byte slicing stays on char boundaries.
    let cut = |n: usize| value.get(..n).unwrap_or(value).to_string();
    if limit > suffix.len() {
        format!("{}{}", cut(limit - suffix.len()), suffix)
    } else {
        cut(limit)
    }
}

fn short_digest(input: &str) -> String {
    hex::encode(&Sha256::digest(input.as_bytes())[..5])
}

/// Stable CDS name for a cluster: `namespace/name/port/<hash>`, where the hash
/// covers every setting that makes two bindings of one service port differ.
pub fn cluster_name(cluster: &Cluster) -> String {
    let mut buf = cluster.load_balancer_policy.clone();
    if let Some(hc) = &cluster.health_check {
        if !hc.timeout.is_zero() {
            buf.push_str(&humantime::format_duration(hc.timeout).to_string());
        }
        if !hc.interval.is_zero() {
            buf.push_str(&humantime::format_duration(hc.interval).to_string());
        }
        if hc.unhealthy_threshold > 0 {
            buf.push_str(&hc.unhealthy_threshold.to_string());
        }
        if hc.healthy_threshold > 0 {
            buf.push_str(&hc.healthy_threshold.to_string());
        }
        buf.push_str(&hc.path);
    }
    if let Some(uv) = &cluster.upstream_validation {
        buf.push_str(&uv.ca_certificate.name.name);
        buf.push_str(&uv.subject_name);
    }
    if !cluster.protocol.is_empty() {
        buf.push_str(&cluster.protocol);
    }
    if let Some(idle) = cluster.idle_timeout {
        buf.push_str(&humantime::format_duration(idle).to_string());
    }

    let service = &cluster.upstream;
    let port = service.port.to_string();
    let hash = short_digest(&buf);
    hashname(MAX_NAME_LENGTH, &[&service.name.namespace, &service.name.name, &port, &hash])
}

/// SDS name for a secret: `namespace/name/<hash of the certificate material>`.
pub fn secret_name(secret: &Secret) -> String {
    let hash = short_digest(&format!("{}{}", secret.cert(), secret.private_key()));
    hashname(MAX_NAME_LENGTH, &[&secret.name.namespace, &secret.name.name, &hash])
}

/// EDS service name: `namespace/name/port-name`, or `namespace/name` for an
/// unnamed port.
pub fn service_name(service: &Service) -> String {
    if service.port_name.is_empty() {
        service.name.to_string()
    } else {
        format!("{}/{}", service.name, service.port_name)
    }
}

/// Config source pointing back at the aggregated discovery stream.
pub fn ads_config_source() -> ConfigSource {
    ConfigSource {
        config_source_specifier: Some(ConfigSourceSpecifier::Ads(
            AggregatedConfigSource::default(),
        )),
        ..Default::default()
    }
}

pub fn duration(value: StdDuration) -> Duration {
    Duration { seconds: value.as_secs() as i64, nanos: value.subsec_nanos() as i32 }
}

pub fn to_any<M: Message>(type_url: &str, message: &M) -> Any {
    Any { type_url: type_url.to_string(), value: message.encode_to_vec() }
}

fn tls_protocol(version: TlsVersion) -> TlsProtocol {
    match version {
        TlsVersion::Auto => TlsProtocol::TlsAuto,
        TlsVersion::V1_1 => TlsProtocol::TlSv11,
        TlsVersion::V1_2 => TlsProtocol::TlSv12,
        TlsVersion::V1_3 => TlsProtocol::TlSv13,
    }
}

fn sds_secret_config(secret: &Secret) -> SdsSecretConfig {
    SdsSecretConfig { name: secret_name(secret), sds_config: Some(ads_config_source()) }
}

fn validation_context(validation: &PeerValidationContext) -> Option<ValidationContextType> {
    let ca = validation.ca_certificate.ca();
    if ca.is_empty() {
        return None;
    }

    let mut context = CertificateValidationContext {
        trusted_ca: Some(DataSource {
            specifier: Some(Specifier::InlineBytes(ca.as_bytes().to_vec())),
            ..Default::default()
        }),
        ..Default::default()
    };
    if !validation.subject_name.is_empty() {
        context.match_typed_subject_alt_names = vec![SubjectAltNameMatcher {
            san_type: SanType::Dns as i32,
            matcher: Some(StringMatcher {
                match_pattern: Some(MatchPattern::Exact(validation.subject_name.clone())),
                ..Default::default()
            }),
            ..Default::default()
        }];
    }

    Some(ValidationContextType::ValidationContext(context))
}

/// TLS context for a secure listener filter chain. The certificate is served
/// through SDS by its [`secret_name`].
pub fn downstream_tls_context(
    secret: &Secret,
    min_version: TlsVersion,
    max_version: TlsVersion,
    client_validation: Option<&PeerValidationContext>,
    alpn_protocols: &[&str],
) -> DownstreamTlsContext {
    let common = CommonTlsContext {
        tls_params: Some(TlsParameters {
            tls_minimum_protocol_version: tls_protocol(min_version) as i32,
            tls_maximum_protocol_version: tls_protocol(max_version) as i32,
            cipher_suites: CIPHER_SUITES.iter().map(|suite| suite.to_string()).collect(),
            ..Default::default()
        }),
        tls_certificate_sds_secret_configs: vec![sds_secret_config(secret)],
        alpn_protocols: alpn_protocols.iter().map(|proto| proto.to_string()).collect(),
        validation_context_type: client_validation.and_then(validation_context),
        ..Default::default()
    };

    DownstreamTlsContext {
        common_tls_context: Some(common),
        require_client_certificate: client_validation
            .map(|_| BoolValue { value: true }),
        ..Default::default()
    }
}

/// TLS context for a cluster whose backend speaks TLS. SNI is taken from the
/// validated subject name when present.
pub fn upstream_tls_context(
    validation: Option<&PeerValidationContext>,
    alpn_protocols: &[&str],
) -> UpstreamTlsContext {
    UpstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            alpn_protocols: alpn_protocols.iter().map(|proto| proto.to_string()).collect(),
            validation_context_type: validation.and_then(validation_context),
            ..Default::default()
        }),
        sni: validation.map(|uv| uv.subject_name.clone()).unwrap_or_default(),
        ..Default::default()
    }
}

pub fn downstream_transport_socket(context: &DownstreamTlsContext) -> TransportSocket {
    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(to_any(
            DOWNSTREAM_TLS_CONTEXT_TYPE_URL,
            context,
        ))),
    }
}

pub fn upstream_transport_socket(context: &UpstreamTlsContext) -> TransportSocket {
    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(to_any(
            UPSTREAM_TLS_CONTEXT_TYPE_URL,
            context,
        ))),
    }
}
