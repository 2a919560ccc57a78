//! Translation of route and service policy fields into graph values.
//!
//! Every function here is pure; range errors come back as the message the
//! builder attaches to the owning resource.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use super::source::{
    HashPolicySpec, HeaderMatchSpec, HeadersPolicySpec, HealthCheckSpec, RetryPolicySpec,
    TracingSpec,
};
use super::{
    HashPolicy, HashPolicyKind, HeaderCondition, HeadersPolicy, HttpHealthCheckPolicy,
    RetryPolicy, TimeoutSetting, TracingSampling,
};

/// Upper bound for route and cluster idle timeouts.
pub const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;
const DEFAULT_HEALTHY_THRESHOLD: u32 = 2;
const DEFAULT_HEALTH_CHECK_HOST: &str = "ingressplane-envoy-healthcheck";

/// A duration that may carry a sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedDuration {
    pub negative: bool,
    pub magnitude: Duration,
}

impl SignedDuration {
    pub fn is_negative(&self) -> bool {
        self.negative && !self.magnitude.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        !self.negative && !self.magnitude.is_zero()
    }
}

/// Parse durations such as `30s`, `1h 30m`, `-1s` or `0`.
pub fn parse_duration(value: &str) -> Result<SignedDuration, humantime::DurationError> {
    let trimmed = value.trim();
    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, trimmed),
    };

    let magnitude = if rest == "0" { Duration::ZERO } else { humantime::parse_duration(rest)? };
    Ok(SignedDuration { negative, magnitude })
}

/// Resolve an idle timeout: values above one hour are clamped, zero or
/// negative values cannot disable the timeout.
pub fn idle_timeout(value: &str) -> Result<Duration, String> {
    let parsed = parse_duration(value).map_err(|e| format!("invalid idle timeout {value:?}: {e}"))?;
    if !parsed.is_positive() {
        return Err("idle timeout can not be disabled".to_string());
    }
    Ok(parsed.magnitude.min(MAX_IDLE_TIMEOUT))
}

/// Resolve a plain route timeout, which must not be negative.
pub fn route_timeout(value: &str) -> Result<TimeoutSetting, String> {
    let parsed = parse_duration(value).map_err(|e| format!("invalid timeout {value:?}: {e}"))?;
    if parsed.is_negative() {
        return Err("timeout value must be >= 0".to_string());
    }
    if parsed.magnitude.is_zero() {
        return Ok(TimeoutSetting::Disabled);
    }
    Ok(TimeoutSetting::Value(parsed.magnitude))
}

/// Resolve a response timeout from a timeout policy. `infinity` and values
/// that cannot be parsed disable the timeout; an empty value keeps the
/// default.
pub fn response_timeout(value: Option<&str>) -> TimeoutSetting {
    let Some(value) = value.map(str::trim) else {
        return TimeoutSetting::Default;
    };

    match value {
        "" => TimeoutSetting::Default,
        "infinity" | "infinite" => TimeoutSetting::Disabled,
        other => match parse_duration(other) {
            Ok(parsed) if parsed.is_positive() => TimeoutSetting::Value(parsed.magnitude),
            Ok(parsed) if parsed.magnitude.is_zero() => TimeoutSetting::Default,
            _ => TimeoutSetting::Disabled,
        },
    }
}

pub fn retry_policy(spec: Option<&RetryPolicySpec>) -> Option<RetryPolicy> {
    let spec = spec?;
    let per_try_timeout = spec
        .per_try_timeout
        .as_deref()
        .and_then(|value| parse_duration(value).ok())
        .filter(SignedDuration::is_positive)
        .map(|parsed| parsed.magnitude);

    Some(RetryPolicy {
        retry_on: "5xx".to_string(),
        num_retries: spec.count.max(1),
        per_try_timeout,
    })
}

/// Sum of upstream weights, or `None` when it overflows the wire type.
pub fn total_weight(weights: impl IntoIterator<Item = u32>) -> Option<u32> {
    weights.into_iter().try_fold(0u32, |total, weight| total.checked_add(weight))
}

pub fn health_check_policy(spec: Option<&HealthCheckSpec>) -> Option<HttpHealthCheckPolicy> {
    let spec = spec?;
    let or_default = |value: u64, default: Duration| {
        if value == 0 {
            default
        } else {
            Duration::from_secs(value)
        }
    };

    Some(HttpHealthCheckPolicy {
        path: spec.path.clone(),
        host: spec.host.clone().unwrap_or_else(|| DEFAULT_HEALTH_CHECK_HOST.to_string()),
        interval: or_default(spec.interval_seconds, DEFAULT_HEALTH_CHECK_INTERVAL),
        timeout: or_default(spec.timeout_seconds, DEFAULT_HEALTH_CHECK_TIMEOUT),
        unhealthy_threshold: match spec.unhealthy_threshold_count {
            0 => DEFAULT_UNHEALTHY_THRESHOLD,
            n => n,
        },
        healthy_threshold: match spec.healthy_threshold_count {
            0 => DEFAULT_HEALTHY_THRESHOLD,
            n => n,
        },
    })
}

pub fn tracing_sampling(spec: Option<&TracingSpec>) -> Result<Option<TracingSampling>, String> {
    let Some(spec) = spec else {
        return Ok(None);
    };
    if spec.client_sampling > 100 {
        return Err("tracing clientSampling must be in the range [0,100]".to_string());
    }
    if spec.random_sampling > 100 {
        return Err("tracing randomSampling must be in the range [0,100]".to_string());
    }
    Ok(Some(TracingSampling { client: spec.client_sampling, random: spec.random_sampling }))
}

pub fn hash_policies(specs: &[HashPolicySpec]) -> Vec<HashPolicy> {
    specs
        .iter()
        .filter_map(|spec| {
            let kind = if let Some(header) = &spec.header {
                HashPolicyKind::Header { name: header.clone() }
            } else if let Some(cookie) = &spec.cookie {
                HashPolicyKind::Cookie {
                    name: cookie.name.clone(),
                    path: cookie.path.clone(),
                    ttl: cookie
                        .ttl
                        .as_deref()
                        .and_then(|ttl| parse_duration(ttl).ok())
                        .filter(|parsed| !parsed.negative)
                        .map(|parsed| parsed.magnitude),
                }
            } else if spec.source_ip {
                HashPolicyKind::SourceIp
            } else {
                return None;
            };
            Some(HashPolicy { kind, terminal: spec.terminal })
        })
        .collect()
}

/// Reject two exact-match conditions on the same header name.
pub fn header_conditions_valid(conditions: &[HeaderMatchSpec]) -> bool {
    let mut seen = HashSet::new();
    conditions.iter().all(|condition| seen.insert(condition.name.to_ascii_lowercase()))
}

pub fn header_conditions(conditions: &[HeaderMatchSpec]) -> Vec<HeaderCondition> {
    conditions
        .iter()
        .map(|condition| HeaderCondition {
            name: condition.name.clone(),
            value: condition.exact.clone(),
        })
        .collect()
}

/// Build a header rewrite policy. `Host` may only be set on requests, where
/// it becomes a host rewrite.
pub fn headers_policy(spec: &HeadersPolicySpec, allow_host: bool) -> Result<HeadersPolicy, String> {
    let mut set = BTreeMap::new();
    let mut host_rewrite = None;

    for header in &spec.set {
        let key = canonical_header_key(&header.name);
        if !is_header_name(&key) {
            return Err(format!("invalid set header {:?}: not a valid header name", key));
        }
        if set.contains_key(&key) || (key == "Host" && host_rewrite.is_some()) {
            return Err(format!("duplicate header addition: {:?}", key));
        }
        if key == "Host" {
            if !allow_host {
                return Err(format!("rewriting {:?} header is not supported", key));
            }
            host_rewrite = Some(header.value.clone());
            continue;
        }
        set.insert(key, header.value.clone());
    }

    let mut remove = Vec::with_capacity(spec.remove.len());
    for name in &spec.remove {
        let key = canonical_header_key(name);
        if !is_header_name(&key) {
            return Err(format!("invalid remove header {:?}: not a valid header name", key));
        }
        if remove.contains(&key) {
            return Err(format!("duplicate header removal: {:?}", key));
        }
        remove.push(key);
    }

    Ok(HeadersPolicy { set, host_rewrite, remove })
}

/// Whether `path` lies within `prefix`, comparing whole path segments. An
/// empty prefix matches everything; an empty path matches nothing.
pub fn matches_path_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    if path.is_empty() {
        return false;
    }

    let with_slash = |value: &str| {
        if value.ends_with('/') {
            value.to_string()
        } else {
            format!("{value}/")
        }
    };
    with_slash(path).starts_with(&with_slash(prefix))
}

/// `content-type` becomes `Content-Type`.
fn canonical_header_key(name: &str) -> String {
    name.trim()
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}
