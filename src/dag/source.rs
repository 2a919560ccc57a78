//! Input resources and the read-only entity store the builder consumes.
//!
//! The watch layer that keeps these resources current lives outside this
//! crate. It hands the builder a point-in-time [`EntityStore`]; the
//! [`ResourceSnapshot`] here is the in-memory implementation used by tests and
//! the command line tool, loadable from YAML or JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Secret key holding the PEM certificate chain.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret key holding the PEM private key.
pub const TLS_KEY_KEY: &str = "tls.key";
/// Secret key holding a PEM CA bundle.
pub const CA_CERT_KEY: &str = "ca.crt";

/// Namespace-qualified resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FullName {
    pub namespace: String,
    pub name: String,
}

impl FullName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Parse a `name` or `namespace/name` reference, defaulting the namespace.
    pub fn parse(reference: &str, default_namespace: &str) -> Self {
        match reference.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::new(default_namespace, reference),
        }
    }
}

impl fmt::Display for FullName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A user-authored routing resource. Roots declare a virtual host; delegates
/// only supply route fragments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingResource {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub virtual_host: Option<VirtualHostSpec>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub tcp_proxy: Option<TcpProxySpec>,
}

impl RoutingResource {
    pub fn full_name(&self) -> FullName {
        FullName::new(&self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHostSpec {
    pub fqdn: String,
    #[serde(default)]
    pub tls: Option<TlsSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// `name` or `namespace/name` of the serving certificate secret.
    #[serde(default)]
    pub secret_name: String,
    #[serde(default)]
    pub minimum_protocol_version: String,
    #[serde(default)]
    pub maximum_protocol_version: String,
    /// Only honoured when `secret_name` is empty.
    #[serde(default)]
    pub passthrough: bool,
    #[serde(default)]
    pub enable_fallback_certificate: bool,
    #[serde(default)]
    pub client_validation: Option<ClientValidationSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientValidationSpec {
    pub ca_secret: String,
}

/// One entry of a resource's route list. Exactly one of `services` or
/// `delegate` is expected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    #[serde(rename = "match", default)]
    pub path_match: String,
    #[serde(default)]
    pub services: Vec<ServiceRef>,
    #[serde(default)]
    pub delegate: Option<DelegateRef>,
    #[serde(default)]
    pub header_match: Vec<HeaderMatchSpec>,
    #[serde(default)]
    pub enable_websockets: bool,
    #[serde(default)]
    pub permit_insecure: bool,
    #[serde(default)]
    pub prefix_rewrite: Option<String>,
    #[serde(default)]
    pub timeout_policy: Option<TimeoutPolicySpec>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub idle_timeout: Option<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicySpec>,
    #[serde(default)]
    pub hash_policy: Vec<HashPolicySpec>,
    #[serde(default)]
    pub tracing: Option<TracingSpec>,
    #[serde(default)]
    pub request_headers_policy: Option<HeadersPolicySpec>,
    #[serde(default)]
    pub response_headers_policy: Option<HeadersPolicySpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateRef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub name: String,
    pub port: i64,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub upstream_validation: Option<UpstreamValidationSpec>,
    #[serde(default)]
    pub idle_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    pub path: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub interval_seconds: u64,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub unhealthy_threshold_count: u32,
    #[serde(default)]
    pub healthy_threshold_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamValidationSpec {
    pub ca_secret: String,
    #[serde(default)]
    pub subject_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatchSpec {
    pub name: String,
    pub exact: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutPolicySpec {
    /// Response timeout; `infinity` disables it.
    #[serde(default)]
    pub request: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicySpec {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub per_try_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashPolicySpec {
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub cookie: Option<CookieHashSpec>,
    #[serde(default)]
    pub source_ip: bool,
    #[serde(default)]
    pub terminal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieHashSpec {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub ttl: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingSpec {
    #[serde(default)]
    pub client_sampling: u32,
    #[serde(default)]
    pub random_sampling: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadersPolicySpec {
    #[serde(default)]
    pub set: Vec<HeaderValueSpec>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderValueSpec {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpProxySpec {
    #[serde(default)]
    pub services: Vec<ServiceRef>,
    #[serde(default)]
    pub delegate: Option<DelegateRef>,
}

/// Backend service record as published by the watch layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub ports: Vec<ServicePortSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePortSpec {
    #[serde(default)]
    pub name: String,
    pub port: i32,
    /// `tls`, `h2` or `h2c`; empty for plain HTTP/1.
    #[serde(default)]
    pub upstream_protocol: String,
}

/// TLS key material.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRecord {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl SecretRecord {
    pub fn full_name(&self) -> FullName {
        FullName::new(&self.namespace, &self.name)
    }
}

/// Grants other namespaces permission to reference secrets in this one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDelegation {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub delegations: Vec<SecretDelegation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretDelegation {
    pub secret_name: String,
    /// Namespaces allowed to use the secret; `*` allows all.
    #[serde(default)]
    pub target_namespaces: Vec<String>,
}

/// Read-only, point-in-time view of every resource kind the builder needs.
pub trait EntityStore: Send + Sync {
    /// All routing resources, in no particular order.
    fn routing_resources(&self) -> Vec<&RoutingResource>;

    /// Look up a routing resource by identifier.
    fn routing_resource(&self, name: &FullName) -> Option<&RoutingResource>;

    /// Look up a service and the port matching `port`.
    fn lookup_service(&self, name: &FullName, port: i32) -> Option<(&ServiceRecord, &ServicePortSpec)>;

    /// Look up a secret by identifier.
    fn lookup_secret(&self, name: &FullName) -> Option<&SecretRecord>;

    /// Whether `consumer_namespace` may use `secret`.
    fn delegation_permitted(&self, secret: &FullName, consumer_namespace: &str) -> bool;
}

/// On-disk layout of a snapshot file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFile {
    #[serde(default)]
    routing_resources: Vec<RoutingResource>,
    #[serde(default)]
    services: Vec<ServiceRecord>,
    #[serde(default)]
    secrets: Vec<SecretRecord>,
    #[serde(default)]
    certificate_delegations: Vec<CertificateDelegation>,
}

/// In-memory [`EntityStore`] keyed by namespace/name.
#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshot {
    routing_resources: BTreeMap<FullName, RoutingResource>,
    services: BTreeMap<FullName, ServiceRecord>,
    secrets: BTreeMap<FullName, SecretRecord>,
    delegations: BTreeMap<FullName, CertificateDelegation>,
}

impl ResourceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a snapshot from YAML (JSON is accepted as a YAML subset).
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let file: SnapshotFile = serde_yaml::from_str(contents).map_err(|source| Error::Yaml {
            source,
            context: "Failed to parse resource snapshot".to_string(),
        })?;
        Ok(Self::from(file))
    }

    /// Read and parse a snapshot file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::io(e, format!("Failed to read snapshot '{}'", path.display())))?;
        Self::from_yaml_str(&contents)
    }

    pub fn insert_routing_resource(&mut self, resource: RoutingResource) -> &mut Self {
        self.routing_resources.insert(resource.full_name(), resource);
        self
    }

    pub fn insert_service(&mut self, service: ServiceRecord) -> &mut Self {
        self.services.insert(FullName::new(&service.namespace, &service.name), service);
        self
    }

    pub fn insert_secret(&mut self, secret: SecretRecord) -> &mut Self {
        self.secrets.insert(secret.full_name(), secret);
        self
    }

    pub fn insert_certificate_delegation(&mut self, delegation: CertificateDelegation) -> &mut Self {
        self.delegations
            .insert(FullName::new(&delegation.namespace, &delegation.name), delegation);
        self
    }

    pub fn len(&self) -> usize {
        self.routing_resources.len() + self.services.len() + self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<SnapshotFile> for ResourceSnapshot {
    fn from(file: SnapshotFile) -> Self {
        let mut snapshot = Self::new();
        for resource in file.routing_resources {
            snapshot.insert_routing_resource(resource);
        }
        for service in file.services {
            snapshot.insert_service(service);
        }
        for secret in file.secrets {
            snapshot.insert_secret(secret);
        }
        for delegation in file.certificate_delegations {
            snapshot.insert_certificate_delegation(delegation);
        }
        snapshot
    }
}

impl EntityStore for ResourceSnapshot {
    fn routing_resources(&self) -> Vec<&RoutingResource> {
        self.routing_resources.values().collect()
    }

    fn routing_resource(&self, name: &FullName) -> Option<&RoutingResource> {
        self.routing_resources.get(name)
    }

    fn lookup_service(&self, name: &FullName, port: i32) -> Option<(&ServiceRecord, &ServicePortSpec)> {
        let service = self.services.get(name)?;
        let port = service.ports.iter().find(|p| p.port == port)?;
        Some((service, port))
    }

    fn lookup_secret(&self, name: &FullName) -> Option<&SecretRecord> {
        self.secrets.get(name)
    }

    fn delegation_permitted(&self, secret: &FullName, consumer_namespace: &str) -> bool {
        if secret.namespace == consumer_namespace {
            return true;
        }

        self.delegations
            .values()
            .filter(|d| d.namespace == secret.namespace)
            .flat_map(|d| d.delegations.iter())
            .filter(|d| d.secret_name == secret.name)
            .any(|d| d.target_namespaces.iter().any(|ns| ns == consumer_namespace || ns == "*"))
    }
}
