//! # Configuration Settings
//!
//! Process configuration for the ingress control plane. Values come from
//! built-in defaults, then an optional YAML file, then `INGRESSPLANE_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use crate::config::IpAllowDenyConfig;
use crate::dag::{BuilderConfig, FullName, TlsVersion};
use crate::xds::access_log::{
    default_json_fields, validate_json_fields, AccessLogConfig, AccessLogType,
};
use crate::xds::listener::{
    ListenerVisitorConfig, DEFAULT_ACCESS_LOG, DEFAULT_HTTPS_ADDRESS, DEFAULT_HTTPS_PORT,
    DEFAULT_HTTP_ADDRESS, DEFAULT_HTTP_PORT,
};
use crate::{Error, Result};

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "INGRESSPLANE_";

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    #[validate(nested)]
    pub listeners: ListenerSettings,

    #[validate(nested)]
    pub tls: TlsSettings,

    /// Request timeout for the HTTP connection manager. Negative or zero
    /// disables it.
    pub request_timeout_seconds: i64,

    /// Namespaces allowed to hold root routing resources. Empty allows all.
    pub root_namespaces: Vec<String>,

    /// Ignore `permit_insecure` on routes.
    pub disable_permit_insecure: bool,

    /// JSON file with allow/deny CIDR lists.
    pub cidr_list_path: Option<PathBuf>,

    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listeners: ListenerSettings::default(),
            tls: TlsSettings::default(),
            request_timeout_seconds: 0,
            root_namespaces: Vec::new(),
            disable_permit_insecure: false,
            cidr_list_path: None,
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Listener addresses, ports and access logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ListenerSettings {
    #[validate(length(min = 1, message = "HTTP address cannot be empty"))]
    pub http_address: String,

    #[validate(range(min = 1, max = 65535, message = "HTTP port must be between 1 and 65535"))]
    pub http_port: u32,

    #[validate(length(min = 1, message = "HTTP access log path cannot be empty"))]
    pub http_access_log: String,

    #[validate(length(min = 1, message = "HTTPS address cannot be empty"))]
    pub https_address: String,

    #[validate(range(min = 1, max = 65535, message = "HTTPS port must be between 1 and 65535"))]
    pub https_port: u32,

    #[validate(length(min = 1, message = "HTTPS access log path cannot be empty"))]
    pub https_access_log: String,

    /// `envoy` or `json`.
    pub access_log_type: String,

    /// JSON access log fields, in output order.
    pub access_log_fields: Vec<String>,

    pub use_proxy_protocol: bool,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            http_address: DEFAULT_HTTP_ADDRESS.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            http_access_log: DEFAULT_ACCESS_LOG.to_string(),
            https_address: DEFAULT_HTTPS_ADDRESS.to_string(),
            https_port: DEFAULT_HTTPS_PORT,
            https_access_log: DEFAULT_ACCESS_LOG.to_string(),
            access_log_type: "envoy".to_string(),
            access_log_fields: default_json_fields(),
            use_proxy_protocol: false,
        }
    }
}

/// Downstream TLS settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsSettings {
    /// Lowest TLS version any secure listener accepts.
    pub minimum_protocol_version: String,

    /// `namespace/name` of the certificate served to clients without SNI on
    /// hosts that opt in.
    pub fallback_certificate: Option<String>,

    /// `namespace/name` of a certificate served to every client without SNI.
    pub default_certificate: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            minimum_protocol_version: "1.1".to_string(),
            fallback_certificate: None,
            default_certificate: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Default filter directive when `RUST_LOG` is unset.
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "ingressplane".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

fn parse_reference(reference: &str, field: &str) -> Result<FullName> {
    match reference.split_once('/') {
        Some((namespace, name))
            if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok(FullName::new(namespace, name))
        }
        _ => Err(Error::validation_field(
            format!("certificate reference {reference:?} must be namespace/name"),
            field,
        )),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty()).map(String::from).collect()
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("invalid value {value:?} for {ENV_PREFIX}{key}")))
}

impl AppConfig {
    /// Load a YAML configuration file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::io(e, format!("reading config file {}", path.display())))?;
        let config: Self = serde_yaml::from_str(&contents)?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Defaults overridden by `INGRESSPLANE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `INGRESSPLANE_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Apply overrides from `lookup`, keyed by variable name without prefix.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("HTTP_ADDRESS") {
            self.listeners.http_address = value;
        }
        if let Some(value) = lookup("HTTP_PORT") {
            self.listeners.http_port = parse_env("HTTP_PORT", &value)?;
        }
        if let Some(value) = lookup("HTTP_ACCESS_LOG") {
            self.listeners.http_access_log = value;
        }
        if let Some(value) = lookup("HTTPS_ADDRESS") {
            self.listeners.https_address = value;
        }
        if let Some(value) = lookup("HTTPS_PORT") {
            self.listeners.https_port = parse_env("HTTPS_PORT", &value)?;
        }
        if let Some(value) = lookup("HTTPS_ACCESS_LOG") {
            self.listeners.https_access_log = value;
        }
        if let Some(value) = lookup("ACCESS_LOG_TYPE") {
            self.listeners.access_log_type = value;
        }
        if let Some(value) = lookup("ACCESS_LOG_FIELDS") {
            self.listeners.access_log_fields = split_list(&value);
        }
        if let Some(value) = lookup("USE_PROXY_PROTOCOL") {
            self.listeners.use_proxy_protocol = parse_env("USE_PROXY_PROTOCOL", &value)?;
        }
        if let Some(value) = lookup("TLS_MINIMUM_PROTOCOL_VERSION") {
            self.tls.minimum_protocol_version = value;
        }
        if let Some(value) = lookup("FALLBACK_CERTIFICATE") {
            self.tls.fallback_certificate = Some(value);
        }
        if let Some(value) = lookup("DEFAULT_CERTIFICATE") {
            self.tls.default_certificate = Some(value);
        }
        if let Some(value) = lookup("REQUEST_TIMEOUT_SECONDS") {
            self.request_timeout_seconds = parse_env("REQUEST_TIMEOUT_SECONDS", &value)?;
        }
        if let Some(value) = lookup("ROOT_NAMESPACES") {
            self.root_namespaces = split_list(&value);
        }
        if let Some(value) = lookup("DISABLE_PERMIT_INSECURE") {
            self.disable_permit_insecure = parse_env("DISABLE_PERMIT_INSECURE", &value)?;
        }
        if let Some(value) = lookup("CIDR_LIST_PATH") {
            self.cidr_list_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("LOG_LEVEL") {
            self.observability.log_level = value;
        }
        if let Some(value) = lookup("JSON_LOGGING") {
            self.observability.json_logging = parse_env("JSON_LOGGING", &value)?;
        }
        Ok(self)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    fn validate_custom(&self) -> Result<()> {
        if self.listeners.http_port == self.listeners.https_port
            && self.listeners.http_address == self.listeners.https_address
        {
            return Err(Error::validation_field(
                "HTTP and HTTPS listeners cannot share an address and port",
                "listeners.https_port",
            ));
        }

        AccessLogType::parse(&self.listeners.access_log_type)?;
        validate_json_fields(&self.listeners.access_log_fields)?;

        if TlsVersion::parse_strict(&self.tls.minimum_protocol_version).is_none() {
            return Err(Error::validation_field(
                format!(
                    "unknown TLS version {:?}, expected 1.1, 1.2 or 1.3",
                    self.tls.minimum_protocol_version
                ),
                "tls.minimum_protocol_version",
            ));
        }
        if let Some(reference) = &self.tls.fallback_certificate {
            parse_reference(reference, "tls.fallback_certificate")?;
        }
        if let Some(reference) = &self.tls.default_certificate {
            parse_reference(reference, "tls.default_certificate")?;
        }
        Ok(())
    }

    fn minimum_tls_version(&self) -> TlsVersion {
        TlsVersion::parse(&self.tls.minimum_protocol_version).max(TlsVersion::V1_1)
    }

    /// Settings for the graph builder.
    pub fn builder_config(&self) -> Result<BuilderConfig> {
        Ok(BuilderConfig {
            minimum_tls_version: self.minimum_tls_version(),
            fallback_certificate: self
                .tls
                .fallback_certificate
                .as_deref()
                .map(|reference| parse_reference(reference, "tls.fallback_certificate"))
                .transpose()?,
            root_namespaces: self.root_namespaces.clone(),
            disable_permit_insecure: self.disable_permit_insecure,
        })
    }

    /// Settings for listener projection. Loads the CIDR list file when one
    /// is configured.
    pub fn listener_config(&self) -> Result<ListenerVisitorConfig> {
        let ip_allow_deny = self.cidr_list_path.as_ref().map(IpAllowDenyConfig::load).transpose()?;
        let listeners = &self.listeners;

        Ok(ListenerVisitorConfig {
            http_address: listeners.http_address.clone(),
            http_port: listeners.http_port,
            http_access_log: listeners.http_access_log.clone(),
            https_address: listeners.https_address.clone(),
            https_port: listeners.https_port,
            https_access_log: listeners.https_access_log.clone(),
            access_log: AccessLogConfig {
                log_type: AccessLogType::parse(&listeners.access_log_type)?,
                fields: listeners.access_log_fields.clone(),
            },
            use_proxy_protocol: listeners.use_proxy_protocol,
            minimum_tls_version: self.minimum_tls_version(),
            default_certificate: self
                .tls
                .default_certificate
                .as_deref()
                .map(|reference| parse_reference(reference, "tls.default_certificate"))
                .transpose()?,
            request_timeout: ListenerVisitorConfig::request_timeout_from_seconds(
                self.request_timeout_seconds,
            ),
            ip_allow_deny,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        ListenerVisitorConfig::request_timeout_from_seconds(self.request_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.listeners.http_port, 8080);
        assert_eq!(config.listeners.https_port, 8443);
        assert_eq!(config.tls.minimum_protocol_version, "1.1");
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listeners:\n  http_port: 9080\n  access_log_type: json\n\
             tls:\n  minimum_protocol_version: \"1.2\"\n  fallback_certificate: admin/fallback\n\
             request_timeout_seconds: 30\nroot_namespaces: [roots]"
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listeners.http_port, 9080);
        assert_eq!(config.listeners.https_port, 8443);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));

        let builder = config.builder_config().unwrap();
        assert_eq!(builder.minimum_tls_version, TlsVersion::V1_2);
        assert_eq!(builder.fallback_certificate, Some(FullName::new("admin", "fallback")));
        assert_eq!(builder.root_namespaces, vec!["roots".to_string()]);
    }

    #[test]
    fn env_overrides_apply_on_top() {
        let config = AppConfig::default()
            .with_overrides(overrides(&[
                ("HTTP_PORT", "9000"),
                ("ROOT_NAMESPACES", "a, b,"),
                ("USE_PROXY_PROTOCOL", "true"),
                ("REQUEST_TIMEOUT_SECONDS", "-1"),
            ]))
            .unwrap();

        assert_eq!(config.listeners.http_port, 9000);
        assert_eq!(config.root_namespaces, vec!["a".to_string(), "b".to_string()]);
        assert!(config.listeners.use_proxy_protocol);
        assert_eq!(config.request_timeout(), Duration::ZERO);
    }

    #[test]
    fn bad_env_value_is_a_config_error() {
        let err = AppConfig::default()
            .with_overrides(overrides(&[("HTTPS_PORT", "many")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("INGRESSPLANE_HTTPS_PORT"));
    }

    #[test]
    fn rejects_conflicting_ports() {
        let mut config = AppConfig::default();
        config.listeners.https_port = config.listeners.http_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_port_out_of_range() {
        let mut config = AppConfig::default();
        config.listeners.http_port = 70000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_access_log_settings() {
        let mut config = AppConfig::default();
        config.listeners.access_log_type = "xml".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.listeners.access_log_fields.push("bogus".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_tls_settings() {
        let mut config = AppConfig::default();
        config.tls.minimum_protocol_version = "1.0".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.tls.fallback_certificate = Some("no-namespace".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("namespace/name"));
    }

    #[test]
    fn listener_config_loads_cidr_list() {
        let mut cidrs = NamedTempFile::new().unwrap();
        write!(cidrs, r#"{{"deny_cidrs":[{{"address_prefix":"10.0.0.0","prefix_len":8}}]}}"#)
            .unwrap();

        let config = AppConfig {
            cidr_list_path: Some(cidrs.path().to_path_buf()),
            tls: TlsSettings {
                default_certificate: Some("admin/default".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        let listeners = config.listener_config().unwrap();
        assert_eq!(
            listeners.ip_allow_deny.and_then(|c| c.deny_cidrs).map(|d| d.len()),
            Some(1)
        );
        assert_eq!(listeners.default_certificate, Some(FullName::new("admin", "default")));
        assert_eq!(listeners.minimum_tls_version, TlsVersion::V1_1);
    }

    #[test]
    fn missing_cidr_file_is_fatal() {
        let config = AppConfig {
            cidr_list_path: Some(PathBuf::from("/nonexistent/cidrs.json")),
            ..Default::default()
        };
        assert!(config.listener_config().is_err());
    }
}
