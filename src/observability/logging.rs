//! # Structured Logging
//!
//! Span macros used around control plane work, plus startup logging.

/// Create a tracing span for one graph build pass.
///
/// ```rust,ignore
/// let span = build_span!(pass);
/// let span = build_span!(pass, resources = store.len());
/// ```
#[macro_export]
macro_rules! build_span {
    ($pass:expr) => {
        tracing::info_span!("build_pass", pass = $pass)
    };
    ($pass:expr, $($field:tt)*) => {
        tracing::info_span!("build_pass", pass = $pass, $($field)*)
    };
}

/// Create a tracing span for xDS cache operations
#[macro_export]
macro_rules! xds_span {
    ($operation:expr, $type_url:expr) => {
        tracing::debug_span!(
            "xds_operation",
            operation = %$operation,
            type_url = %$type_url
        )
    };
    ($operation:expr, $type_url:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "xds_operation",
            operation = %$operation,
            type_url = %$type_url,
            $($field)*
        )
    };
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::info!(
        http_listener = %format!("{}:{}", config.listeners.http_address, config.listeners.http_port),
        https_listener = %format!("{}:{}", config.listeners.https_address, config.listeners.https_port),
        access_log_type = %config.listeners.access_log_type,
        minimum_tls_version = %config.tls.minimum_protocol_version,
        fallback_certificate = ?config.tls.fallback_certificate,
        root_namespaces = ?config.root_namespaces,
        cidr_list = ?config.cidr_list_path,
        "Ingress control plane configuration"
    );
}
