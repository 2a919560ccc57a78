//! File access log configuration for listeners
//!
//! Envoy writes one line per request either in its default text format or as
//! a JSON object built from a configurable set of named fields.

use envoy_types::pb::envoy::config::accesslog::v3::{
    access_log::ConfigType as AccessLogConfigType, AccessLog,
};
use envoy_types::pb::envoy::extensions::access_loggers::file::v3::FileAccessLog;
use envoy_types::pb::google::protobuf::Any;
use serde::{Deserialize, Serialize};

use crate::xds::envoy::to_any;
use crate::xds::structs::{string_value, OrderedStruct};
use crate::{Error, Result};

pub const FILE_ACCESS_LOG_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.access_loggers.file.v3.FileAccessLog";

const FILE_ACCESS_LOG_NAME: &str = "envoy.access_loggers.file";

/// Every JSON field name that can be logged, with its Envoy command operator.
const JSON_FIELDS: &[(&str, &str)] = &[
    ("@timestamp", "%START_TIME%"),
    ("ts", "%START_TIME%"),
    ("authority", "%REQ(:AUTHORITY)%"),
    ("bytes_received", "%BYTES_RECEIVED%"),
    ("bytes_sent", "%BYTES_SENT%"),
    ("downstream_local_address", "%DOWNSTREAM_LOCAL_ADDRESS%"),
    ("downstream_remote_address", "%DOWNSTREAM_REMOTE_ADDRESS%"),
    ("duration", "%DURATION%"),
    ("method", "%REQ(:METHOD)%"),
    ("path", "%REQ(X-ENVOY-ORIGINAL-PATH?:PATH)%"),
    ("protocol", "%PROTOCOL%"),
    ("request_id", "%REQ(X-REQUEST-ID)%"),
    ("requested_server_name", "%REQUESTED_SERVER_NAME%"),
    ("response_code", "%RESPONSE_CODE%"),
    ("response_flags", "%RESPONSE_FLAGS%"),
    ("uber_trace_id", "%REQ(UBER-TRACE-ID)%"),
    ("upstream_cluster", "%UPSTREAM_CLUSTER%"),
    ("upstream_host", "%UPSTREAM_HOST%"),
    ("upstream_local_address", "%UPSTREAM_LOCAL_ADDRESS%"),
    ("upstream_service_time", "%RESP(X-ENVOY-UPSTREAM-SERVICE-TIME)%"),
    ("user_agent", "%REQ(USER-AGENT)%"),
    ("x_forwarded_for", "%REQ(X-FORWARDED-FOR)%"),
];

/// Fields logged when JSON logging is enabled without an explicit list.
pub const DEFAULT_JSON_FIELDS: &[&str] = &[
    "@timestamp",
    "authority",
    "bytes_received",
    "bytes_sent",
    "downstream_local_address",
    "downstream_remote_address",
    "duration",
    "method",
    "path",
    "protocol",
    "request_id",
    "requested_server_name",
    "response_code",
    "response_flags",
    "uber_trace_id",
    "upstream_cluster",
    "upstream_host",
    "upstream_local_address",
    "upstream_service_time",
    "user_agent",
    "x_forwarded_for",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLogType {
    #[default]
    Envoy,
    Json,
}

impl AccessLogType {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "envoy" | "" => Ok(Self::Envoy),
            "json" => Ok(Self::Json),
            other => Err(Error::validation_field(
                format!("unknown access log type {other:?}, expected \"envoy\" or \"json\""),
                "listeners.access_log_type",
            )),
        }
    }
}

pub fn default_json_fields() -> Vec<String> {
    DEFAULT_JSON_FIELDS.iter().map(|field| field.to_string()).collect()
}

fn json_operator(field: &str) -> Option<&'static str> {
    JSON_FIELDS.iter().find(|(name, _)| *name == field).map(|(_, operator)| *operator)
}

/// Reject any field name that has no Envoy command operator.
pub fn validate_json_fields(fields: &[String]) -> Result<()> {
    match fields.iter().find(|field| json_operator(field).is_none()) {
        Some(unknown) => Err(Error::validation_field(
            format!("unknown access log json field {unknown:?}"),
            "listeners.access_log_fields",
        )),
        None => Ok(()),
    }
}

/// Access log settings shared by all listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogConfig {
    pub log_type: AccessLogType,
    /// JSON fields, in output order. Ignored for the envoy format.
    pub fields: Vec<String>,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self { log_type: AccessLogType::Envoy, fields: default_json_fields() }
    }
}

/// `FileAccessLog` with a JSON `log_format`, kept in field order.
#[derive(Clone, PartialEq, prost::Message)]
struct JsonFileAccessLog {
    #[prost(string, tag = "1")]
    path: String,
    #[prost(message, optional, tag = "5")]
    log_format: Option<JsonFormatString>,
}

/// `SubstitutionFormatString` with `json_format` set.
#[derive(Clone, PartialEq, prost::Message)]
struct JsonFormatString {
    #[prost(message, optional, tag = "2")]
    json_format: Option<OrderedStruct>,
}

impl AccessLogConfig {
    /// Build the file access loggers writing to `path`.
    pub fn build(&self, path: &str) -> Vec<AccessLog> {
        vec![AccessLog {
            name: FILE_ACCESS_LOG_NAME.to_string(),
            filter: None,
            config_type: Some(AccessLogConfigType::TypedConfig(self.file_access_log(path))),
        }]
    }

    fn file_access_log(&self, path: &str) -> Any {
        match self.log_type {
            AccessLogType::Envoy => to_any(
                FILE_ACCESS_LOG_TYPE_URL,
                &FileAccessLog { path: path.to_string(), access_log_format: None },
            ),
            AccessLogType::Json => {
                let fields = self
                    .fields
                    .iter()
                    .filter_map(|field| {
                        json_operator(field).map(|operator| (field.clone(), string_value(operator)))
                    })
                    .collect();
                let file_log = JsonFileAccessLog {
                    path: path.to_string(),
                    log_format: Some(JsonFormatString {
                        json_format: Some(OrderedStruct { fields }),
                    }),
                };
                to_any(FILE_ACCESS_LOG_TYPE_URL, &file_log)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::core::v3::substitution_format_string::Format;
    use envoy_types::pb::envoy::extensions::access_loggers::file::v3::file_access_log::AccessLogFormat;
    use envoy_types::pb::google::protobuf::value::Kind;
    use prost::Message;

    fn decode(logs: &[AccessLog]) -> FileAccessLog {
        match logs[0].config_type.as_ref() {
            Some(AccessLogConfigType::TypedConfig(any)) => {
                assert_eq!(any.type_url, FILE_ACCESS_LOG_TYPE_URL);
                FileAccessLog::decode(any.value.as_slice()).expect("decode file access log")
            }
            other => panic!("unexpected config type: {:?}", other),
        }
    }

    #[test]
    fn envoy_format_uses_default_layout() {
        let logs = AccessLogConfig::default().build("/dev/stdout");
        let file_log = decode(&logs);
        assert_eq!(file_log.path, "/dev/stdout");
        assert!(file_log.access_log_format.is_none());
    }

    #[test]
    fn json_format_maps_fields_to_operators() {
        let config = AccessLogConfig {
            log_type: AccessLogType::Json,
            fields: vec!["method".into(), "response_code".into()],
        };
        let file_log = decode(&config.build("/var/log/envoy.log"));

        let Some(AccessLogFormat::LogFormat(format)) = file_log.access_log_format else {
            panic!("expected json log format");
        };
        let Some(Format::JsonFormat(fields)) = format.format else {
            panic!("expected json format");
        };
        assert_eq!(fields.fields.len(), 2);
        assert_eq!(
            fields.fields.get("method").and_then(|value| value.kind.clone()),
            Some(Kind::StringValue("%REQ(:METHOD)%".to_string()))
        );
    }

    #[test]
    fn json_format_encodes_identically_across_builds() {
        let config = AccessLogConfig { log_type: AccessLogType::Json, ..Default::default() };
        let encoded = |logs: Vec<AccessLog>| match logs[0].config_type.clone() {
            Some(AccessLogConfigType::TypedConfig(any)) => any.value,
            other => panic!("unexpected config type: {:?}", other),
        };

        let first = encoded(config.build("/dev/stdout"));
        for _ in 0..20 {
            assert_eq!(encoded(config.build("/dev/stdout")), first);
        }
        assert_eq!(decode(&config.build("/dev/stdout")).path, "/dev/stdout");
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert!(validate_json_fields(&default_json_fields()).is_ok());
        let err = validate_json_fields(&["nope".to_string()]).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn parses_access_log_type() {
        assert_eq!(AccessLogType::parse("json").unwrap(), AccessLogType::Json);
        assert_eq!(AccessLogType::parse("").unwrap(), AccessLogType::Envoy);
        assert!(AccessLogType::parse("xml").is_err());
    }
}
