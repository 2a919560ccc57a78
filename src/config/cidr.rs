//! Allow/deny CIDR lists applied to every listener.

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cidr {
    pub address_prefix: String,
    pub prefix_len: u32,
}

impl Cidr {
    fn validate(&self, field: &str) -> Result<()> {
        let address: IpAddr = self.address_prefix.parse().map_err(|_| {
            Error::validation_field(
                format!("invalid CIDR address prefix {:?}", self.address_prefix),
                field,
            )
        })?;

        let max_len = if address.is_ipv4() { 32 } else { 128 };
        if self.prefix_len > max_len {
            return Err(Error::validation_field(
                format!(
                    "CIDR prefix length {} exceeds {max_len} for {}",
                    self.prefix_len, self.address_prefix
                ),
                field,
            ));
        }
        Ok(())
    }
}

/// Contents of the CIDR list file. An absent list is not enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAllowDenyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_cidrs: Option<Vec<Cidr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_cidrs: Option<Vec<Cidr>>,
}

impl IpAllowDenyConfig {
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the CIDR list file. Any failure is fatal to startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::io(e, format!("reading CIDR list {}", path.display())))?;
        let config = Self::from_json_str(&contents)?;
        info!(
            path = %path.display(),
            allow = config.allow_cidrs.as_ref().map_or(0, Vec::len),
            deny = config.deny_cidrs.as_ref().map_or(0, Vec::len),
            "Loaded CIDR allow/deny lists"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for cidr in self.allow_cidrs.iter().flatten() {
            cidr.validate("allow_cidrs")?;
        }
        for cidr in self.deny_cidrs.iter().flatten() {
            cidr.validate("deny_cidrs")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_both_lists() {
        let config = IpAllowDenyConfig::from_json_str(
            r#"{"allow_cidrs":[{"address_prefix":"10.0.0.0","prefix_len":8}],
                "deny_cidrs":[{"address_prefix":"2001:db8::","prefix_len":32}]}"#,
        )
        .unwrap();
        assert_eq!(config.allow_cidrs.as_ref().map(Vec::len), Some(1));
        assert_eq!(config.deny_cidrs.as_ref().map(|d| d[0].prefix_len), Some(32));
    }

    #[test]
    fn absent_lists_stay_absent() {
        let config = IpAllowDenyConfig::from_json_str("{}").unwrap();
        assert_eq!(config, IpAllowDenyConfig::default());
    }

    #[test]
    fn rejects_bad_prefixes() {
        let err = IpAllowDenyConfig::from_json_str(
            r#"{"deny_cidrs":[{"address_prefix":"not-an-ip","prefix_len":8}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not-an-ip"));

        assert!(IpAllowDenyConfig::from_json_str(
            r#"{"allow_cidrs":[{"address_prefix":"10.0.0.0","prefix_len":33}]}"#
        )
        .is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"allow_cidrs":[{{"address_prefix":"192.168.0.0","prefix_len":16}}]}}"#)
            .unwrap();

        let config = IpAllowDenyConfig::load(file.path()).unwrap();
        assert_eq!(config.allow_cidrs.unwrap()[0].address_prefix, "192.168.0.0");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IpAllowDenyConfig::load(dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(IpAllowDenyConfig::from_json_str("{not json").is_err());
    }
}
