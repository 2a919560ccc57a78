//! # Configuration Management
//!
//! Static process configuration: listener layout, TLS floor and certificates,
//! root namespace restriction, the CIDR allow/deny file and logging.

pub mod cidr;
pub mod settings;

pub use cidr::{Cidr, IpAllowDenyConfig};
pub use settings::{
    AppConfig, ListenerSettings, ObservabilityConfig, TlsSettings, ENV_PREFIX,
};
