//! # Ingressplane
//!
//! Core of an Envoy ingress control plane. Routing resources that declare
//! virtual hosts and delegate route prefixes to each other are compiled into
//! a validated graph, projected into Envoy v3 listeners, routes, clusters and
//! secrets, and published through versioned snapshot caches.
//!
//! ```text
//! EntityStore → dag::Builder → Dag → xds visitors → ResourceCaches → xDS streams
//!                      ↓
//!                StatusWriter
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use ingressplane::dag::{Builder, BuilderConfig, ResourceSnapshot};
//! use ingressplane::xds::{ListenerVisitorConfig, XdsState};
//!
//! # fn main() -> ingressplane::Result<()> {
//! let snapshot = ResourceSnapshot::from_file("snapshot.yaml")?;
//! let state = XdsState::new(Builder::new(BuilderConfig::default()), ListenerVisitorConfig::default());
//! let summary = state.rebuild(&snapshot);
//! println!("{} valid routing resources", summary.valid);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod dag;
pub mod errors;
pub mod observability;
pub mod xds;

pub use errors::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
