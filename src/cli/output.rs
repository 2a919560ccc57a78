//! Output formatting for CLI commands

use anyhow::{Context, Result};
use serde::Serialize;

use crate::dag::StatusRecord;
use crate::xds::{SnapshotCache, XdsResource};

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Status of one routing resource after a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusLine {
    pub object: String,
    pub status: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vhost: Option<String>,
}

impl From<&StatusRecord> for StatusLine {
    fn from(record: &StatusRecord) -> Self {
        Self {
            object: record.object.to_string(),
            status: record.status.current_status().to_string(),
            description: record.status.description().to_string(),
            vhost: record.vhost.clone(),
        }
    }
}

/// Names and version currently held by one cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheLine {
    pub type_url: String,
    pub version: u64,
    pub names: Vec<String>,
}

impl CacheLine {
    pub fn from_cache<T: XdsResource>(cache: &SnapshotCache<T>) -> Self {
        Self {
            type_url: cache.type_url().to_string(),
            version: cache.version(),
            names: cache.contents().iter().map(|r| r.resource_name().to_string()).collect(),
        }
    }
}

/// Everything `compile` prints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileReport {
    pub statuses: Vec<StatusLine>,
    pub resources: Vec<CacheLine>,
}

impl CompileReport {
    pub fn invalid_count(&self) -> usize {
        self.statuses.iter().filter(|line| line.status == "invalid").count()
    }
}

/// Print data as JSON
pub fn print_json<T: Serialize>(data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data).context("Failed to serialize to JSON")?;
    println!("{}", json);
    Ok(())
}

/// Render a compile report as plain text.
pub fn render_text(report: &CompileReport) -> String {
    let mut out = String::new();
    let width = report.statuses.iter().map(|line| line.object.len()).max().unwrap_or(0).max(6);

    out.push_str(&format!("{:<width$}  {:<8}  DESCRIPTION\n", "OBJECT", "STATUS"));
    for line in &report.statuses {
        out.push_str(&format!("{:<width$}  {:<8}  {}\n", line.object, line.status, line.description));
    }

    for cache in &report.resources {
        let short = cache.type_url.rsplit('.').next().unwrap_or(&cache.type_url);
        out.push_str(&format!("\n{short} (version {})\n", cache.version));
        for name in &cache.names {
            out.push_str(&format!("  {name}\n"));
        }
    }
    out
}

pub fn print_report(report: &CompileReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Text => {
            print!("{}", render_text(report));
            Ok(())
        }
    }
}
