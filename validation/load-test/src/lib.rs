//! Load testing tool for the Family Tree backend.
//!
//! This crate provides:
//! - An HTTP transport for the `loadgen` engine
//! - Scenario discovery and logging helpers for the CLI

pub mod http;

pub use http::HttpTransport;

use std::path::{Path, PathBuf};

use loadgen::TestConfig;
use tracing_subscriber::EnvFilter;

/// Log filter from `RUST_LOG`-style directives, falling back to `default_level`
/// when they are absent or invalid.
pub fn log_filter(directives: Option<&str>, default_level: &str) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level))
}

/// A scenario file found on disk.
#[derive(Debug, Clone)]
pub struct ScenarioEntry {
    pub file_name: String,
    pub path: PathBuf,
    pub name: String,
    pub description: String,
}

/// YAML scenario files in `dir` that parse as test configurations, sorted by file name.
pub fn discover_scenarios(dir: &Path) -> std::io::Result<Vec<ScenarioEntry>> {
    let mut scenarios = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("yaml") | Some("yml")
        );
        if !is_yaml {
            continue;
        }
        match TestConfig::from_file(&path) {
            Ok(config) => scenarios.push(ScenarioEntry {
                file_name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                path,
                name: config.name,
                description: config.description,
            }),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable scenario"),
        }
    }
    scenarios.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(scenarios)
}
