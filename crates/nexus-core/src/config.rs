//! Layered configuration (spec §6): built-in defaults -> file -> `NEXUS_`-prefixed env vars
//! (`__` section separator) -> command-line overrides.

use crate::error::{NexusError, NexusResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Data options the core recognizes (spec §6). Everything else is a host concern and is
/// simply not modeled here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NexusConfig {
    /// Ceiling the memory tracker (4.G) admits against, in bytes.
    #[serde(default = "default_total_buffer_memory")]
    pub total_buffer_memory_consumption: u64,

    /// Duration spanned by one cache file (4.F). Stored in seconds on the wire.
    #[serde(default = "default_cache_file_period_secs", rename = "cache_file_period_secs")]
    pub cache_file_period_secs: u64,

    /// Default writer file-type label, a purely host-facing hint.
    #[serde(default = "default_file_type")]
    pub default_file_type: String,

    /// Directory cache files are written under. Not named in spec §6's option list, but a
    /// file-backed cache engine cannot exist without one (see SPEC_FULL.md §6).
    #[serde(default = "default_cache_root_dir")]
    pub cache_root_dir: PathBuf,
}

fn default_total_buffer_memory() -> u64 {
    256 * 1024 * 1024
}
fn default_cache_file_period_secs() -> u64 {
    24 * 60 * 60
}
fn default_file_type() -> String {
    "raw".to_string()
}
fn default_cache_root_dir() -> PathBuf {
    PathBuf::from("./nexus-cache")
}

impl Default for NexusConfig {
    fn default() -> Self {
        NexusConfig {
            total_buffer_memory_consumption: default_total_buffer_memory(),
            cache_file_period_secs: default_cache_file_period_secs(),
            default_file_type: default_file_type(),
            cache_root_dir: default_cache_root_dir(),
        }
    }
}

impl NexusConfig {
    pub fn cache_file_period(&self) -> Duration {
        Duration::from_secs(self.cache_file_period_secs)
    }

    /// Layer defaults -> optional file -> `NEXUS_`-prefixed env vars. CLI overrides are
    /// applied by the caller afterwards via `with_cli_overrides`, since they come from
    /// `clap` matches that only the binary knows about.
    pub fn load(file_path: Option<&std::path::Path>) -> NexusResult<Self> {
        let defaults = NexusConfig::default();
        let mut builder = config::Config::builder()
            .set_default("total_buffer_memory_consumption", defaults.total_buffer_memory_consumption)
            .map_err(config_err)?
            .set_default("cache_file_period_secs", defaults.cache_file_period_secs)
            .map_err(config_err)?
            .set_default("default_file_type", defaults.default_file_type.clone())
            .map_err(config_err)?
            .set_default(
                "cache_root_dir",
                defaults.cache_root_dir.to_string_lossy().to_string(),
            )
            .map_err(config_err)?;

        if let Some(path) = file_path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("NEXUS")
                .separator("__")
                .try_parsing(true),
        );

        let built = builder.build().map_err(config_err)?;
        built.try_deserialize().map_err(config_err)
    }

    pub fn with_cli_override_memory(mut self, bytes: Option<u64>) -> Self {
        if let Some(bytes) = bytes {
            self.total_buffer_memory_consumption = bytes;
        }
        self
    }
}

fn config_err(e: config::ConfigError) -> NexusError {
    NexusError::Validation(format!("configuration error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = NexusConfig::default();
        assert_eq!(cfg.total_buffer_memory_consumption, 256 * 1024 * 1024);
        assert_eq!(cfg.cache_file_period(), Duration::from_secs(86_400));
        assert_eq!(cfg.default_file_type, "raw");
    }

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let cfg = NexusConfig::load(None).unwrap();
        assert_eq!(cfg.total_buffer_memory_consumption, 256 * 1024 * 1024);
    }
}
