//! TOML configuration for the pulsewarden daemon and CLI.
//!
//! Layered model: compiled-in defaults, overridden by a TOML file found via
//! an explicit path, the `PULSEWARDEN_CONFIG` environment variable, or the
//! standard system location.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::incident::TransitionPolicy;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "PULSEWARDEN_CONFIG";

/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/pulsewarden/pulsewarden.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulsewardenConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub incidents: IncidentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PulsewardenConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded pulsewarden configuration");
        Ok(config)
    }

    /// Resolve the configuration for a process.
    ///
    /// An explicit path must load. Otherwise try, in order:
    /// 1. The path in `PULSEWARDEN_CONFIG`.
    /// 2. `/etc/pulsewarden/pulsewarden.toml`.
    /// 3. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PULSEWARDEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database_path: String,
    /// Maximum number of history values handed to the detectors.
    pub history_limit: usize,
    /// Samples older than this are pruned by the daemon. 0 keeps everything.
    pub retention_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "data/pulsewarden.db".to_string(),
            history_limit: 100,
            retention_hours: 24,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Partitioned evaluation workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Number of worker partitions. Samples for one application always land
    /// on the same partition.
    pub partitions: usize,
    /// Bounded queue depth per partition.
    pub queue_depth: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            queue_depth: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Seeds applied when a threshold configuration is synthesized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub z_score_threshold: f64,
    pub moving_avg_window_minutes: u32,
    pub deviation_percentage_threshold: f64,
    pub min_samples_required: u32,
    pub cooldown_minutes: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            z_score_threshold: 3.0,
            moving_avg_window_minutes: 15,
            deviation_percentage_threshold: 20.0,
            min_samples_required: 10,
            cooldown_minutes: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    pub transition_policy: TransitionPolicy,
    /// Interval of the escalation sweep in seconds. 0 disables it.
    pub escalation_sweep_secs: u64,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            transition_policy: TransitionPolicy::Permissive,
            escalation_sweep_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = PulsewardenConfig::default();
        assert_eq!(cfg.storage.database_path, "data/pulsewarden.db");
        assert_eq!(cfg.storage.history_limit, 100);
        assert_eq!(cfg.api.bind, "0.0.0.0:8080");
        assert_eq!(cfg.ingest.partitions, 4);
        assert_eq!(cfg.detection.z_score_threshold, 3.0);
        assert_eq!(cfg.detection.moving_avg_window_minutes, 15);
        assert_eq!(cfg.detection.deviation_percentage_threshold, 20.0);
        assert_eq!(cfg.detection.min_samples_required, 10);
        assert_eq!(cfg.detection.cooldown_minutes, 5);
        assert_eq!(cfg.incidents.transition_policy, TransitionPolicy::Permissive);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[storage]
database_path = "/var/lib/pulsewarden/pw.db"
history_limit = 50

[api]
bind = "127.0.0.1:9000"

[ingest]
partitions = 8
queue_depth = 64

[detection]
z_score_threshold = 2.5
cooldown_minutes = 10

[incidents]
transition_policy = "strict"
escalation_sweep_secs = 0

[logging]
level = "debug"
json = true
"#;
        let cfg: PulsewardenConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.storage.database_path, "/var/lib/pulsewarden/pw.db");
        assert_eq!(cfg.storage.history_limit, 50);
        assert_eq!(cfg.storage.retention_hours, 24);
        assert_eq!(cfg.api.bind, "127.0.0.1:9000");
        assert_eq!(cfg.ingest.partitions, 8);
        assert_eq!(cfg.detection.z_score_threshold, 2.5);
        assert_eq!(cfg.detection.cooldown_minutes, 10);
        assert_eq!(cfg.detection.min_samples_required, 10);
        assert_eq!(cfg.incidents.transition_policy, TransitionPolicy::Strict);
        assert_eq!(cfg.incidents.escalation_sweep_secs, 0);
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: PulsewardenConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.api.bind, "0.0.0.0:8080");
        assert_eq!(cfg.ingest.queue_depth, 1024);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[api]\nbind = \"127.0.0.1:7000\"").unwrap();
        let cfg = PulsewardenConfig::load(file.path()).unwrap();
        assert_eq!(cfg.api.bind, "127.0.0.1:7000");
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let result = PulsewardenConfig::resolve(Some(Path::new("/nonexistent/pulsewarden.toml")));
        assert!(result.is_err());
    }
}
