use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::LogConfig;
use crate::recovery::{Fallbacks, FALLBACK_HRV_MS, FALLBACK_RHR_BPM};
use crate::sleep::SessionRules;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application metadata
    pub metadata: ConfigMetadata,

    /// Scoring pipeline tuning
    #[serde(default)]
    pub scoring: ScoringSettings,

    /// Durable storage
    #[serde(default)]
    pub storage: StorageSettings,

    /// Logging output
    #[serde(default)]
    pub logging: LogConfig,
}

/// Configuration metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

/// Scoring pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    /// Bound on each collaborator fetch; a timeout counts as "metric absent"
    pub fetch_timeout_ms: u64,

    /// Age after which a cached score bundle is recomputed
    pub bundle_ttl_secs: u64,

    /// Local hour before which today's scores are not computed
    pub morning_cutoff_hour: u32,

    /// Days of data a baseline window needs to count
    pub min_baseline_days: usize,

    /// HRV baseline substituted when history is too short
    pub fallback_hrv_ms: f64,

    /// RHR baseline substituted when history is too short
    pub fallback_rhr_bpm: f64,

    /// Largest gap between stage samples within one sleep session
    pub session_gap_minutes: i64,

    /// In-bed samples longer than this are discarded
    pub max_in_bed_hours: i64,

    /// Length of the trend arrays
    pub trend_days: u32,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 5_000,
            bundle_ttl_secs: 300,
            morning_cutoff_hour: 8,
            min_baseline_days: 3,
            fallback_hrv_ms: FALLBACK_HRV_MS,
            fallback_rhr_bpm: FALLBACK_RHR_BPM,
            session_gap_minutes: 30,
            max_in_bed_hours: 12,
            trend_days: 7,
        }
    }
}

impl ScoringSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn bundle_ttl(&self) -> Duration {
        Duration::from_secs(self.bundle_ttl_secs)
    }

    pub fn session_rules(&self) -> SessionRules {
        SessionRules {
            gap_tolerance: chrono::Duration::minutes(self.session_gap_minutes),
            max_in_bed: chrono::Duration::hours(self.max_in_bed_hours),
        }
    }

    pub fn fallbacks(&self) -> Fallbacks {
        Fallbacks {
            hrv_ms: self.fallback_hrv_ms,
            rhr_bpm: self.fallback_rhr_bpm,
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database holding baselines and daily scores
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: AppConfig::default_data_dir().join("vitalscore.db"),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let now = Utc::now();

        AppConfig {
            metadata: ConfigMetadata {
                version: "1.0".to_string(),
                created_at: now,
                updated_at: now,
            },
            scoring: ScoringSettings::default(),
            storage: StorageSettings::default(),
            logging: LogConfig::default(),
        }
    }
}

/// Configuration management implementation
impl AppConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let toml_content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Directory holding the config file and default database
    pub fn default_data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vitalscore")
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        Self::default_data_dir().join("config.toml")
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default() -> Self {
        let config_path = Self::default_config_path();

        match Self::load_from_file(&config_path) {
            Ok(config) => config,
            Err(_) => {
                eprintln!("Config file not found, using defaults: {}", config_path.display());
                Self::default()
            }
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let scoring = &self.scoring;

        if scoring.fetch_timeout_ms == 0 {
            bail!("scoring.fetch_timeout_ms must be greater than zero");
        }
        if scoring.morning_cutoff_hour > 23 {
            bail!(
                "scoring.morning_cutoff_hour must be 0-23, got {}",
                scoring.morning_cutoff_hour
            );
        }
        if scoring.min_baseline_days == 0 {
            bail!("scoring.min_baseline_days must be at least 1");
        }
        if !(scoring.fallback_hrv_ms > 0.0) || !(scoring.fallback_rhr_bpm > 0.0) {
            bail!("scoring fallback baselines must be positive");
        }
        if scoring.session_gap_minutes < 0 || scoring.max_in_bed_hours <= 0 {
            bail!("scoring session rules must be non-negative");
        }
        if scoring.trend_days < 2 {
            bail!("scoring.trend_days must be at least 2");
        }

        Ok(())
    }
}
