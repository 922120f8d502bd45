//! Configuration file support for the workout engine.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/workout/config.toml`.
//! Every detector threshold lives here so tests and field tuning can override them
//! without touching code.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub timing: TimingConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Thresholds for rep calibration, stall detection and sample validation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectionConfig {
    /// Span (mm) a cable must travel before its range counts as calibrated
    #[serde(default = "default_min_range_mm")]
    pub min_range_mm: f32,

    /// Fraction of the calibrated span above the floor treated as the danger zone
    #[serde(default = "default_danger_zone_fraction")]
    pub danger_zone_fraction: f32,

    /// Handle position (mm) below which the handles are considered at rest
    #[serde(default = "default_rest_threshold_mm")]
    pub rest_threshold_mm: f32,

    /// Peak cable speed (mm/s) below which the stall timer starts
    #[serde(default = "default_stall_velocity_low")]
    pub stall_velocity_low: f32,

    /// Peak cable speed (mm/s) above which the stall timer is cleared
    #[serde(default = "default_stall_velocity_high")]
    pub stall_velocity_high: f32,

    #[serde(default = "default_stall_duration_secs")]
    pub stall_duration_secs: f32,

    /// Time handles must stay at rest (or in the danger zone) before stopping
    #[serde(default = "default_position_stop_duration_secs")]
    pub position_stop_duration_secs: f32,

    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: f32,

    /// Dwell time a raw handle state must persist before it is confirmed
    #[serde(default = "default_handle_dwell_ms")]
    pub handle_dwell_ms: u64,

    /// Physical per-cable load limit of the machine
    #[serde(default = "default_max_load_kg")]
    pub max_load_kg: f32,

    #[serde(default = "default_max_position_mm")]
    pub max_position_mm: f32,

    /// Minimum position change (mm) between samples that flips the movement phase
    #[serde(default = "default_phase_hysteresis_mm")]
    pub phase_hysteresis_mm: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_range_mm: default_min_range_mm(),
            danger_zone_fraction: default_danger_zone_fraction(),
            rest_threshold_mm: default_rest_threshold_mm(),
            stall_velocity_low: default_stall_velocity_low(),
            stall_velocity_high: default_stall_velocity_high(),
            stall_duration_secs: default_stall_duration_secs(),
            position_stop_duration_secs: default_position_stop_duration_secs(),
            startup_grace_secs: default_startup_grace_secs(),
            handle_dwell_ms: default_handle_dwell_ms(),
            max_load_kg: default_max_load_kg(),
            max_position_mm: default_max_position_mm(),
            phase_hysteresis_mm: default_phase_hysteresis_mm(),
        }
    }
}

impl DetectionConfig {
    pub fn stall_duration_ms(&self) -> u64 {
        secs_to_ms(self.stall_duration_secs)
    }

    pub fn position_stop_duration_ms(&self) -> u64 {
        secs_to_ms(self.position_stop_duration_secs)
    }

    pub fn startup_grace_ms(&self) -> u64 {
        secs_to_ms(self.startup_grace_secs)
    }
}

/// Engine timing defaults (per-user overrides live in preferences)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    #[serde(default = "default_countdown_secs")]
    pub countdown_secs: u32,

    #[serde(default = "default_summary_hold_secs")]
    pub summary_hold_secs: u32,

    /// How long a grabbed handle must be held before a just-lift set starts
    #[serde(default = "default_auto_start_secs")]
    pub auto_start_secs: u32,

    /// Upper bound for delivering one command to the machine
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default)]
    pub skip_summary_in_routine: bool,

    #[serde(default = "default_autoplay")]
    pub autoplay: bool,

    /// Duration used for bodyweight sets that do not specify one
    #[serde(default = "default_bodyweight_secs")]
    pub default_bodyweight_secs: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            countdown_secs: default_countdown_secs(),
            summary_hold_secs: default_summary_hold_secs(),
            auto_start_secs: default_auto_start_secs(),
            command_timeout_ms: default_command_timeout_ms(),
            skip_summary_in_routine: false,
            autoplay: default_autoplay(),
            default_bodyweight_secs: default_bodyweight_secs(),
        }
    }
}

impl TimingConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn secs_to_ms(secs: f32) -> u64 {
    (secs.max(0.0) * 1000.0).round() as u64
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(std::env::temp_dir);
    base.join("workout")
}

fn default_min_range_mm() -> f32 {
    50.0
}

fn default_danger_zone_fraction() -> f32 {
    0.05
}

fn default_rest_threshold_mm() -> f32 {
    10.0
}

fn default_stall_velocity_low() -> f32 {
    2.5
}

fn default_stall_velocity_high() -> f32 {
    10.0
}

fn default_stall_duration_secs() -> f32 {
    5.0
}

fn default_position_stop_duration_secs() -> f32 {
    3.0
}

fn default_startup_grace_secs() -> f32 {
    5.0
}

fn default_handle_dwell_ms() -> u64 {
    250
}

fn default_max_load_kg() -> f32 {
    220.0
}

fn default_max_position_mm() -> f32 {
    3000.0
}

fn default_phase_hysteresis_mm() -> f32 {
    2.0
}

fn default_countdown_secs() -> u32 {
    5
}

fn default_summary_hold_secs() -> u32 {
    5
}

fn default_auto_start_secs() -> u32 {
    3
}

fn default_command_timeout_ms() -> u64 {
    2000
}

fn default_autoplay() -> bool {
    true
}

fn default_bodyweight_secs() -> u32 {
    30
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(std::env::temp_dir);
        base.join("workout").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject threshold combinations the detectors cannot work with
    pub fn validate(&self) -> Result<()> {
        let d = &self.detection;
        if d.stall_velocity_low >= d.stall_velocity_high {
            return Err(Error::Config(format!(
                "stall_velocity_low ({}) must be below stall_velocity_high ({})",
                d.stall_velocity_low, d.stall_velocity_high
            )));
        }
        if !(0.0..1.0).contains(&d.danger_zone_fraction) {
            return Err(Error::Config(format!(
                "danger_zone_fraction must be in [0, 1), got {}",
                d.danger_zone_fraction
            )));
        }
        if d.max_load_kg <= 0.0 || d.min_range_mm <= 0.0 {
            return Err(Error::Config(
                "max_load_kg and min_range_mm must be positive".into(),
            ));
        }
        if self.timing.command_timeout_ms == 0 {
            return Err(Error::Config("command_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.detection.min_range_mm, 50.0);
        assert_eq!(config.detection.stall_duration_ms(), 5000);
        assert_eq!(config.timing.countdown_secs, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.detection, parsed.detection);
        assert_eq!(config.timing, parsed.timing);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[detection]
stall_duration_secs = 3.0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.detection.stall_duration_ms(), 3000);
        assert_eq!(config.detection.stall_velocity_low, 2.5); // default
        assert!(config.timing.autoplay);
    }

    #[test]
    fn test_inverted_velocity_thresholds_rejected() {
        let mut config = Config::default();
        config.detection.stall_velocity_low = 20.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[timing]\ncountdown_secs = 3\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.timing.countdown_secs, 3);
    }
}
