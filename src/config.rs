//! Server configuration using Figment.
//!
//! Configuration is layered:
//! 1. Built-in defaults ([`ServerConfig::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `DUALSPEC_`, with `__` separating
//!    nested keys
//!
//! ```text
//! DUALSPEC_SERVER__BIND=0.0.0.0:9000
//! DUALSPEC_TIMING__READOUT_OVERHEAD=4s
//! DUALSPEC_ARMS__RED__CCD__ENABLED=false
//! ```
//!
//! Durations use humantime notation (`"5s"`, `"1h 30m"`). Relative state and
//! frame paths are resolved against `server.data_dir`.

use crate::arm::{Arm, ArmPair};
use crate::calibration::CalibrationType;
use crate::command::Resolution;
use crate::hardware::Amplifier;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DUALSPEC_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Network and filesystem settings.
    pub server: ServerSection,
    /// Cost model used for acknowledgement estimates and scheduling.
    pub timing: TimingConfig,
    /// Telescope-side behaviour.
    pub telescope: TelescopeConfig,
    /// Calibration lamps fitted to the shared bank.
    pub lamp_bank: LampBankConfig,
    /// Per-arm hardware settings.
    pub arms: ArmPair<ArmConfig>,
    /// DAY_CALIBRATE catalog and state.
    pub day_calibrate: DayCalibrateConfig,
}

/// Network and filesystem settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Listen address of the command front end.
    pub bind: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory for frames and relative state paths.
    pub data_dir: PathBuf,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8367".to_string(),
            log_level: "info".to_string(),
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Timing characteristics of the hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Per-frame readout cost added to every exposure.
    #[serde(with = "humantime_serde")]
    pub readout_overhead: Duration,
    /// Estimate for a complete CONFIG.
    #[serde(with = "humantime_serde")]
    pub config_overhead: Duration,
    /// Estimate for a fold-mirror move.
    #[serde(with = "humantime_serde")]
    pub fold_move: Duration,
    /// Estimate for a focus-stage move.
    #[serde(with = "humantime_serde")]
    pub focus_move: Duration,
    /// Estimate for reducing one frame.
    #[serde(with = "humantime_serde")]
    pub reduction: Duration,
    /// Interval at which blocked waits re-check their abort token.
    #[serde(with = "humantime_serde")]
    pub abort_poll_interval: Duration,
    /// Longest exposure a command may request.
    #[serde(with = "humantime_serde")]
    pub max_exposure: Duration,
    /// Most frames one MULTRUN may request.
    pub max_frames: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            readout_overhead: Duration::from_secs(5),
            config_overhead: Duration::from_secs(60),
            fold_move: Duration::from_secs(30),
            focus_move: Duration::from_secs(10),
            reduction: Duration::from_secs(10),
            abort_poll_interval: Duration::from_millis(100),
            max_exposure: Duration::from_secs(4 * 3600),
            max_frames: 1000,
        }
    }
}

impl TimingConfig {
    /// Exposure length plus readout.
    pub fn frame_cost(&self, exposure: Duration) -> Duration {
        exposure.saturating_add(self.readout_overhead)
    }
}

/// Lamps fitted to the calibration bank, polled by GET_STATUS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LampBankConfig {
    /// Lamp names, as used in lamp specifications.
    pub names: Vec<String>,
}

impl Default for LampBankConfig {
    fn default() -> Self {
        Self {
            names: ["W", "Xe", "Ne", "Ar", "Kr"].map(String::from).to_vec(),
        }
    }
}

/// Telescope-side behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelescopeConfig {
    /// Start the autoguider around non-standard MULTRUNs.
    pub autoguide_on_multrun: bool,
    /// Move the fold mirror to the arm's port before MULTRUN.
    pub move_fold_on_multrun: bool,
}

impl Default for TelescopeConfig {
    fn default() -> Self {
        Self {
            autoguide_on_multrun: true,
            move_fold_on_multrun: true,
        }
    }
}

/// Detector settings of one arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CcdSettings {
    /// When false, CONFIG skips the geometry push and still succeeds.
    pub enabled: bool,
    /// Unbinned columns.
    pub columns: u32,
    /// Unbinned rows.
    pub rows: u32,
    /// Output amplifier.
    pub amplifier: Amplifier,
}

impl Default for CcdSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            columns: 2048,
            rows: 2048,
            amplifier: Amplifier::Left,
        }
    }
}

/// Focus setpoints per grating resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusSetpoints {
    /// Setpoint in high resolution.
    pub high: f64,
    /// Setpoint in low resolution.
    pub low: f64,
}

impl Default for FocusSetpoints {
    fn default() -> Self {
        Self { high: 1.0, low: 1.0 }
    }
}

impl FocusSetpoints {
    /// Setpoint for `resolution`.
    pub fn for_resolution(&self, resolution: Resolution) -> f64 {
        match resolution {
            Resolution::High => self.high,
            Resolution::Low => self.low,
        }
    }
}

/// Lamp-flat defaults used by LAMPFLAT and calibrate-before/after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LampFlatDefaults {
    /// Lamp specification.
    pub lamp: String,
    /// Exposure in high resolution.
    #[serde(with = "humantime_serde")]
    pub exposure_high: Duration,
    /// Exposure in low resolution.
    #[serde(with = "humantime_serde")]
    pub exposure_low: Duration,
}

impl Default for LampFlatDefaults {
    fn default() -> Self {
        Self {
            lamp: "W".to_string(),
            exposure_high: Duration::from_secs(10),
            exposure_low: Duration::from_secs(5),
        }
    }
}

impl LampFlatDefaults {
    /// Exposure for `resolution`.
    pub fn exposure(&self, resolution: Resolution) -> Duration {
        match resolution {
            Resolution::High => self.exposure_high,
            Resolution::Low => self.exposure_low,
        }
    }
}

/// Fixed-step focus scan used by LAMPFOCUS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LampFocusRange {
    /// Lamp specification.
    pub lamp: String,
    /// First position.
    pub start: f64,
    /// Last position.
    pub end: f64,
    /// Step.
    pub step: f64,
}

impl Default for LampFocusRange {
    fn default() -> Self {
        Self {
            lamp: "Xe".to_string(),
            start: 0.5,
            end: 1.5,
            step: 0.25,
        }
    }
}

/// Settings of one arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmConfig {
    /// Detector.
    #[serde(default)]
    pub ccd: CcdSettings,
    /// Fold-mirror port that feeds this arm.
    pub fold_position: i32,
    /// Focus-stage setpoints.
    #[serde(default)]
    pub focus: FocusSetpoints,
    /// Optical thickness offset (mm) per filter name.
    #[serde(default)]
    pub filter_offsets: BTreeMap<String, f64>,
    /// Lamp-flat defaults.
    #[serde(default)]
    pub lamp_flat: LampFlatDefaults,
    /// Focus scan defaults.
    #[serde(default)]
    pub lamp_focus: LampFocusRange,
    /// Persisted config-id counter.
    pub config_id_file: PathBuf,
    /// Persisted multrun numbering.
    pub multrun_file: PathBuf,
}

impl ArmConfig {
    /// Defaults for `arm`; state files are named after the arm.
    pub fn default_for(arm: Arm) -> Self {
        Self {
            ccd: CcdSettings::default(),
            fold_position: if arm == Arm::Blue { 2 } else { 1 },
            focus: FocusSetpoints::default(),
            filter_offsets: BTreeMap::new(),
            lamp_flat: LampFlatDefaults::default(),
            lamp_focus: LampFocusRange::default(),
            config_id_file: PathBuf::from(format!("{}.config_id", arm.key())),
            multrun_file: PathBuf::from(format!("{}.multrun", arm.key())),
        }
    }
}

/// One DAY_CALIBRATE catalog line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSpec {
    /// BIAS or DARK.
    pub kind: CalibrationType,
    /// Binning (both axes).
    pub binning: u32,
    /// Minimum interval between runs.
    #[serde(with = "humantime_serde")]
    pub frequency: Duration,
    /// Frames per run.
    pub count: u32,
    /// Exposure length; zero for BIAS.
    #[serde(with = "humantime_serde", default)]
    pub exposure: Duration,
}

/// DAY_CALIBRATE settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DayCalibrateConfig {
    /// Persisted last-run times.
    pub state_file: PathBuf,
    /// Key prefix in the state file.
    pub key_prefix: String,
    /// Candidate calibrations, attempted in this order.
    pub catalog: Vec<CatalogSpec>,
}

impl Default for DayCalibrateConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("day_calibrate.properties"),
            key_prefix: "dualspec.day_calibrate".to_string(),
            catalog: vec![
                CatalogSpec {
                    kind: CalibrationType::Bias,
                    binning: 1,
                    frequency: Duration::from_secs(12 * 3600),
                    count: 5,
                    exposure: Duration::ZERO,
                },
                CatalogSpec {
                    kind: CalibrationType::Bias,
                    binning: 2,
                    frequency: Duration::from_secs(12 * 3600),
                    count: 5,
                    exposure: Duration::ZERO,
                },
                CatalogSpec {
                    kind: CalibrationType::Dark,
                    binning: 1,
                    frequency: Duration::from_secs(7 * 24 * 3600),
                    count: 2,
                    exposure: Duration::from_secs(600),
                },
            ],
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            timing: TimingConfig::default(),
            telescope: TelescopeConfig::default(),
            lamp_bank: LampBankConfig::default(),
            arms: ArmPair::new(ArmConfig::default_for(Arm::Red), ArmConfig::default_for(Arm::Blue)),
            day_calibrate: DayCalibrateConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load defaults, then `path` (if given), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::ValidationError(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let config: ServerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults overlaid with a TOML document. Environment overrides are
    /// not applied.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if !matches!(
            self.server.log_level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return invalid(format!("unknown log level '{}'", self.server.log_level));
        }
        for arm in Arm::PHYSICAL {
            let Some(cfg) = self.arms.get(arm) else {
                continue;
            };
            if cfg.ccd.columns == 0 || cfg.ccd.rows == 0 {
                return invalid(format!("{arm} CCD dimensions must be non-zero"));
            }
            if !(cfg.lamp_focus.step > 0.0) || cfg.lamp_focus.end < cfg.lamp_focus.start {
                return invalid(format!("{arm} lamp focus range is empty or has a non-positive step"));
            }
            if cfg.lamp_flat.lamp.trim().is_empty() {
                return invalid(format!("{arm} lamp flat lamp is empty"));
            }
        }
        if self.timing.max_exposure.is_zero() || self.timing.max_frames == 0 {
            return invalid("timing.max_exposure and timing.max_frames must be non-zero".to_string());
        }
        if self.day_calibrate.key_prefix.trim().is_empty() {
            return invalid("day_calibrate.key_prefix is empty".to_string());
        }
        for (n, entry) in self.day_calibrate.catalog.iter().enumerate() {
            if entry.binning == 0 || entry.count == 0 {
                return invalid(format!("day_calibrate.catalog[{n}] needs binning > 0 and count > 0"));
            }
            if entry.kind == CalibrationType::Bias && !entry.exposure.is_zero() {
                return invalid(format!("day_calibrate.catalog[{n}] is a BIAS with non-zero exposure"));
            }
        }
        Ok(())
    }

    /// Resolve a possibly relative state path against `server.data_dir`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.server.data_dir.join(path)
        }
    }

    /// Settings of `arm`, or `None` for [`Arm::None`].
    pub fn arm(&self, arm: Arm) -> Option<&ArmConfig> {
        self.arms.get(arm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_ne!(config.arms.red.config_id_file, config.arms.blue.config_id_file);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
            [timing]
            readout_overhead = "4s"

            [arms.blue.ccd]
            enabled = false

            [arms.blue.filter_offsets]
            OG515 = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(config.timing.readout_overhead, Duration::from_secs(4));
        assert_eq!(config.timing.fold_move, TimingConfig::default().fold_move);
        assert!(!config.arms.blue.ccd.enabled);
        assert!(config.arms.red.ccd.enabled);
        assert_eq!(config.arms.blue.filter_offsets.get("OG515"), Some(&0.25));
        assert_eq!(config.arms.blue.fold_position, 2);
    }

    #[test]
    fn test_catalog_from_toml() {
        let config = ServerConfig::from_toml_str(
            r#"
            [day_calibrate]
            catalog = [
                { kind = "BIAS", binning = 1, frequency = "1h", count = 3 },
                { kind = "DARK", binning = 2, frequency = "1day", count = 2, exposure = "60s" },
            ]
            "#,
        )
        .unwrap();
        let catalog = &config.day_calibrate.catalog;
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].exposure, Duration::ZERO);
        assert_eq!(catalog[1].exposure, Duration::from_secs(60));
    }

    #[test]
    fn test_bias_with_exposure_is_rejected() {
        let result = ServerConfig::from_toml_str(
            r#"
            [day_calibrate]
            catalog = [{ kind = "BIAS", binning = 1, frequency = "1h", count = 3, exposure = "1s" }]
            "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_bad_focus_step_is_rejected() {
        let result = ServerConfig::from_toml_str(
            r#"
            [arms.red.lamp_focus]
            step = 0.0
            "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_command_limits() {
        let config = ServerConfig::from_toml_str(
            r#"
            [timing]
            max_exposure = "2h"
            max_frames = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.timing.max_exposure, Duration::from_secs(7200));
        assert_eq!(config.timing.max_frames, 50);
        assert_eq!(config.timing.frame_cost(Duration::MAX), Duration::MAX);

        let result = ServerConfig::from_toml_str("[timing]\nmax_frames = 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_resolve_relative_paths() {
        let mut config = ServerConfig::default();
        config.server.data_dir = PathBuf::from("/var/lib/dualspec");
        assert_eq!(
            config.resolve(Path::new("red.config_id")),
            PathBuf::from("/var/lib/dualspec/red.config_id")
        );
        assert_eq!(config.resolve(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = ServerConfig::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
