use std::collections::BTreeMap;
use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to read configuration file: {source}")]
    ReadError { source: std::io::Error },

    #[error("Failed to parse configuration: {source}")]
    ParseError { source: toml::de::Error },

    #[error("Failed to serialize configuration: {source}")]
    SerializeError { source: toml::ser::Error },

    #[error("Failed to write configuration file: {source}")]
    WriteError { source: std::io::Error },

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

/// Per-axis mechanical parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AxisConfig {
    /// Caller-unit to device-unit multiplier (gearing).
    #[serde(default = "default_scalar")]
    pub scalar: f64,
    /// Mechanical play taken up on direction reversal, caller units.
    #[serde(default)]
    pub backlash: f64,
    /// -1, 0 or +1; 0 disables compensation on this axis.
    #[serde(default)]
    pub backlash_compensation: i8,
    /// Software travel envelope (min, max), caller units.
    #[serde(default)]
    pub soft_limit: Option<(f64, f64)>,
}

fn default_scalar() -> f64 {
    1.0
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            scalar: 1.0,
            backlash: 0.0,
            backlash_compensation: 0,
            soft_limit: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageConfig {
    /// Serial device of the motion controller.
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Feed rate for planned moves, device units/min.
    #[serde(default = "default_feed_rate")]
    pub feed_rate: f64,
    /// Default jog rate, device units/min.
    #[serde(default = "default_jog_rate")]
    pub jog_rate: f64,
    /// Dwell after motion before a measurement is considered valid, ms.
    #[serde(default)]
    pub settle_ms: u64,

    /// Reopen the connection after a critical fault instead of halting.
    #[serde(default)]
    pub motion_reboot: bool,

    #[serde(serialize_with = "serialize_axes")]
    pub axes: BTreeMap<char, AxisConfig>,
}

// toml's serializer rejects non-string map keys, so write the char keys
// as the single-character strings they deserialize from.
fn serialize_axes<S: serde::Serializer>(
    axes: &BTreeMap<char, AxisConfig>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(axes.iter().map(|(axis, config)| (axis.to_string(), config)))
}

fn default_baud() -> u32 {
    115200
}

fn default_feed_rate() -> f64 {
    1000.0
}

fn default_jog_rate() -> f64 {
    100.0
}

impl Default for StageConfig {
    fn default() -> Self {
        let axes = ['x', 'y', 'z']
            .into_iter()
            .map(|axis| (axis, AxisConfig::default()))
            .collect();
        Self {
            port: String::from("/dev/ttyUSB0"),
            baud: default_baud(),
            feed_rate: default_feed_rate(),
            jog_rate: default_jog_rate(),
            settle_ms: 0,
            motion_reboot: false,
            axes,
        }
    }
}

impl StageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: String| Err(ConfigError::ValidationError { message });

        if self.axes.is_empty() {
            return fail("no axes configured".to_string());
        }
        for (axis, config) in &self.axes {
            if !axis.is_ascii_lowercase() {
                return fail(format!("axis {axis:?} is not a lowercase letter"));
            }
            if config.scalar == 0.0 || !config.scalar.is_finite() {
                return fail(format!("axis {axis}: scalar must be finite and nonzero"));
            }
            if config.backlash < 0.0 {
                return fail(format!("axis {axis}: backlash must be nonnegative"));
            }
            if !(-1..=1).contains(&config.backlash_compensation) {
                return fail(format!(
                    "axis {axis}: backlash_compensation must be -1, 0 or 1"
                ));
            }
            if let Some((min, max)) = config.soft_limit {
                if min >= max {
                    return fail(format!("axis {axis}: soft limit min must be below max"));
                }
            }
        }
        if self.jog_rate <= 0.0 || self.feed_rate <= 0.0 {
            return fail("rates must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ConfigOptions {
    pub config_path: PathBuf,
    pub create_if_missing: bool,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            create_if_missing: true,
        }
    }
}

impl ConfigOptions {
    pub fn default_config_path() -> PathBuf {
        std::env::var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("stage_config.toml"))
    }

    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct ConfigManager {
    options: ConfigOptions,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            options: ConfigOptions::default(),
        }
    }

    pub fn with_options(options: ConfigOptions) -> Self {
        Self { options }
    }

    pub fn load(&self) -> anyhow::Result<StageConfig> {
        let config_path = self.options.config_path.clone();

        if !config_path.exists() {
            if self.options.create_if_missing {
                let default_config = StageConfig::default();
                self.save(&default_config)
                    .context("Failed to save default config")?;
                return Ok(default_config);
            } else {
                return Err(ConfigError::FileNotFound { path: config_path }.into());
            }
        }

        let content =
            fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError { source: e })?;

        let config: StageConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError { source: e })?;
        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, config: &StageConfig) -> anyhow::Result<()> {
        let config_path = &self.options.config_path;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError { source: e })?;
        }

        let content = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::SerializeError { source: e })?;

        fs::write(config_path, content).map_err(|e| ConfigError::WriteError { source: e })?;

        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

pub fn init_config() -> anyhow::Result<(ConfigManager, StageConfig)> {
    let manager = ConfigManager::new();
    let config = manager.load()?;
    Ok((manager, config))
}

pub fn create_default_config<P: AsRef<Path>>(path: Option<P>) -> anyhow::Result<()> {
    let config_path = path
        .map(|p| p.as_ref().to_path_buf())
        .unwrap_or_else(ConfigOptions::default_config_path);

    let options = ConfigOptions {
        config_path,
        create_if_missing: true,
    };

    let manager = ConfigManager::with_options(options);
    manager.save(&StageConfig::default())?;

    Ok(())
}
