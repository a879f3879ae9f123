//! Configuration system for Lintel
//!
//! Loads configuration from TOML file at `~/.config/lintel/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use x11rb::protocol::xproto::ModMask;

use crate::wm::frame::Style;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub display: DisplayConfig,
    pub style: StyleConfig,
    pub behavior: BehaviorConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from `path` (or the default location), or use
    /// defaults if the file doesn't exist
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file {:?}", config_path))?;
        let config = Self::from_toml(&content)?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse a configuration document; missing sections take their defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.behavior.move_modifier_mask()?;
        Ok(config)
    }

    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("lintel");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string =
            toml::to_string_pretty(&default_config).context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Display connection configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// X display to connect to; `$DISPLAY` when unset
    pub name: Option<String>,
}

/// Frame style configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleConfig {
    /// Border width of the decoration window in pixels
    pub border_width: u32,
    /// Space between the client and the frame edge on every side
    pub margin: u32,
    /// Extra space above the client
    pub title_height: u32,
}

impl Default for StyleConfig {
    fn default() -> Self {
        let style = Style::default();
        Self {
            border_width: style.border_width,
            margin: style.margin,
            title_height: style.title_height,
        }
    }
}

impl StyleConfig {
    pub fn to_style(self) -> Style {
        Style {
            border_width: self.border_width,
            margin: self.margin,
            title_height: self.title_height,
        }
    }
}

/// Window behavior configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Modifier held with button 1 to move a window: "shift", "control",
    /// "mod1" ... "mod5"
    pub move_modifier: String,
    /// A move still running after this long is cancelled
    pub move_timeout_ms: u64,
    /// Interval of the periodic health log line; 0 disables it
    pub health_interval_secs: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            move_modifier: "mod1".to_string(),
            move_timeout_ms: 30_000,
            health_interval_secs: 300,
        }
    }
}

impl BehaviorConfig {
    pub fn move_modifier_mask(&self) -> Result<u16> {
        let mask = match self.move_modifier.to_ascii_lowercase().as_str() {
            "shift" => ModMask::SHIFT,
            "control" | "ctrl" => ModMask::CONTROL,
            "mod1" | "alt" => ModMask::M1,
            "mod2" => ModMask::M2,
            "mod3" => ModMask::M3,
            "mod4" | "super" => ModMask::M4,
            "mod5" => ModMask::M5,
            other => bail!("Unknown move modifier {:?}", other),
        };
        Ok(mask.into())
    }

    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_interval_secs > 0).then(|| Duration::from_secs(self.health_interval_secs))
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter used when `RUST_LOG` is unset
    pub filter: String,
    /// Log every protocol error the server reports
    pub report_protocol_errors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "lintel=info".to_string(),
            report_protocol_errors: false,
        }
    }
}
