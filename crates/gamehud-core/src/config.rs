//! Configuration management for gamehud.
//!
//! Loads configuration from ${GAMEHUD_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Returns the default config template with comments.
///
/// This is embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for gamehud configuration and log directories.
    //!
    //! GAMEHUD_HOME resolution order:
    //! 1. GAMEHUD_HOME environment variable (if set)
    //! 2. ~/.config/gamehud (default)
    //! 3. <tmp>/gamehud when no home directory can be determined

    use std::path::PathBuf;

    /// Returns the gamehud home directory.
    pub fn gamehud_home() -> PathBuf {
        if let Ok(home) = std::env::var("GAMEHUD_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || std::env::temp_dir().join("gamehud"),
            |h| h.join(".config").join("gamehud"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        gamehud_home().join("config.toml")
    }

    /// Returns the directory rolling log files are written to.
    pub fn logs_dir() -> PathBuf {
        gamehud_home().join("logs")
    }
}

/// Privileged shell settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Program started as the elevated shell
    pub program: String,
    /// Extra arguments for the program
    pub args: Vec<String>,
    /// Command whose output proves elevation
    pub probe_command: String,
    /// Text the probe output must contain
    pub privileged_marker: String,
    /// Deadline for one command round-trip, in milliseconds
    pub command_timeout_ms: u64,
}

impl ShellConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: "su".to_string(),
            args: Vec::new(),
            probe_command: "id".to_string(),
            privileged_marker: "uid=0".to_string(),
            command_timeout_ms: 3000,
        }
    }
}

/// Render-layer selection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayersConfig {
    /// Package of the overlay itself; its layers are never tracked.
    pub own_package: String,
    /// Substrings that disqualify a layer name.
    pub excluded: Vec<String>,
    /// Zero-frame polls tolerated before the tracked layer is re-detected.
    pub redetect_after_zero_polls: u32,
}

impl Default for LayersConfig {
    fn default() -> Self {
        Self {
            own_package: "com.catsmoker.app".to_string(),
            excluded: [
                "StatusBar",
                "NavigationBar",
                "InputMethod",
                "Wallpaper",
                "Screenshot",
                "Background",
                "Output Layer",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            redetect_after_zero_polls: 3,
        }
    }
}

/// Compositor commands sent through the privileged shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    pub list_command: String,
    /// `{layer}` is replaced by the (escaped) layer name.
    pub latency_command: String,
    pub focus_command: String,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            list_command: "dumpsys SurfaceFlinger --list".to_string(),
            latency_command: "dumpsys SurfaceFlinger --latency \"{layer}\"".to_string(),
            focus_command: "dumpsys window windows".to_string(),
        }
    }
}

/// Locations of the kernel files read without the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub cpu_root: PathBuf,
    pub power_supply_dir: PathBuf,
    pub meminfo_path: PathBuf,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            cpu_root: PathBuf::from("/sys/devices/system/cpu"),
            power_supply_dir: PathBuf::from("/sys/class/power_supply/battery"),
            meminfo_path: PathBuf::from("/proc/meminfo"),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Delay between sampling ticks in milliseconds
    pub interval_ms: u64,

    /// Refresh rate reported before the compositor provides one
    pub refresh_rate_hz: f32,

    #[serde(default)]
    pub shell: ShellConfig,

    #[serde(default)]
    pub layers: LayersConfig,

    #[serde(default)]
    pub compositor: CompositorConfig,

    #[serde(default)]
    pub sources: SourcesConfig,
}

impl Config {
    const DEFAULT_INTERVAL_MS: u64 = 800;
    const MIN_INTERVAL_MS: u64 = 100;
    const DEFAULT_REFRESH_RATE_HZ: f32 = 60.0;

    /// Loads configuration from the default config path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Sampling period, never shorter than 100ms.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(Self::MIN_INTERVAL_MS))
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Generates a fresh config TOML from Rust defaults.
    ///
    /// Uses the embedded template for structure/comments and merges
    /// generated values from `Config::default()` into it.
    pub fn generate() -> Result<String> {
        use toml_edit::DocumentMut;

        let generated_toml = toml::to_string(&Config::default())
            .context("Failed to serialize default config to TOML")?;

        let mut doc: DocumentMut = default_config_template()
            .parse()
            .context("Failed to parse default config template")?;
        let generated_doc: DocumentMut = generated_toml
            .parse()
            .context("Failed to parse generated config")?;

        merge_items(doc.as_table_mut(), generated_doc.as_table());

        Ok(doc.to_string())
    }

    /// Writes config content to a file, creating parent directories as needed.
    /// Uses atomic write (temp file + rename) to prevent corruption.
    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_ms: Self::DEFAULT_INTERVAL_MS,
            refresh_rate_hz: Self::DEFAULT_REFRESH_RATE_HZ,
            shell: ShellConfig::default(),
            layers: LayersConfig::default(),
            compositor: CompositorConfig::default(),
            sources: SourcesConfig::default(),
        }
    }
}

/// Recursively merges items from source table into target table.
///
/// Scalars and arrays override, nested tables merge, template comments survive.
fn merge_items(target: &mut toml_edit::Table, source: &toml_edit::Table) {
    use toml_edit::Item;

    for (key, value) in source.iter() {
        match value {
            Item::Value(v) => {
                target[key] = Item::Value(v.clone());
            }
            Item::Table(src_table) => {
                if let Some(Item::Table(target_table)) = target.get_mut(key) {
                    merge_items(target_table, src_table);
                } else {
                    target[key] = Item::Table(src_table.clone());
                }
            }
            Item::ArrayOfTables(src_arr) => {
                target[key] = Item::ArrayOfTables(src_arr.clone());
            }
            Item::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("nonexistent.toml");

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.interval(), Duration::from_millis(800));
        assert_eq!(config.shell.program, "su");
    }

    #[test]
    fn test_load_partial_config_merges_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        fs::write(
            &config_path,
            "interval_ms = 1000\n\n[shell]\nprogram = \"sh\"\n\n[layers]\nredetect_after_zero_polls = 0\n",
        )
        .unwrap();

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.interval_ms, 1000);
        assert_eq!(config.shell.program, "sh");
        assert_eq!(config.shell.probe_command, "id");
        assert_eq!(config.layers.redetect_after_zero_polls, 0);
        assert_eq!(config.layers.own_package, "com.catsmoker.app");
        assert_eq!(config.compositor, CompositorConfig::default());
    }

    #[test]
    fn test_load_invalid_toml_reports_path() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "interval_ms = \"fast\"\n").unwrap();

        let err = Config::load_from(&config_path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }

    #[test]
    fn test_interval_has_floor() {
        let config = Config {
            interval_ms: 5,
            ..Config::default()
        };
        assert_eq!(config.interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_init_creates_config_with_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("subdir").join("config.toml");

        Config::init(&config_path).unwrap();

        assert!(config_path.exists());
        let loaded = Config::load_from(&config_path).unwrap();
        assert_eq!(loaded, Config::default());
        let contents = fs::read_to_string(&config_path).unwrap();
        assert!(contents.contains("# Delay between two sampling ticks"));
    }

    #[test]
    fn test_init_fails_if_exists() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        fs::write(&config_path, "").unwrap();

        assert!(Config::init(&config_path).is_err());
    }

    #[test]
    fn test_generate_matches_defaults_and_keeps_comments() {
        let generated = Config::generate().unwrap();

        assert!(generated.contains("# Command whose output proves elevation."));
        let parsed: Config = toml::from_str(&generated).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
