use std::{
    path::{Path, PathBuf},
    sync::RwLock,
};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    error::{ConfigError, Context, Result},
    schema::BambooConfig,
};

/// Project-local config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "bambooclaw.toml",
    "bambooclaw.yaml",
    "bambooclaw.yml",
    "bambooclaw.json",
];

/// File names inside the user config directory, checked in order.
const USER_CONFIG_FILENAMES: &[&str] = &["config.toml", "config.yaml", "config.yml", "config.json"];

static CONFIG_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);
static DATA_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Supported on-disk formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension. Files without one are TOML.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        match ext {
            "toml" => Ok(Self::Toml),
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<BambooConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    let format = ConfigFormat::from_path(path)?;
    parse_config(&raw, format).map_err(|e| ConfigError::parse(path, e))
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./bambooclaw.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.bambooclaw/config.{toml,yaml,yml,json}` (user-global)
///
/// Returns `BambooConfig::default()` if no config file is found or the file
/// fails to load.
pub fn discover_and_load() -> BambooConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    BambooConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = read_override(&CONFIG_DIR_OVERRIDE) {
        return first_existing(&dir, USER_CONFIG_FILENAMES)
            .or_else(|| first_existing(&dir, CONFIG_FILENAMES));
    }

    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    config_dir().and_then(|dir| first_existing(&dir, USER_CONFIG_FILENAMES))
}

fn first_existing(dir: &Path, names: &[&str]) -> Option<PathBuf> {
    names.iter().map(|name| dir.join(name)).find(|p| p.exists())
}

/// Default home for both config and data: `~/.bambooclaw/`.
fn default_home() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".bambooclaw"))
}

fn read_override(slot: &RwLock<Option<PathBuf>>) -> Option<PathBuf> {
    slot.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn write_override(slot: &RwLock<Option<PathBuf>>, value: Option<PathBuf>) {
    *slot.write().unwrap_or_else(|e| e.into_inner()) = value;
}

/// Override the config directory (e.g. from `--config-dir`).
pub fn set_config_dir(dir: PathBuf) {
    write_override(&CONFIG_DIR_OVERRIDE, Some(dir));
}

pub fn clear_config_dir() {
    write_override(&CONFIG_DIR_OVERRIDE, None);
}

/// Override the data directory (e.g. from `--data-dir`).
pub fn set_data_dir(dir: PathBuf) {
    write_override(&DATA_DIR_OVERRIDE, Some(dir));
}

pub fn clear_data_dir() {
    write_override(&DATA_DIR_OVERRIDE, None);
}

/// Returns the config directory: the override, or `~/.bambooclaw/`.
pub fn config_dir() -> Option<PathBuf> {
    read_override(&CONFIG_DIR_OVERRIDE).or_else(default_home)
}

/// Returns the data directory: the override, or `~/.bambooclaw/`.
pub fn data_dir() -> PathBuf {
    read_override(&DATA_DIR_OVERRIDE)
        .or_else(default_home)
        .unwrap_or_else(|| PathBuf::from(".bambooclaw"))
}

/// Create the data directory if needed and return it.
pub fn ensure_data_dir() -> Result<PathBuf> {
    let dir = data_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create data dir {}", dir.display()))?;
    Ok(dir)
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

/// Parse a raw config string in the given format.
pub fn parse_config(raw: &str, format: ConfigFormat) -> Result<BambooConfig> {
    match format {
        ConfigFormat::Toml => toml::from_str(raw).map_err(|e| ConfigError::message(e.to_string())),
        ConfigFormat::Yaml => {
            serde_yaml::from_str(raw).map_err(|e| ConfigError::message(e.to_string()))
        },
        ConfigFormat::Json => {
            serde_json::from_str(raw).map_err(|e| ConfigError::message(e.to_string()))
        },
    }
}

/// Parse a raw config string into a generic JSON tree, for validation.
pub fn parse_config_value(raw: &str, format: ConfigFormat) -> Result<serde_json::Value> {
    match format {
        ConfigFormat::Toml => {
            let v: toml::Value = toml::from_str(raw).context("TOML syntax error")?;
            serde_json::to_value(v).context("TOML conversion failed")
        },
        ConfigFormat::Yaml => {
            let v: serde_yaml::Value = serde_yaml::from_str(raw).context("YAML syntax error")?;
            serde_json::to_value(v).context("YAML conversion failed")
        },
        ConfigFormat::Json => serde_json::from_str(raw).context("JSON syntax error"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("a.toml");
        std::fs::write(&toml_path, "[gateway]\nport = 9001\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().gateway.port, 9001);

        let yaml_path = dir.path().join("a.yaml");
        std::fs::write(&yaml_path, "gateway:\n  port: 9002\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().gateway.port, 9002);

        let json_path = dir.path().join("a.json");
        std::fs::write(&json_path, r#"{"gateway":{"port":9003}}"#).unwrap();
        assert_eq!(load_config(&json_path).unwrap().gateway.port, 9003);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.ini");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "ini"
        ));
    }

    #[test]
    fn parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[gateway\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn config_dir_override_is_searched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[gateway]\nport = 9100\n").unwrap();
        set_config_dir(dir.path().to_path_buf());
        let found = find_config_file();
        clear_config_dir();
        assert_eq!(found.unwrap(), dir.path().join("config.toml"));
    }
}
