//! # PMOGuide Configuration Module
//!
//! This module provides configuration management for PMOGuide, including:
//! - Loading configuration from YAML files
//! - Merging with embedded default configuration
//! - Environment variable overrides
//! - Typed getters and setters for configuration values
//!
//! Domain crates do not add fields here: they extend [`Config`] with a
//! trait (see `pmoepg::GuideConfigExt`) built on the generic accessors.
//!
//! ## Usage
//!
//! ```no_run
//! use pmoconfig::Config;
//!
//! let config = Config::load_config("")?;
//!
//! let days = config.get_usize(&["options", "schedule_days"], 7)?;
//! let cache = config.get_managed_file(&["files", "cache"], "cache.json")?;
//!
//! config.set_value(&["options", "schedule_days"], 10usize.into())?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Context, Result};
use dirs::home_dir;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, info, warn};

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("pmoguide.yaml");

const ENV_CONFIG_DIR: &str = "PMOGUIDE_CONFIG";
const ENV_PREFIX: &str = "PMOGUIDE_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmoguide";

const DEFAULT_LOG_MIN_LEVEL: &str = "info";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;

/// Macro to generate getter/setter for bool values with default
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<bool> {
            self.get_bool($path, $default)
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// Configuration manager for PMOGuide
///
/// This structure manages the application configuration, including:
/// - Loading configuration from YAML files
/// - Merging with default configuration
/// - Handling environment variable overrides
/// - Providing typed getters/setters for configuration values
#[derive(Debug)]
pub struct Config {
    config_dir: PathBuf,
    path: PathBuf,
    data: Mutex<Value>,
}

impl Clone for Config {
    fn clone(&self) -> Self {
        let data = self.data().clone();
        Self {
            config_dir: self.config_dir.clone(),
            path: self.path.clone(),
            data: Mutex::new(data),
        }
    }
}

impl Config {
    /// Finds a config directory by trying different locations in order
    fn find_config_dir(directory: &str) -> PathBuf {
        // 1. Try provided directory
        if !directory.is_empty() {
            return PathBuf::from(directory);
        }

        // 2. Try environment variable
        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            info!(env_var = ENV_CONFIG_DIR, path = %env_path, "Trying to load config from env");
            return PathBuf::from(env_path);
        }

        // 3. Try current directory
        if Path::new(CONFIG_DIR_NAME).exists() {
            return PathBuf::from(CONFIG_DIR_NAME);
        }

        // 4. Try home directory
        if let Some(home) = home_dir() {
            let home_config = home.join(CONFIG_DIR_NAME);
            if home_config.exists() {
                return home_config;
            }
        }

        PathBuf::from(CONFIG_DIR_NAME)
    }

    /// Validates and prepares a config directory
    fn validate_config_dir(path: &Path) -> Result<()> {
        if !path.exists() {
            fs::create_dir_all(path)
                .with_context(|| format!("cannot create config directory {}", path.display()))?;
        }

        if !path.is_dir() {
            return Err(anyhow!("{} is not a directory", path.display()));
        }

        // Test write permission
        let test_file = path.join(".write_test");
        fs::write(&test_file, b"test")?;
        fs::remove_file(&test_file)?;

        Ok(())
    }

    /// Determines and validates the configuration directory
    ///
    /// The directory is searched in the following order:
    /// 1. The provided `directory` parameter if not empty
    /// 2. The `PMOGUIDE_CONFIG` environment variable
    /// 3. `.pmoguide` in the current directory
    /// 4. `.pmoguide` in the user's home directory
    ///
    /// The directory is created if it doesn't exist.
    pub fn config_dir_for(directory: &str) -> Result<PathBuf> {
        let dir_path = Self::find_config_dir(directory);
        Self::validate_config_dir(&dir_path)?;
        Ok(dir_path)
    }

    /// Loads the configuration from the specified directory
    ///
    /// This method:
    /// 1. Determines the configuration directory
    /// 2. Loads the default embedded configuration
    /// 3. Merges it with the external config.yaml file if present
    /// 4. Applies environment variable overrides
    /// 5. Saves the merged configuration
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir_for(directory)?;
        info!(config_dir = %config_dir.display(), "Using config directory");

        let path = config_dir.join("config.yaml");

        let mut config_value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;

        match fs::read(&path) {
            Ok(data) => {
                info!(config_file = %path.display(), "Loaded config file");
                let external_value: Value = serde_yaml::from_slice(&data)
                    .with_context(|| format!("invalid YAML in {}", path.display()))?;
                // Un fichier vide se désérialise en Null : on garde les défauts
                if !external_value.is_null() {
                    merge_yaml(&mut config_value, &external_value);
                }
            }
            Err(_) => {
                info!(config_file = %path.display(), "Config file not found, using default embedded config");
            }
        }

        let mut config_value = Self::lower_keys_value(config_value);
        Self::apply_env_overrides(&mut config_value);

        let config = Config {
            config_dir,
            path,
            data: Mutex::new(config_value),
        };

        config.save()?;
        Ok(config)
    }

    fn data(&self) -> MutexGuard<'_, Value> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Directory holding `config.yaml`; relative paths are resolved against it
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Path of the `config.yaml` file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saves the current configuration to the config.yaml file
    ///
    /// The file is written to a temporary sibling first and then renamed.
    pub fn save(&self) -> Result<()> {
        let yaml = {
            let data = self.data();
            serde_yaml::to_string(&*data)?
        };

        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, yaml)
            .with_context(|| format!("cannot write {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("cannot replace {}", self.path.display()));
        }
        Ok(())
    }

    /// Sets a configuration value at the specified path and saves it
    ///
    /// # Arguments
    ///
    /// * `path` - Array of keys representing the path (e.g., `&["options", "schedule_days"]`)
    /// * `value` - The YAML value to set
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        {
            let mut data = self.data();
            Self::set_value_internal(&mut data, path, value)?;
        }
        self.save()
    }

    fn set_value_internal(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
        if path.is_empty() {
            *data = value;
            return Ok(());
        }
        if let Value::Mapping(map) = data {
            let key_value = Value::String(path[0].to_lowercase());
            if path.len() == 1 {
                map.insert(key_value, value);
            } else {
                let entry = map
                    .entry(key_value)
                    .or_insert(Value::Mapping(Mapping::new()));
                Self::set_value_internal(entry, &path[1..], value)?;
            }
            Ok(())
        } else {
            Err(anyhow!("Current node is not a map"))
        }
    }

    /// Gets a configuration value at the specified path
    ///
    /// Returns an error if the path doesn't exist.
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data();
        Self::get_value_internal(&data, path)
    }

    fn get_value_internal(data: &Value, path: &[&str]) -> Result<Value> {
        let mut current = data;
        for (i, key) in path.iter().enumerate() {
            if let Value::Mapping(map) = current {
                if let Some(next) = map.get(&Value::String(key.to_lowercase())) {
                    current = next;
                } else {
                    return Err(anyhow!("Path {} does not exist", path[..=i].join(".")));
                }
            } else {
                return Err(anyhow!("Path {} is not a mapping", path[..i].join(".")));
            }
        }
        Ok(current.clone())
    }

    /// Reads an unsigned integer, falling back to `default` when the key is
    /// missing or holds something else
    pub fn get_usize(&self, path: &[&str], default: usize) -> Result<usize> {
        match self.get_value(path) {
            Ok(Value::Number(n)) => match n.as_u64() {
                Some(v) => Ok(v as usize),
                None => {
                    warn!(key = %path.join("."), value = %n, "Negative or fractional number, using default");
                    Ok(default)
                }
            },
            Ok(Value::String(s)) => Ok(s.trim().parse().unwrap_or(default)),
            _ => Ok(default),
        }
    }

    /// Reads a boolean, falling back to `default`
    pub fn get_bool(&self, path: &[&str], default: bool) -> Result<bool> {
        match self.get_value(path) {
            Ok(Value::Bool(b)) => Ok(b),
            _ => Ok(default),
        }
    }

    /// Reads a string, falling back to `default` when missing or empty
    pub fn get_string(&self, path: &[&str], default: &str) -> Result<String> {
        match self.get_value(path) {
            Ok(Value::String(s)) if !s.is_empty() => Ok(s),
            Ok(Value::Number(n)) => Ok(n.to_string()),
            _ => Ok(default.to_string()),
        }
    }

    /// Deserializes the subtree at `path` into `T`
    ///
    /// Returns `Ok(None)` when the path does not exist.
    pub fn get_as<T: DeserializeOwned>(&self, path: &[&str]) -> Result<Option<T>> {
        match self.get_value(path) {
            Ok(Value::Null) | Err(_) => Ok(None),
            Ok(value) => serde_yaml::from_value(value)
                .map(Some)
                .with_context(|| format!("invalid value at {}", path.join("."))),
        }
    }

    /// Resolves a file path stored in the configuration
    ///
    /// The stored path can be absolute or relative to the configuration
    /// directory. The parent directory is created if needed. When the key is
    /// missing, `default` is stored and used.
    pub fn get_managed_file(&self, path: &[&str], default: &str) -> Result<PathBuf> {
        let file = match self.get_value(path) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => {
                self.set_value(path, Value::String(default.to_string()))?;
                default.to_string()
            }
        };

        let file = Path::new(&file);
        let absolute = if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.config_dir.join(file)
        };

        if let Some(parent) = absolute.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                info!(directory = %parent.display(), "Created directory");
            }
        }

        Ok(absolute)
    }

    fn apply_env_overrides(config: &mut Value) {
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                let key_path = stripped.split("__").collect::<Vec<_>>();
                let yaml_value = Self::convert_env_value(&value);
                debug!(key = %key, "Applying env override");
                let _ = Self::set_value_internal(config, &key_path, yaml_value);
            }
        }
    }

    fn convert_env_value(value: &str) -> Value {
        if let Ok(parsed) = serde_yaml::from_str::<Value>(value) {
            return parsed;
        }
        Value::String(value.to_string())
    }

    fn lower_keys_value(value: Value) -> Value {
        match value {
            Value::Mapping(map) => {
                let mut new_map = Mapping::new();
                for (k, v) in map {
                    if let Value::String(s) = k {
                        new_map.insert(Value::String(s.to_lowercase()), Self::lower_keys_value(v));
                    } else {
                        new_map.insert(k, Self::lower_keys_value(v));
                    }
                }
                Value::Mapping(new_map)
            }
            Value::Sequence(seq) => {
                Value::Sequence(seq.into_iter().map(Self::lower_keys_value).collect())
            }
            _ => value,
        }
    }

    impl_bool_config!(
        get_log_enable_console,
        set_log_enable_console,
        &["host", "logger", "enable_console"],
        DEFAULT_LOG_ENABLE_CONSOLE
    );

    /// Minimum log level (a `tracing` filter directive)
    pub fn get_log_min_level(&self) -> Result<String> {
        self.get_string(&["host", "logger", "min_level"], DEFAULT_LOG_MIN_LEVEL)
    }

    pub fn set_log_min_level(&self, level: String) -> Result<()> {
        self.set_value(&["host", "logger", "min_level"], Value::String(level))
    }
}

/// Merges external YAML configuration into default configuration
///
/// - For mappings (objects), it merges keys from external into default
/// - For scalars and sequences, external values replace default values
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(), // pour les scalaires ou séquences, on remplace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn load(dir: &Path) -> Config {
        Config::load_config(dir.to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_defaults_are_written() {
        let dir = tempdir().unwrap();
        let config = load(dir.path());

        assert!(dir.path().join("config.yaml").exists());
        assert_eq!(config.get_usize(&["options", "schedule_days"], 0).unwrap(), 7);
        assert_eq!(config.get_log_min_level().unwrap(), "info");
        assert!(config.get_log_enable_console().unwrap());
    }

    #[test]
    fn test_external_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("config.yaml"),
            "Options:\n  Schedule_Days: 3\nstations:\n  - id: \"10001\"\n    name: One\n    lineup: USA-NY-1\n",
        )
        .unwrap();

        let config = load(dir.path());
        assert_eq!(config.get_usize(&["options", "schedule_days"], 0).unwrap(), 3);
        // les autres clés par défaut sont conservées
        assert_eq!(config.get_usize(&["options", "program_batch_size"], 0).unwrap(), 500);

        let stations: Vec<serde_yaml::Value> = config.get_as(&["stations"]).unwrap().unwrap();
        assert_eq!(stations.len(), 1);
    }

    #[test]
    fn test_set_value_persists() {
        let dir = tempdir().unwrap();
        let config = load(dir.path());
        config
            .set_value(&["options", "max_concurrency"], Value::Number(8.into()))
            .unwrap();

        let reloaded = load(dir.path());
        assert_eq!(reloaded.get_usize(&["options", "max_concurrency"], 0).unwrap(), 8);
        assert!(!dir.path().join("config.yaml.tmp").exists());
    }

    #[test]
    fn test_missing_path_uses_default() {
        let dir = tempdir().unwrap();
        let config = load(dir.path());

        assert!(config.get_value(&["nope", "missing"]).is_err());
        assert_eq!(config.get_usize(&["nope"], 42).unwrap(), 42);
        assert!(!config.get_bool(&["nope"], false).unwrap());
        assert_eq!(config.get_string(&["account", "username"], "anon").unwrap(), "anon");
        assert!(config.get_as::<Vec<String>>(&["nope"]).unwrap().is_none());
    }

    #[test]
    fn test_managed_file_is_relative_to_config_dir() {
        let dir = tempdir().unwrap();
        let config = load(dir.path());

        let cache = config.get_managed_file(&["files", "cache"], "cache.json").unwrap();
        assert_eq!(cache, dir.path().join("cache.json"));

        let nested = config
            .get_managed_file(&["files", "snapshots"], "data/snap.json")
            .unwrap();
        assert!(dir.path().join("data").is_dir());
        assert_eq!(nested, dir.path().join("data/snap.json"));
        assert_eq!(
            config.get_string(&["files", "snapshots"], "").unwrap(),
            "data/snap.json"
        );
    }

    #[test]
    fn test_merge_yaml_replaces_sequences() {
        let mut base: Value = serde_yaml::from_str("a: [1, 2]\nb:\n  c: 1\n  d: 2\n").unwrap();
        let ext: Value = serde_yaml::from_str("a: [3]\nb:\n  d: 5\n").unwrap();
        merge_yaml(&mut base, &ext);

        let expected: Value = serde_yaml::from_str("a: [3]\nb:\n  c: 1\n  d: 5\n").unwrap();
        assert_eq!(base, expected);
    }

    #[test]
    fn test_env_value_conversion() {
        assert_eq!(Config::convert_env_value("12"), Value::Number(12.into()));
        assert_eq!(Config::convert_env_value("true"), Value::Bool(true));
        assert_eq!(
            Config::convert_env_value("USA-NY-1"),
            Value::String("USA-NY-1".to_string())
        );
    }
}
