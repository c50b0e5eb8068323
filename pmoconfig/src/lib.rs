//! # PMOCast Configuration Module
//!
//! This module provides configuration management for PMOCast, including:
//! - Loading configuration from YAML files
//! - Merging with embedded default configuration
//! - Environment variable overrides
//! - Type-safe getters for configuration values
//! - Thread-safe singleton access pattern
//!
//! The configuration is read-only on disk: values changed at runtime (for
//! instance from command-line flags) only live in memory.
//!
//! ## Usage
//!
//! ```no_run
//! use pmoconfig::get_config;
//!
//! let config = get_config()?;
//! let cutoff = config.get_buffer_cutoff()?;
//! let identities = config.get_throttle_identities()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{Result, anyhow};
use dirs::home_dir;
use lazy_static::lazy_static;
use serde_yaml::{Mapping, Number, Value};
use std::{
    collections::HashMap,
    env, fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{info, warn};

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("pmocast.yaml");

lazy_static! {
    static ref CONFIG: Mutex<Option<Arc<Config>>> = Mutex::new(None);
}

const ENV_CONFIG_DIR: &str = "PMOCAST_CONFIG";
const ENV_PREFIX: &str = "PMOCAST_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmocast";

// Default values for configuration
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;
const DEFAULT_BUFFER_CUTOFF: usize = 256 * 1024;
const DEFAULT_PACING_CHECK_MS: usize = 1000;
const DEFAULT_LIVE_LOOKAHEAD_MS: usize = 3000;
const DEFAULT_PACING_SLEEP_MS: usize = 50;
const DEFAULT_THROTTLE_CAPACITY: usize = 2;
const DEFAULT_THROTTLE_MAX_WAIT_MS: usize = 30_000;
const DEFAULT_THROTTLE_SWEEP_SECS: usize = 300;

/// Macro to generate getter/setter for usize values with default
macro_rules! impl_usize_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<usize> {
            match self.get_value($path) {
                Ok(Value::Number(n)) => Ok(n.as_u64().map_or($default, |v| v as usize)),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, size: usize) -> Result<()> {
            let n = Number::from(size);
            self.set_value($path, Value::Number(n))
        }
    };
}

/// Macro to generate getter/setter for bool values with default
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<bool> {
            match self.get_value($path) {
                Ok(Value::Bool(b)) => Ok(b),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// Configuration manager for PMOCast
///
/// This structure manages the application configuration, including:
/// - Loading configuration from YAML files
/// - Merging with default configuration
/// - Handling environment variable overrides
/// - Providing typed getters for configuration values
///
/// # Examples
///
/// ```no_run
/// use pmoconfig::Config;
///
/// let config = Config::from_yaml_str("stream:\n  buffer_cutoff_bytes: 4096\n", ".")?;
/// assert_eq!(config.get_buffer_cutoff()?, 4096);
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug)]
pub struct Config {
    config_dir: String,
    data: Mutex<Value>,
}

// Implémentation manuelle de Clone
impl Clone for Config {
    fn clone(&self) -> Self {
        let data = self.data().clone();
        Self {
            config_dir: self.config_dir.clone(),
            data: Mutex::new(data),
        }
    }
}

impl Config {
    /// Finds a config directory by trying different locations in order
    fn find_config_dir(directory: &str) -> String {
        // 1. Try provided directory
        if !directory.is_empty() {
            return directory.to_string();
        }

        // 2. Try environment variable
        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            info!(env_var=ENV_CONFIG_DIR, path=%env_path, "Trying to load config from env");
            return env_path;
        }

        // 3. Try current directory
        if Path::new(CONFIG_DIR_NAME).exists() {
            return CONFIG_DIR_NAME.to_string();
        }

        // 4. Try home directory
        if let Some(home) = home_dir() {
            let home_config = home.join(CONFIG_DIR_NAME);
            if home_config.exists() {
                return home_config.to_string_lossy().to_string();
            }
        }

        // Default fallback
        CONFIG_DIR_NAME.to_string()
    }

    /// Determines and prepares the configuration directory
    ///
    /// The directory is searched in the following order:
    /// 1. The provided `directory` parameter if not empty
    /// 2. The `PMOCAST_CONFIG` environment variable
    /// 3. `.pmocast` in the current directory
    /// 4. `.pmocast` in the user's home directory
    ///
    /// The directory is created if it doesn't exist, since managed
    /// directories (the cache) are resolved relative to it.
    pub fn config_dir(directory: &str) -> Result<String> {
        let dir_path = Self::find_config_dir(directory);
        let path = Path::new(&dir_path);

        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(anyhow!("{} is not a directory", dir_path));
        }

        Ok(dir_path)
    }

    /// Loads the configuration from the specified directory
    ///
    /// This method:
    /// 1. Determines the configuration directory
    /// 2. Loads the default embedded configuration
    /// 3. Merges it with the external config.yaml file if present
    /// 4. Applies environment variable overrides
    ///
    /// # Arguments
    ///
    /// * `directory` - The directory containing the config.yaml file, or empty to use defaults
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir(directory)?;
        info!(config_dir=%config_dir, "Using config directory");

        let config_file_path = Path::new(&config_dir).join("config.yaml");
        let path = config_file_path.to_string_lossy().to_string();

        let external = match fs::read_to_string(&path) {
            Ok(data) => {
                info!(config_file=%path, "Loaded config file");
                Some(data)
            }
            Err(_) => {
                info!(config_file=%path, "Config file not found, using default embedded config");
                None
            }
        };

        let mut config_value = Self::merged_with_defaults(external.as_deref())?;

        Self::apply_env_overrides(&mut config_value);

        Ok(Config {
            config_dir,
            data: Mutex::new(config_value),
        })
    }

    /// Builds a configuration from a YAML document merged over the defaults.
    ///
    /// Neither the disk nor the environment is read; relative managed
    /// directories resolve against `config_dir`.
    pub fn from_yaml_str(yaml: &str, config_dir: &str) -> Result<Self> {
        Ok(Config {
            config_dir: config_dir.to_string(),
            data: Mutex::new(Self::merged_with_defaults(Some(yaml))?),
        })
    }

    fn merged_with_defaults(external: Option<&str>) -> Result<Value> {
        let mut default_value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        if let Some(yaml) = external {
            let external_value: Value = serde_yaml::from_str(yaml)?;
            // un document vide se lit comme Null
            if !external_value.is_null() {
                merge_yaml(&mut default_value, &Self::lower_keys_value(external_value));
            }
        }
        Ok(Self::lower_keys_value(default_value))
    }

    fn data(&self) -> MutexGuard<'_, Value> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Directory the configuration was loaded from.
    pub fn get_config_dir(&self) -> &str {
        &self.config_dir
    }

    /// Sets a configuration value at the specified path, in memory only
    ///
    /// # Arguments
    ///
    /// * `path` - Array of keys representing the path (e.g., `&["stream", "buffer_cutoff_bytes"]`)
    /// * `value` - The YAML value to set
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        let mut data = self.data();
        Self::set_value_internal(&mut data, path, value)
    }

    fn set_value_internal(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
        if path.is_empty() {
            *data = value;
            return Ok(());
        }
        if let Value::Mapping(map) = data {
            let key = path[0].to_lowercase();
            let key_value = Value::String(key);
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
    /// # Arguments
    ///
    /// * `path` - Array of keys representing the path (e.g., `&["cache", "directory"]`)
    ///
    /// # Returns
    ///
    /// Returns a `Result` containing the YAML value or an error if the path doesn't exist
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data();
        Self::get_value_internal(&data, path)
    }

    fn get_value_internal(data: &Value, path: &[&str]) -> Result<Value> {
        let mut current = data;
        for (i, key) in path.iter().enumerate() {
            if let Value::Mapping(map) = current {
                let key = key.to_lowercase();

                if let Some(next) = map.get(Value::String(key)) {
                    current = next;
                } else {
                    return Err(anyhow!("Path {} does not exist", path[..=i].join(".")));
                }
            } else {
                return Err(anyhow!("Path {} is not a Config", path[..i].join(".")));
            }
        }
        Ok(current.clone())
    }

    fn apply_env_overrides(config: &mut Value) {
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                let key_path = stripped.split("__").collect::<Vec<_>>();
                let yaml_value = Self::convert_env_value(&value);
                if let Err(err) = Self::set_value_internal(config, &key_path, yaml_value) {
                    warn!(env_var=%key, "Ignoring environment override: {}", err);
                }
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
                        let new_key = Value::String(s.to_lowercase());
                        let new_val = Self::lower_keys_value(v);
                        new_map.insert(new_key, new_val);
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

    /// Résout un chemin relatif ou absolu et crée le répertoire si nécessaire
    fn resolve_and_create_dir(&self, dir_path: &str) -> Result<String> {
        let path = Path::new(dir_path);

        let absolute_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            // Chemin relatif : le résoudre par rapport à config_dir
            Path::new(&self.config_dir).join(path)
        };

        if !absolute_path.exists() {
            fs::create_dir_all(&absolute_path)?;
            info!(directory=%absolute_path.display(), "Created managed directory");
        }

        Ok(absolute_path.to_string_lossy().to_string())
    }

    /// Récupère un répertoire géré par la configuration
    ///
    /// Le répertoire peut être absolu ou relatif au répertoire de
    /// configuration. Il sera créé s'il n'existe pas.
    ///
    /// # Arguments
    ///
    /// * `path` - Chemin dans l'arbre de configuration (ex: `&["cache", "directory"]`)
    /// * `default` - Nom de répertoire par défaut si non configuré
    pub fn get_managed_dir(&self, path: &[&str], default: &str) -> Result<String> {
        let dir_path = match self.get_value(path) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => default.to_string(),
        };
        self.resolve_and_create_dir(&dir_path)
    }

    /// Définit un répertoire géré par la configuration (en mémoire)
    pub fn set_managed_dir(&self, path: &[&str], directory: String) -> Result<()> {
        self.set_value(path, Value::String(directory))
    }

    impl_usize_config!(
        get_buffer_cutoff,
        set_buffer_cutoff,
        &["stream", "buffer_cutoff_bytes"],
        DEFAULT_BUFFER_CUTOFF
    );

    impl_usize_config!(
        get_pacing_check_ms,
        set_pacing_check_ms,
        &["cutter", "pacing_check_ms"],
        DEFAULT_PACING_CHECK_MS
    );

    impl_usize_config!(
        get_live_lookahead_ms,
        set_live_lookahead_ms,
        &["cutter", "live_lookahead_ms"],
        DEFAULT_LIVE_LOOKAHEAD_MS
    );

    impl_usize_config!(
        get_pacing_sleep_ms,
        set_pacing_sleep_ms,
        &["cutter", "pacing_sleep_ms"],
        DEFAULT_PACING_SLEEP_MS
    );

    impl_usize_config!(
        get_throttle_max_wait_ms,
        set_throttle_max_wait_ms,
        &["throttle", "max_wait_ms"],
        DEFAULT_THROTTLE_MAX_WAIT_MS
    );

    impl_usize_config!(
        get_throttle_sweep_interval_secs,
        set_throttle_sweep_interval_secs,
        &["throttle", "sweep_interval_secs"],
        DEFAULT_THROTTLE_SWEEP_SECS
    );

    impl_bool_config!(
        get_log_enable_console,
        set_log_enable_console,
        &["host", "logger", "enable_console"],
        DEFAULT_LOG_ENABLE_CONSOLE
    );

    /// Capacity given to identities without an explicit entry.
    ///
    /// `None` (a `~` in YAML) means that only the identities listed under
    /// `throttle.identities` are admitted.
    pub fn get_throttle_default_capacity(&self) -> Result<Option<usize>> {
        match self.get_value(&["throttle", "default_capacity"]) {
            Ok(Value::Null) => Ok(None),
            Ok(Value::Number(n)) => Ok(n.as_u64().map(|v| v as usize)),
            _ => Ok(Some(DEFAULT_THROTTLE_CAPACITY)),
        }
    }

    /// Per-identity capacities from `throttle.identities`.
    ///
    /// Entries whose value is not a non-negative integer are skipped.
    pub fn get_throttle_identities(&self) -> Result<HashMap<String, usize>> {
        let mut identities = HashMap::new();
        if let Ok(Value::Mapping(map)) = self.get_value(&["throttle", "identities"]) {
            for (key, value) in map {
                match (key, value.as_u64()) {
                    (Value::String(identity), Some(capacity)) => {
                        identities.insert(identity, capacity as usize);
                    }
                    (key, _) => warn!(?key, "Ignoring invalid throttle identity entry"),
                }
            }
        }
        Ok(identities)
    }

    /// Récupère le niveau de log minimum depuis la configuration
    pub fn get_log_min_level(&self) -> Result<String> {
        match self.get_value(&["host", "logger", "min_level"]) {
            Ok(Value::String(s)) => Ok(s),
            _ => Ok(DEFAULT_LOG_MIN_LEVEL.to_string()),
        }
    }

    /// Définit le niveau de log minimum (en mémoire)
    pub fn set_log_min_level(&self, level: String) -> Result<()> {
        self.set_value(&["host", "logger", "min_level"], Value::String(level))
    }
}

/// Loads the global configuration from `directory` on first call
///
/// Later calls return the already loaded instance whatever the argument.
/// An empty `directory` uses the default search order.
pub fn init_config(directory: &str) -> Result<Arc<Config>> {
    let mut global = CONFIG.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(config) = global.as_ref() {
        return Ok(config.clone());
    }
    let config = Arc::new(Config::load_config(directory)?);
    *global = Some(config.clone());
    Ok(config)
}

/// Returns the global configuration instance
///
/// The configuration is loaded with the default search order on first access.
///
/// # Examples
///
/// ```no_run
/// use pmoconfig::get_config;
///
/// let config = get_config()?;
/// let level = config.get_log_min_level()?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn get_config() -> Result<Arc<Config>> {
    init_config("")
}

/// Merges external YAML configuration into default configuration
///
/// This function recursively merges two YAML value trees:
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

    #[test]
    fn test_defaults_are_embedded() {
        let config = Config::from_yaml_str("", ".").unwrap();
        assert_eq!(config.get_buffer_cutoff().unwrap(), DEFAULT_BUFFER_CUTOFF);
        assert_eq!(config.get_pacing_check_ms().unwrap(), 1000);
        assert_eq!(config.get_live_lookahead_ms().unwrap(), 3000);
        assert_eq!(config.get_pacing_sleep_ms().unwrap(), 50);
        assert_eq!(config.get_throttle_default_capacity().unwrap(), Some(2));
        assert!(config.get_throttle_identities().unwrap().is_empty());
        assert_eq!(config.get_log_min_level().unwrap(), "INFO");
        assert!(config.get_log_enable_console().unwrap());
    }

    #[test]
    fn test_external_yaml_overrides_defaults() {
        let yaml = r#"
Stream:
  Buffer_Cutoff_Bytes: 4096
throttle:
  default_capacity: ~
  identities:
    alice: 3
    muted: 0
    broken: "lots"
"#;
        let config = Config::from_yaml_str(yaml, ".").unwrap();
        assert_eq!(config.get_buffer_cutoff().unwrap(), 4096);
        // untouched siblings survive the merge
        assert_eq!(config.get_throttle_max_wait_ms().unwrap(), 30_000);
        assert_eq!(config.get_throttle_default_capacity().unwrap(), None);

        let identities = config.get_throttle_identities().unwrap();
        assert_eq!(identities.len(), 2);
        assert_eq!(identities["alice"], 3);
        assert_eq!(identities["muted"], 0);
    }

    #[test]
    fn test_set_value_stays_in_memory() {
        let config = Config::from_yaml_str("", ".").unwrap();
        config.set_buffer_cutoff(1234).unwrap();
        assert_eq!(config.get_buffer_cutoff().unwrap(), 1234);

        let copy = config.clone();
        copy.set_buffer_cutoff(99).unwrap();
        assert_eq!(config.get_buffer_cutoff().unwrap(), 1234);
    }

    #[test]
    fn test_env_value_conversion() {
        assert_eq!(Config::convert_env_value("42"), Value::Number(42.into()));
        assert_eq!(Config::convert_env_value("true"), Value::Bool(true));
        assert_eq!(
            Config::convert_env_value("DEBUG"),
            Value::String("DEBUG".into())
        );
    }

    #[test]
    fn test_env_override_path() {
        let mut value = serde_yaml::from_str::<Value>("cache:\n  directory: cache\n").unwrap();
        Config::set_value_internal(&mut value, &["CACHE", "DIRECTORY"], Value::String("/tmp/x".into()))
            .unwrap();
        assert_eq!(
            Config::get_value_internal(&value, &["cache", "directory"]).unwrap(),
            Value::String("/tmp/x".into())
        );
    }

    #[test]
    fn test_managed_dir_is_created_relative_to_config_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config =
            Config::from_yaml_str("cache:\n  directory: store\n", temp_dir.path().to_str().unwrap())
                .unwrap();
        let dir = config.get_managed_dir(&["cache", "directory"], "cache").unwrap();
        assert_eq!(Path::new(&dir), temp_dir.path().join("store"));
        assert!(Path::new(&dir).is_dir());
    }

    #[test]
    fn test_load_config_reads_config_yaml() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(
            temp_dir.path().join("config.yaml"),
            "cutter:\n  live_lookahead_ms: 500\n",
        )
        .unwrap();
        let config = Config::load_config(temp_dir.path().to_str().unwrap()).unwrap();
        assert_eq!(config.get_live_lookahead_ms().unwrap(), 500);
        assert_eq!(config.get_config_dir(), temp_dir.path().to_str().unwrap());
    }
}
