//! Extension pour intégrer la gestion des caches dans pmoconfig
//!
//! Ce module fournit le trait `CacheConfigExt` qui ajoute à
//! `pmoconfig::Config` la lecture des paramètres de cache et la construction
//! d'un [`FileCache`] configuré.
//!
//! ```yaml
//! cache:
//!   directory: cache          # relatif au répertoire de configuration
//!   cleanup_interval_secs: 3600
//!   audio:
//!     max_age_secs: 604800
//!   ranges:
//!     max_age_secs: 86400
//! ```

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use pmoconfig::Config;
use serde_yaml::Value;

use crate::{CacheConfig, FileCache};

const DEFAULT_CACHE_DIR: &str = "cache";
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Trait d'extension pour ajouter la gestion des caches à pmoconfig
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::get_config;
/// use pmocache::CacheConfigExt;
///
/// let config = get_config()?;
/// let cache = config.create_file_cache::<AudioCache>()?;
/// let max_age = config.get_cache_max_age("audio", 86400)?;
/// ```
pub trait CacheConfigExt {
    /// Répertoire de base des caches, créé s'il n'existe pas.
    fn get_cache_dir(&self) -> Result<String>;

    /// Âge maximal des entrées du cache `cache_name` (`cache.<name>.max_age_secs`).
    fn get_cache_max_age(&self, cache_name: &str, default_secs: u64) -> Result<Duration>;

    /// Période du nettoyage automatique (`cache.cleanup_interval_secs`).
    fn get_cache_cleanup_interval(&self) -> Result<Duration>;

    /// Crée un cache configuré sous le répertoire de base.
    fn create_file_cache<C: CacheConfig>(&self) -> Result<Arc<FileCache<C>>>;
}

fn secs_value(value: Result<Value>, default: u64) -> Duration {
    match value {
        Ok(Value::Number(n)) => Duration::from_secs(n.as_u64().unwrap_or(default)),
        _ => Duration::from_secs(default),
    }
}

impl CacheConfigExt for Config {
    fn get_cache_dir(&self) -> Result<String> {
        self.get_managed_dir(&["cache", "directory"], DEFAULT_CACHE_DIR)
    }

    fn get_cache_max_age(&self, cache_name: &str, default_secs: u64) -> Result<Duration> {
        Ok(secs_value(
            self.get_value(&["cache", cache_name, "max_age_secs"]),
            default_secs,
        ))
    }

    fn get_cache_cleanup_interval(&self) -> Result<Duration> {
        Ok(secs_value(
            self.get_value(&["cache", "cleanup_interval_secs"]),
            DEFAULT_CLEANUP_INTERVAL_SECS,
        ))
    }

    fn create_file_cache<C: CacheConfig>(&self) -> Result<Arc<FileCache<C>>> {
        let dir = self.get_cache_dir()?;
        Ok(Arc::new(FileCache::<C>::new(dir)?))
    }
}
