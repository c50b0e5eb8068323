//! Initialisation du système de logs
//!
//! Le niveau minimum vient de `host.logger.min_level` ; la variable
//! `RUST_LOG`, si elle est définie, le remplace.

use anyhow::Result;
use pmoconfig::Config;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Registry, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Convertit un nom de niveau (insensible à la casse) en `Level`
pub fn string_to_level(level: &str) -> Option<Level> {
    match level.trim().to_uppercase().as_str() {
        "ERROR" => Some(Level::ERROR),
        "WARN" | "WARNING" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    }
}

/// Niveau configuré, TRACE si la valeur est illisible
fn configured_level(config: &Config) -> LevelFilter {
    match config.get_log_min_level() {
        Ok(l) => match string_to_level(&l) {
            Some(lev) => LevelFilter::from_level(lev),
            None => LevelFilter::TRACE,
        },
        Err(_) => LevelFilter::TRACE,
    }
}

/// Installe le subscriber global
///
/// Échoue si un subscriber est déjà installé.
pub fn init_logging(config: &Config) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::default().add_directive(configured_level(config).into()),
    };

    let subscriber = Registry::default().with(filter);

    let enable_console = config.get_log_enable_console().unwrap_or(true);

    if enable_console {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        subscriber.try_init()?;
    }

    Ok(())
}
