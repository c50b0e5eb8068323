//! # pmocache - Cache de fichiers pour PMOCast
//!
//! Cette crate fournit un cache de fichiers sur disque, utilisé pour conserver
//! les épisodes déjà découpés (`audio`) et les plages à retirer (`ranges`).
//!
//! ## Vue d'ensemble
//!
//! - Fraîcheur par âge : une entrée ayant atteint l'âge `max_age` est périmée,
//!   `max_age == 0` signifie « jamais périmée »
//! - Résolution de chemins confinée à la racine du cache (pas de `..`, pas de
//!   chemin absolu, pas de lien symbolique vers l'extérieur)
//! - Import de fichiers externes avec nommage sans conflit
//! - Nettoyage périodique et purge, au mieux (best effort)
//!
//! ## Utilisation
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use pmocache::{CacheConfig, FileCache};
//! use tokio::io::AsyncWriteExt;
//!
//! struct EpisodeCache;
//! impl CacheConfig for EpisodeCache {
//!     fn file_extension() -> &'static str { "mp3" }
//!     fn cache_type() -> &'static str { "audio" }
//!     fn cache_name() -> &'static str { "audio" }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pmocache::CacheError> {
//!     let cache = FileCache::<EpisodeCache>::new("./cache")?;
//!     let name = cache.entry_name("episode-42");
//!
//!     let mut file = cache.write(&name).await?;
//!     file.write_all(b"...").await?;
//!
//!     if let Some(_file) = cache.open_if_fresh(&name, Duration::from_secs(3600)).await? {
//!         println!("{} est frais", name);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Structure des fichiers
//!
//! ```text
//! <base>/
//! ├── audio/                 # FileCache<AudioCache>
//! │   ├── episode-42.mp3
//! │   ├── episode-42-1.mp3   # import avec avoid_conflict
//! │   └── episode-43.mp3.part  # écriture en cours (write_partial)
//! └── ranges/                # FileCache<RangesCache>
//!     └── episode-42.ranges  # une plage `start-end` par ligne
//! ```

pub mod cache;
pub mod cleanup;
pub mod error;
mod path;

#[cfg(feature = "pmoconfig")]
pub mod config_ext;

pub use cache::{CacheConfig, FileCache, PARTIAL_SUFFIX};
pub use cleanup::spawn_cleanup_task;
pub use error::{CacheError, Result};

#[cfg(feature = "pmoconfig")]
pub use config_ext::CacheConfigExt;
