//! Module de gestion du cache de fichiers
//!
//! Chaque cache spécialisé vit dans son propre sous-répertoire
//! `<base>/<cache_name>` ; les entrées sont des fichiers ordinaires nommés par
//! l'appelant. La fraîcheur d'une entrée se mesure à la date de dernière
//! modification du fichier.

use std::{
    io,
    marker::PhantomData,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tokio::fs::{self, File, OpenOptions};
use tracing::{debug, info};

use crate::{
    error::{CacheError, Result},
    path::resolve,
};

/// Suffixe des entrées en cours d'écriture.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Paramètres statiques d'un cache spécialisé.
pub trait CacheConfig: Send + Sync + 'static {
    /// Extension des fichiers générés (ex: `"mp3"`, `"json"`).
    fn file_extension() -> &'static str;
    /// Type logique exposé (ex: `"audio"`, `"ranges"`).
    fn cache_type() -> &'static str {
        "file"
    }
    /// Nom du cache, utilisé comme sous-répertoire de la racine.
    fn cache_name() -> &'static str {
        "cache"
    }
}

/// Cache de fichiers confiné à sa racine.
///
/// Toutes les opérations prennent un nom d'entrée relatif ; un nom qui sort de
/// la racine (chemin absolu, `..`, lien symbolique) échoue avec
/// [`CacheError::PathEscape`] avant tout accès au fichier visé.
///
/// Conçu pour être partagé derrière un `Arc<FileCache<C>>` : il n'y a pas
/// d'état mutable, l'atomicité repose sur le système de fichiers.
pub struct FileCache<C: CacheConfig> {
    /// Racine canonique
    root: PathBuf,
    _phantom: PhantomData<C>,
}

impl<C: CacheConfig> FileCache<C> {
    /// Ouvre (ou crée) le cache sous `base_dir/<cache_name>`.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let root = base_dir.as_ref().join(C::cache_name());
        std::fs::create_dir_all(&root)?;
        let root = std::fs::canonicalize(&root)?;
        debug!(root = %root.display(), cache = C::cache_name(), "file cache ready");
        Ok(Self {
            root,
            _phantom: PhantomData,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_type(&self) -> &'static str {
        C::cache_type()
    }

    /// Nom d'entrée conventionnel pour une clé : `<key>.<extension>`.
    pub fn entry_name(&self, key: &str) -> String {
        format!("{}.{}", key, C::file_extension())
    }

    /// Chemin absolu d'une entrée, après contrôle de confinement.
    pub async fn path(&self, name: &str) -> Result<PathBuf> {
        resolve(&self.root, name).await
    }

    /// Crée (ou tronque) une entrée et l'ouvre en écriture.
    pub async fn write(&self, name: &str) -> Result<File> {
        let path = resolve(&self.root, name).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(File::create(&path).await?)
    }

    /// Commence l'écriture d'une entrée sous un nom provisoire `<name>.part`.
    ///
    /// La création est exclusive : `None` si une écriture de la même entrée
    /// est déjà en cours. L'entrée `name` reste invisible (et l'ancienne
    /// version reste lisible) jusqu'à [`FileCache::commit`].
    pub async fn write_partial(&self, name: &str) -> Result<Option<File>> {
        let path = resolve(&self.root, &partial_name(name)).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!(name = %name, "entry already being written");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Publie l'écriture provisoire de `name` par un renommage atomique.
    pub async fn commit(&self, name: &str) -> Result<()> {
        let partial = resolve(&self.root, &partial_name(name)).await?;
        let target = resolve(&self.root, name).await?;
        fs::rename(&partial, &target)
            .await
            .map_err(|err| not_found_or(err, name))?;
        debug!(name = %name, "cache entry committed");
        Ok(())
    }

    /// Abandonne l'écriture provisoire de `name` ; `false` s'il n'y en avait pas.
    pub async fn abort(&self, name: &str) -> Result<bool> {
        self.delete(&partial_name(name)).await
    }

    /// Ouvre une entrée en lecture.
    pub async fn read(&self, name: &str) -> Result<File> {
        let path = resolve(&self.root, name).await?;
        File::open(&path).await.map_err(|err| not_found_or(err, name))
    }

    /// Vrai si l'entrée est absente ou a atteint l'âge `max_age`.
    ///
    /// Avec `max_age == 0` une entrée présente n'est jamais périmée.
    pub async fn is_stale(&self, name: &str, max_age: Duration) -> Result<bool> {
        let path = resolve(&self.root, name).await?;
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        if max_age.is_zero() {
            return Ok(false);
        }
        Ok(age(metadata.modified()?) >= max_age)
    }

    /// Ouvre l'entrée seulement si elle existe et n'est pas périmée.
    pub async fn open_if_fresh(&self, name: &str, max_age: Duration) -> Result<Option<File>> {
        if self.is_stale(name, max_age).await? {
            return Ok(None);
        }
        match self.read(name).await {
            Ok(file) => Ok(Some(file)),
            // supprimée entre les deux appels
            Err(CacheError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Remet la date de modification de l'entrée à maintenant.
    pub async fn poke(&self, name: &str) -> Result<()> {
        let path = resolve(&self.root, name).await?;
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|err| not_found_or(err, name))?;
        file.into_std().await.set_modified(SystemTime::now())?;
        Ok(())
    }

    /// Supprime une entrée ; `false` si elle n'existait pas.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let path = resolve(&self.root, name).await?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Copie ou déplace un fichier externe dans le cache et retourne le nom
    /// de l'entrée créée.
    ///
    /// Le nom de l'entrée est celui du fichier source. Avec `avoid_conflict`,
    /// un suffixe `-N` est inséré avant l'extension jusqu'à ce qu'une création
    /// exclusive réussisse ; sinon une entrée existante est écrasée.
    pub async fn import(
        &self,
        source: impl AsRef<Path>,
        move_file: bool,
        avoid_conflict: bool,
    ) -> Result<String> {
        let source = source.as_ref();
        let file_name = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| CacheError::InvalidName(source.display().to_string()))?;

        let (name, target) = if avoid_conflict {
            self.reserve_name(file_name).await?
        } else {
            (file_name.to_string(), resolve(&self.root, file_name).await?)
        };

        if let Err(err) = transfer(source, &target, move_file).await {
            if avoid_conflict {
                let _ = fs::remove_file(&target).await;
            }
            return Err(err.into());
        }

        debug!(source = %source.display(), name = %name, moved = move_file, "imported into cache");
        Ok(name)
    }

    /// Réserve un nom libre en créant le fichier de façon exclusive.
    async fn reserve_name(&self, file_name: &str) -> Result<(String, PathBuf)> {
        for attempt in 0u32.. {
            let candidate = numbered_name(file_name, attempt);
            let target = resolve(&self.root, &candidate).await?;
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .await
            {
                Ok(_) => return Ok((candidate, target)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(CacheError::InvalidName(file_name.to_string()))
    }

    /// Supprime les entrées ayant atteint l'âge `max_age` et retourne leur nombre.
    ///
    /// Les fichiers impossibles à supprimer sont ignorés et non comptés.
    /// `max_age == 0` ne supprime rien.
    pub async fn clear_stale(&self, max_age: Duration) -> Result<usize> {
        if max_age.is_zero() {
            return Ok(0);
        }

        let mut removed = 0;
        for path in self.files().await? {
            let Ok(metadata) = fs::symlink_metadata(&path).await else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if age(modified) < max_age {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) => debug!(path = %path.display(), "stale entry not removed: {}", err),
            }
        }

        if removed > 0 {
            info!(cache = C::cache_name(), removed, "cleared stale cache entries");
        }
        Ok(removed)
    }

    /// Supprime toutes les entrées et retourne leur nombre.
    pub async fn purge(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.files().await? {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) => debug!(path = %path.display(), "entry not purged: {}", err),
            }
        }
        info!(cache = C::cache_name(), removed, "cache purged");
        Ok(removed)
    }

    /// Noms de toutes les entrées, triés.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .files()
            .await?
            .iter()
            .filter_map(|path| path.strip_prefix(&self.root).ok())
            .map(|relative| {
                relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Tous les fichiers sous la racine, sans suivre les liens symboliques.
    async fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if dir != self.root => {
                    debug!(dir = %dir.display(), "cache directory skipped: {}", err);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else {
                    files.push(entry.path());
                }
            }
        }
        Ok(files)
    }
}

fn not_found_or(err: io::Error, name: &str) -> CacheError {
    if err.kind() == io::ErrorKind::NotFound {
        CacheError::NotFound(name.to_string())
    } else {
        err.into()
    }
}

/// Age of a modification time; dates in the future count as zero.
fn age(modified: SystemTime) -> Duration {
    modified.elapsed().unwrap_or(Duration::ZERO)
}

/// Nom provisoire d'une entrée en cours d'écriture.
fn partial_name(name: &str) -> String {
    format!("{name}{PARTIAL_SUFFIX}")
}

/// `show.mp3`, `show-1.mp3`, `show-2.mp3`, ...
fn numbered_name(file_name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return file_name.to_string();
    }
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{attempt}.{ext}"),
        _ => format!("{file_name}-{attempt}"),
    }
}

async fn transfer(source: &Path, target: &Path, move_file: bool) -> io::Result<()> {
    if move_file {
        if fs::rename(source, target).await.is_ok() {
            return Ok(());
        }
        // autre système de fichiers : copie puis suppression
        fs::copy(source, target).await?;
        fs::remove_file(source).await
    } else {
        fs::copy(source, target).await.map(|_| ())
    }
}
