//! Confinement of entry names to the cache root.
//!
//! A name is first normalized lexically: `.` is dropped and `..` pops the
//! previous component. Absolute names and `..` that would climb above the
//! root are rejected. The deepest existing part of the result is then
//! canonicalized, so a symlink inside the cache pointing elsewhere is
//! rejected before anything is opened through it.

use std::path::{Component, Path, PathBuf};

use crate::error::{CacheError, Result};

/// Resolves `name` under `root`, which must already be canonical.
pub(crate) async fn resolve(root: &Path, name: &str) -> Result<PathBuf> {
    let relative = normalize(name)?;
    let candidate = root.join(&relative);

    let mut existing = candidate.as_path();
    loop {
        // symlink_metadata so that a dangling link counts as present
        if tokio::fs::symlink_metadata(existing).await.is_ok() {
            break;
        }
        match existing.parent() {
            Some(parent) if parent.starts_with(root) => existing = parent,
            _ => return Err(CacheError::PathEscape(name.to_string())),
        }
    }

    let canonical = tokio::fs::canonicalize(existing)
        .await
        .map_err(|_| CacheError::PathEscape(name.to_string()))?;
    if !canonical.starts_with(root) {
        tracing::warn!(name = %name, resolved = %canonical.display(), "cache path escapes root");
        return Err(CacheError::PathEscape(name.to_string()));
    }

    Ok(candidate)
}

/// Lexical normalization, without filesystem access.
pub(crate) fn normalize(name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.contains('\0') {
        return Err(CacheError::InvalidName(name.to_string()));
    }

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(CacheError::PathEscape(name.to_string()));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(CacheError::PathEscape(name.to_string()));
                }
            }
            Component::Normal(part) => parts.push(part),
        }
    }

    if parts.is_empty() {
        return Err(CacheError::InvalidName(name.to_string()));
    }
    Ok(parts.into_iter().collect())
}
