//! Nettoyage périodique des entrées périmées.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheConfig, FileCache};

/// Lance une tâche qui appelle [`FileCache::clear_stale`] toutes les
/// `interval` jusqu'à l'annulation de `token`.
///
/// Un intervalle ou un âge nul désactive le nettoyage : la tâche se termine
/// immédiatement.
pub fn spawn_cleanup_task<C: CacheConfig>(
    cache: Arc<FileCache<C>>,
    interval: Duration,
    max_age: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if interval.is_zero() || max_age.is_zero() {
            debug!(cache = C::cache_name(), "periodic cleanup disabled");
            return;
        }

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = cache.clear_stale(max_age).await {
                        warn!(cache = C::cache_name(), "periodic cleanup failed: {}", err);
                    }
                }
            }
        }
        debug!(cache = C::cache_name(), "periodic cleanup stopped");
    })
}
