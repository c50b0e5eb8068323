use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{error::ThrottleError, settings::CapacitySource};

struct Slot {
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
    resizing: AtomicBool,
    /// Admissions taken with `try_admit` and not released yet.
    detached: AtomicUsize,
}

impl Slot {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            resizing: AtomicBool::new(false),
            detached: AtomicUsize::new(0),
        }
    }

    fn outstanding(&self) -> usize {
        self.capacity
            .load(Ordering::SeqCst)
            .saturating_sub(self.semaphore.available_permits())
    }
}

/// Clears the resize flag when the resize ends, including on cancellation.
struct ResizeGuard<'a>(&'a AtomicBool);

impl Drop for ResizeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-identity concurrency limiter.
///
/// Share it behind an `Arc`; every method takes `&self`. The identity map is
/// locked only for lookups, never across an await.
pub struct AdmissionThrottle {
    source: Box<dyn CapacitySource>,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

/// A granted admission. Dropping it gives the slot back.
#[must_use = "dropping the permit releases the admission immediately"]
pub struct AdmissionPermit {
    identity: String,
    permit: OwnedSemaphorePermit,
    _slot: Arc<Slot>,
}

impl AdmissionPermit {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Releases the admission. Equivalent to dropping the permit.
    pub fn release(self) {}
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("identity", &self.identity)
            .finish()
    }
}

impl AdmissionThrottle {
    pub fn new(source: impl CapacitySource + 'static) -> Self {
        Self {
            source: Box::new(source),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up or lazily creates the slot of `identity`.
    ///
    /// Disabled identities get a slot only when `allow_disabled` is set, so a
    /// resize can enable them.
    fn slot(&self, identity: &str, allow_disabled: bool) -> Result<Arc<Slot>, ThrottleError> {
        let mut slots = self.slots();
        if let Some(slot) = slots.get(identity) {
            if !allow_disabled && slot.capacity.load(Ordering::SeqCst) == 0 {
                return Err(ThrottleError::Disabled(identity.to_string()));
            }
            return Ok(slot.clone());
        }

        let capacity = self
            .source
            .capacity_for(identity)
            .ok_or_else(|| ThrottleError::Unknown(identity.to_string()))?;
        if capacity == 0 && !allow_disabled {
            return Err(ThrottleError::Disabled(identity.to_string()));
        }

        debug!(identity = %identity, capacity, "creating admission slot");
        let slot = Arc::new(Slot::new(capacity));
        slots.insert(identity.to_string(), slot.clone());
        Ok(slot)
    }

    /// Waits up to `max_wait` for a free slot of `identity`.
    ///
    /// Fails immediately for unknown or disabled identities and with
    /// [`ThrottleError::CapacityExceeded`] when the wait times out.
    pub async fn acquire(
        &self,
        identity: &str,
        max_wait: Duration,
    ) -> Result<AdmissionPermit, ThrottleError> {
        let slot = self.slot(identity, false)?;

        let permit = match tokio::time::timeout(max_wait, slot.semaphore.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ThrottleError::Closed(identity.to_string())),
            Err(_) => {
                debug!(identity = %identity, ?max_wait, "admission timed out");
                return Err(ThrottleError::CapacityExceeded {
                    identity: identity.to_string(),
                    waited: max_wait,
                });
            }
        };

        Ok(AdmissionPermit {
            identity: identity.to_string(),
            permit,
            _slot: slot,
        })
    }

    /// Boolean form of [`AdmissionThrottle::acquire`].
    ///
    /// The admission is kept until [`AdmissionThrottle::release`] is called
    /// for the same identity.
    pub async fn try_admit(&self, identity: &str, max_wait: Duration) -> bool {
        match self.acquire(identity, max_wait).await {
            Ok(permit) => {
                permit._slot.detached.fetch_add(1, Ordering::SeqCst);
                permit.permit.forget();
                true
            }
            Err(err) => {
                debug!(identity = %identity, "admission refused: {}", err);
                false
            }
        }
    }

    /// Gives back an admission obtained with [`AdmissionThrottle::try_admit`].
    ///
    /// Returns `false` when the identity has no such admission; permits
    /// from [`AdmissionThrottle::acquire`] are only given back by dropping
    /// them.
    pub fn release(&self, identity: &str) -> bool {
        let Some(slot) = self.slots().get(identity).cloned() else {
            return false;
        };
        let taken = slot
            .detached
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_err() {
            return false;
        }
        slot.semaphore.add_permits(1);
        true
    }

    /// Changes the capacity of `identity`.
    ///
    /// Growing takes effect immediately. Shrinking takes back one free slot at
    /// a time and waits for running admissions to end when there are not
    /// enough free slots, so it should not be awaited on a request path.
    pub async fn resize(&self, identity: &str, new_capacity: usize) -> Result<(), ThrottleError> {
        let slot = self.slot(identity, true)?;
        if slot.resizing.swap(true, Ordering::SeqCst) {
            return Err(ThrottleError::ResizeInProgress(identity.to_string()));
        }
        let _guard = ResizeGuard(&slot.resizing);

        let current = slot.capacity.load(Ordering::SeqCst);
        if new_capacity > current {
            slot.capacity.store(new_capacity, Ordering::SeqCst);
            slot.semaphore.add_permits(new_capacity - current);
        } else {
            for _ in new_capacity..current {
                let permit = slot
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| ThrottleError::Closed(identity.to_string()))?;
                permit.forget();
                slot.capacity.fetch_sub(1, Ordering::SeqCst);
            }
        }

        info!(identity = %identity, from = current, to = new_capacity, "admission capacity resized");
        Ok(())
    }

    /// Admissions currently held by `identity`.
    pub fn outstanding(&self, identity: &str) -> usize {
        self.slots()
            .get(identity)
            .map_or(0, |slot| slot.outstanding())
    }

    /// Current capacity of `identity`, if it has a slot.
    pub fn capacity(&self, identity: &str) -> Option<usize> {
        self.slots()
            .get(identity)
            .map(|slot| slot.capacity.load(Ordering::SeqCst))
    }

    /// Identities that currently have a slot.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Forgets idle identities and returns how many were removed.
    ///
    /// An identity is idle when nothing is admitted, nobody is waiting and no
    /// resize is running. A forgotten identity starts again from its
    /// configured capacity on next use.
    pub fn sweep(&self) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        // The map holds the only reference to an idle slot: waiters and
        // permits keep their own clone.
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot.outstanding() > 0
                || slot.resizing.load(Ordering::SeqCst)
        });
        let removed = before - slots.len();
        if removed > 0 {
            debug!(removed, remaining = slots.len(), "swept idle admission slots");
        }
        removed
    }

    /// Runs [`AdmissionThrottle::sweep`] every `interval` until `token` is
    /// cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
            debug!("admission sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ThrottleSettings;

    #[test]
    fn test_unknown_and_disabled_identities() {
        let throttle = AdmissionThrottle::new(ThrottleSettings::new(None).with_identity("off", 0));
        assert_eq!(
            throttle.slot("ghost", false).err(),
            Some(ThrottleError::Unknown("ghost".into()))
        );
        assert_eq!(
            throttle.slot("off", false).err(),
            Some(ThrottleError::Disabled("off".into()))
        );
        assert!(throttle.is_empty());
        assert!(throttle.slot("off", true).is_ok());
        assert_eq!(throttle.capacity("off"), Some(0));
    }

    #[test]
    fn test_release_without_admission() {
        let throttle = AdmissionThrottle::new(ThrottleSettings::new(Some(1)));
        assert!(!throttle.release("nobody"));
    }
}
