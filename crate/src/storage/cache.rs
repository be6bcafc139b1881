use std::collections::HashMap;
use std::future::Future;

use tokio::sync::{watch, Mutex};
use tracing::debug;

use super::{StorageError, StorageResult};

type Outcome<H> = Option<StorageResult<H>>;

enum Slot<H> {
    Connecting(watch::Receiver<Outcome<H>>),
    Ready(H),
}

/// Lazily acquired handles keyed by resource name (container, bucket...).
///
/// At most one acquisition per key is in flight. Callers arriving while it
/// runs wait for its outcome instead of starting their own; a failure is
/// handed to every waiter and the key goes back to absent, so the next call
/// tries again. A ready handle is kept for the lifetime of the cache.
pub struct ResourceCache<H> {
    slots: Mutex<HashMap<String, Slot<H>>>,
}

impl<H> Default for ResourceCache<H> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<H: Clone + Send + Sync> ResourceCache<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<H> {
        match self.slots.lock().await.get(key) {
            Some(Slot::Ready(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Drop a ready handle so the next call acquires a fresh one. In-flight
    /// acquisitions are left alone, as is a handle `stale` rejects (another
    /// caller already replaced it).
    pub async fn invalidate_if(&self, key: &str, stale: impl FnOnce(&H) -> bool) -> bool {
        let mut slots = self.slots.lock().await;
        let evict = matches!(slots.get(key), Some(Slot::Ready(handle)) if stale(handle));
        if evict {
            slots.remove(key);
            debug!("Invalidated cached handle for {}", key);
        }
        evict
    }

    pub async fn get_or_acquire<F, Fut>(&self, key: &str, acquire: F) -> StorageResult<H>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<H>>,
    {
        let mut acquire = Some(acquire);
        loop {
            let mut waiting = {
                let mut slots = self.slots.lock().await;
                let abandoned = matches!(
                    slots.get(key),
                    Some(Slot::Connecting(receiver)) if receiver.has_changed().is_err()
                );
                if abandoned {
                    slots.remove(key);
                }
                match slots.get(key) {
                    Some(Slot::Ready(handle)) => return Ok(handle.clone()),
                    Some(Slot::Connecting(receiver)) => receiver.clone(),
                    None => {
                        let Some(acquire) = acquire.take() else {
                            return Err(StorageError::client(
                                None,
                                format!("acquisition of {key} was abandoned"),
                            ));
                        };
                        let (sender, receiver) = watch::channel(None);
                        slots.insert(key.to_string(), Slot::Connecting(receiver));
                        drop(slots);
                        return self.run_acquisition(key, sender, acquire).await;
                    }
                }
            };

            debug!("Waiting on in-flight acquisition of {}", key);
            let outcome = match waiting.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone(),
                // The acquiring caller was dropped before finishing; go around
                // and acquire ourselves.
                Err(_) => None,
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    async fn run_acquisition<F, Fut>(
        &self,
        key: &str,
        sender: watch::Sender<Outcome<H>>,
        acquire: F,
    ) -> StorageResult<H>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<H>>,
    {
        let mut guard = AbandonGuard {
            cache: self,
            key,
            armed: true,
        };
        let outcome = acquire().await;
        {
            let mut slots = self.slots.lock().await;
            match &outcome {
                Ok(handle) => {
                    slots.insert(key.to_string(), Slot::Ready(handle.clone()));
                }
                Err(_) => {
                    slots.remove(key);
                }
            }
        }
        guard.armed = false;
        sender.send_replace(Some(outcome.clone()));
        outcome
    }
}

/// Clears a `Connecting` slot whose acquiring future was dropped mid-flight.
struct AbandonGuard<'a, H> {
    cache: &'a ResourceCache<H>,
    key: &'a str,
    armed: bool,
}

impl<H> Drop for AbandonGuard<'_, H> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut slots) = self.cache.slots.try_lock() {
            if matches!(slots.get(self.key), Some(Slot::Connecting(_))) {
                slots.remove(self.key);
            }
        }
    }
}
