use std::sync::{Arc, Mutex, MutexGuard};

/// Last successfully decoded payload, replayed to the consumer once failures
/// cross the degradation threshold.
///
/// Clones share the same slot so the engine handle and its driver task see
/// the same value.
#[derive(Debug)]
pub struct DegradationCache<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for DegradationCache<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

impl<T> Default for DegradationCache<T> {
    fn default() -> Self {
        Self { slot: Arc::new(Mutex::new(None)) }
    }
}

impl<T: Clone> DegradationCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, payload: T) {
        *self.lock() = Some(payload);
    }

    pub fn get(&self) -> Option<T> {
        self.lock().clone()
    }

    pub fn reset(&self) {
        *self.lock() = None;
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        // A panicking consumer must not take the cache down with it
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
