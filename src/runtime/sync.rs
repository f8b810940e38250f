use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Wait handle resolved exactly once; later completions are ignored.
///
/// Clones share the same underlying slot, so any clone may complete it and
/// every clone observes the same value.
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    value: Mutex<Option<T>>,
    cv: Condvar,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                value: Mutex::new(None),
                cv: Condvar::new(),
            }),
        }
    }

    /// Handle that is already resolved with `value`.
    pub fn completed(value: T) -> Self {
        let completion = Self::new();
        completion.complete(value);
        completion
    }

    /// Resolves the handle; returns false when it was already resolved.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.shared.value.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.shared.cv.notify_all();
        true
    }

    pub fn is_done(&self) -> bool {
        self.shared.value.lock().unwrap().is_some()
    }
}

impl<T: Clone> Completion<T> {
    /// Resolved value, when present.
    pub fn peek(&self) -> Option<T> {
        self.shared.value.lock().unwrap().clone()
    }

    /// Blocks until the handle resolves.
    pub fn wait(&self) -> T {
        let mut slot = self.shared.value.lock().unwrap();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            slot = self.shared.cv.wait(slot).unwrap();
        }
    }

    /// Blocks until the handle resolves or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.value.lock().unwrap();
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self.shared.cv.wait_timeout(slot, deadline - now).unwrap();
            slot = next;
        }
    }
}
