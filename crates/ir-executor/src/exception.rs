use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::ExecutorError;

/// Single-assignment error slot shared by the workers of one pass.
///
/// The first error caught wins; later ones are dropped.
#[derive(Debug, Default)]
pub struct ExceptionHolder {
    caught: AtomicBool,
    error: Mutex<Option<ExecutorError>>,
}

impl ExceptionHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `err` if no error was caught yet. Returns whether it was stored.
    pub fn catch(&self, err: ExecutorError) -> bool {
        let mut slot = match self.error.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() || self.caught.load(Ordering::Acquire) {
            return false;
        }
        *slot = Some(err);
        self.caught.store(true, Ordering::Release);
        true
    }

    pub fn is_caught(&self) -> bool {
        self.caught.load(Ordering::Acquire)
    }

    /// Take the stored error. The holder stays marked as caught until
    /// [`ExceptionHolder::clear`].
    pub fn take(&self) -> Option<ExecutorError> {
        match self.error.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn clear(&self) {
        let mut slot = match self.error.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
        self.caught.store(false, Ordering::Release);
    }
}
