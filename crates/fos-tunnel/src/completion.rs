//! Single-shot completion slots.
//!
//! A [`PendingCompletion`] holds at most one callback. Completing it takes
//! the callback out of the slot before invoking it, so a second completion
//! is a no-op.

/// Boxed single-shot callback
pub type Callback<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Optional pending callback, cleared exactly once when invoked
pub struct PendingCompletion<T> {
    slot: Option<Callback<T>>,
}

impl<T> PendingCompletion<T> {
    pub fn new() -> Self {
        Self { slot: None }
    }

    /// Is a callback waiting?
    pub fn is_pending(&self) -> bool {
        self.slot.is_some()
    }

    /// Store a callback. Hands it back if the slot is already taken.
    pub fn try_arm(&mut self, callback: Callback<T>) -> Result<(), Callback<T>> {
        if self.slot.is_some() {
            return Err(callback);
        }
        self.slot = Some(callback);
        Ok(())
    }

    /// Invoke and clear the callback. Returns false if nothing was pending.
    pub fn complete(&mut self, value: T) -> bool {
        match self.slot.take() {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }
}

impl<T> Default for PendingCompletion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for PendingCompletion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCompletion")
            .field("pending", &self.is_pending())
            .finish()
    }
}
