use std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
};

/// A level-triggered cancellation flag shared between a transfer and whoever wants to stop it.
///
/// Once aborted, the token stays aborted (and every transfer that checks it returns early) until
/// [`AbortToken::rearm`] is called.
#[derive(Debug, Clone, Default)]
pub struct AbortToken(Arc<AtomicBool>);

impl AbortToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of in-flight and future transfers
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear a previous abort so transfers run again
    pub fn rearm(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
