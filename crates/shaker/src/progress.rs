//! Progress reporting and cooperative cancellation for long-running stages

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives progress notifications from the validation stages. Every method
/// has a no-op default, and implementations must be shareable across the
/// worker threads used during estimation.
pub trait Progress: Sync {
    fn start(&self, _label: &str, _total: usize) {}
    fn inc(&self, _delta: usize) {}
    fn finish(&self) {}
}

/// Discards all progress notifications
#[derive(Copy, Clone, Debug, Default)]
pub struct Silent;

impl Progress for Silent {}

/// Shared flag checked once per unit of work (spectrum, peptide, group).
/// Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clones_share_flag() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
