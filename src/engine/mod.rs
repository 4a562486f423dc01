//! The reconciliation engine
//!
//! Walks every host in parallel (one worker per host, commands on a host
//! strictly in order) and converges each to the plan: host preparation,
//! then networks, volumes, and containers in dependency order. All state
//! lives on the hosts themselves, recorded in resource labels; the engine
//! holds nothing between runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod executor;
pub mod health;

pub use executor::Engine;

/// Cooperative cancellation shared across host workers.
///
/// Cancelling never interrupts an in-flight remote command; workers check
/// the token between resources and stop starting new work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Decide and report, but mutate nothing. Image pulls are skipped too,
    /// so decisions come from recorded labels alone.
    pub dry_run: bool,
    pub cancel: CancelToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
