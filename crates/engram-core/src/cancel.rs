//! Cooperative cancellation.
//!
//! Long operations (`save`, `load`, `consolidate`, large training batches)
//! take a [`CancelToken`] and call [`CancelToken::check`] at loop
//! boundaries. The core has no internal timers beyond the persistence
//! debouncer; timeouts are the caller's wrapper.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{EngramError, Result};

/// Shared cancellation flag handed to long-running operations
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// New, un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token; every holder observes it
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Has the token been tripped
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fail with `Cancelled` if tripped; call at loop boundaries
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(EngramError::Cancelled(operation.to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_passes() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check("save").is_ok());
    }

    #[test]
    fn test_tripped_token_fails_with_operation_name() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();

        let err = token.check("consolidate").unwrap_err();
        assert!(matches!(err, EngramError::Cancelled(op) if op == "consolidate"));
    }
}
