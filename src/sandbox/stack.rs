//! Native call-depth guard for guest execution.
//!
//! Guest method dispatch recurses on the host's native stack, so depth is
//! tracked explicitly and checked before each frame is entered. The limit
//! is a safety margin far below any platform stack size; the guard must
//! trip strictly before a real overflow ever could.

use crate::error::{Result, SandboxError};

/// Default native frame budget for guest dispatch.
pub const DEFAULT_MAX_DEPTH: usize = 256;

/// Explicit depth counter for guest-triggered native call frames.
#[derive(Debug)]
pub struct StackGuard {
    depth: usize,
    max_depth: usize,
}

impl StackGuard {
    /// Create a guard with the default frame budget.
    pub fn new() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DEPTH)
    }

    /// Create a guard with a specific frame budget.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            depth: 0,
            max_depth,
        }
    }

    /// Enter one native frame on behalf of the guest. Fails with
    /// `StackExhausted` when the budget is spent.
    #[inline]
    pub fn enter(&mut self) -> Result<()> {
        if self.depth >= self.max_depth {
            return Err(SandboxError::StackExhausted);
        }
        self.depth += 1;
        Ok(())
    }

    /// Leave one native frame. Balanced with a successful `enter`.
    #[inline]
    pub fn leave(&mut self) {
        debug_assert!(self.depth > 0, "stack guard leave without enter");
        self.depth = self.depth.saturating_sub(1);
    }

    /// Current tracked depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Reset the counter between runs; an aborted run may have unwound
    /// without balanced `leave` calls.
    pub fn reset(&mut self) {
        self.depth = 0;
    }
}

impl Default for StackGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_at_budget_not_after() {
        let mut guard = StackGuard::with_max_depth(3);
        guard.enter().unwrap();
        guard.enter().unwrap();
        guard.enter().unwrap();
        let err = guard.enter().unwrap_err();
        assert_eq!(err.to_string(), "stack exhausted");
        assert_eq!(guard.depth(), 3);
    }

    #[test]
    fn test_enter_leave_balance() {
        let mut guard = StackGuard::with_max_depth(2);
        guard.enter().unwrap();
        guard.leave();
        guard.enter().unwrap();
        guard.enter().unwrap();
        assert!(guard.enter().is_err());
        guard.leave();
        guard.leave();
        guard.leave();
        assert_eq!(guard.depth(), 0);
    }

    #[test]
    fn test_reset_clears_depth() {
        let mut guard = StackGuard::with_max_depth(2);
        guard.enter().unwrap();
        guard.enter().unwrap();
        guard.reset();
        assert_eq!(guard.depth(), 0);
        assert!(guard.enter().is_ok());
    }
}
