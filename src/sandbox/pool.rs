//! Bounded memory pool for guest allocations.
//!
//! Every byte the guest runtime holds is charged against a fixed-capacity
//! pool. The pool is pure accounting: the interpreter performs the actual
//! allocation only after the charge succeeds, so a rejected request has no
//! side effect on `in_use`.

use crate::error::{Result, SandboxError};
use crate::sandbox::crash;

/// Smallest accepted pool capacity after rounding.
pub const CAPACITY_MIN: usize = 256 * 1024;
/// Largest accepted pool capacity after rounding.
pub const CAPACITY_MAX: usize = 256 * 1024 * 1024;

const PAGE_SIZE: usize = 4096;

/// Fixed-capacity allocation accounting for one engine.
#[derive(Debug)]
pub struct MemoryPool {
    /// Capacity in bytes, fixed at construction (already rounded).
    capacity: usize,
    /// Bytes currently charged.
    in_use: usize,
    /// Highest `in_use` ever observed.
    peak: usize,
}

fn round_capacity(capacity: usize) -> usize {
    let partial = capacity & (PAGE_SIZE - 1);
    if partial != 0 {
        (capacity & !(PAGE_SIZE - 1)) + PAGE_SIZE
    } else {
        capacity
    }
}

impl MemoryPool {
    /// Create a pool. The requested capacity is rounded up to the nearest
    /// 4 KiB page, then bounds-checked against [`CAPACITY_MIN`],
    /// [`CAPACITY_MAX`]. The error message cites both the raw request and
    /// the rounded size.
    pub fn new(capacity: usize) -> Result<Self> {
        let rounded = round_capacity(capacity);
        if !(CAPACITY_MIN..=CAPACITY_MAX).contains(&rounded) {
            return Err(SandboxError::Argument(format!(
                "memory pool must be between {}KiB and {}KiB (requested {}B rounded to {}KiB)",
                CAPACITY_MIN >> 10,
                CAPACITY_MAX >> 10,
                capacity,
                rounded >> 10,
            )));
        }

        Ok(Self {
            capacity: rounded,
            in_use: 0,
            peak: 0,
        })
    }

    /// The fixed, rounded capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently charged against the pool.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Highest `in_use` ever observed.
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Charge `size` bytes. Fails with `MemoryQuota` when the charge would
    /// push `in_use` past capacity; `in_use` is unchanged by a rejection.
    pub fn charge(&mut self, size: usize) -> Result<()> {
        match self.in_use.checked_add(size) {
            Some(next) if next <= self.capacity => {
                self.in_use = next;
                if next > self.peak {
                    self.peak = next;
                }
                Ok(())
            }
            _ => Err(SandboxError::MemoryQuota {
                requested: size,
                in_use: self.in_use,
                capacity: self.capacity,
            }),
        }
    }

    /// Release `size` previously charged bytes. Releasing more than is in
    /// use means the sandbox's own accounting is corrupt, which is an
    /// internal fault, not a guest error.
    pub fn release(&mut self, size: usize) -> Result<()> {
        match self.in_use.checked_sub(size) {
            Some(next) => {
                self.in_use = next;
                Ok(())
            }
            None => Err(crash::internal_error(format!(
                "memory pool accounting underflow: released {} bytes with {} in use",
                size, self.in_use,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_unaligned_capacity_up() {
        let pool = MemoryPool::new(654_321).unwrap();
        assert_eq!(pool.capacity() % PAGE_SIZE, 0);
        assert!(pool.capacity() >= 654_321);
        assert!(pool.capacity() < 654_321 + PAGE_SIZE);
    }

    #[test]
    fn test_rejects_tiny_capacity_with_rounded_sizes() {
        let err = MemoryPool::new(8).unwrap_err();
        assert_eq!(
            err.to_string(),
            "memory pool must be between 256KiB and 262144KiB (requested 8B rounded to 4KiB)"
        );
    }

    #[test]
    fn test_rejects_huge_capacity_with_rounded_sizes() {
        let err = MemoryPool::new(1024 * 1024 * 1024).unwrap_err();
        assert_eq!(
            err.to_string(),
            "memory pool must be between 256KiB and 262144KiB \
             (requested 1073741824B rounded to 1048576KiB)"
        );
    }

    #[test]
    fn test_accepts_bounds() {
        assert!(MemoryPool::new(CAPACITY_MIN).is_ok());
        assert!(MemoryPool::new(CAPACITY_MAX).is_ok());
        assert!(MemoryPool::new(CAPACITY_MIN - 1).is_ok()); // rounds up to min
        assert!(MemoryPool::new(CAPACITY_MAX + 1).is_err());
    }

    #[test]
    fn test_charge_and_release() {
        let mut pool = MemoryPool::new(CAPACITY_MIN).unwrap();
        pool.charge(1000).unwrap();
        pool.charge(24).unwrap();
        assert_eq!(pool.in_use(), 1024);
        assert_eq!(pool.peak(), 1024);
        pool.release(1000).unwrap();
        assert_eq!(pool.in_use(), 24);
        assert_eq!(pool.peak(), 1024);
    }

    #[test]
    fn test_rejected_charge_is_side_effect_free() {
        let mut pool = MemoryPool::new(CAPACITY_MIN).unwrap();
        pool.charge(100).unwrap();
        let err = pool.charge(pool.capacity()).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "failed to allocate {} bytes (100 bytes out of {} in use)",
                pool.capacity(),
                pool.capacity()
            )
        );
        assert_eq!(pool.in_use(), 100);
    }

    #[test]
    fn test_release_underflow_is_internal() {
        let mut pool = MemoryPool::new(CAPACITY_MIN).unwrap();
        pool.charge(8).unwrap();
        let err = pool.release(9).unwrap_err();
        assert!(err.is_internal());
    }
}
