//! Instruction and time quota supervision, and the engine failure latch.
//!
//! The supervisor is consulted at every opcode dispatch, so its hot paths
//! are a compare and an increment. Wall-clock sampling is batched: the
//! clock is read once per [`TIME_CHECK_INTERVAL`] dispatches, trading a
//! bounded worst-case overshoot for per-instruction cheapness.

use std::time::{Duration, Instant};

use crate::error::{Result, SandboxError};

/// Dispatches between monotonic clock samples.
pub const TIME_CHECK_INTERVAL: u64 = 512;

/// One-way failure state of an engine.
///
/// Once the latch leaves `Clear` it never returns; every engine entry
/// point checks it first and refuses to touch the guest afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latch {
    /// The engine is healthy.
    Clear,
    /// A memory, instruction, time, or stack ceiling was hit.
    QuotaExceeded,
    /// An internal fault made the engine unusable.
    Fatal,
}

/// Read-only snapshot of an engine's resource counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStat {
    /// Guest instructions dispatched over the engine's lifetime.
    pub instructions: u64,
    /// Guest CPU time in nanoseconds, when the platform can report it.
    pub cpu_time: u64,
    /// Pool bytes currently in use (read live from the allocator).
    pub memory: usize,
    /// Voluntary context switches observed during guest runs; `None`
    /// until the platform has reported a value.
    pub ctx_switches_v: Option<i64>,
    /// Involuntary context switches; `None` until reported.
    pub ctx_switches_iv: Option<i64>,
}

#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
struct ThreadUsage {
    cpu_ns: u64,
    voluntary: i64,
    involuntary: i64,
}

#[cfg(target_os = "linux")]
fn sample_thread_usage() -> Option<ThreadUsage> {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) };
    if rc != 0 {
        return None;
    }
    let timeval_ns =
        |tv: libc::timeval| -> u64 { tv.tv_sec as u64 * 1_000_000_000 + tv.tv_usec as u64 * 1000 };
    Some(ThreadUsage {
        cpu_ns: timeval_ns(usage.ru_utime) + timeval_ns(usage.ru_stime),
        voluntary: usage.ru_nvcsw as i64,
        involuntary: usage.ru_nivcsw as i64,
    })
}

/// Tracks instructions executed and elapsed wall time against configured
/// ceilings, and owns the engine's failure latch.
#[derive(Debug)]
pub struct QuotaSupervisor {
    instruction_quota: u64,
    instructions: u64,
    time_quota: Duration,
    time_quota_ms: u64,
    deadline: Option<Instant>,
    latch: Latch,
    cpu_time_ns: u64,
    ctx_switches_v: Option<i64>,
    ctx_switches_iv: Option<i64>,
    #[cfg(target_os = "linux")]
    run_usage_start: Option<ThreadUsage>,
}

impl QuotaSupervisor {
    /// Create a supervisor with the given ceilings. `time_quota` has
    /// already been validated and truncated to whole milliseconds by the
    /// engine constructor.
    pub fn new(instruction_quota: u64, time_quota: Duration) -> Self {
        Self {
            instruction_quota,
            instructions: 0,
            time_quota,
            time_quota_ms: time_quota.as_millis() as u64,
            deadline: None,
            latch: Latch::Clear,
            cpu_time_ns: 0,
            ctx_switches_v: None,
            ctx_switches_iv: None,
            #[cfg(target_os = "linux")]
            run_usage_start: None,
        }
    }

    /// Count one dispatched instruction. Fails the instant the counter
    /// would reach the ceiling; on failure the counter equals the ceiling
    /// exactly, and the latch trips.
    #[inline]
    pub fn record_instruction(&mut self) -> Result<()> {
        if self.instructions >= self.instruction_quota {
            self.latch = Latch::QuotaExceeded;
            return Err(SandboxError::InstructionQuota {
                quota: self.instruction_quota,
            });
        }
        self.instructions += 1;
        Ok(())
    }

    /// Whether the batched clock sample is due at the current counter.
    #[inline]
    pub fn time_check_due(&self) -> bool {
        self.instructions % TIME_CHECK_INTERVAL == 0
    }

    /// Sample the monotonic clock against the run deadline.
    pub fn check_time(&mut self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                self.latch = Latch::QuotaExceeded;
                return Err(SandboxError::TimeQuota {
                    quota_ms: self.time_quota_ms,
                });
            }
        }
        Ok(())
    }

    /// Arm the run deadline and start platform usage sampling.
    pub fn begin_run(&mut self) {
        self.deadline = Some(Instant::now() + self.time_quota);
        #[cfg(target_os = "linux")]
        {
            self.run_usage_start = sample_thread_usage();
        }
    }

    /// Disarm the deadline and fold platform usage into the lifetime
    /// counters.
    pub fn finish_run(&mut self) {
        self.deadline = None;
        #[cfg(target_os = "linux")]
        if let (Some(start), Some(end)) = (self.run_usage_start.take(), sample_thread_usage()) {
            self.cpu_time_ns += end.cpu_ns.saturating_sub(start.cpu_ns);
            self.ctx_switches_v = Some(end.voluntary);
            self.ctx_switches_iv = Some(end.involuntary);
        }
    }

    /// Instructions dispatched so far.
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    /// The current latch state.
    pub fn latch(&self) -> Latch {
        self.latch
    }

    /// Fail with `QuotaAlreadyReached` if the latch is not clear. Checked
    /// first, unconditionally, in every engine entry point.
    pub fn check_latch(&self) -> Result<()> {
        match self.latch {
            Latch::Clear => Ok(()),
            Latch::QuotaExceeded | Latch::Fatal => Err(SandboxError::QuotaAlreadyReached),
        }
    }

    /// Latch the engine for an error that warrants it. The latch is
    /// one-way: a fatal state is never downgraded.
    pub fn latch_for(&mut self, err: &SandboxError) {
        if err.is_internal() {
            self.latch = Latch::Fatal;
        } else if err.latches() && self.latch == Latch::Clear {
            self.latch = Latch::QuotaExceeded;
        }
    }

    /// Snapshot the lifetime counters. `memory` is read live from the
    /// allocator by the engine; there is no memory-quota counter here
    /// because pool capacity already bounds it structurally.
    pub fn stat(&self, memory: usize) -> EngineStat {
        EngineStat {
            instructions: self.instructions,
            cpu_time: self.cpu_time_ns,
            memory,
            ctx_switches_v: self.ctx_switches_v,
            ctx_switches_iv: self.ctx_switches_iv,
        }
    }
}
