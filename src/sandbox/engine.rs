//! The sandbox engine and its execution pipeline.
//!
//! One engine is one isolation unit: its own pool, its own quota
//! supervisor, its own interpreter state. Engines share nothing, so a
//! host can run one per logical task and discard any that dies. An
//! engine is `Send` but has no interior synchronization; drive it from
//! one task at a time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SandboxError};
use crate::guest::bytecode::Chunk;
use crate::guest::value::{Interp, Value};
use crate::guest::vm::{Unwind, Vm};
use crate::guest::{AllocHook, ExecHooks};
use crate::sandbox::crash;
use crate::sandbox::marshal::{self, HostValue};
use crate::sandbox::pool::MemoryPool;
use crate::sandbox::program::Program;
use crate::sandbox::quota::{EngineStat, QuotaSupervisor};
use crate::sandbox::stack::StackGuard;

/// Hook adapter wiring the interpreter's seams to one engine's pool,
/// supervisor, and stack guard.
struct Hooks<'a> {
    pool: &'a mut MemoryPool,
    supervisor: &'a mut QuotaSupervisor,
    guard: &'a mut StackGuard,
}

impl AllocHook for Hooks<'_> {
    fn alloc(&mut self, bytes: usize) -> Result<()> {
        self.pool.charge(bytes)
    }

    fn dealloc(&mut self, bytes: usize) {
        // An underflow here means the sandbox's own accounting is
        // corrupt; the release already built the crash report, so all
        // that is left is to kill the engine.
        if let Err(err) = self.pool.release(bytes) {
            self.supervisor.latch_for(&err);
        }
    }
}

impl ExecHooks for Hooks<'_> {
    #[inline]
    fn on_dispatch(&mut self) -> Result<()> {
        self.supervisor.record_instruction()?;
        if self.supervisor.time_check_due() {
            self.supervisor.check_time()?;
        }
        Ok(())
    }

    fn on_call_enter(&mut self) -> Result<()> {
        self.guard.enter()
    }

    fn on_call_leave(&mut self) {
        self.guard.leave();
    }
}

struct EngineCore {
    pool: MemoryPool,
    supervisor: QuotaSupervisor,
    guard: StackGuard,
    interp: Interp,
}

/// A quota-bounded sandbox for untrusted guest scripts.
pub struct Engine {
    /// `None` for a slot produced by [`Engine::allocate`] that was never
    /// opened.
    inner: Option<EngineCore>,
}

impl Engine {
    /// Open an engine.
    ///
    /// `memory_capacity` is in bytes (rounded up to a 4 KiB page),
    /// `instruction_quota` in instructions, `time_quota` in seconds
    /// (truncated to whole milliseconds). All three must be positive.
    pub fn new(memory_capacity: i64, instruction_quota: i64, time_quota: f64) -> Result<Self> {
        if memory_capacity <= 0 {
            return Err(SandboxError::Argument(
                "memory quota cannot be negative".to_string(),
            ));
        }
        if instruction_quota <= 0 {
            return Err(SandboxError::Argument(
                "instruction quota cannot be negative".to_string(),
            ));
        }
        // A positive sub-millisecond quota still means "some time":
        // round up so it is not rejected as zero.
        let time_quota_ms = if time_quota.is_finite() && time_quota > 0.0 {
            (time_quota * 1000.0).ceil() as u64
        } else {
            0
        };
        if time_quota_ms == 0 {
            return Err(SandboxError::Argument(
                "time quota cannot be negative".to_string(),
            ));
        }

        let mut pool = MemoryPool::new(memory_capacity as usize)?;
        let mut supervisor = QuotaSupervisor::new(
            instruction_quota as u64,
            Duration::from_millis(time_quota_ms),
        );
        let mut guard = StackGuard::new();
        let interp = {
            let mut hooks = Hooks {
                pool: &mut pool,
                supervisor: &mut supervisor,
                guard: &mut guard,
            };
            Interp::bootstrap(&mut hooks)?
        };

        // Construction-time sanity: the boot image must have been
        // charged, and must leave at least half the pool for the guest.
        if pool.in_use() == 0 || pool.in_use() > pool.capacity() / 2 {
            return Err(crash::internal_error(format!(
                "bootstrap charge out of range: {} of {} bytes",
                pool.in_use(),
                pool.capacity(),
            )));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            capacity = pool.capacity(),
            boot_bytes = pool.in_use(),
            "sandbox engine opened"
        );

        Ok(Self {
            inner: Some(EngineCore {
                pool,
                supervisor,
                guard,
                interp,
            }),
        })
    }

    /// Produce an unopened engine slot. Every operation on it fails with
    /// an argument error naming the operation, until the slot is replaced
    /// by [`Engine::new`].
    pub fn allocate() -> Self {
        Self { inner: None }
    }

    fn core(&mut self, op: &str) -> Result<&mut EngineCore> {
        self.inner.as_mut().ok_or_else(|| {
            SandboxError::Argument(format!("uninitialized value when calling '{op}'"))
        })
    }

    fn core_ref(&self, op: &str) -> Result<&EngineCore> {
        self.inner.as_ref().ok_or_else(|| {
            SandboxError::Argument(format!("uninitialized value when calling '{op}'"))
        })
    }

    /// Compile and run one source file, returning the value of its last
    /// statement.
    ///
    /// A syntax error leaves the engine fully usable and consumes no
    /// quota; quota faults latch the engine.
    pub fn sandbox_eval(&mut self, path: &str, source: &str) -> Result<HostValue> {
        let core = self.core("sandbox_eval")?;
        core.supervisor.check_latch()?;
        let program = Program::compile(&[(path, source)])?;
        #[cfg(feature = "tracing")]
        tracing::trace!(path, bytes = program.size(), "eval");
        let value = core.run(&program)?;
        marshal::extract(&core.interp, value)
    }

    /// Run an ahead-of-time compiled program. Files execute in declared
    /// order against the shared top-level scope; the returned value is
    /// the last file's result.
    pub fn load_instruction_sequence(&mut self, program: &Program) -> Result<HostValue> {
        let core = self.core("load_instruction_sequence")?;
        core.supervisor.check_latch()?;
        let value = core.run(program)?;
        marshal::extract(&core.interp, value)
    }

    /// Copy a host value into the guest as the `@name` instance variable
    /// of the top-level object.
    pub fn inject(&mut self, name: &str, value: &HostValue) -> Result<()> {
        let core = self.core("inject")?;
        core.supervisor.check_latch()?;
        check_ivar_name(name)?;
        let result = {
            let mut hooks = Hooks {
                pool: &mut core.pool,
                supervisor: &mut core.supervisor,
                guard: &mut core.guard,
            };
            marshal::inject(&mut core.interp, &mut hooks, value)
        };
        match result {
            Ok(guest) => {
                core.interp.ivars.insert(name.to_string(), guest);
                // Overwriting an ivar can orphan its previous value;
                // collect here so repeated injection cannot fill the pool.
                let mut hooks = Hooks {
                    pool: &mut core.pool,
                    supervisor: &mut core.supervisor,
                    guard: &mut core.guard,
                };
                core.interp.collect_garbage(&mut hooks);
                Ok(())
            }
            Err(err) => {
                core.supervisor.latch_for(&err);
                Err(err)
            }
        }
    }

    /// Copy the `@name` instance variable of the top-level object out to
    /// the host. An ivar that was never written extracts as `Nil`.
    pub fn extract(&mut self, name: &str) -> Result<HostValue> {
        let core = self.core("extract")?;
        core.supervisor.check_latch()?;
        check_ivar_name(name)?;
        let value = core
            .interp
            .ivars
            .get(name)
            .copied()
            .unwrap_or(Value::Nil);
        marshal::extract(&core.interp, value)
    }

    /// Snapshot the engine's resource counters. Works on a latched
    /// engine; `memory` reads live pool usage.
    pub fn stat(&self) -> Result<EngineStat> {
        let core = self.core_ref("stat")?;
        Ok(core.supervisor.stat(core.pool.in_use()))
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Engine");
        match &self.inner {
            Some(core) => s
                .field("memory_capacity", &core.pool.capacity())
                .field("memory_in_use", &core.pool.in_use())
                .field("instructions", &core.supervisor.instructions())
                .field("latch", &core.supervisor.latch())
                .finish(),
            None => s.field("initialized", &false).finish(),
        }
    }
}

fn check_ivar_name(name: &str) -> Result<()> {
    if name.starts_with('@') && name.len() > 1 {
        Ok(())
    } else {
        Err(SandboxError::Argument(format!(
            "'{name}' is not an instance variable name"
        )))
    }
}

impl EngineCore {
    /// Run a program's chunks through the pipeline: charge the program
    /// bytes, arm the deadline, execute, then settle charges and collect
    /// garbage regardless of outcome.
    fn run(&mut self, program: &Program) -> Result<Value> {
        if let Err(err) = self.pool.charge(program.size()) {
            self.supervisor.latch_for(&err);
            return Err(err);
        }
        self.supervisor.begin_run();
        let outcome = self.run_chunks(program.chunks());
        self.supervisor.finish_run();
        self.guard.reset();

        {
            // The result value is not rooted anywhere yet; keep it
            // alive through the sweep until it has been marshaled out.
            let keep: Vec<Value> = outcome.iter().copied().collect();
            let mut hooks = Hooks {
                pool: &mut self.pool,
                supervisor: &mut self.supervisor,
                guard: &mut self.guard,
            };
            hooks.dealloc(program.size());
            self.interp.collect_garbage_keeping(&mut hooks, &keep);
        }

        match outcome {
            Ok(value) => Ok(value),
            // A clean `exit` stops the program without error; values
            // computed so far stay visible.
            Err(Unwind::Exit) => Ok(Value::Nil),
            Err(Unwind::Raise(record)) => Err(SandboxError::Runtime {
                message: record.message,
                exception_type: record.type_name,
                guest_backtrace: record.backtrace,
            }),
            Err(Unwind::Fault(err)) => {
                self.supervisor.latch_for(&err);
                Err(err)
            }
        }
    }

    fn run_chunks(&mut self, chunks: &[Arc<Chunk>]) -> std::result::Result<Value, Unwind> {
        let mut hooks = Hooks {
            pool: &mut self.pool,
            supervisor: &mut self.supervisor,
            guard: &mut self.guard,
        };
        let mut vm = Vm::new(&mut self.interp, &mut hooks);
        let mut last = Value::Nil;
        for chunk in chunks {
            last = vm.run(chunk)?;
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::new(4 * 1024 * 1024, 100_000, 0.5).unwrap()
    }

    #[test]
    fn test_constructor_rejects_nonpositive_quotas() {
        let err = Engine::new(0, 1, 1.0).unwrap_err();
        assert_eq!(err.to_string(), "memory quota cannot be negative");
        let err = Engine::new(1024 * 1024, -1, 1.0).unwrap_err();
        assert_eq!(err.to_string(), "instruction quota cannot be negative");
        let err = Engine::new(1024 * 1024, 1, 0.0).unwrap_err();
        assert_eq!(err.to_string(), "time quota cannot be negative");
        let err = Engine::new(1024 * 1024, 1, f64::NAN).unwrap_err();
        assert_eq!(err.to_string(), "time quota cannot be negative");
    }

    #[test]
    fn test_eval_returns_last_value() {
        let mut engine = engine();
        let value = engine.sandbox_eval("sample.rb", "1 + 1").unwrap();
        assert_eq!(value, HostValue::Int(2));
    }

    #[test]
    fn test_eval_result_survives_the_post_run_collection() {
        let mut engine = engine();
        assert_eq!(
            engine.sandbox_eval("lit.rb", "[1, 2, 3]").unwrap(),
            HostValue::Array(vec![
                HostValue::Int(1),
                HostValue::Int(2),
                HostValue::Int(3)
            ])
        );
        assert_eq!(
            engine.sandbox_eval("str.rb", "\"hello\"").unwrap(),
            HostValue::Str("hello".to_string())
        );
        assert_eq!(
            engine.sandbox_eval("hash.rb", "{answer: 42}").unwrap(),
            HostValue::Hash(vec![(HostValue::Sym("answer".into()), HostValue::Int(42))])
        );
    }

    #[test]
    fn test_sub_millisecond_time_quota_rounds_up() {
        let mut engine = Engine::new(4 * 1024 * 1024, 100_000, 0.0005).unwrap();
        assert_eq!(
            engine.sandbox_eval("quick.rb", "1").unwrap(),
            HostValue::Int(1)
        );
    }

    #[test]
    fn test_debug_reports_engine_counters() {
        let engine = engine();
        let rendered = format!("{engine:?}");
        assert!(rendered.contains("Engine"));
        assert!(rendered.contains("instructions"));
        assert!(rendered.contains("latch"));
        assert!(format!("{:?}", Engine::allocate()).contains("initialized"));
    }

    #[test]
    fn test_uninitialized_slot_names_operation() {
        let mut slot = Engine::allocate();
        let err = slot.sandbox_eval("a.rb", "1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "uninitialized value when calling 'sandbox_eval'"
        );
        let err = slot.stat().unwrap_err();
        assert_eq!(err.to_string(), "uninitialized value when calling 'stat'");
        let err = slot.inject("@a", &HostValue::Int(1)).unwrap_err();
        assert_eq!(err.to_string(), "uninitialized value when calling 'inject'");
    }

    #[test]
    fn test_syntax_error_keeps_engine_usable() {
        let mut engine = engine();
        let before = engine.stat().unwrap().instructions;
        let err = engine.sandbox_eval("bad.rb", "(").unwrap_err();
        assert_eq!(err.to_string(), "bad.rb:1:1: syntax error, unexpected $end");
        assert_eq!(engine.stat().unwrap().instructions, before);
        assert_eq!(
            engine.sandbox_eval("ok.rb", "2 + 2").unwrap(),
            HostValue::Int(4)
        );
    }

    #[test]
    fn test_quota_latch_blocks_everything_but_stat() {
        let mut engine = Engine::new(4 * 1024 * 1024, 1000, 10.0).unwrap();
        let err = engine.sandbox_eval("spin.rb", "loop do\nend").unwrap_err();
        assert_eq!(err.to_string(), "exceeded quota of 1000 instructions.");

        let err = engine.sandbox_eval("next.rb", "1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "quota error already reached, operation aborted"
        );
        let err = engine.extract("@a").unwrap_err();
        assert_eq!(
            err.to_string(),
            "quota error already reached, operation aborted"
        );
        assert_eq!(engine.stat().unwrap().instructions, 1000);
    }

    #[test]
    fn test_inject_then_eval_then_extract() {
        let mut engine = engine();
        engine.inject("@input", &HostValue::Int(20)).unwrap();
        engine.sandbox_eval("x.rb", "@output = @input + 22").unwrap();
        assert_eq!(engine.extract("@output").unwrap(), HostValue::Int(42));
    }

    #[test]
    fn test_extract_of_unset_ivar_is_nil() {
        let mut engine = engine();
        assert_eq!(engine.extract("@missing").unwrap(), HostValue::Nil);
    }

    #[test]
    fn test_bad_ivar_name_rejected() {
        let mut engine = engine();
        let err = engine.inject("input", &HostValue::Int(1)).unwrap_err();
        assert_eq!(err.to_string(), "'input' is not an instance variable name");
    }

    #[test]
    fn test_memory_rises_and_falls_across_runs() {
        let mut engine = engine();
        let baseline = engine.stat().unwrap().memory;
        assert!(baseline > 0);

        engine
            .sandbox_eval("grow.rb", "@keep = \"x\" * 100000")
            .unwrap();
        let grown = engine.stat().unwrap().memory;
        assert!(grown >= baseline + 100000);

        engine.sandbox_eval("drop.rb", "@keep = nil").unwrap();
        let dropped = engine.stat().unwrap().memory;
        assert!(dropped < grown);
    }

    #[test]
    fn test_fresh_engine_stat_invariants() {
        let engine = engine();
        let stat = engine.stat().unwrap();
        assert_eq!(stat.instructions, 0);
        assert_eq!(stat.cpu_time, 0);
        assert!(stat.memory > 0);
        assert_eq!(stat.ctx_switches_v, None);
        assert_eq!(stat.ctx_switches_iv, None);
    }

    #[test]
    fn test_exit_keeps_prior_effects() {
        let mut engine = engine();
        engine
            .sandbox_eval("exit.rb", "@a = 1\nexit\n@b = 2")
            .unwrap();
        assert_eq!(engine.extract("@a").unwrap(), HostValue::Int(1));
        assert_eq!(engine.extract("@b").unwrap(), HostValue::Nil);
        // The engine is not latched by a clean exit.
        assert_eq!(
            engine.sandbox_eval("more.rb", "3").unwrap(),
            HostValue::Int(3)
        );
    }

    #[test]
    fn test_multi_file_program_shares_scope() {
        let mut engine = engine();
        let program = Program::compile(&[
            ("a.rb", "def double(x)\n  x * 2\nend\nseed = 21"),
            ("b.rb", "@answer = double(seed)"),
        ])
        .unwrap();
        engine.load_instruction_sequence(&program).unwrap();
        assert_eq!(engine.extract("@answer").unwrap(), HostValue::Int(42));
    }

    #[test]
    fn test_program_reusable_across_engines() {
        let program = Program::compile(&[("a.rb", "@n = 7 * 6")]).unwrap();
        for _ in 0..3 {
            let mut engine = engine();
            engine.load_instruction_sequence(&program).unwrap();
            assert_eq!(engine.extract("@n").unwrap(), HostValue::Int(42));
        }
    }

    #[test]
    fn test_runtime_error_carries_type_and_backtrace() {
        let mut engine = engine();
        let source = "def foo\n  raise \"error!\"\nend\n\ndef bar\n  foo\nend\n\nbar";
        let err = engine.sandbox_eval("backtrace.rb", source).unwrap_err();
        match err {
            SandboxError::Runtime {
                message,
                exception_type,
                guest_backtrace,
            } => {
                assert_eq!(message, "error!");
                assert_eq!(exception_type, "RuntimeError");
                assert_eq!(
                    guest_backtrace,
                    vec![
                        "backtrace.rb:2:in Object.foo",
                        "backtrace.rb:6:in Object.bar",
                        "backtrace.rb:9",
                    ]
                );
            }
            other => panic!("expected runtime error, got {other}"),
        }
    }

    #[test]
    fn test_runtime_error_does_not_latch() {
        let mut engine = engine();
        engine.sandbox_eval("raise.rb", "raise \"boom\"").unwrap_err();
        assert_eq!(
            engine.sandbox_eval("after.rb", "1").unwrap(),
            HostValue::Int(1)
        );
    }

    #[test]
    fn test_engine_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Engine>();
    }
}
