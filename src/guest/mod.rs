//! The embedded guest interpreter.
//!
//! This module is a small Ruby-flavored bytecode interpreter with no
//! ambient capabilities: no I/O, no OS access, no host imports. The
//! sandbox layer above drives it entirely through the [`AllocHook`] and
//! [`ExecHooks`] seams, which is where memory charging, instruction
//! counting, time sampling, and stack-depth enforcement happen.

pub mod bytecode;
pub mod compiler;
pub mod lexer;
pub mod parser;
pub mod value;
pub mod vm;

use crate::error::Result;

/// A compile-stage diagnostic with a 1-based source position. Mapped to
/// a syntax error naming the offending file by the program loader.
#[derive(Debug, Clone)]
pub struct CompileDiag {
    pub line: u32,
    pub col: u32,
    /// Parser detail, e.g. "syntax error, unexpected $end".
    pub message: String,
}

/// Allocation seam between the interpreter and the host's memory pool.
///
/// The interpreter calls `alloc` before materializing any heap cell and
/// only proceeds on success, so a rejected charge leaves the guest heap
/// untouched.
pub trait AllocHook {
    /// Charge `bytes` against the pool.
    fn alloc(&mut self, bytes: usize) -> Result<()>;
    /// Release `bytes` previously charged.
    fn dealloc(&mut self, bytes: usize);
}

/// Execution seam consulted by the dispatch loop.
pub trait ExecHooks: AllocHook {
    /// Called once per dispatched opcode, before the opcode runs.
    fn on_dispatch(&mut self) -> Result<()>;
    /// Called before each guest-triggered native frame is entered.
    fn on_call_enter(&mut self) -> Result<()>;
    /// Called when that frame is left.
    fn on_call_leave(&mut self);
}
