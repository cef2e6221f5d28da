//! # Script Sandbox
//!
//! A host-embeddable sandbox engine for running untrusted guest scripts
//! under hard resource quotas.
//!
//! Each [`Engine`] is a fully isolated interpreter instance with its own
//! bounded memory pool, instruction and wall-clock quotas, and stack
//! margin:
//!
//! - **Memory limits**: every guest allocation is charged against a
//!   fixed-capacity pool; exhaustion is an error, never host pressure
//! - **Instruction quota**: every dispatched opcode is counted; the
//!   ceiling is exact
//! - **Time quota**: a cooperative deadline sampled during dispatch, so
//!   no background thread is involved
//! - **Stack margin**: guest recursion trips a depth guard long before
//!   the native stack is at risk
//! - **No ambient capabilities**: the guest has no clock, filesystem,
//!   network, or process access by construction
//!
//! ## Example
//!
//! ```rust,ignore
//! use script_sandbox_rs::prelude::*;
//!
//! fn main() -> Result<()> {
//!     // 4 MiB pool, 100k instructions, 100 ms.
//!     let mut engine = Engine::new(4 * 1024 * 1024, 100_000, 0.1)?;
//!
//!     engine.inject("@order_count", &HostValue::Int(3))?;
//!     engine.sandbox_eval("discount.rb", "@discount = @order_count * 5")?;
//!
//!     assert_eq!(engine.extract("@discount")?, HostValue::Int(15));
//!     Ok(())
//! }
//! ```
//!
//! ## Failure model
//!
//! Syntax errors and guest exceptions leave the engine usable. Quota
//! errors (memory, instructions, time, stack) trip a one-way latch:
//! every later operation fails with [`SandboxError::QuotaAlreadyReached`]
//! and the engine should be discarded. Internal faults latch fatally and
//! carry a native stack trace for the host's crash log.
//!
//! Programs can be compiled once with [`Program::compile`] and loaded
//! into any number of engines; compiled programs are immutable and cheap
//! to share.

pub mod error;
pub mod guest;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use error::{Result, SandboxError};
pub use sandbox::engine::Engine;
pub use sandbox::marshal::HostValue;
pub use sandbox::program::Program;
pub use sandbox::quota::{EngineStat, Latch};
