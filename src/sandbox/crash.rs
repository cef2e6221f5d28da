//! Crash reporting for internal sandbox faults.
//!
//! Faults that indicate a defect in the sandbox itself (allocator
//! accounting corruption, bytecode serialization failure) are surfaced as
//! [`SandboxError::Internal`] with a symbolized native stack trace
//! appended to the message, one frame per line:
//!
//! ```text
//! 0x7f72a4ef5364 : (mspace_malloc+0x7a4) [0x7f72a4ef5364]
//! (nil) : (nil+0x0) [(nil)]
//! ```
//!
//! These errors are not meant to be caught-and-continued: they are
//! evidence of a sandbox defect, not a guest defect.

use backtrace::Backtrace;

use crate::error::SandboxError;

/// Frames rendered into an internal error message.
const FRAME_QUANTITY: usize = 30;

fn render_address(ip: usize) -> String {
    if ip == 0 {
        "(nil)".to_string()
    } else {
        format!("0x{ip:x}")
    }
}

fn render_frame(ip: usize, symbol: Option<&str>, offset: usize) -> String {
    let addr = render_address(ip);
    let name = symbol.unwrap_or("nil");
    format!("{addr} : ({name}+0x{offset:x}) [{addr}]")
}

/// Capture the current native call stack, frame by frame, and render it as
/// an appendable multi-line diagnostic. Never fails: unresolvable
/// addresses and symbols render as a literal nil-marker.
pub fn native_trace() -> String {
    let bt = Backtrace::new();
    let mut out = String::from("\n");

    for frame in bt.frames().iter().take(FRAME_QUANTITY) {
        let ip = frame.ip() as usize;
        let symbol = frame.symbols().first();
        let name = symbol
            .and_then(|s| s.name())
            .map(|n| n.to_string());
        let offset = symbol
            .and_then(|s| s.addr())
            .map(|base| ip.saturating_sub(base as usize))
            .unwrap_or(0);
        out.push_str(&render_frame(ip, name.as_deref(), offset));
        out.push('\n');
    }

    out
}

/// Build an `InternalError` whose message body carries the native trace.
pub fn internal_error(message: impl Into<String>) -> SandboxError {
    SandboxError::Internal(format!("{}  {}", message.into(), native_trace()))
}

/// Build an `InternalError` from a source-chained failure.
pub fn internal_error_from(err: anyhow::Error) -> SandboxError {
    internal_error(format!("{err:#}"))
}
