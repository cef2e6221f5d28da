//! Prelude module for convenient imports.

pub use crate::error::{Result, SandboxError};
pub use crate::sandbox::{
    engine::Engine,
    marshal::HostValue,
    program::Program,
    quota::EngineStat,
};
