//! Sandbox module containing all engine components.

pub mod crash;
pub mod engine;
pub mod marshal;
pub mod pool;
pub mod program;
pub mod quota;
pub mod stack;
