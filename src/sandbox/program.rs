//! Ahead-of-time compiled guest programs.
//!
//! A [`Program`] is compiled once, off any engine, and is immutable
//! afterwards: it can be cached by the host and loaded into any number
//! of engines, concurrently, for as long as the process lives. Identity
//! for cache keys comes from the deterministic serialized form, so two
//! compilations of the same sources always agree on `size` and `hash`.

use std::sync::{Arc, OnceLock};

use crate::error::{Result, SandboxError};
use crate::guest::bytecode::Chunk;
use crate::guest::{compiler, parser};

/// An immutable, engine-independent compiled program.
#[derive(Debug)]
pub struct Program {
    chunks: Vec<Arc<Chunk>>,
    bytes: Vec<u8>,
    hash: OnceLock<u64>,
}

impl Program {
    /// Compile a list of `(path, source)` files into one program.
    ///
    /// Files execute in order and share the top-level scope, so earlier
    /// files can define methods and bindings for later ones. Compilation
    /// stops at the first failing file, which is named in the error.
    pub fn compile<N, S>(files: &[(N, S)]) -> Result<Self>
    where
        N: AsRef<str>,
        S: AsRef<str>,
    {
        if files.is_empty() {
            return Err(SandboxError::Argument(
                "can't create empty instruction sequence".to_string(),
            ));
        }

        let mut chunks = Vec::with_capacity(files.len());
        let mut bytes = Vec::new();
        for (path, source) in files {
            let path = path.as_ref();
            let stmts = parser::parse(source.as_ref()).map_err(|diag| SandboxError::Syntax {
                path: path.to_string(),
                line: diag.line,
                column: diag.col,
                message: diag.message,
            })?;
            let chunk = compiler::compile(path, &stmts).map_err(|diag| SandboxError::Syntax {
                path: path.to_string(),
                line: diag.line,
                column: diag.col,
                message: diag.message,
            })?;
            chunk.encode_into(&mut bytes);
            chunks.push(Arc::new(chunk));
        }

        Ok(Self {
            chunks,
            bytes,
            hash: OnceLock::new(),
        })
    }

    /// The compiled chunks, one per source file, in execution order.
    pub fn chunks(&self) -> &[Arc<Chunk>] {
        &self.chunks
    }

    /// Byte length of the serialized program, debug line tables included.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Content hash of the serialized program, computed on first use and
    /// memoized.
    pub fn hash(&self) -> u64 {
        *self.hash.get_or_init(|| {
            self.bytes
                .iter()
                .fold(0u64, |h, &b| h.wrapping_mul(65599).wrapping_add(b as u64))
        })
    }
}
