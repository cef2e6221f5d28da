//! Value marshaling across the host/guest boundary.
//!
//! [`HostValue`] is a closed set: only data shapes both sides can
//! represent round-trip losslessly. Conversion is always a deep copy in
//! both directions; no reference ever crosses the boundary, so guest
//! code can never alias host memory. Recursion in both directions is
//! depth-limited to keep a hostile nested structure from consuming the
//! native stack.

use crate::error::{Result, SandboxError};
use crate::guest::value::{HeapCell, Interp, Value};
use crate::guest::AllocHook;

/// Deepest structure accepted in either direction.
pub const DEPTH_MAX: usize = 32;

/// A host-side value that can cross the sandbox boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Sym(String),
    Array(Vec<HostValue>),
    /// Insertion-ordered entries; order is preserved through a round trip.
    Hash(Vec<(HostValue, HostValue)>),
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        HostValue::Int(v)
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::Str(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::Str(v)
    }
}

fn too_deep() -> SandboxError {
    SandboxError::Type("structure nested too deeply".to_string())
}

fn unsupported() -> SandboxError {
    SandboxError::Type("can only extract strings, fixnums, symbols, arrays or hashes".to_string())
}

/// Copy a host value into the guest heap, charging every allocation.
pub fn inject(interp: &mut Interp, hook: &mut dyn AllocHook, value: &HostValue) -> Result<Value> {
    inject_at(interp, hook, value, 1)
}

fn inject_at(
    interp: &mut Interp,
    hook: &mut dyn AllocHook,
    value: &HostValue,
    depth: usize,
) -> Result<Value> {
    if depth > DEPTH_MAX {
        return Err(too_deep());
    }
    match value {
        HostValue::Nil => Ok(Value::Nil),
        HostValue::Bool(b) => Ok(Value::Bool(*b)),
        HostValue::Int(v) => Ok(Value::Int(*v)),
        HostValue::Str(s) => {
            let r = interp.heap.alloc(HeapCell::Str(s.clone()), hook)?;
            Ok(Value::Ref(r))
        }
        HostValue::Sym(s) => Ok(Value::Sym(interp.intern(s, hook)?)),
        HostValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(inject_at(interp, hook, item, depth + 1)?);
            }
            let r = interp.heap.alloc(HeapCell::Array(out), hook)?;
            Ok(Value::Ref(r))
        }
        HostValue::Hash(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                let key = inject_at(interp, hook, k, depth + 1)?;
                let value = inject_at(interp, hook, v, depth + 1)?;
                out.push((key, value));
            }
            let r = interp.heap.alloc(HeapCell::Hash(out), hook)?;
            Ok(Value::Ref(r))
        }
    }
}

/// Copy a guest value out to the host. Classes and plain objects are not
/// extractable; the guest keeps them.
pub fn extract(interp: &Interp, value: Value) -> Result<HostValue> {
    extract_at(interp, value, 1)
}

fn extract_at(interp: &Interp, value: Value, depth: usize) -> Result<HostValue> {
    if depth > DEPTH_MAX {
        return Err(too_deep());
    }
    match value {
        Value::Nil => Ok(HostValue::Nil),
        Value::Bool(b) => Ok(HostValue::Bool(b)),
        Value::Int(v) => Ok(HostValue::Int(v)),
        Value::Sym(id) => Ok(HostValue::Sym(interp.symbol_name(id).to_string())),
        Value::Class(_) => Err(unsupported()),
        Value::Ref(r) => match interp.heap.get(r)? {
            HeapCell::Str(s) => Ok(HostValue::Str(s.clone())),
            HeapCell::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for &item in items {
                    out.push(extract_at(interp, item, depth + 1)?);
                }
                Ok(HostValue::Array(out))
            }
            HeapCell::Hash(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for &(k, v) in entries {
                    out.push((
                        extract_at(interp, k, depth + 1)?,
                        extract_at(interp, v, depth + 1)?,
                    ));
                }
                Ok(HostValue::Hash(out))
            }
            HeapCell::Object { .. } => Err(unsupported()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::value::core_class;
    use crate::sandbox::pool::MemoryPool;

    struct PoolHook(MemoryPool);

    impl AllocHook for PoolHook {
        fn alloc(&mut self, bytes: usize) -> Result<()> {
            self.0.charge(bytes)
        }
        fn dealloc(&mut self, bytes: usize) {
            let _ = self.0.release(bytes);
        }
    }

    fn fresh() -> (Interp, PoolHook) {
        let mut hook = PoolHook(MemoryPool::new(4 * 1024 * 1024).unwrap());
        let interp = Interp::bootstrap(&mut hook).unwrap();
        (interp, hook)
    }

    fn nested_array(depth: usize) -> HostValue {
        let mut value = HostValue::Int(0);
        for _ in 0..depth {
            value = HostValue::Array(vec![value]);
        }
        value
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let (mut interp, mut hook) = fresh();
        let original = HostValue::Hash(vec![
            (HostValue::Sym("name".into()), HostValue::Str("🌈".into())),
            (
                HostValue::Sym("counts".into()),
                HostValue::Array(vec![
                    HostValue::Int(1),
                    HostValue::Int(-2),
                    HostValue::Nil,
                    HostValue::Bool(true),
                ]),
            ),
        ]);
        let guest = inject(&mut interp, &mut hook, &original).unwrap();
        let back = extract(&interp, guest).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_hash_order_preserved() {
        let (mut interp, mut hook) = fresh();
        let original = HostValue::Hash(vec![
            (HostValue::Str("z".into()), HostValue::Int(1)),
            (HostValue::Str("a".into()), HostValue::Int(2)),
            (HostValue::Str("m".into()), HostValue::Int(3)),
        ]);
        let guest = inject(&mut interp, &mut hook, &original).unwrap();
        assert_eq!(extract(&interp, guest).unwrap(), original);
    }

    #[test]
    fn test_depth_limit_on_inject() {
        let (mut interp, mut hook) = fresh();
        assert!(inject(&mut interp, &mut hook, &nested_array(DEPTH_MAX - 1)).is_ok());
        let err = inject(&mut interp, &mut hook, &nested_array(DEPTH_MAX + 1)).unwrap_err();
        assert_eq!(err.to_string(), "structure nested too deeply");
    }

    #[test]
    fn test_depth_limit_on_extract() {
        let (mut interp, mut hook) = fresh();
        let guest = inject(&mut interp, &mut hook, &nested_array(DEPTH_MAX - 1)).unwrap();
        // Wrap the guest value in a few more layers than injection allows.
        let mut wrapped = guest;
        for _ in 0..4 {
            let r = interp
                .heap
                .alloc(HeapCell::Array(vec![wrapped]), &mut hook)
                .unwrap();
            wrapped = Value::Ref(r);
        }
        let err = extract(&interp, wrapped).unwrap_err();
        assert_eq!(err.to_string(), "structure nested too deeply");
    }

    #[test]
    fn test_class_values_are_not_extractable() {
        let (interp, _hook) = fresh();
        let err = extract(&interp, Value::Class(core_class::STANDARD_ERROR)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "can only extract strings, fixnums, symbols, arrays or hashes"
        );
    }

    #[test]
    fn test_objects_are_not_extractable() {
        let (mut interp, mut hook) = fresh();
        let r = interp
            .heap
            .alloc(
                HeapCell::Object {
                    class: core_class::OBJECT,
                },
                &mut hook,
            )
            .unwrap();
        assert!(extract(&interp, Value::Ref(r)).is_err());
    }

    #[test]
    fn test_injection_charges_the_pool() {
        let (mut interp, mut hook) = fresh();
        let before = hook.0.in_use();
        inject(
            &mut interp,
            &mut hook,
            &HostValue::Str("x".repeat(1024)),
        )
        .unwrap();
        assert!(hook.0.in_use() >= before + 1024);
    }

    #[test]
    fn test_injection_into_exhausted_pool_fails() {
        let mut hook = PoolHook(MemoryPool::new(256 * 1024).unwrap());
        let mut interp = Interp::bootstrap(&mut hook).unwrap();
        let err = inject(
            &mut interp,
            &mut hook,
            &HostValue::Str("x".repeat(512 * 1024)),
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::MemoryQuota { .. }));
    }
}
