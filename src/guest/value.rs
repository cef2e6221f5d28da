//! Guest values, the charged heap, and interpreter state.
//!
//! Every heap cell carries the byte size that was charged to the host's
//! memory pool when it was created. Mutations re-settle the charge by
//! delta, and the mark-sweep pass releases the recorded size exactly, so
//! pool accounting can never drift from heap contents.

use std::collections::HashMap;
use std::sync::Arc;

use super::bytecode::Chunk;
use super::AllocHook;
use crate::error::Result;
use crate::sandbox::crash;

/// Index of an interned symbol.
pub type SymId = u32;
/// Index into the class table.
pub type ClassId = u32;
/// Index of a live heap cell.
pub type HeapRef = u32;

/// Fixed overhead charged per heap cell, on top of its payload.
const CELL_OVERHEAD: usize = 40;
/// Charged size of one inline value slot inside arrays and hashes.
const VALUE_SIZE: usize = 16;
/// Charged size of an interned symbol entry.
const SYMBOL_OVERHEAD: usize = 24;

/// Bytes charged when an engine is opened, standing in for the guest
/// runtime's boot image (core classes, symbol table, dispatch caches).
/// Must stay below half of the smallest pool capacity.
pub const BOOT_IMAGE_SIZE: usize = 64 * 1024;

/// A guest value. Strings, arrays, hashes, and objects live on the heap
/// behind a [`HeapRef`]; everything else is immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Sym(SymId),
    Class(ClassId),
    Ref(HeapRef),
}

impl Value {
    /// Ruby truthiness: everything but `nil` and `false`.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }
}

/// Payload of one heap cell.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapCell {
    Str(String),
    Array(Vec<Value>),
    /// Insertion-ordered association list; lookup is linear, which is
    /// fine at marshaling sizes and keeps iteration order deterministic.
    Hash(Vec<(Value, Value)>),
    /// A plain object instance. Instances carry no per-object storage:
    /// `@name` writes inside their methods land in the engine-wide
    /// top-level ivar namespace, same as at the top level.
    Object { class: ClassId },
}

fn cell_cost(cell: &HeapCell) -> usize {
    let payload = match cell {
        HeapCell::Str(s) => s.len(),
        HeapCell::Array(items) => items.len() * VALUE_SIZE,
        HeapCell::Hash(entries) => entries.len() * 2 * VALUE_SIZE,
        HeapCell::Object { .. } => VALUE_SIZE,
    };
    CELL_OVERHEAD + payload
}

struct Slot {
    cell: Option<HeapCell>,
    /// Bytes charged to the pool for this cell.
    charged: usize,
    mark: bool,
}

/// Arena of guest heap cells with pool-charged accounting.
#[derive(Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<HeapRef>,
}

impl Heap {
    /// Allocate a cell, charging the pool first. A rejected charge leaves
    /// the heap untouched.
    pub fn alloc(&mut self, cell: HeapCell, hook: &mut dyn AllocHook) -> Result<HeapRef> {
        let cost = cell_cost(&cell);
        hook.alloc(cost)?;
        let slot = Slot {
            cell: Some(cell),
            charged: cost,
            mark: false,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = slot;
                Ok(idx)
            }
            None => {
                self.slots.push(slot);
                Ok((self.slots.len() - 1) as HeapRef)
            }
        }
    }

    /// Dereference a cell. A live reference always points at an occupied
    /// slot, because the collector only frees unreachable cells; seeing
    /// a freed slot means the root set or the marker is broken, and that
    /// is a fatal engine fault.
    pub fn get(&self, r: HeapRef) -> Result<&HeapCell> {
        self.slots[r as usize]
            .cell
            .as_ref()
            .ok_or_else(|| crash::internal_error(format!("dangling heap reference {r}")))
    }

    /// Mutate a cell in place, settling the pool charge by delta. If the
    /// grown cell cannot be paid for, `revert` undoes the mutation and
    /// the error propagates.
    pub fn mutate(
        &mut self,
        r: HeapRef,
        hook: &mut dyn AllocHook,
        apply: impl FnOnce(&mut HeapCell),
        revert: impl FnOnce(&mut HeapCell),
    ) -> Result<()> {
        let slot = &mut self.slots[r as usize];
        let cell = match slot.cell.as_mut() {
            Some(cell) => cell,
            None => return Err(crash::internal_error(format!("dangling heap reference {r}"))),
        };
        apply(cell);
        let new_cost = cell_cost(cell);
        if new_cost > slot.charged {
            if let Err(err) = hook.alloc(new_cost - slot.charged) {
                revert(cell);
                return Err(err);
            }
            slot.charged = new_cost;
        } else if new_cost < slot.charged {
            hook.dealloc(slot.charged - new_cost);
            slot.charged = new_cost;
        }
        Ok(())
    }

    fn mark_value(&mut self, value: Value) {
        let mut pending = vec![value];
        while let Some(value) = pending.pop() {
            let r = match value {
                Value::Ref(r) => r,
                _ => continue,
            };
            let slot = &mut self.slots[r as usize];
            if slot.mark {
                continue;
            }
            slot.mark = true;
            match slot.cell.clone() {
                Some(HeapCell::Array(items)) => pending.extend(items),
                Some(HeapCell::Hash(entries)) => {
                    for (k, v) in entries {
                        pending.push(k);
                        pending.push(v);
                    }
                }
                _ => {}
            }
        }
    }

    /// Mark from `roots`, then free every unmarked cell and release its
    /// charge back to the pool.
    pub fn sweep(&mut self, roots: impl IntoIterator<Item = Value>, hook: &mut dyn AllocHook) {
        for root in roots {
            self.mark_value(root);
        }
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.cell.is_some() && !slot.mark {
                hook.dealloc(slot.charged);
                slot.cell = None;
                slot.charged = 0;
                self.free.push(idx as HeapRef);
            }
            slot.mark = false;
        }
    }
}

/// One entry of the class table.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    /// `None` for anonymous classes created with `Class.new`.
    pub name: Option<String>,
    pub superclass: Option<ClassId>,
    /// Stable pseudo-address used to render anonymous classes as
    /// `#<Class:0xHEX>` without consulting guest code.
    pub token: usize,
}

/// A method bound into the class table at definition time.
pub struct RuntimeMethod {
    pub name: String,
    pub params: u16,
    pub chunk: Arc<Chunk>,
    pub owner: ClassId,
}

/// Well-known class ids, populated by [`Interp::bootstrap`] in order.
pub mod core_class {
    use super::ClassId;

    pub const OBJECT: ClassId = 0;
    pub const EXCEPTION: ClassId = 1;
    pub const STANDARD_ERROR: ClassId = 2;
    pub const RUNTIME_ERROR: ClassId = 3;
    pub const ARGUMENT_ERROR: ClassId = 4;
    pub const TYPE_ERROR: ClassId = 5;
    pub const NO_METHOD_ERROR: ClassId = 6;
    pub const ZERO_DIVISION_ERROR: ClassId = 7;
    /// The `Class` class itself; `Class.new` mints anonymous classes.
    pub const CLASS: ClassId = 8;
    pub const NAME_ERROR: ClassId = 9;
}

/// Interpreter state that persists across runs of one engine: the heap,
/// interned symbols, classes and their methods, and the three root
/// namespaces (top-level bindings, ivars, constants).
#[derive(Default)]
pub struct Interp {
    pub heap: Heap,
    symbols: Vec<String>,
    symbol_ids: HashMap<String, SymId>,
    pub classes: Vec<ClassInfo>,
    methods: HashMap<(ClassId, String), Arc<RuntimeMethod>>,
    /// Top-level local bindings, shared by all files of a program.
    pub top_bindings: HashMap<String, Value>,
    /// `@name` instance variables of the top-level object.
    pub ivars: HashMap<String, Value>,
    /// Constant namespace: class names.
    pub constants: HashMap<String, Value>,
}

impl Interp {
    /// Build the core runtime: class hierarchy, constants, and the boot
    /// image charge.
    pub fn bootstrap(hook: &mut dyn AllocHook) -> Result<Self> {
        hook.alloc(BOOT_IMAGE_SIZE)?;
        let mut interp = Self::default();
        let core = [
            ("Object", None),
            ("Exception", Some(core_class::OBJECT)),
            ("StandardError", Some(core_class::EXCEPTION)),
            ("RuntimeError", Some(core_class::STANDARD_ERROR)),
            ("ArgumentError", Some(core_class::STANDARD_ERROR)),
            ("TypeError", Some(core_class::STANDARD_ERROR)),
            ("NoMethodError", Some(core_class::STANDARD_ERROR)),
            ("ZeroDivisionError", Some(core_class::STANDARD_ERROR)),
            ("Class", Some(core_class::OBJECT)),
            ("NameError", Some(core_class::STANDARD_ERROR)),
        ];
        for (name, superclass) in core {
            let id = interp.define_class(Some(name.to_string()), superclass);
            interp.constants.insert(name.to_string(), Value::Class(id));
        }
        Ok(interp)
    }

    pub fn define_class(&mut self, name: Option<String>, superclass: Option<ClassId>) -> ClassId {
        let id = self.classes.len() as ClassId;
        // Spaced like real object addresses so anonymous renderings look
        // plausible and stay stable for the class's lifetime.
        let token = 0x5590_0000_0000 + (id as usize) * 0xd8;
        self.classes.push(ClassInfo {
            name,
            superclass,
            token,
        });
        id
    }

    pub fn class_info(&self, id: ClassId) -> &ClassInfo {
        &self.classes[id as usize]
    }

    /// Display name of a class: its binding name, or the stable
    /// `#<Class:0xHEX>` rendering for anonymous classes. Never re-enters
    /// guest code.
    pub fn class_display_name(&self, id: ClassId) -> String {
        let info = self.class_info(id);
        match &info.name {
            Some(name) => name.clone(),
            None => format!("#<Class:0x{:012x}>", info.token),
        }
    }

    /// Whether `class` is `ancestor` or inherits from it.
    pub fn is_descendant(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut cursor = Some(class);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.class_info(id).superclass;
        }
        false
    }

    pub fn bind_method(&mut self, class: ClassId, method: Arc<RuntimeMethod>) {
        self.methods.insert((class, method.name.clone()), method);
    }

    /// Resolve `name` on `class`, walking the superclass chain.
    pub fn resolve_method(&self, class: ClassId, name: &str) -> Option<Arc<RuntimeMethod>> {
        let mut cursor = Some(class);
        while let Some(id) = cursor {
            if let Some(method) = self.methods.get(&(id, name.to_string())) {
                return Some(Arc::clone(method));
            }
            cursor = self.class_info(id).superclass;
        }
        None
    }

    /// Intern a symbol, charging the pool for first occurrences.
    pub fn intern(&mut self, name: &str, hook: &mut dyn AllocHook) -> Result<SymId> {
        if let Some(&id) = self.symbol_ids.get(name) {
            return Ok(id);
        }
        hook.alloc(SYMBOL_OVERHEAD + name.len())?;
        let id = self.symbols.len() as SymId;
        self.symbols.push(name.to_string());
        self.symbol_ids.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn symbol_name(&self, id: SymId) -> &str {
        &self.symbols[id as usize]
    }

    /// Structural equality with heap dereferencing. Objects compare by
    /// identity; collections compare element-wise.
    pub fn values_equal(&self, a: Value, b: Value) -> Result<bool> {
        match (a, b) {
            (Value::Ref(ra), Value::Ref(rb)) => {
                if ra == rb {
                    return Ok(true);
                }
                match (self.heap.get(ra)?, self.heap.get(rb)?) {
                    (HeapCell::Str(sa), HeapCell::Str(sb)) => Ok(sa == sb),
                    (HeapCell::Array(va), HeapCell::Array(vb)) => {
                        if va.len() != vb.len() {
                            return Ok(false);
                        }
                        for (&x, &y) in va.iter().zip(vb.iter()) {
                            if !self.values_equal(x, y)? {
                                return Ok(false);
                            }
                        }
                        Ok(true)
                    }
                    (HeapCell::Hash(ha), HeapCell::Hash(hb)) => {
                        if ha.len() != hb.len() {
                            return Ok(false);
                        }
                        for (&(ka, va), &(kb, vb)) in ha.iter().zip(hb.iter()) {
                            if !self.values_equal(ka, kb)? || !self.values_equal(va, vb)? {
                                return Ok(false);
                            }
                        }
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
            _ => Ok(a == b),
        }
    }

    /// Run a collection over everything reachable from the persistent
    /// roots, releasing the charge of everything else.
    pub fn collect_garbage(&mut self, hook: &mut dyn AllocHook) {
        self.collect_garbage_keeping(hook, &[]);
    }

    /// Like [`Interp::collect_garbage`], with `keep` treated as extra
    /// roots. The run pipeline passes the run's result value here so it
    /// survives until it has been marshaled out.
    pub fn collect_garbage_keeping(&mut self, hook: &mut dyn AllocHook, keep: &[Value]) {
        let roots: Vec<Value> = self
            .top_bindings
            .values()
            .chain(self.ivars.values())
            .chain(self.constants.values())
            .chain(keep.iter())
            .copied()
            .collect();
        self.heap.sweep(roots, hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
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

    fn hook() -> PoolHook {
        PoolHook(MemoryPool::new(1024 * 1024).unwrap())
    }

    #[test]
    fn test_alloc_charges_and_sweep_releases() {
        let mut hook = hook();
        let mut heap = Heap::default();
        let r = heap
            .alloc(HeapCell::Str("hello".to_string()), &mut hook)
            .unwrap();
        assert_eq!(hook.0.in_use(), CELL_OVERHEAD + 5);
        assert_eq!(heap.get(r).unwrap(), &HeapCell::Str("hello".to_string()));

        heap.sweep([], &mut hook);
        assert_eq!(hook.0.in_use(), 0);
    }

    #[test]
    fn test_get_on_freed_slot_is_internal_fault() {
        let mut hook = hook();
        let mut heap = Heap::default();
        let r = heap
            .alloc(HeapCell::Str("gone".to_string()), &mut hook)
            .unwrap();
        heap.sweep([], &mut hook);
        let err = heap.get(r).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_sweep_keeps_reachable_cells() {
        let mut hook = hook();
        let mut heap = Heap::default();
        let inner = heap
            .alloc(HeapCell::Str("kept".to_string()), &mut hook)
            .unwrap();
        let outer = heap
            .alloc(HeapCell::Array(vec![Value::Ref(inner)]), &mut hook)
            .unwrap();
        let _garbage = heap
            .alloc(HeapCell::Str("dropped".to_string()), &mut hook)
            .unwrap();

        heap.sweep([Value::Ref(outer)], &mut hook);
        assert_eq!(heap.get(inner).unwrap(), &HeapCell::Str("kept".to_string()));
        assert_eq!(
            hook.0.in_use(),
            (CELL_OVERHEAD + 4) + (CELL_OVERHEAD + VALUE_SIZE)
        );
    }

    #[test]
    fn test_failed_alloc_leaves_heap_untouched() {
        let mut hook = PoolHook(MemoryPool::new(256 * 1024).unwrap());
        let mut heap = Heap::default();
        let err = heap
            .alloc(HeapCell::Str("x".repeat(512 * 1024)), &mut hook)
            .unwrap_err();
        assert!(matches!(err, SandboxError::MemoryQuota { .. }));
        assert_eq!(hook.0.in_use(), 0);
    }

    #[test]
    fn test_mutate_settles_charge_delta() {
        let mut hook = hook();
        let mut heap = Heap::default();
        let r = heap
            .alloc(HeapCell::Array(Vec::new()), &mut hook)
            .unwrap();
        let before = hook.0.in_use();
        heap.mutate(
            r,
            &mut hook,
            |cell| {
                if let HeapCell::Array(items) = cell {
                    items.push(Value::Int(1));
                }
            },
            |cell| {
                if let HeapCell::Array(items) = cell {
                    items.pop();
                }
            },
        )
        .unwrap();
        assert_eq!(hook.0.in_use(), before + VALUE_SIZE);
    }

    #[test]
    fn test_mutate_reverts_on_failed_charge() {
        let mut hook = PoolHook(MemoryPool::new(256 * 1024).unwrap());
        let mut heap = Heap::default();
        let r = heap.alloc(HeapCell::Str(String::new()), &mut hook).unwrap();
        let err = heap.mutate(
            r,
            &mut hook,
            |cell| {
                if let HeapCell::Str(s) = cell {
                    s.push_str(&"y".repeat(512 * 1024));
                }
            },
            |cell| {
                if let HeapCell::Str(s) = cell {
                    s.truncate(0);
                }
            },
        );
        assert!(err.is_err());
        assert_eq!(heap.get(r).unwrap(), &HeapCell::Str(String::new()));
    }

    #[test]
    fn test_bootstrap_core_hierarchy() {
        let mut hook = hook();
        let interp = Interp::bootstrap(&mut hook).unwrap();
        assert!(hook.0.in_use() >= BOOT_IMAGE_SIZE);
        assert!(interp.is_descendant(core_class::RUNTIME_ERROR, core_class::STANDARD_ERROR));
        assert!(interp.is_descendant(core_class::RUNTIME_ERROR, core_class::EXCEPTION));
        assert!(!interp.is_descendant(core_class::STANDARD_ERROR, core_class::RUNTIME_ERROR));
        assert_eq!(
            interp.constants.get("StandardError"),
            Some(&Value::Class(core_class::STANDARD_ERROR))
        );
    }

    #[test]
    fn test_anonymous_class_display_name() {
        let mut hook = hook();
        let mut interp = Interp::bootstrap(&mut hook).unwrap();
        let id = interp.define_class(None, Some(core_class::STANDARD_ERROR));
        let name = interp.class_display_name(id);
        assert!(name.starts_with("#<Class:0x"));
        assert!(name.ends_with('>'));
        // Stable across calls.
        assert_eq!(name, interp.class_display_name(id));
    }

    #[test]
    fn test_symbol_interning_charges_once() {
        let mut hook = hook();
        let mut interp = Interp::bootstrap(&mut hook).unwrap();
        let before = hook.0.in_use();
        let a = interp.intern("foo", &mut hook).unwrap();
        let after_first = hook.0.in_use();
        let b = interp.intern("foo", &mut hook).unwrap();
        assert_eq!(a, b);
        assert_eq!(hook.0.in_use(), after_first);
        assert_eq!(after_first, before + SYMBOL_OVERHEAD + 3);
        assert_eq!(interp.symbol_name(a), "foo");
    }

    #[test]
    fn test_structural_equality_for_collections() {
        let mut hook = hook();
        let mut interp = Interp::bootstrap(&mut hook).unwrap();
        let s1 = interp
            .heap
            .alloc(HeapCell::Str("x".to_string()), &mut hook)
            .unwrap();
        let s2 = interp
            .heap
            .alloc(HeapCell::Str("x".to_string()), &mut hook)
            .unwrap();
        let a1 = interp
            .heap
            .alloc(HeapCell::Array(vec![Value::Ref(s1), Value::Int(1)]), &mut hook)
            .unwrap();
        let a2 = interp
            .heap
            .alloc(HeapCell::Array(vec![Value::Ref(s2), Value::Int(1)]), &mut hook)
            .unwrap();
        assert!(interp.values_equal(Value::Ref(a1), Value::Ref(a2)).unwrap());
        assert!(!interp.values_equal(Value::Ref(a1), Value::Ref(s1)).unwrap());
    }

    #[test]
    fn test_collect_keeps_extra_roots_alive() {
        let mut hook = hook();
        let mut interp = Interp::bootstrap(&mut hook).unwrap();
        let r = interp
            .heap
            .alloc(HeapCell::Array(vec![Value::Int(1)]), &mut hook)
            .unwrap();

        interp.collect_garbage_keeping(&mut hook, &[Value::Ref(r)]);
        assert_eq!(
            interp.heap.get(r).unwrap(),
            &HeapCell::Array(vec![Value::Int(1)])
        );

        interp.collect_garbage(&mut hook);
        assert!(interp.heap.get(r).is_err());
    }
}
