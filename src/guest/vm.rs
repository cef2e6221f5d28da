//! The bytecode virtual machine.
//!
//! Guest method dispatch recurses on the native stack, one `exec` frame
//! per guest frame, which is why the sandbox's stack guard is consulted
//! at every call boundary. Every opcode goes through the dispatch hook
//! before it runs, and every heap allocation goes through the
//! allocation hook, so the VM itself holds no policy: quotas live
//! entirely in the hooks.

use std::sync::Arc;

use super::bytecode::{Chunk, ClassDesc, Constant, MethodDesc, Op};
use super::value::{core_class, ClassId, HeapCell, Interp, RuntimeMethod, Value};
use super::ExecHooks;
use crate::error::SandboxError;
use crate::sandbox::crash;

/// A fully rendered guest exception: everything the host needs, captured
/// at the raise site without re-entering guest code.
#[derive(Debug, Clone)]
pub struct ExceptionRecord {
    pub message: String,
    /// Class name, or the stable `#<Class:0xHEX>` rendering for
    /// anonymous classes.
    pub type_name: String,
    /// Frames innermost first, `file:line:in Class.method` with the
    /// `in` part omitted for top-level code.
    pub backtrace: Vec<String>,
}

/// Non-local exit of a guest run.
#[derive(Debug)]
pub enum Unwind {
    /// A sandbox-level fault: quota, stack, memory, or internal.
    Fault(SandboxError),
    /// A guest exception reached the top of the program.
    Raise(ExceptionRecord),
    /// The guest requested a clean early stop (`exit`).
    Exit,
}

impl From<SandboxError> for Unwind {
    fn from(err: SandboxError) -> Self {
        Unwind::Fault(err)
    }
}

type VmResult<T> = Result<T, Unwind>;

struct FrameInfo {
    file: String,
    line: u32,
    /// `Class.method` for method frames, `None` for top-level code.
    desc: Option<String>,
}

/// One execution of guest code against an interpreter and a hook set.
pub struct Vm<'a, H: ExecHooks> {
    interp: &'a mut Interp,
    hooks: &'a mut H,
    frames: Vec<FrameInfo>,
}

impl<'a, H: ExecHooks> Vm<'a, H> {
    pub fn new(interp: &'a mut Interp, hooks: &'a mut H) -> Self {
        Self {
            interp,
            hooks,
            frames: Vec::new(),
        }
    }

    /// Run a top-level chunk to completion.
    pub fn run(&mut self, chunk: &Arc<Chunk>) -> VmResult<Value> {
        let mut locals = vec![Value::Nil; chunk.local_count as usize];
        self.exec(chunk, &mut locals, None)
    }

    fn exec(
        &mut self,
        chunk: &Arc<Chunk>,
        locals: &mut Vec<Value>,
        desc: Option<String>,
    ) -> VmResult<Value> {
        self.frames.push(FrameInfo {
            file: chunk.file.clone(),
            line: chunk.lines.first().copied().unwrap_or(1),
            desc,
        });
        let result = self.exec_frame(chunk, locals);
        self.frames.pop();
        result
    }

    fn exec_frame(&mut self, chunk: &Arc<Chunk>, locals: &mut Vec<Value>) -> VmResult<Value> {
        let mut stack: Vec<Value> = Vec::new();
        let mut pc = 0usize;

        while pc < chunk.code.len() {
            self.hooks.on_dispatch()?;
            if let Some(frame) = self.frames.last_mut() {
                frame.line = chunk.lines[pc];
            }
            let op = chunk.code[pc].clone();
            pc += 1;

            match op {
                Op::Const(idx) => {
                    let value = match &chunk.consts[idx as usize] {
                        Constant::Int(v) => Value::Int(*v),
                        Constant::Str(s) => self.alloc_str(s.clone())?,
                        Constant::Sym(s) => {
                            Value::Sym(self.interp.intern(s, &mut *self.hooks)?)
                        }
                        other => {
                            return Err(Unwind::Fault(crash::internal_error(format!(
                                "non-value constant pushed: {other:?}"
                            ))))
                        }
                    };
                    stack.push(value);
                }
                Op::Nil => stack.push(Value::Nil),
                Op::True => stack.push(Value::Bool(true)),
                Op::False => stack.push(Value::Bool(false)),
                Op::Pop => {
                    stack.pop();
                }

                Op::LoadLocal(slot) => {
                    stack.push(locals.get(slot as usize).copied().unwrap_or(Value::Nil));
                }
                Op::StoreLocal(slot) => {
                    let value = *stack.last().unwrap_or(&Value::Nil);
                    let slot = slot as usize;
                    if slot >= locals.len() {
                        locals.resize(slot + 1, Value::Nil);
                    }
                    locals[slot] = value;
                }
                Op::LoadName(idx) => {
                    let name = self.const_name(chunk, idx)?;
                    let value = self
                        .interp
                        .top_bindings
                        .get(&name)
                        .copied()
                        .unwrap_or(Value::Nil);
                    stack.push(value);
                }
                Op::StoreName(idx) => {
                    let name = self.const_name(chunk, idx)?;
                    let value = *stack.last().unwrap_or(&Value::Nil);
                    self.interp.top_bindings.insert(name, value);
                }
                Op::LoadIvar(idx) => {
                    let name = self.const_name(chunk, idx)?;
                    let value = self.interp.ivars.get(&name).copied().unwrap_or(Value::Nil);
                    stack.push(value);
                }
                Op::StoreIvar(idx) => {
                    let name = self.const_name(chunk, idx)?;
                    let value = *stack.last().unwrap_or(&Value::Nil);
                    self.interp.ivars.insert(name, value);
                }
                Op::LoadConst(idx) => {
                    let name = self.const_name(chunk, idx)?;
                    match self.interp.constants.get(&name) {
                        Some(&value) => stack.push(value),
                        None => {
                            return Err(self.raise(
                                core_class::NAME_ERROR,
                                format!("uninitialized constant {name}"),
                            ))
                        }
                    }
                }

                Op::NewArray(n) => {
                    let items = stack.split_off(stack.len().saturating_sub(n as usize));
                    let r = self
                        .interp
                        .heap
                        .alloc(HeapCell::Array(items), &mut *self.hooks)?;
                    stack.push(Value::Ref(r));
                }
                Op::NewHash(n) => {
                    let flat = stack.split_off(stack.len().saturating_sub(2 * n as usize));
                    let mut entries: Vec<(Value, Value)> = Vec::with_capacity(n as usize);
                    for pair in flat.chunks(2) {
                        let (key, value) = (pair[0], pair[1]);
                        let mut replaced = false;
                        for entry in entries.iter_mut() {
                            if self.interp.values_equal(entry.0, key)? {
                                entry.1 = value;
                                replaced = true;
                                break;
                            }
                        }
                        if !replaced {
                            entries.push((key, value));
                        }
                    }
                    let r = self
                        .interp
                        .heap
                        .alloc(HeapCell::Hash(entries), &mut *self.hooks)?;
                    stack.push(Value::Ref(r));
                }

                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Lt | Op::Le | Op::Gt | Op::Ge
                | Op::Eq | Op::Ne | Op::Shl => {
                    let rhs = stack.pop().unwrap_or(Value::Nil);
                    let lhs = stack.pop().unwrap_or(Value::Nil);
                    let value = self.binop(&op, lhs, rhs)?;
                    stack.push(value);
                }

                Op::Jump(target) => pc = target as usize,
                Op::JumpIfFalse(target) => {
                    if !stack.pop().unwrap_or(Value::Nil).truthy() {
                        pc = target as usize;
                    }
                }
                Op::JumpIfTrue(target) => {
                    if stack.pop().unwrap_or(Value::Nil).truthy() {
                        pc = target as usize;
                    }
                }

                Op::Call { name, argc } => {
                    let args = stack.split_off(stack.len().saturating_sub(argc as usize));
                    let name = self.const_name(chunk, name)?;
                    let value = self.call_function(&name, args)?;
                    stack.push(value);
                }
                Op::Invoke { name, argc } => {
                    let mut args = stack.split_off(stack.len().saturating_sub(argc as usize));
                    let recv = stack.pop().unwrap_or(Value::Nil);
                    let name = self.const_name(chunk, name)?;
                    let value = self.invoke(recv, &name, &mut args)?;
                    stack.push(value);
                }

                Op::DefineMethod(idx) => {
                    match &chunk.consts[idx as usize] {
                        Constant::Method(desc) => {
                            self.define_method(core_class::OBJECT, desc);
                        }
                        other => {
                            return Err(Unwind::Fault(crash::internal_error(format!(
                                "define_method on non-method constant: {other:?}"
                            ))))
                        }
                    }
                }
                Op::DefineClass(idx) => {
                    match chunk.consts[idx as usize].clone() {
                        Constant::Class(desc) => self.define_class(&desc)?,
                        other => {
                            return Err(Unwind::Fault(crash::internal_error(format!(
                                "define_class on non-class constant: {other:?}"
                            ))))
                        }
                    }
                }

                Op::Return => return Ok(stack.pop().unwrap_or(Value::Nil)),
            }
        }

        Ok(stack.pop().unwrap_or(Value::Nil))
    }

    // ---- helpers ----------------------------------------------------

    fn const_name(&mut self, chunk: &Chunk, idx: u16) -> VmResult<String> {
        match &chunk.consts[idx as usize] {
            Constant::Name(name) => Ok(name.clone()),
            other => Err(Unwind::Fault(crash::internal_error(format!(
                "name operand resolves to non-name constant: {other:?}"
            )))),
        }
    }

    fn alloc_str(&mut self, s: String) -> VmResult<Value> {
        let r = self.interp.heap.alloc(HeapCell::Str(s), &mut *self.hooks)?;
        Ok(Value::Ref(r))
    }

    /// Build the backtrace for an exception raised right now, innermost
    /// frame first.
    fn capture_backtrace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|frame| match &frame.desc {
                Some(desc) => format!("{}:{}:in {}", frame.file, frame.line, desc),
                None => format!("{}:{}", frame.file, frame.line),
            })
            .collect()
    }

    fn raise(&self, class: ClassId, message: String) -> Unwind {
        Unwind::Raise(ExceptionRecord {
            message,
            type_name: self.interp.class_display_name(class),
            backtrace: self.capture_backtrace(),
        })
    }

    fn type_name(&self, value: Value) -> &'static str {
        match value {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "Integer",
            Value::Sym(_) => "Symbol",
            Value::Class(_) => "Class",
            // A dangling ref faults at the access site; here it only
            // has to name a diagnostic.
            Value::Ref(r) => match self.interp.heap.get(r) {
                Ok(HeapCell::Str(_)) => "String",
                Ok(HeapCell::Array(_)) => "Array",
                Ok(HeapCell::Hash(_)) => "Hash",
                Ok(HeapCell::Object { .. }) | Err(_) => "Object",
            },
        }
    }

    fn binop(&mut self, op: &Op, lhs: Value, rhs: Value) -> VmResult<Value> {
        match op {
            Op::Eq => Ok(Value::Bool(self.interp.values_equal(lhs, rhs)?)),
            Op::Ne => Ok(Value::Bool(!self.interp.values_equal(lhs, rhs)?)),
            Op::Add => match (lhs, rhs) {
                (Value::Int(a), Value::Int(b)) => match a.checked_add(b) {
                    Some(v) => Ok(Value::Int(v)),
                    None => Err(self.raise(
                        core_class::RUNTIME_ERROR,
                        "integer overflow in addition".to_string(),
                    )),
                },
                (Value::Ref(ra), Value::Ref(rb)) => {
                    match (self.interp.heap.get(ra)?, self.interp.heap.get(rb)?) {
                        (HeapCell::Str(a), HeapCell::Str(b)) => {
                            let joined = format!("{a}{b}");
                            self.alloc_str(joined)
                        }
                        (HeapCell::Array(a), HeapCell::Array(b)) => {
                            let mut joined = a.clone();
                            joined.extend_from_slice(b);
                            let r = self
                                .interp
                                .heap
                                .alloc(HeapCell::Array(joined), &mut *self.hooks)?;
                            Ok(Value::Ref(r))
                        }
                        _ => Err(self.coercion_error(lhs, rhs)),
                    }
                }
                _ => Err(self.coercion_error(lhs, rhs)),
            },
            Op::Sub => match (lhs, rhs) {
                (Value::Int(a), Value::Int(b)) => match a.checked_sub(b) {
                    Some(v) => Ok(Value::Int(v)),
                    None => Err(self.raise(
                        core_class::RUNTIME_ERROR,
                        "integer overflow in subtraction".to_string(),
                    )),
                },
                _ => Err(self.coercion_error(lhs, rhs)),
            },
            Op::Mul => match (lhs, rhs) {
                (Value::Int(a), Value::Int(b)) => match a.checked_mul(b) {
                    Some(v) => Ok(Value::Int(v)),
                    None => Err(self.raise(
                        core_class::RUNTIME_ERROR,
                        "integer overflow in multiplication".to_string(),
                    )),
                },
                (Value::Ref(r), Value::Int(n)) => {
                    let source = match self.interp.heap.get(r)? {
                        HeapCell::Str(s) => s.clone(),
                        _ => return Err(self.coercion_error(lhs, rhs)),
                    };
                    if n < 0 {
                        return Err(self.raise(
                            core_class::ARGUMENT_ERROR,
                            "negative argument".to_string(),
                        ));
                    }
                    let count = n as usize;
                    let projected = source.len().checked_mul(count).ok_or_else(|| {
                        self.raise(core_class::ARGUMENT_ERROR, "argument too big".to_string())
                    })?;
                    // Settle the charge before materializing the bytes,
                    // so a quota rejection cannot spike host memory.
                    self.hooks.alloc(projected)?;
                    self.hooks.dealloc(projected);
                    self.alloc_str(source.repeat(count))
                }
                _ => Err(self.coercion_error(lhs, rhs)),
            },
            Op::Div => match (lhs, rhs) {
                (Value::Int(_), Value::Int(0)) => Err(self.raise(
                    core_class::ZERO_DIVISION_ERROR,
                    "divided by 0".to_string(),
                )),
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_div(b))),
                _ => Err(self.coercion_error(lhs, rhs)),
            },
            Op::Lt | Op::Le | Op::Gt | Op::Ge => match (lhs, rhs) {
                (Value::Int(a), Value::Int(b)) => {
                    let result = match op {
                        Op::Lt => a < b,
                        Op::Le => a <= b,
                        Op::Gt => a > b,
                        _ => a >= b,
                    };
                    Ok(Value::Bool(result))
                }
                _ => Err(self.raise(
                    core_class::ARGUMENT_ERROR,
                    format!(
                        "comparison of {} with {} failed",
                        self.type_name(lhs),
                        self.type_name(rhs)
                    ),
                )),
            },
            Op::Shl => match lhs {
                Value::Ref(r) => match self.interp.heap.get(r)? {
                    HeapCell::Array(_) => {
                        self.interp.heap.mutate(
                            r,
                            &mut *self.hooks,
                            |cell| {
                                if let HeapCell::Array(items) = cell {
                                    items.push(rhs);
                                }
                            },
                            |cell| {
                                if let HeapCell::Array(items) = cell {
                                    items.pop();
                                }
                            },
                        )?;
                        Ok(Value::Ref(r))
                    }
                    HeapCell::Str(_) => {
                        let appended = match rhs {
                            Value::Ref(rb) => match self.interp.heap.get(rb)? {
                                HeapCell::Str(s) => s.clone(),
                                _ => return Err(self.coercion_error(lhs, rhs)),
                            },
                            _ => return Err(self.coercion_error(lhs, rhs)),
                        };
                        let len = appended.len();
                        self.interp.heap.mutate(
                            r,
                            &mut *self.hooks,
                            |cell| {
                                if let HeapCell::Str(s) = cell {
                                    s.push_str(&appended);
                                }
                            },
                            |cell| {
                                if let HeapCell::Str(s) = cell {
                                    s.truncate(s.len().saturating_sub(len));
                                }
                            },
                        )?;
                        Ok(Value::Ref(r))
                    }
                    _ => Err(self.coercion_error(lhs, rhs)),
                },
                _ => Err(self.coercion_error(lhs, rhs)),
            },
            _ => Err(Unwind::Fault(crash::internal_error(format!(
                "non-binary opcode in binop: {op:?}"
            )))),
        }
    }

    fn coercion_error(&self, lhs: Value, rhs: Value) -> Unwind {
        self.raise(
            core_class::TYPE_ERROR,
            format!(
                "{} can't be coerced into {}",
                self.type_name(rhs),
                self.type_name(lhs)
            ),
        )
    }

    fn define_method(&mut self, owner: ClassId, desc: &MethodDesc) {
        self.interp.bind_method(
            owner,
            Arc::new(RuntimeMethod {
                name: desc.name.clone(),
                params: desc.params,
                chunk: Arc::new(desc.chunk.clone()),
                owner,
            }),
        );
    }

    fn define_class(&mut self, desc: &ClassDesc) -> VmResult<()> {
        let superclass = match &desc.superclass {
            Some(name) => match self.interp.constants.get(name) {
                Some(Value::Class(id)) => Some(*id),
                Some(_) => {
                    return Err(self.raise(
                        core_class::TYPE_ERROR,
                        format!("superclass must be a Class ({name} given)"),
                    ))
                }
                None => {
                    return Err(self.raise(
                        core_class::NAME_ERROR,
                        format!("uninitialized constant {name}"),
                    ))
                }
            },
            None => Some(core_class::OBJECT),
        };

        // Reopening an existing class adds methods to it.
        let class = match self.interp.constants.get(&desc.name) {
            Some(Value::Class(id)) => *id,
            Some(_) => {
                return Err(self.raise(
                    core_class::TYPE_ERROR,
                    format!("{} is not a class", desc.name),
                ))
            }
            None => {
                let id = self.interp.define_class(Some(desc.name.clone()), superclass);
                self.interp
                    .constants
                    .insert(desc.name.clone(), Value::Class(id));
                id
            }
        };

        for method in &desc.methods {
            self.define_method(class, method);
        }
        Ok(())
    }

    fn call_function(&mut self, name: &str, mut args: Vec<Value>) -> VmResult<Value> {
        // Top-level definitions shadow the builtin kernel.
        if let Some(method) = self.interp.resolve_method(core_class::OBJECT, name) {
            return self.call_method(&method, &mut args);
        }
        // A bare name assigned in another file (or an earlier eval)
        // parses as a zero-argument call here; resolve it against the
        // shared top-level bindings before giving up.
        if args.is_empty() {
            if let Some(&value) = self.interp.top_bindings.get(name) {
                return Ok(value);
            }
        }
        match name {
            "raise" => Err(self.do_raise(&args)),
            "exit" => Err(Unwind::Exit),
            // Output is discarded: the sandbox has no I/O capability.
            "puts" | "p" | "print" => Ok(Value::Nil),
            _ => Err(self.raise(
                core_class::NO_METHOD_ERROR,
                format!("undefined method '{name}'"),
            )),
        }
    }

    fn do_raise(&mut self, args: &[Value]) -> Unwind {
        match args {
            [] => self.raise(core_class::RUNTIME_ERROR, "unhandled exception".to_string()),
            [Value::Ref(r)] => match self.interp.heap.get(*r) {
                Ok(HeapCell::Str(s)) => self.raise(core_class::RUNTIME_ERROR, s.clone()),
                Ok(_) => self.raise(
                    core_class::TYPE_ERROR,
                    "exception class/object expected".to_string(),
                ),
                Err(err) => Unwind::Fault(err),
            },
            [Value::Class(id)] => {
                let message = self.interp.class_display_name(*id);
                self.raise_with_class(*id, message)
            }
            [Value::Class(id), Value::Ref(r)] => match self.interp.heap.get(*r) {
                Ok(HeapCell::Str(s)) => {
                    let message = s.clone();
                    self.raise_with_class(*id, message)
                }
                Ok(_) => self.raise(
                    core_class::TYPE_ERROR,
                    "exception class/object expected".to_string(),
                ),
                Err(err) => Unwind::Fault(err),
            },
            _ => self.raise(
                core_class::TYPE_ERROR,
                "exception class/object expected".to_string(),
            ),
        }
    }

    fn raise_with_class(&self, class: ClassId, message: String) -> Unwind {
        if !self
            .interp
            .is_descendant(class, core_class::EXCEPTION)
        {
            return self.raise(
                core_class::TYPE_ERROR,
                "exception class/object expected".to_string(),
            );
        }
        self.raise(class, message)
    }

    fn call_method(&mut self, method: &Arc<RuntimeMethod>, args: &mut Vec<Value>) -> VmResult<Value> {
        if args.len() != method.params as usize {
            return Err(self.raise(
                core_class::ARGUMENT_ERROR,
                format!(
                    "wrong number of arguments (given {}, expected {})",
                    args.len(),
                    method.params
                ),
            ));
        }
        self.hooks.on_call_enter()?;
        let mut locals = std::mem::take(args);
        locals.resize(method.chunk.local_count as usize, Value::Nil);
        let desc = format!(
            "{}.{}",
            self.interp.class_display_name(method.owner),
            method.name
        );
        let chunk = Arc::clone(&method.chunk);
        let result = self.exec(&chunk, &mut locals, Some(desc));
        self.hooks.on_call_leave();
        result
    }

    fn invoke(&mut self, recv: Value, name: &str, args: &mut Vec<Value>) -> VmResult<Value> {
        match recv {
            Value::Class(id) => self.invoke_on_class(id, name, args),
            Value::Ref(r) => {
                if let HeapCell::Object { class } = *self.interp.heap.get(r)? {
                    if let Some(method) = self.interp.resolve_method(class, name) {
                        return self.call_method(&method, args);
                    }
                }
                self.invoke_builtin(recv, name, args)
            }
            _ => self.invoke_builtin(recv, name, args),
        }
    }

    fn invoke_on_class(&mut self, id: ClassId, name: &str, args: &mut Vec<Value>) -> VmResult<Value> {
        match name {
            "new" if id == core_class::CLASS => {
                let superclass = match args.as_slice() {
                    [] => core_class::OBJECT,
                    [Value::Class(s)] => *s,
                    _ => {
                        return Err(self.raise(
                            core_class::TYPE_ERROR,
                            "superclass must be a Class".to_string(),
                        ))
                    }
                };
                let new_id = self.interp.define_class(None, Some(superclass));
                Ok(Value::Class(new_id))
            }
            "new" => {
                let r = self
                    .interp
                    .heap
                    .alloc(HeapCell::Object { class: id }, &mut *self.hooks)?;
                if let Some(init) = self.interp.resolve_method(id, "initialize") {
                    self.call_method(&init, args)?;
                } else if !args.is_empty() {
                    return Err(self.raise(
                        core_class::ARGUMENT_ERROR,
                        format!("wrong number of arguments (given {}, expected 0)", args.len()),
                    ));
                }
                Ok(Value::Ref(r))
            }
            "to_s" => {
                let name = self.interp.class_display_name(id);
                self.alloc_str(name)
            }
            _ => Err(self.raise(
                core_class::NO_METHOD_ERROR,
                format!("undefined method '{name}'"),
            )),
        }
    }

    fn invoke_builtin(&mut self, recv: Value, name: &str, args: &mut Vec<Value>) -> VmResult<Value> {
        match name {
            "to_s" => {
                let rendered = match recv {
                    Value::Nil => String::new(),
                    Value::Bool(b) => b.to_string(),
                    Value::Int(v) => v.to_string(),
                    Value::Sym(id) => self.interp.symbol_name(id).to_string(),
                    Value::Class(id) => self.interp.class_display_name(id),
                    Value::Ref(r) => match self.interp.heap.get(r)? {
                        HeapCell::Str(_) => return Ok(recv),
                        HeapCell::Object { class } => {
                            format!("#<{}>", self.interp.class_display_name(*class))
                        }
                        _ => {
                            return Err(self.raise(
                                core_class::NO_METHOD_ERROR,
                                "undefined method 'to_s'".to_string(),
                            ))
                        }
                    },
                };
                self.alloc_str(rendered)
            }
            "length" | "size" => match recv {
                Value::Ref(r) => match self.interp.heap.get(r)? {
                    HeapCell::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                    HeapCell::Array(items) => Ok(Value::Int(items.len() as i64)),
                    HeapCell::Hash(entries) => Ok(Value::Int(entries.len() as i64)),
                    _ => Err(self.raise(
                        core_class::NO_METHOD_ERROR,
                        format!("undefined method '{name}'"),
                    )),
                },
                _ => Err(self.raise(
                    core_class::NO_METHOD_ERROR,
                    format!("undefined method '{name}'"),
                )),
            },
            "include?" => {
                let needle = args.first().copied().unwrap_or(Value::Nil);
                match recv {
                    Value::Ref(r) => match self.interp.heap.get(r)? {
                        HeapCell::Str(s) => match needle {
                            Value::Ref(rn) => match self.interp.heap.get(rn)? {
                                HeapCell::Str(n) => Ok(Value::Bool(s.contains(n.as_str()))),
                                _ => Err(self.raise(
                                    core_class::TYPE_ERROR,
                                    "no implicit conversion into String".to_string(),
                                )),
                            },
                            _ => Err(self.raise(
                                core_class::TYPE_ERROR,
                                "no implicit conversion into String".to_string(),
                            )),
                        },
                        HeapCell::Array(items) => {
                            let items = items.clone();
                            let mut found = false;
                            for item in items {
                                if self.interp.values_equal(item, needle)? {
                                    found = true;
                                    break;
                                }
                            }
                            Ok(Value::Bool(found))
                        }
                        _ => Err(self.raise(
                            core_class::NO_METHOD_ERROR,
                            "undefined method 'include?'".to_string(),
                        )),
                    },
                    _ => Err(self.raise(
                        core_class::NO_METHOD_ERROR,
                        "undefined method 'include?'".to_string(),
                    )),
                }
            }
            _ => Err(self.raise(
                core_class::NO_METHOD_ERROR,
                format!("undefined method '{name}'"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::guest::compiler::compile;
    use crate::guest::parser::parse;
    use crate::guest::value::Interp;
    use crate::guest::AllocHook;
    use crate::sandbox::pool::MemoryPool;
    use crate::sandbox::quota::QuotaSupervisor;
    use crate::sandbox::stack::StackGuard;
    use std::time::Duration;

    struct TestHooks {
        pool: MemoryPool,
        supervisor: QuotaSupervisor,
        guard: StackGuard,
    }

    impl TestHooks {
        fn new() -> Self {
            Self {
                pool: MemoryPool::new(4 * 1024 * 1024).unwrap(),
                supervisor: QuotaSupervisor::new(1_000_000, Duration::from_millis(500)),
                guard: StackGuard::new(),
            }
        }
    }

    impl AllocHook for TestHooks {
        fn alloc(&mut self, bytes: usize) -> Result<()> {
            self.pool.charge(bytes)
        }
        fn dealloc(&mut self, bytes: usize) {
            let _ = self.pool.release(bytes);
        }
    }

    impl ExecHooks for TestHooks {
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

    fn eval(interp: &mut Interp, hooks: &mut TestHooks, source: &str) -> VmResult<Value> {
        let chunk = Arc::new(compile("test.rb", &parse(source).unwrap()).unwrap());
        Vm::new(interp, hooks).run(&chunk)
    }

    fn fresh() -> (Interp, TestHooks) {
        let mut hooks = TestHooks::new();
        let interp = Interp::bootstrap(&mut hooks).unwrap();
        (interp, hooks)
    }

    #[test]
    fn test_arithmetic_and_bindings() {
        let (mut interp, mut hooks) = fresh();
        eval(&mut interp, &mut hooks, "a = 2 + 3 * 4\n@result = a").unwrap();
        assert_eq!(interp.ivars.get("@result"), Some(&Value::Int(14)));
    }

    #[test]
    fn test_top_bindings_shared_across_runs() {
        let (mut interp, mut hooks) = fresh();
        eval(&mut interp, &mut hooks, "a = 41").unwrap();
        eval(&mut interp, &mut hooks, "@out = a + 1").unwrap();
        assert_eq!(interp.ivars.get("@out"), Some(&Value::Int(42)));
    }

    #[test]
    fn test_method_definition_and_call() {
        let (mut interp, mut hooks) = fresh();
        eval(
            &mut interp,
            &mut hooks,
            "def add(a, b)\n  a + b\nend\n@sum = add(20, 22)",
        )
        .unwrap();
        assert_eq!(interp.ivars.get("@sum"), Some(&Value::Int(42)));
    }

    #[test]
    fn test_raise_builds_backtrace_innermost_first() {
        let (mut interp, mut hooks) = fresh();
        let source = "def foo\n  raise \"error!\"\nend\n\ndef bar\n  foo\nend\n\nbar";
        let err = eval(&mut interp, &mut hooks, source).unwrap_err();
        match err {
            Unwind::Raise(record) => {
                assert_eq!(record.message, "error!");
                assert_eq!(record.type_name, "RuntimeError");
                assert_eq!(
                    record.backtrace,
                    vec![
                        "test.rb:2:in Object.foo",
                        "test.rb:6:in Object.bar",
                        "test.rb:9",
                    ]
                );
            }
            other => panic!("expected raise, got {other:?}"),
        }
    }

    #[test]
    fn test_raise_with_class_and_message() {
        let (mut interp, mut hooks) = fresh();
        let err = eval(&mut interp, &mut hooks, "raise StandardError, \"oops\"").unwrap_err();
        match err {
            Unwind::Raise(record) => {
                assert_eq!(record.type_name, "StandardError");
                assert_eq!(record.message, "oops");
            }
            other => panic!("expected raise, got {other:?}"),
        }
    }

    #[test]
    fn test_raise_with_anonymous_class() {
        let (mut interp, mut hooks) = fresh();
        let err = eval(
            &mut interp,
            &mut hooks,
            "raise(Class.new(StandardError), \"This looks bad.\")",
        )
        .unwrap_err();
        match err {
            Unwind::Raise(record) => {
                assert_eq!(record.message, "This looks bad.");
                assert!(record.type_name.starts_with("#<Class:0x"));
            }
            other => panic!("expected raise, got {other:?}"),
        }
    }

    #[test]
    fn test_user_exception_subclass() {
        let (mut interp, mut hooks) = fresh();
        let source =
            "class TransmogrificationError < StandardError\nend\nraise TransmogrificationError, \"bad\"";
        let err = eval(&mut interp, &mut hooks, source).unwrap_err();
        match err {
            Unwind::Raise(record) => {
                assert_eq!(record.type_name, "TransmogrificationError");
                assert_eq!(record.message, "bad");
            }
            other => panic!("expected raise, got {other:?}"),
        }
    }

    #[test]
    fn test_exit_unwinds_cleanly() {
        let (mut interp, mut hooks) = fresh();
        let err = eval(&mut interp, &mut hooks, "@a = 1\nexit\n@b = 2").unwrap_err();
        assert!(matches!(err, Unwind::Exit));
        assert_eq!(interp.ivars.get("@a"), Some(&Value::Int(1)));
        assert_eq!(interp.ivars.get("@b"), None);
    }

    #[test]
    fn test_empty_loop_trips_instruction_quota() {
        let mut hooks = TestHooks {
            pool: MemoryPool::new(4 * 1024 * 1024).unwrap(),
            supervisor: QuotaSupervisor::new(1000, Duration::from_secs(10)),
            guard: StackGuard::new(),
        };
        let mut interp = Interp::bootstrap(&mut hooks).unwrap();
        let err = eval(&mut interp, &mut hooks, "loop do\nend").unwrap_err();
        match err {
            Unwind::Fault(fault) => {
                assert_eq!(fault.to_string(), "exceeded quota of 1000 instructions.")
            }
            other => panic!("expected fault, got {other:?}"),
        }
        assert_eq!(hooks.supervisor.instructions(), 1000);
    }

    #[test]
    fn test_while_true_also_counts_instructions() {
        let mut hooks = TestHooks {
            pool: MemoryPool::new(4 * 1024 * 1024).unwrap(),
            supervisor: QuotaSupervisor::new(500, Duration::from_secs(10)),
            guard: StackGuard::new(),
        };
        let mut interp = Interp::bootstrap(&mut hooks).unwrap();
        let err = eval(&mut interp, &mut hooks, "while true do\nend").unwrap_err();
        assert!(matches!(err, Unwind::Fault(SandboxError::InstructionQuota { .. })));
    }

    #[test]
    fn test_unbounded_allocation_trips_memory_quota() {
        let mut hooks = TestHooks {
            pool: MemoryPool::new(512 * 1024).unwrap(),
            supervisor: QuotaSupervisor::new(u64::MAX, Duration::from_secs(10)),
            guard: StackGuard::new(),
        };
        let mut interp = Interp::bootstrap(&mut hooks).unwrap();
        let err = eval(
            &mut interp,
            &mut hooks,
            "a = []\nloop { a << (\"foo\" * 1000) }",
        )
        .unwrap_err();
        assert!(matches!(err, Unwind::Fault(SandboxError::MemoryQuota { .. })));
    }

    #[test]
    fn test_infinite_recursion_trips_stack_guard() {
        let (mut interp, mut hooks) = fresh();
        let source = "class A\n  def initialize\n    A.new\n  end\nend\nA.new";
        let err = eval(&mut interp, &mut hooks, source).unwrap_err();
        match err {
            Unwind::Fault(fault) => assert_eq!(fault.to_string(), "stack exhausted"),
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_class_new_instance_runs_initialize() {
        let (mut interp, mut hooks) = fresh();
        eval(
            &mut interp,
            &mut hooks,
            "class Greeter\n  def initialize\n    @greeting = \"hello\"\n  end\nend\nGreeter.new",
        )
        .unwrap();
        assert!(interp.ivars.contains_key("@greeting"));
    }

    #[test]
    fn test_string_builtins() {
        let (mut interp, mut hooks) = fresh();
        eval(
            &mut interp,
            &mut hooks,
            "@len = \"🌈 over the sandbox\".length\n@has = \"🌈 over the sandbox\".include?(\"🌈\")",
        )
        .unwrap();
        assert_eq!(interp.ivars.get("@len"), Some(&Value::Int(18)));
        assert_eq!(interp.ivars.get("@has"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_division_by_zero_raises() {
        let (mut interp, mut hooks) = fresh();
        let err = eval(&mut interp, &mut hooks, "1 / 0").unwrap_err();
        match err {
            Unwind::Raise(record) => {
                assert_eq!(record.type_name, "ZeroDivisionError");
                assert_eq!(record.message, "divided by 0");
            }
            other => panic!("expected raise, got {other:?}"),
        }
    }

    #[test]
    fn test_undefined_method_raises_no_method_error() {
        let (mut interp, mut hooks) = fresh();
        let err = eval(&mut interp, &mut hooks, "frobnicate").unwrap_err();
        match err {
            Unwind::Raise(record) => {
                assert_eq!(record.type_name, "NoMethodError");
                assert_eq!(record.message, "undefined method 'frobnicate'");
            }
            other => panic!("expected raise, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_collected_after_run() {
        let (mut interp, mut hooks) = fresh();
        let baseline = hooks.pool.in_use();
        eval(
            &mut interp,
            &mut hooks,
            "scrap = \"x\" * 10000\nscrap = nil",
        )
        .unwrap();
        assert!(hooks.pool.in_use() > baseline);
        interp.collect_garbage(&mut hooks);
        // The 10000-byte scratch string is gone; only interned symbols
        // and named bindings survive.
        assert!(hooks.pool.in_use() < baseline + 1000);
    }

    #[test]
    fn test_conditionals_and_modifiers() {
        let (mut interp, mut hooks) = fresh();
        eval(
            &mut interp,
            &mut hooks,
            "@a = 0\n@a = 1 if true\n@a += 10 unless false\nif @a == 11\n  @b = :yes\nelse\n  @b = :no\nend",
        )
        .unwrap();
        assert_eq!(interp.ivars.get("@a"), Some(&Value::Int(11)));
        let yes = interp.intern("yes", &mut hooks).unwrap();
        assert_eq!(interp.ivars.get("@b"), Some(&Value::Sym(yes)));
    }

    #[test]
    fn test_hash_equality_with_symbol_keys() {
        let (mut interp, mut hooks) = fresh();
        eval(
            &mut interp,
            &mut hooks,
            "@ok = {foo: 17} == {foo: 17}\n@no = {foo: 17} == {foo: 18}",
        )
        .unwrap();
        assert_eq!(interp.ivars.get("@ok"), Some(&Value::Bool(true)));
        assert_eq!(interp.ivars.get("@no"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_wrong_arity_raises_argument_error() {
        let (mut interp, mut hooks) = fresh();
        let err = eval(&mut interp, &mut hooks, "def one(a)\n  a\nend\none(1, 2)").unwrap_err();
        match err {
            Unwind::Raise(record) => {
                assert_eq!(record.type_name, "ArgumentError");
                assert_eq!(record.message, "wrong number of arguments (given 2, expected 1)");
            }
            other => panic!("expected raise, got {other:?}"),
        }
    }
}
