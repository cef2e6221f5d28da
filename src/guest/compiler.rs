//! AST-to-bytecode compiler.
//!
//! Top-level code addresses its locals by name (`LoadName`/`StoreName`),
//! which is what lets every file of a multi-file program share one
//! top-level scope. Method bodies resolve locals to numbered slots at
//! compile time. `loop` blocks compile to a plain backward jump rather
//! than a method call, so an empty loop still costs instructions and
//! trips the quota.

use super::bytecode::{Chunk, ClassDesc, ConstIdx, Constant, MethodDesc, Op};
use super::parser::{BinOp, Expr, ExprKind, MethodDef, Stmt, StmtKind};
use super::CompileDiag;

use std::collections::HashMap;

enum Scope {
    Top,
    Method { slots: HashMap<String, u16> },
}

struct ChunkBuilder {
    file: String,
    code: Vec<Op>,
    lines: Vec<u32>,
    consts: Vec<Constant>,
    scope: Scope,
}

type CResult<T> = Result<T, CompileDiag>;

impl ChunkBuilder {
    fn new(file: &str, scope: Scope) -> Self {
        Self {
            file: file.to_string(),
            code: Vec::new(),
            lines: Vec::new(),
            consts: Vec::new(),
            scope,
        }
    }

    fn emit(&mut self, op: Op, line: u32) {
        self.code.push(op);
        self.lines.push(line);
    }

    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    /// Emit a jump with a placeholder target, returning its index for
    /// later patching.
    fn emit_jump(&mut self, op: Op, line: u32) -> usize {
        self.emit(op, line);
        self.code.len() - 1
    }

    fn patch_jump(&mut self, at: usize) {
        let target = self.here();
        match &mut self.code[at] {
            Op::Jump(t) | Op::JumpIfFalse(t) | Op::JumpIfTrue(t) => *t = target,
            _ => {}
        }
    }

    fn const_idx(&mut self, constant: Constant, line: u32) -> CResult<ConstIdx> {
        let dedupe = matches!(
            constant,
            Constant::Int(_) | Constant::Str(_) | Constant::Sym(_) | Constant::Name(_)
        );
        if dedupe {
            if let Some(idx) = self.consts.iter().position(|c| c == &constant) {
                return Ok(idx as ConstIdx);
            }
        }
        if self.consts.len() > ConstIdx::MAX as usize {
            return Err(CompileDiag {
                line,
                col: 1,
                message: "syntax error, constant pool overflow".to_string(),
            });
        }
        self.consts.push(constant);
        Ok((self.consts.len() - 1) as ConstIdx)
    }

    fn name_idx(&mut self, name: &str, line: u32) -> CResult<ConstIdx> {
        self.const_idx(Constant::Name(name.to_string()), line)
    }

    fn local_slot(&mut self, name: &str) -> Option<u16> {
        match &mut self.scope {
            Scope::Top => None,
            Scope::Method { slots } => {
                if let Some(&slot) = slots.get(name) {
                    return Some(slot);
                }
                let slot = slots.len() as u16;
                slots.insert(name.to_string(), slot);
                Some(slot)
            }
        }
    }

    // ---- statements -------------------------------------------------

    /// Compile a statement list. Every statement leaves one value on the
    /// stack; all but the last (when `want_value`) are popped.
    fn body(&mut self, stmts: &[Stmt], want_value: bool) -> CResult<()> {
        if stmts.is_empty() {
            if want_value {
                self.emit(Op::Nil, 1);
            }
            return Ok(());
        }
        let last = stmts.len() - 1;
        for (i, stmt) in stmts.iter().enumerate() {
            self.stmt(stmt)?;
            if !(want_value && i == last) {
                self.emit(Op::Pop, stmt.line);
            }
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> CResult<()> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(expr) => self.expr(expr),
            StmtKind::If { arms, else_body } => {
                let mut end_jumps = Vec::new();
                let mut next_jump = None;
                for (cond, body) in arms {
                    if let Some(at) = next_jump.take() {
                        self.patch_jump(at);
                    }
                    self.expr(cond)?;
                    next_jump = Some(self.emit_jump(Op::JumpIfFalse(0), cond.line));
                    self.body(body, true)?;
                    end_jumps.push(self.emit_jump(Op::Jump(0), line));
                }
                if let Some(at) = next_jump.take() {
                    self.patch_jump(at);
                }
                match else_body {
                    Some(body) => self.body(body, true)?,
                    None => self.emit(Op::Nil, line),
                }
                for at in end_jumps {
                    self.patch_jump(at);
                }
                Ok(())
            }
            StmtKind::Unless {
                cond,
                body,
                else_body,
            } => {
                self.expr(cond)?;
                let skip = self.emit_jump(Op::JumpIfTrue(0), cond.line);
                self.body(body, true)?;
                let end = self.emit_jump(Op::Jump(0), line);
                self.patch_jump(skip);
                match else_body {
                    Some(body) => self.body(body, true)?,
                    None => self.emit(Op::Nil, line),
                }
                self.patch_jump(end);
                Ok(())
            }
            StmtKind::While { cond, body } => {
                let start = self.here();
                self.expr(cond)?;
                let exit = self.emit_jump(Op::JumpIfFalse(0), cond.line);
                self.body(body, false)?;
                self.emit(Op::Jump(start), line);
                self.patch_jump(exit);
                self.emit(Op::Nil, line);
                Ok(())
            }
            StmtKind::Def(def) => {
                let method = compile_method(&self.file, def)?;
                let idx = self.const_idx(Constant::Method(method), line)?;
                self.emit(Op::DefineMethod(idx), line);
                self.emit(Op::Nil, line);
                Ok(())
            }
            StmtKind::Class {
                name,
                superclass,
                methods,
            } => {
                let mut compiled = Vec::with_capacity(methods.len());
                for def in methods {
                    compiled.push(compile_method(&self.file, def)?);
                }
                let desc = ClassDesc {
                    name: name.clone(),
                    superclass: superclass.clone(),
                    methods: compiled,
                };
                let idx = self.const_idx(Constant::Class(desc), line)?;
                self.emit(Op::DefineClass(idx), line);
                self.emit(Op::Nil, line);
                Ok(())
            }
            StmtKind::Return(value) => {
                match value {
                    Some(expr) => self.expr(expr)?,
                    None => self.emit(Op::Nil, line),
                }
                self.emit(Op::Return, line);
                Ok(())
            }
            StmtKind::ModIf { cond, stmt } => {
                self.expr(cond)?;
                let skip = self.emit_jump(Op::JumpIfFalse(0), cond.line);
                self.stmt(stmt)?;
                let end = self.emit_jump(Op::Jump(0), line);
                self.patch_jump(skip);
                self.emit(Op::Nil, line);
                self.patch_jump(end);
                Ok(())
            }
            StmtKind::ModUnless { cond, stmt } => {
                self.expr(cond)?;
                let skip = self.emit_jump(Op::JumpIfTrue(0), cond.line);
                self.stmt(stmt)?;
                let end = self.emit_jump(Op::Jump(0), line);
                self.patch_jump(skip);
                self.emit(Op::Nil, line);
                self.patch_jump(end);
                Ok(())
            }
        }
    }

    // ---- expressions ------------------------------------------------

    fn expr(&mut self, expr: &Expr) -> CResult<()> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Nil => {
                self.emit(Op::Nil, line);
                Ok(())
            }
            ExprKind::True => {
                self.emit(Op::True, line);
                Ok(())
            }
            ExprKind::False => {
                self.emit(Op::False, line);
                Ok(())
            }
            ExprKind::Int(v) => {
                let idx = self.const_idx(Constant::Int(*v), line)?;
                self.emit(Op::Const(idx), line);
                Ok(())
            }
            ExprKind::Str(s) => {
                let idx = self.const_idx(Constant::Str(s.clone()), line)?;
                self.emit(Op::Const(idx), line);
                Ok(())
            }
            ExprKind::Sym(s) => {
                let idx = self.const_idx(Constant::Sym(s.clone()), line)?;
                self.emit(Op::Const(idx), line);
                Ok(())
            }
            ExprKind::Local(name) => {
                match self.local_slot(name) {
                    Some(slot) => self.emit(Op::LoadLocal(slot), line),
                    None => {
                        let idx = self.name_idx(name, line)?;
                        self.emit(Op::LoadName(idx), line);
                    }
                }
                Ok(())
            }
            ExprKind::Ivar(name) => {
                let idx = self.name_idx(name, line)?;
                self.emit(Op::LoadIvar(idx), line);
                Ok(())
            }
            ExprKind::ConstRef(name) => {
                let idx = self.name_idx(name, line)?;
                self.emit(Op::LoadConst(idx), line);
                Ok(())
            }
            ExprKind::Array(items) => {
                for item in items {
                    self.expr(item)?;
                }
                self.emit(Op::NewArray(items.len() as u16), line);
                Ok(())
            }
            ExprKind::Hash(entries) => {
                for (k, v) in entries {
                    self.expr(k)?;
                    self.expr(v)?;
                }
                self.emit(Op::NewHash(entries.len() as u16), line);
                Ok(())
            }
            ExprKind::Binop { op, lhs, rhs } => {
                self.expr(lhs)?;
                self.expr(rhs)?;
                let op = match op {
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Lt => Op::Lt,
                    BinOp::Le => Op::Le,
                    BinOp::Gt => Op::Gt,
                    BinOp::Ge => Op::Ge,
                    BinOp::Eq => Op::Eq,
                    BinOp::Ne => Op::Ne,
                    BinOp::Shl => Op::Shl,
                };
                self.emit(op, line);
                Ok(())
            }
            ExprKind::AssignLocal { name, value } => {
                self.expr(value)?;
                match self.local_slot(name) {
                    Some(slot) => self.emit(Op::StoreLocal(slot), line),
                    None => {
                        let idx = self.name_idx(name, line)?;
                        self.emit(Op::StoreName(idx), line);
                    }
                }
                Ok(())
            }
            ExprKind::AssignIvar { name, value } => {
                self.expr(value)?;
                let idx = self.name_idx(name, line)?;
                self.emit(Op::StoreIvar(idx), line);
                Ok(())
            }
            ExprKind::Call {
                recv,
                name,
                args,
                block,
            } => {
                if let Some(body) = block {
                    if recv.is_some() || name != "loop" || !args.is_empty() {
                        return Err(CompileDiag {
                            line,
                            col: 1,
                            message: format!(
                                "syntax error, block argument not supported for '{name}'"
                            ),
                        });
                    }
                    let start = self.here();
                    self.body(body, false)?;
                    self.emit(Op::Jump(start), line);
                    // Unreachable; keeps every statement one value wide.
                    self.emit(Op::Nil, line);
                    return Ok(());
                }

                if let Some(recv) = recv {
                    self.expr(recv)?;
                }
                for arg in args {
                    self.expr(arg)?;
                }
                let idx = self.name_idx(name, line)?;
                let argc = args.len() as u8;
                let op = if recv.is_some() {
                    Op::Invoke { name: idx, argc }
                } else {
                    Op::Call { name: idx, argc }
                };
                self.emit(op, line);
                Ok(())
            }
        }
    }
}

fn compile_method(file: &str, def: &MethodDef) -> CResult<MethodDesc> {
    let slots: HashMap<String, u16> = def
        .params
        .iter()
        .enumerate()
        .map(|(i, p)| (p.clone(), i as u16))
        .collect();
    let mut builder = ChunkBuilder::new(file, Scope::Method { slots });
    builder.body(&def.body, true)?;
    builder.emit(Op::Return, def.line);

    let local_count = match &builder.scope {
        Scope::Method { slots } => slots.len() as u16,
        Scope::Top => 0,
    };
    Ok(MethodDesc {
        name: def.name.clone(),
        params: def.params.len() as u16,
        chunk: Chunk {
            file: builder.file,
            code: builder.code,
            lines: builder.lines,
            consts: builder.consts,
            local_count,
        },
    })
}

/// Compile one parsed source file into its top-level chunk. The chunk
/// returns the value of its last statement, which is what an eval of
/// the file evaluates to.
pub fn compile(file: &str, stmts: &[Stmt]) -> Result<Chunk, CompileDiag> {
    let mut builder = ChunkBuilder::new(file, Scope::Top);
    builder.body(stmts, true)?;
    builder.emit(Op::Return, stmts.last().map_or(1, |s| s.line));
    Ok(Chunk {
        file: builder.file,
        code: builder.code,
        lines: builder.lines,
        consts: builder.consts,
        local_count: 0,
    })
}
