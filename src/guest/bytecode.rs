//! Compiled form of guest programs.
//!
//! A [`Chunk`] is one compiled source file: a flat opcode vector, a
//! parallel line table for backtraces, and a constant pool. Method and
//! class bodies nest as constants holding their own chunks.
//!
//! Chunks also define the engine-independent byte serialization used for
//! program sizing and hashing. The encoding is deterministic: the same
//! sources always produce the same bytes, on any engine.

/// Index into a chunk's constant pool.
pub type ConstIdx = u16;
/// Absolute opcode index used by jumps.
pub type CodeIdx = u32;

/// One opcode of the guest virtual machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Push a pool constant (integer, string, or symbol literal).
    Const(ConstIdx),
    Nil,
    True,
    False,
    Pop,

    /// Slot-indexed locals of a method body. Stores peek rather than
    /// pop, so an assignment is usable as an expression; statement
    /// compilation pops the leftover value.
    LoadLocal(u16),
    StoreLocal(u16),
    /// Named top-level bindings, shared by every file of a program.
    LoadName(ConstIdx),
    StoreName(ConstIdx),
    /// Instance variables of the top-level object.
    LoadIvar(ConstIdx),
    StoreIvar(ConstIdx),
    /// Constant (class) lookup.
    LoadConst(ConstIdx),

    /// Pop `n` elements and push a fresh array.
    NewArray(u16),
    /// Pop `2n` elements and push a fresh hash of `n` entries.
    NewHash(u16),

    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Shl,

    Jump(CodeIdx),
    JumpIfFalse(CodeIdx),
    JumpIfTrue(CodeIdx),

    /// Function-style call with no explicit receiver.
    Call { name: ConstIdx, argc: u8 },
    /// Method call on an explicit receiver (popped below the arguments).
    Invoke { name: ConstIdx, argc: u8 },

    /// Define the method constant at `ConstIdx` on the top-level object.
    DefineMethod(ConstIdx),
    /// Define the class constant at `ConstIdx` and bind its name.
    DefineClass(ConstIdx),

    /// Return the top of stack from the current chunk.
    Return,
}

/// A compiled method body.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDesc {
    pub name: String,
    /// Parameter count; parameters occupy local slots `0..params`.
    pub params: u16,
    pub chunk: Chunk,
}

/// A compiled class body: a name binding plus its methods.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDesc {
    pub name: String,
    pub superclass: Option<String>,
    pub methods: Vec<MethodDesc>,
}

/// Constant-pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i64),
    Str(String),
    Sym(String),
    /// An identifier: method, binding, ivar, or class name.
    Name(String),
    Method(MethodDesc),
    Class(ClassDesc),
}

/// One compiled source file.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Source path, carried into guest backtraces.
    pub file: String,
    pub code: Vec<Op>,
    /// Source line of each opcode, parallel to `code`.
    pub lines: Vec<u32>,
    pub consts: Vec<Constant>,
    /// Local slot count for method bodies; zero for top-level chunks.
    pub local_count: u16,
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn encode_op(op: &Op, out: &mut Vec<u8>) {
    // Tag byte, then fixed-width little-endian operands.
    match op {
        Op::Const(i) => {
            out.push(0x01);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Op::Nil => out.push(0x02),
        Op::True => out.push(0x03),
        Op::False => out.push(0x04),
        Op::Pop => out.push(0x05),
        Op::LoadLocal(i) => {
            out.push(0x06);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Op::StoreLocal(i) => {
            out.push(0x07);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Op::LoadName(i) => {
            out.push(0x08);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Op::StoreName(i) => {
            out.push(0x09);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Op::LoadIvar(i) => {
            out.push(0x0a);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Op::StoreIvar(i) => {
            out.push(0x0b);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Op::LoadConst(i) => {
            out.push(0x0c);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Op::NewArray(n) => {
            out.push(0x0d);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Op::NewHash(n) => {
            out.push(0x0e);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Op::Add => out.push(0x10),
        Op::Sub => out.push(0x11),
        Op::Mul => out.push(0x12),
        Op::Div => out.push(0x13),
        Op::Lt => out.push(0x14),
        Op::Le => out.push(0x15),
        Op::Gt => out.push(0x16),
        Op::Ge => out.push(0x17),
        Op::Eq => out.push(0x18),
        Op::Ne => out.push(0x19),
        Op::Shl => out.push(0x1a),
        Op::Jump(t) => {
            out.push(0x20);
            put_u32(out, *t);
        }
        Op::JumpIfFalse(t) => {
            out.push(0x21);
            put_u32(out, *t);
        }
        Op::JumpIfTrue(t) => {
            out.push(0x22);
            put_u32(out, *t);
        }
        Op::Call { name, argc } => {
            out.push(0x30);
            out.extend_from_slice(&name.to_le_bytes());
            out.push(*argc);
        }
        Op::Invoke { name, argc } => {
            out.push(0x31);
            out.extend_from_slice(&name.to_le_bytes());
            out.push(*argc);
        }
        Op::DefineMethod(i) => {
            out.push(0x32);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Op::DefineClass(i) => {
            out.push(0x33);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Op::Return => out.push(0x3f),
    }
}

fn encode_method(m: &MethodDesc, out: &mut Vec<u8>) {
    put_str(out, &m.name);
    out.extend_from_slice(&m.params.to_le_bytes());
    m.chunk.encode_into(out);
}

fn encode_constant(c: &Constant, out: &mut Vec<u8>) {
    match c {
        Constant::Int(v) => {
            out.push(0x01);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Constant::Str(s) => {
            out.push(0x02);
            put_str(out, s);
        }
        Constant::Sym(s) => {
            out.push(0x03);
            put_str(out, s);
        }
        Constant::Name(s) => {
            out.push(0x04);
            put_str(out, s);
        }
        Constant::Method(m) => {
            out.push(0x05);
            encode_method(m, out);
        }
        Constant::Class(k) => {
            out.push(0x06);
            put_str(out, &k.name);
            match &k.superclass {
                Some(s) => {
                    out.push(1);
                    put_str(out, s);
                }
                None => out.push(0),
            }
            put_u32(out, k.methods.len() as u32);
            for m in &k.methods {
                encode_method(m, out);
            }
        }
    }
}

impl Chunk {
    /// Append this chunk's deterministic byte encoding, debug line table
    /// included, to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        put_str(out, &self.file);
        out.extend_from_slice(&self.local_count.to_le_bytes());
        put_u32(out, self.consts.len() as u32);
        for c in &self.consts {
            encode_constant(c, out);
        }
        put_u32(out, self.code.len() as u32);
        for (op, line) in self.code.iter().zip(&self.lines) {
            encode_op(op, out);
            put_u32(out, *line);
        }
    }
}
