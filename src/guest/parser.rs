//! Recursive-descent parser producing the guest AST.
//!
//! Identifier resolution follows the usual Ruby rule: a bare lowercase
//! identifier is a local variable only if an assignment to it has already
//! been seen in the current scope, otherwise it parses as a method call.
//! That is what lets `bar` on its own line be a call while `a` after
//! `a = []` is a variable read.

use super::lexer::{tokenize, Tok, Token};
use super::CompileDiag;

use std::collections::HashSet;

/// Binary operators of the guest expression grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
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
}

/// An expression with the 1-based source line of its head token.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Nil,
    True,
    False,
    Int(i64),
    Str(String),
    Sym(String),
    /// Read of a local variable (already assigned in this scope).
    Local(String),
    /// Read of a `@name` instance variable.
    Ivar(String),
    /// Constant (class) reference.
    ConstRef(String),
    Array(Vec<Expr>),
    Hash(Vec<(Expr, Expr)>),
    Binop {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Method call. `recv` is `None` for function-style calls.
    Call {
        recv: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
        block: Option<Vec<Stmt>>,
    },
    AssignLocal {
        name: String,
        value: Box<Expr>,
    },
    AssignIvar {
        name: String,
        value: Box<Expr>,
    },
}

/// A statement with the source line of its head token.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    /// `if`/`elsif` arms, each a condition with its body, then `else`.
    If {
        arms: Vec<(Expr, Vec<Stmt>)>,
        else_body: Option<Vec<Stmt>>,
    },
    Unless {
        cond: Expr,
        body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Def(MethodDef),
    Class {
        name: String,
        superclass: Option<String>,
        methods: Vec<MethodDef>,
    },
    Return(Option<Expr>),
    /// `stmt if cond` statement modifier.
    ModIf {
        cond: Expr,
        stmt: Box<Stmt>,
    },
    /// `stmt unless cond` statement modifier.
    ModUnless {
        cond: Expr,
        stmt: Box<Stmt>,
    },
}

/// A `def` body, either top-level or inside a class.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Position of the most recently consumed token; end-of-input errors
    /// are reported here rather than past the last character.
    last_pos: (u32, u32),
    /// Locals assigned so far, innermost scope last.
    scopes: Vec<HashSet<String>>,
}

type PResult<T> = Result<T, CompileDiag>;

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            last_pos: (1, 1),
            scopes: vec![HashSet::new()],
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_tok(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn peek2_tok(&self) -> &Tok {
        let i = (self.pos + 1).min(self.tokens.len() - 1);
        &self.tokens[i].tok
    }

    fn bump(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if token.tok != Tok::Eof {
            self.last_pos = (token.line, token.col);
            self.pos += 1;
        }
        token
    }

    fn error_at(&self, line: u32, col: u32, message: String) -> CompileDiag {
        CompileDiag { line, col, message }
    }

    fn unexpected(&self) -> CompileDiag {
        let token = self.peek();
        let (line, col) = if token.tok == Tok::Eof {
            self.last_pos
        } else {
            (token.line, token.col)
        };
        self.error_at(
            line,
            col,
            format!("syntax error, unexpected {}", token.tok.describe()),
        )
    }

    fn expect(&mut self, expected: &Tok) -> PResult<Token> {
        if self.peek_tok() == expected {
            Ok(self.bump())
        } else {
            Err(self.unexpected())
        }
    }

    fn eat(&mut self, expected: &Tok) -> bool {
        if self.peek_tok() == expected {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek_tok() == &Tok::Newline {
            self.bump();
        }
    }

    fn is_local(&self, name: &str) -> bool {
        // Only the innermost scope counts: a method body does not see
        // top-level locals (blocks do not push a scope, so they share
        // their enclosing method or top-level scope).
        self.scopes.last().is_some_and(|s| s.contains(name))
    }

    fn define_local(&mut self, name: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string());
        }
    }

    // ---- statements -------------------------------------------------

    fn parse_program(&mut self) -> PResult<Vec<Stmt>> {
        let body = self.parse_body(|t| t == &Tok::Eof)?;
        self.expect(&Tok::Eof)?;
        Ok(body)
    }

    fn parse_body(&mut self, stop: impl Fn(&Tok) -> bool + Copy) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if stop(self.peek_tok()) {
                return Ok(body);
            }
            if self.peek_tok() == &Tok::Eof {
                return Err(self.unexpected());
            }
            body.push(self.parse_stmt()?);
        }
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        let line = self.peek().line;
        let base = match self.peek_tok() {
            Tok::KwDef => {
                let def = self.parse_def()?;
                Stmt {
                    kind: StmtKind::Def(def),
                    line,
                }
            }
            Tok::KwClass => self.parse_class()?,
            Tok::KwIf => self.parse_if()?,
            Tok::KwUnless => self.parse_unless()?,
            Tok::KwWhile => self.parse_while()?,
            Tok::KwReturn => {
                self.bump();
                let value = if self.starts_expression() {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                Stmt {
                    kind: StmtKind::Return(value),
                    line,
                }
            }
            _ => {
                let expr = self.parse_expr()?;
                Stmt {
                    kind: StmtKind::Expr(expr),
                    line,
                }
            }
        };

        // Statement modifiers bind the whole preceding statement.
        match self.peek_tok() {
            Tok::KwIf => {
                self.bump();
                let cond = self.parse_expr()?;
                Ok(Stmt {
                    kind: StmtKind::ModIf {
                        cond,
                        stmt: Box::new(base),
                    },
                    line,
                })
            }
            Tok::KwUnless => {
                self.bump();
                let cond = self.parse_expr()?;
                Ok(Stmt {
                    kind: StmtKind::ModUnless {
                        cond,
                        stmt: Box::new(base),
                    },
                    line,
                })
            }
            _ => Ok(base),
        }
    }

    fn parse_def(&mut self) -> PResult<MethodDef> {
        let line = self.peek().line;
        self.expect(&Tok::KwDef)?;
        let name = match self.bump() {
            Token {
                tok: Tok::Ident(name),
                ..
            } => name,
            _ => return Err(self.unexpected()),
        };

        let mut params = Vec::new();
        if self.eat(&Tok::LParen) {
            if self.peek_tok() != &Tok::RParen {
                loop {
                    match self.bump() {
                        Token {
                            tok: Tok::Ident(p), ..
                        } => params.push(p),
                        _ => return Err(self.unexpected()),
                    }
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
            }
            self.expect(&Tok::RParen)?;
        }

        self.scopes.push(params.iter().cloned().collect());
        let body = self.parse_body(|t| t == &Tok::KwEnd)?;
        self.expect(&Tok::KwEnd)?;
        self.scopes.pop();

        Ok(MethodDef {
            name,
            params,
            body,
            line,
        })
    }

    fn parse_class(&mut self) -> PResult<Stmt> {
        let line = self.peek().line;
        self.expect(&Tok::KwClass)?;
        let name = match self.bump() {
            Token {
                tok: Tok::Const(name),
                ..
            } => name,
            _ => return Err(self.unexpected()),
        };
        let superclass = if self.eat(&Tok::Lt) {
            match self.bump() {
                Token {
                    tok: Tok::Const(s), ..
                } => Some(s),
                _ => return Err(self.unexpected()),
            }
        } else {
            None
        };

        let mut methods = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek_tok() {
                Tok::KwEnd => {
                    self.bump();
                    break;
                }
                Tok::KwDef => methods.push(self.parse_def()?),
                _ => return Err(self.unexpected()),
            }
        }

        Ok(Stmt {
            kind: StmtKind::Class {
                name,
                superclass,
                methods,
            },
            line,
        })
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let line = self.peek().line;
        self.expect(&Tok::KwIf)?;
        let mut arms = Vec::new();
        let mut else_body = None;

        let cond = self.parse_expr()?;
        self.eat(&Tok::KwThen);
        let body = self.parse_body(|t| {
            matches!(t, Tok::KwEnd | Tok::KwElse | Tok::KwElsif)
        })?;
        arms.push((cond, body));

        loop {
            match self.peek_tok() {
                Tok::KwElsif => {
                    self.bump();
                    let cond = self.parse_expr()?;
                    self.eat(&Tok::KwThen);
                    let body = self.parse_body(|t| {
                        matches!(t, Tok::KwEnd | Tok::KwElse | Tok::KwElsif)
                    })?;
                    arms.push((cond, body));
                }
                Tok::KwElse => {
                    self.bump();
                    else_body = Some(self.parse_body(|t| t == &Tok::KwEnd)?);
                    self.expect(&Tok::KwEnd)?;
                    break;
                }
                Tok::KwEnd => {
                    self.bump();
                    break;
                }
                _ => return Err(self.unexpected()),
            }
        }

        Ok(Stmt {
            kind: StmtKind::If { arms, else_body },
            line,
        })
    }

    fn parse_unless(&mut self) -> PResult<Stmt> {
        let line = self.peek().line;
        self.expect(&Tok::KwUnless)?;
        let cond = self.parse_expr()?;
        self.eat(&Tok::KwThen);
        let body = self.parse_body(|t| matches!(t, Tok::KwEnd | Tok::KwElse))?;
        let else_body = if self.eat(&Tok::KwElse) {
            let body = self.parse_body(|t| t == &Tok::KwEnd)?;
            Some(body)
        } else {
            None
        };
        self.expect(&Tok::KwEnd)?;
        Ok(Stmt {
            kind: StmtKind::Unless {
                cond,
                body,
                else_body,
            },
            line,
        })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let line = self.peek().line;
        self.expect(&Tok::KwWhile)?;
        let cond = self.parse_expr()?;
        self.eat(&Tok::KwDo);
        let body = self.parse_body(|t| t == &Tok::KwEnd)?;
        self.expect(&Tok::KwEnd)?;
        Ok(Stmt {
            kind: StmtKind::While { cond, body },
            line,
        })
    }

    // ---- expressions ------------------------------------------------

    fn starts_expression(&self) -> bool {
        matches!(
            self.peek_tok(),
            Tok::Int(_)
                | Tok::Str(_)
                | Tok::Sym(_)
                | Tok::Ident(_)
                | Tok::Const(_)
                | Tok::IVar(_)
                | Tok::LBracket
                | Tok::LBrace
                | Tok::LParen
                | Tok::KwNil
                | Tok::KwTrue
                | Tok::KwFalse
                | Tok::Minus
        )
    }

    /// Whether the current token can begin a paren-less argument list,
    /// as in `raise StandardError, "message"`.
    fn starts_command_arg(&self) -> bool {
        matches!(
            self.peek_tok(),
            Tok::Int(_)
                | Tok::Str(_)
                | Tok::Sym(_)
                | Tok::Const(_)
                | Tok::IVar(_)
                | Tok::LBracket
                | Tok::LParen
                | Tok::KwNil
                | Tok::KwTrue
                | Tok::KwFalse
                | Tok::Minus
        ) || matches!(self.peek_tok(), Tok::Ident(name) if self.is_local(name))
    }

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> PResult<Expr> {
        // Lookahead for `name = value` and `name += value` targets.
        match (self.peek_tok().clone(), self.peek2_tok().clone()) {
            (Tok::Ident(name), Tok::Assign) => {
                let line = self.peek().line;
                self.bump();
                self.bump();
                let value = self.parse_assignment()?;
                self.define_local(&name);
                return Ok(Expr {
                    kind: ExprKind::AssignLocal {
                        name,
                        value: Box::new(value),
                    },
                    line,
                });
            }
            (Tok::Ident(name), Tok::PlusAssign) => {
                let line = self.peek().line;
                self.bump();
                self.bump();
                let rhs = self.parse_assignment()?;
                let read = Expr {
                    kind: ExprKind::Local(name.clone()),
                    line,
                };
                self.define_local(&name);
                return Ok(Expr {
                    kind: ExprKind::AssignLocal {
                        name,
                        value: Box::new(Expr {
                            kind: ExprKind::Binop {
                                op: BinOp::Add,
                                lhs: Box::new(read),
                                rhs: Box::new(rhs),
                            },
                            line,
                        }),
                    },
                    line,
                });
            }
            (Tok::IVar(name), Tok::Assign) => {
                let line = self.peek().line;
                self.bump();
                self.bump();
                let value = self.parse_assignment()?;
                return Ok(Expr {
                    kind: ExprKind::AssignIvar {
                        name,
                        value: Box::new(value),
                    },
                    line,
                });
            }
            (Tok::IVar(name), Tok::PlusAssign) => {
                let line = self.peek().line;
                self.bump();
                self.bump();
                let rhs = self.parse_assignment()?;
                let read = Expr {
                    kind: ExprKind::Ivar(name.clone()),
                    line,
                };
                return Ok(Expr {
                    kind: ExprKind::AssignIvar {
                        name,
                        value: Box::new(Expr {
                            kind: ExprKind::Binop {
                                op: BinOp::Add,
                                lhs: Box::new(read),
                                rhs: Box::new(rhs),
                            },
                            line,
                        }),
                    },
                    line,
                });
            }
            _ => {}
        }
        self.parse_equality()
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek_tok() {
                Tok::EqEq => BinOp::Eq,
                Tok::Ne => BinOp::Ne,
                _ => return Ok(lhs),
            };
            let line = self.bump().line;
            let rhs = self.parse_comparison()?;
            lhs = Expr {
                kind: ExprKind::Binop {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            };
        }
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_shift()?;
        loop {
            let op = match self.peek_tok() {
                Tok::Lt => BinOp::Lt,
                Tok::Le => BinOp::Le,
                Tok::Gt => BinOp::Gt,
                Tok::Ge => BinOp::Ge,
                _ => return Ok(lhs),
            };
            let line = self.bump().line;
            let rhs = self.parse_shift()?;
            lhs = Expr {
                kind: ExprKind::Binop {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            };
        }
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_additive()?;
        while self.peek_tok() == &Tok::Shl {
            let line = self.bump().line;
            let rhs = self.parse_additive()?;
            lhs = Expr {
                kind: ExprKind::Binop {
                    op: BinOp::Shl,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_tok() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            let line = self.bump().line;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr {
                kind: ExprKind::Binop {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            };
        }
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_postfix()?;
        loop {
            let op = match self.peek_tok() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                _ => return Ok(lhs),
            };
            let line = self.bump().line;
            let rhs = self.parse_postfix()?;
            lhs = Expr {
                kind: ExprKind::Binop {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            };
        }
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        while self.peek_tok() == &Tok::Dot {
            let line = self.bump().line;
            let name = match self.bump() {
                Token {
                    tok: Tok::Ident(name),
                    ..
                } => name,
                _ => return Err(self.unexpected()),
            };
            let args = if self.eat(&Tok::LParen) {
                let args = self.parse_call_args()?;
                self.expect(&Tok::RParen)?;
                args
            } else {
                Vec::new()
            };
            expr = Expr {
                kind: ExprKind::Call {
                    recv: Some(Box::new(expr)),
                    name,
                    args,
                    block: None,
                },
                line,
            };
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        self.skip_newlines();
        if self.peek_tok() == &Tok::RParen {
            return Ok(args);
        }
        loop {
            args.push(self.parse_equality()?);
            if !self.eat(&Tok::Comma) {
                return Ok(args);
            }
            self.skip_newlines();
        }
    }

    fn parse_block(&mut self) -> PResult<Option<Vec<Stmt>>> {
        if self.eat(&Tok::KwDo) {
            let body = self.parse_body(|t| t == &Tok::KwEnd)?;
            self.expect(&Tok::KwEnd)?;
            Ok(Some(body))
        } else if self.eat(&Tok::LBrace) {
            let body = self.parse_body(|t| t == &Tok::RBrace)?;
            self.expect(&Tok::RBrace)?;
            Ok(Some(body))
        } else {
            Ok(None)
        }
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let line = self.peek().line;
        match self.peek_tok().clone() {
            Tok::Int(v) => {
                self.bump();
                Ok(Expr {
                    kind: ExprKind::Int(v),
                    line,
                })
            }
            Tok::Minus => {
                self.bump();
                match self.peek_tok().clone() {
                    Tok::Int(v) => {
                        self.bump();
                        Ok(Expr {
                            kind: ExprKind::Int(-v),
                            line,
                        })
                    }
                    _ => Err(self.unexpected()),
                }
            }
            Tok::Str(s) => {
                self.bump();
                Ok(Expr {
                    kind: ExprKind::Str(s),
                    line,
                })
            }
            Tok::Sym(s) => {
                self.bump();
                Ok(Expr {
                    kind: ExprKind::Sym(s),
                    line,
                })
            }
            Tok::KwNil => {
                self.bump();
                Ok(Expr {
                    kind: ExprKind::Nil,
                    line,
                })
            }
            Tok::KwTrue => {
                self.bump();
                Ok(Expr {
                    kind: ExprKind::True,
                    line,
                })
            }
            Tok::KwFalse => {
                self.bump();
                Ok(Expr {
                    kind: ExprKind::False,
                    line,
                })
            }
            Tok::IVar(name) => {
                self.bump();
                Ok(Expr {
                    kind: ExprKind::Ivar(name),
                    line,
                })
            }
            Tok::Const(name) => {
                self.bump();
                Ok(Expr {
                    kind: ExprKind::ConstRef(name),
                    line,
                })
            }
            Tok::LParen => {
                self.bump();
                self.skip_newlines();
                let expr = self.parse_expr()?;
                self.skip_newlines();
                self.expect(&Tok::RParen)?;
                Ok(expr)
            }
            Tok::LBracket => {
                self.bump();
                let mut items = Vec::new();
                self.skip_newlines();
                if self.peek_tok() != &Tok::RBracket {
                    loop {
                        items.push(self.parse_equality()?);
                        self.skip_newlines();
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                        self.skip_newlines();
                    }
                }
                self.expect(&Tok::RBracket)?;
                Ok(Expr {
                    kind: ExprKind::Array(items),
                    line,
                })
            }
            Tok::LBrace => self.parse_hash(line),
            Tok::Ident(name) => {
                self.bump();
                if self.is_local(&name) {
                    return Ok(Expr {
                        kind: ExprKind::Local(name),
                        line,
                    });
                }

                // Method call: parenthesized, command-style, or bare.
                let args = if self.eat(&Tok::LParen) {
                    let args = self.parse_call_args()?;
                    self.expect(&Tok::RParen)?;
                    args
                } else if self.starts_command_arg() {
                    let mut args = Vec::new();
                    loop {
                        args.push(self.parse_equality()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                        self.skip_newlines();
                    }
                    args
                } else {
                    Vec::new()
                };
                let block = self.parse_block()?;
                Ok(Expr {
                    kind: ExprKind::Call {
                        recv: None,
                        name,
                        args,
                        block,
                    },
                    line,
                })
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_hash(&mut self, line: u32) -> PResult<Expr> {
        self.expect(&Tok::LBrace)?;
        let mut entries = Vec::new();
        self.skip_newlines();
        if self.peek_tok() != &Tok::RBrace {
            loop {
                // `key: value` symbol shorthand, else `expr => expr`.
                let entry = match (self.peek_tok().clone(), self.peek2_tok().clone()) {
                    (Tok::Ident(name), Tok::Colon) => {
                        let key_line = self.peek().line;
                        self.bump();
                        self.bump();
                        let key = Expr {
                            kind: ExprKind::Sym(name),
                            line: key_line,
                        };
                        let value = self.parse_equality()?;
                        (key, value)
                    }
                    _ => {
                        let key = self.parse_equality()?;
                        self.expect(&Tok::FatArrow)?;
                        let value = self.parse_equality()?;
                        (key, value)
                    }
                };
                entries.push(entry);
                self.skip_newlines();
                if !self.eat(&Tok::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.expect(&Tok::RBrace)?;
        Ok(Expr {
            kind: ExprKind::Hash(entries),
            line,
        })
    }
}

/// Parse one guest source file into its statement list.
pub fn parse(source: &str) -> Result<Vec<Stmt>, CompileDiag> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).parse_program()
}
