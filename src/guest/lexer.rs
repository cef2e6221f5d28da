//! Tokenizer for guest source text.
//!
//! Positions are 1-based lines and columns; every token carries the
//! position of its first character so compile diagnostics can name the
//! exact spot (`file:line:col`).

use super::CompileDiag;

/// A lexical token kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Str(String),
    Sym(String),
    /// Lowercase identifier: local variable or method name.
    Ident(String),
    /// Capitalized identifier: constant (class) name.
    Const(String),
    /// `@name` instance variable on the top-level object.
    IVar(String),

    KwDef,
    KwEnd,
    KwClass,
    KwIf,
    KwElsif,
    KwElse,
    KwUnless,
    KwWhile,
    KwDo,
    KwThen,
    KwNil,
    KwTrue,
    KwFalse,
    KwReturn,

    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    Shl,
    Assign,
    PlusAssign,

    Comma,
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    FatArrow,
    Colon,
    Newline,
    Eof,
}

impl Tok {
    /// Rendering used in "syntax error, unexpected …" diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Tok::Eof => "$end".to_string(),
            Tok::Newline => "$newline".to_string(),
            Tok::Int(n) => format!("'{n}'"),
            Tok::Str(_) => "string literal".to_string(),
            Tok::Sym(s) => format!("':{s}'"),
            Tok::Ident(s) | Tok::Const(s) | Tok::IVar(s) => format!("'{s}'"),
            Tok::KwDef => "keyword_def".to_string(),
            Tok::KwEnd => "keyword_end".to_string(),
            Tok::KwClass => "keyword_class".to_string(),
            Tok::KwIf => "keyword_if".to_string(),
            Tok::KwElsif => "keyword_elsif".to_string(),
            Tok::KwElse => "keyword_else".to_string(),
            Tok::KwUnless => "keyword_unless".to_string(),
            Tok::KwWhile => "keyword_while".to_string(),
            Tok::KwDo => "keyword_do".to_string(),
            Tok::KwThen => "keyword_then".to_string(),
            Tok::KwNil => "keyword_nil".to_string(),
            Tok::KwTrue => "keyword_true".to_string(),
            Tok::KwFalse => "keyword_false".to_string(),
            Tok::KwReturn => "keyword_return".to_string(),
            Tok::Plus => "'+'".to_string(),
            Tok::Minus => "'-'".to_string(),
            Tok::Star => "'*'".to_string(),
            Tok::Slash => "'/'".to_string(),
            Tok::Lt => "'<'".to_string(),
            Tok::Le => "'<='".to_string(),
            Tok::Gt => "'>'".to_string(),
            Tok::Ge => "'>='".to_string(),
            Tok::EqEq => "'=='".to_string(),
            Tok::Ne => "'!='".to_string(),
            Tok::Shl => "'<<'".to_string(),
            Tok::Assign => "'='".to_string(),
            Tok::PlusAssign => "'+='".to_string(),
            Tok::Comma => "','".to_string(),
            Tok::Dot => "'.'".to_string(),
            Tok::LParen => "'('".to_string(),
            Tok::RParen => "')'".to_string(),
            Tok::LBracket => "'['".to_string(),
            Tok::RBracket => "']'".to_string(),
            Tok::LBrace => "'{'".to_string(),
            Tok::RBrace => "'}'".to_string(),
            Tok::FatArrow => "'=>'".to_string(),
            Tok::Colon => "':'".to_string(),
        }
    }
}

/// A token with its source position.
#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
    pub col: u32,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            col: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn diag(&self, message: impl Into<String>, line: u32, col: u32) -> CompileDiag {
        CompileDiag {
            line,
            col,
            message: message.into(),
        }
    }

    fn lex_string(&mut self, line: u32, col: u32) -> Result<Tok, CompileDiag> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(self.diag("syntax error, unterminated string meets end of file", line, col))
                }
                Some('"') => return Ok(Tok::Str(out)),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('\\') => out.push('\\'),
                    Some('"') => out.push('"'),
                    Some(other) => out.push(other),
                    None => {
                        return Err(self.diag(
                            "syntax error, unterminated string meets end of file",
                            line,
                            col,
                        ))
                    }
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn lex_word(&mut self, first: char) -> String {
        let mut word = String::new();
        word.push(first);
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        // Predicate method names like `include?`.
        if self.peek() == Some('?') {
            word.push('?');
            self.bump();
        }
        word
    }

    fn next_token(&mut self) -> Result<Token, CompileDiag> {
        loop {
            let line = self.line;
            let col = self.col;
            let c = match self.bump() {
                None => {
                    return Ok(Token {
                        tok: Tok::Eof,
                        line,
                        col,
                    })
                }
                Some(c) => c,
            };

            let tok = match c {
                ' ' | '\t' | '\r' => continue,
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
                '\n' => Tok::Newline,
                ';' => Tok::Newline,
                '"' => self.lex_string(line, col)?,
                '+' => {
                    if self.eat('=') {
                        Tok::PlusAssign
                    } else {
                        Tok::Plus
                    }
                }
                '-' => Tok::Minus,
                '*' => Tok::Star,
                '/' => Tok::Slash,
                ',' => Tok::Comma,
                '.' => Tok::Dot,
                '(' => Tok::LParen,
                ')' => Tok::RParen,
                '[' => Tok::LBracket,
                ']' => Tok::RBracket,
                '{' => Tok::LBrace,
                '}' => Tok::RBrace,
                '<' => {
                    if self.eat('<') {
                        Tok::Shl
                    } else if self.eat('=') {
                        Tok::Le
                    } else {
                        Tok::Lt
                    }
                }
                '>' => {
                    if self.eat('=') {
                        Tok::Ge
                    } else {
                        Tok::Gt
                    }
                }
                '=' => {
                    if self.eat('=') {
                        Tok::EqEq
                    } else if self.eat('>') {
                        Tok::FatArrow
                    } else {
                        Tok::Assign
                    }
                }
                '!' => {
                    if self.eat('=') {
                        Tok::Ne
                    } else {
                        return Err(self.diag("syntax error, unexpected '!'", line, col));
                    }
                }
                ':' => match self.peek() {
                    Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                        self.bump();
                        Tok::Sym(self.lex_word(first))
                    }
                    _ => Tok::Colon,
                },
                '@' => match self.peek() {
                    Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                        self.bump();
                        Tok::IVar(format!("@{}", self.lex_word(first)))
                    }
                    _ => return Err(self.diag("syntax error, unexpected '@'", line, col)),
                },
                '0'..='9' => {
                    let mut digits = String::new();
                    digits.push(c);
                    while let Some(d) = self.peek() {
                        if d.is_ascii_digit() || d == '_' {
                            if d != '_' {
                                digits.push(d);
                            }
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    let value: i64 = digits.parse().map_err(|_| {
                        self.diag("syntax error, integer literal out of range", line, col)
                    })?;
                    Tok::Int(value)
                }
                c if c.is_ascii_uppercase() => Tok::Const(self.lex_word(c)),
                c if c.is_ascii_lowercase() || c == '_' => {
                    let word = self.lex_word(c);
                    match word.as_str() {
                        "def" => Tok::KwDef,
                        "end" => Tok::KwEnd,
                        "class" => Tok::KwClass,
                        "if" => Tok::KwIf,
                        "elsif" => Tok::KwElsif,
                        "else" => Tok::KwElse,
                        "unless" => Tok::KwUnless,
                        "while" => Tok::KwWhile,
                        "do" => Tok::KwDo,
                        "then" => Tok::KwThen,
                        "nil" => Tok::KwNil,
                        "true" => Tok::KwTrue,
                        "false" => Tok::KwFalse,
                        "return" => Tok::KwReturn,
                        _ => Tok::Ident(word),
                    }
                }
                other => {
                    return Err(self.diag(
                        format!("syntax error, unexpected '{other}'"),
                        line,
                        col,
                    ))
                }
            };

            return Ok(Token { tok, line, col });
        }
    }
}

/// Tokenize `source`, appending a single trailing `Eof` token.
pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileDiag> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.tok == Tok::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}
