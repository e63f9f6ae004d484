use std::ops::Range;

use super::symbol::{SymbolId, SymbolKind, SymbolTable};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
/// One lexical token. Operators appear in their precedence groups; literal
/// tokens carry their value, identifiers a reference to their symbol entry.
pub enum Token {
    Eof,
    /// Numeric or character literal.
    Num(i64),
    /// String literal; the payload is its starting data-segment offset.
    Str(i64),
    Id(SymbolId),
    // Keywords.
    Char,
    Else,
    Enum,
    If,
    Int,
    Return,
    Sizeof,
    While,
    // Operators.
    Assign,
    Cond,
    Lor,
    Lan,
    Or,
    Xor,
    And,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Inc,
    Dec,
    Brak,
    Not,
    Tilde,
    // Punctuation.
    Semi,
    Comma,
    Colon,
    LParen,
    RParen,
    LBrace,
    RBrace,
    RBrak,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
/// Binding strength of binary and postfix operators, loosest first. The
/// expression compiler only consumes an operator whose precedence is at least
/// the level it was asked for.
pub enum Prec {
    Assign,
    Cond,
    Lor,
    Lan,
    Or,
    Xor,
    And,
    Equality,
    Relational,
    Shift,
    Additive,
    Multiplicative,
    Postfix,
}

impl Token {
    /// The precedence of this token when it appears in operator position, or
    /// `None` if it cannot continue an expression.
    pub fn precedence(self) -> Option<Prec> {
        match self {
            Token::Assign => Some(Prec::Assign),
            Token::Cond => Some(Prec::Cond),
            Token::Lor => Some(Prec::Lor),
            Token::Lan => Some(Prec::Lan),
            Token::Or => Some(Prec::Or),
            Token::Xor => Some(Prec::Xor),
            Token::And => Some(Prec::And),
            Token::Eq | Token::Ne => Some(Prec::Equality),
            Token::Lt | Token::Gt | Token::Le | Token::Ge => Some(Prec::Relational),
            Token::Shl | Token::Shr => Some(Prec::Shift),
            Token::Add | Token::Sub => Some(Prec::Additive),
            Token::Mul | Token::Div | Token::Mod => Some(Prec::Multiplicative),
            Token::Inc | Token::Dec | Token::Brak => Some(Prec::Postfix),
            _ => None,
        }
    }
}

/// Single-pass scanner over the source bytes.
///
/// Identifiers are interned into the symbol table as a side effect of
/// scanning; string-literal bytes are copied straight into the data segment.
/// The lexer itself never fails. Callers detect `Eof` where further tokens
/// are required.
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    line_start: usize,
    track_lines: bool,
    lines: Vec<(u32, Range<usize>)>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src,
            pos: 0,
            line: 1,
            line_start: 0,
            track_lines: false,
            lines: Vec::new(),
        }
    }

    /// Records each crossed source line for the compile-time listing.
    pub fn track_lines(&mut self, enabled: bool) {
        self.track_lines = enabled;
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    /// Takes the (line number, byte range) pairs crossed since the last call.
    pub fn take_lines(&mut self) -> Vec<(u32, Range<usize>)> {
        std::mem::take(&mut self.lines)
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_to_line_end(&mut self) {
        while let Some(b) = self.peek() {
            if b == b'\n' {
                break;
            }
            self.pos += 1;
        }
    }

    /// Produces the next token, skipping whitespace, comments and
    /// preprocessor-style directives (which are not expanded).
    pub fn next(&mut self, symbols: &mut SymbolTable, data: &mut Vec<u8>) -> Token {
        loop {
            let Some(b) = self.peek() else {
                // Flush a final line that has no trailing newline.
                if self.track_lines && self.line_start < self.src.len() {
                    self.lines.push((self.line, self.line_start..self.src.len()));
                    self.line_start = self.src.len();
                }
                return Token::Eof;
            };
            self.pos += 1;
            match b {
                b'\n' => {
                    if self.track_lines {
                        self.lines.push((self.line, self.line_start..self.pos - 1));
                    }
                    self.line += 1;
                    self.line_start = self.pos;
                }
                b' ' | b'\t' | b'\r' | 0x0b | 0x0c => {}
                b'#' => self.skip_to_line_end(),
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    return self.identifier(symbols);
                }
                b'0'..=b'9' => return self.number(b),
                b'/' => {
                    if self.eat(b'/') {
                        self.skip_to_line_end();
                    } else {
                        return Token::Div;
                    }
                }
                b'\'' | b'"' => return self.quoted(b, data),
                b'=' => return if self.eat(b'=') { Token::Eq } else { Token::Assign },
                b'+' => return if self.eat(b'+') { Token::Inc } else { Token::Add },
                b'-' => return if self.eat(b'-') { Token::Dec } else { Token::Sub },
                b'!' => return if self.eat(b'=') { Token::Ne } else { Token::Not },
                b'<' => {
                    return if self.eat(b'=') {
                        Token::Le
                    } else if self.eat(b'<') {
                        Token::Shl
                    } else {
                        Token::Lt
                    };
                }
                b'>' => {
                    return if self.eat(b'=') {
                        Token::Ge
                    } else if self.eat(b'>') {
                        Token::Shr
                    } else {
                        Token::Gt
                    };
                }
                b'|' => return if self.eat(b'|') { Token::Lor } else { Token::Or },
                b'&' => return if self.eat(b'&') { Token::Lan } else { Token::And },
                b'^' => return Token::Xor,
                b'%' => return Token::Mod,
                b'*' => return Token::Mul,
                b'[' => return Token::Brak,
                b'?' => return Token::Cond,
                b'~' => return Token::Tilde,
                b';' => return Token::Semi,
                b',' => return Token::Comma,
                b':' => return Token::Colon,
                b'(' => return Token::LParen,
                b')' => return Token::RParen,
                b'{' => return Token::LBrace,
                b'}' => return Token::RBrace,
                b']' => return Token::RBrak,
                // Anything unrecognized is skipped, not reported.
                _ => {}
            }
        }
    }

    fn identifier(&mut self, symbols: &mut SymbolTable) -> Token {
        let start = self.pos - 1;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let id = symbols.intern(&self.src[start..self.pos]);
        match symbols.binding(id) {
            Some(binding) => match binding.kind {
                SymbolKind::Keyword(token) => token,
                _ => Token::Id(id),
            },
            None => Token::Id(id),
        }
    }

    fn number(&mut self, first: u8) -> Token {
        let mut val = i64::from(first - b'0');
        if val != 0 {
            while let Some(b @ b'0'..=b'9') = self.peek() {
                val = val.wrapping_mul(10).wrapping_add(i64::from(b - b'0'));
                self.pos += 1;
            }
        } else if self.eat(b'x') || self.eat(b'X') {
            while let Some(b) = self.peek() {
                let digit = match b {
                    b'0'..=b'9' => i64::from(b - b'0'),
                    b'a'..=b'f' => i64::from(b - b'a') + 10,
                    b'A'..=b'F' => i64::from(b - b'A') + 10,
                    _ => break,
                };
                val = val.wrapping_mul(16).wrapping_add(digit);
                self.pos += 1;
            }
        } else {
            while let Some(b @ b'0'..=b'7') = self.peek() {
                val = val.wrapping_mul(8).wrapping_add(i64::from(b - b'0'));
                self.pos += 1;
            }
        }
        Token::Num(val)
    }

    /// Character and string literals share one scan. String bytes are copied
    /// into the data segment and the token carries the starting offset; a
    /// character literal carries its (last) byte value. Only `\n` has a
    /// special meaning after a backslash, any other escaped byte stands for
    /// itself.
    fn quoted(&mut self, quote: u8, data: &mut Vec<u8>) -> Token {
        let start = data.len() as i64;
        let mut val = 0i64;
        while let Some(b) = self.peek() {
            if b == quote {
                break;
            }
            self.pos += 1;
            val = if b == b'\\' {
                match self.peek() {
                    Some(b'n') => {
                        self.pos += 1;
                        i64::from(b'\n')
                    }
                    Some(escaped) => {
                        self.pos += 1;
                        i64::from(escaped)
                    }
                    None => break,
                }
            } else {
                i64::from(b)
            };
            if quote == b'"' {
                data.push(val as u8);
            }
        }
        self.eat(quote);
        if quote == b'"' {
            Token::Str(start)
        } else {
            Token::Num(val)
        }
    }
}
