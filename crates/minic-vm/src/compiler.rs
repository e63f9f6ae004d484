//! Single-pass compiler from C-subset source text to bytecode.
//!
//! There is no syntax tree. Declarations, statements and expressions emit
//! instructions as they are parsed; forward branches are patched through
//! recorded code indices once their targets are known.

pub mod error;
pub mod lexer;
pub mod symbol;
pub mod ty;

use compact_str::CompactString;

use crate::instruction::Op;
use crate::program::BytecodeProgram;
use error::{CompileError, CompileErrorKind};
use lexer::{Lexer, Prec, Token};
use symbol::{Binding, SymbolId, SymbolKind, SymbolTable};
use ty::{CELL, Type};

/// Receives one callback per source line during compilation, together with
/// the instructions emitted while that line was being parsed.
pub trait ListingSink {
    fn line(&mut self, number: u32, text: &str, code: &[i64]);
}

/// Compiles a full translation unit with the default entry point `main`.
pub fn compile(source: &str) -> Result<BytecodeProgram, CompileError> {
    Compiler::new(source).compile()
}

const KEYWORDS: [(&str, Token); 9] = [
    ("char", Token::Char),
    ("else", Token::Else),
    ("enum", Token::Enum),
    ("if", Token::If),
    ("int", Token::Int),
    ("return", Token::Return),
    ("sizeof", Token::Sizeof),
    ("while", Token::While),
    // There are no void values; the keyword is accepted as a type spelling.
    ("void", Token::Char),
];

const SYSCALLS: [(&str, Op); 9] = [
    ("open", Op::Open),
    ("read", Op::Read),
    ("close", Op::Clos),
    ("printf", Op::Prtf),
    ("malloc", Op::Malc),
    ("free", Op::Free),
    ("memset", Op::Mset),
    ("memcmp", Op::Mcmp),
    ("exit", Op::Exit),
];

#[derive(Copy, Clone, Debug)]
/// What the most recent expression left in the accumulator. An lvalue holds
/// the address of a place and defers the load, so assignment and address-of
/// can consume the address directly.
enum ExprValue {
    Rvalue(Type),
    Lvalue(Type),
}

pub struct Compiler<'a> {
    lexer: Lexer<'a>,
    source: &'a str,
    symbols: SymbolTable,
    token: Token,
    code: Vec<i64>,
    data: Vec<u8>,
    /// Frame slot just above the saved bp of the current function. A local
    /// or parameter at slot `v` lives `frame_base - v` cells from bp.
    frame_base: i64,
    entry: CompactString,
    listing: Option<&'a mut dyn ListingSink>,
    listed_at: usize,
}

impl<'a> Compiler<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut symbols = SymbolTable::default();
        for (name, token) in KEYWORDS {
            let id = symbols.intern(name);
            symbols.bind(
                id,
                Binding {
                    kind: SymbolKind::Keyword(token),
                    ty: Type::INT,
                    value: 0,
                },
            );
        }
        for (name, op) in SYSCALLS {
            let id = symbols.intern(name);
            symbols.bind(
                id,
                Binding {
                    kind: SymbolKind::Syscall,
                    ty: Type::INT,
                    value: op as i64,
                },
            );
        }
        Compiler {
            lexer: Lexer::new(source),
            source,
            symbols,
            token: Token::Eof,
            code: Vec::new(),
            data: Vec::new(),
            frame_base: 0,
            entry: CompactString::new("main"),
            listing: None,
            listed_at: 0,
        }
    }

    /// Overrides the entry function name.
    pub fn with_entry(mut self, name: &str) -> Self {
        self.entry = CompactString::new(name);
        self
    }

    /// Streams a compile-time listing of source lines and their code.
    pub fn with_listing(mut self, sink: &'a mut dyn ListingSink) -> Self {
        self.lexer.track_lines(true);
        self.listing = Some(sink);
        self
    }

    pub fn compile(mut self) -> Result<BytecodeProgram, CompileError> {
        self.advance();
        while self.token != Token::Eof {
            self.declaration()?;
        }
        let entry = match self
            .symbols
            .find(&self.entry)
            .and_then(|id| self.symbols.binding(id))
        {
            Some(binding) if binding.kind == SymbolKind::Function => binding.value as usize,
            _ => {
                return Err(CompileError {
                    kind: CompileErrorKind::EntryPointNotFound(self.entry),
                    line: self.lexer.line(),
                });
            }
        };
        // Return-address stub: when the entry function leaves, its return
        // value becomes the program's exit status.
        let halt = self.code.len();
        self.emit_op(Op::Psh);
        self.emit_op(Op::Exit);
        Ok(BytecodeProgram {
            code: self.code,
            data: self.data,
            entry,
            halt,
        })
    }

    fn advance(&mut self) {
        self.token = self.lexer.next(&mut self.symbols, &mut self.data);
        if self.listing.is_some() {
            for (number, range) in self.lexer.take_lines() {
                let text = &self.source[range];
                let from = self.listed_at;
                self.listed_at = self.code.len();
                if let Some(sink) = self.listing.as_deref_mut() {
                    sink.line(number, text, &self.code[from..]);
                }
            }
        }
    }

    fn err(&self, kind: CompileErrorKind) -> CompileError {
        CompileError {
            kind,
            line: self.lexer.line(),
        }
    }

    /// A syntax error at the current token, or end-of-input if that is what
    /// actually stopped the parse.
    fn syntax(&self, what: &'static str) -> CompileError {
        if self.token == Token::Eof {
            self.err(CompileErrorKind::UnexpectedEof)
        } else {
            self.err(CompileErrorKind::Syntax(what))
        }
    }

    fn expect(&mut self, token: Token, what: &'static str) -> Result<(), CompileError> {
        if self.token == token {
            self.advance();
            Ok(())
        } else {
            Err(self.syntax(what))
        }
    }

    fn duplicate(&self, id: SymbolId) -> CompileError {
        self.err(CompileErrorKind::DuplicateDefinition(
            self.symbols.name(id).into(),
        ))
    }

    fn emit(&mut self, cell: i64) {
        self.code.push(cell);
    }

    fn emit_op(&mut self, op: Op) {
        self.code.push(op as i64);
    }

    fn emit_with(&mut self, op: Op, operand: i64) {
        self.code.push(op as i64);
        self.code.push(operand);
    }

    /// Emits a branch with a placeholder target and returns the index of the
    /// operand cell for a later [`Compiler::patch`].
    fn reserve_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.code.push(-1);
        self.code.len() - 1
    }

    /// Resolves a reserved branch to the current end of code.
    fn patch(&mut self, at: usize) {
        debug_assert_eq!(self.code[at], -1, "patching an unreserved cell");
        self.code[at] = self.code.len() as i64;
    }

    // ----- declarations -----

    fn declaration(&mut self) -> Result<(), CompileError> {
        let base = match self.token {
            Token::Int => {
                self.advance();
                Type::INT
            }
            Token::Char => {
                self.advance();
                Type::CHAR
            }
            Token::Enum => {
                self.advance();
                self.enum_block()?;
                Type::INT
            }
            _ => Type::INT,
        };
        while self.token != Token::Semi && self.token != Token::RBrace {
            let mut ty = base;
            while self.token == Token::Mul {
                self.advance();
                ty = ty.ptr_to();
            }
            let Token::Id(id) = self.token else {
                return Err(self.syntax("bad global declaration"));
            };
            if self.symbols.binding(id).is_some() {
                return Err(self.duplicate(id));
            }
            self.advance();
            if self.token == Token::LParen {
                self.function(id, ty)?;
            } else {
                self.symbols.bind(
                    id,
                    Binding {
                        kind: SymbolKind::Global,
                        ty,
                        value: self.data.len() as i64,
                    },
                );
                // Globals get one zeroed cell regardless of type.
                self.data.extend_from_slice(&[0u8; CELL]);
            }
            if self.token == Token::Comma {
                self.advance();
            }
        }
        // The ';' after globals, or the '}' a function body stopped at.
        self.advance();
        Ok(())
    }

    fn enum_block(&mut self) -> Result<(), CompileError> {
        if let Token::Id(_) = self.token {
            // Enum tags carry no meaning of their own.
            self.advance();
        }
        if self.token != Token::LBrace {
            return Ok(());
        }
        self.advance();
        let mut value = 0i64;
        while self.token != Token::RBrace {
            let Token::Id(id) = self.token else {
                return Err(self.syntax("bad enum identifier"));
            };
            self.advance();
            if self.token == Token::Assign {
                self.advance();
                let Token::Num(explicit) = self.token else {
                    return Err(self.syntax("bad enum initializer"));
                };
                self.advance();
                value = explicit;
            }
            if self.symbols.binding(id).is_some() {
                return Err(self.duplicate(id));
            }
            self.symbols.bind(
                id,
                Binding {
                    kind: SymbolKind::EnumConst,
                    ty: Type::INT,
                    value,
                },
            );
            value = value.wrapping_add(1);
            if self.token == Token::Comma {
                self.advance();
            }
        }
        self.advance();
        Ok(())
    }

    /// Parses a function definition. The name is bound before the body so
    /// the function can call itself; the body's closing brace is left for
    /// [`Compiler::declaration`] to consume.
    fn function(&mut self, id: SymbolId, ty: Type) -> Result<(), CompileError> {
        self.symbols.bind(
            id,
            Binding {
                kind: SymbolKind::Function,
                ty,
                value: self.code.len() as i64,
            },
        );
        self.symbols.push_scope();
        self.advance(); // '('
        let mut slot = 0i64;
        while self.token != Token::RParen {
            let mut pty = match self.token {
                Token::Int => {
                    self.advance();
                    Type::INT
                }
                Token::Char => {
                    self.advance();
                    Type::CHAR
                }
                _ => Type::INT,
            };
            while self.token == Token::Mul {
                self.advance();
                pty = pty.ptr_to();
            }
            let Token::Id(param) = self.token else {
                return Err(self.syntax("bad parameter declaration"));
            };
            if matches!(self.symbols.binding(param), Some(b) if b.kind == SymbolKind::Local) {
                return Err(self.duplicate(param));
            }
            self.advance();
            self.symbols.bind_local(
                param,
                Binding {
                    kind: SymbolKind::Local,
                    ty: pty,
                    value: slot,
                },
            );
            slot += 1;
            if self.token == Token::Comma {
                self.advance();
            }
        }
        self.advance(); // ')'
        let nparams = slot;
        self.frame_base = nparams + 1;
        if self.token != Token::LBrace {
            return Err(self.syntax("bad function definition"));
        }
        self.advance();
        // Local declarations come first, then statements.
        let mut slot = self.frame_base;
        while self.token == Token::Int || self.token == Token::Char {
            let base = if self.token == Token::Int {
                Type::INT
            } else {
                Type::CHAR
            };
            self.advance();
            while self.token != Token::Semi {
                let mut lty = base;
                while self.token == Token::Mul {
                    self.advance();
                    lty = lty.ptr_to();
                }
                let Token::Id(local) = self.token else {
                    return Err(self.syntax("bad local declaration"));
                };
                if matches!(self.symbols.binding(local), Some(b) if b.kind == SymbolKind::Local) {
                    return Err(self.duplicate(local));
                }
                self.advance();
                slot += 1;
                self.symbols.bind_local(
                    local,
                    Binding {
                        kind: SymbolKind::Local,
                        ty: lty,
                        value: slot,
                    },
                );
                if self.token == Token::Comma {
                    self.advance();
                }
            }
            self.advance(); // ';'
        }
        self.emit_with(Op::Ent, slot - self.frame_base);
        while self.token != Token::RBrace {
            if self.token == Token::Eof {
                return Err(self.err(CompileErrorKind::UnexpectedEof));
            }
            self.stmt()?;
        }
        // Falling off the end returns whatever is in the accumulator.
        self.emit_op(Op::Lev);
        self.symbols.pop_scope();
        Ok(())
    }

    // ----- statements -----

    fn stmt(&mut self) -> Result<(), CompileError> {
        match self.token {
            Token::If => {
                self.advance();
                self.expect(Token::LParen, "open paren expected")?;
                self.rvalue_expr(Prec::Assign)?;
                self.expect(Token::RParen, "close paren expected")?;
                let skip = self.reserve_jump(Op::Bz);
                self.stmt()?;
                if self.token == Token::Else {
                    self.advance();
                    let done = self.reserve_jump(Op::Jmp);
                    self.patch(skip);
                    self.stmt()?;
                    self.patch(done);
                } else {
                    self.patch(skip);
                }
                Ok(())
            }
            Token::While => {
                self.advance();
                let start = self.code.len() as i64;
                self.expect(Token::LParen, "open paren expected")?;
                self.rvalue_expr(Prec::Assign)?;
                self.expect(Token::RParen, "close paren expected")?;
                let exit = self.reserve_jump(Op::Bz);
                self.stmt()?;
                self.emit_with(Op::Jmp, start);
                self.patch(exit);
                Ok(())
            }
            Token::Return => {
                self.advance();
                if self.token != Token::Semi {
                    self.rvalue_expr(Prec::Assign)?;
                }
                self.emit_op(Op::Lev);
                self.expect(Token::Semi, "semicolon expected")
            }
            Token::LBrace => {
                self.advance();
                while self.token != Token::RBrace {
                    if self.token == Token::Eof {
                        return Err(self.err(CompileErrorKind::UnexpectedEof));
                    }
                    self.stmt()?;
                }
                self.advance();
                Ok(())
            }
            Token::Semi => {
                self.advance();
                Ok(())
            }
            _ => {
                self.rvalue_expr(Prec::Assign)?;
                self.expect(Token::Semi, "semicolon expected")
            }
        }
    }

    // ----- expressions -----

    /// Loads an lvalue's place into the accumulator; rvalues are already
    /// there. Returns the value's type either way.
    fn load(&mut self, value: ExprValue) -> Type {
        match value {
            ExprValue::Rvalue(ty) => ty,
            ExprValue::Lvalue(ty) => {
                self.emit_op(if ty.is_byte_sized() { Op::Lc } else { Op::Li });
                ty
            }
        }
    }

    /// Parses an expression and forces its value into the accumulator.
    fn rvalue_expr(&mut self, min: Prec) -> Result<Type, CompileError> {
        let value = self.expr(min)?;
        Ok(self.load(value))
    }

    /// Precedence-climbing loop: a unary operand, then every trailing
    /// operator binding at least as tightly as `min`.
    fn expr(&mut self, min: Prec) -> Result<ExprValue, CompileError> {
        let mut value = self.unary()?;
        loop {
            match self.token.precedence() {
                Some(prec) if prec >= min => value = self.binary(value)?,
                _ => return Ok(value),
            }
        }
    }

    fn unary(&mut self) -> Result<ExprValue, CompileError> {
        match self.token {
            Token::Eof => Err(self.err(CompileErrorKind::UnexpectedEof)),
            Token::Num(value) => {
                self.advance();
                self.emit_with(Op::Imm, value);
                Ok(ExprValue::Rvalue(Type::INT))
            }
            Token::Str(offset) => {
                self.advance();
                // Adjacent literals were already appended back to back.
                while let Token::Str(_) = self.token {
                    self.advance();
                }
                self.data.push(0);
                while self.data.len() % CELL != 0 {
                    self.data.push(0);
                }
                self.emit_with(Op::Imm, offset);
                Ok(ExprValue::Rvalue(Type::CHAR.ptr_to()))
            }
            Token::Sizeof => {
                self.advance();
                self.expect(Token::LParen, "open paren expected in sizeof")?;
                let mut ty = Type::INT;
                if self.token == Token::Int {
                    self.advance();
                } else if self.token == Token::Char {
                    self.advance();
                    ty = Type::CHAR;
                }
                while self.token == Token::Mul {
                    self.advance();
                    ty = ty.ptr_to();
                }
                self.expect(Token::RParen, "close paren expected in sizeof")?;
                self.emit_with(Op::Imm, ty.size());
                Ok(ExprValue::Rvalue(Type::INT))
            }
            Token::Id(id) => self.identifier(id),
            Token::LParen => {
                self.advance();
                if self.token == Token::Int || self.token == Token::Char {
                    // Cast: the operand loads at its own width, only the
                    // static type changes.
                    let mut ty = if self.token == Token::Int {
                        Type::INT
                    } else {
                        Type::CHAR
                    };
                    self.advance();
                    while self.token == Token::Mul {
                        self.advance();
                        ty = ty.ptr_to();
                    }
                    self.expect(Token::RParen, "bad cast")?;
                    let value = self.expr(Prec::Postfix)?;
                    self.load(value);
                    Ok(ExprValue::Rvalue(ty))
                } else {
                    let value = self.expr(Prec::Assign)?;
                    self.expect(Token::RParen, "close paren expected")?;
                    Ok(value)
                }
            }
            Token::Mul => {
                self.advance();
                let ty = self.rvalue_expr(Prec::Postfix)?;
                match ty.deref() {
                    Some(inner) => Ok(ExprValue::Lvalue(inner)),
                    None => Err(self.err(CompileErrorKind::BadDereference)),
                }
            }
            Token::And => {
                self.advance();
                match self.expr(Prec::Postfix)? {
                    // The address is already in the accumulator.
                    ExprValue::Lvalue(ty) => Ok(ExprValue::Rvalue(ty.ptr_to())),
                    ExprValue::Rvalue(_) => Err(self.err(CompileErrorKind::BadAddressOf)),
                }
            }
            Token::Not => {
                self.advance();
                self.rvalue_expr(Prec::Postfix)?;
                self.emit_op(Op::Psh);
                self.emit_with(Op::Imm, 0);
                self.emit_op(Op::Eq);
                Ok(ExprValue::Rvalue(Type::INT))
            }
            Token::Tilde => {
                self.advance();
                self.rvalue_expr(Prec::Postfix)?;
                self.emit_op(Op::Psh);
                self.emit_with(Op::Imm, -1);
                self.emit_op(Op::Xor);
                Ok(ExprValue::Rvalue(Type::INT))
            }
            Token::Add => {
                self.advance();
                self.rvalue_expr(Prec::Postfix)?;
                Ok(ExprValue::Rvalue(Type::INT))
            }
            Token::Sub => {
                self.advance();
                if let Token::Num(value) = self.token {
                    self.advance();
                    self.emit_with(Op::Imm, value.wrapping_neg());
                } else {
                    self.emit_with(Op::Imm, -1);
                    self.emit_op(Op::Psh);
                    self.rvalue_expr(Prec::Postfix)?;
                    self.emit_op(Op::Mul);
                }
                Ok(ExprValue::Rvalue(Type::INT))
            }
            Token::Inc | Token::Dec => {
                let token = self.token;
                self.advance();
                let ExprValue::Lvalue(ty) = self.expr(Prec::Postfix)? else {
                    return Err(self.err(CompileErrorKind::BadLvalue));
                };
                self.emit_op(Op::Psh);
                self.load(ExprValue::Lvalue(ty));
                self.emit_op(Op::Psh);
                self.emit_with(Op::Imm, ty.step());
                self.emit_op(if token == Token::Inc { Op::Add } else { Op::Sub });
                self.emit_op(if ty.is_byte_sized() { Op::Sc } else { Op::Si });
                Ok(ExprValue::Rvalue(ty))
            }
            _ => Err(self.err(CompileErrorKind::Syntax("bad expression"))),
        }
    }

    /// A name in operand position: a call, an enum constant, or a variable
    /// reference (which stays an lvalue until someone needs its value).
    fn identifier(&mut self, id: SymbolId) -> Result<ExprValue, CompileError> {
        self.advance();
        if self.token == Token::LParen {
            return self.call(id);
        }
        let Some(binding) = self.symbols.binding(id).copied() else {
            return Err(self.err(CompileErrorKind::UnboundIdentifier(
                self.symbols.name(id).into(),
            )));
        };
        match binding.kind {
            SymbolKind::EnumConst => {
                self.emit_with(Op::Imm, binding.value);
                Ok(ExprValue::Rvalue(Type::INT))
            }
            SymbolKind::Local => {
                self.emit_with(Op::Lea, self.frame_base - binding.value);
                Ok(ExprValue::Lvalue(binding.ty))
            }
            SymbolKind::Global => {
                self.emit_with(Op::Imm, binding.value);
                Ok(ExprValue::Lvalue(binding.ty))
            }
            _ => Err(self.err(CompileErrorKind::UnboundIdentifier(
                self.symbols.name(id).into(),
            ))),
        }
    }

    fn call(&mut self, id: SymbolId) -> Result<ExprValue, CompileError> {
        self.advance(); // '('
        let mut nargs = 0i64;
        while self.token != Token::RParen {
            self.rvalue_expr(Prec::Assign)?;
            self.emit_op(Op::Psh);
            nargs += 1;
            if self.token == Token::Comma {
                self.advance();
            }
        }
        self.advance();
        let Some(binding) = self.symbols.binding(id).copied() else {
            return Err(self.err(CompileErrorKind::UnboundIdentifier(
                self.symbols.name(id).into(),
            )));
        };
        match binding.kind {
            SymbolKind::Syscall => {
                if binding.value == Op::Prtf as i64 {
                    self.emit_with(Op::Prtf, nargs);
                } else {
                    self.emit(binding.value);
                }
            }
            SymbolKind::Function => self.emit_with(Op::Jsr, binding.value),
            _ => {
                return Err(self.err(CompileErrorKind::NotAFunction(
                    self.symbols.name(id).into(),
                )));
            }
        }
        if nargs > 0 {
            self.emit_with(Op::Adj, nargs);
        }
        Ok(ExprValue::Rvalue(binding.ty))
    }

    /// Compiles one binary or postfix operator whose left operand has been
    /// parsed. The operand-stack discipline is fixed: the left value is
    /// pushed, the right value computed into the accumulator, then the
    /// operator pops its left operand.
    fn binary(&mut self, lhs: ExprValue) -> Result<ExprValue, CompileError> {
        match self.token {
            Token::Assign => {
                let ExprValue::Lvalue(ty) = lhs else {
                    return Err(self.err(CompileErrorKind::BadLvalue));
                };
                self.advance();
                self.emit_op(Op::Psh);
                self.rvalue_expr(Prec::Assign)?;
                self.emit_op(if ty.is_byte_sized() { Op::Sc } else { Op::Si });
                Ok(ExprValue::Rvalue(ty))
            }
            Token::Cond => {
                self.load(lhs);
                self.advance();
                let skip = self.reserve_jump(Op::Bz);
                self.rvalue_expr(Prec::Assign)?;
                self.expect(Token::Colon, "conditional missing colon")?;
                let done = self.reserve_jump(Op::Jmp);
                self.patch(skip);
                let ty = self.rvalue_expr(Prec::Cond)?;
                self.patch(done);
                Ok(ExprValue::Rvalue(ty))
            }
            Token::Lor => {
                self.load(lhs);
                self.advance();
                let short = self.reserve_jump(Op::Bnz);
                self.rvalue_expr(Prec::Lan)?;
                self.patch(short);
                Ok(ExprValue::Rvalue(Type::INT))
            }
            Token::Lan => {
                self.load(lhs);
                self.advance();
                let short = self.reserve_jump(Op::Bz);
                self.rvalue_expr(Prec::Or)?;
                self.patch(short);
                Ok(ExprValue::Rvalue(Type::INT))
            }
            Token::Or => self.arith(lhs, Op::Or, Prec::Xor),
            Token::Xor => self.arith(lhs, Op::Xor, Prec::And),
            Token::And => self.arith(lhs, Op::And, Prec::Equality),
            Token::Eq => self.arith(lhs, Op::Eq, Prec::Relational),
            Token::Ne => self.arith(lhs, Op::Ne, Prec::Relational),
            Token::Lt => self.arith(lhs, Op::Lt, Prec::Shift),
            Token::Gt => self.arith(lhs, Op::Gt, Prec::Shift),
            Token::Le => self.arith(lhs, Op::Le, Prec::Shift),
            Token::Ge => self.arith(lhs, Op::Ge, Prec::Shift),
            Token::Shl => self.arith(lhs, Op::Shl, Prec::Additive),
            Token::Shr => self.arith(lhs, Op::Shr, Prec::Additive),
            Token::Mul => self.arith(lhs, Op::Mul, Prec::Postfix),
            Token::Div => self.arith(lhs, Op::Div, Prec::Postfix),
            Token::Mod => self.arith(lhs, Op::Mod, Prec::Postfix),
            Token::Add => {
                let lty = self.load(lhs);
                self.advance();
                self.emit_op(Op::Psh);
                self.rvalue_expr(Prec::Multiplicative)?;
                // Pointer arithmetic scales by the element width; char
                // pointers step by single bytes and need no scaling.
                if lty.is_pointer() && lty.element_size() > 1 {
                    self.emit_op(Op::Psh);
                    self.emit_with(Op::Imm, lty.element_size());
                    self.emit_op(Op::Mul);
                }
                self.emit_op(Op::Add);
                Ok(ExprValue::Rvalue(lty))
            }
            Token::Sub => {
                let lty = self.load(lhs);
                self.advance();
                self.emit_op(Op::Psh);
                let rty = self.rvalue_expr(Prec::Multiplicative)?;
                if lty.is_pointer() && lty == rty {
                    // Pointer difference counts elements, not bytes.
                    self.emit_op(Op::Sub);
                    if lty.element_size() > 1 {
                        self.emit_op(Op::Psh);
                        self.emit_with(Op::Imm, lty.element_size());
                        self.emit_op(Op::Div);
                    }
                    Ok(ExprValue::Rvalue(Type::INT))
                } else {
                    if lty.is_pointer() && lty.element_size() > 1 {
                        self.emit_op(Op::Psh);
                        self.emit_with(Op::Imm, lty.element_size());
                        self.emit_op(Op::Mul);
                    }
                    self.emit_op(Op::Sub);
                    Ok(ExprValue::Rvalue(lty))
                }
            }
            Token::Inc | Token::Dec => {
                let token = self.token;
                let ExprValue::Lvalue(ty) = lhs else {
                    return Err(self.err(CompileErrorKind::BadLvalue));
                };
                self.advance();
                // Store the stepped value, then undo the step so the
                // expression yields the original.
                self.emit_op(Op::Psh);
                self.load(ExprValue::Lvalue(ty));
                self.emit_op(Op::Psh);
                self.emit_with(Op::Imm, ty.step());
                self.emit_op(if token == Token::Inc { Op::Add } else { Op::Sub });
                self.emit_op(if ty.is_byte_sized() { Op::Sc } else { Op::Si });
                self.emit_op(Op::Psh);
                self.emit_with(Op::Imm, ty.step());
                self.emit_op(if token == Token::Inc { Op::Sub } else { Op::Add });
                Ok(ExprValue::Rvalue(ty))
            }
            Token::Brak => {
                let lty = self.load(lhs);
                self.advance();
                self.emit_op(Op::Psh);
                self.rvalue_expr(Prec::Assign)?;
                self.expect(Token::RBrak, "close bracket expected")?;
                let Some(element) = lty.deref() else {
                    return Err(self.err(CompileErrorKind::BadDereference));
                };
                if lty.element_size() > 1 {
                    self.emit_op(Op::Psh);
                    self.emit_with(Op::Imm, lty.element_size());
                    self.emit_op(Op::Mul);
                }
                self.emit_op(Op::Add);
                Ok(ExprValue::Lvalue(element))
            }
            _ => Ok(lhs),
        }
    }

    /// The shared shape of plain binary operators: push left, compute right
    /// at the operator's right-operand precedence, emit one instruction.
    fn arith(&mut self, lhs: ExprValue, op: Op, rhs: Prec) -> Result<ExprValue, CompileError> {
        self.load(lhs);
        self.advance();
        self.emit_op(Op::Psh);
        self.rvalue_expr(rhs)?;
        self.emit_op(op);
        Ok(ExprValue::Rvalue(Type::INT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(pairs: &[(Op, Option<i64>)]) -> Vec<i64> {
        let mut out = Vec::new();
        for (op, operand) in pairs {
            out.push(*op as i64);
            if let Some(value) = operand {
                out.push(*value);
            }
        }
        out
    }

    /// Walks the code stream and checks that every branch target lands on
    /// an instruction boundary inside the program.
    fn assert_branches_resolved(code: &[i64]) {
        let mut boundaries = vec![false; code.len() + 1];
        let mut idx = 0;
        while idx < code.len() {
            boundaries[idx] = true;
            let op = Op::try_from(code[idx]).expect("invalid opcode in stream");
            idx += 1;
            if op.has_operand() {
                idx += 1;
            }
        }
        boundaries[code.len()] = true;
        let mut idx = 0;
        while idx < code.len() {
            let op = Op::try_from(code[idx]).unwrap();
            idx += 1;
            if op.has_operand() {
                if matches!(op, Op::Jmp | Op::Jsr | Op::Bz | Op::Bnz) {
                    let target = code[idx];
                    assert!(
                        (0..=code.len() as i64).contains(&target) && boundaries[target as usize],
                        "branch to {target} is not an instruction boundary"
                    );
                }
                idx += 1;
            }
        }
    }

    #[test]
    fn trivial_main_compiles_to_a_frame_and_a_halt_stub() {
        let program = compile("int main() { return 7; }").unwrap();
        assert_eq!(
            program.code,
            ops(&[
                (Op::Ent, Some(0)),
                (Op::Imm, Some(7)),
                (Op::Lev, None),
                (Op::Lev, None),
                (Op::Psh, None),
                (Op::Exit, None),
            ])
        );
        assert_eq!(program.entry, 0);
        assert_eq!(program.halt, 6);
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let program = compile("int main() { return 1 + 2 * 3; }").unwrap();
        assert_eq!(
            program.code[2..12],
            ops(&[
                (Op::Imm, Some(1)),
                (Op::Psh, None),
                (Op::Imm, Some(2)),
                (Op::Psh, None),
                (Op::Imm, Some(3)),
                (Op::Mul, None),
                (Op::Add, None),
            ])[..]
        );
    }

    #[test]
    fn if_branches_are_patched_past_the_then_block() {
        let program = compile("int main() { if (1) return 2; return 3; }").unwrap();
        // ENT 0; IMM 1; BZ 9; IMM 2; LEV; IMM 3; LEV; LEV
        assert_eq!(program.code[4], Op::Bz as i64);
        assert_eq!(program.code[5], 9);
        assert_branches_resolved(&program.code);
    }

    #[test]
    fn while_jumps_back_to_the_condition() {
        let program =
            compile("int main() { int i; i = 0; while (i < 10) i = i + 1; return i; }").unwrap();
        assert_branches_resolved(&program.code);
        // The loop's JMP goes backwards.
        let jmp = program
            .code
            .iter()
            .position(|&c| c == Op::Jmp as i64)
            .unwrap();
        assert!(program.code[jmp + 1] < jmp as i64);
    }

    #[test]
    fn locals_load_through_negative_frame_offsets() {
        let program = compile("int main(int a, int b) { int c; return c; }").unwrap();
        // Two params, one local: ENT 1, then LEA -1 for the local.
        assert_eq!(program.code[0..2], [Op::Ent as i64, 1]);
        assert_eq!(program.code[2..5], [Op::Lea as i64, -1, Op::Li as i64]);
    }

    #[test]
    fn parameters_sit_above_the_frame_pointer() {
        let program = compile("int main(int a, int b) { return b; }").unwrap();
        // frame base 3: a at slot 0 -> LEA 3, b at slot 1 -> LEA 2.
        assert_eq!(program.code[2..5], [Op::Lea as i64, 2, Op::Li as i64]);
    }

    #[test]
    fn int_pointer_indexing_scales_by_the_cell_width() {
        let program = compile("int main(int *p) { return p[2]; }").unwrap();
        assert_eq!(
            program.code[2..],
            ops(&[
                (Op::Lea, Some(2)),
                (Op::Li, None),
                (Op::Psh, None),
                (Op::Imm, Some(2)),
                (Op::Psh, None),
                (Op::Imm, Some(8)),
                (Op::Mul, None),
                (Op::Add, None),
                (Op::Li, None),
                (Op::Lev, None),
                (Op::Lev, None),
                (Op::Psh, None),
                (Op::Exit, None),
            ])[..]
        );
    }

    #[test]
    fn char_pointer_indexing_is_unscaled_and_loads_a_byte() {
        let program = compile("int main(char *s) { return s[1]; }").unwrap();
        assert_eq!(
            program.code[2..10],
            ops(&[
                (Op::Lea, Some(2)),
                (Op::Li, None),
                (Op::Psh, None),
                (Op::Imm, Some(1)),
                (Op::Add, None),
                (Op::Lc, None),
            ])[..]
        );
    }

    #[test]
    fn assignment_pushes_the_address_before_the_value() {
        let program = compile("int x; int main() { x = 5; return x; }").unwrap();
        assert_eq!(
            program.code[2..8],
            ops(&[
                (Op::Imm, Some(0)),
                (Op::Psh, None),
                (Op::Imm, Some(5)),
                (Op::Si, None),
            ])[..]
        );
    }

    #[test]
    fn char_stores_use_the_byte_instruction() {
        let program = compile("char c; int main() { c = 65; return c; }").unwrap();
        assert!(program.code.contains(&(Op::Sc as i64)));
        assert!(program.code.contains(&(Op::Lc as i64)));
    }

    #[test]
    fn string_literals_are_padded_and_shared_in_order() {
        let program = compile("int main() { return \"ab\"; }").unwrap();
        assert_eq!(&program.data[0..3], b"ab\0");
        assert_eq!(program.data.len(), 8);
    }

    #[test]
    fn adjacent_string_literals_concatenate() {
        let program = compile("int main() { return \"ab\" \"cd\"; }").unwrap();
        assert_eq!(&program.data[0..5], b"abcd\0");
        assert_eq!(program.data.len(), 8);
        // One immediate pointing at the start of the merged literal.
        assert_eq!(program.code[2..4], [Op::Imm as i64, 0]);
    }

    #[test]
    fn enum_constants_fold_to_immediates() {
        let program = compile("enum { A, B = 5, C }; int main() { return C; }").unwrap();
        assert_eq!(program.code[2..4], [Op::Imm as i64, 6]);
    }

    #[test]
    fn sizeof_reports_bytes() {
        let program = compile("int main() { return sizeof(char *) + sizeof(char); }").unwrap();
        assert_eq!(program.code[3], 8);
        assert_eq!(program.code[6], 1);
    }

    #[test]
    fn calls_push_arguments_then_adjust() {
        let program =
            compile("int add(int a, int b) { return a + b; } int main() { return add(2, 3); }")
                .unwrap();
        let main = program.entry;
        assert_eq!(
            program.code[main..main + 12],
            ops(&[
                (Op::Ent, Some(0)),
                (Op::Imm, Some(2)),
                (Op::Psh, None),
                (Op::Imm, Some(3)),
                (Op::Psh, None),
                (Op::Jsr, Some(0)),
                (Op::Adj, Some(2)),
            ])[..]
        );
    }

    #[test]
    fn printf_carries_its_argument_count() {
        let program = compile("int main() { printf(\"%d\", 42); return 0; }").unwrap();
        let prtf = program
            .code
            .iter()
            .position(|&c| c == Op::Prtf as i64)
            .unwrap();
        assert_eq!(program.code[prtf + 1], 2);
        assert_eq!(program.code[prtf + 2], Op::Adj as i64);
    }

    #[test]
    fn compilation_is_deterministic() {
        let src = "int g; int f(int x) { return x * g; } int main() { g = 3; return f(4); }";
        let a = compile(src).unwrap();
        let b = compile(src).unwrap();
        assert_eq!(a.code, b.code);
        assert_eq!(a.data, b.data);
        assert_eq!(a.entry, b.entry);
    }

    #[test]
    fn entry_name_is_configurable() {
        let program = Compiler::new("int start() { return 1; }")
            .with_entry("start")
            .compile()
            .unwrap();
        assert_eq!(program.entry, 0);
    }

    #[test]
    fn missing_entry_point_is_reported() {
        let err = compile("int helper() { return 1; }").unwrap_err();
        assert_eq!(
            err.kind,
            CompileErrorKind::EntryPointNotFound("main".into())
        );
    }

    #[test]
    fn undefined_variables_name_the_line() {
        let err = compile("int main() {\n  return missing;\n}").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnboundIdentifier("missing".into()));
        assert_eq!(err.line, 2);
    }

    #[test]
    fn dereferencing_an_int_is_an_error() {
        let err = compile("int main(int x) { return *x; }").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::BadDereference);
        assert_eq!(err.line, 1);
    }

    #[test]
    fn assigning_to_a_literal_is_an_error() {
        let err = compile("int main() { 1 = 2; return 0; }").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::BadLvalue);
    }

    #[test]
    fn address_of_needs_a_place() {
        let err = compile("int main() { return &1; }").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::BadAddressOf);
    }

    #[test]
    fn duplicate_globals_are_rejected() {
        let err = compile("int x; int x; int main() { return 0; }").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::DuplicateDefinition("x".into()));
    }

    #[test]
    fn duplicate_parameters_are_rejected() {
        let err = compile("int f(int a, int a) { return a; } int main() { return 0; }").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::DuplicateDefinition("a".into()));
    }

    #[test]
    fn locals_shadow_globals_inside_the_function_only() {
        let src = "int x;
            int f() { int x; x = 1; return x; }
            int main() { x = 9; return x; }";
        let program = compile(src).unwrap();
        // main's accesses go through IMM (global address), f's through LEA.
        let main = program.entry;
        assert_eq!(program.code[main + 2], Op::Imm as i64);
        assert_branches_resolved(&program.code);
    }

    #[test]
    fn truncated_input_reports_eof() {
        let err = compile("int main() { return 1 +").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnexpectedEof);
    }

    #[test]
    fn listing_reports_lines_with_their_code() {
        struct Collect(Vec<(u32, String, usize)>);
        impl ListingSink for Collect {
            fn line(&mut self, number: u32, text: &str, code: &[i64]) {
                self.0.push((number, text.to_string(), code.len()));
            }
        }
        let mut sink = Collect(Vec::new());
        Compiler::new("int main() {\n  return 4;\n}\n")
            .with_listing(&mut sink)
            .compile()
            .unwrap();
        let numbers: Vec<u32> = sink.0.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(sink.0[1].1.contains("return 4"));
        // All code emitted inside main is attributed to some line.
        let total: usize = sink.0.iter().map(|(_, _, n)| n).sum();
        assert!(total >= 4);
    }
}
