/// Operation codes for the virtual machine.
///
/// The numeric encoding is stable: compiled code stores each opcode as one
/// `i64` cell, optionally followed by a single inline operand cell. Jump
/// targets are indices into the code vector, never raw addresses.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Op {
    /// Load the address of a frame slot: acc = bp + operand cells.
    Lea,
    /// Load an immediate value (or absolute data address) into acc.
    Imm,
    /// Unconditional jump to the operand code index.
    Jmp,
    /// Call: push the return code index, jump to the operand.
    Jsr,
    /// Branch to the operand if acc is zero.
    Bz,
    /// Branch to the operand if acc is non-zero.
    Bnz,
    /// Enter a frame: push bp, bp = sp, reserve operand cells of locals.
    Ent,
    /// Discard operand cells from the stack (pops call arguments).
    Adj,
    /// Leave a frame: sp = bp, pop bp, pop the return index into pc.
    Lev,
    /// acc = cell loaded from the address in acc.
    Li,
    /// acc = byte loaded from the address in acc, sign-extended.
    Lc,
    /// Store acc as a cell through an address popped from the stack.
    Si,
    /// Store acc as a byte through an address popped from the stack.
    Sc,
    /// Push acc onto the stack.
    Psh,
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
    /// Trap: open(path, flags), read-only.
    Open,
    /// Trap: read(fd, buf, count).
    Read,
    /// Trap: close(fd).
    Clos,
    /// Trap: printf(fmt, ...). The inline operand is the pushed argument
    /// count; at most six trailing arguments are consumed.
    Prtf,
    /// Trap: malloc(size) from the VM heap region.
    Malc,
    /// Trap: free(ptr). Accepted and ignored; the pool dies with the VM.
    Free,
    /// Trap: memset(ptr, byte, count).
    Mset,
    /// Trap: memcmp(a, b, count).
    Mcmp,
    /// Trap: terminate with the value on top of the stack.
    Exit,
}

/// All opcodes in encoding order. `Op as i64` indexes into this table.
const OPS: [Op; 39] = [
    Op::Lea,
    Op::Imm,
    Op::Jmp,
    Op::Jsr,
    Op::Bz,
    Op::Bnz,
    Op::Ent,
    Op::Adj,
    Op::Lev,
    Op::Li,
    Op::Lc,
    Op::Si,
    Op::Sc,
    Op::Psh,
    Op::Or,
    Op::Xor,
    Op::And,
    Op::Eq,
    Op::Ne,
    Op::Lt,
    Op::Gt,
    Op::Le,
    Op::Ge,
    Op::Shl,
    Op::Shr,
    Op::Add,
    Op::Sub,
    Op::Mul,
    Op::Div,
    Op::Mod,
    Op::Open,
    Op::Read,
    Op::Clos,
    Op::Prtf,
    Op::Malc,
    Op::Free,
    Op::Mset,
    Op::Mcmp,
    Op::Exit,
];

impl Op {
    /// Whether one inline operand cell follows this opcode.
    pub fn has_operand(self) -> bool {
        self as i64 <= Op::Adj as i64 || self == Op::Prtf
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Lea => "LEA",
            Op::Imm => "IMM",
            Op::Jmp => "JMP",
            Op::Jsr => "JSR",
            Op::Bz => "BZ",
            Op::Bnz => "BNZ",
            Op::Ent => "ENT",
            Op::Adj => "ADJ",
            Op::Lev => "LEV",
            Op::Li => "LI",
            Op::Lc => "LC",
            Op::Si => "SI",
            Op::Sc => "SC",
            Op::Psh => "PSH",
            Op::Or => "OR",
            Op::Xor => "XOR",
            Op::And => "AND",
            Op::Eq => "EQ",
            Op::Ne => "NE",
            Op::Lt => "LT",
            Op::Gt => "GT",
            Op::Le => "LE",
            Op::Ge => "GE",
            Op::Shl => "SHL",
            Op::Shr => "SHR",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Mod => "MOD",
            Op::Open => "OPEN",
            Op::Read => "READ",
            Op::Clos => "CLOS",
            Op::Prtf => "PRTF",
            Op::Malc => "MALC",
            Op::Free => "FREE",
            Op::Mset => "MSET",
            Op::Mcmp => "MCMP",
            Op::Exit => "EXIT",
        }
    }
}

impl TryFrom<i64> for Op {
    type Error = i64;

    fn try_from(code: i64) -> Result<Op, i64> {
        usize::try_from(code)
            .ok()
            .and_then(|idx| OPS.get(idx).copied())
            .ok_or(code)
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Renders a slice of code cells as one instruction per line, the way the
/// listing and trace output present them.
pub fn disassemble(code: &[i64]) -> String {
    let mut out = String::new();
    let mut idx = 0;
    while idx < code.len() {
        match Op::try_from(code[idx]) {
            Ok(op) => {
                out.push_str(&format!("    {:<4}", op.mnemonic()));
                idx += 1;
                if op.has_operand() && idx < code.len() {
                    out.push_str(&format!(" {}", code[idx]));
                    idx += 1;
                }
            }
            Err(raw) => {
                out.push_str(&format!("    ??? {raw}"));
                idx += 1;
            }
        }
        out.push('\n');
    }
    out
}
