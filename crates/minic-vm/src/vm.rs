//! Stack-based bytecode interpreter.
//!
//! Memory is one flat byte vector laid out as data, heap, then stack, with
//! the stack growing downward from the top. All guest addresses are byte
//! offsets into that vector and every access is bounds checked, so a buggy
//! guest program stops with a [`RuntimeError`] instead of corrupting the
//! host.

use std::fs::File;
use std::io::Read;

use crate::instruction::Op;
use crate::program::BytecodeProgram;
use crate::compiler::ty::CELL;

/// Default bytes reserved for `malloc`.
pub const HEAP_SIZE: usize = 256 * 1024;
/// Default bytes reserved for the call stack.
pub const STACK_SIZE: usize = 256 * 1024;

/// Guest file descriptors start here; 0 through 2 are never handed out.
const FD_BASE: i64 = 3;

/// `printf` consumes at most this many conversion arguments.
const MAX_PRINTF_ARGS: i64 = 6;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RuntimeError {
    /// A fetched code cell is not a valid opcode.
    UnknownInstruction { code: i64, cycle: u64 },
    /// A load, store or jump left the guest's memory.
    OutOfBounds { addr: i64, cycle: u64 },
    StackOverflow { cycle: u64 },
    DivisionByZero { cycle: u64 },
    /// The heap could not hold the entry frame's argument strings.
    HeapExhausted { cycle: u64 },
}

impl std::error::Error for RuntimeError {}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::UnknownInstruction { code, cycle } => {
                write!(f, "unknown instruction {code} (cycle {cycle})")
            }
            RuntimeError::OutOfBounds { addr, cycle } => {
                write!(f, "memory access out of bounds at {addr} (cycle {cycle})")
            }
            RuntimeError::StackOverflow { cycle } => write!(f, "stack overflow (cycle {cycle})"),
            RuntimeError::DivisionByZero { cycle } => write!(f, "division by zero (cycle {cycle})"),
            RuntimeError::HeapExhausted { cycle } => write!(f, "heap exhausted (cycle {cycle})"),
        }
    }
}

/// Receives one callback per executed instruction.
pub trait TraceSink {
    fn instruction(&mut self, cycle: u64, op: Op, operand: Option<i64>);
}

pub struct Vm<'a> {
    program: &'a BytecodeProgram,
    memory: Vec<u8>,
    /// Bump pointer for `malloc`; nothing is ever given back.
    heap_next: usize,
    heap_end: usize,
    /// Lowest byte the stack may grow down to (the end of the heap).
    stack_floor: usize,
    pc: usize,
    sp: usize,
    bp: usize,
    acc: i64,
    cycle: u64,
    /// Open guest files; descriptor = slot index + [`FD_BASE`].
    files: Vec<Option<File>>,
}

impl<'a> Vm<'a> {
    pub fn new(program: &'a BytecodeProgram) -> Self {
        Vm::with_pools(program, HEAP_SIZE, STACK_SIZE)
    }

    /// A VM with explicit heap and stack sizes in bytes.
    pub fn with_pools(program: &'a BytecodeProgram, heap: usize, stack: usize) -> Self {
        // Keep address zero out of the heap so the first malloc cannot
        // return a null pointer.
        let heap_base = program.data.len().max(1).div_ceil(CELL) * CELL;
        let heap_end = heap_base + heap.div_ceil(CELL) * CELL;
        let size = heap_end + stack.div_ceil(CELL) * CELL;
        let mut memory = vec![0u8; size];
        memory[..program.data.len()].copy_from_slice(&program.data);
        Vm {
            program,
            memory,
            heap_next: heap_base,
            heap_end,
            stack_floor: heap_end,
            pc: program.entry,
            sp: size,
            bp: size,
            acc: 0,
            cycle: 0,
            files: Vec::new(),
        }
    }

    /// Runs the program to completion. `args` become the entry function's
    /// `argc`/`argv`; by convention the first one is the program name.
    pub fn run(&mut self, args: &[&str]) -> Result<i64, RuntimeError> {
        self.execute(args, None)
    }

    /// Like [`Vm::run`], reporting every executed instruction to `trace`.
    pub fn run_traced(
        &mut self,
        args: &[&str],
        trace: &mut dyn TraceSink,
    ) -> Result<i64, RuntimeError> {
        self.execute(args, Some(trace))
    }

    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    fn oob(&self, addr: i64) -> RuntimeError {
        RuntimeError::OutOfBounds {
            addr,
            cycle: self.cycle,
        }
    }

    fn check_range(&self, addr: i64, len: usize) -> Result<usize, RuntimeError> {
        let start = usize::try_from(addr).map_err(|_| self.oob(addr))?;
        match start.checked_add(len) {
            Some(end) if end <= self.memory.len() => Ok(start),
            _ => Err(self.oob(addr)),
        }
    }

    fn load_cell(&self, addr: i64) -> Result<i64, RuntimeError> {
        let at = self.check_range(addr, CELL)?;
        let mut buf = [0u8; CELL];
        buf.copy_from_slice(&self.memory[at..at + CELL]);
        Ok(i64::from_le_bytes(buf))
    }

    fn store_cell(&mut self, addr: i64, value: i64) -> Result<(), RuntimeError> {
        let at = self.check_range(addr, CELL)?;
        self.memory[at..at + CELL].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn load_byte(&self, addr: i64) -> Result<i64, RuntimeError> {
        let at = self.check_range(addr, 1)?;
        Ok(i64::from(self.memory[at] as i8))
    }

    fn store_byte(&mut self, addr: i64, value: i64) -> Result<(), RuntimeError> {
        let at = self.check_range(addr, 1)?;
        self.memory[at] = value as u8;
        Ok(())
    }

    fn push(&mut self, value: i64) -> Result<(), RuntimeError> {
        if self.sp < self.stack_floor + CELL {
            return Err(RuntimeError::StackOverflow { cycle: self.cycle });
        }
        self.sp -= CELL;
        self.memory[self.sp..self.sp + CELL].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn pop(&mut self) -> Result<i64, RuntimeError> {
        let value = self.load_cell(self.sp as i64)?;
        self.sp += CELL;
        Ok(value)
    }

    fn jump(&mut self, target: i64) -> Result<(), RuntimeError> {
        match usize::try_from(target) {
            Ok(idx) if idx <= self.program.code.len() => {
                self.pc = idx;
                Ok(())
            }
            _ => Err(self.oob(target)),
        }
    }

    fn fetch(&mut self) -> Result<i64, RuntimeError> {
        let cell = self
            .program
            .code
            .get(self.pc)
            .copied()
            .ok_or_else(|| self.oob(self.pc as i64))?;
        self.pc += 1;
        Ok(cell)
    }

    /// The trap argument `idx` cells above the stack pointer. Traps read
    /// their arguments in place; the following `ADJ` discards them.
    fn trap_arg(&self, idx: i64) -> Result<i64, RuntimeError> {
        self.load_cell(self.sp as i64 + idx * CELL as i64)
    }

    /// The NUL-terminated byte string starting at `addr`.
    fn c_string(&self, addr: i64) -> Result<&[u8], RuntimeError> {
        let start = self.check_range(addr, 1)?;
        let tail = &self.memory[start..];
        match tail.iter().position(|&b| b == 0) {
            Some(len) => Ok(&tail[..len]),
            None => Err(self.oob(addr)),
        }
    }

    /// Allocates `size` bytes from the heap, rounded up to whole cells.
    /// Returns 0 when the heap is exhausted.
    fn alloc(&mut self, size: i64) -> i64 {
        let Ok(size) = usize::try_from(size) else {
            return 0;
        };
        let size = size.div_ceil(CELL) * CELL;
        if self.heap_end - self.heap_next < size {
            return 0;
        }
        let ptr = self.heap_next;
        self.heap_next += size;
        ptr as i64
    }

    /// Allocates like [`Vm::alloc`] but treats exhaustion as fatal. Guest
    /// `malloc` keeps returning 0; only host-side setup uses this.
    fn host_alloc(&mut self, size: i64) -> Result<i64, RuntimeError> {
        match self.alloc(size) {
            0 => Err(RuntimeError::HeapExhausted { cycle: self.cycle }),
            addr => Ok(addr),
        }
    }

    /// Copies the argument strings into the heap and pushes the entry
    /// function's frame: argc, argv, then the halt stub as return address.
    fn push_entry_frame(&mut self, args: &[&str]) -> Result<(), RuntimeError> {
        let mut pointers = Vec::with_capacity(args.len());
        for arg in args {
            let addr = self.host_alloc(arg.len() as i64 + 1)?;
            let at = self.check_range(addr, arg.len() + 1)?;
            self.memory[at..at + arg.len()].copy_from_slice(arg.as_bytes());
            pointers.push(addr);
        }
        let argv = self.host_alloc((args.len().max(1) * CELL) as i64)?;
        for (idx, ptr) in pointers.iter().enumerate() {
            self.store_cell(argv + (idx * CELL) as i64, *ptr)?;
        }
        self.push(args.len() as i64)?;
        self.push(argv)?;
        self.push(self.program.halt as i64)?;
        self.bp = self.sp;
        self.pc = self.program.entry;
        Ok(())
    }

    fn execute(
        &mut self,
        args: &[&str],
        mut trace: Option<&mut dyn TraceSink>,
    ) -> Result<i64, RuntimeError> {
        self.push_entry_frame(args)?;
        loop {
            let raw = self.fetch()?;
            self.cycle += 1;
            let op = Op::try_from(raw).map_err(|code| RuntimeError::UnknownInstruction {
                code,
                cycle: self.cycle,
            })?;
            let operand = if op.has_operand() {
                Some(self.fetch()?)
            } else {
                None
            };
            if let Some(sink) = trace.as_deref_mut() {
                sink.instruction(self.cycle, op, operand);
            }
            let arg = operand.unwrap_or(0);
            match op {
                Op::Lea => {
                    self.acc = (self.bp as i64).wrapping_add(arg.wrapping_mul(CELL as i64));
                }
                Op::Imm => self.acc = arg,
                Op::Jmp => self.jump(arg)?,
                Op::Jsr => {
                    self.push(self.pc as i64)?;
                    self.jump(arg)?;
                }
                Op::Bz => {
                    if self.acc == 0 {
                        self.jump(arg)?;
                    }
                }
                Op::Bnz => {
                    if self.acc != 0 {
                        self.jump(arg)?;
                    }
                }
                Op::Ent => {
                    self.push(self.bp as i64)?;
                    self.bp = self.sp;
                    let bytes = usize::try_from(arg)
                        .ok()
                        .and_then(|n| n.checked_mul(CELL))
                        .ok_or(RuntimeError::StackOverflow { cycle: self.cycle })?;
                    match self.sp.checked_sub(bytes) {
                        Some(sp) if sp >= self.stack_floor => self.sp = sp,
                        _ => return Err(RuntimeError::StackOverflow { cycle: self.cycle }),
                    }
                }
                Op::Adj => {
                    let bytes = usize::try_from(arg)
                        .ok()
                        .and_then(|n| n.checked_mul(CELL))
                        .ok_or_else(|| self.oob(arg))?;
                    match self.sp.checked_add(bytes) {
                        Some(sp) if sp <= self.memory.len() => self.sp = sp,
                        _ => return Err(self.oob(arg)),
                    }
                }
                Op::Lev => {
                    self.sp = self.bp;
                    let saved = self.pop()?;
                    self.bp = usize::try_from(saved).map_err(|_| self.oob(saved))?;
                    let ret = self.pop()?;
                    self.jump(ret)?;
                }
                Op::Li => self.acc = self.load_cell(self.acc)?,
                Op::Lc => self.acc = self.load_byte(self.acc)?,
                Op::Si => {
                    let addr = self.pop()?;
                    self.store_cell(addr, self.acc)?;
                }
                Op::Sc => {
                    let addr = self.pop()?;
                    self.store_byte(addr, self.acc)?;
                    self.acc = i64::from(self.acc as i8);
                }
                Op::Psh => self.push(self.acc)?,
                Op::Or => {
                    let left = self.pop()?;
                    self.acc = left | self.acc;
                }
                Op::Xor => {
                    let left = self.pop()?;
                    self.acc = left ^ self.acc;
                }
                Op::And => {
                    let left = self.pop()?;
                    self.acc = left & self.acc;
                }
                Op::Eq => {
                    let left = self.pop()?;
                    self.acc = i64::from(left == self.acc);
                }
                Op::Ne => {
                    let left = self.pop()?;
                    self.acc = i64::from(left != self.acc);
                }
                Op::Lt => {
                    let left = self.pop()?;
                    self.acc = i64::from(left < self.acc);
                }
                Op::Gt => {
                    let left = self.pop()?;
                    self.acc = i64::from(left > self.acc);
                }
                Op::Le => {
                    let left = self.pop()?;
                    self.acc = i64::from(left <= self.acc);
                }
                Op::Ge => {
                    let left = self.pop()?;
                    self.acc = i64::from(left >= self.acc);
                }
                Op::Shl => {
                    let left = self.pop()?;
                    self.acc = left.wrapping_shl((self.acc & 63) as u32);
                }
                Op::Shr => {
                    let left = self.pop()?;
                    self.acc = left.wrapping_shr((self.acc & 63) as u32);
                }
                Op::Add => {
                    let left = self.pop()?;
                    self.acc = left.wrapping_add(self.acc);
                }
                Op::Sub => {
                    let left = self.pop()?;
                    self.acc = left.wrapping_sub(self.acc);
                }
                Op::Mul => {
                    let left = self.pop()?;
                    self.acc = left.wrapping_mul(self.acc);
                }
                Op::Div => {
                    let left = self.pop()?;
                    if self.acc == 0 {
                        return Err(RuntimeError::DivisionByZero { cycle: self.cycle });
                    }
                    self.acc = left.wrapping_div(self.acc);
                }
                Op::Mod => {
                    let left = self.pop()?;
                    if self.acc == 0 {
                        return Err(RuntimeError::DivisionByZero { cycle: self.cycle });
                    }
                    self.acc = left.wrapping_rem(self.acc);
                }
                Op::Open => self.trap_open()?,
                Op::Read => self.trap_read()?,
                Op::Clos => self.trap_close()?,
                Op::Prtf => self.trap_printf(arg)?,
                Op::Malc => {
                    let size = self.trap_arg(0)?;
                    self.acc = self.alloc(size);
                }
                Op::Free => {
                    // Accepted and ignored; the heap dies with the VM.
                }
                Op::Mset => self.trap_memset()?,
                Op::Mcmp => self.trap_memcmp()?,
                Op::Exit => {
                    let status = self.trap_arg(0)?;
                    println!("exit({status}) cycle = {}", self.cycle);
                    return Ok(status);
                }
            }
        }
    }

    /// open(path, flags). Files open read-only; flags are ignored.
    fn trap_open(&mut self) -> Result<(), RuntimeError> {
        let path_addr = self.trap_arg(1)?;
        let bytes = self.c_string(path_addr)?;
        let Ok(path) = std::str::from_utf8(bytes) else {
            self.acc = -1;
            return Ok(());
        };
        match File::open(path) {
            Ok(file) => {
                let slot = match self.files.iter().position(Option::is_none) {
                    Some(slot) => {
                        self.files[slot] = Some(file);
                        slot
                    }
                    None => {
                        self.files.push(Some(file));
                        self.files.len() - 1
                    }
                };
                self.acc = slot as i64 + FD_BASE;
            }
            Err(_) => self.acc = -1,
        }
        Ok(())
    }

    /// read(fd, buf, count) into guest memory.
    fn trap_read(&mut self) -> Result<(), RuntimeError> {
        let fd = self.trap_arg(2)?;
        let buf = self.trap_arg(1)?;
        let count = self.trap_arg(0)?;
        let Ok(count) = usize::try_from(count) else {
            self.acc = -1;
            return Ok(());
        };
        let at = self.check_range(buf, count)?;
        let slot = usize::try_from(fd - FD_BASE).ok();
        let Some(file) = slot
            .and_then(|s| self.files.get_mut(s))
            .and_then(Option::as_mut)
        else {
            self.acc = -1;
            return Ok(());
        };
        self.acc = match file.read(&mut self.memory[at..at + count]) {
            Ok(n) => n as i64,
            Err(_) => -1,
        };
        Ok(())
    }

    fn trap_close(&mut self) -> Result<(), RuntimeError> {
        let fd = self.trap_arg(0)?;
        let slot = usize::try_from(fd - FD_BASE).ok();
        match slot.and_then(|s| self.files.get_mut(s)) {
            Some(entry) if entry.is_some() => {
                *entry = None;
                self.acc = 0;
            }
            _ => self.acc = -1,
        }
        Ok(())
    }

    /// printf(fmt, ...). Supports %d, %x, %c, %s and %%; anything else is
    /// copied through verbatim. Returns the number of bytes written.
    fn trap_printf(&mut self, argc: i64) -> Result<(), RuntimeError> {
        if argc < 1 {
            self.acc = 0;
            return Ok(());
        }
        let fmt_addr = self.trap_arg(argc - 1)?;
        let fmt = self.c_string(fmt_addr)?.to_vec();
        let varargs = (argc - 1).min(MAX_PRINTF_ARGS);
        let mut next = 0i64;
        let mut out = String::new();
        let mut i = 0;
        while i < fmt.len() {
            let b = fmt[i];
            i += 1;
            if b != b'%' {
                out.push(b as char);
                continue;
            }
            let Some(&spec) = fmt.get(i) else {
                out.push('%');
                break;
            };
            i += 1;
            let value = if matches!(spec, b'd' | b'x' | b'c' | b's') {
                let value = if next < varargs {
                    self.trap_arg(argc - 2 - next)?
                } else {
                    0
                };
                next += 1;
                value
            } else {
                0
            };
            match spec {
                b'%' => out.push('%'),
                b'd' => out.push_str(&value.to_string()),
                b'x' => out.push_str(&format!("{value:x}")),
                b'c' => out.push((value as u8) as char),
                b's' => {
                    for &byte in self.c_string(value)? {
                        out.push(byte as char);
                    }
                }
                other => {
                    out.push('%');
                    out.push(other as char);
                }
            }
        }
        print!("{out}");
        self.acc = out.len() as i64;
        Ok(())
    }

    /// memset(ptr, byte, count); returns ptr.
    fn trap_memset(&mut self) -> Result<(), RuntimeError> {
        let ptr = self.trap_arg(2)?;
        let byte = self.trap_arg(1)?;
        let count = self.trap_arg(0)?;
        let count = usize::try_from(count).map_err(|_| self.oob(count))?;
        let at = self.check_range(ptr, count)?;
        self.memory[at..at + count].fill(byte as u8);
        self.acc = ptr;
        Ok(())
    }

    /// memcmp(a, b, count); returns the difference of the first unequal
    /// byte pair, or zero.
    fn trap_memcmp(&mut self) -> Result<(), RuntimeError> {
        let a = self.trap_arg(2)?;
        let b = self.trap_arg(1)?;
        let count = self.trap_arg(0)?;
        let count = usize::try_from(count).map_err(|_| self.oob(count))?;
        let a_at = self.check_range(a, count)?;
        let b_at = self.check_range(b, count)?;
        self.acc = 0;
        for i in 0..count {
            let x = self.memory[a_at + i];
            let y = self.memory[b_at + i];
            if x != y {
                self.acc = i64::from(x) - i64::from(y);
                break;
            }
        }
        Ok(())
    }
}
