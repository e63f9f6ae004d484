use compact_str::CompactString;

use super::lexer::Token;
use super::ty::Type;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
/// Index of an interned identifier. Stable for the whole compilation.
pub struct SymbolId(u32);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
/// What a bound name stands for. The meaning of [`Binding::value`] depends on
/// the kind: code index for functions, trap opcode for syscalls, data-segment
/// offset for globals, frame slot for locals and parameters.
pub enum SymbolKind {
    /// A reserved word; the payload is the token the lexer should yield.
    Keyword(Token),
    EnumConst,
    Function,
    Syscall,
    Global,
    Local,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Binding {
    pub kind: SymbolKind,
    pub ty: Type,
    pub value: i64,
}

struct SymbolEntry {
    name: CompactString,
    hash: u64,
    binding: Option<Binding>,
}

/// One function's worth of local bindings, remembering whatever each name
/// meant before so it can be restored on scope exit.
#[derive(Default)]
struct ScopeFrame {
    saved: Vec<(SymbolId, Option<Binding>)>,
}

/// Flat identifier table scanned linearly by (hash, exact name). Small
/// programs keep this cheap, and entry order makes compilation deterministic.
#[derive(Default)]
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
    scopes: Vec<ScopeFrame>,
}

/// The rolling identifier hash: fold each byte after the first into the
/// running value, then mix in the length.
pub fn identifier_hash(name: &[u8]) -> u64 {
    let mut h = u64::from(name[0]);
    for &b in &name[1..] {
        h = h.wrapping_mul(147).wrapping_add(u64::from(b));
    }
    h.wrapping_shl(6).wrapping_add(name.len() as u64)
}

impl SymbolTable {
    /// Finds or creates the entry for `name`. Fresh entries start unbound.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        let hash = identifier_hash(name.as_bytes());
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.hash == hash && entry.name == name {
                return SymbolId(idx as u32);
            }
        }
        self.entries.push(SymbolEntry {
            name: CompactString::new(name),
            hash,
            binding: None,
        });
        SymbolId(self.entries.len() as u32 - 1)
    }

    /// Looks up an already-interned name without creating it.
    pub fn find(&self, name: &str) -> Option<SymbolId> {
        let hash = identifier_hash(name.as_bytes());
        self.entries
            .iter()
            .position(|e| e.hash == hash && e.name == name)
            .map(|idx| SymbolId(idx as u32))
    }

    pub fn name(&self, id: SymbolId) -> &str {
        &self.entries[id.0 as usize].name
    }

    pub fn binding(&self, id: SymbolId) -> Option<&Binding> {
        self.entries[id.0 as usize].binding.as_ref()
    }

    /// Sets a file-scope binding. The caller is responsible for rejecting
    /// duplicates first.
    pub fn bind(&mut self, id: SymbolId, binding: Binding) {
        self.entries[id.0 as usize].binding = Some(binding);
    }

    /// Opens a function scope. Local bindings made until the matching
    /// [`SymbolTable::pop_scope`] shadow and later restore any previous
    /// binding of the same name.
    pub fn push_scope(&mut self) {
        self.scopes.push(ScopeFrame::default());
    }

    /// Binds a local or parameter, recording the shadowed binding in the
    /// current scope frame.
    ///
    /// # Panics
    /// Panics if no scope is open.
    pub fn bind_local(&mut self, id: SymbolId, binding: Binding) {
        let previous = self.entries[id.0 as usize].binding.replace(binding);
        self.scopes
            .last_mut()
            .expect("bind_local outside of a scope")
            .saved
            .push((id, previous));
    }

    /// Closes the innermost scope, restoring every shadowed binding.
    pub fn pop_scope(&mut self) {
        let frame = self.scopes.pop().expect("pop_scope without a scope");
        for (id, previous) in frame.saved.into_iter().rev() {
            self.entries[id.0 as usize].binding = previous;
        }
    }
}
