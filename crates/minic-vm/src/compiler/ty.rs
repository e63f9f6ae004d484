/// Width in bytes of one machine cell. Every value except a plain `char` is
/// one cell wide, including pointers of any depth.
pub const CELL: usize = 8;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
/// The non-pointer kind at the bottom of a type.
pub enum BaseType {
    Char,
    Int,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
/// The static type of an expression: a base kind plus an explicit count of
/// pointer indirections.
pub struct Type {
    base: BaseType,
    indirection: u8,
}

impl Type {
    pub const CHAR: Type = Type {
        base: BaseType::Char,
        indirection: 0,
    };
    pub const INT: Type = Type {
        base: BaseType::Int,
        indirection: 0,
    };

    /// The type of a pointer to `self`. Depth saturates rather than
    /// overflowing on absurd declarators.
    pub const fn ptr_to(self) -> Type {
        Type {
            base: self.base,
            indirection: self.indirection.saturating_add(1),
        }
    }

    /// The type reached by one dereference, or `None` for a non-pointer.
    pub const fn deref(self) -> Option<Type> {
        match self.indirection {
            0 => None,
            n => Some(Type {
                base: self.base,
                indirection: n - 1,
            }),
        }
    }

    pub const fn is_pointer(self) -> bool {
        self.indirection > 0
    }

    /// Size in bytes of a value of this type. Every pointer depth reports the
    /// same fixed cell width.
    pub const fn size(self) -> i64 {
        if self.indirection == 0 && matches!(self.base, BaseType::Char) {
            1
        } else {
            CELL as i64
        }
    }

    /// Size in bytes of the element a pointer steps over. Only meaningful for
    /// pointers; a `char *` steps by one byte, everything else by a cell.
    pub const fn element_size(self) -> i64 {
        match self.deref() {
            Some(inner) => inner.size(),
            None => 1,
        }
    }

    /// The stride used by `++`/`--`: the element size for pointers, one
    /// otherwise.
    pub const fn step(self) -> i64 {
        if self.is_pointer() { self.element_size() } else { 1 }
    }

    /// Whether loads and stores of this type move a single byte.
    pub const fn is_byte_sized(self) -> bool {
        self.size() == 1
    }
}
