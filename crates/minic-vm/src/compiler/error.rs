use compact_str::CompactString;

#[derive(Clone, PartialEq, Eq, Debug)]
/// A fatal compilation error. The first error aborts the whole compile; there
/// is no recovery or batching.
pub struct CompileError {
    pub kind: CompileErrorKind,
    /// Source line the compiler was looking at when it gave up.
    pub line: u32,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CompileErrorKind {
    /// The token stream ended where more input was required.
    UnexpectedEof,
    /// A grammar violation; the payload names the expectation.
    Syntax(&'static str),
    /// An identifier was used before any declaration bound it.
    UnboundIdentifier(CompactString),
    /// A name was declared twice in the same scope.
    DuplicateDefinition(CompactString),
    /// Assignment, increment or decrement applied to a non-place.
    BadLvalue,
    /// `&` applied to something without an address.
    BadAddressOf,
    /// `*` or indexing applied to a non-pointer.
    BadDereference,
    /// A call through a name that is not a function or syscall.
    NotAFunction(CompactString),
    /// No function with the configured entry name was declared.
    EntryPointNotFound(CompactString),
}

impl std::error::Error for CompileError {}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: ", self.line)?;
        match &self.kind {
            CompileErrorKind::UnexpectedEof => write!(f, "unexpected end of input"),
            CompileErrorKind::Syntax(what) => write!(f, "{what}"),
            CompileErrorKind::UnboundIdentifier(name) => {
                write!(f, "undefined variable {name}")
            }
            CompileErrorKind::DuplicateDefinition(name) => {
                write!(f, "duplicate definition of {name}")
            }
            CompileErrorKind::BadLvalue => write!(f, "bad lvalue"),
            CompileErrorKind::BadAddressOf => write!(f, "bad address-of"),
            CompileErrorKind::BadDereference => write!(f, "bad dereference"),
            CompileErrorKind::NotAFunction(name) => write!(f, "{name} is not a function"),
            CompileErrorKind::EntryPointNotFound(name) => {
                write!(f, "{name}() not defined")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_the_line() {
        let err = CompileError {
            kind: CompileErrorKind::Syntax("close paren expected"),
            line: 7,
        };
        assert_eq!(err.to_string(), "line 7: close paren expected");
    }
}
