use crate::compiler::error::CompileError;
use crate::vm::RuntimeError;

/// Any failure from compiling or running a program.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Error {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Compile(err) => write!(f, "compile error: {err}"),
            Error::Runtime(err) => write!(f, "runtime error: {err}"),
        }
    }
}

impl From<CompileError> for Error {
    fn from(err: CompileError) -> Error {
        Error::Compile(err)
    }
}

impl From<RuntimeError> for Error {
    fn from(err: RuntimeError) -> Error {
        Error::Runtime(err)
    }
}
