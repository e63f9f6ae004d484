//! A compiler and virtual machine for a small subset of C.
//!
//! Source text is compiled in a single pass into bytecode for a stack
//! machine, then interpreted. The subset covers `char`, `int` and pointers
//! of any depth, enums, functions, `if`/`while` control flow, and a handful
//! of built-in calls (`printf`, `malloc`, `open`/`read`/`close` and
//! friends). It is large enough to compile programs written in the subset,
//! including the compiler's own test corpus.
//!
//! ```
//! use minic_vm::compiler::compile;
//! use minic_vm::vm::Vm;
//!
//! let program = compile("int main() { return 2 + 3; }").unwrap();
//! let status = Vm::new(&program).run(&["demo"]).unwrap();
//! assert_eq!(status, 5);
//! ```

pub mod compiler;
pub mod error;
pub mod instruction;
pub mod program;
pub mod vm;

pub use compiler::compile;
pub use error::Error;
pub use program::BytecodeProgram;
