//! Cinder: a small dynamically-typed scripting language.
//!
//! Source compiles in a single pass to bytecode, which a stack machine
//! executes. There is no syntax tree; the compiler's Pratt parser emits
//! instructions as it goes. Objects live on an explicit handle-indexed heap
//! reclaimed by a tri-color mark-sweep collector.
//!
//! ```
//! use cinder::Vm;
//!
//! let mut vm = Vm::new();
//! let mut out = Vec::new();
//! vm.interpret("print 1 + 2;", &mut out).unwrap();
//! assert_eq!(out, b"3\n");
//! ```

pub mod bytecode;
pub mod frontend;
pub mod lang;
pub mod runtime;

pub use bytecode::{compile, CompileError};
pub use lang::Value;
pub use runtime::{Heap, RuntimeError, Vm, VmConfig};

use thiserror::Error;

/// Why a source run failed: the source did not compile, or execution raised
/// an error. Compile failures carry every diagnostic from the pass.
#[derive(Debug, Error)]
pub enum CinderError {
    #[error("{}", format_compile_errors(.0))]
    Compile(Vec<CompileError>),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

fn format_compile_errors(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
