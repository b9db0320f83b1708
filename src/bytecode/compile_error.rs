use thiserror::Error;

/// A single diagnostic produced while compiling. The compiler recovers at
/// statement boundaries and keeps going, so one pass can report several of
/// these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("compile error: [line {line}] {message}")]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        CompileError {
            line,
            message: message.into(),
        }
    }
}
