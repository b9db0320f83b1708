use std::fmt;

use thiserror::Error;

/// An error raised by the running program: wrong operand types, undefined
/// variables, bad call targets, arity mismatches, frame exhaustion.
///
/// Carries the source line of the faulting instruction and a call trace,
/// innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    pub trace: Vec<String>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        RuntimeError {
            message: message.into(),
            line,
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime error: [line {}] {}", self.line, self.message)?;
        for frame in &self.trace {
            write!(f, "\n{}", frame)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_line_and_trace() {
        let mut err = RuntimeError::new("operands must be numbers", 3);
        err.trace.push("[line 3] in add()".to_string());
        err.trace.push("[line 7] in script".to_string());
        assert_eq!(
            err.to_string(),
            "runtime error: [line 3] operands must be numbers\n\
             [line 3] in add()\n\
             [line 7] in script"
        );
    }
}
