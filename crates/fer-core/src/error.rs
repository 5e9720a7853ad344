//! Public error types.
//!
//! Two origins: compile-time (scanner/parser) and runtime (the VM).
//! Both render exactly the text a user sees; the driver only chooses
//! the stream and the exit code.

use std::fmt;

/// Where a compile error points in the source.
#[derive(Debug, Clone)]
pub enum ErrorAt {
    /// At the end of the source.
    End,
    /// At a specific lexeme.
    Lexeme(String),
    /// The token itself was an error token; its message says enough.
    Hidden,
}

/// A single compile-time diagnostic.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub at: ErrorAt,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.at {
            ErrorAt::End => write!(f, " at end")?,
            ErrorAt::Lexeme(lexeme) => write!(f, " at '{lexeme}'")?,
            ErrorAt::Hidden => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// Every diagnostic from one compilation. Panic mode suppresses
/// cascades, so this is usually short.
#[derive(Debug, Clone)]
pub struct CompileErrors(pub Vec<CompileError>);

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

/// One line of a runtime backtrace.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    /// Function name, or `None` for top-level code.
    pub name: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error: the message plus a backtrace, most recent call
/// first.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n{frame}")?;
        }
        Ok(())
    }
}

/// Top-level error for `interpret`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FerError {
    #[error("{0}")]
    Compile(CompileErrors),
    #[error("{0}")]
    Runtime(RuntimeError),
}

impl FerError {
    pub fn is_compile(&self) -> bool {
        matches!(self, FerError::Compile(_))
    }

    pub fn is_runtime(&self) -> bool {
        matches!(self, FerError::Runtime(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_rendering() {
        let e = CompileError {
            line: 3,
            at: ErrorAt::Lexeme("=".to_string()),
            message: "Invalid assignment target.".to_string(),
        };
        assert_eq!(e.to_string(), "[line 3] Error at '=': Invalid assignment target.");

        let e = CompileError {
            line: 7,
            at: ErrorAt::End,
            message: "Expect expression.".to_string(),
        };
        assert_eq!(e.to_string(), "[line 7] Error at end: Expect expression.");

        let e = CompileError {
            line: 1,
            at: ErrorAt::Hidden,
            message: "Unterminated string.".to_string(),
        };
        assert_eq!(e.to_string(), "[line 1] Error: Unterminated string.");
    }

    #[test]
    fn runtime_error_rendering() {
        let e = RuntimeError {
            message: "Undefined variable 'x'.".to_string(),
            trace: vec![
                TraceFrame {
                    line: 2,
                    name: Some("inner".to_string()),
                },
                TraceFrame { line: 5, name: None },
            ],
        };
        assert_eq!(
            e.to_string(),
            "Undefined variable 'x'.\n[line 2] in inner()\n[line 5] in script"
        );
    }
}
