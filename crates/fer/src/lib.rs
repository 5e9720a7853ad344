//! Fer — a small dynamically-typed scripting language.
//!
//! This crate provides the embedding API over the compiler and VM.
//!
//! # Quick start
//!
//! ```
//! use fer::Interpreter;
//!
//! let mut interp = Interpreter::new();
//! let output = interp.run("print 1 + 2;").unwrap();
//! assert_eq!(output, "3\n");
//! ```

use std::io::Write;

pub use fer_core::{FerError, Value};
use fer_vm::Vm;

/// Builder for configuring and constructing an [`Interpreter`].
pub struct InterpreterBuilder {
    stdlib: bool,
    trace: bool,
    gc_stress: bool,
    gc_log: bool,
}

impl Default for InterpreterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InterpreterBuilder {
    pub fn new() -> Self {
        InterpreterBuilder {
            stdlib: true,
            trace: false,
            gc_stress: false,
            gc_log: false,
        }
    }

    /// Enable or disable the native library (default: enabled).
    pub fn with_stdlib(mut self, enable: bool) -> Self {
        self.stdlib = enable;
        self
    }

    /// Disassemble compiled code and trace each executed instruction.
    pub fn with_trace(mut self, enable: bool) -> Self {
        self.trace = enable;
        self
    }

    /// Collect on every allocation. For flushing out GC bugs.
    pub fn with_gc_stress(mut self, enable: bool) -> Self {
        self.gc_stress = enable;
        self
    }

    /// Log allocation and collection activity to stderr.
    pub fn with_gc_log(mut self, enable: bool) -> Self {
        self.gc_log = enable;
        self
    }

    pub fn build(self) -> Interpreter {
        let mut vm = Vm::new();
        vm.trace = self.trace;
        vm.heap.stress = self.gc_stress;
        vm.heap.log = self.gc_log;
        if self.stdlib {
            fer_stdlib::register(&mut vm);
        }
        Interpreter { vm }
    }
}

/// A Fer interpreter: one VM whose globals and interned strings persist
/// across `interpret` calls, which is what makes the REPL work.
pub struct Interpreter {
    vm: Vm,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        InterpreterBuilder::new().build()
    }

    /// Compile and execute `source`, streaming `print` output to `out`.
    pub fn interpret(&mut self, source: &str, out: &mut dyn Write) -> Result<(), FerError> {
        self.vm.interpret(source, out)
    }

    /// Compile and execute `source`, capturing `print` output.
    pub fn run(&mut self, source: &str) -> Result<String, FerError> {
        let mut out = Vec::new();
        self.vm.interpret(source, &mut out)?;
        Ok(String::from_utf8(out).expect("print output is UTF-8"))
    }
}
