//! The virtual machine: a call-frame stack, a value stack, global and
//! permanent-global tables, the open-upvalue list, and the decode/
//! dispatch loop.
//!
//! The VM owns the heap. Every runtime allocation funnels through
//! [`Vm::alloc`]/[`Vm::intern`], which run a collection first when the
//! heap asks for one; anything a collection must keep alive is on the
//! value stack, in a frame, in a table, or on the open-upvalue list at
//! that moment.

use std::io::Write;
use std::rc::Rc;

use fer_core::{
    Chunk, FerError, GcRef, Heap, NativeFn, Obj, ObjBoundMethod, ObjClosure, ObjInstance,
    ObjNative, ObjUpvalue, Op, RuntimeError, Table, TraceFrame, UpvalueLocation, Value,
};

use crate::compiler;
use crate::disasm;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * (u8::MAX as usize + 1);

/// One ongoing function invocation. `base` is the stack slot of the
/// callee; the function's locals start there. The chunk is shared with
/// the function object so the loop reads code without chasing handles.
struct CallFrame {
    closure: GcRef,
    chunk: Rc<Chunk>,
    ip: usize,
    base: usize,
}

pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Names defined with `perm`; `SetGlobal` refuses them.
    permanents: Table,
    /// Open upvalues, ordered by decreasing stack slot.
    open_upvalues: Vec<GcRef>,
    /// Cached "init" string for initializer lookup.
    init_string: GcRef,
    /// Disassemble each instruction and dump the stack while running.
    pub trace: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            permanents: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            trace: false,
        }
    }

    /// Compile and run a source buffer. `print` output goes to `out`;
    /// diagnostics are returned, already formatted, for the driver to
    /// report.
    pub fn interpret(&mut self, source: &str, out: &mut dyn Write) -> Result<(), FerError> {
        let function = compiler::compile(source, &mut self.heap, self.trace)
            .map_err(FerError::Compile)?;
        let function = self.heap.allocate(Obj::Function(function));
        self.stack.push(Value::object(function));
        let closure = self.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.stack.pop();
        self.stack.push(Value::object(closure));
        self.call_closure(closure, 0).map_err(FerError::Runtime)?;
        self.run(out).map_err(FerError::Runtime)
    }

    /// Publish a native callable under `name` in the globals table.
    pub fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let name = self.intern(name);
        // Both objects stay rooted on the stack across the allocations.
        self.stack.push(Value::object(name));
        let native = self.alloc(Obj::Native(ObjNative {
            name,
            arity,
            function,
        }));
        self.stack.push(Value::object(native));
        let hash = self.heap.hash_of(name);
        self.globals.set(name, hash, Value::object(native));
        self.stack.pop();
        self.stack.pop();
    }

    // ── Allocation and collection ─────────────────────────────────

    fn alloc(&mut self, obj: Obj) -> GcRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(obj)
    }

    fn intern(&mut self, s: &str) -> GcRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(s)
    }

    /// Mark the roots, trace, prune the intern pool, sweep.
    pub fn collect_garbage(&mut self) {
        if self.heap.log {
            eprintln!("[gc] begin");
        }
        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for i in 0..self.open_upvalues.len() {
            let upvalue = self.open_upvalues[i];
            self.heap.mark_object(upvalue);
        }
        self.heap.mark_table(&self.globals);
        self.heap.mark_table(&self.permanents);
        self.heap.mark_object(self.init_string);
        self.heap.trace_references();
        self.heap.remove_unmarked_strings();
        self.heap.sweep();
        if self.heap.log {
            eprintln!("[gc] end");
        }
    }

    // ── Stack primitives ──────────────────────────────────────────

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    /// Current stack depth; tests use this to check stack discipline.
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    /// Build a runtime error with a backtrace (most recent call first)
    /// and reset the VM for the next `interpret`.
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let instruction = frame.ip.min(frame.chunk.lines.len()).saturating_sub(1);
            let line = frame.chunk.lines.get(instruction).copied().unwrap_or(0);
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            let name = function
                .name
                .map(|name| self.heap.string(name).chars.to_string());
            trace.push(TraceFrame { line, name });
        }
        self.reset_stack();
        RuntimeError {
            message: message.into(),
            trace,
        }
    }

    // ── Instruction reading ───────────────────────────────────────

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = frame.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().expect("no active call frame");
        frame.chunk.constants[index]
    }

    /// Read a constant that the compiler guarantees is an interned
    /// string (a variable, property or method name).
    fn read_string(&mut self) -> GcRef {
        self.read_constant()
            .as_object()
            .expect("name constant is a string")
    }

    // ── Calls ─────────────────────────────────────────────────────

    fn call_closure(&mut self, closure: GcRef, argc: usize) -> Result<(), RuntimeError> {
        let function_ref = self.heap.closure(closure).function;
        let function = self.heap.function(function_ref);
        let arity = function.arity;
        let chunk = Rc::clone(&function.chunk);
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            base: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    /// Dispatch a call to whatever sits `argc` slots below the top.
    fn call_value(&mut self, argc: usize) -> Result<(), RuntimeError> {
        enum Callee {
            Closure(GcRef),
            Native { arity: usize, function: NativeFn },
            Class(GcRef),
            Bound { receiver: Value, method: GcRef },
            NotCallable,
        }

        let callee = self.peek(argc);
        let kind = match callee.as_object() {
            Some(r) => match self.heap.obj(r) {
                Obj::Closure(_) => Callee::Closure(r),
                Obj::Native(native) => Callee::Native {
                    arity: native.arity as usize,
                    function: native.function,
                },
                Obj::Class(_) => Callee::Class(r),
                Obj::BoundMethod(bound) => Callee::Bound {
                    receiver: bound.receiver,
                    method: bound.method,
                },
                _ => Callee::NotCallable,
            },
            None => Callee::NotCallable,
        };

        match kind {
            Callee::Closure(closure) => self.call_closure(closure, argc),
            Callee::Native { arity, function } => {
                if argc != arity {
                    return Err(
                        self.runtime_error(format!("Expected {arity} arguments but got {argc}."))
                    );
                }
                let first = self.stack.len() - argc;
                let args: Vec<Value> = self.stack[first..].to_vec();
                match function(&mut self.heap, &args) {
                    Ok(result) => {
                        self.stack.truncate(first - 1);
                        self.push(result);
                        Ok(())
                    }
                    Err(message) => Err(self.runtime_error(message)),
                }
            }
            Callee::Class(class) => {
                let instance = self.alloc(Obj::Instance(ObjInstance {
                    class,
                    fields: Table::new(),
                }));
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = Value::object(instance);
                let hash = self.heap.hash_of(self.init_string);
                let initializer = self.heap.class(class).methods.get(self.init_string, hash);
                match initializer {
                    Some(initializer) => {
                        let method = initializer.as_object().expect("initializer is a closure");
                        self.call_closure(method, argc)
                    }
                    None if argc != 0 => {
                        Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")))
                    }
                    None => Ok(()),
                }
            }
            Callee::Bound { receiver, method } => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            Callee::NotCallable => {
                Err(self.runtime_error("Can only call functions and classes."))
            }
        }
    }

    fn invoke_from_class(
        &mut self,
        class: GcRef,
        name: GcRef,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        let hash = self.heap.hash_of(name);
        match self.heap.class(class).methods.get(name, hash) {
            Some(method) => {
                let method = method.as_object().expect("method is a closure");
                self.call_closure(method, argc)
            }
            None => {
                let name = self.heap.string(name).chars.to_string();
                Err(self.runtime_error(format!("Undefined property '{name}'.")))
            }
        }
    }

    /// `receiver.name(args)` without materializing a bound method.
    /// Fields shadow methods, so a callable field is called instead.
    fn invoke(&mut self, name: GcRef, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        let instance = match receiver.as_object() {
            Some(r) if matches!(self.heap.obj(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        let hash = self.heap.hash_of(name);
        let (class, field) = match self.heap.obj(instance) {
            Obj::Instance(i) => (i.class, i.fields.get(name, hash)),
            _ => unreachable!(),
        };
        if let Some(value) = field {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = value;
            return self.call_value(argc);
        }
        self.invoke_from_class(class, name, argc)
    }

    /// Read a method off `class` and leave it bound to the receiver on
    /// top of the stack.
    fn bind_method(&mut self, class: GcRef, name: GcRef) -> Result<(), RuntimeError> {
        let hash = self.heap.hash_of(name);
        let method = match self.heap.class(class).methods.get(name, hash) {
            Some(method) => method.as_object().expect("method is a closure"),
            None => {
                let name = self.heap.string(name).chars.to_string();
                return Err(self.runtime_error(format!("Undefined property '{name}'.")));
            }
        };
        let receiver = self.peek(0);
        let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }));
        self.pop();
        self.push(Value::object(bound));
        Ok(())
    }

    // ── Upvalues ──────────────────────────────────────────────────

    /// Find or create an open upvalue for a stack slot. The open list
    /// is kept sorted by decreasing slot, so the scan stops at the
    /// first upvalue below the target.
    fn capture_upvalue(&mut self, slot: usize) -> GcRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            let existing = self.heap.upvalue(upvalue).stack_slot();
            if existing == slot {
                return upvalue;
            }
            if existing < slot {
                insert_at = i;
                break;
            }
        }
        let created = self.alloc(Obj::Upvalue(ObjUpvalue {
            location: UpvalueLocation::Stack(slot),
        }));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue at or above `from`: copy the stack
    /// value into the upvalue and detach it from the list.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = self.heap.upvalue(upvalue).stack_slot();
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            self.heap.upvalue_mut(upvalue).location = UpvalueLocation::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    fn read_upvalue(&self, upvalue: GcRef) -> Value {
        match self.heap.upvalue(upvalue).location {
            UpvalueLocation::Stack(slot) => self.stack[slot],
            UpvalueLocation::Closed(value) => value,
        }
    }

    fn write_upvalue(&mut self, upvalue: GcRef, value: Value) {
        match self.heap.upvalue(upvalue).location {
            UpvalueLocation::Stack(slot) => self.stack[slot] = value,
            UpvalueLocation::Closed(_) => {
                self.heap.upvalue_mut(upvalue).location = UpvalueLocation::Closed(value);
            }
        }
    }

    // ── Numeric helpers ───────────────────────────────────────────

    fn binary_number_op(
        &mut self,
        op: impl FnOnce(f64, f64) -> Value,
    ) -> Result<(), RuntimeError> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    /// Check a list index: a number with an integral value in range.
    fn list_index(&mut self, index: Value, len: usize) -> Result<usize, RuntimeError> {
        let Some(number) = index.as_number() else {
            return Err(self.runtime_error("List index must be a number."));
        };
        if number.fract() != 0.0 || number < 0.0 || (number as usize) >= len {
            return Err(self.runtime_error("List index out of range."));
        }
        Ok(number as usize)
    }

    // ── The dispatch loop ─────────────────────────────────────────

    fn run(&mut self, out: &mut dyn Write) -> Result<(), RuntimeError> {
        loop {
            if self.trace {
                let mut dump = String::from("          ");
                for value in &self.stack {
                    dump.push_str(&format!("[ {} ]", self.heap.format_value(*value)));
                }
                eprintln!("{dump}");
                let frame = self.frames.last().expect("no active call frame");
                let (text, _) = disasm::disassemble_instruction(&self.heap, &frame.chunk, frame.ip);
                eprintln!("{text}");
            }

            let instruction = self.read_byte();
            let op = Op::from_u8(instruction).expect("corrupt bytecode");
            match op {
                Op::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                Op::Nil => self.push(Value::nil()),
                Op::True => self.push(Value::bool(true)),
                Op::False => self.push(Value::bool(false)),
                Op::Pop => {
                    self.pop();
                }

                Op::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("no active call frame").base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                Op::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("no active call frame").base;
                    self.stack[base + slot] = self.peek(0);
                }

                Op::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.hash_of(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let name = self.heap.string(name).chars.to_string();
                            return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
                        }
                    }
                }
                Op::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.hash_of(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                Op::DefineGlobalPerm => {
                    let name = self.read_string();
                    let hash = self.heap.hash_of(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.permanents.set(name, hash, Value::bool(true));
                    self.pop();
                }
                Op::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.hash_of(name);
                    if self.permanents.get(name, hash).is_some() {
                        return Err(self.runtime_error("Cannot reassign permanent variable"));
                    }
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        self.globals.delete(name, hash);
                        let name = self.heap.string(name).chars.to_string();
                        return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
                    }
                }

                Op::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().expect("no active call frame").closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = self.read_upvalue(upvalue);
                    self.push(value);
                }
                Op::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().expect("no active call frame").closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = self.peek(0);
                    self.write_upvalue(upvalue, value);
                }

                Op::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    let instance = match receiver.as_object() {
                        Some(r) if matches!(self.heap.obj(r), Obj::Instance(_)) => r,
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    let hash = self.heap.hash_of(name);
                    let (class, field) = match self.heap.obj(instance) {
                        Obj::Instance(i) => (i.class, i.fields.get(name, hash)),
                        _ => unreachable!(),
                    };
                    match field {
                        Some(value) => {
                            self.pop();
                            self.push(value);
                        }
                        None => self.bind_method(class, name)?,
                    }
                }
                Op::SetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(1);
                    let instance = match receiver.as_object() {
                        Some(r) if matches!(self.heap.obj(r), Obj::Instance(_)) => r,
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    let hash = self.heap.hash_of(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.set(name, hash, value);
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                Op::GetSuper => {
                    let name = self.read_string();
                    let superclass = self
                        .pop()
                        .as_object()
                        .expect("superclass slot holds a class");
                    self.bind_method(superclass, name)?;
                }

                Op::GetItem => {
                    let index = self.pop();
                    let container = self.pop();
                    let object = match container.as_object() {
                        Some(r) => r,
                        None => {
                            return Err(
                                self.runtime_error("Can only index lists and dictionaries.")
                            )
                        }
                    };
                    enum Container {
                        List(usize),
                        Dict,
                        Other,
                    }
                    let kind = match self.heap.obj(object) {
                        Obj::List(list) => Container::List(list.items.len()),
                        Obj::Dict(_) => Container::Dict,
                        _ => Container::Other,
                    };
                    match kind {
                        Container::List(len) => {
                            let i = self.list_index(index, len)?;
                            let value = self.heap.list(object).items[i];
                            self.push(value);
                        }
                        Container::Dict => {
                            let key = match index.as_object() {
                                Some(k) if matches!(self.heap.obj(k), Obj::String(_)) => k,
                                _ => {
                                    return Err(
                                        self.runtime_error("Dictionary key must be a string.")
                                    )
                                }
                            };
                            let hash = self.heap.hash_of(key);
                            match self.heap.dict(object).entries.get(key, hash) {
                                Some(value) => self.push(value),
                                None => {
                                    let key = self.heap.string(key).chars.to_string();
                                    return Err(
                                        self.runtime_error(format!("Undefined key '{key}'."))
                                    );
                                }
                            }
                        }
                        Container::Other => {
                            return Err(
                                self.runtime_error("Can only index lists and dictionaries.")
                            )
                        }
                    }
                }
                Op::SetItem => {
                    let value = self.pop();
                    let index = self.pop();
                    let container = self.pop();
                    let object = match container.as_object() {
                        Some(r) => r,
                        None => {
                            return Err(
                                self.runtime_error("Can only index lists and dictionaries.")
                            )
                        }
                    };
                    enum Container {
                        List(usize),
                        Dict,
                        Other,
                    }
                    let kind = match self.heap.obj(object) {
                        Obj::List(list) => Container::List(list.items.len()),
                        Obj::Dict(_) => Container::Dict,
                        _ => Container::Other,
                    };
                    match kind {
                        Container::List(len) => {
                            let i = self.list_index(index, len)?;
                            self.heap.list_mut(object).items[i] = value;
                        }
                        Container::Dict => {
                            let key = match index.as_object() {
                                Some(k) if matches!(self.heap.obj(k), Obj::String(_)) => k,
                                _ => {
                                    return Err(
                                        self.runtime_error("Dictionary key must be a string.")
                                    )
                                }
                            };
                            let hash = self.heap.hash_of(key);
                            self.heap.dict_mut(object).entries.set(key, hash, value);
                        }
                        Container::Other => {
                            return Err(
                                self.runtime_error("Can only index lists and dictionaries.")
                            )
                        }
                    }
                    self.push(value);
                }

                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a == b));
                }
                Op::Greater => self.binary_number_op(|a, b| Value::bool(a > b))?,
                Op::Less => self.binary_number_op(|a, b| Value::bool(a < b))?,
                Op::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    let concatenated = match (a.as_object(), b.as_object()) {
                        (Some(x), Some(y)) => match (self.heap.obj(x), self.heap.obj(y)) {
                            (Obj::String(x), Obj::String(y)) => {
                                Some(format!("{}{}", x.chars, y.chars))
                            }
                            _ => None,
                        },
                        _ => None,
                    };
                    if let Some(s) = concatenated {
                        // Operands stay on the stack across the
                        // allocation so a collection keeps them alive.
                        let result = self.intern(&s);
                        self.pop();
                        self.pop();
                        self.push(Value::object(result));
                    } else if let (Some(a), Some(b)) = (a.as_number(), b.as_number()) {
                        self.pop();
                        self.pop();
                        self.push(Value::number(a + b));
                    } else {
                        return Err(
                            self.runtime_error("Operands must be two numbers or two strings.")
                        );
                    }
                }
                Op::Subtract => self.binary_number_op(|a, b| Value::number(a - b))?,
                Op::Multiply => self.binary_number_op(|a, b| Value::number(a * b))?,
                Op::Divide => self.binary_number_op(|a, b| Value::number(a / b))?,
                Op::Not => {
                    let value = self.pop();
                    self.push(Value::bool(value.is_falsey()));
                }
                Op::Negate => match self.peek(0).as_number() {
                    Some(n) => {
                        self.pop();
                        self.push(Value::number(-n));
                    }
                    None => return Err(self.runtime_error("Operand must be a number.")),
                },

                Op::Print => {
                    let value = self.pop();
                    let _ = writeln!(out, "{}", self.heap.format_value(value));
                }

                Op::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active call frame").ip += offset;
                }
                Op::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().expect("no active call frame").ip += offset;
                    }
                }
                Op::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active call frame").ip -= offset;
                }

                Op::Call => {
                    let argc = self.read_byte() as usize;
                    self.call_value(argc)?;
                }
                Op::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                Op::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    let superclass = self
                        .pop()
                        .as_object()
                        .expect("superclass slot holds a class");
                    self.invoke_from_class(superclass, name, argc)?;
                }

                Op::Closure => {
                    let function = self
                        .read_constant()
                        .as_object()
                        .expect("closure constant is a function");
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.alloc(Obj::Closure(ObjClosure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.push(Value::object(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frames.last().expect("no active call frame").base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing =
                                self.frames.last().expect("no active call frame").closure;
                            self.heap.closure(enclosing).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                Op::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                Op::Return => {
                    let result = self.pop();
                    let base = self.frames.last().expect("no active call frame").base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // The top-level callee.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }

                Op::List => {
                    let count = self.read_byte() as usize;
                    let first = self.stack.len() - count;
                    let items = self.stack[first..].to_vec();
                    // Elements stay rooted on the stack until the list
                    // object exists.
                    let list = self.alloc(Obj::List(fer_core::ObjList { items }));
                    self.stack.truncate(first);
                    self.push(Value::object(list));
                }
                Op::Dictionary => {
                    let count = self.read_byte() as usize;
                    let first = self.stack.len() - count * 2;
                    let mut entries = Table::new();
                    for pair in 0..count {
                        let key = self.stack[first + pair * 2];
                        let value = self.stack[first + pair * 2 + 1];
                        let key = match key.as_object() {
                            Some(k) if matches!(self.heap.obj(k), Obj::String(_)) => k,
                            _ => return Err(self.runtime_error("Dictionary key must be a string.")),
                        };
                        let hash = self.heap.hash_of(key);
                        entries.set(key, hash, value);
                    }
                    let dict = self.alloc(Obj::Dict(fer_core::ObjDict { entries }));
                    self.stack.truncate(first);
                    self.push(Value::object(dict));
                }

                Op::Class => {
                    let name = self.read_string();
                    let class = self.alloc(Obj::Class(fer_core::ObjClass {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::object(class));
                }
                Op::Inherit => {
                    let superclass = self.peek(1);
                    let superclass = match superclass.as_object() {
                        Some(r) if matches!(self.heap.obj(r), Obj::Class(_)) => r,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let methods = self.heap.class(superclass).methods.clone();
                    let class = self
                        .peek(0)
                        .as_object()
                        .expect("class declaration leaves the class on top");
                    self.heap.class_mut(class).methods = methods;
                    self.pop();
                }
                Op::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = self
                        .peek(1)
                        .as_object()
                        .expect("method declaration runs with the class below");
                    let hash = self.heap.hash_of(name);
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<String, FerError> {
        let mut vm = Vm::new();
        let mut out = Vec::new();
        vm.interpret(source, &mut out)?;
        Ok(String::from_utf8(out).expect("print output is UTF-8"))
    }

    fn run_error(source: &str) -> RuntimeError {
        let mut vm = Vm::new();
        let mut out = Vec::new();
        match vm.interpret(source, &mut out) {
            Err(FerError::Runtime(e)) => e,
            Err(FerError::Compile(e)) => panic!("unexpected compile error: {e}"),
            Ok(_) => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn arithmetic() {
        assert_eq!(run("print 1 + 2 * 3;").unwrap(), "7\n");
        assert_eq!(run("print (1 + 2) * 3;").unwrap(), "9\n");
        assert_eq!(run("print -4 / 2;").unwrap(), "-2\n");
        assert_eq!(run("print 1 / 2;").unwrap(), "0.5\n");
    }

    #[test]
    fn comparison_laws() {
        // a != b behaves as !(a == b); <= as !(>).
        assert_eq!(run("print 1 != 2; print !(1 == 2);").unwrap(), "true\ntrue\n");
        assert_eq!(run("print 1 <= 1; print !(1 > 1);").unwrap(), "true\ntrue\n");
        assert_eq!(run("print 2 >= 3; print !(2 < 3);").unwrap(), "false\nfalse\n");
    }

    #[test]
    fn truthiness_double_negation() {
        assert_eq!(run("print !!0; print !!\"\"; print !!nil;").unwrap(), "true\ntrue\nfalse\n");
    }

    #[test]
    fn string_concatenation_interns() {
        assert_eq!(
            run("var x = \"foo\"; var y = \"bar\"; print x + y;").unwrap(),
            "foobar\n"
        );
        // Concatenation produces a string equal (by identity) to an
        // equal literal.
        assert_eq!(
            run("print \"ab\" + \"c\" == \"a\" + \"bc\";").unwrap(),
            "true\n"
        );
    }

    #[test]
    fn add_type_error() {
        let e = run_error("print 1 + \"x\";");
        assert_eq!(e.message, "Operands must be two numbers or two strings.");
    }

    #[test]
    fn globals_and_locals() {
        assert_eq!(
            run("var a = 1; { var b = a + 1; print b; } print a;").unwrap(),
            "2\n1\n"
        );
    }

    #[test]
    fn undefined_variable() {
        let e = run_error("print missing;");
        assert_eq!(e.message, "Undefined variable 'missing'.");
        let e = run_error("missing = 1;");
        assert_eq!(e.message, "Undefined variable 'missing'.");
    }

    #[test]
    fn control_flow() {
        assert_eq!(
            run("if (1 < 2) print \"yes\"; else print \"no\";").unwrap(),
            "yes\n"
        );
        assert_eq!(
            run("var i = 0; while (i < 3) { print i; i = i + 1; }").unwrap(),
            "0\n1\n2\n"
        );
        assert_eq!(
            run("for (var i = 0; i < 3; i = i + 1) print i;").unwrap(),
            "0\n1\n2\n"
        );
    }

    #[test]
    fn break_and_continue() {
        assert_eq!(
            run("var i = 0; while (true) { if (i == 3) break; print i; i = i + 1; }").unwrap(),
            "0\n1\n2\n"
        );
        assert_eq!(
            run("for (var i = 0; i < 5; i = i + 1) { if (i == 2) continue; print i; }").unwrap(),
            "0\n1\n3\n4\n"
        );
    }

    #[test]
    fn short_circuit() {
        assert_eq!(run("print false and missing;").unwrap(), "false\n");
        assert_eq!(run("print true or missing;").unwrap(), "true\n");
        assert_eq!(run("print 1 and 2; print nil or 3;").unwrap(), "2\n3\n");
    }

    #[test]
    fn functions_and_returns() {
        assert_eq!(
            run("fun add(a, b) { return a + b; } print add(1, 2);").unwrap(),
            "3\n"
        );
        assert_eq!(run("fun noop() {} print noop();").unwrap(), "nil\n");
        assert_eq!(run("fun f() { return 1; } print f;").unwrap(), "<fn f>\n");
    }

    #[test]
    fn recursion() {
        assert_eq!(
            run("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);")
                .unwrap(),
            "55\n"
        );
    }

    #[test]
    fn arity_mismatch() {
        let e = run_error("fun f(a) {} f(1, 2);");
        assert_eq!(e.message, "Expected 1 arguments but got 2.");
    }

    #[test]
    fn calling_a_non_callable() {
        let e = run_error("var x = 3; x();");
        assert_eq!(e.message, "Can only call functions and classes.");
        let e = run_error("\"s\"();");
        assert_eq!(e.message, "Can only call functions and classes.");
    }

    #[test]
    fn stack_overflow_at_frame_limit() {
        // 64 simultaneous frames work; the 65th fails. The script's
        // own frame takes one, so 63 nested calls still fit.
        assert_eq!(
            run("fun down(n) { if (n == 0) return 0; return down(n - 1); } print down(62);")
                .unwrap(),
            "0\n"
        );
        let e = run_error("fun down(n) { return down(n - 1); } down(0);");
        assert_eq!(e.message, "Stack overflow.");
    }

    #[test]
    fn runtime_error_carries_backtrace() {
        let e = run_error("fun inner() { return 1 + nil; }\nfun outer() { return inner(); }\nouter();");
        assert_eq!(e.message, "Operands must be two numbers or two strings.");
        let rendered = e.to_string();
        assert!(rendered.contains("[line 1] in inner()"));
        assert!(rendered.contains("[line 2] in outer()"));
        assert!(rendered.contains("[line 3] in script"));
    }

    #[test]
    fn closure_counter() {
        let source = "
            fun make() { var n = 0; fun inc() { n = n + 1; return n; } return inc; }
            var c = make(); print c(); print c(); print c();
        ";
        assert_eq!(run(source).unwrap(), "1\n2\n3\n");
    }

    #[test]
    fn sibling_closures_share_one_upvalue() {
        let source = "
            var get; var set;
            fun pair() {
                var shared = 0;
                fun g() { return shared; }
                fun s(v) { shared = v; }
                get = g; set = s;
            }
            pair();
            set(42);
            print get();
        ";
        assert_eq!(run(source).unwrap(), "42\n");
    }

    #[test]
    fn upvalues_close_per_iteration() {
        let source = "
            var first; var second;
            for (var i = 0; i < 2; i = i + 1) {
                var j = i;
                fun capture() { return j; }
                if (i == 0) first = capture; else second = capture;
            }
            print first(); print second();
        ";
        assert_eq!(run(source).unwrap(), "0\n1\n");
    }

    #[test]
    fn classes_fields_and_methods() {
        let source = "
            class Point { init(x, y) { this.x = x; this.y = y; } sum() { return this.x + this.y; } }
            var p = Point(3, 4);
            print p.sum();
            p.x = 10;
            print p.sum();
        ";
        assert_eq!(run(source).unwrap(), "7\n14\n");
    }

    #[test]
    fn bound_methods_remember_their_receiver() {
        let source = "
            class Greeter { init(name) { this.name = name; } greet() { print this.name; } }
            var m = Greeter(\"fer\").greet;
            m();
        ";
        assert_eq!(run(source).unwrap(), "fer\n");
    }

    #[test]
    fn inheritance_and_super() {
        let source = "
            class A { greet() { print \"A\"; } }
            class B < A { greet() { super.greet(); print \"B\"; } }
            B().greet();
        ";
        assert_eq!(run(source).unwrap(), "A\nB\n");
    }

    #[test]
    fn initializer_returns_the_instance() {
        let source = "
            class C { init() { this.v = 1; } }
            print C();
        ";
        assert_eq!(run(source).unwrap(), "C instance\n");
    }

    #[test]
    fn class_arity_errors() {
        let e = run_error("class C {} C(1);");
        assert_eq!(e.message, "Expected 0 arguments but got 1.");
        let e = run_error("class C { init(a) {} } C();");
        assert_eq!(e.message, "Expected 1 arguments but got 0.");
    }

    #[test]
    fn undefined_property() {
        let e = run_error("class C {} C().missing;");
        assert_eq!(e.message, "Undefined property 'missing'.");
        let e = run_error("class C {} C().missing();");
        assert_eq!(e.message, "Undefined property 'missing'.");
    }

    #[test]
    fn property_on_non_instance() {
        let e = run_error("var x = 1; x.field;");
        assert_eq!(e.message, "Only instances have properties.");
        let e = run_error("3.field = 1;");
        assert_eq!(e.message, "Only instances have fields.");
    }

    #[test]
    fn callable_field_shadows_method() {
        let source = "
            fun shout() { print \"field\"; }
            class C { speak() { print \"method\"; } }
            var c = C();
            c.speak = shout;
            c.speak();
        ";
        assert_eq!(run(source).unwrap(), "field\n");
    }

    #[test]
    fn inherit_from_non_class() {
        let e = run_error("var NotAClass = 1; class C < NotAClass {}");
        assert_eq!(e.message, "Superclass must be a class.");
    }

    #[test]
    fn lists() {
        assert_eq!(run("var l = [1, 2, 3]; print l[0] + l[2];").unwrap(), "4\n");
        assert_eq!(run("var l = [1]; l[0] = 9; print l;").unwrap(), "[9]\n");
        assert_eq!(run("print [1, \"two\", nil];").unwrap(), "[1, two, nil]\n");
    }

    #[test]
    fn list_index_errors() {
        let e = run_error("var l = [1]; l[1];");
        assert_eq!(e.message, "List index out of range.");
        let e = run_error("var l = [1]; l[0.5];");
        assert_eq!(e.message, "List index out of range.");
        let e = run_error("var l = [1]; l[\"x\"];");
        assert_eq!(e.message, "List index must be a number.");
    }

    #[test]
    fn dictionaries() {
        assert_eq!(
            run("var d = {\"a\": 1, \"b\": 2}; print d[\"a\"] + d[\"b\"];").unwrap(),
            "3\n"
        );
        assert_eq!(
            run("var d = {}; d[\"k\"] = 5; print d[\"k\"];").unwrap(),
            "5\n"
        );
    }

    #[test]
    fn dictionary_errors() {
        let e = run_error("var d = {}; d[\"missing\"];");
        assert_eq!(e.message, "Undefined key 'missing'.");
        let e = run_error("var d = {}; d[1] = 2;");
        assert_eq!(e.message, "Dictionary key must be a string.");
        let e = run_error("var x = 1; x[0];");
        assert_eq!(e.message, "Can only index lists and dictionaries.");
    }

    #[test]
    fn permanent_globals_resist_assignment() {
        assert_eq!(run("perm PI = 3.14; print PI;").unwrap(), "3.14\n");
        let e = run_error("perm PI = 3.14; PI = 3;");
        assert_eq!(e.message, "Cannot reassign permanent variable");
    }

    #[test]
    fn statements_leave_the_stack_balanced() {
        let mut vm = Vm::new();
        let mut out = Vec::new();
        vm.interpret("var a = 1; a + 2; if (a) { a = 3; } while (a > 3) { a = 0; }", &mut out)
            .unwrap();
        assert_eq!(vm.stack_depth(), 0);
    }

    #[test]
    fn runs_under_gc_stress() {
        let mut vm = Vm::new();
        vm.heap.stress = true;
        let mut out = Vec::new();
        let source = "
            fun build(n) {
                var s = \"\";
                for (var i = 0; i < n; i = i + 1) { s = s + \"x\"; }
                return s;
            }
            var parts = [build(3), build(5)];
            print parts[0] + parts[1];
            class Box { init(v) { this.v = v; } }
            print Box(build(2)).v;
        ";
        vm.interpret(source, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "xxxxxxxx\nxx\n");
        assert!(vm.heap.check_allocation_list());
    }

    #[test]
    fn reachable_values_survive_collection() {
        let mut vm = Vm::new();
        let mut out = Vec::new();
        vm.interpret("var keep = \"anchor\"; var l = [\"a\", \"b\"];", &mut out)
            .unwrap();
        // First collection clears the script scaffolding; after that,
        // everything left is rooted through the globals and must stay.
        vm.collect_garbage();
        let before = vm.heap.object_count();
        vm.collect_garbage();
        assert_eq!(vm.heap.object_count(), before);
        assert!(vm.heap.check_allocation_list());
        vm.interpret("print keep; print l[1];", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "anchor\nb\n");
    }

    #[test]
    fn collection_frees_unreachable_objects() {
        let mut vm = Vm::new();
        let mut out = Vec::new();
        vm.interpret("{ var dead = [1, 2, 3]; } var live = [4];", &mut out)
            .unwrap();
        let before = vm.heap.object_count();
        vm.collect_garbage();
        assert!(vm.heap.object_count() < before);
        vm.interpret("print live;", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "[4]\n");
    }

    #[test]
    fn native_functions() {
        fn double(_heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
            match args[0].as_number() {
                Some(n) => Ok(Value::number(n * 2.0)),
                None => Err("Argument must be a number.".to_string()),
            }
        }
        let mut vm = Vm::new();
        vm.define_native("double", 1, double);
        let mut out = Vec::new();
        vm.interpret("print double(21);", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "42\n");

        let err = vm.interpret("double(1, 2);", &mut Vec::new());
        match err {
            Err(FerError::Runtime(e)) => {
                assert_eq!(e.message, "Expected 1 arguments but got 2.")
            }
            other => panic!("expected arity error, got {other:?}"),
        }
    }
}
