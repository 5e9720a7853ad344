//! The native function library.
//!
//! Host-provided callables published into the globals table through
//! the VM's registration call. Each native receives the heap (so it can
//! allocate) and its argument window; the VM has already checked the
//! declared arity.

use std::time::{SystemTime, UNIX_EPOCH};

use fer_core::{Heap, Obj, Value};
use fer_vm::Vm;

/// Register every native into the VM's global namespace.
pub fn register(vm: &mut Vm) {
    vm.define_native("clock", 0, clock_native);
    vm.define_native("str", 1, str_native);
    vm.define_native("len", 1, len_native);
    vm.define_native("typeof", 1, typeof_native);
}

/// Seconds since the Unix epoch, as a number. Useful for timing
/// scripts.
fn clock_native(_heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| format!("clock failed: {e}"))?;
    Ok(Value::number(now.as_secs_f64()))
}

/// Render any value as a string. Strings pass through unchanged.
fn str_native(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let value = args[0];
    if let Some(r) = value.as_object() {
        if matches!(heap.obj(r), Obj::String(_)) {
            return Ok(value);
        }
    }
    let rendered = heap.format_value(value);
    Ok(Value::object(heap.intern(&rendered)))
}

/// The type of a value as a string: "nil", "boolean", "number",
/// "string", "list", "dictionary", "function", "class" or "instance".
/// Everything callable that is not a class reports "function".
fn typeof_native(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let value = args[0];
    let name = if value.is_nil() {
        "nil"
    } else if value.as_bool().is_some() {
        "boolean"
    } else if value.is_number() {
        "number"
    } else {
        let r = value.as_object().expect("non-primitive value is an object");
        match heap.obj(r) {
            Obj::String(_) => "string",
            Obj::List(_) => "list",
            Obj::Dict(_) => "dictionary",
            Obj::Function(_) | Obj::Native(_) | Obj::Closure(_) | Obj::BoundMethod(_) => {
                "function"
            }
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
        }
    };
    Ok(Value::object(heap.intern(name)))
}

/// Element count of a list; nil for any other value.
fn len_native(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    match args[0].as_object() {
        Some(r) => match heap.obj(r) {
            Obj::List(list) => Ok(Value::number(list.items.len() as f64)),
            _ => Ok(Value::nil()),
        },
        None => Ok(Value::nil()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> String {
        let mut vm = Vm::new();
        register(&mut vm);
        let mut out = Vec::new();
        vm.interpret(source, &mut out).expect("script failed");
        String::from_utf8(out).expect("print output is UTF-8")
    }

    #[test]
    fn str_formats_values() {
        assert_eq!(run("print str(42);"), "42\n");
        assert_eq!(run("print str(nil) + str(true);"), "niltrue\n");
        assert_eq!(run("print str(\"already\");"), "already\n");
        // The result is a real interned string: concatenation works.
        assert_eq!(run("print str(1) + str(2);"), "12\n");
    }

    #[test]
    fn len_counts_lists_only() {
        assert_eq!(run("print len([1, 2, 3]);"), "3\n");
        assert_eq!(run("print len([]);"), "0\n");
        assert_eq!(run("print len(42);"), "nil\n");
        assert_eq!(run("print len(\"abc\");"), "nil\n");
    }

    #[test]
    fn typeof_reports_type_strings() {
        assert_eq!(run("print typeof(nil);"), "nil\n");
        assert_eq!(run("print typeof(true);"), "boolean\n");
        assert_eq!(run("print typeof(1.5);"), "number\n");
        assert_eq!(run("print typeof(\"s\");"), "string\n");
        assert_eq!(run("print typeof([1]);"), "list\n");
        assert_eq!(run("print typeof({\"k\": 1});"), "dictionary\n");
        assert_eq!(run("fun f() {} print typeof(f);"), "function\n");
        assert_eq!(run("print typeof(clock);"), "function\n");
        assert_eq!(run("class C {} print typeof(C); print typeof(C());"), "class\ninstance\n");
    }

    #[test]
    fn clock_advances() {
        let mut vm = Vm::new();
        register(&mut vm);
        let mut out = Vec::new();
        vm.interpret("var a = clock(); var b = clock(); print b >= a;", &mut out)
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "true\n");
    }
}
