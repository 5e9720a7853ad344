//! Compile-time and runtime error behaviour: messages, backtraces, and
//! the compile-time limits on locals, upvalues, constants and jumps.

use fer::{FerError, Interpreter};

fn compile_error(source: &str) -> String {
    match Interpreter::new().run(source) {
        Err(FerError::Compile(errors)) => errors.to_string(),
        Err(FerError::Runtime(e)) => panic!("expected a compile error, got runtime: {e}"),
        Ok(out) => panic!("expected a compile error, got output {out:?}"),
    }
}

fn runtime_error(source: &str) -> String {
    match Interpreter::new().run(source) {
        Err(FerError::Runtime(e)) => e.to_string(),
        Err(FerError::Compile(e)) => panic!("expected a runtime error, got compile: {e}"),
        Ok(out) => panic!("expected a runtime error, got output {out:?}"),
    }
}

#[test]
fn compile_error_format() {
    assert_eq!(
        compile_error("1 +"),
        "[line 1] Error at end: Expect expression."
    );
    assert_eq!(
        compile_error("print 1"),
        "[line 1] Error at end: Expect ';' after value."
    );
    assert_eq!(
        compile_error("var 1 = 2;"),
        "[line 1] Error at '1': Expect variable name."
    );
}

#[test]
fn unterminated_string_reports_without_lexeme() {
    let rendered = compile_error("var s = \"oops");
    assert!(rendered.starts_with("[line 1] Error: Unterminated string."));
}

#[test]
fn reading_local_in_its_own_initializer() {
    let rendered = compile_error("{ var x = x; }");
    assert!(rendered.contains("Can't read local variable in its own initializer."));
}

#[test]
fn assignment_target_must_be_assignable() {
    assert_eq!(
        compile_error("var a = 1; var b = 2; a + b = 3;"),
        "[line 1] Error at '=': Invalid assignment target."
    );
}

#[test]
fn super_and_this_misuse() {
    assert!(compile_error("print this;").contains("Can't use 'this' outside of a class."));
    assert!(compile_error("print super.x;").contains("Can't use 'super' outside of a class."));
    assert!(compile_error("class A { m() { super.m(); } } A().m();")
        .contains("Can't use 'super' in a class with no superclass."));
    assert!(compile_error("class A < A {}").contains("A class can't inherit from itself."));
}

#[test]
fn initializer_cannot_return_a_value() {
    assert!(compile_error("class C { init() { return 1; } }")
        .contains("Can't return a value from an initializer."));
}

#[test]
fn local_slot_limit() {
    // 255 user locals fit beside the reserved slot; one more overflows.
    let mut ok = String::from("{\n");
    for i in 0..255 {
        ok.push_str(&format!("var l{i} = 0;\n"));
    }
    ok.push('}');
    Interpreter::new().run(&ok).unwrap();

    let mut over = String::from("{\n");
    for i in 0..256 {
        over.push_str(&format!("var l{i} = 0;\n"));
    }
    over.push('}');
    assert!(compile_error(&over).contains("Too many local variables in function."));
}

#[test]
fn upvalue_limit() {
    // An inner function capturing across two enclosing frames: 256
    // captures compile, 257 do not.
    fn nested(outer: usize, middle: usize) -> String {
        let mut source = String::from("fun outer() {\n");
        for i in 0..outer {
            source.push_str(&format!("var a{i} = 0;\n"));
        }
        source.push_str("fun middle() {\n");
        for i in 0..middle {
            source.push_str(&format!("var b{i} = 0;\n"));
        }
        source.push_str("fun inner() {\nvar sum = 0");
        for i in 0..outer {
            source.push_str(&format!(" + a{i}"));
        }
        for i in 0..middle {
            source.push_str(&format!(" + b{i}"));
        }
        source.push_str(";\nreturn sum;\n}\n}\n}\n");
        source
    }

    Interpreter::new().run(&nested(150, 106)).unwrap();
    assert!(compile_error(&nested(150, 107))
        .contains("Too many closure variables in function."));
}

#[test]
fn constant_pool_limit() {
    // Distinct literals share the pool with nothing else here: 256
    // fit, the 257th overflows.
    let ok: String = (0..256).map(|i| format!("print {i};\n")).collect();
    Interpreter::new().run(&ok).unwrap();

    let over: String = (0..257).map(|i| format!("print {i};\n")).collect();
    assert!(compile_error(&over).contains("Too many constants in one chunk."));
}

#[test]
fn jump_distance_limit() {
    // A then-branch longer than 65535 bytes cannot be jumped over.
    let mut source = String::from("var x = 0;\nif (true) {\n");
    for _ in 0..9000 {
        source.push_str("x = x + 1;\n");
    }
    source.push('}');
    assert!(compile_error(&source).contains("Too much code to jump over."));
}

#[test]
fn loop_body_size_limit() {
    let mut source = String::from("var x = 0;\nwhile (true) {\n");
    for _ in 0..9000 {
        source.push_str("x = x + 1;\n");
    }
    source.push('}');
    assert!(compile_error(&source).contains("Loop body too large."));
}

#[test]
fn list_and_dictionary_literal_limits() {
    let ok = format!("var l = [{}];", vec!["0"; 255].join(", "));
    Interpreter::new().run(&ok).unwrap();

    let over = format!("var l = [{}];", vec!["0"; 256].join(", "));
    assert!(compile_error(&over).contains("Can't have more than 255 elements in one list."));

    let pairs: Vec<String> = (0..256).map(|i| format!("\"k{i}\": {i}")).collect();
    let over = format!("var d = {{{}}};", pairs.join(", "));
    assert!(compile_error(&over).contains("Can't have more than 255 elements in dictionary."));
}

#[test]
fn runtime_errors_with_backtrace() {
    let rendered = runtime_error(
        "fun third() { return nil[0]; }\nfun second() { return third(); }\nfun first() { return second(); }\nfirst();",
    );
    assert_eq!(
        rendered,
        "Can only index lists and dictionaries.\n\
         [line 1] in third()\n\
         [line 2] in second()\n\
         [line 3] in first()\n\
         [line 4] in script"
    );
}

#[test]
fn stack_overflow_message() {
    let rendered = runtime_error("fun loop() { return loop(); } loop();");
    assert!(rendered.starts_with("Stack overflow."));
}

#[test]
fn arity_and_call_errors() {
    assert!(runtime_error("fun f(a, b) {} f(1);")
        .starts_with("Expected 2 arguments but got 1."));
    assert!(runtime_error("nil();").starts_with("Can only call functions and classes."));
    assert!(runtime_error("class C { init(x) {} } C();")
        .starts_with("Expected 1 arguments but got 0."));
}

#[test]
fn type_errors() {
    assert!(runtime_error("print -\"s\";").starts_with("Operand must be a number."));
    assert!(runtime_error("print 1 < \"2\";").starts_with("Operands must be numbers."));
    assert!(runtime_error("print {} + {};")
        .starts_with("Operands must be two numbers or two strings."));
}

#[test]
fn undefined_global_set_does_not_define() {
    let mut interp = Interpreter::new();
    assert!(interp.run("ghost = 1;").is_err());
    // The failed assignment must not have created the binding.
    assert!(interp.run("print ghost;").is_err());
}
