//! End-to-end scenarios driven through the embedding API: source in,
//! captured stdout (or a formatted error) out.

use fer::{FerError, Interpreter};

fn run(source: &str) -> String {
    Interpreter::new()
        .run(source)
        .unwrap_or_else(|e| panic!("script failed: {e}"))
}

fn run_err(source: &str) -> FerError {
    match Interpreter::new().run(source) {
        Ok(out) => panic!("expected an error, got output {out:?}"),
        Err(e) => e,
    }
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run("var x = \"foo\"; var y = \"bar\"; print x + y;"), "foobar\n");
}

#[test]
fn closure_counter() {
    let source = "
        fun make() { var n = 0; fun inc() { n = n + 1; return n; } return inc; }
        var c = make(); print c(); print c(); print c();
    ";
    assert_eq!(run(source), "1\n2\n3\n");
}

#[test]
fn inheritance_and_super() {
    let source = "
        class A { greet() { print \"A\"; } }
        class B < A { greet() { super.greet(); print \"B\"; } }
        B().greet();
    ";
    assert_eq!(run(source), "A\nB\n");
}

#[test]
fn while_with_break() {
    let source = "var i = 0; while (true) { if (i == 3) break; print i; i = i + 1; }";
    assert_eq!(run(source), "0\n1\n2\n");
}

#[test]
fn permanent_global_rejected_at_runtime() {
    let error = run_err("perm PI = 3.14; PI = 3;");
    match error {
        FerError::Runtime(e) => assert_eq!(e.message, "Cannot reassign permanent variable"),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn permanent_global_can_be_read() {
    assert_eq!(run("perm PI = 3.14; print PI * 2;"), "6.28\n");
}

#[test]
fn multiline_strings_count_lines() {
    // The string spans two lines; an error after it reports line 2.
    let error = run_err("var s = \"a\nb\"; bad;");
    match error {
        FerError::Runtime(e) => {
            assert_eq!(e.message, "Undefined variable 'bad'.");
            assert_eq!(e.trace[0].line, 2);
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn escaped_quotes_stay_verbatim() {
    assert_eq!(run("print \"say \\\"hi\\\"\";"), "say \\\"hi\\\"\n");
}

#[test]
fn for_loop_with_continue() {
    let source = "for (var i = 0; i < 5; i = i + 1) { if (i == 1) continue; print i; }";
    assert_eq!(run(source), "0\n2\n3\n4\n");
}

#[test]
fn nested_loops_break_inner_only() {
    let source = "
        for (var i = 0; i < 2; i = i + 1) {
            for (var j = 0; j < 5; j = j + 1) {
                if (j == 1) break;
                print i + j;
            }
        }
    ";
    assert_eq!(run(source), "0\n1\n");
}

#[test]
fn break_closes_captured_locals() {
    let source = "
        var f;
        while (true) {
            var captured = \"kept\";
            fun g() { return captured; }
            f = g;
            break;
        }
        print f();
    ";
    assert_eq!(run(source), "kept\n");
}

#[test]
fn methods_fields_and_this() {
    let source = "
        class Counter {
            init() { this.n = 0; }
            bump() { this.n = this.n + 1; return this.n; }
        }
        var c = Counter();
        c.bump(); c.bump();
        print c.bump();
        print c.n;
    ";
    assert_eq!(run(source), "3\n3\n");
}

#[test]
fn super_method_through_two_levels() {
    let source = "
        class A { name() { return \"A\"; } }
        class B < A { name() { return super.name() + \"B\"; } }
        class C < B { name() { return super.name() + \"C\"; } }
        print C().name();
    ";
    assert_eq!(run(source), "ABC\n");
}

#[test]
fn inherited_methods_are_copied_down() {
    let source = "
        class A { hello() { print \"hi\"; } }
        class B < A {}
        B().hello();
    ";
    assert_eq!(run(source), "hi\n");
}

#[test]
fn lists_and_dictionaries_nest() {
    let source = "
        var table = {\"rows\": [1, 2, 3]};
        table[\"rows\"][1] = 20;
        print table[\"rows\"];
        print len(table[\"rows\"]);
    ";
    assert_eq!(run(source), "[1, 20, 3]\n3\n");
}

#[test]
fn natives_compose_with_language_code() {
    let source = "
        fun describe(v) { return typeof(v) + \": \" + str(v); }
        print describe(42);
        print describe([1, 2]);
    ";
    assert_eq!(run(source), "number: 42\nlist: [1, 2]\n");
}

#[test]
fn truthiness_matches_double_negation() {
    let source = "
        print !!0 == true;
        print !!\"\" == true;
        print !!nil == false;
        print !!false == false;
        print !![] == true;
    ";
    assert_eq!(run(source), "true\ntrue\ntrue\ntrue\ntrue\n");
}

#[test]
fn interning_makes_equality_byte_equality() {
    let source = "
        var a = \"he\" + \"llo\";
        var b = \"hell\" + \"o\";
        print a == b;
        print a == \"hello\";
    ";
    assert_eq!(run(source), "true\ntrue\n");
}

#[test]
fn definitions_persist_across_interprets() {
    let mut interp = Interpreter::new();
    interp.run("var x = 10; fun double(n) { return n * 2; }").unwrap();
    assert_eq!(interp.run("print double(x);").unwrap(), "20\n");
    // A runtime error resets the stacks but keeps the globals.
    assert!(interp.run("boom;").is_err());
    assert_eq!(interp.run("print x;").unwrap(), "10\n");
}

#[test]
fn deep_recursion_within_frame_limit() {
    let source = "
        fun sum(n, acc) { if (n == 0) return acc; return sum(n - 1, acc + n); }
        print sum(60, 0);
    ";
    assert_eq!(run(source), "1830\n");
}

#[test]
fn shadowing_across_scopes() {
    let source = "
        var x = \"outer\";
        { var x = \"inner\"; print x; }
        print x;
    ";
    assert_eq!(run(source), "inner\nouter\n");
}
