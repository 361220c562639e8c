use lox_vm::Vm;

fn compile_and_run(source: &str) -> Result<Vm, lox_vm::RuntimeError> {
    let mut vm = Vm::new();
    let handle = lox_compiler::compile(source, vm.heap_mut()).expect("source should compile");
    vm.interpret(handle)?;
    Ok(vm)
}

#[test]
fn fibonacci_via_recursion() {
    compile_and_run(indoc::indoc! {"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        var result = fib(10);
    "})
    .unwrap();
}

#[test]
fn print_runs_without_panicking() {
    compile_and_run(r#"print "hello" + ", " + "world";"#).unwrap();
}

#[test]
fn for_loop_desugars_correctly() {
    compile_and_run(indoc::indoc! {"
        var total = 0;
        for (var i = 0; i < 5; i = i + 1) {
            total = total + i;
        }
        print total;
    "})
    .unwrap();
}

#[test]
fn undefined_variable_reports_runtime_error_with_trace() {
    let err = compile_and_run(indoc::indoc! {"
        fun inner() {
            return missing;
        }
        fun outer() {
            return inner();
        }
        outer();
    "})
    .unwrap_err();

    assert_eq!(err.message, "Undefined variable 'missing'.");
    assert_eq!(err.trace.len(), 3);
    assert_eq!(err.trace[0].function_name, "inner");
    assert_eq!(err.trace[1].function_name, "outer");
    assert_eq!(err.trace[2].function_name, "script");
}

#[test]
fn calling_a_non_callable_is_a_runtime_error() {
    let err = compile_and_run("var x = 1; x();").unwrap_err();
    assert_eq!(err.message, "Can only call functions and classes.");
}

#[test]
fn class_with_inheritance_and_fields() {
    compile_and_run(indoc::indoc! {"
        class Shape {
            area() { return 0; }
            describe() { return \"area = \" + this.area(); }
        }
        class Square < Shape {
            init(side) { this.side = side; }
            area() { return this.side * this.side; }
        }
        var sq = Square(3);
        print sq.describe();
    "})
    .unwrap();
}

#[test]
fn wrong_arity_reports_expected_and_got() {
    let err = compile_and_run(indoc::indoc! {"
        fun add(a, b) { return a + b; }
        add(1);
    "})
    .unwrap_err();
    assert_eq!(err.message, "Expected 2 arguments but got 1.");
}

#[test]
fn clock_native_is_callable_and_returns_a_number() {
    compile_and_run("var t = clock(); var ok = t >= 0;").unwrap();
}
