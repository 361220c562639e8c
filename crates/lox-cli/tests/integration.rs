use lox_vm::VmOptions;

// lox_cli's run_file/run_repl are private; this drives the same
// compile+interpret pipeline the CLI wires together, against real source,
// and checks the outcome contract the driver promises at each layer.

fn compile_and_interpret(source: &str) -> Result<(), lox_vm::RuntimeError> {
    let mut vm = lox_vm::Vm::with_options(VmOptions::default());
    let handle = lox_compiler::compile(source, vm.heap_mut()).expect("fixture should compile");
    vm.interpret(handle)
}

#[test]
fn valid_script_runs_to_completion() {
    compile_and_interpret(indoc::indoc! {"
        var greeting = \"hello\";
        print greeting;
    "})
    .unwrap();
}

#[test]
fn compile_errors_are_reported_without_running() {
    let mut vm = lox_vm::Vm::new();
    let errors = lox_compiler::compile("var = 1;", vm.heap_mut()).unwrap_err();
    assert!(!errors.is_empty());
}

#[test]
fn runtime_error_carries_a_trace() {
    let err = compile_and_interpret("print undefinedThing;").unwrap_err();
    assert_eq!(err.message, "Undefined variable 'undefinedThing'.");
    assert_eq!(err.trace.len(), 1);
    assert_eq!(err.trace[0].function_name, "script");
}

#[test]
fn disassembling_a_compiled_script_resolves_constants_through_the_heap() {
    let mut vm = lox_vm::Vm::new();
    let handle = lox_compiler::compile("print 1 + 2;", vm.heap_mut()).expect("fixture should compile");
    let Some(lox_core::Obj::Function(function)) = vm.heap().get(handle) else {
        panic!("compile() should hand back a Function");
    };
    let text = lox_core::disassemble_chunk(&function.chunk, vm.heap(), "script");
    assert!(text.starts_with("== script ==\n"));
    assert!(text.contains("CONSTANT"));
    assert!(text.contains("ADD"));
    assert!(text.contains("PRINT"));
}

#[test]
fn a_script_file_on_disk_compiles_and_runs() {
    let mut path = std::env::temp_dir();
    path.push(format!("lox-cli-test-{}-{}.lox", std::process::id(), line!()));
    std::fs::write(&path, "print 1 + 1;").expect("write scratch script");

    let source = std::fs::read_to_string(&path).expect("read scratch script");
    let result = compile_and_interpret(&source);

    let _ = std::fs::remove_file(&path);
    result.unwrap();
}
