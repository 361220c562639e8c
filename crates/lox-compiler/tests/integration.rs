use lox_core::{Heap, Obj};

#[test]
fn compiles_a_small_program_without_errors() {
    let mut heap = Heap::new();
    let source = r#"
        class Greeter {
            init(name) {
                this.name = name;
            }

            greet() {
                print "hello, " + this.name;
            }
        }

        var g = Greeter("world");
        g.greet();
    "#;

    let handle = lox_compiler::compile(source, &mut heap).expect("program should compile");
    assert!(matches!(heap.get(handle), Some(Obj::Function(_))));
}

#[test]
fn reports_every_error_in_an_invalid_program() {
    let mut heap = Heap::new();
    let source = "var = 1;\nprint \"unterminated;\n";

    let errors = lox_compiler::compile(source, &mut heap).expect_err("program should not compile");
    assert!(!errors.is_empty());
    assert!(errors.iter().any(|e| e.to_string().contains("[line")));
}
