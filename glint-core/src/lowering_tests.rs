use crate::bytecode::{OpCode, ShaderProgram, Slot};
use crate::error::{CompilerError, DiagnosticList, ErrorKind};
use crate::Compiler;

fn compile(source: &str) -> ShaderProgram {
    let _ = env_logger::builder().is_test(true).try_init();
    match Compiler::new().compile(source) {
        Ok(program) => program,
        Err(e) => panic!("compilation failed: {}", e),
    }
}

fn compile_err(source: &str) -> DiagnosticList {
    let _ = env_logger::builder().is_test(true).try_init();
    match Compiler::new().compile(source) {
        Ok(_) => panic!("compilation unexpectedly succeeded"),
        Err(CompilerError::Source(list)) => list,
        Err(other) => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_add_of_two_parameters() {
    let program = compile("void main(float a, float b){ float c = a + b; }");

    assert_eq!(program.input_count(), 2);
    assert_eq!(program.inputs().len(), 2);
    assert_eq!(program.inputs()[0].name, "a");
    assert!(!program.inputs()[0].writable);

    // The initializer loads both parameters and adds in place.
    assert_eq!(program.count_op(OpCode::AddRr), 1);
    assert!(program.count_op(OpCode::Push) >= 2);
    assert_eq!(program.count_op(OpCode::End), 1);

    // The add comes after both parameter loads.
    let code = program.code();
    let add_at = code
        .iter()
        .position(|s| matches!(s, Slot::Op(OpCode::AddRr)))
        .unwrap();
    let second_load = code
        .iter()
        .enumerate()
        .filter(|(_, s)| matches!(s, Slot::Op(OpCode::SetRr)))
        .nth(1)
        .map(|(i, _)| i)
        .unwrap();
    assert!(add_at > second_load);
}

#[test]
fn test_signature_mismatch_on_return_type() {
    let list = compile_err("float f(){ return 1.0; } int f(){ return 1; } void main(){ }");
    let mismatches: Vec<_> = list
        .0
        .iter()
        .filter(|d| d.kind == ErrorKind::TypeError && d.message.contains("return type"))
        .collect();
    assert_eq!(mismatches.len(), 1, "{}", list);
}

#[test]
fn test_signature_mismatch_on_parameters() {
    let list = compile_err("float f(float a); float f(int a){ return 1.0; } void main(){ }");
    assert!(
        list.0
            .iter()
            .any(|d| d.message.contains("parameter list")),
        "{}",
        list
    );
}

#[test]
fn test_redefining_a_function_body() {
    let list = compile_err("float f(){ return 1.0; } float f(){ return 2.0; } void main(){ }");
    assert!(
        list.0.iter().any(|d| d.message.contains("already has a body")),
        "{}",
        list
    );
}

#[test]
fn test_declared_but_never_defined() {
    let list = compile_err("float f(); void main(){ }");
    assert!(
        list.0
            .iter()
            .any(|d| d.message.contains("never defined")),
        "{}",
        list
    );
}

#[test]
fn test_missing_main_is_reported_at_end() {
    let list = compile_err("float f(){ return 1.0; }");
    assert!(
        list.0
            .iter()
            .any(|d| d.message.contains("exactly one 'main'")),
        "{}",
        list
    );
}

#[test]
fn test_main_must_return_void() {
    let list = compile_err("float main(){ return 1.0; }");
    assert!(
        list.0.iter().any(|d| d.message.contains("main must return void")),
        "{}",
        list
    );
}

#[test]
fn test_comparison_outside_condition_is_rejected() {
    let list = compile_err("void main(float a, var float x){ x = a < 1.0; }");
    assert!(
        list.0
            .iter()
            .any(|d| d.message.contains("branch condition")),
        "{}",
        list
    );
}

#[test]
fn test_assignment_to_readonly_parameter() {
    let list = compile_err("void main(float a){ a = 1.0; }");
    assert!(
        list.0
            .iter()
            .any(|d| d.kind == ErrorKind::TypeError && d.message.contains("cannot assign")),
        "{}",
        list
    );
}

#[test]
fn test_assignment_to_lit() {
    let list = compile_err("lit float k = 1.0; void main(){ k = 2.0; }");
    assert!(
        list.0.iter().any(|d| d.message.contains("cannot assign to lit")),
        "{}",
        list
    );
}

#[test]
fn test_struct_lowering_is_unsupported() {
    let list = compile_err("struct S{ float x; }; void main(){ }");
    assert!(
        list.0
            .iter()
            .any(|d| d.message.contains("struct types are not supported")),
        "{}",
        list
    );
}

#[test]
fn test_file_scope_variables_must_be_lit() {
    let list = compile_err("int x; void main(){ }");
    assert!(
        list.0
            .iter()
            .any(|d| d.message.contains("must be declared 'lit'")),
        "{}",
        list
    );
}

#[test]
fn test_lit_requires_compile_time_constant() {
    let list = compile_err("void main(float a){ lit float k = a; }");
    assert!(
        list.0
            .iter()
            .any(|d| d.message.contains("not a compile-time constant")),
        "{}",
        list
    );
}

#[test]
fn test_lit_initializer_folds_through_arithmetic() {
    let program = compile(
        "lit float half = 1.0 / 2.0; \
         void main(var float x){ x = half; }",
    );
    // The constant is an immediate in the stream, not a register load.
    assert!(program
        .code()
        .iter()
        .any(|s| matches!(s, Slot::Imm(v) if *v == 0.5)));
}

#[test]
fn test_nested_function_definition_is_rejected() {
    let list = compile_err("void main(){ float g(){ return 1.0; } }");
    assert!(
        list.0
            .iter()
            .any(|d| d.message.contains("file scope")),
        "{}",
        list
    );
}

#[test]
fn test_type_mismatch_between_operands() {
    let list = compile_err("void main(float a, var float x){ int n = 1; x = a + n; }");
    assert!(
        list.0
            .iter()
            .any(|d| d.kind == ErrorKind::TypeError && d.message.contains("type mismatch")),
        "{}",
        list
    );
}

#[test]
fn test_argument_count_mismatch() {
    let list = compile_err(
        "float f(float a, float b){ return a + b; } \
         void main(var float x){ x = f(1.0); }",
    );
    assert!(
        list.0
            .iter()
            .any(|d| d.message.contains("expects 2 arguments, got 1")),
        "{}",
        list
    );
}

#[test]
fn test_scope_protocol_brackets_every_scope() {
    let program = compile("void main(var float x){ { x = 1.0; } }");
    // One mask save/restore pair per scope: the function body and the
    // nested bare scope.
    assert_eq!(program.count_op(OpCode::TestPush), 2);
    assert_eq!(program.count_op(OpCode::TestPop), 2);
}

#[test]
fn test_if_else_emits_mask_protocol_not_branches() {
    let program = compile(
        "void main(float t, var float x){ \
           if(t < 0.5){ x = 1.0; }else{ x = 2.0; } \
         }",
    );
    // No conditional jumps for `if`: both branches always execute
    // under the mask protocol.
    assert_eq!(program.count_op(OpCode::TestJz), 0);
    assert_eq!(program.count_op(OpCode::Jmp), 0);
    assert_eq!(program.count_op(OpCode::TestInv), 1);
    assert_eq!(program.count_op(OpCode::TestAnd), 1);
    // Masked stores for both assignments to x.
    assert_eq!(program.count_op(OpCode::MsetRr), 2);
}

#[test]
fn test_while_emits_loop_with_mask_exit() {
    let program = compile(
        "void main(float n, var float x){ \
           float i = 0.0; \
           while(i < n){ i = i + 1.0; } \
           x = i; \
         }",
    );
    assert_eq!(program.count_op(OpCode::TestJz), 1);
    assert_eq!(program.count_op(OpCode::Jmp), 1);

    // The back-edge jumps to the loop head, which re-evaluates the
    // condition; the exit target lies past the back-edge.
    let code = program.code();
    let jmp_at = code
        .iter()
        .position(|s| matches!(s, Slot::Op(OpCode::Jmp)))
        .unwrap();
    let back_edge = match code[jmp_at + 1] {
        Slot::Addr(a) => a as usize,
        _ => panic!("jmp missing target"),
    };
    assert!(back_edge < jmp_at);

    let jz_at = code
        .iter()
        .position(|s| matches!(s, Slot::Op(OpCode::TestJz)))
        .unwrap();
    let exit = match code[jz_at + 1] {
        Slot::Addr(a) => a as usize,
        _ => panic!("test.jz missing target"),
    };
    assert!(exit > jmp_at);
}

#[test]
fn test_register_immediate_forms_for_literal_operands() {
    let program = compile("void main(float a, var float x){ x = a + 1.0; }");
    assert_eq!(program.count_op(OpCode::AddRi), 1);
    assert_eq!(program.count_op(OpCode::AddRr), 0);
}

#[test]
fn test_vector_declarations_lower_componentwise() {
    let program = compile(
        "void main(float2 uv, var float x){ \
           float2 p = uv; \
           x = p.x + p.y; \
         }",
    );
    assert_eq!(program.input_count(), 3);
    // Copying a float2 takes two register moves.
    assert!(program.count_op(OpCode::SetRr) >= 2);
}

#[test]
fn test_error_accumulation_reports_multiple_sites() {
    let list = compile_err(
        "void main(float a){ \
           a = 1.0; \
           float b = missing; \
           lit float k = a; \
         }",
    );
    assert!(list.len() >= 3, "{}", list);
}
