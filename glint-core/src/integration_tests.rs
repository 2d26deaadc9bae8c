use crate::bytecode::ShaderProgram;
use crate::vm::{InputArrays, WideFloat, WideMask};
use crate::Compiler;

fn compile(source: &str) -> ShaderProgram {
    let _ = env_logger::builder().is_test(true).try_init();
    match Compiler::new().compile(source) {
        Ok(program) => program,
        Err(e) => panic!("compilation failed: {}", e),
    }
}

/// Compile and run over one fragment block: read-only `main` parameters
/// come from `varying`, writable ones from `fragments`.
fn run(
    program: &ShaderProgram,
    varying: &[WideFloat],
    fragments: &mut [WideFloat],
    mask: WideMask,
) {
    let mut input = InputArrays {
        constant: &[],
        varying,
        fragments,
    };
    assert!(program.is_valid(&input));
    assert!(program.run(&mut input, mask));
}

#[test]
fn test_round_trip_literal_through_vm() {
    let program = compile(
        "void main(var float out){ \
           float f = 1.0; \
           out = f; \
         }",
    );
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &[], &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat::splat(1.0));
}

#[test]
fn test_fragment_mask_selects_written_lanes() {
    let program = compile("void main(var float out){ out = 9.0; }");
    let mut frags = [WideFloat::splat(1.0)];
    run(
        &program,
        &[],
        &mut frags,
        WideMask([true, false, false, true]),
    );
    assert_eq!(frags[0], WideFloat([9.0, 1.0, 1.0, 9.0]));
}

#[test]
fn test_divergent_if_else_merges_per_lane() {
    let program = compile(
        "void main(float t, var float x){ \
           if(t < 0.5){ x = 1.0; }else{ x = 2.0; } \
         }",
    );

    // Mixed lanes.
    let varying = [WideFloat([0.0, 1.0, 0.2, 0.9])];
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &varying, &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat([1.0, 2.0, 1.0, 2.0]));

    // All lanes true.
    let varying = [WideFloat::splat(0.0)];
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &varying, &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat::splat(1.0));

    // All lanes false.
    let varying = [WideFloat::splat(1.0)];
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &varying, &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat::splat(2.0));
}

#[test]
fn test_nested_conditionals_restore_masks() {
    let program = compile(
        "void main(float t, var float x){ \
           if(t < 2.0){ \
             x = 1.0; \
             if(t < 1.0){ x = 0.5; } \
           }else{ \
             x = 3.0; \
           } \
           x = x + 10.0; \
         }",
    );
    let varying = [WideFloat([0.5, 1.5, 2.5, 0.9])];
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &varying, &mut frags, WideMask::splat(true));
    // After the conditional every lane takes the unconditional add.
    assert_eq!(frags[0], WideFloat([10.5, 11.0, 13.0, 10.5]));
}

#[test]
fn test_while_loop_iterates_per_lane() {
    let program = compile(
        "void main(float n, var float acc){ \
           float i = 0.0; \
           while(i < n){ \
             acc = acc + 1.0; \
             i = i + 1.0; \
           } \
         }",
    );
    let varying = [WideFloat([0.0, 1.0, 2.0, 3.0])];
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &varying, &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat([0.0, 1.0, 2.0, 3.0]));
}

#[test]
fn test_function_call_round_trip() {
    let program = compile(
        "float add(float a, float b); \
         float add(float a, float b){ \
           return a + b; \
         } \
         void main(var float out){ \
           out = add(1.5, 2.25); \
         }",
    );
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &[], &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat::splat(3.75));
}

#[test]
fn test_function_with_divergent_stores() {
    let program = compile(
        "float clamp01(float v){ \
           var float r = v; \
           if(r < 0.0){ r = 0.0; } \
           if(r > 1.0){ r = 1.0; } \
           return r; \
         } \
         void main(float t, var float x){ \
           x = clamp01(t); \
         }",
    );
    let varying = [WideFloat([-1.0, 0.5, 2.0, 0.25])];
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &varying, &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat([0.0, 0.5, 1.0, 0.25]));
}

#[test]
fn test_nested_scopes_and_locals() {
    let program = compile(
        "void main(var float x){ \
           { \
             float a = 1.0; \
             { \
               float b = a + 1.0; \
               x = b; \
             } \
           } \
         }",
    );
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &[], &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat::splat(2.0));
}

#[test]
fn test_int_comparison_drives_branches() {
    let program = compile(
        "void main(var float x){ \
           int n = 2; \
           int m = n + 3; \
           if(m == 5){ x = 1.0; } \
         }",
    );
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &[], &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat::splat(1.0));
}

#[test]
fn test_vector_members_compute_componentwise() {
    let program = compile(
        "void main(float2 uv, var float x){ \
           x = uv.x * uv.y; \
         }",
    );
    let varying = [WideFloat::splat(3.0), WideFloat::splat(0.5)];
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &varying, &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat::splat(1.5));
}

#[test]
fn test_member_assignment_writes_one_component() {
    let program = compile(
        "void main(float t, var float2 out){ \
           out.y = t; \
         }",
    );
    let varying = [WideFloat::splat(4.0)];
    let mut frags = [WideFloat::splat(1.0), WideFloat::splat(1.0)];
    run(&program, &varying, &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat::splat(1.0));
    assert_eq!(frags[1], WideFloat::splat(4.0));
}

#[test]
fn test_lit_constants_fold_into_immediates() {
    let program = compile(
        "lit float scale = 2.0; \
         lit float bias = scale * 3.0; \
         void main(float v, var float x){ \
           x = v * scale + bias; \
         }",
    );
    let varying = [WideFloat::splat(5.0)];
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &varying, &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat::splat(16.0));
}

#[test]
fn test_serialized_program_still_executes() {
    let program = compile("void main(var float out){ out = 6.5; }");
    let bytes = program.to_bytes();
    let restored = ShaderProgram::from_bytes(&bytes).unwrap();

    let mut frags = [WideFloat::splat(0.0)];
    let mut input = InputArrays {
        constant: &[],
        varying: &[],
        fragments: &mut frags,
    };
    assert!(restored.run(&mut input, WideMask::splat(true)));
    assert_eq!(frags[0], WideFloat::splat(6.5));
}

#[test]
fn test_runs_are_referentially_isolated() {
    let program = compile("void main(float t, var float x){ x = x + t; }");

    let varying = [WideFloat::splat(1.0)];
    let mut first = [WideFloat::splat(10.0)];
    run(&program, &varying, &mut first, WideMask::splat(true));

    let varying = [WideFloat::splat(2.0)];
    let mut second = [WideFloat::splat(20.0)];
    run(&program, &varying, &mut second, WideMask::splat(true));

    // No state leaks between executions.
    assert_eq!(first[0], WideFloat::splat(11.0));
    assert_eq!(second[0], WideFloat::splat(22.0));
}

#[test]
fn test_early_return_from_main() {
    let program = compile(
        "void main(var float x){ \
           x = 1.0; \
           return; \
           x = 2.0; \
         }",
    );
    let mut frags = [WideFloat::splat(0.0)];
    run(&program, &[], &mut frags, WideMask::splat(true));
    assert_eq!(frags[0], WideFloat::splat(1.0));
}

mod imports {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    /// A scratch directory unique to this test process.
    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("glint-tests-{}", std::process::id()))
            .join(name);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_import_splices_declarations() {
        let dir = scratch("splice");
        fs::write(dir.join("consts.gl"), "lit float k = 4.0;\n").unwrap();
        fs::write(
            dir.join("main.gl"),
            "import\"consts.gl\"\nvoid main(var float x){ x = k; }\n",
        )
        .unwrap();

        let program = Compiler::new().compile_file(&dir.join("main.gl")).unwrap();
        let mut frags = [WideFloat::splat(0.0)];
        let mut input = InputArrays {
            constant: &[],
            varying: &[],
            fragments: &mut frags,
        };
        assert!(program.run(&mut input, WideMask::splat(true)));
        assert_eq!(frags[0], WideFloat::splat(4.0));
    }

    #[test]
    fn test_import_cycle_is_silently_skipped() {
        let dir = scratch("cycle");
        fs::write(
            dir.join("a.gl"),
            "import\"b.gl\"\nvoid main(var float x){ x = k; }\n",
        )
        .unwrap();
        fs::write(dir.join("b.gl"), "import\"a.gl\"\nlit float k = 7.0;\n").unwrap();

        // The a -> b -> a edge is skipped, not an error.
        let program = Compiler::new().compile_file(&dir.join("a.gl")).unwrap();
        let mut frags = [WideFloat::splat(0.0)];
        let mut input = InputArrays {
            constant: &[],
            varying: &[],
            fragments: &mut frags,
        };
        assert!(program.run(&mut input, WideMask::splat(true)));
        assert_eq!(frags[0], WideFloat::splat(7.0));
    }

    #[test]
    fn test_missing_import_is_io_diagnostic() {
        let dir = scratch("missing");
        fs::write(
            dir.join("main.gl"),
            "import\"nope.gl\"\nvoid main(){ }\n",
        )
        .unwrap();

        let err = Compiler::new()
            .compile_file(&dir.join("main.gl"))
            .unwrap_err();
        let list = err.diagnostics().expect("source diagnostics");
        assert!(
            list.0
                .iter()
                .any(|d| d.kind == crate::error::ErrorKind::IoError),
            "{}",
            list
        );
    }
}
