use clap::{Parser, Subcommand};
use glint_core::vm::{InputArrays, WideFloat, WideMask, LANES};
use glint_core::{diags, Compiler};
use log::info;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "glint")]
#[command(about = "Compiler and SIMD virtual machine for the glint shading language", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source file to bytecode
    Compile {
        /// Input source file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output bytecode file (defaults to input name with .glb extension)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Print verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a source file without generating output
    Check {
        /// Input source file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Dump the syntax tree to stdout
        #[arg(long)]
        dump_ast: bool,
    },

    /// Compile and print the instruction listing
    Disasm {
        /// Input source file
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Compile and execute one fragment block, printing the fragment
    /// registers afterwards
    Run {
        /// Input source file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Seed values for the read-only inputs, in parameter order
        #[arg(short, long, value_delimiter = ',')]
        seed: Vec<f32>,
    },
}

#[derive(Debug, Error)]
enum DriverError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    CompilationError(#[from] glint_core::error::CompilerError),

    #[error("execution failed (malformed bytecode)")]
    ExecutionError,
}

fn main() -> Result<(), DriverError> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            input,
            output,
            verbose,
        } => compile_file(input, output, verbose)?,
        Commands::Check { input, dump_ast } => check_file(input, dump_ast)?,
        Commands::Disasm { input } => disasm_file(input)?,
        Commands::Run { input, seed } => run_file(input, seed)?,
    }

    Ok(())
}

fn compile_file(input: PathBuf, output: Option<PathBuf>, verbose: bool) -> Result<(), DriverError> {
    if verbose {
        info!("Compiling {}...", input.display());
    }

    let program = Compiler::new().compile_file(&input)?;

    let output_path = output.unwrap_or_else(|| {
        let mut path = input.clone();
        path.set_extension("glb");
        path
    });

    let mut file = fs::File::create(&output_path)?;
    let bytes = program.to_bytes();
    file.write_all(&bytes)?;

    if verbose {
        info!("Successfully compiled to {}", output_path.display());
        info!(
            "Generated {} slots of bytecode for {} input registers",
            program.code().len(),
            program.input_count()
        );
    }

    Ok(())
}

fn check_file(input: PathBuf, dump_ast: bool) -> Result<(), DriverError> {
    let source = fs::read_to_string(&input)?;
    let compiler = Compiler::new();

    if dump_ast {
        let parsed = compiler.parse(&source);
        print!("{}", diags::dump_tree(&parsed.tree, parsed.root));
    }

    compiler.check_only(&source)?;
    println!("{}: ok", input.display());
    Ok(())
}

fn disasm_file(input: PathBuf) -> Result<(), DriverError> {
    let program = Compiler::new().compile_file(&input)?;
    print!("{}", program.disassemble());
    Ok(())
}

fn run_file(input: PathBuf, seed: Vec<f32>) -> Result<(), DriverError> {
    let program = Compiler::new().compile_file(&input)?;

    // Read-only parameters form the varying block, writable ones the
    // fragment block; seeds fill varying components in order.
    let mut varying = Vec::new();
    let mut fragments = Vec::new();
    let mut frag_names = Vec::new();
    let mut next_seed = seed.into_iter();
    for binding in program.inputs() {
        for c in 0..binding.ty.width() {
            if binding.writable {
                fragments.push(WideFloat::splat(0.0));
                frag_names.push(component_name(binding, c));
            } else {
                let v = next_seed.next().unwrap_or(0.0);
                varying.push(WideFloat::splat(v));
            }
        }
    }

    let mut input_arrays = InputArrays {
        constant: &[],
        varying: &varying,
        fragments: &mut fragments,
    };
    if !program.run(&mut input_arrays, WideMask::splat(true)) {
        return Err(DriverError::ExecutionError);
    }

    for (name, value) in frag_names.iter().zip(fragments.iter()) {
        let lanes: Vec<String> = (0..LANES).map(|i| format!("{}", value.lane(i))).collect();
        println!("{} = [{}]", name, lanes.join(", "));
    }
    Ok(())
}

fn component_name(binding: &glint_core::bytecode::InputBinding, component: u32) -> String {
    if binding.ty.width() > 1 {
        format!("{}.{}", binding.name, ['x', 'y', 'z', 'w'][component as usize])
    } else {
        binding.name.clone()
    }
}
