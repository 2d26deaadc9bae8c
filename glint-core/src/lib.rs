pub mod ast;
pub mod bytecode;
pub mod diags;
pub mod error;
pub mod lowering;
pub mod matcher;
pub mod modules;
pub mod parser;
pub mod scope;
pub mod vm;


#[cfg(test)]
mod lowering_tests;

#[cfg(test)]
mod integration_tests;

use error::{CompilerError, DiagnosticList, Result};
use std::path::Path;

pub use bytecode::ShaderProgram;
pub use vm::{InputArrays, WideFloat, WideMask, LANES};

pub struct Compiler;

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Compiler
    }

    /// Parse and resolve names without generating bytecode.
    pub fn check_only(&self, source: &str) -> Result<()> {
        let mut loader = modules::ModuleLoader::new();
        let parsed = parser::parse_source(source, &mut loader);
        let lowered = lowering::lower(&parsed.tree, parsed.root);
        collect(parsed.diagnostics, lowered.diagnostics)?;
        Ok(())
    }

    /// Parse only; returns the tree alongside any diagnostics so
    /// drivers can dump the AST even for failing units.
    pub fn parse(&self, source: &str) -> parser::ParseOutput {
        let mut loader = modules::ModuleLoader::new();
        parser::parse_source(source, &mut loader)
    }

    /// Compile a source string to an executable program.
    pub fn compile(&self, source: &str) -> Result<ShaderProgram> {
        let mut loader = modules::ModuleLoader::new();
        let parsed = parser::parse_source(source, &mut loader);
        let lowered = lowering::lower(&parsed.tree, parsed.root);
        collect(parsed.diagnostics, lowered.diagnostics)?;
        Ok(lowered.program)
    }

    /// Compile a file, resolving imports relative to its directory.
    pub fn compile_file(&self, path: &Path) -> Result<ShaderProgram> {
        let mut loader = modules::ModuleLoader::new();
        let parsed = parser::parse_file(path, &mut loader)?;
        let lowered = lowering::lower(&parsed.tree, parsed.root);
        collect(parsed.diagnostics, lowered.diagnostics)?;
        Ok(lowered.program)
    }
}

/// Success is an empty accumulated error list across both stages.
fn collect(
    parse: Vec<error::Diagnostic>,
    lower: Vec<error::Diagnostic>,
) -> Result<()> {
    let mut all = parse;
    all.extend(lower);
    if all.is_empty() {
        Ok(())
    } else {
        Err(CompilerError::Source(DiagnosticList(all)))
    }
}
