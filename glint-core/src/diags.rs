//! Diagnostic rendering and syntax-tree dumps.

use crate::ast::{NodeId, NodeKind, SyntaxTree};
use crate::error::Diagnostic;
use std::fmt::Write;

const EXCERPT_LIMIT: usize = 40;

/// Collapse an excerpt to a single short line for display.
pub fn shorten(excerpt: &str) -> String {
    let mut flat = String::with_capacity(excerpt.len().min(EXCERPT_LIMIT));
    for part in excerpt.split_whitespace() {
        if !flat.is_empty() {
            flat.push(' ');
        }
        flat.push_str(part);
        if flat.len() >= EXCERPT_LIMIT {
            break;
        }
    }
    if flat.len() > EXCERPT_LIMIT {
        flat.truncate(EXCERPT_LIMIT);
        flat.push_str("...");
    }
    flat
}

/// Render an ordered diagnostic list, one line per entry.
pub fn render(diags: &[Diagnostic]) -> String {
    let mut out = String::new();
    for d in diags {
        let _ = writeln!(out, "{}", d);
    }
    out
}

/// Indented dump of a subtree, for `check --dump-ast` and debugging.
pub fn dump_tree(tree: &SyntaxTree, root: NodeId) -> String {
    let mut out = String::new();
    dump_node(tree, root, 0, &mut out);
    out
}

fn dump_node(tree: &SyntaxTree, node: NodeId, depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("  ");
    }
    let _ = writeln!(out, "{}", describe(tree, node));
    for child in tree.children(node) {
        dump_node(tree, child, depth + 1, out);
    }
}

fn describe(tree: &SyntaxTree, node: NodeId) -> String {
    match tree.kind(node) {
        NodeKind::Scope => "scope".to_string(),
        NodeKind::File { path, .. } => format!("file {}", path),
        NodeKind::TypeName(ty) => match ty {
            crate::ast::TypeRef::Builtin(t) => format!("type {}", t.name()),
            crate::ast::TypeRef::Named(n) => format!("type {}", n),
        },
        NodeKind::UsrName(name) => format!("name {}", name),
        NodeKind::FnDecl => "fn-decl".to_string(),
        NodeKind::VarDecl => "var-decl".to_string(),
        NodeKind::TypeTrait(t) => format!("trait {}", t.name()),
        NodeKind::FnDef => "fn-def".to_string(),
        NodeKind::TypeDef => "type-def".to_string(),
        NodeKind::If => "if".to_string(),
        NodeKind::While => "while".to_string(),
        NodeKind::Ret => "return".to_string(),
        NodeKind::Set => "set".to_string(),
        NodeKind::Expr => "expr".to_string(),
        NodeKind::MathOp(op) => format!("op {}", op.symbol()),
        NodeKind::MemOp(m) => format!("member .{}", m),
        NodeKind::FnOp => "call".to_string(),
        NodeKind::BoolLit(v) => format!("bool {}", v),
        NodeKind::IntLit(v) => format!("int {}", v),
        NodeKind::FloatLit(v) => format!("float {}", v),
        NodeKind::Err(msg) => format!("error: {}", msg),
    }
}
