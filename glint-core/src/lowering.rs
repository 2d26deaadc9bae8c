//! AST to bytecode lowering.
//!
//! The compiler walks the syntax tree with a symbol-table scope stack
//! kept in lockstep with lexical nesting. Variables are assigned stack
//! slots as they are declared; expression evaluation works on
//! temporaries pushed above the live slots, with operand addresses
//! encoded as offsets back from the stack pointer.
//!
//! Control flow is lowered to the mask protocol: both branches of an
//! `if` are always emitted and always execute, each under a lane mask,
//! with variable stores going through predicated `mset` instructions.
//! `while` re-evaluates its condition under a monotonically shrinking
//! mask and leaves the loop once no lane remains active.
//!
//! Errors accumulate: a failed construct is skipped, a diagnostic is
//! recorded, and lowering continues so one pass reports everything.
//! Success is an empty diagnostic list after the final consistency
//! checks (exactly one `main`, every declared function defined).

use crate::ast::{MathOp, NodeId, NodeKind, ScalarType, SyntaxTree, Trait, TypeRef};
use crate::bail_type_at;
use crate::bytecode::{InputBinding, OpCode, ShaderProgram, Slot};
use crate::error::{Diagnostic, ErrorKind};
use crate::parser;
use crate::scope::ScopeStack;
use log::trace;

/// Payload of a symbol-table entry.
#[derive(Debug, Clone)]
enum Symbol {
    /// A stack-resident variable.
    Var {
        ty: ScalarType,
        access: Trait,
        slot: u32,
    },
    /// A `lit` declaration folded to per-component immediates.
    Const { ty: ScalarType, values: Vec<f32> },
    Fn(FnInfo),
}

#[derive(Debug, Clone, PartialEq)]
struct FnInfo {
    ret: ScalarType,
    params: Vec<(Trait, ScalarType)>,
    entry: Option<u32>,
    has_body: bool,
}

/// Result of lowering one expression: its type. The value occupies
/// `ty.width()` slots on top of the stack.
#[derive(Debug, Clone, Copy)]
struct ExprVal {
    ty: ScalarType,
}

pub struct LowerOutput {
    pub program: ShaderProgram,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn lower(tree: &SyntaxTree, root: NodeId) -> LowerOutput {
    let mut lowering = Lowering::new(tree);
    lowering.lower_unit(root);
    LowerOutput {
        program: lowering.program,
        diagnostics: lowering.diagnostics,
    }
}

struct Lowering<'t> {
    tree: &'t SyntaxTree,
    program: ShaderProgram,
    symbols: ScopeStack<Symbol>,
    diagnostics: Vec<Diagnostic>,
    /// Compile-time model of the runtime stack depth, in frame-local
    /// slot coordinates.
    cur_sp: u32,
    /// Stack depth at function entry; locals live above it.
    frame_base: u32,
    /// Nesting depth of divergent control flow (`if`/`while`).
    mask_depth: u32,
    /// Open lexical scopes inside the current function.
    scope_depth: u32,
    in_main: bool,
    current_ret: ScalarType,
    /// Call sites waiting for their target's entry address:
    /// (address-slot index, function name).
    fn_patches: Vec<(usize, String)>,
    /// Every function name seen, for the final consistency pass.
    fn_names: Vec<(String, NodeId)>,
    mains: Vec<NodeId>,
}

impl<'t> Lowering<'t> {
    fn new(tree: &'t SyntaxTree) -> Self {
        Lowering {
            tree,
            program: ShaderProgram::new(),
            symbols: ScopeStack::new(),
            diagnostics: Vec::new(),
            cur_sp: 0,
            frame_base: 0,
            mask_depth: 0,
            scope_depth: 0,
            in_main: false,
            current_ret: ScalarType::Void,
            fn_patches: Vec::new(),
            fn_names: Vec::new(),
            mains: Vec::new(),
        }
    }

    fn diag(&mut self, kind: ErrorKind, message: String, node: NodeId) {
        let span = self.tree.span(node);
        let excerpt = self.tree.excerpt(node);
        self.diagnostics.push(Diagnostic::new(kind, message, span, &excerpt));
    }

    fn lower_unit(&mut self, root: NodeId) {
        let statements = self.collect_file_statements(root);

        // First pass: collect function signatures and file-scope
        // constants, so calls and uses may precede definitions.
        for &stmt in &statements {
            self.collect_top_level(stmt);
        }

        // Second pass: emit code for every function body.
        for &stmt in &statements {
            if matches!(self.tree.kind(stmt), NodeKind::FnDef) {
                self.lower_fn(stmt);
            }
        }

        self.patch_calls();
        self.finish_unit(root);
    }

    /// Top-level statements of the unit, with imported files flattened
    /// into the order they were spliced.
    fn collect_file_statements(&self, file: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        for stmt in self.tree.children(file) {
            if matches!(self.tree.kind(stmt), NodeKind::File { .. }) {
                out.extend(self.collect_file_statements(stmt));
            } else {
                out.push(stmt);
            }
        }
        out
    }

    fn collect_top_level(&mut self, stmt: NodeId) {
        match self.tree.kind(stmt) {
            NodeKind::FnDecl => self.collect_fn(stmt, false),
            NodeKind::FnDef => self.collect_fn(stmt, true),
            NodeKind::VarDecl => self.collect_global(stmt),
            NodeKind::TypeDef => {
                self.diag(
                    ErrorKind::TypeError,
                    "struct types are not supported".to_string(),
                    stmt,
                );
            }
            NodeKind::Err(_) => {}
            _ => {
                self.diag(
                    ErrorKind::TypeError,
                    "statements are not allowed at file scope".to_string(),
                    stmt,
                );
            }
        }
    }

    /// Register a function declaration or definition, checking the
    /// signature against any earlier declaration of the same name.
    fn collect_fn(&mut self, node: NodeId, is_def: bool) {
        let name = match self.tree.declared_name(node) {
            Some(name) => name.to_string(),
            None => return,
        };
        let ret = self.builtin_type_of(node);
        let params = self.param_signature(node);
        let info = FnInfo {
            ret,
            params,
            entry: None,
            has_body: is_def,
        };

        let prior = match self.symbols.lookup(&name) {
            None => {
                if is_def && name == "main" {
                    self.mains.push(node);
                }
                self.fn_names.push((name.clone(), node));
                self.symbols.insert(name, Symbol::Fn(info));
                return;
            }
            Some(Symbol::Fn(prior)) => prior.clone(),
            Some(_) => {
                let message = format!("'{}' is not a function", name);
                self.diag(ErrorKind::NameError, message, node);
                return;
            }
        };

        if prior.ret != info.ret {
            let message = format!(
                "signature mismatch for function '{}': return type {} vs {}",
                name,
                info.ret.name(),
                prior.ret.name()
            );
            self.diag(ErrorKind::TypeError, message, node);
        } else if prior.params != info.params {
            let message = format!(
                "signature mismatch for function '{}': parameter list differs from its declaration",
                name
            );
            self.diag(ErrorKind::TypeError, message, node);
        } else if is_def && prior.has_body {
            let message = format!("function '{}' already has a body", name);
            self.diag(ErrorKind::TypeError, message, node);
        } else {
            if is_def && name == "main" {
                self.mains.push(node);
            }
            if let Some(Symbol::Fn(entry)) = self.symbols.lookup_mut(&name) {
                entry.has_body |= is_def;
            }
        }
    }

    /// File-scope declarations must be `lit`: mutable globals have no
    /// storage in the per-fragment register stack model.
    fn collect_global(&mut self, stmt: NodeId) {
        let access = self.trait_of(stmt);
        if access != Trait::Lit {
            self.diag(
                ErrorKind::TypeError,
                "file-scope variables must be declared 'lit'".to_string(),
                stmt,
            );
            return;
        }
        self.lower_lit_decl(stmt);
    }

    fn lower_lit_decl(&mut self, stmt: NodeId) {
        let name = match self.tree.declared_name(stmt) {
            Some(name) => name.to_string(),
            None => return,
        };
        let ty = self.builtin_type_of(stmt);
        let init = self.init_expr_of(stmt);

        let init = match init {
            Some(init) => init,
            None => {
                self.diag(
                    ErrorKind::TypeError,
                    format!("lit '{}' requires an initializer", name),
                    stmt,
                );
                return;
            }
        };
        if !parser::is_ct_const(self.tree, init) {
            self.diag(
                ErrorKind::TypeError,
                format!("initializer of lit '{}' is not a compile-time constant", name),
                stmt,
            );
            return;
        }
        match self.const_eval(init) {
            Ok((found, values)) => {
                let values = match coerce_const(ty, found, values) {
                    Some(values) => values,
                    None => {
                        self.diag(
                            ErrorKind::TypeError,
                            format!(
                                "lit '{}' has type {} but its initializer is {}",
                                name,
                                ty.name(),
                                found.name()
                            ),
                            stmt,
                        );
                        return;
                    }
                };
                self.symbols.insert(name, Symbol::Const { ty, values });
            }
            Err(d) => self.diagnostics.push(d),
        }
    }

    /// Fold a compile-time-constant expression to per-component values.
    fn const_eval(&self, node: NodeId) -> Result<(ScalarType, Vec<f32>), Diagnostic> {
        let span = self.tree.span(node);
        let excerpt = self.tree.excerpt(node);
        match self.tree.kind(node) {
            NodeKind::IntLit(v) => Ok((ScalarType::Int, vec![*v as f32])),
            NodeKind::FloatLit(v) => Ok((ScalarType::Float, vec![*v])),
            NodeKind::BoolLit(v) => Ok((ScalarType::Bool, vec![if *v { 1.0 } else { 0.0 }])),
            NodeKind::Expr => {
                let sub = match self.tree.node(node).sub {
                    Some(sub) => sub,
                    None => bail_type_at!(span, &excerpt, "empty constant expression"),
                };
                self.const_eval(sub)
            }
            NodeKind::UsrName(name) => match self.symbols.lookup(name) {
                Some(Symbol::Const { ty, values }) => Ok((*ty, values.clone())),
                _ => bail_type_at!(span, &excerpt, "'{}' is not a compile-time constant", name),
            },
            NodeKind::MathOp(op) if !op.is_comparison() => {
                let op = *op;
                let lhs = self.tree.child_at(node, 0);
                let rhs = self.tree.child_at(node, 1);
                let (lhs, rhs) = match (lhs, rhs) {
                    (Some(l), Some(r)) => (l, r),
                    _ => bail_type_at!(span, &excerpt, "malformed constant expression"),
                };
                let (lt, lv) = self.const_eval(lhs)?;
                let (rt, rv) = self.const_eval(rhs)?;
                let (ty, lv, rv) = match unify_const(lt, lv, rt, rv) {
                    Some(u) => u,
                    None => bail_type_at!(span, &excerpt, "mismatched types in constant expression"),
                };
                let values = lv
                    .iter()
                    .zip(rv.iter())
                    .map(|(a, b)| match op {
                        MathOp::Add => a + b,
                        MathOp::Sub => a - b,
                        MathOp::Mul => a * b,
                        MathOp::Div => a / b,
                        _ => unreachable!(),
                    })
                    .collect();
                Ok((ty, values))
            }
            _ => bail_type_at!(span, &excerpt, "expression cannot be folded at compile time"),
        }
    }

    // ------------------------------------------------------------------
    // Functions

    fn lower_fn(&mut self, node: NodeId) {
        let name = match self.tree.declared_name(node) {
            Some(name) => name.to_string(),
            None => return,
        };
        let info = match self.symbols.lookup(&name) {
            Some(Symbol::Fn(info)) => info.clone(),
            _ => return,
        };
        let is_main = name == "main";
        let entry = self.program.code.len() as u32;
        trace!("lowering function '{}' at {}", name, entry);

        self.symbols.push_scope();
        self.in_main = is_main;
        self.current_ret = info.ret;
        self.mask_depth = 0;
        self.scope_depth = 0;

        let ret_w = if is_main { 0 } else { info.ret.width() };
        let mut offset = ret_w;
        let mut bindings = Vec::new();
        for param in self.param_decls(node) {
            let ty = self.builtin_type_of(param);
            let access = self.trait_of(param);
            if let Some(pname) = self.tree.declared_name(param) {
                self.symbols.insert(
                    pname.to_string(),
                    Symbol::Var {
                        ty,
                        access,
                        slot: offset,
                    },
                );
                bindings.push(InputBinding {
                    name: pname.to_string(),
                    ty,
                    writable: access == Trait::Var,
                });
            }
            offset += ty.width();
        }

        if is_main {
            if info.ret != ScalarType::Void {
                self.diag(ErrorKind::TypeError, "main must return void".to_string(), node);
            }
            // main's parameter list is the shader's external contract:
            // the caller preloads these registers before entry.
            self.program.set_entry(entry);
            self.program.set_input_count(offset);
            self.program.inputs = bindings;
            self.frame_base = offset;
        } else {
            // ret slots, then parameters, then the return address.
            self.frame_base = offset + 1;
            if let Some(Symbol::Fn(info)) = self.symbols.lookup_mut(&name) {
                info.entry = Some(entry);
            }
        }
        self.cur_sp = self.frame_base;

        let body = self
            .tree
            .children(node)
            .find(|c| matches!(self.tree.kind(*c), NodeKind::Scope));
        if let Some(body) = body {
            self.lower_scope(body);
        }

        if is_main {
            self.emit_op(OpCode::End);
        } else {
            self.emit_op(OpCode::Return);
        }
        self.symbols.pop_scope();
    }

    // ------------------------------------------------------------------
    // Statements

    /// Scope entry saves the mask and opens a symbol scope; exit pops
    /// locals, restores the mask, and closes the scope. Cleanup runs
    /// unconditionally so error paths cannot unbalance the stacks.
    fn lower_scope(&mut self, scope: NodeId) {
        self.symbols.push_scope();
        self.scope_depth += 1;
        self.emit_op(OpCode::TestPush);
        let sp_at_entry = self.cur_sp;

        for stmt in self.tree.children(scope) {
            self.lower_statement(stmt);
        }

        let locals = self.cur_sp - sp_at_entry;
        self.emit_pop(locals);
        self.emit_op(OpCode::TestPop);
        self.scope_depth -= 1;
        self.symbols.pop_scope();
    }

    fn lower_statement(&mut self, stmt: NodeId) {
        match self.tree.kind(stmt) {
            NodeKind::VarDecl => self.lower_var_decl(stmt),
            NodeKind::If => self.lower_if(stmt),
            NodeKind::While => self.lower_while(stmt),
            NodeKind::Ret => self.lower_ret(stmt),
            NodeKind::Scope => self.lower_scope(stmt),
            NodeKind::Expr => self.lower_expr_statement(stmt),
            NodeKind::File { .. } => {
                for stmt in self.collect_file_statements(stmt) {
                    self.lower_statement(stmt);
                }
            }
            NodeKind::TypeDef => {
                self.diag(
                    ErrorKind::TypeError,
                    "struct types are not supported".to_string(),
                    stmt,
                );
            }
            NodeKind::FnDecl | NodeKind::FnDef => {
                self.diag(
                    ErrorKind::TypeError,
                    "functions may only be declared at file scope".to_string(),
                    stmt,
                );
            }
            NodeKind::Err(_) => {}
            _ => {
                self.diag(
                    ErrorKind::TypeError,
                    "unexpected statement".to_string(),
                    stmt,
                );
            }
        }
    }

    fn lower_var_decl(&mut self, stmt: NodeId) {
        let access = self.trait_of(stmt);
        if access == Trait::Lit {
            self.lower_lit_decl(stmt);
            return;
        }

        let name = match self.tree.declared_name(stmt) {
            Some(name) => name.to_string(),
            None => return,
        };
        let ty_node = self.type_node_of(stmt);
        if let Some(NodeKind::TypeName(TypeRef::Named(_))) = ty_node.map(|t| self.tree.kind(t)) {
            self.diag(
                ErrorKind::TypeError,
                "struct types are not supported".to_string(),
                stmt,
            );
            return;
        }
        let ty = self.builtin_type_of(stmt);

        // The initializer's result slots become the variable's storage;
        // without one the slots are pushed zeroed.
        let slot = self.cur_sp;
        match self.init_expr_of(stmt) {
            Some(init) => {
                if self.lower_expr(init, Some(ty)).is_err() {
                    self.emit_push(ty.width());
                }
            }
            None => self.emit_push(ty.width()),
        }

        self.symbols.insert(name, Symbol::Var { ty, access, slot });
    }

    fn lower_if(&mut self, stmt: NodeId) {
        let cond = self.tree.child_at(stmt, 0);
        let then_scope = self.tree.child_at(stmt, 1);
        let else_scope = self.tree.child_at(stmt, 2);

        if let Some(cond) = cond {
            let _ = self.lower_condition(cond);
        }

        // Save the enclosing mask, then narrow to the lanes whose test
        // passed. Both branches are emitted and both always execute.
        self.emit_op(OpCode::TestPush);
        self.emit_op(OpCode::TestAnd);
        self.mask_depth += 1;

        if let Some(then_scope) = then_scope {
            self.lower_scope(then_scope);
        }
        if let Some(else_scope) = else_scope {
            self.emit_op(OpCode::TestInv);
            self.lower_scope(else_scope);
        }

        self.emit_op(OpCode::TestPop);
        self.mask_depth -= 1;
    }

    fn lower_while(&mut self, stmt: NodeId) {
        let cond = self.tree.child_at(stmt, 0);
        let body = self.tree.child_at(stmt, 1);

        self.emit_op(OpCode::TestPush);
        self.mask_depth += 1;

        let loop_head = self.program.code.len() as u32;
        if let Some(cond) = cond {
            let _ = self.lower_condition(cond);
        }
        // Lanes leave the loop monotonically: the mask only shrinks.
        self.emit_op(OpCode::TestAnd);
        self.emit_op(OpCode::TestJz);
        let exit_patch = self.program.code.len();
        self.program.code.push(Slot::Addr(0));

        if let Some(body) = body {
            self.lower_scope(body);
        }
        self.emit_op(OpCode::Jmp);
        self.program.code.push(Slot::Addr(loop_head));
        let exit = self.program.code.len() as u32;
        self.program.code[exit_patch] = Slot::Addr(exit);

        self.emit_op(OpCode::TestPop);
        self.mask_depth -= 1;
    }

    fn lower_ret(&mut self, stmt: NodeId) {
        let value = self.tree.node(stmt).sub;

        if self.current_ret == ScalarType::Void {
            if value.is_some() {
                self.diag(
                    ErrorKind::TypeError,
                    if self.in_main {
                        "main returns void".to_string()
                    } else {
                        "void function cannot return a value".to_string()
                    },
                    stmt,
                );
                return;
            }
        } else {
            let value = match value {
                Some(value) => value,
                None => {
                    self.diag(
                        ErrorKind::TypeError,
                        format!("return value of type {} required", self.current_ret.name()),
                        stmt,
                    );
                    return;
                }
            };
            let ty = self.current_ret;
            if self.lower_expr(value, Some(ty)).is_err() {
                return;
            }
            // Store into the return slots at the bottom of the frame,
            // masked so divergent lanes merge correctly.
            let w = ty.width();
            for i in 0..w {
                self.emit_rr(OpCode::MsetRr, self.cur_sp - i, w - i);
            }
            self.emit_pop(w);
        }

        // Under a divergent mask lanes cannot branch out individually;
        // the value is merged and execution continues. At top level the
        // exit is real: unwind the mask stack and leave the function.
        if self.mask_depth == 0 {
            if self.in_main {
                self.emit_op(OpCode::End);
            } else {
                for _ in 0..self.scope_depth {
                    self.emit_op(OpCode::TestPop);
                }
                let locals = self.cur_sp - self.frame_base;
                if locals > 0 {
                    // Raw emission: the compile-time stack model must
                    // keep tracking the scope's slots for the (dead)
                    // code that follows this return.
                    self.emit_op(OpCode::Pop);
                    self.program.code.push(Slot::Addr(locals));
                }
                self.emit_op(OpCode::Return);
            }
        }
    }

    fn lower_expr_statement(&mut self, stmt: NodeId) {
        let root = match self.tree.node(stmt).sub {
            Some(root) => root,
            None => return,
        };
        match self.tree.kind(root) {
            NodeKind::Set => self.lower_set(root),
            NodeKind::FnOp => {
                if let Ok(val) = self.lower_expr(root, None) {
                    self.emit_pop(val.ty.width());
                }
            }
            NodeKind::Err(_) => {}
            _ => {
                self.diag(
                    ErrorKind::TypeError,
                    "expression statement has no effect".to_string(),
                    stmt,
                );
            }
        }
    }

    /// `target = value`: evaluate the value, then predicated-store it
    /// into the target's slots so only active lanes observe the write.
    fn lower_set(&mut self, set: NodeId) {
        let lhs = self.tree.child_at(set, 0);
        let rhs = self.tree.child_at(set, 1);
        let (lhs, rhs) = match (lhs, rhs) {
            (Some(l), Some(r)) => (l, r),
            _ => return,
        };

        let (slot, ty) = match self.assign_target(lhs) {
            Some(target) => target,
            None => return,
        };

        if self.lower_expr(rhs, Some(ty)).is_err() {
            return;
        }
        let w = ty.width();
        for i in 0..w {
            self.emit_rr(OpCode::MsetRr, self.cur_sp - (slot + i), w - i);
        }
        self.emit_pop(w);
    }

    /// Resolve an assignment target to (absolute slot, type), checking
    /// mutability.
    fn assign_target(&mut self, lhs: NodeId) -> Option<(u32, ScalarType)> {
        match self.tree.kind(lhs).clone() {
            NodeKind::UsrName(name) => match self.symbols.lookup(&name) {
                Some(Symbol::Var { ty, access, slot }) => {
                    let (ty, access, slot) = (*ty, *access, *slot);
                    if access != Trait::Var {
                        self.diag(
                            ErrorKind::TypeError,
                            format!("cannot assign to {} '{}'", access.name(), name),
                            lhs,
                        );
                        return None;
                    }
                    Some((slot, ty))
                }
                Some(Symbol::Const { .. }) => {
                    self.diag(
                        ErrorKind::TypeError,
                        format!("cannot assign to lit '{}'", name),
                        lhs,
                    );
                    None
                }
                _ => {
                    self.diag(
                        ErrorKind::NameError,
                        format!("undeclared name '{}'", name),
                        lhs,
                    );
                    None
                }
            },
            NodeKind::MemOp(member) => {
                let base = self.tree.node(lhs).sub?;
                let (base_slot, base_ty) = match self.assign_target_base(base) {
                    Some(b) => b,
                    None => return None,
                };
                let index = component_index(base_ty, &member)?;
                Some((base_slot + index, base_ty.component()))
            }
            NodeKind::Err(_) => None,
            _ => {
                self.diag(
                    ErrorKind::TypeError,
                    "invalid assignment target".to_string(),
                    lhs,
                );
                None
            }
        }
    }

    fn assign_target_base(&mut self, base: NodeId) -> Option<(u32, ScalarType)> {
        if let NodeKind::UsrName(name) = self.tree.kind(base).clone() {
            match self.symbols.lookup(&name) {
                Some(Symbol::Var { ty, access, slot }) => {
                    let (ty, access, slot) = (*ty, *access, *slot);
                    if access != Trait::Var {
                        self.diag(
                            ErrorKind::TypeError,
                            format!("cannot assign to {} '{}'", access.name(), name),
                            base,
                        );
                        return None;
                    }
                    Some((slot, ty))
                }
                _ => {
                    self.diag(
                        ErrorKind::NameError,
                        format!("undeclared name '{}'", name),
                        base,
                    );
                    None
                }
            }
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Conditions

    /// Stage a branch test: comparisons go straight to the test
    /// register; any other scalar value is tested against zero. Net
    /// stack effect is zero.
    fn lower_condition(&mut self, cond: NodeId) -> Result<(), ()> {
        let root = match self.tree.node(cond).sub {
            Some(root) => root,
            None => return Err(()),
        };
        match self.tree.kind(root) {
            NodeKind::MathOp(op) if op.is_comparison() => {
                let op = *op;
                let lhs = self.tree.child_at(root, 0);
                let rhs = self.tree.child_at(root, 1);
                let (lhs, rhs) = match (lhs, rhs) {
                    (Some(l), Some(r)) => (l, r),
                    _ => return Err(()),
                };

                let want = self.infer_type(lhs).or_else(|| self.infer_type(rhs));
                let lv = self.lower_expr(lhs, want)?;
                if lv.ty.is_vector() {
                    self.diag(
                        ErrorKind::TypeError,
                        "comparison requires scalar operands".to_string(),
                        root,
                    );
                    self.emit_pop(lv.ty.width());
                    return Err(());
                }

                if let Some(value) = self.literal_value(rhs, lv.ty) {
                    self.emit_ri(compare_ri(op), 1, value);
                    self.emit_pop(1);
                } else {
                    let rv = match self.lower_expr(rhs, Some(lv.ty)) {
                        Ok(rv) => rv,
                        Err(()) => {
                            self.emit_pop(1);
                            return Err(());
                        }
                    };
                    debug_assert_eq!(rv.ty, lv.ty);
                    self.emit_rr(compare_rr(op), 2, 1);
                    self.emit_pop(2);
                }
                Ok(())
            }
            NodeKind::Err(_) => Err(()),
            _ => {
                let val = self.lower_expr(root, None)?;
                if val.ty.is_vector() || val.ty == ScalarType::Void {
                    self.diag(
                        ErrorKind::TypeError,
                        "branch condition must be scalar".to_string(),
                        root,
                    );
                    self.emit_pop(val.ty.width());
                    return Err(());
                }
                self.emit_ri(OpCode::NeRi, 1, 0.0);
                self.emit_pop(1);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions

    /// Lower an expression, leaving its value in fresh slots on top of
    /// the stack. `want` propagates an expected type down to literals,
    /// which is the only coercion in the language. On `Err` the stack
    /// model is unchanged and a diagnostic has been recorded (except
    /// for `Err` nodes, which were reported by the parser).
    fn lower_expr(&mut self, node: NodeId, want: Option<ScalarType>) -> Result<ExprVal, ()> {
        match self.tree.kind(node).clone() {
            NodeKind::Expr => {
                let sub = self.tree.node(node).sub.ok_or(())?;
                self.lower_expr(sub, want)
            }
            NodeKind::IntLit(v) => {
                let ty = match want {
                    None | Some(ScalarType::Int) => ScalarType::Int,
                    Some(ScalarType::Float) => ScalarType::Float,
                    Some(other) => return self.type_mismatch(node, other, ScalarType::Int),
                };
                self.emit_push(1);
                self.emit_ri(OpCode::SetRi, 1, v as f32);
                Ok(ExprVal { ty })
            }
            NodeKind::FloatLit(v) => {
                let ty = match want {
                    None | Some(ScalarType::Float) => ScalarType::Float,
                    Some(other) => return self.type_mismatch(node, other, ScalarType::Float),
                };
                self.emit_push(1);
                self.emit_ri(OpCode::SetRi, 1, v);
                Ok(ExprVal { ty })
            }
            NodeKind::BoolLit(v) => {
                let ty = match want {
                    None | Some(ScalarType::Bool) => ScalarType::Bool,
                    Some(other) => return self.type_mismatch(node, other, ScalarType::Bool),
                };
                self.emit_push(1);
                self.emit_ri(OpCode::SetRi, 1, if v { 1.0 } else { 0.0 });
                Ok(ExprVal { ty })
            }
            NodeKind::UsrName(name) => match self.symbols.lookup(&name) {
                Some(Symbol::Var { ty, slot, .. }) => {
                    let (ty, slot) = (*ty, *slot);
                    if let Some(want) = want {
                        if want != ty {
                            return self.type_mismatch(node, want, ty);
                        }
                    }
                    let w = ty.width();
                    self.emit_push(w);
                    for i in 0..w {
                        self.emit_rr(OpCode::SetRr, w - i, self.cur_sp - (slot + i));
                    }
                    Ok(ExprVal { ty })
                }
                Some(Symbol::Const { ty, values }) => {
                    let (ty, values) = (*ty, values.clone());
                    if let Some(want) = want {
                        if want != ty && !(want == ScalarType::Float && ty == ScalarType::Int) {
                            return self.type_mismatch(node, want, ty);
                        }
                    }
                    let w = ty.width();
                    self.emit_push(w);
                    for (i, v) in values.iter().enumerate() {
                        self.emit_ri(OpCode::SetRi, w - i as u32, *v);
                    }
                    Ok(ExprVal { ty })
                }
                Some(Symbol::Fn(_)) => {
                    self.diag(
                        ErrorKind::TypeError,
                        format!("function '{}' used as a value", name),
                        node,
                    );
                    Err(())
                }
                None => {
                    self.diag(
                        ErrorKind::NameError,
                        format!("undeclared name '{}'", name),
                        node,
                    );
                    Err(())
                }
            },
            NodeKind::MemOp(member) => self.lower_member(node, &member, want),
            NodeKind::MathOp(op) => self.lower_math(node, op, want),
            NodeKind::FnOp => self.lower_call(node, want),
            NodeKind::Set => {
                self.diag(
                    ErrorKind::TypeError,
                    "assignment is not an expression".to_string(),
                    node,
                );
                Err(())
            }
            NodeKind::Err(_) => Err(()),
            _ => {
                self.diag(
                    ErrorKind::TypeError,
                    "unexpected expression node".to_string(),
                    node,
                );
                Err(())
            }
        }
    }

    fn lower_member(
        &mut self,
        node: NodeId,
        member: &str,
        want: Option<ScalarType>,
    ) -> Result<ExprVal, ()> {
        let base = self.tree.node(node).sub.ok_or(())?;
        let name = match self.tree.kind(base) {
            NodeKind::UsrName(name) => name.clone(),
            _ => return Err(()),
        };
        match self.symbols.lookup(&name) {
            Some(Symbol::Var { ty, slot, .. }) => {
                let (ty, slot) = (*ty, *slot);
                let index = match component_index(ty, member) {
                    Some(index) => index,
                    None => {
                        self.diag(
                            ErrorKind::NameError,
                            format!("type {} has no member '{}'", ty.name(), member),
                            node,
                        );
                        return Err(());
                    }
                };
                let component = ty.component();
                if let Some(want) = want {
                    if want != component {
                        return self.type_mismatch(node, want, component);
                    }
                }
                self.emit_push(1);
                self.emit_rr(OpCode::SetRr, 1, self.cur_sp - (slot + index));
                Ok(ExprVal { ty: component })
            }
            _ => {
                self.diag(
                    ErrorKind::NameError,
                    format!("undeclared name '{}'", name),
                    node,
                );
                Err(())
            }
        }
    }

    fn lower_math(
        &mut self,
        node: NodeId,
        op: MathOp,
        want: Option<ScalarType>,
    ) -> Result<ExprVal, ()> {
        if op.is_comparison() {
            self.diag(
                ErrorKind::TypeError,
                "comparison is only allowed as a branch condition".to_string(),
                node,
            );
            return Err(());
        }
        let lhs = self.tree.child_at(node, 0).ok_or(())?;
        let rhs = self.tree.child_at(node, 1).ok_or(())?;

        // Literals are polymorphic between int and float; pin them to
        // whatever the non-literal side or the caller expects.
        let want = want
            .or_else(|| self.infer_type(lhs))
            .or_else(|| self.infer_type(rhs));

        let lv = self.lower_expr(lhs, want)?;
        if lv.ty == ScalarType::Bool || lv.ty == ScalarType::Void {
            self.diag(
                ErrorKind::TypeError,
                format!("arithmetic on {}", lv.ty.name()),
                node,
            );
            self.emit_pop(lv.ty.width());
            return Err(());
        }
        let w = lv.ty.width();

        // Register-immediate form when the right side is a scalar
        // literal; saves a push/pop pair per operation.
        if w == 1 {
            if let Some(value) = self.literal_value(rhs, lv.ty) {
                self.emit_ri(arith_ri(op), 1, value);
                return Ok(ExprVal { ty: lv.ty });
            }
        }

        let rv = match self.lower_expr(rhs, Some(lv.ty)) {
            Ok(rv) => rv,
            Err(()) => {
                self.emit_pop(w);
                return Err(());
            }
        };
        debug_assert_eq!(rv.ty, lv.ty);
        for i in 0..w {
            self.emit_rr(arith_rr(op), 2 * w - i, w - i);
        }
        self.emit_pop(w);
        Ok(ExprVal { ty: lv.ty })
    }

    /// Call protocol: push return slots, evaluate arguments in order,
    /// push the return address, jump. The callee pops the return
    /// address; the caller pops the arguments, leaving the return value
    /// on top.
    fn lower_call(&mut self, node: NodeId, want: Option<ScalarType>) -> Result<ExprVal, ()> {
        let name_node = self.tree.node(node).sub.ok_or(())?;
        let name = match self.tree.kind(name_node) {
            NodeKind::UsrName(name) => name.clone(),
            _ => return Err(()),
        };
        let info = match self.symbols.lookup(&name) {
            Some(Symbol::Fn(info)) => info.clone(),
            _ => {
                self.diag(
                    ErrorKind::NameError,
                    format!("call to undeclared function '{}'", name),
                    node,
                );
                return Err(());
            }
        };

        if let Some(want) = want {
            if want != info.ret {
                return self.type_mismatch(node, want, info.ret);
            }
        }

        let args: Vec<NodeId> = self.tree.children(node).skip(1).collect();
        if args.len() != info.params.len() {
            self.diag(
                ErrorKind::TypeError,
                format!(
                    "function '{}' expects {} arguments, got {}",
                    name,
                    info.params.len(),
                    args.len()
                ),
                node,
            );
            return Err(());
        }

        let ret_w = info.ret.width();
        self.emit_push(ret_w);

        let mut args_w = 0;
        for (arg, (_, pty)) in args.iter().zip(info.params.iter()) {
            match self.lower_expr(*arg, Some(*pty)) {
                Ok(_) => args_w += pty.width(),
                Err(()) => {
                    self.emit_pop(ret_w + args_w);
                    return Err(());
                }
            }
        }

        self.emit_push(1);
        self.emit_op(OpCode::SetRi);
        self.program.code.push(Slot::Addr(1));
        let imm_at = self.program.code.len();
        self.program.code.push(Slot::Imm(0.0));
        self.emit_op(OpCode::Jmp);
        self.fn_patches.push((self.program.code.len(), name));
        self.program.code.push(Slot::Addr(0));
        // Execution resumes here; the return address is now known.
        self.program.code[imm_at] = Slot::Imm(self.program.code.len() as f32);

        // The callee's `return` popped the return-address slot.
        self.cur_sp -= 1;
        self.emit_pop(args_w);

        Ok(ExprVal { ty: info.ret })
    }

    // ------------------------------------------------------------------
    // Helpers

    fn type_mismatch(
        &mut self,
        node: NodeId,
        want: ScalarType,
        found: ScalarType,
    ) -> Result<ExprVal, ()> {
        self.diag(
            ErrorKind::TypeError,
            format!("type mismatch: expected {}, found {}", want.name(), found.name()),
            node,
        );
        Err(())
    }

    /// The type an expression will evaluate to, where it can be read
    /// off declarations without emitting code. Literals report `None`
    /// so callers can pin them from context.
    fn infer_type(&self, node: NodeId) -> Option<ScalarType> {
        match self.tree.kind(node) {
            NodeKind::Expr => self.tree.node(node).sub.and_then(|s| self.infer_type(s)),
            NodeKind::UsrName(name) => match self.symbols.lookup(name) {
                Some(Symbol::Var { ty, .. }) | Some(Symbol::Const { ty, .. }) => Some(*ty),
                _ => None,
            },
            NodeKind::MemOp(_) => {
                let base = self.tree.node(node).sub?;
                self.infer_type(base).map(ScalarType::component)
            }
            NodeKind::FnOp => {
                let name_node = self.tree.node(node).sub?;
                if let NodeKind::UsrName(name) = self.tree.kind(name_node) {
                    if let Some(Symbol::Fn(info)) = self.symbols.lookup(name) {
                        return Some(info.ret);
                    }
                }
                None
            }
            NodeKind::MathOp(op) if !op.is_comparison() => self
                .tree
                .children(node)
                .find_map(|c| self.infer_type(c)),
            NodeKind::BoolLit(_) => Some(ScalarType::Bool),
            NodeKind::FloatLit(_) => Some(ScalarType::Float),
            _ => None,
        }
    }

    /// A literal usable as an immediate operand of the given type.
    fn literal_value(&self, node: NodeId, ty: ScalarType) -> Option<f32> {
        match self.tree.kind(node) {
            NodeKind::IntLit(v) if ty == ScalarType::Int || ty == ScalarType::Float => {
                Some(*v as f32)
            }
            NodeKind::FloatLit(v) if ty == ScalarType::Float => Some(*v),
            NodeKind::Expr => {
                let sub = self.tree.node(node).sub?;
                self.literal_value(sub, ty)
            }
            _ => None,
        }
    }

    fn trait_of(&self, decl: NodeId) -> Trait {
        self.tree
            .children(decl)
            .find_map(|c| match self.tree.kind(c) {
                NodeKind::TypeTrait(t) => Some(*t),
                _ => None,
            })
            .unwrap_or(Trait::Var)
    }

    fn type_node_of(&self, decl: NodeId) -> Option<NodeId> {
        self.tree
            .children(decl)
            .find(|c| matches!(self.tree.kind(*c), NodeKind::TypeName(_)))
    }

    /// The declared built-in type, defaulting to float when the type is
    /// missing or user-defined so lowering can continue past the
    /// already-reported error.
    fn builtin_type_of(&self, decl: NodeId) -> ScalarType {
        match self.type_node_of(decl).map(|t| self.tree.kind(t)) {
            Some(NodeKind::TypeName(TypeRef::Builtin(ty))) => *ty,
            _ => ScalarType::Float,
        }
    }

    fn init_expr_of(&self, decl: NodeId) -> Option<NodeId> {
        // The initializer is whatever follows the name child.
        let mut seen_name = false;
        for c in self.tree.children(decl) {
            if seen_name {
                return Some(c);
            }
            if matches!(self.tree.kind(c), NodeKind::UsrName(_)) {
                seen_name = true;
            }
        }
        None
    }

    fn param_decls(&self, fn_node: NodeId) -> Vec<NodeId> {
        self.tree
            .children(fn_node)
            .filter(|c| matches!(self.tree.kind(*c), NodeKind::VarDecl))
            .collect()
    }

    fn param_signature(&self, fn_node: NodeId) -> Vec<(Trait, ScalarType)> {
        self.param_decls(fn_node)
            .iter()
            .map(|&p| (self.trait_of(p), self.builtin_type_of(p)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Emission

    fn emit_op(&mut self, op: OpCode) {
        self.program.code.push(Slot::Op(op));
    }

    fn emit_rr(&mut self, op: OpCode, dst: u32, src: u32) {
        self.program.code.push(Slot::Op(op));
        self.program.code.push(Slot::Addr(dst));
        self.program.code.push(Slot::Addr(src));
    }

    fn emit_ri(&mut self, op: OpCode, dst: u32, imm: f32) {
        self.program.code.push(Slot::Op(op));
        self.program.code.push(Slot::Addr(dst));
        self.program.code.push(Slot::Imm(imm));
    }

    fn emit_push(&mut self, n: u32) {
        if n > 0 {
            self.program.code.push(Slot::Op(OpCode::Push));
            self.program.code.push(Slot::Addr(n));
            self.cur_sp += n;
        }
    }

    fn emit_pop(&mut self, n: u32) {
        if n > 0 {
            self.program.code.push(Slot::Op(OpCode::Pop));
            self.program.code.push(Slot::Addr(n));
            self.cur_sp -= n;
        }
    }

    // ------------------------------------------------------------------
    // Finalization

    fn patch_calls(&mut self) {
        let patches = std::mem::take(&mut self.fn_patches);
        for (at, name) in patches {
            let entry = match self.symbols.lookup(&name) {
                Some(Symbol::Fn(info)) => info.entry,
                _ => None,
            };
            // Undefined targets are reported by the consistency pass;
            // the placeholder stays, and the unit is already failed.
            if let Some(entry) = entry {
                self.program.code[at] = Slot::Addr(entry);
            }
        }
    }

    /// Whole-unit checks that only make sense once everything has been
    /// seen: `main` multiplicity and declared-but-undefined functions.
    fn finish_unit(&mut self, root: NodeId) {
        let names = std::mem::take(&mut self.fn_names);
        for (name, node) in names {
            let defined = match self.symbols.lookup(&name) {
                Some(Symbol::Fn(info)) => info.has_body,
                _ => true,
            };
            if !defined {
                self.diag(
                    ErrorKind::TypeError,
                    format!("function '{}' is declared but never defined", name),
                    node,
                );
            }
        }

        if self.mains.len() != 1 {
            self.diag(
                ErrorKind::TypeError,
                format!(
                    "program must define exactly one 'main', found {}",
                    self.mains.len()
                ),
                root,
            );
        }
    }
}

fn component_index(ty: ScalarType, member: &str) -> Option<u32> {
    if member.len() != 1 || !ty.is_vector() {
        return None;
    }
    let index = "xyzw".find(member)? as u32;
    if index < ty.width() {
        Some(index)
    } else {
        None
    }
}

fn arith_rr(op: MathOp) -> OpCode {
    match op {
        MathOp::Add => OpCode::AddRr,
        MathOp::Sub => OpCode::SubRr,
        MathOp::Mul => OpCode::MulRr,
        MathOp::Div => OpCode::DivRr,
        _ => unreachable!(),
    }
}

fn arith_ri(op: MathOp) -> OpCode {
    match op {
        MathOp::Add => OpCode::AddRi,
        MathOp::Sub => OpCode::SubRi,
        MathOp::Mul => OpCode::MulRi,
        MathOp::Div => OpCode::DivRi,
        _ => unreachable!(),
    }
}

fn compare_rr(op: MathOp) -> OpCode {
    match op {
        MathOp::Eq => OpCode::EqRr,
        MathOp::Ne => OpCode::NeRr,
        MathOp::Lt => OpCode::LtRr,
        MathOp::Le => OpCode::LeRr,
        MathOp::Gt => OpCode::GtRr,
        MathOp::Ge => OpCode::GeRr,
        _ => unreachable!(),
    }
}

fn compare_ri(op: MathOp) -> OpCode {
    match op {
        MathOp::Eq => OpCode::EqRi,
        MathOp::Ne => OpCode::NeRi,
        MathOp::Lt => OpCode::LtRi,
        MathOp::Le => OpCode::LeRi,
        MathOp::Gt => OpCode::GtRi,
        MathOp::Ge => OpCode::GeRi,
        _ => unreachable!(),
    }
}

/// Coerce a folded constant to the declared type. The only coercion is
/// int literal to float.
fn coerce_const(want: ScalarType, found: ScalarType, values: Vec<f32>) -> Option<Vec<f32>> {
    if want == found || (want == ScalarType::Float && found == ScalarType::Int) {
        Some(values)
    } else {
        None
    }
}

/// Unify two folded constants for arithmetic: equal types, or int
/// widening to float.
fn unify_const(
    lt: ScalarType,
    lv: Vec<f32>,
    rt: ScalarType,
    rv: Vec<f32>,
) -> Option<(ScalarType, Vec<f32>, Vec<f32>)> {
    if lt == rt {
        return Some((lt, lv, rv));
    }
    match (lt, rt) {
        (ScalarType::Float, ScalarType::Int) => Some((ScalarType::Float, lv, rv)),
        (ScalarType::Int, ScalarType::Float) => Some((ScalarType::Float, lv, rv)),
        _ => None,
    }
}
