//! Recursive-descent AST generation over the pattern matcher.
//!
//! Name resolution happens during parsing: declarations are checked for
//! reserved words and collisions up the whole scope chain (shadowing is
//! not permitted), references attach a lookup edge to the declaration
//! they resolve to. On any failure an `Err` node is substituted where
//! the expected node would go, a diagnostic is appended, and parsing
//! continues, so a single pass surfaces every diagnostic in the unit.

use crate::ast::{MathOp, NodeId, NodeKind, ScalarType, Span, SyntaxTree, Trait, TypeRef};
use crate::error::{Diagnostic, ErrorKind};
use crate::matcher::{self, Capture, MatchError, Matcher};
use crate::modules::ModuleLoader;
use log::trace;

/// Words that may not be used as user names.
const RESERVED: &[&str] = &[
    "void", "bool", "int", "int2", "int3", "int4", "float", "float2", "float3", "float4", "var",
    "imm", "lit", "if", "else", "while", "return", "import", "struct", "true", "false",
];

/// Statement alternation. Longer forms come first; the order is load
/// bearing because matching is greedy on the leftmost alternative.
const STMT: &str = "struct %w{%s}; \
                    %| import\"%s\" \
                    %| if(%s){%s}else{%s} \
                    %| if(%s){%s} \
                    %| while(%s){%s} \
                    %| return; \
                    %| return %s; \
                    %| {%s} \
                    %| %w %w(%s){%s} \
                    %| %w %w(%s); \
                    %| %w %w %w=%s; \
                    %| %w %w=%s; \
                    %| %w %w %w; \
                    %| %w %w; \
                    %| %s;";

/// Binary operators tried in this exact order; precedence and
/// associativity fall out of the greedy left-to-right alternation over
/// a right-recursive split, so the order must not be rearranged.
const BINARY_OPS: &[(&str, Option<MathOp>)] = &[
    ("=", None),
    ("+", Some(MathOp::Add)),
    ("-", Some(MathOp::Sub)),
    ("*", Some(MathOp::Mul)),
    ("/", Some(MathOp::Div)),
    ("==", Some(MathOp::Eq)),
    ("!=", Some(MathOp::Ne)),
    ("<=", Some(MathOp::Le)),
    ("<", Some(MathOp::Lt)),
    (">=", Some(MathOp::Ge)),
    (">", Some(MathOp::Gt)),
];

/// Operand alternation, tried after no binary operator splits the text.
const OPERAND: &str = "(%s)%0 \
                       %| true%0 \
                       %| false%0 \
                       %| %i%0 \
                       %| %f%0 \
                       %| %w(%s)%0 \
                       %| %w.%w%0 \
                       %| %w%0 \
                       %| -%s%0";

pub struct ParseOutput {
    pub tree: SyntaxTree,
    pub root: NodeId,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parse a source string that is not backed by a file. Imports resolve
/// relative to the process working directory.
pub fn parse_source(source: &str, loader: &mut ModuleLoader) -> ParseOutput {
    let stripped = crate::modules::strip_comments(source);
    let mut parser = Parser::new(loader);
    let root = parser.tree.alloc(
        NodeKind::File {
            path: "<source>".to_string(),
            source: stripped.clone(),
        },
        Span::new(0, stripped.len()),
        None,
    );
    parser.parse_into(&stripped, root);
    parser.finish(root)
}

/// Parse a file from disk, resolving its imports relative to its own
/// directory.
pub fn parse_file(path: &std::path::Path, loader: &mut ModuleLoader) -> crate::error::Result<ParseOutput> {
    let (resolved, source) = loader.begin_root(path)?;
    let mut parser = Parser::new(loader);
    let root = parser.tree.alloc(
        NodeKind::File {
            path: resolved.display().to_string(),
            source: source.clone(),
        },
        Span::new(0, source.len()),
        None,
    );
    parser.parse_into(&source, root);
    parser.loader.end_import();
    Ok(parser.finish(root))
}

struct Parser<'l> {
    tree: SyntaxTree,
    diagnostics: Vec<Diagnostic>,
    loader: &'l mut ModuleLoader,
}

impl<'l> Parser<'l> {
    fn new(loader: &'l mut ModuleLoader) -> Self {
        Parser {
            tree: SyntaxTree::new(),
            diagnostics: Vec::new(),
            loader,
        }
    }

    fn finish(self, root: NodeId) -> ParseOutput {
        ParseOutput {
            tree: self.tree,
            root,
            diagnostics: self.diagnostics,
        }
    }

    fn parse_into(&mut self, src: &str, scope: NodeId) {
        let mut m = Matcher::new(src);
        while !m.at_end() {
            self.parse_statement(&mut m, src, scope);
        }
    }

    fn parse_capture(&mut self, src: &str, cap: Capture, scope: NodeId) {
        let mut m = Matcher::with_offset(cap.text, cap.span.start);
        while !m.at_end() {
            self.parse_statement(&mut m, src, scope);
        }
    }

    fn diag(&mut self, kind: ErrorKind, message: String, span: Span, src: &str) {
        let excerpt = src.get(span.start..span.end).unwrap_or("");
        self.diagnostics.push(Diagnostic::new(kind, message, span, excerpt));
    }

    /// Substitute an error node so the tree stays fully built.
    fn err_node(
        &mut self,
        parent: NodeId,
        kind: ErrorKind,
        message: String,
        span: Span,
        src: &str,
    ) -> NodeId {
        self.diag(kind, message.clone(), span, src);
        let node = self.tree.alloc(NodeKind::Err(message), span, None);
        self.tree.append_child(parent, node);
        node
    }

    /// An error node that is returned to the caller for attachment
    /// instead of being appended here (expression positions).
    fn err_leaf(&mut self, kind: ErrorKind, message: String, span: Span, src: &str) -> NodeId {
        self.diag(kind, message.clone(), span, src);
        self.tree.alloc(NodeKind::Err(message), span, None)
    }

    fn parse_statement(&mut self, m: &mut Matcher, src: &str, scope: NodeId) {
        let start = m.global_pos();
        let mut caps = Vec::new();

        let index = match m.try_match(STMT, &mut caps) {
            Ok(index) => index,
            Err(MatchError::NotFound) => {
                m.skip_statement();
                let span = Span::new(start, m.global_pos());
                self.err_node(
                    scope,
                    ErrorKind::LexicalMismatch,
                    "unrecognized statement".to_string(),
                    span,
                    src,
                );
                return;
            }
            Err(MatchError::Input) => {
                m.skip_statement();
                let span = Span::new(start, m.global_pos());
                self.err_node(
                    scope,
                    ErrorKind::StructuralError,
                    "unbalanced braces or quotes".to_string(),
                    span,
                    src,
                );
                return;
            }
        };

        let span = Span::new(start, m.global_pos());
        trace!("statement alternative {} at {}..{}", index, span.start, span.end);

        match index {
            0 => self.parse_struct(src, span, scope, caps[0], caps[1]),
            1 => self.parse_import(src, span, scope, caps[0]),
            2 => self.parse_if(src, span, scope, caps[0], caps[1], Some(caps[2])),
            3 => self.parse_if(src, span, scope, caps[0], caps[1], None),
            4 => self.parse_while(src, span, scope, caps[0], caps[1]),
            5 => {
                let node = self.tree.alloc(NodeKind::Ret, span, None);
                self.tree.append_child(scope, node);
            }
            6 => {
                let node = self.tree.alloc(NodeKind::Ret, span, None);
                let value = self.parse_expression(src, caps[0], scope);
                self.tree.append_child(node, value);
                self.tree.append_child(scope, node);
            }
            7 => {
                let node = self.tree.alloc(NodeKind::Scope, span, None);
                self.tree.append_child(scope, node);
                self.parse_capture(src, caps[0], node);
            }
            8 => self.parse_fn(src, span, scope, caps[0], caps[1], caps[2], Some(caps[3])),
            9 => self.parse_fn(src, span, scope, caps[0], caps[1], caps[2], None),
            10 => self.parse_var_decl(src, span, scope, Some(caps[0]), caps[1], caps[2], Some(caps[3])),
            11 => self.parse_var_decl(src, span, scope, None, caps[0], caps[1], Some(caps[2])),
            12 => self.parse_var_decl(src, span, scope, Some(caps[0]), caps[1], caps[2], None),
            13 => self.parse_var_decl(src, span, scope, None, caps[0], caps[1], None),
            14 => {
                let root = self.parse_expression(src, caps[0], scope);
                let node = self.tree.alloc(NodeKind::Expr, span, None);
                self.tree.append_child(node, root);
                self.tree.append_child(scope, node);
            }
            _ => unreachable!(),
        }
    }

    fn parse_struct(&mut self, src: &str, span: Span, scope: NodeId, name: Capture, body: Capture) {
        if let Err(message) = self.check_new_name(scope, name.text) {
            self.err_node(scope, ErrorKind::NameError, message, span, src);
            return;
        }
        let node = self.tree.alloc(NodeKind::TypeDef, span, None);
        let name_node = self
            .tree
            .alloc(NodeKind::UsrName(name.text.to_string()), name.span, None);
        self.tree.append_child(node, name_node);
        let members = self.tree.alloc(NodeKind::Scope, body.span, None);
        self.tree.append_child(node, members);
        self.tree.append_child(scope, node);
        self.parse_capture(src, body, members);
    }

    fn parse_import(&mut self, src: &str, span: Span, scope: NodeId, spec: Capture) {
        match self.loader.begin_import(spec.text) {
            // Already on the active inclusion stack: re-import is a
            // deliberate no-op, not an error.
            Ok(None) => {}
            Ok(Some((path, source))) => {
                let node = self.tree.alloc(
                    NodeKind::File {
                        path: path.display().to_string(),
                        source: source.clone(),
                    },
                    span,
                    None,
                );
                self.tree.append_child(scope, node);
                let mut m = Matcher::new(&source);
                while !m.at_end() {
                    self.parse_statement(&mut m, &source, node);
                }
                self.loader.end_import();
            }
            Err(e) => {
                self.err_node(
                    scope,
                    ErrorKind::IoError,
                    format!("cannot import \"{}\": {}", spec.text, e),
                    span,
                    src,
                );
            }
        }
    }

    fn parse_if(
        &mut self,
        src: &str,
        span: Span,
        scope: NodeId,
        cond: Capture,
        then_body: Capture,
        else_body: Option<Capture>,
    ) {
        let node = self.tree.alloc(NodeKind::If, span, None);
        let cond_node = self.wrap_expr(src, cond, scope);
        self.tree.append_child(node, cond_node);

        let then_scope = self.tree.alloc(NodeKind::Scope, then_body.span, None);
        self.tree.append_child(node, then_scope);
        self.tree.append_child(scope, node);
        self.parse_capture(src, then_body, then_scope);

        if let Some(else_body) = else_body {
            let else_scope = self.tree.alloc(NodeKind::Scope, else_body.span, None);
            self.tree.append_child(node, else_scope);
            self.parse_capture(src, else_body, else_scope);
        }
    }

    fn parse_while(&mut self, src: &str, span: Span, scope: NodeId, cond: Capture, body: Capture) {
        let node = self.tree.alloc(NodeKind::While, span, None);
        let cond_node = self.wrap_expr(src, cond, scope);
        self.tree.append_child(node, cond_node);
        let body_scope = self.tree.alloc(NodeKind::Scope, body.span, None);
        self.tree.append_child(node, body_scope);
        self.tree.append_child(scope, node);
        self.parse_capture(src, body, body_scope);
    }

    fn wrap_expr(&mut self, src: &str, cap: Capture, scope: NodeId) -> NodeId {
        let root = self.parse_expression(src, cap, scope);
        let node = self.tree.alloc(NodeKind::Expr, cap.span, None);
        self.tree.append_child(node, root);
        node
    }

    fn parse_fn(
        &mut self,
        src: &str,
        span: Span,
        scope: NodeId,
        ret: Capture,
        name: Capture,
        params: Capture,
        body: Option<Capture>,
    ) {
        let ret_type = match self.resolve_type(scope, ret) {
            Ok(t) => t,
            Err((kind, message)) => {
                self.err_node(scope, kind, message, span, src);
                return;
            }
        };

        // A definition may follow a declaration of the same function;
        // anything else colliding with the name is a redeclaration.
        let prior = match self.check_fn_name(scope, name.text, body.is_some()) {
            Ok(prior) => prior,
            Err(message) => {
                self.err_node(scope, ErrorKind::NameError, message, span, src);
                return;
            }
        };

        let kind = if body.is_some() {
            NodeKind::FnDef
        } else {
            NodeKind::FnDecl
        };
        let node = self.tree.alloc(kind, span, None);

        let (ty_ref, ty_target) = ret_type;
        let ty_node = self.tree.alloc(NodeKind::TypeName(ty_ref), ret.span, None);
        if let Some(target) = ty_target {
            self.tree.set_reference(ty_node, target);
        }
        self.tree.append_child(node, ty_node);

        let name_node = self
            .tree
            .alloc(NodeKind::UsrName(name.text.to_string()), name.span, None);
        if let Some(prior) = prior {
            self.tree.set_reference(name_node, prior);
        }
        self.tree.append_child(node, name_node);

        self.tree.append_child(scope, node);
        self.parse_params(src, params, node);

        if let Some(body) = body {
            let body_scope = self.tree.alloc(NodeKind::Scope, body.span, None);
            self.tree.append_child(node, body_scope);
            self.parse_capture(src, body, body_scope);
        }
    }

    fn parse_params(&mut self, src: &str, params: Capture, fn_node: NodeId) {
        if params.text.trim().is_empty() {
            return;
        }
        for piece in split_top_level(params) {
            self.parse_param(src, piece, fn_node);
        }
    }

    fn parse_param(&mut self, src: &str, piece: Capture, fn_node: NodeId) {
        let mut m = Matcher::with_offset(piece.text, piece.span.start);
        let mut caps = Vec::new();
        let index = match m.try_match("%w %w %w%0 %| %w %w%0", &mut caps) {
            Ok(index) => index,
            Err(_) => {
                self.err_node(
                    fn_node,
                    ErrorKind::LexicalMismatch,
                    format!("malformed parameter `{}`", piece.text),
                    piece.span,
                    src,
                );
                return;
            }
        };
        let (trait_cap, ty_cap, name_cap) = if index == 0 {
            (Some(caps[0]), caps[1], caps[2])
        } else {
            (None, caps[0], caps[1])
        };
        // Parameters default to read-only.
        self.build_var_decl(src, piece.span, fn_node, trait_cap, ty_cap, name_cap, None, Trait::Imm);
    }

    fn parse_var_decl(
        &mut self,
        src: &str,
        span: Span,
        scope: NodeId,
        trait_cap: Option<Capture>,
        ty_cap: Capture,
        name_cap: Capture,
        init: Option<Capture>,
    ) {
        self.build_var_decl(src, span, scope, trait_cap, ty_cap, name_cap, init, Trait::Var);
    }

    #[allow(clippy::too_many_arguments)]
    fn build_var_decl(
        &mut self,
        src: &str,
        span: Span,
        parent: NodeId,
        trait_cap: Option<Capture>,
        ty_cap: Capture,
        name_cap: Capture,
        init: Option<Capture>,
        default_trait: Trait,
    ) {
        let decl_trait = match trait_cap {
            Some(cap) => match Trait::from_name(cap.text) {
                Some(t) => t,
                None => {
                    self.err_node(
                        parent,
                        ErrorKind::TypeError,
                        format!("unknown trait '{}'", cap.text),
                        span,
                        src,
                    );
                    return;
                }
            },
            None => default_trait,
        };

        let (ty_ref, ty_target) = match self.resolve_type(parent, ty_cap) {
            Ok(t) => t,
            Err((kind, message)) => {
                self.err_node(parent, kind, message, span, src);
                return;
            }
        };
        if ty_ref == TypeRef::Builtin(ScalarType::Void) {
            self.err_node(
                parent,
                ErrorKind::TypeError,
                format!("variable '{}' cannot have type void", name_cap.text),
                span,
                src,
            );
            return;
        }

        if let Err(message) = self.check_new_name(parent, name_cap.text) {
            self.err_node(parent, ErrorKind::NameError, message, span, src);
            return;
        }

        let node = self.tree.alloc(NodeKind::VarDecl, span, None);
        let trait_node = self.tree.alloc(
            NodeKind::TypeTrait(decl_trait),
            trait_cap.map_or(ty_cap.span, |c| c.span),
            None,
        );
        self.tree.append_child(node, trait_node);
        let ty_node = self.tree.alloc(NodeKind::TypeName(ty_ref), ty_cap.span, None);
        if let Some(target) = ty_target {
            self.tree.set_reference(ty_node, target);
        }
        self.tree.append_child(node, ty_node);
        let name_node = self
            .tree
            .alloc(NodeKind::UsrName(name_cap.text.to_string()), name_cap.span, None);
        self.tree.append_child(node, name_node);

        if let Some(init) = init {
            let value = self.parse_expression(src, init, parent);
            self.tree.append_child(node, value);
        }

        self.tree.append_child(parent, node);
    }

    /// Parse an expression slice into a subtree and return its root.
    /// The returned node is not yet attached to a parent.
    fn parse_expression(&mut self, src: &str, cap: Capture, scope: NodeId) -> NodeId {
        let text = cap.text;
        if text.is_empty() {
            return self.err_leaf(
                ErrorKind::LexicalMismatch,
                "expected expression".to_string(),
                cap.span,
                src,
            );
        }

        // Binary alternation in the fixed order; the first operator
        // that splits the text wins, and the split is right-recursive.
        for &(symbol, op) in BINARY_OPS {
            let mut from = 0;
            loop {
                let at = match matcher::find_top_level_from(text, symbol, from) {
                    Ok(Some(at)) => at,
                    Ok(None) => break,
                    Err(_) => {
                        return self.err_leaf(
                            ErrorKind::StructuralError,
                            "unbalanced expression".to_string(),
                            cap.span,
                            src,
                        );
                    }
                };
                if !valid_split(text, at) {
                    from = at + symbol.len();
                    continue;
                }

                let left = sub_capture(cap, text, 0, at);
                let right = sub_capture(cap, text, at + symbol.len(), text.len());
                let lhs = self.parse_expression(src, left, scope);
                let rhs = self.parse_expression(src, right, scope);

                let node = match op {
                    Some(op) => self.tree.alloc(NodeKind::MathOp(op), cap.span, None),
                    None => {
                        if !matches!(
                            self.tree.kind(lhs),
                            NodeKind::UsrName(_) | NodeKind::MemOp(_) | NodeKind::Err(_)
                        ) {
                            return self.err_leaf(
                                ErrorKind::TypeError,
                                "invalid assignment target".to_string(),
                                left.span,
                                src,
                            );
                        }
                        self.tree.alloc(NodeKind::Set, cap.span, None)
                    }
                };
                self.tree.append_child(node, lhs);
                self.tree.append_child(node, rhs);
                return node;
            }
        }

        self.parse_operand(src, cap, scope)
    }

    fn parse_operand(&mut self, src: &str, cap: Capture, scope: NodeId) -> NodeId {
        let mut m = Matcher::with_offset(cap.text, cap.span.start);
        let mut caps = Vec::new();
        let index = match m.try_match(OPERAND, &mut caps) {
            Ok(index) => index,
            Err(MatchError::NotFound) => {
                return self.err_leaf(
                    ErrorKind::LexicalMismatch,
                    format!("unrecognized expression `{}`", cap.text),
                    cap.span,
                    src,
                );
            }
            Err(MatchError::Input) => {
                return self.err_leaf(
                    ErrorKind::StructuralError,
                    "unbalanced expression".to_string(),
                    cap.span,
                    src,
                );
            }
        };

        match index {
            0 => self.parse_expression(src, caps[0], scope),
            1 => self.tree.alloc(NodeKind::BoolLit(true), cap.span, None),
            2 => self.tree.alloc(NodeKind::BoolLit(false), cap.span, None),
            3 => match caps[0].text.parse::<i32>() {
                Ok(v) => self.tree.alloc(NodeKind::IntLit(v), cap.span, None),
                Err(_) => self.err_leaf(
                    ErrorKind::TypeError,
                    format!("integer literal out of range `{}`", caps[0].text),
                    cap.span,
                    src,
                ),
            },
            4 => {
                let digits = caps[0].text.trim_end_matches('f');
                match digits.parse::<f32>() {
                    Ok(v) => self.tree.alloc(NodeKind::FloatLit(v), cap.span, None),
                    Err(_) => self.err_leaf(
                        ErrorKind::TypeError,
                        format!("malformed float literal `{}`", caps[0].text),
                        cap.span,
                        src,
                    ),
                }
            }
            5 => self.parse_call(src, cap, caps[0], caps[1], scope),
            6 => self.parse_member(src, cap, caps[0], caps[1], scope),
            7 => self.parse_name_use(src, caps[0], scope),
            8 => {
                // Unary minus: lowered as `0 - expr`.
                let zero = self.tree.alloc(NodeKind::IntLit(0), cap.span, None);
                let operand = self.parse_expression(src, caps[0], scope);
                let node = self.tree.alloc(NodeKind::MathOp(MathOp::Sub), cap.span, None);
                self.tree.append_child(node, zero);
                self.tree.append_child(node, operand);
                node
            }
            _ => unreachable!(),
        }
    }

    fn parse_call(
        &mut self,
        src: &str,
        cap: Capture,
        name: Capture,
        args: Capture,
        scope: NodeId,
    ) -> NodeId {
        let target = match self.find_declaration(scope, name.text) {
            Some(target) => target,
            None => {
                return self.err_leaf(
                    ErrorKind::NameError,
                    format!("call to undeclared function '{}'", name.text),
                    name.span,
                    src,
                );
            }
        };
        if !matches!(self.tree.kind(target), NodeKind::FnDecl | NodeKind::FnDef) {
            return self.err_leaf(
                ErrorKind::TypeError,
                format!("'{}' is not a function", name.text),
                name.span,
                src,
            );
        }

        let node = self.tree.alloc(NodeKind::FnOp, cap.span, None);
        let name_node = self
            .tree
            .alloc(NodeKind::UsrName(name.text.to_string()), name.span, None);
        self.tree.set_reference(name_node, target);
        self.tree.append_child(node, name_node);

        if !args.text.trim().is_empty() {
            for piece in split_top_level(args) {
                let arg = self.parse_expression(src, piece, scope);
                self.tree.append_child(node, arg);
            }
        }
        node
    }

    fn parse_member(
        &mut self,
        src: &str,
        cap: Capture,
        base: Capture,
        member: Capture,
        scope: NodeId,
    ) -> NodeId {
        let base_node = self.parse_name_use(src, base, scope);
        let decl = match self.tree.node(base_node).reference {
            Some(decl) => decl,
            // Resolution already failed and reported; pass the error up.
            None => return base_node,
        };

        let member_ref = match self.resolve_member(decl, member.text) {
            Ok(member_ref) => member_ref,
            Err((kind, message)) => {
                return self.err_leaf(kind, message, cap.span, src);
            }
        };

        let node = self
            .tree
            .alloc(NodeKind::MemOp(member.text.to_string()), cap.span, None);
        if let Some(target) = member_ref {
            self.tree.set_reference(node, target);
        }
        self.tree.append_child(node, base_node);
        node
    }

    fn parse_name_use(&mut self, src: &str, name: Capture, scope: NodeId) -> NodeId {
        let target = match self.find_declaration(scope, name.text) {
            Some(target) => target,
            None => {
                return self.err_leaf(
                    ErrorKind::NameError,
                    format!("undeclared name '{}'", name.text),
                    name.span,
                    src,
                );
            }
        };
        match self.tree.kind(target) {
            NodeKind::VarDecl => {
                let node = self
                    .tree
                    .alloc(NodeKind::UsrName(name.text.to_string()), name.span, None);
                self.tree.set_reference(node, target);
                node
            }
            _ => self.err_leaf(
                ErrorKind::TypeError,
                format!("'{}' is not a variable", name.text),
                name.span,
                src,
            ),
        }
    }

    /// Member lookup: vector components resolve against the built-in
    /// `x y z w` names; a user type's members must be declared directly
    /// inside the type definition's body, never found by scope search.
    fn resolve_member(
        &self,
        base_decl: NodeId,
        member: &str,
    ) -> Result<Option<NodeId>, (ErrorKind, String)> {
        let ty_node = self
            .tree
            .children(base_decl)
            .find(|c| matches!(self.tree.kind(*c), NodeKind::TypeName(_)));
        let ty_node = match ty_node {
            Some(t) => t,
            None => return Err((ErrorKind::TypeError, "member access on unknown type".to_string())),
        };

        match self.tree.kind(ty_node).clone() {
            NodeKind::TypeName(TypeRef::Builtin(ty)) => {
                let component = "xyzw".find(member);
                match component {
                    Some(i) if member.len() == 1 && (i as u32) < ty.width() && ty.is_vector() => {
                        Ok(None)
                    }
                    _ => Err((
                        ErrorKind::NameError,
                        format!("type {} has no member '{}'", ty.name(), member),
                    )),
                }
            }
            NodeKind::TypeName(TypeRef::Named(type_name)) => {
                let typedef = match self.tree.node(ty_node).reference {
                    Some(t) => t,
                    None => {
                        return Err((
                            ErrorKind::TypeError,
                            format!("unresolved type '{}'", type_name),
                        ));
                    }
                };
                let body = self
                    .tree
                    .children(typedef)
                    .find(|c| matches!(self.tree.kind(*c), NodeKind::Scope));
                let found = body.and_then(|b| {
                    self.tree
                        .children(b)
                        .find(|stmt| self.tree.declared_name(*stmt) == Some(member))
                });
                match found {
                    Some(decl) => Ok(Some(decl)),
                    None => Err((
                        ErrorKind::NameError,
                        format!("type {} has no member '{}'", type_name, member),
                    )),
                }
            }
            _ => Err((ErrorKind::TypeError, "member access on unknown type".to_string())),
        }
    }

    fn resolve_type(
        &self,
        scope: NodeId,
        cap: Capture,
    ) -> Result<(TypeRef, Option<NodeId>), (ErrorKind, String)> {
        if let Some(ty) = ScalarType::from_name(cap.text) {
            return Ok((TypeRef::Builtin(ty), None));
        }
        match self.find_declaration(scope, cap.text) {
            Some(target) if matches!(self.tree.kind(target), NodeKind::TypeDef) => {
                Ok((TypeRef::Named(cap.text.to_string()), Some(target)))
            }
            _ => Err((
                ErrorKind::TypeError,
                format!("unknown type '{}'", cap.text),
            )),
        }
    }

    /// Validate a fresh name: identifier syntax, reserved words, and
    /// collision with the current or any enclosing scope.
    fn check_new_name(&self, context: NodeId, name: &str) -> Result<(), String> {
        check_name_syntax(name)?;
        if self.find_declaration(context, name).is_some() {
            return Err(format!("Redeclaration of '{}'", name));
        }
        Ok(())
    }

    /// Function names allow one exception to the collision rule: a
    /// definition may follow declarations of the same function. The
    /// signature and single-body checks happen during lowering.
    fn check_fn_name(
        &self,
        context: NodeId,
        name: &str,
        is_definition: bool,
    ) -> Result<Option<NodeId>, String> {
        check_name_syntax(name)?;
        match self.find_declaration(context, name) {
            None => Ok(None),
            Some(prior)
                if is_definition
                    && matches!(self.tree.kind(prior), NodeKind::FnDecl | NodeKind::FnDef) =>
            {
                Ok(Some(prior))
            }
            Some(_) => Err(format!("Redeclaration of '{}'", name)),
        }
    }

    /// Search for a declaration of `name`, walking from `from` up the
    /// scope chain. Function parameters are visible from the function
    /// body; imported files contribute their statements to the scope
    /// that spliced them.
    fn find_declaration(&self, from: NodeId, name: &str) -> Option<NodeId> {
        let mut cur = Some(from);
        while let Some(n) = cur {
            let found = match self.tree.kind(n) {
                NodeKind::Scope | NodeKind::File { .. } => self.scan_statements(n, name),
                NodeKind::FnDef | NodeKind::FnDecl => self.scan_params(n, name),
                _ => None,
            };
            if found.is_some() {
                return found;
            }
            cur = self.tree.node(n).parent;
        }
        None
    }

    fn scan_statements(&self, scope: NodeId, name: &str) -> Option<NodeId> {
        for stmt in self.tree.children(scope) {
            if matches!(self.tree.kind(stmt), NodeKind::File { .. }) {
                if let Some(found) = self.scan_statements(stmt, name) {
                    return Some(found);
                }
            } else if self.tree.declared_name(stmt) == Some(name) {
                return Some(stmt);
            }
        }
        None
    }

    fn scan_params(&self, fn_node: NodeId, name: &str) -> Option<NodeId> {
        self.tree.children(fn_node).find(|c| {
            matches!(self.tree.kind(*c), NodeKind::VarDecl)
                && self.tree.declared_name(*c) == Some(name)
        })
    }

}

/// Split a capture on top-level commas, producing sub-captures with
/// correct global spans.
fn split_top_level<'src>(cap: Capture<'src>) -> Vec<Capture<'src>> {
    let mut pieces = Vec::new();
    let text = cap.text;
    let mut start = 0;
    let mut from = 0;
    while let Ok(Some(at)) = matcher::find_top_level_from(text, ",", from) {
        pieces.push(sub_capture(cap, text, start, at));
        start = at + 1;
        from = start;
    }
    pieces.push(sub_capture(cap, text, start, text.len()));
    pieces
}

/// A trimmed sub-capture of `cap` covering `text[lo..hi]`.
fn sub_capture<'src>(cap: Capture<'src>, text: &'src str, lo: usize, hi: usize) -> Capture<'src> {
    let raw = &text[lo..hi];
    let trimmed = raw.trim_start();
    let lead = raw.len() - trimmed.len();
    let trimmed = trimmed.trim_end();
    let start = lo + lead;
    Capture {
        text: trimmed,
        span: Span::new(cap.span.start + start, cap.span.start + start + trimmed.len()),
    }
}

/// Guard for binary-operator splitting: the left side must be a
/// plausible operand (non-empty and not ending in another operator), so
/// unary minus and signed literals stay with their operand.
fn valid_split(text: &str, at: usize) -> bool {
    let left = text[..at].trim_end();
    if left.is_empty() {
        return false;
    }
    let last = left.chars().next_back().unwrap();
    !matches!(last, '=' | '<' | '>' | '!' | '+' | '-' | '*' | '/' | '(' | ',')
}

fn check_name_syntax(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    if !first_ok || !name.chars().all(matcher::is_word_char) {
        return Err(format!("invalid name '{}'", name));
    }
    if RESERVED.contains(&name) {
        return Err(format!("'{}' is a reserved word", name));
    }
    Ok(())
}

/// Compile-time-constant classification: every leaf is a literal or a
/// reference to a `lit`-trait declaration, and no call or error node
/// appears anywhere in the subtree.
pub fn is_ct_const(tree: &SyntaxTree, node: NodeId) -> bool {
    match tree.kind(node) {
        NodeKind::IntLit(_) | NodeKind::FloatLit(_) | NodeKind::BoolLit(_) => true,
        NodeKind::Expr => tree.children(node).all(|c| is_ct_const(tree, c)),
        NodeKind::MathOp(_) => tree.children(node).all(|c| is_ct_const(tree, c)),
        NodeKind::UsrName(_) => match tree.node(node).reference {
            Some(decl) => tree
                .children(decl)
                .any(|c| matches!(tree.kind(c), NodeKind::TypeTrait(Trait::Lit))),
            None => false,
        },
        _ => false,
    }
}
