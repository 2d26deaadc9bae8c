//! Arena-backed syntax tree.
//!
//! Nodes are addressed by stable `NodeId` indices. The owning edges are
//! `sub` (first structural child) and `next` (sibling); `parent` and
//! `reference` are lookup-only edges used for upward scope search and
//! name resolution, never for teardown. The tree is build-once: a node's
//! links are attached while its production is parsed and never mutated
//! afterwards.

use std::fmt;

/// Unique identifier for a node in the syntax tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Byte span into the source buffer of the file the node came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Built-in scalar and vector types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Void,
    Bool,
    Int,
    Int2,
    Int3,
    Int4,
    Float,
    Float2,
    Float3,
    Float4,
}

impl ScalarType {
    pub fn from_name(name: &str) -> Option<ScalarType> {
        let ty = match name {
            "void" => ScalarType::Void,
            "bool" => ScalarType::Bool,
            "int" => ScalarType::Int,
            "int2" => ScalarType::Int2,
            "int3" => ScalarType::Int3,
            "int4" => ScalarType::Int4,
            "float" => ScalarType::Float,
            "float2" => ScalarType::Float2,
            "float3" => ScalarType::Float3,
            "float4" => ScalarType::Float4,
            _ => return None,
        };
        Some(ty)
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Void => "void",
            ScalarType::Bool => "bool",
            ScalarType::Int => "int",
            ScalarType::Int2 => "int2",
            ScalarType::Int3 => "int3",
            ScalarType::Int4 => "int4",
            ScalarType::Float => "float",
            ScalarType::Float2 => "float2",
            ScalarType::Float3 => "float3",
            ScalarType::Float4 => "float4",
        }
    }

    /// Number of register-stack slots a value of this type occupies.
    pub fn width(self) -> u32 {
        match self {
            ScalarType::Void => 0,
            ScalarType::Bool | ScalarType::Int | ScalarType::Float => 1,
            ScalarType::Int2 | ScalarType::Float2 => 2,
            ScalarType::Int3 | ScalarType::Float3 => 3,
            ScalarType::Int4 | ScalarType::Float4 => 4,
        }
    }

    pub fn is_vector(self) -> bool {
        self.width() > 1
    }

    /// Component type of a vector, or the type itself for scalars.
    pub fn component(self) -> ScalarType {
        match self {
            ScalarType::Int2 | ScalarType::Int3 | ScalarType::Int4 => ScalarType::Int,
            ScalarType::Float2 | ScalarType::Float3 | ScalarType::Float4 => ScalarType::Float,
            other => other,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Access trait on a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trait {
    /// Mutable; the default for variable declarations.
    Var,
    /// Read-only after initialization; the default for parameters.
    Imm,
    /// Compile-time constant; the initializer must fold at compile time.
    Lit,
}

impl Trait {
    pub fn from_name(name: &str) -> Option<Trait> {
        match name {
            "var" => Some(Trait::Var),
            "imm" => Some(Trait::Imm),
            "lit" => Some(Trait::Lit),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Trait::Var => "var",
            Trait::Imm => "imm",
            Trait::Lit => "lit",
        }
    }
}

/// A type written in source: either a built-in or a user-defined name.
/// User types resolve through the node's `reference` edge to a `TypeDef`.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeRef {
    Builtin(ScalarType),
    Named(String),
}

/// Binary operators in expressions. The parser tries them in the fixed
/// alternation order `= + - * / == != <= < >= >`; `=` produces a `Set`
/// node instead of a `MathOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Le,
    Lt,
    Ge,
    Gt,
}

impl MathOp {
    pub fn is_comparison(self) -> bool {
        !matches!(self, MathOp::Add | MathOp::Sub | MathOp::Mul | MathOp::Div)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            MathOp::Add => "+",
            MathOp::Sub => "-",
            MathOp::Mul => "*",
            MathOp::Div => "/",
            MathOp::Eq => "==",
            MathOp::Ne => "!=",
            MathOp::Le => "<=",
            MathOp::Lt => "<",
            MathOp::Ge => ">=",
            MathOp::Gt => ">",
        }
    }
}

/// Discriminant and payload of a syntax-tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// A lexical scope; `sub` is the first statement.
    Scope,
    /// One source file; `sub` is the first top-level statement. The
    /// source text is kept for diagnostic excerpts.
    File { path: String, source: String },
    TypeName(TypeRef),
    UsrName(String),
    /// Function declaration: `sub` chain is [TypeName, UsrName, params...].
    FnDecl,
    /// Variable declaration: `sub` chain is
    /// [TypeTrait, TypeName, UsrName, init expr?].
    VarDecl,
    TypeTrait(Trait),
    /// Function definition: `sub` chain is
    /// [TypeName, UsrName, params..., Scope].
    FnDef,
    /// Struct definition: `sub` chain is [UsrName, Scope]. Parsed but
    /// rejected by the lowering compiler (unfinished feature).
    TypeDef,
    /// `sub` chain is [Expr cond, Scope then, Scope else?].
    If,
    /// `sub` chain is [Expr cond, Scope body].
    While,
    /// `sub` is the returned expression, if any.
    Ret,
    /// Assignment: `sub` chain is [target, value].
    Set,
    /// Expression wrapper; `sub` is the root operator or operand.
    Expr,
    MathOp(MathOp),
    /// Member access: `sub` is the base name.
    MemOp(String),
    /// Function call: `sub` chain is [UsrName, arg exprs...].
    FnOp,
    BoolLit(bool),
    IntLit(i32),
    FloatLit(f32),
    /// Placeholder substituted where parsing failed, so the tree is
    /// always fully built.
    Err(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
    pub sub: Option<NodeId>,
    pub next: Option<NodeId>,
    pub parent: Option<NodeId>,
    pub reference: Option<NodeId>,
}

/// The arena holding every node of a parsed compilation unit.
#[derive(Debug, Clone, Default)]
pub struct SyntaxTree {
    nodes: Vec<Node>,
}

impl SyntaxTree {
    pub fn new() -> Self {
        SyntaxTree { nodes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn alloc(&mut self, kind: NodeKind, span: Span, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind,
            span,
            sub: None,
            next: None,
            parent,
            reference: None,
        });
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.index()].kind
    }

    pub fn span(&self, id: NodeId) -> Span {
        self.nodes[id.index()].span
    }

    pub fn set_reference(&mut self, id: NodeId, target: NodeId) {
        self.nodes[id.index()].reference = Some(target);
    }

    /// Append `child` to the end of `parent`'s `sub`/`next` chain.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child.index()].parent = Some(parent);
        match self.nodes[parent.index()].sub {
            None => self.nodes[parent.index()].sub = Some(child),
            Some(first) => {
                let mut cur = first;
                while let Some(next) = self.nodes[cur.index()].next {
                    cur = next;
                }
                self.nodes[cur.index()].next = Some(child);
            }
        }
    }

    /// Iterate the direct children of a node in order.
    pub fn children(&self, id: NodeId) -> Children<'_> {
        Children {
            tree: self,
            cur: self.nodes[id.index()].sub,
        }
    }

    pub fn child_at(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.children(id).nth(index)
    }

    /// The nearest enclosing scope-like node (`Scope`, `File`, or a
    /// `TypeDef` body), starting from `id`'s parent.
    pub fn enclosing_scope(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = self.nodes[id.index()].parent;
        while let Some(p) = cur {
            match self.nodes[p.index()].kind {
                NodeKind::Scope | NodeKind::File { .. } => return Some(p),
                _ => cur = self.nodes[p.index()].parent,
            }
        }
        None
    }

    /// The source buffer of the file a node belongs to, found by walking
    /// the parent chain to the nearest `File` node.
    pub fn source_of(&self, id: NodeId) -> Option<&str> {
        let mut cur = Some(id);
        while let Some(n) = cur {
            if let NodeKind::File { source, .. } = &self.nodes[n.index()].kind {
                return Some(source);
            }
            cur = self.nodes[n.index()].parent;
        }
        None
    }

    /// Source excerpt for a node, for diagnostics.
    pub fn excerpt(&self, id: NodeId) -> String {
        let span = self.span(id);
        match self.source_of(id) {
            Some(src) if span.end <= src.len() && span.start <= span.end => {
                src[span.start..span.end].trim().to_string()
            }
            _ => String::new(),
        }
    }

    /// The declared name of a statement node, if it declares one.
    pub fn declared_name(&self, id: NodeId) -> Option<&str> {
        match self.nodes[id.index()].kind {
            NodeKind::VarDecl | NodeKind::FnDecl | NodeKind::FnDef | NodeKind::TypeDef => self
                .children(id)
                .find_map(|c| match &self.nodes[c.index()].kind {
                    NodeKind::UsrName(name) => Some(name.as_str()),
                    _ => None,
                }),
            _ => None,
        }
    }
}

pub struct Children<'t> {
    tree: &'t SyntaxTree,
    cur: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cur?;
        self.cur = self.tree.node(id).next;
        Some(id)
    }
}
