use crate::ast::Span;
use std::fmt;
use thiserror::Error;

/// Classification of a single accumulated diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A pattern alternation matched none of its branches.
    LexicalMismatch,
    /// Invalid identifier, redeclaration, or reference to an undeclared name.
    NameError,
    /// Unknown type, signature mismatch, or an ill-typed construct.
    TypeError,
    /// Unbalanced braces or quotes in the input stream.
    StructuralError,
    /// A file could not be read on `import` or initial load.
    IoError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::LexicalMismatch => "lexical mismatch",
            ErrorKind::NameError => "name error",
            ErrorKind::TypeError => "type error",
            ErrorKind::StructuralError => "structural error",
            ErrorKind::IoError => "io error",
        };
        f.write_str(s)
    }
}

/// One entry in the ordered error list kept by the parser and the
/// lowering compiler. Both stages accumulate and continue; success is
/// an empty list at the end of the unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Span,
    /// Source excerpt captured at creation time, so rendering does not
    /// need the original buffer.
    pub excerpt: String,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, message: impl Into<String>, span: Span, excerpt: &str) -> Self {
        Diagnostic {
            kind,
            message: message.into(),
            span,
            excerpt: crate::diags::shorten(excerpt),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.excerpt.is_empty() {
            write!(f, "{}: {}", self.kind, self.message)
        } else {
            write!(f, "{}: {} (near `{}`)", self.kind, self.message, self.excerpt)
        }
    }
}

/// The full ordered list of diagnostics for one compilation unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiagnosticList(pub Vec<Diagnostic>);

impl DiagnosticList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn count_of(&self, kind: ErrorKind) -> usize {
        self.0.iter().filter(|d| d.kind == kind).count()
    }
}

impl fmt::Display for DiagnosticList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("compilation failed:\n{0}")]
    Source(DiagnosticList),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompilerError {
    /// The accumulated diagnostics, if this is a source-level failure.
    pub fn diagnostics(&self) -> Option<&DiagnosticList> {
        match self {
            CompilerError::Source(list) => Some(list),
            CompilerError::Io(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompilerError>;

/// Bail out of a fallible helper with a type diagnostic.
#[macro_export]
macro_rules! bail_type_at {
    ($span:expr, $excerpt:expr, $($arg:tt)*) => {
        return Err($crate::error::Diagnostic::new(
            $crate::error::ErrorKind::TypeError,
            format!($($arg)*),
            $span,
            $excerpt,
        ))
    };
}

/// Bail out of a fallible helper with a structural diagnostic.
#[macro_export]
macro_rules! bail_structural_at {
    ($span:expr, $excerpt:expr, $($arg:tt)*) => {
        return Err($crate::error::Diagnostic::new(
            $crate::error::ErrorKind::StructuralError,
            format!($($arg)*),
            $span,
            $excerpt,
        ))
    };
}
