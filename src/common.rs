//! Common definitions that are shared between different parts of the compiler.

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Identifiers, interned for the lifetime of the compilation.
pub type Id = internment::Intern<String>;

/// Intern a string into an [`Id`].
pub fn intern(s: impl Into<String>) -> Id {
    internment::Intern::new(s.into())
}

/// A position in the original source text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A half-open byte range plus the line/column of its start, attached to
/// every token and AST node so diagnostics can point at source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span {
    pub start: Pos,
    pub byte_start: usize,
    pub byte_end: usize,
}

impl Span {
    pub fn dummy() -> Span {
        Span {
            start: Pos { line: 0, col: 0 },
            byte_start: 0,
            byte_end: 0,
        }
    }
}

/// One error kind per compiler stage. Each variant carries the message and
/// the span it points at; the file name is attached by the driver when the
/// diagnostic is printed.
#[derive(Clone, Debug, derive_more::Display)]
pub enum ErrorKind {
    #[display("lex error")]
    Lex,
    #[display("parse error")]
    Parse,
    #[display("type error")]
    Type,
    #[display("semantic error")]
    Semantic,
    #[display("internal compiler error")]
    Ir,
    #[display("assembly error")]
    Assembly,
    #[display("emit error")]
    Emit,
    #[display("io error")]
    Io,
}

#[derive(Clone, Debug, derive_more::Display)]
#[display("{kind}: {message} at {span_start}")]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    pub span_start: Pos,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, span: Span, message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            kind,
            message: message.into(),
            span_start: span.start,
        }
    }
}

/// Accumulates diagnostics for one translation-unit stage. Lex/parse/type/
/// semantic errors are recoverable within a stage: it keeps going so
/// multiple errors can be reported, but the compiler aborts before
/// the next stage if anything was recorded.
#[derive(Default, Debug)]
pub struct Diagnostics {
    errors: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics::default()
    }

    pub fn report(&mut self, kind: ErrorKind, span: Span, message: impl Into<String>) {
        let d = Diagnostic::new(kind, span, message);
        log::debug!("diagnostic: {d}");
        self.errors.push(d);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Diagnostic] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<Diagnostic> {
        self.errors
    }
}
