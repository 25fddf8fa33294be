//! The abstract syntax tree: typed expressions and statements, plus the
//! scope/variable tables the parser builds while it resolves names.

use crate::common::{Id, Map, Span};
use crate::front::types::Ty;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Extern,
    Static,
    Auto,
    EnumMember,
    Parameter,
}

/// Storage-specific payload for a [`VarInfo`].
#[derive(Debug, Clone)]
pub enum VarPayload {
    /// A global: an optional constant initialiser, and whether it's visible
    /// to other translation units (relevant to the assembler's `.globl`).
    Global { init: Option<Expr>, exported: bool },
    /// A local or parameter. The IR builder fills in the virtual register
    /// while it walks the function body; see `middle::build` for how the
    /// name-to-vreg environment is threaded (this is realized as a build-time
    /// map rather than a mutable AST field, since AST nodes are otherwise
    /// immutable once parsed).
    Local { index: u32 },
    /// `static` storage inside a function body: aliases a synthesised global.
    StaticLocal { alias: Id },
    /// An `enum` member: a compile-time constant.
    EnumConst(i64),
}

#[derive(Debug, Clone)]
pub struct VarInfo {
    pub name: Id,
    pub ty: Ty,
    pub storage: StorageClass,
    pub payload: VarPayload,
    pub span: Span,
}

pub type ScopeId = u32;

/// An ordered mapping from name to [`VarInfo`], with a parent pointer. A
/// scope without a parent is the global scope.
#[derive(Debug, Default)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub vars: Map<Id, VarInfo>,
    pub children: Vec<ScopeId>,
    pub is_function: bool,
}

/// Owns every scope in the translation unit so scopes can outlive the parse
/// of the block that introduced them.
#[derive(Debug, Default)]
pub struct Scopes {
    arena: Vec<Scope>,
}

impl Scopes {
    pub fn new() -> Scopes {
        let mut s = Scopes { arena: Vec::new() };
        s.push(None); // scope 0 is always the global scope
        s
    }

    pub fn global(&self) -> ScopeId {
        0
    }

    pub fn push(&mut self, parent: Option<ScopeId>) -> ScopeId {
        let id = self.arena.len() as ScopeId;
        self.arena.push(Scope { parent, ..Default::default() });
        if let Some(p) = parent {
            self.arena[p as usize].children.push(id);
        }
        id
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.arena[id as usize]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.arena[id as usize]
    }

    pub fn declare(&mut self, scope: ScopeId, var: VarInfo) {
        self.arena[scope as usize].vars.insert(var.name, var);
    }

    /// Resolve a name starting at `scope`, walking up through parents. This
    /// walks up to the nearest enclosing scope containing the name.
    pub fn resolve(&self, scope: ScopeId, name: Id) -> Option<&VarInfo> {
        let mut cur = Some(scope);
        while let Some(id) = cur {
            let s = &self.arena[id as usize];
            if let Some(v) = s.vars.get(&name) {
                return Some(v);
            }
            cur = s.parent;
        }
        None
    }

    /// True when `name` is declared directly in `scope` (not an ancestor) —
    /// used to reject redeclaration within one block.
    pub fn declared_here(&self, scope: ScopeId, name: Id) -> bool {
        self.arena[scope as usize].vars.contains_key(&name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LogAnd,
    LogOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UOp {
    Neg,
    BitNot,
    LogNot,
}

/// Every expression carries its resolved [`Ty`] and the source token it was
/// built from.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Ty,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    /// A string literal after lowering has replaced it with a reference to
    /// the synthesised global holding its bytes.
    StrLit(Id),
    Var(Id, ScopeId),
    BOp(BOp, Box<Expr>, Box<Expr>),
    UOp(UOp, Box<Expr>),
    /// Pre/post increment or decrement; `delta` is +1 or -1 already scaled by
    /// pointee size where relevant.
    IncDec { pre: bool, delta: i64, target: Box<Expr> },
    Assign(Box<Expr>, Box<Expr>),
    /// A compound assignment lowered to a dedicated node so the lvalue is
    /// evaluated only once.
    Modify(BOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Cast(Ty, Box<Expr>),
    Ref(Box<Expr>),
    Deref(Box<Expr>),
    Member { base: Box<Expr>, field: Id, arrow: bool },
    Subscript(Box<Expr>, Box<Expr>),
    Call { callee: Box<Expr>, args: Vec<Expr> },
    CompoundLiteral { ty: Ty, init: Vec<Init> },
    Comma(Box<Expr>, Box<Expr>),
    /// GCC-style statement expression `({ ...; expr })`, used for some
    /// macro-free desugarings in the original source's expansions.
    Block(Vec<Stmt>, Box<Expr>),
}

/// A (possibly nested, possibly designated-by-field) initializer tree for an
/// aggregate, flattened later by the IR builder.
#[derive(Debug, Clone)]
pub enum Init {
    Expr(Expr),
    List(Vec<Init>),
}

#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: Id,
    pub ty: Ty,
    pub init: Option<Init>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Expr(Expr),
    Block(ScopeId, Vec<Stmt>),
    If { cond: Expr, tt: Box<Stmt>, ff: Option<Box<Stmt>> },
    Switch { value: Expr, body: Box<Stmt>, cases: Vec<(Option<i64>, Id)> },
    While { cond: Expr, body: Box<Stmt> },
    DoWhile { body: Box<Stmt>, cond: Expr },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Case(i64, Id),
    Default(Id),
    Goto(Id),
    Label(Id, Box<Stmt>),
    VarDecl(Vec<VarDecl>),
    Asm(String),
    Empty,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Id,
    pub ty: Ty,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: Id,
    pub ty: Ty, // Function type
    pub params: Vec<Param>,
    pub body: Option<Stmt>, // None for a prototype-only declaration
    pub is_static: bool,
    pub scope: ScopeId, // the function's top-level block scope
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct GlobalDecl {
    pub name: Id,
    pub ty: Ty,
    pub init: Option<Init>,
    pub is_static: bool,
    pub is_extern: bool,
}

/// A whole translation unit: top-level declarations plus every scope and
/// type created while parsing it.
#[derive(Debug)]
pub struct Program {
    pub functions: Vec<FunctionDecl>,
    pub globals: Vec<GlobalDecl>,
    /// Anonymous globals created for string literals: (label, bytes).
    pub string_literals: Vec<(Id, Vec<u8>)>,
    pub scopes: Scopes,
}
