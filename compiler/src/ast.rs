// ast.rs — AST for the structured re-emission notation
//
// The notation is the indentation-structured, array-oriented script written
// by `codegen::emit_script`: symbol declarations, one `@program` function,
// container declarations, scope headers and dataflow leaves. Symbolic
// sub-expressions (shapes, subsets, iteration ranges) are parsed straight
// into `Expr` / `Range`.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use chumsky::span::SimpleSpan;

use crate::subset::Range;
use crate::symbolic::Expr;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

// ── Root ──

/// A complete script: symbol declarations followed by one program.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub symbols: Vec<SymbolDecl>,
    pub name: Ident,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// `N = symbol("N", int64)`
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolDecl {
    pub name: Ident,
    pub dtype: Ident,
    pub span: Span,
}

/// `A: float64[N, M]` or `x: float64`
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Ident,
    pub dtype: Ident,
    pub shape: Option<Vec<Expr>>,
    pub span: Span,
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `T = ndarray([10], float64)` / `s = scalar(float64)`
    Decl {
        name: Ident,
        dtype: Ident,
        shape: Option<Vec<Expr>>,
    },
    Scope {
        header: ScopeHeader,
        body: Vec<Stmt>,
    },
    Label(Ident),
    /// `None` is `goto exit`.
    Goto(Option<Ident>),
    Assign {
        name: Ident,
        value: String,
    },
    Break,
    Continue,
    Pass,
    Tasklet {
        code: String,
        connectors: Vec<Connector>,
    },
    Library {
        op: String,
        properties: Vec<(Ident, String)>,
        connectors: Vec<Connector>,
    },
    Copy {
        src: MemletRef,
        dst: MemletRef,
        wcr: Option<String>,
    },
    DynScopeCopy {
        src: MemletRef,
        dst: Ident,
    },
    View {
        name: Ident,
        source: MemletRef,
        shape: Vec<Expr>,
        nested: bool,
    },
    RefSet {
        name: Ident,
        source: MemletRef,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScopeHeader {
    Map { params: Vec<Ident>, range: Range },
    Pipeline { params: Vec<Ident>, range: Range },
    Consume {
        pe_index: Ident,
        stream: Ident,
        num_pes: Expr,
        condition: Option<String>,
    },
    Loop {
        var: Ident,
        init: String,
        condition: String,
        update: String,
    },
    While(String),
    DoWhile(String),
    If(String),
    Elif(String),
    Else,
    StateIf(String),
    GBlock,
}

// ── Dataflow ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `conn << memlet`
    In,
    /// `conn >> memlet`
    Out,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connector {
    pub name: Ident,
    pub direction: Direction,
    pub memlet: MemletRef,
}

/// `A[0:10]`, `B(10, sum)[0:10]` or a bare container name.
#[derive(Debug, Clone, PartialEq)]
pub struct MemletRef {
    pub data: Ident,
    /// Multiplicity and reducer as written; the multiplicity is informative.
    pub wcr: Option<(Expr, String)>,
    pub subset: Option<Range>,
    pub span: Span,
}
