//! Syntax tree for fragment functions.

use serde_json::Value;

/// A parsed `fn(params) { ... }` literal.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        value: Expr,
    },
    Assign {
        target: Place,
        value: Expr,
    },
    If {
        cond: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
    },
    For {
        binding: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Throw(Expr),
    Break,
    Continue,
    Expr(Expr),
}

/// Assignable location: a local followed by member/index accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct Place {
    pub root: String,
    pub path: Vec<Accessor>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accessor {
    Field(String),
    Index(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Coalesce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var {
        name: String,
        line: usize,
    },
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Member {
        object: Box<Expr>,
        field: String,
        line: usize,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        line: usize,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        line: usize,
    },
    /// Pure builtin call, e.g. `len(items)`.
    Call {
        function: String,
        args: Vec<Expr>,
        line: usize,
    },
    /// Capability call, e.g. `db.insert("visits", doc)`.
    Capability {
        object: String,
        method: String,
        args: Vec<Expr>,
        line: usize,
    },
}
