//! The `.sans` native dialect's statement-level AST. Expressions reuse
//! `sans_core::expr::Expr` directly — the expression grammar is shared by
//! both front-ends and the IR, so there is no separate expression AST to
//! maintain.

use sans_core::expr::Expr;
use sans_core::types::Literal;
use sans_core::Loc;

#[derive(Debug, Clone, PartialEq)]
pub enum DatasourceSpec {
    Csv {
        path: String,
        columns: Option<Vec<String>>,
    },
    InlineCsv {
        columns: Option<Vec<String>>,
        body: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeriveAssign {
    pub target: String,
    pub expr: Expr,
    pub is_update: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CastSpec {
    pub col: String,
    pub to: String,
    pub on_error: Option<String>,
    pub trim: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Select(Vec<String>),
    Filter(Expr),
    Derive(Vec<DeriveAssign>),
    Rename(Vec<(String, String)>),
    Drop(Vec<String>),
    Cast(Vec<CastSpec>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SortBuilder {
    pub by: Vec<(String, bool)>,
    pub nodupkey: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggBuilder {
    pub by: Vec<String>,
    pub class: Vec<String>,
    pub var: Vec<String>,
    pub stats: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    From(String),
    Bare(String),
    Sort(Box<TableExpr>, SortBuilder),
    Aggregate(Box<TableExpr>, AggBuilder),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableExpr {
    pub source: Source,
    pub transforms: Vec<Transform>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        expr: Expr,
        loc: Loc,
    },
    Const {
        bindings: Vec<(String, Literal)>,
        loc: Loc,
    },
    Datasource {
        name: String,
        spec: DatasourceSpec,
        loc: Loc,
    },
    Table {
        name: String,
        expr: TableExpr,
        loc: Loc,
    },
    Save {
        table: String,
        path: String,
        artifact_name: Option<String>,
        loc: Loc,
    },
    Assert {
        expr: Expr,
        loc: Loc,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}
