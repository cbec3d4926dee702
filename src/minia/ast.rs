#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone)]
pub enum Expr {
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),
    Ident(String),
    Call { func: String, args: Vec<Expr> },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Neg(Box<Expr>),
}

/// One `name = expr;` line.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub name: String,
    pub expr: Expr,
}
