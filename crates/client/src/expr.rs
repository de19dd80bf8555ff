use qv_planner::LiteralValue;

/// Builder-side expression tree, lowered into IR expression nodes when an
/// operator is constructed.
#[derive(Debug, Clone)]
pub enum ExprDef {
    /// Column of the operator's first parent operand.
    Col(String),
    /// Column of an explicit parent operand (joins have two).
    ColOf(usize, String),
    Lit(LiteralValue),
    Func { name: String, args: Vec<ExprDef> },
    Metadata(String),
    Tuple(Vec<ExprDef>),
}

pub fn col(name: impl Into<String>) -> ExprDef {
    ExprDef::Col(name.into())
}

pub fn col_of(parent_idx: usize, name: impl Into<String>) -> ExprDef {
    ExprDef::ColOf(parent_idx, name.into())
}

pub fn lit(value: impl Into<LiteralValue>) -> ExprDef {
    ExprDef::Lit(value.into())
}

pub fn func(name: impl Into<String>, args: Vec<ExprDef>) -> ExprDef {
    ExprDef::Func {
        name: name.into(),
        args,
    }
}

/// Semantic metadata reference (`metadata("pod_name")`), converted by the
/// planner into a function call over a key column in scope.
pub fn metadata(name: impl Into<String>) -> ExprDef {
    ExprDef::Metadata(name.into())
}

impl ExprDef {
    pub fn add(self, other: ExprDef) -> ExprDef {
        func("add", vec![self, other])
    }

    pub fn subtract(self, other: ExprDef) -> ExprDef {
        func("subtract", vec![self, other])
    }

    pub fn multiply(self, other: ExprDef) -> ExprDef {
        func("multiply", vec![self, other])
    }

    pub fn eq(self, other: ExprDef) -> ExprDef {
        func("equal", vec![self, other])
    }

    pub fn gt(self, other: ExprDef) -> ExprDef {
        func("greater_than", vec![self, other])
    }
}
