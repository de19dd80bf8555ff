use qv_common::{compile_err, Result, SourceSpan};
use qv_planner::{CompileTimeExpressionRule, ExprKind, IrGraph, LiteralValue, Rule};

use crate::dataframe::lower_expr;
use crate::expr::ExprDef;

/// Evaluate a bare expression in isolation: lower it into a scratch graph,
/// fold to fixed point, and require a literal result.
///
/// Used for flag/default-value evaluation outside any query.
pub fn evaluate_compile_time(expr: &ExprDef) -> Result<LiteralValue> {
    let span = SourceSpan::UNKNOWN;
    let mut graph = IrGraph::new();
    let root = lower_expr(&mut graph, span, expr);
    let rule = CompileTimeExpressionRule;
    while rule.execute(&mut graph)? {}
    match &graph.expr(root).kind {
        ExprKind::Literal(v) => Ok(v.clone()),
        other => compile_err(
            span,
            format!(
                "expression is not compile-time evaluable (stuck at {})",
                other.name()
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{col, lit};

    #[test]
    fn folds_nested_arithmetic() {
        let expr = lit(2i64).add(lit(3i64).multiply(lit(4i64)));
        assert_eq!(
            evaluate_compile_time(&expr).expect("folds"),
            LiteralValue::Int64(14)
        );
    }

    #[test]
    fn rejects_runtime_expressions() {
        let expr = col("cpu0").add(lit(1i64));
        assert!(evaluate_compile_time(&expr).is_err());
    }
}
