use qv_common::{NodeId, QvError, Result};
use tracing::debug;

use crate::ir::IrGraph;

/// One unit of graph analysis/rewrite.
///
/// Contract:
/// - `apply` returns `Ok(true)` when it changed the graph for `node`;
/// - a rule must be idempotent at fixed point: once a full pass reports no
///   change, re-running must report no change again;
/// - a rule that errors leaves the graph structurally consistent (no
///   dangling edges), though possibly partially rewritten.
pub trait Rule {
    fn name(&self) -> &'static str;

    /// Apply the rule to a single node.
    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool>;

    /// One full pass: operators in topological order, then expressions in
    /// ascending id order. ORs the changed bits and fails fast on the first
    /// error.
    ///
    /// Node-id snapshots are taken up front; nodes deleted mid-pass are
    /// skipped, nodes created mid-pass are picked up on the next pass.
    fn execute(&self, graph: &mut IrGraph) -> Result<bool> {
        let mut any_changed = false;
        for node in graph.dag().topological_sort() {
            if !graph.has_node(node) {
                continue;
            }
            any_changed |= self.apply(graph, node)?;
        }
        for node in graph.expression_ids() {
            if !graph.has_node(node) {
                continue;
            }
            any_changed |= self.apply(graph, node)?;
        }
        Ok(any_changed)
    }
}

/// Batch execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Run every rule once, in order.
    Once,
    /// Loop the batch until a full pass reports no change; exceeding
    /// `max_iterations` fails the compilation.
    FixedPoint { max_iterations: usize },
}

/// Ordered group of rules that reach a fixed point together before the next
/// batch runs.
pub struct RuleBatch<'a> {
    name: &'static str,
    strategy: Strategy,
    rules: Vec<Box<dyn Rule + 'a>>,
}

impl<'a> RuleBatch<'a> {
    pub fn new(name: &'static str, strategy: Strategy) -> Self {
        Self {
            name,
            strategy,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: impl Rule + 'a) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn execute_pass(&self, graph: &mut IrGraph) -> Result<bool> {
        let mut any_changed = false;
        for rule in &self.rules {
            let changed = rule.execute(graph)?;
            debug!(batch = self.name, rule = rule.name(), changed, "rule pass");
            any_changed |= changed;
        }
        Ok(any_changed)
    }

    fn execute(&self, graph: &mut IrGraph) -> Result<()> {
        match self.strategy {
            Strategy::Once => {
                self.execute_pass(graph)?;
            }
            Strategy::FixedPoint { max_iterations } => {
                let mut iterations = 0;
                while self.execute_pass(graph)? {
                    iterations += 1;
                    if iterations >= max_iterations {
                        return Err(QvError::Unsupported(format!(
                            "rule batch '{}' failed to converge after {max_iterations} iterations",
                            self.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Runs an ordered sequence of rule batches, each once (or looped to its own
/// fixed point), aborting on the first error.
#[derive(Default)]
pub struct RuleExecutor<'a> {
    batches: Vec<RuleBatch<'a>>,
}

impl<'a> RuleExecutor<'a> {
    pub fn new() -> Self {
        Self {
            batches: Vec::new(),
        }
    }

    pub fn add_batch(&mut self, batch: RuleBatch<'a>) {
        self.batches.push(batch);
    }

    pub fn execute(&self, graph: &mut IrGraph) -> Result<()> {
        for batch in &self.batches {
            debug!(batch = batch.name(), "executing rule batch");
            batch.execute(graph)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ExprKind, OperatorKind};
    use crate::types::LiteralValue;
    use qv_common::SourceSpan;
    use std::cell::Cell;

    /// Reports change for the first `n` passes, then settles.
    struct CountingRule {
        remaining: Cell<usize>,
    }

    impl Rule for CountingRule {
        fn name(&self) -> &'static str {
            "CountingRule"
        }

        fn apply(&self, _graph: &mut IrGraph, _node: NodeId) -> Result<bool> {
            Ok(false)
        }

        fn execute(&self, _graph: &mut IrGraph) -> Result<bool> {
            let left = self.remaining.get();
            if left == 0 {
                return Ok(false);
            }
            self.remaining.set(left - 1);
            Ok(true)
        }
    }

    fn tiny_graph() -> IrGraph {
        let mut g = IrGraph::new();
        g.add_operator(
            SourceSpan::UNKNOWN,
            OperatorKind::MemorySource {
                table: "t".to_string(),
                column_names: vec![],
                time_start: None,
                time_stop: None,
                time_start_ns: None,
                time_stop_ns: None,
            },
            &[],
        )
        .expect("source");
        g.add_expr(
            SourceSpan::UNKNOWN,
            ExprKind::Literal(LiteralValue::Int64(1)),
        );
        g
    }

    #[test]
    fn fixed_point_batch_stops_on_convergence() {
        let mut graph = tiny_graph();
        let mut executor = RuleExecutor::new();
        executor.add_batch(
            RuleBatch::new(
                "test",
                Strategy::FixedPoint {
                    max_iterations: 10,
                },
            )
            .with_rule(CountingRule {
                remaining: Cell::new(3),
            }),
        );
        executor.execute(&mut graph).expect("converges");
    }

    #[test]
    fn fixed_point_batch_fails_past_iteration_budget() {
        let mut graph = tiny_graph();
        let mut executor = RuleExecutor::new();
        executor.add_batch(
            RuleBatch::new("test", Strategy::FixedPoint { max_iterations: 2 }).with_rule(
                CountingRule {
                    remaining: Cell::new(100),
                },
            ),
        );
        let err = executor.execute(&mut graph).unwrap_err();
        assert!(matches!(err, QvError::Unsupported(_)));
    }

    #[test]
    fn default_execute_visits_operators_and_expressions() {
        struct TouchAll {
            ops: Cell<usize>,
            exprs: Cell<usize>,
        }
        impl Rule for TouchAll {
            fn name(&self) -> &'static str {
                "TouchAll"
            }
            fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
                if graph.maybe_op(node).is_some() {
                    self.ops.set(self.ops.get() + 1);
                } else {
                    self.exprs.set(self.exprs.get() + 1);
                }
                Ok(false)
            }
        }
        let mut graph = tiny_graph();
        let rule = TouchAll {
            ops: Cell::new(0),
            exprs: Cell::new(0),
        };
        let changed = rule.execute(&mut graph).expect("execute");
        assert!(!changed);
        assert_eq!(rule.ops.get(), 1);
        assert_eq!(rule.exprs.get(), 1);
    }
}
