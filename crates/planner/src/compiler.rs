use qv_common::{PlannerConfig, Result};

use crate::analysis::{
    verify_resolved, CheckMetadataColumnNamingRule, CompileTimeExpressionRule,
    ConvertMetadataRule, ConvertStringTimesRule, DataTypeRule, OperatorRelationRule,
    ResolveMetadataPropertyRule, SourceRelationRule, VerifyFilterExpressionRule,
};
use crate::ir::IrGraph;
use crate::proto::{plan_fragment, PlanFragment};
use crate::rewrites::{
    AddLimitToResultSinkRule, CleanUpStrayIRNodesRule, CombineConsecutiveMapsRule,
    MergeGroupByIntoGroupAcceptorRule, PropagateExpressionAnnotationsRule,
    PruneUnconnectedOperatorsRule, PruneUnusedColumnsRule, RemoveGroupByRule, SetupJoinTypeRule,
    UniqueSinkNameRule,
};
use crate::rules::{RuleBatch, RuleExecutor, Strategy};
use crate::state::CompilerState;

/// Drives one compilation over an IR graph.
///
/// Batch order is fixed and intentionally conservative:
/// 1. structural setup (join normalization, groupby merging, naming checks)
/// 2. resolution to fixed point (sources, times, types, metadata, relations)
/// 3. verification (boolean filters, unresolved-node sweep)
/// 4. output shaping (sink naming, result row caps)
/// 5. cleanup to fixed point (map fusion, column pruning, stray collection)
/// 6. finalize (annotation propagation, dead-operator pruning)
#[derive(Debug, Default)]
pub struct Compiler {
    config: PlannerConfig,
}

impl Compiler {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Compile the graph in place: after a successful return every operator
    /// has a resolved relation and the graph is pruned to what its sinks
    /// need.
    pub fn compile(&self, graph: &mut IrGraph, state: &CompilerState) -> Result<()> {
        let fixed_point = Strategy::FixedPoint {
            max_iterations: self.config.max_rule_iterations,
        };

        let mut front = RuleExecutor::new();
        front.add_batch(
            RuleBatch::new("setup", Strategy::Once)
                .with_rule(CheckMetadataColumnNamingRule)
                .with_rule(SetupJoinTypeRule)
                .with_rule(MergeGroupByIntoGroupAcceptorRule)
                .with_rule(RemoveGroupByRule),
        );
        front.add_batch(
            RuleBatch::new("resolve", fixed_point)
                .with_rule(SourceRelationRule { state })
                .with_rule(ConvertStringTimesRule { state })
                .with_rule(CompileTimeExpressionRule)
                .with_rule(ResolveMetadataPropertyRule { state })
                .with_rule(ConvertMetadataRule { state })
                .with_rule(DataTypeRule { state })
                .with_rule(OperatorRelationRule),
        );
        front.execute(graph)?;

        // Resolution converged; anything still unresolved is a user error.
        verify_resolved(graph)?;

        let max_output_rows = state.max_output_rows().or(self.config.max_output_rows);
        let mut back = RuleExecutor::new();
        back.add_batch(
            RuleBatch::new("verify", Strategy::Once).with_rule(VerifyFilterExpressionRule),
        );
        back.add_batch(
            RuleBatch::new("shape_output", Strategy::Once)
                .with_rule(UniqueSinkNameRule)
                .with_rule(AddLimitToResultSinkRule { max_output_rows }),
        );
        back.add_batch(
            RuleBatch::new("cleanup", fixed_point)
                .with_rule(CombineConsecutiveMapsRule)
                .with_rule(PruneUnusedColumnsRule)
                .with_rule(CleanUpStrayIRNodesRule),
        );
        back.add_batch(
            RuleBatch::new("finalize", Strategy::Once)
                .with_rule(PropagateExpressionAnnotationsRule)
                .with_rule(PruneUnconnectedOperatorsRule)
                .with_rule(CleanUpStrayIRNodesRule),
        );
        back.execute(graph)
    }

    /// [`Compiler::compile`] plus serialization to the wire form.
    pub fn compile_to_fragment(
        &self,
        graph: &mut IrGraph,
        state: &CompilerState,
    ) -> Result<PlanFragment> {
        self.compile(graph, state)?;
        Ok(plan_fragment(graph))
    }
}
