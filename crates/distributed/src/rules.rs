//! Capability-aware pruning applied to each worker's plan instance.

use qv_common::{NodeId, Result};
use qv_planner::{ExprKind, IrGraph, LiteralValue, OperatorKind, Rule, SemanticType, UdtfExecutor, UdtfSpec};
use tracing::debug;

use crate::plan::{DistributedPlan, WorkerInfo};

/// Removes source operators a worker cannot serve, along with their
/// now-dead descendant subtrees.
///
/// Memory sources survive only on data nodes; UDTF sources survive per
/// their declared executor policy and per-argument identity filters.
pub struct PruneUnavailableSourcesRule<'a> {
    pub worker: &'a WorkerInfo,
    /// Exactly one coordinator instance owns `OneCoordinator` UDTFs; the
    /// splitter marks it.
    pub one_coordinator_owner: bool,
}

impl<'a> PruneUnavailableSourcesRule<'a> {
    fn worker_executes_udtf(&self, executor: UdtfExecutor) -> bool {
        match executor {
            UdtfExecutor::AllAgents => true,
            UdtfExecutor::AllDataNodes | UdtfExecutor::SubsetDataNodes => {
                self.worker.is_data_node()
            }
            UdtfExecutor::AllCoordinators | UdtfExecutor::SubsetCoordinators => {
                self.worker.is_coordinator()
            }
            UdtfExecutor::OneCoordinator => self.one_coordinator_owner,
        }
    }

    /// Subset policies carry identity arguments; a non-matching worker
    /// drops the source.
    fn udtf_matches_filters(
        &self,
        graph: &IrGraph,
        spec: &UdtfSpec,
        arg_values: &[NodeId],
    ) -> bool {
        for (arg_spec, &value) in spec.args.iter().zip(arg_values) {
            let expr = graph.expr(value);
            match arg_spec.semantic_type {
                SemanticType::Upid => {
                    if let ExprKind::Literal(LiteralValue::Uint128(upid)) = &expr.kind {
                        // The address-space id lives in the high 32 bits.
                        let asid = (upid >> 96) as u32;
                        if asid != self.worker.asid {
                            return false;
                        }
                    }
                }
                SemanticType::AgentUid => {
                    if let ExprKind::Literal(LiteralValue::String(uid)) = &expr.kind {
                        if *uid != self.worker.name {
                            return false;
                        }
                    }
                }
                _ => {}
            }
        }
        true
    }
}

impl<'a> Rule for PruneUnavailableSourcesRule<'a> {
    fn name(&self) -> &'static str {
        "PruneUnavailableSourcesRule"
    }

    fn apply(&self, graph: &mut IrGraph, node: NodeId) -> Result<bool> {
        let Some(op) = graph.maybe_op(node) else {
            return Ok(false);
        };
        match &op.kind {
            OperatorKind::MemorySource { table, .. } => {
                if self.worker.is_data_node() {
                    return Ok(false);
                }
                debug!(
                    worker = %self.worker.name,
                    table = %table,
                    "pruning memory source from non-data node"
                );
                graph.delete_orphans_in_subtree(node);
                Ok(true)
            }
            OperatorKind::UdtfSource { spec, arg_values } => {
                if self.worker_executes_udtf(spec.executor)
                    && self.udtf_matches_filters(graph, spec, arg_values)
                {
                    return Ok(false);
                }
                debug!(
                    worker = %self.worker.name,
                    udtf = %spec.name,
                    "pruning udtf source from non-matching worker"
                );
                graph.delete_orphans_in_subtree(node);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Drops plan instances left with zero operators after source pruning.
pub fn prune_empty_plans(plan: &mut DistributedPlan) -> bool {
    let mut changed = false;
    for id in plan.instance_ids() {
        let empty = plan
            .instance(id)
            .is_some_and(|instance| instance.graph.operator_count() == 0);
        if empty {
            let worker = plan.instance(id).unwrap().worker.name.clone();
            debug!(worker = %worker, "pruning empty plan instance");
            plan.delete_instance(id);
            changed = true;
        }
    }
    changed
}
