use qv_common::{NodeId, QvError, Result};
use qv_planner::{IrGraph, Rule};
use tracing::debug;

use crate::plan::{DistributedPlan, WorkerInfo};
use crate::rules::{prune_empty_plans, PruneUnavailableSourcesRule};

/// Splits one compiled logical graph into a per-worker distributed plan.
///
/// Each worker gets a deep copy of the logical plan with unavailable
/// sources pruned; instances left empty are removed, and every surviving
/// data-node instance feeds every surviving coordinator instance in the
/// coordination DAG.
#[derive(Debug, Default)]
pub struct DistributedPlanner;

impl DistributedPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn split(&self, logical: &IrGraph, workers: &[WorkerInfo]) -> Result<DistributedPlan> {
        if workers.is_empty() {
            return Err(QvError::InvalidConfig(
                "distributed planning requires at least one worker".to_string(),
            ));
        }
        let mut plan = DistributedPlan::new();
        let mut data_instances: Vec<NodeId> = Vec::new();
        let mut coordinator_instances: Vec<NodeId> = Vec::new();
        let mut coordinator_seen = false;

        for worker in workers {
            let mut graph = logical.clone();
            let one_coordinator_owner = worker.is_coordinator() && !coordinator_seen;
            coordinator_seen |= worker.is_coordinator();
            let rule = PruneUnavailableSourcesRule {
                worker,
                one_coordinator_owner,
            };
            rule.execute(&mut graph)?;
            debug!(
                worker = %worker.name,
                operators = graph.operator_count(),
                "built worker plan instance"
            );
            let id = plan.add_instance(worker.clone(), graph);
            if worker.is_coordinator() {
                coordinator_instances.push(id);
            } else if worker.is_data_node() {
                data_instances.push(id);
            }
        }

        for &data in &data_instances {
            for &coordinator in &coordinator_instances {
                plan.add_dependency(data, coordinator);
            }
        }
        prune_empty_plans(&mut plan);
        Ok(plan)
    }
}
