use std::collections::BTreeMap;

use qv_common::NodeId;
use qv_planner::{plan_fragment, Dag, DagProto, IrGraph, PlanFragment};
use serde::{Deserialize, Serialize};

/// Capability descriptor for one execution node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    /// Address-space id; matched against the high 32 bits of UPID-typed
    /// UDTF arguments.
    pub asid: u32,
    pub has_data_store: bool,
    pub has_grpc_server: bool,
    pub processes_data: bool,
}

impl WorkerInfo {
    /// A leaf agent: stores and processes data, no coordination endpoint.
    pub fn data_node(name: impl Into<String>, asid: u32) -> Self {
        Self {
            name: name.into(),
            asid,
            has_data_store: true,
            has_grpc_server: false,
            processes_data: true,
        }
    }

    /// A coordinator: serves the query endpoint and processes data, but
    /// holds no data store of its own.
    pub fn coordinator(name: impl Into<String>, asid: u32) -> Self {
        Self {
            name: name.into(),
            asid,
            has_data_store: false,
            has_grpc_server: true,
            processes_data: true,
        }
    }

    /// Stores data and does not act as a pure coordinator; memory sources
    /// survive only here.
    pub fn is_data_node(&self) -> bool {
        self.has_data_store && self.processes_data && !self.has_grpc_server
    }

    pub fn is_coordinator(&self) -> bool {
        self.has_grpc_server && self.processes_data
    }
}

/// One worker's plan instance within a distributed plan.
#[derive(Debug, Clone)]
pub struct PlanInstance {
    pub worker: WorkerInfo,
    pub graph: IrGraph,
}

/// A distributed plan: per-worker plan instances plus a coordination DAG
/// describing which instances feed which.
#[derive(Debug, Clone, Default)]
pub struct DistributedPlan {
    dag: Dag,
    instances: BTreeMap<NodeId, PlanInstance>,
    next_id: u64,
}

/// Wire form of one worker's compiled fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFragment {
    pub worker: WorkerInfo,
    pub fragment: PlanFragment,
}

/// Wire form of a whole distributed plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributedPlanProto {
    pub coordination: DagProto,
    pub fragments: Vec<WorkerFragment>,
}

impl DistributedPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instance(&mut self, worker: WorkerInfo, graph: IrGraph) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.dag.add_node(id);
        self.instances.insert(id, PlanInstance { worker, graph });
        id
    }

    /// Record that `from`'s results feed `to`.
    pub fn add_dependency(&mut self, from: NodeId, to: NodeId) {
        self.dag.add_edge(from, to);
    }

    pub fn delete_instance(&mut self, id: NodeId) {
        self.dag.delete_node(id);
        self.instances.remove(&id);
    }

    pub fn instance(&self, id: NodeId) -> Option<&PlanInstance> {
        self.instances.get(&id)
    }

    pub fn instance_mut(&mut self, id: NodeId) -> Option<&mut PlanInstance> {
        self.instances.get_mut(&id)
    }

    pub fn instance_ids(&self) -> Vec<NodeId> {
        self.instances.keys().copied().collect()
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Serialize: one fragment per instance (in id order) plus the
    /// coordination DAG with sorted adjacency.
    pub fn to_proto(&self) -> DistributedPlanProto {
        DistributedPlanProto {
            coordination: self.dag.to_proto(),
            fragments: self
                .instances
                .values()
                .map(|instance| WorkerFragment {
                    worker: instance.worker.clone(),
                    fragment: plan_fragment(&instance.graph),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_capability_predicates() {
        let data = WorkerInfo::data_node("agent-1", 7);
        assert!(data.is_data_node());
        assert!(!data.is_coordinator());

        let coordinator = WorkerInfo::coordinator("coord-1", 1);
        assert!(coordinator.is_coordinator());
        assert!(!coordinator.is_data_node());

        // A node that both stores data and coordinates is not a data node
        // for source-placement purposes.
        let hybrid = WorkerInfo {
            name: "hybrid".to_string(),
            asid: 2,
            has_data_store: true,
            has_grpc_server: true,
            processes_data: true,
        };
        assert!(!hybrid.is_data_node());
        assert!(hybrid.is_coordinator());
    }

    #[test]
    fn delete_instance_drops_coordination_edges() {
        let mut plan = DistributedPlan::new();
        let a = plan.add_instance(WorkerInfo::data_node("a", 1), IrGraph::new());
        let b = plan.add_instance(WorkerInfo::coordinator("b", 2), IrGraph::new());
        plan.add_dependency(a, b);
        plan.delete_instance(a);
        assert_eq!(plan.len(), 1);
        assert!(plan.dag().parents_of(b).is_empty());
    }
}
