//! Distributed plan splitting for Quiver.
//!
//! Architecture role:
//! - describes execution nodes and their capabilities ([`WorkerInfo`])
//! - splits one compiled logical plan into per-worker instances with
//!   capability-aware source pruning
//! - maintains the coordination DAG between instances and serializes the
//!   whole distributed plan

pub mod plan;
pub mod rules;
pub mod splitter;

pub use plan::{DistributedPlan, DistributedPlanProto, PlanInstance, WorkerFragment, WorkerInfo};
pub use rules::{prune_empty_plans, PruneUnavailableSourcesRule};
pub use splitter::DistributedPlanner;
