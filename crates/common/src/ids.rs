//! Typed identifiers shared across planner components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable IR/DAG node identifier.
///
/// Assigned by the IR graph factory; never reused within one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
