use serde::{Deserialize, Serialize};

/// Configuration knobs for one compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Row-count cap applied to every result sink; `None` disables capping.
    pub max_output_rows: Option<i64>,
    /// Safety valve for fixed-point rule batches.
    pub max_rule_iterations: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_output_rows: None,
            max_rule_iterations: 100,
        }
    }
}
