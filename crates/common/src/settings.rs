use serde::{Deserialize, Serialize};

/// Environment variable toggling plan-diagram debug logging.
const LOG_PLAN_DIAGRAM_ENV: &str = "SFQ_DISTSQL_LOG_PLAN";

/// Read-only planner settings.
///
/// The surrounding service owns mutation of these flags; planner instances
/// receive a snapshot and only read it through the accessor methods, which
/// keeps planners testable in isolation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerSettings {
    /// If set, index joins instantiate a join reader on every node that has
    /// a stream; if not set, a single join reader is used.
    pub distribute_index_joins: bool,
    /// If set, merge joins are planned when possible.
    pub merge_joins_enabled: bool,
    /// If set, the plan diagram (JSON) is logged for each plan.
    pub log_plan_diagram: bool,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            distribute_index_joins: true,
            merge_joins_enabled: true,
            log_plan_diagram: false,
        }
    }
}

impl PlannerSettings {
    /// Defaults with the debug toggle taken from the environment.
    pub fn from_env() -> Self {
        Self {
            log_plan_diagram: std::env::var(LOG_PLAN_DIAGRAM_ENV)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            ..Self::default()
        }
    }

    /// Whether index joins fan out one join reader per upstream stream.
    pub fn distribute_index_joins(&self) -> bool {
        self.distribute_index_joins
    }

    /// Whether merge joins are planned when the input orderings allow it.
    pub fn merge_joins_enabled(&self) -> bool {
        self.merge_joins_enabled
    }

    /// Whether finalized plan diagrams are logged.
    pub fn log_plan_diagram(&self) -> bool {
        self.log_plan_diagram
    }
}
