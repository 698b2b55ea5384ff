use serde::{Deserialize, Serialize};

/// Switches that change the shape of a built flow.
///
/// Two flows built with different options are different cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowOptions {
    /// Fold conditions that are constant expressions into unconditional jumps.
    pub fold_constant_conditions: bool,
    /// Inside a `try`, add exception jumps after every variable write.
    pub model_exceptions_after_assignment: bool,
    /// Wrap the write of an assignment in an element for its target expression.
    pub assignment_targets_are_nodes: bool,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            fold_constant_conditions: true,
            model_exceptions_after_assignment: false,
            assignment_targets_are_nodes: false,
        }
    }
}

impl FlowOptions {
    pub fn with_folding(self, fold_constant_conditions: bool) -> Self {
        Self {
            fold_constant_conditions,
            ..self
        }
    }

    pub fn with_exceptions_after_assignment(self, enabled: bool) -> Self {
        Self {
            model_exceptions_after_assignment: enabled,
            ..self
        }
    }

    pub fn with_assignment_target_nodes(self, enabled: bool) -> Self {
        Self {
            assignment_targets_are_nodes: enabled,
            ..self
        }
    }
}
