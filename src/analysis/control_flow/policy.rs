//! Which variables produce read and write instructions.

use super::instruction::{Variable, VariableKind};

/// Decides which variables a flow tracks.
///
/// The cache keys flows by [`FlowPolicy::key`], so two policies with the
/// same key must make the same decisions.
pub trait FlowPolicy: Send + Sync {
    fn is_variable_tracked(&self, variable: &Variable) -> bool;

    fn is_parameter_tracked(&self, parameter: &Variable) -> bool {
        self.is_variable_tracked(parameter)
    }

    fn key(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Locals, parameters and the other method-scoped variables. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalVariablesPolicy;

impl FlowPolicy for LocalVariablesPolicy {
    fn is_variable_tracked(&self, variable: &Variable) -> bool {
        !variable.is_field()
    }
}

/// Locals plus fields accessed through `this` or by bare name.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalsAndFieldsPolicy;

impl FlowPolicy for LocalsAndFieldsPolicy {
    fn is_variable_tracked(&self, _variable: &Variable) -> bool {
        true
    }
}

/// Only parameters, for callers that care about argument use.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParametersOnlyPolicy;

impl FlowPolicy for ParametersOnlyPolicy {
    fn is_variable_tracked(&self, variable: &Variable) -> bool {
        variable.kind == VariableKind::Parameter
    }
}
