//! Conditions, short-circuit operators and constant folding.

use tracing::debug;
use tree_sitter::Node;

use super::constants::condition_value;
use super::{FlowBuilder, Target};
use crate::analysis::control_flow::instruction::BranchRole;
use crate::errors::{FlowError, Result};
use crate::syntax::{named_children, skip_parens, SyntaxRef};

/// Where control goes once a condition is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct BranchTargets {
    pub(super) when_true: Target,
    pub(super) true_role: BranchRole,
    pub(super) when_false: Target,
    pub(super) false_role: BranchRole,
}

impl BranchTargets {
    pub(super) fn new(
        when_true: Target,
        true_role: BranchRole,
        when_false: Target,
        false_role: BranchRole,
    ) -> Self {
        Self {
            when_true,
            true_role,
            when_false,
            false_role,
        }
    }

    pub(super) fn uniform(target: Target) -> Self {
        Self::new(target, BranchRole::End, target, BranchRole::End)
    }

    fn swapped(self) -> Self {
        Self::new(self.when_false, self.false_role, self.when_true, self.true_role)
    }
}

fn operator(node: Node<'_>) -> Option<&'static str> {
    node.child_by_field_name("operator").map(|op| op.kind())
}

pub(super) fn is_short_circuit(node: Node<'_>) -> bool {
    node.kind() == "binary_expression" && matches!(operator(node), Some("&&" | "||"))
}

impl FlowBuilder<'_> {
    fn current_targets(&self) -> Result<BranchTargets> {
        self.targets
            .last()
            .copied()
            .ok_or_else(|| FlowError::invariant("condition lowered without branch targets"))
    }

    pub(super) fn with_targets<T>(
        &mut self,
        targets: BranchTargets,
        lower: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.targets.push(targets);
        let result = lower(self);
        self.targets.pop();
        result
    }

    /// Value of `node` if folding is enabled and it is a constant expression.
    pub(super) fn folded(&mut self, node: Node<'_>) -> Option<bool> {
        if !self.options.fold_constant_conditions {
            return None;
        }
        let scopes = &self.scopes;
        let lookup = |name: &str| scopes.resolve(name).and_then(|declared| declared.constant.clone());
        let value = condition_value(node, self.source, &lookup)?;
        debug!(condition = %SyntaxRef::of(node), value, "Folded constant condition");
        self.buffer.mark_constant_condition();
        Some(value)
    }

    /// After `condition` was lowered: jump to `target` when it evaluates to `jump_when`.
    pub(super) fn branch_on(
        &mut self,
        condition: Node<'_>,
        target: Target,
        role: BranchRole,
        jump_when: bool,
    ) -> Result<()> {
        match self.folded(condition) {
            Some(value) if value == jump_when => self.emit_goto(target, role, false),
            Some(_) => Ok(()),
            None => self.emit_conditional(
                target,
                role,
                jump_when,
                Some(SyntaxRef::of(skip_parens(condition))),
            ),
        }
    }

    /// Lower `node` in a position where only its truth value matters.
    ///
    /// Short-circuit operators jump straight to the targets on top of the
    /// stack instead of producing a value.
    pub(super) fn lower_condition(&mut self, node: Node<'_>) -> Result<()> {
        match node.kind() {
            "parenthesized_expression" => {
                let handle = self.start(node)?;
                if let Some(inner) = named_children(node).into_iter().next() {
                    self.lower_condition(inner)?;
                }
                self.finish(handle)
            }
            "unary_expression" if operator(node) == Some("!") => {
                let handle = self.start(node)?;
                let swapped = self.current_targets()?.swapped();
                if let Some(operand) = node.child_by_field_name("operand") {
                    self.with_targets(swapped, |builder| builder.lower_condition(operand))?;
                }
                self.finish(handle)
            }
            _ if is_short_circuit(node) => {
                let handle = self.start(node)?;
                self.lower_short_circuit(node)?;
                self.finish(handle)
            }
            _ => self.lower_expression(node),
        }
    }

    /// `a && b` / `a || b` against the targets on top of the stack.
    pub(super) fn lower_short_circuit(&mut self, node: Node<'_>) -> Result<()> {
        let (Some(left), Some(right)) = (
            node.child_by_field_name("left"),
            node.child_by_field_name("right"),
        ) else {
            return Ok(());
        };
        let is_and = operator(node) == Some("&&");
        let outer = self.current_targets()?;
        let right_start = Target::start(right);

        let left_targets = if is_and {
            BranchTargets::new(right_start, BranchRole::Then, outer.when_false, outer.false_role)
        } else {
            BranchTargets::new(outer.when_true, outer.true_role, right_start, BranchRole::Else)
        };
        self.with_targets(left_targets, |builder| builder.lower_condition(left))?;

        if is_and {
            self.branch_on(left, outer.when_false, outer.false_role, false)?;
        } else {
            self.branch_on(left, outer.when_true, outer.true_role, true)?;
        }
        self.lower_condition(right)
    }
}
