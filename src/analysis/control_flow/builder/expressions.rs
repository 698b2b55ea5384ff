//! Expressions, in evaluation order.

use tree_sitter::Node;

use super::conditions::{is_short_circuit, BranchTargets};
use super::scope::{captured_names, is_declaration_name};
use super::{FlowBuilder, Target};
use crate::analysis::control_flow::instruction::{BranchRole, Instruction, Variable, VariableKind};
use crate::errors::Result;
use crate::syntax::{children, first_child_of_kind, named_children, skip_parens, SyntaxRef};

fn is_type_node(kind: &str) -> bool {
    matches!(
        kind,
        "type_identifier"
            | "scoped_type_identifier"
            | "generic_type"
            | "array_type"
            | "integral_type"
            | "floating_point_type"
            | "boolean_type"
            | "void_type"
            | "type_arguments"
            | "dimensions"
            | "annotation"
            | "marker_annotation"
    )
}

impl FlowBuilder<'_> {
    pub(super) fn lower_expression(&mut self, node: Node<'_>) -> Result<()> {
        let handle = self.start(node)?;
        self.lower_expression_kind(node)?;
        self.finish(handle)
    }

    pub(super) fn lower_expression_kind(&mut self, node: Node<'_>) -> Result<()> {
        match node.kind() {
            "identifier" => match self.variable_for(node) {
                Some(variable) => self.read(&variable),
                None => Ok(()),
            },
            "field_access" => match self.variable_for(node) {
                Some(variable) => self.read(&variable),
                None => match node.child_by_field_name("object") {
                    Some(object) => self.lower_expression(object),
                    None => Ok(()),
                },
            },
            "assignment_expression" => self.lower_assignment(node),
            "update_expression" => self.lower_update(node),
            "binary_expression" if is_short_circuit(node) => {
                let own = BranchTargets::uniform(Target::end(node));
                self.with_targets(own, |builder| builder.lower_short_circuit(node))
            }
            "ternary_expression" => self.lower_ternary(node),
            "method_invocation" | "object_creation_expression" | "explicit_constructor_invocation" => {
                self.lower_call(node)
            }
            "lambda_expression" | "class_body" => self.lower_nested_body(node),
            "method_reference" => match named_children(node).into_iter().next() {
                Some(receiver) if !is_type_node(receiver.kind()) => self.lower_expression(receiver),
                _ => Ok(()),
            },
            "instanceof_expression" => self.lower_instanceof(node),
            "switch_expression" => self.lower_switch(node, true, Vec::new()),
            "cast_expression" => match node.child_by_field_name("value") {
                Some(value) => self.lower_expression(value),
                None => Ok(()),
            },
            kind if is_type_node(kind) => Ok(()),
            _ => {
                for child in named_children(node) {
                    self.lower_expression(child)?;
                }
                Ok(())
            }
        }
    }

    /// The variable an identifier or `this.name` refers to.
    ///
    /// Unresolved lower-case names are taken to be fields of the enclosing
    /// class; unresolved upper-case names are types or constants.
    fn variable_for(&self, node: Node<'_>) -> Option<Variable> {
        let node = skip_parens(node);
        match node.kind() {
            "identifier" => {
                let name = self.text(node);
                if let Some(declared) = self.scopes.resolve(name) {
                    return Some(declared.variable.clone());
                }
                name.chars()
                    .next()
                    .filter(|c| c.is_lowercase() || *c == '_')
                    .map(|_| Variable::field(name))
            }
            "field_access" => {
                let object = node.child_by_field_name("object")?;
                let field = node.child_by_field_name("field")?;
                (object.kind() == "this").then(|| Variable::field(self.text(field)))
            }
            _ => None,
        }
    }

    /// Write `variable` as the target of an assignment.
    fn write_target(&mut self, target: Node<'_>, variable: &Variable) -> Result<()> {
        if self.options.assignment_targets_are_nodes {
            let handle = self.start(target)?;
            self.write(variable)?;
            self.finish(handle)?;
        } else {
            self.write(variable)?;
        }
        self.exceptions_after_write()
    }

    fn lower_assignment(&mut self, node: Node<'_>) -> Result<()> {
        let (Some(left), Some(right)) = (
            node.child_by_field_name("left"),
            node.child_by_field_name("right"),
        ) else {
            return Ok(());
        };
        let compound = node
            .child_by_field_name("operator")
            .map_or(false, |op| op.kind() != "=");

        match self.variable_for(left) {
            Some(variable) => {
                if compound {
                    self.read(&variable)?;
                }
                self.lower_expression(right)?;
                self.write_target(left, &variable)
            }
            None => {
                self.lower_expression(left)?;
                self.lower_expression(right)
            }
        }
    }

    fn lower_update(&mut self, node: Node<'_>) -> Result<()> {
        let Some(operand) = named_children(node).into_iter().next() else {
            return Ok(());
        };
        match self.variable_for(operand) {
            Some(variable) => {
                self.read(&variable)?;
                self.write_target(operand, &variable)
            }
            None => self.lower_expression(operand),
        }
    }

    fn lower_ternary(&mut self, node: Node<'_>) -> Result<()> {
        let end = Target::end(node);
        let condition = node.child_by_field_name("condition");
        let consequence = node.child_by_field_name("consequence");
        let alternative = node.child_by_field_name("alternative");
        let then_target = consequence.map_or(end, Target::start);
        let else_target = alternative.map_or(end, Target::start);

        if let Some(condition) = condition {
            let targets = BranchTargets::new(then_target, BranchRole::Then, else_target, BranchRole::Else);
            self.with_targets(targets, |builder| builder.lower_condition(condition))?;
            self.branch_on(condition, else_target, BranchRole::Else, false)?;
        }
        if let Some(consequence) = consequence {
            self.lower_expression(consequence)?;
        }
        if let Some(alternative) = alternative {
            self.emit_goto(end, BranchRole::End, false)?;
            self.lower_expression(alternative)?;
        }
        Ok(())
    }

    /// Method and constructor calls: receiver, arguments, anonymous class
    /// captures, then the call itself.
    pub(super) fn lower_call(&mut self, node: Node<'_>) -> Result<()> {
        if let Some(object) = node.child_by_field_name("object") {
            self.lower_expression(object)?;
        }
        if let Some(arguments) = node.child_by_field_name("arguments") {
            for argument in named_children(arguments) {
                self.lower_expression(argument)?;
            }
        }
        if let Some(body) = first_child_of_kind(node, "class_body") {
            self.read_captured(body)?;
        }
        self.emit(Instruction::Simple)?;
        self.exceptions_at_call(SyntaxRef::of(node))
    }

    fn read_captured(&mut self, body: Node<'_>) -> Result<()> {
        for name in captured_names(body, self.source) {
            if let Some(declared) = self.scopes.resolve(&name) {
                let variable = declared.variable.clone();
                self.read(&variable)?;
            }
        }
        Ok(())
    }

    /// Lambdas and local or anonymous classes: only the reads of captured
    /// variables are visible from outside.
    pub(super) fn lower_nested_body(&mut self, node: Node<'_>) -> Result<()> {
        self.read_captured(node)?;
        self.emit(Instruction::Simple)?;
        Ok(())
    }

    fn lower_instanceof(&mut self, node: Node<'_>) -> Result<()> {
        if let Some(left) = node.child_by_field_name("left") {
            self.lower_expression(left)?;
        }
        match node.child_by_field_name("name") {
            Some(name) => self.bind_pattern_variable(name),
            None => match first_child_of_kind(node, "record_pattern") {
                Some(pattern) => self.declare_pattern(pattern),
                None => Ok(()),
            },
        }
    }

    fn bind_pattern_variable(&mut self, name: Node<'_>) -> Result<()> {
        let text = self.text(name);
        let variable = Variable::local(text, VariableKind::Pattern, SyntaxRef::of(name));
        self.declare(text, variable.clone(), Vec::new());
        self.write(&variable)
    }

    /// Bind every variable a (possibly nested) pattern introduces.
    pub(super) fn declare_pattern(&mut self, pattern: Node<'_>) -> Result<()> {
        let mut stack = vec![pattern];
        let mut names = Vec::new();
        while let Some(node) = stack.pop() {
            if node.kind() == "identifier" && is_declaration_name(node) {
                names.push(node);
                continue;
            }
            let mut kids = children(node);
            kids.reverse();
            stack.extend(kids);
        }
        for name in names {
            self.bind_pattern_variable(name)?;
        }
        Ok(())
    }
}
