//! Statements: blocks, branches, loops, switches and jumps.

use std::collections::HashMap;

use tracing::debug;
use tree_sitter::Node;

use super::conditions::BranchTargets;
use super::constants::{evaluate, final_constant_type};
use super::scope::Declared;
use super::{FlowBuilder, Target};
use crate::analysis::control_flow::instruction::{BranchRole, Instruction, Variable, VariableKind};
use crate::errors::Result;
use crate::syntax::{children, children_by_field, named_children, skip_parens, SyntaxRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum JumpKind {
    Loop,
    Switch,
    SwitchExpression,
    Labeled,
}

/// A statement that `break`, `continue` or `yield` can leave.
#[derive(Debug, Clone)]
pub(super) struct JumpFrame {
    pub(super) kind: JumpKind,
    pub(super) labels: Vec<String>,
    pub(super) break_target: Target,
    pub(super) continue_target: Option<Target>,
    /// Handler stack height when the statement was entered.
    pub(super) handler_depth: usize,
}

pub(super) fn is_statement(kind: &str) -> bool {
    matches!(
        kind,
        "block"
            | "constructor_body"
            | "expression_statement"
            | "local_variable_declaration"
            | "if_statement"
            | "while_statement"
            | "do_statement"
            | "for_statement"
            | "enhanced_for_statement"
            | "labeled_statement"
            | "break_statement"
            | "continue_statement"
            | "yield_statement"
            | "return_statement"
            | "throw_statement"
            | "try_statement"
            | "try_with_resources_statement"
            | "switch_statement"
            | "synchronized_statement"
            | "assert_statement"
            | "explicit_constructor_invocation"
            | "class_declaration"
            | "record_declaration"
            | "enum_declaration"
            | "interface_declaration"
    )
}

fn is_default_label(label: Node<'_>) -> bool {
    children(label).iter().any(|child| child.kind() == "default")
}

impl FlowBuilder<'_> {
    /// Lower a statement as its own element. A statement that produces no
    /// instruction gets an `Empty` one so it can be jumped to.
    pub(super) fn lower_statement(&mut self, node: Node<'_>) -> Result<()> {
        let handle = self.start(node)?;
        let before = self.buffer.size();
        self.lower_statement_kind(node)?;
        if self.buffer.size() == before {
            self.emit(Instruction::Empty)?;
        }
        self.finish(handle)
    }

    pub(super) fn lower_statement_kind(&mut self, node: Node<'_>) -> Result<()> {
        let labels = std::mem::take(&mut self.pending_labels);
        match node.kind() {
            "block" | "constructor_body" => self.lower_block(node),
            "expression_statement" => {
                for child in named_children(node) {
                    self.lower_expression(child)?;
                }
                Ok(())
            }
            "local_variable_declaration" => self.lower_local_declaration(node),
            "if_statement" => self.lower_if(node),
            "while_statement" => self.lower_while(node, labels),
            "do_statement" => self.lower_do(node, labels),
            "for_statement" => self.lower_for(node, labels),
            "enhanced_for_statement" => self.lower_enhanced_for(node, labels),
            "labeled_statement" => self.lower_labeled(node, labels),
            "break_statement" => self.lower_break(node),
            "continue_statement" => self.lower_continue(node),
            "yield_statement" => self.lower_yield(node),
            "return_statement" => self.lower_return(node),
            "throw_statement" => self.lower_throw(node),
            "try_statement" | "try_with_resources_statement" => self.lower_try(node),
            "switch_expression" | "switch_statement" => self.lower_switch(node, false, labels),
            "synchronized_statement" => self.lower_synchronized(node),
            "assert_statement" => self.lower_assert(node),
            "explicit_constructor_invocation" => self.lower_call(node),
            "class_declaration" | "record_declaration" | "enum_declaration"
            | "interface_declaration" => self.lower_nested_body(node),
            _ => self.lower_expression_kind(node),
        }
    }

    fn lower_block(&mut self, node: Node<'_>) -> Result<()> {
        let handle = SyntaxRef::of(node);
        if handle != self.fragment && handle.kind == "block" {
            self.nested_blocks.push(handle);
        }
        self.scopes.push();
        for child in named_children(node) {
            self.lower_statement(child)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn lower_local_declaration(&mut self, node: Node<'_>) -> Result<()> {
        let constant_type = final_constant_type(node, self.source);
        for declarator in children_by_field(node, "declarator") {
            let Some(name) = declarator.child_by_field_name("name") else {
                continue;
            };
            let value = declarator.child_by_field_name("value");
            if let Some(value) = value {
                self.lower_expression(value)?;
            }
            let name = self.text(name);
            let variable = Variable::local(name, VariableKind::Local, SyntaxRef::of(declarator));
            let constant = match (constant_type, value) {
                (Some(ty), Some(value)) => {
                    let scopes = &self.scopes;
                    let lookup =
                        |name: &str| scopes.resolve(name).and_then(|declared| declared.constant.clone());
                    evaluate(value, self.source, &lookup).and_then(|constant| constant.coerce(ty))
                }
                _ => None,
            };
            self.scopes.declare(
                name,
                Declared {
                    variable: variable.clone(),
                    catch_types: Vec::new(),
                    constant,
                },
            );
            if value.is_some() {
                self.write(&variable)?;
                self.exceptions_after_write()?;
            }
        }
        Ok(())
    }

    fn push_jump_frame(
        &mut self,
        kind: JumpKind,
        labels: Vec<String>,
        break_target: Target,
        continue_target: Option<Target>,
    ) {
        self.jumps.push(JumpFrame {
            kind,
            labels,
            break_target,
            continue_target,
            handler_depth: self.handlers.len(),
        });
    }

    fn lower_if(&mut self, node: Node<'_>) -> Result<()> {
        let end = Target::end(node);
        let consequence = node.child_by_field_name("consequence");
        let alternative = node.child_by_field_name("alternative");
        let (then_target, then_role) = match consequence {
            Some(then) => (Target::start(then), BranchRole::Then),
            None => (end, BranchRole::End),
        };
        let (else_target, else_role) = match alternative {
            Some(alternative) => (Target::start(alternative), BranchRole::Else),
            None => (end, BranchRole::End),
        };

        if let Some(condition) = node.child_by_field_name("condition") {
            let targets = BranchTargets::new(then_target, then_role, else_target, else_role);
            self.with_targets(targets, |builder| builder.lower_condition(condition))?;
            self.branch_on(condition, else_target, else_role, false)?;
        }
        if let Some(then) = consequence {
            self.lower_statement(then)?;
        }
        if let Some(alternative) = alternative {
            self.emit_goto(end, BranchRole::End, false)?;
            self.lower_statement(alternative)?;
        }
        Ok(())
    }

    fn lower_while(&mut self, node: Node<'_>, labels: Vec<String>) -> Result<()> {
        let exit = Target::end(node);
        let condition = node.child_by_field_name("condition");
        let body = node.child_by_field_name("body");
        let head = condition.map_or(Target::start(node), Target::start);

        if let Some(condition) = condition {
            let body_target = body.map_or(exit, Target::start);
            let targets = BranchTargets::new(body_target, BranchRole::Then, exit, BranchRole::End);
            self.with_targets(targets, |builder| builder.lower_condition(condition))?;
            self.branch_on(condition, exit, BranchRole::End, false)?;
        }
        self.push_jump_frame(JumpKind::Loop, labels, exit, Some(head));
        if let Some(body) = body {
            self.lower_statement(body)?;
        }
        self.jumps.pop();
        self.emit_goto(head, BranchRole::End, false)
    }

    fn lower_do(&mut self, node: Node<'_>, labels: Vec<String>) -> Result<()> {
        let exit = Target::end(node);
        let condition = node.child_by_field_name("condition");
        let body = node.child_by_field_name("body");
        let body_start = body.map_or(Target::start(node), Target::start);
        let head = condition.map_or(body_start, Target::start);

        self.push_jump_frame(JumpKind::Loop, labels, exit, Some(head));
        if let Some(body) = body {
            self.lower_statement(body)?;
        }
        self.jumps.pop();

        if let Some(condition) = condition {
            let targets = BranchTargets::new(body_start, BranchRole::Then, exit, BranchRole::End);
            self.with_targets(targets, |builder| builder.lower_condition(condition))?;
            self.branch_on(condition, body_start, BranchRole::Then, true)?;
        }
        Ok(())
    }

    fn lower_for(&mut self, node: Node<'_>, labels: Vec<String>) -> Result<()> {
        let exit = Target::end(node);
        let condition = node.child_by_field_name("condition");
        let updates = children_by_field(node, "update");
        let body = node.child_by_field_name("body");

        self.scopes.push();
        for init in children_by_field(node, "init") {
            if init.kind() == "local_variable_declaration" {
                self.lower_statement(init)?;
            } else {
                self.lower_expression(init)?;
            }
        }

        let body_start = body.map_or(Target::start(node), Target::start);
        let head = condition.map_or(body_start, Target::start);
        let next_iteration = updates.first().copied().map_or(head, Target::start);

        if let Some(condition) = condition {
            let targets = BranchTargets::new(body_start, BranchRole::Then, exit, BranchRole::End);
            self.with_targets(targets, |builder| builder.lower_condition(condition))?;
            self.branch_on(condition, exit, BranchRole::End, false)?;
        }
        self.push_jump_frame(JumpKind::Loop, labels, exit, Some(next_iteration));
        if let Some(body) = body {
            self.lower_statement(body)?;
        }
        self.jumps.pop();
        for update in updates {
            self.lower_expression(update)?;
        }
        self.emit_goto(head, BranchRole::End, false)?;
        self.scopes.pop();
        Ok(())
    }

    /// `for (T x : items)`: the loop variable node doubles as the loop head,
    /// holding the exit test and the write of `x`.
    fn lower_enhanced_for(&mut self, node: Node<'_>, labels: Vec<String>) -> Result<()> {
        let exit = Target::end(node);
        let iterable = node.child_by_field_name("value");
        if let Some(iterable) = iterable {
            self.lower_expression(iterable)?;
        }

        self.scopes.push();
        let head = match node.child_by_field_name("name") {
            Some(name) => {
                let handle = self.start(name)?;
                self.emit_conditional(exit, BranchRole::End, false, iterable.map(SyntaxRef::of))?;
                let text = self.text(name);
                let variable = Variable::local(text, VariableKind::Local, handle);
                self.declare(text, variable.clone(), Vec::new());
                self.write(&variable)?;
                self.finish(handle)?;
                Target::start(handle)
            }
            None => Target::start(node),
        };

        self.push_jump_frame(JumpKind::Loop, labels, exit, Some(head));
        if let Some(body) = node.child_by_field_name("body") {
            self.lower_statement(body)?;
        }
        self.jumps.pop();
        self.emit_goto(head, BranchRole::End, false)?;
        self.scopes.pop();
        Ok(())
    }

    fn lower_labeled(&mut self, node: Node<'_>, mut labels: Vec<String>) -> Result<()> {
        let parts = named_children(node);
        let label = parts.iter().find(|part| part.kind() == "identifier");
        let body = parts.iter().find(|part| part.kind() != "identifier");
        let Some(body) = body.copied() else {
            return Ok(());
        };
        let own = label.map(|label| self.text(*label).to_string());

        self.push_jump_frame(
            JumpKind::Labeled,
            own.iter().cloned().collect(),
            Target::end(node),
            None,
        );
        labels.extend(own);
        self.pending_labels = labels;
        let result = self.lower_statement(body);
        self.pending_labels.clear();
        self.jumps.pop();
        result
    }

    fn jump_label(&self, node: Node<'_>) -> Option<&str> {
        named_children(node)
            .into_iter()
            .find(|child| child.kind() == "identifier")
            .map(|label| self.text(label))
    }

    fn lower_break(&mut self, node: Node<'_>) -> Result<()> {
        let label = self.jump_label(node);
        let frame = self.jumps.iter().rev().find(|frame| match label {
            Some(label) => frame.labels.iter().any(|l| l == label),
            None => matches!(frame.kind, JumpKind::Loop | JumpKind::Switch),
        });
        match frame {
            Some(frame) => {
                let (target, depth) = (frame.break_target, frame.handler_depth);
                self.route_jump(target, depth)
            }
            None => {
                debug!(statement = %SyntaxRef::of(node), "break without target, leaving fragment");
                self.emit_goto(Target::end(self.fragment), BranchRole::End, false)
            }
        }
    }

    fn lower_continue(&mut self, node: Node<'_>) -> Result<()> {
        let label = self.jump_label(node);
        let frame = self.jumps.iter().rev().find(|frame| {
            frame.kind == JumpKind::Loop
                && label.map_or(true, |label| frame.labels.iter().any(|l| l == label))
        });
        match frame.and_then(|frame| frame.continue_target.map(|t| (t, frame.handler_depth))) {
            Some((target, depth)) => self.route_jump(target, depth),
            None => {
                debug!(statement = %SyntaxRef::of(node), "continue without loop, leaving fragment");
                self.emit_goto(Target::end(self.fragment), BranchRole::End, false)
            }
        }
    }

    fn lower_yield(&mut self, node: Node<'_>) -> Result<()> {
        for value in named_children(node) {
            self.lower_expression(value)?;
        }
        let frame = self
            .jumps
            .iter()
            .rev()
            .find(|frame| frame.kind == JumpKind::SwitchExpression)
            .map(|frame| (frame.break_target, frame.handler_depth));
        match frame {
            Some((target, depth)) => self.route_jump(target, depth),
            None => self.emit_goto(Target::end(self.fragment), BranchRole::End, false),
        }
    }

    fn lower_return(&mut self, node: Node<'_>) -> Result<()> {
        for value in named_children(node) {
            self.lower_expression(value)?;
        }
        self.route_return()
    }

    /// Selector, then a dispatch table of conditional jumps to each label,
    /// then the groups in source order. Statement groups fall through, rules
    /// jump to the end.
    pub(super) fn lower_switch(
        &mut self,
        node: Node<'_>,
        is_expression: bool,
        labels: Vec<String>,
    ) -> Result<()> {
        let exit = Target::end(node);
        if let Some(selector) = node.child_by_field_name("condition") {
            self.lower_expression(selector)?;
        }
        let Some(body) = node.child_by_field_name("body") else {
            return Ok(());
        };
        let groups: Vec<Node<'_>> = named_children(body)
            .into_iter()
            .filter(|group| matches!(group.kind(), "switch_block_statement_group" | "switch_rule"))
            .collect();

        let mut default = None;
        let mut dispatch = HashMap::new();
        for group in &groups {
            for label in named_children(*group) {
                if label.kind() != "switch_label" {
                    continue;
                }
                if is_default_label(label) {
                    default.get_or_insert(label);
                } else {
                    dispatch.insert(SyntaxRef::of(label), self.buffer.size());
                    self.emit_conditional(
                        Target::start(label),
                        BranchRole::Then,
                        true,
                        Some(SyntaxRef::of(label)),
                    )?;
                }
            }
        }
        match default {
            Some(label) => self.emit_goto(Target::start(label), BranchRole::Else, false)?,
            None => self.emit_goto(exit, BranchRole::End, false)?,
        }

        let kind = if is_expression {
            JumpKind::SwitchExpression
        } else {
            JumpKind::Switch
        };
        self.push_jump_frame(kind, labels, exit, None);
        self.scopes.push();
        for group in groups {
            let handle = self.start(group)?;
            for child in named_children(group) {
                if child.kind() == "switch_label" {
                    let resume = dispatch.get(&SyntaxRef::of(child)).map(|entry| entry + 1);
                    self.lower_switch_label(child, resume)?;
                } else {
                    self.lower_statement(child)?;
                }
            }
            if group.kind() == "switch_rule" {
                self.emit_goto(exit, BranchRole::End, false)?;
            }
            self.finish(handle)?;
        }
        self.scopes.pop();
        self.jumps.pop();
        Ok(())
    }

    /// A failed `when` guard resumes the dispatch table at `resume`, the
    /// entry after this label's own.
    fn lower_switch_label(&mut self, label: Node<'_>, resume: Option<usize>) -> Result<()> {
        let handle = self.start(label)?;
        for part in named_children(label) {
            match part.kind() {
                "pattern" | "type_pattern" | "record_pattern" => self.declare_pattern(part)?,
                "guard" => {
                    for condition in named_children(part) {
                        self.lower_expression(condition)?;
                        if let Some(resume) = resume {
                            self.resume_on_failed_guard(condition, resume)?;
                        }
                    }
                }
                _ => {}
            }
        }
        self.finish(handle)
    }

    fn resume_on_failed_guard(&mut self, guard: Node<'_>, resume: usize) -> Result<()> {
        match self.folded(guard) {
            Some(true) => {}
            Some(false) => {
                self.emit(Instruction::GoTo {
                    offset: resume,
                    role: BranchRole::Else,
                    is_return: false,
                })?;
            }
            None => {
                self.emit(Instruction::ConditionalGoTo {
                    offset: resume,
                    role: BranchRole::Else,
                    when: false,
                    condition: Some(SyntaxRef::of(skip_parens(guard))),
                })?;
            }
        }
        Ok(())
    }

    fn lower_synchronized(&mut self, node: Node<'_>) -> Result<()> {
        for part in named_children(node) {
            if part.kind() == "block" {
                self.lower_statement(part)?;
            } else {
                self.lower_expression(part)?;
            }
        }
        Ok(())
    }

    /// `assert c : detail;` continues when `c` holds, otherwise evaluates the
    /// detail and throws.
    fn lower_assert(&mut self, node: Node<'_>) -> Result<()> {
        let parts = named_children(node);
        let Some(condition) = parts.first().copied() else {
            return Ok(());
        };
        let exit = Target::end(node);
        let failure = Target::end(condition);
        let targets = BranchTargets::new(exit, BranchRole::End, failure, BranchRole::Else);
        self.with_targets(targets, |builder| builder.lower_condition(condition))?;
        self.branch_on(condition, exit, BranchRole::End, true)?;
        if let Some(detail) = parts.get(1).copied() {
            self.lower_expression(detail)?;
        }
        self.route_throw(
            &super::exceptions::Thrown::Types(vec!["AssertionError".to_string()]),
            Some(SyntaxRef::of(node)),
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::analysis::control_flow::{
        build_flow, Cancellation, FlowOptions, LocalVariablesPolicy,
    };
    use crate::syntax::parse_java;
    use pretty_assertions::assert_eq;

    fn render(body: &str, options: FlowOptions) -> Vec<String> {
        let source = parse_java(&format!("class T {{ {body} }}")).unwrap();
        let method = source.procedure("m").unwrap();
        let flow = build_flow(
            method.node,
            source.bytes(),
            &LocalVariablesPolicy,
            options,
            &Cancellation::new(),
        )
        .unwrap();
        (0..flow.size()).map(|i| flow.render(i)).collect()
    }

    #[test]
    fn test_do_while_jumps_back_when_true() {
        assert_eq!(
            render("void m(boolean c) { do { step(); } while (c); }", FlowOptions::default()),
            vec!["SIMPLE", "READ c", "COND_GOTO [THEN] true 0"]
        );
    }

    #[test]
    fn test_for_loop_continue_goes_to_update() {
        assert_eq!(
            render(
                "void m() { for (int i = 0; i < 3; i++) { if (skip()) continue; work(); } }",
                FlowOptions::default()
            ),
            vec![
                "WRITE i",
                "READ i",
                "COND_GOTO [END] false 10",
                "SIMPLE",
                "COND_GOTO [END] false 6",
                "GOTO [END] 7",
                "SIMPLE",
                "READ i",
                "WRITE i",
                "GOTO [END] 1",
            ]
        );
    }

    #[test]
    fn test_labeled_break_leaves_outer_loop() {
        let lines = render(
            "void m(boolean a, boolean b) { outer: while (a) { while (b) { break outer; } } done(); }",
            FlowOptions::default(),
        );
        assert_eq!(
            lines,
            vec![
                "READ a",
                "COND_GOTO [END] false 7",
                "READ b",
                "COND_GOTO [END] false 6",
                "GOTO [END] 7",
                "GOTO [END] 2",
                "GOTO [END] 0",
                "SIMPLE",
            ]
        );
    }

    #[test]
    fn test_while_true_without_break_never_exits_normally() {
        assert_eq!(
            render("void m() { while (true) { spin(); } }", FlowOptions::default()),
            vec!["SIMPLE", "GOTO [END] 0"]
        );
        assert_eq!(
            render(
                "void m() { while (true) { spin(); } }",
                FlowOptions::default().with_folding(false)
            ),
            vec!["COND_GOTO [END] false 3", "SIMPLE", "GOTO [END] 0"]
        );
    }

    #[test]
    fn test_switch_dispatch_and_fall_through() {
        let lines = render(
            "void m(int k) { switch (k) { case 1: one(); case 2: two(); break; default: other(); } }",
            FlowOptions::default(),
        );
        assert_eq!(
            lines,
            vec![
                "READ k",
                "COND_GOTO [THEN] true 4",
                "COND_GOTO [THEN] true 5",
                "GOTO [ELSE] 7",
                "SIMPLE",
                "SIMPLE",
                "GOTO [END] 8",
                "SIMPLE",
            ]
        );
    }

    #[test]
    fn test_switch_rules_do_not_fall_through() {
        let lines = render(
            "void m(int k) { switch (k) { case 1 -> one(); default -> other(); } }",
            FlowOptions::default(),
        );
        assert_eq!(
            lines,
            vec![
                "READ k",
                "COND_GOTO [THEN] true 3",
                "GOTO [ELSE] 5",
                "SIMPLE",
                "GOTO [END] 7",
                "SIMPLE",
                "GOTO [END] 7",
            ]
        );
    }

    #[test]
    fn test_failed_guard_moves_on_to_the_next_label() {
        let lines = render(
            "void m(Object o) { switch (o) { case String s when s.isEmpty() -> a(); default -> b(); } }",
            FlowOptions::default(),
        );
        // READ o, then the dispatch entry for the guarded label at 1
        assert_eq!(lines[1], "COND_GOTO [THEN] true 3");
        assert!(lines[2].starts_with("GOTO [ELSE]"));
        let guard = lines
            .iter()
            .position(|line| line == "COND_GOTO [ELSE] false 2")
            .unwrap();
        assert!(guard > 3);
    }

    #[test]
    fn test_constant_false_guard_always_moves_on() {
        let lines = render(
            "void m(Object o) { switch (o) { case String s when 1 > 2 -> a(); default -> b(); } }",
            FlowOptions::default(),
        );
        assert!(lines.iter().any(|line| line == "GOTO [ELSE] 2"), "{lines:?}");
        assert!(!lines.iter().any(|line| line.starts_with("COND_GOTO [ELSE]")), "{lines:?}");
    }

    #[test]
    fn test_enhanced_for_writes_loop_variable_at_head() {
        assert_eq!(
            render(
                "void m(java.util.List<String> xs) { for (String x : xs) { use(x); } }",
                FlowOptions::default()
            ),
            vec![
                "READ xs",
                "COND_GOTO [END] false 6",
                "WRITE x",
                "READ x",
                "SIMPLE",
                "GOTO [END] 1",
            ]
        );
    }
}
