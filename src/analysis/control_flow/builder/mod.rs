//! Lowering of a syntax fragment into a flat instruction list.
//!
//! The builder walks the tree once, in evaluation order. Every statement and
//! expression it visits becomes an element: the half-open range of
//! instructions emitted while the node was open. Jumps to elements that are
//! not finished yet are queued in the buffer and patched later.

mod conditions;
mod constants;
mod exceptions;
mod expressions;
mod scope;
mod statements;

use tracing::{debug, debug_span, error};
use tree_sitter::Node;

use self::conditions::BranchTargets;
use self::exceptions::{FinallyRecord, HandlerFrame};
use self::scope::{Declared, ScopeStack};
use self::statements::JumpFrame;
use super::buffer::{Boundary, FlowBuffer};
use super::cancel::Cancellation;
use super::flow::ControlFlow;
use super::instruction::{BranchRole, Instruction, Variable, VariableKind};
use super::options::FlowOptions;
use super::policy::FlowPolicy;
use crate::errors::{FlowError, Result};
use crate::syntax::{find_incomplete_code, first_child_of_kind, named_children, node_text, SyntaxRef};

/// One end of a syntax node, used as a jump destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Target {
    node: SyntaxRef,
    boundary: Boundary,
}

impl Target {
    fn start(node: impl Into<SyntaxRef>) -> Self {
        Self {
            node: node.into(),
            boundary: Boundary::Start,
        }
    }

    fn end(node: impl Into<SyntaxRef>) -> Self {
        Self {
            node: node.into(),
            boundary: Boundary::End,
        }
    }
}

/// Build the control flow of `node`.
///
/// `node` is normally a method, constructor, initializer or lambda, but any
/// statement or expression works. Fails with [`FlowError::IncompleteCode`]
/// when the fragment has parse errors and with [`FlowError::Canceled`] when
/// `cancellation` fires.
pub fn build_flow(
    node: Node<'_>,
    source: &[u8],
    policy: &dyn FlowPolicy,
    options: FlowOptions,
    cancellation: &Cancellation,
) -> Result<ControlFlow> {
    let root = SyntaxRef::of(node);
    let span = debug_span!("build_flow", fragment = %root, policy = policy.key());
    let _guard = span.enter();

    if let Some(incomplete) = find_incomplete_code(node) {
        let incomplete = SyntaxRef::of(incomplete);
        debug!(node = %incomplete, "Fragment contains incomplete code");
        return Err(FlowError::IncompleteCode { node: incomplete });
    }

    let mut builder = FlowBuilder::new(root, source, policy, options, cancellation);
    let flow = builder
        .lower_fragment(node)
        .and_then(|()| builder.into_flow())
        .inspect_err(|err| {
            if matches!(err, FlowError::Invariant { .. }) {
                error!(error = %err, "Control flow construction failed");
            }
        })?;

    debug!(
        instructions = flow.size(),
        variables = flow.variables().len(),
        folded = flow.constant_condition_occurred(),
        "Built control flow"
    );
    Ok(flow)
}

pub(crate) struct FlowBuilder<'a> {
    fragment: SyntaxRef,
    source: &'a [u8],
    policy: &'a dyn FlowPolicy,
    options: FlowOptions,
    cancellation: &'a Cancellation,
    buffer: FlowBuffer,
    targets: Vec<BranchTargets>,
    jumps: Vec<JumpFrame>,
    handlers: Vec<HandlerFrame>,
    finallies: Vec<FinallyRecord>,
    scopes: ScopeStack,
    nested_blocks: Vec<SyntaxRef>,
    pending_labels: Vec<String>,
}

impl<'a> FlowBuilder<'a> {
    fn new(
        fragment: SyntaxRef,
        source: &'a [u8],
        policy: &'a dyn FlowPolicy,
        options: FlowOptions,
        cancellation: &'a Cancellation,
    ) -> Self {
        Self {
            fragment,
            source,
            policy,
            options,
            cancellation,
            buffer: FlowBuffer::new(),
            targets: Vec::new(),
            jumps: Vec::new(),
            handlers: Vec::new(),
            finallies: Vec::new(),
            scopes: ScopeStack::default(),
            nested_blocks: Vec::new(),
            pending_labels: Vec::new(),
        }
    }

    fn lower_fragment(&mut self, node: Node<'_>) -> Result<()> {
        let root = self.start(node)?;
        self.scopes.push();
        self.targets.push(BranchTargets::uniform(Target::end(root)));

        match node.kind() {
            "method_declaration" | "constructor_declaration" | "compact_constructor_declaration" => {
                if let Some(parameters) = node.child_by_field_name("parameters") {
                    self.declare_parameters(parameters);
                }
                if let Some(body) = node.child_by_field_name("body") {
                    self.lower_statement(body)?;
                }
            }
            "lambda_expression" => {
                if let Some(parameters) = node.child_by_field_name("parameters") {
                    self.declare_parameters(parameters);
                }
                if let Some(body) = node.child_by_field_name("body") {
                    if body.kind() == "block" {
                        self.lower_statement(body)?;
                    } else {
                        self.lower_expression(body)?;
                    }
                }
            }
            "static_initializer" => {
                if let Some(block) = first_child_of_kind(node, "block") {
                    self.lower_statement(block)?;
                }
            }
            kind if statements::is_statement(kind) => {
                let before = self.buffer.size();
                self.lower_statement_kind(node)?;
                if self.buffer.size() == before {
                    self.emit(Instruction::Empty)?;
                }
            }
            _ => self.lower_expression_kind(node)?,
        }

        self.targets.pop();
        self.scopes.pop();
        self.finish(root)
    }

    fn into_flow(&mut self) -> Result<ControlFlow> {
        if !self.jumps.is_empty() || !self.handlers.is_empty() || !self.targets.is_empty() {
            return Err(FlowError::invariant(
                "jump, handler or branch stack not empty after lowering",
            ));
        }
        let end = self.buffer.size();
        self.buffer.resolve_pending(end);
        let buffer = std::mem::take(&mut self.buffer);
        buffer.freeze(self.fragment, std::mem::take(&mut self.nested_blocks))
    }

    fn text(&self, node: Node<'_>) -> &'a str {
        node_text(node, self.source)
    }

    fn start(&mut self, node: Node<'_>) -> Result<SyntaxRef> {
        let handle = SyntaxRef::of(node);
        self.cancellation.check(handle)?;
        self.buffer.start_element(handle)?;
        Ok(handle)
    }

    fn finish(&mut self, handle: SyntaxRef) -> Result<()> {
        self.buffer.finish_element(handle)
    }

    fn emit(&mut self, instruction: Instruction) -> Result<usize> {
        self.buffer.append(instruction)
    }

    fn emit_to(&mut self, instruction: Instruction, target: Target) -> Result<()> {
        self.emit(instruction)?;
        self.buffer.add_offset_later(target.node, target.boundary)
    }

    fn emit_goto(&mut self, target: Target, role: BranchRole, is_return: bool) -> Result<()> {
        self.emit_to(
            Instruction::GoTo {
                offset: 0,
                role,
                is_return,
            },
            target,
        )
    }

    fn emit_conditional(
        &mut self,
        target: Target,
        role: BranchRole,
        when: bool,
        condition: Option<SyntaxRef>,
    ) -> Result<()> {
        self.emit_to(
            Instruction::ConditionalGoTo {
                offset: 0,
                role,
                when,
                condition,
            },
            target,
        )
    }

    fn is_tracked(&self, variable: &Variable) -> bool {
        if variable.kind == VariableKind::Parameter {
            self.policy.is_parameter_tracked(variable)
        } else {
            self.policy.is_variable_tracked(variable)
        }
    }

    fn read(&mut self, variable: &Variable) -> Result<()> {
        if self.is_tracked(variable) {
            let id = self.buffer.intern(variable.clone());
            self.emit(Instruction::ReadVariable { variable: id })?;
        }
        Ok(())
    }

    fn write(&mut self, variable: &Variable) -> Result<()> {
        if self.is_tracked(variable) {
            let id = self.buffer.intern(variable.clone());
            self.emit(Instruction::WriteVariable { variable: id })?;
        }
        Ok(())
    }

    fn declare(&mut self, name: &str, variable: Variable, catch_types: Vec<String>) {
        self.scopes.declare(
            name,
            Declared {
                variable,
                catch_types,
                constant: None,
            },
        );
    }

    fn declare_parameters(&mut self, parameters: Node<'_>) {
        let names: Vec<(Node<'_>, Node<'_>)> = match parameters.kind() {
            "identifier" => vec![(parameters, parameters)],
            _ => named_children(parameters)
                .into_iter()
                .filter_map(|param| match param.kind() {
                    "identifier" => Some((param, param)),
                    "formal_parameter" => param.child_by_field_name("name").map(|n| (param, n)),
                    "spread_parameter" => first_child_of_kind(param, "variable_declarator")
                        .and_then(|d| d.child_by_field_name("name"))
                        .map(|n| (param, n)),
                    _ => None,
                })
                .collect(),
        };
        for (declaration, name) in names {
            let name = self.text(name);
            let variable =
                Variable::local(name, VariableKind::Parameter, SyntaxRef::of(declaration));
            self.declare(name, variable, Vec::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::control_flow::policy::{LocalVariablesPolicy, LocalsAndFieldsPolicy};
    use crate::syntax::{parse_java, JavaSource};
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn method_source(body: &str) -> JavaSource {
        parse_java(&format!("class T {{\n{body}\n}}")).unwrap()
    }

    fn listing(source: &JavaSource, name: &str, options: FlowOptions) -> Vec<String> {
        let method = source.procedure(name).unwrap();
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
    fn test_straight_line_code() {
        let source = method_source("void m(int a) { int b = a; b = b + 1; }");
        assert_eq!(
            listing(&source, "m", FlowOptions::default()),
            vec!["READ a", "WRITE b", "READ b", "WRITE b"]
        );
    }

    #[test]
    fn test_if_else_layout() {
        let source = method_source("void m(boolean c) { if (c) { a(); } else { b(); } }");
        assert_eq!(
            listing(&source, "m", FlowOptions::default()),
            vec![
                "READ c",
                "COND_GOTO [ELSE] false 4",
                "SIMPLE",
                "GOTO [END] 5",
                "SIMPLE",
            ]
        );
    }

    #[test]
    fn test_while_loop_jumps_back_to_condition() {
        let source = method_source("void m(boolean c) { while (c) { step(); } }");
        assert_eq!(
            listing(&source, "m", FlowOptions::default()),
            vec!["READ c", "COND_GOTO [END] false 4", "SIMPLE", "GOTO [END] 0"]
        );
    }

    #[test]
    fn test_return_jumps_to_exit() {
        let source = method_source("int m(int a) { return a; }");
        assert_eq!(
            listing(&source, "m", FlowOptions::default()),
            vec!["READ a", "GOTO [END] 2 RETURN"]
        );
    }

    #[test]
    fn test_empty_statement_gets_an_instruction() {
        let source = method_source("void m() { {} }");
        assert_eq!(listing(&source, "m", FlowOptions::default()), vec!["EMPTY"]);
    }

    #[test]
    fn test_fields_follow_policy() {
        let source = method_source(indoc! {"
            int count;
            void m() { this.count = count + 1; }
        "});
        let method = source.procedure("m").unwrap();
        let locals = build_flow(
            method.node,
            source.bytes(),
            &LocalVariablesPolicy,
            FlowOptions::default(),
            &Cancellation::new(),
        )
        .unwrap();
        let fields = build_flow(
            method.node,
            source.bytes(),
            &LocalsAndFieldsPolicy,
            FlowOptions::default(),
            &Cancellation::new(),
        )
        .unwrap();
        assert_eq!(locals.size(), 1);
        assert_eq!(
            (0..fields.size()).map(|i| fields.render(i)).collect::<Vec<_>>(),
            vec!["READ count", "WRITE count"]
        );
    }

    #[test]
    fn test_incomplete_code_is_rejected() {
        let source = method_source("void m() { if (x { ) ) foo(; }");
        let method = source.root();
        let err = build_flow(
            method,
            source.bytes(),
            &LocalVariablesPolicy,
            FlowOptions::default(),
            &Cancellation::new(),
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::IncompleteCode { .. }));
    }

    #[test]
    fn test_canceled_build_returns_canceled() {
        let source = method_source("void m() { a(); b(); }");
        let method = source.procedure("m").unwrap();
        let token = Cancellation::new();
        token.cancel();
        let err = build_flow(
            method.node,
            source.bytes(),
            &LocalVariablesPolicy,
            FlowOptions::default(),
            &token,
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::Canceled { .. }));
    }
}
