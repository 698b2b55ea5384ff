//! Exceptions, `try`/`catch`, and `finally` blocks as shared subroutines.
//!
//! A `finally` block is lowered once. Every way of leaving the protected
//! region (normal completion, `return`, an escaping exception, a typed
//! exception bound for an outer `catch`, `break`/`continue`/`yield`) jumps to
//! its own dispatch slot. Each slot holds a `Call` into the block followed
//! by the jump that continues the interrupted transfer; the block ends with
//! one `Return` per slot.

use tracing::debug;
use tree_sitter::Node;

use super::{FlowBuilder, Target};
use crate::analysis::control_flow::instruction::{BranchRole, Instruction, Variable, VariableKind};
use crate::errors::{FlowError, Result};
use crate::syntax::{first_child_of_kind, named_children, simple_type_name, skip_parens, SyntaxRef};

#[derive(Debug, Clone)]
pub(super) struct CatchClause {
    node: SyntaxRef,
    types: Vec<String>,
}

#[derive(Debug, Clone)]
pub(super) enum HandlerFrame {
    Catch { clauses: Vec<CatchClause> },
    Finally { record: usize },
}

/// How control left the region protected by a `finally`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum FinallyExit {
    Normal,
    Return,
    Throw,
    Catch(SyntaxRef),
    Jump { target: Target, depth: usize },
}

#[derive(Debug)]
struct ExitSlot {
    exit: FinallyExit,
    jumps: Vec<usize>,
}

#[derive(Debug)]
pub(super) struct FinallyRecord {
    try_statement: SyntaxRef,
    slots: Vec<ExitSlot>,
    calls: Vec<usize>,
}

impl FinallyRecord {
    fn new(try_statement: SyntaxRef) -> Self {
        let slots = [FinallyExit::Normal, FinallyExit::Return, FinallyExit::Throw]
            .into_iter()
            .map(|exit| ExitSlot {
                exit,
                jumps: Vec::new(),
            })
            .collect();
        Self {
            try_statement,
            slots,
            calls: Vec::new(),
        }
    }

    fn slot_mut(&mut self, exit: FinallyExit) -> &mut Vec<usize> {
        let index = match self.slots.iter().position(|slot| slot.exit == exit) {
            Some(index) => index,
            None => {
                self.slots.push(ExitSlot {
                    exit,
                    jumps: Vec::new(),
                });
                self.slots.len() - 1
            }
        };
        &mut self.slots[index].jumps
    }
}

/// What a throw site may throw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Thrown {
    Unknown,
    Types(Vec<String>),
}

enum Destination {
    Catch {
        clause: SyntaxRef,
        via: Option<usize>,
    },
    Uncaught {
        via: Option<usize>,
    },
}

/// Whether a clause catching `caught` certainly catches `thrown`.
///
/// Only simple names are compared; without a type hierarchy `Exception`
/// is assumed to cover everything that is not an `...Error`.
fn covers(caught: &str, thrown: &str) -> bool {
    caught == thrown
        || caught == "Throwable"
        || (caught == "Exception" && !thrown.ends_with("Error"))
}

/// Narrow `remaining` by one clause. Returns `(possible, covers_all)`.
fn match_clause(remaining: &mut Option<Vec<String>>, clause: &CatchClause) -> (bool, bool) {
    match remaining {
        None => {
            let all = clause.types.iter().any(|t| t == "Throwable");
            (true, all)
        }
        Some(types) => {
            let before = types.len();
            types.retain(|thrown| !clause.types.iter().any(|caught| covers(caught, thrown)));
            let covered_some = types.len() < before;
            (covered_some || !types.is_empty(), types.is_empty())
        }
    }
}

fn catch_types(parameter: Node<'_>, source: &[u8]) -> Vec<String> {
    first_child_of_kind(parameter, "catch_type")
        .map(|catch_type| {
            named_children(catch_type)
                .into_iter()
                .map(|ty| simple_type_name(crate::syntax::node_text(ty, source)))
                .collect()
        })
        .unwrap_or_default()
}

impl FlowBuilder<'_> {
    fn innermost_finally(&self, min_depth: usize) -> Option<usize> {
        self.handlers
            .get(min_depth..)
            .unwrap_or_default()
            .iter()
            .rev()
            .find_map(|frame| match frame {
                HandlerFrame::Finally { record } => Some(*record),
                HandlerFrame::Catch { .. } => None,
            })
    }

    fn jump_to_slot(&mut self, record: usize, exit: FinallyExit, instruction: Instruction) -> Result<()> {
        let index = self.emit(instruction)?;
        let slots = self
            .finallies
            .get_mut(record)
            .ok_or_else(|| FlowError::invariant("unknown finally record"))?;
        slots.slot_mut(exit).push(index);
        Ok(())
    }

    /// Leave the fragment, through every enclosing `finally`.
    pub(super) fn route_return(&mut self) -> Result<()> {
        let goto = Instruction::GoTo {
            offset: 0,
            role: BranchRole::End,
            is_return: true,
        };
        match self.innermost_finally(0) {
            Some(record) => self.jump_to_slot(record, FinallyExit::Return, goto),
            None => self.emit_to(goto, Target::end(self.fragment)),
        }
    }

    /// Jump to `target`, running the `finally` blocks entered since the
    /// handler stack had height `depth`.
    pub(super) fn route_jump(&mut self, target: Target, depth: usize) -> Result<()> {
        let goto = Instruction::GoTo {
            offset: 0,
            role: BranchRole::End,
            is_return: false,
        };
        match self.innermost_finally(depth) {
            Some(record) => self.jump_to_slot(record, FinallyExit::Jump { target, depth }, goto),
            None => self.emit_to(goto, target),
        }
    }

    /// Emit the exception edges of a throw site.
    ///
    /// Every catch clause that may receive the exception gets an edge; the
    /// last edge is unconditional when `conditional` is false. Exceptions
    /// no clause fully covers leave through the innermost `finally` or the
    /// end of the fragment.
    pub(super) fn route_throw(
        &mut self,
        thrown: &Thrown,
        thrower: Option<SyntaxRef>,
        conditional: bool,
    ) -> Result<()> {
        let mut remaining = match thrown {
            Thrown::Unknown => None,
            Thrown::Types(types) => Some(types.clone()),
        };
        let mut via = None;
        let mut covered = false;
        let mut destinations = Vec::new();

        'frames: for frame in self.handlers.iter().rev() {
            match frame {
                HandlerFrame::Finally { record } => {
                    via.get_or_insert(*record);
                    if remaining.is_none() {
                        // untyped exceptions are re-dispatched from the finally's throw slot
                        break;
                    }
                }
                HandlerFrame::Catch { clauses } => {
                    for clause in clauses {
                        let (possible, all) = match_clause(&mut remaining, clause);
                        if possible {
                            destinations.push(Destination::Catch {
                                clause: clause.node,
                                via,
                            });
                        }
                        if all {
                            covered = true;
                            break 'frames;
                        }
                    }
                }
            }
        }
        if !covered {
            destinations.push(Destination::Uncaught { via });
        }

        let last = destinations.len().saturating_sub(1);
        for (index, destination) in destinations.into_iter().enumerate() {
            let instruction = if index == last && !conditional {
                Instruction::ThrowTo { offset: 0 }
            } else {
                Instruction::ConditionalThrowTo { offset: 0, thrower }
            };
            match destination {
                Destination::Catch { clause, via: None } => {
                    self.emit_to(instruction, Target::start(clause))?
                }
                Destination::Catch {
                    clause,
                    via: Some(record),
                } => self.jump_to_slot(record, FinallyExit::Catch(clause), instruction)?,
                Destination::Uncaught { via: Some(record) } => {
                    self.jump_to_slot(record, FinallyExit::Throw, instruction)?
                }
                Destination::Uncaught { via: None } => {
                    self.emit_to(instruction, Target::end(self.fragment))?
                }
            }
        }
        Ok(())
    }

    /// Unconditional transfer to `clause` from the current handler context.
    fn route_to_catch(&mut self, clause: SyntaxRef) -> Result<()> {
        let throw = Instruction::ThrowTo { offset: 0 };
        let mut route = None;
        for frame in self.handlers.iter().rev() {
            match frame {
                HandlerFrame::Finally { record } => {
                    route = Some(Some(*record));
                    break;
                }
                HandlerFrame::Catch { clauses } if clauses.iter().any(|c| c.node == clause) => {
                    route = Some(None);
                    break;
                }
                HandlerFrame::Catch { .. } => {}
            }
        }
        match route {
            Some(Some(record)) => self.jump_to_slot(record, FinallyExit::Catch(clause), throw),
            Some(None) => self.emit_to(throw, Target::start(clause)),
            None => self.emit_to(throw, Target::end(self.fragment)),
        }
    }

    /// Calls may throw anything; only worth an edge inside a `try`.
    pub(super) fn exceptions_at_call(&mut self, call: SyntaxRef) -> Result<()> {
        if self.handlers.is_empty() {
            return Ok(());
        }
        self.route_throw(&Thrown::Unknown, Some(call), true)
    }

    pub(super) fn exceptions_after_write(&mut self) -> Result<()> {
        if !self.options.model_exceptions_after_assignment || self.handlers.is_empty() {
            return Ok(());
        }
        self.route_throw(&Thrown::Unknown, None, true)
    }

    fn thrown_by(&self, value: Node<'_>) -> Thrown {
        let value = skip_parens(value);
        match value.kind() {
            "object_creation_expression" => value
                .child_by_field_name("type")
                .map(|ty| Thrown::Types(vec![simple_type_name(self.text(ty))]))
                .unwrap_or(Thrown::Unknown),
            "identifier" => self
                .scopes
                .resolve(self.text(value))
                .filter(|declared| !declared.catch_types.is_empty())
                .map(|declared| Thrown::Types(declared.catch_types.clone()))
                .unwrap_or(Thrown::Unknown),
            _ => Thrown::Unknown,
        }
    }

    pub(super) fn lower_throw(&mut self, node: Node<'_>) -> Result<()> {
        let value = named_children(node).into_iter().next();
        if let Some(value) = value {
            self.lower_expression(value)?;
        }
        let thrown = value.map_or(Thrown::Unknown, |value| self.thrown_by(value));
        self.route_throw(&thrown, Some(SyntaxRef::of(node)), false)
    }

    pub(super) fn lower_try(&mut self, node: Node<'_>) -> Result<()> {
        let try_statement = SyntaxRef::of(node);
        let exit = Target::end(try_statement);
        let catches: Vec<Node<'_>> = named_children(node)
            .into_iter()
            .filter(|child| child.kind() == "catch_clause")
            .collect();
        let finally = first_child_of_kind(node, "finally_clause");
        let depth = self.handlers.len();

        let record = finally.map(|_| {
            self.finallies.push(FinallyRecord::new(try_statement));
            self.finallies.len() - 1
        });
        if let Some(record) = record {
            self.handlers.push(HandlerFrame::Finally { record });
        }
        if !catches.is_empty() {
            let clauses = catches
                .iter()
                .map(|clause| CatchClause {
                    node: SyntaxRef::of(*clause),
                    types: first_child_of_kind(*clause, "catch_formal_parameter")
                        .map(|param| catch_types(param, self.source))
                        .unwrap_or_default(),
                })
                .collect();
            self.handlers.push(HandlerFrame::Catch { clauses });
        }

        self.scopes.push();
        let resources = node.child_by_field_name("resources");
        if let Some(resources) = resources {
            self.lower_resources(resources)?;
        }
        if let Some(body) = node.child_by_field_name("body") {
            self.lower_statement(body)?;
        }
        if resources.is_some() {
            // implicit close()
            self.route_throw(&Thrown::Unknown, Some(try_statement), true)?;
        }
        self.scopes.pop();
        if !catches.is_empty() {
            self.handlers.pop();
        }

        let leave_normally = |builder: &mut Self| -> Result<()> {
            let goto = Instruction::GoTo {
                offset: 0,
                role: BranchRole::End,
                is_return: false,
            };
            match record {
                Some(record) => builder.jump_to_slot(record, FinallyExit::Normal, goto),
                None => builder.emit_to(goto, exit),
            }
        };
        if record.is_some() || !catches.is_empty() {
            leave_normally(self)?;
        }
        for (index, clause) in catches.iter().enumerate() {
            self.lower_catch_clause(*clause)?;
            if record.is_some() || index + 1 < catches.len() {
                leave_normally(self)?;
            }
        }

        if let (Some(record), Some(finally)) = (record, finally) {
            self.handlers.pop();
            self.materialize_slots(record)?;
            self.lower_finally(finally, record)?;
        }
        if self.handlers.len() != depth {
            return Err(FlowError::invariant(format!(
                "handler stack of {try_statement} not restored"
            )));
        }
        Ok(())
    }

    fn lower_resources(&mut self, resources: Node<'_>) -> Result<()> {
        for resource in named_children(resources) {
            if resource.kind() != "resource" {
                continue;
            }
            let handle = self.start(resource)?;
            match (
                resource.child_by_field_name("name"),
                resource.child_by_field_name("value"),
            ) {
                (Some(name), Some(value)) => {
                    self.lower_expression(value)?;
                    let text = self.text(name);
                    let variable = Variable::local(text, VariableKind::Resource, handle);
                    self.declare(text, variable.clone(), Vec::new());
                    self.write(&variable)?;
                    self.exceptions_after_write()?;
                }
                _ => {
                    for reference in named_children(resource) {
                        self.lower_expression(reference)?;
                    }
                }
            }
            self.finish(handle)?;
        }
        Ok(())
    }

    fn lower_catch_clause(&mut self, clause: Node<'_>) -> Result<()> {
        let handle = self.start(clause)?;
        self.scopes.push();
        if let Some(parameter) = first_child_of_kind(clause, "catch_formal_parameter") {
            if let Some(name) = parameter.child_by_field_name("name") {
                let text = self.text(name);
                let variable =
                    Variable::local(text, VariableKind::CatchParameter, SyntaxRef::of(parameter));
                self.declare(text, variable.clone(), catch_types(parameter, self.source));
                self.write(&variable)?;
            }
        }
        if let Some(body) = clause.child_by_field_name("body") {
            self.lower_statement(body)?;
        }
        self.scopes.pop();
        self.finish(handle)
    }

    /// Emit the dispatch table: per slot, patch its jumps here, call the
    /// `finally` block, then continue the interrupted transfer from the
    /// enclosing context.
    fn materialize_slots(&mut self, record: usize) -> Result<()> {
        let (try_statement, slot_count) = match self.finallies.get(record) {
            Some(r) => (r.try_statement, r.slots.len()),
            None => return Err(FlowError::invariant("unknown finally record")),
        };
        for index in 0..slot_count {
            let here = self.buffer.size();
            let (exit, jumps) = {
                let slot = &mut self.finallies[record].slots[index];
                (slot.exit.clone(), std::mem::take(&mut slot.jumps))
            };
            for jump in jumps {
                self.buffer.set_offset(jump, here)?;
            }
            let call = self.emit(Instruction::Call {
                offset: 0,
                proc_end: 0,
            })?;
            self.finallies[record].calls.push(call);

            match exit {
                FinallyExit::Normal => self.emit_goto(Target::end(try_statement), BranchRole::End, false)?,
                FinallyExit::Return => self.route_return()?,
                FinallyExit::Throw => self.route_throw(&Thrown::Unknown, None, false)?,
                FinallyExit::Catch(clause) => self.route_to_catch(clause)?,
                FinallyExit::Jump { target, depth } => self.route_jump(target, depth)?,
            }
        }
        debug!(try_statement = %try_statement, slots = slot_count, "Materialized finally dispatch");
        Ok(())
    }

    fn lower_finally(&mut self, finally: Node<'_>, record: usize) -> Result<()> {
        let handle = self.start(finally)?;
        match first_child_of_kind(finally, "block") {
            Some(block) => self.lower_statement(block)?,
            None => {
                self.emit(Instruction::Empty)?;
            }
        }
        self.finish(handle)?;

        let (begin, end) = match self.buffer.range(&handle) {
            Some((begin, Some(end))) if begin < end => (begin, end),
            _ => {
                return Err(FlowError::invariant(format!(
                    "finally block {handle} has no instructions"
                )))
            }
        };
        let calls = std::mem::take(&mut self.finallies[record].calls);
        for &call in &calls {
            self.buffer.retrofit_call(call, begin, end)?;
        }
        for call in calls {
            self.emit(Instruction::Return {
                offset: call + 1,
                call,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::control_flow::{build_flow, Cancellation, FlowOptions, LocalVariablesPolicy};
    use crate::syntax::parse_java;

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

    fn after_write(lines: &[String], variable: &str) -> Option<String> {
        let write = format!("WRITE {variable}");
        let index = lines.iter().position(|line| *line == write)?;
        lines.get(index + 1).cloned()
    }

    fn clause(types: &[&str]) -> CatchClause {
        CatchClause {
            node: SyntaxRef {
                id: 1,
                kind: "catch_clause",
                start_byte: 0,
                end_byte: 1,
                line: 1,
            },
            types: types.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_exception_covers_non_errors() {
        assert!(covers("Exception", "IOException"));
        assert!(!covers("Exception", "StackOverflowError"));
        assert!(covers("Throwable", "StackOverflowError"));
        assert!(!covers("IOException", "SQLException"));
    }

    #[test]
    fn test_typed_throw_is_narrowed_by_clauses() {
        let mut remaining = Some(vec!["IOException".to_string()]);
        assert_eq!(
            match_clause(&mut remaining, &clause(&["SQLException"])),
            (true, false)
        );
        assert_eq!(
            match_clause(&mut remaining, &clause(&["IOException"])),
            (true, true)
        );
    }

    #[test]
    fn test_unknown_throw_is_only_covered_by_throwable() {
        let mut remaining = None;
        assert_eq!(match_clause(&mut remaining, &clause(&["Exception"])), (true, false));
        assert_eq!(match_clause(&mut remaining, &clause(&["Throwable"])), (true, true));
    }

    #[test]
    fn test_writes_inside_try_may_throw_when_enabled() {
        let body = "void m() { int x; try { x = 1; } catch (Exception e) { x = 2; } }";
        let enabled = FlowOptions::default().with_exceptions_after_assignment(true);

        let lines = render(body, enabled);
        let next = after_write(&lines, "x").unwrap();
        assert!(next.starts_with("COND_THROW_TO"), "{lines:?}");

        let lines = render(body, FlowOptions::default());
        assert!(!lines.iter().any(|line| line.starts_with("COND_THROW_TO")), "{lines:?}");
    }

    #[test]
    fn test_writes_outside_try_never_throw() {
        let enabled = FlowOptions::default().with_exceptions_after_assignment(true);
        let lines = render("void m() { int x = 1; x = 2; x++; }", enabled);
        assert!(!lines.iter().any(|line| line.contains("THROW")), "{lines:?}");
        assert_eq!(lines.iter().filter(|line| *line == "WRITE x").count(), 3);
    }

    #[test]
    fn test_slots_are_created_once_per_exit() {
        let mut record = FinallyRecord::new(clause(&[]).node);
        record.slot_mut(FinallyExit::Return).push(3);
        record.slot_mut(FinallyExit::Return).push(5);
        record.slot_mut(FinallyExit::Catch(clause(&[]).node)).push(7);
        assert_eq!(record.slots.len(), 4);
        assert_eq!(record.slots[1].jumps, vec![3, 5]);
    }
}
