//! Immutable, shareable control flows and their sub-range views.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};
use tree_sitter::Node;

use super::instruction::{Instruction, Variable, VariableId};
use crate::syntax::SyntaxRef;

/// `[start, end)` of a syntax node within a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementRange {
    pub node: SyntaxRef,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug)]
pub(crate) struct FlowData {
    pub(crate) root: SyntaxRef,
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) owners: Vec<SyntaxRef>,
    pub(crate) ranges: HashMap<usize, ElementRange>,
    pub(crate) variables: Vec<Variable>,
    pub(crate) sub_ranges: Vec<ElementRange>,
    pub(crate) constant_condition_occurred: bool,
}

/// Edge labels of the exported graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Next,
    Jump,
    Conditional,
    Exception,
    Call,
    Return,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Next => "",
            Self::Jump => "goto",
            Self::Conditional => "cond",
            Self::Exception => "throw",
            Self::Call => "call",
            Self::Return => "ret",
        };
        f.write_str(label)
    }
}

/// A built control flow, or a window into one.
///
/// Cloning is cheap: the instructions are shared. A sub-range view covers
/// the instructions of one nested block; every offset pointing outside of
/// the window reads as the window's end.
#[derive(Debug, Clone)]
pub struct ControlFlow {
    data: Arc<FlowData>,
    start: usize,
    end: usize,
    root: SyntaxRef,
}

impl ControlFlow {
    pub(crate) fn new(data: Arc<FlowData>, start: usize, end: usize, root: SyntaxRef) -> Self {
        Self {
            data,
            start,
            end,
            root,
        }
    }

    /// The node this flow was built for, or the block of a sub-range.
    pub fn root(&self) -> SyntaxRef {
        self.root
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_sub_range(&self) -> bool {
        self.root != self.data.root
    }

    /// The flow this view was cut from (itself, for a full flow).
    pub fn full_flow(&self) -> ControlFlow {
        ControlFlow::new(
            Arc::clone(&self.data),
            0,
            self.data.instructions.len(),
            self.data.root,
        )
    }

    fn to_local(&self, offset: usize) -> usize {
        if (self.start..=self.end).contains(&offset) {
            offset - self.start
        } else {
            self.size()
        }
    }

    pub fn instruction(&self, index: usize) -> Option<Instruction> {
        if index >= self.size() {
            return None;
        }
        let raw = self.data.instructions[self.start + index];
        Some(raw.remap(|offset| self.to_local(offset)))
    }

    pub fn instructions(&self) -> impl ExactSizeIterator<Item = Instruction> + '_ {
        self.data.instructions[self.start..self.end]
            .iter()
            .map(move |raw| raw.remap(|offset| self.to_local(offset)))
    }

    /// The innermost element that was open when instruction `index` was emitted.
    pub fn owner_of(&self, index: usize) -> Option<SyntaxRef> {
        if index >= self.size() {
            return None;
        }
        self.data.owners.get(self.start + index).copied()
    }

    pub fn range_of(&self, node: Node<'_>) -> Option<(usize, usize)> {
        self.range_of_ref(&SyntaxRef::of(node))
    }

    pub fn range_of_ref(&self, node: &SyntaxRef) -> Option<(usize, usize)> {
        let range = self.data.ranges.get(&node.id)?;
        if range.node != *node || range.start < self.start || range.end > self.end {
            return None;
        }
        Some((range.start - self.start, range.end - self.start))
    }

    pub fn start_offset(&self, node: Node<'_>) -> Option<usize> {
        self.range_of(node).map(|(start, _)| start)
    }

    pub fn end_offset(&self, node: Node<'_>) -> Option<usize> {
        self.range_of(node).map(|(_, end)| end)
    }

    /// Whether folding replaced at least one constant condition.
    pub fn constant_condition_occurred(&self) -> bool {
        self.data.constant_condition_occurred
    }

    pub fn variables(&self) -> &[Variable] {
        &self.data.variables
    }

    pub fn variable(&self, id: VariableId) -> Option<&Variable> {
        self.data.variables.get(id.0 as usize)
    }

    /// Views for every nested block recorded during construction.
    pub fn sub_ranges(&self) -> impl Iterator<Item = ControlFlow> + '_ {
        self.data
            .sub_ranges
            .iter()
            .filter(move |r| r.start >= self.start && r.end <= self.end)
            .map(move |r| ControlFlow::new(Arc::clone(&self.data), r.start, r.end, r.node))
    }

    /// Successor indices of instruction `index`; `size()` stands for the exit.
    ///
    /// A `Return` may go back to any call site, so both its target and the
    /// next `Return` of the same subroutine are successors.
    pub fn successors(&self, index: usize) -> Vec<usize> {
        let Some(instruction) = self.instruction(index) else {
            return Vec::new();
        };
        let next = index + 1;
        match instruction {
            Instruction::GoTo { offset, .. }
            | Instruction::ThrowTo { offset }
            | Instruction::Call { offset, .. } => vec![offset],
            Instruction::ConditionalGoTo { offset, .. }
            | Instruction::ConditionalThrowTo { offset, .. } => {
                if offset == next {
                    vec![next]
                } else {
                    vec![next, offset]
                }
            }
            Instruction::Return { offset, .. } => {
                let mut out = vec![offset];
                if matches!(self.instruction(next), Some(Instruction::Return { .. })) {
                    out.push(next);
                }
                out
            }
            _ => vec![next],
        }
    }

    /// Same instructions, same element ranges.
    pub fn same_structure(&self, other: &ControlFlow) -> bool {
        if !self.instructions().eq(other.instructions()) {
            return false;
        }
        let ranges = |flow: &ControlFlow| {
            let mut all: Vec<(SyntaxRef, usize, usize)> = flow
                .data
                .ranges
                .values()
                .filter_map(|r| flow.range_of_ref(&r.node).map(|(s, e)| (r.node, s, e)))
                .collect();
            all.sort();
            all
        };
        ranges(self) == ranges(other)
    }

    /// Instruction graph with one node per instruction plus an exit node.
    pub fn to_graph(&self) -> DiGraph<String, EdgeKind> {
        let mut graph = DiGraph::new();
        let mut nodes: Vec<NodeIndex> = Vec::with_capacity(self.size() + 1);
        for i in 0..self.size() {
            nodes.push(graph.add_node(format!("{i}: {}", self.render(i))));
        }
        nodes.push(graph.add_node("exit".to_string()));
        for i in 0..self.size() {
            let Some(instruction) = self.instruction(i) else {
                continue;
            };
            for successor in self.successors(i) {
                let kind = match instruction {
                    _ if successor == i + 1 && instruction.falls_through() => EdgeKind::Next,
                    Instruction::ConditionalGoTo { .. } => EdgeKind::Conditional,
                    Instruction::ConditionalThrowTo { .. } | Instruction::ThrowTo { .. } => {
                        EdgeKind::Exception
                    }
                    Instruction::Call { .. } => EdgeKind::Call,
                    Instruction::Return { .. } => EdgeKind::Return,
                    _ => EdgeKind::Jump,
                };
                graph.add_edge(nodes[i], nodes[successor.min(self.size())], kind);
            }
        }
        graph
    }

    fn variable_name(&self, id: VariableId) -> &str {
        self.variable(id).map_or("?", |v| v.name.as_str())
    }

    /// One-line rendering of instruction `index`, as used by the listing.
    pub fn render(&self, index: usize) -> String {
        let Some(instruction) = self.instruction(index) else {
            return String::new();
        };
        match instruction {
            Instruction::Simple => "SIMPLE".to_string(),
            Instruction::Empty => "EMPTY".to_string(),
            Instruction::ReadVariable { variable } => {
                format!("READ {}", self.variable_name(variable))
            }
            Instruction::WriteVariable { variable } => {
                format!("WRITE {}", self.variable_name(variable))
            }
            Instruction::GoTo {
                offset,
                role,
                is_return,
            } => {
                let suffix = if is_return { " RETURN" } else { "" };
                format!("GOTO [{role}] {offset}{suffix}")
            }
            Instruction::ConditionalGoTo {
                offset, role, when, ..
            } => format!("COND_GOTO [{role}] {when} {offset}"),
            Instruction::ConditionalThrowTo { offset, .. } => format!("COND_THROW_TO {offset}"),
            Instruction::ThrowTo { offset } => format!("THROW_TO {offset}"),
            Instruction::Call { offset, proc_end } => format!("CALL {offset}..{proc_end}"),
            Instruction::Return { offset, call } => format!("RETURN {offset} (from {call})"),
        }
    }
}

impl fmt::Display for ControlFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for index in 0..self.size() {
            writeln!(f, "{index:>4}: {}", self.render(index))?;
        }
        Ok(())
    }
}
