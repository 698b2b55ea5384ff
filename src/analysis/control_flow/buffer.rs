//! Append-only instruction storage used while a flow is being built.
//!
//! Jumps are usually emitted before their target exists. The buffer keeps,
//! per syntax node, the list of jump indices waiting for that node's start
//! or end offset and patches them the moment the node is finished.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error};

use super::flow::{ControlFlow, ElementRange, FlowData};
use super::instruction::{Instruction, Variable, VariableId};
use crate::errors::{FlowError, Result};
use crate::syntax::SyntaxRef;

/// Which end of a node a jump refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Boundary {
    Start,
    End,
}

/// Recycles the small vectors used for pending patch lists.
#[derive(Debug, Default)]
struct PatchPool {
    free: Vec<Vec<usize>>,
}

impl PatchPool {
    const MAX_POOLED: usize = 64;

    fn take(&mut self) -> Vec<usize> {
        self.free.pop().unwrap_or_default()
    }

    fn give(&mut self, mut list: Vec<usize>) {
        if self.free.len() < Self::MAX_POOLED {
            list.clear();
            self.free.push(list);
        }
    }
}

#[derive(Debug, Default)]
struct PendingPatches {
    at_start: Vec<usize>,
    at_end: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
struct OpenRange {
    node: SyntaxRef,
    start: usize,
    end: Option<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct FlowBuffer {
    instructions: Vec<Instruction>,
    owners: Vec<SyntaxRef>,
    ranges: HashMap<usize, OpenRange>,
    open: Vec<SyntaxRef>,
    pending: HashMap<usize, PendingPatches>,
    pool: PatchPool,
    variables: Vec<Variable>,
    variable_ids: HashMap<Variable, VariableId>,
    constant_condition_occurred: bool,
}

impl FlowBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn size(&self) -> usize {
        self.instructions.len()
    }

    /// Append `instruction`, owned by the innermost open element.
    pub(crate) fn append(&mut self, instruction: Instruction) -> Result<usize> {
        let owner = self
            .open
            .last()
            .copied()
            .ok_or_else(|| FlowError::invariant("instruction emitted outside of any element"))?;
        self.instructions.push(instruction);
        self.owners.push(owner);
        Ok(self.instructions.len() - 1)
    }

    pub(crate) fn last_index(&self) -> Option<usize> {
        self.instructions.len().checked_sub(1)
    }

    pub(crate) fn start_element(&mut self, node: SyntaxRef) -> Result<()> {
        if self.ranges.contains_key(&node.id) {
            return Err(FlowError::invariant(format!("{node} started twice")));
        }
        self.ranges.insert(
            node.id,
            OpenRange {
                node,
                start: self.size(),
                end: None,
            },
        );
        self.open.push(node);
        Ok(())
    }

    pub(crate) fn finish_element(&mut self, node: SyntaxRef) -> Result<()> {
        match self.open.pop() {
            Some(top) if top == node => {}
            Some(top) => {
                return Err(FlowError::invariant(format!(
                    "finished {node} while {top} is still open"
                )))
            }
            None => return Err(FlowError::invariant(format!("finished {node} twice"))),
        }
        let end = self.size();
        let start = match self.ranges.get_mut(&node.id) {
            Some(range) => {
                range.end = Some(end);
                range.start
            }
            None => return Err(FlowError::invariant(format!("{node} was never started"))),
        };
        if let Some(pending) = self.pending.remove(&node.id) {
            self.apply(&pending.at_start, start);
            self.apply(&pending.at_end, end);
            self.pool.give(pending.at_start);
            self.pool.give(pending.at_end);
        }
        Ok(())
    }

    /// `(start, end)` of a node; `end` is `None` while the node is open.
    pub(crate) fn range(&self, node: &SyntaxRef) -> Option<(usize, Option<usize>)> {
        self.ranges.get(&node.id).map(|r| (r.start, r.end))
    }

    /// Make the last appended jump point at `boundary` of `target`.
    ///
    /// Patched right away when `target` is already finished, otherwise when
    /// it finishes.
    pub(crate) fn add_offset_later(&mut self, target: SyntaxRef, boundary: Boundary) -> Result<()> {
        let index = self
            .last_index()
            .ok_or_else(|| FlowError::invariant("no jump to patch"))?;
        if let Some((start, Some(end))) = self.range(&target) {
            let resolved = match boundary {
                Boundary::Start => start,
                Boundary::End => end,
            };
            self.apply(&[index], resolved);
            return Ok(());
        }
        let pool = &mut self.pool;
        let pending = self.pending.entry(target.id).or_insert_with(|| PendingPatches {
            at_start: pool.take(),
            at_end: pool.take(),
        });
        match boundary {
            Boundary::Start => pending.at_start.push(index),
            Boundary::End => pending.at_end.push(index),
        }
        Ok(())
    }

    /// Overwrite the target of the jump at `index`.
    pub(crate) fn set_offset(&mut self, index: usize, target: usize) -> Result<()> {
        let slot = self
            .instructions
            .get_mut(index)
            .and_then(Instruction::offset_mut)
            .ok_or_else(|| FlowError::invariant(format!("instruction {index} is not a jump")))?;
        *slot = target;
        Ok(())
    }

    /// Point an already emitted `Call` at the subroutine `[begin, end)`.
    pub(crate) fn retrofit_call(&mut self, index: usize, begin: usize, end: usize) -> Result<()> {
        match self.instructions.get_mut(index) {
            Some(Instruction::Call { offset, proc_end }) => {
                *offset = begin;
                *proc_end = end;
                Ok(())
            }
            _ => Err(FlowError::invariant(format!(
                "instruction {index} is not a subroutine call"
            ))),
        }
    }

    fn apply(&mut self, indices: &[usize], delta: usize) {
        for &index in indices {
            if let Some(offset) = self.instructions.get_mut(index).and_then(Instruction::offset_mut) {
                *offset += delta;
            }
        }
    }

    pub(crate) fn intern(&mut self, variable: Variable) -> VariableId {
        if let Some(id) = self.variable_ids.get(&variable) {
            return *id;
        }
        let id = VariableId(self.variables.len() as u32);
        self.variables.push(variable.clone());
        self.variable_ids.insert(variable, id);
        id
    }

    pub(crate) fn mark_constant_condition(&mut self) {
        self.constant_condition_occurred = true;
    }

    /// Point every still-pending jump at `fallback`. Returns how many there were.
    pub(crate) fn resolve_pending(&mut self, fallback: usize) -> usize {
        let pending: Vec<PendingPatches> = self.pending.drain().map(|(_, p)| p).collect();
        let mut count = 0;
        for patches in pending {
            count += patches.at_start.len() + patches.at_end.len();
            self.apply(&patches.at_start, fallback);
            self.apply(&patches.at_end, fallback);
            self.pool.give(patches.at_start);
            self.pool.give(patches.at_end);
        }
        if count > 0 {
            debug!(count, fallback, "Resolved dangling jumps to fragment end");
        }
        count
    }

    fn validate(&self) -> Result<()> {
        if let Some(node) = self.open.last() {
            return Err(FlowError::invariant(format!("{node} was never finished")));
        }
        let len = self.instructions.len();
        for (index, instruction) in self.instructions.iter().enumerate() {
            let in_bounds = match *instruction {
                Instruction::Call { offset, proc_end } => offset < proc_end && proc_end <= len,
                Instruction::Return { offset, call } => offset <= len && call < index,
                other => other.offset().map_or(true, |offset| offset <= len),
            };
            if !in_bounds {
                error!(index, ?instruction, len, "Jump target out of range");
                return Err(FlowError::invariant(format!(
                    "instruction {index} ({instruction:?}) jumps outside the flow of size {len}"
                )));
            }
        }
        Ok(())
    }

    /// Validate and freeze into an immutable flow rooted at `root`.
    ///
    /// `nested_blocks` become the sub-ranges of the flow; empty ones are dropped.
    pub(crate) fn freeze(self, root: SyntaxRef, nested_blocks: Vec<SyntaxRef>) -> Result<ControlFlow> {
        self.validate()?;
        if !self.pending.is_empty() {
            return Err(FlowError::invariant("unresolved jumps at freeze"));
        }
        let ranges = self
            .ranges
            .into_values()
            .filter_map(|r| {
                r.end.map(|end| ElementRange {
                    node: r.node,
                    start: r.start,
                    end,
                })
            })
            .map(|r| (r.node.id, r))
            .collect::<HashMap<usize, ElementRange>>();
        let sub_ranges = nested_blocks
            .iter()
            .filter_map(|block| ranges.get(&block.id).copied())
            .filter(|range| range.start < range.end)
            .collect();
        let size = self.instructions.len();
        let data = FlowData {
            root,
            instructions: self.instructions,
            owners: self.owners,
            ranges,
            variables: self.variables,
            sub_ranges,
            constant_condition_occurred: self.constant_condition_occurred,
        };
        Ok(ControlFlow::new(Arc::new(data), 0, size, root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::control_flow::instruction::BranchRole;

    fn node(id: usize) -> SyntaxRef {
        SyntaxRef {
            id,
            kind: "block",
            start_byte: id * 10,
            end_byte: id * 10 + 5,
            line: 1,
        }
    }

    fn goto() -> Instruction {
        Instruction::GoTo {
            offset: 0,
            role: BranchRole::End,
            is_return: false,
        }
    }

    #[test]
    fn test_forward_jump_is_patched_on_finish() {
        let mut buffer = FlowBuffer::new();
        let root = node(1);
        let inner = node(2);
        buffer.start_element(root).unwrap();
        buffer.start_element(inner).unwrap();
        buffer.append(goto()).unwrap();
        buffer.add_offset_later(inner, Boundary::End).unwrap();
        buffer.append(Instruction::Simple).unwrap();
        buffer.finish_element(inner).unwrap();
        buffer.finish_element(root).unwrap();

        let flow = buffer.freeze(root, Vec::new()).unwrap();
        assert_eq!(flow.instruction(0).and_then(|i| i.offset()), Some(2));
    }

    #[test]
    fn test_jump_to_finished_node_is_patched_immediately() {
        let mut buffer = FlowBuffer::new();
        let root = node(1);
        let inner = node(2);
        buffer.start_element(root).unwrap();
        buffer.start_element(inner).unwrap();
        buffer.append(Instruction::Simple).unwrap();
        buffer.finish_element(inner).unwrap();
        buffer.append(goto()).unwrap();
        buffer.add_offset_later(inner, Boundary::Start).unwrap();
        buffer.finish_element(root).unwrap();

        let flow = buffer.freeze(root, Vec::new()).unwrap();
        assert_eq!(flow.instruction(1).and_then(|i| i.offset()), Some(0));
    }

    #[test]
    fn test_mismatched_finish_is_an_invariant_error() {
        let mut buffer = FlowBuffer::new();
        buffer.start_element(node(1)).unwrap();
        buffer.start_element(node(2)).unwrap();
        let err = buffer.finish_element(node(1)).unwrap_err();
        assert!(matches!(err, FlowError::Invariant { .. }));
    }

    #[test]
    fn test_unfinished_element_fails_freeze() {
        let mut buffer = FlowBuffer::new();
        buffer.start_element(node(1)).unwrap();
        buffer.append(Instruction::Simple).unwrap();
        assert!(buffer.freeze(node(1), Vec::new()).is_err());
    }

    #[test]
    fn test_pending_jumps_fall_back_to_given_offset() {
        let mut buffer = FlowBuffer::new();
        let root = node(1);
        buffer.start_element(root).unwrap();
        buffer.append(goto()).unwrap();
        buffer.add_offset_later(node(99), Boundary::Start).unwrap();
        buffer.finish_element(root).unwrap();
        assert_eq!(buffer.resolve_pending(1), 1);

        let flow = buffer.freeze(root, Vec::new()).unwrap();
        assert_eq!(flow.instruction(0).and_then(|i| i.offset()), Some(1));
    }

    #[test]
    fn test_variables_are_interned_once() {
        let mut buffer = FlowBuffer::new();
        let a = buffer.intern(Variable::field("a"));
        let b = buffer.intern(Variable::field("b"));
        assert_eq!(buffer.intern(Variable::field("a")), a);
        assert_ne!(a, b);
    }

    #[test]
    fn test_append_without_open_element_fails() {
        let mut buffer = FlowBuffer::new();
        assert!(buffer.append(Instruction::Simple).is_err());
    }
}
