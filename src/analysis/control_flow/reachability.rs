//! Context-sensitive reachability over a built flow.
//!
//! `finally` blocks are shared subroutines: a plain graph walk would let
//! control enter through one `Call` and leave through the `Return` of
//! another. The walk here keeps the stack of active calls, so a `Return`
//! only resumes after the call that entered it.
//!
//! A `finally` body may also leave abruptly (`break`, `continue`, a throw).
//! Calls whose subroutine control has left are dropped from the stack, so
//! the stack never grows deeper than the `finally` nesting and the walk
//! terminates.

use std::collections::{HashMap, HashSet, VecDeque};

use super::flow::ControlFlow;
use super::instruction::Instruction;
use crate::syntax::SyntaxRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reachability {
    reachable: Vec<bool>,
    exit_reachable: bool,
}

impl Reachability {
    pub fn is_reachable(&self, index: usize) -> bool {
        self.reachable.get(index).copied().unwrap_or(false)
    }

    /// Whether control can leave the flow, normally or not.
    pub fn exit_reachable(&self) -> bool {
        self.exit_reachable
    }

    pub fn unreachable(&self) -> impl Iterator<Item = usize> + '_ {
        self.reachable
            .iter()
            .enumerate()
            .filter(|(_, reached)| !**reached)
            .map(|(index, _)| index)
    }
}

/// Instruction ranges of each subroutine, keyed by the index of its `Call`.
///
/// A subroutine spans its body `[offset, proc_end)` and the block of
/// `Return`s that follows it.
fn subroutine_extents(flow: &ControlFlow) -> HashMap<usize, (usize, usize)> {
    let mut extents = HashMap::new();
    for (index, instruction) in flow.instructions().enumerate() {
        if let Instruction::Call { offset, proc_end } = instruction {
            let mut end = proc_end;
            while matches!(flow.instruction(end), Some(Instruction::Return { .. })) {
                end += 1;
            }
            extents.insert(index, (offset, end));
        }
    }
    extents
}

/// Pop the calls whose subroutine does not contain `next`.
fn settle(mut stack: Vec<usize>, next: usize, extents: &HashMap<usize, (usize, usize)>) -> Vec<usize> {
    while let Some(top) = stack.last() {
        match extents.get(top) {
            Some(&(begin, end)) if (begin..end).contains(&next) => break,
            _ => {
                stack.pop();
            }
        }
    }
    stack
}

/// Reachability from instruction 0 with no assumptions.
pub fn reachable(flow: &ControlFlow) -> Reachability {
    reachable_assuming(flow, &HashMap::new())
}

/// Reachability when the conditions in `assumptions` have fixed values.
///
/// A `ConditionalGoTo` whose condition is assumed is followed on one side
/// only.
pub fn reachable_assuming(flow: &ControlFlow, assumptions: &HashMap<SyntaxRef, bool>) -> Reachability {
    let size = flow.size();
    let extents = subroutine_extents(flow);
    let mut reachable = vec![false; size];
    let mut exit_reachable = false;
    let mut seen: HashSet<(usize, Vec<usize>)> = HashSet::new();
    let mut queue: VecDeque<(usize, Vec<usize>)> = VecDeque::new();
    if size == 0 {
        return Reachability {
            reachable,
            exit_reachable: true,
        };
    }
    queue.push_back((0, Vec::new()));

    while let Some((index, stack)) = queue.pop_front() {
        if index >= size {
            exit_reachable = true;
            continue;
        }
        if !seen.insert((index, stack.clone())) {
            continue;
        }
        reachable[index] = true;
        let Some(instruction) = flow.instruction(index) else {
            continue;
        };

        let mut push = |next: usize, stack: Vec<usize>| {
            let stack = settle(stack, next, &extents);
            queue.push_back((next, stack));
        };
        match instruction {
            Instruction::GoTo { offset, .. } | Instruction::ThrowTo { offset } => push(offset, stack),
            Instruction::ConditionalGoTo {
                offset,
                when,
                condition,
                ..
            } => match condition.and_then(|c| assumptions.get(&c)) {
                Some(value) if *value == when => push(offset, stack),
                Some(_) => push(index + 1, stack),
                None => {
                    push(offset, stack.clone());
                    push(index + 1, stack);
                }
            },
            Instruction::ConditionalThrowTo { offset, .. } => {
                push(offset, stack.clone());
                push(index + 1, stack);
            }
            Instruction::Call { offset, .. } => {
                let mut stack = stack;
                stack.push(index);
                push(offset, stack);
            }
            Instruction::Return { offset, call } => match stack.last().copied() {
                Some(top) if top == call => {
                    let mut stack = stack;
                    stack.pop();
                    push(offset, stack);
                }
                Some(_) => push(index + 1, stack),
                // entered without a call: be conservative
                None => {
                    push(offset, stack.clone());
                    push(index + 1, stack);
                }
            },
            _ => push(index + 1, stack),
        }
    }

    Reachability {
        reachable,
        exit_reachable,
    }
}
