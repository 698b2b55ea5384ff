//! The instruction set of a control flow.
//!
//! A flow is a flat list of [`Instruction`]s. Every jump carries an absolute
//! offset into that list; an offset equal to the list length means "leave
//! the fragment".

use std::fmt;

use serde::Serialize;

use crate::syntax::SyntaxRef;

/// Which branch of the surrounding construct a jump belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchRole {
    Then,
    Else,
    End,
}

impl fmt::Display for BranchRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Then => "THEN",
            Self::Else => "ELSE",
            Self::End => "END",
        };
        f.write_str(label)
    }
}

/// Index into the variable table of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct VariableId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Local,
    Parameter,
    CatchParameter,
    Pattern,
    Resource,
    Field,
}

/// A variable the flow reads or writes.
///
/// Locals are identified by their declaring node, fields by name only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    pub declaration: Option<SyntaxRef>,
}

impl Variable {
    pub fn local(name: impl Into<String>, kind: VariableKind, declaration: SyntaxRef) -> Self {
        Self {
            name: name.into(),
            kind,
            declaration: Some(declaration),
        }
    }

    pub fn field(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Field,
            declaration: None,
        }
    }

    pub fn is_field(&self) -> bool {
        self.kind == VariableKind::Field
    }
}

/// One step of a control flow.
///
/// `ConditionalGoTo` is taken when the value of `condition` equals `when`.
/// `Call` enters a shared subroutine occupying `[offset, proc_end)`; the
/// matching `Return` at `proc_end` or later jumps to `offset` once the
/// subroutine was entered from `call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    Simple,
    Empty,
    ReadVariable {
        variable: VariableId,
    },
    WriteVariable {
        variable: VariableId,
    },
    GoTo {
        offset: usize,
        role: BranchRole,
        is_return: bool,
    },
    ConditionalGoTo {
        offset: usize,
        role: BranchRole,
        when: bool,
        condition: Option<SyntaxRef>,
    },
    ConditionalThrowTo {
        offset: usize,
        thrower: Option<SyntaxRef>,
    },
    ThrowTo {
        offset: usize,
    },
    Call {
        offset: usize,
        proc_end: usize,
    },
    Return {
        offset: usize,
        call: usize,
    },
}

impl Instruction {
    /// The jump target, for every instruction that has one.
    pub fn offset(&self) -> Option<usize> {
        match *self {
            Self::GoTo { offset, .. }
            | Self::ConditionalGoTo { offset, .. }
            | Self::ConditionalThrowTo { offset, .. }
            | Self::ThrowTo { offset }
            | Self::Call { offset, .. }
            | Self::Return { offset, .. } => Some(offset),
            _ => None,
        }
    }

    pub(crate) fn offset_mut(&mut self) -> Option<&mut usize> {
        match self {
            Self::GoTo { offset, .. }
            | Self::ConditionalGoTo { offset, .. }
            | Self::ConditionalThrowTo { offset, .. }
            | Self::ThrowTo { offset }
            | Self::Call { offset, .. }
            | Self::Return { offset, .. } => Some(offset),
            _ => None,
        }
    }

    pub fn is_jump(&self) -> bool {
        self.offset().is_some()
    }

    /// Whether execution can continue with the next instruction.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Self::GoTo { .. } | Self::ThrowTo { .. } | Self::Call { .. }
        )
    }

    pub fn variable(&self) -> Option<VariableId> {
        match *self {
            Self::ReadVariable { variable } | Self::WriteVariable { variable } => Some(variable),
            _ => None,
        }
    }

    /// Rewrite every instruction index this instruction mentions.
    pub(crate) fn remap(self, mut map: impl FnMut(usize) -> usize) -> Self {
        match self {
            Self::GoTo {
                offset,
                role,
                is_return,
            } => Self::GoTo {
                offset: map(offset),
                role,
                is_return,
            },
            Self::ConditionalGoTo {
                offset,
                role,
                when,
                condition,
            } => Self::ConditionalGoTo {
                offset: map(offset),
                role,
                when,
                condition,
            },
            Self::ConditionalThrowTo { offset, thrower } => Self::ConditionalThrowTo {
                offset: map(offset),
                thrower,
            },
            Self::ThrowTo { offset } => Self::ThrowTo {
                offset: map(offset),
            },
            Self::Call { offset, proc_end } => Self::Call {
                offset: map(offset),
                proc_end: map(proc_end),
            },
            Self::Return { offset, call } => Self::Return {
                offset: map(offset),
                call: map(call),
            },
            other => other,
        }
    }
}
