//! Control flow graphs of Java procedure bodies
//!
//! A flow is a flat list of [`Instruction`]s. Every syntax element owns a
//! contiguous range of it, jumps carry absolute offsets and an offset equal
//! to the flow size means "leave the fragment". `finally` blocks are
//! lowered once and entered through `Call`/`Return` pairs, which is why
//! [`reachability`] walks the list with a call stack instead of treating it
//! as a plain graph.
//!
//! Most callers go through [`FlowFactory`], which caches flows per node and
//! modification generation. [`build_flow`] is the uncached entry point.

mod buffer;
mod builder;
mod cancel;
mod factory;
mod flow;
mod instruction;
mod options;
mod policy;
pub mod reachability;

pub use builder::build_flow;
pub use cancel::Cancellation;
pub use factory::{CacheStats, FlowFactory, ModificationCounter};
pub use flow::{ControlFlow, EdgeKind, ElementRange};
pub use instruction::{BranchRole, Instruction, Variable, VariableId, VariableKind};
pub use options::FlowOptions;
pub use policy::{FlowPolicy, LocalVariablesPolicy, LocalsAndFieldsPolicy, ParametersOnlyPolicy};
pub use reachability::{reachable, reachable_assuming, Reachability};
