//! Control flow graph construction for Java procedure bodies.
//!
//! ```
//! use ctrlflow::{build_flow, parse_java, Cancellation, FlowOptions, LocalVariablesPolicy};
//!
//! let source = parse_java("class A { int m(int a) { return a; } }").unwrap();
//! let method = source.procedure("m").unwrap();
//! let flow = build_flow(
//!     method.node,
//!     source.bytes(),
//!     &LocalVariablesPolicy,
//!     FlowOptions::default(),
//!     &Cancellation::new(),
//! )
//! .unwrap();
//! assert_eq!(flow.render(0), "READ a");
//! ```

pub mod analysis;
pub mod cli;
pub mod config;
pub mod errors;
pub mod observability;
pub mod syntax;

pub use crate::analysis::control_flow::{
    build_flow, reachable, reachable_assuming, BranchRole, CacheStats, Cancellation, ControlFlow,
    EdgeKind, ElementRange, FlowFactory, FlowOptions, FlowPolicy, Instruction,
    LocalVariablesPolicy, LocalsAndFieldsPolicy, ModificationCounter, ParametersOnlyPolicy,
    Reachability, Variable, VariableId, VariableKind,
};
pub use crate::config::{CtrlflowConfig, PolicyChoice};
pub use crate::errors::{FlowError, Result};
pub use crate::syntax::{parse_java, JavaSource, Procedure, ProcedureKind, SyntaxRef};
