//! Analyses over parsed Java sources.

pub mod control_flow;
