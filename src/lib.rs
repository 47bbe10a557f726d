//! Montaje — Rust-native distributed test environments.
//!
//! Declarative YAML scripts, typed instruction plans, deterministic run
//! traces. Interpret, validate, execute — one terminal outcome per run.

pub mod backend;
pub mod cli;
pub mod core;
pub mod instructions;
