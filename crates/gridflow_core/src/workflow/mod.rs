//! DAG authoring for the external workflow engine.
//!
//! # Responsibility
//! - Model rules and chains and render chains as DAG documents.
//! - Reject invalid graphs before anything reaches the engine.
//! - Order pending chains by priority and submission time.
//!
//! # Invariants
//! - Rendering is deterministic: one chain value, one byte sequence.
//! - No output is declared twice within a chain.

pub mod chain;
pub mod commands;
pub mod queue;
pub mod rule;
