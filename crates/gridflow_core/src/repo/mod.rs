//! Repository layer for catalog and chain persistence.
//!
//! # Responsibility
//! - Define repository traits used by services.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - Repository APIs return typed errors instead of panicking.
//! - Persisted rows that fail to parse are reported, never masked.

pub mod catalog_repo;
pub mod chain_repo;
