//! Catalog domain model.
//!
//! # Responsibility
//! - Define the entities reconciled into the catalog.
//! - Keep parameter and spatial attributes as composed values, not base types.
//!
//! # Invariants
//! - Every reconcilable entity carries an optional `EntityId`, absent until
//!   first reconciliation.
//! - Natural keys are unique per owner.

pub mod algorithm;
pub mod grid;
pub mod identity;
pub mod matrix;
pub mod metadata;
pub mod scenario;
pub mod spatial;
pub mod status;
pub mod user;
