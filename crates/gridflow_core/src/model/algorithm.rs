//! Modeling algorithms and taxonomy sources.

use super::identity::EntityId;
use super::metadata::{Metadata, ParameterBlock};
use serde::{Deserialize, Serialize};

/// A modeling algorithm and the parameters a request runs it with.
///
/// Natural key: `(owner, code)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Algorithm {
    pub id: Option<EntityId>,
    pub owner: String,
    pub code: String,
    pub name: Option<String>,
    pub parameters: ParameterBlock,
    pub metadata: Metadata,
    pub mod_time: i64,
}

impl Algorithm {
    pub fn new(owner: impl Into<String>, code: impl Into<String>, mod_time: i64) -> Self {
        Self {
            id: None,
            owner: owner.into(),
            code: code.into(),
            name: None,
            parameters: ParameterBlock::new(),
            metadata: Metadata::default(),
            mod_time,
        }
    }
}

/// Origin of taxonomy records (for example a GBIF backbone dump).
///
/// Natural key: `(owner, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonSource {
    pub id: Option<EntityId>,
    pub owner: String,
    pub name: String,
    pub url: Option<String>,
    pub mod_time: i64,
}

impl TaxonSource {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, mod_time: i64) -> Self {
        Self {
            id: None,
            owner: owner.into(),
            name: name.into(),
            url: None,
            mod_time,
        }
    }
}
