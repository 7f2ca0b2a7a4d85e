//! Computed matrices and their columns.
//!
//! # Invariants
//! - A matrix is keyed by `(owner, gridset, type, scenario)`.
//! - A column is keyed by `(matrix, ident)`; its index is fixed at insertion.

use super::identity::EntityId;
use super::metadata::{Metadata, ParameterBlock};
use super::status::Status;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixType {
    /// Presence/absence of species per cell.
    Pam,
    /// Raster values intersected with grid cells.
    Grim,
    /// Encoded biogeographic hypothesis layers, one column per layer.
    BiogeoHypotheses,
}

impl MatrixType {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::Pam => "pam",
            Self::Grim => "grim",
            Self::BiogeoHypotheses => "biogeo_hypotheses",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pam" => Some(Self::Pam),
            "grim" => Some(Self::Grim),
            "biogeo_hypotheses" => Some(Self::BiogeoHypotheses),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub id: Option<EntityId>,
    pub owner: String,
    pub gridset_id: Option<EntityId>,
    pub matrix_type: MatrixType,
    pub scenario_id: Option<EntityId>,
    pub dlocation: Option<String>,
    pub status: Status,
    pub status_mod_time: i64,
    pub metadata: Metadata,
    pub columns: Vec<MatrixColumn>,
    pub mod_time: i64,
}

impl Matrix {
    pub fn new(owner: impl Into<String>, matrix_type: MatrixType, mod_time: i64) -> Self {
        Self {
            id: None,
            owner: owner.into(),
            gridset_id: None,
            matrix_type,
            scenario_id: None,
            dlocation: None,
            status: Status::General,
            status_mod_time: mod_time,
            metadata: Metadata::default(),
            columns: Vec::new(),
            mod_time,
        }
    }

    pub fn has_fatal_column(&self) -> bool {
        self.columns
            .iter()
            .any(|column| column.status == Status::FatalError)
    }
}

/// One layer intersected into one column of a matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixColumn {
    pub id: Option<EntityId>,
    pub owner: String,
    pub matrix_id: Option<EntityId>,
    pub layer_id: Option<EntityId>,
    /// Assigned by the catalog on insertion.
    pub column_index: Option<i64>,
    /// Copied from the source layer's name, its owner-scoped natural key.
    pub ident: String,
    pub squid: Option<String>,
    pub intersect_params: ParameterBlock,
    pub dlocation: Option<String>,
    pub status: Status,
    pub status_mod_time: i64,
    pub metadata: Metadata,
    pub mod_time: i64,
}

impl MatrixColumn {
    pub fn new(owner: impl Into<String>, ident: impl Into<String>, mod_time: i64) -> Self {
        Self {
            id: None,
            owner: owner.into(),
            matrix_id: None,
            layer_id: None,
            column_index: None,
            ident: ident.into(),
            squid: None,
            intersect_params: ParameterBlock::new(),
            dlocation: None,
            status: Status::General,
            status_mod_time: mod_time,
            metadata: Metadata::default(),
            mod_time,
        }
    }
}
