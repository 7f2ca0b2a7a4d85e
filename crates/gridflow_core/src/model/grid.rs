//! Spatial partition and the gridset that aggregates computed matrices.

use super::identity::EntityId;
use super::matrix::Matrix;
use super::metadata::Metadata;
use super::spatial::SpatialPayload;
use super::status::Status;
use serde::{Deserialize, Serialize};

/// Partition of a region into square (4) or hexagonal (6) cells.
///
/// Natural key: `(owner, name)`. Shared by any number of gridsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeGrid {
    pub id: Option<EntityId>,
    pub owner: String,
    pub name: String,
    pub cell_sides: u8,
    /// Cell edge length in map units.
    pub cell_size: f64,
    pub spatial: SpatialPayload,
    pub status: Status,
    pub status_mod_time: i64,
    pub metadata: Metadata,
    pub mod_time: i64,
}

impl ShapeGrid {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        cell_sides: u8,
        cell_size: f64,
        mod_time: i64,
    ) -> Self {
        Self {
            id: None,
            owner: owner.into(),
            name: name.into(),
            cell_sides,
            cell_size,
            spatial: SpatialPayload::default(),
            status: Status::General,
            status_mod_time: mod_time,
            metadata: Metadata::default(),
            mod_time,
        }
    }
}

/// Phylogenetic tree file attached to a gridset. Natural key: `(owner, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub id: Option<EntityId>,
    pub owner: String,
    pub name: String,
    pub dlocation: Option<String>,
    pub metadata: Metadata,
    pub mod_time: i64,
}

impl Tree {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, mod_time: i64) -> Self {
        Self {
            id: None,
            owner: owner.into(),
            name: name.into(),
            dlocation: None,
            metadata: Metadata::default(),
            mod_time,
        }
    }
}

/// One shapegrid, an optional tree and the matrices computed over them.
///
/// Natural key: `(owner, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gridset {
    pub id: Option<EntityId>,
    pub owner: String,
    pub name: String,
    pub shapegrid_id: Option<EntityId>,
    pub tree_id: Option<EntityId>,
    pub epsg: Option<u32>,
    pub metadata: Metadata,
    pub matrices: Vec<Matrix>,
    pub mod_time: i64,
}

impl Gridset {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, mod_time: i64) -> Self {
        Self {
            id: None,
            owner: owner.into(),
            name: name.into(),
            shapegrid_id: None,
            tree_id: None,
            epsg: None,
            metadata: Metadata::default(),
            matrices: Vec::new(),
            mod_time,
        }
    }
}
