//! Environmental data hierarchy: package -> scenario -> layer.
//!
//! # Invariants
//! - A scenario belongs to at most one package.
//! - A layer is owned by the first scenario that links it; other scenarios
//!   reference it without owning it.

use super::identity::EntityId;
use super::metadata::Metadata;
use super::spatial::{BoundingBox, SpatialPayload};
use serde::{Deserialize, Serialize};

/// How a scenario refers to one of its layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerLink {
    /// First scenario to link the layer.
    Owned,
    /// Back-reference to a layer another scenario owns.
    Shared,
}

impl LayerLink {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::Owned => "owned",
            Self::Shared => "shared",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "owned" => Some(Self::Owned),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }
}

/// One environmental raster. Natural key: `(owner, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: Option<EntityId>,
    pub owner: String,
    pub name: String,
    /// Stable content identifier assigned by the data provider.
    pub squid: Option<String>,
    /// Environmental variable code, e.g. `bio1`.
    pub env_code: Option<String>,
    pub spatial: SpatialPayload,
    pub metadata: Metadata,
    pub mod_time: i64,
}

impl Layer {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, mod_time: i64) -> Self {
        Self {
            id: None,
            owner: owner.into(),
            name: name.into(),
            squid: None,
            env_code: None,
            spatial: SpatialPayload::default(),
            metadata: Metadata::default(),
            mod_time,
        }
    }

    pub fn with_dlocation(mut self, dlocation: impl Into<String>) -> Self {
        self.spatial.dlocation = Some(dlocation.into());
        self
    }
}

/// A set of layers describing one climate (observed or projected).
///
/// Natural key: `(owner, code)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: Option<EntityId>,
    pub owner: String,
    pub package_id: Option<EntityId>,
    pub code: String,
    pub spatial: SpatialPayload,
    pub metadata: Metadata,
    pub layers: Vec<Layer>,
    pub mod_time: i64,
}

impl Scenario {
    pub fn new(owner: impl Into<String>, code: impl Into<String>, mod_time: i64) -> Self {
        Self {
            id: None,
            owner: owner.into(),
            package_id: None,
            code: code.into(),
            spatial: SpatialPayload::default(),
            metadata: Metadata::default(),
            layers: Vec::new(),
            mod_time,
        }
    }
}

/// A published bundle of scenarios sharing one grid of cells.
///
/// Natural key: `(owner, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioPackage {
    pub id: Option<EntityId>,
    pub owner: String,
    pub name: String,
    /// Scenario code used for model fitting when a request names none.
    pub base_code: Option<String>,
    pub spatial: SpatialPayload,
    pub metadata: Metadata,
    pub scenarios: Vec<Scenario>,
    pub mod_time: i64,
}

impl ScenarioPackage {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, mod_time: i64) -> Self {
        Self {
            id: None,
            owner: owner.into(),
            name: name.into(),
            base_code: None,
            spatial: SpatialPayload::default(),
            metadata: Metadata::default(),
            scenarios: Vec::new(),
            mod_time,
        }
    }

    pub fn scenario(&self, code: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|scenario| scenario.code == code)
    }

    pub fn scenario_codes(&self) -> Vec<&str> {
        self.scenarios
            .iter()
            .map(|scenario| scenario.code.as_str())
            .collect()
    }

    /// Region covered by every scenario of the package.
    pub fn derived_bbox(&self) -> Option<BoundingBox> {
        BoundingBox::intersect_all(
            self.scenarios
                .iter()
                .filter_map(|scenario| scenario.spatial.bbox.as_ref()),
        )
    }
}
