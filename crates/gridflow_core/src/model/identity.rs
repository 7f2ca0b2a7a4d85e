//! Entity identity and reconciliation results.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Persistent identity assigned by the catalog on first reconciliation.
pub type EntityId = Uuid;

/// Owner of catalog-wide defaults when a site does not override it.
pub const DEFAULT_PUBLIC_OWNER: &str = "public";

/// Reconcilable entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    TaxonSource,
    Algorithm,
    ScenarioPackage,
    Scenario,
    Layer,
    ShapeGrid,
    Tree,
    Gridset,
    Matrix,
    MatrixColumn,
    Chain,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::TaxonSource => "taxon_source",
            Self::Algorithm => "algorithm",
            Self::ScenarioPackage => "scenario_package",
            Self::Scenario => "scenario",
            Self::Layer => "layer",
            Self::ShapeGrid => "shapegrid",
            Self::Tree => "tree",
            Self::Gridset => "gridset",
            Self::Matrix => "matrix",
            Self::MatrixColumn => "matrix_column",
            Self::Chain => "chain",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity stored under one owner's natural-key namespace.
pub trait OwnerScoped {
    fn catalog_id(&self) -> Option<EntityId>;
    fn owner(&self) -> &str;
}

macro_rules! impl_owner_scoped {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl OwnerScoped for $ty {
                fn catalog_id(&self) -> Option<EntityId> {
                    self.id
                }

                fn owner(&self) -> &str {
                    &self.owner
                }
            }
        )+
    };
}

impl_owner_scoped!(
    crate::model::algorithm::Algorithm,
    crate::model::algorithm::TaxonSource,
    crate::model::grid::ShapeGrid,
    crate::model::grid::Tree,
    crate::model::grid::Gridset,
    crate::model::matrix::Matrix,
    crate::model::matrix::MatrixColumn,
    crate::model::scenario::Layer,
    crate::model::scenario::Scenario,
    crate::model::scenario::ScenarioPackage,
);

/// Outcome of one reconciliation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled<T> {
    /// Stored state after the merge, with identity set.
    pub entity: T,
    /// `true` when the natural key already existed before this call.
    pub was_preexisting: bool,
}

impl<T> Reconciled<T> {
    pub fn created(entity: T) -> Self {
        Self {
            entity,
            was_preexisting: false,
        }
    }

    pub fn preexisting(entity: T) -> Self {
        Self {
            entity,
            was_preexisting: true,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reconciled<U> {
        Reconciled {
            entity: f(self.entity),
            was_preexisting: self.was_preexisting,
        }
    }
}
