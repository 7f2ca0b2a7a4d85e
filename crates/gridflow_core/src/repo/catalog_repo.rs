//! Catalog reconciliation contracts and SQLite implementation.
//!
//! # Responsibility
//! - Resolve every entity to exactly one stored row per owner-scoped key.
//! - Merge mutable fields into rows that already exist.
//! - Keep SQL details inside the catalog boundary.
//!
//! # Invariants
//! - Each public write runs in one `IMMEDIATE` transaction, composites included.
//! - Parents are reconciled before children; the parent id is injected as
//!   the child's foreign key.
//! - A known id that the store does not hold is `NotFound`, never an insert.
//! - Reconciling a stored `initialized`/`recoverable_error` row resets it to
//!   `general`.

use crate::db::DbError;
use crate::model::algorithm::{Algorithm, TaxonSource};
use crate::model::grid::{Gridset, ShapeGrid, Tree};
use crate::model::identity::{EntityId, EntityKind, OwnerScoped, Reconciled};
use crate::model::matrix::{Matrix, MatrixColumn, MatrixType};
use crate::model::metadata::{Metadata, ParameterBlock};
use crate::model::scenario::{Layer, LayerLink, Scenario, ScenarioPackage};
use crate::model::spatial::{BoundingBox, SpatialPayload};
use crate::model::status::Status;
use crate::model::user::User;
use log::{debug, warn};
use rusqlite::{params, Connection, Params, Row, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

const USER_SELECT_SQL: &str = "SELECT user_id, email, metadata, mod_time FROM users";

const TAXON_SOURCE_SELECT_SQL: &str = "SELECT id, owner, name, url, mod_time FROM taxon_sources";

const ALGORITHM_SELECT_SQL: &str = "SELECT
    id, owner, code, name, parameters, metadata, mod_time
FROM algorithms";

const PACKAGE_SELECT_SQL: &str = "SELECT
    id, owner, name, base_code,
    epsg, map_units, resolution, bbox, dlocation, data_format,
    metadata, mod_time
FROM scenario_packages";

const SCENARIO_SELECT_SQL: &str = "SELECT
    id, owner, package_id, code,
    epsg, map_units, resolution, bbox, dlocation, data_format,
    metadata, mod_time
FROM scenarios";

const LAYER_SELECT_SQL: &str = "SELECT
    id, owner, name, squid, env_code,
    epsg, map_units, resolution, bbox, dlocation, data_format,
    metadata, mod_time
FROM layers";

const SCENARIO_LAYERS_SQL: &str = "SELECT
    l.id, l.owner, l.name, l.squid, l.env_code,
    l.epsg, l.map_units, l.resolution, l.bbox, l.dlocation, l.data_format,
    l.metadata, l.mod_time
FROM scenario_layers sl
JOIN layers l ON l.id = sl.layer_id
WHERE sl.scenario_id = ?1
ORDER BY sl.position ASC";

const SHAPEGRID_SELECT_SQL: &str = "SELECT
    id, owner, name, cell_sides, cell_size,
    epsg, map_units, resolution, bbox, dlocation, data_format,
    status, status_mod_time, metadata, mod_time
FROM shapegrids";

const TREE_SELECT_SQL: &str = "SELECT id, owner, name, dlocation, metadata, mod_time FROM trees";

const GRIDSET_SELECT_SQL: &str = "SELECT
    id, owner, name, shapegrid_id, tree_id, epsg, metadata, mod_time
FROM gridsets";

const MATRIX_SELECT_SQL: &str = "SELECT
    id, owner, gridset_id, matrix_type, scenario_id, dlocation,
    status, status_mod_time, metadata, mod_time
FROM matrices";

const COLUMN_SELECT_SQL: &str = "SELECT
    id, owner, matrix_id, layer_id, column_index, ident, squid,
    intersect_params, dlocation, status, status_mod_time, metadata, mod_time
FROM matrix_columns";

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Catalog failure. Fatal for the current reconciliation call.
#[derive(Debug)]
pub enum CatalogError {
    Db(DbError),
    NotFound { kind: EntityKind, id: String },
    MissingIdentity(EntityKind),
    MissingParent {
        kind: EntityKind,
        parent: EntityKind,
    },
    InvalidData(String),
}

impl CatalogError {
    fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl Display for CatalogError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            Self::MissingIdentity(kind) => write!(f, "{kind} has no catalog identity"),
            Self::MissingParent { kind, parent } => {
                write!(f, "{kind} cannot be stored without a {parent} id")
            }
            Self::InvalidData(message) => write!(f, "invalid catalog data: {message}"),
        }
    }
}

impl Error for CatalogError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for CatalogError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for CatalogError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidData(format!("json column: {value}"))
    }
}

/// How to find one entity: by identity or by owner-scoped natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Id(EntityId),
    Key { owner: &'a str, name: &'a str },
}

/// Catalog reconciliation and lookup interface.
pub trait CatalogRepository {
    fn reconcile_user(&self, user: &User) -> CatalogResult<Reconciled<User>>;
    fn reconcile_taxon_source(&self, source: &TaxonSource)
        -> CatalogResult<Reconciled<TaxonSource>>;
    fn reconcile_algorithm(&self, algorithm: &Algorithm) -> CatalogResult<Reconciled<Algorithm>>;
    /// Reconciles the package, then each scenario and its layers.
    fn reconcile_scenario_package(
        &self,
        package: &ScenarioPackage,
    ) -> CatalogResult<Reconciled<ScenarioPackage>>;
    /// Reconciles the scenario, then each of its layers.
    fn reconcile_scenario(&self, scenario: &Scenario) -> CatalogResult<Reconciled<Scenario>>;
    fn reconcile_layer(&self, layer: &Layer) -> CatalogResult<Reconciled<Layer>>;
    fn reconcile_shapegrid(&self, grid: &ShapeGrid) -> CatalogResult<Reconciled<ShapeGrid>>;
    fn reconcile_tree(&self, tree: &Tree) -> CatalogResult<Reconciled<Tree>>;
    /// Reconciles the gridset, then each matrix and its columns.
    fn reconcile_gridset(&self, gridset: &Gridset) -> CatalogResult<Reconciled<Gridset>>;
    /// Reconciles the matrix, then each of its columns.
    fn reconcile_matrix(&self, matrix: &Matrix) -> CatalogResult<Reconciled<Matrix>>;
    fn reconcile_matrix_column(
        &self,
        column: &MatrixColumn,
    ) -> CatalogResult<Reconciled<MatrixColumn>>;

    fn get_user(&self, user_id: &str) -> CatalogResult<Option<User>>;
    fn get_taxon_source(&self, lookup: Lookup<'_>) -> CatalogResult<Option<TaxonSource>>;
    fn get_algorithm(&self, lookup: Lookup<'_>) -> CatalogResult<Option<Algorithm>>;
    fn get_scenario_package(&self, lookup: Lookup<'_>) -> CatalogResult<Option<ScenarioPackage>>;
    fn get_scenario(&self, lookup: Lookup<'_>) -> CatalogResult<Option<Scenario>>;
    fn get_layer(&self, lookup: Lookup<'_>) -> CatalogResult<Option<Layer>>;
    fn layer_links(&self, scenario_id: EntityId) -> CatalogResult<Vec<(EntityId, LayerLink)>>;
    fn get_shapegrid(&self, lookup: Lookup<'_>) -> CatalogResult<Option<ShapeGrid>>;
    fn get_tree(&self, lookup: Lookup<'_>) -> CatalogResult<Option<Tree>>;
    fn get_gridset(&self, lookup: Lookup<'_>) -> CatalogResult<Option<Gridset>>;
    fn get_matrix(&self, id: EntityId) -> CatalogResult<Option<Matrix>>;
    fn find_matrix(
        &self,
        owner: &str,
        gridset_id: EntityId,
        matrix_type: MatrixType,
        scenario_id: Option<EntityId>,
    ) -> CatalogResult<Option<Matrix>>;
    fn list_matrices_for_gridset(&self, gridset_id: EntityId) -> CatalogResult<Vec<Matrix>>;
    fn get_matrix_column(&self, id: EntityId) -> CatalogResult<Option<MatrixColumn>>;
    fn list_matrix_columns(&self, matrix_id: EntityId) -> CatalogResult<Vec<MatrixColumn>>;

    fn update_shapegrid(&self, grid: &ShapeGrid) -> CatalogResult<()>;
    fn update_gridset(&self, gridset: &Gridset) -> CatalogResult<()>;
    /// Updates the matrix row only; columns are untouched.
    fn update_matrix(&self, matrix: &Matrix) -> CatalogResult<()>;
    fn update_matrix_column(&self, column: &MatrixColumn) -> CatalogResult<()>;

    /// Deletes a gridset with its matrices, columns and chains.
    ///
    /// Returns the document paths of the deleted chains.
    fn delete_gridset(&self, id: EntityId) -> CatalogResult<Vec<String>>;
}

/// SQLite-backed catalog.
pub struct SqliteCatalog<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteCatalog<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn write_tx<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&Connection) -> CatalogResult<T>,
    ) -> CatalogResult<T> {
        let started_at = Instant::now();
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                debug!(
                    "event=catalog_write module=catalog status=ok op={} duration_ms={}",
                    operation,
                    started_at.elapsed().as_millis()
                );
                Ok(value)
            }
            Err(err) => {
                warn!(
                    "event=catalog_write module=catalog status=error op={} duration_ms={} error={}",
                    operation,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }
}

impl CatalogRepository for SqliteCatalog<'_> {
    fn reconcile_user(&self, user: &User) -> CatalogResult<Reconciled<User>> {
        self.write_tx("reconcile_user", |conn| reconcile_user_in(conn, user))
    }

    fn reconcile_taxon_source(
        &self,
        source: &TaxonSource,
    ) -> CatalogResult<Reconciled<TaxonSource>> {
        self.write_tx("reconcile_taxon_source", |conn| {
            reconcile_taxon_source_in(conn, source)
        })
    }

    fn reconcile_algorithm(&self, algorithm: &Algorithm) -> CatalogResult<Reconciled<Algorithm>> {
        self.write_tx("reconcile_algorithm", |conn| {
            reconcile_algorithm_in(conn, algorithm)
        })
    }

    fn reconcile_scenario_package(
        &self,
        package: &ScenarioPackage,
    ) -> CatalogResult<Reconciled<ScenarioPackage>> {
        self.write_tx("reconcile_scenario_package", |conn| {
            reconcile_package_in(conn, package)
        })
    }

    fn reconcile_scenario(&self, scenario: &Scenario) -> CatalogResult<Reconciled<Scenario>> {
        self.write_tx("reconcile_scenario", |conn| {
            reconcile_scenario_in(conn, scenario)
        })
    }

    fn reconcile_layer(&self, layer: &Layer) -> CatalogResult<Reconciled<Layer>> {
        self.write_tx("reconcile_layer", |conn| reconcile_layer_in(conn, layer))
    }

    fn reconcile_shapegrid(&self, grid: &ShapeGrid) -> CatalogResult<Reconciled<ShapeGrid>> {
        self.write_tx("reconcile_shapegrid", |conn| {
            reconcile_shapegrid_in(conn, grid)
        })
    }

    fn reconcile_tree(&self, tree: &Tree) -> CatalogResult<Reconciled<Tree>> {
        self.write_tx("reconcile_tree", |conn| reconcile_tree_in(conn, tree))
    }

    fn reconcile_gridset(&self, gridset: &Gridset) -> CatalogResult<Reconciled<Gridset>> {
        self.write_tx("reconcile_gridset", |conn| {
            reconcile_gridset_in(conn, gridset)
        })
    }

    fn reconcile_matrix(&self, matrix: &Matrix) -> CatalogResult<Reconciled<Matrix>> {
        self.write_tx("reconcile_matrix", |conn| reconcile_matrix_in(conn, matrix))
    }

    fn reconcile_matrix_column(
        &self,
        column: &MatrixColumn,
    ) -> CatalogResult<Reconciled<MatrixColumn>> {
        self.write_tx("reconcile_matrix_column", |conn| {
            reconcile_column_in(conn, column)
        })
    }

    fn get_user(&self, user_id: &str) -> CatalogResult<Option<User>> {
        select_user(self.conn, user_id)
    }

    fn get_taxon_source(&self, lookup: Lookup<'_>) -> CatalogResult<Option<TaxonSource>> {
        select_by_lookup(
            self.conn,
            TAXON_SOURCE_SELECT_SQL,
            "name",
            lookup,
            parse_taxon_source_row,
        )
    }

    fn get_algorithm(&self, lookup: Lookup<'_>) -> CatalogResult<Option<Algorithm>> {
        select_by_lookup(
            self.conn,
            ALGORITHM_SELECT_SQL,
            "code",
            lookup,
            parse_algorithm_row,
        )
    }

    fn get_scenario_package(&self, lookup: Lookup<'_>) -> CatalogResult<Option<ScenarioPackage>> {
        let Some(mut package) = select_package(self.conn, lookup)? else {
            return Ok(None);
        };
        if let Some(id) = package.id {
            package.scenarios = select_package_scenarios(self.conn, id)?;
        }
        Ok(Some(package))
    }

    fn get_scenario(&self, lookup: Lookup<'_>) -> CatalogResult<Option<Scenario>> {
        let Some(mut scenario) = select_scenario(self.conn, lookup)? else {
            return Ok(None);
        };
        if let Some(id) = scenario.id {
            scenario.layers = select_scenario_layers(self.conn, id)?;
        }
        Ok(Some(scenario))
    }

    fn get_layer(&self, lookup: Lookup<'_>) -> CatalogResult<Option<Layer>> {
        select_layer(self.conn, lookup)
    }

    fn layer_links(&self, scenario_id: EntityId) -> CatalogResult<Vec<(EntityId, LayerLink)>> {
        query_all(
            self.conn,
            "SELECT layer_id, role FROM scenario_layers WHERE scenario_id = ?1 ORDER BY position",
            [scenario_id.to_string()],
            |row| {
                let layer_id = parse_uuid(&row.get::<_, String>("layer_id")?, "layer_id")?;
                let role: String = row.get("role")?;
                let link = LayerLink::parse(&role).ok_or_else(|| {
                    CatalogError::InvalidData(format!("invalid layer role `{role}`"))
                })?;
                Ok((layer_id, link))
            },
        )
    }

    fn get_shapegrid(&self, lookup: Lookup<'_>) -> CatalogResult<Option<ShapeGrid>> {
        select_shapegrid(self.conn, lookup)
    }

    fn get_tree(&self, lookup: Lookup<'_>) -> CatalogResult<Option<Tree>> {
        select_by_lookup(self.conn, TREE_SELECT_SQL, "name", lookup, parse_tree_row)
    }

    fn get_gridset(&self, lookup: Lookup<'_>) -> CatalogResult<Option<Gridset>> {
        let Some(mut gridset) = select_gridset(self.conn, lookup)? else {
            return Ok(None);
        };
        if let Some(id) = gridset.id {
            gridset.matrices = select_gridset_matrices(self.conn, id)?;
        }
        Ok(Some(gridset))
    }

    fn get_matrix(&self, id: EntityId) -> CatalogResult<Option<Matrix>> {
        let Some(mut matrix) = select_matrix_by_id(self.conn, id)? else {
            return Ok(None);
        };
        matrix.columns = select_matrix_columns(self.conn, id)?;
        Ok(Some(matrix))
    }

    fn find_matrix(
        &self,
        owner: &str,
        gridset_id: EntityId,
        matrix_type: MatrixType,
        scenario_id: Option<EntityId>,
    ) -> CatalogResult<Option<Matrix>> {
        let Some(mut matrix) =
            select_matrix_by_key(self.conn, owner, gridset_id, matrix_type, scenario_id)?
        else {
            return Ok(None);
        };
        if let Some(id) = matrix.id {
            matrix.columns = select_matrix_columns(self.conn, id)?;
        }
        Ok(Some(matrix))
    }

    fn list_matrices_for_gridset(&self, gridset_id: EntityId) -> CatalogResult<Vec<Matrix>> {
        select_gridset_matrices(self.conn, gridset_id)
    }

    fn get_matrix_column(&self, id: EntityId) -> CatalogResult<Option<MatrixColumn>> {
        select_column_by_id(self.conn, id)
    }

    fn list_matrix_columns(&self, matrix_id: EntityId) -> CatalogResult<Vec<MatrixColumn>> {
        select_matrix_columns(self.conn, matrix_id)
    }

    fn update_shapegrid(&self, grid: &ShapeGrid) -> CatalogResult<()> {
        self.write_tx("update_shapegrid", |conn| update_shapegrid_row(conn, grid))
    }

    fn update_gridset(&self, gridset: &Gridset) -> CatalogResult<()> {
        self.write_tx("update_gridset", |conn| update_gridset_row(conn, gridset))
    }

    fn update_matrix(&self, matrix: &Matrix) -> CatalogResult<()> {
        self.write_tx("update_matrix", |conn| update_matrix_row(conn, matrix))
    }

    fn update_matrix_column(&self, column: &MatrixColumn) -> CatalogResult<()> {
        self.write_tx("update_matrix_column", |conn| {
            update_column_row(conn, column)
        })
    }

    fn delete_gridset(&self, id: EntityId) -> CatalogResult<Vec<String>> {
        self.write_tx("delete_gridset", |conn| {
            let documents = query_all(
                conn,
                "SELECT dlocation FROM chains WHERE gridset_id = ?1 AND dlocation IS NOT NULL",
                [id.to_string()],
                |row| Ok(row.get::<_, String>("dlocation")?),
            )?;
            conn.execute("DELETE FROM chains WHERE gridset_id = ?1;", [id.to_string()])?;
            let deleted = conn.execute("DELETE FROM gridsets WHERE id = ?1;", [id.to_string()])?;
            if deleted == 0 {
                return Err(CatalogError::not_found(EntityKind::Gridset, id));
            }
            Ok(documents)
        })
    }
}

/// Shared find-or-insert flow.
///
/// `merge` folds the candidate into a stored row and persists it. `insert`
/// returns `None` when a concurrent writer inserted the key first; the
/// winner is then re-read and merged.
fn reconcile_entity<T: OwnerScoped>(
    kind: EntityKind,
    candidate: &impl OwnerScoped,
    by_id: impl Fn(EntityId) -> CatalogResult<Option<T>>,
    by_key: impl Fn() -> CatalogResult<Option<T>>,
    merge: impl Fn(T) -> CatalogResult<T>,
    insert: impl Fn(EntityId) -> CatalogResult<Option<T>>,
) -> CatalogResult<Reconciled<T>> {
    let stored = match candidate.catalog_id() {
        // Ids are never resolved across owners.
        Some(id) => match by_id(id)? {
            Some(stored) if stored.owner() == candidate.owner() => Some(stored),
            Some(stored) => {
                warn!(
                    "event=reconcile module=catalog status=error kind={} id={} owner={} stored_owner={}",
                    kind,
                    id,
                    candidate.owner(),
                    stored.owner()
                );
                return Err(CatalogError::not_found(kind, id));
            }
            None => return Err(CatalogError::not_found(kind, id)),
        },
        None => by_key()?,
    };

    let reconciled = if let Some(stored) = stored {
        Reconciled::preexisting(merge(stored)?)
    } else if let Some(created) = insert(Uuid::new_v4())? {
        Reconciled::created(created)
    } else {
        let winner = by_key()?.ok_or_else(|| {
            CatalogError::InvalidData(format!("{kind} missing after insert conflict"))
        })?;
        Reconciled::preexisting(merge(winner)?)
    };

    debug!(
        "event=reconcile module=catalog status=ok kind={} preexisting={}",
        kind, reconciled.was_preexisting
    );
    Ok(reconciled)
}

fn reconcile_user_in(conn: &Connection, candidate: &User) -> CatalogResult<Reconciled<User>> {
    let merge = |mut stored: User| -> CatalogResult<User> {
        if candidate.email.is_some() {
            stored.email.clone_from(&candidate.email);
        }
        stored.metadata.merge_from(&candidate.metadata);
        stored.mod_time = candidate.mod_time;
        conn.execute(
            "UPDATE users SET email = ?1, metadata = ?2, mod_time = ?3 WHERE user_id = ?4;",
            params![
                stored.email.as_deref(),
                stored.metadata.to_json()?,
                stored.mod_time,
                stored.user_id.as_str(),
            ],
        )?;
        Ok(stored)
    };

    if let Some(stored) = select_user(conn, &candidate.user_id)? {
        return Ok(Reconciled::preexisting(merge(stored)?));
    }

    let inserted = conn.execute(
        "INSERT INTO users (user_id, email, metadata, mod_time)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT DO NOTHING;",
        params![
            candidate.user_id.as_str(),
            candidate.email.as_deref(),
            candidate.metadata.to_json()?,
            candidate.mod_time,
        ],
    )?;
    if inserted == 0 {
        let stored = select_user(conn, &candidate.user_id)?
            .ok_or_else(|| CatalogError::not_found(EntityKind::User, &candidate.user_id))?;
        return Ok(Reconciled::preexisting(merge(stored)?));
    }
    Ok(Reconciled::created(candidate.clone()))
}

fn reconcile_taxon_source_in(
    conn: &Connection,
    candidate: &TaxonSource,
) -> CatalogResult<Reconciled<TaxonSource>> {
    let key = Lookup::Key {
        owner: &candidate.owner,
        name: &candidate.name,
    };
    let select = |lookup| {
        select_by_lookup(
            conn,
            TAXON_SOURCE_SELECT_SQL,
            "name",
            lookup,
            parse_taxon_source_row,
        )
    };
    reconcile_entity(
        EntityKind::TaxonSource,
        candidate,
        |id| select(Lookup::Id(id)),
        || select(key),
        |mut stored| {
            if candidate.url.is_some() {
                stored.url.clone_from(&candidate.url);
            }
            stored.mod_time = candidate.mod_time;
            conn.execute(
                "UPDATE taxon_sources SET url = ?1, mod_time = ?2 WHERE id = ?3;",
                params![stored.url.as_deref(), stored.mod_time, id_text(stored.id)],
            )?;
            Ok(stored)
        },
        |id| {
            let mut entity = candidate.clone();
            entity.id = Some(id);
            let inserted = conn.execute(
                "INSERT INTO taxon_sources (id, owner, name, url, mod_time)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT DO NOTHING;",
                params![
                    id.to_string(),
                    entity.owner.as_str(),
                    entity.name.as_str(),
                    entity.url.as_deref(),
                    entity.mod_time,
                ],
            )?;
            Ok((inserted > 0).then_some(entity))
        },
    )
}

fn reconcile_algorithm_in(
    conn: &Connection,
    candidate: &Algorithm,
) -> CatalogResult<Reconciled<Algorithm>> {
    let key = Lookup::Key {
        owner: &candidate.owner,
        name: &candidate.code,
    };
    let select = |lookup| {
        select_by_lookup(
            conn,
            ALGORITHM_SELECT_SQL,
            "code",
            lookup,
            parse_algorithm_row,
        )
    };
    reconcile_entity(
        EntityKind::Algorithm,
        candidate,
        |id| select(Lookup::Id(id)),
        || select(key),
        |mut stored| {
            if candidate.name.is_some() {
                stored.name.clone_from(&candidate.name);
            }
            stored.parameters.merge_from(&candidate.parameters);
            stored.metadata.merge_from(&candidate.metadata);
            stored.mod_time = candidate.mod_time;
            conn.execute(
                "UPDATE algorithms
                 SET name = ?1, parameters = ?2, metadata = ?3, mod_time = ?4
                 WHERE id = ?5;",
                params![
                    stored.name.as_deref(),
                    stored.parameters.to_json()?,
                    stored.metadata.to_json()?,
                    stored.mod_time,
                    id_text(stored.id),
                ],
            )?;
            Ok(stored)
        },
        |id| {
            let mut entity = candidate.clone();
            entity.id = Some(id);
            let inserted = conn.execute(
                "INSERT INTO algorithms (id, owner, code, name, parameters, metadata, mod_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT DO NOTHING;",
                params![
                    id.to_string(),
                    entity.owner.as_str(),
                    entity.code.as_str(),
                    entity.name.as_deref(),
                    entity.parameters.to_json()?,
                    entity.metadata.to_json()?,
                    entity.mod_time,
                ],
            )?;
            Ok((inserted > 0).then_some(entity))
        },
    )
}

fn reconcile_package_in(
    conn: &Connection,
    candidate: &ScenarioPackage,
) -> CatalogResult<Reconciled<ScenarioPackage>> {
    let mut spatial = candidate.spatial.clone();
    if spatial.bbox.is_none() {
        spatial.bbox = candidate.derived_bbox();
    }

    let key = Lookup::Key {
        owner: &candidate.owner,
        name: &candidate.name,
    };
    let reconciled = reconcile_entity(
        EntityKind::ScenarioPackage,
        candidate,
        |id| select_package(conn, Lookup::Id(id)),
        || select_package(conn, key),
        |mut stored| {
            if candidate.base_code.is_some() {
                stored.base_code.clone_from(&candidate.base_code);
            }
            stored.spatial.merge_from(&spatial);
            stored.metadata.merge_from(&candidate.metadata);
            stored.mod_time = candidate.mod_time;
            conn.execute(
                "UPDATE scenario_packages
                 SET base_code = ?1, epsg = ?2, map_units = ?3, resolution = ?4, bbox = ?5,
                     dlocation = ?6, data_format = ?7, metadata = ?8, mod_time = ?9
                 WHERE id = ?10;",
                params![
                    stored.base_code.as_deref(),
                    stored.spatial.epsg,
                    stored.spatial.map_units.as_deref(),
                    stored.spatial.resolution,
                    bbox_text(&stored.spatial),
                    stored.spatial.dlocation.as_deref(),
                    stored.spatial.data_format.as_deref(),
                    stored.metadata.to_json()?,
                    stored.mod_time,
                    id_text(stored.id),
                ],
            )?;
            Ok(stored)
        },
        |id| {
            let mut entity = candidate.clone();
            entity.id = Some(id);
            entity.spatial = spatial.clone();
            entity.scenarios = Vec::new();
            let inserted = conn.execute(
                "INSERT INTO scenario_packages (
                    id, owner, name, base_code,
                    epsg, map_units, resolution, bbox, dlocation, data_format,
                    metadata, mod_time
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT DO NOTHING;",
                params![
                    id.to_string(),
                    entity.owner.as_str(),
                    entity.name.as_str(),
                    entity.base_code.as_deref(),
                    entity.spatial.epsg,
                    entity.spatial.map_units.as_deref(),
                    entity.spatial.resolution,
                    bbox_text(&entity.spatial),
                    entity.spatial.dlocation.as_deref(),
                    entity.spatial.data_format.as_deref(),
                    entity.metadata.to_json()?,
                    entity.mod_time,
                ],
            )?;
            Ok((inserted > 0).then_some(entity))
        },
    )?;

    let package_id = reconciled
        .entity
        .id
        .ok_or(CatalogError::MissingIdentity(EntityKind::ScenarioPackage))?;
    let mut scenarios = Vec::with_capacity(candidate.scenarios.len());
    for scenario in &candidate.scenarios {
        let mut child = scenario.clone();
        child.package_id = Some(package_id);
        scenarios.push(reconcile_scenario_in(conn, &child)?.entity);
    }

    Ok(reconciled.map(|mut package| {
        package.scenarios = scenarios;
        package
    }))
}

fn reconcile_scenario_in(
    conn: &Connection,
    candidate: &Scenario,
) -> CatalogResult<Reconciled<Scenario>> {
    let key = Lookup::Key {
        owner: &candidate.owner,
        name: &candidate.code,
    };
    let reconciled = reconcile_entity(
        EntityKind::Scenario,
        candidate,
        |id| select_scenario(conn, Lookup::Id(id)),
        || select_scenario(conn, key),
        |mut stored| {
            if candidate.package_id.is_some() {
                stored.package_id = candidate.package_id;
            }
            stored.spatial.merge_from(&candidate.spatial);
            stored.metadata.merge_from(&candidate.metadata);
            stored.mod_time = candidate.mod_time;
            conn.execute(
                "UPDATE scenarios
                 SET package_id = ?1, epsg = ?2, map_units = ?3, resolution = ?4, bbox = ?5,
                     dlocation = ?6, data_format = ?7, metadata = ?8, mod_time = ?9
                 WHERE id = ?10;",
                params![
                    stored.package_id.map(|id| id.to_string()),
                    stored.spatial.epsg,
                    stored.spatial.map_units.as_deref(),
                    stored.spatial.resolution,
                    bbox_text(&stored.spatial),
                    stored.spatial.dlocation.as_deref(),
                    stored.spatial.data_format.as_deref(),
                    stored.metadata.to_json()?,
                    stored.mod_time,
                    id_text(stored.id),
                ],
            )?;
            Ok(stored)
        },
        |id| {
            let mut entity = candidate.clone();
            entity.id = Some(id);
            entity.layers = Vec::new();
            let inserted = conn.execute(
                "INSERT INTO scenarios (
                    id, owner, package_id, code,
                    epsg, map_units, resolution, bbox, dlocation, data_format,
                    metadata, mod_time
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT DO NOTHING;",
                params![
                    id.to_string(),
                    entity.owner.as_str(),
                    entity.package_id.map(|id| id.to_string()),
                    entity.code.as_str(),
                    entity.spatial.epsg,
                    entity.spatial.map_units.as_deref(),
                    entity.spatial.resolution,
                    bbox_text(&entity.spatial),
                    entity.spatial.dlocation.as_deref(),
                    entity.spatial.data_format.as_deref(),
                    entity.metadata.to_json()?,
                    entity.mod_time,
                ],
            )?;
            Ok((inserted > 0).then_some(entity))
        },
    )?;

    let scenario_id = reconciled
        .entity
        .id
        .ok_or(CatalogError::MissingIdentity(EntityKind::Scenario))?;
    for (position, layer) in candidate.layers.iter().enumerate() {
        let stored = reconcile_layer_in(conn, layer)?.entity;
        let layer_id = stored
            .id
            .ok_or(CatalogError::MissingIdentity(EntityKind::Layer))?;
        link_layer(conn, scenario_id, layer_id, position)?;
    }

    let layers = select_scenario_layers(conn, scenario_id)?;
    Ok(reconciled.map(|mut scenario| {
        scenario.layers = layers;
        scenario
    }))
}

fn link_layer(
    conn: &Connection,
    scenario_id: EntityId,
    layer_id: EntityId,
    position: usize,
) -> CatalogResult<()> {
    let position = i64::try_from(position)
        .map_err(|_| CatalogError::InvalidData(format!("layer position {position} overflows")))?;
    conn.execute(
        "INSERT INTO scenario_layers (scenario_id, layer_id, role, position)
         VALUES (
            ?1,
            ?2,
            CASE
                WHEN EXISTS (
                    SELECT 1 FROM scenario_layers WHERE layer_id = ?2 AND role = 'owned'
                ) THEN 'shared'
                ELSE 'owned'
            END,
            ?3
         )
         ON CONFLICT (scenario_id, layer_id) DO UPDATE SET position = excluded.position;",
        params![scenario_id.to_string(), layer_id.to_string(), position],
    )?;
    Ok(())
}

fn reconcile_layer_in(conn: &Connection, candidate: &Layer) -> CatalogResult<Reconciled<Layer>> {
    let key = Lookup::Key {
        owner: &candidate.owner,
        name: &candidate.name,
    };
    reconcile_entity(
        EntityKind::Layer,
        candidate,
        |id| select_layer(conn, Lookup::Id(id)),
        || select_layer(conn, key),
        |mut stored| {
            if candidate.squid.is_some() {
                stored.squid.clone_from(&candidate.squid);
            }
            if candidate.env_code.is_some() {
                stored.env_code.clone_from(&candidate.env_code);
            }
            stored.spatial.merge_from(&candidate.spatial);
            stored.metadata.merge_from(&candidate.metadata);
            stored.mod_time = candidate.mod_time;
            conn.execute(
                "UPDATE layers
                 SET squid = ?1, env_code = ?2, epsg = ?3, map_units = ?4, resolution = ?5,
                     bbox = ?6, dlocation = ?7, data_format = ?8, metadata = ?9, mod_time = ?10
                 WHERE id = ?11;",
                params![
                    stored.squid.as_deref(),
                    stored.env_code.as_deref(),
                    stored.spatial.epsg,
                    stored.spatial.map_units.as_deref(),
                    stored.spatial.resolution,
                    bbox_text(&stored.spatial),
                    stored.spatial.dlocation.as_deref(),
                    stored.spatial.data_format.as_deref(),
                    stored.metadata.to_json()?,
                    stored.mod_time,
                    id_text(stored.id),
                ],
            )?;
            Ok(stored)
        },
        |id| {
            let mut entity = candidate.clone();
            entity.id = Some(id);
            let inserted = conn.execute(
                "INSERT INTO layers (
                    id, owner, name, squid, env_code,
                    epsg, map_units, resolution, bbox, dlocation, data_format,
                    metadata, mod_time
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT DO NOTHING;",
                params![
                    id.to_string(),
                    entity.owner.as_str(),
                    entity.name.as_str(),
                    entity.squid.as_deref(),
                    entity.env_code.as_deref(),
                    entity.spatial.epsg,
                    entity.spatial.map_units.as_deref(),
                    entity.spatial.resolution,
                    bbox_text(&entity.spatial),
                    entity.spatial.dlocation.as_deref(),
                    entity.spatial.data_format.as_deref(),
                    entity.metadata.to_json()?,
                    entity.mod_time,
                ],
            )?;
            Ok((inserted > 0).then_some(entity))
        },
    )
}

fn reconcile_shapegrid_in(
    conn: &Connection,
    candidate: &ShapeGrid,
) -> CatalogResult<Reconciled<ShapeGrid>> {
    let key = Lookup::Key {
        owner: &candidate.owner,
        name: &candidate.name,
    };
    reconcile_entity(
        EntityKind::ShapeGrid,
        candidate,
        |id| select_shapegrid(conn, Lookup::Id(id)),
        || select_shapegrid(conn, key),
        |mut stored| {
            stored.cell_sides = candidate.cell_sides;
            stored.cell_size = candidate.cell_size;
            stored.spatial.merge_from(&candidate.spatial);
            stored.metadata.merge_from(&candidate.metadata);
            let status = Status::merge_on_reconcile(stored.status, candidate.status);
            if status != stored.status {
                stored.status = status;
                stored.status_mod_time = candidate.mod_time;
            }
            stored.mod_time = candidate.mod_time;
            update_shapegrid_row(conn, &stored)?;
            Ok(stored)
        },
        |id| {
            let mut entity = candidate.clone();
            entity.id = Some(id);
            let inserted = conn.execute(
                "INSERT INTO shapegrids (
                    id, owner, name, cell_sides, cell_size,
                    epsg, map_units, resolution, bbox, dlocation, data_format,
                    status, status_mod_time, metadata, mod_time
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT DO NOTHING;",
                params![
                    id.to_string(),
                    entity.owner.as_str(),
                    entity.name.as_str(),
                    entity.cell_sides,
                    entity.cell_size,
                    entity.spatial.epsg,
                    entity.spatial.map_units.as_deref(),
                    entity.spatial.resolution,
                    bbox_text(&entity.spatial),
                    entity.spatial.dlocation.as_deref(),
                    entity.spatial.data_format.as_deref(),
                    entity.status.as_db(),
                    entity.status_mod_time,
                    entity.metadata.to_json()?,
                    entity.mod_time,
                ],
            )?;
            Ok((inserted > 0).then_some(entity))
        },
    )
}

fn reconcile_tree_in(conn: &Connection, candidate: &Tree) -> CatalogResult<Reconciled<Tree>> {
    let key = Lookup::Key {
        owner: &candidate.owner,
        name: &candidate.name,
    };
    let select =
        |lookup| select_by_lookup(conn, TREE_SELECT_SQL, "name", lookup, parse_tree_row);
    reconcile_entity(
        EntityKind::Tree,
        candidate,
        |id| select(Lookup::Id(id)),
        || select(key),
        |mut stored| {
            if candidate.dlocation.is_some() {
                stored.dlocation.clone_from(&candidate.dlocation);
            }
            stored.metadata.merge_from(&candidate.metadata);
            stored.mod_time = candidate.mod_time;
            conn.execute(
                "UPDATE trees SET dlocation = ?1, metadata = ?2, mod_time = ?3 WHERE id = ?4;",
                params![
                    stored.dlocation.as_deref(),
                    stored.metadata.to_json()?,
                    stored.mod_time,
                    id_text(stored.id),
                ],
            )?;
            Ok(stored)
        },
        |id| {
            let mut entity = candidate.clone();
            entity.id = Some(id);
            let inserted = conn.execute(
                "INSERT INTO trees (id, owner, name, dlocation, metadata, mod_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT DO NOTHING;",
                params![
                    id.to_string(),
                    entity.owner.as_str(),
                    entity.name.as_str(),
                    entity.dlocation.as_deref(),
                    entity.metadata.to_json()?,
                    entity.mod_time,
                ],
            )?;
            Ok((inserted > 0).then_some(entity))
        },
    )
}

fn reconcile_gridset_in(
    conn: &Connection,
    candidate: &Gridset,
) -> CatalogResult<Reconciled<Gridset>> {
    let key = Lookup::Key {
        owner: &candidate.owner,
        name: &candidate.name,
    };
    let reconciled = reconcile_entity(
        EntityKind::Gridset,
        candidate,
        |id| select_gridset(conn, Lookup::Id(id)),
        || select_gridset(conn, key),
        |mut stored| {
            if candidate.shapegrid_id.is_some() {
                stored.shapegrid_id = candidate.shapegrid_id;
            }
            if candidate.tree_id.is_some() {
                stored.tree_id = candidate.tree_id;
            }
            if candidate.epsg.is_some() {
                stored.epsg = candidate.epsg;
            }
            stored.metadata.merge_from(&candidate.metadata);
            stored.mod_time = candidate.mod_time;
            update_gridset_row(conn, &stored)?;
            Ok(stored)
        },
        |id| {
            let shapegrid_id = candidate.shapegrid_id.ok_or(CatalogError::MissingParent {
                kind: EntityKind::Gridset,
                parent: EntityKind::ShapeGrid,
            })?;
            let mut entity = candidate.clone();
            entity.id = Some(id);
            entity.matrices = Vec::new();
            let inserted = conn.execute(
                "INSERT INTO gridsets (
                    id, owner, name, shapegrid_id, tree_id, epsg, metadata, mod_time
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT DO NOTHING;",
                params![
                    id.to_string(),
                    entity.owner.as_str(),
                    entity.name.as_str(),
                    shapegrid_id.to_string(),
                    entity.tree_id.map(|id| id.to_string()),
                    entity.epsg,
                    entity.metadata.to_json()?,
                    entity.mod_time,
                ],
            )?;
            Ok((inserted > 0).then_some(entity))
        },
    )?;

    let gridset_id = reconciled
        .entity
        .id
        .ok_or(CatalogError::MissingIdentity(EntityKind::Gridset))?;
    let mut matrices = Vec::with_capacity(candidate.matrices.len());
    for matrix in &candidate.matrices {
        let mut child = matrix.clone();
        child.gridset_id = Some(gridset_id);
        matrices.push(reconcile_matrix_in(conn, &child)?.entity);
    }

    Ok(reconciled.map(|mut gridset| {
        gridset.matrices = matrices;
        gridset
    }))
}

fn reconcile_matrix_in(conn: &Connection, candidate: &Matrix) -> CatalogResult<Reconciled<Matrix>> {
    let gridset_id = candidate.gridset_id.ok_or(CatalogError::MissingParent {
        kind: EntityKind::Matrix,
        parent: EntityKind::Gridset,
    })?;
    let reconciled = reconcile_entity(
        EntityKind::Matrix,
        candidate,
        |id| select_matrix_by_id(conn, id),
        || {
            select_matrix_by_key(
                conn,
                &candidate.owner,
                gridset_id,
                candidate.matrix_type,
                candidate.scenario_id,
            )
        },
        |mut stored| {
            if candidate.dlocation.is_some() {
                stored.dlocation.clone_from(&candidate.dlocation);
            }
            stored.metadata.merge_from(&candidate.metadata);
            let status = Status::merge_on_reconcile(stored.status, candidate.status);
            if status != stored.status {
                stored.status = status;
                stored.status_mod_time = candidate.mod_time;
            }
            stored.mod_time = candidate.mod_time;
            update_matrix_row(conn, &stored)?;
            Ok(stored)
        },
        |id| {
            let mut entity = candidate.clone();
            entity.id = Some(id);
            entity.columns = Vec::new();
            let inserted = conn.execute(
                "INSERT INTO matrices (
                    id, owner, gridset_id, matrix_type, scenario_id, dlocation,
                    status, status_mod_time, metadata, mod_time
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT DO NOTHING;",
                params![
                    id.to_string(),
                    entity.owner.as_str(),
                    gridset_id.to_string(),
                    entity.matrix_type.as_db(),
                    entity.scenario_id.map(|id| id.to_string()),
                    entity.dlocation.as_deref(),
                    entity.status.as_db(),
                    entity.status_mod_time,
                    entity.metadata.to_json()?,
                    entity.mod_time,
                ],
            )?;
            Ok((inserted > 0).then_some(entity))
        },
    )?;

    let matrix_id = reconciled
        .entity
        .id
        .ok_or(CatalogError::MissingIdentity(EntityKind::Matrix))?;
    for column in &candidate.columns {
        let mut child = column.clone();
        child.matrix_id = Some(matrix_id);
        reconcile_column_in(conn, &child)?;
    }

    let columns = select_matrix_columns(conn, matrix_id)?;
    Ok(reconciled.map(|mut matrix| {
        matrix.columns = columns;
        matrix
    }))
}

fn reconcile_column_in(
    conn: &Connection,
    candidate: &MatrixColumn,
) -> CatalogResult<Reconciled<MatrixColumn>> {
    let matrix_id = candidate.matrix_id.ok_or(CatalogError::MissingParent {
        kind: EntityKind::MatrixColumn,
        parent: EntityKind::Matrix,
    })?;
    reconcile_entity(
        EntityKind::MatrixColumn,
        candidate,
        |id| select_column_by_id(conn, id),
        || {
            query_optional(
                conn,
                &format!("{COLUMN_SELECT_SQL} WHERE matrix_id = ?1 AND ident = ?2"),
                params![matrix_id.to_string(), candidate.ident.as_str()],
                parse_column_row,
            )
        },
        |mut stored| {
            if candidate.layer_id.is_some() {
                stored.layer_id = candidate.layer_id;
            }
            if candidate.squid.is_some() {
                stored.squid.clone_from(&candidate.squid);
            }
            if candidate.dlocation.is_some() {
                stored.dlocation.clone_from(&candidate.dlocation);
            }
            stored.intersect_params.merge_from(&candidate.intersect_params);
            stored.metadata.merge_from(&candidate.metadata);
            let status = Status::merge_on_reconcile(stored.status, candidate.status);
            if status != stored.status {
                stored.status = status;
                stored.status_mod_time = candidate.mod_time;
            }
            stored.mod_time = candidate.mod_time;
            update_column_row(conn, &stored)?;
            Ok(stored)
        },
        |id| {
            let inserted = conn.execute(
                "INSERT INTO matrix_columns (
                    id, owner, matrix_id, layer_id, column_index, ident, squid,
                    intersect_params, dlocation, status, status_mod_time, metadata, mod_time
                 ) VALUES (
                    ?1, ?2, ?3, ?4,
                    (SELECT COALESCE(MAX(column_index), -1) + 1
                     FROM matrix_columns WHERE matrix_id = ?3),
                    ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12
                 )
                 ON CONFLICT DO NOTHING;",
                params![
                    id.to_string(),
                    candidate.owner.as_str(),
                    matrix_id.to_string(),
                    candidate.layer_id.map(|id| id.to_string()),
                    candidate.ident.as_str(),
                    candidate.squid.as_deref(),
                    candidate.intersect_params.to_json()?,
                    candidate.dlocation.as_deref(),
                    candidate.status.as_db(),
                    candidate.status_mod_time,
                    candidate.metadata.to_json()?,
                    candidate.mod_time,
                ],
            )?;
            if inserted == 0 {
                return Ok(None);
            }
            select_column_by_id(conn, id)
        },
    )
}

fn update_shapegrid_row(conn: &Connection, grid: &ShapeGrid) -> CatalogResult<()> {
    let id = grid
        .id
        .ok_or(CatalogError::MissingIdentity(EntityKind::ShapeGrid))?;
    let changed = conn.execute(
        "UPDATE shapegrids
         SET cell_sides = ?1, cell_size = ?2, epsg = ?3, map_units = ?4, resolution = ?5,
             bbox = ?6, dlocation = ?7, data_format = ?8, status = ?9, status_mod_time = ?10,
             metadata = ?11, mod_time = ?12
         WHERE id = ?13;",
        params![
            grid.cell_sides,
            grid.cell_size,
            grid.spatial.epsg,
            grid.spatial.map_units.as_deref(),
            grid.spatial.resolution,
            bbox_text(&grid.spatial),
            grid.spatial.dlocation.as_deref(),
            grid.spatial.data_format.as_deref(),
            grid.status.as_db(),
            grid.status_mod_time,
            grid.metadata.to_json()?,
            grid.mod_time,
            id.to_string(),
        ],
    )?;
    expect_changed(changed, EntityKind::ShapeGrid, id)
}

fn update_gridset_row(conn: &Connection, gridset: &Gridset) -> CatalogResult<()> {
    let id = gridset
        .id
        .ok_or(CatalogError::MissingIdentity(EntityKind::Gridset))?;
    let shapegrid_id = gridset.shapegrid_id.ok_or(CatalogError::MissingParent {
        kind: EntityKind::Gridset,
        parent: EntityKind::ShapeGrid,
    })?;
    let changed = conn.execute(
        "UPDATE gridsets
         SET shapegrid_id = ?1, tree_id = ?2, epsg = ?3, metadata = ?4, mod_time = ?5
         WHERE id = ?6;",
        params![
            shapegrid_id.to_string(),
            gridset.tree_id.map(|id| id.to_string()),
            gridset.epsg,
            gridset.metadata.to_json()?,
            gridset.mod_time,
            id.to_string(),
        ],
    )?;
    expect_changed(changed, EntityKind::Gridset, id)
}

fn update_matrix_row(conn: &Connection, matrix: &Matrix) -> CatalogResult<()> {
    let id = matrix
        .id
        .ok_or(CatalogError::MissingIdentity(EntityKind::Matrix))?;
    let changed = conn.execute(
        "UPDATE matrices
         SET dlocation = ?1, status = ?2, status_mod_time = ?3, metadata = ?4, mod_time = ?5
         WHERE id = ?6;",
        params![
            matrix.dlocation.as_deref(),
            matrix.status.as_db(),
            matrix.status_mod_time,
            matrix.metadata.to_json()?,
            matrix.mod_time,
            id.to_string(),
        ],
    )?;
    expect_changed(changed, EntityKind::Matrix, id)
}

fn update_column_row(conn: &Connection, column: &MatrixColumn) -> CatalogResult<()> {
    let id = column
        .id
        .ok_or(CatalogError::MissingIdentity(EntityKind::MatrixColumn))?;
    let changed = conn.execute(
        "UPDATE matrix_columns
         SET layer_id = ?1, squid = ?2, intersect_params = ?3, dlocation = ?4, status = ?5,
             status_mod_time = ?6, metadata = ?7, mod_time = ?8
         WHERE id = ?9;",
        params![
            column.layer_id.map(|id| id.to_string()),
            column.squid.as_deref(),
            column.intersect_params.to_json()?,
            column.dlocation.as_deref(),
            column.status.as_db(),
            column.status_mod_time,
            column.metadata.to_json()?,
            column.mod_time,
            id.to_string(),
        ],
    )?;
    expect_changed(changed, EntityKind::MatrixColumn, id)
}

fn expect_changed(changed: usize, kind: EntityKind, id: EntityId) -> CatalogResult<()> {
    if changed == 0 {
        return Err(CatalogError::not_found(kind, id));
    }
    Ok(())
}

fn select_user(conn: &Connection, user_id: &str) -> CatalogResult<Option<User>> {
    query_optional(
        conn,
        &format!("{USER_SELECT_SQL} WHERE user_id = ?1"),
        [user_id],
        |row| {
            Ok(User {
                user_id: row.get("user_id")?,
                email: row.get("email")?,
                metadata: parse_metadata(row, "metadata")?,
                mod_time: row.get("mod_time")?,
            })
        },
    )
}

fn select_package(conn: &Connection, lookup: Lookup<'_>) -> CatalogResult<Option<ScenarioPackage>> {
    select_by_lookup(conn, PACKAGE_SELECT_SQL, "name", lookup, parse_package_row)
}

fn select_package_scenarios(conn: &Connection, package_id: EntityId) -> CatalogResult<Vec<Scenario>> {
    let mut scenarios = query_all(
        conn,
        &format!("{SCENARIO_SELECT_SQL} WHERE package_id = ?1 ORDER BY rowid"),
        [package_id.to_string()],
        parse_scenario_row,
    )?;
    for scenario in &mut scenarios {
        if let Some(id) = scenario.id {
            scenario.layers = select_scenario_layers(conn, id)?;
        }
    }
    Ok(scenarios)
}

fn select_scenario(conn: &Connection, lookup: Lookup<'_>) -> CatalogResult<Option<Scenario>> {
    select_by_lookup(conn, SCENARIO_SELECT_SQL, "code", lookup, parse_scenario_row)
}

fn select_scenario_layers(conn: &Connection, scenario_id: EntityId) -> CatalogResult<Vec<Layer>> {
    query_all(
        conn,
        SCENARIO_LAYERS_SQL,
        [scenario_id.to_string()],
        parse_layer_row,
    )
}

fn select_layer(conn: &Connection, lookup: Lookup<'_>) -> CatalogResult<Option<Layer>> {
    select_by_lookup(conn, LAYER_SELECT_SQL, "name", lookup, parse_layer_row)
}

fn select_shapegrid(conn: &Connection, lookup: Lookup<'_>) -> CatalogResult<Option<ShapeGrid>> {
    select_by_lookup(conn, SHAPEGRID_SELECT_SQL, "name", lookup, parse_shapegrid_row)
}

fn select_gridset(conn: &Connection, lookup: Lookup<'_>) -> CatalogResult<Option<Gridset>> {
    select_by_lookup(conn, GRIDSET_SELECT_SQL, "name", lookup, parse_gridset_row)
}

fn select_gridset_matrices(conn: &Connection, gridset_id: EntityId) -> CatalogResult<Vec<Matrix>> {
    let mut matrices = query_all(
        conn,
        &format!("{MATRIX_SELECT_SQL} WHERE gridset_id = ?1 ORDER BY rowid"),
        [gridset_id.to_string()],
        parse_matrix_row,
    )?;
    for matrix in &mut matrices {
        if let Some(id) = matrix.id {
            matrix.columns = select_matrix_columns(conn, id)?;
        }
    }
    Ok(matrices)
}

fn select_matrix_by_id(conn: &Connection, id: EntityId) -> CatalogResult<Option<Matrix>> {
    query_optional(
        conn,
        &format!("{MATRIX_SELECT_SQL} WHERE id = ?1"),
        [id.to_string()],
        parse_matrix_row,
    )
}

fn select_matrix_by_key(
    conn: &Connection,
    owner: &str,
    gridset_id: EntityId,
    matrix_type: MatrixType,
    scenario_id: Option<EntityId>,
) -> CatalogResult<Option<Matrix>> {
    query_optional(
        conn,
        &format!(
            "{MATRIX_SELECT_SQL}
             WHERE owner = ?1 AND gridset_id = ?2 AND matrix_type = ?3 AND scenario_id IS ?4"
        ),
        params![
            owner,
            gridset_id.to_string(),
            matrix_type.as_db(),
            scenario_id.map(|id| id.to_string()),
        ],
        parse_matrix_row,
    )
}

fn select_matrix_columns(conn: &Connection, matrix_id: EntityId) -> CatalogResult<Vec<MatrixColumn>> {
    query_all(
        conn,
        &format!("{COLUMN_SELECT_SQL} WHERE matrix_id = ?1 ORDER BY column_index ASC"),
        [matrix_id.to_string()],
        parse_column_row,
    )
}

fn select_column_by_id(conn: &Connection, id: EntityId) -> CatalogResult<Option<MatrixColumn>> {
    query_optional(
        conn,
        &format!("{COLUMN_SELECT_SQL} WHERE id = ?1"),
        [id.to_string()],
        parse_column_row,
    )
}

fn select_by_lookup<T>(
    conn: &Connection,
    select_sql: &str,
    key_column: &str,
    lookup: Lookup<'_>,
    parse: impl Fn(&Row<'_>) -> CatalogResult<T>,
) -> CatalogResult<Option<T>> {
    match lookup {
        Lookup::Id(id) => query_optional(
            conn,
            &format!("{select_sql} WHERE id = ?1"),
            [id.to_string()],
            parse,
        ),
        Lookup::Key { owner, name } => query_optional(
            conn,
            &format!("{select_sql} WHERE owner = ?1 AND {key_column} = ?2"),
            [owner, name],
            parse,
        ),
    }
}

fn query_optional<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    parse: impl Fn(&Row<'_>) -> CatalogResult<T>,
) -> CatalogResult<Option<T>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(parse(row)?)),
        None => Ok(None),
    }
}

pub(crate) fn query_all<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    parse: impl Fn(&Row<'_>) -> CatalogResult<T>,
) -> CatalogResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut values = Vec::new();
    while let Some(row) = rows.next()? {
        values.push(parse(row)?);
    }
    Ok(values)
}

fn parse_taxon_source_row(row: &Row<'_>) -> CatalogResult<TaxonSource> {
    Ok(TaxonSource {
        id: Some(parse_id_column(row, "id")?),
        owner: row.get("owner")?,
        name: row.get("name")?,
        url: row.get("url")?,
        mod_time: row.get("mod_time")?,
    })
}

fn parse_algorithm_row(row: &Row<'_>) -> CatalogResult<Algorithm> {
    let parameters: String = row.get("parameters")?;
    Ok(Algorithm {
        id: Some(parse_id_column(row, "id")?),
        owner: row.get("owner")?,
        code: row.get("code")?,
        name: row.get("name")?,
        parameters: ParameterBlock::from_json(&parameters)?,
        metadata: parse_metadata(row, "metadata")?,
        mod_time: row.get("mod_time")?,
    })
}

fn parse_package_row(row: &Row<'_>) -> CatalogResult<ScenarioPackage> {
    Ok(ScenarioPackage {
        id: Some(parse_id_column(row, "id")?),
        owner: row.get("owner")?,
        name: row.get("name")?,
        base_code: row.get("base_code")?,
        spatial: parse_spatial(row)?,
        metadata: parse_metadata(row, "metadata")?,
        scenarios: Vec::new(),
        mod_time: row.get("mod_time")?,
    })
}

fn parse_scenario_row(row: &Row<'_>) -> CatalogResult<Scenario> {
    Ok(Scenario {
        id: Some(parse_id_column(row, "id")?),
        owner: row.get("owner")?,
        package_id: parse_optional_id_column(row, "package_id")?,
        code: row.get("code")?,
        spatial: parse_spatial(row)?,
        metadata: parse_metadata(row, "metadata")?,
        layers: Vec::new(),
        mod_time: row.get("mod_time")?,
    })
}

fn parse_layer_row(row: &Row<'_>) -> CatalogResult<Layer> {
    Ok(Layer {
        id: Some(parse_id_column(row, "id")?),
        owner: row.get("owner")?,
        name: row.get("name")?,
        squid: row.get("squid")?,
        env_code: row.get("env_code")?,
        spatial: parse_spatial(row)?,
        metadata: parse_metadata(row, "metadata")?,
        mod_time: row.get("mod_time")?,
    })
}

fn parse_shapegrid_row(row: &Row<'_>) -> CatalogResult<ShapeGrid> {
    Ok(ShapeGrid {
        id: Some(parse_id_column(row, "id")?),
        owner: row.get("owner")?,
        name: row.get("name")?,
        cell_sides: row.get("cell_sides")?,
        cell_size: row.get("cell_size")?,
        spatial: parse_spatial(row)?,
        status: parse_status_column(row, "status")?,
        status_mod_time: row.get("status_mod_time")?,
        metadata: parse_metadata(row, "metadata")?,
        mod_time: row.get("mod_time")?,
    })
}

fn parse_tree_row(row: &Row<'_>) -> CatalogResult<Tree> {
    Ok(Tree {
        id: Some(parse_id_column(row, "id")?),
        owner: row.get("owner")?,
        name: row.get("name")?,
        dlocation: row.get("dlocation")?,
        metadata: parse_metadata(row, "metadata")?,
        mod_time: row.get("mod_time")?,
    })
}

fn parse_gridset_row(row: &Row<'_>) -> CatalogResult<Gridset> {
    Ok(Gridset {
        id: Some(parse_id_column(row, "id")?),
        owner: row.get("owner")?,
        name: row.get("name")?,
        shapegrid_id: parse_optional_id_column(row, "shapegrid_id")?,
        tree_id: parse_optional_id_column(row, "tree_id")?,
        epsg: row.get("epsg")?,
        metadata: parse_metadata(row, "metadata")?,
        matrices: Vec::new(),
        mod_time: row.get("mod_time")?,
    })
}

fn parse_matrix_row(row: &Row<'_>) -> CatalogResult<Matrix> {
    let type_text: String = row.get("matrix_type")?;
    let matrix_type = MatrixType::parse(&type_text).ok_or_else(|| {
        CatalogError::InvalidData(format!(
            "invalid matrix type `{type_text}` in matrices.matrix_type"
        ))
    })?;
    Ok(Matrix {
        id: Some(parse_id_column(row, "id")?),
        owner: row.get("owner")?,
        gridset_id: parse_optional_id_column(row, "gridset_id")?,
        matrix_type,
        scenario_id: parse_optional_id_column(row, "scenario_id")?,
        dlocation: row.get("dlocation")?,
        status: parse_status_column(row, "status")?,
        status_mod_time: row.get("status_mod_time")?,
        metadata: parse_metadata(row, "metadata")?,
        columns: Vec::new(),
        mod_time: row.get("mod_time")?,
    })
}

fn parse_column_row(row: &Row<'_>) -> CatalogResult<MatrixColumn> {
    let params: String = row.get("intersect_params")?;
    Ok(MatrixColumn {
        id: Some(parse_id_column(row, "id")?),
        owner: row.get("owner")?,
        matrix_id: parse_optional_id_column(row, "matrix_id")?,
        layer_id: parse_optional_id_column(row, "layer_id")?,
        column_index: row.get("column_index")?,
        ident: row.get("ident")?,
        squid: row.get("squid")?,
        intersect_params: ParameterBlock::from_json(&params)?,
        dlocation: row.get("dlocation")?,
        status: parse_status_column(row, "status")?,
        status_mod_time: row.get("status_mod_time")?,
        metadata: parse_metadata(row, "metadata")?,
        mod_time: row.get("mod_time")?,
    })
}

fn parse_spatial(row: &Row<'_>) -> CatalogResult<SpatialPayload> {
    let bbox = match row.get::<_, Option<String>>("bbox")? {
        Some(text) => Some(BoundingBox::parse(&text).map_err(CatalogError::InvalidData)?),
        None => None,
    };
    Ok(SpatialPayload {
        epsg: row.get("epsg")?,
        map_units: row.get("map_units")?,
        resolution: row.get("resolution")?,
        bbox,
        dlocation: row.get("dlocation")?,
        data_format: row.get("data_format")?,
    })
}

fn parse_metadata(row: &Row<'_>, column: &str) -> CatalogResult<Metadata> {
    let text: String = row.get(column)?;
    Metadata::from_json(&text).map_err(|err| {
        CatalogError::InvalidData(format!("invalid metadata in column `{column}`: {err}"))
    })
}

pub(crate) fn parse_status_column(row: &Row<'_>, column: &str) -> CatalogResult<Status> {
    let text: String = row.get(column)?;
    Status::parse(&text).ok_or_else(|| {
        CatalogError::InvalidData(format!("invalid status `{text}` in column `{column}`"))
    })
}

pub(crate) fn parse_id_column(row: &Row<'_>, column: &str) -> CatalogResult<EntityId> {
    let text: String = row.get(column)?;
    parse_uuid(&text, column)
}

pub(crate) fn parse_optional_id_column(
    row: &Row<'_>,
    column: &str,
) -> CatalogResult<Option<EntityId>> {
    match row.get::<_, Option<String>>(column)? {
        Some(text) => Ok(Some(parse_uuid(&text, column)?)),
        None => Ok(None),
    }
}

fn parse_uuid(value: &str, column: &str) -> CatalogResult<EntityId> {
    Uuid::parse_str(value).map_err(|_| {
        CatalogError::InvalidData(format!("invalid uuid value `{value}` in column `{column}`"))
    })
}

fn bbox_text(spatial: &SpatialPayload) -> Option<String> {
    spatial.bbox.map(|bbox| bbox.to_string())
}

fn id_text(id: Option<EntityId>) -> Option<String> {
    id.map(|id| id.to_string())
}
