//! Archive orchestration.
//!
//! # Responsibility
//! - Reconcile every entity an archive request names, parents first.
//! - Catalog uploaded layers and the biogeographic hypotheses matrix.
//! - Author one intersect chain per unfinished GRIM and the start chain.
//! - Write the configuration record the per-species step consumes.
//!
//! # Invariants
//! - A reconciliation failure aborts the run before any chain that would
//!   reference the entity is written.
//! - Finished matrices and columns are never scheduled again.
//! - A rerun replaces the gridset's chains instead of adding to them. The
//!   superseded chains are removed only once their replacements are written.
//! - Fatal matrices and columns wait for an operator; they are never
//!   rescheduled.

use crate::clock::Clock;
use crate::config::{ConfigurationError, SiteConfig};
use crate::layer_io::{LayerIo, LayerIoError};
use crate::locator::PathLocator;
use crate::model::algorithm::{Algorithm, TaxonSource};
use crate::model::grid::{Gridset, ShapeGrid, Tree};
use crate::model::identity::{EntityId, EntityKind};
use crate::model::matrix::{Matrix, MatrixColumn, MatrixType};
use crate::model::metadata::ParameterBlock;
use crate::model::scenario::{Layer, ScenarioPackage};
use crate::model::spatial::SpatialPayload;
use crate::model::status::{Status, StatusTransitionError};
use crate::model::user::User;
use crate::package::PackageDescription;
use crate::repo::catalog_repo::{CatalogError, CatalogRepository, Lookup};
use crate::repo::chain_repo::ChainRepository;
use crate::request::{
    AlgorithmSection, ArchiveRecord, ArchiveRequest, ArchiveSection, GBIF_TAXON_SOURCE,
    GBIF_TAXON_URL,
};
use crate::workflow::chain::{Chain, ChainError};
use crate::workflow::commands::{
    concatenate_rule, intersect_rule, species_step_rule, stockpile_rule, taxonomy_rule,
};
use crate::user_layers::{
    find_user_layer, hypothesis_files, HypothesisLayer, HYPOTHESES_MATRIX_KEYWORD,
};
use crate::workflow::rule::Rule;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Metadata key marking a PAM that is rebuilt as species finish.
pub const ROLLING_PAM_KEY: &str = "is_rolling";

#[derive(Debug)]
pub enum ArchiveError {
    Configuration(ConfigurationError),
    Catalog(CatalogError),
    Chain(ChainError),
    LayerIo(LayerIoError),
    Status(StatusTransitionError),
    /// A layer file failed validation.
    InvalidLayer { name: String, path: String },
    /// The shapegrid is still unreadable after being written.
    InvalidShapegrid { path: PathBuf },
    MissingIdentity(EntityKind),
}

impl Display for ArchiveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(err) => write!(f, "{err}"),
            Self::Catalog(err) => write!(f, "{err}"),
            Self::Chain(err) => write!(f, "{err}"),
            Self::LayerIo(err) => write!(f, "{err}"),
            Self::Status(err) => write!(f, "{err}"),
            Self::InvalidLayer { name, path } => {
                write!(f, "layer `{name}` at `{path}` is missing or unreadable")
            }
            Self::InvalidShapegrid { path } => {
                write!(f, "shapegrid `{}` is unreadable after write", path.display())
            }
            Self::MissingIdentity(kind) => write!(f, "{kind} has no catalog identity"),
        }
    }
}

impl Error for ArchiveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Configuration(err) => Some(err),
            Self::Catalog(err) => Some(err),
            Self::Chain(err) => Some(err),
            Self::LayerIo(err) => Some(err),
            Self::Status(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigurationError> for ArchiveError {
    fn from(value: ConfigurationError) -> Self {
        Self::Configuration(value)
    }
}

impl From<CatalogError> for ArchiveError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

impl From<ChainError> for ArchiveError {
    fn from(value: ChainError) -> Self {
        Self::Chain(value)
    }
}

impl From<LayerIoError> for ArchiveError {
    fn from(value: LayerIoError) -> Self {
        Self::LayerIo(value)
    }
}

impl From<StatusTransitionError> for ArchiveError {
    fn from(value: StatusTransitionError) -> Self {
        Self::Status(value)
    }
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// What one run produced.
#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub gridset: Gridset,
    pub shapegrid: ShapeGrid,
    pub config_record: PathBuf,
    /// One per scheduled GRIM, in gridset order.
    pub intersect_chains: Vec<Chain>,
    pub start_chain: Chain,
    /// Uploaded layers that were found and cataloged.
    pub other_layers: Vec<Layer>,
    /// Layers feeding the biogeographic hypotheses matrix.
    pub hypothesis_layers: Vec<Layer>,
}

impl ArchiveOutcome {
    pub fn chains(&self) -> impl Iterator<Item = &Chain> {
        self.intersect_chains
            .iter()
            .chain(std::iter::once(&self.start_chain))
    }
}

/// Scenario codes a run works on.
struct ScenarioPlan {
    model: String,
    projections: Vec<String>,
}

/// Top-level driver for archive requests.
pub struct ArchiveOrchestrator<C: CatalogRepository, Q: ChainRepository> {
    catalog: C,
    chains: Q,
    layer_io: Box<dyn LayerIo>,
    clock: Arc<dyn Clock>,
    site: SiteConfig,
    locator: PathLocator,
    build_intersect_chains: bool,
}

impl<C: CatalogRepository, Q: ChainRepository> ArchiveOrchestrator<C, Q> {
    pub fn new(
        catalog: C,
        chains: Q,
        layer_io: Box<dyn LayerIo>,
        clock: Arc<dyn Clock>,
        site: SiteConfig,
    ) -> Self {
        let locator = site.locator();
        Self {
            catalog,
            chains,
            layer_io,
            clock,
            site,
            locator,
            build_intersect_chains: false,
        }
    }

    /// Also schedule GRIM intersection chains.
    pub fn with_intersect_chains(mut self, enabled: bool) -> Self {
        self.build_intersect_chains = enabled;
        self
    }

    pub fn locator(&self) -> &PathLocator {
        &self.locator
    }

    pub fn run(&self, request: &ArchiveRequest) -> ArchiveResult<ArchiveOutcome> {
        let started_at = Instant::now();
        info!(
            "event=archive_run module=orchestrator status=start archive={} owner={} intersect={}",
            request.archive_name, request.owner, self.build_intersect_chains
        );

        match self.run_inner(request) {
            Ok(outcome) => {
                info!(
                    "event=archive_run module=orchestrator status=ok archive={} owner={} chains={} duration_ms={}",
                    request.archive_name,
                    request.owner,
                    outcome.intersect_chains.len() + 1,
                    started_at.elapsed().as_millis()
                );
                Ok(outcome)
            }
            Err(err) => {
                error!(
                    "event=archive_run module=orchestrator status=error archive={} owner={} duration_ms={} error={}",
                    request.archive_name,
                    request.owner,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    fn run_inner(&self, request: &ArchiveRequest) -> ArchiveResult<ArchiveOutcome> {
        self.reconcile_principals(request)?;
        let package = self.resolve_package(request)?;
        let plan = plan_scenarios(request, &package)?;
        let shapegrid = self.prepare_shapegrid(request, &package)?;
        let hypothesis_layers = self.reconcile_hypothesis_layers(request, &package)?;
        let gridset =
            self.reconcile_gridset(request, &package, &plan, &shapegrid, &hypothesis_layers)?;
        let other_layers = self.reconcile_other_layers(request, &package)?;
        let superseded = match gridset.id {
            Some(gridset_id) => self.chains.list_chains_for_gridset(gridset_id)?,
            None => Vec::new(),
        };

        let intersect_chains = if self.build_intersect_chains {
            self.author_intersect_chains(request, &package, &shapegrid, &gridset)?
        } else {
            Vec::new()
        };

        let config_record = self.write_config_record(
            request,
            &package,
            &plan,
            &shapegrid,
            &other_layers,
            &hypothesis_layers,
        )?;
        let start_chain = self.author_start_chain(request, &gridset, &config_record)?;
        self.remove_superseded_chains(&superseded)?;

        Ok(ArchiveOutcome {
            gridset,
            shapegrid,
            config_record,
            intersect_chains,
            start_chain,
            other_layers,
            hypothesis_layers,
        })
    }

    fn reconcile_principals(&self, request: &ArchiveRequest) -> ArchiveResult<()> {
        let now = self.clock.now_ms();
        let public_owner = self.site.public_owner.as_str();

        let mut user = User::new(request.owner.as_str(), now);
        user.email.clone_from(&request.email);
        self.catalog.reconcile_user(&user)?;
        if request.owner != public_owner {
            self.catalog.reconcile_user(&User::new(public_owner, now))?;
        }

        if request.data_source.is_gbif() {
            let mut source = TaxonSource::new(public_owner, GBIF_TAXON_SOURCE, now);
            source.url = Some(GBIF_TAXON_URL.to_string());
            self.catalog.reconcile_taxon_source(&source)?;
        }

        for algorithm in request.algorithms.iter().chain(request.sdm_mask.as_ref()) {
            self.catalog
                .reconcile_algorithm(&Algorithm::new(public_owner, algorithm.code.as_str(), now))?;
        }
        Ok(())
    }

    /// Uploaded layers named by the request. Names with no file are skipped.
    fn reconcile_other_layers(
        &self,
        request: &ArchiveRequest,
        package: &ScenarioPackage,
    ) -> ArchiveResult<Vec<Layer>> {
        let now = self.clock.now_ms();
        let owner = request.owner.as_str();
        let mut layers = Vec::with_capacity(request.other_layers.len());
        for name in &request.other_layers {
            let Some(path) = find_user_layer(&self.locator, owner, name) else {
                warn!(
                    "event=other_layer module=orchestrator status=error owner={} name={} reason=not_found",
                    owner, name
                );
                continue;
            };
            let mut layer = Layer::new(owner, name.as_str(), now).with_dlocation(path_text(path));
            layer.spatial.epsg = package.spatial.epsg;
            self.validate_layer(&mut layer)?;
            layers.push(self.catalog.reconcile_layer(&layer)?.entity);
        }
        if !layers.is_empty() {
            info!(
                "event=other_layer module=orchestrator status=ok owner={} count={}",
                owner,
                layers.len()
            );
        }
        Ok(layers)
    }

    fn reconcile_hypothesis_layers(
        &self,
        request: &ArchiveRequest,
        package: &ScenarioPackage,
    ) -> ArchiveResult<Vec<Layer>> {
        let Some(name) = &request.biogeo_hypotheses else {
            return Ok(Vec::new());
        };
        let now = self.clock.now_ms();
        let owner = request.owner.as_str();

        let mut layers = Vec::new();
        for path in hypothesis_files(&self.locator, owner, name)? {
            let hypothesis = HypothesisLayer::load(&path)?;
            let mut layer = Layer::new(owner, hypothesis.name.as_str(), now)
                .with_dlocation(path_text(hypothesis.path));
            layer.spatial.epsg = package.spatial.epsg;
            layer.metadata = hypothesis.metadata;
            if let Some(value_name) = hypothesis.value_name {
                layer.metadata.parameters.insert("value_name", value_name);
            }
            self.validate_layer(&mut layer)?;
            layers.push(self.catalog.reconcile_layer(&layer)?.entity);
        }
        info!(
            "event=biogeo_layers module=orchestrator status=ok owner={} source={} count={}",
            owner,
            name,
            layers.len()
        );
        Ok(layers)
    }

    /// Catalog entry for the owner, then the public one, then a description
    /// file.
    fn resolve_package(&self, request: &ArchiveRequest) -> ArchiveResult<ScenarioPackage> {
        if request.scenario_package_file.is_none() {
            for owner in [request.owner.as_str(), self.site.public_owner.as_str()] {
                let lookup = Lookup::Key {
                    owner,
                    name: &request.scenario_package,
                };
                if let Some(package) = self.catalog.get_scenario_package(lookup)? {
                    if !package.scenarios.is_empty() {
                        debug!(
                            "event=package_resolve module=orchestrator status=ok source=catalog owner={} name={}",
                            owner, package.name
                        );
                        return Ok(package);
                    }
                }
            }
        }

        let (path, owner) = self.package_description_path(request)?;
        let now = self.clock.now_ms();
        let description = PackageDescription::from_file(&path)?;
        let mut package =
            description.into_package(&owner, &request.scenario_package, path.parent(), now)?;

        for scenario in &mut package.scenarios {
            for layer in &mut scenario.layers {
                self.validate_layer(layer)?;
            }
        }

        let reconciled = self.catalog.reconcile_scenario_package(&package)?;
        info!(
            "event=package_resolve module=orchestrator status=ok source=file owner={} name={} scenarios={} preexisting={}",
            owner,
            request.scenario_package,
            reconciled.entity.scenarios.len(),
            reconciled.was_preexisting
        );
        Ok(reconciled.entity)
    }

    fn package_description_path(&self, request: &ArchiveRequest) -> ArchiveResult<(PathBuf, String)> {
        if let Some(path) = &request.scenario_package_file {
            return Ok((path.clone(), request.owner.clone()));
        }

        let candidates = self
            .locator
            .package_metadata_candidates(&request.owner, &request.scenario_package);
        let owners = [request.owner.as_str(), self.site.public_owner.as_str()];
        candidates
            .into_iter()
            .zip(owners)
            .find(|(path, _)| path.is_file())
            .map(|(path, owner)| (path, owner.to_string()))
            .ok_or_else(|| {
                ArchiveError::Configuration(ConfigurationError::invalid(
                    "scenario_package",
                    format!(
                        "`{}` is neither cataloged nor described in the user or environment directory",
                        request.scenario_package
                    ),
                ))
            })
    }

    fn validate_layer(&self, layer: &mut Layer) -> ArchiveResult<()> {
        let location = layer
            .spatial
            .dlocation
            .clone()
            .ok_or_else(|| LayerIoError::MissingLocation(layer.name.clone()))?;
        let info = self.layer_io.read_layer(Path::new(&location))?;
        if !info.is_valid {
            return Err(ArchiveError::InvalidLayer {
                name: layer.name.clone(),
                path: location,
            });
        }

        let mut spatial = info.spatial;
        // Declared attributes win over what the reader infers.
        spatial.merge_from(&layer.spatial);
        layer.spatial = spatial;
        Ok(())
    }

    fn prepare_shapegrid(
        &self,
        request: &ArchiveRequest,
        package: &ScenarioPackage,
    ) -> ArchiveResult<ShapeGrid> {
        let now = self.clock.now_ms();
        let location = self.locator.shapegrid(&request.owner, &request.grid.name);

        let mut candidate = ShapeGrid::new(
            request.owner.as_str(),
            request.grid.name.as_str(),
            request.grid.cell_sides,
            request.grid.cell_size,
            now,
        );
        candidate.spatial = SpatialPayload {
            epsg: request.grid.epsg.or(package.spatial.epsg),
            map_units: request
                .grid
                .map_units
                .clone()
                .or_else(|| package.spatial.map_units.clone()),
            resolution: None,
            bbox: request
                .grid
                .bbox
                .or(package.spatial.bbox)
                .or_else(|| package.derived_bbox()),
            dlocation: Some(location.display().to_string()),
            data_format: Some("shapegrid".to_string()),
        };

        let mut grid = self.catalog.reconcile_shapegrid(&candidate)?.entity;
        let data_valid = self.layer_io.read_layer(&location)?.is_valid;
        if grid.status.finished() && data_valid {
            return Ok(grid);
        }

        let written = self.layer_io.write_shapegrid(&grid)?;
        if !self.layer_io.read_layer(&written)?.is_valid {
            return Err(ArchiveError::InvalidShapegrid { path: written });
        }
        if grid.status != Status::Complete {
            grid.status = grid.status.transition(Status::Complete)?;
            grid.status_mod_time = now;
        }
        grid.mod_time = now;
        self.catalog.update_shapegrid(&grid)?;
        info!(
            "event=shapegrid_build module=orchestrator status=ok name={} path={}",
            grid.name,
            written.display()
        );
        Ok(grid)
    }

    fn reconcile_gridset(
        &self,
        request: &ArchiveRequest,
        package: &ScenarioPackage,
        plan: &ScenarioPlan,
        shapegrid: &ShapeGrid,
        hypothesis_layers: &[Layer],
    ) -> ArchiveResult<Gridset> {
        let now = self.clock.now_ms();
        let owner = request.owner.as_str();
        let gridset_name = request.archive_name.as_str();

        let tree_id = match &request.tree {
            Some(tree) => {
                let mut candidate = Tree::new(owner, tree.name.as_str(), now);
                candidate.dlocation = tree.file.as_ref().map(|path| path.display().to_string());
                self.catalog.reconcile_tree(&candidate)?.entity.id
            }
            None => None,
        };

        let mut candidate = Gridset::new(owner, gridset_name, now);
        candidate.shapegrid_id = shapegrid.id;
        candidate.tree_id = tree_id;
        candidate.epsg = shapegrid.spatial.epsg;

        let intersect_params = request.intersect.to_params();
        for code in &plan.projections {
            let scenario = package.scenario(code).ok_or_else(|| unknown_scenario(code))?;

            if request.assemble_pams {
                let mut pam = Matrix::new(owner, MatrixType::Pam, now);
                pam.scenario_id = scenario.id;
                pam.dlocation = Some(path_text(self.locator.matrix_file(
                    owner,
                    gridset_name,
                    MatrixType::Pam,
                    code,
                )));
                pam.metadata
                    .extra
                    .insert(ROLLING_PAM_KEY.to_string(), serde_json::Value::Bool(true));
                candidate.matrices.push(pam);
            }

            let mut grim = Matrix::new(owner, MatrixType::Grim, now);
            grim.scenario_id = scenario.id;
            grim.dlocation = Some(path_text(self.locator.matrix_file(
                owner,
                gridset_name,
                MatrixType::Grim,
                code,
            )));
            for layer in &scenario.layers {
                let mut column = MatrixColumn::new(owner, layer.name.as_str(), now);
                column.layer_id = layer.id;
                column.squid.clone_from(&layer.squid);
                column.intersect_params = intersect_params.clone();
                column.dlocation = Some(path_text(self.locator.column_file(
                    owner,
                    gridset_name,
                    MatrixType::Grim,
                    code,
                    &layer.name,
                )));
                grim.columns.push(column);
            }
            candidate.matrices.push(grim);
        }
        if !hypothesis_layers.is_empty() {
            candidate
                .matrices
                .push(self.hypotheses_matrix(request, hypothesis_layers, now));
        }

        let reconciled = self.catalog.reconcile_gridset(&candidate)?;
        info!(
            "event=gridset_reconcile module=orchestrator status=ok name={} matrices={} preexisting={}",
            gridset_name,
            reconciled.entity.matrices.len(),
            reconciled.was_preexisting
        );
        Ok(reconciled.entity)
    }

    /// Matrix encoding each hypothesis layer as one column.
    fn hypotheses_matrix(&self, request: &ArchiveRequest, layers: &[Layer], now: i64) -> Matrix {
        let owner = request.owner.as_str();
        let mut matrix = Matrix::new(owner, MatrixType::BiogeoHypotheses, now);
        matrix.dlocation = Some(path_text(self.locator.gridset_matrix_file(
            owner,
            &request.archive_name,
            MatrixType::BiogeoHypotheses,
        )));
        matrix.metadata.description = Some(format!(
            "Biogeographic hypotheses for archive {}",
            request.archive_name
        ));
        matrix.metadata.keywords.push(HYPOTHESES_MATRIX_KEYWORD.to_string());
        for layer in layers {
            matrix.metadata.keywords.push(format!("Layer {}", layer.name));

            let mut column = MatrixColumn::new(owner, layer.name.as_str(), now);
            column.layer_id = layer.id;
            let mut params = ParameterBlock::new();
            if let Some(value_name) = layer.metadata.parameters.get("value_name") {
                params.insert("value_name", value_name.clone());
            }
            column.intersect_params = params;
            matrix.columns.push(column);
        }
        matrix
    }

    fn author_intersect_chains(
        &self,
        request: &ArchiveRequest,
        package: &ScenarioPackage,
        shapegrid: &ShapeGrid,
        gridset: &Gridset,
    ) -> ArchiveResult<Vec<Chain>> {
        let shapegrid_path = shapegrid
            .spatial
            .dlocation
            .clone()
            .ok_or(ArchiveError::MissingIdentity(EntityKind::ShapeGrid))?;
        let mut scenario_codes: HashMap<EntityId, &str> = HashMap::new();
        let mut layer_paths: HashMap<EntityId, &str> = HashMap::new();
        for scenario in &package.scenarios {
            if let Some(id) = scenario.id {
                scenario_codes.insert(id, scenario.code.as_str());
            }
            for layer in &scenario.layers {
                if let (Some(id), Some(path)) = (layer.id, layer.spatial.dlocation.as_deref()) {
                    layer_paths.insert(id, path);
                }
            }
        }

        let mut authored = Vec::new();
        for matrix in &gridset.matrices {
            if matrix.matrix_type != MatrixType::Grim || matrix.columns.is_empty() {
                continue;
            }
            if matrix.status.finished()
                || matrix.status == Status::FatalError
                || matrix.has_fatal_column()
            {
                debug!(
                    "event=intersect_skip module=orchestrator status=ok matrix={:?} matrix_status={} fatal_column={}",
                    matrix.id,
                    matrix.status,
                    matrix.has_fatal_column()
                );
                continue;
            }
            let scenario_code = matrix
                .scenario_id
                .and_then(|id| scenario_codes.get(&id).copied())
                .ok_or(ArchiveError::MissingIdentity(EntityKind::Scenario))?;
            match self.author_matrix_chain(
                request,
                gridset,
                matrix,
                scenario_code,
                &shapegrid_path,
                &layer_paths,
            ) {
                Ok(chain) => authored.push(chain),
                // Only this matrix is held back; siblings still get chains.
                Err(ArchiveError::Status(err)) => warn!(
                    "event=intersect_skip module=orchestrator status=error matrix={:?} error={}",
                    matrix.id, err
                ),
                Err(err) => return Err(err),
            }
        }
        Ok(authored)
    }

    /// Fan-in chain for one GRIM: intersect leaves, concatenate, stockpile.
    fn author_matrix_chain(
        &self,
        request: &ArchiveRequest,
        gridset: &Gridset,
        matrix: &Matrix,
        scenario_code: &str,
        shapegrid_path: &str,
        layer_paths: &HashMap<EntityId, &str>,
    ) -> ArchiveResult<Chain> {
        let names = &self.site.commands;
        let owner = request.owner.as_str();
        let matrix_id = matrix
            .id
            .ok_or(ArchiveError::MissingIdentity(EntityKind::Matrix))?;
        let matrix_path = matrix
            .dlocation
            .clone()
            .ok_or(ArchiveError::MissingIdentity(EntityKind::Matrix))?;
        let success = path_text(self.locator.matrix_success(
            owner,
            &gridset.name,
            matrix.matrix_type,
            scenario_code,
        ));

        let now = self.clock.now_ms();
        let mut matrix_row = matrix.clone();
        matrix_row.status = matrix_row.status.transition(Status::Initialized)?;
        matrix_row.status_mod_time = now;
        matrix_row.mod_time = now;

        let mut rules: Vec<Rule> = Vec::with_capacity(matrix.columns.len() + 2);
        let mut column_outputs = Vec::with_capacity(matrix.columns.len());
        let mut scheduled: Vec<MatrixColumn> = Vec::new();
        for column in &matrix.columns {
            let output = column
                .dlocation
                .clone()
                .ok_or(ArchiveError::MissingIdentity(EntityKind::MatrixColumn))?;
            if !column.status.finished() {
                let layer_path = column
                    .layer_id
                    .and_then(|id| layer_paths.get(&id).copied())
                    .ok_or(ArchiveError::MissingIdentity(EntityKind::Layer))?;
                let mut row = column.clone();
                row.status = row.status.transition(Status::Initialized)?;
                row.status_mod_time = now;
                row.mod_time = now;
                rules.push(intersect_rule(
                    names,
                    shapegrid_path,
                    layer_path,
                    &output,
                    &column.ident,
                    &column.intersect_params,
                ));
                scheduled.push(row);
            }
            column_outputs.push(output);
        }
        rules.push(concatenate_rule(names, &column_outputs, &matrix_path));
        rules.push(stockpile_rule(names, matrix_id, &success, &matrix_path));

        let mut chain = Chain::new(owner, request.priority, self.clock.now_ms()).with_description(
            format!(
                "Intersect {} columns for scenario {scenario_code} of gridset {}",
                matrix.matrix_type.as_db(),
                gridset.name
            ),
        );
        chain.gridset_id = gridset.id;
        chain.add_commands(rules);
        let chain = self.persist_chain(chain)?;

        self.catalog.update_matrix(&matrix_row)?;
        for row in &scheduled {
            self.catalog.update_matrix_column(row)?;
        }
        Ok(chain)
    }

    fn write_config_record(
        &self,
        request: &ArchiveRequest,
        package: &ScenarioPackage,
        plan: &ScenarioPlan,
        shapegrid: &ShapeGrid,
        other_layers: &[Layer],
        hypothesis_layers: &[Layer],
    ) -> ArchiveResult<PathBuf> {
        let path = self
            .locator
            .config_record(&request.owner, &request.archive_name);
        let record = ArchiveRecord {
            archive: ArchiveSection {
                archive_name: request.archive_name.clone(),
                owner: request.owner.clone(),
                priority: request.priority,
                email: request.email.clone(),
                scenario_package: package.name.clone(),
                model_scenario: plan.model.clone(),
                projection_scenarios: plan.projections.clone(),
                epsg: shapegrid.spatial.epsg,
                map_units: shapegrid.spatial.map_units.clone(),
                data_source: request.data_source.as_str().to_string(),
                data_files: request
                    .data_source
                    .files()
                    .into_iter()
                    .map(|(key, path)| (key.to_string(), path.to_path_buf()))
                    .collect(),
                point_minimum: request.point_minimum,
                assemble_pams: request.assemble_pams,
                compute_pam_stats: request.compute_pam_stats,
                gridset: request.archive_name.clone(),
                grid_name: shapegrid.name.clone(),
                grid_bbox: shapegrid.spatial.bbox,
                cell_size: shapegrid.cell_size,
                cell_sides: shapegrid.cell_sides,
                intersect: request.intersect.to_params(),
                tree: request.tree.as_ref().map(|tree| tree.name.clone()),
                other_layers: layer_names(other_layers),
                biogeo_hypotheses: layer_names(hypothesis_layers),
                run_time: self.clock.now_ms(),
            },
            algorithm: ArchiveRecord::algorithms_from(request),
            sdm_mask: request.sdm_mask.as_ref().map(AlgorithmSection::from),
        };
        record.write(&path)?;
        info!(
            "event=config_record_write module=orchestrator status=ok archive={} path={}",
            request.archive_name,
            path.display()
        );
        Ok(path)
    }

    fn author_start_chain(
        &self,
        request: &ArchiveRequest,
        gridset: &Gridset,
        config_record: &Path,
    ) -> ArchiveResult<Chain> {
        let names = &self.site.commands;
        let owner = request.owner.as_str();
        let mut chain = Chain::new(owner, request.priority, self.clock.now_ms())
            .with_description(format!("Start archive {}", request.archive_name));
        chain.gridset_id = gridset.id;

        let mut extra_dependencies = Vec::new();
        if let Some(taxonomy_file) = request.data_source.taxonomy_file() {
            let success = self.locator.taxonomy_success(owner, GBIF_TAXON_SOURCE);
            if !success.exists() {
                chain.add_commands([taxonomy_rule(
                    names,
                    GBIF_TAXON_SOURCE,
                    &path_text(taxonomy_file.to_path_buf()),
                    &path_text(success.clone()),
                )]);
            }
            extra_dependencies.push(path_text(success));
        }

        let species_success = self
            .locator
            .species_success(owner, &request.archive_name);
        chain.add_commands([species_step_rule(
            names,
            &path_text(config_record.to_path_buf()),
            &path_text(species_success),
            &extra_dependencies,
        )]);
        self.persist_chain(chain)
    }

    /// Validates and writes a chain document, then stores the chain as
    /// `initialized`. A stored row always points at a written document.
    fn persist_chain(&self, mut chain: Chain) -> ArchiveResult<Chain> {
        chain.validate(|path| Path::new(path).exists())?;
        let id = Uuid::new_v4();
        chain.id = Some(id);
        chain.dlocation = Some(path_text(self.locator.chain_document(&chain.owner, id)));

        let now = self.clock.now_ms();
        chain.status = chain.status.transition(Status::Initialized)?;
        chain.status_mod_time = now;
        chain.mod_time = now;
        chain.write()?;
        self.chains.insert_chain(&chain)?;
        Ok(chain)
    }

    fn remove_superseded_chains(&self, superseded: &[Chain]) -> ArchiveResult<()> {
        for chain in superseded {
            let Some(id) = chain.id else { continue };
            if let Some(document) = self.chains.delete_chain(id)? {
                remove_stale_document(&document);
            }
        }
        if !superseded.is_empty() {
            debug!(
                "event=chain_replace module=orchestrator status=ok removed={}",
                superseded.len()
            );
        }
        Ok(())
    }
}

fn plan_scenarios(request: &ArchiveRequest, package: &ScenarioPackage) -> ArchiveResult<ScenarioPlan> {
    let model = request
        .model_scenario
        .clone()
        .or_else(|| package.base_code.clone())
        .ok_or_else(|| ConfigurationError::missing("model_scenario"))?;
    if package.scenario(&model).is_none() {
        return Err(unknown_scenario(&model));
    }

    let projections = if request.projection_scenarios.is_empty() {
        package
            .scenario_codes()
            .into_iter()
            .map(str::to_string)
            .collect()
    } else {
        for code in &request.projection_scenarios {
            if package.scenario(code).is_none() {
                return Err(unknown_scenario(code));
            }
        }
        request.projection_scenarios.clone()
    };
    Ok(ScenarioPlan { model, projections })
}

fn unknown_scenario(code: &str) -> ArchiveError {
    ArchiveError::Configuration(ConfigurationError::invalid(
        "scenario",
        format!("`{code}` is not a scenario of the package"),
    ))
}

fn remove_stale_document(document: &str) {
    match std::fs::remove_file(document) {
        Ok(()) => debug!(
            "event=chain_remove module=orchestrator status=ok path={}",
            document
        ),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            "event=chain_remove module=orchestrator status=error path={} error={}",
            document, err
        ),
    }
}

fn layer_names(layers: &[Layer]) -> Vec<String> {
    layers.iter().map(|layer| layer.name.clone()).collect()
}

fn path_text(path: PathBuf) -> String {
    path.display().to_string()
}
