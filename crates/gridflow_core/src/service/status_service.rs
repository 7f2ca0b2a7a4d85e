//! Engine report handling.
//!
//! # Responsibility
//! - Apply success/failure reports from the workflow engine to matrices,
//!   columns and chains.
//! - Back the stockpile step that closes an intersect chain.
//!
//! # Invariants
//! - A column becomes `complete` only when its output file exists.
//! - A failure code maps to exactly one error status; siblings are untouched.

use crate::clock::Clock;
use crate::model::identity::{EntityId, EntityKind};
use crate::model::matrix::{Matrix, MatrixColumn};
use crate::model::status::{failure_status, Status, StatusTransitionError};
use crate::repo::catalog_repo::{CatalogError, CatalogRepository};
use crate::repo::chain_repo::ChainRepository;
use crate::workflow::chain::Chain;
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome the engine (or a step) reports for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineReport {
    /// `artifact` overrides the stored output location.
    Success { artifact: Option<PathBuf> },
    Failure { code: i64 },
}

#[derive(Debug)]
pub enum StatusServiceError {
    Catalog(CatalogError),
    Transition(StatusTransitionError),
    NotFound { kind: EntityKind, id: EntityId },
    /// Success reported but the output is absent.
    ArtifactMissing { kind: EntityKind, path: PathBuf },
    Io { path: PathBuf, source: std::io::Error },
}

impl Display for StatusServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Catalog(err) => write!(f, "{err}"),
            Self::Transition(err) => write!(f, "{err}"),
            Self::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            Self::ArtifactMissing { kind, path } => {
                write!(f, "{kind} reported success but `{}` is missing", path.display())
            }
            Self::Io { path, source } => write!(f, "cannot write `{}`: {source}", path.display()),
        }
    }
}

impl Error for StatusServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Catalog(err) => Some(err),
            Self::Transition(err) => Some(err),
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<CatalogError> for StatusServiceError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

impl From<StatusTransitionError> for StatusServiceError {
    fn from(value: StatusTransitionError) -> Self {
        Self::Transition(value)
    }
}

pub type StatusServiceResult<T> = Result<T, StatusServiceError>;

/// Applies engine reports to the catalog.
pub struct StatusService<C: CatalogRepository, Q: ChainRepository> {
    catalog: C,
    chains: Q,
    clock: Arc<dyn Clock>,
}

impl<C: CatalogRepository, Q: ChainRepository> StatusService<C, Q> {
    pub fn new(catalog: C, chains: Q, clock: Arc<dyn Clock>) -> Self {
        Self {
            catalog,
            chains,
            clock,
        }
    }

    /// Records a matrix outcome.
    ///
    /// On success, every pending column whose output exists is promoted too.
    /// Repeating a success on a complete matrix is a no-op.
    pub fn apply_matrix_report(
        &self,
        matrix_id: EntityId,
        report: &EngineReport,
    ) -> StatusServiceResult<Matrix> {
        let mut matrix = self
            .catalog
            .get_matrix(matrix_id)?
            .ok_or(StatusServiceError::NotFound {
                kind: EntityKind::Matrix,
                id: matrix_id,
            })?;
        let now = self.clock.now_ms();

        match report {
            EngineReport::Success { artifact } => {
                if let Some(artifact) = artifact {
                    matrix.dlocation = Some(artifact.display().to_string());
                }
                require_artifact(EntityKind::Matrix, matrix.dlocation.as_deref())?;
                if matrix.status != Status::Complete {
                    matrix.status = matrix.status.transition(Status::Complete)?;
                    matrix.status_mod_time = now;
                }
                matrix.mod_time = now;
                self.catalog.update_matrix(&matrix)?;

                for column in &mut matrix.columns {
                    if !column.status.is_pending() || !output_exists(column.dlocation.as_deref())
                    {
                        continue;
                    }
                    column.status = Status::Complete;
                    column.status_mod_time = now;
                    column.mod_time = now;
                    self.catalog.update_matrix_column(column)?;
                }
            }
            EngineReport::Failure { code } => {
                matrix.status = matrix.status.transition(failure_status(*code))?;
                matrix.status_mod_time = now;
                matrix.mod_time = now;
                self.catalog.update_matrix(&matrix)?;
            }
        }

        info!(
            "event=engine_report module=status status=ok kind=matrix id={} result={}",
            matrix_id, matrix.status
        );
        Ok(matrix)
    }

    /// Records one column outcome.
    pub fn apply_column_report(
        &self,
        column_id: EntityId,
        report: &EngineReport,
    ) -> StatusServiceResult<MatrixColumn> {
        let mut column =
            self.catalog
                .get_matrix_column(column_id)?
                .ok_or(StatusServiceError::NotFound {
                    kind: EntityKind::MatrixColumn,
                    id: column_id,
                })?;
        let now = self.clock.now_ms();

        let next = match report {
            EngineReport::Success { artifact } => {
                if let Some(artifact) = artifact {
                    column.dlocation = Some(artifact.display().to_string());
                }
                require_artifact(EntityKind::MatrixColumn, column.dlocation.as_deref())?;
                Status::Complete
            }
            EngineReport::Failure { code } => failure_status(*code),
        };
        if column.status != next {
            column.status = column.status.transition(next)?;
            column.status_mod_time = now;
        }
        column.mod_time = now;
        self.catalog.update_matrix_column(&column)?;

        info!(
            "event=engine_report module=status status=ok kind=matrix_column id={} result={}",
            column_id, column.status
        );
        Ok(column)
    }

    /// Records the outcome of a whole chain run.
    pub fn apply_chain_report(
        &self,
        chain_id: EntityId,
        report: &EngineReport,
    ) -> StatusServiceResult<Chain> {
        let mut chain = self
            .chains
            .get_chain(chain_id)?
            .ok_or(StatusServiceError::NotFound {
                kind: EntityKind::Chain,
                id: chain_id,
            })?;
        let next = match report {
            EngineReport::Success { .. } => Status::Complete,
            EngineReport::Failure { code } => failure_status(*code),
        };
        if chain.status != next {
            let now = self.clock.now_ms();
            chain.status = chain.status.transition(next)?;
            chain.status_mod_time = now;
            chain.mod_time = now;
            self.chains
                .update_chain_status(chain_id, chain.status, now)?;
        }
        Ok(chain)
    }

    /// Stockpile step: records the matrix report and, on success, writes the
    /// success file the chain declared as its final output.
    pub fn stockpile(
        &self,
        matrix_id: EntityId,
        success_file: &Path,
        report: &EngineReport,
    ) -> StatusServiceResult<Matrix> {
        let matrix = self.apply_matrix_report(matrix_id, report)?;
        if matrix.status != Status::Complete {
            warn!(
                "event=stockpile module=status status=error matrix={} result={}",
                matrix_id, matrix.status
            );
            return Ok(matrix);
        }

        if let Some(parent) = success_file.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StatusServiceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let body = format!(
            "matrix={matrix_id}\nstatus={}\ncolumns={}\n",
            matrix.status,
            matrix.columns.len()
        );
        std::fs::write(success_file, body).map_err(|source| StatusServiceError::Io {
            path: success_file.to_path_buf(),
            source,
        })?;
        info!(
            "event=stockpile module=status status=ok matrix={} success={}",
            matrix_id,
            success_file.display()
        );
        Ok(matrix)
    }
}

fn output_exists(dlocation: Option<&str>) -> bool {
    dlocation.is_some_and(|path| Path::new(path).exists())
}

fn require_artifact(kind: EntityKind, dlocation: Option<&str>) -> StatusServiceResult<()> {
    match dlocation {
        Some(path) if Path::new(path).exists() => Ok(()),
        Some(path) => Err(StatusServiceError::ArtifactMissing {
            kind,
            path: PathBuf::from(path),
        }),
        None => Err(StatusServiceError::ArtifactMissing {
            kind,
            path: PathBuf::new(),
        }),
    }
}
