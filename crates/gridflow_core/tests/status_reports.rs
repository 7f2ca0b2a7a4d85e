use gridflow_core::db::open_db_in_memory;
use gridflow_core::model::grid::{Gridset, ShapeGrid};
use gridflow_core::model::matrix::{Matrix, MatrixColumn, MatrixType};
use gridflow_core::model::status::codes;
use gridflow_core::model::user::User;
use gridflow_core::{
    CatalogRepository, Chain, ChainRepository, EngineReport, FixedClock, Priority,
    SqliteCatalog, SqliteChainRepository, Status, StatusService, StatusServiceError,
};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

struct Fixture {
    dir: tempfile::TempDir,
    conn: Connection,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_db_in_memory().unwrap();
        SqliteCatalog::new(&conn)
            .reconcile_user(&User::new("alice", 0))
            .unwrap();
        Self { dir, conn }
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).display().to_string()
    }

    fn service(&self) -> StatusService<SqliteCatalog<'_>, SqliteChainRepository<'_>> {
        StatusService::new(
            SqliteCatalog::new(&self.conn),
            SqliteChainRepository::new(&self.conn),
            Arc::new(FixedClock::new(500)),
        )
    }

    /// GRIM with columns `bio1` and `bio2`, both initialized.
    fn matrix(&self) -> Matrix {
        let catalog = SqliteCatalog::new(&self.conn);
        let grid = catalog
            .reconcile_shapegrid(&ShapeGrid::new("alice", "grid10", 4, 1.0, 0))
            .unwrap()
            .entity;
        let mut gridset = Gridset::new("alice", "heuchera", 0);
        gridset.shapegrid_id = grid.id;
        let gridset = catalog.reconcile_gridset(&gridset).unwrap().entity;

        let mut matrix = Matrix::new("alice", MatrixType::Grim, 0);
        matrix.gridset_id = gridset.id;
        matrix.status = Status::Initialized;
        matrix.dlocation = Some(self.path("grim.json"));
        for ident in ["bio1", "bio2"] {
            let mut column = MatrixColumn::new("alice", ident, 0);
            column.status = Status::Initialized;
            column.dlocation = Some(self.path(&format!("{ident}.json")));
            matrix.columns.push(column);
        }
        catalog.reconcile_matrix(&matrix).unwrap().entity
    }
}

fn touch(path: &str) {
    std::fs::write(path, b"{}").unwrap();
}

#[test]
fn matrix_success_promotes_columns_with_outputs() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix();
    touch(matrix.dlocation.as_deref().unwrap());
    touch(matrix.columns[0].dlocation.as_deref().unwrap());

    let updated = fixture
        .service()
        .apply_matrix_report(matrix.id.unwrap(), &EngineReport::Success { artifact: None })
        .unwrap();

    assert_eq!(updated.status, Status::Complete);
    assert_eq!(updated.status_mod_time, 500);
    assert_eq!(updated.columns[0].status, Status::Complete);
    assert_eq!(updated.columns[1].status, Status::Initialized);

    let stored = SqliteCatalog::new(&fixture.conn)
        .get_matrix(matrix.id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, Status::Complete);
}

#[test]
fn success_without_output_is_rejected() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix();

    let result = fixture
        .service()
        .apply_matrix_report(matrix.id.unwrap(), &EngineReport::Success { artifact: None });
    assert!(matches!(
        result,
        Err(StatusServiceError::ArtifactMissing { .. })
    ));
}

#[test]
fn failure_codes_mark_only_the_reported_column() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix();
    let service = fixture.service();

    let retry = service
        .apply_column_report(
            matrix.columns[0].id.unwrap(),
            &EngineReport::Failure {
                code: codes::IO_WAIT_ERROR,
            },
        )
        .unwrap();
    assert_eq!(retry.status, Status::RecoverableError);

    let fatal = service
        .apply_column_report(
            matrix.columns[1].id.unwrap(),
            &EngineReport::Failure {
                code: codes::LAYER_DATA_ERROR,
            },
        )
        .unwrap();
    assert_eq!(fatal.status, Status::FatalError);

    let stored = SqliteCatalog::new(&fixture.conn)
        .get_matrix(matrix.id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, Status::Initialized);
    assert!(stored.has_fatal_column());
}

#[test]
fn column_success_can_point_at_a_new_artifact() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix();
    let moved = fixture.path("moved.json");
    touch(&moved);

    let column = fixture
        .service()
        .apply_column_report(
            matrix.columns[1].id.unwrap(),
            &EngineReport::Success {
                artifact: Some(moved.clone().into()),
            },
        )
        .unwrap();
    assert_eq!(column.status, Status::Complete);
    assert_eq!(column.dlocation.as_deref(), Some(moved.as_str()));
}

#[test]
fn stockpile_writes_success_file_once_matrix_completes() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix();
    for column in &matrix.columns {
        touch(column.dlocation.as_deref().unwrap());
    }
    touch(matrix.dlocation.as_deref().unwrap());
    let success = fixture.dir.path().join("gridset").join("grim.success");

    let service = fixture.service();
    let stockpiled = service
        .stockpile(
            matrix.id.unwrap(),
            &success,
            &EngineReport::Success { artifact: None },
        )
        .unwrap();
    assert_eq!(stockpiled.status, Status::Complete);
    assert!(stockpiled
        .columns
        .iter()
        .all(|column| column.status == Status::Complete));
    let body = std::fs::read_to_string(&success).unwrap();
    assert!(body.contains("status=complete"));
    assert!(body.contains("columns=2"));

    let again = service
        .stockpile(
            matrix.id.unwrap(),
            &success,
            &EngineReport::Success { artifact: None },
        )
        .unwrap();
    assert_eq!(again.status, Status::Complete);
}

#[test]
fn failed_stockpile_leaves_no_success_file() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix();
    let success = fixture.dir.path().join("grim.success");

    let failed = fixture
        .service()
        .stockpile(
            matrix.id.unwrap(),
            &success,
            &EngineReport::Failure {
                code: codes::REMOTE_KILL,
            },
        )
        .unwrap();
    assert_eq!(failed.status, Status::RecoverableError);
    assert!(!Path::new(&success).exists());
}

#[test]
fn chain_reports_update_bookkeeping() {
    let fixture = Fixture::new();
    let repo = SqliteChainRepository::new(&fixture.conn);
    let id = repo
        .insert_chain(&Chain::new("alice", Priority::NORMAL, 1))
        .unwrap();

    let chain = fixture
        .service()
        .apply_chain_report(id, &EngineReport::Failure { code: 42 })
        .unwrap();
    assert_eq!(chain.status, Status::FatalError);
    assert_eq!(repo.get_chain(id).unwrap().unwrap().status, Status::FatalError);
    assert!(repo.list_pending_chains(10).unwrap().is_empty());
}
