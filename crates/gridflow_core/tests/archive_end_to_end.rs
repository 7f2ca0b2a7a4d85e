use gridflow_core::db::open_db;
use gridflow_core::model::matrix::MatrixType;
use gridflow_core::model::status::Status;
use gridflow_core::{
    ArchiveError, ArchiveOrchestrator, ArchiveOutcome, ArchiveRecord, ArchiveRequest,
    CatalogRepository, ChainRepository, FixedClock, FsLayerIo, Priority, SiteConfig,
    SqliteCatalog, SqliteChainRepository,
};
use rusqlite::Connection;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const COUNTED_TABLES: [&str; 12] = [
    "users",
    "taxon_sources",
    "algorithms",
    "scenario_packages",
    "scenarios",
    "layers",
    "scenario_layers",
    "shapegrids",
    "gridsets",
    "matrices",
    "matrix_columns",
    "chains",
];

struct Workspace {
    dir: tempfile::TempDir,
    site: SiteConfig,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let site = SiteConfig {
            data_root: dir.path().join("data"),
            ..SiteConfig::default()
        };
        std::fs::create_dir_all(&site.data_root).unwrap();
        Self { dir, site }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn connect(&self) -> Connection {
        open_db(self.site.database_path()).unwrap()
    }

    /// Writes a package description with non-empty layer files.
    fn write_package(&self, name: &str, base_code: &str, scenarios: &[&str], layers: &[&str]) {
        let env_dir = self.site.env_data_dir();
        let mut description = format!(
            "base_code = \"{base_code}\"\nepsg = 4326\nmap_units = \"dd\"\nbbox = [-10.0, -10.0, 10.0, 10.0]\n"
        );
        for code in scenarios {
            let _ = write!(description, "\n[[scenario]]\ncode = \"{code}\"\n");
            for layer in layers {
                let file = format!("{code}/{layer}.tif");
                let path = env_dir.join(&file);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, b"raster").unwrap();
                let _ = write!(
                    description,
                    "\n[[scenario.layer]]\nname = \"{layer}-{code}\"\nenv_code = \"{layer}\"\nfile = \"{file}\"\n"
                );
            }
        }
        std::fs::write(env_dir.join(format!("{name}.toml")), description).unwrap();
    }

    fn write_request(&self, file_name: &str, content: &str) -> PathBuf {
        let path = self.root().join(file_name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn run(
        &self,
        conn: &Connection,
        request: &Path,
        intersect: bool,
    ) -> Result<ArchiveOutcome, ArchiveError> {
        let request = ArchiveRequest::from_file(request, &self.site).unwrap();
        ArchiveOrchestrator::new(
            SqliteCatalog::new(conn),
            SqliteChainRepository::new(conn),
            Box::new(FsLayerIo),
            Arc::new(FixedClock::new(1_000)),
            self.site.clone(),
        )
        .with_intersect_chains(intersect)
        .run(&request)
    }
}

fn row_counts(conn: &Connection) -> Vec<(&'static str, i64)> {
    COUNTED_TABLES
        .iter()
        .map(|table| {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            (*table, count)
        })
        .collect()
}

const HEUCHERA_REQUEST: &str = r#"
archive_name = "heuchera"
owner = "alice"
email = "alice@example.org"
data_source = "user"
occurrence_file = "points.csv"
occurrence_metadata_file = "points.json"
scenario_package = "biotaphy"
model_scenario = "observed"
projection_scenarios = ["observed", "future"]

[grid]
cell_size = 1.0

[intersect]
min_presence = 10.0
max_presence = 100.0

[[algorithm]]
code = "BIOCLIM"
parameters = { std_dev = 0.674 }
"#;

#[test]
fn archive_run_authors_intersect_and_start_chains() {
    let workspace = Workspace::new();
    workspace.write_package(
        "biotaphy",
        "observed",
        &["observed", "future", "past"],
        &["bio1", "bio12", "elev"],
    );
    let request = workspace.write_request("heuchera.toml", HEUCHERA_REQUEST);
    let conn = workspace.connect();

    let outcome = workspace.run(&conn, &request, true).unwrap();

    // One PAM and one GRIM per projection.
    assert_eq!(outcome.gridset.matrices.len(), 4);
    let grims: Vec<_> = outcome
        .gridset
        .matrices
        .iter()
        .filter(|matrix| matrix.matrix_type == MatrixType::Grim)
        .collect();
    assert_eq!(grims.len(), 2);
    assert!(grims.iter().all(|grim| grim.columns.len() == 3));
    let pam = outcome
        .gridset
        .matrices
        .iter()
        .find(|matrix| matrix.matrix_type == MatrixType::Pam)
        .unwrap();
    assert_eq!(
        pam.metadata.extra.get("is_rolling"),
        Some(&serde_json::Value::Bool(true))
    );

    assert_eq!(outcome.intersect_chains.len(), 2);
    for chain in &outcome.intersect_chains {
        assert_eq!(chain.rules.len(), 5);
        assert_eq!(chain.priority, Priority::REQUESTED);
        assert_eq!(chain.status, Status::Initialized);
        assert!(Path::new(chain.dlocation.as_deref().unwrap()).is_file());
    }

    assert_eq!(outcome.start_chain.rules.len(), 1);
    let config_record = outcome.config_record.display().to_string();
    assert_eq!(
        outcome.start_chain.rules[0].dependencies,
        vec![config_record.clone()]
    );
    let document =
        std::fs::read_to_string(outcome.start_chain.dlocation.as_deref().unwrap()).unwrap();
    assert!(document.contains(&config_record));

    let record_text = std::fs::read_to_string(&outcome.config_record).unwrap();
    let record = ArchiveRecord::from_toml(&record_text).unwrap();
    assert_eq!(record.archive.model_scenario, "observed");
    assert_eq!(record.archive.projection_scenarios, vec!["observed", "future"]);
    assert_eq!(record.archive.grid_name, "heuchera-grid");
    assert!(record.algorithm.contains_key("01_BIOCLIM"));

    let catalog = SqliteCatalog::new(&conn);
    let grim = catalog.get_matrix(grims[0].id.unwrap()).unwrap().unwrap();
    assert_eq!(grim.status, Status::Initialized);
    assert!(grim
        .columns
        .iter()
        .all(|column| column.status == Status::Initialized));
    assert!(Path::new(outcome.shapegrid.spatial.dlocation.as_deref().unwrap()).is_file());
    assert_eq!(outcome.shapegrid.status, Status::Complete);
}

#[test]
fn rerun_reuses_catalog_rows_and_replaces_chains() {
    let workspace = Workspace::new();
    workspace.write_package(
        "biotaphy",
        "observed",
        &["observed", "future", "past"],
        &["bio1", "bio12", "elev"],
    );
    let request = workspace.write_request("heuchera.toml", HEUCHERA_REQUEST);
    let conn = workspace.connect();

    let first = workspace.run(&conn, &request, true).unwrap();
    let counts = row_counts(&conn);
    let second = workspace.run(&conn, &request, true).unwrap();

    assert_eq!(row_counts(&conn), counts);
    assert_eq!(first.gridset.id, second.gridset.id);
    assert_eq!(first.shapegrid.id, second.shapegrid.id);
    assert_eq!(second.intersect_chains.len(), 2);

    for chain in first.chains() {
        assert!(!Path::new(chain.dlocation.as_deref().unwrap()).exists());
    }
    let chains = SqliteChainRepository::new(&conn);
    let stored = chains
        .list_chains_for_gridset(second.gridset.id.unwrap())
        .unwrap();
    assert_eq!(stored.len(), 3);
}

#[test]
fn fatal_matrix_is_left_for_the_operator_on_rerun() {
    let workspace = Workspace::new();
    workspace.write_package(
        "biotaphy",
        "observed",
        &["observed", "future"],
        &["bio1", "bio12", "elev"],
    );
    let request = workspace.write_request("heuchera.toml", HEUCHERA_REQUEST);
    let conn = workspace.connect();
    let first = workspace.run(&conn, &request, true).unwrap();

    let catalog = SqliteCatalog::new(&conn);
    let grim_ids: Vec<_> = first
        .gridset
        .matrices
        .iter()
        .filter(|matrix| matrix.matrix_type == MatrixType::Grim)
        .filter_map(|matrix| matrix.id)
        .collect();
    let mut fatal = catalog.get_matrix(grim_ids[0]).unwrap().unwrap();
    fatal.status = Status::FatalError;
    catalog.update_matrix(&fatal).unwrap();

    let second = workspace.run(&conn, &request, true).unwrap();

    assert_eq!(second.intersect_chains.len(), 1);
    let fatal_id = grim_ids[0].to_string();
    assert!(second.intersect_chains[0]
        .rules
        .iter()
        .all(|rule| !rule.command.contains(&fatal_id)));
    assert_eq!(
        catalog.get_matrix(grim_ids[0]).unwrap().unwrap().status,
        Status::FatalError
    );
    assert_eq!(
        catalog.get_matrix(grim_ids[1]).unwrap().unwrap().status,
        Status::Initialized
    );
    let stored = SqliteChainRepository::new(&conn)
        .list_chains_for_gridset(second.gridset.id.unwrap())
        .unwrap();
    assert_eq!(stored.len(), 2);
}

#[test]
fn failed_rerun_keeps_previous_chains() {
    let workspace = Workspace::new();
    workspace.write_package("wide", "observed", &["observed"], &["bio1", "bio2"]);
    let request = workspace.write_request(
        "wide.toml",
        r#"
        archive_name = "wide"
        owner = "alice"
        data_source = "existing"
        occurrence_id_file = "ids.txt"
        scenario_package = "wide"
        assemble_pams = false

        [grid]
        cell_size = 0.5
        "#,
    );
    let conn = workspace.connect();
    let first = workspace.run(&conn, &request, true).unwrap();

    // A directory in place of the record makes the rerun fail after
    // the catalog is reconciled.
    std::fs::remove_file(&first.config_record).unwrap();
    std::fs::create_dir_all(&first.config_record).unwrap();
    assert!(workspace.run(&conn, &request, true).is_err());

    let chains = SqliteChainRepository::new(&conn);
    for chain in first.chains() {
        let stored = chains.get_chain(chain.id.unwrap()).unwrap();
        assert!(stored.is_some());
        assert!(Path::new(chain.dlocation.as_deref().unwrap()).is_file());
    }
}

#[test]
fn uploaded_layers_and_hypotheses_are_cataloged() {
    let workspace = Workspace::new();
    workspace.write_package("biotaphy", "observed", &["observed"], &["bio1"]);
    let user_dir = workspace.site.locator().user_dir("alice");
    let hypotheses = user_dir.join("hypotheses");
    std::fs::create_dir_all(&hypotheses).unwrap();
    std::fs::write(hypotheses.join("mountains.shp"), b"vector").unwrap();
    std::fs::write(hypotheses.join("rivers.shp"), b"vector").unwrap();
    std::fs::write(
        hypotheses.join("rivers.json"),
        r#"{"name": "rivers-1990", "val_name": "BASIN"}"#,
    )
    .unwrap();
    std::fs::write(user_dir.join("ecoregions.tif"), b"raster").unwrap();

    let content = format!(
        "other_layers = [\"ecoregions\", \"absent\"]\nbiogeo_hypotheses = \"hypotheses\"\n{HEUCHERA_REQUEST}\n[sdm_mask]\ncode = \"hull_region_intersect\"\nparameters = {{ buffer = 0.5 }}\n"
    )
    .replace("projection_scenarios = [\"observed\", \"future\"]", "");
    let request = workspace.write_request("heuchera.toml", &content);
    let conn = workspace.connect();

    let outcome = workspace.run(&conn, &request, false).unwrap();

    let others: Vec<&str> = outcome
        .other_layers
        .iter()
        .map(|layer| layer.name.as_str())
        .collect();
    assert_eq!(others, vec!["ecoregions"]);
    assert_eq!(
        outcome.other_layers[0].spatial.data_format.as_deref(),
        Some("GTiff")
    );

    let hypotheses_matrix = outcome
        .gridset
        .matrices
        .iter()
        .find(|matrix| matrix.matrix_type == MatrixType::BiogeoHypotheses)
        .unwrap();
    let idents: Vec<&str> = hypotheses_matrix
        .columns
        .iter()
        .map(|column| column.ident.as_str())
        .collect();
    assert_eq!(idents, vec!["mountains", "rivers-1990"]);
    assert_eq!(
        hypotheses_matrix.columns[1]
            .intersect_params
            .get("value_name")
            .and_then(|value| value.as_str()),
        Some("BASIN")
    );
    assert!(hypotheses_matrix
        .metadata
        .keywords
        .contains(&"Layer rivers-1990".to_string()));

    let record_text = std::fs::read_to_string(&outcome.config_record).unwrap();
    let record = ArchiveRecord::from_toml(&record_text).unwrap();
    assert_eq!(record.archive.other_layers, vec!["ecoregions"]);
    assert_eq!(
        record.archive.biogeo_hypotheses,
        vec!["mountains", "rivers-1990"]
    );
    assert_eq!(
        record.sdm_mask.map(|mask| mask.code),
        Some("hull_region_intersect".to_string())
    );
    let mask = SqliteCatalog::new(&conn)
        .get_algorithm(gridflow_core::Lookup::Key {
            owner: "public",
            name: "hull_region_intersect",
        })
        .unwrap();
    assert!(mask.is_some());

    let counts = row_counts(&conn);
    workspace.run(&conn, &request, false).unwrap();
    assert_eq!(row_counts(&conn), counts);
}

#[test]
fn grim_chain_fans_in_every_column() {
    let workspace = Workspace::new();
    workspace.write_package(
        "wide",
        "observed",
        &["observed"],
        &["bio1", "bio2", "bio3", "bio4", "bio5"],
    );
    let request = workspace.write_request(
        "wide.toml",
        r#"
        archive_name = "wide"
        owner = "alice"
        data_source = "existing"
        occurrence_id_file = "ids.txt"
        scenario_package = "wide"
        assemble_pams = false

        [grid]
        cell_size = 0.5
        "#,
    );
    let conn = workspace.connect();

    let outcome = workspace.run(&conn, &request, true).unwrap();
    assert_eq!(outcome.intersect_chains.len(), 1);
    let rules = &outcome.intersect_chains[0].rules;
    assert_eq!(rules.len(), 7);

    let shapegrid = outcome.shapegrid.spatial.dlocation.clone().unwrap();
    let leaves = &rules[..5];
    assert!(leaves
        .iter()
        .all(|rule| rule.dependencies.len() == 2 && rule.dependencies[0] == shapegrid));
    let concatenate = &rules[5];
    let leaf_outputs: Vec<String> = leaves
        .iter()
        .flat_map(|rule| rule.outputs.iter().cloned())
        .collect();
    assert_eq!(concatenate.dependencies, leaf_outputs);
    let stockpile = &rules[6];
    assert_eq!(stockpile.dependencies, concatenate.outputs);
    assert!(stockpile.local);
}

#[test]
fn finished_columns_are_not_rescheduled() {
    let workspace = Workspace::new();
    workspace.write_package("wide", "observed", &["observed"], &["bio1", "bio2", "bio3"]);
    let request = workspace.write_request(
        "wide.toml",
        r#"
        archive_name = "wide"
        owner = "alice"
        data_source = "existing"
        occurrence_id_file = "ids.txt"
        scenario_package = "wide"
        assemble_pams = false

        [grid]
        cell_size = 0.5
        "#,
    );
    let conn = workspace.connect();
    let first = workspace.run(&conn, &request, true).unwrap();

    let catalog = SqliteCatalog::new(&conn);
    let grim = &first.gridset.matrices[0];
    let mut done = catalog
        .get_matrix_column(grim.columns[0].id.unwrap())
        .unwrap()
        .unwrap();
    let done_output = PathBuf::from(done.dlocation.clone().unwrap());
    std::fs::create_dir_all(done_output.parent().unwrap()).unwrap();
    std::fs::write(&done_output, b"column").unwrap();
    done.status = Status::Complete;
    catalog.update_matrix_column(&done).unwrap();

    let second = workspace.run(&conn, &request, true).unwrap();
    let rules = &second.intersect_chains[0].rules;
    assert_eq!(rules.len(), 4);
    assert_eq!(rules[2].dependencies.len(), 3);
    assert!(rules[2]
        .dependencies
        .contains(&done_output.display().to_string()));
}

#[test]
fn gbif_taxonomy_runs_before_species_step() {
    let workspace = Workspace::new();
    workspace.write_package("pkg", "observed", &["observed"], &["bio1"]);
    std::fs::write(workspace.root().join("backbone.csv"), b"taxa").unwrap();
    let request = workspace.write_request(
        "gbif.toml",
        r#"
        archive_name = "plants"
        data_source = "gbif"
        occurrence_file = "occurrences.csv"
        gbif_taxonomy_file = "backbone.csv"
        scenario_package = "pkg"
        assemble_pams = false

        [grid]
        cell_size = 2.0
        "#,
    );
    let conn = workspace.connect();

    let outcome = workspace.run(&conn, &request, false).unwrap();
    assert!(outcome.intersect_chains.is_empty());
    assert_eq!(outcome.start_chain.priority, Priority::NORMAL);

    let rules = &outcome.start_chain.rules;
    assert_eq!(rules.len(), 2);
    let taxonomy_success = rules[0].outputs[0].clone();
    assert!(rules[1].dependencies.contains(&taxonomy_success));
    assert!(rules[1]
        .dependencies
        .contains(&outcome.config_record.display().to_string()));

    let source = SqliteCatalog::new(&conn)
        .get_taxon_source(gridflow_core::Lookup::Key {
            owner: "public",
            name: "gbif_backbone",
        })
        .unwrap();
    assert!(source.is_some());
}

#[test]
fn unknown_model_scenario_writes_no_chains() {
    let workspace = Workspace::new();
    workspace.write_package("pkg", "observed", &["observed"], &["bio1"]);
    let request = workspace.write_request(
        "bad.toml",
        r#"
        archive_name = "plants"
        owner = "alice"
        data_source = "existing"
        occurrence_id_file = "ids.txt"
        scenario_package = "pkg"
        model_scenario = "miocene"
        assemble_pams = false

        [grid]
        cell_size = 2.0
        "#,
    );
    let conn = workspace.connect();

    let err = workspace.run(&conn, &request, true).unwrap_err();
    assert!(matches!(err, ArchiveError::Configuration(_)));
    let chains: i64 = conn
        .query_row("SELECT COUNT(*) FROM chains", [], |row| row.get(0))
        .unwrap();
    assert_eq!(chains, 0);
}

#[test]
fn missing_package_is_a_configuration_error() {
    let workspace = Workspace::new();
    let request = workspace.write_request(
        "nopkg.toml",
        r#"
        archive_name = "plants"
        data_source = "existing"
        occurrence_id_file = "ids.txt"
        scenario_package = "nowhere"
        assemble_pams = false

        [grid]
        cell_size = 2.0
        "#,
    );
    let conn = workspace.connect();

    let err = workspace.run(&conn, &request, false).unwrap_err();
    assert!(matches!(err, ArchiveError::Configuration(_)));
}
