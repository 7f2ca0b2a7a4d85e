//! Filesystem layout for archive artifacts.
//!
//! Every path derives from owner-scoped natural keys, so a repeated run
//! resolves the same entity to the same file.

use crate::model::identity::EntityId;
use crate::model::matrix::MatrixType;
use std::path::{Path, PathBuf};

const ARCHIVE_DIR: &str = "archive";
const CHAIN_DIR: &str = "makeflow";
const SHAPEGRID_DIR: &str = "shapegrids";
const GRIDSET_DIR: &str = "gridsets";
const MATRIX_EXT: &str = "lmm";
const VECTOR_EXT: &str = "shp";
const RASTER_EXT: &str = "tif";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLocator {
    data_root: PathBuf,
    env_data_dir: PathBuf,
}

impl PathLocator {
    pub fn new(data_root: impl Into<PathBuf>, env_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            env_data_dir: env_data_dir.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn user_dir(&self, owner: &str) -> PathBuf {
        self.data_root.join(ARCHIVE_DIR).join(owner)
    }

    pub fn chain_document(&self, owner: &str, chain_id: EntityId) -> PathBuf {
        self.user_dir(owner)
            .join(CHAIN_DIR)
            .join(format!("mf_{chain_id}.mf"))
    }

    pub fn config_record(&self, owner: &str, archive_name: &str) -> PathBuf {
        self.user_dir(owner).join(format!("{archive_name}.toml"))
    }

    /// Written by the per-species step when it finishes.
    pub fn species_success(&self, owner: &str, archive_name: &str) -> PathBuf {
        self.user_dir(owner).join(format!("{archive_name}.success"))
    }

    pub fn taxonomy_success(&self, owner: &str, source_name: &str) -> PathBuf {
        self.user_dir(owner)
            .join(format!("taxonomy_{source_name}.success"))
    }

    pub fn shapegrid(&self, owner: &str, grid_name: &str) -> PathBuf {
        self.user_dir(owner)
            .join(SHAPEGRID_DIR)
            .join(format!("{grid_name}.grid"))
    }

    pub fn gridset_dir(&self, owner: &str, gridset_name: &str) -> PathBuf {
        self.user_dir(owner).join(GRIDSET_DIR).join(gridset_name)
    }

    pub fn matrix_file(
        &self,
        owner: &str,
        gridset_name: &str,
        matrix_type: MatrixType,
        scenario_code: &str,
    ) -> PathBuf {
        self.gridset_dir(owner, gridset_name).join(format!(
            "{}_{scenario_code}.{MATRIX_EXT}",
            matrix_type.as_db()
        ))
    }

    pub fn matrix_success(
        &self,
        owner: &str,
        gridset_name: &str,
        matrix_type: MatrixType,
        scenario_code: &str,
    ) -> PathBuf {
        self.gridset_dir(owner, gridset_name).join(format!(
            "{}_{scenario_code}.success",
            matrix_type.as_db()
        ))
    }

    pub fn column_file(
        &self,
        owner: &str,
        gridset_name: &str,
        matrix_type: MatrixType,
        scenario_code: &str,
        ident: &str,
    ) -> PathBuf {
        self.gridset_dir(owner, gridset_name)
            .join(format!("{}_{scenario_code}", matrix_type.as_db()))
            .join(format!("{ident}.{MATRIX_EXT}"))
    }

    /// Single-file matrices that belong to the gridset, not a scenario.
    pub fn gridset_matrix_file(
        &self,
        owner: &str,
        gridset_name: &str,
        matrix_type: MatrixType,
    ) -> PathBuf {
        self.gridset_dir(owner, gridset_name)
            .join(format!("{}.{MATRIX_EXT}", matrix_type.as_db()))
    }

    /// Files an uploaded layer may be stored as, vector first.
    pub fn user_layer_candidates(&self, owner: &str, name: &str) -> [PathBuf; 2] {
        let dir = self.user_dir(owner);
        [
            dir.join(format!("{name}.{VECTOR_EXT}")),
            dir.join(format!("{name}.{RASTER_EXT}")),
        ]
    }

    /// Directory holding a set of uploaded vector layers.
    pub fn user_layer_dir(&self, owner: &str, name: &str) -> PathBuf {
        self.user_dir(owner).join(name)
    }

    pub fn is_vector(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(VECTOR_EXT))
    }

    /// Where a scenario package description may live, most specific first.
    pub fn package_metadata_candidates(&self, owner: &str, package_name: &str) -> Vec<PathBuf> {
        let file_name = format!("{package_name}.toml");
        vec![
            self.user_dir(owner).join(&file_name),
            self.env_data_dir.join(file_name),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::PathLocator;
    use crate::model::matrix::MatrixType;
    use std::path::PathBuf;
    use uuid::Uuid;

    #[test]
    fn layout_is_rooted_in_owner_dir() {
        let locator = PathLocator::new("/data", "/env");
        let id = Uuid::nil();
        assert_eq!(
            locator.chain_document("alice", id),
            PathBuf::from(format!("/data/archive/alice/makeflow/mf_{id}.mf"))
        );
        assert_eq!(
            locator.column_file("alice", "gs", MatrixType::Grim, "obs", "bio1"),
            PathBuf::from("/data/archive/alice/gridsets/gs/grim_obs/bio1.lmm")
        );
        assert_eq!(
            locator.user_layer_candidates("alice", "ecoregions"),
            [
                PathBuf::from("/data/archive/alice/ecoregions.shp"),
                PathBuf::from("/data/archive/alice/ecoregions.tif")
            ]
        );
        assert_eq!(
            locator.gridset_matrix_file("alice", "gs", MatrixType::BiogeoHypotheses),
            PathBuf::from("/data/archive/alice/gridsets/gs/biogeo_hypotheses.lmm")
        );
        assert!(PathLocator::is_vector(&PathBuf::from("/x/a.SHP")));
        assert_eq!(
            locator.package_metadata_candidates("alice", "pkg"),
            vec![
                PathBuf::from("/data/archive/alice/pkg.toml"),
                PathBuf::from("/env/pkg.toml")
            ]
        );
    }
}
