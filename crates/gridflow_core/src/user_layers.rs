//! Layers uploaded to a user directory outside any scenario package.
//!
//! Other layers are found by name as `<name>.shp`, then `<name>.tif`.
//! Biogeographic hypotheses are one shapefile or a directory of shapefiles;
//! each may sit next to a `<stem>.json` object describing it.

use crate::config::{validate_name, ConfigurationError};
use crate::locator::PathLocator;
use crate::model::metadata::Metadata;
use log::warn;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Keyword stamped on every hypothesis layer.
pub const HYPOTHESIS_KEYWORD: &str = "biogeographic hypothesis";
/// Keyword stamped on the matrix that holds them.
pub const HYPOTHESES_MATRIX_KEYWORD: &str = "biogeographic hypotheses";

/// First existing file for an uploaded layer name.
pub fn find_user_layer(locator: &PathLocator, owner: &str, name: &str) -> Option<PathBuf> {
    locator
        .user_layer_candidates(owner, name)
        .into_iter()
        .find(|path| path.is_file())
}

/// Hypothesis shapefiles for `name`, sorted by path.
///
/// Nothing at either location is a warning, not an error.
pub fn hypothesis_files(
    locator: &PathLocator,
    owner: &str,
    name: &str,
) -> Result<Vec<PathBuf>, ConfigurationError> {
    let [single, _] = locator.user_layer_candidates(owner, name);
    if single.is_file() {
        return Ok(vec![single]);
    }

    let dir = locator.user_layer_dir(owner, name);
    if !dir.is_dir() {
        warn!(
            "event=biogeo_lookup module=user_layers status=error owner={} name={} reason=not_found",
            owner, name
        );
        return Ok(Vec::new());
    }

    let io_error = |source| ConfigurationError::Io {
        path: dir.clone(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.is_file() && PathLocator::is_vector(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// One hypothesis layer with its sidecar description applied.
#[derive(Debug, Clone, PartialEq)]
pub struct HypothesisLayer {
    pub name: String,
    pub path: PathBuf,
    /// Attribute carrying the hypothesis value; unset means the feature itself.
    pub value_name: Option<String>,
    pub metadata: Metadata,
}

impl HypothesisLayer {
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| {
                ConfigurationError::invalid(
                    "biogeo_hypotheses",
                    format!("`{}` has no usable file name", path.display()),
                )
            })?;

        let mut layer = Self {
            name: stem.to_string(),
            path: path.to_path_buf(),
            value_name: None,
            metadata: Metadata {
                description: Some(format!(
                    "Biogeographic hypothesis based on layer {}",
                    path.display()
                )),
                ..Metadata::default()
            },
        };

        let sidecar = path.with_extension("json");
        if sidecar.is_file() {
            layer.apply_sidecar(&sidecar)?;
        }
        if !layer.metadata.keywords.iter().any(|k| k == HYPOTHESIS_KEYWORD) {
            layer.metadata.keywords.push(HYPOTHESIS_KEYWORD.to_string());
        }
        validate_name("biogeo_hypotheses.name", &layer.name)?;
        Ok(layer)
    }

    fn apply_sidecar(&mut self, sidecar: &Path) -> Result<(), ConfigurationError> {
        let text = std::fs::read_to_string(sidecar).map_err(|source| ConfigurationError::Io {
            path: sidecar.to_path_buf(),
            source,
        })?;
        let invalid = |message: String| {
            ConfigurationError::invalid(
                "biogeo_hypotheses",
                format!("`{}`: {message}", sidecar.display()),
            )
        };
        let Value::Object(fields) =
            serde_json::from_str::<Value>(&text).map_err(|err| invalid(err.to_string()))?
        else {
            return Err(invalid("metadata must be a JSON object".to_string()));
        };

        // Keys are matched case-insensitively.
        for (key, value) in fields {
            let key = key.to_ascii_lowercase();
            match (key.as_str(), value) {
                ("name", Value::String(name)) => self.name = name,
                ("val_name" | "value_name", Value::String(name)) => self.value_name = Some(name),
                ("title", Value::String(title)) => self.metadata.title = Some(title),
                ("description", Value::String(text)) => self.metadata.description = Some(text),
                ("keywords", Value::String(list)) => {
                    self.add_keywords(list.split(',').map(str::trim));
                }
                ("keywords", Value::Array(items)) => {
                    self.add_keywords(items.iter().filter_map(Value::as_str).map(str::trim));
                }
                (_, value) => {
                    self.metadata.extra.insert(key.clone(), value);
                }
            }
        }
        Ok(())
    }

    fn add_keywords<'a>(&mut self, keywords: impl Iterator<Item = &'a str>) {
        for keyword in keywords.filter(|keyword| !keyword.is_empty()) {
            if !self.metadata.keywords.iter().any(|k| k == keyword) {
                self.metadata.keywords.push(keyword.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{find_user_layer, hypothesis_files, HypothesisLayer, HYPOTHESIS_KEYWORD};
    use crate::config::ConfigurationError;
    use crate::locator::PathLocator;

    fn locator(root: &std::path::Path) -> PathLocator {
        PathLocator::new(root.join("data"), root.join("env"))
    }

    fn touch(path: &std::path::Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"layer").unwrap();
    }

    #[test]
    fn vector_upload_wins_over_raster() {
        let dir = tempfile::tempdir().unwrap();
        let locator = locator(dir.path());
        let [vector, raster] = locator.user_layer_candidates("alice", "mask");
        touch(&raster);
        assert_eq!(find_user_layer(&locator, "alice", "mask"), Some(raster));
        touch(&vector);
        assert_eq!(find_user_layer(&locator, "alice", "mask"), Some(vector));
        assert_eq!(find_user_layer(&locator, "alice", "absent"), None);
    }

    #[test]
    fn hypothesis_directory_lists_shapefiles_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let locator = locator(dir.path());
        let set = locator.user_layer_dir("alice", "hypotheses");
        touch(&set.join("b_rivers.shp"));
        touch(&set.join("a_mountains.shp"));
        touch(&set.join("a_mountains.json"));

        let files = hypothesis_files(&locator, "alice", "hypotheses").unwrap();
        assert_eq!(
            files,
            vec![set.join("a_mountains.shp"), set.join("b_rivers.shp")]
        );
        assert!(hypothesis_files(&locator, "alice", "nothing")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn sidecar_overrides_name_and_adds_keywords() {
        let dir = tempfile::tempdir().unwrap();
        let shapefile = dir.path().join("ecoregions.shp");
        touch(&shapefile);
        std::fs::write(
            dir.path().join("ecoregions.json"),
            r#"{"Name": "ecoregions-2001", "VAL_NAME": "ECO_ID", "keywords": "ecology, regions", "source": "wwf"}"#,
        )
        .unwrap();

        let layer = HypothesisLayer::load(&shapefile).unwrap();
        assert_eq!(layer.name, "ecoregions-2001");
        assert_eq!(layer.value_name.as_deref(), Some("ECO_ID"));
        assert_eq!(
            layer.metadata.keywords,
            vec!["ecology", "regions", HYPOTHESIS_KEYWORD]
        );
        assert_eq!(
            layer.metadata.extra.get("source"),
            Some(&serde_json::json!("wwf"))
        );
    }

    #[test]
    fn layer_without_sidecar_uses_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let shapefile = dir.path().join("rivers.shp");
        touch(&shapefile);

        let layer = HypothesisLayer::load(&shapefile).unwrap();
        assert_eq!(layer.name, "rivers");
        assert_eq!(layer.value_name, None);
        assert!(layer
            .metadata
            .description
            .as_deref()
            .unwrap()
            .contains("rivers.shp"));
    }

    #[test]
    fn non_object_sidecar_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let shapefile = dir.path().join("rivers.shp");
        touch(&shapefile);
        std::fs::write(dir.path().join("rivers.json"), "[1, 2]").unwrap();

        assert!(matches!(
            HypothesisLayer::load(&shapefile),
            Err(ConfigurationError::Invalid { .. })
        ));
    }
}
