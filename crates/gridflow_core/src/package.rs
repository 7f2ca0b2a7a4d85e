//! Scenario package description files.
//!
//! A package that is not yet in the catalog is described by a TOML file:
//!
//! ```toml
//! base_code = "observed"
//! epsg = 4326
//! map_units = "dd"
//! bbox = [-180.0, -60.0, 180.0, 90.0]
//!
//! [[scenario]]
//! code = "observed"
//!
//! [[scenario.layer]]
//! name = "bio1-observed"
//! env_code = "bio1"
//! file = "observed/bio1.tif"
//! ```
//!
//! Layer files are relative to the description file.

use crate::config::{read_toml_file, validate_name, ConfigurationError};
use crate::model::metadata::Metadata;
use crate::model::scenario::{Layer, Scenario, ScenarioPackage};
use crate::model::spatial::{BoundingBox, SpatialPayload};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PackageDescription {
    pub name: Option<String>,
    pub title: Option<String>,
    pub base_code: Option<String>,
    pub epsg: Option<u32>,
    pub map_units: Option<String>,
    pub resolution: Option<f64>,
    pub bbox: Option<BoundingBox>,
    pub scenario: Vec<ScenarioDescription>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScenarioDescription {
    pub code: Option<String>,
    pub title: Option<String>,
    pub bbox: Option<BoundingBox>,
    pub layer: Vec<LayerDescription>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LayerDescription {
    pub name: Option<String>,
    pub env_code: Option<String>,
    pub squid: Option<String>,
    pub title: Option<String>,
    pub file: Option<PathBuf>,
}

impl PackageDescription {
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        read_toml_file(path)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(content).map_err(|source| ConfigurationError::Parse { path: None, source })
    }

    /// Builds the unsaved package tree.
    ///
    /// Scenario and layer spatial attributes default to the package's.
    pub fn into_package(
        self,
        owner: &str,
        requested_name: &str,
        base_dir: Option<&Path>,
        mod_time: i64,
    ) -> Result<ScenarioPackage, ConfigurationError> {
        let name = self.name.unwrap_or_else(|| requested_name.to_string());
        if name != requested_name {
            return Err(ConfigurationError::invalid(
                "scenario_package",
                format!("description names `{name}`, request asked for `{requested_name}`"),
            ));
        }
        if self.scenario.is_empty() {
            return Err(ConfigurationError::missing("scenario_package.scenario"));
        }

        let shared = SpatialPayload {
            epsg: self.epsg,
            map_units: self.map_units,
            resolution: self.resolution,
            bbox: self.bbox,
            ..SpatialPayload::default()
        };

        let mut package = ScenarioPackage::new(owner, name, mod_time);
        package.base_code = self.base_code;
        package.spatial = shared.clone();
        package.metadata.title = self.title;

        let mut codes = HashSet::new();
        for (scenario_index, raw) in self.scenario.into_iter().enumerate() {
            let code = raw.code.ok_or_else(|| {
                ConfigurationError::missing(format!("scenario[{scenario_index}].code"))
            })?;
            validate_name("scenario.code", &code)?;
            if !codes.insert(code.clone()) {
                return Err(ConfigurationError::invalid(
                    "scenario.code",
                    format!("`{code}` appears twice"),
                ));
            }

            let mut scenario = Scenario::new(owner, code, mod_time);
            scenario.spatial = shared.clone();
            if raw.bbox.is_some() {
                scenario.spatial.bbox = raw.bbox;
            }
            scenario.metadata.title = raw.title;

            for (layer_index, layer) in raw.layer.into_iter().enumerate() {
                let key = format!("scenario[{scenario_index}].layer[{layer_index}]");
                let name = layer
                    .name
                    .ok_or_else(|| ConfigurationError::missing(format!("{key}.name")))?;
                validate_name("layer.name", &name)?;
                let file = layer
                    .file
                    .ok_or_else(|| ConfigurationError::missing(format!("{key}.file")))?;
                let file = match base_dir {
                    Some(dir) if file.is_relative() => dir.join(file),
                    _ => file,
                };

                let mut entity = Layer::new(owner, name, mod_time);
                entity.env_code = layer.env_code;
                entity.squid = layer.squid;
                entity.spatial = SpatialPayload {
                    bbox: scenario.spatial.bbox,
                    ..shared.clone()
                };
                entity.spatial.dlocation = Some(file.display().to_string());
                entity.metadata = Metadata {
                    title: layer.title,
                    ..Metadata::default()
                };
                scenario.layers.push(entity);
            }
            package.scenarios.push(scenario);
        }

        if let Some(base) = &package.base_code {
            if package.scenario(base).is_none() {
                return Err(ConfigurationError::invalid(
                    "base_code",
                    format!("`{base}` is not a scenario of the package"),
                ));
            }
        }
        Ok(package)
    }
}

#[cfg(test)]
mod tests {
    use super::PackageDescription;
    use crate::config::ConfigurationError;
    use std::path::Path;

    const DESCRIPTION: &str = r#"
        base_code = "observed"
        epsg = 4326
        bbox = [-10.0, -10.0, 10.0, 10.0]

        [[scenario]]
        code = "observed"

        [[scenario.layer]]
        name = "bio1-observed"
        env_code = "bio1"
        file = "observed/bio1.tif"

        [[scenario]]
        code = "future"
        bbox = [0.0, 0.0, 20.0, 20.0]

        [[scenario.layer]]
        name = "bio1-future"
        file = "/abs/bio1.tif"
    "#;

    #[test]
    fn layers_inherit_package_spatial_and_anchor_files() {
        let description = PackageDescription::from_toml(DESCRIPTION).unwrap();
        let package = description
            .into_package("alice", "pkg", Some(Path::new("/env")), 5)
            .unwrap();

        assert_eq!(package.scenario_codes(), vec!["observed", "future"]);
        let observed = package.scenario("observed").unwrap();
        assert_eq!(
            observed.layers[0].spatial.dlocation.as_deref(),
            Some("/env/observed/bio1.tif")
        );
        assert_eq!(observed.layers[0].spatial.epsg, Some(4326));

        let future = package.scenario("future").unwrap();
        assert_eq!(
            future.layers[0].spatial.dlocation.as_deref(),
            Some("/abs/bio1.tif")
        );
        assert_eq!(
            package.derived_bbox().map(|bbox| bbox.to_string()),
            Some("0,0,10,10".to_string())
        );
    }

    #[test]
    fn unknown_base_code_is_rejected() {
        let content = DESCRIPTION.replace("base_code = \"observed\"", "base_code = \"past\"");
        let description = PackageDescription::from_toml(&content).unwrap();
        assert!(matches!(
            description.into_package("alice", "pkg", None, 0),
            Err(ConfigurationError::Invalid { .. })
        ));
    }
}
