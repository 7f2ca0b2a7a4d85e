//! Archive request parsing and the configuration record.
//!
//! # Responsibility
//! - Parse a request TOML into an all-optional raw shape.
//! - Resolve defaults and required keys in one explicit step.
//! - Render the auditable configuration record the per-species step reads.
//!
//! # Invariants
//! - Resolution fails with `ConfigurationError` before any catalog write.
//! - Relative file references resolve against the request file's directory.

use crate::config::{read_toml_file, validate_name, ConfigurationError, SiteConfig};
use crate::model::metadata::{ParamValue, ParameterBlock};
use crate::model::spatial::BoundingBox;
use crate::workflow::queue::Priority;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_POINT_MINIMUM: u32 = 30;
pub const DEFAULT_ALGORITHM_CODE: &str = "ATT_MAXENT";
pub const DEFAULT_CELL_SIDES: u8 = 4;
pub const DEFAULT_INTERSECT_VALUE: &str = "pixel";
pub const DEFAULT_MIN_PERCENT: i64 = 25;
/// Taxonomy source name recorded for GBIF-backed requests.
pub const GBIF_TAXON_SOURCE: &str = "gbif_backbone";
pub const GBIF_TAXON_URL: &str = "https://www.gbif.org/dataset/d7dddbf4-2cf0-4f39-9b2a-bb099caae36c";

/// Request file as written by the user. Nothing is required at this stage.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawArchiveRequest {
    pub archive_name: Option<String>,
    pub owner: Option<String>,
    pub email: Option<String>,
    pub priority: Option<i64>,
    pub data_source: Option<String>,
    pub occurrence_file: Option<PathBuf>,
    pub occurrence_metadata_file: Option<PathBuf>,
    pub occurrence_id_file: Option<PathBuf>,
    pub taxon_id_file: Option<PathBuf>,
    pub taxon_name_file: Option<PathBuf>,
    pub gbif_taxonomy_file: Option<PathBuf>,
    pub gbif_provider_file: Option<PathBuf>,
    pub scenario_package: Option<String>,
    pub scenario_package_file: Option<PathBuf>,
    pub model_scenario: Option<String>,
    pub projection_scenarios: Option<Vec<String>>,
    pub point_minimum: Option<u32>,
    pub assemble_pams: Option<bool>,
    pub compute_pam_stats: Option<bool>,
    pub grid: RawGrid,
    pub intersect: RawIntersect,
    pub tree: Option<RawTree>,
    /// Uploaded layers, by name, to catalog for the owner.
    pub other_layers: Option<Vec<String>>,
    /// Shapefile name or directory of shapefiles in the user directory.
    pub biogeo_hypotheses: Option<String>,
    pub algorithm: Vec<RawAlgorithm>,
    /// Optional preprocessing algorithm; at most one.
    pub sdm_mask: Option<RawAlgorithm>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawGrid {
    pub name: Option<String>,
    pub cell_size: Option<f64>,
    pub cell_sides: Option<u8>,
    pub bbox: Option<BoundingBox>,
    pub epsg: Option<u32>,
    pub map_units: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawIntersect {
    pub value_name: Option<String>,
    pub min_presence: Option<f64>,
    pub max_presence: Option<f64>,
    pub min_percent: Option<i64>,
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawTree {
    pub name: Option<String>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawAlgorithm {
    pub code: Option<String>,
    pub parameters: ParameterBlock,
}

impl RawArchiveRequest {
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        read_toml_file(path)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(content).map_err(|source| ConfigurationError::Parse { path: None, source })
    }

    /// Applies defaults and checks required keys.
    ///
    /// `base_dir` anchors relative file references; `None` keeps them as given.
    pub fn resolve(
        self,
        site: &SiteConfig,
        base_dir: Option<&Path>,
    ) -> Result<ArchiveRequest, ConfigurationError> {
        let anchor = |path: PathBuf| match base_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        };

        let archive_name = required(self.archive_name, "archive_name")?;
        validate_name("archive_name", &archive_name)?;
        let owner = self.owner.unwrap_or_else(|| site.public_owner.clone());
        validate_name("owner", &owner)?;
        let priority = match self.priority {
            Some(value) => Priority(value),
            None if owner == site.public_owner => Priority::NORMAL,
            None => Priority::REQUESTED,
        };

        let data_source = DataSource::resolve(
            &required(self.data_source, "data_source")?,
            RawSourceFiles {
                occurrence_file: self.occurrence_file.map(anchor),
                occurrence_metadata_file: self.occurrence_metadata_file.map(anchor),
                occurrence_id_file: self.occurrence_id_file.map(anchor),
                taxon_id_file: self.taxon_id_file.map(anchor),
                taxon_name_file: self.taxon_name_file.map(anchor),
                gbif_taxonomy_file: self.gbif_taxonomy_file.map(anchor),
                gbif_provider_file: self.gbif_provider_file.map(anchor),
            },
        )?;

        let scenario_package = required(self.scenario_package, "scenario_package")?;
        validate_name("scenario_package", &scenario_package)?;
        let projection_scenarios = self.projection_scenarios.unwrap_or_default();
        if let Some(code) = &self.model_scenario {
            validate_name("model_scenario", code)?;
        }
        for code in &projection_scenarios {
            validate_name("projection_scenarios", code)?;
        }

        let grid = GridRequest::resolve(self.grid, &archive_name)?;
        let assemble_pams = self.assemble_pams.unwrap_or(true);
        let intersect = IntersectRequest::resolve(self.intersect, assemble_pams)?;
        let tree = self
            .tree
            .map(|raw| TreeRequest::resolve(raw, &anchor))
            .transpose()?;

        let other_layers = self.other_layers.unwrap_or_default();
        for name in &other_layers {
            validate_name("other_layers", name)?;
        }
        if let Some(name) = &self.biogeo_hypotheses {
            validate_name("biogeo_hypotheses", name)?;
        }

        let mut algorithms = Vec::with_capacity(self.algorithm.len().max(1));
        for (index, raw) in self.algorithm.into_iter().enumerate() {
            algorithms.push(AlgorithmRequest::resolve(raw, &format!("algorithm[{index}]"))?);
        }
        if algorithms.is_empty() {
            algorithms.push(AlgorithmRequest {
                code: DEFAULT_ALGORITHM_CODE.to_string(),
                parameters: ParameterBlock::new(),
            });
        }

        Ok(ArchiveRequest {
            archive_name,
            owner,
            email: self.email,
            priority,
            data_source,
            scenario_package,
            scenario_package_file: self.scenario_package_file.map(anchor),
            model_scenario: self.model_scenario,
            projection_scenarios,
            point_minimum: self.point_minimum.unwrap_or(DEFAULT_POINT_MINIMUM),
            assemble_pams,
            compute_pam_stats: self.compute_pam_stats.unwrap_or(false),
            grid,
            intersect,
            tree,
            other_layers,
            biogeo_hypotheses: self.biogeo_hypotheses,
            algorithms,
            sdm_mask: self
                .sdm_mask
                .map(|raw| AlgorithmRequest::resolve(raw, "sdm_mask"))
                .transpose()?,
        })
    }
}

fn required<T>(value: Option<T>, key: &str) -> Result<T, ConfigurationError> {
    value.ok_or_else(|| ConfigurationError::missing(key))
}

struct RawSourceFiles {
    occurrence_file: Option<PathBuf>,
    occurrence_metadata_file: Option<PathBuf>,
    occurrence_id_file: Option<PathBuf>,
    taxon_id_file: Option<PathBuf>,
    taxon_name_file: Option<PathBuf>,
    gbif_taxonomy_file: Option<PathBuf>,
    gbif_provider_file: Option<PathBuf>,
}

/// Where species occurrence data comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    Gbif {
        occurrence_file: PathBuf,
        taxonomy_file: Option<PathBuf>,
        provider_file: Option<PathBuf>,
    },
    User {
        occurrence_file: PathBuf,
        metadata_file: PathBuf,
    },
    /// Occurrence sets already in the catalog.
    Existing { occurrence_id_file: PathBuf },
    TaxonIds { taxon_id_file: PathBuf },
    TaxonNames { taxon_name_file: PathBuf },
}

impl DataSource {
    fn resolve(kind: &str, files: RawSourceFiles) -> Result<Self, ConfigurationError> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "gbif" => Ok(Self::Gbif {
                occurrence_file: required(files.occurrence_file, "occurrence_file")?,
                taxonomy_file: files.gbif_taxonomy_file,
                provider_file: files.gbif_provider_file,
            }),
            "user" => Ok(Self::User {
                occurrence_file: required(files.occurrence_file, "occurrence_file")?,
                metadata_file: required(
                    files.occurrence_metadata_file,
                    "occurrence_metadata_file",
                )?,
            }),
            "existing" => Ok(Self::Existing {
                occurrence_id_file: required(files.occurrence_id_file, "occurrence_id_file")?,
            }),
            "taxon_ids" => Ok(Self::TaxonIds {
                taxon_id_file: required(files.taxon_id_file, "taxon_id_file")?,
            }),
            "taxon_names" => Ok(Self::TaxonNames {
                taxon_name_file: required(files.taxon_name_file, "taxon_name_file")?,
            }),
            other => Err(ConfigurationError::invalid(
                "data_source",
                format!("unknown source `{other}`; expected gbif|user|existing|taxon_ids|taxon_names"),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gbif { .. } => "gbif",
            Self::User { .. } => "user",
            Self::Existing { .. } => "existing",
            Self::TaxonIds { .. } => "taxon_ids",
            Self::TaxonNames { .. } => "taxon_names",
        }
    }

    pub fn is_gbif(&self) -> bool {
        matches!(self, Self::Gbif { .. })
    }

    /// GBIF taxonomy dump to catalog before species processing, if any.
    pub fn taxonomy_file(&self) -> Option<&Path> {
        match self {
            Self::Gbif { taxonomy_file, .. } => taxonomy_file.as_deref(),
            _ => None,
        }
    }

    /// Input files the per-species step reads, keyed as in the request.
    pub fn files(&self) -> Vec<(&'static str, &Path)> {
        match self {
            Self::Gbif {
                occurrence_file,
                taxonomy_file,
                provider_file,
            } => {
                let mut files = vec![("occurrence_file", occurrence_file.as_path())];
                if let Some(path) = taxonomy_file {
                    files.push(("gbif_taxonomy_file", path.as_path()));
                }
                if let Some(path) = provider_file {
                    files.push(("gbif_provider_file", path.as_path()));
                }
                files
            }
            Self::User {
                occurrence_file,
                metadata_file,
            } => vec![
                ("occurrence_file", occurrence_file.as_path()),
                ("occurrence_metadata_file", metadata_file.as_path()),
            ],
            Self::Existing { occurrence_id_file } => {
                vec![("occurrence_id_file", occurrence_id_file.as_path())]
            }
            Self::TaxonIds { taxon_id_file } => vec![("taxon_id_file", taxon_id_file.as_path())],
            Self::TaxonNames { taxon_name_file } => {
                vec![("taxon_name_file", taxon_name_file.as_path())]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridRequest {
    pub name: String,
    pub cell_size: f64,
    pub cell_sides: u8,
    /// Falls back to the scenario package extent.
    pub bbox: Option<BoundingBox>,
    pub epsg: Option<u32>,
    pub map_units: Option<String>,
}

impl GridRequest {
    fn resolve(raw: RawGrid, archive_name: &str) -> Result<Self, ConfigurationError> {
        let name = raw.name.unwrap_or_else(|| format!("{archive_name}-grid"));
        validate_name("grid.name", &name)?;
        let cell_size = required(raw.cell_size, "grid.cell_size")?;
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(ConfigurationError::invalid(
                "grid.cell_size",
                format!("must be positive, got {cell_size}"),
            ));
        }
        let cell_sides = raw.cell_sides.unwrap_or(DEFAULT_CELL_SIDES);
        if cell_sides != 4 && cell_sides != 6 {
            return Err(ConfigurationError::invalid(
                "grid.cell_sides",
                format!("must be 4 or 6, got {cell_sides}"),
            ));
        }
        Ok(Self {
            name,
            cell_size,
            cell_sides,
            bbox: raw.bbox,
            epsg: raw.epsg,
            map_units: raw.map_units,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntersectRequest {
    pub value_name: String,
    pub min_presence: Option<f64>,
    pub max_presence: Option<f64>,
    pub min_percent: i64,
    pub filter: Option<String>,
}

impl IntersectRequest {
    fn resolve(raw: RawIntersect, assemble_pams: bool) -> Result<Self, ConfigurationError> {
        if assemble_pams {
            required(raw.min_presence, "intersect.min_presence")?;
            required(raw.max_presence, "intersect.max_presence")?;
        }
        if let (Some(min), Some(max)) = (raw.min_presence, raw.max_presence) {
            if min > max {
                return Err(ConfigurationError::invalid(
                    "intersect.min_presence",
                    format!("{min} exceeds max_presence {max}"),
                ));
            }
        }
        let min_percent = raw.min_percent.unwrap_or(DEFAULT_MIN_PERCENT);
        if !(0..=100).contains(&min_percent) {
            return Err(ConfigurationError::invalid(
                "intersect.min_percent",
                format!("must be within 0..=100, got {min_percent}"),
            ));
        }
        Ok(Self {
            value_name: raw
                .value_name
                .unwrap_or_else(|| DEFAULT_INTERSECT_VALUE.to_string()),
            min_presence: raw.min_presence,
            max_presence: raw.max_presence,
            min_percent,
            filter: raw.filter,
        })
    }

    /// Parameters stamped on every intersected column.
    pub fn to_params(&self) -> ParameterBlock {
        let mut params = ParameterBlock::new()
            .with("value_name", self.value_name.as_str())
            .with("min_percent", self.min_percent);
        if let Some(value) = self.min_presence {
            params.insert("min_presence", value);
        }
        if let Some(value) = self.max_presence {
            params.insert("max_presence", value);
        }
        if let Some(filter) = &self.filter {
            params.insert("filter", filter.as_str());
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeRequest {
    pub name: String,
    pub file: Option<PathBuf>,
}

impl TreeRequest {
    fn resolve(
        raw: RawTree,
        anchor: &impl Fn(PathBuf) -> PathBuf,
    ) -> Result<Self, ConfigurationError> {
        let name = required(raw.name, "tree.name")?;
        validate_name("tree.name", &name)?;
        Ok(Self {
            name,
            file: raw.file.map(anchor),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmRequest {
    pub code: String,
    pub parameters: ParameterBlock,
}

impl AlgorithmRequest {
    fn resolve(raw: RawAlgorithm, key: &str) -> Result<Self, ConfigurationError> {
        let code = raw
            .code
            .ok_or_else(|| ConfigurationError::missing(format!("{key}.code")))?;
        validate_name(&format!("{key}.code"), &code)?;
        Ok(Self {
            code,
            parameters: raw.parameters,
        })
    }
}

/// Fully resolved archive request.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRequest {
    pub archive_name: String,
    pub owner: String,
    /// Troubleshooter contact.
    pub email: Option<String>,
    pub priority: Priority,
    pub data_source: DataSource,
    pub scenario_package: String,
    pub scenario_package_file: Option<PathBuf>,
    /// Defaults to the package's base scenario.
    pub model_scenario: Option<String>,
    /// Empty means every scenario of the package.
    pub projection_scenarios: Vec<String>,
    pub point_minimum: u32,
    pub assemble_pams: bool,
    pub compute_pam_stats: bool,
    pub grid: GridRequest,
    pub intersect: IntersectRequest,
    pub tree: Option<TreeRequest>,
    pub other_layers: Vec<String>,
    pub biogeo_hypotheses: Option<String>,
    pub algorithms: Vec<AlgorithmRequest>,
    pub sdm_mask: Option<AlgorithmRequest>,
}

impl ArchiveRequest {
    /// Reads and resolves a request file.
    pub fn from_file(path: &Path, site: &SiteConfig) -> Result<Self, ConfigurationError> {
        RawArchiveRequest::from_file(path)?.resolve(site, path.parent())
    }

    pub fn from_toml(content: &str, site: &SiteConfig) -> Result<Self, ConfigurationError> {
        RawArchiveRequest::from_toml(content)?.resolve(site, None)
    }
}

/// `[archive]` table of the configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSection {
    pub archive_name: String,
    pub owner: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub scenario_package: String,
    pub model_scenario: String,
    pub projection_scenarios: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsg: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_units: Option<String>,
    pub data_source: String,
    pub data_files: BTreeMap<String, PathBuf>,
    pub point_minimum: u32,
    pub assemble_pams: bool,
    pub compute_pam_stats: bool,
    pub gridset: String,
    pub grid_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_bbox: Option<BoundingBox>,
    pub cell_size: f64,
    pub cell_sides: u8,
    pub intersect: ParameterBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<String>,
    /// Cataloged names of the uploaded layers that were found.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other_layers: Vec<String>,
    /// Cataloged names of the hypothesis layers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub biogeo_hypotheses: Vec<String>,
    /// Unix epoch milliseconds of the run that wrote the record.
    pub run_time: i64,
}

/// One `[algorithm.<heading>]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmSection {
    pub code: String,
    #[serde(flatten)]
    pub parameters: BTreeMap<String, ParamValue>,
}

impl From<&AlgorithmRequest> for AlgorithmSection {
    fn from(algorithm: &AlgorithmRequest) -> Self {
        Self {
            code: algorithm.code.clone(),
            parameters: algorithm
                .parameters
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }
}

/// Auditable record of one archive run; input of the per-species step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub archive: ArchiveSection,
    pub algorithm: BTreeMap<String, AlgorithmSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdm_mask: Option<AlgorithmSection>,
}

impl ArchiveRecord {
    /// Heading used for the algorithm at `index`, stable across runs.
    pub fn algorithm_heading(index: usize, code: &str) -> String {
        format!("{:02}_{code}", index + 1)
    }

    pub fn algorithms_from(request: &ArchiveRequest) -> BTreeMap<String, AlgorithmSection> {
        request
            .algorithms
            .iter()
            .enumerate()
            .map(|(index, algorithm)| {
                (
                    Self::algorithm_heading(index, &algorithm.code),
                    AlgorithmSection::from(algorithm),
                )
            })
            .collect()
    }

    pub fn to_toml(&self) -> Result<String, ConfigurationError> {
        toml::to_string_pretty(self)
            .map_err(|err| ConfigurationError::invalid("archive_record", err.to_string()))
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(content).map_err(|source| ConfigurationError::Parse { path: None, source })
    }

    /// Writes the record, creating parent directories.
    pub fn write(&self, path: &Path) -> Result<(), ConfigurationError> {
        let body = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigurationError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, body).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
