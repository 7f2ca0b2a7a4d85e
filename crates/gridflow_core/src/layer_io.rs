//! Geospatial collaborator boundary.
//!
//! # Responsibility
//! - Answer "is this layer readable, and what does it cover".
//! - Materialize shapegrids on disk.
//!
//! # Invariants
//! - A missing file is an invalid layer, not an error.

use crate::model::grid::ShapeGrid;
use crate::model::spatial::{BoundingBox, SpatialPayload};
use log::info;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// What a layer read reports.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerInfo {
    pub is_valid: bool,
    pub spatial: SpatialPayload,
}

#[derive(Debug)]
pub enum LayerIoError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    MissingLocation(String),
    Encode(String),
}

impl Display for LayerIoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "layer i/o on `{}`: {source}", path.display()),
            Self::MissingLocation(name) => write!(f, "`{name}` has no data location"),
            Self::Encode(message) => write!(f, "failed to encode layer: {message}"),
        }
    }
}

impl Error for LayerIoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub trait LayerIo {
    fn read_layer(&self, path: &Path) -> Result<LayerInfo, LayerIoError>;
    /// Writes the grid to its `spatial.dlocation`.
    fn write_shapegrid(&self, grid: &ShapeGrid) -> Result<PathBuf, LayerIoError>;
}

/// Filesystem-backed layer access.
///
/// A layer is valid when it is a non-empty regular file. Shapegrids are
/// written as TOML cell descriptors.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsLayerIo;

#[derive(Serialize)]
struct ShapegridDescriptor<'a> {
    name: &'a str,
    cell_sides: u8,
    cell_size: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    epsg: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    map_units: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bbox: Option<BoundingBox>,
}

impl LayerIo for FsLayerIo {
    fn read_layer(&self, path: &Path) -> Result<LayerInfo, LayerIoError> {
        let spatial = SpatialPayload {
            dlocation: Some(path.display().to_string()),
            data_format: path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(data_format_for_extension),
            ..SpatialPayload::default()
        };

        match std::fs::metadata(path) {
            Ok(meta) => Ok(LayerInfo {
                is_valid: meta.is_file() && meta.len() > 0,
                spatial,
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(LayerInfo {
                is_valid: false,
                spatial,
            }),
            Err(source) => Err(LayerIoError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn write_shapegrid(&self, grid: &ShapeGrid) -> Result<PathBuf, LayerIoError> {
        let path = PathBuf::from(
            grid.spatial
                .dlocation
                .as_deref()
                .ok_or_else(|| LayerIoError::MissingLocation(grid.name.clone()))?,
        );
        let descriptor = ShapegridDescriptor {
            name: &grid.name,
            cell_sides: grid.cell_sides,
            cell_size: grid.cell_size,
            epsg: grid.spatial.epsg,
            map_units: grid.spatial.map_units.as_deref(),
            bbox: grid.spatial.bbox,
        };
        let body = toml::to_string_pretty(&descriptor)
            .map_err(|err| LayerIoError::Encode(err.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LayerIoError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&path, body).map_err(|source| LayerIoError::Io {
            path: path.clone(),
            source,
        })?;

        info!(
            "event=shapegrid_write module=layer_io status=ok name={} path={}",
            grid.name,
            path.display()
        );
        Ok(path)
    }
}

fn data_format_for_extension(ext: &str) -> String {
    match ext.to_ascii_lowercase().as_str() {
        "tif" | "tiff" => "GTiff".to_string(),
        "asc" => "AAIGrid".to_string(),
        "shp" => "ESRI Shapefile".to_string(),
        "grid" => "shapegrid".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{FsLayerIo, LayerIo};
    use crate::model::grid::ShapeGrid;

    #[test]
    fn missing_and_empty_files_are_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.tif");
        assert!(!FsLayerIo.read_layer(&missing).unwrap().is_valid);

        let empty = dir.path().join("empty.tif");
        std::fs::write(&empty, b"").unwrap();
        assert!(!FsLayerIo.read_layer(&empty).unwrap().is_valid);

        let full = dir.path().join("bio1.tif");
        std::fs::write(&full, b"raster").unwrap();
        let info = FsLayerIo.read_layer(&full).unwrap();
        assert!(info.is_valid);
        assert_eq!(info.spatial.data_format.as_deref(), Some("GTiff"));
    }

    #[test]
    fn written_shapegrid_reads_back_valid() {
        let dir = tempfile::tempdir().unwrap();
        let mut grid = ShapeGrid::new("alice", "grid10", 4, 1.0, 0);
        let path = dir.path().join("shapegrids").join("grid10.grid");
        grid.spatial.dlocation = Some(path.display().to_string());

        let written = FsLayerIo.write_shapegrid(&grid).unwrap();
        assert_eq!(written, path);
        assert!(FsLayerIo.read_layer(&path).unwrap().is_valid);
    }
}
