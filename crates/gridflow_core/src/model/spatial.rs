//! Spatial payload shared by layers, scenarios and shapegrids.
//!
//! # Invariants
//! - A `BoundingBox` always has `min_x <= max_x` and `min_y <= max_y`.
//! - Stored text form is `min_x,min_y,max_x,max_y`.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Self, String> {
        let values = [min_x, min_y, max_x, max_y];
        if values.iter().any(|value| !value.is_finite()) {
            return Err(format!("bounding box has non-finite edge: {values:?}"));
        }
        if min_x > max_x || min_y > max_y {
            return Err(format!(
                "bounding box minimum exceeds maximum: {min_x},{min_y},{max_x},{max_y}"
            ));
        }
        Ok(Self {
            min_x,
            min_y,
            max_x,
            max_y,
        })
    }

    /// Parses the stored `min_x,min_y,max_x,max_y` form.
    pub fn parse(text: &str) -> Result<Self, String> {
        let parts = text
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("invalid bounding box `{text}`: {err}"))?;
        match parts.as_slice() {
            [min_x, min_y, max_x, max_y] => Self::new(*min_x, *min_y, *max_x, *max_y),
            _ => Err(format!(
                "invalid bounding box `{text}`: expected 4 values, got {}",
                parts.len()
            )),
        }
    }

    /// Overlapping region, or `None` when the boxes are disjoint.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        Self::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        )
        .ok()
    }

    /// Intersection of every box, `None` for an empty or disjoint input.
    pub fn intersect_all<'a>(boxes: impl IntoIterator<Item = &'a BoundingBox>) -> Option<Self> {
        let mut boxes = boxes.into_iter();
        let first = *boxes.next()?;
        boxes.try_fold(first, |acc, next| acc.intersection(next))
    }
}

impl Display for BoundingBox {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}

impl TryFrom<[f64; 4]> for BoundingBox {
    type Error = String;

    fn try_from(value: [f64; 4]) -> Result<Self, Self::Error> {
        Self::new(value[0], value[1], value[2], value[3])
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(value: BoundingBox) -> Self {
        [value.min_x, value.min_y, value.max_x, value.max_y]
    }
}

/// Geospatial attributes an entity has.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpatialPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsg: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    /// Data location on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dlocation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_format: Option<String>,
}

impl SpatialPayload {
    /// Overlays the fields `other` sets.
    pub fn merge_from(&mut self, other: &SpatialPayload) {
        if other.epsg.is_some() {
            self.epsg = other.epsg;
        }
        if other.map_units.is_some() {
            self.map_units.clone_from(&other.map_units);
        }
        if other.resolution.is_some() {
            self.resolution = other.resolution;
        }
        if other.bbox.is_some() {
            self.bbox = other.bbox;
        }
        if other.dlocation.is_some() {
            self.dlocation.clone_from(&other.dlocation);
        }
        if other.data_format.is_some() {
            self.data_format.clone_from(&other.data_format);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BoundingBox;

    #[test]
    fn parse_accepts_stored_text_form() {
        let bbox = BoundingBox::parse("-180, -60, 180, 90").unwrap();
        assert_eq!(bbox.to_string(), "-180,-60,180,90");
    }

    #[test]
    fn parse_rejects_inverted_or_short_boxes() {
        assert!(BoundingBox::parse("10,0,0,10").is_err());
        assert!(BoundingBox::parse("0,0,10").is_err());
    }

    #[test]
    fn intersect_all_returns_common_region() {
        let world = BoundingBox::new(-180.0, -90.0, 180.0, 90.0).unwrap();
        let americas = BoundingBox::new(-170.0, -60.0, -30.0, 80.0).unwrap();
        let common = BoundingBox::intersect_all([&world, &americas]).unwrap();
        assert_eq!(common, americas);

        let europe = BoundingBox::new(-10.0, 35.0, 40.0, 70.0).unwrap();
        assert!(americas.intersection(&europe).is_none());
    }
}
