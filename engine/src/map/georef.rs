//! Georeferenced map input model

use std::fmt;
use std::sync::Arc;

use crate::geometry::{Point, Ring};

/// Identifier of a georeferenced map. Cheap to clone.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct MapId(Arc<str>);

impl MapId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MapId {
    fn from(value: &str) -> Self {
        MapId::new(value)
    }
}

impl From<String> for MapId {
    fn from(value: String) -> Self {
        MapId(Arc::from(value))
    }
}

/// Source image of a georeferenced map.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    /// Image service id (IIIF base URI)
    pub id: String,
    pub width: u32,
    pub height: u32,
}

/// Ground control point: a resource pixel and its geographic position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Gcp {
    pub resource: Point,
    pub geo: Point,
}

impl Gcp {
    pub fn new(resource: (f64, f64), geo: (f64, f64)) -> Self {
        Self {
            resource: resource.into(),
            geo: geo.into(),
        }
    }
}

/// Transformation family used to map resource pixels to geo coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransformationType {
    /// Translation and uniform scaling, north-up
    Straight,
    /// Translation, rotation and uniform scaling
    Helmert,
    /// Polynomial of the given order (1 is affine)
    Polynomial(u8),
    Projective,
    ThinPlateSpline,
}

impl Default for TransformationType {
    fn default() -> Self {
        TransformationType::Polynomial(1)
    }
}

/// A georeferenced map as produced by an annotation parser.
#[derive(Clone, Debug, PartialEq)]
pub struct GeoreferencedMap {
    pub id: MapId,
    pub resource: Resource,
    pub gcps: Vec<Gcp>,
    /// Pixel-space polygon delimiting the used part of the image
    pub resource_mask: Ring,
    pub transformation: Option<TransformationType>,
}

impl GeoreferencedMap {
    pub fn new(id: impl Into<MapId>, resource: Resource, gcps: Vec<Gcp>, resource_mask: Ring) -> Self {
        Self {
            id: id.into(),
            resource,
            gcps,
            resource_mask,
            transformation: None,
        }
    }

    pub fn with_transformation(mut self, transformation: TransformationType) -> Self {
        self.transformation = Some(transformation);
        self
    }

    /// Transformation to use, falling back to first order polynomial.
    pub fn transformation_type(&self) -> TransformationType {
        self.transformation.unwrap_or_default()
    }

    /// Mask covering the full image, clockwise from the top-left corner.
    pub fn full_image_mask(width: u32, height: u32) -> Ring {
        let (w, h) = (width as f64, height as f64);
        vec![
            Point::new(0.0, 0.0),
            Point::new(w, 0.0),
            Point::new(w, h),
            Point::new(0.0, h),
        ]
    }
}
