//! A georeferenced map together with its derived rendering geometry

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::geometry::{point_in_triangle, Affine, Bbox, Point, Ring};

use super::effects::RenderOptions;
use super::georef::{Gcp, GeoreferencedMap, MapId, TransformationType};
use super::image_info::ImageInfo;
use super::mesh::{triangulate_mask, Mesh};
use super::transform::{Transformer, TransformerBuilder};

/// Default number of mesh steps along the longer side of the resource mask
pub const DEFAULT_MESH_DENSITY: u32 = 16;

/// Local linear approximation of the transform on one mesh triangle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriangleWarp {
    pub resource_to_geo: Affine,
    /// `None` when the transform collapses the triangle
    pub geo_to_resource: Option<Affine>,
    /// Geo units per resource pixel (square root of the Jacobian determinant)
    pub resource_to_geo_scale: f64,
}

/// Geometry derived from GCPs, mask and transformation type.
#[derive(Clone)]
struct Geometry {
    transformer: Arc<dyn Transformer>,
    mesh: Mesh,
    geo_points: Vec<Point>,
    warps: Vec<TriangleWarp>,
    /// Largest finite `resource_to_geo_scale` over all triangles, 0 when none
    max_scale: f64,
    geo_mask: Ring,
    geo_bbox: Bbox,
}

pub struct WarpedMap {
    map_id: MapId,
    georeferenced_map: GeoreferencedMap,
    transformer_builder: Arc<dyn TransformerBuilder>,
    image_info: Arc<dyn ImageInfo>,
    mesh_density: u32,
    geometry: Geometry,
    render_options: RenderOptions,
}

impl WarpedMap {
    /// Validate `map` and compute its mesh and geo footprint.
    pub fn new(
        map: GeoreferencedMap,
        transformer_builder: Arc<dyn TransformerBuilder>,
        image_info: Arc<dyn ImageInfo>,
        mesh_density: u32,
    ) -> Result<Self> {
        let geometry = build_geometry(&map, transformer_builder.as_ref(), mesh_density)?;
        Ok(Self {
            map_id: map.id.clone(),
            georeferenced_map: map,
            transformer_builder,
            image_info,
            mesh_density,
            geometry,
            render_options: RenderOptions::default(),
        })
    }

    pub fn id(&self) -> &MapId {
        &self.map_id
    }

    pub fn georeferenced_map(&self) -> &GeoreferencedMap {
        &self.georeferenced_map
    }

    pub fn image_info(&self) -> &Arc<dyn ImageInfo> {
        &self.image_info
    }

    pub fn mesh_density(&self) -> u32 {
        self.mesh_density
    }

    pub fn mesh(&self) -> &Mesh {
        &self.geometry.mesh
    }

    /// Geo coordinates of the mesh points, same order as `mesh().points`.
    pub fn geo_points(&self) -> &[Point] {
        &self.geometry.geo_points
    }

    pub fn triangle_warps(&self) -> &[TriangleWarp] {
        &self.geometry.warps
    }

    /// Geo units per resource pixel where the image is stretched the most.
    ///
    /// Depends only on the geometry, never on what a viewport shows.
    pub fn max_resource_to_geo_scale(&self) -> f64 {
        self.geometry.max_scale
    }

    pub fn geo_triangle(&self, index: usize) -> [Point; 3] {
        let [a, b, c] = self.geometry.mesh.triangles[index];
        let geo = &self.geometry.geo_points;
        [geo[a as usize], geo[b as usize], geo[c as usize]]
    }

    pub fn geo_mask(&self) -> &Ring {
        &self.geometry.geo_mask
    }

    pub fn geo_bbox(&self) -> Bbox {
        self.geometry.geo_bbox
    }

    pub fn render_options(&self) -> &RenderOptions {
        &self.render_options
    }

    /// Replace the render options. Geometry is left untouched.
    pub fn set_render_options(&mut self, options: RenderOptions) {
        self.render_options = options;
    }

    /// Exact resource to geo transform of a single point.
    pub fn transform_to_geo(&self, resource: Point) -> Result<Point> {
        self.geometry
            .transformer
            .transform(resource)
            .map_err(|source| Error::TransformerConstruction {
                map_id: self.map_id.to_string(),
                source,
            })
    }

    /// Resource position of a geo point through the mesh, `None` outside the map.
    pub fn geo_to_resource_via_mesh(&self, geo: Point) -> Option<Point> {
        if !self.geometry.geo_bbox.contains(&geo) {
            return None;
        }
        (0..self.geometry.mesh.len()).find_map(|i| {
            let [a, b, c] = self.geo_triangle(i);
            if !point_in_triangle(geo, a, b, c) {
                return None;
            }
            self.geometry.warps[i].geo_to_resource.map(|inverse| inverse.apply(geo))
        })
    }

    pub fn set_gcps(&mut self, gcps: Vec<Gcp>) -> Result<()> {
        let previous = std::mem::replace(&mut self.georeferenced_map.gcps, gcps);
        self.invalidate_or_restore(|map| map.gcps = previous)
    }

    pub fn set_resource_mask(&mut self, mask: Ring) -> Result<()> {
        let previous = std::mem::replace(&mut self.georeferenced_map.resource_mask, mask);
        self.invalidate_or_restore(|map| map.resource_mask = previous)
    }

    pub fn set_transformation(&mut self, transformation: TransformationType) -> Result<()> {
        let previous = self.georeferenced_map.transformation.replace(transformation);
        self.invalidate_or_restore(|map| map.transformation = previous)
    }

    /// Rebuild transformer, mesh and geo footprint from the current map.
    pub fn invalidate_geometry(&mut self) -> Result<()> {
        self.geometry = build_geometry(
            &self.georeferenced_map,
            self.transformer_builder.as_ref(),
            self.mesh_density,
        )?;
        Ok(())
    }

    fn invalidate_or_restore(&mut self, restore: impl FnOnce(&mut GeoreferencedMap)) -> Result<()> {
        match self.invalidate_geometry() {
            Ok(()) => Ok(()),
            Err(err) => {
                restore(&mut self.georeferenced_map);
                Err(err)
            }
        }
    }
}

impl fmt::Debug for WarpedMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarpedMap")
            .field("map_id", &self.map_id)
            .field("triangles", &self.geometry.mesh.len())
            .field("geo_bbox", &self.geometry.geo_bbox)
            .field("render_options", &self.render_options)
            .finish()
    }
}

fn build_geometry(
    map: &GeoreferencedMap,
    builder: &dyn TransformerBuilder,
    mesh_density: u32,
) -> Result<Geometry> {
    let map_id = map.id.to_string();

    if map.resource_mask.len() < 3 {
        return Err(Error::InvalidGeometry {
            map_id,
            points: map.resource_mask.len(),
        });
    }
    if map.gcps.len() < 2 {
        return Err(Error::InvalidGcps {
            map_id,
            count: map.gcps.len(),
        });
    }

    let transformer = builder
        .build(&map.gcps, map.transformation_type())
        .map_err(|source| Error::TransformerConstruction {
            map_id: map_id.clone(),
            source,
        })?;

    let mesh = triangulate_mask(&map.resource_mask, mesh_density).ok_or_else(|| {
        Error::InvalidGeometry {
            map_id: map_id.clone(),
            points: map.resource_mask.len(),
        }
    })?;

    let transform = |p: Point| {
        transformer
            .transform(p)
            .map_err(|source| Error::TransformerConstruction {
                map_id: map_id.clone(),
                source,
            })
    };

    let geo_points = mesh
        .points
        .iter()
        .map(|p| transform(*p))
        .collect::<Result<Vec<_>>>()?;

    let warps = (0..mesh.len())
        .map(|i| {
            let resource = mesh.triangle(i);
            let [a, b, c] = mesh.triangles[i];
            let geo = [
                geo_points[a as usize],
                geo_points[b as usize],
                geo_points[c as usize],
            ];
            // mesh triangles are never degenerate in resource space
            let resource_to_geo = Affine::from_triangles(resource, geo).unwrap_or(Affine {
                a: 0.0,
                b: 0.0,
                c: geo[0].x,
                d: 0.0,
                e: 0.0,
                f: geo[0].y,
            });
            TriangleWarp {
                resource_to_geo,
                geo_to_resource: resource_to_geo.inverse(),
                resource_to_geo_scale: resource_to_geo.determinant().abs().sqrt(),
            }
        })
        .collect::<Vec<TriangleWarp>>();

    let max_scale = warps
        .iter()
        .map(|warp| warp.resource_to_geo_scale)
        .filter(|scale| scale.is_finite())
        .fold(0.0, f64::max);

    let geo_mask = map
        .resource_mask
        .iter()
        .map(|p| transform(*p))
        .collect::<Result<Vec<_>>>()?;

    let geo_bbox = Bbox::from_points(&geo_points).ok_or_else(|| Error::InvalidGeometry {
        map_id: map_id.clone(),
        points: map.resource_mask.len(),
    })?;

    Ok(Geometry {
        transformer,
        mesh,
        geo_points,
        warps,
        max_scale,
        geo_mask,
        geo_bbox,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::georef::Resource;
    use crate::map::image_info::IiifImage;
    use crate::map::transform::AffineTransformerBuilder;
    use approx::assert_relative_eq;

    fn georeferenced(width: u32, height: u32, gcps: Vec<Gcp>) -> GeoreferencedMap {
        GeoreferencedMap::new(
            "map-1",
            Resource {
                id: "https://example.org/iiif/map-1".to_string(),
                width,
                height,
            },
            gcps,
            GeoreferencedMap::full_image_mask(width, height),
        )
    }

    fn warped(map: GeoreferencedMap) -> Result<WarpedMap> {
        let info = Arc::new(IiifImage::with_default_pyramid(
            map.resource.id.clone(),
            map.resource.width,
            map.resource.height,
            256,
        ));
        WarpedMap::new(map, Arc::new(AffineTransformerBuilder), info, DEFAULT_MESH_DENSITY)
    }

    #[test]
    fn test_straight_transform_keeps_aspect_ratio() {
        let map = georeferenced(
            1200,
            800,
            vec![
                Gcp::new((0.0, 0.0), (4.0, 52.0)),
                Gcp::new((1200.0, 800.0), (4.12, 51.92)),
            ],
        )
        .with_transformation(TransformationType::Straight);
        let warped = warped(map).unwrap();
        let bbox = warped.geo_bbox();
        assert_relative_eq!(bbox.width() / bbox.height(), 1200.0 / 800.0, max_relative = 1e-9);
    }

    #[test]
    fn test_validation_errors() {
        let gcps = vec![
            Gcp::new((0.0, 0.0), (0.0, 0.0)),
            Gcp::new((10.0, 0.0), (1.0, 0.0)),
            Gcp::new((0.0, 10.0), (0.0, -1.0)),
        ];

        let mut few_points = georeferenced(10, 10, gcps.clone());
        few_points.resource_mask.truncate(2);
        assert!(matches!(warped(few_points), Err(Error::InvalidGeometry { points: 2, .. })));

        let one_gcp = georeferenced(10, 10, gcps[..1].to_vec());
        assert!(matches!(warped(one_gcp), Err(Error::InvalidGcps { count: 1, .. })));

        let collinear = georeferenced(
            10,
            10,
            vec![
                Gcp::new((0.0, 0.0), (0.0, 0.0)),
                Gcp::new((5.0, 5.0), (1.0, 1.0)),
                Gcp::new((10.0, 10.0), (2.0, 2.0)),
            ],
        );
        assert!(matches!(
            warped(collinear),
            Err(Error::TransformerConstruction { .. })
        ));
    }

    #[test]
    fn test_mesh_matches_transform_at_vertices() {
        let map = georeferenced(
            400,
            300,
            vec![
                Gcp::new((0.0, 0.0), (10.0, 20.0)),
                Gcp::new((400.0, 0.0), (14.0, 20.5)),
                Gcp::new((0.0, 300.0), (10.2, 17.0)),
            ],
        );
        let warped = warped(map).unwrap();
        for (resource, geo) in warped.mesh().points.iter().zip(warped.geo_points()) {
            let exact = warped.transform_to_geo(*resource).unwrap();
            assert_relative_eq!(exact.x, geo.x, epsilon = 1e-9);
            assert_relative_eq!(exact.y, geo.y, epsilon = 1e-9);
        }
        assert!(warped.triangle_warps().iter().all(|w| w.geo_to_resource.is_some()));

        let resource = Point::new(123.0, 77.0);
        let geo = warped.transform_to_geo(resource).unwrap();
        let back = warped.geo_to_resource_via_mesh(geo).unwrap();
        assert_relative_eq!(back.x, resource.x, epsilon = 1e-6);
        assert_relative_eq!(back.y, resource.y, epsilon = 1e-6);
        assert!(warped.geo_to_resource_via_mesh(Point::new(50.0, 50.0)).is_none());
    }

    #[test]
    fn test_failed_mutation_keeps_previous_geometry() {
        let map = georeferenced(
            100,
            100,
            vec![
                Gcp::new((0.0, 0.0), (0.0, 0.0)),
                Gcp::new((100.0, 0.0), (1.0, 0.0)),
                Gcp::new((0.0, 100.0), (0.0, -1.0)),
            ],
        );
        let mut warped = warped(map).unwrap();
        let bbox = warped.geo_bbox();

        let err = warped.set_gcps(vec![Gcp::new((0.0, 0.0), (0.0, 0.0))]);
        assert!(err.is_err());
        assert_eq!(warped.georeferenced_map().gcps.len(), 3);
        assert_eq!(warped.geo_bbox(), bbox);

        warped
            .set_resource_mask(vec![
                Point::new(0.0, 0.0),
                Point::new(50.0, 0.0),
                Point::new(50.0, 50.0),
                Point::new(0.0, 50.0),
            ])
            .unwrap();
        assert_relative_eq!(warped.geo_bbox().width(), 0.5, epsilon = 1e-12);
    }
}
