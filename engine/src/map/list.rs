//! Collection of warped maps with a geo spatial index and z-order

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rstar::{RTree, RTreeObject, AABB};

use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::geometry::{Bbox, Point, Ring};

use super::effects::RenderOptions;
use super::georef::{Gcp, GeoreferencedMap, MapId, TransformationType};
use super::image_info::{IiifResolver, ImageInfoResolver};
use super::transform::{AffineTransformerBuilder, TransformerBuilder};
use super::warped_map::{WarpedMap, DEFAULT_MESH_DENSITY};

/// Geo bbox of one map as stored in the R-tree
#[derive(Clone, Debug, PartialEq)]
struct MapBox {
    map_id: MapId,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for MapBox {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

/// Owns all warped maps.
///
/// The id map, the R-tree and the z-order always hold exactly the same ids.
/// Z-order runs bottom to top.
pub struct WarpedMapList {
    maps: HashMap<MapId, WarpedMap>,
    index: RTree<MapBox>,
    z_order: Vec<MapId>,
    transformer_builder: Arc<dyn TransformerBuilder>,
    image_info_resolver: Arc<dyn ImageInfoResolver>,
    mesh_density: u32,
    events: EventBus,
}

impl WarpedMapList {
    pub fn new(
        transformer_builder: Arc<dyn TransformerBuilder>,
        image_info_resolver: Arc<dyn ImageInfoResolver>,
        mesh_density: u32,
        events: EventBus,
    ) -> Self {
        Self {
            maps: HashMap::new(),
            index: RTree::new(),
            z_order: Vec::new(),
            transformer_builder,
            image_info_resolver,
            mesh_density: mesh_density.max(1),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Build a warped map and insert it on top.
    ///
    /// A map with an id that is already present replaces the old one.
    pub fn add_georeferenced_map(&mut self, map: GeoreferencedMap) -> Result<MapId> {
        let image_info = self
            .image_info_resolver
            .resolve(&map.resource)
            .map_err(|e| Error::ImageInfo {
                map_id: map.id.to_string(),
                reason: format!("{e:#}"),
            })?;
        let warped = WarpedMap::new(
            map,
            self.transformer_builder.clone(),
            image_info,
            self.mesh_density,
        )?;
        let map_id = warped.id().clone();

        if self.maps.contains_key(&map_id) {
            log::debug!("Replacing map {}", map_id);
            self.remove_georeferenced_map(&map_id);
        }

        self.index.insert(MapBox {
            map_id: map_id.clone(),
            env: warped.geo_bbox().to_aabb(),
        });
        self.z_order.push(map_id.clone());
        self.maps.insert(map_id.clone(), warped);

        log::debug!("Added map {}", map_id);
        self.events.emit(Event::WarpedMapAdded(map_id.clone()));
        Ok(map_id)
    }

    /// Add several maps. Failing maps are skipped, the rest are added.
    pub fn add_georeferenced_maps(
        &mut self,
        maps: impl IntoIterator<Item = GeoreferencedMap>,
    ) -> Vec<Result<MapId>> {
        maps.into_iter()
            .map(|map| {
                let result = self.add_georeferenced_map(map);
                if let Err(e) = &result {
                    log::warn!("Skipping map: {}", e);
                }
                result
            })
            .collect()
    }

    /// Remove a map. Unknown ids are ignored.
    pub fn remove_georeferenced_map(&mut self, map_id: &MapId) -> Option<WarpedMap> {
        let warped = self.maps.remove(map_id)?;
        self.index.remove(&MapBox {
            map_id: map_id.clone(),
            env: warped.geo_bbox().to_aabb(),
        });
        self.z_order.retain(|id| id != map_id);

        log::debug!("Removed map {}", map_id);
        self.events.emit(Event::WarpedMapRemoved(map_id.clone()));
        Some(warped)
    }

    pub fn get(&self, map_id: &MapId) -> Option<&WarpedMap> {
        self.maps.get(map_id)
    }

    pub fn contains(&self, map_id: &MapId) -> bool {
        self.maps.contains_key(map_id)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Map ids bottom to top.
    pub fn map_ids(&self) -> &[MapId] {
        &self.z_order
    }

    /// Maps bottom to top.
    pub fn iter(&self) -> impl Iterator<Item = &WarpedMap> {
        self.z_order.iter().filter_map(|id| self.maps.get(id))
    }

    pub fn z_index(&self, map_id: &MapId) -> Option<usize> {
        self.z_order.iter().position(|id| id == map_id)
    }

    /// Maps whose geo bbox overlaps `bbox`, bottom to top.
    pub fn maps_in_geo_bbox(&self, bbox: &Bbox) -> Vec<&WarpedMap> {
        let hits: HashSet<&MapId> = self
            .index
            .locate_in_envelope_intersecting(&bbox.to_aabb())
            .map(|entry| &entry.map_id)
            .collect();
        self.z_order
            .iter()
            .filter(|id| hits.contains(id))
            .filter_map(|id| self.maps.get(id))
            .collect()
    }

    /// Union of all map geo bboxes, `None` for an empty list.
    pub fn maps_bbox(&self) -> Option<Bbox> {
        self.maps
            .values()
            .map(|m| m.geo_bbox())
            .reduce(|acc, b| acc.union(&b))
    }

    pub fn maps_center(&self) -> Option<Point> {
        self.maps_bbox().map(|b| b.center())
    }

    pub fn set_render_options_for_map(&mut self, map_id: &MapId, options: RenderOptions) -> Result<()> {
        let warped = self
            .maps
            .get_mut(map_id)
            .ok_or_else(|| Error::UnknownMap(map_id.to_string()))?;
        if *warped.render_options() != options {
            warped.set_render_options(options);
            self.events.emit(Event::Changed(map_id.clone()));
        }
        Ok(())
    }

    pub fn set_gcps_for_map(&mut self, map_id: &MapId, gcps: Vec<Gcp>) -> Result<()> {
        self.update_geometry(map_id, |warped| warped.set_gcps(gcps))
    }

    pub fn set_resource_mask_for_map(&mut self, map_id: &MapId, mask: Ring) -> Result<()> {
        self.update_geometry(map_id, |warped| warped.set_resource_mask(mask))
    }

    pub fn set_transformation_for_map(
        &mut self,
        map_id: &MapId,
        transformation: TransformationType,
    ) -> Result<()> {
        self.update_geometry(map_id, |warped| warped.set_transformation(transformation))
    }

    /// Apply a geometry mutation and keep the R-tree entry in step.
    fn update_geometry(
        &mut self,
        map_id: &MapId,
        update: impl FnOnce(&mut WarpedMap) -> Result<()>,
    ) -> Result<()> {
        let warped = self
            .maps
            .get_mut(map_id)
            .ok_or_else(|| Error::UnknownMap(map_id.to_string()))?;
        let old_env = warped.geo_bbox().to_aabb();
        update(warped)?;
        let new_env = warped.geo_bbox().to_aabb();

        if old_env != new_env {
            self.index.remove(&MapBox {
                map_id: map_id.clone(),
                env: old_env,
            });
            self.index.insert(MapBox {
                map_id: map_id.clone(),
                env: new_env,
            });
        }
        self.events.emit(Event::Changed(map_id.clone()));
        Ok(())
    }

    /// Move maps to the top, keeping their relative order.
    pub fn bring_to_front(&mut self, map_ids: &[MapId]) {
        let selected = self.selected(map_ids);
        self.reorder(|order| {
            let (mut rest, moved): (Vec<_>, Vec<_>) =
                order.drain(..).partition(|id| !selected.contains(id));
            rest.extend(moved);
            *order = rest;
        });
    }

    /// Move maps to the bottom, keeping their relative order.
    pub fn send_to_back(&mut self, map_ids: &[MapId]) {
        let selected = self.selected(map_ids);
        self.reorder(|order| {
            let (mut moved, rest): (Vec<_>, Vec<_>) =
                order.drain(..).partition(|id| selected.contains(id));
            moved.extend(rest);
            *order = moved;
        });
    }

    /// Move each map one step up.
    pub fn bring_forward(&mut self, map_ids: &[MapId]) {
        let selected = self.selected(map_ids);
        self.reorder(|order| {
            for i in (0..order.len().saturating_sub(1)).rev() {
                if selected.contains(&order[i]) && !selected.contains(&order[i + 1]) {
                    order.swap(i, i + 1);
                }
            }
        });
    }

    /// Move each map one step down.
    pub fn send_backward(&mut self, map_ids: &[MapId]) {
        let selected = self.selected(map_ids);
        self.reorder(|order| {
            for i in 1..order.len() {
                if selected.contains(&order[i]) && !selected.contains(&order[i - 1]) {
                    order.swap(i, i - 1);
                }
            }
        });
    }

    /// Put a map at `z_index`, clamped to the top.
    pub fn set_z_index(&mut self, map_id: &MapId, z_index: usize) -> Result<()> {
        if !self.maps.contains_key(map_id) {
            return Err(Error::UnknownMap(map_id.to_string()));
        }
        self.reorder(|order| {
            order.retain(|id| id != map_id);
            let at = z_index.min(order.len());
            order.insert(at, map_id.clone());
        });
        Ok(())
    }

    fn selected(&self, map_ids: &[MapId]) -> HashSet<MapId> {
        map_ids
            .iter()
            .filter(|id| self.maps.contains_key(*id))
            .cloned()
            .collect()
    }

    fn reorder(&mut self, change: impl FnOnce(&mut Vec<MapId>)) {
        let before = self.z_order.clone();
        change(&mut self.z_order);
        if before != self.z_order {
            self.events.emit(Event::ZIndicesChanged);
        }
    }
}

impl Default for WarpedMapList {
    fn default() -> Self {
        Self::new(
            Arc::new(AffineTransformerBuilder),
            Arc::new(IiifResolver::default()),
            DEFAULT_MESH_DENSITY,
            EventBus::new(),
        )
    }
}
