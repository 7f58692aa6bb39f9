//! The tiled nav-mesh store.
//!
//! Owns every tile, resolves polygon references and maintains the link
//! topology between polygons, both within a tile and across tile boundaries.
//! Tiles are added & removed whole; the only runtime mutation is the
//! intrusive per-polygon link lists.

use bevy::math::Vec3Swizzles;
use bevy::prelude::Vec3;
use smallvec::SmallVec;
use std::collections::HashMap;
use thiserror::Error;

use crate::math::{
    closest_height_point_triangle, distance_point_to_polygon_edges_2d, overlap_quantized_bounds,
};

pub mod builder;
pub mod serialize;
mod tile;

pub use tile::{
    Area, BvNode, Link, LinkIter, MeshTile, OffMeshConnection, Poly, PolyDetail, PolyFlags,
    PolyType, TileData, EXTERNAL_LINK, NULL_LINK, OFF_MESH_CON_BIDIRECTIONAL, VERTICES_PER_POLYGON,
};

/// Packed `(salt, tile, polygon)` identifier. `PolyRef::NONE` means
/// "no polygon"; anything else is validated by decoding and checking the
/// salt against the owning tile slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PolyRef(pub u32);

impl PolyRef {
    pub const NONE: PolyRef = PolyRef(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Reference to a whole tile; a [PolyRef] with a zero polygon index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TileRef(pub u32);

impl TileRef {
    pub const NONE: TileRef = TileRef(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Grid layout & capacity limits, fixed at construction.
#[derive(Debug, Clone)]
pub struct NavMeshParams {
    /// World-space origin of the tile grid.
    pub origin: Vec3,
    /// Width of each tile along X, in world units.
    pub tile_width: f32,
    /// Height of each tile along Z, in world units.
    pub tile_height: f32,
    pub max_tiles: u32,
    pub max_polys: u32,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NavMeshError {
    #[error("invalid parameter")]
    InvalidParam,
    /// `max_tiles * max_polys` leaves fewer than 8 bits of salt in a 32-bit
    /// polygon reference.
    #[error("tile & polygon capacity leave too few salt bits ({0})")]
    TooFewSaltBits(u32),
    #[error("polygon reference is stale or malformed")]
    InvalidPolyRef,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddTileError {
    #[error("tile data failed validation")]
    InvalidParam,
    #[error("a tile already occupies ({x}, {y}, layer {layer})")]
    Occupied { x: i32, y: i32, layer: i32 },
    #[error("all {0} tile slots are in use")]
    OutOfTileSlots(u32),
    #[error("tile has {got} polygons but the mesh allows {max} per tile")]
    TooManyPolygons { got: usize, max: u32 },
    #[error(transparent)]
    Decode(#[from] serialize::TileDecodeError),
}

const SIDE_COUNT: usize = 8;

/// Tile grid offset for each of the 8 boundary sides.
const SIDE_OFFSETS: [(i32, i32); SIDE_COUNT] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

#[inline]
fn opposite_side(side: u8) -> u8 {
    (side + 4) & 0x7
}

pub struct NavMesh {
    params: NavMeshParams,

    tiles: Vec<MeshTile>,
    free_slots: Vec<u32>,
    /// Tile slots stacked at each occupied (x, y) cell, one entry per layer.
    position_lookup: HashMap<(i32, i32), SmallVec<[u32; 4]>>,

    salt_bits: u32,
    tile_bits: u32,
    poly_bits: u32,
}

impl NavMesh {
    pub fn new(params: NavMeshParams) -> Result<Self, NavMeshError> {
        if params.max_tiles == 0
            || params.max_polys == 0
            || params.tile_width <= 0.0
            || params.tile_height <= 0.0
        {
            return Err(NavMeshError::InvalidParam);
        }

        let tile_bits = params.max_tiles.next_power_of_two().ilog2().max(1);
        let poly_bits = params.max_polys.next_power_of_two().ilog2().max(1);
        let salt_bits = 32u32.saturating_sub(tile_bits + poly_bits);

        if salt_bits < 8 {
            return Err(NavMeshError::TooFewSaltBits(salt_bits));
        }

        let mut tiles = Vec::with_capacity(params.max_tiles as usize);
        tiles.resize_with(params.max_tiles as usize, || MeshTile {
            salt: 1,
            ..Default::default()
        });

        // Pop order matches slot order: lowest index first.
        let free_slots = (0..params.max_tiles).rev().collect();

        Ok(Self {
            params,
            tiles,
            free_slots,
            position_lookup: HashMap::new(),
            salt_bits,
            tile_bits,
            poly_bits,
        })
    }

    #[inline]
    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    #[inline]
    pub fn max_polys_per_tile(&self) -> u32 {
        self.params.max_polys
    }

    // --- Polygon reference packing ---------------------------------------

    #[inline]
    pub fn encode_poly_id(&self, salt: u32, tile_index: u32, poly_index: u32) -> PolyRef {
        PolyRef(
            (salt << (self.poly_bits + self.tile_bits))
                | (tile_index << self.poly_bits)
                | poly_index,
        )
    }

    /// Splits `reference` into `(salt, tile index, polygon index)`.
    #[inline]
    pub fn decode_poly_id(&self, reference: PolyRef) -> (u32, u32, u32) {
        let salt_mask = (1u32 << self.salt_bits) - 1;
        let tile_mask = (1u32 << self.tile_bits) - 1;
        let poly_mask = (1u32 << self.poly_bits) - 1;

        (
            (reference.0 >> (self.poly_bits + self.tile_bits)) & salt_mask,
            (reference.0 >> self.poly_bits) & tile_mask,
            reference.0 & poly_mask,
        )
    }

    pub fn is_valid_poly_ref(&self, reference: PolyRef) -> bool {
        self.tile_and_poly_by_ref(reference).is_ok()
    }

    /// Resolves `reference`, verifying bounds & salt.
    pub fn tile_and_poly_by_ref(
        &self,
        reference: PolyRef,
    ) -> Result<(&MeshTile, &Poly), NavMeshError> {
        if reference.is_none() {
            return Err(NavMeshError::InvalidPolyRef);
        }

        let (salt, tile_index, poly_index) = self.decode_poly_id(reference);
        let tile = self
            .tiles
            .get(tile_index as usize)
            .ok_or(NavMeshError::InvalidPolyRef)?;

        if tile.salt != salt || tile.data.vertices.is_empty() {
            return Err(NavMeshError::InvalidPolyRef);
        }

        let poly = tile
            .data
            .polys
            .get(poly_index as usize)
            .ok_or(NavMeshError::InvalidPolyRef)?;

        Ok((tile, poly))
    }

    /// Like [Self::tile_and_poly_by_ref] without the salt check; only for
    /// references already validated this tick.
    pub(crate) fn tile_and_poly_unchecked(&self, reference: PolyRef) -> (&MeshTile, &Poly) {
        let (_, tile_index, poly_index) = self.decode_poly_id(reference);
        let tile = &self.tiles[tile_index as usize];

        (tile, &tile.data.polys[poly_index as usize])
    }

    /// Reference of the first polygon in the tile at `slot`; the base other
    /// polygon indices are added onto.
    #[inline]
    pub fn poly_ref_base(&self, slot: u32) -> PolyRef {
        self.encode_poly_id(self.tiles[slot as usize].salt, slot, 0)
    }

    // --- Tile placement ---------------------------------------------------

    /// Tile grid cell containing `position`.
    #[inline]
    pub fn calc_tile_loc(&self, position: Vec3) -> (i32, i32) {
        (
            ((position.x - self.params.origin.x) / self.params.tile_width).floor() as i32,
            ((position.z - self.params.origin.z) / self.params.tile_height).floor() as i32,
        )
    }

    /// Slot indices of every tile at grid cell `(x, y)`, one per layer.
    pub fn tiles_at(&self, x: i32, y: i32) -> SmallVec<[u32; 4]> {
        self.position_lookup
            .get(&(x, y))
            .cloned()
            .unwrap_or_default()
    }

    pub fn tile_ref_at(&self, x: i32, y: i32, layer: i32) -> TileRef {
        for &slot in self.tiles_at(x, y).iter() {
            let tile = &self.tiles[slot as usize];
            if tile.data.layer == layer {
                return self.tile_ref(slot);
            }
        }

        TileRef::NONE
    }

    #[inline]
    fn tile_ref(&self, slot: u32) -> TileRef {
        TileRef(self.encode_poly_id(self.tiles[slot as usize].salt, slot, 0).0)
    }

    /// All currently loaded tiles, with their slot indices.
    pub fn tiles(&self) -> impl Iterator<Item = (u32, &MeshTile)> {
        self.tiles
            .iter()
            .enumerate()
            .filter(|(_, tile)| !tile.data.vertices.is_empty())
            .map(|(index, tile)| (index as u32, tile))
    }

    // --- Add / remove -----------------------------------------------------

    /// Adds a tile, rebuilding its link graph against the currently loaded
    /// neighbours on all 8 sides plus the other layers of its own cell.
    pub fn add_tile(&mut self, data: TileData) -> Result<TileRef, AddTileError> {
        if data.polys.is_empty() || data.vertices.is_empty() {
            return Err(AddTileError::InvalidParam);
        }
        if data.poly_count() > self.params.max_polys as usize {
            return Err(AddTileError::TooManyPolygons {
                got: data.poly_count(),
                max: self.params.max_polys,
            });
        }
        if !self
            .tile_ref_at(data.x, data.y, data.layer)
            .is_none()
        {
            return Err(AddTileError::Occupied {
                x: data.x,
                y: data.y,
                layer: data.layer,
            });
        }

        let slot = self
            .free_slots
            .pop()
            .ok_or(AddTileError::OutOfTileSlots(self.params.max_tiles))?;

        let (x, y) = (data.x, data.y);
        {
            let tile = &mut self.tiles[slot as usize];
            tile.data = data;

            // Build the link freelist back to front so allocation order is
            // front to back.
            let link_count = tile.data.max_link_count.max(1) as usize;
            tile.links.clear();
            tile.links.resize(link_count, Link::default());
            tile.links_free_list = 0;
            for (i, link) in tile.links.iter_mut().enumerate() {
                link.next = if i + 1 < link_count {
                    (i + 1) as u32
                } else {
                    NULL_LINK
                };
            }
        }

        self.position_lookup.entry((x, y)).or_default().push(slot);

        self.connect_internal_links(slot);
        self.base_off_mesh_links(slot);
        // Off-mesh connections landing within their own tile.
        self.connect_external_off_mesh_links(slot, slot, None);

        // Same-cell layers, then the 8 cardinal/diagonal neighbours.
        let stack = self.tiles_at(x, y);
        for &neighbour in stack.iter().filter(|&&n| n != slot) {
            self.connect_external_links(slot, neighbour, None);
            self.connect_external_links(neighbour, slot, None);
            self.connect_external_off_mesh_links(slot, neighbour, None);
            self.connect_external_off_mesh_links(neighbour, slot, None);
        }

        for side in 0..SIDE_COUNT as u8 {
            let (dx, dy) = SIDE_OFFSETS[side as usize];
            for &neighbour in self.tiles_at(x + dx, y + dy).iter() {
                self.connect_external_links(slot, neighbour, Some(side));
                self.connect_external_links(neighbour, slot, Some(opposite_side(side)));
                self.connect_external_off_mesh_links(slot, neighbour, Some(side));
                self.connect_external_off_mesh_links(neighbour, slot, Some(opposite_side(side)));
            }
        }

        Ok(self.tile_ref(slot))
    }

    /// Removes a tile, unlinking it from every neighbour. The tile's payload
    /// is handed back so callers can store or re-add it.
    pub fn remove_tile(&mut self, reference: TileRef) -> Result<TileData, NavMeshError> {
        if reference.is_none() {
            return Err(NavMeshError::InvalidParam);
        }

        let (salt, slot, _) = self.decode_poly_id(PolyRef(reference.0));
        if slot >= self.params.max_tiles {
            return Err(NavMeshError::InvalidPolyRef);
        }
        if self.tiles[slot as usize].salt != salt
            || self.tiles[slot as usize].data.vertices.is_empty()
        {
            return Err(NavMeshError::InvalidPolyRef);
        }

        let (x, y) = (
            self.tiles[slot as usize].data.x,
            self.tiles[slot as usize].data.y,
        );

        if let Some(stack) = self.position_lookup.get_mut(&(x, y)) {
            stack.retain(|&mut s| s != slot);
            if stack.is_empty() {
                self.position_lookup.remove(&(x, y));
            }
        }

        // Sever links held by neighbours pointing into this tile.
        let stack = self.tiles_at(x, y);
        for &neighbour in stack.iter() {
            self.unconnect_links(neighbour, slot);
        }
        for (dx, dy) in SIDE_OFFSETS {
            for &neighbour in self.tiles_at(x + dx, y + dy).iter() {
                self.unconnect_links(neighbour, slot);
            }
        }

        let tile = &mut self.tiles[slot as usize];
        let data = std::mem::take(&mut tile.data);
        tile.links.clear();
        tile.links_free_list = NULL_LINK;

        // Stale references to this slot die here.
        tile.salt = (tile.salt + 1) & ((1 << self.salt_bits) - 1);
        if tile.salt == 0 {
            tile.salt += 1;
        }

        self.free_slots.push(slot);

        Ok(data)
    }

    // --- Link building ----------------------------------------------------

    fn allocate_link(tile: &mut MeshTile) -> Option<u32> {
        if tile.links_free_list == NULL_LINK {
            return None;
        }

        let link = tile.links_free_list;
        tile.links_free_list = tile.links[link as usize].next;

        Some(link)
    }

    /// Links between polygons of the same tile, straight from the neighbour
    /// table the builder produced.
    fn connect_internal_links(&mut self, slot: u32) {
        let base = self.poly_ref_base(slot);
        let tile = &mut self.tiles[slot as usize];

        for poly_index in 0..tile.data.polys.len() {
            tile.data.polys[poly_index].first_link = NULL_LINK;

            if tile.data.polys[poly_index].poly_type() == PolyType::OffMeshConnection {
                continue;
            }

            // Build in reverse so the list matches edge order when walked.
            for edge in (0..tile.data.polys[poly_index].vertex_count as usize).rev() {
                let neighbour = tile.data.polys[poly_index].neighbours[edge];
                if neighbour == 0 || (neighbour & EXTERNAL_LINK) != 0 {
                    continue;
                }

                let Some(link_index) = Self::allocate_link(tile) else {
                    continue;
                };

                tile.links[link_index as usize] = Link {
                    target: PolyRef(base.0 + (neighbour - 1) as u32),
                    next: tile.data.polys[poly_index].first_link,
                    edge: edge as u8,
                    side: 0xff,
                    bmin: 0,
                    bmax: 0,
                };
                tile.data.polys[poly_index].first_link = link_index;
            }
        }
    }

    /// Connects boundary edges of `slot` to polygons of `target`, optionally
    /// restricted to one side.
    fn connect_external_links(&mut self, slot: u32, target: u32, side: Option<u8>) {
        if self.tiles[target as usize].data.vertices.is_empty() {
            return;
        }

        let poly_count = self.tiles[slot as usize].data.polys.len();
        for poly_index in 0..poly_count {
            let vertex_count =
                self.tiles[slot as usize].data.polys[poly_index].vertex_count as usize;

            for edge in 0..vertex_count {
                let neighbour = self.tiles[slot as usize].data.polys[poly_index].neighbours[edge];
                if (neighbour & EXTERNAL_LINK) == 0 {
                    continue;
                }

                let dir = (neighbour & 0xff) as u8;
                if side.is_some_and(|side| dir != side) {
                    continue;
                }

                let (va, vb) = {
                    let tile = &self.tiles[slot as usize];
                    let poly = &tile.data.polys[poly_index];
                    (
                        tile.data.vertices[poly.vertices[edge] as usize],
                        tile.data.vertices[poly.vertices[(edge + 1) % vertex_count] as usize],
                    )
                };

                let connections = self.find_connecting_polys(va, vb, target, opposite_side(dir));

                for (target_ref, range_min, range_max) in connections {
                    let tile = &mut self.tiles[slot as usize];
                    let Some(link_index) = Self::allocate_link(tile) else {
                        continue;
                    };

                    // Quantize the shared sub-range onto this edge.
                    let (bmin, bmax) = match dir {
                        0 | 4 => {
                            let mut min = (range_min - va.z) / (vb.z - va.z);
                            let mut max = (range_max - va.z) / (vb.z - va.z);
                            if min > max {
                                std::mem::swap(&mut min, &mut max);
                            }
                            (
                                (min.clamp(0.0, 1.0) * 255.0) as u8,
                                (max.clamp(0.0, 1.0) * 255.0) as u8,
                            )
                        }
                        _ => {
                            let mut min = (range_min - va.x) / (vb.x - va.x);
                            let mut max = (range_max - va.x) / (vb.x - va.x);
                            if min > max {
                                std::mem::swap(&mut min, &mut max);
                            }
                            (
                                (min.clamp(0.0, 1.0) * 255.0) as u8,
                                (max.clamp(0.0, 1.0) * 255.0) as u8,
                            )
                        }
                    };

                    tile.links[link_index as usize] = Link {
                        target: target_ref,
                        next: tile.data.polys[poly_index].first_link,
                        edge: edge as u8,
                        side: dir,
                        bmin,
                        bmax,
                    };
                    tile.data.polys[poly_index].first_link = link_index;
                }
            }
        }
    }

    /// Boundary polygons of `target` whose edge on `side` overlaps segment
    /// `(va, vb)`, with the overlap range along the shared axis.
    fn find_connecting_polys(
        &self,
        va: Vec3,
        vb: Vec3,
        target: u32,
        side: u8,
    ) -> SmallVec<[(PolyRef, f32, f32); 4]> {
        let mut out = SmallVec::new();

        let tile = &self.tiles[target as usize];
        if tile.data.vertices.is_empty() {
            return out;
        }

        let (amin, amax) = calc_slab_end_points(va, vb, side);
        let apos = slab_coord(va, side);
        let base = self.poly_ref_base(target);

        let side_marker = EXTERNAL_LINK | side as u16;

        for (poly_index, poly) in tile.data.polys.iter().enumerate() {
            let vertex_count = poly.vertex_count as usize;
            for edge in 0..vertex_count {
                if poly.neighbours[edge] != side_marker {
                    continue;
                }

                let vc = tile.data.vertices[poly.vertices[edge] as usize];
                let vd = tile.data.vertices[poly.vertices[(edge + 1) % vertex_count] as usize];

                // Segments are not close enough along the boundary axis.
                if (apos - slab_coord(vc, side)).abs() > 0.01 {
                    continue;
                }

                let (bmin, bmax) = calc_slab_end_points(vc, vd, side);

                if !overlap_slabs(amin, amax, bmin, bmax, 0.01, tile.data.walkable_climb) {
                    continue;
                }

                out.push((
                    PolyRef(base.0 + poly_index as u32),
                    bmin.0.max(amin.0),
                    bmax.0.min(amax.0),
                ));

                break;
            }
        }

        out
    }

    /// Connects off-mesh connection start points to the ground polygons of
    /// their own tile.
    fn base_off_mesh_links(&mut self, slot: u32) {
        let base = self.poly_ref_base(slot);

        let con_count = self.tiles[slot as usize].data.off_mesh_connections.len();
        for con_index in 0..con_count {
            let con = self.tiles[slot as usize].data.off_mesh_connections[con_index];
            let con_poly_index = con.poly as usize;

            let extents = Vec3::new(
                con.radius,
                self.tiles[slot as usize].data.walkable_climb,
                con.radius,
            );

            // The start point must land on a polygon of this tile.
            let Some((ground_ref, nearest)) =
                self.find_nearest_poly_in_tile(slot, con.endpoints[0], extents)
            else {
                continue;
            };
            if (nearest.xz() - con.endpoints[0].xz()).length_squared() > con.radius * con.radius {
                continue;
            }

            let tile = &mut self.tiles[slot as usize];

            // Snap the stand-in polygon's start vertex to the ground.
            let start_vertex = tile.data.polys[con_poly_index].vertices[0] as usize;
            tile.data.vertices[start_vertex] = nearest;

            if let Some(link_index) = Self::allocate_link(tile) {
                tile.links[link_index as usize] = Link {
                    target: ground_ref,
                    next: tile.data.polys[con_poly_index].first_link,
                    edge: 0,
                    side: 0xff,
                    bmin: 0,
                    bmax: 0,
                };
                tile.data.polys[con_poly_index].first_link = link_index;
            }

            // And the ground polygon links back onto the connection.
            let (_, _, ground_poly_index) = self.decode_poly_id(ground_ref);
            let tile = &mut self.tiles[slot as usize];
            if let Some(link_index) = Self::allocate_link(tile) {
                tile.links[link_index as usize] = Link {
                    target: PolyRef(base.0 + con_poly_index as u32),
                    next: tile.data.polys[ground_poly_index as usize].first_link,
                    edge: 0xff,
                    side: 0xff,
                    bmin: 0,
                    bmax: 0,
                };
                tile.data.polys[ground_poly_index as usize].first_link = link_index;
            }
        }
    }

    /// Connects off-mesh connections of `slot` whose far end lies in
    /// `target`.
    fn connect_external_off_mesh_links(&mut self, slot: u32, target: u32, side: Option<u8>) {
        if self.tiles[target as usize].data.vertices.is_empty() {
            return;
        }

        // A connection exits through its own side code; 0xff stays in-tile.
        let wanted_side = side.unwrap_or(0xff);

        let con_count = self.tiles[slot as usize].data.off_mesh_connections.len();
        for con_index in 0..con_count {
            let con = self.tiles[slot as usize].data.off_mesh_connections[con_index];

            if con.side != wanted_side {
                continue;
            }
            // Skip connections whose start never touched down.
            if self.tiles[slot as usize].data.polys[con.poly as usize].first_link == NULL_LINK {
                continue;
            }

            let extents = Vec3::new(
                con.radius,
                self.tiles[slot as usize].data.walkable_climb,
                con.radius,
            );

            let Some((land_ref, nearest)) =
                self.find_nearest_poly_in_tile(target, con.endpoints[1], extents)
            else {
                continue;
            };
            if (nearest.xz() - con.endpoints[1].xz()).length_squared() > con.radius * con.radius {
                continue;
            }

            let con_poly_index = con.poly as usize;
            let base = self.poly_ref_base(slot);

            {
                let tile = &mut self.tiles[slot as usize];
                let end_vertex = tile.data.polys[con_poly_index].vertices[1] as usize;
                tile.data.vertices[end_vertex] = nearest;

                if let Some(link_index) = Self::allocate_link(tile) {
                    tile.links[link_index as usize] = Link {
                        target: land_ref,
                        next: tile.data.polys[con_poly_index].first_link,
                        edge: 1,
                        side: con.side,
                        bmin: 0,
                        bmax: 0,
                    };
                    tile.data.polys[con_poly_index].first_link = link_index;
                }
            }

            if (con.flags & OFF_MESH_CON_BIDIRECTIONAL) != 0 {
                let (_, _, land_poly_index) = self.decode_poly_id(land_ref);
                let land_side = side.map_or(0xff, opposite_side);

                let tile = &mut self.tiles[target as usize];
                if let Some(link_index) = Self::allocate_link(tile) {
                    tile.links[link_index as usize] = Link {
                        target: PolyRef(base.0 + con_poly_index as u32),
                        next: tile.data.polys[land_poly_index as usize].first_link,
                        edge: 0xff,
                        side: land_side,
                        bmin: 0,
                        bmax: 0,
                    };
                    tile.data.polys[land_poly_index as usize].first_link = link_index;
                }
            }
        }
    }

    /// Removes every link in `slot` that targets a polygon of `removed`.
    fn unconnect_links(&mut self, slot: u32, removed: u32) {
        if slot == removed {
            return;
        }

        let removed_salt = self.tiles[removed as usize].salt;
        let removed_base = self.encode_poly_id(removed_salt, removed, 0);
        let poly_mask = !((1u32 << self.poly_bits) - 1);

        let tile = &mut self.tiles[slot as usize];
        if tile.data.vertices.is_empty() {
            return;
        }

        for poly in tile.data.polys.iter_mut() {
            let mut link = poly.first_link;
            let mut previous = NULL_LINK;

            while link != NULL_LINK {
                let next = tile.links[link as usize].next;

                if (tile.links[link as usize].target.0 & poly_mask) == (removed_base.0 & poly_mask)
                {
                    if previous == NULL_LINK {
                        poly.first_link = next;
                    } else {
                        tile.links[previous as usize].next = next;
                    }

                    tile.links[link as usize].next = tile.links_free_list;
                    tile.links_free_list = link;
                } else {
                    previous = link;
                }

                link = next;
            }
        }
    }

    // --- Spatial queries against single tiles ------------------------------

    /// Polygon references in `slot` whose bounds overlap the query AABB.
    /// Walks the BV-tree when the tile carries one, otherwise scans.
    pub(crate) fn query_polygons_in_tile(
        &self,
        slot: u32,
        query_min: Vec3,
        query_max: Vec3,
        out: &mut Vec<PolyRef>,
    ) {
        let tile = &self.tiles[slot as usize];
        let base = self.poly_ref_base(slot);

        if !tile.data.bv_nodes.is_empty() {
            let quant = tile.data.bv_quant_factor;
            let tile_min = tile.data.bmin;
            let tile_max = tile.data.bmax;

            // Clamp the query into tile space, then quantize. The extra
            // round-out keeps boundary polygons in.
            let clamp = |value: Vec3| value.clamp(tile_min, tile_max) - tile_min;
            let qmin = clamp(query_min) * quant;
            let qmax = clamp(query_max) * quant;

            let bmin = [
                (qmin.x as u16) & 0xfffe,
                (qmin.y as u16) & 0xfffe,
                (qmin.z as u16) & 0xfffe,
            ];
            let bmax = [
                (qmax.x as u16) | 1,
                (qmax.y as u16) | 1,
                (qmax.z as u16) | 1,
            ];

            let mut node = 0usize;
            while node < tile.data.bv_nodes.len() {
                let bv = &tile.data.bv_nodes[node];
                let overlap = overlap_quantized_bounds(bmin, bmax, bv.bmin, bv.bmax);
                let is_leaf = bv.i >= 0;

                if is_leaf && overlap {
                    out.push(PolyRef(base.0 + bv.i as u32));
                }

                if overlap || is_leaf {
                    node += 1;
                } else {
                    node += (-bv.i) as usize;
                }
            }
        } else {
            for (poly_index, poly) in tile.data.polys.iter().enumerate() {
                if poly.poly_type() == PolyType::OffMeshConnection {
                    continue;
                }

                let mut poly_min = tile.data.vertices[poly.vertices[0] as usize];
                let mut poly_max = poly_min;
                for &vertex in poly.vertices[1..poly.vertex_count as usize].iter() {
                    let v = tile.data.vertices[vertex as usize];
                    poly_min = poly_min.min(v);
                    poly_max = poly_max.max(v);
                }

                if crate::math::overlap_bounds(query_min, query_max, poly_min, poly_max) {
                    out.push(PolyRef(base.0 + poly_index as u32));
                }
            }
        }
    }

    /// Nearest polygon to `center` within one tile, preferring polygons
    /// directly underfoot over closer ones beside.
    pub fn find_nearest_poly_in_tile(
        &self,
        slot: u32,
        center: Vec3,
        extents: Vec3,
    ) -> Option<(PolyRef, Vec3)> {
        let mut candidates = Vec::new();
        self.query_polygons_in_tile(slot, center - extents, center + extents, &mut candidates);

        let mut nearest = None;
        let mut nearest_distance = f32::MAX;

        for reference in candidates {
            let (closest, pos_over_poly) = self.closest_point_on_poly(reference, center);

            // A polygon underfoot only pays vertical distance above the
            // climb allowance.
            let difference = center - closest;
            let distance = if pos_over_poly {
                let d = difference.y.abs() - self.tiles[slot as usize].data.walkable_climb;
                if d > 0.0 {
                    d * d
                } else {
                    0.0
                }
            } else {
                difference.length_squared()
            };

            if distance < nearest_distance {
                nearest_distance = distance;
                nearest = Some((reference, closest));
            }
        }

        nearest
    }

    /// Closest point on a polygon to `position`, and whether the position's
    /// XZ-projection was inside the polygon footprint.
    ///
    /// Off-mesh connection polygons clamp onto the segment between their
    /// endpoints.
    pub fn closest_point_on_poly(&self, reference: PolyRef, position: Vec3) -> (Vec3, bool) {
        let (tile, poly) = self.tile_and_poly_unchecked(reference);
        let (_, _, poly_index) = self.decode_poly_id(reference);

        if poly.poly_type() == PolyType::OffMeshConnection {
            let a = tile.data.vertices[poly.vertices[0] as usize];
            let b = tile.data.vertices[poly.vertices[1] as usize];
            let (_, t) = crate::math::distance_point_to_segment_2d(position, a, b);

            return (a.lerp(b, t), false);
        }

        let mut vertices = [Vec3::ZERO; VERTICES_PER_POLYGON];
        let vertex_count = tile.polygon_vertices(poly, &mut vertices);

        let mut edge_distances = [0.0f32; VERTICES_PER_POLYGON];
        let mut edge_factors = [0.0f32; VERTICES_PER_POLYGON];
        let inside = distance_point_to_polygon_edges_2d(
            position,
            &vertices[..vertex_count],
            &mut edge_distances[..vertex_count],
            &mut edge_factors[..vertex_count],
        );

        let mut closest = if inside {
            position
        } else {
            // Clamp onto the nearest edge.
            let mut best_edge = 0;
            for edge in 1..vertex_count {
                if edge_distances[edge] < edge_distances[best_edge] {
                    best_edge = edge;
                }
            }

            let a = vertices[best_edge];
            let b = vertices[(best_edge + 1) % vertex_count];
            a.lerp(b, edge_factors[best_edge])
        };

        // Use the detail surface for the height.
        if let Some(detail) = tile.data.detail_meshes.get(poly_index as usize) {
            for tri_index in 0..detail.tri_count as usize {
                let triangle = tile.data.detail_triangles[detail.tri_base as usize + tri_index];
                let mut corners = [Vec3::ZERO; 3];

                for (corner, &index) in corners.iter_mut().zip(triangle[..3].iter()) {
                    *corner = if (index as usize) < poly.vertex_count as usize {
                        tile.data.vertices[poly.vertices[index as usize] as usize]
                    } else {
                        tile.data.detail_vertices[detail.vert_base as usize + index as usize
                            - poly.vertex_count as usize]
                    };
                }

                if let Some(height) =
                    closest_height_point_triangle(closest, corners[0], corners[1], corners[2])
                {
                    closest.y = height;
                    break;
                }
            }
        }

        (closest, inside)
    }

    /// Height of the polygon surface under `position`, from the detail mesh.
    pub fn poly_height(&self, reference: PolyRef, position: Vec3) -> Option<f32> {
        let (tile, poly) = self.tile_and_poly_by_ref(reference).ok()?;
        let (_, _, poly_index) = self.decode_poly_id(reference);

        if poly.poly_type() == PolyType::OffMeshConnection {
            return None;
        }

        let detail = tile.data.detail_meshes.get(poly_index as usize)?;
        for tri_index in 0..detail.tri_count as usize {
            let triangle = tile.data.detail_triangles[detail.tri_base as usize + tri_index];
            let mut corners = [Vec3::ZERO; 3];

            for (corner, &index) in corners.iter_mut().zip(triangle[..3].iter()) {
                *corner = if (index as usize) < poly.vertex_count as usize {
                    tile.data.vertices[poly.vertices[index as usize] as usize]
                } else {
                    tile.data.detail_vertices
                        [detail.vert_base as usize + index as usize - poly.vertex_count as usize]
                };
            }

            if let Some(height) =
                closest_height_point_triangle(position, corners[0], corners[1], corners[2])
            {
                return Some(height);
            }
        }

        None
    }

    /// Endpoints of an off-mesh connection, ordered for travel entering from
    /// `previous`.
    pub fn off_mesh_connection_end_points(
        &self,
        previous: PolyRef,
        connection: PolyRef,
    ) -> Result<(Vec3, Vec3), NavMeshError> {
        let (tile, poly) = self.tile_and_poly_by_ref(connection)?;
        if poly.poly_type() != PolyType::OffMeshConnection {
            return Err(NavMeshError::InvalidParam);
        }

        // The first link whose target is `previous` decides the direction.
        let mut enter_at_zero = true;
        for link in tile.links_of(poly) {
            if link.edge == 0 {
                enter_at_zero = link.target == previous;
                break;
            }
        }

        let a = tile.data.vertices[poly.vertices[0] as usize];
        let b = tile.data.vertices[poly.vertices[1] as usize];

        if enter_at_zero {
            Ok((a, b))
        } else {
            Ok((b, a))
        }
    }
}

// --- Slab overlap helpers -------------------------------------------------

/// 2D end points of a boundary edge in slab space: (coordinate along the
/// boundary, height).
fn calc_slab_end_points(va: Vec3, vb: Vec3, side: u8) -> ((f32, f32), (f32, f32)) {
    // Sides 0 & 4 run along Z, the rest along X.
    if side == 0 || side == 4 {
        if va.z < vb.z {
            ((va.z, va.y), (vb.z, vb.y))
        } else {
            ((vb.z, vb.y), (va.z, va.y))
        }
    } else if va.x < vb.x {
        ((va.x, va.y), (vb.x, vb.y))
    } else {
        ((vb.x, vb.y), (va.x, va.y))
    }
}

fn slab_coord(v: Vec3, side: u8) -> f32 {
    if side == 0 || side == 4 {
        v.x
    } else {
        v.z
    }
}

/// Two boundary edges connect iff their ranges overlap horizontally and the
/// vertical gap at the overlap is within the walkable climb.
fn overlap_slabs(
    amin: (f32, f32),
    amax: (f32, f32),
    bmin: (f32, f32),
    bmax: (f32, f32),
    padding: f32,
    walkable_climb: f32,
) -> bool {
    let min_x = (amin.0 + padding).max(bmin.0 + padding);
    let max_x = (amax.0 - padding).min(bmax.0 - padding);
    if min_x > max_x {
        return false;
    }

    // Heights of both segments at the overlap interval's ends.
    let ad = (amax.1 - amin.1) / (amax.0 - amin.0);
    let ak = amin.1 - ad * amin.0;
    let bd = (bmax.1 - bmin.1) / (bmax.0 - bmin.0);
    let bk = bmin.1 - bd * bmin.0;

    let a_min_y = ad * min_x + ak;
    let a_max_y = ad * max_x + ak;
    let b_min_y = bd * min_x + bk;
    let b_max_y = bd * max_x + bk;

    let delta_min = b_min_y - a_min_y;
    let delta_max = b_max_y - a_max_y;

    // Crossing segments always connect.
    if delta_min * delta_max < 0.0 {
        return true;
    }

    let threshold = (walkable_climb * 0.5) * (walkable_climb * 0.5);
    delta_min * delta_min <= threshold || delta_max * delta_max <= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> NavMeshParams {
        NavMeshParams {
            origin: Vec3::ZERO,
            tile_width: 10.0,
            tile_height: 10.0,
            max_tiles: 32,
            max_polys: 256,
        }
    }

    #[test]
    fn poly_ref_round_trips() {
        let mesh = NavMesh::new(test_params()).unwrap();

        let reference = mesh.encode_poly_id(21, 7, 113);
        assert_eq!(mesh.decode_poly_id(reference), (21, 7, 113));
    }

    #[test]
    fn salt_bit_budget_is_enforced() {
        let result = NavMesh::new(NavMeshParams {
            origin: Vec3::ZERO,
            tile_width: 10.0,
            tile_height: 10.0,
            max_tiles: 1 << 14,
            max_polys: 1 << 14,
        });

        assert!(matches!(result, Err(NavMeshError::TooFewSaltBits(_))));
    }

    #[test]
    fn tile_loc_is_floored() {
        let mesh = NavMesh::new(test_params()).unwrap();

        assert_eq!(mesh.calc_tile_loc(Vec3::new(5.0, 0.0, 5.0)), (0, 0));
        assert_eq!(mesh.calc_tile_loc(Vec3::new(-0.1, 0.0, 25.0)), (-1, 2));
    }

    #[test]
    fn slab_overlap_accepts_coincident_edges() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(0.0, 0.0, 4.0);

        let (amin, amax) = calc_slab_end_points(a, b, 0);
        let (bmin, bmax) = calc_slab_end_points(b, a, 4);

        assert!(overlap_slabs(amin, amax, bmin, bmax, 0.01, 0.5));
    }

    #[test]
    fn slab_overlap_rejects_vertical_gap() {
        let (amin, amax) = calc_slab_end_points(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 4.0),
            0,
        );
        let (bmin, bmax) = calc_slab_end_points(
            Vec3::new(0.0, 5.0, 0.0),
            Vec3::new(0.0, 5.0, 4.0),
            4,
        );

        assert!(!overlap_slabs(amin, amax, bmin, bmax, 0.01, 0.5));
    }
}
