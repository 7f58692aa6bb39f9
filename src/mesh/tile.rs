//! Tile-level data: polygons, links, detail meshes, bounding-volume nodes &
//! off-mesh connections.

use bevy::prelude::Vec3;
use bitflags::bitflags;

/// Maximum vertices a single polygon can have.
pub const VERTICES_PER_POLYGON: usize = 6;

/// Marker in a polygon's neighbour slot meaning "edge leads out of the tile";
/// the low bits carry the side code.
pub const EXTERNAL_LINK: u16 = 0x8000;

/// Sentinel for "no link" in the intrusive link lists.
pub const NULL_LINK: u32 = u32::MAX;

/// Off-mesh connection flag: traversable in both directions.
pub const OFF_MESH_CON_BIDIRECTIONAL: u8 = 1;

bitflags! {
    /// Per-polygon capability flags, matched against a query filter's
    /// include/exclude masks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PolyFlags: u16 {
        const WALK = 0x01;
        const SWIM = 0x02;
        const DOOR = 0x04;
        const JUMP = 0x08;
        const DISABLED = 0x10;
        const ALL = 0xffff;
    }
}

/// Area code assigned to a polygon; indexes the per-area cost table of the
/// standard filter. Six bits of storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Area(pub u8);

impl Area {
    pub const MAX: u8 = 0x3f;
}

/// What a polygon record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolyType {
    #[default]
    Ground,
    /// Point-to-point connection; the two "vertices" are the endpoints.
    OffMeshConnection,
}

/// A single polygon within a tile.
#[derive(Debug, Clone, Default)]
pub struct Poly {
    /// Head of this polygon's intrusive link list, [NULL_LINK] when empty.
    pub first_link: u32,
    /// Indices into the tile's vertex array; only the first
    /// `vertex_count` entries are meaningful.
    pub vertices: [u16; VERTICES_PER_POLYGON],
    /// Packed per-edge neighbour data. `0` = border edge,
    /// `n + 1` = internal polygon index n, [EXTERNAL_LINK] | side = edge on
    /// the tile boundary toward that side.
    pub neighbours: [u16; VERTICES_PER_POLYGON],
    pub flags: PolyFlags,
    pub vertex_count: u8,
    /// Packed area (low 6 bits) & type (high 2 bits), mirroring the
    /// on-disk byte.
    pub(crate) area_and_type: u8,
}

impl Poly {
    #[inline]
    pub fn area(&self) -> Area {
        Area(self.area_and_type & Area::MAX)
    }

    #[inline]
    pub fn set_area(&mut self, area: Area) {
        self.area_and_type = (self.area_and_type & 0xc0) | (area.0 & Area::MAX);
    }

    #[inline]
    pub fn poly_type(&self) -> PolyType {
        if (self.area_and_type >> 6) != 0 {
            PolyType::OffMeshConnection
        } else {
            PolyType::Ground
        }
    }

    #[inline]
    pub fn set_poly_type(&mut self, poly_type: PolyType) {
        let type_bits = match poly_type {
            PolyType::Ground => 0,
            PolyType::OffMeshConnection => 1,
        };
        self.area_and_type = (self.area_and_type & Area::MAX) | (type_bits << 6);
    }

    #[inline]
    pub(crate) fn area_and_type_byte(&self) -> u8 {
        self.area_and_type
    }

    #[inline]
    pub(crate) fn set_area_and_type_byte(&mut self, byte: u8) {
        self.area_and_type = byte;
    }
}

/// An edge between two polygons. Lives in the owning tile's link array,
/// threaded either onto a polygon's list or the tile's freelist.
#[derive(Debug, Clone, Copy)]
pub struct Link {
    /// Polygon the link leads to.
    pub target: super::PolyRef,
    /// Next link on the same list, [NULL_LINK] at the tail.
    pub next: u32,
    /// Edge of the owning polygon the link crosses.
    pub edge: u8,
    /// Boundary side code for cross-tile links, `0xff` for internal ones.
    pub side: u8,
    /// Sub-range of the shared edge the link covers, quantized to bytes.
    pub bmin: u8,
    pub bmax: u8,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            target: super::PolyRef::NONE,
            next: NULL_LINK,
            edge: 0,
            side: 0xff,
            bmin: 0,
            bmax: 0,
        }
    }
}

/// Detail mesh of one polygon: a sub-range of the tile's detail vertex &
/// triangle arrays refining the polygon's surface height.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolyDetail {
    pub vert_base: u32,
    pub tri_base: u32,
    pub vert_count: u8,
    pub tri_count: u8,
}

/// Node of the tile's bounding-volume tree over polygon AABBs, quantized to
/// the tile bounds. Leaf nodes carry the polygon index in `i`; escape nodes
/// carry the negated escape offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct BvNode {
    pub bmin: [u16; 3],
    pub bmax: [u16; 3],
    pub i: i32,
}

/// A user-defined point-to-point traversable edge.
#[derive(Debug, Clone, Copy)]
pub struct OffMeshConnection {
    /// Start & end positions in world space.
    pub endpoints: [Vec3; 2],
    pub radius: f32,
    /// Index of the connection's stand-in polygon within the tile.
    pub poly: u16,
    /// [OFF_MESH_CON_BIDIRECTIONAL] and friends.
    pub flags: u8,
    /// Boundary side the connection exits through, `0xff` when internal.
    pub side: u8,
    pub user_id: u32,
}

/// Everything a tile stores, in the layout the binary format describes.
/// [super::NavMesh::add_tile] consumes one of these; link lists get rebuilt
/// from scratch there.
#[derive(Debug, Clone, Default)]
pub struct TileData {
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    pub user_id: u32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub bv_quant_factor: f32,
    /// Index of the first off-mesh connection polygon; polygons from here on
    /// are [PolyType::OffMeshConnection].
    pub off_mesh_base: u32,
    pub max_link_count: u32,

    pub vertices: Vec<Vec3>,
    pub polys: Vec<Poly>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_vertices: Vec<Vec3>,
    /// Per triangle: three indices into the detail vertex range + edge flags.
    pub detail_triangles: Vec<[u8; 4]>,
    pub bv_nodes: Vec<BvNode>,
    pub off_mesh_connections: Vec<OffMeshConnection>,
}

impl TileData {
    #[inline]
    pub fn poly_count(&self) -> usize {
        self.polys.len()
    }
}

/// A slot in the navmesh's tile array: the tile payload plus the runtime
/// link pool.
#[derive(Debug, Default)]
pub struct MeshTile {
    /// Bumped every time the slot is freed; stale [super::PolyRef]s are
    /// detected by comparing against it.
    pub salt: u32,
    pub data: TileData,
    /// Link pool, `max_link_count` entries once allocated.
    pub links: Vec<Link>,
    /// Head of the link freelist.
    pub links_free_list: u32,
}

impl MeshTile {
    /// Vertices of polygon `poly` in edge order, copied into `out`. Returns
    /// how many were written.
    pub fn polygon_vertices(&self, poly: &Poly, out: &mut [Vec3; VERTICES_PER_POLYGON]) -> usize {
        let count = poly.vertex_count as usize;
        for (slot, index) in out.iter_mut().zip(poly.vertices[..count].iter()) {
            *slot = self.data.vertices[*index as usize];
        }

        count
    }

    /// Iterate the link list of `poly`.
    pub fn links_of<'a>(&'a self, poly: &Poly) -> LinkIter<'a> {
        LinkIter {
            tile: self,
            next: poly.first_link,
        }
    }
}

pub struct LinkIter<'a> {
    tile: &'a MeshTile,
    next: u32,
}

impl<'a> Iterator for LinkIter<'a> {
    type Item = &'a Link;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NULL_LINK {
            return None;
        }

        let link = &self.tile.links[self.next as usize];
        self.next = link.next;

        Some(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_and_type_pack_into_one_byte() {
        let mut poly = Poly::default();
        poly.set_area(Area(0x2a));
        poly.set_poly_type(PolyType::OffMeshConnection);

        assert_eq!(poly.area(), Area(0x2a));
        assert_eq!(poly.poly_type(), PolyType::OffMeshConnection);

        poly.set_poly_type(PolyType::Ground);
        assert_eq!(poly.area(), Area(0x2a));
        assert_eq!(poly.poly_type(), PolyType::Ground);
    }
}
