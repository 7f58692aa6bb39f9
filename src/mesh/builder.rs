//! Builds [TileData] from polygon soup.
//!
//! The heavy off-line pipeline (voxelization, regions, contours) lives
//! outside this crate; what remains here is the packing step every consumer
//! needs: adjacency, boundary portals, stand-in polygons for off-mesh
//! connections, dummy detail meshes and the bounding-volume tree.

use bevy::prelude::Vec3;
use smallvec::SmallVec;
use std::collections::HashMap;
use thiserror::Error;

use super::{
    Area, BvNode, OffMeshConnection, Poly, PolyDetail, PolyFlags, PolyType, TileData,
    EXTERNAL_LINK, NULL_LINK, OFF_MESH_CON_BIDIRECTIONAL, VERTICES_PER_POLYGON,
};

/// One walkable polygon handed to the builder.
#[derive(Debug, Clone)]
pub struct PolygonConfig {
    /// Indices into [TileConfig::vertices], counter-clockwise, 3..=6 of them.
    pub indices: SmallVec<[u16; VERTICES_PER_POLYGON]>,
    pub flags: PolyFlags,
    pub area: Area,
}

/// One off-mesh connection handed to the builder. The start point must land
/// within this tile.
#[derive(Debug, Clone)]
pub struct OffMeshConnectionConfig {
    pub start: Vec3,
    pub end: Vec3,
    pub radius: f32,
    pub bidirectional: bool,
    pub flags: PolyFlags,
    pub area: Area,
    pub user_id: u32,
}

#[derive(Debug, Clone)]
pub struct TileConfig {
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    pub user_id: u32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub vertices: Vec<Vec3>,
    pub polygons: Vec<PolygonConfig>,
    pub off_mesh_connections: Vec<OffMeshConnectionConfig>,
    /// Skip the BV-tree for tiny tiles; queries fall back to a linear scan.
    pub build_bv_tree: bool,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            layer: 0,
            user_id: 0,
            bmin: Vec3::ZERO,
            bmax: Vec3::ZERO,
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            vertices: Vec::new(),
            polygons: Vec::new(),
            off_mesh_connections: Vec::new(),
            build_bv_tree: true,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BuildTileError {
    #[error("tile has no polygons")]
    Empty,
    #[error("polygon {0} has {1} vertices; 3..=6 supported")]
    BadPolygon(usize, usize),
    #[error("polygon {0} references vertex {1} out of range")]
    VertexOutOfRange(usize, u16),
    #[error("tile exceeds the 16-bit vertex index space")]
    TooManyVertices,
}

const BOUNDARY_EPSILON: f32 = 1e-4;

/// Which boundary side a point outside the tile footprint exits through.
/// `0xff` when the point is inside.
fn classify_off_mesh_point(point: Vec3, bmin: Vec3, bmax: Vec3) -> u8 {
    const XP: u8 = 1;
    const ZP: u8 = 2;
    const XM: u8 = 4;
    const ZM: u8 = 8;

    let mut outcode = 0u8;
    if point.x >= bmax.x {
        outcode |= XP;
    }
    if point.z >= bmax.z {
        outcode |= ZP;
    }
    if point.x < bmin.x {
        outcode |= XM;
    }
    if point.z < bmin.z {
        outcode |= ZM;
    }

    match outcode {
        _ if outcode == XP => 0,
        _ if outcode == XP | ZP => 1,
        _ if outcode == ZP => 2,
        _ if outcode == XM | ZP => 3,
        _ if outcode == XM => 4,
        _ if outcode == XM | ZM => 5,
        _ if outcode == ZM => 6,
        _ if outcode == XP | ZM => 7,
        _ => 0xff,
    }
}

/// Packs a tile. Off-mesh connections whose start point lies outside the
/// tile footprint are dropped.
pub fn build_tile_data(config: TileConfig) -> Result<TileData, BuildTileError> {
    if config.polygons.is_empty() {
        return Err(BuildTileError::Empty);
    }

    for (index, polygon) in config.polygons.iter().enumerate() {
        let count = polygon.indices.len();
        if !(3..=VERTICES_PER_POLYGON).contains(&count) {
            return Err(BuildTileError::BadPolygon(index, count));
        }
        for &vertex in polygon.indices.iter() {
            if vertex as usize >= config.vertices.len() {
                return Err(BuildTileError::VertexOutOfRange(index, vertex));
            }
        }
    }

    // Off-mesh connections that actually start here get stored.
    let stored_connections: Vec<&OffMeshConnectionConfig> = config
        .off_mesh_connections
        .iter()
        .filter(|con| classify_off_mesh_point(con.start, config.bmin, config.bmax) == 0xff)
        .collect();

    let ground_poly_count = config.polygons.len();
    let total_vertex_count = config.vertices.len() + stored_connections.len() * 2;
    if total_vertex_count > u16::MAX as usize {
        return Err(BuildTileError::TooManyVertices);
    }

    let mut vertices = config.vertices.clone();
    let mut polys = Vec::with_capacity(ground_poly_count + stored_connections.len());

    for polygon in &config.polygons {
        let mut poly = Poly {
            first_link: NULL_LINK,
            vertex_count: polygon.indices.len() as u8,
            flags: polygon.flags,
            ..Default::default()
        };
        poly.set_area(polygon.area);
        poly.set_poly_type(PolyType::Ground);
        for (slot, &index) in poly.vertices.iter_mut().zip(polygon.indices.iter()) {
            *slot = index;
        }
        polys.push(poly);
    }

    build_adjacency(&mut polys, config.bmin, config.bmax, &vertices);

    // Stand-in polygons & vertex pairs for the off-mesh connections.
    let mut off_mesh_connections = Vec::with_capacity(stored_connections.len());
    for con in &stored_connections {
        let vertex_base = vertices.len() as u16;
        vertices.push(con.start);
        vertices.push(con.end);

        let mut poly = Poly {
            first_link: NULL_LINK,
            vertex_count: 2,
            flags: con.flags,
            ..Default::default()
        };
        poly.set_area(con.area);
        poly.set_poly_type(PolyType::OffMeshConnection);
        poly.vertices[0] = vertex_base;
        poly.vertices[1] = vertex_base + 1;

        off_mesh_connections.push(OffMeshConnection {
            endpoints: [con.start, con.end],
            radius: con.radius,
            poly: polys.len() as u16,
            flags: if con.bidirectional {
                OFF_MESH_CON_BIDIRECTIONAL
            } else {
                0
            },
            side: classify_off_mesh_point(con.end, config.bmin, config.bmax),
            user_id: con.user_id,
        });
        polys.push(poly);
    }

    // Dummy detail meshes: fan-triangulate each ground polygon in place.
    let mut detail_meshes = Vec::with_capacity(ground_poly_count);
    let mut detail_triangles = Vec::new();
    for poly in polys.iter().take(ground_poly_count) {
        let vertex_count = poly.vertex_count as usize;
        let tri_base = detail_triangles.len() as u32;

        for j in 2..vertex_count {
            let mut edge_flags: u8 = 1 << 4; // Edge (c, a) half.
            if j == 2 {
                edge_flags |= 1; // Edge (a, b) lies on the polygon boundary.
            }
            if j == vertex_count - 1 {
                edge_flags |= 1 << 2;
            }
            detail_triangles.push([0, (j - 1) as u8, j as u8, edge_flags]);
        }

        detail_meshes.push(PolyDetail {
            vert_base: 0,
            tri_base,
            vert_count: 0,
            tri_count: (vertex_count - 2) as u8,
        });
    }

    // Link budget: one per directed internal edge, two per portal edge,
    // four per stored connection.
    let mut edge_count = 0usize;
    let mut portal_count = 0usize;
    for poly in polys.iter().take(ground_poly_count) {
        for edge in 0..poly.vertex_count as usize {
            let neighbour = poly.neighbours[edge];
            if neighbour == 0 {
                continue;
            }
            edge_count += 1;
            if (neighbour & EXTERNAL_LINK) != 0 {
                portal_count += 1;
            }
        }
    }
    let max_link_count = (edge_count + portal_count * 2 + stored_connections.len() * 4).max(1);

    let bv_nodes = if config.build_bv_tree {
        build_bv_tree(&polys[..ground_poly_count], &vertices, config.bmin, config.bmax)
    } else {
        Vec::new()
    };

    let extent = (config.bmax - config.bmin).max_element();
    let bv_quant_factor = if extent > 0.0 { 65534.0 / extent } else { 1.0 };

    Ok(TileData {
        x: config.x,
        y: config.y,
        layer: config.layer,
        user_id: config.user_id,
        bmin: config.bmin,
        bmax: config.bmax,
        walkable_height: config.walkable_height,
        walkable_radius: config.walkable_radius,
        walkable_climb: config.walkable_climb,
        bv_quant_factor,
        off_mesh_base: ground_poly_count as u32,
        max_link_count: max_link_count as u32,
        vertices,
        polys,
        detail_meshes,
        detail_vertices: Vec::new(),
        detail_triangles,
        bv_nodes,
        off_mesh_connections,
    })
}

/// Fills the neighbour table: shared edges become internal references, open
/// edges on the tile footprint become portals toward that side.
fn build_adjacency(polys: &mut [Poly], bmin: Vec3, bmax: Vec3, vertices: &[Vec3]) {
    let mut edge_to_owner: HashMap<(u16, u16), (usize, usize)> = HashMap::new();

    for poly_index in 0..polys.len() {
        let vertex_count = polys[poly_index].vertex_count as usize;
        for edge in 0..vertex_count {
            let a = polys[poly_index].vertices[edge];
            let b = polys[poly_index].vertices[(edge + 1) % vertex_count];
            let key = (a.min(b), a.max(b));

            if let Some(&(other_poly, other_edge)) = edge_to_owner.get(&key) {
                polys[poly_index].neighbours[edge] = other_poly as u16 + 1;
                polys[other_poly].neighbours[other_edge] = poly_index as u16 + 1;
            } else {
                edge_to_owner.insert(key, (poly_index, edge));
            }
        }
    }

    for poly in polys.iter_mut() {
        let vertex_count = poly.vertex_count as usize;
        for edge in 0..vertex_count {
            if poly.neighbours[edge] != 0 {
                continue;
            }

            let a = vertices[poly.vertices[edge] as usize];
            let b = vertices[poly.vertices[(edge + 1) % vertex_count] as usize];

            let side = if (a.x - bmax.x).abs() < BOUNDARY_EPSILON
                && (b.x - bmax.x).abs() < BOUNDARY_EPSILON
            {
                Some(0)
            } else if (a.z - bmax.z).abs() < BOUNDARY_EPSILON
                && (b.z - bmax.z).abs() < BOUNDARY_EPSILON
            {
                Some(2)
            } else if (a.x - bmin.x).abs() < BOUNDARY_EPSILON
                && (b.x - bmin.x).abs() < BOUNDARY_EPSILON
            {
                Some(4)
            } else if (a.z - bmin.z).abs() < BOUNDARY_EPSILON
                && (b.z - bmin.z).abs() < BOUNDARY_EPSILON
            {
                Some(6)
            } else {
                None
            };

            if let Some(side) = side {
                poly.neighbours[edge] = EXTERNAL_LINK | side;
            }
        }
    }
}

struct BvItem {
    bmin: [u16; 3],
    bmax: [u16; 3],
    poly: i32,
}

fn build_bv_tree(polys: &[Poly], vertices: &[Vec3], bmin: Vec3, bmax: Vec3) -> Vec<BvNode> {
    let extent = (bmax - bmin).max_element();
    let quant = if extent > 0.0 { 65534.0 / extent } else { 1.0 };

    let mut items = Vec::with_capacity(polys.len());
    for (poly_index, poly) in polys.iter().enumerate() {
        let mut poly_min = vertices[poly.vertices[0] as usize];
        let mut poly_max = poly_min;
        for &vertex in poly.vertices[1..poly.vertex_count as usize].iter() {
            let v = vertices[vertex as usize];
            poly_min = poly_min.min(v);
            poly_max = poly_max.max(v);
        }

        let quantize = |value: Vec3| -> [u16; 3] {
            let q = (value.clamp(bmin, bmax) - bmin) * quant;
            [q.x as u16, q.y as u16, q.z as u16]
        };

        items.push(BvItem {
            bmin: quantize(poly_min),
            bmax: quantize(poly_max),
            poly: poly_index as i32,
        });
    }

    let mut nodes = Vec::with_capacity(polys.len() * 2);
    subdivide(&mut items, 0, polys.len(), &mut nodes);

    nodes
}

fn calc_extends(items: &[BvItem], range: std::ops::Range<usize>) -> ([u16; 3], [u16; 3]) {
    let mut bmin = items[range.start].bmin;
    let mut bmax = items[range.start].bmax;

    for item in &items[range.start + 1..range.end] {
        for axis in 0..3 {
            bmin[axis] = bmin[axis].min(item.bmin[axis]);
            bmax[axis] = bmax[axis].max(item.bmax[axis]);
        }
    }

    (bmin, bmax)
}

fn subdivide(items: &mut [BvItem], start: usize, end: usize, nodes: &mut Vec<BvNode>) {
    let count = end - start;
    let current = nodes.len();

    if count == 1 {
        nodes.push(BvNode {
            bmin: items[start].bmin,
            bmax: items[start].bmax,
            i: items[start].poly,
        });
        return;
    }

    let (bmin, bmax) = calc_extends(items, start..end);
    nodes.push(BvNode {
        bmin,
        bmax,
        i: 0, // Escape offset patched below.
    });

    // Split along the longest axis, median order.
    let axis = {
        let extents = [
            bmax[0].saturating_sub(bmin[0]),
            bmax[1].saturating_sub(bmin[1]),
            bmax[2].saturating_sub(bmin[2]),
        ];
        if extents[0] >= extents[1] && extents[0] >= extents[2] {
            0
        } else if extents[1] >= extents[2] {
            1
        } else {
            2
        }
    };

    items[start..end].sort_unstable_by_key(|item| item.bmin[axis]);

    let split = start + count / 2;
    subdivide(items, start, split, nodes);
    subdivide(items, split, end, nodes);

    let escape = (nodes.len() - current) as i32;
    nodes[current].i = -escape;
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn square_tile() -> TileConfig {
        // Two triangles covering [0, 4] x [0, 4].
        TileConfig {
            bmin: Vec3::new(0.0, 0.0, 0.0),
            bmax: Vec3::new(4.0, 1.0, 4.0),
            vertices: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(0.0, 0.0, 4.0),
                Vec3::new(4.0, 0.0, 4.0),
                Vec3::new(4.0, 0.0, 0.0),
            ],
            polygons: vec![
                PolygonConfig {
                    indices: smallvec![0, 1, 2],
                    flags: PolyFlags::WALK,
                    area: Area(0),
                },
                PolygonConfig {
                    indices: smallvec![0, 2, 3],
                    flags: PolyFlags::WALK,
                    area: Area(0),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn shared_edge_becomes_internal_neighbour() {
        let data = build_tile_data(square_tile()).unwrap();

        // Edge (0, 2) is shared: triangle 0 edge 2, triangle 1 edge 0.
        assert_eq!(data.polys[0].neighbours[2], 2);
        assert_eq!(data.polys[1].neighbours[0], 1);
    }

    #[test]
    fn footprint_edges_become_portals() {
        let data = build_tile_data(square_tile()).unwrap();

        // Triangle 0 edge (0 -> 1) runs along x = 0.
        assert_eq!(data.polys[0].neighbours[0], EXTERNAL_LINK | 4);
        // Triangle 1 edge (3 -> 0) runs along z = 0.
        assert_eq!(data.polys[1].neighbours[2], EXTERNAL_LINK | 6);
    }

    #[test]
    fn off_mesh_connection_gets_stand_in_polygon() {
        let mut config = square_tile();
        config.off_mesh_connections.push(OffMeshConnectionConfig {
            start: Vec3::new(1.0, 0.0, 1.0),
            end: Vec3::new(10.0, 0.0, 1.0),
            radius: 0.5,
            bidirectional: true,
            flags: PolyFlags::WALK,
            area: Area(0),
            user_id: 7,
        });

        let data = build_tile_data(config).unwrap();

        assert_eq!(data.polys.len(), 3);
        assert_eq!(data.off_mesh_base, 2);
        assert_eq!(data.polys[2].poly_type(), PolyType::OffMeshConnection);
        assert_eq!(data.off_mesh_connections.len(), 1);
        // The end point exits through the +X side.
        assert_eq!(data.off_mesh_connections[0].side, 0);
    }

    #[test]
    fn bv_tree_covers_every_polygon() {
        let data = build_tile_data(square_tile()).unwrap();

        let leaves = data.bv_nodes.iter().filter(|node| node.i >= 0).count();
        assert_eq!(leaves, 2);
    }

    #[test]
    fn rejects_degenerate_polygons() {
        let mut config = square_tile();
        config.polygons[0].indices = smallvec![0, 1];

        assert!(matches!(
            build_tile_data(config),
            Err(BuildTileError::BadPolygon(0, 2))
        ));
    }
}
