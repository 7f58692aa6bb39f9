//! Shared fixtures: hand-packed flat meshes, no generation pipeline needed.

use bevy::prelude::Vec3;
use smallvec::smallvec;

use cohort_navigation::mesh::builder::{
    build_tile_data, OffMeshConnectionConfig, PolygonConfig, TileConfig,
};
use cohort_navigation::mesh::{Area, NavMesh, NavMeshParams, PolyFlags, TileData};

/// A square grid of quads covering `[origin, origin + size]` on the
/// XZ-plane at y = 0.
pub fn grid_tile(x: i32, y: i32, origin: Vec3, size: f32, cells: usize) -> TileData {
    let cell = size / cells as f32;
    let stride = cells + 1;

    let mut vertices = Vec::with_capacity(stride * stride);
    for gz in 0..stride {
        for gx in 0..stride {
            vertices.push(origin + Vec3::new(gx as f32 * cell, 0.0, gz as f32 * cell));
        }
    }

    let mut polygons = Vec::with_capacity(cells * cells);
    for cz in 0..cells {
        for cx in 0..cells {
            let v = |gx: usize, gz: usize| (gz * stride + gx) as u16;
            polygons.push(PolygonConfig {
                // Counter-clockwise seen from above.
                indices: smallvec![
                    v(cx, cz),
                    v(cx, cz + 1),
                    v(cx + 1, cz + 1),
                    v(cx + 1, cz),
                ],
                flags: PolyFlags::WALK,
                area: Area(0),
            });
        }
    }

    build_tile_data(TileConfig {
        x,
        y,
        bmin: origin,
        bmax: origin + Vec3::new(size, 1.0, size),
        vertices,
        polygons,
        ..Default::default()
    })
    .expect("grid tile is well-formed")
}

/// One 60 x 60 tile of 10 x 10 quads; the mesh every navigation scenario
/// runs on.
pub fn flat_mesh() -> NavMesh {
    let mut mesh = NavMesh::new(NavMeshParams {
        origin: Vec3::ZERO,
        tile_width: 60.0,
        tile_height: 60.0,
        max_tiles: 8,
        max_polys: 128,
    })
    .unwrap();

    mesh.add_tile(grid_tile(0, 0, Vec3::ZERO, 60.0, 10)).unwrap();

    mesh
}

/// Two disconnected islands bridged by one off-mesh connection from
/// (0, 0, 0) to (5, 0, 5).
#[allow(dead_code)]
pub fn island_mesh() -> NavMesh {
    let mut mesh = NavMesh::new(NavMeshParams {
        origin: Vec3::ZERO,
        tile_width: 10.0,
        tile_height: 10.0,
        max_tiles: 4,
        max_polys: 32,
    })
    .unwrap();

    let square = |base: Vec3, size: f32, vertex_base: u16| -> (Vec<Vec3>, PolygonConfig) {
        (
            vec![
                base,
                base + Vec3::new(0.0, 0.0, size),
                base + Vec3::new(size, 0.0, size),
                base + Vec3::new(size, 0.0, 0.0),
            ],
            PolygonConfig {
                indices: smallvec![
                    vertex_base,
                    vertex_base + 1,
                    vertex_base + 2,
                    vertex_base + 3,
                ],
                flags: PolyFlags::WALK,
                area: Area(0),
            },
        )
    };

    let (mut vertices, island_a) = square(Vec3::ZERO, 1.0, 0);
    let (island_b_vertices, island_b) = square(Vec3::new(4.5, 0.0, 4.5), 1.0, 4);
    vertices.extend(island_b_vertices);

    let data = build_tile_data(TileConfig {
        bmin: Vec3::new(0.0, 0.0, 0.0),
        bmax: Vec3::new(10.0, 1.0, 10.0),
        vertices,
        polygons: vec![island_a, island_b],
        off_mesh_connections: vec![OffMeshConnectionConfig {
            start: Vec3::ZERO,
            end: Vec3::new(5.0, 0.0, 5.0),
            radius: 0.5,
            bidirectional: true,
            flags: PolyFlags::WALK,
            area: Area(0),
            user_id: 1,
        }],
        ..Default::default()
    })
    .expect("island tile is well-formed");

    mesh.add_tile(data).unwrap();

    mesh
}
