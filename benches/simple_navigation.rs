use bevy::prelude::Vec3;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use smallvec::smallvec;

use cohort_navigation::crowd::{AgentParams, Crowd};
use cohort_navigation::mesh::builder::{build_tile_data, PolygonConfig, TileConfig};
use cohort_navigation::mesh::{Area, NavMesh, NavMeshParams, PolyFlags, TileData};
use cohort_navigation::query::{NavMeshQuery, StandardFilter, StraightPathOptions};

fn generate_grid_tile(size: f32, cells: usize) -> TileData {
    let cell = size / cells as f32;
    let stride = cells + 1;

    let mut vertices = Vec::with_capacity(stride * stride);
    for gz in 0..stride {
        for gx in 0..stride {
            vertices.push(Vec3::new(gx as f32 * cell, 0.0, gz as f32 * cell));
        }
    }

    let mut polygons = Vec::with_capacity(cells * cells);
    for cz in 0..cells {
        for cx in 0..cells {
            let v = |gx: usize, gz: usize| (gz * stride + gx) as u16;
            polygons.push(PolygonConfig {
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
        bmin: Vec3::ZERO,
        bmax: Vec3::new(size, 1.0, size),
        vertices,
        polygons,
        ..Default::default()
    })
    .unwrap()
}

fn build_mesh() -> NavMesh {
    let mut mesh = NavMesh::new(NavMeshParams {
        origin: Vec3::ZERO,
        tile_width: 60.0,
        tile_height: 60.0,
        max_tiles: 4,
        max_polys: 256,
    })
    .unwrap();

    mesh.add_tile(generate_grid_tile(60.0, 15)).unwrap();

    mesh
}

fn criterion_benchmark(c: &mut Criterion) {
    let mesh = build_mesh();
    let mut query = NavMeshQuery::new(2048).unwrap();
    let filter = StandardFilter::default();

    let start = Vec3::new(2.0, 0.0, 2.0);
    let end = Vec3::new(58.0, 0.0, 55.0);
    let extents = Vec3::splat(1.0);

    let (start_ref, start_pos) = query.find_nearest_poly(&mesh, start, extents, &filter).unwrap();
    let (end_ref, end_pos) = query.find_nearest_poly(&mesh, end, extents, &filter).unwrap();

    c.bench_function("Find Path", |b| {
        b.iter(|| {
            black_box(query.find_path(
                &mesh,
                start_ref,
                end_ref,
                start_pos,
                end_pos,
                &filter,
            ))
        })
    });

    let corridor = query
        .find_path(&mesh, start_ref, end_ref, start_pos, end_pos, &filter)
        .unwrap();

    c.bench_function("Straight Path", |b| {
        b.iter(|| {
            black_box(query.find_straight_path(
                &mesh,
                start_pos,
                end_pos,
                &corridor.polys,
                32,
                StraightPathOptions::empty(),
            ))
        })
    });

    c.bench_function("Crowd Update 25 Agents", |b| {
        let mut crowd = Crowd::new(25, 0.5).unwrap();
        for i in 0..25 {
            let position = Vec3::new(5.0 + (i % 5) as f32 * 1.5, 0.0, 5.0 + (i / 5) as f32 * 1.5);
            let index = crowd
                .add_agent(position, AgentParams::default(), &mesh)
                .unwrap();
            crowd.request_move_target(index, end_ref, end_pos).unwrap();
        }

        b.iter(|| {
            crowd.update(black_box(0.1), &mesh);
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
