use bevy::prelude::Vec3;

use cohort_navigation::mesh::{NavMesh, NavMeshError, PolyRef};
use cohort_navigation::query::{
    NavMeshQuery, QueryError, RaycastOptions, StandardFilter, StraightPathFlags,
    StraightPathOptions,
};

mod common;

const EXTENTS: Vec3 = Vec3::new(1.0, 1.0, 1.0);

fn query() -> NavMeshQuery {
    NavMeshQuery::new(512).unwrap()
}

#[test]
fn straight_corridor_query() {
    let mesh = common::flat_mesh();
    let mut query = query();
    let filter = StandardFilter::default();

    let start_pos = Vec3::new(5.0, 0.0, 10.0);
    let end_pos = Vec3::new(50.0, 0.0, 30.0);

    let (start_ref, start_pos) = query
        .find_nearest_poly(&mesh, start_pos, EXTENTS, &filter)
        .unwrap();
    let (end_ref, end_pos) = query
        .find_nearest_poly(&mesh, end_pos, EXTENTS, &filter)
        .unwrap();
    assert!(!start_ref.is_none());
    assert!(!end_ref.is_none());

    let path = query
        .find_path(&mesh, start_ref, end_ref, start_pos, end_pos, &filter)
        .unwrap();
    assert!(!path.polys.is_empty());
    assert!(path.flags.is_empty(), "flat mesh path must be complete");

    let straight = query
        .find_straight_path(
            &mesh,
            start_pos,
            end_pos,
            &path.polys,
            32,
            StraightPathOptions::empty(),
        )
        .unwrap();

    assert!(straight.points.len() >= 2);

    let first = straight.points.first().unwrap();
    let last = straight.points.last().unwrap();
    assert!(first.flags.contains(StraightPathFlags::START));
    assert!(last.flags.contains(StraightPathFlags::END));
    assert!(first.position.distance(start_pos) < 0.01);
    assert!(last.position.distance(end_pos) < 0.01);

    // The funnel tightens the corridor toward the straight segment; on a
    // 6-unit quad grid no waypoint may stray more than one cell from it.
    let direction = (end_pos - start_pos).normalize();
    for point in &straight.points {
        let offset = point.position - start_pos;
        let along = offset.dot(direction);
        let lateral = (offset - direction * along).length();
        assert!(
            lateral < 6.0,
            "waypoint strays {lateral} from the start-end segment"
        );
    }
}

#[test]
fn degenerate_path_is_a_single_polygon() {
    let mesh = common::flat_mesh();
    let mut query = query();
    let filter = StandardFilter::default();

    let position = Vec3::new(5.0, 0.0, 10.0);
    let (reference, position) = query
        .find_nearest_poly(&mesh, position, EXTENTS, &filter)
        .unwrap();

    let path = query
        .find_path(&mesh, reference, reference, position, position, &filter)
        .unwrap();

    assert_eq!(path.polys.len(), 1);
    assert_eq!(path.polys[0], reference);
}

#[test]
fn nearest_poly_misses_outside_the_mesh() {
    let mesh = common::flat_mesh();
    let query = query();
    let filter = StandardFilter::default();

    let (reference, _) = query
        .find_nearest_poly(&mesh, Vec3::new(-5.0, 0.0, 10.0), EXTENTS, &filter)
        .unwrap();

    assert_eq!(reference, PolyRef::NONE);
}

#[test]
fn nearest_poly_rejects_invalid_input() {
    let mesh = common::flat_mesh();
    let query = query();
    let filter = StandardFilter::default();

    let result = query.find_nearest_poly(&mesh, Vec3::NAN, EXTENTS, &filter);
    assert_eq!(result.unwrap_err(), QueryError::InvalidParam);

    let result = query.find_nearest_poly(
        &mesh,
        Vec3::new(5.0, 0.0, 5.0),
        Vec3::new(-1.0, 1.0, 1.0),
        &filter,
    );
    assert_eq!(result.unwrap_err(), QueryError::InvalidParam);
}

#[test]
fn raycast_reaches_an_open_goal() {
    let mesh = common::flat_mesh();
    let mut query = query();
    let filter = StandardFilter::default();

    let (start_ref, start_pos) = query
        .find_nearest_poly(&mesh, Vec3::new(5.0, 0.0, 10.0), EXTENTS, &filter)
        .unwrap();

    let hit = query
        .raycast(
            &mesh,
            start_ref,
            start_pos,
            Vec3::new(50.0, 0.0, 30.0),
            &filter,
            RaycastOptions::empty(),
        )
        .unwrap();

    assert!(hit.reached_end());
    assert!(!hit.path.is_empty());
}

#[test]
fn raycast_hits_the_mesh_boundary() {
    let mesh = common::flat_mesh();
    let mut query = query();
    let filter = StandardFilter::default();

    let (start_ref, start_pos) = query
        .find_nearest_poly(&mesh, Vec3::new(55.0, 0.0, 10.0), EXTENTS, &filter)
        .unwrap();

    let hit = query
        .raycast(
            &mesh,
            start_ref,
            start_pos,
            Vec3::new(65.0, 0.0, 10.0),
            &filter,
            RaycastOptions::empty(),
        )
        .unwrap();

    assert!(!hit.reached_end());
    assert!((0.0..=1.0).contains(&hit.t));
    // The wall at x = 60 faces back along -X.
    assert!(hit.normal.x < -0.9);
}

#[test]
fn move_along_surface_slides_on_walls() {
    let mesh = common::flat_mesh();
    let mut query = query();
    let filter = StandardFilter::default();

    let (start_ref, start_pos) = query
        .find_nearest_poly(&mesh, Vec3::new(5.0, 0.0, 10.0), EXTENTS, &filter)
        .unwrap();

    // Push straight through the x = 0 boundary.
    let (constrained, visited) = query
        .move_along_surface(&mesh, start_ref, start_pos, Vec3::new(-5.0, 0.0, 10.0), &filter)
        .unwrap();

    assert!(!visited.is_empty());
    assert_eq!(visited[0], start_ref);
    assert!(constrained.x >= -0.01);
    assert!((constrained.z - 10.0).abs() < 0.5);
}

#[test]
fn poly_height_on_flat_mesh_is_zero() {
    let mesh = common::flat_mesh();
    let mut query = query();
    let filter = StandardFilter::default();

    let (reference, position) = query
        .find_nearest_poly(&mesh, Vec3::new(33.0, 0.5, 21.0), EXTENTS, &filter)
        .unwrap();

    let height = query.poly_height(&mesh, reference, position).unwrap();
    assert!(height.abs() < 1e-4);
}

#[test]
fn local_neighbourhood_and_wall_segments() {
    let mesh = common::flat_mesh();
    let mut query = query();
    let filter = StandardFilter::default();

    // A corner cell has two solid walls.
    let (corner_ref, corner_pos) = query
        .find_nearest_poly(&mesh, Vec3::new(1.0, 0.0, 1.0), EXTENTS, &filter)
        .unwrap();

    let polys = query
        .find_local_neighbourhood(&mesh, corner_ref, corner_pos, 8.0, &filter, 16)
        .unwrap();
    assert!(polys.len() > 1);
    assert_eq!(polys[0], corner_ref);

    let segments = query.poly_wall_segments(&mesh, corner_ref, &filter).unwrap();
    let walls = segments
        .iter()
        .filter(|segment| segment.neighbour.is_none())
        .count();
    let portals = segments.len() - walls;
    assert_eq!(walls, 2);
    assert_eq!(portals, 2);
}

#[test]
fn poly_refs_round_trip_and_go_stale() {
    let mut mesh = common::flat_mesh();
    let query = query();
    let filter = StandardFilter::default();

    let (reference, _) = query
        .find_nearest_poly(&mesh, Vec3::new(5.0, 0.0, 5.0), EXTENTS, &filter)
        .unwrap();

    let (salt, tile, poly) = mesh.decode_poly_id(reference);
    assert_eq!(mesh.encode_poly_id(salt, tile, poly), reference);
    assert!(mesh.is_valid_poly_ref(reference));

    // Removing the tile bumps the salt; the old reference must die.
    let tile_ref = mesh.tile_ref_at(0, 0, 0);
    let data = mesh.remove_tile(tile_ref).unwrap();
    assert!(!mesh.is_valid_poly_ref(reference));

    // Re-adding gives out fresh references.
    mesh.add_tile(data).unwrap();
    assert!(!mesh.is_valid_poly_ref(reference));
}

#[test]
fn occupied_cells_and_stale_tile_refs_are_rejected() {
    let mut mesh = common::flat_mesh();

    let duplicate = common::grid_tile(0, 0, Vec3::ZERO, 60.0, 10);
    assert!(mesh.add_tile(duplicate).is_err());

    let tile_ref = mesh.tile_ref_at(0, 0, 0);
    mesh.remove_tile(tile_ref).unwrap();
    assert_eq!(
        mesh.remove_tile(tile_ref).unwrap_err(),
        NavMeshError::InvalidPolyRef
    );
}

#[test]
fn serialization_preserves_query_behavior() {
    let mesh = common::flat_mesh();
    let mut query_a = query();
    let mut query_b = query();
    let filter = StandardFilter::default();

    let bytes = mesh.to_bytes();
    let restored = NavMesh::from_bytes(&bytes).unwrap();

    let start = Vec3::new(5.0, 0.0, 10.0);
    let end = Vec3::new(50.0, 0.0, 30.0);

    let run = |query: &mut NavMeshQuery, mesh: &NavMesh| {
        let (start_ref, start_pos) = query.find_nearest_poly(mesh, start, EXTENTS, &filter).unwrap();
        let (end_ref, end_pos) = query.find_nearest_poly(mesh, end, EXTENTS, &filter).unwrap();
        let path = query
            .find_path(mesh, start_ref, end_ref, start_pos, end_pos, &filter)
            .unwrap();
        let straight = query
            .find_straight_path(
                mesh,
                start_pos,
                end_pos,
                &path.polys,
                32,
                StraightPathOptions::empty(),
            )
            .unwrap();
        (path.polys.len(), straight.points.len())
    };

    assert_eq!(run(&mut query_a, &mesh), run(&mut query_b, &restored));
}

#[test]
fn straight_path_idempotence() {
    let mesh = common::flat_mesh();
    let mut query = query();
    let filter = StandardFilter::default();

    let start = Vec3::new(2.0, 0.0, 2.0);
    let end = Vec3::new(58.0, 0.0, 47.0);

    let (start_ref, start_pos) = query.find_nearest_poly(&mesh, start, EXTENTS, &filter).unwrap();
    let (end_ref, end_pos) = query.find_nearest_poly(&mesh, end, EXTENTS, &filter).unwrap();
    let path = query
        .find_path(&mesh, start_ref, end_ref, start_pos, end_pos, &filter)
        .unwrap();

    let first = query
        .find_straight_path(&mesh, start_pos, end_pos, &path.polys, 32, StraightPathOptions::empty())
        .unwrap();
    let second = query
        .find_straight_path(&mesh, start_pos, end_pos, &path.polys, 32, StraightPathOptions::empty())
        .unwrap();

    assert_eq!(first.points.len(), second.points.len());
    for (a, b) in first.points.iter().zip(second.points.iter()) {
        assert!(a.position.distance(b.position) < 1e-6);
        assert_eq!(a.flags, b.flags);
    }
}

#[test]
fn sliced_search_matches_immediate_search() {
    let mesh = common::flat_mesh();
    let mut query = query();
    let filter = StandardFilter::default();

    let start = Vec3::new(5.0, 0.0, 10.0);
    let end = Vec3::new(50.0, 0.0, 30.0);

    let (start_ref, start_pos) = query.find_nearest_poly(&mesh, start, EXTENTS, &filter).unwrap();
    let (end_ref, end_pos) = query.find_nearest_poly(&mesh, end, EXTENTS, &filter).unwrap();

    let immediate = query
        .find_path(&mesh, start_ref, end_ref, start_pos, end_pos, &filter)
        .unwrap();

    query
        .init_sliced_find_path(&mesh, start_ref, end_ref, start_pos, end_pos)
        .unwrap();
    // Starve the search so it takes several slices to finish.
    loop {
        let (state, _) = query.update_sliced_find_path(&mesh, &filter, 4);
        if state != cohort_navigation::query::SlicedState::InProgress {
            break;
        }
    }
    let sliced = query.finalize_sliced_find_path().unwrap();

    assert_eq!(immediate.polys, sliced.polys);
}
