//! Per-agent polygon corridor between the current position and the target.
//!
//! The corridor is the bridge between global pathfinding and local motion:
//! the head polygon always contains the agent, the tail holds the target
//! (or the best reachable polygon on partial paths), and every consecutive
//! pair is link-adjacent. Movement nibbles at the head; replanning splices
//! at either end.

use bevy::math::Vec3Swizzles;
use bevy::prelude::Vec3;

use crate::mesh::{NavMesh, PolyRef};
use crate::query::{
    NavMeshQuery, QueryFilter, RaycastOptions, SlicedState, StraightPath, StraightPathFlags,
    StraightPathOptions,
};

/// Hard cap on corridor length.
pub const MAX_CORRIDOR_POLYS: usize = 256;

/// Corners closer than this to the position are dropped during corner
/// extraction.
const MIN_TARGET_DIST: f32 = 0.01;

const OPT_TOPOLOGY_MAX_ITERS: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct PathCorridor {
    position: Vec3,
    target: Vec3,
    path: Vec<PolyRef>,
}

impl PathCorridor {
    pub fn new() -> Self {
        Self {
            position: Vec3::ZERO,
            target: Vec3::ZERO,
            path: Vec::with_capacity(MAX_CORRIDOR_POLYS),
        }
    }

    /// Collapses to a single-polygon corridor standing at `position`.
    pub fn reset(&mut self, reference: PolyRef, position: Vec3) {
        self.position = position;
        self.target = position;
        self.path.clear();
        self.path.push(reference);
    }

    #[inline]
    pub fn position(&self) -> Vec3 {
        self.position
    }

    #[inline]
    pub fn target(&self) -> Vec3 {
        self.target
    }

    #[inline]
    pub fn path(&self) -> &[PolyRef] {
        &self.path
    }

    #[inline]
    pub fn first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or(PolyRef::NONE)
    }

    #[inline]
    pub fn last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NONE)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.path.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    /// Replaces the whole corridor; `path` must start at the polygon
    /// containing the current position and end at the one holding `target`.
    pub fn set_corridor(&mut self, target: Vec3, path: &[PolyRef]) {
        self.target = target;
        self.path.clear();
        self.path.extend_from_slice(&path[..path.len().min(MAX_CORRIDOR_POLYS)]);
    }

    /// Steering corners toward the target: the straight path, minus leading
    /// corners within [MIN_TARGET_DIST], truncated after the first off-mesh
    /// connection corner.
    pub fn find_corners(
        &self,
        max_corners: usize,
        query: &NavMeshQuery,
        mesh: &NavMesh,
    ) -> StraightPath {
        let Ok(mut straight) = query.find_straight_path(
            mesh,
            self.position,
            self.target,
            &self.path,
            max_corners,
            StraightPathOptions::empty(),
        ) else {
            return StraightPath::default();
        };

        let keep_from = straight
            .points
            .iter()
            .position(|point| {
                point.flags.contains(StraightPathFlags::OFF_MESH_CONNECTION)
                    || point.position.xz().distance_squared(self.position.xz())
                        > MIN_TARGET_DIST * MIN_TARGET_DIST
            })
            .unwrap_or(straight.points.len());
        straight.points.drain(..keep_from);

        if let Some(cut) = straight
            .points
            .iter()
            .position(|point| point.flags.contains(StraightPathFlags::OFF_MESH_CONNECTION))
        {
            straight.points.truncate(cut + 1);
        }

        straight
    }

    /// Shortcuts the corridor head by ray-casting toward `next`, clamped to
    /// `range`. Applied only when the ray covers at least 99% of the
    /// distance, so the corridor never detaches from the surface.
    pub fn optimize_path_visibility(
        &mut self,
        next: Vec3,
        range: f32,
        query: &mut NavMeshQuery,
        mesh: &NavMesh,
        filter: &impl QueryFilter,
    ) {
        let distance = self.position.xz().distance(next.xz());
        if distance < 0.01 {
            return;
        }
        let distance = (distance + 0.01).min(range);

        let goal = self.position + (next - self.position) * (range / distance);

        let Ok(hit) = query.raycast(
            mesh,
            self.first_poly(),
            self.position,
            goal,
            filter,
            RaycastOptions::empty(),
        ) else {
            return;
        };

        if hit.path.len() > 1 && hit.t > 0.99 {
            merge_corridor_start_shortcut(&mut self.path, &hit.path);
        }
    }

    /// Partial replan over the existing corridor with a bounded sliced
    /// search; straightens paths that became baggy as the agent moved.
    pub fn optimize_path_topology(
        &mut self,
        query: &mut NavMeshQuery,
        mesh: &NavMesh,
        filter: &impl QueryFilter,
    ) -> bool {
        if self.path.len() < 3 {
            return false;
        }

        if query
            .init_sliced_find_path(mesh, self.first_poly(), self.last_poly(), self.position, self.target)
            .is_err()
        {
            return false;
        }
        let (state, _) = query.update_sliced_find_path(mesh, filter, OPT_TOPOLOGY_MAX_ITERS);
        if state != SlicedState::Succeeded {
            let _ = query.finalize_sliced_find_path();
            return false;
        }

        match query.finalize_sliced_find_path_partial(&self.path) {
            Ok(result) if !result.polys.is_empty() => {
                merge_corridor_start_shortcut(&mut self.path, &result.polys);
                true
            }
            _ => false,
        }
    }

    /// Advances the corridor past the off-mesh connection polygon
    /// `connection_ref`, returning `(entry_ref, start, end)` of the jump.
    /// The corridor position lands on the far endpoint.
    pub fn move_over_off_mesh_connection(
        &mut self,
        connection_ref: PolyRef,
        mesh: &NavMesh,
    ) -> Option<(PolyRef, Vec3, Vec3)> {
        // Advance up to and over the connection: both the polygons leading
        // to it and the connection itself are consumed.
        let connection_index = self
            .path
            .iter()
            .position(|&reference| reference == connection_ref)?;
        let previous_ref = if connection_index > 0 {
            self.path[connection_index - 1]
        } else {
            PolyRef::NONE
        };

        self.path.drain(..=connection_index);

        let (start, end) = mesh
            .off_mesh_connection_end_points(previous_ref, connection_ref)
            .ok()?;

        self.position = end;

        Some((previous_ref, start, end))
    }

    /// Moves the corridor position along the surface, merging the visited
    /// polygons into the head.
    pub fn move_position(
        &mut self,
        new_position: Vec3,
        query: &mut NavMeshQuery,
        mesh: &NavMesh,
        filter: &impl QueryFilter,
    ) -> bool {
        let Ok((result, visited)) =
            query.move_along_surface(mesh, self.first_poly(), self.position, new_position, filter)
        else {
            return false;
        };

        merge_corridor_start_moved(&mut self.path, &visited);

        // Stay on top of the surface.
        let mut result = result;
        if let Ok(height) = query.poly_height(mesh, self.first_poly(), result) {
            result.y = height;
        }
        self.position = result;

        true
    }

    /// Analog of [Self::move_position] for the target end.
    pub fn move_target_position(
        &mut self,
        new_target: Vec3,
        query: &mut NavMeshQuery,
        mesh: &NavMesh,
        filter: &impl QueryFilter,
    ) -> bool {
        let Ok((result, visited)) =
            query.move_along_surface(mesh, self.last_poly(), self.target, new_target, filter)
        else {
            return false;
        };

        merge_corridor_end_moved(&mut self.path, &visited);
        self.target = result;

        true
    }

    /// Puts the corridor back onto a known-safe polygon after the start
    /// became invalid. A placeholder survives until the next replan.
    pub fn fix_path_start(&mut self, safe_ref: PolyRef, safe_position: Vec3) {
        self.position = safe_position;

        if self.path.len() < 3 {
            let last = self.last_poly();
            self.path.clear();
            self.path.extend([safe_ref, PolyRef::NONE, last]);
        } else {
            self.path[0] = safe_ref;
            self.path[1] = PolyRef::NONE;
        }
    }

    /// Truncates the corridor at the first invalid polygon; falls back to a
    /// one-polygon corridor at the safe position when even the head is gone.
    pub fn trim_invalid_path(
        &mut self,
        safe_ref: PolyRef,
        safe_position: Vec3,
        query: &mut NavMeshQuery,
        mesh: &NavMesh,
        filter: &impl QueryFilter,
    ) {
        let valid_count = self
            .path
            .iter()
            .take_while(|&&reference| query.is_valid_poly_ref(mesh, reference, filter))
            .count();

        if valid_count == 0 {
            self.position = safe_position;
            self.path.clear();
            self.path.push(safe_ref);
        } else if valid_count < self.path.len() {
            self.path.truncate(valid_count);
        }

        if let Ok(clamped) = query.closest_point_on_poly_boundary(mesh, self.last_poly(), self.target)
        {
            self.target = clamped;
        }
    }

    /// Whether the next `max_look_ahead` polygons still resolve & pass the
    /// filter.
    pub fn is_valid(
        &self,
        max_look_ahead: usize,
        query: &NavMeshQuery,
        mesh: &NavMesh,
        filter: &impl QueryFilter,
    ) -> bool {
        if self.path.is_empty() {
            return false;
        }

        self.path
            .iter()
            .take(max_look_ahead)
            .all(|&reference| query.is_valid_poly_ref(mesh, reference, filter))
    }
}

/// Removes immediate A-B-A traceback patterns left behind by merges.
fn compact_trackbacks(path: &mut Vec<PolyRef>) {
    let mut i = 0;
    while i + 2 < path.len() {
        if path[i] == path[i + 2] {
            path.drain(i..i + 2);
        } else {
            i += 1;
        }
    }
}

/// The agent moved: prepend the freshly visited polygons (reversed) onto
/// the corridor, joined at the furthest-back common polygon.
pub(crate) fn merge_corridor_start_moved(path: &mut Vec<PolyRef>, visited: &[PolyRef]) {
    let mut furthest_path = None;
    let mut furthest_visited = None;

    // Furthest common polygon.
    'outer: for (i, &path_ref) in path.iter().enumerate().rev() {
        for (j, &visited_ref) in visited.iter().enumerate().rev() {
            if path_ref == visited_ref {
                furthest_path = Some(i);
                furthest_visited = Some(j);
                break 'outer;
            }
        }
    }

    let (Some(furthest_path), Some(furthest_visited)) = (furthest_path, furthest_visited) else {
        return;
    };

    // Visited tail (beyond the common polygon), reversed, becomes the new
    // corridor head.
    let head: Vec<PolyRef> = visited[furthest_visited..].iter().rev().copied().collect();

    let mut merged = head;
    merged.extend_from_slice(&path[(furthest_path + 1).min(path.len())..]);
    merged.truncate(MAX_CORRIDOR_POLYS);
    compact_trackbacks(&mut merged);

    *path = merged;
}

/// The target moved: append the visited suffix past the furthest-forward
/// common polygon.
pub(crate) fn merge_corridor_end_moved(path: &mut Vec<PolyRef>, visited: &[PolyRef]) {
    let mut nearest = None;

    'outer: for (i, &path_ref) in path.iter().enumerate() {
        for (j, &visited_ref) in visited.iter().enumerate() {
            if path_ref == visited_ref {
                nearest = Some((i, j));
                break 'outer;
            }
        }
    }

    let Some((path_index, visited_index)) = nearest else {
        return;
    };

    path.truncate(path_index + 1);
    path.extend_from_slice(&visited[visited_index + 1..]);
    path.truncate(MAX_CORRIDOR_POLYS);
    compact_trackbacks(path);
}

/// A raycast (or partial replan) shortcut: the shortcut polygons, in
/// forward order, replace the corridor head up to the furthest common
/// polygon.
pub(crate) fn merge_corridor_start_shortcut(path: &mut Vec<PolyRef>, shortcut: &[PolyRef]) {
    let mut furthest_path = None;
    let mut furthest_visited = None;

    'outer: for (i, &path_ref) in path.iter().enumerate().rev() {
        for (j, &shortcut_ref) in shortcut.iter().enumerate().rev() {
            if path_ref == shortcut_ref {
                furthest_path = Some(i);
                furthest_visited = Some(j);
                break 'outer;
            }
        }
    }

    let (Some(furthest_path), Some(furthest_visited)) = (furthest_path, furthest_visited) else {
        return;
    };
    if furthest_visited == 0 {
        return;
    }

    let mut merged: Vec<PolyRef> = shortcut[..furthest_visited].to_vec();
    merged.extend_from_slice(&path[furthest_path..]);
    merged.truncate(MAX_CORRIDOR_POLYS);
    compact_trackbacks(&mut merged);

    *path = merged;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(ids: &[u32]) -> Vec<PolyRef> {
        ids.iter().map(|&id| PolyRef(id)).collect()
    }

    #[test]
    fn start_moved_prepends_reversed_visited() {
        let mut path = refs(&[10, 20, 30, 40]);
        // The agent wandered 10 -> 11 -> 12.
        merge_corridor_start_moved(&mut path, &refs(&[10, 11, 12]));

        assert_eq!(path, refs(&[12, 11, 10, 20, 30, 40]));
    }

    #[test]
    fn end_moved_appends_visited_suffix() {
        let mut path = refs(&[10, 20, 30]);
        merge_corridor_end_moved(&mut path, &refs(&[30, 31, 32]));

        assert_eq!(path, refs(&[10, 20, 30, 31, 32]));
    }

    #[test]
    fn shortcut_replaces_the_head() {
        let mut path = refs(&[10, 20, 30, 40, 50]);
        // Raycast went straight from 10 to 40.
        merge_corridor_start_shortcut(&mut path, &refs(&[10, 40]));

        assert_eq!(path, refs(&[10, 40, 50]));
    }

    #[test]
    fn merge_without_common_polygon_is_a_no_op() {
        let mut path = refs(&[10, 20]);
        merge_corridor_start_moved(&mut path, &refs(&[77, 78]));

        assert_eq!(path, refs(&[10, 20]));
    }

    #[test]
    fn trackbacks_are_compacted() {
        let mut path = refs(&[10, 20, 10, 30]);
        compact_trackbacks(&mut path);

        assert_eq!(path, refs(&[10, 30]));
    }

    #[test]
    fn reset_collapses_to_one_polygon() {
        let mut corridor = PathCorridor::new();
        corridor.set_corridor(Vec3::new(5.0, 0.0, 5.0), &refs(&[1, 2, 3]));
        corridor.reset(PolyRef(9), Vec3::ONE);

        assert_eq!(corridor.path(), &refs(&[9])[..]);
        assert_eq!(corridor.target(), Vec3::ONE);
    }
}
