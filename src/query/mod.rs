//! The nav-mesh query engine.
//!
//! One [NavMeshQuery] owns the node pool, open list & sliced-search state;
//! the mesh itself is borrowed read-only per call. Keep separate query
//! instances for interleaved searches (the crowd keeps its own, and each
//! path queue another), otherwise an in-flight sliced search would be
//! trampled.

use bevy::prelude::Vec3;
use bitflags::bitflags;
use smallvec::SmallVec;
use thiserror::Error;

use crate::math::{
    distance_point_to_segment_2d, intersect_segment_poly_2d, intersect_segment_segment_2d,
    overlap_poly_poly_2d, point_in_polygon_2d, triangle_area_2d,
};
use crate::mesh::{NavMesh, PolyRef, PolyType, VERTICES_PER_POLYGON};

mod filter;
mod node;

pub use filter::{QueryFilter, StandardFilter};
use node::{NodeFlags, NodeIndex, NodePool, NodeQueue};

/// Slight under-weighting keeps the heuristic admissible against
/// floating-point noise.
const HEURISTIC_SCALE: f32 = 0.999;

bitflags! {
    /// Non-fatal detail attached to otherwise successful query results.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PathFlags: u8 {
        /// The target was unreachable; the path leads to the closest
        /// polygon found instead.
        const PARTIAL = 0x01;
        /// The node pool ran dry; the result is the best lead so far.
        const OUT_OF_NODES = 0x02;
        /// The output buffer filled before the result was complete.
        const BUFFER_TOO_SMALL = 0x04;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StraightPathFlags: u8 {
        const START = 0x01;
        const END = 0x02;
        const OFF_MESH_CONNECTION = 0x04;
    }
}

bitflags! {
    /// Extra waypoint emission for [NavMeshQuery::find_straight_path].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StraightPathOptions: u8 {
        /// Emit a waypoint at every area-code change.
        const AREA_CROSSINGS = 0x01;
        /// Emit a waypoint at every portal.
        const ALL_CROSSINGS = 0x02;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RaycastOptions: u8 {
        /// Accumulate filter costs along the traversed polygons.
        const USE_COSTS = 0x01;
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueryError {
    #[error("invalid parameter")]
    InvalidParam,
    #[error("polygon reference is stale or malformed")]
    InvalidPolyRef,
    #[error("no sliced search in the required state")]
    BadSlicedState,
}

/// A polygon corridor produced by pathfinding.
#[derive(Debug, Clone, Default)]
pub struct PolyPath {
    pub polys: Vec<PolyRef>,
    pub flags: PathFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct StraightPathPoint {
    pub position: Vec3,
    pub flags: StraightPathFlags,
    /// Polygon being entered at this point; [PolyRef::NONE] at the end.
    pub reference: PolyRef,
}

/// Waypoint sequence from [NavMeshQuery::find_straight_path].
#[derive(Debug, Clone, Default)]
pub struct StraightPath {
    pub points: Vec<StraightPathPoint>,
    pub flags: PathFlags,
}

/// Result of [NavMeshQuery::raycast]. `t == f32::MAX` means the end was
/// reached without hitting a wall.
#[derive(Debug, Clone, Default)]
pub struct RaycastHit {
    pub t: f32,
    pub normal: Vec3,
    pub hit_edge_index: usize,
    pub path: Vec<PolyRef>,
    pub path_cost: f32,
    pub flags: PathFlags,
}

impl RaycastHit {
    #[inline]
    pub fn reached_end(&self) -> bool {
        self.t == f32::MAX
    }
}

/// State of the incremental path search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlicedState {
    #[default]
    Idle,
    InProgress,
    Succeeded,
    Failed,
}

struct SlicedQuery {
    state: SlicedState,
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: Vec3,
    end_pos: Vec3,
    last_best: Option<NodeIndex>,
    last_best_cost: f32,
    out_of_nodes: bool,
}

impl Default for SlicedQuery {
    fn default() -> Self {
        Self {
            state: SlicedState::Idle,
            start_ref: PolyRef::NONE,
            end_ref: PolyRef::NONE,
            start_pos: Vec3::ZERO,
            end_pos: Vec3::ZERO,
            last_best: None,
            last_best_cost: f32::MAX,
            out_of_nodes: false,
        }
    }
}

/// Wall or portal segment of a polygon.
#[derive(Debug, Clone, Copy)]
pub struct WallSegment {
    pub start: Vec3,
    pub end: Vec3,
    /// Polygon on the far side, [PolyRef::NONE] for a solid wall.
    pub neighbour: PolyRef,
}

const MAX_LOCAL_STACK: usize = 48;
const MAX_LOCAL_NEIGHBOURS: usize = 8;
const TINY_NODE_POOL_SIZE: usize = 64;

pub struct NavMeshQuery {
    node_pool: NodePool,
    tiny_node_pool: NodePool,
    open_list: NodeQueue,
    sliced: SlicedQuery,
}

impl NavMeshQuery {
    pub fn new(max_nodes: usize) -> Result<Self, QueryError> {
        if max_nodes == 0 {
            return Err(QueryError::InvalidParam);
        }

        Ok(Self {
            node_pool: NodePool::new(max_nodes),
            tiny_node_pool: NodePool::new(TINY_NODE_POOL_SIZE),
            open_list: NodeQueue::new(),
            sliced: SlicedQuery::default(),
        })
    }

    // --- Point & polygon queries -----------------------------------------

    /// Nearest polygon to `center` within the AABB spanned by `extents`.
    ///
    /// Returns [PolyRef::NONE] with the unchanged center when nothing
    /// intersects the search box.
    pub fn find_nearest_poly(
        &self,
        mesh: &NavMesh,
        center: Vec3,
        extents: Vec3,
        filter: &impl QueryFilter,
    ) -> Result<(PolyRef, Vec3), QueryError> {
        if !center.is_finite() || !extents.is_finite() || extents.min_element() < 0.0 {
            return Err(QueryError::InvalidParam);
        }

        let query_min = center - extents;
        let query_max = center + extents;

        let (min_tile_x, min_tile_y) = mesh.calc_tile_loc(query_min);
        let (max_tile_x, max_tile_y) = mesh.calc_tile_loc(query_max);

        let mut nearest = (PolyRef::NONE, center);
        let mut nearest_distance = f32::MAX;

        let mut candidates = Vec::with_capacity(32);
        for y in min_tile_y..=max_tile_y {
            for x in min_tile_x..=max_tile_x {
                for &slot in mesh.tiles_at(x, y).iter() {
                    candidates.clear();
                    mesh.query_polygons_in_tile(slot, query_min, query_max, &mut candidates);

                    for &reference in candidates.iter() {
                        let (tile, poly) = mesh.tile_and_poly_unchecked(reference);
                        if !filter.passes(tile, poly) {
                            continue;
                        }

                        let (closest, pos_over_poly) = mesh.closest_point_on_poly(reference, center);

                        // Favor polygons directly underfoot: above the
                        // surface only the climb-adjusted vertical gap
                        // counts.
                        let difference = center - closest;
                        let distance = if pos_over_poly {
                            let d = difference.y.abs() - tile.data.walkable_climb;
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
                            nearest = (reference, closest);
                        }
                    }
                }
            }
        }

        Ok(nearest)
    }

    /// See [NavMesh::closest_point_on_poly]; validates the reference first.
    pub fn closest_point_on_poly(
        &self,
        mesh: &NavMesh,
        reference: PolyRef,
        position: Vec3,
    ) -> Result<(Vec3, bool), QueryError> {
        if !mesh.is_valid_poly_ref(reference) {
            return Err(QueryError::InvalidPolyRef);
        }
        if !position.is_finite() {
            return Err(QueryError::InvalidParam);
        }

        Ok(mesh.closest_point_on_poly(reference, position))
    }

    /// Clamp onto the polygon's 2D boundary, ignoring the detail surface.
    /// Cheaper than [Self::closest_point_on_poly] and usable with an
    /// imprecise `position`.
    pub fn closest_point_on_poly_boundary(
        &self,
        mesh: &NavMesh,
        reference: PolyRef,
        position: Vec3,
    ) -> Result<Vec3, QueryError> {
        let (tile, poly) = mesh
            .tile_and_poly_by_ref(reference)
            .map_err(|_| QueryError::InvalidPolyRef)?;

        if poly.poly_type() == PolyType::OffMeshConnection {
            let a = tile.data.vertices[poly.vertices[0] as usize];
            let b = tile.data.vertices[poly.vertices[1] as usize];
            let (_, t) = distance_point_to_segment_2d(position, a, b);
            return Ok(a.lerp(b, t));
        }

        let mut vertices = [Vec3::ZERO; VERTICES_PER_POLYGON];
        let vertex_count = tile.polygon_vertices(poly, &mut vertices);

        let mut edge_distances = [0.0f32; VERTICES_PER_POLYGON];
        let mut edge_factors = [0.0f32; VERTICES_PER_POLYGON];
        let inside = crate::math::distance_point_to_polygon_edges_2d(
            position,
            &vertices[..vertex_count],
            &mut edge_distances[..vertex_count],
            &mut edge_factors[..vertex_count],
        );

        if inside {
            return Ok(position);
        }

        let mut best_edge = 0;
        for edge in 1..vertex_count {
            if edge_distances[edge] < edge_distances[best_edge] {
                best_edge = edge;
            }
        }

        let a = vertices[best_edge];
        let b = vertices[(best_edge + 1) % vertex_count];
        Ok(a.lerp(b, edge_factors[best_edge]))
    }

    /// Height of the detail surface under `position`.
    pub fn poly_height(
        &self,
        mesh: &NavMesh,
        reference: PolyRef,
        position: Vec3,
    ) -> Result<f32, QueryError> {
        if !mesh.is_valid_poly_ref(reference) {
            return Err(QueryError::InvalidPolyRef);
        }

        mesh.poly_height(reference, position)
            .ok_or(QueryError::InvalidParam)
    }

    /// Whether `reference` resolves and passes `filter`.
    pub fn is_valid_poly_ref(
        &self,
        mesh: &NavMesh,
        reference: PolyRef,
        filter: &impl QueryFilter,
    ) -> bool {
        match mesh.tile_and_poly_by_ref(reference) {
            Ok((tile, poly)) => filter.passes(tile, poly),
            Err(_) => false,
        }
    }

    // --- A* ----------------------------------------------------------------

    /// A* over the polygon graph from `start_ref` to `end_ref`.
    ///
    /// When the goal is unreachable the returned path leads to the closest
    /// polygon discovered and carries [PathFlags::PARTIAL].
    pub fn find_path(
        &mut self,
        mesh: &NavMesh,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &impl QueryFilter,
    ) -> Result<PolyPath, QueryError> {
        if !mesh.is_valid_poly_ref(start_ref) || !mesh.is_valid_poly_ref(end_ref) {
            return Err(QueryError::InvalidPolyRef);
        }
        if !start_pos.is_finite() || !end_pos.is_finite() {
            return Err(QueryError::InvalidParam);
        }

        if start_ref == end_ref {
            return Ok(PolyPath {
                polys: vec![start_ref],
                flags: PathFlags::empty(),
            });
        }

        self.node_pool.clear();
        self.open_list.clear();

        let start_index = self
            .node_pool
            .get_or_create(start_ref, 0)
            .expect("empty pool always has room for the start node");
        {
            let start_node = self.node_pool.get_mut(start_index);
            start_node.position = start_pos;
            start_node.cost = 0.0;
            start_node.total = start_pos.distance(end_pos) * HEURISTIC_SCALE;
            start_node.flags = NodeFlags::OPEN;
        }
        self.open_list
            .push(self.node_pool.get(start_index).total, start_index);

        let mut last_best = start_index;
        let mut last_best_cost = self.node_pool.get(start_index).total;
        let mut out_of_nodes = false;

        while let Some(best_index) = self.open_list.pop() {
            {
                let node = self.node_pool.get_mut(best_index);
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
            }

            let best_ref = self.node_pool.get(best_index).reference;
            if best_ref == end_ref {
                last_best = best_index;
                break;
            }

            out_of_nodes |= self.expand_node(
                mesh,
                best_index,
                end_ref,
                end_pos,
                filter,
                &mut last_best,
                &mut last_best_cost,
            );
        }

        let mut flags = PathFlags::empty();
        if self.node_pool.get(last_best).reference != end_ref {
            flags |= PathFlags::PARTIAL;
        }
        if out_of_nodes {
            flags |= PathFlags::OUT_OF_NODES;
        }

        Ok(PolyPath {
            polys: self.path_to_node(last_best),
            flags,
        })
    }

    /// Expands one closed node; shared between the immediate & sliced
    /// searches. Returns whether the pool ran dry.
    #[allow(clippy::too_many_arguments)]
    fn expand_node(
        &mut self,
        mesh: &NavMesh,
        best_index: NodeIndex,
        end_ref: PolyRef,
        end_pos: Vec3,
        filter: &impl QueryFilter,
        last_best: &mut NodeIndex,
        last_best_cost: &mut f32,
    ) -> bool {
        let best_ref = self.node_pool.get(best_index).reference;
        let best_position = self.node_pool.get(best_index).position;
        let best_cost = self.node_pool.get(best_index).cost;
        let parent_index = self.node_pool.get(best_index).parent;
        let parent_ref =
            parent_index.map_or(PolyRef::NONE, |p| self.node_pool.get(p).reference);

        let mut out_of_nodes = false;

        let (best_tile, best_poly) = mesh.tile_and_poly_unchecked(best_ref);

        // Collect first: expansion needs &mut self for the pool.
        let links: SmallVec<[(PolyRef, u8); 8]> = best_tile
            .links_of(best_poly)
            .map(|link| {
                let cross_side = if link.side != 0xff { link.side >> 1 } else { 0 };
                (link.target, cross_side)
            })
            .collect();

        for (neighbour_ref, cross_side) in links {
            // Never flow back into the parent.
            if neighbour_ref.is_none() || neighbour_ref == parent_ref {
                continue;
            }

            let (neighbour_tile, neighbour_poly) = match mesh.tile_and_poly_by_ref(neighbour_ref) {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            if !filter.passes(neighbour_tile, neighbour_poly) {
                continue;
            }

            let Some(neighbour_index) = self.node_pool.get_or_create(neighbour_ref, cross_side)
            else {
                out_of_nodes = true;
                continue;
            };

            // First visit: place the node at the entry edge midpoint.
            if self.node_pool.get(neighbour_index).flags.is_empty() {
                if let Ok((left, right)) = self.portal_points(mesh, best_ref, neighbour_ref) {
                    self.node_pool.get_mut(neighbour_index).position = left.lerp(right, 0.5);
                }
            }

            let neighbour_position = self.node_pool.get(neighbour_index).position;

            let (best_tile, best_poly) = mesh.tile_and_poly_unchecked(best_ref);
            let (neighbour_tile, neighbour_poly) = mesh.tile_and_poly_unchecked(neighbour_ref);
            let parent = (!parent_ref.is_none()).then(|| mesh.tile_and_poly_unchecked(parent_ref));

            let (cost, heuristic) = if neighbour_ref == end_ref {
                // Terminal segment runs to the actual goal point.
                let current_cost = filter.cost(
                    best_position,
                    neighbour_position,
                    parent,
                    (best_tile, best_poly),
                    Some((neighbour_tile, neighbour_poly)),
                );
                let end_cost = filter.cost(
                    neighbour_position,
                    end_pos,
                    Some((best_tile, best_poly)),
                    (neighbour_tile, neighbour_poly),
                    None,
                );

                (best_cost + current_cost + end_cost, 0.0)
            } else {
                let current_cost = filter.cost(
                    best_position,
                    neighbour_position,
                    parent,
                    (best_tile, best_poly),
                    Some((neighbour_tile, neighbour_poly)),
                );

                (
                    best_cost + current_cost,
                    neighbour_position.distance(end_pos) * HEURISTIC_SCALE,
                )
            };
            let total = cost + heuristic;

            let node = self.node_pool.get(neighbour_index);
            if node.flags.intersects(NodeFlags::OPEN | NodeFlags::CLOSED) && total >= node.total {
                continue;
            }

            let was_open = node.flags.contains(NodeFlags::OPEN);
            {
                let node = self.node_pool.get_mut(neighbour_index);
                node.parent = Some(best_index);
                node.flags.remove(NodeFlags::CLOSED);
                node.flags.insert(NodeFlags::OPEN);
                node.cost = cost;
                node.total = total;
            }

            if was_open {
                self.open_list.modify(neighbour_index, total);
            } else {
                self.open_list.push(total, neighbour_index);
            }

            if heuristic < *last_best_cost {
                *last_best_cost = heuristic;
                *last_best = neighbour_index;
            }
        }

        out_of_nodes
    }

    fn path_to_node(&self, node: NodeIndex) -> Vec<PolyRef> {
        let mut length = 0;
        let mut cursor = Some(node);
        while let Some(index) = cursor {
            length += 1;
            cursor = self.node_pool.get(index).parent;
        }

        let mut path = vec![PolyRef::NONE; length];
        let mut cursor = Some(node);
        for slot in path.iter_mut().rev() {
            let index = cursor.expect("chain length was just measured");
            *slot = self.node_pool.get(index).reference;
            cursor = self.node_pool.get(index).parent;
        }

        path
    }

    // --- Sliced A* ---------------------------------------------------------

    /// Starts an incremental search. Any previous sliced search is
    /// discarded.
    pub fn init_sliced_find_path(
        &mut self,
        mesh: &NavMesh,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
    ) -> Result<SlicedState, QueryError> {
        self.sliced = SlicedQuery::default();

        if !mesh.is_valid_poly_ref(start_ref) || !mesh.is_valid_poly_ref(end_ref) {
            self.sliced.state = SlicedState::Failed;
            return Err(QueryError::InvalidPolyRef);
        }

        self.sliced.start_ref = start_ref;
        self.sliced.end_ref = end_ref;
        self.sliced.start_pos = start_pos;
        self.sliced.end_pos = end_pos;

        if start_ref == end_ref {
            self.sliced.state = SlicedState::Succeeded;
            return Ok(self.sliced.state);
        }

        self.node_pool.clear();
        self.open_list.clear();

        let start_index = self
            .node_pool
            .get_or_create(start_ref, 0)
            .expect("empty pool always has room for the start node");
        {
            let start_node = self.node_pool.get_mut(start_index);
            start_node.position = start_pos;
            start_node.total = start_pos.distance(end_pos) * HEURISTIC_SCALE;
            start_node.flags = NodeFlags::OPEN;
        }
        self.open_list
            .push(self.node_pool.get(start_index).total, start_index);

        self.sliced.state = SlicedState::InProgress;
        self.sliced.last_best = Some(start_index);
        self.sliced.last_best_cost = self.node_pool.get(start_index).total;

        Ok(self.sliced.state)
    }

    /// Runs up to `max_iters` node expansions. Returns the new state and
    /// the iterations actually consumed.
    ///
    /// `filter` must be the filter the search was initialized for.
    pub fn update_sliced_find_path(
        &mut self,
        mesh: &NavMesh,
        filter: &impl QueryFilter,
        max_iters: usize,
    ) -> (SlicedState, usize) {
        if self.sliced.state != SlicedState::InProgress {
            return (self.sliced.state, 0);
        }

        // The mesh may have changed since the last slice.
        if !mesh.is_valid_poly_ref(self.sliced.start_ref)
            || !mesh.is_valid_poly_ref(self.sliced.end_ref)
        {
            self.sliced.state = SlicedState::Failed;
            return (self.sliced.state, 0);
        }

        let mut iterations = 0;
        while iterations < max_iters {
            let Some(best_index) = self.open_list.pop() else {
                // Exhausted the reachable set.
                self.sliced.state = SlicedState::Succeeded;
                return (self.sliced.state, iterations);
            };
            iterations += 1;

            {
                let node = self.node_pool.get_mut(best_index);
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
            }

            if self.node_pool.get(best_index).reference == self.sliced.end_ref {
                self.sliced.last_best = Some(best_index);
                self.sliced.state = SlicedState::Succeeded;
                return (self.sliced.state, iterations);
            }

            let end_ref = self.sliced.end_ref;
            let end_pos = self.sliced.end_pos;
            let mut last_best = self.sliced.last_best.unwrap_or(best_index);
            let mut last_best_cost = self.sliced.last_best_cost;

            let out_of_nodes = self.expand_node(
                mesh,
                best_index,
                end_ref,
                end_pos,
                filter,
                &mut last_best,
                &mut last_best_cost,
            );

            self.sliced.out_of_nodes |= out_of_nodes;
            self.sliced.last_best = Some(last_best);
            self.sliced.last_best_cost = last_best_cost;
        }

        (self.sliced.state, iterations)
    }

    /// Reconstructs the path from the best node reached & resets the
    /// sliced state.
    pub fn finalize_sliced_find_path(&mut self) -> Result<PolyPath, QueryError> {
        let result = match self.sliced.state {
            SlicedState::Idle | SlicedState::InProgress => Err(QueryError::BadSlicedState),
            SlicedState::Failed => Err(QueryError::InvalidPolyRef),
            SlicedState::Succeeded => {
                if self.sliced.start_ref == self.sliced.end_ref {
                    Ok(PolyPath {
                        polys: vec![self.sliced.start_ref],
                        flags: PathFlags::empty(),
                    })
                } else {
                    let last_best = self
                        .sliced
                        .last_best
                        .ok_or(QueryError::BadSlicedState)?;

                    let mut flags = PathFlags::empty();
                    if self.node_pool.get(last_best).reference != self.sliced.end_ref {
                        flags |= PathFlags::PARTIAL;
                    }
                    if self.sliced.out_of_nodes {
                        flags |= PathFlags::OUT_OF_NODES;
                    }

                    Ok(PolyPath {
                        polys: self.path_to_node(last_best),
                        flags,
                    })
                }
            }
        };

        self.sliced = SlicedQuery::default();
        result
    }

    /// Like [Self::finalize_sliced_find_path], but reuses `existing` where
    /// it overlaps the search tree, for replanning continuity: the result
    /// follows the furthest-along existing polygon that was visited.
    pub fn finalize_sliced_find_path_partial(
        &mut self,
        existing: &[PolyRef],
    ) -> Result<PolyPath, QueryError> {
        if existing.is_empty() {
            self.sliced = SlicedQuery::default();
            return Err(QueryError::InvalidParam);
        }

        let result = match self.sliced.state {
            SlicedState::Idle | SlicedState::InProgress => Err(QueryError::BadSlicedState),
            SlicedState::Failed => Err(QueryError::InvalidPolyRef),
            SlicedState::Succeeded => {
                if self.sliced.start_ref == self.sliced.end_ref {
                    Ok(PolyPath {
                        polys: vec![self.sliced.start_ref],
                        flags: PathFlags::empty(),
                    })
                } else {
                    let mut flags = PathFlags::empty();
                    let node = existing
                        .iter()
                        .rev()
                        .find_map(|&reference| self.node_pool.find_any(reference))
                        .or_else(|| {
                            flags |= PathFlags::PARTIAL;
                            self.sliced.last_best
                        })
                        .ok_or(QueryError::BadSlicedState)?;

                    if self.sliced.out_of_nodes {
                        flags |= PathFlags::OUT_OF_NODES;
                    }

                    Ok(PolyPath {
                        polys: self.path_to_node(node),
                        flags,
                    })
                }
            }
        };

        self.sliced = SlicedQuery::default();
        result
    }

    // --- Straight path -----------------------------------------------------

    /// Portal between two link-adjacent polygons: the left & right end of
    /// the shared edge, seen walking `from -> to`.
    pub fn portal_points(
        &self,
        mesh: &NavMesh,
        from: PolyRef,
        to: PolyRef,
    ) -> Result<(Vec3, Vec3), QueryError> {
        let (from_tile, from_poly) = mesh
            .tile_and_poly_by_ref(from)
            .map_err(|_| QueryError::InvalidPolyRef)?;
        let (to_tile, to_poly) = mesh
            .tile_and_poly_by_ref(to)
            .map_err(|_| QueryError::InvalidPolyRef)?;

        let link = from_tile
            .links_of(from_poly)
            .find(|link| link.target == to)
            .ok_or(QueryError::InvalidPolyRef)?;

        // Off-mesh connections collapse the portal onto an endpoint.
        if from_poly.poly_type() == PolyType::OffMeshConnection {
            let v = from_tile.data.vertices[from_poly.vertices[link.edge as usize] as usize];
            return Ok((v, v));
        }
        if to_poly.poly_type() == PolyType::OffMeshConnection {
            let back = to_tile
                .links_of(to_poly)
                .find(|link| link.target == from)
                .ok_or(QueryError::InvalidPolyRef)?;
            let v = to_tile.data.vertices[to_poly.vertices[back.edge as usize] as usize];
            return Ok((v, v));
        }

        let edge = link.edge as usize;
        let vertex_count = from_poly.vertex_count as usize;
        let mut left = from_tile.data.vertices[from_poly.vertices[edge] as usize];
        let mut right = from_tile.data.vertices
            [from_poly.vertices[(edge + 1) % vertex_count] as usize];

        // Cross-tile links may cover a sub-range of the edge.
        if link.side != 0xff && (link.bmin != 0 || link.bmax != 255) {
            const S: f32 = 1.0 / 255.0;
            let a = left;
            let b = right;
            left = a.lerp(b, link.bmin as f32 * S);
            right = a.lerp(b, link.bmax as f32 * S);
        }

        Ok((left, right))
    }

    /// Straight-path extraction over a polygon corridor via the funnel
    /// algorithm.
    ///
    /// `max_points` bounds the output; overflow sets
    /// [PathFlags::BUFFER_TOO_SMALL] and keeps the partial result.
    pub fn find_straight_path(
        &self,
        mesh: &NavMesh,
        start_pos: Vec3,
        end_pos: Vec3,
        path: &[PolyRef],
        max_points: usize,
        options: StraightPathOptions,
    ) -> Result<StraightPath, QueryError> {
        if path.is_empty() || max_points == 0 {
            return Err(QueryError::InvalidParam);
        }

        let closest_start = self.closest_point_on_poly_boundary(mesh, path[0], start_pos)?;
        let mut closest_end =
            self.closest_point_on_poly_boundary(mesh, path[path.len() - 1], end_pos)?;

        let mut out = StraightPath::default();
        append_vertex(
            &mut out,
            closest_start,
            StraightPathFlags::START,
            path[0],
            max_points,
        );
        if out.flags.contains(PathFlags::BUFFER_TOO_SMALL) {
            return Ok(out);
        }

        if path.len() > 1 {
            let mut portal_apex = closest_start;
            let mut portal_left = closest_start;
            let mut portal_right = closest_start;

            let mut apex_index = 0usize;
            let mut left_index = 0usize;
            let mut right_index = 0usize;

            let mut left_poly_ref = path[0];
            let mut right_poly_ref = path[0];
            let mut left_poly_type = PolyType::Ground;
            let mut right_poly_type = PolyType::Ground;

            let mut i = 0usize;
            while i < path.len() {
                let (left, right, to_type) = if i + 1 < path.len() {
                    match self.portal_points(mesh, path[i], path[i + 1]) {
                        Ok((left, right)) => {
                            let to_type = mesh
                                .tile_and_poly_by_ref(path[i + 1])
                                .map(|(_, poly)| poly.poly_type())
                                .unwrap_or(PolyType::Ground);

                            // Degenerate first portal right at the start
                            // point does not force a turn.
                            if i == 0 {
                                let (distance, _) =
                                    distance_point_to_segment_2d(portal_apex, left, right);
                                if distance < 0.001 * 0.001 {
                                    i += 1;
                                    continue;
                                }
                            }

                            (left, right, to_type)
                        }
                        Err(_) => {
                            // The corridor breaks here; clamp the end onto
                            // the last valid polygon and stop.
                            closest_end =
                                self.closest_point_on_poly_boundary(mesh, path[i], end_pos)?;
                            if !options.is_empty() {
                                self.append_portals(
                                    mesh,
                                    apex_index,
                                    i,
                                    closest_end,
                                    path,
                                    &mut out,
                                    max_points,
                                    options,
                                );
                            }
                            append_vertex(
                                &mut out,
                                closest_end,
                                StraightPathFlags::empty(),
                                path[i],
                                max_points,
                            );
                            out.flags |= PathFlags::PARTIAL;
                            return Ok(out);
                        }
                    }
                } else {
                    (closest_end, closest_end, PolyType::Ground)
                };

                // Tighten the right side of the funnel.
                if triangle_area_2d(portal_apex, portal_right, right) <= 0.0 {
                    if portal_apex.distance_squared(portal_right) < (1.0 / 16384.0)
                        || triangle_area_2d(portal_apex, portal_left, right) > 0.0
                    {
                        portal_right = right;
                        right_poly_ref = if i + 1 < path.len() {
                            path[i + 1]
                        } else {
                            PolyRef::NONE
                        };
                        right_poly_type = to_type;
                        right_index = i;
                    } else {
                        // Right crossed over left; left becomes the apex.
                        if !options.is_empty() {
                            self.append_portals(
                                mesh,
                                apex_index,
                                left_index,
                                portal_left,
                                path,
                                &mut out,
                                max_points,
                                options,
                            );
                        }

                        portal_apex = portal_left;
                        apex_index = left_index;

                        let flags = if left_poly_ref.is_none() {
                            StraightPathFlags::END
                        } else if left_poly_type == PolyType::OffMeshConnection {
                            StraightPathFlags::OFF_MESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        append_vertex(&mut out, portal_apex, flags, left_poly_ref, max_points);
                        if out.flags.contains(PathFlags::BUFFER_TOO_SMALL) {
                            return Ok(out);
                        }

                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;

                        i = apex_index + 1;
                        continue;
                    }
                }

                // Tighten the left side.
                if triangle_area_2d(portal_apex, portal_left, left) >= 0.0 {
                    if portal_apex.distance_squared(portal_left) < (1.0 / 16384.0)
                        || triangle_area_2d(portal_apex, portal_right, left) < 0.0
                    {
                        portal_left = left;
                        left_poly_ref = if i + 1 < path.len() {
                            path[i + 1]
                        } else {
                            PolyRef::NONE
                        };
                        left_poly_type = to_type;
                        left_index = i;
                    } else {
                        if !options.is_empty() {
                            self.append_portals(
                                mesh,
                                apex_index,
                                right_index,
                                portal_right,
                                path,
                                &mut out,
                                max_points,
                                options,
                            );
                        }

                        portal_apex = portal_right;
                        apex_index = right_index;

                        let flags = if right_poly_ref.is_none() {
                            StraightPathFlags::END
                        } else if right_poly_type == PolyType::OffMeshConnection {
                            StraightPathFlags::OFF_MESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        append_vertex(&mut out, portal_apex, flags, right_poly_ref, max_points);
                        if out.flags.contains(PathFlags::BUFFER_TOO_SMALL) {
                            return Ok(out);
                        }

                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;

                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }

            if !options.is_empty() {
                self.append_portals(
                    mesh,
                    apex_index,
                    path.len() - 1,
                    closest_end,
                    path,
                    &mut out,
                    max_points,
                    options,
                );
            }
        }

        append_vertex(
            &mut out,
            closest_end,
            StraightPathFlags::END,
            PolyRef::NONE,
            max_points,
        );

        Ok(out)
    }

    /// Emits portal crossings between two funnel apexes.
    #[allow(clippy::too_many_arguments)]
    fn append_portals(
        &self,
        mesh: &NavMesh,
        start_index: usize,
        end_index: usize,
        end_pos: Vec3,
        path: &[PolyRef],
        out: &mut StraightPath,
        max_points: usize,
        options: StraightPathOptions,
    ) {
        let Some(start_pos) = out.points.last().map(|point| point.position) else {
            return;
        };

        for i in start_index..end_index {
            let Ok((left, right)) = self.portal_points(mesh, path[i], path[i + 1]) else {
                return;
            };

            if options.contains(StraightPathOptions::AREA_CROSSINGS) {
                let from_area = mesh
                    .tile_and_poly_by_ref(path[i])
                    .map(|(_, poly)| poly.area());
                let to_area = mesh
                    .tile_and_poly_by_ref(path[i + 1])
                    .map(|(_, poly)| poly.area());
                if from_area == to_area {
                    continue;
                }
            }

            if let Some((_, t)) = intersect_segment_segment_2d(start_pos, end_pos, left, right) {
                append_vertex(
                    out,
                    left.lerp(right, t),
                    StraightPathFlags::empty(),
                    path[i + 1],
                    max_points,
                );
                if out.flags.contains(PathFlags::BUFFER_TOO_SMALL) {
                    return;
                }
            }
        }
    }

    // --- Raycast ------------------------------------------------------------

    /// 2D walkability ray-cast from `start_pos` toward `end_pos`, walking
    /// polygon to polygon through links.
    pub fn raycast(
        &self,
        mesh: &NavMesh,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &impl QueryFilter,
        options: RaycastOptions,
    ) -> Result<RaycastHit, QueryError> {
        if !mesh.is_valid_poly_ref(start_ref) {
            return Err(QueryError::InvalidPolyRef);
        }
        if !start_pos.is_finite() || !end_pos.is_finite() {
            return Err(QueryError::InvalidParam);
        }

        let mut hit = RaycastHit::default();
        let mut current_position = start_pos;
        let mut vertices = [Vec3::ZERO; VERTICES_PER_POLYGON];

        let mut current_ref = start_ref;

        while !current_ref.is_none() {
            let (tile, poly) = mesh.tile_and_poly_unchecked(current_ref);
            let vertex_count = tile.polygon_vertices(poly, &mut vertices);

            let Some((_, t_max, _, seg_max)) =
                intersect_segment_poly_2d(start_pos, end_pos, &vertices[..vertex_count])
            else {
                // Could not hit the polygon; keep the result so far.
                return Ok(hit);
            };

            if let Some(seg_max) = seg_max {
                hit.hit_edge_index = seg_max;
            }
            if t_max > hit.t {
                hit.t = t_max;
            }

            hit.path.push(current_ref);

            let Some(seg_max) = seg_max else {
                // The ray ends inside this polygon.
                hit.t = f32::MAX;
                if options.contains(RaycastOptions::USE_COSTS) {
                    hit.path_cost += filter.cost(
                        current_position,
                        end_pos,
                        None,
                        (tile, poly),
                        None,
                    );
                }
                return Ok(hit);
            };

            // Find a link crossing the exit edge.
            let mut next_ref = PolyRef::NONE;
            for link in tile.links_of(poly) {
                if link.edge as usize != seg_max {
                    continue;
                }

                let Ok((next_tile, next_poly)) = mesh.tile_and_poly_by_ref(link.target) else {
                    continue;
                };
                if next_poly.poly_type() == PolyType::OffMeshConnection {
                    continue;
                }
                if !filter.passes(next_tile, next_poly) {
                    continue;
                }

                // Internal edges & full-width portals always pass through.
                if link.side == 0xff || (link.bmin == 0 && link.bmax == 255) {
                    next_ref = link.target;
                    break;
                }

                // Partial portals: the crossing point must lie inside the
                // covered sub-range.
                let a = vertices[seg_max];
                let b = vertices[(seg_max + 1) % vertex_count];

                const S: f32 = 1.0 / 255.0;
                if link.side == 0 || link.side == 4 {
                    let mut range_min = a.z + (b.z - a.z) * (link.bmin as f32 * S);
                    let mut range_max = a.z + (b.z - a.z) * (link.bmax as f32 * S);
                    if range_min > range_max {
                        std::mem::swap(&mut range_min, &mut range_max);
                    }
                    let z = start_pos.z + (end_pos.z - start_pos.z) * t_max;
                    if (range_min..=range_max).contains(&z) {
                        next_ref = link.target;
                        break;
                    }
                } else if link.side == 2 || link.side == 6 {
                    let mut range_min = a.x + (b.x - a.x) * (link.bmin as f32 * S);
                    let mut range_max = a.x + (b.x - a.x) * (link.bmax as f32 * S);
                    if range_min > range_max {
                        std::mem::swap(&mut range_min, &mut range_max);
                    }
                    let x = start_pos.x + (end_pos.x - start_pos.x) * t_max;
                    if (range_min..=range_max).contains(&x) {
                        next_ref = link.target;
                        break;
                    }
                }
            }

            if options.contains(RaycastOptions::USE_COSTS) {
                let exit_position = start_pos.lerp(end_pos, t_max);
                hit.path_cost += filter.cost(
                    current_position,
                    exit_position,
                    None,
                    (tile, poly),
                    None,
                );
                current_position = exit_position;
            }

            if next_ref.is_none() {
                // Hit a wall; face the normal back along the crossing.
                let a = vertices[seg_max];
                let b = vertices[(seg_max + 1) % vertex_count];
                let edge = b - a;
                hit.normal = Vec3::new(edge.z, 0.0, -edge.x).normalize_or_zero();
                return Ok(hit);
            }

            current_ref = next_ref;
        }

        Ok(hit)
    }

    // --- Surface walking ----------------------------------------------------

    /// Slides from `start_pos` toward `end_pos` along the surface, never
    /// leaving the mesh. Returns the constrained position and the polygons
    /// visited.
    pub fn move_along_surface(
        &mut self,
        mesh: &NavMesh,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &impl QueryFilter,
    ) -> Result<(Vec3, Vec<PolyRef>), QueryError> {
        if !mesh.is_valid_poly_ref(start_ref) {
            return Err(QueryError::InvalidPolyRef);
        }
        if !start_pos.is_finite() || !end_pos.is_finite() {
            return Err(QueryError::InvalidParam);
        }

        self.tiny_node_pool.clear();

        let start_index = self
            .tiny_node_pool
            .get_or_create(start_ref, 0)
            .expect("cleared tiny pool has room");
        self.tiny_node_pool.get_mut(start_index).flags = NodeFlags::CLOSED;

        let mut stack: SmallVec<[NodeIndex; MAX_LOCAL_STACK]> = SmallVec::new();
        stack.push(start_index);

        let mut best_position = start_pos;
        let mut best_distance = f32::MAX;
        let mut best_node = start_index;

        // Search within a circle halfway between the end points.
        let search_position = start_pos.lerp(end_pos, 0.5);
        let search_radius_sqr = {
            let r = start_pos.distance(end_pos) / 2.0 + 0.001;
            r * r
        };

        let mut vertices = [Vec3::ZERO; VERTICES_PER_POLYGON];

        while !stack.is_empty() {
            // FIFO walk keeps the visited set breadth-first.
            let current_index = stack.remove(0);
            let current_ref = self.tiny_node_pool.get(current_index).reference;

            let (tile, poly) = mesh.tile_and_poly_unchecked(current_ref);
            let vertex_count = tile.polygon_vertices(poly, &mut vertices);

            if point_in_polygon_2d(end_pos, &vertices[..vertex_count]) {
                best_node = current_index;
                best_position = end_pos;
                break;
            }

            for edge in 0..vertex_count {
                let mut neighbours: SmallVec<[PolyRef; MAX_LOCAL_NEIGHBOURS]> = SmallVec::new();

                let neighbour_slot = poly.neighbours[edge];
                if (neighbour_slot & crate::mesh::EXTERNAL_LINK) != 0 {
                    for link in tile.links_of(poly) {
                        if link.edge as usize != edge || link.target.is_none() {
                            continue;
                        }
                        if let Ok((link_tile, link_poly)) = mesh.tile_and_poly_by_ref(link.target) {
                            if filter.passes(link_tile, link_poly)
                                && neighbours.len() < MAX_LOCAL_NEIGHBOURS
                            {
                                neighbours.push(link.target);
                            }
                        }
                    }
                } else if neighbour_slot != 0 {
                    for link in tile.links_of(poly) {
                        if link.edge as usize != edge {
                            continue;
                        }
                        if let Ok((link_tile, link_poly)) = mesh.tile_and_poly_by_ref(link.target) {
                            if link_poly.poly_type() != PolyType::OffMeshConnection
                                && filter.passes(link_tile, link_poly)
                            {
                                neighbours.push(link.target);
                                break;
                            }
                        }
                    }
                }

                let a = vertices[edge];
                let b = vertices[(edge + 1) % vertex_count];

                if neighbours.is_empty() {
                    // Wall edge: candidate for the constrained position.
                    let (distance, t) = distance_point_to_segment_2d(end_pos, a, b);
                    if distance < best_distance {
                        best_position = a.lerp(b, t);
                        best_distance = distance;
                        best_node = current_index;
                    }
                } else {
                    for neighbour_ref in neighbours {
                        // Skip edges outside the search circle.
                        let (distance, _) = distance_point_to_segment_2d(search_position, a, b);
                        if distance > search_radius_sqr {
                            continue;
                        }

                        let Some(neighbour_index) =
                            self.tiny_node_pool.get_or_create(neighbour_ref, 0)
                        else {
                            continue;
                        };
                        if self
                            .tiny_node_pool
                            .get(neighbour_index)
                            .flags
                            .contains(NodeFlags::CLOSED)
                        {
                            continue;
                        }

                        if stack.len() < MAX_LOCAL_STACK {
                            let node = self.tiny_node_pool.get_mut(neighbour_index);
                            node.parent = Some(current_index);
                            node.flags.insert(NodeFlags::CLOSED);
                            stack.push(neighbour_index);
                        }
                    }
                }
            }
        }

        // Trace back the visited chain, oldest first.
        let mut visited = Vec::new();
        let mut cursor = Some(best_node);
        while let Some(index) = cursor {
            visited.push(self.tiny_node_pool.get(index).reference);
            cursor = self.tiny_node_pool.get(index).parent;
        }
        visited.reverse();

        Ok((best_position, visited))
    }

    // --- Local neighbourhood ------------------------------------------------

    /// Non-overlapping polygons reachable from `start_ref` within `radius`
    /// by local portal walks. The constrained breadth-first walk never
    /// crosses the radius, so distant geometry stays untouched.
    pub fn find_local_neighbourhood(
        &mut self,
        mesh: &NavMesh,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &impl QueryFilter,
        max_polys: usize,
    ) -> Result<Vec<PolyRef>, QueryError> {
        if !mesh.is_valid_poly_ref(start_ref) {
            return Err(QueryError::InvalidPolyRef);
        }
        if !center.is_finite() || radius < 0.0 {
            return Err(QueryError::InvalidParam);
        }

        self.tiny_node_pool.clear();

        let start_index = self
            .tiny_node_pool
            .get_or_create(start_ref, 0)
            .expect("cleared tiny pool has room");
        self.tiny_node_pool.get_mut(start_index).flags = NodeFlags::CLOSED;

        let mut stack: SmallVec<[NodeIndex; MAX_LOCAL_STACK]> = SmallVec::new();
        stack.push(start_index);

        let mut result = vec![start_ref];

        let radius_sqr = radius * radius;
        let mut vertices = [Vec3::ZERO; VERTICES_PER_POLYGON];
        let mut neighbour_vertices = [Vec3::ZERO; VERTICES_PER_POLYGON];

        while !stack.is_empty() {
            let current_index = stack.remove(0);
            let current_ref = self.tiny_node_pool.get(current_index).reference;

            let (tile, poly) = mesh.tile_and_poly_unchecked(current_ref);

            let links: SmallVec<[(PolyRef, u8); 8]> = tile
                .links_of(poly)
                .map(|link| (link.target, link.edge))
                .collect();

            for (neighbour_ref, edge) in links {
                if neighbour_ref.is_none() {
                    continue;
                }

                let Some(neighbour_index) = self.tiny_node_pool.get_or_create(neighbour_ref, 0)
                else {
                    continue;
                };
                if self
                    .tiny_node_pool
                    .get(neighbour_index)
                    .flags
                    .contains(NodeFlags::CLOSED)
                {
                    continue;
                }

                let Ok((neighbour_tile, neighbour_poly)) =
                    mesh.tile_and_poly_by_ref(neighbour_ref)
                else {
                    continue;
                };
                if neighbour_poly.poly_type() == PolyType::OffMeshConnection {
                    continue;
                }
                if !filter.passes(neighbour_tile, neighbour_poly) {
                    continue;
                }

                // The portal must intersect the search circle.
                let (tile, poly) = mesh.tile_and_poly_unchecked(current_ref);
                let vertex_count = poly.vertex_count as usize;
                let a = tile.data.vertices[poly.vertices[edge as usize] as usize];
                let b = tile.data.vertices
                    [poly.vertices[(edge as usize + 1) % vertex_count] as usize];
                let (distance, _) = distance_point_to_segment_2d(center, a, b);
                if distance > radius_sqr {
                    continue;
                }

                self.tiny_node_pool.get_mut(neighbour_index).flags = NodeFlags::CLOSED;

                // Reject polygons that 2D-overlap already accepted ones;
                // stacked layers would double-report walls otherwise.
                let neighbour_count =
                    neighbour_tile.polygon_vertices(neighbour_poly, &mut neighbour_vertices);

                let mut overlaps = false;
                for &accepted in result.iter() {
                    let (accepted_tile, accepted_poly) = mesh.tile_and_poly_unchecked(accepted);
                    let accepted_count =
                        accepted_tile.polygon_vertices(accepted_poly, &mut vertices);
                    if overlap_poly_poly_2d(
                        &neighbour_vertices[..neighbour_count],
                        &vertices[..accepted_count],
                    ) {
                        overlaps = true;
                        break;
                    }
                }
                if overlaps {
                    continue;
                }

                if result.len() < max_polys {
                    result.push(neighbour_ref);
                }
                if stack.len() < MAX_LOCAL_STACK {
                    stack.push(neighbour_index);
                }
            }
        }

        Ok(result)
    }

    /// Wall & portal segments of one polygon. Portal edges covered only
    /// partially by links emit the uncovered pieces as walls.
    pub fn poly_wall_segments(
        &self,
        mesh: &NavMesh,
        reference: PolyRef,
        filter: &impl QueryFilter,
    ) -> Result<Vec<WallSegment>, QueryError> {
        let (tile, poly) = mesh
            .tile_and_poly_by_ref(reference)
            .map_err(|_| QueryError::InvalidPolyRef)?;

        let mut segments = Vec::new();
        let vertex_count = poly.vertex_count as usize;

        for edge in 0..vertex_count {
            let a = tile.data.vertices[poly.vertices[edge] as usize];
            let b = tile.data.vertices[poly.vertices[(edge + 1) % vertex_count] as usize];

            let neighbour_slot = poly.neighbours[edge];
            if (neighbour_slot & crate::mesh::EXTERNAL_LINK) != 0 {
                // Covered intervals along the edge, from the links.
                let mut intervals: SmallVec<[(u8, u8, PolyRef); 4]> = SmallVec::new();
                for link in tile.links_of(poly) {
                    if link.edge as usize != edge {
                        continue;
                    }
                    if let Ok((link_tile, link_poly)) = mesh.tile_and_poly_by_ref(link.target) {
                        let neighbour = if filter.passes(link_tile, link_poly) {
                            link.target
                        } else {
                            PolyRef::NONE
                        };
                        intervals.push((link.bmin, link.bmax, neighbour));
                    }
                }
                intervals.sort_unstable_by_key(|interval| interval.0);

                // Gaps between intervals are walls.
                let mut cursor = 0u8;
                for &(bmin, bmax, neighbour) in intervals.iter() {
                    if bmin > cursor {
                        segments.push(WallSegment {
                            start: a.lerp(b, cursor as f32 / 255.0),
                            end: a.lerp(b, bmin as f32 / 255.0),
                            neighbour: PolyRef::NONE,
                        });
                    }
                    segments.push(WallSegment {
                        start: a.lerp(b, bmin as f32 / 255.0),
                        end: a.lerp(b, bmax as f32 / 255.0),
                        neighbour,
                    });
                    cursor = cursor.max(bmax);
                }
                if cursor < 255 {
                    segments.push(WallSegment {
                        start: a.lerp(b, cursor as f32 / 255.0),
                        end: b,
                        neighbour: PolyRef::NONE,
                    });
                }
            } else {
                let neighbour = if neighbour_slot != 0 {
                    let mut found = PolyRef::NONE;
                    for link in tile.links_of(poly) {
                        if link.edge as usize == edge {
                            if let Ok((link_tile, link_poly)) =
                                mesh.tile_and_poly_by_ref(link.target)
                            {
                                if filter.passes(link_tile, link_poly) {
                                    found = link.target;
                                }
                            }
                            break;
                        }
                    }
                    found
                } else {
                    PolyRef::NONE
                };

                segments.push(WallSegment {
                    start: a,
                    end: b,
                    neighbour,
                });
            }
        }

        Ok(segments)
    }
}

/// Appends or merges one waypoint; sets the buffer flag when out of room.
fn append_vertex(
    out: &mut StraightPath,
    position: Vec3,
    flags: StraightPathFlags,
    reference: PolyRef,
    max_points: usize,
) {
    if let Some(last) = out.points.last_mut() {
        if last.position.distance_squared(position) < crate::math::EPSILON {
            // Same spot; fold the annotation into the existing point.
            last.flags = flags;
            last.reference = reference;
            return;
        }
    }

    if out.points.len() >= max_points {
        out.flags |= PathFlags::BUFFER_TOO_SMALL;
        return;
    }

    out.points.push(StraightPathPoint {
        position,
        flags,
        reference,
    });
}
