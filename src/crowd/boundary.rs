//! Cached wall segments around an agent, refreshed when it strays from the
//! cached center or the sourcing polygons stop passing the filter.

use bevy::prelude::Vec3;
use smallvec::SmallVec;

use crate::math::distance_point_to_segment_2d;
use crate::mesh::{NavMesh, PolyRef};
use crate::query::{NavMeshQuery, QueryFilter};

const MAX_SEGMENTS: usize = 8;
const MAX_POLYS: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct BoundarySegment {
    pub start: Vec3,
    pub end: Vec3,
    distance_sqr: f32,
}

#[derive(Debug, Clone, Default)]
pub struct LocalBoundary {
    center: Vec3,
    segments: SmallVec<[BoundarySegment; MAX_SEGMENTS]>,
    polys: SmallVec<[PolyRef; MAX_POLYS]>,
}

impl LocalBoundary {
    pub fn new() -> Self {
        Self {
            center: Vec3::splat(f32::MAX),
            segments: SmallVec::new(),
            polys: SmallVec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.center = Vec3::splat(f32::MAX);
        self.segments.clear();
        self.polys.clear();
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        self.center
    }

    #[inline]
    pub fn segments(&self) -> &[BoundarySegment] {
        &self.segments
    }

    /// Collects the nearest wall segments within `range` of `position`.
    pub fn update(
        &mut self,
        reference: PolyRef,
        position: Vec3,
        range: f32,
        query: &mut NavMeshQuery,
        mesh: &NavMesh,
        filter: &impl QueryFilter,
    ) {
        if reference.is_none() {
            self.reset();
            return;
        }

        self.center = position;

        let Ok(polys) =
            query.find_local_neighbourhood(mesh, reference, position, range, filter, MAX_POLYS)
        else {
            self.reset();
            return;
        };

        self.polys.clear();
        self.polys.extend(polys.iter().copied());

        self.segments.clear();
        let polys: SmallVec<[PolyRef; MAX_POLYS]> = self.polys.clone();
        for &poly in polys.iter() {
            let Ok(segments) = query.poly_wall_segments(mesh, poly, filter) else {
                continue;
            };

            for segment in segments {
                // Only solid walls matter for steering.
                if !segment.neighbour.is_none() {
                    continue;
                }

                let (distance_sqr, _) =
                    distance_point_to_segment_2d(position, segment.start, segment.end);
                if distance_sqr > range * range {
                    continue;
                }

                self.add_segment(BoundarySegment {
                    start: segment.start,
                    end: segment.end,
                    distance_sqr,
                });
            }
        }
    }

    /// Insertion-sorted by distance, keeping the closest [MAX_SEGMENTS].
    fn add_segment(&mut self, segment: BoundarySegment) {
        let position = self
            .segments
            .iter()
            .position(|existing| segment.distance_sqr < existing.distance_sqr)
            .unwrap_or(self.segments.len());

        if position >= MAX_SEGMENTS {
            return;
        }

        if self.segments.len() == MAX_SEGMENTS {
            self.segments.pop();
        }
        self.segments.insert(position, segment);
    }

    /// The cache is usable while every sourcing polygon stays valid.
    pub fn is_valid(
        &self,
        query: &NavMeshQuery,
        mesh: &NavMesh,
        filter: &impl QueryFilter,
    ) -> bool {
        if self.polys.is_empty() {
            return false;
        }

        self.polys
            .iter()
            .all(|&poly| query.is_valid_poly_ref(mesh, poly, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(distance_sqr: f32) -> BoundarySegment {
        BoundarySegment {
            start: Vec3::ZERO,
            end: Vec3::X,
            distance_sqr,
        }
    }

    #[test]
    fn segments_stay_sorted_and_bounded() {
        let mut boundary = LocalBoundary::new();

        for d in [9.0, 1.0, 4.0, 16.0, 2.0, 8.0, 3.0, 5.0, 7.0, 0.5] {
            boundary.add_segment(segment(d));
        }

        assert_eq!(boundary.segments.len(), MAX_SEGMENTS);
        for pair in boundary.segments.windows(2) {
            assert!(pair[0].distance_sqr <= pair[1].distance_sqr);
        }
        // The farthest two never made the cut.
        assert!(boundary
            .segments
            .iter()
            .all(|segment| segment.distance_sqr < 9.5));
    }
}
