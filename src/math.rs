//! 2D/3D geometry kernels shared by the mesh store, query engine & crowd.
//!
//! Everything here treats the XZ-plane as the ground plane; Y is up.

use bevy::math::{Vec2, Vec3, Vec3Swizzles};

pub const EPSILON: f32 = 1e-6;

/// Signed area of the triangle (a, b, c) projected onto the XZ-plane.
///
/// Positive when c lies to the left of a->b (counter-clockwise winding).
#[inline]
pub fn triangle_area_2d(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let ab_x = b.x - a.x;
    let ab_z = b.z - a.z;

    let ac_x = c.x - a.x;
    let ac_z = c.z - a.z;

    ac_x * ab_z - ab_x * ac_z
}

/// 2D perp-dot (cross) of two XZ-plane vectors.
#[inline]
pub fn perp_2d(u: Vec2, v: Vec2) -> f32 {
    u.y * v.x - u.x * v.y
}

/// Squared distance from `point` to the segment `(a, b)` on the XZ-plane,
/// along with the interpolation factor of the closest point.
pub fn distance_point_to_segment_2d(point: Vec3, a: Vec3, b: Vec3) -> (f32, f32) {
    let seg = b.xz() - a.xz();
    let to_point = point.xz() - a.xz();

    let d = seg.length_squared();
    let mut t = seg.dot(to_point);
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);

    let closest = a.xz() + seg * t;

    (closest.distance_squared(point.xz()), t)
}

/// Height of `point` over the triangle (a, b, c) by barycentric
/// interpolation, if its XZ-projection lies within the triangle.
pub fn closest_height_point_triangle(point: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    let v0 = c.xz() - a.xz();
    let v1 = b.xz() - a.xz();
    let v2 = point.xz() - a.xz();

    let dot00 = v0.length_squared();
    let dot01 = v0.dot(v1);
    let dot02 = v0.dot(v2);
    let dot11 = v1.length_squared();
    let dot12 = v1.dot(v2);

    let denom = dot00 * dot11 - dot01 * dot01;
    if denom.abs() < EPSILON {
        return None;
    }

    let u = (dot11 * dot02 - dot01 * dot12) / denom;
    let v = (dot00 * dot12 - dot01 * dot02) / denom;

    // Small tolerance so points on shared edges resolve on either triangle.
    const TOLERANCE: f32 = 1e-4;
    if u >= -TOLERANCE && v >= -TOLERANCE && (u + v) <= 1.0 + TOLERANCE {
        Some(a.y + (c.y - a.y) * u + (b.y - a.y) * v)
    } else {
        None
    }
}

/// Whether the XZ-projection of `point` is inside the polygon described by
/// `vertices` (counter-clockwise). Uses the crossing-number test.
pub fn point_in_polygon_2d(point: Vec3, vertices: &[Vec3]) -> bool {
    let mut inside = false;

    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let vi = vertices[i];
        let vj = vertices[j];

        if ((vi.z > point.z) != (vj.z > point.z))
            && (point.x < (vj.x - vi.x) * (point.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }

        j = i;
    }

    inside
}

/// Per-edge squared distances from `point` to each polygon edge, plus the
/// edge interpolation factors. Returns whether the point is inside.
pub fn distance_point_to_polygon_edges_2d(
    point: Vec3,
    vertices: &[Vec3],
    edge_distances: &mut [f32],
    edge_factors: &mut [f32],
) -> bool {
    let mut inside = false;

    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let vi = vertices[i];
        let vj = vertices[j];

        if ((vi.z > point.z) != (vj.z > point.z))
            && (point.x < (vj.x - vi.x) * (point.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }

        let (distance, factor) = distance_point_to_segment_2d(point, vj, vi);
        edge_distances[j] = distance;
        edge_factors[j] = factor;

        j = i;
    }

    inside
}

/// Intersection of the segment `(a, b)` with the segment `(c, d)` on the
/// XZ-plane. Returns `(s, t)` interpolation factors along each segment.
pub fn intersect_segment_segment_2d(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> Option<(f32, f32)> {
    let u = b.xz() - a.xz();
    let v = d.xz() - c.xz();
    let w = a.xz() - c.xz();

    let denom = perp_2d(u, v);
    if denom.abs() < 1e-6 {
        return None;
    }

    let s = perp_2d(v, w) / denom;
    let t = perp_2d(u, w) / denom;

    Some((s, t))
}

/// Intersection of the ray `origin + t * direction` with segment `(p, q)` on
/// the XZ-plane. Returns `t` along the ray when the hit is within the
/// segment and ahead of the origin.
pub fn intersect_ray_segment_2d(origin: Vec3, direction: Vec3, p: Vec3, q: Vec3) -> Option<f32> {
    let v = q.xz() - p.xz();
    let w = origin.xz() - p.xz();

    let d = perp_2d(direction.xz(), v);
    if d.abs() < 1e-6 {
        return None;
    }

    let t = perp_2d(v, w) / d;
    if t < 0.0 {
        return None;
    }

    let s = perp_2d(direction.xz(), w) / d;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }

    Some(t)
}

/// Time of impact of two moving circles on the XZ-plane, solving the
/// quadratic for `|(c1 + v1 t) - (c0 + v0 t)| = r0 + r1`.
///
/// Returns the entry & exit times, unbounded. `None` when the relative
/// motion never closes the gap.
pub fn sweep_circle_circle(
    center_a: Vec3,
    radius_a: f32,
    velocity: Vec3,
    center_b: Vec3,
    radius_b: f32,
) -> Option<(f32, f32)> {
    const EPS: f32 = 0.0001;

    let s = center_b.xz() - center_a.xz();
    let r = radius_a + radius_b;
    let c = s.length_squared() - r * r;

    let mut a = velocity.xz().length_squared();
    if a < EPS {
        return None; // Not moving relative to each other.
    }

    let b = velocity.xz().dot(s);
    let d = b * b - a * c;
    if d < 0.0 {
        return None; // No intersection.
    }

    a = 1.0 / a;
    let rd = d.sqrt();

    Some(((b - rd) * a, (b + rd) * a))
}

/// Clips the segment `(p0, p1)` against a convex polygon on the XZ-plane.
///
/// Returns `(t_min, t_max, seg_min, seg_max)`: entry & exit factors along
/// the segment plus the edge indices crossed (`None` when an end point lies
/// inside the polygon).
pub fn intersect_segment_poly_2d(
    p0: Vec3,
    p1: Vec3,
    vertices: &[Vec3],
) -> Option<(f32, f32, Option<usize>, Option<usize>)> {
    const EPS: f32 = 0.00000001;

    let mut t_min = 0.0f32;
    let mut t_max = 1.0f32;
    let mut seg_min = None;
    let mut seg_max = None;

    let dir = p1.xz() - p0.xz();

    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let edge = vertices[i].xz() - vertices[j].xz();
        let diff = p0.xz() - vertices[j].xz();

        let n = perp_2d(edge, diff);
        let d = perp_2d(dir, edge);

        if d.abs() < EPS {
            // Parallel to the edge; fully outside when on the wrong side.
            if n < 0.0 {
                return None;
            }
            j = i;
            continue;
        }

        let t = n / d;
        if d < 0.0 {
            if t > t_min {
                t_min = t;
                seg_min = Some(j);
                if t_min > t_max {
                    return None;
                }
            }
        } else if t < t_max {
            t_max = t;
            seg_max = Some(j);
            if t_max < t_min {
                return None;
            }
        }

        j = i;
    }

    Some((t_min, t_max, seg_min, seg_max))
}

/// Separating-axis overlap test of two convex polygons on the XZ-plane.
pub fn overlap_poly_poly_2d(polygon_a: &[Vec3], polygon_b: &[Vec3]) -> bool {
    fn projected_range(axis: Vec2, polygon: &[Vec3]) -> (f32, f32) {
        let mut min = axis.dot(polygon[0].xz());
        let mut max = min;
        for vertex in &polygon[1..] {
            let d = axis.dot(vertex.xz());
            min = min.min(d);
            max = max.max(d);
        }
        (min, max)
    }

    const EPS: f32 = 1e-4;

    for (first, second) in [(polygon_a, polygon_b), (polygon_b, polygon_a)] {
        let mut j = first.len() - 1;
        for i in 0..first.len() {
            let edge = first[i].xz() - first[j].xz();
            let axis = Vec2::new(edge.y, -edge.x);

            let (a_min, a_max) = projected_range(axis, polygon_a);
            let (b_min, b_max) = projected_range(axis, polygon_b);
            if !overlap_range(a_min + EPS, a_max - EPS, b_min + EPS, b_max - EPS) {
                return false;
            }

            j = i;
        }
    }

    true
}

/// Whether two AABBs overlap.
#[inline]
pub fn overlap_bounds(a_min: Vec3, a_max: Vec3, b_min: Vec3, b_max: Vec3) -> bool {
    a_min.x <= b_max.x
        && a_max.x >= b_min.x
        && a_min.y <= b_max.y
        && a_max.y >= b_min.y
        && a_min.z <= b_max.z
        && a_max.z >= b_min.z
}

/// Whether two quantized AABBs overlap.
#[inline]
pub fn overlap_quantized_bounds(a_min: [u16; 3], a_max: [u16; 3], b_min: [u16; 3], b_max: [u16; 3]) -> bool {
    a_min[0] <= b_max[0]
        && a_max[0] >= b_min[0]
        && a_min[1] <= b_max[1]
        && a_max[1] >= b_min[1]
        && a_min[2] <= b_max[2]
        && a_max[2] >= b_min[2]
}

/// Overlap test of two ranges.
#[inline]
pub fn overlap_range(a_min: f32, a_max: f32, b_min: f32, b_max: f32) -> bool {
    a_min <= b_max && a_max >= b_min
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_area_sign_follows_winding() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(1.0, 0.0, 0.0);
        let c = Vec3::new(0.0, 0.0, 1.0);

        assert!(triangle_area_2d(a, b, c) > 0.0);
        assert!(triangle_area_2d(a, c, b) < 0.0);
    }

    #[test]
    fn point_to_segment_clamps_to_end_points() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(2.0, 0.0, 0.0);

        let (distance, t) = distance_point_to_segment_2d(Vec3::new(3.0, 0.0, 0.0), a, b);
        assert!((distance - 1.0).abs() < EPSILON);
        assert!((t - 1.0).abs() < EPSILON);

        let (distance, t) = distance_point_to_segment_2d(Vec3::new(1.0, 0.0, 1.0), a, b);
        assert!((distance - 1.0).abs() < EPSILON);
        assert!((t - 0.5).abs() < EPSILON);
    }

    #[test]
    fn height_interpolation_inside_triangle() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(2.0, 2.0, 0.0);
        let c = Vec3::new(0.0, 4.0, 2.0);

        let height = closest_height_point_triangle(Vec3::new(0.5, 0.0, 0.5), a, b, c);
        assert!(height.is_some());

        let outside = closest_height_point_triangle(Vec3::new(5.0, 0.0, 5.0), a, b, c);
        assert!(outside.is_none());
    }

    #[test]
    fn point_in_polygon_square() {
        let square = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 0.0),
        ];

        assert!(point_in_polygon_2d(Vec3::new(1.0, 0.0, 1.0), &square));
        assert!(!point_in_polygon_2d(Vec3::new(3.0, 0.0, 1.0), &square));
    }

    #[test]
    fn circle_sweep_head_on() {
        let toi = sweep_circle_circle(
            Vec3::ZERO,
            0.5,
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(3.0, 0.0, 0.0),
            0.5,
        );

        let (entry, exit) = toi.expect("circles on a collision course");
        assert!((entry - 2.0).abs() < 0.001);
        assert!(exit > entry);
    }

    #[test]
    fn ray_segment_hit() {
        let t = intersect_ray_segment_2d(
            Vec3::ZERO,
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, -1.0),
            Vec3::new(2.0, 0.0, 1.0),
        );
        assert!((t.expect("ray crosses segment") - 2.0).abs() < EPSILON);

        let miss = intersect_ray_segment_2d(
            Vec3::ZERO,
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, -1.0),
            Vec3::new(2.0, 0.0, 1.0),
        );
        assert!(miss.is_none());
    }
}
