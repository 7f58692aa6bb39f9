//! Velocity-space obstacle avoidance.
//!
//! Candidate velocities are scored by a shared penalty function against
//! moving circle obstacles (other agents) and static segments (walls); the
//! sampler returns the cheapest candidate. Two sampling strategies: a biased
//! regular grid, and an adaptive rose pattern refined around the running
//! best.

use bevy::math::{Vec2, Vec3, Vec3Swizzles};

use crate::math::{intersect_ray_segment_2d, sweep_circle_circle, triangle_area_2d};

pub const MAX_OBSTACLE_CIRCLES: usize = 6;
pub const MAX_OBSTACLE_SEGMENTS: usize = 8;

/// Weights & sampling resolution for one avoidance quality preset.
#[derive(Debug, Clone, Copy)]
pub struct ObstacleAvoidanceParams {
    pub velocity_bias: f32,
    pub weight_desired_velocity: f32,
    pub weight_current_velocity: f32,
    pub weight_side: f32,
    pub weight_toi: f32,
    /// Collision horizon in seconds; impacts beyond it cost nothing.
    pub horizon_time: f32,
    pub grid_size: u8,
    pub adaptive_divs: u8,
    pub adaptive_rings: u8,
    pub adaptive_depth: u8,
}

impl Default for ObstacleAvoidanceParams {
    fn default() -> Self {
        Self {
            velocity_bias: 0.4,
            weight_desired_velocity: 2.0,
            weight_current_velocity: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horizon_time: 2.5,
            grid_size: 33,
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ObstacleCircle {
    position: Vec3,
    velocity: Vec3,
    desired_velocity: Vec3,
    radius: f32,
    /// Unit direction toward the circle, set by `prepare`.
    dp: Vec3,
    /// Preferred avoidance side normal, set by `prepare`.
    np: Vec3,
}

#[derive(Debug, Clone, Copy, Default)]
struct ObstacleSegment {
    p: Vec3,
    q: Vec3,
    /// The sampling position touches the segment.
    touch: bool,
}

pub struct ObstacleAvoidanceQuery {
    circles: Vec<ObstacleCircle>,
    segments: Vec<ObstacleSegment>,
    params: ObstacleAvoidanceParams,
    inv_horizon_time: f32,
    vmax: f32,
    inv_vmax: f32,
}

impl Default for ObstacleAvoidanceQuery {
    fn default() -> Self {
        Self::new()
    }
}

impl ObstacleAvoidanceQuery {
    pub fn new() -> Self {
        Self {
            circles: Vec::with_capacity(MAX_OBSTACLE_CIRCLES),
            segments: Vec::with_capacity(MAX_OBSTACLE_SEGMENTS),
            params: ObstacleAvoidanceParams::default(),
            inv_horizon_time: 0.0,
            vmax: 0.0,
            inv_vmax: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    pub fn add_circle(&mut self, position: Vec3, radius: f32, velocity: Vec3, desired_velocity: Vec3) {
        if self.circles.len() >= MAX_OBSTACLE_CIRCLES {
            return;
        }

        self.circles.push(ObstacleCircle {
            position,
            velocity,
            desired_velocity,
            radius,
            ..Default::default()
        });
    }

    pub fn add_segment(&mut self, p: Vec3, q: Vec3) {
        if self.segments.len() >= MAX_OBSTACLE_SEGMENTS {
            return;
        }

        self.segments.push(ObstacleSegment {
            p,
            q,
            touch: false,
        });
    }

    /// Per-sample invariants: side preference of each circle, touch state of
    /// each segment.
    fn prepare(&mut self, position: Vec3, desired_velocity: Vec3) {
        for circle in self.circles.iter_mut() {
            circle.dp = (circle.position - position).normalize_or_zero();

            let dv = circle.desired_velocity - desired_velocity;
            let a = triangle_area_2d(Vec3::ZERO, circle.dp, dv);
            if a < 0.01 {
                circle.np = Vec3::new(-circle.dp.z, 0.0, circle.dp.x);
            } else {
                circle.np = Vec3::new(circle.dp.z, 0.0, -circle.dp.x);
            }
        }

        for segment in self.segments.iter_mut() {
            let (distance, _) =
                crate::math::distance_point_to_segment_2d(position, segment.p, segment.q);
            segment.touch = distance < 0.01 * 0.01;
        }
    }

    /// Penalty of one candidate velocity. Lower is better; `min_penalty`
    /// lets the time-of-impact scan bail out early once the candidate can no
    /// longer win.
    fn process_sample(
        &self,
        candidate: Vec3,
        position: Vec3,
        radius: f32,
        velocity: Vec3,
        desired_velocity: Vec3,
        min_penalty: f32,
    ) -> f32 {
        let desired_penalty = self.params.weight_desired_velocity
            * (candidate.xz().distance(desired_velocity.xz()) * self.inv_vmax);
        let current_penalty = self.params.weight_current_velocity
            * (candidate.xz().distance(velocity.xz()) * self.inv_vmax);

        // Impact-time threshold past which this candidate cannot beat
        // `min_penalty` regardless of the remaining terms.
        let remaining = min_penalty - desired_penalty - current_penalty;
        let time_threshold = (self.params.weight_toi / remaining - 0.1) * self.params.horizon_time;
        if time_threshold - self.params.horizon_time > -f32::EPSILON {
            return min_penalty;
        }

        let mut time_of_impact = self.params.horizon_time;
        let mut side = 0.0f32;
        let mut side_count = 0usize;

        for circle in self.circles.iter() {
            // Relative velocity in RVO terms.
            let vab = candidate * 2.0 - velocity - circle.velocity;

            side += (f32::min(
                circle.dp.xz().dot(vab.xz()) * 0.5 + 0.5,
                circle.np.xz().dot(vab.xz()) * 2.0,
            ))
            .clamp(0.0, 1.0);
            side_count += 1;

            let Some((mut entry, exit)) =
                sweep_circle_circle(position, radius, vab, circle.position, circle.radius)
            else {
                continue;
            };

            // Already overlapping: escape velocity is rewarded.
            if entry < 0.0 && exit > 0.0 {
                entry = -entry * 0.5;
            }

            if entry >= 0.0 && entry < time_of_impact {
                time_of_impact = entry;
                if time_of_impact < time_threshold {
                    return min_penalty;
                }
            }
        }

        for segment in self.segments.iter() {
            let impact = if segment.touch {
                // Grazing the wall: only velocities into it collide.
                let direction = segment.q - segment.p;
                let normal = Vec3::new(-direction.z, 0.0, direction.x);
                if normal.xz().dot(candidate.xz()) < 0.0 {
                    continue;
                }
                0.0
            } else {
                match intersect_ray_segment_2d(position, candidate, segment.p, segment.q) {
                    // Hits beyond one time unit never matter at max speed.
                    Some(t) if t <= 1.0 => t,
                    _ => continue,
                }
            };

            // Walls are less urgent than moving agents.
            let impact = impact * 2.0;
            if impact < time_of_impact {
                time_of_impact = impact;
                if time_of_impact < time_threshold {
                    return min_penalty;
                }
            }
        }

        if side_count > 0 {
            side /= side_count as f32;
        }

        let side_penalty = self.params.weight_side * side;
        let toi_penalty =
            self.params.weight_toi * (1.0 / (0.1 + time_of_impact * self.inv_horizon_time));

        desired_penalty + current_penalty + side_penalty + toi_penalty
    }

    fn begin_sampling(&mut self, params: &ObstacleAvoidanceParams, position: Vec3, vmax: f32, desired_velocity: Vec3) {
        self.params = *params;
        self.inv_horizon_time = 1.0 / self.params.horizon_time;
        self.vmax = vmax;
        self.inv_vmax = if vmax > 0.0 { 1.0 / vmax } else { f32::MAX };
        self.prepare(position, desired_velocity);
    }

    /// N x N grid biased toward the desired velocity. Returns the best
    /// velocity and the number of samples scored.
    pub fn sample_velocity_grid(
        &mut self,
        position: Vec3,
        radius: f32,
        vmax: f32,
        velocity: Vec3,
        desired_velocity: Vec3,
        params: &ObstacleAvoidanceParams,
    ) -> (Vec3, usize) {
        self.begin_sampling(params, position, vmax, desired_velocity);

        let center = desired_velocity.xz() * self.params.velocity_bias;
        let grid_size = self.params.grid_size.max(2) as usize;
        let cell = vmax * 2.0 * (1.0 - self.params.velocity_bias) / (grid_size - 1) as f32;
        let half = (grid_size - 1) as f32 * cell * 0.5;

        let mut best = Vec3::ZERO;
        let mut best_penalty = f32::MAX;
        let mut samples = 0;

        for y in 0..grid_size {
            for x in 0..grid_size {
                let candidate = Vec3::new(
                    center.x + x as f32 * cell - half,
                    0.0,
                    center.y + y as f32 * cell - half,
                );

                let limit = vmax + cell / 2.0;
                if candidate.xz().length_squared() > limit * limit {
                    continue;
                }

                let penalty = self.process_sample(
                    candidate,
                    position,
                    radius,
                    velocity,
                    desired_velocity,
                    best_penalty,
                );
                samples += 1;

                if penalty < best_penalty {
                    best_penalty = penalty;
                    best = candidate;
                }
            }
        }

        (best, samples)
    }

    /// Rose pattern of `divs x rings + 1` directions aligned to the desired
    /// velocity, refined `depth` times around the running best.
    pub fn sample_velocity_adaptive(
        &mut self,
        position: Vec3,
        radius: f32,
        vmax: f32,
        velocity: Vec3,
        desired_velocity: Vec3,
        params: &ObstacleAvoidanceParams,
    ) -> (Vec3, usize) {
        self.begin_sampling(params, position, vmax, desired_velocity);

        let divs = self.params.adaptive_divs.clamp(1, 32) as usize;
        let rings = self.params.adaptive_rings.clamp(1, 4) as usize;
        let depth = self.params.adaptive_depth.max(1) as usize;

        // Pattern in the desired velocity's frame; odd rings are rotated a
        // half step so the rays interleave.
        let base_angle = {
            let direction = desired_velocity.xz();
            if direction.length_squared() > 1e-8 {
                direction.y.atan2(direction.x)
            } else {
                0.0
            }
        };
        let step = std::f32::consts::TAU / divs as f32;

        let mut pattern: Vec<Vec2> = Vec::with_capacity(divs * rings + 1);
        pattern.push(Vec2::ZERO);
        for ring in 0..rings {
            let r = (rings - ring) as f32 / rings as f32;
            let offset = if ring % 2 == 1 { step * 0.5 } else { 0.0 };
            for div in 0..divs {
                let angle = base_angle + offset + div as f32 * step;
                pattern.push(Vec2::new(angle.cos(), angle.sin()) * r);
            }
        }

        let mut search_radius = vmax * (1.0 - self.params.velocity_bias);
        let mut result = desired_velocity * self.params.velocity_bias;
        result.y = 0.0;
        let mut samples = 0;

        for _ in 0..depth {
            let mut best = result;
            let mut best_penalty = f32::MAX;

            for point in pattern.iter() {
                let candidate = Vec3::new(
                    result.x + point.x * search_radius,
                    0.0,
                    result.z + point.y * search_radius,
                );

                let limit = vmax + 0.001;
                if candidate.xz().length_squared() > limit * limit {
                    continue;
                }

                let penalty = self.process_sample(
                    candidate,
                    position,
                    radius,
                    velocity,
                    desired_velocity,
                    best_penalty,
                );
                samples += 1;

                if penalty < best_penalty {
                    best_penalty = penalty;
                    best = candidate;
                }
            }

            result = best;
            search_radius *= 0.5;
        }

        (result, samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ObstacleAvoidanceParams {
        ObstacleAvoidanceParams::default()
    }

    #[test]
    fn free_space_keeps_the_desired_velocity() {
        let mut query = ObstacleAvoidanceQuery::new();

        let desired = Vec3::new(2.0, 0.0, 0.0);
        let (velocity, samples) = query.sample_velocity_adaptive(
            Vec3::ZERO,
            0.5,
            2.0,
            desired,
            desired,
            &params(),
        );

        assert!(samples > 0);
        assert!(velocity.distance(desired) < 0.25);
    }

    #[test]
    fn head_on_obstacle_deflects_the_velocity() {
        let mut query = ObstacleAvoidanceQuery::new();

        let desired = Vec3::new(2.0, 0.0, 0.0);
        query.add_circle(
            Vec3::new(2.0, 0.0, 0.0),
            0.5,
            Vec3::new(-2.0, 0.0, 0.0),
            Vec3::new(-2.0, 0.0, 0.0),
        );

        let (velocity, _) = query.sample_velocity_grid(
            Vec3::ZERO,
            0.5,
            2.0,
            desired,
            desired,
            &params(),
        );

        // Some sideways component must appear.
        assert!(velocity.z.abs() > 0.01 || velocity.x < desired.x - 0.01);
    }

    #[test]
    fn wall_ahead_caps_forward_speed() {
        let mut query = ObstacleAvoidanceQuery::new();

        let desired = Vec3::new(2.0, 0.0, 0.0);
        query.add_segment(Vec3::new(1.0, 0.0, -4.0), Vec3::new(1.0, 0.0, 4.0));

        let (velocity, _) = query.sample_velocity_grid(
            Vec3::ZERO,
            0.5,
            2.0,
            desired,
            desired,
            &params(),
        );

        assert!(velocity.x < 2.0);
    }

    #[test]
    fn obstacle_capacity_is_bounded() {
        let mut query = ObstacleAvoidanceQuery::new();
        for i in 0..10 {
            query.add_circle(Vec3::new(i as f32, 0.0, 0.0), 0.5, Vec3::ZERO, Vec3::ZERO);
            query.add_segment(Vec3::new(i as f32, 0.0, 0.0), Vec3::new(i as f32, 0.0, 1.0));
        }

        assert_eq!(query.circles.len(), MAX_OBSTACLE_CIRCLES);
        assert_eq!(query.segments.len(), MAX_OBSTACLE_SEGMENTS);
    }
}
