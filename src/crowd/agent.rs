//! Crowd agent records.

use bevy::prelude::Vec3;
use bitflags::bitflags;
use smallvec::SmallVec;

use crate::crowd::boundary::LocalBoundary;
use crate::crowd::corridor::PathCorridor;
use crate::crowd::path_queue::PathQueueHandle;
use crate::mesh::PolyRef;
use crate::query::StraightPathPoint;

/// Neighbour & corner capacities per agent.
pub const AGENT_MAX_NEIGHBOURS: usize = 6;
pub const AGENT_MAX_CORNERS: usize = 4;

bitflags! {
    /// Which optional steering stages run for an agent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateFlags: u8 {
        const ANTICIPATE_TURNS = 0x01;
        const OBSTACLE_AVOIDANCE = 0x02;
        const SEPARATION = 0x04;
        const OPTIMIZE_VISIBILITY = 0x08;
        const OPTIMIZE_TOPOLOGY = 0x10;
    }
}

/// Tunables submitted with [crate::crowd::Crowd::add_agent].
#[derive(Debug, Clone)]
pub struct AgentParams {
    pub radius: f32,
    pub height: f32,
    pub max_acceleration: f32,
    pub max_speed: f32,
    /// How far other agents & walls are noticed.
    pub collision_query_range: f32,
    pub path_optimization_range: f32,
    /// Strength of the separation force, when enabled.
    pub separation_weight: f32,
    pub update_flags: UpdateFlags,
    /// Index into the crowd's avoidance presets (0..8).
    pub obstacle_avoidance_type: u8,
    /// Index into the crowd's query filters (0..16).
    pub query_filter_type: u8,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            radius: 0.6,
            height: 2.0,
            max_acceleration: 8.0,
            max_speed: 3.5,
            collision_query_range: 7.2,
            path_optimization_range: 18.0,
            separation_weight: 2.0,
            update_flags: UpdateFlags::all(),
            obstacle_avoidance_type: 3,
            query_filter_type: 0,
        }
    }
}

/// How the agent currently relates to the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentState {
    /// Not standing on any valid polygon.
    #[default]
    Invalid,
    Walking,
    /// Traversing an off-mesh connection; position is animated.
    OffMesh,
}

/// Where an agent's move request currently stands, from intake through the
/// quick search, the path queue, and steering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveRequestState {
    #[default]
    None,
    Failed,
    Valid,
    Requesting,
    WaitingForQueue,
    WaitingForPath,
    Velocity,
}

#[derive(Debug, Clone, Copy)]
pub struct AgentNeighbour {
    /// Pool index of the neighbouring agent.
    pub index: usize,
    pub distance_sqr: f32,
}

/// Interpolation record for an off-mesh traversal in flight.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentAnimation {
    pub active: bool,
    pub init_pos: Vec3,
    pub start_pos: Vec3,
    pub end_pos: Vec3,
    pub poly_ref: PolyRef,
    pub t: f32,
    pub t_max: f32,
}

#[derive(Debug, Clone, Default)]
pub struct CrowdAgent {
    pub active: bool,
    pub state: AgentState,
    /// The corridor currently ends short of the true target.
    pub partial: bool,

    pub corridor: PathCorridor,
    pub boundary: LocalBoundary,
    pub topology_opt_time: f32,

    pub neighbours: SmallVec<[AgentNeighbour; AGENT_MAX_NEIGHBOURS]>,

    pub desired_speed: f32,

    pub position: Vec3,
    /// Accumulated collision displacement within one resolution pass.
    pub displacement: Vec3,
    pub desired_velocity: Vec3,
    /// Desired velocity after obstacle avoidance.
    pub adjusted_velocity: Vec3,
    pub velocity: Vec3,

    pub params: AgentParams,

    pub corners: Vec<StraightPathPoint>,

    pub target_state: MoveRequestState,
    pub target_ref: PolyRef,
    pub target_pos: Vec3,
    pub target_path_queue: Option<PathQueueHandle>,
    pub target_replan: bool,
    pub target_replan_time: f32,

    pub animation: AgentAnimation,
}

impl CrowdAgent {
    /// Remaining 2D distance to the end of the current corner set.
    pub fn distance_to_goal(&self, range: f32) -> f32 {
        use crate::query::StraightPathFlags;
        use bevy::math::Vec3Swizzles;

        let Some(last) = self.corners.last() else {
            return range;
        };

        if last.flags.contains(StraightPathFlags::END) {
            self.position.xz().distance(last.position.xz()).min(range)
        } else {
            range
        }
    }
}
