//! The crowd simulator.
//!
//! A fixed pool of agents driven through a deterministic per-tick pipeline:
//! path validity checks, move-request processing against the shared path
//! queue, corridor optimization, proximity & boundary refresh, steering,
//! velocity-space obstacle avoidance, integration, iterative collision
//! resolution and re-projection onto the mesh. Agents are always processed
//! in ascending pool order, so a tick is reproducible.

use bevy::math::{Vec2, Vec3Swizzles};
use bevy::prelude::Vec3;
use smallvec::SmallVec;
use thiserror::Error;

use crate::mesh::{NavMesh, PolyRef};
use crate::query::{
    NavMeshQuery, PathFlags, StandardFilter, StraightPathFlags,
};

pub mod agent;
pub mod avoidance;
pub mod boundary;
pub mod corridor;
pub mod grid;
pub mod path_queue;

pub use agent::{
    AgentAnimation, AgentNeighbour, AgentParams, AgentState, CrowdAgent, MoveRequestState,
    UpdateFlags, AGENT_MAX_CORNERS, AGENT_MAX_NEIGHBOURS,
};
pub use avoidance::{ObstacleAvoidanceParams, ObstacleAvoidanceQuery};
pub use boundary::LocalBoundary;
pub use corridor::{PathCorridor, MAX_CORRIDOR_POLYS};
pub use grid::ProximityGrid;
pub use path_queue::{PathQueue, PathQueueHandle, PathRequestStatus, PATH_QUEUE_SLOTS};

/// Shared iteration budget for queue-driven path searches per tick.
const MAX_ITERS_PER_UPDATE: usize = 100;

/// Iterations of the quick synchronous search a new request gets.
const QUICK_SEARCH_ITERS: usize = 20;

/// Seconds between topology optimizations of one corridor.
const OPT_TIME_THRESHOLD: f32 = 0.5;

/// Corridor look-ahead validated each tick.
const CHECK_LOOKAHEAD: usize = 10;

/// Seconds before a short-falling valid target is replanned.
const TARGET_REPLAN_DELAY: f32 = 1.0;

const COLLISION_RESOLVE_FACTOR: f32 = 0.7;
const COLLISION_RESOLVE_ITERATIONS: usize = 4;

/// Avoidance presets & filters selectable per agent.
pub const CROWD_MAX_AVOIDANCE_PARAMS: usize = 8;
pub const CROWD_MAX_QUERY_FILTERS: usize = 16;

const MAX_COMMON_NODES: usize = 512;

/// Agents submitted to the path queue / topology optimizer per tick.
const MAX_PATH_QUEUE_AGENTS: usize = 8;
const MAX_TOPOLOGY_OPT_AGENTS: usize = 1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CrowdError {
    #[error("invalid parameter")]
    InvalidParam,
    #[error("agent index {0} is out of range or inactive")]
    BadAgentIndex(usize),
    #[error("the agent pool is full ({0} slots)")]
    PoolFull(usize),
}

pub struct Crowd {
    agents: Vec<CrowdAgent>,
    max_agent_radius: f32,

    path_queue: PathQueue,
    obstacle_query: ObstacleAvoidanceQuery,
    avoidance_params: [ObstacleAvoidanceParams; CROWD_MAX_AVOIDANCE_PARAMS],
    filters: [StandardFilter; CROWD_MAX_QUERY_FILTERS],
    grid: ProximityGrid,
    query: NavMeshQuery,

    /// Half-extents used when snapping agents & targets onto the mesh.
    placement_extents: Vec3,

    /// Avoidance samples scored last tick, for budget tuning.
    velocity_sample_count: usize,
}

impl Crowd {
    pub fn new(max_agents: usize, max_agent_radius: f32) -> Result<Self, CrowdError> {
        if max_agents == 0 || max_agent_radius <= 0.0 {
            return Err(CrowdError::InvalidParam);
        }

        Ok(Self {
            agents: vec![CrowdAgent::default(); max_agents],
            max_agent_radius,
            path_queue: PathQueue::new(MAX_CORRIDOR_POLYS),
            obstacle_query: ObstacleAvoidanceQuery::new(),
            avoidance_params: default_avoidance_presets(),
            filters: std::array::from_fn(|_| StandardFilter::default()),
            grid: ProximityGrid::new(max_agents * 4, max_agent_radius * 3.0),
            query: NavMeshQuery::new(MAX_COMMON_NODES)
                .expect("node budget is a positive constant"),
            placement_extents: Vec3::new(
                max_agent_radius * 2.0,
                max_agent_radius * 1.5,
                max_agent_radius * 2.0,
            ),
            velocity_sample_count: 0,
        })
    }

    #[inline]
    pub fn max_agents(&self) -> usize {
        self.agents.len()
    }

    /// Radius the proximity grid & placement extents were sized for.
    #[inline]
    pub fn max_agent_radius(&self) -> f32 {
        self.max_agent_radius
    }

    #[inline]
    pub fn velocity_sample_count(&self) -> usize {
        self.velocity_sample_count
    }

    pub fn set_obstacle_avoidance_params(&mut self, index: usize, params: ObstacleAvoidanceParams) {
        if index < CROWD_MAX_AVOIDANCE_PARAMS {
            self.avoidance_params[index] = params;
        }
    }

    pub fn obstacle_avoidance_params(&self, index: usize) -> Option<&ObstacleAvoidanceParams> {
        self.avoidance_params.get(index)
    }

    pub fn filter(&self, index: usize) -> Option<&StandardFilter> {
        self.filters.get(index)
    }

    pub fn filter_mut(&mut self, index: usize) -> Option<&mut StandardFilter> {
        self.filters.get_mut(index)
    }

    pub fn agent(&self, index: usize) -> Option<&CrowdAgent> {
        self.agents.get(index).filter(|agent| agent.active)
    }

    pub fn agent_mut(&mut self, index: usize) -> Option<&mut CrowdAgent> {
        self.agents.get_mut(index).filter(|agent| agent.active)
    }

    /// Pool indices of every active agent, ascending.
    pub fn active_agents(&self) -> Vec<usize> {
        self.agents
            .iter()
            .enumerate()
            .filter(|(_, agent)| agent.active)
            .map(|(index, _)| index)
            .collect()
    }

    /// Places a new agent near `position`. The slot index is stable until
    /// [Self::remove_agent].
    pub fn add_agent(
        &mut self,
        position: Vec3,
        params: AgentParams,
        mesh: &NavMesh,
    ) -> Result<usize, CrowdError> {
        let index = self
            .agents
            .iter()
            .position(|agent| !agent.active)
            .ok_or(CrowdError::PoolFull(self.agents.len()))?;

        let filter = &self.filters[params.query_filter_type as usize % CROWD_MAX_QUERY_FILTERS];
        let (reference, nearest) = self
            .query
            .find_nearest_poly(mesh, position, self.placement_extents, filter)
            .unwrap_or((PolyRef::NONE, position));

        let agent = &mut self.agents[index];
        *agent = CrowdAgent {
            active: true,
            state: if reference.is_none() {
                AgentState::Invalid
            } else {
                AgentState::Walking
            },
            params,
            position: nearest,
            corridor: PathCorridor::new(),
            boundary: LocalBoundary::new(),
            ..Default::default()
        };
        agent.corridor.reset(reference, nearest);

        Ok(index)
    }

    pub fn update_agent_parameters(
        &mut self,
        index: usize,
        params: AgentParams,
    ) -> Result<(), CrowdError> {
        let agent = self
            .agents
            .get_mut(index)
            .filter(|agent| agent.active)
            .ok_or(CrowdError::BadAgentIndex(index))?;

        agent.params = params;
        Ok(())
    }

    /// Deactivates the slot; the agent vanishes from the next tick on.
    pub fn remove_agent(&mut self, index: usize) -> Result<(), CrowdError> {
        let agent = self
            .agents
            .get_mut(index)
            .filter(|agent| agent.active)
            .ok_or(CrowdError::BadAgentIndex(index))?;

        if let Some(handle) = agent.target_path_queue.take() {
            self.path_queue.cancel(handle);
        }
        agent.active = false;

        Ok(())
    }

    /// Submits a move request toward `reference`/`position`.
    pub fn request_move_target(
        &mut self,
        index: usize,
        reference: PolyRef,
        position: Vec3,
    ) -> Result<(), CrowdError> {
        let agent = self
            .agents
            .get_mut(index)
            .filter(|agent| agent.active)
            .ok_or(CrowdError::BadAgentIndex(index))?;

        agent.target_ref = reference;
        agent.target_pos = position;
        agent.target_path_queue = None;
        agent.target_replan = false;
        agent.target_state = if reference.is_none() {
            MoveRequestState::Failed
        } else {
            MoveRequestState::Requesting
        };

        Ok(())
    }

    /// Steers by raw velocity; pathfinding is bypassed entirely.
    pub fn request_move_velocity(
        &mut self,
        index: usize,
        velocity: Vec3,
    ) -> Result<(), CrowdError> {
        let agent = self
            .agents
            .get_mut(index)
            .filter(|agent| agent.active)
            .ok_or(CrowdError::BadAgentIndex(index))?;

        agent.target_ref = PolyRef::NONE;
        agent.target_pos = velocity;
        agent.target_replan = false;
        agent.target_state = MoveRequestState::Velocity;

        Ok(())
    }

    /// The universal cancel: any pending request or queue slot is dropped,
    /// the agent keeps coasting on its current corridor.
    pub fn reset_move_target(&mut self, index: usize) -> Result<(), CrowdError> {
        let agent = self
            .agents
            .get_mut(index)
            .filter(|agent| agent.active)
            .ok_or(CrowdError::BadAgentIndex(index))?;

        if let Some(handle) = agent.target_path_queue.take() {
            self.path_queue.cancel(handle);
        }

        agent.target_ref = PolyRef::NONE;
        agent.target_pos = Vec3::ZERO;
        agent.desired_velocity = Vec3::ZERO;
        agent.target_replan = false;
        agent.target_state = MoveRequestState::None;

        Ok(())
    }

    /// Replan variant of the move request; the next quick search biases
    /// toward reusing the current corridor.
    fn request_move_target_replan(&mut self, index: usize, reference: PolyRef, position: Vec3) {
        let agent = &mut self.agents[index];

        agent.target_ref = reference;
        agent.target_pos = position;
        agent.target_path_queue = None;
        agent.target_replan = true;
        agent.target_state = if reference.is_none() {
            MoveRequestState::Failed
        } else {
            MoveRequestState::Requesting
        };
    }

    fn filter_of(&self, agent: &CrowdAgent) -> &StandardFilter {
        &self.filters[agent.params.query_filter_type as usize % CROWD_MAX_QUERY_FILTERS]
    }

    // --- The tick -----------------------------------------------------------

    /// Advances the simulation by `dt` seconds.
    pub fn update(&mut self, dt: f32, mesh: &NavMesh) {
        self.velocity_sample_count = 0;

        self.check_path_validity(dt, mesh);
        self.update_move_requests(mesh);
        self.update_topology_optimization(dt, mesh);

        // Rebuild the proximity grid.
        self.grid.clear();
        for (index, agent) in self.agents.iter().enumerate() {
            if !agent.active || agent.state != AgentState::Walking {
                continue;
            }
            let r = agent.params.radius;
            self.grid.add(
                index as u16,
                agent.position.xz() - Vec2::splat(r),
                agent.position.xz() + Vec2::splat(r),
            );
        }

        self.refresh_neighbours_and_boundaries(mesh);
        self.find_corners_and_optimize(mesh);
        self.trigger_off_mesh_connections(mesh);
        self.compute_desired_velocities();
        self.sample_safe_velocities();

        // Integrate with the acceleration clamp.
        for agent in self.agents.iter_mut() {
            if !agent.active || agent.state != AgentState::Walking {
                continue;
            }
            integrate(agent, dt);
        }

        self.resolve_collisions();
        self.reproject_onto_mesh(mesh);
        self.update_off_mesh_animations(dt);
    }

    /// Step 1: relocate agents & targets whose polygons went stale, and
    /// decide who needs a replan.
    fn check_path_validity(&mut self, dt: f32, mesh: &NavMesh) {
        for index in 0..self.agents.len() {
            if !self.agents[index].active || self.agents[index].state != AgentState::Walking {
                continue;
            }

            self.agents[index].target_replan_time += dt;
            let mut replan = false;

            // The agent's own polygon first.
            let filter = self.filter_of(&self.agents[index]).clone();
            let mut agent_ref = self.agents[index].corridor.first_poly();
            let mut agent_pos = self.agents[index].position;

            if !self.query.is_valid_poly_ref(mesh, agent_ref, &filter) {
                let (new_ref, nearest) = self
                    .query
                    .find_nearest_poly(mesh, agent_pos, self.placement_extents, &filter)
                    .unwrap_or((PolyRef::NONE, agent_pos));
                agent_ref = new_ref;
                agent_pos = nearest;

                if agent_ref.is_none() {
                    // Off the mesh entirely; park the agent until re-added.
                    let agent = &mut self.agents[index];
                    agent.corridor.reset(PolyRef::NONE, agent_pos);
                    agent.partial = false;
                    agent.boundary.reset();
                    agent.state = AgentState::Invalid;
                    continue;
                }

                let agent = &mut self.agents[index];
                agent.corridor.fix_path_start(agent_ref, agent_pos);
                agent.boundary.reset();
                agent.position = agent_pos;
                replan = true;
            }

            let target_state = self.agents[index].target_state;
            if matches!(
                target_state,
                MoveRequestState::None | MoveRequestState::Velocity
            ) {
                continue;
            }

            // Then the target polygon.
            if !matches!(target_state, MoveRequestState::Failed) {
                let target_ref = self.agents[index].target_ref;
                if !self.query.is_valid_poly_ref(mesh, target_ref, &filter) {
                    let target_pos = self.agents[index].target_pos;
                    let (new_ref, nearest) = self
                        .query
                        .find_nearest_poly(mesh, target_pos, self.placement_extents, &filter)
                        .unwrap_or((PolyRef::NONE, target_pos));

                    let agent = &mut self.agents[index];
                    agent.target_ref = new_ref;
                    agent.target_pos = nearest;
                    replan = true;
                }

                if self.agents[index].target_ref.is_none() {
                    // No way to recover the target; drop the request.
                    let agent = &mut self.agents[index];
                    agent.corridor.reset(agent_ref, agent_pos);
                    agent.partial = false;
                    agent.target_state = MoveRequestState::None;
                }
            }

            if !self
                .agents[index]
                .corridor
                .is_valid(CHECK_LOOKAHEAD, &self.query, mesh, &filter)
            {
                replan = true;
            }

            // A valid target whose corridor runs short gets replanned once
            // the delay passes.
            if self.agents[index].target_state == MoveRequestState::Valid
                && self.agents[index].target_replan_time > TARGET_REPLAN_DELAY
                && self.agents[index].corridor.len() < CHECK_LOOKAHEAD
                && self.agents[index].corridor.last_poly() != self.agents[index].target_ref
            {
                replan = true;
            }

            if replan && self.agents[index].target_state != MoveRequestState::None {
                let target_ref = self.agents[index].target_ref;
                let target_pos = self.agents[index].target_pos;
                self.request_move_target_replan(index, target_ref, target_pos);
            }
        }
    }

    /// Step 2: drive the request state machine & the path queue.
    fn update_move_requests(&mut self, mesh: &NavMesh) {
        let mut queue: SmallVec<[usize; MAX_PATH_QUEUE_AGENTS]> = SmallVec::new();

        for index in 0..self.agents.len() {
            if !self.agents[index].active || self.agents[index].state == AgentState::Invalid {
                continue;
            }

            if self.agents[index].target_state == MoveRequestState::Requesting {
                self.run_quick_search(index, mesh);
            }

            if self.agents[index].target_state == MoveRequestState::WaitingForQueue {
                insert_by_replan_time(&mut queue, &self.agents, index, MAX_PATH_QUEUE_AGENTS);
            }
        }

        for &index in queue.iter() {
            let agent = &self.agents[index];
            let filter = self.filter_of(agent).clone();

            let handle = self.path_queue.request(
                agent.corridor.last_poly(),
                agent.target_ref,
                agent.corridor.target(),
                agent.target_pos,
                filter,
            );

            let agent = &mut self.agents[index];
            if let Some(handle) = handle {
                agent.target_path_queue = Some(handle);
                agent.target_state = MoveRequestState::WaitingForPath;
            }
            // Queue saturated: stay in WaitingForQueue & retry next tick.
        }

        self.path_queue.update(mesh, MAX_ITERS_PER_UPDATE);

        // Poll outstanding requests.
        for index in 0..self.agents.len() {
            if !self.agents[index].active
                || self.agents[index].target_state != MoveRequestState::WaitingForPath
            {
                continue;
            }

            let Some(handle) = self.agents[index].target_path_queue else {
                continue;
            };

            match self.path_queue.status(handle) {
                None | Some(PathRequestStatus::Failed) => {
                    // Retry while the target is still standing.
                    let agent = &mut self.agents[index];
                    agent.target_path_queue = None;
                    agent.target_state = if agent.target_ref.is_none() {
                        MoveRequestState::Failed
                    } else {
                        MoveRequestState::Requesting
                    };
                    agent.target_replan_time = 0.0;
                }
                Some(PathRequestStatus::Succeeded) => {
                    self.apply_path_result(index, handle, mesh);
                }
                Some(PathRequestStatus::Pending) => {}
            }
        }
    }

    /// Short synchronous search run when a request first arrives; the
    /// result becomes the corridor prefix while the full search queues.
    fn run_quick_search(&mut self, index: usize, mesh: &NavMesh) {
        let filter = self.filter_of(&self.agents[index]).clone();

        let agent = &self.agents[index];
        let start_ref = agent.corridor.first_poly();
        let start_pos = agent.position;
        let target_ref = agent.target_ref;
        let target_pos = agent.target_pos;
        let replan = agent.target_replan;
        let existing: Vec<PolyRef> = agent.corridor.path().to_vec();

        let mut request_path = match self
            .query
            .init_sliced_find_path(mesh, start_ref, target_ref, start_pos, target_pos)
        {
            Ok(_) => {
                self.query
                    .update_sliced_find_path(mesh, &filter, QUICK_SEARCH_ITERS);
                let finalized = if replan && !existing.is_empty() {
                    // Bias toward the standing corridor during replans.
                    self.query.finalize_sliced_find_path_partial(&existing)
                } else {
                    self.query.finalize_sliced_find_path()
                };
                finalized.map(|path| path.polys).unwrap_or_default()
            }
            Err(_) => Vec::new(),
        };

        let mut request_pos = target_pos;
        if let Some(&last) = request_path.last() {
            if last != target_ref {
                // Partial lead: clamp the interim target into it.
                match self.query.closest_point_on_poly(mesh, last, target_pos) {
                    Ok((nearest, _)) => request_pos = nearest,
                    Err(_) => request_path.clear(),
                }
            }
        }

        if request_path.is_empty() {
            request_path.push(start_ref);
            request_pos = start_pos;
        }

        let reached = *request_path.last().expect("non-empty by construction") == target_ref;

        let agent = &mut self.agents[index];
        agent.corridor.set_corridor(request_pos, &request_path);
        agent.boundary.reset();
        agent.partial = false;

        if reached {
            agent.target_state = MoveRequestState::Valid;
            agent.target_replan_time = 0.0;
        } else {
            // Goal not yet connected; hand over to the queue.
            agent.target_state = MoveRequestState::WaitingForQueue;
        }
    }

    /// Splices a finished queue result onto the corridor prefix.
    fn apply_path_result(&mut self, index: usize, handle: PathQueueHandle, mesh: &NavMesh) {
        let Some(result) = self.path_queue.take_result(handle) else {
            let agent = &mut self.agents[index];
            agent.target_path_queue = None;
            agent.target_state = MoveRequestState::Failed;
            agent.target_replan_time = 0.0;
            return;
        };

        let partial = result.flags.contains(PathFlags::PARTIAL);
        let mut path = result.polys;
        let mut valid = !path.is_empty();

        let agent = &self.agents[index];
        let prefix: Vec<PolyRef> = agent.corridor.path().to_vec();
        let target_ref = agent.target_ref;
        let mut target_pos = agent.target_pos;

        // The request was issued from the prefix's tail; a mismatched
        // boundary means the world moved under us. Reject the merge.
        if valid && prefix.last() != path.first() {
            valid = false;
        }

        if valid {
            if prefix.len() > 1 {
                let mut merged = prefix[..prefix.len() - 1].to_vec();
                merged.extend_from_slice(&path);
                remove_trackbacks(&mut merged);
                merged.truncate(MAX_CORRIDOR_POLYS);
                path = merged;
            }

            if let Some(&last) = path.last() {
                if last != target_ref {
                    match self.query.closest_point_on_poly(mesh, last, target_pos) {
                        Ok((nearest, _)) => target_pos = nearest,
                        Err(_) => valid = false,
                    }
                }
            }
        }

        let agent = &mut self.agents[index];
        agent.target_path_queue = None;

        if valid {
            agent.corridor.set_corridor(target_pos, &path);
            agent.boundary.reset();
            agent.partial = partial;
            agent.target_state = MoveRequestState::Valid;
        } else {
            agent.target_state = MoveRequestState::Failed;
        }
        agent.target_replan_time = 0.0;
    }

    /// Step 3: one corridor per tick gets a topology pass, longest-starved
    /// first.
    fn update_topology_optimization(&mut self, dt: f32, mesh: &NavMesh) {
        let mut queue: SmallVec<[usize; MAX_TOPOLOGY_OPT_AGENTS]> = SmallVec::new();

        for index in 0..self.agents.len() {
            let agent = &mut self.agents[index];
            if !agent.active || agent.state != AgentState::Walking {
                continue;
            }
            if matches!(
                agent.target_state,
                MoveRequestState::None | MoveRequestState::Velocity
            ) {
                continue;
            }
            if !agent
                .params
                .update_flags
                .contains(UpdateFlags::OPTIMIZE_TOPOLOGY)
            {
                continue;
            }

            agent.topology_opt_time += dt;
            if agent.topology_opt_time >= OPT_TIME_THRESHOLD {
                insert_by_topology_time(&mut queue, &self.agents, index, MAX_TOPOLOGY_OPT_AGENTS);
            }
        }

        for &index in queue.iter() {
            let filter = self.filter_of(&self.agents[index]).clone();
            let agent = &mut self.agents[index];
            agent
                .corridor
                .optimize_path_topology(&mut self.query, mesh, &filter);
            agent.topology_opt_time = 0.0;
        }
    }

    /// Step 5: neighbour lists & boundary caches.
    fn refresh_neighbours_and_boundaries(&mut self, mesh: &NavMesh) {
        for index in 0..self.agents.len() {
            if !self.agents[index].active || self.agents[index].state != AgentState::Walking {
                continue;
            }

            let filter = self.filter_of(&self.agents[index]).clone();

            // Refresh the boundary when the agent drifted from the cached
            // center or a sourcing polygon disappeared.
            let position = self.agents[index].position;
            let range = self.agents[index].params.collision_query_range;
            let update_threshold = range * 0.25;

            let needs_update = {
                let agent = &self.agents[index];
                agent
                    .boundary
                    .center()
                    .xz()
                    .distance_squared(position.xz())
                    > update_threshold * update_threshold
                    || !agent.boundary.is_valid(&self.query, mesh, &filter)
            };
            if needs_update {
                let first_poly = self.agents[index].corridor.first_poly();
                let mut boundary = std::mem::take(&mut self.agents[index].boundary);
                boundary.update(first_poly, position, range, &mut self.query, mesh, &filter);
                self.agents[index].boundary = boundary;
            }

            self.collect_neighbours(index);
        }
    }

    /// Proximity-grid lookup, filtered by height overlap & range, kept
    /// sorted by distance with the nearest [AGENT_MAX_NEIGHBOURS] retained.
    fn collect_neighbours(&mut self, index: usize) {
        let position = self.agents[index].position;
        let height = self.agents[index].params.height;
        let range = self.agents[index].params.collision_query_range;

        let mut ids = Vec::with_capacity(32);
        self.grid.query(
            position.xz() - Vec2::splat(range),
            position.xz() + Vec2::splat(range),
            &mut ids,
            32,
        );

        let mut neighbours: SmallVec<[AgentNeighbour; AGENT_MAX_NEIGHBOURS]> = SmallVec::new();

        for id in ids {
            let other_index = id as usize;
            if other_index == index {
                continue;
            }

            let other = &self.agents[other_index];
            if !other.active {
                continue;
            }

            let difference = position - other.position;
            if difference.y.abs() >= (height + other.params.height) / 2.0 {
                continue;
            }
            let distance_sqr = difference.xz().length_squared();
            if distance_sqr > range * range {
                continue;
            }

            insert_neighbour(&mut neighbours, other_index, distance_sqr);
        }

        self.agents[index].neighbours = neighbours;
    }

    /// Step 6: steering corners, plus the visibility shortcut toward the
    /// second corner.
    fn find_corners_and_optimize(&mut self, mesh: &NavMesh) {
        for index in 0..self.agents.len() {
            {
                let agent = &self.agents[index];
                if !agent.active || agent.state != AgentState::Walking {
                    continue;
                }
                if matches!(
                    agent.target_state,
                    MoveRequestState::None | MoveRequestState::Velocity
                ) {
                    continue;
                }
            }

            let filter = self.filter_of(&self.agents[index]).clone();

            let straight =
                self.agents[index]
                    .corridor
                    .find_corners(AGENT_MAX_CORNERS, &self.query, mesh);
            self.agents[index].corners = straight.points;

            let optimize = self.agents[index]
                .params
                .update_flags
                .contains(UpdateFlags::OPTIMIZE_VISIBILITY)
                && !self.agents[index].corners.is_empty();
            if optimize {
                // Aim past the immediate corner when one exists.
                let corner_index = 1.min(self.agents[index].corners.len() - 1);
                let target = self.agents[index].corners[corner_index].position;
                let range = self.agents[index].params.path_optimization_range;

                let mut corridor = std::mem::take(&mut self.agents[index].corridor);
                corridor.optimize_path_visibility(target, range, &mut self.query, mesh, &filter);
                self.agents[index].corridor = corridor;
            }
        }
    }

    /// Step 7: agents close enough to an off-mesh corner jump onto the
    /// connection & start animating.
    fn trigger_off_mesh_connections(&mut self, mesh: &NavMesh) {
        for index in 0..self.agents.len() {
            {
                let agent = &self.agents[index];
                if !agent.active || agent.state != AgentState::Walking {
                    continue;
                }
                if matches!(
                    agent.target_state,
                    MoveRequestState::None | MoveRequestState::Velocity
                ) {
                    continue;
                }
            }

            let trigger_radius = self.agents[index].params.radius * 2.25;
            if !over_off_mesh_connection(&self.agents[index], trigger_radius) {
                continue;
            }

            let connection_ref = self.agents[index]
                .corners
                .last()
                .map(|corner| corner.reference)
                .unwrap_or(PolyRef::NONE);

            let init_pos = self.agents[index].position;
            let max_speed = self.agents[index].params.max_speed;

            let mut corridor = std::mem::take(&mut self.agents[index].corridor);
            let jump = corridor.move_over_off_mesh_connection(connection_ref, mesh);
            self.agents[index].corridor = corridor;

            if let Some((_, start, end)) = jump {
                let agent = &mut self.agents[index];
                agent.animation = AgentAnimation {
                    active: true,
                    init_pos,
                    start_pos: start,
                    end_pos: end,
                    poly_ref: connection_ref,
                    t: 0.0,
                    t_max: (start.xz().distance(end.xz()) / max_speed) * 0.5,
                };
                agent.state = AgentState::OffMesh;
                agent.corners.clear();
                agent.neighbours.clear();
            }
        }
    }

    /// Step 8 & 9: corner steering with end-of-path slowdown, plus the
    /// separation force.
    fn compute_desired_velocities(&mut self) {
        for index in 0..self.agents.len() {
            {
                let agent = &self.agents[index];
                if !agent.active
                    || agent.state != AgentState::Walking
                    || agent.target_state == MoveRequestState::None
                {
                    continue;
                }
            }

            let mut desired;
            if self.agents[index].target_state == MoveRequestState::Velocity {
                desired = self.agents[index].target_pos;
                self.agents[index].desired_speed = desired.length();
            } else {
                let agent = &self.agents[index];
                desired = if agent
                    .params
                    .update_flags
                    .contains(UpdateFlags::ANTICIPATE_TURNS)
                {
                    smooth_steer_direction(agent)
                } else {
                    straight_steer_direction(agent)
                };

                // Slow down toward the end of the path.
                let slow_down_radius = agent.params.radius * 2.0;
                let speed_scale = agent.distance_to_goal(slow_down_radius) / slow_down_radius;

                self.agents[index].desired_speed = self.agents[index].params.max_speed;
                desired *= self.agents[index].desired_speed * speed_scale;
            }

            // Separation from nearby agents.
            if self.agents[index]
                .params
                .update_flags
                .contains(UpdateFlags::SEPARATION)
            {
                let agent = &self.agents[index];
                let separation_dist = agent.params.collision_query_range;
                let inv_separation_dist = 1.0 / separation_dist;
                let separation_weight = agent.params.separation_weight;

                let mut weight = 0.0f32;
                let mut displacement = Vec3::ZERO;

                for neighbour in agent.neighbours.iter() {
                    let other = &self.agents[neighbour.index];

                    let mut difference = agent.position - other.position;
                    difference.y = 0.0;

                    let distance_sqr = difference.length_squared();
                    if distance_sqr < 0.00001 {
                        continue;
                    }
                    if distance_sqr > separation_dist * separation_dist {
                        continue;
                    }

                    let distance = distance_sqr.sqrt();
                    let falloff = separation_weight
                        * (1.0 - (distance * inv_separation_dist) * (distance * inv_separation_dist));

                    displacement += difference * (falloff / distance);
                    weight += 1.0;
                }

                if weight > 0.0001 {
                    desired += displacement * (1.0 / weight);

                    // Clamp back to the desired speed.
                    let speed_sqr = desired.length_squared();
                    let desired_sqr = self.agents[index].desired_speed
                        * self.agents[index].desired_speed;
                    if speed_sqr > desired_sqr && speed_sqr > 0.0 {
                        desired *= desired_sqr / speed_sqr;
                    }
                }
            }

            self.agents[index].desired_velocity = desired;
        }
    }

    /// Step 10: velocity-space avoidance against neighbours & walls.
    fn sample_safe_velocities(&mut self) {
        for index in 0..self.agents.len() {
            {
                let agent = &self.agents[index];
                if !agent.active || agent.state != AgentState::Walking {
                    continue;
                }
            }

            if !self.agents[index]
                .params
                .update_flags
                .contains(UpdateFlags::OBSTACLE_AVOIDANCE)
            {
                let agent = &mut self.agents[index];
                agent.adjusted_velocity = agent.desired_velocity;
                continue;
            }

            self.obstacle_query.reset();

            let position = self.agents[index].position;

            for neighbour_index in 0..self.agents[index].neighbours.len() {
                let other = &self.agents[self.agents[index].neighbours[neighbour_index].index];
                self.obstacle_query.add_circle(
                    other.position,
                    other.params.radius,
                    other.velocity,
                    other.desired_velocity,
                );
            }

            for segment in self.agents[index].boundary.segments() {
                // Back-facing walls cannot be hit.
                if crate::math::triangle_area_2d(position, segment.start, segment.end) < 0.0 {
                    continue;
                }
                self.obstacle_query.add_segment(segment.start, segment.end);
            }

            let agent = &self.agents[index];
            let params = self.avoidance_params
                [agent.params.obstacle_avoidance_type as usize % CROWD_MAX_AVOIDANCE_PARAMS];

            let (velocity, samples) = self.obstacle_query.sample_velocity_adaptive(
                agent.position,
                agent.params.radius,
                agent.params.max_speed,
                agent.velocity,
                agent.desired_velocity,
                &params,
            );

            self.agents[index].adjusted_velocity = velocity;
            self.velocity_sample_count += samples;
        }
    }

    /// Step 12: iterative pair-wise overlap correction.
    fn resolve_collisions(&mut self) {
        let count = self.agents.len();
        let mut displacements = vec![Vec3::ZERO; count];

        for _ in 0..COLLISION_RESOLVE_ITERATIONS {
            for (index, displacement) in displacements.iter_mut().enumerate() {
                *displacement = Vec3::ZERO;

                let agent = &self.agents[index];
                if !agent.active || agent.state != AgentState::Walking {
                    continue;
                }

                let mut weight = 0.0f32;
                let mut accumulated = Vec3::ZERO;

                for neighbour in agent.neighbours.iter() {
                    let other = &self.agents[neighbour.index];

                    let mut difference = agent.position - other.position;
                    difference.y = 0.0;

                    let combined_radius = agent.params.radius + other.params.radius;
                    let distance_sqr = difference.length_squared();
                    if distance_sqr > combined_radius * combined_radius {
                        continue;
                    }

                    let distance = distance_sqr.sqrt();
                    let mut penetration = combined_radius - distance;
                    if distance < 0.0001 {
                        // Exactly coincident: diverge along a tangent picked
                        // by the lower-indexed agent's desired velocity.
                        difference = if index > neighbour.index {
                            Vec3::new(-agent.desired_velocity.z, 0.0, agent.desired_velocity.x)
                        } else {
                            Vec3::new(agent.desired_velocity.z, 0.0, -agent.desired_velocity.x)
                        };
                        penetration = 0.01;
                    } else {
                        penetration =
                            (1.0 / distance) * (penetration * 0.5) * COLLISION_RESOLVE_FACTOR;
                    }

                    accumulated += difference * penetration;
                    weight += 1.0;
                }

                if weight > 0.0001 {
                    *displacement = accumulated * (1.0 / weight);
                }
            }

            for (index, displacement) in displacements.iter().enumerate() {
                let agent = &mut self.agents[index];
                if agent.active && agent.state == AgentState::Walking {
                    agent.displacement = *displacement;
                    agent.position += *displacement;
                }
            }
        }
    }

    /// Step 13: slide each agent back onto the mesh through its corridor.
    fn reproject_onto_mesh(&mut self, mesh: &NavMesh) {
        for index in 0..self.agents.len() {
            {
                let agent = &self.agents[index];
                if !agent.active || agent.state != AgentState::Walking {
                    continue;
                }
            }

            let filter = self.filter_of(&self.agents[index]).clone();
            let position = self.agents[index].position;

            let mut corridor = std::mem::take(&mut self.agents[index].corridor);
            corridor.move_position(position, &mut self.query, mesh, &filter);
            self.agents[index].position = corridor.position();

            // Without a path request the corridor stays a single polygon.
            if matches!(
                self.agents[index].target_state,
                MoveRequestState::None | MoveRequestState::Velocity
            ) {
                let first = corridor.first_poly();
                let position = self.agents[index].position;
                corridor.reset(first, position);
                self.agents[index].partial = false;
            }

            self.agents[index].corridor = corridor;
        }
    }

    /// Step 14: advance off-mesh traversal animations.
    fn update_off_mesh_animations(&mut self, dt: f32) {
        for agent in self.agents.iter_mut() {
            if !agent.active || !agent.animation.active {
                continue;
            }

            agent.animation.t += dt;
            if agent.animation.t > agent.animation.t_max {
                // Landed; hand control back to the steering pipeline.
                agent.animation.active = false;
                agent.state = AgentState::Walking;
                continue;
            }

            let anim = &agent.animation;
            let ramp_end = anim.t_max * 0.15;
            agent.position = if anim.t < ramp_end {
                let u = tween(anim.t, 0.0, ramp_end);
                anim.init_pos.lerp(anim.start_pos, u)
            } else {
                let u = tween(anim.t, ramp_end, anim.t_max);
                anim.start_pos.lerp(anim.end_pos, u)
            };

            agent.velocity = Vec3::ZERO;
            agent.desired_velocity = Vec3::ZERO;
        }
    }
}

fn default_avoidance_presets() -> [ObstacleAvoidanceParams; CROWD_MAX_AVOIDANCE_PARAMS] {
    let base = ObstacleAvoidanceParams::default();

    // Presets 0..3 trade quality for samples; the rest stay at the default.
    let mut presets = [base; CROWD_MAX_AVOIDANCE_PARAMS];
    presets[0] = ObstacleAvoidanceParams {
        velocity_bias: 0.5,
        adaptive_divs: 5,
        adaptive_rings: 2,
        adaptive_depth: 1,
        ..base
    };
    presets[1] = ObstacleAvoidanceParams {
        velocity_bias: 0.5,
        adaptive_divs: 5,
        adaptive_rings: 2,
        adaptive_depth: 2,
        ..base
    };
    presets[2] = ObstacleAvoidanceParams {
        velocity_bias: 0.5,
        adaptive_divs: 7,
        adaptive_rings: 2,
        adaptive_depth: 3,
        ..base
    };
    presets[3] = ObstacleAvoidanceParams {
        velocity_bias: 0.5,
        adaptive_divs: 7,
        adaptive_rings: 3,
        adaptive_depth: 3,
        ..base
    };

    presets
}

/// Normalized 0..1 ramp of `t` between `t0` & `t1`.
#[inline]
fn tween(t: f32, t0: f32, t1: f32) -> f32 {
    if (t1 - t0).abs() < 1e-6 {
        1.0
    } else {
        ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
    }
}

/// Acceleration-clamped velocity integration.
fn integrate(agent: &mut CrowdAgent, dt: f32) {
    let max_delta = agent.params.max_acceleration * dt;
    let mut dv = agent.adjusted_velocity - agent.velocity;
    let ds = dv.length();
    if ds > max_delta && ds > 0.0 {
        dv *= max_delta / ds;
    }
    agent.velocity += dv;

    if agent.velocity.length() > 0.0001 {
        agent.position += agent.velocity * dt;
    } else {
        agent.velocity = Vec3::ZERO;
    }
}

/// Direction blending the first two corners, so turns are anticipated.
fn smooth_steer_direction(agent: &CrowdAgent) -> Vec3 {
    if agent.corners.is_empty() {
        return Vec3::ZERO;
    }

    let p0 = agent.corners[0].position;
    let p1 = agent.corners[1.min(agent.corners.len() - 1)].position;

    let mut dir0 = p0 - agent.position;
    let mut dir1 = p1 - agent.position;
    dir0.y = 0.0;
    dir1.y = 0.0;

    let len0 = dir0.length();
    let len1 = dir1.length();
    if len1 > 0.001 {
        dir1 /= len1;
    }

    Vec3::new(dir0.x - dir1.x * len0 * 0.5, 0.0, dir0.z - dir1.z * len0 * 0.5).normalize_or_zero()
}

/// Straight shot at the next corner.
fn straight_steer_direction(agent: &CrowdAgent) -> Vec3 {
    let Some(corner) = agent.corners.first() else {
        return Vec3::ZERO;
    };

    let mut direction = corner.position - agent.position;
    direction.y = 0.0;
    direction.normalize_or_zero()
}

/// Whether the agent stands within `radius` of an off-mesh connection
/// corner.
fn over_off_mesh_connection(agent: &CrowdAgent, radius: f32) -> bool {
    let Some(last) = agent.corners.last() else {
        return false;
    };
    if !last.flags.contains(StraightPathFlags::OFF_MESH_CONNECTION) {
        return false;
    }

    agent.position.xz().distance_squared(last.position.xz()) < radius * radius
}

/// Keeps the neighbour list sorted ascending by distance, capped.
fn insert_neighbour(
    neighbours: &mut SmallVec<[AgentNeighbour; AGENT_MAX_NEIGHBOURS]>,
    index: usize,
    distance_sqr: f32,
) {
    let position = neighbours
        .iter()
        .position(|neighbour| distance_sqr < neighbour.distance_sqr)
        .unwrap_or(neighbours.len());

    if position >= AGENT_MAX_NEIGHBOURS {
        return;
    }

    if neighbours.len() == AGENT_MAX_NEIGHBOURS {
        neighbours.pop();
    }
    neighbours.insert(
        position,
        AgentNeighbour {
            index,
            distance_sqr,
        },
    );
}

/// Path-queue intake, sorted by longest replan wait first.
fn insert_by_replan_time(
    queue: &mut SmallVec<[usize; MAX_PATH_QUEUE_AGENTS]>,
    agents: &[CrowdAgent],
    index: usize,
    cap: usize,
) {
    let time = agents[index].target_replan_time;
    let position = queue
        .iter()
        .position(|&other| time > agents[other].target_replan_time)
        .unwrap_or(queue.len());

    if position >= cap {
        return;
    }
    if queue.len() == cap {
        queue.pop();
    }
    queue.insert(position, index);
}

/// Topology-optimization intake, longest elapsed time first.
fn insert_by_topology_time(
    queue: &mut SmallVec<[usize; MAX_TOPOLOGY_OPT_AGENTS]>,
    agents: &[CrowdAgent],
    index: usize,
    cap: usize,
) {
    let time = agents[index].topology_opt_time;
    let position = queue
        .iter()
        .position(|&other| time > agents[other].topology_opt_time)
        .unwrap_or(queue.len());

    if position >= cap {
        return;
    }
    if queue.len() == cap {
        queue.pop();
    }
    queue.insert(position, index);
}

/// Removes immediate A-B-A patterns from a spliced path.
fn remove_trackbacks(path: &mut Vec<PolyRef>) {
    let mut i = 0;
    while i + 2 < path.len() {
        if path[i] == path[i + 2] {
            path.drain(i..i + 2);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbour_insertion_writes_index_and_distance() {
        let mut neighbours: SmallVec<[AgentNeighbour; AGENT_MAX_NEIGHBOURS]> = SmallVec::new();

        insert_neighbour(&mut neighbours, 3, 4.0);
        insert_neighbour(&mut neighbours, 1, 1.0);
        insert_neighbour(&mut neighbours, 2, 2.0);

        assert_eq!(neighbours[0].index, 1);
        assert!((neighbours[0].distance_sqr - 1.0).abs() < f32::EPSILON);
        assert_eq!(neighbours[1].index, 2);
        assert_eq!(neighbours[2].index, 3);
    }

    #[test]
    fn neighbour_list_keeps_the_nearest_six() {
        let mut neighbours: SmallVec<[AgentNeighbour; AGENT_MAX_NEIGHBOURS]> = SmallVec::new();

        for i in 0..10 {
            insert_neighbour(&mut neighbours, i, 10.0 - i as f32);
        }

        assert_eq!(neighbours.len(), AGENT_MAX_NEIGHBOURS);
        for pair in neighbours.windows(2) {
            assert!(pair[0].distance_sqr <= pair[1].distance_sqr);
        }
    }

    #[test]
    fn integrate_respects_the_acceleration_clamp() {
        let mut agent = CrowdAgent {
            params: AgentParams {
                max_acceleration: 1.0,
                ..Default::default()
            },
            adjusted_velocity: Vec3::new(10.0, 0.0, 0.0),
            ..Default::default()
        };

        integrate(&mut agent, 0.1);

        // |dv| may not exceed max_acceleration * dt.
        assert!(agent.velocity.length() <= 1.0 * 0.1 + 1e-5);
    }

    #[test]
    fn pool_rejects_more_than_max_agents() {
        let crowd = Crowd::new(0, 0.5);
        assert!(matches!(crowd, Err(CrowdError::InvalidParam)));
    }

    #[test]
    fn replan_queue_orders_by_wait_time() {
        let mut agents = vec![CrowdAgent::default(); 3];
        agents[0].target_replan_time = 1.0;
        agents[1].target_replan_time = 5.0;
        agents[2].target_replan_time = 3.0;

        let mut queue: SmallVec<[usize; MAX_PATH_QUEUE_AGENTS]> = SmallVec::new();
        for index in 0..3 {
            insert_by_replan_time(&mut queue, &agents, index, MAX_PATH_QUEUE_AGENTS);
        }

        assert_eq!(queue.as_slice(), &[1, 2, 0]);
    }
}
