use bevy::prelude::Vec3;

use cohort_navigation::crowd::{AgentParams, AgentState, Crowd, MoveRequestState};
use cohort_navigation::query::{NavMeshQuery, StandardFilter};

mod common;

const EXTENTS: Vec3 = Vec3::new(1.0, 1.0, 1.0);
const DT: f32 = 0.1;

fn agent_params(radius: f32) -> AgentParams {
    AgentParams {
        radius,
        height: 2.0,
        max_acceleration: 8.0,
        max_speed: 3.5,
        collision_query_range: radius * 12.0,
        path_optimization_range: radius * 30.0,
        ..Default::default()
    }
}

#[test]
fn two_agents_push_each_other_apart() {
    let mesh = common::flat_mesh();
    let mut crowd = Crowd::new(4, 0.5).unwrap();
    let query = NavMeshQuery::new(512).unwrap();
    let filter = StandardFilter::default();

    let spawn = Vec3::new(10.0, 0.0, 10.0);
    let a = crowd.add_agent(spawn, agent_params(0.5), &mesh).unwrap();
    let b = crowd.add_agent(spawn, agent_params(0.5), &mesh).unwrap();

    let (target_ref, target_pos) = query
        .find_nearest_poly(&mesh, Vec3::new(11.0, 0.0, 10.0), EXTENTS, &filter)
        .unwrap();
    crowd.request_move_target(a, target_ref, target_pos).unwrap();
    crowd.request_move_target(b, target_ref, target_pos).unwrap();

    for _ in 0..20 {
        crowd.update(DT, &mesh);
    }

    let pos_a = crowd.agent(a).unwrap().position;
    let pos_b = crowd.agent(b).unwrap().position;

    // Collision resolution must have separated the overlapping pair by
    // (almost) the sum of their radii.
    let separation = pos_a.distance(pos_b);
    assert!(
        separation >= 1.0 - 0.1,
        "agents still overlap: separation {separation}"
    );
}

#[test]
fn collision_resolution_never_increases_overlap() {
    let mesh = common::flat_mesh();
    let mut crowd = Crowd::new(4, 0.5).unwrap();

    let a = crowd
        .add_agent(Vec3::new(10.0, 0.0, 10.0), agent_params(0.5), &mesh)
        .unwrap();
    let b = crowd
        .add_agent(Vec3::new(10.4, 0.0, 10.0), agent_params(0.5), &mesh)
        .unwrap();

    let mut previous_overlap = f32::MAX;
    for _ in 0..10 {
        crowd.update(DT, &mesh);

        let pos_a = crowd.agent(a).unwrap().position;
        let pos_b = crowd.agent(b).unwrap().position;
        let overlap = (1.0 - pos_a.distance(pos_b)).max(0.0);

        assert!(overlap <= previous_overlap + 1e-3);
        previous_overlap = overlap;
    }
}

#[test]
fn agent_reaches_its_target() {
    let mesh = common::flat_mesh();
    let mut crowd = Crowd::new(4, 0.5).unwrap();
    let query = NavMeshQuery::new(512).unwrap();
    let filter = StandardFilter::default();

    let index = crowd
        .add_agent(Vec3::new(5.0, 0.0, 5.0), agent_params(0.5), &mesh)
        .unwrap();

    let goal = Vec3::new(20.0, 0.0, 12.0);
    let (target_ref, target_pos) = query
        .find_nearest_poly(&mesh, goal, EXTENTS, &filter)
        .unwrap();
    crowd.request_move_target(index, target_ref, target_pos).unwrap();

    for _ in 0..200 {
        crowd.update(DT, &mesh);
    }

    let agent = crowd.agent(index).unwrap();
    assert_eq!(agent.target_state, MoveRequestState::Valid);
    assert!(
        agent.position.distance(target_pos) < 1.0,
        "agent stopped at {:?}",
        agent.position
    );
}

#[test]
fn velocity_clamp_holds_every_tick() {
    let mesh = common::flat_mesh();
    let mut crowd = Crowd::new(4, 0.5).unwrap();
    let query = NavMeshQuery::new(512).unwrap();
    let filter = StandardFilter::default();

    let params = agent_params(0.5);
    let max_accel = params.max_acceleration;
    let index = crowd
        .add_agent(Vec3::new(5.0, 0.0, 5.0), params, &mesh)
        .unwrap();

    let (target_ref, target_pos) = query
        .find_nearest_poly(&mesh, Vec3::new(50.0, 0.0, 50.0), EXTENTS, &filter)
        .unwrap();
    crowd.request_move_target(index, target_ref, target_pos).unwrap();

    let mut previous_velocity = Vec3::ZERO;
    for _ in 0..50 {
        crowd.update(DT, &mesh);

        let velocity = crowd.agent(index).unwrap().velocity;
        assert!(
            (velocity - previous_velocity).length() <= max_accel * DT + 1e-3,
            "velocity jumped"
        );
        previous_velocity = velocity;
    }
}

#[test]
fn velocity_controlled_agent_moves_and_stays_on_mesh() {
    let mesh = common::flat_mesh();
    let mut crowd = Crowd::new(4, 0.5).unwrap();

    let index = crowd
        .add_agent(Vec3::new(2.0, 0.0, 30.0), agent_params(0.5), &mesh)
        .unwrap();

    // Drive straight at the x = 0 boundary.
    crowd
        .request_move_velocity(index, Vec3::new(-2.0, 0.0, 0.0))
        .unwrap();

    for _ in 0..100 {
        crowd.update(DT, &mesh);
    }

    let agent = crowd.agent(index).unwrap();
    assert_eq!(agent.state, AgentState::Walking);
    // Constrained by the mesh: never escapes through the wall.
    assert!(agent.position.x >= -0.1);
    assert!(agent.position.x < 2.0);
}

#[test]
fn active_agents_tracks_the_pool() {
    let mesh = common::flat_mesh();
    let mut crowd = Crowd::new(3, 0.5).unwrap();

    assert!(crowd.active_agents().is_empty());

    let a = crowd
        .add_agent(Vec3::new(5.0, 0.0, 5.0), agent_params(0.5), &mesh)
        .unwrap();
    let b = crowd
        .add_agent(Vec3::new(8.0, 0.0, 5.0), agent_params(0.5), &mesh)
        .unwrap();
    let c = crowd
        .add_agent(Vec3::new(11.0, 0.0, 5.0), agent_params(0.5), &mesh)
        .unwrap();
    assert_eq!(crowd.active_agents(), vec![a, b, c]);

    // Pool is full now.
    assert!(crowd
        .add_agent(Vec3::new(14.0, 0.0, 5.0), agent_params(0.5), &mesh)
        .is_err());

    crowd.remove_agent(b).unwrap();
    assert_eq!(crowd.active_agents(), vec![a, c]);

    // The freed slot is reused.
    let d = crowd
        .add_agent(Vec3::new(20.0, 0.0, 5.0), agent_params(0.5), &mesh)
        .unwrap();
    assert_eq!(d, b);
}

#[test]
fn reset_move_target_stops_the_agent() {
    let mesh = common::flat_mesh();
    let mut crowd = Crowd::new(4, 0.5).unwrap();
    let query = NavMeshQuery::new(512).unwrap();
    let filter = StandardFilter::default();

    let index = crowd
        .add_agent(Vec3::new(5.0, 0.0, 5.0), agent_params(0.5), &mesh)
        .unwrap();

    let (target_ref, target_pos) = query
        .find_nearest_poly(&mesh, Vec3::new(50.0, 0.0, 50.0), EXTENTS, &filter)
        .unwrap();
    crowd.request_move_target(index, target_ref, target_pos).unwrap();

    for _ in 0..10 {
        crowd.update(DT, &mesh);
    }
    crowd.reset_move_target(index).unwrap();

    assert_eq!(
        crowd.agent(index).unwrap().target_state,
        MoveRequestState::None
    );

    // Deceleration under the acceleration clamp, then standstill.
    for _ in 0..50 {
        crowd.update(DT, &mesh);
    }
    assert!(crowd.agent(index).unwrap().velocity.length() < 0.01);
}

#[test]
fn failed_requests_leave_the_agent_simulated() {
    let mesh = common::flat_mesh();
    let mut crowd = Crowd::new(4, 0.5).unwrap();

    let index = crowd
        .add_agent(Vec3::new(5.0, 0.0, 5.0), agent_params(0.5), &mesh)
        .unwrap();

    // A null target reference fails immediately.
    crowd
        .request_move_target(index, cohort_navigation::PolyRef::NONE, Vec3::ZERO)
        .unwrap();
    crowd.update(DT, &mesh);

    let agent = crowd.agent(index).unwrap();
    assert_eq!(agent.target_state, MoveRequestState::Failed);
    assert_eq!(agent.state, AgentState::Walking);
    assert!(agent.desired_velocity.length() < 0.01);
}

#[test]
fn off_mesh_connection_traversal() {
    let mesh = common::island_mesh();
    let mut crowd = Crowd::new(2, 0.2).unwrap();
    let query = NavMeshQuery::new(512).unwrap();
    let filter = StandardFilter::default();

    let params = AgentParams {
        radius: 0.2,
        height: 1.0,
        max_speed: 2.0,
        max_acceleration: 8.0,
        collision_query_range: 2.4,
        path_optimization_range: 6.0,
        ..Default::default()
    };

    let index = crowd
        .add_agent(Vec3::new(0.3, 0.0, 0.3), params, &mesh)
        .unwrap();
    assert_eq!(crowd.agent(index).unwrap().state, AgentState::Walking);

    let goal = Vec3::new(5.0, 0.0, 5.0);
    let (target_ref, target_pos) = query
        .find_nearest_poly(&mesh, goal, Vec3::new(0.5, 0.5, 0.5), &filter)
        .unwrap();
    assert!(!target_ref.is_none());
    crowd.request_move_target(index, target_ref, target_pos).unwrap();

    let mut saw_off_mesh = false;
    let mut landed_after_jump = false;

    for _ in 0..400 {
        crowd.update(0.05, &mesh);

        match crowd.agent(index).unwrap().state {
            AgentState::OffMesh => saw_off_mesh = true,
            AgentState::Walking if saw_off_mesh => landed_after_jump = true,
            _ => {}
        }
        if landed_after_jump {
            break;
        }
    }

    assert!(saw_off_mesh, "agent never entered the off-mesh state");
    assert!(landed_after_jump, "agent never landed after the jump");

    // Give the agent a moment to settle on the island.
    for _ in 0..40 {
        crowd.update(0.05, &mesh);
    }

    let position = crowd.agent(index).unwrap().position;
    assert!(
        position.distance(goal) < 0.75,
        "agent ended at {position:?}"
    );
}
