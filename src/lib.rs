//! Tiled **Runtime** Nav-mesh Querying & Crowd Simulation for 3D worlds in [Bevy].
//!
//! Takes in prebuilt navigation tiles (loaded from their binary form or
//! packed with [mesh::builder]) and answers point/polygon/path questions
//! against them, while a fixed-capacity crowd of agents is steered across
//! the mesh each tick: asynchronous-feeling path requests on a sliced-path
//! queue, local neighbour discovery, velocity-space obstacle avoidance and
//! iterative collision resolution, with the mesh as a hard constraint.
//!
//! ## Quick-start:
//! **Standalone (no ECS):**
//! 1. Build a [mesh::NavMesh] with [mesh::NavMeshParams] and feed it tiles
//!    via [mesh::NavMesh::add_tile] (see [mesh::builder::build_tile_data]
//!    or [mesh::TileData::from_bytes]).
//! 2. Create a [query::NavMeshQuery] for path & point queries.
//! 3. Create a [crowd::Crowd], [crowd::Crowd::add_agent] your agents,
//!    submit goals with [crowd::Crowd::request_move_target], then call
//!    [crowd::Crowd::update] once per simulation tick.
//!
//! **As a plugin:**
//! 1. Add [CohortNavigationPlugin] to your app.
//! 2. Insert your mesh through the [NavMesh] resource
//!    (``nav_mesh.set(mesh)``).
//! 3. Insert a [CrowdResource] sized for your scene; the plugin ticks it in
//!    [FixedUpdate] from the [Time] delta.
//!
//! *The crowd is single-threaded by design: one ``update`` call is one
//! critical section, and all the illusion of asynchrony comes from bounding
//! per-tick work on the path queue.*
//!
//! ## FAQ
//!
//! > Where does the navmesh come from? This crate doesn't voxelize anything.
//!
//! Generation is a separate concern. Bake tiles off-line with your pipeline
//! of choice and hand the binary tiles to [mesh::NavMesh::add_tile], or pack
//! polygon soup at runtime with [mesh::builder].
//!
//! > Can I query the mesh from an async task?
//!
//! Each [query::NavMeshQuery] owns its search state, so keep one query
//! object per context. The mesh itself is read-only during queries; wrap it
//! in the [NavMesh] resource's ``RwLock`` exactly like tile generation
//! plugins do.
//!
//! [Bevy]: https://crates.io/crates/bevy

use std::sync::{Arc, RwLock};

use bevy::prelude::*;

pub mod crowd;
mod math;
pub mod mesh;
pub mod query;

pub use crowd::{AgentParams, AgentState, Crowd, CrowdAgent, MoveRequestState, UpdateFlags};
pub use mesh::{NavMeshParams, PolyFlags, PolyRef, TileRef};
pub use query::{NavMeshQuery, PathFlags, StandardFilter, StraightPathFlags};

/// System sets containing the crate's systems.
#[derive(SystemSet, Debug, PartialEq, Eq, Hash, Clone)]
pub enum CohortNavigation {
    /// The crowd tick; runs in [FixedUpdate].
    Crowd,
}

pub struct CohortNavigationPlugin;

impl Plugin for CohortNavigationPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<NavMesh>();

        app.configure_sets(FixedUpdate, CohortNavigation::Crowd);

        app.add_systems(
            FixedUpdate,
            crowd_update_system
                .run_if(resource_exists::<CrowdResource>)
                .in_set(CohortNavigation::Crowd),
        );
    }
}

/// Wrapper around the nav-mesh data.
///
/// The underlying [mesh::NavMesh] must be retrieved using [NavMesh::get];
/// long-running readers (async path tasks) clone the [Arc] and lock.
#[derive(Default, Resource)]
pub struct NavMesh(Arc<RwLock<Option<mesh::NavMesh>>>);

impl NavMesh {
    pub fn get(&self) -> Arc<RwLock<Option<mesh::NavMesh>>> {
        self.0.clone()
    }

    /// Replaces the mesh wholesale.
    pub fn set(&self, nav_mesh: mesh::NavMesh) {
        if let Ok(mut guard) = self.0.write() {
            *guard = Some(nav_mesh);
        }
    }
}

/// The crowd simulator as a resource; insert one sized for your scene.
#[derive(Resource)]
pub struct CrowdResource(pub Crowd);

fn crowd_update_system(time: Res<Time>, nav_mesh: Res<NavMesh>, mut crowd: ResMut<CrowdResource>) {
    let dt = time.delta_secs();
    if dt <= 0.0 {
        return;
    }

    let nav_mesh = nav_mesh.get();
    let Ok(guard) = nav_mesh.read() else {
        error!("Nav-mesh lock has been poisoned. Crowd update skipped.");
        return;
    };

    let Some(nav_mesh) = guard.as_ref() else {
        return;
    };

    crowd.0.update(dt, nav_mesh);
}
