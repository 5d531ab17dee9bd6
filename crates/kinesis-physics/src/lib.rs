//! Physics synchronization for the kinesis scene graph.
//!
//! [`PhysicsSystem`] keeps rigid bodies, colliders, character controllers and
//! vehicles attached to a [`Scene`] coherent with a rigid-body engine behind
//! the [`PhysicsBackend`] trait. [`RapierBackend`] drives Rapier 3D with one
//! asynchronous step in flight at a time.

use bevy_ecs::prelude::*;
use rapier3d::prelude::*;

use kinesis_scene::Scene;

mod backend;
mod collision_events;
mod drain;
mod error;
pub mod filter;
mod geometry_cache;
mod input_smoothing;
mod materials;
mod physics_debug;
mod rapier_backend;
mod rapier_controller;
mod sprung_mass;
mod step_worker;
mod sync;
mod system;
mod updates;
mod vehicle_sim;
mod vehicle_subsystem;

#[cfg(test)]
mod recording_backend;

pub use backend::{
    ActorHandle, ActorKind, ContactReport, ControllerDesc, ControllerHandle, ControllerMove,
    CookedMeshHandle, ForceMode, MaterialHandle, PhysicsBackend, Pose, RaycastHit, ShapeGeometry,
    ShapeHandle, SuspensionRay,
};
pub use collision_events::{CollisionEvent, CollisionEventCollector, ContactPoint};
pub use error::PhysicsError;
pub use filter::{FilterData, SurfaceRole};
pub use geometry_cache::{CookedKind, GeometryCache, GeometryKey};
pub use input_smoothing::{AnalogInputs, SmoothingRates, SteerVsSpeedTable};
pub use materials::MaterialTable;
pub use physics_debug::{COLORS, DebugLine, DebugLineBuffer, PhysicsDebugColors};
pub use rapier_backend::RapierBackend;
pub use sprung_mass::compute_sprung_masses;
pub use step_worker::{StepPoll, StepWorker};
pub use system::{ComponentHit, PhysicsSystem};
pub use vehicle_sim::{DriveState, WheelDynamics};
pub use vehicle_subsystem::{
    BuiltVehicle, BuiltWheel, DrivetrainKind, MAX_VEHICLES, MAX_WHEELS_PER_VEHICLE, VehicleState,
};

/// Default gravity, Z-up.
pub const DEFAULT_GRAVITY: [f32; 3] = [0.0, 0.0, -9.81];

// ---------------------------------------------------------------------------
// Rapier world
// ---------------------------------------------------------------------------

/// All Rapier simulation state, moved as one value between the scheduler
/// thread and the step worker.
pub struct PhysicsWorld {
    /// World-space gravity vector.
    pub gravity: Vector,
    /// Timestep and solver configuration.
    pub integration_parameters: IntegrationParameters,
    /// The main simulation pipeline.
    pub physics_pipeline: PhysicsPipeline,
    /// Tracks sleeping/awake body islands.
    pub island_manager: IslandManager,
    /// Broad-phase collision detection (also provides query pipeline).
    pub broad_phase: BroadPhaseBvh,
    /// Narrow-phase collision detection (contact manifolds).
    pub narrow_phase: NarrowPhase,
    /// All rigid bodies in the simulation.
    pub rigid_body_set: RigidBodySet,
    /// All colliders in the simulation.
    pub collider_set: ColliderSet,
    /// Impulse-based joints.
    pub impulse_joint_set: ImpulseJointSet,
    /// Multibody joints.
    pub multibody_joint_set: MultibodyJointSet,
    /// Continuous collision detection solver.
    pub ccd_solver: CCDSolver,
    /// Per-body angular speed limits, enforced after every step.
    pub max_angular_velocity: rustc_hash::FxHashMap<RigidBodyHandle, f32>,
}

impl PhysicsWorld {
    /// Creates an empty world with Z-up gravity `(0, 0, -9.81)`.
    pub fn new() -> Self {
        let [x, y, z] = DEFAULT_GRAVITY;
        Self {
            gravity: Vector::new(x, y, z),
            integration_parameters: IntegrationParameters::default(),
            physics_pipeline: PhysicsPipeline::new(),
            island_manager: IslandManager::new(),
            broad_phase: BroadPhaseBvh::new(),
            narrow_phase: NarrowPhase::new(),
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            max_angular_velocity: rustc_hash::FxHashMap::default(),
        }
    }

    /// Advances the simulation by `dt` seconds, running the collision
    /// filter on every contact pair. Forces queued before the step are
    /// consumed by it.
    pub fn step(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        self.integration_parameters.dt = dt;
        self.physics_pipeline.step(
            self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            &FilterHooks,
            &(),
        );

        for (&handle, &max) in &self.max_angular_velocity {
            if let Some(body) = self.rigid_body_set.get_mut(handle) {
                let av = body.angvel();
                let w = Vector::new(av.x, av.y, av.z);
                let speed = w.length();
                if speed > max && speed > 0.0 {
                    body.set_angvel(w * (max / speed), false);
                }
            }
        }
        for (_, body) in self.rigid_body_set.iter_mut() {
            if body.is_dynamic() {
                body.reset_forces(false);
                body.reset_torques(false);
            }
        }
    }

    /// Sets the world gravity vector.
    pub fn set_gravity(&mut self, x: f32, y: f32, z: f32) {
        self.gravity = Vector::new(x, y, z);
    }

    /// Returns the current gravity as `(x, y, z)`.
    pub fn gravity(&self) -> (f32, f32, f32) {
        (self.gravity.x, self.gravity.y, self.gravity.z)
    }
}

impl Default for PhysicsWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Contact-pair hook applying [`filter::pair_flags`] to the simulation
/// filter packed into each collider's `user_data`. The CCD bit of the pair
/// flags is not per-pair in Rapier; [`RapierBackend`] turns it into body CCD.
pub struct FilterHooks;

impl PhysicsHooks for FilterHooks {
    fn filter_contact_pair(&self, context: &PairFilterContext) -> Option<SolverFlags> {
        let a = FilterData::unpack(context.colliders[context.collider1].user_data);
        let b = FilterData::unpack(context.colliders[context.collider2].user_data);
        filter::pair_flags(&a, &b).map(|_| SolverFlags::COMPUTE_IMPULSES)
    }
}

// ---------------------------------------------------------------------------
// ECS integration
// ---------------------------------------------------------------------------

/// Elapsed time of the current frame in seconds.
#[derive(Resource, Debug, Clone, Copy, PartialEq)]
pub struct FrameDelta(pub f32);

impl Default for FrameDelta {
    fn default() -> Self {
        Self(1.0 / 60.0)
    }
}

/// ECS system running one frame of the physics protocol.
pub fn physics_process_system<B: PhysicsBackend>(
    delta: Res<FrameDelta>,
    mut scene: ResMut<Scene>,
    mut physics: ResMut<PhysicsSystem<B>>,
) {
    physics.process(&mut scene, delta.0);
}
