//! The physics scheduler: owns every engine object created for the scene and
//! runs the per-frame protocol.
//!
//! One frame is:
//!
//! 1. poll the outstanding step and publish its results;
//! 2. take scene events into the pending and update sets;
//! 3. drain pending components into engine objects;
//! 4. apply scheduled property updates;
//! 5. either push scene edits down (simulation disabled) or move
//!    controllers, apply forces, step vehicles and start the next step.
//!
//! Steps 3 to 5 only run while no step is in flight.

use std::collections::BTreeSet;

use bevy_ecs::prelude::Resource;
use glam::Vec3;
use rustc_hash::FxHashMap;

use kinesis_config::{MaterialLibrary, PhysicsConfig};
use kinesis_scene::{ColliderGeometry, ComponentId, NodeId, Scene};

use crate::backend::{
    ActorHandle, ActorKind, ControllerHandle, CookedMeshHandle, ForceMode, PhysicsBackend, Pose,
    ShapeHandle,
};
use crate::collision_events::{CollisionEvent, CollisionEventCollector};
use crate::filter::SurfaceRole;
use crate::geometry_cache::GeometryCache;
use crate::materials::MaterialTable;
use crate::physics_debug::DebugLineBuffer;
use crate::vehicle_subsystem::{VehicleState, VehiclesSubsystem};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Engine state of a body component.
#[derive(Debug, Clone)]
pub(crate) struct BodyRecord {
    pub node: NodeId,
    pub kind: ActorKind,
    pub actor: Option<ActorHandle>,
    /// World scale of the node when the actor was created.
    pub scale: Vec3,
}

/// Engine state of a collider component.
#[derive(Debug, Clone)]
pub(crate) struct ColliderRecord {
    pub node: NodeId,
    pub shape: Option<ShapeHandle>,
    /// Body the shape belongs to, resolved by walking up the hierarchy.
    pub owner: Option<ComponentId>,
    /// Geometry the shape was built from.
    pub geometry: Option<ColliderGeometry>,
    pub role: SurfaceRole,
    /// World scale of the node when the shape was built.
    pub scale: Vec3,
    /// Offset of the engine shape inside the node frame.
    pub local_offset: Pose,
    /// Height field owned by this collider alone.
    pub cooked: Option<CookedMeshHandle>,
}

impl ColliderRecord {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            shape: None,
            owner: None,
            geometry: None,
            role: SurfaceRole::Plain,
            scale: Vec3::ONE,
            local_offset: Pose::IDENTITY,
            cooked: None,
        }
    }
}

/// Engine state of a character controller component.
#[derive(Debug, Clone)]
pub(crate) struct ControllerRecord {
    pub node: NodeId,
    pub handle: Option<ControllerHandle>,
}

/// Engine object whose release waits for the outstanding step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum DeferredRelease {
    Actor(ActorHandle),
    Shape(ShapeHandle),
    Detach(ActorHandle, ShapeHandle),
    Controller(ControllerHandle),
    Cooked(CookedMeshHandle),
}

impl DeferredRelease {
    fn apply<B: PhysicsBackend>(self, backend: &mut B) {
        match self {
            DeferredRelease::Actor(actor) => backend.release_actor(actor),
            DeferredRelease::Shape(shape) => backend.release_shape(shape),
            DeferredRelease::Detach(actor, shape) => backend.detach_shape(actor, shape),
            DeferredRelease::Controller(controller) => backend.release_controller(controller),
            DeferredRelease::Cooked(mesh) => backend.release_cooked(mesh),
        }
    }
}

/// Closest raycast hit, resolved to scene components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentHit {
    /// Node owning the hit collider.
    pub node: NodeId,
    pub collider: ComponentId,
    /// Body the collider is attached to.
    pub body: Option<ComponentId>,
    pub position: Vec3,
    pub normal: Vec3,
    pub distance: f32,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Keeps a [`Scene`]'s physics components and a [`PhysicsBackend`] in sync.
#[derive(Resource)]
pub struct PhysicsSystem<B: PhysicsBackend> {
    pub(crate) backend: B,
    pub(crate) materials: MaterialTable,
    pub(crate) cache: GeometryCache,

    pub(crate) bodies: FxHashMap<ComponentId, BodyRecord>,
    pub(crate) colliders: FxHashMap<ComponentId, ColliderRecord>,
    pub(crate) controllers: FxHashMap<ComponentId, ControllerRecord>,
    pub(crate) actor_owners: FxHashMap<ActorHandle, ComponentId>,
    pub(crate) shape_owners: FxHashMap<ShapeHandle, ComponentId>,

    pub(crate) pending_bodies: Vec<ComponentId>,
    pub(crate) pending_colliders: Vec<ComponentId>,
    pub(crate) pending_controllers: Vec<ComponentId>,
    /// Colliders waiting for render or landscape data on a node.
    pub(crate) waiting_for_geometry: FxHashMap<NodeId, Vec<ComponentId>>,
    pub(crate) scheduled_updates: BTreeSet<ComponentId>,
    pub(crate) forces: Vec<(ComponentId, Vec3, ForceMode)>,
    pub(crate) deferred_releases: Vec<DeferredRelease>,

    pub(crate) vehicles: VehiclesSubsystem,
    pub(crate) collisions: CollisionEventCollector,
    pub(crate) debug_lines: DebugLineBuffer,

    pub(crate) is_running: bool,
    pub(crate) simulation_enabled: bool,
    pub(crate) debug_draw: bool,
    pub(crate) ccd_enabled: bool,
    pub(crate) max_contact_points: usize,
    torn_down: bool,
}

impl<B: PhysicsBackend> PhysicsSystem<B> {
    /// Creates a scheduler with default settings, registering every
    /// material of the library with the backend.
    pub fn new(mut backend: B, materials: &MaterialLibrary) -> Self {
        let materials = MaterialTable::new(materials, &mut backend);
        let defaults = PhysicsConfig::default();
        Self {
            backend,
            materials,
            cache: GeometryCache::new(),
            bodies: FxHashMap::default(),
            colliders: FxHashMap::default(),
            controllers: FxHashMap::default(),
            actor_owners: FxHashMap::default(),
            shape_owners: FxHashMap::default(),
            pending_bodies: Vec::new(),
            pending_colliders: Vec::new(),
            pending_controllers: Vec::new(),
            waiting_for_geometry: FxHashMap::default(),
            scheduled_updates: BTreeSet::new(),
            forces: Vec::new(),
            deferred_releases: Vec::new(),
            vehicles: VehiclesSubsystem::new(),
            collisions: CollisionEventCollector::new(),
            debug_lines: DebugLineBuffer::default(),
            is_running: false,
            simulation_enabled: defaults.simulation_enabled,
            debug_draw: defaults.debug_draw,
            ccd_enabled: defaults.ccd_enabled,
            max_contact_points: defaults.max_contact_points,
            torn_down: false,
        }
    }

    /// Creates a scheduler configured from `physics.ron`.
    pub fn from_config(config: &PhysicsConfig, materials: &MaterialLibrary, backend: B) -> Self {
        let mut system = Self::new(backend, materials);
        let [x, y, z] = config.gravity;
        system.backend.set_gravity(Vec3::new(x, y, z));
        system.simulation_enabled = config.simulation_enabled;
        system.debug_draw = config.debug_draw;
        system.ccd_enabled = config.ccd_enabled;
        system.max_contact_points = config.max_contact_points;
        system
    }

    // --- Frame protocol ---

    /// Runs one frame of the protocol with elapsed time `dt` seconds.
    pub fn process(&mut self, scene: &mut Scene, dt: f32) {
        if self.is_running && self.backend.fetch_results(false) {
            self.complete_step(scene);
        }

        self.ingest_events(scene);
        if self.is_running {
            tracing::trace!("physics step still in flight");
            return;
        }

        self.drain_pending(scene);
        self.apply_updates(scene);

        // Edits made while a step was in flight are still queued here.
        let changed = scene.take_changed_transforms();
        if !self.simulation_enabled {
            self.push_down(scene, &changed);
            return;
        }

        self.move_controllers(scene, dt);
        if self.debug_draw {
            self.refresh_debug_lines(scene);
        }
        self.apply_forces();
        let remass = self.vehicles.step(
            scene,
            &mut self.backend,
            &self.bodies,
            &mut self.colliders,
            dt,
        );
        self.scheduled_updates.extend(remass);
        self.backend.simulate(dt);
        self.is_running = true;
    }

    /// Finishes the outstanding step: releases deferred objects, then
    /// publishes poses and collision events.
    fn complete_step(&mut self, scene: &mut Scene) {
        self.is_running = false;
        for release in std::mem::take(&mut self.deferred_releases) {
            release.apply(&mut self.backend);
        }
        self.publish(scene);
    }

    /// Blocks until the outstanding step completes and publishes it. Does
    /// nothing while idle.
    pub fn finish_step(&mut self, scene: &mut Scene) {
        if self.is_running && self.backend.fetch_results(true) {
            self.complete_step(scene);
        }
    }

    /// Releases now, or after the outstanding step completes.
    pub(crate) fn release(&mut self, release: DeferredRelease) {
        if self.is_running {
            self.deferred_releases.push(release);
        } else {
            release.apply(&mut self.backend);
        }
    }

    // --- Control surface ---

    /// Enables or disables stepping. A step already in flight still
    /// completes. Re-enabling rebuilds every vehicle.
    pub fn set_simulation_enabled(&mut self, enabled: bool) {
        if self.simulation_enabled == enabled {
            return;
        }
        self.simulation_enabled = enabled;
        self.vehicles.invalidate_all();
        tracing::debug!(enabled, "physics simulation toggled");
    }

    pub fn is_simulation_enabled(&self) -> bool {
        self.simulation_enabled
    }

    /// Whether a step is in flight.
    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn set_debug_draw(&mut self, enabled: bool) {
        self.debug_draw = enabled;
        if !enabled {
            self.debug_lines.clear();
        }
    }

    pub fn is_debug_draw_enabled(&self) -> bool {
        self.debug_draw
    }

    /// Queues a re-derivation of a component's engine state for the next
    /// update pass. Edits made through tracked scene accessors are queued
    /// automatically.
    pub fn schedule_update(&mut self, component: ComponentId) {
        self.scheduled_updates.insert(component);
    }

    /// Marks a collider as drivable ground (or not) for vehicle wheels.
    pub fn set_drivable_surface(&mut self, collider: ComponentId, drivable: bool) {
        let Some(record) = self.colliders.get_mut(&collider) else {
            return;
        };
        record.role = if drivable {
            SurfaceRole::Ground
        } else {
            SurfaceRole::Plain
        };
        self.scheduled_updates.insert(collider);
    }

    /// Queues a force on a body for the next step. Ignored for unknown
    /// bodies.
    pub fn apply_force(&mut self, body: ComponentId, force: Vec3, mode: ForceMode) {
        if self.bodies.contains_key(&body) {
            self.forces.push((body, force, mode));
        }
    }

    /// Closest collider hit by a ray. The direction need not be normalized.
    pub fn raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<ComponentHit> {
        let direction = direction.try_normalize()?;
        let hit = self.backend.raycast(origin, direction, max_distance)?;
        let collider = *self.shape_owners.get(&hit.shape)?;
        let record = self.colliders.get(&collider)?;
        Some(ComponentHit {
            node: record.node,
            collider,
            body: hit.actor.and_then(|a| self.actor_owners.get(&a).copied()),
            position: hit.position,
            normal: hit.normal,
            distance: hit.distance,
        })
    }

    /// Collision events of the last completed step.
    pub fn collision_events(&self) -> &[CollisionEvent] {
        self.collisions.events()
    }

    pub fn collisions(&self) -> &CollisionEventCollector {
        &self.collisions
    }

    /// Debug lines produced before the last step.
    pub fn debug_lines(&self) -> &DebugLineBuffer {
        &self.debug_lines
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Engine actor of a body component, once drained.
    pub fn body_actor(&self, body: ComponentId) -> Option<ActorHandle> {
        self.bodies.get(&body).and_then(|r| r.actor)
    }

    /// Engine shape of a collider component, once built.
    pub fn collider_shape(&self, collider: ComponentId) -> Option<ShapeHandle> {
        self.colliders.get(&collider).and_then(|r| r.shape)
    }

    /// Body a collider is attached to.
    pub fn collider_owner(&self, collider: ComponentId) -> Option<ComponentId> {
        self.colliders.get(&collider).and_then(|r| r.owner)
    }

    /// Engine controller of a controller component, once drained.
    pub fn controller_handle(&self, controller: ComponentId) -> Option<ControllerHandle> {
        self.controllers.get(&controller).and_then(|r| r.handle)
    }

    pub fn vehicle_state(&self, vehicle: ComponentId) -> Option<&VehicleState> {
        self.vehicles.state(vehicle)
    }

    /// Number of registered vehicle components, built or not.
    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    /// Number of cooked meshes and hulls held by the geometry cache.
    pub fn cached_geometry_count(&self) -> usize {
        self.cache.len()
    }

    // --- Teardown ---

    /// Waits for the outstanding step and releases every engine object.
    /// The scheduler is empty afterwards.
    pub fn prepare_for_remove(&mut self) {
        if self.torn_down {
            return;
        }
        if self.is_running {
            self.backend.fetch_results(true);
            self.is_running = false;
        }
        for release in std::mem::take(&mut self.deferred_releases) {
            release.apply(&mut self.backend);
        }

        self.vehicles.clear();
        for (_, record) in self.controllers.drain() {
            if let Some(handle) = record.handle {
                self.backend.release_controller(handle);
            }
        }
        for (_, record) in self.bodies.drain() {
            if let Some(actor) = record.actor {
                self.backend.release_actor(actor);
            }
        }
        for (_, record) in self.colliders.drain() {
            if let Some(shape) = record.shape {
                self.backend.release_shape(shape);
            }
            if let Some(mesh) = record.cooked {
                self.backend.release_cooked(mesh);
            }
        }
        self.cache.release_all(&mut self.backend);

        self.actor_owners.clear();
        self.shape_owners.clear();
        self.pending_bodies.clear();
        self.pending_colliders.clear();
        self.pending_controllers.clear();
        self.waiting_for_geometry.clear();
        self.scheduled_updates.clear();
        self.forces.clear();
        self.collisions.clear();
        self.debug_lines.clear();
        self.torn_down = true;
        tracing::debug!("physics scheduler torn down");
    }
}

impl<B: PhysicsBackend> Drop for PhysicsSystem<B> {
    fn drop(&mut self) {
        self.prepare_for_remove();
    }
}

#[cfg(test)]
#[path = "system_tests.rs"]
mod tests;
