//! Vehicle assembly and the per-frame vehicle pass.
//!
//! A vehicle is a node carrying a [`Vehicle`] component and a dynamic
//! [`Body`](kinesis_scene::Body). Its direct children hold one
//! [`Chassis`](kinesis_scene::Chassis) with exactly one collider and one or
//! more [`Wheel`](kinesis_scene::Wheel)s with a collider each. Vehicles are
//! built lazily once every part is attached to the body's actor, and torn
//! down whenever a part changes.

use std::collections::BTreeMap;

use glam::Vec3;
use rustc_hash::FxHashMap;

use kinesis_scene::{ColliderGeometry, ComponentId, ComponentKind, NodeId, Scene, Vehicle};

use crate::backend::{ActorHandle, PhysicsBackend, Pose, ShapeHandle};
use crate::error::PhysicsError;
use crate::filter::SurfaceRole;
use crate::input_smoothing::{SmoothingRates, SteerVsSpeedTable};
use crate::sprung_mass::compute_sprung_masses;
use crate::system::{BodyRecord, ColliderRecord};
use crate::vehicle_sim::{self, DriveState, FrameContext, WheelDynamics};

/// Maximum number of registered vehicles.
pub const MAX_VEHICLES: usize = 100;
/// Maximum number of wheels on one vehicle.
pub const MAX_WHEELS_PER_VEHICLE: usize = 20;

/// Mass of a wheel whose collider has no explicit mass (kg).
const DEFAULT_WHEEL_MASS: f32 = 20.0;
/// Index of the vertical axis (Z-up).
const GRAVITY_AXIS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrivetrainKind {
    Car,
    Tank,
}

impl DrivetrainKind {
    pub fn of(vehicle: &Vehicle) -> Self {
        match vehicle.drivetrain {
            kinesis_scene::Drivetrain::Car(_) => DrivetrainKind::Car,
            kinesis_scene::Drivetrain::Tank(_) => DrivetrainKind::Tank,
        }
    }
}

// ---------------------------------------------------------------------------
// Built state
// ---------------------------------------------------------------------------

/// One wheel of a built vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltWheel {
    pub wheel: ComponentId,
    pub collider: ComponentId,
    pub node: NodeId,
    pub shape: ShapeHandle,
    /// Shape pose inside the actor with the suspension at rest.
    pub rest_pose: Pose,
    /// Rest position relative to the center of mass.
    pub offset: Vec3,
    pub sprung_mass: f32,
    pub radius: f32,
    pub mass: f32,
    pub max_steer_angle: f32,
    pub max_handbrake_torque: f32,
    pub dynamics: WheelDynamics,
}

/// A vehicle assembled on top of its body's actor.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltVehicle {
    pub body: ComponentId,
    pub actor: ActorHandle,
    pub chassis_collider: ComponentId,
    pub chassis_node: NodeId,
    pub drivetrain: DrivetrainKind,
    /// Chassis mass (kg).
    pub mass: f32,
    /// Center of mass in the actor frame.
    pub center_of_mass: Vec3,
    /// Wheels in the order of their shapes on the actor.
    pub wheels: Vec<BuiltWheel>,
    pub drive: DriveState,
}

impl BuiltVehicle {
    fn contains_node(&self, node: NodeId) -> bool {
        self.chassis_node == node || self.wheels.iter().any(|w| w.node == node)
    }

    fn contains_collider(&self, collider: ComponentId) -> bool {
        self.chassis_collider == collider || self.wheels.iter().any(|w| w.collider == collider)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VehicleState {
    /// Waiting for its parts, or for the next build pass.
    Unbuilt,
    Built(Box<BuiltVehicle>),
}

#[derive(Debug)]
struct VehicleEntry {
    node: NodeId,
    state: VehicleState,
    /// Build on the next pass.
    dirty: bool,
}

// ---------------------------------------------------------------------------
// Subsystem
// ---------------------------------------------------------------------------

/// Registry of vehicle components and their built state.
#[derive(Debug, Default)]
pub(crate) struct VehiclesSubsystem {
    vehicles: BTreeMap<ComponentId, VehicleEntry>,
    /// Built vehicles whose engine-side changes must be undone.
    teardown: Vec<BuiltVehicle>,
    /// Rest pose of every wheel collider ever built into a vehicle.
    rest_poses: FxHashMap<ComponentId, Pose>,
    rates: SmoothingRates,
    steer_table: SteerVsSpeedTable,
}

impl VehiclesSubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn register(&mut self, id: ComponentId, node: NodeId) {
        if let Some(entry) = self.vehicles.get_mut(&id) {
            invalidate(entry, &mut self.teardown);
            return;
        }
        assert!(
            self.vehicles.len() < MAX_VEHICLES,
            "{}",
            PhysicsError::VehicleCapacityExceeded {
                vehicles: self.vehicles.len() + 1,
                wheels: 0,
            }
        );
        self.vehicles.insert(
            id,
            VehicleEntry {
                node,
                state: VehicleState::Unbuilt,
                dirty: true,
            },
        );
    }

    pub fn unregister(&mut self, id: ComponentId) {
        if let Some(entry) = self.vehicles.remove(&id)
            && let VehicleState::Built(built) = entry.state
        {
            self.teardown.push(*built);
        }
    }

    pub fn state(&self, id: ComponentId) -> Option<&VehicleState> {
        self.vehicles.get(&id).map(|e| &e.state)
    }

    /// Rebuilds every vehicle on the next pass.
    pub fn invalidate_all(&mut self) {
        for entry in self.vehicles.values_mut() {
            invalidate(entry, &mut self.teardown);
        }
    }

    /// Rebuilds vehicles that `node` may be a part of: the vehicle node
    /// itself, its direct children and any node of a built vehicle.
    pub fn invalidate_near(&mut self, scene: &Scene, node: NodeId) {
        let parent = scene.parent(node);
        for entry in self.vehicles.values_mut() {
            let near = entry.node == node
                || parent == Some(entry.node)
                || matches!(&entry.state, VehicleState::Built(b) if b.contains_node(node));
            if near {
                invalidate(entry, &mut self.teardown);
            }
        }
    }

    pub fn body_removed(&mut self, body: ComponentId) {
        for entry in self.vehicles.values_mut() {
            if matches!(&entry.state, VehicleState::Built(b) if b.body == body) {
                invalidate(entry, &mut self.teardown);
            }
        }
    }

    pub fn collider_removed(&mut self, collider: ComponentId, node: NodeId) {
        self.rest_poses.remove(&collider);
        for entry in self.vehicles.values_mut() {
            let affected = entry.node == node
                || matches!(&entry.state, VehicleState::Built(b) if b.contains_collider(collider));
            if affected {
                invalidate(entry, &mut self.teardown);
            }
        }
    }

    /// Input and gear edits are read every frame; only a different
    /// drivetrain needs a rebuild.
    pub fn vehicle_changed(&mut self, scene: &Scene, id: ComponentId) {
        let Some(vehicle) = scene.vehicle(id) else {
            return;
        };
        let kind = DrivetrainKind::of(vehicle);
        if let Some(entry) = self.vehicles.get_mut(&id)
            && matches!(&entry.state, VehicleState::Built(b) if b.drivetrain != kind)
        {
            invalidate(entry, &mut self.teardown);
        }
    }

    /// Forgets everything. Engine objects are released by the scheduler.
    pub fn clear(&mut self) {
        self.vehicles.clear();
        self.teardown.clear();
        self.rest_poses.clear();
    }

    /// Undoes torn-down vehicles, builds dirty ones and, when `dt > 0`,
    /// runs the vehicle dynamics for every built vehicle.
    ///
    /// Returns the bodies left without a built vehicle, whose mass must be
    /// derived from their shapes again.
    pub fn step<B: PhysicsBackend>(
        &mut self,
        scene: &mut Scene,
        backend: &mut B,
        bodies: &FxHashMap<ComponentId, BodyRecord>,
        colliders: &mut FxHashMap<ComponentId, ColliderRecord>,
        dt: f32,
    ) -> Vec<ComponentId> {
        let mut dismantled = Vec::new();
        for vehicle in std::mem::take(&mut self.teardown) {
            dismantle(&vehicle, scene, backend, colliders);
            dismantled.push(vehicle.body);
        }

        let dirty: Vec<(ComponentId, NodeId)> = self
            .vehicles
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(&id, e)| (id, e.node))
            .collect();
        for (id, node) in dirty {
            let state = match self.build_vehicle(id, node, scene, backend, bodies, colliders) {
                Ok(built) => {
                    tracing::debug!(
                        vehicle = id.0,
                        wheels = built.wheels.len(),
                        mass = built.mass,
                        "vehicle built"
                    );
                    VehicleState::Built(Box::new(built))
                }
                Err(err) => {
                    tracing::debug!(vehicle = id.0, %err, "vehicle not built");
                    VehicleState::Unbuilt
                }
            };
            if let Some(entry) = self.vehicles.get_mut(&id) {
                entry.state = state;
                entry.dirty = false;
            }
        }

        // A rebuilt vehicle set its own mass properties.
        let rebuilt: Vec<ComponentId> = self
            .vehicles
            .values()
            .filter_map(|e| match &e.state {
                VehicleState::Built(b) => Some(b.body),
                VehicleState::Unbuilt => None,
            })
            .collect();
        dismantled.retain(|body| !rebuilt.contains(body));
        dismantled.sort_unstable();
        dismantled.dedup();

        if dt > 0.0 {
            let ctx = FrameContext {
                rates: &self.rates,
                steer_table: &self.steer_table,
                gravity: backend.gravity(),
                dt,
            };
            let mut built: Vec<(ComponentId, &mut BuiltVehicle)> = self
                .vehicles
                .iter_mut()
                .filter_map(|(&id, e)| match &mut e.state {
                    VehicleState::Built(b) => Some((id, &mut **b)),
                    VehicleState::Unbuilt => None,
                })
                .collect();
            if !built.is_empty() {
                vehicle_sim::step_vehicles(&mut built, scene, backend, &ctx);
            }
        }
        dismantled
    }

    // -----------------------------------------------------------------------
    // Assembly
    // -----------------------------------------------------------------------

    fn build_vehicle<B: PhysicsBackend>(
        &mut self,
        id: ComponentId,
        node: NodeId,
        scene: &Scene,
        backend: &mut B,
        bodies: &FxHashMap<ComponentId, BodyRecord>,
        colliders: &mut FxHashMap<ComponentId, ColliderRecord>,
    ) -> Result<BuiltVehicle, PhysicsError> {
        let component = *scene
            .vehicle(id)
            .ok_or(PhysicsError::UnknownComponent(id))?;
        let body = scene
            .find_component(node, ComponentKind::Body)
            .ok_or(PhysicsError::VehicleIncomplete("no body on the vehicle node"))?;
        if !scene.body(body).is_some_and(|b| b.is_dynamic()) {
            return Err(PhysicsError::VehicleIncomplete("vehicle body is not dynamic"));
        }
        let actor = bodies
            .get(&body)
            .and_then(|r| r.actor)
            .ok_or(PhysicsError::MissingActor(body))?;
        let shapes = backend.actor_shapes(actor);

        // Colliders of a child node whose shapes sit on this actor.
        let attached = |child: NodeId| -> Vec<(ComponentId, ShapeHandle)> {
            scene
                .components_of_kind(child, ComponentKind::Collider)
                .filter_map(|c| {
                    let shape = colliders.get(&c)?.shape?;
                    shapes.contains(&shape).then_some((c, shape))
                })
                .collect()
        };

        let mut chassis_parts = Vec::new();
        let mut wheel_parts = Vec::new();
        for &child in scene.children(node) {
            if let Some(chassis) = scene.find_component(child, ComponentKind::Chassis) {
                chassis_parts.push((child, chassis));
            }
            if let Some(wheel) = scene.find_component(child, ComponentKind::Wheel) {
                let &[(collider, shape), ..] = attached(child).as_slice() else {
                    return Err(PhysicsError::VehicleIncomplete("wheel collider not attached"));
                };
                wheel_parts.push((child, wheel, collider, shape));
            }
        }

        let &[(chassis_node, chassis)] = chassis_parts.as_slice() else {
            return Err(PhysicsError::VehicleIncomplete("expected exactly one chassis"));
        };
        let &[(chassis_collider, chassis_shape)] = attached(chassis_node).as_slice() else {
            return Err(PhysicsError::VehicleIncomplete(
                "chassis needs exactly one attached collider",
            ));
        };
        if wheel_parts.is_empty() {
            return Err(PhysicsError::VehicleIncomplete("no wheels"));
        }
        assert!(
            wheel_parts.len() <= MAX_WHEELS_PER_VEHICLE,
            "{}",
            PhysicsError::VehicleCapacityExceeded {
                vehicles: self.vehicles.len(),
                wheels: wheel_parts.len(),
            }
        );

        // Wheel order follows the shapes on the actor, not the scene.
        wheel_parts.sort_by_key(|&(.., shape)| shapes.iter().position(|&s| s == shape));

        let chassis_component = scene
            .collider(chassis_collider)
            .ok_or(PhysicsError::UnknownComponent(chassis_collider))?;
        let mass = if chassis_component.override_mass() {
            chassis_component.mass()
        } else {
            backend.shape_mass(chassis_shape)
        };
        if mass.is_nan() || mass <= 0.0 {
            return Err(PhysicsError::VehicleIncomplete("chassis has no mass"));
        }
        let center_of_mass = scene
            .chassis(chassis)
            .map(|c| c.center_of_mass_offset)
            .unwrap_or_default();
        let (chassis_geometry, chassis_scale) = colliders
            .get(&chassis_collider)
            .map(|r| (r.geometry, r.scale))
            .unwrap_or((None, Vec3::ONE));

        let mut wheels = Vec::with_capacity(wheel_parts.len());
        for &(wheel_node, wheel, collider, shape) in &wheel_parts {
            let rest_pose = *self
                .rest_poses
                .entry(collider)
                .or_insert_with(|| backend.shape_local_pose(shape));
            let params = scene.wheel(wheel).copied().unwrap_or_default();
            let wheel_mass = scene
                .collider(collider)
                .filter(|c| c.override_mass())
                .map_or(DEFAULT_WHEEL_MASS, |c| c.mass());
            wheels.push(BuiltWheel {
                wheel,
                collider,
                node: wheel_node,
                shape,
                rest_pose,
                offset: rest_pose.translation - center_of_mass,
                sprung_mass: 0.0,
                radius: params.radius,
                mass: wheel_mass,
                max_steer_angle: params.max_steer_angle,
                max_handbrake_torque: params.max_handbrake_torque,
                dynamics: WheelDynamics::default(),
            });
        }

        let offsets: Vec<Vec3> = wheels.iter().map(|w| w.offset).collect();
        let sprung = compute_sprung_masses(&offsets, mass, GRAVITY_AXIS)?;
        for (wheel, sprung_mass) in wheels.iter_mut().zip(sprung) {
            wheel.sprung_mass = sprung_mass;
        }

        // Everything checked; commit the engine-side changes.
        assign_role(scene, backend, colliders, chassis_collider, SurfaceRole::Chassis);
        for wheel in &wheels {
            assign_role(scene, backend, colliders, wheel.collider, SurfaceRole::Wheel);
            backend.set_shape_local_pose(wheel.shape, wheel.rest_pose);
        }
        let inertia = chassis_inertia(chassis_geometry, chassis_scale, mass);
        backend.set_actor_mass_properties(actor, mass, inertia, center_of_mass);

        Ok(BuiltVehicle {
            body,
            actor,
            chassis_collider,
            chassis_node,
            drivetrain: DrivetrainKind::of(&component),
            mass,
            center_of_mass,
            wheels,
            drive: DriveState::new(component.gear),
        })
    }
}

fn invalidate(entry: &mut VehicleEntry, teardown: &mut Vec<BuiltVehicle>) {
    entry.dirty = true;
    if let VehicleState::Built(built) = std::mem::replace(&mut entry.state, VehicleState::Unbuilt) {
        teardown.push(*built);
    }
}

/// Restores plain filtering and rest poses on the parts of a torn-down
/// vehicle. Parts whose collider is gone are skipped.
fn dismantle<B: PhysicsBackend>(
    vehicle: &BuiltVehicle,
    scene: &Scene,
    backend: &mut B,
    colliders: &mut FxHashMap<ComponentId, ColliderRecord>,
) {
    assign_role(scene, backend, colliders, vehicle.chassis_collider, SurfaceRole::Plain);
    for wheel in &vehicle.wheels {
        if let Some(shape) = assign_role(scene, backend, colliders, wheel.collider, SurfaceRole::Plain) {
            backend.set_shape_local_pose(shape, wheel.rest_pose);
        }
    }
    tracing::debug!(body = vehicle.body.0, "vehicle torn down");
}

/// Gives a collider's shape the masks and query surface of `role`.
fn assign_role<B: PhysicsBackend>(
    scene: &Scene,
    backend: &mut B,
    colliders: &mut FxHashMap<ComponentId, ColliderRecord>,
    collider: ComponentId,
    role: SurfaceRole,
) -> Option<ShapeHandle> {
    let record = colliders.get_mut(&collider)?;
    let shape = record.shape?;
    record.role = role;
    let component = scene.collider(collider)?;
    let (type_mask, collide_with_mask) = role.masks(component.type_mask, component.collide_with_mask);
    let filter = backend
        .simulation_filter(shape)
        .with_masks(type_mask, collide_with_mask);
    backend.set_simulation_filter(shape, filter);
    backend.set_query_filter(shape, role.query_filter());
    Some(shape)
}

/// Principal inertia of the chassis from its collider volume.
fn chassis_inertia(geometry: Option<ColliderGeometry>, scale: Vec3, mass: f32) -> Vec3 {
    match geometry {
        Some(ColliderGeometry::Box { half_size }) => box_inertia(half_size * 2.0 * scale, mass),
        Some(ColliderGeometry::Sphere { radius }) => {
            let r = radius * scale.max_element();
            Vec3::splat(0.4 * mass * r * r)
        }
        Some(ColliderGeometry::Capsule { radius, half_height }) => {
            let size = Vec3::new(2.0 * radius, 2.0 * radius, 2.0 * (half_height + radius));
            box_inertia(size * scale, mass)
        }
        _ => box_inertia(scale, mass),
    }
}

/// Chassis box inertia on full sizes. Each axis pairs the length with one
/// other extent: `x² + z²`, `x² + y²`, `y² + z²`. The long axis enters
/// both roll and pitch.
fn box_inertia(size: Vec3, mass: f32) -> Vec3 {
    let sq = size * size;
    Vec3::new(sq.z + sq.x, sq.y + sq.x, sq.y + sq.z) * (mass / 12.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_inertia() {
        let inertia = box_inertia(Vec3::new(4.0, 2.0, 1.0), 12.0);
        assert_eq!(inertia, Vec3::new(17.0, 20.0, 5.0));
    }

    #[test]
    fn test_chassis_inertia_scales_geometry() {
        let half_size = Vec3::new(2.0, 1.0, 0.5);
        let unscaled = chassis_inertia(Some(ColliderGeometry::Box { half_size }), Vec3::ONE, 12.0);
        let scaled = chassis_inertia(
            Some(ColliderGeometry::Box {
                half_size: half_size * 0.5,
            }),
            Vec3::splat(2.0),
            12.0,
        );
        assert!((unscaled - scaled).length() < 1e-4, "{unscaled} vs {scaled}");

        let sphere = chassis_inertia(Some(ColliderGeometry::Sphere { radius: 1.0 }), Vec3::ONE, 10.0);
        assert!((sphere.x - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_registry_tracks_teardown() {
        let mut vehicles = VehiclesSubsystem::new();
        let (id, node) = (ComponentId(7), NodeId(3));
        vehicles.register(id, node);
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles.state(id), Some(&VehicleState::Unbuilt));

        vehicles.unregister(id);
        assert_eq!(vehicles.len(), 0);
        assert!(vehicles.state(id).is_none());
        assert!(vehicles.teardown.is_empty(), "unbuilt vehicles leave nothing to undo");
    }

    #[test]
    #[should_panic(expected = "vehicle batch capacity exceeded")]
    fn test_registering_past_capacity_is_fatal() {
        let mut vehicles = VehiclesSubsystem::new();
        for i in 0..=MAX_VEHICLES as u64 {
            vehicles.register(ComponentId(i), NodeId(i as u32));
        }
    }
}
