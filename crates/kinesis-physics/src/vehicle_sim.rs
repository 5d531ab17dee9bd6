//! Per-frame vehicle dynamics: suspension raycasts, spring and tire forces,
//! wheel spin, drivetrain torque and the automatic gearbox.
//!
//! Vehicles are Z-up with +X forward. Wheel forces are applied to the
//! vehicle's actor before the step; wheel shapes are re-posed to show
//! steer, spin and suspension travel.

use std::f32::consts::TAU;

use glam::{Quat, Vec3};
use kinesis_scene::{ComponentId, Gear, Scene, Vehicle};

use crate::backend::{ActorHandle, ForceMode, PhysicsBackend, Pose, RaycastHit, SuspensionRay};
use crate::filter::DRIVABLE_SURFACE;
use crate::input_smoothing::{AnalogInputs, SmoothingRates, SteerVsSpeedTable};
use crate::vehicle_subsystem::{BuiltVehicle, BuiltWheel, DrivetrainKind};

// ---------------------------------------------------------------------------
// Tuning
// ---------------------------------------------------------------------------

/// Peak engine torque (N·m).
const PEAK_TORQUE: f32 = 500.0;
/// Engine speed at which torque falls to zero (rad/s).
const MAX_ENGINE_OMEGA: f32 = 600.0;
/// Gear ratios in [`Gear::index`] order.
const GEAR_RATIOS: [f32; 7] = [-4.0, 0.0, 4.0, 2.0, 1.5, 1.1, 1.0];
const FINAL_DRIVE: f32 = 4.0;
/// Time without drive torque while a gear engages (s).
const GEAR_SWITCH_TIME: f32 = 0.5;
const UP_SHIFT: f32 = 0.65;
const DOWN_SHIFT: f32 = 0.25;
/// Maximum service brake torque per wheel (N·m).
const BRAKE_TORQUE: f32 = 1500.0;
const TIRE_FRICTION: f32 = 1.0;
const LATERAL_STIFFNESS: f32 = 5.0;
/// Wheel damping with the throttle wide open, closed, and the clutch
/// disengaged (N·m·s/rad).
const DAMPING_FULL_THROTTLE: f32 = 0.15;
const DAMPING_ZERO_THROTTLE: f32 = 2.0;
const DAMPING_DISENGAGED: f32 = 0.35;
/// Height of force application below the center of mass (m).
const FORCE_APPLICATION_DROP: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Suspension {
    pub max_raise: f32,
    pub max_drop: f32,
    pub spring: f32,
    pub damper: f32,
}

pub(crate) const CAR_SUSPENSION: Suspension = Suspension {
    max_raise: 0.3,
    max_drop: 0.1,
    spring: 35000.0,
    damper: 4500.0,
};

pub(crate) const TANK_SUSPENSION: Suspension = Suspension {
    max_raise: 0.3,
    max_drop: 0.1,
    spring: 10000.0,
    damper: 5000.0,
};

impl DrivetrainKind {
    pub(crate) fn suspension(self) -> Suspension {
        match self {
            DrivetrainKind::Car => CAR_SUSPENSION,
            DrivetrainKind::Tank => TANK_SUSPENSION,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Transient state of one wheel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WheelDynamics {
    /// Suspension compression from rest, positive upward (m).
    pub jounce: f32,
    /// Spin speed (rad/s).
    pub omega: f32,
    /// Accumulated spin angle (rad).
    pub spin: f32,
    /// Current steer angle (rad).
    pub steer: f32,
    pub in_contact: bool,
}

/// Drivetrain state carried between frames.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveState {
    pub inputs: AnalogInputs,
    pub gear: Gear,
    /// Remaining time of the current gear change (s).
    pub gear_switch: f32,
}

impl DriveState {
    pub fn new(gear: Gear) -> Self {
        Self {
            inputs: AnalogInputs::default(),
            gear,
            gear_switch: 0.0,
        }
    }

    fn shift(&mut self, gear: Gear) {
        if gear != self.gear {
            self.gear = gear;
            self.gear_switch = GEAR_SWITCH_TIME;
        }
    }

    fn ratio(&self) -> f32 {
        GEAR_RATIOS[self.gear.index()] * FINAL_DRIVE
    }
}

/// Next gear chosen by the automatic gearbox, if it shifts. Only forward
/// gears shift automatically.
pub(crate) fn automatic_gear(gear: Gear, engine_omega: f32) -> Option<Gear> {
    let position = Gear::FORWARD.iter().position(|&g| g == gear)?;
    if engine_omega > UP_SHIFT * MAX_ENGINE_OMEGA && position + 1 < Gear::FORWARD.len() {
        Some(Gear::FORWARD[position + 1])
    } else if engine_omega < DOWN_SHIFT * MAX_ENGINE_OMEGA && position > 0 {
        Some(Gear::FORWARD[position - 1])
    } else {
        None
    }
}

fn wheel_damping(throttle: f32, engaged: bool) -> f32 {
    if engaged {
        DAMPING_ZERO_THROTTLE + (DAMPING_FULL_THROTTLE - DAMPING_ZERO_THROTTLE) * throttle
    } else {
        DAMPING_DISENGAGED
    }
}

/// Shared per-frame parameters.
pub(crate) struct FrameContext<'a> {
    pub rates: &'a SmoothingRates,
    pub steer_table: &'a SteerVsSpeedTable,
    pub gravity: Vec3,
    pub dt: f32,
}

// ---------------------------------------------------------------------------
// Frame update
// ---------------------------------------------------------------------------

fn suspension_ray(pose: &Pose, wheel: &BuiltWheel, suspension: &Suspension, actor: ActorHandle) -> SuspensionRay {
    let up = pose.transform_vector(Vec3::Z);
    SuspensionRay {
        origin: pose.transform_point(wheel.rest_pose.translation + Vec3::Z * suspension.max_raise),
        direction: -up,
        max_distance: suspension.max_raise + suspension.max_drop + wheel.radius,
        exclude_actor: Some(actor),
        required_word3: DRIVABLE_SURFACE,
    }
}

/// Runs one frame for every built vehicle: one batched suspension query,
/// then forces and wheel poses per vehicle. The vehicle components get
/// their inputs cleared and the gear chosen by the gearbox.
pub(crate) fn step_vehicles<B: PhysicsBackend>(
    vehicles: &mut [(ComponentId, &mut BuiltVehicle)],
    scene: &mut Scene,
    backend: &mut B,
    ctx: &FrameContext,
) {
    let mut poses = Vec::with_capacity(vehicles.len());
    let mut rays = Vec::new();
    for (_, vehicle) in vehicles.iter() {
        let pose = backend.actor_pose(vehicle.actor).unwrap_or_default();
        let suspension = vehicle.drivetrain.suspension();
        rays.extend(
            vehicle
                .wheels
                .iter()
                .map(|w| suspension_ray(&pose, w, &suspension, vehicle.actor)),
        );
        poses.push(pose);
    }
    let hits = backend.raycast_batch(&rays);

    let mut first = 0;
    for ((id, vehicle), pose) in vehicles.iter_mut().zip(poses) {
        let count = vehicle.wheels.len();
        let wheel_hits: Vec<Option<RaycastHit>> = (first..first + count)
            .map(|i| hits.get(i).copied().flatten())
            .collect();
        first += count;

        let Some(component) = scene.vehicle(*id).copied() else {
            continue;
        };
        let gear = update_vehicle(vehicle, &component, &pose, &wheel_hits, backend, ctx);
        if let Some(component) = scene.vehicle_mut_untracked(*id) {
            component.gear = gear;
            component.reset_inputs();
        }
    }
}

/// Advances one vehicle and returns its gear after the frame.
fn update_vehicle<B: PhysicsBackend>(
    vehicle: &mut BuiltVehicle,
    component: &Vehicle,
    pose: &Pose,
    hits: &[Option<RaycastHit>],
    backend: &mut B,
    ctx: &FrameContext,
) -> Gear {
    let dt = ctx.dt;
    let suspension = vehicle.drivetrain.suspension();
    let target = AnalogInputs::from_drivetrain(&component.drivetrain);
    vehicle.drive.inputs = vehicle.drive.inputs.smoothed_toward(&target, ctx.rates, dt);
    let inputs = vehicle.drive.inputs;

    if component.gear != vehicle.drive.gear {
        vehicle.drive.shift(component.gear);
    }
    vehicle.drive.gear_switch = (vehicle.drive.gear_switch - dt).max(0.0);

    let actor = vehicle.actor;
    let center_of_mass = vehicle.center_of_mass;
    let drivetrain = vehicle.drivetrain;
    let up = pose.transform_vector(Vec3::Z);
    let forward_speed = backend
        .actor_linear_velocity(actor)
        .dot(pose.transform_vector(Vec3::X));
    let gravity = ctx.gravity.length();

    let ratio = vehicle.drive.ratio();
    let engine_omega = mean_wheel_speed(&vehicle.wheels) * ratio.abs();
    let torque = if vehicle.drive.gear_switch > 0.0 {
        0.0
    } else {
        PEAK_TORQUE * (1.0 - engine_omega / MAX_ENGINE_OMEGA).clamp(0.0, 1.0) * ratio
    };
    let throttle = inputs.acceleration();
    let damping = wheel_damping(throttle, ratio != 0.0);
    let steer_limit = ctx.steer_table.sample(forward_speed.abs());

    let wheel_count = vehicle.wheels.len().max(1) as f32;
    let left_count = vehicle.wheels.iter().filter(|w| w.offset.y >= 0.0).count().max(1) as f32;
    let right_count = vehicle.wheels.iter().filter(|w| w.offset.y < 0.0).count().max(1) as f32;

    for (i, wheel) in vehicle.wheels.iter_mut().enumerate() {
        let front = wheel.offset.x > 0.0;
        let (drive, brake, steer) = match drivetrain {
            DrivetrainKind::Car => {
                let handbrake = if front {
                    0.0
                } else {
                    inputs.values[2] * wheel.max_handbrake_torque
                };
                let steer = if front {
                    inputs.steer() * wheel.max_steer_angle * steer_limit
                } else {
                    0.0
                };
                (
                    throttle * torque / wheel_count,
                    inputs.values[1] * BRAKE_TORQUE + handbrake,
                    steer,
                )
            }
            DrivetrainKind::Tank => {
                let (thrust, brake, count) = if wheel.offset.y >= 0.0 {
                    (inputs.values[1], inputs.values[3], left_count)
                } else {
                    (inputs.values[2], inputs.values[4], right_count)
                };
                (throttle * thrust * torque / count, brake * BRAKE_TORQUE, 0.0)
            }
        };

        let inertia = (0.5 * wheel.mass * wheel.radius * wheel.radius).max(1e-3);
        let state = &mut wheel.dynamics;
        state.steer = steer;
        state.omega += drive / inertia * dt;
        state.omega /= 1.0 + damping * dt / inertia;
        let brake_step = brake / inertia * dt;
        state.omega = state.omega.signum() * (state.omega.abs() - brake_step).max(0.0);

        let was_in_contact = state.in_contact;
        let previous = state.jounce;
        let Some(hit) = hits.get(i).copied().flatten() else {
            state.jounce = -suspension.max_drop;
            state.in_contact = false;
            continue;
        };
        state.jounce = (suspension.max_raise - (hit.distance - wheel.radius))
            .clamp(-suspension.max_drop, suspension.max_raise);
        state.in_contact = true;
        let rate = if was_in_contact {
            (state.jounce - previous) / dt
        } else {
            0.0
        };
        let load = (wheel.sprung_mass * gravity + suspension.spring * state.jounce + suspension.damper * rate).max(0.0);

        // Tire frame on the contact plane.
        let normal = hit.normal;
        let heading = pose.rotation * (Quat::from_rotation_z(steer) * Vec3::X);
        let longitudinal = (heading - normal * heading.dot(normal)).normalize_or_zero();
        let lateral = normal.cross(longitudinal);
        let velocity = backend.actor_velocity_at_point(actor, hit.position);
        let (v_long, v_lat) = (velocity.dot(longitudinal), velocity.dot(lateral));

        let limit = TIRE_FRICTION * load;
        let reference = v_long.abs().max(1.0);
        let f_long = limit * ((state.omega * wheel.radius - v_long) / reference).clamp(-1.0, 1.0);
        let f_lat = -limit * (LATERAL_STIFFNESS * v_lat / reference).clamp(-1.0, 1.0);
        let mut tire = longitudinal * f_long + lateral * f_lat;
        if tire.length() > limit {
            tire = tire.normalize_or_zero() * limit;
        }

        // The ground pulls the wheel toward rolling without slip.
        let rolling = v_long / wheel.radius.max(1e-3);
        let ground_step = -tire.dot(longitudinal) * wheel.radius / inertia * dt;
        state.omega = if state.omega > rolling {
            (state.omega + ground_step).max(rolling)
        } else {
            (state.omega + ground_step).min(rolling)
        };

        let point = pose.transform_point(Vec3::new(
            center_of_mass.x + wheel.offset.x,
            center_of_mass.y + wheel.offset.y,
            center_of_mass.z - FORCE_APPLICATION_DROP,
        ));
        backend.apply_force_at_point(actor, up * load + tire, point, ForceMode::Force);
    }

    if drivetrain == DrivetrainKind::Tank {
        couple_tracks(&mut vehicle.wheels);
    }

    for wheel in &mut vehicle.wheels {
        let state = &mut wheel.dynamics;
        state.spin = (state.spin + state.omega * dt).rem_euclid(TAU);
        let local = Pose::new(
            wheel.rest_pose.translation + Vec3::Z * state.jounce,
            Quat::from_rotation_z(state.steer) * Quat::from_rotation_y(state.spin) * wheel.rest_pose.rotation,
        );
        backend.set_shape_local_pose(wheel.shape, local);
    }

    if drivetrain == DrivetrainKind::Car {
        let engine_omega = mean_wheel_speed(&vehicle.wheels) * ratio.abs();
        if let Some(next) = automatic_gear(vehicle.drive.gear, engine_omega) {
            tracing::trace!(?next, engine_omega, "automatic gear change");
            vehicle.drive.shift(next);
        }
    }
    vehicle.drive.gear
}

fn mean_wheel_speed(wheels: &[BuiltWheel]) -> f32 {
    if wheels.is_empty() {
        return 0.0;
    }
    wheels.iter().map(|w| w.dynamics.omega.abs()).sum::<f32>() / wheels.len() as f32
}

/// Wheels on one track turn together.
fn couple_tracks(wheels: &mut [BuiltWheel]) {
    for left in [true, false] {
        let on_side = |w: &BuiltWheel| (w.offset.y >= 0.0) == left;
        let (sum, count) = wheels
            .iter()
            .filter(|w| on_side(w))
            .fold((0.0, 0usize), |(s, c), w| (s + w.dynamics.omega, c + 1));
        if count == 0 {
            continue;
        }
        let mean = sum / count as f32;
        for wheel in wheels.iter_mut().filter(|w| on_side(w)) {
            wheel.dynamics.omega = mean;
        }
    }
}
