//! Physics debug visualization: shape wireframes, contact points, velocities
//! and controller volumes, emitted as colored line segments.
//!
//! Everything here only reads backend state; drawing never changes the
//! simulation.

use glam::Vec3;
use kinesis_scene::ControllerGeometry;

use crate::backend::{ActorKind, ControllerHandle, PhysicsBackend, Pose, ShapeGeometry, ShapeHandle};
use crate::collision_events::CollisionEvent;

// ---------------------------------------------------------------------------
// Palette and buffers
// ---------------------------------------------------------------------------

/// Color palette for physics debug visualization.
#[derive(Clone, Debug)]
pub struct PhysicsDebugColors {
    /// Static shapes (ground, walls): green.
    pub static_collider: [f32; 4],
    /// Dynamic bodies: blue.
    pub dynamic_body: [f32; 4],
    /// Character controllers: cyan.
    pub kinematic_body: [f32; 4],
    /// Contact points: red.
    pub contact_point: [f32; 4],
    /// Velocity vectors: magenta.
    pub velocity: [f32; 4],
}

impl Default for PhysicsDebugColors {
    fn default() -> Self {
        COLORS
    }
}

/// Global default color palette.
pub const COLORS: PhysicsDebugColors = PhysicsDebugColors {
    static_collider: [0.0, 0.8, 0.2, 0.6],
    dynamic_body: [0.2, 0.4, 1.0, 0.6],
    kinematic_body: [0.0, 0.8, 0.8, 0.6],
    contact_point: [1.0, 0.0, 0.0, 1.0],
    velocity: [1.0, 0.0, 1.0, 0.8],
};

/// A single debug line segment with color.
#[derive(Clone, Debug, PartialEq)]
pub struct DebugLine {
    /// Start point in world space.
    pub start: [f32; 3],
    /// End point in world space.
    pub end: [f32; 3],
    /// RGBA color.
    pub color: [f32; 4],
}

/// Line segments produced for the current frame.
#[derive(Clone, Debug, Default)]
pub struct DebugLineBuffer {
    pub lines: Vec<DebugLine>,
}

impl DebugLineBuffer {
    pub fn push_line(&mut self, start: Vec3, end: Vec3, color: [f32; 4]) {
        self.lines.push(DebugLine {
            start: start.to_array(),
            end: end.to_array(),
            color,
        });
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Wireframe helpers
// ---------------------------------------------------------------------------

const SEGMENTS: usize = 16;

const BOX_EDGES: [(usize, usize); 12] = [
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 0),
    (4, 5),
    (5, 6),
    (6, 7),
    (7, 4),
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
];

/// Emit the 12 edges of a box.
fn emit_box_wireframe(lines: &mut DebugLineBuffer, pose: &Pose, he: Vec3, color: [f32; 4]) {
    let corners = [
        Vec3::new(-he.x, -he.y, -he.z),
        Vec3::new(he.x, -he.y, -he.z),
        Vec3::new(he.x, he.y, -he.z),
        Vec3::new(-he.x, he.y, -he.z),
        Vec3::new(-he.x, -he.y, he.z),
        Vec3::new(he.x, -he.y, he.z),
        Vec3::new(he.x, he.y, he.z),
        Vec3::new(-he.x, he.y, he.z),
    ]
    .map(|c| pose.transform_point(c));

    for (a, b) in BOX_EDGES {
        lines.push_line(corners[a], corners[b], color);
    }
}

/// Emit a circle of `radius` around `center`, spanned by `u` and `v`.
fn emit_circle(
    lines: &mut DebugLineBuffer,
    pose: &Pose,
    center: Vec3,
    (u, v): (Vec3, Vec3),
    radius: f32,
    color: [f32; 4],
) {
    let mut prev = None;
    for i in 0..=SEGMENTS {
        let angle = (i as f32 / SEGMENTS as f32) * std::f32::consts::TAU;
        let (s, c) = angle.sin_cos();
        let world = pose.transform_point(center + (u * c + v * s) * radius);
        if let Some(p) = prev {
            lines.push_line(p, world, color);
        }
        prev = Some(world);
    }
}

/// Emit a sphere as 3 great circles.
fn emit_sphere_wireframe(lines: &mut DebugLineBuffer, pose: &Pose, radius: f32, color: [f32; 4]) {
    for plane in [(Vec3::X, Vec3::Y), (Vec3::X, Vec3::Z), (Vec3::Y, Vec3::Z)] {
        emit_circle(lines, pose, Vec3::ZERO, plane, radius, color);
    }
}

/// Emit a Z-axis capsule: two rings and four connecting lines.
fn emit_capsule_wireframe(
    lines: &mut DebugLineBuffer,
    pose: &Pose,
    radius: f32,
    half_height: f32,
    color: [f32; 4],
) {
    for offset in [-half_height, half_height] {
        emit_circle(lines, pose, Vec3::Z * offset, (Vec3::X, Vec3::Y), radius, color);
    }
    for side in [Vec3::X, Vec3::Y, -Vec3::X, -Vec3::Y] {
        let bottom = pose.transform_point(side * radius - Vec3::Z * half_height);
        let top = pose.transform_point(side * radius + Vec3::Z * half_height);
        lines.push_line(bottom, top, color);
    }
}

/// Emit a small cross marker at a point.
fn emit_cross(lines: &mut DebugLineBuffer, point: Vec3, size: f32, color: [f32; 4]) {
    lines.push_line(point - Vec3::X * size, point + Vec3::X * size, color);
    lines.push_line(point - Vec3::Y * size, point + Vec3::Y * size, color);
    lines.push_line(point - Vec3::Z * size, point + Vec3::Z * size, color);
}

/// Emit one shape at its world pose. Meshes, hulls, height fields and
/// planes get a cross at their origin.
pub(crate) fn emit_shape(
    lines: &mut DebugLineBuffer,
    pose: &Pose,
    geometry: ShapeGeometry,
    scale: Vec3,
    color: [f32; 4],
) {
    match geometry {
        ShapeGeometry::Box { half_extents } => {
            emit_box_wireframe(lines, pose, half_extents * scale.abs(), color)
        }
        ShapeGeometry::Sphere { radius } => {
            emit_sphere_wireframe(lines, pose, radius * scale.abs().max_element(), color)
        }
        ShapeGeometry::Capsule {
            radius,
            half_height,
        } => {
            let scale = scale.abs();
            emit_capsule_wireframe(lines, pose, radius * scale.x.max(scale.y), half_height * scale.z, color)
        }
        ShapeGeometry::Plane
        | ShapeGeometry::TriangleMesh { .. }
        | ShapeGeometry::ConvexHull { .. }
        | ShapeGeometry::HeightField { .. } => emit_cross(lines, pose.translation, 0.5, color),
    }
}

// ---------------------------------------------------------------------------
// Frame capture
// ---------------------------------------------------------------------------

/// Replaces `lines` with wireframes of every attached shape, the given
/// controllers, the contacts of the last step and the velocity of each
/// dynamic actor.
pub(crate) fn capture<B: PhysicsBackend>(
    lines: &mut DebugLineBuffer,
    backend: &B,
    shapes: impl IntoIterator<Item = ShapeHandle>,
    controllers: impl IntoIterator<Item = (ControllerHandle, ControllerGeometry)>,
    contacts: &[CollisionEvent],
) {
    lines.clear();

    let mut dynamic_actors = Vec::new();
    for shape in shapes {
        let Some(actor) = backend.shape_actor(shape) else {
            continue;
        };
        let (Some(pose), Some(geometry)) = (backend.actor_pose(actor), backend.shape_geometry(shape)) else {
            continue;
        };
        let color = match backend.actor_kind(actor) {
            Some(ActorKind::Dynamic) => {
                dynamic_actors.push((actor, pose));
                COLORS.dynamic_body
            }
            _ => COLORS.static_collider,
        };
        let world = pose.mul(&backend.shape_local_pose(shape));
        emit_shape(lines, &world, geometry, backend.shape_scale(shape), color);
    }

    for (controller, geometry) in controllers {
        let Some(foot) = backend.controller_position(controller) else {
            continue;
        };
        let center = Pose::from_translation(foot + Vec3::Z * geometry.foot_offset());
        match geometry {
            ControllerGeometry::Box {
                half_height,
                half_forward,
                half_side,
            } => emit_box_wireframe(
                lines,
                &center,
                Vec3::new(half_forward, half_side, half_height),
                COLORS.kinematic_body,
            ),
            ControllerGeometry::Capsule { radius, height } => {
                emit_capsule_wireframe(lines, &center, radius, height * 0.5, COLORS.kinematic_body)
            }
        }
    }

    for point in contacts.iter().flat_map(|e| &e.points) {
        emit_cross(lines, point.position, 0.05, COLORS.contact_point);
    }

    dynamic_actors.sort_by_key(|(actor, _)| *actor);
    dynamic_actors.dedup_by_key(|(actor, _)| *actor);
    for (actor, pose) in dynamic_actors {
        let velocity = backend.actor_linear_velocity(actor);
        lines.push_line(pose.translation, pose.translation + velocity, COLORS.velocity);
    }
}

#[cfg(test)]
#[path = "physics_debug_tests.rs"]
mod tests;
