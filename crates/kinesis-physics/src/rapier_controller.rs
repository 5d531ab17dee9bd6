//! Character controllers on Rapier: a kinematic body carrying the
//! controller volume, moved by [`KinematicCharacterController`].
//!
//! Positions handed in and out are foot positions, the lowest point of the
//! volume; the body itself sits at the volume center.

use glam::Vec3;
use rapier3d::control::{CharacterAutostep, CharacterLength, KinematicCharacterController};
use rapier3d::prelude::*;

use kinesis_scene::ControllerGeometry;

use crate::PhysicsWorld;
use crate::backend::{ControllerDesc, ControllerMove};

/// Skin width kept between the volume and obstacles (meters).
const CONTACT_OFFSET: f32 = 0.01;
/// Highest step climbed automatically (meters).
const STEP_HEIGHT: f32 = 0.3;
/// Steepest slope climbed (radians).
const MAX_SLOPE: f32 = std::f32::consts::FRAC_PI_4;

/// Engine objects of one controller.
pub(crate) struct CharacterRig {
    pub body: RigidBodyHandle,
    pub collider: ColliderHandle,
    pub geometry: ControllerGeometry,
    pub controller: KinematicCharacterController,
    pub up: Vec3,
    pub foot: Vec3,
}

fn to_vector(v: Vec3) -> Vector {
    Vector::new(v.x, v.y, v.z)
}

/// Collision volume, Z-up.
fn controller_shape(geometry: &ControllerGeometry) -> SharedShape {
    match *geometry {
        ControllerGeometry::Box {
            half_height,
            half_forward,
            half_side,
        } => SharedShape::cuboid(half_forward, half_side, half_height),
        ControllerGeometry::Capsule { radius, height } => {
            SharedShape::capsule_z(height * 0.5, radius)
        }
    }
}

fn center_of(rig_up: Vec3, geometry: &ControllerGeometry, foot: Vec3) -> Vec3 {
    foot + rig_up * geometry.foot_offset()
}

/// Creates the kinematic body and collider of a controller.
pub(crate) fn spawn_rig(world: &mut PhysicsWorld, desc: &ControllerDesc, friction: f32) -> CharacterRig {
    let up = desc.up.try_normalize().unwrap_or(Vec3::Z);
    let center = center_of(up, &desc.geometry, desc.foot_position);

    let body = RigidBodyBuilder::kinematic_position_based()
        .translation(to_vector(center))
        .build();
    let body = world.rigid_body_set.insert(body);
    let collider = ColliderBuilder::new(controller_shape(&desc.geometry))
        .friction(friction)
        .build();
    let collider = world
        .collider_set
        .insert_with_parent(collider, body, &mut world.rigid_body_set);

    let controller = KinematicCharacterController {
        up: to_vector(up),
        offset: CharacterLength::Absolute(CONTACT_OFFSET),
        max_slope_climb_angle: MAX_SLOPE,
        min_slope_slide_angle: MAX_SLOPE,
        autostep: Some(CharacterAutostep {
            max_height: CharacterLength::Absolute(STEP_HEIGHT),
            min_width: CharacterLength::Absolute(0.2),
            include_dynamic_bodies: false,
        }),
        snap_to_ground: Some(CharacterLength::Absolute(0.1)),
        ..Default::default()
    };

    CharacterRig {
        body,
        collider,
        geometry: desc.geometry,
        controller,
        up,
        foot: desc.foot_position,
    }
}

/// Replaces the controller volume, keeping the foot position.
pub(crate) fn resize_rig(world: &mut PhysicsWorld, rig: &mut CharacterRig, geometry: ControllerGeometry) {
    rig.geometry = geometry;
    if let Some(collider) = world.collider_set.get_mut(rig.collider) {
        collider.set_shape(controller_shape(&geometry));
    }
    place_rig(world, rig, rig.foot);
}

/// Teleports the controller so that its foot lands on `foot`.
pub(crate) fn place_rig(world: &mut PhysicsWorld, rig: &mut CharacterRig, foot: Vec3) {
    rig.foot = foot;
    let center = center_of(rig.up, &rig.geometry, foot);
    if let Some(body) = world.rigid_body_set.get_mut(rig.body) {
        body.set_translation(to_vector(center), true);
    }
}

/// Sweeps the controller volume by `displacement`, sliding along obstacles.
pub(crate) fn move_rig(
    world: &mut PhysicsWorld,
    rig: &mut CharacterRig,
    displacement: Vec3,
    dt: f32,
) -> ControllerMove {
    let center = center_of(rig.up, &rig.geometry, rig.foot);
    let shape = controller_shape(&rig.geometry);
    let Some(body) = world.rigid_body_set.get(rig.body) else {
        return ControllerMove {
            foot_position: rig.foot,
            collision_down: false,
        };
    };
    let mut pose = *body.position();
    pose.translation = to_vector(center);

    let filter = QueryFilter::new().exclude_rigid_body(rig.body);
    let query_pipeline = world.broad_phase.as_query_pipeline(
        world.narrow_phase.query_dispatcher(),
        &world.rigid_body_set,
        &world.collider_set,
        filter,
    );

    let corrected = rig.controller.move_shape(
        dt,
        &query_pipeline,
        &*shape,
        &pose,
        to_vector(displacement),
        |_| {},
    );

    let t = corrected.translation;
    rig.foot += Vec3::new(t.x, t.y, t.z);
    let new_center = center_of(rig.up, &rig.geometry, rig.foot);
    if let Some(body) = world.rigid_body_set.get_mut(rig.body) {
        body.set_next_kinematic_translation(to_vector(new_center));
    }

    ControllerMove {
        foot_position: rig.foot,
        collision_down: corrected.grounded,
    }
}

/// Removes the controller's body and collider.
pub(crate) fn despawn_rig(world: &mut PhysicsWorld, rig: &CharacterRig) {
    world.rigid_body_set.remove(
        rig.body,
        &mut world.island_manager,
        &mut world.collider_set,
        &mut world.impulse_joint_set,
        &mut world.multibody_joint_set,
        true,
    );
}
