use std::sync::Arc;

use glam::{Quat, Vec3};
use kinesis_config::{MaterialLibrary, PhysicsConfig};
use kinesis_scene::{
    Body, BodyFlags, BodyVariant, CarInput, CharacterController, Chassis, Collider,
    ColliderGeometry, ControllerGeometry, Drivetrain, DynamicParams, GeometryFragment, GeometryId,
    MovementMode, NodeId, RenderGeometry, Scene, Vehicle, Wheel,
};

use super::*;
use crate::backend::{ContactReport, PhysicsBackend, Pose, ShapeGeometry};
use crate::collision_events::ContactPoint;
use crate::filter::{CHASSIS_TYPE, UNDRIVABLE_SURFACE, WHEEL_TYPE};
use crate::recording_backend::RecordingBackend;
use crate::vehicle_subsystem::BuiltVehicle;

const DT: f32 = 0.1;

fn physics() -> PhysicsSystem<RecordingBackend> {
    physics_with(RecordingBackend::default(), PhysicsConfig::default())
}

fn physics_with(backend: RecordingBackend, config: PhysicsConfig) -> PhysicsSystem<RecordingBackend> {
    PhysicsSystem::from_config(&config, &MaterialLibrary::default(), backend)
}

fn node_at(scene: &mut Scene, name: &str, parent: Option<NodeId>, at: Vec3) -> NodeId {
    let node = scene.create_node(name, parent).unwrap();
    scene.set_local_translation(node, at).unwrap();
    node
}

fn close(a: Vec3, b: Vec3) -> bool {
    (a - b).length() < 1e-4
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

#[test]
fn test_drain_builds_body_with_subtree_colliders() {
    let mut scene = Scene::new();
    let root = node_at(&mut scene, "crate", None, Vec3::new(0.0, 0.0, 5.0));
    let body = scene.add_component(root, Body::dynamic()).unwrap();
    let shell = node_at(&mut scene, "shell", Some(root), Vec3::X);
    let collider = scene
        .add_component(shell, Collider::cuboid(Vec3::splat(0.5)))
        .unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);

    let actor = physics.body_actor(body).expect("body drained");
    let shape = physics.collider_shape(collider).expect("shape built");
    assert_eq!(physics.collider_owner(collider), Some(body));

    let backend = physics.backend();
    assert_eq!(backend.actor_shapes(actor), vec![shape]);
    assert!(backend.actor(actor).in_scene);
    assert!(close(backend.actor_pose(actor).unwrap().translation, Vec3::new(0.0, 0.0, 5.0)));
    assert!(close(backend.shape_local_pose(shape).translation, Vec3::X));
    assert_eq!(backend.steps_started, 1);
}

#[test]
fn test_drain_is_idempotent() {
    let mut scene = Scene::new();
    let root = node_at(&mut scene, "crate", None, Vec3::ZERO);
    let body = scene.add_component(root, Body::dynamic()).unwrap();
    let collider = scene
        .add_component(root, Collider::sphere(0.5))
        .unwrap();

    let config = PhysicsConfig {
        simulation_enabled: false,
        ..Default::default()
    };
    let mut physics = physics_with(RecordingBackend::default(), config);
    physics.process(&mut scene, DT);
    assert!(!physics.backend().step_in_flight());

    // Queue both again, as a duplicate event would.
    physics.pending_bodies.push(body);
    physics.queue_collider(collider);
    physics.queue_collider(collider);
    assert_eq!(physics.pending_colliders.len(), 1);
    physics.drain_pending(&mut scene);

    let backend = physics.backend();
    assert_eq!(backend.actors_created, 1);
    assert_eq!(backend.shapes_created, 1);
    assert_eq!(backend.actor_shapes(physics.body_actor(body).unwrap()).len(), 1);
}

#[test]
fn test_mass_derived_from_colliders() {
    let mut scene = Scene::new();
    let root = node_at(&mut scene, "cart", None, Vec3::ZERO);
    let body = scene.add_component(root, Body::dynamic()).unwrap();
    let derived = scene
        .add_component(root, Collider::cuboid(Vec3::new(1.0, 0.5, 0.5)))
        .unwrap();
    let mut heavy = Collider::sphere(0.25);
    heavy.set_override_mass(true);
    heavy.set_mass(5.0);
    let explicit = scene.add_component(root, heavy).unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);

    // 2 x 1 x 1 box at unit density.
    assert_eq!(scene.collider(derived).unwrap().mass(), 2.0);
    assert_eq!(scene.collider(explicit).unwrap().mass(), 5.0);
    let actor = physics.body_actor(body).unwrap();
    assert!((physics.backend().actor_mass(actor) - 7.0).abs() < 1e-5);
}

#[test]
fn test_mass_follows_override_edit() {
    let mut scene = Scene::new();
    let root = node_at(&mut scene, "cart", None, Vec3::ZERO);
    let body = scene.add_component(root, Body::dynamic()).unwrap();
    let collider = scene
        .add_component(root, Collider::cuboid(Vec3::new(1.0, 0.5, 0.5)))
        .unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);
    let actor = physics.body_actor(body).unwrap();
    assert!((physics.backend().actor_mass(actor) - 2.0).abs() < 1e-5);

    let component = scene.collider_mut(collider).unwrap();
    component.set_override_mass(true);
    component.set_mass(9.0);
    physics.process(&mut scene, DT);

    assert!(
        (physics.backend().actor_mass(actor) - 9.0).abs() < 1e-5,
        "mass {}",
        physics.backend().actor_mass(actor)
    );
    assert_eq!(scene.collider(collider).unwrap().mass(), 9.0);
}

#[test]
fn test_ccd_bit_only_on_requesting_bodies() {
    let mut scene = Scene::new();
    let fast = node_at(&mut scene, "bullet", None, Vec3::ZERO);
    scene
        .add_component(
            fast,
            Body {
                variant: BodyVariant::Dynamic(DynamicParams {
                    ccd_enabled: true,
                    ..Default::default()
                }),
                flags: BodyFlags::empty(),
            },
        )
        .unwrap();
    let fast_collider = scene
        .add_component(fast, Collider::sphere(0.1).with_masks(0x4, 0x8))
        .unwrap();
    let slow = node_at(&mut scene, "rock", None, Vec3::X * 5.0);
    scene.add_component(slow, Body::dynamic()).unwrap();
    let slow_collider = scene.add_component(slow, Collider::sphere(1.0)).unwrap();

    let config = PhysicsConfig {
        ccd_enabled: true,
        ..Default::default()
    };
    let mut physics = physics_with(RecordingBackend::default(), config);
    physics.process(&mut scene, DT);

    let backend = physics.backend();
    let fast_filter = backend.simulation_filter(physics.collider_shape(fast_collider).unwrap());
    let slow_filter = backend.simulation_filter(physics.collider_shape(slow_collider).unwrap());
    assert!(fast_filter.ccd_enabled());
    assert_eq!((fast_filter.type_mask(), fast_filter.collide_with_mask()), (0x4, 0x8));
    assert!(!slow_filter.ccd_enabled());
}

#[test]
fn test_ccd_requires_global_switch() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "bullet", None, Vec3::ZERO);
    scene
        .add_component(
            node,
            Body {
                variant: BodyVariant::Dynamic(DynamicParams {
                    ccd_enabled: true,
                    ..Default::default()
                }),
                flags: BodyFlags::empty(),
            },
        )
        .unwrap();
    let collider = scene.add_component(node, Collider::sphere(0.1)).unwrap();

    let config = PhysicsConfig {
        ccd_enabled: false,
        ..Default::default()
    };
    let mut physics = physics_with(RecordingBackend::default(), config);
    physics.process(&mut scene, DT);
    let shape = physics.collider_shape(collider).unwrap();
    assert!(!physics.backend().simulation_filter(shape).ccd_enabled());
}

// ---------------------------------------------------------------------------
// Stepping
// ---------------------------------------------------------------------------

#[test]
fn test_single_step_in_flight() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "ball", None, Vec3::ZERO);
    scene.add_component(node, Body::dynamic()).unwrap();

    let backend = RecordingBackend {
        polls_to_complete: 2,
        ..Default::default()
    };
    let mut physics = physics_with(backend, PhysicsConfig::default());

    physics.process(&mut scene, DT);
    assert!(physics.is_running());
    physics.process(&mut scene, DT);
    physics.process(&mut scene, DT);
    assert_eq!(physics.backend().steps_started, 1, "no second step while one is outstanding");

    physics.process(&mut scene, DT);
    assert_eq!(physics.backend().steps_completed, 1);
    assert_eq!(physics.backend().steps_started, 2);
    assert_eq!(physics.backend().last_dt, DT);
}

#[test]
fn test_release_deferred_while_running() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "ball", None, Vec3::ZERO);
    scene.add_component(node, Body::dynamic()).unwrap();
    let collider = scene.add_component(node, Collider::sphere(0.5)).unwrap();

    let backend = RecordingBackend {
        polls_to_complete: 1,
        ..Default::default()
    };
    let mut physics = physics_with(backend, PhysicsConfig::default());
    physics.process(&mut scene, DT);
    let shape = physics.collider_shape(collider).unwrap();

    scene.remove_component(collider);
    physics.process(&mut scene, DT);
    assert!(physics.is_running());
    assert!(physics.collider_shape(collider).is_none());
    assert!(
        physics.backend().shapes.contains_key(&shape),
        "shape must outlive the outstanding step"
    );

    physics.process(&mut scene, DT);
    assert!(!physics.backend().shapes.contains_key(&shape));
    assert_eq!(physics.backend().released_shapes, vec![shape]);
}

#[test]
fn test_forces_reach_dynamic_bodies_only() {
    let mut scene = Scene::new();
    let ball = node_at(&mut scene, "ball", None, Vec3::ZERO);
    let dynamic = scene.add_component(ball, Body::dynamic()).unwrap();
    let wall = node_at(&mut scene, "wall", None, Vec3::X * 4.0);
    let fixed = scene.add_component(wall, Body::fixed()).unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);
    physics.apply_force(dynamic, Vec3::Z * 10.0, ForceMode::Impulse);
    physics.apply_force(fixed, Vec3::Z * 10.0, ForceMode::Impulse);
    physics.process(&mut scene, DT);

    let forces = &physics.backend().forces;
    assert_eq!(forces.len(), 1);
    assert_eq!(forces[0].actor, physics.body_actor(dynamic).unwrap());
    assert_eq!(forces[0].mode, ForceMode::Impulse);
}

#[test]
fn test_disabled_simulation_pushes_edits_down() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "door", None, Vec3::ZERO);
    let body = scene.add_component(node, Body::dynamic()).unwrap();

    let config = PhysicsConfig {
        simulation_enabled: false,
        ..Default::default()
    };
    let mut physics = physics_with(RecordingBackend::default(), config);
    physics.process(&mut scene, DT);

    scene
        .set_local_translation(node, Vec3::new(2.0, 3.0, 0.0))
        .unwrap();
    physics.process(&mut scene, DT);

    let actor = physics.body_actor(body).unwrap();
    assert!(close(
        physics.backend().actor_pose(actor).unwrap().translation,
        Vec3::new(2.0, 3.0, 0.0)
    ));
    assert_eq!(physics.backend().steps_started, 0);
}

#[test]
fn test_edit_during_step_pushed_down_after_disable() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "gate", None, Vec3::ZERO);
    let body = scene.add_component(node, Body::fixed()).unwrap();
    scene
        .add_component(node, Collider::cuboid(Vec3::splat(0.5)))
        .unwrap();

    let backend = RecordingBackend {
        polls_to_complete: 1,
        ..Default::default()
    };
    let mut physics = physics_with(backend, PhysicsConfig::default());
    physics.process(&mut scene, DT);
    assert!(physics.is_running());

    physics.set_simulation_enabled(false);
    scene
        .set_local_translation(node, Vec3::new(7.0, 0.0, 0.0))
        .unwrap();
    physics.process(&mut scene, DT);
    assert!(physics.is_running(), "step should still be in flight");

    physics.process(&mut scene, DT);
    assert!(!physics.is_running());
    let actor = physics.body_actor(body).unwrap();
    let pose = physics.backend().actor_pose(actor).unwrap();
    assert!(close(pose.translation, Vec3::new(7.0, 0.0, 0.0)), "{pose:?}");
    assert_eq!(physics.backend().steps_started, 1);
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

#[test]
fn test_completed_step_publishes_poses() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "ball", None, Vec3::ZERO);
    let body = scene.add_component(node, Body::dynamic()).unwrap();
    let child = node_at(&mut scene, "shell", Some(node), Vec3::Y);
    scene.add_component(child, Collider::sphere(0.5)).unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);
    let actor = physics.body_actor(body).unwrap();
    let moved = Pose::new(Vec3::new(3.0, 0.0, 1.0), Quat::from_rotation_z(std::f32::consts::FRAC_PI_2));
    physics.backend_mut().place_actor(actor, moved);

    physics.process(&mut scene, DT);

    let world = scene.world_transform(node).unwrap();
    assert!(close(world.w_axis.truncate(), Vec3::new(3.0, 0.0, 1.0)));
    let child_world = scene.world_transform(child).unwrap();
    assert!(
        close(child_world.w_axis.truncate(), Vec3::new(2.0, 0.0, 1.0)),
        "child follows the rotated body: {child_world}"
    );
}

#[test]
fn test_collision_events_published_per_step() {
    let mut scene = Scene::new();
    let a = node_at(&mut scene, "a", None, Vec3::ZERO);
    scene.add_component(a, Body::dynamic()).unwrap();
    let ca = scene.add_component(a, Collider::sphere(0.5)).unwrap();
    let b = node_at(&mut scene, "b", None, Vec3::Z);
    scene.add_component(b, Body::fixed()).unwrap();
    let cb = scene.add_component(b, Collider::sphere(0.5)).unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);
    let (sa, sb) = (
        physics.collider_shape(ca).unwrap(),
        physics.collider_shape(cb).unwrap(),
    );
    let points = vec![
        ContactPoint {
            position: Vec3::Z * 0.5,
            impulse: Vec3::Z,
        };
        3
    ];
    physics.backend_mut().queued_contacts = vec![ContactReport {
        shape_a: sa,
        shape_b: sb,
        points,
    }];

    physics.process(&mut scene, DT);
    let events = physics.collision_events();
    assert_eq!(events.len(), 1);
    assert_eq!((events[0].first, events[0].second), (a, b));
    assert_eq!(events[0].points.len(), 3);

    physics.process(&mut scene, DT);
    assert!(physics.collision_events().is_empty(), "events never accumulate");
}

#[test]
fn test_raycast_resolves_components() {
    let mut scene = Scene::new();
    let floor = node_at(&mut scene, "floor", None, Vec3::ZERO);
    let body = scene.add_component(floor, Body::fixed()).unwrap();
    let collider = scene
        .add_component(floor, Collider::cuboid(Vec3::new(10.0, 10.0, 1.0)))
        .unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);
    physics.process(&mut scene, DT);

    let hit = physics
        .raycast(Vec3::new(0.0, 0.0, 10.0), Vec3::new(0.0, 0.0, -2.0), 100.0)
        .expect("floor hit");
    assert_eq!(hit.collider, collider);
    assert_eq!(hit.body, Some(body));
    assert_eq!(hit.node, floor);
    assert!((hit.distance - 9.0).abs() < 1e-4);
    assert!(close(hit.normal, Vec3::Z));
    assert!(physics.raycast(Vec3::ZERO, Vec3::ZERO, 10.0).is_none());
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

#[test]
fn test_primitive_change_reuses_shape() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "ball", None, Vec3::ZERO);
    let body = scene.add_component(node, Body::dynamic()).unwrap();
    let collider = scene
        .add_component(node, Collider::cuboid(Vec3::splat(0.5)))
        .unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);
    let shape = physics.collider_shape(collider).unwrap();

    scene.collider_mut(collider).unwrap().geometry = ColliderGeometry::Sphere { radius: 2.0 };
    physics.process(&mut scene, DT);

    assert_eq!(physics.collider_shape(collider), Some(shape));
    assert_eq!(physics.backend().shapes_created, 1);
    assert_eq!(
        physics.backend().shape_geometry(shape),
        Some(ShapeGeometry::Sphere { radius: 2.0 })
    );
    let expected = 4.0 / 3.0 * std::f32::consts::PI * 8.0;
    let mass = physics.backend().actor_mass(physics.body_actor(body).unwrap());
    assert!((mass - expected).abs() < 1e-3, "mass {mass}");
}

#[test]
fn test_body_variant_change_recreates_actor() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "crate", None, Vec3::ZERO);
    let body = scene.add_component(node, Body::dynamic()).unwrap();
    let collider = scene.add_component(node, Collider::sphere(0.5)).unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);
    let old = physics.body_actor(body).unwrap();
    let shape = physics.collider_shape(collider).unwrap();

    scene.body_mut(body).unwrap().variant = BodyVariant::Static;
    physics.process(&mut scene, DT);

    let new = physics.body_actor(body).unwrap();
    assert_ne!(old, new);
    let backend = physics.backend();
    assert_eq!(backend.actor_kind(new), Some(ActorKind::Static));
    assert_eq!(backend.actor_kind(old), None);
    assert_eq!(backend.actor_shapes(new), vec![shape], "shape moves to the new actor");
}

#[test]
fn test_removed_body_orphans_then_adopts_colliders() {
    let mut scene = Scene::new();
    let outer = node_at(&mut scene, "outer", None, Vec3::ZERO);
    let outer_body = scene.add_component(outer, Body::fixed()).unwrap();
    let inner = node_at(&mut scene, "inner", Some(outer), Vec3::Z);
    let inner_body = scene.add_component(inner, Body::dynamic()).unwrap();
    let collider = scene.add_component(inner, Collider::sphere(0.5)).unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);
    assert_eq!(physics.collider_owner(collider), Some(inner_body));

    scene.remove_component(inner_body);
    physics.process(&mut scene, DT);
    physics.process(&mut scene, DT);

    assert_eq!(physics.collider_owner(collider), Some(outer_body));
    let shape = physics.collider_shape(collider).unwrap();
    let outer_actor = physics.body_actor(outer_body).unwrap();
    assert_eq!(physics.backend().shape_actor(shape), Some(outer_actor));
    assert!(close(physics.backend().shape_local_pose(shape).translation, Vec3::Z));
}

// ---------------------------------------------------------------------------
// Controllers
// ---------------------------------------------------------------------------

#[test]
fn test_walking_controller_falls_until_grounded() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "player", None, Vec3::new(0.0, 0.0, 2.0));
    let id = scene
        .add_component(node, CharacterController::new(ControllerGeometry::default_capsule()))
        .unwrap();

    let backend = RecordingBackend {
        floor: Some(0.0),
        ..Default::default()
    };
    let mut physics = physics_with(backend, PhysicsConfig::default());
    physics.process(&mut scene, DT);
    assert!(physics.controller_handle(id).is_some());

    scene
        .controller_mut_untracked(id)
        .unwrap()
        .move_by(Vec3::new(1.0, 0.0, 5.0));
    physics.process(&mut scene, DT);

    // Vertical input is dropped while walking; gravity pulls down on
    // every frame, the draining one included.
    let foot = scene.local_transform(node).unwrap().w_axis.truncate();
    assert!(close(foot, Vec3::new(1.0, 0.0, 2.0 - 2.0 * 9.81 * DT)), "{foot}");
    assert!(!scene.controller(id).unwrap().is_grounded());

    scene
        .controller_mut(id)
        .unwrap()
        .teleport(Vec3::new(5.0, 5.0, 0.0));
    physics.process(&mut scene, DT);
    let foot = scene.local_transform(node).unwrap().w_axis.truncate();
    assert!(close(foot, Vec3::new(5.0, 5.0, 0.0)), "{foot}");
    assert!(scene.controller(id).unwrap().is_grounded());
}

#[test]
fn test_flying_controller_keeps_vertical_input() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "drone", None, Vec3::ZERO);
    let mut controller = CharacterController::new(ControllerGeometry::default_box());
    controller.movement_mode = MovementMode::Flying;
    let id = scene.add_component(node, controller).unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);
    scene
        .controller_mut_untracked(id)
        .unwrap()
        .move_by(Vec3::new(0.0, 1.0, 3.0));
    physics.process(&mut scene, DT);

    let foot = scene.local_transform(node).unwrap().w_axis.truncate();
    assert!(close(foot, Vec3::new(0.0, 1.0, 3.0)), "{foot}");
}

// ---------------------------------------------------------------------------
// Geometry sources
// ---------------------------------------------------------------------------

fn tetrahedron(id: u64) -> RenderGeometry {
    let vertices: Vec<Vec3> = vec![Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z];
    let indices: Vec<u32> = vec![0, 2, 1, 0, 1, 3, 0, 3, 2, 1, 2, 3];
    RenderGeometry {
        fragments: vec![GeometryFragment {
            id: GeometryId(id),
            vertices: Arc::from(vertices),
            indices: Arc::from(indices),
        }],
    }
}

#[test]
fn test_mesh_collider_waits_for_render_geometry() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "statue", None, Vec3::ZERO);
    scene.add_component(node, Body::fixed()).unwrap();
    let collider = scene
        .add_component(node, Collider::new(ColliderGeometry::Mesh))
        .unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);
    assert!(physics.collider_shape(collider).is_none());
    assert!(physics.waiting_for_geometry.contains_key(&node));
    assert_eq!(physics.backend().cook_calls, 0);

    scene.add_component(node, tetrahedron(7)).unwrap();
    physics.process(&mut scene, DT);
    assert!(physics.collider_shape(collider).is_some());
    assert!(physics.waiting_for_geometry.is_empty());
    assert_eq!(physics.backend().cook_calls, 1);
}

#[test]
fn test_shared_source_geometry_cooked_once() {
    let mut scene = Scene::new();
    let mut physics = physics();
    let mut colliders = Vec::new();
    for i in 0..3 {
        let node = node_at(&mut scene, "rock", None, Vec3::X * i as f32 * 3.0);
        scene.add_component(node, tetrahedron(42)).unwrap();
        scene.add_component(node, Body::fixed()).unwrap();
        colliders.push(
            scene
                .add_component(node, Collider::new(ColliderGeometry::ConvexHull))
                .unwrap(),
        );
    }
    physics.process(&mut scene, DT);

    assert!(colliders.iter().all(|&c| physics.collider_shape(c).is_some()));
    assert_eq!(physics.backend().cook_calls, 1);
    assert_eq!(physics.cached_geometry_count(), 1);
}

#[test]
fn test_mesh_source_is_the_collider_node_only() {
    let mut scene = Scene::new();
    let mut physics = physics();
    let mut parents = Vec::new();
    for (i, offset) in [Vec3::X, Vec3::X * 3.0].into_iter().enumerate() {
        let node = node_at(&mut scene, "statue", None, Vec3::Y * i as f32 * 10.0);
        scene.add_component(node, Body::fixed()).unwrap();
        let collider = scene
            .add_component(node, Collider::new(ColliderGeometry::Mesh))
            .unwrap();
        let detail = node_at(&mut scene, "detail", Some(node), offset);
        scene.add_component(detail, tetrahedron(9)).unwrap();
        parents.push(collider);
    }
    physics.process(&mut scene, DT);

    // Child render data does not feed a parent's mesh collider.
    assert!(parents.iter().all(|&c| physics.collider_shape(c).is_none()));
    assert_eq!(physics.backend().cook_calls, 0);
    assert_eq!(physics.cached_geometry_count(), 0);
}

#[test]
fn test_mesh_source_keeps_raw_vertices() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "statue", None, Vec3::new(4.0, 0.0, 2.0));
    scene.add_component(node, Body::fixed()).unwrap();
    scene.add_component(node, tetrahedron(3)).unwrap();
    scene
        .add_component(node, Collider::new(ColliderGeometry::Mesh))
        .unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);

    assert_eq!(
        physics.backend().cooked_vertices,
        vec![Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z]
    );
}

#[test]
fn test_cook_failure_leaves_collider_detached() {
    let mut scene = Scene::new();
    let node = node_at(&mut scene, "statue", None, Vec3::ZERO);
    scene.add_component(node, tetrahedron(1)).unwrap();
    let body = scene.add_component(node, Body::fixed()).unwrap();
    let collider = scene
        .add_component(node, Collider::new(ColliderGeometry::Mesh))
        .unwrap();

    let backend = RecordingBackend {
        fail_cooking: true,
        ..Default::default()
    };
    let mut physics = physics_with(backend, PhysicsConfig::default());
    physics.process(&mut scene, DT);

    assert!(physics.collider_shape(collider).is_none());
    assert!(physics.waiting_for_geometry.is_empty(), "failures are not parked");
    let actor = physics.body_actor(body).unwrap();
    assert!(physics.backend().actor_shapes(actor).is_empty());
}

// ---------------------------------------------------------------------------
// Vehicles
// ---------------------------------------------------------------------------

struct Car {
    root: NodeId,
    body: ComponentId,
    vehicle: ComponentId,
    wheel_nodes: Vec<NodeId>,
}

fn spawn_car(scene: &mut Scene) -> Car {
    let root = node_at(scene, "car", None, Vec3::new(0.0, 0.0, 1.0));
    let body = scene.add_component(root, Body::dynamic()).unwrap();
    let vehicle = scene.add_component(root, Vehicle::car()).unwrap();

    let chassis = node_at(scene, "chassis", Some(root), Vec3::ZERO);
    scene.add_component(chassis, Chassis::default()).unwrap();
    let mut hull = Collider::cuboid(Vec3::new(2.0, 1.0, 0.5));
    hull.set_override_mass(true);
    hull.set_mass(1000.0);
    scene.add_component(chassis, hull).unwrap();

    let mut wheel_nodes = Vec::new();
    for (x, y) in [(1.5, 0.8), (1.5, -0.8), (-1.5, 0.8), (-1.5, -0.8)] {
        let wheel = node_at(scene, "wheel", Some(root), Vec3::new(x, y, -0.5));
        scene.add_component(wheel, Wheel::default()).unwrap();
        scene.add_component(wheel, Collider::sphere(0.5)).unwrap();
        wheel_nodes.push(wheel);
    }
    Car {
        root,
        body,
        vehicle,
        wheel_nodes,
    }
}

fn built(physics: &PhysicsSystem<RecordingBackend>, vehicle: ComponentId) -> &BuiltVehicle {
    match physics.vehicle_state(vehicle) {
        Some(VehicleState::Built(built)) => &**built,
        other => panic!("vehicle not built: {other:?}"),
    }
}

fn ground_backend() -> RecordingBackend {
    RecordingBackend {
        ground: Some(0.0),
        ..Default::default()
    }
}

#[test]
fn test_vehicle_builds_with_sprung_masses() {
    let mut scene = Scene::new();
    let car = spawn_car(&mut scene);
    let mut physics = physics_with(ground_backend(), PhysicsConfig::default());
    physics.process(&mut scene, DT);

    let vehicle = built(&physics, car.vehicle);
    assert_eq!(vehicle.body, car.body);
    assert_eq!(vehicle.wheels.len(), 4);
    assert_eq!(vehicle.mass, 1000.0);
    assert!(vehicle.wheels.iter().all(|w| (w.sprung_mass - 250.0).abs() < 1e-2));

    let backend = physics.backend();
    let actor = backend.actor(vehicle.actor);
    assert_eq!(actor.mass, 1000.0);
    assert_eq!(actor.center_of_mass, Vec3::ZERO);
    // 4 x 2 x 1 chassis box.
    let expected = Vec3::new(17.0, 20.0, 5.0) * (1000.0 / 12.0);
    assert!((actor.inertia - expected).length() < 1e-2, "{}", actor.inertia);

    let chassis_shape = physics.collider_shape(vehicle.chassis_collider).unwrap();
    assert_eq!(backend.simulation_filter(chassis_shape).type_mask(), CHASSIS_TYPE);
    for wheel in &vehicle.wheels {
        assert_eq!(backend.simulation_filter(wheel.shape).type_mask(), WHEEL_TYPE);
        assert_eq!(backend.query_filter(wheel.shape).word3, UNDRIVABLE_SURFACE);
    }
}

#[test]
fn test_vehicle_wheels_follow_shape_order() {
    let mut scene = Scene::new();
    let car = spawn_car(&mut scene);
    let mut physics = physics_with(ground_backend(), PhysicsConfig::default());
    physics.process(&mut scene, DT);

    let vehicle = built(&physics, car.vehicle);
    let shapes = physics.backend().actor_shapes(vehicle.actor);
    let order: Vec<usize> = vehicle
        .wheels
        .iter()
        .map(|w| shapes.iter().position(|&s| s == w.shape).unwrap())
        .collect();
    assert!(order.windows(2).all(|p| p[0] < p[1]), "{order:?}");
    let nodes: Vec<NodeId> = vehicle.wheels.iter().map(|w| w.node).collect();
    assert_eq!(nodes, car.wheel_nodes);
}

#[test]
fn test_vehicle_step_applies_suspension_and_resets_inputs() {
    let mut scene = Scene::new();
    let car = spawn_car(&mut scene);
    if let Some(vehicle) = scene.vehicle_mut(car.vehicle) {
        vehicle.drivetrain = Drivetrain::Car(CarInput {
            acceleration: 1.0,
            ..Default::default()
        });
    }
    let mut physics = physics_with(ground_backend(), PhysicsConfig::default());
    physics.process(&mut scene, DT);

    // Wheels rest exactly on the ground: each spring carries its share.
    let forces = &physics.backend().forces;
    assert_eq!(forces.len(), 4);
    for force in forces {
        assert!(force.point.is_some());
        assert!((force.force.z - 250.0 * 9.81).abs() < 1.0, "{force:?}");
    }

    let vehicle = scene.vehicle(car.vehicle).unwrap();
    assert_eq!(vehicle.drivetrain, Drivetrain::Car(CarInput::default()));
    let state = built(&physics, car.vehicle);
    assert!(state.drive.inputs.acceleration() > 0.0, "smoothed throttle rises");
    assert!(state.wheels.iter().all(|w| w.dynamics.in_contact));
}

#[test]
fn test_vehicle_without_ground_has_no_contact() {
    let mut scene = Scene::new();
    let car = spawn_car(&mut scene);
    let mut physics = physics();
    physics.process(&mut scene, DT);

    assert!(physics.backend().forces.is_empty());
    let state = built(&physics, car.vehicle);
    for wheel in &state.wheels {
        assert!(!wheel.dynamics.in_contact);
        assert!((wheel.dynamics.jounce + 0.1).abs() < 1e-6);
        let pose = physics.backend().shape_local_pose(wheel.shape);
        assert!((pose.translation.z - (wheel.rest_pose.translation.z - 0.1)).abs() < 1e-5);
    }
}

#[test]
fn test_vehicle_rebuilt_after_losing_a_wheel() {
    let mut scene = Scene::new();
    let car = spawn_car(&mut scene);
    let mut physics = physics_with(ground_backend(), PhysicsConfig::default());
    physics.process(&mut scene, DT);
    physics.process(&mut scene, DT);
    assert_eq!(built(&physics, car.vehicle).wheels.len(), 4);

    scene.remove_node(car.wheel_nodes[3]).unwrap();
    physics.process(&mut scene, DT);

    let vehicle = built(&physics, car.vehicle);
    assert_eq!(vehicle.wheels.len(), 3);
    let total: f32 = vehicle.wheels.iter().map(|w| w.sprung_mass).sum();
    assert!((total - 1000.0).abs() < 0.5, "total {total}");

    // The rebuild owns the mass; no shape-derived mass overwrites it.
    physics.process(&mut scene, DT);
    physics.process(&mut scene, DT);
    let vehicle = built(&physics, car.vehicle);
    assert_eq!(physics.backend().actor(vehicle.actor).mass, 1000.0);
}

#[test]
fn test_vehicle_stays_unbuilt_without_chassis() {
    let mut scene = Scene::new();
    let root = node_at(&mut scene, "cart", None, Vec3::Z);
    scene.add_component(root, Body::dynamic()).unwrap();
    let vehicle = scene.add_component(root, Vehicle::tank()).unwrap();
    let wheel = node_at(&mut scene, "wheel", Some(root), Vec3::new(1.0, 0.5, -0.5));
    scene.add_component(wheel, Wheel::default()).unwrap();
    scene.add_component(wheel, Collider::sphere(0.5)).unwrap();

    let mut physics = physics();
    physics.process(&mut scene, DT);
    assert_eq!(physics.vehicle_state(vehicle), Some(&VehicleState::Unbuilt));
    assert_eq!(physics.vehicle_count(), 1);
}

#[test]
fn test_removing_vehicle_restores_plain_filters() {
    let mut scene = Scene::new();
    let car = spawn_car(&mut scene);
    let mut physics = physics_with(ground_backend(), PhysicsConfig::default());
    physics.process(&mut scene, DT);
    let shapes: Vec<ShapeHandle> = built(&physics, car.vehicle)
        .wheels
        .iter()
        .map(|w| w.shape)
        .collect();

    scene.remove_component(car.vehicle);
    physics.process(&mut scene, DT);
    // The body's mass is re-derived on the frame after the teardown.
    physics.process(&mut scene, DT);

    assert!(physics.vehicle_state(car.vehicle).is_none());
    for shape in shapes {
        let filter = physics.backend().simulation_filter(shape);
        assert_eq!(filter.type_mask(), kinesis_scene::DEFAULT_TYPE_MASK);
        assert_eq!(physics.backend().query_filter(shape).word3, 0);
    }
    let actor = physics.body_actor(car.body).unwrap();
    assert!(physics.backend().actor_mass(actor) > 1000.0, "mass derived from every shape again");
    assert!(scene.world_transform(car.root).is_some());
}

#[test]
fn test_toggling_simulation_rebuilds_vehicles() {
    let mut scene = Scene::new();
    let car = spawn_car(&mut scene);
    let mut physics = physics_with(ground_backend(), PhysicsConfig::default());
    physics.process(&mut scene, DT);
    built(&physics, car.vehicle);

    physics.set_simulation_enabled(false);
    assert_eq!(physics.vehicle_state(car.vehicle), Some(&VehicleState::Unbuilt));
    physics.set_simulation_enabled(true);
    physics.process(&mut scene, DT);
    let vehicle = built(&physics, car.vehicle);
    assert!(vehicle.wheels.iter().all(|w| w.dynamics.in_contact));
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[test]
fn test_prepare_for_remove_releases_everything() {
    let mut scene = Scene::new();
    spawn_car(&mut scene);
    let player = node_at(&mut scene, "player", None, Vec3::ZERO);
    scene
        .add_component(player, CharacterController::new(ControllerGeometry::default_box()))
        .unwrap();
    let statue = node_at(&mut scene, "statue", None, Vec3::X * 10.0);
    scene.add_component(statue, tetrahedron(3)).unwrap();
    scene.add_component(statue, Body::fixed()).unwrap();
    scene
        .add_component(statue, Collider::new(ColliderGeometry::Mesh))
        .unwrap();

    let backend = RecordingBackend {
        polls_to_complete: 5,
        ..Default::default()
    };
    let mut physics = physics_with(backend, PhysicsConfig::default());
    physics.process(&mut scene, DT);
    assert!(physics.is_running());

    physics.prepare_for_remove();
    let backend = physics.backend();
    assert!(!backend.step_in_flight());
    assert!(backend.actors.is_empty());
    assert_eq!(backend.shape_count(), 0);
    assert!(backend.controllers.is_empty());
    assert!(backend.cooked.is_empty());
    assert_eq!(physics.cached_geometry_count(), 0);

    physics.prepare_for_remove();
}
