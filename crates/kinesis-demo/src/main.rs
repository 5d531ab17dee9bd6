//! Headless demo: drops a pile of crates onto a floor, drives a car across
//! it and walks a character controller, logging what the physics layer
//! publishes back into the scene.
//!
//! Configuration is loaded from `physics.ron` and can be overridden via CLI
//! flags. Run with `cargo run -p kinesis-demo -- --frames 600`.

use std::path::PathBuf;

use bevy_ecs::prelude::*;
use clap::Parser;
use glam::Vec3;
use kinesis_config::{CliArgs, Config, MaterialLibrary};
use kinesis_physics::{FrameDelta, PhysicsSystem, RapierBackend, VehicleState, physics_process_system};
use kinesis_scene::{
    Body, CarInput, CharacterController, Chassis, Collider, ComponentId, ControllerGeometry,
    Drivetrain, NodeId, Scene, Vehicle, Wheel,
};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use tracing::{info, warn};

const DEFAULT_FRAMES: u32 = 300;
const CRATE_COUNT: usize = 40;
const FRAME_TIME: f32 = 1.0 / 60.0;

/// Handles the input system drives every frame.
#[derive(Resource, Debug, Clone, Copy)]
struct DemoActors {
    car: ComponentId,
    car_node: NodeId,
    player: ComponentId,
    player_node: NodeId,
}

/// Frame counter for periodic reports.
#[derive(Resource, Debug, Default)]
struct FrameCount(u32);

fn spawn(scene: &mut Scene, name: &str, parent: Option<NodeId>, at: Vec3) -> Option<NodeId> {
    let node = scene.create_node(name, parent).ok()?;
    scene.set_local_translation(node, at).ok()?;
    Some(node)
}

/// Floor slab with its top face at z = 0. Returns the floor collider.
fn build_floor(scene: &mut Scene) -> Option<ComponentId> {
    let floor = spawn(scene, "floor", None, Vec3::new(0.0, 0.0, -0.5))?;
    scene.add_component(floor, Body::fixed()).ok()?;
    scene
        .add_component(
            floor,
            Collider::cuboid(Vec3::new(60.0, 60.0, 0.5)).with_material("concrete"),
        )
        .ok()
}

fn build_crates(scene: &mut Scene, rng: &mut Xoshiro256StarStar) {
    for i in 0..CRATE_COUNT {
        let at = Vec3::new(
            rng.gen_range(-8.0..8.0),
            rng.gen_range(-8.0..8.0),
            rng.gen_range(2.0..14.0),
        );
        let half = Vec3::new(
            rng.gen_range(0.2..0.8),
            rng.gen_range(0.2..0.8),
            rng.gen_range(0.2..0.8),
        );
        let Some(node) = spawn(scene, &format!("crate-{i}"), None, at) else {
            continue;
        };
        let material = if rng.gen_bool(0.25) { "rubber" } else { "concrete" };
        if scene.add_component(node, Body::dynamic()).is_err()
            || scene
                .add_component(node, Collider::cuboid(half).with_material(material))
                .is_err()
        {
            warn!(crate_index = i, "failed to spawn crate");
        }
    }
}

/// A four-wheeled car resting on the floor at `at`.
fn build_car(scene: &mut Scene, at: Vec3) -> Option<(NodeId, ComponentId)> {
    let root = spawn(scene, "car", None, at)?;
    scene.add_component(root, Body::dynamic()).ok()?;
    let vehicle = scene.add_component(root, Vehicle::car()).ok()?;

    let chassis = spawn(scene, "chassis", Some(root), Vec3::ZERO)?;
    scene
        .add_component(
            chassis,
            Chassis {
                center_of_mass_offset: Vec3::new(0.0, 0.0, -0.2),
            },
        )
        .ok()?;
    let mut hull = Collider::cuboid(Vec3::new(2.2, 0.9, 0.4));
    hull.set_override_mass(true);
    hull.set_mass(1500.0);
    scene.add_component(chassis, hull).ok()?;

    for (i, (x, y)) in [(1.6, 0.9), (1.6, -0.9), (-1.6, 0.9), (-1.6, -0.9)]
        .into_iter()
        .enumerate()
    {
        let wheel = spawn(scene, &format!("wheel-{i}"), Some(root), Vec3::new(x, y, -0.5))?;
        scene.add_component(wheel, Wheel::default()).ok()?;
        scene
            .add_component(wheel, Collider::sphere(0.5).with_material("tire"))
            .ok()?;
    }
    Some((root, vehicle))
}

fn build_player(scene: &mut Scene, at: Vec3) -> Option<(NodeId, ComponentId)> {
    let node = spawn(scene, "player", None, at)?;
    let controller = scene
        .add_component(node, CharacterController::new(ControllerGeometry::default_capsule()))
        .ok()?;
    Some((node, controller))
}

/// Full throttle for the car, a steady walk for the player.
fn drive_inputs(actors: Res<DemoActors>, delta: Res<FrameDelta>, mut scene: ResMut<Scene>) {
    if let Some(vehicle) = scene.vehicle_mut_untracked(actors.car) {
        vehicle.drivetrain = Drivetrain::Car(CarInput {
            acceleration: 1.0,
            steer: 0.1,
            ..Default::default()
        });
    }
    if let Some(controller) = scene.controller_mut_untracked(actors.player) {
        controller.move_by(Vec3::new(1.5, 0.0, 0.0) * delta.0);
    }
}

fn report(
    actors: Res<DemoActors>,
    scene: Res<Scene>,
    physics: Res<PhysicsSystem<RapierBackend>>,
    mut frames: ResMut<FrameCount>,
) {
    frames.0 += 1;
    if frames.0 % 60 != 0 {
        return;
    }
    let position = |node: NodeId| {
        scene
            .world_transform(node)
            .map(|m| m.w_axis.truncate())
            .unwrap_or_default()
    };
    let built = matches!(physics.vehicle_state(actors.car), Some(VehicleState::Built(_)));
    let grounded = scene
        .controller(actors.player)
        .is_some_and(|c| c.is_grounded());
    info!(
        frame = frames.0,
        car = %position(actors.car_node),
        car_built = built,
        player = %position(actors.player_node),
        grounded,
        collisions = physics.collision_events().len(),
        "physics frame"
    );
}

fn main() {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("kinesis"))
            .unwrap_or_else(|| PathBuf::from("."))
    });

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    kinesis_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let materials_path = config_dir.join(&config.materials_file);
    let materials = MaterialLibrary::load_or_create(&materials_path).unwrap_or_else(|err| {
        warn!(%err, path = %materials_path.display(), "material library unavailable, using starter set");
        MaterialLibrary::starter()
    });
    info!(materials = materials.len(), "material library ready");

    let mut scene = Scene::new();
    let mut rng = Xoshiro256StarStar::seed_from_u64(42);
    let Some(floor) = build_floor(&mut scene) else {
        eprintln!("Failed to build the floor");
        return;
    };
    build_crates(&mut scene, &mut rng);
    let Some((car_node, car)) = build_car(&mut scene, Vec3::new(-20.0, 0.0, 1.0)) else {
        eprintln!("Failed to build the car");
        return;
    };
    let Some((player_node, player)) = build_player(&mut scene, Vec3::new(0.0, 12.0, 0.5)) else {
        eprintln!("Failed to build the player");
        return;
    };

    let [gx, gy, gz] = config.physics.gravity;
    let mut physics = PhysicsSystem::from_config(
        &config.physics,
        &materials,
        RapierBackend::new(Vec3::new(gx, gy, gz)),
    );
    // Registers the floor collider before it can be marked drivable.
    physics.process(&mut scene, 0.0);
    physics.finish_step(&mut scene);
    physics.set_drivable_surface(floor, true);

    let mut world = World::new();
    world.insert_resource(scene);
    world.insert_resource(physics);
    world.insert_resource(FrameDelta(FRAME_TIME));
    world.insert_resource(FrameCount::default());
    world.insert_resource(DemoActors {
        car,
        car_node,
        player,
        player_node,
    });

    let mut schedule = Schedule::default();
    schedule.add_systems((drive_inputs, physics_process_system::<RapierBackend>, report).chain());

    let frames = args.frames.unwrap_or(DEFAULT_FRAMES);
    info!(frames, crates = CRATE_COUNT, "running physics demo");
    for _ in 0..frames {
        schedule.run(&mut world);
    }

    if let Some(mut physics) = world.get_resource_mut::<PhysicsSystem<RapierBackend>>() {
        physics.prepare_for_remove();
    }
    info!("physics demo finished");
}
