//! [`PhysicsBackend`] on Rapier 3D.
//!
//! Shapes live in the backend whether or not they are attached: a detached
//! shape is only a record, and gets a Rapier collider when it is attached to
//! an actor. Simulation runs on a [`StepWorker`] thread which owns the
//! [`PhysicsWorld`] while a step is in flight.

use glam::{Quat, Vec3};
use rapier3d::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

use kinesis_config::MaterialDef;
use kinesis_scene::{BodyFlags, ControllerGeometry, DynamicParams, Landscape, LockFlags};

use crate::PhysicsWorld;
use crate::backend::{
    ActorHandle, ActorKind, ContactReport, ControllerDesc, ControllerHandle, ControllerMove,
    CookedMeshHandle, ForceMode, MaterialHandle, PhysicsBackend, Pose, RaycastHit, ShapeGeometry,
    ShapeHandle, SuspensionRay,
};
use crate::collision_events::ContactPoint;
use crate::filter::FilterData;
use crate::rapier_controller::{self, CharacterRig};
use crate::step_worker::{StepPoll, StepWorker};

type RapierPose = rapier3d::math::Pose;
type RapierRotation = rapier3d::math::Rotation;

/// Half extent of the slab standing in for an infinite plane (meters).
const PLANE_HALF_EXTENT: f32 = 10_000.0;
/// Half thickness of the plane slab (meters).
const PLANE_HALF_THICKNESS: f32 = 0.5;

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

macro_rules! glam_vec {
    ($v:expr) => {{
        let v = $v;
        Vec3::new(v.x, v.y, v.z)
    }};
}

macro_rules! glam_quat {
    ($q:expr) => {{
        let q = $q;
        Quat::from_xyzw(q.x, q.y, q.z, q.w)
    }};
}

fn to_vector(v: Vec3) -> Vector {
    Vector::new(v.x, v.y, v.z)
}

fn to_rapier_pose(pose: &Pose) -> RapierPose {
    let r = pose.rotation;
    RapierPose::from_parts(
        to_vector(pose.translation),
        RapierRotation::from_xyzw(r.x, r.y, r.z, r.w),
    )
}

fn from_rapier_pose(pose: &RapierPose) -> Pose {
    Pose::new(glam_vec!(pose.translation), glam_quat!(pose.rotation))
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct MaterialRecord {
    friction: f32,
    restitution: f32,
}

/// Cooked source data, kept CPU-side and instantiated per shape scale.
enum Cooked {
    Mesh {
        vertices: Vec<Vec3>,
        triangles: Vec<[u32; 3]>,
    },
    Hull {
        points: Vec<Vec3>,
    },
}

struct ShapeRecord {
    geometry: ShapeGeometry,
    scale: Vec3,
    local_pose: Pose,
    material: MaterialHandle,
    sim_filter: FilterData,
    query_filter: FilterData,
    /// Explicit mass; unit density when unset.
    mass: Option<f32>,
    /// Mass comes from actor-level properties instead.
    massless: bool,
    actor: Option<ActorHandle>,
    collider: Option<ColliderHandle>,
    shape: SharedShape,
    /// Offset of the engine shape inside the local frame (plane slabs).
    inner_offset: Pose,
}

impl ShapeRecord {
    fn collider_pose(&self) -> RapierPose {
        to_rapier_pose(&self.local_pose.mul(&self.inner_offset))
    }
}

struct ActorRecord {
    kind: ActorKind,
    body: RigidBodyHandle,
    shapes: Vec<ShapeHandle>,
    in_scene: bool,
    flags: BodyFlags,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Rapier-backed engine with asynchronous stepping.
pub struct RapierBackend {
    /// `None` while a step is in flight.
    world: Option<PhysicsWorld>,
    worker: Option<StepWorker<PhysicsWorld>>,
    in_flight: bool,
    gravity: Vec3,
    next_id: u64,

    materials: FxHashMap<u64, MaterialRecord>,
    cooked: FxHashMap<u64, Cooked>,
    shapes: FxHashMap<u64, ShapeRecord>,
    actors: FxHashMap<u64, ActorRecord>,
    controllers: FxHashMap<u64, CharacterRig>,
    collider_shapes: FxHashMap<ColliderHandle, ShapeHandle>,

    awake_last_step: FxHashSet<ActorHandle>,
    active: Vec<ActorHandle>,
    contacts: Vec<ContactReport>,
}

impl RapierBackend {
    /// Creates an empty world with the given gravity and its step thread.
    ///
    /// If the thread cannot be spawned, steps run inline on the caller.
    pub fn new(gravity: Vec3) -> Self {
        let mut world = PhysicsWorld::new();
        world.set_gravity(gravity.x, gravity.y, gravity.z);

        let worker = match StepWorker::spawn("physics-step", |world: &mut PhysicsWorld, dt| {
            world.step(dt)
        }) {
            Ok(worker) => Some(worker),
            Err(err) => {
                tracing::warn!(error = %err, "physics step thread unavailable, stepping inline");
                None
            }
        };

        Self {
            world: Some(world),
            worker,
            in_flight: false,
            gravity,
            next_id: 1,
            materials: FxHashMap::default(),
            cooked: FxHashMap::default(),
            shapes: FxHashMap::default(),
            actors: FxHashMap::default(),
            controllers: FxHashMap::default(),
            collider_shapes: FxHashMap::default(),
            awake_last_step: FxHashSet::default(),
            active: Vec::new(),
            contacts: Vec::new(),
        }
    }

    /// Direct access to the Rapier world, `None` while a step is in flight.
    pub fn world(&self) -> Option<&PhysicsWorld> {
        self.world.as_ref()
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn material(&self, handle: MaterialHandle) -> MaterialRecord {
        self.materials.get(&handle.0).copied().unwrap_or(MaterialRecord {
            friction: 0.5,
            restitution: 0.1,
        })
    }

    fn body_mut(&mut self, actor: ActorHandle) -> Option<&mut RigidBody> {
        let body = self.actors.get(&actor.0)?.body;
        self.world.as_mut()?.rigid_body_set.get_mut(body)
    }

    fn body(&self, actor: ActorHandle) -> Option<&RigidBody> {
        let body = self.actors.get(&actor.0)?.body;
        self.world.as_ref()?.rigid_body_set.get(body)
    }

    /// Builds the engine shape for a geometry at a scale, with the offset
    /// it needs inside the shape's local frame.
    fn build_shape(&self, geometry: &ShapeGeometry, scale: Vec3) -> Option<(SharedShape, Pose)> {
        let scale = scale.abs();
        let shape = match *geometry {
            ShapeGeometry::Box { half_extents } => {
                let h = half_extents * scale;
                SharedShape::cuboid(h.x, h.y, h.z)
            }
            ShapeGeometry::Capsule {
                radius,
                half_height,
            } => SharedShape::capsule_z(half_height * scale.z, radius * scale.x.max(scale.y)),
            ShapeGeometry::Sphere { radius } => SharedShape::ball(radius * scale.max_element()),
            ShapeGeometry::Plane => {
                let shape = SharedShape::cuboid(
                    PLANE_HALF_EXTENT,
                    PLANE_HALF_EXTENT,
                    PLANE_HALF_THICKNESS,
                );
                let offset = Pose::from_translation(Vec3::new(0.0, 0.0, -PLANE_HALF_THICKNESS));
                return Some((shape, offset));
            }
            ShapeGeometry::TriangleMesh { mesh, scale: s } => {
                self.instantiate_mesh(mesh, s.abs() * scale)?
            }
            ShapeGeometry::HeightField { mesh } => self.instantiate_mesh(mesh, scale)?,
            ShapeGeometry::ConvexHull { mesh, scale: s } => {
                let Some(Cooked::Hull { points }) = self.cooked.get(&mesh.0) else {
                    return None;
                };
                let s = s.abs() * scale;
                let points: Vec<Vector> = points.iter().map(|p| to_vector(*p * s)).collect();
                SharedShape::convex_hull(&points)?
            }
        };
        Some((shape, Pose::IDENTITY))
    }

    fn instantiate_mesh(&self, mesh: CookedMeshHandle, scale: Vec3) -> Option<SharedShape> {
        let Some(Cooked::Mesh {
            vertices,
            triangles,
        }) = self.cooked.get(&mesh.0)
        else {
            return None;
        };
        let vertices = vertices.iter().map(|v| to_vector(*v * scale)).collect();
        SharedShape::trimesh(vertices, triangles.clone()).ok()
    }

    /// Creates the collider of an attached shape.
    fn insert_collider(&mut self, shape: ShapeHandle, body: RigidBodyHandle) -> Option<ColliderHandle> {
        let record = self.shapes.get(&shape.0)?;
        let material = self.material(record.material);
        let mut builder = ColliderBuilder::new(record.shape.clone())
            .position(record.collider_pose())
            .friction(material.friction)
            .restitution(material.restitution)
            .user_data(record.sim_filter.pack())
            .active_hooks(ActiveHooks::FILTER_CONTACT_PAIRS);
        builder = match (record.massless, record.mass) {
            (true, _) => builder.density(0.0),
            (false, Some(mass)) => builder.mass(mass),
            (false, None) => builder.density(1.0),
        };
        let world = self.world.as_mut()?;
        let handle = world
            .collider_set
            .insert_with_parent(builder.build(), body, &mut world.rigid_body_set);
        self.collider_shapes.insert(handle, shape);
        Some(handle)
    }

    fn remove_collider(&mut self, collider: ColliderHandle) {
        self.collider_shapes.remove(&collider);
        if let Some(world) = self.world.as_mut() {
            world.collider_set.remove(
                collider,
                &mut world.island_manager,
                &mut world.rigid_body_set,
                true,
            );
        }
    }

    fn collider_mut(&mut self, shape: ShapeHandle) -> Option<&mut Collider> {
        let collider = self.shapes.get(&shape.0)?.collider?;
        self.world.as_mut()?.collider_set.get_mut(collider)
    }

    /// Rapier sweeps whole bodies, so a dynamic body runs CCD when any of
    /// its attached shapes carries the CCD bit in its simulation filter.
    fn sync_ccd(&mut self, actor: ActorHandle) {
        let Some(record) = self.actors.get(&actor.0) else {
            return;
        };
        let enabled = record.kind == ActorKind::Dynamic
            && record.shapes.iter().any(|shape| {
                self.shapes
                    .get(&shape.0)
                    .is_some_and(|s| s.sim_filter.ccd_enabled())
            });
        if let Some(body) = self.body_mut(actor) {
            body.enable_ccd(enabled);
        }
    }

    /// Rebuilds the engine shape after a geometry or scale change.
    fn refresh_shape(&mut self, shape: ShapeHandle) {
        let Some(record) = self.shapes.get(&shape.0) else {
            return;
        };
        let Some((built, offset)) = self.build_shape(&record.geometry, record.scale) else {
            tracing::warn!(shape = shape.0, "shape geometry rejected, keeping previous");
            return;
        };
        let Some(record) = self.shapes.get_mut(&shape.0) else {
            return;
        };
        record.shape = built.clone();
        record.inner_offset = offset;
        let pose = record.collider_pose();
        if let Some(collider) = self.collider_mut(shape) {
            collider.set_shape(built);
            collider.set_position_wrt_parent(pose);
        }
    }

    /// Finishes a step: recovers the world and harvests what changed.
    fn complete_step(&mut self, world: PhysicsWorld) {
        let mut active = Vec::new();
        let mut awake = FxHashSet::default();
        for (&id, record) in &self.actors {
            if !record.in_scene || record.kind != ActorKind::Dynamic {
                continue;
            }
            let Some(body) = world.rigid_body_set.get(record.body) else {
                continue;
            };
            let actor = ActorHandle(id);
            let is_awake = body.is_enabled() && !body.is_sleeping();
            if is_awake || self.awake_last_step.contains(&actor) {
                active.push(actor);
            }
            if is_awake {
                awake.insert(actor);
            }
        }
        active.sort_unstable();
        self.active = active;
        self.awake_last_step = awake;
        self.contacts = self.harvest_contacts(&world);
        self.world = Some(world);
    }

    fn harvest_contacts(&self, world: &PhysicsWorld) -> Vec<ContactReport> {
        let mut reports = Vec::new();
        for pair in world.narrow_phase.contact_pairs() {
            let (Some(&shape_a), Some(&shape_b)) = (
                self.collider_shapes.get(&pair.collider1),
                self.collider_shapes.get(&pair.collider2),
            ) else {
                continue;
            };
            let Some(frame) = world.collider_set.get(pair.collider1) else {
                continue;
            };
            let frame: RapierPose = *frame.position();

            let mut touching = false;
            let mut points = Vec::new();
            for manifold in &pair.manifolds {
                if manifold.data.solver_contacts.is_empty() {
                    continue;
                }
                touching = true;
                let normal = glam_vec!(manifold.data.normal);
                for contact in manifold.contacts() {
                    let position = frame * contact.local_p1;
                    points.push(ContactPoint {
                        position: glam_vec!(position),
                        impulse: normal * contact.data.impulse,
                    });
                }
            }
            if touching {
                reports.push(ContactReport {
                    shape_a,
                    shape_b,
                    points,
                });
            }
        }
        reports
    }

    fn cast(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        exclude: Option<ActorHandle>,
        required_word3: u32,
    ) -> Option<RaycastHit> {
        let world = self.world.as_ref()?;
        let direction = direction.try_normalize()?;
        let predicate = |handle: ColliderHandle, _: &Collider| -> bool {
            let Some(shape) = self.collider_shapes.get(&handle) else {
                return false;
            };
            required_word3 == 0
                || self
                    .shapes
                    .get(&shape.0)
                    .is_some_and(|r| r.query_filter.word3 & required_word3 != 0)
        };
        let mut filter = QueryFilter::new().predicate(&predicate);
        if let Some(body) = exclude.and_then(|a| self.actors.get(&a.0)).map(|r| r.body) {
            filter = filter.exclude_rigid_body(body);
        }
        let query_pipeline = world.broad_phase.as_query_pipeline(
            world.narrow_phase.query_dispatcher(),
            &world.rigid_body_set,
            &world.collider_set,
            filter,
        );
        let ray = Ray::new(to_vector(origin), to_vector(direction));
        let (collider, hit) = query_pipeline.cast_ray_and_get_normal(&ray, max_distance, true)?;
        let shape = *self.collider_shapes.get(&collider)?;
        let distance = hit.time_of_impact;
        Some(RaycastHit {
            actor: self.shapes.get(&shape.0).and_then(|r| r.actor),
            shape,
            position: origin + direction * distance,
            normal: glam_vec!(hit.normal),
            distance,
        })
    }
}

impl Default for RapierBackend {
    fn default() -> Self {
        let [x, y, z] = crate::DEFAULT_GRAVITY;
        Self::new(Vec3::new(x, y, z))
    }
}

impl PhysicsBackend for RapierBackend {
    // --- Materials ---

    fn create_material(&mut self, def: &MaterialDef) -> MaterialHandle {
        let id = self.alloc_id();
        // Rapier has a single friction coefficient per collider.
        self.materials.insert(
            id,
            MaterialRecord {
                friction: def.dynamic_friction.max(0.0),
                restitution: def.restitution.clamp(0.0, 1.0),
            },
        );
        MaterialHandle(id)
    }

    // --- Actors ---

    fn create_actor(&mut self, kind: ActorKind, pose: Pose) -> ActorHandle {
        let id = self.alloc_id();
        let builder = match kind {
            ActorKind::Static => RigidBodyBuilder::fixed(),
            ActorKind::Dynamic => RigidBodyBuilder::dynamic(),
        };
        // Bodies exist in the world from the start but stay disabled until
        // added to the scene.
        let mut body = builder.enabled(false).build();
        body.set_position(to_rapier_pose(&pose), false);
        let body = match self.world.as_mut() {
            Some(world) => world.rigid_body_set.insert(body),
            None => RigidBodyHandle::invalid(),
        };
        self.actors.insert(
            id,
            ActorRecord {
                kind,
                body,
                shapes: Vec::new(),
                in_scene: false,
                flags: BodyFlags::empty(),
            },
        );
        ActorHandle(id)
    }

    fn release_actor(&mut self, actor: ActorHandle) {
        let Some(record) = self.actors.get(&actor.0) else {
            return;
        };
        for shape in record.shapes.clone() {
            self.detach_shape(actor, shape);
        }
        let Some(record) = self.actors.remove(&actor.0) else {
            return;
        };
        self.awake_last_step.remove(&actor);
        self.active.retain(|a| *a != actor);
        if let Some(world) = self.world.as_mut() {
            world.max_angular_velocity.remove(&record.body);
            world.rigid_body_set.remove(
                record.body,
                &mut world.island_manager,
                &mut world.collider_set,
                &mut world.impulse_joint_set,
                &mut world.multibody_joint_set,
                true,
            );
        }
    }

    fn add_actor_to_scene(&mut self, actor: ActorHandle) {
        let Some(record) = self.actors.get_mut(&actor.0) else {
            return;
        };
        record.in_scene = true;
        let enabled = !record.flags.contains(BodyFlags::EXCLUDE_FROM_SIMULATION);
        if let Some(body) = self.body_mut(actor) {
            body.set_enabled(enabled);
            body.wake_up(true);
        }
    }

    fn actor_kind(&self, actor: ActorHandle) -> Option<ActorKind> {
        self.actors.get(&actor.0).map(|r| r.kind)
    }

    fn actor_count(&self, kind: ActorKind) -> usize {
        self.actors
            .values()
            .filter(|r| r.in_scene && r.kind == kind)
            .count()
    }

    fn set_actor_pose(&mut self, actor: ActorHandle, pose: Pose) {
        if let Some(body) = self.body_mut(actor) {
            body.set_position(to_rapier_pose(&pose), true);
        }
    }

    fn actor_pose(&self, actor: ActorHandle) -> Option<Pose> {
        self.body(actor).map(|b| from_rapier_pose(b.position()))
    }

    fn actor_shapes(&self, actor: ActorHandle) -> Vec<ShapeHandle> {
        self.actors
            .get(&actor.0)
            .map(|r| r.shapes.clone())
            .unwrap_or_default()
    }

    fn set_actor_flags(&mut self, actor: ActorHandle, flags: BodyFlags) {
        let Some(record) = self.actors.get_mut(&actor.0) else {
            return;
        };
        record.flags = flags;
        let enabled = record.in_scene && !flags.contains(BodyFlags::EXCLUDE_FROM_SIMULATION);
        if let Some(body) = self.body_mut(actor) {
            body.set_gravity_scale(
                if flags.contains(BodyFlags::DISABLE_GRAVITY) { 0.0 } else { 1.0 },
                true,
            );
            body.set_enabled(enabled);
        }
    }

    fn set_dynamic_params(&mut self, actor: ActorHandle, params: &DynamicParams) {
        let Some(handle) = self.actors.get(&actor.0).map(|r| r.body) else {
            return;
        };
        let Some(world) = self.world.as_mut() else {
            return;
        };
        world
            .max_angular_velocity
            .insert(handle, params.max_angular_velocity.max(0.0));
        let Some(body) = world.rigid_body_set.get_mut(handle) else {
            return;
        };
        let locks = params.lock_flags;
        body.set_linear_damping(params.linear_damping);
        body.set_angular_damping(params.angular_damping);
        body.set_enabled_translations(
            !locks.contains(LockFlags::LINEAR_X),
            !locks.contains(LockFlags::LINEAR_Y),
            !locks.contains(LockFlags::LINEAR_Z),
            true,
        );
        body.set_enabled_rotations(
            !locks.contains(LockFlags::ANGULAR_X),
            !locks.contains(LockFlags::ANGULAR_Y),
            !locks.contains(LockFlags::ANGULAR_Z),
            true,
        );
        // Rapier has one solver iteration count; extra position iterations
        // map onto it.
        let extra = params
            .position_iterations
            .max(params.velocity_iterations)
            .saturating_sub(1);
        body.set_additional_solver_iterations(extra as usize);
        self.sync_ccd(actor);
    }

    fn wake_actor(&mut self, actor: ActorHandle) {
        if let Some(body) = self.body_mut(actor) {
            body.wake_up(true);
        }
    }

    fn set_actor_mass_from_shapes(&mut self, actor: ActorHandle, shapes: &[(ShapeHandle, f32)]) {
        for &(shape, mass) in shapes {
            if let Some(record) = self.shapes.get_mut(&shape.0) {
                record.mass = Some(mass);
                record.massless = false;
            }
            if let Some(collider) = self.collider_mut(shape) {
                collider.set_mass(mass);
            }
        }
        let Some(handle) = self.actors.get(&actor.0).map(|r| r.body) else {
            return;
        };
        let Some(world) = self.world.as_mut() else {
            return;
        };
        if let Some(body) = world.rigid_body_set.get_mut(handle) {
            body.set_additional_mass_properties(MassProperties::default(), false);
            body.recompute_mass_properties_from_colliders(&world.collider_set);
        }
    }

    fn set_actor_mass_properties(
        &mut self,
        actor: ActorHandle,
        mass: f32,
        inertia: Vec3,
        center_of_mass: Vec3,
    ) {
        let Some(record) = self.actors.get(&actor.0) else {
            return;
        };
        let (handle, shapes) = (record.body, record.shapes.clone());
        for shape in shapes {
            if let Some(record) = self.shapes.get_mut(&shape.0) {
                record.massless = true;
            }
            if let Some(collider) = self.collider_mut(shape) {
                collider.set_density(0.0);
            }
        }
        let Some(world) = self.world.as_mut() else {
            return;
        };
        if let Some(body) = world.rigid_body_set.get_mut(handle) {
            let props = MassProperties::new(to_vector(center_of_mass), mass, to_vector(inertia));
            body.set_additional_mass_properties(props, true);
            body.recompute_mass_properties_from_colliders(&world.collider_set);
        }
    }

    fn actor_mass(&self, actor: ActorHandle) -> f32 {
        self.body(actor).map_or(0.0, |b| b.mass())
    }

    fn actor_linear_velocity(&self, actor: ActorHandle) -> Vec3 {
        self.body(actor).map_or(Vec3::ZERO, |b| glam_vec!(b.linvel()))
    }

    fn actor_velocity_at_point(&self, actor: ActorHandle, point: Vec3) -> Vec3 {
        let Some(body) = self.body(actor) else {
            return Vec3::ZERO;
        };
        let linear = glam_vec!(body.linvel());
        let angular = glam_vec!(body.angvel());
        let com = glam_vec!(body.center_of_mass());
        linear + angular.cross(point - com)
    }

    fn apply_force(&mut self, actor: ActorHandle, force: Vec3, mode: ForceMode) {
        let Some(body) = self.body_mut(actor) else {
            return;
        };
        if !body.is_dynamic() {
            return;
        }
        let mass = body.mass();
        match mode {
            ForceMode::Force => body.add_force(to_vector(force), true),
            ForceMode::Impulse => body.apply_impulse(to_vector(force), true),
            ForceMode::VelocityChange => body.apply_impulse(to_vector(force * mass), true),
            ForceMode::Acceleration => body.add_force(to_vector(force * mass), true),
        }
    }

    fn apply_force_at_point(&mut self, actor: ActorHandle, force: Vec3, point: Vec3, mode: ForceMode) {
        let Some(body) = self.body_mut(actor) else {
            return;
        };
        if !body.is_dynamic() {
            return;
        }
        let mass = body.mass();
        let p = to_vector(point);
        match mode {
            ForceMode::Force => body.add_force_at_point(to_vector(force), p, true),
            ForceMode::Impulse => body.apply_impulse_at_point(to_vector(force), p, true),
            ForceMode::VelocityChange => {
                body.apply_impulse_at_point(to_vector(force * mass), p, true)
            }
            ForceMode::Acceleration => body.add_force_at_point(to_vector(force * mass), p, true),
        }
    }

    // --- Cooking ---

    fn cook_triangle_mesh(&mut self, vertices: &[Vec3], indices: &[u32]) -> Option<CookedMeshHandle> {
        if vertices.is_empty() || indices.is_empty() || indices.len() % 3 != 0 {
            return None;
        }
        if indices.iter().any(|&i| i as usize >= vertices.len()) {
            return None;
        }
        let triangles: Vec<[u32; 3]> = indices
            .chunks_exact(3)
            .map(|t| [t[0], t[1], t[2]])
            .collect();
        // Validate once at unit scale.
        let points: Vec<Vector> = vertices.iter().map(|v| to_vector(*v)).collect();
        SharedShape::trimesh(points, triangles.clone()).ok()?;

        let id = self.alloc_id();
        self.cooked.insert(
            id,
            Cooked::Mesh {
                vertices: vertices.to_vec(),
                triangles,
            },
        );
        Some(CookedMeshHandle(id))
    }

    fn cook_convex_hull(&mut self, vertices: &[Vec3]) -> Option<CookedMeshHandle> {
        let points: Vec<Vector> = vertices.iter().map(|v| to_vector(*v)).collect();
        SharedShape::convex_hull(&points)?;

        let id = self.alloc_id();
        self.cooked.insert(
            id,
            Cooked::Hull {
                points: vertices.to_vec(),
            },
        );
        Some(CookedMeshHandle(id))
    }

    fn cook_height_field(&mut self, landscape: &Landscape) -> Option<CookedMeshHandle> {
        let res = landscape.resolution as usize;
        if res < 2 || landscape.heights.len() != res * res {
            return None;
        }
        let step = 1.0 / (res - 1) as f32;
        let mut vertices = Vec::with_capacity(res * res);
        for j in 0..res {
            for i in 0..res {
                let h = landscape.heights[j * res + i];
                vertices.push(Vec3::new(
                    i as f32 * step * landscape.size.x,
                    j as f32 * step * landscape.size.y,
                    h * landscape.size.z,
                ));
            }
        }
        let mut indices = Vec::with_capacity((res - 1) * (res - 1) * 6);
        for j in 0..res - 1 {
            for i in 0..res - 1 {
                let a = (j * res + i) as u32;
                let b = a + 1;
                let c = a + res as u32;
                let d = c + 1;
                indices.extend_from_slice(&[a, b, d, a, d, c]);
            }
        }
        self.cook_triangle_mesh(&vertices, &indices)
    }

    fn release_cooked(&mut self, mesh: CookedMeshHandle) {
        self.cooked.remove(&mesh.0);
    }

    // --- Shapes ---

    fn create_shape(&mut self, geometry: ShapeGeometry, material: MaterialHandle) -> Option<ShapeHandle> {
        let (shape, inner_offset) = self.build_shape(&geometry, Vec3::ONE)?;
        let id = self.alloc_id();
        self.shapes.insert(
            id,
            ShapeRecord {
                geometry,
                scale: Vec3::ONE,
                local_pose: Pose::IDENTITY,
                material,
                sim_filter: FilterData::default(),
                query_filter: FilterData::default(),
                mass: None,
                massless: false,
                actor: None,
                collider: None,
                shape,
                inner_offset,
            },
        );
        Some(ShapeHandle(id))
    }

    fn release_shape(&mut self, shape: ShapeHandle) {
        if let Some(actor) = self.shape_actor(shape) {
            self.detach_shape(actor, shape);
        }
        self.shapes.remove(&shape.0);
    }

    fn shape_count(&self) -> usize {
        self.shapes.len()
    }

    fn attach_shape(&mut self, actor: ActorHandle, shape: ShapeHandle) {
        let Some(body) = self.actors.get(&actor.0).map(|r| r.body) else {
            return;
        };
        match self.shapes.get(&shape.0).map(|r| r.actor) {
            None => return,
            Some(Some(current)) if current == actor => return,
            Some(Some(current)) => self.detach_shape(current, shape),
            Some(None) => {}
        }
        let collider = self.insert_collider(shape, body);
        if let Some(record) = self.shapes.get_mut(&shape.0) {
            record.actor = Some(actor);
            record.collider = collider;
        }
        if let Some(record) = self.actors.get_mut(&actor.0) {
            record.shapes.push(shape);
        }
        self.sync_ccd(actor);
    }

    fn detach_shape(&mut self, actor: ActorHandle, shape: ShapeHandle) {
        let Some(record) = self.shapes.get_mut(&shape.0) else {
            return;
        };
        if record.actor != Some(actor) {
            return;
        }
        record.actor = None;
        let collider = record.collider.take();
        if let Some(collider) = collider {
            self.remove_collider(collider);
        }
        if let Some(record) = self.actors.get_mut(&actor.0) {
            record.shapes.retain(|s| *s != shape);
        }
        self.sync_ccd(actor);
    }

    fn shape_actor(&self, shape: ShapeHandle) -> Option<ActorHandle> {
        self.shapes.get(&shape.0).and_then(|r| r.actor)
    }

    fn set_shape_geometry(&mut self, shape: ShapeHandle, geometry: ShapeGeometry) {
        if let Some(record) = self.shapes.get_mut(&shape.0) {
            record.geometry = geometry;
            self.refresh_shape(shape);
        }
    }

    fn shape_geometry(&self, shape: ShapeHandle) -> Option<ShapeGeometry> {
        self.shapes.get(&shape.0).map(|r| r.geometry)
    }

    fn set_shape_local_pose(&mut self, shape: ShapeHandle, pose: Pose) {
        let Some(record) = self.shapes.get_mut(&shape.0) else {
            return;
        };
        record.local_pose = pose;
        let collider_pose = record.collider_pose();
        if let Some(collider) = self.collider_mut(shape) {
            collider.set_position_wrt_parent(collider_pose);
        }
    }

    fn shape_local_pose(&self, shape: ShapeHandle) -> Pose {
        self.shapes
            .get(&shape.0)
            .map_or(Pose::IDENTITY, |r| r.local_pose)
    }

    fn set_shape_scale(&mut self, shape: ShapeHandle, scale: Vec3) {
        let Some(record) = self.shapes.get_mut(&shape.0) else {
            return;
        };
        if record.scale == scale {
            return;
        }
        record.scale = scale;
        self.refresh_shape(shape);
    }

    fn shape_scale(&self, shape: ShapeHandle) -> Vec3 {
        self.shapes.get(&shape.0).map_or(Vec3::ONE, |r| r.scale)
    }

    fn set_shape_material(&mut self, shape: ShapeHandle, material: MaterialHandle) {
        let Some(record) = self.shapes.get_mut(&shape.0) else {
            return;
        };
        record.material = material;
        let values = self.material(material);
        if let Some(collider) = self.collider_mut(shape) {
            collider.set_friction(values.friction);
            collider.set_restitution(values.restitution);
        }
    }

    fn shape_mass(&self, shape: ShapeHandle) -> f32 {
        self.shapes
            .get(&shape.0)
            .map_or(0.0, |r| r.shape.mass_properties(1.0).mass())
    }

    fn set_shape_mass(&mut self, shape: ShapeHandle, mass: f32) {
        let Some(record) = self.shapes.get_mut(&shape.0) else {
            return;
        };
        record.mass = Some(mass);
        if record.massless {
            return;
        }
        if let Some(collider) = self.collider_mut(shape) {
            collider.set_mass(mass);
        }
    }

    fn set_simulation_filter(&mut self, shape: ShapeHandle, filter: FilterData) {
        let Some(record) = self.shapes.get_mut(&shape.0) else {
            return;
        };
        record.sim_filter = filter;
        let actor = record.actor;
        if let Some(collider) = self.collider_mut(shape) {
            collider.user_data = filter.pack();
        }
        if let Some(actor) = actor {
            self.sync_ccd(actor);
        }
    }

    fn simulation_filter(&self, shape: ShapeHandle) -> FilterData {
        self.shapes
            .get(&shape.0)
            .map(|r| r.sim_filter)
            .unwrap_or_default()
    }

    fn set_query_filter(&mut self, shape: ShapeHandle, filter: FilterData) {
        if let Some(record) = self.shapes.get_mut(&shape.0) {
            record.query_filter = filter;
        }
    }

    fn query_filter(&self, shape: ShapeHandle) -> FilterData {
        self.shapes
            .get(&shape.0)
            .map(|r| r.query_filter)
            .unwrap_or_default()
    }

    // --- Character controllers ---

    fn create_controller(&mut self, desc: &ControllerDesc) -> Option<ControllerHandle> {
        let friction = self.material(desc.material).friction;
        let world = self.world.as_mut()?;
        let rig = rapier_controller::spawn_rig(world, desc, friction);
        let id = self.alloc_id();
        self.controllers.insert(id, rig);
        Some(ControllerHandle(id))
    }

    fn resize_controller(&mut self, controller: ControllerHandle, geometry: ControllerGeometry) {
        if let (Some(rig), Some(world)) = (self.controllers.get_mut(&controller.0), self.world.as_mut())
        {
            rapier_controller::resize_rig(world, rig, geometry);
        }
    }

    fn set_controller_position(&mut self, controller: ControllerHandle, foot_position: Vec3) {
        if let (Some(rig), Some(world)) = (self.controllers.get_mut(&controller.0), self.world.as_mut())
        {
            rapier_controller::place_rig(world, rig, foot_position);
        }
    }

    fn controller_position(&self, controller: ControllerHandle) -> Option<Vec3> {
        self.controllers.get(&controller.0).map(|rig| rig.foot)
    }

    fn move_controller(&mut self, controller: ControllerHandle, displacement: Vec3, dt: f32) -> ControllerMove {
        match (self.controllers.get_mut(&controller.0), self.world.as_mut()) {
            (Some(rig), Some(world)) => rapier_controller::move_rig(world, rig, displacement, dt),
            (rig, _) => ControllerMove {
                foot_position: rig.map_or(Vec3::ZERO, |r| r.foot),
                collision_down: false,
            },
        }
    }

    fn release_controller(&mut self, controller: ControllerHandle) {
        let Some(rig) = self.controllers.remove(&controller.0) else {
            return;
        };
        if let Some(world) = self.world.as_mut() {
            rapier_controller::despawn_rig(world, &rig);
        }
    }

    // --- Stepping ---

    fn simulate(&mut self, dt: f32) {
        if self.in_flight {
            tracing::warn!("simulate called with a step already in flight");
            return;
        }
        let Some(mut world) = self.world.take() else {
            return;
        };
        self.contacts.clear();
        if let Some(worker) = &self.worker {
            match worker.submit(world, dt) {
                Ok(()) => {
                    self.in_flight = true;
                    return;
                }
                Err(returned) => {
                    tracing::warn!("physics step thread gone, stepping inline");
                    self.worker = None;
                    world = returned;
                }
            }
        }
        world.step(dt);
        self.complete_step(world);
    }

    fn fetch_results(&mut self, block: bool) -> bool {
        if !self.in_flight {
            return true;
        }
        let poll = match &self.worker {
            Some(worker) if block => worker.fetch_blocking(),
            Some(worker) => worker.try_fetch(),
            None => StepPoll::Lost,
        };
        match poll {
            StepPoll::Done(world) => {
                self.in_flight = false;
                self.complete_step(world);
                true
            }
            StepPoll::Pending => false,
            StepPoll::Lost => {
                tracing::error!("physics step thread terminated, world state lost");
                self.in_flight = false;
                self.worker = None;
                let mut world = PhysicsWorld::new();
                world.set_gravity(self.gravity.x, self.gravity.y, self.gravity.z);
                self.world = Some(world);
                true
            }
        }
    }

    fn active_actors(&self) -> Vec<ActorHandle> {
        self.active.clone()
    }

    fn take_contacts(&mut self) -> Vec<ContactReport> {
        std::mem::take(&mut self.contacts)
    }

    // --- Queries ---

    fn raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<RaycastHit> {
        self.cast(origin, direction, max_distance, None, 0)
    }

    fn raycast_batch(&self, rays: &[SuspensionRay]) -> Vec<Option<RaycastHit>> {
        rays.iter()
            .map(|ray| {
                self.cast(
                    ray.origin,
                    ray.direction,
                    ray.max_distance,
                    ray.exclude_actor,
                    ray.required_word3,
                )
            })
            .collect()
    }

    fn gravity(&self) -> Vec3 {
        self.gravity
    }

    fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = gravity;
        if let Some(world) = self.world.as_mut() {
            world.set_gravity(gravity.x, gravity.y, gravity.z);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (RapierBackend, MaterialHandle) {
        let mut backend = RapierBackend::default();
        let material = backend.create_material(&MaterialDef::default());
        (backend, material)
    }

    fn step(backend: &mut RapierBackend) {
        backend.simulate(1.0 / 60.0);
        assert!(backend.fetch_results(true));
    }

    fn spawn_box(
        backend: &mut RapierBackend,
        material: MaterialHandle,
        kind: ActorKind,
        at: Vec3,
        half: Vec3,
    ) -> (ActorHandle, ShapeHandle) {
        let actor = backend.create_actor(kind, Pose::from_translation(at));
        let shape = backend
            .create_shape(ShapeGeometry::Box { half_extents: half }, material)
            .unwrap();
        backend.set_simulation_filter(shape, FilterData::simulation(1, u32::MAX));
        backend.attach_shape(actor, shape);
        backend.add_actor_to_scene(actor);
        (actor, shape)
    }

    #[test]
    fn test_detached_shape_survives_actor_release() {
        let (mut backend, material) = backend();
        let (actor, shape) = spawn_box(
            &mut backend,
            material,
            ActorKind::Static,
            Vec3::ZERO,
            Vec3::ONE,
        );
        backend.release_actor(actor);

        assert_eq!(backend.shape_count(), 1);
        assert_eq!(backend.shape_actor(shape), None);
        assert_eq!(backend.actor_count(ActorKind::Static), 0);
    }

    #[test]
    fn test_raycast_hits_static_box() {
        let (mut backend, material) = backend();
        let (actor, shape) = spawn_box(
            &mut backend,
            material,
            ActorKind::Static,
            Vec3::new(90.0, 0.0, 0.0),
            Vec3::splat(5.0),
        );
        step(&mut backend);

        let hit = backend
            .raycast(Vec3::ZERO, Vec3::X, 1000.0)
            .expect("ray should hit the box");
        assert_eq!(hit.shape, shape);
        assert_eq!(hit.actor, Some(actor));
        assert!((hit.distance - 85.0).abs() < 1e-3, "distance {}", hit.distance);
        assert!(backend.raycast(Vec3::ZERO, Vec3::X, 75.0).is_none());
    }

    #[test]
    fn test_dynamic_box_falls_and_is_active() {
        let (mut backend, material) = backend();
        let (actor, _) = spawn_box(
            &mut backend,
            material,
            ActorKind::Dynamic,
            Vec3::new(0.0, 0.0, 10.0),
            Vec3::splat(0.5),
        );
        for _ in 0..30 {
            step(&mut backend);
        }

        assert!(backend.active_actors().contains(&actor));
        let z = backend.actor_pose(actor).unwrap().translation.z;
        assert!(z < 10.0, "body should fall, z={z}");
    }

    #[test]
    fn test_world_unavailable_while_in_flight() {
        let (mut backend, _) = backend();
        backend.simulate(1.0 / 60.0);
        if backend.in_flight {
            assert!(backend.world().is_none());
        }
        assert!(backend.fetch_results(true));
        assert!(backend.world().is_some());
    }

    #[test]
    fn test_invalid_mesh_is_not_cooked() {
        let (mut backend, _) = backend();
        let vertices = [Vec3::ZERO, Vec3::X, Vec3::Y];
        assert!(backend.cook_triangle_mesh(&vertices, &[0, 1, 7]).is_none());
        assert!(backend.cook_triangle_mesh(&vertices, &[0, 1]).is_none());
        assert!(backend.cook_triangle_mesh(&vertices, &[0, 1, 2]).is_some());
    }

    #[test]
    fn test_query_word3_filters_suspension_rays() {
        let (mut backend, material) = backend();
        let (_, shape) = spawn_box(
            &mut backend,
            material,
            ActorKind::Static,
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::new(10.0, 10.0, 1.0),
        );
        step(&mut backend);

        let ray = SuspensionRay {
            origin: Vec3::new(0.0, 0.0, 1.0),
            direction: -Vec3::Z,
            max_distance: 5.0,
            exclude_actor: None,
            required_word3: crate::filter::DRIVABLE_SURFACE,
        };
        assert_eq!(backend.raycast_batch(&[ray]), vec![None]);

        backend.set_query_filter(shape, FilterData::query(crate::filter::DRIVABLE_SURFACE));
        let hits = backend.raycast_batch(&[ray]);
        assert!(hits[0].is_some_and(|h| (h.distance - 1.0).abs() < 1e-3));
    }
}
