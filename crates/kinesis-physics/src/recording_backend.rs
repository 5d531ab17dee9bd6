//! Deterministic in-memory backend for scheduler tests.
//!
//! Nothing moves: a step only completes after a configurable number of
//! polls, reports the queued contacts and marks every dynamic actor in the
//! scene as active. Mutations while a step is in flight panic.

use std::f32::consts::PI;

use glam::Vec3;
use rustc_hash::FxHashMap;

use kinesis_config::MaterialDef;
use kinesis_scene::{BodyFlags, ControllerGeometry, DynamicParams, Landscape};

use crate::backend::{
    ActorHandle, ActorKind, ContactReport, ControllerDesc, ControllerHandle, ControllerMove,
    CookedMeshHandle, ForceMode, MaterialHandle, PhysicsBackend, Pose, RaycastHit, ShapeGeometry,
    ShapeHandle, SuspensionRay,
};
use crate::filter::{DRIVABLE_SURFACE, FilterData};

/// Shape handle reported for hits on the ground plane.
pub(crate) const GROUND_SHAPE: ShapeHandle = ShapeHandle(u64::MAX);

#[derive(Debug, Clone)]
pub(crate) struct ActorEntry {
    pub kind: ActorKind,
    pub pose: Pose,
    pub shapes: Vec<ShapeHandle>,
    pub in_scene: bool,
    pub flags: BodyFlags,
    pub params: Option<DynamicParams>,
    pub mass: f32,
    pub inertia: Vec3,
    pub center_of_mass: Vec3,
    pub velocity: Vec3,
    pub wakes: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct ShapeEntry {
    pub geometry: ShapeGeometry,
    pub material: MaterialHandle,
    pub actor: Option<ActorHandle>,
    pub local_pose: Pose,
    pub scale: Vec3,
    pub mass: Option<f32>,
    pub simulation_filter: FilterData,
    pub query_filter: FilterData,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ControllerEntry {
    pub geometry: ControllerGeometry,
    pub foot: Vec3,
}

/// One force request as seen by the backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct AppliedForce {
    pub actor: ActorHandle,
    pub force: Vec3,
    pub point: Option<Vec3>,
    pub mode: ForceMode,
}

#[derive(Debug)]
pub(crate) struct RecordingBackend {
    pub next_handle: u64,
    pub actors: FxHashMap<ActorHandle, ActorEntry>,
    pub shapes: FxHashMap<ShapeHandle, ShapeEntry>,
    pub controllers: FxHashMap<ControllerHandle, ControllerEntry>,
    pub cooked: Vec<CookedMeshHandle>,
    pub materials: Vec<MaterialDef>,
    pub gravity: Vec3,

    /// Polls a step needs before it completes.
    pub polls_to_complete: u32,
    pub in_flight: Option<u32>,
    pub steps_started: usize,
    pub steps_completed: usize,
    pub last_dt: f32,

    /// Refuse every cooking request.
    pub fail_cooking: bool,
    pub cook_calls: usize,
    /// Vertices handed to the latest mesh or hull cook.
    pub cooked_vertices: Vec<Vec3>,
    pub shapes_created: usize,
    pub actors_created: usize,
    pub controllers_created: usize,
    pub released_actors: Vec<ActorHandle>,
    pub released_shapes: Vec<ShapeHandle>,
    pub forces: Vec<AppliedForce>,

    /// Height of the ground plane hit by suspension rays, if any.
    pub ground: Option<f32>,
    pub ground_word3: u32,
    /// Height controllers cannot sink below, if any.
    pub floor: Option<f32>,

    /// Contacts reported by the next completed step.
    pub queued_contacts: Vec<ContactReport>,
    pub contacts: Vec<ContactReport>,
    pub active: Vec<ActorHandle>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self {
            next_handle: 1,
            actors: FxHashMap::default(),
            shapes: FxHashMap::default(),
            controllers: FxHashMap::default(),
            cooked: Vec::new(),
            materials: Vec::new(),
            gravity: Vec3::new(0.0, 0.0, -9.81),
            polls_to_complete: 0,
            in_flight: None,
            steps_started: 0,
            steps_completed: 0,
            last_dt: 0.0,
            fail_cooking: false,
            cook_calls: 0,
            cooked_vertices: Vec::new(),
            shapes_created: 0,
            actors_created: 0,
            controllers_created: 0,
            released_actors: Vec::new(),
            released_shapes: Vec::new(),
            forces: Vec::new(),
            ground: None,
            ground_word3: DRIVABLE_SURFACE,
            floor: None,
            queued_contacts: Vec::new(),
            contacts: Vec::new(),
            active: Vec::new(),
        }
    }
}

impl RecordingBackend {
    fn next(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn mutating(&self, op: &str) {
        assert!(self.in_flight.is_none(), "{op} while a step is in flight");
    }

    pub fn step_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn actor(&self, actor: ActorHandle) -> &ActorEntry {
        &self.actors[&actor]
    }

    pub fn shape(&self, shape: ShapeHandle) -> &ShapeEntry {
        &self.shapes[&shape]
    }

    /// Test hook for moving an actor as if the engine had.
    pub fn place_actor(&mut self, actor: ActorHandle, pose: Pose) {
        if let Some(entry) = self.actors.get_mut(&actor) {
            entry.pose = pose;
        }
    }

    fn complete(&mut self) {
        self.in_flight = None;
        self.steps_completed += 1;
        self.contacts = std::mem::take(&mut self.queued_contacts);
        let mut active: Vec<ActorHandle> = self
            .actors
            .iter()
            .filter(|(_, a)| a.in_scene && a.kind == ActorKind::Dynamic)
            .map(|(&h, _)| h)
            .collect();
        active.sort_unstable();
        self.active = active;
    }

    fn shape_world_pose(&self, entry: &ShapeEntry) -> Option<Pose> {
        let actor = self.actors.get(&entry.actor?)?;
        actor.in_scene.then(|| actor.pose.mul(&entry.local_pose))
    }

    /// Closest hit on an axis-aligned box shape accepted by `accept`.
    fn cast(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        accept: impl Fn(&ShapeEntry) -> bool,
    ) -> Option<RaycastHit> {
        let mut handles: Vec<&ShapeHandle> = self.shapes.keys().collect();
        handles.sort_unstable();
        let mut best: Option<RaycastHit> = None;
        for &handle in handles {
            let entry = &self.shapes[&handle];
            let ShapeGeometry::Box { half_extents } = entry.geometry else {
                continue;
            };
            if !accept(entry) {
                continue;
            }
            let Some(pose) = self.shape_world_pose(entry) else {
                continue;
            };
            let half = half_extents * entry.scale;
            let (min, max) = (pose.translation - half, pose.translation + half);
            let Some((t, normal)) = slab(origin, direction, min, max) else {
                continue;
            };
            if t <= max_distance && best.is_none_or(|b| t < b.distance) {
                best = Some(RaycastHit {
                    actor: entry.actor,
                    shape: handle,
                    position: origin + direction * t,
                    normal,
                    distance: t,
                });
            }
        }
        best
    }
}

/// Entry distance of a ray into an axis-aligned box, with the face normal.
fn slab(origin: Vec3, direction: Vec3, min: Vec3, max: Vec3) -> Option<(f32, Vec3)> {
    let (mut t_enter, mut t_exit) = (0.0f32, f32::MAX);
    let mut normal = Vec3::ZERO;
    for axis in 0..3 {
        let (o, d) = (origin[axis], direction[axis]);
        if d.abs() < 1e-8 {
            if o < min[axis] || o > max[axis] {
                return None;
            }
            continue;
        }
        let (mut t0, mut t1) = ((min[axis] - o) / d, (max[axis] - o) / d);
        let mut face = Vec3::ZERO;
        face[axis] = -d.signum();
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        if t0 > t_enter {
            t_enter = t0;
            normal = face;
        }
        t_exit = t_exit.min(t1);
        if t_enter > t_exit {
            return None;
        }
    }
    Some((t_enter, normal))
}

fn geometry_mass(geometry: ShapeGeometry, scale: Vec3) -> f32 {
    match geometry {
        ShapeGeometry::Box { half_extents } => {
            let size = half_extents * 2.0 * scale;
            size.x * size.y * size.z
        }
        ShapeGeometry::Sphere { radius } => {
            let r = radius * scale.max_element();
            4.0 / 3.0 * PI * r * r * r
        }
        ShapeGeometry::Capsule {
            radius,
            half_height,
        } => {
            let r = radius * scale.max_element();
            PI * r * r * 2.0 * half_height * scale.z + 4.0 / 3.0 * PI * r * r * r
        }
        ShapeGeometry::ConvexHull { scale, .. } => scale.x * scale.y * scale.z,
        ShapeGeometry::Plane | ShapeGeometry::TriangleMesh { .. } | ShapeGeometry::HeightField { .. } => 0.0,
    }
}

impl PhysicsBackend for RecordingBackend {
    fn create_material(&mut self, def: &MaterialDef) -> MaterialHandle {
        self.materials.push(def.clone());
        MaterialHandle(self.materials.len() as u64 - 1)
    }

    fn create_actor(&mut self, kind: ActorKind, pose: Pose) -> ActorHandle {
        self.mutating("create_actor");
        let handle = ActorHandle(self.next());
        self.actors_created += 1;
        self.actors.insert(
            handle,
            ActorEntry {
                kind,
                pose,
                shapes: Vec::new(),
                in_scene: false,
                flags: BodyFlags::empty(),
                params: None,
                mass: 0.0,
                inertia: Vec3::ZERO,
                center_of_mass: Vec3::ZERO,
                velocity: Vec3::ZERO,
                wakes: 0,
            },
        );
        handle
    }

    fn release_actor(&mut self, actor: ActorHandle) {
        self.mutating("release_actor");
        if let Some(entry) = self.actors.remove(&actor) {
            for shape in entry.shapes {
                if let Some(s) = self.shapes.get_mut(&shape) {
                    s.actor = None;
                }
            }
            self.released_actors.push(actor);
        }
    }

    fn add_actor_to_scene(&mut self, actor: ActorHandle) {
        self.mutating("add_actor_to_scene");
        if let Some(entry) = self.actors.get_mut(&actor) {
            entry.in_scene = true;
        }
    }

    fn actor_kind(&self, actor: ActorHandle) -> Option<ActorKind> {
        self.actors.get(&actor).map(|a| a.kind)
    }

    fn actor_count(&self, kind: ActorKind) -> usize {
        self.actors
            .values()
            .filter(|a| a.in_scene && a.kind == kind)
            .count()
    }

    fn set_actor_pose(&mut self, actor: ActorHandle, pose: Pose) {
        self.mutating("set_actor_pose");
        self.place_actor(actor, pose);
    }

    fn actor_pose(&self, actor: ActorHandle) -> Option<Pose> {
        self.actors.get(&actor).map(|a| a.pose)
    }

    fn actor_shapes(&self, actor: ActorHandle) -> Vec<ShapeHandle> {
        self.actors
            .get(&actor)
            .map(|a| a.shapes.clone())
            .unwrap_or_default()
    }

    fn set_actor_flags(&mut self, actor: ActorHandle, flags: BodyFlags) {
        self.mutating("set_actor_flags");
        if let Some(entry) = self.actors.get_mut(&actor) {
            entry.flags = flags;
        }
    }

    fn set_dynamic_params(&mut self, actor: ActorHandle, params: &DynamicParams) {
        self.mutating("set_dynamic_params");
        if let Some(entry) = self.actors.get_mut(&actor) {
            entry.params = Some(*params);
        }
    }

    fn wake_actor(&mut self, actor: ActorHandle) {
        self.mutating("wake_actor");
        if let Some(entry) = self.actors.get_mut(&actor) {
            entry.wakes += 1;
        }
    }

    fn set_actor_mass_from_shapes(&mut self, actor: ActorHandle, shapes: &[(ShapeHandle, f32)]) {
        self.mutating("set_actor_mass_from_shapes");
        for &(shape, mass) in shapes {
            if let Some(entry) = self.shapes.get_mut(&shape) {
                entry.mass = Some(mass);
            }
        }
        if let Some(entry) = self.actors.get_mut(&actor) {
            entry.mass = shapes.iter().map(|&(_, m)| m).sum();
            entry.center_of_mass = Vec3::ZERO;
        }
    }

    fn set_actor_mass_properties(&mut self, actor: ActorHandle, mass: f32, inertia: Vec3, center_of_mass: Vec3) {
        self.mutating("set_actor_mass_properties");
        if let Some(entry) = self.actors.get_mut(&actor) {
            entry.mass = mass;
            entry.inertia = inertia;
            entry.center_of_mass = center_of_mass;
        }
    }

    fn actor_mass(&self, actor: ActorHandle) -> f32 {
        self.actors.get(&actor).map_or(0.0, |a| a.mass)
    }

    fn actor_linear_velocity(&self, actor: ActorHandle) -> Vec3 {
        self.actors.get(&actor).map_or(Vec3::ZERO, |a| a.velocity)
    }

    fn actor_velocity_at_point(&self, actor: ActorHandle, _point: Vec3) -> Vec3 {
        self.actor_linear_velocity(actor)
    }

    fn apply_force(&mut self, actor: ActorHandle, force: Vec3, mode: ForceMode) {
        self.mutating("apply_force");
        self.forces.push(AppliedForce {
            actor,
            force,
            point: None,
            mode,
        });
    }

    fn apply_force_at_point(&mut self, actor: ActorHandle, force: Vec3, point: Vec3, mode: ForceMode) {
        self.mutating("apply_force_at_point");
        self.forces.push(AppliedForce {
            actor,
            force,
            point: Some(point),
            mode,
        });
    }

    fn cook_triangle_mesh(&mut self, vertices: &[Vec3], indices: &[u32]) -> Option<CookedMeshHandle> {
        self.mutating("cook_triangle_mesh");
        self.cook_calls += 1;
        self.cooked_vertices = vertices.to_vec();
        if self.fail_cooking || vertices.is_empty() || indices.len() % 3 != 0 {
            return None;
        }
        let handle = CookedMeshHandle(self.next());
        self.cooked.push(handle);
        Some(handle)
    }

    fn cook_convex_hull(&mut self, vertices: &[Vec3]) -> Option<CookedMeshHandle> {
        self.mutating("cook_convex_hull");
        self.cook_calls += 1;
        self.cooked_vertices = vertices.to_vec();
        if self.fail_cooking || vertices.len() < 4 {
            return None;
        }
        let handle = CookedMeshHandle(self.next());
        self.cooked.push(handle);
        Some(handle)
    }

    fn cook_height_field(&mut self, landscape: &Landscape) -> Option<CookedMeshHandle> {
        self.mutating("cook_height_field");
        self.cook_calls += 1;
        if self.fail_cooking || landscape.resolution < 2 {
            return None;
        }
        let handle = CookedMeshHandle(self.next());
        self.cooked.push(handle);
        Some(handle)
    }

    fn release_cooked(&mut self, mesh: CookedMeshHandle) {
        self.mutating("release_cooked");
        self.cooked.retain(|&m| m != mesh);
    }

    fn create_shape(&mut self, geometry: ShapeGeometry, material: MaterialHandle) -> Option<ShapeHandle> {
        self.mutating("create_shape");
        let handle = ShapeHandle(self.next());
        self.shapes_created += 1;
        self.shapes.insert(
            handle,
            ShapeEntry {
                geometry,
                material,
                actor: None,
                local_pose: Pose::IDENTITY,
                scale: Vec3::ONE,
                mass: None,
                simulation_filter: FilterData::default(),
                query_filter: FilterData::default(),
            },
        );
        Some(handle)
    }

    fn release_shape(&mut self, shape: ShapeHandle) {
        self.mutating("release_shape");
        if let Some(entry) = self.shapes.remove(&shape) {
            if let Some(actor) = entry.actor.and_then(|a| self.actors.get_mut(&a)) {
                actor.shapes.retain(|&s| s != shape);
            }
            self.released_shapes.push(shape);
        }
    }

    fn shape_count(&self) -> usize {
        self.shapes.len()
    }

    fn attach_shape(&mut self, actor: ActorHandle, shape: ShapeHandle) {
        self.mutating("attach_shape");
        let Some(entry) = self.shapes.get_mut(&shape) else {
            return;
        };
        assert!(entry.actor != Some(actor), "shape {shape:?} attached twice");
        if !self.actors.contains_key(&actor) {
            return;
        }
        if let Some(previous) = entry.actor.replace(actor)
            && let Some(previous) = self.actors.get_mut(&previous)
        {
            previous.shapes.retain(|&s| s != shape);
        }
        if let Some(target) = self.actors.get_mut(&actor) {
            target.shapes.push(shape);
        }
    }

    fn detach_shape(&mut self, actor: ActorHandle, shape: ShapeHandle) {
        self.mutating("detach_shape");
        if let Some(entry) = self.actors.get_mut(&actor) {
            entry.shapes.retain(|&s| s != shape);
        }
        if let Some(entry) = self.shapes.get_mut(&shape)
            && entry.actor == Some(actor)
        {
            entry.actor = None;
        }
    }

    fn shape_actor(&self, shape: ShapeHandle) -> Option<ActorHandle> {
        self.shapes.get(&shape).and_then(|s| s.actor)
    }

    fn set_shape_geometry(&mut self, shape: ShapeHandle, geometry: ShapeGeometry) {
        self.mutating("set_shape_geometry");
        if let Some(entry) = self.shapes.get_mut(&shape) {
            entry.geometry = geometry;
        }
    }

    fn shape_geometry(&self, shape: ShapeHandle) -> Option<ShapeGeometry> {
        self.shapes.get(&shape).map(|s| s.geometry)
    }

    fn set_shape_local_pose(&mut self, shape: ShapeHandle, pose: Pose) {
        self.mutating("set_shape_local_pose");
        if let Some(entry) = self.shapes.get_mut(&shape) {
            entry.local_pose = pose;
        }
    }

    fn shape_local_pose(&self, shape: ShapeHandle) -> Pose {
        self.shapes.get(&shape).map_or(Pose::IDENTITY, |s| s.local_pose)
    }

    fn set_shape_scale(&mut self, shape: ShapeHandle, scale: Vec3) {
        self.mutating("set_shape_scale");
        if let Some(entry) = self.shapes.get_mut(&shape) {
            entry.scale = scale;
        }
    }

    fn shape_scale(&self, shape: ShapeHandle) -> Vec3 {
        self.shapes.get(&shape).map_or(Vec3::ONE, |s| s.scale)
    }

    fn set_shape_material(&mut self, shape: ShapeHandle, material: MaterialHandle) {
        self.mutating("set_shape_material");
        if let Some(entry) = self.shapes.get_mut(&shape) {
            entry.material = material;
        }
    }

    fn shape_mass(&self, shape: ShapeHandle) -> f32 {
        self.shapes
            .get(&shape)
            .map_or(0.0, |s| geometry_mass(s.geometry, s.scale))
    }

    fn set_shape_mass(&mut self, shape: ShapeHandle, mass: f32) {
        self.mutating("set_shape_mass");
        if let Some(entry) = self.shapes.get_mut(&shape) {
            entry.mass = Some(mass);
        }
    }

    fn set_simulation_filter(&mut self, shape: ShapeHandle, filter: FilterData) {
        self.mutating("set_simulation_filter");
        if let Some(entry) = self.shapes.get_mut(&shape) {
            entry.simulation_filter = filter;
        }
    }

    fn simulation_filter(&self, shape: ShapeHandle) -> FilterData {
        self.shapes
            .get(&shape)
            .map(|s| s.simulation_filter)
            .unwrap_or_default()
    }

    fn set_query_filter(&mut self, shape: ShapeHandle, filter: FilterData) {
        self.mutating("set_query_filter");
        if let Some(entry) = self.shapes.get_mut(&shape) {
            entry.query_filter = filter;
        }
    }

    fn query_filter(&self, shape: ShapeHandle) -> FilterData {
        self.shapes
            .get(&shape)
            .map(|s| s.query_filter)
            .unwrap_or_default()
    }

    fn create_controller(&mut self, desc: &ControllerDesc) -> Option<ControllerHandle> {
        self.mutating("create_controller");
        let handle = ControllerHandle(self.next());
        self.controllers_created += 1;
        self.controllers.insert(
            handle,
            ControllerEntry {
                geometry: desc.geometry,
                foot: desc.foot_position,
            },
        );
        Some(handle)
    }

    fn resize_controller(&mut self, controller: ControllerHandle, geometry: ControllerGeometry) {
        self.mutating("resize_controller");
        if let Some(entry) = self.controllers.get_mut(&controller) {
            entry.geometry = geometry;
        }
    }

    fn set_controller_position(&mut self, controller: ControllerHandle, foot_position: Vec3) {
        self.mutating("set_controller_position");
        if let Some(entry) = self.controllers.get_mut(&controller) {
            entry.foot = foot_position;
        }
    }

    fn controller_position(&self, controller: ControllerHandle) -> Option<Vec3> {
        self.controllers.get(&controller).map(|c| c.foot)
    }

    fn move_controller(&mut self, controller: ControllerHandle, displacement: Vec3, _dt: f32) -> ControllerMove {
        self.mutating("move_controller");
        let floor = self.floor;
        let Some(entry) = self.controllers.get_mut(&controller) else {
            return ControllerMove {
                foot_position: Vec3::ZERO,
                collision_down: false,
            };
        };
        let mut foot = entry.foot + displacement;
        let mut collision_down = false;
        if let Some(floor) = floor
            && foot.z <= floor
        {
            foot.z = floor;
            collision_down = true;
        }
        entry.foot = foot;
        ControllerMove {
            foot_position: foot,
            collision_down,
        }
    }

    fn release_controller(&mut self, controller: ControllerHandle) {
        self.mutating("release_controller");
        self.controllers.remove(&controller);
    }

    fn simulate(&mut self, dt: f32) {
        self.mutating("simulate");
        self.steps_started += 1;
        self.last_dt = dt;
        self.in_flight = Some(self.polls_to_complete);
    }

    fn fetch_results(&mut self, block: bool) -> bool {
        match self.in_flight {
            None => false,
            Some(_) if block => {
                self.complete();
                true
            }
            Some(0) => {
                self.complete();
                true
            }
            Some(remaining) => {
                self.in_flight = Some(remaining - 1);
                false
            }
        }
    }

    fn active_actors(&self) -> Vec<ActorHandle> {
        self.active.clone()
    }

    fn take_contacts(&mut self) -> Vec<ContactReport> {
        std::mem::take(&mut self.contacts)
    }

    fn raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<RaycastHit> {
        self.cast(origin, direction, max_distance, |_| true)
    }

    fn raycast_batch(&self, rays: &[SuspensionRay]) -> Vec<Option<RaycastHit>> {
        rays.iter()
            .map(|ray| {
                let shape_hit = self.cast(ray.origin, ray.direction, ray.max_distance, |entry| {
                    entry.query_filter.word3 & ray.required_word3 != 0
                        && (ray.exclude_actor.is_none() || entry.actor != ray.exclude_actor)
                });
                let ground_hit = self
                    .ground
                    .filter(|_| self.ground_word3 & ray.required_word3 != 0)
                    .filter(|&z| ray.direction.z < 0.0 && ray.origin.z >= z)
                    .map(|z| (ray.origin.z - z) / -ray.direction.z)
                    .filter(|&t| t <= ray.max_distance)
                    .map(|t| RaycastHit {
                        actor: None,
                        shape: GROUND_SHAPE,
                        position: ray.origin + ray.direction * t,
                        normal: Vec3::Z,
                        distance: t,
                    });
                match (shape_hit, ground_hit) {
                    (Some(a), Some(b)) => Some(if a.distance <= b.distance { a } else { b }),
                    (a, b) => a.or(b),
                }
            })
            .collect()
    }

    fn gravity(&self) -> Vec3 {
        self.gravity
    }

    fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = gravity;
    }
}
