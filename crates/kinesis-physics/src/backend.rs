//! Boundary between the scheduler and a rigid-body engine.
//!
//! The scheduler only ever talks to a [`PhysicsBackend`]. Engine objects are
//! referred to by plain `Copy` handles; the scheduler keeps its own tables
//! mapping them back to scene components.

use glam::{Mat4, Quat, Vec3};
use kinesis_config::MaterialDef;
use kinesis_scene::{BodyFlags, ControllerGeometry, DynamicParams, Landscape};

use crate::collision_events::ContactPoint;
use crate::filter::FilterData;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

handle!(
    /// Engine rigid actor.
    ActorHandle
);
handle!(
    /// Engine collision shape, alive independently of any actor.
    ShapeHandle
);
handle!(
    /// Engine character controller.
    ControllerHandle
);
handle!(
    /// Engine surface material.
    MaterialHandle
);
handle!(
    /// Cooked triangle mesh, convex hull or height field.
    CookedMeshHandle
);

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Rigid transform without scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub translation: Vec3,
    pub rotation: Quat,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub fn new(translation: Vec3, rotation: Quat) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self::new(translation, Quat::IDENTITY)
    }

    /// Splits a transform matrix into its rigid part and its scale.
    pub fn from_mat4(m: &Mat4) -> (Pose, Vec3) {
        let (scale, rotation, translation) = m.to_scale_rotation_translation();
        (Pose::new(translation, rotation.normalize()), scale)
    }

    /// Matrix applying `scale` first, then this pose.
    pub fn to_mat4_scaled(&self, scale: Vec3) -> Mat4 {
        Mat4::from_scale_rotation_translation(scale, self.rotation, self.translation)
    }

    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        self.rotation * p + self.translation
    }

    pub fn transform_vector(&self, v: Vec3) -> Vec3 {
        self.rotation * v
    }

    /// `self ∘ other`: `other` expressed in this pose's frame.
    pub fn mul(&self, other: &Pose) -> Pose {
        Pose::new(
            self.transform_point(other.translation),
            self.rotation * other.rotation,
        )
    }

    pub fn inverse(&self) -> Pose {
        let rotation = self.rotation.inverse();
        Pose::new(rotation * -self.translation, rotation)
    }
}

/// Static or dynamic actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorKind {
    Static,
    Dynamic,
}

/// How a force request is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForceMode {
    /// Mass-dependent continuous force (N).
    #[default]
    Force,
    /// Mass-dependent instantaneous impulse (N·s).
    Impulse,
    /// Mass-independent instantaneous velocity change (m/s).
    VelocityChange,
    /// Mass-independent continuous acceleration (m/s²).
    Acceleration,
}

/// Engine geometry of a shape, before scale is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShapeGeometry {
    Box { half_extents: Vec3 },
    /// Capsule along the local Z axis.
    Capsule { radius: f32, half_height: f32 },
    Sphere { radius: f32 },
    /// Plane through the origin facing local +Z.
    Plane,
    TriangleMesh { mesh: CookedMeshHandle, scale: Vec3 },
    ConvexHull { mesh: CookedMeshHandle, scale: Vec3 },
    HeightField { mesh: CookedMeshHandle },
}

/// Parameters of a new character controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerDesc {
    pub geometry: ControllerGeometry,
    /// Position of the lowest point of the volume.
    pub foot_position: Vec3,
    pub up: Vec3,
    pub material: MaterialHandle,
}

/// Outcome of a controller move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerMove {
    pub foot_position: Vec3,
    /// The move ended touching something below.
    pub collision_down: bool,
}

/// Closest hit of a ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaycastHit {
    pub actor: Option<ActorHandle>,
    pub shape: ShapeHandle,
    pub position: Vec3,
    pub normal: Vec3,
    pub distance: f32,
}

/// One ray of a batched suspension query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuspensionRay {
    pub origin: Vec3,
    /// Unit direction.
    pub direction: Vec3,
    pub max_distance: f32,
    /// Actor whose shapes are ignored.
    pub exclude_actor: Option<ActorHandle>,
    /// Hits are only accepted on shapes whose query `word3` intersects this.
    pub required_word3: u32,
}

/// Raw contacts of one shape pair from the last completed step.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactReport {
    pub shape_a: ShapeHandle,
    pub shape_b: ShapeHandle,
    pub points: Vec<ContactPoint>,
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Operations the scheduler needs from a rigid-body engine.
///
/// Mutating calls and queries are only issued while no step is in flight,
/// i.e. between a completed [`fetch_results`](Self::fetch_results) and the
/// next [`simulate`](Self::simulate). Operations on unknown handles are
/// no-ops.
pub trait PhysicsBackend: Send + Sync + 'static {
    // --- Materials ---

    fn create_material(&mut self, def: &MaterialDef) -> MaterialHandle;

    // --- Actors ---

    /// Creates an actor outside the simulated scene.
    fn create_actor(&mut self, kind: ActorKind, pose: Pose) -> ActorHandle;
    /// Removes the actor from the scene and frees it. Attached shapes are
    /// detached first and stay alive.
    fn release_actor(&mut self, actor: ActorHandle);
    fn add_actor_to_scene(&mut self, actor: ActorHandle);
    fn actor_kind(&self, actor: ActorHandle) -> Option<ActorKind>;
    /// Number of actors of a kind currently in the scene.
    fn actor_count(&self, kind: ActorKind) -> usize;
    fn set_actor_pose(&mut self, actor: ActorHandle, pose: Pose);
    fn actor_pose(&self, actor: ActorHandle) -> Option<Pose>;
    /// Attached shapes in attach order.
    fn actor_shapes(&self, actor: ActorHandle) -> Vec<ShapeHandle>;
    fn set_actor_flags(&mut self, actor: ActorHandle, flags: BodyFlags);
    fn set_dynamic_params(&mut self, actor: ActorHandle, params: &DynamicParams);
    fn wake_actor(&mut self, actor: ActorHandle);
    /// Assigns per-shape masses and derives the actor's mass and inertia
    /// from its attached shapes.
    fn set_actor_mass_from_shapes(&mut self, actor: ActorHandle, shapes: &[(ShapeHandle, f32)]);
    /// Overrides mass, principal inertia and center of mass (actor frame).
    fn set_actor_mass_properties(
        &mut self,
        actor: ActorHandle,
        mass: f32,
        inertia: Vec3,
        center_of_mass: Vec3,
    );
    fn actor_mass(&self, actor: ActorHandle) -> f32;
    fn actor_linear_velocity(&self, actor: ActorHandle) -> Vec3;
    /// Velocity of a world-space point rigidly attached to the actor.
    fn actor_velocity_at_point(&self, actor: ActorHandle, point: Vec3) -> Vec3;
    fn apply_force(&mut self, actor: ActorHandle, force: Vec3, mode: ForceMode);
    /// Applies a force or impulse at a world-space point.
    fn apply_force_at_point(&mut self, actor: ActorHandle, force: Vec3, point: Vec3, mode: ForceMode);

    // --- Cooking ---

    fn cook_triangle_mesh(&mut self, vertices: &[Vec3], indices: &[u32]) -> Option<CookedMeshHandle>;
    fn cook_convex_hull(&mut self, vertices: &[Vec3]) -> Option<CookedMeshHandle>;
    fn cook_height_field(&mut self, landscape: &Landscape) -> Option<CookedMeshHandle>;
    fn release_cooked(&mut self, mesh: CookedMeshHandle);

    // --- Shapes ---

    /// Creates a detached shape. `None` if the geometry is unusable.
    fn create_shape(&mut self, geometry: ShapeGeometry, material: MaterialHandle) -> Option<ShapeHandle>;
    /// Detaches (if needed) and frees the shape.
    fn release_shape(&mut self, shape: ShapeHandle);
    /// Number of live shapes, attached or not.
    fn shape_count(&self) -> usize;
    fn attach_shape(&mut self, actor: ActorHandle, shape: ShapeHandle);
    fn detach_shape(&mut self, actor: ActorHandle, shape: ShapeHandle);
    fn shape_actor(&self, shape: ShapeHandle) -> Option<ActorHandle>;
    fn set_shape_geometry(&mut self, shape: ShapeHandle, geometry: ShapeGeometry);
    fn shape_geometry(&self, shape: ShapeHandle) -> Option<ShapeGeometry>;
    fn set_shape_local_pose(&mut self, shape: ShapeHandle, pose: Pose);
    fn shape_local_pose(&self, shape: ShapeHandle) -> Pose;
    fn set_shape_scale(&mut self, shape: ShapeHandle, scale: Vec3);
    fn shape_scale(&self, shape: ShapeHandle) -> Vec3;
    fn set_shape_material(&mut self, shape: ShapeHandle, material: MaterialHandle);
    /// Mass of the scaled geometry at unit density.
    fn shape_mass(&self, shape: ShapeHandle) -> f32;
    fn set_shape_mass(&mut self, shape: ShapeHandle, mass: f32);
    fn set_simulation_filter(&mut self, shape: ShapeHandle, filter: FilterData);
    fn simulation_filter(&self, shape: ShapeHandle) -> FilterData;
    fn set_query_filter(&mut self, shape: ShapeHandle, filter: FilterData);
    fn query_filter(&self, shape: ShapeHandle) -> FilterData;

    // --- Character controllers ---

    fn create_controller(&mut self, desc: &ControllerDesc) -> Option<ControllerHandle>;
    fn resize_controller(&mut self, controller: ControllerHandle, geometry: ControllerGeometry);
    fn set_controller_position(&mut self, controller: ControllerHandle, foot_position: Vec3);
    fn controller_position(&self, controller: ControllerHandle) -> Option<Vec3>;
    /// Sweeps the controller by `displacement`, resolving collisions.
    fn move_controller(&mut self, controller: ControllerHandle, displacement: Vec3, dt: f32) -> ControllerMove;
    fn release_controller(&mut self, controller: ControllerHandle);

    // --- Stepping ---

    /// Starts one asynchronous step.
    fn simulate(&mut self, dt: f32);
    /// Polls (or waits for) the outstanding step. Returns `true` once the
    /// results are available.
    fn fetch_results(&mut self, block: bool) -> bool;
    /// Actors whose state changed during the last completed step.
    fn active_actors(&self) -> Vec<ActorHandle>;
    /// Contact reports of the last completed step. Subsequent calls return
    /// nothing until the next step completes.
    fn take_contacts(&mut self) -> Vec<ContactReport>;

    // --- Queries ---

    fn raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<RaycastHit>;
    fn raycast_batch(&self, rays: &[SuspensionRay]) -> Vec<Option<RaycastHit>>;
    fn gravity(&self) -> Vec3;
    fn set_gravity(&mut self, gravity: Vec3);
}
