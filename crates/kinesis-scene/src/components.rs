//! Component data attached to scene nodes.
//!
//! Each component family is a closed enum so that code which needs
//! geometry- or variant-specific behavior matches on it in one place.
//! The physics layer reads these values when it builds or refreshes engine
//! objects; the engine-side state itself lives in the physics crate.

use std::sync::Arc;

use bitflags::bitflags;
use glam::Vec3;

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Discriminant of [`Component`], used for lookups and lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// [`Body`].
    Body,
    /// [`Collider`].
    Collider,
    /// [`CharacterController`].
    CharacterController,
    /// [`Vehicle`].
    Vehicle,
    /// [`Chassis`].
    Chassis,
    /// [`Wheel`].
    Wheel,
    /// [`RenderGeometry`].
    RenderGeometry,
    /// [`Landscape`].
    Landscape,
}

/// Any component that can be attached to a scene node.
#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    /// Simulated rigid actor.
    Body(Body),
    /// Collision shape owned by the nearest [`Body`] up the hierarchy.
    Collider(Collider),
    /// Kinematic character controller. Root nodes only.
    CharacterController(CharacterController),
    /// Vehicle drivetrain and analog inputs.
    Vehicle(Vehicle),
    /// Marks the chassis child of a vehicle.
    Chassis(Chassis),
    /// Marks a wheel child of a vehicle.
    Wheel(Wheel),
    /// Render mesh fragments, the source for mesh and convex-hull colliders.
    RenderGeometry(RenderGeometry),
    /// Height grid, the source for height-field colliders.
    Landscape(Landscape),
}

impl Component {
    /// Returns the kind of this component.
    pub fn kind(&self) -> ComponentKind {
        match self {
            Component::Body(_) => ComponentKind::Body,
            Component::Collider(_) => ComponentKind::Collider,
            Component::CharacterController(_) => ComponentKind::CharacterController,
            Component::Vehicle(_) => ComponentKind::Vehicle,
            Component::Chassis(_) => ComponentKind::Chassis,
            Component::Wheel(_) => ComponentKind::Wheel,
            Component::RenderGeometry(_) => ComponentKind::RenderGeometry,
            Component::Landscape(_) => ComponentKind::Landscape,
        }
    }
}

macro_rules! impl_from_component {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Component {
                fn from(value: $variant) -> Self {
                    Component::$variant(value)
                }
            }
        )*
    };
}

impl_from_component!(Body, Collider, Vehicle, Chassis, Wheel, RenderGeometry, Landscape);

impl From<CharacterController> for Component {
    fn from(value: CharacterController) -> Self {
        Component::CharacterController(value)
    }
}

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

bitflags! {
    /// Actor-level flags shared by static and dynamic bodies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BodyFlags: u32 {
        /// Include the actor in engine-side visualization.
        const VISUALIZE = 1 << 0;
        /// Gravity does not act on the actor.
        const DISABLE_GRAVITY = 1 << 1;
        /// Report sleep/wake transitions.
        const NOTIFY_SLEEP = 1 << 2;
        /// Actor stays in the scene but takes no part in the simulation.
        const EXCLUDE_FROM_SIMULATION = 1 << 3;
    }
}

bitflags! {
    /// Per-axis motion locks for dynamic bodies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LockFlags: u32 {
        const LINEAR_X = 1 << 0;
        const LINEAR_Y = 1 << 1;
        const LINEAR_Z = 1 << 2;
        const ANGULAR_X = 1 << 3;
        const ANGULAR_Y = 1 << 4;
        const ANGULAR_Z = 1 << 5;
    }
}

/// Tuning that only exists on dynamic bodies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicParams {
    /// Linear velocity damping.
    pub linear_damping: f32,
    /// Angular velocity damping.
    pub angular_damping: f32,
    /// Clamp on angular speed in rad/s.
    pub max_angular_velocity: f32,
    /// Locked translation/rotation axes.
    pub lock_flags: LockFlags,
    /// Minimum solver position iterations.
    pub position_iterations: u32,
    /// Minimum solver velocity iterations.
    pub velocity_iterations: u32,
    /// Continuous collision detection for this body and its colliders.
    pub ccd_enabled: bool,
}

impl Default for DynamicParams {
    fn default() -> Self {
        Self {
            linear_damping: 0.05,
            angular_damping: 0.05,
            max_angular_velocity: 7.0,
            lock_flags: LockFlags::empty(),
            position_iterations: 4,
            velocity_iterations: 1,
            ccd_enabled: false,
        }
    }
}

/// Static or dynamic variant of a [`Body`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BodyVariant {
    /// Immovable actor.
    Static,
    /// Fully simulated actor.
    Dynamic(DynamicParams),
}

/// A simulated rigid actor.
///
/// Its colliders are the [`Collider`] components on the same node and on
/// descendants, stopping at the first nested body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Body {
    /// Static or dynamic, with dynamic-only tuning.
    pub variant: BodyVariant,
    /// Actor flags.
    pub flags: BodyFlags,
}

impl Body {
    /// A static body with no flags.
    pub fn fixed() -> Self {
        Self {
            variant: BodyVariant::Static,
            flags: BodyFlags::empty(),
        }
    }

    /// A dynamic body with default tuning.
    pub fn dynamic() -> Self {
        Self {
            variant: BodyVariant::Dynamic(DynamicParams::default()),
            flags: BodyFlags::empty(),
        }
    }

    /// Returns `true` for the dynamic variant.
    pub fn is_dynamic(&self) -> bool {
        matches!(self.variant, BodyVariant::Dynamic(_))
    }

    /// Dynamic tuning, if this is a dynamic body.
    pub fn dynamic_params(&self) -> Option<&DynamicParams> {
        match &self.variant {
            BodyVariant::Dynamic(params) => Some(params),
            BodyVariant::Static => None,
        }
    }

    /// Mutable dynamic tuning, if this is a dynamic body.
    pub fn dynamic_params_mut(&mut self) -> Option<&mut DynamicParams> {
        match &mut self.variant {
            BodyVariant::Dynamic(params) => Some(params),
            BodyVariant::Static => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Collider
// ---------------------------------------------------------------------------

/// Collision geometry of a [`Collider`].
///
/// `Mesh`, `ConvexHull` and `HeightField` take their source data from the
/// node's [`RenderGeometry`] / [`Landscape`] components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColliderGeometry {
    /// Box with half extents.
    Box {
        /// Half extents along each local axis.
        half_size: Vec3,
    },
    /// Capsule along the local Z axis.
    Capsule {
        /// Radius of the hemispheres and cylinder.
        radius: f32,
        /// Half length of the cylindrical part.
        half_height: f32,
    },
    /// Sphere.
    Sphere {
        /// Radius.
        radius: f32,
    },
    /// Infinite plane through the node origin, normal along local +Z.
    Plane,
    /// Triangle mesh built from render geometry.
    Mesh,
    /// Convex hull built from render geometry.
    ConvexHull,
    /// Height field built from a landscape.
    HeightField,
}

impl ColliderGeometry {
    /// Returns `true` if the geometry depends on render or landscape data.
    pub fn needs_source_data(&self) -> bool {
        matches!(
            self,
            ColliderGeometry::Mesh | ColliderGeometry::ConvexHull | ColliderGeometry::HeightField
        )
    }
}

/// Default type mask for colliders.
pub const DEFAULT_TYPE_MASK: u32 = 0x1;
/// Default collide-with mask for colliders.
pub const DEFAULT_COLLIDE_WITH_MASK: u32 = 0xFFFF_FFFF;

/// One collision shape, owned by the nearest [`Body`] up the hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct Collider {
    /// Collision geometry.
    pub geometry: ColliderGeometry,
    /// Debug name forwarded to the engine.
    pub name: String,
    /// Material name; empty selects the default material.
    pub material: String,
    /// Bitmask describing what this collider is.
    pub type_mask: u32,
    /// Bitmask of types this collider wants to touch.
    pub collide_with_mask: u32,
    override_mass: bool,
    mass: f32,
}

impl Collider {
    /// Creates a collider with default masks, material and derived mass.
    pub fn new(geometry: ColliderGeometry) -> Self {
        Self {
            geometry,
            name: String::new(),
            material: String::new(),
            type_mask: DEFAULT_TYPE_MASK,
            collide_with_mask: DEFAULT_COLLIDE_WITH_MASK,
            override_mass: false,
            mass: 1.0,
        }
    }

    /// Box collider.
    pub fn cuboid(half_size: Vec3) -> Self {
        Self::new(ColliderGeometry::Box { half_size })
    }

    /// Sphere collider.
    pub fn sphere(radius: f32) -> Self {
        Self::new(ColliderGeometry::Sphere { radius })
    }

    /// Capsule collider.
    pub fn capsule(radius: f32, half_height: f32) -> Self {
        Self::new(ColliderGeometry::Capsule {
            radius,
            half_height,
        })
    }

    /// Builder-style mask setter.
    pub fn with_masks(mut self, type_mask: u32, collide_with_mask: u32) -> Self {
        self.type_mask = type_mask;
        self.collide_with_mask = collide_with_mask;
        self
    }

    /// Builder-style material setter.
    pub fn with_material(mut self, material: impl Into<String>) -> Self {
        self.material = material.into();
        self
    }

    /// Whether the mass is user-supplied instead of derived from geometry.
    pub fn override_mass(&self) -> bool {
        self.override_mass
    }

    /// Switches between user-supplied and derived mass.
    pub fn set_override_mass(&mut self, override_mass: bool) {
        self.override_mass = override_mass;
    }

    /// Current mass: user-supplied, or the last value derived by the engine.
    pub fn mass(&self) -> f32 {
        self.mass
    }

    /// Sets an explicit mass. Ignored unless mass override is on.
    pub fn set_mass(&mut self, mass: f32) {
        if self.override_mass {
            self.mass = mass;
        }
    }

    /// Stores an engine-derived mass. No effect while mass override is on.
    pub fn set_derived_mass(&mut self, mass: f32) {
        if !self.override_mass {
            self.mass = mass;
        }
    }
}

// ---------------------------------------------------------------------------
// Character controller
// ---------------------------------------------------------------------------

/// Controller volume, Z-up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControllerGeometry {
    /// Oriented box.
    Box {
        /// Half extent along the up axis.
        half_height: f32,
        /// Half extent along the forward axis.
        half_forward: f32,
        /// Half extent along the side axis.
        half_side: f32,
    },
    /// Upright capsule.
    Capsule {
        /// Radius.
        radius: f32,
        /// Height of the cylindrical part.
        height: f32,
    },
}

impl ControllerGeometry {
    /// Default box volume.
    pub fn default_box() -> Self {
        ControllerGeometry::Box {
            half_height: 1.0,
            half_forward: 0.5,
            half_side: 0.5,
        }
    }

    /// Default capsule volume.
    pub fn default_capsule() -> Self {
        ControllerGeometry::Capsule {
            radius: 0.5,
            height: 1.0,
        }
    }

    /// Distance from the volume center down to its lowest point.
    pub fn foot_offset(&self) -> f32 {
        match *self {
            ControllerGeometry::Box { half_height, .. } => half_height,
            ControllerGeometry::Capsule { radius, height } => height * 0.5 + radius,
        }
    }
}

/// How accumulated displacement is turned into motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MovementMode {
    /// Horizontal displacement only, gravity applied.
    #[default]
    Walking,
    /// Displacement applied as-is, no gravity.
    Flying,
}

/// Independently moving kinematic volume. Must be attached to a root node.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterController {
    /// Movement mode.
    pub movement_mode: MovementMode,
    geometry: ControllerGeometry,
    geometry_dirty: bool,
    displacement: Vec3,
    teleport: Option<Vec3>,
    grounded: bool,
}

impl CharacterController {
    /// Creates a controller with the given volume.
    pub fn new(geometry: ControllerGeometry) -> Self {
        Self {
            movement_mode: MovementMode::Walking,
            geometry,
            geometry_dirty: false,
            displacement: Vec3::ZERO,
            teleport: None,
            grounded: false,
        }
    }

    /// Controller volume.
    pub fn geometry(&self) -> ControllerGeometry {
        self.geometry
    }

    /// Replaces the volume; applied on the next update pass.
    pub fn set_geometry(&mut self, geometry: ControllerGeometry) {
        self.geometry = geometry;
        self.geometry_dirty = true;
    }

    /// Clears and returns the pending geometry-change flag.
    pub fn take_geometry_change(&mut self) -> bool {
        std::mem::take(&mut self.geometry_dirty)
    }

    /// Accumulates a displacement for the current frame.
    pub fn move_by(&mut self, displacement: Vec3) {
        self.displacement += displacement;
    }

    /// Displacement accumulated so far this frame.
    pub fn displacement(&self) -> Vec3 {
        self.displacement
    }

    /// Clears and returns the accumulated displacement.
    pub fn take_displacement(&mut self) -> Vec3 {
        std::mem::take(&mut self.displacement)
    }

    /// Requests a teleport to a world position on the next update pass.
    pub fn teleport(&mut self, position: Vec3) {
        self.teleport = Some(position);
    }

    /// Clears and returns the pending teleport destination.
    pub fn take_teleport(&mut self) -> Option<Vec3> {
        self.teleport.take()
    }

    /// Whether the last move touched ground below.
    pub fn is_grounded(&self) -> bool {
        self.grounded
    }

    /// Stores the grounded state reported by the engine.
    pub fn set_grounded(&mut self, grounded: bool) {
        self.grounded = grounded;
    }
}

// ---------------------------------------------------------------------------
// Vehicles
// ---------------------------------------------------------------------------

/// Transmission gear, in engine order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gear {
    Reverse,
    Neutral,
    #[default]
    First,
    Second,
    Third,
    Fourth,
    Fifth,
}

impl Gear {
    /// Forward gears in ascending order.
    pub const FORWARD: [Gear; 5] = [
        Gear::First,
        Gear::Second,
        Gear::Third,
        Gear::Fourth,
        Gear::Fifth,
    ];

    /// Index in engine order (reverse = 0, neutral = 1, first = 2, ...).
    pub fn index(self) -> usize {
        match self {
            Gear::Reverse => 0,
            Gear::Neutral => 1,
            Gear::First => 2,
            Gear::Second => 3,
            Gear::Third => 4,
            Gear::Fourth => 5,
            Gear::Fifth => 6,
        }
    }
}

/// Raw analog inputs of a car, each in `[0, 1]` except steer in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CarInput {
    pub acceleration: f32,
    pub brake: f32,
    pub handbrake: f32,
    pub steer: f32,
}

/// Raw analog inputs of a tank. Thrusts are in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TankInput {
    pub acceleration: f32,
    pub left_thrust: f32,
    pub right_thrust: f32,
    pub left_brake: f32,
    pub right_brake: f32,
}

/// Drivetrain variant with its per-frame raw inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Drivetrain {
    /// N-wheel car with engine, gears and differential.
    Car(CarInput),
    /// Dual-track tank.
    Tank(TankInput),
}

/// A vehicle: the node carries a dynamic [`Body`], its direct children carry
/// one [`Chassis`] and one or more [`Wheel`]s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vehicle {
    /// Drivetrain and raw inputs.
    pub drivetrain: Drivetrain,
    /// Gear forced onto the drivetrain each frame.
    pub gear: Gear,
}

impl Vehicle {
    /// A car in first gear.
    pub fn car() -> Self {
        Self {
            drivetrain: Drivetrain::Car(CarInput::default()),
            gear: Gear::First,
        }
    }

    /// A tank in first gear.
    pub fn tank() -> Self {
        Self {
            drivetrain: Drivetrain::Tank(TankInput::default()),
            gear: Gear::First,
        }
    }

    /// Clears the per-frame raw inputs.
    pub fn reset_inputs(&mut self) {
        match &mut self.drivetrain {
            Drivetrain::Car(input) => *input = CarInput::default(),
            Drivetrain::Tank(input) => *input = TankInput::default(),
        }
    }
}

/// Chassis marker; its node holds exactly one box collider.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Chassis {
    /// Center of mass relative to the vehicle node.
    pub center_of_mass_offset: Vec3,
}

/// Wheel marker; its node holds exactly one collider and is placed at the
/// wheel center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wheel {
    pub radius: f32,
    pub width: f32,
    pub max_handbrake_torque: f32,
    /// Maximum steer angle in radians.
    pub max_steer_angle: f32,
}

impl Default for Wheel {
    fn default() -> Self {
        Self {
            radius: 0.5,
            width: 0.4,
            max_handbrake_torque: 4000.0,
            max_steer_angle: std::f32::consts::FRAC_PI_3,
        }
    }
}

// ---------------------------------------------------------------------------
// Geometry sources
// ---------------------------------------------------------------------------

/// Stable identifier of a render geometry fragment, used as a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(pub u64);

/// One indexed triangle list.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryFragment {
    /// Identity of the source data.
    pub id: GeometryId,
    /// Vertex positions in node space.
    pub vertices: Arc<[Vec3]>,
    /// Triangle indices, three per triangle.
    pub indices: Arc<[u32]>,
}

/// Render mesh fragments of a node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderGeometry {
    /// Fragments at the highest level of detail.
    pub fragments: Vec<GeometryFragment>,
}

/// A square height grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Landscape {
    /// Normalized heights in `[0, 1]`, row-major, `resolution * resolution`.
    pub heights: Arc<[f32]>,
    /// Samples per side.
    pub resolution: u32,
    /// World extent: X and Y span of the grid, Z the height of a sample at 1.0.
    pub size: Vec3,
}

impl Landscape {
    /// Height sample at grid coordinates.
    pub fn sample(&self, x: u32, y: u32) -> f32 {
        self.heights
            .get((y * self.resolution + x) as usize)
            .copied()
            .unwrap_or(0.0)
    }
}
