//! Scene-graph runtime: a node arena with parent/child links, local and
//! world transforms, per-node components, and the lifecycle events that
//! downstream systems consume once per frame.

mod components;
mod error;
mod events;
mod scene;

pub use components::{
    Body, BodyFlags, BodyVariant, CarInput, CharacterController, Chassis, Collider,
    ColliderGeometry, Component, ComponentKind, ControllerGeometry, DEFAULT_COLLIDE_WITH_MASK,
    DEFAULT_TYPE_MASK, Drivetrain, DynamicParams, Gear, GeometryFragment, GeometryId, Landscape,
    LockFlags, MovementMode, RenderGeometry, TankInput, Vehicle, Wheel,
};
pub use error::SceneError;
pub use events::SceneEvent;
pub use scene::{ComponentId, NodeId, Scene};
