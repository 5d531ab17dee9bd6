use kinesis_scene::{ComponentId, NodeId};
use thiserror::Error;

/// Failures inside the scheduler's per-component work.
///
/// None of these reach the caller of [`PhysicsSystem::process`]; they are
/// logged and the affected component is skipped for the frame.
///
/// [`PhysicsSystem::process`]: crate::PhysicsSystem::process
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PhysicsError {
    /// The engine rejected the source geometry.
    #[error("failed to cook {kind} for node {node:?}")]
    CookFailed { node: NodeId, kind: &'static str },

    /// An operation needed an engine actor that does not exist.
    #[error("component {0:?} has no engine actor")]
    MissingActor(ComponentId),

    /// The component id is not registered with the scheduler.
    #[error("component {0:?} is not registered")]
    UnknownComponent(ComponentId),

    /// More vehicles or wheels than the batch can hold.
    #[error("vehicle batch capacity exceeded: {vehicles} vehicles, {wheels} wheels")]
    VehicleCapacityExceeded { vehicles: usize, wheels: usize },

    /// A vehicle is missing a part or a part is not attached yet.
    #[error("vehicle is incomplete: {0}")]
    VehicleIncomplete(&'static str),

    /// Wheel layout admits no non-negative mass distribution.
    #[error("no valid sprung mass distribution for {wheels} wheels")]
    SprungMassUnsolvable { wheels: usize },
}
