use thiserror::Error;

use crate::{ComponentId, NodeId};

/// Errors returned by [`Scene`](crate::Scene) mutations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SceneError {
    /// The node was removed or never existed.
    #[error("node {0:?} does not exist")]
    NodeNotFound(NodeId),

    /// The component was removed or never existed.
    #[error("component {0:?} does not exist")]
    ComponentNotFound(ComponentId),

    /// Reparenting would make a node its own ancestor.
    #[error("reparenting {node:?} under {parent:?} would create a cycle")]
    WouldCreateCycle { node: NodeId, parent: NodeId },
}
