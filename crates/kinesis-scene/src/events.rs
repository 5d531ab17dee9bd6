use crate::{ComponentId, ComponentKind, NodeId};

/// Lifecycle notifications recorded by the [`Scene`](crate::Scene) and
/// drained once per frame by consumers such as the physics scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneEvent {
    /// A component was attached to a node.
    ComponentAdded {
        node: NodeId,
        component: ComponentId,
        kind: ComponentKind,
    },
    /// A component was detached from a node, or its node was removed.
    ComponentRemoved {
        node: NodeId,
        component: ComponentId,
        kind: ComponentKind,
    },
    /// A component's properties were edited through a tracked accessor.
    /// Recorded at most once per component between two drains.
    ComponentChanged {
        component: ComponentId,
        kind: ComponentKind,
    },
    /// A node moved to a different parent. Recorded for every node of the
    /// moved subtree.
    NodeReparented { node: NodeId },
}
