use bevy_ecs::prelude::Resource;
use glam::{Mat4, Vec3};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::components::{
    Body, CharacterController, Chassis, Collider, Component, ComponentKind, Landscape,
    RenderGeometry, Vehicle, Wheel,
};
use crate::{SceneError, SceneEvent};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Index of a node in the scene arena. Slots are never reused, so a stale
/// id can only ever miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Scene-unique component identifier, monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u64);

struct Node {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    local: Mat4,
    world: Mat4,
    components: Vec<ComponentId>,
}

struct ComponentEntry {
    node: NodeId,
    component: Component,
}

// ---------------------------------------------------------------------------
// Scene
// ---------------------------------------------------------------------------

/// Arena-backed scene graph.
///
/// World transforms are recomputed eagerly whenever a local or world
/// transform is written, so reads never observe a stale hierarchy.
#[derive(Resource, Default)]
pub struct Scene {
    nodes: Vec<Option<Node>>,
    components: FxHashMap<ComponentId, ComponentEntry>,
    next_component: u64,
    events: Vec<SceneEvent>,
    changed_components: FxHashSet<ComponentId>,
    changed_transforms: Vec<NodeId>,
    changed_transform_set: FxHashSet<NodeId>,
}

impl Scene {
    /// Creates an empty scene.
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    // --- Hierarchy ---------------------------------------------------------

    /// Adds a node with an identity local transform.
    pub fn create_node(
        &mut self,
        name: impl Into<String>,
        parent: Option<NodeId>,
    ) -> Result<NodeId, SceneError> {
        let world = match parent {
            Some(p) => {
                self.node(p).ok_or(SceneError::NodeNotFound(p))?.world
            }
            None => Mat4::IDENTITY,
        };
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(Node {
            name: name.into(),
            parent,
            children: Vec::new(),
            local: Mat4::IDENTITY,
            world,
            components: Vec::new(),
        }));
        if let Some(p) = parent
            && let Some(parent_node) = self.node_mut(p)
        {
            parent_node.children.push(id);
        }
        Ok(id)
    }

    /// Removes a node and its whole subtree. Every component in the subtree
    /// is reported as removed, children before parents.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), SceneError> {
        let parent = self.node(id).ok_or(SceneError::NodeNotFound(id))?.parent;
        if let Some(p) = parent
            && let Some(parent_node) = self.node_mut(p)
        {
            parent_node.children.retain(|&c| c != id);
        }

        let mut order = Vec::new();
        self.collect_post_order(id, &mut order);
        for node_id in order {
            let components = self
                .node(node_id)
                .map(|n| n.components.clone())
                .unwrap_or_default();
            for component in components.into_iter().rev() {
                self.remove_component(component);
            }
            self.nodes[node_id.0 as usize] = None;
            self.changed_transform_set.remove(&node_id);
        }
        self.changed_transforms
            .retain(|n| self.nodes.get(n.0 as usize).is_some_and(Option::is_some));
        Ok(())
    }

    fn collect_post_order(&self, id: NodeId, out: &mut Vec<NodeId>) {
        if let Some(node) = self.node(id) {
            for &child in &node.children {
                self.collect_post_order(child, out);
            }
            out.push(id);
        }
    }

    /// Moves a node under a new parent (or to the root), keeping its local
    /// transform.
    pub fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) -> Result<(), SceneError> {
        let old_parent = self.node(id).ok_or(SceneError::NodeNotFound(id))?.parent;
        if let Some(p) = parent {
            self.node(p).ok_or(SceneError::NodeNotFound(p))?;
            let mut cursor = Some(p);
            while let Some(c) = cursor {
                if c == id {
                    return Err(SceneError::WouldCreateCycle { node: id, parent: p });
                }
                cursor = self.node(c).and_then(|n| n.parent);
            }
        }
        if old_parent == parent {
            return Ok(());
        }

        if let Some(p) = old_parent
            && let Some(node) = self.node_mut(p)
        {
            node.children.retain(|&c| c != id);
        }
        if let Some(p) = parent
            && let Some(node) = self.node_mut(p)
        {
            node.children.push(id);
        }
        if let Some(node) = self.node_mut(id) {
            node.parent = parent;
        }

        let mut subtree = Vec::new();
        self.collect_post_order(id, &mut subtree);
        for node in subtree.into_iter().rev() {
            self.events.push(SceneEvent::NodeReparented { node });
        }
        self.propagate(id);
        Ok(())
    }

    /// Parent of a node, `None` for roots and unknown nodes.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    /// Children of a node in insertion order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Returns `true` if the node exists and has no parent.
    pub fn is_root(&self, id: NodeId) -> bool {
        self.node(id).is_some_and(|n| n.parent.is_none())
    }

    /// Returns `true` if the node exists.
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Node name.
    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.node(id).map(|n| n.name.as_str())
    }

    /// First live node with the given name.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .find(|(_, n)| n.as_ref().is_some_and(|n| n.name == name))
            .map(|(i, _)| NodeId(i as u32))
    }

    /// Live nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| NodeId(i as u32))
    }

    // --- Transforms --------------------------------------------------------

    /// Local transform relative to the parent.
    pub fn local_transform(&self, id: NodeId) -> Option<Mat4> {
        self.node(id).map(|n| n.local)
    }

    /// World transform.
    pub fn world_transform(&self, id: NodeId) -> Option<Mat4> {
        self.node(id).map(|n| n.world)
    }

    /// Scale component of the world transform.
    pub fn world_scale(&self, id: NodeId) -> Option<Vec3> {
        self.node(id)
            .map(|n| n.world.to_scale_rotation_translation().0)
    }

    /// Writes the local transform and refreshes world transforms below it.
    pub fn set_local_transform(&mut self, id: NodeId, local: Mat4) -> Result<(), SceneError> {
        self.node_mut(id).ok_or(SceneError::NodeNotFound(id))?.local = local;
        self.propagate(id);
        Ok(())
    }

    /// Writes the world transform by solving for the local transform.
    pub fn set_world_transform(&mut self, id: NodeId, world: Mat4) -> Result<(), SceneError> {
        let parent = self.node(id).ok_or(SceneError::NodeNotFound(id))?.parent;
        let parent_world = parent
            .and_then(|p| self.node(p))
            .map_or(Mat4::IDENTITY, |n| n.world);
        self.set_local_transform(id, parent_world.inverse() * world)
    }

    /// Replaces the translation of the local transform, keeping rotation and
    /// scale.
    pub fn set_local_translation(&mut self, id: NodeId, translation: Vec3) -> Result<(), SceneError> {
        let local = self.node(id).ok_or(SceneError::NodeNotFound(id))?.local;
        let (scale, rotation, _) = local.to_scale_rotation_translation();
        self.set_local_transform(
            id,
            Mat4::from_scale_rotation_translation(scale, rotation, translation),
        )
    }

    fn propagate(&mut self, id: NodeId) {
        let parent_world = self
            .parent(id)
            .and_then(|p| self.node(p))
            .map_or(Mat4::IDENTITY, |n| n.world);
        let mut stack = vec![(id, parent_world)];
        while let Some((node_id, parent_world)) = stack.pop() {
            let Some(node) = self.node_mut(node_id) else {
                continue;
            };
            node.world = parent_world * node.local;
            let world = node.world;
            for &child in &node.children {
                stack.push((child, world));
            }
            if self.changed_transform_set.insert(node_id) {
                self.changed_transforms.push(node_id);
            }
        }
    }

    /// Returns and clears the nodes whose world transform changed since the
    /// last call, in first-change order.
    pub fn take_changed_transforms(&mut self) -> Vec<NodeId> {
        self.changed_transform_set.clear();
        std::mem::take(&mut self.changed_transforms)
    }

    // --- Components --------------------------------------------------------

    /// Attaches a component to a node.
    pub fn add_component(
        &mut self,
        node: NodeId,
        component: impl Into<Component>,
    ) -> Result<ComponentId, SceneError> {
        let component = component.into();
        let kind = component.kind();
        let id = ComponentId(self.next_component);
        self.node_mut(node)
            .ok_or(SceneError::NodeNotFound(node))?
            .components
            .push(id);
        self.next_component += 1;
        self.components
            .insert(id, ComponentEntry { node, component });
        self.events.push(SceneEvent::ComponentAdded {
            node,
            component: id,
            kind,
        });
        Ok(id)
    }

    /// Detaches a component, returning its data.
    pub fn remove_component(&mut self, id: ComponentId) -> Option<Component> {
        let entry = self.components.remove(&id)?;
        if let Some(node) = self.node_mut(entry.node) {
            node.components.retain(|&c| c != id);
        }
        self.changed_components.remove(&id);
        self.events.push(SceneEvent::ComponentRemoved {
            node: entry.node,
            component: id,
            kind: entry.component.kind(),
        });
        Some(entry.component)
    }

    /// Component data.
    pub fn component(&self, id: ComponentId) -> Option<&Component> {
        self.components.get(&id).map(|e| &e.component)
    }

    /// Mutable component data. Records a [`SceneEvent::ComponentChanged`].
    pub fn component_mut(&mut self, id: ComponentId) -> Option<&mut Component> {
        let entry = self.components.get_mut(&id)?;
        if self.changed_components.insert(id) {
            self.events.push(SceneEvent::ComponentChanged {
                component: id,
                kind: entry.component.kind(),
            });
        }
        Some(&mut entry.component)
    }

    /// Mutable component data without change tracking, for writes that
    /// originate from the consumer of the change events.
    pub fn component_mut_untracked(&mut self, id: ComponentId) -> Option<&mut Component> {
        self.components.get_mut(&id).map(|e| &mut e.component)
    }

    /// Node the component is attached to.
    pub fn owner(&self, id: ComponentId) -> Option<NodeId> {
        self.components.get(&id).map(|e| e.node)
    }

    /// Kind of a live component.
    pub fn kind(&self, id: ComponentId) -> Option<ComponentKind> {
        self.component(id).map(Component::kind)
    }

    /// Components attached to a node, in attach order.
    pub fn components_of(&self, node: NodeId) -> &[ComponentId] {
        self.node(node)
            .map(|n| n.components.as_slice())
            .unwrap_or(&[])
    }

    /// Components of one kind attached to a node, in attach order.
    pub fn components_of_kind(
        &self,
        node: NodeId,
        kind: ComponentKind,
    ) -> impl Iterator<Item = ComponentId> + '_ {
        self.components_of(node)
            .iter()
            .copied()
            .filter(move |&c| self.kind(c) == Some(kind))
    }

    /// First component of a kind attached to a node.
    pub fn find_component(&self, node: NodeId, kind: ComponentKind) -> Option<ComponentId> {
        self.components_of_kind(node, kind).next()
    }

    // --- Events ------------------------------------------------------------

    /// Returns and clears the recorded lifecycle events.
    pub fn drain_events(&mut self) -> Vec<SceneEvent> {
        self.changed_components.clear();
        std::mem::take(&mut self.events)
    }
}

macro_rules! typed_accessors {
    ($($variant:ident: $ty:ty => $get:ident, $get_mut:ident, $get_mut_untracked:ident;)*) => {
        impl Scene {
            $(
                #[doc = concat!("[`", stringify!($ty), "`] data of a component, if it has that kind.")]
                pub fn $get(&self, id: ComponentId) -> Option<&$ty> {
                    match self.component(id)? {
                        Component::$variant(c) => Some(c),
                        _ => None,
                    }
                }

                #[doc = concat!("Tracked mutable [`", stringify!($ty), "`] access.")]
                pub fn $get_mut(&mut self, id: ComponentId) -> Option<&mut $ty> {
                    if !matches!(self.component(id)?, Component::$variant(_)) {
                        return None;
                    }
                    match self.component_mut(id)? {
                        Component::$variant(c) => Some(c),
                        _ => None,
                    }
                }

                #[doc = concat!("Untracked mutable [`", stringify!($ty), "`] access.")]
                pub fn $get_mut_untracked(&mut self, id: ComponentId) -> Option<&mut $ty> {
                    match self.component_mut_untracked(id)? {
                        Component::$variant(c) => Some(c),
                        _ => None,
                    }
                }
            )*
        }
    };
}

typed_accessors! {
    Body: Body => body, body_mut, body_mut_untracked;
    Collider: Collider => collider, collider_mut, collider_mut_untracked;
    CharacterController: CharacterController => controller, controller_mut, controller_mut_untracked;
    Vehicle: Vehicle => vehicle, vehicle_mut, vehicle_mut_untracked;
    Chassis: Chassis => chassis, chassis_mut, chassis_mut_untracked;
    Wheel: Wheel => wheel, wheel_mut, wheel_mut_untracked;
    RenderGeometry: RenderGeometry => render_geometry, render_geometry_mut, render_geometry_mut_untracked;
    Landscape: Landscape => landscape, landscape_mut, landscape_mut_untracked;
}

#[cfg(test)]
#[path = "scene_tests.rs"]
mod tests;
