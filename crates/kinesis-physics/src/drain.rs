//! Scene event intake and construction of engine objects for newly
//! attached components.

use glam::{Mat4, Vec3};
use kinesis_scene::{BodyFlags, ColliderGeometry, ComponentId, ComponentKind, NodeId, Scene, SceneEvent};

use crate::backend::{ActorKind, ControllerDesc, PhysicsBackend, Pose, ShapeGeometry};
use crate::error::PhysicsError;
use crate::filter::{FilterData, SurfaceRole};
use crate::geometry_cache::{CookedKind, GeometryKey};
use crate::system::{BodyRecord, ColliderRecord, ControllerRecord, DeferredRelease, PhysicsSystem};

/// Pose and scale of a node's world transform.
pub(crate) fn world_pose(scene: &Scene, node: NodeId) -> (Pose, Vec3) {
    Pose::from_mat4(&scene.world_transform(node).unwrap_or(Mat4::IDENTITY))
}

/// Pose of a collider node in the frame of its body's node, followed by the
/// shape's own offset.
pub(crate) fn relative_pose(scene: &Scene, body_node: NodeId, collider_node: NodeId, offset: &Pose) -> Pose {
    let (body_pose, _) = world_pose(scene, body_node);
    let (collider_pose, _) = world_pose(scene, collider_node);
    body_pose.inverse().mul(&collider_pose).mul(offset)
}

/// Nearest body at or above `node` accepted by `is_body`.
pub(crate) fn resolve_owner(
    scene: &Scene,
    node: NodeId,
    is_body: impl Fn(ComponentId) -> bool,
) -> Option<ComponentId> {
    let mut current = Some(node);
    while let Some(n) = current {
        if let Some(body) = scene
            .components_of_kind(n, ComponentKind::Body)
            .find(|&b| is_body(b))
        {
            return Some(body);
        }
        current = scene.parent(n);
    }
    None
}

/// Engine geometry of the collider shapes that need no source data.
pub(crate) fn primitive_geometry(geometry: ColliderGeometry) -> Option<ShapeGeometry> {
    match geometry {
        ColliderGeometry::Box { half_size } => Some(ShapeGeometry::Box {
            half_extents: half_size,
        }),
        ColliderGeometry::Capsule {
            radius,
            half_height,
        } => Some(ShapeGeometry::Capsule {
            radius,
            half_height,
        }),
        ColliderGeometry::Sphere { radius } => Some(ShapeGeometry::Sphere { radius }),
        ColliderGeometry::Plane => Some(ShapeGeometry::Plane),
        ColliderGeometry::Mesh | ColliderGeometry::ConvexHull | ColliderGeometry::HeightField => None,
    }
}

/// Colliders in the subtree of `node`, not descending into nested bodies.
fn subtree_colliders(scene: &Scene, node: NodeId) -> Vec<ComponentId> {
    let mut out = Vec::new();
    let mut stack = vec![node];
    while let Some(n) = stack.pop() {
        out.extend(scene.components_of_kind(n, ComponentKind::Collider));
        for &child in scene.children(n) {
            if scene.find_component(child, ComponentKind::Body).is_none() {
                stack.push(child);
            }
        }
    }
    out
}

/// Render fragments on a collider's own node, in their raw coordinates.
/// The cache key names the fragments only, so nothing placement-dependent
/// may be baked into the vertices.
struct MeshSource {
    key: GeometryKey,
    vertices: Vec<Vec3>,
    indices: Vec<u32>,
}

fn gather_mesh_source(scene: &Scene, node: NodeId) -> Option<MeshSource> {
    let mut ids = Vec::new();
    let mut vertices = Vec::new();
    let mut indices = Vec::new();

    for render in scene.components_of_kind(node, ComponentKind::RenderGeometry) {
        let Some(render) = scene.render_geometry(render) else {
            continue;
        };
        for fragment in &render.fragments {
            let base = vertices.len() as u32;
            ids.push(fragment.id);
            vertices.extend_from_slice(&fragment.vertices);
            indices.extend(fragment.indices.iter().map(|i| i + base));
        }
    }

    if vertices.is_empty() {
        return None;
    }
    Some(MeshSource {
        key: GeometryKey::new(ids),
        vertices,
        indices,
    })
}

impl<B: PhysicsBackend> PhysicsSystem<B> {
    // -----------------------------------------------------------------------
    // Event intake
    // -----------------------------------------------------------------------

    /// Moves scene events into the pending and update sets. Bookkeeping is
    /// updated immediately; engine releases wait for the outstanding step.
    pub(crate) fn ingest_events(&mut self, scene: &mut Scene) {
        let events = scene.drain_events();
        let scene = &*scene;
        for event in events {
            match event {
                SceneEvent::ComponentAdded {
                    node,
                    component,
                    kind,
                } => self.component_added(scene, node, component, kind),
                SceneEvent::ComponentRemoved {
                    node,
                    component,
                    kind,
                } => self.component_removed(scene, node, component, kind),
                SceneEvent::ComponentChanged { component, .. } => {
                    self.scheduled_updates.insert(component);
                }
                SceneEvent::NodeReparented { node } => self.node_reparented(scene, node),
            }
        }
    }

    fn component_added(&mut self, scene: &Scene, node: NodeId, id: ComponentId, kind: ComponentKind) {
        match kind {
            ComponentKind::Body => {
                let kind = match scene.body(id) {
                    Some(body) if body.is_dynamic() => ActorKind::Dynamic,
                    Some(_) => ActorKind::Static,
                    None => return,
                };
                self.bodies.insert(
                    id,
                    BodyRecord {
                        node,
                        kind,
                        actor: None,
                        scale: Vec3::ONE,
                    },
                );
                self.pending_bodies.push(id);
                self.vehicles.invalidate_near(scene, node);
            }
            ComponentKind::Collider => {
                self.colliders.insert(id, ColliderRecord::new(node));
                self.queue_collider(id);
            }
            ComponentKind::CharacterController => {
                if !scene.is_root(node) {
                    tracing::warn!(node = node.0, "character controller on a non-root node");
                }
                self.controllers
                    .insert(id, ControllerRecord { node, handle: None });
                self.pending_controllers.push(id);
            }
            ComponentKind::Vehicle => self.vehicles.register(id, node),
            ComponentKind::Chassis | ComponentKind::Wheel => self.vehicles.invalidate_near(scene, node),
            ComponentKind::RenderGeometry | ComponentKind::Landscape => self.geometry_arrived(node),
        }
    }

    fn component_removed(&mut self, scene: &Scene, node: NodeId, id: ComponentId, kind: ComponentKind) {
        self.scheduled_updates.remove(&id);
        match kind {
            ComponentKind::Body => self.unregister_body(id),
            ComponentKind::Collider => self.unregister_collider(id),
            ComponentKind::CharacterController => self.unregister_controller(id),
            ComponentKind::Vehicle => self.vehicles.unregister(id),
            ComponentKind::Chassis | ComponentKind::Wheel => self.vehicles.invalidate_near(scene, node),
            ComponentKind::RenderGeometry | ComponentKind::Landscape => {
                self.geometry_removed(scene, node)
            }
        }
    }

    pub(crate) fn queue_collider(&mut self, id: ComponentId) {
        if !self.pending_colliders.contains(&id) {
            self.pending_colliders.push(id);
        }
    }

    fn unregister_body(&mut self, id: ComponentId) {
        self.pending_bodies.retain(|&b| b != id);
        self.forces.retain(|&(b, ..)| b != id);
        let Some(record) = self.bodies.remove(&id) else {
            return;
        };
        self.vehicles.body_removed(id);
        if let Some(actor) = record.actor {
            self.actor_owners.remove(&actor);
            self.release(DeferredRelease::Actor(actor));
            tracing::debug!(body = id.0, "released actor");
        }

        // Shapes survive their body and wait for the next one above them.
        let orphans: Vec<ComponentId> = self
            .colliders
            .iter_mut()
            .filter(|(_, c)| c.owner == Some(id))
            .map(|(&cid, c)| {
                c.owner = None;
                cid
            })
            .collect();
        for collider in orphans {
            self.queue_collider(collider);
        }
    }

    fn unregister_collider(&mut self, id: ComponentId) {
        self.pending_colliders.retain(|&c| c != id);
        for waiting in self.waiting_for_geometry.values_mut() {
            waiting.retain(|&c| c != id);
        }
        self.waiting_for_geometry.retain(|_, waiting| !waiting.is_empty());

        let Some(record) = self.colliders.remove(&id) else {
            return;
        };
        self.vehicles.collider_removed(id, record.node);
        if let Some(shape) = record.shape {
            self.shape_owners.remove(&shape);
            self.release(DeferredRelease::Shape(shape));
            tracing::debug!(collider = id.0, "released shape");
        }
        if let Some(mesh) = record.cooked {
            self.release(DeferredRelease::Cooked(mesh));
        }
        if let Some(owner) = record.owner {
            self.scheduled_updates.insert(owner);
        }
    }

    fn unregister_controller(&mut self, id: ComponentId) {
        self.pending_controllers.retain(|&c| c != id);
        if let Some(handle) = self.controllers.remove(&id).and_then(|r| r.handle) {
            self.release(DeferredRelease::Controller(handle));
        }
    }

    /// Requeues colliders parked on the node.
    fn geometry_arrived(&mut self, node: NodeId) {
        if let Some(waiting) = self.waiting_for_geometry.remove(&node) {
            for collider in waiting {
                self.queue_collider(collider);
            }
        }
    }

    /// Drops shapes built from the node's render or landscape data and
    /// requeues them; the drain rebuilds or parks them.
    fn geometry_removed(&mut self, scene: &Scene, node: NodeId) {
        let affected: Vec<ComponentId> = scene
            .components_of_kind(node, ComponentKind::Collider)
            .collect();

        for id in affected {
            let Some(record) = self.colliders.get_mut(&id) else {
                continue;
            };
            if !record.geometry.is_some_and(|g| g.needs_source_data()) {
                continue;
            }
            record.geometry = None;
            let (shape, cooked, owner) = (record.shape.take(), record.cooked.take(), record.owner);
            if let Some(shape) = shape {
                self.shape_owners.remove(&shape);
                self.release(DeferredRelease::Shape(shape));
            }
            if let Some(mesh) = cooked {
                self.release(DeferredRelease::Cooked(mesh));
            }
            if let Some(owner) = owner {
                self.scheduled_updates.insert(owner);
            }
            self.queue_collider(id);
        }
    }

    /// Re-resolves the owning body of the node's colliders.
    fn node_reparented(&mut self, scene: &Scene, node: NodeId) {
        let colliders: Vec<ComponentId> = scene
            .components_of_kind(node, ComponentKind::Collider)
            .collect();
        for id in colliders {
            let bodies = &self.bodies;
            let owner = resolve_owner(scene, node, |b| bodies.contains_key(&b));
            let Some(record) = self.colliders.get_mut(&id) else {
                continue;
            };
            if record.owner == owner {
                continue;
            }
            let (previous, shape) = (record.owner.take(), record.shape);
            if let Some(previous) = previous {
                let actor = self.bodies.get(&previous).and_then(|b| b.actor);
                if let (Some(actor), Some(shape)) = (actor, shape) {
                    self.release(DeferredRelease::Detach(actor, shape));
                }
                self.scheduled_updates.insert(previous);
            }
            self.queue_collider(id);
        }

        if scene
            .find_component(node, ComponentKind::CharacterController)
            .is_some()
            && !scene.is_root(node)
        {
            tracing::warn!(node = node.0, "character controller moved below another node");
        }
        self.vehicles.invalidate_near(scene, node);
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Creates engine objects for every pending component. Components that
    /// were drained already are skipped, so draining twice is a no-op.
    pub(crate) fn drain_pending(&mut self, scene: &mut Scene) {
        for id in std::mem::take(&mut self.pending_bodies) {
            self.drain_body(scene, id);
        }
        for id in std::mem::take(&mut self.pending_colliders) {
            self.drain_collider(scene, id);
        }
        for id in std::mem::take(&mut self.pending_controllers) {
            self.drain_controller(scene, id);
        }
    }

    pub(crate) fn drain_body(&mut self, scene: &mut Scene, id: ComponentId) {
        let Some(record) = self.bodies.get(&id) else {
            return;
        };
        if record.actor.is_some() {
            return;
        }
        let (node, kind) = (record.node, record.kind);
        let Some(body) = scene.body(id) else {
            return;
        };
        let flags = body.flags;
        let params = body.dynamic_params().copied();

        let (pose, scale) = world_pose(scene, node);
        let actor = self.backend.create_actor(kind, pose);
        self.backend.set_actor_flags(actor, flags);
        if let Some(params) = params {
            self.backend.set_dynamic_params(actor, &params);
        }
        if let Some(record) = self.bodies.get_mut(&id) {
            record.actor = Some(actor);
            record.scale = scale;
        }
        self.actor_owners.insert(actor, id);
        tracing::debug!(body = id.0, ?kind, "created actor");

        for collider in subtree_colliders(scene, node) {
            if let Some(record) = self.colliders.get_mut(&collider) {
                let previous = record.owner.replace(id);
                if let Some(previous) = previous.filter(|&p| p != id) {
                    self.scheduled_updates.insert(previous);
                }
            }
            self.attach_collider(scene, collider);
        }

        self.update_body_mass(scene, id);
        self.backend.add_actor_to_scene(actor);
        self.vehicles.invalidate_near(scene, node);
    }

    pub(crate) fn drain_collider(&mut self, scene: &mut Scene, id: ComponentId) {
        let Some(record) = self.colliders.get(&id) else {
            return;
        };
        let node = record.node;
        if record.shape.is_none() {
            match self.build_collider_shape(scene, id) {
                Ok(true) => {}
                Ok(false) => {
                    let waiting = self.waiting_for_geometry.entry(node).or_default();
                    if !waiting.contains(&id) {
                        waiting.push(id);
                    }
                    tracing::trace!(collider = id.0, "collider waiting for source geometry");
                    return;
                }
                Err(err) => {
                    tracing::warn!(collider = id.0, %err, "collider left without a shape");
                    return;
                }
            }
        }

        let bodies = &self.bodies;
        let owner = resolve_owner(scene, node, |b| bodies.contains_key(&b));
        if let Some(record) = self.colliders.get_mut(&id) {
            record.owner = owner;
        }
        self.attach_collider(scene, id);
        if let Some(owner) = owner {
            self.update_body_mass(scene, owner);
        }
        self.vehicles.invalidate_near(scene, node);
    }

    fn drain_controller(&mut self, scene: &mut Scene, id: ComponentId) {
        let Some(record) = self.controllers.get(&id) else {
            return;
        };
        if record.handle.is_some() {
            return;
        }
        let node = record.node;
        let foot = scene
            .local_transform(node)
            .map(|m| m.w_axis.truncate())
            .unwrap_or(Vec3::ZERO);
        let Some(controller) = scene.controller_mut_untracked(id) else {
            return;
        };
        controller.take_geometry_change();
        let desc = ControllerDesc {
            geometry: controller.geometry(),
            foot_position: foot,
            up: Vec3::Z,
            material: self.materials.default_material(),
        };

        match self.backend.create_controller(&desc) {
            Some(handle) => {
                if let Some(record) = self.controllers.get_mut(&id) {
                    record.handle = Some(handle);
                }
                tracing::debug!(controller = id.0, "created character controller");
            }
            None => tracing::warn!(controller = id.0, "character controller not created"),
        }
    }

    // -----------------------------------------------------------------------
    // Shapes
    // -----------------------------------------------------------------------

    /// Builds the engine shape of a collider. `Ok(false)` means the source
    /// data is not available yet.
    pub(crate) fn build_collider_shape(&mut self, scene: &Scene, id: ComponentId) -> Result<bool, PhysicsError> {
        let record = self
            .colliders
            .get(&id)
            .ok_or(PhysicsError::UnknownComponent(id))?;
        let (node, mut role) = (record.node, record.role);
        let collider = scene
            .collider(id)
            .ok_or(PhysicsError::UnknownComponent(id))?;
        let geometry = collider.geometry;
        let masks = (collider.type_mask, collider.collide_with_mask);
        let explicit_mass = collider.override_mass().then(|| collider.mass());
        let material = self.materials.resolve(&collider.material);
        let (_, scale) = world_pose(scene, node);

        let mut cooked = None;
        let mut offset = Pose::IDENTITY;
        let shape_geometry = match geometry {
            ColliderGeometry::Box { .. }
            | ColliderGeometry::Capsule { .. }
            | ColliderGeometry::Sphere { .. }
            | ColliderGeometry::Plane => {
                primitive_geometry(geometry).ok_or(PhysicsError::UnknownComponent(id))?
            }
            ColliderGeometry::Mesh => {
                let Some(source) = gather_mesh_source(scene, node) else {
                    return Ok(false);
                };
                let mesh = self.cooked_geometry(CookedKind::TriangleMesh, source, node)?;
                ShapeGeometry::TriangleMesh { mesh, scale }
            }
            ColliderGeometry::ConvexHull => {
                let Some(source) = gather_mesh_source(scene, node) else {
                    return Ok(false);
                };
                let mesh = self.cooked_geometry(CookedKind::ConvexHull, source, node)?;
                ShapeGeometry::ConvexHull { mesh, scale }
            }
            ColliderGeometry::HeightField => {
                let Some(landscape) = scene
                    .find_component(node, ComponentKind::Landscape)
                    .and_then(|l| scene.landscape(l))
                else {
                    return Ok(false);
                };
                let mesh = self
                    .backend
                    .cook_height_field(landscape)
                    .ok_or(PhysicsError::CookFailed {
                        node,
                        kind: "height field",
                    })?;
                cooked = Some(mesh);
                offset = Pose::from_translation(Vec3::new(
                    -0.5 * landscape.size.x * scale.x,
                    -0.5 * landscape.size.y * scale.y,
                    0.0,
                ));
                role = SurfaceRole::Ground;
                ShapeGeometry::HeightField { mesh }
            }
        };

        let Some(shape) = self.backend.create_shape(shape_geometry, material) else {
            if let Some(mesh) = cooked {
                self.backend.release_cooked(mesh);
            }
            return Err(PhysicsError::CookFailed { node, kind: "shape" });
        };

        // Mesh and hull geometry carry their scale already.
        let shape_scale = match geometry {
            ColliderGeometry::Mesh | ColliderGeometry::ConvexHull => Vec3::ONE,
            _ => scale,
        };
        self.backend.set_shape_scale(shape, shape_scale);
        let (type_mask, collide_with_mask) = role.masks(masks.0, masks.1);
        self.backend
            .set_simulation_filter(shape, FilterData::simulation(type_mask, collide_with_mask));
        self.backend.set_query_filter(shape, role.query_filter());
        if let Some(mass) = explicit_mass {
            self.backend.set_shape_mass(shape, mass);
        }

        if let Some(record) = self.colliders.get_mut(&id) {
            record.shape = Some(shape);
            record.geometry = Some(geometry);
            record.role = role;
            record.scale = scale;
            record.local_offset = offset;
            record.cooked = cooked;
        }
        self.shape_owners.insert(shape, id);
        tracing::debug!(collider = id.0, ?geometry, "created shape");
        Ok(true)
    }

    /// Cooked mesh or hull for the source, from the cache when possible.
    fn cooked_geometry(
        &mut self,
        kind: CookedKind,
        source: MeshSource,
        node: NodeId,
    ) -> Result<crate::backend::CookedMeshHandle, PhysicsError> {
        if let Some(handle) = self.cache.get(kind, &source.key) {
            return Ok(handle);
        }
        let cooked = match kind {
            CookedKind::TriangleMesh => self
                .backend
                .cook_triangle_mesh(&source.vertices, &source.indices),
            CookedKind::ConvexHull => self.backend.cook_convex_hull(&source.vertices),
        };
        let handle = cooked.ok_or(PhysicsError::CookFailed {
            node,
            kind: match kind {
                CookedKind::TriangleMesh => "triangle mesh",
                CookedKind::ConvexHull => "convex hull",
            },
        })?;
        self.cache.insert(kind, source.key, handle);
        Ok(handle)
    }

    /// Attaches a collider's shape to its owner's actor, placing it
    /// relative to the body node.
    pub(crate) fn attach_collider(&mut self, scene: &Scene, id: ComponentId) {
        let Some(record) = self.colliders.get(&id) else {
            return;
        };
        let (Some(shape), Some(owner)) = (record.shape, record.owner) else {
            return;
        };
        let Some(body) = self.bodies.get(&owner) else {
            return;
        };
        let Some(actor) = body.actor else {
            return;
        };

        let local = relative_pose(scene, body.node, record.node, &record.local_offset);
        let kind = body.kind;
        self.backend.set_shape_local_pose(shape, local);
        if self.backend.shape_actor(shape) != Some(actor) {
            self.backend.attach_shape(actor, shape);
        }

        let ccd = self.ccd_requested(scene, owner);
        let filter = self.backend.simulation_filter(shape).with_ccd(ccd);
        self.backend.set_simulation_filter(shape, filter);

        let excluded = scene
            .body(owner)
            .is_some_and(|b| b.flags.contains(BodyFlags::EXCLUDE_FROM_SIMULATION));
        if kind == ActorKind::Dynamic && !excluded {
            self.backend.wake_actor(actor);
        }
    }

    /// Whether shapes of a body carry the CCD bit.
    pub(crate) fn ccd_requested(&self, scene: &Scene, body: ComponentId) -> bool {
        self.ccd_enabled
            && scene
                .body(body)
                .and_then(|b| b.dynamic_params())
                .is_some_and(|p| p.ccd_enabled)
    }
}
