//! Scheduled property updates for components whose engine objects exist.

use kinesis_scene::{ComponentId, ComponentKind, Scene};

use crate::backend::{ActorKind, PhysicsBackend, Pose};
use crate::drain::{primitive_geometry, world_pose};
use crate::system::{DeferredRelease, PhysicsSystem};

impl<B: PhysicsBackend> PhysicsSystem<B> {
    /// Re-derives engine state for every scheduled component, in id order.
    pub(crate) fn apply_updates(&mut self, scene: &mut Scene) {
        while let Some(id) = self.scheduled_updates.pop_first() {
            match scene.kind(id) {
                Some(ComponentKind::Body) => self.update_body(scene, id),
                Some(ComponentKind::Collider) => self.update_collider(scene, id),
                Some(ComponentKind::CharacterController) => self.update_controller(scene, id),
                Some(ComponentKind::Vehicle) => self.vehicles.vehicle_changed(scene, id),
                Some(ComponentKind::Chassis | ComponentKind::Wheel) => {
                    if let Some(node) = scene.owner(id) {
                        self.vehicles.invalidate_near(scene, node);
                    }
                }
                _ => {}
            }
        }
    }

    fn update_body(&mut self, scene: &mut Scene, id: ComponentId) {
        let Some(record) = self.bodies.get(&id) else {
            return;
        };
        let Some(actor) = record.actor else {
            return;
        };
        let (node, built_kind) = (record.node, record.kind);
        let Some(body) = scene.body(id) else {
            return;
        };
        let kind = if body.is_dynamic() {
            ActorKind::Dynamic
        } else {
            ActorKind::Static
        };

        if kind != built_kind {
            // Actors cannot change kind; build a new one and move the shapes.
            self.actor_owners.remove(&actor);
            self.release(DeferredRelease::Actor(actor));
            self.vehicles.body_removed(id);
            if let Some(record) = self.bodies.get_mut(&id) {
                record.kind = kind;
                record.actor = None;
            }
            tracing::debug!(body = id.0, ?kind, "body variant changed, recreating actor");
            self.drain_body(scene, id);
            return;
        }

        let flags = body.flags;
        let params = body.dynamic_params().copied();
        self.backend.set_actor_flags(actor, flags);
        if let Some(params) = params {
            self.backend.set_dynamic_params(actor, &params);
        }
        let ccd = self.ccd_requested(scene, id);
        for shape in self.backend.actor_shapes(actor) {
            let filter = self.backend.simulation_filter(shape).with_ccd(ccd);
            self.backend.set_simulation_filter(shape, filter);
        }
        self.update_body_mass(scene, id);
        self.vehicles.invalidate_near(scene, node);
    }

    fn update_collider(&mut self, scene: &mut Scene, id: ComponentId) {
        let Some(record) = self.colliders.get(&id) else {
            return;
        };
        let Some(shape) = record.shape else {
            // Parked or failed earlier; the new properties may be buildable.
            for waiting in self.waiting_for_geometry.values_mut() {
                waiting.retain(|&c| c != id);
            }
            self.drain_collider(scene, id);
            return;
        };
        let (node, owner, role, built) = (record.node, record.owner, record.role, record.geometry);
        let Some(collider) = scene.collider(id) else {
            return;
        };
        let geometry = collider.geometry;

        if built != Some(geometry) {
            match primitive_geometry(geometry) {
                Some(engine_geometry) if !built.is_some_and(|g| g.needs_source_data()) => {
                    let (_, scale) = world_pose(scene, node);
                    self.backend.set_shape_geometry(shape, engine_geometry);
                    self.backend.set_shape_scale(shape, scale);
                    if let Some(record) = self.colliders.get_mut(&id) {
                        record.geometry = Some(geometry);
                        record.scale = scale;
                    }
                }
                _ => {
                    self.rebuild_collider(scene, id);
                    return;
                }
            }
        }

        let Some(collider) = scene.collider(id) else {
            return;
        };
        let material = self.materials.resolve(&collider.material);
        self.backend.set_shape_material(shape, material);
        let (type_mask, collide_with_mask) = role.masks(collider.type_mask, collider.collide_with_mask);
        let filter = self
            .backend
            .simulation_filter(shape)
            .with_masks(type_mask, collide_with_mask);
        self.backend.set_simulation_filter(shape, filter);
        self.backend.set_query_filter(shape, role.query_filter());
        if collider.override_mass() {
            self.backend.set_shape_mass(shape, collider.mass());
        }

        if let Some(owner) = owner {
            self.update_body_mass(scene, owner);
            self.wake_body(owner);
        }
        self.vehicles.invalidate_near(scene, node);
    }

    /// Wakes a dynamic body after one of its colliders changed.
    fn wake_body(&mut self, body: ComponentId) {
        if let Some(record) = self.bodies.get(&body)
            && record.kind == ActorKind::Dynamic
            && let Some(actor) = record.actor
        {
            self.backend.wake_actor(actor);
        }
    }

    /// Drops a collider's shape and builds it again from the component.
    fn rebuild_collider(&mut self, scene: &mut Scene, id: ComponentId) {
        let Some(record) = self.colliders.get_mut(&id) else {
            return;
        };
        let (shape, cooked, owner) = (record.shape.take(), record.cooked.take(), record.owner);
        record.geometry = None;
        record.local_offset = Pose::IDENTITY;
        if let Some(shape) = shape {
            self.shape_owners.remove(&shape);
            self.release(DeferredRelease::Shape(shape));
        }
        if let Some(mesh) = cooked {
            self.release(DeferredRelease::Cooked(mesh));
        }
        tracing::debug!(collider = id.0, "rebuilding collider shape");

        self.drain_collider(scene, id);
        if let Some(owner) = owner
            && self.colliders.get(&id).and_then(|r| r.owner) != Some(owner)
        {
            self.update_body_mass(scene, owner);
        }
    }

    fn update_controller(&mut self, scene: &mut Scene, id: ComponentId) {
        let Some(record) = self.controllers.get(&id) else {
            return;
        };
        let Some(handle) = record.handle else {
            return;
        };
        let node = record.node;
        let Some(controller) = scene.controller_mut_untracked(id) else {
            return;
        };
        let resized = controller.take_geometry_change().then(|| controller.geometry());
        let teleport = controller.take_teleport();

        if let Some(geometry) = resized {
            self.backend.resize_controller(handle, geometry);
        }
        if let Some(foot) = teleport {
            self.backend.set_controller_position(handle, foot);
            if let Err(err) = scene.set_local_translation(node, foot) {
                tracing::warn!(controller = id.0, %err, "failed to move teleported controller node");
            }
        }
    }

    /// Derives collider masses and the actor's mass from its attached
    /// shapes. Explicit collider masses are used as given; the others are
    /// written back to their components.
    pub(crate) fn update_body_mass(&mut self, scene: &mut Scene, body: ComponentId) {
        let Some(record) = self.bodies.get(&body) else {
            return;
        };
        let (Some(actor), kind) = (record.actor, record.kind) else {
            return;
        };

        let mut masses = Vec::new();
        for shape in self.backend.actor_shapes(actor) {
            let Some(&collider) = self.shape_owners.get(&shape) else {
                continue;
            };
            let Some(component) = scene.collider_mut_untracked(collider) else {
                continue;
            };
            let mass = if component.override_mass() {
                component.mass()
            } else {
                let derived = self.backend.shape_mass(shape);
                component.set_derived_mass(derived);
                derived
            };
            masses.push((shape, mass));
        }

        if kind == ActorKind::Dynamic {
            self.backend.set_actor_mass_from_shapes(actor, &masses);
        }
    }
}
