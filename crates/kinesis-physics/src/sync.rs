//! Transform flow between the scene and the engine: publishing simulated
//! poses up, pushing scene edits down, and the per-frame controller and
//! force passes.

use rustc_hash::FxHashSet;

use kinesis_scene::{ComponentId, MovementMode, NodeId, Scene};

use crate::backend::{ActorKind, ControllerHandle, PhysicsBackend};
use crate::drain::{relative_pose, world_pose};
use crate::physics_debug;
use crate::system::PhysicsSystem;

impl<B: PhysicsBackend> PhysicsSystem<B> {
    /// Writes the results of a completed step into the scene: collision
    /// events, then the pose of every active body and of the collider
    /// nodes below it.
    pub(crate) fn publish(&mut self, scene: &mut Scene) {
        let reports = self.backend.take_contacts();
        let (shape_owners, colliders) = (&self.shape_owners, &self.colliders);
        self.collisions
            .rebuild(reports, self.max_contact_points, |shape| {
                shape_owners
                    .get(&shape)
                    .and_then(|c| colliders.get(c))
                    .map(|r| r.node)
            });

        for actor in self.backend.active_actors() {
            let Some(record) = self
                .actor_owners
                .get(&actor)
                .and_then(|body| self.bodies.get(body))
            else {
                continue;
            };
            let Some(pose) = self.backend.actor_pose(actor) else {
                continue;
            };
            if let Err(err) = scene.set_world_transform(record.node, pose.to_mat4_scaled(record.scale)) {
                tracing::warn!(%err, "failed to publish body pose");
                continue;
            }

            // Shapes moved inside the actor (wheels) carry their node along.
            let mut placed = FxHashSet::default();
            placed.insert(record.node);
            for shape in self.backend.actor_shapes(actor) {
                let Some(collider) = self
                    .shape_owners
                    .get(&shape)
                    .and_then(|c| self.colliders.get(c))
                else {
                    continue;
                };
                if !placed.insert(collider.node) {
                    continue;
                }
                let local = self.backend.shape_local_pose(shape);
                let world = pose.mul(&local.mul(&collider.local_offset.inverse()));
                if let Err(err) = scene.set_world_transform(collider.node, world.to_mat4_scaled(collider.scale)) {
                    tracing::warn!(%err, "failed to publish collider pose");
                }
            }
        }
    }

    /// Copies scene transform edits into the engine while the simulation is
    /// disabled.
    pub(crate) fn push_down(&mut self, scene: &Scene, changed: &[NodeId]) {
        if changed.is_empty() {
            return;
        }
        let changed: FxHashSet<NodeId> = changed.iter().copied().collect();

        for record in self.bodies.values() {
            if let Some(actor) = record.actor
                && changed.contains(&record.node)
            {
                let (pose, _) = world_pose(scene, record.node);
                self.backend.set_actor_pose(actor, pose);
            }
        }

        for record in self.colliders.values() {
            if !changed.contains(&record.node) {
                continue;
            }
            let (Some(shape), Some(owner)) = (record.shape, record.owner) else {
                continue;
            };
            let Some(body) = self.bodies.get(&owner) else {
                continue;
            };
            let local = relative_pose(scene, body.node, record.node, &record.local_offset);
            self.backend.set_shape_local_pose(shape, local);
        }

        for record in self.controllers.values() {
            if let Some(handle) = record.handle
                && changed.contains(&record.node)
                && let Some(local) = scene.local_transform(record.node)
            {
                self.backend
                    .set_controller_position(handle, local.w_axis.truncate());
            }
        }
    }

    /// Sweeps every controller by its queued displacement and writes the
    /// resulting foot position back to its node.
    pub(crate) fn move_controllers(&mut self, scene: &mut Scene, dt: f32) {
        let gravity = self.backend.gravity();
        let mut controllers: Vec<(ComponentId, NodeId, ControllerHandle)> = self
            .controllers
            .iter()
            .filter_map(|(&id, r)| Some((id, r.node, r.handle?)))
            .collect();
        controllers.sort_unstable_by_key(|&(id, ..)| id);

        for (id, node, handle) in controllers {
            let Some(controller) = scene.controller_mut_untracked(id) else {
                continue;
            };
            let mut displacement = controller.take_displacement();
            if controller.movement_mode == MovementMode::Walking {
                displacement.z = 0.0;
                displacement += gravity * dt;
            }

            let result = self.backend.move_controller(handle, displacement, dt);
            controller.set_grounded(result.collision_down);
            if let Err(err) = scene.set_local_translation(node, result.foot_position) {
                tracing::warn!(controller = id.0, %err, "failed to move controller node");
            }
        }
    }

    /// Hands queued forces to the engine. Forces on bodies that are not
    /// dynamic are dropped.
    pub(crate) fn apply_forces(&mut self) {
        for (body, force, mode) in std::mem::take(&mut self.forces) {
            let Some(actor) = self.bodies.get(&body).and_then(|r| r.actor) else {
                continue;
            };
            if self.backend.actor_kind(actor) != Some(ActorKind::Dynamic) {
                tracing::trace!(body = body.0, "force on a non-dynamic body ignored");
                continue;
            }
            self.backend.apply_force(actor, force, mode);
        }
    }

    pub(crate) fn refresh_debug_lines(&mut self, scene: &Scene) {
        let mut shapes: Vec<_> = self.shape_owners.keys().copied().collect();
        shapes.sort_unstable();
        let mut controllers: Vec<_> = self
            .controllers
            .iter()
            .filter_map(|(&id, r)| Some((id, r.handle?, scene.controller(id)?.geometry())))
            .collect();
        controllers.sort_unstable_by_key(|&(id, ..)| id);

        physics_debug::capture(
            &mut self.debug_lines,
            &self.backend,
            shapes,
            controllers.into_iter().map(|(_, handle, geometry)| (handle, geometry)),
            self.collisions.events(),
        );
    }
}
