//! Per-frame collision events republished from engine contact reports.

use glam::Vec3;
use kinesis_scene::NodeId;

use crate::backend::{ContactReport, ShapeHandle};

/// One contact point of a colliding pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactPoint {
    /// World-space position.
    pub position: Vec3,
    /// Impulse applied at the point during the step.
    pub impulse: Vec3,
}

/// A colliding pair and its contact points.
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionEvent {
    /// Node owning the first collider.
    pub first: NodeId,
    /// Node owning the second collider.
    pub second: NodeId,
    pub points: Vec<ContactPoint>,
}

impl CollisionEvent {
    /// Returns `true` if `node` is one side of the pair.
    pub fn involves(&self, node: NodeId) -> bool {
        self.first == node || self.second == node
    }
}

/// Collision events of the last completed step.
///
/// The collection is replaced wholesale on every completed fetch; it never
/// accumulates across steps.
#[derive(Debug, Default)]
pub struct CollisionEventCollector {
    events: Vec<CollisionEvent>,
}

impl CollisionEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the published events with the given engine reports.
    ///
    /// Reports referring to shapes that `owner_of` no longer knows are
    /// dropped, and each pair keeps at most `max_points` points.
    pub fn rebuild(
        &mut self,
        reports: Vec<ContactReport>,
        max_points: usize,
        owner_of: impl Fn(ShapeHandle) -> Option<NodeId>,
    ) {
        self.events.clear();
        for report in reports {
            let (Some(first), Some(second)) = (owner_of(report.shape_a), owner_of(report.shape_b))
            else {
                continue;
            };
            let mut points = report.points;
            points.truncate(max_points);
            self.events.push(CollisionEvent {
                first,
                second,
                points,
            });
        }
    }

    /// Drops every published event.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn events(&self) -> &[CollisionEvent] {
        &self.events
    }

    /// Events in which `node` takes part.
    pub fn events_for(&self, node: NodeId) -> impl Iterator<Item = &CollisionEvent> {
        self.events.iter().filter(move |e| e.involves(node))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
