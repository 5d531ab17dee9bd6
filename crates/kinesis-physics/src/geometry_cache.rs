//! Content-addressed cache of cooked collision geometry.
//!
//! Cooking a triangle mesh or convex hull is expensive, and many colliders
//! share the same render fragments. Entries are keyed by the set of source
//! fragment ids, so the order in which a collider lists its fragments does
//! not matter.

use rustc_hash::FxHashMap;

use kinesis_scene::GeometryId;

use crate::backend::{CookedMeshHandle, PhysicsBackend};

/// Which cooked artifact an entry holds. A mesh and a hull cooked from the
/// same fragments are distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CookedKind {
    TriangleMesh,
    ConvexHull,
}

/// Sorted, deduplicated list of source fragment ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GeometryKey(Vec<GeometryId>);

impl GeometryKey {
    pub fn new(ids: impl IntoIterator<Item = GeometryId>) -> Self {
        let mut ids: Vec<GeometryId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }

    pub fn ids(&self) -> &[GeometryId] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Cooked geometry, owned until [`GeometryCache::release_all`].
#[derive(Default)]
pub struct GeometryCache {
    meshes: FxHashMap<GeometryKey, CookedMeshHandle>,
    hulls: FxHashMap<GeometryKey, CookedMeshHandle>,
}

impl GeometryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: CookedKind) -> &FxHashMap<GeometryKey, CookedMeshHandle> {
        match kind {
            CookedKind::TriangleMesh => &self.meshes,
            CookedKind::ConvexHull => &self.hulls,
        }
    }

    /// Cached artifact for the key, if any.
    pub fn get(&self, kind: CookedKind, key: &GeometryKey) -> Option<CookedMeshHandle> {
        self.table(kind).get(key).copied()
    }

    /// Stores a freshly cooked artifact. The key must not be cached yet.
    pub fn insert(&mut self, kind: CookedKind, key: GeometryKey, handle: CookedMeshHandle) {
        let table = match kind {
            CookedKind::TriangleMesh => &mut self.meshes,
            CookedKind::ConvexHull => &mut self.hulls,
        };
        let previous = table.insert(key, handle);
        debug_assert!(previous.is_none(), "geometry cached twice");
    }

    /// Total number of cached artifacts.
    pub fn len(&self) -> usize {
        self.meshes.len() + self.hulls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frees every cached artifact in the backend.
    pub fn release_all<B: PhysicsBackend>(&mut self, backend: &mut B) {
        for (_, handle) in self.meshes.drain().chain(self.hulls.drain()) {
            backend.release_cooked(handle);
        }
    }
}
