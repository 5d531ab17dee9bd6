//! Engine-side material table.

use rustc_hash::{FxHashMap, FxHashSet};

use kinesis_config::MaterialLibrary;

use crate::backend::{MaterialHandle, PhysicsBackend};

/// Maps material names to engine materials.
pub struct MaterialTable {
    default: MaterialHandle,
    named: FxHashMap<String, MaterialHandle>,
    reported_unknown: FxHashSet<String>,
}

impl MaterialTable {
    /// Creates one engine material per library entry plus the default one.
    pub fn new<B: PhysicsBackend>(library: &MaterialLibrary, backend: &mut B) -> Self {
        let default = backend.create_material(library.default_material());
        let named = library
            .iter()
            .map(|def| (def.name.clone(), backend.create_material(def)))
            .collect();
        Self {
            default,
            named,
            reported_unknown: FxHashSet::default(),
        }
    }

    /// Resolves a material reference. Empty selects the default material;
    /// an unknown name does too and is reported once.
    pub fn resolve(&mut self, name: &str) -> MaterialHandle {
        if name.is_empty() {
            return self.default;
        }
        if let Some(&handle) = self.named.get(name) {
            return handle;
        }
        if self.reported_unknown.insert(name.to_string()) {
            tracing::warn!(material = name, "unknown material, using default");
        }
        self.default
    }

    pub fn default_material(&self) -> MaterialHandle {
        self.default
    }

    /// Number of named materials.
    pub fn len(&self) -> usize {
        self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty()
    }
}
