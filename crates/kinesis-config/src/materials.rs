//! Named surface materials loaded from a RON list.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A surface material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaterialDef {
    /// Unique, non-empty name referenced by colliders.
    pub name: String,
    /// Friction coefficient at rest, `>= 0`.
    pub static_friction: f32,
    /// Friction coefficient while sliding, `>= 0`.
    pub dynamic_friction: f32,
    /// Bounciness in `[0, 1]`.
    pub restitution: f32,
}

impl Default for MaterialDef {
    fn default() -> Self {
        Self {
            name: String::new(),
            static_friction: 0.5,
            dynamic_friction: 0.5,
            restitution: 0.1,
        }
    }
}

impl MaterialDef {
    /// Creates a named material.
    pub fn new(name: impl Into<String>, static_friction: f32, dynamic_friction: f32, restitution: f32) -> Self {
        Self {
            name: name.into(),
            static_friction,
            dynamic_friction,
            restitution,
        }
    }

    /// Clamps out-of-range values, logging a warning for each one.
    fn clamped(mut self) -> Self {
        if self.static_friction < 0.0 {
            log::warn!(
                "Material '{}': static friction {} clamped to 0",
                self.name,
                self.static_friction
            );
            self.static_friction = 0.0;
        }
        if self.dynamic_friction < 0.0 {
            log::warn!(
                "Material '{}': dynamic friction {} clamped to 0",
                self.name,
                self.dynamic_friction
            );
            self.dynamic_friction = 0.0;
        }
        if !(0.0..=1.0).contains(&self.restitution) {
            let clamped = self.restitution.clamp(0.0, 1.0);
            log::warn!(
                "Material '{}': restitution {} clamped to {}",
                self.name,
                self.restitution,
                clamped
            );
            self.restitution = clamped;
        }
        self
    }
}

/// Validated set of named materials plus the default material.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MaterialLibrary {
    default: MaterialDef,
    materials: Vec<MaterialDef>,
}

impl MaterialLibrary {
    /// Builds a library from raw definitions.
    ///
    /// Entries with an empty name are skipped, duplicates keep the first
    /// definition, out-of-range values are clamped. Each case is logged.
    pub fn from_defs(defs: impl IntoIterator<Item = MaterialDef>) -> Self {
        let mut materials: Vec<MaterialDef> = Vec::new();
        for def in defs {
            if def.name.is_empty() {
                log::error!("Material definition without a name skipped");
                continue;
            }
            if materials.iter().any(|m| m.name == def.name) {
                log::error!("Duplicate material '{}' ignored", def.name);
                continue;
            }
            materials.push(def.clamped());
        }
        Self {
            default: MaterialDef::default(),
            materials,
        }
    }

    /// Loads a library from a RON file holding a list of [`MaterialDef`]s.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::read(path))?;
        let defs: Vec<MaterialDef> = ron::from_str(&contents).map_err(ConfigError::parse(path))?;
        let library = Self::from_defs(defs);
        log::info!(
            "Loaded {} materials from {}",
            library.materials.len(),
            path.display()
        );
        Ok(library)
    }

    /// Loads the library, or writes [`MaterialLibrary::starter`] when the
    /// file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }
        let library = Self::starter();
        library.save(path)?;
        log::info!("Created default material library at {}", path.display());
        Ok(library)
    }

    /// Writes the named materials as a RON list.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::write(parent))?;
        }
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(&self.materials, pretty)
            .map_err(ConfigError::serialize(path))?;
        std::fs::write(path, serialized).map_err(ConfigError::write(path))
    }

    /// A small set of common surfaces.
    pub fn starter() -> Self {
        Self::from_defs([
            MaterialDef::new("concrete", 0.9, 0.7, 0.05),
            MaterialDef::new("rubber", 1.0, 0.8, 0.6),
            MaterialDef::new("ice", 0.05, 0.03, 0.05),
            MaterialDef::new("tire", 1.2, 1.0, 0.1),
        ])
    }

    /// Material used for empty or unknown references.
    pub fn default_material(&self) -> &MaterialDef {
        &self.default
    }

    /// Named material lookup.
    pub fn get(&self, name: &str) -> Option<&MaterialDef> {
        self.materials.iter().find(|m| m.name == name)
    }

    /// Named materials in file order.
    pub fn iter(&self) -> impl Iterator<Item = &MaterialDef> {
        self.materials.iter()
    }

    /// Number of named materials.
    pub fn len(&self) -> usize {
        self.materials.len()
    }

    /// Returns `true` if no named material is defined.
    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_material_values() {
        let library = MaterialLibrary::default();
        let def = library.default_material();
        assert_eq!(def.static_friction, 0.5);
        assert_eq!(def.dynamic_friction, 0.5);
        assert_eq!(def.restitution, 0.1);
    }

    #[test]
    fn test_empty_and_duplicate_names_skipped() {
        let library = MaterialLibrary::from_defs([
            MaterialDef::new("", 1.0, 1.0, 0.0),
            MaterialDef::new("steel", 0.6, 0.4, 0.2),
            MaterialDef::new("steel", 0.1, 0.1, 0.9),
        ]);
        assert_eq!(library.len(), 1);
        let steel = library.get("steel").unwrap();
        assert_eq!(steel.restitution, 0.2, "first definition wins");
    }

    #[test]
    fn test_out_of_range_values_clamped() {
        let library = MaterialLibrary::from_defs([
            MaterialDef::new("odd", -1.0, -0.5, 1.5),
            MaterialDef::new("dead", 0.3, 0.3, -0.2),
        ]);
        let odd = library.get("odd").unwrap();
        assert_eq!(odd.static_friction, 0.0);
        assert_eq!(odd.dynamic_friction, 0.0);
        assert_eq!(odd.restitution, 1.0);
        assert_eq!(library.get("dead").unwrap().restitution, 0.0);
    }

    #[test]
    fn test_partial_entry_uses_defaults() {
        let defs: Vec<MaterialDef> = ron::from_str("[(name: \"mud\", restitution: 0.0)]").unwrap();
        let library = MaterialLibrary::from_defs(defs);
        let mud = library.get("mud").unwrap();
        assert_eq!(mud.static_friction, 0.5);
        assert_eq!(mud.restitution, 0.0);
    }

    #[test]
    fn test_load_or_create_round_trips_starter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("materials.ron");

        let created = MaterialLibrary::load_or_create(&path).unwrap();
        assert!(path.exists());
        let loaded = MaterialLibrary::load(&path).unwrap();
        assert_eq!(created, loaded);
        assert!(loaded.get("ice").is_some());
    }

    #[test]
    fn test_malformed_library_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("materials.ron");
        std::fs::write(&path, "[(name: \"ice\", static_friction: oops)]").unwrap();

        let err = MaterialLibrary::load_or_create(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert_eq!(err.path(), path.as_path());
        assert!(err.to_string().starts_with("invalid RON in"), "{err}");
        assert!(err.to_string().contains("materials.ron"), "{err}");
    }
}
