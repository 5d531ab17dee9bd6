//! Configuration for the kinesis physics layer.
//!
//! Settings persist to disk as RON files: `physics.ron` for the simulation
//! and debug settings, and a material library (by default `materials.ron`)
//! listing named surface materials. CLI arguments override loaded values.

mod cli;
mod config;
mod error;
mod materials;

pub use cli::CliArgs;
pub use config::{CONFIG_FILE, Config, DebugConfig, PhysicsConfig};
pub use error::ConfigError;
pub use materials::{MaterialDef, MaterialLibrary};
