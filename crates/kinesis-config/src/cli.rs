//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Command-line arguments of the kinesis demo.
///
/// CLI values override settings loaded from `physics.ron`.
#[derive(Parser, Debug)]
#[command(name = "kinesis", about = "Kinesis physics scene runner")]
pub struct CliArgs {
    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Vertical gravity component in m/s² (negative pulls down).
    #[arg(long, allow_hyphen_values = true)]
    pub gravity_z: Option<f32>,

    /// Number of frames to run.
    #[arg(long)]
    pub frames: Option<u32>,

    /// Start with the simulation disabled.
    #[arg(long)]
    pub no_simulation: bool,

    /// Fill the debug line buffer each frame.
    #[arg(long)]
    pub debug_draw: bool,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if let Some(z) = args.gravity_z {
            self.physics.gravity[2] = z;
        }
        if args.no_simulation {
            self.physics.simulation_enabled = false;
        }
        if args.debug_draw {
            self.physics.debug_draw = true;
        }
    }
}
