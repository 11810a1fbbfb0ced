use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tgs_engine_backend::EngineVersion;

/// Manage installed game server engine versions.
#[derive(Parser, Debug)]
#[command(name = "tgs-engine")]
#[command(author, version, about = "Install, switch and lease game server engine versions")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Path to the settings file
    #[arg(long, global = true, env = "TGS_ENGINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level regardless of settings
    #[arg(short, long, global = true, env = "TGS_ENGINE_VERBOSE")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List installed engine versions
    List,

    /// Print the active engine version
    Active,

    /// Install a version if needed and make it active
    Change {
        /// Version to activate, e.g. 515.1633 or opendream-0.2
        #[arg(id = "engine_version", value_name = "VERSION")]
        version: EngineVersion,

        /// Install from a local zip instead of downloading
        #[arg(long, value_name = "ZIP")]
        custom: Option<PathBuf>,

        /// Fail instead of installing a missing version
        #[arg(long, conflicts_with = "custom")]
        no_install: bool,
    },

    /// Delete an installed version
    Delete {
        /// Version key to delete
        #[arg(id = "engine_version", value_name = "VERSION")]
        version: EngineVersion,
    },

    /// Resolve the executables of a version
    Use {
        /// Version to use; defaults to the active version
        #[arg(id = "engine_version", value_name = "VERSION")]
        version: Option<EngineVersion>,

        /// Add a content path to the engine's trusted list
        #[arg(long, value_name = "PATH")]
        trust: Option<PathBuf>,
    },
}
