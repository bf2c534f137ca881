//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Load definitions and report configuration errors
    Validate {
        /// Definition file or directory of YAML/JSON files
        #[arg(default_value = "girder.yaml")]
        path: PathBuf,
    },

    /// Print the build type dependency graph in topological order
    Graph {
        /// Definition file or directory
        #[arg(default_value = "girder.yaml")]
        path: PathBuf,
    },

    /// Print the effective configuration of a build type
    Effective {
        /// Build type id
        build_type: String,

        /// Definition file or directory
        #[arg(short, long, default_value = "girder.yaml")]
        path: PathBuf,
    },

    /// Print the JSON schema of the definition format
    Schema,

    /// Replay a scripted sequence of events against a dry-run executor
    Simulate {
        /// Simulation script
        script: PathBuf,

        /// Definition file or directory
        #[arg(short, long, default_value = "girder.yaml")]
        path: PathBuf,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}
