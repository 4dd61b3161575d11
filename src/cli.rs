use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_FILE;

/// Incremental JVM compilation through a pool of compiler daemons.
#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// Verbosity:
    /// -v -> Debug
    /// -vv -> Trace
    /// -q -> Warn
    /// -qq -> Error
    /// -qqq -> Off.
    /// Default (/ no argument given): 'info'
    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ProjectArgs {
    /// Project root every relative path is resolved against
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Config file, relative to the root. Defaults apply when it does not exist
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
}

impl ProjectArgs {
    pub fn config_path(&self) -> PathBuf {
        self.root.join(&self.config)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Compile every unit of a build request
    Build {
        /// JSON file listing the library units to compile
        request: PathBuf,

        #[command(flatten)]
        project: ProjectArgs,

        /// Disable output timing
        #[arg(long, default_value_t = false)]
        no_timing: bool,
    },
    /// Print the ABI mode and steps chosen for every unit, without compiling
    Plan {
        request: PathBuf,

        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Print the command line used to start a compiler daemon
    LaunchCommand {
        #[command(flatten)]
        project: ProjectArgs,
    },
}
