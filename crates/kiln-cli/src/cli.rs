//! CLI command definitions using clap

use crate::output::OutputFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Kiln CLI - Load and run WebAssembly compute modules
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(short = 'o', long, global = true)]
    pub output: Option<OutputFormat>,

    /// Configuration file path
    #[arg(short = 'c', long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Load one or more modules
    Load {
        /// Module ids
        #[arg(required = true)]
        modules: Vec<String>,
    },

    /// Invoke a module function and print its result
    Invoke {
        /// Function name
        function: String,

        /// Text arguments, passed in order
        args: Vec<String>,

        /// Module to call; defaults to the module declaring the function
        #[arg(short, long)]
        module: Option<String>,
    },

    /// Show execution mode, module states and worker status
    Status {
        /// Load these modules before reporting
        #[arg(short, long)]
        load: Vec<String>,
    },

    /// Module cache management
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

/// Cache subcommands
#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show cache statistics
    Stats,

    /// List cached entries
    List,

    /// Delete every cached module
    Clear,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Validate the configuration file
    Validate,
}
