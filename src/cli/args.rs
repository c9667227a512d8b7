//! Command-line argument definitions
//!
//! This module defines all CLI arguments and subcommands using clap.

use crate::device::monitor::MonitorSource;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// List and watch mice and touchpads, one report per physical device
#[derive(Parser, Debug)]
#[command(name = "mouse-watch")]
#[command(author = "Vihaan Reddy M")]
#[command(version)]
#[command(about = "List and watch mice and touchpads through the udev device registry", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace (overrides config)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Use the device tree and event script of a scenario fixture file
    /// instead of the system registry
    #[arg(long, global = true, value_name = "FILE", conflicts_with = "scenario")]
    pub fixture: Option<PathBuf>,

    /// Use a built-in scenario instead of the system registry
    #[arg(long, global = true, value_name = "NAME")]
    pub scenario: Option<String>,

    /// Print one JSON object per line
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List connected mice (the default command)
    List {
        /// Print every matching node instead of classified mice
        #[arg(long)]
        raw: bool,
    },

    /// Watch mice being plugged in and out until Ctrl+C
    Monitor {
        /// Print every event instead of classified mouse events
        #[arg(long)]
        raw: bool,

        /// Event source (overrides config)
        #[arg(long, value_enum)]
        source: Option<MonitorSource>,
    },

    /// List the built-in scenarios, or run them with --run
    Scenarios {
        /// Only scenarios with this tag
        #[arg(short, long)]
        tag: Option<String>,

        /// Run the scenarios and check their expected results
        #[arg(long)]
        run: bool,

        /// Print a scenario as a TOML fixture
        #[arg(long, value_name = "NAME", conflicts_with = "run")]
        export: Option<String>,
    },

    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Show the path of the configuration file in use
    Path,

    /// Write a commented default configuration file
    Generate {
        /// Output path (defaults to the standard location)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
