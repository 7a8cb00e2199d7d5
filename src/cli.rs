use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use keel_api::primitives::bytes::ByteCount;

use crate::KEEL_VERSION;

#[derive(Parser, Debug)]
#[clap(version = KEEL_VERSION, about = "Storage planning agent: probes block \
devices and turns guided or unattended intents into a partitioning plan")]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one hardware probe pass and print the raw payload
    Probe {
        /// Run the privileged (block-device-only) pass instead of the safe one
        #[clap(long)]
        privileged: bool,
    },

    /// Probe the hardware and list feasible guided scenarios
    Scenarios {
        /// Install payload size (e.g. 6G); drives the install minimum
        #[clap(long, default_value = "6G")]
        source_size: ByteCount,
    },

    /// Apply an unattended storage document and print the resulting plan
    Plan {
        /// Document carrying a `storage:` section (or the section itself)
        #[clap(index = 1)]
        config: PathBuf,

        /// Write the rendered action list here instead of stdout
        #[clap(short, long)]
        output: Option<PathBuf>,

        /// Install payload size (e.g. 6G); drives the install minimum
        #[clap(long, default_value = "6G")]
        source_size: ByteCount,
    },

    /// Validate an unattended storage document without touching hardware
    Validate {
        #[clap(index = 1)]
        config: PathBuf,
    },

    /// Keep the storage model in sync with device-topology changes
    Watch {
        /// Directory for probe diagnostics artifacts
        #[clap(long)]
        report_dir: Option<PathBuf>,
    },
}
