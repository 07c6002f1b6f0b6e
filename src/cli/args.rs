//! Command-line arguments for the `shadowbox` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "shadowbox",
    version,
    about = "Runs declarative test suites inside isolated, reconfigurable sandboxes."
)]
pub struct ShadowboxArgs {
    /// Log output format. The level is taken from RUST_LOG.
    #[arg(long, value_enum, default_value_t = LogFormat::Compact, global = true)]
    pub log_format: LogFormat,

    #[arg(long, value_enum, default_value_t = ColorMode::Auto, global = true)]
    pub color: ColorMode,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run suite files, or every suite under the given directories.
    Run {
        #[arg(required = true)]
        suites: Vec<PathBuf>,

        /// Directory of `*.class.json` definitions. Substitute classes found here are
        /// registered as substitute providers.
        #[arg(long)]
        classpath: PathBuf,

        /// YAML file with runner options.
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        platform_level: Option<u32>,

        #[arg(long)]
        max_sandboxes: Option<usize>,

        /// Append one JSON line of timings per test to this file.
        #[arg(long)]
        perf_stats: Option<PathBuf>,

        /// Print a line when each test starts.
        #[arg(short, long)]
        verbose: bool,
    },
    /// List the classes on a classpath and the substitutes among them.
    Classes {
        #[arg(long)]
        classpath: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}
