//! The Shadowbox command-line interface.
//!
//! `shadowbox run` loads a classpath directory, registers the substitutes found on it, and runs
//! every suite it is pointed at. `shadowbox classes` lists what a classpath contains.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Parser;
use termcolor::ColorChoice;

use crate::classes::{ClassPath, ClassSource};
use crate::registry::{ClasspathProvider, SubstituteProviders};
use crate::runner::{ConsoleNotifier, RunSummary, RunnerOptions, SandboxTestRunner};
use crate::suite::{discover_suite_files, load_suite};

pub mod args;
pub mod output;

use args::{Command, LogFormat, ShadowboxArgs};

/// Parses the process arguments, runs the command, and exits non-zero on any failure.
pub fn run() {
    let args = ShadowboxArgs::parse();
    setup_logging(args.log_format);
    let choice = output::color_choice(args.color);

    let ok = match args.command {
        Command::Run {
            suites,
            classpath,
            config,
            platform_level,
            max_sandboxes,
            perf_stats,
            verbose,
        } => {
            let overrides = CliOverrides {
                config,
                platform_level,
                max_sandboxes,
                perf_stats,
            };
            match handle_run(&suites, &classpath, overrides, verbose, choice) {
                Ok(summary) => !summary.has_failures(),
                Err(report) => {
                    eprintln!("{report:?}");
                    false
                }
            }
        }
        Command::Classes { classpath } => match ClassPath::from_dir(&classpath) {
            Ok(classpath) => {
                output::print_classes(&classpath);
                true
            }
            Err(fault) => {
                output::print_error(fault);
                false
            }
        },
    };

    if !ok {
        process::exit(1);
    }
}

fn setup_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    let _ = match format {
        LogFormat::Json => subscriber.json().try_init(),
        LogFormat::Compact => subscriber.compact().try_init(),
        LogFormat::Pretty => subscriber.pretty().try_init(),
    };
}

struct CliOverrides {
    config: Option<PathBuf>,
    platform_level: Option<u32>,
    max_sandboxes: Option<usize>,
    perf_stats: Option<PathBuf>,
}

/// Options file, then environment, then command-line flags.
fn resolve_options(overrides: CliOverrides) -> miette::Result<RunnerOptions> {
    let options = match &overrides.config {
        Some(path) => RunnerOptions::from_file(path)?,
        None => RunnerOptions::default(),
    };
    let mut options = options.with_env_overrides()?;
    if let Some(level) = overrides.platform_level {
        options.platform_level = level;
    }
    if let Some(max) = overrides.max_sandboxes {
        options.max_sandboxes = max;
    }
    if overrides.perf_stats.is_some() {
        options.perf_stats = overrides.perf_stats;
    }
    Ok(options)
}

fn suite_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .flat_map(|path| {
            if path.is_dir() {
                discover_suite_files(path)
            } else {
                vec![path.clone()]
            }
        })
        .collect()
}

fn handle_run(
    suites: &[PathBuf],
    classpath_dir: &Path,
    overrides: CliOverrides,
    verbose: bool,
    choice: ColorChoice,
) -> miette::Result<RunSummary> {
    let options = resolve_options(overrides)?;
    let classpath = ClassPath::from_dir(classpath_dir)?;
    let providers = Arc::new(
        SubstituteProviders::new().with(Arc::new(ClasspathProvider::new("classpath", &classpath))),
    );
    let classpath: Arc<dyn ClassSource> = Arc::new(classpath);
    let notifier = Arc::new(ConsoleNotifier::new(choice, verbose));

    let mut total = RunSummary::default();
    for path in suite_files(suites) {
        tracing::info!(suite = %path.display(), "running suite");
        let suite = match load_suite(&path) {
            Ok(suite) => suite,
            Err(error) => {
                output::print_error(error);
                total.class_failures += 1;
                continue;
            }
        };
        let runner = SandboxTestRunner::builder(suite.to_test_class(), Arc::clone(&classpath))
            .options(options.clone())
            .providers(Arc::clone(&providers))
            .build()?;
        total.merge(runner.run(notifier.clone()));
    }

    output::print_summary(&total, choice);
    Ok(total)
}
