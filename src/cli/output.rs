//! Console output for the CLI: colour selection, summaries, and rendered errors.

use std::io::Write;

use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use super::args::ColorMode;
use crate::classes::{ClassPath, ClassSource};
use crate::runner::RunSummary;

pub fn color_choice(mode: ColorMode) -> ColorChoice {
    match mode {
        ColorMode::Always => ColorChoice::Always,
        ColorMode::Never => ColorChoice::Never,
        ColorMode::Auto if atty::is(atty::Stream::Stdout) => ColorChoice::Auto,
        ColorMode::Auto => ColorChoice::Never,
    }
}

pub fn print_summary(summary: &RunSummary, choice: ColorChoice) {
    let mut out = StandardStream::stdout(choice);
    let color = if summary.has_failures() {
        Color::Red
    } else {
        Color::Green
    };
    let _ = writeln!(out);
    let _ = out.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true));
    let _ = write!(
        out,
        "{} passed, {} failed, {} ignored",
        summary.passed, summary.failed, summary.ignored
    );
    let _ = out.reset();
    if summary.class_failures > 0 {
        let _ = write!(out, " ({} class-level failures)", summary.class_failures);
    }
    let _ = writeln!(out, " [{:.1}% success]", summary.success_rate());
}

/// Renders an error through miette's graphical handler on stderr.
pub fn print_error(error: impl miette::Diagnostic + Send + Sync + 'static) {
    eprintln!("{:?}", miette::Report::new(error));
}

/// One line per class, marking substitutes with the class they replace.
pub fn print_classes(classpath: &ClassPath) {
    for name in classpath.names() {
        match classpath.definition(name).and_then(|def| def.substitute) {
            Some(info) => println!("{name}  (substitutes {})", info.replaces),
            None => println!("{name}"),
        }
    }
}
