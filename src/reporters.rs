//! Terminal rendering of build progress.
//!
//! Every event is also emitted as a tracing event, so a subscriber installed by
//! [`crate::telemetry`] sees the same timings the user does.

use chrono::Local;
use console::{Emoji, Term, style};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::build::{BuildProgress, BuildReporter};

pub static LINE_CLEAR: &str = "\x1b[2K\r";
pub static SPARKLES: Emoji<'_, '_> = Emoji("✨ ", "");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "");
pub static HAMMER: Emoji<'_, '_> = Emoji("🔨 ", "");

fn is_tty() -> bool {
    Term::stdout().is_term() && Term::stderr().is_term()
}

fn timing(duration_seconds: f64, no_timing: bool) -> String {
    if no_timing {
        String::new()
    } else {
        format!(" in {:.2}s", duration_seconds)
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Reporter used by the command line: a unit progress bar on a terminal, plain
/// lines otherwise.
pub struct TerminalReporter {
    bar: ProgressBar,
    plain_output: bool,
    no_timing: bool,
}

impl TerminalReporter {
    pub fn new(unit_count: usize, show_progress: bool, no_timing: bool) -> Self {
        let plain_output = !is_tty();
        let bar = if show_progress && !plain_output {
            let bar = ProgressBar::with_draw_target(Some(unit_count as u64), ProgressDrawTarget::stderr());
            bar.set_style(
                ProgressStyle::with_template("{prefix} {spinner} [{pos}/{len}] {wide_msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.set_prefix(format!("{}", style("[jvmcd]").bold().dim()));
            bar
        } else {
            ProgressBar::hidden()
        };
        TerminalReporter {
            bar,
            plain_output,
            no_timing,
        }
    }

    fn warn(&self, message: &str) {
        if self.plain_output {
            self.bar.suspend(|| eprintln!("{message}"));
        } else {
            self.bar.suspend(|| eprintln!("{}", style(message).yellow()));
        }
    }
}

impl BuildReporter for TerminalReporter {
    fn report(&self, progress: BuildProgress) {
        emit_tracing_event(&progress);

        match progress {
            BuildProgress::Planned { unit, mode, stages, .. } => {
                log::debug!("[{}] planned {unit} ({mode} abi, {stages} stages)", timestamp());
            }
            BuildProgress::StageStarted { unit, step, .. } => {
                self.bar.set_message(format!("{HAMMER}{unit} {step}"));
            }
            BuildProgress::StageFinished { .. } => {}
            BuildProgress::CompilerOutput { stderr, .. } => {
                if self.plain_output {
                    self.bar.suspend(|| eprintln!("{stderr}"));
                } else {
                    self.bar.suspend(|| eprintln!("{}", style(&stderr).red()));
                }
            }
            BuildProgress::UsedInputs { unit, used, declared } => {
                log::debug!("{unit} used {used} of {declared} declared dependencies");
            }
            BuildProgress::UnusedDependency { unit, dependency } => {
                self.warn(&format!("{unit} declares {dependency} but never uses it"));
            }
            BuildProgress::AbiMismatch { unit } => {
                self.warn(&format!("The source ABI of {unit} does not match its class ABI"));
            }
            BuildProgress::UnitFinished { .. } => self.bar.inc(1),
            BuildProgress::Finished {
                compiled_count,
                failed_count,
                duration_seconds,
            } => {
                self.bar.finish_and_clear();
                let timing = timing(duration_seconds, self.no_timing);
                if failed_count == 0 {
                    if self.plain_output {
                        println!("Compiled {compiled_count} units{timing}");
                    } else {
                        println!("{LINE_CLEAR}{SPARKLES}Compiled {compiled_count} units{timing}");
                    }
                } else if self.plain_output {
                    eprintln!("Failed to compile {failed_count} of {} units{timing}", compiled_count + failed_count);
                } else {
                    eprintln!(
                        "{LINE_CLEAR}{CROSS}Failed to compile {} of {} units{timing}",
                        style(failed_count).red(),
                        compiled_count + failed_count
                    );
                }
            }
        }
    }
}

fn emit_tracing_event(progress: &BuildProgress) {
    match progress {
        BuildProgress::Planned {
            unit,
            mode,
            resolution,
            stages,
        } => {
            tracing::info!(unit = %unit, mode = %mode, resolution = ?resolution, stages, "build.planned");
        }
        BuildProgress::StageStarted {
            unit,
            step,
            worker,
            first_stage,
        } => {
            tracing::debug!(unit = %unit, step = %step, worker = %worker, first_stage, "build.stage_started");
        }
        BuildProgress::StageFinished {
            unit,
            step,
            exit_code,
            duration_seconds,
        } => {
            tracing::info!(
                unit = %unit,
                step = %step,
                exit_code,
                duration_seconds,
                "build.stage_finished"
            );
        }
        BuildProgress::UnitFinished {
            unit,
            success,
            duration_seconds,
        } => {
            tracing::info!(unit = %unit, success, duration_seconds, "build.unit_finished");
        }
        BuildProgress::Finished {
            compiled_count,
            failed_count,
            duration_seconds,
        } => {
            tracing::info!(compiled_count, failed_count, duration_seconds, "build.finished");
        }
        BuildProgress::CompilerOutput { .. }
        | BuildProgress::UsedInputs { .. }
        | BuildProgress::UnusedDependency { .. }
        | BuildProgress::AbiMismatch { .. } => {}
    }
}
