use anyhow::{Context, Result};
use clap::{Parser, error::ErrorKind};
use log::LevelFilter;
use std::{env, io::Write, path::Path};

use jvmcd::build::{self, BuildContext};
use jvmcd::worker::launcher;
use jvmcd::worker::process::StdioLauncher;
use jvmcd::{cli, config, reporters, telemetry};

fn main() -> Result<()> {
    let raw_args: Vec<String> = env::args().collect();
    let cli = parse_cli(raw_args).unwrap_or_else(|err| err.exit());

    let log_level_filter = cli.verbose.log_level_filter();

    env_logger::Builder::new()
        .format(|buf, record| writeln!(buf, "{}:\n{}", record.level(), record.args()))
        .filter_level(log_level_filter)
        .target(env_logger::fmt::Target::Stdout)
        .init();

    let telemetry_guard = telemetry::init_telemetry();
    if telemetry_guard.tracing_enabled {
        log::debug!("Tracing spans to stderr ({} is set)", telemetry::TRACE_ENV);
    }

    // Progress is only drawn at the default level; -q or -v switch to plain logging.
    let show_progress = log_level_filter == LevelFilter::Info;

    match cli.command {
        cli::Command::Build {
            request,
            project,
            no_timing,
        } => {
            let config = config::read_or_default(&project.config_path())?;
            let request = build::read_request(&request)?;
            match run_build(&project.root, config, request, show_progress, no_timing) {
                Err(e) => {
                    println!("{e:#}");
                    std::process::exit(1)
                }
                Ok(false) => std::process::exit(1),
                Ok(true) => std::process::exit(0),
            }
        }
        cli::Command::Plan { request, project } => {
            let config = config::read_or_default(&project.config_path())?;
            let request = build::read_request(&request)?;
            let mut failed = false;
            for plan in build::plan_units(&request.units, &config) {
                match plan {
                    Ok(plan) => {
                        let pipelines: Vec<String> = plan
                            .pipelines
                            .iter()
                            .map(|p| {
                                let stages: Vec<String> = p.stages.iter().map(|k| k.to_string()).collect();
                                format!("[{}]", stages.join(", "))
                            })
                            .collect();
                        println!(
                            "{}: {} abi ({:?}) {}",
                            plan.unit,
                            plan.abi.effective_mode(),
                            plan.abi.resolution,
                            pipelines.join(" ")
                        );
                    }
                    Err(e) => {
                        failed = true;
                        println!("{e}");
                    }
                }
            }
            std::process::exit(if failed { 1 } else { 0 });
        }
        cli::Command::LaunchCommand { project } => {
            let config = config::read_or_default(&project.config_path())?;
            let argv = launcher::launch_command(&config.java.javacd, &project.root)?;
            println!("{}", argv.join(" "));
            Ok(())
        }
    }
}

/// Returns whether every unit compiled.
fn run_build(
    root: &Path,
    config: config::Config,
    request: build::BuildRequest,
    show_progress: bool,
    no_timing: bool,
) -> Result<bool> {
    let launcher = StdioLauncher::from_config(&config.java.javacd, root)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Could not start the async runtime")?;
    let ctx = BuildContext::new(root.to_path_buf(), config, launcher).context("Invalid configuration")?;

    let cancel = ctx.cancel.clone();
    ctrlc::set_handler(move || cancel.cancel()).context("Error setting Ctrl-C handler")?;

    let reporter = reporters::TerminalReporter::new(request.units.len(), show_progress, no_timing);
    let results = runtime.block_on(build::build_units(&ctx, &request.units, &reporter));
    let killed = runtime.block_on(async { ctx.pool.shutdown() });
    log::debug!(
        "Stopped {killed} compiler daemons ({} started, {} evicted)",
        ctx.pool.spawned(),
        ctx.pool.evicted()
    );

    let mut success = true;
    for result in results {
        match result {
            Ok(outcome) => log::info!(
                "{}: {} steps ({} abi)",
                outcome.unit,
                outcome.steps.len(),
                outcome.mode
            ),
            Err(e) => {
                success = false;
                println!("{e}");
            }
        }
    }
    Ok(success)
}

/// `jvmcd units.json` is shorthand for `jvmcd build units.json`: when clap
/// rejects the arguments, `build` is tried in front of the first `.json` file.
fn parse_cli(raw_args: Vec<String>) -> Result<cli::Cli, clap::Error> {
    let err = match cli::Cli::try_parse_from(&raw_args) {
        Ok(cli) => return Ok(cli),
        Err(err) => err,
    };
    if !matches!(err.kind(), ErrorKind::UnknownArgument | ErrorKind::InvalidSubcommand) {
        return Err(err);
    }
    let Some(request_at) = raw_args.iter().skip(1).position(|arg| arg.ends_with(".json")) else {
        return Err(err);
    };

    let mut with_build = raw_args;
    with_build.insert(request_at + 1, "build".into());
    cli::Cli::try_parse_from(&with_build).map_err(|_| err)
}
