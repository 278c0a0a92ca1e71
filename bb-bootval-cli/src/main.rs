mod cli;

use std::{fs::OpenOptions, process::ExitCode};

use anyhow::Context;
use bb_bootval::{Layout, LinuxProbe, Outcome, Sequence, StateStore, SystemRunner, Verdict};
use clap::Parser;
use cli::{Commands, Opt};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    let opt = Opt::parse();
    let layout = Layout::new(&opt.root, &opt.data_dir);

    match opt.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&opt, &layout),
        Commands::Status => status(&layout),
        Commands::Abort => abort(&opt, &layout),
    }
    .unwrap_or_else(|e| {
        tracing::error!("Exiting without changes: {e:#}");
        eprintln!("Error: {e:#}");
        ExitCode::FAILURE
    })
}

fn init_logging(opt: &Opt, layout: &Layout) -> anyhow::Result<()> {
    let log_file_p = opt.log_file.clone().unwrap_or_else(|| layout.log_file());
    if let Some(dir) = log_file_p.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {dir:?}"))?;
    }
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file_p)
        .with_context(|| format!("Failed to open log file {log_file_p:?}"))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::DEBUG.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(log_file),
        )
        .try_init()
        .context("Failed to register tracing_subscriber")?;

    tracing::info!("Logging to file at: {:?}", log_file_p);
    Ok(())
}

fn run(opt: &Opt, layout: &Layout) -> anyhow::Result<ExitCode> {
    init_logging(opt, layout)?;
    tracing::info!("Mender bootloader validation started");

    let outcome = Sequence::new(layout, &SystemRunner, &LinuxProbe)
        .service(&opt.service)
        .run()?;

    Ok(match outcome {
        Outcome::Rebooting { .. } | Outcome::Finished(Verdict::Success) => ExitCode::SUCCESS,
        Outcome::Finished(Verdict::Failure(_)) => ExitCode::FAILURE,
    })
}

fn status(layout: &Layout) -> anyhow::Result<ExitCode> {
    let path = layout.state_file();
    if !path.exists() {
        println!("not running");
        return Ok(ExitCode::SUCCESS);
    }

    let store = StateStore::open(&path)?;
    let state = store.state();
    let step = state.step.map_or("uninitialized", |x| x.as_str());

    println!("step:          {step}");
    println!("expected root: {}", state.expected_root.map_or("-".to_string(), |x| x.to_string()));
    println!("prepared:      {}", state.prepared_boot.is_some());
    println!("rootfs A:      {:?} ({:?})", state.rootfs_a, state.partition_a);
    println!("rootfs B:      {:?} ({:?})", state.rootfs_b, state.partition_b);
    println!(
        "environment:   {} / {}",
        state.set_cmd.as_deref().unwrap_or("-"),
        state.print_cmd.as_deref().unwrap_or("-")
    );

    Ok(ExitCode::SUCCESS)
}

fn abort(opt: &Opt, layout: &Layout) -> anyhow::Result<ExitCode> {
    init_logging(opt, layout)?;

    Sequence::new(layout, &SystemRunner, &LinuxProbe)
        .service(&opt.service)
        .abort()?;

    println!("validation aborted");
    Ok(ExitCode::SUCCESS)
}
