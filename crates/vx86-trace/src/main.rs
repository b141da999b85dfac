#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vx86_trace::{driver, Engine, Report, Scenario, Stop};

#[derive(Debug, Parser)]
#[command(about = "Runs a decoded-operation scenario through the vx86 interpreter or translator")]
struct Args {
    /// Scenario JSON file.
    scenario: PathBuf,

    #[arg(long, value_enum, default_value_t = Engine::Interp)]
    engine: Engine,

    /// Log filter (overrides `RUST_LOG`), e.g. `vx86_jit=debug`.
    #[arg(long)]
    log: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directives) => EnvFilter::try_new(directives).context("invalid --log filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let scenario = Scenario::load(&args.scenario)?;
    let (mut cpu, mut thread) = scenario.build()?;
    let summary = driver::run(&scenario, args.engine, &mut cpu, &mut thread)?;

    let report = Report::new(&summary, &mut cpu, &thread);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Stop::Fatal(exit) = summary.stop {
        return Err(anyhow::Error::new(exit).context("guest process terminated"));
    }
    Ok(())
}
