use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::info;
use magfusion::simulation::{figure_eight_scenario, wobble_scenario};
use magfusion::{CalibrationSnapshot, Pipeline, PipelineConfig, RefinementMode};

mod replay;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// Rest, figure eight, rest, then a finger magnet
    FigureEight,
    /// Rest and a small wobble that cannot calibrate
    Wobble,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Inline,
    Background,
}

#[derive(Parser, Debug)]
#[command(name = "sitl")]
#[command(about = "Replay a simulated wrist IMU trace through the magfusion pipeline", long_about = None)]
struct Args {
    /// Simulation RNG seed
    #[arg(long, default_value_t = 7)]
    seed: u64,

    #[arg(long, value_enum, default_value_t = Scenario::FigureEight)]
    scenario: Scenario,

    /// Where Levenberg-Marquardt refinement runs
    #[arg(long, value_enum, default_value_t = Mode::Inline)]
    mode: Mode,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seed the bootstrap from a previously exported calibration
    #[arg(long, value_name = "FILE")]
    import: Option<PathBuf>,

    /// Write the final calibration as JSON
    #[arg(long, value_name = "FILE")]
    export: Option<PathBuf>,

    /// Write one JSON line per sample
    #[arg(long, value_name = "FILE")]
    trace: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let simulation = match args.scenario {
        Scenario::FigureEight => figure_eight_scenario(args.seed),
        Scenario::Wobble => wobble_scenario(args.seed),
    };
    let mut config = PipelineConfig::with_sample_rate(simulation.sample_rate_hz);
    config.calibration.mode = match args.mode {
        Mode::Inline => RefinementMode::Inline,
        Mode::Background => RefinementMode::Background,
    };

    let pipeline = match &args.import {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let seed = CalibrationSnapshot::from_json(&json)?;
            info!("Bootstrap seeded from {}", path.display());
            Pipeline::with_calibration_seed(config, simulation.reference, &seed)?
        }
        None => Pipeline::new(config, simulation.reference)?,
    };

    info!(
        "Replaying {:?} scenario, seed {}, {} samples",
        args.scenario,
        args.seed,
        simulation.total_samples()
    );
    let mut replay = replay::Replay::new(pipeline, simulation);

    let summary = match &args.trace {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            let summary = replay.run(Some(&mut writer))?;
            writer.flush()?;
            summary
        }
        None => replay.run(None)?,
    };
    info!("Summary: {}", serde_json::to_string_pretty(&summary)?);

    let state = replay.pipeline().calibration_state();
    info!(
        "Calibration {:?}: hard iron [{:.2}, {:.2}, {:.2}] uT, confidence {:.2}",
        state.phase, state.hard_iron_ut.x, state.hard_iron_ut.y, state.hard_iron_ut.z,
        state.confidence
    );
    if let Some(failure) = &state.last_failure {
        info!("Last refinement failure: {}", failure);
    }

    if let Some(path) = &args.export {
        let json = replay.pipeline().export_calibration().to_json()?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Calibration written to {}", path.display());
    }
    Ok(())
}
