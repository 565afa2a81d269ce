#![forbid(unsafe_code)]

use circuit_batch::{presets, Batch, BatchError, BatchSpec, ParamGrid, RunnerConfig, SubmitOutcome};
use circuit_cells::CellDistribution;
use circuit_cfg::{apply_overrides, CfgError, Override, SimConfig};
use engine::{run_pipeline, EngineError, ProcessBackend};
use log::info;
use thiserror::Error;

const USAGE: &str = "\
usage:
  s1thal run [--cfg FILE] [--cells FILE] [--label LABEL] [KEY=VALUE ...]
  s1thal batch --preset <custom|inhib> [--label LABEL] [--runner <bulletin|direct|slurm>] [--dry-run]
";

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error(transparent)]
    Cells(#[from] circuit_cells::CellsError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("unknown argument {0:?}")]
    UnknownArgument(String),
    #[error("missing value for {0}")]
    MissingValue(&'static str),
    #[error("unknown preset {0:?}, expected custom or inhib")]
    UnknownPreset(String),
    #[error("unknown runner {0:?}, expected bulletin, direct or slurm")]
    UnknownRunner(String),
}

fn main() {
    env_logger::init();
    if let Err(error) = run() {
        eprintln!("error: {error}");
        let mut source = std::error::Error::source(&error);
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        std::process::exit(1);
    }
}

fn run() -> Result<(), AppError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => run_simulation(&args[args.len().min(1)..]),
        Some("batch") => run_batch(&args[1..]),
        Some("--help") | Some("-h") | Some("help") => {
            print!("{USAGE}");
            Ok(())
        }
        Some(other) => Err(AppError::UnknownArgument(other.to_string())),
    }
}

fn run_simulation(args: &[String]) -> Result<(), AppError> {
    let mut cfg_file = None;
    let mut cells_file = None;
    let mut label = None;
    let mut overrides = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--cfg" => cfg_file = Some(next_value(&mut iter, "--cfg")?),
            "--cells" => cells_file = Some(next_value(&mut iter, "--cells")?),
            "--label" => label = Some(next_value(&mut iter, "--label")?),
            other if other.contains('=') => overrides.push(Override::parse(other)?),
            other => return Err(AppError::UnknownArgument(other.to_string())),
        }
    }

    let base = match cfg_file {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };
    let mut cfg = apply_overrides(&base, &overrides)?;
    if let Some(label) = label {
        cfg.run.sim_label = label;
    }
    if let Some(path) = cells_file {
        cfg.cells.distribution_file = path.into();
    }

    let dist = CellDistribution::load(&cfg.cells.distribution_file)?;
    info!(
        "loaded {} me-types across {} populations from {}",
        dist.me_types.len(),
        dist.pops.len(),
        cfg.cells.distribution_file.display()
    );

    let run_dir = cfg.save_folder().join(format!("{}_run", cfg.run.sim_label));
    let mut backend = ProcessBackend::new(run_dir, cfg.solver.clone());
    let report = run_pipeline(&cfg, &dist, &mut backend)?;

    println!(
        "{}: {} cells, {} spikes, run digest {}",
        report.label, report.total_cells, report.spike_count, report.run_digest
    );
    for rate in &report.pop_rates {
        println!("  {}: {:.2} Hz over {} cells", rate.me_label, rate.rate_hz, rate.cells);
    }
    for output in &report.outputs {
        println!("  wrote {}", output.display());
    }
    Ok(())
}

fn run_batch(args: &[String]) -> Result<(), AppError> {
    let mut preset = "custom".to_string();
    let mut runner = "bulletin".to_string();
    let mut label = "v8_batch2".to_string();
    let mut cfg_file = None;
    let mut dry_run = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--preset" => preset = next_value(&mut iter, "--preset")?,
            "--runner" => runner = next_value(&mut iter, "--runner")?,
            "--label" => label = next_value(&mut iter, "--label")?,
            "--cfg" => cfg_file = Some(next_value(&mut iter, "--cfg")?),
            "--dry-run" => dry_run = true,
            other => return Err(AppError::UnknownArgument(other.to_string())),
        }
    }

    let grid: ParamGrid = match preset.as_str() {
        "custom" => presets::seed_sweep(),
        "inhib" => presets::inhibition_sweep(),
        other => return Err(AppError::UnknownPreset(other.to_string())),
    };
    let base_cfg = match cfg_file {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };
    let spec = BatchSpec::new(label.clone(), grid, runner_config(&runner, &label)?);

    let batch = Batch::new(spec, base_cfg);
    let jobs = batch.prepare()?;
    info!("prepared {} jobs for batch {label}", jobs.len());
    batch.write(&jobs)?;
    let outcomes = batch.submit(&jobs, dry_run)?;
    for outcome in &outcomes {
        match outcome {
            SubmitOutcome::Submitted { label } => println!("submitted {label}"),
            SubmitOutcome::Skipped { label } => println!("skipped {label} (output exists)"),
            SubmitOutcome::DryRun { label } => println!("dry run {label}"),
        }
    }
    Ok(())
}

fn runner_config(name: &str, label: &str) -> Result<RunnerConfig, AppError> {
    match name {
        "bulletin" => Ok(RunnerConfig::MpiBulletin { skip: true }),
        "direct" => Ok(RunnerConfig::MpiDirect {
            cores: 6,
            skip: true,
        }),
        "slurm" => Ok(RunnerConfig::expanse_large_shared(
            format!("../data/{label}"),
            String::new(),
        )),
        other => Err(AppError::UnknownRunner(other.to_string())),
    }
}

fn next_value<'a>(
    iter: &mut impl Iterator<Item = &'a String>,
    flag: &'static str,
) -> Result<String, AppError> {
    iter.next()
        .cloned()
        .ok_or(AppError::MissingValue(flag))
}
