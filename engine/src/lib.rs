#![forbid(unsafe_code)]

use circuit_cells::CellsError;
use circuit_cfg::CfgError;
use std::path::PathBuf;
use thiserror::Error;

pub mod backend;
pub mod pipeline;
pub mod plan;

pub use backend::{PlanBackend, ProcessBackend, SolverBackend, Spike};
pub use pipeline::{pop_avg_rates, run_pipeline, spike_histogram, PopRate, RunReport};
pub use plan::{build_plan, ConnKind, ConnRule, NetworkPlan, PathwayClass, PlannedPop};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Cells(#[from] CellsError),
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("plan serialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("result serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to launch solver {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("solver {command:?} exited with {status}")]
    Solver {
        command: String,
        status: std::process::ExitStatus,
    },
    #[error("malformed spike record at {}:{line}", path.display())]
    SpikeLine { path: PathBuf, line: usize },
    #[error("no spike output files in {}", dir.display())]
    MissingSpikeOutput { dir: PathBuf },
}
