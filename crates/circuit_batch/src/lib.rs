#![forbid(unsafe_code)]

use circuit_cfg::{apply_overrides, CfgError, Override, SimConfig};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

const MANIFEST_FILE: &str = "batch_manifest.yaml";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("batch serialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("parameter {path:?} has an empty candidate list")]
    EmptyValues { path: String },
    #[error("slurm topology must be positive, got {nodes} nodes x {cores} cores")]
    InvalidTopology { nodes: u32, cores: u32 },
    #[error("failed to launch {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command:?} exited with {status}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
    },
}

/// Candidate values for one dotted config path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub path: String,
    pub values: Vec<Value>,
}

/// An ordered parameter table; jobs are the Cartesian product of the
/// candidate lists, first path varying slowest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamGrid {
    pub params: Vec<ParamSpec>,
}

/// One point of the grid: per-parameter indices plus the resolved
/// overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct GridPoint {
    pub index: Vec<usize>,
    pub overrides: Vec<Override>,
}

impl ParamGrid {
    pub fn push(&mut self, path: impl Into<String>, values: Vec<Value>) {
        self.params.push(ParamSpec {
            path: path.into(),
            values,
        });
    }

    pub fn job_count(&self) -> usize {
        self.params.iter().map(|param| param.values.len()).product()
    }

    pub fn points(&self) -> Result<Vec<GridPoint>, BatchError> {
        for param in &self.params {
            if param.values.is_empty() {
                return Err(BatchError::EmptyValues {
                    path: param.path.clone(),
                });
            }
        }
        let mut points = Vec::with_capacity(self.job_count());
        let mut index = vec![0usize; self.params.len()];
        loop {
            let overrides = self
                .params
                .iter()
                .zip(&index)
                .map(|(param, &i)| Override::new(param.path.clone(), param.values[i].clone()))
                .collect();
            points.push(GridPoint {
                index: index.clone(),
                overrides,
            });
            // Odometer increment, last axis fastest.
            let mut axis = self.params.len();
            loop {
                if axis == 0 {
                    return Ok(points);
                }
                axis -= 1;
                index[axis] += 1;
                if index[axis] < self.params[axis].values.len() {
                    break;
                }
                index[axis] = 0;
            }
        }
    }
}

/// The sweep presets used for this model.
pub mod presets {
    use super::ParamGrid;
    use serde_yaml::Value;

    fn numbers(values: &[f64]) -> Vec<Value> {
        values.iter().map(|v| Value::from(*v)).collect()
    }

    fn seeds(values: &[u32]) -> Vec<Value> {
        values.iter().map(|v| Value::from(*v)).collect()
    }

    /// Repeats the reference run under fixed connectivity/location seeds.
    pub fn seed_sweep() -> ParamGrid {
        let mut grid = ParamGrid::default();
        grid.push("run.seeds.conn", seeds(&[4321]));
        grid.push("run.seeds.loc", seeds(&[4321]));
        grid
    }

    /// Crosses inhibitory gains with connectivity seeds.
    pub fn inhibition_sweep() -> ParamGrid {
        let mut grid = ParamGrid::default();
        grid.push("conn.gain.ie", numbers(&[0.5, 0.75, 1.0, 1.25, 1.5]));
        grid.push("conn.gain.ii", numbers(&[0.5, 0.75, 1.0, 1.25, 1.5]));
        grid.push("run.seeds.conn", seeds(&[0, 1, 2, 3, 4]));
        grid
    }
}

/// How prepared jobs get launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerConfig {
    /// Run inside an already-allocated MPI bulletin session.
    MpiBulletin { skip: bool },
    /// Direct mpi launch on the current host.
    MpiDirect { cores: u32, skip: bool },
    /// Submission to a slurm cluster.
    HpcSlurm {
        allocation: String,
        partition: String,
        walltime: String,
        nodes: u32,
        cores_per_node: u32,
        email: String,
        folder: PathBuf,
        custom: String,
        skip: bool,
    },
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), BatchError> {
        match self {
            RunnerConfig::MpiDirect { cores, .. } if *cores == 0 => {
                Err(BatchError::InvalidTopology {
                    nodes: 1,
                    cores: *cores,
                })
            }
            RunnerConfig::HpcSlurm {
                nodes,
                cores_per_node,
                ..
            } if *nodes == 0 || *cores_per_node == 0 => Err(BatchError::InvalidTopology {
                nodes: *nodes,
                cores: *cores_per_node,
            }),
            _ => Ok(()),
        }
    }

    pub fn skip(&self) -> bool {
        match self {
            RunnerConfig::MpiBulletin { skip }
            | RunnerConfig::MpiDirect { skip, .. }
            | RunnerConfig::HpcSlurm { skip, .. } => *skip,
        }
    }

    /// The compute partition used on the Expanse allocation.
    pub fn expanse_large_shared(folder: impl Into<PathBuf>, email: impl Into<String>) -> Self {
        RunnerConfig::HpcSlurm {
            allocation: "TG-IBN140002".to_string(),
            partition: "large-shared".to_string(),
            walltime: "30:00:00".to_string(),
            nodes: 1,
            cores_per_node: 128,
            email: email.into(),
            folder: folder.into(),
            custom: "#SBATCH --mem=1024G\n#SBATCH --export=ALL\n#SBATCH --partition=large-shared"
                .to_string(),
            skip: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSpec {
    pub label: String,
    pub save_folder: PathBuf,
    pub grid: ParamGrid,
    pub runner: RunnerConfig,
}

impl BatchSpec {
    pub fn new(label: impl Into<String>, grid: ParamGrid, runner: RunnerConfig) -> Self {
        let label = label.into();
        BatchSpec {
            save_folder: PathBuf::from("../data").join(&label),
            label,
            grid,
            runner,
        }
    }
}

/// A fully rendered job: overridden config, its digest, and the launch
/// artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedJob {
    pub label: String,
    pub index: Vec<usize>,
    pub cfg: SimConfig,
    pub cfg_digest: [u8; 32],
    pub cfg_path: PathBuf,
    pub script: JobScript,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobScript {
    Command(Vec<String>),
    Sbatch { path: PathBuf, contents: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted { label: String },
    Skipped { label: String },
    DryRun { label: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestJob {
    label: String,
    index: Vec<usize>,
    cfg_digest: String,
    cfg_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    label: String,
    method: String,
    params: Vec<ParamSpec>,
    jobs: Vec<ManifestJob>,
}

pub struct Batch {
    pub spec: BatchSpec,
    pub base_cfg: SimConfig,
}

impl Batch {
    pub fn new(spec: BatchSpec, base_cfg: SimConfig) -> Self {
        Batch { spec, base_cfg }
    }

    /// Expands the grid into per-job configs and launch scripts. Nothing
    /// touches the filesystem until [`Batch::write`].
    pub fn prepare(&self) -> Result<Vec<PreparedJob>, BatchError> {
        self.spec.runner.validate()?;
        let mut jobs = Vec::new();
        for point in self.spec.grid.points()? {
            let label = job_label(&self.spec.label, &point.index);
            let mut overrides = point.overrides.clone();
            overrides.push(Override::new(
                "run.sim_label",
                Value::String(label.clone()),
            ));
            let cfg = apply_overrides(&self.base_cfg, &overrides)?;
            let cfg_digest = cfg.config_digest()?;
            let cfg_path = self.spec.save_folder.join(format!("{label}_cfg.yaml"));
            let script = self.render_script(&label, &cfg, &cfg_path)?;
            jobs.push(PreparedJob {
                label,
                index: point.index,
                cfg,
                cfg_digest,
                cfg_path,
                script,
            });
        }
        Ok(jobs)
    }

    fn render_script(
        &self,
        label: &str,
        cfg: &SimConfig,
        cfg_path: &Path,
    ) -> Result<JobScript, BatchError> {
        let solver = &cfg.solver;
        let solver_argv = |ranks: u32| {
            let mut argv = vec![
                solver.mpi_command.clone(),
                "-n".to_string(),
                ranks.to_string(),
                solver.program.display().to_string(),
            ];
            argv.extend(solver.args.iter().cloned());
            argv.push("--cfg".to_string());
            argv.push(cfg_path.display().to_string());
            argv
        };
        match &self.spec.runner {
            RunnerConfig::MpiBulletin { .. } => {
                let mut argv = vec![solver.program.display().to_string()];
                argv.extend(solver.args.iter().cloned());
                argv.push("--cfg".to_string());
                argv.push(cfg_path.display().to_string());
                Ok(JobScript::Command(argv))
            }
            RunnerConfig::MpiDirect { cores, .. } => Ok(JobScript::Command(solver_argv(*cores))),
            RunnerConfig::HpcSlurm {
                allocation,
                partition,
                walltime,
                nodes,
                cores_per_node,
                email,
                folder,
                custom,
                ..
            } => {
                let total_tasks = nodes * cores_per_node;
                let folder = folder.display();
                let launch = solver_argv(total_tasks).join(" ");
                let mut contents = String::new();
                contents.push_str("#!/bin/bash\n");
                contents.push_str(&format!("#SBATCH --job-name={label}\n"));
                contents.push_str(&format!("#SBATCH -A {allocation}\n"));
                contents.push_str(&format!("#SBATCH --partition={partition}\n"));
                contents.push_str(&format!("#SBATCH -t {walltime}\n"));
                contents.push_str(&format!("#SBATCH --nodes={nodes}\n"));
                contents.push_str(&format!("#SBATCH --ntasks-per-node={cores_per_node}\n"));
                contents.push_str(&format!("#SBATCH -o {folder}/{label}.run\n"));
                contents.push_str(&format!("#SBATCH -e {folder}/{label}.err\n"));
                contents.push_str(&format!("#SBATCH --mail-user={email}\n"));
                contents.push_str("#SBATCH --mail-type=end\n");
                if !custom.is_empty() {
                    contents.push_str(custom);
                    contents.push('\n');
                }
                contents.push_str("source ~/.bashrc\n");
                contents.push_str(&format!("cd {folder}\n"));
                contents.push_str(&launch);
                contents.push('\n');
                contents.push_str("wait\n");
                Ok(JobScript::Sbatch {
                    path: self.spec.save_folder.join(format!("{label}.sbatch")),
                    contents,
                })
            }
        }
    }

    /// Writes per-job configs, sbatch scripts, and the batch manifest
    /// under the batch save folder.
    pub fn write(&self, jobs: &[PreparedJob]) -> Result<(), BatchError> {
        std::fs::create_dir_all(&self.spec.save_folder).map_err(|source| BatchError::Io {
            path: self.spec.save_folder.clone(),
            source,
        })?;
        for job in jobs {
            job.cfg.save(&job.cfg_path)?;
            if let JobScript::Sbatch { path, contents } = &job.script {
                std::fs::write(path, contents).map_err(|source| BatchError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
        }
        let manifest = Manifest {
            label: self.spec.label.clone(),
            method: "grid".to_string(),
            params: self.spec.grid.params.clone(),
            jobs: jobs
                .iter()
                .map(|job| ManifestJob {
                    label: job.label.clone(),
                    index: job.index.clone(),
                    cfg_digest: hex_digest(&job.cfg_digest),
                    cfg_path: job.cfg_path.clone(),
                })
                .collect(),
        };
        let path = self.spec.save_folder.join(MANIFEST_FILE);
        let text = serde_yaml::to_string(&manifest)?;
        std::fs::write(&path, text).map_err(|source| BatchError::Io { path, source })
    }

    /// Launches every prepared job in grid order. Jobs whose result
    /// bundle already exists are skipped when the runner says so.
    pub fn submit(
        &self,
        jobs: &[PreparedJob],
        dry_run: bool,
    ) -> Result<Vec<SubmitOutcome>, BatchError> {
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            if self.spec.runner.skip() && bundle_path(&job.cfg).exists() {
                info!("skipping {}: output bundle exists", job.label);
                outcomes.push(SubmitOutcome::Skipped {
                    label: job.label.clone(),
                });
                continue;
            }
            if dry_run {
                debug!("dry run, not launching {}", job.label);
                outcomes.push(SubmitOutcome::DryRun {
                    label: job.label.clone(),
                });
                continue;
            }
            let argv = match &job.script {
                JobScript::Command(argv) => argv.clone(),
                JobScript::Sbatch { path, .. } => {
                    vec!["sbatch".to_string(), path.display().to_string()]
                }
            };
            info!("launching {}: {}", job.label, argv.join(" "));
            let rendered = argv.join(" ");
            let status = Command::new(&argv[0])
                .args(&argv[1..])
                .status()
                .map_err(|source| BatchError::Spawn {
                    command: rendered.clone(),
                    source,
                })?;
            if !status.success() {
                return Err(BatchError::CommandFailed {
                    command: rendered,
                    status,
                });
            }
            outcomes.push(SubmitOutcome::Submitted {
                label: job.label.clone(),
            });
        }
        Ok(outcomes)
    }
}

/// `{batch}_{i}_{j}` from the per-parameter indices; the bare batch label
/// for an empty grid.
pub fn job_label(batch_label: &str, index: &[usize]) -> String {
    let mut label = batch_label.to_string();
    for i in index {
        label.push('_');
        label.push_str(&i.to_string());
    }
    label
}

/// Where the pipeline writes a job's gathered result bundle.
pub fn bundle_path(cfg: &SimConfig) -> PathBuf {
    cfg.save_folder()
        .join(format!("{}_data.json", cfg.run.sim_label))
}

fn hex_digest(digest: &[u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_point_count_is_product_of_lengths() {
        let grid = presets::inhibition_sweep();
        assert_eq!(grid.job_count(), 5 * 5 * 5);
        assert_eq!(grid.points().unwrap().len(), 125);
    }

    #[test]
    fn empty_grid_yields_single_point() {
        let grid = ParamGrid::default();
        assert_eq!(grid.job_count(), 1);
        let points = grid.points().unwrap();
        assert_eq!(points.len(), 1);
        assert!(points[0].overrides.is_empty());
    }

    #[test]
    fn empty_candidate_list_is_an_error() {
        let mut grid = ParamGrid::default();
        grid.push("run.seeds.conn", Vec::new());
        assert!(matches!(
            grid.points(),
            Err(BatchError::EmptyValues { path }) if path == "run.seeds.conn"
        ));
    }

    #[test]
    fn points_iterate_last_axis_fastest() {
        let mut grid = ParamGrid::default();
        grid.push("a", vec![Value::from(0), Value::from(1)]);
        grid.push("b", vec![Value::from(0), Value::from(1), Value::from(2)]);
        let indices: Vec<Vec<usize>> = grid
            .points()
            .unwrap()
            .into_iter()
            .map(|point| point.index)
            .collect();
        assert_eq!(indices[0], vec![0, 0]);
        assert_eq!(indices[1], vec![0, 1]);
        assert_eq!(indices[3], vec![1, 0]);
        assert_eq!(indices.len(), 6);
    }

    #[test]
    fn job_labels_use_index_tuples() {
        assert_eq!(job_label("v8_batch3", &[0, 2]), "v8_batch3_0_2");
        assert_eq!(job_label("v8_batch3", &[]), "v8_batch3");
    }

    #[test]
    fn zero_topology_is_rejected() {
        let runner = RunnerConfig::HpcSlurm {
            allocation: "TG-IBN140002".to_string(),
            partition: "compute".to_string(),
            walltime: "12:00:00".to_string(),
            nodes: 0,
            cores_per_node: 128,
            email: String::new(),
            folder: PathBuf::from("."),
            custom: String::new(),
            skip: true,
        };
        assert!(matches!(
            runner.validate(),
            Err(BatchError::InvalidTopology { nodes: 0, .. })
        ));
    }
}
