use circuit_cfg::SolverSection;
use log::{debug, info};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::plan::NetworkPlan;
use crate::EngineError;

/// One gathered spike.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, Serialize)]
pub struct Spike {
    pub time_ms: f64,
    pub gid: u64,
}

/// The seam between the launcher and the external solver. Stage methods
/// mirror the framework's run sequence; `run` is where the numerical
/// work happens.
pub trait SolverBackend {
    fn create_pops(&mut self, plan: &NetworkPlan) -> Result<(), EngineError>;
    fn create_cells(&mut self, plan: &NetworkPlan) -> Result<u64, EngineError>;
    fn connect_cells(&mut self, plan: &NetworkPlan) -> Result<usize, EngineError>;
    fn add_stims(&mut self, plan: &NetworkPlan) -> Result<usize, EngineError>;
    fn setup_recording(&mut self, plan: &NetworkPlan) -> Result<usize, EngineError>;
    fn run(&mut self, plan: &NetworkPlan) -> Result<(), EngineError>;
    fn gather(&mut self) -> Result<Vec<Spike>, EngineError>;
}

/// Drives the compiled solver as an MPI process. Each build stage writes
/// its plan artifact into the run directory; `run` hands the directory
/// to the solver and `gather` merges the per-rank spike files it leaves
/// behind.
pub struct ProcessBackend {
    run_dir: PathBuf,
    solver: SolverSection,
}

const POPS_FILE: &str = "pops.yaml";
const CONN_FILE: &str = "conn.yaml";
const STIMS_FILE: &str = "stims.yaml";
const RECORD_FILE: &str = "record.yaml";
const SPIKE_FILE_PREFIX: &str = "spk_";
const SPIKE_FILE_SUFFIX: &str = ".dat";

impl ProcessBackend {
    pub fn new(run_dir: impl Into<PathBuf>, solver: SolverSection) -> Self {
        ProcessBackend {
            run_dir: run_dir.into(),
            solver,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn write_artifact<T: Serialize>(&self, name: &str, value: &T) -> Result<(), EngineError> {
        std::fs::create_dir_all(&self.run_dir).map_err(|source| EngineError::Io {
            path: self.run_dir.clone(),
            source,
        })?;
        let path = self.run_dir.join(name);
        let text = serde_yaml::to_string(value)?;
        std::fs::write(&path, text).map_err(|source| EngineError::Io { path, source })
    }
}

impl SolverBackend for ProcessBackend {
    fn create_pops(&mut self, plan: &NetworkPlan) -> Result<(), EngineError> {
        self.write_artifact(POPS_FILE, &plan.pops)
    }

    fn create_cells(&mut self, plan: &NetworkPlan) -> Result<u64, EngineError> {
        // Instantiation happens inside the solver; the launcher only
        // accounts for the cells the plan asks for.
        Ok(plan.total_cells())
    }

    fn connect_cells(&mut self, plan: &NetworkPlan) -> Result<usize, EngineError> {
        self.write_artifact(CONN_FILE, &(&plan.cortical, &plan.conn_rules))?;
        Ok(plan.conn_rules.len())
    }

    fn add_stims(&mut self, plan: &NetworkPlan) -> Result<usize, EngineError> {
        self.write_artifact(STIMS_FILE, &plan.stims)?;
        Ok(plan.stims.len())
    }

    fn setup_recording(&mut self, plan: &NetworkPlan) -> Result<usize, EngineError> {
        self.write_artifact(RECORD_FILE, &plan.record)?;
        Ok(plan.record.cells.len())
    }

    fn run(&mut self, plan: &NetworkPlan) -> Result<(), EngineError> {
        self.write_artifact("plan.yaml", plan)?;
        let mut command = Command::new(&self.solver.mpi_command);
        command
            .arg("-n")
            .arg(self.solver.ranks.to_string())
            .arg(&self.solver.program);
        for arg in &self.solver.args {
            command.arg(arg);
        }
        command.arg("--plan").arg(&self.run_dir);
        let rendered = format!(
            "{} -n {} {} {} --plan {}",
            self.solver.mpi_command,
            self.solver.ranks,
            self.solver.program.display(),
            self.solver.args.join(" "),
            self.run_dir.display()
        );
        info!("launching solver: {rendered}");
        let status = command.status().map_err(|source| EngineError::Spawn {
            command: rendered.clone(),
            source,
        })?;
        if !status.success() {
            return Err(EngineError::Solver {
                command: rendered,
                status,
            });
        }
        Ok(())
    }

    fn gather(&mut self) -> Result<Vec<Spike>, EngineError> {
        let entries = std::fs::read_dir(&self.run_dir).map_err(|source| EngineError::Io {
            path: self.run_dir.clone(),
            source,
        })?;
        let mut spikes = Vec::new();
        let mut rank_files = 0usize;
        for entry in entries {
            let entry = entry.map_err(|source| EngineError::Io {
                path: self.run_dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(SPIKE_FILE_PREFIX) || !name.ends_with(SPIKE_FILE_SUFFIX) {
                continue;
            }
            rank_files += 1;
            read_spike_file(&entry.path(), &mut spikes)?;
        }
        if rank_files == 0 {
            return Err(EngineError::MissingSpikeOutput {
                dir: self.run_dir.clone(),
            });
        }
        debug!("gathered {} spikes from {rank_files} rank files", spikes.len());
        sort_spikes(&mut spikes);
        Ok(spikes)
    }
}

/// Parses one per-rank spike file: one `time gid` pair per line, the
/// solver's plain-text spike output.
pub fn read_spike_file(path: &Path, spikes: &mut Vec<Spike>) -> Result<(), EngineError> {
    let text = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let mut fields = raw.split_whitespace();
        let time = fields.next().and_then(|f| f.parse::<f64>().ok());
        let gid = fields.next().and_then(|f| f.parse::<u64>().ok());
        match (time, gid, fields.next()) {
            (Some(time_ms), Some(gid), None) => spikes.push(Spike { time_ms, gid }),
            _ => {
                return Err(EngineError::SpikeLine {
                    path: path.to_path_buf(),
                    line,
                })
            }
        }
    }
    Ok(())
}

pub fn sort_spikes(spikes: &mut [Spike]) {
    spikes.sort_by(|a, b| {
        a.time_ms
            .total_cmp(&b.time_ms)
            .then_with(|| a.gid.cmp(&b.gid))
    });
}

/// In-memory backend: records the stage sequence and returns canned
/// spikes. Stands in for the solver in tests.
#[derive(Debug, Default)]
pub struct PlanBackend {
    pub stages: Vec<&'static str>,
    pub spikes: Vec<Spike>,
}

impl PlanBackend {
    pub fn with_spikes(spikes: Vec<Spike>) -> Self {
        PlanBackend {
            stages: Vec::new(),
            spikes,
        }
    }
}

impl SolverBackend for PlanBackend {
    fn create_pops(&mut self, _plan: &NetworkPlan) -> Result<(), EngineError> {
        self.stages.push("create_pops");
        Ok(())
    }

    fn create_cells(&mut self, plan: &NetworkPlan) -> Result<u64, EngineError> {
        self.stages.push("create_cells");
        Ok(plan.total_cells())
    }

    fn connect_cells(&mut self, plan: &NetworkPlan) -> Result<usize, EngineError> {
        self.stages.push("connect_cells");
        Ok(plan.conn_rules.len())
    }

    fn add_stims(&mut self, plan: &NetworkPlan) -> Result<usize, EngineError> {
        self.stages.push("add_stims");
        Ok(plan.stims.len())
    }

    fn setup_recording(&mut self, plan: &NetworkPlan) -> Result<usize, EngineError> {
        self.stages.push("setup_recording");
        Ok(plan.record.cells.len())
    }

    fn run(&mut self, _plan: &NetworkPlan) -> Result<(), EngineError> {
        self.stages.push("run");
        Ok(())
    }

    fn gather(&mut self) -> Result<Vec<Spike>, EngineError> {
        self.stages.push("gather");
        let mut spikes = self.spikes.clone();
        sort_spikes(&mut spikes);
        Ok(spikes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spike_files_parse_and_merge_sorted() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("s1th_spk_test_{}.dat", std::process::id()));
        std::fs::write(&path, "12.5 3\n0.05 7\n\n12.5 1\n").unwrap();

        let mut spikes = Vec::new();
        read_spike_file(&path, &mut spikes).unwrap();
        std::fs::remove_file(&path).ok();

        sort_spikes(&mut spikes);
        assert_eq!(spikes.len(), 3);
        assert_eq!(spikes[0].gid, 7);
        // Ties on time order by gid.
        assert_eq!(spikes[1].gid, 1);
        assert_eq!(spikes[2].gid, 3);
    }

    #[test]
    fn malformed_spike_line_reports_position() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("s1th_spk_bad_{}.dat", std::process::id()));
        std::fs::write(&path, "1.0 2\n3.0 x\n").unwrap();

        let mut spikes = Vec::new();
        let err = read_spike_file(&path, &mut spikes).unwrap_err();
        std::fs::remove_file(&path).ok();
        match err {
            EngineError::SpikeLine { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }
}
