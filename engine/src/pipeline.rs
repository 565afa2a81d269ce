use circuit_cells::CellDistribution;
use circuit_cfg::{HistMeasure, SaveDataKind, SimConfig, SpikeHistSpec};
use log::info;
use serde::Serialize;
use std::path::PathBuf;

use crate::backend::{Spike, SolverBackend};
use crate::plan::{build_plan, NetworkPlan};
use crate::EngineError;

const RUN_DIGEST_DOMAIN: &str = "S1TH:RUN";

/// Average firing rate of one me-type population over the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopRate {
    pub me_label: String,
    pub cells: u32,
    pub spikes: u64,
    pub rate_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub label: String,
    pub total_cells: u64,
    pub conn_rules: usize,
    pub stims: usize,
    pub record_targets: usize,
    pub spike_count: usize,
    pub pop_rates: Vec<PopRate>,
    pub run_digest: String,
    pub outputs: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct SimData<'a> {
    spikes: &'a [Spike],
    pop_rates: &'a [PopRate],
    run_digest: &'a str,
}

/// The saved result bundle; sections follow `save.save_data_include`.
#[derive(Debug, Serialize)]
struct ResultBundle<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    sim_config: Option<&'a SimConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    net_params: Option<&'a NetworkPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    net: Option<&'a [crate::plan::PlannedPop]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sim_data: Option<SimData<'a>>,
}

/// Runs the full sequence: create pops, create cells, connect, stims,
/// recording, run, gather, save, plot. The backend owns everything on
/// the solver side of the seam.
pub fn run_pipeline<B: SolverBackend>(
    cfg: &SimConfig,
    dist: &CellDistribution,
    backend: &mut B,
) -> Result<RunReport, EngineError> {
    let (_circuit, plan) = build_plan(cfg, dist)?;

    backend.create_pops(&plan)?;
    info!("created {} populations", plan.pops.len());
    let total_cells = backend.create_cells(&plan)?;
    info!("created {total_cells} cells");
    let conn_rules = backend.connect_cells(&plan)?;
    info!("connected cells: {conn_rules} pathway rules");
    let stims = backend.add_stims(&plan)?;
    info!("added {stims} stimulation sources");
    let record_targets = backend.setup_recording(&plan)?;
    info!("recording {record_targets} targets");

    backend.run(&plan)?;
    let spikes = backend.gather()?;
    info!("gathered {} spikes", spikes.len());

    let pop_rates = pop_avg_rates(&plan, &spikes);
    if cfg.run.print_pop_avg_rates {
        for rate in &pop_rates {
            info!(
                "{}: {} cells, {:.2} Hz",
                rate.me_label, rate.cells, rate.rate_hz
            );
        }
    }

    let run_digest = hex(run_digest(&spikes));
    let mut outputs = Vec::new();
    if cfg.save.save_json {
        outputs.push(save_bundle(cfg, &plan, &spikes, &pop_rates, &run_digest)?);
    }
    if cfg.save.backup_cfg {
        let path = cfg
            .save_folder()
            .join(format!("{}_cfg.yaml", cfg.run.sim_label));
        cfg.save(&path)?;
        outputs.push(path);
    }
    outputs.extend(plot_data(cfg, &plan, &spikes)?);

    Ok(RunReport {
        label: plan.label.clone(),
        total_cells,
        conn_rules,
        stims,
        record_targets,
        spike_count: spikes.len(),
        pop_rates,
        run_digest,
        outputs,
    })
}

pub fn pop_avg_rates(plan: &NetworkPlan, spikes: &[Spike]) -> Vec<PopRate> {
    let duration_s = plan.duration_ms / 1000.0;
    let mut counts = vec![0u64; plan.pops.len()];
    for spike in spikes {
        if let Some(idx) = plan.pops.iter().position(|pop| pop.owns_gid(spike.gid)) {
            counts[idx] += 1;
        }
    }
    plan.pops
        .iter()
        .zip(counts)
        .map(|(pop, spikes)| PopRate {
            me_label: pop.me_label.clone(),
            cells: pop.cell_count,
            spikes,
            rate_hz: spikes as f64 / (pop.cell_count as f64 * duration_s),
        })
        .collect()
}

/// Per-group binned firing, the spike-histogram analysis the run script
/// requests after every simulation.
pub fn spike_histogram(
    plan: &NetworkPlan,
    spikes: &[Spike],
    spec: &SpikeHistSpec,
    group: &[String],
) -> Vec<(f64, f64)> {
    let [start, stop] = spec.time_range_ms;
    let bins = ((stop - start) / spec.bin_ms).ceil() as usize;
    let ranges = plan.gids_for_names(group);
    let group_cells: u64 = ranges.iter().map(|(lo, hi)| hi - lo).sum();
    let mut counts = vec![0u64; bins];
    for spike in spikes {
        if spike.time_ms < start || spike.time_ms >= stop {
            continue;
        }
        if !ranges
            .iter()
            .any(|(lo, hi)| spike.gid >= *lo && spike.gid < *hi)
        {
            continue;
        }
        let bin = ((spike.time_ms - start) / spec.bin_ms) as usize;
        if bin < bins {
            counts[bin] += 1;
        }
    }
    counts
        .iter()
        .enumerate()
        .map(|(bin, &count)| {
            let value = match spec.measure {
                HistMeasure::Count => count as f64,
                HistMeasure::Rate => {
                    if group_cells == 0 {
                        0.0
                    } else {
                        count as f64 / (group_cells as f64 * spec.bin_ms / 1000.0)
                    }
                }
            };
            (start + bin as f64 * spec.bin_ms, value)
        })
        .collect()
}

fn save_bundle(
    cfg: &SimConfig,
    plan: &NetworkPlan,
    spikes: &[Spike],
    pop_rates: &[PopRate],
    run_digest: &str,
) -> Result<PathBuf, EngineError> {
    let folder = cfg.save_folder();
    std::fs::create_dir_all(&folder).map_err(|source| EngineError::Io {
        path: folder.clone(),
        source,
    })?;
    let include = &cfg.save.save_data_include;
    let has = |kind: SaveDataKind| include.contains(&kind) && !cfg.save.gather_only_sim_data;
    let bundle = ResultBundle {
        sim_config: has(SaveDataKind::SimConfig).then_some(cfg),
        net_params: has(SaveDataKind::NetParams).then_some(plan),
        net: has(SaveDataKind::Net).then_some(plan.pops.as_slice()),
        sim_data: include.contains(&SaveDataKind::SimData).then_some(SimData {
            spikes,
            pop_rates,
            run_digest,
        }),
    };
    let path = folder.join(format!("{}_data.json", cfg.run.sim_label));
    let text = serde_json::to_string(&bundle)?;
    std::fs::write(&path, text).map_err(|source| EngineError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Emits the analysis artifacts: plot request specs for the external
/// renderer, and the spike-histogram data as CSV.
fn plot_data(
    cfg: &SimConfig,
    plan: &NetworkPlan,
    spikes: &[Spike],
) -> Result<Vec<PathBuf>, EngineError> {
    let folder = cfg.save_folder();
    std::fs::create_dir_all(&folder).map_err(|source| EngineError::Io {
        path: folder.clone(),
        source,
    })?;
    let label = &cfg.run.sim_label;
    let mut outputs = Vec::new();

    if let Some(raster) = &cfg.analysis.raster {
        let mut resolved = raster.clone();
        if resolved.include.is_empty() {
            resolved.include = plan.pops.iter().map(|pop| pop.me_label.clone()).collect();
        }
        if resolved.time_range_ms.is_none() {
            resolved.time_range_ms = Some([0.0, plan.duration_ms]);
        }
        let path = folder.join(format!("{label}_raster.yaml"));
        write_yaml(&path, &resolved)?;
        outputs.push(path);
    }
    if let Some(traces) = &cfg.analysis.traces {
        let path = folder.join(format!("{label}_traces.yaml"));
        write_yaml(&path, &(traces, &plan.record.cells))?;
        outputs.push(path);
    }
    if let Some(hist) = &cfg.analysis.spike_hist {
        for (group_idx, group) in hist.include.iter().enumerate() {
            let series = spike_histogram(plan, spikes, hist, group);
            let mut csv = String::from("bin_start_ms,value\n");
            for (bin_start, value) in series {
                csv.push_str(&format!("{bin_start},{value}\n"));
            }
            let path = folder.join(format!("{label}_spikehist_{group_idx}.csv"));
            std::fs::write(&path, csv).map_err(|source| EngineError::Io {
                path: path.clone(),
                source,
            })?;
            outputs.push(path);
        }
    }
    Ok(outputs)
}

fn write_yaml<T: Serialize>(path: &PathBuf, value: &T) -> Result<(), EngineError> {
    let text = serde_yaml::to_string(value)?;
    std::fs::write(path, text).map_err(|source| EngineError::Io {
        path: path.clone(),
        source,
    })
}

pub fn run_digest(spikes: &[Spike]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(RUN_DIGEST_DOMAIN.as_bytes());
    for spike in spikes {
        hasher.update(&spike.time_ms.to_le_bytes());
        hasher.update(&spike.gid.to_le_bytes());
    }
    *hasher.finalize().as_bytes()
}

fn hex(digest: [u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
