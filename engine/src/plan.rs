use circuit_cells::{
    build_circuit, record_cells, CellDistribution, CircuitCells, RecordSelection,
};
use circuit_cfg::{
    IClampSpec, NetStimSpec, PathwayGains, Seeds, SimConfig, SynWeightFractions,
    TargetedNetStimSpec, TraceSpec, UseFractions,
};
use serde::{Deserialize, Serialize};

use crate::EngineError;

/// One instantiable me-type with its contiguous gid block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPop {
    pub me_label: String,
    pub pop: String,
    pub cell_count: u32,
    pub first_gid: u64,
}

impl PlannedPop {
    pub fn owns_gid(&self, gid: u64) -> bool {
        gid >= self.first_gid && gid < self.first_gid + self.cell_count as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathwayClass {
    IntraThalamic,
    ThalamoCortical,
    CorticoThalamic,
}

/// How the solver picks synapse counts for a pathway.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnKind {
    Prob(f64),
    Convergence(f64),
    Fraction(f64),
}

/// One population-to-population pathway with its gain-scaled weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnRule {
    pub source: String,
    pub target: String,
    pub class: PathwayClass,
    pub kind: ConnKind,
    pub weight: f64,
}

/// Intracortical connectivity is built inside the solver from its own
/// pathway tables; the plan only carries the scaling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorticalConnPlan {
    pub gain: PathwayGains,
    pub syn_weight_fraction: SynWeightFractions,
    pub use_frac: UseFractions,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundDrive {
    pub rate_e_hz: f64,
    pub rate_i_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimPlan {
    pub background: Option<BackgroundDrive>,
    pub iclamps: Vec<IClampSpec>,
    pub net_stims: Vec<NetStimSpec>,
    pub targeted_net_stims: Vec<TargetedNetStimSpec>,
}

impl StimPlan {
    pub fn len(&self) -> usize {
        self.iclamps.len()
            + self.net_stims.len()
            + self.targeted_net_stims.len()
            + usize::from(self.background.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPlan {
    pub traces: Vec<TraceSpec>,
    pub cells: RecordSelection,
    pub step_ms: f64,
}

/// Everything the solver needs for one run, fully resolved from the
/// configuration and the distribution table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkPlan {
    pub label: String,
    pub duration_ms: f64,
    pub dt_ms: f64,
    pub seeds: Seeds,
    pub celsius: f64,
    pub v_init: f64,
    pub pops: Vec<PlannedPop>,
    pub cortical: Option<CorticalConnPlan>,
    pub conn_rules: Vec<ConnRule>,
    pub stims: StimPlan,
    pub record: RecordPlan,
}

impl NetworkPlan {
    pub fn total_cells(&self) -> u64 {
        self.pops.iter().map(|pop| pop.cell_count as u64).sum()
    }

    pub fn pop_for_gid(&self, gid: u64) -> Option<&PlannedPop> {
        self.pops.iter().find(|pop| pop.owns_gid(gid))
    }

    /// Gid blocks of every me-type whose label or parent population is
    /// listed.
    pub fn gids_for_names(&self, names: &[String]) -> Vec<(u64, u64)> {
        self.pops
            .iter()
            .filter(|pop| {
                names
                    .iter()
                    .any(|name| *name == pop.me_label || *name == pop.pop)
            })
            .map(|pop| (pop.first_gid, pop.first_gid + pop.cell_count as u64))
            .collect()
    }
}

fn is_reticular(name: &str) -> bool {
    name.contains("RTN")
}

fn is_relay(name: &str) -> bool {
    !is_reticular(name) && name.contains("TC")
}

/// Derives the concrete run plan: validates the config, builds the
/// circuit with final counts, assigns gid blocks, and flattens every
/// enabled pathway into a rule record.
pub fn build_plan(
    cfg: &SimConfig,
    dist: &CellDistribution,
) -> Result<(CircuitCells, NetworkPlan), EngineError> {
    let circuit = build_circuit(
        dist,
        &cfg.cells.cortical_pops,
        &cfg.cells.thalamic_pops,
        cfg.geometry.density_scaling(),
    )?;
    circuit_cfg::validate(cfg, &circuit)?;

    let mut pops = Vec::with_capacity(circuit.me_types.len());
    let mut next_gid = 0u64;
    for me in &circuit.me_types {
        pops.push(PlannedPop {
            me_label: me.me_label.clone(),
            pop: me.pop.clone(),
            cell_count: me.cell_count,
            first_gid: next_gid,
        });
        next_gid += me.cell_count as u64;
    }

    let cortical_names = cfg.cells.cortical_pops.clone();
    let thalamic_names: Vec<String> = cfg
        .cells
        .thalamic_pops
        .iter()
        .map(|pop| pop.name.clone())
        .collect();
    let reticular: Vec<&String> = thalamic_names
        .iter()
        .filter(|name| is_reticular(name))
        .collect();
    let relay: Vec<&String> = thalamic_names.iter().filter(|name| is_relay(name)).collect();

    let mut conn_rules = Vec::new();
    let thalamus = &cfg.conn.thalamus;
    if cfg.conn.add_conn && thalamus.connect {
        if thalamus.rtn_rtn.enabled {
            push_pairs(
                &mut conn_rules,
                &reticular,
                &reticular,
                PathwayClass::IntraThalamic,
                ConnKind::Prob(thalamus.rtn_rtn.prob),
                thalamus.rtn_rtn.weight * thalamus.gain,
            );
        }
        if thalamus.tc_rtn.enabled {
            push_pairs(
                &mut conn_rules,
                &relay,
                &reticular,
                PathwayClass::IntraThalamic,
                ConnKind::Prob(thalamus.tc_rtn.prob),
                thalamus.tc_rtn.weight * thalamus.gain,
            );
        }
        if thalamus.rtn_tc.enabled {
            push_pairs(
                &mut conn_rules,
                &reticular,
                &relay,
                PathwayClass::IntraThalamic,
                ConnKind::Prob(thalamus.rtn_tc.prob),
                thalamus.rtn_tc.weight * thalamus.gain,
            );
        }
    }
    if cfg.conn.add_conn && cfg.conn.th_to_s1.connect {
        for (source, enabled) in &cfg.conn.th_to_s1.sources {
            if !*enabled {
                continue;
            }
            for target in &cortical_names {
                conn_rules.push(ConnRule {
                    source: source.clone(),
                    target: target.clone(),
                    class: PathwayClass::ThalamoCortical,
                    kind: ConnKind::Fraction(cfg.conn.th_to_s1.frac),
                    weight: 1.0,
                });
            }
        }
    }
    if cfg.conn.add_conn && cfg.conn.s1_to_th.connect {
        let s1_to_th = &cfg.conn.s1_to_th;
        if s1_to_th.s1_rtn.enabled {
            for source in &cortical_names {
                for target in &reticular {
                    conn_rules.push(ConnRule {
                        source: source.clone(),
                        target: (*target).clone(),
                        class: PathwayClass::CorticoThalamic,
                        kind: ConnKind::Convergence(s1_to_th.s1_rtn.convergence),
                        weight: s1_to_th.s1_rtn.weight,
                    });
                }
            }
        }
        if s1_to_th.s1_tc.enabled {
            for source in &cortical_names {
                for target in &relay {
                    conn_rules.push(ConnRule {
                        source: source.clone(),
                        target: (*target).clone(),
                        class: PathwayClass::CorticoThalamic,
                        kind: ConnKind::Convergence(s1_to_th.s1_tc.convergence),
                        weight: s1_to_th.s1_tc.weight,
                    });
                }
            }
        }
    }

    let cortical = if cfg.conn.add_conn && !cortical_names.is_empty() {
        Some(CorticalConnPlan {
            gain: cfg.conn.gain,
            syn_weight_fraction: cfg.conn.syn_weight_fraction,
            use_frac: cfg.conn.use_frac,
        })
    } else {
        None
    };

    let stims = StimPlan {
        background: cfg.stim.add_stim_syn.then_some(BackgroundDrive {
            rate_e_hz: cfg.stim.rate_stim_e_hz,
            rate_i_hz: cfg.stim.rate_stim_i_hz,
        }),
        iclamps: if cfg.stim.add_iclamp {
            cfg.stim.iclamps.clone()
        } else {
            Vec::new()
        },
        net_stims: if cfg.stim.add_net_stim {
            cfg.stim.net_stims.clone()
        } else {
            Vec::new()
        },
        targeted_net_stims: if cfg.stim.add_targeted_net_stim {
            cfg.stim.targeted_net_stims.clone()
        } else {
            Vec::new()
        },
    };

    let record = RecordPlan {
        traces: cfg.record.traces.clone(),
        cells: record_cells(&circuit, cfg.record.cells_rec),
        step_ms: cfg.record.record_step_ms,
    };

    let plan = NetworkPlan {
        label: cfg.run.sim_label.clone(),
        duration_ms: cfg.run.duration_ms,
        dt_ms: cfg.run.dt_ms,
        seeds: cfg.run.seeds,
        celsius: cfg.run.celsius,
        v_init: cfg.run.v_init,
        pops,
        cortical,
        conn_rules,
        stims,
        record,
    };
    Ok((circuit, plan))
}

fn push_pairs(
    rules: &mut Vec<ConnRule>,
    sources: &[&String],
    targets: &[&String],
    class: PathwayClass,
    kind: ConnKind,
    weight: f64,
) {
    for source in sources {
        for target in targets {
            rules.push(ConnRule {
                source: (*source).clone(),
                target: (*target).clone(),
                class,
                kind,
                weight,
            });
        }
    }
}
