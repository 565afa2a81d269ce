#![forbid(unsafe_code)]

use circuit_cells::{CircuitCells, DensityScaling, RecordMode, ThalamicPop};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod overrides;

pub use overrides::{apply_overrides, Override};

const CFG_DIGEST_DOMAIN: &str = "S1TH:CFG";

pub const DEFAULT_DISTRIBUTION_FILE: &str = "cells/S1-cells-distributions-Rat.txt";

#[derive(Debug, Error)]
pub enum CfgError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config serialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("override {0:?} is not of the form key=value")]
    MalformedOverride(String),
    #[error("unknown config path {0:?}")]
    UnknownPath(String),
    #[error("{context} references unknown population {pop:?}")]
    UnknownPopulation { context: &'static str, pop: String },
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },
    #[error("{field} must lie in [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Seeds {
    pub cell: u32,
    pub conn: u32,
    pub stim: u32,
    pub loc: u32,
}

impl Default for Seeds {
    fn default() -> Self {
        Seeds {
            cell: 4322,
            conn: 4322,
            stim: 4322,
            loc: 4322,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunSection {
    pub sim_label: String,
    pub sim_type: String,
    pub duration_ms: f64,
    pub dt_ms: f64,
    pub seeds: Seeds,
    pub celsius: f64,
    pub v_init: f64,
    /// Extracellular calcium applied to all sections, in mM.
    pub cao_secs: f64,
    pub cvode_active: bool,
    pub cvode_atol: f64,
    pub cache_efficient: bool,
    /// Fraction of the run between progress prints.
    pub print_run_time_frac: f64,
    pub print_pop_avg_rates: bool,
    pub verbose: bool,
}

impl Default for RunSection {
    fn default() -> Self {
        RunSection {
            sim_label: "v7_batch2".to_string(),
            sim_type: "S1_TH".to_string(),
            duration_ms: 1.2e4,
            dt_ms: 0.05,
            seeds: Seeds::default(),
            celsius: 34.0,
            v_init: -65.0,
            cao_secs: 1.2,
            cvode_active: false,
            cvode_atol: 1e-6,
            cache_efficient: true,
            print_run_time_frac: 0.1,
            print_pop_avg_rates: true,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GeometrySection {
    pub scale: f64,
    pub size_x_um: f64,
    pub size_y_um: f64,
    pub size_z_um: f64,
    pub scale_density: f64,
    /// Scaled me-type counts below this collapse to one cell.
    pub density_floor: u32,
}

impl Default for GeometrySection {
    fn default() -> Self {
        GeometrySection {
            scale: 1.0,
            size_x_um: 420.0,
            size_y_um: 2082.0,
            size_z_um: 420.0,
            scale_density: 0.02,
            density_floor: 50_000,
        }
    }
}

impl GeometrySection {
    pub fn density_scaling(&self) -> DensityScaling {
        DensityScaling {
            factor: self.scale_density,
            floor_threshold: self.density_floor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CellsSection {
    pub distribution_file: PathBuf,
    pub cortical_pops: Vec<String>,
    pub thalamic_pops: Vec<ThalamicPop>,
    pub load_cells_from_json: bool,
    /// Import somas only, to study the network in isolation.
    pub reduced_test: bool,
}

impl Default for CellsSection {
    fn default() -> Self {
        CellsSection {
            distribution_file: PathBuf::from(DEFAULT_DISTRIBUTION_FILE),
            cortical_pops: vec![
                "L5_SBC".to_string(),
                "L5_TTPC2".to_string(),
                "L6_SBC".to_string(),
                "L6_TPC_L4".to_string(),
            ],
            thalamic_pops: circuit_cells::default_thalamic_pops(),
            load_cells_from_json: true,
            reduced_test: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PathwayGains {
    pub ee: f64,
    pub ei: f64,
    pub ii: f64,
    pub ie: f64,
}

impl Default for PathwayGains {
    fn default() -> Self {
        PathwayGains {
            ee: 1.0,
            ei: 1.0,
            ii: 1.0,
            ie: 1.0,
        }
    }
}

/// First/second receptor weight split per pathway class: AMPA/NMDA for
/// excitatory sources, GABAA/GABAB for inhibitory ones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SynWeightFractions {
    pub ee: [f64; 2],
    pub ei: [f64; 2],
    pub ii: [f64; 2],
    pub ie: [f64; 2],
}

impl Default for SynWeightFractions {
    fn default() -> Self {
        SynWeightFractions {
            ee: [1.0, 1.0],
            ei: [1.0, 1.0],
            ii: [1.0, 1.0],
            ie: [1.0, 1.0],
        }
    }
}

/// In-vivo release probability as a fraction of the in-vitro value, per
/// pathway class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UseFractions {
    pub e_i_proximal: f64,
    pub inh: f64,
    pub e_e: f64,
    pub e_i_distal: f64,
}

impl Default for UseFractions {
    fn default() -> Self {
        UseFractions {
            e_i_proximal: 0.75,
            inh: 0.50,
            e_e: 0.25,
            e_i_distal: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PathwaySpec {
    pub enabled: bool,
    pub weight: f64,
    pub prob: f64,
}

impl Default for PathwaySpec {
    fn default() -> Self {
        PathwaySpec {
            enabled: true,
            weight: 1.0,
            prob: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ThalamicConn {
    pub connect: bool,
    pub rtn_rtn: PathwaySpec,
    pub tc_rtn: PathwaySpec,
    pub rtn_tc: PathwaySpec,
    /// Vertical tolerance divisor for the radial connection distance.
    pub y_conn_factor: f64,
    pub gain: f64,
    pub divergence_ho: f64,
}

impl Default for ThalamicConn {
    fn default() -> Self {
        ThalamicConn {
            connect: true,
            rtn_rtn: PathwaySpec {
                enabled: true,
                weight: 2.0,
                prob: 0.5,
            },
            tc_rtn: PathwaySpec {
                enabled: true,
                weight: 1.5,
                prob: 0.9,
            },
            rtn_tc: PathwaySpec {
                enabled: true,
                weight: 1.5,
                prob: 0.9,
            },
            y_conn_factor: 10.0,
            gain: 1.0,
            divergence_ho: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ThToS1Conn {
    pub connect: bool,
    /// Relay populations projecting to cortex, keyed by population.
    pub sources: BTreeMap<String, bool>,
    pub frac: f64,
}

impl Default for ThToS1Conn {
    fn default() -> Self {
        let mut sources = BTreeMap::new();
        sources.insert("VPM_sTC".to_string(), true);
        sources.insert("VPM_TC".to_string(), false);
        ThToS1Conn {
            connect: true,
            sources,
            frac: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConvergenceSpec {
    pub enabled: bool,
    pub convergence: f64,
    pub weight: f64,
}

impl Default for ConvergenceSpec {
    fn default() -> Self {
        ConvergenceSpec {
            enabled: true,
            convergence: 30.0,
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct S1ToThConn {
    pub connect: bool,
    pub s1_rtn: ConvergenceSpec,
    pub s1_tc: ConvergenceSpec,
}

impl Default for S1ToThConn {
    fn default() -> Self {
        S1ToThConn {
            connect: true,
            s1_rtn: ConvergenceSpec {
                enabled: true,
                convergence: 30.0,
                weight: 0.500,
            },
            s1_tc: ConvergenceSpec {
                enabled: true,
                convergence: 30.0,
                weight: 0.250,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConnSection {
    pub add_conn: bool,
    pub gain: PathwayGains,
    pub syn_weight_fraction: SynWeightFractions,
    pub use_frac: UseFractions,
    pub thalamus: ThalamicConn,
    pub th_to_s1: ThToS1Conn,
    pub s1_to_th: S1ToThConn,
}

impl Default for ConnSection {
    fn default() -> Self {
        ConnSection {
            add_conn: true,
            gain: PathwayGains::default(),
            syn_weight_fraction: SynWeightFractions::default(),
            use_frac: UseFractions::default(),
            thalamus: ThalamicConn::default(),
            th_to_s1: ThToS1Conn::default(),
            s1_to_th: S1ToThConn::default(),
        }
    }
}

/// One somatic current-clamp pulse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IClampSpec {
    pub pop: String,
    pub sec: String,
    pub loc: f64,
    pub start_ms: f64,
    pub dur_ms: f64,
    pub amp_na: f64,
}

/// A regular pulse train on one population.
pub fn rhythmic_pulses(
    pop: &str,
    start_ms: f64,
    count: usize,
    interval_ms: f64,
    dur_ms: f64,
    amp_na: f64,
) -> Vec<IClampSpec> {
    (0..count)
        .map(|k| IClampSpec {
            pop: pop.to_string(),
            sec: "soma".to_string(),
            loc: 0.5,
            start_ms: start_ms + k as f64 * interval_ms,
            dur_ms,
            amp_na,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NetStimSpec {
    pub pop: String,
    pub ynorm: [f64; 2],
    pub sec: String,
    pub loc: f64,
    pub syn_mech: Vec<String>,
    pub syn_mech_weight_factor: Vec<f64>,
    pub start_ms: f64,
    pub interval_ms: f64,
    pub noise: f64,
    pub number: u32,
    pub weight: f64,
    pub delay_ms: f64,
}

impl Default for NetStimSpec {
    fn default() -> Self {
        NetStimSpec {
            pop: "VPM_sTC".to_string(),
            ynorm: [0.0, 1.0],
            sec: "soma".to_string(),
            loc: 0.5,
            syn_mech: vec!["AMPA_Th".to_string()],
            syn_mech_weight_factor: vec![1.0],
            start_ms: 0.0,
            interval_ms: 0.1,
            noise: 1.0,
            number: 100,
            weight: 0.005,
            delay_ms: 0.0,
        }
    }
}

// No deny_unknown_fields here: serde cannot combine it with flatten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetedNetStimSpec {
    #[serde(flatten)]
    pub stim: NetStimSpec,
    pub target_cells: Vec<u32>,
}

impl Default for TargetedNetStimSpec {
    fn default() -> Self {
        TargetedNetStimSpec {
            stim: NetStimSpec {
                pop: "VPL_sTC".to_string(),
                start_ms: 1500.0,
                interval_ms: 75.0,
                number: 15,
                weight: 20.0,
                ..NetStimSpec::default()
            },
            target_cells: (0..100).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StimSection {
    /// Spontaneous background synapses.
    pub add_stim_syn: bool,
    pub rate_stim_e_hz: f64,
    pub rate_stim_i_hz: f64,
    pub add_iclamp: bool,
    pub iclamps: Vec<IClampSpec>,
    pub add_net_stim: bool,
    pub net_stims: Vec<NetStimSpec>,
    pub add_targeted_net_stim: bool,
    pub targeted_net_stims: Vec<TargetedNetStimSpec>,
}

impl Default for StimSection {
    fn default() -> Self {
        let mut iclamps = vec![
            IClampSpec {
                pop: "VPM_sTC".to_string(),
                sec: "soma".to_string(),
                loc: 0.5,
                start_ms: 0.0,
                dur_ms: 5.0,
                amp_na: 5.0,
            },
            IClampSpec {
                pop: "VPM_TC".to_string(),
                sec: "soma".to_string(),
                loc: 0.5,
                start_ms: 5.0,
                dur_ms: 5.0,
                amp_na: 5.0,
            },
        ];
        iclamps.extend(rhythmic_pulses("VPM_sTC", 9000.0, 20, 100.0, 25.0, -0.1));
        StimSection {
            add_stim_syn: true,
            rate_stim_e_hz: 9.0,
            rate_stim_i_hz: 9.0,
            add_iclamp: true,
            iclamps,
            add_net_stim: false,
            net_stims: Vec::new(),
            add_targeted_net_stim: false,
            targeted_net_stims: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceSpec {
    pub name: String,
    pub sec: String,
    pub loc: f64,
    pub var: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RecordSection {
    pub traces: Vec<TraceSpec>,
    pub record_step_ms: f64,
    pub record_stim: bool,
    pub record_time: bool,
    pub cells_rec: RecordMode,
}

impl Default for RecordSection {
    fn default() -> Self {
        RecordSection {
            traces: vec![TraceSpec {
                name: "V_soma".to_string(),
                sec: "soma".to_string(),
                loc: 0.5,
                var: "v".to_string(),
            }],
            record_step_ms: 0.1,
            record_stim: false,
            record_time: false,
            cells_rec: RecordMode::SpreadPerMeType,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveDataKind {
    SimData,
    SimConfig,
    NetParams,
    Net,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SaveSection {
    /// Result bundles land in `{folder_base}/{sim_label}`.
    pub folder_base: PathBuf,
    pub save_json: bool,
    pub save_data_include: Vec<SaveDataKind>,
    pub gather_only_sim_data: bool,
    pub save_cell_secs: bool,
    pub save_cell_conns: bool,
    pub backup_cfg: bool,
}

impl Default for SaveSection {
    fn default() -> Self {
        SaveSection {
            folder_base: PathBuf::from("../data"),
            save_json: true,
            save_data_include: vec![
                SaveDataKind::SimData,
                SaveDataKind::SimConfig,
                SaveDataKind::NetParams,
                SaveDataKind::Net,
            ],
            gather_only_sim_data: false,
            save_cell_secs: false,
            save_cell_conns: false,
            backup_cfg: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RasterSpec {
    /// Populations to include; empty means every population.
    pub include: Vec<String>,
    /// Plot window; the full run when absent.
    pub time_range_ms: Option<[f64; 2]>,
    pub order_inverse: bool,
    pub pop_rates: bool,
    pub fig_size: [f64; 2],
    pub font_size: u32,
    pub line_width: f64,
    pub marker: String,
    pub marker_size: f64,
    pub dpi: u32,
    pub save_fig: bool,
    pub show_fig: bool,
}

impl Default for RasterSpec {
    fn default() -> Self {
        RasterSpec {
            include: Vec::new(),
            time_range_ms: None,
            order_inverse: true,
            pop_rates: false,
            fig_size: [24.0, 12.0],
            font_size: 12,
            line_width: 1.0,
            marker: ".".to_string(),
            marker_size: 2.0,
            dpi: 100,
            save_fig: true,
            show_fig: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OneFigPer {
    Cell,
    Trace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TracesPlotSpec {
    pub one_fig_per: OneFigPer,
    pub overlay: bool,
    pub time_range_ms: Option<[f64; 2]>,
    pub ylim_mv: [f64; 2],
    pub fig_size: [f64; 2],
    pub save_fig: bool,
    pub show_fig: bool,
}

impl Default for TracesPlotSpec {
    fn default() -> Self {
        TracesPlotSpec {
            one_fig_per: OneFigPer::Cell,
            overlay: true,
            time_range_ms: None,
            ylim_mv: [-100.0, 50.0],
            fig_size: [12.0, 4.0],
            save_fig: true,
            show_fig: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SpikeHistSpec {
    /// Each inner list is binned together as one group.
    pub include: Vec<Vec<String>>,
    pub bin_ms: f64,
    pub time_range_ms: [f64; 2],
    pub measure: HistMeasure,
    pub graph_type: String,
    pub fig_size: [f64; 2],
    pub font_size: u32,
    pub line_width: f64,
    pub legend: bool,
    pub dpi: u32,
    pub save_fig: bool,
    pub show_fig: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistMeasure {
    Rate,
    Count,
}

impl Default for SpikeHistSpec {
    fn default() -> Self {
        SpikeHistSpec {
            include: vec![vec!["VPM_sTC".to_string(), "VPM_TC".to_string()]],
            bin_ms: 1.0,
            time_range_ms: [8000.0, 12000.0],
            measure: HistMeasure::Rate,
            graph_type: "bar".to_string(),
            fig_size: [18.0, 6.0],
            font_size: 12,
            line_width: 5.0,
            legend: false,
            dpi: 300,
            save_fig: true,
            show_fig: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AnalysisSection {
    pub raster: Option<RasterSpec>,
    pub traces: Option<TracesPlotSpec>,
    pub spike_hist: Option<SpikeHistSpec>,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        AnalysisSection {
            raster: Some(RasterSpec::default()),
            traces: Some(TracesPlotSpec::default()),
            spike_hist: Some(SpikeHistSpec::default()),
        }
    }
}

/// Launcher-side description of the external solver process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SolverSection {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub mpi_command: String,
    pub ranks: u32,
}

impl Default for SolverSection {
    fn default() -> Self {
        SolverSection {
            program: PathBuf::from("x86_64/special"),
            args: vec!["-mpi".to_string()],
            mpi_command: "mpirun".to_string(),
            ranks: 6,
        }
    }
}

/// The full simulation configuration. Write-once at startup, read-many;
/// every field round-trips through YAML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimConfig {
    pub run: RunSection,
    pub geometry: GeometrySection,
    pub cells: CellsSection,
    pub conn: ConnSection,
    pub stim: StimSection,
    pub record: RecordSection,
    pub save: SaveSection,
    pub analysis: AnalysisSection,
    pub solver: SolverSection,
}

impl SimConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CfgError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CfgError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| CfgError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CfgError> {
        let path = path.as_ref();
        let text = serde_yaml::to_string(self)?;
        std::fs::write(path, text).map_err(|source| CfgError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_folder(&self) -> PathBuf {
        self.save.folder_base.join(&self.run.sim_label)
    }

    pub fn config_digest(&self) -> Result<[u8; 32], CfgError> {
        let text = serde_yaml::to_string(self)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(CFG_DIGEST_DOMAIN.as_bytes());
        hasher.update(text.as_bytes());
        Ok(*hasher.finalize().as_bytes())
    }
}

/// Checks every cross-reference and numeric range the solver cannot be
/// trusted to diagnose early.
pub fn validate(cfg: &SimConfig, circuit: &CircuitCells) -> Result<(), CfgError> {
    require_positive("run.duration_ms", cfg.run.duration_ms)?;
    require_positive("run.dt_ms", cfg.run.dt_ms)?;
    require_positive("record.record_step_ms", cfg.record.record_step_ms)?;
    require_positive("geometry.scale_density", cfg.geometry.scale_density)?;
    if cfg.solver.ranks == 0 {
        return Err(CfgError::NonPositive {
            field: "solver.ranks",
            value: 0.0,
        });
    }
    if cfg.cells.cortical_pops.is_empty() && cfg.cells.thalamic_pops.is_empty() {
        return Err(CfgError::Empty {
            field: "cells.cortical_pops",
        });
    }

    require_fraction("conn.thalamus.rtn_rtn.prob", cfg.conn.thalamus.rtn_rtn.prob)?;
    require_fraction("conn.thalamus.tc_rtn.prob", cfg.conn.thalamus.tc_rtn.prob)?;
    require_fraction("conn.thalamus.rtn_tc.prob", cfg.conn.thalamus.rtn_tc.prob)?;
    require_fraction("conn.th_to_s1.frac", cfg.conn.th_to_s1.frac)?;
    require_fraction("conn.use_frac.e_i_proximal", cfg.conn.use_frac.e_i_proximal)?;
    require_fraction("conn.use_frac.inh", cfg.conn.use_frac.inh)?;
    require_fraction("conn.use_frac.e_e", cfg.conn.use_frac.e_e)?;
    require_fraction("conn.use_frac.e_i_distal", cfg.conn.use_frac.e_i_distal)?;

    for (pop, enabled) in &cfg.conn.th_to_s1.sources {
        if *enabled && !circuit.contains(pop) {
            return Err(CfgError::UnknownPopulation {
                context: "conn.th_to_s1.sources",
                pop: pop.clone(),
            });
        }
    }

    if cfg.stim.add_iclamp {
        for clamp in &cfg.stim.iclamps {
            if !circuit.contains(&clamp.pop) {
                return Err(CfgError::UnknownPopulation {
                    context: "stim.iclamps",
                    pop: clamp.pop.clone(),
                });
            }
            require_fraction("stim.iclamps.loc", clamp.loc)?;
            if clamp.dur_ms < 0.0 || clamp.start_ms < 0.0 {
                return Err(CfgError::NonPositive {
                    field: "stim.iclamps.start_ms/dur_ms",
                    value: clamp.dur_ms.min(clamp.start_ms),
                });
            }
        }
    }
    if cfg.stim.add_net_stim {
        for stim in &cfg.stim.net_stims {
            if !circuit.contains(&stim.pop) {
                return Err(CfgError::UnknownPopulation {
                    context: "stim.net_stims",
                    pop: stim.pop.clone(),
                });
            }
            require_positive("stim.net_stims.interval_ms", stim.interval_ms)?;
        }
    }
    if cfg.stim.add_targeted_net_stim {
        for stim in &cfg.stim.targeted_net_stims {
            if !circuit.contains(&stim.stim.pop) {
                return Err(CfgError::UnknownPopulation {
                    context: "stim.targeted_net_stims",
                    pop: stim.stim.pop.clone(),
                });
            }
            require_positive(
                "stim.targeted_net_stims.interval_ms",
                stim.stim.interval_ms,
            )?;
        }
    }

    if let Some(raster) = &cfg.analysis.raster {
        for pop in &raster.include {
            if !circuit.contains(pop) {
                return Err(CfgError::UnknownPopulation {
                    context: "analysis.raster.include",
                    pop: pop.clone(),
                });
            }
        }
    }
    if let Some(hist) = &cfg.analysis.spike_hist {
        require_positive("analysis.spike_hist.bin_ms", hist.bin_ms)?;
        for group in &hist.include {
            for pop in group {
                if !circuit.contains(pop) {
                    return Err(CfgError::UnknownPopulation {
                        context: "analysis.spike_hist.include",
                        pop: pop.clone(),
                    });
                }
            }
        }
    }

    if cfg.save.save_json && cfg.save.save_data_include.is_empty() {
        return Err(CfgError::Empty {
            field: "save.save_data_include",
        });
    }
    Ok(())
}

fn require_positive(field: &'static str, value: f64) -> Result<(), CfgError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(CfgError::NonPositive { field, value })
    }
}

fn require_fraction(field: &'static str, value: f64) -> Result<(), CfgError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CfgError::OutOfRange { field, value })
    }
}
