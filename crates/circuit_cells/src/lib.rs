#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const DISTRIBUTION_FIELDS: usize = 5;
const ME_ETYPE_PREFIX_LEN: usize = 3;

/// Number of cells recorded per me-type when the spread mode is active.
pub const SPREAD_RECORD_COUNT: u32 = 5;

/// Hexagonal column radius of the source mouse model, in micrometers.
pub const MOUSE_COLUMN_RADIUS_UM: f64 = 150.0;
/// Hexagonal column radius of the rat target circuit, in micrometers.
pub const RAT_COLUMN_RADIUS_UM: f64 = 210.0;

#[derive(Debug, Error)]
pub enum CellsError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected {DISTRIBUTION_FIELDS} fields, found {found}")]
    FieldCount { line: usize, found: usize },
    #[error("line {line}: invalid count {value:?}")]
    InvalidCount { line: usize, value: String },
    #[error("line {line}: e-type {value:?} shorter than {ME_ETYPE_PREFIX_LEN} characters")]
    ShortEType { line: usize, value: String },
    #[error("unknown population {0:?}")]
    UnknownPop(String),
    #[error("duplicate population {0:?} in thalamic set")]
    DuplicatePop(String),
}

/// One morpho-electrical type row of the distribution table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeTypeRecord {
    /// Derived label, `{mtype}_{etype prefix}`.
    pub me_label: String,
    /// Full cell model name as listed in the table.
    pub cell_name: String,
    /// Parent morphological population.
    pub pop: String,
    pub cell_count: u32,
}

/// A morphological population and its me-type members, in table order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopRecord {
    pub name: String,
    pub pop_count: u32,
    pub me_members: Vec<String>,
}

/// The full cell-type distribution table, as loaded from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellDistribution {
    pub me_types: Vec<MeTypeRecord>,
    pub pops: Vec<PopRecord>,
}

impl CellDistribution {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CellsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CellsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses the whitespace-delimited table, one me-type per row:
    /// `cell_name mtype etype cell_count pop_count`.
    pub fn parse(text: &str) -> Result<Self, CellsError> {
        let mut dist = CellDistribution::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            if raw.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = raw.split_whitespace().collect();
            if fields.len() != DISTRIBUTION_FIELDS {
                return Err(CellsError::FieldCount {
                    line,
                    found: fields.len(),
                });
            }
            let cell_name = fields[0];
            let mtype = fields[1];
            let etype = fields[2];
            let cell_count = parse_count(fields[3], line)?;
            let pop_count = parse_count(fields[4], line)?;
            if etype.len() < ME_ETYPE_PREFIX_LEN {
                return Err(CellsError::ShortEType {
                    line,
                    value: etype.to_string(),
                });
            }
            let me_label = format!("{}_{}", mtype, &etype[..ME_ETYPE_PREFIX_LEN]);

            dist.me_types.push(MeTypeRecord {
                me_label: me_label.clone(),
                cell_name: cell_name.to_string(),
                pop: mtype.to_string(),
                cell_count,
            });
            match dist.pops.iter_mut().find(|pop| pop.name == mtype) {
                Some(pop) => {
                    pop.pop_count = pop_count;
                    pop.me_members.push(me_label);
                }
                None => dist.pops.push(PopRecord {
                    name: mtype.to_string(),
                    pop_count,
                    me_members: vec![me_label],
                }),
            }
        }
        Ok(dist)
    }

    pub fn pop(&self, name: &str) -> Option<&PopRecord> {
        self.pops.iter().find(|pop| pop.name == name)
    }

    pub fn me_type(&self, label: &str) -> Option<&MeTypeRecord> {
        self.me_types.iter().find(|me| me.me_label == label)
    }
}

/// A thalamic population: no me-type diversity, label doubles as me label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThalamicPop {
    pub name: String,
    pub cell_count: u32,
}

/// Rescales a nominal mouse-column cell count to the rat column area.
/// Truncates, matching the source model tables.
pub fn area_rescaled_count(mouse_count: f64) -> u32 {
    let ratio = (RAT_COLUMN_RADIUS_UM * RAT_COLUMN_RADIUS_UM)
        / (MOUSE_COLUMN_RADIUS_UM * MOUSE_COLUMN_RADIUS_UM);
    (mouse_count * ratio) as u32
}

/// The default thalamic population set: one reticular-nucleus population
/// and a matched pair of ventral-posteromedial relay populations.
pub fn default_thalamic_pops() -> Vec<ThalamicPop> {
    vec![
        ThalamicPop {
            name: "ss_RTN_m".to_string(),
            cell_count: area_rescaled_count(382.0),
        },
        ThalamicPop {
            name: "VPM_sTC".to_string(),
            cell_count: area_rescaled_count(0.5 * 839.0),
        },
        ThalamicPop {
            name: "VPM_TC".to_string(),
            cell_count: area_rescaled_count(0.5 * 839.0),
        },
    ]
}

/// Density scaling applied to cortical me-type counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DensityScaling {
    pub factor: f64,
    /// Scaled counts below this collapse to a single cell per me-type.
    pub floor_threshold: u32,
}

impl DensityScaling {
    pub fn scaled_count(&self, nominal: u32) -> u32 {
        let scaled = (self.factor * nominal as f64).ceil() as u32;
        if scaled < self.floor_threshold {
            1
        } else {
            scaled.max(1)
        }
    }
}

/// The instantiable circuit: selected cortical populations with final
/// (density-scaled) counts plus the thalamic populations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitCells {
    pub pops: Vec<PopRecord>,
    pub me_types: Vec<MeTypeRecord>,
}

impl CircuitCells {
    pub fn contains(&self, name: &str) -> bool {
        self.pops.iter().any(|pop| pop.name == name)
            || self.me_types.iter().any(|me| me.me_label == name)
    }

    pub fn me_type(&self, label: &str) -> Option<&MeTypeRecord> {
        self.me_types.iter().find(|me| me.me_label == label)
    }

    /// Labels of every instantiable me-type, cortical then thalamic.
    pub fn all_me_labels(&self) -> Vec<String> {
        self.me_types.iter().map(|me| me.me_label.clone()).collect()
    }

    pub fn total_cells(&self) -> u64 {
        self.me_types.iter().map(|me| me.cell_count as u64).sum()
    }
}

/// Builds the circuit from a distribution table: keeps the named cortical
/// populations (with their me-types density-scaled), then appends the
/// thalamic populations at their fixed counts.
pub fn build_circuit(
    dist: &CellDistribution,
    cortical_pops: &[String],
    thalamic_pops: &[ThalamicPop],
    scaling: DensityScaling,
) -> Result<CircuitCells, CellsError> {
    let mut circuit = CircuitCells::default();
    for name in cortical_pops {
        let pop = dist
            .pop(name)
            .ok_or_else(|| CellsError::UnknownPop(name.clone()))?;
        circuit.pops.push(pop.clone());
    }
    for me in &dist.me_types {
        if cortical_pops.iter().any(|name| *name == me.pop) {
            let mut scaled = me.clone();
            scaled.cell_count = scaling.scaled_count(me.cell_count);
            circuit.me_types.push(scaled);
        }
    }
    for thal in thalamic_pops {
        if circuit.contains(&thal.name) {
            return Err(CellsError::DuplicatePop(thal.name.clone()));
        }
        circuit.pops.push(PopRecord {
            name: thal.name.clone(),
            pop_count: thal.cell_count,
            me_members: vec![thal.name.clone()],
        });
        circuit.me_types.push(MeTypeRecord {
            me_label: thal.name.clone(),
            cell_name: thal.name.clone(),
            pop: thal.name.clone(),
            cell_count: thal.cell_count,
        });
    }
    Ok(circuit)
}

/// How cells are chosen for trace recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordMode {
    /// Record whole populations, no per-cell indices.
    AllPops,
    /// The first cell of every me-type.
    OnePerPop,
    /// Up to five evenly spread cells per me-type.
    SpreadPerMeType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCell {
    pub me_label: String,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordSelection {
    Pops(Vec<String>),
    Cells(Vec<RecordCell>),
}

impl RecordSelection {
    pub fn len(&self) -> usize {
        match self {
            RecordSelection::Pops(pops) => pops.len(),
            RecordSelection::Cells(cells) => cells.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Selects the record set for a circuit under the given mode.
pub fn record_cells(circuit: &CircuitCells, mode: RecordMode) -> RecordSelection {
    match mode {
        RecordMode::AllPops => RecordSelection::Pops(circuit.all_me_labels()),
        RecordMode::OnePerPop => RecordSelection::Cells(
            circuit
                .me_types
                .iter()
                .map(|me| RecordCell {
                    me_label: me.me_label.clone(),
                    index: 0,
                })
                .collect(),
        ),
        RecordMode::SpreadPerMeType => {
            let mut cells = Vec::new();
            for me in &circuit.me_types {
                for index in spread_indices(me.cell_count) {
                    cells.push(RecordCell {
                        me_label: me.me_label.clone(),
                        index,
                    });
                }
            }
            RecordSelection::Cells(cells)
        }
    }
}

/// Approximately evenly spaced indices into `0..n`, at most
/// `SPREAD_RECORD_COUNT` of them. For `n` not divisible by five the first
/// `n mod 5` strides are one longer, starting at index 0.
pub fn spread_indices(n: u32) -> Vec<u32> {
    if n < SPREAD_RECORD_COUNT {
        return (0..n).collect();
    }
    let base = n / SPREAD_RECORD_COUNT;
    let remainder = n % SPREAD_RECORD_COUNT;
    let mut indices = Vec::with_capacity(SPREAD_RECORD_COUNT as usize);
    let mut index = 0;
    for step in 0..SPREAD_RECORD_COUNT {
        indices.push(index);
        index += if step < remainder { base + 1 } else { base };
    }
    indices
}

fn parse_count(field: &str, line: usize) -> Result<u32, CellsError> {
    field.parse().map_err(|_| CellsError::InvalidCount {
        line,
        value: field.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
L5_SBC_bNAC219_1 L5_SBC bNAC219 25 102
L5_SBC_cNAC187_1 L5_SBC cNAC187 77 102
L5_TTPC2_cADpyr232_1 L5_TTPC2 cADpyr232 2403 2403
L6_SBC_bNAC219_1 L6_SBC bNAC219 34 67
";

    #[test]
    fn parse_derives_me_labels_and_membership() {
        let dist = CellDistribution::parse(TABLE).unwrap();
        assert_eq!(dist.me_types.len(), 4);
        assert_eq!(dist.me_types[0].me_label, "L5_SBC_bNA");
        assert_eq!(dist.me_types[2].me_label, "L5_TTPC2_cAD");
        assert_eq!(dist.pops.len(), 3);

        let sbc = dist.pop("L5_SBC").unwrap();
        assert_eq!(sbc.pop_count, 102);
        assert_eq!(sbc.me_members, vec!["L5_SBC_bNA", "L5_SBC_cNA"]);
    }

    #[test]
    fn parse_reports_offending_line() {
        let err = CellDistribution::parse("a b c 1 2\nbad row\n").unwrap_err();
        match err {
            CellsError::FieldCount { line, found } => {
                assert_eq!(line, 2);
                assert_eq!(found, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parse_rejects_non_numeric_counts() {
        let err = CellDistribution::parse("a b cde x 2\n").unwrap_err();
        assert!(matches!(err, CellsError::InvalidCount { line: 1, .. }));
    }

    #[test]
    fn thalamic_defaults_match_area_rescale() {
        let pops = default_thalamic_pops();
        assert_eq!(pops[0].cell_count, 748);
        assert_eq!(pops[1].cell_count, 822);
        assert_eq!(pops[2].cell_count, 822);
    }

    #[test]
    fn density_floor_collapses_small_pops_to_one() {
        let scaling = DensityScaling {
            factor: 0.02,
            floor_threshold: 50_000,
        };
        assert_eq!(scaling.scaled_count(2403), 1);
        assert_eq!(scaling.scaled_count(1), 1);

        let unfloored = DensityScaling {
            factor: 0.02,
            floor_threshold: 1,
        };
        assert_eq!(unfloored.scaled_count(2403), 49);
    }

    #[test]
    fn scaled_count_is_never_zero() {
        let scaling = DensityScaling {
            factor: 0.0001,
            floor_threshold: 0,
        };
        assert_eq!(scaling.scaled_count(1), 1);
        assert_eq!(scaling.scaled_count(100), 1);
    }

    #[test]
    fn spread_indices_exact_small_pop() {
        assert_eq!(spread_indices(3), vec![0, 1, 2]);
        assert_eq!(spread_indices(0), Vec::<u32>::new());
    }

    #[test]
    fn spread_indices_remainder_rule() {
        // 12 = 5*2 + 2: two long strides of 3, then strides of 2.
        assert_eq!(spread_indices(12), vec![0, 3, 6, 8, 10]);
        assert_eq!(spread_indices(5), vec![0, 1, 2, 3, 4]);
        assert_eq!(spread_indices(25), vec![0, 5, 10, 15, 20]);
    }

    #[test]
    fn spread_indices_are_increasing_and_in_range() {
        for n in 1..200 {
            let indices = spread_indices(n);
            assert_eq!(indices.len(), n.min(SPREAD_RECORD_COUNT) as usize);
            for pair in indices.windows(2) {
                assert!(pair[0] < pair[1], "n={n}");
            }
            assert!(*indices.last().unwrap() < n, "n={n}");
        }
    }

    #[test]
    fn build_circuit_scales_cortical_and_keeps_thalamic_fixed() {
        let dist = CellDistribution::parse(TABLE).unwrap();
        let circuit = build_circuit(
            &dist,
            &["L5_TTPC2".to_string()],
            &default_thalamic_pops(),
            DensityScaling {
                factor: 0.02,
                floor_threshold: 50_000,
            },
        )
        .unwrap();

        assert_eq!(circuit.me_type("L5_TTPC2_cAD").unwrap().cell_count, 1);
        assert_eq!(circuit.me_type("ss_RTN_m").unwrap().cell_count, 748);
        assert!(circuit.contains("VPM_TC"));
        assert!(!circuit.contains("L5_SBC"));
        assert_eq!(circuit.total_cells(), 1 + 748 + 822 + 822);
    }

    #[test]
    fn build_circuit_rejects_unknown_pop() {
        let dist = CellDistribution::parse(TABLE).unwrap();
        let err = build_circuit(
            &dist,
            &["L4_SS".to_string()],
            &[],
            DensityScaling {
                factor: 1.0,
                floor_threshold: 0,
            },
        )
        .unwrap_err();
        assert!(matches!(err, CellsError::UnknownPop(name) if name == "L4_SS"));
    }

    #[test]
    fn record_selection_modes() {
        let dist = CellDistribution::parse(TABLE).unwrap();
        let circuit = build_circuit(
            &dist,
            &["L5_SBC".to_string()],
            &[ThalamicPop {
                name: "VPM_TC".to_string(),
                cell_count: 12,
            }],
            DensityScaling {
                factor: 1.0,
                floor_threshold: 0,
            },
        )
        .unwrap();

        match record_cells(&circuit, RecordMode::AllPops) {
            RecordSelection::Pops(pops) => {
                assert_eq!(pops, vec!["L5_SBC_bNA", "L5_SBC_cNA", "VPM_TC"]);
            }
            other => panic!("unexpected selection: {other:?}"),
        }

        match record_cells(&circuit, RecordMode::OnePerPop) {
            RecordSelection::Cells(cells) => {
                assert_eq!(cells.len(), 3);
                assert!(cells.iter().all(|cell| cell.index == 0));
            }
            other => panic!("unexpected selection: {other:?}"),
        }

        match record_cells(&circuit, RecordMode::SpreadPerMeType) {
            RecordSelection::Cells(cells) => {
                // 25 and 77 cells give five each, 12 gives five.
                assert_eq!(cells.len(), 15);
                let vpm: Vec<u32> = cells
                    .iter()
                    .filter(|cell| cell.me_label == "VPM_TC")
                    .map(|cell| cell.index)
                    .collect();
                assert_eq!(vpm, vec![0, 3, 6, 8, 10]);
            }
            other => panic!("unexpected selection: {other:?}"),
        }
    }
}
