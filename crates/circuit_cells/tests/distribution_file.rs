use circuit_cells::CellDistribution;
use std::path::Path;

#[test]
fn shipped_distribution_table_parses() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../cells/S1-cells-distributions-Rat.txt");
    let dist = CellDistribution::load(path).unwrap();

    for pop in ["L5_SBC", "L5_TTPC2", "L6_SBC", "L6_TPC_L4"] {
        assert!(dist.pop(pop).is_some(), "missing population {pop}");
    }

    for pop in &dist.pops {
        let total: u32 = pop
            .me_members
            .iter()
            .map(|label| dist.me_type(label).unwrap().cell_count)
            .sum();
        assert_eq!(total, pop.pop_count, "population {}", pop.name);
    }
}
