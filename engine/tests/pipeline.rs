use circuit_cells::CellDistribution;
use circuit_cfg::SimConfig;
use engine::plan::ConnKind;
use engine::{
    build_plan, pop_avg_rates, run_pipeline, spike_histogram, PathwayClass, PlanBackend, Spike,
};

const TABLE: &str = "\
L5_SBC_bNAC219_1 L5_SBC bNAC219 25 102
L5_SBC_cNAC187_1 L5_SBC cNAC187 77 102
L5_TTPC2_cADpyr232_1 L5_TTPC2 cADpyr232 2403 2403
L6_SBC_bNAC219_1 L6_SBC bNAC219 34 67
L6_TPC_L4_cADpyr231_1 L6_TPC_L4 cADpyr231 1637 1637
";

fn test_cfg(name: &str) -> (SimConfig, CellDistribution) {
    let mut cfg = SimConfig::default();
    cfg.run.sim_label = format!("{name}_{}", std::process::id());
    cfg.save.folder_base = std::env::temp_dir().join("s1th_engine_tests");
    (cfg, CellDistribution::parse(TABLE).unwrap())
}

#[test]
fn plan_assigns_contiguous_gid_blocks() {
    let (cfg, dist) = test_cfg("gid_blocks");
    let (_circuit, plan) = build_plan(&cfg, &dist).unwrap();

    // Five density-floored cortical me-types plus the thalamic pops.
    assert_eq!(plan.pops.len(), 5 + 3);
    let mut expected_gid = 0;
    for pop in &plan.pops {
        assert_eq!(pop.first_gid, expected_gid);
        expected_gid += pop.cell_count as u64;
    }
    assert_eq!(plan.total_cells(), 5 + 748 + 822 + 822);
    assert_eq!(
        plan.pop_for_gid(5).unwrap().me_label,
        "ss_RTN_m",
        "first thalamic gid follows the cortical block"
    );
}

#[test]
fn plan_flattens_enabled_pathways() {
    let (cfg, dist) = test_cfg("pathways");
    let (_circuit, plan) = build_plan(&cfg, &dist).unwrap();

    let intra: Vec<_> = plan
        .conn_rules
        .iter()
        .filter(|rule| rule.class == PathwayClass::IntraThalamic)
        .collect();
    // RTN->RTN (1x1), TC->RTN (2x1), RTN->TC (1x2).
    assert_eq!(intra.len(), 1 + 2 + 2);
    let rtn_rtn = intra
        .iter()
        .find(|rule| rule.source == "ss_RTN_m" && rule.target == "ss_RTN_m")
        .unwrap();
    assert_eq!(rtn_rtn.weight, 2.0);
    assert_eq!(rtn_rtn.kind, ConnKind::Prob(0.5));

    // One enabled relay source times four cortical targets.
    let th_s1 = plan
        .conn_rules
        .iter()
        .filter(|rule| rule.class == PathwayClass::ThalamoCortical)
        .count();
    assert_eq!(th_s1, 4);

    // Four cortical sources times (one RTN + two relay) targets.
    let s1_th = plan
        .conn_rules
        .iter()
        .filter(|rule| rule.class == PathwayClass::CorticoThalamic)
        .count();
    assert_eq!(s1_th, 12);
}

#[test]
fn disabling_conn_empties_the_rule_set() {
    let (mut cfg, dist) = test_cfg("no_conn");
    cfg.conn.add_conn = false;
    let (_circuit, plan) = build_plan(&cfg, &dist).unwrap();
    assert!(plan.conn_rules.is_empty());
    assert!(plan.cortical.is_none());
}

#[test]
fn gain_scales_thalamic_weights() {
    let (mut cfg, dist) = test_cfg("gain");
    cfg.conn.thalamus.gain = 0.5;
    let (_circuit, plan) = build_plan(&cfg, &dist).unwrap();
    let rtn_rtn = plan
        .conn_rules
        .iter()
        .find(|rule| rule.source == "ss_RTN_m" && rule.target == "ss_RTN_m")
        .unwrap();
    assert_eq!(rtn_rtn.weight, 1.0);
}

#[test]
fn pipeline_runs_stages_in_order_and_saves_bundle() {
    let (cfg, dist) = test_cfg("stages");
    let spikes = vec![
        Spike {
            time_ms: 10.5,
            gid: 5,
        },
        Spike {
            time_ms: 2.0,
            gid: 0,
        },
    ];
    let mut backend = PlanBackend::with_spikes(spikes);
    let report = run_pipeline(&cfg, &dist, &mut backend).unwrap();

    assert_eq!(
        backend.stages,
        vec![
            "create_pops",
            "create_cells",
            "connect_cells",
            "add_stims",
            "setup_recording",
            "run",
            "gather",
        ]
    );
    assert_eq!(report.spike_count, 2);
    assert_eq!(report.total_cells, 5 + 748 + 822 + 822);
    // Two onset pulses, twenty rhythmic pulses, background drive.
    assert_eq!(report.stims, 23);

    let bundle = cfg
        .save_folder()
        .join(format!("{}_data.json", cfg.run.sim_label));
    assert!(report.outputs.contains(&bundle));
    let text = std::fs::read_to_string(&bundle).unwrap();
    assert!(text.contains("\"sim_data\""));
    assert!(text.contains("\"pop_rates\""));

    std::fs::remove_dir_all(cfg.save_folder()).ok();
}

#[test]
fn pipeline_report_digest_is_deterministic() {
    let (cfg, dist) = test_cfg("digest");
    let spikes = vec![
        Spike {
            time_ms: 1.0,
            gid: 3,
        },
        Spike {
            time_ms: 4.0,
            gid: 1,
        },
    ];
    let mut backend_a = PlanBackend::with_spikes(spikes.clone());
    let mut backend_b = PlanBackend::with_spikes(spikes);
    let report_a = run_pipeline(&cfg, &dist, &mut backend_a).unwrap();
    let report_b = run_pipeline(&cfg, &dist, &mut backend_b).unwrap();
    assert_eq!(report_a.run_digest, report_b.run_digest);
    std::fs::remove_dir_all(cfg.save_folder()).ok();
}

#[test]
fn pop_rates_count_spikes_per_gid_block() {
    let (cfg, dist) = test_cfg("rates");
    let (_circuit, plan) = build_plan(&cfg, &dist).unwrap();

    // Two spikes from the single L5_SBC_bNA cell (gid 0), one from the
    // reticular block starting at gid 5.
    let spikes = vec![
        Spike {
            time_ms: 100.0,
            gid: 0,
        },
        Spike {
            time_ms: 200.0,
            gid: 0,
        },
        Spike {
            time_ms: 300.0,
            gid: 5,
        },
    ];
    let rates = pop_avg_rates(&plan, &spikes);
    let sbc = rates.iter().find(|r| r.me_label == "L5_SBC_bNA").unwrap();
    assert_eq!(sbc.spikes, 2);
    // Two spikes over one cell in a 12 s run.
    assert!((sbc.rate_hz - 2.0 / 12.0).abs() < 1e-12);

    let rtn = rates.iter().find(|r| r.me_label == "ss_RTN_m").unwrap();
    assert_eq!(rtn.spikes, 1);
}

#[test]
fn spike_histogram_bins_group_rates() {
    let (cfg, dist) = test_cfg("hist");
    let (_circuit, plan) = build_plan(&cfg, &dist).unwrap();
    let spec = cfg.analysis.spike_hist.clone().unwrap();

    let relay_start = plan
        .pops
        .iter()
        .find(|pop| pop.me_label == "VPM_sTC")
        .unwrap()
        .first_gid;
    let spikes = vec![
        // Inside the window, in the relay block.
        Spike {
            time_ms: 8000.5,
            gid: relay_start,
        },
        Spike {
            time_ms: 8000.9,
            gid: relay_start + 1,
        },
        // Outside the window.
        Spike {
            time_ms: 100.0,
            gid: relay_start,
        },
        // Inside the window, cortical gid: not in the group.
        Spike {
            time_ms: 8000.5,
            gid: 0,
        },
    ];
    let group = vec!["VPM_sTC".to_string(), "VPM_TC".to_string()];
    let series = spike_histogram(&plan, &spikes, &spec, &group);
    assert_eq!(series.len(), 4000);
    assert_eq!(series[0].0, 8000.0);
    // Two spikes over 1644 relay cells in a 1 ms bin.
    let expected = 2.0 / (1644.0 * 0.001);
    assert!((series[0].1 - expected).abs() < 1e-9);
    assert!(series[1].1 == 0.0);
}
