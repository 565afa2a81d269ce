use circuit_batch::{
    bundle_path, presets, Batch, BatchSpec, JobScript, ParamGrid, RunnerConfig, SubmitOutcome,
};
use circuit_cfg::SimConfig;
use serde_yaml::Value;

fn temp_batch_dir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("s1th_batch_{}_{}", name, std::process::id()))
}

fn slurm_runner(folder: &std::path::Path) -> RunnerConfig {
    RunnerConfig::HpcSlurm {
        allocation: "TG-IBN140002".to_string(),
        partition: "compute".to_string(),
        walltime: "12:00:00".to_string(),
        nodes: 4,
        cores_per_node: 128,
        email: "user@example.org".to_string(),
        folder: folder.to_path_buf(),
        custom: "#SBATCH --mem=240G".to_string(),
        skip: true,
    }
}

#[test]
fn prepare_expands_grid_into_labelled_jobs() {
    let mut spec = BatchSpec::new(
        "v8_batch3",
        presets::seed_sweep(),
        RunnerConfig::MpiBulletin { skip: true },
    );
    spec.save_folder = temp_batch_dir("prepare");
    let batch = Batch::new(spec, SimConfig::default());

    let jobs = batch.prepare().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].label, "v8_batch3_0_0");
    assert_eq!(jobs[0].cfg.run.sim_label, "v8_batch3_0_0");
    assert_eq!(jobs[0].cfg.run.seeds.conn, 4321);
    assert_eq!(jobs[0].cfg.run.seeds.loc, 4321);
    // The base config is untouched by job overrides.
    assert_eq!(batch.base_cfg.run.seeds.conn, 4322);
}

#[test]
fn job_digests_differ_across_grid_points() {
    let mut grid = ParamGrid::default();
    grid.push(
        "conn.gain.ie",
        vec![Value::from(0.5), Value::from(1.0)],
    );
    let mut spec = BatchSpec::new("digests", grid, RunnerConfig::MpiBulletin { skip: false });
    spec.save_folder = temp_batch_dir("digests");
    let batch = Batch::new(spec, SimConfig::default());

    let jobs = batch.prepare().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_ne!(jobs[0].cfg_digest, jobs[1].cfg_digest);
    assert_eq!(jobs[0].cfg.conn.gain.ie, 0.5);
    assert_eq!(jobs[1].cfg.conn.gain.ie, 1.0);
}

#[test]
fn slurm_script_carries_cluster_directives() {
    let folder = temp_batch_dir("slurm");
    let mut spec = BatchSpec::new("v8_batch4", presets::seed_sweep(), slurm_runner(&folder));
    spec.save_folder = folder.clone();
    let batch = Batch::new(spec, SimConfig::default());

    let jobs = batch.prepare().unwrap();
    let JobScript::Sbatch { path, contents } = &jobs[0].script else {
        panic!("expected an sbatch script");
    };
    assert!(path.ends_with("v8_batch4_0_0.sbatch"));
    assert!(contents.starts_with("#!/bin/bash\n"));
    assert!(contents.contains("#SBATCH --job-name=v8_batch4_0_0"));
    assert!(contents.contains("#SBATCH -A TG-IBN140002"));
    assert!(contents.contains("#SBATCH -t 12:00:00"));
    assert!(contents.contains("#SBATCH --nodes=4"));
    assert!(contents.contains("#SBATCH --ntasks-per-node=128"));
    assert!(contents.contains("#SBATCH --mem=240G"));
    // 4 nodes x 128 cores.
    assert!(contents.contains("mpirun -n 512"));
    assert!(contents.contains("--cfg"));
}

#[test]
fn write_persists_configs_and_manifest() {
    let folder = temp_batch_dir("write");
    let mut spec = BatchSpec::new("v8_write", presets::seed_sweep(), slurm_runner(&folder));
    spec.save_folder = folder.clone();
    let batch = Batch::new(spec, SimConfig::default());

    let jobs = batch.prepare().unwrap();
    batch.write(&jobs).unwrap();

    assert!(folder.join("v8_write_0_0_cfg.yaml").exists());
    assert!(folder.join("v8_write_0_0.sbatch").exists());
    let manifest = std::fs::read_to_string(folder.join("batch_manifest.yaml")).unwrap();
    assert!(manifest.contains("label: v8_write"));
    assert!(manifest.contains("method: grid"));
    assert!(manifest.contains("v8_write_0_0"));

    let job_cfg = SimConfig::load(folder.join("v8_write_0_0_cfg.yaml")).unwrap();
    assert_eq!(job_cfg.run.sim_label, "v8_write_0_0");

    std::fs::remove_dir_all(&folder).ok();
}

#[test]
fn dry_run_submits_nothing() {
    let folder = temp_batch_dir("dry");
    let mut spec = BatchSpec::new(
        "v8_dry",
        presets::seed_sweep(),
        RunnerConfig::MpiDirect {
            cores: 6,
            skip: true,
        },
    );
    spec.save_folder = folder.clone();
    let batch = Batch::new(spec, SimConfig::default());

    let jobs = batch.prepare().unwrap();
    let outcomes = batch.submit(&jobs, true).unwrap();
    assert_eq!(
        outcomes,
        vec![SubmitOutcome::DryRun {
            label: "v8_dry_0_0".to_string()
        }]
    );
}

#[test]
fn existing_bundle_is_skipped() {
    let folder = temp_batch_dir("skip");
    let mut spec = BatchSpec::new(
        "v8_skip",
        presets::seed_sweep(),
        RunnerConfig::MpiDirect {
            cores: 6,
            skip: true,
        },
    );
    spec.save_folder = folder.clone();
    let mut base_cfg = SimConfig::default();
    base_cfg.save.folder_base = folder.clone();
    let batch = Batch::new(spec, base_cfg);

    let jobs = batch.prepare().unwrap();
    let bundle = bundle_path(&jobs[0].cfg);
    std::fs::create_dir_all(bundle.parent().unwrap()).unwrap();
    std::fs::write(&bundle, "{}").unwrap();

    let outcomes = batch.submit(&jobs, false).unwrap();
    assert_eq!(
        outcomes,
        vec![SubmitOutcome::Skipped {
            label: "v8_skip_0_0".to_string()
        }]
    );
    std::fs::remove_dir_all(&folder).ok();
}
