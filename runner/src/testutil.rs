use crate::catalog::{Catalog, SharedCatalog};
use crate::config::Config;
use crate::manager::{mock::MockManager, ResourceManager};
use crate::runmanager::RunManager;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// fresh scratch directory under the system temp dir
pub fn scratch_dir(tag: &str) -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let unique = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "simflow-test-{tag}-{}-{unique}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// one case over years 1-10: climo and diags on five year windows, one
/// atm timeseries over the full range
pub fn sample_config(project: &Path) -> Config {
    let yaml = format!(
        r#"
global:
  project_path: {project}
  serial: true
  max_jobs: 2
simulations:
  start_year: 1
  end_year: 10
  cases:
    case.A:
      short_name: caseA
      job_types: [all]
      data_types: [all]
      comparisons: [obs]
data_types:
  atm:
    file_format: "CASEID.cam.h0.YEAR-MONTH.nc"
    local_path: "PROJECT_PATH/input/CASEID/atm"
    monthly: true
post_processing:
  climo:
    run_frequency: [5]
    destination_grid_name: fv129x256
    regrid_map_path: "{project}/maps/atm_to_fv.nc"
  timeseries:
    run_frequency: [10]
    streams:
      atm: [T, PRECT]
diags:
  e3sm_diags:
    run_frequency: [5]
"#,
        project = project.display()
    );
    serde_yaml::from_str(&yaml).unwrap()
}

/// in-memory catalog, populated, with a mock scheduler backend and the
/// graph fully built and resolved
pub fn build_run(config: Config) -> RunManager {
    let catalog = SharedCatalog::new(Catalog::in_memory(&config).unwrap());
    catalog.populate(&config).unwrap();
    let mut run = RunManager::new(config, catalog, ResourceManager::Mock(MockManager::default()));
    run.build_graph().unwrap();
    run.resolve_dependencies().unwrap();
    run
}

/// drop the expected raw atm files onto disk so readiness checks pass
pub fn seed_atm_files(project: &Path, case: &str, start: i32, end: i32) {
    let dir = project.join("input").join(case).join("atm");
    fs::create_dir_all(&dir).unwrap();
    for year in start..=end {
        for month in 1..=12 {
            let name = format!("{case}.cam.h0.{year:04}-{month:02}.nc");
            fs::write(dir.join(name), b"").unwrap();
        }
    }
}

/// the 17 climatology mean files one window produces
pub fn seed_climo_files(dir: &Path, case: &str, start: i32, end: i32) {
    fs::create_dir_all(dir).unwrap();
    for month in 1..=12 {
        let name = format!("{case}_{month:02}_{start:04}{month:02}_{end:04}{month:02}_climo.nc");
        fs::write(dir.join(name), b"").unwrap();
    }
    for season in ["ANN", "DJF", "MAM", "JJA", "SON"] {
        let name = format!("{case}_{season}_{start:04}01_{end:04}12_climo.nc");
        fs::write(dir.join(name), b"").unwrap();
    }
}

pub fn mock(run: &RunManager) -> &MockManager {
    match &run.manager {
        ResourceManager::Mock(mock) => mock,
        _ => panic!("test run manager is not using the mock backend"),
    }
}
