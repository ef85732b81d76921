use crate::config::{render_template, FailurePolicy, RenderVars};
use crate::testutil::{sample_config, scratch_dir};
use std::path::Path;

#[test]
fn sample_config_parses_with_defaults() {
    let project = scratch_dir("config-parse");
    let config = sample_config(&project);

    assert_eq!(config.simulations.start_year, 1);
    assert_eq!(config.simulations.end_year, 10);
    assert!(config.global.serial);
    assert!(!config.global.dryrun);
    assert_eq!(config.global.max_jobs, Some(2));
    assert_eq!(config.global.failure_policy, FailurePolicy::Drain);

    let atm = &config.data_types["atm"];
    assert!(atm.monthly);

    let diags = config.diags.e3sm_diags.as_ref().unwrap();
    assert_eq!(diags.backend, "mpl");

    assert!(!config.preflight_checks());
}

#[test]
fn preflight_rejects_unknown_cross_references() {
    let project = scratch_dir("config-preflight");
    let mut config = sample_config(&project);

    config
        .simulations
        .cases
        .get_mut("case.A")
        .unwrap()
        .comparisons
        .push("case.B".to_owned());
    assert!(config.preflight_checks());
}

#[test]
fn preflight_rejects_unknown_job_types_and_streams() {
    let project = scratch_dir("config-preflight-types");
    let mut config = sample_config(&project);

    config
        .simulations
        .cases
        .get_mut("case.A")
        .unwrap()
        .job_types
        .push("make_coffee".to_owned());
    config
        .post_processing
        .timeseries
        .as_mut()
        .unwrap()
        .streams
        .insert("sea_ice".to_owned(), vec!["AICE".to_owned()]);

    assert!(config.preflight_checks());
}

#[test]
fn preflight_rejects_inverted_year_range() {
    let project = scratch_dir("config-years");
    let mut config = sample_config(&project);
    config.simulations.start_year = 8;
    config.simulations.end_year = 3;
    assert!(config.preflight_checks());
}

#[test]
fn templates_expand_every_token() {
    let vars = RenderVars {
        project_path: Path::new("/projects/demo"),
        case: "case.A",
        local_path: "/archive/case.A",
        start_year: 1,
        end_year: 10,
        year: Some(7),
        month: Some(3),
    };

    assert_eq!(
        render_template("PROJECT_PATH/input/CASEID/atm", &vars),
        "/projects/demo/input/case.A/atm"
    );
    assert_eq!(
        render_template("CASEID.cam.h0.YEAR-MONTH.nc", &vars),
        "case.A.cam.h0.0007-03.nc"
    );
    assert_eq!(
        render_template("START_YR to END_YR restart REST_YR", &vars),
        "0001 to 0010 restart 0002"
    );
    assert_eq!(render_template("LOCAL_PATH/hist", &vars), "/archive/case.A/hist");
}

#[test]
fn year_tokens_are_left_alone_without_values() {
    let vars = RenderVars {
        project_path: Path::new("/p"),
        case: "x",
        local_path: "",
        start_year: 1,
        end_year: 2,
        year: None,
        month: None,
    };
    assert_eq!(render_template("x.YEAR.nc", &vars), "x.YEAR.nc");
}
