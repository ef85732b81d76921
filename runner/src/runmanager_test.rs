use crate::config::ConfigErrors;
use crate::jobs::{Job, JobKind};
use crate::jobstatus::JobStatus;
use crate::manager::mock::MockResponse;
use crate::runmanager::{windows, OrchestratorError, RunManager, RunStatus};
use crate::testutil::{build_run, mock, sample_config, scratch_dir, seed_atm_files, seed_climo_files};
use std::fs;

fn jobs_of<'a>(run: &'a RunManager, kind: &str) -> Vec<&'a Job> {
    run.cases
        .iter()
        .flat_map(|case| case.jobs.iter())
        .filter(|job| job.kind.name() == kind)
        .collect()
}

#[test]
fn year_range_partitions_into_clamped_windows() {
    assert_eq!(windows(1, 10, &[5]), vec![(1, 5), (6, 10)]);
    assert_eq!(windows(1, 10, &[4]), vec![(1, 4), (5, 8), (9, 10)]);
    assert_eq!(windows(1, 10, &[]), vec![(1, 10)]);
    assert_eq!(windows(1, 10, &[5, 10]), vec![(1, 5), (6, 10), (1, 10)]);
    assert!(windows(1, 10, &[0]).is_empty());
}

#[test]
fn graph_covers_every_window_and_wires_dependencies() {
    let project = scratch_dir("graph-windows");
    let run = build_run(sample_config(&project));

    let climos = jobs_of(&run, "climo");
    let mut climo_windows: Vec<(i32, i32)> = climos
        .iter()
        .map(|job| (job.start_year, job.end_year))
        .collect();
    climo_windows.sort();
    assert_eq!(climo_windows, vec![(1, 5), (6, 10)]);

    let diags = jobs_of(&run, "e3sm_diags");
    assert_eq!(diags.len(), 2);
    for diag in diags {
        assert_eq!(diag.depends_on.len(), 1);
        let dep = climos
            .iter()
            .find(|climo| climo.id == diag.depends_on[0])
            .expect("diag depends on something that is not a climo job");
        assert_eq!((dep.start_year, dep.end_year), (diag.start_year, diag.end_year));
    }

    let timeseries = jobs_of(&run, "timeseries");
    assert_eq!(timeseries.len(), 1);
    assert_eq!(timeseries[0].run_type.as_deref(), Some("atm"));
    assert!(timeseries[0].depends_on.is_empty());

    let total: usize = run.cases.iter().map(|case| case.jobs.len()).sum();
    assert_eq!(total, 5);

    // every job starts VALID with no handle
    for job in run.cases.iter().flat_map(|case| case.jobs.iter()) {
        assert_eq!(job.status(), JobStatus::Valid);
        assert!(job.handle.is_none());
        assert!(!job.has_been_executed);
    }
}

#[test]
fn repeated_frequencies_do_not_duplicate_jobs() {
    let project = scratch_dir("graph-duplicates");
    let mut config = sample_config(&project);
    config.diags.e3sm_diags.as_mut().unwrap().run_frequency = vec![5, 5];
    let run = build_run(config);
    assert_eq!(jobs_of(&run, "e3sm_diags").len(), 2);
}

#[test]
fn missing_predecessor_aborts_before_scheduling() {
    let project = scratch_dir("graph-missing-dep");
    let mut config = sample_config(&project);
    // diagnostics stay enabled but nothing generates climatologies
    config.post_processing.climo = None;

    let catalog = crate::catalog::SharedCatalog::new(
        crate::catalog::Catalog::in_memory(&config).unwrap(),
    );
    catalog.populate(&config).unwrap();
    let mut run = RunManager::new(
        config,
        catalog,
        crate::manager::ResourceManager::Mock(Default::default()),
    );
    run.build_graph().unwrap();

    let result = run.resolve_dependencies();
    assert!(matches!(
        result,
        Err(OrchestratorError::Config(ConfigErrors::MissingDependency { .. }))
    ));
}

#[test]
fn terminal_statuses_are_sticky() {
    let project = scratch_dir("sticky-terminal");
    let mut run = build_run(sample_config(&project));

    let job = &mut run.cases[0].jobs[0];
    assert!(job.set_status(JobStatus::Pending));
    assert!(job.set_status(JobStatus::Completed));
    assert!(!job.set_status(JobStatus::Failed));
    assert_eq!(job.status(), JobStatus::Completed);
    // re-asserting the same terminal state is allowed
    assert!(job.set_status(JobStatus::Completed));
}

#[test]
fn readiness_is_cached_and_gated_on_real_files() {
    let project = scratch_dir("data-ready");
    let mut run = build_run(sample_config(&project));

    run.check_data_ready().unwrap();
    assert!(run
        .cases
        .iter()
        .flat_map(|case| case.jobs.iter())
        .all(|job| !job.data_ready));

    seed_atm_files(&project, "case.A", 1, 10);
    run.catalog.refresh_local_status().unwrap();
    run.check_data_ready().unwrap();

    for climo in jobs_of(&run, "climo") {
        assert!(climo.data_ready);
    }
    assert!(jobs_of(&run, "timeseries")[0].data_ready);
    // diagnostics wait on climatology output that does not exist yet
    for diag in jobs_of(&run, "e3sm_diags") {
        assert!(!diag.data_ready);
    }
}

#[test]
fn submission_stops_at_the_concurrency_cap_in_creation_order() {
    let project = scratch_dir("concurrency-cap");
    let mut run = build_run(sample_config(&project));
    assert_eq!(run.max_running_jobs, 2);

    seed_atm_files(&project, "case.A", 1, 10);
    run.catalog.refresh_local_status().unwrap();
    run.check_data_ready().unwrap();
    run.start_ready_jobs().unwrap();

    // both climo windows are submitted, the timeseries job has to wait
    assert_eq!(run.running.len(), 2);
    assert_eq!(mock(&run).submitted.len(), 2);
    for climo in jobs_of(&run, "climo") {
        assert_eq!(climo.status(), JobStatus::Pending);
        assert!(climo.has_been_executed);
    }
    assert_eq!(jobs_of(&run, "timeseries")[0].status(), JobStatus::Valid);

    // nothing above the cap on a second pass either
    run.start_ready_jobs().unwrap();
    assert_eq!(run.running.len(), 2);
    assert_eq!(mock(&run).submitted.len(), 2);
}

#[test]
fn failure_cascades_to_transitive_dependents_without_cancelling_others() {
    let project = scratch_dir("cascade");
    let mut run = build_run(sample_config(&project));

    seed_atm_files(&project, "case.A", 1, 10);
    run.catalog.refresh_local_status().unwrap();
    run.check_data_ready().unwrap();
    run.start_ready_jobs().unwrap();
    assert_eq!(run.running.len(), 2);

    // first poll: both move to RUNNING
    run.monitor_running_jobs().unwrap();
    for climo in jobs_of(&run, "climo") {
        assert_eq!(climo.status(), JobStatus::Running);
    }

    // the first window's climo dies on the cluster
    mock(&run).push_status(1, MockResponse::State(JobStatus::Failed));
    run.monitor_running_jobs().unwrap();

    let climos = jobs_of(&run, "climo");
    let failed_climo = climos.iter().find(|job| job.handle == Some(1)).unwrap();
    let running_climo = climos.iter().find(|job| job.handle == Some(2)).unwrap();
    assert_eq!(failed_climo.status(), JobStatus::Failed);
    // independent sibling keeps running, drain policy never cancels it
    assert_eq!(running_climo.status(), JobStatus::Running);
    assert_eq!(run.running.len(), 1);

    let diags = jobs_of(&run, "e3sm_diags");
    let dependent = diags
        .iter()
        .find(|diag| diag.depends_on.contains(&failed_climo.id))
        .unwrap();
    let independent = diags
        .iter()
        .find(|diag| diag.depends_on.contains(&running_climo.id))
        .unwrap();
    assert_eq!(dependent.status(), JobStatus::Failed);
    assert_eq!(independent.status(), JobStatus::Valid);

    assert_eq!(run.is_all_done(), RunStatus::Running);
}

#[test]
fn scheduler_success_without_output_is_a_validation_failure() {
    let project = scratch_dir("validation-failure");
    let mut run = build_run(sample_config(&project));

    seed_atm_files(&project, "case.A", 1, 10);
    run.catalog.refresh_local_status().unwrap();
    run.check_data_ready().unwrap();
    run.start_ready_jobs().unwrap();

    // the scheduler reports success but no climatology files ever appear
    mock(&run).push_status(1, MockResponse::State(JobStatus::Completed));
    run.monitor_running_jobs().unwrap();

    let failed = jobs_of(&run, "climo")
        .into_iter()
        .find(|job| job.handle == Some(1))
        .unwrap();
    assert_eq!(failed.status(), JobStatus::Failed);
    assert_eq!(run.running.len(), 1);
}

#[test]
fn aged_out_handle_falls_back_to_on_disk_validation() {
    let project = scratch_dir("aged-out");
    let mut run = build_run(sample_config(&project));

    seed_atm_files(&project, "case.A", 1, 10);
    run.catalog.refresh_local_status().unwrap();
    run.check_data_ready().unwrap();
    run.start_ready_jobs().unwrap();

    // the first window's output is complete on disk, but the handle has
    // aged out of the scheduler's history
    let (native, regrid, first_id) = {
        let job = jobs_of(&run, "climo")
            .into_iter()
            .find(|job| job.handle == Some(1))
            .unwrap();
        match &job.kind {
            JobKind::Climo(climo) => {
                (climo.output_path.clone(), climo.regrid_path.clone(), job.id)
            }
            _ => unreachable!(),
        }
    };
    seed_climo_files(&native, "case.A", 1, 5);
    seed_climo_files(&regrid, "case.A", 1, 5);

    mock(&run).push_status(1, MockResponse::Unknown);
    run.monitor_running_jobs().unwrap();

    // straight to COMPLETED, a FAILED detour would have stuck
    let finished = jobs_of(&run, "climo")
        .into_iter()
        .find(|job| job.id == first_id)
        .unwrap();
    assert_eq!(finished.status(), JobStatus::Completed);
    assert_eq!(run.running.len(), 1);

    // the completion handler fed the catalog, so the dependent diagnostic
    // is data-ready now; the freed slot itself goes to the timeseries job,
    // which comes first in creation order
    run.check_data_ready().unwrap();
    run.start_ready_jobs().unwrap();
    let diag = jobs_of(&run, "e3sm_diags")
        .into_iter()
        .find(|diag| diag.depends_on.contains(&first_id))
        .unwrap();
    assert!(diag.data_ready);
    assert_eq!(diag.status(), JobStatus::Valid);
    assert_eq!(jobs_of(&run, "timeseries")[0].status(), JobStatus::Pending);
    assert_eq!(run.running.len(), 2);
}

#[test]
fn finished_work_is_recognized_across_restarts_without_resubmission() {
    let project = scratch_dir("idempotent-resume");
    let mut config = sample_config(&project);
    config.post_processing.climo = None;
    config.diags.e3sm_diags = None;

    seed_atm_files(&project, "case.A", 1, 10);

    // first run extracts the series (simulated here by dropping the
    // expected output in place before completion is checked)
    let mut first = build_run(config.clone());
    first.catalog.refresh_local_status().unwrap();
    let output_path = match &jobs_of(&first, "timeseries")[0].kind {
        JobKind::Timeseries(timeseries) => timeseries.output_path.clone(),
        _ => unreachable!(),
    };
    for var in ["T", "PRECT"] {
        fs::write(output_path.join(format!("{var}_000101_001012.nc")), b"").unwrap();
    }
    first.check_data_ready().unwrap();
    first.start_ready_jobs().unwrap();
    assert_eq!(first.is_all_done(), RunStatus::Success);

    // a second orchestrator over the same project rebuilds the graph from
    // scratch and must not submit the equivalent job again
    let mut second = build_run(config);
    second.catalog.refresh_local_status().unwrap();
    second.check_data_ready().unwrap();
    second.start_ready_jobs().unwrap();

    let job = jobs_of(&second, "timeseries")[0];
    assert_eq!(job.status(), JobStatus::Completed);
    assert!(!job.has_been_executed);
    assert!(mock(&second).submitted.is_empty());
    assert!(second.running.is_empty());
    assert_eq!(second.is_all_done(), RunStatus::Success);
}

#[test]
fn run_status_reflects_the_whole_graph() {
    let project = scratch_dir("run-status");
    let mut run = build_run(sample_config(&project));
    assert_eq!(run.is_all_done(), RunStatus::Running);

    let total = run.cases[0].jobs.len();
    for index in 0..total {
        run.cases[0].jobs[index].set_status(JobStatus::Completed);
    }
    assert_eq!(run.is_all_done(), RunStatus::Success);
}

#[test]
fn one_cancelled_job_fails_the_finished_run() {
    let project = scratch_dir("run-status-failed");
    let mut run = build_run(sample_config(&project));

    let total = run.cases[0].jobs.len();
    for index in 1..total {
        run.cases[0].jobs[index].set_status(JobStatus::Completed);
    }
    run.cases[0].jobs[0].set_status(JobStatus::Cancelled);
    assert_eq!(run.is_all_done(), RunStatus::Failed);

    // an outstanding handle keeps the run RUNNING regardless of statuses
    let id = run.cases[0].jobs[0].id;
    run.running.push(crate::runmanager::RunningHandle { handle: 99, job: id });
    assert_eq!(run.is_all_done(), RunStatus::Running);
}

#[test]
fn state_dump_lists_jobs_and_their_dependencies() {
    let project = scratch_dir("state-dump");
    let run = build_run(sample_config(&project));

    let state_path = project.join("job_state.txt");
    run.write_job_sets(&state_path).unwrap();

    let dump = fs::read_to_string(state_path).unwrap();
    assert!(dump.contains("# case.A #"));
    assert!(dump.contains("name: climo"));
    assert!(dump.contains("period: 0001-0005"));
    assert!(dump.contains("status: VALID"));
    assert!(dump.contains("dependent_on"));
    assert!(dump.contains("comparison: obs"));
}
