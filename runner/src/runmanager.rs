use crate::catalog::{CatalogError, SharedCatalog};
use crate::config::{CaseConfig, Config, ConfigErrors, FailurePolicy};
use crate::jobs::{
    climo, e3sm_diags, regrid, timeseries, Comparison, Job, JobError, JobId, JobSummary,
};
use crate::jobstatus::JobStatus;
use crate::manager::ResourceManager;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// errors that end the whole run, as opposed to a single job
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("failed to create job output directories")]
    Io(#[from] std::io::Error),
}

/// overall run state, derived from the job graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Failed,
    Success,
}

/// pairing of a scheduler handle with our job, held while outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningHandle {
    pub handle: u64,
    pub job: JobId,
}

/// one simulation case under orchestration and the jobs built for it
#[derive(Debug)]
pub struct CaseRun {
    pub case: String,
    pub short_name: String,
    pub comparisons: Vec<Comparison>,
    pub jobs: Vec<Job>,
}

/// The scheduler core: builds the per-case job graph, resolves
/// dependencies, starts eligible jobs under the concurrency cap, polls the
/// resource manager and propagates failure.
#[derive(Debug)]
pub struct RunManager {
    pub config: Config,
    pub catalog: SharedCatalog,
    pub manager: ResourceManager,
    pub cases: Vec<CaseRun>,
    pub running: Vec<RunningHandle>,
    pub max_running_jobs: usize,
    next_id: u32,
}

/// partition [start, end] into windows of each requested length, the last
/// window of a length is clamped to the end year
pub fn windows(start: i32, end: i32, freqs: &[i32]) -> Vec<(i32, i32)> {
    let freqs = if freqs.is_empty() {
        vec![end - start + 1]
    } else {
        freqs.to_vec()
    };

    let mut out = Vec::new();
    for freq in freqs {
        if freq <= 0 {
            warn!("ignoring non-positive run frequency {freq}");
            continue;
        }
        for year in (start..=end).filter(|year| (year - start) % freq == 0) {
            out.push((year, (year + freq - 1).min(end)));
        }
    }
    out
}

fn push_unique(out: &mut Vec<Comparison>, comparison: Comparison) {
    if !out.contains(&comparison) {
        out.push(comparison);
    }
}

fn parse_comparisons(
    name: &str,
    case: &CaseConfig,
    config: &Config,
) -> Result<Vec<Comparison>, ConfigErrors> {
    let mut out: Vec<Comparison> = Vec::new();

    for comparison in case.comparisons.iter() {
        match comparison.as_str() {
            "obs" => push_unique(&mut out, Comparison::Obs),
            "all" => {
                for other in config.simulations.cases.keys() {
                    if other != name {
                        push_unique(&mut out, Comparison::Case(other.clone()));
                    }
                }
                push_unique(&mut out, Comparison::Obs);
            }
            other if config.simulations.cases.contains_key(other) => {
                push_unique(&mut out, Comparison::Case(other.to_owned()))
            }
            other => return Err(ConfigErrors::UnknownComparison(other.to_owned())),
        }
    }
    Ok(out)
}

impl RunManager {
    pub fn new(config: Config, catalog: SharedCatalog, manager: ResourceManager) -> Self {
        let max_running_jobs = config
            .global
            .max_jobs
            .unwrap_or_else(|| manager.node_count())
            .max(1);
        info!("concurrency cap set to {max_running_jobs} outstanding jobs");

        Self {
            config,
            catalog,
            manager,
            cases: Vec::new(),
            running: Vec::new(),
            max_running_jobs,
            next_id: 0,
        }
    }

    fn alloc_id(&mut self) -> JobId {
        self.next_id += 1;
        JobId(self.next_id)
    }

    /// instantiate one job per (case, job type, year window, run type,
    /// comparison) tuple, skipping exact duplicates
    pub fn build_graph(&mut self) -> Result<(), OrchestratorError> {
        let config = self.config.clone();
        let start = config.simulations.start_year;
        let end = config.simulations.end_year;

        self.cases = Vec::new();
        for (name, case) in config.simulations.cases.iter() {
            let comparisons = parse_comparisons(name, case, &config)?;
            self.cases.push(CaseRun {
                case: name.clone(),
                short_name: case.short_name.clone(),
                comparisons,
                jobs: Vec::new(),
            });
        }

        for index in 0..self.cases.len() {
            let case_name = self.cases[index].case.clone();
            let short_name = self.cases[index].short_name.clone();
            let case_config = &config.simulations.cases[&case_name];

            if let Some(climo_config) = &config.post_processing.climo {
                if case_config.job_type_enabled("climo") {
                    for window in windows(start, end, &climo_config.run_frequency) {
                        if self.is_duplicate(index, "climo", window, None, None) {
                            continue;
                        }
                        let id = self.alloc_id();
                        let job =
                            climo::new(id, &case_name, &short_name, window, &config, climo_config)?;
                        self.cases[index].jobs.push(job);
                    }
                }
            }

            if let Some(timeseries_config) = &config.post_processing.timeseries {
                if case_config.job_type_enabled("timeseries") {
                    for stream in timeseries_config.streams.keys() {
                        if !case_config.data_type_enabled(stream)
                            || !config.data_types.contains_key(stream)
                        {
                            continue;
                        }
                        for window in windows(start, end, &timeseries_config.run_frequency) {
                            if self.is_duplicate(
                                index,
                                "timeseries",
                                window,
                                Some(stream),
                                None,
                            ) {
                                continue;
                            }
                            let id = self.alloc_id();
                            let job = timeseries::new(
                                id,
                                &case_name,
                                &short_name,
                                window,
                                &config,
                                timeseries_config,
                                stream,
                            )?;
                            self.cases[index].jobs.push(job);
                        }
                    }
                }
            }

            if let Some(regrid_config) = &config.post_processing.regrid {
                if case_config.job_type_enabled("regrid") {
                    for (stream, stream_config) in regrid_config.streams.iter() {
                        if !case_config.data_type_enabled(stream)
                            || !config.data_types.contains_key(stream)
                        {
                            continue;
                        }
                        for window in windows(start, end, &regrid_config.run_frequency) {
                            if self.is_duplicate(index, "regrid", window, Some(stream), None) {
                                continue;
                            }
                            let id = self.alloc_id();
                            let job = regrid::new(
                                id,
                                &case_name,
                                &short_name,
                                window,
                                &config,
                                regrid_config,
                                stream,
                                stream_config,
                            )?;
                            self.cases[index].jobs.push(job);
                        }
                    }
                }
            }

            if let Some(diags_config) = &config.diags.e3sm_diags {
                if case_config.job_type_enabled("e3sm_diags") {
                    let comparisons = self.cases[index].comparisons.clone();
                    for comparison in comparisons {
                        for window in windows(start, end, &diags_config.run_frequency) {
                            if self.is_duplicate(
                                index,
                                "e3sm_diags",
                                window,
                                None,
                                Some(&comparison),
                            ) {
                                continue;
                            }
                            let id = self.alloc_id();
                            let job = e3sm_diags::new(
                                id,
                                &case_name,
                                &short_name,
                                window,
                                &config,
                                diags_config,
                                comparison.clone(),
                            )?;
                            self.cases[index].jobs.push(job);
                        }
                    }
                }
            }
        }

        let total = self.cases.iter().map(|case| case.jobs.len()).sum::<usize>();
        info!("constructed {total} jobs across {} cases", self.cases.len());

        // products the graph can create are legal readiness targets from now on
        let derived = self
            .cases
            .iter()
            .flat_map(|case| case.jobs.iter())
            .flat_map(Job::produced_datatypes)
            .collect::<BTreeSet<_>>();
        self.catalog.register_derived(derived);

        Ok(())
    }

    fn is_duplicate(
        &self,
        index: usize,
        job_type: &str,
        window: (i32, i32),
        run_type: Option<&str>,
        comparison: Option<&Comparison>,
    ) -> bool {
        self.cases[index].jobs.iter().any(|job| {
            job.kind.name() == job_type
                && job.start_year == window.0
                && job.end_year == window.1
                && job.run_type.as_deref() == run_type
                && match comparison {
                    Some(comparison) => job.comparison.as_ref() == Some(comparison),
                    None => true,
                }
        })
    }

    /// second pass over the finished graph, wiring every job to the
    /// predecessors it waits on
    pub fn resolve_dependencies(&mut self) -> Result<(), OrchestratorError> {
        let summaries: BTreeMap<String, Vec<JobSummary>> = self
            .cases
            .iter()
            .map(|case| (case.case.clone(), case.jobs.iter().map(Job::summary).collect()))
            .collect();

        for case in self.cases.iter_mut() {
            let own = summaries.get(&case.case).cloned().unwrap_or_default();
            for job in case.jobs.iter_mut() {
                let comparison = match &job.comparison {
                    Some(Comparison::Case(other)) => Some(
                        summaries
                            .get(other)
                            .ok_or_else(|| ConfigErrors::UnknownComparison(other.clone()))?
                            .as_slice(),
                    ),
                    _ => None,
                };
                job.setup_dependencies(&own, comparison)?;
            }
        }
        Ok(())
    }

    /// refresh every non-terminal job's cached data readiness
    pub fn check_data_ready(&mut self) -> Result<(), OrchestratorError> {
        let catalog = self.catalog.clone();
        for case in self.cases.iter_mut() {
            for job in case.jobs.iter_mut() {
                if !job.status().is_terminal() {
                    job.check_data_ready(&catalog)?;
                }
            }
        }
        Ok(())
    }

    pub fn status_of(&self, id: JobId) -> Option<JobStatus> {
        self.cases
            .iter()
            .flat_map(|case| case.jobs.iter())
            .find(|job| job.id == id)
            .map(Job::status)
    }

    fn find(&self, id: JobId) -> Option<&Job> {
        self.cases
            .iter()
            .flat_map(|case| case.jobs.iter())
            .find(|job| job.id == id)
    }

    fn locate(&self, id: JobId) -> Option<(usize, usize)> {
        for (case_index, case) in self.cases.iter().enumerate() {
            if let Some(job_index) = case.jobs.iter().position(|job| job.id == id) {
                return Some((case_index, job_index));
            }
        }
        None
    }

    /// Single choke point for status changes. Terminal states stick, and a
    /// failure here is what triggers the cascade.
    fn transition(&mut self, case_index: usize, job_index: usize, next: JobStatus) {
        let (changed, previous, id, prefix, output) = {
            let job = &mut self.cases[case_index].jobs[job_index];
            let previous = job.status();
            if previous == next {
                return;
            }
            let changed = job.set_status(next);
            (changed, previous, job.id, job.msg_prefix(), job.output_location())
        };
        if !changed {
            return;
        }

        info!("{prefix}: job changed from {previous} to {next}");
        if matches!(next, JobStatus::Failed | JobStatus::Cancelled) {
            if next == JobStatus::Failed {
                error!(
                    "{prefix}: job has failed, check the job output here: {}",
                    output.display()
                );
            }
            self.cascade_from(id);
        }
    }

    /// mark every transitive dependent of a failed job FAILED; under the
    /// cancel-outstanding policy also try to pull back everything in flight
    fn cascade_from(&mut self, id: JobId) {
        for dependent in self.direct_dependents(id) {
            if let Some((case_index, job_index)) = self.locate(dependent) {
                if !self.cases[case_index].jobs[job_index].status().is_terminal() {
                    warn!(
                        "{}: dependency failed, marking job failed",
                        self.cases[case_index].jobs[job_index].msg_prefix()
                    );
                    // recurses through transition, so the cascade is transitive
                    self.transition(case_index, job_index, JobStatus::Failed);
                }
            }
        }

        if self.config.global.failure_policy == FailurePolicy::CancelOutstanding {
            for item in self.running.clone() {
                if self.manager.cancel(item.handle) {
                    info!("cancelled outstanding scheduler job {}", item.handle);
                }
            }
        }
    }

    fn direct_dependents(&self, id: JobId) -> Vec<JobId> {
        self.cases
            .iter()
            .flat_map(|case| case.jobs.iter())
            .filter(|job| job.depends_on.contains(&id))
            .map(|job| job.id)
            .collect_vec()
    }

    /// Start every eligible job in creation order until the concurrency cap
    /// is reached. Work already finished on disk is recognized and completed
    /// without submission.
    pub fn start_ready_jobs(&mut self) -> Result<(), OrchestratorError> {
        let catalog = self.catalog.clone();

        for case_index in 0..self.cases.len() {
            for job_index in 0..self.cases[case_index].jobs.len() {
                if self.cases[case_index].jobs[job_index].status() != JobStatus::Valid {
                    continue;
                }
                if self.running.len() >= self.max_running_jobs {
                    debug!(
                        "running {} of {} jobs, waiting for the queue to shrink",
                        self.running.len(),
                        self.max_running_jobs
                    );
                    return Ok(());
                }

                let (deps, data_ready) = {
                    let job = &self.cases[case_index].jobs[job_index];
                    (job.depends_on.clone(), job.data_ready)
                };
                let deps_done = deps
                    .iter()
                    .all(|dep| self.status_of(*dep) == Some(JobStatus::Completed));
                if !deps_done || !data_ready {
                    continue;
                }

                // a job finished by a previous run is recognized here and
                // never resubmitted
                if self.cases[case_index].jobs[job_index].postvalidate(&self.config) {
                    self.transition(case_index, job_index, JobStatus::Completed);
                    self.cases[case_index].jobs[job_index].handle_completion(&catalog)?;
                    self.report_progress();
                    continue;
                }

                // pending before data setup so nothing double submits
                self.transition(case_index, job_index, JobStatus::Pending);

                let case_name = self.cases[case_index].case.clone();
                let comparison_case = match &self.cases[case_index].jobs[job_index].comparison {
                    Some(Comparison::Case(other)) => Some(other.clone()),
                    _ => None,
                };

                let mut staged = self.cases[case_index].jobs[job_index].setup_data(
                    &catalog,
                    &self.config,
                    &case_name,
                );
                if staged.is_ok() {
                    if let Some(other) = &comparison_case {
                        staged = self.cases[case_index].jobs[job_index].setup_data(
                            &catalog,
                            &self.config,
                            other,
                        );
                    }
                }
                if let Err(error) = staged {
                    if let JobError::Catalog(fatal) = error {
                        return Err(fatal.into());
                    }
                    error!(
                        "{}: failed to stage input data: {error}",
                        self.cases[case_index].jobs[job_index].msg_prefix()
                    );
                    self.transition(case_index, job_index, JobStatus::Failed);
                    continue;
                }

                match self.cases[case_index].jobs[job_index]
                    .execute(&self.config, &mut self.manager)
                {
                    Ok(Some(handle)) => {
                        let id = self.cases[case_index].jobs[job_index].id;
                        self.running.push(RunningHandle { handle, job: id });
                    }
                    Ok(None) => {
                        self.transition(case_index, job_index, JobStatus::Completed);
                        self.cases[case_index].jobs[job_index].handle_completion(&catalog)?;
                        self.report_progress();
                    }
                    Err(JobError::Catalog(fatal)) => return Err(fatal.into()),
                    Err(error) => {
                        error!(
                            "{}: submission failed: {error}",
                            self.cases[case_index].jobs[job_index].msg_prefix()
                        );
                        self.transition(case_index, job_index, JobStatus::Failed);
                    }
                }
            }
        }
        Ok(())
    }

    /// Poll every outstanding handle. A handle the scheduler no longer
    /// knows falls back to on-disk validation. Terminal transitions run the
    /// completion handler and release the handle.
    pub fn monitor_running_jobs(&mut self) -> Result<(), OrchestratorError> {
        let catalog = self.catalog.clone();
        let outstanding = self.running.clone();
        let mut finished = Vec::new();

        for item in outstanding {
            let Some((case_index, job_index)) = self.locate(item.job) else {
                finished.push(item.job);
                continue;
            };

            match self.manager.status(item.handle) {
                Err(error) => {
                    // old handles age out of scheduler history, what is on
                    // disk decides the outcome
                    debug!("status lookup failed for handle {}: {error}", item.handle);
                    finished.push(item.job);
                    if self.cases[case_index].jobs[job_index].postvalidate(&self.config) {
                        self.transition(case_index, job_index, JobStatus::Completed);
                        self.cases[case_index].jobs[job_index].handle_completion(&catalog)?;
                    } else {
                        warn!(
                            "{}: resource manager lookup error for handle {}, \
                             the job may have failed",
                            self.cases[case_index].jobs[job_index].msg_prefix(),
                            item.handle
                        );
                        self.transition(case_index, job_index, JobStatus::Failed);
                    }
                    self.report_progress();
                }
                Ok(info) => {
                    debug!("{info}");
                    let Some(state) = info.state else {
                        continue;
                    };
                    if state == self.cases[case_index].jobs[job_index].status() {
                        continue;
                    }
                    if !state.is_terminal() {
                        self.transition(case_index, job_index, state);
                        continue;
                    }

                    finished.push(item.job);
                    if state == JobStatus::Completed {
                        // the scheduler's word is not enough, the output has
                        // to actually be there
                        if self.cases[case_index].jobs[job_index].postvalidate(&self.config) {
                            self.transition(case_index, job_index, JobStatus::Completed);
                            self.cases[case_index].jobs[job_index].handle_completion(&catalog)?;
                        } else {
                            self.transition(case_index, job_index, JobStatus::Failed);
                        }
                    } else {
                        self.transition(case_index, job_index, state);
                    }
                    self.report_progress();
                }
            }
        }

        if !finished.is_empty() {
            self.running.retain(|item| !finished.contains(&item.job));
        }
        Ok(())
    }

    fn report_progress(&self) {
        let total = self.cases.iter().map(|case| case.jobs.len()).sum::<usize>();
        if total == 0 {
            return;
        }
        let done = self
            .cases
            .iter()
            .flat_map(|case| case.jobs.iter())
            .filter(|job| job.status().is_terminal())
            .count();
        info!(
            "job progress: {done}/{total} ({:.2}%)",
            done as f64 / total as f64 * 100.0
        );
    }

    /// RUNNING while anything is outstanding or non-terminal, FAILED when
    /// everything is terminal and at least one job failed or was cancelled,
    /// SUCCESS when every job completed
    pub fn is_all_done(&self) -> RunStatus {
        if !self.running.is_empty() {
            return RunStatus::Running;
        }

        let mut failed = false;
        for job in self.cases.iter().flat_map(|case| case.jobs.iter()) {
            match job.status() {
                JobStatus::Valid | JobStatus::Pending | JobStatus::Running => {
                    return RunStatus::Running
                }
                JobStatus::Failed | JobStatus::Cancelled => failed = true,
                JobStatus::Completed => {}
            }
        }

        if failed {
            RunStatus::Failed
        } else {
            RunStatus::Success
        }
    }

    /// serialize the graph to a human readable file for operator
    /// visibility, never read back by the orchestrator
    pub fn write_job_sets(&self, path: &Path) -> std::io::Result<()> {
        let mut out = String::new();

        for case in self.cases.iter() {
            let banner = "=".repeat(case.case.len() + 4);
            let _ = writeln!(out, "\n{banner}\n# {} #\n{banner}", case.case);

            for (index, job) in case.jobs.iter().enumerate() {
                let _ = writeln!(out, "\n\tname: {}", job.kind.name());
                let _ = writeln!(out, "\tperiod: {:04}-{:04}", job.start_year, job.end_year);
                if let Some(run_type) = &job.run_type {
                    let _ = writeln!(out, "\trun_type: {run_type}");
                }
                match &job.comparison {
                    Some(Comparison::Obs) => {
                        let _ = writeln!(out, "\tcomparison: obs");
                    }
                    Some(Comparison::Case(other)) => {
                        let _ = writeln!(out, "\tcomparison: {other}");
                    }
                    None => {}
                }
                let _ = writeln!(out, "\tstatus: {}", job.status());

                let deps = job
                    .depends_on
                    .iter()
                    .filter_map(|id| self.find(*id))
                    .map(Job::msg_prefix)
                    .collect_vec();
                if !deps.is_empty() {
                    let _ = writeln!(out, "\tdependent_on: {deps:?}");
                }

                let _ = writeln!(out, "\tdata_ready: {}", job.data_ready);
                let _ = writeln!(out, "\tjob_id: {}", job.id);
                let _ = writeln!(out, "\tmanager_handle: {}", job.handle.unwrap_or(0));

                if index != case.jobs.len() - 1 {
                    let _ = writeln!(out, "------------------------------------");
                }
            }
        }

        fs::write(path, out)
    }

    /// end of run report listing every job and where its output landed
    pub fn report(&self) {
        for job in self.cases.iter().flat_map(|case| case.jobs.iter()) {
            if job.status() == JobStatus::Completed {
                info!("{}", job.report_line());
            } else {
                error!("{}", job.report_line());
            }
        }
    }
}
