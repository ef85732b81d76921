pub mod climo;
pub mod e3sm_diags;
pub mod regrid;
pub mod timeseries;

use crate::catalog::{CatalogError, ProducedFile, SharedCatalog};
use crate::config::{Config, ConfigErrors};
use crate::jobstatus::JobStatus;
use crate::manager::{ManagerError, ResourceManager};
use globset::GlobBuilder;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// process-unique job identifier, assigned in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// what a diagnostic job evaluates its case against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    /// the fixed observational baseline
    Obs,
    /// another case from the same configuration
    Case(String),
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("failed to write the batch script")]
    Script(#[from] std::io::Error),
    #[error("job submission failed")]
    Submit(#[from] ManagerError),
    #[error("catalog lookup failed")]
    Catalog(#[from] CatalogError),
    #[error("no input files were staged for {0}")]
    NoInput(String),
}

/// one resolved batch directive, flag and value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchArg {
    pub flag: String,
    pub value: String,
}

pub fn default_batch_args() -> Vec<BatchArg> {
    vec![
        BatchArg {
            flag: "-t".to_owned(),
            value: "0-02:00".to_owned(),
        },
        BatchArg {
            flag: "-N".to_owned(),
            value: "1".to_owned(),
        },
    ]
}

/// resolve flag overrides once at render time, a matching flag replaces the
/// default and everything else is appended
pub fn apply_overrides(args: &mut Vec<BatchArg>, overrides: &BTreeMap<String, String>) {
    for (flag, value) in overrides {
        match args.iter_mut().find(|arg| arg.flag == *flag) {
            Some(arg) => arg.value = value.clone(),
            None => args.push(BatchArg {
                flag: flag.clone(),
                value: value.clone(),
            }),
        }
    }
}

/// The closed set of job kinds the graph builder can construct.
/// (this is deliberately not made with dynamic dispatch, the run manager
/// only ever calls through the fixed capability surface on `Job`)
#[derive(Debug, Clone)]
pub enum JobKind {
    Climo(climo::Climo),
    Timeseries(timeseries::Timeseries),
    Regrid(regrid::Regrid),
    E3smDiags(e3sm_diags::E3smDiags),
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Climo(_) => "climo",
            Self::Timeseries(_) => "timeseries",
            Self::Regrid(_) => "regrid",
            Self::E3smDiags(_) => "e3sm_diags",
        }
    }

    /// where this kind leaves its primary output
    pub fn output_path(&self) -> &Path {
        match self {
            Self::Climo(job) => &job.output_path,
            Self::Timeseries(job) => &job.output_path,
            Self::Regrid(job) => &job.output_path,
            Self::E3smDiags(job) => &job.output_path,
        }
    }
}

/// the slice of job state dependency resolution needs to see
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub id: JobId,
    pub job_type: &'static str,
    pub start_year: i32,
    pub end_year: i32,
}

/// One scheduled unit of work.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub case: String,
    pub short_name: String,
    pub start_year: i32,
    pub end_year: i32,
    /// output stream subcategory, for kinds that run once per stream
    pub run_type: Option<String>,
    pub comparison: Option<Comparison>,
    /// predecessor jobs, resolved within the same run's graph
    pub depends_on: Vec<JobId>,
    /// scheduler handle, absent until submitted
    pub handle: Option<u64>,
    /// cached readiness, never recomputed once true
    pub data_ready: bool,
    /// submitted this run, as opposed to found already done on disk
    pub has_been_executed: bool,
    pub batch_overrides: BTreeMap<String, String>,
    pub input_paths: Vec<PathBuf>,
    pub console_output: Option<PathBuf>,
    status: JobStatus,
}

impl Job {
    pub(crate) fn build(
        id: JobId,
        kind: JobKind,
        case: &str,
        short_name: &str,
        window: (i32, i32),
    ) -> Self {
        Self {
            id,
            kind,
            case: case.to_owned(),
            short_name: short_name.to_owned(),
            start_year: window.0,
            end_year: window.1,
            run_type: None,
            comparison: None,
            depends_on: Vec::new(),
            handle: None,
            data_ready: false,
            has_been_executed: false,
            batch_overrides: BTreeMap::new(),
            input_paths: Vec::new(),
            console_output: None,
            status: JobStatus::Valid,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// terminal states are sticky, an attempt to leave one is refused
    pub fn set_status(&mut self, next: JobStatus) -> bool {
        if self.status.is_terminal() && next != self.status {
            warn!(
                "{}: refusing transition from terminal {} to {}",
                self.msg_prefix(),
                self.status,
                next
            );
            return false;
        }
        self.status = next;
        true
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            job_type: self.kind.name(),
            start_year: self.start_year,
            end_year: self.end_year,
        }
    }

    /// datatypes that must be PRESENT before this job can start
    pub fn data_required(&self) -> Vec<String> {
        match &self.kind {
            JobKind::Climo(_) => vec!["atm".to_owned()],
            JobKind::Timeseries(job) => vec![job.stream.clone()],
            JobKind::Regrid(job) => vec![job.stream.clone()],
            JobKind::E3smDiags(_) => vec!["climo_regrid".to_owned()],
        }
    }

    /// datatype tags this job ingests into the catalog on completion
    pub fn produced_datatypes(&self) -> Vec<String> {
        match &self.kind {
            JobKind::Climo(_) => vec!["climo_regrid".to_owned(), "climo_native".to_owned()],
            JobKind::Timeseries(job) => {
                let mut tags = vec!["ts_native".to_owned()];
                if job.regrid_path.is_some() {
                    tags.push("ts_regrid".to_owned());
                }
                tags
            }
            JobKind::Regrid(job) => vec![format!("regrid_{}", job.stream)],
            JobKind::E3smDiags(_) => Vec::new(),
        }
    }

    /// Inspect the other jobs built for this case (and the comparison case,
    /// when there is one) and record the predecessors this job waits on.
    /// Finding no qualifying predecessor is a configuration error.
    pub fn setup_dependencies(
        &mut self,
        siblings: &[JobSummary],
        comparison_jobs: Option<&[JobSummary]>,
    ) -> Result<(), ConfigErrors> {
        if !matches!(self.kind, JobKind::E3smDiags(_)) {
            return Ok(());
        }

        let (start, end) = (self.start_year, self.end_year);
        let wanted = |job: &&JobSummary| {
            job.job_type == "climo" && job.start_year == start && job.end_year == end
        };

        let own = siblings
            .iter()
            .find(wanted)
            .ok_or_else(|| ConfigErrors::MissingDependency {
                job: self.msg_prefix(),
                needed: "climo",
                start,
                end,
            })?
            .id;
        self.depends_on.push(own);

        if let Some(comparison_jobs) = comparison_jobs {
            let theirs = comparison_jobs
                .iter()
                .find(wanted)
                .ok_or_else(|| ConfigErrors::MissingDependency {
                    job: self.msg_prefix(),
                    needed: "climo",
                    start,
                    end,
                })?
                .id;
            self.depends_on.push(theirs);
        }
        Ok(())
    }

    pub fn check_data_ready(&mut self, catalog: &SharedCatalog) -> Result<(), CatalogError> {
        if self.data_ready {
            return Ok(());
        }
        self.data_ready = catalog.is_ready(
            &self.data_required(),
            &self.case,
            Some((self.start_year, self.end_year)),
        )?;
        Ok(())
    }

    fn staging_dir(&self, config: &Config) -> PathBuf {
        let type_dir = match &self.run_type {
            Some(run_type) => format!("{}_{run_type}", self.kind.name()),
            None => self.kind.name().to_owned(),
        };
        let mut leaf = format!("{:04}_{:04}", self.start_year, self.end_year);
        if let JobKind::E3smDiags(diag) = &self.kind {
            leaf.push_str(&format!("_vs_{}", diag.short_comp_name));
        }
        config
            .global
            .project_path
            .join("output")
            .join("temp")
            .join(&self.short_name)
            .join(type_dir)
            .join(leaf)
    }

    /// stage the required input for one case by symlinking it into this
    /// job's scratch directory
    pub fn setup_data(
        &mut self,
        catalog: &SharedCatalog,
        config: &Config,
        case: &str,
    ) -> Result<(), JobError> {
        let staging = self.staging_dir(config);
        fs::create_dir_all(&staging)?;

        for datatype in self.data_required() {
            let files = catalog.file_paths(
                &datatype,
                case,
                Some((self.start_year, self.end_year)),
            )?;
            if files.is_empty() {
                warn!(
                    "{}: no input files available for datatype {datatype}",
                    self.msg_prefix()
                );
                continue;
            }

            for source in files {
                let Some(name) = source.file_name() else {
                    continue;
                };
                let link = staging.join(name);
                if !link.exists() {
                    symlink(&source, &link)?;
                }
                self.input_paths.push(link);
            }
        }
        Ok(())
    }

    /// render and submit this job's batch script, None means dry-run mode
    /// and the caller marks the job completed without submission
    pub fn execute(
        &mut self,
        config: &Config,
        manager: &mut ResourceManager,
    ) -> Result<Option<u64>, JobError> {
        let input_dir = match self.input_paths.first().and_then(|path| path.parent()) {
            Some(dir) => dir.to_path_buf(),
            None if config.global.dryrun => config.global.project_path.join("dryrun_input"),
            None => return Err(JobError::NoInput(self.msg_prefix())),
        };

        let cmd = match &self.kind {
            JobKind::Climo(job) => {
                job.render_cmd(&self.case, self.start_year, self.end_year, &input_dir)
            }
            JobKind::Timeseries(job) => {
                job.render_cmd(&self.case, self.start_year, self.end_year, &input_dir)
            }
            JobKind::Regrid(job) => job.render_cmd(&input_dir),
            JobKind::E3smDiags(job) => job.render_cmd(&input_dir),
        };

        let script = self.render_script(&cmd, config, manager)?;
        if config.global.dryrun {
            info!("{}: dryrun is set, completing without running", self.msg_prefix());
            return Ok(None);
        }

        info!("{}: job ready, submitting to queue", self.msg_prefix());
        let handle = manager.submit(&script)?;
        self.handle = Some(handle);
        self.has_been_executed = true;
        Ok(Some(handle))
    }

    fn render_script(
        &mut self,
        cmd: &[String],
        config: &Config,
        manager: &ResourceManager,
    ) -> Result<PathBuf, JobError> {
        let scripts_dir = config.global.project_path.join("output").join("scripts");
        fs::create_dir_all(&scripts_dir)?;
        let script = scripts_dir.join(self.run_name());
        let console = PathBuf::from(format!("{}.out", script.display()));

        let mut contents = String::from("#!/bin/bash\n");
        if let Some(prefix) = manager.directive() {
            let mut args = default_batch_args();
            apply_overrides(&mut args, &self.batch_overrides);
            args.push(BatchArg {
                flag: "-o".to_owned(),
                value: console.display().to_string(),
            });
            for arg in args.iter() {
                contents.push_str(&format!("{prefix} {} {}\n", arg.flag, arg.value));
            }
        }
        if let Some(resource_path) = &config.global.resource_path {
            let loader = resource_path.join("env_loader.bash");
            if loader.exists() {
                contents.push_str(&format!("source {}\n", loader.display()));
            }
        }
        contents.push_str(&cmd.join(" "));
        contents.push('\n');

        fs::write(&script, contents)?;
        self.console_output = Some(console);
        Ok(script)
    }

    /// true when the expected output already satisfies this job's completion
    /// criteria, which is what makes restarts idempotent
    pub fn postvalidate(&self, _config: &Config) -> bool {
        let valid = match &self.kind {
            JobKind::Climo(job) => job.validate(self.start_year, self.end_year),
            JobKind::Timeseries(job) => job.validate(self.start_year, self.end_year),
            JobKind::Regrid(job) => job.validate(self.start_year, self.end_year),
            JobKind::E3smDiags(job) => job.validate(),
        };
        if !valid && self.has_been_executed {
            error!("{}: output validation failed after execution", self.msg_prefix());
        }
        valid
    }

    /// ingest newly produced files into the catalog on success, log only on
    /// failure
    pub fn handle_completion(&self, catalog: &SharedCatalog) -> Result<(), CatalogError> {
        if self.status != JobStatus::Completed {
            info!(
                "{}: job did not complete, not running the completion handler",
                self.msg_prefix()
            );
            return Ok(());
        }
        info!("{}: job complete", self.msg_prefix());

        match &self.kind {
            JobKind::Climo(job) => {
                job.ingest_output(catalog, &self.case, self.start_year, self.end_year)?
            }
            JobKind::Timeseries(job) => {
                job.ingest_output(catalog, &self.case, self.start_year, self.end_year)?
            }
            JobKind::Regrid(job) => {
                job.ingest_output(catalog, &self.case, self.start_year, self.end_year)?
            }
            JobKind::E3smDiags(_) => {}
        }

        info!("{}: completion handler done", self.msg_prefix());
        Ok(())
    }

    pub fn msg_prefix(&self) -> String {
        let mut prefix = match &self.run_type {
            Some(run_type) => format!("{}-{run_type}", self.kind.name()),
            None => self.kind.name().to_owned(),
        };
        prefix.push_str(&format!(
            "-{:04}-{:04}-{}",
            self.start_year, self.end_year, self.short_name
        ));
        if let JobKind::E3smDiags(diag) = &self.kind {
            prefix.push_str(&format!("-vs-{}", diag.short_comp_name));
        }
        prefix
    }

    /// unique name the rendered batch script is stored under
    pub fn run_name(&self) -> String {
        let mut name = match &self.run_type {
            Some(run_type) => format!("{}_{run_type}", self.kind.name()),
            None => self.kind.name().to_owned(),
        };
        name.push_str(&format!(
            "_{:04}_{:04}_{}",
            self.start_year, self.end_year, self.short_name
        ));
        if let JobKind::E3smDiags(diag) = &self.kind {
            name.push_str(&format!("_vs_{}", diag.short_comp_name));
        }
        name
    }

    /// where an operator should look: the output directory once completed,
    /// the console output otherwise
    pub fn output_location(&self) -> PathBuf {
        if self.status == JobStatus::Completed {
            self.kind.output_path().to_path_buf()
        } else {
            self.console_output
                .clone()
                .unwrap_or_else(|| PathBuf::from("-"))
        }
    }

    pub fn report_line(&self) -> String {
        format!(
            "{} :: {} :: {}",
            self.msg_prefix(),
            self.status,
            self.output_location().display()
        )
    }
}

/// file names in a directory matching the glob, sorted
pub(crate) fn matching_files(dir: &Path, pattern: &str) -> Vec<String> {
    let matcher = match GlobBuilder::new(pattern).build() {
        Ok(glob) => glob.compile_matcher(),
        Err(error) => {
            error!(error = ?error, "failed to compile output glob {pattern}");
            return Vec::new();
        }
    };

    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| matcher.is_match(Path::new(name)))
        .collect();
    names.sort();
    names
}

/// catalog rows for the matching files of one output directory, keyed on
/// the producing job's year window
pub(crate) fn produced(
    dir: &Path,
    pattern: &str,
    case: &str,
    start: i32,
    end: i32,
) -> Vec<ProducedFile> {
    matching_files(dir, pattern)
        .into_iter()
        .map(|name| ProducedFile {
            local_path: dir.join(&name),
            name,
            case: case.to_owned(),
            year: start,
            month: end,
        })
        .collect()
}
