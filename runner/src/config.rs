use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, warn};

/// every job type the graph builder knows how to construct
pub const JOB_TYPES: [&str; 4] = ["climo", "timeseries", "regrid", "e3sm_diags"];

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("failed to read configuration file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration file")]
    Parse(#[from] serde_yaml::Error),
    #[error("{job} requires a {needed} job covering years {start:04}-{end:04}, but none was scheduled")]
    MissingDependency {
        job: String,
        needed: &'static str,
        start: i32,
        end: i32,
    },
    #[error("comparison case {0} is not defined in simulations")]
    UnknownComparison(String),
}

/// What to do with the rest of a run once a job fails.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// mark dependents failed, let independent in-flight work finish
    #[default]
    Drain,
    /// additionally cancel every outstanding scheduler job
    CancelOutstanding,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub global: GlobalConfig,
    pub simulations: SimulationsConfig,
    pub data_types: BTreeMap<String, DataTypeConfig>,
    #[serde(default)]
    pub post_processing: PostProcessingConfig,
    #[serde(default)]
    pub diags: DiagsConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// root of the project directory, all output lands below it
    pub project_path: PathBuf,
    /// directory holding batch environment loader scripts
    #[serde(default)]
    pub resource_path: Option<PathBuf>,
    #[serde(default)]
    pub dryrun: bool,
    /// forwarded to diagnostic output publishing
    #[serde(default)]
    pub always_copy: bool,
    #[serde(default)]
    pub debug: bool,
    /// use the in-process serial backend instead of a cluster scheduler
    #[serde(default)]
    pub serial: bool,
    /// concurrent submission cap, defaults to the cluster node count
    #[serde(default)]
    pub max_jobs: Option<usize>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// wall-clock bound for serial-mode scripts, unbounded when unset
    #[serde(default)]
    pub job_timeout_minutes: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SimulationsConfig {
    pub start_year: i32,
    pub end_year: i32,
    pub cases: BTreeMap<String, CaseConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CaseConfig {
    pub short_name: String,
    /// base path for this case's raw model output
    #[serde(default)]
    pub local_path: Option<String>,
    /// enabled job types, "all" enables every configured type
    #[serde(default)]
    pub job_types: Vec<String>,
    /// enabled datatypes, "all" enables every configured type
    #[serde(default)]
    pub data_types: Vec<String>,
    /// other cases (or "obs") diagnostics compare this case against
    #[serde(default)]
    pub comparisons: Vec<String>,
}

impl CaseConfig {
    pub fn job_type_enabled(&self, job_type: &str) -> bool {
        self.job_types.iter().any(|t| t == "all" || t == job_type)
    }

    pub fn data_type_enabled(&self, datatype: &str) -> bool {
        self.data_types.iter().any(|t| t == "all" || t == datatype)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DataTypeConfig {
    /// filename template, expanded per year/month for monthly data
    pub file_format: String,
    /// directory template the files are expected in
    pub local_path: String,
    #[serde(default)]
    pub monthly: bool,
    /// per-case template overrides
    #[serde(default)]
    pub cases: BTreeMap<String, DataTypeOverride>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DataTypeOverride {
    #[serde(default)]
    pub file_format: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
}

impl DataTypeConfig {
    /// the (file_format, local_path) pair for a case, with overrides applied
    pub fn resolve(&self, case: &str) -> (&str, &str) {
        let overrides = self.cases.get(case);
        let file_format = overrides
            .and_then(|o| o.file_format.as_deref())
            .unwrap_or(&self.file_format);
        let local_path = overrides
            .and_then(|o| o.local_path.as_deref())
            .unwrap_or(&self.local_path);
        (file_format, local_path)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PostProcessingConfig {
    #[serde(default)]
    pub climo: Option<ClimoConfig>,
    #[serde(default)]
    pub timeseries: Option<TimeseriesConfig>,
    #[serde(default)]
    pub regrid: Option<RegridConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct DiagsConfig {
    #[serde(default)]
    pub e3sm_diags: Option<E3smDiagsConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClimoConfig {
    /// year-window lengths to run at, the full range when empty
    #[serde(default)]
    pub run_frequency: Vec<i32>,
    pub destination_grid_name: String,
    pub regrid_map_path: PathBuf,
    /// batch directive overrides, flag to value
    #[serde(default)]
    pub custom_args: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TimeseriesConfig {
    #[serde(default)]
    pub run_frequency: Vec<i32>,
    /// variables to extract, keyed by output stream
    pub streams: BTreeMap<String, Vec<String>>,
    /// when set together with regrid_map_path, extracted series are also regridded
    #[serde(default)]
    pub destination_grid_name: Option<String>,
    #[serde(default)]
    pub regrid_map_path: Option<PathBuf>,
    #[serde(default)]
    pub custom_args: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RegridConfig {
    #[serde(default)]
    pub run_frequency: Vec<i32>,
    pub streams: BTreeMap<String, RegridStream>,
    #[serde(default)]
    pub custom_args: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RegridStream {
    pub destination_grid_name: String,
    pub regrid_map_path: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct E3smDiagsConfig {
    #[serde(default)]
    pub run_frequency: Vec<i32>,
    #[serde(default = "default_diag_backend")]
    pub backend: String,
    #[serde(default)]
    pub custom_args: BTreeMap<String, String>,
}

fn default_diag_backend() -> String {
    "mpl".to_owned()
}

/// values substituted into filename and path templates
pub struct RenderVars<'a> {
    pub project_path: &'a Path,
    pub case: &'a str,
    pub local_path: &'a str,
    pub start_year: i32,
    pub end_year: i32,
    pub year: Option<i32>,
    pub month: Option<u32>,
}

/// Expand the template keywords against the current case and year range.
/// REST_YR and START_YR are replaced before YEAR so the longer tokens are
/// consumed first.
pub fn render_template(template: &str, vars: &RenderVars) -> String {
    let mut out = template.to_owned();

    out = out.replace("PROJECT_PATH", &vars.project_path.display().to_string());
    out = out.replace("LOCAL_PATH", vars.local_path);
    out = out.replace("CASEID", vars.case);
    out = out.replace("REST_YR", &format!("{:04}", vars.start_year + 1));
    out = out.replace("START_YR", &format!("{:04}", vars.start_year));
    out = out.replace("END_YR", &format!("{:04}", vars.end_year));
    if let Some(year) = vars.year {
        out = out.replace("YEAR", &format!("{year:04}"));
    }
    if let Some(month) = vars.month {
        out = out.replace("MONTH", &format!("{month:02}"));
    }
    out
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Validate the cross-references between sections, attempting to catch
    /// all errors instead of piece-by-piece to make debugging easier for
    /// users. Returns true when any error was found.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if self.simulations.start_year < 1 {
            error!("simulations.start_year must be 1 or later");
            contains_error = true;
        }
        if self.simulations.end_year < self.simulations.start_year {
            error!(
                "simulations.end_year ({}) is before start_year ({})",
                self.simulations.end_year, self.simulations.start_year
            );
            contains_error = true;
        }
        if self.simulations.cases.is_empty() {
            error!("no cases were defined, there is nothing to schedule");
            contains_error = true;
        }

        for (name, case) in self.simulations.cases.iter() {
            for job_type in case.job_types.iter() {
                if job_type != "all" && !JOB_TYPES.contains(&job_type.as_str()) {
                    error!("simulations.cases.{name}.job_types contains unknown type {job_type}");
                    contains_error = true;
                }
            }
            for datatype in case.data_types.iter() {
                if datatype != "all" && !self.data_types.contains_key(datatype) {
                    error!(
                        "simulations.cases.{name}.data_types references {datatype} \
                         which is not defined in data_types"
                    );
                    contains_error = true;
                }
            }
            for comparison in case.comparisons.iter() {
                if comparison == "obs" || comparison == "all" {
                    continue;
                }
                if comparison == name {
                    error!("simulations.cases.{name} cannot be compared against itself");
                    contains_error = true;
                } else if !self.simulations.cases.contains_key(comparison) {
                    error!(
                        "simulations.cases.{name}.comparisons references {comparison} \
                         which is not defined in simulations"
                    );
                    contains_error = true;
                }
            }

            for job_type in JOB_TYPES {
                if case.job_types.contains(&job_type.to_owned()) && !self.has_job_type_block(job_type)
                {
                    warn!(
                        "simulations.cases.{name} enables {job_type} but no {job_type} \
                         section is configured, no jobs of that type will run"
                    );
                }
            }
        }

        if let Some(timeseries) = &self.post_processing.timeseries {
            for stream in timeseries.streams.keys() {
                if !self.data_types.contains_key(stream) {
                    error!(
                        "post_processing.timeseries.streams.{stream} is not defined in data_types"
                    );
                    contains_error = true;
                }
            }
            if timeseries.regrid_map_path.is_some() != timeseries.destination_grid_name.is_some() {
                error!(
                    "post_processing.timeseries needs both regrid_map_path and \
                     destination_grid_name to regrid, or neither"
                );
                contains_error = true;
            }
        }
        if let Some(regrid) = &self.post_processing.regrid {
            for stream in regrid.streams.keys() {
                if !self.data_types.contains_key(stream) {
                    error!("post_processing.regrid.streams.{stream} is not defined in data_types");
                    contains_error = true;
                }
            }
        }

        contains_error
    }

    fn has_job_type_block(&self, job_type: &str) -> bool {
        match job_type {
            "climo" => self.post_processing.climo.is_some(),
            "timeseries" => self.post_processing.timeseries.is_some(),
            "regrid" => self.post_processing.regrid.is_some(),
            "e3sm_diags" => self.diags.e3sm_diags.is_some(),
            _ => false,
        }
    }
}
