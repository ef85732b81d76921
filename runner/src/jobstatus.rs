use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt;

/// Internal job lifecycle. Jobs are created VALID and move through PENDING
/// and RUNNING towards exactly one of the three terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobStatus {
    Valid,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// terminal states are sticky, a job never leaves one
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Valid => "VALID",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{name}")
    }
}

// NOTE: COMPLETING (CG) is still RUNNING on our side. The scheduler holds the
// job until the epilog finishes, completion handling must not fire early.
static SLURM_STATES: Lazy<BTreeMap<&'static str, JobStatus>> = Lazy::new(|| {
    BTreeMap::from([
        ("PD", JobStatus::Pending),
        ("PENDING", JobStatus::Pending),
        ("Q", JobStatus::Pending),
        ("W", JobStatus::Pending),
        ("R", JobStatus::Running),
        ("RUNNING", JobStatus::Running),
        ("CG", JobStatus::Running),
        ("COMPLETING", JobStatus::Running),
        ("CD", JobStatus::Completed),
        ("COMPLETED", JobStatus::Completed),
        ("F", JobStatus::Failed),
        ("FAILED", JobStatus::Failed),
        ("NF", JobStatus::Failed),
        ("NODE_FAIL", JobStatus::Failed),
        ("TO", JobStatus::Failed),
        ("TIMEOUT", JobStatus::Failed),
        ("OOM", JobStatus::Failed),
        ("OUT_OF_MEMORY", JobStatus::Failed),
        ("BF", JobStatus::Failed),
        ("BOOT_FAIL", JobStatus::Failed),
        ("CA", JobStatus::Cancelled),
        ("CANCELLED", JobStatus::Cancelled),
    ])
});

static PBS_STATES: Lazy<BTreeMap<&'static str, JobStatus>> = Lazy::new(|| {
    BTreeMap::from([
        ("Q", JobStatus::Pending),
        ("H", JobStatus::Pending),
        ("W", JobStatus::Pending),
        ("T", JobStatus::Pending),
        ("S", JobStatus::Pending),
        ("R", JobStatus::Running),
        ("E", JobStatus::Running),
        ("C", JobStatus::Completed),
        ("F", JobStatus::Failed),
    ])
});

/// map a SLURM-native state string onto the internal lifecycle
pub fn from_slurm(state: &str) -> Option<JobStatus> {
    SLURM_STATES.get(state.trim().to_uppercase().as_str()).copied()
}

/// map a PBS-native state string onto the internal lifecycle
pub fn from_pbs(state: &str) -> Option<JobStatus> {
    PBS_STATES.get(state.trim().to_uppercase().as_str()).copied()
}

/// container for the fields a backend status query reports about one job
#[derive(Debug, Clone, Default)]
pub struct JobInfo {
    pub handle: u64,
    pub name: String,
    pub partition: String,
    pub state: Option<JobStatus>,
    pub user: String,
    pub runtime: String,
    pub command: String,
}

impl fmt::Display for JobInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            Some(state) => state.to_string(),
            None => "?".to_owned(),
        };
        write!(
            f,
            "handle={} name={} partition={} state={state} user={} runtime={} command={}",
            self.handle, self.name, self.partition, self.user, self.runtime, self.command
        )
    }
}
