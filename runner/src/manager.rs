pub mod pbs;
pub mod serial;
pub mod slurm;

#[cfg(test)]
pub mod mock;

use crate::config::GlobalConfig;
use crate::jobstatus::JobInfo;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// bounded attempts for batch submission before giving up
pub const SUBMIT_ATTEMPTS: u32 = 10;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("failed to spawn scheduler command")]
    Spawn(#[from] std::io::Error),
    #[error("submission failed after {attempts} attempts: {last}")]
    SubmissionFailed { attempts: u32, last: String },
    #[error("resource manager does not know handle {0}")]
    UnknownHandle(u64),
    #[error("could not parse scheduler output: {0}")]
    Parse(String),
    #[error("unable to find {0}, is it installed on this system?")]
    MissingBackend(&'static str),
}

/// Uniform interface over the batch scheduler backends.
/// These should be initialized from `ResourceManager::load`
/// (this is deliberately not made with dynamic dispatch to avoid the headache)
#[derive(Debug)]
pub enum ResourceManager {
    Slurm(slurm::Slurm),
    Pbs(pbs::Pbs),
    Serial(serial::Serial),
    #[cfg(test)]
    Mock(mock::MockManager),
}

impl ResourceManager {
    /// pick a backend: the serial fallback when requested, otherwise
    /// whichever cluster scheduler is installed on this machine
    pub fn load(global: &GlobalConfig) -> Result<Self, ManagerError> {
        if global.serial {
            return Ok(Self::Serial(serial::Serial::new(
                global.job_timeout_minutes.map(|m| Duration::from_secs(m * 60)),
            )));
        }
        if on_path("sbatch") {
            Ok(Self::Slurm(slurm::Slurm::new()?))
        } else if on_path("qsub") {
            Ok(Self::Pbs(pbs::Pbs::new()?))
        } else {
            Err(ManagerError::MissingBackend("sbatch or qsub"))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Slurm(_) => "slurm",
            Self::Pbs(_) => "pbs",
            Self::Serial(_) => "serial",
            #[cfg(test)]
            Self::Mock(_) => "mock",
        }
    }

    /// the batch-script directive prefix, if the backend reads one
    pub fn directive(&self) -> Option<&'static str> {
        match self {
            Self::Slurm(_) => Some("#SBATCH"),
            Self::Pbs(_) => Some("#PBS"),
            Self::Serial(_) => None,
            #[cfg(test)]
            Self::Mock(_) => None,
        }
    }

    /// submit a prepared batch script, returning the scheduler handle
    pub fn submit(&mut self, script: &Path) -> Result<u64, ManagerError> {
        match self {
            Self::Slurm(backend) => backend.submit(script),
            Self::Pbs(backend) => backend.submit(script),
            Self::Serial(backend) => backend.submit(script),
            #[cfg(test)]
            Self::Mock(backend) => backend.submit(script),
        }
    }

    /// query the scheduler for the current state of a handle
    pub fn status(&self, handle: u64) -> Result<JobInfo, ManagerError> {
        match self {
            Self::Slurm(backend) => backend.status(handle),
            Self::Pbs(backend) => backend.status(handle),
            Self::Serial(backend) => backend.status(handle),
            #[cfg(test)]
            Self::Mock(backend) => backend.status(handle),
        }
    }

    /// number of compute nodes available, used to derive the default
    /// concurrency cap when none is configured
    pub fn node_count(&self) -> usize {
        match self {
            Self::Slurm(backend) => backend.node_count(),
            Self::Pbs(backend) => backend.node_count(),
            Self::Serial(_) => 1,
            #[cfg(test)]
            Self::Mock(_) => 1,
        }
    }

    /// best-effort cancellation, backends without support report false
    pub fn cancel(&self, handle: u64) -> bool {
        match self {
            Self::Slurm(backend) => backend.cancel(handle),
            Self::Pbs(backend) => backend.cancel(handle),
            Self::Serial(_) => false,
            #[cfg(test)]
            Self::Mock(_) => false,
        }
    }
}

/// check if an executable with the given name is reachable through PATH
pub fn on_path(binary: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(binary)))
}

fn is_executable(path: &PathBuf) -> bool {
    if !path.is_file() {
        return false;
    }
    match File::open(path).and_then(|file| file.metadata()) {
        Ok(metadata) => (metadata.mode() & 0o111) != 0,
        Err(_) => false,
    }
}

/// run a scheduler command, retrying transient failures with a linear
/// backoff until the attempts run out
pub(crate) fn run_retrying(command: &mut Command, attempts: u32) -> Result<Output, ManagerError> {
    let mut last = String::new();

    for attempt in 1..=attempts {
        match command.output() {
            Ok(output) if output.status.success() => return Ok(output),
            Ok(output) => {
                last = String::from_utf8_lossy(&output.stderr).into_owned();
                warn!(
                    attempt = attempt,
                    "scheduler command failed: {}",
                    last.trim()
                );
            }
            Err(error) => {
                last = error.to_string();
                warn!(attempt = attempt, "failed to spawn scheduler command: {last}");
            }
        }

        if attempt < attempts {
            debug!("retrying in {}s", attempt * 2);
            sleep(Duration::from_secs(u64::from(attempt) * 2));
        }
    }

    Err(ManagerError::SubmissionFailed { attempts, last })
}
