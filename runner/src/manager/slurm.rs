use super::{run_retrying, ManagerError, SUBMIT_ATTEMPTS};
use crate::jobstatus::{self, JobInfo};
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// Interface to the SLURM workload manager through its command line tools.
#[derive(Debug)]
pub struct Slurm;

impl Slurm {
    /// fails when sinfo is not reachable through PATH
    pub fn new() -> Result<Self, ManagerError> {
        if !super::on_path("sinfo") {
            return Err(ManagerError::MissingBackend("sinfo"));
        }
        Ok(Self)
    }

    pub fn submit(&mut self, script: &Path) -> Result<u64, ManagerError> {
        let output = run_retrying(Command::new("sbatch").arg(script), SUBMIT_ATTEMPTS)?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        // sbatch reports "Submitted batch job <id>"
        stdout
            .split_whitespace()
            .last()
            .and_then(|token| token.parse::<u64>().ok())
            .ok_or_else(|| ManagerError::Parse(stdout.into_owned()))
    }

    pub fn status(&self, handle: u64) -> Result<JobInfo, ManagerError> {
        let output = Command::new("scontrol")
            .args(["show", "job", &handle.to_string()])
            .output()?;

        if !output.status.success() {
            // jobs age out of scontrol's view once they leave the queue,
            // the caller decides what that means
            debug!(
                handle = handle,
                "scontrol lookup failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(ManagerError::UnknownHandle(handle));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut info = JobInfo {
            handle,
            ..JobInfo::default()
        };

        for token in stdout.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "JobState" => info.state = jobstatus::from_slurm(value),
                "JobName" => info.name = value.to_owned(),
                "Partition" => info.partition = value.to_owned(),
                "UserId" => info.user = value.to_owned(),
                "RunTime" => info.runtime = value.to_owned(),
                "Command" => info.command = value.to_owned(),
                _ => {}
            }
        }

        Ok(info)
    }

    /// number of nodes sinfo reports, 1 when the query fails
    pub fn node_count(&self) -> usize {
        let output = match Command::new("sinfo").args(["-h", "-o", "%D"]).output() {
            Ok(output) if output.status.success() => output,
            _ => return 1,
        };

        let nodes: usize = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<usize>().ok())
            .sum();
        nodes.max(1)
    }

    pub fn cancel(&self, handle: u64) -> bool {
        match Command::new("scancel").arg(handle.to_string()).output() {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    handle = handle,
                    "scancel failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(error) => {
                warn!(handle = handle, "failed to spawn scancel: {error}");
                false
            }
        }
    }
}
