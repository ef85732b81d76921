use super::{run_retrying, ManagerError, SUBMIT_ATTEMPTS};
use crate::jobstatus::{self, JobInfo};
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// Interface to PBS/TORQUE through its command line tools.
#[derive(Debug)]
pub struct Pbs;

impl Pbs {
    /// fails when qstat is not reachable through PATH
    pub fn new() -> Result<Self, ManagerError> {
        if !super::on_path("qstat") {
            return Err(ManagerError::MissingBackend("qstat"));
        }
        Ok(Self)
    }

    pub fn submit(&mut self, script: &Path) -> Result<u64, ManagerError> {
        let output = run_retrying(Command::new("qsub").arg(script), SUBMIT_ATTEMPTS)?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        // qsub reports "<id>.<server-name>"
        let id = stdout.trim();
        id.split('.')
            .next()
            .and_then(|token| token.parse::<u64>().ok())
            .ok_or_else(|| ManagerError::Parse(id.to_owned()))
    }

    pub fn status(&self, handle: u64) -> Result<JobInfo, ManagerError> {
        let output = Command::new("qstat")
            .args(["-f", &handle.to_string()])
            .output()?;

        if !output.status.success() {
            debug!(
                handle = handle,
                "qstat lookup failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(ManagerError::UnknownHandle(handle));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut info = JobInfo {
            handle,
            ..JobInfo::default()
        };

        for line in stdout.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "job_state" => info.state = jobstatus::from_pbs(value.trim()),
                "Job_Name" => info.name = value.trim().to_owned(),
                "queue" => info.partition = value.trim().to_owned(),
                "Job_Owner" => info.user = value.trim().to_owned(),
                _ => {}
            }
        }

        Ok(info)
    }

    /// number of free nodes pbsnodes reports, 1 when the query fails
    pub fn node_count(&self) -> usize {
        let output = match Command::new("pbsnodes").args(["-l", "free"]).output() {
            Ok(output) if output.status.success() => output,
            _ => return 1,
        };

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count()
            .max(1)
    }

    pub fn cancel(&self, handle: u64) -> bool {
        match Command::new("qdel").arg(handle.to_string()).output() {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    handle = handle,
                    "qdel failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(error) => {
                warn!(handle = handle, "failed to spawn qdel: {error}");
                false
            }
        }
    }
}
