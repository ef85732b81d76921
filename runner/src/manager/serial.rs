use super::ManagerError;
use crate::jobstatus::{JobInfo, JobStatus};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};
use wait_timeout::ChildExt;

/// Fallback backend that runs one script at a time in-process, for machines
/// without a cluster scheduler. Handles are a local counter.
#[derive(Debug, Default)]
pub struct Serial {
    next_handle: u64,
    jobs: BTreeMap<u64, JobInfo>,
    timeout: Option<Duration>,
}

impl Serial {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// runs the script under bash and blocks until it finishes, so the
    /// recorded state is already terminal by the time anyone polls it
    pub fn submit(&mut self, script: &Path) -> Result<u64, ManagerError> {
        self.next_handle += 1;
        let handle = self.next_handle;

        self.jobs.insert(
            handle,
            JobInfo {
                handle,
                state: Some(JobStatus::Running),
                command: script.display().to_string(),
                ..JobInfo::default()
            },
        );

        // mirror what a batch scheduler does with the -o directive
        let console = File::create(format!("{}.out", script.display()))?;
        let mut child = Command::new("bash")
            .arg(script)
            .stdout(Stdio::from(console.try_clone()?))
            .stderr(Stdio::from(console))
            .spawn()?;

        info!(handle = handle, script = %script.display(), "running script in serial mode");

        let status = match self.timeout {
            Some(limit) => match child.wait_timeout(limit)? {
                Some(status) => Some(status),
                None => {
                    warn!(handle = handle, "script exceeded {}s, killing it", limit.as_secs());
                    child.kill()?;
                    child.wait()?;
                    None
                }
            },
            None => Some(child.wait()?),
        };

        let terminal = match status {
            Some(status) if status.success() => JobStatus::Completed,
            _ => JobStatus::Failed,
        };
        if let Some(job) = self.jobs.get_mut(&handle) {
            job.state = Some(terminal);
        }

        Ok(handle)
    }

    pub fn status(&self, handle: u64) -> Result<JobInfo, ManagerError> {
        self.jobs
            .get(&handle)
            .cloned()
            .ok_or(ManagerError::UnknownHandle(handle))
    }
}
