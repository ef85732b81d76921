use super::ManagerError;
use crate::jobstatus::{JobInfo, JobStatus};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

/// scripted response for one status poll
#[derive(Debug, Clone)]
pub enum MockResponse {
    State(JobStatus),
    Unknown,
}

/// Test-only backend with scripted status responses. Hands out sequential
/// handles and records every submitted script.
#[derive(Debug, Default)]
pub struct MockManager {
    next_handle: u64,
    pub submitted: Vec<PathBuf>,
    pub responses: RefCell<BTreeMap<u64, VecDeque<MockResponse>>>,
}

impl MockManager {
    pub fn submit(&mut self, script: &Path) -> Result<u64, ManagerError> {
        self.next_handle += 1;
        self.submitted.push(script.to_path_buf());
        Ok(self.next_handle)
    }

    /// pops the next scripted response, defaulting to RUNNING when the
    /// script for that handle has run dry
    pub fn status(&self, handle: u64) -> Result<JobInfo, ManagerError> {
        let response = self
            .responses
            .borrow_mut()
            .get_mut(&handle)
            .and_then(VecDeque::pop_front);

        match response {
            Some(MockResponse::Unknown) => Err(ManagerError::UnknownHandle(handle)),
            Some(MockResponse::State(state)) => Ok(JobInfo {
                handle,
                state: Some(state),
                ..JobInfo::default()
            }),
            None => Ok(JobInfo {
                handle,
                state: Some(JobStatus::Running),
                ..JobInfo::default()
            }),
        }
    }

    pub fn push_status(&self, handle: u64, response: MockResponse) {
        self.responses
            .borrow_mut()
            .entry(handle)
            .or_default()
            .push_back(response);
    }
}
