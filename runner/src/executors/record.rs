use super::{JobId, JobRequest};
use tracing::info;

const FIRST_JOB_ID: u64 = 1;

/// Gateway for dry runs: nothing is submitted, requests are kept in order
#[derive(Debug, Clone)]
pub struct RecordingGateway {
    next: u64,
    submitted: Vec<(JobId, JobRequest)>,
}

impl Default for RecordingGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self {
            next: FIRST_JOB_ID,
            submitted: Vec::new(),
        }
    }

    pub fn submit(&mut self, request: &JobRequest) -> JobId {
        let id = JobId(self.next);
        self.next += 1;

        info!(
            job_id = id.0,
            dependency = ?request.batch.dependency,
            "Dry run, not submitting {}: {}",
            request.job_name,
            request.command.to_shell()
        );
        self.submitted.push((id, request.clone()));

        id
    }

    pub fn submitted(&self) -> &[(JobId, JobRequest)] {
        &self.submitted
    }

    pub fn find(&self, id: JobId) -> Option<&JobRequest> {
        self.submitted
            .iter()
            .find(|(job, _)| *job == id)
            .map(|(_, request)| request)
    }
}
