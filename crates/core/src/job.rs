//! Extraction job records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::filing::FilingRef;
use crate::id::JobId;

/// Job lifecycle status.
///
/// ```text
/// PENDING ──► RUNNING ──► DONE
///                │  ▲
///                │  └──── RETRYING
///                ├──────► RETRYING
///                └──────► FAILED
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for its first dispatch
    Pending,
    /// Claimed by a worker; extraction in flight
    Running,
    /// Last attempt failed; waiting for a delayed redelivery
    Retrying,
    /// Completed with a stored result
    Done,
    /// Gave up; `last_error` explains why
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Retrying,
        JobStatus::Done,
        JobStatus::Failed,
    ];

    /// Statuses that count as "active" for the one-job-per-filing rule.
    pub const ACTIVE: [JobStatus; 3] = [JobStatus::Pending, JobStatus::Running, JobStatus::Retrying];

    /// Statuses a worker may claim a job from.
    pub const CLAIMABLE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Retrying];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Retrying, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Retrying)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "retrying" => Ok(JobStatus::Retrying),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Category of a failed attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The extractor could not make sense of the document
    Parse,
    /// The extractor (or something it depends on) was unavailable
    Unavailable,
    /// The extractor did not answer within the extraction timeout
    Timeout,
    /// No extractor handles this kind of filing
    Unsupported,
    /// The worker holding the job stopped reporting progress
    Stalled,
}

/// Structured summary of the most recent failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Attempt number that produced this failure
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt,
            occurred_at: Utc::now(),
        }
    }
}

/// One extraction task for a filing, possibly spanning several attempts.
///
/// Rows are never deleted. Once terminal, a job can only be superseded by a
/// new job for the same filing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub filing_ref: FilingRef,
    pub status: JobStatus,
    /// Dispatch attempts so far (incremented when a worker claims the job)
    pub attempt_count: u32,
    /// Attempt cap fixed at creation
    pub max_attempts: u32,
    pub last_error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new `PENDING` job.
    pub fn new(filing_ref: FilingRef, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            filing_ref,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another attempt may still be claimed after the current one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::ALL.to_vec())
    }

    #[test]
    fn new_job_is_pending_with_no_attempts() {
        let job = Job::new(FilingRef::new("10-K-001").unwrap(), 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert!(job.last_error.is_none());
        assert!(job.has_attempts_left());
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let job = Job::new(FilingRef::new("10-K-001").unwrap(), 0);
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn lifecycle_edges() {
        use JobStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Retrying.can_transition_to(Running));
        assert!(Running.can_transition_to(Done));
        assert!(Running.can_transition_to(Retrying));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Done));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Retrying.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn status_parses_from_its_string_form() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(matches!(
            "queued".parse::<JobStatus>(),
            Err(DomainError::UnknownStatus(_))
        ));
    }

    #[test]
    fn failure_serializes_kind_in_snake_case() {
        let failure = JobFailure::new(FailureKind::Unavailable, "503 from parser", 2);
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "unavailable");
        assert_eq!(json["attempt"], 2);
    }

    proptest! {
        /// Property: terminal statuses have no outgoing edges.
        #[test]
        fn terminal_statuses_are_sinks(next in any_status()) {
            prop_assert!(!JobStatus::Done.can_transition_to(next));
            prop_assert!(!JobStatus::Failed.can_transition_to(next));
        }

        /// Property: every edge either enters RUNNING from a claimable status
        /// or leaves RUNNING.
        #[test]
        fn edges_pass_through_running(from in any_status(), to in any_status()) {
            if from.can_transition_to(to) {
                let claims = to == JobStatus::Running && JobStatus::CLAIMABLE.contains(&from);
                let settles = from == JobStatus::Running;
                prop_assert!(claims || settles);
            }
        }
    }
}
