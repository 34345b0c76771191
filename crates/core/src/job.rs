use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::algorithms::{AlgorithmId, AlgorithmParams, DownloadFormat};

/// Fixed user-facing message recorded whenever a job ends because of an abort.
pub const ABORTED_BY_USER: &str = "Aborted by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
    Deferred,
    Scheduled,
    Canceled,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled | JobStatus::Stopped
        )
    }

    /// Whether a status change along this edge is defined by the job state
    /// machine. Self-transitions are allowed so idempotent re-writes of the
    /// current status stay legal. `Deferred` and `Scheduled` are status
    /// vocabulary only and have no edges.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            JobStatus::Queued => matches!(next, JobStatus::Started | JobStatus::Canceled),
            JobStatus::Started => matches!(
                next,
                JobStatus::Finished | JobStatus::Failed | JobStatus::Stopped
            ),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Deferred => "deferred",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Canceled => "canceled",
            JobStatus::Stopped => "stopped",
        }
    }
}

/// Persistent job metadata, one JSON document per job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub algorithm: AlgorithmId,
    pub params: AlgorithmParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_shape: Option<Vec<usize>>,
    pub result_dataset: String,
    pub available_formats: Vec<DownloadFormat>,
    pub created_at: DateTime<Utc>,
    pub input_filename: String,
    #[serde(default = "default_true")]
    pub input_available: bool,
    #[serde(default)]
    pub result_available: bool,
    #[serde(default)]
    pub log_messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_task_id: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
}

fn default_true() -> bool {
    true
}

/// Partial update applied to a stored [`JobRecord`] via read-modify-write.
///
/// `error` distinguishes "leave unchanged" (`None`) from "clear"
/// (`Some(None)`) so a finished run can drop a stale message.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub result_shape: Option<Vec<usize>>,
    pub result_dataset: Option<String>,
    pub error: Option<Option<String>>,
    pub log_messages: Option<Vec<String>>,
    pub queue_task_id: Option<String>,
    pub cancel_requested: Option<bool>,
}
