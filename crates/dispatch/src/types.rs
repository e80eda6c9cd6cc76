//! Core data types for the dispatch queue.

use {
    chatrelay_common::types::OutboundMessage,
    serde::{Deserialize, Serialize},
};

/// What a job delivers: one message, or an ordered group sent under one lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobPayload {
    Message(OutboundMessage),
    Batch { messages: Vec<OutboundMessage> },
}

impl JobPayload {
    /// `text`, `image`, `file` or `batch`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(msg) => msg.kind_str(),
            Self::Batch { .. } => "batch",
        }
    }

    /// Number of transport sends the payload needs.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Message(_) => 1,
            Self::Batch { messages } => messages.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a job sits in its lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    InFlight,
    /// Waiting out a contention or backoff delay.
    Requeued,
    Completed,
    /// Attempts exhausted; kept as a dead letter.
    Failed,
}

impl JobState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Requeued => "requeued",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Eligible to be claimed once `run_at_ms` has passed.
    #[must_use]
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::Queued | Self::Requeued)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_flight" | "in-flight" => Ok(Self::InFlight),
            "requeued" => Ok(Self::Requeued),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::invalid_input(format!(
                "unknown job state: {other}"
            ))),
        }
    }
}

/// Delivered message ids of a completed job, in send order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub delivered_ids: Vec<String>,
}

/// Why the most recent attempt failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub attempt: u32,
    pub reason: String,
    /// Batch sub-messages that went out before the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent: Option<usize>,
    pub at_ms: u64,
}

/// One unit of outbound dispatch work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub account_id: String,
    pub recipient_id: String,
    pub payload: JobPayload,
    /// Delivery attempts made so far. Lock contention does not count.
    #[serde(default)]
    pub attempt: u32,
    pub state: JobState,
    /// Earliest time (epoch millis) a worker may claim the job.
    pub run_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_until_ms: Option<u64>,
    #[serde(default)]
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<JobFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
}

impl Job {
    #[must_use]
    pub fn new(
        account_id: impl Into<String>,
        recipient_id: impl Into<String>,
        payload: JobPayload,
        now_ms: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            recipient_id: recipient_id.into(),
            payload,
            attempt: 0,
            state: JobState::Queued,
            run_at_ms: now_ms,
            lease_until_ms: None,
            progress: 0,
            last_failure: None,
            result: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            finished_at_ms: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Put the job back in line without touching `attempt`.
    pub fn requeue(&mut self, run_at_ms: u64, now_ms: u64) {
        self.state = JobState::Requeued;
        self.run_at_ms = run_at_ms;
        self.lease_until_ms = None;
        self.updated_at_ms = now_ms;
    }

    /// Record a failed attempt and schedule the next one.
    pub fn retry_later(&mut self, failure: JobFailure, run_at_ms: u64, now_ms: u64) {
        self.last_failure = Some(failure);
        self.progress = 0;
        self.requeue(run_at_ms, now_ms);
    }

    pub fn complete(&mut self, result: JobResult, now_ms: u64) {
        self.state = JobState::Completed;
        self.result = Some(result);
        self.progress = 100;
        self.lease_until_ms = None;
        self.updated_at_ms = now_ms;
        self.finished_at_ms = Some(now_ms);
    }

    /// Terminal failure: the job becomes a dead letter.
    pub fn fail_terminal(&mut self, failure: JobFailure, now_ms: u64) {
        self.state = JobState::Failed;
        self.last_failure = Some(failure);
        self.lease_until_ms = None;
        self.updated_at_ms = now_ms;
        self.finished_at_ms = Some(now_ms);
    }

    /// Give a dead letter a fresh attempt budget.
    pub fn revive(&mut self, now_ms: u64) {
        self.state = JobState::Queued;
        self.attempt = 0;
        self.progress = 0;
        self.run_at_ms = now_ms;
        self.lease_until_ms = None;
        self.result = None;
        self.updated_at_ms = now_ms;
        self.finished_at_ms = None;
    }
}

/// Selection for [`crate::store::JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub account_id: Option<String>,
}

impl JobFilter {
    #[must_use]
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn matches(&self, job: &Job) -> bool {
        self.state.is_none_or(|s| s == job.state)
            && self
                .account_id
                .as_deref()
                .is_none_or(|a| a == job.account_id)
    }
}

/// How long finished jobs stay around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_max_age_ms: u64,
    pub completed_max_count: usize,
    pub failed_max_age_ms: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_max_age_ms: 3_600_000,
            completed_max_count: 100,
            failed_max_age_ms: 86_400_000,
        }
    }
}

impl From<&chatrelay_config::RetentionConfig> for RetentionPolicy {
    fn from(cfg: &chatrelay_config::RetentionConfig) -> Self {
        Self {
            completed_max_age_ms: cfg.completed_max_age_secs.saturating_mul(1000),
            completed_max_count: cfg.completed_max_count,
            failed_max_age_ms: cfg.failed_max_age_secs.saturating_mul(1000),
        }
    }
}

/// Why a job went back to waiting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequeueReason {
    /// Another job held the chat lock.
    Contention,
    /// A failed attempt is waiting out its backoff.
    Backoff,
}

/// Lifecycle notifications for monitoring surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchEvent {
    Queued {
        job_id: String,
        account_id: String,
        recipient_id: String,
        job_kind: String,
    },
    Active {
        job_id: String,
        attempt: u32,
    },
    Progress {
        job_id: String,
        percent: u8,
    },
    Completed {
        job_id: String,
        delivered_ids: Vec<String>,
    },
    Failed {
        job_id: String,
        attempt: u32,
        reason: String,
        will_retry: bool,
    },
    Requeued {
        job_id: String,
        delay_ms: u64,
        reason: RequeueReason,
    },
    DeadLettered {
        job_id: String,
        attempts: u32,
        reason: String,
    },
}

/// Callback receiving lifecycle events. Runs inline on the worker; keep it cheap.
pub type EventFn = std::sync::Arc<dyn Fn(DispatchEvent) + Send + Sync>;

impl DispatchEvent {
    #[must_use]
    pub fn job_id(&self) -> &str {
        match self {
            Self::Queued { job_id, .. }
            | Self::Active { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Requeued { job_id, .. }
            | Self::DeadLettered { job_id, .. } => job_id,
        }
    }
}
