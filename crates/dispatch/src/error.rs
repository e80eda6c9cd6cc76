use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// No concurrency slot opened for the account within the admission window.
    #[error("admission timeout for account {account_id} after {waited_ms}ms")]
    AdmissionTimeout { account_id: String, waited_ms: u64 },

    #[error(transparent)]
    Transport(#[from] chatrelay_transport::Error),

    /// A batch stopped at `index`; `sent` sub-messages had already gone out.
    #[error("batch aborted at message {index} ({sent}/{total} sent): {reason}")]
    BatchAborted {
        index: usize,
        sent: usize,
        total: usize,
        reason: String,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_input(message: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            job_id: job_id.into(),
        }
    }

    #[must_use]
    pub fn admission_timeout(account_id: impl Into<String>, waited_ms: u64) -> Self {
        Self::AdmissionTimeout {
            account_id: account_id.into(),
            waited_ms,
        }
    }

    /// Sub-messages delivered before the failure, for batch aborts.
    #[must_use]
    pub fn sent_before_failure(&self) -> Option<usize> {
        match self {
            Self::BatchAborted { sent, .. } => Some(*sent),
            _ => None,
        }
    }
}

impl From<chatrelay_common::Error> for Error {
    fn from(err: chatrelay_common::Error) -> Self {
        Self::invalid_input(err)
    }
}

impl chatrelay_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

chatrelay_common::impl_context!();

pub type Result<T> = std::result::Result<T, Error>;
