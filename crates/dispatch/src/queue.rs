//! Producer side of the dispatch queue.

use std::sync::Arc;

use {
    chatrelay_common::types::{FileRef, MediaKind, MediaMessage, OutboundMessage},
    tokio::sync::Notify,
    tracing::info,
};

#[cfg(feature = "metrics")]
use chatrelay_metrics::{counter, dispatch as dispatch_metrics, labels};

use crate::{
    Error, Result,
    clock::Clock,
    store::JobStore,
    types::{DispatchEvent, EventFn, Job, JobFilter, JobPayload, JobState, RetentionPolicy},
};

/// Enqueue and inspect jobs.
///
/// Cheap to clone. A queue obtained from [`crate::Dispatcher::queue`] wakes
/// idle workers on enqueue; a standalone one (e.g. a CLI writing to the shared
/// database) relies on the workers' idle poll.
#[derive(Clone)]
pub struct DispatchQueue {
    store: Arc<dyn JobStore>,
    clock: Clock,
    wake: Arc<Notify>,
    on_event: Option<EventFn>,
}

impl DispatchQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_parts(store, Clock::system(), Arc::new(Notify::new()), None)
    }

    pub(crate) fn with_parts(
        store: Arc<dyn JobStore>,
        clock: Clock,
        wake: Arc<Notify>,
        on_event: Option<EventFn>,
    ) -> Self {
        Self {
            store,
            clock,
            wake,
            on_event,
        }
    }

    /// Report `Queued` events from this handle.
    #[must_use]
    pub fn with_events(mut self, on_event: EventFn) -> Self {
        self.on_event = Some(on_event);
        self
    }

    pub async fn enqueue_text(
        &self,
        account_id: &str,
        recipient_id: &str,
        text: impl Into<String>,
        reply_to: Option<String>,
    ) -> Result<String> {
        let msg = OutboundMessage::Text {
            text: text.into(),
            reply_to,
        };
        self.enqueue(account_id, recipient_id, JobPayload::Message(msg))
            .await
    }

    pub async fn enqueue_media(
        &self,
        account_id: &str,
        recipient_id: &str,
        kind: MediaKind,
        file: FileRef,
        caption: Option<String>,
        reply_to: Option<String>,
    ) -> Result<String> {
        let msg = OutboundMessage::media(kind, MediaMessage {
            file,
            caption,
            reply_to,
        });
        self.enqueue(account_id, recipient_id, JobPayload::Message(msg))
            .await
    }

    /// Enqueue an ordered batch delivered as one job.
    pub async fn enqueue_batch(
        &self,
        account_id: &str,
        recipient_id: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<String> {
        self.enqueue(account_id, recipient_id, JobPayload::Batch { messages })
            .await
    }

    /// Validate, persist and announce a job. Returns its id.
    pub async fn enqueue(
        &self,
        account_id: &str,
        recipient_id: &str,
        payload: JobPayload,
    ) -> Result<String> {
        validate(account_id, recipient_id, &payload)?;

        let job = Job::new(account_id, recipient_id, payload, self.clock.now_ms());
        self.store.insert(&job).await?;
        info!(
            job_id = %job.id,
            account_id,
            recipient_id,
            kind = job.kind(),
            messages = job.payload.len(),
            "job enqueued"
        );
        #[cfg(feature = "metrics")]
        counter!(dispatch_metrics::JOBS_ENQUEUED_TOTAL, labels::KIND => job.kind()).increment(1);

        if let Some(ref on_event) = self.on_event {
            on_event(DispatchEvent::Queued {
                job_id: job.id.clone(),
                account_id: job.account_id.clone(),
                recipient_id: job.recipient_id.clone(),
                job_kind: job.kind().to_string(),
            });
        }
        self.wake.notify_one();
        Ok(job.id)
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::job_not_found(id))
    }

    pub async fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>> {
        self.store.list(filter, limit).await
    }

    /// Jobs that exhausted their attempts, newest first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<Job>> {
        self.store
            .list(&JobFilter::state(JobState::Failed), limit)
            .await
    }

    /// Put a dead letter back in the queue with a fresh attempt budget.
    pub async fn retry_dead(&self, id: &str) -> Result<Job> {
        let mut job = self.get(id).await?;
        if job.state != JobState::Failed {
            return Err(Error::invalid_input(format!(
                "job {id} is {}, only failed jobs can be retried",
                job.state
            )));
        }
        job.revive(self.clock.now_ms());
        self.store.update(&job).await?;
        info!(job_id = %job.id, "dead letter requeued");
        self.wake.notify_one();
        Ok(job)
    }

    /// Evict finished jobs now instead of waiting for the periodic sweep.
    pub async fn purge(&self, retention: &RetentionPolicy) -> Result<usize> {
        self.store.purge(retention, self.clock.now_ms()).await
    }
}

fn validate(account_id: &str, recipient_id: &str, payload: &JobPayload) -> Result<()> {
    if account_id.trim().is_empty() {
        return Err(Error::invalid_input("account_id must not be empty"));
    }
    if recipient_id.trim().is_empty() {
        return Err(Error::invalid_input("recipient_id must not be empty"));
    }
    match payload {
        JobPayload::Message(msg) => msg.validate()?,
        JobPayload::Batch { messages } => {
            if messages.is_empty() {
                return Err(Error::invalid_input("batch must contain at least one message"));
            }
            for msg in messages {
                msg.validate()?;
            }
        },
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::store_memory::InMemoryJobStore,
        std::sync::Mutex,
    };

    fn queue() -> DispatchQueue {
        DispatchQueue::new(Arc::new(InMemoryJobStore::new()))
    }

    fn pdf() -> FileRef {
        FileRef {
            url: "https://files.example/report.pdf".into(),
            filename: "report.pdf".into(),
            mimetype: "application/pdf".into(),
        }
    }

    #[tokio::test]
    async fn enqueue_text_persists_a_queued_job() {
        let queue = queue();
        let id = queue
            .enqueue_text("A", "123", "hello", Some("m-1".into()))
            .await
            .unwrap();
        let job = queue.get(&id).await.unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.kind(), "text");
        assert_eq!(
            job.payload,
            JobPayload::Message(OutboundMessage::Text {
                text: "hello".into(),
                reply_to: Some("m-1".into()),
            })
        );
    }

    #[tokio::test]
    async fn enqueue_media_keeps_caption() {
        let queue = queue();
        let id = queue
            .enqueue_media("A", "123", MediaKind::File, pdf(), Some("Q3".into()), None)
            .await
            .unwrap();
        let JobPayload::Message(OutboundMessage::File(media)) = queue.get(&id).await.unwrap().payload
        else {
            panic!("expected a file message");
        };
        assert_eq!(media.caption.as_deref(), Some("Q3"));
        assert_eq!(media.file, pdf());
    }

    #[tokio::test]
    async fn invalid_jobs_are_rejected() {
        let queue = queue();
        assert!(matches!(
            queue.enqueue_text("", "123", "hi", None).await,
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            queue.enqueue_text("A", " ", "hi", None).await,
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            queue.enqueue_text("A", "123", "   ", None).await,
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            queue.enqueue_batch("A", "123", vec![]).await,
            Err(Error::InvalidInput { .. })
        ));
        assert!(queue.list(&JobFilter::default(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queued_event_is_reported() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let queue = queue().with_events(Arc::new(move |event| {
            sink.lock().unwrap_or_else(|e| e.into_inner()).push(event);
        }));
        let id = queue
            .enqueue_batch("A", "123", vec![
                OutboundMessage::text("one"),
                OutboundMessage::text("two"),
            ])
            .await
            .unwrap();
        let events = seen.lock().unwrap().clone();
        assert_eq!(events, vec![DispatchEvent::Queued {
            job_id: id,
            account_id: "A".into(),
            recipient_id: "123".into(),
            job_kind: "batch".into(),
        }]);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        assert!(matches!(
            queue().get("nope").await,
            Err(Error::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn only_dead_letters_can_be_retried() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = DispatchQueue::new(store.clone());
        let id = queue.enqueue_text("A", "123", "hi", None).await.unwrap();
        assert!(matches!(
            queue.retry_dead(&id).await,
            Err(Error::InvalidInput { .. })
        ));

        let mut job = queue.get(&id).await.unwrap();
        job.attempt = 3;
        job.fail_terminal(
            crate::types::JobFailure {
                attempt: 3,
                reason: "gateway down".into(),
                sent: None,
                at_ms: 1,
            },
            1,
        );
        store.update(&job).await.unwrap();
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 1);

        let revived = queue.retry_dead(&id).await.unwrap();
        assert_eq!(revived.state, JobState::Queued);
        assert_eq!(revived.attempt, 0);
        assert!(revived.finished_at_ms.is_none());
        // The failure history stays for inspection.
        assert!(revived.last_failure.is_some());
        assert!(queue.dead_letters(10).await.unwrap().is_empty());
    }
}
