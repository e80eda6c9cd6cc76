//! Worker pool: claim a job, wait for an account slot, take the chat lock,
//! send, release both, then record the outcome.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use {
    chatrelay_common::types::{MediaKind, OutboundMessage},
    chatrelay_config::{PacingConfig, RelayConfig},
    chatrelay_transport::MessageTransport,
    futures::FutureExt,
    tokio::{
        sync::{Mutex, Notify},
        task::JoinHandle,
        time::{Instant, MissedTickBehavior},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use chatrelay_metrics::{counter, dispatch as dispatch_metrics, gauge, histogram};

use crate::{
    Error, Result, batch,
    clock::Clock,
    lock::LockManager,
    pacing,
    queue::DispatchQueue,
    retry::{RetryDecision, RetryPolicy},
    store::JobStore,
    throttle::{ConcurrencyThrottle, next_poll},
    types::{
        DispatchEvent, EventFn, Job, JobFailure, JobPayload, JobResult, RequeueReason,
        RetentionPolicy,
    },
};

/// Floor for idle sleeps so a lost claim race does not spin.
const MIN_IDLE: Duration = Duration::from_millis(10);

/// Tunables for [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub workers: usize,
    pub admission_poll: Duration,
    pub admission_max_polls: u32,
    pub lock_ttl: Duration,
    pub contention_delay: Duration,
    /// In-flight lease once a job is admitted. The claim lease adds the
    /// admission window on top.
    pub lease: Duration,
    pub idle_poll: Duration,
    pub shutdown_grace: Duration,
    pub sweep_interval: Duration,
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
    pub pacing: PacingConfig,
    /// Source of run-at, lease and progress timestamps.
    pub clock: Clock,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for DispatcherOptions {
    fn from(cfg: &RelayConfig) -> Self {
        let d = &cfg.dispatch;
        Self {
            workers: d.workers,
            admission_poll: Duration::from_millis(d.admission_poll_ms),
            admission_max_polls: d.admission_max_polls,
            lock_ttl: Duration::from_secs(d.lock_ttl_secs),
            contention_delay: Duration::from_millis(d.contention_delay_ms),
            lease: Duration::from_secs(d.lease_secs),
            idle_poll: Duration::from_millis(d.idle_poll_ms),
            shutdown_grace: Duration::from_secs(d.shutdown_grace_secs),
            sweep_interval: Duration::from_secs(cfg.retention.sweep_interval_secs.max(1)),
            retry: RetryPolicy::from(&cfg.retry),
            retention: RetentionPolicy::from(&cfg.retention),
            pacing: cfg.pacing.clone(),
            clock: Clock::system(),
        }
    }
}

impl DispatcherOptions {
    /// Longest a job may wait for an account slot before the attempt fails.
    #[must_use]
    pub fn admission_window(&self) -> Duration {
        self.admission_poll.saturating_mul(self.admission_max_polls)
    }

    fn claim_lease(&self) -> Duration {
        self.lease + self.admission_window()
    }
}

/// Counts from one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub recovered: usize,
    pub purged: usize,
}

enum Admission {
    Granted,
    Contended,
}

/// The dispatch worker pool.
///
/// A stopped dispatcher cannot be restarted; build a new one.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    locks: Arc<dyn LockManager>,
    throttle: Arc<dyn ConcurrencyThrottle>,
    transport: Arc<dyn MessageTransport>,
    options: DispatcherOptions,
    on_event: Option<EventFn>,
    clock: Clock,
    wake: Arc<Notify>,
    slot_freed: Notify,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<dyn LockManager>,
        throttle: Arc<dyn ConcurrencyThrottle>,
        transport: Arc<dyn MessageTransport>,
        options: DispatcherOptions,
    ) -> Arc<Self> {
        Self::with_events(store, locks, throttle, transport, options, None)
    }

    /// Create a dispatcher that reports lifecycle events to `on_event`.
    pub fn with_events(
        store: Arc<dyn JobStore>,
        locks: Arc<dyn LockManager>,
        throttle: Arc<dyn ConcurrencyThrottle>,
        transport: Arc<dyn MessageTransport>,
        options: DispatcherOptions,
        on_event: Option<EventFn>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            locks,
            throttle,
            transport,
            clock: options.clock,
            options,
            on_event,
            wake: Arc::new(Notify::new()),
            slot_freed: Notify::new(),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Enqueue handle sharing this dispatcher's store, clock, wake-up and events.
    #[must_use]
    pub fn queue(&self) -> DispatchQueue {
        DispatchQueue::with_parts(
            Arc::clone(&self.store),
            self.clock,
            Arc::clone(&self.wake),
            self.on_event.clone(),
        )
    }

    #[must_use]
    pub fn options(&self) -> &DispatcherOptions {
        &self.options
    }

    /// Spawn the workers and the retention sweeper.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            warn!("dispatcher already running");
            return;
        }
        let workers = self.options.workers.max(1);
        for worker in 0..workers {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move { this.worker_loop(worker).await }));
        }
        let this = Arc::clone(self);
        handles.push(tokio::spawn(async move { this.janitor_loop().await }));

        info!(
            workers,
            ceiling = self.throttle.ceiling(),
            lock_ttl_secs = self.options.lock_ttl.as_secs(),
            "dispatcher started"
        );
    }

    /// Stop claiming, let in-flight jobs finish within the grace period, then abort.
    ///
    /// Aborted jobs keep their lease and are picked up again once it runs out.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.wake.notify_waiters();

        let handles = std::mem::take(&mut *self.handles.lock().await);
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let grace = self.options.shutdown_grace;
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                grace_secs = grace.as_secs(),
                "in-flight jobs did not finish in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
        info!("dispatcher stopped");
    }

    /// Requeue stalled jobs and evict expired ones. Also runs periodically.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now_ms();
        let recovered = self.store.recover_stalled(now).await?;
        let purged = self.store.purge(&self.options.retention, now).await?;
        if recovered > 0 {
            warn!(recovered, "requeued jobs whose lease expired");
            self.wake.notify_one();
        }
        if purged > 0 {
            debug!(purged, "purged finished jobs");
        }
        #[cfg(feature = "metrics")]
        {
            counter!(dispatch_metrics::STALLED_RECOVERED_TOTAL).increment(recovered as u64);
            counter!(dispatch_metrics::PURGED_TOTAL).increment(purged as u64);
        }
        Ok(SweepReport { recovered, purged })
    }

    // ── Internal ────────────────────────────────────────────────────────

    fn emit(&self, event: DispatchEvent) {
        if let Some(ref on_event) = self.on_event {
            on_event(event);
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "dispatch worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let now = self.clock.now_ms();
            let lease_until = now + self.options.claim_lease().as_millis() as u64;
            match self.store.claim_due(now, lease_until).await {
                Ok(Some(job)) => {
                    // More work may be due; let another idle worker look.
                    self.wake.notify_one();
                    self.process(job).await;
                    continue;
                },
                Ok(None) => {},
                Err(e) => warn!(worker, error = %e, "failed to claim job"),
            }

            let idle = self.idle_wait().await;
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(idle) => {},
                () = self.wake.notified() => {},
            }
        }
        debug!(worker, "dispatch worker stopped");
    }

    async fn idle_wait(&self) -> Duration {
        let idle = self.options.idle_poll;
        match self.store.next_due_at().await {
            Ok(Some(at)) => Duration::from_millis(at.saturating_sub(self.clock.now_ms()))
                .min(idle)
                .max(MIN_IDLE),
            _ => idle.max(MIN_IDLE),
        }
    }

    async fn janitor_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.options.sweep_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "retention sweep failed");
                    }
                },
            }
        }
    }

    async fn process(&self, mut job: Job) {
        let attempt = job.attempt + 1;
        info!(
            job_id = %job.id,
            account_id = %job.account_id,
            recipient_id = %job.recipient_id,
            kind = job.kind(),
            attempt,
            "dispatching job"
        );
        #[cfg(feature = "metrics")]
        counter!(dispatch_metrics::ATTEMPTS_TOTAL).increment(1);
        self.emit(DispatchEvent::Active {
            job_id: job.id.clone(),
            attempt,
        });

        let holder = format!("{}:{}", job.id, uuid::Uuid::new_v4().simple());
        let outcome = match self.admit(&job, &holder).await {
            Ok(Admission::Granted) => Some(self.run_admitted(&mut job, &holder).await),
            Ok(Admission::Contended) => None,
            Err(e) => Some(Err(e)),
        };

        match outcome {
            None => self.reschedule_contended(&mut job).await,
            Some(Ok(result)) => self.resolve_success(&mut job, result).await,
            Some(Err(err)) => self.resolve_failure(&mut job, err).await,
        }
    }

    /// Wait for an account slot, then take the chat lock and the slot.
    async fn admit(&self, job: &Job, holder: &str) -> Result<Admission> {
        let account_id = job.account_id.as_str();
        let recipient_id = job.recipient_id.as_str();
        let started = Instant::now();
        let deadline = started + self.options.admission_window();

        loop {
            // Registered before the check so a release in between still wakes us.
            let freed = self.slot_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if self.throttle.try_admit(account_id).await? {
                if !self
                    .locks
                    .acquire(account_id, recipient_id, holder, self.options.lock_ttl)
                    .await?
                {
                    return Ok(Admission::Contended);
                }
                match self
                    .throttle
                    .try_acquire(account_id, holder, self.options.lease)
                    .await
                {
                    Ok(true) => return Ok(Admission::Granted),
                    Ok(false) => {
                        debug!(job_id = %job.id, account_id, "slot taken before increment, waiting again");
                        self.locks.release(account_id, recipient_id, holder).await?;
                    },
                    Err(e) => {
                        if let Err(release_err) =
                            self.locks.release(account_id, recipient_id, holder).await
                        {
                            warn!(job_id = %job.id, error = %release_err, "lock release failed");
                        }
                        return Err(e);
                    },
                }
            }

            let Some(wait) = next_poll(self.options.admission_poll, deadline, Instant::now())
            else {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(job_id = %job.id, account_id, waited_ms, "no concurrency slot within the admission window");
                #[cfg(feature = "metrics")]
                counter!(dispatch_metrics::ADMISSION_TIMEOUTS_TOTAL).increment(1);
                return Err(Error::admission_timeout(account_id, waited_ms));
            };
            debug!(
                job_id = %job.id,
                account_id,
                wait_ms = wait.as_millis() as u64,
                "account at its concurrency ceiling"
            );
            tokio::select! {
                () = tokio::time::sleep(wait) => {},
                () = &mut freed => {},
            }
        }
    }

    /// Deliver while holding lock and slot; both are released whatever happens.
    async fn run_admitted(&self, job: &mut Job, holder: &str) -> Result<JobResult> {
        #[cfg(feature = "metrics")]
        gauge!(dispatch_metrics::IN_FLIGHT).increment(1.0);
        let started = Instant::now();

        let outcome = AssertUnwindSafe(self.deliver(job, holder))
            .catch_unwind()
            .await;
        self.release(job, holder).await;

        #[cfg(feature = "metrics")]
        {
            gauge!(dispatch_metrics::IN_FLIGHT).decrement(1.0);
            histogram!(dispatch_metrics::SEND_DURATION_SECONDS)
                .record(started.elapsed().as_secs_f64());
        }
        debug!(
            job_id = %job.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "lock and slot released"
        );

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                error!(job_id = %job.id, "delivery panicked");
                Err(Error::message(format!(
                    "delivery panicked: {}",
                    panic_message(panic.as_ref())
                )))
            },
        }
    }

    async fn release(&self, job: &Job, holder: &str) {
        if let Err(e) = self
            .locks
            .release(&job.account_id, &job.recipient_id, holder)
            .await
        {
            warn!(job_id = %job.id, error = %e, "lock release failed, ttl will expire it");
        }
        if let Err(e) = self.throttle.release(&job.account_id, holder).await {
            warn!(job_id = %job.id, error = %e, "slot release failed");
        }
        self.slot_freed.notify_waiters();
    }

    async fn deliver(&self, job: &mut Job, holder: &str) -> Result<JobResult> {
        match job.payload.clone() {
            JobPayload::Message(msg) => {
                self.report_progress(job, 25).await;
                let delivered_id = self.send_one(job, holder, &msg).await?;
                self.report_progress(job, 75).await;
                Ok(JobResult {
                    delivered_ids: vec![delivered_id],
                })
            },
            JobPayload::Batch { messages } => batch::run(self, job, holder, &messages).await,
        }
    }

    /// Seen, pause, then typing choreography for text or a plain media send.
    ///
    /// Lock, slot and lease are refreshed before every gateway call, so the
    /// lock only has to outlive one call plus the pause that precedes it.
    pub(crate) async fn send_one(
        &self,
        job: &mut Job,
        holder: &str,
        msg: &OutboundMessage,
    ) -> Result<String> {
        let pacing = &self.options.pacing;
        let (account, recipient) = (job.account_id.clone(), job.recipient_id.clone());
        let (account_id, recipient_id) = (account.as_str(), recipient.as_str());

        self.extend_hold(job, holder).await?;
        self.transport.mark_seen(account_id, recipient_id).await?;
        tokio::time::sleep(pacing::seen_pause(pacing)).await;
        self.extend_hold(job, holder).await?;

        let delivery = match msg {
            OutboundMessage::Text { text, reply_to } => {
                self.transport
                    .set_typing(account_id, recipient_id, true)
                    .await?;
                let typing = pacing::typing_delay(pacing, text);
                debug!(
                    account_id,
                    recipient_id,
                    typing_ms = typing.as_millis() as u64,
                    "typing"
                );
                tokio::time::sleep(typing).await;
                self.extend_hold(job, holder).await?;
                let sent = self
                    .transport
                    .send_text(account_id, recipient_id, text, reply_to.as_deref())
                    .await;
                // The text is out either way; a lost lock only skips the typing reset.
                match self.extend_hold(job, holder).await {
                    Ok(()) => {
                        if let Err(e) = self
                            .transport
                            .set_typing(account_id, recipient_id, false)
                            .await
                        {
                            warn!(account_id, recipient_id, error = %e, "failed to clear typing indicator");
                        }
                    },
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "chat lock lost after send, typing indicator left on");
                    },
                }
                sent?
            },
            OutboundMessage::Image(media) => {
                self.transport
                    .send_media(account_id, recipient_id, MediaKind::Image, media)
                    .await?
            },
            OutboundMessage::File(media) => {
                self.transport
                    .send_media(account_id, recipient_id, MediaKind::File, media)
                    .await?
            },
        };
        Ok(delivery.delivered_id)
    }

    pub(crate) async fn report_progress(&self, job: &mut Job, percent: u8) {
        job.progress = percent;
        job.updated_at_ms = self.clock.now_ms();
        if let Err(e) = self.store.update(job).await {
            debug!(job_id = %job.id, error = %e, "failed to persist progress");
        }
        self.emit(DispatchEvent::Progress {
            job_id: job.id.clone(),
            percent,
        });
    }

    /// Keep lock, slot and job lease alive. Fails once the chat lock is gone.
    async fn extend_hold(&self, job: &mut Job, holder: &str) -> Result<()> {
        let still_held = self
            .locks
            .refresh(
                &job.account_id,
                &job.recipient_id,
                holder,
                self.options.lock_ttl,
            )
            .await?;
        if !still_held {
            return Err(Error::message("chat lock expired mid-delivery"));
        }
        self.throttle
            .refresh(&job.account_id, holder, self.options.lease)
            .await?;
        let now = self.clock.now_ms();
        job.lease_until_ms = Some(now + self.options.lease.as_millis() as u64);
        job.updated_at_ms = now;
        self.store.update(job).await
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.store.update(job).await {
            error!(
                job_id = %job.id,
                state = %job.state,
                error = %e,
                "failed to persist job outcome, lease recovery will retry it"
            );
        }
    }

    async fn reschedule_contended(&self, job: &mut Job) {
        let now = self.clock.now_ms();
        let delay_ms = self.options.contention_delay.as_millis() as u64;
        job.requeue(now + delay_ms, now);
        self.persist(job).await;
        info!(
            job_id = %job.id,
            account_id = %job.account_id,
            recipient_id = %job.recipient_id,
            delay_ms,
            "chat locked by another job, rescheduled"
        );
        #[cfg(feature = "metrics")]
        counter!(dispatch_metrics::LOCK_CONTENTION_TOTAL).increment(1);
        self.emit(DispatchEvent::Requeued {
            job_id: job.id.clone(),
            delay_ms,
            reason: RequeueReason::Contention,
        });
    }

    async fn resolve_success(&self, job: &mut Job, result: JobResult) {
        let now = self.clock.now_ms();
        job.attempt += 1;
        let reported_full = job.progress >= 100;
        job.complete(result.clone(), now);
        self.persist(job).await;
        info!(
            job_id = %job.id,
            attempt = job.attempt,
            sent = result.delivered_ids.len(),
            "job completed"
        );
        #[cfg(feature = "metrics")]
        counter!(dispatch_metrics::JOBS_COMPLETED_TOTAL).increment(1);
        if !reported_full {
            self.emit(DispatchEvent::Progress {
                job_id: job.id.clone(),
                percent: 100,
            });
        }
        self.emit(DispatchEvent::Completed {
            job_id: job.id.clone(),
            delivered_ids: result.delivered_ids,
        });
    }

    async fn resolve_failure(&self, job: &mut Job, err: Error) {
        let now = self.clock.now_ms();
        job.attempt += 1;
        let reason = err.to_string();
        let failure = JobFailure {
            attempt: job.attempt,
            reason: reason.clone(),
            sent: err.sent_before_failure(),
            at_ms: now,
        };
        #[cfg(feature = "metrics")]
        counter!(dispatch_metrics::ATTEMPT_FAILURES_TOTAL).increment(1);

        match self.options.retry.decide(job.attempt) {
            RetryDecision::Retry { delay } => {
                let delay_ms = delay.as_millis() as u64;
                job.retry_later(failure, now + delay_ms, now);
                self.persist(job).await;
                warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    delay_ms,
                    error = %reason,
                    "delivery failed, retrying"
                );
                self.emit(DispatchEvent::Failed {
                    job_id: job.id.clone(),
                    attempt: job.attempt,
                    reason,
                    will_retry: true,
                });
                self.emit(DispatchEvent::Requeued {
                    job_id: job.id.clone(),
                    delay_ms,
                    reason: RequeueReason::Backoff,
                });
            },
            RetryDecision::Exhausted => {
                job.fail_terminal(failure, now);
                self.persist(job).await;
                error!(
                    job_id = %job.id,
                    attempts = job.attempt,
                    error = %reason,
                    "delivery failed, attempts exhausted"
                );
                #[cfg(feature = "metrics")]
                counter!(dispatch_metrics::DEAD_LETTERED_TOTAL).increment(1);
                self.emit(DispatchEvent::Failed {
                    job_id: job.id.clone(),
                    attempt: job.attempt,
                    reason: reason.clone(),
                    will_retry: false,
                });
                self.emit(DispatchEvent::DeadLettered {
                    job_id: job.id.clone(),
                    attempts: job.attempt,
                    reason,
                });
            },
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            lock::InMemoryLockManager, store_memory::InMemoryJobStore,
            throttle::InMemoryThrottle, types::JobState,
        },
        async_trait::async_trait,
        chatrelay_common::types::MediaMessage,
        chatrelay_transport::{Delivery, RecordingTransport},
    };

    fn quick_options() -> DispatcherOptions {
        DispatcherOptions {
            workers: 2,
            pacing: PacingConfig::instant(),
            clock: Clock::tokio(),
            ..DispatcherOptions::default()
        }
    }

    /// Transport whose text sends panic.
    struct PanickingTransport;

    #[async_trait]
    impl MessageTransport for PanickingTransport {
        async fn mark_seen(&self, _: &str, _: &str) -> chatrelay_transport::Result<()> {
            Ok(())
        }

        async fn set_typing(&self, _: &str, _: &str, _: bool) -> chatrelay_transport::Result<()> {
            Ok(())
        }

        async fn send_text(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Option<&str>,
        ) -> chatrelay_transport::Result<Delivery> {
            panic!("gateway client bug")
        }

        async fn send_media(
            &self,
            _: &str,
            _: &str,
            _: MediaKind,
            _: &MediaMessage,
        ) -> chatrelay_transport::Result<Delivery> {
            Ok(Delivery {
                delivered_id: "m".into(),
            })
        }
    }

    #[test]
    fn options_follow_config() {
        let mut cfg = RelayConfig::default();
        cfg.dispatch.admission_poll_ms = 5_000;
        cfg.dispatch.admission_max_polls = 60;
        cfg.retry.max_attempts = 5;
        let opts = DispatcherOptions::from(&cfg);
        assert_eq!(opts.admission_window(), Duration::from_secs(300));
        assert_eq!(opts.retry.max_attempts, 5);
        assert_eq!(opts.contention_delay, Duration::from_millis(2_000));
        assert_eq!(opts.claim_lease(), Duration::from_secs(420));
    }

    #[test]
    fn panic_payloads_render() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[tokio::test(start_paused = true)]
    async fn panic_mid_send_still_releases() {
        let store = Arc::new(InMemoryJobStore::new());
        let locks = Arc::new(InMemoryLockManager::new());
        let throttle = Arc::new(InMemoryThrottle::new(2));
        let dispatcher = Dispatcher::new(
            store.clone(),
            locks.clone(),
            throttle.clone(),
            Arc::new(PanickingTransport),
            quick_options(),
        );
        let id = dispatcher
            .queue()
            .enqueue_text("A", "123", "hello", None)
            .await
            .unwrap();
        let job = store
            .claim_due(u64::MAX, u64::MAX)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);

        dispatcher.process(job).await;

        assert!(!locks.is_locked("A", "123"));
        assert_eq!(throttle.in_flight("A").await.unwrap(), 0);
        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Requeued);
        assert_eq!(job.attempt, 1);
        assert!(
            job.last_failure
                .unwrap()
                .reason
                .contains("gateway client bug")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn admission_times_out_when_account_stays_saturated() {
        let store = Arc::new(InMemoryJobStore::new());
        let throttle = Arc::new(InMemoryThrottle::new(1));
        throttle
            .try_acquire("A", "someone-else", Duration::from_secs(600))
            .await
            .unwrap();
        let options = DispatcherOptions {
            admission_poll: Duration::from_millis(100),
            admission_max_polls: 3,
            ..quick_options()
        };
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(InMemoryLockManager::new()),
            throttle,
            Arc::new(RecordingTransport::new()),
            options,
        );
        let id = dispatcher
            .queue()
            .enqueue_text("A", "123", "hello", None)
            .await
            .unwrap();
        let job = store
            .claim_due(u64::MAX, u64::MAX)
            .await
            .unwrap()
            .unwrap();

        let started = Instant::now();
        dispatcher.process(job).await;
        assert_eq!(started.elapsed(), Duration::from_millis(300));

        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        let failure = job.last_failure.unwrap();
        assert!(failure.reason.contains("admission timeout"), "{}", failure.reason);
    }

    #[tokio::test(start_paused = true)]
    async fn release_of_a_slot_wakes_waiting_admission() {
        let store = Arc::new(InMemoryJobStore::new());
        let throttle = Arc::new(InMemoryThrottle::new(1));
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(InMemoryLockManager::new()),
            throttle.clone(),
            transport.clone(),
            quick_options(),
        );
        throttle
            .try_acquire("A", "blocker", Duration::from_secs(600))
            .await
            .unwrap();
        let id = dispatcher
            .queue()
            .enqueue_text("A", "123", "hello", None)
            .await
            .unwrap();
        let job = store
            .claim_due(u64::MAX, u64::MAX)
            .await
            .unwrap()
            .unwrap();

        let started = Instant::now();
        let runner = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.process(job).await })
        };
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        throttle.release("A", "blocker").await.unwrap();
        dispatcher.slot_freed.notify_waiters();
        runner.await.unwrap();

        // Woken by the release rather than the next 5s poll.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().state,
            JobState::Completed
        );
        assert_eq!(transport.sends().len(), 1);
    }
}
