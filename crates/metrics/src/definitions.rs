//! Metric name and label definitions.
//!
//! Every metric the relay records is named here so dashboards have a single
//! place to look.

/// Outbound dispatch metrics
pub mod dispatch {
    /// Jobs accepted by the queue (label: `kind`)
    pub const JOBS_ENQUEUED_TOTAL: &str = "chatrelay_dispatch_jobs_enqueued_total";
    /// Delivery attempts started, including retries
    pub const ATTEMPTS_TOTAL: &str = "chatrelay_dispatch_attempts_total";
    /// Jobs delivered in full
    pub const JOBS_COMPLETED_TOTAL: &str = "chatrelay_dispatch_jobs_completed_total";
    /// Failed attempts, retried or not
    pub const ATTEMPT_FAILURES_TOTAL: &str = "chatrelay_dispatch_attempt_failures_total";
    /// Jobs that exhausted their attempts
    pub const DEAD_LETTERED_TOTAL: &str = "chatrelay_dispatch_dead_lettered_total";
    /// Jobs rescheduled because another job held the chat lock
    pub const LOCK_CONTENTION_TOTAL: &str = "chatrelay_dispatch_lock_contention_total";
    /// Attempts that gave up waiting for an account slot
    pub const ADMISSION_TIMEOUTS_TOTAL: &str = "chatrelay_dispatch_admission_timeouts_total";
    /// Jobs currently holding a lock and a slot
    pub const IN_FLIGHT: &str = "chatrelay_dispatch_in_flight";
    /// Time spent holding a lock and slot, in seconds
    pub const SEND_DURATION_SECONDS: &str = "chatrelay_dispatch_send_duration_seconds";
    /// In-flight jobs whose lease ran out and were requeued
    pub const STALLED_RECOVERED_TOTAL: &str = "chatrelay_dispatch_stalled_recovered_total";
    /// Finished jobs evicted by retention
    pub const PURGED_TOTAL: &str = "chatrelay_dispatch_purged_total";
}

/// Gateway transport metrics
pub mod gateway {
    /// Requests sent to the gateway (labels: `endpoint`, `status`)
    pub const REQUESTS_TOTAL: &str = "chatrelay_gateway_requests_total";
    /// Gateway request duration in seconds (label: `endpoint`)
    pub const REQUEST_DURATION_SECONDS: &str = "chatrelay_gateway_request_duration_seconds";
}

/// Common label keys
pub mod labels {
    pub const KIND: &str = "kind";
    pub const ENDPOINT: &str = "endpoint";
    pub const STATUS: &str = "status";
    pub const REASON: &str = "reason";
}

/// Histogram bucket boundaries
pub mod buckets {
    /// Send durations: pacing alone can take ~12s, slow gateways a lot longer.
    pub const SEND_DURATION: [f64; 12] = [
        0.1, 0.5, 1.0, 2.0, 4.0, 6.0, 8.0, 10.0, 15.0, 20.0, 30.0, 60.0,
    ];

    /// Gateway request durations, 5ms to 30s.
    pub const GATEWAY_DURATION: [f64; 11] = [
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0, 30.0,
    ];
}
