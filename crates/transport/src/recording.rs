//! In-memory transport that records every call.
//!
//! Used by tests and by `--dry-run` workers. Sends (or every call) can be
//! delayed to widen the in-flight window, and sends can be scripted to fail
//! by kind or by count.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    chatrelay_common::types::{MediaKind, MediaMessage},
    tokio::time::Instant,
    tracing::info,
};

use crate::{Delivery, Error, MessageTransport, Result};

/// One observed transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    MarkSeen {
        account_id: String,
        recipient_id: String,
    },
    Typing {
        account_id: String,
        recipient_id: String,
        on: bool,
    },
    Text {
        account_id: String,
        recipient_id: String,
        text: String,
        reply_to: Option<String>,
    },
    Media {
        account_id: String,
        recipient_id: String,
        kind: MediaKind,
        filename: String,
        caption: Option<String>,
    },
}

impl RecordedCall {
    #[must_use]
    pub fn is_send(&self) -> bool {
        matches!(self, Self::Text { .. } | Self::Media { .. })
    }

    fn send_kind(&self) -> Option<&'static str> {
        match self {
            Self::Text { .. } => Some("text"),
            Self::Media { kind, .. } => Some(kind.as_str()),
            _ => None,
        }
    }
}

#[derive(Default)]
struct FailurePlan {
    all_sends: bool,
    kinds: Vec<&'static str>,
    next_sends: usize,
}

#[derive(Default)]
struct InFlight {
    per_account: HashMap<String, usize>,
    per_pair: HashMap<(String, String), usize>,
    peak_account: HashMap<String, usize>,
    peak_pair: HashMap<(String, String), usize>,
}

/// [`MessageTransport`] that keeps a timeline of calls instead of sending.
pub struct RecordingTransport {
    calls: Mutex<Vec<(Instant, RecordedCall)>>,
    failures: Mutex<FailurePlan>,
    in_flight: Mutex<InFlight>,
    send_latency: Duration,
    call_latency: Duration,
    next_id: AtomicU64,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(FailurePlan::default()),
            in_flight: Mutex::new(InFlight::default()),
            send_latency: Duration::ZERO,
            call_latency: Duration::ZERO,
            next_id: AtomicU64::new(1),
        }
    }

    /// Hold every send for `latency` before it resolves.
    pub fn with_send_latency(mut self, latency: Duration) -> Self {
        self.send_latency = latency;
        self
    }

    /// Hold every call, seen markers and typing toggles included, for `latency`.
    /// Those calls then also count towards the in-flight peaks.
    pub fn with_call_latency(mut self, latency: Duration) -> Self {
        self.call_latency = latency;
        self
    }

    /// Every text/media send fails from now on.
    pub fn fail_all_sends(&self) {
        self.plan().all_sends = true;
    }

    /// Sends of the given kind (`"text"`, `"image"`, `"file"`) fail.
    pub fn fail_kind(&self, kind: &'static str) {
        self.plan().kinds.push(kind);
    }

    /// The next `n` sends fail, whatever their kind.
    pub fn fail_next_sends(&self, n: usize) {
        self.plan().next_sends = n;
    }

    pub fn clear_failures(&self) {
        *self.plan() = FailurePlan::default();
    }

    /// Calls in the order they were made.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.timeline().into_iter().map(|(_, c)| c).collect()
    }

    /// Calls with the instant each one was made.
    pub fn timeline(&self) -> Vec<(Instant, RecordedCall)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Only text and media sends, including failed ones.
    pub fn sends(&self) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(RecordedCall::is_send).collect()
    }

    /// Highest number of calls observed in flight at once for an account.
    pub fn peak_in_flight(&self, account_id: &str) -> usize {
        let state = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        state.peak_account.get(account_id).copied().unwrap_or(0)
    }

    /// Highest number of calls observed in flight at once for one chat.
    pub fn peak_in_flight_pair(&self, account_id: &str, recipient_id: &str) -> usize {
        let state = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        state
            .peak_pair
            .get(&(account_id.to_string(), recipient_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn plan(&self) -> std::sync::MutexGuard<'_, FailurePlan> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: RecordedCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((Instant::now(), call));
    }

    fn should_fail(&self, call: &RecordedCall) -> bool {
        let mut plan = self.plan();
        if plan.next_sends > 0 {
            plan.next_sends -= 1;
            return true;
        }
        plan.all_sends || call.send_kind().is_some_and(|k| plan.kinds.contains(&k))
    }

    fn enter(&self, account_id: &str, recipient_id: &str) {
        let mut state = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let pair = (account_id.to_string(), recipient_id.to_string());
        let account_now = {
            let n = state.per_account.entry(account_id.to_string()).or_default();
            *n += 1;
            *n
        };
        let pair_now = {
            let n = state.per_pair.entry(pair.clone()).or_default();
            *n += 1;
            *n
        };
        let peak = state.peak_account.entry(account_id.to_string()).or_default();
        *peak = (*peak).max(account_now);
        let peak = state.peak_pair.entry(pair).or_default();
        *peak = (*peak).max(pair_now);
    }

    fn leave(&self, account_id: &str, recipient_id: &str) {
        let mut state = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = state.per_account.get_mut(account_id) {
            *n = n.saturating_sub(1);
        }
        if let Some(n) = state
            .per_pair
            .get_mut(&(account_id.to_string(), recipient_id.to_string()))
        {
            *n = n.saturating_sub(1);
        }
    }

    async fn hold(&self, account_id: &str, recipient_id: &str, latency: Duration) {
        self.enter(account_id, recipient_id);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.leave(account_id, recipient_id);
    }

    async fn send(
        &self,
        account_id: &str,
        recipient_id: &str,
        call: RecordedCall,
    ) -> Result<Delivery> {
        let fail = self.should_fail(&call);
        let kind = call.send_kind().unwrap_or("send");
        self.record(call);

        self.hold(account_id, recipient_id, self.send_latency.max(self.call_latency))
            .await;

        if fail {
            return Err(Error::rejected(500, format!("scripted {kind} failure")));
        }
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delivered_id = format!("rec_{recipient_id}_{n}");
        info!(account_id, recipient_id, kind, %delivered_id, "recorded outbound send");
        Ok(Delivery { delivered_id })
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn mark_seen(&self, account_id: &str, recipient_id: &str) -> Result<()> {
        self.record(RecordedCall::MarkSeen {
            account_id: account_id.into(),
            recipient_id: recipient_id.into(),
        });
        if !self.call_latency.is_zero() {
            self.hold(account_id, recipient_id, self.call_latency).await;
        }
        Ok(())
    }

    async fn set_typing(&self, account_id: &str, recipient_id: &str, on: bool) -> Result<()> {
        self.record(RecordedCall::Typing {
            account_id: account_id.into(),
            recipient_id: recipient_id.into(),
            on,
        });
        if !self.call_latency.is_zero() {
            self.hold(account_id, recipient_id, self.call_latency).await;
        }
        Ok(())
    }

    async fn send_text(
        &self,
        account_id: &str,
        recipient_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<Delivery> {
        let call = RecordedCall::Text {
            account_id: account_id.into(),
            recipient_id: recipient_id.into(),
            text: text.into(),
            reply_to: reply_to.map(str::to_string),
        };
        self.send(account_id, recipient_id, call).await
    }

    async fn send_media(
        &self,
        account_id: &str,
        recipient_id: &str,
        kind: MediaKind,
        media: &MediaMessage,
    ) -> Result<Delivery> {
        let call = RecordedCall::Media {
            account_id: account_id.into(),
            recipient_id: recipient_id.into(),
            kind,
            filename: media.file.filename.clone(),
            caption: media.caption.clone(),
        };
        self.send(account_id, recipient_id, call).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_in_order() {
        let t = RecordingTransport::new();
        t.mark_seen("a", "1").await.unwrap();
        t.set_typing("a", "1", true).await.unwrap();
        let d = t.send_text("a", "1", "hi", None).await.unwrap();
        assert!(d.delivered_id.starts_with("rec_1_"));

        let calls = t.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], RecordedCall::MarkSeen { .. }));
        assert!(matches!(calls[1], RecordedCall::Typing { on: true, .. }));
        assert_eq!(t.sends().len(), 1);
    }

    #[tokio::test]
    async fn scripted_failures() {
        let t = RecordingTransport::new();
        t.fail_next_sends(1);
        assert!(t.send_text("a", "1", "x", None).await.is_err());
        assert!(t.send_text("a", "1", "y", None).await.is_ok());

        t.fail_kind("text");
        assert!(t.send_text("a", "1", "z", None).await.is_err());
        t.clear_failures();
        assert!(t.send_text("a", "1", "z", None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_peak_in_flight() {
        let t = std::sync::Arc::new(
            RecordingTransport::new().with_send_latency(Duration::from_millis(100)),
        );
        let a = {
            let t = std::sync::Arc::clone(&t);
            tokio::spawn(async move { t.send_text("acct", "1", "x", None).await })
        };
        let b = {
            let t = std::sync::Arc::clone(&t);
            tokio::spawn(async move { t.send_text("acct", "2", "y", None).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(t.peak_in_flight("acct"), 2);
        assert_eq!(t.peak_in_flight_pair("acct", "1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn call_latency_covers_seen_and_typing() {
        let t = std::sync::Arc::new(
            RecordingTransport::new().with_call_latency(Duration::from_secs(14)),
        );
        let started = Instant::now();
        let seen = {
            let t = std::sync::Arc::clone(&t);
            tokio::spawn(async move { t.mark_seen("acct", "1").await })
        };
        let typing = {
            let t = std::sync::Arc::clone(&t);
            tokio::spawn(async move { t.set_typing("acct", "1", true).await })
        };
        seen.await.unwrap().unwrap();
        typing.await.unwrap().unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(14));
        assert_eq!(t.peak_in_flight_pair("acct", "1"), 2);
    }
}
