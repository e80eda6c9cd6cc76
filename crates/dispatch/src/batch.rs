//! Ordered multi-message delivery under a single lock and slot.
//!
//! Messages go out one by one in list order. The first failure stops the
//! batch: later messages are never sent and the job fails as a whole.

use {
    chatrelay_common::types::OutboundMessage,
    tracing::{debug, warn},
};

use crate::{
    Error, Result,
    dispatcher::Dispatcher,
    types::{Job, JobResult},
};

pub(crate) async fn run(
    dispatcher: &Dispatcher,
    job: &mut Job,
    holder: &str,
    messages: &[OutboundMessage],
) -> Result<JobResult> {
    let total = messages.len();
    let mut delivered_ids = Vec::with_capacity(total);

    for (index, msg) in messages.iter().enumerate() {
        debug!(
            job_id = %job.id,
            index,
            total,
            kind = msg.kind_str(),
            "sending batch message"
        );
        let delivered_id = dispatcher
            .send_one(job, holder, msg)
            .await
            .map_err(|e| {
                warn!(job_id = %job.id, index, total, error = %e, "batch message failed");
                aborted(index, total, e)
            })?;
        delivered_ids.push(delivered_id);

        dispatcher
            .report_progress(job, progress(index + 1, total))
            .await;
    }

    Ok(JobResult { delivered_ids })
}

fn aborted(index: usize, total: usize, source: Error) -> Error {
    Error::BatchAborted {
        index,
        sent: index,
        total,
        reason: source.to_string(),
    }
}

fn progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_steps_through_the_batch() {
        assert_eq!(progress(1, 3), 33);
        assert_eq!(progress(2, 3), 66);
        assert_eq!(progress(3, 3), 100);
        assert_eq!(progress(1, 1), 100);
        assert_eq!(progress(0, 0), 100);
    }

    #[test]
    fn abort_records_how_far_the_batch_got() {
        let err = aborted(1, 3, Error::message("gateway rejected image"));
        assert_eq!(err.sent_before_failure(), Some(1));
        assert_eq!(
            err.to_string(),
            "batch aborted at message 1 (1/3 sent): gateway rejected image"
        );
    }
}
