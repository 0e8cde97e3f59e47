//! Outstanding iq requests.
//!
//! Every request sent without a caller-supplied id gets a sequence number and lives in
//! two indices at once: by sequence number (to match responses) and by deadline (so the
//! scheduler can find expired requests with a prefix scan). Both indices sit behind the
//! same lock and are always updated together.

use super::stanza::IqResponse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Called exactly once with the result, error or timeout of a request.
pub type ResponseCallback = Box<dyn FnOnce(IqResponse) + Send + 'static>;

/// Retry behaviour of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout_ms: u64,
    pub retries: u32,
    /// Double the timeout after each retry, up to `max_timeout_ms`.
    pub drop_off: bool,
    pub max_timeout_ms: u64,
}

impl RetryPolicy {
    /// Policy of QoS envelopes: keep trying, backing off up to one hour.
    pub const QOS: RetryPolicy = RetryPolicy {
        timeout_ms: 2_000,
        retries: u32::MAX,
        drop_off: true,
        max_timeout_ms: 3_600_000,
    };
}

pub(crate) struct PendingRequest {
    pub seq: u32,
    pub to: String,
    /// Serialized request, resent verbatim on retry.
    pub xml: String,
    pub callback: ResponseCallback,
    timeout_ms: u64,
    retries_left: u32,
    drop_off: bool,
    max_timeout_ms: u64,
    deadline: Instant,
}

/// What the scheduler must do for a request whose deadline passed.
pub(crate) enum Expired {
    Resend { seq: u32, xml: String },
    TimedOut(PendingRequest),
}

#[derive(Default)]
pub(crate) struct Correlator {
    next_seq: u32,
    by_seq: HashMap<u32, PendingRequest>,
    by_deadline: BTreeMap<Instant, u32>,
}

impl Correlator {
    /// Next sequence number. Wraps around; numbers still in flight are not skipped.
    pub fn next_sequence(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    pub fn insert(
        &mut self,
        seq: u32,
        to: String,
        xml: String,
        callback: ResponseCallback,
        policy: RetryPolicy,
        now: Instant,
    ) {
        let timeout_ms = policy.timeout_ms.max(1);
        let deadline =
            Self::unique_deadline(&self.by_deadline, now + Duration::from_millis(timeout_ms));
        self.by_deadline.insert(deadline, seq);
        if let Some(old) = self.by_seq.insert(
            seq,
            PendingRequest {
                seq,
                to,
                xml,
                callback,
                timeout_ms,
                retries_left: policy.retries,
                drop_off: policy.drop_off,
                max_timeout_ms: policy.max_timeout_ms,
                deadline,
            },
        ) {
            self.by_deadline.remove(&old.deadline);
        }
    }

    pub fn take(&mut self, seq: u32) -> Option<PendingRequest> {
        let request = self.by_seq.remove(&seq)?;
        self.by_deadline.remove(&request.deadline);
        Some(request)
    }

    /// Collect every request with a deadline at or before `now`.
    ///
    /// Requests with retries left are rescheduled; the others are removed and returned
    /// for their timeout callback.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();
        while let Some((&deadline, &seq)) = self.by_deadline.first_key_value() {
            if deadline > now {
                break;
            }
            self.by_deadline.remove(&deadline);
            let Some(request) = self.by_seq.get_mut(&seq) else {
                continue;
            };
            if request.retries_left == 0 {
                if let Some(request) = self.by_seq.remove(&seq) {
                    expired.push(Expired::TimedOut(request));
                }
                continue;
            }

            request.retries_left -= 1;
            if request.drop_off {
                request.timeout_ms = request
                    .timeout_ms
                    .saturating_mul(2)
                    .min(request.max_timeout_ms)
                    .max(1);
            }
            let xml = request.xml.clone();
            let wanted = now + Duration::from_millis(request.timeout_ms);
            let deadline = Self::unique_deadline(&self.by_deadline, wanted);
            if let Some(request) = self.by_seq.get_mut(&seq) {
                request.deadline = deadline;
            }
            self.by_deadline.insert(deadline, seq);
            expired.push(Expired::Resend { seq, xml });
        }
        expired
    }

    /// Drop everything without running any callback.
    pub fn clear(&mut self) -> usize {
        let n = self.len();
        self.by_seq.clear();
        self.by_deadline.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    fn unique_deadline(index: &BTreeMap<Instant, u32>, mut wanted: Instant) -> Instant {
        while index.contains_key(&wanted) {
            wanted += Duration::from_nanos(1);
        }
        wanted
    }
}
