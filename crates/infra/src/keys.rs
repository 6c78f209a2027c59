//! Key layout.
//!
//! Every per-queue key carries the queue name in a `{...}` hash tag so that
//! a clustered Redis keeps one queue's records in one slot; multi-key
//! transactions only ever span a single queue.

use spindle_core::{JobId, Priority};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn queue_key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{{{}}}:{}", self.namespace, queue, suffix)
    }

    /// Ready set for one priority class; scored by eligibility time (ms).
    pub fn ready(&self, queue: &str, priority: Priority) -> String {
        self.queue_key(queue, &format!("ready:{}", priority.as_str()))
    }

    /// Job records by id.
    pub fn jobs(&self, queue: &str) -> String {
        self.queue_key(queue, "jobs")
    }

    /// Claim records by job id.
    pub fn claims(&self, queue: &str) -> String {
        self.queue_key(queue, "claims")
    }

    /// Claimed job ids scored by lease expiry (ms).
    pub fn leases(&self, queue: &str) -> String {
        self.queue_key(queue, "leases")
    }

    pub fn dead_letters(&self, queue: &str) -> String {
        self.queue_key(queue, "dlq")
    }

    /// Dead-lettered job ids scored by failure time (ms).
    pub fn dead_letter_index(&self, queue: &str) -> String {
        self.queue_key(queue, "dlq_index")
    }

    pub fn sequence(&self, queue: &str) -> String {
        self.queue_key(queue, "seq")
    }

    pub fn streak(&self, queue: &str) -> String {
        self.queue_key(queue, "streak")
    }

    pub fn idempotency(&self, queue: &str, key: &str) -> String {
        self.queue_key(queue, &format!("idem:{key}"))
    }

    pub fn cancellation(&self, queue: &str, job_id: JobId) -> String {
        self.queue_key(queue, &format!("cancel:{job_id}"))
    }

    /// Token bucket for a scope; `None` is the scope's aggregate bucket.
    pub fn bucket(&self, scope: &str, priority: Option<Priority>) -> String {
        let class = priority.map_or("all", |p| p.as_str());
        format!("{}:rate:{{{}}}:{}", self.namespace, scope, class)
    }

    /// Registry of queue names seen by enqueue.
    pub fn queues(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    /// Worker heartbeats by worker id.
    pub fn heartbeats(&self) -> String {
        format!("{}:{{fleet}}:workers", self.namespace)
    }

    /// Drain flags by worker id.
    pub fn drains(&self) -> String {
        format!("{}:{{fleet}}:drain", self.namespace)
    }

    /// Ready-set member. The zero-padded sequence keeps FIFO order among
    /// jobs with equal eligibility time.
    pub fn ready_member(sequence: u64, job_id: JobId) -> String {
        format!("{sequence:020}|{job_id}")
    }

    pub fn parse_ready_member(member: &str) -> Option<JobId> {
        let (_, id) = member.split_once('|')?;
        id.parse().ok()
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("spindle")
    }
}
