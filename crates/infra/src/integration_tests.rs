//! End-to-end scenarios against the in-memory engine.
//!
//! Tests: enqueue → admission → dequeue → ack / fail / reclaim → DLQ tooling
//!
//! Verifies:
//! - A job is never claimed by two workers at once
//! - Ack is idempotent and reclaimed claims cannot be settled by the old owner
//! - The starvation guard interleaves lower classes
//! - Exhausted and non-retryable jobs land in the dead-letter queue
//! - Rate-limit denials leave no trace
//! - A store outage trips the breaker and recovers after the cooldown

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use spindle_core::{
        Clock, DeadLetterCause, FailureReason, JobFailure, JobId, ManualClock, Priority, RetryPolicy, WorkerId,
    };

    use proptest::prelude::*;

    use crate::breaker::BreakerConfig;
    use crate::config::QueueConfig;
    use crate::dead_letter::PurgeTarget;
    use crate::error::QueueError;
    use crate::ledger::{AckOutcome, CancelOutcome};
    use crate::queue::{EnqueueOptions, JobQueue};
    use crate::rate_limiter::RateLimitConfig;
    use crate::retry::FailOutcome;
    use crate::store::InMemoryStore;
    use crate::store::outage::OutageStore;

    type MemQueue = JobQueue<Arc<InMemoryStore>>;

    const LEASE: Duration = Duration::from_secs(30);
    /// Longer than any default backoff.
    const PAST_BACKOFF: Duration = Duration::from_secs(60);

    fn unlimited() -> QueueConfig {
        let mut config = QueueConfig::default();
        config.rate_limit.enabled = false;
        config
    }

    fn harness(config: QueueConfig) -> (Arc<MemQueue>, ManualClock) {
        let clock = ManualClock::starting_now();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(InMemoryStore::with_clock(shared.clone()));
        let queue = JobQueue::with_clock(store, config, shared).unwrap();
        (Arc::new(queue), clock)
    }

    fn queues(name: &str) -> Vec<String> {
        vec![name.to_string()]
    }

    fn enqueue(queue: &MemQueue, name: &str, priority: Priority) -> JobId {
        queue
            .enqueue(name, priority, b"payload".to_vec(), EnqueueOptions::default())
            .unwrap()
            .job_id
    }

    #[test]
    fn concurrent_workers_never_double_claim() {
        let (queue, _) = harness(unlimited());
        let mut enqueued = HashSet::new();
        for i in 0..200 {
            let priority = Priority::ALL[i % 3];
            enqueued.insert(enqueue(&queue, "bulk", priority));
        }

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let worker = WorkerId::new(format!("w{i}"));
                    let mut claimed = Vec::new();
                    while let Some(job) = queue.try_dequeue(&worker, &queues("bulk"), LEASE).unwrap() {
                        assert_eq!(queue.ack("bulk", job.id, &worker).unwrap(), AckOutcome::Acked);
                        claimed.push(job.id);
                    }
                    claimed
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for w in workers {
            for id in w.join().unwrap() {
                total += 1;
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(total, 200);
        assert_eq!(seen, enqueued);

        let stats = queue.stats("bulk").unwrap();
        assert_eq!((stats.ready_count, stats.claimed_count), (0, 0));
    }

    #[test]
    fn ack_is_idempotent_and_owner_checked() {
        let (queue, _) = harness(unlimited());
        let id = enqueue(&queue, "mail", Priority::Normal);
        let owner = WorkerId::new("owner");
        let other = WorkerId::new("other");

        let job = queue.try_dequeue(&owner, &queues("mail"), LEASE).unwrap().unwrap();
        assert_eq!(job.id, id);

        assert!(matches!(
            queue.ack("mail", id, &other),
            Err(QueueError::ClaimConflict { .. })
        ));
        assert_eq!(queue.ack("mail", id, &owner).unwrap(), AckOutcome::Acked);
        assert_eq!(queue.ack("mail", id, &owner).unwrap(), AckOutcome::AlreadyAcked);
        assert_eq!(queue.ack("mail", id, &other).unwrap(), AckOutcome::AlreadyAcked);
    }

    #[test]
    fn starvation_guard_interleaves_low_priority() {
        let mut config = unlimited();
        config.scheduler.starvation_limit = 2;
        let (queue, _) = harness(config);

        for _ in 0..3 {
            enqueue(&queue, "mixed", Priority::High);
        }
        enqueue(&queue, "mixed", Priority::Low);

        let worker = WorkerId::new("w");
        let order: Vec<Priority> = (0..4)
            .map(|_| {
                let job = queue.try_dequeue(&worker, &queues("mixed"), LEASE).unwrap().unwrap();
                queue.ack("mixed", job.id, &worker).unwrap();
                job.priority
            })
            .collect();

        assert_eq!(
            order,
            vec![Priority::High, Priority::High, Priority::Low, Priority::High]
        );
    }

    #[test]
    fn fifo_within_a_priority_class() {
        let (queue, _) = harness(unlimited());
        let first = enqueue(&queue, "fifo", Priority::Normal);
        let second = enqueue(&queue, "fifo", Priority::Normal);
        let worker = WorkerId::new("w");

        let a = queue.try_dequeue(&worker, &queues("fifo"), LEASE).unwrap().unwrap();
        let b = queue.try_dequeue(&worker, &queues("fifo"), LEASE).unwrap().unwrap();
        assert_eq!((a.id, b.id), (first, second));
    }

    #[test]
    fn expired_lease_is_reclaimed_exactly_once() {
        let (queue, clock) = harness(unlimited());
        let id = enqueue(&queue, "video", Priority::Normal);
        let crashed = WorkerId::new("crashed");
        let survivor = WorkerId::new("survivor");

        queue
            .try_dequeue(&crashed, &queues("video"), Duration::from_secs(5))
            .unwrap()
            .unwrap();
        clock.advance(Duration::from_secs(6));

        let reaper = queue.reaper();
        let report = reaper.tick().unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(reaper.tick().unwrap().retried, 0);

        // the crashed worker's late ack no longer counts
        assert!(matches!(
            queue.ack("video", id, &crashed),
            Err(QueueError::ClaimConflict { .. })
        ));

        clock.advance(PAST_BACKOFF);
        let job = queue
            .try_dequeue(&survivor, &queues("video"), LEASE)
            .unwrap()
            .expect("reclaimed job is ready again");
        assert_eq!(job.id, id);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.history.len(), 1);
        assert_eq!(job.history[0].reason, FailureReason::LeaseExpired);
        assert_eq!(job.history[0].error_class, JobFailure::LEASE_EXPIRED);
        assert_eq!(job.history[0].worker_id, crashed);

        assert!(queue
            .try_dequeue(&WorkerId::new("third"), &queues("video"), LEASE)
            .unwrap()
            .is_none());
        assert_eq!(queue.ack("video", id, &survivor).unwrap(), AckOutcome::Acked);
    }

    #[test]
    fn renewed_lease_survives_the_reaper() {
        let (queue, clock) = harness(unlimited());
        let id = enqueue(&queue, "long", Priority::Normal);
        let worker = WorkerId::new("w");

        queue
            .try_dequeue(&worker, &queues("long"), Duration::from_secs(5))
            .unwrap()
            .unwrap();
        clock.advance(Duration::from_secs(4));
        let claim = queue.renew("long", id, &worker).unwrap();
        assert_eq!(claim.lease_expires_at, clock.now() + chrono::Duration::seconds(5));

        clock.advance(Duration::from_secs(4));
        assert_eq!(queue.reaper().tick().unwrap().retried, 0);
        assert_eq!(queue.ack("long", id, &worker).unwrap(), AckOutcome::Acked);
    }

    #[test]
    fn exhausted_job_lands_in_dead_letter_queue() {
        let (queue, clock) = harness(unlimited());
        let id = enqueue(&queue, "billing", Priority::High);
        let worker = WorkerId::new("w");
        let failure = JobFailure::new("gateway_timeout", "upstream took too long");

        for expected in 1..=2 {
            let job = queue.try_dequeue(&worker, &queues("billing"), LEASE).unwrap().unwrap();
            assert_eq!(job.attempt, expected - 1);
            match queue.fail("billing", id, &worker, &failure).unwrap() {
                FailOutcome::Retrying { attempt, not_before } => {
                    assert_eq!(attempt, expected);
                    assert!(not_before > clock.now());
                }
                other => panic!("expected a retry, got {other:?}"),
            }
            // not eligible until the backoff elapses
            assert!(queue.try_dequeue(&worker, &queues("billing"), LEASE).unwrap().is_none());
            clock.advance(PAST_BACKOFF);
        }

        queue.try_dequeue(&worker, &queues("billing"), LEASE).unwrap().unwrap();
        assert!(matches!(
            queue.fail("billing", id, &worker, &failure).unwrap(),
            FailOutcome::DeadLettered {
                attempt: 3,
                cause: DeadLetterCause::Exhausted
            }
        ));

        let entries = queue.peek_dlq("billing", 0, 10).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.job.id, id);
        assert_eq!(entry.job.attempt, 3);
        assert_eq!(entry.failure_reason, FailureReason::WorkerError);
        assert_eq!(entry.last_error, failure);
        assert_eq!(entry.attempts().len(), 3);

        let stats = queue.stats("billing").unwrap();
        assert_eq!((stats.ready_count, stats.claimed_count, stats.dlq_count), (0, 0, 1));
    }

    #[test]
    fn non_retryable_failure_skips_retries() {
        let mut config = unlimited();
        config.retry = RetryPolicy::default().with_non_retryable("payload_validation");
        let (queue, _) = harness(config);
        let id = enqueue(&queue, "ingest", Priority::Normal);
        let worker = WorkerId::new("w");

        queue.try_dequeue(&worker, &queues("ingest"), LEASE).unwrap().unwrap();
        let outcome = queue
            .fail("ingest", id, &worker, &JobFailure::new("payload_validation", "missing field"))
            .unwrap();
        assert!(matches!(
            outcome,
            FailOutcome::DeadLettered {
                attempt: 1,
                cause: DeadLetterCause::PolicyViolation
            }
        ));
    }

    #[test]
    fn rate_limit_denial_has_no_side_effects() {
        let mut config = QueueConfig::default();
        config.rate_limit = RateLimitConfig {
            capacity: 2.0,
            refill_rate: 1.0,
            ..RateLimitConfig::default()
        };
        let (queue, clock) = harness(config);

        enqueue(&queue, "sms", Priority::Normal);
        enqueue(&queue, "sms", Priority::Normal);
        let denied = queue.enqueue("sms", Priority::Normal, vec![], EnqueueOptions::default());
        let Err(QueueError::RateLimited { retry_after }) = denied else {
            panic!("expected a rate-limit denial, got {denied:?}");
        };
        assert!(retry_after > Duration::ZERO);
        assert!(retry_after <= Duration::from_secs(1));
        assert_eq!(queue.stats("sms").unwrap().ready_count, 2);

        clock.advance(retry_after);
        enqueue(&queue, "sms", Priority::Normal);
        assert_eq!(queue.stats("sms").unwrap().ready_count, 3);
    }

    #[test]
    fn tenants_have_separate_buckets() {
        let mut config = QueueConfig::default();
        config.rate_limit.capacity = 1.0;
        let (queue, _) = harness(config);

        let opts = |tenant: &str| EnqueueOptions::default().with_tenant(tenant);
        queue.enqueue("sms", Priority::Low, vec![], opts("acme")).unwrap();
        queue.enqueue("sms", Priority::Low, vec![], opts("globex")).unwrap();
        assert!(matches!(
            queue.enqueue("sms", Priority::Low, vec![], opts("acme")),
            Err(QueueError::RateLimited { .. })
        ));
    }

    #[test]
    fn tenant_stats_report_the_tenant_buckets() {
        let mut config = QueueConfig::default();
        config.rate_limit.capacity = 3.0;
        let (queue, _) = harness(config);

        let acme = EnqueueOptions::default().with_tenant("acme");
        queue.enqueue("sms", Priority::Low, vec![], acme.clone()).unwrap();
        queue.enqueue("sms", Priority::Low, vec![], acme).unwrap();

        let low_tokens = |stats: &crate::queue::QueueStats| {
            stats
                .rate_limit
                .iter()
                .find(|b| b.priority == Some(Priority::Low))
                .map(|b| b.tokens)
                .unwrap()
        };
        let tenant = queue.stats_for_tenant("sms", "acme").unwrap();
        assert_eq!(tenant.ready_count, 2);
        assert_eq!(tenant.rate_limit[0].scope, "acme:sms");
        assert!((low_tokens(&tenant) - 1.0).abs() < 1e-9);

        let queue_wide = queue.stats("sms").unwrap();
        assert_eq!(queue_wide.ready_count, 2);
        assert_eq!(queue_wide.rate_limit[0].scope, "sms");
        assert!((low_tokens(&queue_wide) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn idempotent_enqueue_returns_original_job() {
        let mut config = QueueConfig::default();
        config.rate_limit.capacity = 1.0;
        let (queue, _) = harness(config);
        let opts = EnqueueOptions::default().with_idempotency_key("order-42");

        let first = queue.enqueue("orders", Priority::High, vec![1], opts.clone()).unwrap();
        // a second token would be denied, so the duplicate must not be charged
        let second = queue.enqueue("orders", Priority::High, vec![2], opts).unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(queue.stats("orders").unwrap().ready_count, 1);
    }

    #[test]
    fn delayed_job_waits_for_not_before() {
        let (queue, clock) = harness(unlimited());
        let id = queue
            .enqueue(
                "reminders",
                Priority::High,
                vec![],
                EnqueueOptions::default().with_delay(Duration::from_secs(10)),
            )
            .unwrap()
            .job_id;
        let ready_now = enqueue(&queue, "reminders", Priority::Low);
        let worker = WorkerId::new("w");

        let job = queue.try_dequeue(&worker, &queues("reminders"), LEASE).unwrap().unwrap();
        assert_eq!(job.id, ready_now);
        assert!(queue.try_dequeue(&worker, &queues("reminders"), LEASE).unwrap().is_none());

        clock.advance(Duration::from_secs(10));
        let job = queue.try_dequeue(&worker, &queues("reminders"), LEASE).unwrap().unwrap();
        assert_eq!(job.id, id);
    }

    #[test]
    fn out_of_range_delay_is_rejected() {
        let (queue, _) = harness(unlimited());
        let opts = EnqueueOptions::default().with_delay(Duration::from_secs(u64::MAX));

        let result = queue.enqueue("reminders", Priority::Normal, vec![], opts);
        assert!(matches!(result, Err(QueueError::InvalidRequest(_))), "{result:?}");
        assert_eq!(queue.stats("reminders").unwrap().ready_count, 0);
    }

    #[test]
    fn cancellation_paths() {
        let (queue, _) = harness(unlimited());
        let worker = WorkerId::new("w");

        let ready = enqueue(&queue, "exports", Priority::Normal);
        assert_eq!(queue.cancel("exports", ready).unwrap(), CancelOutcome::Removed);
        assert!(queue.try_dequeue(&worker, &queues("exports"), LEASE).unwrap().is_none());

        let running = enqueue(&queue, "exports", Priority::Normal);
        queue.try_dequeue(&worker, &queues("exports"), LEASE).unwrap().unwrap();
        assert!(!queue.is_cancelled("exports", running).unwrap());
        assert_eq!(queue.cancel("exports", running).unwrap(), CancelOutcome::Signalled);
        assert!(queue.is_cancelled("exports", running).unwrap());

        let outcome = queue
            .fail("exports", running, &worker, &JobFailure::new("cancelled", "stopped"))
            .unwrap();
        assert_eq!(outcome, FailOutcome::Cancelled);

        let stats = queue.stats("exports").unwrap();
        assert_eq!((stats.ready_count, stats.claimed_count, stats.dlq_count), (0, 0, 0));
        assert_eq!(queue.cancel("exports", JobId::new()).unwrap(), CancelOutcome::NotFound);
    }

    #[test]
    fn dead_letter_tooling_requeues_and_purges() {
        let (queue, clock) = harness(unlimited());
        let worker = WorkerId::new("w");
        let failure = JobFailure::new("bad_input", "cannot parse");

        let mut dead = Vec::new();
        for priority in [Priority::High, Priority::Low, Priority::Normal] {
            let id = queue
                .enqueue(
                    "imports",
                    priority,
                    vec![],
                    EnqueueOptions::default().with_max_attempts(1),
                )
                .unwrap()
                .job_id;
            queue.try_dequeue(&worker, &queues("imports"), LEASE).unwrap().unwrap();
            queue.fail("imports", id, &worker, &failure).unwrap();
            dead.push(id);
            clock.advance(Duration::from_secs(1));
        }

        let peeked: Vec<JobId> = queue
            .peek_dlq("imports", 0, 10)
            .unwrap()
            .into_iter()
            .map(|e| e.job.id)
            .collect();
        assert_eq!(peeked, dead);
        assert_eq!(queue.peek_dlq("imports", 1, 1).unwrap()[0].job.id, dead[1]);

        let unknown = JobId::new();
        let report = queue.requeue_dlq("imports", &[dead[0], unknown]).unwrap();
        assert_eq!(report.requeued, vec![dead[0]]);
        assert_eq!(report.missing, vec![unknown]);

        let stats = queue.stats("imports").unwrap();
        assert_eq!(stats.ready_by_priority[&Priority::High], 1);
        assert_eq!(stats.dlq_count, 2);

        let job = queue.try_dequeue(&worker, &queues("imports"), LEASE).unwrap().unwrap();
        assert_eq!(job.id, dead[0]);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.history.len(), 1);

        assert_eq!(
            queue.purge_dlq("imports", &PurgeTarget::Ids(vec![dead[1], dead[1]])).unwrap(),
            1
        );
        assert_eq!(queue.purge_dlq("imports", &PurgeTarget::All).unwrap(), 1);
        assert!(queue.peek_dlq("imports", 0, 10).unwrap().is_empty());
    }

    #[test]
    fn heartbeats_and_drain_signals() {
        let (queue, clock) = harness(unlimited());
        let busy = WorkerId::new("busy");
        let idle = WorkerId::new("idle");
        let job = JobId::new();

        queue.heartbeat(&busy, Some(job)).unwrap();
        queue.heartbeat(&idle, None).unwrap();
        queue.signal_drain(&idle).unwrap();

        assert!(queue.is_draining(&idle).unwrap());
        assert!(!queue.is_draining(&busy).unwrap());

        let beats = queue.list_heartbeats().unwrap();
        assert_eq!(beats.len(), 2);
        assert_eq!(beats[0].worker_id, busy);
        assert_eq!(beats[0].current_job_id, Some(job));

        queue.deregister_worker(&idle).unwrap();
        assert!(!queue.is_draining(&idle).unwrap());

        clock.advance(queue.config().fleet.heartbeat_ttl + Duration::from_secs(1));
        assert!(queue.list_heartbeats().unwrap().is_empty());
    }

    #[test]
    fn stats_break_down_ready_jobs_by_priority() {
        let (queue, _) = harness(QueueConfig::default());
        enqueue(&queue, "reports", Priority::High);
        enqueue(&queue, "reports", Priority::Low);
        enqueue(&queue, "reports", Priority::Low);
        let worker = WorkerId::new("w");
        queue.try_dequeue(&worker, &queues("reports"), LEASE).unwrap().unwrap();

        let stats = queue.stats("reports").unwrap();
        assert_eq!(stats.ready_count, 2);
        assert_eq!(stats.ready_by_priority[&Priority::High], 0);
        assert_eq!(stats.ready_by_priority[&Priority::Low], 2);
        assert_eq!(stats.claimed_count, 1);
        assert!(!stats.rate_limit.is_empty());
    }

    #[test]
    fn invalid_leases_are_rejected() {
        let (queue, _) = harness(unlimited());
        let worker = WorkerId::new("w");
        let too_long = queue.config().lease.max_duration + Duration::from_secs(1);

        for lease in [Duration::ZERO, too_long] {
            assert!(matches!(
                queue.try_dequeue(&worker, &queues("any"), lease),
                Err(QueueError::InvalidRequest(_))
            ));
        }
    }

    #[test]
    fn store_outage_opens_the_breaker_until_cooldown() {
        let mut config = unlimited();
        config.breaker = BreakerConfig {
            min_samples: 2,
            ..BreakerConfig::default()
        };
        let cooldown = config.breaker.cooldown;
        let clock = ManualClock::starting_now();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = OutageStore::new(Arc::new(InMemoryStore::with_clock(shared.clone())));
        let queue = JobQueue::with_clock(store.clone(), config, shared).unwrap();
        let worker = WorkerId::new("w");

        let id = queue
            .enqueue("mail", Priority::Normal, vec![], EnqueueOptions::default())
            .unwrap()
            .job_id;

        store.set_down(true);
        let mut unavailable = 0;
        let tripped = loop {
            match queue.try_dequeue(&worker, &queues("mail"), LEASE) {
                Err(QueueError::StoreUnavailable(_)) if unavailable < 10 => unavailable += 1,
                other => break other,
            }
        };
        assert!(unavailable >= 1);
        assert!(matches!(tripped, Err(QueueError::CircuitOpen)), "{tripped:?}");
        assert!(matches!(
            queue.enqueue("mail", Priority::High, vec![], EnqueueOptions::default()),
            Err(QueueError::CircuitOpen)
        ));

        // still open while the store is back but the cooldown has not passed
        store.set_down(false);
        assert!(matches!(queue.try_dequeue(&worker, &queues("mail"), LEASE), Err(QueueError::CircuitOpen)));

        clock.advance(cooldown);
        let job = queue.try_dequeue(&worker, &queues("mail"), LEASE).unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(queue.ack("mail", id, &worker).unwrap(), AckOutcome::Acked);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: across any mix of reported failures and lease expiries a
        /// job is held by at most one worker, its attempt count rises by one
        /// per claim, and it ends in exactly one place.
        #[test]
        fn attempts_advance_once_per_claim(fail_steps in prop::collection::vec(any::<bool>(), 1..10)) {
            const MAX_ATTEMPTS: u32 = 4;
            let mut config = unlimited();
            config.retry = RetryPolicy::fixed(MAX_ATTEMPTS, Duration::from_secs(1));
            let (queue, clock) = harness(config);
            let reaper = queue.reaper();
            let id = enqueue(&queue, "jobs", Priority::Normal);
            let worker = WorkerId::new("w");
            let bystander = WorkerId::new("bystander");

            let mut claims = 0u32;
            for report_failure in fail_steps {
                clock.advance(PAST_BACKOFF);
                let Some(job) = queue.try_dequeue(&worker, &queues("jobs"), LEASE).unwrap() else {
                    break;
                };
                prop_assert_eq!(job.id, id);
                prop_assert_eq!(job.attempt, claims);
                prop_assert!(queue.try_dequeue(&bystander, &queues("jobs"), LEASE).unwrap().is_none());
                claims += 1;

                if report_failure {
                    queue.fail("jobs", id, &worker, &JobFailure::new("io", "disk full")).unwrap();
                } else {
                    clock.advance(LEASE + Duration::from_secs(1));
                    prop_assert_eq!(reaper.tick().unwrap().expired_found, 1);
                }

                let stats = queue.stats("jobs").unwrap();
                prop_assert_eq!(stats.claimed_count, 0);
                prop_assert_eq!(stats.ready_count + stats.dlq_count, 1);
            }

            let dead = queue.peek_dlq("jobs", 0, 10).unwrap();
            if claims == MAX_ATTEMPTS {
                prop_assert_eq!(dead.len(), 1);
                prop_assert_eq!(dead[0].job.attempt, MAX_ATTEMPTS);
            } else {
                prop_assert!(dead.is_empty());
            }
        }
    }
}
