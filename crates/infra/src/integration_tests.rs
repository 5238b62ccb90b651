//! Integration tests for the full job pipeline.
//!
//! Tests: submit → JobQueue → WorkerPool → BulkProcessor → SubmitterRouter → EventBus
//!
//! Verifies:
//! - Items are soft-deleted, recorded and counted toward progress
//! - Per-item failures never fail the job
//! - Cancel and idempotent re-submission behave end to end
//! - Every event reaches the submitter's channel and the broadcast channel

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use proptest::prelude::*;

    use bulkjobs_core::{ItemResult, JobId, JobStatus, TICKET_ALREADY_DELETED, TICKET_NOT_FOUND, TicketId, UserId};
    use bulkjobs_events::{Channel, EventBus, EventEnvelope, InMemoryEventBus, JobEvent, RecordingSink, Subscription};

    use crate::jobs::{
        BulkProcessor, InMemoryJobQueue, InMemoryJobStore, InMemoryOutcomeLog, JobStore, OutcomeLog,
        SubmissionService, WorkUnit, WorkerPool, WorkerPoolConfig, WorkerPoolHandle,
    };
    use crate::realtime::SubmitterRouter;
    use crate::tickets::InMemoryTicketStore;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JobEvent>>>;

    struct Pipeline {
        jobs: Arc<InMemoryJobStore>,
        outcomes: Arc<InMemoryOutcomeLog>,
        queue: Arc<InMemoryJobQueue>,
        tickets: Arc<InMemoryTicketStore>,
        bus: Bus,
        service: SubmissionService,
        router: Arc<SubmitterRouter<Bus>>,
    }

    impl Pipeline {
        fn new(tickets: InMemoryTicketStore) -> Self {
            let jobs = Arc::new(InMemoryJobStore::new());
            let outcomes = Arc::new(InMemoryOutcomeLog::new());
            let queue = Arc::new(InMemoryJobQueue::new());
            let bus: Bus = Arc::new(InMemoryEventBus::new());
            let router = Arc::new(SubmitterRouter::new(jobs.clone(), bus.clone()));
            let service = SubmissionService::new(jobs.clone(), outcomes.clone(), queue.clone(), router.clone());

            Self {
                jobs,
                outcomes,
                queue,
                tickets: Arc::new(tickets),
                bus,
                service,
                router,
            }
        }

        fn start_workers(&self, chunk_size: usize) -> WorkerPoolHandle {
            let processor = BulkProcessor::new(
                self.jobs.clone(),
                self.outcomes.clone(),
                self.tickets.clone(),
                self.router.clone(),
            )
            .with_chunk_size(chunk_size);

            WorkerPool::new(Arc::new(processor), self.queue.clone())
                .spawn(
                    WorkerPoolConfig::default()
                        .with_workers(2)
                        .with_poll_interval(Duration::from_millis(10)),
                )
                .unwrap()
        }

        fn wait_for_status(&self, job_id: JobId, status: JobStatus) {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let job = self.jobs.get(job_id).unwrap().unwrap();
                if job.status == status && self.queue.is_idle() {
                    return;
                }
                assert!(Instant::now() < deadline, "job stuck in {}", job.status);
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    fn ids(raw: &[i64]) -> Vec<TicketId> {
        raw.iter().copied().map(TicketId::new).collect()
    }

    fn received(sub: &Subscription<EventEnvelope<JobEvent>>, channel: Channel) -> Vec<JobEvent> {
        sub.drain()
            .into_iter()
            .filter(|env| env.channel() == channel)
            .map(EventEnvelope::into_payload)
            .collect()
    }

    #[test]
    fn three_tickets_in_chunks_of_two_all_succeed() {
        let pipeline = Pipeline::new(InMemoryTicketStore::seeded([1, 2, 3]));
        let sub = pipeline.bus.subscribe();
        let workers = pipeline.start_workers(2);
        let admin = UserId::new();

        let job = pipeline.service.submit(admin, ids(&[1, 2, 3]), None).unwrap().job;
        pipeline.wait_for_status(job.id, JobStatus::Succeeded);
        workers.shutdown();

        let detail = pipeline.service.get(job.id).unwrap();
        assert_eq!(detail.job.processed_items, 3);
        assert_eq!(detail.job.progress, 100);
        assert!(detail.job.completed_at.is_some());
        let items: Vec<i64> = detail.items.iter().map(|o| o.item_id.get()).collect();
        assert_eq!(items, vec![1, 2, 3]);
        assert!(detail.items.iter().all(|o| o.outcome == ItemResult::Succeeded));
        for id in 1..=3 {
            assert!(pipeline.tickets.is_deleted(TicketId::new(id)));
        }

        let events = received(&sub, Channel::Submitter(admin));
        let topics: Vec<_> = events.iter().map(JobEvent::topic).collect();
        assert_eq!(topics.first(), Some(&"jobs:created"));
        assert_eq!(topics.last(), Some(&"jobs:completed"));
        assert_eq!(topics.iter().filter(|t| **t == "jobs:item").count(), 3);
    }

    #[test]
    fn already_deleted_and_missing_tickets_fail_individually() {
        let tickets = InMemoryTicketStore::seeded([5]);
        tickets.insert_deleted([6]);
        let pipeline = Pipeline::new(tickets);
        let workers = pipeline.start_workers(5);

        let job = pipeline
            .service
            .submit(UserId::new(), ids(&[5, 6, 7]), None)
            .unwrap()
            .job;
        pipeline.wait_for_status(job.id, JobStatus::Succeeded);
        workers.shutdown();

        let outcomes = pipeline.outcomes.list_for_job(job.id).unwrap();
        let by_id = |id: i64| outcomes.iter().find(|o| o.item_id.get() == id).unwrap();

        assert_eq!(by_id(5).outcome, ItemResult::Succeeded);
        assert_eq!(by_id(6).error.as_deref(), Some(TICKET_ALREADY_DELETED));
        assert_eq!(by_id(7).error.as_deref(), Some(TICKET_NOT_FOUND));
        assert_eq!(pipeline.jobs.get(job.id).unwrap().unwrap().processed_items, 3);
    }

    #[test]
    fn job_whose_items_all_fail_still_succeeds() {
        let pipeline = Pipeline::new(InMemoryTicketStore::new());
        let workers = pipeline.start_workers(2);

        let job = pipeline.service.submit(UserId::new(), ids(&[1, 2]), None).unwrap().job;
        pipeline.wait_for_status(job.id, JobStatus::Succeeded);
        workers.shutdown();

        let job = pipeline.jobs.get(job.id).unwrap().unwrap();
        assert_eq!((job.processed_items, job.progress), (2, 100));
        assert!(job.error.is_none());
        let outcomes = pipeline.outcomes.list_for_job(job.id).unwrap();
        assert!(outcomes.iter().all(|o| o.outcome == ItemResult::Failed));
    }

    #[test]
    fn job_canceled_while_queued_is_never_processed() {
        let pipeline = Pipeline::new(InMemoryTicketStore::seeded([1, 2]));
        let sub = pipeline.bus.subscribe();
        let owner = UserId::new();

        let job = pipeline.service.submit(owner, ids(&[1, 2]), None).unwrap().job;
        pipeline.service.cancel(job.id).unwrap();

        let workers = pipeline.start_workers(5);
        pipeline.wait_for_status(job.id, JobStatus::Canceled);
        workers.shutdown();

        assert!(!pipeline.tickets.is_deleted(TicketId::new(1)));
        assert!(pipeline.outcomes.list_for_job(job.id).unwrap().is_empty());
        let topics: Vec<_> = received(&sub, Channel::Broadcast).iter().map(JobEvent::topic).collect();
        assert_eq!(topics, vec!["jobs:created"]);
    }

    #[test]
    fn idempotent_resubmission_runs_the_job_once() {
        let pipeline = Pipeline::new(InMemoryTicketStore::seeded([1]));
        let admin = UserId::new();

        let first = pipeline.service.submit(admin, ids(&[1]), Some("nightly".into())).unwrap();
        let second = pipeline.service.submit(admin, ids(&[1]), Some(" nightly ".into())).unwrap();
        let other = pipeline.service.submit(UserId::new(), ids(&[1]), Some("nightly".into())).unwrap();

        assert_eq!(first.job.id, second.job.id);
        assert!(!second.created);
        assert_ne!(first.job.id, other.job.id);
        assert_eq!(pipeline.queue.pending(), 2);
    }

    #[test]
    fn item_events_precede_the_chunk_progress_event() {
        let pipeline = Pipeline::new(InMemoryTicketStore::seeded(1..=4));
        let sub = pipeline.bus.subscribe();
        let workers = pipeline.start_workers(2);
        let admin = UserId::new();

        let job = pipeline.service.submit(admin, ids(&[1, 2, 3, 4]), None).unwrap().job;
        pipeline.wait_for_status(job.id, JobStatus::Succeeded);
        workers.shutdown();

        let events = received(&sub, Channel::Broadcast);
        let shape: Vec<String> = events
            .iter()
            .map(|e| match e {
                JobEvent::Progress { processed_items, .. } => format!("progress:{processed_items}"),
                other => other.topic().trim_start_matches("jobs:").to_string(),
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                "created",
                "progress:0",
                "item",
                "item",
                "progress:2",
                "item",
                "item",
                "progress:4",
                "completed",
            ]
        );
    }

    #[test]
    fn submitter_and_broadcast_channels_carry_the_same_events() {
        let pipeline = Pipeline::new(InMemoryTicketStore::seeded([1, 2]));
        let sub = pipeline.bus.subscribe();
        let workers = pipeline.start_workers(1);
        let owner = UserId::new();

        let job = pipeline.service.submit(owner, ids(&[1, 2]), None).unwrap().job;
        pipeline.wait_for_status(job.id, JobStatus::Succeeded);
        workers.shutdown();

        let envelopes = sub.drain();
        let personal: Vec<_> = envelopes.iter().filter(|e| e.channel() == Channel::Submitter(owner)).collect();
        let broadcast: Vec<_> = envelopes.iter().filter(|e| e.channel() == Channel::Broadcast).collect();

        assert_eq!(personal.len(), broadcast.len());
        for (p, b) in personal.iter().zip(&broadcast) {
            assert_eq!(p.event_id(), b.event_id());
            assert_eq!(p.payload(), b.payload());
        }
        assert!(!envelopes.iter().any(|e| e.channel().is_visible_to(UserId::new(), false)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn progress_ends_at_total_and_never_goes_backwards(
            raw in proptest::collection::vec(1i64..40, 1..25),
            chunk in 1usize..8,
            deleted in proptest::collection::vec(1i64..40, 0..10),
        ) {
            let tickets = InMemoryTicketStore::seeded(1..40);
            tickets.insert_deleted(deleted);
            let jobs = Arc::new(InMemoryJobStore::new());
            let outcomes = Arc::new(InMemoryOutcomeLog::new());
            let events = Arc::new(RecordingSink::new());
            let queue = InMemoryJobQueue::new();
            let service = SubmissionService::new(jobs.clone(), outcomes.clone(), Arc::new(queue), events.clone());
            let processor = BulkProcessor::new(jobs.clone(), outcomes.clone(), Arc::new(tickets), events.clone())
                .with_chunk_size(chunk);

            let job = service.submit(UserId::new(), ids(&raw), None).unwrap().job;
            processor.process(&WorkUnit::new(job.id, job.payload.clone())).unwrap();

            let done = jobs.get(job.id).unwrap().unwrap();
            prop_assert_eq!(done.status, JobStatus::Succeeded);
            prop_assert_eq!(done.processed_items, done.total_items);
            prop_assert_eq!(done.progress, 100);
            prop_assert_eq!(outcomes.list_for_job(job.id).unwrap().len() as u32, done.total_items);

            let mut last = 0;
            for event in events.events() {
                if let JobEvent::Progress { processed_items, progress, .. } = event {
                    prop_assert!(processed_items >= last);
                    prop_assert!(progress <= 100);
                    last = processed_items;
                }
            }
        }
    }
}
