//! Routes lifecycle events to the submitter's channel and the broadcast channel.

use std::sync::Arc;

use tracing::warn;

use bulkjobs_core::UserId;
use bulkjobs_events::{EventBus, EventEnvelope, EventSink, FanoutEmitter, JobEvent};

use crate::error::JobError;
use crate::jobs::store::JobStore;

/// Event sink living next to the real-time transport.
///
/// Events that carry a job snapshot are routed by its submitter; the others
/// are routed by looking the job up.
pub struct SubmitterRouter<B> {
    jobs: Arc<dyn JobStore>,
    emitter: FanoutEmitter<B>,
}

impl<B> SubmitterRouter<B>
where
    B: EventBus<EventEnvelope<JobEvent>>,
{
    pub fn new(jobs: Arc<dyn JobStore>, bus: B) -> Self {
        Self {
            jobs,
            emitter: FanoutEmitter::new(bus),
        }
    }

    pub fn bus(&self) -> &B {
        self.emitter.bus()
    }

    /// Resolve the submitter and fan out. Unknown jobs are `NotFound`.
    pub fn route(&self, event: JobEvent) -> Result<(), JobError> {
        let submitter = self.submitter_of(&event)?;
        self.emitter.deliver(submitter, event);
        Ok(())
    }

    fn submitter_of(&self, event: &JobEvent) -> Result<UserId, JobError> {
        match event {
            JobEvent::Created { job, .. } | JobEvent::Completed { job, .. } => Ok(job.submitter),
            other => {
                let job_id = other.job_id();
                let job = self.jobs.get(job_id)?.ok_or(JobError::NotFound(job_id))?;
                Ok(job.submitter)
            }
        }
    }
}

impl<B> EventSink for SubmitterRouter<B>
where
    B: EventBus<EventEnvelope<JobEvent>>,
{
    fn emit(&self, event: JobEvent) {
        let job_id = event.job_id();
        let topic = event.topic();
        if let Err(err) = self.route(event) {
            warn!(job_id = %job_id, topic, error = %err, "dropping job event");
        }
    }
}
