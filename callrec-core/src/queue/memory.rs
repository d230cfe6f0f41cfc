use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ConversionJob, DepthProbe, JobPublisher, QueueDepth, QueueResult};

/// Records published jobs without delivering them. Depth always reads as
/// empty, so a run against it never waits on the drain loop.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    jobs: Arc<Mutex<Vec<ConversionJob>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<ConversionJob> {
        self.jobs
            .lock()
            .map(|jobs| jobs.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl JobPublisher for RecordingPublisher {
    async fn publish(&self, job: &ConversionJob, _delay: Duration) -> QueueResult<String> {
        let mut jobs = self
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.push(job.clone());
        Ok(format!("recorded-{}", jobs.len()))
    }
}

#[async_trait]
impl DepthProbe for RecordingPublisher {
    async fn approximate_depth(&self) -> QueueResult<QueueDepth> {
        Ok(QueueDepth::default())
    }
}
