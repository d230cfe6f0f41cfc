use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::queue::{DepthProbe, QueueDepth, QueueResult};

/// When the queue counts as drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainCriterion {
    /// Nothing is waiting out a publish delay.
    #[default]
    DelayedOnly,
    /// Visible, delayed and in-flight counters are all zero.
    AllEmpty,
}

impl DrainCriterion {
    pub fn is_drained(&self, depth: &QueueDepth) -> bool {
        match self {
            DrainCriterion::DelayedOnly => depth.delayed == 0,
            DrainCriterion::AllEmpty => depth.total() == 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub waits: u32,
    pub last_depth: QueueDepth,
}

/// Polls queue depth until the criterion holds, sleeping a fixed interval
/// between polls.
///
/// The counters are approximate, so this may return early or late. Jobs are
/// idempotent and the orchestrator only uses it to pace page advancement.
pub struct QueueDrainMonitor {
    probe: Arc<dyn DepthProbe>,
    interval: Duration,
    criterion: DrainCriterion,
}

impl QueueDrainMonitor {
    pub fn new(probe: Arc<dyn DepthProbe>, interval: Duration, criterion: DrainCriterion) -> Self {
        Self {
            probe,
            interval,
            criterion,
        }
    }

    pub async fn check(&self) -> QueueResult<(bool, QueueDepth)> {
        let depth = self.probe.approximate_depth().await?;
        Ok((self.criterion.is_drained(&depth), depth))
    }

    pub async fn wait_for_drain(&self) -> QueueResult<DrainReport> {
        let mut waits = 0u32;
        loop {
            let (drained, depth) = self.check().await?;
            if drained {
                info!(
                    waits,
                    visible = depth.visible,
                    delayed = depth.delayed,
                    in_flight = depth.in_flight,
                    "queue drained"
                );
                return Ok(DrainReport {
                    waits,
                    last_depth: depth,
                });
            }
            debug!(
                visible = depth.visible,
                delayed = depth.delayed,
                in_flight = depth.in_flight,
                interval_secs = self.interval.as_secs(),
                "queue not drained, waiting"
            );
            tokio::time::sleep(self.interval).await;
            waits += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedProbe {
        depths: Mutex<VecDeque<QueueDepth>>,
    }

    impl ScriptedProbe {
        fn delayed(values: &[u64]) -> Self {
            Self {
                depths: Mutex::new(
                    values
                        .iter()
                        .map(|&delayed| QueueDepth {
                            visible: 7,
                            delayed,
                            in_flight: 2,
                        })
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl DepthProbe for ScriptedProbe {
        async fn approximate_depth(&self) -> QueueResult<QueueDepth> {
            let mut depths = self.depths.lock().unwrap();
            let next = if depths.len() > 1 {
                depths.pop_front().unwrap()
            } else {
                *depths.front().unwrap()
            };
            Ok(next)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_twice_for_three_one_zero() {
        let monitor = QueueDrainMonitor::new(
            Arc::new(ScriptedProbe::delayed(&[3, 1, 0])),
            Duration::from_secs(60),
            DrainCriterion::DelayedOnly,
        );
        let started = tokio::time::Instant::now();
        let report = monitor.wait_for_drain().await.unwrap();
        assert_eq!(report.waits, 2);
        assert_eq!(report.last_depth.delayed, 0);
        assert_eq!(started.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn already_drained_queue_does_not_wait() {
        let monitor = QueueDrainMonitor::new(
            Arc::new(ScriptedProbe::delayed(&[0])),
            Duration::from_secs(60),
            DrainCriterion::DelayedOnly,
        );
        assert_eq!(monitor.wait_for_drain().await.unwrap().waits, 0);
    }

    #[test]
    fn all_empty_requires_every_counter_at_zero() {
        let busy = QueueDepth {
            visible: 0,
            delayed: 0,
            in_flight: 1,
        };
        assert!(DrainCriterion::DelayedOnly.is_drained(&busy));
        assert!(!DrainCriterion::AllEmpty.is_drained(&busy));
        assert!(DrainCriterion::AllEmpty.is_drained(&QueueDepth::default()));
    }
}
