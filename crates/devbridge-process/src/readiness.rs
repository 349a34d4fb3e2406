//! Readiness detection by polling the output queue

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::relay::OutputQueue;

/// When a launched process counts as initialized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    /// Queue depth that signals startup (None = any output)
    pub minimum_lines: Option<usize>,
    /// Floor on the total wait once output has started
    pub minimum_wait_seconds: Option<f64>,
    /// Give up if output has not started by then
    pub timeout_seconds: f64,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            minimum_lines: None,
            minimum_wait_seconds: None,
            timeout_seconds: 20.0,
        }
    }
}

impl ReadinessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn minimum_lines(mut self, lines: usize) -> Self {
        self.minimum_lines = Some(lines);
        self
    }

    pub fn minimum_wait_secs(mut self, secs: f64) -> Self {
        self.minimum_wait_seconds = Some(secs);
        self
    }

    pub fn timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        secs_to_duration(self.timeout_seconds)
    }

    pub fn minimum_wait(&self) -> Option<Duration> {
        self.minimum_wait_seconds
            .filter(|secs| *secs > 0.0)
            .map(secs_to_duration)
    }

    fn threshold_met(&self, queued: usize) -> bool {
        match self.minimum_lines {
            Some(lines) if lines > 0 => queued >= lines,
            _ => queued > 0,
        }
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

/// Outcome of a single poll tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    TimedOut,
}

/// Per-wait readiness state machine, separated from the clock for testing.
#[derive(Debug, Clone)]
pub struct ReadinessTracker {
    policy: ReadinessPolicy,
    started: bool,
}

impl ReadinessTracker {
    pub fn new(policy: ReadinessPolicy) -> Self {
        Self {
            policy,
            started: false,
        }
    }

    /// Whether output has started (sticky once observed)
    pub fn started(&self) -> bool {
        self.started
    }

    /// Feed one observation of queue depth at `elapsed` since the wait began
    pub fn observe(&mut self, queued: usize, elapsed: Duration) -> Readiness {
        if !self.started && self.policy.threshold_met(queued) {
            self.started = true;
            debug!(queued, elapsed_ms = elapsed.as_millis() as u64, "Process produced output");
        }

        if self.started {
            return match self.policy.minimum_wait() {
                Some(floor) if elapsed < floor => Readiness::Pending,
                _ => Readiness::Ready,
            };
        }

        if elapsed >= self.policy.timeout() {
            Readiness::TimedOut
        } else {
            Readiness::Pending
        }
    }
}

/// Poll `queue` every `poll_interval` until `policy` reports ready or times out.
///
/// Counts every line the queue has received, so a threshold above the
/// queue capacity is still reachable. A timeout is a normal `false`
/// result, not an error.
pub async fn wait_for_ready(
    queue: &OutputQueue,
    policy: &ReadinessPolicy,
    poll_interval: Duration,
) -> bool {
    debug!(
        minimum_lines = ?policy.minimum_lines,
        minimum_wait_seconds = ?policy.minimum_wait_seconds,
        timeout_seconds = policy.timeout_seconds,
        "Waiting for process to start"
    );

    let mut tracker = ReadinessTracker::new(policy.clone());
    let begin = Instant::now();

    loop {
        let elapsed = begin.elapsed();
        let received = usize::try_from(queue.received()).unwrap_or(usize::MAX);
        match tracker.observe(received, elapsed) {
            Readiness::Ready => {
                debug!(elapsed_ms = elapsed.as_millis() as u64, "Process is ready");
                return true;
            }
            Readiness::TimedOut => {
                debug!(elapsed_ms = elapsed.as_millis() as u64, "Timed out waiting for process output");
                return false;
            }
            Readiness::Pending => sleep(poll_interval).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{OutputLine, StreamKind};
    use proptest::prelude::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_ready_at_threshold_without_minimum_wait() {
        let mut tracker = ReadinessTracker::new(ReadinessPolicy::new().minimum_lines(2));
        assert_eq!(tracker.observe(0, ms(0)), Readiness::Pending);
        assert_eq!(tracker.observe(1, ms(500)), Readiness::Pending);
        assert_eq!(tracker.observe(2, ms(1000)), Readiness::Ready);
    }

    #[test]
    fn test_unset_minimum_lines_means_any_output() {
        let mut tracker = ReadinessTracker::new(ReadinessPolicy::new());
        assert_eq!(tracker.observe(0, ms(0)), Readiness::Pending);
        assert_eq!(tracker.observe(1, ms(500)), Readiness::Ready);
    }

    #[test]
    fn test_minimum_wait_holds_ready_back() {
        let policy = ReadinessPolicy::new().minimum_lines(1).minimum_wait_secs(2.0);
        let mut tracker = ReadinessTracker::new(policy);
        assert_eq!(tracker.observe(1, ms(500)), Readiness::Pending);
        assert!(tracker.started());
        assert_eq!(tracker.observe(1, ms(1500)), Readiness::Pending);
        assert_eq!(tracker.observe(1, ms(2000)), Readiness::Ready);
    }

    #[test]
    fn test_minimum_wait_already_elapsed_is_ready_immediately() {
        let policy = ReadinessPolicy::new()
            .minimum_lines(1)
            .minimum_wait_secs(1.0)
            .timeout_secs(10.0);
        let mut tracker = ReadinessTracker::new(policy);
        assert_eq!(tracker.observe(0, ms(2500)), Readiness::Pending);
        assert_eq!(tracker.observe(3, ms(3000)), Readiness::Ready);
    }

    #[test]
    fn test_started_survives_queue_drain() {
        let policy = ReadinessPolicy::new().minimum_lines(1).minimum_wait_secs(1.0);
        let mut tracker = ReadinessTracker::new(policy);
        assert_eq!(tracker.observe(1, ms(0)), Readiness::Pending);
        assert_eq!(tracker.observe(0, ms(1000)), Readiness::Ready);
    }

    #[test]
    fn test_times_out_without_output() {
        let mut tracker = ReadinessTracker::new(ReadinessPolicy::new().timeout_secs(2.0));
        assert_eq!(tracker.observe(0, ms(1999)), Readiness::Pending);
        assert_eq!(tracker.observe(0, ms(2000)), Readiness::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_within_one_poll_interval() {
        let queue = OutputQueue::new(4);
        let policy = ReadinessPolicy::new().minimum_lines(1).timeout_secs(2.0);

        let begin = tokio::time::Instant::now();
        assert!(!wait_for_ready(&queue, &policy, ms(500)).await);
        let waited = begin.elapsed();
        assert!(waited >= ms(2000), "returned early: {waited:?}");
        assert!(waited <= ms(2500), "returned late: {waited:?}");
    }

    #[tokio::test]
    async fn test_wait_sees_lines_pushed_concurrently() {
        let queue = OutputQueue::new(4);
        let producer = queue.clone();
        tokio::spawn(async move {
            sleep(ms(20)).await;
            producer.push(OutputLine::new(StreamKind::Stdout, "line1"));
            producer.push(OutputLine::new(StreamKind::Stdout, "line2"));
        });

        let policy = ReadinessPolicy::new().minimum_lines(2).timeout_secs(5.0);
        assert!(wait_for_ready(&queue, &policy, ms(10)).await);
    }

    #[tokio::test]
    async fn test_threshold_above_capacity_is_reachable() {
        let queue = OutputQueue::new(2);
        for i in 0..5 {
            queue.push(OutputLine::new(StreamKind::Stdout, format!("line{i}")));
        }
        assert_eq!(queue.len(), 2);

        let policy = ReadinessPolicy::new().minimum_lines(5).timeout_secs(1.0);
        assert!(wait_for_ready(&queue, &policy, ms(10)).await);
    }

    #[tokio::test]
    async fn test_drained_lines_still_count() {
        let queue = OutputQueue::new(8);
        queue.push(OutputLine::new(StreamKind::Stdout, "banner"));
        queue.push(OutputLine::new(StreamKind::Stderr, "listening"));
        assert_eq!(queue.drain().len(), 2);

        let policy = ReadinessPolicy::new().minimum_lines(2).timeout_secs(1.0);
        assert!(wait_for_ready(&queue, &policy, ms(10)).await);
    }

    proptest! {
        #[test]
        fn prop_ready_first_tick_at_threshold(n in 1usize..20, depths in proptest::collection::vec(0usize..40, 1..30)) {
            let mut tracker = ReadinessTracker::new(ReadinessPolicy::new().minimum_lines(n).timeout_secs(1000.0));
            for (tick, depth) in depths.iter().enumerate() {
                let result = tracker.observe(*depth, ms(tick as u64 * 500));
                if *depth >= n {
                    prop_assert_eq!(result, Readiness::Ready);
                    break;
                }
                prop_assert_eq!(result, Readiness::Pending);
            }
        }

        #[test]
        fn prop_silent_process_times_out_exactly_at_deadline(timeout_ms in 1u64..10_000, tick_ms in 1u64..1000) {
            let policy = ReadinessPolicy::new().minimum_lines(1).timeout_secs(timeout_ms as f64 / 1000.0);
            let deadline = policy.timeout();
            let tick = ms(tick_ms);
            let mut tracker = ReadinessTracker::new(policy);
            let mut now = Duration::ZERO;
            loop {
                match tracker.observe(0, now) {
                    Readiness::TimedOut => {
                        prop_assert!(now >= deadline);
                        prop_assert!(now < deadline + tick);
                        break;
                    }
                    Readiness::Pending => now += tick,
                    Readiness::Ready => prop_assert!(false, "silent process reported ready"),
                }
            }
        }
    }
}
