//! Speed and ETA estimation for one task, and reconciliation between the
//! engine's own progress estimates and frames from the push channel.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use crate::channel::ProgressMessage;
use super::task::UploadTask;

const MAX_SAMPLES: usize = 8;

#[derive(Debug, Default)]
pub struct TaskTelemetry {
    /// (observed_at, uploaded bytes), oldest first
    samples: VecDeque<(Instant, u64)>,
    last_local: Option<Instant>,
    last_channel: Option<Instant>,
}

impl TaskTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a locally computed byte count unless a newer or equally fresh
    /// channel frame has already been applied.
    pub fn apply_local(&mut self, task: &mut UploadTask, bytes: u64, observed_at: Instant) -> bool {
        if self.last_channel.is_some_and(|channel| channel >= observed_at) {
            return false;
        }

        self.last_local = Some(observed_at);
        task.set_uploaded(bytes);
        self.record(task, observed_at);
        true
    }

    /// Applies a channel frame when it is at least as fresh as the last local
    /// estimate. Returns false when the frame carried nothing usable or lost.
    pub fn apply_channel(&mut self, task: &mut UploadTask, message: &ProgressMessage, received_at: Instant) -> bool {
        if self.last_local.is_some_and(|local| received_at < local) {
            return false;
        }
        let Some(bytes) = message.bytes_for(task.total_bytes) else {
            return false;
        };

        self.last_channel = Some(received_at);
        task.set_uploaded(bytes);
        self.record(task, received_at);
        true
    }

    /// Records the current byte count and refreshes `speed`/`eta` on the task.
    /// Called on every tick so speed decays when no update arrives.
    pub fn sample(&mut self, task: &mut UploadTask, now: Instant) {
        self.record(task, now);
    }

    fn record(&mut self, task: &mut UploadTask, at: Instant) {
        // reports can be observed before a tick that was handled earlier
        let position = self.samples
            .iter()
            .rposition(|(t, _)| *t <= at)
            .map_or(0, |i| i + 1);
        self.samples.insert(position, (at, task.uploaded_bytes));
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }

        task.speed = self.speed();
        task.eta = eta(task.remaining_bytes(), task.speed);
    }

    /// Bytes per second between the two newest samples.
    pub fn speed(&self) -> f64 {
        let mut newest = self.samples.iter().rev();
        let (Some(&(t1, b1)), Some(&(t0, b0))) = (newest.next(), newest.next()) else {
            return 0.0;
        };

        let elapsed = t1.duration_since(t0).as_secs_f64();
        if elapsed <= 0.0 || b1 < b0 {
            return 0.0;
        }
        (b1 - b0) as f64 / elapsed
    }

    /// Forget everything, for a new run of the same task.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_local = None;
        self.last_channel = None;
    }
}

pub fn eta(remaining_bytes: u64, speed: f64) -> Option<Duration> {
    if speed > 0.0 {
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    } else {
        None
    }
}
