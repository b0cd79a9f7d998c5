//! Status stabilization
//!
//! Per-frame verdicts jitter. The filter keeps the displayed status apart from
//! the latest raw verdict and only lets a good/bad flip through once the new
//! verdict has held for `confirm_ms`. Message-only changes are rate limited
//! by `message_dwell_ms`. Whatever gets published is the newest raw status.

use crate::config::StabilityConfig;
use crate::types::PostureStatus;

/// A flip that has been seen but not yet confirmed
#[derive(Debug, Clone)]
struct PendingFlip {
    is_good: bool,
    since_ms: f64,
}

#[derive(Debug, Clone)]
pub struct StabilityFilter {
    config: StabilityConfig,
    displayed: Option<PostureStatus>,
    last_publish_ms: f64,
    pending: Option<PendingFlip>,
}

impl Default for StabilityFilter {
    fn default() -> Self {
        Self::new(StabilityConfig::default())
    }
}

impl StabilityFilter {
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            config,
            displayed: None,
            last_publish_ms: 0.0,
            pending: None,
        }
    }

    /// Feed one raw verdict observed at `now_ms`.
    ///
    /// Returns the status to publish, or `None` when the displayed status
    /// should stay as it is.
    pub fn observe(&mut self, raw: &PostureStatus, now_ms: f64) -> Option<PostureStatus> {
        let Some(displayed) = &self.displayed else {
            return Some(self.publish(raw, now_ms));
        };

        if raw.is_good == displayed.is_good {
            // Back to the displayed verdict: any pending flip was noise
            self.pending = None;

            let dwell_elapsed = now_ms - self.last_publish_ms >= self.config.message_dwell_ms as f64;
            if raw.message != displayed.message && dwell_elapsed {
                return Some(self.publish(raw, now_ms));
            }
            return None;
        }

        let since_ms = match &self.pending {
            Some(pending) if pending.is_good == raw.is_good => pending.since_ms,
            _ => {
                self.pending = Some(PendingFlip {
                    is_good: raw.is_good,
                    since_ms: now_ms,
                });
                now_ms
            }
        };

        if now_ms - since_ms >= self.config.confirm_ms as f64 {
            return Some(self.publish(raw, now_ms));
        }
        None
    }

    /// Status currently shown, if anything has been published
    pub fn displayed(&self) -> Option<&PostureStatus> {
        self.displayed.as_ref()
    }

    /// Forget everything (new detection run, new baseline)
    pub fn reset(&mut self) {
        self.displayed = None;
        self.pending = None;
        self.last_publish_ms = 0.0;
    }

    fn publish(&mut self, raw: &PostureStatus, now_ms: f64) -> PostureStatus {
        self.displayed = Some(raw.clone());
        self.last_publish_ms = now_ms;
        self.pending = None;
        raw.clone()
    }
}
