//! Distinct-until-changed plus asymmetric debounce.
//!
//! `Update` decisions pass straight through and discard any pending stop.
//! `Stop` decisions are held for the debounce window and only forwarded if
//! nothing newer arrived in the meantime. Values equal to the last raw input
//! or to the last forwarded output are suppressed.

use std::time::Duration;

use callkeep_core::Decision;
use tokio::time::Instant;

/// Longest debounce window honoured. Longer windows are clamped so the
/// deadline arithmetic cannot overflow.
pub const MAX_DEBOUNCE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
pub struct DecisionPolicy {
    window: Duration,
    last_raw: Option<Decision>,
    pending: Option<(Decision, Instant)>,
    last_forwarded: Option<Decision>,
}

impl DecisionPolicy {
    pub fn new(window: Duration) -> Self {
        if window > MAX_DEBOUNCE_WINDOW {
            tracing::warn!(
                requested_ms = window.as_millis() as u64,
                max_ms = MAX_DEBOUNCE_WINDOW.as_millis() as u64,
                "stop debounce clamped"
            );
        }
        Self {
            window: window.min(MAX_DEBOUNCE_WINDOW),
            last_raw: None,
            pending: None,
            last_forwarded: None,
        }
    }

    /// Feed one raw decision. Returns the decision to forward right now, if any.
    pub fn offer(&mut self, decision: Decision, now: Instant) -> Option<Decision> {
        if self.last_raw.as_ref() == Some(&decision) {
            return None;
        }
        self.last_raw = Some(decision.clone());

        if decision.is_stop() && !self.window.is_zero() {
            self.pending = Some((decision, now + self.window));
            return None;
        }
        self.pending = None;
        self.forward(decision)
    }

    /// When the pending stop becomes due.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, deadline)| *deadline)
    }

    /// Release the pending stop if its window has elapsed.
    pub fn fire(&mut self, now: Instant) -> Option<Decision> {
        match &self.pending {
            Some((_, deadline)) if *deadline <= now => {
                let (decision, _) = self.pending.take()?;
                self.forward(decision)
            }
            _ => None,
        }
    }

    /// Upstream finished: release whatever is pending without waiting.
    pub fn flush(&mut self) -> Option<Decision> {
        let (decision, _) = self.pending.take()?;
        self.forward(decision)
    }

    fn forward(&mut self, decision: Decision) -> Option<Decision> {
        if self.last_forwarded.as_ref() == Some(&decision) {
            return None;
        }
        self.last_forwarded = Some(decision.clone());
        Some(decision)
    }
}
