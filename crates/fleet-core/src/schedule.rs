//! # Push Scheduling Rules
//!
//! Pure decisions used by the push scheduler: whether a device is due for
//! contact, and how many devices may be dispatched per throttle tick.
//!
//! ## Eligibility
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      PushDecision::evaluate                             │
//! │                                                                         │
//! │  now < next_push ?  ── yes ──► Scheduled    (no push)                  │
//! │        │ no                                                             │
//! │        ▼                                                               │
//! │  any info timestamp missing ? ── yes ──► MissingInfo (push)            │
//! │        │ no                                                             │
//! │        ▼                                                               │
//! │  any older than 24h ? ── yes ──► StaleInfo (push)                      │
//! │        │ no                                                             │
//! │        ▼                                                               │
//! │  Default (push)                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The last branch keeps the long-standing behaviour of treating every
//! device without an explicit future schedule as due.

use chrono::{DateTime, Duration, Utc};

use crate::types::Device;
use crate::INFO_FRESHNESS_HOURS;

/// Duration of one dispatch throttle tick in milliseconds.
pub const THROTTLE_TICK_MS: u64 = 500;

/// Why a device was or was not selected for a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDecision {
    /// An explicit future schedule exists.
    Scheduled,
    /// At least one information class was never received.
    MissingInfo,
    /// All classes were received but one is older than the freshness window.
    StaleInfo,
    /// Nothing ruled the device out.
    Default,
}

impl PushDecision {
    pub fn evaluate(device: &Device, now: DateTime<Utc>) -> Self {
        if let Some(next_push) = device.next_push {
            if now < next_push {
                return PushDecision::Scheduled;
            }
        }

        let timestamps = device.info_timestamps();
        if timestamps.iter().any(Option::is_none) {
            return PushDecision::MissingInfo;
        }

        let cutoff = now - Duration::hours(INFO_FRESHNESS_HOURS);
        if timestamps.iter().flatten().any(|at| *at < cutoff) {
            return PushDecision::StaleInfo;
        }

        PushDecision::Default
    }

    pub fn needs_push(&self) -> bool {
        !matches!(self, PushDecision::Scheduled)
    }
}

/// Shorthand for `PushDecision::evaluate(device, now).needs_push()`.
pub fn needs_push(device: &Device, now: DateTime<Utc>) -> bool {
    PushDecision::evaluate(device, now).needs_push()
}

/// Target dispatch rate in devices per second, spreading `eligible` devices
/// across a delay window of `window_secs`.
pub fn dispatch_rate(eligible: usize, window_secs: u64) -> f64 {
    let spread = window_secs.saturating_sub(1).max(1);
    eligible as f64 / spread as f64
}

/// Number of dispatches allowed before the scheduler sleeps one tick.
///
/// Never zero, so a small fleet is still dispatched.
pub fn dispatch_quota(eligible: usize, window_secs: u64) -> usize {
    (dispatch_rate(eligible, window_secs).ceil() as usize).max(1)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InfoClass;

    fn fresh_device(now: DateTime<Utc>) -> Device {
        let mut device = Device::new("D1", "SERIAL");
        for class in InfoClass::ALL {
            device.set_last_received(class, now - Duration::hours(1));
        }
        device
    }

    #[test]
    fn test_future_schedule_suppresses_push() {
        let now = Utc::now();
        let mut device = Device::new("D1", "SERIAL");
        device.next_push = Some(now + Duration::minutes(5));

        assert_eq!(PushDecision::evaluate(&device, now), PushDecision::Scheduled);
        assert!(!needs_push(&device, now));
    }

    #[test]
    fn test_past_schedule_does_not_suppress_push() {
        let now = Utc::now();
        let mut device = Device::new("D1", "SERIAL");
        device.next_push = Some(now - Duration::minutes(5));

        assert_eq!(PushDecision::evaluate(&device, now), PushDecision::MissingInfo);
    }

    #[test]
    fn test_missing_info_needs_push() {
        let now = Utc::now();
        let mut device = fresh_device(now);
        device.last_certificate_list_received = None;

        assert_eq!(PushDecision::evaluate(&device, now), PushDecision::MissingInfo);
        assert!(needs_push(&device, now));
    }

    #[test]
    fn test_stale_info_needs_push() {
        let now = Utc::now();
        let mut device = fresh_device(now);
        device.last_profile_list_received = Some(now - Duration::hours(25));

        assert_eq!(PushDecision::evaluate(&device, now), PushDecision::StaleInfo);
        assert!(needs_push(&device, now));
    }

    #[test]
    fn test_fresh_device_without_schedule_still_needs_push() {
        // Observed fallback: nothing rules the device out, so it is eligible.
        let now = Utc::now();
        let device = fresh_device(now);

        assert_eq!(PushDecision::evaluate(&device, now), PushDecision::Default);
        assert!(needs_push(&device, now));
    }

    #[test]
    fn test_dispatch_quota_spreads_across_window() {
        assert_eq!(dispatch_quota(0, 60), 1);
        assert_eq!(dispatch_quota(59, 60), 1);
        assert_eq!(dispatch_quota(590, 60), 10);
        assert_eq!(dispatch_quota(591, 60), 11);
    }

    #[test]
    fn test_dispatch_rate_handles_tiny_windows() {
        assert_eq!(dispatch_rate(10, 1), 10.0);
        assert_eq!(dispatch_rate(10, 0), 10.0);
        assert_eq!(dispatch_rate(10, 11), 1.0);
    }
}
