//! Transport recovery decisions.
//!
//! [`RecoveryController`] is sans-I/O in the same way `str0m::Rtc` is: it is
//! fed ICE states and attempt outcomes together with the current time, and
//! tells the caller when it next wants to be woken ([`poll_timeout`]). It
//! owns the retry counter and at most one pending timer, either the grace
//! period after a `disconnected` or the backoff before a reopen.
//!
//! [`poll_timeout`]: RecoveryController::poll_timeout

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::transport::IceState;

/// What the controller wants the session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// A reopen is scheduled after `delay`. Nothing to do yet.
    Scheduled { attempt: u32, delay: Duration },
    /// Tear down the transport handle and run a full handshake.
    Reopen { attempt: u32 },
    /// Repair in place with an ICE restart.
    Restart,
    /// Retries are used up. The session is over.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Grace,
    Backoff { attempt: u32 },
}

#[derive(Debug)]
pub struct RecoveryController {
    config: RecoveryConfig,
    ice: IceState,
    attempt_count: u32,
    pending: Option<(Instant, Timer)>,
    /// An ICE restart was already tried during the current outage.
    restarted: bool,
    exhausted: bool,
}

impl RecoveryController {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            ice: IceState::New,
            attempt_count: 0,
            pending: None,
            restarted: false,
            exhausted: false,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn ice_state(&self) -> IceState {
        self.ice
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Whether a grace or backoff timer is armed.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether a reopen is scheduled.
    pub fn is_reopen_pending(&self) -> bool {
        matches!(self.pending, Some((_, Timer::Backoff { .. })))
    }

    /// Forgets everything. Used when a new session begins.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    /// Disarms the pending timer, if any.
    pub fn cancel(&mut self) {
        if let Some((_, timer)) = self.pending.take() {
            debug!(?timer, "Recovery timer cancelled");
        }
    }

    /// The transport reached a usable state. Cancels any pending timer and
    /// zeroes the retry counter.
    pub fn handle_recovered(&mut self) {
        if self.attempt_count > 0 || self.pending.is_some() {
            info!(attempts = self.attempt_count, "Transport recovered");
        }
        self.cancel();
        self.attempt_count = 0;
        self.restarted = false;
    }

    pub fn handle_ice_state(&mut self, state: IceState, now: Instant) -> Option<Recovery> {
        self.ice = state;
        if self.exhausted {
            return None;
        }

        match state {
            IceState::Connected | IceState::Completed => {
                self.handle_recovered();
                None
            }
            IceState::Disconnected => {
                // Repeated notifications must not re-arm; a pending backoff
                // already covers this outage.
                if self.pending.is_none() {
                    let grace = self.config.grace_period();
                    debug!(?grace, "ICE disconnected, arming grace timer");
                    self.pending = Some((now + grace, Timer::Grace));
                }
                None
            }
            IceState::Failed | IceState::Closed => {
                if self.is_reopen_pending() {
                    return None;
                }
                warn!(?state, "Transport failed, escalating");
                self.cancel();
                Some(self.escalate(now))
            }
            IceState::New | IceState::Checking => None,
        }
    }

    /// A handshake or ICE restart did not succeed.
    pub fn handle_attempt_failed(&mut self, now: Instant) -> Option<Recovery> {
        if self.exhausted {
            return None;
        }
        self.cancel();
        Some(self.escalate(now))
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.pending.map(|(at, _)| at)
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Option<Recovery> {
        let (at, timer) = self.pending?;
        if now < at {
            return None;
        }
        self.pending = None;

        match timer {
            Timer::Grace => {
                if matches!(self.ice, IceState::Connected | IceState::Completed) {
                    return None;
                }
                if self.config.ice_restart_first && !self.restarted {
                    info!("Grace period elapsed, attempting ICE restart");
                    self.restarted = true;
                    self.pending = Some((now + self.config.grace_period(), Timer::Grace));
                    return Some(Recovery::Restart);
                }
                info!(state = ?self.ice, "Grace period elapsed, escalating");
                Some(self.escalate(now))
            }
            Timer::Backoff { attempt } => {
                // The handle is about to be replaced; its ICE state is moot.
                self.ice = IceState::New;
                Some(Recovery::Reopen { attempt })
            }
        }
    }

    fn escalate(&mut self, now: Instant) -> Recovery {
        if self.attempt_count >= self.config.max_attempts {
            warn!(attempts = self.attempt_count, "Reconnection attempts exhausted");
            self.exhausted = true;
            self.pending = None;
            return Recovery::Exhausted {
                attempts: self.attempt_count,
            };
        }

        self.attempt_count += 1;
        let attempt = self.attempt_count;
        let delay = self.config.delay_for(attempt);
        info!(attempt, ?delay, "Scheduling reconnection");
        self.pending = Some((now + delay, Timer::Backoff { attempt }));
        Recovery::Scheduled { attempt, delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GRACE: Duration = Duration::from_secs(5);

    fn controller() -> RecoveryController {
        RecoveryController::new(RecoveryConfig::default())
    }

    fn connected(now: Instant) -> RecoveryController {
        let mut rc = controller();
        rc.handle_ice_state(IceState::Checking, now);
        rc.handle_ice_state(IceState::Connected, now);
        rc
    }

    #[test]
    fn blip_within_grace_never_reconnects() {
        let t0 = Instant::now();
        let mut rc = connected(t0);

        assert_eq!(rc.handle_ice_state(IceState::Disconnected, t0), None);
        assert_eq!(rc.poll_timeout(), Some(t0 + GRACE));

        rc.handle_ice_state(IceState::Connected, t0 + Duration::from_secs(2));
        assert_eq!(rc.poll_timeout(), None);
        assert_eq!(rc.handle_timeout(t0 + Duration::from_secs(60)), None);
        assert_eq!(rc.attempt_count(), 0);
    }

    #[test]
    fn repeated_disconnects_arm_one_timer() {
        let t0 = Instant::now();
        let mut rc = connected(t0);

        for s in 0..4 {
            rc.handle_ice_state(IceState::Disconnected, t0 + Duration::from_secs(s));
        }
        assert_eq!(rc.poll_timeout(), Some(t0 + GRACE));

        let fired = rc.handle_timeout(t0 + GRACE);
        assert_eq!(
            fired,
            Some(Recovery::Scheduled {
                attempt: 1,
                delay: Duration::from_secs(1)
            })
        );
        // Still disconnected during backoff: nothing new is armed.
        rc.handle_ice_state(IceState::Disconnected, t0 + GRACE);
        assert_eq!(rc.poll_timeout(), Some(t0 + GRACE + Duration::from_secs(1)));

        assert_eq!(
            rc.handle_timeout(t0 + GRACE + Duration::from_secs(1)),
            Some(Recovery::Reopen { attempt: 1 })
        );
        assert_eq!(rc.poll_timeout(), None);
        assert_eq!(rc.attempt_count(), 1);
    }

    #[test]
    fn timer_does_not_fire_early() {
        let t0 = Instant::now();
        let mut rc = connected(t0);
        rc.handle_ice_state(IceState::Disconnected, t0);
        assert_eq!(rc.handle_timeout(t0 + Duration::from_secs(4)), None);
        assert!(rc.is_pending());
    }

    #[test]
    fn failed_escalates_without_grace() {
        let t0 = Instant::now();
        let mut rc = connected(t0);
        rc.handle_ice_state(IceState::Disconnected, t0);

        let decision = rc.handle_ice_state(IceState::Failed, t0 + Duration::from_secs(1));
        assert!(matches!(decision, Some(Recovery::Scheduled { attempt: 1, .. })));
        assert!(rc.is_reopen_pending());

        // A second failure report during backoff does not schedule twice.
        assert_eq!(rc.handle_ice_state(IceState::Failed, t0 + Duration::from_secs(1)), None);
        assert_eq!(rc.attempt_count(), 1);
    }

    #[test]
    fn grace_expiry_while_failed_escalates() {
        let t0 = Instant::now();
        let mut rc = connected(t0);
        rc.handle_ice_state(IceState::Disconnected, t0);
        rc.ice = IceState::Failed;
        assert!(matches!(
            rc.handle_timeout(t0 + GRACE),
            Some(Recovery::Scheduled { attempt: 1, .. })
        ));
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let mut now = Instant::now();
        let mut rc = connected(now);
        assert!(matches!(
            rc.handle_ice_state(IceState::Failed, now),
            Some(Recovery::Scheduled { attempt: 1, .. })
        ));

        for expected in 1..=3 {
            now += Duration::from_secs(60);
            assert_eq!(rc.handle_timeout(now), Some(Recovery::Reopen { attempt: expected }));
            let next = rc.handle_attempt_failed(now);
            if expected < 3 {
                assert!(matches!(next, Some(Recovery::Scheduled { attempt, .. }) if attempt == expected + 1));
            } else {
                assert_eq!(next, Some(Recovery::Exhausted { attempts: 3 }));
            }
        }

        assert!(rc.is_exhausted());
        assert_eq!(rc.attempt_count(), 3);
        assert_eq!(rc.poll_timeout(), None);
        assert_eq!(rc.handle_ice_state(IceState::Failed, now), None);
        assert_eq!(rc.handle_attempt_failed(now), None);
    }

    #[test]
    fn backoff_grows_between_attempts() {
        let t0 = Instant::now();
        let mut rc = connected(t0);
        rc.handle_ice_state(IceState::Failed, t0);
        assert_eq!(rc.poll_timeout(), Some(t0 + Duration::from_secs(1)));
        rc.handle_timeout(t0 + Duration::from_secs(1));
        rc.handle_attempt_failed(t0 + Duration::from_secs(1));
        assert_eq!(rc.poll_timeout(), Some(t0 + Duration::from_secs(3)));
    }

    #[test]
    fn reconnection_success_resets_counter() {
        let t0 = Instant::now();
        let mut rc = connected(t0);
        rc.handle_ice_state(IceState::Failed, t0);
        rc.handle_timeout(t0 + Duration::from_secs(1));
        assert_eq!(rc.attempt_count(), 1);

        rc.handle_ice_state(IceState::Checking, t0 + Duration::from_secs(2));
        rc.handle_ice_state(IceState::Completed, t0 + Duration::from_secs(3));
        assert_eq!(rc.attempt_count(), 0);
    }

    #[test]
    fn ice_restart_is_tried_once_per_outage() {
        let t0 = Instant::now();
        let mut rc = RecoveryController::new(RecoveryConfig {
            ice_restart_first: true,
            ..Default::default()
        });
        rc.handle_ice_state(IceState::Connected, t0);
        rc.handle_ice_state(IceState::Disconnected, t0);

        assert_eq!(rc.handle_timeout(t0 + GRACE), Some(Recovery::Restart));
        assert_eq!(rc.poll_timeout(), Some(t0 + GRACE + GRACE));
        rc.handle_ice_state(IceState::Checking, t0 + GRACE);

        assert!(matches!(
            rc.handle_timeout(t0 + GRACE + GRACE),
            Some(Recovery::Scheduled { attempt: 1, .. })
        ));
    }

    fn pre_connect_state() -> impl Strategy<Value = IceState> {
        prop_oneof![
            Just(IceState::New),
            Just(IceState::Checking),
            Just(IceState::Disconnected),
        ]
    }

    proptest! {
        #[test]
        fn any_blip_healed_before_grace_never_reconnects(
            states in prop::collection::vec(pre_connect_state(), 0..20),
            steps_ms in prop::collection::vec(0u64..200, 20),
            healed_by in prop_oneof![Just(IceState::Connected), Just(IceState::Completed)],
        ) {
            let t0 = Instant::now();
            let mut rc = connected(t0);
            let mut now = t0;
            for (state, step) in states.iter().zip(steps_ms.iter()) {
                now += Duration::from_millis(*step);
                prop_assert_eq!(rc.handle_ice_state(*state, now), None);
                prop_assert_eq!(rc.handle_timeout(now), None);
            }
            rc.handle_ice_state(healed_by, now);

            prop_assert_eq!(rc.poll_timeout(), None);
            prop_assert_eq!(rc.handle_timeout(now + Duration::from_secs(3600)), None);
            prop_assert_eq!(rc.attempt_count(), 0);
        }
    }
}
