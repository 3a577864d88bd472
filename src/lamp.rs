//! Lamp arbitration between the two arms.
//!
//! The calibration lamp bank illuminates both arms, so at most one arm may
//! hold lamp rights at a time. An arm either holds a lit [`LampSet`] (arcs,
//! flats, focus scans) or a *no-lamp* assertion (science, bias, dark) that
//! keeps the other arm from switching a lamp on mid-exposure.
//!
//! Every grant is represented by a [`LampHandle`]. Handlers release it
//! explicitly with [`LampHandle::release`], which switches the lamps off
//! before clearing the record. A handle dropped without an explicit release
//! (early return, panic, cancelled task) spawns the same release on the
//! runtime.

use crate::arm::Arm;
use crate::cancel::AbortToken;
use crate::command::LampStatus;
use crate::error::{CommandError, HandlerResult};
use crate::hardware::{LampController, LampSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Error offset for a lamp bank that refused to switch on.
pub const LAMP_ON_OFFSET: i32 = 1120;

/// What an arm holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LampClaim {
    /// No lamp may be lit.
    NoLamp,
    /// These lamps are lit.
    Lamp(LampSet),
}

#[derive(Debug)]
struct Holder {
    arm: Arm,
    claim: LampClaim,
    holds: usize,
}

enum Grant {
    Fresh,
    Reentrant,
    Busy(Arm),
}

/// Serialises lamp usage across arms.
pub struct LampArbiter {
    lamps: Arc<dyn LampController>,
    record: Mutex<Option<Holder>>,
    changed: Notify,
    poll_interval: Duration,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl LampArbiter {
    /// Create an arbiter driving `lamps`. Blocked requests re-check their
    /// abort token at least every `poll_interval`.
    pub fn new(lamps: Arc<dyn LampController>, poll_interval: Duration) -> Self {
        Self {
            lamps,
            record: Mutex::new(None),
            changed: Notify::new(),
            poll_interval,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Wait for lamp rights, then switch `lamps` on for `arm`.
    pub async fn acquire_lamp(
        self: &Arc<Self>,
        arm: Arm,
        lamps: LampSet,
        abort: &AbortToken,
    ) -> HandlerResult<LampHandle> {
        self.acquire(arm, LampClaim::Lamp(lamps), abort).await
    }

    /// Wait until no arm holds lamp rights, then assert no-lamp for `arm`.
    pub async fn acquire_no_lamp(self: &Arc<Self>, arm: Arm, abort: &AbortToken) -> HandlerResult<LampHandle> {
        self.acquire(arm, LampClaim::NoLamp, abort).await
    }

    async fn acquire(self: &Arc<Self>, arm: Arm, claim: LampClaim, abort: &AbortToken) -> HandlerResult<LampHandle> {
        let mut waited = false;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_grant(arm, &claim) {
                Grant::Fresh => {
                    if let LampClaim::Lamp(set) = &claim {
                        let pending = PendingTurnOn {
                            arbiter: self,
                            arm,
                            lamps: set,
                            armed: true,
                        };
                        let turned_on = self.lamps.turn_on(set).await;
                        pending.disarm();
                        if let Err(err) = turned_on {
                            self.abandon_failed_turn_on(arm, set).await;
                            return Err(CommandError::hardware(LAMP_ON_OFFSET, "lamp", err));
                        }
                        info!(%arm, lamps = %set, "Lamps on");
                    }
                    return Ok(self.grant(arm, claim));
                }
                Grant::Reentrant => return Ok(self.grant(arm, claim)),
                Grant::Busy(holder) => {
                    if !waited {
                        debug!(%arm, %holder, ?claim, "Waiting for lamp rights");
                        waited = true;
                    }
                }
            }

            abort.check()?;
            tokio::select! {
                _ = &mut notified => {}
                _ = abort.aborted() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn try_grant(&self, arm: Arm, claim: &LampClaim) -> Grant {
        let mut record = self.record.lock();
        match record.as_mut() {
            None => {
                *record = Some(Holder {
                    arm,
                    claim: claim.clone(),
                    holds: 1,
                });
                Grant::Fresh
            }
            // A holder at zero holds is mid-release and not reusable.
            Some(holder) if holder.arm == arm && holder.claim == *claim && holder.holds > 0 => {
                holder.holds += 1;
                Grant::Reentrant
            }
            Some(holder) => Grant::Busy(holder.arm),
        }
    }

    fn grant(self: &Arc<Self>, arm: Arm, claim: LampClaim) -> LampHandle {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        LampHandle {
            arbiter: Arc::clone(self),
            arm,
            claim,
            released: false,
        }
    }

    async fn abandon_failed_turn_on(&self, arm: Arm, lamps: &LampSet) {
        // The bank may have lit part of the set before failing.
        if let Err(err) = self.lamps.turn_off(lamps).await {
            warn!(%arm, lamps = %lamps, error = %format!("{err:#}"), "Lamp off after failed lamp on also failed");
        }
        self.clear_record(arm);
    }

    async fn release(&self, arm: Arm, claim: &LampClaim) {
        let last = {
            let mut record = self.record.lock();
            match record.as_mut() {
                Some(holder) if holder.arm == arm && holder.claim == *claim && holder.holds > 0 => {
                    holder.holds -= 1;
                    holder.holds == 0
                }
                _ => {
                    error!(%arm, ?claim, "Lamp release without a matching holder");
                    return;
                }
            }
        };

        if last {
            if let LampClaim::Lamp(set) = claim {
                match self.lamps.turn_off(set).await {
                    Ok(()) => info!(%arm, lamps = %set, "Lamps off"),
                    Err(err) => warn!(%arm, lamps = %set, error = %format!("{err:#}"), "Lamp off failed"),
                }
            }
            let mut record = self.record.lock();
            if record.as_ref().is_some_and(|h| h.arm == arm && h.holds == 0) {
                *record = None;
            }
        }
        self.released.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn clear_record(&self, arm: Arm) {
        let mut record = self.record.lock();
        if record.as_ref().is_some_and(|h| h.arm == arm) {
            *record = None;
        }
        drop(record);
        self.changed.notify_waiters();
    }

    fn release_record_only(&self, arm: Arm) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.clear_record(arm);
    }

    /// Current holder, for status reports.
    pub fn holder(&self) -> Option<LampStatus> {
        self.record.lock().as_ref().map(|h| LampStatus {
            arm: h.arm,
            lamps: match &h.claim {
                LampClaim::NoLamp => Vec::new(),
                LampClaim::Lamp(set) => set.names().to_vec(),
            },
        })
    }

    /// `(acquires, releases)` since creation.
    pub fn counts(&self) -> (usize, usize) {
        (
            self.acquired.load(Ordering::SeqCst),
            self.released.load(Ordering::SeqCst),
        )
    }
}

/// Fresh lamp grant whose lamps are still switching on. If the acquiring
/// future is dropped before `turn_on` resolves, the record is handed back.
struct PendingTurnOn<'a> {
    arbiter: &'a Arc<LampArbiter>,
    arm: Arm,
    lamps: &'a LampSet,
    armed: bool,
}

impl PendingTurnOn<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingTurnOn<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let arbiter = Arc::clone(self.arbiter);
        let arm = self.arm;
        let lamps = self.lamps.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(%arm, lamps = %lamps, "Lamp request dropped while switching on; switching off in background");
                runtime.spawn(async move { arbiter.abandon_failed_turn_on(arm, &lamps).await });
            }
            Err(_) => {
                error!(%arm, lamps = %lamps, "Lamp request dropped outside the runtime; lamps may still be lit");
                arbiter.clear_record(arm);
            }
        }
    }
}

/// A granted lamp claim. Release it with [`release`](Self::release).
pub struct LampHandle {
    arbiter: Arc<LampArbiter>,
    arm: Arm,
    claim: LampClaim,
    released: bool,
}

impl LampHandle {
    /// What this handle holds.
    pub fn claim(&self) -> &LampClaim {
        &self.claim
    }

    /// Switch lamps off (if lit) and give up the claim.
    pub async fn release(mut self) {
        self.released = true;
        self.arbiter.release(self.arm, &self.claim).await;
    }
}

impl Drop for LampHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let arbiter = Arc::clone(&self.arbiter);
        let arm = self.arm;
        let claim = self.claim.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(%arm, ?claim, "Lamp handle dropped without release; releasing in background");
                runtime.spawn(async move { arbiter.release(arm, &claim).await });
            }
            Err(_) => {
                error!(%arm, ?claim, "Lamp handle dropped outside the runtime; lamps may still be lit");
                arbiter.release_record_only(arm);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{Fault, MockRig};
    use tracing_test::traced_test;

    fn arbiter(rig: &MockRig) -> Arc<LampArbiter> {
        Arc::new(LampArbiter::new(rig.hardware().lamps, Duration::from_millis(100)))
    }

    fn lamps(spec: &str) -> LampSet {
        LampSet::parse(spec).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_lamp_on_and_off() {
        let rig = MockRig::default();
        let arbiter = arbiter(&rig);
        let token = AbortToken::new();

        let handle = arbiter.acquire_lamp(Arm::Red, lamps("W"), &token).await.unwrap();
        assert_eq!(rig.lit_lamps(), vec!["W".to_string()]);
        assert_eq!(arbiter.holder().unwrap().arm, Arm::Red);

        handle.release().await;
        assert!(rig.lit_lamps().is_empty());
        assert!(arbiter.holder().is_none());
        assert_eq!(arbiter.counts(), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_arm_same_lamp_is_reentrant() {
        let rig = MockRig::default();
        let arbiter = arbiter(&rig);
        let token = AbortToken::new();

        let first = arbiter.acquire_lamp(Arm::Blue, lamps("Xe"), &token).await.unwrap();
        let second = arbiter.acquire_lamp(Arm::Blue, lamps("Xe"), &token).await.unwrap();
        first.release().await;
        assert_eq!(rig.lit_lamps(), vec!["Xe".to_string()]);
        second.release().await;
        assert!(rig.lit_lamps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_lamp_is_exclusive_across_arms() {
        let rig = MockRig::default();
        let arbiter = arbiter(&rig);
        let token = AbortToken::new();

        let red = arbiter.acquire_no_lamp(Arm::Red, &token).await.unwrap();
        let waiter = {
            let arbiter = arbiter.clone();
            let token = token.clone();
            tokio::spawn(async move { arbiter.acquire_no_lamp(Arm::Blue, &token).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        red.release().await;
        let blue = waiter.await.unwrap().unwrap();
        assert_eq!(arbiter.holder().unwrap().arm, Arm::Blue);
        blue.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_waiting() {
        let rig = MockRig::default();
        let arbiter = arbiter(&rig);
        let held = arbiter.acquire_no_lamp(Arm::Red, &AbortToken::new()).await.unwrap();

        let token = AbortToken::new();
        let waiter = {
            let arbiter = arbiter.clone();
            let token = token.clone();
            tokio::spawn(async move { arbiter.acquire_lamp(Arm::Blue, lamps("W"), &token).await })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        token.abort("operator");
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CommandError::Aborted { .. })));
        assert!(rig.lit_lamps().is_empty());
        held.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lamp_on_clears_record() {
        let rig = MockRig::default();
        let arbiter = arbiter(&rig);
        rig.inject(Fault::LampOn);

        let result = arbiter.acquire_lamp(Arm::Red, lamps("W"), &AbortToken::new()).await;
        assert!(matches!(result, Err(CommandError::Hardware { offset: LAMP_ON_OFFSET, .. })));
        assert!(arbiter.holder().is_none());
        assert_eq!(arbiter.counts(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_dropped_handle_releases_in_background() {
        let rig = MockRig::default();
        let arbiter = arbiter(&rig);
        {
            let _handle = arbiter.acquire_lamp(Arm::Red, lamps("W"), &AbortToken::new()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rig.lit_lamps().is_empty());
        assert!(arbiter.holder().is_none());
        assert_eq!(arbiter.counts(), (1, 1));
        assert!(logs_contain("dropped without release"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lamp_off_still_clears_record() {
        let rig = MockRig::default();
        let arbiter = arbiter(&rig);
        let handle = arbiter.acquire_lamp(Arm::Red, lamps("W"), &AbortToken::new()).await.unwrap();
        rig.inject(Fault::LampOff);
        handle.release().await;
        assert!(arbiter.holder().is_none());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_request_dropped_while_switching_on_frees_bank() {
        let rig = MockRig::default();
        let arbiter = arbiter(&rig);
        let token = AbortToken::new();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), arbiter.acquire_lamp(Arm::Red, lamps("Xe"), &token)).await;
        assert!(timed_out.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(arbiter.holder().is_none());
        assert!(rig.lit_lamps().is_empty());
        assert_eq!(arbiter.counts(), (0, 0));
        assert!(logs_contain("dropped while switching on"));

        let blue = arbiter.acquire_lamp(Arm::Blue, lamps("W"), &token).await.unwrap();
        blue.release().await;
    }
}
