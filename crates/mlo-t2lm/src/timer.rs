//! One-shot mapping timer.
//!
//! A single timer per connection serves both the mapping-switch and the
//! expected-duration purpose. It is always used under the owning context's
//! lock. Each arm bumps a generation number; an expiry whose generation no
//! longer matches is stale and must be ignored, so nothing fires after
//! [`T2lmTimer::stop`] returns.

use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{Result, T2lmError};
use crate::types::{LinkMappingInfo, WLAN_MAX_T2LM_IE};

/// Externally visible timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TimerState {
    /// A one-shot is pending.
    pub armed: bool,
    /// Delay of the pending one-shot, 0 when idle.
    pub interval_ms: u32,
    /// Store slot the pending one-shot refers to.
    pub active_slot_index: usize,
}

/// Delay for a timer armed on `slot`.
///
/// The slot's switch time (ms) wins when present; otherwise the interval is
/// counted in beacon intervals.
pub fn effective_delay_ms(slot: &LinkMappingInfo, interval: u32, beacon_interval_tu: u16) -> u32 {
    match slot.mapping_switch_time {
        Some(switch_time) => switch_time as u32,
        None => interval
            .saturating_mul(beacon_interval_tu as u32)
            .saturating_mul(1000),
    }
}

/// Per-connection one-shot timer.
#[derive(Debug, Default)]
pub struct T2lmTimer {
    state: TimerState,
    generation: u64,
    task: Option<JoinHandle<()>>,
    released: bool,
}

impl T2lmTimer {
    /// Creates an idle timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> TimerState {
        self.state
    }

    /// Returns true if a one-shot is pending.
    pub fn is_armed(&self) -> bool {
        self.state.armed
    }

    /// Returns true once [`T2lmTimer::deinit`] ran.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Arms the timer for `slot_index`, replacing any pending one-shot.
    ///
    /// `on_expire` runs on `handle` after `delay_ms` and receives the
    /// generation to pass to [`T2lmTimer::claim_expiry`].
    pub fn start<F>(
        &mut self,
        handle: &Handle,
        interval: u32,
        slot_index: usize,
        delay_ms: u32,
        on_expire: F,
    ) -> Result<u64>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        if self.released {
            return Err(T2lmError::TimerReleased);
        }
        if interval == 0 {
            return Err(T2lmError::ZeroInterval);
        }
        if slot_index >= WLAN_MAX_T2LM_IE {
            return Err(T2lmError::InvalidSlotIndex(slot_index));
        }

        self.cancel();
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        self.state = TimerState {
            armed: true,
            interval_ms: delay_ms,
            active_slot_index: slot_index,
        };

        self.task = Some(handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            on_expire(generation);
        }));

        debug!(slot = slot_index, interval_ms = delay_ms, generation, "Armed T2LM timer");
        Ok(generation)
    }

    /// Takes ownership of an expiry.
    ///
    /// Returns the slot index the timer was armed for, or `None` if the
    /// expiry is stale (timer stopped, re-armed or released since).
    pub fn claim_expiry(&mut self, generation: u64) -> Option<usize> {
        if self.released || !self.state.armed || generation != self.generation {
            trace!(generation, current = self.generation, "Ignoring stale T2LM expiry");
            return None;
        }
        self.task = None;
        self.state.armed = false;
        self.state.interval_ms = 0;
        Some(self.state.active_slot_index)
    }

    /// Stops a pending one-shot. Returns whether one was armed.
    pub fn stop(&mut self) -> bool {
        let was_armed = self.state.armed;
        self.cancel();
        self.generation = self.generation.wrapping_add(1);
        self.state.armed = false;
        self.state.interval_ms = 0;
        if was_armed {
            debug!("Stopped T2LM timer");
        }
        was_armed
    }

    /// Stops the timer for good; later arms fail with `TimerReleased`.
    pub fn deinit(&mut self) -> bool {
        let was_armed = self.stop();
        self.released = true;
        was_armed
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for T2lmTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, ExpectedDuration};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_effective_delay_prefers_switch_time() {
        let mut info = LinkMappingInfo::default_bidi();
        info.mapping_switch_time = Some(204);
        info.expected_duration = Some(ExpectedDuration::new(10));
        assert_eq!(effective_delay_ms(&info, 5, 100), 204);
    }

    #[test]
    fn test_effective_delay_beacon_intervals() {
        let info = LinkMappingInfo::with_link_map(Direction::Dl, Default::default());
        assert_eq!(effective_delay_ms(&info, 3, 100), 300_000);
        assert_eq!(effective_delay_ms(&info, u32::MAX, 100), u32::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_expire() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut timer = T2lmTimer::new();
        let observed = fired.clone();
        let generation = timer
            .start(&Handle::current(), 1, 1, 50, move |generation| {
                observed.store(generation, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(
            timer.state(),
            TimerState {
                armed: true,
                interval_ms: 50,
                active_slot_index: 1,
            }
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), generation);
        assert_eq!(timer.claim_expiry(generation), Some(1));
        assert!(!timer.is_armed());
        assert_eq!(timer.claim_expiry(generation), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let mut timer = T2lmTimer::new();
        let generation = timer
            .start(&Handle::current(), 1, 0, 100, |_| {})
            .unwrap();

        assert!(timer.stop());
        assert!(!timer.stop());
        assert_eq!(timer.state().interval_ms, 0);
        assert_eq!(timer.claim_expiry(generation), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_timer_never_fires() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut timer = T2lmTimer::new();
        let observed = fired.clone();
        timer
            .start(&Handle::current(), 1, 0, 10, move |_| {
                observed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        timer.stop();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_errors() {
        let mut timer = T2lmTimer::new();
        let handle = Handle::current();
        assert!(matches!(
            timer.start(&handle, 0, 0, 10, |_| {}),
            Err(T2lmError::ZeroInterval)
        ));
        assert!(matches!(
            timer.start(&handle, 1, 2, 10, |_| {}),
            Err(T2lmError::InvalidSlotIndex(2))
        ));
        assert!(!timer.is_armed());

        timer.deinit();
        assert!(timer.is_released());
        assert!(matches!(
            timer.start(&handle, 1, 0, 10, |_| {}),
            Err(T2lmError::TimerReleased)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_invalidates_previous() {
        let mut timer = T2lmTimer::new();
        let handle = Handle::current();
        let first = timer.start(&handle, 1, 0, 10, |_| {}).unwrap();
        let second = timer.start(&handle, 1, 1, 20, |_| {}).unwrap();
        assert_ne!(first, second);
        assert_eq!(timer.claim_expiry(first), None);
        assert_eq!(timer.claim_expiry(second), Some(1));
    }
}
