//! Per-connection T2LM state machine.
//!
//! A [`MappingContext`] owns the mapping store, the one-shot timer and the
//! link update handlers of one MLO connection, all behind a single lock.
//! Firmware commands and handler notifications are collected while the lock
//! is held and issued after it is released. Each batch is stamped with a
//! sequence number under the lock; delivery is serialized and a batch older
//! than one already delivered is dropped, so firmware and handlers always end
//! on the latest state.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::T2lmConfig;
use crate::error::{Result, T2lmError};
use crate::negotiation::{
    build_action_frame, parse_action_frame, parse_beacon_mappings, NegotiationContext,
};
use crate::notifier::{HandlerRegistry, LinkUpdate, LinkUpdateHandler};
use crate::store::{ExpiryKind, IngestOutcome, MappingStore};
use crate::timer::{effective_delay_ms, T2lmTimer, TimerState};
use crate::types::{FirmwareEvent, LinkMappingInfo, T2lmCategory, TimerEventStatus};

/// Services the T2LM state machine consumes from the rest of the driver.
pub trait T2lmCallbacks: Send + Sync {
    /// Sends a mapping to firmware on one vdev.
    fn send_mapping(&self, vdev_id: u8, info: &LinkMappingInfo) -> std::result::Result<(), String>;

    /// Returns every vdev of the MLD `vdev_id` belongs to.
    fn ml_vdev_ids(&self, vdev_id: u8) -> Vec<u8>;

    /// Beacon interval of the connection in TU, if known.
    fn beacon_interval(&self, vdev_id: u8) -> Option<u16>;

    /// Returns true if the connection manager reports the vdev connected.
    fn is_connected(&self, vdev_id: u8) -> bool;
}

/// T2LM statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct T2lmStats {
    /// Beacons/probe responses carrying at least one T2LM element.
    pub beacons_processed: u64,
    /// Advertised mappings stored in a new slot.
    pub mappings_appended: u64,
    /// Advertised mappings that refreshed an existing slot.
    pub mappings_updated: u64,
    /// DL/UL and BIDI seen together.
    pub direction_conflicts: u64,
    /// One-shot timers armed.
    pub timers_armed: u64,
    /// Mapping switch expiries handled (timer or firmware).
    pub switch_expiries: u64,
    /// Expected duration expiries handled (timer or firmware).
    pub duration_expiries: u64,
    /// Per-vdev mapping commands accepted by firmware.
    pub mappings_sent: u64,
    /// Per-vdev mapping commands that failed.
    pub send_failures: u64,
    /// Link update notifications delivered.
    pub link_updates: u64,
    /// Teardowns handled.
    pub teardowns: u64,
    /// Timers that could not be armed.
    pub timer_failures: u64,
    /// Superseded commands or notifications dropped before delivery.
    pub stale_effects: u64,
}

struct Inner {
    store: MappingStore,
    timer: T2lmTimer,
    handlers: HandlerRegistry,
    stats: T2lmStats,
    sequence: u64,
}

impl Inner {
    /// Starts a batch of deferred work, ordered after every earlier one.
    fn effects(&mut self) -> Effects {
        self.sequence += 1;
        Effects {
            sequence: self.sequence,
            send: None,
            update: None,
        }
    }
}

/// Work deferred until the lock is released.
struct Effects {
    sequence: u64,
    send: Option<LinkMappingInfo>,
    update: Option<LinkUpdate>,
}

/// Sequence numbers of the last command and notification delivered.
#[derive(Default)]
struct Delivered {
    send: Cell<u64>,
    update: Cell<u64>,
}

struct Shared {
    vdev_id: u8,
    config: T2lmConfig,
    callbacks: Arc<dyn T2lmCallbacks>,
    runtime: Handle,
    inner: Mutex<Inner>,
    // Reentrant so a handler or firmware callback may call back into the
    // context from the delivering thread.
    delivery: ReentrantMutex<Delivered>,
}

/// T2LM state of one MLO connection.
#[derive(Clone)]
pub struct MappingContext {
    shared: Arc<Shared>,
}

impl fmt::Debug for MappingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("MappingContext")
            .field("vdev_id", &self.shared.vdev_id)
            .field("slots", &inner.store.len())
            .field("timer", &inner.timer.state())
            .field("handlers", &inner.handlers)
            .field("stats", &inner.stats)
            .finish()
    }
}

impl MappingContext {
    /// Creates the context of the connection on `vdev_id`.
    ///
    /// Timers run on `runtime`.
    pub fn new(
        vdev_id: u8,
        config: T2lmConfig,
        callbacks: Arc<dyn T2lmCallbacks>,
        runtime: Handle,
    ) -> Self {
        let handlers = HandlerRegistry::with_capacity(config.notifier.max_handlers);
        Self {
            shared: Arc::new(Shared {
                vdev_id,
                config,
                callbacks,
                runtime,
                inner: Mutex::new(Inner {
                    store: MappingStore::new(),
                    timer: T2lmTimer::new(),
                    handlers,
                    stats: T2lmStats::default(),
                    sequence: 0,
                }),
                delivery: ReentrantMutex::new(Delivered::default()),
            }),
        }
    }

    /// Vdev the connection was created on.
    pub fn vdev_id(&self) -> u8 {
        self.shared.vdev_id
    }

    /// Configuration in use.
    pub fn config(&self) -> &T2lmConfig {
        &self.shared.config
    }

    /// Copy of the mapping store.
    pub fn store_snapshot(&self) -> MappingStore {
        self.shared.inner.lock().store.clone()
    }

    /// Current timer state.
    pub fn timer_state(&self) -> TimerState {
        self.shared.inner.lock().timer.state()
    }

    /// Copy of the statistics.
    pub fn stats(&self) -> T2lmStats {
        self.shared.inner.lock().stats.clone()
    }

    /// Merges the T2LM elements of a beacon or probe response.
    ///
    /// Parse errors leave the store untouched. Once merged, the first slot
    /// carrying a switch time or an expected duration is dispatched, but
    /// only while the connection is up (unless configured otherwise). A
    /// timer that cannot be armed is logged and counted; whatever the
    /// dispatch already decided is still carried out.
    #[instrument(skip(self, ies), fields(vdev_id = self.shared.vdev_id))]
    pub fn process_beacon_ies(&self, ies: &[u8], tsf: u64) -> Result<()> {
        let received = parse_beacon_mappings(ies)?;
        if received.is_empty() {
            return Ok(());
        }

        let shared = &self.shared;
        let connected = !shared.config.beacon.arm_only_when_connected
            || shared.callbacks.is_connected(shared.vdev_id);
        let beacon_interval = shared.beacon_interval_tu();

        let effects = {
            let mut inner = shared.inner.lock();
            inner.stats.beacons_processed += 1;

            for slot in &received {
                match inner.store.ingest_beacon_mapping(&slot.info, tsf, slot.ie_len) {
                    Ok(IngestOutcome::Appended(_)) => inner.stats.mappings_appended += 1,
                    Ok(IngestOutcome::Updated(_)) => inner.stats.mappings_updated += 1,
                    Ok(IngestOutcome::Dropped) => {}
                    Err(e) => {
                        inner.stats.direction_conflicts += 1;
                        return Err(e);
                    }
                }
            }

            if !connected {
                debug!("Not connected, T2LM timer not started");
                return Ok(());
            }

            let mut effects = inner.effects();
            let pending = inner.store.slots().position(|slot| {
                slot.info.mapping_switch_time_present() || slot.info.expected_duration_present()
            });
            if let Some(slot_index) = pending {
                if let Err(e) =
                    shared.dispatch_locked(&mut inner, slot_index, beacon_interval, &mut effects)
                {
                    warn!(error = %e, slot = slot_index, "Failed to dispatch advertised T2LM");
                }
            }
            effects
        };

        shared.apply(effects);
        Ok(())
    }

    /// Handles a timer notification from firmware.
    ///
    /// An expiry reported by firmware replaces any pending host timer, which
    /// was armed for the table as it was before the promotion.
    #[instrument(skip(self), fields(vdev_id = self.shared.vdev_id))]
    pub fn handle_timer_event(&self, event: &FirmwareEvent) -> Result<()> {
        let shared = &self.shared;
        let effects = {
            let mut inner = shared.inner.lock();
            let mut effects = inner.effects();
            match event.status {
                TimerEventStatus::TsfUpdate => {
                    let updated = inner.store.update_switch_tsf(event.mapping_switch_tsf);
                    debug!(
                        updated,
                        mapping_switch_tsf = event.mapping_switch_tsf,
                        "Updated mapping switch time"
                    );
                }
                TimerEventStatus::SwitchExpired => {
                    inner.timer.stop();
                    inner.store.promote_or_reset(0, ExpiryKind::MappingSwitch)?;
                    inner.stats.switch_expiries += 1;
                    effects.update = Shared::prepare_update(&mut inner);
                }
                TimerEventStatus::DurationExpired => {
                    inner.timer.stop();
                    inner.store.promote_or_reset(0, ExpiryKind::ExpectedDuration)?;
                    inner.stats.duration_expiries += 1;
                    effects.update = Shared::prepare_update(&mut inner);
                }
            }
            effects
        };
        shared.apply(effects);
        Ok(())
    }

    /// Arms the mapping timer for `slot_index`.
    pub fn arm_timer(&self, interval: u32, slot_index: usize) -> Result<()> {
        let shared = &self.shared;
        let beacon_interval = shared.beacon_interval_tu();
        let mut inner = shared.inner.lock();
        shared.arm_locked(&mut inner, interval, slot_index, beacon_interval)
    }

    /// Stops the mapping timer. Returns whether it was armed.
    pub fn stop_timer(&self) -> bool {
        self.shared.inner.lock().timer.stop()
    }

    /// Stops and releases the timer; the context can no longer arm it.
    pub fn deinit(&self) {
        if self.shared.inner.lock().timer.deinit() {
            debug!(vdev_id = self.shared.vdev_id, "Stopped armed T2LM timer on deinit");
        }
    }

    /// Acts on a slot after a frame updated the store.
    ///
    /// A slot with neither a switch time nor an expected duration is sent to
    /// firmware right away. A switch time arms the timer, or is applied at
    /// once if it is already due. An expected duration alone sends the
    /// mapping and arms the timer unless the duration never expires.
    pub fn dispatch_after_frame(&self, slot_index: usize) -> Result<()> {
        let shared = &self.shared;
        let beacon_interval = shared.beacon_interval_tu();
        let effects = {
            let mut inner = shared.inner.lock();
            let mut effects = inner.effects();
            shared.dispatch_locked(&mut inner, slot_index, beacon_interval, &mut effects)?;
            effects
        };
        shared.apply(effects);
        Ok(())
    }

    /// Drops any negotiated mapping and goes back to the default mapping.
    pub fn handle_teardown(&self) {
        let shared = &self.shared;
        let effects = {
            let mut inner = shared.inner.lock();
            let mut effects = inner.effects();
            inner.timer.stop();
            inner.store.reset_to_default();
            inner.stats.teardowns += 1;
            effects.update = Shared::prepare_update(&mut inner);
            effects
        };
        info!(vdev_id = shared.vdev_id, "T2LM teardown, using default link mapping");
        shared.apply(effects);
    }

    /// Decodes a received T2LM action frame. A teardown is applied to the
    /// connection.
    pub fn process_action_frame(&self, frame: &[u8]) -> Result<NegotiationContext> {
        let ctx = parse_action_frame(frame)?;
        if ctx.category == T2lmCategory::Teardown {
            self.handle_teardown();
        }
        Ok(ctx)
    }

    /// Builds a request frame carrying the established mapping, or the
    /// default mapping if none is held.
    pub fn build_request_frame(&self, dialog_token: u8) -> Result<Vec<u8>> {
        let established = self
            .shared
            .inner
            .lock()
            .store
            .established()
            .copied()
            .unwrap_or_else(LinkMappingInfo::default_bidi);

        let mut ctx = NegotiationContext::new(T2lmCategory::Request, dialog_token);
        let mut info = established;
        info.mapping_switch_time = None;
        ctx.set_mapping(info);
        build_action_frame(&ctx)
    }

    /// Registers a link update handler and returns its index.
    pub fn register_link_update_handler(&self, handler: LinkUpdateHandler) -> Result<usize> {
        self.shared.inner.lock().handlers.register(handler)
    }

    /// Unregisters the handler at `index`.
    pub fn unregister_link_update_handler(&self, index: usize) -> Result<()> {
        self.shared.inner.lock().handlers.unregister(index)
    }

    #[cfg(test)]
    fn insert_slots(&self, slots: impl IntoIterator<Item = crate::store::T2lmSlot>) {
        self.shared.inner.lock().store = MappingStore::with_slots(slots).unwrap();
    }
}

impl Shared {
    fn beacon_interval_tu(&self) -> u16 {
        self.callbacks
            .beacon_interval(self.vdev_id)
            .filter(|tu| *tu > 0)
            .unwrap_or(self.config.timer.default_beacon_interval_tu)
    }

    fn prepare_update(inner: &mut Inner) -> Option<LinkUpdate> {
        let update = inner.handlers.prepare(&inner.store);
        if update.is_some() {
            inner.stats.link_updates += 1;
        }
        update
    }

    fn arm_locked(
        self: &Arc<Self>,
        inner: &mut Inner,
        interval: u32,
        slot_index: usize,
        beacon_interval_tu: u16,
    ) -> Result<()> {
        let slot = inner
            .store
            .slot(slot_index)
            .map(|slot| slot.info)
            .unwrap_or_default();
        let delay_ms = effective_delay_ms(&slot, interval, beacon_interval_tu);

        let weak: Weak<Shared> = Arc::downgrade(self);
        inner
            .timer
            .start(&self.runtime, interval, slot_index, delay_ms, move |generation| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_timer_expired(generation);
                }
            })?;
        inner.stats.timers_armed += 1;
        Ok(())
    }

    /// Arms the timer, logging and counting a failure instead of returning
    /// it.
    fn try_arm_locked(
        self: &Arc<Self>,
        inner: &mut Inner,
        interval: u32,
        slot_index: usize,
        beacon_interval_tu: u16,
    ) {
        if let Err(e) = self.arm_locked(inner, interval, slot_index, beacon_interval_tu) {
            warn!(error = %e, slot = slot_index, interval, "Failed to arm T2LM timer");
            inner.stats.timer_failures += 1;
        }
    }

    fn dispatch_locked(
        self: &Arc<Self>,
        inner: &mut Inner,
        slot_index: usize,
        beacon_interval_tu: u16,
        effects: &mut Effects,
    ) -> Result<()> {
        if inner.store.is_empty() {
            debug!("No T2LM present");
            return Ok(());
        }
        let info = inner
            .store
            .slot(slot_index)
            .map(|slot| slot.info)
            .ok_or(T2lmError::InvalidSlotIndex(slot_index))?;

        match (info.mapping_switch_time, info.expected_duration) {
            (None, None) => effects.send = Some(info),
            (Some(0), _) => {
                debug!(slot = slot_index, "Mapping switch time already due");
                inner.timer.stop();
                self.expire_locked(inner, slot_index, beacon_interval_tu, effects);
            }
            (Some(switch_time), _) => {
                self.try_arm_locked(inner, switch_time as u32, slot_index, beacon_interval_tu);
            }
            (None, Some(duration)) => {
                effects.send = Some(info);
                if !duration.is_never_expires() {
                    self.try_arm_locked(inner, duration.value(), slot_index, beacon_interval_tu);
                }
            }
        }
        Ok(())
    }

    fn on_timer_expired(self: &Arc<Self>, generation: u64) {
        let beacon_interval = self.beacon_interval_tu();
        let effects = {
            let mut inner = self.inner.lock();
            let Some(slot_index) = inner.timer.claim_expiry(generation) else {
                return;
            };
            let mut effects = inner.effects();
            self.expire_locked(&mut inner, slot_index, beacon_interval, &mut effects);
            effects
        };
        self.apply(effects);
    }

    /// Applies the expiry of the timer armed on `slot_index`.
    fn expire_locked(
        self: &Arc<Self>,
        inner: &mut Inner,
        slot_index: usize,
        beacon_interval_tu: u16,
        effects: &mut Effects,
    ) {
        let Some(info) = inner.store.slot(slot_index).map(|slot| slot.info) else {
            debug!(slot = slot_index, "T2LM timer expired on an empty slot");
            return;
        };

        if info.mapping_switch_time_present() {
            if let Err(e) = inner.store.promote_or_reset(slot_index, ExpiryKind::MappingSwitch) {
                warn!(error = %e, "Failed to apply mapping switch");
                return;
            }
            effects.send = Some(info);
            inner.stats.switch_expiries += 1;
            effects.update = Self::prepare_update(inner);

            let next_duration = inner
                .store
                .established()
                .and_then(|established| established.expected_duration)
                .filter(|duration| !duration.is_never_expires());
            if let Some(duration) = next_duration {
                self.try_arm_locked(inner, duration.value(), 0, beacon_interval_tu);
            }
        } else if slot_index == 0 {
            if let Err(e) = inner.store.promote_or_reset(0, ExpiryKind::ExpectedDuration) {
                warn!(error = %e, "Failed to apply duration expiry");
                return;
            }
            inner.stats.duration_expiries += 1;
            effects.update = Self::prepare_update(inner);
            if let Err(e) = self.dispatch_locked(inner, 0, beacon_interval_tu, effects) {
                warn!(error = %e, "Failed to dispatch T2LM after duration expiry");
            }
        }
    }

    /// Carries out deferred work unless newer work was already delivered.
    fn apply(&self, effects: Effects) {
        let delivered = self.delivery.lock();
        let mut stale = 0;

        if let Some(info) = effects.send {
            if effects.sequence > delivered.send.get() {
                delivered.send.set(effects.sequence);
                self.send_to_all_links(&info);
            } else {
                debug!(sequence = effects.sequence, "Dropping superseded T2LM command");
                stale += 1;
            }
        }
        if let Some(update) = effects.update {
            if effects.sequence > delivered.update.get() {
                delivered.update.set(effects.sequence);
                update.deliver(self.vdev_id);
            } else {
                debug!(sequence = effects.sequence, "Dropping superseded link update");
                stale += 1;
            }
        }

        if stale > 0 {
            self.inner.lock().stats.stale_effects += stale;
        }
    }

    /// Sends to every link of the MLD. Failures are logged, not retried.
    fn send_to_all_links(&self, info: &LinkMappingInfo) {
        let vdev_ids = self.callbacks.ml_vdev_ids(self.vdev_id);
        if vdev_ids.is_empty() {
            error!(vdev_id = self.vdev_id, "Number of vdevs under MLD is reported as 0");
            self.inner.lock().stats.send_failures += 1;
            return;
        }

        let (mut sent, mut failed) = (0, 0);
        for vdev_id in vdev_ids {
            match self.callbacks.send_mapping(vdev_id, info) {
                Ok(()) => sent += 1,
                Err(e) => {
                    error!(vdev_id, error = %e, "Failed to send T2LM command to firmware");
                    failed += 1;
                }
            }
        }

        let mut inner = self.inner.lock();
        inner.stats.mappings_sent += sent;
        inner.stats.send_failures += failed;
    }
}

/// Maps vdev ids to the MLO connection they belong to.
///
/// All links of one MLD share the same context.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<u8, Arc<MappingContext>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `context` under every vdev in `vdev_ids`.
    pub fn insert(&self, vdev_ids: &[u8], context: Arc<MappingContext>) {
        let mut connections = self.connections.write();
        for vdev_id in vdev_ids {
            connections.insert(*vdev_id, context.clone());
        }
    }

    /// Connection of `vdev_id`.
    pub fn get(&self, vdev_id: u8) -> Option<Arc<MappingContext>> {
        self.connections.read().get(&vdev_id).cloned()
    }

    /// Number of registered vdevs.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns true if no vdev is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Unregisters `vdev_id`. The context is deinitialized once no other
    /// vdev refers to it.
    pub fn remove(&self, vdev_id: u8) -> Option<Arc<MappingContext>> {
        let mut connections = self.connections.write();
        let context = connections.remove(&vdev_id)?;
        let shared = connections
            .values()
            .any(|other| Arc::ptr_eq(other, &context));
        if !shared {
            context.deinit();
        }
        Some(context)
    }

    /// Routes a firmware timer event to the connection of its vdev.
    pub fn handle_tid_to_link_map_event(&self, event: &FirmwareEvent) -> Result<()> {
        let context = self
            .get(event.vdev_id)
            .ok_or(T2lmError::UnknownConnection(event.vdev_id))?;
        context.handle_timer_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ie::build_info;
    use crate::store::T2lmSlot;
    use crate::types::{Direction, ExpectedDuration};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use wlan_types::{LinkBitmap, Tid};

    struct TestCallbacks {
        sent: StdMutex<Vec<(u8, LinkMappingInfo)>>,
        links: Vec<u8>,
        connected: bool,
        fail_vdev: Option<u8>,
    }

    impl TestCallbacks {
        fn new() -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
                links: vec![0, 1],
                connected: true,
                fail_vdev: None,
            }
        }

        fn disconnected() -> Self {
            Self {
                connected: false,
                ..Self::new()
            }
        }

        fn sent(&self) -> Vec<(u8, LinkMappingInfo)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl T2lmCallbacks for TestCallbacks {
        fn send_mapping(
            &self,
            vdev_id: u8,
            info: &LinkMappingInfo,
        ) -> std::result::Result<(), String> {
            if self.fail_vdev == Some(vdev_id) {
                return Err("WMI send failed".to_string());
            }
            self.sent.lock().unwrap().push((vdev_id, *info));
            Ok(())
        }

        fn ml_vdev_ids(&self, _vdev_id: u8) -> Vec<u8> {
            self.links.clone()
        }

        fn beacon_interval(&self, _vdev_id: u8) -> Option<u16> {
            Some(100)
        }

        fn is_connected(&self, _vdev_id: u8) -> bool {
            self.connected
        }
    }

    fn mapping(tid0_links: u16) -> LinkMappingInfo {
        let mut info = LinkMappingInfo::with_link_map(Direction::Bidi, Default::default());
        info.set_links(Tid::new(0).unwrap(), LinkBitmap::new(tid0_links));
        info
    }

    fn context(callbacks: &Arc<TestCallbacks>) -> MappingContext {
        MappingContext::new(
            0,
            T2lmConfig::default(),
            callbacks.clone(),
            Handle::current(),
        )
    }

    fn recorder(ctx: &MappingContext) -> Arc<StdMutex<Vec<u16>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = seen.clone();
        ctx.register_link_update_handler(Arc::new(move |_, link_map| {
            log.lock().unwrap().push(link_map[0]);
        }))
        .unwrap();
        seen
    }

    /// TSF whose switch clock is 100.
    const TSF: u64 = 100 << 16;

    #[tokio::test(start_paused = true)]
    async fn test_beacon_switch_time_arms_and_promotes() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);
        let seen = recorder(&ctx);

        let mut pending = mapping(0x6);
        pending.mapping_switch_time = Some(300);
        let mut ies = build_info(&mapping(0x1));
        ies.extend(build_info(&pending));

        ctx.process_beacon_ies(&ies, TSF).unwrap();
        assert_eq!(
            ctx.timer_state(),
            TimerState {
                armed: true,
                interval_ms: 204,
                active_slot_index: 1,
            }
        );
        assert!(callbacks.sent().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;

        let sent = callbacks.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.link_map[0].bits(), 0x6);
        let store = ctx.store_snapshot();
        assert_eq!(store.len(), 1);
        assert_eq!(store.established().unwrap().link_map[0].bits(), 0x6);
        assert_eq!(store.established().unwrap().mapping_switch_time, None);
        assert_eq!(*seen.lock().unwrap(), vec![0x6]);
        assert!(!ctx.timer_state().armed);
        assert_eq!(ctx.stats().switch_expiries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_beacon_ignored_for_timer_when_disconnected() {
        let callbacks = Arc::new(TestCallbacks::disconnected());
        let ctx = context(&callbacks);

        let mut pending = mapping(0x6);
        pending.mapping_switch_time = Some(300);
        ctx.process_beacon_ies(&build_info(&pending), TSF).unwrap();

        assert_eq!(ctx.store_snapshot().len(), 1);
        assert!(!ctx.timer_state().armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_beacon_parse_error_leaves_store() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);
        ctx.process_beacon_ies(&build_info(&mapping(0x1)), TSF).unwrap();

        let result = ctx.process_beacon_ies(&[255, 3, 109, 0x03, 0x00], TSF);
        assert!(matches!(result, Err(T2lmError::InvalidDirection(3))));
        assert_eq!(ctx.store_snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_expiry_resets_to_default() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);
        let seen = recorder(&ctx);

        let mut only = mapping(0x3);
        only.expected_duration = Some(ExpectedDuration::new(2));
        ctx.process_beacon_ies(&build_info(&only), TSF).unwrap();

        // Duration alone: sent right away, timer counts beacon intervals
        assert_eq!(callbacks.sent().len(), 2);
        assert_eq!(ctx.timer_state().interval_ms, 2 * 100 * 1000);

        tokio::time::sleep(Duration::from_secs(201)).await;

        let established = *ctx.store_snapshot().established().unwrap();
        assert_eq!(established, LinkMappingInfo::default_bidi());
        let sent = callbacks.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent[3].1.default_mapping);
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_expiring_duration_not_armed() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);

        let mut only = mapping(0x3);
        only.expected_duration = Some(ExpectedDuration::NEVER_EXPIRES);
        ctx.process_beacon_ies(&build_info(&only), TSF).unwrap();

        assert_eq!(callbacks.sent().len(), 2);
        assert!(!ctx.timer_state().armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_expiry() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);
        let mut pending = mapping(0x6);
        pending.mapping_switch_time = Some(300);
        ctx.process_beacon_ies(&build_info(&pending), TSF).unwrap();

        assert!(ctx.stop_timer());
        assert!(!ctx.stop_timer());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(callbacks.sent().is_empty());
        assert_eq!(
            ctx.store_snapshot().established().unwrap().mapping_switch_time,
            Some(204)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_after_deinit() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);
        ctx.insert_slots([T2lmSlot::from_info(mapping(0x1))]);

        assert!(matches!(ctx.arm_timer(0, 0), Err(T2lmError::ZeroInterval)));
        assert!(matches!(
            ctx.arm_timer(1, 2),
            Err(T2lmError::InvalidSlotIndex(2))
        ));
        ctx.arm_timer(1, 0).unwrap();
        ctx.deinit();
        assert!(!ctx.timer_state().armed);
        assert!(matches!(ctx.arm_timer(1, 0), Err(T2lmError::TimerReleased)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_after_frame() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);

        // Empty store is a no-op
        ctx.dispatch_after_frame(0).unwrap();
        assert!(callbacks.sent().is_empty());

        ctx.insert_slots([T2lmSlot::from_info(mapping(0x1))]);
        ctx.dispatch_after_frame(0).unwrap();
        assert_eq!(callbacks.sent().len(), 2);
        assert!(!ctx.timer_state().armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_is_counted() {
        let callbacks = Arc::new(TestCallbacks {
            fail_vdev: Some(1),
            ..TestCallbacks::new()
        });
        let ctx = context(&callbacks);
        ctx.insert_slots([T2lmSlot::from_info(mapping(0x1))]);
        ctx.dispatch_after_frame(0).unwrap();

        let stats = ctx.stats();
        assert_eq!(stats.mappings_sent, 1);
        assert_eq!(stats.send_failures, 1);
        assert_eq!(ctx.store_snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_firmware_events() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);
        let seen = recorder(&ctx);
        let mut pending = mapping(0x6);
        pending.mapping_switch_time = Some(10);
        ctx.insert_slots([
            T2lmSlot::from_info(mapping(0x1)),
            T2lmSlot::from_info(pending),
        ]);

        ctx.handle_timer_event(&FirmwareEvent {
            vdev_id: 0,
            status: TimerEventStatus::TsfUpdate,
            mapping_switch_tsf: 555,
        })
        .unwrap();
        assert_eq!(
            ctx.store_snapshot().slot(1).unwrap().info.mapping_switch_time,
            Some(555)
        );

        ctx.handle_timer_event(&FirmwareEvent {
            vdev_id: 0,
            status: TimerEventStatus::SwitchExpired,
            mapping_switch_tsf: 0,
        })
        .unwrap();
        assert_eq!(
            ctx.store_snapshot().established().unwrap().link_map[0].bits(),
            0x6
        );

        ctx.handle_timer_event(&FirmwareEvent {
            vdev_id: 0,
            status: TimerEventStatus::DurationExpired,
            mapping_switch_tsf: 0,
        })
        .unwrap();
        assert!(ctx.store_snapshot().established().unwrap().default_mapping);
        assert_eq!(*seen.lock().unwrap(), vec![0x6, 0]);
        // Firmware-driven transitions are not sent back
        assert!(callbacks.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_frame_resets_mapping() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);
        ctx.insert_slots([T2lmSlot::from_info(mapping(0x1))]);

        let parsed = ctx.process_action_frame(&[37, 2]).unwrap();
        assert_eq!(parsed.category, T2lmCategory::Teardown);
        assert_eq!(
            *ctx.store_snapshot().established().unwrap(),
            LinkMappingInfo::default_bidi()
        );
        assert_eq!(ctx.stats().teardowns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_request_frame() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);
        assert_eq!(
            ctx.build_request_frame(7).unwrap(),
            vec![37, 0, 7, 255, 2, 109, 0x06]
        );

        ctx.insert_slots([T2lmSlot::from_info(mapping(0x1))]);
        let frame = ctx.build_request_frame(8).unwrap();
        let parsed = parse_action_frame(&frame).unwrap();
        assert_eq!(parsed.dialog_token, 8);
        assert_eq!(parsed.mapping(Direction::Bidi), Some(&mapping(0x1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_routes_events() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = Arc::new(context(&callbacks));
        ctx.insert_slots([T2lmSlot::from_info(mapping(0x1))]);

        let registry = ConnectionRegistry::new();
        registry.insert(&[0, 1], ctx.clone());
        assert_eq!(registry.len(), 2);

        registry
            .handle_tid_to_link_map_event(&FirmwareEvent {
                vdev_id: 1,
                status: TimerEventStatus::DurationExpired,
                mapping_switch_tsf: 0,
            })
            .unwrap();
        assert!(ctx.store_snapshot().established().unwrap().default_mapping);

        assert!(matches!(
            registry.handle_tid_to_link_map_event(&FirmwareEvent {
                vdev_id: 9,
                status: TimerEventStatus::SwitchExpired,
                mapping_switch_tsf: 0,
            }),
            Err(T2lmError::UnknownConnection(9))
        ));

        // Still referenced by vdev 1
        registry.remove(0).unwrap();
        ctx.arm_timer(1, 0).unwrap();
        registry.remove(1).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(ctx.arm_timer(1, 0), Err(T2lmError::TimerReleased)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_is_still_sent() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);

        let mut only = mapping(0x3);
        only.expected_duration = Some(ExpectedDuration::new(0));
        ctx.process_beacon_ies(&build_info(&only), TSF).unwrap();

        let sent = callbacks.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.link_map[0].bits(), 0x3);
        assert!(!ctx.timer_state().armed);
        assert_eq!(ctx.stats().timer_failures, 1);
        assert_eq!(ctx.store_snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_switch_time_applied_at_once() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);
        let seen = recorder(&ctx);

        // Switch time 0 against clock 1023 converts to 0 ms
        let mut pending = mapping(0x6);
        pending.mapping_switch_time = Some(0);
        let mut ies = build_info(&mapping(0x1));
        ies.extend(build_info(&pending));
        ctx.process_beacon_ies(&ies, 1023 << 16).unwrap();

        let store = ctx.store_snapshot();
        assert_eq!(store.len(), 1);
        assert_eq!(store.established().unwrap().link_map[0].bits(), 0x6);
        assert_eq!(store.established().unwrap().mapping_switch_time, None);
        assert_eq!(callbacks.sent().len(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![0x6]);
        assert!(!ctx.timer_state().armed);
        assert_eq!(ctx.stats().switch_expiries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_firmware_expiry_stops_host_timer() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);

        let mut active = mapping(0x1);
        active.expected_duration = Some(ExpectedDuration::new(2));
        ctx.insert_slots([
            T2lmSlot::from_info(active),
            T2lmSlot::from_info(mapping(0x6)),
        ]);
        ctx.dispatch_after_frame(0).unwrap();
        assert!(ctx.timer_state().armed);

        ctx.handle_timer_event(&FirmwareEvent {
            vdev_id: 0,
            status: TimerEventStatus::DurationExpired,
            mapping_switch_tsf: 0,
        })
        .unwrap();
        assert!(!ctx.timer_state().armed);

        // Past the deadline of the timer armed for the first mapping
        tokio::time::sleep(Duration::from_secs(201)).await;
        let established = *ctx.store_snapshot().established().unwrap();
        assert_eq!(established.link_map[0].bits(), 0x6);
        assert!(!established.default_mapping);
        assert_eq!(ctx.stats().duration_expiries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_effects_are_dropped() {
        let callbacks = Arc::new(TestCallbacks::new());
        let ctx = context(&callbacks);
        let seen = recorder(&ctx);
        ctx.insert_slots([T2lmSlot::from_info(mapping(0x1))]);

        let (older, newer) = {
            let mut inner = ctx.shared.inner.lock();
            let mut older = inner.effects();
            older.send = Some(mapping(0x1));
            older.update = Shared::prepare_update(&mut inner);
            inner.store = MappingStore::with_slots([T2lmSlot::from_info(mapping(0x6))]).unwrap();
            let mut newer = inner.effects();
            newer.send = Some(mapping(0x6));
            newer.update = Shared::prepare_update(&mut inner);
            (older, newer)
        };
        assert!(older.sequence < newer.sequence);

        // Newer batch delivered first, the older one must not overwrite it
        ctx.shared.apply(newer);
        ctx.shared.apply(older);

        let sent = callbacks.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, info)| info.link_map[0].bits() == 0x6));
        assert_eq!(*seen.lock().unwrap(), vec![0x6]);
        assert_eq!(ctx.stats().stale_effects, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_racing_expiries_end_on_established_mapping() {
        for _ in 0..20 {
            let callbacks = Arc::new(TestCallbacks::new());
            let ctx = context(&callbacks);
            let seen = recorder(&ctx);

            let mut active = mapping(0x1);
            active.expected_duration = Some(ExpectedDuration::new(5));
            let mut pending = mapping(0x6);
            pending.mapping_switch_time = Some(1);
            ctx.insert_slots([T2lmSlot::from_info(active), T2lmSlot::from_info(pending)]);
            ctx.arm_timer(1, 1).unwrap();

            let firmware = ctx.clone();
            tokio::task::spawn_blocking(move || {
                std::thread::sleep(Duration::from_millis(1));
                firmware
                    .handle_timer_event(&FirmwareEvent {
                        vdev_id: 0,
                        status: TimerEventStatus::DurationExpired,
                        mapping_switch_tsf: 0,
                    })
                    .unwrap();
            })
            .await
            .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;

            let established = ctx.store_snapshot().established().unwrap().link_map[0].bits();
            assert_eq!(seen.lock().unwrap().last().copied(), Some(established));
        }
    }
}
