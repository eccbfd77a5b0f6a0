//! Two-slot table of advertised and established mappings.
//!
//! Slot 0 holds the mapping currently in effect, slot 1 the one advertised to
//! take over at its switch time. Promotion moves slot 1 into slot 0; an
//! expected-duration expiry with nothing pending falls back to the default
//! link mapping.

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, T2lmError};
use crate::ie::build_info;
use crate::types::{LinkMappingInfo, WLAN_MAX_T2LM_IE};

/// TSF bits 16..25, the 1024 µs-granular clock a switch time is expressed in.
const TSF_SWITCH_CLOCK_MASK: u64 = 0x03FF_0000;
const TSF_SWITCH_CLOCK_SHIFT: u32 = 16;
const TSF_SWITCH_CLOCK_MAX: u32 = 1023;

/// Returns the 10-bit switch clock of a TSF value.
pub fn tsf_switch_clock(tsf: u64) -> u16 {
    ((tsf & TSF_SWITCH_CLOCK_MASK) >> TSF_SWITCH_CLOCK_SHIFT) as u16
}

/// Converts a received switch time into milliseconds from `tsf`.
///
/// A switch time at or below the current clock is taken to have wrapped.
/// Values beyond the 10-bit clock can exceed `u16::MAX` ms and saturate.
pub fn switch_time_to_interval_ms(rx_time: u16, tsf: u64) -> u16 {
    let clock = tsf_switch_clock(tsf) as u32;
    let rx = rx_time as u32;
    let ticks = if rx > clock {
        rx - clock
    } else {
        TSF_SWITCH_CLOCK_MAX - (clock - rx)
    };
    let interval_ms = ticks * 1024 / 1000;
    u16::try_from(interval_ms).unwrap_or_else(|_| {
        debug!(
            rx_time,
            clock,
            interval_ms,
            "Switch time beyond the TSF switch clock, interval clamped"
        );
        u16::MAX
    })
}

/// One advertised or established mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct T2lmSlot {
    /// Decoded mapping.
    pub info: LinkMappingInfo,
    /// On-air size of the element it came from.
    pub ie_len: usize,
}

impl T2lmSlot {
    /// Wraps a decoded mapping.
    pub fn new(info: LinkMappingInfo, ie_len: usize) -> Self {
        Self { info, ie_len }
    }

    /// Wraps a mapping, sizing it by its own encoding.
    pub fn from_info(info: LinkMappingInfo) -> Self {
        let ie_len = build_info(&info).len();
        Self { info, ie_len }
    }

    /// Unpopulated slot.
    pub fn invalid() -> Self {
        Self::default()
    }
}

/// Which timer purpose expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpiryKind {
    /// The pending mapping's switch time was reached.
    MappingSwitch,
    /// The active mapping's expected duration elapsed.
    ExpectedDuration,
}

/// Result of merging one received mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Existing slot with the same link map was refreshed.
    Updated(usize),
    /// Mapping stored in a new slot.
    Appended(usize),
    /// Table already full and nothing matched.
    Dropped,
}

/// Advertised/established mappings of one MLO connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingStore {
    slots: [T2lmSlot; WLAN_MAX_T2LM_IE],
    count: usize,
}

impl MappingStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `slots` in order.
    pub fn with_slots(slots: impl IntoIterator<Item = T2lmSlot>) -> Result<Self> {
        let mut store = Self::new();
        for slot in slots {
            if store.count == WLAN_MAX_T2LM_IE {
                return Err(T2lmError::InvalidSlotIndex(store.count));
            }
            store.slots[store.count] = slot;
            store.count += 1;
        }
        store.enforce_direction_exclusion()?;
        Ok(store)
    }

    /// Number of populated slots.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if no mapping is held.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Populated slot at `index`.
    pub fn slot(&self, index: usize) -> Option<&T2lmSlot> {
        self.slots[..self.count].get(index)
    }

    /// Populated slots in order.
    pub fn slots(&self) -> impl Iterator<Item = &T2lmSlot> {
        self.slots[..self.count].iter()
    }

    /// Mapping currently in effect (slot 0).
    pub fn established(&self) -> Option<&LinkMappingInfo> {
        self.slot(0).map(|slot| &slot.info)
    }

    /// Merges one mapping received in a beacon or probe response.
    ///
    /// A slot whose link map matches exactly gets its switch time and
    /// expected duration refreshed (only the fields it already carries).
    /// Otherwise the mapping is appended if a slot is free. The switch time
    /// is converted from the TSF-relative wire value to milliseconds.
    pub fn ingest_beacon_mapping(
        &mut self,
        rx: &LinkMappingInfo,
        tsf: u64,
        ie_len: usize,
    ) -> Result<IngestOutcome> {
        let matched = self.slots[..self.count]
            .iter()
            .position(|slot| slot.info.link_map == rx.link_map);

        let outcome = match matched {
            Some(index) => {
                let slot = &mut self.slots[index];
                if let (Some(_), Some(rx_time)) =
                    (slot.info.mapping_switch_time, rx.mapping_switch_time)
                {
                    let interval = switch_time_to_interval_ms(rx_time, tsf);
                    slot.info.mapping_switch_time = Some(interval);
                    debug!(slot = index, rx_time, interval_ms = interval, "Updated mapping switch time");
                }
                if let (Some(_), Some(duration)) =
                    (slot.info.expected_duration, rx.expected_duration)
                {
                    slot.info.expected_duration = Some(duration);
                }
                IngestOutcome::Updated(index)
            }
            None if self.count < WLAN_MAX_T2LM_IE => {
                let mut info = *rx;
                info.mapping_switch_time = rx
                    .mapping_switch_time
                    .map(|rx_time| switch_time_to_interval_ms(rx_time, tsf));
                let index = self.count;
                self.slots[index] = T2lmSlot::new(info, ie_len);
                self.count += 1;
                debug!(slot = index, direction = %info.direction, "Stored advertised T2LM");
                IngestOutcome::Appended(index)
            }
            None => {
                debug!("T2LM table full, dropping advertised mapping");
                IngestOutcome::Dropped
            }
        };

        self.enforce_direction_exclusion()?;
        Ok(outcome)
    }

    /// Overwrites the switch time of every slot that carries one.
    ///
    /// Returns the number of slots updated.
    pub fn update_switch_tsf(&mut self, mapping_switch_tsf: u16) -> usize {
        let mut updated = 0;
        for slot in self.slots[..self.count].iter_mut() {
            if slot.info.mapping_switch_time.is_some() {
                slot.info.mapping_switch_time = Some(mapping_switch_tsf);
                updated += 1;
            }
        }
        updated
    }

    /// Advances the table after a timer expiry.
    ///
    /// With two slots the pending mapping is copied into slot 0 and becomes
    /// established (no switch pending); slot 1 is freed. With a single slot a
    /// switch expiry just clears its switch time, while a duration expiry
    /// falls back to the default BIDI mapping.
    pub fn promote_or_reset(&mut self, slot_index: usize, kind: ExpiryKind) -> Result<()> {
        if slot_index >= WLAN_MAX_T2LM_IE {
            return Err(T2lmError::InvalidSlotIndex(slot_index));
        }

        match (kind, self.count) {
            (_, 0) => {}
            (_, WLAN_MAX_T2LM_IE) => {
                self.slots[0] = self.slots[1];
                self.slots[0].info.mapping_switch_time = None;
                self.slots[1] = T2lmSlot::invalid();
                self.count = 1;
                debug!(?kind, "Marked the advertised T2LM as established");
            }
            (ExpiryKind::MappingSwitch, _) => {
                self.slots[0].info.mapping_switch_time = None;
                debug!("Mapping switch reached for the only T2LM");
            }
            (ExpiryKind::ExpectedDuration, _) => {
                self.slots[0] = T2lmSlot::from_info(LinkMappingInfo::default_bidi());
                debug!("Expected duration expired, back to default link mapping");
            }
        }
        Ok(())
    }

    /// Replaces the table with the default BIDI mapping.
    pub fn reset_to_default(&mut self) {
        self.slots = [
            T2lmSlot::from_info(LinkMappingInfo::default_bidi()),
            T2lmSlot::invalid(),
        ];
        self.count = 1;
    }

    /// Clears every slot back to INVALID.
    pub fn reset_all(&mut self) {
        self.slots = [T2lmSlot::invalid(); WLAN_MAX_T2LM_IE];
        self.count = 0;
    }

    /// Returns true if populated slots mix a DL/UL mapping with a BIDI one.
    pub fn has_conflicting_directions(&self) -> bool {
        let mut unidirectional = false;
        let mut bidirectional = false;
        for slot in self.slots() {
            unidirectional |= slot.info.direction.is_unidirectional();
            bidirectional |= slot.info.direction == crate::types::Direction::Bidi;
        }
        unidirectional && bidirectional
    }

    fn enforce_direction_exclusion(&mut self) -> Result<()> {
        if self.has_conflicting_directions() {
            warn!("Both DL/UL and BIDI T2LM present, resetting all slots");
            self.reset_all();
            return Err(T2lmError::ConflictingDirections);
        }
        Ok(())
    }
}
