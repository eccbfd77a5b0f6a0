//! T2LM types and constants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use wlan_types::{LinkBitmap, Tid, MAX_NUM_TIDS};

/// Extension element id (WLAN_ELEMID_EXTN_ELEM).
pub const WLAN_ELEMID_EXTN_ELEM: u8 = 255;

/// TID-To-Link Mapping extension element id.
pub const WLAN_EXTN_ELEMID_T2LM: u8 = 109;

/// Maximum number of T2LM elements in one frame or advertised at once.
pub const WLAN_MAX_T2LM_IE: usize = 2;

/// Number of negotiation directions (DL, UL, BIDI).
pub const WLAN_T2LM_MAX_DIRECTION: usize = 3;

/// Size of the expected duration field on the wire.
pub const WLAN_T2LM_EXPECTED_DURATION_SIZE: usize = 3;

/// Default capacity of the link update handler registry.
pub const MAX_T2LM_HANDLERS: usize = 50;

/// Protected EHT action category.
pub const WLAN_ACTION_PROTECTED_EHT: u8 = 37;

/// Response status asking the requester to use the attached mapping instead.
pub const WLAN_T2LM_RESP_TYPE_PREFERRED_TID_TO_LINK_MAPPING: u8 = 134;

/// Mapping direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Downlink.
    Dl,
    /// Uplink.
    Ul,
    /// Both directions.
    Bidi,
    /// Unpopulated slot.
    #[default]
    Invalid,
}

impl Direction {
    /// Negotiation directions in serialization order.
    pub const ALL: [Direction; WLAN_T2LM_MAX_DIRECTION] =
        [Direction::Dl, Direction::Ul, Direction::Bidi];

    /// Creates a direction from its 2-bit wire value.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dl),
            1 => Some(Self::Ul),
            2 => Some(Self::Bidi),
            _ => None,
        }
    }

    /// Returns the 2-bit wire value.
    pub fn wire_value(&self) -> u8 {
        match self {
            Self::Dl => 0,
            Self::Ul => 1,
            Self::Bidi => 2,
            Self::Invalid => 3,
        }
    }

    /// Index into a per-direction table, `None` for [`Direction::Invalid`].
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Invalid => None,
            other => Some(other.wire_value() as usize),
        }
    }

    /// Returns true for DL or UL.
    pub fn is_unidirectional(&self) -> bool {
        matches!(self, Self::Dl | Self::Ul)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dl => "dl",
            Self::Ul => "ul",
            Self::Bidi => "bidi",
            Self::Invalid => "invalid",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dl" | "downlink" => Ok(Self::Dl),
            "ul" | "uplink" => Ok(Self::Ul),
            "bidi" | "both" => Ok(Self::Bidi),
            _ => Err(format!("Unknown T2LM direction: {}", s)),
        }
    }
}

/// Expected duration of an advertised mapping, in TUs (24 bits on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpectedDuration(u32);

impl ExpectedDuration {
    /// Largest 24-bit value; a mapping advertised with it never expires.
    pub const NEVER_EXPIRES: ExpectedDuration = ExpectedDuration(0x00FF_FFFF);

    /// Creates a duration, keeping the low 24 bits.
    pub const fn new(value: u32) -> Self {
        ExpectedDuration(value & 0x00FF_FFFF)
    }

    /// Decodes the 3-byte little-endian wire form.
    pub const fn from_le_bytes(bytes: [u8; WLAN_T2LM_EXPECTED_DURATION_SIZE]) -> Self {
        ExpectedDuration(bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16)
    }

    /// Encodes the 3-byte little-endian wire form.
    pub const fn to_le_bytes(&self) -> [u8; WLAN_T2LM_EXPECTED_DURATION_SIZE] {
        [self.0 as u8, (self.0 >> 8) as u8, (self.0 >> 16) as u8]
    }

    /// Returns the raw value.
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Returns true for the "never expires" sentinel.
    pub const fn is_never_expires(&self) -> bool {
        self.0 == Self::NEVER_EXPIRES.0
    }
}

/// One TID-to-link mapping as carried by a single T2LM element.
///
/// `mapping_switch_time` and `expected_duration` model the presence flag and
/// the value together. When `default_mapping` is set the per-TID link map is
/// empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkMappingInfo {
    /// Direction the mapping applies to.
    pub direction: Direction,
    /// All TIDs mapped to all setup links.
    pub default_mapping: bool,
    /// Mapping switch time (TSF-relative on the wire, ms once ingested).
    pub mapping_switch_time: Option<u16>,
    /// How long the mapping stays in effect.
    pub expected_duration: Option<ExpectedDuration>,
    /// Link bitmap for each TID 0..7.
    pub link_map: [LinkBitmap; MAX_NUM_TIDS],
}

impl LinkMappingInfo {
    /// Unpopulated entry (direction INVALID).
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Default link mapping in both directions.
    pub fn default_bidi() -> Self {
        Self {
            direction: Direction::Bidi,
            default_mapping: true,
            ..Self::default()
        }
    }

    /// Non-default mapping with an explicit link map.
    pub fn with_link_map(direction: Direction, link_map: [LinkBitmap; MAX_NUM_TIDS]) -> Self {
        Self {
            direction,
            link_map,
            ..Self::default()
        }
    }

    /// Returns true if the entry carries a mapping.
    pub fn is_populated(&self) -> bool {
        self.direction != Direction::Invalid
    }

    /// Returns true if a mapping switch time is present.
    pub fn mapping_switch_time_present(&self) -> bool {
        self.mapping_switch_time.is_some()
    }

    /// Returns true if an expected duration is present.
    pub fn expected_duration_present(&self) -> bool {
        self.expected_duration.is_some()
    }

    /// Link bitmap of one TID.
    pub fn links_for(&self, tid: Tid) -> LinkBitmap {
        self.link_map[tid.index()]
    }

    /// Sets the link bitmap of one TID.
    pub fn set_links(&mut self, tid: Tid, links: LinkBitmap) {
        self.link_map[tid.index()] = links;
    }

    /// Presence indicator derived from the non-empty TID bitmaps.
    pub fn presence_indicator(&self) -> u8 {
        Tid::all()
            .filter(|tid| !self.links_for(*tid).is_empty())
            .fold(0, |acc, tid| acc | tid.presence_bit())
    }

    /// Raw per-TID bitmaps, the form handed to link update handlers.
    pub fn raw_link_map(&self) -> [u16; MAX_NUM_TIDS] {
        self.link_map.map(|links| links.bits())
    }
}

/// T2LM action frame category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum T2lmCategory {
    /// TID-to-link mapping request.
    #[default]
    Request,
    /// TID-to-link mapping response.
    Response,
    /// TID-to-link mapping teardown.
    Teardown,
}

impl T2lmCategory {
    /// Returns the Protected EHT action code.
    pub fn action_code(&self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
            Self::Teardown => 2,
        }
    }

    /// Creates a category from the Protected EHT action code.
    pub fn from_action_code(action: u8) -> Option<Self> {
        match action {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Teardown),
            _ => None,
        }
    }
}

/// Firmware notification about the mapping timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerEventStatus {
    /// Firmware reports the TSF of the pending mapping switch.
    TsfUpdate,
    /// Mapping switch time reached.
    SwitchExpired,
    /// Expected duration elapsed.
    DurationExpired,
}

/// Timer event delivered by firmware for one vdev.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareEvent {
    /// Reporting vdev.
    pub vdev_id: u8,
    /// Event status.
    pub status: TimerEventStatus,
    /// Switch TSF, meaningful for [`TimerEventStatus::TsfUpdate`].
    pub mapping_switch_tsf: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_direction_wire_values() {
        for dir in Direction::ALL {
            assert_eq!(Direction::from_wire(dir.wire_value()), Some(dir));
        }
        assert_eq!(Direction::from_wire(3), None);
        assert_eq!(Direction::Invalid.index(), None);
        assert_eq!(Direction::Bidi.index(), Some(2));
    }

    #[test]
    fn test_direction_from_str() {
        assert_eq!("DL".parse::<Direction>(), Ok(Direction::Dl));
        assert_eq!("both".parse::<Direction>(), Ok(Direction::Bidi));
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_expected_duration_bytes() {
        let dur = ExpectedDuration::from_le_bytes([0x01, 0x02, 0x03]);
        assert_eq!(dur.value(), 0x030201);
        assert_eq!(dur.to_le_bytes(), [0x01, 0x02, 0x03]);
        assert!(ExpectedDuration::new(0xFFFF_FFFF).is_never_expires());
    }

    #[test]
    fn test_presence_indicator() {
        let mut info = LinkMappingInfo::with_link_map(Direction::Dl, Default::default());
        info.set_links(Tid::new(1).unwrap(), LinkBitmap::new(0x1));
        info.set_links(Tid::new(7).unwrap(), LinkBitmap::new(0x2));
        assert_eq!(info.presence_indicator(), 0b1000_0010);
    }

    #[test]
    fn test_category_action_codes() {
        assert_eq!(T2lmCategory::from_action_code(2), Some(T2lmCategory::Teardown));
        assert_eq!(T2lmCategory::from_action_code(3), None);
        assert_eq!(T2lmCategory::Response.action_code(), 1);
    }
}
