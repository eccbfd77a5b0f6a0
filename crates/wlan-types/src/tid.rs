//! Traffic identifier type with validation.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of traffic identifiers covered by a TID-to-link mapping.
pub const MAX_NUM_TIDS: usize = 8;

/// QoS traffic identifier (0-7).
///
/// TIDs 8-15 exist in the QoS control field but are never part of a
/// TID-to-link mapping, so they are rejected here.
///
/// # Examples
///
/// ```
/// use wlan_types::Tid;
///
/// let tid = Tid::new(5).unwrap();
/// assert_eq!(tid.as_u8(), 5);
/// assert!(Tid::new(8).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Tid(u8);

impl Tid {
    /// Highest TID carried in a mapping.
    pub const MAX: u8 = 7;

    /// Creates a new TID.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is above 7.
    pub const fn new(tid: u8) -> Result<Self, ParseError> {
        if tid <= Self::MAX {
            Ok(Tid(tid))
        } else {
            Err(ParseError::InvalidTid(tid as u16))
        }
    }

    /// Returns the TID as a u8.
    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    /// Returns the TID as an array index.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Bit for this TID in a link mapping presence indicator.
    pub const fn presence_bit(&self) -> u8 {
        1 << self.0
    }

    /// Iterates TIDs 0..=7 in ascending order.
    pub fn all() -> impl Iterator<Item = Tid> {
        (0..=Self::MAX).map(Tid)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Tid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept "TID3" as well as "3"
        let id_str = if s.to_lowercase().starts_with("tid") {
            &s[3..]
        } else {
            s
        };

        let id: u16 = id_str
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidTid(u16::MAX))?;
        if id > Self::MAX as u16 {
            return Err(ParseError::InvalidTid(id));
        }
        Ok(Tid(id as u8))
    }
}

impl TryFrom<u8> for Tid {
    type Error = ParseError;

    fn try_from(tid: u8) -> Result<Self, Self::Error> {
        Tid::new(tid)
    }
}

impl From<Tid> for u8 {
    fn from(tid: Tid) -> u8 {
        tid.0
    }
}
