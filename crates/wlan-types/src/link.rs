//! Per-TID link bitmap.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Set of IEEE link ids (0-15) that one TID is mapped to.
///
/// Bit `n` set means link id `n` carries the TID.
///
/// # Examples
///
/// ```
/// use wlan_types::LinkBitmap;
///
/// let links: LinkBitmap = "0,2".parse().unwrap();
/// assert_eq!(links.bits(), 0b101);
/// assert_eq!(links.to_string(), "0x0005");
///
/// let same: LinkBitmap = "0x5".parse().unwrap();
/// assert_eq!(links, same);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LinkBitmap(u16);

impl LinkBitmap {
    /// No links.
    pub const EMPTY: LinkBitmap = LinkBitmap(0);

    /// Highest link id representable.
    pub const MAX_LINK_ID: u8 = 15;

    /// Creates a bitmap from its raw wire value.
    pub const fn new(bits: u16) -> Self {
        LinkBitmap(bits)
    }

    /// Returns the raw wire value.
    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// Returns true if no link is set.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if `link_id` is part of the set.
    pub const fn contains(&self, link_id: u8) -> bool {
        link_id <= Self::MAX_LINK_ID && self.0 & (1 << link_id) != 0
    }

    /// Adds a link id to the set.
    pub fn insert(&mut self, link_id: u8) -> Result<(), ParseError> {
        if link_id > Self::MAX_LINK_ID {
            return Err(ParseError::InvalidLinkId(link_id));
        }
        self.0 |= 1 << link_id;
        Ok(())
    }

    /// Iterates the link ids in ascending order.
    pub fn links(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=Self::MAX_LINK_ID).filter(move |id| self.contains(*id))
    }
}

impl fmt::Display for LinkBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl FromStr for LinkBitmap {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u16::from_str_radix(hex, 16)
                .map(LinkBitmap)
                .map_err(|_| ParseError::InvalidLinkBitmap(s.to_string()));
        }

        let mut bitmap = LinkBitmap::EMPTY;
        for part in s.split(',').filter(|p| !p.trim().is_empty()) {
            let id: u8 = part
                .trim()
                .parse()
                .map_err(|_| ParseError::InvalidLinkBitmap(s.to_string()))?;
            bitmap.insert(id)?;
        }
        Ok(bitmap)
    }
}

impl TryFrom<String> for LinkBitmap {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<LinkBitmap> for String {
    fn from(bitmap: LinkBitmap) -> String {
        bitmap.to_string()
    }
}

impl From<u16> for LinkBitmap {
    fn from(bits: u16) -> Self {
        LinkBitmap(bits)
    }
}

impl From<LinkBitmap> for u16 {
    fn from(bitmap: LinkBitmap) -> u16 {
        bitmap.0
    }
}
