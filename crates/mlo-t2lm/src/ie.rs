//! TID-To-Link Mapping element codec.
//!
//! ```text
//!   1        1        1        1 or 2     0 or 2        0 or 3       0..16
//! +------+--------+--------+----------+-------------+-----------+------------+
//! | EID  | Length | Ext ID | Control  | Switch time | Expected  | Per-TID    |
//! | 255  |        |  109   |          |             | duration  | link maps  |
//! +------+--------+--------+----------+-------------+-----------+------------+
//!
//! Control (little-endian):
//!   b0-1  direction (0=DL, 1=UL, 2=BIDI)
//!   b2    default link mapping (control is 1 octet when set)
//!   b3    mapping switch time present
//!   b4    expected duration present
//!   b5-12 link mapping presence indicator, one bit per TID
//! ```
//!
//! All field access goes through [`IeReader`] / [`IeWriter`], which bound
//! every read to the declared element length. Element bytes come from the air
//! and are treated as untrusted.

use tracing::trace;
use wlan_types::{LinkBitmap, Tid};

use crate::error::{Result, T2lmError};
use crate::types::{
    Direction, ExpectedDuration, LinkMappingInfo, WLAN_ELEMID_EXTN_ELEM, WLAN_EXTN_ELEMID_T2LM,
    WLAN_T2LM_EXPECTED_DURATION_SIZE,
};

/// Element id + length octets.
pub const IE_HEADER_LEN: usize = 2;

const CONTROL_DIRECTION_MASK: u16 = 0x0003;
const CONTROL_DEFAULT_LINK_MAPPING: u16 = 1 << 2;
const CONTROL_SWITCH_TIME_PRESENT: u16 = 1 << 3;
const CONTROL_EXPECTED_DURATION_PRESENT: u16 = 1 << 4;
const CONTROL_PRESENCE_INDICATOR_SHIFT: u16 = 5;

/// Bounds-checked cursor over element bytes.
#[derive(Debug)]
pub struct IeReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> IeReader<'a> {
    /// Creates a reader over `buf`; reads never go past its end.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Unread bytes, without consuming them.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Reads `n` bytes.
    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len()).ok_or(
            T2lmError::TruncatedIe {
                needed: self.pos.saturating_add(n),
                available: self.buf.len(),
            },
        )?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Reads a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_slice(N)?);
        Ok(out)
    }

    /// Reads one octet.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a little-endian u16.
    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }
}

/// Append-only element writer.
#[derive(Debug, Default)]
pub struct IeWriter {
    buf: Vec<u8>,
}

impl IeWriter {
    /// Creates a writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Appends one octet.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Appends a little-endian u16.
    pub fn put_u16_le(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends raw bytes.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Current length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Overwrites a previously written octet.
    fn patch_u8(&mut self, offset: usize, value: u8) {
        if let Some(slot) = self.buf.get_mut(offset) {
            *slot = value;
        }
    }

    /// Finishes the writer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Returns the full on-air size (header included) of the element at the
/// start of `bytes`.
pub fn element_len(bytes: &[u8]) -> Result<usize> {
    if bytes.is_empty() {
        return Err(T2lmError::NullInput);
    }
    let mut reader = IeReader::new(bytes);
    let _element_id = reader.read_u8()?;
    let len = reader.read_u8()? as usize;
    let total = IE_HEADER_LEN + len;
    if total > bytes.len() {
        return Err(T2lmError::TruncatedIe {
            needed: total,
            available: bytes.len(),
        });
    }
    Ok(total)
}

/// Decodes one T2LM element.
///
/// `element` starts at the element id. Bytes after the declared length are
/// never touched, and trailing bytes inside the element are ignored.
pub fn parse_info(element: &[u8]) -> Result<LinkMappingInfo> {
    let total = element_len(element)?;
    let element_id = element[0];
    let mut reader = IeReader::new(&element[IE_HEADER_LEN..total]);

    let extension_id = reader.read_u8().ok();
    if element_id != WLAN_ELEMID_EXTN_ELEM || extension_id != Some(WLAN_EXTN_ELEMID_T2LM) {
        return Err(T2lmError::UnexpectedElement {
            element_id,
            extension_id,
        });
    }

    let first = reader.read_u8()?;
    let raw_direction = first & CONTROL_DIRECTION_MASK as u8;
    let direction =
        Direction::from_wire(raw_direction).ok_or(T2lmError::InvalidDirection(raw_direction))?;
    let default_mapping = first as u16 & CONTROL_DEFAULT_LINK_MAPPING != 0;
    let switch_time_present = first as u16 & CONTROL_SWITCH_TIME_PRESENT != 0;
    let duration_present = first as u16 & CONTROL_EXPECTED_DURATION_PRESENT != 0;

    // The control field grows to two octets only when a link map follows.
    let presence_indicator = if default_mapping {
        0
    } else {
        let control = u16::from_le_bytes([first, reader.read_u8()?]);
        (control >> CONTROL_PRESENCE_INDICATOR_SHIFT) as u8
    };

    let mut info = LinkMappingInfo {
        direction,
        default_mapping,
        ..LinkMappingInfo::default()
    };

    if switch_time_present {
        info.mapping_switch_time = Some(reader.read_u16_le()?);
    }

    if duration_present {
        let bytes = reader.read_array::<WLAN_T2LM_EXPECTED_DURATION_SIZE>()?;
        info.expected_duration = Some(ExpectedDuration::from_le_bytes(bytes));
    }

    trace!(
        %direction,
        default_mapping,
        switch_time = ?info.mapping_switch_time,
        expected_duration = ?info.expected_duration.map(|d| d.value()),
        presence_indicator,
        "Parsed T2LM control"
    );

    if default_mapping {
        return Ok(info);
    }

    for tid in Tid::all() {
        if presence_indicator & tid.presence_bit() == 0 {
            continue;
        }
        let links = LinkBitmap::new(reader.read_u16_le()?);
        trace!(%tid, %links, "Link mapping of TID");
        info.set_links(tid, links);
    }

    Ok(info)
}

/// Encodes one T2LM element, header included.
///
/// The control field is one octet for a default mapping and two otherwise.
/// TIDs with an empty link bitmap are left out of the presence indicator.
pub fn build_info(info: &LinkMappingInfo) -> Vec<u8> {
    let mut writer = IeWriter::with_capacity(24);
    writer.put_u8(WLAN_ELEMID_EXTN_ELEM);
    let len_offset = writer.len();
    writer.put_u8(0);
    writer.put_u8(WLAN_EXTN_ELEMID_T2LM);

    let mut control = info.direction.wire_value() as u16 & CONTROL_DIRECTION_MASK;
    if info.default_mapping {
        control |= CONTROL_DEFAULT_LINK_MAPPING;
    }
    if info.mapping_switch_time_present() {
        control |= CONTROL_SWITCH_TIME_PRESENT;
    }
    if info.expected_duration_present() {
        control |= CONTROL_EXPECTED_DURATION_PRESENT;
    }

    if info.default_mapping {
        writer.put_u8(control as u8);
    } else {
        control |= (info.presence_indicator() as u16) << CONTROL_PRESENCE_INDICATOR_SHIFT;
        writer.put_u16_le(control);
    }

    if let Some(switch_time) = info.mapping_switch_time {
        writer.put_u16_le(switch_time);
    }

    if let Some(duration) = info.expected_duration {
        writer.put_slice(&duration.to_le_bytes());
    }

    if !info.default_mapping {
        for tid in Tid::all() {
            let links = info.links_for(tid);
            if !links.is_empty() {
                writer.put_u16_le(links.bits());
            }
        }
    }

    let elem_len = (writer.len() - IE_HEADER_LEN) as u8;
    writer.patch_u8(len_offset, elem_len);

    trace!(
        direction = %info.direction,
        default_mapping = info.default_mapping,
        elem_len,
        "Built T2LM element"
    );

    writer.into_bytes()
}
