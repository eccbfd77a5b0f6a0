//! T2LM negotiation: element containers and Protected EHT action frames.
//!
//! A container is a run of concatenated elements. Only T2LM extension
//! elements are decoded, at most [`WLAN_MAX_T2LM_IE`] of them, keyed by
//! direction into a [`NegotiationContext`].

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, T2lmError};
use crate::ie::{build_info, element_len, parse_info, IeReader, IeWriter, IE_HEADER_LEN};
use crate::store::T2lmSlot;
use crate::types::{
    Direction, LinkMappingInfo, T2lmCategory, WLAN_ACTION_PROTECTED_EHT, WLAN_ELEMID_EXTN_ELEM,
    WLAN_EXTN_ELEMID_T2LM, WLAN_MAX_T2LM_IE, WLAN_T2LM_MAX_DIRECTION,
    WLAN_T2LM_RESP_TYPE_PREFERRED_TID_TO_LINK_MAPPING,
};

/// State of one request/response/teardown exchange.
///
/// Lives for a single parse or build; it never feeds the mapping store
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NegotiationContext {
    /// Frame type.
    pub category: T2lmCategory,
    /// Dialog token matching a response to its request.
    pub dialog_token: u8,
    /// Status code, meaningful for responses only.
    pub response_status: u8,
    mappings: [LinkMappingInfo; WLAN_T2LM_MAX_DIRECTION],
}

impl NegotiationContext {
    /// Creates an empty context for `category`.
    pub fn new(category: T2lmCategory, dialog_token: u8) -> Self {
        Self {
            category,
            dialog_token,
            ..Self::default()
        }
    }

    /// Mapping negotiated for `direction`, if any.
    pub fn mapping(&self, direction: Direction) -> Option<&LinkMappingInfo> {
        let index = direction.index()?;
        let info = &self.mappings[index];
        info.is_populated().then_some(info)
    }

    /// Stores `info` under its own direction. Entries with an INVALID
    /// direction are ignored.
    pub fn set_mapping(&mut self, info: LinkMappingInfo) {
        if let Some(index) = info.direction.index() {
            self.mappings[index] = info;
        }
    }

    /// Populated mappings in DL, UL, BIDI order.
    pub fn mappings(&self) -> impl Iterator<Item = &LinkMappingInfo> {
        self.mappings.iter().filter(|info| info.is_populated())
    }

    /// Marks every direction slot INVALID.
    pub fn reset_mappings(&mut self) {
        self.mappings = [LinkMappingInfo::invalid(); WLAN_T2LM_MAX_DIRECTION];
    }

    /// Returns true if a DL or UL mapping sits next to a BIDI one.
    pub fn has_conflict(&self) -> bool {
        let unidirectional =
            self.mapping(Direction::Dl).is_some() || self.mapping(Direction::Ul).is_some();
        unidirectional && self.mapping(Direction::Bidi).is_some()
    }

    /// Decodes a container into this context.
    ///
    /// Direction slots are reset first. On a decode error or a direction
    /// conflict the slots are left INVALID.
    pub fn parse_ies(&mut self, ies: &[u8]) -> Result<()> {
        self.reset_mappings();
        if ies.is_empty() {
            return Err(T2lmError::NullInput);
        }

        for element in Elements::new(ies).filter_t2lm().take(WLAN_MAX_T2LM_IE) {
            let element = element.inspect_err(|_| self.reset_mappings())?;
            let info = parse_info(element).inspect_err(|_| self.reset_mappings())?;
            debug!(direction = %info.direction, "Decoded T2LM element");
            self.set_mapping(info);
        }

        if self.has_conflict() {
            warn!("Both DL/UL and BIDI T2LM present in one container");
            self.reset_mappings();
            return Err(T2lmError::ConflictingDirections);
        }
        Ok(())
    }
}

/// Decodes the T2LM elements of a container.
pub fn parse_container(ies: &[u8]) -> Result<NegotiationContext> {
    let mut ctx = NegotiationContext::default();
    ctx.parse_ies(ies)?;
    Ok(ctx)
}

/// Encodes one element per populated direction, DL then UL then BIDI.
///
/// Nothing is emitted when the context mixes DL/UL with BIDI.
pub fn build_container(ctx: &NegotiationContext) -> Result<Vec<u8>> {
    if ctx.has_conflict() {
        return Err(T2lmError::ConflictingDirections);
    }
    let mut out = Vec::new();
    for info in ctx.mappings() {
        out.extend_from_slice(&build_info(info));
    }
    Ok(out)
}

/// Decodes a Protected EHT T2LM action frame body, starting at the category.
pub fn parse_action_frame(frame: &[u8]) -> Result<NegotiationContext> {
    if frame.is_empty() {
        return Err(T2lmError::NullInput);
    }

    let mut reader = IeReader::new(frame);
    let category = reader.read_u8()?;
    let action = reader.read_u8()?;
    let kind = match T2lmCategory::from_action_code(action) {
        Some(kind) if category == WLAN_ACTION_PROTECTED_EHT => kind,
        _ => return Err(T2lmError::InvalidCategory { category, action }),
    };

    let mut ctx = NegotiationContext::new(kind, 0);
    match kind {
        T2lmCategory::Request => {
            ctx.dialog_token = reader.read_u8()?;
            ctx.parse_ies(reader.rest())?;
        }
        T2lmCategory::Response => {
            ctx.dialog_token = reader.read_u8()?;
            ctx.response_status = reader.read_u8()?;
            if ctx.response_status == WLAN_T2LM_RESP_TYPE_PREFERRED_TID_TO_LINK_MAPPING {
                ctx.parse_ies(reader.rest())?;
            }
        }
        T2lmCategory::Teardown => {}
    }

    debug!(
        category = ?ctx.category,
        dialog_token = ctx.dialog_token,
        status = ctx.response_status,
        "Parsed T2LM action frame"
    );
    Ok(ctx)
}

/// Encodes a Protected EHT T2LM action frame body.
pub fn build_action_frame(ctx: &NegotiationContext) -> Result<Vec<u8>> {
    let mut writer = IeWriter::with_capacity(64);
    writer.put_u8(WLAN_ACTION_PROTECTED_EHT);
    writer.put_u8(ctx.category.action_code());

    match ctx.category {
        T2lmCategory::Request => {
            writer.put_u8(ctx.dialog_token);
            writer.put_slice(&build_container(ctx)?);
        }
        T2lmCategory::Response => {
            writer.put_u8(ctx.dialog_token);
            writer.put_u8(ctx.response_status);
            if ctx.response_status == WLAN_T2LM_RESP_TYPE_PREFERRED_TID_TO_LINK_MAPPING {
                writer.put_slice(&build_container(ctx)?);
            }
        }
        T2lmCategory::Teardown => {}
    }

    Ok(writer.into_bytes())
}

/// Decodes the mappings advertised in a beacon or probe response.
///
/// Up to [`WLAN_MAX_T2LM_IE`] T2LM elements are kept in wire order along
/// with their on-air size. An empty buffer carries no mapping.
pub fn parse_beacon_mappings(ies: &[u8]) -> Result<Vec<T2lmSlot>> {
    let mut slots = Vec::with_capacity(WLAN_MAX_T2LM_IE);
    for element in Elements::new(ies).filter_t2lm().take(WLAN_MAX_T2LM_IE) {
        let element = element?;
        slots.push(T2lmSlot::new(parse_info(element)?, element.len()));
    }
    Ok(slots)
}

/// Walks concatenated elements, yielding each one header included.
///
/// Stops after the first malformed element.
struct Elements<'a> {
    rest: &'a [u8],
    failed: bool,
}

impl<'a> Elements<'a> {
    fn new(ies: &'a [u8]) -> Self {
        Self {
            rest: ies,
            failed: false,
        }
    }

    fn filter_t2lm(self) -> impl Iterator<Item = Result<&'a [u8]>> {
        self.filter(|element| match element {
            Ok(element) => is_t2lm_element(element),
            Err(_) => true,
        })
    }
}

impl<'a> Iterator for Elements<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        match element_len(self.rest) {
            Ok(total) => {
                let (element, rest) = self.rest.split_at(total);
                self.rest = rest;
                Some(Ok(element))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn is_t2lm_element(element: &[u8]) -> bool {
    element.len() > IE_HEADER_LEN
        && element[0] == WLAN_ELEMID_EXTN_ELEM
        && element[IE_HEADER_LEN] == WLAN_EXTN_ELEMID_T2LM
}
