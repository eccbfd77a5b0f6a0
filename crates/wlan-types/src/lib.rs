//! Common 802.11 types for multi-link operation.
//!
//! This crate provides type-safe representations of the primitives shared by
//! the MLO control plane:
//!
//! - [`Tid`]: QoS traffic identifiers (0-7)
//! - [`LinkBitmap`]: the set of links a TID is mapped to

mod link;
mod tid;

pub use link::LinkBitmap;
pub use tid::{Tid, MAX_NUM_TIDS};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid TID: {0} (must be 0-7)")]
    InvalidTid(u16),

    #[error("invalid link id: {0} (must be 0-15)")]
    InvalidLinkId(u8),

    #[error("invalid link bitmap: {0}")]
    InvalidLinkBitmap(String),
}
