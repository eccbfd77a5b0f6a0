//! Error types for the T2LM subsystem

use thiserror::Error;

/// Errors that can occur while coding T2LM elements or driving the mapping
/// state machine.
///
/// Codec and aggregator errors never reach the mapping store: parsing writes
/// only into an ephemeral negotiation context until it fully succeeds.
#[derive(Debug, Error)]
pub enum T2lmError {
    /// Direction field carries the reserved value
    #[error("Invalid T2LM direction: {0}")]
    InvalidDirection(u8),

    /// A field would be read past the declared element length
    #[error("Truncated T2LM element: need {needed} bytes, {available} available")]
    TruncatedIe { needed: usize, available: usize },

    /// Input buffer is empty where an element or frame was expected
    #[error("Missing input buffer")]
    NullInput,

    /// Element header is not an extension element carrying T2LM
    #[error("Unexpected element id {element_id} (extension id {extension_id:?})")]
    UnexpectedElement {
        element_id: u8,
        extension_id: Option<u8>,
    },

    /// DL/UL mapping present together with a BIDI mapping
    #[error("Both DL/UL and BIDI T2LM mappings present")]
    ConflictingDirections,

    /// Timer armed with a zero interval
    #[error("T2LM timer interval is 0")]
    ZeroInterval,

    /// No free link-update handler slot
    #[error("Link update handler registry full ({0} handlers)")]
    RegistryFull(usize),

    /// Mapping slot index outside the two-slot table
    #[error("Invalid T2LM slot index: {0}")]
    InvalidSlotIndex(usize),

    /// Handler index outside the registry
    #[error("Invalid link update handler index: {0}")]
    InvalidHandlerIndex(usize),

    /// Action frame category or action code not a T2LM frame
    #[error("Invalid T2LM action frame category {category} action {action}")]
    InvalidCategory { category: u8, action: u8 },

    /// Timer used after deinit
    #[error("T2LM timer already released")]
    TimerReleased,

    /// No connection registered for the vdev
    #[error("No MLO connection for vdev {0}")]
    UnknownConnection(u8),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for T2LM operations
pub type Result<T> = std::result::Result<T, T2lmError>;
