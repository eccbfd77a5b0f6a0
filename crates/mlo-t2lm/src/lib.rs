//! TID-To-Link Mapping (T2LM) for 802.11be multi-link operation
//!
//! This crate decodes and encodes the T2LM element carried in beacons, probe
//! responses and Protected EHT action frames, and runs the per-connection
//! state machine that follows up to two advertised mappings through their
//! mapping switch time and expected duration.
//!
//! # Architecture
//!
//! ```text
//!  beacon / probe rsp          action frame
//!         │                         │
//!         ▼                         ▼
//!  ┌─────────────┐          ┌───────────────┐
//!  │ ie (codec)  │◀─────────│ negotiation   │
//!  └──────┬──────┘          └───────────────┘
//!         │
//!         ▼
//!  ┌──────────────────── MappingContext (one lock) ───────────────────┐
//!  │  MappingStore (2 slots)   T2lmTimer (one-shot)   HandlerRegistry │
//!  └──────────────┬───────────────────────────────────────┬───────────┘
//!                 │ send_mapping (all ML vdevs)           │ link updates
//!                 ▼                                       ▼
//!           T2lmCallbacks                        registered handlers
//! ```
//!
//! Firmware timer events reach a context through [`ConnectionRegistry`].

pub mod config;
pub mod context;
pub mod error;
pub mod ie;
pub mod negotiation;
pub mod notifier;
pub mod store;
pub mod timer;
pub mod types;

pub use config::T2lmConfig;
pub use context::{ConnectionRegistry, MappingContext, T2lmCallbacks, T2lmStats};
pub use error::{Result, T2lmError};
pub use ie::{build_info, element_len, parse_info, IeReader, IeWriter};
pub use negotiation::{
    build_action_frame, build_container, parse_action_frame, parse_beacon_mappings,
    parse_container, NegotiationContext,
};
pub use notifier::{HandlerRegistry, LinkUpdateHandler};
pub use store::{switch_time_to_interval_ms, ExpiryKind, MappingStore, T2lmSlot};
pub use timer::{T2lmTimer, TimerState};
pub use types::{
    Direction, ExpectedDuration, FirmwareEvent, LinkMappingInfo, T2lmCategory, TimerEventStatus,
};
pub use wlan_types::{LinkBitmap, Tid, MAX_NUM_TIDS};
