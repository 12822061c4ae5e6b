//! # Vistex Core
//!
//! GPU-agnostic data model for feedback-driven virtual texture streaming.
//!
//! This crate provides the pieces that do not touch a device:
//! - **Feedback**: the 32-bit page key written by shaders and the decoder that
//!   deduplicates one frame of it
//! - **Addressing**: the quadtree formula mapping a page to its indirection entry
//! - **Indirection**: CPU mirror and range allocator of the shared indirection table
//! - **Atlas**: physical slot lifecycle with per-frame LRU eviction
//! - **Arena**: block storage keeping atlas addresses stable
//! - **Config**: streaming configuration

pub mod addressing;
pub mod arena;
pub mod atlas;
pub mod config;
pub mod feedback;
pub mod indirection;

pub use addressing::{indirection_count, indirection_id, mip_count};
pub use arena::BlockArena;
pub use atlas::{AtlasFormat, AtlasInfo, SlotAllocation};
pub use config::StreamingConfig;
pub use feedback::{FeedbackDecoder, FeedbackInfo, SAMPLES_PER_BLOCK};
pub use indirection::{IndirectionTable, UNMAPPED};

use thiserror::Error;

/// Index of an atlas inside the manager
pub type AtlasIndex = u32;

/// Streaming errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamingError {
    #[error("Indirection table overflow: {requested} entries requested at offset {offset}, capacity is {capacity}")]
    IndirectionCapacityExceeded {
        offset: u32,
        requested: u32,
        capacity: u32,
    },

    #[error("Slice extent {width}x{height} does not fit in a {max}x{max} atlas slot")]
    SliceTooLarge { width: u32, height: u32, max: u32 },

    #[error("Atlas not found: {0}")]
    AtlasNotFound(AtlasIndex),

    #[error("Indirection address {address} is outside the table (capacity {capacity})")]
    IndirectionOutOfRange { address: u32, capacity: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for streaming operations
pub type StreamingResult<T> = Result<T, StreamingError>;
