//! # Vistex Renderer
//!
//! Device-facing half of the virtual texture streamer.
//!
//! ## Features
//! - Feedback readback through a multi-buffered ring, never stalling the GPU
//! - Per-frame page deduplication with parent-mip prefetch
//! - LRU atlas slot reuse and indirection table updates
//! - Pluggable device layer: in-memory [`HeadlessDevice`] or [`WgpuTransfers`]

pub mod device;
pub mod headless;
pub mod manager;
pub mod wgpu_device;

pub use device::{
    BufferDesc, BufferHandle, BufferUsage, GpuDataTransfers, ImageDesc, ImageHandle, ImageUpload,
    ReadableBufferHandle,
};
pub use headless::{HeadlessDevice, ImageUploadRecord, TransferStats, UPLOAD_LOG_CAPACITY};
pub use manager::{PageResidency, UploadOutcome, VirtualTextureManager};
pub use wgpu_device::WgpuTransfers;

use thiserror::Error;
use vistex_core::StreamingError;

/// Renderer errors
#[derive(Error, Debug)]
pub enum RendererError {
    #[error(transparent)]
    Streaming(#[from] StreamingError),

    #[error("GPU device creation failed: {0}")]
    DeviceCreation(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Transfer of {size} bytes at offset {offset} exceeds {resource} ({capacity} bytes)")]
    TransferOutOfBounds {
        resource: String,
        offset: u64,
        size: u64,
        capacity: u64,
    },

    #[error("Feedback readback failed: {0}")]
    Readback(String),
}

/// Result type for renderer operations
pub type RendererResult<T> = Result<T, RendererError>;

/// Streaming statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingStats {
    /// Feedback samples read back this frame, sentinels excluded
    pub feedback_samples: u64,
    /// Distinct pages after deduplication and prefetch
    pub distinct_pages: u32,
    /// Pages newly added to the request queue
    pub requests_queued: u32,
    /// Pages uploaded into an atlas
    pub uploads: u32,
    /// Uploads turned away for lack of a free slot
    pub rejections: u32,
    /// Resident pages displaced by an upload
    pub evictions: u32,
    /// Pixel bytes uploaded
    pub bytes_uploaded: u64,
}

impl StreamingStats {
    /// Reset all counters
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Add another set of counters to this one
    pub fn accumulate(&mut self, other: &StreamingStats) {
        self.feedback_samples += other.feedback_samples;
        self.distinct_pages += other.distinct_pages;
        self.requests_queued += other.requests_queued;
        self.uploads += other.uploads;
        self.rejections += other.rejections;
        self.evictions += other.evictions;
        self.bytes_uploaded += other.bytes_uploaded;
    }
}
