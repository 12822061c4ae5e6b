//! Device Transfers
//!
//! The slice of the device-resource layer the streamer depends on: creating
//! images and buffers, queueing uploads and fills, and multi-buffered
//! readback. Every operation is non-blocking; readback results show up on a
//! later frame.

use bitflags::bitflags;
use glam::UVec2;
use vistex_core::AtlasFormat;

use crate::RendererResult;

/// Handle to a device image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u32);

/// Handle to a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

/// Handle to a ring of host-readable copies of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadableBufferHandle(pub u32);

bitflags! {
    /// How a buffer will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Bound as a storage buffer in shaders
        const STORAGE = 1 << 0;
        /// Source of copies
        const COPY_SRC = 1 << 1;
        /// Destination of copies, uploads and fills
        const COPY_DST = 1 << 2;
    }
}

/// Image creation parameters
#[derive(Debug, Clone)]
pub struct ImageDesc {
    /// Debug label
    pub label: String,
    /// Size in texels
    pub extent: UVec2,
    /// Texel format
    pub format: AtlasFormat,
}

/// Buffer creation parameters
#[derive(Debug, Clone)]
pub struct BufferDesc {
    /// Debug label
    pub label: String,
    /// Size in bytes
    pub size: u64,
    /// Usage flags
    pub usage: BufferUsage,
}

/// Pixel upload into a sub-region of an image
#[derive(Debug, Clone, Copy)]
pub struct ImageUpload<'a> {
    /// Tightly packed texel data
    pub pixels: &'a [u8],
    /// Target image
    pub image: ImageHandle,
    /// Size of the copied region in texels
    pub copy_size: UVec2,
    /// Texel origin of the region inside the image
    pub image_offset: UVec2,
}

/// Non-blocking transfers between host and device.
///
/// Implementations queue work and return immediately. The only way to observe
/// device results is [`read_back`](Self::read_back), which reports whether a
/// ring slot has been resolved yet instead of waiting for it.
pub trait GpuDataTransfers {
    /// Create a device image
    fn create_image(&mut self, desc: &ImageDesc) -> RendererResult<ImageHandle>;

    /// Create a device buffer
    fn create_buffer(&mut self, desc: &BufferDesc) -> RendererResult<BufferHandle>;

    /// Create `ring_len` host-readable buffers of `size` bytes
    fn create_readable_buffer(&mut self, size: u64, ring_len: u32) -> RendererResult<ReadableBufferHandle>;

    /// Release a device buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Release a readable ring
    fn destroy_readable_buffer(&mut self, readable: ReadableBufferHandle);

    /// Queue an upload of raw bytes into a buffer
    fn push_data_to_buffer(&mut self, data: &[u8], buffer: BufferHandle, offset: u64) -> RendererResult<()>;

    /// Queue a fill of `size` bytes with a repeated 32-bit value
    fn fill_buffer(&mut self, value: u32, size: u64, buffer: BufferHandle, offset: u64) -> RendererResult<()>;

    /// Queue an upload of texels into an image region
    fn push_data_to_image(&mut self, upload: &ImageUpload<'_>) -> RendererResult<()>;

    /// Schedule a copy of `size` bytes of `src` into ring slot `ring_slot` of
    /// `dst`, resolved after the current frame's work completes
    fn request_buffer_readback(
        &mut self,
        src: BufferHandle,
        dst: ReadableBufferHandle,
        ring_slot: u32,
        size: u64,
    ) -> RendererResult<()>;

    /// Hand the contents of a resolved ring slot to `reader`.
    ///
    /// Returns `Ok(false)` without calling `reader` when the slot has no
    /// resolved copy yet.
    fn read_back(
        &mut self,
        readable: ReadableBufferHandle,
        ring_slot: u32,
        reader: &mut dyn FnMut(&[u32]),
    ) -> RendererResult<bool>;
}
