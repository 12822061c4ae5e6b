//! Headless Device
//!
//! In-memory implementation of [`GpuDataTransfers`] for tests, benchmarks and
//! the simulator. Buffers hold real bytes; image uploads are validated and
//! recorded. Readback copies are queued and only land in their ring slot on
//! [`HeadlessDevice::submit_frame`], which stands in for the GPU finishing a
//! frame.

use ahash::AHashMap;
use glam::UVec2;

use crate::device::{
    BufferDesc, BufferHandle, GpuDataTransfers, ImageDesc, ImageHandle, ImageUpload,
    ReadableBufferHandle,
};
use crate::{RendererError, RendererResult};

/// Upload records kept per image; older records are dropped first
pub const UPLOAD_LOG_CAPACITY: usize = 256;

/// Record of one image upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUploadRecord {
    /// Texel origin of the region
    pub image_offset: UVec2,
    /// Size of the region in texels
    pub copy_size: UVec2,
    /// Bytes uploaded
    pub byte_count: usize,
}

/// Counters for queued transfers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Buffer uploads queued
    pub buffer_uploads: u64,
    /// Bytes uploaded into buffers
    pub buffer_upload_bytes: u64,
    /// Buffer fills queued
    pub buffer_fills: u64,
    /// Image uploads queued
    pub image_uploads: u64,
    /// Bytes uploaded into images
    pub image_upload_bytes: u64,
    /// Readback copies requested
    pub readback_requests: u64,
    /// Readback copies that landed in their ring slot
    pub readbacks_resolved: u64,
}

struct HeadlessImage {
    desc: ImageDesc,
    uploads: Vec<ImageUploadRecord>,
}

struct HeadlessBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
}

struct ReadableRing {
    size: u64,
    slots: Vec<Option<Vec<u32>>>,
}

struct PendingReadback {
    src: BufferHandle,
    dst: ReadableBufferHandle,
    ring_slot: u32,
    size: u64,
}

/// Little-endian `u32` words of a byte slice, ignoring a trailing partial word
fn words_from_bytes(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect()
}

/// Device that lives entirely in host memory
#[derive(Default)]
pub struct HeadlessDevice {
    images: AHashMap<ImageHandle, HeadlessImage>,
    buffers: AHashMap<BufferHandle, HeadlessBuffer>,
    readables: AHashMap<ReadableBufferHandle, ReadableRing>,
    pending_readbacks: Vec<PendingReadback>,
    next_id: u32,
    stats: TransferStats,
}

impl HeadlessDevice {
    /// Create an empty device
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer_mut(&mut self, buffer: BufferHandle) -> RendererResult<&mut HeadlessBuffer> {
        self.buffers
            .get_mut(&buffer)
            .ok_or_else(|| RendererError::ResourceNotFound(format!("buffer {}", buffer.0)))
    }

    fn checked_range(
        buffer: &HeadlessBuffer,
        offset: u64,
        size: u64,
    ) -> RendererResult<std::ops::Range<usize>> {
        let capacity = buffer.data.len() as u64;
        match offset.checked_add(size) {
            Some(end) if end <= capacity => Ok(offset as usize..end as usize),
            _ => Err(RendererError::TransferOutOfBounds {
                resource: buffer.desc.label.clone(),
                offset,
                size,
                capacity,
            }),
        }
    }

    /// Write `u32` words into a buffer as a shader would
    pub fn write_buffer_u32(&mut self, buffer: BufferHandle, word_offset: u64, words: &[u32]) -> RendererResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(words);
        let target = self.buffer_mut(buffer)?;
        let range = Self::checked_range(target, word_offset * 4, bytes.len() as u64)?;
        target.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Current contents of a buffer as `u32` words
    pub fn buffer_u32(&self, buffer: BufferHandle) -> Option<Vec<u32>> {
        let buffer = self.buffers.get(&buffer)?;
        Some(words_from_bytes(&buffer.data))
    }

    /// Creation parameters of a buffer
    pub fn buffer_desc(&self, buffer: BufferHandle) -> Option<&BufferDesc> {
        self.buffers.get(&buffer).map(|buffer| &buffer.desc)
    }

    /// Creation parameters of an image
    pub fn image_desc(&self, image: ImageHandle) -> Option<&ImageDesc> {
        self.images.get(&image).map(|image| &image.desc)
    }

    /// Most recent uploads queued into an image, oldest first.
    ///
    /// At most [`UPLOAD_LOG_CAPACITY`] are kept; [`stats`](Self::stats)
    /// counts all of them.
    pub fn image_uploads(&self, image: ImageHandle) -> &[ImageUploadRecord] {
        self.images
            .get(&image)
            .map(|image| image.uploads.as_slice())
            .unwrap_or(&[])
    }

    /// Number of live buffers
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of live readable rings
    pub fn readable_count(&self) -> usize {
        self.readables.len()
    }

    /// Transfer counters
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Finish the frame: every requested readback copy lands in its ring slot.
    ///
    /// Copies whose source or destination was destroyed in the meantime are
    /// dropped.
    pub fn submit_frame(&mut self) {
        for readback in std::mem::take(&mut self.pending_readbacks) {
            let Some(src) = self.buffers.get(&readback.src) else {
                continue;
            };
            let Some(ring) = self.readables.get_mut(&readback.dst) else {
                continue;
            };

            let size = readback.size.min(ring.size).min(src.data.len() as u64) as usize / 4 * 4;
            let words = words_from_bytes(&src.data[..size]);
            if let Some(slot) = ring.slots.get_mut(readback.ring_slot as usize) {
                *slot = Some(words);
                self.stats.readbacks_resolved += 1;
            }
        }
    }
}

impl GpuDataTransfers for HeadlessDevice {
    fn create_image(&mut self, desc: &ImageDesc) -> RendererResult<ImageHandle> {
        if desc.extent.x == 0 || desc.extent.y == 0 {
            return Err(RendererError::DeviceCreation(format!(
                "image '{}' has an empty extent",
                desc.label
            )));
        }

        let handle = ImageHandle(self.allocate_id());
        self.images.insert(
            handle,
            HeadlessImage {
                desc: desc.clone(),
                uploads: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> RendererResult<BufferHandle> {
        let handle = BufferHandle(self.allocate_id());
        self.buffers.insert(
            handle,
            HeadlessBuffer {
                desc: desc.clone(),
                data: vec![0; desc.size as usize],
            },
        );
        Ok(handle)
    }

    fn create_readable_buffer(&mut self, size: u64, ring_len: u32) -> RendererResult<ReadableBufferHandle> {
        let handle = ReadableBufferHandle(self.allocate_id());
        self.readables.insert(
            handle,
            ReadableRing {
                size,
                slots: vec![None; ring_len.max(1) as usize],
            },
        );
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer);
    }

    fn destroy_readable_buffer(&mut self, readable: ReadableBufferHandle) {
        self.readables.remove(&readable);
    }

    fn push_data_to_buffer(&mut self, data: &[u8], buffer: BufferHandle, offset: u64) -> RendererResult<()> {
        let target = self.buffer_mut(buffer)?;
        let range = Self::checked_range(target, offset, data.len() as u64)?;
        target.data[range].copy_from_slice(data);

        self.stats.buffer_uploads += 1;
        self.stats.buffer_upload_bytes += data.len() as u64;
        Ok(())
    }

    fn fill_buffer(&mut self, value: u32, size: u64, buffer: BufferHandle, offset: u64) -> RendererResult<()> {
        let target = self.buffer_mut(buffer)?;
        let range = Self::checked_range(target, offset, size)?;
        let pattern = value.to_le_bytes();
        for (i, byte) in target.data[range].iter_mut().enumerate() {
            *byte = pattern[i % 4];
        }

        self.stats.buffer_fills += 1;
        Ok(())
    }

    fn push_data_to_image(&mut self, upload: &ImageUpload<'_>) -> RendererResult<()> {
        let image = self
            .images
            .get_mut(&upload.image)
            .ok_or_else(|| RendererError::ResourceNotFound(format!("image {}", upload.image.0)))?;

        let end = upload.image_offset + upload.copy_size;
        if end.x > image.desc.extent.x || end.y > image.desc.extent.y {
            return Err(RendererError::TransferOutOfBounds {
                resource: image.desc.label.clone(),
                offset: upload.image_offset.x as u64 + upload.image_offset.y as u64 * image.desc.extent.x as u64,
                size: upload.copy_size.x as u64 * upload.copy_size.y as u64,
                capacity: image.desc.extent.x as u64 * image.desc.extent.y as u64,
            });
        }

        let expected = image
            .desc
            .format
            .bytes_for_extent(upload.copy_size.x, upload.copy_size.y);
        if (upload.pixels.len() as u64) < expected {
            return Err(RendererError::TransferOutOfBounds {
                resource: image.desc.label.clone(),
                offset: 0,
                size: expected,
                capacity: upload.pixels.len() as u64,
            });
        }

        if image.uploads.len() >= UPLOAD_LOG_CAPACITY {
            image.uploads.drain(..UPLOAD_LOG_CAPACITY / 2);
        }
        image.uploads.push(ImageUploadRecord {
            image_offset: upload.image_offset,
            copy_size: upload.copy_size,
            byte_count: upload.pixels.len(),
        });

        self.stats.image_uploads += 1;
        self.stats.image_upload_bytes += upload.pixels.len() as u64;
        Ok(())
    }

    fn request_buffer_readback(
        &mut self,
        src: BufferHandle,
        dst: ReadableBufferHandle,
        ring_slot: u32,
        size: u64,
    ) -> RendererResult<()> {
        if !self.buffers.contains_key(&src) {
            return Err(RendererError::ResourceNotFound(format!("buffer {}", src.0)));
        }
        if !self.readables.contains_key(&dst) {
            return Err(RendererError::ResourceNotFound(format!("readable buffer {}", dst.0)));
        }

        self.pending_readbacks.push(PendingReadback {
            src,
            dst,
            ring_slot,
            size,
        });
        self.stats.readback_requests += 1;
        Ok(())
    }

    fn read_back(
        &mut self,
        readable: ReadableBufferHandle,
        ring_slot: u32,
        reader: &mut dyn FnMut(&[u32]),
    ) -> RendererResult<bool> {
        let ring = self
            .readables
            .get_mut(&readable)
            .ok_or_else(|| RendererError::ResourceNotFound(format!("readable buffer {}", readable.0)))?;

        let Some(data) = ring
            .slots
            .get_mut(ring_slot as usize)
            .and_then(Option::take)
        else {
            return Ok(false);
        };

        reader(&data);
        Ok(true)
    }
}
