//! wgpu Device
//!
//! [`GpuDataTransfers`] on top of a `wgpu::Device` and `wgpu::Queue`.
//!
//! Uploads and fills go through `Queue::write_buffer`/`write_texture`, which
//! run before the next submission. Readback copies are held until
//! [`WgpuTransfers::submit_frame`] is called after the frame's draws, then
//! copied into a ring of `MAP_READ` staging buffers and mapped
//! asynchronously. Reading a slot polls the device once and never waits.
//!
//! Block-compressed atlas formats need `Features::TEXTURE_COMPRESSION_BC`.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use vistex_core::AtlasFormat;

use crate::device::{
    BufferDesc, BufferHandle, BufferUsage, GpuDataTransfers, ImageDesc, ImageHandle, ImageUpload,
    ReadableBufferHandle,
};
use crate::{RendererError, RendererResult};

/// Map the streamer's atlas formats to wgpu
pub fn wgpu_format(format: AtlasFormat) -> wgpu::TextureFormat {
    match format {
        AtlasFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        AtlasFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        AtlasFormat::Bc1RgbaUnormSrgb => wgpu::TextureFormat::Bc1RgbaUnormSrgb,
        AtlasFormat::Bc3RgbaUnorm => wgpu::TextureFormat::Bc3RgbaUnorm,
        AtlasFormat::Bc5RgUnorm => wgpu::TextureFormat::Bc5RgUnorm,
    }
}

/// Map buffer usage flags to wgpu
pub fn wgpu_buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut usages = wgpu::BufferUsages::empty();
    if usage.contains(BufferUsage::STORAGE) {
        usages |= wgpu::BufferUsages::STORAGE;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        usages |= wgpu::BufferUsages::COPY_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        usages |= wgpu::BufferUsages::COPY_DST;
    }
    usages
}

/// Mapping state of one staging buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapState {
    /// Unmapped, free for the next copy
    Idle,
    /// Copy submitted, waiting for `map_async`
    Pending,
    /// Mapped and ready to read
    Mapped,
    /// Mapping failed
    Failed,
}

struct StagingSlot {
    buffer: wgpu::Buffer,
    state: Arc<Mutex<MapState>>,
}

struct WgpuImage {
    texture: wgpu::Texture,
    format: AtlasFormat,
}

struct WgpuReadableRing {
    size: u64,
    slots: Vec<StagingSlot>,
}

struct QueuedReadback {
    src: BufferHandle,
    dst: ReadableBufferHandle,
    ring_slot: u32,
    size: u64,
}

/// Transfers backed by wgpu
pub struct WgpuTransfers {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    images: AHashMap<ImageHandle, WgpuImage>,
    buffers: AHashMap<BufferHandle, wgpu::Buffer>,
    readables: AHashMap<ReadableBufferHandle, WgpuReadableRing>,
    queued_readbacks: Vec<QueuedReadback>,
    next_id: u32,
}

impl WgpuTransfers {
    /// Wrap a device and its queue
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            images: AHashMap::new(),
            buffers: AHashMap::new(),
            readables: AHashMap::new(),
            queued_readbacks: Vec::new(),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn get_buffer(&self, buffer: BufferHandle) -> RendererResult<&wgpu::Buffer> {
        self.buffers
            .get(&buffer)
            .ok_or_else(|| RendererError::ResourceNotFound(format!("buffer {}", buffer.0)))
    }

    /// Underlying texture, for binding
    pub fn texture(&self, image: ImageHandle) -> Option<&wgpu::Texture> {
        self.images.get(&image).map(|image| &image.texture)
    }

    /// Underlying buffer, for binding
    pub fn buffer(&self, buffer: BufferHandle) -> Option<&wgpu::Buffer> {
        self.buffers.get(&buffer)
    }

    /// Encode and submit the readback copies requested this frame.
    ///
    /// Call after the frame's draws have been submitted so the copies see
    /// the feedback they wrote.
    pub fn submit_frame(&mut self) {
        if self.queued_readbacks.is_empty() {
            return;
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("vistex_readback"),
            });
        let mut to_map = Vec::new();

        for readback in std::mem::take(&mut self.queued_readbacks) {
            let Some(src) = self.buffers.get(&readback.src) else {
                continue;
            };
            let Some(ring) = self.readables.get_mut(&readback.dst) else {
                continue;
            };
            let Some(slot) = ring.slots.get_mut(readback.ring_slot as usize) else {
                continue;
            };

            let state = *slot.state.lock();
            match state {
                MapState::Pending => {
                    log::warn!(
                        "Readback slot {} still in flight, dropping this frame's copy",
                        readback.ring_slot
                    );
                    continue;
                }
                MapState::Mapped => slot.buffer.unmap(),
                MapState::Idle | MapState::Failed => {}
            }

            let size = readback.size.min(ring.size).min(src.size());
            encoder.copy_buffer_to_buffer(src, 0, &slot.buffer, 0, size);
            *slot.state.lock() = MapState::Pending;
            to_map.push((readback.dst, readback.ring_slot));
        }

        self.queue.submit(std::iter::once(encoder.finish()));

        for (readable, ring_slot) in to_map {
            let Some(slot) = self
                .readables
                .get(&readable)
                .and_then(|ring| ring.slots.get(ring_slot as usize))
            else {
                continue;
            };

            let state = slot.state.clone();
            slot.buffer
                .slice(..)
                .map_async(wgpu::MapMode::Read, move |result| {
                    *state.lock() = match result {
                        Ok(()) => MapState::Mapped,
                        Err(err) => {
                            log::error!("Feedback readback mapping failed: {err}");
                            MapState::Failed
                        }
                    };
                });
        }
    }
}

impl GpuDataTransfers for WgpuTransfers {
    fn create_image(&mut self, desc: &ImageDesc) -> RendererResult<ImageHandle> {
        let limit = self.device.limits().max_texture_dimension_2d;
        if desc.extent.x == 0 || desc.extent.y == 0 || desc.extent.x > limit || desc.extent.y > limit {
            return Err(RendererError::DeviceCreation(format!(
                "image '{}' extent {}x{} outside 1..={limit}",
                desc.label, desc.extent.x, desc.extent.y
            )));
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.extent.x,
                height: desc.extent.y,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format(desc.format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let handle = ImageHandle(self.allocate_id());
        self.images.insert(
            handle,
            WgpuImage {
                texture,
                format: desc.format,
            },
        );
        Ok(handle)
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> RendererResult<BufferHandle> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size: desc.size,
            usage: wgpu_buffer_usages(desc.usage),
            mapped_at_creation: false,
        });

        let handle = BufferHandle(self.allocate_id());
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn create_readable_buffer(&mut self, size: u64, ring_len: u32) -> RendererResult<ReadableBufferHandle> {
        let slots = (0..ring_len.max(1))
            .map(|i| StagingSlot {
                buffer: self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("vistex_readback_{i}")),
                    size,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }),
                state: Arc::new(Mutex::new(MapState::Idle)),
            })
            .collect();

        let handle = ReadableBufferHandle(self.allocate_id());
        self.readables.insert(handle, WgpuReadableRing { size, slots });
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(&buffer) {
            buffer.destroy();
        }
    }

    fn destroy_readable_buffer(&mut self, readable: ReadableBufferHandle) {
        if let Some(ring) = self.readables.remove(&readable) {
            for slot in ring.slots {
                slot.buffer.destroy();
            }
        }
    }

    fn push_data_to_buffer(&mut self, data: &[u8], buffer: BufferHandle, offset: u64) -> RendererResult<()> {
        let target = self.get_buffer(buffer)?;
        let end = offset + data.len() as u64;
        if end > target.size() {
            return Err(RendererError::TransferOutOfBounds {
                resource: format!("buffer {}", buffer.0),
                offset,
                size: data.len() as u64,
                capacity: target.size(),
            });
        }

        self.queue.write_buffer(target, offset, data);
        Ok(())
    }

    fn fill_buffer(&mut self, value: u32, size: u64, buffer: BufferHandle, offset: u64) -> RendererResult<()> {
        let target = self.get_buffer(buffer)?;
        if offset + size > target.size() {
            return Err(RendererError::TransferOutOfBounds {
                resource: format!("buffer {}", buffer.0),
                offset,
                size,
                capacity: target.size(),
            });
        }

        if value == 0 {
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("vistex_clear"),
                });
            encoder.clear_buffer(target, offset, Some(size));
            self.queue.submit(std::iter::once(encoder.finish()));
        } else {
            let words = vec![value; size.div_ceil(4) as usize];
            let bytes: &[u8] = bytemuck::cast_slice(&words);
            self.queue.write_buffer(target, offset, &bytes[..size as usize]);
        }
        Ok(())
    }

    fn push_data_to_image(&mut self, upload: &ImageUpload<'_>) -> RendererResult<()> {
        let image = self
            .images
            .get(&upload.image)
            .ok_or_else(|| RendererError::ResourceNotFound(format!("image {}", upload.image.0)))?;

        let (_, block_height) = image.format.block_dimensions();
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &image.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: upload.image_offset.x,
                    y: upload.image_offset.y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            upload.pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(image.format.bytes_per_row(upload.copy_size.x)),
                rows_per_image: Some(upload.copy_size.y.div_ceil(block_height)),
            },
            wgpu::Extent3d {
                width: upload.copy_size.x,
                height: upload.copy_size.y,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn request_buffer_readback(
        &mut self,
        src: BufferHandle,
        dst: ReadableBufferHandle,
        ring_slot: u32,
        size: u64,
    ) -> RendererResult<()> {
        self.get_buffer(src)?;
        if !self.readables.contains_key(&dst) {
            return Err(RendererError::ResourceNotFound(format!("readable buffer {}", dst.0)));
        }

        self.queued_readbacks.push(QueuedReadback {
            src,
            dst,
            ring_slot,
            size,
        });
        Ok(())
    }

    fn read_back(
        &mut self,
        readable: ReadableBufferHandle,
        ring_slot: u32,
        reader: &mut dyn FnMut(&[u32]),
    ) -> RendererResult<bool> {
        self.device.poll(wgpu::Maintain::Poll);

        let ring = self
            .readables
            .get(&readable)
            .ok_or_else(|| RendererError::ResourceNotFound(format!("readable buffer {}", readable.0)))?;
        let Some(slot) = ring.slots.get(ring_slot as usize) else {
            return Ok(false);
        };

        let mut state = slot.state.lock();
        match *state {
            MapState::Idle | MapState::Pending => Ok(false),
            MapState::Failed => {
                *state = MapState::Idle;
                Err(RendererError::Readback(format!(
                    "mapping of readback slot {ring_slot} failed"
                )))
            }
            MapState::Mapped => {
                {
                    let view = slot.buffer.slice(..).get_mapped_range();
                    reader(bytemuck::cast_slice(&view));
                }
                slot.buffer.unmap();
                *state = MapState::Idle;
                Ok(true)
            }
        }
    }
}
