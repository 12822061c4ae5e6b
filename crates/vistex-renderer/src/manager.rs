//! Virtual Texture Manager
//!
//! Runs the feedback loop once per frame:
//! 1. read back the feedback written `N` frames ago and deduplicate it
//! 2. refresh the LRU of resident pages and queue the missing ones
//! 3. age every atlas, clear the feedback buffer and schedule the next copy
//!
//! Between frames the caller drains requests with
//! [`get_requested_slices`](VirtualTextureManager::get_requested_slices),
//! loads the pixels and hands them back through
//! [`upload_data`](VirtualTextureManager::upload_data).

use std::sync::Arc;

use ahash::AHashMap;
use glam::UVec2;
use indexmap::IndexSet;
use parking_lot::Mutex;
use vistex_core::{
    indirection_id, AtlasFormat, AtlasIndex, AtlasInfo, BlockArena, FeedbackDecoder, FeedbackInfo,
    IndirectionTable, StreamingConfig, StreamingError, UNMAPPED,
};

use crate::device::{
    BufferDesc, BufferHandle, BufferUsage, GpuDataTransfers, ImageDesc, ImageHandle, ImageUpload,
    ReadableBufferHandle,
};
use crate::{RendererError, RendererResult, StreamingStats};

/// Where a page lives, if anywhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageResidency {
    /// Uploaded into an atlas slot
    Resident {
        atlas: AtlasIndex,
        slot: u32,
        indirection_address: u32,
    },
    /// Permanently unavailable; feedback for it is ignored
    Unavailable,
}

/// Result of an upload attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The page now occupies `slot`, displacing `evicted`
    Uploaded {
        slot: u32,
        evicted: Option<FeedbackInfo>,
    },
    /// Every slot of the atlas was already handed out this frame; the page
    /// went back to the end of the request queue
    Rejected,
}

struct AtlasEntry {
    info: AtlasInfo,
    image: ImageHandle,
}

/// Feedback buffer plus the ring it is copied into
struct FeedbackTarget {
    extent: UVec2,
    buffer: BufferHandle,
    readable: ReadableBufferHandle,
    size: u64,
}

/// Feedback-driven streaming of virtual texture pages into atlases
pub struct VirtualTextureManager<D: GpuDataTransfers> {
    config: StreamingConfig,
    device: Arc<Mutex<D>>,
    atlases: BlockArena<AtlasEntry>,
    indirection: IndirectionTable,
    indirection_buffer: BufferHandle,
    feedback: FeedbackTarget,
    decoder: FeedbackDecoder,
    pending: IndexSet<FeedbackInfo>,
    loaded: AHashMap<FeedbackInfo, PageResidency>,
    frame_number: u64,
    frame_stats: StreamingStats,
    /// Counters of all finished frames
    completed_stats: StreamingStats,
}

impl<D: GpuDataTransfers> VirtualTextureManager<D> {
    /// Create a manager rendering at `extent`
    pub fn new(config: StreamingConfig, extent: UVec2, device: Arc<Mutex<D>>) -> RendererResult<Self> {
        config.validate()?;

        let indirection = IndirectionTable::new(config.max_indirection_count);
        let (indirection_buffer, feedback, decoder) = {
            let mut device = device.lock();
            let indirection_buffer = device.create_buffer(&BufferDesc {
                label: "vistex_indirection".into(),
                size: indirection.size_in_bytes(),
                usage: BufferUsage::STORAGE | BufferUsage::COPY_DST,
            })?;
            device.fill_buffer(UNMAPPED, indirection.size_in_bytes(), indirection_buffer, 0)?;

            let (feedback, decoder) = Self::create_feedback_target(&mut *device, &config, extent)?;
            (indirection_buffer, feedback, decoder)
        };

        log::info!(
            "Virtual texture manager: {}x{} feedback blocks, {} indirection entries, {} cached frames",
            decoder.count_x(),
            decoder.count_y(),
            indirection.capacity(),
            config.max_cached_frames
        );

        Ok(Self {
            config,
            device,
            atlases: BlockArena::new(),
            indirection,
            indirection_buffer,
            feedback,
            decoder,
            pending: IndexSet::new(),
            loaded: AHashMap::new(),
            frame_number: 0,
            frame_stats: StreamingStats::default(),
            completed_stats: StreamingStats::default(),
        })
    }

    fn create_feedback_target(
        device: &mut D,
        config: &StreamingConfig,
        extent: UVec2,
    ) -> RendererResult<(FeedbackTarget, FeedbackDecoder)> {
        let decoder = FeedbackDecoder::for_extent(extent.x, extent.y, config.feedback_block_size);
        let size = decoder.buffer_size();

        let buffer = device.create_buffer(&BufferDesc {
            label: "vistex_feedback".into(),
            size,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
        })?;
        device.fill_buffer(FeedbackInfo::UNUSED.raw(), size, buffer, 0)?;
        let readable = device.create_readable_buffer(size, config.max_cached_frames)?;

        Ok((
            FeedbackTarget {
                extent,
                buffer,
                readable,
                size,
            },
            decoder,
        ))
    }

    /// Create an atlas of `page_count_x * page_count_y` slots
    pub fn create_atlas(
        &mut self,
        page_count_x: u32,
        page_count_y: u32,
        format: AtlasFormat,
    ) -> RendererResult<AtlasIndex> {
        let info = AtlasInfo::new(page_count_x, page_count_y, format);
        let extent = info.image_extent(self.config.page_size_with_borders());

        let image = self.device.lock().create_image(&ImageDesc {
            label: format!("vistex_atlas_{}", self.atlases.len()),
            extent,
            format,
        })?;
        let index = self.atlases.push(AtlasEntry { info, image });

        log::debug!(
            "Created atlas {index}: {page_count_x}x{page_count_y} slots of {format:?}, {}x{} texels",
            extent.x,
            extent.y
        );
        Ok(index)
    }

    /// Reserve `count` indirection entries for one texture and return the
    /// offset of the first
    pub fn create_new_indirection(&mut self, count: u32) -> RendererResult<u32> {
        Ok(self.indirection.allocate(count)?)
    }

    /// Process the feedback of a previous frame and prepare for the next one
    pub fn update_before_frame(&mut self) -> RendererResult<()> {
        self.frame_number += 1;
        let frame = self.frame_number;
        let _span = tracing::debug_span!("update_before_frame", frame).entered();
        self.completed_stats.accumulate(&self.frame_stats);
        self.frame_stats.reset();

        let ring_slot = (frame % self.config.max_cached_frames as u64) as u32;
        let mut device = self.device.lock();

        let mut valid_samples = 0;
        let decoder = &mut self.decoder;
        let resolved = device
            .read_back(self.feedback.readable, ring_slot, &mut |samples: &[u32]| {
                valid_samples = decoder.decode(samples);
            })
            .unwrap_or_else(|err| {
                log::warn!("Skipping feedback ring slot {ring_slot} at frame {frame}: {err}");
                false
            });

        if resolved {
            let mut queued = 0;
            for &page in decoder.distinct() {
                match self.loaded.get(&page) {
                    Some(PageResidency::Resident { atlas, slot, .. }) => {
                        if let Some(entry) = self.atlases.get_mut(*atlas) {
                            entry.info.update_entry_lru(*slot, frame);
                        }
                    }
                    Some(PageResidency::Unavailable) => {}
                    None => {
                        if self.pending.insert(page) {
                            queued += 1;
                        }
                    }
                }
            }

            self.frame_stats.feedback_samples += valid_samples as u64;
            self.frame_stats.distinct_pages += decoder.distinct().len() as u32;
            self.frame_stats.requests_queued += queued;
        } else {
            log::trace!("Feedback ring slot {ring_slot} not resolved at frame {frame}");
        }

        for entry in self.atlases.iter_mut() {
            entry.info.update_availabilities();
        }

        device.fill_buffer(
            FeedbackInfo::UNUSED.raw(),
            self.feedback.size,
            self.feedback.buffer,
            0,
        )?;
        device.request_buffer_readback(
            self.feedback.buffer,
            self.feedback.readable,
            ring_slot,
            self.feedback.size,
        )?;

        log::debug!(
            "Frame {frame}: {} samples, {} distinct pages, {} queued, {} pending",
            self.frame_stats.feedback_samples,
            self.frame_stats.distinct_pages,
            self.frame_stats.requests_queued,
            self.pending.len()
        );
        Ok(())
    }

    /// Upload a page into the least recently used slot of an atlas.
    ///
    /// `pixels` holds the page with its borders, tightly packed in the
    /// atlas format. The page's indirection entry is
    /// `indirection_offset + indirection_id(slice_x, slice_y, ...)`.
    #[allow(clippy::too_many_arguments)]
    pub fn upload_data(
        &mut self,
        atlas_index: AtlasIndex,
        pixels: &[u8],
        extent: UVec2,
        slice_x: u32,
        slice_y: u32,
        mip_level: u32,
        slice_count_x: u32,
        slice_count_y: u32,
        indirection_offset: u32,
        feedback: FeedbackInfo,
    ) -> RendererResult<UploadOutcome> {
        let slot_size = self.config.page_size_with_borders();
        if extent.x > slot_size || extent.y > slot_size {
            log::error!(
                "Page {feedback} is {}x{}, larger than the {slot_size}x{slot_size} atlas slot; skipping upload",
                extent.x,
                extent.y
            );
            return Err(StreamingError::SliceTooLarge {
                width: extent.x,
                height: extent.y,
                max: slot_size,
            }
            .into());
        }

        let address = indirection_id(slice_x, slice_y, slice_count_x, slice_count_y, mip_level)
            .and_then(|id| indirection_offset.checked_add(id))
            .filter(|&address| address < self.indirection.capacity())
            .ok_or(StreamingError::IndirectionOutOfRange {
                address: indirection_offset,
                capacity: self.indirection.capacity(),
            })?;

        let frame = self.frame_number;
        let entry = self
            .atlases
            .get_mut(atlas_index)
            .ok_or(StreamingError::AtlasNotFound(atlas_index))?;

        let expected = entry.info.format().bytes_for_extent(extent.x, extent.y);
        if (pixels.len() as u64) < expected {
            log::error!(
                "Page {feedback} has {} bytes of pixels, {expected} needed; skipping upload",
                pixels.len()
            );
            return Err(RendererError::TransferOutOfBounds {
                resource: format!("pixels of {feedback}"),
                offset: 0,
                size: expected,
                capacity: pixels.len() as u64,
            });
        }

        let Some(allocation) = entry.info.get_next_entry(feedback, frame) else {
            self.reject_request(feedback);
            return Ok(UploadOutcome::Rejected);
        };
        let origin = entry.info.slot_origin(allocation.slot, slot_size);
        let image = entry.image;

        let mut device = self.device.lock();

        let pushed = device.push_data_to_image(&ImageUpload {
            pixels,
            image,
            copy_size: extent,
            image_offset: origin,
        });
        if let Err(err) = pushed {
            if let Some(entry) = self.atlases.get_mut(atlas_index) {
                entry.info.revert_entry(&allocation);
            }
            log::error!("Upload of {feedback} into atlas {atlas_index} failed: {err}");
            return Err(err);
        }

        if let Some(evicted) = allocation.evicted {
            let occupied_here = matches!(
                self.loaded.get(&evicted),
                Some(PageResidency::Resident { atlas, slot, .. })
                    if *atlas == atlas_index && *slot == allocation.slot
            );
            if occupied_here {
                if let Some(PageResidency::Resident {
                    indirection_address, ..
                }) = self.loaded.remove(&evicted)
                {
                    if indirection_address != address {
                        self.indirection.clear(indirection_address)?;
                        device.push_data_to_buffer(
                            bytemuck::bytes_of(&UNMAPPED),
                            self.indirection_buffer,
                            indirection_address as u64 * 4,
                        )?;
                    }
                }
                log::trace!("Evicted {evicted} from atlas {atlas_index} slot {}", allocation.slot);
            }
        }

        self.indirection.set(address, allocation.slot)?;
        device.push_data_to_buffer(
            bytemuck::bytes_of(&allocation.slot),
            self.indirection_buffer,
            address as u64 * 4,
        )?;

        self.loaded.insert(
            feedback,
            PageResidency::Resident {
                atlas: atlas_index,
                slot: allocation.slot,
                indirection_address: address,
            },
        );
        self.pending.shift_remove(&feedback);

        self.frame_stats.uploads += 1;
        self.frame_stats.evictions += allocation.evicted.is_some() as u32;
        self.frame_stats.bytes_uploaded += pixels.len() as u64;

        Ok(UploadOutcome::Uploaded {
            slot: allocation.slot,
            evicted: allocation.evicted,
        })
    }

    /// Give up on a page for this frame; it goes to the back of the queue
    pub fn reject_request(&mut self, feedback: FeedbackInfo) {
        if self.loaded.contains_key(&feedback) {
            return;
        }

        log::warn!("Rejected {feedback}: no atlas slot left this frame");
        self.pending.shift_remove(&feedback);
        self.pending.insert(feedback);

        self.frame_stats.rejections += 1;
    }

    /// Stop streaming a page that can never be loaded
    pub fn discard_request(&mut self, feedback: FeedbackInfo) -> RendererResult<()> {
        self.pending.shift_remove(&feedback);

        let previous = self.loaded.insert(feedback, PageResidency::Unavailable);
        if let Some(PageResidency::Resident {
            indirection_address, ..
        }) = previous
        {
            self.indirection.clear(indirection_address)?;
            self.device.lock().push_data_to_buffer(
                bytemuck::bytes_of(&UNMAPPED),
                self.indirection_buffer,
                indirection_address as u64 * 4,
            )?;
        }

        log::debug!("Discarded {feedback}");
        Ok(())
    }

    /// Move up to `max_count` requests from the front of the queue into
    /// `out`. Returns how many were moved.
    pub fn get_requested_slices(&mut self, out: &mut Vec<FeedbackInfo>, max_count: usize) -> usize {
        let count = max_count.min(self.pending.len());
        out.extend(self.pending.drain(..count));
        count
    }

    /// Recreate the feedback buffers for a new render extent.
    ///
    /// Copies still in flight for the old extent are dropped.
    pub fn resize(&mut self, extent: UVec2) -> RendererResult<()> {
        if extent == self.feedback.extent {
            return Ok(());
        }

        let mut device = self.device.lock();
        device.destroy_buffer(self.feedback.buffer);
        device.destroy_readable_buffer(self.feedback.readable);

        let (feedback, decoder) = Self::create_feedback_target(&mut *device, &self.config, extent)?;
        self.feedback = feedback;
        self.decoder = decoder;

        log::debug!(
            "Resized feedback to {}x{}: {}x{} blocks",
            extent.x,
            extent.y,
            self.decoder.count_x(),
            self.decoder.count_y()
        );
        Ok(())
    }

    /// Image backing an atlas
    pub fn atlas_image(&self, atlas_index: AtlasIndex) -> Option<ImageHandle> {
        self.atlases.get(atlas_index).map(|entry| entry.image)
    }

    /// Slot bookkeeping of an atlas
    pub fn atlas(&self, atlas_index: AtlasIndex) -> Option<&AtlasInfo> {
        self.atlases.get(atlas_index).map(|entry| &entry.info)
    }

    pub fn atlas_count(&self) -> usize {
        self.atlases.len()
    }

    /// Buffer shaders write feedback into
    pub fn feedback_buffer(&self) -> BufferHandle {
        self.feedback.buffer
    }

    /// Shader-visible indirection table
    pub fn indirection_buffer(&self) -> BufferHandle {
        self.indirection_buffer
    }

    /// Feedback blocks per row and column
    pub fn feedback_block_counts(&self) -> UVec2 {
        UVec2::new(self.decoder.count_x(), self.decoder.count_y())
    }

    pub fn residency(&self, feedback: FeedbackInfo) -> Option<PageResidency> {
        self.loaded.get(&feedback).copied()
    }

    pub fn is_pending(&self, feedback: FeedbackInfo) -> bool {
        self.pending.contains(&feedback)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// CPU copy of an indirection entry, `None` when unmapped
    pub fn indirection_entry(&self, address: u32) -> Option<u32> {
        self.indirection.get(address).filter(|&entry| entry != UNMAPPED)
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Counters for the current frame
    pub fn stats(&self) -> &StreamingStats {
        &self.frame_stats
    }

    /// Counters since creation
    pub fn total_stats(&self) -> StreamingStats {
        let mut total = self.completed_stats.clone();
        total.accumulate(&self.frame_stats);
        total
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    const SLOT: u32 = 264;

    struct Harness {
        device: Arc<Mutex<HeadlessDevice>>,
        manager: VirtualTextureManager<HeadlessDevice>,
        pixels: Vec<u8>,
    }

    impl Harness {
        fn new(max_cached_frames: u32) -> Self {
            let device = Arc::new(Mutex::new(HeadlessDevice::new()));
            let config = StreamingConfig {
                max_cached_frames,
                ..StreamingConfig::default()
            };
            let manager = VirtualTextureManager::new(config, UVec2::new(96, 48), device.clone()).unwrap();

            Self {
                device,
                manager,
                pixels: vec![0; (SLOT * SLOT * 4) as usize],
            }
        }

        /// One frame: update, then the shader writes `pages`, then the GPU
        /// finishes the frame
        fn frame(&mut self, pages: &[FeedbackInfo]) {
            self.manager.update_before_frame().unwrap();
            let raws: Vec<u32> = pages.iter().map(|page| page.raw()).collect();
            let mut device = self.device.lock();
            device
                .write_buffer_u32(self.manager.feedback_buffer(), 0, &raws)
                .unwrap();
            device.submit_frame();
        }

        fn upload(&mut self, atlas: AtlasIndex, page: FeedbackInfo, offset: u32) -> UploadOutcome {
            self.manager
                .upload_data(
                    atlas,
                    &self.pixels,
                    UVec2::splat(SLOT),
                    page.slice_x() as u32,
                    page.slice_y() as u32,
                    page.mip_level() as u32,
                    8,
                    8,
                    offset,
                    page,
                )
                .unwrap()
        }

        fn indirection_word(&self, address: u32) -> u32 {
            let device = self.device.lock();
            device.buffer_u32(self.manager.indirection_buffer()).unwrap()[address as usize]
        }
    }

    fn page(x: u8, y: u8) -> FeedbackInfo {
        FeedbackInfo::new(1, 0, x, y)
    }

    #[test]
    fn test_new_manager_buffers() {
        let harness = Harness::new(2);
        let device = harness.device.lock();

        let indirection = device.buffer_u32(harness.manager.indirection_buffer()).unwrap();
        assert_eq!(indirection.len(), 32768);
        assert!(indirection.iter().all(|&entry| entry == UNMAPPED));

        // 96x48 at 24 pixels per block: 5x3 blocks of 3 samples
        assert_eq!(harness.manager.feedback_block_counts(), UVec2::new(5, 3));
        let feedback = device.buffer_u32(harness.manager.feedback_buffer()).unwrap();
        assert_eq!(feedback.len(), 45);
        assert!(feedback.iter().all(|&sample| sample == u32::MAX));
        assert_eq!(device.readable_count(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let device = Arc::new(Mutex::new(HeadlessDevice::new()));
        let config = StreamingConfig {
            max_cached_frames: 0,
            ..StreamingConfig::default()
        };
        let result = VirtualTextureManager::new(config, UVec2::new(64, 64), device);
        assert!(matches!(
            result,
            Err(RendererError::Streaming(StreamingError::InvalidConfig(_)))
        ));
    }

    #[test]
    fn test_create_atlas_image() {
        let mut harness = Harness::new(1);
        let atlas = harness.manager.create_atlas(4, 2, AtlasFormat::Bc1RgbaUnormSrgb).unwrap();
        let second = harness.manager.create_atlas(1, 1, AtlasFormat::Rgba8Unorm).unwrap();
        assert_eq!((atlas, second), (0, 1));

        let image = harness.manager.atlas_image(atlas).unwrap();
        let device = harness.device.lock();
        let desc = device.image_desc(image).unwrap();
        assert_eq!(desc.extent, UVec2::new(4 * SLOT, 2 * SLOT));
        assert_eq!(desc.format, AtlasFormat::Bc1RgbaUnormSrgb);
        assert_eq!(harness.manager.atlas(atlas).unwrap().slot_count(), 8);
        assert!(harness.manager.atlas_image(5).is_none());
    }

    #[test]
    fn test_feedback_queues_pages_and_parents() {
        let mut harness = Harness::new(1);
        let a = page(0, 0);
        let b = page(3, 1);

        // Repeats of the same page collapse to one request
        harness.frame(&[a, a, a, b]);
        assert_eq!(harness.manager.pending_count(), 0);

        harness.frame(&[]);
        assert_eq!(harness.manager.frame_number(), 2);
        assert!(harness.manager.is_pending(a));
        assert!(harness.manager.is_pending(b));
        assert!(harness.manager.is_pending(a.parent().unwrap()));
        assert!(harness.manager.is_pending(b.parent().unwrap()));
        assert_eq!(harness.manager.pending_count(), 4);

        let stats = harness.manager.stats();
        assert_eq!(stats.feedback_samples, 4);
        assert_eq!(stats.distinct_pages, 4);
        assert_eq!(stats.requests_queued, 4);
    }

    #[test]
    fn test_pending_queue_has_no_duplicates() {
        let mut harness = Harness::new(1);
        let a = page(2, 2);

        harness.frame(&[a]);
        harness.frame(&[a]);
        harness.frame(&[a]);
        assert_eq!(harness.manager.pending_count(), 2);
        assert_eq!(harness.manager.stats().requests_queued, 0);

        let mut out = Vec::new();
        assert_eq!(harness.manager.get_requested_slices(&mut out, 16), 2);
        assert_eq!(out.iter().filter(|&&p| p == a).count(), 1);
    }

    #[test]
    fn test_empty_feedback_requests_nothing() {
        let mut harness = Harness::new(1);
        for _ in 0..3 {
            harness.frame(&[]);
        }
        assert_eq!(harness.manager.pending_count(), 0);
        assert_eq!(harness.manager.total_stats().feedback_samples, 0);
    }

    #[test]
    fn test_feedback_cleared_each_frame() {
        let mut harness = Harness::new(1);
        harness.frame(&[page(1, 1)]);
        harness.manager.update_before_frame().unwrap();

        let device = harness.device.lock();
        let feedback = device.buffer_u32(harness.manager.feedback_buffer()).unwrap();
        assert!(feedback.iter().all(|&sample| sample == u32::MAX));
        assert_eq!(device.stats().readback_requests, 2);
    }

    #[test]
    fn test_multi_buffered_readback_latency() {
        let mut harness = Harness::new(2);
        let a = page(4, 4);

        // Frame 1 copies into ring slot 1, read back again at frame 3
        harness.frame(&[a]);
        harness.frame(&[]);
        assert!(!harness.manager.is_pending(a));

        harness.frame(&[]);
        assert!(harness.manager.is_pending(a));
    }

    #[test]
    fn test_get_requested_slices_keeps_remainder() {
        let mut harness = Harness::new(1);
        let pages: Vec<FeedbackInfo> = (0..3).map(|x| FeedbackInfo::new(1, 4, x * 2, 0)).collect();
        harness.frame(&pages);
        harness.frame(&[]);
        assert_eq!(harness.manager.pending_count(), 6);

        let mut out = Vec::new();
        assert_eq!(harness.manager.get_requested_slices(&mut out, 4), 4);
        assert_eq!(harness.manager.pending_count(), 2);

        assert_eq!(harness.manager.get_requested_slices(&mut out, 4), 2);
        assert_eq!(out.len(), 6);
        assert_eq!(harness.manager.pending_count(), 0);
        assert_eq!(harness.manager.get_requested_slices(&mut out, 4), 0);
    }

    #[test]
    fn test_upload_writes_slot_and_indirection() {
        let mut harness = Harness::new(1);
        let atlas = harness.manager.create_atlas(2, 2, AtlasFormat::Rgba8Unorm).unwrap();
        let offset = harness.manager.create_new_indirection(85).unwrap();
        harness.frame(&[]);

        let target = page(3, 2);
        let outcome = harness.upload(atlas, target, offset);
        assert_eq!(outcome, UploadOutcome::Uploaded { slot: 0, evicted: None });

        // id(3, 2) in an 8x8 grid
        assert_eq!(harness.manager.indirection_entry(offset + 19), Some(0));
        assert_eq!(harness.indirection_word(offset + 19), 0);
        assert_eq!(
            harness.manager.residency(target),
            Some(PageResidency::Resident {
                atlas,
                slot: 0,
                indirection_address: offset + 19,
            })
        );

        let second = harness.upload(atlas, page(4, 2), offset);
        assert_eq!(second, UploadOutcome::Uploaded { slot: 1, evicted: None });

        let image = harness.manager.atlas_image(atlas).unwrap();
        let device = harness.device.lock();
        let uploads = device.image_uploads(image);
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[1].image_offset, UVec2::new(SLOT, 0));
        assert_eq!(uploads[1].copy_size, UVec2::splat(SLOT));
    }

    #[test]
    fn test_upload_removes_pending_entry() {
        let mut harness = Harness::new(1);
        let atlas = harness.manager.create_atlas(2, 2, AtlasFormat::Rgba8Unorm).unwrap();
        let a = page(1, 0);

        harness.frame(&[a]);
        harness.frame(&[]);
        assert!(harness.manager.is_pending(a));

        harness.upload(atlas, a, 0);
        assert!(!harness.manager.is_pending(a));

        // Feedback for a resident page refreshes its LRU instead of queueing it
        harness.frame(&[a]);
        harness.frame(&[]);
        assert!(!harness.manager.is_pending(a));
        assert_eq!(harness.manager.atlas(atlas).unwrap().lru(0), Some(4));
    }

    #[test]
    fn test_full_atlas_rejects_then_evicts_oldest() {
        let mut harness = Harness::new(1);
        let atlas = harness.manager.create_atlas(2, 2, AtlasFormat::Rgba8Unorm).unwrap();
        let [a, b, c, d, e] = [page(0, 0), page(1, 0), page(2, 0), page(3, 0), page(4, 0)];

        harness.manager.update_before_frame().unwrap();
        for (slot, p) in [a, b, c, d].into_iter().enumerate() {
            assert_eq!(
                harness.upload(atlas, p, 0),
                UploadOutcome::Uploaded {
                    slot: slot as u32,
                    evicted: None,
                }
            );
        }

        // Every slot was handed out this frame
        assert_eq!(harness.upload(atlas, e, 0), UploadOutcome::Rejected);
        assert!(harness.manager.residency(e).is_none());
        assert!(harness.manager.is_pending(e));
        assert_eq!(harness.manager.stats().rejections, 1);

        // B, C and D are sampled during the frame, A is not
        {
            let mut device = harness.device.lock();
            let raws = [b, c, d].map(FeedbackInfo::raw);
            device
                .write_buffer_u32(harness.manager.feedback_buffer(), 0, &raws)
                .unwrap();
            device.submit_frame();
        }

        harness.manager.update_before_frame().unwrap();
        let mut out = Vec::new();
        harness.manager.get_requested_slices(&mut out, 1);
        assert_eq!(out, vec![e]);

        assert_eq!(
            harness.upload(atlas, e, 0),
            UploadOutcome::Uploaded {
                slot: 0,
                evicted: Some(a),
            }
        );
        assert!(harness.manager.residency(a).is_none());
        assert_eq!(harness.manager.stats().evictions, 1);

        // A's indirection entry no longer points at E's pixels
        assert_eq!(harness.manager.indirection_entry(0), None);
        assert_eq!(harness.indirection_word(0), UNMAPPED);
        assert_eq!(harness.manager.indirection_entry(4), Some(0));
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut harness = Harness::new(1);
        let atlas = harness.manager.create_atlas(4, 1, AtlasFormat::Rgba8Unorm).unwrap();
        let pages: Vec<FeedbackInfo> = (0..4).map(|x| page(x, 0)).collect();

        harness.frame(&[]);
        for &p in &pages {
            harness.upload(atlas, p, 0);
        }

        // Touch in reverse order so slot 3 ends up the oldest
        harness.frame(&[pages[3]]);
        harness.frame(&[pages[2]]);
        harness.frame(&[pages[1]]);
        harness.frame(&[pages[0]]);
        harness.manager.update_before_frame().unwrap();

        let mut evicted = Vec::new();
        for x in 4..8 {
            match harness.upload(atlas, page(x, 0), 0) {
                UploadOutcome::Uploaded { evicted: Some(old), .. } => evicted.push(old),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(evicted, vec![pages[3], pages[2], pages[1], pages[0]]);
        assert!(pages.iter().all(|&p| harness.manager.residency(p).is_none()));
    }

    #[test]
    fn test_reject_request_requeues_at_back() {
        let mut harness = Harness::new(1);
        let [a, b, c] = [page(0, 5), page(1, 5), page(2, 5)];
        harness.frame(&[a, b, c]);
        harness.frame(&[]);

        let mut out = Vec::new();
        harness.manager.get_requested_slices(&mut out, 1);
        let first = out[0];

        harness.manager.reject_request(first);
        assert!(harness.manager.residency(first).is_none());
        assert!(harness.manager.is_pending(first));

        // Everything else drains before the rejected page resurfaces
        out.clear();
        let remaining = harness.manager.pending_count();
        harness.manager.get_requested_slices(&mut out, remaining);
        assert_eq!(out.last(), Some(&first));
    }

    #[test]
    fn test_slice_too_large_skips_upload() {
        let mut harness = Harness::new(1);
        let atlas = harness.manager.create_atlas(2, 2, AtlasFormat::Rgba8Unorm).unwrap();
        harness.frame(&[]);

        let pixels = vec![0; (300 * 300 * 4) as usize];
        let result = harness
            .manager
            .upload_data(atlas, &pixels, UVec2::new(300, 264), 0, 0, 0, 8, 8, 0, page(0, 0));
        assert!(matches!(
            result,
            Err(RendererError::Streaming(StreamingError::SliceTooLarge {
                width: 300,
                height: 264,
                max: 264,
            }))
        ));

        // No slot was consumed
        assert_eq!(harness.manager.atlas(atlas).unwrap().remaining_this_frame(), 4);
        let image = harness.manager.atlas_image(atlas).unwrap();
        assert!(harness.device.lock().image_uploads(image).is_empty());
    }

    #[test]
    fn test_unknown_atlas() {
        let mut harness = Harness::new(1);
        let result = harness.manager.upload_data(
            3,
            &harness.pixels,
            UVec2::splat(SLOT),
            0,
            0,
            0,
            8,
            8,
            0,
            page(0, 0),
        );
        assert!(matches!(
            result,
            Err(RendererError::Streaming(StreamingError::AtlasNotFound(3)))
        ));
    }

    #[test]
    fn test_indirection_allocation_overflow() {
        let device = Arc::new(Mutex::new(HeadlessDevice::new()));
        let config = StreamingConfig {
            max_indirection_count: 100,
            ..StreamingConfig::default()
        };
        let mut manager = VirtualTextureManager::new(config, UVec2::new(64, 64), device).unwrap();

        assert_eq!(manager.create_new_indirection(93).unwrap(), 0);
        assert!(matches!(
            manager.create_new_indirection(93),
            Err(RendererError::Streaming(StreamingError::IndirectionCapacityExceeded {
                offset: 93,
                requested: 93,
                capacity: 100,
            }))
        ));
        assert_eq!(manager.create_new_indirection(7).unwrap(), 93);
    }

    #[test]
    fn test_discard_request() {
        let mut harness = Harness::new(1);
        let atlas = harness.manager.create_atlas(2, 2, AtlasFormat::Rgba8Unorm).unwrap();
        let missing = FeedbackInfo::new(9, 0, 0, 0);
        let resident = page(1, 1);

        harness.frame(&[missing]);
        harness.frame(&[]);
        harness.manager.discard_request(missing).unwrap();
        assert!(!harness.manager.is_pending(missing));
        assert_eq!(harness.manager.residency(missing), Some(PageResidency::Unavailable));

        harness.upload(atlas, resident, 0);
        harness.manager.discard_request(resident).unwrap();
        assert_eq!(harness.manager.indirection_entry(9), None);
        assert_eq!(harness.indirection_word(9), UNMAPPED);

        // Feedback for discarded pages is ignored
        harness.frame(&[missing, resident]);
        harness.frame(&[]);
        assert!(!harness.manager.is_pending(missing));
        assert!(!harness.manager.is_pending(resident));
    }

    #[test]
    fn test_resize_recreates_feedback() {
        let mut harness = Harness::new(2);
        let old_buffer = harness.manager.feedback_buffer();
        harness.frame(&[page(0, 0)]);

        harness.manager.resize(UVec2::new(1920, 1080)).unwrap();
        assert_ne!(harness.manager.feedback_buffer(), old_buffer);
        assert_eq!(harness.manager.feedback_block_counts(), UVec2::new(81, 46));

        let device = harness.device.lock();
        assert!(device.buffer_u32(old_buffer).is_none());
        let feedback = device.buffer_u32(harness.manager.feedback_buffer()).unwrap();
        assert_eq!(feedback.len(), 81 * 46 * 3);
        assert!(feedback.iter().all(|&sample| sample == u32::MAX));
        assert_eq!(device.readable_count(), 1);
        drop(device);

        // Same extent is a no-op
        let buffer = harness.manager.feedback_buffer();
        harness.manager.resize(UVec2::new(1920, 1080)).unwrap();
        assert_eq!(harness.manager.feedback_buffer(), buffer);

        // The old frame's feedback never surfaces
        harness.frame(&[]);
        harness.frame(&[]);
        assert_eq!(harness.manager.pending_count(), 0);
    }

    #[test]
    fn test_bytes_uploaded_stats() {
        let mut harness = Harness::new(1);
        let atlas = harness.manager.create_atlas(1, 1, AtlasFormat::Rgba8Unorm).unwrap();
        harness.frame(&[]);
        harness.upload(atlas, page(0, 0), 0);

        let expected = (SLOT * SLOT * 4) as u64;
        assert_eq!(harness.manager.stats().bytes_uploaded, expected);
        harness.frame(&[]);
        assert_eq!(harness.manager.stats().bytes_uploaded, 0);
        assert_eq!(harness.manager.total_stats().bytes_uploaded, expected);
        assert_eq!(harness.manager.total_stats().uploads, 1);
    }

    #[test]
    fn test_short_pixel_buffer_keeps_previous_occupant() {
        let mut harness = Harness::new(1);
        let atlas = harness.manager.create_atlas(1, 1, AtlasFormat::Rgba8Unorm).unwrap();
        let [a, b] = [page(0, 0), page(1, 0)];

        harness.frame(&[]);
        harness.upload(atlas, a, 0);
        harness.frame(&[]);

        let result = harness
            .manager
            .upload_data(atlas, &[0; 16], UVec2::splat(SLOT), 1, 0, 0, 8, 8, 0, b);
        assert!(matches!(
            result,
            Err(RendererError::TransferOutOfBounds { capacity: 16, .. })
        ));

        let info = harness.manager.atlas(atlas).unwrap();
        assert_eq!(info.current_slice(0), Some(a));
        assert_eq!(info.remaining_this_frame(), 1);
        assert!(matches!(harness.manager.residency(a), Some(PageResidency::Resident { slot: 0, .. })));
        assert!(harness.manager.residency(b).is_none());
        assert_eq!(harness.manager.indirection_entry(0), Some(0));
        assert_eq!(harness.indirection_word(0), 0);
    }

    /// Headless device whose next readback or image upload can be made to fail
    #[derive(Default)]
    struct FlakyDevice {
        inner: HeadlessDevice,
        fail_read_back: bool,
        fail_image_push: bool,
    }

    impl GpuDataTransfers for FlakyDevice {
        fn create_image(&mut self, desc: &ImageDesc) -> RendererResult<ImageHandle> {
            self.inner.create_image(desc)
        }

        fn create_buffer(&mut self, desc: &BufferDesc) -> RendererResult<BufferHandle> {
            self.inner.create_buffer(desc)
        }

        fn create_readable_buffer(&mut self, size: u64, ring_len: u32) -> RendererResult<ReadableBufferHandle> {
            self.inner.create_readable_buffer(size, ring_len)
        }

        fn destroy_buffer(&mut self, buffer: BufferHandle) {
            self.inner.destroy_buffer(buffer)
        }

        fn destroy_readable_buffer(&mut self, readable: ReadableBufferHandle) {
            self.inner.destroy_readable_buffer(readable)
        }

        fn push_data_to_buffer(&mut self, data: &[u8], buffer: BufferHandle, offset: u64) -> RendererResult<()> {
            self.inner.push_data_to_buffer(data, buffer, offset)
        }

        fn fill_buffer(&mut self, value: u32, size: u64, buffer: BufferHandle, offset: u64) -> RendererResult<()> {
            self.inner.fill_buffer(value, size, buffer, offset)
        }

        fn push_data_to_image(&mut self, upload: &ImageUpload<'_>) -> RendererResult<()> {
            if std::mem::take(&mut self.fail_image_push) {
                return Err(RendererError::ResourceNotFound("image lost".into()));
            }
            self.inner.push_data_to_image(upload)
        }

        fn request_buffer_readback(
            &mut self,
            src: BufferHandle,
            dst: ReadableBufferHandle,
            ring_slot: u32,
            size: u64,
        ) -> RendererResult<()> {
            self.inner.request_buffer_readback(src, dst, ring_slot, size)
        }

        fn read_back(
            &mut self,
            readable: ReadableBufferHandle,
            ring_slot: u32,
            reader: &mut dyn FnMut(&[u32]),
        ) -> RendererResult<bool> {
            if std::mem::take(&mut self.fail_read_back) {
                return Err(RendererError::Readback("mapping failed".into()));
            }
            self.inner.read_back(readable, ring_slot, reader)
        }
    }

    fn flaky_manager() -> (Arc<Mutex<FlakyDevice>>, VirtualTextureManager<FlakyDevice>, AtlasIndex) {
        let device = Arc::new(Mutex::new(FlakyDevice::default()));
        let config = StreamingConfig {
            max_cached_frames: 1,
            ..StreamingConfig::default()
        };
        let mut manager = VirtualTextureManager::new(config, UVec2::new(96, 48), device.clone()).unwrap();
        let atlas = manager.create_atlas(1, 1, AtlasFormat::Rgba8Unorm).unwrap();
        (device, manager, atlas)
    }

    fn upload_page<D: GpuDataTransfers>(
        manager: &mut VirtualTextureManager<D>,
        atlas: AtlasIndex,
        page: FeedbackInfo,
    ) -> RendererResult<UploadOutcome> {
        let pixels = vec![0; (SLOT * SLOT * 4) as usize];
        manager.upload_data(
            atlas,
            &pixels,
            UVec2::splat(SLOT),
            page.slice_x() as u32,
            page.slice_y() as u32,
            page.mip_level() as u32,
            8,
            8,
            0,
            page,
        )
    }

    #[test]
    fn test_failed_image_push_restores_slot() {
        let (device, mut manager, atlas) = flaky_manager();
        let [a, b] = [page(0, 0), page(1, 0)];

        manager.update_before_frame().unwrap();
        upload_page(&mut manager, atlas, a).unwrap();
        manager.update_before_frame().unwrap();

        device.lock().fail_image_push = true;
        assert!(upload_page(&mut manager, atlas, b).is_err());

        let info = manager.atlas(atlas).unwrap();
        assert_eq!(info.current_slice(0), Some(a));
        assert_eq!(info.lru(0), Some(1));
        assert_eq!(info.remaining_this_frame(), 1);
        assert!(manager.residency(a).is_some());
        assert!(manager.residency(b).is_none());
        assert_eq!(manager.indirection_entry(0), Some(0));

        // The slot can still be used this frame
        assert_eq!(
            upload_page(&mut manager, atlas, b).unwrap(),
            UploadOutcome::Uploaded {
                slot: 0,
                evicted: Some(a),
            }
        );
    }

    #[test]
    fn test_failed_readback_does_not_stall_frame() {
        let (device, mut manager, atlas) = flaky_manager();

        manager.update_before_frame().unwrap();
        upload_page(&mut manager, atlas, page(0, 0)).unwrap();
        device.lock().inner.submit_frame();

        device.lock().fail_read_back = true;
        manager.update_before_frame().unwrap();

        // The frame still aged the atlas and scheduled its own copy
        assert_eq!(manager.atlas(atlas).unwrap().remaining_this_frame(), 1);
        assert_eq!(device.lock().inner.stats().readback_requests, 2);
        assert_eq!(
            upload_page(&mut manager, atlas, page(1, 0)).unwrap(),
            UploadOutcome::Uploaded {
                slot: 0,
                evicted: Some(page(0, 0)),
            }
        );
    }

    #[test]
    fn test_total_stats_include_current_frame() {
        let (_device, mut manager, atlas) = flaky_manager();

        manager.update_before_frame().unwrap();
        upload_page(&mut manager, atlas, page(0, 0)).unwrap();
        manager.update_before_frame().unwrap();
        upload_page(&mut manager, atlas, page(1, 0)).unwrap();

        assert_eq!(manager.stats().uploads, 1);
        let total = manager.total_stats();
        assert_eq!(total.uploads, 2);
        assert_eq!(total.evictions, 1);
    }

    #[test]
    fn test_indirection_id_overflow_is_out_of_range() {
        let mut harness = Harness::new(1);
        let atlas = harness.manager.create_atlas(1, 1, AtlasFormat::Rgba8Unorm).unwrap();
        harness.frame(&[]);

        let pixels = harness.pixels.clone();
        let result = harness.manager.upload_data(
            atlas,
            &pixels,
            UVec2::splat(SLOT),
            0,
            1 << 20,
            0,
            1 << 16,
            1 << 16,
            0,
            page(0, 0),
        );
        assert!(matches!(
            result,
            Err(RendererError::Streaming(StreamingError::IndirectionOutOfRange { .. }))
        ));
        assert_eq!(harness.manager.atlas(atlas).unwrap().remaining_this_frame(), 1);
    }
}
