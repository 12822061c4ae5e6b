//! Atlas
//!
//! Physical page slots with least-recently-used eviction.
//!
//! Slots are sorted by last-touched frame once per frame; allocations then
//! walk that order with a cursor, so a slot is handed out at most once per
//! frame and the sort cost is paid once instead of per request.

use glam::UVec2;
use serde::{Deserialize, Serialize};

use crate::feedback::FeedbackInfo;

/// Pixel formats an atlas can be created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtlasFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    /// BC1, 8 bytes per 4x4 block
    Bc1RgbaUnormSrgb,
    /// BC3, 16 bytes per 4x4 block
    Bc3RgbaUnorm,
    /// BC5, 16 bytes per 4x4 block
    Bc5RgUnorm,
}

impl AtlasFormat {
    /// Check if the format is block compressed
    pub fn is_compressed(&self) -> bool {
        !matches!(self, Self::Rgba8Unorm | Self::Rgba8UnormSrgb)
    }

    /// Texel block dimensions (1x1 for uncompressed formats)
    pub fn block_dimensions(&self) -> (u32, u32) {
        if self.is_compressed() { (4, 4) } else { (1, 1) }
    }

    /// Bytes per texel block
    pub fn block_size(&self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Rgba8UnormSrgb => 4,
            Self::Bc1RgbaUnormSrgb => 8,
            Self::Bc3RgbaUnorm | Self::Bc5RgUnorm => 16,
        }
    }

    /// Bytes in one row of blocks covering `width` texels
    pub fn bytes_per_row(&self, width: u32) -> u32 {
        let (block_width, _) = self.block_dimensions();
        width.div_ceil(block_width) * self.block_size()
    }

    /// Bytes needed for a `width x height` region
    pub fn bytes_for_extent(&self, width: u32, height: u32) -> u64 {
        let (_, block_height) = self.block_dimensions();
        self.bytes_per_row(width) as u64 * height.div_ceil(block_height) as u64
    }
}

/// Result of handing out a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAllocation {
    /// Slot index in the atlas grid
    pub slot: u32,
    /// Page that occupied the slot before, if any
    pub evicted: Option<FeedbackInfo>,
    /// LRU stamp of the slot before it was handed out
    pub previous_lru: u64,
}

/// Slot bookkeeping for one atlas.
///
/// The device image is owned by the renderer; this type only tracks which
/// page lives where and when it was last used.
#[derive(Debug, Clone)]
pub struct AtlasInfo {
    format: AtlasFormat,
    page_count_x: u32,
    page_count_y: u32,
    /// Last frame each slot was allocated or sampled
    lrus: Vec<u64>,
    /// Slot indices sorted by ascending LRU, refreshed once per frame
    sorted_availabilities: Vec<u32>,
    /// Page currently stored in each slot
    current_slices: Vec<FeedbackInfo>,
    /// How many entries of `sorted_availabilities` were handed out this frame
    next_sorted_entry: usize,
}

impl AtlasInfo {
    /// Create bookkeeping for a `page_count_x * page_count_y` grid of empty slots
    pub fn new(page_count_x: u32, page_count_y: u32, format: AtlasFormat) -> Self {
        let slot_count = page_count_x as usize * page_count_y as usize;

        Self {
            format,
            page_count_x,
            page_count_y,
            lrus: vec![0; slot_count],
            sorted_availabilities: (0..slot_count as u32).collect(),
            current_slices: vec![FeedbackInfo::UNUSED; slot_count],
            next_sorted_entry: 0,
        }
    }

    pub fn format(&self) -> AtlasFormat {
        self.format
    }

    pub fn page_count_x(&self) -> u32 {
        self.page_count_x
    }

    pub fn page_count_y(&self) -> u32 {
        self.page_count_y
    }

    /// Total number of slots
    pub fn slot_count(&self) -> u32 {
        self.lrus.len() as u32
    }

    /// Slots still available this frame
    pub fn remaining_this_frame(&self) -> u32 {
        (self.sorted_availabilities.len() - self.next_sorted_entry) as u32
    }

    /// Re-sort slots by age and reset the per-frame cursor.
    ///
    /// The sort is stable so slots with equal timestamps keep index order.
    pub fn update_availabilities(&mut self) {
        let lrus = &self.lrus;
        self.sorted_availabilities
            .sort_by_key(|&slot| lrus[slot as usize]);
        self.next_sorted_entry = 0;
    }

    /// Mark a resident slot as used this frame
    pub fn update_entry_lru(&mut self, slot: u32, frame: u64) {
        if let Some(lru) = self.lrus.get_mut(slot as usize) {
            *lru = frame;
        }
    }

    /// Hand out the least recently used slot not yet taken this frame.
    ///
    /// The slot's previous occupant is evicted and reported. Returns `None`
    /// once every slot has been handed out this frame; the caller must
    /// reject the request rather than look for another slot.
    pub fn get_next_entry(&mut self, new_slice: FeedbackInfo, frame: u64) -> Option<SlotAllocation> {
        let slot = *self.sorted_availabilities.get(self.next_sorted_entry)?;
        self.next_sorted_entry += 1;

        let previous_lru = std::mem::replace(&mut self.lrus[slot as usize], frame);
        let previous = std::mem::replace(&mut self.current_slices[slot as usize], new_slice);

        Some(SlotAllocation {
            slot,
            evicted: (!previous.is_unused()).then_some(previous),
            previous_lru,
        })
    }

    /// Undo the most recent [`get_next_entry`](Self::get_next_entry) when the
    /// upload into its slot failed.
    ///
    /// The slot gets its previous occupant and stamp back and is available
    /// again this frame. Returns `false` if `allocation` is not the last slot
    /// handed out.
    pub fn revert_entry(&mut self, allocation: &SlotAllocation) -> bool {
        let Some(last) = self.next_sorted_entry.checked_sub(1) else {
            return false;
        };
        if self.sorted_availabilities[last] != allocation.slot {
            return false;
        }

        let slot = allocation.slot as usize;
        self.lrus[slot] = allocation.previous_lru;
        self.current_slices[slot] = allocation.evicted.unwrap_or(FeedbackInfo::UNUSED);
        self.next_sorted_entry = last;
        true
    }

    /// Page stored in a slot, `None` if empty
    pub fn current_slice(&self, slot: u32) -> Option<FeedbackInfo> {
        self.current_slices
            .get(slot as usize)
            .copied()
            .filter(|slice| !slice.is_unused())
    }

    /// Last frame a slot was touched
    pub fn lru(&self, slot: u32) -> Option<u64> {
        self.lrus.get(slot as usize).copied()
    }

    /// Texel origin of a slot inside the atlas image
    pub fn slot_origin(&self, slot: u32, slot_size: u32) -> UVec2 {
        let page_count_x = self.page_count_x.max(1);
        UVec2::new(slot % page_count_x, slot / page_count_x) * slot_size
    }

    /// Extent of the whole atlas image
    pub fn image_extent(&self, slot_size: u32) -> UVec2 {
        UVec2::new(self.page_count_x, self.page_count_y) * slot_size
    }
}
