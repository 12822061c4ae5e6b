//! Feedback
//!
//! GPU-written page requests and their per-frame decoding.
//! Features:
//! - `FeedbackInfo`: the 32-bit page key shared with shader code
//! - Neighbour-based spatial deduplication before hashing
//! - Parent-mip prefetch for every requested page

use std::fmt;

use ahash::AHashSet;

/// Number of samples the shader writes per feedback block
pub const SAMPLES_PER_BLOCK: usize = 3;

const SLICE_Y_SHIFT: u32 = 0;
const SLICE_X_SHIFT: u32 = 8;
const MIP_LEVEL_SHIFT: u32 = 16;
const TEXTURE_ID_SHIFT: u32 = 21;

const SLICE_MASK: u32 = 0xFF;
const MIP_LEVEL_MASK: u32 = 0x1F;
const TEXTURE_ID_MASK: u32 = 0x7FF;

/// One virtual page of one texture at one mip level.
///
/// Bit layout, shared with shader code and not to be changed without
/// updating both sides:
///
/// | bits    | field      |
/// |---------|------------|
/// | 0..8    | slice y    |
/// | 8..16   | slice x    |
/// | 16..21  | mip level  |
/// | 21..32  | texture id |
///
/// Equality, ordering and hashing all use the raw bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FeedbackInfo(u32);

impl FeedbackInfo {
    /// Sentinel written by the shader for blocks that sampled nothing
    pub const UNUSED: Self = Self(u32::MAX);

    /// Largest mip level the 5-bit field can hold
    pub const MAX_MIP_LEVEL: u8 = MIP_LEVEL_MASK as u8;

    /// Largest texture id the 11-bit field can hold
    pub const MAX_TEXTURE_ID: u16 = TEXTURE_ID_MASK as u16;

    /// Pack a page key from its fields
    pub fn new(texture_id: u16, mip_level: u8, slice_x: u8, slice_y: u8) -> Self {
        debug_assert!(texture_id <= Self::MAX_TEXTURE_ID, "texture id {texture_id} does not fit in 11 bits");
        debug_assert!(mip_level <= Self::MAX_MIP_LEVEL, "mip level {mip_level} does not fit in 5 bits");

        Self(
            ((texture_id as u32 & TEXTURE_ID_MASK) << TEXTURE_ID_SHIFT)
                | ((mip_level as u32 & MIP_LEVEL_MASK) << MIP_LEVEL_SHIFT)
                | ((slice_x as u32) << SLICE_X_SHIFT)
                | ((slice_y as u32) << SLICE_Y_SHIFT),
        )
    }

    /// Reinterpret a value read from the feedback buffer
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw 32-bit value as seen by shaders
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn slice_y(self) -> u8 {
        ((self.0 >> SLICE_Y_SHIFT) & SLICE_MASK) as u8
    }

    pub fn slice_x(self) -> u8 {
        ((self.0 >> SLICE_X_SHIFT) & SLICE_MASK) as u8
    }

    pub fn mip_level(self) -> u8 {
        ((self.0 >> MIP_LEVEL_SHIFT) & MIP_LEVEL_MASK) as u8
    }

    pub fn texture_id(self) -> u16 {
        ((self.0 >> TEXTURE_ID_SHIFT) & TEXTURE_ID_MASK) as u16
    }

    /// Check whether this is the unused sentinel
    pub fn is_unused(self) -> bool {
        self == Self::UNUSED
    }

    /// The page covering this one in the next coarser mip.
    ///
    /// Returns `None` when the mip field is already saturated.
    pub fn parent(self) -> Option<Self> {
        let mip_level = self.mip_level();
        if mip_level >= Self::MAX_MIP_LEVEL {
            return None;
        }

        Some(Self::new(
            self.texture_id(),
            mip_level + 1,
            self.slice_x() >> 1,
            self.slice_y() >> 1,
        ))
    }
}

impl From<u32> for FeedbackInfo {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<FeedbackInfo> for u32 {
    fn from(feedback: FeedbackInfo) -> Self {
        feedback.0
    }
}

impl fmt::Display for FeedbackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unused() {
            return write!(f, "unused");
        }
        write!(
            f,
            "tex{}/mip{}/({}, {})",
            self.texture_id(),
            self.mip_level(),
            self.slice_x(),
            self.slice_y()
        )
    }
}

/// Decoder turning one frame of raw feedback into distinct page requests.
///
/// Scratch storage is kept between frames so steady-state decoding does not
/// allocate.
#[derive(Debug, Clone)]
pub struct FeedbackDecoder {
    /// Feedback blocks per row
    count_x: u32,
    /// Feedback block rows
    count_y: u32,
    /// Per column, the samples seen in the row above
    top_values: Vec<[FeedbackInfo; SAMPLES_PER_BLOCK]>,
    /// Global deduplication set
    seen: AHashSet<FeedbackInfo>,
    /// Decoded pages, sorted by key
    distinct: Vec<FeedbackInfo>,
}

impl FeedbackDecoder {
    /// Create a decoder for a grid of `count_x * count_y` feedback blocks
    pub fn new(count_x: u32, count_y: u32) -> Self {
        let count_x = count_x.max(1);
        Self {
            count_x,
            count_y,
            top_values: vec![[FeedbackInfo::UNUSED; SAMPLES_PER_BLOCK]; count_x as usize],
            seen: AHashSet::new(),
            distinct: Vec::new(),
        }
    }

    /// Create a decoder sized for a render extent.
    ///
    /// The shader writes one block per `block_size` pixels in each direction,
    /// plus one for the partial block at the edge.
    pub fn for_extent(width: u32, height: u32, block_size: u32) -> Self {
        let block_size = block_size.max(1);
        Self::new(width / block_size + 1, height / block_size + 1)
    }

    /// Feedback blocks per row
    pub fn count_x(&self) -> u32 {
        self.count_x
    }

    /// Feedback block rows
    pub fn count_y(&self) -> u32 {
        self.count_y
    }

    /// Total number of feedback blocks
    pub fn block_count(&self) -> usize {
        self.count_x as usize * self.count_y as usize
    }

    /// Total number of `u32` samples in one frame of feedback
    pub fn sample_count(&self) -> usize {
        self.block_count() * SAMPLES_PER_BLOCK
    }

    /// Size of the feedback buffer in bytes
    pub fn buffer_size(&self) -> u64 {
        (self.sample_count() * std::mem::size_of::<u32>()) as u64
    }

    /// Decode one frame of raw feedback.
    ///
    /// Samples are scanned in raster order. A sample equal to the previous
    /// sample or to the same sample of the block above is skipped before
    /// touching the hash set. Every kept page also requests its parent mip.
    /// Returns the number of non-sentinel samples read.
    pub fn decode(&mut self, samples: &[u32]) -> usize {
        let _span = tracing::debug_span!("feedback_dedup", samples = samples.len()).entered();

        for top in self.top_values.iter_mut() {
            *top = [FeedbackInfo::UNUSED; SAMPLES_PER_BLOCK];
        }
        self.seen.clear();
        self.distinct.clear();

        let block_count = self.block_count().min(samples.len() / SAMPLES_PER_BLOCK);
        let mut left = FeedbackInfo::UNUSED;
        let mut valid_samples = 0;

        for (block_index, block) in samples
            .chunks_exact(SAMPLES_PER_BLOCK)
            .take(block_count)
            .enumerate()
        {
            let column = block_index % self.count_x as usize;

            for (i, &raw) in block.iter().enumerate() {
                let feedback = FeedbackInfo::from_raw(raw);
                if feedback.is_unused() {
                    continue;
                }
                valid_samples += 1;

                let top = &mut self.top_values[column][i];
                let duplicate = feedback == left || feedback == *top;
                left = feedback;
                *top = feedback;
                if duplicate {
                    continue;
                }

                self.seen.insert(feedback);
                if let Some(parent) = feedback.parent() {
                    self.seen.insert(parent);
                }
            }
        }

        self.distinct.extend(self.seen.iter().copied());
        self.distinct.sort_unstable();

        log::trace!(
            "Decoded {} feedback samples into {} distinct pages",
            valid_samples,
            self.distinct.len()
        );

        valid_samples
    }

    /// Pages produced by the last call to [`decode`](Self::decode), sorted by key
    pub fn distinct(&self) -> &[FeedbackInfo] {
        &self.distinct
    }
}
