//! Indirection Table
//!
//! CPU mirror of the shader-visible indirection buffer and the allocator that
//! hands each texture a contiguous region of it.

use crate::{StreamingError, StreamingResult};

/// Entry value for pages that are not resident
pub const UNMAPPED: u32 = u32::MAX;

/// Flat table of atlas slot indices, one entry per virtual page.
///
/// Regions are handed out by a bump allocator and never reclaimed.
#[derive(Debug, Clone)]
pub struct IndirectionTable {
    /// Slot index per entry, or `UNMAPPED`
    entries: Vec<u32>,
    /// Start of the next free region
    next_offset: u32,
}

impl IndirectionTable {
    /// Create a table with `capacity` unmapped entries
    pub fn new(capacity: u32) -> Self {
        Self {
            entries: vec![UNMAPPED; capacity as usize],
            next_offset: 0,
        }
    }

    /// Total number of entries
    pub fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Number of entries already handed out
    pub fn allocated(&self) -> u32 {
        self.next_offset
    }

    /// Size of the device buffer backing this table
    pub fn size_in_bytes(&self) -> u64 {
        self.entries.len() as u64 * std::mem::size_of::<u32>() as u64
    }

    /// Reserve `count` contiguous entries and return the offset of the first.
    ///
    /// Running out of entries means the table was sized too small for the
    /// content; the caller should treat the error as fatal.
    pub fn allocate(&mut self, count: u32) -> StreamingResult<u32> {
        let offset = self.next_offset;
        let end = offset.checked_add(count);

        match end {
            Some(end) if end <= self.capacity() => {
                self.next_offset = end;
                Ok(offset)
            }
            _ => {
                let err = StreamingError::IndirectionCapacityExceeded {
                    offset,
                    requested: count,
                    capacity: self.capacity(),
                };
                log::error!("{err}, sampling past the table would hang the GPU");
                Err(err)
            }
        }
    }

    /// Point an entry at an atlas slot
    pub fn set(&mut self, address: u32, slot: u32) -> StreamingResult<()> {
        let capacity = self.capacity();
        let entry = self
            .entries
            .get_mut(address as usize)
            .ok_or(StreamingError::IndirectionOutOfRange { address, capacity })?;
        *entry = slot;
        Ok(())
    }

    /// Mark an entry as unmapped
    pub fn clear(&mut self, address: u32) -> StreamingResult<()> {
        self.set(address, UNMAPPED)
    }

    /// Read an entry, `None` if the address is outside the table
    pub fn get(&self, address: u32) -> Option<u32> {
        self.entries.get(address as usize).copied()
    }

    /// Check whether an entry points at a slot
    pub fn is_mapped(&self, address: u32) -> bool {
        self.get(address).is_some_and(|entry| entry != UNMAPPED)
    }

    /// All entries, in buffer order
    pub fn entries(&self) -> &[u32] {
        &self.entries
    }
}
