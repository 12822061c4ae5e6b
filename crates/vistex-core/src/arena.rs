//! Block Arena
//!
//! Growable storage made of fixed-capacity blocks. Elements never move once
//! pushed, since a full block is left alone and a new one is appended.

/// Fixed-capacity block of elements
#[derive(Debug, Clone)]
struct ArenaBlock<T> {
    items: Vec<T>,
}

impl<T> ArenaBlock<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    fn is_full(&self, capacity: usize) -> bool {
        self.items.len() >= capacity
    }
}

/// Arena of `BLOCK_SIZE`-element blocks indexed by a flat `u32`.
///
/// Index `i` lives at block `i / BLOCK_SIZE`, offset `i % BLOCK_SIZE`.
#[derive(Debug, Clone)]
pub struct BlockArena<T, const BLOCK_SIZE: usize = 4> {
    blocks: Vec<ArenaBlock<T>>,
    len: usize,
}

impl<T, const BLOCK_SIZE: usize> BlockArena<T, BLOCK_SIZE> {
    /// Create an empty arena
    pub fn new() -> Self {
        assert!(BLOCK_SIZE > 0, "block size must be non-zero");
        Self {
            blocks: Vec::new(),
            len: 0,
        }
    }

    /// Append an element and return its index
    pub fn push(&mut self, value: T) -> u32 {
        let needs_block = self
            .blocks
            .last()
            .is_none_or(|block| block.is_full(BLOCK_SIZE));
        if needs_block {
            self.blocks.push(ArenaBlock::new(BLOCK_SIZE));
        }

        if let Some(block) = self.blocks.last_mut() {
            block.items.push(value);
        }

        let index = self.len as u32;
        self.len += 1;
        index
    }

    /// Split a flat index into (block, offset)
    pub fn locate(index: u32) -> (usize, usize) {
        let index = index as usize;
        (index / BLOCK_SIZE, index % BLOCK_SIZE)
    }

    /// Get an element by index
    pub fn get(&self, index: u32) -> Option<&T> {
        let (block, offset) = Self::locate(index);
        self.blocks.get(block)?.items.get(offset)
    }

    /// Get a mutable element by index
    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        let (block, offset) = Self::locate(index);
        self.blocks.get_mut(block)?.items.get_mut(offset)
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the arena is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of allocated blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Iterate over elements in index order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.blocks.iter().flat_map(|block| block.items.iter())
    }

    /// Iterate mutably over elements in index order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.blocks.iter_mut().flat_map(|block| block.items.iter_mut())
    }
}

impl<T, const BLOCK_SIZE: usize> Default for BlockArena<T, BLOCK_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}
