//! Indirection Addressing
//!
//! Maps a virtual page to its entry in a texture's indirection region.
//!
//! Mip 0 holds `count_x * count_y` entries, each coarser mip a quarter of the
//! previous one, so each level gets a disjoint contiguous sub-range whose start
//! is the closed-form sum of the quadtree series. Mips coarser than the
//! 1x1 level each take one more entry.

/// Offset of a page inside its texture's indirection region.
///
/// `slice_count_x`/`slice_count_y` are the mip 0 page counts of the texture.
/// Returns `None` when the offset does not fit in 32 bits.
pub fn indirection_id(
    slice_x: u32,
    slice_y: u32,
    slice_count_x: u32,
    slice_count_y: u32,
    mip_level: u32,
) -> Option<u32> {
    if mip_level == 0 {
        return slice_y.checked_mul(slice_count_x)?.checked_add(slice_x);
    }

    let mut id: u32 = 0;
    let mut mip_level = mip_level;

    let max_mip = slice_count_x.checked_ilog2().unwrap_or(0);
    if mip_level > max_mip {
        id = mip_level - max_mip;
        mip_level = max_mip;
    }

    // A 1x1 texture only has the degenerate levels
    if mip_level == 0 {
        return slice_y
            .checked_mul(slice_count_x)?
            .checked_add(slice_x)?
            .checked_add(id);
    }

    let previous_x = slice_count_x >> (mip_level - 1);
    let previous_y = slice_count_y >> (mip_level - 1);
    let mip_start = slice_count_x
        .checked_mul(slice_count_y)?
        .checked_mul(4)?
        .checked_sub(previous_x.checked_mul(previous_y)?)?
        / 3;

    let row = slice_y.checked_mul(slice_count_x >> mip_level)?;
    id.checked_add(mip_start)?
        .checked_add(slice_x)?
        .checked_add(row)
}

/// Number of mip levels in a full chain for a `width x height` texture
pub fn mip_count(width: u32, height: u32) -> u32 {
    width.max(height).max(1).ilog2() + 1
}

/// Number of indirection entries a `width x height` texture needs.
///
/// Every mip contributes its page grid, with at least one page per level.
pub fn indirection_count(width: u32, height: u32, page_size: u32) -> u32 {
    let page_size = page_size.max(1);

    (0..mip_count(width, height))
        .map(|mip_level| {
            let pages_x = ((width >> mip_level) / page_size).max(1);
            let pages_y = ((height >> mip_level) / page_size).max(1);
            pages_x * pages_y
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip0_addressing() {
        assert_eq!(indirection_id(3, 2, 8, 8, 0), Some(19));
        assert_eq!(indirection_id(0, 0, 8, 8, 0), Some(0));
        assert_eq!(indirection_id(7, 7, 8, 8, 0), Some(63));
    }

    #[test]
    fn test_mip0_span() {
        let mut ids: Vec<u32> = (0..8)
            .flat_map(|y| (0..8).map(move |x| indirection_id(x, y, 8, 8, 0).unwrap()))
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_mip_ranges_are_disjoint() {
        // 8x8 grid: mip 1 is 4x4, mip 2 is 2x2, mip 3 is 1x1
        let mip1: Vec<u32> = (0..4)
            .flat_map(|y| (0..4).map(move |x| indirection_id(x, y, 8, 8, 1).unwrap()))
            .collect();
        assert_eq!(*mip1.iter().min().unwrap(), 64);
        assert_eq!(*mip1.iter().max().unwrap(), 79);

        let mip2: Vec<u32> = (0..2)
            .flat_map(|y| (0..2).map(move |x| indirection_id(x, y, 8, 8, 2).unwrap()))
            .collect();
        assert_eq!(*mip2.iter().min().unwrap(), 80);
        assert_eq!(*mip2.iter().max().unwrap(), 83);

        assert_eq!(indirection_id(0, 0, 8, 8, 3), Some(84));
    }

    #[test]
    fn test_degenerate_mips_take_one_entry_each() {
        assert_eq!(indirection_id(0, 0, 8, 8, 4), Some(85));
        assert_eq!(indirection_id(0, 0, 8, 8, 5), Some(86));
        assert_eq!(indirection_id(0, 0, 8, 8, 11), Some(92));
    }

    #[test]
    fn test_single_page_texture() {
        assert_eq!(indirection_id(0, 0, 1, 1, 0), Some(0));
        assert_eq!(indirection_id(0, 0, 1, 1, 1), Some(1));
        assert_eq!(indirection_id(0, 0, 1, 1, 4), Some(4));
    }

    #[test]
    fn test_mip_count() {
        assert_eq!(mip_count(1, 1), 1);
        assert_eq!(mip_count(2048, 2048), 12);
        assert_eq!(mip_count(4096, 1024), 13);
        assert_eq!(mip_count(0, 0), 1);
    }

    #[test]
    fn test_indirection_count_covers_every_page() {
        // 2048 / 256 = 8 pages per side
        let count = indirection_count(2048, 2048, 256);
        assert_eq!(count, 64 + 16 + 4 + 1 + 8);

        let last = indirection_id(0, 0, 8, 8, mip_count(2048, 2048) - 1).unwrap();
        assert_eq!(last, count - 1);
    }

    #[test]
    fn test_oversized_grid_does_not_overflow() {
        assert_eq!(indirection_id(0, 1 << 20, 1 << 16, 1 << 16, 0), None);
        assert_eq!(indirection_id(0, 0, 1 << 16, 1 << 16, 1), None);
        assert_eq!(indirection_id(u32::MAX, 0, 1, 1, 0), Some(u32::MAX));
        assert_eq!(indirection_id(u32::MAX, 0, 1, 1, 3), None);
    }
}
