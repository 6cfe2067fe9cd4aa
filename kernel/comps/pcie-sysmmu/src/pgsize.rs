// SPDX-License-Identifier: MPL-2.0

use crate::{LPAGE_SIZE, SECT_SIZE, SPAGE_SIZE};

/// The page sizes that the SysMMU can map.
pub const PGSIZE_BITMAP: usize = SECT_SIZE | LPAGE_SIZE | SPAGE_SIZE;

/// Picks the largest page size in `pgsize_bitmap` that both fits in `size`
/// and keeps `addr_merge` aligned.
///
/// `addr_merge` is the bitwise OR of every address that the page must be
/// aligned for, e.g. the IOVA and the physical address of a mapping.
///
/// # Panics
///
/// The function panics if no page size is left, which means the caller did
/// not align the addresses and `size` to the smallest supported page size.
pub fn choose_pagesize(addr_merge: u64, size: usize, pgsize_bitmap: usize) -> usize {
    assert!(size != 0);

    // Max page size that still fits into `size`.
    let mut pgsize_idx = size.ilog2();

    if addr_merge != 0 {
        // Max page size allowed by the alignment of the addresses.
        pgsize_idx = pgsize_idx.min(addr_merge.trailing_zeros());
    }

    let acceptable = match 1usize.checked_shl(pgsize_idx + 1) {
        Some(bound) => bound - 1,
        None => usize::MAX,
    };
    let candidates = acceptable & pgsize_bitmap;
    assert!(
        candidates != 0,
        "no page size for {:#x} bytes at {:#x}",
        size,
        addr_merge
    );

    1 << candidates.ilog2()
}

/// The smallest page size in `pgsize_bitmap`.
pub(crate) fn min_pagesize(pgsize_bitmap: usize) -> usize {
    1 << pgsize_bitmap.trailing_zeros()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aligned_addresses_get_sections() {
        assert_eq!(choose_pagesize(0, SECT_SIZE, PGSIZE_BITMAP), SECT_SIZE);
        assert_eq!(choose_pagesize(0, 8 * SECT_SIZE + 5, PGSIZE_BITMAP), SECT_SIZE);
        assert_eq!(
            choose_pagesize(0x1000_0000 | 0x8000_0000, 3 * SECT_SIZE, PGSIZE_BITMAP),
            SECT_SIZE
        );
    }

    #[test]
    fn remaining_size_caps_the_page() {
        let addr = 0x1000_0000 | 0x8000_0000;
        assert_eq!(choose_pagesize(addr, 2 * SPAGE_SIZE, PGSIZE_BITMAP), SPAGE_SIZE);
        assert_eq!(choose_pagesize(addr, LPAGE_SIZE, PGSIZE_BITMAP), LPAGE_SIZE);
        assert_eq!(choose_pagesize(addr, SECT_SIZE - SPAGE_SIZE, PGSIZE_BITMAP), LPAGE_SIZE);
    }

    #[test]
    fn misalignment_forces_smaller_pages() {
        // The physical address is only 64 KiB aligned.
        assert_eq!(
            choose_pagesize(0x1000_0000 | 0x8001_0000, SECT_SIZE, PGSIZE_BITMAP),
            LPAGE_SIZE
        );
        // The IOVA is only 4 KiB aligned.
        assert_eq!(
            choose_pagesize(0x1000_1000 | 0x8000_0000, SECT_SIZE, PGSIZE_BITMAP),
            SPAGE_SIZE
        );
    }

    #[test]
    fn every_choice_is_supported_and_maximal() {
        let sizes = [
            SPAGE_SIZE,
            3 * SPAGE_SIZE,
            LPAGE_SIZE,
            17 * SPAGE_SIZE,
            SECT_SIZE,
            3 * SECT_SIZE,
        ];
        let addrs = [0u64, 0x1000, 0x1_0000, 0x2_0000, 0x10_0000, 0x1230_0000, 0x8_0001_1000];
        for &size in &sizes {
            for &addr in &addrs {
                let pgsize = choose_pagesize(addr, size, PGSIZE_BITMAP);
                assert!(pgsize <= size);
                assert!(pgsize & PGSIZE_BITMAP != 0);
                assert!(addr % pgsize as u64 == 0);
                // No larger supported size would also have been legal.
                for larger in [LPAGE_SIZE, SECT_SIZE] {
                    if larger > pgsize {
                        assert!(larger > size || addr % larger as u64 != 0);
                    }
                }
            }
        }
    }

    #[test]
    fn min_pagesize_is_a_small_page() {
        assert_eq!(min_pagesize(PGSIZE_BITMAP), SPAGE_SIZE);
    }

    #[test]
    #[should_panic]
    fn unaligned_request_is_a_bug() {
        choose_pagesize(0x800, SPAGE_SIZE, PGSIZE_BITMAP);
    }
}
