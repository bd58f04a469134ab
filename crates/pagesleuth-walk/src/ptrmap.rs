//! Pointer-map page positions and content validation.
//!
//! When auto-vacuum is enabled the file interleaves pointer-map pages at
//! deterministic positions: the first at page `floor(U/5) + 1` and then one
//! every `floor(U/5) + 1` pages (each 5-byte entry maps one following
//! page). The positions are a pure function of page size and reserved
//! space, so they can be computed even when the header lies about
//! auto-vacuum — which is exactly how ghost pointer maps are found after
//! auto-vacuum was switched off without a VACUUM.

use pagesleuth_pager::Pager;
use pagesleuth_types::encoding::read_u32_be;
use tracing::{debug, warn};

use crate::classify::{PageMap, PageRole};

/// Number of 5-byte entries per pointer-map page.
#[must_use]
pub const fn entries_per_page(usable_size: u32) -> u32 {
    usable_size / 5
}

/// Page number of the first pointer-map page.
#[must_use]
pub const fn first_ptrmap_page(usable_size: u32) -> u32 {
    entries_per_page(usable_size) + 1
}

/// Whether `pgno` sits at a pointer-map position for this geometry.
///
/// Page 1 never is, regardless of geometry.
#[must_use]
pub const fn is_ptrmap_position(pgno: u32, usable_size: u32) -> bool {
    let first = first_ptrmap_page(usable_size);
    if pgno == 1 || pgno < first {
        return false;
    }
    (pgno - first) % (entries_per_page(usable_size) + 1) == 0
}

/// Whether a page's content is shaped like pointer-map data.
///
/// Every 5-byte entry must carry a type byte in 0..=5 and, when the type
/// is non-zero, a parent reference no larger than `max_page` (0 is legal:
/// root and freelist entries have no parent). At least one entry must be
/// non-zero, otherwise an all-zero page would qualify.
#[must_use]
pub fn is_valid_ptrmap_data(page: &[u8], usable_size: u32, max_page: u32) -> bool {
    let entries = entries_per_page(usable_size) as usize;
    let mut has_entry = false;

    for i in 0..entries {
        let off = i * 5;
        let Some(entry) = page.get(off..off + 5) else {
            return false;
        };
        let entry_type = entry[0];
        if entry_type > 5 {
            return false;
        }
        if entry_type != 0 {
            has_entry = true;
            let parent = read_u32_be(&entry[1..5]).unwrap_or(u32::MAX);
            if parent > max_page {
                return false;
            }
        }
    }

    has_entry
}

/// Counters from one pass over the computed pointer-map positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PtrmapScan {
    /// Positions classified as pointer-map pages.
    pub marked: u32,
    /// Valid ptrmap pages found while auto-vacuum is off (remnants of a
    /// former auto-vacuum configuration).
    pub ghosts: u32,
    /// Positions that should hold ptrmap data (auto-vacuum on) but are
    /// either claimed by another role or fail content validation.
    pub missing: u32,
}

/// Visit every computed pointer-map position and classify the ones whose
/// content validates.
///
/// Runs after the freelist walk, so a position already claimed by another
/// role counts as missing when auto-vacuum says it should be a ptrmap.
pub fn mark_ptrmap_pages(pager: &mut Pager, map: &mut PageMap) -> PtrmapScan {
    let usable = pager.usable_size();
    let auto_vacuum = pager.header().auto_vacuum;
    let max_page = pager.max_page();
    let stride = entries_per_page(usable) + 1;

    let mut scan = PtrmapScan::default();

    let mut pgno = first_ptrmap_page(usable);
    while pgno <= max_page {
        if map.is_classified(pgno) {
            if auto_vacuum != 0 {
                warn!(
                    page = pgno,
                    role = %map.role(pgno),
                    "expected ptrmap position occupied by another role"
                );
                scan.missing += 1;
            }
        } else {
            match pager.read_raw_page(pgno) {
                Ok(page) => {
                    if is_valid_ptrmap_data(&page, usable, max_page) {
                        map.mark(pgno, PageRole::Ptrmap, 0);
                        scan.marked += 1;
                        if auto_vacuum == 0 {
                            warn!(page = pgno, "ghost pointer-map page (auto-vacuum is off)");
                            scan.ghosts += 1;
                        }
                    } else if auto_vacuum != 0 {
                        warn!(page = pgno, "expected ptrmap position fails validation");
                        scan.missing += 1;
                    }
                }
                Err(e) => {
                    debug!(page = pgno, error = %e, "ptrmap candidate unreadable");
                    if auto_vacuum != 0 {
                        scan.missing += 1;
                    }
                }
            }
        }
        pgno += stride;
    }

    scan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_for_4096_page() {
        // U = 4096: 819 entries per page, first ptrmap at page 820.
        assert_eq!(entries_per_page(4096), 819);
        assert_eq!(first_ptrmap_page(4096), 820);
        assert!(is_ptrmap_position(820, 4096));
        assert!(is_ptrmap_position(1640, 4096));
        assert!(!is_ptrmap_position(821, 4096));
        assert!(!is_ptrmap_position(819, 4096));
        assert!(!is_ptrmap_position(1, 4096));
    }

    #[test]
    fn page_one_is_never_a_ptrmap_position() {
        // Degenerate tiny usable size would otherwise put page 1 in range.
        assert!(!is_ptrmap_position(1, 4096));
        assert!(!is_ptrmap_position(1, 512));
    }

    #[test]
    fn valid_ptrmap_data_accepted() {
        let mut page = vec![0u8; 512];
        // entry 0: type 1 (btree root), parent 0
        page[0] = 1;
        // entry 1: type 5, parent 7
        page[5] = 5;
        page[6..10].copy_from_slice(&7u32.to_be_bytes());
        assert!(is_valid_ptrmap_data(&page, 512, 100));
    }

    #[test]
    fn all_zero_page_is_not_a_ptrmap() {
        let page = vec![0u8; 512];
        assert!(!is_valid_ptrmap_data(&page, 512, 100));
    }

    #[test]
    fn bad_type_byte_rejected() {
        let mut page = vec![0u8; 512];
        page[0] = 6;
        assert!(!is_valid_ptrmap_data(&page, 512, 100));
    }

    #[test]
    fn out_of_range_parent_rejected() {
        let mut page = vec![0u8; 512];
        page[0] = 3;
        page[1..5].copy_from_slice(&5000u32.to_be_bytes());
        assert!(!is_valid_ptrmap_data(&page, 512, 100));
    }
}
