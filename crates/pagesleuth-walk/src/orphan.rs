//! Orphan classification.
//!
//! After the freelist, pointer-map and every reachable b-tree have claimed
//! their pages, whatever is left is either recognizably shaped data that
//! nothing points at (an orphan — usually leaked space worth a VACUUM, or
//! the debris of a truncated structure) or genuinely unclassifiable bytes.

use pagesleuth_pager::Pager;
use pagesleuth_types::encoding::read_u32_be;
use tracing::debug;

use crate::cell::BtreeType;
use crate::classify::{PageMap, PageRole};

/// Scan every still-unclassified page and classify the ones whose content
/// matches a known shape. Returns the number of orphans found.
pub fn classify_orphans(pager: &mut Pager, map: &mut PageMap) -> u32 {
    let max_page = pager.max_page();
    let mut orphans = 0u32;

    for pgno in 1..=max_page {
        if map.is_classified(pgno) {
            continue;
        }
        let Ok(page) = pager.read_raw_page(pgno) else {
            // Unreadable stays unknown; the totals will show it.
            continue;
        };

        let role = classify_shape(&page, max_page);
        if let Some(role) = role {
            debug!(page = pgno, role = %role, "orphan page");
            map.mark(pgno, role, 0);
            orphans += 1;
        }
    }

    orphans
}

/// Decide an orphan role from raw page content, or `None` to stay unknown.
fn classify_shape(page: &[u8], max_page: u32) -> Option<PageRole> {
    if page.iter().all(|&b| b == 0) {
        return Some(PageRole::OrphanEmpty);
    }

    if let Some(btree_type) = BtreeType::from_flag(page[0]) {
        return Some(match btree_type {
            BtreeType::InteriorIndex => PageRole::OrphanInteriorIndex,
            BtreeType::InteriorTable => PageRole::OrphanInteriorTable,
            BtreeType::LeafIndex => PageRole::OrphanLeafIndex,
            BtreeType::LeafTable => PageRole::OrphanLeafTable,
        });
    }

    // An overflow page has no type byte of its own; its first 4 bytes are
    // the next pointer. A zero or in-range pointer with a 0x00 lead byte is
    // the best available signal.
    if page[0] == 0x00 {
        let next = read_u32_be(&page[0..4])?;
        if next == 0 || next <= max_page {
            return Some(PageRole::OrphanOverflow);
        }
    }

    None
}
