//! Recursive b-tree descent with classification.
//!
//! The walker starts at a root, classifies every page it can reach through
//! child pointers, rightmost pointers and overflow chains, and never trusts
//! a byte it has not bounds-checked. The classification map doubles as the
//! visited set, so cycles and DAG merges terminate immediately; depth is
//! capped against pathological parent pointers.

use pagesleuth_error::{Result, SleuthError};
use pagesleuth_pager::Pager;
use pagesleuth_types::encoding::read_u32_be;
use tracing::{debug, warn};

use crate::cell::{BtreeType, PageHeader, ParsedCell, header_offset_for_page};
use crate::classify::{ConflictRecord, PageMap, PageRole};
use crate::overflow::classify_chain;
use crate::ptrmap::{is_ptrmap_position, is_valid_ptrmap_data};

/// Maximum descent depth. Real trees are a handful of levels deep; anything
/// past this is a corrupt page graph pretending to be a tree.
pub const MAX_BTREE_DEPTH: usize = 50;

/// Counters from one b-tree walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BtreeWalkStats {
    /// Pages newly classified by this walk (b-tree pages and overflow).
    pub pages_classified: u32,
    /// Pages at pointer-map positions with plausible ptrmap content seen
    /// while auto-vacuum is off.
    pub ghost_ptrmaps: u32,
    /// Cells skipped because their offset or content did not decode.
    pub skipped_cells: u32,
    /// Subtrees abandoned at the depth cap.
    pub depth_overruns: u32,
}

impl BtreeWalkStats {
    /// Accumulate counters from another walk (used when several roots feed
    /// one accounting run).
    pub fn merge(&mut self, other: Self) {
        self.pages_classified += other.pages_classified;
        self.ghost_ptrmaps += other.ghost_ptrmaps;
        self.skipped_cells += other.skipped_cells;
        self.depth_overruns += other.depth_overruns;
    }
}

/// The role a b-tree page type classifies into.
const fn role_for(btree_type: BtreeType) -> PageRole {
    match btree_type {
        BtreeType::InteriorIndex => PageRole::BtreeInteriorIndex,
        BtreeType::InteriorTable => PageRole::BtreeInteriorTable,
        BtreeType::LeafIndex => PageRole::BtreeLeafIndex,
        BtreeType::LeafTable => PageRole::BtreeLeafTable,
    }
}

/// Walk the b-tree rooted at `root`, classifying every reachable page into
/// `map`.
///
/// A root outside `1..=max_page` is an error (the caller asked for a tree
/// that cannot exist); everything the walk encounters *below* the root is
/// survivable and at worst truncates one subtree.
pub fn walk_btree(pager: &mut Pager, map: &mut PageMap, root: u32, parent: u32) -> Result<BtreeWalkStats> {
    if !pager.in_range(root) {
        return Err(SleuthError::PageOutOfRange {
            page: root,
            max_page: pager.max_page(),
        });
    }
    let mut walker = Walker { pager, map };
    let mut stats = BtreeWalkStats::default();
    walker.visit(root, parent, 0, &mut stats);
    Ok(stats)
}

struct Walker<'a> {
    pager: &'a mut Pager,
    map: &'a mut PageMap,
}

impl Walker<'_> {
    fn visit(&mut self, pgno: u32, parent: u32, depth: usize, stats: &mut BtreeWalkStats) {
        if pgno == 0 || !self.pager.in_range(pgno) {
            return;
        }
        if self.map.is_classified(pgno) {
            self.probe_reentry_conflict(pgno, parent);
            return;
        }
        if depth > MAX_BTREE_DEPTH {
            warn!(page = pgno, depth, "b-tree depth cap reached, abandoning subtree");
            stats.depth_overruns += 1;
            return;
        }

        // A page at a pointer-map position while auto-vacuum is off may be
        // a leftover from a former auto-vacuum configuration. Count it,
        // then treat the page like any other candidate.
        if self.pager.header().auto_vacuum == 0
            && is_ptrmap_position(pgno, self.pager.usable_size())
        {
            if let Ok(page) = self.pager.read_raw_page(pgno) {
                if is_valid_ptrmap_data(&page, self.pager.usable_size(), self.pager.max_page()) {
                    warn!(page = pgno, "ghost pointer-map content at ptrmap position");
                    stats.ghost_ptrmaps += 1;
                }
            }
        }

        let page = match self.pager.read_raw_page(pgno) {
            Ok(page) => page,
            Err(e) => {
                warn!(page = pgno, error = %e, "page unreadable, subtree abandoned");
                return;
            }
        };

        let hdr = header_offset_for_page(pgno);
        let Some(btree_type) = BtreeType::from_flag(page[hdr]) else {
            // Not a b-tree page: unwind without classifying.
            debug!(page = pgno, flag = page[hdr], "not a b-tree page");
            return;
        };

        self.map.mark(pgno, role_for(btree_type), parent);
        stats.pages_classified += 1;

        let header = match PageHeader::parse(&page, hdr) {
            Ok(h) => h,
            Err(e) => {
                warn!(page = pgno, error = %e, "b-tree header unparseable");
                return;
            }
        };

        let page_size = self.pager.page_size().as_usize();
        let usable = self.pager.usable_size();
        let declared = usize::from(header.cell_count);
        let cell_limit = page_size / 2;
        if declared > cell_limit {
            warn!(
                page = pgno,
                declared,
                limit = cell_limit,
                "cell count clamped"
            );
        }
        let n_cells = declared.min(cell_limit);
        let min_cell_offset = hdr + btree_type.header_size();

        for i in 0..n_cells {
            let Some(raw_offset) = header.cell_pointer(&page, hdr, i) else {
                warn!(page = pgno, cell = i, "cell pointer array runs past page");
                stats.skipped_cells += 1;
                continue;
            };
            let cell_offset = usize::from(raw_offset);
            if cell_offset < min_cell_offset || cell_offset >= page_size {
                warn!(
                    page = pgno,
                    cell = i,
                    offset = cell_offset,
                    "cell offset outside the valid window, skipping"
                );
                stats.skipped_cells += 1;
                continue;
            }

            if btree_type.is_interior() {
                // Left child pointer is the first 4 bytes of the cell.
                if let Some(child) = read_u32_be(&page[cell_offset..]) {
                    self.visit(child, pgno, depth + 1, stats);
                }
            }

            // Index cells (and both leaf shapes) carry payload that may
            // spill into an overflow chain.
            if btree_type != BtreeType::InteriorTable {
                match ParsedCell::parse(&page, cell_offset, btree_type, usable) {
                    Ok(cell) => {
                        if let Some(head) = cell.overflow_head {
                            stats.pages_classified +=
                                classify_chain(self.pager, self.map, head, pgno);
                        }
                    }
                    Err(e) => {
                        warn!(page = pgno, cell = i, error = %e, "cell unparseable, skipping");
                        stats.skipped_cells += 1;
                    }
                }
            }
        }

        if let Some(right) = header.right_child {
            self.visit(right, pgno, depth + 1, stats);
        }
    }

    /// A classified page reached again as a b-tree child. Re-entry through
    /// the same tree is normal; a page the freelist already owns is the
    /// double-claim corruption this suite exists to find, so read the page
    /// and record what the b-tree side sees.
    fn probe_reentry_conflict(&mut self, pgno: u32, parent: u32) {
        let existing = self.map.role(pgno);
        if !existing.is_freelist() {
            return;
        }
        let Ok(page) = self.pager.read_raw_page(pgno) else {
            return;
        };
        let hdr = header_offset_for_page(pgno);
        if let Some(btree_type) = BtreeType::from_flag(page[hdr]) {
            self.map.record_conflict(ConflictRecord {
                page: pgno,
                first: existing,
                first_parent: self.map.parent(pgno),
                second: role_for(btree_type),
                second_parent: parent,
            });
        }
    }
}
