//! Full-file page accounting.
//!
//! One pass over the whole database: mark the lock-byte page, walk the
//! freelist, classify pointer-map positions, descend every b-tree root,
//! then sweep for orphans. The result is a role for every page, the
//! conflicts observed while assigning them, and totals cross-checked
//! against the header's own counts.

use std::io::Write;
use std::path::Path;

use pagesleuth_error::Result;
use pagesleuth_pager::Pager;
use tracing::{info, warn};

use crate::btree::{BtreeWalkStats, walk_btree};
use crate::classify::{ConflictRecord, PageMap, PageRole};
use crate::freelist::{FreelistFailure, walk_freelist};
use crate::orphan::classify_orphans;
use crate::ptrmap::mark_ptrmap_pages;
use crate::schema::RootEntry;

/// Byte offset of the lock region; the page containing it is never used
/// for data, so any structure claiming it is corrupt.
const LOCK_BYTE_OFFSET: u64 = 1 << 30;

/// Per-role page counts for one accounting run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RoleCounts {
    pub unknown: u32,
    pub freelist_trunk: u32,
    pub freelist_leaf: u32,
    pub btree_interior_index: u32,
    pub btree_interior_table: u32,
    pub btree_leaf_index: u32,
    pub btree_leaf_table: u32,
    pub overflow: u32,
    pub ptrmap: u32,
    pub lock_byte: u32,
    pub orphan_interior_index: u32,
    pub orphan_interior_table: u32,
    pub orphan_leaf_index: u32,
    pub orphan_leaf_table: u32,
    pub orphan_overflow: u32,
    pub orphan_empty: u32,
}

impl RoleCounts {
    /// Tally every page in a classification map.
    #[must_use]
    pub fn from_map(map: &PageMap) -> Self {
        let mut counts = Self::default();
        for (_, role) in map.iter() {
            counts.record(role);
        }
        counts
    }

    fn record(&mut self, role: PageRole) {
        let slot = match role {
            PageRole::Unknown => &mut self.unknown,
            PageRole::FreelistTrunk => &mut self.freelist_trunk,
            PageRole::FreelistLeaf => &mut self.freelist_leaf,
            PageRole::BtreeInteriorIndex => &mut self.btree_interior_index,
            PageRole::BtreeInteriorTable => &mut self.btree_interior_table,
            PageRole::BtreeLeafIndex => &mut self.btree_leaf_index,
            PageRole::BtreeLeafTable => &mut self.btree_leaf_table,
            PageRole::Overflow => &mut self.overflow,
            PageRole::Ptrmap => &mut self.ptrmap,
            PageRole::LockByte => &mut self.lock_byte,
            PageRole::OrphanInteriorIndex => &mut self.orphan_interior_index,
            PageRole::OrphanInteriorTable => &mut self.orphan_interior_table,
            PageRole::OrphanLeafIndex => &mut self.orphan_leaf_index,
            PageRole::OrphanLeafTable => &mut self.orphan_leaf_table,
            PageRole::OrphanOverflow => &mut self.orphan_overflow,
            PageRole::OrphanEmpty => &mut self.orphan_empty,
        };
        *slot += 1;
    }

    /// Total freelist pages (trunks plus leaves).
    #[must_use]
    pub const fn total_freelist(&self) -> u32 {
        self.freelist_trunk + self.freelist_leaf
    }

    /// Total reachable b-tree pages.
    #[must_use]
    pub const fn total_btree(&self) -> u32 {
        self.btree_interior_index
            + self.btree_interior_table
            + self.btree_leaf_index
            + self.btree_leaf_table
    }

    /// Total orphaned pages of every shape.
    #[must_use]
    pub const fn total_orphan(&self) -> u32 {
        self.orphan_interior_index
            + self.orphan_interior_table
            + self.orphan_leaf_index
            + self.orphan_leaf_table
            + self.orphan_overflow
            + self.orphan_empty
    }

    /// Every page that got a role, i.e. everything but unknown.
    #[must_use]
    pub const fn total_accounted(&self) -> u32 {
        self.total_freelist()
            + self.total_btree()
            + self.overflow
            + self.ptrmap
            + self.lock_byte
            + self.total_orphan()
    }
}

/// The complete accounting report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountReport {
    /// Page size in bytes.
    pub page_size: u32,
    /// Auto-vacuum word from the header.
    pub auto_vacuum: u32,
    /// Database size in pages as the header claims.
    pub header_page_count: u32,
    /// Database size in pages as the file size implies.
    pub max_page: u32,
    /// Freelist size as the header claims.
    pub header_freelist_count: u32,
    /// Pages per role.
    pub counts: RoleCounts,
    /// Pages claimed by two roles, in discovery order.
    pub conflicts: Vec<ConflictRecord>,
    /// Valid ptrmap pages found while auto-vacuum is off.
    pub ghost_ptrmaps: u32,
    /// Expected ptrmap positions that are missing or corrupt.
    pub missing_ptrmaps: u32,
    /// What stopped the freelist walk early, if anything.
    pub freelist_failure: Option<FreelistFailure>,
    /// Roots that could not be walked at all, with the reason.
    pub failed_roots: Vec<(String, String)>,
    /// Walker counters summed over every root.
    pub walk_stats: BtreeWalkStats,
    /// All orphan pages, ascending.
    pub orphan_pages: Vec<u32>,
    /// All pages left unknown, ascending.
    pub unknown_pages: Vec<u32>,
}

impl AccountReport {
    /// True when every page got exactly one role and nothing clashed.
    #[must_use]
    pub fn fully_accounted(&self) -> bool {
        self.counts.unknown == 0 && self.conflicts.is_empty()
    }

    /// Difference between observed freelist pages and the header's claim.
    #[must_use]
    pub fn freelist_delta(&self) -> i64 {
        i64::from(self.counts.total_freelist()) - i64::from(self.header_freelist_count)
    }
}

/// Run the full accounting pass.
///
/// `roots` lists every schema root besides page 1; page 1 itself is always
/// walked. A root that cannot be walked (out of range, unreadable) is
/// reported in `failed_roots` and the remaining roots still run.
pub fn account(pager: &mut Pager, roots: &[RootEntry]) -> Result<AccountReport> {
    let mut map = PageMap::new(pager.max_page());

    // The lock-byte page exists only in files that span byte 2^30. Mark it
    // first so any structure claiming it surfaces as a conflict.
    let lock_page = lock_byte_page(pager.page_size().get());
    if lock_page <= pager.max_page() {
        map.mark(lock_page, PageRole::LockByte, 0);
    }

    // Freelist.
    let freelist = walk_freelist(pager);
    for trunk in &freelist.trunks {
        map.mark(trunk.page, PageRole::FreelistTrunk, 0);
        for &leaf in &trunk.leaves {
            map.mark(leaf, PageRole::FreelistLeaf, trunk.page);
        }
    }
    if let Some(failure) = &freelist.failure {
        warn!(%failure, "freelist walk stopped early");
    }

    // Pointer-map positions.
    let ptrmap_scan = mark_ptrmap_pages(pager, &mut map);

    // Every b-tree, starting from the schema table on page 1.
    let mut walk_stats = BtreeWalkStats::default();
    let mut failed_roots = Vec::new();
    match walk_btree(pager, &mut map, 1, 0) {
        Ok(stats) => walk_stats.merge(stats),
        Err(e) => failed_roots.push(("sqlite_master".to_owned(), e.to_string())),
    }
    for entry in roots {
        match walk_btree(pager, &mut map, entry.root, 0) {
            Ok(stats) => walk_stats.merge(stats),
            Err(e) => {
                warn!(name = %entry.name, root = entry.root, error = %e, "root unwalkable");
                failed_roots.push((entry.name.clone(), e.to_string()));
            }
        }
    }

    // Whatever nothing claimed.
    let orphan_count = classify_orphans(pager, &mut map);

    let counts = RoleCounts::from_map(&map);
    let orphan_pages: Vec<u32> = map
        .iter()
        .filter(|&(_, role)| role.is_orphan())
        .map(|(p, _)| p)
        .collect();
    let unknown_pages = map.pages_with_role(PageRole::Unknown);

    info!(
        max_page = pager.max_page(),
        accounted = counts.total_accounted(),
        orphans = orphan_count,
        unknown = counts.unknown,
        conflicts = map.conflicts().len(),
        "accounting complete"
    );

    Ok(AccountReport {
        page_size: pager.page_size().get(),
        auto_vacuum: pager.header().auto_vacuum,
        header_page_count: pager.header().page_count,
        max_page: pager.max_page(),
        header_freelist_count: pager.header().freelist_count,
        counts,
        conflicts: map.conflicts().to_vec(),
        ghost_ptrmaps: ptrmap_scan.ghosts + walk_stats.ghost_ptrmaps,
        missing_ptrmaps: ptrmap_scan.missing,
        freelist_failure: freelist.failure,
        failed_roots,
        walk_stats,
        orphan_pages,
        unknown_pages,
    })
}

/// Page number containing the lock-byte offset for a given page size.
#[must_use]
pub const fn lock_byte_page(page_size: u32) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let page = (LOCK_BYTE_OFFSET / page_size as u64) as u32;
    page + 1
}

/// Write a list of page numbers, one per line, to `path`.
pub fn write_page_list(path: &Path, pages: &[u32]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for page in pages {
        writeln!(file, "{page}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_byte_page_positions() {
        // 1 GiB / 4096 = page index 262144, so page 262145 holds the offset.
        assert_eq!(lock_byte_page(4096), 262_145);
        assert_eq!(lock_byte_page(65_536), 16_385);
        assert_eq!(lock_byte_page(512), 2_097_153);
    }

    #[test]
    fn role_counts_totals() {
        let counts = RoleCounts {
            freelist_trunk: 1,
            freelist_leaf: 4,
            btree_leaf_table: 3,
            overflow: 2,
            orphan_empty: 1,
            ..RoleCounts::default()
        };
        assert_eq!(counts.total_freelist(), 5);
        assert_eq!(counts.total_btree(), 3);
        assert_eq!(counts.total_orphan(), 1);
        assert_eq!(counts.total_accounted(), 11);
    }

    #[test]
    fn write_page_list_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.txt");
        write_page_list(&path, &[3, 17, 255]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "3\n17\n255\n");
    }
}
