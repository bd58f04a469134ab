//! Per-page role classification.
//!
//! One run of the accountant owns a single [`PageMap`]: a role per page,
//! the parent pointer that claimed it, and every conflict observed along
//! the way. The map doubles as the walkers' visited set, which keeps cycle
//! detection O(1) per page and sized to the file.

use std::fmt;

use tracing::warn;

/// The role assigned to a page. Exactly one per page; `Unknown` means no
/// walker claimed it and the orphan scan could not recognize its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum PageRole {
    /// Not yet (or never) classified.
    Unknown,
    /// Freelist trunk page.
    FreelistTrunk,
    /// Freelist leaf page.
    FreelistLeaf,
    /// Reachable interior index b-tree page.
    BtreeInteriorIndex,
    /// Reachable interior table b-tree page.
    BtreeInteriorTable,
    /// Reachable leaf index b-tree page.
    BtreeLeafIndex,
    /// Reachable leaf table b-tree page.
    BtreeLeafTable,
    /// Overflow page reached from a cell.
    Overflow,
    /// Pointer-map page.
    Ptrmap,
    /// The lock-byte page (only present in files larger than 1 GiB).
    LockByte,
    /// Unreachable page shaped like an interior index page.
    OrphanInteriorIndex,
    /// Unreachable page shaped like an interior table page.
    OrphanInteriorTable,
    /// Unreachable page shaped like a leaf index page.
    OrphanLeafIndex,
    /// Unreachable page shaped like a leaf table page.
    OrphanLeafTable,
    /// Unreachable page shaped like an overflow page.
    OrphanOverflow,
    /// Unreachable all-zero page.
    OrphanEmpty,
}

impl PageRole {
    /// Display name, matching the accounting report vocabulary.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::FreelistTrunk => "Freelist Trunk",
            Self::FreelistLeaf => "Freelist Leaf",
            Self::BtreeInteriorIndex => "Btree Interior Index",
            Self::BtreeInteriorTable => "Btree Interior Table",
            Self::BtreeLeafIndex => "Btree Leaf Index",
            Self::BtreeLeafTable => "Btree Leaf Table",
            Self::Overflow => "Overflow",
            Self::Ptrmap => "Pointer Map",
            Self::LockByte => "Lock-byte",
            Self::OrphanInteriorIndex => "Orphan Btree Interior Index",
            Self::OrphanInteriorTable => "Orphan Btree Interior Table",
            Self::OrphanLeafIndex => "Orphan Btree Leaf Index",
            Self::OrphanLeafTable => "Orphan Btree Leaf Table",
            Self::OrphanOverflow => "Orphan Overflow",
            Self::OrphanEmpty => "Orphan Empty",
        }
    }

    /// Whether this is one of the orphan roles.
    #[must_use]
    pub const fn is_orphan(self) -> bool {
        matches!(
            self,
            Self::OrphanInteriorIndex
                | Self::OrphanInteriorTable
                | Self::OrphanLeafIndex
                | Self::OrphanLeafTable
                | Self::OrphanOverflow
                | Self::OrphanEmpty
        )
    }

    /// Whether this is a reachable b-tree role.
    #[must_use]
    pub const fn is_btree(self) -> bool {
        matches!(
            self,
            Self::BtreeInteriorIndex
                | Self::BtreeInteriorTable
                | Self::BtreeLeafIndex
                | Self::BtreeLeafTable
        )
    }

    /// Whether this is a freelist role.
    #[must_use]
    pub const fn is_freelist(self) -> bool {
        matches!(self, Self::FreelistTrunk | Self::FreelistLeaf)
    }
}

impl fmt::Display for PageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A page that two walkers both claimed, with the role and parent each
/// side asserted. Recording the conflict is the product of this suite;
/// the later claim wins the classification slot so the walk can go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ConflictRecord {
    /// The contested page.
    pub page: u32,
    /// Role it already held.
    pub first: PageRole,
    /// Parent recorded with the first claim.
    pub first_parent: u32,
    /// Role of the new claim.
    pub second: PageRole,
    /// Parent making the new claim.
    pub second_parent: u32,
}

impl fmt::Display for ConflictRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page {} claimed as both {} (parent {}) and {} (parent {})",
            self.page, self.first, self.first_parent, self.second, self.second_parent
        )
    }
}

/// Per-page classification for one accounting run.
#[derive(Debug)]
pub struct PageMap {
    /// `roles[pgno]` for pgno in 1..=max_page; slot 0 unused.
    roles: Vec<PageRole>,
    /// `parents[pgno]`: the page that claimed pgno (0 = root/none).
    parents: Vec<u32>,
    conflicts: Vec<ConflictRecord>,
    max_page: u32,
}

impl PageMap {
    /// Allocate a zeroed classification array for `max_page` pages.
    #[must_use]
    pub fn new(max_page: u32) -> Self {
        let len = max_page as usize + 1;
        Self {
            roles: vec![PageRole::Unknown; len],
            parents: vec![0; len],
            conflicts: Vec::new(),
            max_page,
        }
    }

    /// Highest page number this map covers.
    #[must_use]
    pub const fn max_page(&self) -> u32 {
        self.max_page
    }

    /// Current role of a page; out-of-range queries read as `Unknown`.
    #[must_use]
    pub fn role(&self, pgno: u32) -> PageRole {
        self.roles
            .get(pgno as usize)
            .copied()
            .unwrap_or(PageRole::Unknown)
    }

    /// Recorded parent of a page.
    #[must_use]
    pub fn parent(&self, pgno: u32) -> u32 {
        self.parents.get(pgno as usize).copied().unwrap_or(0)
    }

    /// Whether the page holds any non-`Unknown` role.
    #[must_use]
    pub fn is_classified(&self, pgno: u32) -> bool {
        self.role(pgno) != PageRole::Unknown
    }

    /// Claim `pgno` for `role` on behalf of `parent`.
    ///
    /// A claim over a different existing role records a conflict and then
    /// overwrites; out-of-range page numbers are ignored (the walkers
    /// range-check before following pointers, this is the last line).
    pub fn mark(&mut self, pgno: u32, role: PageRole, parent: u32) {
        if pgno < 1 || pgno > self.max_page {
            return;
        }
        let idx = pgno as usize;
        let existing = self.roles[idx];
        if existing != PageRole::Unknown && existing != role {
            let record = ConflictRecord {
                page: pgno,
                first: existing,
                first_parent: self.parents[idx],
                second: role,
                second_parent: parent,
            };
            warn!(%record, "classification conflict");
            self.conflicts.push(record);
        }
        self.roles[idx] = role;
        self.parents[idx] = parent;
    }

    /// Record a conflict observed without re-marking (used when a walker
    /// declines to enter a page another role already owns).
    pub fn record_conflict(&mut self, record: ConflictRecord) {
        warn!(%record, "classification conflict");
        self.conflicts.push(record);
    }

    /// All conflicts observed so far, in discovery order.
    #[must_use]
    pub fn conflicts(&self) -> &[ConflictRecord] {
        &self.conflicts
    }

    /// All pages currently holding `role`, ascending.
    #[must_use]
    pub fn pages_with_role(&self, role: PageRole) -> Vec<u32> {
        (1..=self.max_page)
            .filter(|&p| self.role(p) == role)
            .collect()
    }

    /// Iterate `(pgno, role)` over every page.
    pub fn iter(&self) -> impl Iterator<Item = (u32, PageRole)> + '_ {
        (1..=self.max_page).map(|p| (p, self.role(p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_map_is_all_unknown() {
        let map = PageMap::new(5);
        assert!((1..=5).all(|p| map.role(p) == PageRole::Unknown));
        assert!(map.conflicts().is_empty());
    }

    #[test]
    fn mark_and_query() {
        let mut map = PageMap::new(5);
        map.mark(2, PageRole::FreelistTrunk, 0);
        map.mark(3, PageRole::FreelistLeaf, 2);
        assert_eq!(map.role(2), PageRole::FreelistTrunk);
        assert_eq!(map.role(3), PageRole::FreelistLeaf);
        assert_eq!(map.parent(3), 2);
        assert!(map.is_classified(2));
        assert!(!map.is_classified(4));
    }

    #[test]
    fn conflicting_claim_is_recorded_and_overwrites() {
        let mut map = PageMap::new(5);
        map.mark(4, PageRole::FreelistLeaf, 2);
        map.mark(4, PageRole::BtreeLeafTable, 1);
        assert_eq!(map.conflicts().len(), 1);
        let c = map.conflicts()[0];
        assert_eq!(c.page, 4);
        assert_eq!(c.first, PageRole::FreelistLeaf);
        assert_eq!(c.second, PageRole::BtreeLeafTable);
        assert_eq!(map.role(4), PageRole::BtreeLeafTable);
    }

    #[test]
    fn same_role_reclaim_is_not_a_conflict() {
        let mut map = PageMap::new(5);
        map.mark(4, PageRole::FreelistLeaf, 2);
        map.mark(4, PageRole::FreelistLeaf, 3);
        assert!(map.conflicts().is_empty());
    }

    #[test]
    fn out_of_range_marks_are_ignored() {
        let mut map = PageMap::new(5);
        map.mark(0, PageRole::Overflow, 1);
        map.mark(6, PageRole::Overflow, 1);
        assert!(map.iter().all(|(_, r)| r == PageRole::Unknown));
    }

    #[test]
    fn pages_with_role_is_ascending() {
        let mut map = PageMap::new(6);
        map.mark(5, PageRole::Overflow, 1);
        map.mark(2, PageRole::Overflow, 1);
        assert_eq!(map.pages_with_role(PageRole::Overflow), vec![2, 5]);
    }

    #[test]
    fn role_predicates() {
        assert!(PageRole::OrphanEmpty.is_orphan());
        assert!(!PageRole::Overflow.is_orphan());
        assert!(PageRole::BtreeLeafTable.is_btree());
        assert!(!PageRole::OrphanLeafTable.is_btree());
        assert!(PageRole::FreelistTrunk.is_freelist());
        assert!(!PageRole::Ptrmap.is_freelist());
    }
}
