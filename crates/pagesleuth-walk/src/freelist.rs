//! Freelist chain walker.
//!
//! Trunk pages form a singly-linked list from the header's first-trunk
//! pointer; each trunk carries a next pointer, a leaf count, and that many
//! 4-byte leaf page numbers. On a corrupt database the chain can loop,
//! point off the end of the file, or declare more leaves than fit on the
//! page — the walk survives all three, records what happened, and reports
//! everything it managed to observe before stopping.

use std::collections::HashSet;

use pagesleuth_pager::Pager;
use pagesleuth_types::encoding::read_u32_be;
use tracing::{debug, warn};

/// Cap on the cycle-detection set. Past this many distinct trunks the
/// walk keeps going but can no longer prove the chain is acyclic.
pub const MAX_TRUNK_CYCLE_CHECK: usize = 10_000;

/// One trunk page as observed on disk.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TrunkInfo {
    /// Page number of this trunk.
    pub page: u32,
    /// Next trunk in the chain (0 terminates).
    pub next: u32,
    /// Leaf count as the trunk declares it.
    pub declared_leaves: u32,
    /// True when `declared_leaves` exceeded `(pagesize - 8) / 4` and the
    /// walk clamped it.
    pub clamped: bool,
    /// The leaf page numbers actually read (after clamping).
    pub leaves: Vec<u32>,
}

/// Why a freelist walk stopped before reaching a 0 next-pointer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum FreelistFailure {
    /// The chain revisited a trunk page.
    Cycle { page: u32 },
    /// A trunk or leaf pointer fell outside `1..=max_page`.
    OutOfRange { page: u32 },
    /// A trunk page could not be read.
    Read { page: u32, detail: String },
}

impl std::fmt::Display for FreelistFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cycle { page } => write!(f, "cycle in freelist at page {page}"),
            Self::OutOfRange { page } => write!(f, "freelist pointer {page} out of range"),
            Self::Read { page, detail } => {
                write!(f, "failed to read freelist trunk {page}: {detail}")
            }
        }
    }
}

/// Everything one pass over the freelist chain observed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FreelistWalk {
    /// First trunk pointer from the header (0 = empty freelist).
    pub first_trunk: u32,
    /// Trunks in chain order.
    pub trunks: Vec<TrunkInfo>,
    /// What stopped the walk, if anything did.
    pub failure: Option<FreelistFailure>,
}

impl FreelistWalk {
    /// Number of trunk pages observed.
    #[must_use]
    pub fn trunk_count(&self) -> u32 {
        u32::try_from(self.trunks.len()).unwrap_or(u32::MAX)
    }

    /// Number of leaf pages observed.
    #[must_use]
    pub fn leaf_count(&self) -> u32 {
        self.trunks
            .iter()
            .map(|t| u32::try_from(t.leaves.len()).unwrap_or(u32::MAX))
            .fold(0, u32::saturating_add)
    }

    /// Total observed freelist pages, trunks plus leaves.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.trunk_count().saturating_add(self.leaf_count())
    }

    /// Every page in the freelist, trunks and leaves, in observation order.
    pub fn pages(&self) -> impl Iterator<Item = u32> + '_ {
        self.trunks
            .iter()
            .flat_map(|t| std::iter::once(t.page).chain(t.leaves.iter().copied()))
    }
}

/// Walk the freelist chain from the header's first-trunk pointer.
///
/// Never fails at the type level: whatever was observed before a cycle,
/// range violation, or read error is returned alongside the failure.
pub fn walk_freelist(pager: &mut Pager) -> FreelistWalk {
    let first_trunk = pager.header().freelist_trunk;
    let max_leaves = (pager.page_size().get() - 8) / 4;

    let mut walk = FreelistWalk {
        first_trunk,
        trunks: Vec::new(),
        failure: None,
    };

    let mut visited: HashSet<u32> = HashSet::new();
    let mut pgno = first_trunk;

    while pgno != 0 {
        if visited.contains(&pgno) {
            warn!(page = pgno, "cycle in freelist chain");
            walk.failure = Some(FreelistFailure::Cycle { page: pgno });
            return walk;
        }
        if visited.len() < MAX_TRUNK_CYCLE_CHECK {
            visited.insert(pgno);
        }

        if !pager.in_range(pgno) {
            warn!(page = pgno, "freelist trunk pointer out of range");
            walk.failure = Some(FreelistFailure::OutOfRange { page: pgno });
            return walk;
        }

        let page = match pager.read_raw_page(pgno) {
            Ok(page) => page,
            Err(e) => {
                walk.failure = Some(FreelistFailure::Read {
                    page: pgno,
                    detail: e.to_string(),
                });
                return walk;
            }
        };

        let next = read_u32_be(&page[0..4]).expect("page holds at least 8 bytes");
        let declared_leaves = read_u32_be(&page[4..8]).expect("page holds at least 8 bytes");

        // Clamp an absurd count but keep walking: the rest of the chain is
        // still worth observing.
        let clamped = declared_leaves > max_leaves;
        let n_leaves = if clamped {
            warn!(
                page = pgno,
                declared = declared_leaves,
                max = max_leaves,
                "trunk declares more leaves than fit on the page"
            );
            max_leaves
        } else {
            declared_leaves
        };

        let mut leaves = Vec::with_capacity(n_leaves as usize);
        for i in 0..n_leaves {
            let off = 8 + (i as usize) * 4;
            let leaf = read_u32_be(&page[off..off + 4]).expect("clamped to page");
            if leaf == 0 || !pager.in_range(leaf) {
                warn!(trunk = pgno, leaf, "freelist leaf pointer out of range");
                walk.trunks.push(TrunkInfo {
                    page: pgno,
                    next,
                    declared_leaves,
                    clamped,
                    leaves,
                });
                walk.failure = Some(FreelistFailure::OutOfRange { page: leaf });
                return walk;
            }
            leaves.push(leaf);
        }

        debug!(
            trunk = pgno,
            next,
            leaves = leaves.len(),
            "observed freelist trunk"
        );
        walk.trunks.push(TrunkInfo {
            page: pgno,
            next,
            declared_leaves,
            clamped,
            leaves,
        });
        pgno = next;
    }

    walk
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    use pagesleuth_types::DATABASE_HEADER_MAGIC;

    const PAGE: usize = 512;

    /// Build a database image with the given number of pages and a header
    /// pointing at `first_trunk`.
    fn image(pages: u32, first_trunk: u32, freelist_count: u32) -> Vec<u8> {
        let mut data = vec![0u8; PAGE * pages as usize];
        data[..16].copy_from_slice(DATABASE_HEADER_MAGIC);
        data[16..18].copy_from_slice(&512u16.to_be_bytes());
        data[21] = 64;
        data[22] = 32;
        data[23] = 32;
        data[28..32].copy_from_slice(&pages.to_be_bytes());
        data[32..36].copy_from_slice(&first_trunk.to_be_bytes());
        data[36..40].copy_from_slice(&freelist_count.to_be_bytes());
        data
    }

    fn set_trunk(data: &mut [u8], pgno: u32, next: u32, leaves: &[u32]) {
        let base = (pgno as usize - 1) * PAGE;
        data[base..base + 4].copy_from_slice(&next.to_be_bytes());
        let count = u32::try_from(leaves.len()).unwrap();
        data[base + 4..base + 8].copy_from_slice(&count.to_be_bytes());
        for (i, leaf) in leaves.iter().enumerate() {
            let off = base + 8 + i * 4;
            data[off..off + 4].copy_from_slice(&leaf.to_be_bytes());
        }
    }

    fn open(data: &[u8]) -> (tempfile::TempDir, Pager) {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("fl.db");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        drop(f);
        let pager = Pager::open(&path).unwrap();
        (dir, pager)
    }

    #[test]
    fn empty_freelist() {
        let (_d, mut pager) = open(&image(3, 0, 0));
        let walk = walk_freelist(&mut pager);
        assert!(walk.trunks.is_empty());
        assert_eq!(walk.total(), 0);
        assert!(walk.failure.is_none());
    }

    #[test]
    fn two_trunk_chain() {
        let mut data = image(8, 2, 5);
        set_trunk(&mut data, 2, 5, &[3, 4]);
        set_trunk(&mut data, 5, 0, &[6]);
        let (_d, mut pager) = open(&data);

        let walk = walk_freelist(&mut pager);
        assert!(walk.failure.is_none());
        assert_eq!(walk.trunk_count(), 2);
        assert_eq!(walk.leaf_count(), 3);
        assert_eq!(walk.total(), 5);
        assert_eq!(walk.trunks[0].leaves, vec![3, 4]);
        assert_eq!(walk.trunks[1].next, 0);
        let pages: Vec<u32> = walk.pages().collect();
        assert_eq!(pages, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn trunk_with_zero_leaves_continues_chain() {
        let mut data = image(6, 2, 2);
        set_trunk(&mut data, 2, 4, &[]);
        set_trunk(&mut data, 4, 0, &[5]);
        let (_d, mut pager) = open(&data);

        let walk = walk_freelist(&mut pager);
        assert!(walk.failure.is_none());
        assert_eq!(walk.trunk_count(), 2);
        assert_eq!(walk.trunks[0].leaves, Vec::<u32>::new());
        assert_eq!(walk.trunks[1].leaves, vec![5]);
    }

    #[test]
    fn cycle_is_detected() {
        let mut data = image(6, 2, 2);
        set_trunk(&mut data, 2, 4, &[]);
        set_trunk(&mut data, 4, 2, &[]); // back-edge
        let (_d, mut pager) = open(&data);

        let walk = walk_freelist(&mut pager);
        assert_eq!(walk.failure, Some(FreelistFailure::Cycle { page: 2 }));
        // Both trunks were still observed before the cycle closed.
        assert_eq!(walk.trunk_count(), 2);
    }

    #[test]
    fn out_of_range_trunk_pointer_stops_walk() {
        let mut data = image(6, 2, 1);
        set_trunk(&mut data, 2, 999, &[]);
        let (_d, mut pager) = open(&data);

        let walk = walk_freelist(&mut pager);
        assert_eq!(walk.failure, Some(FreelistFailure::OutOfRange { page: 999 }));
        assert_eq!(walk.trunk_count(), 1);
    }

    #[test]
    fn out_of_range_leaf_stops_walk_but_keeps_earlier_leaves() {
        let mut data = image(6, 2, 3);
        set_trunk(&mut data, 2, 0, &[3, 777, 4]);
        let (_d, mut pager) = open(&data);

        let walk = walk_freelist(&mut pager);
        assert_eq!(walk.failure, Some(FreelistFailure::OutOfRange { page: 777 }));
        assert_eq!(walk.trunks[0].leaves, vec![3]);
    }

    #[test]
    fn absurd_leaf_count_is_clamped_and_chain_continues() {
        let mut data = image(6, 2, 2);
        // Declare far more leaves than fit; the real array region is zeros,
        // which would be out-of-range leaves, so point the leaves at real
        // pages for the clamped prefix only.
        set_trunk(&mut data, 2, 4, &[]);
        let base = PAGE; // page 2
        data[base + 4..base + 8].copy_from_slice(&100_000u32.to_be_bytes());
        // Fill the whole leaf array with page 3 so every clamped entry is valid.
        let max_leaves = (PAGE - 8) / 4;
        for i in 0..max_leaves {
            let off = base + 8 + i * 4;
            data[off..off + 4].copy_from_slice(&3u32.to_be_bytes());
        }
        set_trunk(&mut data, 4, 0, &[5]);
        let (_d, mut pager) = open(&data);

        let walk = walk_freelist(&mut pager);
        assert!(walk.failure.is_none());
        assert_eq!(walk.trunks[0].declared_leaves, 100_000);
        assert!(walk.trunks[0].clamped);
        assert_eq!(walk.trunks[0].leaves.len(), max_leaves);
        // The chain continued past the damaged trunk.
        assert_eq!(walk.trunks[1].page, 4);
    }
}
