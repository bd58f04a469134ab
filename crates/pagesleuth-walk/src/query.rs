//! The externally useful queries, composed from the walkers.

use pagesleuth_error::{Result, SleuthError};
use pagesleuth_pager::Pager;
use pagesleuth_types::record::{DecodedRecord, decode_record};
use tracing::{debug, warn};

use crate::btree::{MAX_BTREE_DEPTH, walk_btree};
use crate::cell::{BtreeType, PageHeader, ParsedCell, header_offset_for_page};
use crate::classify::PageMap;
use crate::freelist::{FreelistFailure, TrunkInfo, walk_freelist};
use crate::overflow::reassemble_payload;
use crate::schema::{RootEntry, RootKind};

// ---------------------------------------------------------------------------
// freelist_check
// ---------------------------------------------------------------------------

/// Verdict of the freelist count cross-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FreelistVerdict {
    /// Observed count equals the header count.
    Match,
    /// The chain holds this many more pages than the header admits.
    Overage(u32),
    /// The chain holds this many fewer pages than the header claims.
    Shortage(u32),
}

/// Freelist integrity report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FreelistCheckReport {
    /// Page size in bytes.
    pub page_size: u32,
    /// Total pages in the file.
    pub total_pages: u32,
    /// First trunk pointer from the header.
    pub first_trunk: u32,
    /// Trunk pages observed.
    pub trunk_count: u32,
    /// Leaf pages observed.
    pub leaf_count: u32,
    /// Freelist page count the header claims.
    pub header_count: u32,
    /// Observed-versus-header verdict.
    pub verdict: FreelistVerdict,
    /// Per-trunk breakdown in chain order.
    pub trunks: Vec<TrunkInfo>,
    /// What stopped the walk early, if anything.
    pub failure: Option<FreelistFailure>,
}

/// Walk the freelist and compare what is actually chained against the
/// header's count.
pub fn freelist_check(pager: &mut Pager) -> FreelistCheckReport {
    let walk = walk_freelist(pager);
    let observed = walk.total();
    let header_count = pager.header().freelist_count;

    let verdict = if observed == header_count {
        FreelistVerdict::Match
    } else if observed > header_count {
        FreelistVerdict::Overage(observed - header_count)
    } else {
        FreelistVerdict::Shortage(header_count - observed)
    };

    FreelistCheckReport {
        page_size: pager.page_size().get(),
        total_pages: pager.max_page(),
        first_trunk: walk.first_trunk,
        trunk_count: walk.trunk_count(),
        leaf_count: walk.leaf_count(),
        header_count,
        verdict,
        trunks: walk.trunks,
        failure: walk.failure,
    }
}

// ---------------------------------------------------------------------------
// find_conflicts
// ---------------------------------------------------------------------------

/// Pages claimed by both the freelist and a live b-tree.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConflictReport {
    /// Pages present in both sets, ascending.
    pub conflicts: Vec<u32>,
    /// Size of the freelist set.
    pub freelist_pages: u32,
    /// Size of the in-use set.
    pub btree_pages: u32,
}

/// Collect two independent bitsets — pages in the freelist chain and pages
/// reachable from the b-tree roots — and report the intersection. On a
/// healthy database the two are disjoint; any overlap is the corruption
/// `PRAGMA integrity_check` trips over.
pub fn find_conflicts(pager: &mut Pager, roots: &[RootEntry]) -> Result<ConflictReport> {
    let max_page = pager.max_page();

    let walk = walk_freelist(pager);
    let mut in_freelist = vec![false; max_page as usize + 1];
    for page in walk.pages() {
        if let Some(slot) = in_freelist.get_mut(page as usize) {
            *slot = true;
        }
    }

    // A fresh map, untouched by the freelist, so the two sets stay honest.
    let mut map = PageMap::new(max_page);
    if let Err(e) = walk_btree(pager, &mut map, 1, 0) {
        warn!(error = %e, "schema tree unwalkable");
    }
    for entry in roots {
        if let Err(e) = walk_btree(pager, &mut map, entry.root, 0) {
            warn!(name = %entry.name, root = entry.root, error = %e, "root unwalkable");
        }
    }

    let mut conflicts = Vec::new();
    let mut freelist_pages = 0u32;
    let mut btree_pages = 0u32;
    for pgno in 1..=max_page {
        let in_fl = in_freelist[pgno as usize];
        let in_use = map.is_classified(pgno);
        freelist_pages += u32::from(in_fl);
        btree_pages += u32::from(in_use);
        if in_fl && in_use {
            conflicts.push(pgno);
        }
    }

    Ok(ConflictReport {
        conflicts,
        freelist_pages,
        btree_pages,
    })
}

// ---------------------------------------------------------------------------
// page_owner
// ---------------------------------------------------------------------------

/// One schema object whose walk reaches the queried page.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct OwnerHit {
    /// Table or index.
    pub kind: RootKind,
    /// Object name.
    pub name: String,
    /// Root page of the owning tree.
    pub root: u32,
}

/// Ownership answer for one queried page.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PageOwnerReport {
    /// The queried page.
    pub page: u32,
    /// Whether the page number is valid for this file at all.
    pub in_range: bool,
    /// Every object whose independent walk reached the page.
    pub owners: Vec<OwnerHit>,
}

/// For each queried page, walk every tree independently (fresh bitset per
/// root, so a shared page reports every owner) and list the objects that
/// reach it.
pub fn page_owner(
    pager: &mut Pager,
    roots: &[RootEntry],
    pages: &[u32],
) -> Result<Vec<PageOwnerReport>> {
    let max_page = pager.max_page();

    // The schema tree itself participates: overflow of a long CREATE
    // statement lives somewhere too.
    let mut all_roots = vec![RootEntry {
        kind: RootKind::Table,
        name: "sqlite_master".to_owned(),
        root: 1,
    }];
    all_roots.extend(roots.iter().cloned());

    let mut reports: Vec<PageOwnerReport> = pages
        .iter()
        .map(|&page| PageOwnerReport {
            page,
            in_range: page >= 1 && page <= max_page,
            owners: Vec::new(),
        })
        .collect();

    for entry in &all_roots {
        let mut map = PageMap::new(max_page);
        if let Err(e) = walk_btree(pager, &mut map, entry.root, 0) {
            warn!(name = %entry.name, root = entry.root, error = %e, "root unwalkable");
            continue;
        }
        for report in &mut reports {
            if report.in_range && map.is_classified(report.page) {
                report.owners.push(OwnerHit {
                    kind: entry.kind,
                    name: entry.name.clone(),
                    root: entry.root,
                });
            }
        }
    }

    Ok(reports)
}

// ---------------------------------------------------------------------------
// dump_rowid
// ---------------------------------------------------------------------------

/// Raw dump of one table row located by rowid.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RowidDump {
    /// The rowid that was found.
    pub rowid: i64,
    /// Root page the descent started from.
    pub root: u32,
    /// Leaf page holding the cell.
    pub page: u32,
    /// Cell index within the leaf.
    pub cell_index: usize,
    /// Byte offset of the cell on the page.
    pub cell_offset: usize,
    /// Total payload size (local + overflow).
    pub payload_size: u32,
    /// Bytes of payload stored on the leaf itself.
    pub local_size: u32,
    /// First overflow page, when the payload spills.
    pub overflow_head: Option<u32>,
    /// The payload bytes recovered (all of them when the overflow chain was
    /// intact, the local prefix otherwise).
    pub payload: Vec<u8>,
    /// Whether `payload` covers all `payload_size` bytes.
    pub payload_complete: bool,
    /// The parsed record, when the header decoded.
    pub record: Option<DecodedRecord>,
    /// Why the record did not decode, when it did not.
    pub record_error: Option<String>,
}

/// Descend the table b-tree rooted at `root` to the leaf cell keyed
/// `rowid` and dump its record.
///
/// Interior keys are upper bounds for their left subtree, so the descent
/// takes the first cell whose key is `>= rowid` (an equal key lives down
/// the left child, not in the next sibling) and otherwise the rightmost
/// child. Missing rowids are an error so the tools can exit non-zero.
pub fn dump_rowid(pager: &mut Pager, root: u32, rowid: i64) -> Result<RowidDump> {
    if !pager.in_range(root) {
        return Err(SleuthError::PageOutOfRange {
            page: root,
            max_page: pager.max_page(),
        });
    }

    let usable = pager.usable_size();
    let page_size = pager.page_size().as_usize();
    let mut pgno = root;

    for _depth in 0..=MAX_BTREE_DEPTH {
        let page = pager.read_raw_page(pgno)?;
        let hdr = header_offset_for_page(pgno);
        let header = PageHeader::parse(&page, hdr)?;
        let n_cells = usize::from(header.cell_count).min(page_size / 2);
        let min_offset = hdr + header.btree_type.header_size();

        match header.btree_type {
            BtreeType::LeafTable => {
                for i in 0..n_cells {
                    let Some(raw_offset) = header.cell_pointer(&page, hdr, i) else {
                        continue;
                    };
                    let cell_offset = usize::from(raw_offset);
                    if cell_offset < min_offset || cell_offset >= page_size {
                        continue;
                    }
                    let cell = match ParsedCell::parse(&page, cell_offset, BtreeType::LeafTable, usable)
                    {
                        Ok(cell) => cell,
                        Err(e) => {
                            warn!(page = pgno, cell = i, error = %e, "cell unparseable");
                            continue;
                        }
                    };
                    if cell.rowid == Some(rowid) {
                        debug!(page = pgno, cell = i, "rowid located");
                        return Ok(build_dump(pager, &page, pgno, i, cell_offset, &cell, root));
                    }
                }
                return Err(SleuthError::RowidNotFound { rowid });
            }

            BtreeType::InteriorTable => {
                let mut next = header.right_child.ok_or_else(|| {
                    SleuthError::corrupt("interior page without rightmost child")
                })?;
                for i in 0..n_cells {
                    let Some(raw_offset) = header.cell_pointer(&page, hdr, i) else {
                        continue;
                    };
                    let cell_offset = usize::from(raw_offset);
                    if cell_offset < min_offset || cell_offset >= page_size {
                        continue;
                    }
                    let Ok(cell) =
                        ParsedCell::parse(&page, cell_offset, BtreeType::InteriorTable, usable)
                    else {
                        continue;
                    };
                    if let (Some(child), Some(key)) = (cell.left_child, cell.rowid) {
                        if rowid <= key {
                            next = child;
                            break;
                        }
                    }
                }
                if !pager.in_range(next) {
                    return Err(SleuthError::PageOutOfRange {
                        page: next,
                        max_page: pager.max_page(),
                    });
                }
                pgno = next;
            }

            other => {
                return Err(SleuthError::corrupt(format!(
                    "page {pgno} is a {other:?} page, not part of a table b-tree"
                )));
            }
        }
    }

    Err(SleuthError::DepthExceeded {
        page: pgno,
        depth: MAX_BTREE_DEPTH,
    })
}

fn build_dump(
    pager: &mut Pager,
    page: &[u8],
    pgno: u32,
    cell_index: usize,
    cell_offset: usize,
    cell: &ParsedCell,
    root: u32,
) -> RowidDump {
    let local = cell.local_payload(page);

    let (payload, payload_complete) = match cell.overflow_head {
        Some(head) if head != 0 && pager.in_range(head) => {
            match reassemble_payload(pager, local, head, cell.payload_size) {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "overflow reassembly failed, dumping local prefix");
                    (local.to_vec(), false)
                }
            }
        }
        Some(head) => {
            warn!(head, "overflow head invalid, dumping local prefix");
            (local.to_vec(), false)
        }
        None => (local.to_vec(), true),
    };

    let (record, record_error) = match decode_record(&payload) {
        Ok(record) => (Some(record), None),
        Err(e) => (None, Some(e.to_string())),
    };

    RowidDump {
        rowid: cell.rowid.unwrap_or_default(),
        root,
        page: pgno,
        cell_index,
        cell_offset,
        payload_size: cell.payload_size,
        local_size: cell.local_size,
        overflow_head: cell.overflow_head,
        payload,
        payload_complete,
        record,
        record_error,
    }
}
