//! Schema-root enumeration straight from the file.
//!
//! The accountant needs the `(name, root_page)` pairs of every table and
//! index. Asking a SQLite library would be the comfortable route, but on a
//! corrupt database the library may refuse to open the file at all — so
//! this module walks the `sqlite_master` b-tree rooted at page 1 with the
//! same defensive machinery as every other walker and decodes the schema
//! records itself.
//!
//! Each `sqlite_master` row is `(type, name, tbl_name, rootpage, sql)`;
//! only the first, second and fourth columns matter here.

use pagesleuth_error::Result;
use pagesleuth_pager::Pager;
use pagesleuth_types::encoding::read_u32_be;
use pagesleuth_types::record::decode_record;
use pagesleuth_types::value::ColumnValue;
use tracing::{debug, warn};

use crate::cell::{BtreeType, PageHeader, ParsedCell, header_offset_for_page};
use crate::overflow::reassemble_payload;

/// What kind of object a schema root belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RootKind {
    /// A table b-tree (rowid keyed).
    Table,
    /// An index b-tree (payload keyed).
    Index,
}

impl std::fmt::Display for RootKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => f.write_str("table"),
            Self::Index => f.write_str("index"),
        }
    }
}

/// One schema object with a b-tree of its own.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RootEntry {
    /// Table or index.
    pub kind: RootKind,
    /// Object name as recorded in `sqlite_master`.
    pub name: String,
    /// Root page of its b-tree.
    pub root: u32,
}

/// Read every `(kind, name, root)` entry out of the `sqlite_master` tree.
///
/// Tolerates a damaged schema: unparseable cells and unreadable pages are
/// skipped with a diagnostic, and whatever rows decode are returned.
pub fn read_schema_roots(pager: &mut Pager) -> Result<Vec<RootEntry>> {
    let usable = pager.usable_size();
    let page_size = pager.page_size().as_usize();
    let mut entries = Vec::new();

    let mut stack = vec![1u32];
    let mut visited = std::collections::HashSet::new();

    while let Some(pgno) = stack.pop() {
        if pgno == 0 || !pager.in_range(pgno) || !visited.insert(pgno) {
            continue;
        }
        let page = match pager.read_raw_page(pgno) {
            Ok(page) => page,
            Err(e) => {
                warn!(page = pgno, error = %e, "schema page unreadable");
                continue;
            }
        };

        let hdr = header_offset_for_page(pgno);
        let Ok(header) = PageHeader::parse(&page, hdr) else {
            warn!(page = pgno, "schema page is not a b-tree page");
            continue;
        };
        if !header.btree_type.is_table() {
            warn!(page = pgno, "index page inside the schema tree, skipping");
            continue;
        }

        let n_cells = usize::from(header.cell_count).min(page_size / 2);
        let min_offset = hdr + header.btree_type.header_size();

        for i in 0..n_cells {
            let Some(raw_offset) = header.cell_pointer(&page, hdr, i) else {
                continue;
            };
            let cell_offset = usize::from(raw_offset);
            if cell_offset < min_offset || cell_offset >= page_size {
                continue;
            }

            if header.btree_type == BtreeType::InteriorTable {
                if let Some(child) = read_u32_be(&page[cell_offset..]) {
                    stack.push(child);
                }
                continue;
            }

            match ParsedCell::parse(&page, cell_offset, BtreeType::LeafTable, usable) {
                Ok(cell) => {
                    if let Some(entry) = decode_schema_row(pager, &page, &cell) {
                        debug!(kind = %entry.kind, name = %entry.name, root = entry.root, "schema root");
                        entries.push(entry);
                    }
                }
                Err(e) => {
                    warn!(page = pgno, cell = i, error = %e, "schema cell unparseable");
                }
            }
        }

        if let Some(right) = header.right_child {
            stack.push(right);
        }
    }

    Ok(entries)
}

/// Decode one `sqlite_master` row into a root entry, if it carries one.
fn decode_schema_row(pager: &mut Pager, page: &[u8], cell: &ParsedCell) -> Option<RootEntry> {
    let local = cell.local_payload(page);
    let payload;
    let record_bytes: &[u8] = if let Some(head) = cell.overflow_head {
        let (assembled, complete) =
            reassemble_payload(pager, local, head, cell.payload_size).ok()?;
        if !complete {
            warn!("schema record overflow chain incomplete, decoding prefix");
        }
        payload = assembled;
        &payload
    } else {
        local
    };

    let record = match decode_record(record_bytes) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "schema record undecodable");
            return None;
        }
    };

    // (type, name, tbl_name, rootpage, sql)
    let kind = match record.values.first()?.as_text()? {
        "table" => RootKind::Table,
        "index" => RootKind::Index,
        _ => return None, // views and triggers own no b-tree
    };
    let name = record.values.get(1)?.as_text()?.to_owned();
    let root = u32::try_from(record.values.get(3)?.as_integer()?).ok()?;
    if root == 0 {
        return None;
    }

    Some(RootEntry { kind, name, root })
}
