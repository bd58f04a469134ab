//! The page-graph walker and accounting engine.
//!
//! This crate decodes b-tree, freelist, overflow and pointer-map structure
//! straight from page bytes, follows every reachable pointer, classifies
//! every page in the file into exactly one role, and cross-checks the
//! result against the header's own claims. The input is assumed hostile:
//! every varint, offset, length and page pointer read from the file is
//! bounds-checked before use, recursion is depth-capped, and chains carry
//! cycle guards.
//!
//! The externally useful entry points are the query functions in [`query`]
//! and the full accounting pass in [`account`].

pub mod account;
pub mod btree;
pub mod cell;
pub mod classify;
pub mod freelist;
pub mod orphan;
pub mod overflow;
pub mod ptrmap;
pub mod query;
pub mod scan;
pub mod schema;

pub use account::{AccountReport, RoleCounts, account, write_page_list};
pub use btree::BtreeWalkStats;
pub use cell::{BtreeType, ParsedCell, PageHeader};
pub use classify::{ConflictRecord, PageMap, PageRole};
pub use freelist::{FreelistFailure, FreelistWalk, TrunkInfo, walk_freelist};
pub use query::{
    ConflictReport, FreelistCheckReport, FreelistVerdict, OwnerHit, PageOwnerReport, RowidDump,
    dump_rowid, find_conflicts, freelist_check, page_owner,
};
pub use scan::{TableScanReport, scan_table};
pub use schema::{RootEntry, RootKind, read_schema_roots};
