//! Thin presenters over the walk engine.
//!
//! Each subcommand maps onto one query; the engine produces the report and
//! everything here is formatting. Schema roots come from the engine's own
//! raw schema-page reader, so the tools work on databases a SQLite library
//! would refuse to open.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use pagesleuth_error::{Result, SleuthError};
use pagesleuth_pager::Pager;
use pagesleuth_types::ColumnValue;
use pagesleuth_types::serial_type::describe_serial_type;
use pagesleuth_walk::{
    AccountReport, FreelistVerdict, account, dump_rowid, find_conflicts, freelist_check,
    page_owner, read_schema_roots, scan_table, write_page_list,
};

const USAGE: &str = "\
Usage: pagesleuth <COMMAND> [ARGS]

Commands:
  freelist-check DB                      walk the freelist and cross-check the header count
  account DB [--json]                    classify every page and report totals
  find-conflicts DB [--json]             pages claimed by both the freelist and a b-tree
  page-owner DB PAGE [PAGE...]           which table or index reaches a page
  dump-row DB TABLE ROWID                locate a rowid and dump its raw record
  table-walk DB TABLE [--json]           scan one table b-tree with per-cell validation

RUST_LOG=pagesleuth_walk=debug exposes the walk trace.";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("ERROR: {e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

fn run(args: &[String]) -> Result<u8> {
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        return Ok(2);
    };

    match command.as_str() {
        "freelist-check" => cmd_freelist_check(require_db(args)?),
        "account" => cmd_account(require_db(args)?, has_flag(args, "--json")),
        "find-conflicts" => cmd_find_conflicts(require_db(args)?, has_flag(args, "--json")),
        "page-owner" => cmd_page_owner(require_db(args)?, &args[2..]),
        "dump-row" => cmd_dump_row(args),
        "table-walk" => cmd_table_walk(args, has_flag(args, "--json")),
        _ => {
            eprintln!("{USAGE}");
            Ok(2)
        }
    }
}

fn require_db(args: &[String]) -> Result<PathBuf> {
    args.get(1)
        .map(PathBuf::from)
        .ok_or_else(|| SleuthError::internal(format!("missing DATABASE argument\n{USAGE}")))
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn banner(pager: &Pager) {
    println!("Database: {}", pager.path().display());
    println!("Page size: {} bytes", pager.page_size());
    println!("Total pages: {}", pager.max_page());
}

// ---------------------------------------------------------------------------
// freelist-check
// ---------------------------------------------------------------------------

fn cmd_freelist_check(db: PathBuf) -> Result<u8> {
    let mut pager = Pager::open(db)?;
    banner(&pager);
    println!("First freelist trunk: {}", pager.header().freelist_trunk);
    println!(
        "Freelist count (from header): {}",
        pager.header().freelist_count
    );
    println!();

    let report = freelist_check(&mut pager);

    if report.first_trunk == 0 {
        println!("Freelist is empty.");
    }
    for (i, trunk) in report.trunks.iter().enumerate() {
        println!("Trunk page {} (trunk #{}):", trunk.page, i + 1);
        println!("  Next trunk: {}", trunk.next);
        println!("  Leaf count: {}", trunk.declared_leaves);
        if trunk.clamped {
            println!("  (leaf count invalid, clamped to {})", trunk.leaves.len());
        }
        if !trunk.leaves.is_empty() {
            print!("  Leaf pages:");
            for (j, leaf) in trunk.leaves.iter().enumerate() {
                if j % 8 == 0 {
                    print!("\n    ");
                }
                print!("{leaf} ");
            }
            println!();
        }
        println!();
    }

    println!("=== FREELIST SUMMARY ===");
    println!("Trunk pages: {}", report.trunk_count);
    println!("Leaf pages:  {}", report.leaf_count);
    println!("Total:       {}", report.trunk_count + report.leaf_count);
    println!();
    println!("Header says: {} freelist pages", report.header_count);
    match report.verdict {
        FreelistVerdict::Match => println!("Freelist count matches header"),
        FreelistVerdict::Overage(n) => {
            println!(
                "MISMATCH: the chain contains {n} page(s) more than the header admits"
            );
        }
        FreelistVerdict::Shortage(n) => {
            println!(
                "MISMATCH: the chain contains {n} page(s) fewer than the header claims"
            );
        }
    }

    if let Some(failure) = &report.failure {
        println!();
        println!("Walk stopped early: {failure}");
        return Ok(1);
    }
    Ok(0)
}

// ---------------------------------------------------------------------------
// account
// ---------------------------------------------------------------------------

fn cmd_account(db: PathBuf, json: bool) -> Result<u8> {
    let mut pager = Pager::open(&db)?;
    let roots = read_schema_roots(&mut pager)?;
    let report = account(&mut pager, &roots)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report).expect("report serializes"));
        return Ok(0);
    }

    banner(&pager);
    print_account(&report, db.parent().unwrap_or_else(|| Path::new(".")));
    Ok(0)
}

fn print_account(report: &AccountReport, list_dir: &Path) {
    println!();
    println!("=== PAGE ACCOUNTING REPORT ===");
    println!();
    println!("Database settings:");
    println!("  Page size:             {} bytes", report.page_size);
    let vacuum_label = match report.auto_vacuum {
        0 => "(NONE)",
        1 => "(FULL)",
        2 => "(INCREMENTAL)",
        _ => "(UNKNOWN)",
    };
    println!(
        "  Auto-vacuum mode:      {} {vacuum_label}",
        report.auto_vacuum
    );
    println!();
    println!("Page counts:");
    println!("  Header says:           {} pages", report.header_page_count);
    println!("  File size calculates:  {} pages", report.max_page);
    if report.header_page_count != report.max_page {
        println!(
            "  MISMATCH: {:+} pages",
            i64::from(report.max_page) - i64::from(report.header_page_count)
        );
    }
    println!();

    let c = &report.counts;
    println!("Page counts by type:");
    println!("  Freelist Trunk:        {:5}", c.freelist_trunk);
    println!("  Freelist Leaf:         {:5}", c.freelist_leaf);
    println!("  Btree Interior Index:  {:5}", c.btree_interior_index);
    println!("  Btree Interior Table:  {:5}", c.btree_interior_table);
    println!("  Btree Leaf Index:      {:5}", c.btree_leaf_index);
    println!("  Btree Leaf Table:      {:5}", c.btree_leaf_table);
    println!("  Overflow:              {:5}", c.overflow);
    println!("  Pointer Map:           {:5}", c.ptrmap);
    println!("  Lock-byte:             {:5}", c.lock_byte);

    if c.total_orphan() > 0 {
        println!();
        println!("Orphaned (unaccounted) pages:");
        println!("  Orphan Btree Leaf Table:      {:5}", c.orphan_leaf_table);
        println!("  Orphan Btree Leaf Index:      {:5}", c.orphan_leaf_index);
        println!(
            "  Orphan Btree Interior Table:  {:5}",
            c.orphan_interior_table
        );
        println!(
            "  Orphan Btree Interior Index:  {:5}",
            c.orphan_interior_index
        );
        println!("  Orphan Overflow:              {:5}", c.orphan_overflow);
        println!("  Orphan Empty:                 {:5}", c.orphan_empty);
        println!("  Total orphaned:               {:5}", c.total_orphan());
    }

    println!();
    println!("  UNKNOWN/Unclassified:  {:5}", c.unknown);
    println!("  Total:                 {:5}", report.max_page);
    println!();
    println!("Summary:");
    println!(
        "  Total freelist pages:  {} (header says {})",
        c.total_freelist(),
        report.header_freelist_count
    );
    println!("  Total btree pages:     {}", c.total_btree());
    println!("  Total overflow pages:  {}", c.overflow);
    println!("  Total accounted for:   {}", c.total_accounted());

    if report.freelist_delta() != 0 {
        println!();
        println!("WARNING: freelist count mismatch!");
        println!(
            "  Found {} freelist pages but header says {} (difference {:+})",
            c.total_freelist(),
            report.header_freelist_count,
            report.freelist_delta()
        );
    }
    if let Some(failure) = &report.freelist_failure {
        println!("WARNING: freelist walk stopped early: {failure}");
    }
    if report.ghost_ptrmaps > 0 {
        println!();
        println!("WARNING: ghost pointer-map pages detected!");
        println!(
            "  Auto-vacuum is disabled but {} page(s) at ptrmap positions contain",
            report.ghost_ptrmaps
        );
        println!("  valid ptrmap data, left over from a former auto-vacuum configuration.");
    }
    if report.auto_vacuum != 0 && report.counts.ptrmap == 0 {
        println!();
        println!("WARNING: auto-vacuum enabled but no ptrmap pages found!");
    }
    if report.missing_ptrmaps > 0 {
        println!();
        println!(
            "WARNING: {} expected pointer-map position(s) missing or corrupt.",
            report.missing_ptrmaps
        );
    }
    for conflict in &report.conflicts {
        println!("CONFLICT: {conflict}");
    }
    for (name, reason) in &report.failed_roots {
        println!("WARNING: root '{name}' could not be walked: {reason}");
    }

    if !report.orphan_pages.is_empty() {
        let path = list_dir.join("orphaned_pages.txt");
        match write_page_list(&path, &report.orphan_pages) {
            Ok(()) => println!(
                "All {} orphaned pages written to: {}",
                report.orphan_pages.len(),
                path.display()
            ),
            Err(e) => println!("Could not write orphan list: {e}"),
        }
    }
    if !report.unknown_pages.is_empty() {
        let path = list_dir.join("unaccounted_pages.txt");
        match write_page_list(&path, &report.unknown_pages) {
            Ok(()) => println!(
                "All {} unaccounted pages written to: {}",
                report.unknown_pages.len(),
                path.display()
            ),
            Err(e) => println!("Could not write unaccounted list: {e}"),
        }
    }

    println!();
    if report.fully_accounted() {
        println!("All pages accounted for.");
    } else {
        println!(
            "{} unclassified page(s), {} conflict(s).",
            c.unknown,
            report.conflicts.len()
        );
    }
}

// ---------------------------------------------------------------------------
// find-conflicts
// ---------------------------------------------------------------------------

fn cmd_find_conflicts(db: PathBuf, json: bool) -> Result<u8> {
    let mut pager = Pager::open(db)?;
    let roots = read_schema_roots(&mut pager)?;
    let report = find_conflicts(&mut pager, &roots)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report).expect("report serializes"));
        return Ok(0);
    }

    banner(&pager);
    println!();
    println!("Freelist pages: {}", report.freelist_pages);
    println!("In-use pages:   {}", report.btree_pages);
    println!();
    if report.conflicts.is_empty() {
        println!("No conflicts found - freelist and in-use pages are disjoint.");
    } else {
        for page in &report.conflicts {
            println!("CONFLICT: Page {page} is in BOTH freelist AND in use!");
        }
        println!();
        println!("Total conflicts: {}", report.conflicts.len());
    }
    Ok(0)
}

// ---------------------------------------------------------------------------
// page-owner
// ---------------------------------------------------------------------------

fn cmd_page_owner(db: PathBuf, rest: &[String]) -> Result<u8> {
    let pages: Vec<u32> = rest
        .iter()
        .filter(|a| !a.starts_with("--"))
        .map(|a| {
            a.parse()
                .map_err(|_| SleuthError::internal(format!("invalid page number: {a}")))
        })
        .collect::<Result<_>>()?;
    if pages.is_empty() {
        return Err(SleuthError::internal(format!(
            "page-owner needs at least one PAGE\n{USAGE}"
        )));
    }

    let mut pager = Pager::open(db)?;
    let roots = read_schema_roots(&mut pager)?;
    banner(&pager);
    println!("Schema entries: {}", roots.len());
    println!();

    let reports = page_owner(&mut pager, &roots, &pages)?;
    for report in reports {
        println!("Page {}:", report.page);
        if !report.in_range {
            println!("  ERROR: Invalid page number");
        } else if report.owners.is_empty() {
            println!("  Not found in any table/index (possibly freelist, lock-byte page, or ptrmap)");
        } else {
            for owner in report.owners {
                println!(
                    "  Owned by: {} '{}' (root page {})",
                    owner.kind, owner.name, owner.root
                );
            }
        }
        println!();
    }
    Ok(0)
}

// ---------------------------------------------------------------------------
// dump-row
// ---------------------------------------------------------------------------

fn cmd_dump_row(args: &[String]) -> Result<u8> {
    let (db, table, rowid) = match args {
        [_, db, table, rowid] => {
            let rowid: i64 = rowid
                .parse()
                .map_err(|_| SleuthError::internal(format!("invalid rowid: {rowid}")))?;
            (PathBuf::from(db), table.clone(), rowid)
        }
        _ => {
            return Err(SleuthError::internal(format!(
                "dump-row needs DATABASE TABLE ROWID\n{USAGE}"
            )));
        }
    };

    let mut pager = Pager::open(db)?;
    let roots = read_schema_roots(&mut pager)?;
    let root = roots
        .iter()
        .find(|r| r.name == table)
        .ok_or(SleuthError::TableNotFound { name: table.clone() })?
        .root;

    banner(&pager);
    println!("Table: {table} (root page {root})");
    println!("Target rowid: {rowid}");
    println!();

    let dump = dump_rowid(&mut pager, root, rowid)?;
    println!("Found rowid {} on page {} (cell {}, offset {})", dump.rowid, dump.page, dump.cell_index, dump.cell_offset);
    println!("Payload size: {} bytes", dump.payload_size);
    println!("Local payload: {} bytes", dump.local_size);
    if let Some(head) = dump.overflow_head {
        println!("Overflow chain starts at page: {head}");
        if !dump.payload_complete {
            println!("(overflow chain incomplete; dumping the recovered prefix)");
        }
    }

    println!();
    println!("=== RAW RECORD DATA ===");
    println!("Record size: {} bytes", dump.payload.len());
    println!();
    println!("Hex dump:");
    hex_dump(&dump.payload);
    println!();

    match (&dump.record, &dump.record_error) {
        (Some(record), _) => {
            println!("Record header size: {} bytes", record.header_size);
            print!("Record header (hex): ");
            for b in dump.payload.iter().take(record.header_size) {
                print!("{b:02x} ");
            }
            println!();
            println!();
            println!("Column serial types:");
            for (i, &st) in record.serial_types.iter().enumerate() {
                println!("  Column {i}: serial type {st} ({})", describe_serial_type(st));
            }
            println!();
            println!("Column data:");
            for (i, value) in record.values.iter().enumerate() {
                println!("  Column {i}: {}", render_value(value));
            }
            if !record.complete {
                println!(
                    "  ... data area truncated after column {}",
                    record.values.len().saturating_sub(1)
                );
            }
        }
        (None, Some(err)) => println!("Record is corrupt: {err}"),
        (None, None) => {}
    }

    Ok(0)
}

fn hex_dump(bytes: &[u8]) {
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 && i % 16 == 0 {
            println!();
        }
        print!("{b:02x} ");
    }
    println!();
}

/// Render one column value; oversize TEXT and BLOB are truncated with the
/// full length noted.
fn render_value(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Null => "NULL".to_owned(),
        ColumnValue::Integer(i) => i.to_string(),
        ColumnValue::Float(f) => f.to_string(),
        ColumnValue::Text(s) => {
            if s.chars().count() > 200 {
                let prefix: String = s.chars().take(200).collect();
                format!("{prefix:?}... (truncated, total {} bytes)", s.len())
            } else {
                format!("{s:?}")
            }
        }
        ColumnValue::Blob(b) => {
            let shown = b.len().min(32);
            let mut out = format!("BLOB({} bytes): ", b.len());
            for byte in &b[..shown] {
                out.push_str(&format!("{byte:02x} "));
            }
            if b.len() > 32 {
                out.push_str("...");
            }
            out
        }
    }
}

// ---------------------------------------------------------------------------
// table-walk
// ---------------------------------------------------------------------------

fn cmd_table_walk(args: &[String], json: bool) -> Result<u8> {
    let (db, table) = match args {
        [_, db, table, ..] if !table.starts_with("--") => (PathBuf::from(db), table.clone()),
        _ => {
            return Err(SleuthError::internal(format!(
                "table-walk needs DATABASE TABLE\n{USAGE}"
            )));
        }
    };

    let mut pager = Pager::open(db)?;
    let roots = read_schema_roots(&mut pager)?;
    let root = roots
        .iter()
        .find(|r| r.name == table)
        .ok_or(SleuthError::TableNotFound { name: table.clone() })?
        .root;

    let report = scan_table(&mut pager, root)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report).expect("report serializes"));
        return Ok(0);
    }

    banner(&pager);
    println!("Table: {table} (root page {root})");
    println!();
    println!("=== SUMMARY ===");
    println!("Pages scanned: {}", report.pages_scanned);
    println!("  Interior pages: {}", report.interior_pages);
    println!("  Leaf pages: {}", report.leaf_pages);
    println!("Cells scanned: {}", report.cells_scanned);
    println!("Corrupt cells: {}", report.corrupt_cells);
    println!("Cells with overflow: {}", report.overflow_cells);
    if let (Some(min), Some(max)) = (report.min_rowid(), report.max_rowid()) {
        println!("Rowid range: {min} .. {max}");
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_prints_usage() {
        let code = run(&["no-such-command".to_owned()]).unwrap();
        assert_eq!(code, 2);
    }

    #[test]
    fn value_rendering_truncates_oversize() {
        let long = "a".repeat(500);
        let rendered = render_value(&ColumnValue::Text(long));
        assert!(rendered.contains("truncated, total 500 bytes"));

        let blob = ColumnValue::Blob(vec![0xAB; 100]);
        let rendered = render_value(&blob);
        assert!(rendered.starts_with("BLOB(100 bytes)"));
        assert!(rendered.ends_with("..."));
    }
}
