//! Overflow chain traversal.
//!
//! An overflow page carries a 4-byte `next` pointer at offset 0 and payload
//! after it. Chains end at `next == 0`; on a damaged file they can also
//! point out of range, revisit a page, or run into a page some other
//! structure owns, and the traversal must stop cleanly in all three cases.

use pagesleuth_error::{Result, SleuthError};
use pagesleuth_pager::Pager;
use pagesleuth_types::encoding::read_u32_be;
use tracing::{debug, warn};

use crate::classify::{PageMap, PageRole};

/// Safety bound on chain length, against pointer loops the visited check
/// cannot see (e.g. a two-page loop through a page owned by another walk).
pub const MAX_OVERFLOW_CHAIN: usize = 1_000_000;

/// Follow an overflow chain from `head`, classifying each page as
/// [`PageRole::Overflow`] with `parent` as the owner.
///
/// Halts without error on a 0 next-pointer, an out-of-range pointer, an
/// already-classified page, or an unreadable page. Returns the number of
/// pages classified.
pub fn classify_chain(pager: &mut Pager, map: &mut PageMap, head: u32, parent: u32) -> u32 {
    let mut pgno = head;
    let mut classified = 0u32;
    let mut hops = 0usize;

    while pgno != 0 {
        hops += 1;
        if hops > MAX_OVERFLOW_CHAIN {
            warn!(parent, "overflow chain exceeds safety bound, stopping");
            break;
        }
        if !pager.in_range(pgno) {
            warn!(page = pgno, parent, "overflow pointer out of range");
            break;
        }
        if map.is_classified(pgno) {
            break;
        }
        map.mark(pgno, PageRole::Overflow, parent);
        classified += 1;

        let Ok(page) = pager.read_raw_page(pgno) else {
            warn!(page = pgno, "overflow page unreadable, chain stops here");
            break;
        };
        pgno = read_u32_be(&page[0..4]).unwrap_or(0);
    }

    if classified > 0 {
        debug!(head, parent, pages = classified, "classified overflow chain");
    }
    classified
}

/// Reassemble a payload of `total_size` bytes from its local prefix plus
/// the overflow chain starting at `head`.
///
/// Returns the payload and whether it is complete. A chain that ends
/// early, loops, or leaves the page range yields the prefix gathered so
/// far with `complete == false`; only a hard read error is returned as
/// such.
pub fn reassemble_payload(
    pager: &mut Pager,
    local: &[u8],
    head: u32,
    total_size: u32,
) -> Result<(Vec<u8>, bool)> {
    let total = total_size as usize;
    let usable = pager.usable_size() as usize;
    if usable <= 4 {
        return Err(SleuthError::corrupt(format!(
            "usable page size {usable} cannot hold an overflow chain"
        )));
    }
    let bytes_per_page = usable - 4;

    let mut payload = Vec::with_capacity(total.min(local.len() + bytes_per_page * 4));
    payload.extend_from_slice(&local[..local.len().min(total)]);

    let mut seen = std::collections::HashSet::new();
    let mut pgno = head;

    while payload.len() < total {
        if pgno == 0 {
            warn!(
                got = payload.len(),
                expected = total,
                "overflow chain ended prematurely"
            );
            return Ok((payload, false));
        }
        if !pager.in_range(pgno) || !seen.insert(pgno) {
            warn!(page = pgno, "overflow chain left the page range or looped");
            return Ok((payload, false));
        }

        let page = pager.read_raw_page(pgno)?;
        pgno = read_u32_be(&page[0..4]).unwrap_or(0);

        let needed = total - payload.len();
        let take = needed.min(bytes_per_page).min(page.len().saturating_sub(4));
        payload.extend_from_slice(&page[4..4 + take]);
    }

    Ok((payload, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use pagesleuth_types::DATABASE_HEADER_MAGIC;

    const PAGE: usize = 512;

    fn image(pages: u32) -> Vec<u8> {
        let mut data = vec![0u8; PAGE * pages as usize];
        data[..16].copy_from_slice(DATABASE_HEADER_MAGIC);
        data[16..18].copy_from_slice(&512u16.to_be_bytes());
        data[21] = 64;
        data[22] = 32;
        data[23] = 32;
        data[28..32].copy_from_slice(&pages.to_be_bytes());
        data
    }

    fn set_overflow(data: &mut [u8], pgno: u32, next: u32, fill: u8) {
        let base = (pgno as usize - 1) * PAGE;
        data[base..base + 4].copy_from_slice(&next.to_be_bytes());
        for b in &mut data[base + 4..base + PAGE] {
            *b = fill;
        }
    }

    fn open(data: &[u8]) -> (tempfile::TempDir, Pager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ov.db");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        drop(f);
        let pager = Pager::open(&path).unwrap();
        (dir, pager)
    }

    #[test]
    fn classifies_simple_chain() {
        let mut data = image(6);
        set_overflow(&mut data, 3, 4, 0xAA);
        set_overflow(&mut data, 4, 0, 0xBB);
        let (_d, mut pager) = open(&data);
        let mut map = PageMap::new(6);

        let n = classify_chain(&mut pager, &mut map, 3, 2);
        assert_eq!(n, 2);
        assert_eq!(map.role(3), PageRole::Overflow);
        assert_eq!(map.role(4), PageRole::Overflow);
        assert_eq!(map.parent(3), 2);
    }

    #[test]
    fn chain_of_length_one_terminates_on_zero_next() {
        let mut data = image(4);
        set_overflow(&mut data, 3, 0, 0xAA);
        let (_d, mut pager) = open(&data);
        let mut map = PageMap::new(4);
        assert_eq!(classify_chain(&mut pager, &mut map, 3, 1), 1);
        assert_eq!(map.role(3), PageRole::Overflow);
    }

    #[test]
    fn chain_halts_on_already_classified_page() {
        let mut data = image(6);
        set_overflow(&mut data, 3, 4, 0);
        set_overflow(&mut data, 4, 3, 0); // loop back
        let (_d, mut pager) = open(&data);
        let mut map = PageMap::new(6);

        let n = classify_chain(&mut pager, &mut map, 3, 1);
        // 3 and 4 classified; the back-edge to 3 stops on is_classified.
        assert_eq!(n, 2);
    }

    #[test]
    fn chain_halts_on_out_of_range_pointer() {
        let mut data = image(4);
        set_overflow(&mut data, 3, 5000, 0);
        let (_d, mut pager) = open(&data);
        let mut map = PageMap::new(4);
        assert_eq!(classify_chain(&mut pager, &mut map, 3, 1), 1);
    }

    #[test]
    fn reassembles_full_payload() {
        let mut data = image(6);
        set_overflow(&mut data, 3, 4, 0xAA);
        set_overflow(&mut data, 4, 0, 0xBB);
        let (_d, mut pager) = open(&data);

        let local = vec![0x11u8; 10];
        let per_page = PAGE - 4;
        let total = u32::try_from(10 + per_page + 20).unwrap();
        let (payload, complete) = reassemble_payload(&mut pager, &local, 3, total).unwrap();
        assert!(complete);
        assert_eq!(payload.len(), total as usize);
        assert!(payload[..10].iter().all(|&b| b == 0x11));
        assert!(payload[10..10 + per_page].iter().all(|&b| b == 0xAA));
        assert!(payload[10 + per_page..].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn premature_chain_end_reports_incomplete() {
        let mut data = image(6);
        set_overflow(&mut data, 3, 0, 0xAA);
        let (_d, mut pager) = open(&data);

        let (payload, complete) =
            reassemble_payload(&mut pager, b"xy", 3, 5000).unwrap();
        assert!(!complete);
        assert_eq!(payload.len(), 2 + (PAGE - 4));
    }

    #[test]
    fn looping_chain_reports_incomplete() {
        let mut data = image(6);
        set_overflow(&mut data, 3, 4, 0xAA);
        set_overflow(&mut data, 4, 3, 0xBB);
        let (_d, mut pager) = open(&data);

        let (_, complete) = reassemble_payload(&mut pager, &[], 3, 1_000_000).unwrap();
        assert!(!complete);
    }
}
