//! B-tree page headers, cell shapes, and the local/overflow payload split.
//!
//! Page layout:
//!
//! ```text
//! ┌──────────────────────────┐
//! │ Page header (8 or 12 B)  │  (12 for interior, 8 for leaf)
//! ├──────────────────────────┤
//! │ Cell pointer array       │  (2 bytes per cell)
//! ├──────────────────────────┤
//! │ Unallocated space        │
//! ├──────────────────────────┤
//! │ Cell content area        │  (grows downward from the end of the page)
//! ├──────────────────────────┤
//! │ Reserved region          │
//! └──────────────────────────┘
//! ```
//!
//! On page 1 the whole layout is shifted 100 bytes down by the database
//! file header.

use pagesleuth_error::{Result, SleuthError};
use pagesleuth_types::encoding::{read_u16_be, read_u32_be};
use pagesleuth_types::serial_type::read_varint;

/// Payload sizes beyond this are treated as misread varints. SQLite caps
/// blobs near 2 GiB; anything above 1 GiB in a damaged file is noise.
pub const MAX_PLAUSIBLE_PAYLOAD: u64 = 1 << 30;

/// Size of the database file header occupying the start of page 1.
pub const PAGE1_HEADER_OFFSET: usize = 100;

/// The four b-tree page types, identified by the flag byte at offset 0 of
/// the page header. Any other flag byte means the page is not a b-tree
/// page at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(u8)]
pub enum BtreeType {
    /// Interior index page (0x02).
    InteriorIndex = 0x02,
    /// Interior table page (0x05).
    InteriorTable = 0x05,
    /// Leaf index page (0x0A).
    LeafIndex = 0x0A,
    /// Leaf table page (0x0D).
    LeafTable = 0x0D,
}

impl BtreeType {
    /// Parse a page type from the flag byte.
    pub const fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0x02 => Some(Self::InteriorIndex),
            0x05 => Some(Self::InteriorTable),
            0x0A => Some(Self::LeafIndex),
            0x0D => Some(Self::LeafTable),
            _ => None,
        }
    }

    /// Whether this is an interior (non-leaf) page.
    #[must_use]
    pub const fn is_interior(self) -> bool {
        matches!(self, Self::InteriorIndex | Self::InteriorTable)
    }

    /// Whether this is a leaf page.
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        !self.is_interior()
    }

    /// Whether this is a table (rowid-keyed) page.
    #[must_use]
    pub const fn is_table(self) -> bool {
        matches!(self, Self::InteriorTable | Self::LeafTable)
    }

    /// Whether this is an index (payload-keyed) page.
    #[must_use]
    pub const fn is_index(self) -> bool {
        !self.is_table()
    }

    /// Size of the page header for this type: 12 for interior (the extra
    /// 4 bytes are the rightmost-child pointer), 8 for leaf.
    #[must_use]
    pub const fn header_size(self) -> usize {
        if self.is_interior() { 12 } else { 8 }
    }
}

/// Returns the b-tree header offset for a page: 100 on page 1, 0 elsewhere.
#[must_use]
pub const fn header_offset_for_page(pgno: u32) -> usize {
    if pgno == 1 { PAGE1_HEADER_OFFSET } else { 0 }
}

/// Parsed b-tree page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Page type.
    pub btree_type: BtreeType,
    /// Byte offset of the first freeblock (0 = none).
    pub first_freeblock: u16,
    /// Number of cells on the page, as declared.
    pub cell_count: u16,
    /// Start of the cell content area; a raw 0 decodes to 65536.
    pub cell_content_start: u32,
    /// Fragmented free bytes within the content area.
    pub fragmented_free_bytes: u8,
    /// Rightmost child page number for interior pages.
    pub right_child: Option<u32>,
}

impl PageHeader {
    /// Parse a b-tree page header at `header_offset` within `page`.
    ///
    /// `header_offset` is 0 except on page 1, where the database file
    /// header pushes it to 100.
    pub fn parse(page: &[u8], header_offset: usize) -> Result<Self> {
        let remaining = page.len().saturating_sub(header_offset);
        if remaining < 8 {
            return Err(SleuthError::corrupt(format!(
                "page too small for b-tree header: {remaining} bytes at offset {header_offset}"
            )));
        }

        let h = &page[header_offset..];
        let btree_type = BtreeType::from_flag(h[0]).ok_or_else(|| {
            SleuthError::corrupt(format!("invalid b-tree page type flag: {:#04x}", h[0]))
        })?;

        let first_freeblock = read_u16_be(&h[1..]).expect("fixed field");
        let cell_count = read_u16_be(&h[3..]).expect("fixed field");
        let raw_content_start = read_u16_be(&h[5..]).expect("fixed field");
        let cell_content_start = if raw_content_start == 0 {
            65_536
        } else {
            u32::from(raw_content_start)
        };
        let fragmented_free_bytes = h[7];

        let right_child = if btree_type.is_interior() {
            if remaining < 12 {
                return Err(SleuthError::corrupt(
                    "page too small for interior b-tree header",
                ));
            }
            Some(read_u32_be(&h[8..]).expect("fixed field"))
        } else {
            None
        };

        Ok(Self {
            btree_type,
            first_freeblock,
            cell_count,
            cell_content_start,
            fragmented_free_bytes,
            right_child,
        })
    }

    /// Read the 2-byte cell pointer at index `i`, if it lies on the page.
    #[must_use]
    pub fn cell_pointer(&self, page: &[u8], header_offset: usize, i: usize) -> Option<u16> {
        let off = header_offset + self.btree_type.header_size() + i * 2;
        read_u16_be(page.get(off..)?)
    }
}

// ---------------------------------------------------------------------------
// Local payload calculation
// ---------------------------------------------------------------------------

/// Maximum payload stored locally on a page of the given type.
///
/// Table leaves use `U - 35`; index cells (leaf and interior) use
/// `(U - 12) * 64 / 255 - 23`. The two formulas are deliberately kept
/// distinct; conflating them mis-detects overflow on index pages.
#[must_use]
pub const fn max_local_payload(usable_size: u32, btree_type: BtreeType) -> u32 {
    if btree_type.is_table() {
        usable_size - 35
    } else {
        (usable_size - 12) * 64 / 255 - 23
    }
}

/// Minimum local payload once a cell spills to overflow:
/// `(U - 12) * 32 / 255 - 23`, identical for every page type.
#[must_use]
pub const fn min_local_payload(usable_size: u32) -> u32 {
    (usable_size - 12) * 32 / 255 - 23
}

/// The number of payload bytes stored locally for a cell.
///
/// If the whole payload fits (`payload <= max_local`) it is all local.
/// Otherwise `local = min_local + (payload - min_local) % (U - 4)`, falling
/// back to `min_local` when that lands past `max_local`.
#[must_use]
pub const fn local_payload_size(payload_size: u32, usable_size: u32, btree_type: BtreeType) -> u32 {
    let max_local = max_local_payload(usable_size, btree_type);
    if payload_size <= max_local {
        return payload_size;
    }
    let min_local = min_local_payload(usable_size);
    let local = min_local + (payload_size - min_local) % (usable_size - 4);
    if local > max_local { min_local } else { local }
}

// ---------------------------------------------------------------------------
// Parsed cells
// ---------------------------------------------------------------------------

/// One parsed cell: the pointers and sizes a walker needs, referencing the
/// payload in place rather than copying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedCell {
    /// Left child page number (interior cells only). Raw and unvalidated:
    /// the walker range-checks before following.
    pub left_child: Option<u32>,
    /// Rowid key (table cells only).
    pub rowid: Option<i64>,
    /// Total payload size, local + overflow. 0 for table-interior cells.
    pub payload_size: u32,
    /// Bytes of payload stored on this page.
    pub local_size: u32,
    /// Offset within the page where the local payload starts.
    pub payload_offset: usize,
    /// First overflow page number when the payload spills. Raw and
    /// unvalidated, same as `left_child`.
    pub overflow_head: Option<u32>,
}

impl ParsedCell {
    /// Parse the cell starting at `cell_offset` on a page of type
    /// `btree_type`, applying the table or index local/overflow split as
    /// appropriate. Every derived offset is checked against the page
    /// boundary before it is used.
    pub fn parse(
        page: &[u8],
        cell_offset: usize,
        btree_type: BtreeType,
        usable_size: u32,
    ) -> Result<Self> {
        let mut pos = cell_offset;

        let left_child = if btree_type.is_interior() {
            let child = read_u32_be(page.get(pos..).unwrap_or_default())
                .ok_or_else(|| SleuthError::corrupt("cell extends past page (left child)"))?;
            pos += 4;
            Some(child)
        } else {
            None
        };

        // Table-interior cells carry only the child pointer and a rowid.
        if btree_type == BtreeType::InteriorTable {
            let (rowid_raw, rowid_len) = read_varint(&page[pos.min(page.len())..])
                .ok_or_else(|| SleuthError::corrupt("truncated rowid varint in interior cell"))?;
            #[allow(clippy::cast_possible_wrap)]
            let rowid = rowid_raw as i64;
            return Ok(Self {
                left_child,
                rowid: Some(rowid),
                payload_size: 0,
                local_size: 0,
                payload_offset: pos + rowid_len,
                overflow_head: None,
            });
        }

        // Everything else starts with the payload-size varint.
        let (payload_raw, ps_len) = read_varint(&page[pos.min(page.len())..])
            .ok_or_else(|| SleuthError::corrupt("truncated payload-size varint in cell"))?;
        if payload_raw > MAX_PLAUSIBLE_PAYLOAD {
            return Err(SleuthError::corrupt(format!(
                "implausible cell payload size {payload_raw}"
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        let payload_size = payload_raw as u32;
        pos += ps_len;

        // Table leaves add the rowid varint between size and payload.
        let rowid = if btree_type == BtreeType::LeafTable {
            let (rowid_raw, rowid_len) = read_varint(&page[pos.min(page.len())..])
                .ok_or_else(|| SleuthError::corrupt("truncated rowid varint in table leaf cell"))?;
            pos += rowid_len;
            #[allow(clippy::cast_possible_wrap)]
            Some(rowid_raw as i64)
        } else {
            None
        };

        let payload_offset = pos;
        let local_size = local_payload_size(payload_size, usable_size, btree_type);
        let local_end = payload_offset
            .checked_add(local_size as usize)
            .ok_or_else(|| SleuthError::corrupt("cell payload offset overflow"))?;
        if local_end > page.len() {
            return Err(SleuthError::corrupt(format!(
                "cell local payload runs past page end ({local_end} > {})",
                page.len()
            )));
        }

        let overflow_head = if local_size < payload_size {
            let head = read_u32_be(page.get(local_end..).unwrap_or_default())
                .ok_or_else(|| SleuthError::corrupt("cell extends past page (overflow pointer)"))?;
            Some(head)
        } else {
            None
        };

        Ok(Self {
            left_child,
            rowid,
            payload_size,
            local_size,
            payload_offset,
            overflow_head,
        })
    }

    /// The local payload bytes in place.
    #[must_use]
    pub fn local_payload<'a>(&self, page: &'a [u8]) -> &'a [u8] {
        &page[self.payload_offset..self.payload_offset + self.local_size as usize]
    }
}

#[cfg(test)]
#[allow(clippy::cast_possible_truncation)]
mod tests {
    use super::*;
    use pagesleuth_types::serial_type::write_varint;
    use proptest::prelude::*;

    #[test]
    fn type_flags() {
        assert_eq!(BtreeType::from_flag(0x02), Some(BtreeType::InteriorIndex));
        assert_eq!(BtreeType::from_flag(0x05), Some(BtreeType::InteriorTable));
        assert_eq!(BtreeType::from_flag(0x0A), Some(BtreeType::LeafIndex));
        assert_eq!(BtreeType::from_flag(0x0D), Some(BtreeType::LeafTable));
        assert_eq!(BtreeType::from_flag(0x00), None);
        assert_eq!(BtreeType::from_flag(0x0C), None);
        assert_eq!(BtreeType::from_flag(0xFF), None);
    }

    #[test]
    fn header_sizes() {
        assert_eq!(BtreeType::LeafTable.header_size(), 8);
        assert_eq!(BtreeType::LeafIndex.header_size(), 8);
        assert_eq!(BtreeType::InteriorTable.header_size(), 12);
        assert_eq!(BtreeType::InteriorIndex.header_size(), 12);
    }

    #[test]
    fn header_offset_only_on_page_one() {
        assert_eq!(header_offset_for_page(1), 100);
        assert_eq!(header_offset_for_page(2), 0);
        assert_eq!(header_offset_for_page(4096), 0);
    }

    fn leaf_page(cell_count: u16, content_start: u16) -> Vec<u8> {
        let mut page = vec![0u8; 512];
        page[0] = 0x0D;
        page[3..5].copy_from_slice(&cell_count.to_be_bytes());
        page[5..7].copy_from_slice(&content_start.to_be_bytes());
        page
    }

    #[test]
    fn parses_leaf_header() {
        let page = leaf_page(3, 400);
        let hdr = PageHeader::parse(&page, 0).unwrap();
        assert_eq!(hdr.btree_type, BtreeType::LeafTable);
        assert_eq!(hdr.cell_count, 3);
        assert_eq!(hdr.cell_content_start, 400);
        assert_eq!(hdr.right_child, None);
    }

    #[test]
    fn parses_interior_header_with_right_child() {
        let mut page = vec![0u8; 512];
        page[0] = 0x05;
        page[3..5].copy_from_slice(&1u16.to_be_bytes());
        page[8..12].copy_from_slice(&77u32.to_be_bytes());
        let hdr = PageHeader::parse(&page, 0).unwrap();
        assert_eq!(hdr.btree_type, BtreeType::InteriorTable);
        assert_eq!(hdr.right_child, Some(77));
    }

    #[test]
    fn content_start_zero_decodes_to_65536() {
        let page = leaf_page(0, 0);
        let hdr = PageHeader::parse(&page, 0).unwrap();
        assert_eq!(hdr.cell_content_start, 65_536);
    }

    #[test]
    fn rejects_non_btree_flag() {
        let mut page = leaf_page(0, 400);
        page[0] = 0x07;
        assert!(PageHeader::parse(&page, 0).is_err());
    }

    #[test]
    fn split_formulas_for_4096_page() {
        // U = 4096: maxLocalTable = 4061, maxLocalIndex = 1002, minLocal = 489.
        assert_eq!(max_local_payload(4096, BtreeType::LeafTable), 4061);
        assert_eq!(max_local_payload(4096, BtreeType::LeafIndex), 1002);
        assert_eq!(max_local_payload(4096, BtreeType::InteriorIndex), 1002);
        assert_eq!(min_local_payload(4096), 489);
    }

    #[test]
    fn small_payload_is_entirely_local() {
        assert_eq!(local_payload_size(100, 4096, BtreeType::LeafTable), 100);
        assert_eq!(local_payload_size(4061, 4096, BtreeType::LeafTable), 4061);
    }

    #[test]
    fn spilled_payload_uses_modular_split() {
        // payload 5000 on U=4096 table leaf: local = 489 + (5000-489) % 4092 = 908.
        assert_eq!(local_payload_size(5000, 4096, BtreeType::LeafTable), 908);
        // When the modular result exceeds max_local the split falls back to
        // min_local: payload = 489 + 4092 + 4000 = 8581 gives 4489 > 4061.
        assert_eq!(local_payload_size(8581, 4096, BtreeType::LeafTable), 489);
    }

    #[test]
    fn parses_table_leaf_cell_without_overflow() {
        let mut page = leaf_page(1, 200);
        let mut off = 200;
        off += write_varint(&mut page[off..], 5); // payload size
        off += write_varint(&mut page[off..], 12345); // rowid
        page[off..off + 5].copy_from_slice(b"stuff");

        let cell = ParsedCell::parse(&page, 200, BtreeType::LeafTable, 512).unwrap();
        assert_eq!(cell.rowid, Some(12345));
        assert_eq!(cell.payload_size, 5);
        assert_eq!(cell.local_size, 5);
        assert_eq!(cell.overflow_head, None);
        assert_eq!(cell.local_payload(&page), b"stuff");
    }

    #[test]
    fn parses_table_interior_cell() {
        let mut page = vec![0u8; 512];
        page[0] = 0x05;
        let mut off = 100;
        page[off..off + 4].copy_from_slice(&9u32.to_be_bytes());
        off += 4;
        write_varint(&mut page[off..], 555);

        let cell = ParsedCell::parse(&page, 100, BtreeType::InteriorTable, 512).unwrap();
        assert_eq!(cell.left_child, Some(9));
        assert_eq!(cell.rowid, Some(555));
        assert_eq!(cell.payload_size, 0);
        assert_eq!(cell.overflow_head, None);
    }

    #[test]
    fn parses_index_interior_cell_with_overflow() {
        let usable = 512u32;
        let max_local = max_local_payload(usable, BtreeType::InteriorIndex);
        let payload = max_local + 100;
        let local = local_payload_size(payload, usable, BtreeType::InteriorIndex);

        let mut page = vec![0u8; 512];
        page[0] = 0x02;
        let cell_off = 80;
        let mut off = cell_off;
        page[off..off + 4].copy_from_slice(&3u32.to_be_bytes());
        off += 4;
        off += write_varint(&mut page[off..], u64::from(payload));
        let overflow_ptr_at = off + local as usize;
        page[overflow_ptr_at..overflow_ptr_at + 4].copy_from_slice(&44u32.to_be_bytes());

        let cell = ParsedCell::parse(&page, cell_off, BtreeType::InteriorIndex, usable).unwrap();
        assert_eq!(cell.left_child, Some(3));
        assert_eq!(cell.rowid, None);
        assert_eq!(cell.payload_size, payload);
        assert_eq!(cell.local_size, local);
        assert_eq!(cell.overflow_head, Some(44));
    }

    #[test]
    fn rejects_cell_running_past_page() {
        let mut page = leaf_page(1, 500);
        let mut off = 500;
        off += write_varint(&mut page[off..], 300); // payload claims 300 bytes
        write_varint(&mut page[off..], 1);
        assert!(ParsedCell::parse(&page, 500, BtreeType::LeafTable, 512).is_err());
    }

    #[test]
    fn rejects_truncated_varint_at_page_end() {
        let mut page = leaf_page(1, 511);
        page[511] = 0x80; // continuation bit with nothing after it
        assert!(ParsedCell::parse(&page, 511, BtreeType::LeafTable, 512).is_err());
    }

    #[test]
    fn rejects_implausible_payload_size() {
        let mut page = leaf_page(1, 100);
        // 5-byte varint encoding 2^31 (> 1 GiB cap)
        write_varint(&mut page[100..], 1 << 31);
        assert!(ParsedCell::parse(&page, 100, BtreeType::LeafIndex, 512).is_err());
    }

    proptest! {
        #[test]
        fn local_size_never_exceeds_max_local(
            payload in 0u32..100_000_000,
            usable in prop::sample::select(vec![480u32, 512, 1024, 4096, 65_536]),
        ) {
            for bt in [BtreeType::LeafTable, BtreeType::LeafIndex, BtreeType::InteriorIndex] {
                let max_local = max_local_payload(usable, bt);
                let local = local_payload_size(payload, usable, bt);
                if payload <= max_local {
                    prop_assert_eq!(local, payload);
                } else {
                    prop_assert!(local <= max_local);
                    prop_assert!(local >= min_local_payload(usable));
                }
            }
        }
    }
}
