//! cell parses and serializes the cells of btree pages.
//!
//! Cell formats, from the file format docs:
//!
//! Table B-Tree Leaf Cell (header 0x0d):
//! A varint which is the total number of bytes of payload, including any overflow
//! A varint which is the integer key, a.k.a. "rowid"
//! The initial portion of the payload that does not spill to overflow pages.
//! A 4-byte big-endian integer page number for the first page of the overflow
//! page list - omitted if all payload fits on the b-tree page.
//!
//! Table B-Tree Interior Cell (header 0x05):
//! A 4-byte big-endian page number which is the left child pointer.
//! A varint which is the integer key
//!
//! Index B-Tree Leaf Cell (header 0x0a):
//! A varint which is the total number of bytes of key payload, including any overflow
//! The initial portion of the payload that does not spill to overflow pages.
//! A 4-byte big-endian integer page number for the first page of the overflow
//! page list - omitted if all payload fits on the b-tree page.
//!
//! Index B-Tree Interior Cell (header 0x02):
//! A 4-byte big-endian page number which is the left child pointer.
//! A varint which is the total number of bytes of key payload, including any overflow
//! The initial portion of the payload that does not spill to overflow pages.
//! A 4-byte big-endian integer page number for the first page of the overflow
//! page list - omitted if all payload fits on the b-tree page.

use std::ops::Range;

use super::{Error, PageType, RowId};
use crate::pager::PageStore;
use crate::varint;

/// Payloads shorter than min-local always stay on the page; the split
/// formulas keep overflow chains from starting with a nearly-empty page.
pub fn min_local(usable_size: u32) -> usize {
    (((usable_size as usize - 12) * 32) / 255) - 23
}

/// The largest payload stored entirely on the page. Table leaves use the
/// generous `U - 35`; index payloads cap lower so several keys fit per page.
pub fn max_local(usable_size: u32, page_type: PageType) -> usize {
    match page_type {
        PageType::TableLeaf => usable_size as usize - 35,
        PageType::IndexLeaf | PageType::IndexInterior => {
            (((usable_size as usize - 12) * 64) / 255) - 23
        }
        // Table interior cells carry no payload.
        PageType::TableInterior => 0,
    }
}

/// How many payload bytes stay on the page for a payload of `payload_len`
/// total bytes. Equal to `payload_len` when nothing spills.
pub fn local_payload_len(payload_len: usize, usable_size: u32, page_type: PageType) -> usize {
    let x = max_local(usable_size, page_type);
    if payload_len <= x {
        return payload_len;
    }
    let m = min_local(usable_size);
    let surplus = m + (payload_len - m) % (usable_size as usize - 4);
    if surplus <= x {
        surplus
    } else {
        m
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLeafCell {
    pub rowid: RowId,
    /// Total payload bytes, including any overflow.
    pub payload_len: usize,
    /// The on-page portion of the payload, as a range into the cell slice.
    pub local_payload: Range<usize>,
    pub first_overflow_page: Option<u32>,
    /// Bytes the whole cell occupies on the page.
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInteriorCell {
    pub left_child: u32,
    pub rowid: RowId,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCell {
    /// Interior index cells carry a left child pointer; leaf cells do not.
    pub left_child: Option<u32>,
    pub payload_len: usize,
    pub local_payload: Range<usize>,
    pub first_overflow_page: Option<u32>,
    pub size: usize,
}

/// Parses a table leaf cell from a slice starting at the cell's first byte.
/// Returns None if the cell runs off the end of the slice.
pub fn parse_table_leaf(cell: &[u8], usable_size: u32) -> Option<TableLeafCell> {
    let (payload_len, n1) = varint::get(cell);
    if n1 == 0 {
        return None;
    }
    let (rowid, n2) = varint::get(&cell[n1..]);
    if n2 == 0 {
        return None;
    }
    let payload_len = payload_len as usize;
    let hdr = n1 + n2;
    let local = local_payload_len(payload_len, usable_size, PageType::TableLeaf);
    let spilled = local < payload_len;
    let size = hdr + local + if spilled { 4 } else { 0 };
    if cell.len() < size {
        return None;
    }
    let first_overflow_page = if spilled {
        Some(u32::from_be_bytes(
            cell[hdr + local..hdr + local + 4].try_into().ok()?,
        ))
    } else {
        None
    };
    Some(TableLeafCell {
        rowid: rowid as i64,
        payload_len,
        local_payload: hdr..hdr + local,
        first_overflow_page,
        size,
    })
}

pub fn parse_table_interior(cell: &[u8]) -> Option<TableInteriorCell> {
    if cell.len() < 5 {
        return None;
    }
    let left_child = u32::from_be_bytes(cell[..4].try_into().ok()?);
    let (rowid, n) = varint::get(&cell[4..]);
    if n == 0 {
        return None;
    }
    Some(TableInteriorCell {
        left_child,
        rowid: rowid as i64,
        size: 4 + n,
    })
}

/// Parses an index cell of either kind; interior cells lead with the left
/// child pointer.
pub fn parse_index(cell: &[u8], usable_size: u32, page_type: PageType) -> Option<IndexCell> {
    let (left_child, mut offset) = match page_type {
        PageType::IndexInterior => {
            if cell.len() < 4 {
                return None;
            }
            (Some(u32::from_be_bytes(cell[..4].try_into().ok()?)), 4)
        }
        PageType::IndexLeaf => (None, 0),
        _ => return None,
    };
    let (payload_len, n) = varint::get(&cell[offset..]);
    if n == 0 {
        return None;
    }
    offset += n;
    let payload_len = payload_len as usize;
    let local = local_payload_len(payload_len, usable_size, page_type);
    let spilled = local < payload_len;
    let size = offset + local + if spilled { 4 } else { 0 };
    if cell.len() < size {
        return None;
    }
    let first_overflow_page = if spilled {
        Some(u32::from_be_bytes(
            cell[offset + local..offset + local + 4].try_into().ok()?,
        ))
    } else {
        None
    };
    Some(IndexCell {
        left_child,
        payload_len,
        local_payload: offset..offset + local,
        first_overflow_page,
        size,
    })
}

/// The number of bytes the cell starting at `cell` occupies, for any page
/// type. Used when shuffling whole cells around (delete, defragment, split).
pub fn cell_size(page_type: PageType, cell: &[u8], usable_size: u32) -> Option<usize> {
    match page_type {
        PageType::TableLeaf => parse_table_leaf(cell, usable_size).map(|c| c.size),
        PageType::TableInterior => parse_table_interior(cell).map(|c| c.size),
        PageType::IndexLeaf | PageType::IndexInterior => {
            parse_index(cell, usable_size, page_type).map(|c| c.size)
        }
    }
}

/// Reads the rowid key of a table cell (leaf or interior).
pub fn table_cell_rowid(page_type: PageType, cell: &[u8], usable_size: u32) -> Option<RowId> {
    match page_type {
        PageType::TableLeaf => parse_table_leaf(cell, usable_size).map(|c| c.rowid),
        PageType::TableInterior => parse_table_interior(cell).map(|c| c.rowid),
        _ => None,
    }
}

/// Serializes a table leaf cell. `local` is the on-page payload portion and
/// `payload_len` the full length; `first_overflow_page` must be set exactly
/// when they differ.
pub fn make_table_leaf(
    rowid: RowId,
    payload_len: usize,
    local: &[u8],
    first_overflow_page: Option<u32>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(18 + local.len() + 4);
    let mut buf = [0u8; 9];
    let n = varint::put(&mut buf, payload_len as u64);
    out.extend_from_slice(&buf[..n]);
    let n = varint::put(&mut buf, rowid as u64);
    out.extend_from_slice(&buf[..n]);
    out.extend_from_slice(local);
    if let Some(pg) = first_overflow_page {
        out.extend_from_slice(&pg.to_be_bytes());
    }
    out
}

pub fn make_table_interior(left_child: u32, rowid: RowId) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.extend_from_slice(&left_child.to_be_bytes());
    let mut buf = [0u8; 9];
    let n = varint::put(&mut buf, rowid as u64);
    out.extend_from_slice(&buf[..n]);
    out
}

/// Follows an overflow chain, appending payload bytes to `out` until
/// `remaining` bytes have been collected. Each overflow page is a 4-byte
/// next-page pointer followed by data; the last page's pointer is zero.
pub fn read_overflow_chain(
    pager: &mut dyn PageStore,
    first_page: u32,
    mut remaining: usize,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let usable = pager.usable_size() as usize;
    let per_page = usable - 4;
    // A well-formed chain cannot be longer than the payload requires.
    let mut pages_left = remaining / per_page + 2;
    let mut next = first_page;
    while remaining > 0 {
        if next == 0 || pages_left == 0 {
            return Err(Error::CorruptCell {
                pgnum: next as usize,
                index: 0,
            });
        }
        pages_left -= 1;
        let page = pager.get(next as usize)?;
        let take = remaining.min(per_page);
        out.extend_from_slice(&page[4..4 + take]);
        next = u32::from_be_bytes(page[..4].try_into().expect("4-byte slice"));
        remaining -= take;
    }
    Ok(())
}

/// Allocates and links an overflow chain holding `data`, returning the first
/// page number.
pub fn write_overflow_chain(pager: &mut dyn PageStore, data: &[u8]) -> Result<u32, Error> {
    debug_assert!(!data.is_empty());
    let usable = pager.usable_size() as usize;
    let per_page = usable - 4;
    let mut pages = vec![];
    let num_pages = (data.len() + per_page - 1) / per_page;
    for _ in 0..num_pages {
        let (pgnum, _) = pager.allocate()?;
        pages.push(pgnum);
    }
    for (i, chunk) in data.chunks(per_page).enumerate() {
        let next: u32 = if i + 1 < pages.len() {
            pages[i + 1] as u32
        } else {
            0
        };
        let page = pager.get(pages[i])?;
        page[..4].copy_from_slice(&next.to_be_bytes());
        page[4..4 + chunk.len()].copy_from_slice(chunk);
        pager.mark_dirty(pages[i]);
    }
    Ok(pages[0] as u32)
}

#[test]
fn test_parse_table_leaf_from_hex() {
    use hex::FromHex;
    // From a real 512B-page database: payload_len 3, rowid 1, record
    // 02 0f 41 (a one-column text record holding "A").
    let cell = Vec::from_hex("0301020f41").expect("Invalid Hex String");
    let c = parse_table_leaf(&cell, 512).unwrap();
    assert_eq!(c.rowid, 1);
    assert_eq!(c.payload_len, 3);
    assert_eq!(&cell[c.local_payload.clone()], &[0x02, 0x0f, 0x41]);
    assert_eq!(c.first_overflow_page, None);
    assert_eq!(c.size, 5);
}

#[test]
fn test_table_leaf_round_trip() {
    let payload = b"hello world, this is a record";
    let cell = make_table_leaf(7, payload.len(), payload, None);
    let c = parse_table_leaf(&cell, 4096).unwrap();
    assert_eq!(c.rowid, 7);
    assert_eq!(c.payload_len, payload.len());
    assert_eq!(&cell[c.local_payload.clone()], payload);
    assert_eq!(c.size, cell.len());

    // Negative rowids survive the twos-complement varint encoding.
    let cell = make_table_leaf(-3, payload.len(), payload, None);
    assert_eq!(parse_table_leaf(&cell, 4096).unwrap().rowid, -3);
}

#[test]
fn test_table_interior_round_trip() {
    let cell = make_table_interior(9, 1234567);
    let c = parse_table_interior(&cell).unwrap();
    assert_eq!(c.left_child, 9);
    assert_eq!(c.rowid, 1234567);
    assert_eq!(c.size, cell.len());
}

#[test]
fn test_local_payload_split() {
    // 512-byte page: table leaves keep up to 477 bytes local.
    assert_eq!(max_local(512, PageType::TableLeaf), 477);
    assert_eq!(min_local(512), 39);
    assert_eq!(local_payload_len(477, 512, PageType::TableLeaf), 477);
    // One byte past the threshold spills.
    let local = local_payload_len(478, 512, PageType::TableLeaf);
    assert!(local < 478);
    assert!(local >= min_local(512));
    // Index payloads cap much lower.
    assert!(max_local(512, PageType::IndexLeaf) < max_local(512, PageType::TableLeaf));
}

#[test]
fn test_parse_truncated_cell() {
    assert!(parse_table_leaf(&[0x85], 512).is_none());
    assert!(parse_table_interior(&[0x00, 0x00, 0x01]).is_none());
    let cell = make_table_leaf(1, 100, &[0u8; 100], None);
    assert!(parse_table_leaf(&cell[..50], 512).is_none());
}
