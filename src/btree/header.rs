//! header reads and writes the header of a btree page.
//!
//! A btree page is divided into regions in the following order:
//! 1. The 100-byte database file header (found on page 1 only)
//! 2. The 8 or 12 byte btree page header
//! 3. The cell pointer array
//! 4. Unallocated space
//! 5. The cell content area
//! 6. The reserved region.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::{page_header_offset, Error, PageType};
use crate::pager::PageNum;

#[derive(Debug, Clone)]
pub struct PageHeader {
    pub page_type: PageType,
    pub freeblock_start: u16,
    pub num_cells: u16,
    /// Page-relative offset of the first cell body. The on-disk value 0 is
    /// decoded as the usable page size (an empty 65536-byte page).
    pub cell_content_start: u32,
    pub fragmented_bytes: u8,
    pub rightmost_pointer: Option<u32>,
}

impl PageHeader {
    /// First byte past the cell pointer array.
    pub fn pointer_array_end(&self, pgnum: PageNum) -> usize {
        page_header_offset(pgnum) + self.page_type.header_len() + 2 * self.num_cells as usize
    }
}

/// Parses and validates the btree header of `page`, honoring the file-header
/// offset on page 1.
pub fn parse(page: &[u8], pgnum: PageNum, usable_size: u32) -> Result<PageHeader, Error> {
    let offset = page_header_offset(pgnum);
    let corrupt = |reason| Error::CorruptHeader { pgnum, reason };
    if page.len() < offset + 8 {
        return Err(corrupt("page too small for a btree header"));
    }
    let mut c = Cursor::new(&page[offset..]);

    // Offset	Size	Description
    // 0	1	The one-byte flag at offset 0 indicating the btree page type.
    let type_byte = c.read_u8().map_err(|_| corrupt("short read"))?;
    let page_type =
        PageType::from_byte(type_byte).ok_or(corrupt("invalid btree page type byte"))?;
    // 1	2	Start of the first freeblock on the page, or zero if none.
    let freeblock_start = c.read_u16::<BigEndian>().map_err(|_| corrupt("short read"))?;
    // 3	2	The number of cells on the page.
    let num_cells = c.read_u16::<BigEndian>().map_err(|_| corrupt("short read"))?;
    // 5	2	Start of the cell content area. Zero is interpreted as 65536.
    let cell_content_start = match c.read_u16::<BigEndian>().map_err(|_| corrupt("short read"))? {
        0 => usable_size,
        x => x as u32,
    };
    // 7	1	The number of fragmented free bytes within the cell content area.
    let fragmented_bytes = c.read_u8().map_err(|_| corrupt("short read"))?;
    // 8	4	The right-most pointer. Interior pages only.
    let rightmost_pointer = if page_type.is_leaf() {
        None
    } else {
        Some(
            c.read_u32::<BigEndian>()
                .map_err(|_| corrupt("interior header too small for rightmost pointer"))?,
        )
    };

    let hdr = PageHeader {
        page_type,
        freeblock_start,
        num_cells,
        cell_content_start,
        fragmented_bytes,
        rightmost_pointer,
    };
    if cell_content_start > usable_size {
        return Err(corrupt("cell content start beyond usable page size"));
    }
    if hdr.pointer_array_end(pgnum) > cell_content_start as usize {
        return Err(corrupt("cell pointer array overlaps cell content"));
    }
    if freeblock_start != 0 && freeblock_start as u32 >= usable_size {
        return Err(corrupt("freeblock chain starts outside the page"));
    }
    Ok(hdr)
}

/// Writes `hdr` back over the btree header region of `page`.
pub fn write(page: &mut [u8], pgnum: PageNum, hdr: &PageHeader) {
    let offset = page_header_offset(pgnum);
    let mut c = Cursor::new(&mut page[offset..]);
    c.write_u8(hdr.page_type.to_byte()).expect("header fits");
    c.write_u16::<BigEndian>(hdr.freeblock_start).expect("header fits");
    c.write_u16::<BigEndian>(hdr.num_cells).expect("header fits");
    // 65536 does not fit in the two-byte field and is stored as 0.
    let stored_start: u16 = if hdr.cell_content_start >= 65536 {
        0
    } else {
        hdr.cell_content_start as u16
    };
    c.write_u16::<BigEndian>(stored_start).expect("header fits");
    c.write_u8(hdr.fragmented_bytes).expect("header fits");
    if let Some(rmp) = hdr.rightmost_pointer {
        c.write_u32::<BigEndian>(rmp).expect("header fits");
    }
}

/// Initializes `page` as an empty btree page of the given type.
pub fn init_page(page: &mut [u8], pgnum: PageNum, page_type: PageType, usable_size: u32) {
    let offset = page_header_offset(pgnum);
    for b in page[offset..].iter_mut() {
        *b = 0;
    }
    write(
        page,
        pgnum,
        &PageHeader {
            page_type,
            freeblock_start: 0,
            num_cells: 0,
            cell_content_start: usable_size,
            fragmented_bytes: 0,
            rightmost_pointer: if page_type.is_leaf() { None } else { Some(0) },
        },
    );
}

#[test]
fn test_init_parse_round_trip() {
    let mut page = vec![0u8; 512];
    init_page(&mut page, 2, PageType::TableLeaf, 512);
    let hdr = parse(&page, 2, 512).unwrap();
    assert_eq!(hdr.page_type, PageType::TableLeaf);
    assert_eq!(hdr.num_cells, 0);
    assert_eq!(hdr.cell_content_start, 512);
    assert_eq!(hdr.fragmented_bytes, 0);
    assert_eq!(hdr.rightmost_pointer, None);

    init_page(&mut page, 2, PageType::TableInterior, 512);
    let hdr = parse(&page, 2, 512).unwrap();
    assert_eq!(hdr.page_type, PageType::TableInterior);
    assert_eq!(hdr.rightmost_pointer, Some(0));
}

#[test]
fn test_parse_validates() {
    let mut page = vec![0u8; 512];
    init_page(&mut page, 2, PageType::TableLeaf, 512);

    // Bad type byte.
    let mut bad = page.clone();
    bad[0] = 0x07;
    assert!(matches!(
        parse(&bad, 2, 512),
        Err(Error::CorruptHeader { .. })
    ));

    // Content start beyond the usable size.
    let mut bad = page.clone();
    bad[5] = 0x03;
    bad[6] = 0x00; // content start 768 > 512
    assert!(matches!(
        parse(&bad, 2, 512),
        Err(Error::CorruptHeader { .. })
    ));

    // Enough cells that the pointer array would overlap the content area.
    let mut bad = page.clone();
    bad[3] = 0x40;
    bad[4] = 0x00; // 16384 cells
    assert!(matches!(
        parse(&bad, 2, 512),
        Err(Error::CorruptHeader { .. })
    ));
}

#[test]
fn test_page1_offset() {
    let mut page = vec![0u8; 512];
    init_page(&mut page, 1, PageType::TableLeaf, 512);
    // The btree header starts after the 100-byte file header.
    assert_eq!(page[100], 0x0d);
    let hdr = parse(&page, 1, 512).unwrap();
    assert_eq!(hdr.page_type, PageType::TableLeaf);
    assert_eq!(hdr.pointer_array_end(1), 108);
}
