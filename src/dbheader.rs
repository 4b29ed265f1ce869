//! dbheader reads and initializes the 100-byte header at the start of a
//! database file (and of page 1, which contains it).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use crate::btree;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("The magic bytes for this file are wrong.")]
    WrongMagic,
    #[error("The pagesize is not supported by this code, though it may be valid Sqlite format.")]
    UnsupportedPagesize,
    #[error("A field value is not supported by this code, though it may be valid Sqlite format.")]
    Unsupported,
    #[error("Error reading file header.")]
    ReadFailed,
}

/// The fields of the file header this engine consumes. The remaining fields
/// are read past and left alone, except during initialization of a fresh
/// database.
#[derive(Debug, Clone)]
pub struct DbHeader {
    pub page_size: u32,
    pub reserved_bytes: u8,
    pub change_counter: u32,
    pub num_pages: u32,
    pub schema_cookie: u32,
}

pub const DB_HEADER_BYTES: usize = 100;
const MAGIC_STRING: &[u8] = &[
    0x53, 0x51, 0x4c, 0x69, 0x74, 0x65, 0x20, 0x66, 0x6f, 0x72, 0x6d, 0x61, 0x74, 0x20, 0x33, 0x00,
]; // "SQLite format 3\0"

// Byte offsets into the header for the fields this engine rewrites.
const CHANGE_COUNTER_OFFSET: usize = 24;
const NUM_PAGES_OFFSET: usize = 28;
const VERSION_VALID_FOR_OFFSET: usize = 92;

pub fn parse(header: &[u8]) -> Result<DbHeader, Error> {
    if header.len() < DB_HEADER_BYTES {
        return Err(Error::ReadFailed);
    }
    let mut c = Cursor::new(header);
    // Offset	Size	Description
    // 0        16	    The header string: "SQLite format 3\000"
    let mut magic = [0u8; 16];
    c.read_exact(&mut magic).map_err(|_| Error::ReadFailed)?;
    if magic != MAGIC_STRING {
        return Err(Error::WrongMagic);
    }
    // 16	    2	    The database page size in bytes. Must be a power of two
    //                  between 512 and 32768 inclusive, or the value 1
    //                  representing a page size of 65536.
    let page_size: u32 = match c.read_u16::<BigEndian>().map_err(|_| Error::ReadFailed)? {
        1 => 65536,
        x if (512..=32768).contains(&x) && x.is_power_of_two() => x as u32,
        _ => return Err(Error::UnsupportedPagesize),
    };
    // 18	    1	    File format write version. 1 for legacy; 2 for WAL.
    // 19	    1	    File format read version. 1 for legacy; 2 for WAL.
    if c.read_u8().map_err(|_| Error::ReadFailed)? != 0x01 {
        return Err(Error::Unsupported);
    }
    if c.read_u8().map_err(|_| Error::ReadFailed)? != 0x01 {
        return Err(Error::Unsupported);
    }
    // 20	    1	    Bytes of unused "reserved" space at the end of each page.
    let reserved_bytes = c.read_u8().map_err(|_| Error::ReadFailed)?;
    // 21	    1	    Maximum embedded payload fraction. Must be 64.
    // 22	    1	    Minimum embedded payload fraction. Must be 32.
    // 23	    1	    Leaf payload fraction. Must be 32.
    c.seek(SeekFrom::Start(24)).map_err(|_| Error::ReadFailed)?;
    // 24	    4	    File change counter.
    // 28	    4	    Size of the database file in pages.
    let change_counter = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let num_pages = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    // 32	    4	    Page number of the first freelist trunk page.
    // 36	    4	    Total number of freelist pages.
    let _first_freelist = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let _num_freelist = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    // 40	    4	    The schema cookie.
    let schema_cookie = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    // 44	    4	    The schema format number.
    let _schema_format = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    // 48..56           Page cache size, vacuum root page.
    c.seek(SeekFrom::Start(56)).map_err(|_| Error::ReadFailed)?;
    // 56	    4	    The database text encoding. A value of 1 means UTF-8.
    let encoding = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    if encoding != 0 && encoding != 1 {
        return Err(Error::Unsupported);
    }
    Ok(DbHeader {
        page_size,
        reserved_bytes,
        change_counter,
        num_pages,
        schema_cookie,
    })
}

/// Stamps the mutable header fields into the front of page 1. Called when
/// committing, after the page count or change counter moved.
pub fn stamp(page1: &mut [u8], num_pages: u32, change_counter: u32) {
    page1[CHANGE_COUNTER_OFFSET..CHANGE_COUNTER_OFFSET + 4]
        .copy_from_slice(&change_counter.to_be_bytes());
    page1[NUM_PAGES_OFFSET..NUM_PAGES_OFFSET + 4].copy_from_slice(&num_pages.to_be_bytes());
    // The version-valid-for number tracks the change counter.
    page1[VERSION_VALID_FOR_OFFSET..VERSION_VALID_FOR_OFFSET + 4]
        .copy_from_slice(&change_counter.to_be_bytes());
}

/// Builds page 1 of a fresh database: a valid 100-byte file header followed
/// by an empty table-leaf page (the root of the schema table).
pub fn new_page1(page_size: u32) -> Result<Vec<u8>, Error> {
    if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(Error::UnsupportedPagesize);
    }
    let mut page = vec![0u8; page_size as usize];
    {
        let mut c = Cursor::new(&mut page[..]);
        c.write_all(MAGIC_STRING).map_err(|_| Error::ReadFailed)?;
        // Page size, with 65536 stored as the magic value 1.
        let stored: u16 = if page_size == 65536 { 1 } else { page_size as u16 };
        c.write_u16::<BigEndian>(stored).map_err(|_| Error::ReadFailed)?;
        // Write version 1, read version 1, no reserved bytes.
        c.write_all(&[0x01, 0x01, 0x00]).map_err(|_| Error::ReadFailed)?;
        // Payload fractions: max 64, min 32, leaf 32.
        c.write_all(&[0x40, 0x20, 0x20]).map_err(|_| Error::ReadFailed)?;
        // Change counter 1, one page so far.
        c.write_u32::<BigEndian>(1).map_err(|_| Error::ReadFailed)?;
        c.write_u32::<BigEndian>(1).map_err(|_| Error::ReadFailed)?;
        // No freelist, schema cookie 0, schema format 4.
        c.write_u32::<BigEndian>(0).map_err(|_| Error::ReadFailed)?;
        c.write_u32::<BigEndian>(0).map_err(|_| Error::ReadFailed)?;
        c.write_u32::<BigEndian>(0).map_err(|_| Error::ReadFailed)?;
        c.write_u32::<BigEndian>(4).map_err(|_| Error::ReadFailed)?;
        // Default page cache size 0, vacuum root 0, UTF-8 text encoding.
        c.write_u32::<BigEndian>(0).map_err(|_| Error::ReadFailed)?;
        c.write_u32::<BigEndian>(0).map_err(|_| Error::ReadFailed)?;
        c.write_u32::<BigEndian>(1).map_err(|_| Error::ReadFailed)?;
        // user version, incremental vacuum, application id: all zero.
    }
    stamp(&mut page, 1, 1);
    btree::header::init_page(&mut page, 1, btree::PageType::TableLeaf, page_size);
    Ok(page)
}

#[test]
fn test_new_page1_parses_back() {
    for page_size in [512_u32, 4096, 65536] {
        let page = new_page1(page_size).unwrap();
        assert_eq!(page.len(), page_size as usize);
        let h = parse(&page).unwrap();
        assert_eq!(h.page_size, page_size);
        assert_eq!(h.reserved_bytes, 0);
        assert_eq!(h.num_pages, 1);
        assert_eq!(h.change_counter, 1);
        // The btree header at offset 100 describes an empty table leaf.
        let hdr = btree::header::parse(&page, 1, page_size).unwrap();
        assert_eq!(hdr.page_type, btree::PageType::TableLeaf);
        assert_eq!(hdr.num_cells, 0);
        assert_eq!(hdr.cell_content_start, page_size);
    }
}

#[test]
fn test_parse_rejects_bad_headers() {
    let good = new_page1(4096).unwrap();

    let mut bad_magic = good.clone();
    bad_magic[0] = b'X';
    assert!(matches!(parse(&bad_magic), Err(Error::WrongMagic)));

    let mut bad_pagesize = good.clone();
    bad_pagesize[16] = 0x01;
    bad_pagesize[17] = 0x23;
    assert!(matches!(
        parse(&bad_pagesize),
        Err(Error::UnsupportedPagesize)
    ));

    assert!(matches!(parse(&good[..50]), Err(Error::ReadFailed)));
}

#[test]
fn test_stamp_updates_counters() {
    let mut page = new_page1(4096).unwrap();
    stamp(&mut page, 7, 3);
    let h = parse(&page).unwrap();
    assert_eq!(h.num_pages, 7);
    assert_eq!(h.change_counter, 3);
}
