//! Manages the pages of one database.
//!
//! The btree and VM layers never touch files: they ask a [`PageStore`] for
//! page buffers by 1-based page number and hand them back dirty. The two
//! implementations mirror the two ways the engine runs: [`MemPager`] for
//! in-memory databases and tests, [`FilePager`] for a database file, loading
//! pages on demand and writing dirty ones back on commit.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom, Write};

use log::debug;

use crate::dbheader;

// Page numbers are 1-based, to match how the file format numbers pages.
// PageNum ensures people pass something that is meant to be a page number to
// a function that expects a page number.
pub type PageNum = usize;

// TODO: support databases with more on-disk pages, limiting memory usage by
// paging out unused pages.
const MAX_PAGE_NUM: PageNum = 10_000; // 10_000 * 4k page ~= 40MB

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Pager: Page number greater than maximum supported page number.")]
    PageNumberBeyondLimits,
    #[error("Pager: Internal error.")]
    Internal,
    #[error("Pager: Error accessing database file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Pager: Error in database header: {0}")]
    DbHdr(#[from] dbheader::Error),
}

/// The page provider the engine core runs against.
///
/// Buffers are borrowed for the single operation; holding one across calls
/// is prevented by the borrow checker, which is what keeps cursor paths as
/// `(page number, cell index)` pairs instead of references.
pub trait PageStore {
    fn page_size(&self) -> u32;
    fn reserved_bytes(&self) -> u8;
    /// Number of pages currently in the database.
    fn page_count(&self) -> usize;
    /// Borrows the page buffer for `pn`.
    fn get(&mut self, pn: PageNum) -> Result<&mut Vec<u8>, Error>;
    /// Appends a zeroed page to the database, returning its number and buffer.
    fn allocate(&mut self) -> Result<(PageNum, &mut Vec<u8>), Error>;
    /// Records that the caller modified `pn`.
    fn mark_dirty(&mut self, pn: PageNum);
    fn begin(&mut self) -> Result<(), Error>;
    fn commit(&mut self) -> Result<(), Error>;
    fn rollback(&mut self) -> Result<(), Error>;

    /// Page bytes usable for btree content: the page minus its reserved tail.
    fn usable_size(&self) -> u32 {
        self.page_size() - self.reserved_bytes() as u32
    }
}

/// A page store backed by nothing but memory. `begin` snapshots the page
/// map; `rollback` restores it.
pub struct MemPager {
    pages: HashMap<PageNum, Vec<u8>>,
    page_size: u32,
    snapshot: Option<HashMap<PageNum, Vec<u8>>>,
}

impl MemPager {
    /// Creates an empty in-memory database: page 1 holds the file header and
    /// an empty table-leaf page.
    pub fn new(page_size: u32) -> Result<MemPager, Error> {
        let mut pages = HashMap::new();
        pages.insert(1, dbheader::new_page1(page_size)?);
        Ok(MemPager {
            pages,
            page_size,
            snapshot: None,
        })
    }
}

impl PageStore for MemPager {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn reserved_bytes(&self) -> u8 {
        0
    }

    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn get(&mut self, pn: PageNum) -> Result<&mut Vec<u8>, Error> {
        if pn == 0 || pn > self.pages.len() {
            return Err(Error::PageNumberBeyondLimits);
        }
        self.pages.get_mut(&pn).ok_or(Error::Internal)
    }

    fn allocate(&mut self) -> Result<(PageNum, &mut Vec<u8>), Error> {
        let pn = self.pages.len() + 1;
        if pn > MAX_PAGE_NUM {
            return Err(Error::PageNumberBeyondLimits);
        }
        self.pages.insert(pn, vec![0u8; self.page_size as usize]);
        Ok((pn, self.pages.get_mut(&pn).ok_or(Error::Internal)?))
    }

    fn mark_dirty(&mut self, _pn: PageNum) {}

    fn begin(&mut self) -> Result<(), Error> {
        self.snapshot = Some(self.pages.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        let num_pages = self.pages.len() as u32;
        if let Some(page1) = self.pages.get_mut(&1) {
            let h = dbheader::parse(page1)?;
            dbheader::stamp(page1, num_pages, h.change_counter + 1);
        }
        self.snapshot = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        if let Some(snap) = self.snapshot.take() {
            self.pages = snap;
        }
        Ok(())
    }
}

/// A page store over a database file. Pages load on demand and stay cached;
/// commit writes the dirty set back in page order.
pub struct FilePager {
    f: std::fs::File,
    pages: HashMap<PageNum, Vec<u8>>,
    dirty: HashSet<PageNum>,
    page_size: u32,
    reserved_bytes: u8,
    /// Pages in the database including uncommitted allocations.
    num_pages: usize,
    /// Pages the file held at the last commit; rollback resets to this.
    committed_pages: usize,
    change_counter: u32,
}

impl FilePager {
    /// Opens an existing database file read-write and verifies its header.
    pub fn open(path: &str) -> Result<FilePager, Error> {
        // TODO: Lock the file when opening so that other processes do not
        // also open and modify it.
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        let mut hdr_bytes = vec![0u8; dbheader::DB_HEADER_BYTES];
        f.seek(SeekFrom::Start(0))?;
        f.read_exact(&mut hdr_bytes)?;
        let h = dbheader::parse(&hdr_bytes)?;
        if h.num_pages as usize > MAX_PAGE_NUM {
            return Err(Error::PageNumberBeyondLimits);
        }
        Ok(FilePager {
            f,
            pages: HashMap::new(),
            dirty: HashSet::new(),
            page_size: h.page_size,
            reserved_bytes: h.reserved_bytes,
            num_pages: h.num_pages as usize,
            committed_pages: h.num_pages as usize,
            change_counter: h.change_counter,
        })
    }

    /// Creates a fresh single-page database file.
    pub fn create(path: &str, page_size: u32) -> Result<FilePager, Error> {
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let page1 = dbheader::new_page1(page_size)?;
        f.write_all(&page1)?;
        f.sync_all()?;
        let mut pages = HashMap::new();
        pages.insert(1, page1);
        Ok(FilePager {
            f,
            pages,
            dirty: HashSet::new(),
            page_size,
            reserved_bytes: 0,
            num_pages: 1,
            committed_pages: 1,
            change_counter: 1,
        })
    }

    fn read_page_from_file(&mut self, pn: PageNum) -> Result<Vec<u8>, Error> {
        let mut v = vec![0_u8; self.page_size as usize];
        self.f
            .seek(SeekFrom::Start((pn - 1) as u64 * self.page_size as u64))?;
        self.f.read_exact(&mut v[..])?;
        Ok(v)
    }

    fn ensure_present(&mut self, pn: PageNum) -> Result<(), Error> {
        if !self.pages.contains_key(&pn) {
            debug!("reading page {} on demand", pn);
            let v = self.read_page_from_file(pn)?;
            self.pages.insert(pn, v);
        }
        Ok(())
    }
}

impl PageStore for FilePager {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn reserved_bytes(&self) -> u8 {
        self.reserved_bytes
    }

    fn page_count(&self) -> usize {
        self.num_pages
    }

    fn get(&mut self, pn: PageNum) -> Result<&mut Vec<u8>, Error> {
        if pn == 0 || pn > self.num_pages {
            return Err(Error::PageNumberBeyondLimits);
        }
        self.ensure_present(pn)?;
        self.pages.get_mut(&pn).ok_or(Error::Internal)
    }

    fn allocate(&mut self) -> Result<(PageNum, &mut Vec<u8>), Error> {
        let pn = self.num_pages + 1;
        if pn > MAX_PAGE_NUM {
            return Err(Error::PageNumberBeyondLimits);
        }
        self.num_pages = pn;
        self.pages.insert(pn, vec![0u8; self.page_size as usize]);
        self.dirty.insert(pn);
        Ok((pn, self.pages.get_mut(&pn).ok_or(Error::Internal)?))
    }

    fn mark_dirty(&mut self, pn: PageNum) {
        self.dirty.insert(pn);
    }

    fn begin(&mut self) -> Result<(), Error> {
        // The cached committed state is the rollback point; nothing to do
        // until a page is dirtied.
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        self.change_counter = self.change_counter.wrapping_add(1);
        let (num_pages, change_counter) = (self.num_pages as u32, self.change_counter);
        self.ensure_present(1)?;
        if let Some(page1) = self.pages.get_mut(&1) {
            dbheader::stamp(page1, num_pages, change_counter);
            self.dirty.insert(1);
        }
        let mut dirty: Vec<PageNum> = self.dirty.drain().collect();
        dirty.sort_unstable();
        debug!("committing {} dirty pages", dirty.len());
        for pn in dirty {
            let page = self.pages.get(&pn).ok_or(Error::Internal)?;
            self.f
                .seek(SeekFrom::Start((pn - 1) as u64 * self.page_size as u64))?;
            self.f.write_all(page)?;
        }
        self.f.sync_all()?;
        self.committed_pages = self.num_pages;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        // Drop the dirty copies; they reload from the file on demand.
        for pn in self.dirty.drain() {
            self.pages.remove(&pn);
        }
        self.num_pages = self.committed_pages;
        Ok(())
    }
}

#[test]
fn test_mem_pager_allocate_and_get() {
    let mut p = MemPager::new(512).unwrap();
    assert_eq!(p.page_count(), 1);
    assert_eq!(p.usable_size(), 512);
    let (pn, page) = p.allocate().unwrap();
    assert_eq!(pn, 2);
    page[0] = 0xab;
    assert_eq!(p.get(2).unwrap()[0], 0xab);
    assert!(p.get(3).is_err());
}

#[test]
fn test_mem_pager_rollback_restores_pages() {
    let mut p = MemPager::new(512).unwrap();
    p.begin().unwrap();
    let (pn, page) = p.allocate().unwrap();
    page[0] = 0xcd;
    p.rollback().unwrap();
    assert_eq!(p.page_count(), 1);
    assert!(p.get(pn).is_err());

    p.begin().unwrap();
    p.allocate().unwrap();
    p.commit().unwrap();
    assert_eq!(p.page_count(), 2);
    let h = dbheader::parse(p.get(1).unwrap()).unwrap();
    assert_eq!(h.num_pages, 2);
    assert_eq!(h.change_counter, 2);
}

#[cfg(test)]
fn temp_db_path(name: &str) -> String {
    let dir = std::env::temp_dir().join("minidb-pager-tests");
    std::fs::create_dir_all(&dir).expect("Should have created temp dir");
    dir.join(name).to_string_lossy().into_owned()
}

#[test]
fn test_file_pager_create_write_reopen() {
    let path = temp_db_path("create_write_reopen.db");
    let _ = std::fs::remove_file(&path);
    {
        let mut p = FilePager::create(&path, 512).unwrap();
        let (pn, page) = p.allocate().unwrap();
        assert_eq!(pn, 2);
        page[7] = 0x7e;
        p.mark_dirty(pn);
        p.commit().unwrap();
    }
    {
        let mut p = FilePager::open(&path).unwrap();
        assert_eq!(p.page_size(), 512);
        assert_eq!(p.page_count(), 2);
        assert_eq!(p.get(2).unwrap()[7], 0x7e);
    }
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_file_pager_rollback_drops_dirty() {
    let path = temp_db_path("rollback_drops_dirty.db");
    let _ = std::fs::remove_file(&path);
    let mut p = FilePager::create(&path, 512).unwrap();
    p.begin().unwrap();
    let (pn, page) = p.allocate().unwrap();
    page[0] = 0xff;
    p.rollback().unwrap();
    assert_eq!(p.page_count(), 1);
    assert!(p.get(pn).is_err());
    let _ = std::fs::remove_file(&path);
}
