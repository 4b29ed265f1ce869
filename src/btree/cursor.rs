//! cursor walks a table btree, maintaining the path from the root to the
//! current cell as a pair of parallel stacks.
//!
//! The stacks hold `(page number, cell index)` per level; pages themselves
//! are resolved through the page store on every access, so a cursor never
//! holds a page borrow between calls. On interior levels the cell index
//! ranges over `0..=num_cells`, where `num_cells` denotes the rightmost
//! child.

use std::ops::Range;

use log::debug;

use super::{cell, header, page, Error, PageType, RowId, MAX_TREE_DEPTH};
use crate::pager::{PageNum, PageStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Not positioned on any row (fresh cursor, or ran off either end).
    Invalid,
    /// Positioned on a row; the cached current cell is trustworthy.
    Valid,
    /// The tree was mutated out from under this cursor; the position must be
    /// restored from the saved rowid before the next use.
    RequiresReseek,
    /// A structural error was observed; the cursor is unusable.
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResult {
    Found,
    NotFound,
}

/// The parsed cell the cursor currently sits on. `local_payload` is
/// page-relative.
#[derive(Debug, Clone)]
struct CurrentCell {
    page: PageNum,
    index: usize,
    rowid: RowId,
    payload_len: usize,
    local_payload: Range<usize>,
    first_overflow_page: Option<u32>,
}

pub struct Cursor {
    root_page: PageNum,
    page_stack: Vec<PageNum>,
    cell_stack: Vec<usize>,
    state: CursorState,
    current: Option<CurrentCell>,
    /// Where to restore to after `RequiresReseek`.
    saved_rowid: Option<RowId>,
}

/// Allocates a fresh empty table btree, returning its root page number.
pub fn create_table_tree(pager: &mut dyn PageStore) -> Result<PageNum, Error> {
    let usable = pager.usable_size();
    let (pg, page) = pager.allocate()?;
    header::init_page(page, pg, PageType::TableLeaf, usable);
    pager.mark_dirty(pg);
    Ok(pg)
}

/// Reads the child page number at `index` of an interior page, where
/// `index == num_cells` means the rightmost pointer.
fn child_at(
    page: &[u8],
    pgnum: PageNum,
    usable_size: u32,
    hdr: &header::PageHeader,
    index: usize,
) -> Result<PageNum, Error> {
    let child = if index < hdr.num_cells as usize {
        let bytes = page::cell_bytes(page, pgnum, usable_size, hdr, index)?;
        cell::parse_table_interior(bytes)
            .ok_or(Error::CorruptCell { pgnum, index })?
            .left_child
    } else {
        hdr.rightmost_pointer.ok_or(Error::CorruptHeader {
            pgnum,
            reason: "interior page missing rightmost pointer",
        })?
    };
    if child == 0 {
        return Err(Error::CorruptHeader {
            pgnum,
            reason: "interior page with zero child pointer",
        });
    }
    Ok(child as PageNum)
}

fn require_table_page(hdr: &header::PageHeader, pgnum: PageNum) -> Result<(), Error> {
    if !hdr.page_type.is_table() {
        return Err(Error::CorruptHeader {
            pgnum,
            reason: "index btree page inside a table btree",
        });
    }
    Ok(())
}

impl Cursor {
    pub fn new(root_page: PageNum) -> Cursor {
        Cursor {
            root_page,
            page_stack: vec![],
            cell_stack: vec![],
            state: CursorState::Invalid,
            current: None,
            saved_rowid: None,
        }
    }

    pub fn root_page(&self) -> PageNum {
        self.root_page
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Called when another cursor mutated this cursor's tree: remembers the
    /// current rowid and drops the now-stale path.
    pub fn note_tree_modified(&mut self) {
        if self.state == CursorState::Valid {
            if let Some(cur) = &self.current {
                self.saved_rowid = Some(cur.rowid);
            }
            self.state = CursorState::RequiresReseek;
        }
        self.current = None;
        self.page_stack.clear();
        self.cell_stack.clear();
    }

    fn go_invalid(&mut self) {
        self.state = CursorState::Invalid;
        self.current = None;
        self.page_stack.clear();
        self.cell_stack.clear();
    }

    /// The rowid of the current row.
    pub fn rowid(&mut self, pager: &mut dyn PageStore) -> Result<RowId, Error> {
        self.ensure_positioned(pager)?;
        Ok(self.current.as_ref().ok_or(Error::CursorInvalid)?.rowid)
    }

    /// The full payload of the current row, with any overflow chain
    /// reassembled.
    pub fn payload(&mut self, pager: &mut dyn PageStore) -> Result<Vec<u8>, Error> {
        self.ensure_positioned(pager)?;
        let cur = self.current.as_ref().ok_or(Error::CursorInvalid)?.clone();
        let mut out = {
            let page = pager.get(cur.page)?;
            page[cur.local_payload.clone()].to_vec()
        };
        if let Some(first) = cur.first_overflow_page {
            let remaining = cur.payload_len - out.len();
            cell::read_overflow_chain(pager, first, remaining, &mut out)?;
        }
        Ok(out)
    }

    fn ensure_positioned(&mut self, pager: &mut dyn PageStore) -> Result<(), Error> {
        match self.state {
            CursorState::Valid => Ok(()),
            CursorState::RequiresReseek => {
                let k = self.saved_rowid.ok_or(Error::CursorInvalid)?;
                match self.seek_rowid(pager, k)? {
                    SeekResult::Found => Ok(()),
                    SeekResult::NotFound => Err(Error::CursorInvalid),
                }
            }
            CursorState::Invalid | CursorState::Fault => Err(Error::CursorInvalid),
        }
    }

    /// Parses the leaf cell under the top of the stacks into `current`.
    fn load_current(&mut self, pager: &mut dyn PageStore) -> Result<(), Error> {
        let pg = *self.page_stack.last().ok_or(Error::CursorInvalid)?;
        let index = *self.cell_stack.last().ok_or(Error::CursorInvalid)?;
        let usable = pager.usable_size();
        let page = pager.get(pg)?;
        let hdr = header::parse(page, pg, usable)?;
        let offset = page::cell_pointer(page, pg, hdr.page_type, index);
        let bytes = page::cell_bytes(page, pg, usable, &hdr, index)?;
        let parsed = cell::parse_table_leaf(bytes, usable)
            .ok_or(Error::CorruptCell { pgnum: pg, index })?;
        self.current = Some(CurrentCell {
            page: pg,
            index,
            rowid: parsed.rowid,
            payload_len: parsed.payload_len,
            local_payload: offset + parsed.local_payload.start..offset + parsed.local_payload.end,
            first_overflow_page: parsed.first_overflow_page,
        });
        Ok(())
    }

    /// Positions on the smallest rowid in the tree. Returns false (state
    /// `Invalid`) when the tree is empty.
    pub fn move_to_first(&mut self, pager: &mut dyn PageStore) -> Result<bool, Error> {
        self.go_invalid();
        self.saved_rowid = None;
        let root = self.root_page;
        self.descend_edge(pager, root, true)
    }

    /// Positions on the largest rowid in the tree.
    pub fn move_to_last(&mut self, pager: &mut dyn PageStore) -> Result<bool, Error> {
        self.go_invalid();
        self.saved_rowid = None;
        let root = self.root_page;
        self.descend_edge(pager, root, false)
    }

    /// Descends along the left or right edge of the subtree rooted at `pg`,
    /// appending to the stacks.
    fn descend_edge(
        &mut self,
        pager: &mut dyn PageStore,
        mut pg: PageNum,
        leftmost: bool,
    ) -> Result<bool, Error> {
        let usable = pager.usable_size();
        loop {
            if self.page_stack.len() >= MAX_TREE_DEPTH {
                self.state = CursorState::Fault;
                return Err(Error::TreeTooDeep);
            }
            let child = {
                let page = pager.get(pg)?;
                let hdr = header::parse(page, pg, usable)?;
                require_table_page(&hdr, pg)?;
                let ncells = hdr.num_cells as usize;
                if hdr.page_type.is_leaf() {
                    if ncells == 0 {
                        // Only legal for an empty root; either way there is
                        // nothing here to stand on.
                        self.go_invalid();
                        return Ok(false);
                    }
                    self.page_stack.push(pg);
                    self.cell_stack.push(if leftmost { 0 } else { ncells - 1 });
                    None
                } else {
                    let index = if leftmost { 0 } else { ncells };
                    let child = child_at(page, pg, usable, &hdr, index)?;
                    self.page_stack.push(pg);
                    self.cell_stack.push(index);
                    Some(child)
                }
            };
            match child {
                Some(c) => pg = c,
                None => {
                    self.load_current(pager)?;
                    self.state = CursorState::Valid;
                    return Ok(true);
                }
            }
        }
    }

    /// Advances to the next larger rowid. Returns false at the end of the
    /// tree. After a tree mutation the saved position is restored first; if
    /// the saved row itself is gone, its successor counts as the next row.
    pub fn next(&mut self, pager: &mut dyn PageStore) -> Result<bool, Error> {
        match self.state {
            CursorState::Fault => return Err(Error::CursorInvalid),
            CursorState::Invalid => return Ok(false),
            CursorState::RequiresReseek => {
                let target = self.saved_rowid.ok_or(Error::CursorInvalid)?;
                match self.seek_rowid(pager, target)? {
                    SeekResult::Found => {} // back on the saved row; advance normally
                    SeekResult::NotFound => {
                        if let Some(cur) = &self.current {
                            if cur.rowid > target {
                                return Ok(true);
                            }
                        }
                        self.go_invalid();
                        return Ok(false);
                    }
                }
            }
            CursorState::Valid => {}
        }
        self.advance(pager)
    }

    /// Steps to the next smaller rowid; the mirror of [`Cursor::next`].
    pub fn prev(&mut self, pager: &mut dyn PageStore) -> Result<bool, Error> {
        match self.state {
            CursorState::Fault => return Err(Error::CursorInvalid),
            CursorState::Invalid => return Ok(false),
            CursorState::RequiresReseek => {
                let target = self.saved_rowid.ok_or(Error::CursorInvalid)?;
                match self.seek_rowid(pager, target)? {
                    SeekResult::Found => {}
                    SeekResult::NotFound => {
                        if let Some(cur) = &self.current {
                            if cur.rowid < target {
                                // Landed on the last row below the target:
                                // that is exactly the previous row.
                                return Ok(true);
                            }
                        } else {
                            self.go_invalid();
                            return Ok(false);
                        }
                        // Landed on the successor; its predecessor is ours.
                    }
                }
            }
            CursorState::Valid => {}
        }
        self.retreat(pager)
    }

    fn advance(&mut self, pager: &mut dyn PageStore) -> Result<bool, Error> {
        let usable = pager.usable_size();
        // When set, we are descending to the leftmost row of this subtree.
        let mut pending: Option<PageNum> = None;
        loop {
            if let Some(pg) = pending.take() {
                if self.page_stack.len() >= MAX_TREE_DEPTH {
                    self.state = CursorState::Fault;
                    return Err(Error::TreeTooDeep);
                }
                let descend = {
                    let page = pager.get(pg)?;
                    let hdr = header::parse(page, pg, usable)?;
                    require_table_page(&hdr, pg)?;
                    if hdr.page_type.is_leaf() {
                        if hdr.num_cells == 0 {
                            // A leaf emptied by deletes: skip it and resume
                            // ascending from its parent.
                            None
                        } else {
                            self.page_stack.push(pg);
                            self.cell_stack.push(0);
                            self.state = CursorState::Valid;
                            Some(None)
                        }
                    } else {
                        let child = child_at(page, pg, usable, &hdr, 0)?;
                        self.page_stack.push(pg);
                        self.cell_stack.push(0);
                        Some(Some(child))
                    }
                };
                match descend {
                    Some(None) => {
                        self.load_current(pager)?;
                        return Ok(true);
                    }
                    Some(Some(child)) => pending = Some(child),
                    None => {}
                }
                continue;
            }
            let pg = match self.page_stack.last() {
                Some(pg) => *pg,
                None => {
                    self.go_invalid();
                    return Ok(false);
                }
            };
            let index = *self.cell_stack.last().ok_or(Error::CursorInvalid)?;
            let step = {
                let page = pager.get(pg)?;
                let hdr = header::parse(page, pg, usable)?;
                let ncells = hdr.num_cells as usize;
                if hdr.page_type.is_leaf() {
                    if index + 1 < ncells {
                        Some(None)
                    } else {
                        None
                    }
                } else if index < ncells {
                    let child = child_at(page, pg, usable, &hdr, index + 1)?;
                    Some(Some(child))
                } else {
                    None
                }
            };
            match step {
                Some(None) => {
                    *self.cell_stack.last_mut().ok_or(Error::CursorInvalid)? = index + 1;
                    self.load_current(pager)?;
                    self.state = CursorState::Valid;
                    return Ok(true);
                }
                Some(Some(child)) => {
                    *self.cell_stack.last_mut().ok_or(Error::CursorInvalid)? = index + 1;
                    pending = Some(child);
                }
                None => {
                    self.page_stack.pop();
                    self.cell_stack.pop();
                }
            }
        }
    }

    fn retreat(&mut self, pager: &mut dyn PageStore) -> Result<bool, Error> {
        let usable = pager.usable_size();
        // When set, we are descending to the rightmost row of this subtree.
        let mut pending: Option<PageNum> = None;
        loop {
            if let Some(pg) = pending.take() {
                if self.page_stack.len() >= MAX_TREE_DEPTH {
                    self.state = CursorState::Fault;
                    return Err(Error::TreeTooDeep);
                }
                let descend = {
                    let page = pager.get(pg)?;
                    let hdr = header::parse(page, pg, usable)?;
                    require_table_page(&hdr, pg)?;
                    let ncells = hdr.num_cells as usize;
                    if hdr.page_type.is_leaf() {
                        if ncells == 0 {
                            None
                        } else {
                            self.page_stack.push(pg);
                            self.cell_stack.push(ncells - 1);
                            self.state = CursorState::Valid;
                            Some(None)
                        }
                    } else {
                        let child = child_at(page, pg, usable, &hdr, ncells)?;
                        self.page_stack.push(pg);
                        self.cell_stack.push(ncells);
                        Some(Some(child))
                    }
                };
                match descend {
                    Some(None) => {
                        self.load_current(pager)?;
                        return Ok(true);
                    }
                    Some(Some(child)) => pending = Some(child),
                    None => {}
                }
                continue;
            }
            let pg = match self.page_stack.last() {
                Some(pg) => *pg,
                None => {
                    self.go_invalid();
                    return Ok(false);
                }
            };
            let index = *self.cell_stack.last().ok_or(Error::CursorInvalid)?;
            let step = {
                let page = pager.get(pg)?;
                let hdr = header::parse(page, pg, usable)?;
                if index == 0 {
                    None
                } else if hdr.page_type.is_leaf() {
                    Some(None)
                } else {
                    let child = child_at(page, pg, usable, &hdr, index - 1)?;
                    Some(Some(child))
                }
            };
            match step {
                Some(None) => {
                    *self.cell_stack.last_mut().ok_or(Error::CursorInvalid)? = index - 1;
                    self.load_current(pager)?;
                    self.state = CursorState::Valid;
                    return Ok(true);
                }
                Some(Some(child)) => {
                    *self.cell_stack.last_mut().ok_or(Error::CursorInvalid)? = index - 1;
                    pending = Some(child);
                }
                None => {
                    self.page_stack.pop();
                    self.cell_stack.pop();
                }
            }
        }
    }

    /// Walks from the root to the leaf that does or would hold rowid `k`,
    /// binary-searching each page. The stacks record the path. Returns the
    /// leaf's cell count and the lower-bound index (the first cell with
    /// rowid >= `k`, which is `num_cells` when every rowid is smaller).
    fn descend_to_leaf(
        &mut self,
        pager: &mut dyn PageStore,
        k: RowId,
    ) -> Result<(usize, usize), Error> {
        self.page_stack.clear();
        self.cell_stack.clear();
        self.current = None;
        let usable = pager.usable_size();
        let mut pg = self.root_page;
        loop {
            if self.page_stack.len() >= MAX_TREE_DEPTH {
                self.state = CursorState::Fault;
                return Err(Error::TreeTooDeep);
            }
            let page = pager.get(pg)?;
            let hdr = header::parse(page, pg, usable)?;
            require_table_page(&hdr, pg)?;
            let ncells = hdr.num_cells as usize;
            // Smallest index whose key is >= k.
            let mut lo = 0;
            let mut hi = ncells;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let bytes = page::cell_bytes(page, pg, usable, &hdr, mid)?;
                let key = cell::table_cell_rowid(hdr.page_type, bytes, usable)
                    .ok_or(Error::CorruptCell { pgnum: pg, index: mid })?;
                if key < k {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            if hdr.page_type.is_leaf() {
                self.page_stack.push(pg);
                self.cell_stack.push(if ncells == 0 { 0 } else { lo.min(ncells - 1) });
                return Ok((ncells, lo));
            }
            let child = child_at(page, pg, usable, &hdr, lo)?;
            self.page_stack.push(pg);
            self.cell_stack.push(lo);
            pg = child;
        }
    }

    /// Positions the cursor at rowid `k` if present (`Found`), else at its
    /// successor, or at the last row when `k` is beyond every rowid
    /// (`NotFound` either way). On an empty tree the cursor goes `Invalid`.
    pub fn seek_rowid(
        &mut self,
        pager: &mut dyn PageStore,
        k: RowId,
    ) -> Result<SeekResult, Error> {
        self.saved_rowid = None;
        let (ncells, lb) = self.descend_to_leaf(pager, k)?;
        if ncells == 0 {
            self.go_invalid();
            return Ok(SeekResult::NotFound);
        }
        if lb < ncells {
            self.load_current(pager)?;
            self.state = CursorState::Valid;
            let on_key = self
                .current
                .as_ref()
                .map(|c| c.rowid == k)
                .unwrap_or(false);
            return Ok(if on_key {
                SeekResult::Found
            } else {
                SeekResult::NotFound
            });
        }
        // Every rowid in this leaf is below k. The successor, if any, lives
        // under a later subtree; otherwise settle on the tree's last row.
        self.load_current(pager)?;
        self.state = CursorState::Valid;
        if self.advance(pager)? {
            return Ok(SeekResult::NotFound);
        }
        self.move_to_last(pager)?;
        Ok(SeekResult::NotFound)
    }

    /// Inserts a new row. The rowid must not already exist. If the target
    /// leaf is full the page is split, growing the tree as needed; the
    /// cursor ends positioned on the new row.
    pub fn insert(
        &mut self,
        pager: &mut dyn PageStore,
        rowid: RowId,
        record: &[u8],
    ) -> Result<(), Error> {
        let usable = pager.usable_size();
        self.saved_rowid = None;
        let (ncells, mut lb) = self.descend_to_leaf(pager, rowid)?;
        if lb < ncells {
            let leaf = *self.page_stack.last().ok_or(Error::CursorInvalid)?;
            let page = pager.get(leaf)?;
            let hdr = header::parse(page, leaf, usable)?;
            let bytes = page::cell_bytes(page, leaf, usable, &hdr, lb)?;
            let key = cell::table_cell_rowid(hdr.page_type, bytes, usable)
                .ok_or(Error::CorruptCell { pgnum: leaf, index: lb })?;
            if key == rowid {
                return Err(Error::DuplicateKey(rowid));
            }
        }

        // Serialize the cell, spilling the payload tail to an overflow chain
        // when it cannot live on the page.
        let local_len = cell::local_payload_len(record.len(), usable, PageType::TableLeaf);
        let cell_bytes = if local_len < record.len() {
            let first = cell::write_overflow_chain(pager, &record[local_len..])?;
            cell::make_table_leaf(rowid, record.len(), &record[..local_len], Some(first))
        } else {
            cell::make_table_leaf(rowid, record.len(), record, None)
        };

        loop {
            let leaf = *self.page_stack.last().ok_or(Error::CursorInvalid)?;
            let result = {
                let page = pager.get(leaf)?;
                page::insert_cell(page, leaf, usable, lb, &cell_bytes)
            };
            match result {
                Ok(()) => {
                    pager.mark_dirty(leaf);
                    break;
                }
                Err(Error::PageFull(_)) => {
                    debug!("page {} full, splitting to insert rowid {}", leaf, rowid);
                    if self.split_leaf(pager, &cell_bytes, lb)? {
                        break;
                    }
                    // The split made room without placing the cell; retry
                    // against the reshaped tree.
                    let (_, retry_lb) = self.descend_to_leaf(pager, rowid)?;
                    lb = retry_lb;
                }
                Err(e) => return Err(e),
            }
        }
        // Re-walk to the freshly inserted row so the cached position and the
        // (possibly restructured) tree agree.
        self.seek_rowid(pager, rowid)?;
        Ok(())
    }

    /// Splits the leaf at the top of the recorded path. Prefers a split that
    /// places `pending` (at cell index `idx`) directly, returning true; when
    /// no split point can fit the pending cell beside its neighbors - a
    /// near-half-page cell landing between small ones - the leaf is halved
    /// without it and false tells the caller to retry.
    fn split_leaf(
        &mut self,
        pager: &mut dyn PageStore,
        pending: &[u8],
        idx: usize,
    ) -> Result<bool, Error> {
        let usable = pager.usable_size();
        let pg = *self.page_stack.last().ok_or(Error::CursorInvalid)?;
        let (hdr, existing) = {
            let page = pager.get(pg)?;
            page::read_all_cells(page, pg, usable)?
        };
        // Split halves always land on non-first pages, whose full usable
        // area minus the page header is available for cells and pointers.
        let capacity = usable as usize - hdr.page_type.header_len();

        let mut with_pending = existing.clone();
        with_pending.insert(idx, pending.to_vec());
        if let Some(m) = find_split_point(&with_pending, capacity) {
            debug!("splitting leaf page {} at cell {}", pg, m);
            self.split_and_propagate(pager, with_pending, m)?;
            return Ok(true);
        }
        if existing.len() < 2 {
            // A cell this large can never sit on this leaf (the root on
            // page 1 has less room than the payload-split formulas assume).
            return Err(Error::PageFull(pending.len()));
        }
        let m = find_split_point(&existing, capacity).unwrap_or(existing.len() / 2);
        debug!(
            "halving leaf page {} at cell {} to make room for a large cell",
            pg, m
        );
        self.split_and_propagate(pager, existing, m)?;
        Ok(false)
    }

    /// Splits the leaf at the top of the path into `cells[..m]` and
    /// `cells[m..]` and pushes a divider into the parent, growing the tree
    /// when the root itself splits (the root keeps its page number).
    fn split_and_propagate(
        &mut self,
        pager: &mut dyn PageStore,
        mut cells: Vec<Vec<u8>>,
        m: usize,
    ) -> Result<(), Error> {
        let usable = pager.usable_size();
        let level = self.page_stack.len() - 1;
        let pg = self.page_stack[level];
        let divider_rowid = cell::parse_table_leaf(&cells[m - 1], usable)
            .ok_or(Error::CorruptCell { pgnum: pg, index: m - 1 })?
            .rowid;
        let right_cells = cells.split_off(m);
        let left_cells = cells;

        if level == 0 {
            // Root split: both halves move into fresh pages and the root is
            // rewritten one level taller.
            let (left_pg, _) = pager.allocate()?;
            let (right_pg, _) = pager.allocate()?;
            {
                let page = pager.get(left_pg)?;
                page::write_page(page, left_pg, usable, PageType::TableLeaf, &left_cells, None)?;
            }
            pager.mark_dirty(left_pg);
            {
                let page = pager.get(right_pg)?;
                page::write_page(page, right_pg, usable, PageType::TableLeaf, &right_cells, None)?;
            }
            pager.mark_dirty(right_pg);
            let divider = cell::make_table_interior(left_pg as u32, divider_rowid);
            {
                let page = pager.get(pg)?;
                page::write_page(
                    page,
                    pg,
                    usable,
                    PageType::TableInterior,
                    &[divider],
                    Some(right_pg as u32),
                )?;
            }
            pager.mark_dirty(pg);
            return Ok(());
        }

        // Non-root: the left half stays in place, the right half gets a new
        // page, and the parent slot that pointed here now points at the
        // right half with a divider cell for the left inserted before it.
        let (right_pg, _) = pager.allocate()?;
        {
            let page = pager.get(pg)?;
            page::write_page(page, pg, usable, PageType::TableLeaf, &left_cells, None)?;
        }
        pager.mark_dirty(pg);
        {
            let page = pager.get(right_pg)?;
            page::write_page(page, right_pg, usable, PageType::TableLeaf, &right_cells, None)?;
        }
        pager.mark_dirty(right_pg);

        let parent_idx = self.cell_stack[level - 1];
        rewire_child(pager, self.page_stack[level - 1], usable, parent_idx, right_pg as u32)?;
        let divider = cell::make_table_interior(pg as u32, divider_rowid);
        self.insert_interior(pager, level - 1, parent_idx, divider)
    }

    /// Inserts a divider cell into the interior page at `level` of the path,
    /// splitting interior pages on the way up as needed. Interior cells are
    /// a few bytes, so a count-balanced split always leaves room.
    fn insert_interior(
        &mut self,
        pager: &mut dyn PageStore,
        level: usize,
        idx: usize,
        cell_data: Vec<u8>,
    ) -> Result<(), Error> {
        let usable = pager.usable_size();
        let mut level = level;
        let mut pending = cell_data;
        let mut pending_idx = idx;
        loop {
            let pg = self.page_stack[level];
            let result = {
                let page = pager.get(pg)?;
                page::insert_cell(page, pg, usable, pending_idx, &pending)
            };
            match result {
                Ok(()) => {
                    pager.mark_dirty(pg);
                    return Ok(());
                }
                Err(Error::PageFull(_)) => {}
                Err(e) => return Err(e),
            }

            let (hdr, mut cells) = {
                let page = pager.get(pg)?;
                page::read_all_cells(page, pg, usable)?
            };
            cells.insert(pending_idx, pending);
            debug!(
                "splitting interior page {} holding {} cells",
                pg,
                cells.len()
            );
            // The middle cell's key moves up; its left child becomes the
            // left half's rightmost pointer.
            let m = cells.len() / 2;
            let divider = cell::parse_table_interior(&cells[m])
                .ok_or(Error::CorruptCell { pgnum: pg, index: m })?;
            let left_rmp = Some(divider.left_child);
            let right_rmp = Some(hdr.rightmost_pointer.ok_or(Error::CorruptHeader {
                pgnum: pg,
                reason: "interior page missing rightmost pointer",
            })?);
            let right_cells = cells.split_off(m + 1);
            cells.truncate(m);
            let left_cells = cells;

            if level == 0 {
                let (left_pg, _) = pager.allocate()?;
                let (right_pg, _) = pager.allocate()?;
                {
                    let page = pager.get(left_pg)?;
                    page::write_page(
                        page,
                        left_pg,
                        usable,
                        PageType::TableInterior,
                        &left_cells,
                        left_rmp,
                    )?;
                }
                pager.mark_dirty(left_pg);
                {
                    let page = pager.get(right_pg)?;
                    page::write_page(
                        page,
                        right_pg,
                        usable,
                        PageType::TableInterior,
                        &right_cells,
                        right_rmp,
                    )?;
                }
                pager.mark_dirty(right_pg);
                let up = cell::make_table_interior(left_pg as u32, divider.rowid);
                {
                    let page = pager.get(pg)?;
                    page::write_page(
                        page,
                        pg,
                        usable,
                        PageType::TableInterior,
                        &[up],
                        Some(right_pg as u32),
                    )?;
                }
                pager.mark_dirty(pg);
                return Ok(());
            }

            let (right_pg, _) = pager.allocate()?;
            {
                let page = pager.get(pg)?;
                page::write_page(
                    page,
                    pg,
                    usable,
                    PageType::TableInterior,
                    &left_cells,
                    left_rmp,
                )?;
            }
            pager.mark_dirty(pg);
            {
                let page = pager.get(right_pg)?;
                page::write_page(
                    page,
                    right_pg,
                    usable,
                    PageType::TableInterior,
                    &right_cells,
                    right_rmp,
                )?;
            }
            pager.mark_dirty(right_pg);

            let parent_idx = self.cell_stack[level - 1];
            rewire_child(
                pager,
                self.page_stack[level - 1],
                usable,
                parent_idx,
                right_pg as u32,
            )?;
            pending = cell::make_table_interior(pg as u32, divider.rowid);
            pending_idx = parent_idx;
            level -= 1;
        }
    }

    /// Removes the current row. The page is left sparse; its free space is
    /// reclaimed by defragmentation on a later insert. The cursor keeps the
    /// deleted rowid as its saved position, so `next` lands on the
    /// successor.
    pub fn delete(&mut self, pager: &mut dyn PageStore) -> Result<(), Error> {
        self.ensure_positioned(pager)?;
        let cur = self.current.as_ref().ok_or(Error::CursorInvalid)?.clone();
        let usable = pager.usable_size();
        {
            let page = pager.get(cur.page)?;
            page::delete_cell(page, cur.page, usable, cur.index)?;
        }
        pager.mark_dirty(cur.page);
        self.saved_rowid = Some(cur.rowid);
        self.state = CursorState::RequiresReseek;
        self.current = None;
        self.page_stack.clear();
        self.cell_stack.clear();
        Ok(())
    }
}

/// The most balanced split index `m` in `1..n` where both `cells[..m]` and
/// `cells[m..]` fit in `capacity` (cell bytes plus a 2-byte pointer each),
/// or None when no such index exists.
fn find_split_point(cells: &[Vec<u8>], capacity: usize) -> Option<usize> {
    let sizes: Vec<usize> = cells.iter().map(|c| c.len() + 2).collect();
    let total: usize = sizes.iter().sum();
    let mut best: Option<(usize, usize)> = None;
    let mut left = 0;
    for m in 1..cells.len() {
        left += sizes[m - 1];
        let right = total - left;
        if left <= capacity && right <= capacity {
            let imbalance = left.abs_diff(right);
            if best.map_or(true, |(b, _)| imbalance < b) {
                best = Some((imbalance, m));
            }
        }
    }
    best.map(|(_, m)| m)
}

/// Redirects the parent's child slot `index` (a cell's left pointer, or the
/// rightmost pointer when `index == num_cells`) to `new_child`.
fn rewire_child(
    pager: &mut dyn PageStore,
    parent: PageNum,
    usable_size: u32,
    index: usize,
    new_child: u32,
) -> Result<(), Error> {
    let page = pager.get(parent)?;
    let hdr = header::parse(page, parent, usable_size)?;
    if index < hdr.num_cells as usize {
        let offset = page::cell_pointer(page, parent, hdr.page_type, index);
        page[offset..offset + 4].copy_from_slice(&new_child.to_be_bytes());
    } else {
        let mut h = hdr;
        h.rightmost_pointer = Some(new_child);
        header::write(page, parent, &h);
    }
    pager.mark_dirty(parent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::MemPager;
    use crate::record;
    use crate::sql_value::SqlValue;

    fn mem(page_size: u32) -> MemPager {
        MemPager::new(page_size).expect("Should have created in-memory pager")
    }

    fn row(i: i64) -> Vec<u8> {
        record::encode(&[SqlValue::Int(i * 10), SqlValue::Text(format!("row-{:04}", i))])
    }

    fn scan_rowids(cursor: &mut Cursor, pager: &mut dyn PageStore) -> Vec<RowId> {
        let mut out = vec![];
        if cursor.move_to_first(pager).unwrap() {
            loop {
                out.push(cursor.rowid(pager).unwrap());
                if !cursor.next(pager).unwrap() {
                    break;
                }
            }
        }
        out
    }

    #[test]
    fn test_empty_tree() {
        let mut pager = mem(512);
        let root = create_table_tree(&mut pager).unwrap();
        assert_eq!(root, 2);
        let mut c = Cursor::new(root);
        assert!(!c.move_to_first(&mut pager).unwrap());
        assert_eq!(c.state(), CursorState::Invalid);
        assert!(!c.next(&mut pager).unwrap());
        assert_eq!(
            c.seek_rowid(&mut pager, 1).unwrap(),
            SeekResult::NotFound
        );
    }

    #[test]
    fn test_insert_unordered_scan_ordered() {
        let mut pager = mem(512);
        let root = create_table_tree(&mut pager).unwrap();
        let mut c = Cursor::new(root);
        for rowid in [5_i64, 2, 8, 1, 9] {
            c.insert(&mut pager, rowid, &row(rowid)).unwrap();
            assert_eq!(c.rowid(&mut pager).unwrap(), rowid);
        }
        assert_eq!(scan_rowids(&mut c, &mut pager), vec![1, 2, 5, 8, 9]);

        // And backwards.
        let mut out = vec![];
        assert!(c.move_to_last(&mut pager).unwrap());
        loop {
            out.push(c.rowid(&mut pager).unwrap());
            if !c.prev(&mut pager).unwrap() {
                break;
            }
        }
        assert_eq!(out, vec![9, 8, 5, 2, 1]);
    }

    #[test]
    fn test_seek_semantics() {
        let mut pager = mem(512);
        let root = create_table_tree(&mut pager).unwrap();
        let mut c = Cursor::new(root);
        for rowid in [5_i64, 2, 8, 1, 9] {
            c.insert(&mut pager, rowid, &row(rowid)).unwrap();
        }
        // Miss below an existing key lands on the successor.
        assert_eq!(c.seek_rowid(&mut pager, 3).unwrap(), SeekResult::NotFound);
        assert_eq!(c.rowid(&mut pager).unwrap(), 5);
        // Miss past the end lands on the last row.
        assert_eq!(c.seek_rowid(&mut pager, 10).unwrap(), SeekResult::NotFound);
        assert_eq!(c.rowid(&mut pager).unwrap(), 9);
        // Exact hit.
        assert_eq!(c.seek_rowid(&mut pager, 2).unwrap(), SeekResult::Found);
        let payload = c.payload(&mut pager).unwrap();
        assert_eq!(record::decode(&payload).unwrap()[1], SqlValue::Text("row-0002".to_string()));
    }

    #[test]
    fn test_duplicate_rowid_rejected() {
        let mut pager = mem(512);
        let root = create_table_tree(&mut pager).unwrap();
        let mut c = Cursor::new(root);
        c.insert(&mut pager, 4, &row(4)).unwrap();
        assert!(matches!(
            c.insert(&mut pager, 4, &row(4)),
            Err(Error::DuplicateKey(4))
        ));
    }

    #[test]
    fn test_split_builds_multi_level_tree() {
        let mut pager = mem(512);
        let root = create_table_tree(&mut pager).unwrap();
        let mut c = Cursor::new(root);
        let n: i64 = 1000;
        // A deterministic shuffle: 7 is coprime with 1000.
        let mut expected: Vec<i64> = vec![];
        for i in 0..n {
            let rowid = (i * 7) % n + 1;
            let payload =
                record::encode(&[SqlValue::Text(format!("{:060}", rowid))]);
            c.insert(&mut pager, rowid, &payload).unwrap();
            expected.push(rowid);
        }
        expected.sort_unstable();

        // The root must have split into an interior page by now.
        let usable = pager.usable_size();
        let page = pager.get(root).unwrap();
        let hdr = header::parse(page, root, usable).unwrap();
        assert_eq!(hdr.page_type, PageType::TableInterior);

        assert_eq!(scan_rowids(&mut c, &mut pager), expected);

        // Spot-check payloads survived redistribution.
        for probe in [1_i64, 499, 500, 501, 1000] {
            assert_eq!(c.seek_rowid(&mut pager, probe).unwrap(), SeekResult::Found);
            let payload = c.payload(&mut pager).unwrap();
            assert_eq!(
                record::decode(&payload).unwrap()[0],
                SqlValue::Text(format!("{:060}", probe))
            );
        }
    }

    #[test]
    fn test_large_cell_between_small_neighbors() {
        // A near-half-page cell inserted into the middle of a page of tiny
        // cells: no single split point fits it beside its neighbors, so the
        // leaf must be halved first and the insert retried.
        let mut pager = mem(512);
        let root = create_table_tree(&mut pager).unwrap();
        let mut c = Cursor::new(root);
        let mut rowids: Vec<RowId> = vec![];
        for i in 0..56_i64 {
            let rowid = i * 2 + 1;
            let payload = record::encode(&[SqlValue::Int(rowid)]);
            c.insert(&mut pager, rowid, &payload).unwrap();
            rowids.push(rowid);
        }
        let big_payload = record::encode(&[SqlValue::Text("b".repeat(400))]);
        c.insert(&mut pager, 56, &big_payload).unwrap();
        rowids.push(56);
        rowids.sort_unstable();

        assert_eq!(scan_rowids(&mut c, &mut pager), rowids);
        assert_eq!(c.seek_rowid(&mut pager, 56).unwrap(), SeekResult::Found);
        assert_eq!(c.payload(&mut pager).unwrap(), big_payload);
    }

    #[test]
    fn test_overflow_payload_round_trip() {
        let mut pager = mem(512);
        let root = create_table_tree(&mut pager).unwrap();
        let mut c = Cursor::new(root);
        // Far larger than a 512-byte page: spills across several overflow
        // pages.
        let blob: Vec<u8> = (0..1500_u32).map(|i| (i % 251) as u8).collect();
        let payload = record::encode(&[SqlValue::Blob(blob.clone())]);
        c.insert(&mut pager, 1, &payload).unwrap();
        c.insert(&mut pager, 2, &row(2)).unwrap();

        assert_eq!(c.seek_rowid(&mut pager, 1).unwrap(), SeekResult::Found);
        let back = c.payload(&mut pager).unwrap();
        assert_eq!(back, payload);
        assert_eq!(record::decode(&back).unwrap()[0], SqlValue::Blob(blob));
    }

    #[test]
    fn test_delete_then_next_lands_on_successor() {
        let mut pager = mem(512);
        let root = create_table_tree(&mut pager).unwrap();
        let mut c = Cursor::new(root);
        for rowid in 1..=5_i64 {
            c.insert(&mut pager, rowid, &row(rowid)).unwrap();
        }
        assert_eq!(c.seek_rowid(&mut pager, 3).unwrap(), SeekResult::Found);
        c.delete(&mut pager).unwrap();
        assert_eq!(c.state(), CursorState::RequiresReseek);
        assert!(c.next(&mut pager).unwrap());
        assert_eq!(c.rowid(&mut pager).unwrap(), 4);
        assert_eq!(scan_rowids(&mut c, &mut pager), vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_reader_reseeks_after_writer_mutation() {
        let mut pager = mem(512);
        let root = create_table_tree(&mut pager).unwrap();
        let mut writer = Cursor::new(root);
        for rowid in [1_i64, 2, 4, 5] {
            writer.insert(&mut pager, rowid, &row(rowid)).unwrap();
        }
        let mut reader = Cursor::new(root);
        assert!(reader.move_to_first(&mut pager).unwrap());
        assert!(reader.next(&mut pager).unwrap());
        assert_eq!(reader.rowid(&mut pager).unwrap(), 2);

        // A write through another cursor invalidates the reader's path.
        writer.insert(&mut pager, 3, &row(3)).unwrap();
        reader.note_tree_modified();
        assert_eq!(reader.state(), CursorState::RequiresReseek);
        // The reader resumes from its saved position and sees the new row.
        assert!(reader.next(&mut pager).unwrap());
        assert_eq!(reader.rowid(&mut pager).unwrap(), 3);
        assert!(reader.next(&mut pager).unwrap());
        assert_eq!(reader.rowid(&mut pager).unwrap(), 4);
    }

    #[test]
    fn test_insert_reports_tree_too_deep_on_cycle() {
        let mut pager = mem(512);
        let root = create_table_tree(&mut pager).unwrap();
        // Corrupt the file: make the root an interior page pointing at itself.
        {
            let usable = pager.usable_size();
            let divider = cell::make_table_interior(root as u32, 10);
            let page = pager.get(root).unwrap();
            page::write_page(
                page,
                root,
                usable,
                PageType::TableInterior,
                &[divider],
                Some(root as u32),
            )
            .unwrap();
        }
        let mut c = Cursor::new(root);
        assert!(matches!(
            c.seek_rowid(&mut pager, 1),
            Err(Error::TreeTooDeep)
        ));
        assert_eq!(c.state(), CursorState::Fault);
    }
}
