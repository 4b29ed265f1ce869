//! The host-facing database API: connections, prepared statements, row
//! streaming, and transaction delegation to the page store.
//!
//! A driver shim sits on top of this surface. The engine does not parse SQL;
//! `prepare` takes a compiled bytecode program from the external statement
//! compiler.

use streaming_iterator::StreamingIterator;

use crate::btree;
use crate::pager::{self, FilePager, MemPager, PageNum, PageStore};
use crate::sql_value::SqlValue;
use crate::vm::{self, insn::Insn, Vm, VmState};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("vm: {0}")]
    Vm(#[from] vm::Error),
    #[error("pager: {0}")]
    Pager(#[from] pager::Error),
    #[error("btree: {0}")]
    Btree(#[from] btree::Error),
}

/// One open database. Owns the page store; statements borrow it for the
/// duration of their execution, which serializes them the way the engine
/// expects (a connection runs single-threaded, cooperatively).
pub struct Connection {
    pager: Box<dyn PageStore>,
}

/// What a `Statement::step` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// A result row is available through `Statement::row`.
    Row,
    /// The statement ran to completion.
    Done,
}

impl Connection {
    /// Opens an existing database file.
    pub fn open(path: &str) -> Result<Connection, Error> {
        Ok(Connection {
            pager: Box::new(FilePager::open(path)?),
        })
    }

    /// Creates a new database file with the given page size.
    pub fn create(path: &str, page_size: u32) -> Result<Connection, Error> {
        Ok(Connection {
            pager: Box::new(FilePager::create(path, page_size)?),
        })
    }

    /// Opens a fresh in-memory database.
    pub fn open_in_memory(page_size: u32) -> Result<Connection, Error> {
        Ok(Connection {
            pager: Box::new(MemPager::new(page_size)?),
        })
    }

    /// Allocates an empty table btree and returns its root page number, for
    /// the catalog layer above to record.
    pub fn create_table_tree(&mut self) -> Result<PageNum, Error> {
        Ok(btree::cursor::create_table_tree(self.pager.as_mut())?)
    }

    /// Prepares a compiled program for execution against this connection.
    pub fn prepare(&mut self, program: Vec<Insn>) -> Statement<'_> {
        Statement {
            conn: self,
            vm: Vm::new(program),
        }
    }

    /// Runs a program to completion for its side effects and returns the
    /// number of rows it changed. The convenience entry point for write
    /// statements.
    pub fn execute(&mut self, program: Vec<Insn>) -> anyhow::Result<i64> {
        let mut stmt = self.prepare(program);
        while stmt.step()? != StepResult::Done {}
        let changes = stmt.vm.change_count();
        stmt.finalize();
        Ok(changes)
    }

    pub fn begin(&mut self) -> Result<(), Error> {
        Ok(self.pager.begin()?)
    }

    pub fn commit(&mut self) -> Result<(), Error> {
        Ok(self.pager.commit()?)
    }

    pub fn rollback(&mut self) -> Result<(), Error> {
        Ok(self.pager.rollback()?)
    }

    /// Direct access to the page store, for the layers (and tests) that sit
    /// below the statement interface.
    pub fn pager(&mut self) -> &mut dyn PageStore {
        self.pager.as_mut()
    }
}

/// A prepared statement: a VM bound to its connection.
pub struct Statement<'conn> {
    conn: &'conn mut Connection,
    vm: Vm,
}

impl<'conn> Statement<'conn> {
    /// Binds parameter `ordinal` (1-based); `Variable` instructions read it.
    pub fn bind(&mut self, ordinal: usize, value: SqlValue) {
        self.vm.bind(ordinal, value);
    }

    /// Advances the program until it publishes a row or halts.
    pub fn step(&mut self) -> Result<StepResult, Error> {
        loop {
            match self.vm.step(self.conn.pager.as_mut())? {
                VmState::RowReady => return Ok(StepResult::Row),
                VmState::Halt => return Ok(StepResult::Done),
                _ => {}
            }
        }
    }

    /// The current result row; valid after `step` returned `Row` and until
    /// the next `step`.
    pub fn row(&self) -> &[SqlValue] {
        self.vm.row()
    }

    /// Rows changed by this statement so far.
    pub fn change_count(&self) -> i64 {
        self.vm.change_count()
    }

    /// Rewinds the statement so it can run again. Bindings survive.
    pub fn reset(&mut self) {
        self.vm.reset();
    }

    /// Releases the statement's cursors and registers.
    pub fn finalize(mut self) {
        self.vm.finalize();
    }

    /// A streaming iterator over the statement's remaining rows. Rows are
    /// copied out of the VM's row buffer as the iterator advances; an
    /// execution error ends the stream and is held for inspection.
    pub fn rows(&mut self) -> Rows<'_, 'conn> {
        Rows {
            stmt: self,
            item: None,
            error: None,
        }
    }
}

/// Streaming-iterator adapter over a statement's result rows.
pub struct Rows<'s, 'conn> {
    stmt: &'s mut Statement<'conn>,
    item: Option<Vec<SqlValue>>,
    error: Option<Error>,
}

impl<'s, 'conn> Rows<'s, 'conn> {
    /// The error that ended the stream, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
}

impl<'s, 'conn> StreamingIterator for Rows<'s, 'conn> {
    type Item = Vec<SqlValue>;

    #[inline]
    fn advance(&mut self) {
        if self.error.is_some() {
            self.item = None;
            return;
        }
        match self.stmt.step() {
            Ok(StepResult::Row) => self.item = Some(self.stmt.row().to_vec()),
            Ok(StepResult::Done) => self.item = None,
            Err(e) => {
                self.error = Some(e);
                self.item = None;
            }
        }
    }

    #[inline]
    fn get(&self) -> Option<&Vec<SqlValue>> {
        self.item.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::insn::{Opcode, P4};

    fn op(opcode: Opcode, p1: i32, p2: i32, p3: i32) -> Insn {
        Insn::new(opcode, p1, p2, p3)
    }

    #[test]
    fn test_prepare_step_reset() {
        let mut conn = Connection::open_in_memory(512).unwrap();
        let mut stmt = conn.prepare(vec![
            op(Opcode::Integer, 1, 1, 0),
            op(Opcode::ResultRow, 1, 1, 0),
            op(Opcode::Halt, 0, 0, 0),
        ]);
        assert_eq!(stmt.step().unwrap(), StepResult::Row);
        assert_eq!(stmt.row(), &[SqlValue::Int(1)]);
        assert_eq!(stmt.step().unwrap(), StepResult::Done);
        stmt.reset();
        assert_eq!(stmt.step().unwrap(), StepResult::Row);
        stmt.finalize();
    }

    #[test]
    fn test_streaming_rows() {
        let mut conn = Connection::open_in_memory(512).unwrap();
        let mut stmt = conn.prepare(vec![
            op(Opcode::Integer, 3, 1, 0),
            op(Opcode::ResultRow, 1, 1, 0),
            op(Opcode::IfPos, 1, 1, 1),
            op(Opcode::Halt, 0, 0, 0),
        ]);
        let mut rows = stmt.rows();
        let mut seen = vec![];
        while let Some(row) = rows.next() {
            seen.push(row[0].clone());
        }
        assert!(rows.error().is_none());
        use SqlValue::Int;
        assert_eq!(seen, vec![Int(3), Int(2), Int(1), Int(0)]);
    }

    #[test]
    fn test_execute_insert_and_scan() {
        let mut conn = Connection::open_in_memory(512).unwrap();
        let root = conn.create_table_tree().unwrap() as i32;
        conn.begin().unwrap();
        let changes = conn
            .execute(vec![
                op(Opcode::OpenWrite, 0, root, 1),
                op(Opcode::Integer, 7, 2, 0),
                op(Opcode::MakeRecord, 2, 1, 3),
                op(Opcode::NewRowid, 0, 0, 4),
                op(Opcode::Insert, 0, 3, 4),
                op(Opcode::Close, 0, 0, 0),
                op(Opcode::Halt, 0, 0, 0),
            ])
            .unwrap();
        assert_eq!(changes, 1);
        conn.commit().unwrap();

        let mut stmt = conn.prepare(vec![
            op(Opcode::OpenRead, 0, root, 1),
            op(Opcode::Rewind, 0, 6, 0),
            op(Opcode::Rowid, 0, 1, 0),
            op(Opcode::Column, 0, 0, 2),
            op(Opcode::ResultRow, 1, 2, 0),
            op(Opcode::Next, 0, 2, 0),
            op(Opcode::Close, 0, 0, 0),
            op(Opcode::Halt, 0, 0, 0),
        ]);
        assert_eq!(stmt.step().unwrap(), StepResult::Row);
        assert_eq!(stmt.row(), &[SqlValue::Int(1), SqlValue::Int(7)]);
        assert_eq!(stmt.step().unwrap(), StepResult::Done);
    }

    #[test]
    fn test_rollback_discards_insert() {
        let mut conn = Connection::open_in_memory(512).unwrap();
        let root = conn.create_table_tree().unwrap() as i32;
        conn.commit().unwrap();

        conn.begin().unwrap();
        conn.execute(vec![
            op(Opcode::OpenWrite, 0, root, 1),
            op(Opcode::Integer, 1, 2, 0),
            op(Opcode::MakeRecord, 2, 1, 3),
            op(Opcode::NewRowid, 0, 0, 4),
            op(Opcode::Insert, 0, 3, 4),
            op(Opcode::Halt, 0, 0, 0),
        ])
        .unwrap();
        conn.rollback().unwrap();

        let mut stmt = conn.prepare(vec![
            op(Opcode::OpenRead, 0, root, 1),
            op(Opcode::Rewind, 0, 4, 0),
            op(Opcode::Rowid, 0, 1, 0),
            op(Opcode::ResultRow, 1, 1, 0),
            op(Opcode::Halt, 0, 0, 0),
        ]);
        // The tree is empty again: Rewind jumps straight to Halt.
        assert_eq!(stmt.step().unwrap(), StepResult::Done);
    }

    #[test]
    fn test_variable_binding_through_statement() {
        let mut conn = Connection::open_in_memory(512).unwrap();
        let mut stmt = conn.prepare(vec![
            op(Opcode::Variable, 1, 1, 0),
            Insn::new(Opcode::Function, 0, 1, 2)
                .with_p4(P4::Text("upper".to_string()))
                .with_p5(1),
            op(Opcode::ResultRow, 2, 1, 0),
            op(Opcode::Halt, 0, 0, 0),
        ]);
        stmt.bind(1, SqlValue::Text("quiet".to_string()));
        assert_eq!(stmt.step().unwrap(), StepResult::Row);
        assert_eq!(stmt.row(), &[SqlValue::Text("QUIET".to_string())]);
    }
}
