//! minidb is an in-process storage engine and bytecode virtual machine that
//! reads and writes SQLite-format database files.
//!
//! The crate is a stack of four layers, each consuming only the one below:
//!
//! 1. [`varint`] - the 1-9 byte variable-length integer codec the file
//!    format uses everywhere.
//! 2. [`btree::header`], [`btree::page`], [`btree::cell`] - the page and
//!    cell format: headers, the cell pointer array, insertion, deletion and
//!    defragmentation on a raw page buffer.
//! 3. [`btree::cursor`] - ordered navigation over a tree of pages, with
//!    inserts that split full pages and seeks that binary-search each level.
//! 4. [`record`] and [`vm`] - the record codec for row payloads and the
//!    register-based bytecode machine that executes compiled statements.
//!
//! SQL never enters this crate. An external compiler produces
//! [`vm::insn::Insn`] programs; [`connection::Connection`] executes them
//! against a [`pager::PageStore`], which is the only way the engine touches
//! pages. [`pager::MemPager`] backs tests and in-memory databases,
//! [`pager::FilePager`] backs database files.

pub mod btree;
pub mod connection;
pub mod dbheader;
pub mod pager;
pub mod record;
pub mod serial_type;
pub mod sql_value;
pub mod varint;
pub mod vm;

pub use connection::{Connection, Statement, StepResult};
pub use sql_value::SqlValue;
