//! The register-based bytecode virtual machine.
//!
//! A `Vm` owns a compiled program, a register file grown on demand, a cursor
//! table, and a result-row buffer. `step` executes exactly one instruction;
//! `ResultRow` suspends the machine with a row available and the next `step`
//! resumes it. Errors latch: once a step fails, every later step reports the
//! same failure until `reset`.

pub mod func;
pub mod insn;

use std::collections::HashMap;

use log::debug;

use crate::btree;
use crate::btree::cursor::{Cursor, CursorState, SeekResult};
use crate::pager::{self, PageStore};
use crate::record;
use crate::serial_type;
use crate::sql_value::{arithmetic, compare, ArithOp, SqlValue};
use insn::{Insn, Opcode, P4};

/// Registers are allocated lazily but a runaway program cannot grow the file
/// without bound.
const MAX_REGISTERS: i32 = 1 << 16;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("btree: {0}")]
    Btree(#[from] btree::Error),
    #[error("record: {0}")]
    Record(#[from] record::Error),
    #[error("serial type: {0}")]
    SerialType(#[from] serial_type::Error),
    #[error("pager: {0}")]
    Pager(#[from] pager::Error),
    #[error("function: {0}")]
    Func(#[from] func::Error),
    #[error("cursor {0} is not open")]
    CursorClosed(usize),
    #[error("cursor {0} was opened read-only")]
    CursorNotWritable(usize),
    #[error("register {0} is outside the register file")]
    OutOfRegisters(i32),
    #[error("jump target {0} is outside the program")]
    InvalidJump(i32),
    #[error("operand P4 has the wrong variant for {0:?}")]
    BadP4(Opcode),
    #[error("register {0} does not hold a record blob")]
    NotARecord(i32),
    #[error("no unused rowid is available in this tree")]
    NoFreeRowid,
    #[error("statement halted with error code {code}: {message}")]
    Halted { code: i32, message: String },
    #[error("{0}")]
    Fault(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Freshly created; instructions may still be appended.
    Init,
    /// Reset and ready to run from the top.
    Ready,
    Run,
    /// Suspended with a result row available.
    RowReady,
    Halt,
}

/// A cursor table entry: the btree cursor plus the VM-level bookkeeping.
/// Writability lives here, not in the btree; `OpenWrite` is the only thing
/// that grants it.
struct VmCursor {
    cursor: Cursor,
    writable: bool,
    #[allow(dead_code)] // recorded for the compiler's benefit; Column trusts the record
    ncols: usize,
    /// Bumped on every navigation or tree write; stale row caches key off it.
    generation: u64,
    /// The current row's payload, keyed by generation.
    row_cache: Option<(u64, Vec<u8>)>,
}

impl VmCursor {
    fn new(root_page: usize, writable: bool, ncols: usize) -> VmCursor {
        VmCursor {
            cursor: Cursor::new(root_page),
            writable,
            ncols,
            generation: 0,
            row_cache: None,
        }
    }

    /// The current row's payload, reusing the cached copy while the cursor
    /// has not moved.
    fn payload(&mut self, pager: &mut dyn PageStore) -> Result<&Vec<u8>, Error> {
        let fresh = matches!(&self.row_cache, Some((g, _)) if *g == self.generation);
        if !fresh {
            let payload = self.cursor.payload(pager)?;
            self.row_cache = Some((self.generation, payload));
        }
        match &self.row_cache {
            Some((_, payload)) => Ok(payload),
            None => Err(Error::CursorClosed(0)),
        }
    }
}

pub struct Vm {
    program: Vec<Insn>,
    pc: usize,
    state: VmState,
    registers: Vec<SqlValue>,
    cursors: Vec<Option<VmCursor>>,
    /// Bound parameters, 1-based from the caller's view.
    variables: Vec<SqlValue>,
    row: Vec<SqlValue>,
    agg_slots: HashMap<i32, func::Accumulator>,
    change_count: i64,
    halt_code: i32,
    /// Once set, every subsequent step reports this failure.
    fault: Option<String>,
}

impl Vm {
    pub fn new(program: Vec<Insn>) -> Vm {
        Vm {
            program,
            pc: 0,
            state: VmState::Init,
            registers: vec![],
            cursors: vec![],
            variables: vec![],
            row: vec![],
            agg_slots: HashMap::new(),
            change_count: 0,
            halt_code: 0,
            fault: None,
        }
    }

    /// Appends one instruction; only legal before the program first runs.
    pub fn add_insn(&mut self, insn: Insn) {
        debug_assert_eq!(self.state, VmState::Init);
        self.program.push(insn);
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// The row published by the last `ResultRow`, valid while the state is
    /// `RowReady`.
    pub fn row(&self) -> &[SqlValue] {
        &self.row
    }

    pub fn change_count(&self) -> i64 {
        self.change_count
    }

    pub fn halt_code(&self) -> i32 {
        self.halt_code
    }

    /// Binds parameter `ordinal` (1-based) for `Variable` to read.
    pub fn bind(&mut self, ordinal: usize, value: SqlValue) {
        if ordinal == 0 {
            return;
        }
        if self.variables.len() < ordinal {
            self.variables.resize(ordinal, SqlValue::Null);
        }
        self.variables[ordinal - 1] = value;
    }

    /// Rewinds the machine so the program can replay. Bound parameters are
    /// kept; registers, cursors and aggregate state are not.
    pub fn reset(&mut self) {
        self.pc = 0;
        self.state = VmState::Ready;
        self.registers.clear();
        self.cursors.clear();
        self.row.clear();
        self.agg_slots.clear();
        self.change_count = 0;
        self.halt_code = 0;
        self.fault = None;
    }

    /// Releases every cursor and register. The machine is finished.
    pub fn finalize(&mut self) {
        self.cursors.clear();
        self.registers.clear();
        self.agg_slots.clear();
        self.row.clear();
        self.state = VmState::Halt;
    }

    /// Runs to completion, discarding any published rows. For statements
    /// executed for their side effects.
    pub fn run(&mut self, pager: &mut dyn PageStore) -> Result<(), Error> {
        while self.step(pager)? != VmState::Halt {}
        Ok(())
    }

    /// Executes one instruction and returns the machine state after it.
    pub fn step(&mut self, pager: &mut dyn PageStore) -> Result<VmState, Error> {
        if let Some(msg) = &self.fault {
            return Err(Error::Fault(msg.clone()));
        }
        match self.state {
            VmState::Halt => return Ok(VmState::Halt),
            VmState::RowReady => {
                self.row.clear();
                self.state = VmState::Run;
            }
            VmState::Init | VmState::Ready => self.state = VmState::Run,
            VmState::Run => {}
        }
        if self.pc >= self.program.len() {
            self.state = VmState::Halt;
            return Ok(VmState::Halt);
        }
        match self.exec_one(pager) {
            Ok(()) => Ok(self.state),
            Err(e) => {
                self.state = VmState::Halt;
                self.fault = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn reg(&self, i: i32) -> Result<SqlValue, Error> {
        if !(0..MAX_REGISTERS).contains(&i) {
            return Err(Error::OutOfRegisters(i));
        }
        Ok(self
            .registers
            .get(i as usize)
            .cloned()
            .unwrap_or(SqlValue::Null))
    }

    fn set_reg(&mut self, i: i32, v: SqlValue) -> Result<(), Error> {
        if !(0..MAX_REGISTERS).contains(&i) {
            return Err(Error::OutOfRegisters(i));
        }
        let i = i as usize;
        if self.registers.len() <= i {
            self.registers.resize(i + 1, SqlValue::Null);
        }
        self.registers[i] = v;
        Ok(())
    }

    fn reg_slice(&self, start: i32, count: i32) -> Result<Vec<SqlValue>, Error> {
        (start..start + count.max(0)).map(|i| self.reg(i)).collect()
    }

    fn jump(&self, target: i32) -> Result<usize, Error> {
        if target < 0 || target as usize > self.program.len() {
            return Err(Error::InvalidJump(target));
        }
        Ok(target as usize)
    }

    fn cursor_mut(&mut self, id: i32) -> Result<&mut VmCursor, Error> {
        let id = id as usize;
        self.cursors
            .get_mut(id)
            .and_then(|slot| slot.as_mut())
            .ok_or(Error::CursorClosed(id))
    }

    /// After a write through `cursor_id`, every other cursor on the same
    /// tree must reseek before its next use, and every row cache on that
    /// tree is stale.
    fn note_tree_write(&mut self, cursor_id: usize) {
        let root = match self.cursors.get(cursor_id).and_then(|s| s.as_ref()) {
            Some(vc) => vc.cursor.root_page(),
            None => return,
        };
        for (i, slot) in self.cursors.iter_mut().enumerate() {
            if let Some(vc) = slot {
                if vc.cursor.root_page() == root {
                    vc.generation += 1;
                    if i != cursor_id {
                        vc.cursor.note_tree_modified();
                    }
                }
            }
        }
    }

    fn exec_one(&mut self, pager: &mut dyn PageStore) -> Result<(), Error> {
        let insn = self.program[self.pc].clone();
        let mut next_pc = self.pc + 1;
        match insn.opcode {
            Opcode::Init => {
                if insn.p2 > 0 {
                    next_pc = self.jump(insn.p2)?;
                }
            }
            Opcode::Goto => next_pc = self.jump(insn.p2)?,
            Opcode::Gosub => {
                self.set_reg(insn.p1, SqlValue::Int(next_pc as i64))?;
                next_pc = self.jump(insn.p2)?;
            }
            Opcode::Return => {
                let target = self.reg(insn.p1)?.as_numeric_int();
                next_pc = self.jump(target as i32)?;
            }
            Opcode::Halt => {
                self.state = VmState::Halt;
                self.halt_code = insn.p1;
                if insn.p1 != 0 {
                    let message = match &insn.p4 {
                        P4::Text(s) => s.clone(),
                        _ => "statement raised an error".to_string(),
                    };
                    return Err(Error::Halted {
                        code: insn.p1,
                        message,
                    });
                }
            }
            Opcode::HaltIfNull => {
                if matches!(self.reg(insn.p3)?, SqlValue::Null) {
                    self.state = VmState::Halt;
                    self.halt_code = insn.p1;
                    if insn.p1 != 0 {
                        let message = match &insn.p4 {
                            P4::Text(s) => s.clone(),
                            _ => "required value was NULL".to_string(),
                        };
                        return Err(Error::Halted {
                            code: insn.p1,
                            message,
                        });
                    }
                }
            }
            Opcode::If => {
                let take = match self.reg(insn.p1)?.truthiness() {
                    Some(t) => t,
                    None => insn.p3 != 0,
                };
                if take {
                    next_pc = self.jump(insn.p2)?;
                }
            }
            Opcode::IfNot => {
                let take = match self.reg(insn.p1)?.truthiness() {
                    Some(t) => !t,
                    None => insn.p3 != 0,
                };
                if take {
                    next_pc = self.jump(insn.p2)?;
                }
            }
            Opcode::IfPos => {
                let v = self.reg(insn.p1)?.as_numeric_int();
                if v > 0 {
                    self.set_reg(insn.p1, SqlValue::Int(v - insn.p3 as i64))?;
                    next_pc = self.jump(insn.p2)?;
                }
            }
            Opcode::IfNotZero => {
                let v = self.reg(insn.p1)?.as_numeric_int();
                if v != 0 {
                    if v > 0 {
                        self.set_reg(insn.p1, SqlValue::Int(v - 1))?;
                    }
                    next_pc = self.jump(insn.p2)?;
                }
            }
            Opcode::Integer => self.set_reg(insn.p2, SqlValue::Int(insn.p1 as i64))?,
            Opcode::Int64 => match &insn.p4 {
                P4::Int64(v) => self.set_reg(insn.p2, SqlValue::Int(*v))?,
                P4::Int(v) => self.set_reg(insn.p2, SqlValue::Int(*v as i64))?,
                _ => return Err(Error::BadP4(insn.opcode)),
            },
            Opcode::Real => match &insn.p4 {
                P4::Real(v) => self.set_reg(insn.p2, SqlValue::Real(*v))?,
                _ => return Err(Error::BadP4(insn.opcode)),
            },
            Opcode::String => match &insn.p4 {
                P4::Text(s) => self.set_reg(insn.p2, SqlValue::Text(s.clone()))?,
                _ => return Err(Error::BadP4(insn.opcode)),
            },
            Opcode::Blob => match &insn.p4 {
                P4::Blob(b) => self.set_reg(insn.p2, SqlValue::Blob(b.clone()))?,
                _ => return Err(Error::BadP4(insn.opcode)),
            },
            Opcode::Null => {
                for i in insn.p2..=insn.p2 + insn.p3.max(0) {
                    self.set_reg(i, SqlValue::Null)?;
                }
            }
            Opcode::Variable => {
                let v = if insn.p1 >= 1 {
                    self.variables
                        .get(insn.p1 as usize - 1)
                        .cloned()
                        .unwrap_or(SqlValue::Null)
                } else {
                    SqlValue::Null
                };
                self.set_reg(insn.p2, v)?;
            }
            Opcode::Copy | Opcode::SCopy => {
                let v = self.reg(insn.p1)?;
                self.set_reg(insn.p2, v)?;
            }
            Opcode::Move => {
                for k in 0..insn.p3.max(1) {
                    let src = insn.p1 + k;
                    let v = self.reg(src)?;
                    self.set_reg(src, SqlValue::Null)?;
                    self.set_reg(insn.p2 + k, v)?;
                }
            }
            Opcode::Add | Opcode::Subtract | Opcode::Multiply | Opcode::Divide
            | Opcode::Remainder => {
                let op = match insn.opcode {
                    Opcode::Add => ArithOp::Add,
                    Opcode::Subtract => ArithOp::Subtract,
                    Opcode::Multiply => ArithOp::Multiply,
                    Opcode::Divide => ArithOp::Divide,
                    _ => ArithOp::Remainder,
                };
                let a = self.reg(insn.p1)?;
                let b = self.reg(insn.p2)?;
                self.set_reg(insn.p3, arithmetic(op, &a, &b))?;
            }
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                use std::cmp::Ordering::*;
                let a = self.reg(insn.p1)?;
                let b = self.reg(insn.p3)?;
                let ord = compare(&a, &b);
                let take = match insn.opcode {
                    Opcode::Eq => ord == Equal,
                    Opcode::Ne => ord != Equal,
                    Opcode::Lt => ord == Less,
                    Opcode::Le => ord != Greater,
                    Opcode::Gt => ord == Greater,
                    _ => ord != Less,
                };
                if take {
                    next_pc = self.jump(insn.p2)?;
                }
            }
            Opcode::OpenRead | Opcode::OpenWrite => {
                let id = insn.p1 as usize;
                if self.cursors.len() <= id {
                    self.cursors.resize_with(id + 1, || None);
                }
                let writable = insn.opcode == Opcode::OpenWrite;
                debug!(
                    "open {} cursor {} on root page {}",
                    if writable { "write" } else { "read" },
                    id,
                    insn.p2
                );
                self.cursors[id] = Some(VmCursor::new(
                    insn.p2 as usize,
                    writable,
                    insn.p3.max(0) as usize,
                ));
            }
            Opcode::Close => {
                let id = insn.p1 as usize;
                if let Some(slot) = self.cursors.get_mut(id) {
                    *slot = None;
                }
            }
            Opcode::Rewind | Opcode::Last => {
                let first = insn.opcode == Opcode::Rewind;
                let on_row = {
                    let vc = self.cursor_mut(insn.p1)?;
                    vc.generation += 1;
                    if first {
                        vc.cursor.move_to_first(pager)?
                    } else {
                        vc.cursor.move_to_last(pager)?
                    }
                };
                if !on_row && insn.p2 > 0 {
                    next_pc = self.jump(insn.p2)?;
                }
            }
            Opcode::Next | Opcode::Prev => {
                let forward = insn.opcode == Opcode::Next;
                let on_row = {
                    let vc = self.cursor_mut(insn.p1)?;
                    vc.generation += 1;
                    if forward {
                        vc.cursor.next(pager)?
                    } else {
                        vc.cursor.prev(pager)?
                    }
                };
                if on_row {
                    next_pc = self.jump(insn.p2)?;
                }
            }
            Opcode::SeekRowid => {
                let k = self.reg(insn.p3)?.as_numeric_int();
                let found = {
                    let vc = self.cursor_mut(insn.p1)?;
                    vc.generation += 1;
                    vc.cursor.seek_rowid(pager, k)? == SeekResult::Found
                };
                if !found {
                    next_pc = self.jump(insn.p2)?;
                }
            }
            Opcode::SeekGE => {
                let k = self.reg(insn.p3)?.as_numeric_int();
                let satisfied = {
                    let vc = self.cursor_mut(insn.p1)?;
                    vc.generation += 1;
                    match vc.cursor.seek_rowid(pager, k)? {
                        SeekResult::Found => true,
                        SeekResult::NotFound => {
                            vc.cursor.state() == CursorState::Valid
                                && vc.cursor.rowid(pager)? >= k
                        }
                    }
                };
                if !satisfied {
                    next_pc = self.jump(insn.p2)?;
                }
            }
            Opcode::SeekLE => {
                let k = self.reg(insn.p3)?.as_numeric_int();
                let satisfied = {
                    let vc = self.cursor_mut(insn.p1)?;
                    vc.generation += 1;
                    match vc.cursor.seek_rowid(pager, k)? {
                        SeekResult::Found => true,
                        SeekResult::NotFound => {
                            if vc.cursor.state() != CursorState::Valid {
                                false
                            } else if vc.cursor.rowid(pager)? <= k {
                                // Landed on the tree's last row, below k.
                                true
                            } else {
                                // Landed on k's successor; back up one row.
                                vc.cursor.prev(pager)?
                            }
                        }
                    }
                };
                if !satisfied {
                    next_pc = self.jump(insn.p2)?;
                }
            }
            Opcode::Column => {
                let col = insn.p2;
                let value = {
                    let vc = self.cursor_mut(insn.p1)?;
                    let payload = vc.payload(pager)?;
                    let mut value = SqlValue::Null;
                    for (idx, item) in record::ValueIterator::new(payload)?.enumerate() {
                        let (st, body) = item?;
                        if idx as i32 == col {
                            value = serial_type::decode(st, body)?;
                            break;
                        }
                    }
                    // Columns past the end of the record read as NULL.
                    value
                };
                self.set_reg(insn.p3, value)?;
            }
            Opcode::Rowid => {
                let rowid = {
                    let vc = self.cursor_mut(insn.p1)?;
                    vc.cursor.rowid(pager)?
                };
                self.set_reg(insn.p2, SqlValue::Int(rowid))?;
            }
            Opcode::ResultRow => {
                self.row = self.reg_slice(insn.p1, insn.p2)?;
                self.state = VmState::RowReady;
            }
            Opcode::NewRowid => {
                let rowid = {
                    let vc = self.cursor_mut(insn.p1)?;
                    vc.generation += 1;
                    if vc.cursor.move_to_last(pager)? {
                        vc.cursor
                            .rowid(pager)?
                            .checked_add(1)
                            .ok_or(Error::NoFreeRowid)?
                    } else {
                        // An empty tree starts at rowid 1.
                        1
                    }
                };
                self.set_reg(insn.p3, SqlValue::Int(rowid))?;
            }
            Opcode::MakeRecord => {
                let values = self.reg_slice(insn.p1, insn.p2)?;
                self.set_reg(insn.p3, SqlValue::Blob(record::encode(&values)))?;
            }
            Opcode::Insert => {
                let record_blob = match self.reg(insn.p2)? {
                    SqlValue::Blob(b) => b,
                    _ => return Err(Error::NotARecord(insn.p2)),
                };
                let rowid = self.reg(insn.p3)?.as_numeric_int();
                {
                    let vc = self.cursor_mut(insn.p1)?;
                    if !vc.writable {
                        return Err(Error::CursorNotWritable(insn.p1 as usize));
                    }
                    vc.cursor.insert(pager, rowid, &record_blob)?;
                }
                self.change_count += 1;
                self.note_tree_write(insn.p1 as usize);
            }
            Opcode::Delete => {
                {
                    let vc = self.cursor_mut(insn.p1)?;
                    if !vc.writable {
                        return Err(Error::CursorNotWritable(insn.p1 as usize));
                    }
                    vc.cursor.delete(pager)?;
                }
                self.change_count += 1;
                self.note_tree_write(insn.p1 as usize);
            }
            Opcode::Function => {
                let name = match &insn.p4 {
                    P4::Text(s) => s,
                    _ => return Err(Error::BadP4(insn.opcode)),
                };
                let f = func::lookup_scalar(name)?;
                let args = self.reg_slice(insn.p2, insn.p5 as i32)?;
                let result = f(&args)?;
                self.set_reg(insn.p3, result)?;
            }
            Opcode::AggStep => {
                let name = match &insn.p4 {
                    P4::Text(s) => s,
                    _ => return Err(Error::BadP4(insn.opcode)),
                };
                let agg = func::lookup_aggregate(name)?;
                let args = self.reg_slice(insn.p2, insn.p5 as i32)?;
                self.agg_slots
                    .entry(insn.p3)
                    .or_insert_with(|| func::Accumulator::new(agg))
                    .step(&args);
            }
            Opcode::AggFinal => {
                let value = match self.agg_slots.remove(&insn.p3) {
                    Some(acc) => acc.finalize(),
                    // The loop never ran: finalize an empty accumulator if
                    // the instruction names the aggregate, else NULL.
                    None => match &insn.p4 {
                        P4::Text(name) => {
                            func::Accumulator::new(func::lookup_aggregate(name)?).finalize()
                        }
                        _ => SqlValue::Null,
                    },
                };
                self.set_reg(insn.p2, value)?;
            }
        }
        self.pc = next_pc;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::MemPager;

    fn op(opcode: Opcode, p1: i32, p2: i32, p3: i32) -> Insn {
        Insn::new(opcode, p1, p2, p3)
    }

    fn run_rows(vm: &mut Vm, pager: &mut dyn PageStore) -> Vec<Vec<SqlValue>> {
        let mut rows = vec![];
        loop {
            match vm.step(pager).expect("program should not fail") {
                VmState::RowReady => rows.push(vm.row().to_vec()),
                VmState::Halt => return rows,
                _ => {}
            }
        }
    }

    #[test]
    fn test_arithmetic_program() {
        let mut pager = MemPager::new(512).unwrap();
        let mut vm = Vm::new(vec![
            op(Opcode::Integer, 7, 1, 0),
            op(Opcode::Integer, 5, 2, 0),
            op(Opcode::Add, 1, 2, 3),
            op(Opcode::ResultRow, 3, 1, 0),
            op(Opcode::Halt, 0, 0, 0),
        ]);
        let rows = run_rows(&mut vm, &mut pager);
        assert_eq!(rows, vec![vec![SqlValue::Int(12)]]);
        assert_eq!(vm.state(), VmState::Halt);
        assert_eq!(vm.halt_code(), 0);
    }

    #[test]
    fn test_comparison_loop() {
        // Counts r1 down from 3, publishing each value.
        let mut pager = MemPager::new(512).unwrap();
        let mut vm = Vm::new(vec![
            op(Opcode::Integer, 3, 1, 0),    // 0: r1 = 3
            op(Opcode::ResultRow, 1, 1, 0),  // 1: publish r1
            op(Opcode::IfPos, 1, 1, 1),      // 2: r1 -= 1, loop while positive
            op(Opcode::Halt, 0, 0, 0),       // 3
        ]);
        let rows = run_rows(&mut vm, &mut pager);
        let got: Vec<i64> = rows
            .iter()
            .map(|r| *r[0].as_int().expect("int row"))
            .collect();
        assert_eq!(got, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_gosub_return() {
        let mut pager = MemPager::new(512).unwrap();
        let mut vm = Vm::new(vec![
            op(Opcode::Gosub, 10, 3, 0),    // 0: call subroutine at 3
            op(Opcode::ResultRow, 1, 1, 0), // 1: publish what it computed
            op(Opcode::Halt, 0, 0, 0),      // 2
            op(Opcode::Integer, 42, 1, 0),  // 3: the subroutine
            op(Opcode::Return, 10, 0, 0),   // 4
        ]);
        let rows = run_rows(&mut vm, &mut pager);
        assert_eq!(rows, vec![vec![SqlValue::Int(42)]]);
    }

    #[test]
    fn test_halt_with_error_latches() {
        let mut pager = MemPager::new(512).unwrap();
        let mut vm = Vm::new(vec![op(Opcode::Halt, 1, 0, 0)
            .with_p4(P4::Text("constraint failed".to_string()))]);
        let err = vm.step(&mut pager).unwrap_err();
        assert!(matches!(err, Error::Halted { code: 1, .. }));
        // The fault latches: stepping again reports the same failure.
        let err2 = vm.step(&mut pager).unwrap_err();
        assert_eq!(err2.to_string(), err.to_string());
        // Reset clears it.
        vm.reset();
        assert!(vm.step(&mut pager).is_err()); // program still halts with an error
    }

    #[test]
    fn test_move_copy_null() {
        let mut pager = MemPager::new(512).unwrap();
        let mut vm = Vm::new(vec![
            op(Opcode::Integer, 11, 1, 0),
            op(Opcode::Integer, 22, 2, 0),
            op(Opcode::Move, 1, 4, 2),      // r4, r5 = r1, r2; r1, r2 = NULL
            op(Opcode::Copy, 4, 6, 0),      // r6 = r4
            op(Opcode::Null, 0, 7, 1),      // r7, r8 = NULL
            op(Opcode::ResultRow, 1, 8, 0), // r1..r8
            op(Opcode::Halt, 0, 0, 0),
        ]);
        let rows = run_rows(&mut vm, &mut pager);
        use SqlValue::*;
        assert_eq!(
            rows[0],
            vec![Null, Null, Null, Int(11), Int(22), Int(11), Null, Null]
        );
    }

    #[test]
    fn test_variable_binding() {
        let mut pager = MemPager::new(512).unwrap();
        let mut vm = Vm::new(vec![
            op(Opcode::Variable, 1, 1, 0),
            op(Opcode::Variable, 2, 2, 0),
            op(Opcode::ResultRow, 1, 2, 0),
            op(Opcode::Halt, 0, 0, 0),
        ]);
        vm.bind(1, SqlValue::Text("bound".to_string()));
        let rows = run_rows(&mut vm, &mut pager);
        assert_eq!(
            rows[0],
            vec![SqlValue::Text("bound".to_string()), SqlValue::Null]
        );
    }

    #[test]
    fn test_register_bounds() {
        let mut pager = MemPager::new(512).unwrap();
        let mut vm = Vm::new(vec![op(Opcode::Integer, 1, MAX_REGISTERS + 5, 0)]);
        assert!(matches!(
            vm.step(&mut pager),
            Err(Error::OutOfRegisters(_))
        ));
    }

    #[test]
    fn test_function_dispatch_errors() {
        let mut pager = MemPager::new(512).unwrap();
        let mut vm = Vm::new(vec![op(Opcode::Function, 0, 1, 2)
            .with_p4(P4::Text("nonesuch".to_string()))
            .with_p5(1)]);
        assert!(matches!(
            vm.step(&mut pager),
            Err(Error::Func(func::Error::UnknownFunction(_)))
        ));

        // Calling an aggregate through Function is a misuse.
        let mut vm = Vm::new(vec![op(Opcode::Function, 0, 1, 2)
            .with_p4(P4::Text("count".to_string()))
            .with_p5(1)]);
        assert!(matches!(
            vm.step(&mut pager),
            Err(Error::Func(func::Error::AggregateMisuse(_)))
        ));
    }

    #[test]
    fn test_cursor_not_writable() {
        let mut pager = MemPager::new(512).unwrap();
        let root = crate::btree::cursor::create_table_tree(&mut pager).unwrap() as i32;
        let mut vm = Vm::new(vec![
            op(Opcode::OpenRead, 0, root, 1),
            op(Opcode::Integer, 1, 2, 0),
            op(Opcode::MakeRecord, 2, 1, 3),
            op(Opcode::Insert, 0, 3, 2),
            op(Opcode::Halt, 0, 0, 0),
        ]);
        let mut last = Ok(VmState::Init);
        for _ in 0..4 {
            last = vm.step(&mut pager);
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(Error::CursorNotWritable(0))));
    }
}
