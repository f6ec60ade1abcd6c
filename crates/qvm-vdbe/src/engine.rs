//! The executable VM: register file, cursor table and the step loop.
//!
//! A [`Vdbe`] is produced by [`ProgramBuilder::make_ready`](crate::ProgramBuilder::make_ready)
//! and executes one instruction per [`step`](Vdbe::step). Execution errors
//! halt the VM and are kept, so every later step reports the same error.
//! A busy signal from storage is not an error: the step returns
//! [`StepResult::Busy`], nothing changes, and the same step can be retried.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;

use qvm_error::{ErrorCode, Result, VdbeError};
use qvm_storage::{SeekOp, TreeKind};
use qvm_types::coerce::{
    Numeric, apply_affinity, blob_value, exact_integer, exact_numeric, int_value, real_value,
    text_value, truthy,
};
use qvm_types::opcode::{Opcode, P4, VdbeOp};
use qvm_types::record::{parse_record, record_column, serialize_record};
use qvm_types::{Affinity, Value, ValueType};
use tracing::{debug, trace, warn};

use crate::arith::{
    ArithOp, BitOp, CmpOp, arith, bit_not, bitwise, compare_jumps, concat, logical_and,
    logical_not, logical_or,
};
use crate::config::VdbeConfig;
use crate::connection::Connection;
use crate::cursor::CursorTable;
use crate::program::Program;
use crate::{VdbeState, next_instance_id};

static NULL: Value = Value::Null;

/// Outcome of one successful [`Vdbe::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepResult {
    /// A `ResultRow` executed; read it with the `column_*` accessors.
    Row,
    /// An instruction executed without producing output.
    Continue,
    /// The program halted cleanly.
    Done,
    /// Storage is locked by another owner. Nothing changed; retry the step.
    Busy,
}

impl StepResult {
    /// Status code shared with the storage engine.
    pub const fn code(self) -> ErrorCode {
        match self {
            Self::Row => ErrorCode::Row,
            Self::Continue => ErrorCode::Ok,
            Self::Done => ErrorCode::Done,
            Self::Busy => ErrorCode::Busy,
        }
    }
}

/// Control effect of one instruction.
enum Flow {
    Next,
    Jump(usize),
    Row,
    Halt,
}

/// An executable program with its register file and cursor table.
#[derive(Debug)]
pub struct Vdbe {
    id: u64,
    conn: Connection,
    config: VdbeConfig,
    program: Arc<Program>,
    /// Index 0 is never addressable.
    registers: Vec<Value>,
    cursors: CursorTable,
    state: VdbeState,
    pc: usize,
    once: Vec<bool>,
    bindings: Vec<Value>,
    row: Option<Range<usize>>,
    last_cmp: Option<Ordering>,
    halt_error: Option<VdbeError>,
    steps: u64,
}

impl Vdbe {
    pub(crate) fn new(
        conn: Connection,
        config: VdbeConfig,
        program: Program,
        register_count: usize,
        cursor_count: usize,
    ) -> Self {
        let len = program.len();
        Self {
            id: next_instance_id(),
            conn,
            config,
            program: Arc::new(program),
            registers: vec![Value::Null; register_count + 1],
            cursors: CursorTable::new(cursor_count),
            state: VdbeState::Ready,
            pc: 0,
            once: vec![false; len],
            bindings: Vec::new(),
            row: None,
            last_cmp: None,
            halt_error: None,
            steps: 0,
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub const fn state(&self) -> VdbeState {
        self.state
    }

    /// Address of the next instruction to execute.
    pub const fn pc(&self) -> usize {
        self.pc
    }

    /// Instructions executed since the last reset.
    pub const fn steps(&self) -> u64 {
        self.steps
    }

    pub fn op_count(&self) -> usize {
        self.program.len()
    }

    pub fn register_count(&self) -> usize {
        self.registers.len() - 1
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn open_cursor_count(&self) -> usize {
        self.cursors.open_count()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn explain(&self) -> String {
        self.program.explain()
    }

    pub fn config(&self) -> &VdbeConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The error that halted the VM, if any.
    pub fn error(&self) -> Option<&VdbeError> {
        self.halt_error.as_ref()
    }

    // ── Register access ─────────────────────────────────────────────────

    #[allow(clippy::cast_sign_loss)]
    fn reg_index(&self, reg: i32) -> Result<usize> {
        let max = self.register_count();
        if reg < 1 || reg as usize > max {
            return Err(VdbeError::RegisterOutOfBounds {
                index: i64::from(reg),
                max,
            });
        }
        Ok(reg as usize)
    }

    fn reg(&self, reg: i32) -> Result<&Value> {
        let i = self.reg_index(reg)?;
        Ok(&self.registers[i])
    }

    fn set_reg(&mut self, reg: i32, value: Value) -> Result<()> {
        let i = self.reg_index(reg)?;
        self.registers[i] = value;
        Ok(())
    }

    /// Bounds of `count` registers starting at `start`; empty for a
    /// non-positive count.
    fn reg_range(&self, start: i32, count: i32) -> Result<Range<usize>> {
        if count <= 0 {
            return Ok(0..0);
        }
        let first = self.reg_index(start)?;
        let last = self.reg_index(start.saturating_add(count - 1))?;
        Ok(first..last + 1)
    }

    fn reg_slice(&self, start: i32, count: i32) -> Result<&[Value]> {
        let range = self.reg_range(start, count)?;
        Ok(&self.registers[range])
    }

    /// The register's value, or `None` outside `1..=register_count`.
    pub fn register(&self, reg: i32) -> Option<&Value> {
        self.reg(reg).ok()
    }

    pub fn set_value(&mut self, reg: i32, value: impl Into<Value>) -> Result<()> {
        self.set_reg(reg, value.into())
    }

    pub fn set_int(&mut self, reg: i32, value: i64) -> Result<()> {
        self.set_reg(reg, Value::Integer(value))
    }

    /// Integer value of a register, coerced; 0 when out of range.
    pub fn get_int(&self, reg: i32) -> i64 {
        self.register(reg).map_or(0, int_value)
    }

    pub fn set_double(&mut self, reg: i32, value: f64) -> Result<()> {
        self.set_reg(reg, Value::Real(value))
    }

    /// Real value of a register, coerced; 0.0 when out of range.
    pub fn get_double(&self, reg: i32) -> f64 {
        self.register(reg).map_or(0.0, real_value)
    }

    pub fn set_null(&mut self, reg: i32) -> Result<()> {
        self.set_reg(reg, Value::Null)
    }

    /// Whether a register holds NULL; true when out of range.
    pub fn is_null(&self, reg: i32) -> bool {
        self.register(reg).is_none_or(Value::is_null)
    }

    pub fn set_text(&mut self, reg: i32, value: impl Into<String>) -> Result<()> {
        self.set_reg(reg, Value::Text(value.into()))
    }

    pub fn set_blob(&mut self, reg: i32, value: impl Into<Vec<u8>>) -> Result<()> {
        self.set_reg(reg, Value::Blob(value.into()))
    }

    // ── Parameters ──────────────────────────────────────────────────────

    /// Bind parameter `index` (1-based), read by the `Variable` opcode.
    pub fn bind(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        if index == 0 || index > usize::from(self.config.max_variables) {
            return Err(VdbeError::Range {
                what: "parameter index",
                value: i64::try_from(index).unwrap_or(i64::MAX),
            });
        }
        if self.bindings.len() < index {
            self.bindings.resize(index, Value::Null);
        }
        self.bindings[index - 1] = value.into();
        Ok(())
    }

    pub fn clear_bindings(&mut self) {
        self.bindings.clear();
    }

    // ── Result row ──────────────────────────────────────────────────────

    /// Columns of the current row; empty unless the last step was a row.
    pub fn row(&self) -> &[Value] {
        match &self.row {
            Some(range) => &self.registers[range.clone()],
            None => &[],
        }
    }

    pub fn column_count(&self) -> usize {
        self.row.as_ref().map_or(0, ExactSizeIterator::len)
    }

    /// Column `i` of the current row; NULL when out of range.
    pub fn column_value(&self, i: usize) -> &Value {
        self.row().get(i).unwrap_or(&NULL)
    }

    /// Column as a 32-bit integer, keeping the low 32 bits.
    #[allow(clippy::cast_possible_truncation)]
    pub fn column_int(&self, i: usize) -> i32 {
        int_value(self.column_value(i)) as i32
    }

    pub fn column_int64(&self, i: usize) -> i64 {
        int_value(self.column_value(i))
    }

    pub fn column_double(&self, i: usize) -> f64 {
        real_value(self.column_value(i))
    }

    pub fn column_text(&self, i: usize) -> Option<String> {
        text_value(self.column_value(i)).map(Cow::into_owned)
    }

    pub fn column_blob(&self, i: usize) -> Option<Vec<u8>> {
        blob_value(self.column_value(i)).map(Cow::into_owned)
    }

    pub fn column_type(&self, i: usize) -> ValueType {
        self.column_value(i).value_type()
    }

    // ── Execution ───────────────────────────────────────────────────────

    /// Execute one instruction.
    ///
    /// Once halted, returns `Ok(Done)` after a clean halt and the halting
    /// error after a failed one.
    pub fn step(&mut self) -> Result<StepResult> {
        match self.state {
            VdbeState::Halted => {
                return match &self.halt_error {
                    Some(err) => Err(err.clone()),
                    None => Ok(StepResult::Done),
                };
            }
            VdbeState::Ready | VdbeState::Init => self.state = VdbeState::Running,
            VdbeState::Running => {}
        }
        self.row = None;

        let program = Arc::clone(&self.program);
        if self.pc >= program.len() {
            self.halt();
            return Ok(StepResult::Done);
        }
        if let Some(max) = self.config.max_steps {
            if self.steps >= max {
                return Err(self.fail(VdbeError::Interrupt { steps: self.steps }));
            }
        }

        let pc = self.pc;
        match self.exec(&program, pc) {
            Ok(Flow::Next) => self.pc = pc + 1,
            Ok(Flow::Jump(target)) => self.pc = target,
            Ok(Flow::Row) => {
                self.pc = pc + 1;
                self.steps += 1;
                return Ok(StepResult::Row);
            }
            Ok(Flow::Halt) => {
                self.steps += 1;
                self.halt();
                return Ok(StepResult::Done);
            }
            Err(VdbeError::Busy) => {
                debug!(vm = self.id, pc, "storage busy, step can be retried");
                return Ok(StepResult::Busy);
            }
            Err(err) => return Err(self.fail(err)),
        }
        self.steps += 1;

        if self.pc >= program.len() {
            self.halt();
            return Ok(StepResult::Done);
        }
        Ok(StepResult::Continue)
    }

    /// Step until a row is produced, the program halts, or storage is busy.
    pub fn step_row(&mut self) -> Result<StepResult> {
        loop {
            match self.step()? {
                StepResult::Continue => {}
                other => return Ok(other),
            }
        }
    }

    /// Run to completion and collect every row. Busy storage is reported
    /// as [`VdbeError::Busy`] with the VM left resumable.
    pub fn collect_rows(&mut self) -> Result<Vec<Vec<Value>>> {
        let mut rows = Vec::new();
        loop {
            match self.step_row()? {
                StepResult::Row => rows.push(self.row().to_vec()),
                StepResult::Done => return Ok(rows),
                StepResult::Busy => return Err(VdbeError::Busy),
                StepResult::Continue => {}
            }
        }
    }

    /// Return to `Ready`: registers are nulled, cursors closed, locks
    /// released, and any stored error cleared. Bindings are kept.
    pub fn reset(&mut self) {
        self.release_resources();
        self.registers.fill(Value::Null);
        self.once.fill(false);
        self.state = VdbeState::Ready;
        self.pc = 0;
        self.row = None;
        self.last_cmp = None;
        self.halt_error = None;
        self.steps = 0;
    }

    /// Release every resource. Returns the error that halted the VM, if any.
    pub fn finalize(mut self) -> Result<()> {
        self.release_resources();
        match self.halt_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn release_resources(&mut self) {
        self.cursors.close_all();
        self.conn.engine().release(self.id);
    }

    fn halt(&mut self) {
        debug!(vm = self.id, pc = self.pc, steps = self.steps, "vdbe halted");
        self.release_resources();
        self.row = None;
        self.state = VdbeState::Halted;
    }

    fn fail(&mut self, err: VdbeError) -> VdbeError {
        warn!(
            vm = self.id,
            pc = self.pc,
            code = %err.error_code(),
            error = %err,
            "vdbe halted with error"
        );
        self.release_resources();
        self.row = None;
        self.halt_error = Some(err.clone());
        self.state = VdbeState::Halted;
        err
    }

    fn jump(&self, addr: i32) -> Result<Flow> {
        self.jump_to(i64::from(addr))
    }

    fn jump_to(&self, addr: i64) -> Result<Flow> {
        usize::try_from(addr)
            .map(Flow::Jump)
            .map_err(|_| VdbeError::InvalidAddress {
                addr,
                len: self.program.len(),
            })
    }

    fn branch(&self, taken: bool, addr: i32) -> Result<Flow> {
        if taken { self.jump(addr) } else { Ok(Flow::Next) }
    }

    /// Execute the instruction at `pc`. On error nothing observable has
    /// changed for this instruction.
    #[allow(
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss
    )]
    fn exec(&mut self, program: &Program, pc: usize) -> Result<Flow> {
        use Opcode as O;

        let op = &program.ops()[pc];
        if self.config.trace_ops {
            trace!(
                vm = self.id,
                pc,
                opcode = %op.opcode,
                p1 = op.p1,
                p2 = op.p2,
                p3 = op.p3,
                "exec"
            );
        }

        let flow = match op.opcode {
            // ── Control Flow ────────────────────────────────────────────
            O::Init | O::Goto => self.jump(op.p2)?,
            O::Noop => Flow::Next,

            O::Gosub => {
                let flow = self.jump(op.p2)?;
                self.set_reg(op.p1, Value::Integer(pc as i64))?;
                flow
            }
            O::Return => {
                let from = int_value(self.reg(op.p1)?);
                self.jump_to(from.saturating_add(1))?
            }

            O::InitCoroutine => {
                let flow = self.branch(op.p2 != 0, op.p2)?;
                self.set_reg(op.p1, Value::Integer(i64::from(op.p3) - 1))?;
                flow
            }
            O::Yield => {
                let resume = int_value(self.reg(op.p1)?);
                let flow = self.jump_to(resume.saturating_add(1))?;
                self.set_reg(op.p1, Value::Integer(pc as i64))?;
                flow
            }
            O::EndCoroutine => {
                let caller = int_value(self.reg(op.p1)?);
                let yield_op = usize::try_from(caller)
                    .ok()
                    .and_then(|addr| program.get(addr))
                    .filter(|o| o.opcode == O::Yield)
                    .ok_or_else(|| {
                        VdbeError::misuse(format!(
                            "EndCoroutine: register {} does not hold a Yield address",
                            op.p1
                        ))
                    })?;
                let flow = self.jump(yield_op.p2)?;
                self.set_reg(op.p1, Value::Null)?;
                flow
            }

            O::Halt => {
                if op.p1 == 0 {
                    Flow::Halt
                } else {
                    return Err(halt_error(op));
                }
            }
            O::HaltIfNull => {
                if !self.reg(op.p3)?.is_null() {
                    Flow::Next
                } else if op.p1 == 0 {
                    Flow::Halt
                } else {
                    return Err(halt_error(op));
                }
            }

            O::If | O::IfNot => {
                let taken = match truthy(self.reg(op.p1)?) {
                    Some(b) => b == (op.opcode == O::If),
                    None => op.p3 != 0,
                };
                self.branch(taken, op.p2)?
            }
            O::IsNull => {
                let taken = self.reg(op.p1)?.is_null();
                self.branch(taken, op.p2)?
            }
            O::NotNull => {
                let taken = !self.reg(op.p1)?.is_null();
                self.branch(taken, op.p2)?
            }
            O::Once => {
                if self.once[pc] {
                    self.jump(op.p2)?
                } else {
                    self.once[pc] = true;
                    Flow::Next
                }
            }

            O::Eq | O::Ne | O::Lt | O::Le | O::Gt | O::Ge => {
                let cmp = match op.opcode {
                    O::Eq => CmpOp::Eq,
                    O::Ne => CmpOp::Ne,
                    O::Lt => CmpOp::Lt,
                    O::Le => CmpOp::Le,
                    O::Gt => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                let taken = compare_jumps(cmp, self.reg(op.p3)?, self.reg(op.p1)?, op.p5);
                self.branch(taken, op.p2)?
            }
            O::Compare => {
                let lhs = self.reg_slice(op.p1, op.p3)?;
                let rhs = self.reg_slice(op.p2, op.p3)?;
                let ord = lhs
                    .iter()
                    .zip(rhs)
                    .map(|(a, b)| a.total_cmp(b))
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal);
                self.last_cmp = Some(ord);
                Flow::Next
            }
            O::Jump => {
                let ord = self
                    .last_cmp
                    .ok_or_else(|| VdbeError::misuse("Jump without a preceding Compare"))?;
                match ord {
                    Ordering::Less => self.jump(op.p1)?,
                    Ordering::Equal => self.jump(op.p2)?,
                    Ordering::Greater => self.jump(op.p3)?,
                }
            }

            O::IfPos => {
                let v = int_value(self.reg(op.p1)?);
                if v > 0 {
                    let flow = self.jump(op.p2)?;
                    self.set_reg(op.p1, Value::Integer(v.saturating_sub(i64::from(op.p3))))?;
                    flow
                } else {
                    Flow::Next
                }
            }
            O::IfNotZero => {
                let v = int_value(self.reg(op.p1)?);
                if v == 0 {
                    Flow::Next
                } else {
                    let flow = self.jump(op.p2)?;
                    if v > 0 {
                        self.set_reg(op.p1, Value::Integer(v - 1))?;
                    }
                    flow
                }
            }
            O::DecrJumpZero => {
                let v = int_value(self.reg(op.p1)?).saturating_sub(1);
                let flow = self.branch(v == 0, op.p2)?;
                self.set_reg(op.p1, Value::Integer(v))?;
                flow
            }
            O::MustBeInt => {
                let v = self.reg(op.p1)?;
                match exact_integer(v) {
                    Some(i) => {
                        self.set_reg(op.p1, Value::Integer(i))?;
                        Flow::Next
                    }
                    None if op.p2 != 0 => self.jump(op.p2)?,
                    None => return Err(mismatch("integer", v)),
                }
            }

            // ── Constants ───────────────────────────────────────────────
            O::Integer => {
                self.set_reg(op.p2, Value::Integer(i64::from(op.p1)))?;
                Flow::Next
            }
            O::Int64 => {
                let v = match op.p4 {
                    P4::Int64(v) => v,
                    P4::Int(v) => i64::from(v),
                    _ => 0,
                };
                self.set_reg(op.p2, Value::Integer(v))?;
                Flow::Next
            }
            O::Real => {
                let v = match op.p4 {
                    P4::Real(v) => v,
                    _ => 0.0,
                };
                self.set_reg(op.p2, Value::from_real_result(v))?;
                Flow::Next
            }
            O::String8 => {
                let v = match &op.p4 {
                    P4::Str(s) => s.clone(),
                    _ => String::new(),
                };
                self.set_reg(op.p2, Value::Text(v))?;
                Flow::Next
            }
            O::Blob => {
                let v = match &op.p4 {
                    P4::Blob(b) => b.clone(),
                    _ => Vec::new(),
                };
                self.set_reg(op.p2, Value::Blob(v))?;
                Flow::Next
            }
            O::Null => {
                let count = op.p3.max(op.p2).saturating_sub(op.p2).saturating_add(1);
                let range = self.reg_range(op.p2, count)?;
                self.registers[range].fill(Value::Null);
                Flow::Next
            }
            O::SoftNull => {
                self.set_reg(op.p1, Value::Null)?;
                Flow::Next
            }
            O::Variable => {
                let index = usize::try_from(op.p1)
                    .ok()
                    .filter(|&i| i >= 1)
                    .ok_or(VdbeError::Range {
                        what: "parameter index",
                        value: i64::from(op.p1),
                    })?;
                let v = self.bindings.get(index - 1).cloned().unwrap_or_default();
                self.set_reg(op.p2, v)?;
                Flow::Next
            }

            // ── Register Moves ──────────────────────────────────────────
            O::Move => {
                let src = self.reg_range(op.p1, op.p3)?;
                let dst = self.reg_range(op.p2, op.p3)?;
                let mut pairs: Vec<(usize, usize)> = src.zip(dst).collect();
                if op.p2 > op.p1 {
                    pairs.reverse();
                }
                for (s, d) in pairs {
                    let v = std::mem::take(&mut self.registers[s]);
                    self.registers[d] = v;
                }
                Flow::Next
            }
            O::Copy => {
                let count = op.p3.saturating_add(1);
                let values = self.reg_slice(op.p1, count)?.to_vec();
                let dst = self.reg_range(op.p2, count)?;
                self.registers[dst].clone_from_slice(&values);
                Flow::Next
            }
            O::SCopy => {
                let v = self.reg(op.p1)?.clone();
                self.set_reg(op.p2, v)?;
                Flow::Next
            }
            O::IntCopy => {
                let v = int_value(self.reg(op.p1)?);
                self.set_reg(op.p2, Value::Integer(v))?;
                Flow::Next
            }
            O::ResultRow => {
                self.row = Some(self.reg_range(op.p1, op.p2)?);
                Flow::Row
            }

            // ── Arithmetic & Logic ──────────────────────────────────────
            O::Add | O::Subtract | O::Multiply | O::Divide | O::Remainder => {
                let kind = match op.opcode {
                    O::Add => ArithOp::Add,
                    O::Subtract => ArithOp::Sub,
                    O::Multiply => ArithOp::Mul,
                    O::Divide => ArithOp::Div,
                    _ => ArithOp::Rem,
                };
                let v = arith(kind, self.reg(op.p2)?, self.reg(op.p1)?);
                self.set_reg(op.p3, v)?;
                Flow::Next
            }
            O::Concat => {
                let v = concat(self.reg(op.p2)?, self.reg(op.p1)?);
                self.set_reg(op.p3, v)?;
                Flow::Next
            }
            O::BitAnd | O::BitOr | O::ShiftLeft | O::ShiftRight => {
                let kind = match op.opcode {
                    O::BitAnd => BitOp::And,
                    O::BitOr => BitOp::Or,
                    O::ShiftLeft => BitOp::Shl,
                    _ => BitOp::Shr,
                };
                let v = bitwise(kind, self.reg(op.p2)?, self.reg(op.p1)?);
                self.set_reg(op.p3, v)?;
                Flow::Next
            }
            O::BitNot => {
                let v = bit_not(self.reg(op.p1)?);
                self.set_reg(op.p2, v)?;
                Flow::Next
            }
            O::Not => {
                let v = logical_not(self.reg(op.p1)?);
                self.set_reg(op.p2, v)?;
                Flow::Next
            }
            O::And => {
                let v = logical_and(self.reg(op.p2)?, self.reg(op.p1)?);
                self.set_reg(op.p3, v)?;
                Flow::Next
            }
            O::Or => {
                let v = logical_or(self.reg(op.p2)?, self.reg(op.p1)?);
                self.set_reg(op.p3, v)?;
                Flow::Next
            }
            O::AddImm => {
                let v = int_value(self.reg(op.p1)?).wrapping_add(i64::from(op.p2));
                self.set_reg(op.p1, Value::Integer(v))?;
                Flow::Next
            }
            O::Cast => {
                let affinity = u8::try_from(op.p2)
                    .ok()
                    .and_then(Affinity::from_byte)
                    .ok_or_else(|| VdbeError::misuse(format!("Cast: unknown affinity {}", op.p2)))?;
                let i = self.reg_index(op.p1)?;
                let v = std::mem::take(&mut self.registers[i]);
                self.registers[i] = apply_affinity(v, affinity);
                Flow::Next
            }
            O::RealAffinity => {
                let i = self.reg_index(op.p1)?;
                if let Value::Integer(n) = self.registers[i] {
                    self.registers[i] = Value::Real(n as f64);
                }
                Flow::Next
            }
            O::IsTrue => {
                let truth = truthy(self.reg(op.p1)?).unwrap_or(op.p3 != 0);
                let invert = matches!(op.p4, P4::Int(n) if n != 0);
                self.set_reg(op.p2, Value::from(truth != invert))?;
                Flow::Next
            }

            // ── Storage ─────────────────────────────────────────────────
            O::Transaction => {
                self.conn.engine().begin(self.id, op.p2 != 0)?;
                Flow::Next
            }
            O::OpenRead | O::OpenWrite => {
                self.cursors.check(op.p1)?;
                let root = u32::try_from(op.p2).map_err(|_| VdbeError::Range {
                    what: "root page",
                    value: i64::from(op.p2),
                })?;
                let cursor =
                    self.conn
                        .engine()
                        .open_cursor(self.id, root, op.opcode == O::OpenWrite)?;
                self.cursors.open(op.p1, cursor)?;
                Flow::Next
            }
            O::OpenEphemeral => {
                self.cursors.check(op.p1)?;
                let kind = match op.p4 {
                    P4::KeyInfo(_) => TreeKind::Index,
                    _ => TreeKind::Table,
                };
                let cursor = self.conn.engine().open_ephemeral(kind)?;
                self.cursors.open(op.p1, cursor)?;
                Flow::Next
            }
            O::Close => {
                self.cursors.close(op.p1)?;
                Flow::Next
            }
            O::IfNotOpen => {
                let open = self.cursors.is_open(op.p1)?;
                self.branch(!open, op.p2)?
            }

            // Cursor moves cannot be undone, so the branch target is
            // resolved before the cursor is touched.
            O::Rewind | O::Last => {
                let target = self.jump(op.p2)?;
                let slot = self.cursors.get_mut(op.p1)?;
                slot.null_row = false;
                let any = if op.opcode == O::Rewind {
                    slot.cursor.first()?
                } else {
                    slot.cursor.last()?
                };
                if any { Flow::Next } else { target }
            }
            O::Next | O::Prev => {
                let target = self.jump(op.p2)?;
                let slot = self.cursors.get_mut(op.p1)?;
                slot.null_row = false;
                let more = if op.opcode == O::Next {
                    slot.cursor.next()?
                } else {
                    slot.cursor.prev()?
                };
                if more { target } else { Flow::Next }
            }

            O::SeekRowid | O::NotExists => {
                let key = self.reg(op.p3)?;
                let rowid = if op.opcode == O::SeekRowid {
                    exact_integer(key)
                } else {
                    Some(int_value(key))
                };
                let target = self.jump(op.p2)?;
                let slot = self.cursors.get_mut(op.p1)?;
                slot.null_row = false;
                let found = match rowid {
                    Some(r) => slot.cursor.seek_rowid(r)?.is_found(),
                    None => false,
                };
                if found { Flow::Next } else { target }
            }
            O::SeekGE | O::SeekGT | O::SeekLE | O::SeekLT => {
                let seek = match op.opcode {
                    O::SeekGE => SeekOp::Ge,
                    O::SeekGT => SeekOp::Gt,
                    O::SeekLE => SeekOp::Le,
                    _ => SeekOp::Lt,
                };
                let count = match op.p4 {
                    P4::Int(n) if n > 0 => n,
                    _ => 1,
                };
                let key = self.reg_slice(op.p3, count)?.to_vec();
                let target = self.jump(op.p2)?;
                let slot = self.cursors.get_mut(op.p1)?;
                slot.null_row = false;
                let hit = match slot.cursor.kind() {
                    TreeKind::Index => slot.cursor.seek_key(&key, seek)?,
                    TreeKind::Table => match table_seek(&key, seek) {
                        TableSeek::Rowid(rowid, seek) => {
                            slot.cursor.seek_key(&[Value::Integer(rowid)], seek)?
                        }
                        TableSeek::Last => slot.cursor.last()?,
                        TableSeek::Miss => false,
                    },
                };
                if hit { Flow::Next } else { target }
            }
            O::Found | O::NotFound => {
                let key = match op.p4 {
                    P4::Int(n) if n > 0 => self.reg_slice(op.p3, n)?.to_vec(),
                    _ => match self.reg(op.p3)? {
                        Value::Blob(rec) => parse_record(rec)?,
                        other => vec![other.clone()],
                    },
                };
                let target = self.jump(op.p2)?;
                let slot = self.cursors.get_mut(op.p1)?;
                slot.null_row = false;
                let found = slot.cursor.find_key(&key)?;
                if found == (op.opcode == O::Found) { target } else { Flow::Next }
            }

            O::Column => {
                let column = usize::try_from(op.p2).map_err(|_| VdbeError::Range {
                    what: "column index",
                    value: i64::from(op.p2),
                })?;
                self.reg_index(op.p3)?;
                let slot = self.cursors.get(op.p1)?;
                let v = if slot.null_row {
                    Value::Null
                } else {
                    match slot.cursor.payload()? {
                        None => Value::Null,
                        Some(rec) => {
                            record_column(&rec, column)?.unwrap_or_else(|| p4_value(&op.p4))
                        }
                    }
                };
                self.set_reg(op.p3, v)?;
                Flow::Next
            }
            O::Rowid | O::IdxRowid => {
                self.reg_index(op.p2)?;
                let slot = self.cursors.get(op.p1)?;
                let rowid = if slot.null_row {
                    None
                } else if op.opcode == O::Rowid && slot.cursor.kind() == TreeKind::Table {
                    slot.cursor.rowid()?
                } else {
                    index_rowid(slot.cursor.payload()?)?
                };
                self.set_reg(op.p2, rowid.map_or(Value::Null, Value::Integer))?;
                Flow::Next
            }
            O::NullRow => {
                self.cursors.get_mut(op.p1)?.null_row = true;
                Flow::Next
            }
            O::Count => {
                self.reg_index(op.p2)?;
                let n = self.cursors.get(op.p1)?.cursor.count()?;
                self.set_reg(op.p2, Value::Integer(n))?;
                Flow::Next
            }

            O::NewRowid => {
                self.reg_index(op.p2)?;
                let floor = if op.p3 == 0 {
                    None
                } else {
                    Some(int_value(self.reg(op.p3)?))
                };
                let max = self
                    .cursors
                    .get(op.p1)?
                    .cursor
                    .max_rowid()?
                    .unwrap_or(0);
                let last = floor.map_or(max, |f| f.max(max));
                let rowid = last.checked_add(1).ok_or(VdbeError::Full)?;
                if op.p3 != 0 {
                    self.set_reg(op.p3, Value::Integer(rowid))?;
                }
                self.set_reg(op.p2, Value::Integer(rowid))?;
                Flow::Next
            }
            O::Insert => {
                let key = self.reg(op.p3)?;
                let rowid = exact_integer(key).ok_or_else(|| mismatch("integer rowid", key))?;
                let record = blob_value(self.reg(op.p2)?)
                    .map_or_else(|| serialize_record(&[]), Cow::into_owned);
                let slot = self.cursors.get_mut(op.p1)?;
                slot.null_row = false;
                slot.cursor.insert(rowid, &record)?;
                Flow::Next
            }
            O::Delete => {
                self.cursors.get_mut(op.p1)?.cursor.delete()?;
                Flow::Next
            }
            O::MakeRecord => {
                self.reg_index(op.p3)?;
                let mut values = self.reg_slice(op.p1, op.p2)?.to_vec();
                if let P4::Str(affinities) = &op.p4 {
                    for (v, code) in values.iter_mut().zip(affinities.bytes()) {
                        if let Some(affinity) = Affinity::from_byte(code) {
                            *v = apply_affinity(std::mem::take(v), affinity);
                        }
                    }
                }
                self.set_reg(op.p3, Value::Blob(serialize_record(&values)))?;
                Flow::Next
            }
            O::IdxInsert => {
                let record = self.reg(op.p2)?;
                let bytes = match record {
                    Value::Blob(b) => b.clone(),
                    other => return Err(mismatch("record blob", other)),
                };
                self.cursors.get_mut(op.p1)?.cursor.insert_key(&bytes)?;
                Flow::Next
            }
            O::IdxDelete => {
                let key = self.reg_slice(op.p2, op.p3)?.to_vec();
                self.cursors.get_mut(op.p1)?.cursor.delete_key(&key)?;
                Flow::Next
            }
        };
        Ok(flow)
    }
}

impl Drop for Vdbe {
    fn drop(&mut self) {
        self.release_resources();
    }
}

fn halt_error(op: &VdbeOp) -> VdbeError {
    let code = match ErrorCode::from_i32(op.p1) {
        ErrorCode::Ok => ErrorCode::Error,
        code => code,
    };
    let message = match &op.p4 {
        P4::Str(s) => s.clone(),
        _ => code.message().to_owned(),
    };
    VdbeError::halted(code, message)
}

fn mismatch(expected: &str, actual: &Value) -> VdbeError {
    VdbeError::TypeMismatch {
        expected: expected.to_owned(),
        actual: actual.value_type().name().to_owned(),
    }
}

/// How a seek on a rowid table proceeds once its key is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableSeek {
    Rowid(i64, SeekOp),
    /// Non-numeric keys sort after every rowid.
    Last,
    Miss,
}

/// A real key seeks from its truncated integer with the comparison moved
/// to the side the fraction falls on. NULL never matches.
fn table_seek(key: &[Value], seek: SeekOp) -> TableSeek {
    let Some(first) = key.first().filter(|k| !k.is_null()) else {
        return TableSeek::Miss;
    };
    match exact_numeric(first) {
        Some(Numeric::Int(rowid)) => TableSeek::Rowid(rowid, seek),
        Some(Numeric::Real(r)) => {
            let rowid = int_value(&Value::Real(r));
            let seek = match (Value::Integer(rowid).total_cmp(&Value::Real(r)), seek) {
                (Ordering::Greater, SeekOp::Gt) => SeekOp::Ge,
                (Ordering::Greater, SeekOp::Le) => SeekOp::Lt,
                (Ordering::Less, SeekOp::Ge) => SeekOp::Gt,
                (Ordering::Less, SeekOp::Lt) => SeekOp::Le,
                (_, seek) => seek,
            };
            TableSeek::Rowid(rowid, seek)
        }
        None => match seek {
            SeekOp::Ge | SeekOp::Gt => TableSeek::Miss,
            SeekOp::Le | SeekOp::Lt => TableSeek::Last,
        },
    }
}

/// Column default carried in P4.
fn p4_value(p4: &P4) -> Value {
    match p4 {
        P4::Int(i) => Value::Integer(i64::from(*i)),
        P4::Int64(i) => Value::Integer(*i),
        P4::Real(r) => Value::Real(*r),
        P4::Str(s) => Value::Text(s.clone()),
        P4::Blob(b) => Value::Blob(b.clone()),
        P4::None | P4::KeyInfo(_) => Value::Null,
    }
}

/// The rowid stored as the last field of an index key.
fn index_rowid(payload: Option<Vec<u8>>) -> Result<Option<i64>> {
    let Some(rec) = payload else {
        return Ok(None);
    };
    match parse_record(&rec)?.last() {
        None => Ok(None),
        Some(Value::Integer(rowid)) => Ok(Some(*rowid)),
        Some(other) => Err(VdbeError::corrupt(format!(
            "index entry ends in {} instead of a rowid",
            other.value_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use qvm_types::opcode::{CMP_JUMPIFNULL, CMP_NULLEQ};

    use super::*;
    use crate::{Insn, Operand, ProgramBuilder};

    fn builder() -> ProgramBuilder {
        Connection::open_in_memory().new_program()
    }

    /// Build, run to completion, return all rows.
    fn run(build: impl FnOnce(&mut ProgramBuilder)) -> Vec<Vec<Value>> {
        let mut b = builder();
        build(&mut b);
        let mut vm = b.finish().unwrap();
        vm.collect_rows().unwrap()
    }

    /// Evaluate a single binary instruction on two constants.
    fn binary(make: impl FnOnce(i32, i32, i32) -> Insn, lhs: Value, rhs: Value) -> Value {
        let rows = run(|b| {
            let (l, r, d) = (b.alloc_register(), b.alloc_register(), b.alloc_register());
            b.add(load(lhs, l));
            b.add(load(rhs, r));
            b.add(make(l, r, d));
            b.add(Insn::ResultRow { start: d, count: 1 });
        });
        rows[0][0].clone()
    }

    fn load(v: Value, dest: i32) -> Insn {
        match v {
            Value::Null => Insn::Null {
                start: dest,
                end: dest,
            },
            Value::Integer(value) => Insn::Int64 { value, dest },
            Value::Real(value) => Insn::Real { value, dest },
            Value::Text(value) => Insn::String8 { value, dest },
            Value::Blob(value) => Insn::Blob { value, dest },
        }
    }

    fn assert_int(v: &Value, expected: i64) {
        assert_eq!(v.as_integer(), Some(expected), "expected integer {expected}, got {v:?}");
    }

    // ── Lifecycle ──

    #[test]
    fn test_step_result_codes() {
        assert_eq!(StepResult::Row.code().as_i32(), 100);
        assert_eq!(StepResult::Done.code().as_i32(), 101);
        assert_eq!(StepResult::Busy.code().as_i32(), 5);
        assert_eq!(StepResult::Continue.code().as_i32(), 0);
    }

    #[test]
    fn test_states_through_run() {
        let mut b = builder();
        let r = b.alloc_register();
        b.add(Insn::Integer { value: 1, dest: r });
        b.add(Insn::Halt);
        let mut vm = b.finish().unwrap();
        assert_eq!(vm.state(), VdbeState::Ready);
        assert_eq!(vm.step().unwrap(), StepResult::Continue);
        assert_eq!(vm.state(), VdbeState::Running);
        assert_eq!(vm.step().unwrap(), StepResult::Continue);
        assert_eq!(vm.step().unwrap(), StepResult::Done);
        assert_eq!(vm.state(), VdbeState::Halted);
        assert_eq!(vm.step().unwrap(), StepResult::Done);
    }

    #[test]
    fn test_falling_off_the_end_is_done() {
        let mut b = builder();
        let r = b.alloc_register();
        b.add(Insn::Integer { value: 1, dest: r });
        let mut vm = b.finish().unwrap();
        assert_eq!(vm.step().unwrap(), StepResult::Continue);
        assert_eq!(vm.step().unwrap(), StepResult::Done);
        assert_eq!(vm.get_int(r), 1);
    }

    #[test]
    fn test_error_is_sticky() {
        let mut b = builder();
        b.add(Insn::HaltWithError {
            code: ErrorCode::Constraint,
            message: "UNIQUE constraint failed".to_owned(),
        });
        let mut vm = b.finish().unwrap();
        vm.step().unwrap();
        let err = vm.step().unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Constraint);
        assert_eq!(err.to_string(), "UNIQUE constraint failed");
        assert_eq!(vm.step().unwrap_err(), err);
        assert_eq!(vm.error(), Some(&err));
        assert_eq!(vm.finalize().unwrap_err(), err);
    }

    #[test]
    fn test_halt_without_message_uses_code_text() {
        let mut b = builder();
        b.append(Opcode::Halt, ErrorCode::Abort.as_i32(), 0, 0);
        let mut vm = b.finish().unwrap();
        vm.step().unwrap();
        let err = vm.step().unwrap_err();
        assert_eq!(err, VdbeError::halted(ErrorCode::Abort, "query aborted"));
    }

    #[test]
    fn test_halt_if_null() {
        let mut b = builder();
        let r = b.alloc_register();
        b.add(Insn::HaltIfNull {
            reg: r,
            code: ErrorCode::Constraint,
            message: "NOT NULL constraint failed".to_owned(),
        });
        let mut vm = b.finish().unwrap();
        vm.step().unwrap();
        assert!(matches!(
            vm.step(),
            Err(VdbeError::Halted { code: ErrorCode::Constraint, .. })
        ));
    }

    #[test]
    fn test_reset_reruns_program() {
        let mut b = builder();
        let r = b.alloc_register();
        let done = b.create_label();
        b.add(Insn::Once { target: done.into() });
        b.add(Insn::Integer { value: 7, dest: r });
        b.add(Insn::ResultRow { start: r, count: 1 });
        b.resolve_label(done).unwrap();
        let mut vm = b.finish().unwrap();
        assert_eq!(vm.collect_rows().unwrap().len(), 1);
        vm.reset();
        assert_eq!(vm.state(), VdbeState::Ready);
        assert!(vm.is_null(r));
        assert_eq!(vm.collect_rows().unwrap().len(), 1);
    }

    #[test]
    fn test_max_steps_interrupts() {
        let conn = Connection::open_in_memory()
            .with_config(VdbeConfig::default().with_max_steps(Some(10)));
        let mut b = conn.new_program();
        let top = b.create_label();
        b.resolve_label(top).unwrap();
        b.add(Insn::Goto { target: top.into() });
        let mut vm = b.finish().unwrap();
        let err = vm.collect_rows().unwrap_err();
        assert_eq!(err, VdbeError::Interrupt { steps: 10 });
        assert_eq!(vm.state(), VdbeState::Halted);
    }

    // ── Registers ──

    #[test]
    fn test_register_api_bounds() {
        let mut vm = builder().make_ready(2, 0).unwrap();
        assert!(vm.set_int(2, 5).is_ok());
        assert_eq!(
            vm.set_int(3, 1),
            Err(VdbeError::RegisterOutOfBounds { index: 3, max: 2 })
        );
        assert!(vm.set_double(0, 1.0).is_err());
        assert_eq!(vm.get_int(3), 0);
        assert!(vm.get_double(-1).abs() < f64::EPSILON);
        assert!(vm.is_null(99));
        assert_eq!(vm.register(0), None);
        assert_eq!(vm.get_int(2), 5);
    }

    #[test]
    fn test_register_coercion() {
        let mut vm = builder().make_ready(3, 0).unwrap();
        vm.set_text(1, "42abc").unwrap();
        vm.set_double(2, -3.9).unwrap();
        vm.set_blob(3, b"7".to_vec()).unwrap();
        assert_eq!(vm.get_int(1), 42);
        assert_eq!(vm.get_int(2), -3);
        assert_eq!(vm.get_int(3), 7);
        assert!((vm.get_double(1) - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_set_replaces_type() {
        let mut vm = builder().make_ready(1, 0).unwrap();
        vm.set_text(1, "hello").unwrap();
        vm.set_int(1, 3).unwrap();
        assert_eq!(vm.register(1).map(Value::value_type), Some(ValueType::Integer));
        vm.set_null(1).unwrap();
        assert!(vm.is_null(1));
    }

    #[test]
    fn test_out_of_range_register_halts() {
        let mut b = builder();
        b.append(Opcode::Integer, 1, 5, 0);
        let mut cfg = b.config().clone();
        cfg.validate_operands = false;
        b.set_config(cfg);
        let mut vm = b.make_ready(2, 0).unwrap();
        vm.step().unwrap();
        assert_eq!(
            vm.step().unwrap_err(),
            VdbeError::RegisterOutOfBounds { index: 5, max: 2 }
        );
        assert_eq!(vm.state(), VdbeState::Halted);
    }

    // ── Constants and moves ──

    #[test]
    fn test_constants() {
        let rows = run(|b| {
            let r = b.alloc_registers(5);
            b.add(Insn::Integer { value: -4, dest: r });
            b.add(Insn::Int64 {
                value: i64::MAX,
                dest: r + 1,
            });
            b.add(Insn::Real {
                value: 2.5,
                dest: r + 2,
            });
            b.add(Insn::String8 {
                value: "hi".to_owned(),
                dest: r + 3,
            });
            b.add(Insn::Blob {
                value: vec![1, 2],
                dest: r + 4,
            });
            b.add(Insn::ResultRow { start: r, count: 5 });
        });
        assert_eq!(
            rows[0],
            vec![
                Value::Integer(-4),
                Value::Integer(i64::MAX),
                Value::Real(2.5),
                Value::from("hi"),
                Value::Blob(vec![1, 2]),
            ]
        );
    }

    #[test]
    fn test_null_range_and_soft_null() {
        let rows = run(|b| {
            let r = b.alloc_registers(3);
            for i in 0..3 {
                b.add(Insn::Integer { value: 1, dest: r + i });
            }
            b.add(Insn::Null {
                start: r,
                end: r + 1,
            });
            b.add(Insn::ResultRow { start: r, count: 3 });
            b.add(Insn::SoftNull { reg: r + 2 });
            b.add(Insn::ResultRow { start: r, count: 3 });
        });
        assert!(rows[0][0].is_null() && rows[0][1].is_null());
        assert_int(&rows[0][2], 1);
        assert!(rows[1][2].is_null());
    }

    #[test]
    fn test_move_nulls_source() {
        let rows = run(|b| {
            let r = b.alloc_registers(4);
            b.add(Insn::Integer { value: 1, dest: r });
            b.add(Insn::Integer {
                value: 2,
                dest: r + 1,
            });
            b.add(Insn::Move {
                src: r,
                dest: r + 2,
                count: 2,
            });
            b.add(Insn::ResultRow { start: r, count: 4 });
        });
        assert!(rows[0][0].is_null() && rows[0][1].is_null());
        assert_int(&rows[0][2], 1);
        assert_int(&rows[0][3], 2);
    }

    #[test]
    fn test_copy_and_int_copy() {
        let rows = run(|b| {
            let r = b.alloc_registers(5);
            b.add(Insn::String8 {
                value: "12.9".to_owned(),
                dest: r,
            });
            b.add(Insn::Integer {
                value: 3,
                dest: r + 1,
            });
            b.add(Insn::Copy {
                src: r,
                dest: r + 2,
                count: 2,
            });
            b.add(Insn::IntCopy {
                src: r,
                dest: r + 4,
            });
            b.add(Insn::ResultRow { start: r, count: 5 });
        });
        assert_eq!(rows[0][2], Value::from("12.9"));
        assert_int(&rows[0][3], 3);
        assert_int(&rows[0][4], 12);
    }

    #[test]
    fn test_variable_reads_bindings() {
        let mut b = builder();
        let r = b.alloc_registers(2);
        b.add(Insn::Variable { param: 1, dest: r });
        b.add(Insn::Variable {
            param: 2,
            dest: r + 1,
        });
        b.add(Insn::ResultRow { start: r, count: 2 });
        let mut vm = b.finish().unwrap();
        vm.bind(1, "x").unwrap();
        assert_eq!(
            vm.bind(0, 1),
            Err(VdbeError::Range {
                what: "parameter index",
                value: 0
            })
        );
        assert!(vm.bind(1000, 1).is_err());
        let rows = vm.collect_rows().unwrap();
        assert_eq!(rows[0][0], Value::from("x"));
        assert!(rows[0][1].is_null());
        vm.reset();
        let rows = vm.collect_rows().unwrap();
        assert_eq!(rows[0][0], Value::from("x"));
        vm.reset();
        vm.clear_bindings();
        assert!(vm.collect_rows().unwrap()[0][0].is_null());
    }

    // ── Arithmetic ──

    #[test]
    fn test_subtract_and_divide_operand_order() {
        let sub = binary(
            |l, r, d| Insn::Subtract {
                lhs: l,
                rhs: r,
                dest: d,
            },
            Value::Integer(10),
            Value::Integer(3),
        );
        assert_int(&sub, 7);
        let div = binary(
            |l, r, d| Insn::Divide {
                lhs: l,
                rhs: r,
                dest: d,
            },
            Value::Integer(10),
            Value::Integer(3),
        );
        assert_int(&div, 3);
        let rem = binary(
            |l, r, d| Insn::Remainder {
                lhs: l,
                rhs: r,
                dest: d,
            },
            Value::Integer(10),
            Value::Integer(3),
        );
        assert_int(&rem, 1);
    }

    #[test]
    fn test_concat_order() {
        let v = binary(
            |l, r, d| Insn::Concat {
                lhs: l,
                rhs: r,
                dest: d,
            },
            Value::from("ab"),
            Value::from("cd"),
        );
        assert_eq!(v, Value::from("abcd"));
    }

    #[test]
    fn test_shift_operand_order() {
        let v = binary(
            |l, r, d| Insn::ShiftLeft {
                value: l,
                amount: r,
                dest: d,
            },
            Value::Integer(3),
            Value::Integer(2),
        );
        assert_int(&v, 12);
    }

    #[test]
    fn test_add_imm_and_real_affinity() {
        let rows = run(|b| {
            let r = b.alloc_registers(2);
            b.add(Insn::String8 {
                value: "5".to_owned(),
                dest: r,
            });
            b.add(Insn::AddImm { reg: r, value: -7 });
            b.add(Insn::Integer {
                value: 3,
                dest: r + 1,
            });
            b.add(Insn::RealAffinity { reg: r + 1 });
            b.add(Insn::ResultRow { start: r, count: 2 });
        });
        assert_int(&rows[0][0], -2);
        assert_eq!(rows[0][1].value_type(), ValueType::Real);
    }

    #[test]
    fn test_cast() {
        let rows = run(|b| {
            let r = b.alloc_registers(3);
            b.add(Insn::Integer { value: 12, dest: r });
            b.add(Insn::Cast {
                reg: r,
                affinity: Affinity::Text,
            });
            b.add(Insn::String8 {
                value: "3.0".to_owned(),
                dest: r + 1,
            });
            b.add(Insn::Cast {
                reg: r + 1,
                affinity: Affinity::Numeric,
            });
            b.add(Insn::Real {
                value: 9.75,
                dest: r + 2,
            });
            b.add(Insn::Cast {
                reg: r + 2,
                affinity: Affinity::Integer,
            });
            b.add(Insn::ResultRow { start: r, count: 3 });
        });
        assert_eq!(rows[0][0], Value::from("12"));
        assert_eq!(rows[0][1].value_type(), ValueType::Integer);
        assert_int(&rows[0][2], 9);
    }

    #[test]
    fn test_is_true() {
        let rows = run(|b| {
            let r = b.alloc_registers(3);
            b.add(Insn::IsTrue {
                src: r,
                dest: r + 1,
                null_value: true,
                invert: false,
            });
            b.add(Insn::IsTrue {
                src: r,
                dest: r + 2,
                null_value: true,
                invert: true,
            });
            b.add(Insn::ResultRow {
                start: r + 1,
                count: 2,
            });
        });
        assert_int(&rows[0][0], 1);
        assert_int(&rows[0][1], 0);
    }

    // ── Branches ──

    fn branch_taken(insn: impl FnOnce(i32, i32, Operand) -> Insn, lhs: Value, rhs: Value) -> bool {
        let rows = run(|b| {
            let (l, r, out) = (b.alloc_register(), b.alloc_register(), b.alloc_register());
            let taken = b.create_label();
            let end = b.create_label();
            b.add(load(lhs, l));
            b.add(load(rhs, r));
            b.add(insn(l, r, taken.into()));
            b.add(Insn::Integer {
                value: 0,
                dest: out,
            });
            b.add(Insn::Goto { target: end.into() });
            b.resolve_label(taken).unwrap();
            b.add(Insn::Integer {
                value: 1,
                dest: out,
            });
            b.resolve_label(end).unwrap();
            b.add(Insn::ResultRow {
                start: out,
                count: 1,
            });
        });
        rows[0][0].as_integer() == Some(1)
    }

    #[test]
    fn test_comparisons() {
        let lt = |l, r, t| Insn::Lt {
            lhs: l,
            rhs: r,
            target: t,
            flags: 0,
        };
        assert!(branch_taken(lt, Value::Integer(1), Value::Integer(2)));
        assert!(!branch_taken(lt, Value::Integer(2), Value::Integer(1)));
        let ge = |l, r, t| Insn::Ge {
            lhs: l,
            rhs: r,
            target: t,
            flags: 0,
        };
        assert!(branch_taken(ge, Value::Real(2.0), Value::Integer(2)));
        let eq = |l, r, t| Insn::Eq {
            lhs: l,
            rhs: r,
            target: t,
            flags: 0,
        };
        assert!(!branch_taken(eq, Value::Null, Value::Null));
        let eq_null = |l, r, t| Insn::Eq {
            lhs: l,
            rhs: r,
            target: t,
            flags: CMP_NULLEQ,
        };
        assert!(branch_taken(eq_null, Value::Null, Value::Null));
        let ne_jump_null = |l, r, t| Insn::Ne {
            lhs: l,
            rhs: r,
            target: t,
            flags: CMP_JUMPIFNULL,
        };
        assert!(branch_taken(ne_jump_null, Value::Null, Value::Integer(1)));
    }

    #[test]
    fn test_if_and_if_not_with_null() {
        let if_ = |l, _r, t| Insn::If {
            reg: l,
            target: t,
            jump_if_null: false,
        };
        assert!(branch_taken(if_, Value::Integer(5), Value::Null));
        assert!(!branch_taken(if_, Value::Real(0.0), Value::Null));
        assert!(!branch_taken(if_, Value::Null, Value::Null));
        let if_not_null = |l, _r, t| Insn::IfNot {
            reg: l,
            target: t,
            jump_if_null: true,
        };
        assert!(branch_taken(if_not_null, Value::Null, Value::Null));
        assert!(branch_taken(if_not_null, Value::Integer(0), Value::Null));
        assert!(!branch_taken(if_not_null, Value::from("1"), Value::Null));
    }

    #[test]
    fn test_must_be_int() {
        let jumps = |l, _r, t| Insn::MustBeInt {
            reg: l,
            target: Some(t),
        };
        assert!(!branch_taken(jumps, Value::from("12"), Value::Null));
        assert!(!branch_taken(jumps, Value::Real(3.0), Value::Null));
        assert!(branch_taken(jumps, Value::Real(3.5), Value::Null));

        let mut b = builder();
        let r = b.alloc_register();
        b.add(Insn::String8 {
            value: "x".to_owned(),
            dest: r,
        });
        b.add(Insn::MustBeInt {
            reg: r,
            target: None,
        });
        let mut vm = b.finish().unwrap();
        let err = vm.collect_rows().unwrap_err();
        assert!(matches!(err, VdbeError::TypeMismatch { .. }));
    }

    #[test]
    fn test_compare_and_jump() {
        let rows = run(|b| {
            let a = b.alloc_registers(2);
            let c = b.alloc_registers(2);
            let out = b.alloc_register();
            b.add(Insn::Integer { value: 1, dest: a });
            b.add(Insn::Integer {
                value: 5,
                dest: a + 1,
            });
            b.add(Insn::Integer { value: 1, dest: c });
            b.add(Insn::Integer {
                value: 9,
                dest: c + 1,
            });
            b.add(Insn::Compare {
                lhs: a,
                rhs: c,
                count: 2,
            });
            let (lt, eq, gt) = (b.create_label(), b.create_label(), b.create_label());
            let end = b.create_label();
            b.add(Insn::Jump {
                lt: lt.into(),
                eq: eq.into(),
                gt: gt.into(),
            });
            for (label, value) in [(lt, -1), (eq, 0), (gt, 1)] {
                b.resolve_label(label).unwrap();
                b.add(Insn::Integer { value, dest: out });
                b.add(Insn::Goto { target: end.into() });
            }
            b.resolve_label(end).unwrap();
            b.add(Insn::ResultRow {
                start: out,
                count: 1,
            });
        });
        assert_int(&rows[0][0], -1);
    }

    #[test]
    fn test_jump_without_compare_is_misuse() {
        let mut b = builder();
        b.append(Opcode::Jump, 1, 1, 1);
        let mut vm = b.finish().unwrap();
        vm.step().unwrap();
        assert!(matches!(vm.step(), Err(VdbeError::Misuse(_))));
    }

    #[test]
    fn test_counters() {
        let rows = run(|b| {
            let n = b.alloc_register();
            let hits = b.alloc_register();
            let done = b.create_label();
            b.add(Insn::Integer { value: 3, dest: n });
            b.add(Insn::Integer {
                value: 0,
                dest: hits,
            });
            let top = b.current_addr();
            b.add(Insn::AddImm {
                reg: hits,
                value: 1,
            });
            b.add(Insn::DecrJumpZero {
                reg: n,
                target: done.into(),
            });
            b.add(Insn::Goto { target: top.into() });
            b.resolve_label(done).unwrap();
            b.add(Insn::ResultRow {
                start: n,
                count: 2,
            });
        });
        assert_int(&rows[0][0], 0);
        assert_int(&rows[0][1], 3);
    }

    #[test]
    fn test_if_pos_and_if_not_zero() {
        let rows = run(|b| {
            let r = b.alloc_registers(3);
            b.add(Insn::Integer { value: 5, dest: r });
            let skip = b.create_label();
            b.add(Insn::IfPos {
                reg: r,
                target: skip.into(),
                decrement: 2,
            });
            b.add(Insn::Integer {
                value: 100,
                dest: r,
            });
            b.resolve_label(skip).unwrap();
            b.add(Insn::Integer {
                value: -4,
                dest: r + 1,
            });
            let skip2 = b.create_label();
            b.add(Insn::IfNotZero {
                reg: r + 1,
                target: skip2.into(),
            });
            b.add(Insn::Integer {
                value: 100,
                dest: r + 1,
            });
            b.resolve_label(skip2).unwrap();
            b.add(Insn::ResultRow { start: r, count: 2 });
        });
        assert_int(&rows[0][0], 3);
        // Negative values jump without being decremented.
        assert_int(&rows[0][1], -4);
    }

    // ── Subroutines and coroutines ──

    #[test]
    fn test_gosub_return() {
        let rows = run(|b| {
            let ret = b.alloc_register();
            let out = b.alloc_register();
            let sub = b.create_label();
            let end = b.create_label();
            b.add(Insn::Gosub {
                return_reg: ret,
                target: sub.into(),
            });
            b.add(Insn::ResultRow {
                start: out,
                count: 1,
            });
            b.add(Insn::Goto { target: end.into() });
            b.resolve_label(sub).unwrap();
            b.add(Insn::Integer {
                value: 99,
                dest: out,
            });
            b.add(Insn::Return { return_reg: ret });
            b.resolve_label(end).unwrap();
            b.add(Insn::Halt);
        });
        assert_eq!(rows.len(), 1);
        assert_int(&rows[0][0], 99);
    }

    #[test]
    fn test_coroutine_produces_values() {
        let rows = run(|b| {
            let co = b.alloc_register();
            let val = b.alloc_register();
            let body = b.create_label();
            let start = b.create_label();
            let done = b.create_label();

            b.add(Insn::InitCoroutine {
                yield_reg: co,
                skip: start.into(),
                entry: body.into(),
            });
            // Coroutine body: yield 10 then 20.
            b.resolve_label(body).unwrap();
            for v in [10, 20] {
                b.add(Insn::Integer { value: v, dest: val });
                b.add(Insn::Yield {
                    yield_reg: co,
                    done: Operand::Imm(0),
                });
            }
            b.add(Insn::EndCoroutine { yield_reg: co });

            // Consumer loop.
            b.resolve_label(start).unwrap();
            let top = b.current_addr();
            b.add(Insn::Yield {
                yield_reg: co,
                done: done.into(),
            });
            b.add(Insn::ResultRow {
                start: val,
                count: 1,
            });
            b.add(Insn::Goto { target: top.into() });
            b.resolve_label(done).unwrap();
            b.add(Insn::Halt);
        });
        let values: Vec<i64> = rows.iter().filter_map(|r| r[0].as_integer()).collect();
        assert_eq!(values, vec![10, 20]);
    }

    // ── Result rows ──

    #[test]
    fn test_column_accessors() {
        let mut b = builder();
        let r = b.alloc_registers(4);
        b.add(Insn::Int64 {
            value: 0x1_0000_0005,
            dest: r,
        });
        b.add(Insn::Real {
            value: 1.5,
            dest: r + 1,
        });
        b.add(Insn::String8 {
            value: "txt".to_owned(),
            dest: r + 2,
        });
        b.add(Insn::ResultRow { start: r, count: 4 });
        let mut vm = b.finish().unwrap();
        assert_eq!(vm.step_row().unwrap(), StepResult::Row);
        assert_eq!(vm.column_count(), 4);
        assert_eq!(vm.column_int(0), 5);
        assert_eq!(vm.column_int64(0), 0x1_0000_0005);
        assert!((vm.column_double(1) - 1.5).abs() < f64::EPSILON);
        assert_eq!(vm.column_text(1).as_deref(), Some("1.5"));
        assert_eq!(vm.column_blob(2), Some(b"txt".to_vec()));
        assert_eq!(vm.column_type(3), ValueType::Null);
        assert_eq!(vm.column_text(3), None);
        assert_eq!(vm.column_type(10), ValueType::Null);
        assert_eq!(vm.column_int64(10), 0);
        assert_eq!(vm.step().unwrap(), StepResult::Done);
        assert_eq!(vm.column_count(), 0);
        assert!(vm.row().is_empty());
    }

    // ── Storage ──

    #[test]
    fn test_cursor_not_open_halts() {
        let mut b = builder();
        let c = b.alloc_cursor();
        b.add(Insn::Rewind {
            cursor: c,
            target: Operand::Imm(0),
        });
        let mut vm = b.finish().unwrap();
        vm.step().unwrap();
        assert_eq!(vm.step().unwrap_err(), VdbeError::CursorNotOpen { cursor: 0 });
        assert_eq!(vm.state(), VdbeState::Halted);
    }

    #[test]
    fn test_ephemeral_table_insert_scan() {
        let rows = run(|b| {
            let c = b.alloc_cursor();
            let r = b.alloc_registers(3);
            b.add(Insn::OpenEphemeral {
                cursor: c,
                key_fields: None,
            });
            for v in [30, 10, 20] {
                b.add(Insn::Integer { value: v, dest: r });
                b.add(Insn::MakeRecord {
                    start: r,
                    count: 1,
                    dest: r + 1,
                    affinities: None,
                });
                b.add(Insn::NewRowid {
                    cursor: c,
                    dest: r + 2,
                    autoinc: 0,
                });
                b.add(Insn::Insert {
                    cursor: c,
                    record: r + 1,
                    rowid: r + 2,
                });
            }
            let end = b.create_label();
            b.add(Insn::Rewind {
                cursor: c,
                target: end.into(),
            });
            let top = b.current_addr();
            b.add(Insn::Rowid { cursor: c, dest: r });
            b.add(Insn::Column {
                cursor: c,
                column: 0,
                dest: r + 1,
                default: None,
            });
            b.add(Insn::ResultRow { start: r, count: 2 });
            b.add(Insn::Next {
                cursor: c,
                target: top.into(),
            });
            b.resolve_label(end).unwrap();
            b.add(Insn::Close { cursor: c });
        });
        let got: Vec<(i64, i64)> = rows
            .iter()
            .map(|r| (r[0].as_integer().unwrap(), r[1].as_integer().unwrap()))
            .collect();
        assert_eq!(got, vec![(1, 30), (2, 10), (3, 20)]);
    }

    #[test]
    fn test_column_default_and_null_row() {
        let rows = run(|b| {
            let c = b.alloc_cursor();
            let r = b.alloc_registers(4);
            b.add(Insn::OpenEphemeral {
                cursor: c,
                key_fields: None,
            });
            b.add(Insn::Integer { value: 1, dest: r });
            b.add(Insn::MakeRecord {
                start: r,
                count: 1,
                dest: r + 1,
                affinities: None,
            });
            b.add(Insn::Insert {
                cursor: c,
                record: r + 1,
                rowid: r,
            });
            b.add(Insn::Column {
                cursor: c,
                column: 3,
                dest: r + 2,
                default: Some(Value::from("dflt")),
            });
            b.add(Insn::NullRow { cursor: c });
            b.add(Insn::Column {
                cursor: c,
                column: 0,
                dest: r + 3,
                default: None,
            });
            b.add(Insn::ResultRow {
                start: r + 2,
                count: 2,
            });
        });
        assert_eq!(rows[0][0], Value::from("dflt"));
        assert!(rows[0][1].is_null());
    }

    #[test]
    fn test_make_record_affinity() {
        let rows = run(|b| {
            let r = b.alloc_registers(3);
            b.add(Insn::String8 {
                value: "17".to_owned(),
                dest: r,
            });
            b.add(Insn::MakeRecord {
                start: r,
                count: 1,
                dest: r + 1,
                affinities: Some("D".to_owned()),
            });
            b.add(Insn::ResultRow {
                start: r + 1,
                count: 1,
            });
        });
        let Value::Blob(rec) = &rows[0][0] else {
            panic!("expected a record blob");
        };
        assert_eq!(parse_record(rec).unwrap(), vec![Value::Integer(17)]);
    }

    #[test]
    fn test_new_rowid_autoincrement_register() {
        let rows = run(|b| {
            let c = b.alloc_cursor();
            let r = b.alloc_registers(2);
            b.add(Insn::OpenEphemeral {
                cursor: c,
                key_fields: None,
            });
            b.add(Insn::Integer {
                value: 41,
                dest: r + 1,
            });
            b.add(Insn::NewRowid {
                cursor: c,
                dest: r,
                autoinc: r + 1,
            });
            b.add(Insn::ResultRow { start: r, count: 2 });
        });
        assert_int(&rows[0][0], 42);
        assert_int(&rows[0][1], 42);
    }

    #[test]
    fn test_if_not_open() {
        let mut b = builder();
        let c = b.alloc_cursor();
        let out = b.alloc_register();
        let closed = b.create_label();
        b.add(Insn::IfNotOpen {
            cursor: c,
            target: closed.into(),
        });
        b.add(Insn::Halt);
        b.resolve_label(closed).unwrap();
        b.add(Insn::Integer { value: 1, dest: out });
        b.add(Insn::ResultRow {
            start: out,
            count: 1,
        });
        let mut vm = b.finish().unwrap();
        assert_eq!(vm.collect_rows().unwrap().len(), 1);
    }

    #[test]
    fn test_table_seek_key_classification() {
        let seek = |v: Value, op| table_seek(&[v], op);
        assert_eq!(seek(Value::Integer(2), SeekOp::Ge), TableSeek::Rowid(2, SeekOp::Ge));
        assert_eq!(seek(Value::from("3"), SeekOp::Lt), TableSeek::Rowid(3, SeekOp::Lt));

        assert_eq!(seek(Value::Real(2.5), SeekOp::Ge), TableSeek::Rowid(2, SeekOp::Gt));
        assert_eq!(seek(Value::Real(2.5), SeekOp::Lt), TableSeek::Rowid(2, SeekOp::Le));
        assert_eq!(seek(Value::Real(2.5), SeekOp::Gt), TableSeek::Rowid(2, SeekOp::Gt));
        assert_eq!(seek(Value::Real(-2.5), SeekOp::Gt), TableSeek::Rowid(-2, SeekOp::Ge));
        assert_eq!(seek(Value::Real(-2.5), SeekOp::Le), TableSeek::Rowid(-2, SeekOp::Lt));
        assert_eq!(seek(Value::Real(4.0), SeekOp::Le), TableSeek::Rowid(4, SeekOp::Le));

        assert_eq!(seek(Value::Null, SeekOp::Le), TableSeek::Miss);
        assert_eq!(seek(Value::from("abc"), SeekOp::Ge), TableSeek::Miss);
        assert_eq!(seek(Value::from("abc"), SeekOp::Gt), TableSeek::Miss);
        assert_eq!(seek(Value::from("abc"), SeekOp::Le), TableSeek::Last);
        assert_eq!(seek(Value::Blob(vec![1]), SeekOp::Lt), TableSeek::Last);
        assert_eq!(table_seek(&[], SeekOp::Ge), TableSeek::Miss);
    }
}
