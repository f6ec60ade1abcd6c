//! Typed instructions.
//!
//! [`Insn`] names every operand of every opcode and lowers to the positional
//! P1..P5 form stored in a program. Registers are plain `i32` indices; jump
//! targets are [`Operand`]s so a pending [`Label`](crate::Label) can be used
//! wherever an address is expected.

use qvm_error::ErrorCode;
use qvm_types::opcode::{Opcode, P4};
use qvm_types::{Affinity, Value};

use crate::Operand;

/// One instruction with named operands.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    // ── Control flow ──
    Goto { target: Operand },
    /// Store the return address in `return_reg` and jump.
    Gosub { return_reg: i32, target: Operand },
    Return { return_reg: i32 },
    /// Set up a coroutine whose body starts at `entry`, then jump to `skip`.
    InitCoroutine { yield_reg: i32, skip: Operand, entry: Operand },
    /// Swap control with the coroutine in `yield_reg`. When the coroutine
    /// ends, the caller resumes at `done`.
    Yield { yield_reg: i32, done: Operand },
    EndCoroutine { yield_reg: i32 },
    /// Clean stop.
    Halt,
    HaltWithError { code: ErrorCode, message: String },
    HaltIfNull { reg: i32, code: ErrorCode, message: String },
    If { reg: i32, target: Operand, jump_if_null: bool },
    IfNot { reg: i32, target: Operand, jump_if_null: bool },
    IsNull { reg: i32, target: Operand },
    NotNull { reg: i32, target: Operand },
    Once { target: Operand },
    /// Branch on the ordering recorded by the last `Compare`.
    Jump { lt: Operand, eq: Operand, gt: Operand },
    Eq { lhs: i32, rhs: i32, target: Operand, flags: u16 },
    Ne { lhs: i32, rhs: i32, target: Operand, flags: u16 },
    Lt { lhs: i32, rhs: i32, target: Operand, flags: u16 },
    Le { lhs: i32, rhs: i32, target: Operand, flags: u16 },
    Gt { lhs: i32, rhs: i32, target: Operand, flags: u16 },
    Ge { lhs: i32, rhs: i32, target: Operand, flags: u16 },
    /// Compare `count` registers starting at `lhs` with those at `rhs`.
    Compare { lhs: i32, rhs: i32, count: i32 },
    IfPos { reg: i32, target: Operand, decrement: i32 },
    IfNotZero { reg: i32, target: Operand },
    DecrJumpZero { reg: i32, target: Operand },
    /// Without a target a non-integer is a type mismatch.
    MustBeInt { reg: i32, target: Option<Operand> },
    Noop,

    // ── Constants ──
    Integer { value: i32, dest: i32 },
    Int64 { value: i64, dest: i32 },
    Real { value: f64, dest: i32 },
    String8 { value: String, dest: i32 },
    Blob { value: Vec<u8>, dest: i32 },
    /// NULL into `start..=end`.
    Null { start: i32, end: i32 },
    SoftNull { reg: i32 },
    /// Bound parameter `param` (1-based).
    Variable { param: i32, dest: i32 },

    // ── Register moves ──
    Move { src: i32, dest: i32, count: i32 },
    Copy { src: i32, dest: i32, count: i32 },
    SCopy { src: i32, dest: i32 },
    IntCopy { src: i32, dest: i32 },
    ResultRow { start: i32, count: i32 },

    // ── Arithmetic and logic ──
    Add { lhs: i32, rhs: i32, dest: i32 },
    Subtract { lhs: i32, rhs: i32, dest: i32 },
    Multiply { lhs: i32, rhs: i32, dest: i32 },
    Divide { lhs: i32, rhs: i32, dest: i32 },
    Remainder { lhs: i32, rhs: i32, dest: i32 },
    Concat { lhs: i32, rhs: i32, dest: i32 },
    BitAnd { lhs: i32, rhs: i32, dest: i32 },
    BitOr { lhs: i32, rhs: i32, dest: i32 },
    ShiftLeft { value: i32, amount: i32, dest: i32 },
    ShiftRight { value: i32, amount: i32, dest: i32 },
    BitNot { src: i32, dest: i32 },
    Not { src: i32, dest: i32 },
    And { lhs: i32, rhs: i32, dest: i32 },
    Or { lhs: i32, rhs: i32, dest: i32 },
    AddImm { reg: i32, value: i32 },
    Cast { reg: i32, affinity: Affinity },
    RealAffinity { reg: i32 },
    IsTrue { src: i32, dest: i32, null_value: bool, invert: bool },

    // ── Storage ──
    Transaction { write: bool },
    OpenRead { cursor: i32, root: i32 },
    OpenWrite { cursor: i32, root: i32 },
    /// Index tree when `key_fields` is set, rowid table otherwise.
    OpenEphemeral { cursor: i32, key_fields: Option<u16> },
    Close { cursor: i32 },
    IfNotOpen { cursor: i32, target: Operand },
    Rewind { cursor: i32, target: Operand },
    Last { cursor: i32, target: Operand },
    Next { cursor: i32, target: Operand },
    Prev { cursor: i32, target: Operand },
    SeekRowid { cursor: i32, target: Operand, rowid: i32 },
    NotExists { cursor: i32, target: Operand, rowid: i32 },
    SeekGE { cursor: i32, target: Operand, key: i32, count: i32 },
    SeekGT { cursor: i32, target: Operand, key: i32, count: i32 },
    SeekLE { cursor: i32, target: Operand, key: i32, count: i32 },
    SeekLT { cursor: i32, target: Operand, key: i32, count: i32 },
    /// With `count` 0, `key` holds a record instead of unpacked registers.
    Found { cursor: i32, target: Operand, key: i32, count: i32 },
    NotFound { cursor: i32, target: Operand, key: i32, count: i32 },
    Column { cursor: i32, column: i32, dest: i32, default: Option<Value> },
    Rowid { cursor: i32, dest: i32 },
    NullRow { cursor: i32 },
    /// `autoinc` names a register tracking the largest rowid ever handed
    /// out; 0 for none.
    NewRowid { cursor: i32, dest: i32, autoinc: i32 },
    Insert { cursor: i32, record: i32, rowid: i32 },
    Delete { cursor: i32 },
    /// `affinities` holds one affinity character per column.
    MakeRecord { start: i32, count: i32, dest: i32, affinities: Option<String> },
    IdxInsert { cursor: i32, record: i32 },
    IdxDelete { cursor: i32, key: i32, count: i32 },
    IdxRowid { cursor: i32, dest: i32 },
    Count { cursor: i32, dest: i32 },
}

/// Positional form of an instruction, before labels are resolved.
pub(crate) struct Lowered {
    pub opcode: Opcode,
    pub p1: Operand,
    pub p2: Operand,
    pub p3: Operand,
    pub p4: P4,
    pub p5: u16,
}

fn op(opcode: Opcode, p1: impl Into<Operand>, p2: impl Into<Operand>, p3: impl Into<Operand>) -> Lowered {
    Lowered {
        opcode,
        p1: p1.into(),
        p2: p2.into(),
        p3: p3.into(),
        p4: P4::None,
        p5: 0,
    }
}

impl Lowered {
    fn p4(mut self, p4: P4) -> Self {
        self.p4 = p4;
        self
    }

    const fn p5(mut self, p5: u16) -> Self {
        self.p5 = p5;
        self
    }
}

fn value_p4(value: Option<Value>) -> P4 {
    match value {
        None | Some(Value::Null) => P4::None,
        Some(Value::Integer(i)) => P4::Int64(i),
        Some(Value::Real(r)) => P4::Real(r),
        Some(Value::Text(s)) => P4::Str(s),
        Some(Value::Blob(b)) => P4::Blob(b),
    }
}

impl Insn {
    /// The opcode this instruction lowers to.
    pub fn opcode(&self) -> Opcode {
        self.clone().lower().opcode
    }

    #[allow(clippy::too_many_lines)]
    pub(crate) fn lower(self) -> Lowered {
        use Opcode as O;
        match self {
            Self::Goto { target } => op(O::Goto, 0, target, 0),
            Self::Gosub { return_reg, target } => op(O::Gosub, return_reg, target, 0),
            Self::Return { return_reg } => op(O::Return, return_reg, 0, 0),
            Self::InitCoroutine {
                yield_reg,
                skip,
                entry,
            } => op(O::InitCoroutine, yield_reg, skip, entry),
            Self::Yield { yield_reg, done } => op(O::Yield, yield_reg, done, 0),
            Self::EndCoroutine { yield_reg } => op(O::EndCoroutine, yield_reg, 0, 0),
            Self::Halt => op(O::Halt, 0, 0, 0),
            Self::HaltWithError { code, message } => {
                op(O::Halt, code.as_i32(), 0, 0).p4(P4::Str(message))
            }
            Self::HaltIfNull { reg, code, message } => {
                op(O::HaltIfNull, code.as_i32(), 0, reg).p4(P4::Str(message))
            }
            Self::If {
                reg,
                target,
                jump_if_null,
            } => op(O::If, reg, target, i32::from(jump_if_null)),
            Self::IfNot {
                reg,
                target,
                jump_if_null,
            } => op(O::IfNot, reg, target, i32::from(jump_if_null)),
            Self::IsNull { reg, target } => op(O::IsNull, reg, target, 0),
            Self::NotNull { reg, target } => op(O::NotNull, reg, target, 0),
            Self::Once { target } => op(O::Once, 0, target, 0),
            Self::Jump { lt, eq, gt } => op(O::Jump, lt, eq, gt),
            Self::Eq {
                lhs,
                rhs,
                target,
                flags,
            } => op(O::Eq, rhs, target, lhs).p5(flags),
            Self::Ne {
                lhs,
                rhs,
                target,
                flags,
            } => op(O::Ne, rhs, target, lhs).p5(flags),
            Self::Lt {
                lhs,
                rhs,
                target,
                flags,
            } => op(O::Lt, rhs, target, lhs).p5(flags),
            Self::Le {
                lhs,
                rhs,
                target,
                flags,
            } => op(O::Le, rhs, target, lhs).p5(flags),
            Self::Gt {
                lhs,
                rhs,
                target,
                flags,
            } => op(O::Gt, rhs, target, lhs).p5(flags),
            Self::Ge {
                lhs,
                rhs,
                target,
                flags,
            } => op(O::Ge, rhs, target, lhs).p5(flags),
            Self::Compare { lhs, rhs, count } => op(O::Compare, lhs, rhs, count),
            Self::IfPos {
                reg,
                target,
                decrement,
            } => op(O::IfPos, reg, target, decrement),
            Self::IfNotZero { reg, target } => op(O::IfNotZero, reg, target, 0),
            Self::DecrJumpZero { reg, target } => op(O::DecrJumpZero, reg, target, 0),
            Self::MustBeInt { reg, target } => {
                op(O::MustBeInt, reg, target.unwrap_or(Operand::Imm(0)), 0)
            }
            Self::Noop => op(O::Noop, 0, 0, 0),

            Self::Integer { value, dest } => op(O::Integer, value, dest, 0),
            Self::Int64 { value, dest } => op(O::Int64, 0, dest, 0).p4(P4::Int64(value)),
            Self::Real { value, dest } => op(O::Real, 0, dest, 0).p4(P4::Real(value)),
            Self::String8 { value, dest } => op(O::String8, 0, dest, 0).p4(P4::Str(value)),
            Self::Blob { value, dest } => op(O::Blob, 0, dest, 0).p4(P4::Blob(value)),
            Self::Null { start, end } => op(O::Null, 0, start, end),
            Self::SoftNull { reg } => op(O::SoftNull, reg, 0, 0),
            Self::Variable { param, dest } => op(O::Variable, param, dest, 0),

            Self::Move { src, dest, count } => op(O::Move, src, dest, count),
            Self::Copy { src, dest, count } => op(O::Copy, src, dest, count - 1),
            Self::SCopy { src, dest } => op(O::SCopy, src, dest, 0),
            Self::IntCopy { src, dest } => op(O::IntCopy, src, dest, 0),
            Self::ResultRow { start, count } => op(O::ResultRow, start, count, 0),

            Self::Add { lhs, rhs, dest } => op(O::Add, rhs, lhs, dest),
            Self::Subtract { lhs, rhs, dest } => op(O::Subtract, rhs, lhs, dest),
            Self::Multiply { lhs, rhs, dest } => op(O::Multiply, rhs, lhs, dest),
            Self::Divide { lhs, rhs, dest } => op(O::Divide, rhs, lhs, dest),
            Self::Remainder { lhs, rhs, dest } => op(O::Remainder, rhs, lhs, dest),
            Self::Concat { lhs, rhs, dest } => op(O::Concat, rhs, lhs, dest),
            Self::BitAnd { lhs, rhs, dest } => op(O::BitAnd, rhs, lhs, dest),
            Self::BitOr { lhs, rhs, dest } => op(O::BitOr, rhs, lhs, dest),
            Self::ShiftLeft {
                value,
                amount,
                dest,
            } => op(O::ShiftLeft, amount, value, dest),
            Self::ShiftRight {
                value,
                amount,
                dest,
            } => op(O::ShiftRight, amount, value, dest),
            Self::BitNot { src, dest } => op(O::BitNot, src, dest, 0),
            Self::Not { src, dest } => op(O::Not, src, dest, 0),
            Self::And { lhs, rhs, dest } => op(O::And, rhs, lhs, dest),
            Self::Or { lhs, rhs, dest } => op(O::Or, rhs, lhs, dest),
            Self::AddImm { reg, value } => op(O::AddImm, reg, value, 0),
            Self::Cast { reg, affinity } => {
                op(O::Cast, reg, i32::from(affinity.as_byte()), 0)
            }
            Self::RealAffinity { reg } => op(O::RealAffinity, reg, 0, 0),
            Self::IsTrue {
                src,
                dest,
                null_value,
                invert,
            } => op(O::IsTrue, src, dest, i32::from(null_value)).p4(P4::Int(i32::from(invert))),

            Self::Transaction { write } => op(O::Transaction, 0, i32::from(write), 0),
            Self::OpenRead { cursor, root } => op(O::OpenRead, cursor, root, 0),
            Self::OpenWrite { cursor, root } => op(O::OpenWrite, cursor, root, 0),
            Self::OpenEphemeral { cursor, key_fields } => {
                let p4 = key_fields.map_or(P4::None, P4::KeyInfo);
                op(O::OpenEphemeral, cursor, 0, 0).p4(p4)
            }
            Self::Close { cursor } => op(O::Close, cursor, 0, 0),
            Self::IfNotOpen { cursor, target } => op(O::IfNotOpen, cursor, target, 0),
            Self::Rewind { cursor, target } => op(O::Rewind, cursor, target, 0),
            Self::Last { cursor, target } => op(O::Last, cursor, target, 0),
            Self::Next { cursor, target } => op(O::Next, cursor, target, 0),
            Self::Prev { cursor, target } => op(O::Prev, cursor, target, 0),
            Self::SeekRowid {
                cursor,
                target,
                rowid,
            } => op(O::SeekRowid, cursor, target, rowid),
            Self::NotExists {
                cursor,
                target,
                rowid,
            } => op(O::NotExists, cursor, target, rowid),
            Self::SeekGE {
                cursor,
                target,
                key,
                count,
            } => op(O::SeekGE, cursor, target, key).p4(P4::Int(count)),
            Self::SeekGT {
                cursor,
                target,
                key,
                count,
            } => op(O::SeekGT, cursor, target, key).p4(P4::Int(count)),
            Self::SeekLE {
                cursor,
                target,
                key,
                count,
            } => op(O::SeekLE, cursor, target, key).p4(P4::Int(count)),
            Self::SeekLT {
                cursor,
                target,
                key,
                count,
            } => op(O::SeekLT, cursor, target, key).p4(P4::Int(count)),
            Self::Found {
                cursor,
                target,
                key,
                count,
            } => op(O::Found, cursor, target, key).p4(P4::Int(count)),
            Self::NotFound {
                cursor,
                target,
                key,
                count,
            } => op(O::NotFound, cursor, target, key).p4(P4::Int(count)),
            Self::Column {
                cursor,
                column,
                dest,
                default,
            } => op(O::Column, cursor, column, dest).p4(value_p4(default)),
            Self::Rowid { cursor, dest } => op(O::Rowid, cursor, dest, 0),
            Self::NullRow { cursor } => op(O::NullRow, cursor, 0, 0),
            Self::NewRowid {
                cursor,
                dest,
                autoinc,
            } => op(O::NewRowid, cursor, dest, autoinc),
            Self::Insert {
                cursor,
                record,
                rowid,
            } => op(O::Insert, cursor, record, rowid),
            Self::Delete { cursor } => op(O::Delete, cursor, 0, 0),
            Self::MakeRecord {
                start,
                count,
                dest,
                affinities,
            } => op(O::MakeRecord, start, count, dest).p4(affinities.map_or(P4::None, P4::Str)),
            Self::IdxInsert { cursor, record } => op(O::IdxInsert, cursor, record, 0),
            Self::IdxDelete { cursor, key, count } => op(O::IdxDelete, cursor, key, count),
            Self::IdxRowid { cursor, dest } => op(O::IdxRowid, cursor, dest, 0),
            Self::Count { cursor, dest } => op(O::Count, cursor, dest, 0),
        }
    }
}
