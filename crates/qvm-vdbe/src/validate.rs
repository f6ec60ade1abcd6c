//! Operand validation pass run before a program becomes executable.
//!
//! Every register, cursor and jump operand is checked against the sizes the
//! caller declared. Execution bounds-checks each access regardless; this
//! pass catches an undersized register file or cursor table up front
//! instead of partway through a run.

use qvm_error::{Result, VdbeError};
use qvm_types::opcode::{Opcode, P4, VdbeOp};

/// How one operand of an instruction is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Use {
    Reg(&'static str, i32),
    /// `count` registers starting at the operand value.
    Range(&'static str, i32, i64),
    Cursor(&'static str, i32),
    Target(&'static str, i32),
}

#[allow(clippy::too_many_lines)]
fn operand_uses(op: &VdbeOp) -> Vec<Use> {
    use Opcode as O;
    use Use::{Cursor, Range, Reg, Target};

    let (p1, p2, p3) = (op.p1, op.p2, op.p3);
    let key_count = match op.p4 {
        P4::Int(n) if n > 0 => i64::from(n),
        _ => 1,
    };

    match op.opcode {
        O::Init | O::Goto | O::Once => vec![Target("p2", p2)],
        O::Gosub => vec![Reg("p1", p1), Target("p2", p2)],
        O::Return | O::EndCoroutine | O::SoftNull => vec![Reg("p1", p1)],
        O::AddImm | O::Cast | O::RealAffinity => vec![Reg("p1", p1)],
        O::InitCoroutine => {
            let mut uses = vec![Reg("p1", p1), Target("p3", p3)];
            if p2 != 0 {
                uses.push(Target("p2", p2));
            }
            uses
        }
        O::Halt | O::Noop | O::Transaction => Vec::new(),
        O::HaltIfNull => vec![Reg("p3", p3)],
        O::If
        | O::IfNot
        | O::IsNull
        | O::NotNull
        | O::IfPos
        | O::IfNotZero
        | O::DecrJumpZero => vec![Reg("p1", p1), Target("p2", p2)],
        O::MustBeInt | O::Yield => {
            let mut uses = vec![Reg("p1", p1)];
            if p2 != 0 {
                uses.push(Target("p2", p2));
            }
            uses
        }
        O::Jump => vec![Target("p1", p1), Target("p2", p2), Target("p3", p3)],
        O::Eq | O::Ne | O::Lt | O::Le | O::Gt | O::Ge => {
            vec![Reg("p1", p1), Target("p2", p2), Reg("p3", p3)]
        }
        O::Compare => vec![
            Range("p1", p1, i64::from(p3)),
            Range("p2", p2, i64::from(p3)),
        ],

        O::Integer | O::Int64 | O::Real | O::String8 | O::Blob | O::Variable => {
            vec![Reg("p2", p2)]
        }
        O::Null => vec![Range("p2", p2, i64::from(p3.max(p2)) - i64::from(p2) + 1)],

        O::Move => vec![
            Range("p1", p1, i64::from(p3)),
            Range("p2", p2, i64::from(p3)),
        ],
        O::Copy => vec![
            Range("p1", p1, i64::from(p3) + 1),
            Range("p2", p2, i64::from(p3) + 1),
        ],
        O::SCopy | O::IntCopy | O::BitNot | O::Not | O::IsTrue => {
            vec![Reg("p1", p1), Reg("p2", p2)]
        }
        O::ResultRow => vec![Range("p1", p1, i64::from(p2))],

        O::Add
        | O::Subtract
        | O::Multiply
        | O::Divide
        | O::Remainder
        | O::Concat
        | O::BitAnd
        | O::BitOr
        | O::ShiftLeft
        | O::ShiftRight
        | O::And
        | O::Or => vec![Reg("p1", p1), Reg("p2", p2), Reg("p3", p3)],

        O::OpenRead | O::OpenWrite | O::OpenEphemeral | O::Close | O::NullRow | O::Delete => {
            vec![Cursor("p1", p1)]
        }
        O::IfNotOpen | O::Rewind | O::Last | O::Next | O::Prev => {
            vec![Cursor("p1", p1), Target("p2", p2)]
        }
        O::SeekRowid | O::NotExists => vec![Cursor("p1", p1), Target("p2", p2), Reg("p3", p3)],
        O::SeekGE | O::SeekGT | O::SeekLE | O::SeekLT | O::Found | O::NotFound => vec![
            Cursor("p1", p1),
            Target("p2", p2),
            Range("p3", p3, key_count),
        ],
        O::Column => vec![Cursor("p1", p1), Reg("p3", p3)],
        O::Rowid | O::IdxRowid | O::Count | O::IdxInsert => vec![Cursor("p1", p1), Reg("p2", p2)],
        O::NewRowid => {
            let mut uses = vec![Cursor("p1", p1), Reg("p2", p2)];
            if p3 != 0 {
                uses.push(Reg("p3", p3));
            }
            uses
        }
        O::Insert => vec![Cursor("p1", p1), Reg("p2", p2), Reg("p3", p3)],
        O::MakeRecord => vec![Range("p1", p1, i64::from(p2)), Reg("p3", p3)],
        O::IdxDelete => vec![Cursor("p1", p1), Range("p2", p2, i64::from(p3))],
    }
}

/// Check every operand of `ops` against a register file of
/// `register_count` cells (indexed from 1) and a cursor table of
/// `cursor_count` slots. Returns the first offending operand.
#[allow(clippy::cast_possible_wrap)]
pub fn validate_operands(ops: &[VdbeOp], register_count: usize, cursor_count: usize) -> Result<()> {
    let max_reg = register_count as i64;
    let max_cursor = cursor_count as i64;
    let max_target = ops.len() as i64;

    for (addr, op) in ops.iter().enumerate() {
        let fail = |operand: &'static str, value: i64, limit: i64| VdbeError::OperandOutOfRange {
            addr,
            opcode: op.opcode.name(),
            operand,
            value,
            limit,
        };

        for u in operand_uses(op) {
            match u {
                Use::Reg(name, r) => {
                    let r = i64::from(r);
                    if r < 1 || r > max_reg {
                        return Err(fail(name, r, max_reg));
                    }
                }
                Use::Range(name, start, count) => {
                    if count <= 0 {
                        continue;
                    }
                    let start = i64::from(start);
                    if start < 1 {
                        return Err(fail(name, start, max_reg));
                    }
                    let last = start + count - 1;
                    if last > max_reg {
                        return Err(fail(name, last, max_reg));
                    }
                }
                Use::Cursor(name, c) => {
                    let c = i64::from(c);
                    if c < 0 || c >= max_cursor {
                        return Err(fail(name, c, max_cursor));
                    }
                }
                Use::Target(name, t) => {
                    let t = i64::from(t);
                    if t < 0 || t > max_target {
                        return Err(fail(name, t, max_target));
                    }
                }
            }
        }
    }
    Ok(())
}
