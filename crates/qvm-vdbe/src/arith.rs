//! Value-level operators used by the arithmetic, bitwise, logical and
//! comparison opcodes.
//!
//! NULL propagates through every arithmetic and bitwise operator. Integer
//! arithmetic that overflows is redone in floating point, and a floating
//! point result of NaN becomes NULL.

use std::cmp::Ordering;

use qvm_types::coerce::{int_value, numeric_value, text_value, truthy};
use qvm_types::opcode::{CMP_JUMPIFNULL, CMP_NULLEQ};
use qvm_types::{Numeric, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// `lhs op rhs`.
pub(crate) fn arith(op: ArithOp, lhs: &Value, rhs: &Value) -> Value {
    if lhs.is_null() || rhs.is_null() {
        return Value::Null;
    }
    match (numeric_value(lhs), numeric_value(rhs)) {
        (Numeric::Int(a), Numeric::Int(b)) => int_arith(op, a, b),
        (a, b) => real_arith(op, a.as_f64(), b.as_f64()),
    }
}

#[allow(clippy::cast_precision_loss)]
fn int_arith(op: ArithOp, a: i64, b: i64) -> Value {
    let result = match op {
        ArithOp::Add => a.checked_add(b),
        ArithOp::Sub => a.checked_sub(b),
        ArithOp::Mul => a.checked_mul(b),
        ArithOp::Div => {
            if b == 0 {
                return Value::Null;
            }
            a.checked_div(b)
        }
        ArithOp::Rem => {
            if b == 0 {
                return Value::Null;
            }
            // i64::MIN % -1 overflows; the answer is 0 either way.
            let b = if b == -1 { 1 } else { b };
            Some(a % b)
        }
    };
    result.map_or_else(|| real_arith(op, a as f64, b as f64), Value::Integer)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn real_arith(op: ArithOp, a: f64, b: f64) -> Value {
    let result = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => {
            if b == 0.0 {
                return Value::Null;
            }
            a / b
        }
        ArithOp::Rem => {
            let (ia, ib) = (a as i64, b as i64);
            if ib == 0 {
                return Value::Null;
            }
            let ib = if ib == -1 { 1 } else { ib };
            (ia % ib) as f64
        }
    };
    Value::from_real_result(result)
}

/// `lhs || rhs`.
pub(crate) fn concat(lhs: &Value, rhs: &Value) -> Value {
    match (text_value(lhs), text_value(rhs)) {
        (Some(a), Some(b)) => {
            let mut s = a.into_owned();
            s.push_str(&b);
            Value::Text(s)
        }
        _ => Value::Null,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitOp {
    And,
    Or,
    Shl,
    Shr,
}

/// `lhs op rhs` on the integer values of both operands.
pub(crate) fn bitwise(op: BitOp, lhs: &Value, rhs: &Value) -> Value {
    if lhs.is_null() || rhs.is_null() {
        return Value::Null;
    }
    let (a, b) = (int_value(lhs), int_value(rhs));
    Value::Integer(match op {
        BitOp::And => a & b,
        BitOp::Or => a | b,
        BitOp::Shl => shift_left(a, b),
        BitOp::Shr => shift_right(a, b),
    })
}

/// A negative amount shifts the other way; 64 or more shifts everything out.
fn shift_left(value: i64, amount: i64) -> i64 {
    if amount < 0 {
        return shift_right(value, amount.saturating_neg());
    }
    if amount >= 64 {
        return 0;
    }
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let shift = amount as u32;
    value << shift
}

fn shift_right(value: i64, amount: i64) -> i64 {
    if amount < 0 {
        return shift_left(value, amount.saturating_neg());
    }
    if amount >= 64 {
        return if value < 0 { -1 } else { 0 };
    }
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let shift = amount as u32;
    value >> shift
}

pub(crate) fn bit_not(v: &Value) -> Value {
    if v.is_null() {
        return Value::Null;
    }
    Value::Integer(!int_value(v))
}

pub(crate) fn logical_not(v: &Value) -> Value {
    truthy(v).map_or(Value::Null, |b| Value::from(!b))
}

/// Three-valued AND: false wins over NULL.
pub(crate) fn logical_and(lhs: &Value, rhs: &Value) -> Value {
    match (truthy(lhs), truthy(rhs)) {
        (Some(false), _) | (_, Some(false)) => Value::Integer(0),
        (Some(true), Some(true)) => Value::Integer(1),
        _ => Value::Null,
    }
}

/// Three-valued OR: true wins over NULL.
pub(crate) fn logical_or(lhs: &Value, rhs: &Value) -> Value {
    match (truthy(lhs), truthy(rhs)) {
        (Some(true), _) | (_, Some(true)) => Value::Integer(1),
        (Some(false), Some(false)) => Value::Integer(0),
        _ => Value::Null,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    const fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => matches!(ord, Ordering::Equal),
            Self::Ne => !matches!(ord, Ordering::Equal),
            Self::Lt => matches!(ord, Ordering::Less),
            Self::Le => !matches!(ord, Ordering::Greater),
            Self::Gt => matches!(ord, Ordering::Greater),
            Self::Ge => !matches!(ord, Ordering::Less),
        }
    }
}

/// Whether a comparison opcode jumps for `lhs op rhs` under the P5 flags.
///
/// Without `CMP_NULLEQ`, a NULL operand makes the comparison unknown and
/// the jump is taken only with `CMP_JUMPIFNULL`. With `CMP_NULLEQ`, two
/// NULLs are equal and a single NULL sorts first.
pub(crate) fn compare_jumps(op: CmpOp, lhs: &Value, rhs: &Value, flags: u16) -> bool {
    if lhs.is_null() || rhs.is_null() {
        if flags & CMP_NULLEQ == 0 {
            return flags & CMP_JUMPIFNULL != 0;
        }
        let ord = match (lhs.is_null(), rhs.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            _ => Ordering::Greater,
        };
        return op.holds(ord);
    }
    op.holds(lhs.total_cmp(rhs))
}
