//! Foundational types shared by the query VM and its storage boundary.
//!
//! - [`value`]: the dynamically typed register cell.
//! - [`coerce`]: the permissive conversion rules used when a cell is read
//!   as a different type than it was written.
//! - [`opcode`]: the opcode catalogue and the instruction record.
//! - [`record`]: the serial-type record codec used for row payloads.

pub mod coerce;
pub mod opcode;
pub mod record;
pub mod value;

pub use coerce::{Affinity, Numeric};
pub use opcode::{Opcode, P4, VdbeOp};
pub use value::{Value, ValueType};
