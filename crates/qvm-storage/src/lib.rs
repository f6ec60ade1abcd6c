//! Storage boundary for the query VM.
//!
//! The VM never touches trees directly: cursor-table slots hold
//! [`StorageCursor`] trait objects obtained from a [`StorageEngine`], and
//! every open/advance/seek/write opcode is forwarded to them. Status from
//! the engine travels back as [`qvm_error::VdbeError`], with
//! [`qvm_error::VdbeError::Busy`] marking the one transient case.
//!
//! [`MemStorage`] is the in-memory engine used by tests and embedders that
//! need no durability.

pub mod mem;
pub mod traits;

pub use mem::{MemCursor, MemStorage};
pub use traits::{OwnerId, SeekOp, SeekResult, StorageCursor, StorageEngine, TreeKind};
