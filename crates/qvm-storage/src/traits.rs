//! Engine and cursor traits.
//!
//! # Two tree kinds
//!
//! - **Table trees:** keyed by `i64` rowid; each entry stores a record
//!   payload.
//! - **Index trees:** keyed by a record; entries carry no separate payload.
//!   By convention the last key field is the rowid of the table row the
//!   entry points at.
//!
//! # Locking
//!
//! Writers are serialized by an exclusive write lock keyed by [`OwnerId`].
//! A second owner asking for it gets [`qvm_error::VdbeError::Busy`] and is
//! expected to retry. Readers take no lock.

use std::fmt;

use qvm_error::Result;
use qvm_types::Value;

/// Identity of a lock holder; each VM instance uses its own.
pub type OwnerId = u64;

/// Which kind of tree a root names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeKind {
    Table,
    Index,
}

/// Direction of a key seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOp {
    /// First entry with key >= the seek key.
    Ge,
    /// First entry with key > the seek key.
    Gt,
    /// Last entry with key <= the seek key.
    Le,
    /// Last entry with key < the seek key.
    Lt,
}

/// Result of an exact-match seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResult {
    /// The exact key was found; the cursor points to it.
    Found,
    /// The key was not found; the cursor points to the entry that would
    /// follow it in sort order, or is at EOF.
    NotFound,
}

impl SeekResult {
    #[must_use]
    pub fn is_found(self) -> bool {
        self == Self::Found
    }
}

/// A storage engine a connection is bound to.
pub trait StorageEngine: fmt::Debug + Send + Sync {
    /// Begin a transaction for `owner`. A write transaction takes the
    /// exclusive write lock, failing with `Busy` while another owner holds
    /// it. Re-entrant for the current holder.
    fn begin(&self, owner: OwnerId, write: bool) -> Result<()>;

    /// Release every lock held by `owner`. Never fails; releasing nothing
    /// is a no-op.
    fn release(&self, owner: OwnerId);

    /// Whether `owner` currently holds the write lock.
    fn holds_write_lock(&self, owner: OwnerId) -> bool;

    /// Kind of the tree at `root`.
    fn tree_kind(&self, root: u32) -> Result<TreeKind>;

    /// Open a cursor on the tree at `root`.
    fn open_cursor(
        &self,
        owner: OwnerId,
        root: u32,
        writable: bool,
    ) -> Result<Box<dyn StorageCursor>>;

    /// Open a cursor on a fresh private tree that disappears with it.
    fn open_ephemeral(&self, kind: TreeKind) -> Result<Box<dyn StorageCursor>>;

    /// Create an empty table tree and return its root.
    fn create_table(&self) -> Result<u32>;

    /// Create an empty index tree and return its root.
    fn create_index(&self) -> Result<u32>;
}

/// Cursor operations the VM forwards opcodes to.
///
/// A cursor is either positioned on an entry or at EOF. Navigation methods
/// return `true` when they land on an entry.
pub trait StorageCursor: fmt::Debug + Send {
    fn kind(&self) -> TreeKind;

    // -- Navigation --

    /// Move to the first entry. `false` if the tree is empty.
    fn first(&mut self) -> Result<bool>;

    /// Move to the last entry. `false` if the tree is empty.
    fn last(&mut self) -> Result<bool>;

    /// Advance. `false` (and EOF) when there is no next entry.
    fn next(&mut self) -> Result<bool>;

    /// Step backwards. `false` (and EOF) when there is no previous entry.
    fn prev(&mut self) -> Result<bool>;

    /// Whether the cursor is not positioned on an entry.
    fn eof(&self) -> bool;

    // -- Seeks --

    /// Position a table cursor at `rowid`.
    fn seek_rowid(&mut self, rowid: i64) -> Result<SeekResult>;

    /// Position by key. On a table the first key value is the rowid; on an
    /// index the seek key is compared against the leading fields of each entry.
    /// `false` (and EOF) when no entry qualifies.
    fn seek_key(&mut self, key: &[Value], op: SeekOp) -> Result<bool>;

    /// Position an index cursor on the first entry whose leading fields
    /// equal `key`.
    fn find_key(&mut self, key: &[Value]) -> Result<bool>;

    // -- Reads --

    /// Rowid of the current table entry; `None` at EOF or after the entry
    /// was deleted.
    fn rowid(&self) -> Result<Option<i64>>;

    /// Record of the current entry (the row for a table, the key for an
    /// index); `None` at EOF or after the entry was deleted.
    fn payload(&self) -> Result<Option<Vec<u8>>>;

    /// Number of entries in the tree.
    fn count(&self) -> Result<i64>;

    /// Largest rowid in a table tree.
    fn max_rowid(&self) -> Result<Option<i64>>;

    // -- Mutation --

    /// Insert or replace a table row and position on it.
    fn insert(&mut self, rowid: i64, payload: &[u8]) -> Result<()>;

    /// Insert an index key record; an identical key is replaced.
    fn insert_key(&mut self, key: &[u8]) -> Result<()>;

    /// Delete the current entry. The cursor keeps its place so that
    /// `next`/`prev` continue from where the entry was.
    fn delete(&mut self) -> Result<()>;

    /// Delete the first index entry whose leading fields equal `key`.
    fn delete_key(&mut self, key: &[Value]) -> Result<bool>;
}
