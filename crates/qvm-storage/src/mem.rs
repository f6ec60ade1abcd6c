//! In-memory storage engine.
//!
//! Table trees are `BTreeMap<i64, Vec<u8>>`; index trees are vectors of
//! decoded keys kept in [`Value::total_cmp`] order. Cursors remember the
//! key they sit on rather than an iterator, so they stay valid while the
//! tree is mutated underneath them (including by their own deletes).

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use qvm_error::{Result, VdbeError};
use qvm_types::Value;
use qvm_types::record::parse_record;
use tracing::{debug, trace};

use crate::traits::{OwnerId, SeekOp, SeekResult, StorageCursor, StorageEngine, TreeKind};

// ── Trees ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct IndexEntry {
    key: Vec<Value>,
    raw: Vec<u8>,
}

#[derive(Debug)]
enum Tree {
    Table(BTreeMap<i64, Vec<u8>>),
    Index(Vec<IndexEntry>),
}

impl Tree {
    fn new(kind: TreeKind) -> Self {
        match kind {
            TreeKind::Table => Self::Table(BTreeMap::new()),
            TreeKind::Index => Self::Index(Vec::new()),
        }
    }

    const fn kind(&self) -> TreeKind {
        match self {
            Self::Table(_) => TreeKind::Table,
            Self::Index(_) => TreeKind::Index,
        }
    }
}

/// Compare the leading `key.len()` fields of `entry` with `key`. An
/// entry with fewer fields than the key sorts before it.
fn cmp_prefix(entry: &[Value], key: &[Value]) -> Ordering {
    for (i, p) in key.iter().enumerate() {
        let Some(e) = entry.get(i) else {
            return Ordering::Less;
        };
        match e.total_cmp(p) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// Full-key order used to keep index entries sorted.
fn cmp_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        match x.total_cmp(y) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

#[derive(Debug, Default)]
struct Catalog {
    next_root: u32,
    trees: HashMap<u32, Tree>,
}

#[derive(Debug, Default)]
struct Shared {
    catalog: RwLock<Catalog>,
    writer: Mutex<Option<OwnerId>>,
}

impl Shared {
    fn create(&self, kind: TreeKind) -> u32 {
        let mut catalog = self.catalog.write();
        catalog.next_root += 1;
        let root = catalog.next_root;
        catalog.trees.insert(root, Tree::new(kind));
        root
    }
}

// ── MemStorage ──────────────────────────────────────────────────────────────

/// Shared in-memory engine. Cloning yields another handle to the same
/// trees and lock.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    shared: Arc<Shared>,
}

impl MemStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write-lock holder, if any.
    pub fn writer(&self) -> Option<OwnerId> {
        *self.shared.writer.lock()
    }
}

impl StorageEngine for MemStorage {
    fn begin(&self, owner: OwnerId, write: bool) -> Result<()> {
        if !write {
            return Ok(());
        }
        let mut writer = self.shared.writer.lock();
        match *writer {
            Some(holder) if holder != owner => {
                trace!(owner, holder, "write lock busy");
                Err(VdbeError::Busy)
            }
            _ => {
                *writer = Some(owner);
                trace!(owner, "write lock acquired");
                Ok(())
            }
        }
    }

    fn release(&self, owner: OwnerId) {
        let mut writer = self.shared.writer.lock();
        if *writer == Some(owner) {
            *writer = None;
            trace!(owner, "write lock released");
        }
    }

    fn holds_write_lock(&self, owner: OwnerId) -> bool {
        *self.shared.writer.lock() == Some(owner)
    }

    fn tree_kind(&self, root: u32) -> Result<TreeKind> {
        self.shared
            .catalog
            .read()
            .trees
            .get(&root)
            .map(Tree::kind)
            .ok_or(VdbeError::NoSuchTable { root })
    }

    fn open_cursor(
        &self,
        owner: OwnerId,
        root: u32,
        writable: bool,
    ) -> Result<Box<dyn StorageCursor>> {
        let kind = self.tree_kind(root)?;
        Ok(Box::new(MemCursor {
            shared: Arc::clone(&self.shared),
            root,
            kind,
            owner: Some(owner),
            writable,
            pos: Position::Eof,
        }))
    }

    fn create_table(&self) -> Result<u32> {
        let root = self.shared.create(TreeKind::Table);
        debug!(root, "created table tree");
        Ok(root)
    }

    fn open_ephemeral(&self, kind: TreeKind) -> Result<Box<dyn StorageCursor>> {
        Ok(Box::new(MemCursor::ephemeral(kind)))
    }

    fn create_index(&self) -> Result<u32> {
        let root = self.shared.create(TreeKind::Index);
        debug!(root, "created index tree");
        Ok(root)
    }
}

// ── MemCursor ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Position {
    Eof,
    Row(i64),
    Key(Vec<Value>),
}

/// Cursor over one [`MemStorage`] tree, or over a private ephemeral tree.
#[derive(Debug)]
pub struct MemCursor {
    shared: Arc<Shared>,
    root: u32,
    kind: TreeKind,
    /// `None` for ephemeral trees, which no other owner can see.
    owner: Option<OwnerId>,
    writable: bool,
    pos: Position,
}

impl MemCursor {
    /// A writable cursor on a fresh tree owned by nobody else.
    #[must_use]
    pub fn ephemeral(kind: TreeKind) -> Self {
        let shared = Arc::new(Shared::default());
        let root = shared.create(kind);
        Self {
            shared,
            root,
            kind,
            owner: None,
            writable: true,
            pos: Position::Eof,
        }
    }

    fn with_tree<T>(&self, f: impl FnOnce(&Tree) -> T) -> Result<T> {
        let catalog = self.shared.catalog.read();
        let tree = catalog
            .trees
            .get(&self.root)
            .ok_or(VdbeError::NoSuchTable { root: self.root })?;
        Ok(f(tree))
    }

    fn with_tree_mut<T>(&self, f: impl FnOnce(&mut Tree) -> Result<T>) -> Result<T> {
        self.check_writable()?;
        let mut catalog = self.shared.catalog.write();
        let tree = catalog
            .trees
            .get_mut(&self.root)
            .ok_or(VdbeError::NoSuchTable { root: self.root })?;
        f(tree)
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(VdbeError::ReadOnly);
        }
        if let Some(owner) = self.owner {
            if let Some(holder) = *self.shared.writer.lock() {
                if holder != owner {
                    return Err(VdbeError::Busy);
                }
            }
        }
        Ok(())
    }

    fn set_row(&mut self, rowid: Option<i64>) -> bool {
        self.pos = rowid.map_or(Position::Eof, Position::Row);
        !matches!(self.pos, Position::Eof)
    }

    fn set_key(&mut self, key: Option<Vec<Value>>) -> bool {
        self.pos = key.map_or(Position::Eof, Position::Key);
        !matches!(self.pos, Position::Eof)
    }

    fn wrong_kind(&self, what: &str) -> VdbeError {
        VdbeError::misuse(format!("{what} on {:?} cursor (root {})", self.kind, self.root))
    }

    /// Move relative to the current position. `forward` selects `next`.
    fn step(&mut self, forward: bool) -> Result<bool> {
        let pos = self.pos.clone();
        match pos {
            Position::Eof => Ok(false),
            Position::Row(cur) => {
                let found = self.with_tree(|tree| match tree {
                    Tree::Table(rows) => {
                        if forward {
                            rows.range((Bound::Excluded(cur), Bound::Unbounded))
                                .next()
                                .map(|(k, _)| *k)
                        } else {
                            rows.range(..cur).next_back().map(|(k, _)| *k)
                        }
                    }
                    Tree::Index(_) => None,
                })?;
                Ok(self.set_row(found))
            }
            Position::Key(cur) => {
                let found = self.with_tree(|tree| match tree {
                    Tree::Index(entries) => {
                        if forward {
                            let idx = entries
                                .partition_point(|e| cmp_keys(&e.key, &cur) != Ordering::Greater);
                            entries.get(idx).map(|e| e.key.clone())
                        } else {
                            let idx =
                                entries.partition_point(|e| cmp_keys(&e.key, &cur) == Ordering::Less);
                            idx.checked_sub(1).map(|i| entries[i].key.clone())
                        }
                    }
                    Tree::Table(_) => None,
                })?;
                Ok(self.set_key(found))
            }
        }
    }

    fn edge(&mut self, first: bool) -> Result<bool> {
        match self.kind {
            TreeKind::Table => {
                let found = self.with_tree(|tree| match tree {
                    Tree::Table(rows) => {
                        let entry = if first {
                            rows.keys().next()
                        } else {
                            rows.keys().next_back()
                        };
                        entry.copied()
                    }
                    Tree::Index(_) => None,
                })?;
                Ok(self.set_row(found))
            }
            TreeKind::Index => {
                let found = self.with_tree(|tree| match tree {
                    Tree::Index(entries) => {
                        let entry = if first { entries.first() } else { entries.last() };
                        entry.map(|e| e.key.clone())
                    }
                    Tree::Table(_) => None,
                })?;
                Ok(self.set_key(found))
            }
        }
    }
}

impl StorageCursor for MemCursor {
    fn kind(&self) -> TreeKind {
        self.kind
    }

    fn first(&mut self) -> Result<bool> {
        self.edge(true)
    }

    fn last(&mut self) -> Result<bool> {
        self.edge(false)
    }

    fn next(&mut self) -> Result<bool> {
        self.step(true)
    }

    fn prev(&mut self) -> Result<bool> {
        self.step(false)
    }

    fn eof(&self) -> bool {
        matches!(self.pos, Position::Eof)
    }

    fn seek_rowid(&mut self, rowid: i64) -> Result<SeekResult> {
        if self.kind != TreeKind::Table {
            return Err(self.wrong_kind("seek_rowid"));
        }
        let (exact, following) = self.with_tree(|tree| match tree {
            Tree::Table(rows) => (
                rows.contains_key(&rowid),
                rows.range(rowid..).next().map(|(k, _)| *k),
            ),
            Tree::Index(_) => (false, None),
        })?;
        self.set_row(following);
        Ok(if exact {
            SeekResult::Found
        } else {
            SeekResult::NotFound
        })
    }

    fn seek_key(&mut self, key: &[Value], op: SeekOp) -> Result<bool> {
        match self.kind {
            TreeKind::Table => {
                let Some(first) = key.first() else {
                    return Err(VdbeError::misuse("seek with an empty key"));
                };
                let rowid = qvm_types::coerce::int_value(first);
                let found = self.with_tree(|tree| {
                    let Tree::Table(rows) = tree else {
                        return None;
                    };
                    let hit = match op {
                        SeekOp::Ge => rows.range(rowid..).next(),
                        SeekOp::Gt => rows
                            .range((Bound::Excluded(rowid), Bound::Unbounded))
                            .next(),
                        SeekOp::Le => rows.range(..=rowid).next_back(),
                        SeekOp::Lt => rows.range(..rowid).next_back(),
                    };
                    hit.map(|(k, _)| *k)
                })?;
                Ok(self.set_row(found))
            }
            TreeKind::Index => {
                let found = self.with_tree(|tree| {
                    let Tree::Index(entries) = tree else {
                        return None;
                    };
                    let idx = match op {
                        SeekOp::Ge => Some(
                            entries.partition_point(|e| cmp_prefix(&e.key, key) == Ordering::Less),
                        ),
                        SeekOp::Gt => Some(
                            entries
                                .partition_point(|e| cmp_prefix(&e.key, key) != Ordering::Greater),
                        ),
                        SeekOp::Le => entries
                            .partition_point(|e| cmp_prefix(&e.key, key) != Ordering::Greater)
                            .checked_sub(1),
                        SeekOp::Lt => entries
                            .partition_point(|e| cmp_prefix(&e.key, key) == Ordering::Less)
                            .checked_sub(1),
                    };
                    idx.and_then(|i| entries.get(i)).map(|e| e.key.clone())
                })?;
                Ok(self.set_key(found))
            }
        }
    }

    fn find_key(&mut self, key: &[Value]) -> Result<bool> {
        if self.kind != TreeKind::Index {
            return Err(self.wrong_kind("find_key"));
        }
        if !self.seek_key(key, SeekOp::Ge)? {
            return Ok(false);
        }
        let hit = matches!(&self.pos, Position::Key(k) if cmp_prefix(k, key) == Ordering::Equal);
        Ok(hit)
    }

    fn rowid(&self) -> Result<Option<i64>> {
        match &self.pos {
            Position::Row(rowid) => {
                let rowid = *rowid;
                self.with_tree(|tree| match tree {
                    Tree::Table(rows) => rows.contains_key(&rowid).then_some(rowid),
                    Tree::Index(_) => None,
                })
            }
            Position::Eof | Position::Key(_) => Ok(None),
        }
    }

    fn payload(&self) -> Result<Option<Vec<u8>>> {
        match &self.pos {
            Position::Eof => Ok(None),
            Position::Row(rowid) => self.with_tree(|tree| match tree {
                Tree::Table(rows) => rows.get(rowid).cloned(),
                Tree::Index(_) => None,
            }),
            Position::Key(key) => self.with_tree(|tree| match tree {
                Tree::Index(entries) => entries
                    .binary_search_by(|e| cmp_keys(&e.key, key))
                    .ok()
                    .map(|i| entries[i].raw.clone()),
                Tree::Table(_) => None,
            }),
        }
    }

    fn count(&self) -> Result<i64> {
        self.with_tree(|tree| {
            let n = match tree {
                Tree::Table(rows) => rows.len(),
                Tree::Index(entries) => entries.len(),
            };
            i64::try_from(n).unwrap_or(i64::MAX)
        })
    }

    fn max_rowid(&self) -> Result<Option<i64>> {
        self.with_tree(|tree| match tree {
            Tree::Table(rows) => rows.keys().next_back().copied(),
            Tree::Index(_) => None,
        })
    }

    fn insert(&mut self, rowid: i64, payload: &[u8]) -> Result<()> {
        if self.kind != TreeKind::Table {
            return Err(self.wrong_kind("insert"));
        }
        self.with_tree_mut(|tree| {
            if let Tree::Table(rows) = tree {
                rows.insert(rowid, payload.to_vec());
            }
            Ok(())
        })?;
        self.pos = Position::Row(rowid);
        Ok(())
    }

    fn insert_key(&mut self, key: &[u8]) -> Result<()> {
        if self.kind != TreeKind::Index {
            return Err(self.wrong_kind("insert_key"));
        }
        let decoded = parse_record(key)?;
        let raw = key.to_vec();
        let positioned = decoded.clone();
        self.with_tree_mut(|tree| {
            if let Tree::Index(entries) = tree {
                match entries.binary_search_by(|e| cmp_keys(&e.key, &decoded)) {
                    Ok(i) => entries[i].raw = raw,
                    Err(i) => entries.insert(i, IndexEntry { key: decoded, raw }),
                }
            }
            Ok(())
        })?;
        self.pos = Position::Key(positioned);
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        let pos = self.pos.clone();
        match pos {
            Position::Eof => Err(VdbeError::misuse("delete with cursor at EOF")),
            Position::Row(rowid) => self.with_tree_mut(|tree| {
                if let Tree::Table(rows) = tree {
                    rows.remove(&rowid);
                }
                Ok(())
            }),
            Position::Key(key) => self.with_tree_mut(|tree| {
                if let Tree::Index(entries) = tree {
                    if let Ok(i) = entries.binary_search_by(|e| cmp_keys(&e.key, &key)) {
                        entries.remove(i);
                    }
                }
                Ok(())
            }),
        }
    }

    fn delete_key(&mut self, key: &[Value]) -> Result<bool> {
        if self.kind != TreeKind::Index {
            return Err(self.wrong_kind("delete_key"));
        }
        self.with_tree_mut(|tree| {
            let Tree::Index(entries) = tree else {
                return Ok(false);
            };
            let i = entries.partition_point(|e| cmp_prefix(&e.key, key) == Ordering::Less);
            if entries
                .get(i)
                .is_some_and(|e| cmp_prefix(&e.key, key) == Ordering::Equal)
            {
                entries.remove(i);
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }
}
