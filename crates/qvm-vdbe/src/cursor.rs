//! Cursor table: fixed-size slots holding storage-engine cursors.
//!
//! Slots are only opened, used and closed by opcode execution; the public
//! surface is limited to capacity introspection.

use qvm_error::{Result, VdbeError};
use qvm_storage::StorageCursor;

#[derive(Debug)]
pub(crate) struct CursorSlot {
    pub cursor: Box<dyn StorageCursor>,
    /// Set by `NullRow`: reads see an all-NULL row until the next move.
    pub null_row: bool,
}

/// Fixed-size table of cursor slots, indexed `0..len`.
#[derive(Debug, Default)]
pub struct CursorTable {
    slots: Vec<Option<CursorSlot>>,
}

impl CursorTable {
    pub(crate) fn new(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Self { slots }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots currently bound to a cursor.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    #[allow(clippy::cast_sign_loss)]
    pub(crate) fn check(&self, index: i32) -> Result<usize> {
        if index < 0 || index as usize >= self.slots.len() {
            return Err(VdbeError::CursorOutOfBounds {
                index: i64::from(index),
                max: self.slots.len(),
            });
        }
        Ok(index as usize)
    }

    /// Bind a cursor to a slot, closing whatever was there.
    pub(crate) fn open(&mut self, index: i32, cursor: Box<dyn StorageCursor>) -> Result<()> {
        let i = self.check(index)?;
        self.slots[i] = Some(CursorSlot {
            cursor,
            null_row: false,
        });
        Ok(())
    }

    pub(crate) fn close(&mut self, index: i32) -> Result<()> {
        let i = self.check(index)?;
        self.slots[i] = None;
        Ok(())
    }

    pub(crate) fn is_open(&self, index: i32) -> Result<bool> {
        let i = self.check(index)?;
        Ok(self.slots[i].is_some())
    }

    pub(crate) fn get(&self, index: i32) -> Result<&CursorSlot> {
        let i = self.check(index)?;
        self.slots[i]
            .as_ref()
            .ok_or(VdbeError::CursorNotOpen { cursor: i })
    }

    pub(crate) fn get_mut(&mut self, index: i32) -> Result<&mut CursorSlot> {
        let i = self.check(index)?;
        self.slots[i]
            .as_mut()
            .ok_or(VdbeError::CursorNotOpen { cursor: i })
    }

    pub(crate) fn close_all(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}
