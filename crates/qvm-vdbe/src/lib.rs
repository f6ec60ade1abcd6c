//! Register-based bytecode VM.
//!
//! A program is assembled through a [`ProgramBuilder`] (state `Init`),
//! turned into an executable [`Vdbe`] by [`ProgramBuilder::make_ready`]
//! (state `Ready`), then stepped one instruction at a time until it halts.
//! The two handles are distinct types, so appending after readiness or
//! stepping before it cannot be expressed.
//!
//! ```
//! use qvm_vdbe::{Connection, Insn, StepResult};
//!
//! let conn = Connection::open_in_memory();
//! let mut b = conn.new_program();
//! let r = b.alloc_register();
//! b.add(Insn::Integer { value: 42, dest: r });
//! b.add(Insn::ResultRow { start: r, count: 1 });
//! b.add(Insn::Halt);
//!
//! let mut vm = b.finish()?;
//! assert_eq!(vm.step()?, StepResult::Continue);
//! assert_eq!(vm.step()?, StepResult::Continue);
//! assert_eq!(vm.step()?, StepResult::Row);
//! assert_eq!(vm.column_int64(0), 42);
//! assert_eq!(vm.step()?, StepResult::Done);
//! # Ok::<(), qvm_vdbe::VdbeError>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

mod arith;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod engine;
pub mod insn;
pub mod program;
pub mod validate;

pub use config::VdbeConfig;
pub use connection::Connection;
pub use engine::{StepResult, Vdbe};
pub use insn::Insn;
pub use program::Program;
pub use qvm_error::{ErrorCode, Result, VdbeError};
pub use qvm_types::opcode::{Opcode, P4, VdbeOp};
pub use qvm_types::{Affinity, Value, ValueType};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for builders and VMs. A VM uses its id as its lock
/// owner identity in the storage engine.
pub(crate) fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

// ── Lifecycle State ─────────────────────────────────────────────────────────

/// Lifecycle state of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VdbeState {
    /// Being assembled ([`ProgramBuilder`]).
    Init,
    /// Sized and ready, not yet stepped.
    Ready,
    /// At least one step taken, not halted.
    Running,
    /// Terminated by completion, error, or an explicit Halt.
    Halted,
}

impl fmt::Display for VdbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Halted => "HALTED",
        })
    }
}

// ── Label System ────────────────────────────────────────────────────────────

/// An opaque handle for a jump target whose address is not known yet.
///
/// Labels belong to the builder that created them; using one with another
/// builder is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label {
    builder: u64,
    index: u32,
}

impl Label {
    /// The negative placeholder id shown in listings before resolution.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn raw(self) -> i32 {
        -(self.index as i32) - 1
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw())
    }
}

/// An instruction operand during assembly: either a concrete value or a
/// label that is replaced by its address when the program is made ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Imm(i32),
    Label(Label),
}

impl From<i32> for Operand {
    fn from(v: i32) -> Self {
        Self::Imm(v)
    }
}

impl From<usize> for Operand {
    fn from(addr: usize) -> Self {
        Self::Imm(i32::try_from(addr).unwrap_or(i32::MAX))
    }
}

impl From<Label> for Operand {
    fn from(label: Label) -> Self {
        Self::Label(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct AsmOp {
    opcode: Opcode,
    p1: Operand,
    p2: Operand,
    p3: Operand,
    p4: P4,
    p5: u16,
}

// ── Register Allocator ──────────────────────────────────────────────────────

/// Sequential register allocator.
///
/// Registers are numbered from 1; register 0 is never handed out. Temporary
/// registers can be returned to a pool for reuse.
#[derive(Debug)]
pub struct RegisterAllocator {
    next_reg: i32,
    temp_pool: Vec<i32>,
}

impl RegisterAllocator {
    pub fn new() -> Self {
        Self {
            next_reg: 1,
            temp_pool: Vec::new(),
        }
    }

    pub fn alloc_reg(&mut self) -> i32 {
        let reg = self.next_reg;
        self.next_reg += 1;
        reg
    }

    /// Allocate `n` consecutive registers, returning the first.
    pub fn alloc_regs(&mut self, n: i32) -> i32 {
        let first = self.next_reg;
        self.next_reg += n.max(0);
        first
    }

    /// Allocate a temporary register, reusing a freed one when possible.
    pub fn alloc_temp(&mut self) -> i32 {
        self.temp_pool.pop().unwrap_or_else(|| self.alloc_reg())
    }

    pub fn free_temp(&mut self, reg: i32) {
        self.temp_pool.push(reg);
    }

    /// High-water mark: number of registers a register file must hold.
    #[allow(clippy::cast_sign_loss)]
    pub fn count(&self) -> usize {
        (self.next_reg - 1) as usize
    }
}

impl Default for RegisterAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Program Builder ─────────────────────────────────────────────────────────

/// A program under construction (state `Init`).
///
/// Address 0 always holds an `Init` instruction jumping to address 1, so
/// the first caller instruction lands at address 1.
#[derive(Debug)]
pub struct ProgramBuilder {
    id: u64,
    conn: Connection,
    config: VdbeConfig,
    ops: Vec<AsmOp>,
    comments: BTreeMap<usize, String>,
    /// Resolved address per label, indexed by `Label::index`.
    labels: Vec<Option<usize>>,
    regs: RegisterAllocator,
    next_cursor: i32,
}

impl ProgramBuilder {
    /// Start a program bound to `conn`, inheriting its configuration.
    pub fn new(conn: &Connection) -> Self {
        let mut b = Self {
            id: next_instance_id(),
            conn: conn.clone(),
            config: conn.config().clone(),
            ops: Vec::new(),
            comments: BTreeMap::new(),
            labels: Vec::new(),
            regs: RegisterAllocator::new(),
            next_cursor: 0,
        };
        b.append(Opcode::Init, 0, 1, 0);
        b
    }

    // ── Instruction emission ────────────────────────────────────────────

    /// Append an instruction and return its address. Operands are not
    /// validated here.
    pub fn append(
        &mut self,
        opcode: Opcode,
        p1: impl Into<Operand>,
        p2: impl Into<Operand>,
        p3: impl Into<Operand>,
    ) -> usize {
        self.append_with_p4(opcode, p1, p2, p3, P4::None, 0)
    }

    /// Append an instruction with P4 and P5 operands.
    pub fn append_with_p4(
        &mut self,
        opcode: Opcode,
        p1: impl Into<Operand>,
        p2: impl Into<Operand>,
        p3: impl Into<Operand>,
        p4: P4,
        p5: u16,
    ) -> usize {
        let addr = self.ops.len();
        self.ops.push(AsmOp {
            opcode,
            p1: p1.into(),
            p2: p2.into(),
            p3: p3.into(),
            p4,
            p5,
        });
        addr
    }

    /// Append a typed instruction.
    pub fn add(&mut self, insn: Insn) -> usize {
        let parts = insn.lower();
        self.append_with_p4(parts.opcode, parts.p1, parts.p2, parts.p3, parts.p4, parts.p5)
    }

    /// Append a typed instruction with a comment shown by [`explain`](Self::explain).
    pub fn add_with_comment(&mut self, insn: Insn, comment: &str) -> usize {
        let addr = self.add(insn);
        self.comments.insert(addr, comment.to_owned());
        addr
    }

    /// Address the next appended instruction will get.
    pub fn current_addr(&self) -> usize {
        self.ops.len()
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Point P2 of the jump at `addr` to the current end of the program.
    pub fn jump_here(&mut self, addr: usize) -> Result<()> {
        let here = Operand::from(self.ops.len());
        self.op_mut(addr)?.p2 = here;
        Ok(())
    }

    /// Replace P5 of the instruction at `addr`.
    pub fn change_p5(&mut self, addr: usize, p5: u16) -> Result<()> {
        self.op_mut(addr)?.p5 = p5;
        Ok(())
    }

    fn op_mut(&mut self, addr: usize) -> Result<&mut AsmOp> {
        let len = self.ops.len();
        self.ops.get_mut(addr).ok_or(VdbeError::InvalidAddress {
            addr: i64::try_from(addr).unwrap_or(i64::MAX),
            len,
        })
    }

    // ── Label system ────────────────────────────────────────────────────

    /// Create a fresh, unresolved label.
    pub fn create_label(&mut self) -> Label {
        let index = u32::try_from(self.labels.len()).unwrap_or(u32::MAX);
        self.labels.push(None);
        Label {
            builder: self.id,
            index,
        }
    }

    /// Bind `label` to the address of the next instruction appended.
    pub fn resolve_label(&mut self, label: Label) -> Result<()> {
        self.resolve_label_to(label, self.ops.len())
    }

    /// Bind `label` to an explicit address.
    pub fn resolve_label_to(&mut self, label: Label, addr: usize) -> Result<()> {
        let slot = self.label_slot(label)?;
        if let Some(prev) = *slot {
            return Err(VdbeError::LabelAlreadyResolved {
                label: label.raw(),
                addr: i32::try_from(prev).unwrap_or(i32::MAX),
            });
        }
        *slot = Some(addr);
        Ok(())
    }

    fn label_slot(&mut self, label: Label) -> Result<&mut Option<usize>> {
        if label.builder != self.id {
            return Err(VdbeError::UnknownLabel { label: label.raw() });
        }
        self.labels
            .get_mut(label.index as usize)
            .ok_or(VdbeError::UnknownLabel { label: label.raw() })
    }

    fn label_target(&self, label: Label) -> Result<Option<usize>> {
        if label.builder != self.id {
            return Err(VdbeError::UnknownLabel { label: label.raw() });
        }
        self.labels
            .get(label.index as usize)
            .copied()
            .ok_or(VdbeError::UnknownLabel { label: label.raw() })
    }

    fn label_refs(&self, label: Label) -> usize {
        let op = Operand::Label(label);
        self.ops
            .iter()
            .filter(|o| o.p1 == op || o.p2 == op || o.p3 == op)
            .count()
    }

    fn resolve_operand(&self, operand: Operand) -> Result<i32> {
        match operand {
            Operand::Imm(v) => Ok(v),
            Operand::Label(label) => match self.label_target(label)? {
                Some(addr) => Ok(i32::try_from(addr).unwrap_or(i32::MAX)),
                None => Err(VdbeError::UnresolvedLabel {
                    label: label.raw(),
                    refs: self.label_refs(label),
                }),
            },
        }
    }

    /// Value shown in listings: the target once resolved, the negative
    /// placeholder before.
    fn display_operand(&self, operand: Operand) -> i32 {
        match operand {
            Operand::Imm(v) => v,
            Operand::Label(label) => match self.label_target(label) {
                Ok(Some(addr)) => i32::try_from(addr).unwrap_or(i32::MAX),
                _ => label.raw(),
            },
        }
    }

    // ── Register and cursor allocation ──────────────────────────────────

    pub fn alloc_register(&mut self) -> i32 {
        self.regs.alloc_reg()
    }

    /// Allocate `n` consecutive registers, returning the first.
    pub fn alloc_registers(&mut self, n: i32) -> i32 {
        self.regs.alloc_regs(n)
    }

    pub fn alloc_temp(&mut self) -> i32 {
        self.regs.alloc_temp()
    }

    pub fn free_temp(&mut self, reg: i32) {
        self.regs.free_temp(reg);
    }

    /// Allocate a cursor slot. Cursors are numbered from 0.
    pub fn alloc_cursor(&mut self) -> i32 {
        let c = self.next_cursor;
        self.next_cursor += 1;
        c
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub const fn state(&self) -> VdbeState {
        VdbeState::Init
    }

    /// Registers allocated so far.
    pub fn register_count(&self) -> usize {
        self.regs.count()
    }

    /// Cursor slots allocated so far.
    #[allow(clippy::cast_sign_loss)]
    pub fn cursor_count(&self) -> usize {
        self.next_cursor as usize
    }

    pub fn config(&self) -> &VdbeConfig {
        &self.config
    }

    /// Override the configuration inherited from the connection.
    pub fn set_config(&mut self, config: VdbeConfig) {
        self.config = config;
    }

    /// EXPLAIN-style listing; unresolved labels appear as negative ids.
    pub fn explain(&self) -> String {
        let rows = self.ops.iter().enumerate().map(|(addr, op)| program::ListingRow {
            addr,
            opcode: op.opcode,
            p1: self.display_operand(op.p1),
            p2: self.display_operand(op.p2),
            p3: self.display_operand(op.p3),
            p4: &op.p4,
            p5: op.p5,
            comment: self.comments.get(&addr).map(String::as_str),
        });
        program::render_listing(rows)
    }

    // ── Readiness ───────────────────────────────────────────────────────

    /// Freeze the program and size the register file and cursor table.
    ///
    /// Every label operand is replaced by its address here; a label still
    /// pending fails with [`VdbeError::UnresolvedLabel`]. With
    /// `validate_operands` set, every register, cursor and jump operand is
    /// also checked against the declared sizes.
    pub fn make_ready(self, register_count: usize, cursor_count: usize) -> Result<Vdbe> {
        let _span = tracing::debug_span!(
            "vdbe.make_ready",
            ops = self.ops.len(),
            register_count,
            cursor_count,
        )
        .entered();

        let ops = self
            .ops
            .iter()
            .map(|op| {
                Ok(VdbeOp {
                    opcode: op.opcode,
                    p1: self.resolve_operand(op.p1)?,
                    p2: self.resolve_operand(op.p2)?,
                    p3: self.resolve_operand(op.p3)?,
                    p4: op.p4.clone(),
                    p5: op.p5,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if self.config.validate_operands {
            validate::validate_operands(&ops, register_count, cursor_count)?;
        }

        debug!(
            ops = ops.len(),
            register_count,
            cursor_count,
            validated = self.config.validate_operands,
            "program ready"
        );

        let program = Program::new(ops, self.comments);
        Ok(Vdbe::new(
            self.conn,
            self.config,
            program,
            register_count,
            cursor_count,
        ))
    }

    /// [`make_ready`](Self::make_ready) with the allocator's register and
    /// cursor counts.
    pub fn finish(self) -> Result<Vdbe> {
        let registers = self.register_count();
        let cursors = self.cursor_count();
        self.make_ready(registers, cursors)
    }
}

impl fmt::Display for ProgramBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.explain())
    }
}
