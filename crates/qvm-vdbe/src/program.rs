//! The frozen instruction sequence of a ready VM.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use qvm_types::opcode::{Opcode, P4, VdbeOp};

/// An immutable program: every label already replaced by its address.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    ops: Vec<VdbeOp>,
    comments: BTreeMap<usize, String>,
}

impl Program {
    pub(crate) fn new(ops: Vec<VdbeOp>, comments: BTreeMap<usize, String>) -> Self {
        Self { ops, comments }
    }

    pub fn ops(&self) -> &[VdbeOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn get(&self, addr: usize) -> Option<&VdbeOp> {
        self.ops.get(addr)
    }

    pub fn comment(&self, addr: usize) -> Option<&str> {
        self.comments.get(&addr).map(String::as_str)
    }

    /// Disassemble to an EXPLAIN-style listing.
    pub fn explain(&self) -> String {
        render_listing(self.ops.iter().enumerate().map(|(addr, op)| ListingRow {
            addr,
            opcode: op.opcode,
            p1: op.p1,
            p2: op.p2,
            p3: op.p3,
            p4: &op.p4,
            p5: op.p5,
            comment: self.comment(addr),
        }))
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.explain())
    }
}

pub(crate) struct ListingRow<'a> {
    pub addr: usize,
    pub opcode: Opcode,
    pub p1: i32,
    pub p2: i32,
    pub p3: i32,
    pub p4: &'a P4,
    pub p5: u16,
    pub comment: Option<&'a str>,
}

pub(crate) fn render_listing<'a>(rows: impl Iterator<Item = ListingRow<'a>>) -> String {
    let mut out = String::new();
    out.push_str("addr  opcode           p1    p2    p3    p4                 p5  comment\n");
    out.push_str("----  ---------------  ----  ----  ----  -----------------  --  -------\n");

    for row in rows {
        let p4 = row.p4.to_string();
        let line = format!(
            "{:<4}  {:<15}  {:<4}  {:<4}  {:<4}  {:<17}  {:<2}  {}",
            row.addr,
            row.opcode.name(),
            row.p1,
            row.p2,
            row.p3,
            p4,
            row.p5,
            row.comment.unwrap_or(""),
        );
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}
