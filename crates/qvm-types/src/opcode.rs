use std::fmt;

/// VM opcodes.
///
/// Operand conventions follow the engine's bytecode: arithmetic computes
/// `r[P3] = r[P2] op r[P1]`, comparisons jump to P2 when `r[P3] op r[P1]`,
/// and cursor opcodes take the cursor number in P1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Opcode {
    // === Control Flow ===
    /// Start of program: jump to P2.
    Init = 1,
    /// Unconditional jump to P2.
    Goto = 2,
    /// Store the current address in r[P1], jump to P2.
    Gosub = 3,
    /// Jump to r[P1] + 1.
    Return = 4,
    /// r[P1] = P3 - 1; jump to P2 if non-zero.
    InitCoroutine = 5,
    /// End a coroutine: resume at P2 of the Yield that last entered it.
    EndCoroutine = 6,
    /// Swap the current address with r[P1] and continue there. P2 is where
    /// the caller resumes once the coroutine ends.
    Yield = 7,
    /// Stop. P1 is the status code, P4 an optional message.
    Halt = 8,
    /// Halt with code P1 if r[P3] is NULL.
    HaltIfNull = 9,
    /// Jump to P2 if r[P1] is true (or NULL and P3 != 0).
    If = 10,
    /// Jump to P2 if r[P1] is false (or NULL and P3 != 0).
    IfNot = 11,
    /// Jump to P2 if r[P1] is NULL.
    IsNull = 12,
    /// Jump to P2 if r[P1] is not NULL.
    NotNull = 13,
    /// Fall through the first time, jump to P2 afterwards.
    Once = 14,
    /// Jump to P1, P2 or P3 by the result of the last Compare.
    Jump = 15,
    /// Jump to P2 if r[P3] == r[P1].
    Eq = 16,
    /// Jump to P2 if r[P3] != r[P1].
    Ne = 17,
    /// Jump to P2 if r[P3] < r[P1].
    Lt = 18,
    /// Jump to P2 if r[P3] <= r[P1].
    Le = 19,
    /// Jump to P2 if r[P3] > r[P1].
    Gt = 20,
    /// Jump to P2 if r[P3] >= r[P1].
    Ge = 21,
    /// Compare r[P1..P1+P3] with r[P2..P2+P3] for a following Jump.
    Compare = 22,
    /// If r[P1] > 0, subtract P3 and jump to P2.
    IfPos = 23,
    /// If r[P1] != 0, decrement a positive value and jump to P2.
    IfNotZero = 24,
    /// Decrement r[P1]; jump to P2 if it became zero.
    DecrJumpZero = 25,
    /// Make r[P1] an integer or jump to P2 (error if P2 is 0).
    MustBeInt = 26,
    /// Do nothing.
    Noop = 27,

    // === Constants ===
    /// r[P2] = P1.
    Integer = 28,
    /// r[P2] = P4 (64-bit integer).
    Int64 = 29,
    /// r[P2] = P4 (real).
    Real = 30,
    /// r[P2] = P4 (text).
    String8 = 31,
    /// r[P2..=P3] = NULL.
    Null = 32,
    /// r[P1] = NULL.
    SoftNull = 33,
    /// r[P2] = P4 (blob).
    Blob = 34,
    /// r[P2] = bound parameter P1.
    Variable = 35,

    // === Register Moves ===
    /// Move P3 registers from P1 to P2, leaving the sources NULL.
    Move = 36,
    /// Copy P3 + 1 registers from P1 to P2.
    Copy = 37,
    /// r[P2] = r[P1].
    SCopy = 38,
    /// r[P2] = integer value of r[P1].
    IntCopy = 39,
    /// Output r[P1..P1+P2] as a row.
    ResultRow = 40,

    // === Arithmetic & Logic ===
    /// r[P3] = r[P1] + r[P2].
    Add = 41,
    /// r[P3] = r[P2] - r[P1].
    Subtract = 42,
    /// r[P3] = r[P1] * r[P2].
    Multiply = 43,
    /// r[P3] = r[P2] / r[P1].
    Divide = 44,
    /// r[P3] = r[P2] % r[P1].
    Remainder = 45,
    /// r[P3] = r[P2] || r[P1].
    Concat = 46,
    /// r[P3] = r[P1] & r[P2].
    BitAnd = 47,
    /// r[P3] = r[P1] | r[P2].
    BitOr = 48,
    /// r[P3] = r[P2] << r[P1].
    ShiftLeft = 49,
    /// r[P3] = r[P2] >> r[P1].
    ShiftRight = 50,
    /// r[P2] = ~r[P1].
    BitNot = 51,
    /// r[P2] = NOT r[P1].
    Not = 52,
    /// r[P3] = r[P1] AND r[P2].
    And = 53,
    /// r[P3] = r[P1] OR r[P2].
    Or = 54,
    /// r[P1] += P2.
    AddImm = 55,
    /// Convert r[P1] to affinity P2.
    Cast = 56,
    /// Convert an integer r[P1] to real.
    RealAffinity = 57,
    /// r[P2] = truth of r[P1] (P3 if NULL), inverted when P4 is non-zero.
    IsTrue = 58,

    // === Storage ===
    /// Begin a read (P2 = 0) or write (P2 != 0) transaction.
    Transaction = 59,
    /// Open read cursor P1 on root P2.
    OpenRead = 60,
    /// Open write cursor P1 on root P2.
    OpenWrite = 61,
    /// Open cursor P1 on a private temporary tree.
    OpenEphemeral = 62,
    /// Close cursor P1.
    Close = 63,
    /// Jump to P2 if cursor P1 is not open.
    IfNotOpen = 64,
    /// Move cursor P1 to the first entry; jump to P2 if empty.
    Rewind = 65,
    /// Move cursor P1 to the last entry; jump to P2 if empty.
    Last = 66,
    /// Advance cursor P1; jump to P2 if another entry exists.
    Next = 67,
    /// Step cursor P1 backwards; jump to P2 if another entry exists.
    Prev = 68,
    /// Seek cursor P1 to rowid r[P3]; jump to P2 if absent.
    SeekRowid = 69,
    /// Like SeekRowid, but r[P3] is known to be an integer.
    NotExists = 70,
    /// Seek to the first entry >= key; jump to P2 if none.
    SeekGE = 71,
    /// Seek to the first entry > key; jump to P2 if none.
    SeekGT = 72,
    /// Seek to the last entry <= key; jump to P2 if none.
    SeekLE = 73,
    /// Seek to the last entry < key; jump to P2 if none.
    SeekLT = 74,
    /// Jump to P2 if an index entry matches the key.
    Found = 75,
    /// Jump to P2 if no index entry matches the key.
    NotFound = 76,
    /// r[P3] = column P2 of the row under cursor P1.
    Column = 77,
    /// r[P2] = rowid under cursor P1.
    Rowid = 78,
    /// Make cursor P1 read as an all-NULL row.
    NullRow = 79,
    /// r[P2] = a rowid not yet used in cursor P1's table.
    NewRowid = 80,
    /// Insert record r[P2] with rowid r[P3] through cursor P1.
    Insert = 81,
    /// Delete the entry under cursor P1.
    Delete = 82,
    /// r[P3] = record built from r[P1..P1+P2].
    MakeRecord = 83,
    /// Insert record r[P2] into index cursor P1.
    IdxInsert = 84,
    /// Delete the index entry matching r[P2..P2+P3].
    IdxDelete = 85,
    /// r[P2] = rowid stored in the index entry under cursor P1.
    IdxRowid = 86,
    /// r[P2] = number of entries in cursor P1's tree.
    Count = 87,
}

impl Opcode {
    /// Every opcode, in discriminant order.
    pub const ALL: [Self; 87] = [
        Self::Init,
        Self::Goto,
        Self::Gosub,
        Self::Return,
        Self::InitCoroutine,
        Self::EndCoroutine,
        Self::Yield,
        Self::Halt,
        Self::HaltIfNull,
        Self::If,
        Self::IfNot,
        Self::IsNull,
        Self::NotNull,
        Self::Once,
        Self::Jump,
        Self::Eq,
        Self::Ne,
        Self::Lt,
        Self::Le,
        Self::Gt,
        Self::Ge,
        Self::Compare,
        Self::IfPos,
        Self::IfNotZero,
        Self::DecrJumpZero,
        Self::MustBeInt,
        Self::Noop,
        Self::Integer,
        Self::Int64,
        Self::Real,
        Self::String8,
        Self::Null,
        Self::SoftNull,
        Self::Blob,
        Self::Variable,
        Self::Move,
        Self::Copy,
        Self::SCopy,
        Self::IntCopy,
        Self::ResultRow,
        Self::Add,
        Self::Subtract,
        Self::Multiply,
        Self::Divide,
        Self::Remainder,
        Self::Concat,
        Self::BitAnd,
        Self::BitOr,
        Self::ShiftLeft,
        Self::ShiftRight,
        Self::BitNot,
        Self::Not,
        Self::And,
        Self::Or,
        Self::AddImm,
        Self::Cast,
        Self::RealAffinity,
        Self::IsTrue,
        Self::Transaction,
        Self::OpenRead,
        Self::OpenWrite,
        Self::OpenEphemeral,
        Self::Close,
        Self::IfNotOpen,
        Self::Rewind,
        Self::Last,
        Self::Next,
        Self::Prev,
        Self::SeekRowid,
        Self::NotExists,
        Self::SeekGE,
        Self::SeekGT,
        Self::SeekLE,
        Self::SeekLT,
        Self::Found,
        Self::NotFound,
        Self::Column,
        Self::Rowid,
        Self::NullRow,
        Self::NewRowid,
        Self::Insert,
        Self::Delete,
        Self::MakeRecord,
        Self::IdxInsert,
        Self::IdxDelete,
        Self::IdxRowid,
        Self::Count,
    ];

    /// Total number of opcodes.
    pub const COUNT: usize = Self::ALL.len();

    /// The opcode's name as shown in EXPLAIN output.
    #[allow(clippy::too_many_lines)]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Goto => "Goto",
            Self::Gosub => "Gosub",
            Self::Return => "Return",
            Self::InitCoroutine => "InitCoroutine",
            Self::EndCoroutine => "EndCoroutine",
            Self::Yield => "Yield",
            Self::Halt => "Halt",
            Self::HaltIfNull => "HaltIfNull",
            Self::If => "If",
            Self::IfNot => "IfNot",
            Self::IsNull => "IsNull",
            Self::NotNull => "NotNull",
            Self::Once => "Once",
            Self::Jump => "Jump",
            Self::Eq => "Eq",
            Self::Ne => "Ne",
            Self::Lt => "Lt",
            Self::Le => "Le",
            Self::Gt => "Gt",
            Self::Ge => "Ge",
            Self::Compare => "Compare",
            Self::IfPos => "IfPos",
            Self::IfNotZero => "IfNotZero",
            Self::DecrJumpZero => "DecrJumpZero",
            Self::MustBeInt => "MustBeInt",
            Self::Noop => "Noop",
            Self::Integer => "Integer",
            Self::Int64 => "Int64",
            Self::Real => "Real",
            Self::String8 => "String8",
            Self::Null => "Null",
            Self::SoftNull => "SoftNull",
            Self::Blob => "Blob",
            Self::Variable => "Variable",
            Self::Move => "Move",
            Self::Copy => "Copy",
            Self::SCopy => "SCopy",
            Self::IntCopy => "IntCopy",
            Self::ResultRow => "ResultRow",
            Self::Add => "Add",
            Self::Subtract => "Subtract",
            Self::Multiply => "Multiply",
            Self::Divide => "Divide",
            Self::Remainder => "Remainder",
            Self::Concat => "Concat",
            Self::BitAnd => "BitAnd",
            Self::BitOr => "BitOr",
            Self::ShiftLeft => "ShiftLeft",
            Self::ShiftRight => "ShiftRight",
            Self::BitNot => "BitNot",
            Self::Not => "Not",
            Self::And => "And",
            Self::Or => "Or",
            Self::AddImm => "AddImm",
            Self::Cast => "Cast",
            Self::RealAffinity => "RealAffinity",
            Self::IsTrue => "IsTrue",
            Self::Transaction => "Transaction",
            Self::OpenRead => "OpenRead",
            Self::OpenWrite => "OpenWrite",
            Self::OpenEphemeral => "OpenEphemeral",
            Self::Close => "Close",
            Self::IfNotOpen => "IfNotOpen",
            Self::Rewind => "Rewind",
            Self::Last => "Last",
            Self::Next => "Next",
            Self::Prev => "Prev",
            Self::SeekRowid => "SeekRowid",
            Self::NotExists => "NotExists",
            Self::SeekGE => "SeekGE",
            Self::SeekGT => "SeekGT",
            Self::SeekLE => "SeekLE",
            Self::SeekLT => "SeekLT",
            Self::Found => "Found",
            Self::NotFound => "NotFound",
            Self::Column => "Column",
            Self::Rowid => "Rowid",
            Self::NullRow => "NullRow",
            Self::NewRowid => "NewRowid",
            Self::Insert => "Insert",
            Self::Delete => "Delete",
            Self::MakeRecord => "MakeRecord",
            Self::IdxInsert => "IdxInsert",
            Self::IdxDelete => "IdxDelete",
            Self::IdxRowid => "IdxRowid",
            Self::Count => "Count",
        }
    }

    /// Decode an opcode from its byte value.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        if byte == 0 || byte as usize > Self::COUNT {
            return None;
        }
        Some(Self::ALL[byte as usize - 1])
    }

    /// Whether P2 of this opcode is a jump target.
    pub const fn is_jump(self) -> bool {
        matches!(
            self,
            Self::Init
                | Self::Goto
                | Self::Gosub
                | Self::InitCoroutine
                | Self::Yield
                | Self::If
                | Self::IfNot
                | Self::IsNull
                | Self::NotNull
                | Self::Once
                | Self::Jump
                | Self::Eq
                | Self::Ne
                | Self::Lt
                | Self::Le
                | Self::Gt
                | Self::Ge
                | Self::IfPos
                | Self::IfNotZero
                | Self::DecrJumpZero
                | Self::MustBeInt
                | Self::IfNotOpen
                | Self::Rewind
                | Self::Last
                | Self::Next
                | Self::Prev
                | Self::SeekRowid
                | Self::NotExists
                | Self::SeekGE
                | Self::SeekGT
                | Self::SeekLE
                | Self::SeekLT
                | Self::Found
                | Self::NotFound
        )
    }

    /// Whether P1 names a cursor.
    pub const fn uses_cursor(self) -> bool {
        (self as u8) >= (Self::OpenRead as u8)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Comparison flag: NULL compares equal to NULL.
pub const CMP_NULLEQ: u16 = 0x80;
/// Comparison flag: jump when either operand is NULL.
pub const CMP_JUMPIFNULL: u16 = 0x10;

/// A single VM instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct VdbeOp {
    /// The opcode.
    pub opcode: Opcode,
    /// First operand (typically a register or cursor number).
    pub p1: i32,
    /// Second operand (often a jump target address).
    pub p2: i32,
    /// Third operand.
    pub p3: i32,
    /// Fourth operand (constant payload).
    pub p4: P4,
    /// Fifth operand (flags).
    pub p5: u16,
}

impl VdbeOp {
    pub const fn new(opcode: Opcode, p1: i32, p2: i32, p3: i32) -> Self {
        Self {
            opcode,
            p1,
            p2,
            p3,
            p4: P4::None,
            p5: 0,
        }
    }
}

/// The P4 operand of an instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum P4 {
    /// No P4 value.
    None,
    /// A 32-bit integer value.
    Int(i32),
    /// A 64-bit integer value.
    Int64(i64),
    /// A 64-bit float value.
    Real(f64),
    /// A string value.
    Str(String),
    /// A blob value.
    Blob(Vec<u8>),
    /// Key layout for an index tree: number of key fields.
    KeyInfo(u16),
}

impl P4 {
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for P4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Int(v) => write!(f, "(int){v}"),
            Self::Int64(v) => write!(f, "(i64){v}"),
            Self::Real(v) => write!(f, "(real){v}"),
            Self::Str(s) => write!(f, "(str){s}"),
            Self::Blob(b) => write!(f, "(blob)[{}B]", b.len()),
            Self::KeyInfo(n) => write!(f, "k({n})"),
        }
    }
}
