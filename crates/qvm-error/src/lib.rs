use thiserror::Error;

/// Primary error type for the query VM and its storage boundary.
///
/// Every variant maps onto a shared [`ErrorCode`] so that callers embedding
/// both the VM and the storage engine can handle status with a single path.
/// The type is `Clone` because a halted VM keeps its error and hands it out
/// again on every subsequent step.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VdbeError {
    // === Capacity Errors ===
    /// Register index outside `[1, max]`.
    #[error("register {index} out of bounds (valid range 1..={max})")]
    RegisterOutOfBounds { index: i64, max: usize },

    /// Cursor index outside `[0, max)`.
    #[error("cursor {index} out of bounds (cursor table holds {max})")]
    CursorOutOfBounds { index: i64, max: usize },

    /// Cursor opcode addressed an empty slot.
    #[error("cursor {cursor} is not open")]
    CursorNotOpen { cursor: usize },

    // === Assembly Errors ===
    /// Label was created by a different builder, or never created.
    #[error("unknown label {label}")]
    UnknownLabel { label: i32 },

    /// Label resolved a second time.
    #[error("label {label} already resolved to address {addr}")]
    LabelAlreadyResolved { label: i32, addr: i32 },

    /// A label was still pending when the program was made ready.
    #[error("unresolved label {label} referenced by {refs} instruction(s)")]
    UnresolvedLabel { label: i32, refs: usize },

    /// The operand validation pass found an index outside the declared sizes.
    #[error("instruction {addr} ({opcode}): operand {operand} = {value} outside limit {limit}")]
    OperandOutOfRange {
        addr: usize,
        opcode: &'static str,
        operand: &'static str,
        value: i64,
        limit: i64,
    },

    /// Address does not name an instruction of this program.
    #[error("address {addr} is not an instruction (program has {len})")]
    InvalidAddress { addr: i64, len: usize },

    // === Execution Errors ===
    /// Program stopped through a Halt opcode with a non-zero code.
    #[error("{message}")]
    Halted { code: ErrorCode, message: String },

    /// Value could not be used as the required type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Malformed record payload or storage structure.
    #[error("database disk image is malformed: {detail}")]
    Corrupt { detail: String },

    /// Write attempted through a read-only cursor.
    #[error("attempt to write a readonly cursor")]
    ReadOnly,

    /// Root number does not name a tree in the storage engine.
    #[error("no such table: root {root}")]
    NoSuchTable { root: u32 },

    /// No more rowids can be allocated.
    #[error("database or disk is full")]
    Full,

    /// Value outside an accepted numeric range (bind index, shift, ...).
    #[error("{what} {value} out of range")]
    Range { what: &'static str, value: i64 },

    /// API used in a way that violates its contract.
    #[error("library routine called out of sequence: {0}")]
    Misuse(String),

    /// Step budget exhausted.
    #[error("interrupted after {steps} steps")]
    Interrupt { steps: u64 },

    // === Transient Errors ===
    /// Another owner holds the write lock.
    #[error("database is locked")]
    Busy,

    // === Configuration ===
    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    // === Internal ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Numeric status codes shared between the VM and the storage engine.
///
/// `0` is success; `Row` and `Done` are the two non-error step outcomes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Access permission denied.
    Perm = 3,
    /// Callback routine requested an abort.
    Abort = 4,
    /// The storage engine is locked by another owner.
    Busy = 5,
    /// A table is locked.
    Locked = 6,
    /// Out of memory.
    NoMem = 7,
    /// Attempt to write a read-only target.
    ReadOnly = 8,
    /// Operation terminated by an interrupt.
    Interrupt = 9,
    /// Disk I/O error.
    IoErr = 10,
    /// Malformed storage image.
    Corrupt = 11,
    /// Unknown opcode or missing object.
    NotFound = 12,
    /// Storage full.
    Full = 13,
    /// Unable to open a file.
    CantOpen = 14,
    /// Lock protocol error.
    Protocol = 15,
    /// Internal use only.
    Empty = 16,
    /// Schema changed.
    Schema = 17,
    /// String or blob too big.
    TooBig = 18,
    /// Constraint violation.
    Constraint = 19,
    /// Data type mismatch.
    Mismatch = 20,
    /// Library used incorrectly.
    Misuse = 21,
    /// Large file support unavailable.
    NoLfs = 22,
    /// Authorization denied.
    Auth = 23,
    /// Not used.
    Format = 24,
    /// Parameter or index out of range.
    Range = 25,
    /// Not a database.
    NotADb = 26,
    /// Notification (not an error).
    Notice = 27,
    /// Warning (not an error).
    Warning = 28,
    /// `step()` produced a row.
    Row = 100,
    /// `step()` finished executing.
    Done = 101,
}

impl ErrorCode {
    /// Decode a raw status code, as stored in a Halt opcode's P1.
    ///
    /// Extended codes carry the primary code in the low byte; anything
    /// unknown collapses to [`ErrorCode::Error`].
    pub const fn from_i32(raw: i32) -> Self {
        match raw & 0xff {
            0 => Self::Ok,
            2 => Self::Internal,
            3 => Self::Perm,
            4 => Self::Abort,
            5 => Self::Busy,
            6 => Self::Locked,
            7 => Self::NoMem,
            8 => Self::ReadOnly,
            9 => Self::Interrupt,
            10 => Self::IoErr,
            11 => Self::Corrupt,
            12 => Self::NotFound,
            13 => Self::Full,
            14 => Self::CantOpen,
            15 => Self::Protocol,
            16 => Self::Empty,
            17 => Self::Schema,
            18 => Self::TooBig,
            19 => Self::Constraint,
            20 => Self::Mismatch,
            21 => Self::Misuse,
            22 => Self::NoLfs,
            23 => Self::Auth,
            24 => Self::Format,
            25 => Self::Range,
            26 => Self::NotADb,
            27 => Self::Notice,
            28 => Self::Warning,
            100 => Self::Row,
            101 => Self::Done,
            _ => Self::Error,
        }
    }

    /// Raw numeric value.
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Default message for a code, used when a Halt carries no text.
    pub const fn message(self) -> &'static str {
        match self {
            Self::Ok => "not an error",
            Self::Error | Self::Format | Self::Empty => "SQL logic error",
            Self::Internal => "internal logic error",
            Self::Perm => "access permission denied",
            Self::Abort => "query aborted",
            Self::Busy => "database is locked",
            Self::Locked => "database table is locked",
            Self::NoMem => "out of memory",
            Self::ReadOnly => "attempt to write a readonly database",
            Self::Interrupt => "interrupted",
            Self::IoErr => "disk I/O error",
            Self::Corrupt => "database disk image is malformed",
            Self::NotFound => "unknown operation",
            Self::Full => "database or disk is full",
            Self::CantOpen => "unable to open database file",
            Self::Protocol => "locking protocol",
            Self::Schema => "database schema has changed",
            Self::TooBig => "string or blob too big",
            Self::Constraint => "constraint failed",
            Self::Mismatch => "datatype mismatch",
            Self::Misuse => "bad parameter or other API misuse",
            Self::NoLfs => "large file support is disabled",
            Self::Auth => "authorization denied",
            Self::Range => "column index out of range",
            Self::NotADb => "file is not a database",
            Self::Notice => "notification message",
            Self::Warning => "warning message",
            Self::Row => "another row available",
            Self::Done => "no more rows available",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.as_i32())
    }
}

impl VdbeError {
    /// Map this error to the shared status code.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::RegisterOutOfBounds { .. }
            | Self::CursorOutOfBounds { .. }
            | Self::Range { .. } => ErrorCode::Range,
            Self::CursorNotOpen { .. }
            | Self::UnknownLabel { .. }
            | Self::LabelAlreadyResolved { .. }
            | Self::UnresolvedLabel { .. }
            | Self::Misuse(_) => ErrorCode::Misuse,
            Self::OperandOutOfRange { .. } | Self::InvalidAddress { .. } => ErrorCode::Range,
            Self::Halted { code, .. } => *code,
            Self::TypeMismatch { .. } => ErrorCode::Mismatch,
            Self::Corrupt { .. } => ErrorCode::Corrupt,
            Self::ReadOnly => ErrorCode::ReadOnly,
            Self::NoSuchTable { .. } => ErrorCode::Error,
            Self::Full => ErrorCode::Full,
            Self::Interrupt { .. } => ErrorCode::Interrupt,
            Self::Busy => ErrorCode::Busy,
            Self::Config(_) => ErrorCode::Error,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Whether the error reflects a defect in the assembled program rather
    /// than in the data it ran against.
    pub const fn is_program_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownLabel { .. }
                | Self::LabelAlreadyResolved { .. }
                | Self::UnresolvedLabel { .. }
                | Self::OperandOutOfRange { .. }
                | Self::InvalidAddress { .. }
                | Self::CursorNotOpen { .. }
                | Self::CursorOutOfBounds { .. }
                | Self::RegisterOutOfBounds { .. }
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Busy => Some("Retry the step after a short delay"),
            Self::UnresolvedLabel { .. } => Some("Resolve every label before make_ready"),
            Self::OperandOutOfRange { .. } | Self::RegisterOutOfBounds { .. } => {
                Some("Declare a register count that covers every register the program uses")
            }
            Self::CursorNotOpen { .. } => Some("Emit OpenRead/OpenWrite before using the cursor"),
            Self::Interrupt { .. } => Some("Raise max_steps or simplify the program"),
            _ => None,
        }
    }

    /// Get the process exit code for this error (for CLI use).
    pub const fn exit_code(&self) -> i32 {
        self.error_code() as i32
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a misuse error.
    pub fn misuse(msg: impl Into<String>) -> Self {
        Self::Misuse(msg.into())
    }

    /// Create a corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Create a halt error with an explicit code.
    pub fn halted(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Halted {
            code,
            message: message.into(),
        }
    }
}

/// Result type alias using `VdbeError`.
pub type Result<T> = std::result::Result<T, VdbeError>;
