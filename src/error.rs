//! Error definitions for recording, replay and persistence

use crate::target::TargetError;

/// Errors reported by a [`RecordingSession`](crate::session::RecordingSession)
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The log is full and the investigator refused to evict the oldest instruction
    #[error("Record buffer is full and eviction was declined")]
    CapacityDeclined,
    /// The investigator refused to discard the recorded future
    #[error("Operation cancelled")]
    OperationCancelled,
    /// The sequence number was never committed or has been evicted
    #[error("Instruction {0} not found")]
    InstructionNotFound(u64),
    /// The requested position is the current position
    #[error("Already at instruction {0}")]
    AlreadyThere(u64),
    /// The analyzer could not classify the next instruction
    #[error("Unsupported instruction at {pc:#x}")]
    UnsupportedInstruction {
        /// Program counter of the rejected instruction
        pc: u64,
    },
    /// Restoring requires an empty execution log
    #[error("Execution log is not empty")]
    LogNotEmpty,
    /// `resume` was called twice without collecting the stop in between
    #[error("Target is already resumed")]
    AlreadyResumed,
    /// No breakpoint is known at this site
    #[error("No breakpoint known at {0:#x}")]
    UnknownBreakpoint(u64),
    /// A bookmark token that is not a sequence number
    #[error("Invalid bookmark: {0}")]
    InvalidBookmark(String),
    /// A quoted bookmark token with mismatched quotes
    #[error("Unbalanced quotes: {0}")]
    UnbalancedQuotes(String),
    /// Process control failure
    #[error("Target error: {0}")]
    Target(#[from] TargetError),
    /// Malformed snapshot
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    /// I/O failure while saving or restoring
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in the persisted record section
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FormatError {
    /// Version mismatch or not a record section at all
    #[error("Version mismatch or file format error (magic {0:#010x})")]
    BadMagic(u32),
    /// Record tag outside 0..=2
    #[error("Bad entry type {0} in record section")]
    UnknownRecordTag(u8),
    /// Register record for a register the architecture does not have
    #[error("Unknown register {0} in record section")]
    UnknownRegister(u32),
    /// The section ended in the middle of a record
    #[error("Record section is truncated")]
    Truncated,
    /// Register or memory records after the last boundary
    #[error("Record section ends with an incomplete instruction")]
    IncompleteInstruction,
    /// Boundary sequence numbers must strictly increase
    #[error("Sequence number {next} follows {previous}")]
    NonMonotonicSequence {
        /// Sequence of the preceding boundary
        previous: u64,
        /// Offending sequence
        next: u64,
    },
    /// Sequence number does not fit the 4-byte wire field
    #[error("Sequence number {0} does not fit the record format")]
    SequenceOverflow(u64),
    /// Memory entry longer than the 4-byte wire field allows
    #[error("Memory entry of {0} bytes does not fit the record format")]
    LengthOverflow(usize),
}

impl RecordError {
    /// Format errors are the only kind that cannot be recovered in place
    pub fn is_fatal(&self) -> bool {
        matches!(self, RecordError::Format(_))
    }
}
