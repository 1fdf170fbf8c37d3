//! Interfaces of the collaborators the recorder sits between: the
//! process-control layer beneath and the architecture analyzer beside it.

use crate::breakpoints::BreakpointSite;
use std::{fmt, io};

/// Signal numbers, using the debugger's target-independent numbering
#[cfg_attr(
    feature = "fuzzer-not-safe-for-production",
    derive(arbitrary::Arbitrary)
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Signal(pub i32);

impl Signal {
    /// No signal
    pub const NONE: Signal = Signal(0);
    pub const HUP: Signal = Signal(1);
    /// Interrupt
    pub const INT: Signal = Signal(2);
    pub const QUIT: Signal = Signal(3);
    /// Illegal instruction
    pub const ILL: Signal = Signal(4);
    /// Trace/breakpoint trap
    pub const TRAP: Signal = Signal(5);
    pub const ABRT: Signal = Signal(6);
    /// Arithmetic exception
    pub const FPE: Signal = Signal(8);
    pub const KILL: Signal = Signal(9);
    pub const BUS: Signal = Signal(10);
    /// Segmentation fault
    pub const SEGV: Signal = Signal(11);
    pub const TERM: Signal = Signal(15);
    pub const XCPU: Signal = Signal(24);

    /// Whether this is an actual signal
    pub fn is_some(self) -> bool {
        self != Signal::NONE
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Signal::NONE => "0",
            Signal::HUP => "SIGHUP",
            Signal::INT => "SIGINT",
            Signal::QUIT => "SIGQUIT",
            Signal::ILL => "SIGILL",
            Signal::TRAP => "SIGTRAP",
            Signal::ABRT => "SIGABRT",
            Signal::FPE => "SIGFPE",
            Signal::KILL => "SIGKILL",
            Signal::BUS => "SIGBUS",
            Signal::SEGV => "SIGSEGV",
            Signal::TERM => "SIGTERM",
            Signal::XCPU => "SIGXCPU",
            Signal(n) => return write!(f, "signal {n}"),
        };
        f.write_str(name)
    }
}

/// Execution direction of a resume request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

/// Why the debuggee stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// Nothing more specific is known
    #[default]
    None,
    /// A requested single step completed
    SingleStep,
    SoftwareBreakpoint,
    HardwareBreakpoint,
    Watchpoint,
}

/// A stop reported by `wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopEvent {
    pub reason: StopReason,
    pub signal: Signal,
}

/// Which end of the recorded history replay ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEdge {
    Begin,
    End,
}

/// Result of a `wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// No event yet, ask again later
    Ignore,
    /// The debuggee stopped
    Stopped(StopEvent),
    /// The debuggee exited with a status code
    Exited(i32),
    /// Replay ran off one end of the log
    NoHistory(HistoryEdge),
}

impl WaitStatus {
    /// Shorthand for a stop with the given reason and signal
    pub fn stopped(reason: StopReason, signal: Signal) -> Self {
        WaitStatus::Stopped(StopEvent { reason, signal })
    }
}

/// Identifies an address space of the debuggee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AddressSpaceId(pub u32);

/// Failures of the process-control layer
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TargetError {
    /// Register does not exist or has a different width
    #[error("Register {0} is unavailable")]
    RegisterUnavailable(u32),
    /// Memory range is not mapped or not accessible
    #[error("Cannot access memory at {address:#x} (length {len})")]
    MemoryAccess {
        address: u64,
        len: usize,
    },
    /// Breakpoint could not be installed or removed
    #[error("Cannot change breakpoint at {0:#x}")]
    Breakpoint(u64),
    /// The debuggee is gone
    #[error("The program is not being run")]
    NotRunning,
    /// The debuggee is running and cannot be resumed again
    #[error("The program is already running")]
    AlreadyRunning,
    /// Process-state snapshot could not be written or read
    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

/// The process-control layer beneath the recorder.
///
/// `resume` may return before the stop event is available; `wait` then
/// reports [`WaitStatus::Ignore`] until it is.
pub trait ProcessControl {
    /// Resume execution, single-stepping if `step`, delivering `signal`
    fn resume(&mut self, step: bool, signal: Signal) -> Result<(), TargetError>;
    /// Poll for the stop event of the last resume
    fn wait(&mut self) -> Result<WaitStatus, TargetError>;
    /// Read a register's raw bytes; `buf` has the register's width
    fn read_register(&mut self, regno: u32, buf: &mut [u8]) -> Result<(), TargetError>;
    /// Overwrite a register with raw bytes
    fn write_register(&mut self, regno: u32, value: &[u8]) -> Result<(), TargetError>;
    /// Read debuggee memory
    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<(), TargetError>;
    /// Write debuggee memory
    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), TargetError>;
    /// Current program counter
    fn read_pc(&mut self) -> Result<u64, TargetError>;
    /// Install a software breakpoint
    fn insert_breakpoint(&mut self, site: BreakpointSite) -> Result<(), TargetError>;
    /// Remove a software breakpoint
    fn remove_breakpoint(&mut self, site: BreakpointSite) -> Result<(), TargetError>;
    /// Whether the last stop was caused by a watchpoint
    fn stopped_by_watchpoint(&mut self) -> bool;
    /// Whether a hardware watchpoint covers any byte of the range
    fn watchpoint_in_range(&self, address_space: AddressSpaceId, address: u64, len: usize) -> bool;

    /// Address space the current thread executes in
    fn address_space(&self) -> AddressSpaceId {
        AddressSpaceId::default()
    }

    /// Breakpoints already installed before recording started
    fn inserted_breakpoints(&self) -> Vec<BreakpointSite> {
        Vec::new()
    }

    /// Write the process-state snapshot that precedes the record section
    fn write_snapshot(&mut self, _writer: &mut dyn io::Write) -> Result<(), TargetError> {
        Ok(())
    }

    /// Load a process-state snapshot written by `write_snapshot`
    fn read_snapshot(&mut self, _reader: &mut dyn io::Read) -> Result<(), TargetError> {
        Ok(())
    }
}

/// A contiguous memory range an instruction will modify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    /// First byte
    pub address: u64,
    /// Number of bytes
    pub len: usize,
}

/// Everything an instruction is about to change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionEffects {
    /// Registers written by the instruction
    pub registers: Vec<u32>,
    /// Memory written by the instruction
    pub memory: Vec<MemoryRange>,
}

/// Failures of the architecture analyzer
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AnalyzeError {
    /// The instruction cannot be classified
    #[error("Unsupported instruction {word:#010x} at {pc:#x}")]
    Unsupported {
        /// Address of the instruction
        pc: u64,
        /// Raw instruction word
        word: u32,
    },
    /// The instruction or its operands could not be read
    #[error(transparent)]
    Target(#[from] TargetError),
}

/// Per-instruction-set knowledge of which locations an instruction changes
pub trait InstructionAnalyzer {
    /// Decode the instruction at `pc` and list the locations it will change
    fn analyze(
        &mut self,
        target: &mut dyn ProcessControl,
        pc: u64,
    ) -> Result<InstructionEffects, AnalyzeError>;
    /// Register number of the program counter
    fn pc_register(&self) -> u32;
    /// Width of a register in bytes, `None` if it does not exist
    fn register_size(&self, regno: u32) -> Option<usize>;
}
