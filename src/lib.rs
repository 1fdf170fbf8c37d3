//! Reversible execution log for time-travel debugging of RISC-V programs.
//!
//! A [`RecordingSession`](session::RecordingSession) sits between a debugger
//! front-end and a debuggee's process control. While live it single-steps the
//! debuggee and logs, before every instruction, the registers and memory the
//! instruction is about to change. The log can then be replayed backward and
//! forward, saved to a file and restored later.
//!
//! The [`vm`] module provides a small RV64IM machine that implements
//! [`ProcessControl`](target::ProcessControl) so that sessions can be driven
//! without a real process.

pub mod assembler;
pub mod breakpoints;
pub mod codec;
pub mod elf;
pub mod error;
pub mod execution_log;
pub mod memory_region;
mod record;
mod replay;
pub mod riscv;
pub mod session;
pub mod static_analysis;
pub mod target;
pub mod vm;

pub use crate::{
    breakpoints::BreakpointSite,
    error::{FormatError, RecordError},
    execution_log::{EntryId, ExecutionLog, LogEntry},
    session::{Config, Confirm, InterruptHandle, RecordInfo, RecordingSession},
    target::{
        Direction, HistoryEdge, InstructionAnalyzer, ProcessControl, Signal, StopReason,
        WaitStatus,
    },
};
