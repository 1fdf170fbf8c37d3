//! Accumulates the pre-instruction values of one instruction before it is
//! committed to the [`ExecutionLog`](crate::execution_log::ExecutionLog).

use crate::{
    execution_log::LogEntry,
    target::{MemoryRange, ProcessControl, TargetError},
};

/// Pending entries of the instruction about to execute
#[derive(Debug, Default)]
pub struct InstructionAssembler {
    pc: u64,
    entries: Vec<LogEntry>,
}

impl InstructionAssembler {
    /// Starts a buffer for the instruction at `pc`
    pub fn new(pc: u64) -> Self {
        Self {
            pc,
            entries: Vec::new(),
        }
    }

    /// Address of the instruction being assembled
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Entries captured so far
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Whether `regno` is already captured
    pub fn has_register(&self, regno: u32) -> bool {
        self.entries
            .iter()
            .any(|entry| matches!(entry, LogEntry::Register { regno: r, .. } if *r == regno))
    }

    /// Captures the current value of a register.
    ///
    /// Unlike memory, an unreadable register fails the whole instruction.
    pub fn add_register<T: ProcessControl + ?Sized>(
        &mut self,
        target: &mut T,
        regno: u32,
        width: usize,
    ) -> Result<(), TargetError> {
        if self.has_register(regno) {
            return Ok(());
        }
        let mut value = vec![0u8; width];
        target.read_register(regno, &mut value)?;
        log::trace!("add register {regno} ({width} bytes) for insn at {:#x}", self.pc);
        self.entries.push(LogEntry::register(regno, value));
        Ok(())
    }

    /// Captures the current content of a memory range.
    ///
    /// Returns `false` if the range could not be read; the entry is still
    /// added, flagged not fetchable, so that replay skips it.
    pub fn add_memory<T: ProcessControl + ?Sized>(
        &mut self,
        target: &mut T,
        range: MemoryRange,
    ) -> bool {
        let mut value = vec![0u8; range.len];
        let fetchable = target.read_memory(range.address, &mut value).is_ok();
        log::trace!(
            "add memory {:#x} ({} bytes) for insn at {:#x}",
            range.address,
            range.len,
            self.pc
        );
        self.entries.push(LogEntry::Memory {
            address: range.address,
            value,
            not_fetchable: !fetchable,
        });
        fetchable
    }

    /// Hands over the captured entries for commit
    pub fn finish(self) -> Vec<LogEntry> {
        self.entries
    }
}
