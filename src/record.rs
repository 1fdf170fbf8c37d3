//! Recording controller: captures every instruction the debuggee executes
//! while the session is in live-recording stance.

use crate::{
    assembler::InstructionAssembler,
    error::RecordError,
    execution_log::LogEntry,
    session::{RecordingSession, Resumed},
    target::{
        AnalyzeError, InstructionAnalyzer, ProcessControl, Signal, StopEvent, StopReason,
        TargetError, WaitStatus,
    },
};
use std::iter;

impl<T: ProcessControl, A: InstructionAnalyzer> RecordingSession<T, A> {
    /// Asks before the first eviction if the policy says so
    fn check_capacity(&mut self) -> Result<(), RecordError> {
        if self.log.is_full() && self.config.stop_at_limit {
            if !self.confirm.confirm(
                "Do you want to auto delete previous execution log entries \
                 when the record buffer becomes full (stop-at-limit)?",
            ) {
                return Err(RecordError::CapacityDeclined);
            }
            self.config.stop_at_limit = false;
        }
        Ok(())
    }

    /// A signal passed to resume belongs to the boundary execution resumes
    /// from, i.e. the previous instruction, so that replay redelivers it at
    /// the same point.
    fn attribute_signal(&mut self, signal: Signal) {
        let cursor = self.log.cursor();
        if cursor.is_sentinel() {
            return;
        }
        if let LogEntry::Boundary { signal: pending, .. } = self.log.entry_mut(cursor) {
            *pending = signal;
        }
    }

    /// Captures the pre-instruction value of everything the next instruction changes
    fn assemble_instruction(&mut self) -> Result<InstructionAssembler, RecordError> {
        let pc = self.target.read_pc()?;
        let effects = self
            .analyzer
            .analyze(&mut self.target, pc)
            .map_err(|err| match err {
                AnalyzeError::Unsupported { pc, word } => {
                    log::debug!("Process record: unsupported instruction {word:#010x} at {pc:#x}");
                    RecordError::UnsupportedInstruction { pc }
                }
                AnalyzeError::Target(err) => RecordError::Target(err),
            })?;

        let mut assembler = InstructionAssembler::new(pc);
        let pc_register = self.analyzer.pc_register();
        for regno in effects.registers.iter().copied().chain(iter::once(pc_register)) {
            let width = self
                .analyzer
                .register_size(regno)
                .ok_or(TargetError::RegisterUnavailable(regno))?;
            assembler.add_register(&mut self.target, regno, width)?;
        }
        for range in effects.memory {
            if assembler.add_memory(&mut self.target, range) {
                continue;
            }
            if self.config.memory_query
                && !self.confirm.confirm(&format!(
                    "Process record cannot record the memory change at {:#x} (length {}) \
                     of the next instruction. Continue anyway?",
                    range.address, range.len
                ))
            {
                return Err(RecordError::OperationCancelled);
            }
            log::warn!(
                "Process record: memory at {:#x} (length {}) is not accessible, \
                 it will not be restored on replay",
                range.address,
                range.len
            );
        }
        Ok(assembler)
    }

    /// Prepares the next instruction and lets the real debuggee execute it.
    ///
    /// The target is always single-stepped, whatever the request.
    pub(crate) fn record_resume(&mut self, signal: Signal) -> Result<(), RecordError> {
        self.check_capacity()?;
        let assembler = self.assemble_instruction()?;
        self.target.resume(true, signal)?;
        self.attribute_signal(signal);
        log::trace!(
            "Process record: stepping insn at {:#x} with {} entries",
            assembler.pc(),
            assembler.entries().len()
        );
        self.pending = Some(assembler);
        Ok(())
    }

    fn commit_pending(&mut self) {
        if let Some(assembler) = self.pending.take() {
            let pc = assembler.pc();
            let evicting = self.log.is_full();
            let sequence = self.log.commit(assembler.finish());
            if evicting {
                log::debug!("Process record: buffer full, evicted the oldest instruction");
            }
            log::trace!("Process record: committed insn {sequence} at {pc:#x}");
        }
    }

    /// Whether a stop is only the completion of a forced single step that
    /// nobody asked to see
    fn is_forced_step_trap(&mut self, event: StopEvent) -> Result<bool, RecordError> {
        if event.signal != Signal::TRAP
            || !matches!(event.reason, StopReason::SingleStep | StopReason::None)
        {
            return Ok(false);
        }
        if self.target.stopped_by_watchpoint() {
            self.stop_reason = StopReason::Watchpoint;
            return Ok(false);
        }
        let pc = self.target.read_pc()?;
        if self.breakpoints.contains(self.target.address_space(), pc) {
            log::debug!("Process record: break at {pc:#x}");
            self.stop_reason = StopReason::SoftwareBreakpoint;
            return Ok(false);
        }
        Ok(true)
    }

    pub(crate) fn record_wait(&mut self, resumed: Resumed) -> Result<WaitStatus, RecordError> {
        loop {
            let status = self.target.wait()?;
            let event = match status {
                WaitStatus::Ignore => {
                    log::trace!("Process record: target beneath not done yet");
                    return Ok(status);
                }
                WaitStatus::Stopped(event) => event,
                WaitStatus::Exited(_) | WaitStatus::NoHistory(_) => {
                    self.commit_pending();
                    return Ok(status);
                }
            };
            self.commit_pending();
            self.stop_reason = event.reason;

            if self.interrupt.take() {
                return Ok(WaitStatus::stopped(event.reason, Signal::INT));
            }
            if resumed.step || !self.is_forced_step_trap(event)? {
                return Ok(status);
            }

            // A plain single-step trap during a continue: record the next
            // instruction and keep going.
            if let Err(err) = self.record_resume(Signal::NONE) {
                log::warn!("Process record: failed to record execution log: {err}");
                self.stop_reason = StopReason::None;
                return Ok(WaitStatus::stopped(StopReason::None, Signal::NONE));
            }
            log::trace!("Process record: issuing one more step in the target beneath");
        }
    }
}
