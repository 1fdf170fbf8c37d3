//! Replay controller: moves the cursor through the log, swapping recorded
//! values with the debuggee's current ones.
//!
//! Applying an entry exchanges its stored value with the live location, so
//! the same operation undoes a step going backward and redoes it going
//! forward.

use crate::{
    error::RecordError,
    execution_log::{EntryId, LogEntry},
    session::{RecordingSession, Resumed},
    target::{
        Direction, HistoryEdge, InstructionAnalyzer, ProcessControl, Signal, StopReason,
        TargetError, WaitStatus,
    },
};

impl LogEntry {
    /// Swaps the stored value with the debuggee's current one.
    ///
    /// Returns whether the write landed inside a hardware watchpoint.
    /// Memory that can no longer be accessed flags the entry instead of
    /// failing; flagged entries are skipped.
    pub fn apply<T: ProcessControl + ?Sized>(&mut self, target: &mut T) -> Result<bool, TargetError> {
        match self {
            LogEntry::Register { regno, value } => {
                log::trace!("Process record: swap register {regno}");
                let mut current = vec![0u8; value.len()];
                target.read_register(*regno, &mut current)?;
                target.write_register(*regno, value)?;
                *value = current;
                Ok(false)
            }
            LogEntry::Memory {
                address,
                value,
                not_fetchable,
            } => {
                if *not_fetchable {
                    return Ok(false);
                }
                log::trace!("Process record: swap memory {address:#x} ({} bytes)", value.len());
                let mut current = vec![0u8; value.len()];
                if target.read_memory(*address, &mut current).is_err() {
                    *not_fetchable = true;
                    return Ok(false);
                }
                if let Err(err) = target.write_memory(*address, value) {
                    log::warn!("Process record: error writing memory at {address:#x}: {err}");
                    *not_fetchable = true;
                    return Ok(false);
                }
                *value = current;
                Ok(target.watchpoint_in_range(target.address_space(), *address, value.len()))
            }
            LogEntry::Boundary { .. } => Ok(false),
        }
    }
}

/// What a single replayed instruction did
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepOutcome {
    pub(crate) watchpoint: bool,
}

impl<T: ProcessControl, A: InstructionAnalyzer> RecordingSession<T, A> {
    /// Applies `ids` in order. On failure the entries already applied are
    /// swapped back so the instruction is never left half replayed.
    fn apply_entries(&mut self, ids: &[EntryId]) -> Result<bool, TargetError> {
        let mut watchpoint = false;
        for (done, id) in ids.iter().enumerate() {
            match self.log.entry_mut(*id).apply(&mut self.target) {
                Ok(hit) => watchpoint |= hit,
                Err(err) => {
                    for undo in ids[..done].iter().rev() {
                        let _ = self.log.entry_mut(*undo).apply(&mut self.target);
                    }
                    return Err(err);
                }
            }
        }
        Ok(watchpoint)
    }

    /// Replays the instruction after the cursor; `None` at the tail
    pub(crate) fn step_forward_instruction(&mut self) -> Result<Option<StepOutcome>, TargetError> {
        let mut ids = Vec::new();
        let mut id = self.log.cursor();
        let boundary = loop {
            match self.log.next(id) {
                Some(next) if self.log.entry(next).is_boundary() => break next,
                Some(next) => {
                    ids.push(next);
                    id = next;
                }
                None => {
                    debug_assert!(ids.is_empty(), "entries after the last boundary");
                    return Ok(None);
                }
            }
        };
        let watchpoint = self.apply_entries(&ids)?;
        self.log.set_cursor(boundary);
        Ok(Some(StepOutcome { watchpoint }))
    }

    /// Undoes the instruction at the cursor; `None` at the sentinel
    pub(crate) fn step_backward_instruction(&mut self) -> Result<Option<StepOutcome>, TargetError> {
        let cursor = self.log.cursor();
        if cursor.is_sentinel() {
            return Ok(None);
        }
        let mut ids = Vec::new();
        let mut id = cursor;
        let boundary = loop {
            let Some(prev) = self.log.prev(id) else {
                unreachable!("log entry detached from the sentinel");
            };
            if self.log.entry(prev).is_boundary() {
                break prev;
            }
            ids.push(prev);
            id = prev;
        };
        let watchpoint = self.apply_entries(&ids)?;
        self.log.set_cursor(boundary);
        Ok(Some(StepOutcome { watchpoint }))
    }

    fn boundary_signal(&self) -> Signal {
        match self.log.entry(self.log.cursor()) {
            LogEntry::Boundary { signal, .. } => *signal,
            _ => Signal::NONE,
        }
    }

    fn replay_stop(&self, reason: StopReason) -> WaitStatus {
        let signal = self.boundary_signal();
        let signal = if signal.is_some() { signal } else { Signal::TRAP };
        WaitStatus::stopped(reason, signal)
    }

    /// Simulates a step or continue from the log
    pub(crate) fn replay_wait(&mut self, resumed: Resumed) -> Result<WaitStatus, RecordError> {
        self.stop_reason = StopReason::None;
        let address_space = self.target.address_space();
        loop {
            if self.interrupt.take() {
                log::debug!("Process record: interrupted during replay");
                return Ok(WaitStatus::stopped(StopReason::None, Signal::INT));
            }
            let outcome = match resumed.direction {
                Direction::Forward => self.step_forward_instruction()?,
                Direction::Reverse => self.step_backward_instruction()?,
            };
            let Some(outcome) = outcome else {
                let edge = match resumed.direction {
                    Direction::Forward => HistoryEdge::End,
                    Direction::Reverse => HistoryEdge::Begin,
                };
                return Ok(WaitStatus::NoHistory(edge));
            };
            // A step that moved is a normal stop, even onto either end.
            if resumed.step {
                self.stop_reason = StopReason::SingleStep;
                return Ok(self.replay_stop(StopReason::SingleStep));
            }
            match resumed.direction {
                Direction::Reverse if self.log.cursor().is_sentinel() => {
                    log::debug!("Process record: hit beginning of record log");
                    return Ok(WaitStatus::NoHistory(HistoryEdge::Begin));
                }
                Direction::Forward if self.log.is_at_tail() => {
                    log::debug!("Process record: hit end of record log");
                    return Ok(WaitStatus::NoHistory(HistoryEdge::End));
                }
                _ => {}
            }

            let pc = self.target.read_pc()?;
            if self.breakpoints.contains(address_space, pc) {
                log::debug!("Process record: break at {pc:#x}");
                self.stop_reason = StopReason::SoftwareBreakpoint;
                return Ok(self.replay_stop(StopReason::SoftwareBreakpoint));
            }
            if outcome.watchpoint {
                log::debug!("Process record: hit hw watchpoint");
                self.stop_reason = StopReason::Watchpoint;
                return Ok(self.replay_stop(StopReason::Watchpoint));
            }
            if self.boundary_signal().is_some() {
                return Ok(self.replay_stop(StopReason::None));
            }
        }
    }

    /// Moves to `target` synchronously, without looking at breakpoints
    pub(crate) fn seek_entry(&mut self, target: EntryId) -> Result<(), RecordError> {
        let wanted = self.log.entry(target).sequence().unwrap_or(0);
        while self.log.cursor() != target {
            let moved = if wanted > self.log.cursor_sequence() {
                self.step_forward_instruction()?
            } else {
                self.step_backward_instruction()?
            };
            if moved.is_none() {
                return Err(RecordError::InstructionNotFound(wanted));
            }
        }
        Ok(())
    }

    fn goto_entry(&mut self, target: EntryId) -> Result<u64, RecordError> {
        let wanted = self.log.entry(target).sequence().unwrap_or(0);
        if target == self.log.cursor() {
            return Err(RecordError::AlreadyThere(wanted));
        }
        if wanted > self.log.cursor_sequence() {
            log::debug!("Go forward to insn number {wanted}");
        } else {
            log::debug!("Go backward to insn number {wanted}");
        }
        self.seek_entry(target)?;
        Ok(wanted)
    }

    /// Moves to the instruction numbered `sequence`
    pub fn goto_sequence(&mut self, sequence: u64) -> Result<u64, RecordError> {
        let target = self
            .log
            .seek_by_sequence(sequence)
            .ok_or(RecordError::InstructionNotFound(sequence))?;
        self.goto_entry(target)
    }

    /// Moves to the start of the resident history
    pub fn goto_begin(&mut self) -> Result<u64, RecordError> {
        self.goto_entry(EntryId::SENTINEL)
    }

    /// Moves to the end of the recorded history, back to live-recording stance
    pub fn goto_end(&mut self) -> Result<u64, RecordError> {
        let last = self.log.last_boundary();
        self.goto_entry(last)
    }

    /// Leaves replay stance by moving to the end of the history
    pub fn stop_replaying(&mut self) -> Result<(), RecordError> {
        if self.log.is_at_tail() {
            return Ok(());
        }
        self.goto_end().map(|_| ())
    }

    /// Printable token for the current position
    pub fn bookmark(&self) -> String {
        self.log.cursor_sequence().to_string()
    }

    /// Returns to a position saved with [`Self::bookmark`].
    /// The token may be wrapped in single or double quotes.
    pub fn goto_bookmark(&mut self, token: &str) -> Result<u64, RecordError> {
        log::debug!("goto_bookmark receives {token}");
        let token = token.trim();
        let unquoted = match token.chars().next() {
            Some(quote @ ('\'' | '"')) => {
                if token.len() < 2 || !token.ends_with(quote) {
                    return Err(RecordError::UnbalancedQuotes(token.to_string()));
                }
                &token[1..token.len() - 1]
            }
            _ => token,
        };
        let sequence = unquoted
            .parse::<u64>()
            .map_err(|_| RecordError::InvalidBookmark(token.to_string()))?;
        self.goto_sequence(sequence)
    }
}
