//! A recording session: owns the execution log, the breakpoint shadow and
//! the collaborators for one debuggee, from `open` to `close`.

use crate::{
    assembler::InstructionAssembler,
    breakpoints::{BreakpointShadow, BreakpointSite},
    error::RecordError,
    execution_log::ExecutionLog,
    target::{
        Direction, InstructionAnalyzer, ProcessControl, Signal, StopReason, TargetError,
        WaitStatus,
    },
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Default maximum number of resident instructions
pub const DEFAULT_CAPACITY: usize = 200_000;

/// Recording configuration settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of resident instructions, 0 for unlimited
    pub capacity: usize,
    /// Ask before evicting the oldest instruction when the log is full.
    /// Once the investigator agrees, eviction is silent for the rest of the session.
    pub stop_at_limit: bool,
    /// Ask before a direct write discards the recorded future
    pub confirm_divergence: bool,
    /// Ask whether to continue when a memory change cannot be recorded,
    /// instead of silently flagging the entry as not fetchable
    pub memory_query: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            stop_at_limit: true,
            confirm_divergence: true,
            memory_query: false,
        }
    }
}

/// Answers the yes/no questions the recorder has to ask
pub trait Confirm {
    /// Returns true if the investigator agrees
    fn confirm(&mut self, question: &str) -> bool;
}

impl<F: FnMut(&str) -> bool> Confirm for F {
    fn confirm(&mut self, question: &str) -> bool {
        self(question)
    }
}

/// Requests a stop of whatever the session is currently waiting for.
///
/// Cloneable and thread safe, so it can be triggered from a signal handler
/// thread while the session is blocked in `wait`.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    /// Delivers the interrupt; the next `wait` reports a stop with `SIGINT`
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Summary of the log, see [`RecordingSession::info`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInfo {
    /// Whether the session is in replay stance
    pub replaying: bool,
    pub lowest: Option<u64>,
    /// Current instruction while replaying
    pub current: Option<u64>,
    pub resident: usize,
    pub total_committed: u64,
    /// Maximum resident instructions, 0 for unlimited
    pub capacity: usize,
}

impl fmt::Display for RecordInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.replaying {
            writeln!(f, "Replay mode:")?;
        } else {
            writeln!(f, "Record mode:")?;
        }
        match self.lowest {
            Some(lowest) => {
                writeln!(f, "Lowest recorded instruction number is {lowest}.")?;
                if let Some(current) = self.current {
                    writeln!(f, "Current instruction number is {current}.")?;
                }
                writeln!(
                    f,
                    "Highest recorded instruction number is {}.",
                    self.total_committed
                )?;
                writeln!(f, "Log contains {} instructions.", self.resident)?;
            }
            None => writeln!(f, "No instructions have been logged.")?,
        }
        if self.capacity == 0 {
            write!(f, "Max logged instructions is unlimited.")
        } else {
            write!(f, "Max logged instructions is {}.", self.capacity)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Resumed {
    pub(crate) direction: Direction,
    pub(crate) step: bool,
    pub(crate) replaying: bool,
}

/// Record and replay state of one debuggee
pub struct RecordingSession<T: ProcessControl, A: InstructionAnalyzer> {
    pub(crate) target: T,
    pub(crate) analyzer: A,
    pub(crate) config: Config,
    pub(crate) log: ExecutionLog,
    pub(crate) breakpoints: BreakpointShadow,
    pub(crate) confirm: Box<dyn Confirm>,
    pub(crate) resumed: Option<Resumed>,
    pub(crate) pending: Option<InstructionAssembler>,
    pub(crate) interrupt: InterruptHandle,
    pub(crate) stop_reason: StopReason,
}

impl<T: ProcessControl, A: InstructionAnalyzer> fmt::Debug for RecordingSession<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingSession")
            .field("config", &self.config)
            .field("log", &self.log)
            .field("breakpoints", &self.breakpoints)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

impl<T: ProcessControl, A: InstructionAnalyzer> RecordingSession<T, A> {
    /// Starts recording `target`.
    ///
    /// Breakpoints the target already has installed are adopted by the
    /// shadow tracker. Questions are answered with "yes" until a
    /// [`Confirm`] capability is installed with [`Self::set_confirm`].
    pub fn open(target: T, analyzer: A, config: Config) -> Self {
        let mut breakpoints = BreakpointShadow::new();
        breakpoints.sync(target.inserted_breakpoints());
        log::debug!(
            "Process record: open, capacity {}, {} breakpoints adopted",
            config.capacity,
            breakpoints.len()
        );
        Self {
            target,
            analyzer,
            config,
            log: ExecutionLog::new(config.capacity),
            breakpoints,
            confirm: Box::new(|_: &str| true),
            resumed: None,
            pending: None,
            interrupt: InterruptHandle::default(),
            stop_reason: StopReason::None,
        }
    }

    /// Stops recording and hands the debuggee back. The log is discarded.
    pub fn close(self) -> T {
        log::debug!(
            "Process record: close, discarding {} instructions",
            self.log.count_resident()
        );
        if self.pending.is_some() {
            log::warn!("closing with an uncommitted instruction");
        }
        self.target
    }

    /// Installs the capability that answers confirmation questions
    pub fn set_confirm(&mut self, confirm: impl Confirm + 'static) {
        self.confirm = Box::new(confirm);
    }

    /// Handle that interrupts the next `wait`
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Read-only view of the log, for display between operations
    pub fn log(&self) -> &ExecutionLog {
        &self.log
    }

    pub fn breakpoints(&self) -> &BreakpointShadow {
        &self.breakpoints
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// The debuggee, bypassing recording. Changes made through this
    /// reference are invisible to the log.
    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    /// Record targets can always run backwards
    pub fn can_execute_reverse(&self) -> bool {
        true
    }

    /// Whether resume/wait are currently simulated from the log
    pub fn is_replaying(&self) -> bool {
        let reverse = matches!(
            self.resumed,
            Some(Resumed {
                direction: Direction::Reverse,
                ..
            })
        );
        !self.log.is_at_tail() || reverse
    }

    /// Whether a resume in `direction` would be simulated from the log
    pub fn will_replay(&self, direction: Direction) -> bool {
        !self.log.is_at_tail() || direction == Direction::Reverse
    }

    /// Resumes the debuggee, or starts simulating it from the log.
    ///
    /// Returns as soon as execution is under way; collect the stop with
    /// [`Self::wait`].
    pub fn resume(
        &mut self,
        direction: Direction,
        step: bool,
        signal: Signal,
    ) -> Result<(), RecordError> {
        if self.resumed.is_some() {
            return Err(RecordError::AlreadyResumed);
        }
        let replaying = self.will_replay(direction);
        log::debug!(
            "Process record: resume step={step} direction={direction:?} replaying={replaying}"
        );
        if !replaying {
            self.record_resume(signal)?;
        }
        self.resumed = Some(Resumed {
            direction,
            step,
            replaying,
        });
        Ok(())
    }

    /// Polls for the stop of the last resume.
    ///
    /// [`WaitStatus::Ignore`] means "not ready yet" and may be returned
    /// repeatedly; it is also returned when nothing was resumed.
    pub fn wait(&mut self) -> Result<WaitStatus, RecordError> {
        let Some(resumed) = self.resumed else {
            return Ok(WaitStatus::Ignore);
        };
        let result = if resumed.replaying {
            self.replay_wait(resumed)
        } else {
            self.record_wait(resumed)
        };
        match &result {
            Ok(WaitStatus::Ignore) => {}
            _ => self.resumed = None,
        }
        result
    }

    /// Reads a register of the debuggee at the current position
    pub fn read_register(&mut self, regno: u32) -> Result<Vec<u8>, RecordError> {
        let width = self
            .analyzer
            .register_size(regno)
            .ok_or(TargetError::RegisterUnavailable(regno))?;
        let mut value = vec![0u8; width];
        self.target.read_register(regno, &mut value)?;
        Ok(value)
    }

    /// Reads memory of the debuggee at the current position
    pub fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>, RecordError> {
        let mut value = vec![0u8; len];
        self.target.read_memory(address, &mut value)?;
        Ok(value)
    }

    /// Writes a register on behalf of the investigator.
    ///
    /// While replaying this discards the recorded future (after confirmation).
    pub fn store_register(&mut self, regno: u32, value: &[u8]) -> Result<(), RecordError> {
        self.prepare_direct_write(&format!(
            "Because the debuggee is being replayed, changing the value of a register \
             will make the execution log unusable from this point onward. \
             Change register {regno}?"
        ))?;
        self.target.write_register(regno, value)?;
        Ok(())
    }

    /// Writes memory on behalf of the investigator.
    ///
    /// While replaying this discards the recorded future (after confirmation).
    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), RecordError> {
        self.prepare_direct_write(&format!(
            "Because the debuggee is being replayed, writing to memory \
             will make the execution log unusable from this point onward. \
             Write memory at address {address:#x}?"
        ))?;
        self.target.write_memory(address, data)?;
        Ok(())
    }

    fn prepare_direct_write(&mut self, question: &str) -> Result<(), RecordError> {
        if !self.is_replaying() {
            return Ok(());
        }
        if self.config.confirm_divergence && !self.confirm.confirm(question) {
            return Err(RecordError::OperationCancelled);
        }
        let removed = self.log.truncate_after(self.log.cursor());
        log::debug!("Process record: divergence discarded {removed} instructions");
        Ok(())
    }

    /// Discards every instruction after the current position.
    /// Returns the number of instructions deleted.
    pub fn delete_forward(&mut self) -> usize {
        if self.log.is_at_tail() {
            return 0;
        }
        let removed = self.log.truncate_after(self.log.cursor());
        log::debug!("Process record: deleted {removed} instructions forward");
        removed
    }

    /// Inserts a breakpoint.
    ///
    /// While live-recording it is installed in the debuggee as well; while
    /// replaying it only exists in the shadow set.
    pub fn insert_breakpoint(&mut self, site: BreakpointSite) -> Result<(), RecordError> {
        let physically_inserted = !self.is_replaying();
        if physically_inserted && !self.breakpoints.is_physically_inserted(site) {
            self.target.insert_breakpoint(site)?;
        }
        self.breakpoints.note_inserted(site, physically_inserted);
        Ok(())
    }

    /// Removes a breakpoint, from the debuggee only if it was installed there
    pub fn remove_breakpoint(&mut self, site: BreakpointSite) -> Result<(), RecordError> {
        if self.breakpoints.is_physically_inserted(site) {
            self.target.remove_breakpoint(site)?;
        }
        match self.breakpoints.note_removed(site) {
            Some(_) => Ok(()),
            None => Err(RecordError::UnknownBreakpoint(site.address)),
        }
    }

    /// Changes the capacity, evicting the oldest instructions if needed
    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), RecordError> {
        self.config.capacity = capacity;
        self.log.set_capacity(capacity);
        if capacity == 0 {
            return Ok(());
        }
        while self.log.count_resident() > capacity {
            if self.log.cursor().is_sentinel() {
                // The state before the oldest instruction is about to go away.
                self.step_forward_instruction()?;
            }
            self.log.evict_oldest_instruction();
        }
        Ok(())
    }

    /// Sets whether to ask before the first eviction
    pub fn set_stop_at_limit(&mut self, stop_at_limit: bool) {
        self.config.stop_at_limit = stop_at_limit;
    }

    /// Sets whether to ask before a direct write discards history
    pub fn set_confirm_divergence(&mut self, confirm_divergence: bool) {
        self.config.confirm_divergence = confirm_divergence;
    }

    /// Sets whether to ask when a memory change cannot be recorded
    pub fn set_memory_query(&mut self, memory_query: bool) {
        self.config.memory_query = memory_query;
    }

    pub fn info(&self) -> RecordInfo {
        let replaying = self.is_replaying();
        RecordInfo {
            replaying,
            lowest: self.log.boundaries().next().map(|(_, seq)| seq),
            current: replaying.then(|| self.log.cursor_sequence()),
            resident: self.log.count_resident(),
            total_committed: self.log.total_committed(),
            capacity: self.log.capacity(),
        }
    }
}
