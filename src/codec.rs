//! Persistence of the execution log.
//!
//! The record section follows the debuggee's process-state snapshot. All
//! multi-byte integers are big-endian:
//!
//! ```text
//! magic       u32  0x20091016
//! records*    until the end of the section
//!   boundary  u8 0, i32 signal, u32 sequence
//!   register  u8 1, u32 regno, value (register width)
//!   memory    u8 2, u32 length, u64 address, value (length bytes)
//! ```
//!
//! The snapshot captures the state at the start of history, so every
//! register and memory record holds the value its instruction writes.

use crate::{
    error::{FormatError, RecordError},
    execution_log::{EntryId, LogEntry},
    session::RecordingSession,
    target::{InstructionAnalyzer, ProcessControl, Signal},
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::{self, File},
    io::{self, BufReader, Read, Write},
    path::Path,
};

/// Identifies a record section; change whenever the format changes
pub const RECORD_MAGIC: u32 = 0x2009_1016;

const TAG_BOUNDARY: u8 = 0;
const TAG_REGISTER: u8 = 1;
const TAG_MEMORY: u8 = 2;

fn truncated(err: io::Error) -> RecordError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        RecordError::Format(FormatError::Truncated)
    } else {
        RecordError::Io(err)
    }
}

/// Writes the section header
pub fn write_header<W: Write>(writer: &mut W) -> Result<(), RecordError> {
    writer.write_u32::<BigEndian>(RECORD_MAGIC)?;
    Ok(())
}

/// Writes one record
pub fn write_entry<W: Write>(writer: &mut W, entry: &LogEntry) -> Result<(), RecordError> {
    match entry {
        LogEntry::Boundary { signal, sequence } => {
            let sequence =
                u32::try_from(*sequence).map_err(|_| FormatError::SequenceOverflow(*sequence))?;
            writer.write_u8(TAG_BOUNDARY)?;
            writer.write_i32::<BigEndian>(signal.0)?;
            writer.write_u32::<BigEndian>(sequence)?;
        }
        LogEntry::Register { regno, value } => {
            writer.write_u8(TAG_REGISTER)?;
            writer.write_u32::<BigEndian>(*regno)?;
            writer.write_all(value)?;
        }
        LogEntry::Memory { address, value, .. } => {
            let len =
                u32::try_from(value.len()).map_err(|_| FormatError::LengthOverflow(value.len()))?;
            writer.write_u8(TAG_MEMORY)?;
            writer.write_u32::<BigEndian>(len)?;
            writer.write_u64::<BigEndian>(*address)?;
            writer.write_all(value)?;
        }
    }
    Ok(())
}

/// Reads and checks the section header
pub fn read_header<R: Read>(reader: &mut R) -> Result<(), RecordError> {
    let magic = reader.read_u32::<BigEndian>().map_err(truncated)?;
    if magic != RECORD_MAGIC {
        return Err(FormatError::BadMagic(magic).into());
    }
    log::trace!("Reading 4-byte magic cookie {magic:#x}");
    Ok(())
}

fn read_tag<R: Read>(reader: &mut R) -> Result<Option<u8>, RecordError> {
    let mut tag = [0u8; 1];
    loop {
        match reader.read(&mut tag) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(tag[0])),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

fn read_value<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, RecordError> {
    let mut value = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut value)?;
    if value.len() != len {
        return Err(FormatError::Truncated.into());
    }
    Ok(value)
}

/// Reads one record, `None` at the end of the section
pub fn read_entry<R: Read>(
    reader: &mut R,
    register_size: impl Fn(u32) -> Option<usize>,
) -> Result<Option<LogEntry>, RecordError> {
    let Some(tag) = read_tag(reader)? else {
        return Ok(None);
    };
    let entry = match tag {
        TAG_BOUNDARY => {
            let signal = reader.read_i32::<BigEndian>().map_err(truncated)?;
            let sequence = reader.read_u32::<BigEndian>().map_err(truncated)?;
            LogEntry::Boundary {
                signal: Signal(signal),
                sequence: u64::from(sequence),
            }
        }
        TAG_REGISTER => {
            let regno = reader.read_u32::<BigEndian>().map_err(truncated)?;
            let width = register_size(regno).ok_or(FormatError::UnknownRegister(regno))?;
            LogEntry::register(regno, read_value(reader, width)?)
        }
        TAG_MEMORY => {
            let len = reader.read_u32::<BigEndian>().map_err(truncated)?;
            let address = reader.read_u64::<BigEndian>().map_err(truncated)?;
            LogEntry::memory(address, read_value(reader, len as usize)?)
        }
        tag => return Err(FormatError::UnknownRecordTag(tag).into()),
    };
    log::trace!("Reading {entry}");
    Ok(Some(entry))
}

/// Reads all records of a section and checks that they form whole
/// instructions with strictly increasing sequence numbers
pub fn read_entries<R: Read>(
    reader: &mut R,
    register_size: impl Fn(u32) -> Option<usize>,
) -> Result<Vec<LogEntry>, RecordError> {
    let mut entries = Vec::new();
    let mut previous = 0;
    while let Some(entry) = read_entry(reader, &register_size)? {
        if let Some(next) = entry.sequence() {
            if next <= previous {
                return Err(FormatError::NonMonotonicSequence { previous, next }.into());
            }
            previous = next;
        }
        entries.push(entry);
    }
    if entries.last().is_some_and(|entry| !entry.is_boundary()) {
        return Err(FormatError::IncompleteInstruction.into());
    }
    Ok(entries)
}

impl<T: ProcessControl, A: InstructionAnalyzer> RecordingSession<T, A> {
    /// Saves the debuggee's state and the whole log to `path`.
    ///
    /// The log is replayed back to its start, written out while replaying
    /// forward, and then returned to the current position, so the debuggee
    /// ends up exactly where it was.
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<(), RecordError> {
        let path = path.as_ref();
        log::debug!("Saving execution log to '{}'", path.display());

        let original = self.log.cursor();
        let mut section = Vec::new();
        let written = self
            .seek_entry(EntryId::SENTINEL)
            .and_then(|_| self.write_history(&mut section));
        let returned = self.seek_entry(original);
        written?;
        returned?;

        let result = File::create(path).and_then(|mut file| file.write_all(&section));
        if let Err(err) = result {
            let _ = fs::remove_file(path);
            return Err(err.into());
        }
        log::info!(
            "Saved {} instructions with execution log to {}",
            self.log.count_resident(),
            path.display()
        );
        Ok(())
    }

    /// Writes the snapshot at the start of history and every instruction,
    /// each one before it is replayed. Leaves the cursor at the tail.
    fn write_history(&mut self, out: &mut Vec<u8>) -> Result<(), RecordError> {
        self.target.write_snapshot(out)?;
        write_header(out)?;
        loop {
            let mut id = self.log.cursor();
            while let Some(next) = self.log.next(id) {
                let entry = self.log.entry(next);
                write_entry(out, entry)?;
                id = next;
                if entry.is_boundary() {
                    break;
                }
            }
            if self.step_forward_instruction()?.is_none() {
                return Ok(());
            }
        }
    }

    /// Loads a snapshot written by [`Self::save`] into an empty session.
    ///
    /// The session ends up replaying from the start of the restored history.
    /// A file that fails to load leaves the debuggee as it was.
    pub fn restore(&mut self, path: impl AsRef<Path>) -> Result<(), RecordError> {
        let path = path.as_ref();
        if !self.log.is_empty() {
            return Err(RecordError::LogNotEmpty);
        }
        log::debug!("Restoring recording from '{}'", path.display());

        let mut backup = Vec::new();
        self.target.write_snapshot(&mut backup)?;
        let entries = match self.read_recording(path) {
            Ok(entries) => entries,
            Err(err) => {
                if let Err(rollback) = self.target.read_snapshot(&mut backup.as_slice()) {
                    log::warn!("Process record: could not roll back debuggee state: {rollback}");
                }
                return Err(err);
            }
        };

        let mut resident = 0;
        let mut total_committed = 0;
        for entry in entries {
            if let Some(sequence) = entry.sequence() {
                resident += 1;
                total_committed = sequence;
            }
            self.log.append(entry);
        }
        self.log.adopt_restored(resident, total_committed);

        if self.config.capacity != 0 && resident > self.config.capacity {
            log::warn!("Auto increase record/replay buffer limit to {resident}.");
            self.config.capacity = resident;
            self.log.set_capacity(resident);
        }
        log::info!(
            "Restored {resident} instructions from {}",
            path.display()
        );
        Ok(())
    }

    /// Loads the debuggee snapshot and parses the whole log from `path`
    fn read_recording(&mut self, path: &Path) -> Result<Vec<LogEntry>, RecordError> {
        let mut reader = BufReader::new(File::open(path)?);
        self.target.read_snapshot(&mut reader)?;
        read_header(&mut reader)?;
        let analyzer = &self.analyzer;
        read_entries(&mut reader, |regno| analyzer.register_size(regno))
    }
}
