//! The execution log: an arena of doubly linked entries anchored at a
//! permanent sentinel, a cursor, and the capacity/eviction bookkeeping.
//!
//! Each recorded instruction is a run of [`LogEntry::Register`] and
//! [`LogEntry::Memory`] entries terminated by a [`LogEntry::Boundary`].
//! The cursor always rests on a boundary (or the sentinel); the state of the
//! debuggee corresponds to "just after the instruction of that boundary".

use crate::target::Signal;
use std::fmt;

/// Index of a log node inside the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(usize);

impl EntryId {
    /// The permanent head of the log
    pub const SENTINEL: EntryId = EntryId(0);

    /// Whether this is the sentinel
    pub fn is_sentinel(self) -> bool {
        self == EntryId::SENTINEL
    }
}

/// A single recorded change, or the end of an instruction
#[cfg_attr(
    feature = "fuzzer-not-safe-for-production",
    derive(arbitrary::Arbitrary)
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// A register and the value it held on the other side of the instruction
    Register {
        /// Register number
        regno: u32,
        /// Raw register bytes, the register's native width
        value: Vec<u8>,
    },
    /// A memory range and the content it held on the other side of the instruction
    Memory {
        /// First byte of the range
        address: u64,
        /// Raw content, one byte per address
        value: Vec<u8>,
        /// Set once the range could not be read or written back
        not_fetchable: bool,
    },
    /// Terminates an instruction
    Boundary {
        /// Signal delivered when execution resumed from this point
        signal: Signal,
        /// Monotonic instruction number
        sequence: u64,
    },
}

impl LogEntry {
    /// A register entry holding `value`
    pub fn register(regno: u32, value: Vec<u8>) -> Self {
        LogEntry::Register { regno, value }
    }

    /// A memory entry holding `value`
    pub fn memory(address: u64, value: Vec<u8>) -> Self {
        LogEntry::Memory {
            address,
            value,
            not_fetchable: false,
        }
    }

    /// Whether this entry terminates an instruction
    pub fn is_boundary(&self) -> bool {
        matches!(self, LogEntry::Boundary { .. })
    }

    /// Sequence number if this is a boundary
    pub fn sequence(&self) -> Option<u64> {
        match self {
            LogEntry::Boundary { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEntry::Register { regno, value } => {
                write!(f, "reg {regno} ({} bytes)", value.len())
            }
            LogEntry::Memory {
                address,
                value,
                not_fetchable,
            } => {
                write!(f, "mem {address:#x} ({} bytes)", value.len())?;
                if *not_fetchable {
                    f.write_str(" <not accessible>")?;
                }
                Ok(())
            }
            LogEntry::Boundary { signal, sequence } => {
                write!(f, "end of insn {sequence}")?;
                if signal.is_some() {
                    write!(f, " [{signal}]")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
struct Node {
    entry: LogEntry,
    prev: Option<EntryId>,
    next: Option<EntryId>,
}

#[derive(Debug)]
enum Slot {
    Occupied(Node),
    Vacant { next_free: Option<usize> },
}

/// Ordered log of recorded instructions
#[derive(Debug)]
pub struct ExecutionLog {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    tail: EntryId,
    cursor: EntryId,
    resident: usize,
    total_committed: u64,
    capacity: usize,
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ExecutionLog {
    /// Creates an empty log holding at most `capacity` instructions (0 = unlimited)
    pub fn new(capacity: usize) -> Self {
        let sentinel = Node {
            entry: LogEntry::Boundary {
                signal: Signal::NONE,
                sequence: 0,
            },
            prev: None,
            next: None,
        };
        Self {
            slots: vec![Slot::Occupied(sentinel)],
            free_head: None,
            tail: EntryId::SENTINEL,
            cursor: EntryId::SENTINEL,
            resident: 0,
            total_committed: 0,
            capacity,
        }
    }

    fn node(&self, id: EntryId) -> &Node {
        match &self.slots[id.0] {
            Slot::Occupied(node) => node,
            Slot::Vacant { .. } => unreachable!("dangling log entry {id:?}"),
        }
    }

    fn node_mut(&mut self, id: EntryId) -> &mut Node {
        match &mut self.slots[id.0] {
            Slot::Occupied(node) => node,
            Slot::Vacant { .. } => unreachable!("dangling log entry {id:?}"),
        }
    }

    fn allocate(&mut self, node: Node) -> EntryId {
        match self.free_head {
            Some(index) => {
                self.free_head = match self.slots[index] {
                    Slot::Vacant { next_free } => next_free,
                    Slot::Occupied(_) => unreachable!("free list points at a live slot"),
                };
                self.slots[index] = Slot::Occupied(node);
                EntryId(index)
            }
            None => {
                self.slots.push(Slot::Occupied(node));
                EntryId(self.slots.len() - 1)
            }
        }
    }

    /// Releases a detached node, returning its entry
    fn release(&mut self, id: EntryId) -> LogEntry {
        debug_assert!(!id.is_sentinel());
        let slot = std::mem::replace(
            &mut self.slots[id.0],
            Slot::Vacant {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(id.0);
        match slot {
            Slot::Occupied(node) => node.entry,
            Slot::Vacant { .. } => unreachable!("double release of {id:?}"),
        }
    }

    /// Entry stored at `id`
    pub fn entry(&self, id: EntryId) -> &LogEntry {
        &self.node(id).entry
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> &mut LogEntry {
        &mut self.node_mut(id).entry
    }

    /// Successor of `id`, `None` at the tail
    pub fn next(&self, id: EntryId) -> Option<EntryId> {
        self.node(id).next
    }

    /// Predecessor of `id`, `None` at the sentinel
    pub fn prev(&self, id: EntryId) -> Option<EntryId> {
        self.node(id).prev
    }

    /// Current replay position
    pub fn cursor(&self) -> EntryId {
        self.cursor
    }

    pub(crate) fn set_cursor(&mut self, id: EntryId) {
        debug_assert!(self.entry(id).is_boundary());
        self.cursor = id;
    }

    /// Last node of the log
    pub fn tail(&self) -> EntryId {
        self.tail
    }

    /// Whether the cursor is at the tail (live stance)
    pub fn is_at_tail(&self) -> bool {
        self.cursor == self.tail
    }

    /// Sequence number of the cursor's boundary (0 at the sentinel)
    pub fn cursor_sequence(&self) -> u64 {
        self.entry(self.cursor).sequence().unwrap_or(0)
    }

    /// Whether the log holds no entries at all
    pub fn is_empty(&self) -> bool {
        self.next(EntryId::SENTINEL).is_none()
    }

    /// Number of instructions currently resident
    pub fn count_resident(&self) -> usize {
        self.resident
    }

    /// Number of instructions ever committed, the last assigned sequence number
    pub fn total_committed(&self) -> u64 {
        self.total_committed
    }

    /// Maximum number of resident instructions, 0 for unlimited
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Whether committing another instruction would require an eviction
    pub fn is_full(&self) -> bool {
        self.capacity != 0 && self.resident >= self.capacity
    }

    /// Links `entry` after the tail
    pub fn append(&mut self, entry: LogEntry) -> EntryId {
        let prev = self.tail;
        let id = self.allocate(Node {
            entry,
            prev: Some(prev),
            next: None,
        });
        self.node_mut(prev).next = Some(id);
        self.tail = id;
        id
    }

    /// Terminates the instruction at the tail and moves the cursor onto it
    pub fn append_boundary(&mut self, signal: Signal) -> u64 {
        debug_assert!(self.cursor_is_live_or_tail_instruction());
        self.total_committed += 1;
        let sequence = self.total_committed;
        let id = self.append(LogEntry::Boundary { signal, sequence });
        self.resident += 1;
        self.cursor = id;
        sequence
    }

    fn cursor_is_live_or_tail_instruction(&self) -> bool {
        // Only register/memory entries may lie between the cursor and the tail.
        let mut id = self.cursor;
        while let Some(next) = self.next(id) {
            if self.entry(next).is_boundary() {
                return false;
            }
            id = next;
        }
        true
    }

    /// Appends one instruction atomically, evicting the oldest one if full
    pub fn commit(&mut self, entries: Vec<LogEntry>) -> u64 {
        debug_assert!(self.is_at_tail());
        if self.is_full() {
            self.evict_oldest_instruction();
        }
        for entry in entries {
            debug_assert!(!entry.is_boundary());
            self.append(entry);
        }
        self.append_boundary(Signal::NONE)
    }

    /// Removes the oldest resident instruction, returning its sequence number.
    ///
    /// Refused (returns `None`) when the log is empty or the cursor rests on
    /// the sentinel, since the state before the oldest instruction would no
    /// longer be representable.
    pub fn evict_oldest_instruction(&mut self) -> Option<u64> {
        if self.resident == 0 || self.cursor.is_sentinel() {
            return None;
        }
        loop {
            let Some(first) = self.next(EntryId::SENTINEL) else {
                unreachable!("resident instructions without entries");
            };
            let after = self.next(first);
            self.node_mut(EntryId::SENTINEL).next = after;
            match after {
                Some(after) => self.node_mut(after).prev = Some(EntryId::SENTINEL),
                None => self.tail = EntryId::SENTINEL,
            }
            if self.cursor == first {
                self.cursor = EntryId::SENTINEL;
            }
            if let LogEntry::Boundary { sequence, .. } = self.release(first) {
                self.resident -= 1;
                log::trace!("evicted instruction {sequence}");
                return Some(sequence);
            }
        }
    }

    /// Discards everything strictly after `id`, returning the number of
    /// instructions removed
    pub fn truncate_after(&mut self, id: EntryId) -> usize {
        let mut removed = 0;
        let mut next = self.node_mut(id).next.take();
        while let Some(current) = next {
            next = self.next(current);
            if self.release(current).is_boundary() {
                removed += 1;
            }
        }
        self.tail = id;
        self.resident -= removed;
        if self.is_released(self.cursor) {
            self.cursor = id;
        }
        removed
    }

    fn is_released(&self, id: EntryId) -> bool {
        matches!(self.slots[id.0], Slot::Vacant { .. })
    }

    /// Drops every entry and resets the numbering
    pub fn clear(&mut self) {
        let capacity = self.capacity;
        *self = Self::new(capacity);
    }

    /// Locates the boundary with sequence number `sequence`; 0 is the sentinel
    pub fn seek_by_sequence(&self, sequence: u64) -> Option<EntryId> {
        if sequence == 0 {
            return Some(EntryId::SENTINEL);
        }
        self.boundaries()
            .find(|(_, seq)| *seq == sequence)
            .map(|(id, _)| id)
    }

    /// Oldest resident boundary
    pub fn first_boundary(&self) -> Option<EntryId> {
        self.boundaries().next().map(|(id, _)| id)
    }

    /// Newest boundary, the sentinel if nothing is resident
    pub fn last_boundary(&self) -> EntryId {
        let mut id = self.tail;
        while !self.entry(id).is_boundary() {
            match self.prev(id) {
                Some(prev) => id = prev,
                None => break,
            }
        }
        id
    }

    /// Resident boundaries in log order with their sequence numbers
    pub fn boundaries(&self) -> impl Iterator<Item = (EntryId, u64)> + '_ {
        self.iter()
            .filter_map(|(id, entry)| entry.sequence().map(|seq| (id, seq)))
    }

    /// All entries after the sentinel in log order
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            log: self,
            next: self.next(EntryId::SENTINEL),
        }
    }

    /// Recomputes counters after entries were linked in bulk
    pub(crate) fn adopt_restored(&mut self, resident: usize, total_committed: u64) {
        self.resident = resident;
        self.total_committed = total_committed;
        self.cursor = EntryId::SENTINEL;
    }
}

/// Iterator over log entries, see [`ExecutionLog::iter`]
pub struct Iter<'a> {
    log: &'a ExecutionLog,
    next: Option<EntryId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (EntryId, &'a LogEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.log.next(id);
        Some((id, self.log.entry(id)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn instruction(regno: u32, value: u8) -> Vec<LogEntry> {
        vec![LogEntry::register(regno, vec![value; 8])]
    }

    #[test]
    fn test_commit_assigns_increasing_sequences() {
        let mut log = ExecutionLog::new(0);
        assert_eq!(log.commit(instruction(1, 0)), 1);
        assert_eq!(log.commit(instruction(2, 0)), 2);
        assert_eq!(log.commit(Vec::new()), 3);
        assert_eq!(log.count_resident(), 3);
        assert_eq!(log.total_committed(), 3);
        assert!(log.is_at_tail());
        let sequences: Vec<u64> = log.boundaries().map(|(_, seq)| seq).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut log = ExecutionLog::new(3);
        for i in 0..5 {
            log.commit(instruction(i, i as u8));
        }
        assert_eq!(log.count_resident(), 3);
        assert_eq!(log.total_committed(), 5);
        assert!(log.seek_by_sequence(2).is_none());
        assert!(log.seek_by_sequence(3).is_some());
        let registers: Vec<u32> = log
            .iter()
            .filter_map(|(_, entry)| match entry {
                LogEntry::Register { regno, .. } => Some(*regno),
                _ => None,
            })
            .collect();
        assert_eq!(registers, vec![2, 3, 4]);
    }

    #[test]
    fn test_slots_are_reused_after_eviction() {
        let mut log = ExecutionLog::new(1);
        for i in 0..10 {
            log.commit(instruction(i, 0));
        }
        assert!(log.slots.len() <= 4);
        assert_eq!(log.total_committed(), 10);
    }

    #[test]
    fn test_truncate_after_cursor() {
        let mut log = ExecutionLog::new(0);
        for i in 0..5 {
            log.commit(instruction(i, 0));
        }
        let first = log.seek_by_sequence(1).unwrap();
        log.set_cursor(first);
        assert_eq!(log.truncate_after(first), 4);
        assert_eq!(log.count_resident(), 1);
        assert!(log.is_at_tail());
        for seq in 2..=5 {
            assert!(log.seek_by_sequence(seq).is_none());
        }
        // Numbering continues where it left off.
        assert_eq!(log.commit(Vec::new()), 6);
    }

    #[test]
    fn test_eviction_moves_cursor_off_evicted_boundary() {
        let mut log = ExecutionLog::new(0);
        log.commit(instruction(0, 0));
        log.commit(instruction(1, 0));
        let first = log.seek_by_sequence(1).unwrap();
        log.set_cursor(first);
        assert_eq!(log.evict_oldest_instruction(), Some(1));
        assert!(log.cursor().is_sentinel());
        assert_eq!(log.evict_oldest_instruction(), None);
        assert_eq!(log.count_resident(), 1);
    }

    #[test]
    fn test_evicting_last_instruction_resets_tail() {
        let mut log = ExecutionLog::new(0);
        log.commit(instruction(0, 0));
        assert_eq!(log.evict_oldest_instruction(), Some(1));
        assert!(log.is_empty());
        assert_eq!(log.tail(), EntryId::SENTINEL);
        assert!(log.is_at_tail());
    }

    #[test]
    fn test_last_boundary_and_sentinel_seek() {
        let mut log = ExecutionLog::new(0);
        assert_eq!(log.last_boundary(), EntryId::SENTINEL);
        assert_eq!(log.seek_by_sequence(0), Some(EntryId::SENTINEL));
        log.commit(instruction(0, 0));
        assert_eq!(log.last_boundary(), log.seek_by_sequence(1).unwrap());
        assert_eq!(log.first_boundary(), log.seek_by_sequence(1));
    }
}
