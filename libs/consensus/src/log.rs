//! The append-only replicated log
//!
//! The log is the source of truth for every command proposed to a
//! partition. Appends are durable before they are acknowledged to a
//! replication request (write-ahead semantics). A corrupted or
//! out-of-order read fails with [`RaftError::LogCorruption`], which
//! callers must distinguish from an ordinary not-found (`Ok(None)`).

use crate::types::{Entry, LogIndex, Snapshot, Term};
use crate::{RaftError, Result};
use parking_lot::RwLock;
use std::sync::Arc;

/// Storage backend for the log.
///
/// Implementations must make an append durable before returning.
pub trait LogStorage: Send + Sync {
    /// Append entries, returning the index of the last appended entry.
    /// Entry indexes must continue the log contiguously.
    fn append(&mut self, entries: Vec<Entry>) -> Result<LogIndex>;

    /// Get the entry at an index. `Ok(None)` when compacted away or past
    /// the end.
    fn get(&self, index: LogIndex) -> Result<Option<Entry>>;

    /// Get entries in `[start, end)`.
    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>>;

    /// Get all entries from `start` onwards.
    fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>>;

    /// Remove entries at `index` and above. Used to discard an
    /// uncommitted divergent tail on leader change; callers must never
    /// truncate committed entries.
    fn truncate_from(&mut self, index: LogIndex) -> Result<()>;

    /// Drop the obsolete prefix once a snapshot covers it.
    fn compact_up_to(&mut self, index: LogIndex) -> Result<()>;

    /// First index still fetchable from the log. May be at or below the
    /// snapshot boundary when a trailing window is retained.
    fn first_index(&self) -> LogIndex;

    /// Index of the last entry, or the snapshot boundary if empty.
    fn last_index(&self) -> LogIndex;

    /// Term of the last entry, or the snapshot's term if empty.
    fn last_term(&self) -> Term;

    /// Term of the entry at `index`, answering from snapshot metadata at
    /// the boundary.
    fn term_of(&self, index: LogIndex) -> Result<Option<Term>>;

    /// Install a snapshot covering a log prefix.
    fn set_snapshot(&mut self, snapshot: Snapshot) -> Result<()>;

    fn snapshot(&self) -> Option<Snapshot>;

    /// Destructively replace the whole log with a snapshot. Only used
    /// when a follower receives a snapshot transfer because its log is
    /// behind the leader's compaction boundary.
    fn reset(&mut self, snapshot: Snapshot) -> Result<()>;
}

/// In-memory log storage.
///
/// The on-disk segment format is owned by the storage engine; this
/// backend carries the same contract for tests and in-process use.
pub struct MemoryLog {
    entries: Vec<Entry>,
    snapshot: Option<Snapshot>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            entries: vec![],
            snapshot: None,
        }
    }

    /// First index appendable when no entries remain, i.e. snapshot
    /// boundary + 1.
    fn offset(&self) -> LogIndex {
        self.snapshot
            .as_ref()
            .map(|s| s.metadata.last_included_index + 1)
            .unwrap_or(LogIndex(1))
    }

    /// Physical slot of an index. Entries may extend below the snapshot
    /// boundary: compaction keeps a trailing window so slightly-behind
    /// followers can catch up without a snapshot transfer.
    fn slot(&self, index: LogIndex) -> Option<usize> {
        let first = self.entries.first()?.index;
        if index < first {
            return None;
        }
        Some((index.0 - first.0) as usize)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStorage for MemoryLog {
    fn append(&mut self, entries: Vec<Entry>) -> Result<LogIndex> {
        for entry in entries {
            let expected = self.last_index() + 1;
            if entry.index != expected {
                return Err(RaftError::LogCorruption {
                    index: entry.index,
                    detail: format!("append out of order, expected {expected}"),
                });
            }
            self.entries.push(entry);
        }
        Ok(self.last_index())
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        match self.slot(index).and_then(|i| self.entries.get(i)) {
            Some(entry) if entry.index != index => Err(RaftError::LogCorruption {
                index,
                detail: format!("entry at slot carries index {}", entry.index),
            }),
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        if end <= start {
            return Ok(vec![]);
        }
        let start_idx = match self.slot(start) {
            Some(i) => i.min(self.entries.len()),
            None => return Ok(vec![]),
        };
        let end_idx = self
            .slot(end)
            .unwrap_or(self.entries.len())
            .min(self.entries.len());

        Ok(self.entries[start_idx..end_idx].to_vec())
    }

    fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>> {
        self.get_range(start, self.last_index() + 1)
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if let Some(idx) = self.slot(index) {
            self.entries.truncate(idx);
        }
        Ok(())
    }

    fn compact_up_to(&mut self, index: LogIndex) -> Result<()> {
        if let Some(idx) = self.slot(index) {
            if idx < self.entries.len() {
                self.entries.drain(0..=idx);
            } else {
                self.entries.clear();
            }
        }
        Ok(())
    }

    fn first_index(&self) -> LogIndex {
        if let Some(first) = self.entries.first() {
            first.index
        } else {
            self.offset()
        }
    }

    fn last_index(&self) -> LogIndex {
        if let Some(last) = self.entries.last() {
            last.index
        } else {
            self.snapshot
                .as_ref()
                .map(|s| s.metadata.last_included_index)
                .unwrap_or(LogIndex::ZERO)
        }
    }

    fn last_term(&self) -> Term {
        if let Some(last) = self.entries.last() {
            last.term
        } else if let Some(snapshot) = &self.snapshot {
            snapshot.metadata.last_included_term
        } else {
            Term(0)
        }
    }

    fn term_of(&self, index: LogIndex) -> Result<Option<Term>> {
        // Physical entries win; the trailing window can extend below the
        // snapshot boundary.
        if let Some(entry) = self.get(index)? {
            return Ok(Some(entry.term));
        }
        if let Some(snapshot) = &self.snapshot {
            if index == snapshot.metadata.last_included_index {
                return Ok(Some(snapshot.metadata.last_included_term));
            }
        }
        Ok(None)
    }

    fn set_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot.clone()
    }

    fn reset(&mut self, snapshot: Snapshot) -> Result<()> {
        self.entries.clear();
        self.snapshot = Some(snapshot);
        Ok(())
    }
}

/// Shared handle to the partition's log.
///
/// The log is exclusively mutated by the partition's serialized context;
/// the lock exists so read-only observers (appliers, tests) can share the
/// handle.
pub struct RaftLog {
    storage: Arc<RwLock<Box<dyn LogStorage>>>,
}

impl RaftLog {
    pub fn new(storage: Box<dyn LogStorage>) -> Self {
        Self {
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    pub fn new_memory() -> Self {
        Self::new(Box::new(MemoryLog::new()))
    }

    pub fn append(&self, entries: Vec<Entry>) -> Result<LogIndex> {
        self.storage.write().append(entries)
    }

    pub fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        self.storage.read().get(index)
    }

    pub fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        self.storage.read().get_range(start, end)
    }

    pub fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>> {
        self.storage.read().get_from(start)
    }

    pub fn truncate_from(&self, index: LogIndex) -> Result<()> {
        self.storage.write().truncate_from(index)
    }

    pub fn compact_up_to(&self, index: LogIndex) -> Result<()> {
        self.storage.write().compact_up_to(index)
    }

    pub fn first_index(&self) -> LogIndex {
        self.storage.read().first_index()
    }

    pub fn last_index(&self) -> LogIndex {
        self.storage.read().last_index()
    }

    pub fn last_term(&self) -> Term {
        self.storage.read().last_term()
    }

    pub fn term_of(&self, index: LogIndex) -> Result<Option<Term>> {
        self.storage.read().term_of(index)
    }

    pub fn set_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.storage.write().set_snapshot(snapshot)
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.storage.read().snapshot()
    }

    pub fn reset(&self, snapshot: Snapshot) -> Result<()> {
        self.storage.write().reset(snapshot)
    }
}

impl Clone for RaftLog {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryPayload, SnapshotMetadata};

    fn cmd(term: u64, index: u64) -> Entry {
        Entry::new(
            Term(term),
            LogIndex(index),
            EntryPayload::Command {
                session: 1,
                sequence: index,
                op: format!("cmd{index}").into_bytes(),
            },
        )
    }

    #[test]
    fn test_append_and_get() {
        let mut log = MemoryLog::new();

        let last = log.append(vec![cmd(1, 1), cmd(1, 2), cmd(2, 3)]).unwrap();
        assert_eq!(last, LogIndex(3));
        assert_eq!(log.last_term(), Term(2));
        assert_eq!(log.first_index(), LogIndex(1));

        let entry = log.get(LogIndex(2)).unwrap().unwrap();
        assert_eq!(entry.term, Term(1));
        assert!(log.get(LogIndex(9)).unwrap().is_none());
    }

    #[test]
    fn test_out_of_order_append_is_corruption() {
        let mut log = MemoryLog::new();
        log.append(vec![cmd(1, 1)]).unwrap();

        let err = log.append(vec![cmd(1, 3)]).unwrap_err();
        assert!(matches!(err, RaftError::LogCorruption { .. }));
    }

    #[test]
    fn test_truncate_from() {
        let mut log = MemoryLog::new();
        log.append(vec![cmd(1, 1), cmd(1, 2), cmd(2, 3)]).unwrap();

        log.truncate_from(LogIndex(2)).unwrap();
        assert_eq!(log.last_index(), LogIndex(1));
        assert!(log.get(LogIndex(2)).unwrap().is_none());

        // The log accepts a fresh tail at the truncation point.
        log.append(vec![cmd(3, 2)]).unwrap();
        assert_eq!(log.last_term(), Term(3));
    }

    #[test]
    fn test_get_range() {
        let mut log = MemoryLog::new();
        log.append(vec![cmd(1, 1), cmd(1, 2), cmd(2, 3)]).unwrap();

        let range = log.get_range(LogIndex(1), LogIndex(3)).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].index, LogIndex(1));
        assert_eq!(range[1].index, LogIndex(2));

        assert!(log.get_range(LogIndex(4), LogIndex(9)).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_compaction() {
        let mut log = MemoryLog::new();
        log.append(vec![cmd(1, 1), cmd(1, 2), cmd(2, 3)]).unwrap();

        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: LogIndex(2),
                last_included_term: Term(1),
                members: vec![],
            },
            data: b"state".to_vec(),
        };

        log.set_snapshot(snapshot).unwrap();
        log.compact_up_to(LogIndex(2)).unwrap();

        assert_eq!(log.first_index(), LogIndex(3));
        assert_eq!(log.last_index(), LogIndex(3));
        assert!(log.get(LogIndex(1)).unwrap().is_none());
        // Boundary term still answerable from snapshot metadata.
        assert_eq!(log.term_of(LogIndex(2)).unwrap(), Some(Term(1)));
    }

    #[test]
    fn test_reset_replaces_log() {
        let mut log = MemoryLog::new();
        log.append(vec![cmd(1, 1), cmd(1, 2)]).unwrap();

        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: LogIndex(10),
                last_included_term: Term(4),
                members: vec![],
            },
            data: b"state".to_vec(),
        };
        log.reset(snapshot).unwrap();

        assert_eq!(log.last_index(), LogIndex(10));
        assert_eq!(log.last_term(), Term(4));
        assert!(log.get(LogIndex(1)).unwrap().is_none());

        // Appends continue from the snapshot boundary.
        log.append(vec![cmd(4, 11)]).unwrap();
        assert_eq!(log.last_index(), LogIndex(11));
    }
}
