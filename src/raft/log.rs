//! The consensus log: an ordered sequence of commands with the terms they
//! were proposed in.
//!
//! The log is the replicated source of truth for command order. The leader
//! appends client commands to its own log and replicates them to followers,
//! who may truncate their uncommitted tail when it conflicts with the
//! leader's. Durability is not the log's concern: accepted writes are made
//! durable by the WAL, and the log is rebuilt through replication after a
//! restart.
//!
//! Invariants:
//!
//! * Entry indexes are contiguous starting at 0 (no gaps).
//! * Entry terms never decrease from the previous entry.
//! * The commit cursor never regresses and always stays below the log length.
//! * The apply cursor only moves forward, one entry at a time, in index order.

/// A leader term.
pub type Term = u64;

/// A log index. The log is indexed from 0; -1 means "none", and appears on
/// the wire as the prevLogIndex of an append starting at the head of the log.
pub type Index = i64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// The term in which the entry was appended.
    pub term: Term,
    /// The state machine command, e.g. `SET key value`.
    pub command: String,
}

/// The ordered command log with its commit and apply cursors.
pub struct Log {
    entries: Vec<Entry>,
    /// The highest index known to be committed, or -1.
    commit_index: Index,
    /// The highest index applied to the state machine, or -1.
    applied_index: Index,
}

impl Log {
    /// Creates an empty log.
    pub fn new() -> Log {
        Log { entries: Vec::new(), commit_index: -1, applied_index: -1 }
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the log has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the index of the last entry, or -1 if the log is empty.
    pub fn last_index(&self) -> Index {
        self.entries.len() as Index - 1
    }

    /// Returns the commit cursor (-1 if nothing is committed).
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Returns the apply cursor (-1 if nothing has been applied).
    pub fn applied_index(&self) -> Index {
        self.applied_index
    }

    /// Appends a command at the given term, returning its index. Terms must
    /// never regress.
    pub fn append(&mut self, term: Term, command: String) -> Index {
        if let Some(last) = self.entries.last() {
            assert!(term >= last.term, "term regression {} → {}", last.term, term);
        }
        self.entries.push(Entry { term, command });
        self.last_index()
    }

    /// Fetches the entry at an index, or None if it does not exist.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        usize::try_from(index).ok().and_then(|i| self.entries.get(i))
    }

    /// Returns the entries from the given index (inclusive) to the end. An
    /// out-of-range start yields an empty slice.
    pub fn entries_from(&self, from: Index) -> &[Entry] {
        let from = from.clamp(0, self.entries.len() as Index) as usize;
        &self.entries[from..]
    }

    /// Truncates the log at the given index and appends the entries there.
    /// This is the follower's conflict resolution: everything at and after
    /// the insertion point is replaced with the leader's entries.
    pub fn truncate_and_append(&mut self, at: Index, entries: Vec<Entry>) {
        let at = at.clamp(0, self.entries.len() as Index) as usize;
        self.entries.truncate(at);
        self.entries.extend(entries);
    }

    /// Advances the commit cursor. The index must exist, and the cursor never
    /// regresses.
    pub fn commit(&mut self, index: Index) {
        assert!(index >= self.commit_index, "commit regression {} → {}", self.commit_index, index);
        assert!(index < self.entries.len() as Index, "commit index {index} beyond log");
        self.commit_index = index;
    }

    /// Marks an entry as applied to the state machine without waiting for the
    /// commit cursor. This is the leader's optimistic apply path: the entry's
    /// effect is already in the WAL and the store when it is appended.
    pub fn mark_applied(&mut self, index: Index) {
        self.applied_index = self.applied_index.max(index);
    }

    /// Takes all entries not yet applied, advancing the apply cursor past
    /// them. The commit cursor follows: with no commit index on the wire, a
    /// follower treats replicated entries as committed by leader authority.
    pub fn take_unapplied(&mut self) -> Vec<Entry> {
        if self.applied_index >= self.last_index() {
            return Vec::new();
        }
        let start = (self.applied_index + 1) as usize;
        let entries = self.entries[start..].to_vec();
        self.applied_index = self.last_index();
        self.commit_index = self.commit_index.max(self.applied_index);
        entries
    }

    /// Takes the committed entries not yet applied, advancing the apply
    /// cursor past them. Empty when the apply cursor has already passed the
    /// commit cursor (the leader applies optimistically).
    pub fn take_committed_unapplied(&mut self) -> Vec<Entry> {
        if self.applied_index >= self.commit_index {
            return Vec::new();
        }
        let start = (self.applied_index + 1) as usize;
        let end = (self.commit_index + 1) as usize;
        let entries = self.entries[start..end].to_vec();
        self.applied_index = self.commit_index;
        entries
    }

    /// Removes all entries and resets the cursors, as if freshly started.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.commit_index = -1;
        self.applied_index = -1;
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: Term, command: &str) -> Entry {
        Entry { term, command: command.to_string() }
    }

    #[test]
    fn append_assigns_contiguous_indexes() {
        let mut log = Log::new();
        assert_eq!(log.last_index(), -1);
        assert_eq!(log.append(1, "SET a 1".to_string()), 0);
        assert_eq!(log.append(1, "SET b 2".to_string()), 1);
        assert_eq!(log.append(2, "SET c 3".to_string()), 2);
        assert_eq!(log.len(), 3);
        assert_eq!(log.get(1).unwrap().command, "SET b 2");
        assert_eq!(log.get(3), None);
        assert_eq!(log.get(-1), None);
    }

    #[test]
    #[should_panic(expected = "term regression")]
    fn append_panics_on_term_regression() {
        let mut log = Log::new();
        log.append(2, "SET a 1".to_string());
        log.append(1, "SET b 2".to_string());
    }

    #[test]
    fn entries_from_clamps_range() {
        let mut log = Log::new();
        log.append(1, "SET a 1".to_string());
        log.append(1, "SET b 2".to_string());

        assert_eq!(log.entries_from(0).len(), 2);
        assert_eq!(log.entries_from(1).len(), 1);
        assert_eq!(log.entries_from(2).len(), 0);
        assert_eq!(log.entries_from(17).len(), 0);
        assert_eq!(log.entries_from(-1).len(), 2);
    }

    #[test]
    fn truncate_and_append_replaces_tail() {
        let mut log = Log::new();
        log.append(1, "SET a 1".to_string());
        log.append(1, "SET b 2".to_string());
        log.append(1, "SET c 3".to_string());

        log.truncate_and_append(1, vec![entry(2, "SET b 9"), entry(2, "SET d 4")]);
        assert_eq!(log.len(), 3);
        assert_eq!(log.get(0).unwrap().command, "SET a 1");
        assert_eq!(log.get(1).unwrap(), &entry(2, "SET b 9"));
        assert_eq!(log.get(2).unwrap(), &entry(2, "SET d 4"));
    }

    #[test]
    fn take_unapplied_advances_both_cursors() {
        let mut log = Log::new();
        log.append(1, "SET a 1".to_string());
        log.append(1, "SET b 2".to_string());

        let entries = log.take_unapplied();
        assert_eq!(entries.len(), 2);
        assert_eq!(log.applied_index(), 1);
        assert_eq!(log.commit_index(), 1);
        assert!(log.take_unapplied().is_empty());
    }

    #[test]
    fn take_committed_unapplied_respects_commit_cursor() {
        let mut log = Log::new();
        log.append(1, "SET a 1".to_string());
        log.append(1, "SET b 2".to_string());
        log.append(1, "SET c 3".to_string());

        log.commit(1);
        let entries = log.take_committed_unapplied();
        assert_eq!(entries.len(), 2);
        assert_eq!(log.applied_index(), 1);

        // Nothing more until the commit cursor advances again.
        assert!(log.take_committed_unapplied().is_empty());
        log.commit(2);
        assert_eq!(log.take_committed_unapplied().len(), 1);
    }

    #[test]
    fn take_committed_unapplied_is_empty_after_optimistic_apply() {
        let mut log = Log::new();
        let index = log.append(1, "SET a 1".to_string());
        log.mark_applied(index);
        log.commit(index);
        assert!(log.take_committed_unapplied().is_empty());
    }

    #[test]
    #[should_panic(expected = "commit regression")]
    fn commit_panics_on_regression() {
        let mut log = Log::new();
        log.append(1, "SET a 1".to_string());
        log.append(1, "SET b 2".to_string());
        log.commit(1);
        log.commit(0);
    }

    #[test]
    fn clear_resets_cursors() {
        let mut log = Log::new();
        log.append(1, "SET a 1".to_string());
        log.commit(0);
        log.mark_applied(0);

        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.commit_index(), -1);
        assert_eq!(log.applied_index(), -1);
    }
}
