use crossbeam_utils::CachePadded;
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::LazyLock;
use tokio::sync::Notify;
use triomphe::Arc;

use crate::consts;
use crate::loom::sync::atomic::AtomicU64;
use crate::loom::sync::atomic::Ordering;
use crate::utils::Sequence;

/// A type-erased value held by a transactional ref.
pub(crate) type Value = std::sync::Arc<dyn Any + Send + Sync>;

/// Source of transactional ref ids.
static SLOT_IDS: LazyLock<Sequence> = LazyLock::new(Sequence::new);

/// Serializes validation and publication of every commit.
static COMMIT: Mutex<()> = Mutex::new(());

// -----------------------------------------------------------------------------
// Slot
// -----------------------------------------------------------------------------

/// The shared state of a transactional ref.
///
/// The value is only replaced while the global commit lock is held, and the
/// version is bumped while the value lock is still held, so a reader holding
/// the value lock always sees a matching `(version, value)` pair.
pub(crate) struct Slot {
  id: u64,
  version: CachePadded<AtomicU64>,
  value: RwLock<Value>,
  todos: Mutex<HashMap<u64, std::sync::Arc<Notify>>>,
}

impl Slot {
  pub(crate) fn new(value: Value) -> Self {
    Self {
      id: SLOT_IDS.next(),
      version: CachePadded::new(AtomicU64::new(0)),
      value: RwLock::new(value),
      todos: Mutex::new(HashMap::new()),
    }
  }

  #[inline]
  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  #[inline]
  pub(crate) fn version(&self) -> u64 {
    self.version.load(Ordering::Acquire)
  }

  /// Returns the current value together with the version it belongs to.
  pub(crate) fn load(&self) -> (u64, Value) {
    let value = self.value.read();
    let version: u64 = self.version.load(Ordering::Acquire);

    (version, std::sync::Arc::clone(&value))
  }

  /// Publishes `value` and drains the transactions waiting for a change.
  ///
  /// Callers must hold the commit lock.
  fn store(&self, value: Value, woken: &mut Vec<std::sync::Arc<Notify>>) {
    {
      let mut slot = self.value.write();
      *slot = value;
      self.version.fetch_add(1, Ordering::AcqRel);
    }

    woken.extend(self.todos.lock().drain().map(|(_, notify)| notify));
  }

  fn add_todo(&self, txn: u64, notify: &std::sync::Arc<Notify>) {
    self.todos.lock().insert(txn, std::sync::Arc::clone(notify));
  }

  fn remove_todo(&self, txn: u64) {
    self.todos.lock().remove(&txn);
  }
}

// -----------------------------------------------------------------------------
// Journal
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct JournalEntry {
  slot: Arc<Slot>,
  version: u64,
  observed: Value,
  current: Value,
  written: bool,
}

impl JournalEntry {
  fn reset(self) -> Self {
    Self {
      current: std::sync::Arc::clone(&self.observed),
      written: false,
      ..self
    }
  }
}

/// Copy of a journal taken before an alternative branch runs.
pub(crate) struct Snapshot {
  entries: HashMap<u64, JournalEntry>,
}

/// The private log of one transaction attempt.
///
/// Every ref touched by the attempt is recorded with the version it had when
/// it was first accessed. Writes stay in the journal until commit.
pub(crate) struct Journal {
  entries: HashMap<u64, JournalEntry>,
}

impl Journal {
  pub(crate) fn new() -> Self {
    Self {
      entries: HashMap::with_capacity(consts::CAP_STM_JOURNAL),
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.entries.len()
  }

  /// Reads `slot`, seeing earlier writes of the same transaction.
  pub(crate) fn read(&mut self, slot: &Arc<Slot>) -> Value {
    match self.entries.entry(slot.id()) {
      Entry::Occupied(entry) => std::sync::Arc::clone(&entry.get().current),
      Entry::Vacant(entry) => {
        let (version, value): (u64, Value) = slot.load();

        entry.insert(JournalEntry {
          slot: Arc::clone(slot),
          version,
          observed: std::sync::Arc::clone(&value),
          current: std::sync::Arc::clone(&value),
          written: false,
        });

        value
      }
    }
  }

  /// Buffers a write to `slot`.
  pub(crate) fn write(&mut self, slot: &Arc<Slot>, value: Value) {
    match self.entries.entry(slot.id()) {
      Entry::Occupied(mut entry) => {
        let entry: &mut JournalEntry = entry.get_mut();
        entry.current = value;
        entry.written = true;
      }
      Entry::Vacant(entry) => {
        let (version, observed): (u64, Value) = slot.load();

        entry.insert(JournalEntry {
          slot: Arc::clone(slot),
          version,
          observed,
          current: value,
          written: true,
        });
      }
    }
  }

  /// Returns `true` if no ref in the journal changed since it was accessed.
  pub(crate) fn is_valid(&self) -> bool {
    self
      .entries
      .values()
      .all(|entry| entry.slot.version() == entry.version)
  }

  pub(crate) fn snapshot(&self) -> Snapshot {
    Snapshot {
      entries: self.entries.clone(),
    }
  }

  /// Discards writes made after `snapshot` was taken.
  ///
  /// Refs first read after the snapshot stay in the journal as plain reads,
  /// so a transaction that retries still waits on everything it looked at.
  pub(crate) fn rollback(&mut self, snapshot: Snapshot) {
    let mut entries: HashMap<u64, JournalEntry> = snapshot.entries;

    for (id, entry) in self.entries.drain() {
      entries.entry(id).or_insert_with(|| entry.reset());
    }

    self.entries = entries;
  }

  /// Validates the journal and publishes its writes atomically.
  ///
  /// Returns `false` without publishing anything if a ref changed since it
  /// was read. When `publish` is `false` the journal is only validated.
  pub(crate) fn commit(self, publish: bool) -> bool {
    let mut woken: Vec<std::sync::Arc<Notify>> = Vec::new();

    {
      let _guard = COMMIT.lock();

      if !self.is_valid() {
        return false;
      }

      if publish {
        for entry in self.entries.into_values() {
          if entry.written {
            entry.slot.store(entry.current, &mut woken);
          }
        }
      }
    }

    for notify in woken {
      notify.notify_one();
    }

    true
  }

  /// Suspends until one of the refs in the journal changes.
  ///
  /// Returns immediately if one already changed.
  pub(crate) async fn wait(&self, txn: u64) {
    let notify: std::sync::Arc<Notify> = std::sync::Arc::new(Notify::new());

    let todos: Todos<'_> = Todos { journal: self, txn };

    for entry in self.entries.values() {
      entry.slot.add_todo(txn, &notify);
    }

    if self.is_valid() {
      notify.notified().await;
    }

    drop(todos);
  }
}

/// Unregisters a waiting transaction, even when the wait is abandoned.
struct Todos<'a> {
  journal: &'a Journal,
  txn: u64,
}

impl Drop for Todos<'_> {
  fn drop(&mut self) {
    for entry in self.journal.entries.values() {
      entry.slot.remove_todo(self.txn);
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(all(test, not(loom)))]
mod tests {
  use triomphe::Arc;

  use crate::stm::journal::Journal;
  use crate::stm::journal::Slot;
  use crate::stm::journal::Value;

  fn value(number: u32) -> Value {
    std::sync::Arc::new(number)
  }

  fn number(value: &Value) -> u32 {
    *value.downcast_ref::<u32>().unwrap()
  }

  #[test]
  fn test_read_your_writes() {
    let slot: Arc<Slot> = Arc::new(Slot::new(value(1)));
    let mut journal: Journal = Journal::new();

    assert_eq!(number(&journal.read(&slot)), 1);
    journal.write(&slot, value(2));
    assert_eq!(number(&journal.read(&slot)), 2);
    assert_eq!(number(&slot.load().1), 1);
  }

  #[test]
  fn test_commit_publishes_and_bumps_version() {
    let slot: Arc<Slot> = Arc::new(Slot::new(value(1)));
    let mut journal: Journal = Journal::new();

    journal.write(&slot, value(5));

    assert!(journal.commit(true));
    assert_eq!(slot.version(), 1);
    assert_eq!(number(&slot.load().1), 5);
  }

  #[test]
  fn test_conflict_is_rejected() {
    let slot: Arc<Slot> = Arc::new(Slot::new(value(1)));
    let mut stale: Journal = Journal::new();
    let mut fresh: Journal = Journal::new();

    let _read: Value = stale.read(&slot);
    fresh.write(&slot, value(2));

    assert!(fresh.commit(true));
    assert!(!stale.is_valid());

    stale.write(&slot, value(3));

    assert!(!stale.commit(true));
    assert_eq!(number(&slot.load().1), 2);
  }

  #[test]
  fn test_rollback_keeps_reads() {
    let lhs: Arc<Slot> = Arc::new(Slot::new(value(1)));
    let rhs: Arc<Slot> = Arc::new(Slot::new(value(10)));
    let mut journal: Journal = Journal::new();

    journal.write(&lhs, value(2));

    let snapshot = journal.snapshot();

    journal.write(&lhs, value(3));
    journal.write(&rhs, value(11));
    journal.rollback(snapshot);

    assert_eq!(journal.len(), 2);
    assert_eq!(number(&journal.read(&lhs)), 2);
    assert_eq!(number(&journal.read(&rhs)), 10);
  }
}
