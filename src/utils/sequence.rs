use crate::error::fatal;
use crate::loom::hint;
use crate::loom::sync::atomic::AtomicU64;
use crate::loom::sync::atomic::Ordering;

/// A lock-free generator of unique, strictly increasing identifiers.
///
/// Identifiers start at `1`; `0` is never produced so it can be used as a
/// sentinel by callers. Exhausting the sequence aborts the program.
#[derive(Debug)]
#[repr(transparent)]
pub struct Sequence {
  inner: AtomicU64,
}

impl Sequence {
  /// Creates a new sequence whose first identifier is `1`.
  #[inline]
  pub fn new() -> Self {
    Self {
      inner: AtomicU64::new(0),
    }
  }

  /// Returns the next identifier.
  pub fn next(&self) -> u64 {
    let mut last: u64 = self.inner.load(Ordering::Relaxed);

    'next: loop {
      let Some(id) = last.checked_add(1) else {
        exhausted();
      };

      match self
        .inner
        .compare_exchange_weak(last, id, Ordering::Relaxed, Ordering::Relaxed)
      {
        Ok(_) => break 'next id,
        Err(next) => {
          hint::spin_loop();
          last = next;
        }
      }
    }
  }

  /// Returns the most recently produced identifier, or `0` if none.
  #[inline]
  pub fn current(&self) -> u64 {
    self.inner.load(Ordering::Relaxed)
  }
}

impl Default for Sequence {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

#[cold]
fn exhausted() -> ! {
  fatal!("failed to generate unique identifier: sequence exhausted")
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
