use std::collections::BTreeSet;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;
use std::sync::LazyLock;
use std::time::Duration;
use std::time::SystemTime;
use triomphe::Arc;

use crate::utils::Sequence;

static FIBER_IDS: LazyLock<Sequence> = LazyLock::new(Sequence::new);

/// Identifies a fiber.
///
/// Runtime ids are allocated when a fiber is forked and are never reused.
/// Composite ids describe an outcome produced by more than one fiber, for
/// example the loser and the winner of a race.
///
/// # Examples
///
/// ```
/// use strand::core::FiberId;
///
/// let a: FiberId = FiberId::next();
/// let b: FiberId = FiberId::next();
///
/// assert_ne!(a, b);
/// assert_eq!(a.combine(&b).ids().len(), 2);
/// assert_eq!(FiberId::NONE.combine(&a), a);
/// ```
#[derive(Clone, Hash, PartialEq, Eq)]
pub enum FiberId {
  /// The absence of a fiber, used for work started outside the runtime.
  None,
  /// A single fiber, with its sequence number and start time.
  Runtime {
    /// Sequence number, unique for the lifetime of the program.
    id: u64,
    /// Start time in milliseconds since the Unix epoch.
    started_at: u64,
  },
  /// Two ids acting together.
  Composite(Arc<FiberId>, Arc<FiberId>),
}

impl FiberId {
  /// The empty fiber id.
  pub const NONE: Self = Self::None;

  /// Allocates a fresh runtime fiber id.
  pub fn next() -> Self {
    Self::Runtime {
      id: FIBER_IDS.next(),
      started_at: unix_millis(),
    }
  }

  /// Returns `true` if this is [`FiberId::None`].
  #[inline]
  pub const fn is_none(&self) -> bool {
    matches!(self, Self::None)
  }

  /// Returns the sequence number of a runtime id.
  #[inline]
  pub const fn id(&self) -> Option<u64> {
    match self {
      Self::Runtime { id, .. } => Some(*id),
      Self::None | Self::Composite(_, _) => None,
    }
  }

  /// Returns the start time of a runtime id as a duration since the Unix epoch.
  #[inline]
  pub const fn started_at(&self) -> Option<Duration> {
    match self {
      Self::Runtime { started_at, .. } => Some(Duration::from_millis(*started_at)),
      Self::None | Self::Composite(_, _) => None,
    }
  }

  /// Combines two ids. [`FiberId::None`] is the identity.
  pub fn combine(&self, other: &Self) -> Self {
    match (self, other) {
      (Self::None, _) => other.clone(),
      (_, Self::None) => self.clone(),
      (_, _) => Self::Composite(Arc::new(self.clone()), Arc::new(other.clone())),
    }
  }

  /// Combines every id in `iter`.
  pub fn combine_all<'a, I>(iter: I) -> Self
  where
    I: IntoIterator<Item = &'a FiberId>,
  {
    iter
      .into_iter()
      .fold(Self::None, |acc, next| acc.combine(next))
  }

  /// Returns the set of sequence numbers referenced by this id.
  pub fn ids(&self) -> BTreeSet<u64> {
    let mut ids: BTreeSet<u64> = BTreeSet::new();
    let mut stack: Vec<&FiberId> = vec![self];

    while let Some(next) = stack.pop() {
      match next {
        Self::None => {}
        Self::Runtime { id, .. } => {
          ids.insert(*id);
        }
        Self::Composite(left, right) => {
          stack.push(right);
          stack.push(left);
        }
      }
    }

    ids
  }

  /// Returns a human-readable name for the fiber, e.g. `strand-fiber-#12`.
  pub fn thread_name(&self) -> String {
    format!("strand-fiber-{self}")
  }
}

impl Default for FiberId {
  #[inline]
  fn default() -> Self {
    Self::None
  }
}

impl Debug for FiberId {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    Display::fmt(self, f)
  }
}

impl Display for FiberId {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    match self {
      Self::None => f.write_str("#none"),
      Self::Runtime { id, .. } => write!(f, "#{id}"),
      Self::Composite(_, _) => {
        let ids: Vec<String> = self.ids().iter().map(|id| format!("#{id}")).collect();
        f.write_str(&ids.join("+"))
      }
    }
  }
}

#[inline]
fn unix_millis() -> u64 {
  SystemTime::now()
    .duration_since(SystemTime::UNIX_EPOCH)
    .map(|time| time.as_millis() as u64)
    .unwrap_or(0)
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
