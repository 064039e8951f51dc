use hashbrown::HashMap;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;
use std::sync::Arc;

use crate::core::Exit;
use crate::core::FiberId;
use crate::supervisor::Propagation;
use crate::supervisor::Supervise;
use crate::supervisor::Supervisor;

/// A supervisor that keeps a registry of live fibers.
///
/// Created by [`Supervisor::track`]. Clones share the same registry.
#[derive(Clone)]
pub struct Track {
  registry: Arc<Registry>,
  supervisor: Supervisor,
}

#[derive(Default)]
struct Registry {
  fibers: Mutex<HashMap<FiberId, FiberId>>,
}

impl Supervise for Registry {
  fn on_start(&self, fiber: &FiberId, parent: &FiberId) -> Propagation {
    self.fibers.lock().insert(fiber.clone(), parent.clone());
    Propagation::Continue
  }

  fn on_end(&self, _exit: &Exit<(), ()>, fiber: &FiberId) -> Propagation {
    self.fibers.lock().remove(fiber);
    Propagation::Continue
  }
}

impl Track {
  /// Returns the supervisor feeding this registry.
  #[inline]
  pub fn supervisor(&self) -> Supervisor {
    self.supervisor.clone()
  }

  /// Returns the ids of every live fiber, in ascending order.
  pub fn fibers(&self) -> Vec<FiberId> {
    let mut fibers: Vec<FiberId> = self.registry.fibers.lock().keys().cloned().collect();
    fibers.sort_by_key(FiberId::id);
    fibers
  }

  /// Returns the parent of a live fiber.
  pub fn parent(&self, fiber: &FiberId) -> Option<FiberId> {
    self.registry.fibers.lock().get(fiber).cloned()
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.registry.fibers.lock().len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Debug for Track {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.debug_struct("Track")
      .field("supervisor", &self.supervisor)
      .field("fibers", &self.len())
      .finish()
  }
}

impl Supervisor {
  /// Creates a supervisor tracking every live fiber it observes.
  pub fn track() -> Track {
    let registry: Arc<Registry> = Arc::new(Registry::default());
    let supervisor: Supervisor = Supervisor::from_arc(registry.clone());

    Track {
      registry,
      supervisor,
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
