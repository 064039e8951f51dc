use std::any::Any;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::mem;
use std::sync::Arc;
use std::sync::LazyLock;

use crate::consts;
use crate::core::Defect;
use crate::stm::TExit;
use crate::stm::journal::Journal;
use crate::stm::journal::Snapshot;

/// A type-erased value or error flowing through the driver.
pub(crate) type Erased = Box<dyn Any + Send>;

/// The erased outcome of one instruction.
pub(crate) type Step = TExit<Erased, Erased>;

pub(crate) type Primitive = Arc<dyn Fn(&mut Journal) -> Step + Send + Sync>;
pub(crate) type Cont = Arc<dyn Fn(Erased) -> Arc<Node> + Send + Sync>;
pub(crate) type Func = Arc<dyn Fn(Erased) -> Erased + Send + Sync>;

// -----------------------------------------------------------------------------
// Instructions
// -----------------------------------------------------------------------------

/// A transaction as data.
///
/// Nodes are immutable and shared, so the same program can be run again
/// from the start whenever an attempt is abandoned.
pub(crate) enum Node {
  /// Runs against the journal and produces an outcome.
  Primitive(Primitive),
  /// Continues with the node built from the success value.
  FlatMap(Arc<Node>, Cont),
  /// Transforms the success value.
  Map(Arc<Node>, Func),
  /// Transforms the typed error.
  MapErr(Arc<Node>, Func),
  /// Continues with the node built from the typed error.
  Catch(Arc<Node>, Cont),
  /// Runs the second node if the first one retries.
  OrElse(Arc<Node>, Arc<Node>),
}

impl Node {
  #[inline]
  pub(crate) fn primitive<F>(f: F) -> Arc<Self>
  where
    F: Fn(&mut Journal) -> Step + Send + Sync + 'static,
  {
    Arc::new(Self::Primitive(Arc::new(f)))
  }

  #[inline]
  pub(crate) fn flat_map<F>(node: Arc<Self>, f: F) -> Arc<Self>
  where
    F: Fn(Erased) -> Arc<Node> + Send + Sync + 'static,
  {
    Arc::new(Self::FlatMap(node, Arc::new(f)))
  }

  #[inline]
  pub(crate) fn map<F>(node: Arc<Self>, f: F) -> Arc<Self>
  where
    F: Fn(Erased) -> Erased + Send + Sync + 'static,
  {
    Arc::new(Self::Map(node, Arc::new(f)))
  }

  #[inline]
  pub(crate) fn map_err<F>(node: Arc<Self>, f: F) -> Arc<Self>
  where
    F: Fn(Erased) -> Erased + Send + Sync + 'static,
  {
    Arc::new(Self::MapErr(node, Arc::new(f)))
  }

  #[inline]
  pub(crate) fn catch<F>(node: Arc<Self>, f: F) -> Arc<Self>
  where
    F: Fn(Erased) -> Arc<Node> + Send + Sync + 'static,
  {
    Arc::new(Self::Catch(node, Arc::new(f)))
  }

  #[inline]
  pub(crate) fn or_else(first: Arc<Self>, second: Arc<Self>) -> Arc<Self> {
    Arc::new(Self::OrElse(first, second))
  }
}

/// Placeholder swapped in for children while a node is torn down.
static LEAF: LazyLock<Arc<Node>> = LazyLock::new(|| Node::primitive(|_| TExit::Retry));

impl Node {
  /// Moves every child node out of `self` and onto `stack`.
  fn detach(&mut self, stack: &mut Vec<Arc<Node>>) {
    match self {
      Self::Primitive(_) => {}
      Self::FlatMap(node, _) | Self::Map(node, _) | Self::MapErr(node, _) | Self::Catch(node, _) => {
        stack.push(mem::replace(node, Arc::clone(&LEAF)));
      }
      Self::OrElse(first, second) => {
        stack.push(mem::replace(first, Arc::clone(&LEAF)));
        stack.push(mem::replace(second, Arc::clone(&LEAF)));
      }
    }
  }
}

// Chains built by `repeat_n` or `for_each` nest as deep as they are long, so
// tearing them down must not recurse.
impl Drop for Node {
  fn drop(&mut self) {
    let mut stack: Vec<Arc<Node>> = Vec::new();

    self.detach(&mut stack);

    while let Some(node) = stack.pop() {
      if let Ok(mut node) = Arc::try_unwrap(node) {
        node.detach(&mut stack);
      }
    }
  }
}

enum Frame {
  FlatMap(Cont),
  Map(Func),
  MapErr(Func),
  Catch(Cont),
  OrElse(Arc<Node>, Snapshot),
}

// -----------------------------------------------------------------------------
// Driver
// -----------------------------------------------------------------------------

/// Interprets one attempt of a transaction.
///
/// Continuations live on an explicit stack, so arbitrarily long chains of
/// combinators never grow the native stack. Every `yield_op_count` steps the
/// journal is re-validated and an attempt that already read stale data is
/// abandoned with [`TExit::Retry`].
pub(crate) struct Driver<'a> {
  journal: &'a mut Journal,
  stack: Vec<Frame>,
  yield_op_count: u32,
  steps: u32,
}

impl<'a> Driver<'a> {
  pub(crate) fn new(journal: &'a mut Journal, yield_op_count: u32) -> Self {
    Self {
      journal,
      stack: Vec::with_capacity(consts::CAP_STM_STACK),
      yield_op_count: yield_op_count.max(1),
      steps: 0,
    }
  }

  /// Runs `root` to an outcome, turning panics into [`TExit::Die`].
  pub(crate) fn run(mut self, root: &Arc<Node>) -> Step {
    match panic::catch_unwind(AssertUnwindSafe(|| self.interpret(root))) {
      Ok(step) => step,
      Err(payload) => TExit::Die(Defect::from_panic(payload)),
    }
  }

  fn interpret(&mut self, root: &Arc<Node>) -> Step {
    let mut current: Arc<Node> = Arc::clone(root);

    'run: loop {
      self.steps = self.steps.wrapping_add(1);

      if self.steps % self.yield_op_count == 0 && !self.journal.is_valid() {
        return TExit::Retry;
      }

      let mut exit: Step = match &*current {
        Node::Primitive(primitive) => primitive(&mut *self.journal),
        Node::FlatMap(node, cont) => {
          self.stack.push(Frame::FlatMap(Arc::clone(cont)));
          current = Arc::clone(node);
          continue 'run;
        }
        Node::Map(node, func) => {
          self.stack.push(Frame::Map(Arc::clone(func)));
          current = Arc::clone(node);
          continue 'run;
        }
        Node::MapErr(node, func) => {
          self.stack.push(Frame::MapErr(Arc::clone(func)));
          current = Arc::clone(node);
          continue 'run;
        }
        Node::Catch(node, cont) => {
          self.stack.push(Frame::Catch(Arc::clone(cont)));
          current = Arc::clone(node);
          continue 'run;
        }
        Node::OrElse(first, second) => {
          self.stack.push(Frame::OrElse(Arc::clone(second), self.journal.snapshot()));
          current = Arc::clone(first);
          continue 'run;
        }
      };

      'unwind: loop {
        exit = match (self.stack.pop(), exit) {
          (None, exit) => break 'run exit,
          (Some(Frame::FlatMap(cont)), TExit::Succeed(value)) => {
            current = cont(value);
            break 'unwind;
          }
          (Some(Frame::Catch(cont)), TExit::Fail(error)) => {
            current = cont(error);
            break 'unwind;
          }
          (Some(Frame::OrElse(second, snapshot)), TExit::Retry) => {
            self.journal.rollback(snapshot);
            current = second;
            break 'unwind;
          }
          (Some(Frame::Map(func)), TExit::Succeed(value)) => TExit::Succeed(func(value)),
          (Some(Frame::MapErr(func)), TExit::Fail(error)) => TExit::Fail(func(error)),
          (Some(_), exit) => exit,
        };
      }
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use crate::stm::TExit;
  use crate::stm::driver::Driver;
  use crate::stm::driver::Erased;
  use crate::stm::driver::Node;
  use crate::stm::driver::Step;
  use crate::stm::journal::Journal;

  fn succeed(value: u64) -> Arc<Node> {
    Node::primitive(move |_| TExit::Succeed(Box::new(value)))
  }

  fn retry() -> Arc<Node> {
    Node::primitive(|_| TExit::Retry)
  }

  fn number(step: Step) -> Option<u64> {
    match step {
      TExit::Succeed(value) => value.downcast::<u64>().ok().map(|value| *value),
      _ => None,
    }
  }

  fn run(node: &Arc<Node>) -> Step {
    let mut journal: Journal = Journal::new();
    Driver::new(&mut journal, 64).run(node)
  }

  #[test]
  fn test_nested_chains_use_explicit_stack() {
    let mut node: Arc<Node> = succeed(0);

    for _ in 0..1_000 {
      node = Node::flat_map(node, |value: Erased| {
        let value: u64 = *value.downcast::<u64>().unwrap();
        succeed(value + 1)
      });
    }

    assert_eq!(number(run(&node)), Some(1_000));
  }

  #[test]
  fn test_dropping_long_chain_does_not_recurse() {
    let mut node: Arc<Node> = succeed(0);

    for _ in 0..200_000 {
      node = Node::map(node, |value: Erased| value);
      node = Node::or_else(node, retry());
    }

    drop(node);
  }

  #[test]
  fn test_or_else_runs_second_on_retry() {
    let node: Arc<Node> = Node::or_else(retry(), succeed(7));

    assert_eq!(number(run(&node)), Some(7));
  }

  #[test]
  fn test_panic_is_die() {
    let node: Arc<Node> = Node::primitive(|_| -> Step { panic!("kaboom") });

    match run(&node) {
      TExit::Die(defect) => assert_eq!(defect.message(), "kaboom"),
      _ => panic!("expected a defect"),
    }
  }
}
