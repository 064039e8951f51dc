use parking_lot::RwLock;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::sync::SemaphorePermit;

use crate::core::Cause;
use crate::fiber;
use crate::raise;

/// A reference whose updates may suspend.
///
/// Every update holds a single-permit lock from the moment it reads the
/// current value until it writes the new one, so effectful updates never
/// interleave. [`SynchronizedRef::get`] and [`SynchronizedRef::set`] skip the
/// lock: a reader may see the value from before or after a concurrent
/// update, never a partial one.
///
/// An update that is interrupted or fails leaves the value untouched and
/// releases the lock.
pub struct SynchronizedRef<A> {
  inner: Arc<Inner<A>>,
}

struct Inner<A> {
  value: RwLock<A>,
  lock: Semaphore,
}

impl<A> SynchronizedRef<A>
where
  A: Clone + Send + Sync,
{
  pub fn new(value: A) -> Self {
    Self {
      inner: Arc::new(Inner {
        value: RwLock::new(value),
        lock: Semaphore::new(1),
      }),
    }
  }

  async fn acquire(&self) -> SemaphorePermit<'_> {
    fiber::checkpoint().await;

    match self.inner.lock.acquire().await {
      Ok(permit) => permit,
      Err(_) => raise!(Error, SysInv, "synchronized ref lock is closed"),
    }
  }

  // ---------------------------------------------------------------------------
  // Unlocked Access
  // ---------------------------------------------------------------------------

  /// Reads the current value without taking the lock.
  pub fn get(&self) -> A {
    self.inner.value.read().clone()
  }

  /// Replaces the value without taking the lock.
  pub fn set(&self, value: A) {
    *self.inner.value.write() = value;
  }

  /// Reads the current value once no update is in progress.
  pub async fn get_locked(&self) -> A {
    let _permit: SemaphorePermit<'_> = self.acquire().await;
    self.get()
  }

  /// Replaces the value once no update is in progress.
  pub async fn set_locked(&self, value: A) {
    let _permit: SemaphorePermit<'_> = self.acquire().await;
    self.set(value);
  }

  // ---------------------------------------------------------------------------
  // Effectful Updates
  // ---------------------------------------------------------------------------

  /// Runs `f` on the current value under the lock, stores the second half of
  /// its output, and returns the first half.
  pub async fn modify_effect<B, E, F, Fut>(&self, f: F) -> std::result::Result<B, Cause<E>>
  where
    F: FnOnce(A) -> Fut,
    Fut: Future<Output = std::result::Result<(B, A), Cause<E>>>,
  {
    let _permit: SemaphorePermit<'_> = self.acquire().await;
    let (output, value): (B, A) = f(self.get()).await?;

    self.set(value);

    Ok(output)
  }

  /// Like [`SynchronizedRef::modify_effect`], but leaves the value unchanged
  /// and returns `default` when `f` declines to update.
  pub async fn modify_some_effect<B, E, F, Fut>(&self, default: B, f: F) -> std::result::Result<B, Cause<E>>
  where
    F: FnOnce(A) -> Option<Fut>,
    Fut: Future<Output = std::result::Result<(B, A), Cause<E>>>,
  {
    self
      .modify_effect(move |current| async move {
        match f(current.clone()) {
          Some(update) => update.await,
          None => Ok((default, current)),
        }
      })
      .await
  }

  pub async fn update_effect<E, F, Fut>(&self, f: F) -> std::result::Result<(), Cause<E>>
  where
    F: FnOnce(A) -> Fut,
    Fut: Future<Output = std::result::Result<A, Cause<E>>>,
  {
    self
      .modify_effect(move |current| async move {
        let next: A = f(current).await?;
        Ok::<((), A), Cause<E>>(((), next))
      })
      .await
  }

  /// Updates the value with `f` and returns the new value.
  pub async fn update_and_get_effect<E, F, Fut>(&self, f: F) -> std::result::Result<A, Cause<E>>
  where
    F: FnOnce(A) -> Fut,
    Fut: Future<Output = std::result::Result<A, Cause<E>>>,
  {
    self
      .modify_effect(move |current| async move {
        let next: A = f(current).await?;
        Ok::<(A, A), Cause<E>>((next.clone(), next))
      })
      .await
  }

  /// Updates the value with `f` and returns the previous value.
  pub async fn get_and_update_effect<E, F, Fut>(&self, f: F) -> std::result::Result<A, Cause<E>>
  where
    F: FnOnce(A) -> Fut,
    Fut: Future<Output = std::result::Result<A, Cause<E>>>,
  {
    self
      .modify_effect(move |current| async move {
        let next: A = f(current.clone()).await?;
        Ok::<(A, A), Cause<E>>((current, next))
      })
      .await
  }

  // ---------------------------------------------------------------------------
  // Pure Updates
  // ---------------------------------------------------------------------------

  /// Applies `f` under the lock, stores the second half of its output, and
  /// returns the first half.
  pub async fn modify<B, F>(&self, f: F) -> B
  where
    F: FnOnce(A) -> (B, A),
  {
    let _permit: SemaphorePermit<'_> = self.acquire().await;
    let mut slot = self.inner.value.write();
    let (output, value): (B, A) = f(slot.clone());

    *slot = value;

    output
  }

  pub async fn update<F>(&self, f: F)
  where
    F: FnOnce(A) -> A,
  {
    self.modify(move |current| ((), f(current))).await
  }

  pub async fn update_and_get<F>(&self, f: F) -> A
  where
    F: FnOnce(A) -> A,
  {
    self
      .modify(move |current| {
        let next: A = f(current);
        (next.clone(), next)
      })
      .await
  }

  pub async fn get_and_update<F>(&self, f: F) -> A
  where
    F: FnOnce(A) -> A,
  {
    self
      .modify(move |current| {
        let next: A = f(current.clone());
        (current, next)
      })
      .await
  }

  pub async fn get_and_set(&self, value: A) -> A {
    self.modify(move |current| (current, value)).await
  }
}

impl<A> Clone for SynchronizedRef<A> {
  #[inline]
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<A> Debug for SynchronizedRef<A>
where
  A: Debug,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.debug_struct("SynchronizedRef")
      .field("value", &*self.inner.value.read())
      .field("locked", &(self.inner.lock.available_permits() == 0))
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
