use crate::core::Cause;
use crate::core::Never;
use crate::fiber;
use crate::raise;
use crate::stm::Stm;
use crate::stm::TRef;

/// A counting semaphore whose permits are managed transactionally.
///
/// Acquiring more permits than are available retries, so the committing
/// fiber suspends until enough permits are released.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TSemaphore {
  permits: TRef<usize>,
}

impl TSemaphore {
  /// Creates a semaphore with `permits` available permits.
  pub fn new(permits: usize) -> Self {
    Self {
      permits: TRef::new(permits),
    }
  }

  /// A transaction that creates a fresh semaphore.
  pub fn make<E>(permits: usize) -> Stm<Self, E>
  where
    E: Send + 'static,
  {
    Stm::sync(move || Self::new(permits))
  }

  /// The number of permits currently available.
  pub fn available<E>(&self) -> Stm<usize, E>
  where
    E: Send + 'static,
  {
    self.permits.get()
  }

  #[inline]
  pub fn acquire<E>(&self) -> Stm<(), E>
  where
    E: Send + 'static,
  {
    self.acquire_n(1)
  }

  /// Takes `count` permits, retrying until that many are available.
  pub fn acquire_n<E>(&self, count: usize) -> Stm<(), E>
  where
    E: Send + 'static,
  {
    let permits: TRef<usize> = self.permits.clone();

    self.permits.get().flat_map(move |available| {
      if available >= count {
        permits.set(available - count)
      } else {
        Stm::retry()
      }
    })
  }

  #[inline]
  pub fn release<E>(&self) -> Stm<(), E>
  where
    E: Send + 'static,
  {
    self.release_n(1)
  }

  /// Returns `count` permits.
  ///
  /// # Panics
  ///
  /// Panics if the permit count overflows.
  pub fn release_n<E>(&self, count: usize) -> Stm<(), E>
  where
    E: Send + 'static,
  {
    self.permits.update(move |available| match available.checked_add(count) {
      Some(available) => available,
      None => raise!(Error, BadArg, "semaphore permit count overflow"),
    })
  }

  /// Runs `future` while holding one permit.
  ///
  /// The permit is returned however `future` ends, interruption included.
  pub async fn with_permit<F, A, E>(&self, future: F) -> Result<A, Cause<E>>
  where
    F: Future<Output = Result<A, Cause<E>>>,
    E: Send + 'static,
  {
    self.acquire::<E>().commit().await?;

    let this: Self = self.clone();

    fiber::ensuring(future, async move {
      let _ignore: Result<(), Cause<Never>> = this.release::<Never>().commit().await;
    })
    .await
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::core::Cause;
  use crate::core::Never;
  use crate::stm::Stm;
  use crate::stm::TSemaphore;

  #[tokio::test]
  async fn test_acquire_and_release() {
    let semaphore: TSemaphore = TSemaphore::new(2);

    semaphore.acquire_n::<Never>(2).commit().await.unwrap();
    assert_eq!(semaphore.available::<Never>().commit().await, Ok(0));

    semaphore.release::<Never>().commit().await.unwrap();
    assert_eq!(semaphore.available::<Never>().commit().await, Ok(1));
  }

  #[tokio::test]
  async fn test_acquire_falls_back_when_exhausted() {
    let semaphore: TSemaphore = TSemaphore::new(0);
    let stm: Stm<bool, Never> = semaphore
      .acquire()
      .map(|()| true)
      .or_else(Stm::succeed(false));

    assert_eq!(stm.commit().await, Ok(false));
  }

  #[tokio::test]
  async fn test_with_permit_releases_on_failure() {
    let semaphore: TSemaphore = TSemaphore::new(1);

    let result: Result<u32, Cause<&str>> = semaphore
      .with_permit(async { Err(Cause::fail("boom")) })
      .await;

    assert_eq!(result, Err(Cause::fail("boom")));
    assert_eq!(semaphore.available::<Never>().commit().await, Ok(1));
  }
}
