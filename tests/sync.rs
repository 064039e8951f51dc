use std::collections::HashSet;
use std::time::Duration;

use strand::core::Cause;
use strand::core::Exit;
use strand::core::Never;
use strand::fiber;
use strand::fiber::Fiber;
use strand::fiber::Runtime;
use strand::fiber::RuntimeConfig;
use strand::sync::Deferred;
use strand::sync::Handoff;
use strand::sync::Mailbox;
use strand::sync::SynchronizedRef;

fn runtime() -> Runtime {
  Runtime::new(RuntimeConfig::new().worker_threads(4)).unwrap()
}

async fn drain<A, E>(mailbox: &Mailbox<A, E>) -> Result<Vec<A>, Cause<E>>
where
  E: Clone,
{
  let mut output: Vec<A> = Vec::new();

  loop {
    let (batch, done): (Vec<A>, bool) = mailbox.take().await?;

    output.extend(batch);

    if done {
      break Ok(output);
    }
  }
}

// -----------------------------------------------------------------------------
// Mailbox
// -----------------------------------------------------------------------------

#[test]
fn test_mailbox_backpressure_keeps_order() {
  let exit: Exit<Vec<u32>, Never> = runtime().block_on(async {
    let mailbox: Mailbox<u32, Never> = Mailbox::bounded(2);
    let producer: Mailbox<u32, Never> = mailbox.clone();

    let _producer: Fiber<usize, Never> = fiber::fork(async move {
      let accepted: usize = producer.offer_all([1, 2, 3, 4, 5]).await;
      producer.end();
      Ok(accepted)
    });

    drain(&mailbox).await
  });

  assert_eq!(exit.into_result().ok(), Some(vec![1, 2, 3, 4, 5]));
}

#[test]
fn test_mailbox_many_producers() {
  let exit: Exit<Vec<u32>, Never> = runtime().block_on(async {
    let mailbox: Mailbox<u32, Never> = Mailbox::bounded(3);
    let producers: Mailbox<u32, Never> = mailbox.clone();

    let _producers: Fiber<(), Never> = fiber::fork(async move {
      fiber::for_each_par(0..4_u32, |index| {
        let mailbox: Mailbox<u32, Never> = producers.clone();

        async move {
          for offset in 0..10 {
            mailbox.offer(index * 10 + offset).await;
          }

          Ok::<(), Cause<Never>>(())
        }
      })
      .await?;

      producers.end();

      Ok(())
    });

    let mut output: Vec<u32> = drain(&mailbox).await?;

    output.sort_unstable();

    Ok(output)
  });

  assert_eq!(exit.into_result().ok(), Some((0..40).collect::<Vec<u32>>()));
}

#[test]
fn test_mailbox_failure_after_data() {
  let exit: Exit<(Vec<u32>, Option<&'static str>), &'static str> = runtime().block_on(async {
    let mailbox: Mailbox<u32, &'static str> = Mailbox::unbounded();

    mailbox.offer_all([1, 2]).await;
    mailbox.fail("broken");

    let (batch, done): (Vec<u32>, bool) = mailbox.take().await?;
    let failure: Option<&'static str> = mailbox
      .take()
      .await
      .err()
      .and_then(|cause| cause.first_failure().copied());

    if done {
      return Err(Cause::fail("reported done before failing"));
    }

    Ok((batch, failure))
  });

  assert_eq!(exit.into_result().ok(), Some((vec![1, 2], Some("broken"))));
}

#[test]
fn test_mailbox_await_done() {
  let exit: Exit<bool, Never> = runtime().block_on(async {
    let mailbox: Mailbox<(), Never> = Mailbox::unbounded();
    let closer: Mailbox<(), Never> = mailbox.clone();

    let _closer: Fiber<(), Never> = fiber::fork(async move {
      fiber::sleep(Duration::from_millis(5)).await;
      closer.end();
      Ok(())
    });

    mailbox.await_done().await?;

    Ok(mailbox.is_done())
  });

  assert_eq!(exit.into_result().ok(), Some(true));
}

// -----------------------------------------------------------------------------
// Handoff
// -----------------------------------------------------------------------------

#[test]
fn test_handoff_delivers_each_value_once() {
  let exit: Exit<Vec<u32>, Never> = runtime().block_on(async {
    let handoff: Handoff<u32> = Handoff::new();

    for base in [0, 100] {
      let handoff: Handoff<u32> = handoff.clone();

      let _producer: Fiber<(), Never> = fiber::fork(async move {
        for offset in 0..5 {
          handoff.offer(base + offset).await;
        }

        Ok(())
      });
    }

    let mut seen: Vec<u32> = Vec::new();

    for _ in 0..10 {
      seen.push(handoff.take().await);
    }

    seen.sort_unstable();

    Ok(seen)
  });

  assert_eq!(exit.into_result().ok(), Some(vec![0, 1, 2, 3, 4, 100, 101, 102, 103, 104]));
}

#[test]
fn test_handoff_offer_waits_for_take() {
  let exit: Exit<(bool, u32), Never> = runtime().block_on(async {
    let handoff: Handoff<u32> = Handoff::new();
    let producer: Handoff<u32> = handoff.clone();

    let offer: Fiber<(), Never> = fiber::fork(async move {
      producer.offer(9).await;
      Ok(())
    });

    fiber::sleep(Duration::from_millis(10)).await;

    let waiting: bool = !offer.is_done() && handoff.is_full();
    let value: u32 = handoff.take().await;

    offer.join().await.into_result()?;

    Ok((waiting, value))
  });

  assert_eq!(exit.into_result().ok(), Some((true, 9)));
}

// -----------------------------------------------------------------------------
// Deferred
// -----------------------------------------------------------------------------

#[test]
fn test_deferred_wakes_every_waiter() {
  let exit: Exit<Vec<u32>, &'static str> = runtime().block_on(async {
    let deferred: Deferred<u32, &'static str> = Deferred::new();
    let completer: Deferred<u32, &'static str> = deferred.clone();

    let _completer: Fiber<bool, Never> = fiber::fork(async move {
      fiber::sleep(Duration::from_millis(5)).await;
      Ok(completer.succeed(3) && !completer.succeed(4))
    });

    fiber::for_each_par(0..3, |_| {
      let deferred: Deferred<u32, &'static str> = deferred.clone();
      async move { deferred.await_exit().await.into_result() }
    })
    .await
  });

  assert_eq!(exit.into_result().ok(), Some(vec![3, 3, 3]));
}

// -----------------------------------------------------------------------------
// Synchronized Ref
// -----------------------------------------------------------------------------

#[test]
fn test_synchronized_effects_do_not_interleave() {
  let exit: Exit<(u32, usize), Never> = runtime().block_on(async {
    let counter: SynchronizedRef<u32> = SynchronizedRef::new(0);

    let observed: Vec<u32> = fiber::for_each_par(0..20, |_| {
      let counter: SynchronizedRef<u32> = counter.clone();

      async move {
        counter
          .update_and_get_effect(|value| async move {
            fiber::yield_now().await;
            Ok::<u32, Cause<Never>>(value + 1)
          })
          .await
      }
    })
    .await?;

    let unique: HashSet<u32> = observed.into_iter().collect();

    Ok((counter.get(), unique.len()))
  });

  assert_eq!(exit.into_result().ok(), Some((20, 20)));
}

#[test]
fn test_synchronized_interrupted_update_releases_lock() {
  let exit: Exit<u32, Never> = runtime().block_on(async {
    let sync: SynchronizedRef<u32> = SynchronizedRef::new(1);
    let holder: SynchronizedRef<u32> = sync.clone();

    let stuck: Fiber<(), Never> = fiber::fork(async move {
      holder
        .update_effect(|value| async move {
          fiber::sleep(Duration::from_secs(60)).await;
          Ok::<u32, Cause<Never>>(value + 100)
        })
        .await
    });

    fiber::sleep(Duration::from_millis(10)).await;

    let _interrupted: Exit<(), Never> = stuck.interrupt().await;

    Ok(sync.update_and_get(|value| value + 1).await)
  });

  assert_eq!(exit.into_result().ok(), Some(2));
}
