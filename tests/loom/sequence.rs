#![cfg(loom)]

use loom::sync::Arc;
use loom::thread;
use strand::utils::Sequence;

#[test]
fn next_is_unique() {
  loom::model(|| {
    let sequence: Arc<Sequence> = Arc::new(Sequence::new());

    let threads: Vec<_> = (0..2)
      .map(|_| {
        let sequence: Arc<Sequence> = Arc::clone(&sequence);

        thread::spawn(move || {
          let lhs: u64 = sequence.next();
          let rhs: u64 = sequence.next();

          assert!(lhs < rhs, "ids must increase within a thread");

          [lhs, rhs]
        })
      })
      .collect();

    let mut ids: Vec<u64> = threads
      .into_iter()
      .flat_map(|handle| handle.join().unwrap())
      .collect();

    ids.sort_unstable();
    ids.dedup();

    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(sequence.current(), 4);
  });
}

#[test]
fn current_tracks_last_id() {
  loom::model(|| {
    let sequence: Arc<Sequence> = Arc::new(Sequence::new());
    let writer: Arc<Sequence> = Arc::clone(&sequence);

    let handle = thread::spawn(move || writer.next());
    let seen: u64 = sequence.current();

    assert!(seen <= 1, "current() must never run ahead of next()");
    assert_eq!(handle.join().unwrap(), 1);
    assert_eq!(sequence.current(), 1);
  });
}
