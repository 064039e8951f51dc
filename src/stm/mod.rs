//! Software transactional memory.
//!
//! An [`Stm`] value describes a transaction over [`TRef`]s. Committing it
//! runs the description optimistically against a private journal: reads
//! record the version of every ref they touch and writes stay in the
//! journal. At the end the journal is validated and published under a
//! single commit lock, so either every write becomes visible or none does.
//! A transaction that read a ref changed by a concurrent commit is restarted
//! from scratch.
//!
//! [`Stm::retry`] blocks. The committing fiber suspends until one of the refs
//! the transaction read is changed by another commit, then runs the whole
//! transaction again. [`Stm::or_else`] offers an alternative for exactly this
//! case.
//!
//! # Examples
//!
//! ```no_run
//! use strand::core::Never;
//! use strand::stm::Stm;
//! use strand::stm::TQueue;
//!
//! # async fn pipeline() {
//! let queue: TQueue<u32> = TQueue::bounded(16);
//!
//! queue.offer::<Never>(1).commit().await.unwrap();
//!
//! let next: Stm<u32, Never> = queue.take();
//! assert_eq!(next.commit().await, Ok(1));
//! # }
//! ```

mod driver;
mod journal;
mod stm;
mod texit;
mod tqueue;
mod tref;
mod tsemaphore;

pub use self::stm::Either;
pub use self::stm::Stm;
pub use self::texit::TExit;
pub use self::tqueue::TQueue;
pub use self::tref::TRef;
pub use self::tsemaphore::TSemaphore;
