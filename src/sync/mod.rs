//! Coordination primitives for fibers.
//!
//! - [`Deferred`]: a one-shot promise.
//! - [`Mailbox`]: a completable multi-producer queue with backpressure.
//! - [`Handoff`]: an unbuffered rendezvous between two fibers.
//! - [`SynchronizedRef`]: a reference whose updates may suspend.
//!
//! Every suspending operation is an interruption point. Internal state is
//! guarded by short-lived locks that are never held across a suspension.

mod deferred;
mod handoff;
mod mailbox;
mod synchronized;

pub use self::deferred::Deferred;
pub use self::handoff::Handoff;
pub use self::mailbox::Mailbox;
pub use self::mailbox::Strategy;
pub use self::synchronized::SynchronizedRef;
