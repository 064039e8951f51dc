//! Observers of fiber lifecycle events.
//!
//! A [`Supervisor`] is a tree of [`Supervise`] leaves notified whenever a
//! fiber starts or ends. Trees compose with [`Supervisor::and`] and
//! [`Supervisor::or`], which also decide whether an event is fully handled
//! ([`Propagation::Stop`]) or should keep propagating.
//!
//! The supervisor of the running fiber is fiber-local state. Changes are
//! expressed as a [`SupervisorPatch`] computed by diffing the leaves of two
//! trees, so a fiber can add observers for a region with
//! [`fiber::supervised`] without disturbing observers added concurrently by
//! other fibers.
//!
//! [`fiber::supervised`]: crate::fiber::supervised

mod patch;
mod supervisor;
mod track;

pub use self::patch::SupervisorDiffer;
pub use self::patch::SupervisorPatch;
pub use self::supervisor::Propagation;
pub use self::supervisor::Supervise;
pub use self::supervisor::Supervisor;
pub use self::track::Track;

pub(crate) use self::patch::CURRENT;
