//! Strand - a structured-concurrency fiber runtime for Rust.
//!
//! Strand runs lightweight fibers on top of tokio and adds the guarantees a
//! plain task lacks: cooperative interruption with nestable uninterruptible
//! regions, finalizers that always run, children that never outlive their
//! parent by accident, and a failure model that keeps every defect,
//! interruption, and typed error in one [`Cause`] tree.
//!
//! # Quick Start
//!
//! ```no_run
//! use strand::core::Cause;
//! use strand::core::Never;
//! use strand::fiber;
//! use strand::fiber::Runtime;
//! use strand::fiber::RuntimeConfig;
//! use strand::stm::TRef;
//!
//! let runtime: Runtime = Runtime::new(RuntimeConfig::default()).unwrap();
//!
//! let exit = runtime.block_on(async {
//!   let counter: TRef<u32> = TRef::new(0);
//!
//!   let fibers: Vec<u32> = fiber::for_each_par(0..4, |_| {
//!     let counter: TRef<u32> = counter.clone();
//!     async move { counter.update_and_get::<Never, _>(|n| n + 1).commit().await }
//!   })
//!   .await?;
//!
//!   Ok::<u32, Cause<Never>>(fibers.len() as u32 + counter.peek())
//! });
//!
//! assert_eq!(exit.into_result().ok(), Some(8));
//! ```
//!
//! # Modules
//!
//! - [`core`]: Fiber ids, causes, exits, and defects
//! - [`fiber`]: The runtime, fibers, interruption, and fiber-local state
//! - [`scope`]: Finalizer scopes for resource safety
//! - [`stm`]: Software transactional memory
//! - [`sync`]: Mailboxes, handoffs, promises, and synchronized refs
//! - [`supervisor`]: Observers of fiber lifecycles
//! - [`error`]: Runtime exceptions
//! - [`consts`]: Runtime configuration constants
//!
//! [`Cause`]: crate::core::Cause

mod loom;

pub mod consts;
pub mod core;
pub mod error;
pub mod fiber;
pub mod scope;
pub mod stm;
pub mod supervisor;
pub mod sync;
pub mod utils;
