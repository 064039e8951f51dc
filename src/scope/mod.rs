//! Resource-lifecycle boundaries.
//!
//! A [`Scope`] collects finalizers and runs them, in reverse order, when it
//! closes. Scopes nest with [`Scope::fork`], and [`scoped`] runs a block of
//! code with a scope bound to the current fiber.

mod error;
mod scope;

pub use self::error::ScopeClosed;
pub use self::scope::FinalizerKey;
pub use self::scope::Scope;
pub use self::scope::scoped;
