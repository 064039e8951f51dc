//! Core data types shared by every runtime primitive.
//!
//! - [`FiberId`]: identity of a fiber.
//! - [`Cause`]: why a computation failed.
//! - [`Exit`]: the final outcome of a computation.
//! - [`Defect`]: an unexpected error captured from a panic.

mod cause;
mod defect;
mod exit;
mod fiber_id;

pub use self::cause::Cause;
pub use self::cause::Leaves;
pub use self::defect::Defect;
pub use self::exit::Exit;
pub use self::fiber_id::FiberId;

/// The error type of computations that cannot fail.
pub type Never = std::convert::Infallible;
