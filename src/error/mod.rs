//! Runtime exceptions.
//!
//! Typed failures travel through [`Cause::Fail`] and are part of an effect's
//! signature. This module covers the other kind of error: misuse of the
//! runtime itself, such as calling a fiber-only API from a plain thread or
//! building a runtime from inside another one.
//!
//! Such misuse panics with an [`Exception`]. When the panic happens inside a
//! fiber the driver captures it like any other panic and the fiber exits with
//! [`Cause::Die`], so a broken call site never takes a worker thread down.
//!
//! Exceptions carry three pieces of information:
//!
//! 1. **Class**: The severity level ([`Error`])
//! 2. **Group**: The error category ([`BadArg`], [`SysCap`], [`SysInv`])
//! 3. **Description**: A human-readable error message
//!
//! [`Cause::Fail`]: crate::core::Cause::Fail
//! [`Cause::Die`]: crate::core::Cause::Die
//! [`Error`]: ExceptionClass::Error
//! [`BadArg`]: ExceptionGroup::BadArg
//! [`SysCap`]: ExceptionGroup::SysCap
//! [`SysInv`]: ExceptionGroup::SysInv

mod exception;
mod exception_class;
mod exception_group;

pub use self::exception::Exception;
pub use self::exception_class::ExceptionClass;
pub use self::exception_group::ExceptionGroup;

// -----------------------------------------------------------------------------
// raise!
// -----------------------------------------------------------------------------

/// Raises an exception with the specified class, group, and message.
///
/// # Examples
///
/// ```
/// # use strand::raise;
/// fn capacity(value: usize) -> usize {
///   if value == 0 {
///     raise!(Error, BadArg, "capacity must be non-zero");
///   }
///
///   value
/// }
/// ```
#[macro_export]
macro_rules! raise {
  ($class:ident, $group:ident, $error:expr $(,)?) => {
    ::std::panic!(
      "{}",
      $crate::error::Exception::new(
        $crate::error::ExceptionClass::$class,
        $crate::error::ExceptionGroup::$group,
        $error,
      ),
    )
  };
}

// -----------------------------------------------------------------------------
// fatal!
// -----------------------------------------------------------------------------

/// Displays a system error message and aborts the program.
///
/// Reserved for states the runtime cannot unwind out of, such as a fiber
/// completing twice.
macro_rules! fatal {
  ($error:expr) => {{
    ::std::eprintln!(
      "{}:{}: (SysInv) a system invariant has been broken: {}",
      ::std::file!(),
      ::std::line!(),
      $error,
    );

    ::std::process::abort();
  }};
}

pub(crate) use fatal;

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
