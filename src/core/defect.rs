use std::any::Any;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;
use std::sync::Arc;

use crate::error::Exception;

/// An unrecoverable programmer error captured from a panic.
///
/// Defects are carried by [`Cause::Die`] and are never confused with the typed
/// failures of an effect.
///
/// [`Cause::Die`]: crate::core::Cause::Die
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Defect {
  message: Arc<str>,
}

impl Defect {
  /// Creates a defect with the given message.
  #[inline]
  pub fn new(message: impl Into<String>) -> Self {
    let message: String = message.into();

    Self {
      message: Arc::from(message.as_str()),
    }
  }

  /// Creates a defect from a captured panic payload.
  ///
  /// String payloads (the common case for `panic!`) are preserved verbatim;
  /// any other payload is described by a fixed message.
  pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
      Self::new(*message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
      Self::new(message.as_str())
    } else {
      Self::new("non-string panic payload")
    }
  }

  /// Returns the defect message.
  #[inline]
  pub fn message(&self) -> &str {
    &self.message
  }

  /// Returns `true` if the defect is a runtime [`Exception`] raised by
  /// misuse of the runtime rather than a panic of user code.
  #[inline]
  pub fn is_exception(&self) -> bool {
    Exception::matches(&self.message)
  }
}

impl Debug for Defect {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    write!(f, "Defect({:?})", self.message())
  }
}

impl Display for Defect {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.write_str(self.message())
  }
}

impl From<&str> for Defect {
  #[inline]
  fn from(other: &str) -> Self {
    Self::new(other)
  }
}

impl From<String> for Defect {
  #[inline]
  fn from(other: String) -> Self {
    Self::new(other)
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::panic;

  use crate::core::Defect;

  #[test]
  fn test_from_static_str_panic() {
    let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();

    assert_eq!(Defect::from_panic(payload).message(), "boom");
  }

  #[test]
  fn test_raised_exception_is_classified() {
    let payload = panic::catch_unwind(|| crate::raise!(Error, BadArg, "capacity must be non-zero")).unwrap_err();
    let defect: Defect = Defect::from_panic(payload);

    assert!(defect.is_exception());
    assert!(!Defect::new("boom").is_exception());
  }

  #[test]
  fn test_from_formatted_panic() {
    let payload = panic::catch_unwind(|| panic!("boom {}", 42)).unwrap_err();

    assert_eq!(Defect::from_panic(payload).message(), "boom 42");
  }

  #[test]
  fn test_from_opaque_panic() {
    let payload = panic::catch_unwind(|| panic::panic_any(7_u32)).unwrap_err();

    assert_eq!(
      Defect::from_panic(payload).message(),
      "non-string panic payload"
    );
  }

  #[test]
  fn test_display_debug() {
    let defect: Defect = Defect::new("oops");

    assert_eq!(format!("{defect}"), "oops");
    assert_eq!(format!("{defect:?}"), "Defect(\"oops\")");
  }
}
