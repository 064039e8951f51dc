use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;

/// Exception severity classification.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExceptionClass {
  /// Runtime misuse that terminates the calling fiber with a defect.
  Error,
}

impl ExceptionClass {
  #[inline]
  pub(crate) const fn label(&self) -> &'static str {
    match self {
      Self::Error => "error",
    }
  }
}

impl Display for ExceptionClass {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.write_str(self.label())
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
