use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;

/// Error returned when registering with a scope that was already closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ScopeClosed;

impl Display for ScopeClosed {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.write_str("scope is closed")
  }
}

impl Error for ScopeClosed {}
