//! Utility types and functions used throughout the runtime.
//!
//! # Contents
//!
//! - [`CatchUnwind`]: Future wrapper for catching panics
//! - [`Sequence`]: Lock-free monotonic id generator

mod futures;
mod sequence;

pub(crate) use self::futures::CatchUnwind;
pub use self::sequence::Sequence;
