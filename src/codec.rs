//! Wire codecs.
//!
//! Conversion between 16-bit register arrays and typed values, per
//! variable kind.

pub mod registers;

pub use registers::{decode, encode};
