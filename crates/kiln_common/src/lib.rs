//! Shared foundational types used across the Kiln build cache.
//!
//! This crate provides structural fingerprints with a streaming hasher and
//! the internal-error result type shared by every other crate.

#![warn(missing_docs)]

pub mod hash;
pub mod result;

pub use hash::{Fingerprint, FingerprintHasher};
pub use result::{InternalError, KilnResult};
