//! # Firehose Testkit
//!
//! Test utilities for the repository firehose client.
//!
//! This crate provides:
//! - Frame and CAR archive builders
//! - Property-based test generators using proptest
//! - Fuzz targets for the decode path
//! - CID test vectors
//!
//! ## Usage
//!
//! ```rust
//! use firehose_testkit::prelude::*;
//! use firehose_protocol::decode_frame;
//!
//! let sample = sample_commit_frame();
//! let frame = decode_frame(&sample.bytes).unwrap();
//! assert_eq!(frame.header.kind.as_deref(), Some("#commit"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod fuzz;
pub mod generators;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::fuzz::*;
    pub use crate::generators::*;
    pub use crate::vectors::*;
}

pub use fixtures::*;
pub use fuzz::*;
pub use generators::*;
pub use vectors::*;
