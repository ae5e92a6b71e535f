//! # jrnl Testkit
//!
//! Test utilities for jrnl journal files.
//!
//! This crate provides:
//! - Test fixtures and journal helpers
//! - Property-based test generators using proptest
//! - Crash simulation for storage backends
//! - Integration harnesses that track what was appended
//! - Fuzz testing harnesses
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use jrnl_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_journal() {
//!     with_temp_journal(|file| {
//!         file.append_entry(None, None, &["MESSAGE=hi"], None).unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod fuzz;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::fuzz::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use fuzz::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
