//! # Harbor Testkit
//!
//! Test utilities for harbor.
//!
//! This crate provides:
//! - Store and client fixtures over a manual clock
//! - Property-based generators for mutation scripts using proptest
//! - An online reference model to compare replayed queues against
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harbor_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn offline_create() {
//!     let t = offline_client();
//!     t.create_record(json!({"id": "A"})).await.unwrap();
//!     assert_eq!(t.pending_operations().len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod model;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::model::*;
}

pub use fixtures::*;
pub use generators::*;
pub use model::*;
