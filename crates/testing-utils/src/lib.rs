//! # Jobs Testing Utils
//!
//! Shared testing utilities for the job engine workspace.
//!
//! ## Features
//!
//! - **Test Data Builders**: `JobDefBuilder`, `JobRunBuilder`, `JobTaskBuilder`
//! - **Scripted Handlers**: a handler whose task outcomes are driven by a [`Script`]
//! - **Test Engine**: an engine over the in-memory store with a manual clock
//!
//! ## Usage
//!
//! Add this crate as a dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! jobs-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
