//! `tidepool-core`: identifiers and domain errors shared across the workspace.
//!
//! This crate has no runtime or storage concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{BatchId, TenantId};
