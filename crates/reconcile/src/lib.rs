//! # Reconcile
//!
//! The transport-free core of a declarative deployment engine.
//!
//! This crate knows nothing about SSH, Docker, or any particular resource
//! kind. It provides the three pure building blocks a reconciler needs:
//!
//! - **Observation / Decision**: given what was observed on the remote side
//!   (does the resource exist, what configuration hash was recorded on it)
//!   and what is desired, decide whether to create, skip, or replace.
//! - **DependencyGraph**: ordering of resources that depend on each other,
//!   with cycle detection that reports the offending members before anything
//!   is mutated.
//! - **RunSummary / HostReport / RunReport**: outcome bookkeeping that rolls
//!   per-resource results up into a per-host and whole-run verdict.
//!
//! ## Example
//!
//! ```
//! use reconcile::{decide, Decision, ImageState, Observation};
//!
//! let observed = Observation {
//!     exists: true,
//!     recorded_hash: Some("abc".into()),
//! };
//!
//! // Hash matches and the image did not change: nothing to do.
//! assert_eq!(
//!     decide(&observed, "abc", ImageState::UpToDate),
//!     Decision::Skip
//! );
//! ```

pub mod decision;
pub mod graph;
pub mod summary;

pub use decision::{Decision, ImageState, Observation, StaleReason, decide};
pub use graph::{DependencyGraph, GraphError};
pub use summary::{ApplyOutcome, HostReport, RunReport, RunSummary};
