//! # Processing manifest
//!
//! The manifest is the durable system of record shared by every worker role.
//! Capture appends `pending` entries; analysis claims and advances them;
//! reporting, compression, and sync each own a disjoint set of fields.
//!
//! ## Status lattice
//!
//! `pending < processing < processed < transmitted`. A write never moves an
//! entry backwards, and `image_synced` only goes `false -> true`, and only once
//! the entry is at least `processed`.
//!
//! ## Module Organization
//!
//! - `entry` - `Entry`, `ProcessingStatus`, `EntryPatch`
//! - `repository` - lock-protected typed operations over the manifest file

pub mod entry;
pub mod repository;

pub use entry::{Entry, EntryId, EntryPatch, ProcessingStatus};
pub use repository::{
    ManifestDoc, ManifestRepository, ManifestSummary, ReclaimOutcome, StatusGuard, MANIFEST_VERSION,
};
