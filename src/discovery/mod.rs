//! Task discovery manifest (`spec.md` §6).
//!
//! A scan of the task registry (or a filesystem walk, for parity with the
//! original's static discovery) produces a set of [`manifest::TaskReference`]s
//! and [`manifest::ScheduledTaskReference`]s; [`manifest::ManifestManager`]
//! diffs that set against the manifest persisted from the previous run.

pub mod manifest;

pub use manifest::{
    ManifestDiff, ManifestDocument, ManifestManager, ScheduleMetadata, ScheduledTaskReference, TaskReference,
};
