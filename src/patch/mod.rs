//! Patch registration and deterministic ordering.
//!
//! # Key Components
//!
//! - [`crate::patch::PatchDescriptor`] / [`crate::patch::PatchSet`] - the
//!   immutable registration records, grouped by role
//! - [`crate::patch::Priority`] - ordering weight with the conventional bands
//! - [`crate::patch::PatchSorter`] - constraint-aware ordering with cached
//!   results and cycle diagnostics

mod descriptor;
mod sorter;

pub use descriptor::{
    HookMethod, HookParam, ParamBinding, PatchDescriptor, PatchImpl, PatchRole, PatchSet, Priority,
};
pub use sorter::PatchSorter;
