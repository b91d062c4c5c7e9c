//! Read aggregation
//!
//! Composes the repo landing view from the local index and parallel knot
//! queries, degrading gracefully when enrichment fails.

mod landing;
pub mod verify;

pub use landing::{
    annotate, balance_index_items, sort_branches, EmailIdentity, ForkSyncStatus, LandingCommit,
    Readme, ReadAggregator, RefAnnotation, RefKind, RepoLandingView,
};
