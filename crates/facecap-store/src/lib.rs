//! facecap-store — versioned keyed blob store for finished recordings.

pub mod schema;
pub mod store;

pub use schema::{StoreSchema, VIDEOS};
pub use store::{ArtifactSummary, PlayableHandle, StoreConnection, StoreError, VideoStore};
