pub mod cache;
pub mod publisher;

pub use cache::ArtifactCache;
pub use publisher::{ArtifactPublisher, ArtifactReference};
