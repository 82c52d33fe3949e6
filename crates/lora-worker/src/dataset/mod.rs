pub mod caption;
pub mod materializer;
pub mod scaling;

pub use materializer::{DatasetDescriptor, DatasetMaterializer};
pub use scaling::{repeat_factor, RoundingMode};
