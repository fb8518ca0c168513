//! Multi-file upload handling.

pub mod aggregator;

pub use aggregator::{FlushedBatch, UploadAggregator};
