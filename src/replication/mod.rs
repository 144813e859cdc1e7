pub mod dataset;
pub mod merge;

pub use dataset::Dataset;
pub use merge::{merge_collection, merge_into, MergeOutcome, Record, Snapshot};
