// Stock query plugins over the in-process index engine.

pub mod count;
pub mod distinct;

pub use count::{Count, CountEvaluator, CountMerger, CountRequest};
pub use distinct::{
    Distinct, DistinctEvaluator, DistinctMerger, DistinctReport, DistinctRequest, DistinctStreams,
};
