// A multi-tenant activity index answers queries by fanning them out to the
// partitions that hold a tenant's data and merging what comes back. This crate
// is the query-solving core of it: where partitions live and in which state,
// racing the replicas of one partition for the fastest answer, and folding
// partition answers into one response under a time budget.

pub mod config;
pub mod director;
pub mod engine;
pub mod metrics;
pub mod net;
pub mod partition;
pub mod plugin;
pub mod plugins;
pub mod solve;
pub mod tracking;
