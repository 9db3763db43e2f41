// Answering a query for a single partition, and the per-plugin policies that
// combine those answers across partitions.

pub mod evaluate;
pub mod log;
pub mod solvable;
pub mod speculative;

pub use evaluate::{Evaluator, Exhaustive, Merger};
pub use log::{LogLevel, SolutionLog};
pub use solvable::{PartitionResponse, Solvable, SolveResult};
pub use speculative::{SolveOutcome, SpeculativeSolver};
