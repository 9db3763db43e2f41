use super::log::SolutionLog;

/// Decides, after each partition is folded in, whether the running answer is
/// complete enough to stop iterating.
pub trait Evaluator<A>: Send + Sync {
    fn is_done(&self, answer: &A, log: &SolutionLog) -> bool;

    /// Whether a partition nobody could answer aborts the whole request
    /// (`true`) or is skipped (`false`).
    fn stop_on_unsolvable_partition(&self) -> bool {
        false
    }
}

/// Folds one partition's answer into the running answer. Partitions arrive
/// newest first; the report is the one that partition produced.
pub trait Merger<A, R>: Send + Sync {
    fn merge(&self, running: A, partition: A, report: Option<&R>) -> A;
}

/// Visits every partition.
#[derive(Clone, Copy, Debug, Default)]
pub struct Exhaustive {
    /// Abort on the first partition that cannot be solved.
    pub strict: bool,
}

impl Exhaustive {
    pub fn strict() -> Self {
        Self { strict: true }
    }
}

impl<A> Evaluator<A> for Exhaustive {
    fn is_done(&self, _answer: &A, _log: &SolutionLog) -> bool {
        false
    }

    fn stop_on_unsolvable_partition(&self) -> bool {
        self.strict
    }
}
