use std::ops::ControlFlow;

use rkyv::{Archive, Deserialize, Serialize};

use crate::engine::PartitionIndex;
use crate::plugin::{QueryContext, QueryError, QueryPlugin};
use crate::solve::{Evaluator, Merger, PartitionResponse, SolutionLog};

/// Counts matching activities, optionally stopping once `limit` is reached
/// across all partitions.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct CountRequest {
    /// Only activities with this verb. `None` counts everything.
    pub verb: Option<String>,
    pub limit: Option<u64>,
}

/// The report is the running total of the partitions asked so far, so older
/// partitions only count what is still missing from the limit.
pub struct Count;

impl QueryPlugin<PartitionIndex> for Count {
    type Request = CountRequest;
    type Answer = u64;
    type Report = u64;

    fn endpoint(&self) -> &'static str {
        "count"
    }

    fn answer(
        &self,
        ctx: &QueryContext,
        index: &PartitionIndex,
        request: &CountRequest,
        report: Option<&u64>,
    ) -> Result<PartitionResponse<u64, u64>, QueryError> {
        let already = report.copied().unwrap_or(0);
        let wanted = request.limit.map(|limit| limit.saturating_sub(already));
        if wanted == Some(0) {
            return Ok(PartitionResponse::new(0, Some(already)));
        }
        let mut counted = 0u64;
        index.scan(&ctx.authorization, |activity| {
            if request.verb.as_deref().map_or(true, |verb| verb == activity.verb) {
                counted += 1;
                if Some(counted) == wanted {
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        });
        Ok(PartitionResponse::new(counted, Some(already + counted)))
    }

    fn empty(&self) -> u64 {
        0
    }

    fn is_empty(&self, response: &PartitionResponse<u64, u64>) -> bool {
        response.answer == 0
    }
}

pub struct CountMerger;

impl Merger<u64, u64> for CountMerger {
    fn merge(&self, running: u64, partition: u64, _report: Option<&u64>) -> u64 {
        running.saturating_add(partition)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CountEvaluator {
    pub limit: Option<u64>,
    pub strict: bool,
}

impl Evaluator<u64> for CountEvaluator {
    fn is_done(&self, answer: &u64, _log: &SolutionLog) -> bool {
        self.limit.is_some_and(|limit| *answer >= limit)
    }

    fn stop_on_unsolvable_partition(&self) -> bool {
        self.strict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Activity, MemoryEngine};
    use crate::partition::{PartitionId, TenantId};
    use crate::plugin::IndexEngine;

    fn index() -> std::sync::Arc<PartitionIndex> {
        let engine = MemoryEngine::new();
        let tenant = TenantId::from("acme");
        let activities = (0..10)
            .map(|i| Activity::new(i, format!("s{}", i % 3), if i % 2 == 0 { "click" } else { "view" }, i as i64))
            .collect();
        engine.index(&tenant, PartitionId(0), activities).unwrap();
        engine.handle(&tenant, PartitionId(0)).unwrap()
    }

    fn ctx() -> QueryContext {
        QueryContext {
            tenant: TenantId::from("acme"),
            partition: PartitionId(0),
            authorization: String::new(),
        }
    }

    #[test]
    fn counts_by_verb() {
        let request = CountRequest {
            verb: Some("click".into()),
            limit: None,
        };
        let response = Count.answer(&ctx(), &index(), &request, None).unwrap();
        assert_eq!(response, PartitionResponse::new(5, Some(5)));
    }

    #[test]
    fn limit_accounts_for_earlier_partitions() {
        let request = CountRequest {
            verb: None,
            limit: Some(7),
        };
        let response = Count.answer(&ctx(), &index(), &request, Some(&4)).unwrap();
        assert_eq!(response, PartitionResponse::new(3, Some(7)));

        let done = Count.answer(&ctx(), &index(), &request, Some(&9)).unwrap();
        assert_eq!(done.answer, 0);
    }

    #[test]
    fn authorization_restricts_streams() {
        let mut ctx = ctx();
        ctx.authorization = "s1".into();
        let response = Count
            .answer(&ctx, &index(), &CountRequest::default(), None)
            .unwrap();
        assert_eq!(response.answer, 3);
    }

    #[test]
    fn evaluator_stops_at_the_limit() {
        let log = SolutionLog::default();
        let evaluator = CountEvaluator {
            limit: Some(10),
            strict: false,
        };
        assert!(!evaluator.is_done(&9, &log));
        assert!(evaluator.is_done(&10, &log));
        assert!(!CountEvaluator::default().is_done(&u64::MAX, &log));
    }
}
