use std::ops::ControlFlow;

use hashbrown::HashSet;
use rkyv::{Archive, Deserialize, Serialize};

use crate::engine::PartitionIndex;
use crate::plugin::{QueryContext, QueryError, QueryPlugin};
use crate::solve::{Evaluator, Merger, PartitionResponse, SolutionLog};

/// The most recently active streams, up to `limit`.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct DistinctRequest {
    pub verb: Option<String>,
    pub limit: u32,
}

/// Stream IDs, most recently active first.
pub type DistinctStreams = Vec<String>;

/// Streams already collected by newer partitions. A partition only returns
/// streams not in here, and no more than the limit still allows.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct DistinctReport {
    pub seen: Vec<String>,
}

pub struct Distinct;

impl QueryPlugin<PartitionIndex> for Distinct {
    type Request = DistinctRequest;
    type Answer = DistinctStreams;
    type Report = DistinctReport;

    fn endpoint(&self) -> &'static str {
        "distinct-streams"
    }

    fn answer(
        &self,
        ctx: &QueryContext,
        index: &PartitionIndex,
        request: &DistinctRequest,
        report: Option<&DistinctReport>,
    ) -> Result<PartitionResponse<DistinctStreams, DistinctReport>, QueryError> {
        if request.limit == 0 {
            return Err(QueryError::InvalidRequest("limit must be positive".into()));
        }
        let mut seen: HashSet<String> = report
            .map(|r| r.seen.iter().cloned().collect())
            .unwrap_or_default();
        let remaining = (request.limit as usize).saturating_sub(seen.len());
        let mut found = Vec::new();
        if remaining > 0 {
            index.scan(&ctx.authorization, |activity| {
                let wanted = request
                    .verb
                    .as_deref()
                    .map_or(true, |verb| verb == activity.verb);
                if wanted && seen.insert(activity.stream_id.clone()) {
                    found.push(activity.stream_id.clone());
                    if found.len() == remaining {
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            });
        }
        let mut collected = report.map(|r| r.seen.clone()).unwrap_or_default();
        collected.extend(found.iter().cloned());
        Ok(PartitionResponse::new(
            found,
            Some(DistinctReport { seen: collected }),
        ))
    }

    fn empty(&self) -> DistinctStreams {
        Vec::new()
    }

    fn is_empty(&self, response: &PartitionResponse<DistinctStreams, DistinctReport>) -> bool {
        response.answer.is_empty()
    }
}

/// Union keeping the first occurrence, so streams from newer partitions rank
/// ahead of older ones, cut at `limit`.
pub struct DistinctMerger {
    pub limit: usize,
}

impl Merger<DistinctStreams, DistinctReport> for DistinctMerger {
    fn merge(
        &self,
        mut running: DistinctStreams,
        partition: DistinctStreams,
        _report: Option<&DistinctReport>,
    ) -> DistinctStreams {
        let mut present: HashSet<String> = running.iter().cloned().collect();
        for stream in partition {
            if running.len() >= self.limit {
                break;
            }
            if present.insert(stream.clone()) {
                running.push(stream);
            }
        }
        running.truncate(self.limit);
        running
    }
}

pub struct DistinctEvaluator {
    pub limit: usize,
}

impl Evaluator<DistinctStreams> for DistinctEvaluator {
    fn is_done(&self, answer: &DistinctStreams, _log: &SolutionLog) -> bool {
        answer.len() >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Activity, MemoryEngine};
    use crate::partition::{PartitionId, TenantId};
    use crate::plugin::IndexEngine;

    fn streams(names: &[&str]) -> DistinctStreams {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn ctx() -> QueryContext {
        QueryContext {
            tenant: TenantId::from("acme"),
            partition: PartitionId(0),
            authorization: String::new(),
        }
    }

    #[test]
    fn merge_is_associative_in_traversal_order() {
        let newest = streams(&["a", "b"]);
        let middle = streams(&["b", "c", "d"]);
        let oldest = streams(&["a", "e", "f"]);
        for limit in [1, 3, 5, 10] {
            let merger = DistinctMerger { limit };
            let left = merger.merge(
                merger.merge(newest.clone(), middle.clone(), None),
                oldest.clone(),
                None,
            );
            let right = merger.merge(
                newest.clone(),
                merger.merge(middle.clone(), oldest.clone(), None),
                None,
            );
            assert_eq!(left, right, "limit {limit}");
        }
        let merger = DistinctMerger { limit: 10 };
        let all = merger.merge(merger.merge(newest, middle, None), oldest, None);
        assert_eq!(all, streams(&["a", "b", "c", "d", "e", "f"]));
    }

    #[test]
    fn report_excludes_streams_found_by_newer_partitions() {
        let engine = MemoryEngine::new();
        let tenant = TenantId::from("acme");
        engine
            .index(
                &tenant,
                PartitionId(0),
                vec![
                    Activity::new(1, "x", "click", 1),
                    Activity::new(2, "y", "click", 2),
                    Activity::new(3, "z", "click", 3),
                    Activity::new(4, "y", "click", 4),
                ],
            )
            .unwrap();
        let index = engine.handle(&tenant, PartitionId(0)).unwrap();
        let request = DistinctRequest {
            verb: None,
            limit: 3,
        };
        let report = DistinctReport {
            seen: streams(&["y"]),
        };
        let response = Distinct.answer(&ctx(), &index, &request, Some(&report)).unwrap();
        assert_eq!(response.answer, streams(&["z", "x"]));
        assert_eq!(response.report.unwrap().seen, streams(&["y", "z", "x"]));
    }

    #[test]
    fn zero_limit_is_rejected() {
        let engine = MemoryEngine::new();
        let tenant = TenantId::from("acme");
        engine
            .index(&tenant, PartitionId(0), vec![Activity::new(1, "x", "click", 1)])
            .unwrap();
        let index = engine.handle(&tenant, PartitionId(0)).unwrap();
        let request = DistinctRequest {
            verb: None,
            limit: 0,
        };
        assert!(matches!(
            Distinct.answer(&ctx(), &index, &request, None),
            Err(QueryError::InvalidRequest(_))
        ));
    }
}
