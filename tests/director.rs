use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tokio_util::sync::CancellationToken;

use fanout::config::{Config, DirectorConfig, SolverConfig, TransportConfig, DEFAULT_PORT};
use fanout::director::{PartitionDirector, QueryRequest, QueryResponse, WriteBatch};
use fanout::engine::{Activity, MemoryEngine, PartitionIndex};
use fanout::metrics::CounterMetrics;
use fanout::net::{loopback::LoopbackTransport, service::HostService};
use fanout::partition::{
    state::PartitionStates, topology::MemoryRegistry, Host, PartitionId, TenantId,
};
use fanout::plugin::{QueryContext, QueryError, QueryPlugin};
use fanout::plugins::{
    Count, CountEvaluator, CountMerger, CountRequest, Distinct, DistinctEvaluator, DistinctMerger,
    DistinctRequest,
};
use fanout::solve::{Exhaustive, LogLevel, Merger, PartitionResponse};

/// Answers with the partition it ran on and the report it was handed, and
/// passes on a report one higher.
struct Which;

impl QueryPlugin<PartitionIndex> for Which {
    type Request = u8;
    type Answer = Vec<(u64, u64)>;
    type Report = u64;

    fn endpoint(&self) -> &'static str {
        "which"
    }

    fn answer(
        &self,
        ctx: &QueryContext,
        _index: &PartitionIndex,
        _request: &u8,
        report: Option<&u64>,
    ) -> Result<PartitionResponse<Vec<(u64, u64)>, u64>, QueryError> {
        let seen = report.copied().unwrap_or(0);
        Ok(PartitionResponse::new(
            vec![(ctx.partition.id(), seen)],
            Some(seen + 1),
        ))
    }

    fn empty(&self) -> Vec<(u64, u64)> {
        Vec::new()
    }
}

struct Concat;

impl Merger<Vec<(u64, u64)>, u64> for Concat {
    fn merge(
        &self,
        mut running: Vec<(u64, u64)>,
        partition: Vec<(u64, u64)>,
        _report: Option<&u64>,
    ) -> Vec<(u64, u64)> {
        running.extend(partition);
        running
    }
}

struct Cluster {
    registry: Arc<MemoryRegistry>,
    transport: Arc<LoopbackTransport>,
    metrics: Arc<CounterMetrics>,
    hosts: Vec<Host>,
    directors: Vec<PartitionDirector<MemoryEngine>>,
    tenant: TenantId,
}

impl Cluster {
    /// `hosts` directors sharing one registry and one loopback network. Host 0
    /// never carries data.
    fn new(hosts: usize, compression: bool) -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        let transport = Arc::new(LoopbackTransport::new());
        let metrics = Arc::new(CounterMetrics::new());
        let mut cluster = Cluster {
            registry: registry.clone(),
            transport: transport.clone(),
            metrics: metrics.clone(),
            hosts: Vec::new(),
            directors: Vec::new(),
            tenant: TenantId::from("acme"),
        };
        for i in 0..hosts {
            let host = Host::new(format!("host-{i}"), DEFAULT_PORT);
            let config = Config {
                solver: SolverConfig::builder()
                    .initial_concurrency(1)
                    .max_concurrency(3)
                    .escalate_after_ms(50)
                    .deadline_ms(400)
                    .build(),
                director: DirectorConfig::builder()
                    .local_host(host.clone())
                    .request_deadline_ms(3_000)
                    .build(),
                transport: TransportConfig::builder()
                    .compression(compression)
                    .call_timeout_ms(1_000)
                    .build(),
            };
            let engine = Arc::new(MemoryEngine::new());
            let states = Arc::new(PartitionStates::new());
            let service = HostService::new(engine.clone(), states.clone(), &config.transport)
                .register(Arc::new(Count))
                .register(Arc::new(Distinct))
                .register(Arc::new(Which));
            transport.attach(host.clone(), Arc::new(service));
            cluster.directors.push(PartitionDirector::new(
                &config,
                registry.clone(),
                transport.clone(),
                engine,
                states,
                metrics.clone(),
            ));
            cluster.hosts.push(host);
        }
        cluster
    }

    /// Puts an online replica of `partition` holding `activities` on each of
    /// `on`.
    async fn place(&self, partition: u64, on: &[usize], activities: &[Activity]) {
        let partition = PartitionId(partition);
        for &i in on {
            let director = &self.directors[i];
            self.registry.assign(&self.tenant, &self.hosts[i]);
            let mut writes = HashMap::new();
            writes.insert(
                self.tenant.clone(),
                vec![WriteBatch::new(partition, activities.to_vec())],
            );
            director.index(writes).await.unwrap();
            director.backfill_complete(&self.tenant, partition).await.unwrap();
            director.caught_up(&self.tenant, partition).await.unwrap();
        }
    }

    async fn count(&self, from: usize, evaluator: CountEvaluator) -> QueryResponse<u64> {
        let request = QueryRequest::builder()
            .tenant(self.tenant.clone())
            .payload(CountRequest {
                verb: None,
                limit: evaluator.limit,
            })
            .log_level(LogLevel::Debug)
            .build();
        self.directors[from]
            .ask_and_merge(
                &Arc::new(Count),
                request,
                &evaluator,
                &CountMerger,
                0,
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }
}

fn activities(first: u64, n: u64, stream: &str) -> Vec<Activity> {
    (first..first + n)
        .map(|id| Activity::new(id, stream, "click", id as i64))
        .collect()
}

#[tokio::test]
async fn partitions_are_asked_newest_first_and_reports_carry_forward() {
    let cluster = Cluster::new(2, false);
    for partition in [2, 0, 3, 1] {
        cluster
            .place(partition, &[1], &activities(partition * 10, 1, "s"))
            .await;
    }
    let request = QueryRequest::builder()
        .tenant("acme")
        .payload(0u8)
        .build();
    let response = cluster.directors[0]
        .ask_and_merge(
            &Arc::new(Which),
            request,
            &Exhaustive::default(),
            &Concat,
            Vec::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.answer, vec![(3, 0), (2, 1), (1, 2), (0, 3)]);
    assert_eq!(response.stats.partitions_queried, 4);
    assert_eq!(response.stats.partitions_solved, 4);
    assert!(response.results_exhausted);
}

#[tokio::test]
async fn prior_report_seeds_the_newest_partition() {
    let cluster = Cluster::new(2, false);
    cluster.place(0, &[1], &activities(0, 1, "s")).await;
    let request = QueryRequest::builder()
        .tenant("acme")
        .payload(0u8)
        .prior_report(40)
        .build();
    let response = cluster.directors[0]
        .ask_and_merge(
            &Arc::new(Which),
            request,
            &Exhaustive::default(),
            &Concat,
            Vec::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.answer, vec![(0, 40)]);
}

#[tokio::test]
async fn evaluator_stops_once_the_answer_is_complete() {
    let cluster = Cluster::new(2, false);
    for partition in 0..4 {
        cluster
            .place(partition, &[1], &activities(partition * 100, 5, "s"))
            .await;
    }
    let response = cluster
        .count(
            0,
            CountEvaluator {
                limit: Some(7),
                strict: false,
            },
        )
        .await;
    assert_eq!(response.answer, 7);
    assert_eq!(response.stats.partitions_queried, 2);
    assert_eq!(response.stats.partitions_skipped, 0);
    assert!(response.results_exhausted);
    assert!(!response.log.is_empty());
}

#[tokio::test]
async fn unreachable_partition_is_skipped_and_flagged() {
    let cluster = Cluster::new(3, false);
    cluster.place(2, &[1], &activities(200, 2, "s")).await;
    cluster.place(1, &[2], &activities(100, 3, "s")).await;
    cluster.place(0, &[1], &activities(0, 4, "s")).await;
    cluster.transport.set_down(&cluster.hosts[2], true);

    let response = cluster.count(0, CountEvaluator::default()).await;
    assert_eq!(response.answer, 6);
    assert_eq!(response.stats.partitions_queried, 3);
    assert_eq!(response.stats.partitions_skipped, 1);
    assert!(!response.results_exhausted);

    let counters = cluster.metrics.snapshot();
    assert!(counters.unavailable >= 1);
    assert_eq!(counters.unsolvable, 1);
}

#[tokio::test]
async fn strict_evaluator_aborts_on_an_unsolvable_partition() {
    let cluster = Cluster::new(3, false);
    cluster.place(2, &[1], &activities(200, 2, "s")).await;
    cluster.place(1, &[2], &activities(100, 3, "s")).await;
    cluster.place(0, &[1], &activities(0, 4, "s")).await;
    cluster.transport.set_down(&cluster.hosts[2], true);

    let response = cluster
        .count(
            0,
            CountEvaluator {
                limit: None,
                strict: true,
            },
        )
        .await;
    assert_eq!(response.answer, 2);
    assert_eq!(response.stats.partitions_queried, 2);
    assert_eq!(response.stats.partitions_skipped, 2);
    assert!(!response.results_exhausted);
}

#[tokio::test]
async fn another_replica_covers_for_a_slow_one() {
    let cluster = Cluster::new(3, false);
    cluster.place(0, &[1, 2], &activities(0, 3, "s")).await;
    cluster
        .transport
        .set_delay(&cluster.hosts[1], Duration::from_secs(5));

    let started = Instant::now();
    let response = cluster.count(0, CountEvaluator::default()).await;
    assert_eq!(response.answer, 3);
    assert!(response.results_exhausted);
    assert!(started.elapsed() < Duration::from_millis(1_000));
}

#[tokio::test]
async fn partition_past_its_deadline_contributes_nothing() {
    let cluster = Cluster::new(2, false);
    cluster.place(0, &[1], &activities(0, 3, "s")).await;
    cluster
        .transport
        .set_delay(&cluster.hosts[1], Duration::from_secs(5));

    let started = Instant::now();
    let response = cluster.count(0, CountEvaluator::default()).await;
    assert_eq!(response.answer, 0);
    assert_eq!(response.stats.partitions_skipped, 1);
    assert!(!response.results_exhausted);
    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert_eq!(cluster.metrics.snapshot().timed_out, 1);
}

#[tokio::test]
async fn local_replica_is_answered_in_process() {
    let cluster = Cluster::new(2, false);
    cluster.place(0, &[1], &activities(0, 3, "s")).await;
    // nothing reaches host-1 over the network any more
    cluster.transport.set_down(&cluster.hosts[1], true);

    let response = cluster.count(1, CountEvaluator::default()).await;
    assert_eq!(response.answer, 3);
    assert!(response.results_exhausted);
    assert_eq!(cluster.transport.calls(&cluster.hosts[1]), 0);
}

#[tokio::test]
async fn compressed_frames_round_trip() {
    let cluster = Cluster::new(2, true);
    cluster.place(0, &[1], &activities(0, 3, "s")).await;
    cluster.place(1, &[1], &activities(10, 2, "s")).await;
    let response = cluster.count(0, CountEvaluator::default()).await;
    assert_eq!(response.answer, 5);
}

#[tokio::test]
async fn distinct_streams_stop_at_the_limit() {
    let cluster = Cluster::new(2, false);
    cluster
        .place(
            0,
            &[1],
            &[
                Activity::new(1, "a", "click", 1),
                Activity::new(2, "b", "click", 2),
            ],
        )
        .await;
    cluster
        .place(
            1,
            &[1],
            &[
                Activity::new(3, "c", "click", 3),
                Activity::new(4, "a", "click", 4),
            ],
        )
        .await;
    cluster
        .place(2, &[1], &[Activity::new(5, "d", "click", 5)])
        .await;

    let request = QueryRequest::builder()
        .tenant("acme")
        .payload(DistinctRequest {
            verb: None,
            limit: 3,
        })
        .build();
    let response = cluster.directors[0]
        .ask_and_merge(
            &Arc::new(Distinct),
            request,
            &DistinctEvaluator { limit: 3 },
            &DistinctMerger { limit: 3 },
            Vec::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.answer, vec!["d", "a", "c"]);
    assert_eq!(response.stats.partitions_queried, 2);
    assert!(response.results_exhausted);
}

#[tokio::test]
async fn single_partition_ask() {
    let cluster = Cluster::new(2, false);
    cluster.place(0, &[1], &activities(0, 3, "s")).await;
    cluster.place(1, &[1], &activities(10, 2, "s")).await;
    let request = QueryRequest::builder()
        .tenant("acme")
        .payload(CountRequest::default())
        .build();
    let response = cluster.directors[0]
        .ask_and_merge_partition(
            &Arc::new(Count),
            request,
            PartitionId(0),
            &CountEvaluator::default(),
            &CountMerger,
            0,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.answer, 3);
    assert_eq!(response.stats.partitions_queried, 1);
}

#[tokio::test]
async fn cancelled_request_returns_what_it_has() {
    let cluster = Cluster::new(2, false);
    cluster.place(0, &[1], &activities(0, 3, "s")).await;
    cluster
        .transport
        .set_delay(&cluster.hosts[1], Duration::from_secs(5));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let request = QueryRequest::builder()
        .tenant("acme")
        .payload(CountRequest::default())
        .build();
    let response = cluster.directors[0]
        .ask_and_merge(
            &Arc::new(Count),
            request,
            &CountEvaluator::default(),
            &CountMerger,
            0,
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(response.answer, 0);
    assert!(!response.results_exhausted);
}
