// The director answers tenant queries by walking the tenant's partitions
// newest first. Each partition is handed to the speculative solver as a set of
// solvables, one per replica worth asking; the winning answer is folded into
// the running answer and the plugin's evaluator decides whether to go on.
// Newest first is load-bearing: evaluators stop early on the assumption that
// recent data was seen first.
//
// The same type owns the write fan-out and the administrative surface, see
// `admin`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;
use tracing::{debug, info_span, Instrument};

use crate::config::{Config, DirectorConfig};
use crate::engine::EngineError;
use crate::metrics::Metrics;
use crate::net::{
    reader::{ReadError, RemotePartitionReader},
    transport::ReplicaTransport,
    wire::RequestHeader,
};
use crate::partition::{
    state::{PartitionStates, StateError},
    topology::{OrderedPartition, Replica, TopologyError, TopologyRegistry, TopologyResolver},
    PartitionId, PartitionState, TenantId,
};
use crate::plugin::{answer_locally, IndexEngine, QueryContext, QueryError, QueryPlugin};
use crate::solve::{
    Evaluator, LogLevel, Merger, PartitionResponse, Solvable, SolutionLog, SolveOutcome,
    SpeculativeSolver,
};

mod admin;

pub use admin::WriteBatch;

#[derive(Debug, Error)]
pub enum DirectorError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("writes landed on hosts that do not carry {misrouted:?}, re-route them")]
    WriteQuorumFailure {
        misrouted: Vec<(TenantId, PartitionId)>,
    },
    #[error("partition {tenant}/{partition} does not exist")]
    UnknownPartition {
        tenant: TenantId,
        partition: PartitionId,
    },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A tenant-scoped query for plugin request `Q` with report `R`.
#[derive(Clone, Debug, TypedBuilder)]
pub struct QueryRequest<Q, R> {
    #[builder(setter(into))]
    pub tenant: TenantId,
    pub payload: Q,
    /// Steers replica selection only.
    #[builder(default, setter(into))]
    pub query_key: String,
    /// Report to hand to the first (newest) partition.
    #[builder(default, setter(strip_option))]
    pub prior_report: Option<R>,
    #[builder(default, setter(into))]
    pub authorization: String,
    #[builder(default)]
    pub log_level: LogLevel,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Partitions a solve was started for.
    pub partitions_queried: usize,
    /// Partitions that contributed nothing: unsolved, or never reached
    /// because the request was aborted or ran out of time.
    pub partitions_skipped: usize,
    pub partitions_solved: usize,
    pub elapsed_ms: u64,
}

#[derive(Clone, Debug)]
pub struct QueryResponse<A> {
    pub answer: A,
    pub log: Vec<String>,
    pub stats: QueryStats,
    /// False whenever a partition that should have contributed did not.
    pub results_exhausted: bool,
}

pub struct PartitionDirector<E: IndexEngine> {
    config: DirectorConfig,
    resolver: TopologyResolver,
    registry: Arc<dyn TopologyRegistry>,
    reader: Arc<RemotePartitionReader>,
    solver: SpeculativeSolver,
    states: Arc<PartitionStates>,
    engine: Arc<E>,
    metrics: Arc<dyn Metrics>,
}

impl<E: IndexEngine> PartitionDirector<E> {
    pub fn new(
        config: &Config,
        registry: Arc<dyn TopologyRegistry>,
        transport: Arc<dyn ReplicaTransport>,
        engine: Arc<E>,
        states: Arc<PartitionStates>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        let local = config.director.local_host.clone();
        Self {
            config: config.director.clone(),
            resolver: TopologyResolver::new(registry.clone(), local),
            registry,
            reader: Arc::new(RemotePartitionReader::new(
                transport,
                &config.transport,
                metrics.clone(),
            )),
            solver: SpeculativeSolver::new(config.solver.clone(), metrics.clone()),
            states,
            engine,
            metrics,
        }
    }

    pub fn local_host(&self) -> &crate::partition::Host {
        self.resolver.local_host()
    }

    pub fn states(&self) -> &Arc<PartitionStates> {
        &self.states
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Asks every partition of the tenant, newest first, folding each answer
    /// into `default` until the evaluator is satisfied.
    ///
    /// Only an unreachable topology registry fails the request. Partitions
    /// that cannot be solved are skipped, or end the request when the
    /// evaluator says so; either way the response says the results are not
    /// exhausted.
    pub async fn ask_and_merge<P, V, M>(
        &self,
        plugin: &Arc<P>,
        request: QueryRequest<P::Request, P::Report>,
        evaluator: &V,
        merger: &M,
        default: P::Answer,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse<P::Answer>, DirectorError>
    where
        P: QueryPlugin<E::Handle>,
        V: Evaluator<P::Answer> + ?Sized,
        M: Merger<P::Answer, P::Report> + ?Sized,
    {
        let span = info_span!("ask_and_merge", tenant = %request.tenant, endpoint = plugin.endpoint());
        async move {
            let started = Instant::now();
            let mut log = SolutionLog::new(request.log_level);
            let topology = self
                .resolver
                .ordered_partitions(&request.tenant, &request.query_key)
                .await?;
            log.info(format_args!(
                "{} partition(s) for {}: {:?}",
                topology.len(),
                request.tenant,
                topology.partition_ids()
            ));
            Ok(self
                .fold(
                    plugin,
                    request,
                    topology.iter(),
                    topology.len(),
                    evaluator,
                    merger,
                    default,
                    cancel,
                    log,
                    started,
                )
                .await)
        }
        .instrument(span)
        .await
    }

    /// Asks a single partition. Used by administrative and debugging flows.
    pub async fn ask_and_merge_partition<P, V, M>(
        &self,
        plugin: &Arc<P>,
        request: QueryRequest<P::Request, P::Report>,
        partition: PartitionId,
        evaluator: &V,
        merger: &M,
        default: P::Answer,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse<P::Answer>, DirectorError>
    where
        P: QueryPlugin<E::Handle>,
        V: Evaluator<P::Answer> + ?Sized,
        M: Merger<P::Answer, P::Report> + ?Sized,
    {
        let span = info_span!("ask_and_merge_partition", tenant = %request.tenant, %partition);
        async move {
            let started = Instant::now();
            let log = SolutionLog::new(request.log_level);
            let topology = self
                .resolver
                .ordered_partitions(&request.tenant, &request.query_key)
                .await?;
            let ordered = topology
                .get(partition)
                .ok_or_else(|| DirectorError::UnknownPartition {
                    tenant: request.tenant.clone(),
                    partition,
                })?;
            Ok(self
                .fold(
                    plugin,
                    request,
                    std::iter::once(ordered),
                    1,
                    evaluator,
                    merger,
                    default,
                    cancel,
                    log,
                    started,
                )
                .await)
        }
        .instrument(span)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn fold<P, V, M>(
        &self,
        plugin: &Arc<P>,
        request: QueryRequest<P::Request, P::Report>,
        partitions: impl Iterator<Item = OrderedPartition>,
        total: usize,
        evaluator: &V,
        merger: &M,
        default: P::Answer,
        cancel: &CancellationToken,
        mut log: SolutionLog,
        started: Instant,
    ) -> QueryResponse<P::Answer>
    where
        P: QueryPlugin<E::Handle>,
        V: Evaluator<P::Answer> + ?Sized,
        M: Merger<P::Answer, P::Report> + ?Sized,
    {
        let request_deadline = started + self.config.request_deadline();
        // stops whatever is still racing once this request is over
        let cancel = cancel.child_token();
        let mut running = default;
        let mut report = request.prior_report.clone();
        let mut stats = QueryStats::default();

        for (visited, partition) in partitions.enumerate() {
            let left = request_deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                stats.partitions_skipped += total - visited;
                log.info(format_args!(
                    "request deadline reached, skipping {} partition(s)",
                    total - visited
                ));
                break;
            }

            let id = partition.partition;
            stats.partitions_queried += 1;
            let solvables = self.solvables(plugin, &request, &partition, report.as_ref());
            let budget = left.min(self.solver.config().deadline());
            match self
                .solver
                .solve_within(solvables, budget, &mut log, &cancel)
                .await
            {
                SolveOutcome::Solved { response, .. } => {
                    stats.partitions_solved += 1;
                    let PartitionResponse {
                        answer,
                        report: partition_report,
                    } = response;
                    running = merger.merge(running, answer, partition_report.as_ref());
                    if partition_report.is_some() {
                        report = partition_report;
                    }
                    if evaluator.is_done(&running, &log) {
                        log.info(format_args!("answer complete after {id}"));
                        break;
                    }
                }
                SolveOutcome::TimedOut { .. } | SolveOutcome::Unsolvable { .. } => {
                    stats.partitions_skipped += 1;
                    if evaluator.stop_on_unsolvable_partition() {
                        let rest = total - visited - 1;
                        stats.partitions_skipped += rest;
                        log.info(format_args!(
                            "{id} unsolvable, aborting with {rest} partition(s) left"
                        ));
                        break;
                    }
                    log.debug(format_args!("{id} unsolvable, skipped"));
                }
                SolveOutcome::Cancelled => {
                    stats.partitions_skipped += total - visited;
                    log.info("request cancelled");
                    break;
                }
            }
        }
        cancel.cancel();

        let elapsed = started.elapsed();
        stats.elapsed_ms = elapsed.as_millis() as u64;
        self.metrics.request_finished(elapsed);
        debug!(?stats, "request finished");
        QueryResponse {
            answer: running,
            log: log.into_lines(),
            results_exhausted: stats.partitions_skipped == 0,
            stats,
        }
    }

    /// One solvable per replica worth asking. The local replica is answered
    /// in-process, and only while this host has it online.
    fn solvables<P>(
        &self,
        plugin: &Arc<P>,
        request: &QueryRequest<P::Request, P::Report>,
        partition: &OrderedPartition,
        report: Option<&P::Report>,
    ) -> Vec<Solvable<P::Answer, P::Report>>
    where
        P: QueryPlugin<E::Handle>,
    {
        partition
            .replicas
            .iter()
            .filter_map(|replica| {
                if replica.local {
                    let online = self
                        .states
                        .state(&replica.coord.tenant, replica.coord.partition)
                        == Some(PartitionState::Online);
                    online.then(|| self.local_solvable(plugin, request, replica, report))
                } else {
                    Some(self.remote_solvable(plugin, request, replica, report))
                }
            })
            .collect()
    }

    fn local_solvable<P>(
        &self,
        plugin: &Arc<P>,
        request: &QueryRequest<P::Request, P::Report>,
        replica: &Replica,
        report: Option<&P::Report>,
    ) -> Solvable<P::Answer, P::Report>
    where
        P: QueryPlugin<E::Handle>,
    {
        let engine = self.engine.clone();
        let plugin = plugin.clone();
        let metrics = self.metrics.clone();
        let ctx = QueryContext {
            tenant: replica.coord.tenant.clone(),
            partition: replica.coord.partition,
            authorization: request.authorization.clone(),
        };
        let payload = request.payload.clone();
        let report = report.cloned();
        Solvable::new(replica.coord.clone(), move |_cancel| async move {
            let result = answer_locally(engine, plugin, ctx, payload, report)
                .await
                .map_err(|e| match e {
                    QueryError::NotHosted { .. } => ReadError::PartitionUnavailable(e.to_string()),
                    other => ReadError::QueryServiceFailure(other.to_string()),
                });
            if let Err(e) = &result {
                if let Some(kind) = e.kind() {
                    metrics.replica_failed(kind);
                }
            }
            result
        })
    }

    fn remote_solvable<P>(
        &self,
        plugin: &Arc<P>,
        request: &QueryRequest<P::Request, P::Report>,
        replica: &Replica,
        report: Option<&P::Report>,
    ) -> Solvable<P::Answer, P::Report>
    where
        P: QueryPlugin<E::Handle>,
    {
        let reader = self.reader.clone();
        let plugin = plugin.clone();
        let host = replica.coord.host.clone();
        let header = RequestHeader::new(
            &replica.coord.tenant,
            replica.coord.partition,
            &request.authorization,
        );
        let query_key = request.query_key.clone();
        let payload = request.payload.clone();
        let report = report.cloned();
        Solvable::new(replica.coord.clone(), move |_cancel| async move {
            let empty = || PartitionResponse::answer(plugin.empty());
            reader
                .read(
                    &query_key,
                    &host,
                    plugin.endpoint(),
                    &header,
                    &payload,
                    report.as_ref(),
                    empty,
                )
                .await
        })
    }

    fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval()
    }
}

#[cfg(test)]
mod tests;
