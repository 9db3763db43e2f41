// A query plugin is the capability "produce an answer from a request given an
// index handle". The director and the host service are written once against
// it; each query type brings its own request, answer and report shapes.

use std::sync::Arc;

use thiserror::Error;

use crate::engine::EngineError;
use crate::net::wire::Wire;
use crate::partition::{PartitionId, TenantId};
use crate::solve::PartitionResponse;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("partition {tenant}/{partition} is not hosted here")]
    NotHosted {
        tenant: TenantId,
        partition: PartitionId,
    },
    #[error("query aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Who is asking and where.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryContext {
    pub tenant: TenantId,
    pub partition: PartitionId,
    /// Opaque expression restricting what the caller may see. Interpreted by
    /// the index engine.
    pub authorization: String,
}

/// The storage engine that evaluates filters against a partition's data.
pub trait IndexEngine: Send + Sync + 'static {
    type Activity: Clone + Send + Sync + 'static;
    /// A read handle onto one partition.
    type Handle: Send + Sync + 'static;

    fn handle(&self, tenant: &TenantId, partition: PartitionId) -> Option<Arc<Self::Handle>>;

    /// Appends activities to a partition, creating it on first write. Returns
    /// how many were indexed.
    fn index(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
        activities: Vec<Self::Activity>,
    ) -> Result<usize, EngineError>;

    /// Drops a partition's data. Returns false if there was none.
    fn drop_partition(&self, tenant: &TenantId, partition: PartitionId) -> bool;
}

/// One query type. `H` is the index handle it reads from.
pub trait QueryPlugin<H>: Send + Sync + 'static {
    type Request: Wire + Clone + Send + Sync + 'static;
    type Answer: Wire + Clone + Send + Sync + 'static;
    type Report: Wire + Clone + Send + Sync + 'static;

    /// Name the host service registers this plugin under.
    fn endpoint(&self) -> &'static str;

    /// Answers `request` against one partition. `report` is the one produced
    /// by the previous (newer) partition, if any.
    fn answer(
        &self,
        ctx: &QueryContext,
        index: &H,
        request: &Self::Request,
        report: Option<&Self::Report>,
    ) -> Result<PartitionResponse<Self::Answer, Self::Report>, QueryError>;

    /// The answer of a partition that found nothing.
    fn empty(&self) -> Self::Answer;

    /// Responses for which this returns true travel as an empty body.
    fn is_empty(&self, _response: &PartitionResponse<Self::Answer, Self::Report>) -> bool {
        false
    }
}

/// Runs a plugin against this process's copy of a partition on a blocking
/// worker.
pub(crate) async fn answer_locally<E, P>(
    engine: Arc<E>,
    plugin: Arc<P>,
    ctx: QueryContext,
    request: P::Request,
    report: Option<P::Report>,
) -> Result<PartitionResponse<P::Answer, P::Report>, QueryError>
where
    E: IndexEngine,
    P: QueryPlugin<E::Handle>,
{
    let handle = engine
        .handle(&ctx.tenant, ctx.partition)
        .ok_or_else(|| QueryError::NotHosted {
            tenant: ctx.tenant.clone(),
            partition: ctx.partition,
        })?;
    tokio::task::spawn_blocking(move || {
        plugin.answer(&ctx, &handle, &request, report.as_ref())
    })
    .await
    .map_err(|e| QueryError::Aborted(e.to_string()))?
}
