// The host side of a remote read. Each registered plugin gets an endpoint; a
// call decodes the frame, checks the partition is online here and that the
// host has room for another query, runs the plugin against the local index on
// a blocking worker and encodes the answer back, compressed the same way the
// request was.

use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use hashbrown::HashMap;
use tokio::sync::Semaphore;
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    transport::{status, Reply, ReplicaService},
    wire::{self, Compression, RequestFrame},
};
use crate::config::TransportConfig;
use crate::partition::{state::PartitionStates, PartitionState};
use crate::plugin::{answer_locally, IndexEngine, QueryContext, QueryError, QueryPlugin};

type Handler = Box<dyn Fn(Vec<u8>) -> BoxFuture<'static, Reply> + Send + Sync>;

pub struct HostService<E> {
    engine: Arc<E>,
    states: Arc<PartitionStates>,
    permits: Arc<Semaphore>,
    compression_level: i32,
    max_frame_bytes: usize,
    endpoints: HashMap<&'static str, Handler>,
}

impl<E: IndexEngine> HostService<E> {
    pub fn new(engine: Arc<E>, states: Arc<PartitionStates>, config: &TransportConfig) -> Self {
        Self {
            engine,
            states,
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            compression_level: config.compression_level,
            max_frame_bytes: config.max_frame_bytes,
            endpoints: HashMap::new(),
        }
    }

    /// Serves `plugin` under its endpoint, replacing any earlier plugin with
    /// the same name.
    pub fn register<P>(mut self, plugin: Arc<P>) -> Self
    where
        P: QueryPlugin<E::Handle>,
    {
        let endpoint = plugin.endpoint();
        let engine = self.engine.clone();
        let states = self.states.clone();
        let permits = self.permits.clone();
        let level = self.compression_level;
        let limit = self.max_frame_bytes;
        let handler: Handler = Box::new(move |frame| {
            serve(
                engine.clone(),
                states.clone(),
                permits.clone(),
                plugin.clone(),
                level,
                limit,
                frame,
            )
            .boxed()
        });
        self.endpoints.insert(endpoint, handler);
        self
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.endpoints.keys().copied()
    }
}

impl<E: IndexEngine> ReplicaService for HostService<E> {
    fn handle(&self, endpoint: &str, frame: Vec<u8>) -> BoxFuture<'static, Reply> {
        match self.endpoints.get(endpoint) {
            Some(handler) => handler(frame),
            None => future::ready(Reply::error(
                status::NOT_FOUND,
                format!("no endpoint {endpoint}"),
            ))
            .boxed(),
        }
    }
}

async fn serve<E, P>(
    engine: Arc<E>,
    states: Arc<PartitionStates>,
    permits: Arc<Semaphore>,
    plugin: Arc<P>,
    level: i32,
    limit: usize,
    frame: Vec<u8>,
) -> Reply
where
    E: IndexEngine,
    P: QueryPlugin<E::Handle>,
{
    let request: RequestFrame<P::Request, P::Report> = match wire::decode_request(&frame, limit) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "rejecting malformed request");
            return Reply::error(status::BAD_REQUEST, e.to_string());
        }
    };
    let tenant = request.header.tenant();
    let partition = request.header.partition();
    let span = debug_span!("serve", endpoint = plugin.endpoint(), %tenant, %partition);

    async move {
        if states.state(&tenant, partition) != Some(PartitionState::Online) {
            debug!("partition not online here");
            return Reply::error(status::UNAVAILABLE, format!("{tenant}/{partition} not online"));
        }
        let Ok(_permit) = permits.try_acquire_owned() else {
            debug!("over capacity");
            return Reply::error(status::UNAVAILABLE, "over capacity");
        };

        let ctx = QueryContext {
            tenant,
            partition,
            authorization: request.header.authorization.clone(),
        };
        let result =
            answer_locally(engine, plugin.clone(), ctx, request.request, request.report).await;
        let response = match result {
            Ok(response) => response,
            Err(e @ QueryError::NotHosted { .. }) => {
                return Reply::error(status::UNAVAILABLE, e.to_string())
            }
            Err(e @ QueryError::InvalidRequest(_)) => {
                return Reply::error(status::BAD_REQUEST, e.to_string())
            }
            Err(e) => {
                warn!(error = %e, "query failed");
                return Reply::error(status::INTERNAL, e.to_string());
            }
        };
        if plugin.is_empty(&response) {
            debug!("empty results");
            return Reply::empty();
        }

        let compression = if request.compressed {
            Compression::Zstd(level)
        } else {
            Compression::None
        };
        match wire::encode_response(&response.answer, response.report.as_ref(), compression) {
            Ok(body) => Reply::ok(body),
            Err(e) => {
                warn!(error = %e, "could not encode response");
                Reply::error(status::INTERNAL, e.to_string())
            }
        }
    }
    .instrument(span)
    .await
}
