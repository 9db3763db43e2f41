use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, debug_span, Instrument};

use super::{
    transport::{status, ReplicaTransport},
    wire::{self, Compression, RequestHeader, Wire},
};
use crate::config::TransportConfig;
use crate::metrics::{FailureKind, Metrics};
use crate::partition::Host;
use crate::solve::solvable::PartitionResponse;

/// Outcome of a failed replica attempt. The split between the first two is
/// load-bearing: unavailable replicas are expected to recover, service
/// failures usually point at a broken peer or version skew.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("partition unavailable: {0}")]
    PartitionUnavailable(String),
    #[error("query service failure: {0}")]
    QueryServiceFailure(String),
    #[error("attempt cancelled")]
    Cancelled,
}

impl ReadError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            ReadError::PartitionUnavailable(_) => Some(FailureKind::Unavailable),
            ReadError::QueryServiceFailure(_) => Some(FailureKind::ServiceFailure),
            ReadError::Cancelled => None,
        }
    }
}

/// Executes one query against one replica host and classifies the outcome.
pub struct RemotePartitionReader {
    transport: Arc<dyn ReplicaTransport>,
    compression: Compression,
    call_timeout: Duration,
    max_frame_bytes: usize,
    metrics: Arc<dyn Metrics>,
}

impl RemotePartitionReader {
    pub fn new(
        transport: Arc<dyn ReplicaTransport>,
        config: &TransportConfig,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            transport,
            compression: config.compression(),
            call_timeout: config.call_timeout(),
            max_frame_bytes: config.max_frame_bytes,
            metrics,
        }
    }

    /// Sends `(request, report)` to `endpoint` on `host`.
    ///
    /// An empty reply body means the partition legitimately found nothing and
    /// yields `empty()`. Transport failures and 503 map to
    /// `PartitionUnavailable`; any other non-success status and any payload
    /// that fails to decode map to `QueryServiceFailure`.
    #[allow(clippy::too_many_arguments)]
    pub async fn read<Q, A, R>(
        &self,
        query_key: &str,
        host: &Host,
        endpoint: &str,
        header: &RequestHeader,
        request: &Q,
        report: Option<&R>,
        empty: impl FnOnce() -> PartitionResponse<A, R>,
    ) -> Result<PartitionResponse<A, R>, ReadError>
    where
        Q: Wire,
        A: Wire,
        R: Wire,
    {
        let span = debug_span!(
            "remote_read",
            %host,
            endpoint,
            query_key,
            partition = header.partition
        );
        let result: Result<PartitionResponse<A, R>, ReadError> = async move {
            let frame =
                wire::encode_request(header, request, report, self.compression)
                    .map_err(|e| ReadError::QueryServiceFailure(e.to_string()))?;
            debug!(bytes = frame.len(), "sending request");

            let reply = match tokio::time::timeout(
                self.call_timeout,
                self.transport.call(host, endpoint, frame),
            )
            .await
            {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    return Err(ReadError::PartitionUnavailable(e.to_string()))
                }
                Err(_) => {
                    return Err(ReadError::PartitionUnavailable(format!(
                        "no reply from {host} within {:?}",
                        self.call_timeout
                    )))
                }
            };

            if reply.status == status::UNAVAILABLE {
                return Err(ReadError::PartitionUnavailable(format!(
                    "{host} answered {}: {}",
                    reply.status,
                    String::from_utf8_lossy(&reply.body)
                )));
            }
            if !reply.is_success() {
                return Err(ReadError::QueryServiceFailure(format!(
                    "{host} answered {}: {}",
                    reply.status,
                    String::from_utf8_lossy(&reply.body)
                )));
            }
            if reply.body.is_empty() {
                debug!("empty results");
                return Ok(empty());
            }
            if reply.body.len() > self.max_frame_bytes {
                return Err(ReadError::QueryServiceFailure(
                    wire::WireError::TooLarge(reply.body.len()).to_string(),
                ));
            }

            let (answer, report) =
                wire::decode_response::<A, R>(&reply.body, self.max_frame_bytes)
                    .map_err(|e| ReadError::QueryServiceFailure(e.to_string()))?;
            debug!(bytes = reply.body.len(), "decoded response");
            Ok(PartitionResponse { answer, report })
        }
        .instrument(span)
        .await;

        if let Err(e) = &result {
            if let Some(kind) = e.kind() {
                self.metrics.replica_failed(kind);
            }
        }
        result
    }
}
