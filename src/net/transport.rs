// Both ends of the replica call. The director's side only ever sees
// `ReplicaTransport`: send a frame to an endpoint on a host, get back a status
// and a body. A host answers through `ReplicaService`, whatever carries the
// bytes in between (QUIC between processes, a direct call in-process).

use futures::future::BoxFuture;

use super::error::TransportError;
use crate::partition::Host;

/// Reply status codes. 503 is the single value meaning "unavailable, try
/// another replica"; any other non-success status fails the attempt.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL: u16 = 500;
    pub const UNAVAILABLE: u16 = 503;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: status::OK,
            body,
        }
    }

    /// A successful reply carrying no results.
    pub fn empty() -> Self {
        Self::ok(Vec::new())
    }

    pub fn error(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            body: reason.into().into_bytes(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Client side of a replica call.
pub trait ReplicaTransport: Send + Sync {
    fn call<'a>(
        &'a self,
        host: &'a Host,
        endpoint: &'a str,
        frame: Vec<u8>,
    ) -> BoxFuture<'a, Result<Reply, TransportError>>;
}

/// Host side of a replica call.
pub trait ReplicaService: Send + Sync {
    fn handle(&self, endpoint: &str, frame: Vec<u8>) -> BoxFuture<'static, Reply>;
}
