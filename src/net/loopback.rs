// Routes replica calls straight to in-process host services. Hosts can be
// taken down or slowed so tests and demos can exercise the failure paths
// without sockets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use tracing::debug;

use super::{
    error::TransportError,
    transport::{Reply, ReplicaService, ReplicaTransport},
};
use crate::partition::Host;

#[derive(Default)]
pub struct LoopbackTransport {
    services: RwLock<HashMap<Host, Arc<dyn ReplicaService>>>,
    down: RwLock<HashSet<Host>>,
    delays: RwLock<HashMap<Host, Duration>>,
    calls: RwLock<HashMap<Host, Arc<AtomicU64>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, host: Host, service: Arc<dyn ReplicaService>) {
        self.services.write().insert(host, service);
    }

    /// Calls to a down host fail as if the connection was refused.
    pub fn set_down(&self, host: &Host, down: bool) {
        let mut hosts = self.down.write();
        if down {
            hosts.insert(host.clone());
        } else {
            hosts.remove(host);
        }
    }

    /// Delays every call to `host` before it reaches the service.
    pub fn set_delay(&self, host: &Host, delay: Duration) {
        self.delays.write().insert(host.clone(), delay);
    }

    /// Calls that reached `host`'s service.
    pub fn calls(&self, host: &Host) -> u64 {
        self.calls
            .read()
            .get(host)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn counter(&self, host: &Host) -> Arc<AtomicU64> {
        self.calls.write().entry(host.clone()).or_default().clone()
    }
}

impl ReplicaTransport for LoopbackTransport {
    fn call<'a>(
        &'a self,
        host: &'a Host,
        endpoint: &'a str,
        frame: Vec<u8>,
    ) -> BoxFuture<'a, Result<Reply, TransportError>> {
        async move {
            if self.down.read().contains(host) {
                return Err(TransportError::Connect {
                    host: host.to_string(),
                    reason: "connection refused".into(),
                });
            }
            let service = self
                .services
                .read()
                .get(host)
                .cloned()
                .ok_or_else(|| TransportError::NoRoute {
                    host: host.to_string(),
                })?;
            let delay = self.delays.read().get(host).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.counter(host).fetch_add(1, Ordering::Relaxed);
            debug!(%host, endpoint, bytes = frame.len(), "loopback call");
            Ok(service.handle(endpoint, frame).await)
        }
        .boxed()
    }
}
