// The topology registry is the fleet's source of truth for which hosts carry
// which tenants and which partition replicas. It lives outside this crate;
// `MemoryRegistry` is an in-process stand-in used by tests, the demo and
// single-host deployments.
//
// The resolver turns the registry's flat replica list into what the director
// needs: partitions newest first, each with the replicas worth asking, the
// local copy first. Nothing is cached; every resolution asks the registry
// again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use hashbrown::HashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::debug;

use super::{
    BackingStorage, Host, PartitionCoord, PartitionId, PartitionState, TenantId,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology registry unreachable: {0}")]
    Unreachable(String),
}

/// What the registry knows about one replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaRecord {
    pub tenant: TenantId,
    pub partition: PartitionId,
    pub host: Host,
    pub state: PartitionState,
    pub storage: BackingStorage,
}

impl ReplicaRecord {
    pub fn coord(&self) -> PartitionCoord {
        PartitionCoord::new(self.tenant.clone(), self.partition, self.host.clone())
    }
}

/// The cluster registry tracking host liveness, tenant assignment and replica
/// placement.
pub trait TopologyRegistry: Send + Sync {
    /// Every replica the registry knows of for a tenant, in no particular
    /// order.
    fn replicas<'a>(
        &'a self,
        tenant: &'a TenantId,
    ) -> BoxFuture<'a, Result<Vec<ReplicaRecord>, TopologyError>>;

    /// Hosts a tenant is assigned to.
    fn assignment<'a>(
        &'a self,
        tenant: &'a TenantId,
    ) -> BoxFuture<'a, Result<Vec<Host>, TopologyError>>;

    /// Publishes the given replica records as the host's current view and
    /// counts as a liveness signal for it.
    fn publish<'a>(
        &'a self,
        host: &'a Host,
        records: Vec<ReplicaRecord>,
    ) -> BoxFuture<'a, Result<(), TopologyError>>;

    /// Forgets a host and all of its replicas.
    fn remove_host<'a>(
        &'a self,
        host: &'a Host,
    ) -> BoxFuture<'a, Result<bool, TopologyError>>;

    /// Forgets a single replica.
    fn remove_topology<'a>(
        &'a self,
        coord: &'a PartitionCoord,
    ) -> BoxFuture<'a, Result<bool, TopologyError>>;
}

#[derive(Default)]
struct RegistryState {
    assignments: HashMap<TenantId, Vec<Host>>,
    replicas: HashMap<TenantId, HashMap<(PartitionId, Host), ReplicaRecord>>,
    heartbeats: HashMap<Host, DateTime<Utc>>,
}

/// In-process registry. Can be flipped unreachable to exercise failure
/// handling.
pub struct MemoryRegistry {
    state: RwLock<RegistryState>,
    reachable: AtomicBool,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            reachable: AtomicBool::new(true),
        }
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, tenant: &TenantId, host: &Host) {
        let mut state = self.state.write();
        let hosts = state.assignments.entry(tenant.clone()).or_default();
        if !hosts.contains(host) {
            hosts.push(host.clone());
        }
    }

    pub fn upsert(&self, record: ReplicaRecord) {
        let mut state = self.state.write();
        state
            .replicas
            .entry(record.tenant.clone())
            .or_default()
            .insert((record.partition, record.host.clone()), record);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn last_heartbeat(&self, host: &Host) -> Option<DateTime<Utc>> {
        self.state.read().heartbeats.get(host).copied()
    }

    fn check(&self) -> Result<(), TopologyError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TopologyError::Unreachable("registry offline".into()))
        }
    }
}

impl TopologyRegistry for MemoryRegistry {
    fn replicas<'a>(
        &'a self,
        tenant: &'a TenantId,
    ) -> BoxFuture<'a, Result<Vec<ReplicaRecord>, TopologyError>> {
        let result = self.check().map(|()| {
            self.state
                .read()
                .replicas
                .get(tenant)
                .map(|replicas| replicas.values().cloned().collect())
                .unwrap_or_default()
        });
        future::ready(result).boxed()
    }

    fn assignment<'a>(
        &'a self,
        tenant: &'a TenantId,
    ) -> BoxFuture<'a, Result<Vec<Host>, TopologyError>> {
        let result = self.check().map(|()| {
            self.state
                .read()
                .assignments
                .get(tenant)
                .cloned()
                .unwrap_or_default()
        });
        future::ready(result).boxed()
    }

    fn publish<'a>(
        &'a self,
        host: &'a Host,
        records: Vec<ReplicaRecord>,
    ) -> BoxFuture<'a, Result<(), TopologyError>> {
        let result = self.check().map(|()| {
            let mut state = self.state.write();
            state.heartbeats.insert(host.clone(), Utc::now());
            for record in records {
                state
                    .replicas
                    .entry(record.tenant.clone())
                    .or_default()
                    .insert((record.partition, record.host.clone()), record);
            }
        });
        future::ready(result).boxed()
    }

    fn remove_host<'a>(
        &'a self,
        host: &'a Host,
    ) -> BoxFuture<'a, Result<bool, TopologyError>> {
        let result = self.check().map(|()| {
            let mut state = self.state.write();
            let mut removed = state.heartbeats.remove(host).is_some();
            for hosts in state.assignments.values_mut() {
                let before = hosts.len();
                hosts.retain(|h| h != host);
                removed |= hosts.len() != before;
            }
            for replicas in state.replicas.values_mut() {
                let before = replicas.len();
                replicas.retain(|(_, h), _| h != host);
                removed |= replicas.len() != before;
            }
            removed
        });
        future::ready(result).boxed()
    }

    fn remove_topology<'a>(
        &'a self,
        coord: &'a PartitionCoord,
    ) -> BoxFuture<'a, Result<bool, TopologyError>> {
        let result = self.check().map(|()| {
            self.state
                .write()
                .replicas
                .get_mut(&coord.tenant)
                .map(|replicas| {
                    replicas
                        .remove(&(coord.partition, coord.host.clone()))
                        .is_some()
                })
                .unwrap_or(false)
        });
        future::ready(result).boxed()
    }
}

/// One replica worth asking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Replica {
    pub coord: PartitionCoord,
    pub state: PartitionState,
    pub storage: BackingStorage,
    pub local: bool,
}

/// One partition of a tenant together with its candidate replicas, local
/// replica first.
#[derive(Clone, Debug)]
pub struct OrderedPartition {
    pub partition: PartitionId,
    pub replicas: Vec<Replica>,
}

impl OrderedPartition {
    pub fn local(&self) -> Option<&Replica> {
        self.replicas.iter().find(|replica| replica.local)
    }
}

/// A tenant's partitions as seen by one resolution, newest first.
///
/// Replica ordering for each partition is only worked out when the partition
/// is reached, so a request that stops early never pays for the rest.
pub struct ResolvedTopology {
    partitions: BTreeMap<PartitionId, Vec<ReplicaRecord>>,
    local: Host,
    query_key: String,
}

impl ResolvedTopology {
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Partition IDs in traversal order.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.partitions.keys().rev().copied().collect()
    }

    pub fn get(&self, partition: PartitionId) -> Option<OrderedPartition> {
        self.partitions
            .get(&partition)
            .map(|records| self.order(partition, records))
    }

    pub fn iter(&self) -> impl Iterator<Item = OrderedPartition> + '_ {
        self.partitions
            .iter()
            .rev()
            .map(|(partition, records)| self.order(*partition, records))
    }

    fn order(
        &self,
        partition: PartitionId,
        records: &[ReplicaRecord],
    ) -> OrderedPartition {
        let mut replicas: Vec<Replica> = records
            .iter()
            .filter_map(|record| {
                let local = record.host == self.local;
                let eligible = record.state.is_readable()
                    || (local && !record.state.is_terminal());
                eligible.then(|| Replica {
                    coord: record.coord(),
                    state: record.state,
                    storage: record.storage,
                    local,
                })
            })
            .collect();

        if self.query_key.is_empty() {
            replicas.shuffle(&mut rand::thread_rng());
        } else {
            replicas.sort_by_cached_key(|replica| {
                stickiness(&self.query_key, &replica.coord.host)
            });
        }
        // stable, so the remote order above survives
        replicas.sort_by_key(|replica| !replica.local);

        OrderedPartition {
            partition,
            replicas,
        }
    }
}

/// Ranks hosts for a query key so repeated queries keep landing on the same
/// replica while different keys spread across the replica set.
fn stickiness(query_key: &str, host: &Host) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(query_key.as_bytes());
    hasher.update(&[0]);
    hasher.update(host.name.as_bytes());
    hasher.update(&host.port.to_le_bytes());
    let digest = hasher.finalize();
    LittleEndian::read_u64(array_ref![digest.as_bytes(), 0, 8])
}

/// Resolves a tenant's topology into the partition order reads must follow.
pub struct TopologyResolver {
    registry: Arc<dyn TopologyRegistry>,
    local: Host,
}

impl TopologyResolver {
    pub fn new(registry: Arc<dyn TopologyRegistry>, local: Host) -> Self {
        Self { registry, local }
    }

    pub fn local_host(&self) -> &Host {
        &self.local
    }

    /// Queries the registry and returns the tenant's partitions newest first.
    /// `query_key` only steers which replica is tried first. A tenant without
    /// partitions resolves to an empty topology, not an error.
    pub async fn ordered_partitions(
        &self,
        tenant: &TenantId,
        query_key: &str,
    ) -> Result<ResolvedTopology, TopologyError> {
        let records = self.registry.replicas(tenant).await?;
        let mut partitions: BTreeMap<PartitionId, Vec<ReplicaRecord>> =
            BTreeMap::new();
        for record in records {
            if record.tenant != *tenant {
                continue;
            }
            let replicas = partitions.entry(record.partition).or_default();
            if !replicas.iter().any(|r| r.host == record.host) {
                replicas.push(record);
            }
        }
        // fully removed partitions are gone for good
        partitions.retain(|_, replicas| {
            replicas.iter().any(|r| !r.state.is_terminal())
        });
        debug!(%tenant, partitions = partitions.len(), "resolved topology");
        Ok(ResolvedTopology {
            partitions,
            local: self.local.clone(),
            query_key: query_key.to_owned(),
        })
    }
}
