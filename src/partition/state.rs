use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use super::{BackingStorage, PartitionId, PartitionState, TenantId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("partition {tenant}/{partition} is not hosted here")]
    UnknownPartition {
        tenant: TenantId,
        partition: PartitionId,
    },
    #[error("partition {tenant}/{partition} cannot move from {from} to {to}")]
    IllegalTransition {
        tenant: TenantId,
        partition: PartitionId,
        from: PartitionState,
        to: PartitionState,
    },
    #[error("partition {tenant}/{partition} cannot be moved to an unknown storage tier")]
    UnknownStorage {
        tenant: TenantId,
        partition: PartitionId,
    },
}

/// Lifecycle record of one locally hosted partition replica.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionInfo {
    pub state: PartitionState,
    pub storage: BackingStorage,
    pub created_at: DateTime<Utc>,
    /// Refreshed by `warm`; read by the index engine's eviction policy.
    pub last_accessed: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    tenants: HashMap<TenantId, BTreeMap<PartitionId, PartitionInfo>>,
    rebuild_queue: VecDeque<(TenantId, PartitionId)>,
}

impl Inner {
    fn get_mut(
        &mut self,
        tenant: &TenantId,
        partition: PartitionId,
    ) -> Result<&mut PartitionInfo, StateError> {
        self.tenants
            .get_mut(tenant)
            .and_then(|partitions| partitions.get_mut(&partition))
            .ok_or_else(|| StateError::UnknownPartition {
                tenant: tenant.clone(),
                partition,
            })
    }

    fn dequeue_rebuild(&mut self, tenant: &TenantId, partition: PartitionId) {
        self.rebuild_queue
            .retain(|(t, p)| !(t == tenant && *p == partition));
    }
}

/// The state machine for every partition replica hosted on this process.
///
/// ```text
/// bootstrap --(backfill complete)--> rebuilding --(caught up)--> online
/// online <--> offline
/// {bootstrap, rebuilding, online, offline} --(remove)--> removed
/// ```
///
/// Storage tier changes never touch the lifecycle state and nothing leaves
/// `removed`.
#[derive(Default)]
pub struct PartitionStates {
    inner: RwLock<Inner>,
}

impl PartitionStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new partition in `bootstrap` and queues it for rebuild.
    /// Returns false if the partition is already known, removed or not.
    pub fn create(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
        storage: BackingStorage,
    ) -> bool {
        let mut inner = self.inner.write();
        let partitions = inner.tenants.entry(tenant.clone()).or_default();
        if partitions.contains_key(&partition) {
            return false;
        }
        let now = Utc::now();
        partitions.insert(
            partition,
            PartitionInfo {
                state: PartitionState::Bootstrap,
                storage,
                created_at: now,
                last_accessed: now,
            },
        );
        inner.rebuild_queue.push_back((tenant.clone(), partition));
        debug!(%tenant, %partition, "created partition");
        true
    }

    pub fn info(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
    ) -> Option<PartitionInfo> {
        self.inner
            .read()
            .tenants
            .get(tenant)
            .and_then(|partitions| partitions.get(&partition))
            .cloned()
    }

    pub fn state(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
    ) -> Option<PartitionState> {
        self.info(tenant, partition).map(|info| info.state)
    }

    /// Moves a partition to `to`, returning the state it left. Moving to the
    /// current state is a no-op.
    pub fn transition(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
        to: PartitionState,
    ) -> Result<PartitionState, StateError> {
        let mut inner = self.inner.write();
        let info = inner.get_mut(tenant, partition)?;
        let from = info.state;
        if from == to {
            return Ok(from);
        }
        if !is_legal(from, to) {
            return Err(StateError::IllegalTransition {
                tenant: tenant.clone(),
                partition,
                from,
                to,
            });
        }
        info.state = to;
        if !matches!(to, PartitionState::Bootstrap | PartitionState::Rebuilding) {
            inner.dequeue_rebuild(tenant, partition);
        }
        debug!(%tenant, %partition, %from, %to, "partition transitioned");
        Ok(from)
    }

    /// Signal from the index engine that the initial backfill landed.
    pub fn backfill_complete(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
    ) -> Result<PartitionState, StateError> {
        self.transition(tenant, partition, PartitionState::Rebuilding)
    }

    /// Signal from the index engine that the partition is warm and has
    /// replayed everything up to the head of the log.
    pub fn caught_up(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
    ) -> Result<PartitionState, StateError> {
        self.transition(tenant, partition, PartitionState::Online)
    }

    pub fn remove(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
    ) -> Result<PartitionState, StateError> {
        self.transition(tenant, partition, PartitionState::Removed)
    }

    /// Pure comparison used by reconciliation loops. True only when the
    /// actual state equals `state` and the storage tier matches `storage`,
    /// where an `Unknown` desired tier matches anything. Unknown partitions
    /// never match.
    pub fn check_info(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
        state: PartitionState,
        storage: BackingStorage,
    ) -> bool {
        match self.info(tenant, partition) {
            Some(info) => {
                info.state == state
                    && (storage == BackingStorage::Unknown
                        || info.storage == storage)
            }
            None => false,
        }
    }

    /// Changes the storage tier, returning the previous one. The lifecycle
    /// state is left alone.
    pub fn set_storage(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
        storage: BackingStorage,
    ) -> Result<BackingStorage, StateError> {
        if storage == BackingStorage::Unknown {
            return Err(StateError::UnknownStorage {
                tenant: tenant.clone(),
                partition,
            });
        }
        let mut inner = self.inner.write();
        let info = inner.get_mut(tenant, partition)?;
        if info.state.is_terminal() {
            return Err(StateError::IllegalTransition {
                tenant: tenant.clone(),
                partition,
                from: info.state,
                to: info.state,
            });
        }
        let previous = info.storage;
        info.storage = storage;
        debug!(%tenant, %partition, from = %previous, to = %storage, "storage changed");
        Ok(previous)
    }

    /// Refreshes the last-accessed time of every live partition of a tenant.
    /// Returns how many partitions were touched.
    pub fn warm(&self, tenant: &TenantId) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let Some(partitions) = inner.tenants.get_mut(tenant) else {
            return 0;
        };
        let mut touched = 0;
        for info in partitions.values_mut() {
            if !info.state.is_terminal() {
                info.last_accessed = now;
                touched += 1;
            }
        }
        touched
    }

    /// Moves a partition that still needs rebuilding to the head of the
    /// rebuild queue.
    pub fn prioritize_rebuild(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
    ) -> bool {
        let mut inner = self.inner.write();
        let rebuilding = inner
            .tenants
            .get(tenant)
            .and_then(|partitions| partitions.get(&partition))
            .map(|info| {
                matches!(
                    info.state,
                    PartitionState::Bootstrap | PartitionState::Rebuilding
                )
            })
            .unwrap_or(false);
        if !rebuilding {
            return false;
        }
        inner.dequeue_rebuild(tenant, partition);
        inner.rebuild_queue.push_front((tenant.clone(), partition));
        true
    }

    /// Pops the next partition the index engine should rebuild.
    pub fn next_rebuild(&self) -> Option<(TenantId, PartitionId)> {
        self.inner.write().rebuild_queue.pop_front()
    }

    /// Partitions of a tenant, newest first.
    pub fn partitions(
        &self,
        tenant: &TenantId,
    ) -> Vec<(PartitionId, PartitionInfo)> {
        self.inner
            .read()
            .tenants
            .get(tenant)
            .map(|partitions| {
                partitions
                    .iter()
                    .rev()
                    .map(|(id, info)| (*id, info.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn hosts_tenant(&self, tenant: &TenantId) -> bool {
        self.inner.read().tenants.contains_key(tenant)
    }

    /// Every hosted partition, for heartbeats.
    pub fn snapshot(&self) -> Vec<(TenantId, PartitionId, PartitionInfo)> {
        let inner = self.inner.read();
        let mut all = Vec::new();
        for (tenant, partitions) in inner.tenants.iter() {
            for (partition, info) in partitions {
                all.push((tenant.clone(), *partition, info.clone()));
            }
        }
        all
    }
}

fn is_legal(from: PartitionState, to: PartitionState) -> bool {
    use PartitionState::*;
    match (from, to) {
        (Removed, _) => false,
        (_, Removed) => true,
        (Online, Offline) | (Offline, Online) => true,
        (Bootstrap, Rebuilding) | (Rebuilding, Online) => true,
        _ => false,
    }
}
