// Write fan-out, lifecycle signals and the administrative verbs. Writes only
// ever touch this host's replicas; replicating them elsewhere is the activity
// log's job.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DirectorError, PartitionDirector};
use crate::partition::{
    state::StateError, topology::ReplicaRecord, BackingStorage, Host, PartitionCoord,
    PartitionId, PartitionState, TenantId,
};
use crate::plugin::IndexEngine;

/// Activities bound for one partition.
#[derive(Clone, Debug)]
pub struct WriteBatch<A> {
    pub partition: PartitionId,
    pub activities: Vec<A>,
}

impl<A> WriteBatch<A> {
    pub fn new(partition: PartitionId, activities: Vec<A>) -> Self {
        Self {
            partition,
            activities,
        }
    }
}

impl<E: IndexEngine> PartitionDirector<E> {
    /// Indexes each tenant's batches into the local replicas.
    ///
    /// Tenants this host is not assigned to are ignored. A partition unknown
    /// here is created in `bootstrap`, whatever other hosts carry. Batches for
    /// partitions removed here, or otherwise not writable, are not indexed and
    /// come back as a `WriteQuorumFailure` once the rest is done. Partitions
    /// created along the way are announced even if a later batch fails.
    /// Returns how many activities were indexed.
    pub async fn index(
        &self,
        batches: HashMap<TenantId, Vec<WriteBatch<E::Activity>>>,
    ) -> Result<usize, DirectorError> {
        let local = self.local_host().clone();
        let mut indexed = 0;
        let mut misrouted = Vec::new();

        for (tenant, batches) in batches {
            let assignment = self.registry.assignment(&tenant).await?;
            if !assignment.contains(&local) {
                debug!(%tenant, "tenant not assigned here, ignoring writes");
                continue;
            }
            let mut created = Vec::new();
            let landed = self.index_tenant(&tenant, batches, &mut created, &mut misrouted);

            if !created.is_empty() {
                let records = created
                    .iter()
                    .filter_map(|partition| self.record(&tenant, *partition))
                    .collect();
                self.registry.publish(&local, records).await?;
            }
            indexed += landed?;
        }

        if misrouted.is_empty() {
            Ok(indexed)
        } else {
            warn!(?misrouted, "writes for partitions not writable here");
            Err(DirectorError::WriteQuorumFailure { misrouted })
        }
    }

    fn index_tenant(
        &self,
        tenant: &TenantId,
        batches: Vec<WriteBatch<E::Activity>>,
        created: &mut Vec<PartitionId>,
        misrouted: &mut Vec<(TenantId, PartitionId)>,
    ) -> Result<usize, DirectorError> {
        let mut indexed = 0;
        for batch in batches {
            let partition = batch.partition;
            match self.states.state(tenant, partition) {
                Some(state) if state.is_writable() => {}
                None => {
                    self.states.create(tenant, partition, BackingStorage::Memory);
                    info!(%tenant, %partition, "created partition on first write");
                    created.push(partition);
                }
                Some(_) => {
                    misrouted.push((tenant.clone(), partition));
                    continue;
                }
            }
            indexed += self.engine.index(tenant, partition, batch.activities)?;
        }
        Ok(indexed)
    }

    /// Adds a replica of a partition on this host, in `bootstrap`, and
    /// announces it.
    pub async fn create_replica(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
        storage: BackingStorage,
    ) -> Result<bool, DirectorError> {
        let created = self.states.create(tenant, partition, storage);
        if created {
            self.publish(tenant, partition).await?;
        }
        Ok(created)
    }

    /// Refreshes the last-access time of the tenant's local partitions.
    pub fn warm(&self, tenant: &TenantId) -> usize {
        self.states.warm(tenant)
    }

    pub async fn set_storage(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
        storage: BackingStorage,
    ) -> Result<BackingStorage, DirectorError> {
        let previous = self.states.set_storage(tenant, partition, storage)?;
        self.publish(tenant, partition).await?;
        Ok(previous)
    }

    pub fn check_info(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
        state: PartitionState,
        storage: BackingStorage,
    ) -> bool {
        self.states.check_info(tenant, partition, state, storage)
    }

    pub async fn remove_host(&self, host: &Host) -> Result<bool, DirectorError> {
        let removed = self.registry.remove_host(host).await?;
        info!(%host, removed, "removed host");
        Ok(removed)
    }

    /// Forgets one replica. When it is this host's, the partition is also
    /// removed locally and its data dropped.
    pub async fn remove_topology(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
        host: &Host,
    ) -> Result<bool, DirectorError> {
        let coord = PartitionCoord::new(tenant.clone(), partition, host.clone());
        let mut removed = self.registry.remove_topology(&coord).await?;
        if host == self.local_host() {
            match self.states.remove(tenant, partition) {
                Ok(_) => removed = true,
                Err(StateError::UnknownPartition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            removed |= self.engine.drop_partition(tenant, partition);
        }
        info!(%coord, removed, "removed replica");
        Ok(removed)
    }

    pub fn prioritize_rebuild(&self, tenant: &TenantId, partition: PartitionId) -> bool {
        self.states.prioritize_rebuild(tenant, partition)
    }

    pub fn next_rebuild(&self) -> Option<(TenantId, PartitionId)> {
        self.states.next_rebuild()
    }

    /// `bootstrap` -> `rebuilding`, announced to the registry.
    pub async fn backfill_complete(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
    ) -> Result<PartitionState, DirectorError> {
        let previous = self.states.backfill_complete(tenant, partition)?;
        self.publish(tenant, partition).await?;
        Ok(previous)
    }

    /// `rebuilding` -> `online`, announced to the registry.
    pub async fn caught_up(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
    ) -> Result<PartitionState, DirectorError> {
        let previous = self.states.caught_up(tenant, partition)?;
        self.publish(tenant, partition).await?;
        Ok(previous)
    }

    /// Publishes every local replica. Never fails: a missed heartbeat is
    /// logged and the next one tries again.
    pub async fn heartbeat(&self) {
        let records: Vec<ReplicaRecord> = self
            .states
            .snapshot()
            .into_iter()
            .map(|(tenant, partition, info)| ReplicaRecord {
                tenant,
                partition,
                host: self.local_host().clone(),
                state: info.state,
                storage: info.storage,
            })
            .collect();
        let count = records.len();
        match self.registry.publish(self.local_host(), records).await {
            Ok(()) => debug!(replicas = count, "heartbeat"),
            Err(e) => warn!(error = %e, "heartbeat failed"),
        }
    }

    /// Heartbeats on the configured interval until `cancel` fires.
    pub fn spawn_heartbeat(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let director = self;
        tokio::spawn(async move {
            // interval() panics on zero
            let period = director.heartbeat_interval().max(Duration::from_millis(1));
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => director.heartbeat().await,
                }
            }
        })
    }

    fn record(&self, tenant: &TenantId, partition: PartitionId) -> Option<ReplicaRecord> {
        self.states.info(tenant, partition).map(|info| ReplicaRecord {
            tenant: tenant.clone(),
            partition,
            host: self.local_host().clone(),
            state: info.state,
            storage: info.storage,
        })
    }

    async fn publish(&self, tenant: &TenantId, partition: PartitionId) -> Result<(), DirectorError> {
        let records = self.record(tenant, partition).into_iter().collect();
        self.registry.publish(self.local_host(), records).await?;
        Ok(())
    }
}
