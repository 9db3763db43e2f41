use std::sync::Arc;

use hashbrown::HashMap;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::{Config, DirectorConfig};
use crate::engine::{Activity, MemoryEngine};
use crate::metrics::NoopMetrics;
use crate::net::loopback::LoopbackTransport;
use crate::partition::{topology::MemoryRegistry, BackingStorage, Host};
use crate::plugins::{Count, CountEvaluator, CountMerger, CountRequest};

struct Fixture {
    registry: Arc<MemoryRegistry>,
    director: PartitionDirector<MemoryEngine>,
    tenant: TenantId,
    local: Host,
}

fn fixture() -> Fixture {
    let local = Host::new("local", 461);
    let config = Config {
        director: DirectorConfig::builder().local_host(local.clone()).build(),
        ..Default::default()
    };
    let registry = Arc::new(MemoryRegistry::new());
    let tenant = TenantId::from("acme");
    registry.assign(&tenant, &local);
    let director = PartitionDirector::new(
        &config,
        registry.clone(),
        Arc::new(LoopbackTransport::new()),
        Arc::new(MemoryEngine::new()),
        Arc::new(PartitionStates::new()),
        Arc::new(NoopMetrics),
    );
    Fixture {
        registry,
        director,
        tenant,
        local,
    }
}

fn batch(partition: u64, ids: &[u64]) -> WriteBatch<Activity> {
    WriteBatch::new(
        PartitionId(partition),
        ids.iter()
            .map(|id| Activity::new(*id, "stream", "click", *id as i64))
            .collect(),
    )
}

fn writes(tenant: &TenantId, batches: Vec<WriteBatch<Activity>>) -> HashMap<TenantId, Vec<WriteBatch<Activity>>> {
    let mut writes = HashMap::new();
    writes.insert(tenant.clone(), batches);
    writes
}

#[tokio::test]
async fn first_write_creates_and_announces_the_partition() {
    let f = fixture();
    let indexed = f
        .director
        .index(writes(&f.tenant, vec![batch(0, &[1, 2, 3])]))
        .await
        .unwrap();
    assert_eq!(indexed, 3);
    assert_eq!(
        f.director.states().state(&f.tenant, PartitionId(0)),
        Some(PartitionState::Bootstrap)
    );
    let records = f.registry.replicas(&f.tenant).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].host, f.local);
    assert_eq!(records[0].state, PartitionState::Bootstrap);
}

#[tokio::test]
async fn writes_for_unassigned_tenants_are_ignored() {
    let f = fixture();
    let other = TenantId::from("globex");
    let indexed = f
        .director
        .index(writes(&other, vec![batch(0, &[1])]))
        .await
        .unwrap();
    assert_eq!(indexed, 0);
    assert!(!f.director.states().hosts_tenant(&other));
}

#[tokio::test]
async fn misrouted_writes_are_reported_after_the_rest_lands() {
    let f = fixture();
    f.director
        .create_replica(&f.tenant, PartitionId(5), BackingStorage::Memory)
        .await
        .unwrap();
    f.director
        .remove_topology(&f.tenant, PartitionId(5), &f.local)
        .await
        .unwrap();
    let err = f
        .director
        .index(writes(&f.tenant, vec![batch(5, &[1]), batch(6, &[2, 3])]))
        .await
        .unwrap_err();
    match err {
        DirectorError::WriteQuorumFailure { misrouted } => {
            assert_eq!(misrouted, vec![(f.tenant.clone(), PartitionId(5))]);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(f.director.engine().handle(&f.tenant, PartitionId(5)).is_none());
    assert_eq!(f.director.engine().handle(&f.tenant, PartitionId(6)).unwrap().len(), 2);
}

#[tokio::test]
async fn every_assigned_host_creates_its_own_replica() {
    let f = fixture();
    let peer_host = Host::new("peer", 461);
    f.registry.assign(&f.tenant, &peer_host);
    let peer = PartitionDirector::new(
        &Config {
            director: DirectorConfig::builder().local_host(peer_host.clone()).build(),
            ..Default::default()
        },
        f.registry.clone(),
        Arc::new(LoopbackTransport::new()),
        Arc::new(MemoryEngine::new()),
        Arc::new(PartitionStates::new()),
        Arc::new(NoopMetrics),
    );

    assert_eq!(peer.index(writes(&f.tenant, vec![batch(7, &[1, 2])])).await.unwrap(), 2);
    assert_eq!(
        f.director.index(writes(&f.tenant, vec![batch(7, &[1, 2])])).await.unwrap(),
        2
    );

    for director in [&peer, &f.director] {
        assert_eq!(
            director.states().state(&f.tenant, PartitionId(7)),
            Some(PartitionState::Bootstrap)
        );
        assert_eq!(director.engine().handle(&f.tenant, PartitionId(7)).unwrap().len(), 2);
    }
    let mut hosts: Vec<Host> = f
        .registry
        .replicas(&f.tenant)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.partition == PartitionId(7))
        .map(|r| r.host)
        .collect();
    hosts.sort_by_key(|h| h.to_string());
    assert_eq!(hosts, vec![f.local.clone(), peer_host]);
}

#[tokio::test]
async fn partitions_created_before_an_engine_error_are_announced() {
    let f = fixture();
    let bad = WriteBatch::new(PartitionId(4), vec![Activity::new(9, "", "click", 1)]);
    let err = f
        .director
        .index(writes(&f.tenant, vec![batch(3, &[1]), bad]))
        .await
        .unwrap_err();
    assert!(matches!(err, DirectorError::Engine(_)));

    let mut partitions: Vec<PartitionId> = f
        .registry
        .replicas(&f.tenant)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.partition)
        .collect();
    partitions.sort();
    assert_eq!(partitions, vec![PartitionId(3), PartitionId(4)]);
    assert_eq!(f.director.engine().handle(&f.tenant, PartitionId(3)).unwrap().len(), 1);
}

#[tokio::test]
async fn lifecycle_signals_reach_the_registry() {
    let f = fixture();
    f.director
        .create_replica(&f.tenant, PartitionId(1), BackingStorage::Memory)
        .await
        .unwrap();
    f.director.backfill_complete(&f.tenant, PartitionId(1)).await.unwrap();
    f.director.caught_up(&f.tenant, PartitionId(1)).await.unwrap();
    let previous = f
        .director
        .set_storage(&f.tenant, PartitionId(1), BackingStorage::Disk)
        .await
        .unwrap();
    assert_eq!(previous, BackingStorage::Memory);

    assert!(f.director.check_info(
        &f.tenant,
        PartitionId(1),
        PartitionState::Online,
        BackingStorage::Unknown
    ));
    assert!(f.director.check_info(
        &f.tenant,
        PartitionId(1),
        PartitionState::Online,
        BackingStorage::Disk
    ));
    assert!(!f.director.check_info(
        &f.tenant,
        PartitionId(1),
        PartitionState::Online,
        BackingStorage::Memory
    ));
    assert!(!f.director.check_info(
        &f.tenant,
        PartitionId(9),
        PartitionState::Online,
        BackingStorage::Unknown
    ));

    let records = f.registry.replicas(&f.tenant).await.unwrap();
    assert_eq!(records[0].state, PartitionState::Online);
    assert_eq!(records[0].storage, BackingStorage::Disk);
}

#[tokio::test]
async fn skipping_a_lifecycle_step_is_rejected() {
    let f = fixture();
    f.director
        .create_replica(&f.tenant, PartitionId(1), BackingStorage::Memory)
        .await
        .unwrap();
    assert!(matches!(
        f.director.caught_up(&f.tenant, PartitionId(1)).await,
        Err(DirectorError::State(StateError::IllegalTransition { .. }))
    ));
}

#[tokio::test]
async fn removing_the_local_replica_drops_its_data() {
    let f = fixture();
    f.director
        .index(writes(&f.tenant, vec![batch(2, &[1])]))
        .await
        .unwrap();
    let removed = f
        .director
        .remove_topology(&f.tenant, PartitionId(2), &f.local)
        .await
        .unwrap();
    assert!(removed);
    assert_eq!(
        f.director.states().state(&f.tenant, PartitionId(2)),
        Some(PartitionState::Removed)
    );
    assert!(f.director.engine().handle(&f.tenant, PartitionId(2)).is_none());
    assert!(f.registry.replicas(&f.tenant).await.unwrap().is_empty());

    // removed is terminal, writes to it are misrouted
    assert!(matches!(
        f.director.index(writes(&f.tenant, vec![batch(2, &[5])])).await,
        Err(DirectorError::WriteQuorumFailure { .. })
    ));
}

#[tokio::test]
async fn rebuild_queue_honours_priority() {
    let f = fixture();
    f.director
        .index(writes(&f.tenant, vec![batch(0, &[1]), batch(1, &[2]), batch(2, &[3])]))
        .await
        .unwrap();
    assert!(f.director.prioritize_rebuild(&f.tenant, PartitionId(2)));
    assert!(!f.director.prioritize_rebuild(&f.tenant, PartitionId(7)));
    assert_eq!(f.director.next_rebuild(), Some((f.tenant.clone(), PartitionId(2))));
}

#[tokio::test]
async fn heartbeat_failures_are_swallowed() {
    let f = fixture();
    f.director
        .index(writes(&f.tenant, vec![batch(0, &[1])]))
        .await
        .unwrap();
    f.registry.set_reachable(false);
    f.director.heartbeat().await;
    assert!(f.registry.last_heartbeat(&f.local).is_some());

    f.registry.set_reachable(true);
    f.director.remove_host(&f.local).await.unwrap();
    assert!(f.registry.last_heartbeat(&f.local).is_none());
    f.director.heartbeat().await;
    assert!(f.registry.last_heartbeat(&f.local).is_some());
    assert_eq!(f.registry.replicas(&f.tenant).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_task_survives_a_zero_interval() {
    let local = Host::new("local", 461);
    let config = Config {
        director: DirectorConfig::builder()
            .local_host(local.clone())
            .heartbeat_interval_ms(0)
            .build(),
        ..Default::default()
    };
    let registry = Arc::new(MemoryRegistry::new());
    let director = Arc::new(PartitionDirector::new(
        &config,
        registry.clone(),
        Arc::new(LoopbackTransport::new()),
        Arc::new(MemoryEngine::new()),
        Arc::new(PartitionStates::new()),
        Arc::new(NoopMetrics),
    ));
    let cancel = CancellationToken::new();
    let task = director.spawn_heartbeat(cancel.clone());
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert!(registry.last_heartbeat(&local).is_some());
    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn warm_touches_local_partitions() {
    let f = fixture();
    f.director
        .index(writes(&f.tenant, vec![batch(0, &[1]), batch(1, &[2])]))
        .await
        .unwrap();
    assert_eq!(f.director.warm(&f.tenant), 2);
    assert_eq!(f.director.warm(&TenantId::from("globex")), 0);
}

#[tokio::test]
async fn unreachable_registry_fails_the_request() {
    let f = fixture();
    f.registry.set_reachable(false);
    let request = QueryRequest::builder()
        .tenant("acme")
        .payload(CountRequest::default())
        .build();
    let err = f
        .director
        .ask_and_merge(
            &Arc::new(Count),
            request,
            &CountEvaluator::default(),
            &CountMerger,
            0,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DirectorError::Topology(_)));
}

#[tokio::test]
async fn asking_a_missing_partition_is_an_error() {
    let f = fixture();
    let request = QueryRequest::builder()
        .tenant("acme")
        .payload(CountRequest::default())
        .build();
    let err = f
        .director
        .ask_and_merge_partition(
            &Arc::new(Count),
            request,
            PartitionId(3),
            &CountEvaluator::default(),
            &CountMerger,
            0,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DirectorError::UnknownPartition { .. }));
}

#[tokio::test]
async fn tenant_without_partitions_is_an_empty_exhausted_answer() {
    let f = fixture();
    let request = QueryRequest::builder()
        .tenant("acme")
        .payload(CountRequest::default())
        .build();
    let response = f
        .director
        .ask_and_merge(
            &Arc::new(Count),
            request,
            &CountEvaluator::default(),
            &CountMerger,
            0,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.answer, 0);
    assert!(response.results_exhausted);
    assert_eq!(response.stats.partitions_queried, 0);
}
