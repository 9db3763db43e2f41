use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hashbrown::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use fanout::config::{Config, DirectorConfig};
use fanout::director::{PartitionDirector, QueryRequest, WriteBatch};
use fanout::engine::{Activity, MemoryEngine};
use fanout::metrics::CounterMetrics;
use fanout::net::endpoint::{QuicServer, QuicTransport, TlsMaterial};
use fanout::net::service::HostService;
use fanout::partition::{
    state::PartitionStates, topology::MemoryRegistry, Host, PartitionId, TenantId,
};
use fanout::plugins::{
    Count, CountEvaluator, CountMerger, CountRequest, Distinct, DistinctEvaluator, DistinctMerger,
    DistinctRequest,
};
use fanout::solve::LogLevel;
use fanout::tracking::ReadTracker;

type Director = PartitionDirector<MemoryEngine>;

struct Node {
    director: Arc<Director>,
    engine: Arc<MemoryEngine>,
    server: QuicServer,
}

/// Binds a host on an ephemeral loopback port and builds its director.
fn node(
    config: &Config,
    tls: &TlsMaterial,
    registry: Arc<MemoryRegistry>,
    transport: Arc<QuicTransport>,
    metrics: Arc<CounterMetrics>,
    cancel: &CancellationToken,
) -> Result<Node, Box<dyn Error>> {
    let engine = Arc::new(MemoryEngine::new());
    let states = Arc::new(PartitionStates::new());
    let service = HostService::new(engine.clone(), states.clone(), &config.transport)
        .register(Arc::new(Count))
        .register(Arc::new(Distinct));
    let server = QuicServer::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        tls,
        Arc::new(service),
        &config.transport,
        cancel.child_token(),
    )?;
    let host = Host::new("127.0.0.1", server.local_addr()?.port());
    info!(%host, "host listening");

    let config = Config {
        director: DirectorConfig {
            local_host: host,
            ..config.director.clone()
        },
        ..config.clone()
    };
    let director = Arc::new(PartitionDirector::new(
        &config,
        registry,
        transport,
        engine.clone(),
        states,
        metrics,
    ));
    Ok(Node {
        director,
        engine,
        server,
    })
}

fn activities(first: u64, streams: &[&str]) -> Vec<Activity> {
    streams
        .iter()
        .enumerate()
        .map(|(i, stream)| {
            let id = first + i as u64;
            let verb = if id % 3 == 0 { "share" } else { "view" };
            Activity::new(id, *stream, verb, id as i64)
        })
        .collect()
}

async fn bring_online(
    director: &Director,
    tenant: &TenantId,
    partitions: &[u64],
) -> Result<(), Box<dyn Error>> {
    for partition in partitions {
        director.backfill_complete(tenant, PartitionId(*partition)).await?;
        director.caught_up(tenant, PartitionId(*partition)).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(Path::new(&path))?,
        None => Config::default(),
    };
    config.validate()?;

    let tenant = TenantId::from("acme");
    let cancel = CancellationToken::new();
    let tls = TlsMaterial::self_signed(vec![config.transport.server_name.clone()])?;
    let transport = Arc::new(QuicTransport::new(tls.roots()?, &config.transport)?);
    let registry = Arc::new(MemoryRegistry::new());
    let metrics = Arc::new(CounterMetrics::new());

    let a = node(&config, &tls, registry.clone(), transport.clone(), metrics.clone(), &cancel)?;
    let b = node(&config, &tls, registry.clone(), transport.clone(), metrics.clone(), &cancel)?;
    registry.assign(&tenant, a.director.local_host());
    registry.assign(&tenant, b.director.local_host());

    // a carries 0 and 1, b carries 1 and 2
    let mut writes = HashMap::new();
    writes.insert(
        tenant.clone(),
        vec![
            WriteBatch::new(PartitionId(0), activities(0, &["inbox", "news", "inbox"])),
            WriteBatch::new(PartitionId(1), activities(10, &["news", "alerts"])),
        ],
    );
    let indexed = a.director.index(writes).await?;
    info!(indexed, "indexed on {}", a.director.local_host());
    bring_online(&a.director, &tenant, &[0, 1]).await?;

    let mut writes = HashMap::new();
    writes.insert(
        tenant.clone(),
        vec![
            WriteBatch::new(PartitionId(1), activities(10, &["news", "alerts"])),
            WriteBatch::new(PartitionId(2), activities(20, &["billing", "inbox", "ops"])),
        ],
    );
    let indexed = b.director.index(writes).await?;
    info!(indexed, "indexed on {}", b.director.local_host());
    bring_online(&b.director, &tenant, &[1, 2]).await?;

    let heartbeats = [
        a.director.clone().spawn_heartbeat(cancel.child_token()),
        b.director.clone().spawn_heartbeat(cancel.child_token()),
    ];

    let request = QueryRequest::builder()
        .tenant(tenant.clone())
        .payload(CountRequest {
            verb: Some("view".into()),
            limit: None,
        })
        .query_key("demo")
        .log_level(LogLevel::Debug)
        .build();
    let count = a
        .director
        .ask_and_merge(
            &Arc::new(Count),
            request,
            &CountEvaluator::default(),
            &CountMerger,
            0,
            &cancel,
        )
        .await?;
    println!(
        "views: {} (exhausted: {}, {:?})",
        count.answer, count.results_exhausted, count.stats
    );
    for line in &count.log {
        println!("  {line}");
    }

    let limit = 4;
    let request = QueryRequest::builder()
        .tenant(tenant.clone())
        .payload(DistinctRequest { verb: None, limit })
        .build();
    let distinct = a
        .director
        .ask_and_merge(
            &Arc::new(Distinct),
            request,
            &DistinctEvaluator {
                limit: limit as usize,
            },
            &DistinctMerger {
                limit: limit as usize,
            },
            Vec::new(),
            &cancel,
        )
        .await?;
    println!(
        "latest streams: {:?} (exhausted: {})",
        distinct.answer, distinct.results_exhausted
    );

    let tracker = ReadTracker::new(a.engine.clone(), config.director.stripe_count);
    tracker.mark_read(&tenant, "inbox", &[0]);
    println!("unread in inbox: {:?}", tracker.unread(&tenant, "inbox"));
    tracker.mark_all_read(&tenant, "inbox", i64::MAX);
    println!("unread in inbox: {:?}", tracker.unread(&tenant, "inbox"));

    println!("{:?}", metrics.snapshot());

    cancel.cancel();
    for heartbeat in heartbeats {
        heartbeat.await?;
    }
    transport.close();
    a.server.shutdown().await;
    b.server.shutdown().await;
    Ok(())
}
