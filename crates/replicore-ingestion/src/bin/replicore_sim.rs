//! Replicore Simulation Binary
//!
//! Runs a single storage host against an in-memory log: every partition of a
//! hybrid store version bootstraps from a batch push, then its leader follows a
//! real-time topic that a background writer keeps appending partial updates to.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Log filter (default: info)
//! - `METRICS_ADDR`: Health, readiness and metrics address (default: 0.0.0.0:9090)
//! - `SIM_STORE`: Store name (default: "orders")
//! - `SIM_PARTITIONS`: Number of partitions (default: 2)
//! - `SIM_PUSH_RECORDS`: Batch records per partition (default: 1000)
//! - `REPLICORE_*`: Ingestion settings, see `IngestionConfig::from_env`
//!
//! # Example
//!
//! ```bash
//! export SIM_PARTITIONS=4
//! export REPLICORE_LOCAL_REGION=dc0
//! cargo run --bin replicore-sim
//! curl localhost:9090/ready
//! ```

use bytes::Bytes;
use replicore_core::{
    ChangeRecord, ControlMessage, FieldKind, ReplicaId, Role, ValueSchema, WriteComputeRecord,
};
use replicore_ingestion::{
    current_timestamp_ms, Coordinator, HybridConfig, IngestionConfig, MemoryLog, MemoryStorage,
    StoreVersionConfig,
};
use replicore_observability::{MetricsServer, ReadinessCheck, REGISTRY};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const STORE_VERSION: u32 = 1;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn value_schema() -> ValueSchema {
    ValueSchema::new()
        .with_field("name", FieldKind::Scalar, json!(""))
        .with_field("views", FieldKind::Scalar, json!(0))
        .with_field("tags", FieldKind::List, json!([]))
        .with_field("attributes", FieldKind::Map, json!({}))
}

/// Batch push: start of push, full values, end of push, start of buffer replay.
async fn seed_push(log: &MemoryLog, replica: &ReplicaId, records: u64) {
    let vt = replica.version_topic();
    let now = current_timestamp_ms();

    log.append(&vt, ChangeRecord::control(0, now, ControlMessage::StartOfPush))
        .await;
    for i in 0..records {
        let value = json!({
            "name": format!("item-{}", i),
            "views": 0,
            "tags": [],
            "attributes": {},
        });
        log.append(
            &vt,
            ChangeRecord::put(
                0,
                now,
                Bytes::from(format!("key-{}", i)),
                Bytes::from(value.to_string()),
            ),
        )
        .await;
    }
    log.append(&vt, ChangeRecord::control(0, now, ControlMessage::EndOfPush))
        .await;
    log.append(
        &vt,
        ChangeRecord::control(0, now, ControlMessage::StartOfBufferReplay),
    )
    .await;
}

/// Keep appending partial updates to every partition's real-time topic.
async fn write_real_time(log: MemoryLog, replicas: Vec<ReplicaId>, keys: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut sequence = 0u64;
    loop {
        ticker.tick().await;
        sequence += 1;
        for replica in &replicas {
            let key = Bytes::from(format!("key-{}", sequence % keys.max(1)));
            let update = WriteComputeRecord::new()
                .set("views", json!(sequence))
                .list_add("tags", vec![json!(format!("t{}", sequence % 5))]);
            log.append(
                &replica.real_time_topic(None),
                ChangeRecord::update(0, current_timestamp_ms(), key, update),
            )
            .await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Replicore simulation starting");

    let config = IngestionConfig::from_env()?;
    let metrics_addr = std::env::var("METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".to_string());
    let store = std::env::var("SIM_STORE").unwrap_or_else(|_| "orders".to_string());
    let partitions: u32 = env_or("SIM_PARTITIONS", 2);
    let push_records: u64 = env_or("SIM_PUSH_RECORDS", 1000);

    info!(
        store = %store,
        partitions,
        push_records,
        local_region = %config.local_region,
        "Configuration loaded"
    );

    replicore_observability::init();

    let log = MemoryLog::new();
    let replicas: Vec<ReplicaId> = (0..partitions)
        .map(|p| ReplicaId::new(store.clone(), STORE_VERSION, p))
        .collect();
    for replica in &replicas {
        seed_push(&log, replica, push_records).await;
    }

    let coordinator = Arc::new(
        Coordinator::builder()
            .config(config)
            .source(Arc::new(log.clone()))
            .storage(Arc::new(MemoryStorage::new()))
            .build()?,
    );
    REGISTRY.register(Box::new(coordinator.stats().collector()?))?;

    let version = StoreVersionConfig {
        hybrid: Some(HybridConfig {
            rewind_seconds: 3600,
            offset_lag_threshold: 100,
        }),
        value_schema: value_schema(),
        ..Default::default()
    };
    for replica in &replicas {
        coordinator
            .start_partition(replica.clone(), version.clone(), Role::Leader)
            .await?;
    }

    let ready: ReadinessCheck = {
        let coordinator = Arc::clone(&coordinator);
        Arc::new(move || coordinator.all_ready_now())
    };
    let server = MetricsServer::new(metrics_addr.parse()?, ready);
    tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let writer = tokio::spawn(write_real_time(log.clone(), replicas.clone(), push_records));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, stopping replicas");
    writer.abort();

    for replica in &replicas {
        if let Some(status) = coordinator.status(replica).await {
            let status = serde_json::to_string(&status)?;
            info!(replica = %replica, status = %status, "Final replica status");
        }
    }
    coordinator.shutdown().await?;

    info!("Replicore simulation stopped");
    Ok(())
}
