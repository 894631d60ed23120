//! Exporter Integration Tests
//!
//! Tests that the HTTP surface reflects the replicas of a running host:
//! - `/ready` follows replica readiness
//! - `/metrics` exposes the versioned ingestion stats and lifecycle metrics

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use replicore_core::{ChangeRecord, ControlMessage, ReplicaId, Role};
use replicore_ingestion::{
    current_timestamp_ms, Coordinator, IngestionConfig, MemoryLog, MemoryStorage, ReplicaState,
    StoreVersionConfig,
};
use replicore_observability::exporter::create_router;
use replicore_observability::{ReadinessCheck, REGISTRY};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // for `oneshot`

#[tokio::test]
async fn test_ready_and_metrics_follow_replicas() {
    replicore_observability::init();

    let log = MemoryLog::new();
    let replica = ReplicaId::new("exported_store", 1, 0);
    let vt = replica.version_topic();
    let now = current_timestamp_ms();
    log.append(&vt, ChangeRecord::control(0, now, ControlMessage::StartOfPush))
        .await;
    log.append(
        &vt,
        ChangeRecord::put(0, now, Bytes::from("k"), Bytes::from("{}")),
    )
    .await;

    let coordinator = Arc::new(
        Coordinator::builder()
            .config(IngestionConfig {
                poll_interval: Duration::from_millis(5),
                ..Default::default()
            })
            .source(Arc::new(log.clone()))
            .storage(Arc::new(MemoryStorage::new()))
            .build()
            .unwrap(),
    );
    REGISTRY
        .register(Box::new(coordinator.stats().collector().unwrap()))
        .unwrap();

    let ready: ReadinessCheck = {
        let coordinator = Arc::clone(&coordinator);
        Arc::new(move || coordinator.all_ready_now())
    };
    let app = create_router(ready);
    let request = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap();

    coordinator
        .start_partition(replica.clone(), StoreVersionConfig::default(), Role::Standby)
        .await
        .unwrap();

    // Still bootstrapping: no end of push yet
    let response = app.clone().oneshot(request("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    log.append(&vt, ChangeRecord::control(0, now, ControlMessage::EndOfPush))
        .await;
    let mut status = coordinator.subscribe_status(&replica).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(10),
        status.wait_for(|s| s.state == ReplicaState::Online),
    )
    .await
    .unwrap()
    .unwrap();

    let response = app.clone().oneshot(request("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(request("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("replicore_ingestion_stats"));
    assert!(text.contains(r#"store="exported_store""#));
    assert!(text.contains("replicore_replica_states"));
    assert!(text.contains("replicore_state_transitions_total"));

    coordinator.shutdown().await.unwrap();
}
