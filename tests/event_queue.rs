//! Event queue behavior through the runtime and a running server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use admin_runtime::adapters::AdapterFactory;
use admin_runtime::audit::{MemoryAuditStore, LOGIN_LOG};
use admin_runtime::config::AdapterConfig;
use admin_runtime::http::system::HEALTH_PATH;
use admin_runtime::queue::{HandlerError, Message, QueueError};
use admin_runtime::runtime::{RuntimeError, DEFAULT_QUEUE};
use admin_runtime::{Orchestrator, Runtime, Shutdown};
use axum::http::{Method, StatusCode};
use serde_json::json;

mod common;

type Received = Arc<Mutex<Vec<Arc<Message>>>>;

fn collect(received: &Received) -> impl Fn(Arc<Message>) -> std::future::Ready<Result<(), HandlerError>> {
    let received = received.clone();
    move |message| {
        received.lock().unwrap().push(message);
        std::future::ready(Ok(()))
    }
}

#[tokio::test]
async fn test_login_log_is_delivered_once() {
    let mut config = common::test_config();
    config.queue = AdapterConfig::new("memory");
    let factory = Arc::new(AdapterFactory::with_builtins());
    let runtime = Runtime::new(config.clone(), factory.clone());
    runtime
        .set_queue_adapter(factory.setup_queue(DEFAULT_QUEUE, &config.queue).await.unwrap())
        .unwrap();

    let received = Received::default();
    let queue = runtime.queue(DEFAULT_QUEUE).await.unwrap();
    queue.register(LOGIN_LOG, collect(&received)).unwrap();

    let shutdown = Shutdown::new();
    let loop_queue = queue.clone();
    let rx = shutdown.subscribe();
    let task = tokio::spawn(async move { loop_queue.run(rx).await });

    let message = runtime
        .stream_message(DEFAULT_QUEUE, LOGIN_LOG, json!({"user": "alice"}))
        .unwrap();
    queue.append(message).await.unwrap();

    assert!(common::eventually(Duration::from_secs(2), || async { !received.lock().unwrap().is_empty() }).await);
    shutdown.trigger();
    task.await.unwrap().unwrap();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].topic(), LOGIN_LOG);
    assert_eq!(received[0].payload(), &json!({"user": "alice"}));
}

#[tokio::test]
async fn test_messages_dispatch_in_append_order() {
    let runtime = Runtime::new(common::test_config(), Arc::new(AdapterFactory::with_builtins()));
    let queue = runtime.queue("jobs").await.unwrap();
    let received = Received::default();
    queue.register("tick", collect(&received)).unwrap();

    for i in 0..50 {
        runtime.publish("jobs", "tick", json!({ "seq": i })).await.unwrap();
    }

    let shutdown = Shutdown::new();
    let loop_queue = queue.clone();
    let rx = shutdown.subscribe();
    let task = tokio::spawn(async move { loop_queue.run(rx).await });
    assert!(common::eventually(Duration::from_secs(2), || async { received.lock().unwrap().len() == 50 }).await);
    shutdown.trigger();
    task.await.unwrap().unwrap();

    let seqs: Vec<u64> = received
        .lock()
        .unwrap()
        .iter()
        .map(|m| m.payload()["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_full_queue_reports_saturation() {
    let mut config = common::test_config();
    config.queue = AdapterConfig::new("memory")
        .with_option("buffer", 2)
        .with_option("append_timeout_ms", 20);
    let runtime = Runtime::new(config, Arc::new(AdapterFactory::with_builtins()));

    runtime.publish("jobs", "tick", json!(1)).await.unwrap();
    runtime.publish("jobs", "tick", json!(2)).await.unwrap();
    let err = runtime.publish("jobs", "tick", json!(3)).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Queue(QueueError::Saturated { ref queue, capacity: 2 }) if queue == "jobs"
    ));
}

#[tokio::test]
async fn test_queue_created_while_serving_is_dispatched() {
    let running = common::start(Orchestrator::new(common::test_config())).await;
    let runtime = running.runtime().clone();

    let received = Received::default();
    let handler = collect(&received);
    let reports = runtime
        .queue_with("reports", |queue| queue.register("generate", handler))
        .await
        .unwrap();
    assert!(common::eventually(Duration::from_secs(2), || async { reports.is_running() }).await);

    for i in 0..3 {
        runtime.publish("reports", "generate", json!({ "seq": i })).await.unwrap();
    }
    assert!(common::eventually(Duration::from_secs(2), || async { received.lock().unwrap().len() == 3 }).await);

    // Its handler table is frozen like any other running queue.
    assert!(matches!(
        runtime.queue_with("reports", |queue| queue.register("late", collect(&received))).await,
        Err(RuntimeError::Queue(QueueError::RegisterAfterRun { .. }))
    ));

    running.shutdown().await.unwrap();
    assert!(!reports.is_running());
}

#[tokio::test]
async fn test_operation_log_and_api_check_reach_the_store() {
    async fn create_role() -> StatusCode {
        StatusCode::CREATED
    }

    let store = Arc::new(MemoryAuditStore::new());
    let running = common::start(
        Orchestrator::new(common::test_config())
            .with_audit_store(store.clone())
            .with_api_check(true)
            .with_router(|engine| {
                engine.route(Method::POST, "/api/v1/role", create_role);
            }),
    )
    .await;

    let client = reqwest::Client::new();
    let health = client.get(common::url(&running, HEALTH_PATH)).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let created = client
        .post(common::url(&running, "/api/v1/role"))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);

    assert!(common::eventually(Duration::from_secs(2), || async { store.operate_logs().len() == 1 }).await);
    let logs = store.operate_logs();
    let log = &logs[0];
    assert_eq!(log.method, "POST");
    assert_eq!(log.path, "/api/v1/role");
    assert_eq!(log.ip, "127.0.0.1");

    assert!(common::eventually(Duration::from_secs(2), || async { store.sys_apis().len() == 3 }).await);
    let paths: Vec<_> = store.sys_apis().into_iter().map(|r| r.path).collect();
    assert!(paths.contains(&"/health".to_string()));
    assert!(paths.contains(&"/api/v1/role".to_string()));

    drop(client);
    running.shutdown().await.unwrap();
}
