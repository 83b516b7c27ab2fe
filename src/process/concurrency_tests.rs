//! Concurrency properties of `Process`: start-call coalescing and
//! in-flight-aware stop, exercised against a real (but trivial) child
//! process rather than a mock, since the behavior under test is the
//! interaction between the state machine and the OS process it wraps.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::{CheckEndpoint, ModelConfig};
use crate::process::{Process, ProcessState, StopStrategy};

fn sleepy_model(id: &str, secs: u64) -> Arc<ModelConfig> {
    Arc::new(ModelConfig {
        id: id.to_string(),
        cmd: vec!["/bin/sh".to_string(), "-c".to_string(), format!("sleep {secs}")],
        cmd_stop: None,
        proxy: "http://127.0.0.1:0".to_string(),
        check_endpoint: CheckEndpoint::None,
        env: vec![],
        unload_after: None,
        aliases: vec![],
        use_model_name: None,
        strip_params: vec![],
        unlisted: false,
        health_check_timeout: Duration::from_secs(15),
    })
}

#[tokio::test]
async fn concurrent_start_calls_coalesce_to_one_ready_process() {
    let (tx, _rx) = broadcast::channel(16);
    let process = Process::new(sleepy_model("a", 5), tx);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let p = Arc::clone(&process);
        handles.push(tokio::spawn(async move { p.start().await }));
    }
    for h in handles {
        h.await.unwrap().expect("every coalesced start should succeed");
    }
    assert_eq!(process.state().await, ProcessState::Ready);

    process.stop(StopStrategy::Immediately).await;
}

#[tokio::test]
async fn stop_wait_for_inflight_holds_ready_until_drained() {
    let (tx, _rx) = broadcast::channel(16);
    let process = Process::new(sleepy_model("b", 5), tx);
    process.start().await.unwrap();

    let guard = process.add_in_flight();
    let stopper = Arc::clone(&process);
    let stop_handle = tokio::spawn(async move { stopper.stop(StopStrategy::WaitForInflight).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        process.state().await,
        ProcessState::Ready,
        "must not start stopping while a request is in flight"
    );

    drop(guard);
    stop_handle.await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        process.state().await,
        ProcessState::Stopping | ProcessState::Stopped
    ));
}

#[tokio::test]
async fn start_after_shutdown_is_rejected() {
    let (tx, _rx) = broadcast::channel(16);
    let process = Process::new(sleepy_model("c", 5), tx);
    process.start().await.unwrap();
    process.shutdown().await;
    assert_eq!(process.state().await, ProcessState::Shutdown);

    let result = process.start().await;
    assert!(result.is_err(), "a process can never leave SHUTDOWN");
}
