//! End-to-end dispatch scenarios against a real (in-process) upstream HTTP
//! server, exercising resolution, swap-on-activate, in-flight accounting,
//! and error mapping together rather than in isolation.
//!
//! Each model's `cmd` spawns a harmless `sleep` — the state machine needs a
//! real child to track, but the actual HTTP responses come from a small
//! axum server started directly by the test and addressed via `proxy`,
//! the same way a real llama.cpp server would bind to its assigned port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use indexmap::IndexMap;
use tokio::sync::broadcast;

use crate::config::{CheckEndpoint, Config, GroupConfig, ModelConfig};
use crate::process::manager::ProcessManager;
use crate::proxy::Dispatcher;

/// Spin up a trivial upstream that counts hits and reports its own id, and
/// return its bound address.
async fn start_fake_upstream(id: &'static str, hits: Arc<AtomicUsize>) -> SocketAddr {
    let app = Router::new().route(
        "/v1/models",
        get(move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                axum::Json(serde_json::json!({ "served_by": id }))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

fn model_pointing_at(id: &str, addr: SocketAddr) -> Arc<ModelConfig> {
    Arc::new(ModelConfig {
        id: id.to_string(),
        cmd: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
        cmd_stop: None,
        proxy: format!("http://{addr}"),
        check_endpoint: CheckEndpoint::None,
        env: vec![],
        unload_after: None,
        aliases: vec![id.to_string()],
        use_model_name: None,
        strip_params: vec![],
        unlisted: false,
        health_check_timeout: Duration::from_secs(15),
    })
}

fn config_with(models: Vec<Arc<ModelConfig>>, group: GroupConfig) -> Config {
    config_with_groups(models, vec![group])
}

fn config_with_groups(models: Vec<Arc<ModelConfig>>, groups: Vec<GroupConfig>) -> Config {
    let mut model_map = IndexMap::new();
    let mut aliases = HashMap::new();
    for m in &models {
        aliases.insert(m.id.clone(), m.id.clone());
        for a in &m.aliases {
            aliases.insert(a.clone(), m.id.clone());
        }
        model_map.insert(m.id.clone(), Arc::clone(m));
    }
    let mut group_map = IndexMap::new();
    for group in groups {
        group_map.insert(group.id.clone(), group);
    }
    Config {
        health_check_timeout: Duration::from_secs(15),
        start_port: 5800,
        models: model_map,
        groups: group_map,
        aliases,
        preload: vec![],
    }
}

#[tokio::test]
async fn s1_routes_request_to_the_resolved_model() {
    let hits_a = Arc::new(AtomicUsize::new(0));
    let addr_a = start_fake_upstream("a", Arc::clone(&hits_a)).await;
    let model_a = model_pointing_at("a", addr_a);

    let config = config_with(
        vec![Arc::clone(&model_a)],
        GroupConfig {
            id: "g".to_string(),
            members: vec!["a".to_string()],
            swap: true,
            exclusive: false,
            persistent: false,
        },
    );
    let manager = Arc::new(ProcessManager::new(&config));
    let dispatcher = Dispatcher::new(Arc::clone(&manager));

    let response = dispatcher
        .forward(
            "a",
            axum::http::Method::GET,
            "/v1/models",
            axum::http::HeaderMap::new(),
            axum::body::Body::empty(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn s4_unknown_model_is_rejected_before_any_process_work() {
    let config = config_with(vec![], GroupConfig {
        id: "g".to_string(),
        members: vec![],
        swap: true,
        exclusive: false,
        persistent: false,
    });
    let manager = Arc::new(ProcessManager::new(&config));
    let dispatcher = Dispatcher::new(manager);

    let err = dispatcher
        .forward(
            "does-not-exist",
            axum::http::Method::GET,
            "/v1/models",
            axum::http::HeaderMap::new(),
            axum::body::Body::empty(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn s5_swap_group_stops_previous_member_on_activate() {
    let hits_a = Arc::new(AtomicUsize::new(0));
    let hits_b = Arc::new(AtomicUsize::new(0));
    let addr_a = start_fake_upstream("a", Arc::clone(&hits_a)).await;
    let addr_b = start_fake_upstream("b", Arc::clone(&hits_b)).await;
    let model_a = model_pointing_at("a", addr_a);
    let model_b = model_pointing_at("b", addr_b);

    let config = config_with(
        vec![Arc::clone(&model_a), Arc::clone(&model_b)],
        GroupConfig {
            id: "g".to_string(),
            members: vec!["a".to_string(), "b".to_string()],
            swap: true,
            exclusive: false,
            persistent: false,
        },
    );
    let manager = Arc::new(ProcessManager::new(&config));

    let proc_a = manager.swap("a").await.unwrap();
    assert_eq!(proc_a.state().await, crate::process::ProcessState::Ready);

    manager.swap("b").await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_ne!(proc_a.state().await, crate::process::ProcessState::Ready);
}

#[tokio::test]
async fn in_flight_guard_releases_on_every_exit_path() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = start_fake_upstream("a", Arc::clone(&hits)).await;
    let model = model_pointing_at("a", addr);
    let config = config_with(
        vec![Arc::clone(&model)],
        GroupConfig {
            id: "g".to_string(),
            members: vec!["a".to_string()],
            swap: true,
            exclusive: false,
            persistent: false,
        },
    );
    let manager = Arc::new(ProcessManager::new(&config));
    let dispatcher = Dispatcher::new(Arc::clone(&manager));

    let process = manager.swap("a").await.unwrap();
    assert_eq!(process.in_flight(), 0);

    let response = dispatcher
        .forward(
            "a",
            axum::http::Method::GET,
            "/v1/models",
            axum::http::HeaderMap::new(),
            axum::body::Body::empty(),
        )
        .await
        .unwrap();

    // The in-flight guard travels with the response body stream, not the
    // call to `forward` itself — it isn't released until the body (here,
    // the whole SSE/JSON payload) has actually been drained to the client.
    assert_eq!(process.in_flight(), 1, "guard held open while body unread");
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(process.in_flight(), 0);
}

/// S3: an exclusive, non-persistent group's activation stops every other
/// non-persistent group's READY processes before its own target starts.
#[tokio::test]
async fn exclusive_group_activation_stops_other_nonpersistent_groups() {
    let hits_a = Arc::new(AtomicUsize::new(0));
    let hits_c = Arc::new(AtomicUsize::new(0));
    let addr_a = start_fake_upstream("a", Arc::clone(&hits_a)).await;
    let addr_c = start_fake_upstream("c", Arc::clone(&hits_c)).await;
    let model_a = model_pointing_at("a", addr_a);
    let model_c = model_pointing_at("c", addr_c);

    let config = config_with_groups(
        vec![Arc::clone(&model_a), Arc::clone(&model_c)],
        vec![
            GroupConfig {
                id: "g1".to_string(),
                members: vec!["a".to_string()],
                swap: true,
                exclusive: true,
                persistent: false,
            },
            GroupConfig {
                id: "g2".to_string(),
                members: vec!["c".to_string()],
                swap: true,
                exclusive: false,
                persistent: false,
            },
        ],
    );
    let manager = Arc::new(ProcessManager::new(&config));

    let proc_c = manager.swap("c").await.unwrap();
    assert_eq!(proc_c.state().await, crate::process::ProcessState::Ready);

    manager.swap("a").await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_ne!(
        proc_c.state().await,
        crate::process::ProcessState::Ready,
        "activating the exclusive group must stop every other non-persistent group"
    );
}

/// S4: a persistent group's READY member is untouched by an activation in
/// an unrelated, non-persistent group.
#[tokio::test]
async fn persistent_group_survives_unrelated_activation() {
    let hits_d = Arc::new(AtomicUsize::new(0));
    let hits_a = Arc::new(AtomicUsize::new(0));
    let addr_d = start_fake_upstream("d", Arc::clone(&hits_d)).await;
    let addr_a = start_fake_upstream("a", Arc::clone(&hits_a)).await;
    let model_d = model_pointing_at("d", addr_d);
    let model_a = model_pointing_at("a", addr_a);

    let config = config_with_groups(
        vec![Arc::clone(&model_d), Arc::clone(&model_a)],
        vec![
            GroupConfig {
                id: "g_persist".to_string(),
                members: vec!["d".to_string()],
                swap: true,
                exclusive: false,
                persistent: true,
            },
            GroupConfig {
                id: "g1".to_string(),
                members: vec!["a".to_string()],
                swap: true,
                exclusive: false,
                persistent: false,
            },
        ],
    );
    let manager = Arc::new(ProcessManager::new(&config));

    let proc_d = manager.swap("d").await.unwrap();
    assert_eq!(proc_d.state().await, crate::process::ProcessState::Ready);

    manager.swap("a").await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        proc_d.state().await,
        crate::process::ProcessState::Ready,
        "a persistent group's member must not be stopped by another group's activation"
    );
}
