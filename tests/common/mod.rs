//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use rebind::lifecycle::{Controller, ManualSignals, Phase};
use rebind::{ServerBuilder, ServerError, TlsMaterial};

/// How long a helper waits for the server to reach a state.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the `/slow` route takes to answer.
pub const SLOW: Duration = Duration::from_millis(400);

/// A loopback address nothing listens on right now.
pub fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Router answering `/` with `body` and `/slow` after [`SLOW`].
pub fn app(body: &'static str) -> Router {
    Router::new()
        .route("/", get(move || async move { body }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(SLOW).await;
                "slow"
            }),
        )
}

pub fn builder(addr: SocketAddr) -> ServerBuilder {
    ServerBuilder::new(addr, app("ok"))
}

/// Controller on a fresh port driven by in-process signals.
pub fn controller() -> (Controller, ManualSignals) {
    let signals = ManualSignals::new();
    let controller = Controller::with_signals(builder(free_addr()), signals.clone());
    (controller, signals)
}

pub fn material() -> TlsMaterial {
    TlsMaterial::from_pem(
        include_bytes!("../fixtures/cert.pem"),
        include_bytes!("../fixtures/key.pem"),
    )
    .unwrap()
}

/// Client that opens a new connection per request and ignores proxy
/// settings from the environment.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .timeout(WAIT_TIMEOUT)
        .build()
        .unwrap()
}

/// Run the controller's accept loop in the background.
pub fn spawn(controller: &Controller) -> JoinHandle<Result<(), ServerError>> {
    let controller = controller.clone();
    tokio::spawn(async move { controller.start().await })
}

pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for run `generation` to be bound and serving. Returns its address.
pub async fn serving(controller: &Controller, generation: u64) -> SocketAddr {
    wait_until(&format!("run {generation} to serve"), || {
        controller.generation() == generation
            && controller.phase() == Phase::Running
            && controller.local_addr().is_some()
    })
    .await;
    controller.local_addr().unwrap()
}

/// Wait for the accept loop to return.
pub async fn stopped(task: JoinHandle<Result<(), ServerError>>) -> Result<(), ServerError> {
    tokio::time::timeout(WAIT_TIMEOUT, task)
        .await
        .expect("accept loop did not stop")
        .expect("accept loop panicked")
}

pub async fn get_text(addr: SocketAddr, path: &str) -> reqwest::Result<String> {
    client()
        .get(format!("http://{addr}{path}"))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}
