//! Lifecycle tests: start, restart in place, graceful drain and signals.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::time::Instant;

use rebind::lifecycle::{Controller, ManualSignals, Phase, Signal};
use rebind::{HttpServer, ServerError};

mod common;
use common::*;

#[tokio::test]
async fn serves_until_shutdown() {
    let (controller, _signals) = controller();
    let task = spawn(&controller);
    let addr = serving(&controller, 1).await;

    assert_eq!(get_text(addr, "/").await.unwrap(), "ok");
    assert!(controller.is_running());

    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());
    assert_eq!(controller.phase(), Phase::Idle);
    assert!(get_text(addr, "/").await.is_err());
}

#[tokio::test]
async fn restart_before_start_does_nothing() {
    let (controller, _signals) = controller();
    controller.restart();
    assert_eq!(controller.phase(), Phase::Idle);

    let task = spawn(&controller);
    serving(&controller, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.generation(), 1);

    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());
}

#[tokio::test]
async fn restart_rebinds_same_address() {
    let (controller, _signals) = controller();
    let task = spawn(&controller);
    let first = serving(&controller, 1).await;

    controller.restart();
    let second = serving(&controller, 2).await;
    assert_eq!(first, second);
    assert_eq!(get_text(second, "/").await.unwrap(), "ok");

    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());
    assert_eq!(controller.generation(), 2);
}

#[tokio::test]
async fn repeated_restart_requests_coalesce() {
    let (controller, _signals) = controller();
    let task = spawn(&controller);
    serving(&controller, 1).await;

    controller.restart();
    controller.restart();
    assert!(controller.restart_requested());

    serving(&controller, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.generation(), 2);

    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());
}

#[tokio::test]
async fn next_run_binds_after_previous_drains() {
    let finished = Arc::new(AtomicBool::new(false));
    let done = Arc::clone(&finished);
    let handler = Router::new().route(
        "/slow",
        get(move || {
            let done = Arc::clone(&done);
            async move {
                tokio::time::sleep(SLOW).await;
                done.store(true, Ordering::SeqCst);
                "slow"
            }
        }),
    );
    let mut builder = builder(free_addr());
    builder.handler = handler;
    let controller = Controller::with_signals(builder, ManualSignals::new());
    let task = spawn(&controller);
    let addr = serving(&controller, 1).await;

    let in_flight = tokio::spawn(get_text(addr, "/slow"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.restart();

    wait_until("restart", || controller.restart_requested()).await;
    assert!(controller.is_running(), "loop reported stopped while draining for a restart");

    serving(&controller, 2).await;
    assert!(finished.load(Ordering::SeqCst), "second run bound before the first drained");
    assert_eq!(in_flight.await.unwrap().unwrap(), "slow");

    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());
}

#[tokio::test]
async fn updates_carry_into_every_later_run() {
    let (controller, _signals) = controller();
    let task = spawn(&controller);
    serving(&controller, 1).await;
    assert_eq!(controller.config().unwrap().request_timeout(), None);

    controller.update(|b| {
        b.request_timeout = Some(Duration::from_millis(100));
        b.name = "edge".to_string();
    });
    // Edits wait for the next run.
    assert_eq!(controller.config().unwrap().name(), "rebind");

    controller.restart();
    let addr = serving(&controller, 2).await;
    let config = controller.config().unwrap();
    assert_eq!(config.name(), "edge");
    assert_eq!(config.request_timeout(), Some(Duration::from_millis(100)));

    let response = client()
        .get(format!("http://{addr}/slow"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::REQUEST_TIMEOUT);

    controller.restart();
    serving(&controller, 3).await;
    let config = controller.config().unwrap();
    assert_eq!(config.name(), "edge");
    assert_eq!(config.request_timeout(), Some(Duration::from_millis(100)));

    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());
}

#[tokio::test]
async fn startup_hook_runs_before_every_run() {
    let (controller, _signals) = controller();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    controller.on_start(move |b| {
        let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
        b.name = format!("run-{n}");
    });

    let task = spawn(&controller);
    serving(&controller, 1).await;
    assert_eq!(controller.config().unwrap().name(), "run-1");

    controller.restart();
    serving(&controller, 2).await;
    assert_eq!(controller.config().unwrap().name(), "run-2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn handler_can_be_replaced_without_restart() {
    let (controller, _signals) = controller();
    let task = spawn(&controller);
    let addr = serving(&controller, 1).await;
    assert_eq!(get_text(addr, "/").await.unwrap(), "ok");

    controller.replace_handler(app("replaced"));
    assert_eq!(get_text(addr, "/").await.unwrap(), "replaced");
    assert_eq!(controller.generation(), 1);

    controller.restart();
    let addr = serving(&controller, 2).await;
    assert_eq!(get_text(addr, "/").await.unwrap(), "replaced");

    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_requests() {
    let (controller, _signals) = controller();
    let controller = controller.graceful_timeout(Duration::from_secs(5));
    let task = spawn(&controller);
    let addr = serving(&controller, 1).await;

    let in_flight = tokio::spawn(get_text(addr, "/slow"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    controller.shutdown().await;
    assert_eq!(in_flight.await.unwrap().unwrap(), "slow");
    assert!(stopped(task).await.is_ok());
}

#[tokio::test]
async fn shutdown_closes_connections_after_grace() {
    let handler = Router::new().route(
        "/stuck",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "late"
        }),
    );
    let mut builder = builder(free_addr());
    builder.handler = handler;
    let controller = Controller::with_signals(builder, ManualSignals::new())
        .graceful_timeout(Duration::from_millis(200));
    let task = spawn(&controller);
    let addr = serving(&controller, 1).await;

    let in_flight = tokio::spawn(get_text(addr, "/stuck"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    controller.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(stopped(task).await.is_ok());
    assert!(in_flight.await.unwrap().is_err());
}

#[tokio::test]
async fn drain_timeout_is_reported_by_the_handle() {
    let mut builder = builder(free_addr());
    builder.handler = Router::new().route(
        "/stuck",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "late"
        }),
    );
    let server = HttpServer::new(builder.build());
    let handle = server.handle();
    let task = tokio::spawn(server.serve());
    wait_until("bind", || handle.local_addr().is_some()).await;
    let addr = handle.local_addr().unwrap();

    let _in_flight = tokio::spawn(get_text(addr, "/stuck"));
    wait_until("connection", || handle.connection_count() == 1).await;

    let err = handle
        .shutdown(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::ShutdownTimeout { remaining: 1, .. }));

    let result = tokio::time::timeout(WAIT_TIMEOUT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn terminate_signal_stops_the_loop() {
    let (controller, signals) = controller();
    let task = spawn(&controller);
    serving(&controller, 1).await;
    assert_eq!(signals.registered(), 1);

    assert_eq!(signals.raise(Signal::Terminate), 1);
    assert!(stopped(task).await.is_ok());
    assert_eq!(controller.phase(), Phase::Idle);
    assert_eq!(signals.registered(), 0);
}

#[tokio::test]
async fn signals_reach_only_the_current_run() {
    let (controller, signals) = controller();
    let task = spawn(&controller);
    serving(&controller, 1).await;

    controller.restart();
    serving(&controller, 2).await;
    assert_eq!(signals.registered(), 1);

    assert_eq!(signals.raise(Signal::Interrupt), 1);
    assert!(stopped(task).await.is_ok());
    assert_eq!(controller.generation(), 2);
}

#[tokio::test]
async fn signal_during_restart_keeps_the_restart() {
    let (controller, signals) = controller();
    let task = spawn(&controller);
    serving(&controller, 1).await;

    controller.restart();
    // The run is already stopping; the extra signal changes nothing.
    signals.raise(Signal::Interrupt);

    serving(&controller, 2).await;
    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());
}

#[tokio::test]
async fn second_start_is_rejected() {
    let (controller, _signals) = controller();
    let task = spawn(&controller);
    serving(&controller, 1).await;

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, ServerError::AlreadyStarted));
    assert!(controller.is_running());

    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());
}

#[tokio::test]
async fn controller_can_start_again_after_stopping() {
    let (controller, _signals) = controller();
    let task = spawn(&controller);
    serving(&controller, 1).await;
    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());

    let task = spawn(&controller);
    let addr = serving(&controller, 2).await;
    assert_eq!(get_text(addr, "/").await.unwrap(), "ok");
    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());
}

#[tokio::test]
async fn bind_failure_ends_the_loop() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();
    let controller = Controller::with_signals(builder(addr), ManualSignals::new());

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, ServerError::Bind { addr: a, .. } if a == addr));
    assert_eq!(controller.phase(), Phase::Idle);
}

#[tokio::test]
async fn restart_moves_to_a_new_address() {
    let (controller, _signals) = controller();
    let task = spawn(&controller);
    serving(&controller, 1).await;

    let next = free_addr();
    controller.update(|b| b.address = next);
    controller.restart();
    let addr = serving(&controller, 2).await;
    assert_eq!(addr, next);
    assert_eq!(get_text(addr, "/").await.unwrap(), "ok");

    controller.shutdown().await;
    assert!(stopped(task).await.is_ok());
}
