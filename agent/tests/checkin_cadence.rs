//! Telemetry cadence behavior against a recording transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vigil_agent::checkin::CheckInScheduler;
use vigil_agent::test_support::{test_ctx, test_ctx_with_api_url, TestCtx};
use vigil_common::checkin::CheckInConfig;

fn only(hello: u64, agent_info: u64, wmi: u64, limit_data: bool) -> CheckInConfig {
    CheckInConfig {
        hello,
        agent_info,
        services: 0,
        public_ip: 0,
        disks: 0,
        software: 0,
        wmi,
        sync: 0,
        limit_data,
    }
}

#[tokio::test]
async fn test_fast_cadence_fires_repeatedly() {
    let TestCtx { ctx, transport, .. } = test_ctx();
    let scheduler = CheckInScheduler::with_startup_delay(Arc::clone(&ctx), Duration::ZERO);
    let run = tokio::spawn(scheduler.run_with_config(only(1, 0, 0, false)));

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    run.abort();

    let hellos = transport
        .published()
        .iter()
        .filter(|(subject, _)| subject == "vigil.checkin.hello")
        .count();
    assert!(hellos >= 3, "one-second cadence fired only {hellos} times in 3.5s");
}

#[tokio::test]
async fn test_slow_cadence_bursts_once_then_waits() {
    let TestCtx { ctx, transport, .. } = test_ctx();
    let scheduler = CheckInScheduler::with_startup_delay(Arc::clone(&ctx), Duration::ZERO);
    let run = tokio::spawn(scheduler.run_with_config(only(0, 9_999, 0, false)));

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    run.abort();

    let pushes = transport
        .published()
        .iter()
        .filter(|(subject, _)| subject == "vigil.checkin.agent_info")
        .count();
    assert_eq!(pushes, 1, "only the startup burst may fire before the interval");
}

#[tokio::test]
async fn test_limit_data_suppresses_heavy_signals_entirely() {
    let TestCtx { ctx, transport, .. } = test_ctx();
    let scheduler = CheckInScheduler::with_startup_delay(Arc::clone(&ctx), Duration::ZERO);
    let run = tokio::spawn(scheduler.run_with_config(only(1, 0, 1, true)));

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    run.abort();

    let published = transport.published();
    assert!(
        published.iter().any(|(s, _)| s == "vigil.checkin.hello"),
        "light signals keep flowing"
    );
    assert!(
        !published.iter().any(|(s, _)| s == "vigil.checkin.wmi"),
        "heavy signals must not fire under limit_data"
    );
}

#[tokio::test]
async fn test_config_fetch_waits_for_startup_delay() {
    // Count controller connections; close each immediately so the fetch
    // falls back to the hardcoded cadences.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                hits.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });
    }

    let fixture = test_ctx_with_api_url(&format!("http://{addr}"));
    let scheduler = CheckInScheduler::with_startup_delay(
        Arc::clone(&fixture.ctx),
        Duration::from_millis(400),
    );
    let run = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        hits.load(Ordering::SeqCst),
        0,
        "the controller must not be contacted before the startup delay"
    );

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(
        hits.load(Ordering::SeqCst) >= 1,
        "the config fetch must happen once the delay elapses"
    );
    run.abort();
}

#[tokio::test]
async fn test_startup_delay_holds_the_burst() {
    let TestCtx { ctx, transport, .. } = test_ctx();
    let scheduler =
        CheckInScheduler::with_startup_delay(Arc::clone(&ctx), Duration::from_secs(60));
    let run = tokio::spawn(scheduler.run_with_config(only(1, 0, 0, false)));

    tokio::time::sleep(Duration::from_millis(500)).await;
    run.abort();

    assert!(
        transport.published().is_empty(),
        "nothing may publish before the startup delay elapses"
    );
}
