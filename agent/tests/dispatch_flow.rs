//! End-to-end dispatch: inbox bytes in, transport publishes out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use vigil_agent::dispatch::Dispatcher;
use vigil_agent::test_support::{test_ctx, test_ctx_with_updates, FakeUpdates, TestCtx};
use vigil_common::envelope::Envelope;

async fn send(tx: &mpsc::Sender<Vec<u8>>, envelope: &Envelope) {
    let bytes = envelope.encode().expect("encode envelope");
    tx.send(bytes).await.expect("inbox send");
}

/// Poll until `condition` holds or two seconds pass.
async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within two seconds");
}

#[tokio::test]
async fn test_ping_round_trip() {
    let TestCtx { ctx, transport, .. } = test_ctx();
    let (tx, rx) = mpsc::channel(8);
    let dispatcher = Dispatcher::new(Arc::clone(&ctx));
    let run = tokio::spawn(dispatcher.run(rx, std::future::pending()));

    let mut envelope = Envelope::for_func("ping");
    envelope.reply_to = Some("vigil.reply.ping".to_string());
    send(&tx, &envelope).await;

    wait_for(|| transport.published().len() == 1).await;
    let published = transport.published();
    assert_eq!(published[0].0, "vigil.reply.ping");
    let pong: String = vigil_common::envelope::decode(&published[0].1).expect("decode reply");
    assert_eq!(pong, "pong");

    drop(tx);
    run.await.expect("dispatcher joins cleanly");
}

#[tokio::test]
async fn test_unknown_func_and_garbage_produce_no_reply() {
    let TestCtx { ctx, transport, .. } = test_ctx();
    let (tx, rx) = mpsc::channel(8);
    let dispatcher = Dispatcher::new(Arc::clone(&ctx));
    let run = tokio::spawn(dispatcher.run(rx, std::future::pending()));

    let mut unknown = Envelope::for_func("frobnicate");
    unknown.reply_to = Some("vigil.reply.unknown".to_string());
    send(&tx, &unknown).await;
    tx.send(b"\xc1 definitely not msgpack".to_vec())
        .await
        .expect("inbox send");

    // A ping afterwards proves the dispatcher survived both and stayed in
    // order: its reply is the only publish.
    let mut ping = Envelope::for_func("ping");
    ping.reply_to = Some("vigil.reply.after".to_string());
    send(&tx, &ping).await;

    wait_for(|| !transport.published().is_empty()).await;
    let published = transport.published();
    assert_eq!(published.len(), 1, "only the ping may be answered");
    assert_eq!(published[0].0, "vigil.reply.after");

    drop(tx);
    run.await.expect("dispatcher joins cleanly");
}

#[tokio::test]
async fn test_concurrent_installs_single_flight() {
    let updates = Arc::new(FakeUpdates::with_delay(Duration::from_millis(300)));
    let TestCtx { ctx, transport, .. } = test_ctx_with_updates(Arc::clone(&updates));
    let (tx, rx) = mpsc::channel(8);
    let dispatcher = Dispatcher::new(Arc::clone(&ctx));
    let run = tokio::spawn(dispatcher.run(rx, std::future::pending()));

    let mut first = Envelope::for_func("installupdates");
    first.reply_to = Some("vigil.reply.first".to_string());
    let mut second = Envelope::for_func("installupdates");
    second.reply_to = Some("vigil.reply.second".to_string());
    send(&tx, &first).await;
    send(&tx, &second).await;

    wait_for(|| transport.published().len() == 2).await;
    let published = transport.published();
    let decoded: Vec<(String, String)> = published
        .iter()
        .map(|(subject, bytes)| {
            let s: String = vigil_common::envelope::decode(bytes).expect("decode reply");
            (subject.clone(), s)
        })
        .collect();

    let oks = decoded.iter().filter(|(_, r)| r == "ok").count();
    let busy = decoded.iter().filter(|(_, r)| r == "updaterunning").count();
    assert_eq!(oks, 1, "exactly one install may win: {decoded:?}");
    assert_eq!(busy, 1, "the loser gets the busy sentinel: {decoded:?}");

    drop(tx);
    run.await.expect("dispatcher joins cleanly");
    assert_eq!(updates.install_calls(), 1, "the install itself runs once");
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_handlers() {
    let updates = Arc::new(FakeUpdates::with_delay(Duration::from_millis(300)));
    let TestCtx { ctx, transport, .. } = test_ctx_with_updates(Arc::clone(&updates));
    let (tx, rx) = mpsc::channel(8);
    let shutdown = Arc::new(tokio::sync::Notify::new());

    let dispatcher = Dispatcher::new(Arc::clone(&ctx));
    let run = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(dispatcher.run(rx, async move { shutdown.notified().await }))
    };

    let mut envelope = Envelope::for_func("installupdates");
    envelope.reply_to = Some("vigil.reply.drain".to_string());
    send(&tx, &envelope).await;

    // Ack published means the handler is mid-install; shut down now.
    wait_for(|| !transport.published().is_empty()).await;
    shutdown.notify_one();
    run.await.expect("dispatcher joins cleanly");

    assert_eq!(updates.install_calls(), 1, "the in-flight install must finish");
}

#[tokio::test]
async fn test_rawcmd_result_comes_back_as_one_string() {
    let TestCtx { ctx, transport, .. } = test_ctx();
    let (tx, rx) = mpsc::channel(8);
    let dispatcher = Dispatcher::new(Arc::clone(&ctx));
    let run = tokio::spawn(dispatcher.run(rx, std::future::pending()));

    let mut envelope = Envelope::for_func("rawcmd");
    envelope.reply_to = Some("vigil.reply.cmd".to_string());
    envelope
        .payload
        .insert("command".to_string(), "echo dispatched".to_string());
    send(&tx, &envelope).await;

    wait_for(|| transport.published().len() == 1).await;
    let published = transport.published();
    let output: String = vigil_common::envelope::decode(&published[0].1).expect("decode reply");
    if cfg!(unix) {
        assert_eq!(output, "dispatched\n");
    } else {
        assert!(output.contains("dispatched"));
    }

    drop(tx);
    run.await.expect("dispatcher joins cleanly");
}
