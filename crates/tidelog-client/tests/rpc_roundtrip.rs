//! Duplex channel behavior: correlation, timeout, interruption, traps.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;

use support::{connection_pair, serve, ServerAction};
use tidelog_client::{ClientConfig, TrapListener};
use tidelog_common::{Error, Value};
use tidelog_protocol::Envelope;

fn echo_handler() -> support::Handler {
    Arc::new(|env: Envelope, _push| {
        async move {
            match env.method.as_str() {
                "echo" => ServerAction::Reply(env.params),
                "boom" => ServerAction::Error {
                    code: "query-not-found".to_string(),
                    message: "no such query".to_string(),
                },
                _ => ServerAction::Ignore,
            }
        }
        .boxed()
    })
}

#[tokio::test]
async fn test_call_resolves_with_matching_response() {
    let config = ClientConfig::default();
    let (conn, server_io) = connection_pair(&config);
    let _server = serve(server_io, echo_handler());

    let mut params = HashMap::new();
    params.insert("n".to_string(), Value::Int(7));
    let resp = conn.call("echo", params, Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(resp.get_i64("n"), Some(7));
}

#[tokio::test]
async fn test_concurrent_calls_correlate_independently() {
    let config = ClientConfig::default();
    let (conn, server_io) = connection_pair(&config);
    let _server = serve(server_io, echo_handler());

    let mut tasks = Vec::new();
    for i in 0..50i64 {
        let conn = Arc::clone(&conn);
        tasks.push(tokio::spawn(async move {
            let mut params = HashMap::new();
            params.insert("n".to_string(), Value::Int(i));
            let resp = conn
                .call("echo", params, Some(Duration::from_secs(5)))
                .await
                .unwrap();
            assert_eq!(resp.get_i64("n"), Some(i));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_server_error_surfaces_as_rpc_error() {
    let config = ClientConfig::default();
    let (conn, server_io) = connection_pair(&config);
    let _server = serve(server_io, echo_handler());

    let err = conn
        .call("boom", HashMap::new(), Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    match err {
        Error::Rpc { code, message, .. } => {
            assert_eq!(code, "query-not-found");
            assert_eq!(message, "no such query");
        }
        other => panic!("expected Rpc error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_is_distinct_from_interrupt() {
    let config = ClientConfig::default();
    let (conn, server_io) = connection_pair(&config);
    let _server = serve(server_io, echo_handler());

    // "never" is ignored by the server
    let err = conn
        .call("never", HashMap::new(), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {:?}", err);

    // the channel itself is still healthy
    let resp = conn
        .call("echo", HashMap::new(), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(resp.params.is_empty());
}

#[tokio::test]
async fn test_close_interrupts_outstanding_calls() {
    let config = ClientConfig::default();
    let (conn, server_io) = connection_pair(&config);
    let _server = serve(server_io, echo_handler());

    let blocked = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.call("never", HashMap::new(), None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    conn.shutdown_with(None).await;

    let err = blocked.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Interrupted(_)), "got {:?}", err);

    // further calls fail fast on the closed channel
    assert!(matches!(
        conn.call("echo", HashMap::new(), None).await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn test_peer_disconnect_interrupts_outstanding_calls() {
    let config = ClientConfig::default();
    let (conn, server_io) = connection_pair(&config);
    let server = serve(server_io, echo_handler());

    let blocked = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.call("never", HashMap::new(), None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // killing the server drops its half of the stream
    server.task.abort();
    let _ = server.task.await;

    let err = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Interrupted(_)), "got {:?}", err);
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_unroutable_response_is_dropped_not_fatal() {
    let config = ClientConfig::default();
    let (conn, server_io) = connection_pair(&config);
    let server = serve(server_io, echo_handler());

    // a response correlating to nothing: logged, dropped
    let stray = Envelope::request("whatever");
    let mut unroutable = Envelope::response_to(&stray);
    unroutable.params.insert("junk".to_string(), Value::Int(1));
    server.push.send(unroutable).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let resp = conn
        .call("echo", HashMap::new(), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(resp.params.is_empty());
}

struct Recorder {
    tx: mpsc::UnboundedSender<Envelope>,
}

#[async_trait]
impl TrapListener for Recorder {
    async fn on_trap(&self, trap: Envelope) {
        let _ = self.tx.send(trap);
    }

    async fn on_close(&self, _cause: Option<&Error>) {}
}

struct Panicker;

#[async_trait]
impl TrapListener for Panicker {
    async fn on_trap(&self, _trap: Envelope) {
        panic!("listener bug");
    }

    async fn on_close(&self, _cause: Option<&Error>) {
        panic!("listener bug");
    }
}

#[tokio::test]
async fn test_traps_fan_out_in_order_with_fault_isolation() {
    let config = ClientConfig::default();
    let (conn, server_io) = connection_pair(&config);
    let server = serve(server_io, echo_handler());

    let (tx, mut rx) = mpsc::unbounded_channel();
    // the panicking listener runs first and must not block the recorder
    conn.add_listener(Arc::new(Panicker));
    conn.add_listener(Arc::new(Recorder { tx }));

    for i in 0..5i64 {
        let trap = Envelope::trap("query-9").with_param("seq", i);
        server.push.send(trap).unwrap();
    }

    for expected in 0..5i64 {
        let trap = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trap.method, "query-9");
        assert_eq!(trap.get_i64("seq"), Some(expected));
    }
}

#[tokio::test]
async fn test_shutdown_runs_cleanup_exactly_once() {
    let config = ClientConfig::default();
    let (conn, server_io) = connection_pair(&config);
    let server = serve(server_io, echo_handler());

    let (tx, mut rx) = mpsc::unbounded_channel();
    struct CloseCounter {
        tx: mpsc::UnboundedSender<()>,
    }
    #[async_trait]
    impl TrapListener for CloseCounter {
        async fn on_trap(&self, _trap: Envelope) {}
        async fn on_close(&self, _cause: Option<&Error>) {
            let _ = self.tx.send(());
        }
    }
    conn.add_listener(Arc::new(CloseCounter { tx }));

    // explicit close racing the reader noticing the dead peer
    server.task.abort();
    let _ = server.task.await;
    let (a, b) = tokio::join!(conn.shutdown_with(None), conn.shutdown_with(None));
    let _ = (a, b);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(rx.recv().await.is_some());
    // no second close notification
    assert!(rx.try_recv().is_err());
}
