//! End-to-end tests: a real server on a loopback listener, driven through
//! the public client API.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use wisprpc_client::Client;
use wisprpc_common::{Options, RpcError};
use wisprpc_server::{Server, Service};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct SumArgs {
    num1: i64,
    num2: i64,
}

fn test_services(server: &Server) {
    server
        .register(
            Service::builder("Arith")
                .method("Sum", |args: SumArgs| async move { Ok(args.num1 + args.num2) })
                .method("Fail", |_: SumArgs| async move {
                    Err::<i64, _>(RpcError::handler("arith failure"))
                })
                .build(),
        )
        .unwrap();
    server
        .register(
            Service::builder("Slow")
                .method("Nap", |ms: u64| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(ms)
                })
                .build(),
        )
        .unwrap();
}

async fn start_server() -> String {
    let server = Server::new();
    test_services(&server);
    let server = Arc::new(server);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { server.serve(listener).await });
    addr
}

#[tokio::test]
async fn test_sum_round_trip() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 1, num2: 3 })
        .await
        .unwrap();
    assert_eq!(reply, 4);
}

#[tokio::test]
async fn test_sum_round_trip_json_codec() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::json()).await.unwrap();

    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 20, num2: 22 })
        .await
        .unwrap();
    assert_eq!(reply, 42);
}

#[tokio::test]
async fn test_concurrent_calls_multiplex_one_connection() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let mut calls = JoinSet::new();
    for i in 0..10i64 {
        let client = client.clone();
        calls.spawn(async move {
            let reply: i64 = client
                .call("Arith.Sum", &SumArgs { num1: i, num2: i * i })
                .await
                .unwrap();
            assert_eq!(reply, i + i * i);
        });
    }
    while let Some(result) = calls.join_next().await {
        result.unwrap();
    }
}

#[tokio::test]
async fn test_method_error_travels_in_header() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let err = client
        .call::<SumArgs, i64>("Arith.Fail", &SumArgs { num1: 0, num2: 0 })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));
    assert!(err.to_string().contains("arith failure"));
}

#[tokio::test]
async fn test_malformed_service_method_then_valid_call() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let err = client
        .call::<SumArgs, i64>("NoDot", &SumArgs { num1: 1, num2: 1 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("NoDot"));

    // The connection keeps processing well-formed calls afterwards.
    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 2, num2: 3 })
        .await
        .unwrap();
    assert_eq!(reply, 5);
}

#[tokio::test]
async fn test_unknown_method_is_a_single_request_error() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let err = client
        .call::<SumArgs, i64>("Arith.Sub", &SumArgs { num1: 1, num2: 1 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Sub"));
    assert!(client.is_available());
}

#[tokio::test]
async fn test_server_handle_timeout() {
    let addr = start_server().await;
    let options = Options::default().with_handle_timeout(Duration::from_millis(100));
    let client = Client::dial(&addr, options).await.unwrap();

    let err = client.call::<u64, u64>("Slow.Nap", &500).await.unwrap_err();
    assert!(
        err.to_string().contains("handle timeout"),
        "got: {}",
        err
    );
}

#[tokio::test]
async fn test_server_side_default_handle_timeout() {
    let server = Server::with_handle_timeout(Duration::from_millis(100));
    test_services(&server);
    let server = Arc::new(server);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { server.serve(listener).await });

    // The client leaves the handshake handle-timeout at zero; the server's
    // own default applies.
    let client = Client::dial(&addr, Options::default()).await.unwrap();
    let err = client.call::<u64, u64>("Slow.Nap", &500).await.unwrap_err();
    assert!(err.to_string().contains("handle timeout"));
}

#[tokio::test]
async fn test_call_timeout_cancels_and_connection_survives() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let err = client
        .call_timeout::<u64, u64>("Slow.Nap", &500, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::CallTimeout));

    // The late response for the cancelled call is drained; the client stays
    // usable on the same connection.
    assert!(client.is_available());
    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 8, num2: 9 })
        .await
        .unwrap();
    assert_eq!(reply, 17);
}

#[tokio::test]
async fn test_responses_match_out_of_order_completion() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    // A slow call issued first must not steal the fast call's response.
    let slow = client.go::<u64, u64>("Slow.Nap", &200).await.unwrap();
    let fast: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 1, num2: 2 })
        .await
        .unwrap();
    assert_eq!(fast, 3);
    assert_eq!(slow.recv().await.unwrap(), 200);
}

#[tokio::test]
async fn test_concurrent_seq_assignment_is_unique() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let mut tasks = JoinSet::new();
    for _ in 0..10 {
        let client = client.clone();
        tasks.spawn(async move {
            let mut seqs = Vec::new();
            for i in 0..10i64 {
                let handle = client
                    .go::<SumArgs, i64>("Arith.Sum", &SumArgs { num1: i, num2: 0 })
                    .await
                    .unwrap();
                seqs.push(handle.seq());
                handle.recv().await.unwrap();
            }
            seqs
        });
    }

    let mut all = std::collections::HashSet::new();
    while let Some(result) = tasks.join_next().await {
        for seq in result.unwrap() {
            assert!(all.insert(seq), "sequence number {} assigned twice", seq);
        }
    }
    assert_eq!(all.len(), 100);
}

#[cfg(unix)]
#[tokio::test]
async fn test_xdial_unix_socket() {
    use tokio::net::UnixListener;
    use wisprpc_client::xdial;

    let dir = std::env::temp_dir().join(format!("wisprpc-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("rpc.sock");
    let _ = std::fs::remove_file(&path);

    let server = Server::new();
    test_services(&server);
    let server = Arc::new(server);
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            tokio::spawn(Arc::clone(&server).serve_stream(stream));
        }
    });

    let client = xdial(&format!("unix@{}", path.display()), Options::default())
        .await
        .unwrap();
    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 3, num2: 4 })
        .await
        .unwrap();
    assert_eq!(reply, 7);
}

#[tokio::test]
async fn test_done_signalled_exactly_once_per_call() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    for i in 0..5i64 {
        let handle = client
            .go::<SumArgs, i64>("Arith.Sum", &SumArgs { num1: i, num2: 1 })
            .await
            .unwrap();
        // Exactly one of (reply, error) resolves the handle.
        let reply = handle.recv().await.unwrap();
        assert_eq!(reply, i + 1);
    }
}
