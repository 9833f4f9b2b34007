//! End-to-end block scenarios against fake servers-under-test.

mod common;

use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{FakeServer, SLEEPER, append_log, config, free_port, harness, http_response, run, suite};
use ngx_scaffold::evaluate::Expectation;

/// A server that writes its own failure to the error log and exits.
const DYING_SERVER: &str =
    r#"sh -c 'echo "[emerg] 42#0: I am dying!" >> {prefix}/logs/error.log; exit 1'"#;

#[tokio::test(flavor = "multi_thread")]
async fn must_die_passes_when_startup_fails_with_logged_reason() {
    let root = tempfile::tempdir().unwrap();
    let mut harness = harness(&config(root.path(), DYING_SERVER, free_port()), None);
    let suite = suite(
        &harness,
        "=== TEST 1: init failure\n\
         --- config\n\
         location = /t { die; }\n\
         --- must_die\n\
         --- error_log\n\
         I am dying!\n",
    );

    let (summary, tap) = run(&mut harness, &suite).await;

    assert_eq!(summary.passed, 1, "{tap}");
    assert!(tap.contains("ok 1 - TEST 1: init failure"));
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_failure_without_must_die_fails_the_block() {
    let root = tempfile::tempdir().unwrap();
    let mut harness = harness(&config(root.path(), DYING_SERVER, free_port()), None);
    let suite = suite(
        &harness,
        "=== TEST 1: unexpected death\n--- config\n--- request\nGET /t\n",
    );

    let block = &suite.blocks[0];
    let outcome = harness.run_block(block).await.unwrap();
    harness.shutdown().await;

    assert!(!outcome.passed());
    let kinds: Vec<_> = outcome
        .verdict
        .mismatches()
        .iter()
        .map(|m| m.expectation)
        .collect();
    assert_eq!(kinds, vec![Expectation::Startup]);
    assert!(outcome.verdict.mismatches()[0].actual.contains("exited with code 1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn must_die_fails_when_server_starts() {
    let root = tempfile::tempdir().unwrap();
    let port = free_port();
    let _server = FakeServer::start(port, |_, _| async {}.boxed()).await;
    let mut harness = harness(&config(root.path(), SLEEPER, port), None);
    let suite = suite(&harness, "=== TEST 1: survives\n--- config\n--- must_die\n");

    let outcome = harness.run_block(&suite.blocks[0]).await.unwrap();

    assert!(!outcome.passed());
    assert_eq!(outcome.verdict.mismatches()[0].expectation, Expectation::MustDie);
    // A must_die block never leaves its server behind.
    assert!(harness.controller().pid().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_request_without_host_gets_400() {
    let root = tempfile::tempdir().unwrap();
    let port = free_port();
    let _server = FakeServer::start(port, |head, mut stream| {
        async move {
            let head = String::from_utf8_lossy(&head).to_ascii_lowercase();
            let response = if head.contains("\r\nhost:") {
                http_response("200 OK", b"ok\n")
            } else {
                http_response("400 Bad Request", b"")
            };
            let _ = stream.write_all(&response).await;
        }
        .boxed()
    })
    .await;
    let mut harness = harness(&config(root.path(), SLEEPER, port), None);
    let suite = suite(
        &harness,
        "=== TEST 1: no host\n\
         --- config\n\
         location = /t { return 200; }\n\
         --- raw_request eval\n\
         \"GET /t HTTP/1.1\\r\\nConnection: close\\r\\n\\r\\n\"\n\
         --- error_code: 400\n\
         \n\
         === TEST 2: host added by default\n\
         --- config\n\
         location = /t { return 200; }\n\
         --- request\n\
         GET /t\n\
         --- response_body\n\
         ok\n",
    );

    let (summary, tap) = run(&mut harness, &suite).await;

    assert_eq!(summary.passed, 2, "{tap}");
    assert_eq!(summary.failed, 0, "{tap}");
}

#[tokio::test(flavor = "multi_thread")]
async fn mock_backend_reply_reaches_the_client() {
    let root = tempfile::tempdir().unwrap();
    let port = free_port();
    let backend = free_port();
    let _server = FakeServer::start(port, move |_, mut stream| {
        async move {
            let mut upstream = String::new();
            if let Ok(mut conn) = TcpStream::connect(("127.0.0.1", backend)).await {
                let _ = conn.write_all(b"GET /x HTTP/1.0\r\n\r\n").await;
                let _ = conn.read_to_string(&mut upstream).await;
            }
            let body = format!("failed to get: {upstream}");
            let _ = stream.write_all(&http_response("200 OK", body.as_bytes())).await;
        }
        .boxed()
    })
    .await;
    let mut harness = harness(&config(root.path(), SLEEPER, port), None);
    let doc = format!(
        "=== TEST 1: backend error text\n\
         --- config\n\
         location = /t {{ proxy_pass http://127.0.0.1:{backend}; }}\n\
         --- request\n\
         GET /t\n\
         --- tcp_listen: {backend}\n\
         --- tcp_reply: upstream sent garbage\n\
         --- response_body: failed to get: upstream sent garbage\n"
    );
    let suite = suite(&harness, &doc);

    let (summary, tap) = run(&mut harness, &suite).await;

    assert_eq!(summary.passed, 1, "{tap}");
}

#[tokio::test(flavor = "multi_thread")]
async fn aborted_request_interrupts_the_handler() {
    let root = tempfile::tempdir().unwrap();
    let port = free_port();
    let mut harness = harness(&config(root.path(), SLEEPER, port), None);
    let prefix = harness.controller().prefix().to_path_buf();
    let _server = FakeServer::start(port, move |_, mut stream| {
        let prefix = prefix.clone();
        async move {
            let mut buf = [0u8; 64];
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(700)) => {
                    append_log(&prefix, "[info] handler: done");
                    let _ = stream.write_all(&http_response("200 OK", b"done\n")).await;
                }
                _ = stream.read(&mut buf) => {
                    append_log(&prefix, "[info] client prematurely closed connection");
                }
            }
        }
        .boxed()
    })
    .await;
    let suite = suite(
        &harness,
        "=== TEST 1: abort\n\
         --- config\n\
         location = /t { sleep 0.7; }\n\
         --- request\n\
         GET /t\n\
         --- timeout: 0.2\n\
         --- abort\n\
         --- error_log\n\
         client prematurely closed connection\n\
         --- no_error_log\n\
         done\n",
    );

    let outcome = harness.run_block(&suite.blocks[0]).await.unwrap();
    harness.shutdown().await;

    assert!(outcome.passed(), "{:?}", outcome.verdict.mismatches());
    assert!(
        outcome
            .verdict
            .notes()
            .iter()
            .any(|n| n.contains("timed out")),
        "{:?}",
        outcome.verdict.notes()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_without_abort_is_a_client_timeout() {
    let root = tempfile::tempdir().unwrap();
    let port = free_port();
    let _server = FakeServer::start(port, |_, _stream| {
        async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        .boxed()
    })
    .await;
    let mut harness = harness(&config(root.path(), SLEEPER, port), None);
    let suite = suite(
        &harness,
        "=== TEST 1: slow\n--- config\n--- request\nGET /t\n--- timeout: 0.2\n",
    );

    let outcome = harness.run_block(&suite.blocks[0]).await.unwrap();
    harness.shutdown().await;

    let kinds: Vec<_> = outcome
        .verdict
        .mismatches()
        .iter()
        .map(|m| m.expectation)
        .collect();
    assert_eq!(kinds, vec![Expectation::ClientTimeout]);
}
