#[path = "common.rs"]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::BufReader;

use common::{connect, eventually, fast_settings, location, InitializeReply, Reply, Script};
use modal_lsp::lsp::client::{ClientSettings, ClientState, LspClient, QueryKind, Transport};
use modal_lsp::lsp::codec::{read_message, write_message};
use modal_lsp::lsp::protocol::{file_uri, Position};
use modal_lsp::lsp::transcript::Transcript;
use modal_lsp::utils::error::LspError;
use modal_lsp::workspace::documents::{open_workspace, OpenedDocuments};

fn line_of(params: &Value) -> u64 {
    params["position"]["line"].as_u64().unwrap()
}

#[tokio::test]
async fn test_ready_only_after_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let (client, received) = connect(dir.path(), Script::default(), fast_settings());

    assert!(!client.is_ready());
    assert_eq!(client.state(), ClientState::Starting);

    assert!(client.wait_for_ready(Duration::from_secs(5)).await);
    assert!(client.is_ready());

    let init = &received.params("initialize")[0];
    let root_uri = file_uri(dir.path()).unwrap();
    assert_eq!(init["rootUri"], root_uri);
    assert_eq!(init["workspaceFolders"][0]["uri"], root_uri);
    assert_eq!(init["processId"], std::process::id());
    assert_eq!(init["capabilities"]["textDocument"]["definition"]["dynamicRegistration"], true);
    assert_eq!(init["capabilities"]["workspace"]["workspaceFolders"], true);
    eventually("initialized", || received.count("initialized") == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_ready_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script { initialize: InitializeReply::Silent, ..Script::default() };
    let settings = ClientSettings {
        request_timeout: Duration::from_secs(60),
        ..fast_settings()
    };
    let (client, _received) = connect(dir.path(), script, settings);

    let started = tokio::time::Instant::now();
    assert!(!client.wait_for_ready(Duration::from_secs(5)).await);
    let waited = started.elapsed();

    assert!(waited >= Duration::from_secs(5), "returned after {waited:?}");
    assert!(waited < Duration::from_millis(5_100), "returned after {waited:?}");
    assert_eq!(client.state(), ClientState::Starting);
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_applies_once() {
    let dir = tempfile::tempdir().unwrap();
    let settings = ClientSettings {
        ready_grace: Duration::from_secs(3),
        ..fast_settings()
    };
    let (client, _received) = connect(dir.path(), Script::default(), settings);

    let started = tokio::time::Instant::now();
    assert!(client.wait_for_ready(Duration::from_secs(5)).await);
    assert!(started.elapsed() >= Duration::from_secs(3));

    let again = tokio::time::Instant::now();
    assert!(client.wait_for_ready(Duration::from_secs(5)).await);
    assert!(again.elapsed() < Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn test_every_waiter_observes_grace() {
    let dir = tempfile::tempdir().unwrap();
    let settings = ClientSettings {
        ready_grace: Duration::from_secs(2),
        ..fast_settings()
    };
    let (client, _received) = connect(dir.path(), Script::default(), settings);

    let started = tokio::time::Instant::now();
    let mut waiters = tokio::task::JoinSet::new();
    for _ in 0..4 {
        let client = Arc::clone(&client);
        waiters.spawn(async move {
            let ready = client.wait_for_ready(Duration::from_secs(5)).await;
            (ready, started.elapsed())
        });
    }
    while let Some(joined) = waiters.join_next().await {
        let (ready, waited) = joined.unwrap();
        assert!(ready);
        assert!(waited >= Duration::from_secs(2), "returned after {waited:?}");
    }
}

#[tokio::test]
async fn test_failed_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script { initialize: InitializeReply::Error, ..Script::default() };
    let (client, received) = connect(dir.path(), script, fast_settings());

    assert!(!client.wait_for_ready(Duration::from_secs(5)).await);
    assert_eq!(client.state(), ClientState::Failed);
    assert!(!client.is_usable());

    let path = dir.path().join("main.go");
    assert!(matches!(client.open_document(&path, "package main").await, Err(LspError::NotReady)));
    assert!(matches!(client.goto_definition(&path, 0, 0).await, Err(LspError::NotReady)));
    assert_eq!(received.count("initialized"), 0);
}

#[tokio::test]
async fn test_query_before_ready_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (client, received) = connect(dir.path(), Script::default(), fast_settings());

    let err = client.goto_definition(&dir.path().join("main.go"), 0, 0).await.unwrap_err();
    assert!(matches!(err, LspError::NotReady));

    assert!(client.wait_for_ready(Duration::from_secs(5)).await);
    assert_eq!(received.count("textDocument/definition"), 0);
}

#[tokio::test]
async fn test_responses_correlate_through_chatter() {
    let dir = tempfile::tempdir().unwrap();
    let target = file_uri(&dir.path().join("helper.go")).unwrap();
    let answer = target.clone();
    let script = Script {
        chatter: true,
        ..Script::responding(move |method, params| match method {
            "textDocument/definition" => {
                let line = u32::try_from(line_of(params)).unwrap();
                Reply::Result(json!([location(&answer, line + 10, 0)]))
            }
            _ => Reply::Result(Value::Null),
        })
    };
    let (client, received) = connect(dir.path(), script, fast_settings());
    assert!(client.wait_for_ready(Duration::from_secs(5)).await);

    let path = dir.path().join("main.go");
    for line in 1..=3 {
        let found = client.goto_definition(&path, line, 0).await.unwrap();
        assert_eq!(found.uri, target);
        assert_eq!(found.range.start.line, line + 10);
    }

    // initialize plus three queries, each preceded by one server request
    eventually("null replies", || received.replies().len() == 4).await;
    for reply in received.replies() {
        assert!(reply.id.as_ref().and_then(Value::as_str).unwrap().starts_with("srv-"));
        assert!(reply.result.is_none());
        assert!(reply.error.is_none());
    }
}

#[tokio::test]
async fn test_request_params() {
    let dir = tempfile::tempdir().unwrap();
    let (client, received) = connect(dir.path(), Script::default(), fast_settings());
    assert!(client.wait_for_ready(Duration::from_secs(5)).await);

    let path = dir.path().join("main.go");
    let _ = client.goto_definition(&path, 4, 7).await;
    let _ = client.find_references(&path, 2, 1).await;

    let definition = &received.params("textDocument/definition")[0];
    assert_eq!(definition["textDocument"]["uri"], file_uri(&path).unwrap());
    assert_eq!(definition["position"], json!({ "line": 4, "character": 7 }));

    let references = &received.params("textDocument/references")[0];
    assert_eq!(references["position"], json!({ "line": 2, "character": 1 }));
    assert_eq!(references["context"]["includeDeclaration"], true);
}

#[tokio::test]
async fn test_empty_results_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::responding(|method, _| match method {
        "textDocument/references" => Reply::Result(json!([])),
        _ => Reply::Result(Value::Null),
    });
    let (client, _received) = connect(dir.path(), script, fast_settings());
    assert!(client.wait_for_ready(Duration::from_secs(5)).await);

    let path = dir.path().join("main.go");
    let err = client.goto_definition(&path, 0, 0).await.unwrap_err();
    assert!(matches!(err, LspError::NotFound { what: "definition" }));
    assert_eq!(err.to_string(), "no definition found");

    let err = client.find_references(&path, 0, 0).await.unwrap_err();
    assert_eq!(err.to_string(), "no references found");
}

#[tokio::test]
async fn test_server_error_is_surfaced() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::responding(|_, _| Reply::Error(-32601, "method not found"));
    let (client, _received) = connect(dir.path(), script, fast_settings());
    assert!(client.wait_for_ready(Duration::from_secs(5)).await);

    let err = client.goto_implementation(&dir.path().join("api.go"), 3, 5).await.unwrap_err();
    assert!(matches!(err, LspError::Server { code: -32601, .. }));
}

#[tokio::test]
async fn test_location_links_are_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let target = file_uri(&dir.path().join("types.go")).unwrap();
    let answer = target.clone();
    let script = Script::responding(move |_, _| {
        Reply::Result(json!([{
            "targetUri": answer,
            "targetRange": {
                "start": { "line": 8, "character": 0 },
                "end": { "line": 12, "character": 1 }
            },
            "targetSelectionRange": {
                "start": { "line": 8, "character": 5 },
                "end": { "line": 8, "character": 10 }
            }
        }]))
    });
    let (client, _received) = connect(dir.path(), script, fast_settings());
    assert!(client.wait_for_ready(Duration::from_secs(5)).await);

    let found = client.goto_type_definition(&dir.path().join("main.go"), 0, 0).await.unwrap();
    assert_eq!(found.uri, target);
    assert_eq!(found.range.start, Position { line: 8, character: 5 });
}

#[tokio::test]
async fn test_request_timeout_leaves_client_usable() {
    let dir = tempfile::tempdir().unwrap();
    let target = file_uri(&dir.path().join("helper.go")).unwrap();
    let answer = target.clone();
    let script = Script::responding(move |method, _| match method {
        "textDocument/typeDefinition" => Reply::Silent,
        _ => Reply::Result(location(&answer, 1, 0)),
    });
    let settings = ClientSettings {
        request_timeout: Duration::from_millis(200),
        ..fast_settings()
    };
    let (client, _received) = connect(dir.path(), script, settings);
    assert!(client.wait_for_ready(Duration::from_secs(5)).await);

    let path = dir.path().join("main.go");
    let err = client.goto_type_definition(&path, 0, 0).await.unwrap_err();
    assert!(matches!(
        err,
        LspError::Timeout { ref method, .. } if method == "textDocument/typeDefinition"
    ));

    let found = client.goto_definition(&path, 0, 0).await.unwrap();
    assert_eq!(found.uri, target);
    assert!(client.is_ready());
}

#[tokio::test]
async fn test_late_response_is_not_taken_for_the_next() {
    let dir = tempfile::tempdir().unwrap();
    let first = file_uri(&dir.path().join("first.go")).unwrap();
    let second = file_uri(&dir.path().join("second.go")).unwrap();
    let calls = AtomicUsize::new(0);
    let (early, late) = (first.clone(), second.clone());
    let script = Script::responding(move |method, _| match method {
        "textDocument/definition" if calls.fetch_add(1, Ordering::SeqCst) == 0 => {
            Reply::Late(json!([location(&early, 1, 0)]))
        }
        "textDocument/definition" => Reply::Result(json!([location(&late, 2, 0)])),
        _ => Reply::Result(Value::Null),
    });
    let settings = ClientSettings {
        request_timeout: Duration::from_millis(200),
        ..fast_settings()
    };
    let (client, received) = connect(dir.path(), script, settings);
    assert!(client.wait_for_ready(Duration::from_secs(5)).await);

    let path = dir.path().join("main.go");
    let err = client.goto_definition(&path, 0, 0).await.unwrap_err();
    assert!(matches!(err, LspError::Timeout { .. }), "got {err:?}");

    // the reply to the first query arrives while the second one waits
    let found = client.goto_definition(&path, 0, 0).await.unwrap();
    assert_eq!(found.uri, second);
    assert_eq!(found.range.start.line, 2);
    assert_eq!(received.count("textDocument/definition"), 2);
    assert!(client.is_ready());
}

#[tokio::test]
async fn test_server_exit_closes_client() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script { hang_up_after: Some("initialized"), ..Script::default() };
    let (client, _received) = connect(dir.path(), script, fast_settings());

    eventually("client to notice the exit", || client.state() == ClientState::Closed).await;
    assert!(!client.is_usable());
    assert!(!client.wait_for_ready(Duration::from_secs(5)).await);

    let err = client.goto_definition(&dir.path().join("main.go"), 0, 0).await.unwrap_err();
    assert!(matches!(err, LspError::NotReady), "got {err:?}");

    client.close().await;
}

#[tokio::test]
async fn test_opens_before_ready_are_deferred() {
    let dir = tempfile::tempdir().unwrap();
    let (client, received) = connect(dir.path(), Script::default(), fast_settings());

    let main = dir.path().join("main.go");
    assert!(client.open_document(&main, "package main\n").await.unwrap());
    assert!(!client.open_document(&main, "package main\n").await.unwrap());

    assert!(client.wait_for_ready(Duration::from_secs(5)).await);
    eventually("deferred didOpen", || received.count("textDocument/didOpen") == 1).await;
    assert_eq!(received.methods()[..3], ["initialize", "initialized", "textDocument/didOpen"]);

    let opened = &received.params("textDocument/didOpen")[0]["textDocument"];
    assert_eq!(opened["uri"], file_uri(&main).unwrap());
    assert_eq!(opened["languageId"], "go");
    assert_eq!(opened["version"], 1);
    assert_eq!(opened["text"], "package main\n");

    let helper = dir.path().join("helper.go");
    assert!(client.open_document(&helper, "package main\n").await.unwrap());
    assert!(!client.open_document(&main, "package main\n").await.unwrap());
    eventually("second didOpen", || received.count("textDocument/didOpen") == 2).await;
}

#[tokio::test]
async fn test_connection_closed_mid_request() {
    let dir = tempfile::tempdir().unwrap();
    let (client_end, server_end) = tokio::io::duplex(1 << 16);
    let (client_read, client_write) = tokio::io::split(client_end);

    // Answers the handshake, then hangs up on the first query.
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(server_end);
        let mut reader = BufReader::new(read);
        let init = read_message(&mut reader).await.unwrap().unwrap();
        let reply = json!({
            "jsonrpc": "2.0",
            "id": init.message.id,
            "result": { "capabilities": {} }
        });
        write_message(&mut write, &reply).await.unwrap();
        let _initialized = read_message(&mut reader).await.unwrap();
        let _query = read_message(&mut reader).await.unwrap();
    });

    let client = LspClient::connect(
        "fake-ls",
        dir.path(),
        Transport { reader: BufReader::new(client_read), writer: client_write, process: None },
        Arc::new(Transcript::disabled()),
        fast_settings(),
    );
    assert!(client.wait_for_ready(Duration::from_secs(5)).await);

    let err = client
        .first_location(QueryKind::Definition, &dir.path().join("main.go"), Position::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LspError::ConnectionClosed), "got {err:?}");
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (client, _received) = connect(dir.path(), Script::default(), fast_settings());
    assert!(client.wait_for_ready(Duration::from_secs(5)).await);

    client.close().await;
    assert_eq!(client.state(), ClientState::Closed);
    assert!(!client.is_usable());
    assert!(!client.wait_for_ready(Duration::from_secs(5)).await);

    let err = client.goto_definition(&dir.path().join("main.go"), 0, 0).await.unwrap_err();
    assert!(matches!(err, LspError::NotReady));

    client.close().await;
}

#[tokio::test]
async fn test_open_workspace_sends_each_document_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.go"), "package main\n").unwrap();
    std::fs::write(dir.path().join("helper.go"), "package main\n").unwrap();
    std::fs::write(dir.path().join("notes.md"), "# notes\n").unwrap();
    let (client, received) = connect(dir.path(), Script::default(), fast_settings());

    let main = dir.path().join("main.go");
    let extensions = vec!["go".to_string()];
    let first = open_workspace(&client, extensions.clone(), &main, 100).await.unwrap();
    assert_eq!(first, OpenedDocuments { found: 2, opened: 2 });

    assert!(client.wait_for_ready(Duration::from_secs(5)).await);
    let again = open_workspace(&client, extensions, &main, 100).await.unwrap();
    assert_eq!(again, OpenedDocuments { found: 2, opened: 0 });

    eventually("both didOpens", || received.count("textDocument/didOpen") == 2).await;
    let opened = received.params("textDocument/didOpen");
    assert_eq!(opened[0]["textDocument"]["uri"], file_uri(&main).unwrap());
}
