#[path = "common.rs"]
mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use common::{fast_settings, location, FakeLauncher, InitializeReply, Reply, Script};
use modal_lsp::config::{LanguageRegistry, LanguageServer, PipelineSettings};
use modal_lsp::editor::Editor;
use modal_lsp::lsp::client::{ClientSettings, QueryKind};
use modal_lsp::lsp::pool::LspClientPool;
use modal_lsp::lsp::protocol::file_uri;
use modal_lsp::lsp::server::ServerCommand;
use modal_lsp::pipeline::{Pipeline, PipelineMsg, PipelineStage, Step};

const MAIN_GO: &str = "package main

import \"fmt\"

func main() {
\tfmt.Println(\"start\")
\tgreeting := \"😀\"; Helper(greeting)
}
";

const HELPER_GO: &str = "package main

func 🎉Helper(s string) {
\tprintln(s)
}
";

/// A Go workspace: `go.mod`, `main.go`, `helper.go`.
fn go_workspace() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("go.mod"), "module example.com/demo\n").unwrap();
    std::fs::write(dir.path().join("main.go"), MAIN_GO).unwrap();
    std::fs::write(dir.path().join("helper.go"), HELPER_GO).unwrap();
    dir
}

fn go_registry() -> LanguageRegistry {
    let mut registry = LanguageRegistry::default();
    registry.register(LanguageServer {
        language: "Go".to_string(),
        extensions: vec!["go".to_string()],
        server: ServerCommand::new("fake-ls", "fake-ls", &[]),
    });
    registry
}

fn pipeline_with(
    launcher: FakeLauncher,
    client: ClientSettings,
    settings: PipelineSettings,
) -> (Pipeline, UnboundedReceiver<PipelineMsg>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = Arc::new(LspClientPool::with_launcher(client, launcher));
    (Pipeline::new(pool, go_registry(), settings, tx), rx)
}

/// Points the cursor at `Helper` on line 6 of main.go.
fn editor_at_helper_call(root: &Path) -> Editor {
    let mut editor = Editor::new();
    editor.open(&root.join("main.go")).unwrap();
    let column = MAIN_GO.lines().nth(6).unwrap().chars().position(|c| c == 'H').unwrap();
    editor.current_buffer_mut().unwrap().set_cursor(6, column);
    editor
}

fn definition_in(helper: PathBuf) -> Script {
    let uri = file_uri(&helper).unwrap();
    Script::responding(move |method, _| match method {
        // "func " is 5 code units, the emoji 2 more
        "textDocument/definition" => Reply::Result(json!([location(&uri, 2, 7)])),
        _ => Reply::Result(Value::Null),
    })
}

#[tokio::test]
async fn test_definition_jump_end_to_end() {
    let workspace = go_workspace();
    let root = workspace.path();
    let launcher = FakeLauncher::new(definition_in(root.join("helper.go")));
    let (pipeline, mut rx) =
        pipeline_with(launcher.clone(), fast_settings(), PipelineSettings::default());

    let mut editor = editor_at_helper_call(root);
    let landed = editor
        .run_query(&pipeline, &mut rx, QueryKind::Definition)
        .await
        .expect("query produced no result")
        .expect("jump failed");

    assert_eq!(landed.path, root.join("helper.go"));
    assert_eq!((landed.line, landed.column), (2, 6));
    let buffer = editor.current_buffer().unwrap();
    assert_eq!(buffer.path(), root.join("helper.go"));
    assert_eq!(buffer.cursor(), (2, 6));
    assert!(!editor.is_loading());
    assert_eq!(
        editor.transitions(),
        [
            PipelineStage::Init,
            PipelineStage::OpenFiles,
            PipelineStage::AwaitReady,
            PipelineStage::Query,
            PipelineStage::Result,
        ]
    );

    let received = launcher.received.lock().unwrap()[0].clone();
    let query = &received.params("textDocument/definition")[0];
    let main_uri = file_uri(&root.join("main.go")).unwrap();
    assert_eq!(query["textDocument"]["uri"], main_uri);
    // the smiley before the cursor is one code point but two UTF-16 units
    let column = MAIN_GO.lines().nth(6).unwrap().chars().position(|c| c == 'H').unwrap();
    assert_eq!(query["position"], json!({ "line": 6, "character": column + 1 }));

    let opened = received.params("textDocument/didOpen");
    assert_eq!(opened.len(), 2);
    assert_eq!(opened[0]["textDocument"]["uri"], main_uri);
    let methods = received.methods();
    let last_open = methods.iter().rposition(|m| m == "textDocument/didOpen").unwrap();
    let query_at = methods.iter().position(|m| m == "textDocument/definition").unwrap();
    assert!(last_open < query_at);

    pipeline.pool().close_all().await;
}

#[tokio::test]
async fn test_second_query_reuses_client() {
    let workspace = go_workspace();
    let root = workspace.path();
    let launcher = FakeLauncher::new(definition_in(root.join("helper.go")));
    let (pipeline, mut rx) =
        pipeline_with(launcher.clone(), fast_settings(), PipelineSettings::default());

    let mut editor = editor_at_helper_call(root);
    assert!(editor.run_query(&pipeline, &mut rx, QueryKind::Definition).await.unwrap().is_ok());
    let mut editor = editor_at_helper_call(root);
    assert!(editor.run_query(&pipeline, &mut rx, QueryKind::Definition).await.unwrap().is_ok());

    assert_eq!(launcher.launches(), 1);
    let received = launcher.received.lock().unwrap()[0].clone();
    assert_eq!(received.count("initialize"), 1);
    assert_eq!(received.count("textDocument/didOpen"), 2);
    assert_eq!(received.count("textDocument/definition"), 2);

    pipeline.pool().close_all().await;
}

#[tokio::test]
async fn test_transitions_cover_only_the_latest_query() {
    let workspace = go_workspace();
    let root = workspace.path();
    let launcher = FakeLauncher::new(definition_in(root.join("helper.go")));
    let (pipeline, mut rx) = pipeline_with(launcher, fast_settings(), PipelineSettings::default());

    let mut editor = editor_at_helper_call(root);
    for _ in 0..3 {
        assert!(editor.run_query(&pipeline, &mut rx, QueryKind::Definition).await.unwrap().is_ok());
        assert_eq!(editor.transitions().len(), 5);
        assert_eq!(editor.transitions().first(), Some(&PipelineStage::Init));
    }

    pipeline.pool().close_all().await;
}

#[tokio::test]
async fn test_readiness_timeout_reports_without_moving() {
    let workspace = go_workspace();
    let root = workspace.path();
    let script = Script { initialize: InitializeReply::Silent, ..Script::default() };
    let client = ClientSettings { request_timeout: Duration::from_secs(60), ..fast_settings() };
    let settings =
        PipelineSettings { ready_timeout: Duration::from_millis(200), ..PipelineSettings::default() };
    let (pipeline, mut rx) = pipeline_with(FakeLauncher::new(script), client, settings);

    let mut editor = editor_at_helper_call(root);
    let before = editor.current_buffer().unwrap().cursor();
    let message = editor
        .run_query(&pipeline, &mut rx, QueryKind::Definition)
        .await
        .unwrap()
        .unwrap_err();

    assert!(message.starts_with("LSP server not ready after"), "got {message}");
    assert_eq!(editor.status(), Some(message.as_str()));
    assert_eq!(editor.buffer_count(), 1);
    assert_eq!(editor.current_buffer().unwrap().path(), root.join("main.go"));
    assert_eq!(editor.current_buffer().unwrap().cursor(), before);
    assert_eq!(editor.transitions().last(), Some(&PipelineStage::Result));

    pipeline.pool().close_all().await;
}

#[tokio::test]
async fn test_failed_handshake_ends_query() {
    let workspace = go_workspace();
    let script = Script { initialize: InitializeReply::Error, ..Script::default() };
    let (pipeline, mut rx) =
        pipeline_with(FakeLauncher::new(script), fast_settings(), PipelineSettings::default());

    let mut editor = editor_at_helper_call(workspace.path());
    let message = editor
        .run_query(&pipeline, &mut rx, QueryKind::Implementation)
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(message, "LSP server not ready");

    pipeline.pool().close_all().await;
}

#[tokio::test]
async fn test_advance_never_blocks() {
    let workspace = go_workspace();
    let script = Script { initialize: InitializeReply::Silent, ..Script::default() };
    let client = ClientSettings { request_timeout: Duration::from_secs(60), ..fast_settings() };
    let (pipeline, mut rx) =
        pipeline_with(FakeLauncher::new(script), client, PipelineSettings::default());

    let mut next = pipeline.go_to_definition(&workspace.path().join("main.go"), 6, 0);
    for expected in [PipelineStage::Init, PipelineStage::OpenFiles, PipelineStage::AwaitReady] {
        assert_eq!(next.stage(), expected);
        let started = std::time::Instant::now();
        assert!(matches!(pipeline.advance(next), Step::Pending(stage) if stage == expected));
        assert!(started.elapsed() < Duration::from_millis(50));
        if expected == PipelineStage::AwaitReady {
            break;
        }
        next = rx.recv().await.unwrap();
    }

    pipeline.pool().close_all().await;
}

#[tokio::test]
async fn test_superseded_result_is_ignored() {
    let workspace = go_workspace();
    let root = workspace.path();
    let helper = file_uri(&root.join("helper.go")).unwrap();
    let main = file_uri(&root.join("main.go")).unwrap();
    let script = Script::responding(move |method, _| match method {
        "textDocument/definition" => Reply::Result(location(&helper, 2, 7)),
        _ => Reply::Result(location(&main, 4, 5)),
    });
    let (pipeline, mut rx) =
        pipeline_with(FakeLauncher::new(script), fast_settings(), PipelineSettings::default());

    let mut editor = editor_at_helper_call(root);
    let first = editor.start_query(&pipeline, QueryKind::Definition).unwrap();
    let second = editor.start_query(&pipeline, QueryKind::References).unwrap();
    assert!(editor.update(&pipeline, first).is_none());
    assert!(editor.update(&pipeline, second).is_none());

    let mut results = 0;
    let mut applied = Vec::new();
    while results < 2 {
        let msg = rx.recv().await.unwrap();
        if msg.stage() == PipelineStage::Result {
            results += 1;
        }
        if let Some(outcome) = editor.update(&pipeline, msg) {
            applied.push(outcome);
        }
    }

    assert_eq!(applied.len(), 1);
    let landed = applied.remove(0).unwrap();
    assert_eq!(landed.path, root.join("main.go"));
    assert_eq!((landed.line, landed.column), (4, 5));

    pipeline.pool().close_all().await;
}
