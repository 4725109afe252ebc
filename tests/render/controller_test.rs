//! Tests for `src/controller.rs` — commit ordering, errors and the deadline.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode, Uri};

use nonceshell::controller::{
    ControllerError, ControllerOptions, RenderController, RenderOutcome, RenderState,
};
use nonceshell::csp;
use nonceshell::document::{route_headers, DocumentEngine, DocumentOptions};
use nonceshell::engine::{RenderEngine, RenderError, RenderRequest, RenderSink};
use nonceshell::scope::RenderScope;
use nonceshell::verify::{self, is_well_formed, mask_nonce, scripts};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Step {
    Push(&'static str),
    PushNonceScript,
    Shell,
    Report(&'static str),
    Sleep(u64),
    Fail(&'static str),
    Panic,
}

/// Engine that replays a fixed list of steps.
struct ScriptedEngine(Vec<Step>);

#[async_trait]
impl RenderEngine for ScriptedEngine {
    async fn render(
        &self,
        _request: &RenderRequest,
        scope: &RenderScope,
        sink: &mut RenderSink,
    ) -> Result<(), RenderError> {
        for step in &self.0 {
            match step {
                Step::Push(s) => sink.push(*s).await?,
                Step::PushNonceScript => {
                    let nonce = scope.read().map(|n| n.as_str().to_owned());
                    let nonce = nonce.unwrap_or_default();
                    sink.push(format!("<script nonce=\"{nonce}\">ok()</script>"))
                        .await?;
                }
                Step::Shell => sink.shell_ready().await?,
                Step::Report(msg) => sink.report_error(RenderError::component("step", *msg)).await?,
                Step::Sleep(ms) => tokio::time::sleep(Duration::from_millis(*ms)).await,
                Step::Fail(msg) => return Err(RenderError::component("step", *msg)),
                Step::Panic => panic!("engine bug"),
            }
        }
        Ok(())
    }
}

fn scripted(steps: Vec<Step>) -> RenderController {
    RenderController::new(Arc::new(ScriptedEngine(steps)), ControllerOptions::default())
}

fn document_controller(options: DocumentOptions) -> RenderController {
    RenderController::new(
        Arc::new(DocumentEngine::new(options)),
        ControllerOptions::default(),
    )
}

fn request(path: &'static str) -> RenderRequest {
    RenderRequest::get(Uri::from_static(path))
}

fn header_nonce(headers: &HeaderMap) -> String {
    let value = headers
        .get(csp::HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .expect("CSP header should be present");
    csp::extract_nonce(value)
        .expect("CSP header should carry a nonce")
        .to_owned()
}

// ---------------------------------------------------------------------------
// Scenario A: shell ready before the deadline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_commits_csp_matching_tagged_script() {
    let options = DocumentOptions::default();
    let controller = document_controller(options.clone());
    let response = controller
        .handle(request("/"), StatusCode::OK, route_headers(&options))
        .await
        .expect("render should commit");

    assert_eq!(response.status(), StatusCode::OK);
    let (status, headers, body, outcome) = response.collect().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome, RenderOutcome::Completed);
    assert_eq!(
        headers.get("content-type").and_then(|v| v.to_str().ok()),
        Some("text/html")
    );
    assert!(headers.contains_key("cross-origin-embedder-policy"));

    let nonce = header_nonce(&headers);
    assert!(is_well_formed(&nonce));
    assert_eq!(
        headers.get(csp::HEADER_NAME).and_then(|v| v.to_str().ok()),
        Some(
            format!("script-src 'nonce-{nonce}' 'strict-dynamic'; object-src 'none'; base-uri 'none';")
                .as_str()
        )
    );

    let relayed: Vec<_> = scripts(&body).into_iter().filter(|s| s.is_relayed()).collect();
    assert_eq!(relayed.len(), 2);
    let tagged: Vec<_> = relayed.iter().filter_map(|s| s.nonce.clone()).collect();
    assert_eq!(tagged, vec![nonce.clone()]);

    let report = verify::check(&headers, &body).expect("response should satisfy invariants");
    assert_eq!(report.header_nonce, nonce);
    assert_eq!(report.relayed_tagged, 1);
    assert_eq!(report.relayed_untagged, 1);
}

#[tokio::test]
async fn header_nonce_equals_nonce_read_inside_render() {
    let controller = scripted(vec![
        Step::PushNonceScript,
        Step::Shell,
        Step::PushNonceScript,
    ]);
    let response = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await
        .expect("render should commit");
    let (_, headers, body, _) = response.collect().await;

    let nonce = header_nonce(&headers);
    let found = scripts(&body);
    assert_eq!(found.len(), 2);
    for script in found {
        assert_eq!(script.nonce.as_deref(), Some(nonce.as_str()));
    }
}

#[tokio::test]
async fn caller_headers_are_kept_and_status_passed_through() {
    let mut headers = HeaderMap::new();
    headers.insert("x-route", "kept".parse().expect("valid header value"));
    let controller = scripted(vec![Step::Push("<p>"), Step::Shell]);

    let response = controller
        .handle(request("/"), StatusCode::NOT_FOUND, headers)
        .await
        .expect("render should commit");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get("x-route").and_then(|v| v.to_str().ok()),
        Some("kept")
    );
}

// ---------------------------------------------------------------------------
// Scenario B: failure before the shell
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_b_shell_error_rejects_request() {
    let controller = scripted(vec![Step::Push("<html>"), Step::Fail("boom")]);
    let result = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await;

    match result {
        Err(ControllerError::Shell(RenderError::Component { message, .. })) => {
            assert_eq!(message, "boom");
        }
        other => panic!("expected shell error, got {other:?}"),
    }
}

#[tokio::test]
async fn engine_panic_before_shell_rejects_request() {
    let controller = scripted(vec![Step::Push("<html>"), Step::Panic]);
    let result = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await;
    assert!(matches!(result, Err(ControllerError::EngineVanished)));
}

#[tokio::test]
async fn reported_error_before_shell_commits_500() {
    let controller = scripted(vec![
        Step::Report("data fetch failed"),
        Step::Push("<html>"),
        Step::Shell,
        Step::Push("</html>"),
    ]);
    let response = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await
        .expect("reported errors do not reject the request");

    let (status, _, body, outcome) = response.collect().await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "<html></html>");
    assert_eq!(outcome.state(), RenderState::Errored);
}

// ---------------------------------------------------------------------------
// Errors after commit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn post_shell_failure_keeps_committed_status() {
    let controller = scripted(vec![
        Step::Push("<a>"),
        Step::Shell,
        Step::Push("<b>"),
        Step::Fail("late"),
    ]);
    let response = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await
        .expect("render should commit");

    let (status, _, body, outcome) = response.collect().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<a><b>");
    assert_eq!(
        outcome,
        RenderOutcome::Errored {
            errors: vec![RenderError::component("step", "late")],
        }
    );
}

#[tokio::test]
async fn post_shell_reported_error_keeps_streaming() {
    let controller = scripted(vec![
        Step::Push("a"),
        Step::Shell,
        Step::Report("widget"),
        Step::Push("b"),
    ]);
    let response = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await
        .expect("render should commit");

    let (status, _, body, outcome) = response.collect().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ab");
    assert_eq!(outcome.state(), RenderState::Errored);
}

// ---------------------------------------------------------------------------
// Shell signalling edge cases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completion_without_shell_signal_commits_everything() {
    let controller = scripted(vec![Step::Push("x"), Step::Push("y")]);
    let response = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await
        .expect("render should commit");

    let (status, headers, body, outcome) = response.collect().await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key(csp::HEADER_NAME));
    assert_eq!(body, "xy");
    assert_eq!(outcome, RenderOutcome::Completed);
}

#[tokio::test]
async fn repeated_shell_signal_is_ignored() {
    let controller = scripted(vec![
        Step::Push("a"),
        Step::Shell,
        Step::Push("b"),
        Step::Shell,
        Step::Push("c"),
    ]);
    let response = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await
        .expect("render should commit");

    let (_, _, body, outcome) = response.collect().await;
    assert_eq!(body, "abc");
    assert_eq!(outcome, RenderOutcome::Completed);
}

// ---------------------------------------------------------------------------
// Scenario C: deadline
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn scenario_c_deadline_truncates_stream() {
    let controller = scripted(vec![
        Step::Push("<html>"),
        Step::Shell,
        Step::Push("<p>early</p>"),
        Step::Sleep(10_000),
        Step::Push("<p>late</p>"),
    ]);
    let response = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await
        .expect("render should commit");

    let (status, _, body, outcome) = response.collect().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<html><p>early</p>");
    assert_eq!(outcome, RenderOutcome::Aborted);
}

#[tokio::test(start_paused = true)]
async fn deadline_keeps_errors_reported_after_commit() {
    let controller = scripted(vec![
        Step::Push("<a>"),
        Step::Shell,
        Step::Report("widget"),
        Step::Push("<b>"),
        Step::Sleep(10_000),
        Step::Push("<c>"),
    ]);
    let response = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await
        .expect("render should commit");

    let (status, _, body, outcome) = response.collect().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<a><b>");
    match outcome {
        RenderOutcome::Errored { errors } => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0], RenderError::component("step", "widget"));
        }
        other => panic!("reported error was dropped at the deadline: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_before_shell_rejects_request() {
    let controller = scripted(vec![Step::Push("<html>"), Step::Sleep(10_000), Step::Shell]);
    let result = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await;
    assert!(matches!(
        result,
        Err(ControllerError::ShellTimeout { after_ms: 5_000 })
    ));
}

#[tokio::test(start_paused = true)]
async fn deadline_is_not_renewed_by_progress() {
    let controller = scripted(vec![
        Step::Shell,
        Step::Sleep(2_000),
        Step::Push("1"),
        Step::Sleep(2_000),
        Step::Push("2"),
        Step::Sleep(2_000),
        Step::Push("3"),
    ]);
    let response = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await
        .expect("render should commit");

    let (_, _, body, outcome) = response.collect().await;
    assert_eq!(body, "12");
    assert_eq!(outcome, RenderOutcome::Aborted);
}

#[tokio::test(start_paused = true)]
async fn render_finishing_early_completes() {
    let controller = scripted(vec![Step::Shell, Step::Sleep(4_000), Step::Push("done")]);
    let response = controller
        .handle(request("/"), StatusCode::OK, HeaderMap::new())
        .await
        .expect("render should commit");

    let (_, _, body, outcome) = response.collect().await;
    assert_eq!(body, "done");
    assert_eq!(outcome, RenderOutcome::Completed);
}

// ---------------------------------------------------------------------------
// Across requests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn distinct_requests_get_distinct_nonces() {
    let controller = document_controller(DocumentOptions::default());
    let mut seen = HashSet::new();
    for _ in 0..20 {
        let response = controller
            .handle(request("/"), StatusCode::OK, HeaderMap::new())
            .await
            .expect("render should commit");
        assert!(seen.insert(header_nonce(response.headers())));
    }
}

#[tokio::test]
async fn same_route_renders_identically_modulo_nonce() {
    let controller = document_controller(DocumentOptions::default());
    let mut masked = Vec::new();
    for _ in 0..2 {
        let response = controller
            .handle(request("/same"), StatusCode::OK, HeaderMap::new())
            .await
            .expect("render should commit");
        let (_, headers, body, _) = response.collect().await;
        masked.push(mask_nonce(&body, &header_nonce(&headers)));
    }
    assert_eq!(masked[0], masked[1]);
    assert!(!masked[0].is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_renders_never_share_nonces() {
    let controller = document_controller(DocumentOptions {
        suspense_delay: Duration::from_millis(2),
        ..DocumentOptions::default()
    });

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let response = controller
                    .handle(request("/"), StatusCode::OK, HeaderMap::new())
                    .await
                    .expect("render should commit");
                let (_, headers, body, _) = response.collect().await;
                (headers, body)
            })
        })
        .collect();

    let mut nonces = HashSet::new();
    for task in tasks {
        let (headers, body) = task.await.expect("render task should not panic");
        let report = verify::check(&headers, &body).expect("each response self-consistent");
        assert!(nonces.insert(report.header_nonce));
    }
    assert_eq!(nonces.len(), 16);
}
