//! Streaming render controller.
//!
//! Drives one request through
//! `Idle → Rendering → ShellReady → Streaming → {Completed | Errored | Aborted}`.
//!
//! The nonce is minted once per request and lives in a single
//! [`RenderScope`]. The CSP header is built from that same scope when the
//! shell is committed, so header and body can never disagree. Status and
//! headers are fixed at commit; the body follows through a channel.
//!
//! A deadline starts with the render and is never extended. If it fires
//! before the shell is ready the request is rejected. If it fires while
//! streaming, the render task is aborted and the body simply ends.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::csp;
use crate::engine::{RenderEngine, RenderError, RenderEvent, RenderRequest, RenderSink};
use crate::nonce::{Nonce, NonceError};
use crate::scope::RenderScope;

/// Wall-clock budget for a single render.
pub const DEFAULT_ABORT_AFTER: Duration = Duration::from_secs(5);

/// Default buffer between the render task and the response body.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

// ── State machine ───────────────────────────────────────────────

/// Lifecycle of one request's render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    /// Request received, nothing started.
    Idle,
    /// Render running, no output committed.
    Rendering,
    /// Shell complete; status and headers are being fixed.
    ShellReady,
    /// Body is flowing to the client.
    Streaming,
    /// Render finished without errors.
    Completed,
    /// Render failed, before or after commit.
    Errored,
    /// Deadline reached.
    Aborted,
}

impl RenderState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Aborted)
    }

    /// Whether `self → next` is a legal step.
    pub fn can_transition_to(self, next: RenderState) -> bool {
        use RenderState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Idle, Rendering)
                | (Rendering, ShellReady)
                | (Rendering, Errored)
                | (ShellReady, Streaming)
                | (ShellReady, Errored)
                | (Streaming, Completed)
                | (Streaming, Errored)
                | (_, Aborted)
        )
    }
}

/// Illegal state machine step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid render transition {from:?} -> {to:?}")]
pub struct TransitionError {
    /// State before the attempted step.
    pub from: RenderState,
    /// Rejected target state.
    pub to: RenderState,
}

/// Tracks and validates render state transitions.
#[derive(Debug)]
pub struct StateMachine {
    state: RenderState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Machine in [`RenderState::Idle`].
    pub fn new() -> Self {
        Self {
            state: RenderState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> RenderState {
        self.state
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the step is not legal.
    pub fn advance(&mut self, next: RenderState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        debug!(from = ?self.state, to = ?next, "render state transition");
        self.state = next;
        Ok(())
    }
}

// ── Errors and outcomes ─────────────────────────────────────────

/// Failures that reject a request before anything is sent.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// No nonce could be minted.
    #[error(transparent)]
    Nonce(#[from] NonceError),
    /// The engine failed before the shell was ready.
    #[error("shell render failed: {0}")]
    Shell(RenderError),
    /// The deadline fired before the shell was ready.
    #[error("render aborted after {after_ms}ms before the shell was ready")]
    ShellTimeout {
        /// Deadline in milliseconds.
        after_ms: u64,
    },
    /// The render task ended without reporting a result.
    #[error("render task ended unexpectedly")]
    EngineVanished,
    /// A response header could not be encoded.
    #[error("invalid response header: {0}")]
    InvalidHeader(String),
    /// Internal state machine misuse.
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// How a committed response ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Everything streamed, no errors reported.
    Completed,
    /// Errors were reported; the committed status was left unchanged.
    Errored {
        /// Errors in the order they were reported.
        errors: Vec<RenderError>,
    },
    /// The deadline cut the stream short with no errors reported. Bytes
    /// already sent stand.
    Aborted,
}

impl RenderOutcome {
    /// Terminal state matching this outcome.
    pub fn state(&self) -> RenderState {
        match self {
            Self::Completed => RenderState::Completed,
            Self::Errored { .. } => RenderState::Errored,
            Self::Aborted => RenderState::Aborted,
        }
    }

    fn from_errors(errors: Vec<RenderError>) -> Self {
        if errors.is_empty() {
            Self::Completed
        } else {
            Self::Errored { errors }
        }
    }
}

/// Resolves once the body stream has ended.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<RenderOutcome>);

impl Completion {
    /// Wait for the final outcome.
    ///
    /// If the streaming task was torn down without reporting (runtime
    /// shutdown), the render counts as aborted.
    pub async fn wait(self) -> RenderOutcome {
        self.0.await.unwrap_or(RenderOutcome::Aborted)
    }
}

// ── Response ────────────────────────────────────────────────────

/// A committed response: fixed status and headers plus a streaming body.
#[derive(Debug)]
pub struct StreamingResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: mpsc::Receiver<String>,
    completion: Completion,
}

impl StreamingResponse {
    /// Committed status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Committed headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Split into head, body stream and completion handle.
    pub fn into_parts(self) -> (StatusCode, HeaderMap, ReceiverStream<String>, Completion) {
        (
            self.status,
            self.headers,
            ReceiverStream::new(self.body),
            self.completion,
        )
    }

    /// Drain the body and wait for the outcome.
    pub async fn collect(self) -> (StatusCode, HeaderMap, String, RenderOutcome) {
        let mut body = self.body;
        let mut out = String::new();
        while let Some(chunk) = body.recv().await {
            out.push_str(&chunk);
        }
        let outcome = self.completion.wait().await;
        (self.status, self.headers, out, outcome)
    }
}

// ── Render task ─────────────────────────────────────────────────

/// Owns the spawned render and its deadline together.
///
/// Dropping the handle aborts the render task and clears the timer.
struct RenderTask {
    handle: JoinHandle<()>,
    deadline: Pin<Box<Sleep>>,
}

impl RenderTask {
    fn spawn(
        engine: Arc<dyn RenderEngine>,
        request: RenderRequest,
        scope: Arc<RenderScope>,
        events: mpsc::Sender<RenderEvent>,
        abort_after: Duration,
    ) -> Self {
        let deadline = Box::pin(tokio::time::sleep(abort_after));
        let handle = tokio::spawn(
            async move {
                let mut sink = RenderSink::new(events);
                let result = engine.render(&request, &scope, &mut sink).await;
                sink.finish(result).await;
            }
            .instrument(Span::current()),
        );
        Self { handle, deadline }
    }

    fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for RenderTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ── Controller ──────────────────────────────────────────────────

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Hard deadline measured from render start.
    pub abort_after: Duration,
    /// Event and body channel capacity.
    pub channel_capacity: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            abort_after: DEFAULT_ABORT_AFTER,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Turns requests into streaming responses through a [`RenderEngine`].
#[derive(Clone)]
pub struct RenderController {
    engine: Arc<dyn RenderEngine>,
    options: ControllerOptions,
}

impl std::fmt::Debug for RenderController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderController")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

struct Shell {
    chunks: Vec<String>,
    errors: Vec<RenderError>,
    finished: Option<Result<(), RenderError>>,
}

impl RenderController {
    /// Controller over `engine`.
    pub fn new(engine: Arc<dyn RenderEngine>, options: ControllerOptions) -> Self {
        Self { engine, options }
    }

    /// Render `request`, resolving once the shell is committed.
    ///
    /// `status` and `headers` are the caller's defaults. The status becomes
    /// 500 if the engine reported an error before the shell was ready.
    ///
    /// # Errors
    ///
    /// Any [`ControllerError`] means nothing was sent and the caller must
    /// choose a fallback response.
    pub async fn handle(
        &self,
        request: RenderRequest,
        status: StatusCode,
        headers: HeaderMap,
    ) -> Result<StreamingResponse, ControllerError> {
        let span = info_span!(
            "render",
            request_id = %Uuid::new_v4(),
            method = %request.method,
            path = %request.uri.path(),
        );
        self.handle_in_span(request, status, headers)
            .instrument(span)
            .await
    }

    async fn handle_in_span(
        &self,
        request: RenderRequest,
        status: StatusCode,
        mut headers: HeaderMap,
    ) -> Result<StreamingResponse, ControllerError> {
        let started = Instant::now();
        let capacity = self.options.channel_capacity.max(1);
        let mut machine = StateMachine::new();

        let scope = Arc::new(RenderScope::bound(Nonce::generate()?));
        let (event_tx, mut events) = mpsc::channel(capacity);
        machine.advance(RenderState::Rendering)?;
        let mut task = RenderTask::spawn(
            Arc::clone(&self.engine),
            request,
            Arc::clone(&scope),
            event_tx,
            self.options.abort_after,
        );

        let shell = match self.await_shell(&mut task, &mut events).await {
            Ok(shell) => shell,
            Err(e) => {
                let terminal = if matches!(e, ControllerError::ShellTimeout { .. }) {
                    RenderState::Aborted
                } else {
                    RenderState::Errored
                };
                machine.advance(terminal)?;
                task.abort();
                warn!(error = %e, "render rejected before shell");
                return Err(e);
            }
        };
        machine.advance(RenderState::ShellReady)?;

        let csp_value = match scope.read() {
            Some(nonce) => csp::build(nonce),
            None => {
                return Err(ControllerError::InvalidHeader(
                    "render scope lost its nonce".to_owned(),
                ))
            }
        };
        drop(scope);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert(
            HeaderName::from_static(csp::HEADER_NAME),
            HeaderValue::from_str(&csp_value)
                .map_err(|e| ControllerError::InvalidHeader(e.to_string()))?,
        );
        let status = if shell.errors.is_empty() {
            status
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        info!(
            status = status.as_u16(),
            shell_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "shell ready, response committed"
        );

        let (body_tx, body_rx) = mpsc::channel(capacity);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(
            stream_body(machine, task, events, shell, body_tx, outcome_tx, started)
                .instrument(Span::current()),
        );

        Ok(StreamingResponse {
            status,
            headers,
            body: body_rx,
            completion: Completion(outcome_rx),
        })
    }

    /// Collect output until the shell is committable.
    async fn await_shell(
        &self,
        task: &mut RenderTask,
        events: &mut mpsc::Receiver<RenderEvent>,
    ) -> Result<Shell, ControllerError> {
        let mut shell = Shell {
            chunks: Vec::new(),
            errors: Vec::new(),
            finished: None,
        };
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(RenderEvent::Chunk(chunk)) => shell.chunks.push(chunk),
                    Some(RenderEvent::ShellReady) => return Ok(shell),
                    Some(RenderEvent::Error(e)) => {
                        error!(error = %e, "render error before shell");
                        shell.errors.push(e);
                    }
                    Some(RenderEvent::Finished(Ok(()))) => {
                        // A render that completes without signalling is all shell.
                        shell.finished = Some(Ok(()));
                        return Ok(shell);
                    }
                    Some(RenderEvent::Finished(Err(e))) => return Err(ControllerError::Shell(e)),
                    None => return Err(ControllerError::EngineVanished),
                },
                () = task.deadline.as_mut() => {
                    return Err(ControllerError::ShellTimeout {
                        after_ms: u64::try_from(self.options.abort_after.as_millis())
                            .unwrap_or(u64::MAX),
                    });
                }
            }
        }
    }
}

/// Forward committed output to the body until the render ends or the
/// deadline fires.
async fn stream_body(
    mut machine: StateMachine,
    mut task: RenderTask,
    mut events: mpsc::Receiver<RenderEvent>,
    shell: Shell,
    body: mpsc::Sender<String>,
    outcome_tx: oneshot::Sender<RenderOutcome>,
    started: Instant,
) {
    if let Err(e) = machine.advance(RenderState::Streaming) {
        error!(error = %e, "cannot start streaming");
    }

    let Shell {
        chunks,
        mut errors,
        finished,
    } = shell;
    let mut client_gone = false;
    let drive = async {
        for chunk in chunks {
            forward(&body, chunk, &mut client_gone).await;
        }
        let result = match finished {
            Some(result) => result,
            None => loop {
                match events.recv().await {
                    Some(RenderEvent::Chunk(chunk)) => {
                        forward(&body, chunk, &mut client_gone).await;
                    }
                    Some(RenderEvent::ShellReady) => {}
                    Some(RenderEvent::Error(e)) => {
                        error!(error = %e, "render error after shell, status already sent");
                        errors.push(e);
                    }
                    Some(RenderEvent::Finished(result)) => break result,
                    None => {
                        break Err(RenderError::component(
                            "render task",
                            "ended without reporting a result",
                        ))
                    }
                }
            },
        };
        if let Err(e) = result {
            error!(error = %e, "render failed after shell, status already sent");
            errors.push(e);
        }
    };

    let finished_in_time = tokio::select! {
        () = drive => true,
        () = task.deadline.as_mut() => false,
    };
    // Errors reported before the deadline still count as failures.
    let outcome = if finished_in_time {
        RenderOutcome::from_errors(errors)
    } else {
        task.abort();
        warn!(
            reported_errors = errors.len(),
            "render deadline reached, stream terminated"
        );
        if errors.is_empty() {
            RenderOutcome::Aborted
        } else {
            RenderOutcome::Errored { errors }
        }
    };
    drop(task);
    drop(body);

    if let Err(e) = machine.advance(outcome.state()) {
        error!(error = %e, "cannot record render outcome");
    }
    info!(
        outcome = ?outcome.state(),
        duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "render finished"
    );
    // Nobody may be waiting on the outcome.
    let _ = outcome_tx.send(outcome);
}

async fn forward(body: &mpsc::Sender<String>, chunk: String, client_gone: &mut bool) {
    if *client_gone {
        return;
    }
    if body.send(chunk).await.is_err() {
        debug!("client disconnected, draining render without output");
        *client_gone = true;
    }
}
