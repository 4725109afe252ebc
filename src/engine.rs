//! Render engine seam.
//!
//! A [`RenderEngine`] produces markup progressively into a [`RenderSink`].
//! It signals once that the shell is committable, may report recoverable
//! errors at any point, and returns `Err` to fail the render outright.
//! The controller decides what each of those means for the response.

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, Uri};
use tokio::sync::mpsc;
use tracing::warn;

use crate::scope::RenderScope;

/// Errors raised by a render engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// A component failed while rendering.
    #[error("component '{component}' failed: {message}")]
    Component {
        /// Component name.
        component: String,
        /// Failure description.
        message: String,
    },
    /// The response side stopped accepting output.
    #[error("render cancelled: output receiver closed")]
    Cancelled,
}

impl RenderError {
    /// Shorthand for [`RenderError::Component`].
    pub fn component(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Inbound request identity handed to the engine.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// HTTP method.
    pub method: Method,
    /// Request URI.
    pub uri: Uri,
    /// Request headers.
    pub headers: HeaderMap,
}

impl RenderRequest {
    /// `GET` request for `uri` with no headers.
    pub fn get(uri: Uri) -> Self {
        Self {
            method: Method::GET,
            uri,
            headers: HeaderMap::new(),
        }
    }
}

/// Signals flowing from the render task to the controller.
#[derive(Debug)]
pub(crate) enum RenderEvent {
    Chunk(String),
    ShellReady,
    Error(RenderError),
    Finished(Result<(), RenderError>),
}

/// Output side handed to a [`RenderEngine`].
#[derive(Debug)]
pub struct RenderSink {
    tx: mpsc::Sender<RenderEvent>,
    shell_signalled: bool,
}

impl RenderSink {
    pub(crate) fn new(tx: mpsc::Sender<RenderEvent>) -> Self {
        Self {
            tx,
            shell_signalled: false,
        }
    }

    /// Emit a chunk of markup.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Cancelled`] when the controller has gone away.
    pub async fn push(&mut self, chunk: impl Into<String>) -> Result<(), RenderError> {
        self.send(RenderEvent::Chunk(chunk.into())).await
    }

    /// Mark everything pushed so far as the committable shell.
    ///
    /// Only the first call has an effect.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Cancelled`] when the controller has gone away.
    pub async fn shell_ready(&mut self) -> Result<(), RenderError> {
        if self.shell_signalled {
            warn!("shell_ready signalled more than once, ignoring");
            return Ok(());
        }
        self.shell_signalled = true;
        self.send(RenderEvent::ShellReady).await
    }

    /// Report a recoverable error without stopping the render.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Cancelled`] when the controller has gone away.
    pub async fn report_error(&mut self, err: RenderError) -> Result<(), RenderError> {
        self.send(RenderEvent::Error(err)).await
    }

    pub(crate) async fn finish(self, result: Result<(), RenderError>) {
        // The controller may already have stopped listening; nothing to do then.
        let _ = self.tx.send(RenderEvent::Finished(result)).await;
    }

    async fn send(&self, event: RenderEvent) -> Result<(), RenderError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| RenderError::Cancelled)
    }
}

/// Progressive HTML producer.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Render `request` into `sink`, reading the nonce from `scope`.
    ///
    /// Must call [`RenderSink::shell_ready`] once the shell is complete.
    /// Returning `Err` before that point fails the request; after it, the
    /// error is logged and the stream is closed.
    async fn render(
        &self,
        request: &RenderRequest,
        scope: &RenderScope,
        sink: &mut RenderSink,
    ) -> Result<(), RenderError>;
}
