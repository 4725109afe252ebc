//! The verification page and the engine that streams it.
//!
//! The page carries two relayed scripts side by side. The permitted one
//! flips `#script-with-nonce` to `passed` and marks `<body>` as completed.
//! The denied one would overwrite `#script-without-nonce` with `failed`; a
//! browser enforcing the CSP never runs it.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::HeaderMap;
use tracing::debug;

use crate::engine::{RenderEngine, RenderError, RenderRequest, RenderSink};
use crate::markup::{render_to_string, Element, Node, ScriptKind, ScriptTag};
use crate::relay::RelayBootstrap;
use crate::scope::RenderScope;

/// Marker element updated by the permitted script.
pub const WITH_NONCE_ID: &str = "script-with-nonce";

/// Marker element the denied script would overwrite.
pub const WITHOUT_NONCE_ID: &str = "script-without-nonce";

const PERMITTED_PAYLOAD: &str = "\n  document.getElementById('script-with-nonce').textContent = 'passed';\n  document.body.classList.add('completed');\n";

const DENIED_PAYLOAD: &str =
    "\n  document.getElementById('script-without-nonce').textContent = 'failed';\n";

/// Page-level knobs.
#[derive(Debug, Clone)]
pub struct DocumentOptions {
    /// `<title>` text.
    pub title: String,
    /// Load the relay in debug mode.
    pub relay_debug: bool,
    /// Send cross-origin isolation headers (needed by the relay for Atomics).
    pub cross_origin_isolation: bool,
    /// Artificial pause before each streamed body chunk.
    pub suspense_delay: Duration,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            title: "nonceshell".to_owned(),
            relay_debug: true,
            cross_origin_isolation: true,
            suspense_delay: Duration::ZERO,
        }
    }
}

/// A full HTML document split into head and body.
#[derive(Debug, Clone)]
pub struct Page {
    /// `<html lang>` value.
    pub lang: String,
    /// Nodes inside `<head>`.
    pub head: Vec<Node>,
    /// Nodes inside `<body>`; each one is streamed as its own chunk.
    pub body: Vec<Node>,
}

impl Page {
    /// Doctype through the opening `<body>` tag.
    pub fn render_shell(&self, scope: &RenderScope) -> String {
        let mut out = String::from("<!DOCTYPE html>");
        Element::new("html")
            .attr("lang", self.lang.clone())
            .render_open(scope, &mut out);
        out.push_str("<head>");
        for node in &self.head {
            node.render(scope, &mut out);
        }
        out.push_str("</head><body>");
        out
    }

    /// Closing tags after the last body chunk.
    pub fn render_tail(&self) -> &'static str {
        "</body></html>"
    }

    /// Render the whole document in one pass.
    pub fn render_to_string(&self, scope: &RenderScope) -> String {
        let mut out = self.render_shell(scope);
        for node in &self.body {
            node.render(scope, &mut out);
        }
        out.push_str(self.render_tail());
        out
    }
}

/// Build the verification page for `path`.
pub fn verification_page(options: &DocumentOptions, path: &str) -> Page {
    let head = vec![
        Node::Relay(RelayBootstrap::new(options.relay_debug)),
        Element::void("meta").attr("charset", "utf-8").into(),
        Element::new("title")
            .child(Node::text(options.title.clone()))
            .into(),
        Element::void("meta")
            .attr("name", "viewport")
            .attr("content", "width=device-width,initial-scale=1")
            .into(),
    ];

    let body = vec![
        Element::new("main")
            .attr("data-path", path)
            .child(Element::new("h1").child(Node::text(options.title.clone())))
            .into(),
        Element::new("p").attr("id", WITH_NONCE_ID).into(),
        Element::new("p")
            .attr("id", WITHOUT_NONCE_ID)
            .child(Node::text("passed"))
            .into(),
        ScriptTag::denied(ScriptKind::Relayed, DENIED_PAYLOAD).into(),
        ScriptTag::permitted(ScriptKind::Relayed, PERMITTED_PAYLOAD).into(),
    ];

    Page {
        lang: "en".to_owned(),
        head,
        body,
    }
}

/// Route-level headers merged into every page response.
pub fn route_headers(options: &DocumentOptions) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if options.cross_origin_isolation {
        headers.insert(
            HeaderName::from_static("cross-origin-embedder-policy"),
            HeaderValue::from_static("require-corp"),
        );
        headers.insert(
            HeaderName::from_static("cross-origin-opener-policy"),
            HeaderValue::from_static("same-origin"),
        );
    }
    headers
}

/// Streams [`verification_page`] one body node at a time.
#[derive(Debug, Clone, Default)]
pub struct DocumentEngine {
    options: DocumentOptions,
}

impl DocumentEngine {
    /// Engine rendering with `options`.
    pub fn new(options: DocumentOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl RenderEngine for DocumentEngine {
    async fn render(
        &self,
        request: &RenderRequest,
        scope: &RenderScope,
        sink: &mut RenderSink,
    ) -> Result<(), RenderError> {
        let page = verification_page(&self.options, request.uri.path());

        sink.push(page.render_shell(scope)).await?;
        sink.shell_ready().await?;

        for (index, node) in page.body.iter().enumerate() {
            if !self.options.suspense_delay.is_zero() {
                tokio::time::sleep(self.options.suspense_delay).await;
            }
            debug!(chunk = index, "streaming body chunk");
            sink.push(render_to_string(node, scope)).await?;
        }

        sink.push(page.render_tail()).await?;
        Ok(())
    }
}
