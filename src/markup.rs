//! Render tree nodes and script classification.
//!
//! Every node renders against a borrowed [`RenderScope`]. Scripts carry a
//! [`ScriptPolicy`]: permitted scripts are tagged with the scope's nonce,
//! denied scripts never are. When the scope has no nonce the attribute is
//! omitted entirely.

use std::fmt::Write as _;

use crate::relay::RelayBootstrap;
use crate::scope::RenderScope;

/// Whether a script must be allowed to execute under the CSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPolicy {
    /// Tagged with the request nonce; the browser runs it.
    Permitted,
    /// Left untagged; the browser is expected to block it.
    Denied,
}

/// How a script is executed by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// Regular inline `<script>`.
    Inline,
    /// Handed to the off-main-thread relay (`type="text/partytown"`).
    Relayed,
}

impl ScriptKind {
    fn type_attr(self) -> Option<&'static str> {
        match self {
            Self::Inline => None,
            Self::Relayed => Some(crate::relay::RELAY_SCRIPT_TYPE),
        }
    }
}

/// An inline script in the render tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTag {
    /// Execution channel.
    pub kind: ScriptKind,
    /// Nonce tagging decision.
    pub policy: ScriptPolicy,
    /// Script source text.
    pub payload: String,
}

impl ScriptTag {
    /// Nonce-tagged script.
    pub fn permitted(kind: ScriptKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            policy: ScriptPolicy::Permitted,
            payload: payload.into(),
        }
    }

    /// Untagged script.
    pub fn denied(kind: ScriptKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            policy: ScriptPolicy::Denied,
            payload: payload.into(),
        }
    }

    fn render(&self, scope: &RenderScope, out: &mut String) {
        out.push_str("<script");
        if let Some(ty) = self.kind.type_attr() {
            push_attr(out, "type", ty);
        }
        if self.policy == ScriptPolicy::Permitted {
            push_nonce_attr(out, scope);
        }
        out.push('>');
        out.push_str(&escape_script(&self.payload));
        out.push_str("</script>");
    }
}

/// Attribute value, either literal or read from the scope at render time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// Fixed string value.
    Text(String),
    /// The scope's nonce; the attribute is dropped when none is bound.
    Nonce,
}

/// HTML element with attributes and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    tag: String,
    attrs: Vec<(String, AttrValue)>,
    children: Vec<Node>,
    void: bool,
}

impl Element {
    /// Element with a closing tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            children: Vec::new(),
            void: false,
        }
    }

    /// Element without children or closing tag (`<meta>`, `<link>`).
    pub fn void(tag: impl Into<String>) -> Self {
        Self {
            void: true,
            ..Self::new(tag)
        }
    }

    /// Add a literal attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), AttrValue::Text(value.into())));
        self
    }

    /// Add a `nonce` attribute bound to the render scope.
    pub fn nonce_attr(mut self) -> Self {
        self.attrs.push(("nonce".to_owned(), AttrValue::Nonce));
        self
    }

    /// Append a child node.
    pub fn child(mut self, node: impl Into<Node>) -> Self {
        self.children.push(node.into());
        self
    }

    /// Write only the opening tag.
    pub fn render_open(&self, scope: &RenderScope, out: &mut String) {
        out.push('<');
        out.push_str(&self.tag);
        for (name, value) in &self.attrs {
            match value {
                AttrValue::Text(v) => push_attr(out, name, v),
                AttrValue::Nonce => push_nonce_attr(out, scope),
            }
        }
        out.push('>');
    }

    /// Write only the closing tag. No-op for void elements.
    pub fn render_close(&self, out: &mut String) {
        if !self.void {
            let _ = write!(out, "</{}>", self.tag);
        }
    }

    fn render(&self, scope: &RenderScope, out: &mut String) {
        self.render_open(scope, out);
        if self.void {
            return;
        }
        for child in &self.children {
            child.render(scope, out);
        }
        self.render_close(out);
    }
}

/// A node of the render tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Element with children.
    Element(Element),
    /// Escaped text content.
    Text(String),
    /// Inline or relayed script.
    Script(ScriptTag),
    /// Off-main-thread relay loader.
    Relay(RelayBootstrap),
}

impl Node {
    /// Text node.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Append this node's markup to `out`.
    pub fn render(&self, scope: &RenderScope, out: &mut String) {
        match self {
            Self::Element(el) => el.render(scope, out),
            Self::Text(t) => out.push_str(&escape_text(t)),
            Self::Script(script) => script.render(scope, out),
            Self::Relay(relay) => relay.render(scope, out),
        }
    }
}

impl From<Element> for Node {
    fn from(el: Element) -> Self {
        Self::Element(el)
    }
}

impl From<ScriptTag> for Node {
    fn from(script: ScriptTag) -> Self {
        Self::Script(script)
    }
}

impl From<RelayBootstrap> for Node {
    fn from(relay: RelayBootstrap) -> Self {
        Self::Relay(relay)
    }
}

/// Render a node to a fresh string.
pub fn render_to_string(node: &Node, scope: &RenderScope) -> String {
    let mut out = String::new();
    node.render(scope, &mut out);
    out
}

pub(crate) fn push_attr(out: &mut String, name: &str, value: &str) {
    let _ = write!(out, " {}=\"{}\"", name, escape_attr(value));
}

pub(crate) fn push_nonce_attr(out: &mut String, scope: &RenderScope) {
    if let Some(nonce) = scope.read() {
        push_attr(out, "nonce", nonce.as_str());
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}

/// Keep a payload from closing its own `<script>` element early.
pub(crate) fn escape_script(s: &str) -> String {
    s.replace("</", "<\\/")
}
