//! Render scope: the request-owned binding that makes the nonce readable
//! from every node of one render.
//!
//! The scope is an ordinary value passed by reference down the render tree.
//! Nothing here is process-global, so concurrent renders cannot observe each
//! other's nonce. A scope created with [`RenderScope::unbound`] models the
//! window before a nonce is installed; reads there return `None`.

use crate::nonce::Nonce;

/// Nonce binding for a single render execution.
#[derive(Debug, Clone, Default)]
pub struct RenderScope {
    nonce: Option<Nonce>,
}

impl RenderScope {
    /// Scope with no nonce installed.
    pub fn unbound() -> Self {
        Self { nonce: None }
    }

    /// Scope owning `nonce` for the lifetime of one render.
    pub fn bound(nonce: Nonce) -> Self {
        Self { nonce: Some(nonce) }
    }

    /// Run `render` with `nonce` visible to every nested [`read`](Self::read).
    ///
    /// The scope is dropped when `render` returns, so the binding cannot
    /// outlive the render it was created for.
    pub fn bind<R>(nonce: Nonce, render: impl FnOnce(&RenderScope) -> R) -> R {
        let scope = Self::bound(nonce);
        render(&scope)
    }

    /// Current nonce, or `None` outside an installed binding.
    pub fn read(&self) -> Option<&Nonce> {
        self.nonce.as_ref()
    }

    /// Whether a nonce is installed.
    pub fn is_bound(&self) -> bool {
        self.nonce.is_some()
    }
}
