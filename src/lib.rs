//! Nonceshell: streaming HTML rendering under a per-request CSP nonce.
//!
//! Each request mints a fresh [`nonce::Nonce`], binds it into a
//! [`scope::RenderScope`] that is passed down the render tree, and commits
//! the `Content-Security-Policy` header from that same scope once the shell
//! is ready. Scripts are either nonce-tagged (permitted) or left untagged
//! (denied by the browser).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod csp;
pub mod nonce;
pub mod scope;

pub mod markup;
pub mod relay;

pub mod controller;
pub mod document;
pub mod engine;

pub mod server;
pub mod verify;
