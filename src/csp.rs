//! Content-Security-Policy header construction.
//!
//! The policy shape is fixed: nonce plus `'strict-dynamic'`, no fallback
//! sources, no plugins, no `<base>` rewriting.

use std::sync::OnceLock;

use regex::Regex;

use crate::nonce::Nonce;

/// Response header carrying the policy.
pub const HEADER_NAME: &str = "content-security-policy";

/// Build the header value for `nonce`. Pure and total.
pub fn build(nonce: &Nonce) -> String {
    format!(
        "script-src 'nonce-{}' 'strict-dynamic'; object-src 'none'; base-uri 'none';",
        nonce.as_str()
    )
}

/// Pull the nonce token out of a `script-src 'nonce-…'` source expression.
///
/// Returns `None` when the header has no nonce source.
pub fn extract_nonce(header: &str) -> Option<&str> {
    static NONCE_SOURCE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = NONCE_SOURCE
        .get_or_init(|| Regex::new(r"script-src[^;]*'nonce-([A-Za-z0-9+/=_-]+)'").ok())
        .as_ref()?;
    re.captures(header)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}
