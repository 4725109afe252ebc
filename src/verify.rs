//! Response checks for the nonce lifecycle.
//!
//! Given committed headers and the streamed body, confirm that the CSP
//! header carries a well-formed nonce, every tagged script carries that
//! exact nonce, and both a tagged and an untagged relayed script are
//! present so that a browser run can tell tagging apart from coincidence.

use std::sync::OnceLock;

use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use regex::Regex;

use crate::csp;
use crate::nonce::NONCE_HEX_LEN;
use crate::relay::RELAY_SCRIPT_TYPE;

/// Placeholder substituted for the nonce by [`mask_nonce`].
pub const NONCE_MASK: &str = "{nonce}";

/// A `<script>` element found in a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInfo {
    /// `nonce` attribute value, if present.
    pub nonce: Option<String>,
    /// `type` attribute value, if present.
    pub script_type: Option<String>,
    /// Raw script text.
    pub payload: String,
}

impl ScriptInfo {
    /// Whether the script is executed through the relay.
    pub fn is_relayed(&self) -> bool {
        self.script_type.as_deref() == Some(RELAY_SCRIPT_TYPE)
    }
}

/// Summary of a response that passed [`check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Nonce taken from the CSP header.
    pub header_nonce: String,
    /// Scripts carrying the nonce.
    pub tagged: usize,
    /// Scripts without a nonce.
    pub untagged: usize,
    /// Relayed scripts carrying the nonce.
    pub relayed_tagged: usize,
    /// Relayed scripts without a nonce.
    pub relayed_untagged: usize,
}

/// Ways a response can violate the nonce lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// No `Content-Type: text/html`.
    #[error("missing or non-HTML content type")]
    ContentType,
    /// No CSP header, or it has no nonce source.
    #[error("missing CSP nonce header")]
    MissingHeader,
    /// Header nonce is not 32 lowercase hex characters.
    #[error("malformed header nonce")]
    MalformedNonce,
    /// A script carries a nonce other than the header's.
    #[error("script #{index} carries a nonce that does not match the header")]
    Mismatch {
        /// Zero-based script position in the body.
        index: usize,
    },
    /// An attribute rendered a missing nonce as text.
    #[error("body contains nonce=\"undefined\"")]
    LiteralUndefined,
    /// No relayed script is tagged.
    #[error("no nonce-tagged relayed script in body")]
    NoTaggedScript,
    /// No relayed script is untagged.
    #[error("no untagged relayed script in body")]
    NoUntaggedScript,
}

fn script_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<script([^>]*)>(.*?)</script>").ok())
        .as_ref()
}

fn nonce_attr_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?:^|\s)nonce="([^"]*)""#).ok())
        .as_ref()
}

fn type_attr_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?:^|\s)type="([^"]*)""#).ok())
        .as_ref()
}

fn capture(re: Option<&Regex>, attrs: &str) -> Option<String> {
    re?.captures(attrs)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}

/// Every `<script>` element in `html`, in document order.
pub fn scripts(html: &str) -> Vec<ScriptInfo> {
    let Some(re) = script_re() else {
        return Vec::new();
    };
    re.captures_iter(html)
        .map(|caps| {
            let attrs = caps.get(1).map_or("", |m| m.as_str());
            ScriptInfo {
                nonce: capture(nonce_attr_re(), attrs),
                script_type: capture(type_attr_re(), attrs),
                payload: caps.get(2).map_or("", |m| m.as_str()).to_owned(),
            }
        })
        .collect()
}

/// Whether `nonce` has the shape the generator produces.
pub fn is_well_formed(nonce: &str) -> bool {
    nonce.len() == NONCE_HEX_LEN
        && nonce
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Replace every occurrence of `nonce` with [`NONCE_MASK`].
pub fn mask_nonce(body: &str, nonce: &str) -> String {
    if nonce.is_empty() {
        return body.to_owned();
    }
    body.replace(nonce, NONCE_MASK)
}

/// Check a committed response against the nonce invariants.
///
/// # Errors
///
/// Returns the first [`VerifyError`] found.
pub fn check(headers: &HeaderMap, body: &str) -> Result<Report, VerifyError> {
    let is_html = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/html"));
    if !is_html {
        return Err(VerifyError::ContentType);
    }

    let header_nonce = headers
        .get(csp::HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .and_then(csp::extract_nonce)
        .ok_or(VerifyError::MissingHeader)?
        .to_owned();
    if !is_well_formed(&header_nonce) {
        return Err(VerifyError::MalformedNonce);
    }
    if body.contains("nonce=\"undefined\"") {
        return Err(VerifyError::LiteralUndefined);
    }

    let mut report = Report {
        header_nonce,
        tagged: 0,
        untagged: 0,
        relayed_tagged: 0,
        relayed_untagged: 0,
    };
    for (index, script) in scripts(body).iter().enumerate() {
        match script.nonce.as_deref() {
            Some(n) if n == report.header_nonce => {
                report.tagged = report.tagged.saturating_add(1);
                if script.is_relayed() {
                    report.relayed_tagged = report.relayed_tagged.saturating_add(1);
                }
            }
            Some(_) => return Err(VerifyError::Mismatch { index }),
            None => {
                report.untagged = report.untagged.saturating_add(1);
                if script.is_relayed() {
                    report.relayed_untagged = report.relayed_untagged.saturating_add(1);
                }
            }
        }
    }

    if report.relayed_tagged == 0 {
        return Err(VerifyError::NoTaggedScript);
    }
    if report.relayed_untagged == 0 {
        return Err(VerifyError::NoUntaggedScript);
    }
    Ok(report)
}
