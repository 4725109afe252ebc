//! Off-main-thread script relay integration.
//!
//! The relay itself is an external library. This module only emits its
//! bootstrap: a config script and a loader script, both tagged with the
//! request nonce, and hands the nonce to the relay config so that scripts
//! it executes later are held to the same policy.

use serde::Serialize;

use crate::markup::{escape_script, push_nonce_attr};
use crate::scope::RenderScope;

/// `type` attribute that routes a script through the relay.
pub const RELAY_SCRIPT_TYPE: &str = "text/partytown";

/// Default public path of the relay library.
pub const DEFAULT_LIB_PATH: &str = "/~partytown/";

const LOADER: &str = "!(function(w,d){var c=w.partytown||{},s=d.createElement(\"script\");\
s.src=c.lib+(c.debug?\"debug/\":\"\")+\"partytown.js\";\
if(c.nonce)s.nonce=c.nonce;d.head.appendChild(s);})(window,document);";

/// Relay config serialized into the page.
#[derive(Debug, Serialize)]
struct RelayConfig<'a> {
    debug: bool,
    lib: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<&'a str>,
}

/// Loader for the relay, rendered in `<head>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayBootstrap {
    debug: bool,
    lib: String,
}

impl Default for RelayBootstrap {
    fn default() -> Self {
        Self::new(false)
    }
}

impl RelayBootstrap {
    /// Bootstrap using the default library path.
    pub fn new(debug: bool) -> Self {
        Self {
            debug,
            lib: DEFAULT_LIB_PATH.to_owned(),
        }
    }

    /// Override the library path.
    pub fn with_lib(mut self, lib: impl Into<String>) -> Self {
        self.lib = lib.into();
        self
    }

    /// Append both bootstrap scripts to `out`.
    pub fn render(&self, scope: &RenderScope, out: &mut String) {
        let config = RelayConfig {
            debug: self.debug,
            lib: &self.lib,
            nonce: scope.read().map(|n| n.as_str()),
        };
        // Serializing a struct of plain strings and bools cannot fail.
        let json = serde_json::to_string(&config).unwrap_or_else(|_| "{}".to_owned());

        out.push_str("<script data-partytown-config");
        push_nonce_attr(out, scope);
        out.push('>');
        out.push_str("partytown = ");
        out.push_str(&escape_script(&json));
        out.push_str(";</script>");

        out.push_str("<script data-partytown");
        push_nonce_attr(out, scope);
        out.push('>');
        out.push_str(LOADER);
        out.push_str("</script>");
    }
}
