//! Configuration loading.
//!
//! Loads `./nonceshell.toml` (or `$NONCESHELL_CONFIG_PATH`). Every section
//! has defaults, so a missing or empty file is valid.
//!
//! Precedence: env vars > config file > defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::controller::{ControllerOptions, DEFAULT_ABORT_AFTER, DEFAULT_CHANNEL_CAPACITY};
use crate::document::DocumentOptions;

/// Env var naming the config file.
pub const CONFIG_PATH_ENV: &str = "NONCESHELL_CONFIG_PATH";

/// Config file used when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "nonceshell.toml";

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NonceshellConfig {
    /// HTTP listener settings.
    pub server: ServerConfig,
    /// Render controller settings.
    pub render: RenderConfig,
    /// Verification page settings.
    pub document: DocumentConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

impl NonceshellConfig {
    /// Load with precedence env vars > file > defaults.
    ///
    /// `path` overrides `$NONCESHELL_CONFIG_PATH`. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path_with(|key| std::env::var(key).ok()),
        };
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config path using a custom env resolver.
    #[doc(hidden)]
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Apply environment overrides through a resolver (avoids `set_var` in tests).
    #[doc(hidden)]
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("NONCESHELL_LISTEN") {
            match v.parse() {
                Ok(addr) => self.server.listen = addr,
                Err(_) => tracing::warn!(
                    var = "NONCESHELL_LISTEN",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("NONCESHELL_ABORT_AFTER_MS") {
            match v.parse() {
                Ok(ms) => self.render.abort_after_ms = ms,
                Err(_) => tracing::warn!(
                    var = "NONCESHELL_ABORT_AFTER_MS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("NONCESHELL_LOG_DIR") {
            self.logging.dir = v;
        }
    }

    /// Parse a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML or mistyped fields.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Controller options derived from `[render]`.
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            abort_after: Duration::from_millis(self.render.abort_after_ms),
            channel_capacity: self.render.channel_capacity,
        }
    }

    /// Page options derived from `[document]` and `[render]`.
    pub fn document_options(&self) -> DocumentOptions {
        DocumentOptions {
            title: self.document.title.clone(),
            relay_debug: self.document.relay_debug,
            cross_origin_isolation: self.document.cross_origin_isolation,
            suspense_delay: Duration::from_millis(self.render.suspense_delay_ms),
        }
    }
}

// ── Server config ───────────────────────────────────────────────

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to bind.
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3000)),
        }
    }
}

// ── Render config ───────────────────────────────────────────────

/// Render controller settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Hard render deadline in milliseconds.
    pub abort_after_ms: u64,
    /// Channel buffer between render task and response body.
    pub channel_capacity: usize,
    /// Pause before each streamed body chunk, in milliseconds.
    pub suspense_delay_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            abort_after_ms: u64::try_from(DEFAULT_ABORT_AFTER.as_millis()).unwrap_or(5_000),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            suspense_delay_ms: 0,
        }
    }
}

// ── Document config ─────────────────────────────────────────────

/// Verification page settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Page title.
    pub title: String,
    /// Send COEP/COOP headers.
    pub cross_origin_isolation: bool,
    /// Load the relay in debug mode.
    pub relay_debug: bool,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        let page = DocumentOptions::default();
        Self {
            title: page.title,
            cross_origin_isolation: page.cross_origin_isolation,
            relay_debug: page.relay_debug,
        }
    }
}

// ── Logging config ──────────────────────────────────────────────

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for JSON log files; empty means console only.
    pub dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: String::new(),
        }
    }
}

impl LoggingConfig {
    /// Log directory, if file logging is enabled.
    pub fn dir(&self) -> Option<&Path> {
        if self.dir.trim().is_empty() {
            None
        } else {
            Some(Path::new(&self.dir))
        }
    }
}
