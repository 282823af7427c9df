//! Bounded summaries of message bodies.
//!
//! A [`Summarizer`] optionally delegates to an external text-generation
//! backend. The call runs on a worker thread and is abandoned after the
//! configured timeout; any failure falls back to a prefix of the body, so
//! summarization never fails the message.

pub mod backend;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SummarizerConfig;
use crate::error::{RegistryError, Result};

pub use backend::HttpBackend;

/// Something that turns a prompt into generated text.
pub trait SummaryBackend: Send + Sync {
    /// Generate text for `prompt`. Implementations should honor `timeout`
    /// themselves; the summarizer enforces it regardless.
    fn generate(&self, prompt: &str, timeout: Duration) -> Result<String>;
}

impl<F> SummaryBackend for F
where
    F: Fn(&str, Duration) -> Result<String> + Send + Sync,
{
    fn generate(&self, prompt: &str, timeout: Duration) -> Result<String> {
        self(prompt, timeout)
    }
}

/// Length and time bounds applied to every summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryLimits {
    /// Maximum summary length in characters.
    pub max_summary_chars: usize,
    /// Body characters included in the prompt.
    pub max_input_chars: usize,
    /// Upper bound on a single backend call.
    pub timeout: Duration,
}

impl Default for SummaryLimits {
    fn default() -> Self {
        Self {
            max_summary_chars: 200,
            max_input_chars: 10_000,
            timeout: Duration::from_secs(20),
        }
    }
}

impl From<&SummarizerConfig> for SummaryLimits {
    fn from(cfg: &SummarizerConfig) -> Self {
        Self {
            max_summary_chars: cfg.max_summary_chars,
            max_input_chars: cfg.max_input_chars,
            timeout: cfg.timeout(),
        }
    }
}

/// Produces the `summary` field of ingested records.
#[derive(Clone)]
pub struct Summarizer {
    backend: Option<Arc<dyn SummaryBackend>>,
    limits: SummaryLimits,
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer")
            .field("backend", &self.backend.is_some())
            .field("limits", &self.limits)
            .finish()
    }
}

impl Summarizer {
    /// Summarizer that only truncates.
    pub fn truncating(limits: SummaryLimits) -> Self {
        Self {
            backend: None,
            limits,
        }
    }

    pub fn with_backend(backend: Arc<dyn SummaryBackend>, limits: SummaryLimits) -> Self {
        Self {
            backend: Some(backend),
            limits,
        }
    }

    /// Build from configuration: an HTTP backend when enabled, truncation otherwise.
    pub fn from_config(cfg: &SummarizerConfig) -> Self {
        let limits = SummaryLimits::from(cfg);
        if cfg.enabled {
            Self::with_backend(Arc::new(HttpBackend::from_config(cfg)), limits)
        } else {
            Self::truncating(limits)
        }
    }

    pub fn limits(&self) -> SummaryLimits {
        self.limits
    }

    /// Summarize `body`, using `subject` when the body is blank.
    ///
    /// The result never exceeds `max_summary_chars` characters.
    pub fn summarize(&self, body: &str, subject: &str) -> String {
        let max = self.limits.max_summary_chars;

        if body.trim().is_empty() {
            return truncate_chars(subject, max).to_string();
        }

        // Leading blank lines would otherwise fill the whole summary
        let body = body.trim_start();

        let Some(backend) = &self.backend else {
            return truncate_chars(body, max).to_string();
        };

        let prompt = build_prompt(truncate_chars(body, self.limits.max_input_chars));
        match self.generate_bounded(Arc::clone(backend), prompt) {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    warn!("Summarizer returned empty text, using body prefix");
                    truncate_chars(body, max).to_string()
                } else {
                    debug!(chars = text.chars().count(), "Generated summary");
                    truncate_chars(text, max).to_string()
                }
            }
            Err(e) => {
                warn!(error = %e, "Summarization failed, using body prefix");
                truncate_chars(body, max).to_string()
            }
        }
    }

    /// Run the backend on a worker thread and wait at most `timeout`.
    ///
    /// A timed-out worker is detached; its late result is dropped.
    fn generate_bounded(&self, backend: Arc<dyn SummaryBackend>, prompt: String) -> Result<String> {
        let timeout = self.limits.timeout;
        let (tx, rx) = mpsc::channel();

        std::thread::Builder::new()
            .name("summarizer".into())
            .spawn(move || {
                // Receiver is gone after a timeout
                let _ = tx.send(backend.generate(&prompt, timeout));
            })
            .map_err(|e| RegistryError::Summarization(format!("cannot spawn worker: {e}")))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(RegistryError::Timeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(RegistryError::Summarization(
                "backend worker exited without a result".into(),
            )),
        }
    }
}

fn build_prompt(body: &str) -> String {
    format!(
        "Summarize the following letter in one or two sentences. \
         Reply with the summary only, in the language of the letter.\n\n{body}"
    )
}

/// First `max` characters of `s` (not bytes).
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
