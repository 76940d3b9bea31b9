//! Enrichment coordinator: every operation is timeout-bounded, retried
//! on transient backend states, and degrades to a rule-based fallback.
//! Nothing here returns an error to the caller.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use parley_core::errors::EnrichError;
use parley_core::protocol::{Enrichment, Sentiment};

use crate::backend::EnrichmentBackend;
use crate::fallback;
use crate::retry::{RetryPolicy, RetryingBackend};

pub const SENTIMENT_MODEL: &str = "cardiffnlp/twitter-roberta-base-sentiment-latest";
pub const SUMMARY_MODEL: &str = "facebook/bart-large-cnn";
pub const REPLY_MODEL: &str = "microsoft/DialoGPT-medium";

/// Result for a summary request that doesn't meet the minimum-input bar.
pub const NOT_ENOUGH_CONTENT: &str = "Conversation too short to summarize";

pub const SUMMARY_MIN_MESSAGES: usize = 3;
pub const SUMMARY_MIN_WORDS: usize = 20;
pub const SUMMARY_WINDOW: usize = 20;
pub const REPLY_CONTEXT: usize = 3;
pub const MAX_REPLIES: usize = 3;

/// Per-language translation models. Unsupported targets are returned
/// unchanged without a backend call.
fn translation_model(target: &str) -> Option<&'static str> {
    match target {
        "es" => Some("Helsinki-NLP/opus-mt-en-es"),
        "fr" => Some("Helsinki-NLP/opus-mt-en-fr"),
        "de" => Some("Helsinki-NLP/opus-mt-en-de"),
        "it" => Some("Helsinki-NLP/opus-mt-en-it"),
        "pt" => Some("Helsinki-NLP/opus-mt-en-pt"),
        _ => None,
    }
}

/// A message as seen by context-dependent operations (summary, replies).
#[derive(Clone, Debug)]
pub struct ContextMessage {
    pub sender: String,
    pub body: String,
}

#[derive(Clone, Debug)]
pub struct EnrichConfig {
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct EnrichmentService {
    backend: RetryingBackend<Arc<dyn EnrichmentBackend>>,
    request_timeout: Duration,
}

impl EnrichmentService {
    pub fn new(backend: Arc<dyn EnrichmentBackend>, config: EnrichConfig) -> Self {
        Self {
            backend: RetryingBackend::new(backend, config.retry),
            request_timeout: config.request_timeout,
        }
    }

    /// One backend call bounded by the hard per-operation timeout.
    /// The timeout covers retries — an operation can never outlive it.
    async fn call(
        &self,
        model: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, EnrichError> {
        match tokio::time::timeout(self.request_timeout, self.backend.infer(model, &payload)).await
        {
            Ok(result) => result,
            Err(_) => Err(EnrichError::Timeout(self.request_timeout)),
        }
    }

    #[instrument(skip(self, text))]
    pub async fn analyze_sentiment(&self, text: &str) -> Sentiment {
        let payload = serde_json::json!({ "inputs": text });
        match self.call(SENTIMENT_MODEL, payload).await {
            Ok(value) => parse_sentiment(&value).unwrap_or_else(|| {
                debug!("unusable sentiment response, using lexicon fallback");
                fallback::sentiment(text)
            }),
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "sentiment backend failed, using lexicon fallback");
                fallback::sentiment(text)
            }
        }
    }

    /// Language detection is rule-based and local; no backend call.
    pub fn detect_language(&self, text: &str) -> String {
        fallback::detect_language(text)
    }

    /// Sentiment + language for a single message body.
    pub async fn enrich_message(&self, text: &str) -> Enrichment {
        Enrichment {
            sentiment: self.analyze_sentiment(text).await,
            language: self.detect_language(text),
        }
    }

    #[instrument(skip(self, text))]
    pub async fn translate(&self, text: &str, target_language: &str) -> String {
        let Some(model) = translation_model(target_language) else {
            debug!(target_language, "unsupported translation target");
            return text.to_string();
        };

        let payload = serde_json::json!({
            "inputs": text,
            "options": { "wait_for_model": true },
        });

        match self.call(model, payload).await {
            Ok(value) => match parse_translation(&value) {
                Some(translated) => translated,
                None => {
                    debug!("unusable translation response, returning original");
                    text.to_string()
                }
            },
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "translation backend failed, returning original");
                text.to_string()
            }
        }
    }

    /// Summarize the tail of a conversation. Below the minimum-input bar
    /// this returns the explicit not-enough-content result without a
    /// backend call.
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    pub async fn summarize(&self, messages: &[ContextMessage]) -> String {
        let window_start = messages.len().saturating_sub(SUMMARY_WINDOW);
        let window: Vec<&ContextMessage> = messages[window_start..]
            .iter()
            .filter(|m| !m.body.trim().is_empty())
            .collect();

        if window.len() < SUMMARY_MIN_MESSAGES {
            return NOT_ENOUGH_CONTENT.to_string();
        }

        let transcript = window
            .iter()
            .map(|m| format!("{}: {}", m.sender, m.body))
            .collect::<Vec<_>>()
            .join(" ");

        if transcript.split_whitespace().count() < SUMMARY_MIN_WORDS {
            return NOT_ENOUGH_CONTENT.to_string();
        }

        let payload = serde_json::json!({
            "inputs": transcript,
            "parameters": { "max_length": 100, "min_length": 30 },
        });

        match self.call(SUMMARY_MODEL, payload).await {
            Ok(value) => match parse_summary(&value) {
                Some(summary) => summary,
                None => {
                    debug!("unusable summary response, using extractive fallback");
                    fallback::extractive_summary(&transcript)
                }
            },
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "summary backend failed, using extractive fallback");
                fallback::extractive_summary(&transcript)
            }
        }
    }

    /// Up to three reply suggestions for the conversation so far.
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    pub async fn suggest_replies(&self, messages: &[ContextMessage]) -> Vec<String> {
        let context_start = messages.len().saturating_sub(REPLY_CONTEXT);
        let context = messages[context_start..]
            .iter()
            .map(|m| m.body.as_str())
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string();

        if context.is_empty() {
            return fallback::opener_replies();
        }

        let payload = serde_json::json!({
            "inputs": context,
            "parameters": {
                "num_return_sequences": MAX_REPLIES,
                "top_k": 50,
                "top_p": 0.95,
                "do_sample": true,
            },
        });

        let candidates = match self.call(REPLY_MODEL, payload).await {
            Ok(value) => parse_replies(&value),
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "reply backend failed, using canned replies");
                return fallback::ack_replies();
            }
        };

        let kept = fallback::filter_replies(candidates, &context, MAX_REPLIES);
        if kept.is_empty() {
            fallback::ack_replies()
        } else {
            kept
        }
    }
}

/// Hosted sentiment models answer `[{label, score}]`, sometimes nested
/// one level deeper. Labels like "LABEL_2" are normalized.
fn parse_sentiment(value: &serde_json::Value) -> Option<Sentiment> {
    let mut first = value.get(0)?;
    if first.is_array() {
        first = first.get(0)?;
    }
    let label = first.get("label")?.as_str()?;
    let confidence = first.get("score")?.as_f64()?;
    let label = label.to_lowercase().replace("label_", "");
    if label.is_empty() {
        return None;
    }
    Some(Sentiment { label, confidence })
}

fn parse_translation(value: &serde_json::Value) -> Option<String> {
    let first = if value.is_array() { value.get(0)? } else { value };
    let text = first
        .get("translation_text")
        .or_else(|| first.get("generated_text"))?
        .as_str()?
        .trim();
    if text.is_empty() {
        return None;
    }
    Some(text.to_string())
}

fn parse_summary(value: &serde_json::Value) -> Option<String> {
    let text = value.get(0)?.get("summary_text")?.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.to_string())
}

fn parse_replies(value: &serde_json::Value) -> Vec<String> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            item.get("generated_text")
                .and_then(|t| t.as_str())
                .or_else(|| item.as_str())
                .map(str::to_string)
        })
        .collect()
}
