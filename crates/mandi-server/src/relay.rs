//! Chat relay between the two participants.
//!
//! Every message crosses the relay before it reaches the counterparty: the
//! transform oracle softens the tone and translates between the two working
//! languages. When the oracle fails, a deterministic third-person wrapper is
//! used instead so chat keeps flowing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mandi_common::{Language, Role};
use serde::Serialize;
use tracing::warn;

use crate::oracle::{TransformOracle, TransformedText};

/// A delivered chat message, as stored in the session transcript.
#[derive(Debug, Clone, Serialize)]
pub struct RelayedMessage {
    pub from: Role,
    /// What the sender typed, echoed back only to the sender.
    pub original: String,
    /// What the counterparty sees.
    pub rendered: String,
    pub sentiment: Option<String>,
    pub source_language: Language,
    pub target_language: Language,
    pub at: DateTime<Utc>,
}

/// Deterministic fallback when the transform oracle is unavailable: wrap the
/// raw text in a polite third-person frame, untranslated.
pub fn fallback_transform(text: &str, sender: Role) -> TransformedText {
    TransformedText {
        rendered: format!("The {} says: {}", sender, text.trim()),
        sentiment: None,
    }
}

/// Wraps the transform oracle with the fallback path.
pub struct MessageRelay {
    oracle: Arc<dyn TransformOracle>,
}

impl MessageRelay {
    pub fn new(oracle: Arc<dyn TransformOracle>) -> Self {
        Self { oracle }
    }

    /// Transform a message for delivery. Never fails; falls back to the
    /// wrapper on any oracle error.
    pub async fn relay(
        &self,
        text: &str,
        sender: Role,
        source: Language,
        target: Language,
    ) -> RelayedMessage {
        let transformed = match self.oracle.transform(text, sender, source, target).await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, sender = %sender, "Message transform failed, relaying wrapped original");
                fallback_transform(text, sender)
            }
        };
        RelayedMessage {
            from: sender,
            original: text.to_string(),
            rendered: transformed.rendered,
            sentiment: transformed.sentiment,
            source_language: source,
            target_language: target,
            at: Utc::now(),
        }
    }

    /// Translate a generated narrative into the other party's working
    /// language. Never fails; same language or oracle failure keeps the
    /// original text.
    pub async fn translate_or_original(
        &self,
        text: &str,
        source: Language,
        target: Language,
    ) -> String {
        if source == target {
            return text.to_string();
        }
        match self.oracle.translate(text, source, target).await {
            Ok(translated) => translated,
            Err(e) => {
                warn!(error = %e, "Narrative translation failed, keeping original");
                text.to_string()
            }
        }
    }
}
