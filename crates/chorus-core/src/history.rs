//! Context epochs: non-destructive resets of conversation context.
//!
//! A reset records a timestamp; messages strictly before it are left out of
//! the context sent to the model but stay in storage. The previous reset time
//! is kept so the last reset can be undone.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CoreError, Result};
use crate::types::ConversationMessage;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub reset_at: Option<DateTime<Utc>>,
    pub previous_reset_at: Option<DateTime<Utc>>,
}

/// Epochs keyed by (persona, personality).
#[derive(Default)]
pub struct ContextEpochs {
    epochs: Mutex<HashMap<(String, String), Epoch>>,
}

impl ContextEpochs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, persona_id: &str, personality_id: &str) -> Epoch {
        self.epochs
            .lock()
            .get(&(persona_id.to_string(), personality_id.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn reset(&self, persona_id: &str, personality_id: &str, now: DateTime<Utc>) -> Epoch {
        let mut epochs = self.epochs.lock();
        let epoch = epochs
            .entry((persona_id.to_string(), personality_id.to_string()))
            .or_default();
        epoch.previous_reset_at = epoch.reset_at;
        epoch.reset_at = Some(now);
        info!(persona = persona_id, personality = personality_id, %now, "context reset");
        *epoch
    }

    /// Restore the reset before the last one. Only one step is kept.
    pub fn undo(&self, persona_id: &str, personality_id: &str) -> Result<Epoch> {
        let mut epochs = self.epochs.lock();
        let key = (persona_id.to_string(), personality_id.to_string());
        let epoch = match epochs.get_mut(&key) {
            Some(epoch) if epoch.reset_at.is_some() => epoch,
            _ => {
                return Err(CoreError::NotFound(format!(
                    "no context reset to undo for {}/{}",
                    persona_id, personality_id
                )))
            }
        };
        epoch.reset_at = epoch.previous_reset_at.take();
        info!(persona = persona_id, personality = personality_id, "context reset undone");
        Ok(*epoch)
    }
}

/// Messages at or after `reset_at`. `None` keeps everything.
pub fn apply_epoch_filter(
    history: &[ConversationMessage],
    reset_at: Option<DateTime<Utc>>,
) -> Vec<ConversationMessage> {
    match reset_at {
        Some(cut) => history
            .iter()
            .filter(|m| m.created_at >= cut)
            .cloned()
            .collect(),
        None => history.to_vec(),
    }
}

/// Trim context to the configured window: drop messages older than
/// `max_age_secs`, then keep the newest `max_messages`.
pub fn apply_window(
    mut history: Vec<ConversationMessage>,
    max_messages: usize,
    max_age_secs: Option<u64>,
    now: DateTime<Utc>,
) -> Vec<ConversationMessage> {
    let oldest = max_age_secs
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(Duration::try_seconds)
        .and_then(|age| now.checked_sub_signed(age));
    if let Some(oldest) = oldest {
        history.retain(|m| m.created_at >= oldest);
    }
    if history.len() > max_messages {
        history.drain(..history.len() - max_messages);
    }
    history
}
