//! Intent matching ahead of the language model.

use async_trait::async_trait;

use voxbridge_core::config::IntentConfig;

use crate::{IntentOutcome, IntentProvider};

/// Recognizes conversation-ending phrases; everything else passes through.
pub struct FarewellIntent {
    phrases: Vec<String>,
    farewell: String,
}

impl FarewellIntent {
    pub fn new(cfg: &IntentConfig) -> Self {
        Self {
            phrases: cfg
                .exit_phrases
                .iter()
                .map(|p| normalize(p))
                .filter(|p| !p.is_empty())
                .collect(),
            farewell: cfg.farewell.clone(),
        }
    }
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect::<String>()
        .trim()
        .to_lowercase()
}

#[async_trait]
impl IntentProvider for FarewellIntent {
    async fn evaluate(&self, text: &str) -> anyhow::Result<IntentOutcome> {
        let normalized = normalize(text);
        if self.phrases.iter().any(|p| *p == normalized) {
            return Ok(IntentOutcome::Consumed {
                reply: Some(self.farewell.clone()),
                close_after_reply: true,
            });
        }
        Ok(IntentOutcome::Pass)
    }
}

/// Intent matching disabled: every transcript reaches the LLM.
pub struct NoIntent;

#[async_trait]
impl IntentProvider for NoIntent {
    async fn evaluate(&self, _text: &str) -> anyhow::Result<IntentOutcome> {
        Ok(IntentOutcome::Pass)
    }
}
