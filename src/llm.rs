//! OpenAI-compatible chat completion client.
//!
//! The reply pipeline never aborts on generation failure: callers catch
//! the error and substitute [`FALLBACK_REPLY`].

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BotConfig;
use crate::history::ConversationTurn;

/// Fixed utterance sent when the LLM call fails in any way.
pub const FALLBACK_REPLY: &str = "Hier stehe ich, mit einem Gehirn von der Größe eines Planeten, \
     und ich kann nicht einmal eine Antwort generieren. Die Sinnlosigkeit ist überwältigend.";

const LLM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// Text generation seam. Production uses [`LlmClient`]; tests use
/// failing or canned stubs.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a reply to `user_message` given the rolling context
    /// window (oldest first).
    async fn generate(&self, user_message: &str, context: &[ConversationTurn]) -> Result<String>;
}

#[derive(Clone)]
pub struct LlmClient {
    url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            url: config.llm_url.clone(),
            api_key: config.llm_api_key.clone(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: reqwest::Client::builder()
                .timeout(LLM_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Flatten the context window into the prompt preamble.
    fn build_prompt(user_message: &str, context: &[ConversationTurn]) -> String {
        let mut prompt = String::new();
        if !context.is_empty() {
            prompt.push_str("Letzte Nachrichten im Chat:\n");
            for turn in context {
                prompt.push_str(&format!(
                    "[{}] {}: {}\n",
                    turn.timestamp, turn.sender, turn.content
                ));
            }
            prompt.push_str("\n---\n");
        }
        prompt.push_str(&format!("Darauf sollst du jetzt antworten: {}", user_message));
        prompt
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, user_message: &str, context: &[ConversationTurn]) -> Result<String> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: Self::build_prompt(user_message, context),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut req = self.client.post(&self.url).json(&request);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .context("No response from LLM")?;

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(sender: &str, content: &str, timestamp: &str) -> ConversationTurn {
        ConversationTurn {
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: timestamp.to_string(),
        }
    }

    #[test]
    fn prompt_without_context_is_just_the_question() {
        let prompt = LlmClient::build_prompt("Wie geht's?", &[]);
        assert_eq!(prompt, "Darauf sollst du jetzt antworten: Wie geht's?");
    }

    #[test]
    fn prompt_with_context_lists_turns_in_order() {
        let context = vec![
            turn("Alice", "Wer hat Lust auf Kicker?", "12:01"),
            turn("Bob", "Ich!", "12:02"),
        ];
        let prompt = LlmClient::build_prompt("Und du?", &context);
        assert!(prompt.starts_with("Letzte Nachrichten im Chat:\n"));
        assert!(prompt.contains("[12:01] Alice: Wer hat Lust auf Kicker?\n"));
        assert!(prompt.contains("[12:02] Bob: Ich!\n"));
        assert!(prompt.contains("\n---\n"));
        assert!(prompt.ends_with("Darauf sollst du jetzt antworten: Und du?"));
        let alice = prompt.find("Alice").expect("Alice in prompt");
        let bob = prompt.find("Bob").expect("Bob in prompt");
        assert!(alice < bob);
    }
}
