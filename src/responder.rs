//! Per-envelope reply pipeline.
//!
//! Envelopes arrive strictly sequentially from the subscription stream,
//! so the filter → record → dedup → mention → generate → reply sequence
//! is never interleaved for the same event key.

use std::sync::Arc;

use chrono::Utc;

use crate::config::BotConfig;
use crate::history::{event_key, ChatStore};
use crate::llm::{TextGenerator, FALLBACK_REPLY};
use crate::signal::{Envelope, Outbound, Quote};

/// The object-replacement glyph Signal inserts in place of a mention.
const MENTION_PLACEHOLDER: &str = "\u{fffc} ";

pub struct Responder {
    group_id: String,
    bot_number: String,
    bot_name: String,
    outbound: Arc<dyn Outbound>,
    generator: Arc<dyn TextGenerator>,
}

impl Responder {
    pub fn new(
        config: &BotConfig,
        outbound: Arc<dyn Outbound>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            group_id: config.group_id.clone(),
            bot_number: config.bot_number.clone(),
            bot_name: config.bot_name.clone(),
            outbound,
            generator,
        }
    }

    /// Process one inbound envelope through to reply and persistence.
    /// Every failure inside is downgraded to a log line; the subscription
    /// loop must never die because one message went wrong.
    pub async fn handle_envelope(&self, store: &mut ChatStore, envelope: &Envelope) {
        let Some(data_message) = envelope.data_message.as_ref() else {
            return;
        };
        if envelope.group_id() != Some(self.group_id.as_str()) {
            return;
        }

        let timestamp = envelope.timestamp;
        let sender = envelope.sender_number().unwrap_or("unknown");
        let key = event_key(sender, timestamp);

        let text = data_message
            .message
            .as_deref()
            .unwrap_or("")
            .replace(MENTION_PLACEHOLDER, "")
            .trim()
            .to_string();
        let sender_name = envelope.sender_name().to_string();

        tracing::info!(
            "{}: {}",
            sender_name,
            text.chars().take(80).collect::<String>()
        );

        if !text.is_empty() {
            store.record_turn(&sender_name, &text, timestamp);
        }

        // At most one reply per logical message, even on redelivery.
        if store.has_responded(&key) {
            return;
        }

        if !envelope.mentions_number(&self.bot_number) {
            return;
        }
        tracing::info!("Bot mentioned!");

        let context = store.context_window();
        let reply = match self.generator.generate(&text, &context).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("LLM error: {}", e);
                FALLBACK_REPLY.to_string()
            }
        };

        let quote = envelope
            .sender_number()
            .filter(|_| timestamp != 0)
            .map(|author| Quote {
                timestamp,
                author: author.to_string(),
            });
        if let Err(e) = self
            .outbound
            .send_message(&self.group_id, &reply, quote)
            .await
        {
            tracing::error!("Failed to send reply: {}", e);
        }

        store.record_turn(&self.bot_name, &reply, Utc::now().timestamp_millis());
        store.mark_responded(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ConversationTurn;
    use crate::signal::{DataMessage, GroupInfo, Mention};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const GROUP: &str = "grp1";
    const BOT_NUMBER: &str = "+4915500000000";

    #[derive(Default)]
    struct RecordingOutbound {
        sent: Mutex<Vec<(String, Option<Quote>)>>,
        fail: bool,
    }

    #[async_trait]
    impl Outbound for RecordingOutbound {
        async fn send_message(
            &self,
            _group_id: &str,
            message: &str,
            quote: Option<Quote>,
        ) -> Result<()> {
            if self.fail {
                anyhow::bail!("daemon unreachable");
            }
            self.sent
                .lock()
                .expect("lock")
                .push((message.to_string(), quote));
            Ok(())
        }

        async fn create_poll(
            &self,
            _group_id: &str,
            _question: &str,
            _options: &[String],
        ) -> Result<()> {
            unreachable!("responder never creates polls");
        }
    }

    struct StubGenerator {
        fail: bool,
    }

    #[async_trait]
    impl TextGenerator for StubGenerator {
        async fn generate(&self, message: &str, context: &[ConversationTurn]) -> Result<String> {
            if self.fail {
                anyhow::bail!("model timed out");
            }
            Ok(format!("re[{}] ctx={}", message, context.len()))
        }
    }

    fn envelope(sender: &str, timestamp: i64, text: &str, mention_bot: bool) -> Envelope {
        let mentions = if mention_bot {
            vec![Mention {
                number: Some(BOT_NUMBER.to_string()),
            }]
        } else {
            Vec::new()
        };
        Envelope {
            source: Some(sender.to_string()),
            source_name: Some("Alice".to_string()),
            timestamp,
            data_message: Some(DataMessage {
                message: Some(text.to_string()),
                group_info: Some(GroupInfo {
                    group_id: Some(GROUP.to_string()),
                }),
                mentions,
            }),
            ..Default::default()
        }
    }

    fn fixture(
        fail_outbound: bool,
        fail_generator: bool,
    ) -> (Responder, Arc<RecordingOutbound>) {
        let config = BotConfig {
            group_id: GROUP.to_string(),
            bot_number: BOT_NUMBER.to_string(),
            ..Default::default()
        };
        let outbound = Arc::new(RecordingOutbound {
            fail: fail_outbound,
            ..Default::default()
        });
        let responder = Responder::new(
            &config,
            outbound.clone(),
            Arc::new(StubGenerator {
                fail: fail_generator,
            }),
        );
        (responder, outbound)
    }

    fn store() -> (tempfile::TempDir, ChatStore) {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = ChatStore::new(dir.path().join("history.json"), 15);
        (dir, store)
    }

    #[tokio::test]
    async fn redelivered_envelope_gets_exactly_one_reply() {
        let (responder, outbound) = fixture(false, false);
        let (_dir, mut chat) = store();
        let envelope = envelope("+49176111", 1_709_290_000_123, "hey @Marvin", true);

        responder.handle_envelope(&mut chat, &envelope).await;
        responder.handle_envelope(&mut chat, &envelope).await;

        assert_eq!(outbound.sent.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn other_groups_are_ignored_entirely() {
        let (responder, outbound) = fixture(false, false);
        let (_dir, mut chat) = store();
        let mut envelope = envelope("+49176111", 1, "hallo", true);
        envelope
            .data_message
            .as_mut()
            .expect("data message")
            .group_info = Some(GroupInfo {
            group_id: Some("other".to_string()),
        });

        responder.handle_envelope(&mut chat, &envelope).await;

        assert!(outbound.sent.lock().expect("lock").is_empty());
        assert!(chat.is_empty());
    }

    #[tokio::test]
    async fn unmentioned_messages_are_recorded_but_not_answered() {
        let (responder, outbound) = fixture(false, false);
        let (_dir, mut chat) = store();

        responder
            .handle_envelope(&mut chat, &envelope("+49176111", 1, "nur geplauder", false))
            .await;

        assert!(outbound.sent.lock().expect("lock").is_empty());
        assert_eq!(chat.len(), 1);
    }

    #[tokio::test]
    async fn empty_text_mention_still_replies_without_recording_inbound_turn() {
        let (responder, outbound) = fixture(false, false);
        let (_dir, mut chat) = store();

        responder
            .handle_envelope(&mut chat, &envelope("+49176111", 5, "", true))
            .await;

        let sent = outbound.sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "re[] ctx=0");
        // Only the bot's own turn landed in the window.
        assert_eq!(chat.len(), 1);
        let bot_turn = chat.turns().next().expect("bot turn");
        assert_eq!(bot_turn.sender, "Marvin");
    }

    #[tokio::test]
    async fn generator_failure_sends_fallback_and_still_marks_responded() {
        let (responder, outbound) = fixture(false, true);
        let (_dir, mut chat) = store();
        let envelope = envelope("+49176111", 7, "alles gut @Marvin?", true);

        responder.handle_envelope(&mut chat, &envelope).await;

        let sent = outbound.sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, FALLBACK_REPLY);
        assert!(chat.has_responded(&event_key("+49176111", 7)));
        assert!(chat.turns().any(|t| t.content == FALLBACK_REPLY));
    }

    #[tokio::test]
    async fn mention_placeholder_is_stripped_before_recording() {
        let (responder, _outbound) = fixture(false, false);
        let (_dir, mut chat) = store();

        responder
            .handle_envelope(
                &mut chat,
                &envelope("+49176111", 9, "\u{fffc} wann spielen wir?", true),
            )
            .await;

        let inbound = chat.turns().next().expect("inbound turn");
        assert_eq!(inbound.content, "wann spielen wir?");
    }

    #[tokio::test]
    async fn reply_quotes_the_original_message() {
        let (responder, outbound) = fixture(false, false);
        let (_dir, mut chat) = store();

        responder
            .handle_envelope(&mut chat, &envelope("+49176111", 1_709_290_000_123, "@Marvin?", true))
            .await;

        let sent = outbound.sent.lock().expect("lock");
        let quote = sent[0].1.as_ref().expect("quote");
        assert_eq!(quote.timestamp, 1_709_290_000_123);
        assert_eq!(quote.author, "+49176111");
    }

    #[tokio::test]
    async fn context_excludes_the_message_being_answered() {
        let (responder, outbound) = fixture(false, false);
        let (_dir, mut chat) = store();

        responder
            .handle_envelope(&mut chat, &envelope("+49176111", 1, "erste nachricht", false))
            .await;
        responder
            .handle_envelope(&mut chat, &envelope("+49176222", 2, "zweite @Marvin", true))
            .await;

        let sent = outbound.sent.lock().expect("lock");
        // One prior turn in context; the triggering message is excluded.
        assert_eq!(sent[0].0, "re[zweite @Marvin] ctx=1");
    }

    #[tokio::test]
    async fn send_failure_still_records_turn_and_marks_responded() {
        let (responder, _outbound) = fixture(true, false);
        let (_dir, mut chat) = store();
        let envelope = envelope("+49176111", 11, "@Marvin da?", true);

        responder.handle_envelope(&mut chat, &envelope).await;

        assert!(chat.has_responded(&event_key("+49176111", 11)));
    }

    #[tokio::test]
    async fn envelope_without_data_message_is_skipped() {
        let (responder, outbound) = fixture(false, false);
        let (_dir, mut chat) = store();
        let envelope = Envelope {
            source: Some("+49176111".to_string()),
            timestamp: 13,
            ..Default::default()
        };

        responder.handle_envelope(&mut chat, &envelope).await;

        assert!(outbound.sent.lock().expect("lock").is_empty());
        assert!(chat.is_empty());
    }
}
